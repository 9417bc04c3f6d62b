//! Settings type definitions.
//!
//! Field names are camelCase in the JSON file. Every section is
//! `#[serde(default)]`, so a partial file only overrides what it names.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParleySettings {
    pub server: ServerSettings,
    pub history: HistorySettings,
    pub client: ClientSettings,
    pub logging: LoggingSettings,
}

impl ParleySettings {
    /// Reject combinations the runtime cannot honour.
    pub fn validate(&self) -> Result<()> {
        let h = &self.history;
        if h.max_entries == 0 || h.recent_window == 0 {
            return Err(SettingsError::InvalidValue(
                "history limits must be greater than zero".into(),
            ));
        }
        if h.recent_window > h.max_entries {
            return Err(SettingsError::InvalidValue(format!(
                "history.recentWindow ({}) exceeds history.maxEntries ({})",
                h.recent_window, h.max_entries
            )));
        }
        let srv = &self.server;
        for (name, secs) in [
            ("server.heartbeatIntervalSecs", srv.heartbeat_interval_secs),
            ("server.clientTimeoutSecs", srv.client_timeout_secs),
            ("server.cleanupIntervalSecs", srv.cleanup_interval_secs),
        ] {
            if secs == 0 {
                return Err(SettingsError::InvalidValue(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        if self.client.transport_attempts == 0 {
            return Err(SettingsError::InvalidValue(
                "client.transportAttempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Coordinating server settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub database_path: PathBuf,
    /// Outbound frames buffered per connection before new ones are dropped.
    pub max_send_queue: usize,
    /// Inbound events buffered per connection while one is being processed.
    pub inbound_queue: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
    /// Allowed browser origin. `None` allows any origin.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cors_origin: Option<String>,
}

impl ServerSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 5000,
            database_path: crate::loader::parley_home()
                .join("database")
                .join("parley.db"),
            max_send_queue: 256,
            inbound_queue: 64,
            heartbeat_interval_secs: 30,
            client_timeout_secs: 90,
            cleanup_interval_secs: 60,
            cors_origin: None,
        }
    }
}

/// Bounds on the per-conversation log.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HistorySettings {
    /// Entries kept per conversation after every append.
    pub max_entries: usize,
    /// Entries returned when a conversation is opened.
    pub recent_window: usize,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            max_entries: 100,
            recent_window: 50,
        }
    }
}

/// Client connection lifecycle settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    pub server_url: String,
    /// Outer fallback delay once the transport gives up.
    pub reconnect_delay_ms: u64,
    /// Short-interval attempts made by the transport before the fallback.
    pub transport_attempts: u32,
    pub transport_retry_ms: u64,
    pub typing_timeout_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:5000/ws".into(),
            reconnect_delay_ms: 5_000,
            transport_attempts: 5,
            transport_retry_ms: 1_000,
            typing_timeout_ms: 1_000,
        }
    }
}

/// Logging settings. `RUST_LOG` still wins when set.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    pub persist_warnings: bool,
    pub database_path: PathBuf,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: true,
            persist_warnings: true,
            database_path: crate::loader::parley_home()
                .join("database")
                .join("parley-logs.db"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let s = ParleySettings::default();
        assert_eq!(s.history.max_entries, 100);
        assert_eq!(s.history.recent_window, 50);
        assert_eq!(s.client.reconnect_delay_ms, 5_000);
        assert_eq!(s.client.typing_timeout_ms, 1_000);
        assert_eq!(s.server.port, 5000);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: ParleySettings =
            serde_json::from_str(r#"{"server": {"port": 6000}, "history": {"recentWindow": 20}}"#).unwrap();
        assert_eq!(s.server.port, 6000);
        assert_eq!(s.server.host, "0.0.0.0");
        assert_eq!(s.history.recent_window, 20);
        assert_eq!(s.history.max_entries, 100);
    }

    #[test]
    fn validate_rejects_window_larger_than_log() {
        let mut s = ParleySettings::default();
        s.history.recent_window = 150;
        assert!(matches!(s.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn validate_rejects_zero_limits() {
        let mut s = ParleySettings::default();
        s.history.max_entries = 0;
        assert!(s.validate().is_err());

        let mut s = ParleySettings::default();
        s.client.transport_attempts = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_server_intervals() {
        let mut s = ParleySettings::default();
        s.server.heartbeat_interval_secs = 0;
        match s.validate() {
            Err(SettingsError::InvalidValue(msg)) => assert!(msg.contains("heartbeatIntervalSecs")),
            other => panic!("expected InvalidValue, got {other:?}"),
        }

        let mut s = ParleySettings::default();
        s.server.cleanup_interval_secs = 0;
        assert!(matches!(s.validate(), Err(SettingsError::InvalidValue(_))));

        let mut s = ParleySettings::default();
        s.server.client_timeout_secs = 0;
        assert!(matches!(s.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(ParleySettings::default()).unwrap();
        assert!(json["server"]["maxSendQueue"].is_number());
        assert!(json["client"]["reconnectDelayMs"].is_number());
        assert!(json["server"].get("corsOrigin").is_none());
    }
}
