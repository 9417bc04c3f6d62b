//! Persistent warning log.
//!
//! [`SqliteLogLayer`] copies WARN and ERROR events into a `logs` table,
//! keyed by the fields that tie a line to a connection, a user or a
//! conversation. [`SqliteLogSink::recent`] reads them back for `parley logs`.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params_from_iter, Connection, Row};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{span, Level};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Least severe level that is persisted.
const PERSIST_AT: Level = Level::WARN;

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    CREATE TABLE IF NOT EXISTS logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        level TEXT NOT NULL,
        target TEXT NOT NULL,
        message TEXT NOT NULL,
        fields TEXT,
        connection_id TEXT,
        username TEXT,
        conversation_id TEXT,
        target_user TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_logs_username ON logs(username);
    CREATE INDEX IF NOT EXISTS idx_logs_connection ON logs(connection_id);
    CREATE INDEX IF NOT EXISTS idx_logs_conversation ON logs(conversation_id);
";

/// Fields that tie a log line to a connection, a user or a conversation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correlation {
    pub connection_id: Option<String>,
    pub username: Option<String>,
    pub conversation_id: Option<String>,
    pub target_user: Option<String>,
}

impl Correlation {
    const FIELDS: [&'static str; 4] = ["connection_id", "username", "conversation_id", "target_user"];

    fn set(&mut self, name: &str, value: String) {
        let slot = match name {
            "connection_id" => &mut self.connection_id,
            "username" => &mut self.username,
            "conversation_id" => &mut self.conversation_id,
            "target_user" => &mut self.target_user,
            _ => return,
        };
        *slot = Some(value);
    }

    /// Take every field this record lacks from `outer`.
    fn inherit(&mut self, outer: &Correlation) {
        for (mine, theirs) in [
            (&mut self.connection_id, &outer.connection_id),
            (&mut self.username, &outer.username),
            (&mut self.conversation_id, &outer.conversation_id),
            (&mut self.target_user, &outer.target_user),
        ] {
            if mine.is_none() {
                mine.clone_from(theirs);
            }
        }
    }

    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One persisted log line.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    /// Remaining event fields as a JSON object.
    pub fields: Option<String>,
    #[serde(flatten)]
    pub correlation: Correlation,
}

impl LogRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            timestamp: row.get("timestamp")?,
            level: row.get("level")?,
            target: row.get("target")?,
            message: row.get("message")?,
            fields: row.get("fields")?,
            correlation: Correlation {
                connection_id: row.get("connection_id")?,
                username: row.get("username")?,
                conversation_id: row.get("conversation_id")?,
                target_user: row.get("target_user")?,
            },
        })
    }
}

/// Which persisted lines to return. Set fields must all match.
#[derive(Clone, Debug)]
pub struct LogFilter {
    /// Return this level and anything more severe.
    pub min_level: Option<Level>,
    pub connection_id: Option<String>,
    pub username: Option<String>,
    pub conversation_id: Option<String>,
    pub limit: usize,
}

impl Default for LogFilter {
    fn default() -> Self {
        Self {
            min_level: None,
            connection_id: None,
            username: None,
            conversation_id: None,
            limit: 100,
        }
    }
}

impl LogFilter {
    /// WHERE clause and its bound values.
    fn to_sql(&self) -> (String, Vec<String>) {
        let mut clauses = Vec::new();
        let mut values = Vec::new();

        if let Some(min) = self.min_level {
            let levels: Vec<String> = [Level::ERROR, Level::WARN, Level::INFO, Level::DEBUG, Level::TRACE]
                .into_iter()
                .filter(|level| *level <= min)
                .map(|level| level.to_string())
                .collect();
            clauses.push(format!("level IN ({})", vec!["?"; levels.len()].join(", ")));
            values.extend(levels);
        }
        for (column, value) in [
            ("connection_id", &self.connection_id),
            ("username", &self.username),
            ("conversation_id", &self.conversation_id),
        ] {
            if let Some(value) = value {
                clauses.push(format!("{column} = ?"));
                values.push(value.clone());
            }
        }

        let clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        (clause, values)
    }
}

/// SQLite file holding persisted log lines.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn open(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Newest matching lines first.
    pub fn recent(&self, filter: &LogFilter) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let (clause, values) = filter.to_sql();
        let sql = format!("SELECT * FROM logs{clause} ORDER BY id DESC LIMIT {}", filter.limit);

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), LogRecord::from_row)?;
        rows.collect()
    }

    pub fn len(&self) -> Result<usize, rusqlite::Error> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))?;
        Ok(usize::try_from(n).unwrap_or_default())
    }

    pub fn is_empty(&self) -> Result<bool, rusqlite::Error> {
        self.len().map(|n| n == 0)
    }

    /// Write failures are dropped: logging must not fail the caller.
    fn write(&self, line: &PendingLine) {
        let c = &line.correlation;
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields,
                               connection_id, username, conversation_id, target_user)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                line.timestamp,
                line.level,
                line.target,
                line.message,
                line.fields,
                c.connection_id,
                c.username,
                c.conversation_id,
                c.target_user,
            ],
        );
    }
}

struct PendingLine {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    correlation: Correlation,
}

/// Splits an event or span into message, correlation fields and the rest.
#[derive(Default)]
struct EventFields {
    message: Option<String>,
    correlation: Correlation,
    extra: Map<String, Value>,
}

impl EventFields {
    fn put(&mut self, field: &Field, value: Value) {
        let name = field.name();
        match value {
            Value::String(text) if name == "message" => self.message = Some(text),
            Value::String(text) if Correlation::FIELDS.contains(&name) => {
                self.correlation.set(name, text);
            }
            other => {
                self.extra.insert(name.to_owned(), other);
            }
        }
    }
}

impl Visit for EventFields {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let text = format!("{value:?}");
        self.record_str(field, text.trim_matches('"'));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::String(value.to_owned()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, Value::Bool(value));
    }
}

/// Layer that persists WARN+ events to a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut fields = EventFields::default();
        attrs.record(&mut fields);
        if fields.correlation.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(fields.correlation);
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > PERSIST_AT {
            return;
        }

        let mut fields = EventFields::default();
        event.record(&mut fields);

        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if let Some(outer) = span.extensions().get::<Correlation>() {
                    fields.correlation.inherit(outer);
                }
            }
        }

        let extra = (!fields.extra.is_empty())
            .then(|| serde_json::to_string(&fields.extra).ok())
            .flatten();

        self.sink.write(&PendingLine {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string(),
            target: event.metadata().target().to_owned(),
            message: fields.message.unwrap_or_default(),
            fields: extra,
            correlation: fields.correlation,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn temp_sink() -> (tempfile::TempDir, Arc<SqliteLogSink>) {
        let dir = tempfile::tempdir().unwrap();
        let sink = SqliteLogSink::open(&dir.path().join("logs.db")).unwrap();
        (dir, Arc::new(sink))
    }

    fn capture(sink: &Arc<SqliteLogSink>, f: impl FnOnce()) {
        let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(Arc::clone(sink)));
        tracing::subscriber::with_default(subscriber, f);
    }

    #[test]
    fn only_warn_and_error_are_persisted() {
        let (_dir, sink) = temp_sink();
        capture(&sink, || {
            tracing::debug!(connection_id = "conn_1", "frame dropped");
            tracing::info!(username = "alice", "user logged in");
            tracing::warn!(connection_id = "conn_1", "send queue full");
            tracing::error!("server stopped");
        });
        assert_eq!(sink.len().unwrap(), 2);

        let records = sink.recent(&LogFilter::default()).unwrap();
        assert_eq!(records[0].level, "ERROR");
        assert_eq!(records[1].message, "send queue full");
        assert_eq!(records[1].correlation.connection_id.as_deref(), Some("conn_1"));
    }

    #[test]
    fn conversation_fields_are_columns_not_extras() {
        let (_dir, sink) = temp_sink();
        let conversation = String::from("alice:bob");
        capture(&sink, || {
            tracing::warn!(
                conversation_id = %conversation,
                target_user = "bob",
                attempt = 2u64,
                "failed to store private message"
            );
        });

        let record = &sink.recent(&LogFilter::default()).unwrap()[0];
        assert_eq!(record.correlation.conversation_id.as_deref(), Some("alice:bob"));
        assert_eq!(record.correlation.target_user.as_deref(), Some("bob"));
        let extra: Value = serde_json::from_str(record.fields.as_deref().unwrap()).unwrap();
        assert_eq!(extra, serde_json::json!({ "attempt": 2 }));
    }

    #[test]
    fn event_inherits_missing_fields_from_spans() {
        let (_dir, sink) = temp_sink();
        capture(&sink, || {
            let connection = tracing::info_span!("handle", connection_id = "conn_9", event = "login");
            let _outer = connection.enter();
            let user = tracing::info_span!("login", username = "carol");
            let _inner = user.enter();
            tracing::warn!(connection_id = "conn_own", "event from unauthenticated connection");
        });

        let record = &sink.recent(&LogFilter::default()).unwrap()[0];
        assert_eq!(record.correlation.connection_id.as_deref(), Some("conn_own"));
        assert_eq!(record.correlation.username.as_deref(), Some("carol"));
        assert!(record.correlation.conversation_id.is_none());
    }

    #[test]
    fn filter_matches_every_set_field() {
        let (_dir, sink) = temp_sink();
        capture(&sink, || {
            tracing::warn!(username = "alice", connection_id = "conn_1", "a");
            tracing::warn!(username = "alice", connection_id = "conn_2", "b");
            tracing::error!(username = "bob", conversation_id = "alice:bob", "c");
        });

        let alice = sink
            .recent(&LogFilter {
                username: Some("alice".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(alice.iter().map(|r| r.message.as_str()).collect::<Vec<_>>(), ["b", "a"]);

        let narrowed = sink
            .recent(&LogFilter {
                username: Some("alice".into()),
                connection_id: Some("conn_1".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(narrowed.len(), 1);
        assert_eq!(narrowed[0].message, "a");

        let by_conversation = sink
            .recent(&LogFilter {
                conversation_id: Some("alice:bob".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_conversation[0].message, "c");
    }

    #[test]
    fn min_level_keeps_more_severe_lines() {
        let (_dir, sink) = temp_sink();
        capture(&sink, || {
            tracing::warn!("queue full");
            tracing::error!("store down");
        });

        let errors = sink
            .recent(&LogFilter {
                min_level: Some(Level::ERROR),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "store down");

        let warnings = sink
            .recent(&LogFilter {
                min_level: Some(Level::WARN),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn limit_returns_newest_lines() {
        let (_dir, sink) = temp_sink();
        capture(&sink, || {
            for i in 0..10 {
                tracing::warn!(attempt = i, "connect attempt failed");
            }
        });

        let records = sink
            .recent(&LogFilter {
                limit: 3,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(records.len(), 3);
        assert!(records[0].fields.as_deref().unwrap().contains("9"));
    }

    #[test]
    fn record_serializes_correlation_inline() {
        let (_dir, sink) = temp_sink();
        capture(&sink, || tracing::warn!(username = "dave", "x"));
        let json = serde_json::to_value(&sink.recent(&LogFilter::default()).unwrap()[0]).unwrap();
        assert_eq!(json["username"], "dave");
        assert!(json.get("correlation").is_none());
    }
}
