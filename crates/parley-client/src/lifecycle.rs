//! Connection lifecycle for one logged-in user.
//!
//! A supervisor task owns the transport. Every time a link comes up it logs in
//! again and re-opens the last conversation, so the server-side session is
//! rebuilt after any outage. Failed connects are retried in two tiers: a short
//! inner series of attempts, then a longer outer pause before the next series.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use parley_core::{ClientEvent, SendPrivateMessage, ServerEvent};
use parley_settings::ClientSettings;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connector::{Connector, Link};
use crate::error::{ClientError, Result};

const EVENT_QUEUE: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Clone, Debug)]
pub struct LifecycleConfig {
    /// Pause between inner retry series.
    pub reconnect_delay: Duration,
    /// Connect attempts per inner series.
    pub transport_attempts: u32,
    /// Pause between attempts within a series.
    pub transport_retry: Duration,
    /// Inactivity before an automatic `stop_typing`.
    pub typing_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self::from_settings(&ClientSettings::default())
    }
}

impl LifecycleConfig {
    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self {
            reconnect_delay: Duration::from_millis(settings.reconnect_delay_ms),
            transport_attempts: settings.transport_attempts,
            transport_retry: Duration::from_millis(settings.transport_retry_ms),
            typing_timeout: Duration::from_millis(settings.typing_timeout_ms),
        }
    }
}

struct Shared {
    username: String,
    config: LifecycleConfig,
    state: watch::Sender<ConnectionState>,
    link: Mutex<Option<mpsc::Sender<String>>>,
    active_peer: Mutex<Option<String>>,
    typing_timer: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl Shared {
    /// Once cancelled, only `Disconnected` may be published.
    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next || (self.cancel.is_cancelled() && next != ConnectionState::Disconnected) {
                return false;
            }
            debug!(from = ?*current, to = ?next, "connection state");
            *current = next;
            true
        });
    }

    fn install(&self, outbound: mpsc::Sender<String>) -> bool {
        let mut link = self.link.lock();
        if self.cancel.is_cancelled() {
            return false;
        }
        *link = Some(outbound);
        true
    }

    fn disarm_typing(&self) {
        if let Some(timer) = self.typing_timer.lock().take() {
            timer.abort();
        }
    }

    async fn send(&self, event: ClientEvent) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::Closed);
        }
        if *self.state.borrow() != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let sender = self.link.lock().clone().ok_or(ClientError::NotConnected)?;
        let frame = event.to_frame()?;
        sender
            .send(frame)
            .await
            .map_err(|_| ClientError::NotConnected)
    }
}

/// Handle to a running client session.
///
/// Dropping the handle ends the session.
pub struct ChatClient {
    shared: Arc<Shared>,
    supervisor: Option<JoinHandle<()>>,
}

impl ChatClient {
    /// Start connecting as `username`. Server events arrive on the returned
    /// receiver, which closes once the session ends.
    pub fn spawn<C: Connector>(
        username: impl Into<String>,
        connector: C,
        config: LifecycleConfig,
    ) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            username: username.into(),
            config,
            state,
            link: Mutex::new(None),
            active_peer: Mutex::new(None),
            typing_timer: Mutex::new(None),
            cancel: CancellationToken::new(),
        });
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let supervisor = tokio::spawn(supervise(Arc::clone(&shared), connector, events_tx));
        (
            Self {
                shared,
                supervisor: Some(supervisor),
            },
            events_rx,
        )
    }

    pub fn username(&self) -> &str {
        &self.shared.username
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// The peer of the most recently opened conversation.
    pub fn active_peer(&self) -> Option<String> {
        self.shared.active_peer.lock().clone()
    }

    /// Open the conversation with `peer`; it is re-opened after every reconnect.
    pub async fn start_conversation(&self, peer: &str) -> Result<()> {
        self.shared
            .send(ClientEvent::StartConversation(peer.to_owned()))
            .await?;
        *self.shared.active_peer.lock() = Some(peer.to_owned());
        Ok(())
    }

    pub async fn send_message(&self, target: &str, body: &str) -> Result<()> {
        if body.trim().is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        self.shared
            .send(ClientEvent::SendPrivateMessage(SendPrivateMessage::new(target, body)))
            .await?;
        self.stop_typing(target).await
    }

    /// Signal typing and (re)arm the inactivity timer.
    pub async fn typing(&self, target: &str) -> Result<()> {
        self.shared.send(ClientEvent::Typing(target.to_owned())).await?;

        let shared = Arc::clone(&self.shared);
        let target = target.to_owned();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(shared.config.typing_timeout).await;
            if let Err(e) = shared.send(ClientEvent::StopTyping(target)).await {
                debug!(error = %e, "automatic stop_typing not sent");
            }
        });
        if let Some(previous) = self.shared.typing_timer.lock().replace(timer) {
            previous.abort();
        }
        Ok(())
    }

    pub async fn stop_typing(&self, target: &str) -> Result<()> {
        self.shared.disarm_typing();
        self.shared.send(ClientEvent::StopTyping(target.to_owned())).await
    }

    /// End the session: cancel any pending retry and close the transport.
    pub fn end_session(&self) {
        if self.shared.cancel.is_cancelled() {
            return;
        }
        self.shared.cancel.cancel();
        self.shared.disarm_typing();
        self.shared.link.lock().take();
        self.shared.set_state(ConnectionState::Disconnected);
        info!(username = %self.shared.username, "session ended");
    }

    /// Wait for the supervisor to stop. Only returns after [`Self::end_session`].
    pub async fn closed(&mut self) {
        if let Some(supervisor) = self.supervisor.take() {
            if let Err(e) = supervisor.await {
                warn!(error = %e, "lifecycle supervisor failed");
            }
        }
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
        self.shared.disarm_typing();
    }
}

async fn supervise<C: Connector>(
    shared: Arc<Shared>,
    connector: C,
    events: mpsc::Sender<ServerEvent>,
) {
    let cancel = shared.cancel.clone();
    let mut link_lost = false;
    shared.set_state(ConnectionState::Connecting);

    loop {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => break,
            link = connect_with_retries(&connector, &shared.config, link_lost) => link,
        };

        match attempt {
            Some(link) => {
                run_link(&shared, link, &events).await;
                if cancel.is_cancelled() {
                    break;
                }
                warn!(username = %shared.username, "connection lost");
                link_lost = true;
                shared.set_state(ConnectionState::Reconnecting);
            }
            None => {
                shared.set_state(ConnectionState::Reconnecting);
                warn!(
                    delay_ms = shared.config.reconnect_delay.as_millis() as u64,
                    "transport gave up, scheduling reconnect"
                );
                link_lost = false;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(shared.config.reconnect_delay) => {}
                }
            }
        }
    }

    shared.link.lock().take();
    shared.set_state(ConnectionState::Disconnected);
    debug!(username = %shared.username, "lifecycle supervisor stopped");
}

/// Inner retry tier. After a dropped link the first attempt also waits, so a
/// server that accepts and immediately closes cannot cause a tight loop.
async fn connect_with_retries<C: Connector>(
    connector: &C,
    config: &LifecycleConfig,
    pause_first: bool,
) -> Option<Link> {
    for attempt in 1..=config.transport_attempts.max(1) {
        if attempt > 1 || pause_first {
            tokio::time::sleep(config.transport_retry).await;
        }
        match connector.connect().await {
            Ok(link) => {
                debug!(attempt, "transport connected");
                return Some(link);
            }
            Err(e) => warn!(attempt, error = %e, "connect attempt failed"),
        }
    }
    None
}

/// Drive one live link until it drops or the session ends.
async fn run_link(shared: &Shared, link: Link, events: &mpsc::Sender<ServerEvent>) {
    let Link {
        outbound,
        mut inbound,
    } = link;

    if let Err(e) = recover_session(shared, &outbound).await {
        warn!(error = %e, "session recovery failed");
        return;
    }
    if !shared.install(outbound) {
        return;
    }
    shared.set_state(ConnectionState::Connected);
    info!(username = %shared.username, "connected");

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            frame = inbound.recv() => {
                let Some(frame) = frame else { break };
                match ServerEvent::from_frame(&frame) {
                    Ok(event) => {
                        if shared.cancel.is_cancelled() {
                            break;
                        }
                        if events.send(event).await.is_err() {
                            debug!("event receiver dropped");
                        }
                    }
                    Err(e) => debug!(error = %e, "ignoring unparseable frame"),
                }
            }
        }
    }

    shared.link.lock().take();
}

/// Login, then re-open the last conversation.
async fn recover_session(shared: &Shared, outbound: &mpsc::Sender<String>) -> Result<()> {
    let mut frames = vec![ClientEvent::Login(shared.username.clone()).to_frame()?];
    let peer = shared.active_peer.lock().clone();
    if let Some(peer) = peer {
        frames.push(ClientEvent::StartConversation(peer).to_frame()?);
    }
    for frame in frames {
        outbound
            .send(frame)
            .await
            .map_err(|_| ClientError::NotConnected)?;
    }
    Ok(())
}
