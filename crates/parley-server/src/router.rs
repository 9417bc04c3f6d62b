//! Per-event dispatch.
//!
//! Every inbound event is authorized against the session registry, then
//! turned into store operations and outbound events. Events from one
//! connection run strictly in arrival order (see [`run_connection`]); events
//! for different connections run concurrently.

use std::sync::Arc;

use dashmap::DashMap;
use parley_core::{
    ClientEvent, ConnectionId, ConversationId, ConversationStarted, Message, SendPrivateMessage,
    ServerEvent,
};
use parley_store::ConversationStore;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::sessions::{Outbound, SessionRegistry};

const SEND_FAILED: &str = "Failed to send message";
const LOAD_FAILED: &str = "Failed to load conversation";
const TARGET_REQUIRED: &str = "targetUser is required";
const MESSAGE_REQUIRED: &str = "message is required";

/// Authorization state of one connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Anonymous,
    Authenticated { username: String },
}

pub struct EventRouter {
    sessions: SessionRegistry,
    store: Arc<dyn ConversationStore>,
    outbound: Arc<dyn Outbound>,
    conversation_locks: DashMap<ConversationId, Arc<Mutex<()>>>,
}

impl EventRouter {
    pub fn new(store: Arc<dyn ConversationStore>, outbound: Arc<dyn Outbound>) -> Self {
        Self {
            sessions: SessionRegistry::new(),
            store,
            outbound,
            conversation_locks: DashMap::new(),
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    pub fn state(&self, connection: &ConnectionId) -> ConnectionState {
        match self.sessions.username_of(connection) {
            Some(username) => ConnectionState::Authenticated { username },
            None => ConnectionState::Anonymous,
        }
    }

    /// Process one event to completion.
    #[instrument(skip(self, event), fields(connection_id = %connection, event = event.name()))]
    pub async fn handle(&self, connection: &ConnectionId, event: ClientEvent) {
        match event {
            ClientEvent::Login(username) => self.login(connection, &username),
            ClientEvent::StartConversation(target) => {
                if let Some(caller) = self.caller(connection) {
                    self.start_conversation(connection, &caller, &target).await;
                }
            }
            ClientEvent::SendPrivateMessage(payload) => {
                if let Some(caller) = self.caller(connection) {
                    self.send_private_message(connection, &caller, payload).await;
                }
            }
            ClientEvent::Typing(target) => {
                if let Some(caller) = self.caller(connection) {
                    self.relay_typing(&caller, &target, ServerEvent::UserTyping(caller.clone()));
                }
            }
            ClientEvent::StopTyping(target) => {
                if let Some(caller) = self.caller(connection) {
                    self.relay_typing(&caller, &target, ServerEvent::UserStopTyping(caller.clone()));
                }
            }
        }
    }

    /// Release the connection's username, if it still holds one.
    pub fn disconnect(&self, connection: &ConnectionId) {
        match self.sessions.logout(connection, self.outbound.as_ref()) {
            Some(outcome) => info!(
                connection_id = %connection,
                username = %outcome.username,
                notified = outcome.notified.len(),
                "user disconnected"
            ),
            None => debug!(connection_id = %connection, "anonymous connection closed"),
        }
    }

    /// Username bound to the connection; unauthenticated events are dropped.
    fn caller(&self, connection: &ConnectionId) -> Option<String> {
        let username = self.sessions.username_of(connection);
        if username.is_none() {
            debug!("event from unauthenticated connection dropped");
        }
        username
    }

    fn login(&self, connection: &ConnectionId, username: &str) {
        if username.trim().is_empty() {
            debug!("empty username ignored");
            return;
        }
        let outcome = self.sessions.login(username, connection, self.outbound.as_ref());
        info!(
            username,
            others_online = outcome.online_users.len(),
            superseded = outcome.superseded.is_some(),
            "user logged in"
        );
    }

    async fn start_conversation(&self, connection: &ConnectionId, caller: &str, target: &str) {
        if target.trim().is_empty() {
            self.reply(connection, ServerEvent::error(TARGET_REQUIRED));
            return;
        }
        let conversation_id = ConversationId::between(caller, target);
        match self.store.recent(&conversation_id).await {
            Ok(messages) => {
                debug!(conversation_id = %conversation_id, count = messages.len(), "conversation opened");
                self.reply(
                    connection,
                    ServerEvent::ConversationStarted(ConversationStarted {
                        conversation_id,
                        target_user: target.to_owned(),
                        messages,
                    }),
                );
            }
            Err(e) => {
                warn!(
                    username = caller,
                    conversation_id = %conversation_id,
                    error = %e,
                    "failed to load conversation"
                );
                self.reply(connection, ServerEvent::error(LOAD_FAILED));
            }
        }
    }

    async fn send_private_message(
        &self,
        connection: &ConnectionId,
        sender: &str,
        payload: SendPrivateMessage,
    ) {
        let Some(target) = payload.target_user.filter(|t| !t.trim().is_empty()) else {
            self.reply(connection, ServerEvent::error(TARGET_REQUIRED));
            return;
        };
        let Some(body) = payload.message else {
            self.reply(connection, ServerEvent::error(MESSAGE_REQUIRED));
            return;
        };

        let message = Message::new(sender, &target, body);
        let conversation_id = message.conversation_id.clone();
        let lock = self.conversation_lock(&conversation_id);
        {
            // Held across append and delivery so delivery order matches log order.
            let _guard = lock.lock().await;
            if let Err(e) = self.store.append(&conversation_id, &message).await {
                warn!(
                    username = sender,
                    target_user = %target,
                    conversation_id = %conversation_id,
                    error = %e,
                    "failed to store private message"
                );
                self.reply(connection, ServerEvent::error(SEND_FAILED));
            } else {
                let event = ServerEvent::ReceivePrivateMessage(message);
                self.outbound.deliver(connection, &event);
                match self.sessions.connection_of(&target) {
                    Some(recipient) if recipient != *connection => {
                        self.outbound.deliver(&recipient, &event);
                    }
                    Some(_) => {}
                    None => debug!(target_user = %target, "recipient offline, message stored only"),
                }
            }
        }
        drop(lock);
        self.release_conversation_lock(&conversation_id);
    }

    fn relay_typing(&self, caller: &str, target: &str, event: ServerEvent) {
        match self.sessions.connection_of(target) {
            Some(recipient) => {
                self.outbound.deliver(&recipient, &event);
            }
            None => debug!(sender = caller, target_user = target, "typing signal for offline user dropped"),
        }
    }

    fn reply(&self, connection: &ConnectionId, event: ServerEvent) {
        if !self.outbound.deliver(connection, &event) {
            debug!(connection_id = %connection, event = event.name(), "reply not delivered");
        }
    }

    fn conversation_lock(&self, conversation_id: &ConversationId) -> Arc<Mutex<()>> {
        self.conversation_locks
            .entry(conversation_id.clone())
            .or_default()
            .clone()
    }

    /// Drop the lock entry once nobody else holds a handle to it.
    fn release_conversation_lock(&self, conversation_id: &ConversationId) {
        self.conversation_locks
            .remove_if(conversation_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Dispatch loop for one connection. Ends, and logs the user out, once the
/// inbound channel closes.
pub async fn run_connection(
    router: Arc<EventRouter>,
    connection: ConnectionId,
    mut inbound: mpsc::Receiver<ClientEvent>,
) {
    while let Some(event) = inbound.recv().await {
        router.handle(&connection, event).await;
    }
    router.disconnect(&connection);
}
