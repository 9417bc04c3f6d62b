use parley_core::{ConversationId, Message, ServerEvent};

/// The conversation currently on screen.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveConversation {
    pub peer: String,
    pub conversation_id: ConversationId,
    pub messages: Vec<Message>,
}

/// What a chat screen shows, folded from server events.
#[derive(Clone, Debug, Default)]
pub struct ChatView {
    me: String,
    online: Vec<String>,
    active: Option<ActiveConversation>,
    typing: Option<String>,
    last_error: Option<String>,
}

impl ChatView {
    pub fn new(me: impl Into<String>) -> Self {
        Self {
            me: me.into(),
            ..Default::default()
        }
    }

    pub fn apply(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::UsersList(users) => {
                self.online = users.iter().filter(|u| **u != self.me).cloned().collect();
            }
            ServerEvent::UserOnline(user) => {
                if *user != self.me && !self.online.contains(user) {
                    self.online.push(user.clone());
                }
            }
            ServerEvent::UserOffline(user) => {
                self.online.retain(|u| u != user);
                if self.typing.as_ref() == Some(user) {
                    self.typing = None;
                }
            }
            ServerEvent::ConversationStarted(started) => {
                self.active = Some(ActiveConversation {
                    peer: started.target_user.clone(),
                    conversation_id: started.conversation_id.clone(),
                    messages: started.messages.clone(),
                });
                self.typing = None;
            }
            ServerEvent::ReceivePrivateMessage(message) => {
                if let Some(active) = self
                    .active
                    .as_mut()
                    .filter(|a| a.conversation_id == message.conversation_id)
                {
                    if !active.messages.iter().any(|m| m.id == message.id) {
                        active.messages.push(message.clone());
                    }
                }
            }
            ServerEvent::UserTyping(user) => {
                if self.active_peer() == Some(user.as_str()) {
                    self.typing = Some(user.clone());
                }
            }
            ServerEvent::UserStopTyping(user) => {
                if self.typing.as_ref() == Some(user) {
                    self.typing = None;
                }
            }
            ServerEvent::Error { message } => self.last_error = Some(message.clone()),
        }
    }

    pub fn online_users(&self) -> &[String] {
        &self.online
    }

    pub fn active(&self) -> Option<&ActiveConversation> {
        self.active.as_ref()
    }

    pub fn active_peer(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.peer.as_str())
    }

    /// Peer currently typing in the active conversation.
    pub fn typing_peer(&self) -> Option<&str> {
        self.typing.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}
