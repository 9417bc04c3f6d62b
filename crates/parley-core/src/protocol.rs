//! Real-time event protocol.
//!
//! Every WebSocket text frame carries one event as `{"event": <name>, "data": <payload>}`.
//! Payload shapes follow the event table: bare strings for presence and typing
//! signals, objects for conversation and message events.

use serde::{Deserialize, Serialize};

use crate::messages::{ConversationId, Message};

/// Payload of `send_private_message`.
///
/// Both fields are optional at the wire level so the router, not the frame
/// parser, decides how to answer a request with a missing field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendPrivateMessage {
    #[serde(default)]
    pub target_user: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl SendPrivateMessage {
    pub fn new(target_user: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            target_user: Some(target_user.into()),
            message: Some(message.into()),
        }
    }
}

/// Events sent by a client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    Login(String),
    StartConversation(String),
    SendPrivateMessage(SendPrivateMessage),
    Typing(String),
    StopTyping(String),
}

/// Payload of `conversation_started`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationStarted {
    pub conversation_id: ConversationId,
    pub target_user: String,
    pub messages: Vec<Message>,
}

/// Events sent by the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    UsersList(Vec<String>),
    UserOnline(String),
    UserOffline(String),
    ConversationStarted(ConversationStarted),
    ReceivePrivateMessage(Message),
    UserTyping(String),
    UserStopTyping(String),
    Error { message: String },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Wire name of the event, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::UsersList(_) => "users_list",
            Self::UserOnline(_) => "user_online",
            Self::UserOffline(_) => "user_offline",
            Self::ConversationStarted(_) => "conversation_started",
            Self::ReceivePrivateMessage(_) => "receive_private_message",
            Self::UserTyping(_) => "user_typing",
            Self::UserStopTyping(_) => "user_stop_typing",
            Self::Error { .. } => "error",
        }
    }

    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_frame(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Login(_) => "login",
            Self::StartConversation(_) => "start_conversation",
            Self::SendPrivateMessage(_) => "send_private_message",
            Self::Typing(_) => "typing",
            Self::StopTyping(_) => "stop_typing",
        }
    }

    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_frame(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }
}
