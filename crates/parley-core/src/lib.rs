pub mod ids;
pub mod messages;
pub mod protocol;

pub use ids::{ConnectionId, MessageId};
pub use messages::{ConversationId, Message};
pub use protocol::{ClientEvent, ConversationStarted, SendPrivateMessage, ServerEvent};
