//! Client side of the presence and messaging protocol.
//!
//! [`ChatClient`] keeps one logical session alive across transport failures;
//! [`ChatView`] folds server events into what a chat screen shows.

pub mod connector;
pub mod error;
pub mod lifecycle;
pub mod view;

pub use connector::{Connector, Link, WsConnector};
pub use error::ClientError;
pub use lifecycle::{ChatClient, ConnectionState, LifecycleConfig};
pub use view::{ActiveConversation, ChatView};
