//! Presence and private-messaging server.
//!
//! [`sessions`] owns who is online, [`router`] turns client events into store
//! writes and deliveries, [`client`] moves frames over WebSockets, and
//! [`server`] wires them into an Axum app.

pub mod client;
pub mod router;
pub mod server;
pub mod sessions;

pub use router::{ConnectionState, EventRouter};
pub use server::{start, AppState, ServerConfig, ServerHandle};
pub use sessions::{LoginOutcome, LogoutOutcome, Outbound, SessionRegistry};
