//! Username ↔ connection bookkeeping and presence broadcasts.
//!
//! Both directions live behind one lock so lookups never observe a half-applied
//! login or logout. Presence events are handed to an [`Outbound`] while that
//! lock is held, which keeps every observer's view of the online set in the
//! same order as the mutations that produced it.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use parley_core::{ConnectionId, ServerEvent};
use tracing::{debug, info};

/// Non-blocking delivery of server events to a connection.
///
/// Implementations must not block or await: they are called with the session
/// lock held. Returns `false` when the event could not be queued.
pub trait Outbound: Send + Sync {
    fn deliver(&self, to: &ConnectionId, event: &ServerEvent) -> bool;
}

/// What a login changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginOutcome {
    /// Everyone else online, as sent to the caller.
    pub online_users: Vec<String>,
    /// Connections that were told about the new user.
    pub notified: Vec<ConnectionId>,
    /// A previous connection that held the same username.
    pub superseded: Option<ConnectionId>,
    /// A different username this connection held before, now released.
    pub released: Option<String>,
}

/// What a logout changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutOutcome {
    pub username: String,
    pub notified: Vec<ConnectionId>,
}

#[derive(Default)]
struct Sessions {
    by_username: BTreeMap<String, ConnectionId>,
    by_connection: HashMap<ConnectionId, String>,
}

impl Sessions {
    /// Deliver `event` to every online connection except `skip`.
    fn broadcast(
        &self,
        skip: &ConnectionId,
        event: &ServerEvent,
        outbound: &dyn Outbound,
    ) -> Vec<ConnectionId> {
        self.by_username
            .values()
            .filter(|conn| *conn != skip)
            .filter(|conn| outbound.deliver(conn, event))
            .cloned()
            .collect()
    }

    fn remove_connection(&mut self, connection: &ConnectionId) -> Option<String> {
        let username = self.by_connection.remove(connection)?;
        if self.by_username.get(&username) == Some(connection) {
            self.by_username.remove(&username);
        }
        Some(username)
    }
}

/// Tracks which user is online on which connection.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Sessions>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `username` to `connection`.
    ///
    /// The caller receives `users_list` (everyone else) before any other
    /// connection receives `user_online`. A newer login for the same name
    /// supersedes the older connection, which silently loses its binding.
    pub fn login(
        &self,
        username: &str,
        connection: &ConnectionId,
        outbound: &dyn Outbound,
    ) -> LoginOutcome {
        let mut sessions = self.inner.lock();

        let released = sessions
            .by_connection
            .get(connection)
            .filter(|previous| previous.as_str() != username)
            .cloned();
        if let Some(previous) = &released {
            sessions.remove_connection(connection);
            sessions.broadcast(
                connection,
                &ServerEvent::UserOffline(previous.clone()),
                outbound,
            );
        }

        let superseded = sessions
            .by_username
            .insert(username.to_owned(), connection.clone())
            .filter(|previous| previous != connection);
        if let Some(old) = &superseded {
            sessions.by_connection.remove(old);
            info!(username, superseded = %old, "login superseded an older connection");
        }
        sessions
            .by_connection
            .insert(connection.clone(), username.to_owned());

        let online_users: Vec<String> = sessions
            .by_username
            .keys()
            .filter(|name| name.as_str() != username)
            .cloned()
            .collect();

        outbound.deliver(connection, &ServerEvent::UsersList(online_users.clone()));
        let notified = sessions.broadcast(
            connection,
            &ServerEvent::UserOnline(username.to_owned()),
            outbound,
        );

        debug!(username, online = sessions.by_username.len(), "user logged in");
        LoginOutcome {
            online_users,
            notified,
            superseded,
            released,
        }
    }

    /// Release whatever username `connection` holds and tell everyone else.
    ///
    /// Returns `None` for anonymous or superseded connections; nothing is
    /// broadcast in that case.
    pub fn logout(
        &self,
        connection: &ConnectionId,
        outbound: &dyn Outbound,
    ) -> Option<LogoutOutcome> {
        let mut sessions = self.inner.lock();
        let username = sessions.remove_connection(connection)?;
        let notified = sessions.broadcast(
            connection,
            &ServerEvent::UserOffline(username.clone()),
            outbound,
        );
        debug!(username = %username, online = sessions.by_username.len(), "user logged out");
        Some(LogoutOutcome { username, notified })
    }

    pub fn username_of(&self, connection: &ConnectionId) -> Option<String> {
        self.inner.lock().by_connection.get(connection).cloned()
    }

    pub fn connection_of(&self, username: &str) -> Option<ConnectionId> {
        self.inner.lock().by_username.get(username).cloned()
    }

    /// Online usernames in byte order.
    pub fn online_users(&self) -> Vec<String> {
        self.inner.lock().by_username.keys().cloned().collect()
    }

    pub fn online_count(&self) -> usize {
        self.inner.lock().by_username.len()
    }
}
