//! Connected viewer management
//!
//! This module tracks every live connection to the game: its identifier,
//! the identity resolved at connect time, and its verification throttle
//! state. It also provides the broadcast helpers used to fan out state
//! changes to all viewers.

use std::{collections::HashMap, fmt::Display, str::FromStr};

use itertools::Itertools;
use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;
use uuid::Uuid;

use super::{
    game::{SyncMessage, UpdateMessage},
    session::Tunnel,
    throttle::Throttle,
};

/// A unique identifier for a live connection
///
/// Each connection gets a fresh ID when it is accepted; the ID is never
/// reused and does not survive a disconnect.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(Uuid);

impl Id {
    /// Creates a new random connection ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for Id {
    /// Creates a new random connection ID (same as `new()`)
    fn default() -> Self {
        Self::new()
    }
}

impl Display for Id {
    /// Formats the ID as a UUID string
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A durable identifier for an authenticated user
///
/// User IDs are issued by the external identity service and are carried on
/// persisted attempts so ranking queries can attribute streaks.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, DeserializeFromStr, SerializeDisplay)]
pub struct UserId(Uuid);

impl UserId {
    /// Creates a new random user ID
    ///
    /// Production IDs come from the identity service; this is mainly
    /// useful for guest identities and tests.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    /// Creates a new random user ID (same as `new()`)
    fn default() -> Self {
        Self::new()
    }
}

impl Display for UserId {
    /// Formats the user ID as a UUID string
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for UserId {
    type Err = uuid::Error;

    /// Parses a user ID from a UUID string
    ///
    /// # Errors
    ///
    /// Returns a `uuid::Error` if the string is not a valid UUID.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::from_str(s)?))
    }
}

/// The identity bound to a connection when it was accepted
///
/// Deployments without an identity service admit everyone anonymously;
/// otherwise the identity resolver maps the client's token to a user.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// A visitor with no resolved account
    Anonymous,
    /// An authenticated user
    User(UserId),
}

impl Identity {
    /// Returns the user ID for authenticated identities
    ///
    /// # Returns
    ///
    /// `Some(UserId)` for authenticated users, `None` for anonymous
    /// visitors.
    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Identity::Anonymous => None,
            Identity::User(user_id) => Some(*user_id),
        }
    }
}

/// Per-connection state tracked by the registry
///
/// The value is exclusively owned by its connection: it is created when
/// the connection is accepted, mutated only while processing that
/// connection's messages, and discarded on disconnect.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Value {
    /// Identity resolved at connection time
    pub identity: Identity,
    /// Verification throttle state for this session
    pub throttle: Throttle,
}

impl Value {
    /// Creates the initial state for a freshly accepted connection
    ///
    /// # Arguments
    ///
    /// * `identity` - The identity resolved during the handshake
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            throttle: Throttle::new(),
        }
    }
}

/// Errors that can occur when managing watchers
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The server has reached the maximum number of live connections
    #[error("maximum number of connections reached")]
    MaximumConnections,
}

/// Manages all connected viewers of the game
///
/// This struct tracks every live connection and its state, and provides
/// functionality for sending messages to individual viewers or fanning
/// out events to all of them.
#[derive(Debug, Default)]
pub struct Watchers {
    /// Mapping from connection ID to its per-connection state
    mapping: HashMap<Id, Value>,
}

impl Watchers {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets a vector of all connections with their tunnels and values
    ///
    /// Connections whose tunnel has already gone away are skipped; their
    /// close path will unregister them shortly.
    ///
    /// # Arguments
    ///
    /// * `tunnel_finder` - Function to retrieve the tunnel for a given ID
    ///
    /// # Returns
    ///
    /// Vector of tuples containing (ID, Tunnel, Value) for all connections
    /// with active tunnels
    pub fn vec<T: Tunnel, F: Fn(Id) -> Option<T>>(&self, tunnel_finder: F) -> Vec<(Id, T, Value)> {
        self.mapping
            .iter()
            .filter_map(|(id, value)| tunnel_finder(*id).map(|tunnel| (*id, tunnel, *value)))
            .collect_vec()
    }

    /// Gets the number of live connections
    pub fn connection_count(&self) -> usize {
        self.mapping.len()
    }

    /// Adds a new watcher to the registry
    ///
    /// # Arguments
    ///
    /// * `watcher_id` - The unique ID for the new connection
    /// * `watcher_value` - The initial per-connection state
    ///
    /// # Errors
    ///
    /// Returns `Error::MaximumConnections` if adding this watcher would
    /// exceed the maximum allowed number of live connections.
    pub fn add_watcher(&mut self, watcher_id: Id, watcher_value: Value) -> Result<(), Error> {
        if self.mapping.len() >= crate::constants::game::MAX_CONNECTION_COUNT {
            return Err(Error::MaximumConnections);
        }

        self.mapping.insert(watcher_id, watcher_value);

        Ok(())
    }

    /// Removes a watcher from the registry
    ///
    /// # Arguments
    ///
    /// * `watcher_id` - The ID of the connection to remove
    ///
    /// # Returns
    ///
    /// `true` if the watcher was registered, `false` otherwise
    pub fn remove_watcher(&mut self, watcher_id: Id) -> bool {
        self.mapping.remove(&watcher_id).is_some()
    }

    /// Updates the state of an existing watcher
    ///
    /// Unknown IDs are ignored; the connection has already gone away.
    ///
    /// # Arguments
    ///
    /// * `watcher_id` - The ID of the watcher to update
    /// * `watcher_value` - The new state for the watcher
    pub fn update_watcher_value(&mut self, watcher_id: Id, watcher_value: Value) {
        if self.mapping.contains_key(&watcher_id) {
            self.mapping.insert(watcher_id, watcher_value);
        }
    }

    /// Gets the state of a specific watcher
    ///
    /// # Arguments
    ///
    /// * `watcher_id` - The ID of the watcher to look up
    ///
    /// # Returns
    ///
    /// The watcher's state if it exists, otherwise `None`
    pub fn get_watcher_value(&self, watcher_id: Id) -> Option<Value> {
        self.mapping.get(&watcher_id).copied()
    }

    /// Checks if a watcher is registered
    ///
    /// # Arguments
    ///
    /// * `watcher_id` - The ID of the watcher to check
    pub fn has_watcher(&self, watcher_id: Id) -> bool {
        self.mapping.contains_key(&watcher_id)
    }

    /// Sends an update message to a specific watcher
    ///
    /// # Arguments
    ///
    /// * `message` - The update message to send
    /// * `watcher_id` - The ID of the watcher to send to
    /// * `tunnel_finder` - Function to retrieve the tunnel for the watcher
    pub fn send_message<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &self,
        message: &UpdateMessage,
        watcher_id: Id,
        tunnel_finder: F,
    ) {
        let Some(session) = tunnel_finder(watcher_id) else {
            return;
        };

        session.send_message(message);
    }

    /// Sends a state synchronization message to a specific watcher
    ///
    /// # Arguments
    ///
    /// * `message` - The sync message to send
    /// * `watcher_id` - The ID of the watcher to send to
    /// * `tunnel_finder` - Function to retrieve the tunnel for the watcher
    pub fn send_state<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &self,
        message: &SyncMessage,
        watcher_id: Id,
        tunnel_finder: F,
    ) {
        let Some(session) = tunnel_finder(watcher_id) else {
            return;
        };

        session.send_state(message);
    }

    /// Broadcasts an update message to all watchers
    ///
    /// Delivery to each watcher is independent; a missing or dead tunnel
    /// never prevents delivery to the remaining watchers.
    ///
    /// # Arguments
    ///
    /// * `message` - The update message to broadcast
    /// * `tunnel_finder` - Function to retrieve tunnels for watchers
    pub fn announce<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &self,
        message: &UpdateMessage,
        tunnel_finder: F,
    ) {
        for (_, session, _) in self.vec(tunnel_finder) {
            session.send_message(message);
        }
    }

    /// Broadcasts an update message to all watchers except one
    ///
    /// # Arguments
    ///
    /// * `message` - The update message to broadcast
    /// * `excluded` - The watcher that should not receive the message
    /// * `tunnel_finder` - Function to retrieve tunnels for watchers
    pub fn announce_except<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &self,
        message: &UpdateMessage,
        excluded: Id,
        tunnel_finder: F,
    ) {
        for (id, session, _) in self.vec(tunnel_finder) {
            if id != excluded {
                session.send_message(message);
            }
        }
    }
}
