//! Communication session management
//!
//! This module defines the trait for tunneling messages between the game
//! engine and connected viewers. The tunnel abstraction allows for
//! different communication mechanisms while maintaining a consistent
//! interface; the production implementation pushes frames onto a
//! per-connection websocket queue.

use super::game::{SyncMessage, UpdateMessage};

/// Trait for sending messages through a communication tunnel
///
/// This trait abstracts the communication mechanism used to send messages
/// to connected clients. Implementations must never block the caller: a
/// slow or dead connection is that connection's problem alone.
pub trait Tunnel {
    /// Sends an update message to the client
    ///
    /// Update messages notify clients about changes that affect their
    /// current view, such as the counter advancing or a streak breaking.
    ///
    /// # Arguments
    ///
    /// * `message` - The update message to send
    fn send_message(&self, message: &UpdateMessage);

    /// Sends a state synchronization message to the client
    ///
    /// Sync messages carry a complete snapshot of the current game state,
    /// typically sent when a client connects or asks to resynchronize.
    ///
    /// # Arguments
    ///
    /// * `state` - The synchronization message to send
    fn send_state(&self, state: &SyncMessage);

    /// Closes the communication tunnel
    ///
    /// This method should be called when the client disconnects or when
    /// the server refuses further participation (for example after the
    /// game has ended).
    fn close(self);
}
