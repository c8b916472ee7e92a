//! # Tally Game Server
//!
//! This library provides the logic for tally, a cooperative counting game:
//! any number of visitors count upward together, one integer at a time,
//! over a shared counter broadcast to every connected viewer. A submission
//! that is not exactly one above the current count breaks the streak and
//! resets the counter; once the counter reaches its target the game ends
//! permanently. Submissions are gated behind a proof-of-humanity throttle
//! to keep bots from counting alone.
//!
//! The game engine itself is transport-agnostic: durable state sits behind
//! the [`store`] contracts, client connections behind the
//! [`session::Tunnel`] seam. The [`server`] module binds both to a
//! websocket endpoint.

#![cfg_attr(all(coverage_nightly, test), feature(coverage_attribute))]
#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::ignored_unit_patterns)]
#![allow(clippy::doc_markdown)]

pub mod auth;
pub mod bus;
pub mod config;
pub mod constants;
pub mod game;
pub mod server;
pub mod session;
pub mod store;
pub mod throttle;
pub mod verify;
pub mod watcher;

pub use game::{IncomingMessage, SyncMessage, UpdateMessage};
