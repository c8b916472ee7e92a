//! Configuration constants for the counting game
//!
//! This module contains the limits and defaults used throughout the game
//! to provide consistent boundaries for the counter, the verification
//! throttle, and the connection registry.

/// Core counting game constants
pub mod game {
    /// Counter value that permanently ends the game once reached
    pub const DEFAULT_TARGET: i64 = 1_000_000;
    /// Maximum number of simultaneously connected sessions
    pub const MAX_CONNECTION_COUNT: usize = 10_000;
}

/// Verification throttle constants
pub mod throttle {
    /// Default number of processed submissions allowed between
    /// proof-of-humanity checks
    pub const DEFAULT_MAX_SUBMISSIONS: u32 = 5;
    /// Upper bound accepted for the configurable threshold
    pub const MAX_THRESHOLD: u32 = 1_000;
}

/// Proof-of-humanity verification constants
pub mod verification {
    /// Endpoint that validates Turnstile challenge tokens
    pub const SITEVERIFY_URL: &str =
        "https://challenges.cloudflare.com/turnstile/v0/siteverify";
}
