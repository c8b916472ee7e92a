//! Environment-driven server configuration
//!
//! Everything is read once at startup. Missing optional values fall back
//! to defaults with a log line; a missing required secret aborts startup
//! immediately rather than serving a half-configured game.

use std::{env, fmt::Display, str::FromStr};

use tracing::{info, warn};

/// Runtime configuration of one server instance
pub struct Config {
    /// Port the HTTP/websocket listener binds to
    pub port: u16,
    /// Counter value that permanently ends the game
    pub target: i64,
    /// Processed submissions allowed between proof-of-humanity checks
    pub verification_threshold: u32,
    /// Shared secret for the Turnstile siteverify call
    pub turnstile_secret: String,
    /// Redis URL; enables the durable shared store and cross-process
    /// broadcast when set
    pub redis_url: Option<String>,
    /// Identity service endpoint; everyone is admitted anonymously when
    /// unset
    pub auth_url: Option<String>,
    /// Origin allowed by CORS; permissive when unset
    pub frontend_host: Option<String>,
}

impl Config {
    /// Loads the configuration from the environment
    pub fn load() -> Self {
        Self {
            port: try_load("PORT", "5000"),
            target: try_load("COUNT_TARGET", "1000000"),
            verification_threshold: try_load("MAX_SUBMISSIONS_PER_VERIFICATION", "5"),
            turnstile_secret: must_load("CF_TURNSTILE_SECRET"),
            redis_url: maybe_load("REDIS_URL"),
            auth_url: maybe_load("AUTH_URL"),
            frontend_host: maybe_load("FRONTEND_HOST"),
        }
    }
}

fn var(key: &str) -> Result<String, ()> {
    env::var(key).map_err(|_| {
        warn!("Environment variable {key} not found");
    })
}

fn try_load<T: FromStr>(key: &str, default: &str) -> T
where
    T::Err: Display,
{
    var(key)
        .unwrap_or_else(|_| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e| {
            warn!("Invalid {key} value: {e}");
        })
        .expect("Environment misconfigured!")
}

fn must_load(key: &str) -> String {
    var(key).expect("Environment misconfigured!")
}

fn maybe_load(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}
