//! Identity resolution for incoming connections
//!
//! Authentication itself lives in an external service; this module only
//! maps the token a client hands over during the websocket handshake to
//! an [`Identity`]. Deployments without an identity service admit every
//! visitor anonymously.

use serde::Deserialize;
use thiserror::Error;

use super::watcher::{Identity, UserId};

/// Errors produced while resolving an identity
#[derive(Error, Debug)]
pub enum Error {
    /// The client presented no token or one the identity service rejected
    #[error("missing or invalid credentials")]
    Unauthorized,
    /// The identity service could not be reached
    #[error("identity service unreachable: {0}")]
    Unavailable(#[from] reqwest::Error),
}

/// Answer of the identity service for a valid token
#[derive(Deserialize)]
struct IdentityResponse {
    id: UserId,
}

/// Resolves connection tokens to identities
pub enum Authenticator {
    /// Ask an external identity service to resolve the token
    Remote {
        /// HTTP client reused across lookups
        client: reqwest::Client,
        /// Endpoint answering `{ "id": "<uuid>" }` for a valid bearer token
        url: String,
    },
    /// Admit everyone as an anonymous visitor
    AllowAll,
}

impl Authenticator {
    /// Creates an authenticator backed by an external identity service
    ///
    /// # Arguments
    ///
    /// * `url` - Endpoint resolving bearer tokens to user ids
    pub fn remote(url: String) -> Self {
        Self::Remote {
            client: reqwest::Client::new(),
            url,
        }
    }

    /// Creates an authenticator that admits everyone anonymously
    pub fn allow_all() -> Self {
        Self::AllowAll
    }

    /// Resolves the token presented during the handshake
    ///
    /// # Arguments
    ///
    /// * `token` - The `token` query parameter of the connection URL
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthorized`] when the token is missing or
    /// rejected, and [`Error::Unavailable`] when the identity service
    /// cannot be reached. Either way the connection must be refused before
    /// it becomes active.
    pub async fn resolve(&self, token: Option<&str>) -> Result<Identity, Error> {
        match self {
            Authenticator::AllowAll => Ok(Identity::Anonymous),
            Authenticator::Remote { client, url } => {
                let token = token.ok_or(Error::Unauthorized)?;

                let response = client.get(url).bearer_auth(token).send().await?;

                if !response.status().is_success() {
                    return Err(Error::Unauthorized);
                }

                let body: IdentityResponse =
                    response.json().await.map_err(|_| Error::Unauthorized)?;

                Ok(Identity::User(body.id))
            }
        }
    }
}
