//! Proof-of-humanity verification gate
//!
//! Challenge tokens submitted by clients are validated against an external
//! verifier. A gate failure of any kind (network error, non-success
//! status, malformed body) is reported as a failed verification: the
//! client is re-prompted, nothing is fatal.

use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::constants;

/// Trait for validating proof-of-humanity challenge tokens
///
/// The verification throttle consumes this to decide whether a session
/// may transition into the verified state.
pub trait VerificationGate: Send + Sync {
    /// Validates a challenge token
    ///
    /// # Arguments
    ///
    /// * `token` - The token produced by the client's challenge widget
    ///
    /// # Returns
    ///
    /// `true` if the verifier confirmed the token, `false` on rejection or
    /// any gate failure.
    fn verify(&self, token: &str) -> impl Future<Output = bool> + Send;
}

/// Verification gate backed by Cloudflare Turnstile
pub struct Turnstile {
    client: reqwest::Client,
    url: String,
    secret: String,
}

/// Body sent to the siteverify endpoint
#[derive(Serialize)]
struct SiteverifyRequest<'a> {
    response: &'a str,
    secret: &'a str,
}

/// The part of the siteverify answer we care about
#[derive(Deserialize)]
struct SiteverifyResponse {
    #[serde(default)]
    success: bool,
}

impl Turnstile {
    /// Creates a gate calling the public siteverify endpoint
    ///
    /// # Arguments
    ///
    /// * `secret` - The shared secret identifying this deployment
    pub fn new(secret: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: constants::verification::SITEVERIFY_URL.to_owned(),
            secret,
        }
    }
}

impl VerificationGate for Turnstile {
    async fn verify(&self, token: &str) -> bool {
        let response = match self
            .client
            .post(&self.url)
            .json(&SiteverifyRequest {
                response: token,
                secret: &self.secret,
            })
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => {
                warn!("verification gate unreachable: {error}");
                return false;
            }
        };

        if !response.status().is_success() {
            warn!("verification gate answered {}", response.status());
            return false;
        }

        match response.json::<SiteverifyResponse>().await {
            Ok(body) => body.success,
            Err(error) => {
                warn!("malformed verification answer: {error}");
                false
            }
        }
    }
}
