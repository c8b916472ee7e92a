//! Durable state contracts for the counter and the game status
//!
//! The counter is the only shared mutable resource in the whole system, so
//! its store contract is strict: the compare-and-commit operation must be
//! atomic with respect to concurrent sessions, system-wide. Everything else
//! here is plain durable bookkeeping (terminated streaks, the game status
//! singleton).

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use thiserror::Error;

use super::watcher::{Identity, UserId};

pub mod memory;
pub mod redis;

/// Errors produced by the durable stores
#[derive(Error, Debug)]
pub enum Error {
    /// The backing store could not be reached or answered with a failure
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store answered, but with data we cannot interpret
    #[error("malformed stored value: {0}")]
    Corrupt(String),
}

/// A terminated streak, persisted when a submission breaks the count
///
/// Attempts are append-only; ranking queries (outside this crate) read
/// them to build leaderboards.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    /// The counter value the streak reached before it broke
    pub final_value: i64,
    /// The user whose submission ended the streak, if known
    pub user_id: Option<UserId>,
    /// When the streak ended
    pub created_at: DateTime<Utc>,
}

/// The derived lifecycle state of the game
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameState {
    /// The game has not started yet
    NotStarted,
    /// The game is running and accepting submissions
    Ongoing,
    /// The target has been reached; the game is permanently over
    Ended,
}

/// The durable game status singleton
///
/// The transition to ended is one-way and happens at most once; see
/// [`StatusStore::end_game`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GameStatus {
    /// When the game opened for submissions, if scheduled
    pub started_at: Option<DateTime<Utc>>,
    /// When the target was reached, if it has been
    pub ended_at: Option<DateTime<Utc>>,
    /// The identity that submitted the final count, if known
    pub winner_id: Option<UserId>,
}

impl GameStatus {
    /// Whether the game has permanently ended
    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Derives the lifecycle state at a given instant
    ///
    /// # Arguments
    ///
    /// * `now` - The instant to evaluate the status at
    pub fn state(&self, now: DateTime<Utc>) -> GameState {
        if self.ended_at.is_some() {
            GameState::Ended
        } else {
            match self.started_at {
                Some(started_at) if started_at <= now => GameState::Ongoing,
                _ => GameState::NotStarted,
            }
        }
    }
}

/// Contract for the durable counter
///
/// `commit_advance` must behave as a single atomic compare-and-swap per
/// logical counter: for a given prior value, at most one concurrent caller
/// may win, and a loser must never overwrite the winner's value.
pub trait CounterStore: Send + Sync {
    /// Reads the current accepted count
    fn read_current(&self) -> impl Future<Output = Result<i64, Error>> + Send;

    /// Atomically advances the counter from `expected_prior` to `new_value`
    ///
    /// # Arguments
    ///
    /// * `expected_prior` - The value the caller read before deciding to advance
    /// * `new_value` - The submitted value, `expected_prior + 1`
    ///
    /// # Returns
    ///
    /// `Ok(true)` if this call performed the advance, `Ok(false)` if the
    /// counter had already moved on and the submission is stale.
    fn commit_advance(
        &self,
        expected_prior: i64,
        new_value: i64,
    ) -> impl Future<Output = Result<bool, Error>> + Send;

    /// Resets the counter after a broken streak and persists the attempt
    ///
    /// The counter becomes `1` and a closed [`Attempt`] carrying the
    /// terminated streak's peak value is appended, attributed to the
    /// submitting identity if known.
    ///
    /// # Arguments
    ///
    /// * `prior_streak` - The counter value the streak had reached
    /// * `identity` - The identity whose submission broke the streak
    fn record_failure_and_reset(
        &self,
        prior_streak: i64,
        identity: &Identity,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Reads the highest count ever committed
    fn high_score(&self) -> impl Future<Output = Result<i64, Error>> + Send;
}

/// Contract for the durable game status singleton
pub trait StatusStore: Send + Sync {
    /// Reads the current game status
    fn status(&self) -> impl Future<Output = Result<GameStatus, Error>> + Send;

    /// Performs the one-way transition to the ended state
    ///
    /// The transition happens at most once; later calls (for example from a
    /// racing late-accepted advance) must leave the recorded winner and
    /// timestamp untouched.
    ///
    /// # Arguments
    ///
    /// * `winner` - The identity that submitted the final count
    ///
    /// # Returns
    ///
    /// `Ok(true)` if this call performed the transition, `Ok(false)` if the
    /// game had already ended.
    fn end_game(&self, winner: &Identity) -> impl Future<Output = Result<bool, Error>> + Send;
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    #[test]
    fn test_game_state_not_started_without_timestamp() {
        let status = GameStatus::default();
        assert_eq!(status.state(Utc::now()), GameState::NotStarted);
        assert!(!status.is_ended());
    }

    #[test]
    fn test_game_state_not_started_before_scheduled_start() {
        let now = Utc::now();
        let status = GameStatus {
            started_at: Some(now + TimeDelta::hours(1)),
            ..GameStatus::default()
        };
        assert_eq!(status.state(now), GameState::NotStarted);
    }

    #[test]
    fn test_game_state_ongoing_once_started() {
        let now = Utc::now();
        let status = GameStatus {
            started_at: Some(now - TimeDelta::hours(1)),
            ..GameStatus::default()
        };
        assert_eq!(status.state(now), GameState::Ongoing);
    }

    #[test]
    fn test_game_state_ended_wins_over_started() {
        let now = Utc::now();
        let status = GameStatus {
            started_at: Some(now - TimeDelta::hours(1)),
            ended_at: Some(now),
            winner_id: None,
        };
        assert_eq!(status.state(now), GameState::Ended);
        assert!(status.is_ended());
    }

    #[test]
    fn test_attempt_serialization_skips_missing_user() {
        let attempt = Attempt {
            final_value: 42,
            user_id: None,
            created_at: Utc::now(),
        };

        let json = serde_json::to_string(&attempt).unwrap();
        assert!(!json.contains("user_id"));

        let round_trip: Attempt = serde_json::from_str(&json).unwrap();
        assert_eq!(round_trip, attempt);
    }
}
