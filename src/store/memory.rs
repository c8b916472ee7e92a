//! In-process store implementation
//!
//! Backs single-instance deployments and the test suite. All operations
//! run under one mutex, which trivially satisfies the atomicity contract
//! of [`CounterStore::commit_advance`].

use std::sync::{Arc, Mutex};

use chrono::Utc;

use super::{Attempt, CounterStore, Error, GameStatus, StatusStore};
use crate::watcher::Identity;

/// State shared by all clones of a [`MemoryStore`]
#[derive(Debug)]
struct Inner {
    value: i64,
    high_score: i64,
    attempts: Vec<Attempt>,
    status: GameStatus,
}

/// In-memory counter and game status store
///
/// Clones share the same underlying state, mirroring how every connection
/// of a real deployment talks to the same database.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Creates a fresh store with the counter at zero and the game started
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                value: 0,
                high_score: 0,
                attempts: Vec::new(),
                status: GameStatus {
                    started_at: Some(Utc::now()),
                    ended_at: None,
                    winner_id: None,
                },
            })),
        }
    }

    /// Returns all persisted attempts, oldest first
    ///
    /// Ranking collaborators read terminated streaks through this; tests
    /// use it to assert the break side effects.
    pub fn attempts(&self) -> Vec<Attempt> {
        self.inner.lock().expect("store mutex poisoned").attempts.clone()
    }
}

impl Default for MemoryStore {
    /// Creates a fresh store (same as `new()`)
    fn default() -> Self {
        Self::new()
    }
}

impl CounterStore for MemoryStore {
    async fn read_current(&self) -> Result<i64, Error> {
        Ok(self.inner.lock().expect("store mutex poisoned").value)
    }

    async fn commit_advance(&self, expected_prior: i64, new_value: i64) -> Result<bool, Error> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");

        if inner.value != expected_prior {
            return Ok(false);
        }

        inner.value = new_value;
        inner.high_score = inner.high_score.max(new_value);

        Ok(true)
    }

    async fn record_failure_and_reset(
        &self,
        prior_streak: i64,
        identity: &Identity,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");

        inner.attempts.push(Attempt {
            final_value: prior_streak,
            user_id: identity.user_id(),
            created_at: Utc::now(),
        });
        inner.value = 1;

        Ok(())
    }

    async fn high_score(&self) -> Result<i64, Error> {
        Ok(self.inner.lock().expect("store mutex poisoned").high_score)
    }
}

impl StatusStore for MemoryStore {
    async fn status(&self) -> Result<GameStatus, Error> {
        Ok(self.inner.lock().expect("store mutex poisoned").status)
    }

    async fn end_game(&self, winner: &Identity) -> Result<bool, Error> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");

        if inner.status.ended_at.is_some() {
            return Ok(false);
        }

        inner.status.ended_at = Some(Utc::now());
        inner.status.winner_id = winner.user_id();

        Ok(true)
    }
}
