//! Redis-backed store implementation
//!
//! Used when more than one server instance shares the counter. The
//! compare-and-commit and reset operations run as Lua scripts, so the
//! read-check-write sequence executes atomically on the redis side no
//! matter how many instances race on it.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use redis::{
    AsyncCommands, Client, Script,
    aio::{ConnectionManager, ConnectionManagerConfig},
};

use super::{Attempt, CounterStore, Error, GameStatus, StatusStore};
use crate::watcher::{Identity, UserId};

/// Key holding the current accepted count
const KEY_COUNTER: &str = "tally:counter";
/// Key holding the highest count ever committed
const KEY_HIGH_SCORE: &str = "tally:high-score";
/// List of terminated streaks, as JSON rows
const KEY_ATTEMPTS: &str = "tally:attempts";
/// Key holding the game start timestamp
const KEY_STARTED_AT: &str = "tally:started-at";
/// Key holding the game end timestamp, absent while the game is running
const KEY_ENDED_AT: &str = "tally:ended-at";
/// Key holding the winning user id, if the winner was authenticated
const KEY_WINNER: &str = "tally:winner";

/// Atomic advance: commit only if the counter still has the expected value
const ADVANCE_SCRIPT: &str = r"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current ~= tonumber(ARGV[1]) then
  return 0
end
redis.call('SET', KEYS[1], ARGV[2])
local high = tonumber(redis.call('GET', KEYS[2]) or '0')
if tonumber(ARGV[2]) > high then
  redis.call('SET', KEYS[2], ARGV[2])
end
return 1
";

/// Atomic reset: record the terminated streak and restart the counter at 1
const RESET_SCRIPT: &str = r"
redis.call('SET', KEYS[1], '1')
redis.call('RPUSH', KEYS[2], ARGV[1])
return 1
";

/// One-way game end: first caller wins, later callers change nothing
const END_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('SET', KEYS[1], ARGV[1])
if ARGV[2] ~= '' then
  redis.call('SET', KEYS[2], ARGV[2])
end
return 1
";

/// Counter and game status store backed by a shared redis instance
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    advance: Arc<Script>,
    reset: Arc<Script>,
    end: Arc<Script>,
}

impl From<redis::RedisError> for Error {
    /// Maps any redis failure to the store's unavailable error
    fn from(error: redis::RedisError) -> Self {
        Error::Unavailable(error.to_string())
    }
}

impl RedisStore {
    /// Connects to redis and prepares the store
    ///
    /// Marks the game as started if no start timestamp has been recorded
    /// yet.
    ///
    /// # Arguments
    ///
    /// * `url` - Redis connection URL
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unavailable`] if the connection cannot be
    /// established.
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let config = ConnectionManagerConfig::new()
            .set_number_of_retries(1)
            .set_connection_timeout(Duration::from_millis(100));

        let client = Client::open(url)?;
        let mut connection = client.get_connection_manager_with_config(config).await?;

        let _: bool = connection
            .set_nx(KEY_STARTED_AT, Utc::now().to_rfc3339())
            .await?;

        Ok(Self {
            connection,
            advance: Arc::new(Script::new(ADVANCE_SCRIPT)),
            reset: Arc::new(Script::new(RESET_SCRIPT)),
            end: Arc::new(Script::new(END_SCRIPT)),
        })
    }

    /// Returns a handle to the underlying connection
    ///
    /// The cross-process broadcast publisher reuses it instead of opening
    /// a second connection pool.
    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

/// Parses an RFC 3339 timestamp stored by this crate
fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, Error> {
    DateTime::parse_from_rfc3339(value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|error| Error::Corrupt(format!("bad timestamp {value:?}: {error}")))
}

impl CounterStore for RedisStore {
    async fn read_current(&self) -> Result<i64, Error> {
        let mut connection = self.connection.clone();
        let value: Option<i64> = connection.get(KEY_COUNTER).await?;
        Ok(value.unwrap_or(0))
    }

    async fn commit_advance(&self, expected_prior: i64, new_value: i64) -> Result<bool, Error> {
        let mut connection = self.connection.clone();

        let committed: i64 = self
            .advance
            .key(KEY_COUNTER)
            .key(KEY_HIGH_SCORE)
            .arg(expected_prior)
            .arg(new_value)
            .invoke_async(&mut connection)
            .await?;

        Ok(committed == 1)
    }

    async fn record_failure_and_reset(
        &self,
        prior_streak: i64,
        identity: &Identity,
    ) -> Result<(), Error> {
        let attempt = Attempt {
            final_value: prior_streak,
            user_id: identity.user_id(),
            created_at: Utc::now(),
        };
        let row = serde_json::to_string(&attempt).expect("default serializer cannot fail");

        let mut connection = self.connection.clone();
        let _: i64 = self
            .reset
            .key(KEY_COUNTER)
            .key(KEY_ATTEMPTS)
            .arg(row)
            .invoke_async(&mut connection)
            .await?;

        Ok(())
    }

    async fn high_score(&self) -> Result<i64, Error> {
        let mut connection = self.connection.clone();
        let value: Option<i64> = connection.get(KEY_HIGH_SCORE).await?;
        Ok(value.unwrap_or(0))
    }
}

impl StatusStore for RedisStore {
    async fn status(&self) -> Result<GameStatus, Error> {
        let mut connection = self.connection.clone();

        let started_at: Option<String> = connection.get(KEY_STARTED_AT).await?;
        let ended_at: Option<String> = connection.get(KEY_ENDED_AT).await?;
        let winner: Option<String> = connection.get(KEY_WINNER).await?;

        Ok(GameStatus {
            started_at: started_at.as_deref().map(parse_timestamp).transpose()?,
            ended_at: ended_at.as_deref().map(parse_timestamp).transpose()?,
            winner_id: winner
                .as_deref()
                .map(|raw| {
                    raw.parse::<UserId>()
                        .map_err(|error| Error::Corrupt(format!("bad winner id {raw:?}: {error}")))
                })
                .transpose()?,
        })
    }

    async fn end_game(&self, winner: &Identity) -> Result<bool, Error> {
        let winner_id = winner
            .user_id()
            .map(|user_id| user_id.to_string())
            .unwrap_or_default();

        let mut connection = self.connection.clone();
        let ended: i64 = self
            .end
            .key(KEY_ENDED_AT)
            .key(KEY_WINNER)
            .arg(Utc::now().to_rfc3339())
            .arg(winner_id)
            .invoke_async(&mut connection)
            .await?;

        Ok(ended == 1)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timestamp_round_trip() {
        let now = Utc::now();
        let parsed = parse_timestamp(&now.to_rfc3339()).unwrap();
        assert_eq!(parsed, now);
    }

    #[test]
    fn test_parse_timestamp_rejects_garbage() {
        assert!(matches!(
            parse_timestamp("not a timestamp"),
            Err(Error::Corrupt(_))
        ));
    }
}
