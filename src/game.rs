//! Core game logic and counter arbitration
//!
//! This module contains the main game struct and logic for running a
//! cooperative counting game: admitting sessions, gating submissions
//! behind the verification throttle, arbitrating each submitted value
//! against the durable counter, fanning out state changes to all
//! connected viewers, and performing the one-way game-over transition.

use garde::Validate;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::{
    constants,
    session::Tunnel,
    store::{CounterStore, StatusStore},
    verify::VerificationGate,
    watcher::{self, Id, Identity, Value, Watchers},
};

/// Global configuration options for the game
///
/// These options control when the game ends and how aggressively
/// submissions are throttled between proof-of-humanity checks.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Validate)]
pub struct Options {
    /// Counter value that permanently ends the game once reached
    #[garde(range(min = 1))]
    target: i64,
    /// Processed submissions allowed before re-verification is forced
    #[garde(range(min = 1, max = constants::throttle::MAX_THRESHOLD))]
    verification_threshold: u32,
}

impl Default for Options {
    /// Default options: count to a million, re-verify every 5 submissions
    fn default() -> Self {
        Self {
            target: constants::game::DEFAULT_TARGET,
            verification_threshold: constants::throttle::DEFAULT_MAX_SUBMISSIONS,
        }
    }
}

impl Options {
    /// Creates options with the given target and throttle threshold
    ///
    /// # Arguments
    ///
    /// * `target` - Counter value that ends the game
    /// * `verification_threshold` - Submissions allowed between verifications
    pub fn new(target: i64, verification_threshold: u32) -> Self {
        Self {
            target,
            verification_threshold,
        }
    }

    /// The counter value that ends the game
    pub fn target(&self) -> i64 {
        self.target
    }
}

/// Messages received from connected clients
///
/// One JSON object per frame, dispatched by its `type` tag. Frames that do
/// not deserialize into this enum are malformed and ignored by the caller.
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum IncomingMessage {
    /// Request the current state snapshot
    Initial,
    /// Submit the next candidate count
    UpdateCount {
        /// The candidate value, expected to be exactly one above the
        /// current count
        value: i64,
    },
    /// Submit a proof-of-humanity challenge token
    Verify {
        /// Token produced by the challenge widget
        token: String,
    },
}

/// Update messages sent to viewers about game state changes
///
/// These messages inform viewers about changes that affect their view of
/// the shared counter.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum UpdateMessage {
    /// The counter advanced to a new value
    CountUpdated {
        /// The newly accepted count
        value: i64,
    },
    /// A submission broke the streak
    Failed {
        /// The bad submission that ended the streak
        value: i64,
    },
    /// The throttle engaged; the session must pass the challenge again
    VerificationRequired,
    /// The submitted challenge token was accepted
    Verified,
    /// The number of live viewers changed
    UserCount {
        /// The new live-connection count
        value: usize,
    },
    /// The target was reached; the game is permanently over
    GameOver,
}

/// Sync messages sent to viewers to synchronize their view with game state
///
/// Sent when a viewer connects or explicitly asks for the current state.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SyncMessage {
    /// Post-connect snapshot of the shared state
    Initial {
        /// The current accepted count
        value: i64,
        /// The highest count ever committed
        high_score: i64,
        /// The number of live viewers
        user_count: usize,
    },
}

impl UpdateMessage {
    /// Converts the update message to a JSON string for transmission
    ///
    /// # Panics
    ///
    /// This method panics if serialization fails, which should never happen
    /// with the default JSON serializer for well-formed data.
    pub fn to_message(&self) -> String {
        serde_json::to_string(self).expect("default serializer cannot fail")
    }
}

impl SyncMessage {
    /// Converts the sync message to a JSON string for transmission
    ///
    /// # Panics
    ///
    /// This method panics if serialization fails, which should never happen
    /// with the default JSON serializer for well-formed data.
    pub fn to_message(&self) -> String {
        serde_json::to_string(self).expect("default serializer cannot fail")
    }
}

/// Outcome of admitting a new connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The session is registered and will receive further updates
    Active,
    /// The game is already over; the snapshot and `game-over` were sent
    /// and the connection should be closed
    GameOver,
}

/// The main game struct
///
/// Holds the registry of live viewers and the terminal flag. Everything
/// durable lives behind the store contracts, which are passed into each
/// call together with the tunnel finder, keeping the game itself
/// transport-agnostic.
#[derive(Debug, Default)]
pub struct Game {
    /// Manager for all connected viewers
    pub watchers: Watchers,
    /// Game configuration options
    options: Options,
    /// Terminal flag, set once the target has been reached anywhere
    ended: bool,
}

impl Game {
    /// Creates a new game with the provided options
    ///
    /// # Arguments
    ///
    /// * `options` - Game configuration (target, throttle threshold)
    pub fn new(options: Options) -> Self {
        Self {
            watchers: Watchers::new(),
            options,
            ended: false,
        }
    }

    /// The options this game was created with
    pub fn options(&self) -> Options {
        self.options
    }

    /// Whether the game has permanently ended
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Marks the game as ended without emitting anything
    ///
    /// Used when the terminal state is learned from the outside: from the
    /// durable status at startup, or from another instance's `game-over`
    /// broadcast.
    pub fn mark_ended(&mut self) {
        self.ended = true;
    }

    /// Admits a freshly authenticated connection
    ///
    /// Sends the state snapshot, registers the session, and announces the
    /// new viewer count. If the game is already over the session is not
    /// registered: it receives the snapshot and a `game-over` event, and
    /// the caller should close the connection.
    ///
    /// # Arguments
    ///
    /// * `watcher_id` - Unique ID for the new connection
    /// * `identity` - Identity resolved during the handshake
    /// * `store` - Durable counter store for the snapshot
    /// * `tunnel_finder` - Function to find tunnels for connections
    ///
    /// # Errors
    ///
    /// Returns `watcher::Error` if the connection limit is reached.
    pub async fn add_session<T, F, S>(
        &mut self,
        watcher_id: Id,
        identity: Identity,
        store: &S,
        tunnel_finder: F,
    ) -> Result<Admission, watcher::Error>
    where
        T: Tunnel,
        F: Fn(Id) -> Option<T>,
        S: CounterStore,
    {
        if self.ended {
            self.send_initial(watcher_id, store, &tunnel_finder).await;
            self.watchers
                .send_message(&UpdateMessage::GameOver, watcher_id, &tunnel_finder);
            return Ok(Admission::GameOver);
        }

        self.watchers.add_watcher(watcher_id, Value::new(identity))?;
        self.send_initial(watcher_id, store, &tunnel_finder).await;
        self.announce_user_count(&tunnel_finder);

        Ok(Admission::Active)
    }

    /// Removes a disconnected session and announces the new viewer count
    ///
    /// No durable side effect: per-connection state does not survive a
    /// disconnect.
    ///
    /// # Arguments
    ///
    /// * `watcher_id` - The connection that went away
    /// * `tunnel_finder` - Function to find tunnels for connections
    pub fn remove_session<T, F>(&mut self, watcher_id: Id, tunnel_finder: F)
    where
        T: Tunnel,
        F: Fn(Id) -> Option<T>,
    {
        if self.watchers.remove_watcher(watcher_id) {
            self.announce_user_count(&tunnel_finder);
        }
    }

    /// Handles an incoming message from a connected client
    ///
    /// Messages from unknown connections are dropped. The caller is
    /// expected to process one message per connection to completion before
    /// reading the next, so per-session handling is strictly sequential.
    ///
    /// # Arguments
    ///
    /// * `watcher_id` - ID of the connection the message arrived on
    /// * `message` - The incoming message to process
    /// * `store` - Durable counter and game status store
    /// * `gate` - Proof-of-humanity verifier
    /// * `publish` - Hook invoked for every broadcast event, used to
    ///   forward committed events to other server instances
    /// * `tunnel_finder` - Function to find tunnels for connections
    pub async fn receive_message<T, F, S, G, P>(
        &mut self,
        watcher_id: Id,
        message: IncomingMessage,
        store: &S,
        gate: &G,
        publish: P,
        tunnel_finder: F,
    ) where
        T: Tunnel,
        F: Fn(Id) -> Option<T>,
        S: CounterStore + StatusStore,
        G: VerificationGate,
        P: FnMut(&UpdateMessage),
    {
        match message {
            IncomingMessage::Initial => {
                self.send_initial(watcher_id, store, &tunnel_finder).await;
            }
            IncomingMessage::Verify { token } => {
                self.handle_verification(watcher_id, &token, gate, &tunnel_finder)
                    .await;
            }
            IncomingMessage::UpdateCount { value } => {
                self.handle_submission(watcher_id, value, store, publish, &tunnel_finder)
                    .await;
            }
        }
    }

    /// Applies a broadcast event produced by another server instance
    ///
    /// The event is fanned out to all local viewers; a foreign `game-over`
    /// also flips the local terminal flag so further submissions are
    /// refused here as well.
    ///
    /// # Arguments
    ///
    /// * `event` - The event received over the cross-process channel
    /// * `tunnel_finder` - Function to find tunnels for connections
    pub fn apply_remote<T, F>(&mut self, event: &UpdateMessage, tunnel_finder: F)
    where
        T: Tunnel,
        F: Fn(Id) -> Option<T>,
    {
        if matches!(event, UpdateMessage::GameOver) {
            self.ended = true;
        }

        self.watchers.announce(event, tunnel_finder);
    }

    /// Sends the current state snapshot to one viewer
    async fn send_initial<T, F, S>(&self, watcher_id: Id, store: &S, tunnel_finder: F)
    where
        T: Tunnel,
        F: Fn(Id) -> Option<T>,
        S: CounterStore,
    {
        let (value, high_score) = match (store.read_current().await, store.high_score().await) {
            (Ok(value), Ok(high_score)) => (value, high_score),
            (Err(error), _) | (_, Err(error)) => {
                error!("cannot read counter snapshot: {error}");
                return;
            }
        };

        self.watchers.send_state(
            &SyncMessage::Initial {
                value,
                high_score,
                user_count: self.watchers.connection_count(),
            },
            watcher_id,
            tunnel_finder,
        );
    }

    /// Validates a challenge token and updates the session's throttle
    async fn handle_verification<T, F, G>(
        &mut self,
        watcher_id: Id,
        token: &str,
        gate: &G,
        tunnel_finder: F,
    ) where
        T: Tunnel,
        F: Fn(Id) -> Option<T>,
        G: VerificationGate,
    {
        let Some(mut value) = self.watchers.get_watcher_value(watcher_id) else {
            return;
        };

        if gate.verify(token).await {
            value.throttle.pass_verification();
            self.watchers.update_watcher_value(watcher_id, value);
            self.watchers
                .send_message(&UpdateMessage::Verified, watcher_id, tunnel_finder);
        } else {
            value.throttle.fail_verification();
            self.watchers.update_watcher_value(watcher_id, value);
            self.watchers.send_message(
                &UpdateMessage::VerificationRequired,
                watcher_id,
                tunnel_finder,
            );
        }
    }

    /// Arbitrates one submitted count against the durable counter
    ///
    /// This is the only code path that mutates the counter. The decision
    /// is made on a fresh read; the commit itself is the store's atomic
    /// compare-and-swap, so concurrent submissions of the same value have
    /// exactly one winner and losers are silently superseded.
    async fn handle_submission<T, F, S, P>(
        &mut self,
        watcher_id: Id,
        submitted: i64,
        store: &S,
        mut publish: P,
        tunnel_finder: F,
    ) where
        T: Tunnel,
        F: Fn(Id) -> Option<T>,
        S: CounterStore + StatusStore,
        P: FnMut(&UpdateMessage),
    {
        let Some(value) = self.watchers.get_watcher_value(watcher_id) else {
            return;
        };

        if self.ended {
            self.watchers
                .send_message(&UpdateMessage::GameOver, watcher_id, &tunnel_finder);
            return;
        }

        if !value.throttle.is_verified() {
            self.watchers.send_message(
                &UpdateMessage::VerificationRequired,
                watcher_id,
                &tunnel_finder,
            );
            return;
        }

        let current = match store.read_current().await {
            Ok(current) => current,
            Err(error) => {
                error!("counter store unavailable: {error}");
                return;
            }
        };

        if submitted != current + 1 {
            // Break: the streak ends, the counter restarts at 1.
            if let Err(error) = store
                .record_failure_and_reset(current, &value.identity)
                .await
            {
                error!("cannot reset counter: {error}");
                return;
            }

            self.broadcast(
                &UpdateMessage::Failed { value: submitted },
                &mut publish,
                &tunnel_finder,
            );
            self.broadcast(
                &UpdateMessage::CountUpdated { value: 1 },
                &mut publish,
                &tunnel_finder,
            );
        } else {
            match store.commit_advance(current, submitted).await {
                Err(error) => {
                    error!("cannot advance counter: {error}");
                    return;
                }
                Ok(false) => {
                    // Lost the race against a concurrent submission; the
                    // winner's broadcast is authoritative.
                    debug!("stale submission of {submitted} superseded");
                }
                Ok(true) => {
                    self.broadcast(
                        &UpdateMessage::CountUpdated { value: submitted },
                        &mut publish,
                        &tunnel_finder,
                    );

                    if submitted >= self.options.target {
                        self.end_game(&value.identity, store, &mut publish, &tunnel_finder)
                            .await;
                    }
                }
            }
        }

        self.note_submission(watcher_id, value, &tunnel_finder);
    }

    /// Performs the one-way transition into the terminal state
    async fn end_game<T, F, S, P>(
        &mut self,
        winner: &Identity,
        store: &S,
        publish: &mut P,
        tunnel_finder: F,
    ) where
        T: Tunnel,
        F: Fn(Id) -> Option<T>,
        S: StatusStore,
        P: FnMut(&UpdateMessage),
    {
        match store.end_game(winner).await {
            Ok(true) => {
                self.ended = true;
                self.broadcast(&UpdateMessage::GameOver, publish, &tunnel_finder);
            }
            Ok(false) => {
                // Another instance got there first; its broadcast carries
                // the announcement.
                self.ended = true;
            }
            Err(error) => {
                error!("cannot record game end: {error}");
            }
        }
    }

    /// Counts one processed submission against the session's throttle
    fn note_submission<T, F>(&mut self, watcher_id: Id, mut value: Value, tunnel_finder: F)
    where
        T: Tunnel,
        F: Fn(Id) -> Option<T>,
    {
        if value
            .throttle
            .record_submission(self.options.verification_threshold)
        {
            self.watchers.send_message(
                &UpdateMessage::VerificationRequired,
                watcher_id,
                tunnel_finder,
            );
        }

        self.watchers.update_watcher_value(watcher_id, value);
    }

    /// Sends an event to every local viewer and to the publish hook
    fn broadcast<T, F, P>(&self, message: &UpdateMessage, publish: &mut P, tunnel_finder: F)
    where
        T: Tunnel,
        F: Fn(Id) -> Option<T>,
        P: FnMut(&UpdateMessage),
    {
        publish(message);
        self.watchers.announce(message, tunnel_finder);
    }

    /// Announces the current live-connection count to every viewer
    fn announce_user_count<T, F>(&self, tunnel_finder: F)
    where
        T: Tunnel,
        F: Fn(Id) -> Option<T>,
    {
        self.watchers.announce(
            &UpdateMessage::UserCount {
                value: self.watchers.connection_count(),
            },
            tunnel_finder,
        );
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::{cell::RefCell, collections::HashMap, rc::Rc};

    use crate::store::{Error, memory::MemoryStore};
    use crate::watcher::UserId;

    use super::*;

    #[derive(Debug, Clone, Default)]
    struct MockTunnel {
        messages: Rc<RefCell<Vec<UpdateMessage>>>,
        states: Rc<RefCell<Vec<SyncMessage>>>,
    }

    impl MockTunnel {
        fn messages(&self) -> Vec<UpdateMessage> {
            self.messages.borrow().clone()
        }
    }

    impl Tunnel for MockTunnel {
        fn send_message(&self, message: &UpdateMessage) {
            self.messages.borrow_mut().push(message.clone());
        }

        fn send_state(&self, state: &SyncMessage) {
            self.states.borrow_mut().push(state.clone());
        }

        fn close(self) {}
    }

    struct AcceptAllGate;

    impl VerificationGate for AcceptAllGate {
        async fn verify(&self, _token: &str) -> bool {
            true
        }
    }

    struct RejectAllGate;

    impl VerificationGate for RejectAllGate {
        async fn verify(&self, _token: &str) -> bool {
            false
        }
    }

    /// Store whose compare-and-swap always loses, simulating a submission
    /// that raced against a faster one.
    #[derive(Clone)]
    struct LosingStore(MemoryStore);

    impl CounterStore for LosingStore {
        async fn read_current(&self) -> Result<i64, Error> {
            self.0.read_current().await
        }

        async fn commit_advance(&self, _expected_prior: i64, _new_value: i64) -> Result<bool, Error> {
            Ok(false)
        }

        async fn record_failure_and_reset(
            &self,
            prior_streak: i64,
            identity: &Identity,
        ) -> Result<(), Error> {
            self.0.record_failure_and_reset(prior_streak, identity).await
        }

        async fn high_score(&self) -> Result<i64, Error> {
            self.0.high_score().await
        }
    }

    impl StatusStore for LosingStore {
        async fn status(&self) -> Result<crate::store::GameStatus, Error> {
            self.0.status().await
        }

        async fn end_game(&self, winner: &Identity) -> Result<bool, Error> {
            self.0.end_game(winner).await
        }
    }

    fn options(target: i64, verification_threshold: u32) -> Options {
        Options::new(target, verification_threshold)
    }

    async fn connect(
        game: &mut Game,
        store: &MemoryStore,
        tunnels: &mut HashMap<Id, MockTunnel>,
    ) -> Id {
        let id = Id::new();
        tunnels.insert(id, MockTunnel::default());
        game.add_session(id, Identity::Anonymous, store, |i| tunnels.get(&i).cloned())
            .await
            .unwrap();
        id
    }

    async fn verify(game: &mut Game, tunnels: &HashMap<Id, MockTunnel>, id: Id, store: &MemoryStore) {
        game.receive_message(
            id,
            IncomingMessage::Verify {
                token: "token".to_owned(),
            },
            store,
            &AcceptAllGate,
            |_: &UpdateMessage| {},
            |i| tunnels.get(&i).cloned(),
        )
        .await;
    }

    async fn submit(
        game: &mut Game,
        tunnels: &HashMap<Id, MockTunnel>,
        id: Id,
        store: &MemoryStore,
        value: i64,
    ) {
        game.receive_message(
            id,
            IncomingMessage::UpdateCount { value },
            store,
            &AcceptAllGate,
            |_: &UpdateMessage| {},
            |i| tunnels.get(&i).cloned(),
        )
        .await;
    }

    #[tokio::test]
    async fn test_options_validation() {
        assert!(Options::default().validate().is_ok());
        assert!(options(0, 5).validate().is_err());
        assert!(options(100, 0).validate().is_err());
        assert!(
            options(100, crate::constants::throttle::MAX_THRESHOLD + 1)
                .validate()
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_initial_snapshot_on_connect() {
        let mut game = Game::new(Options::default());
        let store = MemoryStore::new();
        let mut tunnels = HashMap::new();

        let id = connect(&mut game, &store, &mut tunnels).await;

        let states = tunnels[&id].states.borrow().clone();
        assert_eq!(
            states,
            vec![SyncMessage::Initial {
                value: 0,
                high_score: 0,
                user_count: 1,
            }]
        );
        // Joining also announces the new viewer count.
        assert_eq!(
            tunnels[&id].messages(),
            vec![UpdateMessage::UserCount { value: 1 }]
        );
    }

    #[tokio::test]
    async fn test_user_count_announced_on_join_and_leave() {
        let mut game = Game::new(Options::default());
        let store = MemoryStore::new();
        let mut tunnels = HashMap::new();

        let first = connect(&mut game, &store, &mut tunnels).await;
        let second = connect(&mut game, &store, &mut tunnels).await;

        assert_eq!(
            tunnels[&first].messages(),
            vec![
                UpdateMessage::UserCount { value: 1 },
                UpdateMessage::UserCount { value: 2 },
            ]
        );

        // The departed viewer is gone; the remaining one sees the new count.
        game.remove_session(first, |i| tunnels.get(&i).cloned());
        assert_eq!(
            tunnels[&second].messages().last(),
            Some(&UpdateMessage::UserCount { value: 1 })
        );
    }

    #[tokio::test]
    async fn test_unverified_submission_never_reaches_the_counter() {
        let mut game = Game::new(Options::default());
        let store = MemoryStore::new();
        let mut tunnels = HashMap::new();

        let id = connect(&mut game, &store, &mut tunnels).await;
        submit(&mut game, &tunnels, id, &store, 1).await;

        assert_eq!(
            tunnels[&id].messages().last(),
            Some(&UpdateMessage::VerificationRequired)
        );
        assert_eq!(store.read_current().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_verification_success_and_failure() {
        let mut game = Game::new(Options::default());
        let store = MemoryStore::new();
        let mut tunnels = HashMap::new();

        let id = connect(&mut game, &store, &mut tunnels).await;

        game.receive_message(
            id,
            IncomingMessage::Verify {
                token: "bad".to_owned(),
            },
            &store,
            &RejectAllGate,
            |_: &UpdateMessage| {},
            |i| tunnels.get(&i).cloned(),
        )
        .await;
        assert_eq!(
            tunnels[&id].messages().last(),
            Some(&UpdateMessage::VerificationRequired)
        );

        verify(&mut game, &tunnels, id, &store).await;
        assert_eq!(
            tunnels[&id].messages().last(),
            Some(&UpdateMessage::Verified)
        );
        assert!(
            game.watchers
                .get_watcher_value(id)
                .unwrap()
                .throttle
                .is_verified()
        );
    }

    #[tokio::test]
    async fn test_sequential_advances_never_fail() {
        let mut game = Game::new(options(1_000, 100));
        let store = MemoryStore::new();
        let mut tunnels = HashMap::new();

        let id = connect(&mut game, &store, &mut tunnels).await;
        verify(&mut game, &tunnels, id, &store).await;

        for value in 1..=5 {
            submit(&mut game, &tunnels, id, &store, value).await;
        }

        assert_eq!(store.read_current().await.unwrap(), 5);
        let messages = tunnels[&id].messages();
        assert!(
            !messages
                .iter()
                .any(|message| matches!(message, UpdateMessage::Failed { .. }))
        );
        for value in 1..=5 {
            assert!(messages.contains(&UpdateMessage::CountUpdated { value }));
        }
    }

    #[tokio::test]
    async fn test_break_resets_and_is_broadcast_to_everyone() {
        let mut game = Game::new(options(1_000, 100));
        let store = MemoryStore::new();
        let mut tunnels = HashMap::new();

        let submitter = connect(&mut game, &store, &mut tunnels).await;
        let viewer = connect(&mut game, &store, &mut tunnels).await;
        verify(&mut game, &tunnels, submitter, &store).await;

        for value in 1..=5 {
            submit(&mut game, &tunnels, submitter, &store, value).await;
        }
        submit(&mut game, &tunnels, submitter, &store, 7).await;

        assert_eq!(store.read_current().await.unwrap(), 1);

        let attempts = store.attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].final_value, 5);

        // Both the submitter and the bystander see the break and the reset,
        // in that order.
        for id in [submitter, viewer] {
            let messages = tunnels[&id].messages();
            let failed_position = messages
                .iter()
                .position(|message| *message == UpdateMessage::Failed { value: 7 })
                .unwrap();
            assert_eq!(
                messages[failed_position + 1],
                UpdateMessage::CountUpdated { value: 1 }
            );
        }
    }

    #[tokio::test]
    async fn test_negative_submission_breaks_the_streak() {
        let mut game = Game::new(options(1_000, 100));
        let store = MemoryStore::new();
        let mut tunnels = HashMap::new();

        let id = connect(&mut game, &store, &mut tunnels).await;
        verify(&mut game, &tunnels, id, &store).await;

        submit(&mut game, &tunnels, id, &store, -3).await;

        assert_eq!(store.read_current().await.unwrap(), 1);
        assert!(
            tunnels[&id]
                .messages()
                .contains(&UpdateMessage::Failed { value: -3 })
        );
    }

    #[tokio::test]
    async fn test_stale_submission_is_silently_superseded() {
        let mut game = Game::new(options(1_000, 100));
        let store = MemoryStore::new();
        let losing = LosingStore(store.clone());
        let mut tunnels = HashMap::new();

        let id = connect(&mut game, &store, &mut tunnels).await;
        verify(&mut game, &tunnels, id, &store).await;
        let before = tunnels[&id].messages();

        game.receive_message(
            id,
            IncomingMessage::UpdateCount { value: 1 },
            &losing,
            &AcceptAllGate,
            |_: &UpdateMessage| {},
            |i| tunnels.get(&i).cloned(),
        )
        .await;

        // No error, no event: the winner's broadcast is authoritative.
        assert_eq!(tunnels[&id].messages(), before);
        // The submission still counted toward the throttle.
        assert_eq!(
            game.watchers
                .get_watcher_value(id)
                .unwrap()
                .throttle
                .submissions_since_verification(),
            1
        );
    }

    #[tokio::test]
    async fn test_throttle_threshold_forces_reverification() {
        let mut game = Game::new(options(1_000, 3));
        let store = MemoryStore::new();
        let mut tunnels = HashMap::new();

        let id = connect(&mut game, &store, &mut tunnels).await;
        verify(&mut game, &tunnels, id, &store).await;

        for value in 1..=3 {
            submit(&mut game, &tunnels, id, &store, value).await;
        }

        // The third submission crossed the threshold.
        assert_eq!(
            tunnels[&id].messages().last(),
            Some(&UpdateMessage::VerificationRequired)
        );

        // The fourth submission is rejected outright and never reaches the
        // counter.
        submit(&mut game, &tunnels, id, &store, 4).await;
        assert_eq!(store.read_current().await.unwrap(), 3);
        assert_eq!(
            tunnels[&id].messages().last(),
            Some(&UpdateMessage::VerificationRequired)
        );

        // Re-verifying resets the submission counter and unblocks.
        verify(&mut game, &tunnels, id, &store).await;
        assert_eq!(
            game.watchers
                .get_watcher_value(id)
                .unwrap()
                .throttle
                .submissions_since_verification(),
            0
        );
        submit(&mut game, &tunnels, id, &store, 4).await;
        assert_eq!(store.read_current().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_reaching_target_ends_the_game() {
        let mut game = Game::new(options(3, 100));
        let store = MemoryStore::new();
        let mut tunnels = HashMap::new();

        let submitter = connect(&mut game, &store, &mut tunnels).await;
        let viewer = connect(&mut game, &store, &mut tunnels).await;
        verify(&mut game, &tunnels, submitter, &store).await;

        let published = Rc::new(RefCell::new(Vec::new()));
        for value in 1..=3 {
            let published = published.clone();
            game.receive_message(
                submitter,
                IncomingMessage::UpdateCount { value },
                &store,
                &AcceptAllGate,
                move |event: &UpdateMessage| published.borrow_mut().push(event.clone()),
                |i| tunnels.get(&i).cloned(),
            )
            .await;
        }

        assert!(game.is_ended());

        let status = store.status().await.unwrap();
        assert!(status.is_ended());
        // The submitter was anonymous, so no winner id is recorded.
        assert_eq!(status.winner_id, None);

        // Everyone sees the final count followed by the game-over event.
        for id in [submitter, viewer] {
            let messages = tunnels[&id].messages();
            let final_position = messages
                .iter()
                .position(|message| *message == UpdateMessage::CountUpdated { value: 3 })
                .unwrap();
            assert!(
                messages[final_position + 1..].contains(&UpdateMessage::GameOver)
            );
        }

        // Committed events also went out on the cross-process channel.
        assert!(
            published
                .borrow()
                .contains(&UpdateMessage::CountUpdated { value: 3 })
        );
        assert!(published.borrow().contains(&UpdateMessage::GameOver));
    }

    #[tokio::test]
    async fn test_winner_identity_is_recorded() {
        let mut game = Game::new(options(1, 100));
        let store = MemoryStore::new();
        let mut tunnels = HashMap::new();

        let id = Id::new();
        let user_id = UserId::new();
        tunnels.insert(id, MockTunnel::default());
        game.add_session(id, Identity::User(user_id), &store, |i| {
            tunnels.get(&i).cloned()
        })
        .await
        .unwrap();
        verify(&mut game, &tunnels, id, &store).await;

        submit(&mut game, &tunnels, id, &store, 1).await;

        assert_eq!(store.status().await.unwrap().winner_id, Some(user_id));
    }

    #[tokio::test]
    async fn test_no_processing_after_game_over() {
        let mut game = Game::new(options(2, 100));
        let store = MemoryStore::new();
        let mut tunnels = HashMap::new();

        let id = connect(&mut game, &store, &mut tunnels).await;
        verify(&mut game, &tunnels, id, &store).await;

        submit(&mut game, &tunnels, id, &store, 1).await;
        submit(&mut game, &tunnels, id, &store, 2).await;
        assert!(game.is_ended());

        let ended_at = store.status().await.unwrap().ended_at;

        submit(&mut game, &tunnels, id, &store, 3).await;

        // The counter did not move and the terminal state is untouched.
        assert_eq!(store.read_current().await.unwrap(), 2);
        assert_eq!(store.status().await.unwrap().ended_at, ended_at);
        assert_eq!(
            tunnels[&id].messages().last(),
            Some(&UpdateMessage::GameOver)
        );
    }

    #[tokio::test]
    async fn test_connection_after_game_over_is_refused() {
        let mut game = Game::new(options(1, 100));
        let store = MemoryStore::new();
        let mut tunnels = HashMap::new();

        let id = connect(&mut game, &store, &mut tunnels).await;
        verify(&mut game, &tunnels, id, &store).await;
        submit(&mut game, &tunnels, id, &store, 1).await;

        let late = Id::new();
        tunnels.insert(late, MockTunnel::default());
        let admission = game
            .add_session(late, Identity::Anonymous, &store, |i| {
                tunnels.get(&i).cloned()
            })
            .await
            .unwrap();

        assert_eq!(admission, Admission::GameOver);
        assert!(!game.watchers.has_watcher(late));
        // The latecomer still receives the snapshot and the verdict.
        assert_eq!(tunnels[&late].states.borrow().len(), 1);
        assert_eq!(
            tunnels[&late].messages(),
            vec![UpdateMessage::GameOver]
        );
    }

    #[tokio::test]
    async fn test_remote_game_over_marks_local_game_ended() {
        let mut game = Game::new(Options::default());
        let store = MemoryStore::new();
        let mut tunnels = HashMap::new();

        let id = connect(&mut game, &store, &mut tunnels).await;

        game.apply_remote(&UpdateMessage::GameOver, |i| tunnels.get(&i).cloned());

        assert!(game.is_ended());
        assert_eq!(
            tunnels[&id].messages().last(),
            Some(&UpdateMessage::GameOver)
        );
    }

    #[tokio::test]
    async fn test_remote_count_update_is_fanned_out() {
        let mut game = Game::new(Options::default());
        let store = MemoryStore::new();
        let mut tunnels = HashMap::new();

        let id = connect(&mut game, &store, &mut tunnels).await;

        game.apply_remote(&UpdateMessage::CountUpdated { value: 42 }, |i| {
            tunnels.get(&i).cloned()
        });

        assert!(!game.is_ended());
        assert_eq!(
            tunnels[&id].messages().last(),
            Some(&UpdateMessage::CountUpdated { value: 42 })
        );
    }

    #[test]
    fn test_incoming_message_wire_format() {
        assert!(matches!(
            serde_json::from_str::<IncomingMessage>(r#"{"type":"initial"}"#).unwrap(),
            IncomingMessage::Initial
        ));
        assert!(matches!(
            serde_json::from_str::<IncomingMessage>(r#"{"type":"update-count","value":7}"#)
                .unwrap(),
            IncomingMessage::UpdateCount { value: 7 }
        ));
        assert!(matches!(
            serde_json::from_str::<IncomingMessage>(r#"{"type":"verify","token":"abc"}"#).unwrap(),
            IncomingMessage::Verify { .. }
        ));

        // Mistyped fields are malformed, not breaks.
        assert!(
            serde_json::from_str::<IncomingMessage>(r#"{"type":"update-count","value":"7"}"#)
                .is_err()
        );
        assert!(serde_json::from_str::<IncomingMessage>(r#"{"type":"unknown"}"#).is_err());
    }

    #[test]
    fn test_outgoing_message_wire_format() {
        assert_eq!(
            UpdateMessage::CountUpdated { value: 5 }.to_message(),
            r#"{"type":"count-updated","value":5}"#
        );
        assert_eq!(
            UpdateMessage::Failed { value: 7 }.to_message(),
            r#"{"type":"failed","value":7}"#
        );
        assert_eq!(
            UpdateMessage::VerificationRequired.to_message(),
            r#"{"type":"verification-required"}"#
        );
        assert_eq!(
            UpdateMessage::UserCount { value: 3 }.to_message(),
            r#"{"type":"user-count","value":3}"#
        );
        assert_eq!(UpdateMessage::GameOver.to_message(), r#"{"type":"game-over"}"#);
        assert_eq!(
            SyncMessage::Initial {
                value: 10,
                high_score: 20,
                user_count: 2,
            }
            .to_message(),
            r#"{"type":"initial","value":10,"highScore":20,"userCount":2}"#
        );
    }
}
