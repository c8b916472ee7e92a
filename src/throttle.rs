//! Verification throttle state machine
//!
//! Every session starts unverified and must pass a proof-of-humanity
//! challenge before its submissions reach the counter. Each processed
//! submission is counted, and once the configured threshold is reached the
//! session falls back to unverified and has to pass the challenge again.

/// Per-session verification state
///
/// The throttle has two states, `Unverified` and `Verified`, represented by
/// the `verified` flag. The submission counter resets to zero exactly on
/// every transition into the verified state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttle {
    /// Whether the session has a currently valid verification
    verified: bool,
    /// Submissions processed since the last successful verification
    submissions_since_verification: u32,
}

impl Default for Throttle {
    /// Creates a throttle in its initial, unverified state
    fn default() -> Self {
        Self::new()
    }
}

impl Throttle {
    /// Creates a throttle in its initial state
    ///
    /// Sessions start unverified, so the very first submission is rejected
    /// until a challenge token has been validated.
    pub fn new() -> Self {
        Self {
            verified: false,
            submissions_since_verification: 0,
        }
    }

    /// Whether submissions from this session may reach the arbiter
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    /// Number of submissions processed since the last verification
    pub fn submissions_since_verification(&self) -> u32 {
        self.submissions_since_verification
    }

    /// Records a successful verification
    ///
    /// Transitions into the verified state and resets the submission
    /// counter to zero.
    pub fn pass_verification(&mut self) {
        self.verified = true;
        self.submissions_since_verification = 0;
    }

    /// Records a failed or unreachable verification attempt
    ///
    /// The session stays (or returns to) unverified; the submission counter
    /// is left untouched.
    pub fn fail_verification(&mut self) {
        self.verified = false;
    }

    /// Records one processed submission
    ///
    /// # Arguments
    ///
    /// * `threshold` - Number of submissions allowed between verifications
    ///
    /// # Returns
    ///
    /// `true` when this submission crossed the threshold, meaning the
    /// session just dropped back to unverified and must re-verify before
    /// submitting again.
    pub fn record_submission(&mut self, threshold: u32) -> bool {
        self.submissions_since_verification += 1;

        if self.submissions_since_verification >= threshold {
            self.verified = false;
            self.submissions_since_verification = 0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_unverified() {
        let throttle = Throttle::new();
        assert!(!throttle.is_verified());
        assert_eq!(throttle.submissions_since_verification(), 0);
    }

    #[test]
    fn test_pass_verification_resets_counter() {
        let mut throttle = Throttle::new();
        throttle.pass_verification();
        assert!(!throttle.record_submission(5));
        assert_eq!(throttle.submissions_since_verification(), 1);

        throttle.pass_verification();
        assert!(throttle.is_verified());
        assert_eq!(throttle.submissions_since_verification(), 0);
    }

    #[test]
    fn test_fail_verification_returns_to_unverified() {
        let mut throttle = Throttle::new();
        throttle.pass_verification();
        throttle.fail_verification();
        assert!(!throttle.is_verified());
    }

    #[test]
    fn test_threshold_forces_reverification() {
        let mut throttle = Throttle::new();
        throttle.pass_verification();

        assert!(!throttle.record_submission(3));
        assert!(!throttle.record_submission(3));
        // Third submission crosses the threshold.
        assert!(throttle.record_submission(3));

        assert!(!throttle.is_verified());
        assert_eq!(throttle.submissions_since_verification(), 0);
    }

    #[test]
    fn test_threshold_of_one_flips_immediately() {
        let mut throttle = Throttle::new();
        throttle.pass_verification();
        assert!(throttle.record_submission(1));
        assert!(!throttle.is_verified());
    }
}
