//! Security guard primitives.
//!
//! - [`SecurityLog`]: sliding-window failure counter that decides when the
//!   sending identity must rotate
//! - [`PasswordGate`]: optional shared secret checked before the catalog is released
//! - [`AdmissionPolicy`]: inbound channel cap and room lock
//! - [`HumanCheck`]: arithmetic challenge after repeated unreachable connects
//! - [`check_chunk_payload`]: bound on chunk payload sizes

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Sliding time-window list of failure timestamps.
#[derive(Debug, Clone)]
pub struct SecurityLog {
    window: Duration,
    threshold: usize,
    failures: VecDeque<Instant>,
}

impl SecurityLog {
    /// Create a log that trips after `threshold` failures within `window`.
    #[must_use]
    pub fn new(window: Duration, threshold: usize) -> Self {
        Self {
            window,
            threshold: threshold.max(1),
            failures: VecDeque::new(),
        }
    }

    /// Record a qualifying failure at `now`.
    ///
    /// Entries older than the window are pruned first. Returns `true` when the
    /// surviving count reaches the threshold; the log is then emptied and the
    /// caller is expected to rotate its identity.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.failures.push_back(now);
        while let Some(&oldest) = self.failures.front() {
            if now.duration_since(oldest) >= self.window {
                self.failures.pop_front();
            } else {
                break;
            }
        }

        if self.failures.len() >= self.threshold {
            self.failures.clear();
            return true;
        }
        false
    }

    /// Number of failures currently inside the window.
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Whether no failures are recorded.
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Forget every recorded failure.
    pub fn reset(&mut self) {
        self.failures.clear();
    }
}

impl Default for SecurityLog {
    fn default() -> Self {
        Self::new(crate::SECURITY_WINDOW, crate::SECURITY_THRESHOLD)
    }
}

/// Generate a random alphanumeric password.
#[must_use]
pub fn generate_password(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Optional shared secret for one sending session.
#[derive(Clone, Default)]
pub struct PasswordGate {
    password: Option<String>,
}

impl PasswordGate {
    /// Gate that lets everyone through.
    #[must_use]
    pub const fn open() -> Self {
        Self { password: None }
    }

    /// Gate guarded by `password`.
    #[must_use]
    pub fn with_password(password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
        }
    }

    /// Gate guarded by a freshly generated password.
    #[must_use]
    pub fn generated() -> Self {
        Self::with_password(generate_password(crate::PASSWORD_LENGTH))
    }

    /// Whether a password must be supplied.
    pub fn is_required(&self) -> bool {
        self.password.is_some()
    }

    /// The password, for display to the sharing user.
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Check a candidate in time independent of where it first differs.
    pub fn verify(&self, candidate: &str) -> bool {
        let Some(expected) = self.password.as_deref() else {
            return true;
        };
        let (a, b) = (expected.as_bytes(), candidate.as_bytes());
        if a.len() != b.len() {
            return false;
        }
        a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }
}

impl fmt::Debug for PasswordGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordGate")
            .field("required", &self.is_required())
            .finish()
    }
}

/// Why an inbound channel was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The room is locked
    Locked,
    /// The pool is at its admission cap
    CapacityReached,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Locked => f.write_str("room is locked"),
            Self::CapacityReached => f.write_str("connection limit reached"),
        }
    }
}

/// Admission control for inbound channels.
#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    cap: usize,
    locked: bool,
}

impl AdmissionPolicy {
    /// Policy admitting up to `parallel + slack` channels.
    #[must_use]
    pub const fn new(parallel: usize, slack: usize) -> Self {
        Self {
            cap: parallel + slack,
            locked: false,
        }
    }

    /// Maximum number of pooled channels.
    pub const fn cap(&self) -> usize {
        self.cap
    }

    /// Decide whether one more channel may join a pool of `current` channels.
    ///
    /// # Errors
    ///
    /// Returns the [`Rejection`] reason when the channel must be closed.
    pub const fn admit(&self, current: usize) -> std::result::Result<(), Rejection> {
        if self.locked {
            return Err(Rejection::Locked);
        }
        if current >= self.cap {
            return Err(Rejection::CapacityReached);
        }
        Ok(())
    }

    /// Refuse every new inbound channel.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    /// Accept new inbound channels again.
    pub fn unlock(&mut self) {
        self.locked = false;
    }

    /// Whether the room is locked.
    pub const fn is_locked(&self) -> bool {
        self.locked
    }
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self::new(crate::DEFAULT_PARALLEL_CHANNELS, crate::CHANNEL_SLACK)
    }
}

/// Simple arithmetic challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    a: u8,
    b: u8,
}

impl Challenge {
    fn random() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            a: rng.gen_range(0..10),
            b: rng.gen_range(0..10),
        }
    }

    /// Question text, e.g. `"3 + 4"`.
    #[must_use]
    pub fn question(&self) -> String {
        format!("{} + {}", self.a, self.b)
    }

    fn answer(&self) -> u8 {
        self.a + self.b
    }
}

/// Outgoing-connect throttle for automated code enumeration.
#[derive(Debug, Clone)]
pub struct HumanCheck {
    threshold: u32,
    failures: u32,
    challenge: Option<Challenge>,
}

impl HumanCheck {
    /// Require a challenge after `threshold` unreachable results.
    #[must_use]
    pub const fn new(threshold: u32) -> Self {
        Self {
            threshold,
            failures: 0,
            challenge: None,
        }
    }

    /// Fail if a challenge is pending.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HumanCheckRequired`] while a challenge is unsolved.
    pub fn ensure_clear(&self) -> Result<()> {
        if self.challenge.is_some() {
            return Err(Error::HumanCheckRequired);
        }
        Ok(())
    }

    /// Count one unreachable connect attempt.
    ///
    /// Returns the challenge once the threshold is reached.
    pub fn record_unreachable(&mut self) -> Option<&Challenge> {
        self.failures += 1;
        if self.failures >= self.threshold && self.challenge.is_none() {
            self.challenge = Some(Challenge::random());
        }
        self.challenge.as_ref()
    }

    /// A connect attempt reached the peer; the unreachable streak ends.
    pub fn record_success(&mut self) {
        if self.challenge.is_none() {
            self.failures = 0;
        }
    }

    /// Pending challenge, if any.
    pub const fn challenge(&self) -> Option<&Challenge> {
        self.challenge.as_ref()
    }

    /// Unreachable attempts counted so far.
    pub const fn failures(&self) -> u32 {
        self.failures
    }

    /// Answer the pending challenge.
    ///
    /// A correct answer clears the challenge and the failure count. A wrong
    /// answer replaces the challenge with a new one. Returns whether
    /// connecting is allowed afterwards.
    pub fn solve(&mut self, answer: &str) -> bool {
        let Some(challenge) = &self.challenge else {
            return true;
        };

        if answer.trim().parse::<u8>().ok() == Some(challenge.answer()) {
            self.challenge = None;
            self.failures = 0;
            true
        } else {
            self.challenge = Some(Challenge::random());
            false
        }
    }
}

impl Default for HumanCheck {
    fn default() -> Self {
        Self::new(crate::HUMAN_CHECK_THRESHOLD)
    }
}

/// Check a chunk payload against `chunk_size + slack`.
///
/// # Errors
///
/// Returns [`Error::PayloadTooLarge`] for oversized payloads.
pub fn check_chunk_payload(len: usize, chunk_size: usize) -> Result<()> {
    let limit = chunk_size + crate::CHUNK_PAYLOAD_SLACK;
    if len > limit {
        return Err(Error::PayloadTooLarge { size: len, limit });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_log_trips_at_threshold() {
        let mut log = SecurityLog::new(Duration::from_secs(60), 5);
        let start = Instant::now();

        for i in 0..4 {
            assert!(!log.record_failure(start + Duration::from_secs(i)));
        }
        assert_eq!(log.len(), 4);

        assert!(log.record_failure(start + Duration::from_secs(4)));
        assert!(log.is_empty());
    }

    #[test]
    fn test_security_log_prunes_old_entries() {
        let mut log = SecurityLog::new(Duration::from_secs(60), 5);
        let start = Instant::now();

        for i in 0..4 {
            log.record_failure(start + Duration::from_secs(i));
        }

        // The first four fall out of the window before the fifth arrives.
        assert!(!log.record_failure(start + Duration::from_secs(70)));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_password_generation() {
        let password = generate_password(8);
        assert_eq!(password.len(), 8);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(password, generate_password(8));
    }

    #[test]
    fn test_password_gate() {
        let gate = PasswordGate::with_password("s3cretAB");
        assert!(gate.is_required());
        assert!(gate.verify("s3cretAB"));
        assert!(!gate.verify("s3cretAb"));
        assert!(!gate.verify("s3cret"));
        assert!(!gate.verify(""));

        let open = PasswordGate::open();
        assert!(!open.is_required());
        assert!(open.verify("anything"));
    }

    #[test]
    fn test_password_not_in_debug_output() {
        let gate = PasswordGate::with_password("hunter22");
        assert!(!format!("{gate:?}").contains("hunter22"));
    }

    #[test]
    fn test_admission_cap_and_lock() {
        let mut policy = AdmissionPolicy::new(5, 2);
        assert_eq!(policy.cap(), 7);
        assert!(policy.admit(6).is_ok());
        assert_eq!(policy.admit(7), Err(Rejection::CapacityReached));

        policy.lock();
        assert_eq!(policy.admit(0), Err(Rejection::Locked));

        policy.unlock();
        assert!(policy.admit(0).is_ok());
    }

    #[test]
    fn test_human_check_flow() {
        let mut check = HumanCheck::new(3);
        assert!(check.ensure_clear().is_ok());

        assert!(check.record_unreachable().is_none());
        assert!(check.record_unreachable().is_none());
        let question = check
            .record_unreachable()
            .map(Challenge::question)
            .expect("challenge after third failure");
        assert!(question.contains(" + "));
        assert!(matches!(
            check.ensure_clear(),
            Err(Error::HumanCheckRequired)
        ));

        assert!(!check.solve("not a number"));
        assert!(check.ensure_clear().is_err());

        let answer = check.challenge().expect("challenge").answer().to_string();
        assert!(check.solve(&answer));
        assert!(check.ensure_clear().is_ok());
        assert_eq!(check.failures(), 0);
    }

    #[test]
    fn test_chunk_payload_bound() {
        assert!(check_chunk_payload(65_536, 65_536).is_ok());
        assert!(check_chunk_payload(65_536 + 4096, 65_536).is_ok());
        assert!(matches!(
            check_chunk_payload(65_536 + 4097, 65_536),
            Err(Error::PayloadTooLarge { .. })
        ));
    }
}
