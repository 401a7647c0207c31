//! # Passphrase Gate
//!
//! Every connection has to present the session passphrase before it becomes a
//! member. The secret is only kept as a bcrypt hash; checks run on the
//! blocking pool so a slow hash never stalls other connections.
//!
//! Each connection walks its own small state machine:
//!
//! ```text
//! AwaitingPassphrase ──match──────────────► Accepted
//!         │
//!         └──mismatch (attempts used up)──► Rejected
//! ```
//!
//! A mismatch with attempts still left keeps the connection in
//! `AwaitingPassphrase`. Neither outcome touches the stroke log or the
//! broadcast hub; registering a member is the server's job once this says
//! `Accepted`.

use std::sync::Arc;

use tracing::warn;

use crate::error::{Error, Result};

/// bcrypt only reads the first 72 bytes of its input.
pub const MAX_PASSPHRASE_LEN: usize = 72;

/// Where one connection stands in the join handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    AwaitingPassphrase,
    Accepted,
    Rejected,
}

/// Holds the session secret and hands out per-connection attempts.
#[derive(Clone)]
pub struct AuthGate {
    hash: Arc<String>,
    max_attempts: u32,
}

impl AuthGate {
    /// Hashes `passphrase` at the given bcrypt cost. A connection may guess
    /// at most `max_attempts` times (at least once) before it is rejected.
    pub fn new(passphrase: &str, cost: u32, max_attempts: u32) -> Result<Self> {
        if passphrase.is_empty() {
            return Err(Error::Passphrase("passphrase is empty".to_string()));
        }
        if passphrase.len() > MAX_PASSPHRASE_LEN {
            return Err(Error::Passphrase(format!(
                "passphrase is {} bytes, the limit is {MAX_PASSPHRASE_LEN}",
                passphrase.len()
            )));
        }
        let hash = bcrypt::hash(passphrase, cost)
            .map_err(|e| Error::Passphrase(format!("failed to hash passphrase: {e}")))?;
        Ok(Self {
            hash: Arc::new(hash),
            max_attempts: max_attempts.max(1),
        })
    }

    /// Exact comparison against the session secret.
    pub async fn verify(&self, supplied: &str) -> bool {
        // Anything past the limit would be silently truncated by bcrypt.
        if supplied.is_empty() || supplied.len() > MAX_PASSPHRASE_LEN {
            return false;
        }
        let hash = Arc::clone(&self.hash);
        let supplied = supplied.to_owned();
        match tokio::task::spawn_blocking(move || bcrypt::verify(supplied, &hash)).await {
            Ok(Ok(matched)) => matched,
            Ok(Err(e)) => {
                warn!("Passphrase verification failed: {}", e);
                false
            }
            Err(e) => {
                warn!("Passphrase verification task failed: {}", e);
                false
            }
        }
    }

    pub fn attempt(&self) -> AuthAttempt<'_> {
        AuthAttempt {
            gate: self,
            failures: 0,
            state: AuthState::AwaitingPassphrase,
        }
    }
}

/// One connection's progress through the handshake.
pub struct AuthAttempt<'a> {
    gate: &'a AuthGate,
    failures: u32,
    state: AuthState,
}

impl AuthAttempt<'_> {
    /// Checks one guess. Once the attempt reaches `Accepted` or `Rejected`
    /// further calls leave it there.
    pub async fn authenticate(&mut self, supplied: &str) -> AuthState {
        if self.state != AuthState::AwaitingPassphrase {
            return self.state;
        }
        if self.gate.verify(supplied).await {
            self.state = AuthState::Accepted;
        } else {
            self.failures += 1;
            if self.failures >= self.gate.max_attempts {
                self.state = AuthState::Rejected;
            }
        }
        self.state
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn attempts_left(&self) -> u32 {
        self.gate.max_attempts.saturating_sub(self.failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COST: u32 = 4;

    #[tokio::test]
    async fn exact_passphrase_is_accepted() {
        let gate = AuthGate::new("wisdom", COST, 1).unwrap();
        let mut attempt = gate.attempt();
        assert_eq!(attempt.authenticate("wisdom").await, AuthState::Accepted);
    }

    #[tokio::test]
    async fn near_miss_is_rejected() {
        let gate = AuthGate::new("wisdom", COST, 1).unwrap();
        let mut attempt = gate.attempt();
        assert_eq!(attempt.authenticate("wisdon").await, AuthState::Rejected);
        // Terminal: the right answer no longer helps.
        assert_eq!(attempt.authenticate("wisdom").await, AuthState::Rejected);
    }

    #[tokio::test]
    async fn comparison_is_verbatim() {
        let gate = AuthGate::new("Tinge-Latte-Rotunda", COST, 5).unwrap();
        assert!(!gate.verify("tinge-latte-rotunda").await);
        assert!(!gate.verify("Tinge-Latte-Rotunda ").await);
        assert!(!gate.verify("").await);
        assert!(gate.verify("Tinge-Latte-Rotunda").await);
    }

    #[tokio::test]
    async fn retries_until_attempts_run_out() {
        let gate = AuthGate::new("wisdom", COST, 3).unwrap();
        let mut attempt = gate.attempt();
        assert_eq!(attempt.authenticate("a").await, AuthState::AwaitingPassphrase);
        assert_eq!(attempt.attempts_left(), 2);
        assert_eq!(attempt.authenticate("b").await, AuthState::AwaitingPassphrase);
        assert_eq!(attempt.authenticate("c").await, AuthState::Rejected);
        assert_eq!(attempt.attempts_left(), 0);

        let mut second = gate.attempt();
        assert_eq!(second.authenticate("x").await, AuthState::AwaitingPassphrase);
        assert_eq!(second.authenticate("wisdom").await, AuthState::Accepted);
    }

    #[test]
    fn unusable_secrets_are_refused() {
        assert!(matches!(AuthGate::new("", COST, 1), Err(Error::Passphrase(_))));
        let long = "x".repeat(MAX_PASSPHRASE_LEN + 1);
        assert!(matches!(AuthGate::new(&long, COST, 1), Err(Error::Passphrase(_))));
    }

    #[tokio::test]
    async fn overlong_guess_never_matches_its_prefix() {
        let secret = "y".repeat(MAX_PASSPHRASE_LEN);
        let gate = AuthGate::new(&secret, COST, 1).unwrap();
        assert!(gate.verify(&secret).await);
        assert!(!gate.verify(&format!("{secret}z")).await);
    }
}
