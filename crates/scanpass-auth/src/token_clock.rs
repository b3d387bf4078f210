//! Time-windowed HMAC proof tokens
//!
//! A scanner that has read the QR secret proves it by sending
//! `HMAC-SHA256(secret, step)` truncated to 64 bits, where `step` is the
//! current epoch second. The server accepts the token if it matches any step
//! within a small window around the claimed time.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Width of one time step in seconds
pub const STEP_SECONDS: i64 = 1;

/// Steps accepted on either side of the claimed time
pub const DEFAULT_WINDOW: i64 = 2;

/// Token length in hex characters (64 bits)
pub const TOKEN_HEX_LEN: usize = 16;

/// Generates and verifies proof tokens from a shared secret.
///
/// Pure and stateless; safe to share across tasks.
#[derive(Debug, Clone, Copy)]
pub struct TokenClock {
    window: i64,
}

impl Default for TokenClock {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
        }
    }
}

impl TokenClock {
    /// Create a token clock accepting `window` steps on either side
    pub fn with_window(window: i64) -> Self {
        Self {
            window: window.max(0),
        }
    }

    pub fn window(&self) -> i64 {
        self.window
    }

    /// Token for the step containing `epoch_seconds`
    pub fn generate(secret: &[u8], epoch_seconds: i64) -> String {
        let step = epoch_seconds.div_euclid(STEP_SECONDS);
        // HMAC accepts keys of any length
        let mut mac = match HmacSha256::new_from_slice(secret) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(step.to_string().as_bytes());
        let digest = mac.finalize().into_bytes();
        hex::encode(&digest[..TOKEN_HEX_LEN / 2])
    }

    /// Check `token` against every step in `[claimed - window, claimed + window]`.
    ///
    /// Every candidate is computed and compared, so the work done does not
    /// depend on which step (if any) matched.
    pub fn verify(&self, secret: &[u8], token: &str, claimed_epoch_seconds: i64) -> bool {
        let token = token.as_bytes();
        let mut matched = subtle::Choice::from(0u8);

        for offset in -self.window..=self.window {
            let candidate = Self::generate(secret, claimed_epoch_seconds.saturating_add(offset));
            let candidate = candidate.as_bytes();
            if candidate.len() == token.len() {
                matched |= candidate.ct_eq(token);
            }
        }

        matched.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";
    const T: i64 = 1_717_000_000;

    #[test]
    fn test_token_format() {
        let token = TokenClock::generate(SECRET, T);
        assert_eq!(token.len(), TOKEN_HEX_LEN);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(token, TokenClock::generate(SECRET, T));
    }

    #[test]
    fn test_round_trip() {
        let clock = TokenClock::default();
        for t in [0, 1, T, T + 1, i64::MAX / 2] {
            let token = TokenClock::generate(SECRET, t);
            assert!(clock.verify(SECRET, &token, t));
        }
    }

    #[test]
    fn test_window_bounds() {
        let clock = TokenClock::default();
        let token = TokenClock::generate(SECRET, T);

        for d in -2..=2 {
            assert!(clock.verify(SECRET, &token, T + d), "offset {d} should pass");
        }
        assert!(!clock.verify(SECRET, &token, T + 3));
        assert!(!clock.verify(SECRET, &token, T - 3));
    }

    #[test]
    fn test_wrong_secret_or_garbage() {
        let clock = TokenClock::default();
        let token = TokenClock::generate(SECRET, T);

        assert!(!clock.verify(b"another secret", &token, T));
        assert!(!clock.verify(SECRET, "", T));
        assert!(!clock.verify(SECRET, &token[..8], T));
        assert!(!clock.verify(SECRET, "zzzzzzzzzzzzzzzz", T));
    }

    #[test]
    fn test_steps_differ() {
        assert_ne!(
            TokenClock::generate(SECRET, T),
            TokenClock::generate(SECRET, T + 1)
        );
    }

    #[test]
    fn test_zero_window() {
        let clock = TokenClock::with_window(0);
        let token = TokenClock::generate(SECRET, T);
        assert!(clock.verify(SECRET, &token, T));
        assert!(!clock.verify(SECRET, &token, T + 1));
    }
}
