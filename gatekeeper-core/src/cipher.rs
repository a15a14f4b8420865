// SPDX-License-Identifier: MIT
//
// GateKeeper: Remotely-Controlled Firewall Gatekeeper
//
// https://github.com/gatekeeper-fw/gatekeeper

//! Static and salt-chained symmetric message channels
//!
//! Two layers secure the control channel. The static layer is keyed from the
//! shared access key and wraps the exchange and session keys. The chained
//! layer encrypts every message after the exchange under the session key,
//! with a per-message IV (salt) both peers derive independently from a seed
//! pair and a monotonic index, so no IV ever travels on the wire.
//!
//! Both peers must agree on `seed1` (the server's listening port; the client
//! uses the remote port of its socket) and `seed2` (the current UTC midnight
//! in milliseconds). A session that crosses UTC midnight therefore produces
//! diverging salt sequences; this matches the peer protocol and is not
//! mitigated here.

use crate::crypto::{
    self, AES_IV_LEN, AES_KEY_LEN, IV_A, IV_B, IV_WRAP, STATIC_KEY_ITERATIONS,
};
use crate::{Error, Result};

/// PBKDF2 iteration count for the first chained salt
const CHAIN_BASE_ITERATIONS: u32 = 1000;

/// PBKDF2 iteration count for the session-key-wrap IV
const WRAP_IV_ITERATIONS: u32 = 10_000;

/// Milliseconds in one UTC day
const DAY_MILLIS: i64 = 86_400_000;

/// Current UTC midnight in milliseconds since the epoch (`seed2`)
pub fn utc_day_millis() -> i64 {
    let now = chrono::Utc::now().timestamp_millis();
    now - now.rem_euclid(DAY_MILLIS)
}

/// Derive the static AES key from the access key.
///
/// Deterministic for the life of the process; never transmitted.
pub fn static_key_from_access_key(access_key: &str) -> Result<[u8; AES_KEY_LEN]> {
    let password = crypto::latin1_bytes(access_key)?;
    let key = crypto::derive_key(&password, &IV_A, STATIC_KEY_ITERATIONS, AES_KEY_LEN);
    let mut out = [0u8; AES_KEY_LEN];
    out.copy_from_slice(&key);
    Ok(out)
}

/// Derive the AES-CBC IV used to wrap the exchange and session keys.
///
/// Keyed by the UTC day so both peers recompute it without transmission.
pub fn session_wrap_iv(day_millis: i64) -> [u8; AES_IV_LEN] {
    let password = format!("session.salt:{}", day_millis);
    let iv = crypto::derive_key(password.as_bytes(), &IV_WRAP, WRAP_IV_ITERATIONS, AES_IV_LEN);
    let mut out = [0u8; AES_IV_LEN];
    out.copy_from_slice(&iv);
    out
}

/// Deterministic per-message salt schedule.
///
/// A pure value type: two schedules constructed from the same seed pair
/// produce bit-identical salt sequences for index 0, 1, 2, ...
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaltSchedule {
    seed1: u16,
    seed2: i64,
    index: u64,
    salt: Option<[u8; AES_IV_LEN]>,
}

impl SaltSchedule {
    pub fn new(seed1: u16, seed2: i64) -> Self {
        Self {
            seed1,
            seed2,
            index: 0,
            salt: None,
        }
    }

    /// Number of salts produced so far
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Advance the schedule and return the next salt.
    ///
    /// The first salt mixes the fixed IVs directly; every later salt mixes
    /// them with the previous salt, and the index increments before the
    /// password material is assembled.
    pub fn next_salt(&mut self) -> [u8; AES_IV_LEN] {
        let (iv_mix, iterations, password) = match self.salt {
            None => {
                let mut mix = [0u8; AES_IV_LEN];
                for i in 0..AES_IV_LEN {
                    mix[i] = IV_A[i] ^ IV_B[i];
                }
                let password = format!(
                    "{}:{}:{}\n{}\n{}",
                    self.seed1,
                    self.seed2,
                    self.index,
                    csv(&IV_A),
                    csv(&IV_B)
                );
                (mix, CHAIN_BASE_ITERATIONS, password)
            }
            Some(prev) => {
                self.index += 1;
                let mut mix = [0u8; AES_IV_LEN];
                for i in 0..AES_IV_LEN {
                    mix[i] = prev[i].wrapping_mul(IV_A[i]) ^ prev[i].wrapping_mul(IV_B[i]);
                }
                let password = format!(
                    "{}:{}:{}\n{}\n{}\n{}",
                    self.seed1,
                    self.seed2,
                    self.index,
                    csv(&IV_A),
                    csv(&IV_B),
                    csv(&mix)
                );
                let iterations = CHAIN_BASE_ITERATIONS + self.index as u32;
                (mix, iterations, password)
            }
        };

        let digest = crypto::sha256(password.as_bytes());
        let derived = crypto::derive_key(&digest, &iv_mix, iterations, AES_IV_LEN);
        let mut salt = [0u8; AES_IV_LEN];
        salt.copy_from_slice(&derived);
        self.salt = Some(salt);
        salt
    }
}

/// Join unsigned byte decimals with commas
fn csv(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| b.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Salt-chained message cipher for one connection.
///
/// Owns the session key once the exchange completes. Every encrypt or
/// decrypt advances the schedule by exactly one salt, so strict
/// request/reply alternation keeps both peers in lockstep.
#[derive(Debug, Clone)]
pub struct ChainedCipher {
    schedule: SaltSchedule,
    session_key: Option<[u8; AES_KEY_LEN]>,
}

impl ChainedCipher {
    pub fn new(seed1: u16, seed2: i64) -> Self {
        Self {
            schedule: SaltSchedule::new(seed1, seed2),
            session_key: None,
        }
    }

    /// Install the session key produced by the exchange
    pub fn set_session_key(&mut self, key: [u8; AES_KEY_LEN]) {
        self.session_key = Some(key);
    }

    pub fn has_session_key(&self) -> bool {
        self.session_key.is_some()
    }

    pub fn session_key(&self) -> Option<&[u8; AES_KEY_LEN]> {
        self.session_key.as_ref()
    }

    /// Encrypt one message: advance the salt, then AES-CBC under the
    /// session key. Returns base64 ciphertext.
    pub fn encrypt_message(&mut self, msg: &str) -> Result<String> {
        let key = self
            .session_key
            .ok_or_else(|| Error::Crypto("No session key established".to_string()))?;
        let salt = self.schedule.next_salt();
        crypto::encrypt_text(&key, &salt, msg)
    }

    /// Decrypt one base64 message, advancing the salt first
    pub fn decrypt_message(&mut self, enc: &str) -> Result<String> {
        let key = self
            .session_key
            .ok_or_else(|| Error::Crypto("No session key established".to_string()))?;
        let salt = self.schedule.next_salt();
        crypto::decrypt_text(&key, &salt, enc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_salt_sequences_are_bit_identical() {
        let mut a = SaltSchedule::new(2243, 1_754_006_400_000);
        let mut b = SaltSchedule::new(2243, 1_754_006_400_000);
        for _ in 0..6 {
            assert_eq!(a.next_salt(), b.next_salt());
        }
        assert_eq!(a.index(), 5);
    }

    #[test]
    fn test_salts_vary_per_message_and_per_seed() {
        let mut a = SaltSchedule::new(2243, 1_754_006_400_000);
        let first = a.next_salt();
        let second = a.next_salt();
        assert_ne!(first, second);

        let mut other_port = SaltSchedule::new(2244, 1_754_006_400_000);
        assert_ne!(first, other_port.next_salt());

        let mut other_day = SaltSchedule::new(2243, 1_754_006_400_000 + 86_400_000);
        assert_ne!(first, other_day.next_salt());
    }

    #[test]
    fn test_index_increments_before_password_assembly() {
        let mut s = SaltSchedule::new(1, 2);
        s.next_salt();
        assert_eq!(s.index(), 0);
        s.next_salt();
        assert_eq!(s.index(), 1);
        s.next_salt();
        assert_eq!(s.index(), 2);
    }

    #[test]
    fn test_peers_stay_in_lockstep() {
        let key: [u8; 32] = core::array::from_fn(|i| i as u8);
        let mut server = ChainedCipher::new(2243, 1_754_006_400_000);
        let mut client = ChainedCipher::new(2243, 1_754_006_400_000);
        server.set_session_key(key);
        client.set_session_key(key);

        // Strict request/reply alternation
        for round in 0..4 {
            let request = format!("block {}", 2220 + round);
            let ct = client.encrypt_message(&request).unwrap();
            assert_eq!(server.decrypt_message(&ct).unwrap(), request);

            let reply = "block: true";
            let ct = server.encrypt_message(reply).unwrap();
            assert_eq!(client.decrypt_message(&ct).unwrap(), reply);
        }
    }

    #[test]
    fn test_empty_message_round_trips() {
        let key = [7u8; 32];
        let mut a = ChainedCipher::new(1, 1);
        let mut b = ChainedCipher::new(1, 1);
        a.set_session_key(key);
        b.set_session_key(key);
        let ct = a.encrypt_message("").unwrap();
        assert_eq!(b.decrypt_message(&ct).unwrap(), "");
    }

    #[test]
    fn test_encrypt_requires_session_key() {
        let mut cipher = ChainedCipher::new(1, 1);
        assert!(cipher.encrypt_message("hello").is_err());
        assert!(!cipher.has_session_key());
    }

    #[test]
    fn test_wrap_iv_is_deterministic_per_day() {
        let day = 1_754_006_400_000;
        assert_eq!(session_wrap_iv(day), session_wrap_iv(day));
        assert_ne!(session_wrap_iv(day), session_wrap_iv(day + 86_400_000));
    }

    #[test]
    fn test_static_key_is_deterministic() {
        let k1 = static_key_from_access_key("0123456789abcdefghijklmnopqrstuvwxyz").unwrap();
        let k2 = static_key_from_access_key("0123456789abcdefghijklmnopqrstuvwxyz").unwrap();
        assert_eq!(k1, k2);
        let k3 = static_key_from_access_key("zyxwvutsrqponmlkjihgfedcba9876543210").unwrap();
        assert_ne!(k1, k3);
    }

    #[test]
    fn test_utc_day_millis_is_midnight_aligned() {
        let day = utc_day_millis();
        assert_eq!(day % 86_400_000, 0);
    }
}
