// SPDX-License-Identifier: MIT
//
// GateKeeper: Remotely-Controlled Firewall Gatekeeper
//
// https://github.com/gatekeeper-fw/gatekeeper

//! Cryptographic primitives for the control channel
//!
//! All symmetric encryption is AES-256-CBC with PKCS#7 padding. Key
//! derivation is PBKDF2 over HMAC-SHA256. The fixed IV constants must match
//! bit-for-bit between peers; they are embedded here with their canonical
//! base64 spellings alongside.

use crate::{Error, Result};
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256, Sha512};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES-256 key length in octets
pub const AES_KEY_LEN: usize = 32;

/// AES block / IV length in octets
pub const AES_IV_LEN: usize = 16;

/// PBKDF2 iteration count for static key derivation
pub const STATIC_KEY_ITERATIONS: u32 = 100_000;

/// Label prefixed to the access key before hashing
pub const ACCESS_KEY_LABEL: &str = "GateKeeper.accessKey:";

/// Sentinel substituted for the empty plaintext on the wire
pub const EMPTY_SENTINEL: &[u8] = b"\r\n";

/// Fixed IV "A" (base64 `HqgZTw7dj1w1lT2t/6qK9Q==`)
pub const IV_A: [u8; 16] = [
    0x1e, 0xa8, 0x19, 0x4f, 0x0e, 0xdd, 0x8f, 0x5c, 0x35, 0x95, 0x3d, 0xad, 0xff, 0xaa, 0x8a, 0xf5,
];

/// Fixed IV "B" (base64 `EII5Psj91EB0drW5C/Xpxg==`)
pub const IV_B: [u8; 16] = [
    0x10, 0x82, 0x39, 0x3e, 0xc8, 0xfd, 0xd4, 0x40, 0x74, 0x76, 0xb5, 0xb9, 0x0b, 0xf5, 0xe9, 0xc6,
];

/// Session-key-wrap salt IV (base64 `2aYrIaRnlZZCSbxDtXlG/g==`)
pub const IV_WRAP: [u8; 16] = [
    0xd9, 0xa6, 0x2b, 0x21, 0xa4, 0x67, 0x95, 0x96, 0x42, 0x49, 0xbc, 0x43, 0xb5, 0x79, 0x46, 0xfe,
];

/// Derive a key with PBKDF2 over HMAC-SHA256
pub fn derive_key(password: &[u8], salt: &[u8], iterations: u32, key_len: usize) -> Vec<u8> {
    let mut key = vec![0u8; key_len];
    pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut key);
    key
}

/// SHA-256 digest
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// SHA-512 digest
pub fn sha512(data: &[u8]) -> [u8; 64] {
    Sha512::digest(data).into()
}

/// Hash the access key for the login proof.
///
/// The base digest is SHA-512 applied twice over the labeled key. When a
/// session key has been established, it is folded in with one more round so
/// the proof is bound to the connection.
pub fn hash_access_key(access_key: &str, session_key: Option<&[u8]>) -> [u8; 64] {
    let mut pre = Vec::with_capacity(ACCESS_KEY_LABEL.len() + access_key.len());
    pre.extend_from_slice(ACCESS_KEY_LABEL.as_bytes());
    pre.extend_from_slice(&latin1_bytes_lossy(access_key));
    let digest = sha512(&sha512(&pre));
    match session_key {
        Some(key) => {
            let mut bound = Vec::with_capacity(digest.len() + key.len());
            bound.extend_from_slice(&digest);
            bound.extend_from_slice(key);
            sha512(&bound)
        }
        None => digest,
    }
}

/// Encrypt raw octets under AES-256-CBC with PKCS#7 padding
pub fn encrypt_bytes(key: &[u8], iv: &[u8; AES_IV_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256CbcEnc::new_from_slices(key, iv)
        .map_err(|e| Error::Crypto(format!("Invalid key or IV length: {}", e)))?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// Decrypt raw octets; any cipher or padding error is reported as a
/// decryption failure without leaking partial plaintext
pub fn decrypt_bytes(key: &[u8], iv: &[u8; AES_IV_LEN], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|e| Error::Crypto(format!("Invalid key or IV length: {}", e)))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| Error::Crypto("Decryption failed".to_string()))
}

/// Encrypt a text message to base64 ciphertext.
///
/// Empty plaintexts are replaced on the wire by the `"\r\n"` sentinel and
/// restored to empty on decrypt.
pub fn encrypt_text(key: &[u8], iv: &[u8; AES_IV_LEN], msg: &str) -> Result<String> {
    let plain = if msg.is_empty() {
        EMPTY_SENTINEL.to_vec()
    } else {
        latin1_bytes(msg)?
    };
    let ct = encrypt_bytes(key, iv, &plain)?;
    Ok(encode_base64(&ct))
}

/// Decrypt a base64 ciphertext back to a text message
pub fn decrypt_text(key: &[u8], iv: &[u8; AES_IV_LEN], enc: &str) -> Result<String> {
    let ct = decode_base64(enc.trim())?;
    let plain = decrypt_bytes(key, iv, &ct)?;
    if plain == EMPTY_SENTINEL {
        return Ok(String::new());
    }
    Ok(latin1_string(&plain))
}

/// Fill `n` octets from the operating system CSPRNG
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Generate a random AES key of exactly 32 octets, or 32 plus a uniform
/// slack below `slack_len` (receivers truncate to 32 after decryption)
pub fn random_aes_key(slack_len: Option<usize>) -> Vec<u8> {
    let extra = match slack_len {
        Some(slack) if slack > 0 => OsRng.gen_range(0..slack),
        _ => 0,
    };
    random_bytes(AES_KEY_LEN + extra)
}

/// Encode octets as standard base64
pub fn encode_base64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// Decode standard base64 into octets
pub fn decode_base64(s: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| Error::Crypto(format!("Invalid base64: {}", e)))
}

/// Convert text to its Latin-1 octets; code points above U+00FF are rejected
pub fn latin1_bytes(s: &str) -> Result<Vec<u8>> {
    s.chars()
        .map(|c| {
            let cp = c as u32;
            if cp <= 0xFF {
                Ok(cp as u8)
            } else {
                Err(Error::Malformed(format!(
                    "Code point U+{:04X} outside Latin-1",
                    cp
                )))
            }
        })
        .collect()
}

/// Interpret octets as Latin-1 text (every byte maps to one code point)
pub fn latin1_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn latin1_bytes_lossy(s: &str) -> Vec<u8> {
    s.chars().map(|c| (c as u32).min(0xFF) as u8).collect()
}
