//! Server greeting and the chap-sha1 scramble.
//!
//! On accept the server sends exactly 128 bytes: a 64-byte human-readable
//! banner line and a 64-byte salt line whose first 44 characters are the
//! base64 payload the scramble is derived from.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};

use crate::error::ProtocolError;

/// Total greeting size in bytes.
pub const GREETING_SIZE: usize = 128;
/// Length of each greeting line, newline included.
pub const GREETING_LINE_SIZE: usize = 64;
/// Number of base64 characters retained from the salt line.
pub const SALT_B64_LEN: usize = 44;
/// Salt and scramble length in bytes.
pub const SCRAMBLE_SIZE: usize = 20;

/// Parsed server greeting.
#[derive(Debug, Clone)]
pub struct Greeting {
    banner: String,
    salt: [u8; SCRAMBLE_SIZE],
}

impl Greeting {
    /// Parses the 128-byte greeting block.
    pub fn parse(raw: &[u8; GREETING_SIZE]) -> Result<Self, ProtocolError> {
        let banner = String::from_utf8_lossy(&raw[..GREETING_LINE_SIZE])
            .trim_end()
            .to_owned();

        let encoded_salt = &raw[GREETING_LINE_SIZE..GREETING_LINE_SIZE + SALT_B64_LEN];
        let decoded = BASE64
            .decode(encoded_salt)
            .map_err(|e| ProtocolError::MalformedGreeting(format!("salt is not base64: {e}")))?;
        if decoded.len() < SCRAMBLE_SIZE {
            return Err(ProtocolError::MalformedGreeting(format!(
                "salt too short: {} bytes",
                decoded.len()
            )));
        }

        let mut salt = [0u8; SCRAMBLE_SIZE];
        salt.copy_from_slice(&decoded[..SCRAMBLE_SIZE]);
        Ok(Greeting { banner, salt })
    }

    /// Human-readable server version line.
    pub fn banner(&self) -> &str {
        &self.banner
    }

    /// First 20 bytes of the decoded salt.
    pub fn salt(&self) -> &[u8; SCRAMBLE_SIZE] {
        &self.salt
    }
}

/// Computes the chap-sha1 client proof.
///
/// `scramble = sha1(password) XOR sha1(salt ‖ sha1(sha1(password)))`
pub fn scramble(salt: &[u8; SCRAMBLE_SIZE], password: &str) -> [u8; SCRAMBLE_SIZE] {
    let step1 = Sha1::digest(password.as_bytes());
    let step2 = Sha1::digest(step1);

    let mut hasher = Sha1::new();
    hasher.update(salt);
    hasher.update(step2);
    let step3 = hasher.finalize();

    let mut out = [0u8; SCRAMBLE_SIZE];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = step1[i] ^ step3[i];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn greeting_block(banner: &str, salt: &[u8]) -> [u8; GREETING_SIZE] {
        let mut block = [b' '; GREETING_SIZE];
        block[..banner.len()].copy_from_slice(banner.as_bytes());
        block[GREETING_LINE_SIZE - 1] = b'\n';
        let encoded = BASE64.encode(salt);
        block[GREETING_LINE_SIZE..GREETING_LINE_SIZE + encoded.len()]
            .copy_from_slice(encoded.as_bytes());
        block[GREETING_SIZE - 1] = b'\n';
        block
    }

    #[test]
    fn test_parse_banner_and_salt() {
        let salt: Vec<u8> = (0..32).collect();
        let block = greeting_block("Tarantool 2.10.4 (Binary) 4d2c1cd9", &salt);

        let greeting = Greeting::parse(&block).unwrap();
        assert_eq!(greeting.banner(), "Tarantool 2.10.4 (Binary) 4d2c1cd9");
        assert_eq!(greeting.salt(), &<[u8; SCRAMBLE_SIZE]>::try_from(&salt[..20]).unwrap());
    }

    #[test]
    fn test_parse_rejects_bad_base64() {
        let mut block = [b' '; GREETING_SIZE];
        block[GREETING_LINE_SIZE..GREETING_LINE_SIZE + SALT_B64_LEN].fill(b'!');
        let err = Greeting::parse(&block).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedGreeting(_)));
    }

    #[test]
    fn test_scramble_is_deterministic_and_keyed() {
        let salt_a = [0x11u8; SCRAMBLE_SIZE];
        let salt_b = [0x22u8; SCRAMBLE_SIZE];

        assert_eq!(scramble(&salt_a, "qwerty"), scramble(&salt_a, "qwerty"));
        assert_ne!(scramble(&salt_a, "qwerty"), scramble(&salt_a, "hunter2"));
        assert_ne!(scramble(&salt_a, "qwerty"), scramble(&salt_b, "qwerty"));
    }

    #[test]
    fn test_scramble_derivation() {
        let salt = [0x5au8; SCRAMBLE_SIZE];
        let password = "qwerty";

        let step1 = Sha1::digest(password.as_bytes());
        let step2 = Sha1::digest(step1);
        let mut hasher = Sha1::new();
        hasher.update(salt);
        hasher.update(step2);
        let step3 = hasher.finalize();

        let expected: Vec<u8> = step1.iter().zip(step3.iter()).map(|(a, b)| a ^ b).collect();
        assert_eq!(scramble(&salt, password).to_vec(), expected);
    }
}
