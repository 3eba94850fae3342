//! Signing-key and shared-secret generation.
//!
//! Everything here draws from the operating system CSPRNG. A failing RNG
//! means the platform cannot run a homeserver securely, so RNG errors abort
//! the process (inside `OsRng`) rather than surfacing as per-call errors.

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE};
use base64::Engine as _;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rand::RngCore as _;

/// Generates an ed25519 private key suitably encoded for use as a Synapse
/// signing key: one line of the form `ed25519 <key_id> <base64-seed>`
/// terminated by a newline, with the seed in the unpadded standard base64
/// alphabet. The public half is discarded; Synapse re-derives it.
pub fn generate_signing_key(key_id: &str) -> String {
    let key = SigningKey::generate(&mut OsRng);
    let seed = STANDARD_NO_PAD.encode(key.to_bytes());
    format!("ed25519 {key_id} {seed}\n")
}

/// Generates a printable random string of length `n` drawn from the
/// URL-safe base64 alphabet.
pub fn random_string(n: usize) -> String {
    // Scratch length rounds up to a multiple of three, so the encoding is
    // never padded and truncation keeps only alphabet characters.
    let mut scratch = vec![0u8; n.div_ceil(4) * 3];
    OsRng.fill_bytes(&mut scratch);
    let mut s = URL_SAFE.encode(&scratch);
    s.truncate(n);
    s
}

/// Picks an identifier for a freshly generated signing key.
///
/// Key identifiers must not contain `-` or `_` (both act as delimiters in
/// downstream key-id handling), so redraw until the token is clean. Two of
/// 64 alphabet symbols are rejected per character; the loop terminates
/// after ~1.3 iterations in expectation.
pub fn signing_key_id() -> String {
    loop {
        let token = random_string(4);
        if !token.contains(['-', '_']) {
            return format!("a_{token}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn in_alphabet(c: char) -> bool {
        c.is_ascii_alphanumeric() || c == '-' || c == '_'
    }

    #[test]
    fn random_string_has_exact_length_and_alphabet() {
        for n in [0, 1, 4, 63, 64, 65, 128] {
            let s = random_string(n);
            assert_eq!(s.len(), n);
            assert!(s.chars().all(in_alphabet), "unexpected character in {s:?}");
        }
    }

    #[test]
    fn random_string_does_not_collide() {
        let drawn: HashSet<String> = (0..100).map(|_| random_string(64)).collect();
        assert_eq!(drawn.len(), 100);
    }

    #[test]
    fn signing_key_encoding_round_trips() {
        let encoded = generate_signing_key("a_xyzw");
        assert!(encoded.ends_with('\n'));

        let parts: Vec<&str> = encoded.trim_end().split(' ').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "ed25519");
        assert_eq!(parts[1], "a_xyzw");

        let seed = STANDARD_NO_PAD.decode(parts[2]).expect("seed decodes");
        let seed: [u8; 32] = seed.try_into().expect("seed is 32 bytes");
        // Re-deriving the public key from the seed must work.
        let _ = SigningKey::from_bytes(&seed).verifying_key();
    }

    #[test]
    fn signing_key_ids_avoid_reserved_delimiters() {
        for _ in 0..32 {
            let id = signing_key_id();
            assert_eq!(id.len(), 6);
            assert!(id.starts_with("a_"));
            assert!(!id[2..].contains(['-', '_']), "reserved char in {id:?}");
        }
    }
}
