//! VNC challenge-response authentication.
//!
//! The server sends a 16-byte challenge; the client DES-encrypts it with a key
//! derived from the password. VNC's quirk: each key byte is bit-reversed
//! before use, and the password is truncated or zero-padded to 8 bytes.

use des::Des;
use des::cipher::{BlockEncrypt, KeyInit};

/// Encrypt a server challenge with the VNC password.
pub fn encrypt_challenge(challenge: &[u8; 16], password: &str) -> [u8; 16] {
    let mut key = [0u8; 8];
    for (i, &b) in password.as_bytes().iter().take(8).enumerate() {
        key[i] = b.reverse_bits();
    }

    let cipher = Des::new(&key.into());

    let mut response = *challenge;
    let (first, second) = response.split_at_mut(8);
    cipher.encrypt_block(first.into());
    cipher.encrypt_block(second.into());
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_is_deterministic_and_key_dependent() {
        let challenge = [0x11u8; 16];
        let a = encrypt_challenge(&challenge, "secret");
        let b = encrypt_challenge(&challenge, "secret");
        let c = encrypt_challenge(&challenge, "other");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, challenge);
    }

    #[test]
    fn password_longer_than_eight_bytes_is_truncated() {
        let challenge = [0xabu8; 16];
        let long = encrypt_challenge(&challenge, "password-with-tail");
        let truncated = encrypt_challenge(&challenge, "password");
        assert_eq!(long, truncated);
    }

    #[test]
    fn blocks_are_encrypted_independently() {
        // Equal plaintext blocks must yield equal ciphertext blocks (ECB).
        let challenge = [0x5au8; 16];
        let response = encrypt_challenge(&challenge, "pw");
        assert_eq!(response[0..8], response[8..16]);
    }
}
