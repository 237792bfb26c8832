//! Curve25519 key generation for tunnel endpoints

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

/// Length of a base64-encoded 32-byte key, including padding
pub const ENCODED_KEY_LEN: usize = 44;

/// An X25519 keypair, base64-encoded for config files and peer exchange
#[derive(Debug, Clone)]
pub struct Keypair {
    pub private_key: String,
    pub public_key: String,
}

impl Keypair {
    /// Generate a fresh keypair from the system CSPRNG.
    ///
    /// The public key is the Curve25519 base-point multiple of the
    /// clamped private scalar, matching what `wg genkey`/`wg pubkey`
    /// would produce.
    pub fn generate() -> Self {
        let mut private = [0u8; 32];
        OsRng.fill_bytes(&mut private);

        // X25519 clamping
        private[0] &= 248;
        private[31] &= 127;
        private[31] |= 64;

        let secret = x25519_dalek::StaticSecret::from(private);
        let public = x25519_dalek::PublicKey::from(&secret);

        Self {
            private_key: BASE64.encode(private),
            public_key: BASE64.encode(public.as_bytes()),
        }
    }
}

/// Re-derive the public key from an encoded private key. Returns None
/// when the input is not a valid 32-byte base64 key.
pub fn public_from_private(private_key: &str) -> Option<String> {
    let bytes = BASE64.decode(private_key).ok()?;
    let bytes: [u8; 32] = bytes.try_into().ok()?;
    let secret = x25519_dalek::StaticSecret::from(bytes);
    let public = x25519_dalek::PublicKey::from(&secret);
    Some(BASE64.encode(public.as_bytes()))
}

/// Check that a string looks like a base64-encoded 32-byte key
pub fn is_valid_key(encoded: &str) -> bool {
    if encoded.len() != ENCODED_KEY_LEN || !encoded.ends_with('=') {
        return false;
    }
    match BASE64.decode(encoded) {
        Ok(bytes) => bytes.len() == 32,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_keypair_encoding_shape() {
        let kp = Keypair::generate();
        assert_eq!(kp.private_key.len(), ENCODED_KEY_LEN);
        assert_eq!(kp.public_key.len(), ENCODED_KEY_LEN);
        assert!(kp.private_key.ends_with('='));
        assert!(kp.public_key.ends_with('='));
        assert!(is_valid_key(&kp.private_key));
        assert!(is_valid_key(&kp.public_key));
    }

    #[test]
    fn test_successive_keypairs_are_distinct() {
        let mut seen = HashSet::new();
        for _ in 0..10 {
            let kp = Keypair::generate();
            assert!(seen.insert(kp.private_key.clone()));
            assert!(seen.insert(kp.public_key.clone()));
        }
        assert_eq!(seen.len(), 20);
    }

    #[test]
    fn test_public_key_differs_from_private() {
        let kp = Keypair::generate();
        assert_ne!(kp.private_key, kp.public_key);
    }

    #[test]
    fn test_public_from_private_matches_generation() {
        let kp = Keypair::generate();
        assert_eq!(public_from_private(&kp.private_key), Some(kp.public_key));
        assert_eq!(public_from_private("bogus"), None);
    }

    #[test]
    fn test_key_validation_rejects_garbage() {
        assert!(!is_valid_key(""));
        assert!(!is_valid_key("not-a-key"));
        // Right length, wrong terminator
        assert!(!is_valid_key(&"A".repeat(ENCODED_KEY_LEN)));
    }
}
