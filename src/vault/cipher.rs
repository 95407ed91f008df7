//! Authenticated encryption for tokens at rest.
//!
//! Sealed format: base64(nonce ‖ ciphertext). A secondary decrypt-only key
//! is accepted during rotation; everything written uses the primary.

use super::VaultError;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{AeadCore, ChaCha20Poly1305, Key, Nonce};

const NONCE_LEN: usize = 12;

pub struct TokenCipher {
    primary: ChaCha20Poly1305,
    secondary: Option<ChaCha20Poly1305>,
}

impl TokenCipher {
    pub fn new(key: [u8; 32], secondary: Option<[u8; 32]>) -> Self {
        Self {
            primary: ChaCha20Poly1305::new(Key::from_slice(&key)),
            secondary: secondary.map(|k| ChaCha20Poly1305::new(Key::from_slice(&k))),
        }
    }

    /// Build from hex-encoded key material (the config format).
    pub fn from_hex(primary_hex: &str, secondary_hex: Option<&str>) -> Result<Self, VaultError> {
        let primary = decode_key(primary_hex)?;
        let secondary = secondary_hex.map(decode_key).transpose()?;
        Ok(Self::new(primary, secondary))
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, VaultError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .primary
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::Crypto("encryption failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(sealed))
    }

    pub fn open(&self, sealed: &str) -> Result<String, VaultError> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(sealed)
            .map_err(|_| VaultError::Crypto("invalid sealed token encoding".to_string()))?;
        if raw.len() <= NONCE_LEN {
            return Err(VaultError::Crypto("sealed token too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        if let Ok(plain) = self.primary.decrypt(nonce, ciphertext) {
            return String::from_utf8(plain)
                .map_err(|_| VaultError::Crypto("decrypted token not utf-8".to_string()));
        }
        if let Some(secondary) = &self.secondary {
            if let Ok(plain) = secondary.decrypt(nonce, ciphertext) {
                return String::from_utf8(plain)
                    .map_err(|_| VaultError::Crypto("decrypted token not utf-8".to_string()));
            }
        }
        Err(VaultError::Crypto("token authentication failed".to_string()))
    }
}

fn decode_key(hex_str: &str) -> Result<[u8; 32], VaultError> {
    let bytes = hex::decode(hex_str)
        .map_err(|_| VaultError::Crypto("vault key must be hex".to_string()))?;
    bytes
        .try_into()
        .map_err(|_| VaultError::Crypto("vault key must be 32 bytes".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_round_trip() {
        let cipher = TokenCipher::new([1u8; 32], None);
        let sealed = cipher.seal("super-secret-token").unwrap();
        assert_ne!(sealed, "super-secret-token");
        assert_eq!(cipher.open(&sealed).unwrap(), "super-secret-token");
    }

    #[test]
    fn test_nonces_differ() {
        let cipher = TokenCipher::new([1u8; 32], None);
        let a = cipher.seal("tok").unwrap();
        let b = cipher.seal("tok").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_rejected() {
        let sealer = TokenCipher::new([1u8; 32], None);
        let opener = TokenCipher::new([2u8; 32], None);
        let sealed = sealer.seal("tok").unwrap();
        assert!(opener.open(&sealed).is_err());
    }

    #[test]
    fn test_secondary_key_during_rotation() {
        let old = TokenCipher::new([1u8; 32], None);
        let sealed_with_old = old.seal("tok").unwrap();

        // Rotated: new primary, old key kept for decrypt only.
        let rotated = TokenCipher::new([2u8; 32], Some([1u8; 32]));
        assert_eq!(rotated.open(&sealed_with_old).unwrap(), "tok");

        // New writes use the primary; the old cipher can no longer read them.
        let sealed_with_new = rotated.seal("tok2").unwrap();
        assert!(old.open(&sealed_with_new).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let cipher = TokenCipher::new([1u8; 32], None);
        let sealed = cipher.seal("tok").unwrap();
        let mut raw = base64::engine::general_purpose::STANDARD
            .decode(&sealed)
            .unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        let tampered = base64::engine::general_purpose::STANDARD.encode(raw);
        assert!(cipher.open(&tampered).is_err());
    }

    #[test]
    fn test_from_hex() {
        let cipher = TokenCipher::from_hex(&"ab".repeat(32), None).unwrap();
        let sealed = cipher.seal("x").unwrap();
        assert_eq!(cipher.open(&sealed).unwrap(), "x");

        assert!(TokenCipher::from_hex("deadbeef", None).is_err());
        assert!(TokenCipher::from_hex("zz", None).is_err());
    }
}
