//! Secret handling: AES-256-GCM for data at rest plus the stable hashes used
//! to derive annotation-service identifiers.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    AeadCore, Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use sha1::{Digest, Sha1};
use std::path::Path;

use crate::error::{MarginError, Result};

const NONCE_LEN: usize = 12;

/// Generate a new random 256-bit encryption key.
pub fn generate_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    use rand::RngCore;
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Symmetric cipher bound to the installation's master key.
#[derive(Clone)]
pub struct SecretBox {
    key: [u8; 32],
}

impl std::fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretBox").finish_non_exhaustive()
    }
}

impl SecretBox {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Read a hex-encoded key as written by `margin init`.
    pub fn from_key_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let bytes = hex::decode(raw.trim())
            .map_err(|e| MarginError::Crypto(format!("master key is not valid hex: {e}")))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| MarginError::Crypto("master key must be 32 bytes".into()))?;
        Ok(Self::new(key))
    }

    /// Encrypt `plaintext`, returning nonce (12 bytes) || ciphertext.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| MarginError::Crypto(format!("encryption failed: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt data produced by [`SecretBox::encrypt`].
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(MarginError::Crypto(
                "ciphertext too short: missing nonce".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| MarginError::Crypto(format!("decryption failed: {e}")))
    }

    pub fn decrypt_string(&self, data: &[u8]) -> Result<String> {
        String::from_utf8(self.decrypt(data)?)
            .map_err(|e| MarginError::Crypto(format!("decrypted secret is not UTF-8: {e}")))
    }

    /// Encrypt into a URL-safe token, for values that travel through a
    /// browser (e.g. per-document auth headers handed to Via).
    pub fn seal_token(&self, plaintext: &str) -> Result<String> {
        Ok(URL_SAFE_NO_PAD.encode(self.encrypt(plaintext.as_bytes())?))
    }

    pub fn open_token(&self, token: &str) -> Result<String> {
        let data = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| MarginError::Crypto(format!("malformed sealed token: {e}")))?;
        self.decrypt_string(&data)
    }
}

/// Hex SHA-1 over the `:`-joined parts.
pub fn sha1_hex(parts: &[&str]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(parts.join(":").as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret_box() -> SecretBox {
        SecretBox::new(generate_key())
    }

    #[test]
    fn generate_key_is_random() {
        assert_ne!(generate_key(), generate_key());
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let sb = secret_box();
        let encrypted = sb.encrypt(b"developer secret").unwrap();
        assert_eq!(sb.decrypt(&encrypted).unwrap(), b"developer secret");
        assert_eq!(encrypted.len(), NONCE_LEN + 16 + 16);
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let encrypted = secret_box().encrypt(b"secret data").unwrap();
        let err = secret_box().decrypt(&encrypted).unwrap_err();
        assert!(err.to_string().contains("decryption failed"));
    }

    #[test]
    fn decrypt_with_short_data_fails() {
        let err = secret_box().decrypt(&[0u8; 5]).unwrap_err();
        assert!(err.to_string().contains("ciphertext too short"));
    }

    #[test]
    fn decrypt_with_tampered_data_fails() {
        let sb = secret_box();
        let mut encrypted = sb.encrypt(b"important secret").unwrap();
        if let Some(byte) = encrypted.last_mut() {
            *byte ^= 0xFF;
        }
        assert!(sb.decrypt(&encrypted).is_err());
    }

    #[test]
    fn sealed_token_is_url_safe() {
        let sb = secret_box();
        let token = sb.seal_token("Authorization: Bearer abc/def+ghi").unwrap();
        assert!(!token.contains('+') && !token.contains('/') && !token.contains('='));
        assert_eq!(
            sb.open_token(&token).unwrap(),
            "Authorization: Bearer abc/def+ghi"
        );
    }

    #[test]
    fn key_file_roundtrip() {
        let dir = std::env::temp_dir().join("margin_test_master_key");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("master.key");
        let key = generate_key();
        std::fs::write(&path, format!("{}\n", hex::encode(key))).unwrap();

        let sb = SecretBox::from_key_file(&path).unwrap();
        let sealed = SecretBox::new(key).encrypt(b"x").unwrap();
        assert_eq!(sb.decrypt(&sealed).unwrap(), b"x");

        std::fs::write(&path, "abcd").unwrap();
        assert!(SecretBox::from_key_file(&path).is_err());

        std::fs::remove_file(&path).ok();
        std::fs::remove_dir(&dir).ok();
    }

    #[test]
    fn sha1_hex_is_stable() {
        assert_eq!(
            sha1_hex(&["a", "b"]),
            "dcea6d9ccd3d20ba1549f6d9b5dde60742158882"
        );
        assert_ne!(sha1_hex(&["a", "b"]), sha1_hex(&["a:b", ""]));
    }
}
