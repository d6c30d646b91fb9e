use base64::{engine::general_purpose::STANDARD, Engine as _};
#[allow(deprecated)]
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

const BLOB_PREFIX: &str = "v1:";
const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("unsupported credential blob format")]
    Format,
    #[error("credential blob is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("cipher failure: {0}")]
    Cipher(String),
    #[error("credentials are not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encryption at rest for integration credentials.
pub trait CredentialCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<String, CipherError>;
    fn decrypt(&self, blob: &str) -> Result<Vec<u8>, CipherError>;
}

pub fn encrypt_json(cipher: &dyn CredentialCipher, value: &Value) -> Result<String, CipherError> {
    cipher.encrypt(&serde_json::to_vec(value)?)
}

pub fn decrypt_json(cipher: &dyn CredentialCipher, blob: &str) -> Result<Value, CipherError> {
    Ok(serde_json::from_slice(&cipher.decrypt(blob)?)?)
}

/// XChaCha20-Poly1305 keyed by SHA-256 of the configured secret.
///
/// Blob layout: `v1:` + base64(`[nonce: 24 bytes][ciphertext + tag]`).
pub struct XChaChaCipher {
    key: [u8; 32],
}

impl XChaChaCipher {
    pub fn from_secret(secret: &str) -> Self {
        Self {
            key: Sha256::digest(secret.as_bytes()).into(),
        }
    }
}

impl CredentialCipher for XChaChaCipher {
    #[allow(deprecated)]
    fn encrypt(&self, plaintext: &[u8]) -> Result<String, CipherError> {
        let cipher = XChaCha20Poly1305::new((&self.key).into());

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: BLOB_PREFIX.as_bytes(),
                },
            )
            .map_err(|e| CipherError::Cipher(e.to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(format!("{BLOB_PREFIX}{}", STANDARD.encode(blob)))
    }

    #[allow(deprecated)]
    fn decrypt(&self, blob: &str) -> Result<Vec<u8>, CipherError> {
        let encoded = blob.strip_prefix(BLOB_PREFIX).ok_or(CipherError::Format)?;
        let raw = STANDARD.decode(encoded)?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(CipherError::Format);
        }

        let (nonce_bytes, ct) = raw.split_at(NONCE_LEN);
        let nonce = XNonce::from_slice(nonce_bytes);
        let cipher = XChaCha20Poly1305::new((&self.key).into());

        cipher
            .decrypt(
                nonce,
                Payload {
                    msg: ct,
                    aad: BLOB_PREFIX.as_bytes(),
                },
            )
            .map_err(|e| CipherError::Cipher(e.to_string()))
    }
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// `sk_` followed by 64 hex characters.
pub fn generate_api_key() -> String {
    format!("sk_{}", random_hex(32))
}

pub fn generate_auth_token() -> String {
    random_hex(32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn credentials_round_trip_through_the_blob_format() {
        let cipher = XChaChaCipher::from_secret("secret");
        let credentials = json!({ "bot_token": "123:abc" });
        let blob = encrypt_json(&cipher, &credentials).unwrap();
        assert!(blob.starts_with("v1:"));
        assert!(!blob.contains("123:abc"));
        assert_eq!(decrypt_json(&cipher, &blob).unwrap(), credentials);
    }

    #[test]
    fn wrong_key_fails() {
        let blob = XChaChaCipher::from_secret("one").encrypt(b"payload").unwrap();
        let result = XChaChaCipher::from_secret("two").decrypt(&blob);
        assert!(matches!(result, Err(CipherError::Cipher(_))));
    }

    #[test]
    fn foreign_blobs_are_rejected() {
        let cipher = XChaChaCipher::from_secret("secret");
        assert!(matches!(cipher.decrypt("plain"), Err(CipherError::Format)));
        assert!(matches!(cipher.decrypt("v1:AAAA"), Err(CipherError::Format)));
    }

    #[test]
    fn api_keys_have_a_fixed_shape() {
        let key = generate_api_key();
        assert!(key.starts_with("sk_"));
        assert_eq!(key.len(), 3 + 64);
        assert_ne!(key, generate_api_key());
    }
}
