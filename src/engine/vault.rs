use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use serde_json::Value;
use crate::{Error, Result};

const NONCE_LEN: usize = 12;

/// Seals values with AES-256-GCM before they reach the backend.
///
/// A sealed value is a JSON string holding hex(nonce || ciphertext) of the
/// value's JSON text. Keys and etags are never sealed.
#[derive(Clone)]
pub struct Sealer {
    cipher: Aes256Gcm,
}

impl Sealer {
    pub fn new(key: &[u8; 32]) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self { cipher })
    }

    pub fn seal(&self, value: &Value) -> Result<Value> {
        let plaintext = serde_json::to_vec(value)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|e| Error::Internal(format!("sealing failed: {}", e)))?;

        let mut combined = nonce.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(Value::String(hex::encode(combined)))
    }

    pub fn unseal(&self, sealed: &Value) -> Result<Value> {
        let cipher_hex = sealed
            .as_str()
            .ok_or_else(|| Error::Internal("sealed value is not a string".to_string()))?;
        let combined = hex::decode(cipher_hex).map_err(|e| Error::Internal(format!("sealed value is not hex: {}", e)))?;
        if combined.len() < NONCE_LEN {
            return Err(Error::Internal("sealed value too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| Error::Internal("unsealing failed (wrong key or tampered data)".to_string()))?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}
