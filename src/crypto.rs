use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum EncryptionError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("Key must be 32 bytes (256 bits) long")]
    InvalidKeyLength,
    #[error("Invalid hex input: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Symmetric cipher for panel credentials stored on server rows.
/// AES-256-GCM with the nonce prepended to the ciphertext.
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    pub fn new(key: &[u8]) -> Result<Self, EncryptionError> {
        Ok(Self {
            cipher: Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::InvalidKeyLength)?,
        })
    }

    /// Builds a cipher from a hex encoded 32-byte key.
    pub fn from_hex_key(key_hex: &str) -> Result<Self, EncryptionError> {
        let key = hex::decode(key_hex.trim())?;
        Self::new(&key)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))?;

        let mut result = nonce.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    pub fn decrypt(&self, encrypted_data: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        if encrypted_data.len() < NONCE_LEN {
            return Err(EncryptionError::DecryptionFailed(
                "Invalid encrypted data: too short to contain a nonce".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = encrypted_data.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| EncryptionError::DecryptionFailed(e.to_string()))
    }

    pub fn encrypt_to_hex(&self, plaintext: &str) -> Result<String, EncryptionError> {
        Ok(hex::encode(self.encrypt(plaintext.as_bytes())?))
    }

    pub fn decrypt_hex(&self, encrypted_hex: &str) -> Result<String, EncryptionError> {
        let bytes = hex::decode(encrypted_hex)?;
        let plaintext = self.decrypt(&bytes)?;
        String::from_utf8(plaintext)
            .map_err(|e| EncryptionError::DecryptionFailed(format!("Plaintext is not UTF-8: {e}")))
    }
}
