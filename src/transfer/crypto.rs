use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use getrandom::getrandom;

use crate::error::TransferError;

pub const AES_KEY_LEN: usize = 32;
pub const AES_NONCE_LEN: usize = 12;
pub const AES_TAG_LEN: usize = 16;

/// Per-session chunk cipher. Every frame is `nonce || ciphertext || tag`.
#[derive(Clone)]
pub struct SessionCipher {
  key: [u8; AES_KEY_LEN],
  cipher: Aes256Gcm,
}

impl fmt::Debug for SessionCipher {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SessionCipher").finish_non_exhaustive()
  }
}

impl SessionCipher {
  pub fn generate() -> Result<Self, TransferError> {
    let mut key = [0u8; AES_KEY_LEN];
    getrandom(&mut key).map_err(|err| TransferError::Crypto(err.to_string()))?;
    Self::from_key(&key)
  }

  pub fn from_key(key: &[u8]) -> Result<Self, TransferError> {
    let key: [u8; AES_KEY_LEN] = key.try_into().map_err(|_| TransferError::InvalidKey)?;
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| TransferError::InvalidKey)?;
    Ok(Self { key, cipher })
  }

  pub fn from_encoded(key: &str) -> Result<Self, TransferError> {
    Self::from_key(&STANDARD.decode(key)?)
  }

  pub fn encoded_key(&self) -> String {
    STANDARD.encode(self.key)
  }

  pub fn encrypt_frame(&self, plain: &[u8]) -> Result<Vec<u8>, TransferError> {
    let mut nonce_bytes = [0u8; AES_NONCE_LEN];
    getrandom(&mut nonce_bytes).map_err(|err| TransferError::Crypto(err.to_string()))?;
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = self
      .cipher
      .encrypt(nonce, plain)
      .map_err(|err| TransferError::Crypto(err.to_string()))?;
    let mut frame = Vec::with_capacity(AES_NONCE_LEN + ciphertext.len());
    frame.extend_from_slice(&nonce_bytes);
    frame.extend_from_slice(&ciphertext);
    Ok(frame)
  }

  pub fn decrypt_frame(&self, frame: &[u8]) -> Result<Vec<u8>, TransferError> {
    if frame.len() < AES_NONCE_LEN + AES_TAG_LEN {
      return Err(TransferError::Crypto("encrypted frame is too short".into()));
    }
    let (nonce_bytes, ciphertext) = frame.split_at(AES_NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    self
      .cipher
      .decrypt(nonce, ciphertext)
      .map_err(|err| TransferError::Crypto(err.to_string()))
  }
}
