//! Record encryption for cached values.
//!
//! Every cached value is sealed with AES-256-GCM under a key derived (SHA-256)
//! from a secret string. By default that secret is [`EMBEDDED_SECRET`], which
//! ships inside the binary and is identical for every installation: it keeps
//! cached data unreadable to casual inspection of the database file, but it is
//! not confidentiality against anyone holding the binary. Deployments that
//! need more set `storage.secret` or `SHIFTSYNC_SECRET` to a per-device value.
//! Changing the secret makes existing cached rows undecryptable; the
//! installation guard wipes them on the next boot.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Application-embedded secret used when no override is configured.
pub const EMBEDDED_SECRET: &str = "CHART-PAPER-SCISSORS-ROCK-PENCIL";

const NONCE_LEN: usize = 12;

/// Seals and opens cached record values.
#[derive(Clone)]
pub struct RecordCipher {
  cipher: Aes256Gcm,
}

impl RecordCipher {
  pub fn from_secret(secret: &str) -> Self {
    let digest = Sha256::digest(secret.as_bytes());
    let key = Key::<Aes256Gcm>::from_slice(digest.as_slice());
    Self {
      cipher: Aes256Gcm::new(key),
    }
  }

  /// Cipher keyed with [`EMBEDDED_SECRET`].
  pub fn embedded() -> Self {
    Self::from_secret(EMBEDDED_SECRET)
  }

  /// Layout: 12-byte random nonce followed by the GCM ciphertext and tag.
  pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let ciphertext = self
      .cipher
      .encrypt(Nonce::from_slice(&nonce), plaintext)
      .map_err(|e| Error::Crypto(format!("AES-GCM encrypt failed: {}", e)))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
  }

  pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN {
      return Err(Error::Crypto("ciphertext too short".to_string()));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    self
      .cipher
      .decrypt(Nonce::from_slice(nonce), ciphertext)
      .map_err(|e| Error::Crypto(format!("AES-GCM decrypt failed: {}", e)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_seal_then_open() {
    let cipher = RecordCipher::embedded();
    let sealed = cipher.seal(b"{\"name\":\"Alice\"}").unwrap();
    assert_ne!(&sealed[NONCE_LEN..], b"{\"name\":\"Alice\"}");
    assert_eq!(cipher.open(&sealed).unwrap(), b"{\"name\":\"Alice\"}");
  }

  #[test]
  fn test_nonce_differs_per_seal() {
    let cipher = RecordCipher::embedded();
    assert_ne!(cipher.seal(b"same").unwrap(), cipher.seal(b"same").unwrap());
  }

  #[test]
  fn test_tampered_ciphertext_is_rejected() {
    let cipher = RecordCipher::embedded();
    let mut sealed = cipher.seal(b"payload").unwrap();
    let last = sealed.len() - 1;
    sealed[last] ^= 0xFF;
    assert!(cipher.open(&sealed).is_err());
    assert!(cipher.open(b"short").is_err());
  }

  #[test]
  fn test_other_secret_cannot_open() {
    let sealed = RecordCipher::embedded().seal(b"payload").unwrap();
    assert!(RecordCipher::from_secret("per-device").open(&sealed).is_err());
  }
}
