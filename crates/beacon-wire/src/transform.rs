//! Frame transforms applied at the session boundary.
//!
//! A transform sees every frame body exactly once in each direction: `seal`
//! before a frame is written, `open` after it is read. Both peers must be
//! configured with the same transform.

use std::fmt;
use std::sync::Arc;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Bytes [`SealedTransform`] adds to every frame body.
pub const SEALED_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("sealed frame truncated ({0} bytes)")]
    Truncated(usize),
    #[error("sealed frame failed authentication")]
    Authentication,
    #[error("failed to seal frame")]
    Seal,
}

pub trait FrameTransform: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn seal(&self, body: Vec<u8>) -> Result<Vec<u8>, TransformError>;

    fn open(&self, frame: Vec<u8>) -> Result<Vec<u8>, TransformError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Plaintext;

impl FrameTransform for Plaintext {
    fn name(&self) -> &'static str {
        "plaintext"
    }

    fn seal(&self, body: Vec<u8>) -> Result<Vec<u8>, TransformError> {
        Ok(body)
    }

    fn open(&self, frame: Vec<u8>) -> Result<Vec<u8>, TransformError> {
        Ok(frame)
    }
}

/// ChaCha20-Poly1305 with a key derived from a shared passphrase.
///
/// Sealed layout: `[nonce: 12][ciphertext + tag]`.
pub struct SealedTransform {
    cipher: ChaCha20Poly1305,
}

impl SealedTransform {
    pub fn from_passphrase(passphrase: &str) -> Self {
        let key = Sha256::digest(passphrase.as_bytes());
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
        }
    }
}

impl fmt::Debug for SealedTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedTransform").finish_non_exhaustive()
    }
}

impl FrameTransform for SealedTransform {
    fn name(&self) -> &'static str {
        "chacha20poly1305"
    }

    fn seal(&self, body: Vec<u8>) -> Result<Vec<u8>, TransformError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), body.as_ref())
            .map_err(|_| TransformError::Seal)?;
        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, frame: Vec<u8>) -> Result<Vec<u8>, TransformError> {
        if frame.len() < NONCE_LEN + TAG_LEN {
            return Err(TransformError::Truncated(frame.len()));
        }
        let (nonce_bytes, ciphertext) = frame.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| TransformError::Authentication)
    }
}

/// Picks the transform for an optional shared key.
pub fn transform_for(shared_key: Option<&str>) -> Arc<dyn FrameTransform> {
    match shared_key {
        Some(key) if !key.is_empty() => Arc::new(SealedTransform::from_passphrase(key)),
        _ => Arc::new(Plaintext),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_frames_open_with_the_same_key_only() {
        let ours = SealedTransform::from_passphrase("correct horse");
        let theirs = SealedTransform::from_passphrase("battery staple");

        let sealed = ours.seal(b"\x01".to_vec()).expect("seal");
        assert_eq!(sealed.len(), 1 + SEALED_OVERHEAD);
        assert_eq!(ours.open(sealed.clone()).expect("open"), b"\x01".to_vec());
        assert_eq!(theirs.open(sealed), Err(TransformError::Authentication));
    }

    #[test]
    fn nonces_differ_between_frames() {
        let transform = SealedTransform::from_passphrase("k");
        let a = transform.seal(b"same".to_vec()).expect("seal a");
        let b = transform.seal(b"same".to_vec()).expect("seal b");
        assert_ne!(a, b);
    }

    #[test]
    fn short_frames_are_rejected() {
        let transform = SealedTransform::from_passphrase("k");
        assert_eq!(transform.open(vec![0; 5]), Err(TransformError::Truncated(5)));
    }

    #[test]
    fn empty_key_selects_plaintext() {
        assert_eq!(transform_for(Some("")).name(), "plaintext");
        assert_eq!(transform_for(None).name(), "plaintext");
        assert_eq!(transform_for(Some("k")).name(), "chacha20poly1305");
    }
}
