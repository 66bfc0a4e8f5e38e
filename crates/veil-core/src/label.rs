//! Label encryption under per-item label keys
//!
//! Blob layout: `nonce || AES-256-CTR(key, nonce)(len_le16 || label || zero padding)`.
//! The plaintext is always `2 + label_byte_count` bytes so every blob in a
//! database has the same width.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;

use crate::error::Error;
use crate::item::{Label, LabelKey};
use crate::Result;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Largest supported nonce (one AES block)
pub const MAX_NONCE_BYTE_COUNT: usize = 16;

/// Largest supported label width
pub const MAX_LABEL_BYTE_COUNT: usize = u16::MAX as usize;

const LENGTH_PREFIX: usize = 2;

/// Size of an encrypted label blob
pub fn label_blob_len(label_byte_count: usize, nonce_byte_count: usize) -> usize {
    nonce_byte_count + LENGTH_PREFIX + label_byte_count
}

fn apply_keystream(key: &LabelKey, nonce: &[u8], buf: &mut [u8]) {
    let mut iv = [0u8; MAX_NONCE_BYTE_COUNT];
    iv[..nonce.len()].copy_from_slice(nonce);
    let mut cipher = Aes256Ctr::new(key.as_bytes().into(), (&iv).into());
    cipher.apply_keystream(buf);
}

/// Encrypt `label` into a fixed-width blob
pub fn encrypt_label(
    label: &[u8],
    key: &LabelKey,
    label_byte_count: usize,
    nonce_byte_count: usize,
) -> Result<Vec<u8>> {
    if label.len() > label_byte_count {
        return Err(Error::LabelTooLong {
            actual: label.len(),
            max: label_byte_count,
        });
    }
    if nonce_byte_count > MAX_NONCE_BYTE_COUNT {
        return Err(Error::InvalidParams(format!(
            "nonce_byte_count {} exceeds {}",
            nonce_byte_count, MAX_NONCE_BYTE_COUNT
        )));
    }

    let mut blob = vec![0u8; label_blob_len(label_byte_count, nonce_byte_count)];
    let (nonce, body) = blob.split_at_mut(nonce_byte_count);
    rand::thread_rng().fill_bytes(nonce);

    body[..LENGTH_PREFIX].copy_from_slice(&(label.len() as u16).to_le_bytes());
    body[LENGTH_PREFIX..LENGTH_PREFIX + label.len()].copy_from_slice(label);
    apply_keystream(key, nonce, body);

    Ok(blob)
}

/// Decrypt a blob produced by [`encrypt_label`]
pub fn decrypt_label(
    blob: &[u8],
    key: &LabelKey,
    label_byte_count: usize,
    nonce_byte_count: usize,
) -> Result<Label> {
    if nonce_byte_count > MAX_NONCE_BYTE_COUNT {
        return Err(Error::MalformedMessage(format!(
            "nonce_byte_count {} exceeds {}",
            nonce_byte_count, MAX_NONCE_BYTE_COUNT
        )));
    }
    let expected = label_blob_len(label_byte_count, nonce_byte_count);
    if blob.len() != expected {
        return Err(Error::MalformedMessage(format!(
            "label blob is {} bytes, expected {}",
            blob.len(),
            expected
        )));
    }

    let (nonce, body) = blob.split_at(nonce_byte_count);
    let mut plain = body.to_vec();
    apply_keystream(key, nonce, &mut plain);

    let len = u16::from_le_bytes([plain[0], plain[1]]) as usize;
    if len > label_byte_count {
        return Err(Error::MalformedMessage(format!(
            "decrypted label length {} exceeds width {}",
            len, label_byte_count
        )));
    }
    Ok(plain[LENGTH_PREFIX..LENGTH_PREFIX + len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> LabelKey {
        LabelKey::new([byte; 32])
    }

    #[test]
    fn test_short_label_is_not_padded_on_decrypt() {
        let blob = encrypt_label(b"321", &key(7), 10, 16).unwrap();
        assert_eq!(blob.len(), label_blob_len(10, 16));
        assert_eq!(decrypt_label(&blob, &key(7), 10, 16).unwrap(), b"321".to_vec());
    }

    #[test]
    fn test_label_with_trailing_zero_bytes_survives() {
        let label = vec![1, 0, 0];
        let blob = encrypt_label(&label, &key(1), 8, 4).unwrap();
        assert_eq!(decrypt_label(&blob, &key(1), 8, 4).unwrap(), label);
    }

    #[test]
    fn test_label_too_long() {
        assert!(matches!(
            encrypt_label(b"12345", &key(1), 4, 16),
            Err(Error::LabelTooLong { actual: 5, max: 4 })
        ));
    }

    #[test]
    fn test_oversized_nonce_rejected_on_decrypt() {
        let blob = vec![0u8; label_blob_len(1, 17)];
        assert!(matches!(
            decrypt_label(&blob, &key(2), 1, 17),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_nonce_makes_blobs_differ() {
        let a = encrypt_label(b"same", &key(3), 4, 16).unwrap();
        let b = encrypt_label(b"same", &key(3), 4, 16).unwrap();
        assert_ne!(a, b);
    }
}
