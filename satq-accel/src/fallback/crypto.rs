//! AES-GCM byte oracle for the crypto engine fallback.
//!
//! The key length selects the cipher variant (128/192/256-bit). Encryption
//! returns ciphertext with the 16-byte authentication tag appended;
//! decryption consumes and verifies the trailing tag.

use crate::error::{AccelError, Result};
use aes::cipher::consts::U12;
use aes::Aes192;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};

type Aes192Gcm = AesGcm<Aes192, U12>;

/// GCM authentication tag length appended to ciphertext.
pub const TAG_LEN: usize = 16;

/// Nonces shorter than the 96-bit GCM nonce are zero-padded on the right.
fn pad_nonce(nonce: &[u8]) -> [u8; 12] {
    let mut padded = [0u8; 12];
    padded[..nonce.len()].copy_from_slice(nonce);
    padded
}

pub fn encrypt(input: &[u8], key: &[u8], nonce: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let nonce = pad_nonce(nonce);
    let nonce = GenericArray::from_slice(&nonce);
    let payload = Payload { msg: input, aad };

    let sealed = match key.len() {
        16 => Aes128Gcm::new(GenericArray::from_slice(key)).encrypt(nonce, payload),
        24 => Aes192Gcm::new(GenericArray::from_slice(key)).encrypt(nonce, payload),
        32 => Aes256Gcm::new(GenericArray::from_slice(key)).encrypt(nonce, payload),
        _ => return Err(AccelError::InvalidArgument("unsupported key size")),
    };

    sealed.map_err(|_| AccelError::InvalidArgument("encryption failed"))
}

pub fn decrypt(input: &[u8], key: &[u8], nonce: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if input.len() < TAG_LEN {
        return Err(AccelError::InvalidArgument(
            "input data too small for decryption with tag",
        ));
    }

    let nonce = pad_nonce(nonce);
    let nonce = GenericArray::from_slice(&nonce);
    let payload = Payload { msg: input, aad };

    let opened = match key.len() {
        16 => Aes128Gcm::new(GenericArray::from_slice(key)).decrypt(nonce, payload),
        24 => Aes192Gcm::new(GenericArray::from_slice(key)).decrypt(nonce, payload),
        32 => Aes256Gcm::new(GenericArray::from_slice(key)).decrypt(nonce, payload),
        _ => return Err(AccelError::InvalidArgument("unsupported key size")),
    };

    opened.map_err(|_| AccelError::AuthenticationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_key_sizes() {
        let message = b"satellite uplink frame";
        let nonce = [7u8; 12];
        let aad = b"header";

        for key_len in [16usize, 24, 32] {
            let key = vec![0xA5u8; key_len];
            let sealed = encrypt(message, &key, &nonce, aad).unwrap();
            assert_eq!(sealed.len(), message.len() + TAG_LEN);

            let opened = decrypt(&sealed, &key, &nonce, aad).unwrap();
            assert_eq!(opened, message, "key length {}", key_len);
        }
    }

    #[test]
    fn test_tampered_tag_rejected() {
        let key = [1u8; 16];
        let nonce = [2u8; 12];
        let mut sealed = encrypt(b"payload", &key, &nonce, &[]).unwrap();

        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(
            decrypt(&sealed, &key, &nonce, &[]),
            Err(AccelError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_tampered_aad_rejected() {
        let key = [1u8; 32];
        let nonce = [2u8; 12];
        let sealed = encrypt(b"payload", &key, &nonce, b"aad-one").unwrap();
        assert!(decrypt(&sealed, &key, &nonce, b"aad-two").is_err());
    }

    #[test]
    fn test_short_nonce_is_padded_consistently() {
        let key = [9u8; 16];
        let sealed = encrypt(b"data", &key, &[1, 2, 3, 4], &[]).unwrap();
        let opened = decrypt(&sealed, &key, &[1, 2, 3, 4], &[]).unwrap();
        assert_eq!(opened, b"data");

        // A different short nonce must not decrypt.
        assert!(decrypt(&sealed, &key, &[1, 2, 3, 5], &[]).is_err());
    }

    #[test]
    fn test_unsupported_key_size_rejected() {
        assert!(encrypt(b"x", &[0u8; 20], &[0u8; 12], &[]).is_err());
    }

    #[test]
    fn test_decrypt_requires_tag() {
        let key = [1u8; 16];
        assert!(decrypt(&[0u8; 15], &key, &[0u8; 12], &[]).is_err());
    }
}
