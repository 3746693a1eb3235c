//! AES-CBC with PKCS7 padding, carried as standard base64.

use aes::{Aes128, Aes256};
use base64::Engine;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use super::session::{KeyBytes, KeyMaterial};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Why a ciphertext could not be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenError {
    /// Not valid base64.
    Base64,
    /// Wrong length, wrong key, or corrupted padding.
    Cipher,
}

/// Encrypt `plaintext` and return the base64 wire form.
#[must_use]
pub fn seal(material: &KeyMaterial, plaintext: &[u8]) -> String {
    let iv = *material.iv();
    let ciphertext = match material.key() {
        KeyBytes::Aes128(key) => {
            Aes128CbcEnc::new(&(*key).into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
        }
        KeyBytes::Aes256(key) => {
            Aes256CbcEnc::new(&(*key).into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
        }
    };
    base64::engine::general_purpose::STANDARD.encode(ciphertext)
}

/// Decode and decrypt a base64 ciphertext produced by [`seal`].
///
/// # Errors
///
/// Returns [`OpenError::Base64`] for malformed base64 and
/// [`OpenError::Cipher`] when the bytes do not decrypt to validly padded
/// plaintext under this key.
pub fn open(material: &KeyMaterial, wire: &str) -> Result<Vec<u8>, OpenError> {
    let ciphertext = base64::engine::general_purpose::STANDARD
        .decode(wire.trim())
        .map_err(|_| OpenError::Base64)?;
    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        return Err(OpenError::Cipher);
    }

    let iv = *material.iv();
    let plaintext = match material.key() {
        KeyBytes::Aes128(key) => Aes128CbcDec::new(&(*key).into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext),
        KeyBytes::Aes256(key) => Aes256CbcDec::new(&(*key).into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext),
    };
    plaintext.map_err(|_| OpenError::Cipher)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn material() -> KeyMaterial {
        KeyMaterial::new(b"0123456789abcdef", b"fedcba9876543210").unwrap()
    }

    #[test]
    fn test_seal_open_round_trip() {
        let m = material();
        let wire = seal(&m, b"[\"hello\"]");
        assert_eq!(open(&m, &wire).unwrap(), b"[\"hello\"]");
    }

    #[test]
    fn test_aes256_round_trip() {
        let m = KeyMaterial::new(&[7u8; 32], &[9u8; 16]).unwrap();
        let wire = seal(&m, b"payload");
        assert_eq!(open(&m, &wire).unwrap(), b"payload");
    }

    #[test]
    fn test_output_is_padded_to_block() {
        let m = material();
        for len in [0usize, 1, 15, 16, 17] {
            let wire = seal(&m, &vec![b'x'; len]);
            let raw = base64::engine::general_purpose::STANDARD
                .decode(wire)
                .unwrap();
            assert_eq!(raw.len() % 16, 0);
            assert!(raw.len() > len);
        }
    }

    #[test]
    fn test_fixed_key_and_iv_is_deterministic() {
        let m = material();
        assert_eq!(seal(&m, b"same"), seal(&m, b"same"));
    }

    #[test]
    fn test_open_rejects_bad_base64() {
        assert_eq!(open(&material(), "%%%"), Err(OpenError::Base64));
    }

    #[test]
    fn test_open_rejects_partial_block() {
        let wire = base64::engine::general_purpose::STANDARD.encode([1u8; 10]);
        assert_eq!(open(&material(), &wire), Err(OpenError::Cipher));
        assert_eq!(open(&material(), ""), Err(OpenError::Cipher));
    }
}
