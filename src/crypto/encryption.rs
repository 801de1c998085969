use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncryptionError {
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Invalid key length")]
    InvalidKeyLength,
    #[error("Key derivation failed")]
    KeyDerivationFailed,
}

pub type Result<T> = std::result::Result<T, EncryptionError>;

/// XChaCha20 nonce size.
pub const NONCE_LEN: usize = 24;

/// Encrypt with XChaCha20-Poly1305 under a fresh random nonce.
///
/// `aad` is authenticated but not encrypted; group content binds the group id
/// and secret id here so a ciphertext cannot be replayed into another group.
///
/// # Returns
/// (nonce, ciphertext || tag)
pub fn seal(plaintext: &[u8], key: &[u8; 32], aad: &[u8]) -> Result<([u8; NONCE_LEN], Vec<u8>)> {
    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|_| EncryptionError::InvalidKeyLength)?;

    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|_| EncryptionError::EncryptionFailed)?;

    Ok((nonce, ciphertext))
}

/// Decrypt and authenticate an XChaCha20-Poly1305 ciphertext.
pub fn open(
    ciphertext: &[u8],
    nonce: &[u8; NONCE_LEN],
    key: &[u8; 32],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|_| EncryptionError::InvalidKeyLength)?;

    cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| EncryptionError::DecryptionFailed)
}

/// Generate a random 32-byte symmetric key.
pub fn generate_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// HKDF-SHA256 expand of `ikm` into a 32-byte key bound to `info`.
pub fn derive_key(ikm: &[u8], salt: Option<&[u8]>, info: &[u8]) -> Result<[u8; 32]> {
    let hkdf = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = [0u8; 32];
    hkdf.expand(info, &mut okm)
        .map_err(|_| EncryptionError::KeyDerivationFailed)?;
    Ok(okm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = generate_key();
        let (nonce, ct) = seal(b"hello group", &key, b"ctx").unwrap();
        assert_eq!(open(&ct, &nonce, &key, b"ctx").unwrap(), b"hello group");
    }

    #[test]
    fn test_open_wrong_aad_fails() {
        let key = generate_key();
        let (nonce, ct) = seal(b"hello", &key, b"group-a").unwrap();
        assert_eq!(
            open(&ct, &nonce, &key, b"group-b").unwrap_err(),
            EncryptionError::DecryptionFailed
        );
    }

    #[test]
    fn test_open_wrong_key_fails() {
        let (nonce, ct) = seal(b"hello", &generate_key(), b"").unwrap();
        assert!(open(&ct, &nonce, &generate_key(), b"").is_err());
    }

    #[test]
    fn test_nonces_are_fresh() {
        let key = generate_key();
        let (n1, c1) = seal(b"same", &key, b"").unwrap();
        let (n2, c2) = seal(b"same", &key, b"").unwrap();
        assert_ne!(n1, n2);
        assert_ne!(c1, c2);
    }

    #[test]
    fn test_derive_key_depends_on_info() {
        let ikm = [9u8; 32];
        let a = derive_key(&ikm, None, b"info-a").unwrap();
        let b = derive_key(&ikm, None, b"info-b").unwrap();
        assert_ne!(a, b);
        assert_eq!(a, derive_key(&ikm, None, b"info-a").unwrap());
    }
}
