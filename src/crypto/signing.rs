use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SigningError {
    #[error("Signing failed: {0}")]
    SigningFailed(String),
    #[error("Invalid key length")]
    InvalidKeyLength,
}

pub type Result<T> = std::result::Result<T, SigningError>;

/// Anything that can sign a 32-byte digest on behalf of one Ed25519 identity.
///
/// Op envelopes and sealed secrets are signed over a BLAKE3 digest, so the
/// signer never sees the full payload. The local key store implements this.
pub trait DigestSigner: Send + Sync {
    /// Ed25519 public key of the identity that signs.
    fn public_key(&self) -> [u8; 32];

    /// Sign a 32-byte digest, returning the 64-byte Ed25519 signature.
    fn sign_digest(&self, digest: &[u8; 32]) -> Result<[u8; 64]>;
}

/// In-memory Ed25519 identity. The private half is wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SigningKeyPair {
    #[zeroize(skip)]
    public: [u8; 32],
    private: [u8; 32],
}

impl SigningKeyPair {
    /// Fresh random identity.
    pub fn generate() -> Self {
        let (public, private) = generate_keypair();
        SigningKeyPair { public, private }
    }

    /// Rebuild an identity from its 32-byte private key.
    pub fn from_private(private: [u8; 32]) -> Self {
        let public = SigningKey::from_bytes(&private).verifying_key().to_bytes();
        SigningKeyPair { public, private }
    }

    pub fn public(&self) -> [u8; 32] {
        self.public
    }
}

impl DigestSigner for SigningKeyPair {
    fn public_key(&self) -> [u8; 32] {
        self.public
    }

    fn sign_digest(&self, digest: &[u8; 32]) -> Result<[u8; 64]> {
        sign_data(digest, &self.private)
    }
}

impl std::fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningKeyPair({})", hex::encode(&self.public[..8]))
    }
}

/// Generate an Ed25519 keypair
///
/// # Returns
/// (public_key, private_key) - Both as 32-byte arrays
pub fn generate_keypair() -> ([u8; 32], [u8; 32]) {
    let signing_key = SigningKey::generate(&mut OsRng);
    (signing_key.verifying_key().to_bytes(), signing_key.to_bytes())
}

/// Sign data with an Ed25519 private key, returning the 64-byte signature.
pub fn sign_data(data: &[u8], private_key: &[u8]) -> Result<[u8; 64]> {
    let key_bytes: [u8; 32] = private_key
        .try_into()
        .map_err(|_| SigningError::InvalidKeyLength)?;
    let signing_key = SigningKey::from_bytes(&key_bytes);
    Ok(signing_key.sign(data).to_bytes())
}

/// Verify an Ed25519 signature.
///
/// Peer-supplied keys and signatures flow through here, so every failure
/// (bad length, point not on the curve, wrong signature) is just `false`.
pub fn verify_signature(data: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
    let Ok(pub_bytes) = <[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&pub_bytes) else {
        return false;
    };
    verifying_key
        .verify(data, &Signature::from_bytes(&sig_bytes))
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_digest() {
        let pair = SigningKeyPair::generate();
        let digest = *blake3::hash(b"group op").as_bytes();

        let sig = pair.sign_digest(&digest).unwrap();
        assert!(verify_signature(&digest, &sig, &pair.public_key()));
    }

    #[test]
    fn test_verify_rejects_flipped_byte() {
        let pair = SigningKeyPair::generate();
        let digest = [7u8; 32];
        let mut sig = pair.sign_digest(&digest).unwrap();
        sig[10] ^= 0x01;
        assert!(!verify_signature(&digest, &sig, &pair.public_key()));
    }

    #[test]
    fn test_verify_garbage_key_is_false_not_error() {
        assert!(!verify_signature(b"x", &[0u8; 64], &[0xFFu8; 32]));
        assert!(!verify_signature(b"x", &[0u8; 12], &[0u8; 32]));
        assert!(!verify_signature(b"x", &[0u8; 64], &[0u8; 5]));
    }

    #[test]
    fn test_from_private_matches_generated() {
        let (public, private) = generate_keypair();
        let pair = SigningKeyPair::from_private(private);
        assert_eq!(pair.public(), public);
    }

    #[test]
    fn test_sign_rejects_short_key() {
        assert_eq!(
            sign_data(b"data", &[1u8; 16]).unwrap_err(),
            SigningError::InvalidKeyLength
        );
    }
}
