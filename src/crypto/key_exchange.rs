use rand::rngs::OsRng;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyExchangeError {
    #[error("Invalid key length")]
    InvalidKeyLength,
    #[error("Non-contributory shared secret (low-order public key)")]
    NonContributory,
}

pub type Result<T> = std::result::Result<T, KeyExchangeError>;

/// Generate a static X25519 keypair
///
/// # Returns
/// (public_key, secret_key) - Both as 32-byte arrays
pub fn generate_static_keypair() -> ([u8; 32], [u8; 32]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);

    (public.to_bytes(), secret.to_bytes())
}

/// X25519 public key for a static private key.
pub fn derive_public_key(private_key: &[u8; 32]) -> [u8; 32] {
    PublicKey::from(&StaticSecret::from(*private_key)).to_bytes()
}

/// Derive shared secret using X25519
///
/// Fails on an all-zero result, which a peer can force with a low-order
/// public key.
pub fn derive_shared_secret(our_private_key: &[u8; 32], their_public_key: &[u8]) -> Result<[u8; 32]> {
    let their: [u8; 32] = their_public_key
        .try_into()
        .map_err(|_| KeyExchangeError::InvalidKeyLength)?;

    let secret = StaticSecret::from(*our_private_key);
    let shared = secret.diffie_hellman(&PublicKey::from(their));
    if !shared.was_contributory() {
        return Err(KeyExchangeError::NonContributory);
    }
    Ok(shared.to_bytes())
}

/// One-shot agreement with a fresh ephemeral key.
///
/// # Returns
/// (ephemeral_public_key, shared_secret)
pub fn ephemeral_agreement(their_public_key: &[u8; 32]) -> Result<([u8; 32], [u8; 32])> {
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    let shared = secret.diffie_hellman(&PublicKey::from(*their_public_key));
    if !shared.was_contributory() {
        return Err(KeyExchangeError::NonContributory);
    }
    Ok((public.to_bytes(), shared.to_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    // RFC 7748 section 6.1
    const ALICE_PRIV: [u8; 32] =
        hex!("77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a");
    const ALICE_PUB: [u8; 32] =
        hex!("8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a");
    const BOB_PRIV: [u8; 32] =
        hex!("5dab087e624a8a4b79e17f8b83800ee66f3bb1292618b6fd1c2f8b27ff88e0eb");
    const BOB_PUB: [u8; 32] =
        hex!("de9edb7d7b7dc1b4d35b61c2ece435373f8343c85b78674dadfc7e146f882b4f");
    const SHARED: [u8; 32] =
        hex!("4a5d9d5ba4ce2de1728e3bf480350f25e07e21c947d19e3376f09b3c1e161742");

    #[test]
    fn test_rfc7748_vector() {
        assert_eq!(derive_public_key(&ALICE_PRIV), ALICE_PUB);
        assert_eq!(derive_public_key(&BOB_PRIV), BOB_PUB);
        assert_eq!(derive_shared_secret(&ALICE_PRIV, &BOB_PUB).unwrap(), SHARED);
        assert_eq!(derive_shared_secret(&BOB_PRIV, &ALICE_PUB).unwrap(), SHARED);
    }

    #[test]
    fn test_ephemeral_matches_static_side() {
        let (bob_pub, bob_priv) = generate_static_keypair();
        let (eph_pub, shared) = ephemeral_agreement(&bob_pub).unwrap();
        assert_eq!(derive_shared_secret(&bob_priv, &eph_pub).unwrap(), shared);
    }

    #[test]
    fn test_low_order_point_rejected() {
        let (_, our_priv) = generate_static_keypair();
        assert_eq!(
            derive_shared_secret(&our_priv, &[0u8; 32]).unwrap_err(),
            KeyExchangeError::NonContributory
        );
    }

    #[test]
    fn test_bad_length_rejected() {
        let (_, our_priv) = generate_static_keypair();
        assert_eq!(
            derive_shared_secret(&our_priv, &[1u8; 31]).unwrap_err(),
            KeyExchangeError::InvalidKeyLength
        );
    }
}
