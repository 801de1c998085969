pub mod encryption;
pub mod key_exchange;
pub mod signing;

pub use encryption::{derive_key, generate_key, open, seal, EncryptionError};
pub use key_exchange::{
    derive_shared_secret, ephemeral_agreement, generate_static_keypair, KeyExchangeError,
};
pub use signing::{
    generate_keypair, sign_data, verify_signature, DigestSigner, SigningError, SigningKeyPair,
};
