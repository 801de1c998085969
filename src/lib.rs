//! # Shield Groups
//!
//! **End-to-end encrypted group membership and messaging over a causal op log.**
//!
//! A group is an append-only log of signed operations. Every action (create,
//! invite, accept, remove, role change, mute, report, metadata change,
//! message, edit, delete, react) is one immutable op. Devices converge by
//! exchanging the ops they miss and folding them in causal order; the fold
//! decides what each op was allowed to do at the moment it was made.
//!
//! Content is sealed under a group secret. The secret rotates when a member
//! is removed and is delivered to members sealed to their X25519 keys.
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`crypto`] | Ed25519 signing, X25519 agreement, XChaCha20-Poly1305 |
//! | [`crdt`] | Op envelope, causal clock, op store, fold, projections |
//! | [`sync`] | Sync digests, wire frames, outbound dispatcher |
//! | [`engine`] | Per-group engine and actor, the `Messenger` API |
//! | [`query`] | JSON views for the UI layer |
//! | [`persistence`] | Op log and clock storage traits |
//! | [`config`] | `EngineConfig` |
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `std` | Yes | Standard library support |
//! | `android` | No | Route `log` output to logcat |
//! | `wasm` | No | WebAssembly support (`getrandom/js`) |

// Stylistic lints only.
#![allow(
    clippy::too_many_arguments,
    clippy::type_complexity,
    clippy::doc_lazy_continuation
)]

pub mod config;
pub mod crdt;
pub mod crypto;
pub mod engine;
pub mod persistence;
pub mod query;
pub mod sync;

pub use config::{ConfigError, EngineConfig};
pub use crdt::{
    AppendResult, ConversationEntry, DeviceID, EntryKind, GroupID, MemberEntry, MessageBody,
    MetadataKey, MetadataValue, OpEnvelope, OpID, OpType, Role,
};
pub use engine::{
    EngineContext, EngineError, GroupEvent, KeyStore, MemoryDirectory, MemoryKeyStore, Messenger,
    PeerDirectory,
};
pub use persistence::{ClockStore, MemoryClockStore, MemoryOpLog, OpLogStore};
pub use sync::{PeerAddress, Transport, TransportError};

// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install the Android logger. No-op when called twice.
#[cfg(feature = "android")]
pub fn init_android_logging() {
    android_logger::init_once(
        android_logger::Config::default()
            .with_max_level(log::LevelFilter::Info)
            .with_tag("ShieldGroups"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
