#![no_main]
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use shield_groups::engine::group::GroupEngine;
use shield_groups::engine::{EngineContext, MemoryKeyStore};
use shield_groups::sync::{Frame, PeerAddress};
use shield_groups::{EngineConfig, MemoryClockStore, MemoryOpLog};
use std::sync::Arc;

/// Fuzz frame ingestion.
///
/// Decodes arbitrary bytes as wire frames and feeds whatever decodes into a
/// live group engine. Decoding and handling must only ever fail with typed
/// errors.
#[derive(Arbitrary, Debug)]
struct FrameInput {
    frames: Vec<Vec<u8>>,
    /// Also feed frames addressed to other groups.
    any_group: bool,
}

fuzz_target!(|input: FrameInput| {
    if input.frames.len() > 16 {
        return;
    }
    let ctx = EngineContext {
        keys: Arc::new(MemoryKeyStore::generate()),
        op_log: Arc::new(MemoryOpLog::new()),
        clocks: Arc::new(MemoryClockStore::new()),
        config: EngineConfig::default(),
    };
    let Ok((mut engine, _)) = GroupEngine::create(&ctx, Some("fuzz")) else {
        return;
    };
    let peer = PeerAddress::new("fuzz.onion");

    for bytes in &input.frames {
        let Ok(frame) = Frame::from_bytes(bytes) else {
            continue;
        };
        if !input.any_group && frame.group_id() != engine.group_id() {
            continue;
        }
        let _ = engine.handle_frame(frame.message, &peer);
    }
    let _ = engine.state().state_hash();
});
