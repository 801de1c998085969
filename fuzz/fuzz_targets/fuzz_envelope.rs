#![no_main]
use libfuzzer_sys::fuzz_target;
use shield_groups::crdt::ops::{decode_op_batch, encode_op_batch, OpEnvelope};

/// Fuzz op envelope and batch decoding.
///
/// Peer bytes must decode to a typed error, never panic. Whatever decodes
/// must verify without panicking and re-encode to something that decodes
/// to the same envelope.
fuzz_target!(|data: &[u8]| {
    if let Ok(op) = OpEnvelope::from_bytes(data) {
        let _ = op.verify();
        let _ = op.content_hash();
        if let Ok(bytes) = op.to_bytes() {
            let again = OpEnvelope::from_bytes(&bytes).expect("re-encoded envelope must decode");
            assert_eq!(again, op);
        }
    }

    if let Ok(ops) = decode_op_batch(data) {
        if let Ok(bytes) = encode_op_batch(&ops) {
            let again = decode_op_batch(&bytes).expect("re-encoded batch must decode");
            assert_eq!(again.len(), ops.len());
        }
    }
});
