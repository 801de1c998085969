/// Op-log guardrails.
///
/// These bound op-log growth, sync bandwidth and buffered state so a group
/// cannot exhaust a phone's memory or a Tor circuit's bandwidth. Tunables
/// that deployments legitimately change live in `EngineConfig`; these don't.
use serde::Serialize;

/// Max CBOR payload size per op.
pub const MAX_OP_PAYLOAD_BYTES: usize = 64 * 1024; // 64 KB

/// Max bincode size of a whole envelope (payload + deps + fixed fields).
pub const MAX_ENVELOPE_BYTES: u64 = 96 * 1024;

/// Max explicit dependencies one op may name.
pub const MAX_DEPS_PER_OP: usize = 64;

/// Ops per group before the UI should warn.
pub const MAX_OPS_PER_GROUP: usize = 250_000;

/// Hard cap. Non-membership ops are rejected beyond this.
pub const HARD_CAP_OPS_PER_GROUP: usize = 500_000;

/// Default for `EngineConfig::max_ops_per_sync_round`.
pub const MAX_OPS_PER_SYNC_ROUND: usize = 1_000;

/// Max bytes per sync round (all chunks combined).
pub const MAX_BYTES_PER_SYNC_ROUND: usize = 10 * 1024 * 1024; // 10 MB

/// Max ops per sync chunk.
pub const MAX_OPS_PER_CHUNK: usize = 256;

/// Max op ids in one fetch request.
pub const MAX_FETCH_IDS: usize = 512;

/// Max bincode size of one wire frame. A full chunk of max-size ops fits.
pub const MAX_FRAME_BYTES: u64 = 32 * 1024 * 1024;

/// Max ops in one length-prefixed batch.
pub const MAX_OPS_PER_BATCH: usize = 10_000;

/// Max UTF-8 bytes of a report reason.
pub const MAX_REPORT_REASON_BYTES: usize = 512;

/// Max UTF-8 bytes of a reaction emoji.
pub const MAX_EMOJI_BYTES: usize = 64;

/// Rejected-signature cache capacity.
pub const REJECTED_OP_CACHE_SIZE: usize = 4_096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OpLimitStatus {
    /// Under the soft cap.
    Ok,
    /// Past the soft cap. Still accepting.
    NeedsCompaction,
    /// Hard cap reached. Only membership ops are applied.
    HardCapReached,
}

pub fn check_op_limits(op_count: usize) -> OpLimitStatus {
    if op_count >= HARD_CAP_OPS_PER_GROUP {
        OpLimitStatus::HardCapReached
    } else if op_count >= MAX_OPS_PER_GROUP {
        OpLimitStatus::NeedsCompaction
    } else {
        OpLimitStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_limits_boundaries() {
        assert_eq!(check_op_limits(0), OpLimitStatus::Ok);
        assert_eq!(check_op_limits(MAX_OPS_PER_GROUP - 1), OpLimitStatus::Ok);
        assert_eq!(
            check_op_limits(MAX_OPS_PER_GROUP),
            OpLimitStatus::NeedsCompaction
        );
        assert_eq!(
            check_op_limits(HARD_CAP_OPS_PER_GROUP - 1),
            OpLimitStatus::NeedsCompaction
        );
        assert_eq!(
            check_op_limits(HARD_CAP_OPS_PER_GROUP),
            OpLimitStatus::HardCapReached
        );
    }

    #[test]
    fn test_envelope_cap_covers_payload() {
        assert!(MAX_ENVELOPE_BYTES as usize > MAX_OP_PAYLOAD_BYTES);
        assert!(MAX_FRAME_BYTES as usize > MAX_OPS_PER_CHUNK * MAX_ENVELOPE_BYTES as usize);
    }
}
