/// Group metadata: one LWW register per key (name, icon, topic).
///
/// Values stay sealed under the group secret. The register with the
/// greatest writer OpID wins.
use std::collections::BTreeMap;
use thiserror::Error;

use crate::crdt::ids::OpID;
use crate::crdt::ops::{MetadataKey, MetadataSetPayload, OpEnvelope, SealedContent};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    #[error("Payload decode error: {0}")]
    PayloadDecode(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LWWRegister {
    pub value: SealedContent,
    pub writer_op: OpID,
    pub timestamp_ms: u64,
}

#[derive(Clone, Debug, Default)]
pub struct MetadataState {
    registers: BTreeMap<MetadataKey, LWWRegister>,
}

impl MetadataState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registers(&self) -> &BTreeMap<MetadataKey, LWWRegister> {
        &self.registers
    }

    pub fn get(&self, key: &MetadataKey) -> Option<&LWWRegister> {
        self.registers.get(key)
    }

    /// Returns whether the register changed.
    pub fn apply_metadata_set(&mut self, op: &OpEnvelope) -> Result<bool, MetadataError> {
        let payload: MetadataSetPayload = op
            .decode_payload()
            .map_err(|e| MetadataError::PayloadDecode(e.to_string()))?;

        if let Some(reg) = self.registers.get(&payload.key) {
            if op.op_id <= reg.writer_op {
                return Ok(false);
            }
        }
        self.registers.insert(
            payload.key,
            LWWRegister {
                value: payload.value,
                writer_op: op.op_id,
                timestamp_ms: op.timestamp_ms,
            },
        );
        Ok(true)
    }
}
