use chrono::Utc;
use dbft_types::{
    BlockIndex, ByzantineViolation, ByzantineViolationType, ConsensusError, Hash256,
    ValidatorIndex, ViewNumber,
};
use std::collections::{HashMap, VecDeque};
use tracing::{error, warn};

use crate::messages::Envelope;

const MAX_RETAINED_VIOLATIONS: usize = 256;

/// Builds evidence records for provable misbehaviour seen at the message
/// boundary. Offending messages are always dropped by the caller; this only
/// keeps the record.
#[derive(Default)]
pub struct ByzantineDetector {
    recent: VecDeque<ByzantineViolation>,
    counts: HashMap<ValidatorIndex, u64>,
}

impl ByzantineDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalid_signature(
        &mut self,
        envelope: &Envelope,
        error: &ConsensusError,
    ) -> ByzantineViolation {
        warn!(
            "Invalid signature on {} from validator {}",
            envelope, envelope.validator_index
        );

        self.record(
            envelope.validator_index,
            envelope.block_index,
            envelope.view,
            ByzantineViolationType::InvalidSignature,
            serde_json::json!({
                "kind": envelope.kind().to_string(),
                "signature": hex::encode(&envelope.signature),
                "error": error.to_string(),
            }),
        )
    }

    pub fn conflicting_commit(
        &mut self,
        envelope: &Envelope,
        existing: Hash256,
        conflicting: Hash256,
    ) -> ByzantineViolation {
        warn!(
            "Conflicting commit from validator {} at height {}: {} then {}",
            envelope.validator_index, envelope.block_index, existing, conflicting
        );

        self.record(
            envelope.validator_index,
            envelope.block_index,
            envelope.view,
            ByzantineViolationType::ConflictingCommit,
            serde_json::json!({
                "existing_block_hash": existing.to_string(),
                "conflicting_block_hash": conflicting.to_string(),
                "view": envelope.view.0,
            }),
        )
    }

    pub fn conflicting_preparation(
        &mut self,
        envelope: &Envelope,
        existing: Hash256,
        conflicting: Hash256,
    ) -> ByzantineViolation {
        warn!(
            "Conflicting preparation from validator {} at height {} view {}",
            envelope.validator_index, envelope.block_index, envelope.view
        );

        self.record(
            envelope.validator_index,
            envelope.block_index,
            envelope.view,
            ByzantineViolationType::ConflictingPreparation,
            serde_json::json!({
                "existing_preparation_hash": existing.to_string(),
                "conflicting_preparation_hash": conflicting.to_string(),
            }),
        )
    }

    pub fn conflicting_proposal(
        &mut self,
        envelope: &Envelope,
        existing: &Envelope,
    ) -> ByzantineViolation {
        warn!(
            "Primary {} sent two different proposals at height {} view {}",
            envelope.validator_index, envelope.block_index, envelope.view
        );

        self.record(
            envelope.validator_index,
            envelope.block_index,
            envelope.view,
            ByzantineViolationType::ConflictingProposal,
            serde_json::json!({
                "existing_signature": hex::encode(&existing.signature),
                "conflicting_signature": hex::encode(&envelope.signature),
            }),
        )
    }

    pub fn unauthorized_proposal(
        &mut self,
        envelope: &Envelope,
        expected_primary: ValidatorIndex,
    ) -> ByzantineViolation {
        warn!(
            "Validator {} proposed at height {} view {} but primary is {}",
            envelope.validator_index, envelope.block_index, envelope.view, expected_primary
        );

        self.record(
            envelope.validator_index,
            envelope.block_index,
            envelope.view,
            ByzantineViolationType::UnauthorizedProposal,
            serde_json::json!({
                "expected_primary": expected_primary.0,
            }),
        )
    }

    fn record(
        &mut self,
        validator_index: ValidatorIndex,
        block_index: BlockIndex,
        view: ViewNumber,
        violation_type: ByzantineViolationType,
        evidence: serde_json::Value,
    ) -> ByzantineViolation {
        let violation = ByzantineViolation {
            validator_index,
            block_index,
            view,
            violation_type,
            evidence,
            detected_at: Utc::now(),
        };

        *self.counts.entry(validator_index).or_default() += 1;
        if self.recent.len() == MAX_RETAINED_VIOLATIONS {
            self.recent.pop_front();
        }
        self.recent.push_back(violation.clone());

        error!(
            "Byzantine violation recorded: validator={} type={} height={} view={}",
            validator_index, violation_type, block_index, view
        );

        violation
    }

    pub fn violation_count(&self, validator_index: ValidatorIndex) -> u64 {
        self.counts.get(&validator_index).copied().unwrap_or(0)
    }

    pub fn total_violations(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn recent(&self) -> impl Iterator<Item = &ByzantineViolation> {
        self.recent.iter()
    }
}
