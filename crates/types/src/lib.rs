use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Unauthorized sender: validator {validator} may not send {kind}")]
    UnauthorizedSender { validator: ValidatorIndex, kind: String },

    #[error("Stale message: {0}")]
    StaleMessage(String),

    #[error("Invalid proposal: {0}")]
    InvalidProposal(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Storage rejected block {block_index}: {reason}")]
    StorageRejected { block_index: BlockIndex, reason: String },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Crypto error: {0}")]
    CryptoError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Consensus service stopped")]
    ServiceStopped,
}

impl ConsensusError {
    /// Only a broken local invariant halts the node. Everything else is
    /// dropped at the message boundary or retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConsensusError::InvariantViolation(_))
    }
}

pub type Result<T> = std::result::Result<T, ConsensusError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValidatorIndex(pub u16);

impl fmt::Display for ValidatorIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for ValidatorIndex {
    fn from(index: u16) -> Self {
        ValidatorIndex(index)
    }
}

impl ValidatorIndex {
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BlockIndex(pub u32);

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for BlockIndex {
    fn from(index: u32) -> Self {
        BlockIndex(index)
    }
}

impl BlockIndex {
    pub fn next(self) -> Self {
        BlockIndex(self.0.saturating_add(1))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ViewNumber(pub u8);

impl fmt::Display for ViewNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for ViewNumber {
    fn from(view: u8) -> Self {
        ViewNumber(view)
    }
}

impl ViewNumber {
    pub fn next(self) -> Self {
        ViewNumber(self.0.saturating_add(1))
    }
}

/// SHA-256 digest used for block hashes, transaction hashes and the
/// validator-set commitment.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Hash256(hasher.finalize().into())
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; 32] = bytes.try_into().map_err(|_| {
            ConsensusError::MalformedMessage(format!("Invalid hash length: {} bytes", bytes.len()))
        })?;
        Ok(Hash256(array))
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| ConsensusError::MalformedMessage(format!("Invalid hash hex: {}", e)))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({}..)", &hex::encode(self.0)[..12])
    }
}

/// Ed25519 verifying key of a validator.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; 32] = bytes.try_into().map_err(|_| {
            ConsensusError::CryptoError(format!("Invalid public key length: {} bytes", bytes.len()))
        })?;
        Ok(PublicKey(array))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}..)", &hex::encode(self.0)[..12])
    }
}

/// Ordered validator set for one height. Position in the list is the
/// validator index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidatorSet {
    validators: Vec<PublicKey>,
}

impl ValidatorSet {
    pub fn new(validators: Vec<PublicKey>) -> Result<Self> {
        if validators.is_empty() {
            return Err(ConsensusError::ConfigError(
                "Validator set must contain at least 1 validator".to_string(),
            ));
        }

        if validators.len() > u16::MAX as usize {
            return Err(ConsensusError::ConfigError(format!(
                "Validator set too large: {} validators",
                validators.len()
            )));
        }

        for (i, key) in validators.iter().enumerate() {
            if validators[..i].contains(key) {
                return Err(ConsensusError::ConfigError(format!(
                    "Duplicate validator key at index {}: {}",
                    i, key
                )));
            }
        }

        Ok(Self { validators })
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Maximum number of faulty validators tolerated.
    pub fn f(&self) -> usize {
        (self.len() - 1) / 3
    }

    /// Quorum size.
    pub fn m(&self) -> usize {
        self.len() - self.f()
    }

    /// `(block_index - view) mod N`, evaluated without underflow.
    pub fn primary_index(&self, block_index: BlockIndex, view: ViewNumber) -> ValidatorIndex {
        let n = self.len() as i64;
        let p = (block_index.0 as i64 - view.0 as i64).rem_euclid(n);
        ValidatorIndex(p as u16)
    }

    pub fn get(&self, index: ValidatorIndex) -> Option<&PublicKey> {
        self.validators.get(index.as_usize())
    }

    pub fn contains_index(&self, index: ValidatorIndex) -> bool {
        index.as_usize() < self.len()
    }

    pub fn index_of(&self, key: &PublicKey) -> Option<ValidatorIndex> {
        self.validators
            .iter()
            .position(|k| k == key)
            .map(|i| ValidatorIndex(i as u16))
    }

    pub fn iter(&self) -> impl Iterator<Item = (ValidatorIndex, &PublicKey)> {
        self.validators
            .iter()
            .enumerate()
            .map(|(i, k)| (ValidatorIndex(i as u16), k))
    }

    /// Commitment to this validator set, carried as `next_consensus`.
    pub fn consensus_hash(&self) -> Hash256 {
        let mut data = Vec::with_capacity(self.len() * 32);
        for key in &self.validators {
            data.extend_from_slice(key.as_bytes());
        }
        Hash256::digest(&data)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_hash: Hash256,
    pub index: BlockIndex,
    pub timestamp_ms: u64,
    pub nonce: u64,
    pub next_consensus: Hash256,
    pub primary_index: ValidatorIndex,
    pub merkle_root: Hash256,
}

impl BlockHeader {
    /// Hash over a fixed little-endian field layout.
    pub fn hash(&self) -> Hash256 {
        let mut data = Vec::with_capacity(4 + 32 + 4 + 8 + 8 + 32 + 2 + 32);
        data.extend_from_slice(&self.version.to_le_bytes());
        data.extend_from_slice(self.prev_hash.as_bytes());
        data.extend_from_slice(&self.index.0.to_le_bytes());
        data.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        data.extend_from_slice(&self.nonce.to_le_bytes());
        data.extend_from_slice(self.next_consensus.as_bytes());
        data.extend_from_slice(&self.primary_index.0.to_le_bytes());
        data.extend_from_slice(self.merkle_root.as_bytes());
        Hash256::digest(&data)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Hash256>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn index(&self) -> BlockIndex {
        self.header.index
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitSignature {
    pub validator_index: ValidatorIndex,
    pub signature: Vec<u8>,
}

/// A block together with the quorum of commit signatures that finalized it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FinalizedBlock {
    pub block: Block,
    pub signatures: Vec<CommitSignature>,
}

impl FinalizedBlock {
    pub fn hash(&self) -> Hash256 {
        self.block.hash()
    }

    pub fn index(&self) -> BlockIndex {
        self.block.index()
    }
}

/// Snapshot of the last persisted block.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainTip {
    pub height: BlockIndex,
    pub hash: Hash256,
    pub timestamp_ms: u64,
}

impl ChainTip {
    pub fn genesis(timestamp_ms: u64) -> Self {
        Self {
            height: BlockIndex(0),
            hash: Hash256::ZERO,
            timestamp_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ChangeViewReason {
    Timeout,
    ChangeAgreement,
    TxNotFound,
    TxRejectedByPolicy,
    TxInvalid,
    BlockRejectedByPolicy,
}

impl fmt::Display for ChangeViewReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeViewReason::Timeout => write!(f, "TIMEOUT"),
            ChangeViewReason::ChangeAgreement => write!(f, "CHANGE_AGREEMENT"),
            ChangeViewReason::TxNotFound => write!(f, "TX_NOT_FOUND"),
            ChangeViewReason::TxRejectedByPolicy => write!(f, "TX_REJECTED_BY_POLICY"),
            ChangeViewReason::TxInvalid => write!(f, "TX_INVALID"),
            ChangeViewReason::BlockRejectedByPolicy => write!(f, "BLOCK_REJECTED_BY_POLICY"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ByzantineViolationType {
    InvalidSignature,
    ConflictingCommit,
    ConflictingPreparation,
    ConflictingProposal,
    UnauthorizedProposal,
}

impl fmt::Display for ByzantineViolationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ByzantineViolationType::InvalidSignature => write!(f, "INVALID_SIGNATURE"),
            ByzantineViolationType::ConflictingCommit => write!(f, "CONFLICTING_COMMIT"),
            ByzantineViolationType::ConflictingPreparation => write!(f, "CONFLICTING_PREPARATION"),
            ByzantineViolationType::ConflictingProposal => write!(f, "CONFLICTING_PROPOSAL"),
            ByzantineViolationType::UnauthorizedProposal => write!(f, "UNAUTHORIZED_PROPOSAL"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ByzantineViolation {
    pub validator_index: ValidatorIndex,
    pub block_index: BlockIndex,
    pub view: ViewNumber,
    pub violation_type: ByzantineViolationType,
    pub evidence: serde_json::Value,
    pub detected_at: DateTime<Utc>,
}

/// Numeric consensus settings shared by every validator of a network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsensusSettings {
    pub block_time_ms: u64,
    pub max_transactions_per_block: usize,
    pub max_future_drift_ms: u64,
    pub persist_retry_base_ms: u64,
    pub persist_retry_max_ms: u64,
}

impl Default for ConsensusSettings {
    fn default() -> Self {
        Self {
            block_time_ms: 15_000,
            max_transactions_per_block: 500,
            max_future_drift_ms: 10 * 60 * 1000,
            persist_retry_base_ms: 100,
            persist_retry_max_ms: 5_000,
        }
    }
}

impl ConsensusSettings {
    pub fn new(block_time_ms: u64, max_transactions_per_block: usize) -> Result<Self> {
        let settings = Self {
            block_time_ms,
            max_transactions_per_block,
            ..Self::default()
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_time_ms == 0 {
            return Err(ConsensusError::ConfigError(
                "Block time must be at least 1ms".to_string(),
            ));
        }

        if self.max_transactions_per_block == 0 {
            return Err(ConsensusError::ConfigError(
                "Max transactions per block must be at least 1".to_string(),
            ));
        }

        if self.persist_retry_base_ms == 0 || self.persist_retry_max_ms < self.persist_retry_base_ms {
            return Err(ConsensusError::ConfigError(format!(
                "Invalid persist retry window: base {}ms, max {}ms",
                self.persist_retry_base_ms, self.persist_retry_max_ms
            )));
        }

        Ok(())
    }

    pub fn block_time(&self) -> Duration {
        Duration::from_millis(self.block_time_ms)
    }

    /// `block_time << (view + 1)`, saturating.
    pub fn view_timeout(&self, view: ViewNumber) -> Duration {
        let shift = (view.0 as u32 + 1).min(32);
        Duration::from_millis(self.block_time_ms.saturating_mul(1u64 << shift))
    }
}

pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: u8) -> Vec<PublicKey> {
        (0..n).map(|i| PublicKey([i + 1; 32])).collect()
    }

    #[test]
    fn test_fault_tolerance_thresholds() {
        let cases = [(1, 0, 1), (2, 0, 2), (3, 0, 3), (4, 1, 3), (7, 2, 5), (10, 3, 7)];
        for (n, f, m) in cases {
            let set = ValidatorSet::new(keys(n)).unwrap();
            assert_eq!(set.f(), f, "f for N={}", n);
            assert_eq!(set.m(), m, "M for N={}", n);
        }
    }

    #[test]
    fn test_primary_rotation() {
        let set = ValidatorSet::new(keys(7)).unwrap();
        let block = BlockIndex(100);
        // 100 mod 7 = 2
        let expected = [2u16, 1, 0, 6, 5, 4, 3];
        for (view, want) in expected.iter().enumerate() {
            assert_eq!(
                set.primary_index(block, ViewNumber(view as u8)),
                ValidatorIndex(*want)
            );
        }
    }

    #[test]
    fn test_primary_index_no_underflow() {
        let set = ValidatorSet::new(keys(4)).unwrap();
        assert_eq!(set.primary_index(BlockIndex(0), ViewNumber(1)), ValidatorIndex(3));
        assert_eq!(set.primary_index(BlockIndex(1), ViewNumber(255)), ValidatorIndex(2));
    }

    #[test]
    fn test_validator_set_rejects_duplicates() {
        let mut k = keys(3);
        k.push(k[0]);
        assert!(ValidatorSet::new(k).is_err());
        assert!(ValidatorSet::new(vec![]).is_err());
    }

    #[test]
    fn test_header_hash_changes_with_fields() {
        let header = BlockHeader {
            version: 0,
            prev_hash: Hash256::ZERO,
            index: BlockIndex(1),
            timestamp_ms: 1000,
            nonce: 7,
            next_consensus: Hash256::ZERO,
            primary_index: ValidatorIndex(1),
            merkle_root: Hash256::ZERO,
        };
        let mut other = header.clone();
        other.nonce = 8;

        assert_eq!(header.hash(), header.clone().hash());
        assert_ne!(header.hash(), other.hash());
    }

    #[test]
    fn test_settings_validation() {
        assert!(ConsensusSettings::new(0, 10).is_err());
        assert!(ConsensusSettings::new(1000, 0).is_err());

        let settings = ConsensusSettings::new(1000, 10).unwrap();
        assert_eq!(settings.view_timeout(ViewNumber(0)), Duration::from_millis(2000));
        assert_eq!(settings.view_timeout(ViewNumber(2)), Duration::from_millis(8000));
        assert_eq!(
            settings.view_timeout(ViewNumber(200)),
            Duration::from_millis(1000u64 << 32)
        );
    }

    #[test]
    fn test_hash_hex_roundtrip() {
        let hash = Hash256::digest(b"block");
        assert_eq!(Hash256::from_hex(&hash.to_string()).unwrap(), hash);
        assert!(Hash256::from_hex("abcd").is_err());
    }

    #[test]
    fn test_only_invariant_violation_is_fatal() {
        assert!(ConsensusError::InvariantViolation("x".into()).is_fatal());
        assert!(!ConsensusError::InvalidSignature.is_fatal());
        assert!(!ConsensusError::StorageRejected {
            block_index: BlockIndex(1),
            reason: "busy".into()
        }
        .is_fatal());
    }
}
