//! Consensus envelopes and their payloads.
//!
//! Every consensus message travels as an [`Envelope`]: the routing header
//! (height, sender, view) plus one [`ConsensusPayload`], signed by the
//! sender over [`Envelope::signing_bytes`].

use dbft_crypto::{verify_signature, KeyPair};
use dbft_types::{
    BlockIndex, ChangeViewReason, ConsensusError, Hash256, Result, ValidatorIndex, ValidatorSet,
    ViewNumber,
};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::codec;

/// Domain prefix for preparation signatures, so they can never be replayed
/// as commit signatures over the same block hash.
pub const PREPARATION_DOMAIN: &[u8] = b"dbft-prepare";

/// Wire tag of each payload kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadKind {
    PrepareRequest = 0x20,
    PrepareResponse = 0x21,
    ChangeView = 0x00,
    Commit = 0x30,
    RecoveryRequest = 0x40,
    RecoveryMessage = 0x41,
}

impl PayloadKind {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x20 => Some(PayloadKind::PrepareRequest),
            0x21 => Some(PayloadKind::PrepareResponse),
            0x00 => Some(PayloadKind::ChangeView),
            0x30 => Some(PayloadKind::Commit),
            0x40 => Some(PayloadKind::RecoveryRequest),
            0x41 => Some(PayloadKind::RecoveryMessage),
            _ => None,
        }
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadKind::PrepareRequest => write!(f, "PrepareRequest"),
            PayloadKind::PrepareResponse => write!(f, "PrepareResponse"),
            PayloadKind::ChangeView => write!(f, "ChangeView"),
            PayloadKind::Commit => write!(f, "Commit"),
            PayloadKind::RecoveryRequest => write!(f, "RecoveryRequest"),
            PayloadKind::RecoveryMessage => write!(f, "RecoveryMessage"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrepareRequest {
    pub timestamp_ms: u64,
    pub nonce: u64,
    pub next_consensus: Hash256,
    pub transaction_hashes: Vec<Hash256>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrepareResponse {
    pub preparation_hash: Hash256,
    pub preparation_signature: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeView {
    pub new_view: ViewNumber,
    pub reason: ChangeViewReason,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Commit {
    pub block_hash: Hash256,
    pub block_signature: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecoveryRequest {
    pub timestamp_ms: u64,
}

/// A payload lifted out of its envelope for inclusion in a recovery
/// message. Keeps the original view and signature so the receiver can
/// rebuild and verify the envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recovered<T> {
    pub validator_index: ValidatorIndex,
    pub view: ViewNumber,
    pub payload: T,
    pub signature: Vec<u8>,
}

impl<T: Into<ConsensusPayload>> Recovered<T> {
    pub fn into_envelope(self, block_index: BlockIndex) -> Envelope {
        Envelope {
            block_index,
            validator_index: self.validator_index,
            view: self.view,
            payload: self.payload.into(),
            signature: self.signature,
        }
    }
}

/// Snapshot of everything a node knows about the current round. Recovered
/// entries cannot themselves be recovery messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RecoveryMessage {
    pub change_views: Vec<Recovered<ChangeView>>,
    pub prepare_request: Option<Recovered<PrepareRequest>>,
    pub prepare_responses: Vec<Recovered<PrepareResponse>>,
    pub commits: Vec<Recovered<Commit>>,
}

impl RecoveryMessage {
    /// Inner envelopes in replay order: change views, proposal,
    /// preparations, commits.
    pub fn into_envelopes(self, block_index: BlockIndex) -> Vec<Envelope> {
        let mut envelopes = Vec::with_capacity(
            self.change_views.len() + 1 + self.prepare_responses.len() + self.commits.len(),
        );
        envelopes.extend(self.change_views.into_iter().map(|r| r.into_envelope(block_index)));
        envelopes.extend(self.prepare_request.map(|r| r.into_envelope(block_index)));
        envelopes.extend(
            self.prepare_responses
                .into_iter()
                .map(|r| r.into_envelope(block_index)),
        );
        envelopes.extend(self.commits.into_iter().map(|r| r.into_envelope(block_index)));
        envelopes
    }

    pub fn len(&self) -> usize {
        self.change_views.len()
            + usize::from(self.prepare_request.is_some())
            + self.prepare_responses.len()
            + self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConsensusPayload {
    PrepareRequest(PrepareRequest),
    PrepareResponse(PrepareResponse),
    ChangeView(ChangeView),
    Commit(Commit),
    RecoveryRequest(RecoveryRequest),
    RecoveryMessage(RecoveryMessage),
}

impl ConsensusPayload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            ConsensusPayload::PrepareRequest(_) => PayloadKind::PrepareRequest,
            ConsensusPayload::PrepareResponse(_) => PayloadKind::PrepareResponse,
            ConsensusPayload::ChangeView(_) => PayloadKind::ChangeView,
            ConsensusPayload::Commit(_) => PayloadKind::Commit,
            ConsensusPayload::RecoveryRequest(_) => PayloadKind::RecoveryRequest,
            ConsensusPayload::RecoveryMessage(_) => PayloadKind::RecoveryMessage,
        }
    }
}

impl From<PrepareRequest> for ConsensusPayload {
    fn from(p: PrepareRequest) -> Self {
        ConsensusPayload::PrepareRequest(p)
    }
}

impl From<PrepareResponse> for ConsensusPayload {
    fn from(p: PrepareResponse) -> Self {
        ConsensusPayload::PrepareResponse(p)
    }
}

impl From<ChangeView> for ConsensusPayload {
    fn from(p: ChangeView) -> Self {
        ConsensusPayload::ChangeView(p)
    }
}

impl From<Commit> for ConsensusPayload {
    fn from(p: Commit) -> Self {
        ConsensusPayload::Commit(p)
    }
}

impl From<RecoveryRequest> for ConsensusPayload {
    fn from(p: RecoveryRequest) -> Self {
        ConsensusPayload::RecoveryRequest(p)
    }
}

impl From<RecoveryMessage> for ConsensusPayload {
    fn from(p: RecoveryMessage) -> Self {
        ConsensusPayload::RecoveryMessage(p)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub block_index: BlockIndex,
    pub validator_index: ValidatorIndex,
    pub view: ViewNumber,
    pub payload: ConsensusPayload,
    pub signature: Vec<u8>,
}

#[derive(Serialize)]
struct UnsignedEnvelope<'a> {
    block_index: BlockIndex,
    validator_index: ValidatorIndex,
    view: ViewNumber,
    payload: &'a ConsensusPayload,
}

impl Envelope {
    pub fn new_signed(
        block_index: BlockIndex,
        validator_index: ValidatorIndex,
        view: ViewNumber,
        payload: ConsensusPayload,
        key: &KeyPair,
    ) -> Result<Self> {
        let mut envelope = Self {
            block_index,
            validator_index,
            view,
            payload,
            signature: Vec::new(),
        };
        envelope.signature = key.sign(&envelope.signing_bytes()?);
        Ok(envelope)
    }

    pub fn kind(&self) -> PayloadKind {
        self.payload.kind()
    }

    /// Canonical bytes covered by the envelope signature.
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        codec::serialize_body(&UnsignedEnvelope {
            block_index: self.block_index,
            validator_index: self.validator_index,
            view: self.view,
            payload: &self.payload,
        })
    }

    /// Checks the envelope signature against the sender's key in `validators`.
    pub fn verify(&self, validators: &ValidatorSet) -> Result<()> {
        let key = validators
            .get(self.validator_index)
            .ok_or_else(|| ConsensusError::UnauthorizedSender {
                validator: self.validator_index,
                kind: self.kind().to_string(),
            })?;
        verify_signature(key, &self.signing_bytes()?, &self.signature)
    }

    pub(crate) fn recovered<T>(&self, payload: T) -> Recovered<T> {
        Recovered {
            validator_index: self.validator_index,
            view: self.view,
            payload,
            signature: self.signature.clone(),
        }
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(height={} view={} from={})",
            self.kind(),
            self.block_index,
            self.view,
            self.validator_index
        )
    }
}

pub fn preparation_signing_bytes(block_hash: &Hash256) -> Vec<u8> {
    let mut data = Vec::with_capacity(PREPARATION_DOMAIN.len() + 32);
    data.extend_from_slice(PREPARATION_DOMAIN);
    data.extend_from_slice(block_hash.as_bytes());
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbft_types::PublicKey;

    fn validators(keys: &[KeyPair]) -> ValidatorSet {
        ValidatorSet::new(keys.iter().map(KeyPair::public_key).collect::<Vec<PublicKey>>()).unwrap()
    }

    #[test]
    fn test_envelope_signature_verifies() {
        let keys: Vec<KeyPair> = (0..4).map(|_| KeyPair::generate()).collect();
        let set = validators(&keys);

        let envelope = Envelope::new_signed(
            BlockIndex(5),
            ValidatorIndex(2),
            ViewNumber(0),
            RecoveryRequest { timestamp_ms: 1 }.into(),
            &keys[2],
        )
        .unwrap();

        assert!(envelope.verify(&set).is_ok());
    }

    #[test]
    fn test_envelope_signature_covers_header() {
        let keys: Vec<KeyPair> = (0..4).map(|_| KeyPair::generate()).collect();
        let set = validators(&keys);

        let mut envelope = Envelope::new_signed(
            BlockIndex(5),
            ValidatorIndex(1),
            ViewNumber(0),
            RecoveryRequest { timestamp_ms: 1 }.into(),
            &keys[1],
        )
        .unwrap();
        envelope.view = ViewNumber(1);
        assert!(envelope.verify(&set).is_err());

        envelope.view = ViewNumber(0);
        envelope.validator_index = ValidatorIndex(2);
        assert!(envelope.verify(&set).is_err());

        envelope.validator_index = ValidatorIndex(9);
        assert!(matches!(
            envelope.verify(&set),
            Err(ConsensusError::UnauthorizedSender { .. })
        ));
    }

    #[test]
    fn test_recovered_envelope_keeps_signature() {
        let keys: Vec<KeyPair> = (0..4).map(|_| KeyPair::generate()).collect();
        let set = validators(&keys);
        let change_view = ChangeView {
            new_view: ViewNumber(1),
            reason: ChangeViewReason::Timeout,
            timestamp_ms: 42,
        };
        let envelope = Envelope::new_signed(
            BlockIndex(3),
            ValidatorIndex(0),
            ViewNumber(0),
            change_view.clone().into(),
            &keys[0],
        )
        .unwrap();

        let recovery = RecoveryMessage {
            change_views: vec![envelope.recovered(change_view)],
            ..RecoveryMessage::default()
        };
        let rebuilt = recovery.into_envelopes(BlockIndex(3));

        assert_eq!(rebuilt, vec![envelope]);
        assert!(rebuilt[0].verify(&set).is_ok());
    }

    #[test]
    fn test_payload_kind_tags() {
        for kind in [
            PayloadKind::PrepareRequest,
            PayloadKind::PrepareResponse,
            PayloadKind::ChangeView,
            PayloadKind::Commit,
            PayloadKind::RecoveryRequest,
            PayloadKind::RecoveryMessage,
        ] {
            assert_eq!(PayloadKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(PayloadKind::from_tag(0xff), None);
    }
}
