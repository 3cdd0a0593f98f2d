use dbft_types::{ConsensusError, Hash256, PublicKey, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 32 {
            return Err(ConsensusError::ConfigError(
                "Invalid key length: expected 32 bytes".to_string(),
            ));
        }

        let signing_key = SigningKey::from_bytes(
            bytes
                .try_into()
                .map_err(|_| ConsensusError::ConfigError("Failed to parse signing key".to_string()))?,
        );
        let verifying_key = signing_key.verifying_key();

        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    /// Deterministic key derived from a seed phrase. Only meant for local
    /// development networks where every validator knows every seed.
    pub fn from_seed(seed: &str) -> Self {
        let digest: [u8; 32] = Sha256::digest(seed.as_bytes()).into();
        let signing_key = SigningKey::from_bytes(&digest);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signature = self.signing_key.sign(message);
        signature.to_bytes().to_vec()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.verifying_key.to_bytes())
    }

    pub fn private_key(&self) -> Vec<u8> {
        self.signing_key.to_bytes().to_vec()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

pub fn verify_signature(public_key: &PublicKey, message: &[u8], signature: &[u8]) -> Result<()> {
    if signature.len() != 64 {
        return Err(ConsensusError::InvalidSignature);
    }

    let verifying_key =
        VerifyingKey::from_bytes(public_key.as_bytes()).map_err(|_| ConsensusError::InvalidSignature)?;

    let signature = Signature::from_bytes(
        signature
            .try_into()
            .map_err(|_| ConsensusError::InvalidSignature)?,
    );

    verifying_key
        .verify(message, &signature)
        .map_err(|_| ConsensusError::InvalidSignature)
}

pub fn hash_data(data: &[u8]) -> Hash256 {
    Hash256::digest(data)
}

/// Binary Merkle root over transaction hashes. An odd node is paired with
/// itself; an empty list hashes to zero.
pub fn merkle_root(hashes: &[Hash256]) -> Hash256 {
    if hashes.is_empty() {
        return Hash256::ZERO;
    }

    let mut level: Vec<Hash256> = hashes.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let left = pair[0];
                let right = pair.get(1).copied().unwrap_or(left);
                let mut data = [0u8; 64];
                data[..32].copy_from_slice(left.as_bytes());
                data[32..].copy_from_slice(right.as_bytes());
                hash_data(&data)
            })
            .collect();
    }

    level[0]
}
