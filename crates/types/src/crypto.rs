//! BLS12-381 key pairs and aggregate signatures.
//!
//! Finalizer votes are BLS signatures over a proposal digest; quorum
//! certificates carry a single aggregated signature for the whole committee
//! subset that voted. Keys use the `min_pk` parameterization: 48-byte
//! compressed public keys, 96-byte compressed signatures.

use sbor::prelude::*;
use std::fmt;

/// A BLS12-381 signing key pair.
#[derive(Clone)]
pub struct BlsKeyPair {
    secret: blst::min_pk::SecretKey,
}

impl BlsKeyPair {
    /// Generate a new random key pair.
    pub fn generate() -> Self {
        let mut ikm = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut ikm);
        let secret = blst::min_pk::SecretKey::key_gen(&ikm, &[])
            .expect("32 bytes of key material is always sufficient");
        Self { secret }
    }

    /// Derive a key pair from a seed (for testing/simulation).
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let secret = blst::min_pk::SecretKey::key_gen(seed, &[])
            .expect("32 bytes of key material is always sufficient");
        Self { secret }
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> BlsSignature {
        let sig = self.secret.sign(message, &[], &[]);
        BlsSignature(sig.to_bytes().to_vec())
    }

    /// Get the public key.
    pub fn public_key(&self) -> BlsPublicKey {
        BlsPublicKey(self.secret.sk_to_pk().to_bytes().to_vec())
    }
}

impl fmt::Debug for BlsKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlsKeyPair({:?})", self.public_key())
    }
}

/// A BLS12-381 public key (48 bytes compressed).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, BasicSbor)]
#[sbor(transparent)]
pub struct BlsPublicKey(Vec<u8>);

impl BlsPublicKey {
    /// Reconstruct a public key from its compressed encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AggregateError> {
        blst::min_pk::PublicKey::from_bytes(bytes).map_err(|_| AggregateError::InvalidEncoding)?;
        Ok(Self(bytes.to_vec()))
    }

    /// Get the compressed encoding.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Verify a signature over `message`.
    pub fn verify(&self, message: &[u8], signature: &BlsSignature) -> bool {
        let pk = match blst::min_pk::PublicKey::from_bytes(&self.0) {
            Ok(pk) => pk,
            Err(_) => return false,
        };
        let sig = match blst::min_pk::Signature::from_bytes(&signature.0) {
            Ok(sig) => sig,
            Err(_) => return false,
        };
        sig.verify(true, message, &[], &[], &pk, true) == blst::BLST_ERROR::BLST_SUCCESS
    }

    /// Aggregate multiple public keys into one.
    pub fn aggregate(pubkeys: &[BlsPublicKey]) -> Result<Self, AggregateError> {
        if pubkeys.is_empty() {
            return Err(AggregateError::Empty);
        }

        let keys: Vec<_> = pubkeys
            .iter()
            .filter_map(|pk| blst::min_pk::PublicKey::from_bytes(&pk.0).ok())
            .collect();

        if keys.len() != pubkeys.len() {
            return Err(AggregateError::InvalidEncoding);
        }

        let refs: Vec<&blst::min_pk::PublicKey> = keys.iter().collect();
        let agg = blst::min_pk::AggregatePublicKey::aggregate(&refs, false)
            .map_err(|_| AggregateError::AggregationFailed)?;

        Ok(BlsPublicKey(agg.to_public_key().to_bytes().to_vec()))
    }
}

impl fmt::Debug for BlsPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hex::encode(&self.0);
        if hex.len() >= 16 {
            write!(f, "BlsPublicKey({}..{})", &hex[..8], &hex[hex.len() - 8..])
        } else {
            write!(f, "BlsPublicKey({})", hex)
        }
    }
}

/// A BLS12-381 signature (96 bytes compressed), possibly aggregated.
#[derive(Clone, PartialEq, Eq, BasicSbor)]
#[sbor(transparent)]
pub struct BlsSignature(Vec<u8>);

impl BlsSignature {
    /// A placeholder signature (never verifies).
    pub fn zero() -> Self {
        BlsSignature(vec![0u8; 96])
    }

    /// Reconstruct a signature from its compressed encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AggregateError> {
        blst::min_pk::Signature::from_bytes(bytes).map_err(|_| AggregateError::InvalidEncoding)?;
        Ok(Self(bytes.to_vec()))
    }

    /// Get the compressed encoding.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Aggregate multiple signatures into one.
    pub fn aggregate(signatures: &[BlsSignature]) -> Result<Self, AggregateError> {
        if signatures.is_empty() {
            return Err(AggregateError::Empty);
        }

        let sigs: Vec<_> = signatures
            .iter()
            .filter_map(|s| blst::min_pk::Signature::from_bytes(&s.0).ok())
            .collect();

        if sigs.len() != signatures.len() {
            return Err(AggregateError::InvalidEncoding);
        }

        let refs: Vec<&blst::min_pk::Signature> = sigs.iter().collect();
        let agg = blst::min_pk::AggregateSignature::aggregate(&refs, true)
            .map_err(|_| AggregateError::AggregationFailed)?;

        Ok(BlsSignature(agg.to_signature().to_bytes().to_vec()))
    }
}

impl fmt::Debug for BlsSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlsSignature({}..)", &hex::encode(&self.0)[..16])
    }
}

/// Errors that can occur during key/signature operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AggregateError {
    /// Empty list provided.
    #[error("Cannot aggregate empty list")]
    Empty,

    /// Bytes are not a valid curve point.
    #[error("Invalid BLS encoding")]
    InvalidEncoding,

    /// Aggregation operation failed.
    #[error("Aggregation failed")]
    AggregationFailed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let keypair = BlsKeyPair::generate();
        let message = b"test message";

        let signature = keypair.sign(message);
        let pubkey = keypair.public_key();

        assert!(pubkey.verify(message, &signature));
    }

    #[test]
    fn test_verify_fails_wrong_message() {
        let keypair = BlsKeyPair::generate();

        let signature = keypair.sign(b"test message");
        let pubkey = keypair.public_key();

        assert!(!pubkey.verify(b"wrong message", &signature));
    }

    #[test]
    fn test_aggregate_signatures() {
        let message = b"proposal digest";

        let keypairs: Vec<_> = (0..3).map(|_| BlsKeyPair::generate()).collect();
        let sigs: Vec<_> = keypairs.iter().map(|kp| kp.sign(message)).collect();
        let pubkeys: Vec<_> = keypairs.iter().map(|kp| kp.public_key()).collect();

        let agg_sig = BlsSignature::aggregate(&sigs).unwrap();
        let agg_pubkey = BlsPublicKey::aggregate(&pubkeys).unwrap();

        assert!(agg_pubkey.verify(message, &agg_sig));
    }

    #[test]
    fn test_incremental_aggregation_matches_batch() {
        let message = b"proposal digest";
        let kp1 = BlsKeyPair::generate();
        let kp2 = BlsKeyPair::generate();
        let kp3 = BlsKeyPair::generate();

        let batch =
            BlsSignature::aggregate(&[kp1.sign(message), kp2.sign(message), kp3.sign(message)])
                .unwrap();

        let step1 = BlsSignature::aggregate(&[kp1.sign(message), kp2.sign(message)]).unwrap();
        let step2 = BlsSignature::aggregate(&[step1, kp3.sign(message)]).unwrap();

        assert_eq!(batch, step2);
    }

    #[test]
    fn test_from_seed_deterministic() {
        let seed = [42u8; 32];

        let kp1 = BlsKeyPair::from_seed(&seed);
        let kp2 = BlsKeyPair::from_seed(&seed);

        let msg = b"test";
        assert_eq!(kp1.sign(msg), kp2.sign(msg));
        assert_eq!(kp1.public_key(), kp2.public_key());
    }
}
