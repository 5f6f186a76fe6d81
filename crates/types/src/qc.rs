//! Quorum certificate types.
//!
//! A [`ValidQc`] is a finalized aggregation of votes over one proposal: a
//! strong-vote bitset, an optional weak-vote bitset (present iff the QC is
//! weak), and one aggregated BLS signature covering every included voter.
//! [`QuorumCertificate`] pairs a valid QC with the block number it
//! certifies, which is the form embedded in block header extensions.

use crate::{BlockNum, BlsPublicKey, BlsSignature, Digest, FinalizerBitset, FinalizerPolicy, QcMessage};
use sbor::prelude::*;

/// An immutable, finalized quorum certificate.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct ValidQc {
    /// Strong-vote bitset in canonical committee order, if any strong
    /// votes were included.
    pub strong_votes: Option<FinalizerBitset>,
    /// Weak-vote bitset; present iff the certificate is weak.
    pub weak_votes: Option<FinalizerBitset>,
    /// Aggregated signature over the proposal digest for every included
    /// voter, strong and weak alike.
    pub sig: BlsSignature,
}

impl ValidQc {
    /// A weak QC carries a weak-vote bitset.
    pub fn is_weak(&self) -> bool {
        self.weak_votes.is_some()
    }

    /// A strong QC carries no weak votes.
    pub fn is_strong(&self) -> bool {
        self.weak_votes.is_none()
    }

    /// Total number of included voters.
    pub fn signer_count(&self) -> usize {
        self.strong_votes.as_ref().map_or(0, |b| b.count_ones())
            + self.weak_votes.as_ref().map_or(0, |b| b.count_ones())
    }

    /// Verify this certificate against a committee.
    ///
    /// Checks that every set bit maps to a committee position, that the
    /// included weight reaches the policy threshold (strong + weak weight
    /// for a weak QC, strong weight alone for a strong one), and that the
    /// aggregated signature verifies over `digest` under the aggregate of
    /// the included keys.
    pub fn verify(&self, digest: &Digest, policy: &FinalizerPolicy) -> Result<(), QcVerifyError> {
        let mut keys: Vec<BlsPublicKey> = Vec::new();
        let mut strong_weight = 0u64;
        let mut weak_weight = 0u64;

        if let Some(bitset) = &self.strong_votes {
            for index in bitset.set_indices() {
                let authority = policy
                    .authority(index)
                    .ok_or(QcVerifyError::UnknownFinalizer { index })?;
                strong_weight += authority.weight;
                keys.push(authority.public_key.clone());
            }
        }
        if let Some(bitset) = &self.weak_votes {
            for index in bitset.set_indices() {
                let authority = policy
                    .authority(index)
                    .ok_or(QcVerifyError::UnknownFinalizer { index })?;
                // A finalizer cannot be counted under both flavors.
                if self
                    .strong_votes
                    .as_ref()
                    .is_some_and(|strong| strong.is_set(index))
                {
                    return Err(QcVerifyError::DuplicateFinalizer { index });
                }
                weak_weight += authority.weight;
                keys.push(authority.public_key.clone());
            }
        }

        let included = if self.is_strong() {
            strong_weight
        } else {
            strong_weight + weak_weight
        };
        if included < policy.threshold {
            return Err(QcVerifyError::QuorumNotMet {
                included,
                required: policy.threshold,
            });
        }

        let agg_key =
            BlsPublicKey::aggregate(&keys).map_err(|_| QcVerifyError::InvalidSignature)?;
        if !agg_key.verify(digest.as_bytes(), &self.sig) {
            return Err(QcVerifyError::InvalidSignature);
        }

        Ok(())
    }

    /// Wire form of this certificate for the given proposal.
    pub fn to_message(&self, proposal_id: Digest) -> QcMessage {
        QcMessage {
            proposal_id,
            strong_votes: self
                .strong_votes
                .as_ref()
                .map_or_else(Vec::new, |b| b.words().to_vec()),
            weak_votes: self
                .weak_votes
                .as_ref()
                .map_or_else(Vec::new, |b| b.words().to_vec()),
            active_agg_sig: self.sig.clone(),
        }
    }

    /// Rebuild a certificate from wire form, given the committee size.
    pub fn from_message(msg: &QcMessage, num_finalizers: usize) -> Self {
        let to_bitset = |words: &[u32]| {
            if words.iter().all(|&w| w == 0) {
                None
            } else {
                Some(FinalizerBitset::from_words(words.to_vec(), num_finalizers))
            }
        };
        Self {
            strong_votes: to_bitset(&msg.strong_votes),
            weak_votes: to_bitset(&msg.weak_votes),
            sig: msg.active_agg_sig.clone(),
        }
    }
}

/// A valid QC together with the block it certifies.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct QuorumCertificate {
    /// Number of the certified block.
    pub block_num: BlockNum,
    /// The certificate itself.
    pub qc: ValidQc,
}

/// Errors surfaced when verifying a quorum certificate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QcVerifyError {
    /// A set bit points outside the committee.
    #[error("bitset position {index} is not in the committee")]
    UnknownFinalizer {
        /// The offending bitset position.
        index: usize,
    },

    /// A finalizer appears in both the strong and the weak bitset.
    #[error("finalizer {index} counted in both strong and weak bitsets")]
    DuplicateFinalizer {
        /// The offending bitset position.
        index: usize,
    },

    /// Included weight is below the policy threshold.
    #[error("included weight {included} below quorum threshold {required}")]
    QuorumNotMet {
        /// Accumulated weight of included voters.
        included: u64,
        /// The policy threshold.
        required: u64,
    },

    /// The aggregated signature does not verify.
    #[error("aggregated signature verification failed")]
    InvalidSignature,
}
