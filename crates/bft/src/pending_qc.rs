//! Vote accumulator: weighted vote tallying toward a quorum certificate.
//!
//! One [`PendingQc`] aggregates the votes for a single proposal. Votes are
//! verified, deduplicated per (flavor, finalizer) pair, folded into a
//! running aggregated BLS signature per flavor, and tallied by weight. The
//! accumulator walks a five-state machine:
//!
//! - `Unrestricted`: no quorum yet, every outcome still possible.
//! - `Restricted`: enough weak weight that a strong quorum is impossible.
//! - `WeakAchieved`: combined weight reaches quorum, strong still possible.
//! - `WeakFinal`: combined weight reaches quorum, strong impossible
//!   (terminal).
//! - `Strong`: strong weight alone reaches quorum (terminal).
//!
//! State progression is monotone; concurrent callers are serialized by the
//! accumulator's own mutex so the post-state depends only on the set of
//! accepted votes.

use instafin_types::{
    BlsPublicKey, BlsSignature, Digest, FinalizerBitset, ValidQc, VoteStatus,
};
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

/// Aggregation state of a pending quorum certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingQcState {
    /// No quorum reached yet, still possible to achieve any state.
    Unrestricted,
    /// Enough weak votes received to know the strong state is out of reach.
    Restricted,
    /// Enough weak + strong votes for a valid weak QC, strong still
    /// possible.
    WeakAchieved,
    /// Enough weak + strong votes for a valid weak QC, strong not possible
    /// anymore.
    WeakFinal,
    /// Enough strong votes for a valid strong QC.
    Strong,
}

/// One flavor's running aggregation: a bitset of voters and the
/// aggregated signature over the proposal digest.
#[derive(Debug, Clone)]
struct Votes {
    bitset: FinalizerBitset,
    sig: Option<BlsSignature>,
}

impl Votes {
    fn new(num_finalizers: usize) -> Self {
        Self {
            bitset: FinalizerBitset::new(num_finalizers),
            sig: None,
        }
    }

    /// Record a verified vote. Returns `Duplicate` if the bit is already
    /// set, `Success` otherwise.
    fn add_vote(&mut self, index: usize, sig: &BlsSignature) -> VoteStatus {
        if self.bitset.is_set(index) {
            return VoteStatus::Duplicate;
        }

        let aggregated = match &self.sig {
            None => sig.clone(),
            Some(agg) => match BlsSignature::aggregate(&[agg.clone(), sig.clone()]) {
                Ok(agg) => agg,
                Err(e) => {
                    warn!(index, error = %e, "Vote signature failed to aggregate");
                    return VoteStatus::InvalidSignature;
                }
            },
        };

        self.bitset.set(index);
        self.sig = Some(aggregated);
        VoteStatus::Success
    }
}

struct PendingQcInner {
    state: PendingQcState,
    strong_sum: u64,
    weak_sum: u64,
    strong_votes: Votes,
    weak_votes: Votes,
}

/// Thread-safe vote accumulator for one proposal.
pub struct PendingQc {
    quorum: u64,
    /// Max weak-vote weight before the strong state becomes unreachable.
    max_weak_sum_before_weak_final: u64,
    inner: Mutex<PendingQcInner>,
}

impl PendingQc {
    /// Create an accumulator for a committee of `num_finalizers` members.
    pub fn new(num_finalizers: usize, quorum: u64, max_weak_sum_before_weak_final: u64) -> Self {
        Self {
            quorum,
            max_weak_sum_before_weak_final,
            inner: Mutex::new(PendingQcInner {
                state: PendingQcState::Unrestricted,
                strong_sum: 0,
                weak_sum: 0,
                strong_votes: Votes::new(num_finalizers),
                weak_votes: Votes::new(num_finalizers),
            }),
        }
    }

    fn locked(&self) -> MutexGuard<'_, PendingQcInner> {
        self.inner.lock().expect("pending QC mutex poisoned")
    }

    /// Current aggregation state.
    pub fn state(&self) -> PendingQcState {
        self.locked().state
    }

    /// True once the accumulated votes form a valid (weak or strong) QC.
    pub fn is_quorum_met(&self) -> bool {
        matches!(
            self.locked().state,
            PendingQcState::WeakAchieved | PendingQcState::WeakFinal | PendingQcState::Strong
        )
    }

    /// Ingest one vote.
    ///
    /// The caller resolves `index` and `pubkey` from the committee; the
    /// accumulator verifies the signature over `digest`, rejects
    /// duplicates per (flavor, finalizer), and re-evaluates the state.
    /// Returns the vote status and whether the state changed.
    pub fn add_vote(
        &self,
        strong: bool,
        digest: &Digest,
        index: usize,
        pubkey: &BlsPublicKey,
        sig: &BlsSignature,
        weight: u64,
    ) -> (VoteStatus, bool) {
        let mut inner = self.locked();

        // A bad signature never disturbs the accumulator.
        if !pubkey.verify(digest.as_bytes(), sig) {
            return (VoteStatus::InvalidSignature, false);
        }

        let status = if strong {
            let status = inner.strong_votes.add_vote(index, sig);
            if status == VoteStatus::Success {
                inner.strong_sum += weight;
            }
            status
        } else {
            let status = inner.weak_votes.add_vote(index, sig);
            if status == VoteStatus::Success {
                inner.weak_sum += weight;
            }
            status
        };

        if status != VoteStatus::Success {
            return (status, false);
        }

        let prior = inner.state;
        inner.state = self.transition(prior, inner.strong_sum, inner.weak_sum);
        (status, inner.state != prior)
    }

    /// The state transition table, evaluated after every accepted vote.
    fn transition(&self, state: PendingQcState, strong_sum: u64, weak_sum: u64) -> PendingQcState {
        match state {
            PendingQcState::Unrestricted => {
                if strong_sum >= self.quorum {
                    PendingQcState::Strong
                } else if weak_sum > self.max_weak_sum_before_weak_final {
                    if weak_sum + strong_sum >= self.quorum {
                        PendingQcState::WeakFinal
                    } else {
                        PendingQcState::Restricted
                    }
                } else if weak_sum + strong_sum >= self.quorum {
                    PendingQcState::WeakAchieved
                } else {
                    PendingQcState::Unrestricted
                }
            }
            PendingQcState::WeakAchieved => {
                if strong_sum >= self.quorum {
                    PendingQcState::Strong
                } else if weak_sum > self.max_weak_sum_before_weak_final {
                    PendingQcState::WeakFinal
                } else {
                    PendingQcState::WeakAchieved
                }
            }
            PendingQcState::Restricted => {
                if weak_sum + strong_sum >= self.quorum {
                    PendingQcState::WeakFinal
                } else {
                    PendingQcState::Restricted
                }
            }
            // Terminal states.
            PendingQcState::WeakFinal => PendingQcState::WeakFinal,
            PendingQcState::Strong => PendingQcState::Strong,
        }
    }

    /// Freeze the accumulation into an immutable certificate.
    ///
    /// Weak votes are included only when the state is `WeakAchieved` or
    /// `WeakFinal`; strong votes whenever any were collected. The
    /// signature is the aggregate of the included flavors' aggregates.
    pub fn to_valid_qc(&self) -> Option<ValidQc> {
        let inner = self.locked();

        let include_weak = matches!(
            inner.state,
            PendingQcState::WeakAchieved | PendingQcState::WeakFinal
        );

        let strong = match &inner.strong_votes.sig {
            Some(sig) if !inner.strong_votes.bitset.is_empty() => {
                Some((inner.strong_votes.bitset.clone(), sig.clone()))
            }
            _ => None,
        };
        let weak = match &inner.weak_votes.sig {
            Some(sig) if include_weak && !inner.weak_votes.bitset.is_empty() => {
                Some((inner.weak_votes.bitset.clone(), sig.clone()))
            }
            _ => None,
        };

        let sig = match (&strong, &weak) {
            (Some((_, s)), Some((_, w))) => {
                match BlsSignature::aggregate(&[s.clone(), w.clone()]) {
                    Ok(agg) => agg,
                    Err(e) => {
                        warn!(error = %e, "Failed to combine flavor aggregates");
                        return None;
                    }
                }
            }
            (Some((_, s)), None) => s.clone(),
            (None, Some((_, w))) => w.clone(),
            (None, None) => return None,
        };

        Some(ValidQc {
            strong_votes: strong.map(|(bitset, _)| bitset),
            weak_votes: weak.map(|(bitset, _)| bitset),
            sig,
        })
    }
}

impl std::fmt::Debug for PendingQc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.locked();
        f.debug_struct("PendingQc")
            .field("state", &inner.state)
            .field("strong_sum", &inner.strong_sum)
            .field("weak_sum", &inner.weak_sum)
            .field("quorum", &self.quorum)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use instafin_types::BlsKeyPair;

    fn committee(n: u8) -> Vec<BlsKeyPair> {
        (0..n).map(|i| BlsKeyPair::from_seed(&[i + 1; 32])).collect()
    }

    fn cast(
        qc: &PendingQc,
        keypairs: &[BlsKeyPair],
        index: usize,
        strong: bool,
        digest: &Digest,
    ) -> (VoteStatus, bool) {
        let sig = keypairs[index].sign(digest.as_bytes());
        qc.add_vote(
            strong,
            digest,
            index,
            &keypairs[index].public_key(),
            &sig,
            1,
        )
    }

    #[test]
    fn test_strong_quorum_progression() {
        let keypairs = committee(4);
        let digest = Digest::hash_bytes(b"proposal");
        let qc = PendingQc::new(4, 3, 1);

        assert_eq!(cast(&qc, &keypairs, 0, true, &digest), (VoteStatus::Success, false));
        assert_eq!(qc.state(), PendingQcState::Unrestricted);
        assert_eq!(cast(&qc, &keypairs, 1, true, &digest), (VoteStatus::Success, false));
        assert_eq!(qc.state(), PendingQcState::Unrestricted);
        assert_eq!(cast(&qc, &keypairs, 2, true, &digest), (VoteStatus::Success, true));
        assert_eq!(qc.state(), PendingQcState::Strong);
        assert!(qc.is_quorum_met());

        let valid = qc.to_valid_qc().unwrap();
        assert!(valid.is_strong());
        assert!(valid.weak_votes.is_none());
        assert_eq!(valid.strong_votes.as_ref().unwrap().count_ones(), 3);
    }

    #[test]
    fn test_weak_final_lock() {
        let keypairs = committee(4);
        let digest = Digest::hash_bytes(b"proposal");
        let qc = PendingQc::new(4, 3, 1);

        cast(&qc, &keypairs, 0, false, &digest);
        assert_eq!(qc.state(), PendingQcState::Unrestricted);

        // Second weak vote pushes weak_sum past the weak-final threshold.
        let (_, changed) = cast(&qc, &keypairs, 1, false, &digest);
        assert!(changed);
        assert_eq!(qc.state(), PendingQcState::Restricted);
        assert!(!qc.is_quorum_met());

        // A strong vote brings the combined weight to quorum.
        let (_, changed) = cast(&qc, &keypairs, 2, true, &digest);
        assert!(changed);
        assert_eq!(qc.state(), PendingQcState::WeakFinal);
        assert!(qc.is_quorum_met());

        let valid = qc.to_valid_qc().unwrap();
        assert!(valid.is_weak());
        assert_eq!(valid.weak_votes.as_ref().unwrap().count_ones(), 2);
        assert_eq!(valid.strong_votes.as_ref().unwrap().count_ones(), 1);
    }

    #[test]
    fn test_weak_achieved_then_strong() {
        let keypairs = committee(4);
        let digest = Digest::hash_bytes(b"proposal");
        let qc = PendingQc::new(4, 3, 1);

        cast(&qc, &keypairs, 0, false, &digest);
        cast(&qc, &keypairs, 1, true, &digest);
        cast(&qc, &keypairs, 2, true, &digest);
        // weak=1 (within bound), combined=3: weak QC achievable, strong
        // still open.
        assert_eq!(qc.state(), PendingQcState::WeakAchieved);
        assert!(qc.is_quorum_met());

        cast(&qc, &keypairs, 3, true, &digest);
        assert_eq!(qc.state(), PendingQcState::Strong);
    }

    #[test]
    fn test_duplicate_votes_rejected_per_flavor() {
        let keypairs = committee(4);
        let digest = Digest::hash_bytes(b"proposal");
        let qc = PendingQc::new(4, 3, 1);

        assert_eq!(cast(&qc, &keypairs, 0, true, &digest).0, VoteStatus::Success);
        assert_eq!(cast(&qc, &keypairs, 0, true, &digest).0, VoteStatus::Duplicate);

        // Same finalizer may still cast the other flavor; each flavor
        // deduplicates independently.
        assert_eq!(cast(&qc, &keypairs, 0, false, &digest).0, VoteStatus::Success);
        assert_eq!(cast(&qc, &keypairs, 0, false, &digest).0, VoteStatus::Duplicate);
    }

    #[test]
    fn test_invalid_signature_leaves_state_untouched() {
        let keypairs = committee(4);
        let digest = Digest::hash_bytes(b"proposal");
        let qc = PendingQc::new(4, 3, 1);

        let forged = keypairs[1].sign(digest.as_bytes());
        let (status, changed) =
            qc.add_vote(true, &digest, 0, &keypairs[0].public_key(), &forged, 1);
        assert_eq!(status, VoteStatus::InvalidSignature);
        assert!(!changed);
        assert_eq!(qc.state(), PendingQcState::Unrestricted);

        // The slot is still usable by the honest vote.
        assert_eq!(cast(&qc, &keypairs, 0, true, &digest).0, VoteStatus::Success);
    }

    #[test]
    fn test_sealed_qc_signature_verifies_against_committee() {
        use instafin_types::{FinalizerAuthority, FinalizerPolicy};

        let keypairs = committee(4);
        let digest = Digest::hash_bytes(b"proposal");
        let qc = PendingQc::new(4, 3, 1);
        for i in 0..3 {
            cast(&qc, &keypairs, i, true, &digest);
        }

        let policy = FinalizerPolicy {
            generation: 1,
            threshold: 3,
            finalizers: keypairs
                .iter()
                .enumerate()
                .map(|(i, kp)| FinalizerAuthority {
                    description: format!("f{i}"),
                    weight: 1,
                    public_key: kp.public_key(),
                })
                .collect(),
        };

        let valid = qc.to_valid_qc().unwrap();
        assert!(valid.verify(&digest, &policy).is_ok());
    }

    #[test]
    fn test_state_invariants_hold() {
        // state == Strong implies strong_sum >= quorum, etc., probed via
        // a weighted committee.
        let keypairs = committee(4);
        let digest = Digest::hash_bytes(b"proposal");

        // Weights 3,2,2,1 with quorum 6: weak-final bound is 8 - 6 = 2.
        let weights = [3u64, 2, 2, 1];
        let qc = PendingQc::new(4, 6, 2);

        let weighted = |i: usize, strong: bool| {
            let sig = keypairs[i].sign(digest.as_bytes());
            qc.add_vote(strong, &digest, i, &keypairs[i].public_key(), &sig, weights[i])
        };

        weighted(3, false); // weak_sum=1
        assert_eq!(qc.state(), PendingQcState::Unrestricted);
        weighted(1, false); // weak_sum=3 > 2
        assert_eq!(qc.state(), PendingQcState::Restricted);
        assert!(!qc.is_quorum_met());
        weighted(0, true); // combined 6 >= 6
        assert_eq!(qc.state(), PendingQcState::WeakFinal);

        // Terminal: a further strong vote cannot resurrect Strong.
        weighted(2, true);
        assert_eq!(qc.state(), PendingQcState::WeakFinal);
    }
}
