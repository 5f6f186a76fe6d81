//! Property tests for the vote accumulator.

use instafin_bft::{PendingQc, PendingQcState};
use instafin_types::{BlsKeyPair, Digest};
use proptest::prelude::*;

const COMMITTEE: usize = 5;
const QUORUM: u64 = 4;
const MAX_WEAK: u64 = 1;

fn committee() -> Vec<BlsKeyPair> {
    (0..COMMITTEE as u8)
        .map(|i| BlsKeyPair::from_seed(&[i + 1; 32]))
        .collect()
}

/// Run one accepted-vote multiset through a fresh accumulator.
fn run(votes: &[(usize, bool)]) -> (PendingQcState, bool) {
    let keypairs = committee();
    let digest = Digest::hash_bytes(b"proposal");
    let qc = PendingQc::new(COMMITTEE, QUORUM, MAX_WEAK);

    for &(index, strong) in votes {
        let sig = keypairs[index].sign(digest.as_bytes());
        qc.add_vote(strong, &digest, index, &keypairs[index].public_key(), &sig, 1);
    }
    (qc.state(), qc.is_quorum_met())
}

/// One vote per finalizer, random flavor, random subset.
fn arb_votes() -> impl Strategy<Value = Vec<(usize, bool)>> {
    proptest::collection::vec(any::<Option<bool>>(), COMMITTEE).prop_map(|flavors| {
        flavors
            .into_iter()
            .enumerate()
            .filter_map(|(index, flavor)| flavor.map(|strong| (index, strong)))
            .collect()
    })
}

proptest! {
    /// Whether quorum is met depends only on which votes were accepted,
    /// never on their arrival order.
    #[test]
    fn quorum_met_is_order_independent(votes in arb_votes(), seed in any::<u64>()) {
        let (_, baseline) = run(&votes);

        let mut shuffled = votes.clone();
        // Deterministic Fisher-Yates driven by the seed.
        let mut state = seed | 1;
        for i in (1..shuffled.len()).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let j = (state >> 33) as usize % (i + 1);
            shuffled.swap(i, j);
        }

        let (_, permuted) = run(&shuffled);
        prop_assert_eq!(baseline, permuted);
    }

    /// While the weak sum stays within the weak-final bound, the final
    /// state itself is a pure function of the accepted vote set.
    #[test]
    fn state_is_order_independent_within_weak_bound(votes in arb_votes(), seed in any::<u64>()) {
        let weak_sum = votes.iter().filter(|(_, strong)| !strong).count() as u64;
        prop_assume!(weak_sum <= MAX_WEAK);

        let (baseline, _) = run(&votes);

        let mut shuffled = votes.clone();
        let mut state = seed | 1;
        for i in (1..shuffled.len()).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let j = (state >> 33) as usize % (i + 1);
            shuffled.swap(i, j);
        }

        let (permuted, _) = run(&shuffled);
        prop_assert_eq!(baseline, permuted);
    }

    /// Terminal-state guarantees: Strong implies the strong weight alone
    /// reached quorum; Restricted is never quorum-met.
    #[test]
    fn state_invariants(votes in arb_votes()) {
        let strong_sum = votes.iter().filter(|(_, strong)| *strong).count() as u64;
        let (state, quorum_met) = run(&votes);

        if state == PendingQcState::Strong {
            prop_assert!(strong_sum >= QUORUM);
        }
        if state == PendingQcState::Restricted || state == PendingQcState::Unrestricted {
            prop_assert!(!quorum_met);
        }
        prop_assert_eq!(
            quorum_met,
            strong_sum + votes.iter().filter(|(_, s)| !s).count() as u64 >= QUORUM
        );
    }
}
