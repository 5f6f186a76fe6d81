//! Per-round HotStuff state machine.
//!
//! The QC chain consumes proposals, votes, and round hand-offs, and
//! drives each round through
//! `Idle → Proposed → VotesAccumulating → QuorumMet → Committed`.
//! It is not thread safe on its own: the pacemaker serializes every entry
//! point behind its global mutex and supplies a consistent chain-state
//! snapshot per entry via [`PacemakerView`].

use crate::config::ConsensusConfig;
use crate::pending_qc::PendingQc;
use crate::traits::{MessageSink, PacemakerView};
use instafin_types::{
    proposal_digest, BlockHeaderState, BlockId, BlsKeyPair, BlsPublicKey, Digest, FinalizerPolicy,
    HsMessageWarning, NewBlockMessage, NewViewMessage, ProducerId, ProposalMessage, QcMessage,
    ValidQc, ViewNumber, VoteMessage, VoteStatus,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Lifecycle of one consensus round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    /// No proposal seen for this round yet.
    Idle,
    /// A proposal exists for this round.
    Proposed,
    /// Votes are being collected for the round's proposal.
    VotesAccumulating,
    /// The round's proposal reached quorum.
    QuorumMet,
    /// The round's QC was embedded in an accepted block.
    Committed,
}

/// The highest QC known locally, with the round it certifies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HighQc {
    /// Wire form, ready to travel as `justify` or in a hand-off.
    pub msg: QcMessage,
    /// Round of the certified proposal.
    pub view: ViewNumber,
}

/// Observer snapshot of the QC chain.
#[derive(Debug, Clone, Default)]
pub struct FinalizerState {
    /// The current round.
    pub current_view: ViewNumber,
    /// Highest QC known, if any.
    pub high_qc: Option<HighQc>,
    /// Proposal the chain is locked on (strong-vote safety anchor).
    pub locked_proposal: Option<Digest>,
    /// Most recent proposal whose QC landed in an accepted block.
    pub committed_proposal: Option<Digest>,
    /// Proposals currently tracked.
    pub pending_proposal_count: usize,
}

/// HotStuff round logic for one node.
pub struct QcChain {
    /// Producers this node operates.
    my_producers: HashSet<ProducerId>,
    /// Finalizer keys this node holds, by public key.
    my_finalizer_keys: BTreeMap<BlsPublicKey, BlsKeyPair>,

    /// Bumped on every observable state change; read lock-free by the
    /// pacemaker's observer cache.
    state_version: Arc<AtomicU64>,

    /// The current round.
    current_view: ViewNumber,
    /// Highest round this node has voted in (any flavor).
    last_voted_view: Option<ViewNumber>,
    /// Proposal the chain is locked on: strong votes are only cast for
    /// descendants of this proposal.
    locked_proposal: Option<Digest>,
    /// Most recent proposal whose QC landed in an accepted block.
    committed_proposal: Option<Digest>,
    /// Highest QC known.
    high_qc: Option<HighQc>,

    /// Known proposals by id.
    proposals: HashMap<Digest, ProposalMessage>,
    /// Vote accumulators for proposals this node leads.
    pending: HashMap<Digest, PendingQc>,
    /// Round lifecycle, keyed by view key.
    rounds: BTreeMap<u64, RoundState>,
    /// Beats since the current round last made progress.
    beats_without_progress: u32,

    config: ConsensusConfig,
}

impl QcChain {
    /// Create a QC chain for a node operating `my_producers` and holding
    /// `my_finalizer_keys`.
    pub fn new(
        my_producers: HashSet<ProducerId>,
        my_finalizer_keys: Vec<BlsKeyPair>,
        config: ConsensusConfig,
    ) -> Self {
        Self {
            my_producers,
            my_finalizer_keys: my_finalizer_keys
                .into_iter()
                .map(|kp| (kp.public_key(), kp))
                .collect(),
            state_version: Arc::new(AtomicU64::new(0)),
            current_view: ViewNumber::default(),
            last_voted_view: None,
            locked_proposal: None,
            committed_proposal: None,
            high_qc: None,
            proposals: HashMap::new(),
            pending: HashMap::new(),
            rounds: BTreeMap::new(),
            beats_without_progress: 0,
            config,
        }
    }

    /// Handle to the monotone state-version counter, safe to read without
    /// entering the consensus mutex.
    pub fn state_version_handle(&self) -> Arc<AtomicU64> {
        self.state_version.clone()
    }

    fn bump_state_version(&self) {
        self.state_version.fetch_add(1, Ordering::Release);
    }

    /// Lifecycle of the given round.
    pub fn round_state(&self, view: ViewNumber) -> RoundState {
        self.rounds.get(&view.key()).copied().unwrap_or(RoundState::Idle)
    }

    fn set_round_state(&mut self, view: ViewNumber, state: RoundState) {
        trace!(view = %view, ?state, "Round transition");
        self.rounds.insert(view.key(), state);
    }

    /// Fill `out` with an observer snapshot.
    pub fn get_state(&self, out: &mut FinalizerState) {
        out.current_view = self.current_view;
        out.high_qc = self.high_qc.clone();
        out.locked_proposal = self.locked_proposal;
        out.committed_proposal = self.committed_proposal;
        out.pending_proposal_count = self.proposals.len();
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Beat (pacemaker tick)
    // ═══════════════════════════════════════════════════════════════════════

    /// Pulse from the block-production loop.
    ///
    /// Proposes when this node is the proposer and leader of the current
    /// round, and abandons a stalled round to the next phase counter.
    pub fn on_beat(&mut self, view: &dyn PacemakerView, sink: &dyn MessageSink) {
        let block_id = view.current_block_id();
        let head_view = ViewNumber::new(block_id.number(), self.current_view.phase_counter);

        // A new head resets the round clock.
        if head_view.block_num > self.current_view.block_num {
            self.current_view = ViewNumber::new(head_view.block_num, 0);
            self.beats_without_progress = 0;
        }

        if self.round_state(self.current_view) == RoundState::VotesAccumulating {
            self.beats_without_progress += 1;
            if self.beats_without_progress > self.config.round_timeout_beats {
                self.abandon_round(sink);
                return;
            }
        }

        let am_proposer = self.my_producers.contains(&view.proposer());
        let am_leader = self.my_producers.contains(&view.leader());
        if !(am_proposer && am_leader) {
            return;
        }
        if self.round_state(self.current_view) != RoundState::Idle {
            return;
        }

        let proposal = self.new_proposal_candidate(block_id, self.current_view.phase_counter);
        info!(
            proposal_id = %proposal.proposal_id,
            block_num = proposal.block_num().0,
            phase = proposal.phase_counter,
            "Proposing"
        );

        self.proposals.insert(proposal.proposal_id, proposal.clone());
        self.set_round_state(self.current_view, RoundState::Proposed);
        sink.send_proposal_msg(proposal.clone());

        // Vote for our own proposal; as leader the votes are tallied
        // directly.
        self.vote_on_proposal(&proposal, view, sink);
        self.bump_state_version();
    }

    /// Build the proposal for the current head block.
    fn new_proposal_candidate(&self, block_id: BlockId, phase: u8) -> ProposalMessage {
        let (parent_id, justify) = match &self.high_qc {
            Some(high) => (high.msg.proposal_id, high.msg.clone()),
            None => (Digest::ZERO, QcMessage::none()),
        };
        let final_on_qc = self.locked_proposal.unwrap_or(Digest::ZERO);

        let proposal_id = proposal_digest(&block_id, phase, &final_on_qc);
        ProposalMessage {
            proposal_id,
            block_id,
            parent_id,
            final_on_qc,
            justify,
            phase_counter: phase,
        }
    }

    /// Abandon a stalled round: bump the phase counter and hand the high
    /// QC to the next leader.
    fn abandon_round(&mut self, sink: &dyn MessageSink) {
        let stalled = self.current_view;
        self.set_round_state(stalled, RoundState::Idle);
        self.current_view = stalled.next_phase();
        self.beats_without_progress = 0;

        warn!(
            stalled = %stalled,
            next = %self.current_view,
            "Round timed out, advancing phase counter"
        );

        if let Some(high) = &self.high_qc {
            sink.send_new_view_msg(NewViewMessage {
                high_qc: high.msg.clone(),
            });
        }
        self.bump_state_version();
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Proposal handling
    // ═══════════════════════════════════════════════════════════════════════

    /// Handle an inbound proposal. Dropped messages are classified and
    /// logged, never surfaced.
    pub fn on_proposal_msg(
        &mut self,
        msg: &ProposalMessage,
        view: &dyn PacemakerView,
        sink: &dyn MessageSink,
    ) {
        if let Some(warning) = self.process_proposal(msg, view, sink) {
            warn!(proposal_id = %msg.proposal_id, ?warning, "Dropping proposal");
        }
    }

    fn process_proposal(
        &mut self,
        msg: &ProposalMessage,
        view: &dyn PacemakerView,
        sink: &dyn MessageSink,
    ) -> Option<HsMessageWarning> {
        if self.proposals.contains_key(&msg.proposal_id) {
            return Some(HsMessageWarning::Discarded);
        }

        // The id must be the digest of the proposal's own content.
        if msg.proposal_id != msg.digest() {
            return Some(HsMessageWarning::Invalid);
        }

        let msg_view = msg.view_number();
        if msg_view < self.current_view {
            return Some(HsMessageWarning::Discarded);
        }

        // The signature chain to the parent: the parent must be a known
        // proposal (or this is the first proposal we track).
        if !msg.parent_id.is_zero() && !self.proposals.contains_key(&msg.parent_id) {
            return Some(HsMessageWarning::Discarded);
        }

        let policy = view.finalizers();

        // The justification must verify against the committee.
        if msg.justify.is_present() {
            let qc = ValidQc::from_message(&msg.justify, policy.num_finalizers());
            if qc.verify(&msg.justify.proposal_id, &policy).is_err() {
                return Some(HsMessageWarning::InvalidSignature);
            }
            self.maybe_adopt_high_qc(&msg.justify);
        }

        debug!(
            proposal_id = %msg.proposal_id,
            block_num = msg.block_num().0,
            phase = msg.phase_counter,
            "Accepted proposal"
        );

        self.proposals.insert(msg.proposal_id, msg.clone());
        if msg_view > self.current_view {
            self.current_view = msg_view;
            self.beats_without_progress = 0;
        }
        if self.round_state(msg_view) == RoundState::Idle {
            self.set_round_state(msg_view, RoundState::Proposed);
        }

        // Vote only for proposals extending the locally-known high-QC
        // branch.
        if self.extends_high_qc_branch(msg) {
            self.vote_on_proposal(msg, view, sink);
        } else {
            trace!(proposal_id = %msg.proposal_id, "Proposal off the high-QC branch, not voting");
        }

        self.bump_state_version();
        None
    }

    /// Whether `msg` extends the branch ending at the local high QC.
    fn extends_high_qc_branch(&self, msg: &ProposalMessage) -> bool {
        let Some(high) = &self.high_qc else {
            // Nothing certified yet; any well-linked proposal extends.
            return true;
        };
        let mut cursor = msg.parent_id;
        loop {
            if cursor == high.msg.proposal_id {
                return true;
            }
            match self.proposals.get(&cursor) {
                Some(parent) => cursor = parent.parent_id,
                None => return false,
            }
        }
    }

    /// Whether this node may vote strong on `msg`: it must not have cast
    /// a strong vote on a conflicting branch at a higher round.
    fn permitted_to_vote_strong(&self, msg: &ProposalMessage) -> bool {
        let Some(locked) = self.locked_proposal else {
            return true;
        };
        // Strong is allowed when the proposal descends from the lock.
        let mut cursor = msg.proposal_id;
        while !cursor.is_zero() {
            if cursor == locked {
                return true;
            }
            match self.proposals.get(&cursor) {
                Some(p) => cursor = p.parent_id,
                None => break,
            }
        }
        false
    }

    /// Cast votes for every finalizer key this node holds that sits in
    /// the committee.
    fn vote_on_proposal(
        &mut self,
        msg: &ProposalMessage,
        view: &dyn PacemakerView,
        sink: &dyn MessageSink,
    ) {
        let msg_view = msg.view_number();
        if let Some(last_voted) = self.last_voted_view {
            if msg_view <= last_voted {
                trace!(proposal_id = %msg.proposal_id, "Already voted at this round");
                return;
            }
        }

        let policy = view.finalizers();
        let strong = self.permitted_to_vote_strong(msg);
        let digest = msg.digest();
        let am_leader = self.my_producers.contains(&view.leader());

        let mut voted = false;
        let my_votes: Vec<VoteMessage> = self
            .my_finalizer_keys
            .iter()
            .filter(|(public_key, _)| policy.index_of(public_key).is_some())
            .map(|(public_key, keypair)| VoteMessage {
                proposal_id: msg.proposal_id,
                strong,
                finalizer_key: public_key.clone(),
                sig: keypair.sign(digest.as_bytes()),
            })
            .collect();

        for vote in my_votes {
            debug!(
                proposal_id = %vote.proposal_id,
                strong = vote.strong,
                key = ?vote.finalizer_key,
                "Casting vote"
            );
            voted = true;
            if am_leader {
                self.tally_vote(&vote, view, sink);
            } else {
                sink.send_vote_msg(vote);
            }
        }

        if voted {
            self.last_voted_view = Some(msg_view);
            if strong {
                self.locked_proposal = Some(msg.proposal_id);
            }
            if self.round_state(msg_view) == RoundState::Proposed {
                self.set_round_state(msg_view, RoundState::VotesAccumulating);
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Vote handling (leader only)
    // ═══════════════════════════════════════════════════════════════════════

    /// Handle an inbound vote. Non-leaders discard votes.
    pub fn on_vote_msg(
        &mut self,
        msg: &VoteMessage,
        view: &dyn PacemakerView,
        sink: &dyn MessageSink,
    ) {
        if !self.my_producers.contains(&view.leader()) {
            trace!(proposal_id = %msg.proposal_id, "Not the leader, discarding vote");
            return;
        }
        let status = self.tally_vote(msg, view, sink);
        if status != VoteStatus::Success {
            warn!(proposal_id = %msg.proposal_id, ?status, "Vote not tallied");
        }
    }

    fn tally_vote(
        &mut self,
        msg: &VoteMessage,
        view: &dyn PacemakerView,
        sink: &dyn MessageSink,
    ) -> VoteStatus {
        let Some(proposal) = self.proposals.get(&msg.proposal_id).cloned() else {
            return VoteStatus::UnknownBlock;
        };

        let policy = view.finalizers();
        let Some(index) = policy.index_of(&msg.finalizer_key) else {
            return VoteStatus::UnknownPublicKey;
        };
        let weight = policy
            .authority(index)
            .map(|authority| authority.weight)
            .unwrap_or(0);

        let msg_view = proposal.view_number();
        let quorum = view.quorum_threshold();
        let max_weak = policy.max_weak_sum_before_weak_final();
        let num_finalizers = policy.num_finalizers();
        let digest = proposal.digest();

        let (status, state_changed) = {
            let pending = self
                .pending
                .entry(msg.proposal_id)
                .or_insert_with(|| PendingQc::new(num_finalizers, quorum, max_weak));
            pending.add_vote(msg.strong, &digest, index, &msg.finalizer_key, &msg.sig, weight)
        };

        if status == VoteStatus::Success && self.round_state(msg_view) == RoundState::Proposed {
            self.set_round_state(msg_view, RoundState::VotesAccumulating);
        }

        if status != VoteStatus::Success || !state_changed {
            return status;
        }

        let sealed = self
            .pending
            .get(&msg.proposal_id)
            .filter(|pending| pending.is_quorum_met())
            .and_then(|pending| pending.to_valid_qc());
        if let Some(valid) = sealed {
            self.on_quorum_met(&proposal, valid, sink);
        }

        self.bump_state_version();
        status
    }

    /// Seal a freshly formed QC, adopt it as high QC, and hand it off.
    fn on_quorum_met(&mut self, proposal: &ProposalMessage, qc: ValidQc, sink: &dyn MessageSink) {
        let msg_view = proposal.view_number();
        info!(
            proposal_id = %proposal.proposal_id,
            view = %msg_view,
            strong = qc.is_strong(),
            "Quorum met"
        );

        self.set_round_state(msg_view, RoundState::QuorumMet);
        self.beats_without_progress = 0;

        let qc_msg = qc.to_message(proposal.proposal_id);
        self.adopt_high_qc(HighQc {
            msg: qc_msg.clone(),
            view: msg_view,
        });

        // The certificate rides to the next leader so the next proposal
        // can embed it as its justification.
        sink.send_new_view_msg(NewViewMessage { high_qc: qc_msg });
    }

    // ═══════════════════════════════════════════════════════════════════════
    // High-QC tracking
    // ═══════════════════════════════════════════════════════════════════════

    fn adopt_high_qc(&mut self, candidate: HighQc) {
        let adopt = match &self.high_qc {
            None => true,
            Some(current) => candidate.view > current.view,
        };
        if adopt {
            debug!(view = %candidate.view, proposal_id = %candidate.msg.proposal_id, "Adopting high QC");
            self.high_qc = Some(candidate);
        }
    }

    /// Adopt a wire QC if it certifies a known proposal at a higher round
    /// than the current high QC.
    fn maybe_adopt_high_qc(&mut self, qc: &QcMessage) {
        let Some(proposal) = self.proposals.get(&qc.proposal_id) else {
            return;
        };
        self.adopt_high_qc(HighQc {
            msg: qc.clone(),
            view: proposal.view_number(),
        });
    }

    /// Handle a round hand-off: adopt the carried QC if it improves on
    /// ours.
    pub fn on_new_view_msg(&mut self, msg: &NewViewMessage, view: &dyn PacemakerView) {
        if !msg.high_qc.is_present() {
            return;
        }
        let policy = view.finalizers();
        if !self.verify_wire_qc(&msg.high_qc, &policy) {
            warn!(
                proposal_id = %msg.high_qc.proposal_id,
                warning = ?HsMessageWarning::InvalidSignature,
                "Dropping new-view"
            );
            return;
        }
        self.maybe_adopt_high_qc(&msg.high_qc);
        self.bump_state_version();
    }

    /// Handle a new-block announcement: adopt the carried justification.
    pub fn on_new_block_msg(&mut self, msg: &NewBlockMessage, view: &dyn PacemakerView) {
        if !msg.justify.is_present() {
            return;
        }
        let policy = view.finalizers();
        if !self.verify_wire_qc(&msg.justify, &policy) {
            warn!(
                block_id = ?msg.block_id,
                warning = ?HsMessageWarning::InvalidSignature,
                "Dropping new-block"
            );
            return;
        }
        self.maybe_adopt_high_qc(&msg.justify);
        self.bump_state_version();
    }

    fn verify_wire_qc(&self, qc: &QcMessage, policy: &FinalizerPolicy) -> bool {
        ValidQc::from_message(qc, policy.num_finalizers())
            .verify(&qc.proposal_id, policy)
            .is_ok()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accepted blocks
    // ═══════════════════════════════════════════════════════════════════════

    /// Observe a block accepted by the controller.
    ///
    /// A round whose QC was embedded in the block's instant-finality
    /// extension becomes `Committed`; state for rounds at or below the
    /// block's last-final number is garbage collected.
    pub fn on_accepted_block(&mut self, state: &BlockHeaderState) {
        if let Ok(Some(extension)) = state.header.finality_extension() {
            if let Some(qc_info) = extension.qc_info {
                let committed: Vec<Digest> = self
                    .proposals
                    .values()
                    .filter(|p| p.block_num() == qc_info.last_qc_block_num)
                    .map(|p| p.proposal_id)
                    .collect();
                for proposal_id in committed {
                    let view = self.proposals[&proposal_id].view_number();
                    if self.round_state(view) == RoundState::QuorumMet {
                        info!(proposal_id = %proposal_id, view = %view, "Round committed");
                        self.set_round_state(view, RoundState::Committed);
                        self.committed_proposal = Some(proposal_id);
                    }
                }
            }
        }

        let horizon = state.core.last_final_block_num;
        self.proposals.retain(|_, p| p.block_num() >= horizon);
        let proposals = &self.proposals;
        self.pending.retain(|id, _| proposals.contains_key(id));
        let horizon_key = ViewNumber::new(horizon, 0).key();
        self.rounds.retain(|key, _| *key >= horizon_key);

        self.bump_state_version();
    }
}

impl std::fmt::Debug for QcChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QcChain")
            .field("current_view", &self.current_view)
            .field("high_qc", &self.high_qc.as_ref().map(|h| h.view))
            .field("proposals", &self.proposals.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}
