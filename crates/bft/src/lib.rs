//! HotStuff-style round logic and pacemaker for the instant-finality
//! consensus core.
//!
//! # Architecture
//!
//! Inbound blocks and messages enter through the [`ChainPacemaker`],
//! which serializes every consensus transition behind one global mutex:
//!
//! - `beat()` → propose when this node is proposer and leader; time out
//!   stalled rounds
//! - `on_hs_proposal_msg` → validate the justification, vote
//! - `on_hs_vote_msg` → tally into the [`PendingQc`] accumulator; seal a
//!   QC on quorum
//! - `on_hs_new_view_msg` / `on_hs_new_block_msg` → adopt a better high QC
//! - `on_accepted_block` → refresh the head snapshot, commit rounds whose
//!   QC landed on chain
//!
//! Observers read [`FinalizerState`] through a versioned cache that stays
//! off the consensus hot path.

mod config;
mod pacemaker;
mod pending_qc;
mod qc_chain;
mod traits;

pub use config::ConsensusConfig;
pub use pacemaker::ChainPacemaker;
pub use pending_qc::{PendingQc, PendingQcState};
pub use qc_chain::{FinalizerState, HighQc, QcChain, RoundState};
pub use traits::{ChainController, MessageSink, PacemakerView};
