//! Core types for the instant-finality consensus core.
//!
//! This crate provides the foundational types used throughout the
//! consensus implementation:
//!
//! - **Primitives**: SHA-256 digests, BLS12-381 keys and aggregate
//!   signatures
//! - **Identifiers**: `BlockNum`, `BlockId`, `ProducerId`,
//!   `BlockTimestamp`, `ViewNumber`
//! - **Consensus types**: finalizer/proposer policies, protocol messages,
//!   quorum certificates, the finality ladder, block header states
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not
//! depend on any other workspace crates, making it the foundation layer.

mod bitset;
mod block_state;
mod crypto;
mod finality_core;
mod hash;
mod header;
mod identifiers;
mod merkle;
mod messages;
mod policy;
mod qc;

pub use bitset::FinalizerBitset;
pub use block_state::{BlockHeaderState, BlockHeaderStateInput};
pub use crypto::{AggregateError, BlsKeyPair, BlsPublicKey, BlsSignature};
pub use finality_core::{BlockValidateError, FinalityCore};
pub use hash::{Digest, HexError};
pub use header::{
    BlockHeader, ExtensionDecodeError, InstantFinalityExtension, QcInfo,
    INSTANT_FINALITY_EXTENSION_ID,
};
pub use identifiers::{BlockId, BlockNum, BlockTimestamp, ProducerId, ViewNumber};
pub use merkle::IncrementalMerkle;
pub use messages::{
    proposal_digest, HsMessage, HsMessageWarning, NewBlockMessage, NewViewMessage,
    ProposalMessage, QcMessage, VoteMessage, VoteStatus,
};
pub use policy::{FinalizerAuthority, FinalizerPolicy, ProposerPolicy};
pub use qc::{QcVerifyError, QuorumCertificate, ValidQc};
