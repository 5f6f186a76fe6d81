//! The finality ladder.
//!
//! Three block numbers track irreversibility progression:
//! `last_final_block_num` (highest irreversible block),
//! `final_on_strong_qc_block_num` (becomes final if the next QC is strong),
//! and `last_qc_block_num` (most recent block with a QC). A strong QC both
//! promotes the candidate to irreversibility and makes the newly-certified
//! block the next candidate; a weak QC discards the candidate slot without
//! revoking anything already final.

use crate::BlockNum;
use sbor::prelude::*;

/// Error surfaced when a ladder transition violates its invariants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("new last_qc_block_num {new} must be greater than old last_qc_block_num {current}")]
pub struct BlockValidateError {
    /// The rejected input block number.
    pub new: BlockNum,
    /// The ladder's current `last_qc_block_num`.
    pub current: BlockNum,
}

/// The three-number finality ladder carried by every block header state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, BasicSbor)]
pub struct FinalityCore {
    /// Last irreversible (final) block.
    pub last_final_block_num: BlockNum,
    /// Will become final if this header achieves a strong QC.
    pub final_on_strong_qc_block_num: Option<BlockNum>,
    /// Most recent block for which a QC has been seen.
    pub last_qc_block_num: Option<BlockNum>,
    /// Generation of the finalizer policy active at this block.
    pub finalizer_policy_generation: u32,
}

impl FinalityCore {
    /// Apply a newly seen QC and produce the successor ladder.
    ///
    /// Equal input is idempotent; a lower input than the current
    /// `last_qc_block_num` fails with [`BlockValidateError`].
    pub fn next(
        &self,
        last_qc_block_num: BlockNum,
        is_last_qc_strong: bool,
    ) -> Result<FinalityCore, BlockValidateError> {
        // No state change if last_qc_block_num is the same.
        if self.last_qc_block_num == Some(last_qc_block_num) {
            return Ok(*self);
        }

        if let Some(current) = self.last_qc_block_num {
            if last_qc_block_num < current {
                return Err(BlockValidateError {
                    new: last_qc_block_num,
                    current,
                });
            }
        }

        let mut result = *self;

        if is_last_qc_strong {
            // Last QC is strong. We can progress forward.

            // Block with the old final_on_strong_qc_block_num becomes
            // irreversible.
            if let Some(final_on_strong) = self.final_on_strong_qc_block_num {
                result.last_final_block_num = final_on_strong;
            }

            // Next block which can become irreversible is the block with
            // the old last_qc_block_num.
            if let Some(last_qc) = self.last_qc_block_num {
                result.final_on_strong_qc_block_num = Some(last_qc);
            }
        } else {
            // The candidate slot is discarded; last_final_block_num is
            // retained.
            result.final_on_strong_qc_block_num = None;
        }

        // The new last_qc_block_num is always the input.
        result.last_qc_block_num = Some(last_qc_block_num);

        Ok(result)
    }
}
