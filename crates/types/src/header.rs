//! Block headers and the instant-finality header extension.

use crate::{
    BlockId, BlockNum, BlockTimestamp, Digest, FinalizerPolicy, ProducerId, ProposerPolicy,
};
use sbor::prelude::*;

/// Extension id under which the instant-finality payload travels in a
/// block header's extension list.
pub const INSTANT_FINALITY_EXTENSION_ID: u16 = 2;

/// Description of the QC a block embeds: which block it certifies and
/// whether it is strong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BasicSbor)]
pub struct QcInfo {
    /// Number of the certified block.
    pub last_qc_block_num: BlockNum,
    /// Strong or weak.
    pub is_last_qc_strong: bool,
}

/// Payload of the instant-finality header extension.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct InstantFinalityExtension {
    /// The QC this block makes canonical, if any.
    pub qc_info: Option<QcInfo>,
    /// A replacement finalizer policy proposed by this block.
    pub new_finalizer_policy: Option<FinalizerPolicy>,
    /// A replacement proposer policy proposed by this block.
    pub new_proposer_policy: Option<ProposerPolicy>,
}

/// Error decoding a header extension payload.
#[derive(Debug, Clone, thiserror::Error)]
#[error("malformed header extension {id}: {reason}")]
pub struct ExtensionDecodeError {
    /// The extension id that failed to decode.
    pub id: u16,
    /// Decoder diagnostic.
    pub reason: String,
}

/// A block header.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct BlockHeader {
    /// Production slot of this block.
    pub timestamp: BlockTimestamp,
    /// Producer of this block.
    pub producer: ProducerId,
    /// Id of the parent block.
    pub previous: BlockId,
    /// Merkle root over the block's transactions.
    pub transaction_mroot: Digest,
    /// Merkle root over the block's action receipts.
    pub action_mroot: Digest,
    /// Version of the active proposer schedule.
    pub schedule_version: u32,
    /// Tagged extension payloads.
    pub header_extensions: Vec<(u16, Vec<u8>)>,
}

impl BlockHeader {
    /// The number of the block this header describes.
    pub fn block_num(&self) -> BlockNum {
        self.previous.number().next()
    }

    /// Deterministic digest of this header (basis of the block id).
    pub fn digest(&self) -> Digest {
        let encoded =
            sbor::basic_encode(self).expect("header encoding is infallible for owned data");
        Digest::hash_bytes(&encoded)
    }

    /// The id of the block this header describes.
    pub fn calculate_id(&self) -> BlockId {
        BlockId::new(self.block_num(), &self.digest())
    }

    /// Append the instant-finality extension to this header.
    pub fn emplace_finality_extension(&mut self, extension: &InstantFinalityExtension) {
        let payload =
            sbor::basic_encode(extension).expect("extension encoding is infallible for owned data");
        self.header_extensions
            .push((INSTANT_FINALITY_EXTENSION_ID, payload));
    }

    /// Decode the instant-finality extension, if this header carries one.
    pub fn finality_extension(
        &self,
    ) -> Result<Option<InstantFinalityExtension>, ExtensionDecodeError> {
        let Some((_, payload)) = self
            .header_extensions
            .iter()
            .find(|(id, _)| *id == INSTANT_FINALITY_EXTENSION_ID)
        else {
            return Ok(None);
        };

        sbor::basic_decode(payload)
            .map(Some)
            .map_err(|e| ExtensionDecodeError {
                id: INSTANT_FINALITY_EXTENSION_ID,
                reason: format!("{e:?}"),
            })
    }
}
