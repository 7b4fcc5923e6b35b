//! Aggregated certificates: quorum certificates over prepare votes and
//! view-change certificates over view changes.

use crate::{prepare_vote_message, view_change_message, BlockNumber, Hash, Signature, SignerBitfield};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Proof that a threshold of validators voted for one block in one view
/// slot: the consensus coordinates of the block plus an aggregated BLS
/// signature and the bitmap of participating validators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumCert {
    /// Epoch the certified view belongs to.
    pub epoch: u64,
    /// View the block was proposed in.
    pub view_number: u64,
    /// Hash of the certified block.
    pub block_hash: Hash,
    /// Height of the certified block.
    pub block_number: BlockNumber,
    /// Slot of the block within its view.
    pub block_index: u32,
    /// Aggregated signature over the prepare-vote payload.
    pub signature: Signature,
    /// Which validators contributed a vote.
    pub signers: SignerBitfield,
}

impl QuorumCert {
    /// Number of validators that signed.
    pub fn len(&self) -> usize {
        self.signers.count()
    }

    /// True when no validator signed (never the case for a well-formed
    /// certificate).
    pub fn is_empty(&self) -> bool {
        self.signers.is_empty()
    }

    /// The payload every contributing vote signed.
    pub fn signed_payload(&self) -> Vec<u8> {
        prepare_vote_message(
            self.epoch,
            self.view_number,
            &self.block_hash,
            self.block_number,
            self.block_index,
        )
    }
}

impl fmt::Display for QuorumCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "qc(epoch={} view={} index={} #{}({:?}) signers={})",
            self.epoch,
            self.view_number,
            self.block_index,
            self.block_number,
            self.block_hash,
            self.signers.count()
        )
    }
}

/// One aggregation group within a [`ViewChangeQC`]: the validators whose
/// view changes referenced the same highest block, with their signatures
/// aggregated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChangeQuorumCert {
    /// Epoch of the abandoned view.
    pub epoch: u64,
    /// The view being abandoned.
    pub view_number: u64,
    /// Highest certified block these signers reported.
    pub block_hash: Hash,
    /// Height of that block.
    pub block_number: BlockNumber,
    /// Aggregated signature over the view-change payload.
    pub signature: Signature,
    /// Which validators contributed.
    pub signers: SignerBitfield,
}

impl ViewChangeQuorumCert {
    /// The payload every member of this group signed.
    pub fn signed_payload(&self) -> Vec<u8> {
        view_change_message(self.epoch, self.view_number, &self.block_hash, self.block_number)
    }
}

/// Proof that a threshold of validators asked to abandon one view.
///
/// Validators may disagree on the highest certified block, so the
/// certificate carries one aggregation group per distinct block reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChangeQC {
    /// Aggregation groups, one per distinct reported block.
    pub certs: Vec<ViewChangeQuorumCert>,
}

impl ViewChangeQC {
    /// Total number of distinct validators across all groups.
    pub fn len(&self) -> usize {
        self.certs.iter().map(|c| c.signers.count()).sum()
    }

    /// True when the certificate carries no groups.
    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    /// The maximum `(epoch, view, hash, number)` over the member groups,
    /// ordered by block number then hash.
    pub fn max_block(&self) -> (u64, u64, Hash, BlockNumber) {
        self.certs
            .iter()
            .max_by_key(|c| (c.block_number, c.block_hash))
            .map(|c| (c.epoch, c.view_number, c.block_hash, c.block_number))
            .unwrap_or((0, 0, Hash::ZERO, BlockNumber(0)))
    }
}

impl fmt::Display for ViewChangeQC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (epoch, view, hash, number) = self.max_block();
        write!(
            f,
            "viewChangeQC(epoch={} view={} max=#{}({:?}) signers={})",
            epoch,
            view,
            number,
            hash,
            self.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeyPair;

    fn group(number: u64, seed: u8) -> ViewChangeQuorumCert {
        let keys = KeyPair::from_seed([seed; 32]);
        let hash = Hash::from_bytes(&[seed]);
        let payload = view_change_message(1, 0, &hash, BlockNumber(number));
        let mut signers = SignerBitfield::new(4);
        signers.set(seed as usize % 4);
        ViewChangeQuorumCert {
            epoch: 1,
            view_number: 0,
            block_hash: hash,
            block_number: BlockNumber(number),
            signature: keys.sign(&payload),
            signers,
        }
    }

    #[test]
    fn max_block_picks_highest_number() {
        let qc = ViewChangeQC {
            certs: vec![group(3, 0), group(7, 1), group(5, 2)],
        };
        let (_, _, hash, number) = qc.max_block();
        assert_eq!(number, BlockNumber(7));
        assert_eq!(hash, Hash::from_bytes(&[1]));
    }

    #[test]
    fn max_block_breaks_ties_by_hash() {
        let a = group(7, 1);
        let b = group(7, 2);
        let expected = a.block_hash.max(b.block_hash);
        let qc = ViewChangeQC { certs: vec![a, b] };
        assert_eq!(qc.max_block().2, expected);
    }

    #[test]
    fn len_sums_all_groups() {
        let qc = ViewChangeQC {
            certs: vec![group(1, 0), group(2, 1)],
        };
        assert_eq!(qc.len(), 2);
    }
}
