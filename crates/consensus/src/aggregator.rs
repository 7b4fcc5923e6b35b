//! Threshold aggregation of votes and view changes into certificates.

use std::collections::BTreeMap;
use trellis_types::{
    AggregateError, BlockNumber, Hash, PrepareVote, QuorumCert, Signature, SignerBitfield,
    ViewChange, ViewChangeQC, ViewChangeQuorumCert,
};

/// Combine prepare votes for one slot into a quorum certificate.
///
/// All votes must share the same consensus coordinates; the caller takes
/// them from one slot of the view state, which guarantees it. Repeated
/// votes from the same validator contribute once.
pub fn generate_prepare_qc(
    votes: &[PrepareVote],
    validators: usize,
) -> Result<QuorumCert, AggregateError> {
    let first = votes.first().ok_or(AggregateError::Empty)?;

    let mut signers = SignerBitfield::new(validators);
    let mut shares = Vec::with_capacity(votes.len());
    for vote in votes {
        let seat = vote.validator_index.0 as usize;
        if signers.has(seat) {
            continue;
        }
        signers.set(seat);
        shares.push(vote.signature.clone());
    }
    let signature = Signature::aggregate(&shares)?;

    Ok(QuorumCert {
        epoch: first.epoch,
        view_number: first.view_number,
        block_hash: first.block_hash,
        block_number: first.block_number,
        block_index: first.block_index,
        signature,
        signers,
    })
}

/// Combine view changes into a view-change certificate.
///
/// Validators report whatever highest block they know, so signatures only
/// aggregate within groups that signed the same payload: one
/// [`ViewChangeQuorumCert`] per distinct `(block, number)` reported.
pub fn generate_view_change_qc(
    view_changes: &[ViewChange],
    validators: usize,
) -> Result<ViewChangeQC, AggregateError> {
    if view_changes.is_empty() {
        return Err(AggregateError::Empty);
    }

    let mut groups: BTreeMap<(BlockNumber, Hash), Vec<&ViewChange>> = BTreeMap::new();
    for view_change in view_changes {
        groups
            .entry((view_change.block_number, view_change.block_hash))
            .or_default()
            .push(view_change);
    }

    let mut certs = Vec::with_capacity(groups.len());
    for ((block_number, block_hash), members) in groups {
        let mut signers = SignerBitfield::new(validators);
        let mut shares = Vec::with_capacity(members.len());
        for member in &members {
            let seat = member.validator_index.0 as usize;
            if signers.has(seat) {
                continue;
            }
            signers.set(seat);
            shares.push(member.signature.clone());
        }
        let signature = Signature::aggregate(&shares)?;
        certs.push(ViewChangeQuorumCert {
            epoch: members[0].epoch,
            view_number: members[0].view_number,
            block_hash,
            block_number,
            signature,
            signers,
        });
    }

    Ok(ViewChangeQC { certs })
}
