//! Wire-format checks: every consensus message round-trips through the
//! canonical encoding, and the encoding is deterministic.

use trellis_types::{
    prepare_vote_message, Block, BlockNumber, KeyPair, PrepareVote, QuorumCert, SignerBitfield,
    ValidatorIndex, ViewChange, ViewChangeQC, ViewChangeQuorumCert,
};

fn sample_vote() -> PrepareVote {
    let keys = KeyPair::from_seed([5u8; 32]);
    let block = Block::new(BlockNumber(3), Block::genesis().hash(), 42, vec![1, 2, 3]);
    let payload = prepare_vote_message(1, 2, &block.hash(), block.number(), 0);
    PrepareVote {
        epoch: 1,
        view_number: 2,
        block_hash: block.hash(),
        block_number: block.number(),
        block_index: 0,
        validator_index: ValidatorIndex(3),
        parent_qc: Some(sample_qc()),
        signature: keys.sign(&payload),
    }
}

fn sample_qc() -> QuorumCert {
    let keys = KeyPair::from_seed([6u8; 32]);
    let mut signers = SignerBitfield::new(4);
    signers.set(0);
    signers.set(2);
    signers.set(3);
    QuorumCert {
        epoch: 1,
        view_number: 1,
        block_hash: Block::genesis().hash(),
        block_number: BlockNumber(2),
        block_index: 4,
        signature: keys.sign(b"aggregate"),
        signers,
    }
}

#[test]
fn prepare_vote_round_trips() {
    let vote = sample_vote();
    let bytes = bcs::to_bytes(&vote).unwrap();
    let decoded: PrepareVote = bcs::from_bytes(&bytes).unwrap();
    assert_eq!(vote, decoded);
}

#[test]
fn quorum_cert_round_trips() {
    let qc = sample_qc();
    let bytes = bcs::to_bytes(&qc).unwrap();
    let decoded: QuorumCert = bcs::from_bytes(&bytes).unwrap();
    assert_eq!(qc, decoded);
}

#[test]
fn view_change_qc_round_trips() {
    let keys = KeyPair::from_seed([7u8; 32]);
    let mut signers = SignerBitfield::new(4);
    signers.set(1);
    let qc = ViewChangeQC {
        certs: vec![ViewChangeQuorumCert {
            epoch: 1,
            view_number: 0,
            block_hash: Block::genesis().hash(),
            block_number: BlockNumber(0),
            signature: keys.sign(b"view change"),
            signers,
        }],
    };
    let bytes = bcs::to_bytes(&qc).unwrap();
    let decoded: ViewChangeQC = bcs::from_bytes(&bytes).unwrap();
    assert_eq!(qc, decoded);
}

#[test]
fn encoding_is_deterministic() {
    let vote = sample_vote();
    assert_eq!(bcs::to_bytes(&vote).unwrap(), bcs::to_bytes(&vote).unwrap());

    let vc = ViewChange {
        epoch: 1,
        view_number: 0,
        block_hash: Block::genesis().hash(),
        block_number: BlockNumber(0),
        validator_index: ValidatorIndex(0),
        prepare_qc: None,
        signature: KeyPair::from_seed([8u8; 32]).sign(b"vc"),
    };
    assert_eq!(bcs::to_bytes(&vc).unwrap(), bcs::to_bytes(&vc).unwrap());
}
