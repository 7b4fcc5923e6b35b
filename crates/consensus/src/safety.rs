//! Safety rules gating every received message, and the vote rules gating
//! the release of locally signed votes.
//!
//! The rules are pure predicates over the view state, block tree, and
//! validator pool. Each returns a [`Verdict`] telling the handler whether
//! to proceed, drop the message, fetch a missing ancestor, or jump to the
//! view the message implies.

use crate::block_tree::BlockTree;
use crate::view_state::ViewState;
use std::cmp::Ordering;
use std::time::Duration;
use trellis_types::{
    quorum_threshold, Block, BlockNumber, Hash, PrepareBlock, PrepareVote, QuorumCert,
    ValidatorPool, ViewChange,
};

/// Outcome of a safety check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The message is acceptable in the current view.
    Ok,
    /// The message is fatally unacceptable; drop it.
    Discard(String),
    /// An ancestor is missing; pull `(hash, number)` from the sender.
    Fetch {
        /// Hash of the block to fetch.
        hash: Hash,
        /// Height of the block to fetch.
        number: BlockNumber,
    },
    /// The message implies a view this node has not entered yet.
    NewView {
        /// Epoch of the implied view.
        epoch: u64,
        /// The implied view.
        view_number: u64,
    },
}

/// Pure safety predicates over a snapshot of consensus state.
pub struct SafetyRules<'a> {
    state: &'a ViewState,
    tree: &'a BlockTree,
    pool: &'a dyn ValidatorPool,
    amount: u32,
}

impl<'a> SafetyRules<'a> {
    /// Borrow the state needed to judge messages.
    pub fn new(
        state: &'a ViewState,
        tree: &'a BlockTree,
        pool: &'a dyn ValidatorPool,
        amount: u32,
    ) -> Self {
        SafetyRules {
            state,
            tree,
            pool,
            amount,
        }
    }

    fn view_order(&self, epoch: u64, view_number: u64) -> Ordering {
        (epoch, view_number).cmp(&(self.state.epoch(), self.state.view_number()))
    }

    fn threshold(&self) -> usize {
        quorum_threshold(self.pool.len(self.state.highest_qc_block().number()))
    }

    /// Judge a block proposal.
    pub fn prepare_block_rules(&self, message: &PrepareBlock) -> Verdict {
        if message.block_index >= self.amount {
            return Verdict::Discard(format!(
                "block index {} outside the pipeline of {}",
                message.block_index, self.amount
            ));
        }
        if message.block.is_genesis() {
            return Verdict::Discard("proposal for the genesis height".into());
        }

        match self.view_order(message.epoch, message.view_number) {
            Ordering::Less => Verdict::Discard(format!(
                "stale view ({}, {})",
                message.epoch, message.view_number
            )),
            Ordering::Equal => self.current_view_block_rules(message),
            Ordering::Greater => self.ahead_view_block_rules(message),
        }
    }

    fn current_view_block_rules(&self, message: &PrepareBlock) -> Verdict {
        let block = &message.block;
        let parent_number = BlockNumber(block.number().0 - 1);

        // Resolve the parent: earlier slot of this view, or the certified
        // tree for the first slot.
        let parent: Option<&Block> = if message.block_index == 0 {
            self.tree.find_block_and_qc(&block.parent_hash(), parent_number).0
        } else {
            match self.state.view_block_by_index(message.block_index - 1) {
                Some(prev) if prev.hash() == block.parent_hash() => Some(prev),
                Some(_) => {
                    return Verdict::Discard(
                        "proposal does not extend the previous slot".into(),
                    )
                }
                None => None,
            }
        };
        let Some(parent) = parent else {
            return Verdict::Fetch {
                hash: block.parent_hash(),
                number: parent_number,
            };
        };
        if parent.number().0 + 1 != block.number().0 {
            return Verdict::Discard(format!(
                "block number {} does not follow parent {}",
                block.number(),
                parent.number()
            ));
        }

        if self.state.prepare_block_by_index(message.block_index).is_some() {
            return Verdict::Discard(format!(
                "slot {} already holds a proposal",
                message.block_index
            ));
        }

        match self
            .pool
            .proposer(block.number(), message.epoch, message.view_number)
        {
            Some(leader) if leader == message.proposal_index => Verdict::Ok,
            Some(leader) => Verdict::Discard(format!(
                "proposer {} is not the view leader {}",
                message.proposal_index, leader
            )),
            None => Verdict::Discard("empty validator set".into()),
        }
    }

    fn ahead_view_block_rules(&self, message: &PrepareBlock) -> Verdict {
        match &message.view_change_qc {
            Some(view_change_qc) => {
                if view_change_qc.len() < self.threshold() {
                    return Verdict::Discard(
                        "view change certificate below the quorum threshold".into(),
                    );
                }
                let (qc_epoch, qc_view, hash, number) = view_change_qc.max_block();
                if (qc_epoch, qc_view.wrapping_add(1)) != (message.epoch, message.view_number) {
                    return Verdict::Discard(format!(
                        "view change certificate ends ({}, {}), proposal claims ({}, {})",
                        qc_epoch, qc_view, message.epoch, message.view_number
                    ));
                }
                if number.0 > 0 && self.tree.find_block_and_qc(&hash, number).0.is_none() {
                    return Verdict::Fetch { hash, number };
                }
                Verdict::NewView {
                    epoch: message.epoch,
                    view_number: message.view_number,
                }
            }
            None => {
                // Without a justification the previous view must have
                // filled: the parent carries that view's last certificate.
                let parent_number = BlockNumber(message.block.number().0 - 1);
                let (parent, parent_qc) = self
                    .tree
                    .find_block_and_qc(&message.block.parent_hash(), parent_number);
                if parent.is_none() {
                    return Verdict::Fetch {
                        hash: message.block.parent_hash(),
                        number: parent_number,
                    };
                }
                match parent_qc {
                    Some(qc)
                        if qc.epoch == message.epoch
                            && qc.view_number + 1 == message.view_number
                            && qc.block_index + 1 == self.amount =>
                    {
                        Verdict::NewView {
                            epoch: message.epoch,
                            view_number: message.view_number,
                        }
                    }
                    _ => Verdict::Discard("view jump without justification".into()),
                }
            }
        }
    }

    /// Judge a prepare vote.
    pub fn prepare_vote_rules(&self, vote: &PrepareVote) -> Verdict {
        match self.view_order(vote.epoch, vote.view_number) {
            Ordering::Less => {
                return Verdict::Discard(format!(
                    "stale view ({}, {})",
                    vote.epoch, vote.view_number
                ))
            }
            Ordering::Greater => {
                return Verdict::Fetch {
                    hash: vote.block_hash,
                    number: vote.block_number,
                }
            }
            Ordering::Equal => {}
        }

        if vote.block_index >= self.amount {
            return Verdict::Discard(format!(
                "block index {} outside the pipeline of {}",
                vote.block_index, self.amount
            ));
        }
        if self.state.view_block_by_index(vote.block_index).is_none() {
            return Verdict::Fetch {
                hash: vote.block_hash,
                number: vote.block_number,
            };
        }
        if self
            .pool
            .validator_by_index(vote.block_number, vote.validator_index)
            .is_none()
        {
            return Verdict::Discard(format!(
                "validator index {} out of range",
                vote.validator_index
            ));
        }
        if self.state.has_prepare_vote(vote.block_index, vote.validator_index) {
            return Verdict::Discard(format!(
                "duplicate vote from validator {} for slot {}",
                vote.validator_index, vote.block_index
            ));
        }
        Verdict::Ok
    }

    /// Judge a view change.
    pub fn view_change_rules(&self, view_change: &ViewChange) -> Verdict {
        match self.view_order(view_change.epoch, view_change.view_number) {
            Ordering::Less => {
                return Verdict::Discard(format!(
                    "stale view ({}, {})",
                    view_change.epoch, view_change.view_number
                ))
            }
            Ordering::Greater => {
                return Verdict::Fetch {
                    hash: view_change.block_hash,
                    number: view_change.block_number,
                }
            }
            Ordering::Equal => {}
        }

        if view_change.block_number.0 > 0 {
            if view_change.prepare_qc.is_none() {
                return Verdict::Discard("view change without a prepare certificate".into());
            }
            if self
                .tree
                .find_block_and_qc(&view_change.block_hash, view_change.block_number)
                .0
                .is_none()
            {
                return Verdict::Fetch {
                    hash: view_change.block_hash,
                    number: view_change.block_number,
                };
            }
        }
        if self.state.has_view_change(view_change.validator_index) {
            return Verdict::Discard(format!(
                "duplicate view change from validator {}",
                view_change.validator_index
            ));
        }
        Verdict::Ok
    }

    /// Judge one entry of a catch-up batch of certified blocks.
    pub fn qc_block_rules(&self, block: &Block, qc: &QuorumCert) -> Verdict {
        if qc.block_hash != block.hash() || qc.block_number != block.number() {
            return Verdict::Discard("certificate does not match its block".into());
        }
        if block.number() <= self.state.highest_commit_block().number() {
            return Verdict::Discard(format!(
                "block {} at or below the committed height {}",
                block.number(),
                self.state.highest_commit_block().number()
            ));
        }
        if !block.is_genesis()
            && self
                .tree
                .find_block_and_qc(&block.parent_hash(), BlockNumber(block.number().0 - 1))
                .0
                .is_none()
        {
            return Verdict::Discard("block does not extend the known chain".into());
        }
        if (qc.epoch, qc.view_number) > (self.state.epoch(), self.state.view_number()) {
            return Verdict::NewView {
                epoch: qc.epoch,
                view_number: qc.view_number,
            };
        }
        Verdict::Ok
    }
}

/// Predicates deciding whether a locally signed vote may be released.
pub struct VoteRules<'a> {
    state: &'a ViewState,
    tree: &'a BlockTree,
}

impl<'a> VoteRules<'a> {
    /// Borrow the state needed to judge a vote release.
    pub fn new(state: &'a ViewState, tree: &'a BlockTree) -> Self {
        VoteRules { state, tree }
    }

    /// Whether `vote` may be released now. On `Err` the caller must leave
    /// the vote queued.
    pub fn allow_vote(&self, vote: &PrepareVote, now: Duration) -> Result<(), String> {
        if self.state.deadline_expired(now) {
            return Err("view deadline has passed".into());
        }
        let expected = self.state.had_send_prepare_vote().next_index();
        if vote.block_index != expected {
            return Err(format!(
                "vote for slot {} but slot {} releases next",
                vote.block_index, expected
            ));
        }
        // The tree holds only certified blocks (and the committed root),
        // so parent membership doubles as the parent-certificate check.
        if vote.block_number.0 > 0 {
            let parent_number = BlockNumber(vote.block_number.0 - 1);
            let parent = match self.state.view_block_by_index(vote.block_index) {
                Some(block) => self.tree.find_block_and_qc(&block.parent_hash(), parent_number).0,
                None => None,
            };
            if parent.is_none() {
                return Err("parent block has no certificate yet".into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_types::{
        prepare_block_message, prepare_vote_message, view_change_message, KeyPair,
        SignerBitfield, StaticValidatorPool, ValidatorIndex, ValidatorInfo, ValidatorSet,
    };

    struct Fixture {
        state: ViewState,
        tree: BlockTree,
        pool: StaticValidatorPool,
        keys: Vec<KeyPair>,
        genesis: Block,
    }

    fn fixture() -> Fixture {
        let keys: Vec<KeyPair> = (0..4u8).map(|i| KeyPair::from_seed([i + 1; 32])).collect();
        let validators = keys
            .iter()
            .enumerate()
            .map(|(i, k)| ValidatorInfo {
                index: ValidatorIndex(i as u32),
                node_id: k.node_id(),
                public_key: k.public_key(),
            })
            .collect();
        let pool = StaticValidatorPool::new(ValidatorSet::new(validators));
        let genesis = Block::genesis();
        Fixture {
            state: ViewState::new(1, 0, genesis.clone()),
            tree: BlockTree::new(genesis.clone(), None),
            pool,
            keys,
            genesis,
        }
    }

    impl Fixture {
        fn rules(&self) -> SafetyRules<'_> {
            SafetyRules::new(&self.state, &self.tree, &self.pool, 10)
        }

        // Leader of (epoch 1, view 0) over 4 seats is validator 1.
        fn proposal(&self, index: u32, parent: &Block) -> PrepareBlock {
            let block = Block::new(
                BlockNumber(parent.number().0 + 1),
                parent.hash(),
                0,
                vec![index as u8],
            );
            let payload = prepare_block_message(1, 0, &block.hash(), block.number(), index);
            PrepareBlock {
                epoch: 1,
                view_number: 0,
                block,
                block_index: index,
                proposal_index: ValidatorIndex(1),
                view_change_qc: None,
                signature: self.keys[1].sign(&payload),
            }
        }

        fn vote(&self, validator: usize, index: u32, block: &Block) -> PrepareVote {
            let payload = prepare_vote_message(1, 0, &block.hash(), block.number(), index);
            PrepareVote {
                epoch: 1,
                view_number: 0,
                block_hash: block.hash(),
                block_number: block.number(),
                block_index: index,
                validator_index: ValidatorIndex(validator as u32),
                parent_qc: None,
                signature: self.keys[validator].sign(&payload),
            }
        }

        fn view_change(&self, validator: usize, block: &Block) -> ViewChange {
            let payload = view_change_message(1, 0, &block.hash(), block.number());
            ViewChange {
                epoch: 1,
                view_number: 0,
                block_hash: block.hash(),
                block_number: block.number(),
                validator_index: ValidatorIndex(validator as u32),
                prepare_qc: None,
                signature: self.keys[validator].sign(&payload),
            }
        }
    }

    #[test]
    fn proposal_from_the_leader_is_ok() {
        let f = fixture();
        let genesis = f.genesis.clone();
        assert_eq!(f.rules().prepare_block_rules(&f.proposal(0, &genesis)), Verdict::Ok);
    }

    #[test]
    fn proposal_from_a_non_leader_is_discarded() {
        let f = fixture();
        let mut message = f.proposal(0, &f.genesis.clone());
        message.proposal_index = ValidatorIndex(2);
        assert!(matches!(
            f.rules().prepare_block_rules(&message),
            Verdict::Discard(_)
        ));
    }

    #[test]
    fn unknown_parent_requires_a_fetch() {
        let f = fixture();
        let orphan_parent = Block::new(BlockNumber(5), Hash::from_bytes(b"far"), 0, vec![]);
        let message = f.proposal(0, &orphan_parent);
        assert_eq!(
            f.rules().prepare_block_rules(&message),
            Verdict::Fetch {
                hash: orphan_parent.hash(),
                number: BlockNumber(5),
            }
        );
    }

    #[test]
    fn stale_view_is_discarded() {
        let mut f = fixture();
        let proposal = f.proposal(0, &f.genesis.clone());
        f.state.reset_view(1, 3);
        assert!(matches!(
            f.rules().prepare_block_rules(&proposal),
            Verdict::Discard(_)
        ));
    }

    #[test]
    fn out_of_range_index_is_discarded() {
        let f = fixture();
        let mut message = f.proposal(0, &f.genesis.clone());
        message.block_index = 10;
        assert!(matches!(
            f.rules().prepare_block_rules(&message),
            Verdict::Discard(_)
        ));
    }

    #[test]
    fn duplicate_vote_is_discarded() {
        let mut f = fixture();
        let genesis = f.genesis.clone();
        let proposal = f.proposal(0, &genesis);
        let block = proposal.block.clone();
        f.state.add_prepare_block(proposal);

        let vote = f.vote(2, 0, &block);
        assert_eq!(f.rules().prepare_vote_rules(&vote), Verdict::Ok);
        f.state.add_prepare_vote(ValidatorIndex(2), vote.clone());
        assert!(matches!(
            f.rules().prepare_vote_rules(&vote),
            Verdict::Discard(_)
        ));
    }

    #[test]
    fn vote_for_an_unknown_slot_requires_a_fetch() {
        let f = fixture();
        let block = Block::new(BlockNumber(1), f.genesis.hash(), 0, vec![0]);
        let vote = f.vote(2, 0, &block);
        assert!(matches!(f.rules().prepare_vote_rules(&vote), Verdict::Fetch { .. }));
    }

    #[test]
    fn vote_ahead_of_the_view_requires_a_fetch() {
        let f = fixture();
        let block = Block::new(BlockNumber(1), f.genesis.hash(), 0, vec![0]);
        let mut vote = f.vote(2, 0, &block);
        vote.view_number = 4;
        assert!(matches!(f.rules().prepare_vote_rules(&vote), Verdict::Fetch { .. }));
    }

    #[test]
    fn view_change_for_genesis_needs_no_certificate() {
        let f = fixture();
        let vc = f.view_change(2, &f.genesis.clone());
        assert_eq!(f.rules().view_change_rules(&vc), Verdict::Ok);
    }

    #[test]
    fn duplicate_view_change_is_discarded() {
        let mut f = fixture();
        let vc = f.view_change(2, &f.genesis.clone());
        f.state.add_view_change(ValidatorIndex(2), vc.clone());
        assert!(matches!(f.rules().view_change_rules(&vc), Verdict::Discard(_)));
    }

    #[test]
    fn qc_block_ahead_of_the_view_asks_for_rotation() {
        let f = fixture();
        let block = Block::new(BlockNumber(1), f.genesis.hash(), 0, vec![1]);
        let qc = QuorumCert {
            epoch: 1,
            view_number: 5,
            block_hash: block.hash(),
            block_number: block.number(),
            block_index: 0,
            signature: f.keys[0].sign(b"qc"),
            signers: SignerBitfield::new(4),
        };
        assert_eq!(
            f.rules().qc_block_rules(&block, &qc),
            Verdict::NewView {
                epoch: 1,
                view_number: 5,
            }
        );
    }

    #[test]
    fn vote_rules_hold_votes_until_their_turn() {
        let mut f = fixture();
        let genesis = f.genesis.clone();
        let proposal = f.proposal(0, &genesis);
        let block = proposal.block.clone();
        f.state.add_prepare_block(proposal);
        f.state.set_view_timer(Duration::ZERO, 1, Duration::from_secs(10));

        let rules_ok = {
            let rules = VoteRules::new(&f.state, &f.tree);
            rules.allow_vote(&f.vote(0, 0, &block), Duration::from_secs(1))
        };
        assert!(rules_ok.is_ok());

        // A vote for slot 1 cannot release before slot 0.
        let early = {
            let rules = VoteRules::new(&f.state, &f.tree);
            rules.allow_vote(&f.vote(0, 1, &block), Duration::from_secs(1))
        };
        assert!(early.is_err());

        // Nothing releases after the deadline.
        let late = {
            let rules = VoteRules::new(&f.state, &f.tree);
            rules.allow_vote(&f.vote(0, 0, &block), Duration::from_secs(11))
        };
        assert!(late.is_err());
    }
}
