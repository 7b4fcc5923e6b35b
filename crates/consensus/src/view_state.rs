//! In-memory state of the current view.
//!
//! Everything here is replaced wholesale on view rotation except the
//! node-wide milestones (`highest_qc_block`, `highest_lock_block`,
//! `highest_commit_block`), which survive for the lifetime of the node
//! and never move backwards.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use trellis_types::{
    Block, PrepareBlock, PrepareVote, QuorumCert, ValidatorIndex, ViewChange, ViewChangeQC,
};

/// Where block execution stands within the current view.
///
/// At most one block is in flight. `Idle` behaves arithmetically like
/// index `u32::MAX`: the slot after it wraps to 0, so "no block dispatched
/// yet" and "about to start slot 0" look identical to the pipeline.
/// Whether the wraparound was ever meant to carry meaning beyond that is
/// unclear; it is kept deliberately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutingCursor {
    /// Nothing dispatched in this view yet.
    Idle,
    /// The block at `index` was dispatched. `finished` is set once the
    /// executor reported success but the vote has not yet cleared the
    /// vote rules.
    Dispatched {
        /// The slot under execution.
        index: u32,
        /// Whether execution completed successfully.
        finished: bool,
    },
}

impl ExecutingCursor {
    /// The slot that would execute next.
    pub fn next_index(self) -> u32 {
        match self {
            ExecutingCursor::Idle => 0,
            ExecutingCursor::Dispatched { index, .. } => index.wrapping_add(1),
        }
    }
}

/// Locally signed votes not yet released, in ascending slot order.
#[derive(Debug, Default)]
pub struct PendingVotes {
    queue: VecDeque<PrepareVote>,
}

impl PendingVotes {
    /// Append a signed vote. Votes are pushed in the order blocks finish
    /// executing, so the queue stays sorted by slot.
    pub fn push(&mut self, vote: PrepareVote) {
        self.queue.push_back(vote);
    }

    /// The next vote that would be released.
    pub fn top(&self) -> Option<&PrepareVote> {
        self.queue.front()
    }

    /// Remove and return the next vote.
    pub fn pop(&mut self) -> Option<PrepareVote> {
        self.queue.pop_front()
    }

    /// Iterate without consuming.
    pub fn iter(&self) -> impl Iterator<Item = &PrepareVote> {
        self.queue.iter()
    }

    /// True when nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of waiting votes.
    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

/// Votes this node has already released in the current view.
///
/// Slots only ever grow, one at a time, so the backing list is strictly
/// ascending by slot.
#[derive(Debug, Default)]
pub struct SentVotes {
    votes: Vec<PrepareVote>,
}

impl SentVotes {
    /// Record a released vote.
    pub fn push(&mut self, vote: PrepareVote) {
        self.votes.push(vote);
    }

    /// Whether a vote for `index` was already released.
    pub fn had(&self, index: u32) -> bool {
        self.votes.iter().any(|v| v.block_index == index)
    }

    /// The slot the next released vote must have.
    pub fn next_index(&self) -> u32 {
        self.votes.last().map_or(0, |v| v.block_index + 1)
    }

    /// Iterate over the released votes in release order.
    pub fn iter(&self) -> impl Iterator<Item = &PrepareVote> {
        self.votes.iter()
    }

    /// Number of released votes.
    pub fn len(&self) -> usize {
        self.votes.len()
    }

    /// True when nothing was released yet.
    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }
}

/// Mutable state of the current `(epoch, view)`.
pub struct ViewState {
    epoch: u64,
    view_number: u64,

    /// Proposals received in this view, by slot.
    view_blocks: HashMap<u32, PrepareBlock>,

    /// Prepare votes per slot, keyed by validator for dedup and ordered
    /// iteration when aggregating.
    prepare_votes: HashMap<u32, BTreeMap<ValidatorIndex, PrepareVote>>,

    /// View changes for the current view, one per validator.
    view_changes: BTreeMap<ValidatorIndex, ViewChange>,

    /// Execution progress within the view.
    executing: ExecutingCursor,

    /// Highest slot with a certificate in this view, `None` before the
    /// first one. The slot after `None` is 0, mirroring the executing
    /// cursor's wraparound.
    max_qc_index: Option<u32>,

    /// Votes already released in this view.
    had_sent_prepare_vote: SentVotes,

    /// Signed votes waiting on their parent's certificate.
    pending_prepare_vote: PendingVotes,

    /// The justification carried into this view, when there was one.
    last_view_change_qc: Option<ViewChangeQC>,

    /// When the current view expires.
    deadline: Duration,

    // ═══════════════════════════════════════════════════════════════════
    // Node-wide milestones, preserved across view rotation
    // ═══════════════════════════════════════════════════════════════════
    highest_qc_block: Block,
    highest_lock_block: Block,
    highest_commit_block: Block,
}

impl ViewState {
    /// Fresh state for `(epoch, view_number)`, with all three milestones
    /// at `root` (the last committed block).
    pub fn new(epoch: u64, view_number: u64, root: Block) -> Self {
        ViewState {
            epoch,
            view_number,
            view_blocks: HashMap::new(),
            prepare_votes: HashMap::new(),
            view_changes: BTreeMap::new(),
            executing: ExecutingCursor::Idle,
            max_qc_index: None,
            had_sent_prepare_vote: SentVotes::default(),
            pending_prepare_vote: PendingVotes::default(),
            last_view_change_qc: None,
            deadline: Duration::ZERO,
            highest_qc_block: root.clone(),
            highest_lock_block: root.clone(),
            highest_commit_block: root,
        }
    }

    /// Current epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Current view number.
    pub fn view_number(&self) -> u64 {
        self.view_number
    }

    // ═══════════════════════════════════════════════════════════════════
    // Proposals
    // ═══════════════════════════════════════════════════════════════════

    /// Store a proposal for its slot. Messages from other views and
    /// repeats for an occupied slot are ignored.
    pub fn add_prepare_block(&mut self, message: PrepareBlock) {
        if message.epoch != self.epoch || message.view_number != self.view_number {
            return;
        }
        self.view_blocks.entry(message.block_index).or_insert(message);
    }

    /// The block proposed for `index`, if received.
    pub fn view_block_by_index(&self, index: u32) -> Option<&Block> {
        self.view_blocks.get(&index).map(|p| &p.block)
    }

    /// The full proposal for `index`, if received.
    pub fn prepare_block_by_index(&self, index: u32) -> Option<&PrepareBlock> {
        self.view_blocks.get(&index)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Prepare votes
    // ═══════════════════════════════════════════════════════════════════

    /// Record a vote for its slot. Idempotent per `(slot, validator)`:
    /// the first vote wins.
    pub fn add_prepare_vote(&mut self, validator_index: ValidatorIndex, vote: PrepareVote) {
        self.prepare_votes
            .entry(vote.block_index)
            .or_default()
            .entry(validator_index)
            .or_insert(vote);
    }

    /// Whether `validator_index` already voted for slot `index`.
    pub fn has_prepare_vote(&self, index: u32, validator_index: ValidatorIndex) -> bool {
        self.prepare_votes
            .get(&index)
            .is_some_and(|votes| votes.contains_key(&validator_index))
    }

    /// All votes for a slot, ordered by validator index.
    pub fn all_prepare_vote_by_index(&self, index: u32) -> Vec<PrepareVote> {
        self.prepare_votes
            .get(&index)
            .map(|votes| votes.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of distinct voters for a slot.
    pub fn prepare_vote_len_by_index(&self, index: u32) -> usize {
        self.prepare_votes.get(&index).map_or(0, |votes| votes.len())
    }

    // ═══════════════════════════════════════════════════════════════════
    // View changes
    // ═══════════════════════════════════════════════════════════════════

    /// Record a view change. One per validator; the first wins.
    pub fn add_view_change(&mut self, validator_index: ValidatorIndex, view_change: ViewChange) {
        self.view_changes.entry(validator_index).or_insert(view_change);
    }

    /// Whether `validator_index` already asked to abandon this view.
    pub fn has_view_change(&self, validator_index: ValidatorIndex) -> bool {
        self.view_changes.contains_key(&validator_index)
    }

    /// Number of distinct validators asking to abandon this view.
    pub fn view_change_len(&self) -> usize {
        self.view_changes.len()
    }

    /// All view changes, ordered by validator index.
    pub fn all_view_change(&self) -> Vec<ViewChange> {
        self.view_changes.values().cloned().collect()
    }

    // ═══════════════════════════════════════════════════════════════════
    // Certificates + execution cursor
    // ═══════════════════════════════════════════════════════════════════

    /// Note a certificate formed for a slot of this view.
    pub fn add_qc(&mut self, qc: &QuorumCert) {
        self.max_qc_index = Some(match self.max_qc_index {
            Some(index) => index.max(qc.block_index),
            None => qc.block_index,
        });
    }

    /// Highest slot with a certificate, `None` before the first.
    pub fn max_qc_index(&self) -> Option<u32> {
        self.max_qc_index
    }

    /// The slot whose certificate would form next.
    pub fn next_qc_index(&self) -> u32 {
        self.max_qc_index.map_or(0, |index| index.wrapping_add(1))
    }

    /// Move the execution cursor.
    pub fn set_executing(&mut self, index: u32, finished: bool) {
        self.executing = ExecutingCursor::Dispatched { index, finished };
    }

    /// The execution cursor.
    pub fn executing(&self) -> ExecutingCursor {
        self.executing
    }

    // ═══════════════════════════════════════════════════════════════════
    // Own votes
    // ═══════════════════════════════════════════════════════════════════

    /// Votes already released in this view.
    pub fn had_send_prepare_vote(&self) -> &SentVotes {
        &self.had_sent_prepare_vote
    }

    /// Mutable access for releasing votes.
    pub fn had_send_prepare_vote_mut(&mut self) -> &mut SentVotes {
        &mut self.had_sent_prepare_vote
    }

    /// Signed votes not yet released.
    pub fn pending_prepare_vote(&self) -> &PendingVotes {
        &self.pending_prepare_vote
    }

    /// Mutable access for queueing and releasing votes.
    pub fn pending_prepare_vote_mut(&mut self) -> &mut PendingVotes {
        &mut self.pending_prepare_vote
    }

    // ═══════════════════════════════════════════════════════════════════
    // View lifecycle
    // ═══════════════════════════════════════════════════════════════════

    /// Replace all per-view state for a new `(epoch, view_number)`. The
    /// node-wide milestones survive.
    pub fn reset_view(&mut self, epoch: u64, view_number: u64) {
        self.epoch = epoch;
        self.view_number = view_number;
        self.view_blocks.clear();
        self.prepare_votes.clear();
        self.view_changes.clear();
        self.executing = ExecutingCursor::Idle;
        self.max_qc_index = None;
        self.had_sent_prepare_vote = SentVotes::default();
        self.pending_prepare_vote = PendingVotes::default();
        self.last_view_change_qc = None;
    }

    /// Arm the view deadline: `intervals` timer periods from `now`.
    pub fn set_view_timer(&mut self, now: Duration, intervals: u64, period: Duration) {
        self.deadline = now + period * intervals as u32;
    }

    /// When the current view expires.
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Whether the view deadline has passed.
    pub fn deadline_expired(&self, now: Duration) -> bool {
        now >= self.deadline
    }

    /// Remember the justification the current view was entered with.
    pub fn set_last_view_change_qc(&mut self, qc: Option<ViewChangeQC>) {
        self.last_view_change_qc = qc;
    }

    /// The justification the current view was entered with, if any.
    pub fn last_view_change_qc(&self) -> Option<&ViewChangeQC> {
        self.last_view_change_qc.as_ref()
    }

    // ═══════════════════════════════════════════════════════════════════
    // Node-wide milestones
    // ═══════════════════════════════════════════════════════════════════

    /// The highest certified block.
    pub fn highest_qc_block(&self) -> &Block {
        &self.highest_qc_block
    }

    /// The highest locked block.
    pub fn highest_lock_block(&self) -> &Block {
        &self.highest_lock_block
    }

    /// The highest committed block.
    pub fn highest_commit_block(&self) -> &Block {
        &self.highest_commit_block
    }

    /// Advance the highest certified block. Lower blocks are ignored.
    pub fn set_highest_qc_block(&mut self, block: Block) {
        if block.number() >= self.highest_qc_block.number() {
            self.highest_qc_block = block;
        }
    }

    /// Advance the highest locked block. Lower blocks are ignored.
    pub fn set_highest_lock_block(&mut self, block: Block) {
        if block.number() >= self.highest_lock_block.number() {
            self.highest_lock_block = block;
        }
    }

    /// Advance the highest committed block. Lower blocks are ignored.
    pub fn set_highest_commit_block(&mut self, block: Block) {
        if block.number() >= self.highest_commit_block.number() {
            self.highest_commit_block = block;
        }
    }
}

impl std::fmt::Debug for ViewState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewState")
            .field("epoch", &self.epoch)
            .field("view_number", &self.view_number)
            .field("blocks", &self.view_blocks.len())
            .field("max_qc_index", &self.max_qc_index)
            .field("executing", &self.executing)
            .field("view_changes", &self.view_changes.len())
            .field("highest_qc", &self.highest_qc_block.number())
            .field("highest_lock", &self.highest_lock_block.number())
            .field("highest_commit", &self.highest_commit_block.number())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_types::{BlockNumber, Hash, KeyPair, SignerBitfield};

    fn keys() -> KeyPair {
        KeyPair::from_seed([1u8; 32])
    }

    fn make_proposal(epoch: u64, view: u64, index: u32, parent: &Block) -> PrepareBlock {
        let block = Block::new(
            BlockNumber(parent.number().0 + 1),
            parent.hash(),
            0,
            vec![index as u8],
        );
        let keys = keys();
        let payload = trellis_types::prepare_block_message(
            epoch,
            view,
            &block.hash(),
            block.number(),
            index,
        );
        PrepareBlock {
            epoch,
            view_number: view,
            block,
            block_index: index,
            proposal_index: ValidatorIndex(0),
            view_change_qc: None,
            signature: keys.sign(&payload),
        }
    }

    fn make_vote(index: u32, validator: u32) -> PrepareVote {
        let keys = keys();
        let hash = Hash::from_bytes(&[index as u8]);
        let payload = trellis_types::prepare_vote_message(1, 0, &hash, BlockNumber(1), index);
        PrepareVote {
            epoch: 1,
            view_number: 0,
            block_hash: hash,
            block_number: BlockNumber(1),
            block_index: index,
            validator_index: ValidatorIndex(validator),
            parent_qc: None,
            signature: keys.sign(&payload),
        }
    }

    fn make_qc(index: u32) -> QuorumCert {
        let keys = keys();
        QuorumCert {
            epoch: 1,
            view_number: 0,
            block_hash: Hash::from_bytes(&[index as u8]),
            block_number: BlockNumber(index as u64 + 1),
            block_index: index,
            signature: keys.sign(b"qc"),
            signers: SignerBitfield::new(4),
        }
    }

    #[test]
    fn proposals_from_other_views_are_ignored() {
        let mut state = ViewState::new(1, 0, Block::genesis());
        let genesis = Block::genesis();
        state.add_prepare_block(make_proposal(1, 1, 0, &genesis));
        assert!(state.view_block_by_index(0).is_none());
        state.add_prepare_block(make_proposal(1, 0, 0, &genesis));
        assert!(state.view_block_by_index(0).is_some());
    }

    #[test]
    fn duplicate_votes_do_not_double_count() {
        let mut state = ViewState::new(1, 0, Block::genesis());
        state.add_prepare_vote(ValidatorIndex(2), make_vote(0, 2));
        state.add_prepare_vote(ValidatorIndex(2), make_vote(0, 2));
        assert_eq!(state.prepare_vote_len_by_index(0), 1);
        assert!(state.has_prepare_vote(0, ValidatorIndex(2)));
    }

    #[test]
    fn votes_aggregate_in_validator_order() {
        let mut state = ViewState::new(1, 0, Block::genesis());
        state.add_prepare_vote(ValidatorIndex(3), make_vote(0, 3));
        state.add_prepare_vote(ValidatorIndex(1), make_vote(0, 1));
        let votes = state.all_prepare_vote_by_index(0);
        assert_eq!(votes[0].validator_index, ValidatorIndex(1));
        assert_eq!(votes[1].validator_index, ValidatorIndex(3));
    }

    #[test]
    fn max_qc_index_is_monotone() {
        let mut state = ViewState::new(1, 0, Block::genesis());
        assert_eq!(state.max_qc_index(), None);
        assert_eq!(state.next_qc_index(), 0);
        state.add_qc(&make_qc(0));
        assert_eq!(state.max_qc_index(), Some(0));
        state.add_qc(&make_qc(2));
        state.add_qc(&make_qc(1));
        assert_eq!(state.max_qc_index(), Some(2));
        assert_eq!(state.next_qc_index(), 3);
    }

    #[test]
    fn executing_cursor_wraps_from_idle_to_slot_zero() {
        let state = ViewState::new(1, 0, Block::genesis());
        assert_eq!(state.executing(), ExecutingCursor::Idle);
        assert_eq!(state.executing().next_index(), 0);
    }

    #[test]
    fn sent_votes_track_strictly_ascending_slots() {
        let mut sent = SentVotes::default();
        assert_eq!(sent.next_index(), 0);
        sent.push(make_vote(0, 0));
        sent.push(make_vote(1, 0));
        assert!(sent.had(0));
        assert!(sent.had(1));
        assert!(!sent.had(2));
        assert_eq!(sent.next_index(), 2);
        let indexes: Vec<u32> = sent.iter().map(|v| v.block_index).collect();
        assert!(indexes.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn pending_votes_release_in_order() {
        let mut pending = PendingVotes::default();
        pending.push(make_vote(0, 0));
        pending.push(make_vote(1, 0));
        assert_eq!(pending.top().unwrap().block_index, 0);
        assert_eq!(pending.pop().unwrap().block_index, 0);
        assert_eq!(pending.top().unwrap().block_index, 1);
    }

    #[test]
    fn reset_wipes_per_view_state_and_keeps_milestones() {
        let mut state = ViewState::new(1, 0, Block::genesis());
        let genesis = Block::genesis();
        let b1 = Block::new(BlockNumber(1), genesis.hash(), 0, vec![1]);

        state.add_prepare_block(make_proposal(1, 0, 0, &genesis));
        state.add_prepare_vote(ValidatorIndex(1), make_vote(0, 1));
        state.add_qc(&make_qc(0));
        state.set_executing(0, true);
        state.pending_prepare_vote_mut().push(make_vote(1, 0));
        state.set_highest_qc_block(b1.clone());

        state.reset_view(2, 0);

        assert_eq!(state.epoch(), 2);
        assert!(state.view_block_by_index(0).is_none());
        assert_eq!(state.prepare_vote_len_by_index(0), 0);
        assert_eq!(state.view_change_len(), 0);
        assert_eq!(state.max_qc_index(), None);
        assert_eq!(state.executing(), ExecutingCursor::Idle);
        assert!(state.pending_prepare_vote().is_empty());
        assert_eq!(state.highest_qc_block().hash(), b1.hash());
    }

    #[test]
    fn milestones_never_move_backwards() {
        let genesis = Block::genesis();
        let b1 = Block::new(BlockNumber(1), genesis.hash(), 0, vec![1]);
        let mut state = ViewState::new(1, 0, genesis.clone());

        state.set_highest_commit_block(b1.clone());
        state.set_highest_commit_block(genesis.clone());
        assert_eq!(state.highest_commit_block().number(), BlockNumber(1));

        state.set_highest_lock_block(b1.clone());
        state.set_highest_lock_block(genesis);
        assert_eq!(state.highest_lock_block().number(), BlockNumber(1));
    }

    #[test]
    fn deadline_expiry() {
        let mut state = ViewState::new(1, 0, Block::genesis());
        state.set_view_timer(Duration::from_secs(5), 2, Duration::from_secs(10));
        assert_eq!(state.deadline(), Duration::from_secs(25));
        assert!(!state.deadline_expired(Duration::from_secs(24)));
        assert!(state.deadline_expired(Duration::from_secs(25)));
    }
}
