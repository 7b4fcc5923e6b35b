//! The consensus state machine.
//!
//! Entry points mirror the protocol's event surface: the three message
//! kinds, the view timer, the catch-up batch, and the executor callback.
//! Every handler runs the same skeleton: safety rules first, then
//! signature verification, then state mutation, then the pump functions
//! that move the pipeline (`find_executable_block`, `find_qc_block`,
//! `try_send_prepare_vote`, `try_change_view`).

use crate::aggregator::{generate_prepare_qc, generate_view_change_qc};
use crate::block_tree::BlockTree;
use crate::config::ConsensusConfig;
use crate::error::ConsensusError;
use crate::safety::{SafetyRules, Verdict, VoteRules};
use crate::view_state::{ExecutingCursor, ViewState};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, trace, warn};
use trellis_core::{Action, Event, OutboundMessage, StateMachine, TimerId};
use trellis_types::{
    quorum_threshold, Block, BlockNumber, BlockQuorumCert, Hash, KeyPair, PeerId, PrepareBlock,
    PrepareVote, PublicKey, QuorumCert, ValidatorIndex, ValidatorInfo, ValidatorPool, ViewChange,
    ViewChangeQC,
};

/// The consensus core: message handlers, execution pipeline, and view
/// rotation over one validator's state.
pub struct ConsensusState {
    config: ConsensusConfig,
    signing_key: KeyPair,
    validator_pool: Arc<dyn ValidatorPool>,

    state: ViewState,
    block_tree: BlockTree,

    /// Set while the outer layer replays its journal; suppresses the
    /// journal-bound bridge actions so replayed work is not re-recorded.
    loading: bool,

    /// Current time, set by the runner before each call.
    now: Duration,
}

impl ConsensusState {
    /// Build a core rooted at the last committed block.
    ///
    /// `root_qc` is the certificate of `root`, absent only for genesis.
    pub fn new(
        config: ConsensusConfig,
        signing_key: KeyPair,
        validator_pool: Arc<dyn ValidatorPool>,
        epoch: u64,
        root: Block,
        root_qc: Option<QuorumCert>,
    ) -> Self {
        let view_number = config.default_view_number;
        ConsensusState {
            config,
            signing_key,
            validator_pool,
            state: ViewState::new(epoch, view_number, root.clone()),
            block_tree: BlockTree::new(root, root_qc),
            loading: false,
            now: Duration::ZERO,
        }
    }

    /// Arm the first view timer.
    pub fn start(&mut self) -> Vec<Action> {
        self.state.set_view_timer(self.now, 1, self.config.period);
        vec![Action::SetTimer {
            id: TimerId::View,
            duration: self.config.period,
        }]
    }

    /// The per-view state.
    pub fn view_state(&self) -> &ViewState {
        &self.state
    }

    /// The certified block tree.
    pub fn block_tree(&self) -> &BlockTree {
        &self.block_tree
    }

    /// The configuration this core runs with.
    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Gate journal-bound bridge actions during WAL replay.
    pub fn set_loading(&mut self, loading: bool) {
        self.loading = loading;
    }

    fn safety(&self) -> SafetyRules<'_> {
        SafetyRules::new(
            &self.state,
            &self.block_tree,
            self.validator_pool.as_ref(),
            self.config.amount,
        )
    }

    fn threshold(&self) -> usize {
        quorum_threshold(
            self.validator_pool
                .len(self.state.highest_qc_block().number()),
        )
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Signature verification
    // ═══════════════════════════════════════════════════════════════════════

    /// Check a message signature and recover the signer's seat from the
    /// validator set in effect at `at`.
    fn verify_message(
        &self,
        at: BlockNumber,
        index: ValidatorIndex,
        payload: &[u8],
        signature: &trellis_types::Signature,
    ) -> Result<ValidatorInfo, ConsensusError> {
        let validator = self
            .validator_pool
            .validator_by_index(at, index)
            .ok_or(ConsensusError::UnknownValidator(index))?;
        if !validator.public_key.verify(payload, signature) {
            return Err(ConsensusError::InvalidSignature(index));
        }
        Ok(validator)
    }

    /// Check a quorum certificate's aggregate signature and threshold
    /// against the validator set at its height.
    fn verify_quorum_cert(&self, qc: &QuorumCert) -> Result<(), ConsensusError> {
        let n = self.validator_pool.len(qc.block_number);
        if qc.signers.count() < quorum_threshold(n) {
            return Err(ConsensusError::InvalidQuorumCert(format!(
                "{} signers, quorum is {}",
                qc.signers.count(),
                quorum_threshold(n)
            )));
        }
        let keys = self.signer_keys(qc.block_number, &qc.signers)?;
        let refs: Vec<&PublicKey> = keys.iter().collect();
        if !qc.signature.verify_aggregate(&qc.signed_payload(), &refs) {
            return Err(ConsensusError::InvalidQuorumCert(
                "aggregate signature check failed".into(),
            ));
        }
        Ok(())
    }

    /// Check a view-change certificate: every group verifies against its
    /// members and the groups together reach the quorum threshold.
    fn verify_view_change_qc(&self, view_change_qc: &ViewChangeQC) -> Result<(), ConsensusError> {
        if view_change_qc.len() < self.threshold() {
            return Err(ConsensusError::InvalidQuorumCert(format!(
                "{} view-change signers, quorum is {}",
                view_change_qc.len(),
                self.threshold()
            )));
        }
        for cert in &view_change_qc.certs {
            let keys = self.signer_keys(cert.block_number, &cert.signers)?;
            let refs: Vec<&PublicKey> = keys.iter().collect();
            if !cert.signature.verify_aggregate(&cert.signed_payload(), &refs) {
                return Err(ConsensusError::InvalidQuorumCert(
                    "view-change aggregate signature check failed".into(),
                ));
            }
        }
        Ok(())
    }

    fn signer_keys(
        &self,
        at: BlockNumber,
        signers: &trellis_types::SignerBitfield,
    ) -> Result<Vec<PublicKey>, ConsensusError> {
        signers
            .set_indices()
            .map(|seat| {
                self.validator_pool
                    .validator_by_index(at, ValidatorIndex(seat as u32))
                    .map(|v| v.public_key)
                    .ok_or(ConsensusError::UnknownValidator(ValidatorIndex(seat as u32)))
            })
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Message handlers
    // ═══════════════════════════════════════════════════════════════════════

    /// Handle a block proposal from a peer.
    #[instrument(skip(self, message), fields(
        epoch = message.epoch,
        view = message.view_number,
        index = message.block_index,
        number = message.block.number().0,
    ))]
    pub fn on_prepare_block(
        &mut self,
        from: &PeerId,
        message: PrepareBlock,
    ) -> Result<Vec<Action>, ConsensusError> {
        debug!(%from, %message, "received prepare block");

        let verdict = self.safety().prepare_block_rules(&message);
        match verdict {
            Verdict::Discard(reason) => return Err(ConsensusError::Discard(reason)),
            Verdict::Fetch { hash, number } => {
                return Err(ConsensusError::NeedFetch { hash, number })
            }
            Verdict::Ok | Verdict::NewView { .. } => {}
        }

        self.verify_message(
            message.block.number(),
            message.proposal_index,
            &message.signed_payload(),
            &message.signature,
        )?;

        let mut actions = Vec::new();
        if let Verdict::NewView { epoch, view_number } = verdict {
            if let Some(view_change_qc) = &message.view_change_qc {
                self.verify_view_change_qc(view_change_qc)?;
            }
            let (pivot, pivot_qc) = match &message.view_change_qc {
                Some(view_change_qc) => {
                    let (_, _, hash, number) = view_change_qc.max_block();
                    let (block, qc) = self.block_tree.find_block_and_qc(&hash, number);
                    (block.cloned(), qc.cloned())
                }
                None => {
                    let parent_number = BlockNumber(message.block.number().0 - 1);
                    let (block, qc) = self
                        .block_tree
                        .find_block_and_qc(&message.block.parent_hash(), parent_number);
                    (block.cloned(), qc.cloned())
                }
            };
            let Some(pivot) = pivot else {
                return Err(ConsensusError::NeedFetch {
                    hash: message.block.parent_hash(),
                    number: BlockNumber(message.block.number().0 - 1),
                });
            };
            debug!(epoch, view = view_number, "proposal implies a later view, rotating");
            actions.extend(self.change_view(
                epoch,
                view_number,
                pivot,
                pivot_qc,
                message.view_change_qc.clone(),
            ));
        }

        self.state.add_prepare_block(message.clone());
        actions.extend(self.prepare_block_fetch_rules(from, &message));
        actions.extend(self.find_executable_block());
        Ok(actions)
    }

    /// Handle a prepare vote from a peer.
    #[instrument(skip(self, message), fields(
        epoch = message.epoch,
        view = message.view_number,
        index = message.block_index,
        validator = message.validator_index.0,
    ))]
    pub fn on_prepare_vote(
        &mut self,
        from: &PeerId,
        message: PrepareVote,
    ) -> Result<Vec<Action>, ConsensusError> {
        trace!(%from, %message, "received prepare vote");

        match self.safety().prepare_vote_rules(&message) {
            Verdict::Discard(reason) => return Err(ConsensusError::Discard(reason)),
            Verdict::Fetch { hash, number } => {
                return Err(ConsensusError::NeedFetch { hash, number })
            }
            Verdict::Ok | Verdict::NewView { .. } => {}
        }

        let mut actions = self.prepare_vote_fetch_rules(from, &message);

        let validator = self.verify_message(
            message.block_number,
            message.validator_index,
            &message.signed_payload(),
            &message.signature,
        )?;

        // Adopt the parent certificate the vote piggybacks, when the
        // local node already observed the block to be executable.
        if let Some(parent_qc) = message.parent_qc.clone() {
            actions.extend(self.insert_prepare_qc(&parent_qc));
        }

        self.state.add_prepare_vote(validator.index, message);
        actions.extend(self.find_qc_block());
        Ok(actions)
    }

    /// Handle a view change from a peer.
    #[instrument(skip(self, _from, message), fields(
        epoch = message.epoch,
        view = message.view_number,
        validator = message.validator_index.0,
    ))]
    pub fn on_view_change(
        &mut self,
        _from: &PeerId,
        message: ViewChange,
    ) -> Result<Vec<Action>, ConsensusError> {
        debug!(%message, "received view change");

        match self.safety().view_change_rules(&message) {
            Verdict::Discard(reason) => return Err(ConsensusError::Discard(reason)),
            Verdict::Fetch { hash, number } => {
                return Err(ConsensusError::NeedFetch { hash, number })
            }
            Verdict::Ok | Verdict::NewView { .. } => {}
        }

        let validator = self.verify_message(
            message.block_number,
            message.validator_index,
            &message.signed_payload(),
            &message.signature,
        )?;

        self.state.add_view_change(validator.index, message);
        debug!(
            total = self.state.view_change_len(),
            "recorded view change"
        );
        Ok(self.try_change_view())
    }

    /// Handle the view timer expiring.
    ///
    /// A node without a seat at the current height stays silent; it
    /// cannot contribute to a view-change quorum.
    #[instrument(skip(self))]
    pub fn on_view_timeout(&mut self) -> Vec<Action> {
        info!(
            epoch = self.state.epoch(),
            view = self.state.view_number(),
            "view timed out"
        );

        let highest = self.state.highest_qc_block().clone();
        let Some(validator) = self
            .validator_pool
            .validator_by_node_id(highest.number(), &self.config.node_id)
        else {
            debug!("not a validator at the current height, staying silent");
            return Vec::new();
        };

        let (_, qc) = self
            .block_tree
            .find_block_and_qc(&highest.hash(), highest.number());
        let payload = trellis_types::view_change_message(
            self.state.epoch(),
            self.state.view_number(),
            &highest.hash(),
            highest.number(),
        );
        let view_change = ViewChange {
            epoch: self.state.epoch(),
            view_number: self.state.view_number(),
            block_hash: highest.hash(),
            block_number: highest.number(),
            validator_index: validator.index,
            prepare_qc: qc.cloned(),
            signature: self.signing_key.sign(&payload),
        };

        let mut actions = Vec::new();
        if !self.loading {
            actions.push(Action::SendViewChange {
                view_change: view_change.clone(),
            });
        }
        self.state.add_view_change(validator.index, view_change.clone());
        debug!(
            total = self.state.view_change_len(),
            "recorded local view change"
        );
        actions.push(Action::Broadcast {
            message: OutboundMessage::ViewChange(view_change),
        });
        actions.extend(self.try_change_view());
        actions
    }

    /// Handle a catch-up batch of certified blocks, oldest first.
    ///
    /// Each certificate is verified against the validator set at its
    /// height before the block is adopted. A bad entry stops the batch;
    /// everything before it stays applied.
    #[instrument(skip(self, blocks, qcs), fields(len = blocks.len()))]
    pub fn on_insert_qc_blocks(
        &mut self,
        blocks: Vec<Block>,
        qcs: Vec<QuorumCert>,
    ) -> Result<Vec<Action>, ConsensusError> {
        if blocks.len() != qcs.len() {
            return Err(ConsensusError::InvalidArgument(format!(
                "{} blocks but {} certificates",
                blocks.len(),
                qcs.len()
            )));
        }

        let mut actions = Vec::new();
        for (block, qc) in blocks.into_iter().zip(qcs) {
            if let Err(err) = self.verify_quorum_cert(&qc) {
                warn!(%err, block = %block, "rejecting catch-up certificate");
                break;
            }
            let verdict = self.safety().qc_block_rules(&block, &qc);
            match verdict {
                Verdict::NewView { epoch, view_number } => {
                    debug!(epoch, view = view_number, "catch-up block is ahead, rotating");
                    actions.extend(self.change_view(
                        epoch,
                        view_number,
                        block.clone(),
                        Some(qc.clone()),
                        None,
                    ));
                }
                Verdict::Discard(reason) => {
                    warn!(%reason, block = %block, "stopping catch-up batch");
                    break;
                }
                Verdict::Ok | Verdict::Fetch { .. } => {}
            }
            debug!(block = %block, "inserting catch-up block");
            actions.extend(self.insert_qc_block(block, qc));
        }
        Ok(actions)
    }

    /// Handle the executor reporting on a dispatched block.
    #[instrument(skip(self), fields(number = number.0))]
    pub fn on_block_executed(
        &mut self,
        hash: Hash,
        number: BlockNumber,
        execution_error: Option<String>,
    ) -> Vec<Action> {
        if let Some(err) = execution_error {
            error!(%err, ?hash, number = number.0, "block execution failed");
            return Vec::new();
        }
        debug!(?hash, number = number.0, "block executed");

        let mut actions = Vec::new();
        if let ExecutingCursor::Dispatched {
            index,
            finished: false,
        } = self.state.executing()
        {
            let matches = self
                .state
                .view_block_by_index(index)
                .is_some_and(|block| block.hash() == hash);
            if matches {
                self.state.set_executing(index, true);
                match self.sign_block(hash, number, index) {
                    Ok(sign_actions) => {
                        debug!(index, "signed executed block");
                        actions.extend(sign_actions);
                    }
                    Err(err) => {
                        error!(%err, ?hash, number = number.0, "failed to sign executed block");
                        return actions;
                    }
                }
            }
        }

        actions.extend(self.find_qc_block());
        actions.extend(self.find_executable_block());
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Fetch rules
    // ═══════════════════════════════════════════════════════════════════════

    /// A proposal for slot `n` implies slots `0..n` exist; request the
    /// ones this node is missing from the same peer.
    fn prepare_block_fetch_rules(&self, from: &PeerId, message: &PrepareBlock) -> Vec<Action> {
        (0..message.block_index)
            .filter(|index| self.state.view_block_by_index(*index).is_none())
            .map(|block_index| Action::FetchProposal {
                from: from.clone(),
                epoch: self.state.epoch(),
                view_number: self.state.view_number(),
                block_index,
            })
            .collect()
    }

    /// A vote far beyond the certified prefix means earlier proposals
    /// are missing; request them from the voting peer.
    fn prepare_vote_fetch_rules(&self, from: &PeerId, vote: &PrepareVote) -> Vec<Action> {
        if vote.block_index <= self.state.next_qc_index() {
            return Vec::new();
        }
        (0..vote.block_index)
            .filter(|index| self.state.view_block_by_index(*index).is_none())
            .map(|block_index| Action::FetchProposal {
                from: from.clone(),
                epoch: self.state.epoch(),
                view_number: self.state.view_number(),
                block_index,
            })
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Execution pipeline
    // ═══════════════════════════════════════════════════════════════════════

    /// Keep exactly one block in flight: dispatch the next executable
    /// block if the pipeline is idle or the previous block finished.
    fn find_executable_block(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        match self.state.executing() {
            ExecutingCursor::Idle => {
                // The idle cursor wraps to slot 0; the first block's
                // parent must already be certified (or be the root).
                let Some(block) = self.state.view_block_by_index(0).cloned() else {
                    return actions;
                };
                let Some(parent_number) = block.number().0.checked_sub(1) else {
                    return actions;
                };
                let (parent, _) = self
                    .block_tree
                    .find_block_and_qc(&block.parent_hash(), BlockNumber(parent_number));
                let Some(parent) = parent.cloned() else {
                    error!(block = %block, "first proposal's parent is not in the block tree");
                    return actions;
                };
                debug!(block = %block, "dispatching block for execution");
                actions.push(Action::ExecuteBlock { block, parent });
                self.state.set_executing(0, false);
            }
            ExecutingCursor::Dispatched {
                index,
                finished: true,
            } => {
                let next = index.wrapping_add(1);
                let Some(block) = self.state.view_block_by_index(next).cloned() else {
                    return actions;
                };
                let Some(parent) = self.state.view_block_by_index(index).cloned() else {
                    error!(index, "executed slot vanished from the view");
                    return actions;
                };
                debug!(block = %block, "dispatching block for execution");
                actions.push(Action::ExecuteBlock { block, parent });
                self.state.set_executing(next, false);
            }
            ExecutingCursor::Dispatched { finished: false, .. } => {}
        }
        actions
    }

    /// Sign an executed block and queue the vote for release.
    fn sign_block(
        &mut self,
        hash: Hash,
        number: BlockNumber,
        index: u32,
    ) -> Result<Vec<Action>, ConsensusError> {
        let validator = self
            .validator_pool
            .validator_by_node_id(number, &self.config.node_id)
            .ok_or(ConsensusError::NotValidator(number))?;

        // The parent certificate is attached at send time.
        let payload = trellis_types::prepare_vote_message(
            self.state.epoch(),
            self.state.view_number(),
            &hash,
            number,
            index,
        );
        let vote = PrepareVote {
            epoch: self.state.epoch(),
            view_number: self.state.view_number(),
            block_hash: hash,
            block_number: number,
            block_index: index,
            validator_index: validator.index,
            parent_qc: None,
            signature: self.signing_key.sign(&payload),
        };
        self.state.pending_prepare_vote_mut().push(vote);
        Ok(self.try_send_prepare_vote())
    }

    /// Release pending votes in slot order while the vote rules allow:
    /// attach the parent certificate, tally the vote locally, journal it,
    /// broadcast it. Stops at the first unreleasable vote.
    fn try_send_prepare_vote(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        loop {
            let Some(vote) = self.state.pending_prepare_vote().top().cloned() else {
                break;
            };
            if let Err(reason) = VoteRules::new(&self.state, &self.block_tree)
                .allow_vote(&vote, self.now)
            {
                debug!(%reason, index = vote.block_index, "vote held back");
                break;
            }

            let Some(block) = self.state.view_block_by_index(vote.block_index).cloned() else {
                // A queued vote always has its proposal: votes only exist
                // for executed proposals and both are wiped together on
                // rotation. Running on would equivocate.
                error!(
                    index = vote.block_index,
                    "pending vote references a proposal missing from the view"
                );
                panic!("pending prepare vote without a proposal; consensus state is corrupted");
            };

            let (parent, parent_qc) = if block.number().0 == 0 {
                (None, None)
            } else {
                let (b, q) = self
                    .block_tree
                    .find_block_and_qc(&block.parent_hash(), BlockNumber(block.number().0 - 1));
                (b, q.cloned())
            };
            if parent.is_none() && block.number().0 != 0 {
                break;
            }

            let mut vote = self
                .state
                .pending_prepare_vote_mut()
                .pop()
                .expect("top was just observed");
            vote.parent_qc = parent_qc;

            let Some(validator) = self
                .validator_pool
                .validator_by_node_id(vote.block_number, &self.config.node_id)
            else {
                warn!(number = vote.block_number.0, "seat lost before vote release");
                break;
            };

            debug!(vote = %vote, "releasing prepare vote");
            self.state.had_send_prepare_vote_mut().push(vote.clone());
            self.state.add_prepare_vote(validator.index, vote.clone());
            if !self.loading {
                actions.push(Action::SendPrepareVote {
                    block: block.clone(),
                    vote: vote.clone(),
                });
            }
            actions.push(Action::Broadcast {
                message: OutboundMessage::PrepareVote(vote),
            });
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Certificate formation and adoption
    // ═══════════════════════════════════════════════════════════════════════

    /// Form the next slot's certificate once its votes reach quorum and
    /// this node voted for it.
    fn find_qc_block(&mut self) -> Vec<Action> {
        let next = self.state.next_qc_index();
        let size = self.state.prepare_vote_len_by_index(next);

        let mut actions = Vec::new();
        if size >= self.threshold() && self.state.had_send_prepare_vote().had(next) {
            if let Some(block) = self.state.view_block_by_index(next).cloned() {
                let votes = self.state.all_prepare_vote_by_index(next);
                let validators = self.validator_pool.len(block.number());
                match generate_prepare_qc(&votes, validators) {
                    Ok(qc) => {
                        info!(%qc, "formed quorum certificate");
                        actions.extend(self.insert_qc_block(block, qc.clone()));
                        actions.push(Action::Broadcast {
                            message: OutboundMessage::BlockQuorumCert(BlockQuorumCert {
                                block_qc: qc,
                            }),
                        });
                    }
                    Err(err) => warn!(%err, index = next, "failed to aggregate votes"),
                }
            }
        }

        actions.extend(self.try_change_view());
        actions
    }

    /// Adopt a certificate observed piggybacked on a peer's vote, but
    /// only when this node independently executed the certified block.
    fn insert_prepare_qc(&mut self, qc: &QuorumCert) -> Vec<Action> {
        let Some(block) = self.state.view_block_by_index(qc.block_index).cloned() else {
            return Vec::new();
        };

        let linked = {
            let parent = if block.number().0 == 0 {
                None
            } else {
                self.block_tree
                    .find_block_and_qc(&block.parent_hash(), BlockNumber(block.number().0 - 1))
                    .0
            };
            parent.is_some()
                && self.state.highest_qc_block().number().0 + 1 == qc.block_number.0
        };

        let executed = if self
            .validator_pool
            .is_validator(qc.block_number, &self.config.node_id)
        {
            self.state.had_send_prepare_vote().had(qc.block_index) && linked
        } else if self.validator_pool.is_candidate(&self.config.node_id) {
            match self.state.executing() {
                ExecutingCursor::Dispatched { index, finished } => {
                    (qc.block_index < index || (qc.block_index == index && finished)) && linked
                }
                ExecutingCursor::Idle => false,
            }
        } else {
            false
        };

        if executed {
            debug!(%qc, "adopting piggybacked certificate");
            self.insert_qc_block(block, qc.clone())
        } else {
            Vec::new()
        }
    }

    /// Adopt a certified block: record the certificate, update the tree
    /// and milestones, release whatever the certificate unblocks, then
    /// try to commit and rotate.
    fn insert_qc_block(&mut self, block: Block, qc: QuorumCert) -> Vec<Action> {
        debug!(%qc, "inserting certified block");

        if self.state.epoch() == qc.epoch && self.state.view_number() == qc.view_number {
            self.state.add_qc(&qc);
        }

        let mut actions = vec![Action::ResetTxPool {
            block: block.clone(),
        }];
        let (lock, commit) = self.block_tree.insert_qc_block(block.clone(), qc);
        self.state.set_highest_qc_block(block.clone());
        actions.extend(self.try_commit_new_block(lock, commit));
        // A parent certificate arriving is what releases the next pending
        // vote; drain in the same tick.
        actions.extend(self.try_send_prepare_vote());
        actions.extend(self.try_change_view());

        if self.validator_pool.should_switch(block.number()) {
            match self.validator_pool.update(block.number()) {
                Ok(()) => {
                    let epoch = self.state.epoch() + 1;
                    self.state.reset_view(epoch, self.config.default_view_number);
                    info!(
                        number = block.number().0,
                        epoch, "validator set switched, entering new epoch"
                    );
                }
                Err(err) => warn!(%err, "validator set update failed"),
            }
        }
        actions
    }

    /// Commit when the tree surfaces a commit candidate exactly one
    /// height above the last commit; larger gaps only signal catch-up.
    fn try_commit_new_block(
        &mut self,
        lock: Option<Block>,
        commit: Option<Block>,
    ) -> Vec<Action> {
        let (Some(lock), Some(commit)) = (lock, commit) else {
            trace!("no three-chain progress");
            return Vec::new();
        };

        let highest_qc = self.state.highest_qc_block().clone();
        let old_commit_number = self.state.highest_commit_block().number();
        let mut actions = Vec::new();

        if old_commit_number.0 + 1 == commit.number().0 {
            let qc = self
                .block_tree
                .find_block_and_qc(&commit.hash(), commit.number())
                .1
                .cloned();
            match qc {
                Some(qc) => {
                    info!(block = %commit, "committing block");
                    actions.push(Action::CommitBlock {
                        block: commit.clone(),
                        qc,
                    });
                }
                None => error!(block = %commit, "commit candidate has no certificate"),
            }
            self.state.set_highest_lock_block(lock.clone());
            self.state.set_highest_commit_block(commit.clone());
            actions.push(Action::UpdateChainState {
                highest_qc,
                lock: Some(lock),
                commit: Some(commit.clone()),
            });
            self.block_tree.prune_block(&commit.hash(), commit.number(), &[]);
            self.block_tree.new_root(&commit);
        } else {
            debug!(
                old = old_commit_number.0,
                new = commit.number().0,
                "commit gap, signalling catch-up"
            );
            actions.push(Action::UpdateChainState {
                highest_qc,
                lock: None,
                commit: None,
            });
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // View rotation
    // ═══════════════════════════════════════════════════════════════════════

    /// Rotate when the view filled (all slots certified) or a quorum of
    /// view changes arrived.
    fn try_change_view(&mut self) -> Vec<Action> {
        let highest = self.state.highest_qc_block().clone();
        let (block, qc) = self
            .block_tree
            .find_block_and_qc(&highest.hash(), highest.number());
        let Some(block) = block.cloned() else {
            return Vec::new();
        };
        let qc = qc.cloned();
        let next_view = self.state.view_number() + 1;

        if self.state.next_qc_index() == self.config.amount {
            debug!(
                epoch = self.state.epoch(),
                view = self.state.view_number(),
                "view filled, rotating"
            );
            return self.change_view(self.state.epoch(), next_view, block, qc, None);
        }

        if self.state.view_change_len() >= self.threshold() {
            let view_changes = self.state.all_view_change();
            let validators = self.validator_pool.len(highest.number());
            match generate_view_change_qc(&view_changes, validators) {
                Ok(view_change_qc) => {
                    let (_, _, _, max_number) = view_change_qc.max_block();
                    let local_number = qc.as_ref().map_or(0, |q| q.block_number.0);
                    if block.number().0 != 0 && max_number.0 > local_number {
                        warn!(
                            local = local_number,
                            quorum_max = max_number.0,
                            "behind the view-change quorum, waiting for catch-up"
                        );
                        return Vec::new();
                    }
                    debug!(
                        epoch = self.state.epoch(),
                        view = next_view,
                        "view-change quorum reached, rotating"
                    );
                    return self.change_view(
                        self.state.epoch(),
                        next_view,
                        block,
                        qc,
                        Some(view_change_qc),
                    );
                }
                Err(err) => warn!(%err, "failed to aggregate view changes"),
            }
        }
        Vec::new()
    }

    /// Enter `(epoch, view_number)` pivoting on `block`: wipe the view,
    /// arm the timer, journal the switch, and unwind work the old view
    /// left behind.
    fn change_view(
        &mut self,
        epoch: u64,
        view_number: u64,
        block: Block,
        qc: Option<QuorumCert>,
        view_change_qc: Option<ViewChangeQC>,
    ) -> Vec<Action> {
        // A full interval for a fresh start; only the slots the previous
        // view left unfilled when it hands over directly.
        let intervals = match &qc {
            Some(qc) if block.number().0 != 0 && qc.view_number + 1 == view_number => {
                (self.config.amount - qc.block_index) as u64
            }
            _ => 1,
        };

        // Capture the outgoing view's abandoned work before the wipe.
        let rollback = self.stale_view_blocks(&block);

        self.state.reset_view(epoch, view_number);
        self.state.set_view_timer(self.now, intervals, self.config.period);
        self.state.set_last_view_change_qc(view_change_qc.clone());

        let mut actions = vec![Action::SetTimer {
            id: TimerId::View,
            duration: self.config.period * intervals as u32,
        }];
        if !self.loading {
            actions.push(Action::ConfirmViewChange {
                epoch,
                view_number,
                block: block.clone(),
                qc,
                view_change_qc,
            });
        }
        for stale in &rollback {
            actions.push(Action::ClearBlockCache {
                block: stale.clone(),
            });
        }
        actions.push(Action::ForkedResetTxPool {
            new_head: block.header.clone(),
            rollback,
        });

        info!(
            epoch,
            view = view_number,
            pivot = %block,
            deadline = ?self.state.deadline(),
            "entered new view"
        );
        actions
    }

    /// Blocks this node voted (or signed) for in the outgoing view that
    /// sit above the pivot and are now abandoned.
    fn stale_view_blocks(&self, pivot: &Block) -> Vec<Block> {
        let mut seen = HashSet::new();
        let mut stale = Vec::new();
        let votes = self
            .state
            .had_send_prepare_vote()
            .iter()
            .chain(self.state.pending_prepare_vote().iter());
        for vote in votes {
            if vote.block_number.0 > pivot.number().0 {
                if let Some(block) = self.state.view_block_by_index(vote.block_index) {
                    if seen.insert(block.hash()) {
                        stale.push(block.clone());
                    }
                }
            }
        }
        stale
    }
}

impl std::fmt::Debug for ConsensusState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusState")
            .field("node_id", &self.config.node_id)
            .field("state", &self.state)
            .field("block_tree", &self.block_tree)
            .finish()
    }
}

impl StateMachine for ConsensusState {
    fn handle(&mut self, event: &Event) -> Vec<Action> {
        match event {
            Event::PrepareBlockReceived { from, message } => {
                match self.on_prepare_block(from, message.clone()) {
                    Ok(actions) => actions,
                    Err(err) => self.dispatch_error(from, err),
                }
            }
            Event::PrepareVoteReceived { from, message } => {
                match self.on_prepare_vote(from, message.clone()) {
                    Ok(actions) => actions,
                    Err(err) => self.dispatch_error(from, err),
                }
            }
            Event::ViewChangeReceived { from, message } => {
                match self.on_view_change(from, message.clone()) {
                    Ok(actions) => actions,
                    Err(err) => self.dispatch_error(from, err),
                }
            }
            Event::ViewTimeout => self.on_view_timeout(),
            Event::QcBlocksReceived { blocks, qcs } => {
                match self.on_insert_qc_blocks(blocks.clone(), qcs.clone()) {
                    Ok(actions) => actions,
                    Err(err) => {
                        warn!(%err, "rejected catch-up batch");
                        Vec::new()
                    }
                }
            }
            Event::BlockExecuted {
                hash,
                number,
                error,
            } => self.on_block_executed(*hash, *number, error.clone()),
        }
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }
}

impl ConsensusState {
    /// Turn a handler error into dispatch-loop behavior: fetches become
    /// fetch actions, everything else is logged and dropped.
    fn dispatch_error(&self, from: &PeerId, err: ConsensusError) -> Vec<Action> {
        match err {
            ConsensusError::NeedFetch { hash, number } => {
                debug!(%from, ?hash, number = number.0, "fetching missing ancestors");
                vec![Action::FetchBlock {
                    from: from.clone(),
                    hash,
                    number,
                }]
            }
            err => {
                debug!(%from, %err, "dropped consensus message");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;
    use trellis_types::{
        prepare_block_message, prepare_vote_message, StaticValidatorPool, ValidatorSet,
    };

    struct Harness {
        core: ConsensusState,
        keys: Vec<KeyPair>,
        peer: PeerId,
    }

    fn make_validators(n: usize) -> (Vec<KeyPair>, ValidatorSet) {
        let keys: Vec<KeyPair> = (0..n as u8).map(|i| KeyPair::from_seed([i + 1; 32])).collect();
        let set = ValidatorSet::new(
            keys.iter()
                .enumerate()
                .map(|(i, k)| ValidatorInfo {
                    index: ValidatorIndex(i as u32),
                    node_id: k.node_id(),
                    public_key: k.public_key(),
                })
                .collect(),
        );
        (keys, set)
    }

    fn make_harness() -> Harness {
        let (keys, set) = make_validators(4);
        let config = ConsensusConfig {
            node_id: keys[0].node_id(),
            ..ConsensusConfig::default()
        };
        let pool = Arc::new(StaticValidatorPool::new(set));
        let mut core =
            ConsensusState::new(config, keys[0].clone(), pool, 1, Block::genesis(), None);
        core.set_time(Duration::from_secs(1));
        core.start();
        Harness {
            core,
            keys,
            peer: PeerId::new("peer-1"),
        }
    }

    impl Harness {
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
    }

    fn has_broadcast_vote(actions: &[Action], index: u32) -> bool {
        actions.iter().any(|a| {
            matches!(
                a,
                Action::Broadcast {
                    message: OutboundMessage::PrepareVote(v),
                } if v.block_index == index
            )
        })
    }

    #[test]
    fn first_proposal_is_dispatched_for_execution() {
        let mut h = make_harness();
        let proposal = h.proposal(0, &Block::genesis());
        let actions = h.core.on_prepare_block(&h.peer.clone(), proposal).unwrap();

        assert!(actions.iter().any(|a| matches!(a, Action::ExecuteBlock { .. })));
        assert_eq!(
            h.core.view_state().executing(),
            ExecutingCursor::Dispatched {
                index: 0,
                finished: false,
            }
        );
    }

    #[test]
    fn executed_block_is_signed_and_broadcast() {
        let mut h = make_harness();
        let proposal = h.proposal(0, &Block::genesis());
        let block = proposal.block.clone();
        h.core.on_prepare_block(&h.peer.clone(), proposal).unwrap();

        let actions = h.core.on_block_executed(block.hash(), block.number(), None);
        assert!(has_broadcast_vote(&actions, 0));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::SendPrepareVote { .. })));
        assert!(h.core.view_state().had_send_prepare_vote().had(0));
        assert_eq!(
            h.core.view_state().executing(),
            ExecutingCursor::Dispatched {
                index: 0,
                finished: true,
            }
        );
    }

    #[test]
    fn failed_execution_produces_no_vote() {
        let mut h = make_harness();
        let proposal = h.proposal(0, &Block::genesis());
        let block = proposal.block.clone();
        h.core.on_prepare_block(&h.peer.clone(), proposal).unwrap();

        let actions =
            h.core
                .on_block_executed(block.hash(), block.number(), Some("out of gas".into()));
        assert!(actions.is_empty());
        assert!(!h.core.view_state().had_send_prepare_vote().had(0));
    }

    #[traced_test]
    #[test]
    fn quorum_of_votes_forms_a_certificate() {
        let mut h = make_harness();
        let proposal = h.proposal(0, &Block::genesis());
        let block = proposal.block.clone();
        let peer = h.peer.clone();
        h.core.on_prepare_block(&peer, proposal).unwrap();
        h.core.on_block_executed(block.hash(), block.number(), None);

        let vote1 = h.vote(1, 0, &block);
        let actions = h.core.on_prepare_vote(&peer, vote1).unwrap();
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::Broadcast { message: OutboundMessage::BlockQuorumCert(_) })));

        let vote2 = h.vote(2, 0, &block);
        let actions = h.core.on_prepare_vote(&peer, vote2).unwrap();
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Broadcast { message: OutboundMessage::BlockQuorumCert(_) })));

        assert_eq!(h.core.view_state().max_qc_index(), Some(0));
        assert_eq!(h.core.view_state().highest_qc_block().hash(), block.hash());
    }

    #[test]
    fn duplicate_vote_is_rejected_without_changing_the_tally() {
        let mut h = make_harness();
        let proposal = h.proposal(0, &Block::genesis());
        let block = proposal.block.clone();
        let peer = h.peer.clone();
        h.core.on_prepare_block(&peer, proposal).unwrap();

        let vote = h.vote(2, 0, &block);
        h.core.on_prepare_vote(&peer, vote.clone()).unwrap();
        let before = h.core.view_state().prepare_vote_len_by_index(0);

        let err = h.core.on_prepare_vote(&peer, vote).unwrap_err();
        assert!(matches!(err, ConsensusError::Discard(_)));
        assert_eq!(h.core.view_state().prepare_vote_len_by_index(0), before);
    }

    #[test]
    fn unknown_parent_surfaces_a_fetch_action() {
        let mut h = make_harness();
        let far_parent = Block::new(BlockNumber(7), Hash::from_bytes(b"far"), 0, vec![]);
        let proposal = h.proposal(0, &far_parent);
        let peer = h.peer.clone();

        let err = h.core.on_prepare_block(&peer, proposal.clone()).unwrap_err();
        assert!(matches!(err, ConsensusError::NeedFetch { .. }));

        // The dispatch loop turns the error into a fetch request.
        let actions = h.core.handle(&Event::PrepareBlockReceived {
            from: peer,
            message: proposal,
        });
        assert!(matches!(
            actions.as_slice(),
            [Action::FetchBlock { number, .. }] if *number == BlockNumber(7)
        ));
    }

    #[test]
    fn bad_signature_is_rejected() {
        let mut h = make_harness();
        let mut proposal = h.proposal(0, &Block::genesis());
        proposal.signature = h.keys[2].sign(b"wrong payload");
        let err = h.core.on_prepare_block(&h.peer.clone(), proposal).unwrap_err();
        assert!(matches!(err, ConsensusError::InvalidSignature(_)));
    }

    #[test]
    fn timeout_without_a_seat_stays_silent() {
        let (_keys, set) = make_validators(4);
        let outsider = KeyPair::from_seed([99u8; 32]);
        let config = ConsensusConfig {
            node_id: outsider.node_id(),
            ..ConsensusConfig::default()
        };
        let pool = Arc::new(StaticValidatorPool::new(set));
        let mut core = ConsensusState::new(config, outsider, pool, 1, Block::genesis(), None);
        core.set_time(Duration::from_secs(1));
        core.start();

        assert!(core.on_view_timeout().is_empty());
    }

    #[test]
    fn timeout_builds_and_tallies_a_local_view_change() {
        let mut h = make_harness();
        let actions = h.core.on_view_timeout();

        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Broadcast {
                message: OutboundMessage::ViewChange(_),
            }
        )));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::SendViewChange { .. })));
        assert_eq!(h.core.view_state().view_change_len(), 1);

        // A second timeout in the same view does not double-count.
        h.core.on_view_timeout();
        assert_eq!(h.core.view_state().view_change_len(), 1);
    }

    #[test]
    fn mismatched_catch_up_batch_is_an_invalid_argument() {
        let mut h = make_harness();
        let err = h
            .core
            .on_insert_qc_blocks(vec![Block::genesis()], vec![])
            .unwrap_err();
        assert!(matches!(err, ConsensusError::InvalidArgument(_)));
    }
}
