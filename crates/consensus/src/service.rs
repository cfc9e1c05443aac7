//! The consensus actor: event mailbox, message dispatch, and the handlers
//! for the proposal, commit, and change-view messages.
//!
//! A single task owns the [`RoundContext`]; every handler runs to completion
//! before the next event is taken, so no state is ever observed mid-update.
//! External collaborators are reached through synchronous snapshot-read
//! traits ([`LedgerView`], [`MempoolView`]) and a typed outbound channel.

use crate::context::{RoundContext, StoredPayload, VerificationContext};
use crate::messages::{
    ChangeViewReason, ConsensusMessage, MessageBody, PrepareRequest, SlotId,
};
use crate::payload::ConsensusPayload;
use crate::persist::ContextStore;
use crate::timer::{Clock, RoundTimer};
use crate::validators::ValidatorRegistry;
use crate::{Error, Result};
use basalt_config::ProtocolSettings;
use basalt_core::{crypto, Block, BlockHeader, KeyPair, Transaction, UInt256};
use basalt_io::SerializableExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Synchronous snapshot reads against the persisted chain.
pub trait LedgerView: Send + Sync {
    /// Index of the last persisted block.
    fn height(&self) -> u32;

    /// Header of the last persisted block.
    fn current_header(&self) -> BlockHeader;

    /// Whether the transaction is already on chain.
    fn contains_transaction(&self, hash: &UInt256) -> bool;
}

/// Synchronous snapshot reads against the transaction pool.
pub trait MempoolView: Send + Sync {
    /// Verified transactions in pool order.
    fn verified_transactions(&self) -> Vec<Transaction>;

    /// Looks a transaction up in either pool.
    fn try_get(&self, hash: &UInt256) -> Option<Transaction>;
}

/// Effects the consensus actor emits toward the rest of the node.
#[derive(Debug, Clone)]
pub enum ConsensusOutput {
    /// Relay a consensus envelope to the peer-to-peer layer.
    Broadcast(ConsensusPayload),
    /// Ask the task manager to fetch the given transactions.
    RestartTasks(Vec<UInt256>),
    /// Submit a finalized block to the ledger.
    RelayBlock(Block),
}

/// Events delivered to the consensus actor's mailbox.
#[derive(Debug, Clone)]
pub enum ConsensusEvent {
    /// The node finished booting; start the first round.
    SystemReady,
    /// An envelope arrived from the peer-to-peer layer.
    Payload(ConsensusPayload),
    /// The round timer for `(height, view)` fired.
    Timer { height: u32, view_number: u8 },
    /// The ledger persisted the block at `index`.
    BlockPersisted(u32),
}

/// The dual-primary BFT consensus participant.
pub struct ConsensusService {
    pub(crate) settings: ProtocolSettings,
    pub(crate) registry: Arc<ValidatorRegistry>,
    pub(crate) keypair: Option<KeyPair>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) ledger: Arc<dyn LedgerView>,
    pub(crate) mempool: Arc<dyn MempoolView>,
    pub(crate) store: Arc<dyn ContextStore>,
    pub(crate) output: mpsc::UnboundedSender<ConsensusOutput>,
    pub(crate) ctx: RoundContext,
    pub(crate) timer: RoundTimer,
}

impl ConsensusService {
    /// Creates the service. A `keypair` is required when the registry
    /// assigns the local node a validator slot, and its public key must be
    /// the one registered at that slot.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: ProtocolSettings,
        registry: Arc<ValidatorRegistry>,
        keypair: Option<KeyPair>,
        clock: Arc<dyn Clock>,
        ledger: Arc<dyn LedgerView>,
        mempool: Arc<dyn MempoolView>,
        store: Arc<dyn ContextStore>,
        output: mpsc::UnboundedSender<ConsensusOutput>,
    ) -> Result<Self> {
        if let Some(index) = registry.my_index() {
            let registered = registry.key(index).expect("own index is in range");
            match &keypair {
                Some(pair) if pair.public_key() == *registered => {}
                Some(_) => {
                    return Err(Error::InvalidValidator(
                        "key pair does not match the registered validator key".to_string(),
                    ))
                }
                None => {
                    return Err(Error::InvalidValidator(
                        "validator slot assigned but no key pair supplied".to_string(),
                    ))
                }
            }
        }
        let header = ledger.current_header();
        let ctx = RoundContext::new(
            registry.clone(),
            settings.clone(),
            header.index + 1,
            header.hash(),
            header.timestamp,
        );
        Ok(Self {
            settings,
            registry,
            keypair,
            clock,
            ledger,
            mempool,
            store,
            output,
            ctx,
            timer: RoundTimer::new(),
        })
    }

    /// The current round state.
    pub fn context(&self) -> &RoundContext {
        &self.ctx
    }

    /// The round deadline timer.
    pub fn timer(&self) -> &RoundTimer {
        &self.timer
    }

    /// Runs the actor until the mailbox closes.
    pub async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<ConsensusEvent>) {
        loop {
            let sleep_ms = self
                .timer
                .deadline_ms()
                .saturating_sub(self.clock.now_ms())
                .min(u64::from(u32::MAX));
            tokio::select! {
                event = mailbox.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {
                    let (height, view_number) = self.timer.round();
                    // Push the deadline out first so a handler that does not
                    // re-arm cannot make the loop spin.
                    self.timer.reset(&*self.clock, self.settings.milliseconds_per_block);
                    self.on_timeout(height, view_number);
                }
            }
        }
    }

    /// Applies one mailbox event. All state transitions go through here.
    pub fn handle_event(&mut self, event: ConsensusEvent) {
        match event {
            ConsensusEvent::SystemReady => self.on_start(),
            ConsensusEvent::Payload(envelope) => self.on_consensus_payload(envelope),
            ConsensusEvent::Timer {
                height,
                view_number,
            } => self.on_timeout(height, view_number),
            ConsensusEvent::BlockPersisted(index) => self.on_block_persisted(index),
        }
    }

    /// Starts the first round and replays any persisted self-state, so a
    /// restarted validator re-emits the same envelopes it signed before the
    /// crash instead of signing conflicting ones.
    fn on_start(&mut self) {
        self.initialize_consensus(0);

        let snapshot = match self.store.load() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "failed to load persisted consensus state");
                None
            }
        };
        let Some(snapshot) = snapshot else { return };
        if snapshot.height != self.ctx.height {
            debug!(
                snapshot_height = snapshot.height,
                height = self.ctx.height,
                "ignoring stale consensus snapshot"
            );
            return;
        }

        info!(
            height = snapshot.height,
            view = snapshot.view_number,
            payloads = snapshot.payloads.len(),
            "restoring consensus state"
        );
        if snapshot.view_number > self.ctx.view_number {
            self.initialize_consensus(snapshot.view_number);
        }
        for payload in snapshot.payloads {
            // Re-announce first: peers may have missed the original send.
            let _ = self.output.send(ConsensusOutput::Broadcast(payload.clone()));
            self.on_consensus_payload(payload);
        }
        self.recompute_self_flags();
        self.send_recovery_request();
    }

    /// After a snapshot replay, derive the singleton flags from whatever the
    /// replay managed to install.
    fn recompute_self_flags(&mut self) {
        let Some(my) = self.ctx.my_index() else { return };
        let my = my as usize;
        if self
            .ctx
            .slots
            .iter()
            .any(|slot| slot.commits[my].is_some())
        {
            self.ctx.commit_sent = true;
        }
        if self
            .ctx
            .slots
            .iter()
            .any(|slot| slot.preparations[my].is_some())
        {
            self.ctx.request_sent_or_received = true;
        }
    }

    fn on_block_persisted(&mut self, index: u32) {
        if index >= self.ctx.height {
            info!(index, "ledger advanced, starting next round");
            self.initialize_consensus(0);
        }
    }

    /// Resets the round state for a view: a fresh context at view zero, an
    /// in-place reset otherwise. Re-arms the round timer according to the
    /// local node's role.
    pub(crate) fn initialize_consensus(&mut self, view_number: u8) {
        if view_number == 0 {
            let header = self.ledger.current_header();
            self.ctx = RoundContext::new(
                self.registry.clone(),
                self.settings.clone(),
                header.index + 1,
                header.hash(),
                header.timestamp,
            );
        } else {
            self.ctx.reset(view_number);
        }

        let role = if self.ctx.is_priority_primary() {
            "priority-primary"
        } else if self.ctx.is_fallback_primary() {
            "fallback-primary"
        } else if self.ctx.watch_only() {
            "watch-only"
        } else {
            "backup"
        };
        info!(
            height = self.ctx.height,
            view = view_number,
            priority = self.ctx.slot(SlotId::Priority).primary_index(),
            fallback = self.ctx.slot(SlotId::Fallback).primary_index(),
            role,
            "initialized consensus round"
        );

        let ms = self.settings.milliseconds_per_block;
        let base_delay = ms / self.registry.len() as u64;
        let delay = if view_number == 0 {
            if self.ctx.is_a_primary() {
                ms
            } else {
                ms << 1
            }
        } else {
            ms << shift_for_view(view_number)
        };
        self.timer
            .arm(&*self.clock, delay, base_delay, self.ctx.height, view_number);
    }

    /// Entry point for every inbound envelope.
    pub fn on_consensus_payload(&mut self, envelope: ConsensusPayload) {
        if self.ctx.block_sent {
            return;
        }
        if envelope.network != self.settings.network {
            debug!(network = envelope.network, "wrong network magic");
            return;
        }
        let message = match ConsensusMessage::from_array(&envelope.data) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "undecodable consensus message");
                return;
            }
        };
        if message.block_index != self.ctx.height {
            if self.ctx.height < message.block_index {
                warn!(
                    height = self.ctx.height,
                    message_height = message.block_index,
                    "chain is behind"
                );
            }
            return;
        }
        let Some(expected_key) = self.registry.key(message.validator_index).copied() else {
            debug!(
                validator = message.validator_index,
                "validator index out of range"
            );
            return;
        };
        if self.registry.script_hash(message.validator_index) != Some(envelope.sender) {
            warn!(
                validator = message.validator_index,
                sender = %envelope.sender,
                "sender does not match the indexed validator"
            );
            return;
        }
        if !envelope.verify(&expected_key) {
            debug!(
                validator = message.validator_index,
                "envelope witness verification failed"
            );
            return;
        }

        self.ctx.record_seen(expected_key, message.block_index);

        let stored = StoredPayload::new(envelope, message);
        match &stored.message.body {
            MessageBody::ChangeView(_) => self.on_change_view(stored),
            MessageBody::PrepareRequest(_) => self.on_prepare_request(stored),
            MessageBody::PrepareResponse(_) => self.on_prepare_response(stored),
            MessageBody::PreCommit(_) => self.on_pre_commit(stored),
            MessageBody::Commit(_) => self.on_commit(stored),
            MessageBody::RecoveryRequest(_) => self.on_recovery_request(stored),
            MessageBody::RecoveryMessage(_) => self.on_recovery_message(stored),
        }
    }

    /// Accepts a slot primary's proposal and begins collecting its
    /// transactions.
    fn on_prepare_request(&mut self, stored: StoredPayload) {
        let MessageBody::PrepareRequest(request) = stored.message.body.clone() else {
            return;
        };
        let validator_index = stored.message.validator_index;

        if self.ctx.request_sent_or_received
            || self.ctx.not_accepting_payloads_due_to_view_changing()
        {
            debug!(validator = validator_index, "ignoring prepare request");
            return;
        }
        if stored.message.view_number != self.ctx.view_number {
            debug!(
                view = stored.message.view_number,
                "prepare request from another view"
            );
            return;
        }
        let Some(slot_id) = self.ctx.slot_of_proposer(validator_index) else {
            warn!(
                validator = validator_index,
                "prepare request from a non-primary"
            );
            return;
        };
        if request.slot != slot_id {
            warn!(
                validator = validator_index,
                claimed = %request.slot,
                actual = %slot_id,
                "prepare request names the wrong slot"
            );
            return;
        }
        {
            let slot = self.ctx.slot(slot_id);
            if request.version != slot.header.version || request.prev_hash != slot.header.prev_hash
            {
                warn!(validator = validator_index, "prepare request header mismatch");
                return;
            }
        }
        if request.transaction_hashes.len() > self.settings.max_transactions_per_block {
            warn!(
                count = request.transaction_hashes.len(),
                "proposal exceeds the transaction cap"
            );
            return;
        }
        let now = self.clock.now_ms();
        let horizon = now + 8 * self.settings.milliseconds_per_block;
        if request.timestamp <= self.ctx.prev_timestamp || request.timestamp > horizon {
            warn!(
                timestamp = request.timestamp,
                prev = self.ctx.prev_timestamp,
                horizon,
                "proposal timestamp out of range"
            );
            return;
        }
        if request
            .transaction_hashes
            .iter()
            .any(|hash| self.ledger.contains_transaction(hash))
        {
            warn!("proposal includes an already-persisted transaction");
            return;
        }

        info!(
            height = self.ctx.height,
            view = self.ctx.view_number,
            slot = %slot_id,
            validator = validator_index,
            transactions = request.transaction_hashes.len(),
            "prepare request accepted"
        );
        self.timer.extend_by_factor(&*self.clock, 2);

        let request_hash = stored.envelope.hash();
        let settings = self.settings.clone();
        {
            let slot = self.ctx.slot_mut(slot_id);
            slot.header.timestamp = request.timestamp;
            slot.header.nonce = request.nonce;
            slot.header.merkle_root = crypto::merkle_root(&request.transaction_hashes);
            slot.transaction_hashes = request.transaction_hashes.clone();
            slot.transactions.clear();
            slot.verification = VerificationContext::new(&settings);
            slot.header_finalized = true;

            // Responses parked for a different proposal are now provably
            // stale: keep only those that reference this request.
            for entry in slot.preparations.iter_mut() {
                let keep = entry
                    .as_ref()
                    .map(|parked| match &parked.message.body {
                        MessageBody::PrepareResponse(response) => {
                            response.preparation_hash == request_hash
                        }
                        _ => false,
                    })
                    .unwrap_or(false);
                if !keep {
                    *entry = None;
                }
            }
        }
        self.revalidate_parked_commits(slot_id);

        self.ctx.slot_mut(slot_id).preparations[validator_index as usize] = Some(stored);
        self.ctx.request_sent_or_received = true;
        self.ctx.progress_since_timeout = true;

        if request.transaction_hashes.is_empty() {
            self.check_prepare_response(slot_id);
            return;
        }

        // First pass: transactions the pool has already verified.
        let mut pool: HashMap<UInt256, Transaction> = self
            .mempool
            .verified_transactions()
            .into_iter()
            .map(|tx| (tx.hash(), tx))
            .collect();
        for hash in &request.transaction_hashes {
            if let Some(tx) = pool.remove(hash) {
                if !self.add_transaction(slot_id, tx, false) {
                    return;
                }
            }
        }
        // Second pass: anything else the pool can produce must be verified
        // before it is admitted.
        for hash in self.ctx.slot(slot_id).missing_transactions() {
            if let Some(tx) = self.mempool.try_get(&hash) {
                if !self.add_transaction(slot_id, tx, true) {
                    return;
                }
            }
        }

        let missing = self.ctx.slot(slot_id).missing_transactions();
        if !missing.is_empty() {
            debug!(count = missing.len(), "requesting missing transactions");
            let _ = self.output.send(ConsensusOutput::RestartTasks(missing));
        }
    }

    /// Commits parked before the slot's header was known are checked against
    /// the now-final sign-data; current-view entries that fail are dropped.
    fn revalidate_parked_commits(&mut self, slot_id: SlotId) {
        let sign_data = self
            .ctx
            .slot(slot_id)
            .header
            .sign_data(self.settings.network);
        let view_number = self.ctx.view_number;
        for index in 0..self.registry.len() {
            let Some(key) = self.registry.key(index as u8).copied() else {
                continue;
            };
            let slot = &mut self.ctx.slots[slot_id.index()];
            let Some(parked) = slot.commits[index].as_ref() else {
                continue;
            };
            if parked.message.view_number != view_number {
                continue;
            }
            let valid = match &parked.message.body {
                MessageBody::Commit(commit) => {
                    crypto::verify_signature(&sign_data, &commit.signature, &key)
                }
                _ => false,
            };
            if !valid {
                warn!(validator = index, "dropping parked commit that fails the new sign-data");
                slot.commits[index] = None;
            }
        }
    }

    /// Admits a proposal transaction. Returns false when processing must
    /// abort because the transaction triggered a view change.
    pub(crate) fn add_transaction(
        &mut self,
        slot_id: SlotId,
        transaction: Transaction,
        verify: bool,
    ) -> bool {
        let hash = transaction.hash();
        if verify {
            if let Err(e) = transaction.verify_stateless() {
                warn!(tx = %hash, error = %e, "proposal transaction failed verification");
                self.request_change_view(ChangeViewReason::TxInvalid);
                return false;
            }
        }
        if !self
            .ctx
            .slot(slot_id)
            .verification
            .check_transaction(&transaction)
        {
            warn!(tx = %hash, "proposal transaction rejected by policy");
            self.request_change_view(ChangeViewReason::TxRejectedByPolicy);
            return false;
        }
        self.ctx.slot_mut(slot_id).verification.add(&transaction);
        self.ctx
            .slot_mut(slot_id)
            .transactions
            .insert(hash, transaction);
        if self.ctx.slot(slot_id).transactions_complete() {
            return self.check_prepare_response(slot_id);
        }
        true
    }

    /// Stores a backup's acceptance of a proposal.
    fn on_prepare_response(&mut self, stored: StoredPayload) {
        let MessageBody::PrepareResponse(response) = stored.message.body.clone() else {
            return;
        };
        let validator_index = stored.message.validator_index as usize;
        let slot_id = response.slot;

        if stored.message.view_number != self.ctx.view_number {
            debug!("prepare response from another view");
            return;
        }
        if self.ctx.slot(slot_id).preparations[validator_index].is_some() {
            return;
        }
        if self.ctx.not_accepting_payloads_due_to_view_changing() {
            debug!("ignoring prepare response while view-changing");
            return;
        }
        if let Some(request) = self.ctx.slot(slot_id).prepare_request() {
            if response.preparation_hash != request.envelope.hash() {
                warn!(
                    validator = validator_index,
                    "prepare response references a different proposal"
                );
                return;
            }
        }

        debug!(
            validator = validator_index,
            slot = %slot_id,
            "prepare response accepted"
        );
        self.timer.extend_by_factor(&*self.clock, 2);
        self.ctx.slot_mut(slot_id).preparations[validator_index] = Some(stored);
        self.ctx.progress_since_timeout = true;

        if !self.ctx.watch_only() && !self.ctx.commit_sent && self.ctx.request_sent_or_received {
            self.check_preparations(slot_id);
        }
    }

    /// Stores a validator's pre-commit: the announcement that the slot
    /// reached its preparation threshold at the sender.
    fn on_pre_commit(&mut self, stored: StoredPayload) {
        let MessageBody::PreCommit(pre_commit) = stored.message.body.clone() else {
            return;
        };
        let validator_index = stored.message.validator_index as usize;
        let slot_id = pre_commit.slot;

        if stored.message.view_number != self.ctx.view_number {
            debug!("pre-commit from another view");
            return;
        }
        if self.ctx.slot(slot_id).pre_commits[validator_index].is_some() {
            return;
        }
        if self.ctx.not_accepting_payloads_due_to_view_changing() {
            debug!("ignoring pre-commit while view-changing");
            return;
        }
        // A pre-commit may legitimately arrive before the proposal itself;
        // it is only rejected when it contradicts a pinned proposal hash.
        if let Some(request) = self.ctx.slot(slot_id).prepare_request() {
            if pre_commit.preparation_hash != request.envelope.hash() {
                warn!(
                    validator = validator_index,
                    "pre-commit references a different proposal"
                );
                return;
            }
        }

        debug!(validator = validator_index, slot = %slot_id, "pre-commit accepted");
        self.timer.extend_by_factor(&*self.clock, 2);
        self.ctx.slot_mut(slot_id).pre_commits[validator_index] = Some(stored);
        self.ctx.progress_since_timeout = true;

        if !self.ctx.watch_only() && !self.ctx.commit_sent && self.ctx.request_sent_or_received {
            self.check_pre_commits(slot_id, false);
        }
    }

    /// Stores a validator's block signature, verifying it when the slot's
    /// header is final and parking it otherwise.
    fn on_commit(&mut self, stored: StoredPayload) {
        let MessageBody::Commit(commit) = stored.message.body.clone() else {
            return;
        };
        let validator_index = stored.message.validator_index as usize;
        let slot_id = commit.slot;

        if let Some(existing) = &self.ctx.slot(slot_id).commits[validator_index] {
            if existing.envelope.hash() != stored.envelope.hash() {
                warn!(
                    validator = validator_index,
                    slot = %slot_id,
                    existing_view = existing.message.view_number,
                    new_view = stored.message.view_number,
                    "equivocating commit discarded"
                );
            }
            return;
        }

        self.timer.extend_by_factor(&*self.clock, 4);

        if stored.message.view_number == self.ctx.view_number {
            if !self.ctx.slot(slot_id).header_finalized {
                debug!(
                    validator = validator_index,
                    "parking commit, no proposal locked in"
                );
                self.ctx.slot_mut(slot_id).commits[validator_index] = Some(stored);
                return;
            }
            let sign_data = self
                .ctx
                .slot(slot_id)
                .header
                .sign_data(self.settings.network);
            let Some(key) = self.registry.key(stored.message.validator_index).copied() else {
                return;
            };
            if crypto::verify_signature(&sign_data, &commit.signature, &key) {
                debug!(validator = validator_index, slot = %slot_id, "commit accepted");
                self.ctx.slot_mut(slot_id).commits[validator_index] = Some(stored);
                self.ctx.progress_since_timeout = true;
                self.check_commits(slot_id);
            } else {
                warn!(validator = validator_index, "commit signature invalid");
            }
        } else {
            // Useful to later recovery once the matching header shows up.
            debug!(
                validator = validator_index,
                view = stored.message.view_number,
                "parking commit from another view"
            );
            self.ctx.slot_mut(slot_id).commits[validator_index] = Some(stored);
        }
    }

    /// Records a request to abandon the current view.
    fn on_change_view(&mut self, stored: StoredPayload) {
        let Some(change_view) = stored.change_view().cloned() else {
            return;
        };
        let validator_index = stored.message.validator_index;

        if change_view.new_view_number <= self.ctx.view_number {
            // The sender lags: what it needs is a recovery, not our vote.
            debug!(
                validator = validator_index,
                requested = change_view.new_view_number,
                "stale change view treated as recovery request"
            );
            self.respond_to_recovery_request(&stored);
        }
        if self.ctx.commit_sent {
            return;
        }
        let expected = self.ctx.change_views[validator_index as usize]
            .as_ref()
            .and_then(StoredPayload::change_view)
            .map(|cv| cv.new_view_number)
            .unwrap_or(0);
        if change_view.new_view_number <= expected {
            debug!(
                validator = validator_index,
                requested = change_view.new_view_number,
                expected,
                "non-monotonic change view dropped"
            );
            return;
        }

        info!(
            height = self.ctx.height,
            view = self.ctx.view_number,
            validator = validator_index,
            new_view = change_view.new_view_number,
            reason = ?change_view.reason,
            "change view recorded"
        );
        self.ctx.change_views[validator_index as usize] = Some(stored);
        self.ctx.progress_since_timeout = true;
        self.check_expected_view(change_view.new_view_number);
    }

    /// Handles the round timer: primaries propose, committed nodes
    /// re-announce, stalled nodes escalate to a view change.
    pub fn on_timeout(&mut self, height: u32, view_number: u8) {
        if height != self.ctx.height || view_number != self.ctx.view_number {
            debug!(height, view_number, "stale timer ignored");
            return;
        }
        if self.ctx.watch_only() || self.ctx.block_sent {
            return;
        }
        warn!(
            height,
            view = view_number,
            "round timer expired"
        );

        let may_propose = self.ctx.is_priority_primary()
            || (self.ctx.is_fallback_primary() && self.ctx.view_number == 0);
        if may_propose && !self.ctx.request_sent_or_received {
            self.send_prepare_requests();
            let ms = self.settings.milliseconds_per_block;
            self.timer
                .reset(&*self.clock, ms << shift_for_view(view_number.saturating_add(1)));
        } else if self.ctx.commit_sent {
            // Locked: the only useful act is re-announcing the signature.
            self.resend_commit();
            self.timer
                .reset(&*self.clock, self.settings.milliseconds_per_block);
        } else if self.ctx.progress_since_timeout {
            if let Some(last) = self.ctx.last_sent.clone() {
                debug!("re-broadcasting most advanced envelope");
                let _ = self.output.send(ConsensusOutput::Broadcast(last));
            }
            self.ctx.progress_since_timeout = false;
            self.timer
                .reset(&*self.clock, self.settings.milliseconds_per_block);
        } else {
            self.request_change_view(ChangeViewReason::Timeout);
        }
    }

    fn resend_commit(&mut self) {
        let Some(my) = self.ctx.my_index() else { return };
        for slot in &self.ctx.slots {
            if let Some(commit) = &slot.commits[my as usize] {
                let _ = self
                    .output
                    .send(ConsensusOutput::Broadcast(commit.envelope.clone()));
            }
        }
    }

    /// Proposes on every slot the local node is primary of. The fallback
    /// track only ever proposes at view zero.
    pub(crate) fn send_prepare_requests(&mut self) {
        if self.ctx.is_priority_primary() {
            self.send_prepare_request(SlotId::Priority);
        }
        if self.ctx.is_fallback_primary() && self.ctx.view_number == 0 {
            self.send_prepare_request(SlotId::Fallback);
        }
    }

    pub(crate) fn send_prepare_request(&mut self, slot_id: SlotId) {
        if self.ctx.slot(slot_id).prepare_request().is_some() {
            return;
        }
        let now = self.clock.now_ms();
        let timestamp = now.max(self.ctx.prev_timestamp + 1);
        let nonce: u64 = rand::random();

        // Deterministic selection from the verified pool snapshot, bounded
        // by the per-block caps.
        let mut verification = VerificationContext::new(&self.settings);
        let mut hashes = Vec::new();
        let mut transactions = HashMap::new();
        for tx in self.mempool.verified_transactions() {
            if hashes.len() >= self.settings.max_transactions_per_block {
                break;
            }
            if !verification.try_add(&tx) {
                break;
            }
            let hash = tx.hash();
            hashes.push(hash);
            transactions.insert(hash, tx);
        }

        {
            let slot = self.ctx.slot_mut(slot_id);
            slot.header.timestamp = timestamp;
            slot.header.nonce = nonce;
            slot.header.merkle_root = crypto::merkle_root(&hashes);
            slot.transaction_hashes = hashes.clone();
            slot.transactions = transactions;
            slot.verification = verification;
            slot.header_finalized = true;
        }

        let body = MessageBody::PrepareRequest(PrepareRequest {
            slot: slot_id,
            version: self.ctx.slot(slot_id).header.version,
            prev_hash: self.ctx.prev_hash,
            timestamp,
            nonce,
            transaction_hashes: hashes,
        });
        let Some(stored) = self.broadcast(body) else {
            return;
        };
        info!(
            height = self.ctx.height,
            view = self.ctx.view_number,
            slot = %slot_id,
            transactions = self.ctx.slot(slot_id).transaction_hashes.len(),
            "prepare request sent"
        );
        let validator_index = stored.message.validator_index as usize;
        self.ctx.last_sent = Some(stored.envelope.clone());
        self.ctx.slot_mut(slot_id).preparations[validator_index] = Some(stored);
        self.ctx.request_sent_or_received = true;
        self.check_preparations(slot_id);
    }

    /// Signs a message under the local validator identity without sending
    /// it. `None` when watch-only.
    pub(crate) fn make_signed(&mut self, body: MessageBody) -> Option<StoredPayload> {
        let validator_index = self.ctx.my_index()?;
        let keypair = self.keypair.as_ref()?;
        let message = ConsensusMessage {
            block_index: self.ctx.height,
            validator_index,
            view_number: self.ctx.view_number,
            body,
        };
        let mut envelope = ConsensusPayload::new(
            self.settings.network,
            self.ctx.height,
            keypair.public_key().script_hash(),
            message.to_array(),
        );
        envelope.sign(keypair);
        Some(StoredPayload::new(envelope, message))
    }

    /// Emits a previously signed envelope to the peer-to-peer layer.
    pub(crate) fn send(&mut self, stored: &StoredPayload) {
        self.ctx.progress_since_timeout = true;
        let _ = self
            .output
            .send(ConsensusOutput::Broadcast(stored.envelope.clone()));
    }

    /// Signs and immediately emits a message, returning the stored copy.
    pub(crate) fn broadcast(&mut self, body: MessageBody) -> Option<StoredPayload> {
        let stored = self.make_signed(body)?;
        self.send(&stored);
        Some(stored)
    }
}

/// Exponential view-change backoff, clamped so the shift cannot overflow.
pub(crate) fn shift_for_view(view_number: u8) -> u32 {
    u32::from(view_number.saturating_add(1)).min(16)
}
