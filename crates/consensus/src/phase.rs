//! Phase transitions: the threshold checks that move a proposal slot from
//! preparation through pre-commit and commit to a finalized block, and the
//! view-change initiator.
//!
//! Thresholds are asymmetric between the tracks: the priority slot advances
//! on `F + 1` preparations while the fallback slot demands the full safety
//! quorum `M`. Pre-commits and commits always require `M`.

use crate::messages::{
    ChangeView, ChangeViewReason, Commit, MessageBody, PreCommit, PrepareResponse, RecoveryRequest,
    SlotId,
};
use crate::service::{shift_for_view, ConsensusOutput, ConsensusService};
use basalt_core::crypto::{self, SIGNATURE_SIZE};
use basalt_core::{Block, Witness};
use tracing::{debug, info, warn};

impl ConsensusService {
    /// Runs once a slot's proposal and all of its transactions are present.
    /// Backups enforce the aggregate block policy here and answer with a
    /// PrepareResponse; returns false when the proposal was rejected and a
    /// view change was requested instead.
    pub(crate) fn check_prepare_response(&mut self, slot_id: SlotId) -> bool {
        if self.ctx.is_a_primary() || self.ctx.watch_only() {
            return true;
        }

        {
            let slot = self.ctx.slot(slot_id);
            let oversized = slot.estimated_block_size() > self.settings.max_block_size;
            let overfee = slot.total_system_fee() > self.settings.max_block_system_fee;
            if oversized || overfee {
                warn!(
                    slot = %slot_id,
                    size = slot.estimated_block_size(),
                    system_fee = slot.total_system_fee(),
                    "proposal rejected by block policy"
                );
                self.request_change_view(ChangeViewReason::BlockRejectedByPolicy);
                return false;
            }
        }

        if let Some(my) = self.ctx.my_index() {
            if self.ctx.slot(slot_id).preparations[my as usize].is_none() {
                let Some(request) = self.ctx.slot(slot_id).prepare_request() else {
                    return true;
                };
                let preparation_hash = request.envelope.hash();
                self.timer.extend_by_factor(&*self.clock, 2);
                if let Some(stored) = self.broadcast(MessageBody::PrepareResponse(
                    PrepareResponse {
                        slot: slot_id,
                        preparation_hash,
                    },
                )) {
                    debug!(slot = %slot_id, "prepare response sent");
                    self.ctx.last_sent = Some(stored.envelope.clone());
                    self.ctx.slot_mut(slot_id).preparations[my as usize] = Some(stored);
                }
            }
        }
        self.check_preparations(slot_id);
        true
    }

    /// Advances the slot to the pre-commit phase once enough preparation
    /// entries exist and the proposal's transactions are all present.
    pub(crate) fn check_preparations(&mut self, slot_id: SlotId) {
        let Some(my) = self.ctx.my_index() else { return };
        if self.ctx.commit_sent {
            return;
        }

        let threshold = match slot_id {
            SlotId::Priority => self.registry.f() + 1,
            SlotId::Fallback => self.registry.m(),
        };
        let count = self.ctx.slot(slot_id).preparation_count();
        let complete = self.ctx.slot(slot_id).transactions_complete();

        if count >= threshold
            && complete
            && self.ctx.slot(slot_id).pre_commits[my as usize].is_none()
        {
            let Some(request) = self.ctx.slot(slot_id).prepare_request() else {
                return;
            };
            let preparation_hash = request.envelope.hash();

            // The snapshot must hold the pre-commit before the network
            // does, so a crash in between replays the same envelope.
            if let Some(stored) = self.make_signed(MessageBody::PreCommit(PreCommit {
                slot: slot_id,
                preparation_hash,
            })) {
                self.ctx.last_sent = Some(stored.envelope.clone());
                self.ctx.slot_mut(slot_id).pre_commits[my as usize] = Some(stored.clone());
                self.persist_self_state();
                self.send(&stored);
                info!(
                    height = self.ctx.height,
                    view = self.ctx.view_number,
                    slot = %slot_id,
                    preparations = count,
                    "pre-commit sent"
                );
            }
            self.timer
                .reset(&*self.clock, self.settings.milliseconds_per_block);
            self.check_pre_commits(slot_id, false);
        }

        // Priority speed-up: a full safety quorum of preparations proves the
        // pre-commit round would succeed, so skip the round trip.
        if slot_id == SlotId::Priority && count >= self.registry.m() && complete {
            self.check_pre_commits(SlotId::Priority, true);
        }
    }

    /// Signs and announces the commit once `M` pre-commits exist (or the
    /// priority speed-up forces the transition).
    pub(crate) fn check_pre_commits(&mut self, slot_id: SlotId, forced: bool) {
        let Some(my) = self.ctx.my_index() else { return };
        if self.ctx.commit_sent {
            return;
        }
        let ready = forced
            || (self.ctx.slot(slot_id).pre_commit_count() >= self.registry.m()
                && self.ctx.slot(slot_id).transactions_complete());
        if !ready {
            return;
        }
        if !self.ctx.slot(slot_id).header_finalized {
            return;
        }

        let sign_data = self
            .ctx
            .slot(slot_id)
            .header
            .sign_data(self.settings.network);
        let Some(signature) = self.keypair.as_ref().map(|pair| pair.sign(&sign_data)) else {
            return;
        };

        // Durability before dissemination: once the signature exists on
        // disk, a restart re-emits it instead of signing a second one.
        if let Some(stored) = self.make_signed(MessageBody::Commit(Commit {
            slot: slot_id,
            signature,
        })) {
            self.ctx.last_sent = Some(stored.envelope.clone());
            self.ctx.slot_mut(slot_id).commits[my as usize] = Some(stored.clone());
            self.ctx.commit_sent = true;
            self.persist_self_state();
            self.send(&stored);
            info!(
                height = self.ctx.height,
                view = self.ctx.view_number,
                slot = %slot_id,
                forced,
                "commit sent"
            );
        }
        self.timer
            .reset(&*self.clock, self.settings.milliseconds_per_block);
        self.check_commits(slot_id);
    }

    /// Assembles and relays the block once `M` current-view commits exist.
    pub(crate) fn check_commits(&mut self, slot_id: SlotId) {
        let count = self
            .ctx
            .slot(slot_id)
            .commit_count_for_view(self.ctx.view_number);
        if count < self.registry.m() || !self.ctx.slot(slot_id).transactions_complete() {
            return;
        }
        let Some(block) = self.make_block(slot_id) else {
            return;
        };

        self.ctx.block_received_index = Some(block.index());
        self.ctx.block_received_time_ms = Some(self.clock.now_ms());
        self.ctx.block_sent = true;

        info!(
            height = block.index(),
            view = self.ctx.view_number,
            slot = %slot_id,
            hash = %block.hash(),
            transactions = block.transactions.len(),
            "block relayed"
        );
        let _ = self.output.send(ConsensusOutput::RelayBlock(block));
    }

    /// Builds the finalized block for a slot: header, the multi-signature
    /// witness assembled from `M` commit signatures, and the transactions
    /// in proposal order.
    fn make_block(&self, slot_id: SlotId) -> Option<Block> {
        let slot = self.ctx.slot(slot_id);
        let mut header = slot.header.clone();

        let mut invocation = Vec::with_capacity(self.registry.m() * (SIGNATURE_SIZE + 2));
        let mut collected = 0;
        for entry in &slot.commits {
            if collected == self.registry.m() {
                break;
            }
            let Some(stored) = entry else { continue };
            if stored.message.view_number != self.ctx.view_number {
                continue;
            }
            let MessageBody::Commit(commit) = &stored.message.body else {
                continue;
            };
            invocation.push(0x0c);
            invocation.push(SIGNATURE_SIZE as u8);
            invocation.extend_from_slice(&commit.signature);
            collected += 1;
        }
        if collected < self.registry.m() {
            return None;
        }
        let verification =
            crypto::multi_sig_redeem_script(self.registry.m(), self.registry.keys()).ok()?;
        header.witness = Witness::new(invocation, verification);

        let transactions = slot
            .transaction_hashes
            .iter()
            .map(|hash| slot.transactions.get(hash).cloned())
            .collect::<Option<Vec<_>>>()?;

        Some(Block {
            header,
            transactions,
        })
    }

    /// Adopts `new_view` once a safety quorum of validators has asked for
    /// it, adding the local vote if it is still missing.
    pub(crate) fn check_expected_view(&mut self, new_view: u8) {
        if self.ctx.view_number >= new_view {
            return;
        }
        if self.ctx.change_view_count_for(new_view) < self.registry.m() {
            return;
        }

        if !self.ctx.watch_only() {
            let mine = self
                .ctx
                .my_change_view()
                .and_then(|stored| stored.change_view())
                .map(|cv| cv.new_view_number)
                .unwrap_or(0);
            if mine < new_view {
                let timestamp = self.clock.now_ms();
                if let Some(stored) = self.broadcast(MessageBody::ChangeView(ChangeView {
                    timestamp,
                    new_view_number: new_view,
                    reason: ChangeViewReason::ChangeAgreement,
                })) {
                    if let Some(my) = self.ctx.my_index() {
                        self.ctx.change_views[my as usize] = Some(stored);
                    }
                }
            }
        }

        info!(
            height = self.ctx.height,
            old_view = self.ctx.view_number,
            new_view,
            "view change agreed"
        );
        self.initialize_consensus(new_view);
    }

    /// Asks to leave the current view. When so many validators have already
    /// committed or gone silent that `M` change views can no longer
    /// accumulate, a recovery request is broadcast instead.
    pub(crate) fn request_change_view(&mut self, reason: ChangeViewReason) {
        if self.ctx.watch_only() || self.ctx.commit_sent {
            return;
        }
        if self.ctx.more_than_f_nodes_committed_or_lost() {
            debug!(
                committed = self.ctx.count_committed(),
                failed = self.ctx.count_failed(),
                "view change unattainable, requesting recovery"
            );
            self.send_recovery_request();
            return;
        }

        let new_view = self.ctx.view_number.saturating_add(1);
        warn!(
            height = self.ctx.height,
            view = self.ctx.view_number,
            new_view,
            ?reason,
            "requesting view change"
        );
        let timestamp = self.clock.now_ms();
        if let Some(stored) = self.broadcast(MessageBody::ChangeView(ChangeView {
            timestamp,
            new_view_number: new_view,
            reason,
        })) {
            if let Some(my) = self.ctx.my_index() {
                self.ctx.change_views[my as usize] = Some(stored);
            }
        }
        self.timer.reset(
            &*self.clock,
            self.settings.milliseconds_per_block << shift_for_view(self.ctx.view_number),
        );
        self.check_expected_view(new_view);
    }

    /// Broadcasts a plea for the current round state.
    pub(crate) fn send_recovery_request(&mut self) {
        if self.ctx.watch_only() {
            return;
        }
        let timestamp = self.clock.now_ms();
        if self
            .broadcast(MessageBody::RecoveryRequest(RecoveryRequest { timestamp }))
            .is_some()
        {
            debug!(
                height = self.ctx.height,
                view = self.ctx.view_number,
                "recovery request sent"
            );
        }
    }

    /// Persists the local node's signed envelopes for crash recovery.
    pub(crate) fn persist_self_state(&mut self) {
        let Some(my) = self.ctx.my_index() else { return };
        let my = my as usize;
        let mut payloads = Vec::new();
        for slot in &self.ctx.slots {
            if let Some(stored) = &slot.preparations[my] {
                payloads.push(stored.envelope.clone());
            }
        }
        for slot in &self.ctx.slots {
            if let Some(stored) = &slot.pre_commits[my] {
                payloads.push(stored.envelope.clone());
            }
        }
        for slot in &self.ctx.slots {
            if let Some(stored) = &slot.commits[my] {
                payloads.push(stored.envelope.clone());
            }
        }
        let snapshot = crate::persist::ConsensusSnapshot {
            height: self.ctx.height,
            view_number: self.ctx.view_number,
            payloads,
        };
        if let Err(e) = self.store.save(&snapshot) {
            warn!(error = %e, "failed to persist consensus state");
        }
    }
}
