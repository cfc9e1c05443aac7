//! The recovery engine: answering recovery requests under the rotating
//! responder rule, and applying incoming recovery messages by re-injecting
//! their carried envelopes through the regular dispatcher.

use crate::context::StoredPayload;
use crate::messages::{
    ConsensusMessage, MessageBody, RecoveryMessage, SlotId,
};
use crate::payload::ConsensusPayload;
use crate::service::{ConsensusOutput, ConsensusService};
use basalt_core::crypto::{self, SIGNATURE_SIZE};
use basalt_core::{Block, BlockHeader, UInt256, Witness};
use basalt_io::SerializableExt;
use tracing::{debug, info, warn};

impl ConsensusService {
    pub(crate) fn on_recovery_request(&mut self, stored: StoredPayload) {
        self.respond_to_recovery_request(&stored);
    }

    /// Decides whether to answer a recovery request (explicit, or implicit
    /// via a stale change view) and emits the recovery message if so.
    ///
    /// Before the local node has committed, only the `F` validators that
    /// follow the requester in index order reply, bounding the response
    /// fan-out per request. A committed node always replies: its state is
    /// the only path forward for the requester.
    pub(crate) fn respond_to_recovery_request(&mut self, stored: &StoredPayload) {
        if !self.ctx.known_hashes.insert(stored.envelope.hash()) {
            debug!("recovery request already answered");
            return;
        }
        if self.ctx.watch_only() {
            return;
        }
        let Some(my) = self.ctx.my_index() else { return };

        let should_send = if self.ctx.commit_sent {
            true
        } else {
            let n = self.registry.len() as u32;
            let requester = u32::from(stored.message.validator_index);
            (1..=self.registry.f() as u32).any(|i| (requester + i) % n == u32::from(my))
        };
        if !should_send {
            debug!(
                requester = stored.message.validator_index,
                "not a designated responder for this recovery request"
            );
            return;
        }

        info!(
            height = self.ctx.height,
            view = self.ctx.view_number,
            requester = stored.message.validator_index,
            "answering recovery request"
        );
        let recovery = self.make_recovery_message();
        let _ = self.broadcast(MessageBody::RecoveryMessage(recovery));
    }

    /// Bundles the current round state into a recovery message.
    fn make_recovery_message(&self) -> RecoveryMessage {
        let mut recovery = RecoveryMessage::default();

        for entry in self.ctx.change_views.iter().flatten() {
            recovery.change_views.push(entry.envelope.clone());
        }
        for slot_id in SlotId::ALL {
            let slot = self.ctx.slot(slot_id);
            if let Some(request) = slot.prepare_request() {
                recovery.prepare_requests.push(request.envelope.clone());
            }
            for (index, entry) in slot.preparations.iter().enumerate() {
                let Some(stored) = entry else { continue };
                if index == slot.primary_index() as usize {
                    continue; // the request is carried separately
                }
                recovery.preparations.push(stored.envelope.clone());
            }
            for entry in slot.pre_commits.iter().flatten() {
                recovery.pre_commits.push(entry.envelope.clone());
            }
            for entry in slot.commits.iter().flatten() {
                recovery.commits.push(entry.envelope.clone());
            }
        }
        recovery
    }

    /// Applies an incoming recovery message by re-injecting the carried
    /// envelopes; each passes the full dispatcher checks again.
    pub(crate) fn on_recovery_message(&mut self, stored: StoredPayload) {
        let MessageBody::RecoveryMessage(recovery) = stored.message.body.clone() else {
            return;
        };
        let view_number = stored.message.view_number;
        debug!(
            validator = stored.message.validator_index,
            view = view_number,
            "applying recovery message"
        );

        self.ctx.is_recovering = true;
        let (valid, total) = self.apply_recovery(&recovery, view_number);
        self.ctx.is_recovering = false;

        info!(
            height = self.ctx.height,
            view = self.ctx.view_number,
            valid,
            total,
            "recovery message applied"
        );
    }

    fn apply_recovery(&mut self, recovery: &RecoveryMessage, view_number: u8) -> (usize, usize) {
        let mut valid = 0usize;
        let mut total = 0usize;
        let inject = |service: &mut Self, payload: &ConsensusPayload, v: &mut usize, t: &mut usize| {
            *t += 1;
            if service.reverify_and_process(payload) {
                *v += 1;
            }
        };

        // A recovery from a later view can only help us catch up through
        // its change views.
        if view_number > self.ctx.view_number && !self.ctx.commit_sent {
            for payload in &recovery.change_views {
                inject(self, payload, &mut valid, &mut total);
            }
        }

        if view_number == self.ctx.view_number
            && !self.ctx.not_accepting_payloads_due_to_view_changing()
            && !self.ctx.commit_sent
        {
            if !self.ctx.request_sent_or_received {
                if recovery.prepare_requests.is_empty() {
                    // No proposal on record anywhere: a primary regenerates
                    // its own. The fallback track only does so at view zero.
                    if self.ctx.is_priority_primary()
                        || (self.ctx.is_fallback_primary() && self.ctx.view_number == 0)
                    {
                        self.send_prepare_requests();
                    }
                } else {
                    for payload in &recovery.prepare_requests {
                        inject(self, payload, &mut valid, &mut total);
                    }
                }
            }
            for payload in &recovery.preparations {
                inject(self, payload, &mut valid, &mut total);
            }
            for payload in &recovery.pre_commits {
                inject(self, payload, &mut valid, &mut total);
            }
        }

        // Commits flow regardless of view: ones from lower views may still
        // complete a block for the view they were signed in.
        if view_number <= self.ctx.view_number {
            for payload in &recovery.commits {
                inject(self, payload, &mut valid, &mut total);
            }
            self.try_assemble_past_view_block(recovery);
        }

        (valid, total)
    }

    /// Routes a carried envelope back through the dispatcher. Nested
    /// recovery bodies are refused so a recovery message cannot recurse.
    fn reverify_and_process(&mut self, payload: &ConsensusPayload) -> bool {
        let Ok(message) = ConsensusMessage::from_array(&payload.data) else {
            return false;
        };
        if matches!(
            message.body,
            MessageBody::RecoveryRequest(_) | MessageBody::RecoveryMessage(_)
        ) {
            return false;
        }
        self.on_consensus_payload(payload.clone());
        true
    }

    /// Parked commits from an earlier view become countable once a recovery
    /// message supplies the matching proposal: the header for that view is
    /// rebuilt from the carried prepare request, the parked signatures are
    /// verified against its sign-data, and a block is assembled when a
    /// safety quorum of them holds and every transaction is available.
    fn try_assemble_past_view_block(&mut self, recovery: &RecoveryMessage) {
        if self.ctx.block_sent {
            return;
        }
        for payload in &recovery.prepare_requests {
            let Ok(message) = ConsensusMessage::from_array(&payload.data) else {
                continue;
            };
            let MessageBody::PrepareRequest(request) = &message.body else {
                continue;
            };
            if message.block_index != self.ctx.height
                || message.view_number >= self.ctx.view_number
            {
                continue;
            }
            let slot_id = request.slot;
            let primary = match slot_id {
                SlotId::Priority => self
                    .registry
                    .priority_primary(self.ctx.height, message.view_number),
                SlotId::Fallback => self
                    .registry
                    .fallback_primary(self.ctx.height, message.view_number),
            };
            if message.validator_index != primary {
                continue;
            }

            let header = BlockHeader {
                version: request.version,
                prev_hash: request.prev_hash,
                merkle_root: crypto::merkle_root(&request.transaction_hashes),
                timestamp: request.timestamp,
                nonce: request.nonce,
                index: self.ctx.height,
                primary_index: primary,
                next_consensus: self.registry.next_consensus(),
                witness: Witness::empty(),
            };
            let sign_data = header.sign_data(self.settings.network);

            let mut invocation = Vec::new();
            let mut collected = 0usize;
            for entry in self.ctx.slot(slot_id).commits.iter().flatten() {
                if collected == self.registry.m() {
                    break;
                }
                if entry.message.view_number != message.view_number {
                    continue;
                }
                let MessageBody::Commit(commit) = &entry.message.body else {
                    continue;
                };
                let Some(key) = self.registry.key(entry.message.validator_index) else {
                    continue;
                };
                if !crypto::verify_signature(&sign_data, &commit.signature, key) {
                    continue;
                }
                invocation.push(0x0c);
                invocation.push(SIGNATURE_SIZE as u8);
                invocation.extend_from_slice(&commit.signature);
                collected += 1;
            }
            if collected < self.registry.m() {
                continue;
            }

            let Some(transactions) = self.collect_transactions(slot_id, &request.transaction_hashes)
            else {
                debug!(
                    view = message.view_number,
                    "quorum of parked commits but transactions unavailable"
                );
                continue;
            };
            let Ok(verification) =
                crypto::multi_sig_redeem_script(self.registry.m(), self.registry.keys())
            else {
                continue;
            };

            let mut header = header;
            header.witness = Witness::new(invocation, verification);
            let block = Block {
                header,
                transactions,
            };

            warn!(
                height = block.index(),
                view = message.view_number,
                slot = %slot_id,
                hash = %block.hash(),
                "assembled block from parked past-view commits"
            );
            self.ctx.block_received_index = Some(block.index());
            self.ctx.block_received_time_ms = Some(self.clock.now_ms());
            self.ctx.block_sent = true;
            let _ = self.output.send(ConsensusOutput::RelayBlock(block));
            return;
        }
    }

    /// Gathers the full transactions for a proposal, preferring ones the
    /// slot already holds and falling back to the mempool.
    fn collect_transactions(
        &self,
        slot_id: SlotId,
        hashes: &[UInt256],
    ) -> Option<Vec<basalt_core::Transaction>> {
        hashes
            .iter()
            .map(|hash| {
                self.ctx
                    .slot(slot_id)
                    .transactions
                    .get(hash)
                    .cloned()
                    .or_else(|| self.mempool.try_get(hash))
            })
            .collect()
    }
}
