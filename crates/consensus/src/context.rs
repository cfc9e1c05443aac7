//! Per-round consensus state: the dual proposal slots, payload tables, and
//! the flags that gate phase transitions.

use crate::messages::{ChangeView, ConsensusMessage, MessageBody, SlotId};
use crate::payload::ConsensusPayload;
use crate::validators::ValidatorRegistry;
use basalt_config::ProtocolSettings;
use basalt_core::crypto::PublicKey;
use basalt_core::{BlockHeader, Transaction, UInt256, Witness};
use basalt_io::Serializable;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A signed envelope kept together with its decoded message, so handlers
/// never re-parse table entries.
#[derive(Debug, Clone)]
pub struct StoredPayload {
    pub envelope: ConsensusPayload,
    pub message: ConsensusMessage,
}

impl StoredPayload {
    pub fn new(envelope: ConsensusPayload, message: ConsensusMessage) -> Self {
        Self { envelope, message }
    }

    /// The decoded change-view body, if this is one.
    pub fn change_view(&self) -> Option<&ChangeView> {
        match &self.message.body {
            MessageBody::ChangeView(cv) => Some(cv),
            _ => None,
        }
    }
}

/// Policy accumulator for a proposal's transactions.
///
/// Two duties: per-transaction policy screening for incoming proposals
/// (`check_transaction`), and cumulative cap enforcement when a primary
/// selects its own proposal (`try_add`). Aggregate caps for incoming
/// proposals are judged once the set is complete, so a violation surfaces
/// as a block-level rejection rather than blaming one transaction.
#[derive(Debug, Clone)]
pub struct VerificationContext {
    total_system_fee: i64,
    total_size: usize,
    max_system_fee: i64,
    max_size: usize,
}

impl VerificationContext {
    pub fn new(settings: &ProtocolSettings) -> Self {
        Self {
            total_system_fee: 0,
            total_size: 0,
            max_system_fee: settings.max_block_system_fee,
            max_size: settings.max_block_size,
        }
    }

    /// Per-transaction policy: a single transaction may not exceed the
    /// whole-block caps on its own.
    pub fn check_transaction(&self, transaction: &Transaction) -> bool {
        transaction.system_fee <= self.max_system_fee && transaction.size() <= self.max_size
    }

    /// Admits the transaction into the accumulator, or rejects it when the
    /// running totals would exceed the block caps. Used by primaries while
    /// selecting a proposal.
    pub fn try_add(&mut self, transaction: &Transaction) -> bool {
        let fee = self.total_system_fee.saturating_add(transaction.system_fee);
        let size = self.total_size + transaction.size();
        if fee > self.max_system_fee || size > self.max_size {
            return false;
        }
        self.total_system_fee = fee;
        self.total_size = size;
        true
    }

    /// Accumulates without enforcement, for tracking an incoming proposal.
    pub fn add(&mut self, transaction: &Transaction) {
        self.total_system_fee = self.total_system_fee.saturating_add(transaction.system_fee);
        self.total_size += transaction.size();
    }

    /// Cumulative system fee admitted so far.
    pub fn total_system_fee(&self) -> i64 {
        self.total_system_fee
    }

    /// Cumulative serialized size admitted so far.
    pub fn total_size(&self) -> usize {
        self.total_size
    }
}

/// One of the two parallel proposal tracks of a view.
///
/// Each slot is self-contained: its own header skeleton, proposed
/// transaction list, and per-validator payload tables.
#[derive(Debug, Clone)]
pub struct ProposalSlot {
    /// The block header under construction for this track. Timestamp,
    /// nonce, and merkle root are installed when the proposal is accepted.
    pub header: BlockHeader,
    /// Ordered transaction identifiers proposed by this track's primary.
    pub transaction_hashes: Vec<UInt256>,
    /// Transactions received so far, keyed by hash.
    pub transactions: HashMap<UInt256, Transaction>,
    /// Aggregate-policy accumulator for the incoming proposal.
    pub verification: VerificationContext,
    /// Prepare request/response envelopes, one entry per validator index.
    pub preparations: Vec<Option<StoredPayload>>,
    /// Pre-commit envelopes, one entry per validator index.
    pub pre_commits: Vec<Option<StoredPayload>>,
    /// Commit envelopes, one entry per validator index.
    pub commits: Vec<Option<StoredPayload>>,
    /// Whether the header's timestamp, nonce, and merkle root are final,
    /// making commit sign-data computable.
    pub header_finalized: bool,
}

impl ProposalSlot {
    fn new(validator_count: usize, header: BlockHeader, settings: &ProtocolSettings) -> Self {
        Self {
            header,
            transaction_hashes: Vec::new(),
            transactions: HashMap::new(),
            verification: VerificationContext::new(settings),
            preparations: vec![None; validator_count],
            pre_commits: vec![None; validator_count],
            commits: vec![None; validator_count],
            header_finalized: false,
        }
    }

    /// The validator index proposing on this track.
    pub fn primary_index(&self) -> u8 {
        self.header.primary_index
    }

    /// The accepted prepare request envelope, if any.
    pub fn prepare_request(&self) -> Option<&StoredPayload> {
        let entry = self.preparations.get(self.primary_index() as usize)?;
        let stored = entry.as_ref()?;
        matches!(stored.message.body, MessageBody::PrepareRequest(_)).then_some(stored)
    }

    /// Whether every proposed transaction has been received.
    pub fn transactions_complete(&self) -> bool {
        self.transaction_hashes
            .iter()
            .all(|hash| self.transactions.contains_key(hash))
    }

    /// Transaction hashes still missing from the proposal.
    pub fn missing_transactions(&self) -> Vec<UInt256> {
        self.transaction_hashes
            .iter()
            .filter(|hash| !self.transactions.contains_key(hash))
            .copied()
            .collect()
    }

    /// Number of non-empty preparation entries (request plus responses).
    pub fn preparation_count(&self) -> usize {
        self.preparations.iter().flatten().count()
    }

    /// Number of non-empty pre-commit entries.
    pub fn pre_commit_count(&self) -> usize {
        self.pre_commits.iter().flatten().count()
    }

    /// Number of commit entries belonging to the given view.
    pub fn commit_count_for_view(&self, view_number: u8) -> usize {
        self.commits
            .iter()
            .flatten()
            .filter(|stored| stored.message.view_number == view_number)
            .count()
    }

    /// Estimated serialized size of the block this slot would produce.
    pub fn estimated_block_size(&self) -> usize {
        self.header.size()
            + basalt_io::helper::get_var_size(self.transaction_hashes.len() as u64)
            + self.transactions.values().map(Serializable::size).sum::<usize>()
    }

    /// Sum of system fees across received transactions.
    pub fn total_system_fee(&self) -> i64 {
        self.transactions
            .values()
            .fold(0i64, |acc, tx| acc.saturating_add(tx.system_fee))
    }
}

/// The state of one `(height, view)` consensus attempt.
///
/// Created by round initialization, mutated only by the consensus actor,
/// and replaced when the next height begins.
#[derive(Debug, Clone)]
pub struct RoundContext {
    registry: Arc<ValidatorRegistry>,
    settings: ProtocolSettings,

    /// The block index under construction.
    pub height: u32,
    /// The current consensus attempt at this height.
    pub view_number: u8,
    /// Hash of the last persisted block.
    pub prev_hash: UInt256,
    /// Timestamp of the last persisted block, epoch milliseconds.
    pub prev_timestamp: u64,

    /// The two proposal tracks, indexed by [`SlotId`].
    pub slots: [ProposalSlot; 2],
    /// Change-view envelopes, one entry per validator index.
    pub change_views: Vec<Option<StoredPayload>>,
    /// Highest block index each validator has been heard at.
    pub last_seen_message: HashMap<PublicKey, u32>,
    /// Recovery-request envelope hashes already answered this round.
    pub known_hashes: HashSet<UInt256>,

    /// A prepare request has been sent or accepted this view.
    pub request_sent_or_received: bool,
    /// The local node has signed a commit this height.
    pub commit_sent: bool,
    /// A block has been relayed; all further handlers are inert.
    pub block_sent: bool,
    /// A recovery message is being applied.
    pub is_recovering: bool,

    /// Height of the block relayed by this round, once one exists.
    pub block_received_index: Option<u32>,
    /// Clock reading when the block was relayed.
    pub block_received_time_ms: Option<u64>,

    /// The most advanced envelope this node has broadcast this view,
    /// re-sent on timeout when progress has been made.
    pub last_sent: Option<ConsensusPayload>,
    /// Something new happened since the previous timeout fired.
    pub progress_since_timeout: bool,
}

impl RoundContext {
    /// Creates the context for a fresh height at view zero.
    pub fn new(
        registry: Arc<ValidatorRegistry>,
        settings: ProtocolSettings,
        height: u32,
        prev_hash: UInt256,
        prev_timestamp: u64,
    ) -> Self {
        let n = registry.len();
        let slots = [
            Self::make_slot(&registry, &settings, height, prev_hash, SlotId::Priority, 0),
            Self::make_slot(&registry, &settings, height, prev_hash, SlotId::Fallback, 0),
        ];
        let mut last_seen_message = HashMap::with_capacity(n);
        for key in registry.keys() {
            last_seen_message.insert(*key, height.saturating_sub(1));
        }
        Self {
            registry,
            settings,
            height,
            view_number: 0,
            prev_hash,
            prev_timestamp,
            slots,
            change_views: vec![None; n],
            last_seen_message,
            known_hashes: HashSet::new(),
            request_sent_or_received: false,
            commit_sent: false,
            block_sent: false,
            is_recovering: false,
            block_received_index: None,
            block_received_time_ms: None,
            last_sent: None,
            progress_since_timeout: false,
        }
    }

    fn make_slot(
        registry: &ValidatorRegistry,
        settings: &ProtocolSettings,
        height: u32,
        prev_hash: UInt256,
        slot: SlotId,
        view_number: u8,
    ) -> ProposalSlot {
        let primary_index = match slot {
            SlotId::Priority => registry.priority_primary(height, view_number),
            SlotId::Fallback => registry.fallback_primary(height, view_number),
        };
        let header = BlockHeader {
            version: 0,
            prev_hash,
            merkle_root: UInt256::zero(),
            timestamp: 0,
            nonce: 0,
            index: height,
            primary_index,
            next_consensus: registry.next_consensus(),
            witness: Witness::empty(),
        };
        ProposalSlot::new(registry.len(), header, settings)
    }

    /// Moves the round to a later view at the same height.
    ///
    /// Commit tables persist so parked lower-view commits can still
    /// contribute once matched against header sign-data; preparation and
    /// pre-commit tables are scrubbed, as are change views that the new
    /// view supersedes.
    pub fn reset(&mut self, view_number: u8) {
        debug_assert!(view_number > self.view_number);
        self.view_number = view_number;

        for slot_id in SlotId::ALL {
            let commits = std::mem::take(&mut self.slots[slot_id.index()].commits);
            let mut slot = Self::make_slot(
                &self.registry,
                &self.settings,
                self.height,
                self.prev_hash,
                slot_id,
                view_number,
            );
            slot.commits = commits;
            self.slots[slot_id.index()] = slot;
        }

        for entry in self.change_views.iter_mut() {
            let stale = entry
                .as_ref()
                .and_then(StoredPayload::change_view)
                .map(|cv| cv.new_view_number < view_number)
                .unwrap_or(true);
            if stale {
                *entry = None;
            }
        }

        self.known_hashes.clear();
        self.request_sent_or_received = false;
        self.is_recovering = false;
        self.last_sent = None;
        self.progress_since_timeout = false;
        // commit_sent survives: a node that signed in an earlier view stays
        // locked for the rest of the height.
    }

    /// The validator registry for this height.
    pub fn registry(&self) -> &Arc<ValidatorRegistry> {
        &self.registry
    }

    /// The protocol settings.
    pub fn settings(&self) -> &ProtocolSettings {
        &self.settings
    }

    /// The local validator index, or `None` when watch-only.
    pub fn my_index(&self) -> Option<u8> {
        self.registry.my_index()
    }

    /// Whether the local node observes without a validator slot.
    pub fn watch_only(&self) -> bool {
        self.registry.watch_only()
    }

    /// Whether the local node is this view's priority primary.
    pub fn is_priority_primary(&self) -> bool {
        self.my_index() == Some(self.slots[SlotId::Priority.index()].primary_index())
    }

    /// Whether the local node is this view's fallback primary (and the
    /// fallback slot is live).
    pub fn is_fallback_primary(&self) -> bool {
        self.fallback_active()
            && self.my_index() == Some(self.slots[SlotId::Fallback.index()].primary_index())
    }

    /// Whether the local node is a primary of either slot.
    pub fn is_a_primary(&self) -> bool {
        self.is_priority_primary() || self.is_fallback_primary()
    }

    /// The fallback slot is inert when both primaries coincide.
    pub fn fallback_active(&self) -> bool {
        self.slots[SlotId::Priority.index()].primary_index()
            != self.slots[SlotId::Fallback.index()].primary_index()
    }

    /// The slot a validator proposes on, if it is a primary of this view.
    pub fn slot_of_proposer(&self, validator_index: u8) -> Option<SlotId> {
        if validator_index == self.slots[SlotId::Priority.index()].primary_index() {
            Some(SlotId::Priority)
        } else if self.fallback_active()
            && validator_index == self.slots[SlotId::Fallback.index()].primary_index()
        {
            Some(SlotId::Fallback)
        } else {
            None
        }
    }

    /// Immutable access to a slot.
    pub fn slot(&self, slot: SlotId) -> &ProposalSlot {
        &self.slots[slot.index()]
    }

    /// Mutable access to a slot.
    pub fn slot_mut(&mut self, slot: SlotId) -> &mut ProposalSlot {
        &mut self.slots[slot.index()]
    }

    /// The local node's recorded change view, if any.
    pub fn my_change_view(&self) -> Option<&StoredPayload> {
        let index = self.my_index()? as usize;
        self.change_views.get(index)?.as_ref()
    }

    /// True once the local node has asked to leave this view: payload
    /// acceptance stops until the view change resolves.
    pub fn not_accepting_payloads_due_to_view_changing(&self) -> bool {
        self.my_change_view()
            .and_then(StoredPayload::change_view)
            .map(|cv| cv.new_view_number > self.view_number)
            .unwrap_or(false)
    }

    /// Validators that have committed in the current view, on either slot.
    pub fn count_committed(&self) -> usize {
        (0..self.registry.len())
            .filter(|&i| {
                self.slots.iter().any(|slot| {
                    slot.commits[i]
                        .as_ref()
                        .map(|stored| stored.message.view_number == self.view_number)
                        .unwrap_or(false)
                })
            })
            .count()
    }

    /// Validators not heard from since before the previous block. The
    /// one-block grace keeps a quiet-but-live validator from counting as
    /// failed at the start of every round.
    pub fn count_failed(&self) -> usize {
        let cutoff = self.height.saturating_sub(1);
        self.registry
            .keys()
            .iter()
            .filter(|key| {
                self.last_seen_message
                    .get(*key)
                    .map(|seen| *seen < cutoff)
                    .unwrap_or(true)
            })
            .count()
    }

    /// When more than `F` validators have committed or gone silent, a view
    /// change can no longer gather `M` supporters.
    pub fn more_than_f_nodes_committed_or_lost(&self) -> bool {
        self.count_committed() + self.count_failed() > self.registry.f()
    }

    /// Records that a validator spoke at the given block index.
    pub fn record_seen(&mut self, key: PublicKey, block_index: u32) {
        let entry = self.last_seen_message.entry(key).or_insert(block_index);
        if *entry < block_index {
            *entry = block_index;
        }
    }

    /// Number of change-view entries asking for `view` or later.
    pub fn change_view_count_for(&self, view_number: u8) -> usize {
        self.change_views
            .iter()
            .flatten()
            .filter_map(StoredPayload::change_view)
            .filter(|cv| cv.new_view_number >= view_number)
            .count()
    }
}
