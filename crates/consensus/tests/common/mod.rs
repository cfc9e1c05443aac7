//! Shared fixtures: a deterministic four-validator network harness driving
//! consensus services synchronously through their mailboxes.

#![allow(dead_code)]

use basalt_config::ProtocolSettings;
use basalt_consensus::{
    ConsensusEvent, ConsensusMessage, ConsensusOutput, ConsensusPayload, ConsensusService,
    LedgerView, ManualClock, MemoryContextStore, MempoolView, MessageBody, ValidatorRegistry,
};
use basalt_core::crypto::PublicKey;
use basalt_core::{Block, BlockHeader, KeyPair, Transaction, UInt160, UInt256, Witness};
use basalt_io::SerializableExt;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;

/// The harness builds the round at height 100 on top of this header.
pub const PREV_HEIGHT: u32 = 99;
pub const PREV_TIMESTAMP: u64 = 1_700_000_000_000;
pub const START_TIME: u64 = PREV_TIMESTAMP + 1_000;

pub fn settings() -> ProtocolSettings {
    ProtocolSettings::default()
}

/// Deterministic validator key material; seed `i + 1` for validator `i`.
pub fn keypair(index: usize) -> KeyPair {
    let mut secret = [0u8; 32];
    secret[31] = (index + 1) as u8;
    KeyPair::from_secret_bytes(&secret).expect("valid test secret")
}

pub fn validator_keys(count: usize) -> Vec<PublicKey> {
    (0..count).map(|i| keypair(i).public_key()).collect()
}

pub fn prev_header() -> BlockHeader {
    BlockHeader {
        version: 0,
        prev_hash: UInt256::from([0xfe; 32]),
        merkle_root: UInt256::zero(),
        timestamp: PREV_TIMESTAMP,
        nonce: 1,
        index: PREV_HEIGHT,
        primary_index: 0,
        next_consensus: UInt160::zero(),
        witness: Witness::empty(),
    }
}

pub struct TestLedger {
    header: BlockHeader,
    on_chain: HashSet<UInt256>,
}

impl TestLedger {
    pub fn new() -> Self {
        Self {
            header: prev_header(),
            on_chain: HashSet::new(),
        }
    }

    pub fn with_on_chain(hashes: impl IntoIterator<Item = UInt256>) -> Self {
        Self {
            header: prev_header(),
            on_chain: hashes.into_iter().collect(),
        }
    }
}

impl LedgerView for TestLedger {
    fn height(&self) -> u32 {
        self.header.index
    }

    fn current_header(&self) -> BlockHeader {
        self.header.clone()
    }

    fn contains_transaction(&self, hash: &UInt256) -> bool {
        self.on_chain.contains(hash)
    }
}

#[derive(Default)]
pub struct TestMempool {
    verified: Vec<Transaction>,
    unverified: Vec<Transaction>,
}

impl TestMempool {
    pub fn new(verified: Vec<Transaction>) -> Self {
        Self {
            verified,
            unverified: Vec::new(),
        }
    }

    pub fn with_unverified(verified: Vec<Transaction>, unverified: Vec<Transaction>) -> Self {
        Self {
            verified,
            unverified,
        }
    }
}

impl MempoolView for TestMempool {
    fn verified_transactions(&self) -> Vec<Transaction> {
        self.verified.clone()
    }

    fn try_get(&self, hash: &UInt256) -> Option<Transaction> {
        self.verified
            .iter()
            .chain(self.unverified.iter())
            .find(|tx| tx.hash() == *hash)
            .cloned()
    }
}

pub fn transaction(nonce: u32, system_fee: i64) -> Transaction {
    Transaction {
        version: 0,
        nonce,
        sender: UInt160::from([0x11; 20]),
        system_fee,
        network_fee: 10,
        valid_until_block: 1_000,
        script: vec![0x51],
        witnesses: Vec::new(),
    }
}

pub struct TestNode {
    pub service: ConsensusService,
    pub outputs: mpsc::UnboundedReceiver<ConsensusOutput>,
    pub store: Arc<MemoryContextStore>,
}

impl TestNode {
    /// Drains every pending output effect.
    pub fn drain(&mut self) -> Vec<ConsensusOutput> {
        let mut effects = Vec::new();
        while let Ok(effect) = self.outputs.try_recv() {
            effects.push(effect);
        }
        effects
    }
}

pub struct TestNet {
    pub nodes: Vec<TestNode>,
    pub clock: Arc<ManualClock>,
}

impl TestNet {
    /// Builds `count` validator nodes sharing one manual clock, each backed
    /// by its own in-memory snapshot store.
    pub fn new(count: usize, mempool: Arc<dyn MempoolView>) -> Self {
        Self::with_ledger(count, Arc::new(TestLedger::new()), mempool)
    }

    pub fn with_ledger(
        count: usize,
        ledger: Arc<dyn LedgerView>,
        mempool: Arc<dyn MempoolView>,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(START_TIME));
        let keys = validator_keys(count);
        let nodes = (0..count)
            .map(|i| {
                let store = Arc::new(MemoryContextStore::new());
                let (service, outputs) = build_node(
                    i,
                    &keys,
                    clock.clone(),
                    ledger.clone(),
                    mempool.clone(),
                    store.clone(),
                );
                TestNode {
                    service,
                    outputs,
                    store,
                }
            })
            .collect();
        Self { nodes, clock }
    }

    /// Sends `SystemReady` to every node.
    pub fn start_all(&mut self) {
        for node in &mut self.nodes {
            node.service.handle_event(ConsensusEvent::SystemReady);
        }
    }

    /// Delivers an envelope to every node except `except`.
    pub fn deliver_others(&mut self, payload: &ConsensusPayload, except: usize) {
        for (i, node) in self.nodes.iter_mut().enumerate() {
            if i != except {
                node.service
                    .handle_event(ConsensusEvent::Payload(payload.clone()));
            }
        }
    }

    /// Repeatedly drains broadcasts and re-delivers them to the other nodes
    /// until the network goes quiet. Returns every relayed block, tagged
    /// with the relaying node.
    pub fn pump(&mut self) -> Vec<(usize, Block)> {
        let mut blocks = Vec::new();
        loop {
            let mut traffic = Vec::new();
            for (i, node) in self.nodes.iter_mut().enumerate() {
                for effect in node.drain() {
                    match effect {
                        ConsensusOutput::Broadcast(payload) => traffic.push((i, payload)),
                        ConsensusOutput::RelayBlock(block) => blocks.push((i, block)),
                        ConsensusOutput::RestartTasks(_) => {}
                    }
                }
            }
            if traffic.is_empty() {
                return blocks;
            }
            for (from, payload) in traffic {
                self.deliver_others(&payload, from);
            }
        }
    }
}

/// Builds one validator node over the shared fixtures.
pub fn build_node(
    index: usize,
    keys: &[PublicKey],
    clock: Arc<ManualClock>,
    ledger: Arc<dyn LedgerView>,
    mempool: Arc<dyn MempoolView>,
    store: Arc<MemoryContextStore>,
) -> (
    ConsensusService,
    mpsc::UnboundedReceiver<ConsensusOutput>,
) {
    let registry = Arc::new(
        ValidatorRegistry::new(keys.to_vec(), Some(&keys[index])).expect("valid registry"),
    );
    let (tx, rx) = mpsc::unbounded_channel();
    let service = ConsensusService::new(
        settings(),
        registry,
        Some(keypair(index)),
        clock,
        ledger,
        mempool,
        store,
        tx,
    )
    .expect("service construction");
    (service, rx)
}

/// Signs a consensus message exactly the way validator `index` would,
/// returning the broadcast-ready envelope. Used to hand-craft traffic a
/// correct node would never produce.
pub fn sign_message(
    index: usize,
    height: u32,
    view_number: u8,
    body: MessageBody,
) -> ConsensusPayload {
    let pair = keypair(index);
    let message = ConsensusMessage {
        block_index: height,
        validator_index: index as u8,
        view_number,
        body,
    };
    let mut payload = ConsensusPayload::new(
        settings().network,
        height,
        pair.public_key().script_hash(),
        message.to_array(),
    );
    payload.sign(&pair);
    payload
}

/// Extracts the decoded message from a broadcast effect.
pub fn decode(payload: &ConsensusPayload) -> ConsensusMessage {
    ConsensusMessage::from_array(&payload.data).expect("decodable payload")
}
