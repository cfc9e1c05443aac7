//! End-to-end rounds over a four-validator network (`F = 1`, `M = 3`),
//! driven synchronously through the actor mailboxes.

mod common;

use basalt_consensus::{
    ChangeViewReason, ConsensusEvent, ConsensusMessage, ConsensusOutput, ContextStore, MessageBody,
    PrepareRequest, RecoveryMessage, SlotId,
};
use basalt_core::UInt256;
use basalt_io::SerializableExt;
use common::*;
use std::sync::Arc;

/// Happy path on the priority slot: node 0 proposes, responses reach
/// `F + 1`, pre-commits and commits reach `M`, and every node relays the
/// same block carrying the proposed transactions.
#[test]
fn happy_path_priority_primary() {
    let tx_a = transaction(1, 100);
    let tx_b = transaction(2, 100);
    let mempool = Arc::new(TestMempool::new(vec![tx_a.clone(), tx_b.clone()]));
    let mut net = TestNet::new(4, mempool);
    net.start_all();

    // Height 100, view 0: priority primary is (100 − 0) mod 4 = 0.
    assert!(net.nodes[0].service.context().is_priority_primary());

    net.nodes[0].service.handle_event(ConsensusEvent::Timer {
        height: 100,
        view_number: 0,
    });
    let blocks = net.pump();

    assert_eq!(blocks.len(), 4, "every node relays the block");
    let reference = &blocks[0].1;
    assert_eq!(reference.index(), 100);
    assert_eq!(reference.header.primary_index, 0);
    assert_eq!(
        reference
            .transactions
            .iter()
            .map(|tx| tx.hash())
            .collect::<Vec<_>>(),
        vec![tx_a.hash(), tx_b.hash()]
    );
    assert!(reference.check_merkle_root());
    for (_, block) in &blocks {
        assert_eq!(block.hash(), reference.hash(), "all nodes agree on the block");
    }
}

/// The priority primary stays silent; the fallback primary (node 3)
/// carries the round on slot 1 with the stricter `M` threshold, and the
/// block lands without any view change.
#[test]
fn fallback_primary_carries_the_round() {
    let tx_c = transaction(3, 100);
    let mempool = Arc::new(TestMempool::new(vec![tx_c.clone()]));
    let mut net = TestNet::new(4, mempool);
    net.start_all();

    // Fallback primary is (100 − 0 − 1) mod 4 = 3.
    assert!(net.nodes[3].service.context().is_fallback_primary());

    net.nodes[3].service.handle_event(ConsensusEvent::Timer {
        height: 100,
        view_number: 0,
    });
    let blocks = net.pump();

    assert!(!blocks.is_empty(), "fallback slot completes the round");
    for (_, block) in &blocks {
        assert_eq!(block.index(), 100);
        assert_eq!(block.header.primary_index, 3);
        assert_eq!(
            block.transactions.iter().map(|tx| tx.hash()).collect::<Vec<_>>(),
            vec![tx_c.hash()]
        );
    }
    for node in &net.nodes {
        assert_eq!(node.service.context().view_number, 0, "no view change");
    }
}

/// A proposal whose combined system fee exceeds the block cap is
/// rejected by `BlockRejectedByPolicy` change views, and once `M` change
/// views accumulate every node moves to view 1.
#[test]
fn policy_rejection_triggers_view_change() {
    // Two transactions, each individually fine, jointly over the cap.
    let max_fee = settings().max_block_system_fee;
    let tx_1 = transaction(1, max_fee / 2 + 1);
    let tx_2 = transaction(2, max_fee / 2 + 1);
    let mempool = Arc::new(TestMempool::new(vec![tx_1.clone(), tx_2.clone()]));
    let mut net = TestNet::new(4, mempool);
    net.start_all();

    // A buggy primary would not produce this; craft it by hand.
    let malicious = sign_message(
        0,
        100,
        0,
        MessageBody::PrepareRequest(PrepareRequest {
            slot: SlotId::Priority,
            version: 0,
            prev_hash: prev_header().hash(),
            timestamp: START_TIME + 1,
            nonce: 7,
            transaction_hashes: vec![tx_1.hash(), tx_2.hash()],
        }),
    );
    net.deliver_others(&malicious, 0);

    // Backups 1 and 2 object with BlockRejectedByPolicy; node 3 is the
    // fallback primary and does not respond on the priority slot, so the
    // third change view arrives from its timeout path.
    let mut rejection_reasons = Vec::new();
    for i in [1usize, 2] {
        for effect in net.nodes[i].drain() {
            if let ConsensusOutput::Broadcast(payload) = effect {
                if let MessageBody::ChangeView(cv) = decode(&payload).body {
                    rejection_reasons.push(cv.reason);
                }
                net.deliver_others(&payload, i);
            }
        }
    }
    assert_eq!(
        rejection_reasons,
        vec![
            ChangeViewReason::BlockRejectedByPolicy,
            ChangeViewReason::BlockRejectedByPolicy
        ]
    );

    // Two timer fires walk node 3 from resend-grace into a timeout change
    // view, completing the quorum for view 1.
    for _ in 0..2 {
        net.nodes[3].service.handle_event(ConsensusEvent::Timer {
            height: 100,
            view_number: 0,
        });
    }
    let blocks = net.pump();

    for (i, node) in net.nodes.iter().enumerate() {
        assert_eq!(node.service.context().view_number, 1, "node {i} at view 1");
    }
    // Any block that forms afterwards belongs to view 1 (priority primary
    // (100 − 1) mod 4 = 3), never to the rejected view-0 proposal.
    for (_, block) in &blocks {
        assert_eq!(block.header.primary_index, 3);
        assert!(block.header.nonce != 7, "rejected proposal never lands");
    }
}

/// A second, conflicting commit from the same validator is discarded
/// and does not inflate the commit count.
#[test]
fn equivocating_commit_rejected() {
    let mempool = Arc::new(TestMempool::new(vec![]));
    let mut net = TestNet::new(4, mempool);
    net.start_all();

    // Drive node 1 to a finalized priority header: deliver the proposal.
    let proposal = sign_message(
        0,
        100,
        0,
        MessageBody::PrepareRequest(PrepareRequest {
            slot: SlotId::Priority,
            version: 0,
            prev_hash: prev_header().hash(),
            timestamp: START_TIME + 1,
            nonce: 9,
            transaction_hashes: Vec::new(),
        }),
    );
    net.nodes[1]
        .service
        .handle_event(ConsensusEvent::Payload(proposal));
    net.nodes[1].drain();

    let sign_data = net.nodes[1]
        .service
        .context()
        .slot(SlotId::Priority)
        .header
        .sign_data(settings().network);

    // First commit from validator 2: valid signature.
    let commit_1 = sign_message(
        2,
        100,
        0,
        MessageBody::Commit(basalt_consensus::Commit {
            slot: SlotId::Priority,
            signature: keypair(2).sign(&sign_data),
        }),
    );
    net.nodes[1]
        .service
        .handle_event(ConsensusEvent::Payload(commit_1.clone()));
    assert_eq!(
        net.nodes[1]
            .service
            .context()
            .slot(SlotId::Priority)
            .commit_count_for_view(0),
        1
    );

    // Second commit from validator 2 with a different signature.
    let mut forged = keypair(2).sign(&sign_data);
    forged[0] ^= 0xff;
    let commit_2 = sign_message(
        2,
        100,
        0,
        MessageBody::Commit(basalt_consensus::Commit {
            slot: SlotId::Priority,
            signature: forged,
        }),
    );
    net.nodes[1]
        .service
        .handle_event(ConsensusEvent::Payload(commit_2));

    let slot = net.nodes[1].service.context().slot(SlotId::Priority);
    assert_eq!(slot.commit_count_for_view(0), 1, "count not inflated");
    let kept = slot.commits[2].as_ref().unwrap();
    assert_eq!(
        kept.envelope.hash(),
        commit_1.hash(),
        "the first commit is the one kept"
    );
}

/// A validator that crashes after persisting but before broadcasting
/// its commit re-emits the byte-identical commit envelope on restart.
#[test]
fn restart_reissues_the_same_commit() {
    let mempool: Arc<TestMempool> = Arc::new(TestMempool::new(vec![]));
    let mut net = TestNet::new(4, mempool.clone());
    net.start_all();

    net.nodes[0].service.handle_event(ConsensusEvent::Timer {
        height: 100,
        view_number: 0,
    });
    let _ = net.pump();

    // Capture node 1's signed commit from its snapshot.
    let snapshot = net.nodes[1].store.load().unwrap().expect("state persisted");
    assert_eq!(snapshot.height, 100);
    let persisted_commits: Vec<_> = snapshot
        .payloads
        .iter()
        .filter(|p| {
            matches!(
                ConsensusMessage::from_array(&p.data).unwrap().body,
                MessageBody::Commit(_)
            )
        })
        .cloned()
        .collect();
    assert_eq!(persisted_commits.len(), 1);

    // "Crash" node 1 and rebuild it over the same store.
    let keys = validator_keys(4);
    let (mut service, mut outputs) = build_node(
        1,
        &keys,
        net.clock.clone(),
        Arc::new(TestLedger::new()),
        mempool,
        net.nodes[1].store.clone(),
    );
    service.handle_event(ConsensusEvent::SystemReady);

    let mut reissued_commits = Vec::new();
    while let Ok(effect) = outputs.try_recv() {
        if let ConsensusOutput::Broadcast(payload) = effect {
            if matches!(decode(&payload).body, MessageBody::Commit(_)) {
                reissued_commits.push(payload);
            }
        }
    }
    assert_eq!(reissued_commits.len(), 1, "exactly one commit re-emitted");
    assert_eq!(
        reissued_commits[0].to_array(),
        persisted_commits[0].to_array(),
        "byte-identical commit envelope"
    );
    assert!(service.context().commit_sent, "restart stays locked");
}

/// Commits parked after a view change become countable once a
/// recovery message supplies the matching lower-view proposal, producing
/// the view-0 block even though the node has moved on to view 1.
#[test]
fn parked_lower_view_commits_complete_a_block() {
    let mempool = Arc::new(TestMempool::new(vec![]));
    let mut net = TestNet::new(4, mempool);
    net.start_all();

    // The view-0 proposal node 1 never saw.
    let proposal = sign_message(
        0,
        100,
        0,
        MessageBody::PrepareRequest(PrepareRequest {
            slot: SlotId::Priority,
            version: 0,
            prev_hash: prev_header().hash(),
            timestamp: START_TIME + 1,
            nonce: 11,
            transaction_hashes: Vec::new(),
        }),
    );
    let header_sign_data = {
        // An independent node that did see the proposal tells us the
        // sign-data every committer used.
        net.nodes[2]
            .service
            .handle_event(ConsensusEvent::Payload(proposal.clone()));
        net.nodes[2].drain();
        net.nodes[2]
            .service
            .context()
            .slot(SlotId::Priority)
            .header
            .sign_data(settings().network)
    };

    // Move node 1 to view 1 with M change views from validators 0, 2, 3.
    for i in [0usize, 2, 3] {
        let cv = sign_message(
            i,
            100,
            0,
            MessageBody::ChangeView(basalt_consensus::ChangeView {
                timestamp: START_TIME,
                new_view_number: 1,
                reason: ChangeViewReason::Timeout,
            }),
        );
        net.nodes[1].service.handle_event(ConsensusEvent::Payload(cv));
    }
    net.nodes[1].drain();
    assert_eq!(net.nodes[1].service.context().view_number, 1);

    // View-0 commits arrive late; node 1 parks them.
    let mut commits = Vec::new();
    for i in [0usize, 2, 3] {
        let commit = sign_message(
            i,
            100,
            0,
            MessageBody::Commit(basalt_consensus::Commit {
                slot: SlotId::Priority,
                signature: keypair(i).sign(&header_sign_data),
            }),
        );
        net.nodes[1]
            .service
            .handle_event(ConsensusEvent::Payload(commit.clone()));
        commits.push(commit);
    }
    assert!(
        !net.nodes[1].service.context().block_sent,
        "parked commits alone do not finish a block"
    );

    // A recovery message carries the matching view-0 proposal.
    let recovery = sign_message(
        2,
        100,
        0,
        MessageBody::RecoveryMessage(RecoveryMessage {
            change_views: Vec::new(),
            prepare_requests: vec![proposal],
            preparations: Vec::new(),
            pre_commits: Vec::new(),
            commits,
        }),
    );
    net.nodes[1]
        .service
        .handle_event(ConsensusEvent::Payload(recovery));

    let blocks: Vec<_> = net.nodes[1]
        .drain()
        .into_iter()
        .filter_map(|effect| match effect {
            ConsensusOutput::RelayBlock(block) => Some(block),
            _ => None,
        })
        .collect();
    assert_eq!(blocks.len(), 1, "the view-0 block is assembled");
    assert_eq!(blocks[0].index(), 100);
    assert_eq!(blocks[0].header.primary_index, 0);
    assert!(blocks[0].transactions.is_empty());
    assert!(net.nodes[1].service.context().block_sent);
}

/// Late commits for the current view verify against the finalized header
/// and count toward the block (regression guard for the parking rules).
#[test]
fn parked_precommit_accepted_before_request() {
    let mempool = Arc::new(TestMempool::new(vec![]));
    let mut net = TestNet::new(4, mempool);
    net.start_all();

    // A pre-commit arrives before any proposal: accepted, not counted yet.
    let pre_commit = sign_message(
        2,
        100,
        0,
        MessageBody::PreCommit(basalt_consensus::PreCommit {
            slot: SlotId::Priority,
            preparation_hash: UInt256::from([7; 32]),
        }),
    );
    net.nodes[1]
        .service
        .handle_event(ConsensusEvent::Payload(pre_commit));
    assert_eq!(
        net.nodes[1]
            .service
            .context()
            .slot(SlotId::Priority)
            .pre_commit_count(),
        1
    );
}

/// A proposal hash missing from the verified pool is pulled from the
/// unverified pool and verified before admission.
#[test]
fn proposal_pulls_unverified_transactions() {
    let tx = transaction(9, 50);
    let mempool = Arc::new(TestMempool::with_unverified(vec![], vec![tx.clone()]));
    let mut net = TestNet::new(4, mempool);
    net.start_all();

    let proposal = sign_message(
        0,
        100,
        0,
        MessageBody::PrepareRequest(PrepareRequest {
            slot: SlotId::Priority,
            version: 0,
            prev_hash: prev_header().hash(),
            timestamp: START_TIME + 1,
            nonce: 31,
            transaction_hashes: vec![tx.hash()],
        }),
    );
    net.nodes[1]
        .service
        .handle_event(ConsensusEvent::Payload(proposal));

    let slot = net.nodes[1].service.context().slot(SlotId::Priority);
    assert!(slot.transactions_complete());
    let responded = net.nodes[1].drain().iter().any(|effect| {
        matches!(effect, ConsensusOutput::Broadcast(p)
            if matches!(decode(p).body, MessageBody::PrepareResponse(_)))
    });
    assert!(responded, "proposal completed from the unverified pool");
}

/// A proposal naming an already-persisted transaction is refused outright.
#[test]
fn on_chain_transaction_rejects_proposal() {
    let tx = transaction(10, 50);
    let ledger = Arc::new(TestLedger::with_on_chain([tx.hash()]));
    let mempool = Arc::new(TestMempool::new(vec![tx.clone()]));
    let mut net = TestNet::with_ledger(4, ledger, mempool);
    net.start_all();

    let proposal = sign_message(
        0,
        100,
        0,
        MessageBody::PrepareRequest(PrepareRequest {
            slot: SlotId::Priority,
            version: 0,
            prev_hash: prev_header().hash(),
            timestamp: START_TIME + 1,
            nonce: 32,
            transaction_hashes: vec![tx.hash()],
        }),
    );
    net.nodes[1]
        .service
        .handle_event(ConsensusEvent::Payload(proposal));

    assert!(
        !net.nodes[1].service.context().request_sent_or_received,
        "double-spend proposal is not accepted"
    );
    assert!(
        net.nodes[1].drain().is_empty(),
        "no response to a double-spend proposal"
    );
}

/// The actor loop end to end: events flow through the mailbox and effects
/// come out on the output channel.
#[tokio::test]
async fn actor_loop_processes_mailbox_events() {
    let mempool = Arc::new(TestMempool::new(vec![]));
    let clock = Arc::new(basalt_consensus::ManualClock::new(START_TIME));
    let keys = validator_keys(4);
    let store = Arc::new(basalt_consensus::MemoryContextStore::new());
    let (service, mut outputs) = build_node(
        1,
        &keys,
        clock,
        Arc::new(TestLedger::new()),
        mempool,
        store,
    );

    let (mailbox_tx, mailbox_rx) = tokio::sync::mpsc::unbounded_channel();
    let actor = tokio::spawn(service.run(mailbox_rx));

    mailbox_tx.send(ConsensusEvent::SystemReady).unwrap();
    let proposal = sign_message(
        0,
        100,
        0,
        MessageBody::PrepareRequest(PrepareRequest {
            slot: SlotId::Priority,
            version: 0,
            prev_hash: prev_header().hash(),
            timestamp: START_TIME + 1,
            nonce: 51,
            transaction_hashes: Vec::new(),
        }),
    );
    mailbox_tx
        .send(ConsensusEvent::Payload(proposal))
        .unwrap();

    let effect = tokio::time::timeout(std::time::Duration::from_secs(5), outputs.recv())
        .await
        .expect("actor produced an effect in time")
        .expect("output channel open");
    assert!(matches!(effect, ConsensusOutput::Broadcast(_)));

    // Closing the mailbox shuts the actor down.
    drop(mailbox_tx);
    actor.await.unwrap();
}
