//! Property-based coverage of the consensus invariants: quorum arithmetic,
//! timer monotonicity, known-hash hygiene, single-commit durability, the
//! recovery fan-out bound, and the per-slot preparation thresholds.

mod common;

use basalt_consensus::{
    fault_tolerance, safety_quorum, ConsensusEvent, ConsensusMessage, ConsensusOutput,
    ContextStore, ManualClock, MessageBody, PrepareRequest, PrepareResponse, RecoveryRequest,
    RoundTimer, SlotId,
};
use basalt_core::UInt256;
use basalt_io::SerializableExt;
use common::*;
use proptest::prelude::*;
use std::sync::Arc;

proptest! {
    /// `F = (N − 1) / 3` and `M = N − F` keep the classic BFT bound
    /// `N ≥ 3F + 1` and give `M ≥ 2F + 1` for every supported set size.
    #[test]
    fn quorum_arithmetic_holds(n in 4usize..=255) {
        let f = fault_tolerance(n);
        let m = safety_quorum(n);
        prop_assert_eq!(m, n - f);
        prop_assert!(n >= 3 * f + 1);
        prop_assert!(m >= 2 * f + 1);
        prop_assert!(m + f <= n);
    }

    /// The round deadline never moves backwards under any interleaving of
    /// clock advances and extension factors.
    #[test]
    fn timer_extension_is_monotonic(
        ops in prop::collection::vec((0u64..5_000, 0u64..8), 1..40)
    ) {
        let clock = ManualClock::new(1_000_000);
        let mut timer = RoundTimer::new();
        timer.arm(&clock, 15_000, 3_750, 100, 0);

        let mut previous = timer.deadline_ms();
        for (advance, factor) in ops {
            clock.advance(advance);
            timer.extend_by_factor(&clock, factor);
            prop_assert!(timer.deadline_ms() >= previous);
            previous = timer.deadline_ms();
        }
    }

    /// Encode-then-decode is the identity for proposals with arbitrary
    /// contents.
    #[test]
    fn prepare_request_roundtrip(
        view in 0u8..=10,
        timestamp in 1u64..=u64::MAX / 2,
        nonce in any::<u64>(),
        hash_seeds in prop::collection::vec(any::<[u8; 32]>(), 0..16)
    ) {
        let message = ConsensusMessage {
            block_index: 100,
            validator_index: 0,
            view_number: view,
            body: MessageBody::PrepareRequest(PrepareRequest {
                slot: SlotId::Priority,
                version: 0,
                prev_hash: UInt256::from([9; 32]),
                timestamp,
                nonce,
                transaction_hashes: hash_seeds.into_iter().map(UInt256::from).collect(),
            }),
        };
        let decoded = ConsensusMessage::from_array(&message.to_array()).unwrap();
        prop_assert_eq!(decoded, message);
    }
}

/// Answered recovery-request hashes never leak across round
/// initializations.
#[test]
fn known_hashes_cleared_on_initialize() {
    let mempool = Arc::new(TestMempool::new(vec![]));
    let mut net = TestNet::new(4, mempool);
    net.start_all();

    let request = sign_message(
        0,
        100,
        0,
        MessageBody::RecoveryRequest(RecoveryRequest {
            timestamp: START_TIME,
        }),
    );
    net.nodes[1]
        .service
        .handle_event(ConsensusEvent::Payload(request.clone()));
    assert!(!net.nodes[1].service.context().known_hashes.is_empty());

    // A replayed request is ignored while the hash is known.
    let first_reply_count = net.nodes[1]
        .drain()
        .iter()
        .filter(|e| matches!(e, ConsensusOutput::Broadcast(p)
            if matches!(decode(p).body, MessageBody::RecoveryMessage(_))))
        .count();
    net.nodes[1]
        .service
        .handle_event(ConsensusEvent::Payload(request));
    let replay_reply_count = net.nodes[1]
        .drain()
        .iter()
        .filter(|e| matches!(e, ConsensusOutput::Broadcast(p)
            if matches!(decode(p).body, MessageBody::RecoveryMessage(_))))
        .count();
    assert_eq!(first_reply_count, 1);
    assert_eq!(replay_reply_count, 0);

    // Three change views move node 1 to view 1; the set starts empty.
    for i in [0usize, 2, 3] {
        let cv = sign_message(
            i,
            100,
            0,
            MessageBody::ChangeView(basalt_consensus::ChangeView {
                timestamp: START_TIME,
                new_view_number: 1,
                reason: basalt_consensus::ChangeViewReason::Timeout,
            }),
        );
        net.nodes[1].service.handle_event(ConsensusEvent::Payload(cv));
    }
    assert_eq!(net.nodes[1].service.context().view_number, 1);
    assert!(net.nodes[1].service.context().known_hashes.is_empty());
}

/// Across arbitrary crash-restart sequences a validator emits
/// exactly one distinct commit for `(height, view)`.
#[test]
fn restarts_never_produce_a_second_commit() {
    let mempool: Arc<TestMempool> = Arc::new(TestMempool::new(vec![]));
    let mut net = TestNet::new(4, mempool.clone());
    net.start_all();
    net.nodes[0].service.handle_event(ConsensusEvent::Timer {
        height: 100,
        view_number: 0,
    });
    let _ = net.pump();

    let mut commit_bytes = std::collections::HashSet::new();
    // The commit node 1 originally broadcast is in its snapshot.
    let snapshot = net.nodes[1].store.load().unwrap().unwrap();
    for payload in &snapshot.payloads {
        if matches!(decode(payload).body, MessageBody::Commit(_)) {
            commit_bytes.insert(payload.to_array());
        }
    }

    let keys = validator_keys(4);
    for _ in 0..5 {
        let (mut service, mut outputs) = build_node(
            1,
            &keys,
            net.clock.clone(),
            Arc::new(TestLedger::new()),
            mempool.clone(),
            net.nodes[1].store.clone(),
        );
        service.handle_event(ConsensusEvent::SystemReady);
        while let Ok(effect) = outputs.try_recv() {
            if let ConsensusOutput::Broadcast(payload) = effect {
                if matches!(decode(&payload).body, MessageBody::Commit(_)) {
                    commit_bytes.insert(payload.to_array());
                }
            }
        }
        assert!(service.context().commit_sent);
    }

    assert_eq!(
        commit_bytes.len(),
        1,
        "one distinct commit across every restart"
    );
}

/// A single recovery request draws responses from at most `F`
/// validators: exactly the ones that follow the requester in index order.
#[test]
fn recovery_fanout_bounded_by_f() {
    let mempool = Arc::new(TestMempool::new(vec![]));
    let mut net = TestNet::new(7, mempool); // F = 2, M = 5
    net.start_all();

    let request = sign_message(
        3,
        100,
        0,
        MessageBody::RecoveryRequest(RecoveryRequest {
            timestamp: START_TIME,
        }),
    );
    net.deliver_others(&request, 3);

    let mut responders = Vec::new();
    for (i, node) in net.nodes.iter_mut().enumerate() {
        for effect in node.drain() {
            if let ConsensusOutput::Broadcast(payload) = effect {
                if matches!(decode(&payload).body, MessageBody::RecoveryMessage(_)) {
                    responders.push(i);
                }
            }
        }
    }
    assert_eq!(responders, vec![4, 5], "the F validators after the requester");
}

/// The priority slot emits its pre-commit at exactly `F + 1`
/// preparation entries, the fallback slot at exactly `M`.
#[test]
fn preparation_thresholds_per_slot() {
    // Observe node 3 (fallback primary): it never adds its own response to
    // the priority slot, so deliveries alone drive the count.
    let mempool = Arc::new(TestMempool::new(vec![]));
    let mut net = TestNet::new(4, mempool.clone());
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
            nonce: 21,
            transaction_hashes: Vec::new(),
        }),
    );
    net.nodes[3]
        .service
        .handle_event(ConsensusEvent::Payload(proposal.clone()));
    assert!(
        !pre_commit_emitted(&mut net.nodes[3]),
        "one preparation entry is below F + 1"
    );

    let response = sign_message(
        1,
        100,
        0,
        MessageBody::PrepareResponse(PrepareResponse {
            slot: SlotId::Priority,
            preparation_hash: proposal.hash(),
        }),
    );
    net.nodes[3]
        .service
        .handle_event(ConsensusEvent::Payload(response));
    assert!(
        pre_commit_emitted(&mut net.nodes[3]),
        "pre-commit at exactly F + 1 = 2 preparation entries"
    );

    // Fallback slot, observed from node 0 (priority primary): threshold M.
    let mut net = TestNet::new(4, mempool);
    net.start_all();

    let proposal = sign_message(
        3,
        100,
        0,
        MessageBody::PrepareRequest(PrepareRequest {
            slot: SlotId::Fallback,
            version: 0,
            prev_hash: prev_header().hash(),
            timestamp: START_TIME + 1,
            nonce: 22,
            transaction_hashes: Vec::new(),
        }),
    );
    net.nodes[0]
        .service
        .handle_event(ConsensusEvent::Payload(proposal.clone()));
    assert!(!pre_commit_emitted(&mut net.nodes[0]));

    for (responder, expect_pre_commit) in [(1usize, false), (2usize, true)] {
        let response = sign_message(
            responder,
            100,
            0,
            MessageBody::PrepareResponse(PrepareResponse {
                slot: SlotId::Fallback,
                preparation_hash: proposal.hash(),
            }),
        );
        net.nodes[0]
            .service
            .handle_event(ConsensusEvent::Payload(response));
        assert_eq!(
            pre_commit_emitted(&mut net.nodes[0]),
            expect_pre_commit,
            "fallback pre-commit at exactly M = 3 preparation entries"
        );
    }
}

fn pre_commit_emitted(node: &mut TestNode) -> bool {
    node.drain().iter().any(|effect| {
        matches!(effect, ConsensusOutput::Broadcast(payload)
            if matches!(decode(payload).body, MessageBody::PreCommit(_)))
    })
}
