//! Signal exchange and fragmentation across the dispatcher.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use clusterlink::{
    ClientConfig, Dispatcher, InboundEvent, NodeId, NodeTable, Signal, SignalExchange, SignalKind,
    Transport, TransportError, split_into_fragments,
};

use super::{NODES, start_with};

fn registration(words: usize) -> Signal {
    let mut signal = Signal::with_kind(SignalKind::ApiRegReq);
    signal.set_data(&[1, 2, 3]).expect("data");
    signal
        .add_section((0..words as u32).collect())
        .expect("section");
    signal
}

#[test]
fn test_exchange_round_trip_with_fragments() {
    let mut config = ClientConfig::local_network();
    config.max_section_words = 4;
    let h = start_with(config);
    h.fake.fragment_replies(3);
    let exchange = h.context.signal_exchange().expect("exchange");

    exchange
        .send_signal(NodeId(2), registration(10))
        .expect("send");
    let reply = exchange
        .wait_for_kind(SignalKind::ApiRegConf, Duration::from_secs(2))
        .expect("wait")
        .expect("reply");

    assert_eq!(reply.from, NodeId(2));
    assert!(!reply.is_node_failure());
    assert_eq!(reply.signal.data(), &[1, 2, 3]);
    assert_eq!(
        reply.signal.section(0),
        Some((0..10).collect::<Vec<u32>>().as_slice())
    );
    assert_eq!(h.fake.count(SignalKind::ApiRegReq), 3);
    let metrics = h.context.metrics();
    assert_eq!(metrics.signals_fragmented, 1);
    assert_eq!(metrics.fragments_rejected, 0);
}

#[test]
fn test_exchange_sees_node_failure() {
    let h = start_with(ClientConfig::local_network());
    let exchange = h.context.signal_exchange().expect("exchange");

    h.nodes.set_dead(NodeId(1));
    let report = exchange
        .wait_for_node(NodeId(1), Duration::from_secs(2))
        .expect("wait")
        .expect("failure report");
    assert!(report.is_node_failure());

    let err = exchange
        .send_signal(NodeId(1), registration(0))
        .expect_err("dead node");
    assert_eq!(err.code(), clusterlink::ErrorCode::SEND_FAILED);
}

#[test]
fn test_shutdown_wakes_exchange() {
    let h = start_with(ClientConfig::local_network());
    let exchange = h.context.signal_exchange().expect("exchange");
    h.context.shutdown();
    assert!(matches!(
        exchange.wait_for(Duration::ZERO),
        Err(clusterlink::ClusterError::Shutdown)
    ));
}

struct Discard;

impl Transport for Discard {
    fn send(&self, _node: NodeId, _signal: &Signal) -> Result<(), TransportError> {
        Ok(())
    }
}

fn section(len: usize, seed: u32) -> Signal {
    let mut signal = Signal::with_kind(SignalKind::ApiRegConf);
    signal.set_data(&[seed]).expect("data");
    signal
        .add_section((0..len as u32).map(|w| w ^ seed).collect())
        .expect("section");
    signal
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Fragments from two nodes interleaved in any order still reassemble
    /// into the original signals.
    #[test]
    fn test_interleaved_fragments_reassemble(
        first_len in 0usize..40,
        second_len in 0usize..40,
        max_words in 1usize..8,
        order in proptest::collection::vec(any::<bool>(), 0..16),
    ) {
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(ClientConfig::local_network()),
            Arc::new(Discard),
            Arc::new(NodeTable::with_alive(NODES)),
        ));
        let exchange = SignalExchange::open(Arc::clone(&dispatcher)).expect("open");

        let mut originals = Vec::new();
        let mut queues = Vec::new();
        for (seed, len) in [(1u32, first_len), (2, second_len)] {
            let mut signal = section(len, seed);
            signal.set_receiver_block(exchange.block());
            let fragments = split_into_fragments(&signal, max_words, seed).expect("split");
            originals.push(signal);
            queues.push(std::collections::VecDeque::from(fragments));
        }

        let mut picks = order.into_iter();
        while queues.iter().any(|q| !q.is_empty()) {
            let mut index = usize::from(picks.next().unwrap_or(false));
            if queues[index].is_empty() {
                index = 1 - index;
            }
            let fragment = queues[index].pop_front().expect("fragment");
            dispatcher.deliver(InboundEvent::Signal {
                from: NODES[index],
                signal: fragment,
            });
        }

        for (index, original) in originals.iter().enumerate() {
            let received = exchange
                .wait_for_node(NODES[index], Duration::from_millis(50))
                .expect("wait")
                .expect("reassembled signal");
            prop_assert_eq!(received.signal.data(), original.data());
            prop_assert_eq!(received.signal.section(0), original.section(0));
        }
        prop_assert_eq!(dispatcher.metrics().fragments_rejected, 0);
    }
}
