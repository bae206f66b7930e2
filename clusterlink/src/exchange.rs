//! Blocking request/reply exchange for administrative signals.
//!
//! The registered [`ExchangeBlock`] forwards every signal it receives onto a
//! channel. [`SignalExchange`] sends under the dispatcher lock and waits on
//! that channel; signals that do not match the current wait are stashed in
//! arrival order and offered to later waits before the channel is read
//! again. Node failures arrive on the same channel as synthesized
//! NODE_FAILREP signals.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::dispatch::{Dispatcher, NodeEvent, Outbound, SignalHandler};
use crate::error::{ClusterError, ClusterResult};
use crate::protocol::{Message, NodeFailRep};
use crate::signal::{Signal, SignalKind};
use crate::types::{BlockNumber, NodeId};

/// A signal delivered to a [`SignalExchange`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    /// Sending node, or the failed node for a synthesized failure report.
    pub from: NodeId,
    /// Copy of the signal.
    pub signal: Signal,
}

impl Received {
    /// Whether this is a node failure report.
    pub fn is_node_failure(&self) -> bool {
        self.signal.kind() == Some(SignalKind::NodeFailRep)
    }
}

struct ExchangeBlock {
    queue: Sender<Received>,
}

impl SignalHandler for ExchangeBlock {
    fn execute_signal(&mut self, _out: &mut Outbound, from: NodeId, signal: &Signal) {
        if self
            .queue
            .send(Received {
                from,
                signal: signal.clone(),
            })
            .is_err()
        {
            debug!(%from, gsn = signal.gsn(), "exchange gone, signal dropped");
        }
    }

    fn node_status(&mut self, _out: &mut Outbound, node: NodeId, event: NodeEvent) {
        if event != NodeEvent::Failed {
            return;
        }
        match (NodeFailRep { node }).to_signal() {
            Ok(signal) => {
                if self.queue.send(Received { from: node, signal }).is_err() {
                    debug!(%node, "exchange gone, failure report dropped");
                }
            }
            Err(e) => warn!(%node, error = %e, "could not build failure report"),
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Synchronous signal client for cluster-management exchanges.
pub struct SignalExchange {
    dispatcher: Arc<Dispatcher>,
    block: BlockNumber,
    incoming: Receiver<Received>,
    stash: Mutex<VecDeque<Received>>,
}

impl SignalExchange {
    /// Register an exchange block with `dispatcher`.
    pub fn open(dispatcher: Arc<Dispatcher>) -> ClusterResult<Self> {
        let (queue, incoming) = crossbeam_channel::unbounded();
        let block = dispatcher.open(Box::new(ExchangeBlock { queue }))?;
        Ok(Self {
            dispatcher,
            block,
            incoming,
            stash: Mutex::new(VecDeque::new()),
        })
    }

    /// Block number replies should be addressed to.
    pub fn block(&self) -> BlockNumber {
        self.block
    }

    /// Send `signal` to `node` without waiting.
    pub fn send_signal(&self, node: NodeId, signal: Signal) -> ClusterResult<()> {
        self.dispatcher.send(node, self.block, signal)
    }

    /// Next signal from any node.
    ///
    /// A zero `timeout` waits until a signal arrives or the client shuts
    /// down. Returns `Ok(None)` on timeout.
    pub fn wait_for(&self, timeout: Duration) -> ClusterResult<Option<Received>> {
        self.wait_matching(timeout, |_| true)
    }

    /// Next signal from `node`, including a failure report for it.
    pub fn wait_for_node(&self, node: NodeId, timeout: Duration) -> ClusterResult<Option<Received>> {
        self.wait_matching(timeout, |r| r.from == node)
    }

    /// Next signal of type `kind`, or a node failure report.
    pub fn wait_for_kind(
        &self,
        kind: SignalKind,
        timeout: Duration,
    ) -> ClusterResult<Option<Received>> {
        self.wait_matching(timeout, |r| {
            r.signal.kind() == Some(kind) || r.is_node_failure()
        })
    }

    /// Signals received but not yet taken by a wait.
    pub fn pending(&self) -> usize {
        self.stash.lock().len() + self.incoming.len()
    }

    fn wait_matching(
        &self,
        timeout: Duration,
        matches: impl Fn(&Received) -> bool,
    ) -> ClusterResult<Option<Received>> {
        let mut stash = self.stash.lock();
        if let Some(position) = stash.iter().position(&matches) {
            return Ok(stash.remove(position));
        }

        let forever = timeout.is_zero();
        let deadline = Instant::now() + timeout;
        let slice = self.dispatcher.config().poll_slice;
        loop {
            if self.dispatcher.is_shut_down() {
                return Err(ClusterError::Shutdown);
            }
            let wait = if forever {
                slice
            } else {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(None);
                }
                remaining.min(slice)
            };
            match self.incoming.recv_timeout(wait) {
                Ok(received) if matches(&received) => {
                    debug!(from = %received.from, gsn = received.signal.gsn(), "exchange matched");
                    return Ok(Some(received));
                }
                Ok(received) => stash.push_back(received),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err(ClusterError::Shutdown),
            }
        }
    }
}

impl Drop for SignalExchange {
    fn drop(&mut self) {
        self.dispatcher.close(self.block);
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::cluster::NodeTable;
    use crate::config::ClientConfig;
    use crate::transport::{InboundEvent, Transport, TransportError};

    struct NullTransport;

    impl Transport for NullTransport {
        fn send(&self, _node: NodeId, _signal: &Signal) -> Result<(), TransportError> {
            Ok(())
        }
    }

    struct NullBlock;

    impl SignalHandler for NullBlock {
        fn execute_signal(&mut self, _out: &mut Outbound, _from: NodeId, _signal: &Signal) {}

        fn node_status(&mut self, _out: &mut Outbound, _node: NodeId, _event: NodeEvent) {}

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn setup() -> (Arc<Dispatcher>, SignalExchange) {
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(ClientConfig::local_network()),
            Arc::new(NullTransport),
            Arc::new(NodeTable::with_alive([NodeId(1), NodeId(2)])),
        ));
        let exchange = SignalExchange::open(Arc::clone(&dispatcher)).expect("open");
        (dispatcher, exchange)
    }

    fn reply(block: BlockNumber, kind: SignalKind) -> Signal {
        let mut signal = Signal::with_kind(kind);
        signal.set_receiver_block(block);
        signal
    }

    fn deliver(dispatcher: &Dispatcher, from: NodeId, signal: Signal) {
        dispatcher.deliver(InboundEvent::Signal { from, signal });
    }

    #[test]
    fn test_unmatched_signals_are_kept_in_order() {
        let (dispatcher, exchange) = setup();
        let block = exchange.block();
        deliver(&dispatcher, NodeId(1), reply(block, SignalKind::ApiRegConf));
        deliver(&dispatcher, NodeId(2), reply(block, SignalKind::ApiRegRef));
        deliver(&dispatcher, NodeId(1), reply(block, SignalKind::ApiRegRef));

        let from_two = exchange
            .wait_for_node(NodeId(2), Duration::from_millis(50))
            .expect("wait")
            .expect("signal");
        assert_eq!(from_two.signal.kind(), Some(SignalKind::ApiRegRef));
        assert_eq!(exchange.pending(), 2);

        let first = exchange
            .wait_for(Duration::from_millis(50))
            .expect("wait")
            .expect("signal");
        assert_eq!(first.signal.kind(), Some(SignalKind::ApiRegConf));
        let by_kind = exchange
            .wait_for_kind(SignalKind::ApiRegRef, Duration::from_millis(50))
            .expect("wait")
            .expect("signal");
        assert_eq!(by_kind.from, NodeId(1));
        assert_eq!(exchange.pending(), 0);
    }

    #[test]
    fn test_wait_times_out() {
        let (_dispatcher, exchange) = setup();
        let started = Instant::now();
        let received = exchange
            .wait_for(Duration::from_millis(30))
            .expect("wait");
        assert!(received.is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_node_failure_is_a_pseudo_signal() {
        let (dispatcher, exchange) = setup();
        dispatcher.deliver(InboundEvent::NodeFailed(NodeId(2)));
        let received = exchange
            .wait_for_kind(SignalKind::ApiRegConf, Duration::from_millis(50))
            .expect("wait")
            .expect("failure report");
        assert!(received.is_node_failure());
        assert_eq!(
            NodeFailRep::decode(&received.signal).expect("decode").node,
            NodeId(2)
        );
    }

    #[test]
    fn test_block_outliving_its_exchange_drops_signals() {
        let (queue, incoming) = crossbeam_channel::unbounded();
        let mut block = ExchangeBlock { queue };
        drop(incoming);
        let dispatcher = Dispatcher::new(
            Arc::new(ClientConfig::local_network()),
            Arc::new(NullTransport),
            Arc::new(NodeTable::with_alive([NodeId(1)])),
        );
        let own = dispatcher.open(Box::new(NullBlock)).expect("open");
        dispatcher
            .with_handler::<NullBlock, _>(own, |_, out| {
                block.execute_signal(out, NodeId(1), &reply(own, SignalKind::ApiRegConf));
                block.node_status(out, NodeId(1), NodeEvent::Failed);
            })
            .expect("handler");
    }

    #[test]
    fn test_zero_timeout_polls_until_shutdown() {
        let (dispatcher, exchange) = setup();
        let stopper = Arc::clone(&dispatcher);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            stopper.shutdown();
        });
        let result = exchange.wait_for(Duration::ZERO);
        assert!(matches!(result, Err(ClusterError::Shutdown)));
        handle.join().expect("join");
    }
}
