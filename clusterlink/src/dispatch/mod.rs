//! The dispatcher: one lock around every send, registration and delivery.
//!
//! ```text
//!  app threads ──┐                         ┌── receive thread
//!                ▼                         ▼
//!        ┌──────────── Mutex<FacadeState> ────────────┐
//!        │ BlockRegistry   Outbound   FragmentAssembler│
//!        └────────────────────────────────────────────┘
//!                         │ Condvar `wakeup`
//!                         ▼
//!                blocked waiters re-check
//! ```
//!
//! [`Outbound`] is the only way to reach the transport, and it only exists
//! inside the locked state, so no signal can be sent without the lock.
//! Handlers are called with the lock held and receive `&mut Outbound`; they
//! never lock again. After every delivery the condition variable is
//! notified so blocked application threads re-check their state.

mod metrics;
mod registry;

pub use metrics::DispatchMetrics;
pub use registry::{BlockRegistry, NodeEvent, SignalHandler};

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::cluster::ClusterMembership;
use crate::config::ClientConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::signal::{FragmentAssembler, Signal, SignalChain, split_into_fragments};
use crate::transport::{InboundEvent, Transport, TransportError};
use crate::types::{BlockNumber, BlockRef, NodeId};

/// Send half of the locked dispatcher state.
pub struct Outbound {
    transport: Arc<dyn Transport>,
    membership: Arc<dyn ClusterMembership>,
    config: Arc<ClientConfig>,
    metrics: DispatchMetrics,
    next_signal_id: u32,
    next_fragment_id: u32,
    backlog: VecDeque<ParkedSend>,
}

/// A send waiting out its retry backoff.
struct ParkedSend {
    node: NodeId,
    signal: Signal,
    attempts: u32,
    due: Instant,
}

enum Attempt {
    Sent,
    Retry,
    Failed(TransportError),
}

impl Outbound {
    /// Send `signal` from `sender` to its receiver block on `node`.
    ///
    /// Stamps the sender reference and a fresh signal id and splits oversized
    /// sections into fragments. A transient failure parks the signal for a
    /// retry after the [`RetryPolicy`](crate::config::RetryPolicy) backoff;
    /// later sends to the same node queue behind it. The dispatcher retries
    /// parked sends with the lock released while it waits, so `Ok` means
    /// sent or parked.
    pub fn send(
        &mut self,
        node: NodeId,
        sender: BlockNumber,
        mut signal: Signal,
    ) -> Result<(), TransportError> {
        if !self.membership.is_node_alive(node) {
            self.metrics.send_failures += 1;
            return Err(TransportError::NodeUnreachable { node });
        }
        signal.set_sender(BlockRef::new(self.config.node_id, sender));
        self.next_signal_id = self.next_signal_id.wrapping_add(1);
        signal.set_signal_id(self.next_signal_id);

        let max_words = self.config.max_section_words;
        if (0..signal.section_count())
            .filter_map(|i| signal.section(i))
            .all(|s| s.len() <= max_words)
        {
            return self.transmit(node, signal);
        }

        self.next_fragment_id = self.next_fragment_id.wrapping_add(1);
        let fragments = split_into_fragments(&signal, max_words, self.next_fragment_id)
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        self.metrics.signals_fragmented += 1;
        for fragment in fragments {
            self.transmit(node, fragment)?;
        }
        Ok(())
    }

    /// Send every signal of `signals` in order, stopping at the first failure.
    pub fn send_all(
        &mut self,
        node: NodeId,
        sender: BlockNumber,
        signals: impl IntoIterator<Item = Signal>,
    ) -> Result<usize, TransportError> {
        let mut sent = 0;
        for signal in signals {
            self.send(node, sender, signal)?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Send a linked batch in link order, stopping at the first failure.
    pub fn send_chain(
        &mut self,
        node: NodeId,
        sender: BlockNumber,
        mut chain: SignalChain,
    ) -> Result<usize, TransportError> {
        let mut sent = 0;
        while let Some(signal) = chain.pop_front() {
            self.send(node, sender, signal)?;
            sent += 1;
        }
        Ok(sent)
    }

    fn transmit(&mut self, node: NodeId, signal: Signal) -> Result<(), TransportError> {
        let mut pending = ParkedSend {
            node,
            signal,
            attempts: 0,
            due: Instant::now(),
        };
        if self.backlog.iter().any(|p| p.node == node) {
            debug!(%node, gsn = pending.signal.gsn(), "queued behind parked send");
            self.backlog.push_back(pending);
            return Ok(());
        }
        match self.attempt(&mut pending) {
            Attempt::Sent => Ok(()),
            Attempt::Retry => {
                self.backlog.push_back(pending);
                Ok(())
            }
            Attempt::Failed(e) => Err(e),
        }
    }

    fn attempt(&mut self, pending: &mut ParkedSend) -> Attempt {
        pending.attempts += 1;
        let node = pending.node;
        let signal = &pending.signal;
        match self.transport.send(node, signal) {
            Ok(()) => {
                self.metrics
                    .record_sent(signal.length() + signal.section_words());
                debug!(%node, gsn = signal.gsn(), id = signal.signal_id(), "signal sent");
                Attempt::Sent
            }
            Err(e) if e.is_transient() && pending.attempts < self.config.retry.max_attempts => {
                self.metrics.send_retries += 1;
                let delay = self.config.retry.backoff(pending.attempts);
                debug!(%node, attempt = pending.attempts, error = %e, ?delay, "send parked for retry");
                pending.due = Instant::now() + delay;
                Attempt::Retry
            }
            Err(e) => {
                self.metrics.send_failures += 1;
                warn!(%node, gsn = signal.gsn(), attempt = pending.attempts, error = %e, "send failed");
                Attempt::Failed(e)
            }
        }
    }

    /// Retry every parked send whose backoff has elapsed. Never sleeps.
    ///
    /// Parked sends to one node go out in the order they were queued. When
    /// the head for a node fails for good, everything queued behind it for
    /// that node is dropped.
    fn flush_due(&mut self) -> Vec<(NodeId, TransportError)> {
        let now = Instant::now();
        let mut failures = Vec::new();
        let mut waiting: Vec<NodeId> = Vec::new();
        let mut index = 0;
        while index < self.backlog.len() {
            let node = self.backlog[index].node;
            if waiting.contains(&node) || self.backlog[index].due > now {
                waiting.push(node);
                index += 1;
                continue;
            }
            let Some(mut pending) = self.backlog.remove(index) else {
                break;
            };
            match self.attempt(&mut pending) {
                Attempt::Sent => {}
                Attempt::Retry => {
                    self.backlog.insert(index, pending);
                    waiting.push(node);
                    index += 1;
                }
                Attempt::Failed(e) => {
                    let before = self.backlog.len();
                    self.backlog.retain(|p| p.node != node);
                    let dropped = before - self.backlog.len();
                    if dropped > 0 {
                        self.metrics.send_failures += dropped as u64;
                        warn!(%node, dropped, "dropped sends queued behind failed send");
                    }
                    failures.push((node, e));
                }
            }
        }
        failures
    }

    fn next_due(&self) -> Option<Instant> {
        self.backlog.iter().map(|p| p.due).min()
    }

    /// Sends waiting for a retry.
    pub fn parked(&self) -> usize {
        self.backlog.len()
    }

    /// Cluster membership.
    pub fn membership(&self) -> &dyn ClusterMembership {
        self.membership.as_ref()
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Count a batch that completed more operations than it sent.
    pub fn record_too_many_operations(&mut self) {
        self.metrics.too_many_operations += 1;
    }
}

struct FacadeState {
    registry: BlockRegistry,
    outbound: Outbound,
    assembler: FragmentAssembler,
    shut_down: bool,
}

/// Owner of the send path, the block registry and the receive loop.
pub struct Dispatcher {
    state: Mutex<FacadeState>,
    wakeup: Condvar,
}

impl Dispatcher {
    /// Dispatcher sending through `transport`.
    pub fn new(
        config: Arc<ClientConfig>,
        transport: Arc<dyn Transport>,
        membership: Arc<dyn ClusterMembership>,
    ) -> Self {
        Self {
            state: Mutex::new(FacadeState {
                registry: BlockRegistry::new(),
                outbound: Outbound {
                    transport,
                    membership,
                    config,
                    metrics: DispatchMetrics::new(),
                    next_signal_id: 0,
                    next_fragment_id: 0,
                    backlog: VecDeque::new(),
                },
                assembler: FragmentAssembler::new(),
                shut_down: false,
            }),
            wakeup: Condvar::new(),
        }
    }

    /// Register a handler and return its block number.
    pub fn open(&self, handler: Box<dyn SignalHandler>) -> ClusterResult<BlockNumber> {
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(ClusterError::Shutdown);
        }
        let block = state.registry.open(handler)?;
        info!(%block, "block opened");
        Ok(block)
    }

    /// Unregister `block`. Its number may be handed out again later.
    pub fn close(&self, block: BlockNumber) -> Option<Box<dyn SignalHandler>> {
        let handler = self.state.lock().registry.close(block);
        if handler.is_some() {
            info!(%block, "block closed");
        }
        handler
    }

    /// Run `f` on the handler of `block` with the lock held.
    ///
    /// # Errors
    ///
    /// `InvalidState` when `block` is not open or holds another handler
    /// type, `Shutdown` after [`Dispatcher::shutdown`].
    pub fn with_handler<H, R>(
        &self,
        block: BlockNumber,
        f: impl FnOnce(&mut H, &mut Outbound) -> R,
    ) -> ClusterResult<R>
    where
        H: SignalHandler,
    {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.shut_down {
            return Err(ClusterError::Shutdown);
        }
        let handler = downcast::<H>(&mut state.registry, block)?;
        let result = f(handler, &mut state.outbound);
        if let Err(e) = self.drain_parked(&mut guard) {
            debug!(%block, error = %e, "parked sends abandoned");
        }
        drop(guard);
        self.wakeup.notify_all();
        Ok(result)
    }

    /// Block until `check` returns `Some` or `deadline` passes.
    ///
    /// `check` runs with the lock held, first immediately and then after
    /// every wakeup. Returns `Ok(None)` on timeout.
    pub fn wait_until<H, R>(
        &self,
        block: BlockNumber,
        deadline: Instant,
        mut check: impl FnMut(&mut H, &mut Outbound) -> Option<R>,
    ) -> ClusterResult<Option<R>>
    where
        H: SignalHandler,
    {
        let mut guard = self.state.lock();
        loop {
            let state = &mut *guard;
            if state.shut_down {
                return Err(ClusterError::Shutdown);
            }
            state.outbound.flush_due();
            let handler = downcast::<H>(&mut state.registry, block)?;
            if let Some(result) = check(handler, &mut state.outbound) {
                return Ok(Some(result));
            }
            let wake_at = state
                .outbound
                .next_due()
                .map_or(deadline, |due| due.min(deadline));
            self.wakeup.wait_until(&mut guard, wake_at);
            if Instant::now() >= deadline {
                let state = &mut *guard;
                let handler = downcast::<H>(&mut state.registry, block)?;
                return Ok(check(handler, &mut state.outbound));
            }
        }
    }

    /// Send one signal from `sender` under the lock.
    ///
    /// Waits out retries of parked sends with the lock released, so
    /// deliveries and other senders proceed during the backoff. Fails with
    /// the transport error when a send to `node` is given up.
    pub fn send(&self, node: NodeId, sender: BlockNumber, signal: Signal) -> ClusterResult<()> {
        let mut guard = self.state.lock();
        if guard.shut_down {
            return Err(ClusterError::Shutdown);
        }
        guard.outbound.send(node, sender, signal)?;
        let failures = self.drain_parked(&mut guard)?;
        drop(guard);
        match failures.into_iter().find(|(failed, _)| *failed == node) {
            Some((_, e)) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Retry parked sends until none remain, sleeping with the lock
    /// released between rounds.
    fn drain_parked(
        &self,
        guard: &mut MutexGuard<'_, FacadeState>,
    ) -> ClusterResult<Vec<(NodeId, TransportError)>> {
        let mut failures = Vec::new();
        loop {
            if guard.shut_down {
                let abandoned = guard.outbound.backlog.len();
                guard.outbound.backlog.clear();
                if abandoned > 0 {
                    return Err(ClusterError::Shutdown);
                }
                return Ok(failures);
            }
            failures.extend(guard.outbound.flush_due());
            let Some(due) = guard.outbound.next_due() else {
                return Ok(failures);
            };
            let delay = due.saturating_duration_since(Instant::now());
            if !delay.is_zero() {
                MutexGuard::unlocked(guard, || thread::sleep(delay));
            }
        }
    }

    /// Retry parked sends that are due without waiting for the others.
    pub fn flush_parked(&self) {
        let failures = self.state.lock().outbound.flush_due();
        for (node, e) in failures {
            debug!(%node, error = %e, "parked send given up");
        }
    }

    /// Route one inbound event. Returns `false` once shut down.
    pub fn deliver(&self, event: InboundEvent) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.shut_down {
            return false;
        }
        match event {
            InboundEvent::Signal { from, signal } => {
                state.outbound.metrics.signals_received += 1;
                let signal = match state.assembler.accept(from, signal) {
                    Ok(Some(signal)) => signal,
                    Ok(None) => return true,
                    Err(e) => {
                        state.outbound.metrics.fragments_rejected += 1;
                        warn!(%from, error = %e, "fragment rejected");
                        return true;
                    }
                };
                let block = signal.receiver_block();
                match state.registry.get_mut(block) {
                    Some(handler) => {
                        debug!(%from, %block, gsn = signal.gsn(), "routing signal");
                        handler.execute_signal(&mut state.outbound, from, &signal);
                    }
                    None => {
                        state.outbound.metrics.signals_unroutable += 1;
                        warn!(%from, %block, gsn = signal.gsn(), "no block for signal");
                    }
                }
            }
            InboundEvent::NodeFailed(node) => {
                info!(%node, "node failure reported");
                state.outbound.metrics.node_failures += 1;
                state.assembler.abandon(node);
                let outbound = &mut state.outbound;
                state
                    .registry
                    .for_each(|_, handler| handler.node_status(outbound, node, NodeEvent::Failed));
            }
            InboundEvent::NodeAlive(node) => {
                info!(%node, "node alive");
                let outbound = &mut state.outbound;
                state
                    .registry
                    .for_each(|_, handler| handler.node_status(outbound, node, NodeEvent::Alive));
            }
            InboundEvent::Shutdown => {
                state.shut_down = true;
            }
        }
        if !state.shut_down {
            state.outbound.flush_due();
        }
        let running = !state.shut_down;
        drop(guard);
        self.wakeup.notify_all();
        running
    }

    /// Drain `inbound` on a dedicated thread until shutdown, disconnect or
    /// [`ReceiveThread::stop`].
    pub fn spawn_receive_thread(
        self: &Arc<Self>,
        inbound: Receiver<InboundEvent>,
    ) -> io::Result<ReceiveThread> {
        let dispatcher = Arc::clone(self);
        let tick = self.config().poll_slice;
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let handle = thread::Builder::new()
            .name("clusterlink:receive".into())
            .spawn(move || {
                info!("receive thread started");
                loop {
                    crossbeam_channel::select! {
                        recv(inbound) -> event => match event {
                            Ok(event) => {
                                if !dispatcher.deliver(event) {
                                    break;
                                }
                            }
                            Err(_) => break,
                        },
                        recv(stop_rx) -> _ => break,
                        default(tick) => dispatcher.flush_parked(),
                    }
                }
                dispatcher.shutdown();
                info!("receive thread stopped");
            })?;
        Ok(ReceiveThread {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Refuse further work and wake every waiter.
    pub fn shutdown(&self) {
        self.state.lock().shut_down = true;
        self.wakeup.notify_all();
    }

    /// Whether [`Dispatcher::shutdown`] was called.
    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> DispatchMetrics {
        let state = self.state.lock();
        let mut metrics = state.outbound.metrics.clone();
        metrics.open_blocks = state.registry.open_count();
        metrics
    }

    /// Client configuration.
    pub fn config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.state.lock().outbound.config)
    }

    /// Cluster membership.
    pub fn membership(&self) -> Arc<dyn ClusterMembership> {
        Arc::clone(&self.state.lock().outbound.membership)
    }
}

/// Handle to the receive thread.
pub struct ReceiveThread {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ReceiveThread {
    /// Stop the thread and wait for it to exit.
    pub fn stop(mut self) {
        self.stop_and_join();
    }

    /// Wait for the thread to exit on its own.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("receive thread panicked");
        }
    }

    fn stop_and_join(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("receive thread panicked");
        }
    }
}

impl Drop for ReceiveThread {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn downcast<H: SignalHandler>(
    registry: &mut BlockRegistry,
    block: BlockNumber,
) -> ClusterResult<&mut H> {
    registry
        .get_mut(block)
        .and_then(|h| h.as_any_mut().downcast_mut::<H>())
        .ok_or_else(|| ClusterError::invalid_state(format!("{block} is not open")))
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::sync::OnceLock;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::cluster::NodeTable;
    use crate::signal::SignalKind;

    /// Records what it sees and checks the dispatcher lock is held.
    #[derive(Default)]
    struct LockCheckingTransport {
        dispatcher: OnceLock<Arc<Dispatcher>>,
        in_send: AtomicBool,
        sends: AtomicUsize,
        unlocked_sends: AtomicUsize,
        overlapping_sends: AtomicUsize,
        transient_failures: AtomicUsize,
    }

    impl Transport for LockCheckingTransport {
        fn send(&self, node: NodeId, _signal: &Signal) -> Result<(), TransportError> {
            if self.in_send.swap(true, Ordering::SeqCst) {
                self.overlapping_sends.fetch_add(1, Ordering::SeqCst);
            }
            if let Some(dispatcher) = self.dispatcher.get()
                && !dispatcher.state.is_locked()
            {
                self.unlocked_sends.fetch_add(1, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_micros(50));
            self.in_send.store(false, Ordering::SeqCst);

            if self.transient_failures.load(Ordering::SeqCst) > 0 {
                self.transient_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(TransportError::BufferFull { node });
            }
            self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Echoes every signal back to the sender through `send`.
    #[derive(Default)]
    struct Echo {
        received: Vec<(NodeId, u16)>,
        failures: Vec<NodeId>,
    }

    impl SignalHandler for Echo {
        fn execute_signal(&mut self, out: &mut Outbound, from: NodeId, signal: &Signal) {
            self.received.push((from, signal.gsn()));
            let _ = out.send(from, BlockNumber::FIRST_DYNAMIC, signal.clone());
        }

        fn node_status(&mut self, _out: &mut Outbound, node: NodeId, event: NodeEvent) {
            if event == NodeEvent::Failed {
                self.failures.push(node);
            }
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn setup() -> (Arc<Dispatcher>, Arc<LockCheckingTransport>) {
        setup_with(ClientConfig::local_network())
    }

    fn setup_with(config: ClientConfig) -> (Arc<Dispatcher>, Arc<LockCheckingTransport>) {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
        let transport = Arc::new(LockCheckingTransport::default());
        let membership = Arc::new(NodeTable::with_alive([NodeId(1), NodeId(2)]));
        let config = Arc::new(config);
        let dispatcher = Arc::new(Dispatcher::new(
            config,
            Arc::clone(&transport) as Arc<dyn Transport>,
            membership,
        ));
        let _ = transport.dispatcher.set(Arc::clone(&dispatcher));
        (dispatcher, transport)
    }

    fn signal_to(block: BlockNumber) -> Signal {
        let mut signal = Signal::with_kind(SignalKind::TcCommitConf);
        signal.set_receiver_block(block);
        signal
    }

    #[test]
    fn test_sends_happen_under_lock_without_overlap() {
        let (dispatcher, transport) = setup();
        let block = dispatcher.open(Box::new(Echo::default())).expect("open");
        let (tx, rx) = crossbeam_channel::unbounded();
        let receiver = dispatcher.spawn_receive_thread(rx).expect("spawn");

        let senders: Vec<_> = (0..4)
            .map(|_| {
                let dispatcher = Arc::clone(&dispatcher);
                thread::spawn(move || {
                    for _ in 0..50 {
                        dispatcher
                            .send(NodeId(1), block, signal_to(BlockNumber::TC))
                            .expect("send");
                    }
                })
            })
            .collect();
        for _ in 0..100 {
            tx.send(InboundEvent::Signal {
                from: NodeId(2),
                signal: signal_to(block),
            })
            .expect("inbound");
        }
        for sender in senders {
            sender.join().expect("sender thread");
        }
        tx.send(InboundEvent::Shutdown).expect("shutdown");
        receiver.join();

        assert_eq!(transport.sends.load(Ordering::SeqCst), 300);
        assert_eq!(transport.unlocked_sends.load(Ordering::SeqCst), 0);
        assert_eq!(transport.overlapping_sends.load(Ordering::SeqCst), 0);
        let metrics = dispatcher.metrics();
        assert_eq!(metrics.signals_received, 100);
        assert_eq!(metrics.signals_sent, 300);
    }

    #[test]
    fn test_unroutable_and_node_failure() {
        let (dispatcher, _) = setup();
        let block = dispatcher.open(Box::new(Echo::default())).expect("open");

        assert!(dispatcher.deliver(InboundEvent::Signal {
            from: NodeId(1),
            signal: signal_to(BlockNumber(0x8100)),
        }));
        assert!(dispatcher.deliver(InboundEvent::NodeFailed(NodeId(2))));
        assert_eq!(dispatcher.metrics().signals_unroutable, 1);

        let failures = dispatcher
            .with_handler::<Echo, _>(block, |echo, _| echo.failures.clone())
            .expect("handler");
        assert_eq!(failures, vec![NodeId(2)]);
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let (dispatcher, transport) = setup();
        transport.transient_failures.store(2, Ordering::SeqCst);
        dispatcher
            .send(NodeId(1), BlockNumber::FIRST_DYNAMIC, signal_to(BlockNumber::TC))
            .expect("send after retries");
        let metrics = dispatcher.metrics();
        assert_eq!(metrics.send_retries, 2);
        assert_eq!(metrics.signals_sent, 1);

        transport.transient_failures.store(5, Ordering::SeqCst);
        let err = dispatcher
            .send(NodeId(1), BlockNumber::FIRST_DYNAMIC, signal_to(BlockNumber::TC))
            .expect_err("retries exhausted");
        assert_eq!(err.code(), crate::error::ErrorCode::SEND_FAILED);
        assert_eq!(dispatcher.metrics().send_failures, 1);
    }

    #[test]
    fn test_delivery_proceeds_during_retry_backoff() {
        let mut config = ClientConfig::local_network();
        config.retry = crate::config::RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(150),
            max_backoff: Duration::from_millis(150),
        };
        let (dispatcher, transport) = setup_with(config);
        let block = dispatcher.open(Box::new(Echo::default())).expect("open");
        transport.transient_failures.store(2, Ordering::SeqCst);

        let sender = {
            let dispatcher = Arc::clone(&dispatcher);
            thread::spawn(move || {
                dispatcher.send(NodeId(1), block, signal_to(BlockNumber::TC))
            })
        };
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        assert!(dispatcher.deliver(InboundEvent::NodeFailed(NodeId(2))));
        assert!(started.elapsed() < Duration::from_millis(100));
        let failures = dispatcher
            .with_handler::<Echo, _>(block, |echo, out| (echo.failures.clone(), out.parked()))
            .expect("handler");
        assert_eq!(failures, (vec![NodeId(2)], 1));

        sender.join().expect("sender thread").expect("send after retries");
        let metrics = dispatcher.metrics();
        assert_eq!(metrics.send_retries, 2);
        assert_eq!(metrics.signals_sent, 1);
        assert_eq!(transport.unlocked_sends.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_send_to_dead_node_fails_fast() {
        let (dispatcher, transport) = setup();
        let err = dispatcher
            .send(NodeId(9), BlockNumber::FIRST_DYNAMIC, signal_to(BlockNumber::TC))
            .expect_err("dead node");
        assert!(matches!(
            err,
            ClusterError::Transport(TransportError::NodeUnreachable { node: NodeId(9) })
        ));
        assert_eq!(transport.sends.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_oversized_sections_are_fragmented() {
        let (dispatcher, transport) = setup();
        let mut signal = signal_to(BlockNumber::TC);
        let words = dispatcher.config().max_section_words * 2 + 1;
        signal.add_section(vec![7; words]).expect("section");
        dispatcher
            .send(NodeId(1), BlockNumber::FIRST_DYNAMIC, signal)
            .expect("send");
        assert_eq!(transport.sends.load(Ordering::SeqCst), 3);
        assert_eq!(dispatcher.metrics().signals_fragmented, 1);
    }

    #[test]
    fn test_wait_until_times_out_and_wakes() {
        let (dispatcher, _) = setup();
        let block = dispatcher.open(Box::new(Echo::default())).expect("open");

        let deadline = Instant::now() + Duration::from_millis(20);
        let result = dispatcher
            .wait_until::<Echo, _>(block, deadline, |echo, _| {
                (!echo.received.is_empty()).then_some(())
            })
            .expect("wait");
        assert!(result.is_none());

        let waiter = {
            let dispatcher = Arc::clone(&dispatcher);
            thread::spawn(move || {
                dispatcher.wait_until::<Echo, _>(
                    block,
                    Instant::now() + Duration::from_secs(5),
                    |echo, _| echo.received.first().copied(),
                )
            })
        };
        thread::sleep(Duration::from_millis(10));
        dispatcher.deliver(InboundEvent::Signal {
            from: NodeId(2),
            signal: signal_to(block),
        });
        let seen = waiter.join().expect("waiter").expect("wait");
        assert_eq!(seen.map(|(node, _)| node), Some(NodeId(2)));
    }

    #[test]
    fn test_shutdown_wakes_waiters() {
        let (dispatcher, _) = setup();
        let block = dispatcher.open(Box::new(Echo::default())).expect("open");
        let waiter = {
            let dispatcher = Arc::clone(&dispatcher);
            thread::spawn(move || {
                dispatcher.wait_until::<Echo, ()>(
                    block,
                    Instant::now() + Duration::from_secs(5),
                    |_, _| None,
                )
            })
        };
        thread::sleep(Duration::from_millis(10));
        dispatcher.shutdown();
        assert!(matches!(
            waiter.join().expect("waiter"),
            Err(ClusterError::Shutdown)
        ));
        assert!(dispatcher.open(Box::new(Echo::default())).is_err());
    }
}
