//! Sessions: the application surface over the dispatcher.
//!
//! A [`Session`] registers one block with the dispatcher. The block owns the
//! session's transaction records, the prepared / sent / completed arrays,
//! its scan cursors and the receiver pool; all of it is touched only under
//! the dispatcher lock. Handles ([`Transaction`], [`ScanCursor`]) hold
//! indices into that state, never references.
//!
//! Blocking calls wait on the dispatcher's condition variable with an
//! explicit deadline. When a wait gives up the transaction is forced to a
//! terminal failure and its coordinator record is released on close.

mod block;
mod scan;
mod transaction;

pub use scan::ScanCursor;
pub use transaction::Transaction;

pub(crate) use block::SessionBlock;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use self::block::Acquired;
use crate::config::ClientConfig;
use crate::dispatch::{Dispatcher, Outbound};
use crate::error::{ClusterError, ClusterResult, ErrorCode};
use crate::metadata::MetadataResolver;
use crate::transaction::{
    AbortOption, CommitState, CompletionState, ConnectionState, Coordinator, ExecType,
};
use crate::transport::TransportError;
use crate::types::{BlockNumber, NodeId, TransactionId};

/// Called from [`Session::poll`] once an asynchronous execute resolves.
pub type CompletionCallback = Box<dyn FnOnce(&TransactionOutcome) + Send>;

/// Final state of an execute, as handed to a [`CompletionCallback`].
#[derive(Debug, Clone)]
pub struct TransactionOutcome {
    /// Record pointer of the transaction.
    pub api_ptr: u32,
    /// Transaction id.
    pub transaction_id: TransactionId,
    /// Commit state after the execute.
    pub commit_state: CommitState,
    /// Completion state after the execute.
    pub completion_state: CompletionState,
    /// `Ok` on success, otherwise the first recorded error.
    pub result: ClusterResult<()>,
}

impl TransactionOutcome {
    fn of(coordinator: &Coordinator) -> Self {
        Self {
            api_ptr: coordinator.api_ptr(),
            transaction_id: coordinator.transaction_id(),
            commit_state: coordinator.commit_state(),
            completion_state: coordinator.completion_state(),
            result: coordinator.outcome(),
        }
    }
}

pub(crate) struct SessionInner {
    dispatcher: Arc<Dispatcher>,
    block: BlockNumber,
    resolver: Arc<dyn MetadataResolver>,
    config: Arc<ClientConfig>,
}

impl SessionInner {
    /// Run `f` on the session block under the dispatcher lock.
    pub(crate) fn with_block<R>(
        &self,
        f: impl FnOnce(&mut SessionBlock, &mut Outbound) -> R,
    ) -> ClusterResult<R> {
        self.dispatcher.with_handler::<SessionBlock, R>(self.block, f)
    }

    /// Wait until `check` yields or `timeout` elapses.
    pub(crate) fn wait<R>(
        &self,
        timeout: Duration,
        check: impl FnMut(&mut SessionBlock, &mut Outbound) -> Option<R>,
    ) -> ClusterResult<Option<R>> {
        self.dispatcher
            .wait_until::<SessionBlock, R>(self.block, Instant::now() + timeout, check)
    }

    /// Drop record `api_ptr` after a failed seize.
    pub(crate) fn discard_record(&self, api_ptr: u32) {
        if let Err(e) = self.with_block(|session, _| session.discard(api_ptr)) {
            debug!(record = api_ptr, error = %e, "discard after failed seize failed");
        }
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn resolver(&self) -> &dyn MetadataResolver {
        self.resolver.as_ref()
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.dispatcher.close(self.block);
    }
}

/// A registered client endpoint owning a pool of transaction records.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Register a new session block with `dispatcher`.
    pub fn open(
        dispatcher: Arc<Dispatcher>,
        resolver: Arc<dyn MetadataResolver>,
    ) -> ClusterResult<Self> {
        let config = dispatcher.config();
        let handler = SessionBlock::new(&config)?;
        let block = dispatcher.open(Box::new(handler))?;
        let inner = Arc::new(SessionInner {
            dispatcher,
            block,
            resolver,
            config,
        });
        let node_id = inner.config.node_id;
        inner.with_block(|session, _| session.attach(block, node_id))?;
        Ok(Self { inner })
    }

    /// Block number the session receives replies on.
    pub fn block(&self) -> BlockNumber {
        self.inner.block
    }

    /// Start a transaction on any alive node.
    ///
    /// When seizing fails because the chosen node died, another alive node
    /// is tried, up to the retry policy's attempt count.
    pub fn start_transaction(&self) -> ClusterResult<Transaction> {
        let membership = self.inner.dispatcher.membership();
        let attempts = self.inner.config.retry.max_attempts.max(1);
        let mut last_error = ClusterError::NoAliveNode;
        for attempt in 1..=attempts {
            let Some(node) = membership.pick_any_alive_node() else {
                return Err(ClusterError::NoAliveNode);
            };
            match self.start_transaction_on(node) {
                Ok(tx) => return Ok(tx),
                Err(e) if is_node_loss(&e) => {
                    warn!(%node, attempt, error = %e, "seize failed, trying another node");
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }

    /// Start a transaction coordinated by `node`.
    pub fn start_transaction_on(&self, node: NodeId) -> ClusterResult<Transaction> {
        let acquired = self
            .inner
            .with_block(|session, out| session.acquire(out, node))??;
        let api_ptr = match acquired {
            Acquired::Ready(api_ptr) => {
                debug!(%node, record = api_ptr, "reusing pooled record");
                api_ptr
            }
            Acquired::Seizing(api_ptr) => {
                let seized = self
                    .inner
                    .wait(self.inner.config.execute_deadline(), |session, _| {
                        session.seize_outcome(api_ptr)
                    });
                match seized {
                    Ok(Some(Ok(()))) => {
                        self.inner.with_block(|session, _| session.begin(api_ptr))?;
                        api_ptr
                    }
                    Ok(Some(Err(e))) | Err(e) => {
                        self.inner.discard_record(api_ptr);
                        return Err(e);
                    }
                    Ok(None) => {
                        warn!(%node, record = api_ptr, "seize timed out");
                        self.inner.discard_record(api_ptr);
                        return Err(ClusterError::Timeout);
                    }
                }
            }
        };
        Ok(Transaction::new(Arc::clone(&self.inner), api_ptr))
    }

    /// Prepare `tx` with a completion callback and send it along with every
    /// other prepared transaction of the session.
    pub fn execute_async(
        &self,
        tx: &Transaction,
        exec: ExecType,
        abort: AbortOption,
        callback: CompletionCallback,
    ) -> ClusterResult<()> {
        tx.execute_async_prepare(exec, abort, callback)?;
        self.send_prepared()?;
        Ok(())
    }

    /// Send every prepared transaction. Returns how many were sent.
    pub fn send_prepared(&self) -> ClusterResult<usize> {
        self.inner.with_block(|session, out| session.send_prepared(out))
    }

    /// Wait until at least `min_completed` asynchronous transactions have
    /// resolved or `timeout` elapses, then run the callbacks of every
    /// resolved transaction on this thread. Returns how many ran.
    ///
    /// Sent transactions waiting longer than the execute deadline are
    /// expired first.
    pub fn poll(&self, min_completed: usize, timeout: Duration) -> ClusterResult<usize> {
        let deadline = self.inner.config.execute_deadline();
        self.inner.wait(timeout, |session, out| {
            session.expire_overdue(deadline, out);
            (session.completed_len() >= min_completed).then_some(())
        })?;
        let ready = self.inner.with_block(|session, _| session.harvest())?;
        let count = ready.len();
        for (callback, outcome) in ready {
            callback(&outcome);
        }
        Ok(count)
    }

    /// Transactions sent and awaiting replies.
    pub fn in_flight(&self) -> ClusterResult<usize> {
        self.inner.with_block(|session, _| session.sent_len())
    }

    /// Release every pooled coordinator record and unregister the session.
    ///
    /// Transaction handles still alive keep the block registered until they
    /// are dropped.
    pub fn close(self) -> ClusterResult<()> {
        let pooled = self.inner.with_block(|session, out| {
            let pooled = session.pooled();
            pooled
                .into_iter()
                .filter(|api_ptr| session.release(out, *api_ptr).is_ok())
                .collect::<Vec<_>>()
        })?;
        if !pooled.is_empty() {
            let released = self.inner.wait(self.inner.config.response_timeout, |session, _| {
                pooled
                    .iter()
                    .all(|api_ptr| {
                        session.record(*api_ptr).is_none_or(|r| {
                            r.coordinator.connection_state() != ConnectionState::DisConnecting
                        })
                    })
                    .then_some(())
            })?;
            if released.is_none() {
                warn!(records = pooled.len(), "release not confirmed before close");
            }
        }
        info!(block = %self.inner.block, released = pooled.len(), "session closed");
        Ok(())
    }
}

/// Whether `error` means the chosen node went away, so another node may be
/// tried.
fn is_node_loss(error: &ClusterError) -> bool {
    matches!(
        error,
        ClusterError::Transport(TransportError::NodeUnreachable { .. })
            | ClusterError::NodeFailure { .. }
    ) || error.code() == ErrorCode::NODE_FAILURE
}
