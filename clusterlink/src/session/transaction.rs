use std::sync::Arc;

use tracing::{debug, warn};

use super::{CompletionCallback, ScanCursor, SessionInner};
use crate::error::{ClusterError, ClusterResult, ErrorSlot};
use crate::protocol::OperationType;
use crate::scan::ScanOptions;
use crate::transaction::{
    AbortOption, CommitState, CompletionState, ConnectionState, Coordinator, ExecType, OpHandle,
    Operation, SendState,
};
use crate::types::{NodeId, TransactionId};

/// Handle to one transaction of a [`Session`](super::Session).
///
/// Dropping the handle closes the transaction: an unresolved or started
/// transaction is rolled back, and the coordinator record is either
/// returned to the session pool or released.
pub struct Transaction {
    session: Arc<SessionInner>,
    api_ptr: u32,
    closed: bool,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("api_ptr", &self.api_ptr)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Transaction {
    pub(crate) fn new(session: Arc<SessionInner>, api_ptr: u32) -> Self {
        Self {
            session,
            api_ptr,
            closed: false,
        }
    }

    pub(crate) fn session(&self) -> &SessionInner {
        &self.session
    }

    pub(crate) fn api_ptr(&self) -> u32 {
        self.api_ptr
    }

    fn with_coordinator<R>(&self, f: impl FnOnce(&mut Coordinator) -> R) -> ClusterResult<R> {
        let api_ptr = self.api_ptr;
        self.session
            .with_block(|session, _| session.coordinator(api_ptr).map(f))?
    }

    fn define(
        &self,
        kind: OperationType,
        table: &str,
        key: Vec<u32>,
        values: Vec<u32>,
    ) -> ClusterResult<OpHandle> {
        let table = match self.session.resolver().resolve(table) {
            Ok(table) => table,
            Err(e) => {
                self.with_coordinator(|c| c.record_error(e.code(), e.to_string()))?;
                return Err(e);
            }
        };
        self.with_coordinator(|c| c.define(kind, table, key, values))?
    }

    /// Read the row with primary key `key`, returning attributes `columns`.
    pub fn read(&self, table: &str, key: Vec<u32>, columns: Vec<u32>) -> ClusterResult<OpHandle> {
        self.define(OperationType::Read, table, key, columns)
    }

    /// Insert a row.
    pub fn insert(&self, table: &str, key: Vec<u32>, values: Vec<u32>) -> ClusterResult<OpHandle> {
        self.define(OperationType::Insert, table, key, values)
    }

    /// Update an existing row.
    pub fn update(&self, table: &str, key: Vec<u32>, values: Vec<u32>) -> ClusterResult<OpHandle> {
        self.define(OperationType::Update, table, key, values)
    }

    /// Delete a row.
    pub fn delete(&self, table: &str, key: Vec<u32>) -> ClusterResult<OpHandle> {
        self.define(OperationType::Delete, table, key, Vec::new())
    }

    /// Insert or update a row.
    pub fn write(&self, table: &str, key: Vec<u32>, values: Vec<u32>) -> ClusterResult<OpHandle> {
        self.define(OperationType::Write, table, key, values)
    }

    /// Send the defined operations and block until the batch resolves.
    ///
    /// Waits up to `max_wait_rounds` rounds of `response_timeout`. When no
    /// reply arrives in time the transaction ends `Aborted` and
    /// `CompletedFailure`, and its coordinator record is released on close.
    pub fn execute(&self, exec: ExecType, abort: AbortOption) -> ClusterResult<()> {
        let api_ptr = self.api_ptr;
        self.session.with_block(|session, out| {
            session.prepare(api_ptr, exec, abort, None)?;
            session.send_prepared(out);
            Ok::<_, ClusterError>(())
        })??;

        let config = self.session.config();
        let rounds = config.max_wait_rounds;
        let mut resolved = false;
        for round in 1..=rounds {
            let done = self
                .session
                .wait(config.response_timeout, |session, _| {
                    (!session.in_flight(api_ptr)).then_some(())
                })?;
            if done.is_some() {
                resolved = true;
                break;
            }
            debug!(record = api_ptr, round, rounds, "still waiting for replies");
        }
        if !resolved {
            self.session
                .with_block(|session, out| session.expire(api_ptr, out))?;
        }
        self.with_coordinator(|c| c.outcome())?
    }

    /// Prepare an asynchronous execute. The transaction joins the session's
    /// prepared array and is sent by
    /// [`Session::send_prepared`](super::Session::send_prepared); `callback`
    /// runs from [`Session::poll`](super::Session::poll) once it resolves.
    pub fn execute_async_prepare(
        &self,
        exec: ExecType,
        abort: AbortOption,
        callback: CompletionCallback,
    ) -> ClusterResult<()> {
        let api_ptr = self.api_ptr;
        self.session
            .with_block(|session, _| session.prepare(api_ptr, exec, abort, Some(callback)))?
    }

    /// Keep the transaction alive on its coordinator.
    pub fn refresh(&self) -> ClusterResult<()> {
        let api_ptr = self.api_ptr;
        self.session
            .with_block(|session, out| session.heartbeat(out, api_ptr))?
    }

    /// Define a scan of `table`. The scan is started by
    /// [`ScanCursor::execute`] or by the next execute of this transaction.
    pub fn scan_table(&self, table: &str, options: ScanOptions) -> ClusterResult<ScanCursor<'_>> {
        let table = self.session.resolver().resolve(table)?;
        let api_ptr = self.api_ptr;
        let config = self.session.config();
        let slot = self
            .session
            .with_block(|session, _| session.define_scan(config, api_ptr, table, options))??;
        Ok(ScanCursor::new(self, slot))
    }

    /// Snapshot of an operation: status, error and returned data.
    pub fn operation_result(&self, handle: OpHandle) -> ClusterResult<Operation> {
        self.with_coordinator(|c| c.operations().get(handle).cloned())?
            .ok_or_else(|| ClusterError::invalid_usage(format!("no operation {}", handle.index())))
    }

    /// Transaction id.
    pub fn transaction_id(&self) -> ClusterResult<TransactionId> {
        self.with_coordinator(|c| c.transaction_id())
    }

    /// Node coordinating the transaction.
    pub fn node(&self) -> ClusterResult<Option<NodeId>> {
        self.with_coordinator(|c| c.node())
    }

    /// Commit state.
    pub fn commit_state(&self) -> ClusterResult<CommitState> {
        self.with_coordinator(|c| c.commit_state())
    }

    /// Completion state of the last execute.
    pub fn completion_state(&self) -> ClusterResult<CompletionState> {
        self.with_coordinator(|c| c.completion_state())
    }

    /// Connection state of the coordinator record.
    pub fn connection_state(&self) -> ClusterResult<ConnectionState> {
        self.with_coordinator(|c| c.connection_state())
    }

    /// Send state.
    pub fn send_state(&self) -> ClusterResult<SendState> {
        self.with_coordinator(|c| c.send_state())
    }

    /// Whether closing will release the coordinator record.
    pub fn release_on_close(&self) -> ClusterResult<bool> {
        self.with_coordinator(|c| c.release_on_close())
    }

    /// First error recorded on the transaction.
    pub fn error(&self) -> ClusterResult<ErrorSlot> {
        self.with_coordinator(|c| c.error().clone())
    }

    /// Close the transaction.
    ///
    /// A transaction that started but did not commit or abort is rolled
    /// back first. The coordinator record returns to the session pool
    /// unless a timeout or failed rollback left its server-side state
    /// unknown, in which case it is released.
    pub fn close(mut self) -> ClusterResult<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> ClusterResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let api_ptr = self.api_ptr;
        let config = self.session.config();

        let scans = self.with_coordinator(|c| c.scans().to_vec())?;
        for slot in scans {
            let stopping = self
                .session
                .with_block(|session, out| session.stop_scan(out, slot))?;
            if matches!(stopping, Ok(true)) {
                self.session.wait(config.scan_timeout, |session, _| {
                    session.scan_settled(slot)
                })?;
            }
            self.session
                .with_block(|session, _| session.close_scan(slot))?;
        }

        if self.with_coordinator(|c| c.is_in_flight())? {
            let done = self
                .session
                .wait(config.execute_deadline(), |session, _| {
                    (!session.in_flight(api_ptr)).then_some(())
                })?;
            if done.is_none() {
                self.session
                    .with_block(|session, out| session.expire(api_ptr, out))?;
            }
        }

        let (commit, connection) =
            self.with_coordinator(|c| (c.commit_state(), c.connection_state()))?;
        if connection == ConnectionState::Connected
            && matches!(commit, CommitState::Started | CommitState::NeedAbort)
            && let Err(e) = self.execute(ExecType::Rollback, AbortOption::AbortOnError)
        {
            warn!(record = api_ptr, error = %e, "rollback on close failed");
        }

        let (release, connection) =
            self.with_coordinator(|c| (c.release_on_close(), c.connection_state()))?;
        if connection != ConnectionState::Connected {
            self.session
                .with_block(|session, _| session.discard(api_ptr))?;
            return Ok(());
        }
        if !release {
            self.session.with_block(|session, _| session.park(api_ptr))?;
            return Ok(());
        }

        let sent = self
            .session
            .with_block(|session, out| session.release(out, api_ptr))?;
        if let Err(e) = sent {
            warn!(record = api_ptr, error = %e, "release not sent");
        } else {
            let released = self.session.wait(config.response_timeout, |session, _| {
                session
                    .record(api_ptr)
                    .is_none_or(|r| {
                        r.coordinator.connection_state() != ConnectionState::DisConnecting
                    })
                    .then_some(())
            })?;
            if released.is_none() {
                warn!(record = api_ptr, "release not confirmed");
            }
        }
        self.session
            .with_block(|session, _| session.discard(api_ptr))?;
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Err(e) = self.close_inner() {
            debug!(record = self.api_ptr, error = %e, "close on drop failed");
        }
    }
}
