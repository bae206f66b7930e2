//! Per-transaction state machine.
//!
//! [`Coordinator`] owns no transport. Preparation computes the next
//! [`SendState`], [`Coordinator::do_send`] turns it into signals, and the
//! `on_*` handlers fold replies back in. Each handler reports a
//! [`Progress`] so the caller knows when to move the transaction between
//! the session arrays.
//!
//! A batch is resolved when `completed_count == sent_count`. Counters are
//! bumped per reported operation, not per list length, so replies may
//! arrive in any order. A count above `sent_count` resolves the batch as a
//! failure with [`ErrorCode::TOO_MANY_OPERATIONS`].

use std::mem;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, warn};

use super::operation::{OpHandle, OperationArena};
use super::state::{CommitState, CompletionState, ConnectionState, ListState, SendState};
use super::{AbortOption, ExecType};
use crate::error::{ClusterError, ClusterResult, ErrorCode, ErrorSlot};
use crate::metadata::TableMetadata;
use crate::protocol::{
    Message, OperationType, RequestInfo, TcCommitConf, TcCommitRef, TcCommitReq, TcHbRep,
    TcKeyConf, TcKeyRef, TcKeyReq, TcReleaseConf, TcReleaseRef, TcReleaseReq, TcRollbackConf,
    TcRollbackRef, TcRollbackRep, TcRollbackReq, TcSeizeConf, TcSeizeRef, TcSeizeReq,
};
use crate::signal::Signal;
use crate::types::{BlockRef, NodeId, TransactionId};

/// Result of folding one reply into a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Not for this transaction, or not expected in its current state.
    Ignored,
    /// Accepted; more replies are needed.
    Pending,
    /// The outstanding request is resolved.
    Resolved,
    /// Resolved because more operations completed than were sent.
    Overflow,
}

impl Progress {
    /// Whether the transaction left the in-flight state.
    pub const fn is_resolved(self) -> bool {
        matches!(self, Self::Resolved | Self::Overflow)
    }
}

/// Signals produced by [`Coordinator::do_send`].
#[derive(Debug)]
pub struct SendOutcome {
    /// Signals to hand to the dispatcher, in order.
    pub signals: Vec<Signal>,
    /// Whether a reply is now outstanding.
    pub awaiting_reply: bool,
}

/// State of one client transaction.
#[derive(Debug)]
pub struct Coordinator {
    api_ptr: u32,
    long_sections: bool,
    node: Option<NodeId>,
    node_sequence: u32,
    tc_ptr: u32,
    transaction_id: TransactionId,
    connection: ConnectionState,
    commit: CommitState,
    completion: CompletionState,
    send: SendState,
    list: ListState,
    exec_type: ExecType,
    abort_option: AbortOption,
    operations: OperationArena,
    scans: Vec<u32>,
    pending: Vec<Signal>,
    sent_count: u32,
    completed_count: u32,
    commit_confirmed: bool,
    error: ErrorSlot,
    release_on_close: bool,
    sent_at: Option<Instant>,
}

impl Coordinator {
    /// Unconnected record addressed by `api_ptr` in replies.
    pub fn new(api_ptr: u32, long_sections: bool) -> Self {
        Self {
            api_ptr,
            long_sections,
            node: None,
            node_sequence: 0,
            tc_ptr: 0,
            transaction_id: TransactionId(0),
            connection: ConnectionState::NotConnected,
            commit: CommitState::NotStarted,
            completion: CompletionState::NotCompleted,
            send: SendState::Init,
            list: ListState::NotInList,
            exec_type: ExecType::NoCommit,
            abort_option: AbortOption::AbortOnError,
            operations: OperationArena::new(),
            scans: Vec::new(),
            pending: Vec::new(),
            sent_count: 0,
            completed_count: 0,
            commit_confirmed: false,
            error: ErrorSlot::new(),
            release_on_close: false,
            sent_at: None,
        }
    }

    // ---- seize / release ----

    /// Build the TCSEIZEREQ for `node` and enter `Connecting`.
    pub fn seize_request(
        &mut self,
        node: NodeId,
        sequence: u32,
        reply_to: BlockRef,
    ) -> ClusterResult<Signal> {
        if !matches!(
            self.connection,
            ConnectionState::NotConnected | ConnectionState::ConnectFailure
        ) {
            return Err(ClusterError::invalid_state(format!(
                "seize while {:?}",
                self.connection
            )));
        }
        let signal = TcSeizeReq {
            api_ptr: self.api_ptr,
            api_block_ref: reply_to,
        }
        .to_signal()?;
        self.node = Some(node);
        self.node_sequence = sequence;
        self.connection = ConnectionState::Connecting;
        self.error.clear();
        Ok(signal)
    }

    /// TCSEIZECONF.
    pub fn on_seize_conf(&mut self, conf: &TcSeizeConf) -> Progress {
        if self.connection != ConnectionState::Connecting {
            return Progress::Ignored;
        }
        self.tc_ptr = conf.tc_ptr;
        self.connection = ConnectionState::Connected;
        Progress::Resolved
    }

    /// TCSEIZEREF.
    pub fn on_seize_ref(&mut self, rejection: &TcSeizeRef) -> Progress {
        if self.connection != ConnectionState::Connecting {
            return Progress::Ignored;
        }
        self.error.set(rejection.error_code, "seize rejected");
        self.connection = ConnectionState::ConnectFailure;
        Progress::Resolved
    }

    /// Build the TCRELEASEREQ and enter `DisConnecting`.
    pub fn release_request(&mut self, reply_to: BlockRef) -> ClusterResult<Signal> {
        if self.connection != ConnectionState::Connected {
            return Err(ClusterError::invalid_state(format!(
                "release while {:?}",
                self.connection
            )));
        }
        let signal = TcReleaseReq {
            tc_ptr: self.tc_ptr,
            api_block_ref: reply_to,
            api_ptr: self.api_ptr,
        }
        .to_signal()?;
        self.connection = ConnectionState::DisConnecting;
        Ok(signal)
    }

    /// TCRELEASECONF.
    pub fn on_release_conf(&mut self, _conf: &TcReleaseConf) -> Progress {
        if self.connection != ConnectionState::DisConnecting {
            return Progress::Ignored;
        }
        self.connection = ConnectionState::NotConnected;
        self.tc_ptr = 0;
        Progress::Resolved
    }

    /// TCRELEASEREF. The record is unusable either way.
    pub fn on_release_ref(&mut self, rejection: &TcReleaseRef) -> Progress {
        if self.connection != ConnectionState::DisConnecting {
            return Progress::Ignored;
        }
        self.error.set(rejection.error_code, "release rejected");
        self.connection = ConnectionState::NotConnected;
        Progress::Resolved
    }

    // ---- definition ----

    /// Reset for a new logical transaction, keeping the seized record.
    pub fn begin(&mut self, transaction_id: TransactionId) {
        self.transaction_id = transaction_id;
        self.commit = CommitState::NotStarted;
        self.completion = CompletionState::NotCompleted;
        self.send = SendState::Init;
        self.exec_type = ExecType::NoCommit;
        self.abort_option = AbortOption::AbortOnError;
        self.operations.clear();
        self.scans.clear();
        self.pending.clear();
        self.sent_count = 0;
        self.completed_count = 0;
        self.commit_confirmed = false;
        self.error.clear();
        self.release_on_close = false;
        self.sent_at = None;
    }

    /// Add a key operation to the defined list.
    ///
    /// A definition error is recorded on the transaction and marks it
    /// [`CompletionState::DefinitionFailure`].
    pub fn define(
        &mut self,
        kind: OperationType,
        table: Arc<TableMetadata>,
        key: Vec<u32>,
        values: Vec<u32>,
    ) -> ClusterResult<OpHandle> {
        if matches!(self.commit, CommitState::Committed | CommitState::Aborted) {
            self.error.set_from(&ClusterError::AlreadyCompleted);
            return Err(ClusterError::AlreadyCompleted);
        }
        let result = table
            .check_key(&key)
            .and_then(|()| self.operations.define(kind, table, key, values));
        if let Err(e) = &result {
            self.error.set_from(e);
            self.completion = CompletionState::DefinitionFailure;
        }
        result
    }

    // ---- execute ----

    /// Decide what the next [`Coordinator::do_send`] emits.
    ///
    /// `prelude` holds scan start requests drained from idle cursors; they
    /// are sent ahead of anything else.
    pub fn execute_async_prepare(
        &mut self,
        exec: ExecType,
        abort: AbortOption,
        prelude: Vec<Signal>,
    ) -> ClusterResult<()> {
        if self.list != ListState::NotInList {
            return Err(ClusterError::invalid_state(format!(
                "transaction {} is {:?}",
                self.transaction_id, self.list
            )));
        }
        if self.connection != ConnectionState::Connected {
            return Err(ClusterError::invalid_state(format!(
                "transaction {} is {:?}",
                self.transaction_id, self.connection
            )));
        }

        let definition_failed = self.completion == CompletionState::DefinitionFailure
            && abort == AbortOption::AbortOnError;
        let keep_error = definition_failed
            || (self.commit == CommitState::NeedAbort && exec != ExecType::Rollback);
        if !keep_error {
            self.error.clear();
        }
        self.exec_type = exec;
        self.abort_option = abort;
        self.completion = CompletionState::NotCompleted;
        self.sent_count = 0;
        self.completed_count = 0;
        self.commit_confirmed = false;
        self.pending = prelude;
        let prelude_len = self.pending.len();

        if definition_failed {
            self.operations.discard_defined();
            self.send = SendState::AbortFail;
            return Ok(());
        }

        match (self.commit, exec) {
            (CommitState::Aborted, ExecType::Rollback) => {
                self.operations.discard_defined();
                self.completion = CompletionState::CompletedSuccess;
                self.send = SendState::Completed;
                return Ok(());
            }
            (CommitState::Committed | CommitState::Aborted, _) => {
                self.operations.discard_defined();
                self.error.set_from(&ClusterError::AlreadyCompleted);
                self.send = SendState::AbortFail;
                return Ok(());
            }
            (CommitState::NeedAbort, _) | (_, ExecType::Rollback) => {
                self.operations.discard_defined();
                if self.commit == CommitState::NotStarted {
                    self.commit = CommitState::Aborted;
                    self.completion = CompletionState::CompletedSuccess;
                    self.send = SendState::Completed;
                } else {
                    self.send = SendState::Abort;
                }
                return Ok(());
            }
            _ => {}
        }

        if self.operations.defined_count() == 0 {
            match (exec, self.commit) {
                (ExecType::Commit, CommitState::NotStarted) => {
                    self.commit = CommitState::Committed;
                    self.completion = CompletionState::CompletedSuccess;
                    self.send = SendState::Completed;
                }
                (ExecType::Commit, _) => self.send = SendState::CommitState,
                _ => {
                    self.completion = CompletionState::CompletedSuccess;
                    self.send = SendState::Completed;
                }
            }
            return Ok(());
        }

        let handles: Vec<OpHandle> = self.operations.defined().collect();
        let last = handles.len() - 1;
        for (position, handle) in handles.iter().enumerate() {
            let Some(op) = self.operations.get(*handle) else {
                continue;
            };
            let request = TcKeyReq {
                api_ptr: self.api_ptr,
                tc_ptr: self.tc_ptr,
                table_id: op.table.id,
                schema_version: op.table.version,
                info: RequestInfo {
                    start: self.commit == CommitState::NotStarted && position == 0,
                    commit: exec == ExecType::Commit && position == last,
                    execute: position == last,
                    ignore_error: abort == AbortOption::IgnoreError,
                    ..RequestInfo::new(op.kind)
                },
                transaction_id: self.transaction_id,
                api_op_ptr: self.api_op_ptr(*handle),
                attr_len: op.values.len() as u32,
                key: op.key.clone(),
                attr: op.values.clone(),
            };
            match request.to_signals(self.long_sections) {
                Ok(signals) => self.pending.extend(signals),
                Err(e) => {
                    self.error
                        .set(ErrorCode::OPERATION_DEFINITION, e.to_string());
                    self.pending.truncate(prelude_len);
                    self.send = SendState::AbortFail;
                    return Ok(());
                }
            }
        }
        self.sent_count = self.operations.start_executing() as u32;
        self.send = SendState::Operations;
        Ok(())
    }

    /// Emit the signals the current send state calls for and move to the
    /// matching "awaiting reply" state.
    ///
    /// # Errors
    ///
    /// `InvalidState` when nothing was prepared or a reply is already
    /// outstanding.
    pub fn do_send(&mut self) -> ClusterResult<SendOutcome> {
        let awaiting_reply = match self.send {
            SendState::Operations => {
                if self.commit == CommitState::NotStarted {
                    self.commit = CommitState::Started;
                }
                self.send = SendState::TcOp;
                true
            }
            SendState::Abort => {
                self.push_rollback()?;
                true
            }
            SendState::AbortFail => {
                if matches!(self.commit, CommitState::Started | CommitState::NeedAbort) {
                    self.push_rollback()?;
                    true
                } else {
                    self.completion = CompletionState::CompletedFailure;
                    self.send = SendState::Completed;
                    false
                }
            }
            SendState::CommitState => {
                let signal = TcCommitReq {
                    tc_ptr: self.tc_ptr,
                    transaction_id: self.transaction_id,
                }
                .to_signal()?;
                self.pending.push(signal);
                self.send = SendState::TcCommit;
                true
            }
            SendState::Completed => false,
            state @ (SendState::Init
            | SendState::TcOp
            | SendState::TcRollback
            | SendState::TcCommit) => {
                error!(
                    transaction = %self.transaction_id,
                    ?state,
                    "send requested in a state with nothing to send"
                );
                return Err(ClusterError::invalid_state(format!(
                    "cannot send in {state:?}"
                )));
            }
        };
        if awaiting_reply {
            self.sent_at = Some(Instant::now());
        }
        Ok(SendOutcome {
            signals: mem::take(&mut self.pending),
            awaiting_reply,
        })
    }

    fn push_rollback(&mut self) -> ClusterResult<()> {
        let signal = TcRollbackReq {
            tc_ptr: self.tc_ptr,
            transaction_id: self.transaction_id,
        }
        .to_signal()?;
        self.pending.push(signal);
        self.send = SendState::TcRollback;
        Ok(())
    }

    /// TCHBREP keeping an idle transaction alive.
    pub fn heartbeat(&self) -> ClusterResult<Signal> {
        if self.connection != ConnectionState::Connected {
            return Err(ClusterError::invalid_state("heartbeat without a seized record"));
        }
        Ok(TcHbRep {
            tc_ptr: self.tc_ptr,
            transaction_id: self.transaction_id,
        }
        .to_signal()?)
    }

    // ---- replies ----

    /// TCKEYCONF.
    pub fn on_key_conf(&mut self, conf: &TcKeyConf) -> Progress {
        if !self.accepts(conf.transaction_id, SendState::TcOp) {
            return Progress::Ignored;
        }
        let mut completed = 0;
        for (op_ptr, read_len) in &conf.operations {
            let Some(handle) = self.handle_of(*op_ptr) else {
                warn!(op_ptr, "confirmation for unknown operation");
                continue;
            };
            completed += match self.operations.confirm(handle, *read_len) {
                Some(done) => u32::from(done),
                None => u32::from(self.is_op_completed(handle)),
            };
        }
        if conf.committed {
            self.commit_confirmed = true;
        }
        self.completed_count += completed;
        self.check_batch()
    }

    /// Row data for a key read.
    pub fn on_row_data(&mut self, op_ptr: u32, transaction_id: TransactionId, data: &[u32]) -> Progress {
        if !self.accepts(transaction_id, SendState::TcOp) {
            return Progress::Ignored;
        }
        let Some(handle) = self.handle_of(op_ptr) else {
            return Progress::Ignored;
        };
        match self.operations.append_data(handle, data) {
            Some(true) => {
                self.completed_count += 1;
                self.check_batch()
            }
            Some(false) => Progress::Pending,
            None => Progress::Ignored,
        }
    }

    /// TCKEYREF.
    pub fn on_key_ref(&mut self, rejection: &TcKeyRef) -> Progress {
        if !self.accepts(rejection.transaction_id, SendState::TcOp) {
            return Progress::Ignored;
        }
        let Some(handle) = self.handle_of(rejection.api_op_ptr) else {
            return Progress::Ignored;
        };
        let message = format!("operation {} rejected", handle.index());
        if self
            .operations
            .reject(handle, rejection.error_code, &message)
            || self.is_op_completed(handle)
        {
            self.completed_count += 1;
        }
        if self.abort_option == AbortOption::AbortOnError {
            self.error.set(rejection.error_code, message);
            if self.commit == CommitState::Started {
                self.commit = CommitState::NeedAbort;
            }
        }
        self.check_batch()
    }

    /// TC_COMMITCONF.
    pub fn on_commit_conf(&mut self, conf: &TcCommitConf) -> Progress {
        if !self.accepts(conf.transaction_id, SendState::TcCommit) {
            return Progress::Ignored;
        }
        self.commit = CommitState::Committed;
        self.resolve(CompletionState::CompletedSuccess)
    }

    /// TC_COMMITREF.
    pub fn on_commit_ref(&mut self, rejection: &TcCommitRef) -> Progress {
        if !self.accepts(rejection.transaction_id, SendState::TcCommit) {
            return Progress::Ignored;
        }
        self.error.set(rejection.error_code, "commit rejected");
        self.commit = CommitState::Aborted;
        self.resolve(CompletionState::CompletedFailure)
    }

    /// TCROLLBACKCONF.
    pub fn on_rollback_conf(&mut self, conf: &TcRollbackConf) -> Progress {
        if !self.accepts(conf.transaction_id, SendState::TcRollback) {
            return Progress::Ignored;
        }
        self.commit = CommitState::Aborted;
        let completion = if self.error.is_set() {
            CompletionState::CompletedFailure
        } else {
            CompletionState::CompletedSuccess
        };
        self.resolve(completion)
    }

    /// TCROLLBACKREF. The coordinator state is unknown, so the record is
    /// released on close.
    pub fn on_rollback_ref(&mut self, rejection: &TcRollbackRef) -> Progress {
        if !self.accepts(rejection.transaction_id, SendState::TcRollback) {
            return Progress::Ignored;
        }
        self.error.set(rejection.error_code, "rollback rejected");
        self.commit = CommitState::Aborted;
        self.release_on_close = true;
        self.resolve(CompletionState::CompletedFailure)
    }

    /// TCROLLBACKREP: the data node aborted the transaction on its own.
    pub fn on_rollback_rep(&mut self, report: &TcRollbackRep) -> Progress {
        if report.transaction_id != self.transaction_id {
            return Progress::Ignored;
        }
        self.error.set(report.error_code, "transaction aborted by data node");
        self.commit = CommitState::Aborted;
        if self.send.is_awaiting_reply() {
            self.operations
                .fail_executing(report.error_code, "transaction aborted");
            self.resolve(CompletionState::CompletedFailure)
        } else {
            Progress::Pending
        }
    }

    // ---- failures ----

    /// `node` failed. Resolves the transaction when it had replies or scan
    /// results outstanding there.
    pub fn on_node_failure(&mut self, node: NodeId, scans_active: bool) -> Progress {
        if self.node != Some(node) {
            return Progress::Ignored;
        }
        self.connection = match self.connection {
            ConnectionState::Connecting => {
                self.error
                    .set(ErrorCode::NODE_FAILURE, format!("{node} failed during seize"));
                ConnectionState::ConnectFailure
            }
            _ => ConnectionState::NotConnected,
        };
        if self.send.is_awaiting_reply() || scans_active {
            self.error.set_from(&ClusterError::NodeFailure { node });
            self.operations
                .fail_executing(ErrorCode::NODE_FAILURE, "node failure");
            self.commit = CommitState::Aborted;
            return self.resolve(CompletionState::CompletedFailure);
        }
        if self.commit == CommitState::Started {
            self.error.set_from(&ClusterError::NodeFailure { node });
            self.commit = CommitState::Aborted;
        }
        Progress::Pending
    }

    /// A blocking wait gave up.
    pub fn on_timeout(&mut self) {
        warn!(transaction = %self.transaction_id, send = ?self.send, "transaction timed out");
        self.error.set_from(&ClusterError::Timeout);
        self.operations
            .fail_executing(ErrorCode::RESPONSE_TIMEOUT, "timeout");
        self.commit = CommitState::Aborted;
        self.release_on_close = true;
        self.resolve(CompletionState::CompletedFailure);
    }

    /// Sending the prepared signals failed after retries.
    pub fn on_send_failure(&mut self, cause: &ClusterError) {
        self.error.set_from(cause);
        self.operations
            .fail_executing(ErrorCode::SEND_FAILED, "send failed");
        self.commit = CommitState::Aborted;
        self.release_on_close = true;
        self.resolve(CompletionState::CompletedFailure);
    }

    fn check_batch(&mut self) -> Progress {
        if self.completed_count > self.sent_count {
            warn!(
                transaction = %self.transaction_id,
                sent = self.sent_count,
                completed = self.completed_count,
                "more operations completed than sent"
            );
            self.error.set_from(&ClusterError::TooManyOperations {
                sent: self.sent_count,
                completed: self.completed_count,
            });
            if self.commit == CommitState::Started {
                self.commit = CommitState::NeedAbort;
            }
            self.resolve(CompletionState::CompletedFailure);
            return Progress::Overflow;
        }
        if self.completed_count < self.sent_count {
            return Progress::Pending;
        }
        if self.error.is_set() {
            return self.resolve(CompletionState::CompletedFailure);
        }
        if self.exec_type == ExecType::Commit {
            if self.commit_confirmed {
                self.commit = CommitState::Committed;
                return self.resolve(CompletionState::CompletedSuccess);
            }
            self.error.set(
                ErrorCode::UNCONFIRMED_COMMIT,
                "batch completed without commit confirmation",
            );
            self.commit = CommitState::Aborted;
            return self.resolve(CompletionState::CompletedFailure);
        }
        self.resolve(CompletionState::CompletedSuccess)
    }

    fn resolve(&mut self, completion: CompletionState) -> Progress {
        debug!(transaction = %self.transaction_id, ?completion, commit = ?self.commit, "resolved");
        self.completion = completion;
        self.send = SendState::Completed;
        Progress::Resolved
    }

    fn accepts(&self, transaction_id: TransactionId, awaited: SendState) -> bool {
        if transaction_id != self.transaction_id {
            debug!(
                expected = %self.transaction_id,
                got = %transaction_id,
                "reply for another transaction"
            );
            return false;
        }
        if self.send != awaited || self.completion != CompletionState::NotCompleted {
            debug!(transaction = %self.transaction_id, send = ?self.send, "unexpected reply");
            return false;
        }
        true
    }

    fn handle_of(&self, op_ptr: u32) -> Option<OpHandle> {
        let handle = OpHandle((op_ptr & 0xFFFF) as u16);
        (op_ptr >> 16 == self.api_ptr && self.operations.get(handle).is_some()).then_some(handle)
    }

    fn is_op_completed(&self, handle: OpHandle) -> bool {
        self.operations
            .get(handle)
            .is_some_and(|op| op.status() == super::OperationStatus::Completed)
    }

    /// Operation pointer echoed by confirmations and row data.
    pub fn api_op_ptr(&self, handle: OpHandle) -> u32 {
        (self.api_ptr << 16) | u32::from(handle.index())
    }

    // ---- accessors ----

    /// Pointer the data node echoes in replies.
    pub fn api_ptr(&self) -> u32 {
        self.api_ptr
    }

    /// Node the record is seized on.
    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    /// Sequence number of [`Coordinator::node`] at seize time.
    pub fn node_sequence(&self) -> u32 {
        self.node_sequence
    }

    /// Coordinator connect pointer.
    pub fn tc_ptr(&self) -> u32 {
        self.tc_ptr
    }

    /// Current transaction id.
    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    /// Connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    /// Commit state.
    pub fn commit_state(&self) -> CommitState {
        self.commit
    }

    /// Completion state.
    pub fn completion_state(&self) -> CompletionState {
        self.completion
    }

    /// Send state.
    pub fn send_state(&self) -> SendState {
        self.send
    }

    /// Session array membership.
    pub fn list_state(&self) -> ListState {
        self.list
    }

    pub(crate) fn set_list_state(&mut self, list: ListState) {
        self.list = list;
    }

    /// Whether a reply is outstanding.
    pub fn is_in_flight(&self) -> bool {
        self.send.is_awaiting_reply() && self.completion == CompletionState::NotCompleted
    }

    /// When the outstanding request was sent.
    pub fn sent_at(&self) -> Option<Instant> {
        self.sent_at
    }

    /// First error recorded.
    pub fn error(&self) -> &ErrorSlot {
        &self.error
    }

    pub(crate) fn record_error(&mut self, code: ErrorCode, message: impl Into<String>) {
        self.error.set(code, message);
    }

    /// Whether closing must release the coordinator record.
    pub fn release_on_close(&self) -> bool {
        self.release_on_close
    }

    /// Operations sent in the current batch.
    pub fn sent_count(&self) -> u32 {
        self.sent_count
    }

    /// Operations reported complete in the current batch.
    pub fn completed_count(&self) -> u32 {
        self.completed_count
    }

    /// Operations of the transaction.
    pub fn operations(&self) -> &OperationArena {
        &self.operations
    }

    /// Scan slots owned by the transaction.
    pub fn scans(&self) -> &[u32] {
        &self.scans
    }

    pub(crate) fn add_scan(&mut self, scan: u32) {
        self.scans.push(scan);
    }

    pub(crate) fn remove_scan(&mut self, scan: u32) {
        self.scans.retain(|s| *s != scan);
    }

    /// Outcome of the last resolved execute.
    pub fn outcome(&self) -> ClusterResult<()> {
        match self.completion {
            CompletionState::CompletedSuccess => Ok(()),
            CompletionState::NotCompleted => {
                Err(ClusterError::invalid_state("transaction not resolved"))
            }
            _ => Err(self
                .error
                .to_error()
                .unwrap_or_else(|| ClusterError::invalid_state("failed without error code"))),
        }
    }
}
