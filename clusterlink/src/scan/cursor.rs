//! Scan cursor protocol state.
//!
//! A batch is assembled from one SCAN_TABCONF and any number of
//! SCAN_TABINFO signals, in any order, interleaved with row data:
//!
//! ```text
//! SCAN_TABREQ ──▶
//!             ◀── TRANSID_AI (rows, per receiver)
//!             ◀── SCAN_TABINFO { (index, rows) ... }
//!             ◀── SCAN_TABCONF { expected_ops, end_of_scan, batch_no }
//!             ◀── SCAN_TABINFO { ... }
//! batch ready: conf seen, named receivers == expected_ops,
//!              every named receiver holds exactly its reported rows
//! SCAN_NEXTREQ { batch_no + 1 } ──▶   (or { stop } to close)
//! ```
//!
//! Receivers become ready in the order the info signals name them, and
//! rows are delivered in that order.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::receiver::ReceiverPool;
use crate::error::{ClusterError, ClusterResult, ErrorCode, ErrorSlot};
use crate::metadata::TableMetadata;
use crate::protocol::{
    MAX_BATCH_NO, Message, ScanInfoPair, ScanNextReq, ScanTabConf, ScanTabInfo, ScanTabRef, ScanTabReq,
};
use crate::signal::Signal;
use crate::types::{NodeId, TransactionId};

/// Cursor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanStatus {
    /// Defined, not started.
    Idle,
    /// SCAN_TABREQ sent, first batch pending.
    Started,
    /// SCAN_NEXTREQ sent, batch pending.
    FetchingBatch,
    /// A complete batch is buffered.
    BatchReady,
    /// Every row was delivered, or the cursor was closed.
    Finished,
    /// Stop requested, waiting for the final confirmation.
    Closing,
    /// Failed; see the scan error.
    Error,
}

/// Outcome of one `next_scan_result` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStep {
    /// A row, more may follow.
    Row(Vec<u32>),
    /// No rows remain.
    Finished,
    /// The buffered batch is exhausted and fetching was not allowed.
    NeedFetch,
}

impl ScanStep {
    /// Numeric status: 0 row, 1 finished, 2 fetch needed.
    pub const fn code(&self) -> i32 {
        match self {
            Self::Row(_) => 0,
            Self::Finished => 1,
            Self::NeedFetch => 2,
        }
    }
}

/// Scan parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanOptions {
    /// Parallel streams; defaults to the client configuration, capped by
    /// the table's fragment count.
    pub parallelism: Option<u32>,
    /// Rows per stream per batch.
    pub batch_rows: Option<u32>,
    /// Attribute ids to return.
    pub attributes: Vec<u32>,
}

impl ScanOptions {
    /// Set the parallelism.
    pub fn with_parallelism(mut self, parallelism: u32) -> Self {
        self.parallelism = Some(parallelism);
        self
    }

    /// Set the batch size.
    pub fn with_batch_rows(mut self, rows: u32) -> Self {
        self.batch_rows = Some(rows);
        self
    }

    /// Set the projected attributes.
    pub fn with_attributes(mut self, attributes: Vec<u32>) -> Self {
        self.attributes = attributes;
        self
    }
}

/// What a reply did to the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanProgress {
    /// Not for this cursor, a duplicate, or out of state.
    Ignored,
    /// Accepted; the batch is still incomplete.
    Pending,
    /// The batch became ready, or the cursor finished closing.
    Ready,
    /// The cursor failed.
    Failed,
}

/// Result of looking for the next buffered row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanPoll {
    /// A buffered row.
    Row(Vec<u32>),
    /// The batch is exhausted and more batches exist.
    Exhausted,
    /// No rows remain.
    Finished,
    /// The current batch is not ready yet.
    Waiting,
}

/// Protocol state of one scan.
#[derive(Debug)]
pub struct ScanState {
    api_ptr: u32,
    owner: u32,
    node: Option<NodeId>,
    tc_ptr: u32,
    transaction_id: TransactionId,
    table: Arc<TableMetadata>,
    parallelism: u32,
    batch_rows: u32,
    attributes: Vec<u32>,
    status: ScanStatus,
    receivers: Vec<u32>,
    batch_no: u32,
    conf: Option<ScanTabConf>,
    infos_received: u32,
    named: Vec<ScanInfoPair>,
    ready: VecDeque<u16>,
    end_of_scan: bool,
    close_needed: bool,
    rows_fetched: u64,
    rows_delivered: u64,
    error: ErrorSlot,
}

impl ScanState {
    /// Idle cursor `api_ptr` owned by transaction `owner`.
    pub fn new(
        api_ptr: u32,
        owner: u32,
        table: Arc<TableMetadata>,
        parallelism: u32,
        batch_rows: u32,
        attributes: Vec<u32>,
    ) -> Self {
        let parallelism = parallelism.clamp(1, table.fragment_count.max(1));
        Self {
            api_ptr,
            owner,
            node: None,
            tc_ptr: 0,
            transaction_id: TransactionId(0),
            table,
            parallelism,
            batch_rows: batch_rows.max(1),
            attributes,
            status: ScanStatus::Idle,
            receivers: Vec::new(),
            batch_no: 0,
            conf: None,
            infos_received: 0,
            named: Vec::new(),
            ready: VecDeque::new(),
            end_of_scan: false,
            close_needed: false,
            rows_fetched: 0,
            rows_delivered: 0,
            error: ErrorSlot::new(),
        }
    }

    /// Take receivers and build the SCAN_TABREQ.
    pub fn start_request(
        &mut self,
        node: NodeId,
        tc_ptr: u32,
        transaction_id: TransactionId,
        pool: &mut ReceiverPool,
    ) -> ClusterResult<Signal> {
        if self.status != ScanStatus::Idle {
            return Err(ClusterError::invalid_usage(format!(
                "scan already {:?}",
                self.status
            )));
        }
        let receivers = pool.acquire(self.parallelism as usize)?;
        let request = ScanTabReq {
            api_ptr: self.api_ptr,
            tc_ptr,
            table_id: self.table.id,
            schema_version: self.table.version,
            batch_rows: self.batch_rows,
            transaction_id,
            receivers: receivers.clone(),
            attributes: self.attributes.clone(),
        };
        let signal = match request.to_signal() {
            Ok(signal) => signal,
            Err(e) => {
                pool.release(&receivers);
                return Err(e.into());
            }
        };
        self.receivers = receivers;
        self.node = Some(node);
        self.tc_ptr = tc_ptr;
        self.transaction_id = transaction_id;
        self.status = ScanStatus::Started;
        info!(
            scan = self.api_ptr,
            table = %self.table.name,
            parallelism = self.parallelism,
            %node,
            "scan started"
        );
        Ok(signal)
    }

    /// SCAN_TABCONF.
    pub fn on_conf(&mut self, conf: &ScanTabConf, pool: &mut ReceiverPool) -> ScanProgress {
        if conf.transaction_id != self.transaction_id {
            return ScanProgress::Ignored;
        }
        if self.status == ScanStatus::Closing {
            if conf.end_of_scan {
                self.status = ScanStatus::Finished;
                info!(scan = self.api_ptr, "scan closed");
                return ScanProgress::Ready;
            }
            return ScanProgress::Ignored;
        }
        if !self.is_fetching() {
            warn!(scan = self.api_ptr, status = ?self.status, "confirmation out of state");
            return ScanProgress::Ignored;
        }
        if conf.batch_no != self.batch_no {
            warn!(
                scan = self.api_ptr,
                expected = self.batch_no,
                got = conf.batch_no,
                "confirmation for another batch"
            );
            return ScanProgress::Ignored;
        }
        if self.conf.is_some() {
            warn!(scan = self.api_ptr, batch = self.batch_no, "duplicate confirmation");
            return ScanProgress::Ignored;
        }
        debug!(
            scan = self.api_ptr,
            batch = conf.batch_no,
            expected = conf.expected_ops,
            end = conf.end_of_scan,
            "scan confirmation"
        );
        self.conf = Some(*conf);
        self.end_of_scan = conf.end_of_scan;
        self.check_ready(pool)
    }

    /// SCAN_TABINFO.
    pub fn on_info(&mut self, info: &ScanTabInfo, pool: &mut ReceiverPool) -> ScanProgress {
        if info.transaction_id != self.transaction_id || !self.is_fetching() {
            return ScanProgress::Ignored;
        }
        if info.batch_no != self.batch_no {
            warn!(scan = self.api_ptr, got = info.batch_no, "info for another batch");
            return ScanProgress::Ignored;
        }
        self.infos_received += 1;
        for pair in &info.pairs {
            if usize::from(pair.index) >= self.receivers.len() {
                return self.fail(
                    ErrorCode::TOO_MANY_OPERATIONS,
                    format!("receiver index {} out of range", pair.index),
                );
            }
            if self.named.iter().any(|p| p.index == pair.index) {
                return self.fail(
                    ErrorCode::TOO_MANY_OPERATIONS,
                    format!("receiver {} reported twice", pair.index),
                );
            }
            self.named.push(*pair);
        }
        self.check_ready(pool)
    }

    /// Row data for receiver `receiver_id`.
    pub fn on_row(&mut self, receiver_id: u32, words: &[u32], pool: &mut ReceiverPool) -> ScanProgress {
        if !self.is_fetching() || !self.receivers.contains(&receiver_id) {
            return ScanProgress::Ignored;
        }
        let Some(receiver) = pool.get_mut(receiver_id) else {
            return ScanProgress::Ignored;
        };
        receiver.push_row(words);
        self.rows_fetched += 1;
        self.check_ready(pool)
    }

    /// SCAN_TABREF.
    pub fn on_ref(&mut self, rejection: &ScanTabRef) -> ScanProgress {
        if rejection.transaction_id != self.transaction_id
            || matches!(self.status, ScanStatus::Idle | ScanStatus::Finished)
        {
            return ScanProgress::Ignored;
        }
        self.close_needed = rejection.close_needed;
        if self.status == ScanStatus::Closing {
            self.status = ScanStatus::Finished;
            return ScanProgress::Ready;
        }
        self.fail(rejection.error_code, "scan rejected")
    }

    /// `node` failed. Returns true when the cursor had results outstanding
    /// there.
    pub fn on_node_failure(&mut self, node: NodeId) -> bool {
        if self.node != Some(node) {
            return false;
        }
        match self.status {
            ScanStatus::Started | ScanStatus::FetchingBatch => {}
            ScanStatus::BatchReady if !self.end_of_scan => {}
            ScanStatus::Closing => {
                self.status = ScanStatus::Finished;
                return false;
            }
            _ => return false,
        }
        self.close_needed = false;
        self.fail(
            ErrorCode::NODE_FAILURE,
            format!("{node} failed during scan"),
        );
        true
    }

    /// The scan wait gave up.
    pub fn on_timeout(&mut self) {
        self.close_needed = true;
        self.fail(ErrorCode::RESPONSE_TIMEOUT, "scan timed out");
    }

    /// A scan request could not be sent.
    pub fn on_send_failure(&mut self, cause: &ClusterError) {
        self.close_needed = false;
        self.fail(cause.code(), cause.to_string());
    }

    /// Next buffered row, if the batch allows.
    pub fn poll_row(&mut self, pool: &mut ReceiverPool) -> ClusterResult<ScanPoll> {
        match self.status {
            ScanStatus::Error => Err(self.failure()),
            ScanStatus::Idle => Err(ClusterError::invalid_usage("scan not executed")),
            ScanStatus::Finished => Ok(ScanPoll::Finished),
            ScanStatus::Started | ScanStatus::FetchingBatch | ScanStatus::Closing => {
                Ok(ScanPoll::Waiting)
            }
            ScanStatus::BatchReady => {
                while let Some(position) = self.ready.front() {
                    let row = self
                        .receivers
                        .get(usize::from(*position))
                        .and_then(|id| pool.get_mut(*id))
                        .and_then(|r| r.take_row());
                    match row {
                        Some(row) => {
                            self.rows_delivered += 1;
                            return Ok(ScanPoll::Row(row));
                        }
                        None => {
                            self.ready.pop_front();
                        }
                    }
                }
                if self.end_of_scan {
                    self.status = ScanStatus::Finished;
                    info!(
                        scan = self.api_ptr,
                        rows = self.rows_delivered,
                        "scan finished"
                    );
                    return Ok(ScanPoll::Finished);
                }
                Ok(ScanPoll::Exhausted)
            }
        }
    }

    /// Build the SCAN_NEXTREQ for the next batch and reset batch state.
    pub fn next_request(&mut self, pool: &mut ReceiverPool) -> ClusterResult<Signal> {
        if self.status != ScanStatus::BatchReady || !self.ready.is_empty() || self.end_of_scan {
            return Err(ClusterError::invalid_usage(format!(
                "cannot fetch while {:?}",
                self.status
            )));
        }
        // One batch is outstanding at a time, so wrapping cannot alias it.
        self.batch_no = if self.batch_no >= MAX_BATCH_NO {
            0
        } else {
            self.batch_no + 1
        };
        self.conf = None;
        self.infos_received = 0;
        self.named.clear();
        for id in &self.receivers {
            if let Some(receiver) = pool.get_mut(*id) {
                receiver.reset();
            }
        }
        self.status = ScanStatus::FetchingBatch;
        Ok(ScanNextReq {
            tc_ptr: self.tc_ptr,
            stop: false,
            batch_no: self.batch_no,
            transaction_id: self.transaction_id,
        }
        .to_signal()?)
    }

    /// Build the stop request, or `None` when nothing is open on the data
    /// node.
    pub fn stop_request(&mut self) -> ClusterResult<Option<Signal>> {
        match self.status {
            ScanStatus::Idle => {
                self.status = ScanStatus::Finished;
                return Ok(None);
            }
            ScanStatus::Finished | ScanStatus::Closing => return Ok(None),
            ScanStatus::Error if !self.close_needed => return Ok(None),
            ScanStatus::BatchReady if self.end_of_scan => {
                self.status = ScanStatus::Finished;
                return Ok(None);
            }
            _ => {}
        }
        self.status = ScanStatus::Closing;
        self.close_needed = false;
        Ok(Some(
            ScanNextReq {
                tc_ptr: self.tc_ptr,
                stop: true,
                batch_no: self.batch_no,
                transaction_id: self.transaction_id,
            }
            .to_signal()?,
        ))
    }

    /// Return receivers to `pool`.
    pub fn release(&mut self, pool: &mut ReceiverPool) {
        pool.release(&self.receivers);
        self.receivers.clear();
    }

    fn check_ready(&mut self, pool: &mut ReceiverPool) -> ScanProgress {
        for pair in &self.named {
            let received = self
                .receivers
                .get(usize::from(pair.index))
                .and_then(|id| pool.get_mut(*id))
                .map_or(0, |r| r.received());
            if received > u32::from(pair.rows) {
                let message = format!(
                    "receiver {} holds {received} rows, {} reported",
                    pair.index, pair.rows
                );
                return self.fail(ErrorCode::TOO_MANY_OPERATIONS, message);
            }
        }
        let Some(conf) = self.conf else {
            return ScanProgress::Pending;
        };
        let expected = usize::from(conf.expected_ops);
        if self.named.len() > expected {
            let message = format!("{} receivers reported, {expected} expected", self.named.len());
            return self.fail(ErrorCode::TOO_MANY_OPERATIONS, message);
        }
        if self.named.len() < expected {
            return ScanProgress::Pending;
        }
        let complete = self.named.iter().all(|pair| {
            self.receivers
                .get(usize::from(pair.index))
                .and_then(|id| pool.get_mut(*id))
                .is_some_and(|r| r.received() == u32::from(pair.rows))
        });
        if !complete {
            return ScanProgress::Pending;
        }
        self.ready = self.named.iter().map(|p| p.index).collect();
        self.status = ScanStatus::BatchReady;
        debug!(
            scan = self.api_ptr,
            batch = self.batch_no,
            receivers = self.ready.len(),
            infos = self.infos_received,
            "batch ready"
        );
        ScanProgress::Ready
    }

    fn fail(&mut self, code: ErrorCode, message: impl Into<String>) -> ScanProgress {
        let message = message.into();
        if code == ErrorCode::TOO_MANY_OPERATIONS {
            warn!(scan = self.api_ptr, %message, "scan protocol error");
        }
        self.error.set(code, message);
        self.status = ScanStatus::Error;
        ScanProgress::Failed
    }

    fn failure(&self) -> ClusterError {
        self.error
            .to_error()
            .unwrap_or_else(|| ClusterError::invalid_state("scan failed"))
    }

    fn is_fetching(&self) -> bool {
        matches!(self.status, ScanStatus::Started | ScanStatus::FetchingBatch)
    }

    /// Scan slot.
    pub fn api_ptr(&self) -> u32 {
        self.api_ptr
    }

    /// Owning transaction.
    pub fn owner(&self) -> u32 {
        self.owner
    }

    /// Node the scan runs on.
    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    /// Current state.
    pub fn status(&self) -> ScanStatus {
        self.status
    }

    /// Whether a confirmation was accepted for the current batch.
    pub fn has_confirmation(&self) -> bool {
        self.conf.is_some()
    }

    /// Whether results are outstanding on the data node.
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            ScanStatus::Started | ScanStatus::FetchingBatch | ScanStatus::Closing
        ) || (self.status == ScanStatus::BatchReady && !self.end_of_scan)
    }

    /// First error recorded.
    pub fn error(&self) -> &ErrorSlot {
        &self.error
    }

    /// Current batch number.
    pub fn batch_no(&self) -> u32 {
        self.batch_no
    }

    /// Parallel streams.
    pub fn parallelism(&self) -> u32 {
        self.parallelism
    }

    /// Rows received from the data node.
    pub fn rows_fetched(&self) -> u64 {
        self.rows_fetched
    }

    /// Rows handed to the application.
    pub fn rows_delivered(&self) -> u64 {
        self.rows_delivered
    }
}
