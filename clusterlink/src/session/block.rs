//! The handler a session registers with the dispatcher.
//!
//! Everything here runs with the dispatcher lock held: replies from the
//! receive thread, node status changes, and the application-side calls made
//! through [`Dispatcher::with_handler`](crate::dispatch::Dispatcher::with_handler).

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{CompletionCallback, TransactionOutcome};
use crate::config::ClientConfig;
use crate::dispatch::{NodeEvent, Outbound, SignalHandler};
use crate::error::{ClusterError, ClusterResult};
use crate::metadata::TableMetadata;
use crate::protocol::{
    Message, NodeFailRep, ScanTabConf, ScanTabInfo, ScanTabRef, TcCommitConf, TcCommitRef,
    TcKeyConf, TcKeyRef, TcReleaseConf, TcReleaseRef, TcRollbackConf, TcRollbackRef,
    TcRollbackRep, TcSeizeConf, TcSeizeRef, TransIdAi,
};
use crate::scan::{
    ReceiverPool, SCAN_RECEIVER_FLAG, ScanOptions, ScanPoll, ScanProgress, ScanState, ScanStatus,
    ScanStep,
};
use crate::signal::{Signal, SignalChain, SignalKind};
use crate::transaction::{
    AbortOption, CommitState, ConnectionState, Coordinator, ExecType, ListState, Progress,
    TransactionLists,
};
use crate::types::{BlockNumber, BlockRef, NodeId, TransactionId};

/// Largest transaction pool a session may have; the record index must fit
/// in the upper half of an operation pointer.
const MAX_RECORDS: usize = 0x7FFF;

pub(crate) struct Record {
    pub(crate) coordinator: Coordinator,
    callback: Option<CompletionCallback>,
    in_use: bool,
}

/// How a transaction record was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Acquired {
    /// A pooled record already seized on the node.
    Ready(u32),
    /// A TCSEIZEREQ was sent; wait for the reply.
    Seizing(u32),
}

/// What a scan step asks the caller to do.
#[derive(Debug)]
pub(crate) enum ScanAction {
    Step(ScanStep),
    Wait,
}

pub(crate) struct SessionBlock {
    block: BlockNumber,
    records: Vec<Option<Record>>,
    lists: TransactionLists,
    scans: Vec<Option<ScanState>>,
    receivers: ReceiverPool,
    next_transaction_id: TransactionId,
    pool_size: usize,
    long_sections: bool,
}

impl SessionBlock {
    pub(crate) fn new(config: &ClientConfig) -> ClusterResult<Self> {
        if config.transaction_pool_size > MAX_RECORDS {
            return Err(ClusterError::Config {
                message: format!(
                    "transaction_pool_size {} exceeds {MAX_RECORDS}",
                    config.transaction_pool_size
                ),
            });
        }
        Ok(Self {
            block: BlockNumber(0),
            records: Vec::new(),
            lists: TransactionLists::new(),
            scans: Vec::new(),
            receivers: ReceiverPool::new(config.receiver_pool_size),
            next_transaction_id: TransactionId(0),
            pool_size: config.transaction_pool_size,
            long_sections: config.use_long_sections,
        })
    }

    /// Bind to the block number the dispatcher assigned.
    pub(crate) fn attach(&mut self, block: BlockNumber, node_id: NodeId) {
        self.block = block;
        self.next_transaction_id =
            TransactionId((u64::from(block.get()) << 48) | (u64::from(node_id.get()) << 32));
    }

    fn reply_to(&self, out: &Outbound) -> BlockRef {
        BlockRef::new(out.config().node_id, self.block)
    }

    // ---- transaction records ----

    /// Take a record for a transaction on `node`, reusing a pooled one when
    /// it is still seized on the same incarnation of the node.
    pub(crate) fn acquire(&mut self, out: &mut Outbound, node: NodeId) -> ClusterResult<Acquired> {
        let sequence = out.membership().node_sequence(node);
        let mut stale = Vec::new();
        let mut pooled = None;
        for (index, slot) in self.records.iter().enumerate() {
            let Some(record) = slot else { continue };
            if record.in_use || record.coordinator.node() != Some(node) {
                continue;
            }
            if record.coordinator.connection_state() == ConnectionState::Connected
                && record.coordinator.node_sequence() == sequence
            {
                pooled = Some(index);
                break;
            }
            stale.push(index);
        }
        for index in stale {
            debug!(%node, record = index, "dropping stale pooled record");
            self.records[index] = None;
        }
        if let Some(index) = pooled {
            let api_ptr = index as u32;
            self.begin(api_ptr);
            return Ok(Acquired::Ready(api_ptr));
        }

        let index = match self.records.iter().position(Option::is_none) {
            Some(index) => index,
            None if self.records.len() < self.pool_size => {
                self.records.push(None);
                self.records.len() - 1
            }
            None => return Err(ClusterError::PoolExhausted { pool: "transactions" }),
        };
        let api_ptr = index as u32;
        let mut coordinator = Coordinator::new(api_ptr, self.long_sections);
        let signal = coordinator.seize_request(node, sequence, self.reply_to(out))?;
        out.send(node, self.block, signal)?;
        self.records[index] = Some(Record {
            coordinator,
            callback: None,
            in_use: true,
        });
        Ok(Acquired::Seizing(api_ptr))
    }

    /// `Some` once the seize for `api_ptr` is resolved.
    pub(crate) fn seize_outcome(&mut self, api_ptr: u32) -> Option<ClusterResult<()>> {
        let Some(record) = self.record(api_ptr) else {
            return Some(Err(ClusterError::invalid_state("record vanished during seize")));
        };
        match record.coordinator.connection_state() {
            ConnectionState::Connecting => None,
            ConnectionState::Connected => Some(Ok(())),
            _ => Some(Err(record
                .coordinator
                .error()
                .to_error()
                .unwrap_or(ClusterError::NoAliveNode))),
        }
    }

    /// Start a new logical transaction on a seized record.
    pub(crate) fn begin(&mut self, api_ptr: u32) {
        let transaction_id = self.next_transaction_id;
        self.next_transaction_id = transaction_id.next();
        if let Some(record) = self.record_mut(api_ptr) {
            record.in_use = true;
            record.callback = None;
            record.coordinator.begin(transaction_id);
            debug!(record = api_ptr, transaction = %transaction_id, "transaction started");
        }
    }

    /// Forget `api_ptr` entirely.
    pub(crate) fn discard(&mut self, api_ptr: u32) {
        if let Some(slot) = self.records.get_mut(api_ptr as usize)
            && let Some(record) = slot.as_mut()
        {
            self.lists.move_to(&mut record.coordinator, ListState::NotInList);
            *slot = None;
        }
    }

    /// Return `api_ptr` to the pool with its seized coordinator record.
    pub(crate) fn park(&mut self, api_ptr: u32) {
        if let Some(record) = self.records.get_mut(api_ptr as usize).and_then(Option::as_mut) {
            self.lists.move_to(&mut record.coordinator, ListState::NotInList);
            record.callback = None;
            record.in_use = false;
        }
    }

    pub(crate) fn record(&self, api_ptr: u32) -> Option<&Record> {
        self.records.get(api_ptr as usize).and_then(Option::as_ref)
    }

    pub(crate) fn record_mut(&mut self, api_ptr: u32) -> Option<&mut Record> {
        self.records.get_mut(api_ptr as usize).and_then(Option::as_mut)
    }

    pub(crate) fn coordinator(&mut self, api_ptr: u32) -> ClusterResult<&mut Coordinator> {
        self.record_mut(api_ptr)
            .map(|r| &mut r.coordinator)
            .ok_or_else(|| ClusterError::invalid_state(format!("no transaction record {api_ptr}")))
    }

    /// Records currently seized and idle in the pool.
    pub(crate) fn pooled(&self) -> Vec<u32> {
        self.records
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|r| (i, r)))
            .filter(|(_, r)| {
                !r.in_use && r.coordinator.connection_state() == ConnectionState::Connected
            })
            .map(|(i, _)| i as u32)
            .collect()
    }

    // ---- execute ----

    /// Prepare `api_ptr` and queue it on the prepared array.
    ///
    /// Idle scans owned by the transaction are started ahead of its key
    /// operations.
    pub(crate) fn prepare(
        &mut self,
        api_ptr: u32,
        exec: ExecType,
        abort: AbortOption,
        callback: Option<CompletionCallback>,
    ) -> ClusterResult<()> {
        let Some(record) = self.records.get_mut(api_ptr as usize).and_then(Option::as_mut) else {
            return Err(ClusterError::invalid_state(format!("no transaction record {api_ptr}")));
        };
        let coordinator = &mut record.coordinator;
        let mut prelude = Vec::new();
        if let Some(node) = coordinator.node() {
            for slot in coordinator.scans().to_vec() {
                if let Some(scan) = self.scans.get_mut(slot as usize).and_then(Option::as_mut)
                    && scan.status() == ScanStatus::Idle
                {
                    prelude.push(scan.start_request(
                        node,
                        coordinator.tc_ptr(),
                        coordinator.transaction_id(),
                        &mut self.receivers,
                    )?);
                }
            }
        }
        if let Err(e) = coordinator.execute_async_prepare(exec, abort, prelude) {
            if let Some(node) = coordinator.node() {
                for slot in coordinator.scans() {
                    if let Some(scan) = self.scans.get_mut(*slot as usize).and_then(Option::as_mut)
                        && scan.node() == Some(node)
                        && scan.status() == ScanStatus::Started
                    {
                        scan.on_send_failure(&e);
                    }
                }
            }
            return Err(e);
        }
        record.callback = callback;
        self.lists
            .move_to(&mut record.coordinator, ListState::InPreparedList);
        Ok(())
    }

    /// Send every prepared transaction. Returns how many were sent.
    pub(crate) fn send_prepared(&mut self, out: &mut Outbound) -> usize {
        let prepared = self.lists.take_prepared();
        let count = prepared.len();
        for api_ptr in prepared {
            if let Some(record) = self.record_mut(api_ptr) {
                // The pointer is no longer on the prepared array.
                record.coordinator.set_list_state(ListState::NotInList);
            }
            self.send_one(out, api_ptr);
        }
        count
    }

    fn send_one(&mut self, out: &mut Outbound, api_ptr: u32) {
        let block = self.block;
        let Some(record) = self.records.get_mut(api_ptr as usize).and_then(Option::as_mut) else {
            return;
        };
        let coordinator = &mut record.coordinator;
        let outcome = match coordinator.do_send() {
            Ok(outcome) => outcome,
            Err(e) => {
                coordinator.on_send_failure(&e);
                self.finish(api_ptr, Progress::Resolved, out);
                return;
            }
        };
        let sent = match coordinator.node() {
            Some(node) if !outcome.signals.is_empty() => out
                .send_chain(node, block, outcome.signals.into_iter().collect::<SignalChain>())
                .map(|_| ())
                .map_err(ClusterError::from),
            Some(_) => Ok(()),
            None => Err(ClusterError::invalid_state("transaction has no node")),
        };
        if let Err(e) = sent {
            coordinator.on_send_failure(&e);
            self.finish(api_ptr, Progress::Resolved, out);
            return;
        }
        if outcome.awaiting_reply && coordinator.is_in_flight() {
            self.lists.move_to(coordinator, ListState::InSendList);
        } else {
            self.finish(api_ptr, Progress::Resolved, out);
        }
    }

    /// Move a transaction whose reply handling reported `progress` to where
    /// its owner will find it.
    fn finish(&mut self, api_ptr: u32, progress: Progress, out: &mut Outbound) {
        if !progress.is_resolved() {
            return;
        }
        if progress == Progress::Overflow {
            out.record_too_many_operations();
        }
        let Some(record) = self.records.get_mut(api_ptr as usize).and_then(Option::as_mut) else {
            return;
        };
        if record.coordinator.is_in_flight() {
            return;
        }
        let target = if record.callback.is_some() {
            ListState::InCompletedList
        } else {
            ListState::NotInList
        };
        self.lists.move_to(&mut record.coordinator, target);
    }

    /// Whether `api_ptr` still waits for a reply.
    pub(crate) fn in_flight(&self, api_ptr: u32) -> bool {
        self.record(api_ptr)
            .is_some_and(|r| r.coordinator.is_in_flight())
    }

    /// Force `api_ptr` out of the in-flight state after a wait gave up.
    pub(crate) fn expire(&mut self, api_ptr: u32, out: &mut Outbound) {
        if let Some(record) = self.record_mut(api_ptr)
            && record.coordinator.is_in_flight()
        {
            record.coordinator.on_timeout();
            self.finish(api_ptr, Progress::Resolved, out);
        }
    }

    /// Expire sent transactions older than `deadline`.
    pub(crate) fn expire_overdue(&mut self, deadline: Duration, out: &mut Outbound) {
        let now = Instant::now();
        let overdue: Vec<u32> = self
            .lists
            .members(ListState::InSendList)
            .iter()
            .copied()
            .filter(|ptr| {
                self.record(*ptr)
                    .and_then(|r| r.coordinator.sent_at())
                    .is_some_and(|at| now.duration_since(at) >= deadline)
            })
            .collect();
        for api_ptr in overdue {
            self.expire(api_ptr, out);
        }
    }

    pub(crate) fn completed_len(&self) -> usize {
        self.lists.completed_len()
    }

    pub(crate) fn sent_len(&self) -> usize {
        self.lists.sent_len()
    }

    /// Take every completed transaction with its callback.
    pub(crate) fn harvest(&mut self) -> Vec<(CompletionCallback, TransactionOutcome)> {
        let mut ready = Vec::new();
        for api_ptr in self.lists.take_completed() {
            let Some(record) = self.record_mut(api_ptr) else {
                continue;
            };
            record.coordinator.set_list_state(ListState::NotInList);
            let outcome = TransactionOutcome::of(&record.coordinator);
            if let Some(callback) = record.callback.take() {
                ready.push((callback, outcome));
            }
        }
        ready
    }

    /// Build the TCRELEASEREQ for `api_ptr` and send it.
    pub(crate) fn release(&mut self, out: &mut Outbound, api_ptr: u32) -> ClusterResult<()> {
        let reply_to = self.reply_to(out);
        let block = self.block;
        let coordinator = self.coordinator(api_ptr)?;
        let node = coordinator
            .node()
            .ok_or_else(|| ClusterError::invalid_state("release without a node"))?;
        let signal = coordinator.release_request(reply_to)?;
        out.send(node, block, signal)?;
        Ok(())
    }

    /// Send a heartbeat for `api_ptr`.
    pub(crate) fn heartbeat(&mut self, out: &mut Outbound, api_ptr: u32) -> ClusterResult<()> {
        let block = self.block;
        let coordinator = self.coordinator(api_ptr)?;
        let node = coordinator
            .node()
            .ok_or_else(|| ClusterError::invalid_state("heartbeat without a node"))?;
        let signal = coordinator.heartbeat()?;
        out.send(node, block, signal)?;
        Ok(())
    }

    // ---- scans ----

    /// Define a scan owned by `api_ptr`. Returns the scan slot.
    pub(crate) fn define_scan(
        &mut self,
        config: &ClientConfig,
        api_ptr: u32,
        table: Arc<TableMetadata>,
        options: ScanOptions,
    ) -> ClusterResult<u32> {
        let coordinator = self.coordinator(api_ptr)?;
        if matches!(
            coordinator.commit_state(),
            CommitState::Committed | CommitState::Aborted
        ) {
            return Err(ClusterError::AlreadyCompleted);
        }
        let index = match self.scans.iter().position(Option::is_none) {
            Some(index) => index,
            None => {
                self.scans.push(None);
                self.scans.len() - 1
            }
        };
        let slot = index as u32;
        self.scans[index] = Some(ScanState::new(
            slot,
            api_ptr,
            table,
            options.parallelism.unwrap_or(config.default_scan_parallelism),
            options.batch_rows.unwrap_or(config.default_batch_rows),
            options.attributes,
        ));
        self.coordinator(api_ptr)?.add_scan(slot);
        Ok(slot)
    }

    pub(crate) fn scan(&self, slot: u32) -> Option<&ScanState> {
        self.scans.get(slot as usize).and_then(Option::as_ref)
    }

    fn scan_mut(&mut self, slot: u32) -> ClusterResult<&mut ScanState> {
        self.scans
            .get_mut(slot as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| ClusterError::invalid_usage(format!("scan {slot} is closed")))
    }

    /// Send the SCAN_TABREQ for `slot`.
    pub(crate) fn start_scan(&mut self, out: &mut Outbound, slot: u32) -> ClusterResult<()> {
        let block = self.block;
        let owner = self.scan_mut(slot)?.owner();
        let coordinator = self.coordinator(owner)?;
        if coordinator.commit_state() != CommitState::NotStarted
            || coordinator.operations().executing_count() > 0
        {
            let error = ClusterError::invalid_usage("scan after key operations were started");
            coordinator.record_error(error.code(), error.to_string());
            return Err(error);
        }
        if coordinator.connection_state() != ConnectionState::Connected {
            return Err(ClusterError::invalid_state(format!(
                "scan while {:?}",
                coordinator.connection_state()
            )));
        }
        let node = coordinator
            .node()
            .ok_or_else(|| ClusterError::invalid_state("scan without a node"))?;
        let (tc_ptr, transaction_id) = (coordinator.tc_ptr(), coordinator.transaction_id());
        let Some(scan) = self.scans.get_mut(slot as usize).and_then(Option::as_mut) else {
            return Err(ClusterError::invalid_usage(format!("scan {slot} is closed")));
        };
        let signal = scan.start_request(node, tc_ptr, transaction_id, &mut self.receivers)?;
        if let Err(e) = out.send(node, block, signal) {
            let error = ClusterError::from(e);
            scan.on_send_failure(&error);
            self.record_scan_error(slot);
            return Err(error);
        }
        Ok(())
    }

    /// `Some` once the scan start was confirmed or rejected.
    pub(crate) fn scan_started(&self, slot: u32) -> Option<ClusterResult<()>> {
        let Some(scan) = self.scan(slot) else {
            return Some(Err(ClusterError::invalid_usage("scan closed while starting")));
        };
        match scan.status() {
            ScanStatus::Started if !scan.has_confirmation() => None,
            ScanStatus::Error => Some(Err(scan
                .error()
                .to_error()
                .unwrap_or_else(|| ClusterError::invalid_state("scan failed")))),
            _ => Some(Ok(())),
        }
    }

    /// `Some` once `slot` has a row, a finished batch or an error.
    pub(crate) fn scan_settled(&self, slot: u32) -> Option<()> {
        match self.scan(slot).map(ScanState::status) {
            Some(ScanStatus::Started | ScanStatus::FetchingBatch | ScanStatus::Closing) => None,
            _ => Some(()),
        }
    }

    /// One step of row delivery for `slot`.
    pub(crate) fn scan_step(
        &mut self,
        out: &mut Outbound,
        slot: u32,
        fetch_allowed: bool,
    ) -> ClusterResult<ScanAction> {
        let block = self.block;
        let Some(scan) = self.scans.get_mut(slot as usize).and_then(Option::as_mut) else {
            return Err(ClusterError::invalid_usage(format!("scan {slot} is closed")));
        };
        let polled = scan.poll_row(&mut self.receivers);
        let action = match polled {
            Ok(ScanPoll::Row(row)) => ScanAction::Step(ScanStep::Row(row)),
            Ok(ScanPoll::Finished) => ScanAction::Step(ScanStep::Finished),
            Ok(ScanPoll::Waiting) => ScanAction::Wait,
            Ok(ScanPoll::Exhausted) if !fetch_allowed => ScanAction::Step(ScanStep::NeedFetch),
            Ok(ScanPoll::Exhausted) => {
                let node = scan
                    .node()
                    .ok_or_else(|| ClusterError::invalid_state("scan without a node"))?;
                let signal = scan.next_request(&mut self.receivers)?;
                if let Err(e) = out.send(node, block, signal) {
                    let error = ClusterError::from(e);
                    scan.on_send_failure(&error);
                    self.record_scan_error(slot);
                    return Err(error);
                }
                ScanAction::Wait
            }
            Err(e) => {
                self.record_scan_error(slot);
                return Err(e);
            }
        };
        Ok(action)
    }

    /// Send the stop request for `slot`. Returns whether a confirmation is
    /// awaited.
    pub(crate) fn stop_scan(&mut self, out: &mut Outbound, slot: u32) -> ClusterResult<bool> {
        let block = self.block;
        let scan = self.scan_mut(slot)?;
        let Some(node) = scan.node() else {
            scan.stop_request()?;
            return Ok(false);
        };
        let Some(signal) = scan.stop_request()? else {
            return Ok(false);
        };
        if let Err(e) = out.send(node, block, signal) {
            let error = ClusterError::from(e);
            scan.on_send_failure(&error);
            return Err(error);
        }
        info!(scan = slot, "scan stop requested");
        Ok(true)
    }

    /// A scan wait gave up.
    pub(crate) fn expire_scan(&mut self, slot: u32) {
        let Some(scan) = self.scans.get_mut(slot as usize).and_then(Option::as_mut) else {
            return;
        };
        let owner = scan.owner();
        scan.on_timeout();
        self.record_scan_error(slot);
        if let Some(record) = self.record_mut(owner) {
            record.coordinator.on_timeout();
        }
    }

    /// Drop `slot`, returning its receivers.
    pub(crate) fn close_scan(&mut self, slot: u32) {
        let Some(mut scan) = self.scans.get_mut(slot as usize).and_then(Option::take) else {
            return;
        };
        scan.release(&mut self.receivers);
        if let Some(record) = self.record_mut(scan.owner()) {
            record.coordinator.remove_scan(slot);
        }
        info!(
            scan = slot,
            fetched = scan.rows_fetched(),
            delivered = scan.rows_delivered(),
            "scan closed"
        );
    }

    fn record_scan_error(&mut self, slot: u32) {
        let Some(scan) = self.scan(slot) else { return };
        let owner = scan.owner();
        let Some(recorded) = scan.error().get().cloned() else {
            return;
        };
        if let Some(record) = self.record_mut(owner) {
            record
                .coordinator
                .record_error(recorded.code, recorded.message);
        }
    }

    // ---- reply routing ----

    fn route(&mut self, out: &mut Outbound, from: NodeId, signal: &Signal) -> ClusterResult<()> {
        let Some(kind) = signal.kind() else {
            warn!(%from, gsn = signal.gsn(), "unknown signal");
            return Ok(());
        };
        match kind {
            SignalKind::TcSeizeConf => {
                let conf = TcSeizeConf::decode(signal)?;
                self.apply(out, conf.api_ptr, |c| c.on_seize_conf(&conf));
            }
            SignalKind::TcSeizeRef => {
                let rejection = TcSeizeRef::decode(signal)?;
                self.apply(out, rejection.api_ptr, |c| c.on_seize_ref(&rejection));
            }
            SignalKind::TcReleaseConf => {
                let conf = TcReleaseConf::decode(signal)?;
                self.apply(out, conf.api_ptr, |c| c.on_release_conf(&conf));
            }
            SignalKind::TcReleaseRef => {
                let rejection = TcReleaseRef::decode(signal)?;
                self.apply(out, rejection.api_ptr, |c| c.on_release_ref(&rejection));
            }
            SignalKind::TcKeyConf => {
                let conf = TcKeyConf::decode(signal)?;
                self.apply(out, conf.api_ptr, |c| c.on_key_conf(&conf));
            }
            SignalKind::TcKeyRef => {
                let rejection = TcKeyRef::decode(signal)?;
                self.apply(out, rejection.api_ptr, |c| c.on_key_ref(&rejection));
            }
            SignalKind::TransIdAi => {
                let row = TransIdAi::decode(signal)?;
                if row.receiver_id & SCAN_RECEIVER_FLAG != 0 {
                    self.route_scan_row(&row);
                } else {
                    let api_ptr = row.receiver_id >> 16;
                    self.apply(out, api_ptr, |c| {
                        c.on_row_data(row.receiver_id, row.transaction_id, &row.data)
                    });
                }
            }
            SignalKind::TcCommitConf => {
                let conf = TcCommitConf::decode(signal)?;
                self.apply(out, conf.api_ptr, |c| c.on_commit_conf(&conf));
            }
            SignalKind::TcCommitRef => {
                let rejection = TcCommitRef::decode(signal)?;
                self.apply(out, rejection.api_ptr, |c| c.on_commit_ref(&rejection));
            }
            SignalKind::TcRollbackConf => {
                let conf = TcRollbackConf::decode(signal)?;
                self.apply(out, conf.api_ptr, |c| c.on_rollback_conf(&conf));
            }
            SignalKind::TcRollbackRef => {
                let rejection = TcRollbackRef::decode(signal)?;
                self.apply(out, rejection.api_ptr, |c| c.on_rollback_ref(&rejection));
            }
            SignalKind::TcRollbackRep => {
                let report = TcRollbackRep::decode(signal)?;
                self.apply(out, report.api_ptr, |c| c.on_rollback_rep(&report));
            }
            SignalKind::ScanTabConf => {
                let conf = ScanTabConf::decode(signal)?;
                self.apply_scan(conf.api_ptr, |scan, pool| scan.on_conf(&conf, pool));
            }
            SignalKind::ScanTabInfo => {
                let info = ScanTabInfo::decode(signal)?;
                self.apply_scan(info.api_ptr, |scan, pool| scan.on_info(&info, pool));
            }
            SignalKind::ScanTabRef => {
                let rejection = ScanTabRef::decode(signal)?;
                self.apply_scan(rejection.api_ptr, |scan, _| scan.on_ref(&rejection));
            }
            SignalKind::NodeFailRep => {
                let report = NodeFailRep::decode(signal)?;
                self.on_node_failed(out, report.node);
            }
            other => {
                warn!(%from, kind = other.name(), "signal not handled by sessions");
            }
        }
        Ok(())
    }

    fn apply(&mut self, out: &mut Outbound, api_ptr: u32, f: impl FnOnce(&mut Coordinator) -> Progress) {
        let Some(record) = self.record_mut(api_ptr) else {
            warn!(record = api_ptr, "reply for unknown transaction record");
            return;
        };
        let progress = f(&mut record.coordinator);
        if progress == Progress::Ignored {
            debug!(record = api_ptr, "reply ignored");
        }
        self.finish(api_ptr, progress, out);
    }

    fn apply_scan(
        &mut self,
        slot: u32,
        f: impl FnOnce(&mut ScanState, &mut ReceiverPool) -> ScanProgress,
    ) {
        let Some(scan) = self.scans.get_mut(slot as usize).and_then(Option::as_mut) else {
            warn!(scan = slot, "reply for closed scan");
            return;
        };
        if f(scan, &mut self.receivers) == ScanProgress::Failed {
            self.record_scan_error(slot);
        }
    }

    fn route_scan_row(&mut self, row: &TransIdAi) {
        let mut failed = None;
        for scan in self.scans.iter_mut().flatten() {
            match scan.on_row(row.receiver_id, &row.data, &mut self.receivers) {
                ScanProgress::Ignored => continue,
                ScanProgress::Failed => failed = Some(scan.api_ptr()),
                _ => {}
            }
            break;
        }
        if let Some(slot) = failed {
            self.record_scan_error(slot);
        }
    }

    fn on_node_failed(&mut self, out: &mut Outbound, node: NodeId) {
        let mut failed_owners = Vec::new();
        for scan in self.scans.iter_mut().flatten() {
            if scan.on_node_failure(node) {
                failed_owners.push(scan.owner());
            }
        }
        let mut resolved = Vec::new();
        let mut dropped = 0;
        for (index, slot) in self.records.iter_mut().enumerate() {
            let Some(record) = slot else { continue };
            if record.coordinator.node() != Some(node) {
                continue;
            }
            if !record.in_use {
                *slot = None;
                dropped += 1;
                continue;
            }
            let api_ptr = index as u32;
            let progress = record
                .coordinator
                .on_node_failure(node, failed_owners.contains(&api_ptr));
            resolved.push((api_ptr, progress));
        }
        for (api_ptr, progress) in &resolved {
            self.finish(*api_ptr, *progress, out);
        }
        info!(
            %node,
            affected = resolved.len(),
            pooled_dropped = dropped,
            "session handled node failure"
        );
    }
}

impl SignalHandler for SessionBlock {
    fn execute_signal(&mut self, out: &mut Outbound, from: NodeId, signal: &Signal) {
        if let Err(e) = self.route(out, from, signal) {
            warn!(%from, gsn = signal.gsn(), error = %e, "malformed reply");
        }
    }

    fn node_status(&mut self, out: &mut Outbound, node: NodeId, event: NodeEvent) {
        if event == NodeEvent::Failed {
            self.on_node_failed(out, node);
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
