//! In-process data nodes speaking the coordinator protocol.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use clusterlink::protocol::{
    Message, OperationType, ScanInfoPair, ScanNextReq, ScanTabConf, ScanTabInfo, ScanTabReq,
    TcCommitConf, TcCommitReq, TcKeyConf, TcKeyRef, TcKeyReq, TcReleaseConf, TcReleaseReq,
    TcRollbackConf, TcRollbackReq, TcSeizeConf, TcSeizeRef, TcSeizeReq, TransIdAi,
};
use clusterlink::{
    BlockNumber, ErrorCode, FragmentAssembler, InboundEvent, NodeId, Signal, SignalKind,
    TransactionId, Transport, TransportError, split_into_fragments,
};

/// Error code the fake answers rejected keys with.
pub const KEY_REJECTED: ErrorCode = ErrorCode(626);

struct Connection {
    api_ptr: u32,
    block: BlockNumber,
}

struct ScanRun {
    node: NodeId,
    api_ptr: u32,
    block: BlockNumber,
    receivers: Vec<u32>,
    rows: VecDeque<Vec<u32>>,
    batch_rows: u32,
}

#[derive(Default)]
struct State {
    next_tc_ptr: u32,
    connections: HashMap<u32, Connection>,
    scans: HashMap<TransactionId, ScanRun>,
    tables: HashMap<u32, Vec<Vec<u32>>>,
    silent: HashSet<NodeId>,
    refuse_seize: HashMap<NodeId, ErrorCode>,
    reject_key: Option<u32>,
    duplicate_scan_conf: bool,
    reply_fragment_words: Option<usize>,
    next_fragment_id: u32,
    assembler: FragmentAssembler,
    received: Vec<(NodeId, SignalKind)>,
    stops: usize,
}

/// Transport that is also the cluster.
pub struct FakeCluster {
    events: Sender<InboundEvent>,
    state: Mutex<State>,
    sending: AtomicBool,
    overlapping: AtomicUsize,
}

impl FakeCluster {
    pub fn new(events: Sender<InboundEvent>) -> Arc<Self> {
        Arc::new(Self {
            events,
            state: Mutex::new(State {
                next_tc_ptr: 100,
                ..State::default()
            }),
            sending: AtomicBool::new(false),
            overlapping: AtomicUsize::new(0),
        })
    }

    /// Rows a scan of `table_id` returns.
    pub fn load_table(&self, table_id: u32, rows: Vec<Vec<u32>>) {
        self.state.lock().tables.insert(table_id, rows);
    }

    /// Accept signals to `node` but never answer.
    pub fn silence(&self, node: NodeId) {
        self.state.lock().silent.insert(node);
    }

    /// Answer seize requests to `node` with `code`.
    pub fn refuse_seize(&self, node: NodeId, code: ErrorCode) {
        self.state.lock().refuse_seize.insert(node, code);
    }

    /// Reject key operations whose first key word is `key`.
    pub fn reject_key(&self, key: u32) {
        self.state.lock().reject_key = Some(key);
    }

    /// Send every scan confirmation twice.
    pub fn duplicate_scan_conf(&self) {
        self.state.lock().duplicate_scan_conf = true;
    }

    /// Fragment echoed replies into sections of at most `words` words.
    pub fn fragment_replies(&self, words: usize) {
        self.state.lock().reply_fragment_words = Some(words);
    }

    /// How many signals of `kind` reached any node, fragments included.
    pub fn count(&self, kind: SignalKind) -> usize {
        self.state
            .lock()
            .received
            .iter()
            .filter(|(_, k)| *k == kind)
            .count()
    }

    /// How many signals of `kind` reached `node`.
    pub fn count_on(&self, node: NodeId, kind: SignalKind) -> usize {
        self.state
            .lock()
            .received
            .iter()
            .filter(|(n, k)| *n == node && *k == kind)
            .count()
    }

    /// Scan stop requests seen.
    pub fn stops(&self) -> usize {
        self.state.lock().stops
    }

    /// Sends that started while another was still inside the transport.
    pub fn overlapping_sends(&self) -> usize {
        self.overlapping.load(Ordering::SeqCst)
    }

    fn push(&self, from: NodeId, block: BlockNumber, mut signal: Signal) {
        signal.set_receiver_block(block);
        let _ = self.events.send(InboundEvent::Signal { from, signal });
    }

    fn reply<M: Message>(&self, from: NodeId, block: BlockNumber, message: &M) {
        let signal = message.to_signal().expect("reply should encode");
        self.push(from, block, signal);
    }

    fn handle(&self, node: NodeId, signal: &Signal) {
        let mut state = self.state.lock();
        if let Some(kind) = signal.kind() {
            state.received.push((node, kind));
        }
        if state.silent.contains(&node) {
            return;
        }
        let client = signal.sender();
        let Some(signal) = state
            .assembler
            .accept(client.node, signal.clone())
            .expect("fragments should arrive in order")
        else {
            return;
        };
        let reply_to = signal.sender().block;

        match signal.kind() {
            Some(SignalKind::TcSeizeReq) => {
                let request = TcSeizeReq::decode(&signal).expect("seize request");
                if let Some(code) = state.refuse_seize.get(&node).copied() {
                    self.reply(
                        node,
                        request.api_block_ref.block,
                        &TcSeizeRef {
                            api_ptr: request.api_ptr,
                            error_code: code,
                        },
                    );
                    return;
                }
                let tc_ptr = state.next_tc_ptr;
                state.next_tc_ptr += 1;
                state.connections.insert(
                    tc_ptr,
                    Connection {
                        api_ptr: request.api_ptr,
                        block: request.api_block_ref.block,
                    },
                );
                self.reply(
                    node,
                    request.api_block_ref.block,
                    &TcSeizeConf {
                        api_ptr: request.api_ptr,
                        tc_ptr,
                    },
                );
            }
            Some(SignalKind::TcKeyReq) => {
                let request = TcKeyReq::decode(&signal).expect("key request");
                if request
                    .key
                    .first()
                    .is_some_and(|key| state.reject_key == Some(*key))
                {
                    self.reply(
                        node,
                        reply_to,
                        &TcKeyRef {
                            api_ptr: request.api_ptr,
                            transaction_id: request.transaction_id,
                            error_code: KEY_REJECTED,
                            api_op_ptr: request.api_op_ptr,
                        },
                    );
                    return;
                }
                let read = request.info.operation == OperationType::Read;
                let read_len = if read { request.attr.len() as u32 } else { 0 };
                self.reply(
                    node,
                    reply_to,
                    &TcKeyConf {
                        api_ptr: request.api_ptr,
                        committed: request.info.commit,
                        transaction_id: request.transaction_id,
                        operations: vec![(request.api_op_ptr, read_len)],
                    },
                );
                if read {
                    let key = request.key.first().copied().unwrap_or_default();
                    self.reply(
                        node,
                        reply_to,
                        &TransIdAi {
                            receiver_id: request.api_op_ptr,
                            transaction_id: request.transaction_id,
                            data: request.attr.iter().map(|column| key * 100 + column).collect(),
                        },
                    );
                }
            }
            Some(SignalKind::TcCommitReq) => {
                let request = TcCommitReq::decode(&signal).expect("commit request");
                if let Some(connection) = state.connections.get(&request.tc_ptr) {
                    self.reply(
                        node,
                        connection.block,
                        &TcCommitConf {
                            api_ptr: connection.api_ptr,
                            transaction_id: request.transaction_id,
                        },
                    );
                }
            }
            Some(SignalKind::TcRollbackReq) => {
                let request = TcRollbackReq::decode(&signal).expect("rollback request");
                if let Some(connection) = state.connections.get(&request.tc_ptr) {
                    self.reply(
                        node,
                        connection.block,
                        &TcRollbackConf {
                            api_ptr: connection.api_ptr,
                            transaction_id: request.transaction_id,
                        },
                    );
                }
            }
            Some(SignalKind::TcReleaseReq) => {
                let request = TcReleaseReq::decode(&signal).expect("release request");
                state.connections.remove(&request.tc_ptr);
                self.reply(
                    node,
                    request.api_block_ref.block,
                    &TcReleaseConf {
                        api_ptr: request.api_ptr,
                    },
                );
            }
            Some(SignalKind::ScanTabReq) => {
                let request = ScanTabReq::decode(&signal).expect("scan request");
                let rows = state
                    .tables
                    .get(&request.table_id)
                    .cloned()
                    .unwrap_or_default();
                let run = ScanRun {
                    node,
                    api_ptr: request.api_ptr,
                    block: reply_to,
                    receivers: request.receivers,
                    rows: rows.into(),
                    batch_rows: request.batch_rows,
                };
                let duplicate = state.duplicate_scan_conf;
                let run = state.scans.entry(request.transaction_id).or_insert(run);
                self.send_batch(run, request.transaction_id, 0, duplicate);
            }
            Some(SignalKind::ScanNextReq) => {
                let request = ScanNextReq::decode(&signal).expect("scan next request");
                let duplicate = state.duplicate_scan_conf;
                if request.stop {
                    state.stops += 1;
                    if let Some(run) = state.scans.remove(&request.transaction_id) {
                        self.reply(
                            run.node,
                            run.block,
                            &ScanTabConf {
                                api_ptr: run.api_ptr,
                                expected_ops: 0,
                                end_of_scan: true,
                                transaction_id: request.transaction_id,
                                batch_no: request.batch_no,
                            },
                        );
                    }
                } else if let Some(run) = state.scans.get_mut(&request.transaction_id) {
                    self.send_batch(run, request.transaction_id, request.batch_no, duplicate);
                }
            }
            Some(SignalKind::ApiRegReq) => {
                let mut echo = Signal::with_kind(SignalKind::ApiRegConf);
                echo.set_data(signal.data()).expect("echo data");
                for index in 0..signal.section_count() {
                    let section = signal.section(index).expect("section").to_vec();
                    echo.add_section(section).expect("echo section");
                }
                echo.set_receiver_block(reply_to);
                match state.reply_fragment_words {
                    Some(words) => {
                        state.next_fragment_id += 1;
                        let fragments = split_into_fragments(&echo, words, state.next_fragment_id)
                            .expect("echo should split");
                        for fragment in fragments {
                            self.push(node, reply_to, fragment);
                        }
                    }
                    None => self.push(node, reply_to, echo),
                }
            }
            _ => {}
        }
    }

    /// Info, confirmation, then the rows of one batch. Rows are dealt to
    /// receivers round robin.
    fn send_batch(
        &self,
        run: &mut ScanRun,
        transaction_id: TransactionId,
        batch_no: u32,
        duplicate: bool,
    ) {
        let streams = run.receivers.len().max(1);
        let capacity = run.batch_rows as usize * streams;
        let mut per_receiver = vec![0u16; streams];
        let mut rows = Vec::new();
        for position in 0..capacity {
            let Some(row) = run.rows.pop_front() else {
                break;
            };
            let index = position % streams;
            per_receiver[index] += 1;
            rows.push((run.receivers[index], row));
        }
        let pairs: Vec<ScanInfoPair> = per_receiver
            .iter()
            .enumerate()
            .filter(|(_, count)| **count > 0)
            .map(|(index, count)| ScanInfoPair {
                index: index as u16,
                rows: *count,
            })
            .collect();

        let conf = ScanTabConf {
            api_ptr: run.api_ptr,
            expected_ops: pairs.len() as u16,
            end_of_scan: run.rows.is_empty(),
            transaction_id,
            batch_no,
        };
        if !pairs.is_empty() {
            self.reply(
                run.node,
                run.block,
                &ScanTabInfo {
                    api_ptr: run.api_ptr,
                    transaction_id,
                    batch_no,
                    pairs,
                },
            );
        }
        self.reply(run.node, run.block, &conf);
        if duplicate {
            self.reply(run.node, run.block, &conf);
        }
        for (receiver_id, data) in rows {
            self.reply(
                run.node,
                run.block,
                &TransIdAi {
                    receiver_id,
                    transaction_id,
                    data,
                },
            );
        }
    }
}

impl Transport for FakeCluster {
    fn send(&self, node: NodeId, signal: &Signal) -> Result<(), TransportError> {
        if self.sending.swap(true, Ordering::SeqCst) {
            self.overlapping.fetch_add(1, Ordering::SeqCst);
        }
        self.handle(node, signal);
        self.sending.store(false, Ordering::SeqCst);
        Ok(())
    }
}
