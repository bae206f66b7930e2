//! # clusterlink
//!
//! Client-side coordinator for a clustered storage engine.
//!
//! This crate provides:
//! - **Signals**: the fixed-layout message envelope, its CRC32C-checked
//!   stream framing and fragmentation of oversized sections
//! - **Dispatch**: one mutex around every send, a block registry routing
//!   replies, and a dedicated receive thread
//! - **Transactions**: the per-transaction state machine sequencing
//!   definition, send, completion and commit or abort
//! - **Scans**: cursors reassembling multi-signal batches into ordered rows
//! - **Signal exchange**: a blocking request/reply client for
//!   administrative traffic
//!
//! ```text
//! ClusterContext ── Dispatcher (Mutex + Condvar) ── Transport ──▶ data nodes
//!        │               ▲         │
//!        │      receive thread     ├── SessionBlock ◀── Session / Transaction / ScanCursor
//!        │     (InboundEvent rx)   └── ExchangeBlock ◀── SignalExchange
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// =============================================================================
// Modules
// =============================================================================

/// Node, block and transaction identifiers.
pub mod types;

/// Error codes and the client error type.
pub mod error;

/// Client configuration.
pub mod config;

/// The signal envelope, framing and fragmentation.
pub mod signal;

/// Typed views of coordinator signals.
pub mod protocol;

/// Outbound transports and inbound events.
pub mod transport;

/// Cluster membership queries.
pub mod cluster;

/// Table metadata resolution.
pub mod metadata;

/// Send path, block registry and receive loop.
pub mod dispatch;

/// Transaction state machine.
pub mod transaction;

/// Scan cursor protocol.
pub mod scan;

/// Sessions, transaction handles and scan cursors.
pub mod session;

/// Synchronous signal exchange.
pub mod exchange;

/// Client lifecycle.
pub mod context;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use types::{BlockNumber, BlockRef, MAX_NODES, NodeBitmask, NodeId, TransactionId};

pub use error::{ClusterError, ClusterResult, ErrorCode, ErrorSlot, RecordedError};

pub use config::{ClientConfig, RetryPolicy};

pub use signal::{
    FRAME_HEADER_SIZE, FragmentAssembler, MAX_DATA_WORDS, MAX_FRAME_SIZE, MAX_SECTIONS, Signal,
    SignalChain, SignalError, SignalKind, decode_signal, encode_signal, split_into_fragments,
    try_decode_signal,
};

pub use transport::{
    InboundEvent, SignalReader, StreamTransport, Transport, TransportError, spawn_stream_receiver,
};

pub use cluster::{ClusterMembership, NodeState, NodeTable};

pub use metadata::{Catalog, MetadataResolver, TableMetadata};

pub use dispatch::{
    DispatchMetrics, Dispatcher, NodeEvent, Outbound, ReceiveThread, SignalHandler,
};

pub use transaction::{
    AbortOption, CommitState, CompletionState, ConnectionState, ExecType, ListState, OpHandle,
    Operation, OperationStatus, SendState,
};

pub use scan::{ScanOptions, ScanStatus, ScanStep};

pub use session::{CompletionCallback, ScanCursor, Session, Transaction, TransactionOutcome};

pub use exchange::{Received, SignalExchange};

pub use context::ClusterContext;
