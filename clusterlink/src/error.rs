//! Error types for the cluster client.
//!
//! Errors are layered the same way the client is:
//! - [`SignalError`](crate::signal::SignalError): envelope and wire format
//! - [`TransportError`](crate::transport::TransportError): outbound delivery
//! - [`ClusterError`]: everything an application-facing call can fail with
//!
//! Every [`ClusterError`] maps onto a numeric [`ErrorCode`]. Transactions
//! record the first code they see in an [`ErrorSlot`]; later failures never
//! overwrite it.

use std::fmt;

use crate::signal::SignalError;
use crate::transport::TransportError;
use crate::types::NodeId;

/// Numeric error code as reported by the cluster or synthesized locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    /// No error.
    pub const NONE: Self = Self(0);
    /// Send to a data node failed after retries.
    pub const SEND_FAILED: Self = Self(4007);
    /// No reply arrived within the configured timeout.
    pub const RESPONSE_TIMEOUT: Self = Self(4008);
    /// No alive data node could be found.
    pub const NO_ALIVE_NODE: Self = Self(4009);
    /// A node hosting outstanding work failed.
    pub const NODE_FAILURE: Self = Self(4010);
    /// A batch sent with the commit flag completed without a commit confirmation.
    pub const UNCONFIRMED_COMMIT: Self = Self(4011);
    /// More operations were reported complete than were sent.
    pub const TOO_MANY_OPERATIONS: Self = Self(4113);
    /// Scan accessor used out of order.
    pub const INVALID_SCAN_USAGE: Self = Self(4264);
    /// Operation could not be defined or encoded.
    pub const OPERATION_DEFINITION: Self = Self(4265);
    /// Transaction already committed or aborted.
    pub const ALREADY_COMPLETED: Self = Self(4266);
    /// Table name could not be resolved.
    pub const UNKNOWN_TABLE: Self = Self(4267);
    /// Call not valid in the current state.
    pub const INVALID_STATE: Self = Self(4268);
    /// Object pool has no free entries.
    pub const POOL_EXHAUSTED: Self = Self(4269);
    /// Client is shutting down.
    pub const SHUTDOWN: Self = Self(4270);

    /// True for the "no error" code.
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Human-readable description of well-known codes.
    pub fn description(self) -> &'static str {
        match self {
            Self::NONE => "no error",
            Self::SEND_FAILED => "send to data node failed",
            Self::RESPONSE_TIMEOUT => "timed out waiting for data node",
            Self::NO_ALIVE_NODE => "no alive data node available",
            Self::NODE_FAILURE => "node failure caused abort of transaction",
            Self::UNCONFIRMED_COMMIT => "commit requested but not confirmed",
            Self::TOO_MANY_OPERATIONS => "too many operations received",
            Self::INVALID_SCAN_USAGE => "invalid usage of scan",
            Self::OPERATION_DEFINITION => "operation definition error",
            Self::ALREADY_COMPLETED => "transaction already completed",
            Self::UNKNOWN_TABLE => "unknown table",
            Self::INVALID_STATE => "invalid state for request",
            Self::POOL_EXHAUSTED => "object pool exhausted",
            Self::SHUTDOWN => "client shutting down",
            _ => "error reported by data node",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.description())
    }
}

/// Errors returned by the cluster client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    /// Malformed or unsupported signal.
    #[error("signal error: {0}")]
    Signal(#[from] SignalError),

    /// Outbound delivery failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Request explicitly rejected by a data node.
    #[error("rejected by data node: {code}")]
    Rejected {
        /// Code copied verbatim from the rejection.
        code: ErrorCode,
    },

    /// Wait for a reply exceeded its deadline.
    #[error("timed out waiting for reply")]
    Timeout,

    /// A node hosting outstanding work failed.
    #[error("{node} failed with work outstanding")]
    NodeFailure {
        /// The failed node.
        node: NodeId,
    },

    /// More operations were reported complete than were sent.
    #[error("too many operations: completed {completed} of {sent}")]
    TooManyOperations {
        /// Operations sent.
        sent: u32,
        /// Operations reported complete.
        completed: u32,
    },

    /// API called out of order or with bad arguments.
    #[error("invalid usage: {message}")]
    InvalidUsage {
        /// Details about the misuse.
        message: String,
    },

    /// Transaction already committed or aborted.
    #[error("transaction already completed")]
    AlreadyCompleted,

    /// Object is not in a state that permits the request.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Details about the state.
        message: String,
    },

    /// Operation definition failed.
    #[error("operation definition failed: {message}")]
    Definition {
        /// Details about the failure.
        message: String,
    },

    /// Table could not be resolved by name.
    #[error("unknown table: {name}")]
    UnknownTable {
        /// Requested table name.
        name: String,
    },

    /// No alive node could take the request.
    #[error("no alive node available")]
    NoAliveNode,

    /// Object pool has no free entries.
    #[error("pool exhausted: {pool}")]
    PoolExhausted {
        /// Name of the exhausted pool.
        pool: &'static str,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    Config {
        /// Details about the configuration problem.
        message: String,
    },

    /// The client is shutting down.
    #[error("client shut down")]
    Shutdown,

    /// Error previously recorded on a transaction.
    #[error("transaction failed: {code}")]
    Recorded {
        /// First error recorded on the transaction.
        code: ErrorCode,
    },
}

impl ClusterError {
    /// Numeric code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            ClusterError::Signal(_) => ErrorCode::OPERATION_DEFINITION,
            ClusterError::Transport(_) => ErrorCode::SEND_FAILED,
            ClusterError::Rejected { code } | ClusterError::Recorded { code } => *code,
            ClusterError::Timeout => ErrorCode::RESPONSE_TIMEOUT,
            ClusterError::NodeFailure { .. } => ErrorCode::NODE_FAILURE,
            ClusterError::TooManyOperations { .. } => ErrorCode::TOO_MANY_OPERATIONS,
            ClusterError::InvalidUsage { .. } => ErrorCode::INVALID_SCAN_USAGE,
            ClusterError::AlreadyCompleted => ErrorCode::ALREADY_COMPLETED,
            ClusterError::InvalidState { .. } => ErrorCode::INVALID_STATE,
            ClusterError::Definition { .. } => ErrorCode::OPERATION_DEFINITION,
            ClusterError::UnknownTable { .. } => ErrorCode::UNKNOWN_TABLE,
            ClusterError::NoAliveNode => ErrorCode::NO_ALIVE_NODE,
            ClusterError::PoolExhausted { .. } => ErrorCode::POOL_EXHAUSTED,
            ClusterError::Config { .. } => ErrorCode::INVALID_STATE,
            ClusterError::Shutdown => ErrorCode::SHUTDOWN,
        }
    }

    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        ClusterError::InvalidState {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_usage(message: impl Into<String>) -> Self {
        ClusterError::InvalidUsage {
            message: message.into(),
        }
    }
}

/// Result type for cluster client operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Error recorded on a transaction or operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedError {
    /// Numeric code.
    pub code: ErrorCode,
    /// Free-form detail.
    pub message: String,
}

/// "First error wins" storage.
///
/// [`ErrorSlot::set`] only stores when the slot is empty, so an early
/// synchronous failure is never masked by a later asynchronous one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorSlot {
    recorded: Option<RecordedError>,
}

impl ErrorSlot {
    /// Empty slot.
    pub const fn new() -> Self {
        Self { recorded: None }
    }

    /// Record `code` unless an error is already stored. Returns whether it was stored.
    pub fn set(&mut self, code: ErrorCode, message: impl Into<String>) -> bool {
        if self.recorded.is_some() || code.is_none() {
            return false;
        }
        self.recorded = Some(RecordedError {
            code,
            message: message.into(),
        });
        true
    }

    /// Record from a [`ClusterError`].
    pub fn set_from(&mut self, error: &ClusterError) -> bool {
        self.set(error.code(), error.to_string())
    }

    /// Stored code, or [`ErrorCode::NONE`].
    pub fn code(&self) -> ErrorCode {
        self.recorded
            .as_ref()
            .map(|e| e.code)
            .unwrap_or(ErrorCode::NONE)
    }

    /// Stored error, if any.
    pub fn get(&self) -> Option<&RecordedError> {
        self.recorded.as_ref()
    }

    /// True when an error is stored.
    pub fn is_set(&self) -> bool {
        self.recorded.is_some()
    }

    /// Forget the stored error.
    pub fn clear(&mut self) {
        self.recorded = None;
    }

    /// Convert the stored error into a [`ClusterError::Recorded`].
    pub fn to_error(&self) -> Option<ClusterError> {
        self.recorded
            .as_ref()
            .map(|e| ClusterError::Recorded { code: e.code })
    }
}
