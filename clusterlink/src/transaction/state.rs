//! The independent state dimensions of a transaction.
//!
//! ```text
//! connection: NotConnected → Connecting → Connected → DisConnecting → NotConnected
//!                                 └──────→ ConnectFailure
//! commit:     NotStarted → Started → { Committed | Aborted | NeedAbort }
//! completion: NotCompleted → { CompletedSuccess | CompletedFailure | DefinitionFailure }
//! send:       Init → { Operations | Abort | AbortFail | CommitState | Completed }
//!                  → { TcOp | TcRollback | TcCommit }
//! list:       NotInList → InPreparedList → InSendList → InCompletedList
//! ```

use serde::{Deserialize, Serialize};

/// Whether a coordinator record is seized on a data node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No coordinator record.
    NotConnected,
    /// TCSEIZEREQ sent.
    Connecting,
    /// Coordinator record seized; work may be sent.
    Connected,
    /// TCRELEASEREQ sent.
    DisConnecting,
    /// The seize was rejected or its node failed.
    ConnectFailure,
}

/// Commit progress of the transaction as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommitState {
    /// Nothing sent yet.
    NotStarted,
    /// Operations sent; neither committed nor aborted.
    Started,
    /// Commit confirmed.
    Committed,
    /// Rolled back.
    Aborted,
    /// An operation failed; the next execute rolls back.
    NeedAbort,
}

/// Outcome of the last execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompletionState {
    /// Still waiting for replies.
    NotCompleted,
    /// Every reply arrived without error.
    CompletedSuccess,
    /// Resolved with an error.
    CompletedFailure,
    /// An operation could not be defined.
    DefinitionFailure,
}

/// Which signals the next send emits, or which reply is awaited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SendState {
    /// Nothing prepared.
    Init,
    /// Operation signals are queued.
    Operations,
    /// A rollback is queued.
    Abort,
    /// Preparation failed; roll back if started, else fail locally.
    AbortFail,
    /// A standalone commit is queued.
    CommitState,
    /// Resolved locally; nothing to send.
    Completed,
    /// Operations sent, awaiting key confirmations.
    TcOp,
    /// Rollback sent, awaiting its confirmation.
    TcRollback,
    /// Commit sent, awaiting its confirmation.
    TcCommit,
}

impl SendState {
    /// Whether a reply from the data node is outstanding.
    pub const fn is_awaiting_reply(self) -> bool {
        matches!(self, Self::TcOp | Self::TcRollback | Self::TcCommit)
    }
}

/// Which session array currently references the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ListState {
    /// In no array.
    NotInList,
    /// Prepared, waiting for a send.
    InPreparedList,
    /// Sent, waiting for replies.
    InSendList,
    /// Resolved, waiting to be harvested.
    InCompletedList,
}
