//! Transaction coordination: operations, state machine and session arrays.

mod coordinator;
mod lists;
mod operation;
mod state;

pub use coordinator::{Coordinator, Progress, SendOutcome};
pub use lists::TransactionLists;
pub use operation::{OpHandle, Operation, OperationArena, OperationStatus};
pub use state::{CommitState, CompletionState, ConnectionState, ListState, SendState};

use serde::{Deserialize, Serialize};

/// What an execute does after sending the defined operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecType {
    /// Send operations, keep the transaction open.
    NoCommit,
    /// Send operations and commit.
    Commit,
    /// Discard defined operations and roll back.
    Rollback,
}

/// How per-operation errors affect the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AbortOption {
    /// Any operation error fails the batch and forces a rollback.
    #[default]
    AbortOnError,
    /// Operation errors are recorded on the operation only.
    IgnoreError,
}
