//! Row operations of one transaction, kept in an arena.
//!
//! Every operation lives in exactly one of three lists: defined (not yet
//! sent), executing (sent, awaiting its reply) or completed. Lists hold
//! arena indices; the arena itself is only cleared when the transaction is
//! reset.

use std::sync::Arc;

use crate::error::{ClusterError, ClusterResult, ErrorCode, ErrorSlot};
use crate::metadata::TableMetadata;
use crate::protocol::OperationType;

/// Stable handle to an operation within its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpHandle(pub(crate) u16);

impl OpHandle {
    /// Arena index.
    pub const fn index(self) -> u16 {
        self.0
    }
}

/// Progress of a single operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    /// Defined, not yet sent.
    Defined,
    /// Sent, awaiting confirmation or row data.
    WaitResponse,
    /// Confirmed or rejected.
    Completed,
}

/// List an operation currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpList {
    Defined,
    Executing,
    Completed,
    Discarded,
}

/// One key operation.
#[derive(Debug, Clone)]
pub struct Operation {
    /// Operation type.
    pub kind: OperationType,
    /// Target table.
    pub table: Arc<TableMetadata>,
    /// Primary key words.
    pub key: Vec<u32>,
    /// Attribute words to write, or attribute ids to read.
    pub values: Vec<u32>,
    status: OperationStatus,
    list: OpList,
    error: ErrorSlot,
    data: Vec<u32>,
    expected_len: Option<u32>,
}

impl Operation {
    /// Current status.
    pub fn status(&self) -> OperationStatus {
        self.status
    }

    /// Error reported for this operation.
    pub fn error(&self) -> &ErrorSlot {
        &self.error
    }

    /// Row data received so far.
    pub fn data(&self) -> &[u32] {
        &self.data
    }

    fn data_complete(&self) -> bool {
        self.expected_len
            .is_some_and(|len| self.data.len() >= len as usize)
    }
}

/// Arena of operations plus the three membership lists.
#[derive(Debug, Default)]
pub struct OperationArena {
    ops: Vec<Operation>,
    defined: Vec<u16>,
    executing: Vec<u16>,
    completed: Vec<u16>,
}

impl OperationArena {
    /// Empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget every operation.
    pub fn clear(&mut self) {
        self.ops.clear();
        self.defined.clear();
        self.executing.clear();
        self.completed.clear();
    }

    /// Append a new operation to the defined list.
    pub fn define(
        &mut self,
        kind: OperationType,
        table: Arc<TableMetadata>,
        key: Vec<u32>,
        values: Vec<u32>,
    ) -> ClusterResult<OpHandle> {
        let index = u16::try_from(self.ops.len())
            .map_err(|_| ClusterError::PoolExhausted { pool: "operations" })?;
        self.ops.push(Operation {
            kind,
            table,
            key,
            values,
            status: OperationStatus::Defined,
            list: OpList::Defined,
            error: ErrorSlot::new(),
            data: Vec::new(),
            expected_len: None,
        });
        self.defined.push(index);
        Ok(OpHandle(index))
    }

    /// Operation behind `handle`.
    pub fn get(&self, handle: OpHandle) -> Option<&Operation> {
        self.ops.get(usize::from(handle.0))
    }

    /// Handles of defined, not yet sent operations, in definition order.
    pub fn defined(&self) -> impl ExactSizeIterator<Item = OpHandle> + '_ {
        self.defined.iter().map(|i| OpHandle(*i))
    }

    /// Number of defined operations.
    pub fn defined_count(&self) -> usize {
        self.defined.len()
    }

    /// Number of operations awaiting a reply.
    pub fn executing_count(&self) -> usize {
        self.executing.len()
    }

    /// Number of completed operations.
    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Move every defined operation to the executing list.
    pub(crate) fn start_executing(&mut self) -> usize {
        let moved = self.defined.len();
        for index in self.defined.drain(..) {
            let op = &mut self.ops[usize::from(index)];
            op.status = OperationStatus::WaitResponse;
            op.list = OpList::Executing;
            self.executing.push(index);
        }
        moved
    }

    /// Drop every defined operation without sending it.
    pub(crate) fn discard_defined(&mut self) {
        for index in self.defined.drain(..) {
            self.ops[usize::from(index)].list = OpList::Discarded;
        }
    }

    /// Mark every executing operation failed with `code`.
    pub(crate) fn fail_executing(&mut self, code: ErrorCode, message: &str) {
        for index in self.executing.drain(..) {
            let op = &mut self.ops[usize::from(index)];
            op.error.set(code, message);
            op.status = OperationStatus::Completed;
            op.list = OpList::Completed;
            self.completed.push(index);
        }
    }

    /// Record the row length announced by a confirmation. Returns true when
    /// this completed the operation.
    pub(crate) fn confirm(&mut self, handle: OpHandle, read_len: u32) -> Option<bool> {
        let op = self.executing_op(handle)?;
        op.expected_len = Some(read_len);
        Some(self.complete_if_ready(handle))
    }

    /// Append row data. Returns true when this completed the operation.
    pub(crate) fn append_data(&mut self, handle: OpHandle, words: &[u32]) -> Option<bool> {
        let op = self.executing_op(handle)?;
        op.data.extend_from_slice(words);
        Some(self.complete_if_ready(handle))
    }

    /// Record a rejection. Returns false when the operation was not executing.
    pub(crate) fn reject(&mut self, handle: OpHandle, code: ErrorCode, message: &str) -> bool {
        let Some(op) = self.executing_op(handle) else {
            return false;
        };
        op.error.set(code, message);
        self.finish(handle);
        true
    }

    fn executing_op(&mut self, handle: OpHandle) -> Option<&mut Operation> {
        self.ops
            .get_mut(usize::from(handle.0))
            .filter(|op| op.list == OpList::Executing)
    }

    fn complete_if_ready(&mut self, handle: OpHandle) -> bool {
        let ready = self
            .ops
            .get(usize::from(handle.0))
            .is_some_and(Operation::data_complete);
        if ready {
            self.finish(handle);
        }
        ready
    }

    fn finish(&mut self, handle: OpHandle) {
        let index = handle.0;
        if let Some(op) = self.ops.get_mut(usize::from(index)) {
            op.status = OperationStatus::Completed;
            op.list = OpList::Completed;
        }
        self.executing.retain(|i| *i != index);
        self.completed.push(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Arc<TableMetadata> {
        Arc::new(TableMetadata {
            id: 1,
            name: "t".into(),
            version: 1,
            key_words: 1,
            attribute_count: 2,
            fragment_count: 2,
        })
    }

    fn arena_with(kinds: &[OperationType]) -> (OperationArena, Vec<OpHandle>) {
        let mut arena = OperationArena::new();
        let handles = kinds
            .iter()
            .enumerate()
            .map(|(i, kind)| {
                arena
                    .define(*kind, table(), vec![i as u32], vec![])
                    .expect("define")
            })
            .collect();
        (arena, handles)
    }

    #[test]
    fn test_write_completes_on_confirmation() {
        let (mut arena, handles) = arena_with(&[OperationType::Insert]);
        assert_eq!(arena.start_executing(), 1);
        assert_eq!(arena.confirm(handles[0], 0), Some(true));
        assert_eq!(arena.completed_count(), 1);
        assert_eq!(arena.executing_count(), 0);
        // A second confirmation for the same operation is not counted.
        assert_eq!(arena.confirm(handles[0], 0), None);
    }

    #[test]
    fn test_read_needs_data_and_confirmation() {
        let (mut arena, handles) = arena_with(&[OperationType::Read]);
        arena.start_executing();
        assert_eq!(arena.append_data(handles[0], &[1, 2]), Some(false));
        assert_eq!(arena.confirm(handles[0], 3), Some(false));
        assert_eq!(arena.append_data(handles[0], &[3]), Some(true));
        let op = arena.get(handles[0]).expect("op");
        assert_eq!(op.data(), &[1, 2, 3]);
        assert_eq!(op.status(), OperationStatus::Completed);
    }

    #[test]
    fn test_reject_and_discard() {
        let (mut arena, handles) =
            arena_with(&[OperationType::Update, OperationType::Delete]);
        arena.start_executing();
        assert!(arena.reject(handles[1], ErrorCode(626), "no such row"));
        assert!(!arena.reject(handles[1], ErrorCode(626), "again"));
        assert_eq!(
            arena.get(handles[1]).map(|op| op.error().code()),
            Some(ErrorCode(626))
        );

        let late = arena
            .define(OperationType::Insert, table(), vec![9], vec![])
            .expect("define");
        arena.discard_defined();
        assert_eq!(arena.defined_count(), 0);
        assert_eq!(arena.confirm(late, 0), None);
    }
}
