//! The prepared / sent / completed arrays of a session.
//!
//! A transaction is referenced by at most one array at a time; its
//! [`ListState`] mirrors which one. Moving between arrays always goes
//! through [`TransactionLists::move_to`], which removes the old reference
//! before adding the new one.

use super::coordinator::Coordinator;
use super::state::ListState;

/// Arrays of transaction pointers owned by a session.
#[derive(Debug, Default)]
pub struct TransactionLists {
    prepared: Vec<u32>,
    sent: Vec<u32>,
    completed: Vec<u32>,
}

impl TransactionLists {
    /// Empty arrays.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move `tx` to the array for `list`. [`ListState::NotInList`] removes it.
    pub fn move_to(&mut self, tx: &mut Coordinator, list: ListState) {
        let ptr = tx.api_ptr();
        if let Some(array) = self.array_mut(tx.list_state()) {
            array.retain(|p| *p != ptr);
        }
        if let Some(array) = self.array_mut(list) {
            array.push(ptr);
        }
        tx.set_list_state(list);
    }

    /// Take every completed pointer, leaving the transactions' list state
    /// for the caller to reset.
    pub fn take_completed(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.completed)
    }

    /// Take every prepared pointer.
    pub fn take_prepared(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.prepared)
    }

    /// Pointers in the array for `list`.
    pub fn members(&self, list: ListState) -> &[u32] {
        match list {
            ListState::NotInList => &[],
            ListState::InPreparedList => &self.prepared,
            ListState::InSendList => &self.sent,
            ListState::InCompletedList => &self.completed,
        }
    }

    /// Number of sent transactions awaiting replies.
    pub fn sent_len(&self) -> usize {
        self.sent.len()
    }

    /// Number of resolved transactions waiting to be harvested.
    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }

    fn array_mut(&mut self, list: ListState) -> Option<&mut Vec<u32>> {
        match list {
            ListState::NotInList => None,
            ListState::InPreparedList => Some(&mut self.prepared),
            ListState::InSendList => Some(&mut self.sent),
            ListState::InCompletedList => Some(&mut self.completed),
        }
    }
}
