//! BlockRegistry: block number → handler routing.
//!
//! Block numbers are handed out from [`BlockNumber::FIRST_DYNAMIC`] upward.
//! The slot table grows on demand and never shrinks; closing a block frees
//! its slot for reuse without renumbering any other block.

use std::any::Any;

use super::Outbound;
use crate::error::{ClusterError, ClusterResult};
use crate::signal::Signal;
use crate::types::{BlockNumber, NodeId};

/// Node liveness change delivered to every open block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    /// The node was declared dead.
    Failed,
    /// The node (re)joined the cluster.
    Alive,
}

/// Endpoint registered with the dispatcher.
///
/// Both callbacks run on the receive thread with the dispatcher lock held.
/// They get the [`Outbound`] half of the locked state for replies and must
/// not call back into the [`Dispatcher`](super::Dispatcher).
pub trait SignalHandler: Send + 'static {
    /// Handle a signal addressed to this block.
    fn execute_signal(&mut self, out: &mut Outbound, from: NodeId, signal: &Signal);

    /// Handle a node liveness change.
    fn node_status(&mut self, _out: &mut Outbound, _node: NodeId, _event: NodeEvent) {}

    /// Downcast support for [`Dispatcher::with_handler`](super::Dispatcher::with_handler).
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Slot table of open blocks.
#[derive(Default)]
pub struct BlockRegistry {
    slots: Vec<Option<Box<dyn SignalHandler>>>,
    open: usize,
    registration_count: u64,
}

impl BlockRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under the lowest free block number.
    pub fn open(&mut self, handler: Box<dyn SignalHandler>) -> ClusterResult<BlockNumber> {
        let index = match self.slots.iter().position(Option::is_none) {
            Some(index) => {
                self.slots[index] = Some(handler);
                index
            }
            None => {
                let index = self.slots.len();
                if index > usize::from(u16::MAX - BlockNumber::FIRST_DYNAMIC.get()) {
                    return Err(ClusterError::PoolExhausted { pool: "blocks" });
                }
                self.slots.push(Some(handler));
                index
            }
        };
        self.open += 1;
        self.registration_count += 1;
        Ok(Self::block_of(index))
    }

    /// Unregister `block`, returning its handler.
    pub fn close(&mut self, block: BlockNumber) -> Option<Box<dyn SignalHandler>> {
        let handler = self.slot_index(block).and_then(|i| self.slots[i].take());
        if handler.is_some() {
            self.open -= 1;
        }
        handler
    }

    /// Handler registered for `block`.
    pub fn get_mut(&mut self, block: BlockNumber) -> Option<&mut (dyn SignalHandler + 'static)> {
        let index = self.slot_index(block)?;
        self.slots[index].as_deref_mut()
    }

    /// Visit every open handler in block order.
    pub fn for_each(&mut self, mut f: impl FnMut(BlockNumber, &mut (dyn SignalHandler + 'static))) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(handler) = slot.as_deref_mut() {
                f(Self::block_of(index), handler);
            }
        }
    }

    /// Number of open blocks.
    pub fn open_count(&self) -> usize {
        self.open
    }

    /// Slots allocated so far, open or free.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Total registrations (for metrics).
    pub fn registration_count(&self) -> u64 {
        self.registration_count
    }

    fn slot_index(&self, block: BlockNumber) -> Option<usize> {
        if !block.is_dynamic() {
            return None;
        }
        let index = usize::from(block.get() - BlockNumber::FIRST_DYNAMIC.get());
        (index < self.slots.len()).then_some(index)
    }

    fn block_of(index: usize) -> BlockNumber {
        BlockNumber(BlockNumber::FIRST_DYNAMIC.get() + index as u16)
    }
}
