//! Row receivers: one per parallel scan stream, taken from a session pool.

use std::collections::VecDeque;

use crate::error::{ClusterError, ClusterResult};

/// Receiver ids carry this bit so row data can be told apart from key-read
/// data, whose receiver id is an operation pointer.
pub const SCAN_RECEIVER_FLAG: u32 = 0x8000_0000;

/// Buffered rows of one scan stream for the current batch.
#[derive(Debug, Default)]
pub struct Receiver {
    rows: VecDeque<Vec<u32>>,
    received: u32,
    in_use: bool,
}

impl Receiver {
    /// Buffer one row. The words are copied out of the receive buffer.
    pub fn push_row(&mut self, words: &[u32]) {
        self.rows.push_back(words.to_vec());
        self.received += 1;
    }

    /// Rows received in the current batch.
    pub fn received(&self) -> u32 {
        self.received
    }

    /// Next undelivered row.
    pub fn take_row(&mut self) -> Option<Vec<u32>> {
        self.rows.pop_front()
    }

    /// Forget the current batch.
    pub fn reset(&mut self) {
        self.rows.clear();
        self.received = 0;
    }
}

/// Fixed-capacity pool of receivers shared by the scans of a session.
#[derive(Debug)]
pub struct ReceiverPool {
    slots: Vec<Receiver>,
    free: Vec<u32>,
}

impl ReceiverPool {
    /// Pool of `capacity` receivers.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(SCAN_RECEIVER_FLAG as usize);
        Self {
            slots: (0..capacity).map(|_| Receiver::default()).collect(),
            free: (0..capacity as u32).rev().collect(),
        }
    }

    /// Take `count` receivers, returning their ids.
    pub fn acquire(&mut self, count: usize) -> ClusterResult<Vec<u32>> {
        if count > self.free.len() {
            return Err(ClusterError::PoolExhausted { pool: "receivers" });
        }
        let ids: Vec<u32> = self.free.split_off(self.free.len() - count);
        for index in &ids {
            let receiver = &mut self.slots[*index as usize];
            receiver.reset();
            receiver.in_use = true;
        }
        Ok(ids.into_iter().rev().map(|i| i | SCAN_RECEIVER_FLAG).collect())
    }

    /// Return receivers to the pool. Ids not currently taken are ignored.
    pub fn release(&mut self, ids: &[u32]) {
        for id in ids {
            let index = id & !SCAN_RECEIVER_FLAG;
            if let Some(receiver) = self.slots.get_mut(index as usize)
                && receiver.in_use
            {
                receiver.in_use = false;
                receiver.reset();
                self.free.push(index);
            }
        }
    }

    /// Receiver behind `id`, if taken.
    pub fn get_mut(&mut self, id: u32) -> Option<&mut Receiver> {
        if id & SCAN_RECEIVER_FLAG == 0 {
            return None;
        }
        self.slots
            .get_mut((id & !SCAN_RECEIVER_FLAG) as usize)
            .filter(|r| r.in_use)
    }

    /// Receivers not taken.
    pub fn available(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let mut pool = ReceiverPool::new(4);
        let ids = pool.acquire(3).expect("acquire");
        assert_eq!(ids, vec![SCAN_RECEIVER_FLAG, SCAN_RECEIVER_FLAG | 1, SCAN_RECEIVER_FLAG | 2]);
        assert_eq!(pool.available(), 1);
        assert!(matches!(
            pool.acquire(2),
            Err(ClusterError::PoolExhausted { pool: "receivers" })
        ));

        pool.get_mut(ids[1]).expect("receiver").push_row(&[1, 2]);
        pool.release(&ids);
        pool.release(&ids);
        assert_eq!(pool.available(), 4);
        assert!(pool.get_mut(ids[1]).is_none());
    }

    #[test]
    fn test_rows_are_buffered_in_order() {
        let mut pool = ReceiverPool::new(1);
        let id = pool.acquire(1).expect("acquire")[0];
        let receiver = pool.get_mut(id).expect("receiver");
        receiver.push_row(&[1]);
        receiver.push_row(&[2]);
        assert_eq!(receiver.received(), 2);
        assert_eq!(receiver.take_row(), Some(vec![1]));
        assert_eq!(receiver.take_row(), Some(vec![2]));
        assert_eq!(receiver.take_row(), None);
        // Operation pointers never address a receiver.
        assert!(pool.get_mut(0).is_none());
    }
}
