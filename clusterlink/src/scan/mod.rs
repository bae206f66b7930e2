//! Scan cursors: batch reassembly and row receivers.

mod cursor;
mod receiver;

pub use cursor::{ScanOptions, ScanPoll, ScanProgress, ScanState, ScanStatus, ScanStep};
pub use receiver::{Receiver, ReceiverPool, SCAN_RECEIVER_FLAG};
