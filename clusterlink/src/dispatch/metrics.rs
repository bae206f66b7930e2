//! Counters kept by the dispatcher.

use std::time::Instant;

/// Dispatcher counters. A snapshot is returned by
/// [`Dispatcher::metrics`](super::Dispatcher::metrics).
#[derive(Debug, Clone)]
pub struct DispatchMetrics {
    /// Signals handed to the transport successfully
    pub signals_sent: u64,

    /// Signals delivered by the receive thread
    pub signals_received: u64,

    /// Words sent, inline and section
    pub words_sent: u64,

    /// Received signals with no registered block
    pub signals_unroutable: u64,

    /// Send attempts repeated after a transient failure
    pub send_retries: u64,

    /// Sends that failed after all retries
    pub send_failures: u64,

    /// Outbound signals split into fragments
    pub signals_fragmented: u64,

    /// Inbound fragments rejected by reassembly
    pub fragments_rejected: u64,

    /// Node failure events processed
    pub node_failures: u64,

    /// Batches where more operations completed than were sent
    pub too_many_operations: u64,

    /// Currently open blocks
    pub open_blocks: usize,

    /// Time the dispatcher was created
    pub created_at: Instant,
}

impl Default for DispatchMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchMetrics {
    /// Zeroed counters.
    pub fn new() -> Self {
        Self {
            signals_sent: 0,
            signals_received: 0,
            words_sent: 0,
            signals_unroutable: 0,
            send_retries: 0,
            send_failures: 0,
            signals_fragmented: 0,
            fragments_rejected: 0,
            node_failures: 0,
            too_many_operations: 0,
            open_blocks: 0,
            created_at: Instant::now(),
        }
    }

    pub(crate) fn record_sent(&mut self, words: usize) {
        self.signals_sent += 1;
        self.words_sent += words as u64;
    }
}
