use tracing::{debug, warn};

use super::Transaction;
use super::block::ScanAction;
use crate::error::{ClusterError, ClusterResult};
use crate::scan::{ScanStatus, ScanStep};

/// Handle to one scan of a [`Transaction`].
///
/// Closing (or dropping) the cursor stops the scan on the data node if it
/// is still open and returns its receivers to the session pool.
pub struct ScanCursor<'t> {
    tx: &'t Transaction,
    slot: u32,
    closed: bool,
}

impl<'t> ScanCursor<'t> {
    pub(crate) fn new(tx: &'t Transaction, slot: u32) -> Self {
        Self {
            tx,
            slot,
            closed: false,
        }
    }

    /// Send the scan request and wait for the first confirmation or
    /// rejection, up to the scan timeout.
    ///
    /// # Errors
    ///
    /// `InvalidUsage` (4264) when the transaction already started key
    /// operations, `InvalidState` when it is not connected, `Timeout` when
    /// nothing arrives in time.
    pub fn execute(&self) -> ClusterResult<()> {
        let session = self.tx.session();
        let slot = self.slot;
        session.with_block(|block, out| block.start_scan(out, slot))??;
        let started = session.wait(session.config().scan_timeout, |block, _| {
            block.scan_started(slot)
        })?;
        match started {
            Some(result) => result,
            None => {
                warn!(scan = slot, "scan start timed out");
                session.with_block(|block, _| block.expire_scan(slot))?;
                Err(ClusterError::Timeout)
            }
        }
    }

    /// Next row of the scan.
    ///
    /// With `fetch_allowed` an exhausted batch triggers a fetch of the next
    /// one and the call blocks for it; without, [`ScanStep::NeedFetch`] is
    /// returned instead. Errors are also recorded on the transaction.
    pub fn next_scan_result(&self, fetch_allowed: bool) -> ClusterResult<ScanStep> {
        let session = self.tx.session();
        let slot = self.slot;
        loop {
            let action = session
                .with_block(|block, out| block.scan_step(out, slot, fetch_allowed))??;
            match action {
                ScanAction::Step(step) => return Ok(step),
                ScanAction::Wait => {
                    let settled = session.wait(session.config().scan_timeout, |block, _| {
                        block.scan_settled(slot)
                    })?;
                    if settled.is_none() {
                        warn!(scan = slot, "scan batch timed out");
                        session.with_block(|block, _| block.expire_scan(slot))?;
                        return Err(ClusterError::Timeout);
                    }
                }
            }
        }
    }

    /// Ask the data node to close the scan and wait for its
    /// acknowledgement. Buffered rows are discarded.
    pub fn stop_scan(&self) -> ClusterResult<()> {
        let session = self.tx.session();
        let slot = self.slot;
        let awaiting = session.with_block(|block, out| block.stop_scan(out, slot))??;
        if !awaiting {
            return Ok(());
        }
        let settled = session.wait(session.config().scan_timeout, |block, _| {
            block.scan_settled(slot)
        })?;
        if settled.is_none() {
            warn!(scan = slot, "scan close not acknowledged");
            session.with_block(|block, _| block.expire_scan(slot))?;
            return Err(ClusterError::Timeout);
        }
        Ok(())
    }

    /// Current cursor state.
    pub fn status(&self) -> ClusterResult<ScanStatus> {
        let slot = self.slot;
        self.tx
            .session()
            .with_block(|block, _| block.scan(slot).map(|s| s.status()))?
            .ok_or_else(|| ClusterError::invalid_usage(format!("scan {slot} is closed")))
    }

    /// Rows received from the data node so far.
    pub fn rows_fetched(&self) -> ClusterResult<u64> {
        let slot = self.slot;
        Ok(self
            .tx
            .session()
            .with_block(|block, _| block.scan(slot).map_or(0, |s| s.rows_fetched()))?)
    }

    /// Rows handed out by [`ScanCursor::next_scan_result`].
    pub fn rows_delivered(&self) -> ClusterResult<u64> {
        let slot = self.slot;
        Ok(self
            .tx
            .session()
            .with_block(|block, _| block.scan(slot).map_or(0, |s| s.rows_delivered()))?)
    }

    /// Stop the scan if it is open and release its receivers.
    pub fn close(mut self) -> ClusterResult<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> ClusterResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let stopped = self.stop_scan();
        let slot = self.slot;
        self.tx
            .session()
            .with_block(|block, _| block.close_scan(slot))?;
        if let Err(e) = &stopped {
            debug!(scan = slot, error = %e, "scan stopped with error");
        }
        stopped
    }
}

impl Drop for ScanCursor<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.close_inner() {
            debug!(scan = self.slot, error = %e, "scan close on drop failed");
        }
    }
}
