//! Scan messages.

use super::{Message, transid_at};
use crate::error::ErrorCode;
use crate::signal::{Signal, SignalError, SignalKind};
use crate::types::TransactionId;

/// Maximum (receiver, length) pairs in one SCAN_TABINFO.
pub const MAX_INFO_PAIRS: usize = 16;

/// Largest batch number that fits beside the 8 flag bits of a packed word.
/// Cursors wrap to 0 after it.
pub const MAX_BATCH_NO: u32 = (1 << 24) - 1;

fn pack_batch(kind: SignalKind, low_bits: u32, batch_no: u32) -> Result<u32, SignalError> {
    debug_assert!(low_bits <= 0xFF);
    if batch_no > MAX_BATCH_NO {
        return Err(SignalError::Malformed {
            kind: kind.name(),
            message: format!("batch {batch_no} exceeds {MAX_BATCH_NO}"),
        });
    }
    Ok(low_bits | batch_no << 8)
}

/// Start a scan.
///
/// ```text
/// [api_ptr, tc_ptr, table_id, schema_version, parallelism, batch_rows,
///  transid_lo, transid_hi]
/// section 0: receiver ids, one per parallel stream
/// section 1: projected attribute ids
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTabReq {
    /// API pointer the scan replies are routed by.
    pub api_ptr: u32,
    /// Coordinator connect pointer.
    pub tc_ptr: u32,
    /// Table id.
    pub table_id: u32,
    /// Table schema version.
    pub schema_version: u32,
    /// Rows per receiver per batch.
    pub batch_rows: u32,
    /// Transaction id.
    pub transaction_id: TransactionId,
    /// Receiver ids; their count is the parallelism.
    pub receivers: Vec<u32>,
    /// Attribute ids to return.
    pub attributes: Vec<u32>,
}

impl Message for ScanTabReq {
    const KIND: SignalKind = SignalKind::ScanTabReq;
    const MIN_LENGTH: usize = 8;

    fn encode(&self, signal: &mut Signal) -> Result<(), SignalError> {
        signal.set_data(&[
            self.api_ptr,
            self.tc_ptr,
            self.table_id,
            self.schema_version,
            self.receivers.len() as u32,
            self.batch_rows,
            self.transaction_id.low(),
            self.transaction_id.high(),
        ])?;
        signal.add_section(self.receivers.clone())?;
        signal.add_section(self.attributes.clone())
    }

    fn decode_unchecked(signal: &Signal) -> Result<Self, SignalError> {
        let receivers = signal.section(0).unwrap_or_default().to_vec();
        if receivers.len() != signal.word(4) as usize {
            return Err(SignalError::Malformed {
                kind: Self::KIND.name(),
                message: format!(
                    "parallelism {} but {} receivers",
                    signal.word(4),
                    receivers.len()
                ),
            });
        }
        Ok(Self {
            api_ptr: signal.word(0),
            tc_ptr: signal.word(1),
            table_id: signal.word(2),
            schema_version: signal.word(3),
            batch_rows: signal.word(5),
            transaction_id: transid_at(signal, 6),
            receivers,
            attributes: signal.section(1).unwrap_or_default().to_vec(),
        })
    }
}

/// Batch confirmation.
///
/// ```text
/// [api_ptr, info, transid_lo, transid_hi, batch_no]
/// info: expected_ops:16 | end_of_scan:1
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanTabConf {
    /// API pointer of the scan.
    pub api_ptr: u32,
    /// Receivers that complete in this batch.
    pub expected_ops: u16,
    /// No rows remain after this batch.
    pub end_of_scan: bool,
    /// Transaction id.
    pub transaction_id: TransactionId,
    /// Batch being confirmed.
    pub batch_no: u32,
}

impl Message for ScanTabConf {
    const KIND: SignalKind = SignalKind::ScanTabConf;
    const MIN_LENGTH: usize = 5;

    fn encode(&self, signal: &mut Signal) -> Result<(), SignalError> {
        let info = u32::from(self.expected_ops) | (self.end_of_scan as u32) << 16;
        signal.set_data(&[
            self.api_ptr,
            info,
            self.transaction_id.low(),
            self.transaction_id.high(),
            self.batch_no,
        ])
    }

    fn decode_unchecked(signal: &Signal) -> Result<Self, SignalError> {
        let info = signal.word(1);
        Ok(Self {
            api_ptr: signal.word(0),
            expected_ops: info as u16,
            end_of_scan: info & (1 << 16) != 0,
            transaction_id: transid_at(signal, 2),
            batch_no: signal.word(4),
        })
    }
}

/// One completed receiver named by a SCAN_TABINFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanInfoPair {
    /// Receiver index within the scan.
    pub index: u16,
    /// Rows the receiver holds for this batch.
    pub rows: u16,
}

/// Receiver completion report.
///
/// ```text
/// [api_ptr, transid_lo, transid_hi, info, (index:16 | rows:16) x count]
/// info: count:5 | batch_no << 8
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTabInfo {
    /// API pointer of the scan.
    pub api_ptr: u32,
    /// Transaction id.
    pub transaction_id: TransactionId,
    /// Batch the pairs belong to.
    pub batch_no: u32,
    /// Completed receivers, in report order.
    pub pairs: Vec<ScanInfoPair>,
}

impl Message for ScanTabInfo {
    const KIND: SignalKind = SignalKind::ScanTabInfo;
    const MIN_LENGTH: usize = 4;

    fn encode(&self, signal: &mut Signal) -> Result<(), SignalError> {
        if self.pairs.len() > MAX_INFO_PAIRS {
            return Err(SignalError::InlineOverflow {
                length: 4 + self.pairs.len(),
            });
        }
        signal.set_data(&[
            self.api_ptr,
            self.transaction_id.low(),
            self.transaction_id.high(),
            pack_batch(Self::KIND, self.pairs.len() as u32, self.batch_no)?,
        ])?;
        for pair in &self.pairs {
            signal.push_word(u32::from(pair.index) | u32::from(pair.rows) << 16)?;
        }
        Ok(())
    }

    fn decode_unchecked(signal: &Signal) -> Result<Self, SignalError> {
        let info = signal.word(3);
        let count = (info & 0x1F) as usize;
        let words = &signal.data()[4..];
        if count > MAX_INFO_PAIRS || words.len() < count {
            return Err(SignalError::Malformed {
                kind: Self::KIND.name(),
                message: format!("{count} pairs declared, {} words present", words.len()),
            });
        }
        Ok(Self {
            api_ptr: signal.word(0),
            transaction_id: transid_at(signal, 1),
            batch_no: info >> 8,
            pairs: words[..count]
                .iter()
                .map(|w| ScanInfoPair {
                    index: *w as u16,
                    rows: (*w >> 16) as u16,
                })
                .collect(),
        })
    }
}

/// Scan rejection: `[api_ptr, transid_lo, transid_hi, error_code, close_needed]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanTabRef {
    /// API pointer of the scan.
    pub api_ptr: u32,
    /// Transaction id.
    pub transaction_id: TransactionId,
    /// Error code.
    pub error_code: ErrorCode,
    /// The coordinator still holds scan state that must be closed.
    pub close_needed: bool,
}

impl Message for ScanTabRef {
    const KIND: SignalKind = SignalKind::ScanTabRef;
    const MIN_LENGTH: usize = 5;

    fn encode(&self, signal: &mut Signal) -> Result<(), SignalError> {
        signal.set_data(&[
            self.api_ptr,
            self.transaction_id.low(),
            self.transaction_id.high(),
            self.error_code.0,
            self.close_needed as u32,
        ])
    }

    fn decode_unchecked(signal: &Signal) -> Result<Self, SignalError> {
        Ok(Self {
            api_ptr: signal.word(0),
            transaction_id: transid_at(signal, 1),
            error_code: ErrorCode(signal.word(3)),
            close_needed: signal.word(4) != 0,
        })
    }
}

/// Fetch the next batch or stop: `[tc_ptr, flags, transid_lo, transid_hi]`.
///
/// `flags`: stop:1 | batch_no << 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanNextReq {
    /// Coordinator connect pointer.
    pub tc_ptr: u32,
    /// Release the cursor instead of fetching.
    pub stop: bool,
    /// Batch being requested.
    pub batch_no: u32,
    /// Transaction id.
    pub transaction_id: TransactionId,
}

impl Message for ScanNextReq {
    const KIND: SignalKind = SignalKind::ScanNextReq;
    const MIN_LENGTH: usize = 4;

    fn encode(&self, signal: &mut Signal) -> Result<(), SignalError> {
        signal.set_data(&[
            self.tc_ptr,
            pack_batch(Self::KIND, self.stop as u32, self.batch_no)?,
            self.transaction_id.low(),
            self.transaction_id.high(),
        ])
    }

    fn decode_unchecked(signal: &Signal) -> Result<Self, SignalError> {
        let flags = signal.word(1);
        Ok(Self {
            tc_ptr: signal.word(0),
            stop: flags & 1 != 0,
            batch_no: flags >> 8,
            transaction_id: transid_at(signal, 2),
        })
    }
}
