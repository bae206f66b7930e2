//! Transaction coordinator messages: seize/release, key operations,
//! commit and rollback.

use serde::{Deserialize, Serialize};

use super::{CONTINUATION_WORDS, Message, transid_at, transid_error_message, transid_message};
use crate::error::ErrorCode;
use crate::signal::{Signal, SignalError, SignalKind};
use crate::types::{BlockRef, NodeId, TransactionId};

/// Inline key words carried by a TCKEYREQ.
pub const INLINE_KEY_WORDS: usize = 8;

/// Inline attribute words carried by a TCKEYREQ.
pub const INLINE_ATTR_WORDS: usize = 5;

const KEYREQ_HEADER_WORDS: usize = 9;

/// Maximum (operation, length) pairs in one TCKEYCONF.
pub const MAX_CONF_OPERATIONS: usize = 10;

/// Seize a coordinator record: `[api_ptr, api_block_ref]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcSeizeReq {
    /// API connect pointer to echo in the reply.
    pub api_ptr: u32,
    /// Block the reply is addressed to.
    pub api_block_ref: BlockRef,
}

impl Message for TcSeizeReq {
    const KIND: SignalKind = SignalKind::TcSeizeReq;
    const MIN_LENGTH: usize = 2;

    fn encode(&self, signal: &mut Signal) -> Result<(), SignalError> {
        signal.set_data(&[self.api_ptr, self.api_block_ref.to_word()])
    }

    fn decode_unchecked(signal: &Signal) -> Result<Self, SignalError> {
        Ok(Self {
            api_ptr: signal.word(0),
            api_block_ref: BlockRef::from_word(signal.word(1)),
        })
    }
}

/// Seize confirmation: `[api_ptr, tc_ptr]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcSeizeConf {
    /// API connect pointer.
    pub api_ptr: u32,
    /// Coordinator connect pointer assigned by the data node.
    pub tc_ptr: u32,
}

impl Message for TcSeizeConf {
    const KIND: SignalKind = SignalKind::TcSeizeConf;
    const MIN_LENGTH: usize = 2;

    fn encode(&self, signal: &mut Signal) -> Result<(), SignalError> {
        signal.set_data(&[self.api_ptr, self.tc_ptr])
    }

    fn decode_unchecked(signal: &Signal) -> Result<Self, SignalError> {
        Ok(Self {
            api_ptr: signal.word(0),
            tc_ptr: signal.word(1),
        })
    }
}

/// `[api_ptr, error_code]` rejections.
macro_rules! ptr_error_message {
    ($(#[$doc:meta])* $name:ident, $kind:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            /// API connect pointer.
            pub api_ptr: u32,
            /// Error code assigned by the data node.
            pub error_code: ErrorCode,
        }

        impl Message for $name {
            const KIND: SignalKind = SignalKind::$kind;
            const MIN_LENGTH: usize = 2;

            fn encode(&self, signal: &mut Signal) -> Result<(), SignalError> {
                signal.set_data(&[self.api_ptr, self.error_code.0])
            }

            fn decode_unchecked(signal: &Signal) -> Result<Self, SignalError> {
                Ok(Self {
                    api_ptr: signal.word(0),
                    error_code: ErrorCode(signal.word(1)),
                })
            }
        }
    };
}

ptr_error_message!(
    /// Seize rejection.
    TcSeizeRef,
    TcSeizeRef
);
ptr_error_message!(
    /// Release rejection.
    TcReleaseRef,
    TcReleaseRef
);

/// Release a seized record: `[tc_ptr, api_block_ref, api_ptr]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcReleaseReq {
    /// Coordinator connect pointer being released.
    pub tc_ptr: u32,
    /// Block the reply is addressed to.
    pub api_block_ref: BlockRef,
    /// API connect pointer.
    pub api_ptr: u32,
}

impl Message for TcReleaseReq {
    const KIND: SignalKind = SignalKind::TcReleaseReq;
    const MIN_LENGTH: usize = 3;

    fn encode(&self, signal: &mut Signal) -> Result<(), SignalError> {
        signal.set_data(&[self.tc_ptr, self.api_block_ref.to_word(), self.api_ptr])
    }

    fn decode_unchecked(signal: &Signal) -> Result<Self, SignalError> {
        Ok(Self {
            tc_ptr: signal.word(0),
            api_block_ref: BlockRef::from_word(signal.word(1)),
            api_ptr: signal.word(2),
        })
    }
}

/// Release confirmation: `[api_ptr]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcReleaseConf {
    /// API connect pointer.
    pub api_ptr: u32,
}

impl Message for TcReleaseConf {
    const KIND: SignalKind = SignalKind::TcReleaseConf;
    const MIN_LENGTH: usize = 1;

    fn encode(&self, signal: &mut Signal) -> Result<(), SignalError> {
        signal.set_data(&[self.api_ptr])
    }

    fn decode_unchecked(signal: &Signal) -> Result<Self, SignalError> {
        Ok(Self {
            api_ptr: signal.word(0),
        })
    }
}

transid_message!(
    /// Commit a started transaction.
    TcCommitReq,
    TcCommitReq,
    tc_ptr
);
transid_message!(
    /// Roll back a started transaction.
    TcRollbackReq,
    TcRollbackReq,
    tc_ptr
);
transid_message!(
    /// Keep an idle transaction alive on the coordinator.
    TcHbRep,
    TcHbRep,
    tc_ptr
);
transid_message!(
    /// Commit confirmation.
    TcCommitConf,
    TcCommitConf,
    api_ptr
);
transid_message!(
    /// Rollback confirmation.
    TcRollbackConf,
    TcRollbackConf,
    api_ptr
);
transid_error_message!(
    /// Commit rejection; the transaction is aborted.
    TcCommitRef,
    TcCommitRef
);
transid_error_message!(
    /// Rollback rejection.
    TcRollbackRef,
    TcRollbackRef
);
transid_error_message!(
    /// Unsolicited abort report from the coordinator.
    TcRollbackRep,
    TcRollbackRep
);

/// Row operation requested by a TCKEYREQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    /// Read by primary key.
    Read = 0,
    /// Insert a new row.
    Insert = 1,
    /// Update an existing row.
    Update = 2,
    /// Delete a row.
    Delete = 3,
    /// Insert or update.
    Write = 4,
}

impl OperationType {
    const fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(Self::Read),
            1 => Some(Self::Insert),
            2 => Some(Self::Update),
            3 => Some(Self::Delete),
            4 => Some(Self::Write),
            _ => None,
        }
    }

    /// Whether the data node returns row data for this operation.
    pub const fn returns_data(self) -> bool {
        matches!(self, Self::Read)
    }
}

/// Packed request-info word of a TCKEYREQ.
///
/// ```text
/// bits 0-2   operation type
/// bit  4     start of transaction
/// bit  5     commit after this operation
/// bit  6     last operation of the execute batch
/// bit  7     ignore errors (abort option)
/// bit  8     key and attributes carried as long sections
/// bits 16-27 key length in words
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestInfo {
    /// Operation type.
    pub operation: OperationType,
    /// First operation of the transaction.
    pub start: bool,
    /// Commit after this operation.
    pub commit: bool,
    /// Last operation of the execute batch.
    pub execute: bool,
    /// Continue after per-operation errors.
    pub ignore_error: bool,
    /// Key and attributes travel as long sections.
    pub long_sections: bool,
    /// Key length in words.
    pub key_len: u16,
}

impl RequestInfo {
    /// Info word for a plain operation with no flags.
    pub const fn new(operation: OperationType) -> Self {
        Self {
            operation,
            start: false,
            commit: false,
            execute: false,
            ignore_error: false,
            long_sections: false,
            key_len: 0,
        }
    }

    /// Pack into the wire word.
    pub const fn to_word(self) -> u32 {
        (self.operation as u32)
            | (self.start as u32) << 4
            | (self.commit as u32) << 5
            | (self.execute as u32) << 6
            | (self.ignore_error as u32) << 7
            | (self.long_sections as u32) << 8
            | ((self.key_len as u32) & 0x0FFF) << 16
    }

    /// Unpack from the wire word.
    pub fn from_word(word: u32) -> Result<Self, SignalError> {
        let operation =
            OperationType::from_bits(word & 0b111).ok_or_else(|| SignalError::Malformed {
                kind: SignalKind::TcKeyReq.name(),
                message: format!("unknown operation type {}", word & 0b111),
            })?;
        Ok(Self {
            operation,
            start: word & (1 << 4) != 0,
            commit: word & (1 << 5) != 0,
            execute: word & (1 << 6) != 0,
            ignore_error: word & (1 << 7) != 0,
            long_sections: word & (1 << 8) != 0,
            key_len: ((word >> 16) & 0x0FFF) as u16,
        })
    }
}

/// Single-row key operation.
///
/// ```text
/// [api_ptr, tc_ptr, attr_len, table_id, request_info, schema_version,
///  transid_lo, transid_hi, api_op_ptr, key (<=8), attrs (<=5)]
/// ```
///
/// Keys longer than the inline area continue in KEYINFO signals and
/// attributes in ATTRINFO signals, unless long sections are used, in
/// which case section 0 holds the key and section 1 the attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcKeyReq {
    /// API connect pointer.
    pub api_ptr: u32,
    /// Coordinator connect pointer.
    pub tc_ptr: u32,
    /// Table id.
    pub table_id: u32,
    /// Table schema version.
    pub schema_version: u32,
    /// Request flags.
    pub info: RequestInfo,
    /// Transaction id.
    pub transaction_id: TransactionId,
    /// Operation pointer echoed in confirmations and row data.
    pub api_op_ptr: u32,
    /// Declared attribute length (words).
    pub attr_len: u32,
    /// Key words received or to send.
    pub key: Vec<u32>,
    /// Attribute words received or to send.
    pub attr: Vec<u32>,
}

impl TcKeyReq {
    /// Encode into the TCKEYREQ followed by any continuation signals.
    ///
    /// The declared key and attribute lengths are taken from `key` and
    /// `attr`.
    pub fn to_signals(&self, long_sections: bool) -> Result<Vec<Signal>, SignalError> {
        let mut info = self.info;
        info.long_sections = long_sections;
        info.key_len = u16::try_from(self.key.len())
            .ok()
            .filter(|len| *len <= 0x0FFF)
            .ok_or(SignalError::Malformed {
                kind: SignalKind::TcKeyReq.name(),
                message: format!("key of {} words is too long", self.key.len()),
            })?;

        let mut head = Signal::with_kind(SignalKind::TcKeyReq);
        head.set_data(&[
            self.api_ptr,
            self.tc_ptr,
            self.attr.len() as u32,
            self.table_id,
            info.to_word(),
            self.schema_version,
            self.transaction_id.low(),
            self.transaction_id.high(),
            self.api_op_ptr,
        ])?;

        if long_sections {
            head.add_section(self.key.clone())?;
            if !self.attr.is_empty() {
                head.add_section(self.attr.clone())?;
            }
            return Ok(vec![head]);
        }

        let key_inline = self.key.len().min(INLINE_KEY_WORDS);
        for word in &self.key[..key_inline] {
            head.push_word(*word)?;
        }
        let attr_inline = if self.key.len() <= INLINE_KEY_WORDS {
            self.attr.len().min(INLINE_ATTR_WORDS)
        } else {
            0
        };
        for word in &self.attr[..attr_inline] {
            head.push_word(*word)?;
        }

        let mut signals = vec![head];
        for chunk in self.key[key_inline..].chunks(CONTINUATION_WORDS) {
            signals.push(
                KeyInfo {
                    tc_ptr: self.tc_ptr,
                    transaction_id: self.transaction_id,
                    data: chunk.to_vec(),
                }
                .to_signal()?,
            );
        }
        for chunk in self.attr[attr_inline..].chunks(CONTINUATION_WORDS) {
            signals.push(
                AttrInfo {
                    tc_ptr: self.tc_ptr,
                    transaction_id: self.transaction_id,
                    data: chunk.to_vec(),
                }
                .to_signal()?,
            );
        }
        Ok(signals)
    }

    /// Decode the head TCKEYREQ. Key and attribute words that travel in
    /// continuation signals are added with [`TcKeyReq::append_continuation`].
    pub fn decode(signal: &Signal) -> Result<Self, SignalError> {
        let malformed = |message: String| SignalError::Malformed {
            kind: SignalKind::TcKeyReq.name(),
            message,
        };
        if signal.kind() != Some(SignalKind::TcKeyReq) {
            return Err(malformed(format!("unexpected signal number {}", signal.gsn())));
        }
        let data = signal.data();
        if data.len() < KEYREQ_HEADER_WORDS {
            return Err(malformed(format!("need 9 words, have {}", data.len())));
        }
        let info = RequestInfo::from_word(data[4])?;
        let key_len = usize::from(info.key_len);
        let attr_len = data[2];

        let (key, attr) = if info.long_sections {
            (
                signal.section(0).unwrap_or_default().to_vec(),
                signal.section(1).unwrap_or_default().to_vec(),
            )
        } else {
            let inline = &data[KEYREQ_HEADER_WORDS..];
            let key_inline = key_len.min(INLINE_KEY_WORDS).min(inline.len());
            let attr_inline = if key_len <= INLINE_KEY_WORDS {
                (attr_len as usize)
                    .min(INLINE_ATTR_WORDS)
                    .min(inline.len() - key_inline)
            } else {
                0
            };
            (
                inline[..key_inline].to_vec(),
                inline[key_inline..key_inline + attr_inline].to_vec(),
            )
        };

        Ok(Self {
            api_ptr: data[0],
            tc_ptr: data[1],
            table_id: data[3],
            schema_version: data[5],
            info,
            transaction_id: transid_at(signal, 6),
            api_op_ptr: data[8],
            attr_len,
            key,
            attr,
        })
    }

    /// Add the words of a KEYINFO or ATTRINFO continuation.
    pub fn append_continuation(&mut self, signal: &Signal) -> Result<(), SignalError> {
        match signal.kind() {
            Some(SignalKind::KeyInfo) => {
                let info = KeyInfo::decode(signal)?;
                self.key.extend_from_slice(&info.data);
            }
            Some(SignalKind::AttrInfo) => {
                let info = AttrInfo::decode(signal)?;
                self.attr.extend_from_slice(&info.data);
            }
            _ => {
                return Err(SignalError::Malformed {
                    kind: SignalKind::TcKeyReq.name(),
                    message: format!("signal {} is not a continuation", signal.gsn()),
                });
            }
        }
        Ok(())
    }

    /// Whether every declared key and attribute word has arrived.
    pub fn is_complete(&self) -> bool {
        self.key.len() == usize::from(self.info.key_len) && self.attr.len() == self.attr_len as usize
    }
}

/// Continuation shape: `[tc_ptr, transid_lo, transid_hi, data (<=22)]`.
macro_rules! continuation_message {
    ($(#[$doc:meta])* $name:ident, $kind:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            /// Coordinator connect pointer.
            pub tc_ptr: u32,
            /// Transaction id.
            pub transaction_id: TransactionId,
            /// Continuation words.
            pub data: Vec<u32>,
        }

        impl Message for $name {
            const KIND: SignalKind = SignalKind::$kind;
            const MIN_LENGTH: usize = 3;

            fn encode(&self, signal: &mut Signal) -> Result<(), SignalError> {
                if self.data.len() > CONTINUATION_WORDS {
                    return Err(SignalError::InlineOverflow {
                        length: 3 + self.data.len(),
                    });
                }
                signal.set_data(&[
                    self.tc_ptr,
                    self.transaction_id.low(),
                    self.transaction_id.high(),
                ])?;
                for word in &self.data {
                    signal.push_word(*word)?;
                }
                Ok(())
            }

            fn decode_unchecked(signal: &Signal) -> Result<Self, SignalError> {
                Ok(Self {
                    tc_ptr: signal.word(0),
                    transaction_id: transid_at(signal, 1),
                    data: signal.data()[3..].to_vec(),
                })
            }
        }
    };
}

continuation_message!(
    /// Key words that did not fit in the TCKEYREQ.
    KeyInfo,
    KeyInfo
);
continuation_message!(
    /// Attribute words that did not fit in the TCKEYREQ.
    AttrInfo,
    AttrInfo
);

/// Key operation confirmation.
///
/// ```text
/// [api_ptr, conf_info, transid_lo, transid_hi, (api_op_ptr, read_len) x n]
/// conf_info: n:16 | commit:1
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcKeyConf {
    /// API connect pointer.
    pub api_ptr: u32,
    /// Set when the batch committed.
    pub committed: bool,
    /// Transaction id.
    pub transaction_id: TransactionId,
    /// Resolved operations and the row length each will deliver.
    pub operations: Vec<(u32, u32)>,
}

impl Message for TcKeyConf {
    const KIND: SignalKind = SignalKind::TcKeyConf;
    const MIN_LENGTH: usize = 4;

    fn encode(&self, signal: &mut Signal) -> Result<(), SignalError> {
        if self.operations.len() > MAX_CONF_OPERATIONS {
            return Err(SignalError::InlineOverflow {
                length: 4 + 2 * self.operations.len(),
            });
        }
        let info = self.operations.len() as u32 | (self.committed as u32) << 16;
        signal.set_data(&[
            self.api_ptr,
            info,
            self.transaction_id.low(),
            self.transaction_id.high(),
        ])?;
        for (op, len) in &self.operations {
            signal.push_word(*op)?;
            signal.push_word(*len)?;
        }
        Ok(())
    }

    fn decode_unchecked(signal: &Signal) -> Result<Self, SignalError> {
        let info = signal.word(1);
        let count = (info & 0xFFFF) as usize;
        let pairs = &signal.data()[4..];
        if count > MAX_CONF_OPERATIONS || pairs.len() < count * 2 {
            return Err(SignalError::Malformed {
                kind: Self::KIND.name(),
                message: format!("{count} operations declared, {} words present", pairs.len()),
            });
        }
        Ok(Self {
            api_ptr: signal.word(0),
            committed: info & (1 << 16) != 0,
            transaction_id: transid_at(signal, 2),
            operations: pairs
                .chunks_exact(2)
                .take(count)
                .map(|p| (p[0], p[1]))
                .collect(),
        })
    }
}

/// Key operation rejection: `[api_ptr, transid_lo, transid_hi, error_code, api_op_ptr]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcKeyRef {
    /// API connect pointer.
    pub api_ptr: u32,
    /// Transaction id.
    pub transaction_id: TransactionId,
    /// Error code.
    pub error_code: ErrorCode,
    /// Rejected operation.
    pub api_op_ptr: u32,
}

impl Message for TcKeyRef {
    const KIND: SignalKind = SignalKind::TcKeyRef;
    const MIN_LENGTH: usize = 5;

    fn encode(&self, signal: &mut Signal) -> Result<(), SignalError> {
        signal.set_data(&[
            self.api_ptr,
            self.transaction_id.low(),
            self.transaction_id.high(),
            self.error_code.0,
            self.api_op_ptr,
        ])
    }

    fn decode_unchecked(signal: &Signal) -> Result<Self, SignalError> {
        Ok(Self {
            api_ptr: signal.word(0),
            transaction_id: transid_at(signal, 1),
            error_code: ErrorCode(signal.word(3)),
            api_op_ptr: signal.word(4),
        })
    }
}

/// Row data for an operation or scan receiver.
///
/// `[receiver_id, transid_lo, transid_hi, data...]`; data that does not fit
/// inline travels in section 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransIdAi {
    /// Operation or scan receiver the data belongs to.
    pub receiver_id: u32,
    /// Transaction id.
    pub transaction_id: TransactionId,
    /// Row words.
    pub data: Vec<u32>,
}

impl Message for TransIdAi {
    const KIND: SignalKind = SignalKind::TransIdAi;
    const MIN_LENGTH: usize = 3;

    fn encode(&self, signal: &mut Signal) -> Result<(), SignalError> {
        signal.set_data(&[
            self.receiver_id,
            self.transaction_id.low(),
            self.transaction_id.high(),
        ])?;
        if self.data.len() <= CONTINUATION_WORDS {
            for word in &self.data {
                signal.push_word(*word)?;
            }
            Ok(())
        } else {
            signal.add_section(self.data.clone())
        }
    }

    fn decode_unchecked(signal: &Signal) -> Result<Self, SignalError> {
        let data = match signal.section(0) {
            Some(section) => section.to_vec(),
            None => signal.data()[3..].to_vec(),
        };
        Ok(Self {
            receiver_id: signal.word(0),
            transaction_id: transid_at(signal, 1),
            data,
        })
    }
}

/// Node failure report: `[node]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeFailRep {
    /// Failed node.
    pub node: NodeId,
}

impl Message for NodeFailRep {
    const KIND: SignalKind = SignalKind::NodeFailRep;
    const MIN_LENGTH: usize = 1;

    fn encode(&self, signal: &mut Signal) -> Result<(), SignalError> {
        signal.set_data(&[u32::from(self.node.get())])
    }

    fn decode_unchecked(signal: &Signal) -> Result<Self, SignalError> {
        Ok(Self {
            node: NodeId(signal.word(0) as u16),
        })
    }
}
