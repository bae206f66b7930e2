//! Signal envelope: the fixed-layout message exchanged with data nodes.
//!
//! A [`Signal`] carries a small header, up to [`MAX_DATA_WORDS`] inline
//! words and up to [`MAX_SECTIONS`] variable-length long sections.
//!
//! ```text
//! ┌──────────── header ─────────────┐┌─ inline (≤25) ─┐┌─ sections (≤3) ─┐
//! │ gsn vers frag trace             ││ w1 w2 ... wN   ││ s0  s1  s2      │
//! │ receiver block, inline length   ││ (wN = frag id  ││                 │
//! │ sender ref, sender signal id    ││  if fragmented)││                 │
//! └─────────────────────────────────┘└────────────────┘└─────────────────┘
//! ```
//!
//! Two fields are instance-local bookkeeping and are never copied: the
//! `next` link used by [`SignalChain`] and the receive-buffer slot a decoded
//! signal occupies. Everything else survives [`Signal::copy_from`] and
//! [`Clone`].

mod fragment;
mod kind;
mod wire;

pub use fragment::{FragmentAssembler, split_into_fragments};
pub use kind::SignalKind;
pub use wire::{
    FRAME_HEADER_SIZE, MAX_FRAME_SIZE, decode_signal, decode_signal_into, encode_signal,
    try_decode_signal, try_decode_signal_into,
};

use crate::types::{BlockNumber, BlockRef};

/// Maximum number of inline data words.
pub const MAX_DATA_WORDS: usize = 25;

/// Maximum number of long sections.
pub const MAX_SECTIONS: usize = 3;

/// Protocol version written into every outgoing header.
pub const SIGNAL_VERSION: u8 = 1;

/// Errors raised while building, encoding or decoding signals.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalError {
    /// Signal number is not part of the protocol.
    #[error("unknown signal type {0}")]
    UnknownSignalType(u16),

    /// Word index outside the inline payload.
    #[error("word index {index} out of range")]
    IndexOutOfRange {
        /// Offending index.
        index: usize,
    },

    /// Inline payload would exceed [`MAX_DATA_WORDS`].
    #[error("inline length {length} exceeds {max} words", max = MAX_DATA_WORDS)]
    InlineOverflow {
        /// Requested length.
        length: usize,
    },

    /// More than [`MAX_SECTIONS`] sections.
    #[error("{count} sections exceed the maximum of {max}", max = MAX_SECTIONS)]
    TooManySections {
        /// Requested section count.
        count: usize,
    },

    /// Header section count disagrees with the section data present.
    #[error("section count {declared} does not match {present} sections present")]
    SectionCountMismatch {
        /// Count declared in the header.
        declared: usize,
        /// Sections actually present.
        present: usize,
    },

    /// Not enough bytes to decode.
    #[error("insufficient data: need {needed} bytes, have {have}")]
    InsufficientData {
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        have: usize,
    },

    /// Frame checksum verification failed.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum from the frame header.
        expected: u32,
        /// Checksum computed over the body.
        actual: u32,
    },

    /// Frame exceeds [`MAX_FRAME_SIZE`].
    #[error("frame too large: {size} bytes (max {max})", max = MAX_FRAME_SIZE)]
    FrameTooLarge {
        /// Frame size in bytes.
        size: usize,
    },

    /// Length field is malformed.
    #[error("invalid frame length: {length}")]
    InvalidLength {
        /// Length field value.
        length: u32,
    },

    /// Fragment does not belong to the message being assembled.
    #[error("fragment id {actual} does not match assembly {expected:?}")]
    FragmentMismatch {
        /// Fragment id currently being assembled, if any.
        expected: Option<u32>,
        /// Fragment id carried by the rejected signal.
        actual: u32,
    },

    /// Signal payload is too short or otherwise malformed for its type.
    #[error("malformed {kind}: {message}")]
    Malformed {
        /// Signal type being decoded.
        kind: &'static str,
        /// What was wrong.
        message: String,
    },
}

/// Fragmentation status carried in the 2-bit header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FragmentState {
    /// Unfragmented signal.
    None = 0,
    /// First fragment of a multi-fragment message.
    First = 1,
    /// Interior continuation.
    Middle = 2,
    /// Terminal fragment.
    Last = 3,
}

impl FragmentState {
    /// Decode from the 2-bit header field.
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => FragmentState::None,
            1 => FragmentState::First,
            2 => FragmentState::Middle,
            _ => FragmentState::Last,
        }
    }

    /// Encode into the 2-bit header field.
    pub const fn bits(self) -> u8 {
        self as u8
    }
}

/// A single protocol message.
#[derive(Debug)]
pub struct Signal {
    version: u8,
    gsn: u16,
    receiver_block: BlockNumber,
    sender: BlockRef,
    trace: u8,
    signal_id: u32,
    length: usize,
    fragment: FragmentState,
    data: [u32; MAX_DATA_WORDS],
    sections: Vec<Vec<u32>>,

    // Instance-local bookkeeping, excluded from copies.
    next: Option<Box<Signal>>,
    buffer_slot: Option<u32>,
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl Signal {
    /// Empty signal with no type.
    pub const fn new() -> Self {
        Self {
            version: SIGNAL_VERSION,
            gsn: 0,
            receiver_block: BlockNumber(0),
            sender: BlockRef::new(crate::types::NodeId(0), BlockNumber(0)),
            trace: 0,
            signal_id: 0,
            length: 0,
            fragment: FragmentState::None,
            data: [0; MAX_DATA_WORDS],
            sections: Vec::new(),
            next: None,
            buffer_slot: None,
        }
    }

    /// Signal of the given kind with its default header.
    pub fn with_kind(kind: SignalKind) -> Self {
        let mut signal = Self::new();
        signal.set_kind(kind);
        signal
    }

    /// Set the signal type from a raw signal number.
    ///
    /// Fills in the default inline length and destination block of the type.
    /// Unknown numbers are rejected and leave the signal untouched.
    pub fn set_type(&mut self, gsn: u16) -> Result<(), SignalError> {
        let kind = SignalKind::from_gsn(gsn).ok_or(SignalError::UnknownSignalType(gsn))?;
        self.set_kind(kind);
        Ok(())
    }

    /// Set the signal type from a known kind.
    pub fn set_kind(&mut self, kind: SignalKind) {
        self.gsn = kind.gsn();
        self.version = SIGNAL_VERSION;
        self.trace = 0;
        self.fragment = FragmentState::None;
        self.length = kind.default_length();
        self.receiver_block = kind.default_receiver();
    }

    /// Raw signal number.
    pub fn gsn(&self) -> u16 {
        self.gsn
    }

    /// Known kind, or `None` for foreign signal numbers.
    pub fn kind(&self) -> Option<SignalKind> {
        SignalKind::from_gsn(self.gsn)
    }

    /// Protocol version.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Destination block.
    pub fn receiver_block(&self) -> BlockNumber {
        self.receiver_block
    }

    /// Set the destination block.
    pub fn set_receiver_block(&mut self, block: BlockNumber) {
        self.receiver_block = block;
    }

    /// Sending block reference.
    pub fn sender(&self) -> BlockRef {
        self.sender
    }

    /// Set the sending block reference.
    pub fn set_sender(&mut self, sender: BlockRef) {
        self.sender = sender;
    }

    /// Trace flag byte.
    pub fn trace(&self) -> u8 {
        self.trace
    }

    /// Set the trace flag byte.
    pub fn set_trace(&mut self, trace: u8) {
        self.trace = trace;
    }

    /// Sender-assigned sequence id.
    pub fn signal_id(&self) -> u32 {
        self.signal_id
    }

    /// Set the sender-assigned sequence id.
    pub fn set_signal_id(&mut self, id: u32) {
        self.signal_id = id;
    }

    /// Inline length in words, including the fragment id word when fragmented.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Set the inline length.
    pub fn set_length(&mut self, length: usize) -> Result<(), SignalError> {
        if length > MAX_DATA_WORDS {
            return Err(SignalError::InlineOverflow { length });
        }
        self.length = length;
        Ok(())
    }

    /// Write inline word `index` (1-based).
    ///
    /// Extends the inline length to cover `index` when needed.
    pub fn set_word(&mut self, value: u32, index: usize) -> Result<(), SignalError> {
        if index == 0 || index > MAX_DATA_WORDS {
            return Err(SignalError::IndexOutOfRange { index });
        }
        self.data[index - 1] = value;
        if index > self.length {
            self.length = index;
        }
        Ok(())
    }

    /// Read inline word `index` (1-based).
    pub fn read_word(&self, index: usize) -> Result<u32, SignalError> {
        if index == 0 || index > self.length {
            return Err(SignalError::IndexOutOfRange { index });
        }
        Ok(self.data[index - 1])
    }

    /// Payload words, excluding the fragment id word of fragmented signals.
    pub fn data(&self) -> &[u32] {
        &self.data[..self.payload_len()]
    }

    /// Replace the inline payload.
    pub fn set_data(&mut self, words: &[u32]) -> Result<(), SignalError> {
        if words.len() > MAX_DATA_WORDS {
            return Err(SignalError::InlineOverflow {
                length: words.len(),
            });
        }
        self.data[..words.len()].copy_from_slice(words);
        self.length = words.len();
        Ok(())
    }

    /// Append one payload word.
    pub fn push_word(&mut self, value: u32) -> Result<(), SignalError> {
        if self.length >= MAX_DATA_WORDS {
            return Err(SignalError::InlineOverflow {
                length: self.length + 1,
            });
        }
        self.data[self.length] = value;
        self.length += 1;
        Ok(())
    }

    /// Payload word at 0-based `index`, or 0 when beyond the payload.
    ///
    /// Used by message decoders after they have checked the minimum length.
    pub(crate) fn word(&self, index: usize) -> u32 {
        self.data().get(index).copied().unwrap_or(0)
    }

    fn payload_len(&self) -> usize {
        if self.fragment == FragmentState::None {
            self.length
        } else {
            self.length.saturating_sub(1)
        }
    }

    /// Fragmentation status.
    pub fn fragment_state(&self) -> FragmentState {
        self.fragment
    }

    /// Set the fragmentation status.
    pub fn set_fragment_state(&mut self, state: FragmentState) {
        self.fragment = state;
    }

    /// True for the first fragment of a multi-fragment message.
    pub fn is_first_fragment(&self) -> bool {
        self.fragment == FragmentState::First
    }

    /// True for unfragmented signals and terminal fragments.
    pub fn is_last_fragment(&self) -> bool {
        matches!(self.fragment, FragmentState::None | FragmentState::Last)
    }

    /// True when this signal is part of a multi-fragment message.
    pub fn is_fragmented(&self) -> bool {
        self.fragment != FragmentState::None
    }

    /// Fragment id, held in the last inline word of fragmented signals.
    pub fn fragment_id(&self) -> u32 {
        if self.fragment == FragmentState::None || self.length == 0 {
            0
        } else {
            self.data[self.length - 1]
        }
    }

    /// Number of attached long sections.
    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    /// Long section `index` (0-based).
    pub fn section(&self, index: usize) -> Option<&[u32]> {
        self.sections.get(index).map(Vec::as_slice)
    }

    /// Attach a long section.
    pub fn add_section(&mut self, words: Vec<u32>) -> Result<(), SignalError> {
        if self.sections.len() >= MAX_SECTIONS {
            return Err(SignalError::TooManySections {
                count: self.sections.len() + 1,
            });
        }
        self.sections.push(words);
        Ok(())
    }

    /// Detach all long sections.
    pub fn take_sections(&mut self) -> Vec<Vec<u32>> {
        std::mem::take(&mut self.sections)
    }

    /// Total words carried in long sections.
    pub fn section_words(&self) -> usize {
        self.sections.iter().map(Vec::len).sum()
    }

    pub(crate) fn sections_mut(&mut self) -> &mut Vec<Vec<u32>> {
        &mut self.sections
    }

    /// Receive-buffer slot this instance was decoded into.
    pub fn buffer_slot(&self) -> Option<u32> {
        self.buffer_slot
    }

    pub(crate) fn set_buffer_slot(&mut self, slot: Option<u32>) {
        self.buffer_slot = slot;
    }

    /// Deep copy of every header field, payload word and section of `other`.
    ///
    /// The chain link and buffer slot of `self` are left as they are.
    pub fn copy_from(&mut self, other: &Signal) {
        self.version = other.version;
        self.gsn = other.gsn;
        self.receiver_block = other.receiver_block;
        self.sender = other.sender;
        self.trace = other.trace;
        self.signal_id = other.signal_id;
        self.length = other.length;
        self.fragment = other.fragment;
        self.data = other.data;
        self.sections.clone_from(&other.sections);
    }

    /// Reset to an empty signal, keeping allocated section storage.
    pub fn clear(&mut self) {
        self.version = SIGNAL_VERSION;
        self.gsn = 0;
        self.receiver_block = BlockNumber(0);
        self.sender = BlockRef::default();
        self.trace = 0;
        self.signal_id = 0;
        self.length = 0;
        self.fragment = FragmentState::None;
        self.sections.clear();
    }
}

impl Clone for Signal {
    fn clone(&self) -> Self {
        let mut copy = Signal::new();
        copy.copy_from(self);
        copy
    }
}

impl PartialEq for Signal {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && self.gsn == other.gsn
            && self.receiver_block == other.receiver_block
            && self.sender == other.sender
            && self.trace == other.trace
            && self.signal_id == other.signal_id
            && self.length == other.length
            && self.fragment == other.fragment
            && self.data[..self.length] == other.data[..other.length]
            && self.sections == other.sections
    }
}

impl Eq for Signal {}

/// Exclusively owned singly linked list of signals.
///
/// Used to hand a batch to the dispatcher in send order.
#[derive(Debug, Default)]
pub struct SignalChain {
    head: Option<Box<Signal>>,
    len: usize,
}

impl SignalChain {
    /// Empty chain.
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    /// Number of linked signals.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no signal is linked.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Link `signal` at the tail.
    pub fn push_back(&mut self, signal: Signal) {
        let mut node = Box::new(signal);
        node.next = None;
        let mut cursor = &mut self.head;
        while let Some(existing) = cursor {
            cursor = &mut existing.next;
        }
        *cursor = Some(node);
        self.len += 1;
    }

    /// Append every signal of `other`, leaving it empty.
    pub fn append(&mut self, other: &mut SignalChain) {
        while let Some(signal) = other.pop_front() {
            self.push_back(signal);
        }
    }

    /// Unlink the head signal.
    pub fn pop_front(&mut self) -> Option<Signal> {
        self.head.take().map(|mut node| {
            self.head = node.next.take();
            self.len -= 1;
            *node
        })
    }

    /// First linked signal.
    pub fn front(&self) -> Option<&Signal> {
        self.head.as_deref()
    }

    /// Last linked signal, mutable.
    pub fn back_mut(&mut self) -> Option<&mut Signal> {
        let mut cursor = self.head.as_deref_mut()?;
        while cursor.next.is_some() {
            cursor = cursor.next.as_deref_mut()?;
        }
        Some(cursor)
    }

    /// Iterate in link order.
    pub fn iter(&self) -> ChainIter<'_> {
        ChainIter {
            cursor: self.head.as_deref(),
        }
    }
}

impl Drop for SignalChain {
    fn drop(&mut self) {
        let mut cursor = self.head.take();
        while let Some(mut node) = cursor {
            cursor = node.next.take();
        }
    }
}

impl FromIterator<Signal> for SignalChain {
    fn from_iter<I: IntoIterator<Item = Signal>>(iter: I) -> Self {
        let mut items: Vec<Signal> = iter.into_iter().collect();
        let mut chain = SignalChain::new();
        while let Some(signal) = items.pop() {
            let mut node = Box::new(signal);
            node.next = chain.head.take();
            chain.head = Some(node);
            chain.len += 1;
        }
        chain
    }
}

/// Borrowing iterator over a [`SignalChain`].
pub struct ChainIter<'a> {
    cursor: Option<&'a Signal>,
}

impl<'a> Iterator for ChainIter<'a> {
    type Item = &'a Signal;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.cursor?;
        self.cursor = current.next.as_deref();
        Some(current)
    }
}
