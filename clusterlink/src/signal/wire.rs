//! Byte framing for signals.
//!
//! Frame format: `[length:4][checksum:4][body:N]`
//!
//! - **length**: total frame size including the 8-byte frame header (LE u32)
//! - **checksum**: CRC32C of the body
//! - **body**: little-endian 32-bit words:
//!
//! ```text
//! word 0   gsn:16 | version:4 | fragment:2 | sections:2 | trace:8
//! word 1   receiver block:16 | inline length:5 | reserved:11
//! word 2   sender block:16 | sender node:16
//! word 3   sender signal id
//! ...      one length word per section
//! ...      inline words
//! ...      section words, section 0 first
//! ```

use super::{FragmentState, MAX_DATA_WORDS, MAX_SECTIONS, Signal, SignalError};
use crate::types::{BlockNumber, BlockRef, NodeId};

/// Frame header size: 4 (length) + 4 (checksum).
pub const FRAME_HEADER_SIZE: usize = 8;

/// Maximum frame size (1MB).
///
/// Larger frames are rejected before allocation.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

const BODY_HEADER_WORDS: usize = 4;

/// Encode a signal into a checksummed frame.
///
/// # Errors
///
/// - `InlineOverflow` if the inline length exceeds [`MAX_DATA_WORDS`]
/// - `TooManySections` if more than [`MAX_SECTIONS`] sections are attached
/// - `FrameTooLarge` if the frame would exceed [`MAX_FRAME_SIZE`]
pub fn encode_signal(signal: &Signal) -> Result<Vec<u8>, SignalError> {
    if signal.length() > MAX_DATA_WORDS {
        return Err(SignalError::InlineOverflow {
            length: signal.length(),
        });
    }
    if signal.section_count() > MAX_SECTIONS {
        return Err(SignalError::TooManySections {
            count: signal.section_count(),
        });
    }

    let body_words =
        BODY_HEADER_WORDS + signal.section_count() + signal.length() + signal.section_words();
    let total = FRAME_HEADER_SIZE + body_words * 4;
    if total > MAX_FRAME_SIZE {
        return Err(SignalError::FrameTooLarge { size: total });
    }

    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&(total as u32).to_le_bytes());
    frame.extend_from_slice(&0u32.to_le_bytes());

    let word0 = u32::from(signal.gsn())
        | (u32::from(signal.version() & 0x0F) << 16)
        | (u32::from(signal.fragment_state().bits()) << 20)
        | ((signal.section_count() as u32) << 22)
        | (u32::from(signal.trace()) << 24);
    let word1 = u32::from(signal.receiver_block().get()) | ((signal.length() as u32) << 16);
    let sender = signal.sender();
    let word2 = u32::from(sender.block.get()) | (u32::from(sender.node.get()) << 16);

    for word in [word0, word1, word2, signal.signal_id()] {
        frame.extend_from_slice(&word.to_le_bytes());
    }
    for index in 0..signal.section_count() {
        let len = signal.section(index).map_or(0, <[u32]>::len);
        frame.extend_from_slice(&(len as u32).to_le_bytes());
    }
    for word in &signal.data[..signal.length()] {
        frame.extend_from_slice(&word.to_le_bytes());
    }
    for section in &signal.sections {
        for word in section {
            frame.extend_from_slice(&word.to_le_bytes());
        }
    }

    let checksum = crc32c::crc32c(&frame[FRAME_HEADER_SIZE..]);
    frame[4..8].copy_from_slice(&checksum.to_le_bytes());
    Ok(frame)
}

/// Decode a complete frame into a new signal.
///
/// # Errors
///
/// - `InsufficientData`: frame is truncated
/// - `ChecksumMismatch`: body was corrupted
/// - `InvalidLength` / `FrameTooLarge`: length field is malformed
/// - `SectionCountMismatch`: section lengths disagree with the body size
pub fn decode_signal(data: &[u8]) -> Result<Signal, SignalError> {
    let mut signal = Signal::new();
    decode_signal_into(data, &mut signal)?;
    Ok(signal)
}

/// Decode a complete frame into an existing (reused) signal buffer.
///
/// Returns the number of bytes consumed. The buffer's chain link and slot
/// are preserved.
pub fn decode_signal_into(data: &[u8], signal: &mut Signal) -> Result<usize, SignalError> {
    let total = frame_length(data)?;
    if data.len() < total {
        return Err(SignalError::InsufficientData {
            needed: total,
            have: data.len(),
        });
    }
    decode_body(&data[..total], signal)?;
    Ok(total)
}

/// Try to decode from a buffer that may hold a partial frame.
///
/// # Returns
///
/// - `Ok(Some((signal, consumed)))` when a complete frame was decoded
/// - `Ok(None)` when more bytes are needed (not an error)
/// - `Err` when the data is malformed
pub fn try_decode_signal(data: &[u8]) -> Result<Option<(Signal, usize)>, SignalError> {
    let mut signal = Signal::new();
    Ok(try_decode_signal_into(data, &mut signal)?.map(|consumed| (signal, consumed)))
}

/// Streaming variant of [`decode_signal_into`].
pub fn try_decode_signal_into(
    data: &[u8],
    signal: &mut Signal,
) -> Result<Option<usize>, SignalError> {
    if data.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }
    let total = frame_length(data)?;
    if data.len() < total {
        return Ok(None);
    }
    decode_body(&data[..total], signal)?;
    Ok(Some(total))
}

fn frame_length(data: &[u8]) -> Result<usize, SignalError> {
    if data.len() < FRAME_HEADER_SIZE {
        return Err(SignalError::InsufficientData {
            needed: FRAME_HEADER_SIZE,
            have: data.len(),
        });
    }
    let length = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let total = length as usize;
    if total < FRAME_HEADER_SIZE + BODY_HEADER_WORDS * 4 || (total - FRAME_HEADER_SIZE) % 4 != 0 {
        return Err(SignalError::InvalidLength { length });
    }
    if total > MAX_FRAME_SIZE {
        return Err(SignalError::FrameTooLarge { size: total });
    }
    Ok(total)
}

fn decode_body(frame: &[u8], signal: &mut Signal) -> Result<(), SignalError> {
    let expected = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
    let body = &frame[FRAME_HEADER_SIZE..];
    let actual = crc32c::crc32c(body);
    if actual != expected {
        return Err(SignalError::ChecksumMismatch { expected, actual });
    }

    let words: Vec<u32> = body
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let word0 = words[0];
    let word1 = words[1];
    let word2 = words[2];
    let section_count = ((word0 >> 22) & 0b11) as usize;
    let length = ((word1 >> 16) & 0x1F) as usize;
    if length > MAX_DATA_WORDS {
        return Err(SignalError::InlineOverflow { length });
    }

    let mut cursor = BODY_HEADER_WORDS;
    if words.len() < cursor + section_count + length {
        return Err(SignalError::SectionCountMismatch {
            declared: section_count,
            present: words.len().saturating_sub(cursor + length),
        });
    }
    let section_lens: Vec<usize> = words[cursor..cursor + section_count]
        .iter()
        .map(|w| *w as usize)
        .collect();
    cursor += section_count;

    let section_total: usize = section_lens.iter().sum();
    if words.len() != cursor + length + section_total {
        return Err(SignalError::SectionCountMismatch {
            declared: section_count,
            present: words.len() - cursor - length,
        });
    }

    signal.clear();
    signal.gsn = word0 as u16;
    signal.version = ((word0 >> 16) & 0x0F) as u8;
    signal.fragment = FragmentState::from_bits(((word0 >> 20) & 0b11) as u8);
    signal.trace = (word0 >> 24) as u8;
    signal.receiver_block = BlockNumber(word1 as u16);
    signal.sender = BlockRef::new(NodeId((word2 >> 16) as u16), BlockNumber(word2 as u16));
    signal.signal_id = words[3];
    signal.data[..length].copy_from_slice(&words[cursor..cursor + length]);
    signal.length = length;
    cursor += length;

    for len in section_lens {
        signal.sections.push(words[cursor..cursor + len].to_vec());
        cursor += len;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SignalKind;

    fn sample() -> Signal {
        let mut signal = Signal::with_kind(SignalKind::ScanTabReq);
        signal
            .set_data(&[1, 2, 3, 4, 5, 6, 7, 8])
            .expect("set data");
        signal.set_sender(BlockRef::new(NodeId(9), BlockNumber(0x8002)));
        signal.set_signal_id(0xDEAD_BEEF);
        signal.set_trace(0x5A);
        signal.add_section(vec![10, 11]).expect("section 0");
        signal.add_section(vec![]).expect("section 1");
        signal.add_section(vec![12]).expect("section 2");
        signal
    }

    #[test]
    fn test_encode_decode_preserves_signal() {
        let signal = sample();
        let frame = encode_signal(&signal).expect("encode");
        let decoded = decode_signal(&frame).expect("decode");
        assert_eq!(decoded, signal);
        assert_eq!(decoded.section(1), Some(&[][..]));
    }

    #[test]
    fn test_header_bit_layout() {
        let frame = encode_signal(&sample()).expect("encode");
        let word0 = u32::from_le_bytes(frame[8..12].try_into().expect("slice"));
        assert_eq!(word0 & 0xFFFF, u32::from(SignalKind::ScanTabReq.gsn()));
        assert_eq!((word0 >> 16) & 0xF, 1);
        assert_eq!((word0 >> 22) & 0b11, 3);
        assert_eq!(word0 >> 24, 0x5A);

        let word1 = u32::from_le_bytes(frame[12..16].try_into().expect("slice"));
        assert_eq!(word1 & 0xFFFF, u32::from(BlockNumber::TC.get()));
        assert_eq!((word1 >> 16) & 0x1F, 8);

        let length = u32::from_le_bytes(frame[0..4].try_into().expect("slice"));
        assert_eq!(length as usize, frame.len());
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut frame = encode_signal(&sample()).expect("encode");
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(
            decode_signal(&frame),
            Err(SignalError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_frame() {
        let frame = encode_signal(&sample()).expect("encode");
        assert!(matches!(
            decode_signal(&frame[..frame.len() - 4]),
            Err(SignalError::InsufficientData { .. })
        ));
        assert!(matches!(
            decode_signal(&frame[..4]),
            Err(SignalError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_try_decode_streaming() {
        let frame = encode_signal(&sample()).expect("encode");
        assert!(matches!(try_decode_signal(&frame[..6]), Ok(None)));
        assert!(matches!(try_decode_signal(&frame[..20]), Ok(None)));

        let mut stream = frame.clone();
        stream.extend_from_slice(&frame);
        stream.extend_from_slice(b"tail");
        let (first, consumed) = try_decode_signal(&stream)
            .expect("decode")
            .expect("complete frame");
        assert_eq!(consumed, frame.len());
        assert_eq!(first, sample());
    }

    #[test]
    fn test_decode_into_reuses_buffer() {
        let mut buffer = Signal::new();
        buffer.set_buffer_slot(Some(3));
        let frame = encode_signal(&sample()).expect("encode");
        decode_signal_into(&frame, &mut buffer).expect("decode");
        assert_eq!(buffer, sample());
        assert_eq!(buffer.buffer_slot(), Some(3));

        let small = encode_signal(&Signal::with_kind(SignalKind::TcReleaseConf)).expect("encode");
        decode_signal_into(&small, &mut buffer).expect("decode");
        assert_eq!(buffer.section_count(), 0);
        assert_eq!(buffer.kind(), Some(SignalKind::TcReleaseConf));
    }

    #[test]
    fn test_invalid_length_field() {
        let mut frame = vec![0u8; 24];
        frame[0..4].copy_from_slice(&10u32.to_le_bytes());
        assert!(matches!(
            decode_signal(&frame),
            Err(SignalError::InvalidLength { length: 10 })
        ));
    }

    #[test]
    fn test_oversized_sections_rejected() {
        let mut signal = Signal::with_kind(SignalKind::TcKeyReq);
        signal
            .add_section(vec![0; MAX_FRAME_SIZE / 4])
            .expect("section");
        assert!(matches!(
            encode_signal(&signal),
            Err(SignalError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_section_count_mismatch() {
        let mut frame = encode_signal(&sample()).expect("encode");
        // Bump the declared length of section 0 and refresh the checksum.
        frame[24..28].copy_from_slice(&5u32.to_le_bytes());
        let checksum = crc32c::crc32c(&frame[FRAME_HEADER_SIZE..]);
        frame[4..8].copy_from_slice(&checksum.to_le_bytes());
        assert!(matches!(
            decode_signal(&frame),
            Err(SignalError::SectionCountMismatch { .. })
        ));
    }
}
