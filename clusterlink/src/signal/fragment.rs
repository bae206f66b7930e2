//! Splitting oversized signals into fragments and reassembling them.
//!
//! Every fragment repeats the original inline payload followed by one extra
//! word holding the fragment id. Long sections are cut into chunks of at
//! most `max_section_words`; fragment `k` carries chunk `k` of every
//! section (possibly empty), so all fragments declare the same section
//! count.

use std::collections::HashMap;

use tracing::{debug, warn};

use super::{FragmentState, MAX_DATA_WORDS, Signal, SignalError};
use crate::types::NodeId;

/// Split `signal` into fragments whose sections hold at most
/// `max_section_words` words each.
///
/// A signal that already fits is returned unchanged as a single element.
pub fn split_into_fragments(
    signal: &Signal,
    max_section_words: usize,
    fragment_id: u32,
) -> Result<Vec<Signal>, SignalError> {
    if signal.is_fragmented() {
        return Err(SignalError::FragmentMismatch {
            expected: None,
            actual: signal.fragment_id(),
        });
    }
    let chunk = max_section_words.max(1);
    let fragments = signal
        .sections
        .iter()
        .map(|s| s.len().div_ceil(chunk))
        .max()
        .unwrap_or(0)
        .max(1);

    if fragments == 1 {
        return Ok(vec![signal.clone()]);
    }
    if signal.length() >= MAX_DATA_WORDS {
        return Err(SignalError::InlineOverflow {
            length: signal.length() + 1,
        });
    }

    let mut out = Vec::with_capacity(fragments);
    for k in 0..fragments {
        let mut fragment = Signal::new();
        fragment.copy_from(signal);
        fragment.sections_mut().clear();
        for section in &signal.sections {
            let start = (k * chunk).min(section.len());
            let end = ((k + 1) * chunk).min(section.len());
            fragment.sections_mut().push(section[start..end].to_vec());
        }
        fragment.push_word(fragment_id)?;
        fragment.set_fragment_state(match k {
            0 => FragmentState::First,
            k if k + 1 == fragments => FragmentState::Last,
            _ => FragmentState::Middle,
        });
        out.push(fragment);
    }
    debug!(
        gsn = signal.gsn(),
        fragment_id,
        fragments,
        "split signal into fragments"
    );
    Ok(out)
}

/// Reassembles fragmented signals, one message in flight per sending node.
#[derive(Debug, Default)]
pub struct FragmentAssembler {
    partial: HashMap<NodeId, Signal>,
}

impl FragmentAssembler {
    /// Empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one received signal.
    ///
    /// Returns the complete message once the last fragment arrives, the
    /// signal itself when it is not fragmented, and `None` while more
    /// fragments are expected.
    ///
    /// # Errors
    ///
    /// `FragmentMismatch` when a continuation does not belong to the
    /// assembly in progress for `from`, or a first fragment arrives while
    /// another assembly is still open. In the latter case the stale
    /// assembly is discarded and the new one started.
    pub fn accept(&mut self, from: NodeId, signal: Signal) -> Result<Option<Signal>, SignalError> {
        match signal.fragment_state() {
            FragmentState::None => Ok(Some(signal)),
            FragmentState::First => {
                let id = signal.fragment_id();
                if let Some(stale) = self.partial.insert(from, signal) {
                    warn!(
                        %from,
                        stale_id = stale.fragment_id(),
                        fragment_id = id,
                        "first fragment arrived while assembly open"
                    );
                    return Err(SignalError::FragmentMismatch {
                        expected: Some(stale.fragment_id()),
                        actual: id,
                    });
                }
                Ok(None)
            }
            FragmentState::Middle | FragmentState::Last => {
                let id = signal.fragment_id();
                let Some(assembly) = self.partial.get_mut(&from) else {
                    return Err(SignalError::FragmentMismatch {
                        expected: None,
                        actual: id,
                    });
                };
                if assembly.fragment_id() != id
                    || assembly.section_count() != signal.section_count()
                {
                    return Err(SignalError::FragmentMismatch {
                        expected: Some(assembly.fragment_id()),
                        actual: id,
                    });
                }
                for (target, chunk) in assembly.sections_mut().iter_mut().zip(&signal.sections) {
                    target.extend_from_slice(chunk);
                }
                if signal.fragment_state() == FragmentState::Middle {
                    return Ok(None);
                }

                let Some(mut complete) = self.partial.remove(&from) else {
                    return Ok(None);
                };
                let payload = complete.length().saturating_sub(1);
                complete.set_length(payload)?;
                complete.set_fragment_state(FragmentState::None);
                Ok(Some(complete))
            }
        }
    }

    /// Drop any partial message from `node`, e.g. after it failed.
    pub fn abandon(&mut self, node: NodeId) -> bool {
        self.partial.remove(&node).is_some()
    }

    /// Number of assemblies in progress.
    pub fn pending(&self) -> usize {
        self.partial.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SignalKind;

    fn big_signal() -> Signal {
        let mut signal = Signal::with_kind(SignalKind::TcKeyReq);
        signal.set_data(&[1, 2, 3]).expect("data");
        signal.add_section((0..10).collect()).expect("keys");
        signal.add_section((100..103).collect()).expect("attrs");
        signal
    }

    #[test]
    fn test_small_signal_is_not_split() {
        let signal = big_signal();
        let parts = split_into_fragments(&signal, 64, 7).expect("split");
        assert_eq!(parts.len(), 1);
        assert!(!parts[0].is_fragmented());
        assert_eq!(parts[0], signal);
    }

    #[test]
    fn test_split_layout() {
        let parts = split_into_fragments(&big_signal(), 4, 7).expect("split");
        assert_eq!(parts.len(), 3);
        let states: Vec<_> = parts.iter().map(Signal::fragment_state).collect();
        assert_eq!(
            states,
            vec![
                FragmentState::First,
                FragmentState::Middle,
                FragmentState::Last
            ]
        );
        for part in &parts {
            assert_eq!(part.data(), &[1, 2, 3]);
            assert_eq!(part.fragment_id(), 7);
            assert_eq!(part.section_count(), 2);
        }
        assert_eq!(parts[0].section(1), Some(&[100, 101, 102][..]));
        assert_eq!(parts[2].section(0), Some(&[8, 9][..]));
        assert_eq!(parts[2].section(1), Some(&[][..]));
    }

    #[test]
    fn test_reassembly_restores_original() {
        let original = big_signal();
        let mut assembler = FragmentAssembler::new();
        let mut result = None;
        for part in split_into_fragments(&original, 3, 11).expect("split") {
            result = assembler.accept(NodeId(2), part).expect("accept");
        }
        assert_eq!(result, Some(original));
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_interleaved_nodes() {
        let original = big_signal();
        let a = split_into_fragments(&original, 4, 1).expect("split");
        let b = split_into_fragments(&original, 4, 2).expect("split");
        let mut assembler = FragmentAssembler::new();
        for (pa, pb) in a.into_iter().zip(b) {
            let ra = assembler.accept(NodeId(1), pa).expect("a");
            let rb = assembler.accept(NodeId(2), pb).expect("b");
            assert_eq!(ra.is_some(), rb.is_some());
        }
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_continuation_without_first() {
        let parts = split_into_fragments(&big_signal(), 4, 5).expect("split");
        let mut assembler = FragmentAssembler::new();
        let last = parts.into_iter().last().expect("last");
        assert_eq!(
            assembler.accept(NodeId(1), last),
            Err(SignalError::FragmentMismatch {
                expected: None,
                actual: 5
            })
        );
    }

    #[test]
    fn test_mismatched_fragment_id() {
        let a = split_into_fragments(&big_signal(), 4, 1).expect("split");
        let b = split_into_fragments(&big_signal(), 4, 2).expect("split");
        let mut assembler = FragmentAssembler::new();
        assembler
            .accept(NodeId(1), a[0].clone())
            .expect("first");
        assert_eq!(
            assembler.accept(NodeId(1), b[1].clone()),
            Err(SignalError::FragmentMismatch {
                expected: Some(1),
                actual: 2
            })
        );
        assert!(assembler.abandon(NodeId(1)));
        assert!(!assembler.abandon(NodeId(1)));
    }

    #[test]
    fn test_full_inline_payload_cannot_fragment() {
        let mut signal = Signal::new();
        signal.set_data(&[0; MAX_DATA_WORDS]).expect("data");
        signal.add_section(vec![0; 10]).expect("section");
        assert!(matches!(
            split_into_fragments(&signal, 2, 1),
            Err(SignalError::InlineOverflow { .. })
        ));
    }
}
