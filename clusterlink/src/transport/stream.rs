//! Byte-stream transport: framed signals over any `Read`/`Write` pair.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{InboundEvent, Transport, TransportError};
use crate::signal::{Signal, encode_signal, try_decode_signal_into};
use crate::types::NodeId;

const READ_CHUNK: usize = 8 * 1024;

/// Frames signals onto one writer per node.
pub struct StreamTransport<W: Write + Send> {
    writers: Mutex<HashMap<NodeId, W>>,
}

impl<W: Write + Send> Default for StreamTransport<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write + Send> StreamTransport<W> {
    /// Transport with no connected nodes.
    pub fn new() -> Self {
        Self {
            writers: Mutex::new(HashMap::new()),
        }
    }

    /// Attach the outbound stream for `node`, replacing any previous one.
    pub fn connect(&self, node: NodeId, writer: W) {
        info!(%node, "stream attached");
        self.writers.lock().insert(node, writer);
    }

    /// Detach the outbound stream for `node`.
    pub fn disconnect(&self, node: NodeId) -> Option<W> {
        let removed = self.writers.lock().remove(&node);
        if removed.is_some() {
            info!(%node, "stream detached");
        }
        removed
    }

    /// Whether a stream is attached for `node`.
    pub fn is_connected(&self, node: NodeId) -> bool {
        self.writers.lock().contains_key(&node)
    }
}

impl<W: Write + Send> Transport for StreamTransport<W> {
    fn send(&self, node: NodeId, signal: &Signal) -> Result<(), TransportError> {
        let frame = encode_signal(signal).map_err(|e| TransportError::Encode(e.to_string()))?;
        let mut writers = self.writers.lock();
        let writer = writers
            .get_mut(&node)
            .ok_or(TransportError::NodeUnreachable { node })?;
        match writer.write_all(&frame).and_then(|()| writer.flush()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(TransportError::BufferFull { node }),
            Err(e) => {
                warn!(%node, error = %e, "stream write failed, detaching");
                writers.remove(&node);
                Err(e.into())
            }
        }
    }
}

/// Decodes framed signals from a byte stream.
///
/// Every decoded signal lands in the same receive buffer, which is
/// overwritten by the next call. Callers copy what they keep.
pub struct SignalReader<R: Read> {
    reader: R,
    buffer: Vec<u8>,
    current: Signal,
}

impl<R: Read> SignalReader<R> {
    /// Wrap a byte stream.
    pub fn new(reader: R) -> Self {
        let mut current = Signal::new();
        current.set_buffer_slot(Some(0));
        Self {
            reader,
            buffer: Vec::with_capacity(READ_CHUNK),
            current,
        }
    }

    /// Read the next signal.
    ///
    /// Returns `Ok(None)` on a clean end of stream.
    ///
    /// # Errors
    ///
    /// `Io` for read failures, malformed frames and streams that end
    /// mid-frame.
    pub fn read_signal(&mut self) -> Result<Option<&Signal>, TransportError> {
        loop {
            match try_decode_signal_into(&self.buffer, &mut self.current) {
                Ok(Some(consumed)) => {
                    self.buffer.drain(..consumed);
                    return Ok(Some(&self.current));
                }
                Ok(None) => {}
                Err(e) => return Err(TransportError::Io(format!("malformed frame: {e}"))),
            }

            let mut chunk = [0u8; READ_CHUNK];
            let read = match self.reader.read(&mut chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if read == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(TransportError::Io(format!(
                    "stream ended with {} bytes of a partial frame",
                    self.buffer.len()
                )));
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }
}

/// Run a [`SignalReader`] on a named thread, forwarding copies of every
/// signal from `node` to `events`.
///
/// When the stream ends or fails the node is reported as failed.
pub fn spawn_stream_receiver<R>(
    node: NodeId,
    reader: R,
    events: Sender<InboundEvent>,
) -> std::io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("clusterlink:stream:{}", node.get()))
        .spawn(move || {
            let mut reader = SignalReader::new(reader);
            loop {
                match reader.read_signal() {
                    Ok(Some(signal)) => {
                        debug!(%node, gsn = signal.gsn(), "frame received");
                        let event = InboundEvent::Signal {
                            from: node,
                            signal: signal.clone(),
                        };
                        if events.send(event).is_err() {
                            return;
                        }
                    }
                    Ok(None) => {
                        info!(%node, "stream closed");
                        break;
                    }
                    Err(e) => {
                        warn!(%node, error = %e, "stream receive failed");
                        break;
                    }
                }
            }
            let _ = events.send(InboundEvent::NodeFailed(node));
        })
}
