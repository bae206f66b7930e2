//! Outbound delivery and the inbound event contract.
//!
//! A [`Transport`] only has to move one framed signal to one node. Inbound
//! traffic flows the other way as [`InboundEvent`]s on a crossbeam channel
//! drained by the dispatcher's receive thread.

mod stream;

pub use stream::{SignalReader, StreamTransport, spawn_stream_receiver};

use std::io;

use thiserror::Error;

use crate::signal::Signal;
use crate::types::NodeId;

/// Errors raised while sending a signal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No connection to the node exists or it is known to be down.
    #[error("{node} is unreachable")]
    NodeUnreachable {
        /// Destination node.
        node: NodeId,
    },

    /// The outbound buffer for the node is full.
    #[error("send buffer full for {node}")]
    BufferFull {
        /// Destination node.
        node: NodeId,
    },

    /// The transport has been shut down.
    #[error("transport closed")]
    Closed,

    /// Signal could not be framed.
    #[error("encode failed: {0}")]
    Encode(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(String),
}

impl TransportError {
    /// Whether retrying the same send may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::BufferFull { .. } | TransportError::Io(_)
        )
    }
}

impl From<io::Error> for TransportError {
    fn from(error: io::Error) -> Self {
        TransportError::Io(error.to_string())
    }
}

/// Moves signals to data nodes.
///
/// Called by the dispatcher with its lock held, so implementations must
/// not call back into the dispatcher.
pub trait Transport: Send + Sync {
    /// Deliver one signal to `node`.
    fn send(&self, node: NodeId, signal: &Signal) -> Result<(), TransportError>;
}

/// Event delivered to the receive thread.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    /// A signal arrived from `from`.
    Signal {
        /// Sending node.
        from: NodeId,
        /// Received signal.
        signal: Signal,
    },
    /// A node was declared dead.
    NodeFailed(NodeId),
    /// A node (re)joined.
    NodeAlive(NodeId),
    /// Stop the receive thread.
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(TransportError::BufferFull { node: NodeId(1) }.is_transient());
        assert!(TransportError::Io("reset".into()).is_transient());
        assert!(!TransportError::NodeUnreachable { node: NodeId(1) }.is_transient());
        assert!(!TransportError::Closed.is_transient());
    }

    #[test]
    fn test_io_conversion() {
        let err: TransportError = io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(matches!(err, TransportError::Io(msg) if msg.contains("pipe")));
    }
}
