//! Typed views of the signals exchanged with the transaction coordinator.
//!
//! Each message knows its [`SignalKind`] and how its fields map onto inline
//! words and sections. Decoders check the minimum inline length first and
//! report short payloads as [`SignalError::Malformed`].

mod scan;
mod tc;

pub use scan::{MAX_BATCH_NO, ScanInfoPair, ScanNextReq, ScanTabConf, ScanTabInfo, ScanTabRef, ScanTabReq};
pub use tc::{
    AttrInfo, KeyInfo, NodeFailRep, OperationType, RequestInfo, TcCommitConf, TcCommitRef,
    TcCommitReq, TcHbRep, TcKeyConf, TcKeyRef, TcKeyReq, TcReleaseConf, TcReleaseRef,
    TcReleaseReq, TcRollbackConf, TcRollbackRef, TcRollbackRep, TcRollbackReq, TcSeizeConf,
    TcSeizeRef, TcSeizeReq, TransIdAi,
};

use crate::signal::{Signal, SignalError, SignalKind};
use crate::types::TransactionId;

/// Payload words carried by one continuation signal.
pub const CONTINUATION_WORDS: usize = 22;

/// A signal with a fixed field layout.
pub trait Message: Sized {
    /// Signal type carrying this message.
    const KIND: SignalKind;

    /// Minimum inline length a valid instance has.
    const MIN_LENGTH: usize;

    /// Write the fields into `signal`, which already has type [`Self::KIND`].
    fn encode(&self, signal: &mut Signal) -> Result<(), SignalError>;

    /// Read the fields from a signal whose length was checked.
    fn decode_unchecked(signal: &Signal) -> Result<Self, SignalError>;

    /// Build a fresh signal holding this message.
    fn to_signal(&self) -> Result<Signal, SignalError> {
        let mut signal = Signal::with_kind(Self::KIND);
        signal.set_length(0)?;
        self.encode(&mut signal)?;
        Ok(signal)
    }

    /// Decode from `signal`, checking its type and length.
    fn decode(signal: &Signal) -> Result<Self, SignalError> {
        if signal.kind() != Some(Self::KIND) {
            return Err(SignalError::Malformed {
                kind: Self::KIND.name(),
                message: format!("unexpected signal number {}", signal.gsn()),
            });
        }
        if signal.data().len() < Self::MIN_LENGTH {
            return Err(SignalError::Malformed {
                kind: Self::KIND.name(),
                message: format!(
                    "need {} words, have {}",
                    Self::MIN_LENGTH,
                    signal.data().len()
                ),
            });
        }
        Self::decode_unchecked(signal)
    }
}

/// Transaction id as read from words `low` and `low + 1`.
pub(crate) fn transid_at(signal: &Signal, low: usize) -> TransactionId {
    TransactionId::from_words(signal.word(low), signal.word(low + 1))
}

/// Messages of shape `[ptr, transid_lo, transid_hi]`.
macro_rules! transid_message {
    ($(#[$doc:meta])* $name:ident, $kind:ident, $ptr:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            #[doc = concat!("Connect pointer (`", stringify!($ptr), "`).")]
            pub $ptr: u32,
            /// Transaction the message refers to.
            pub transaction_id: $crate::types::TransactionId,
        }

        impl $crate::protocol::Message for $name {
            const KIND: $crate::signal::SignalKind = $crate::signal::SignalKind::$kind;
            const MIN_LENGTH: usize = 3;

            fn encode(
                &self,
                signal: &mut $crate::signal::Signal,
            ) -> Result<(), $crate::signal::SignalError> {
                signal.set_data(&[
                    self.$ptr,
                    self.transaction_id.low(),
                    self.transaction_id.high(),
                ])
            }

            fn decode_unchecked(
                signal: &$crate::signal::Signal,
            ) -> Result<Self, $crate::signal::SignalError> {
                Ok(Self {
                    $ptr: signal.word(0),
                    transaction_id: $crate::protocol::transid_at(signal, 1),
                })
            }
        }
    };
}

/// Messages of shape `[ptr, transid_lo, transid_hi, error_code]`.
macro_rules! transid_error_message {
    ($(#[$doc:meta])* $name:ident, $kind:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            /// API connect pointer.
            pub api_ptr: u32,
            /// Transaction the message refers to.
            pub transaction_id: $crate::types::TransactionId,
            /// Error code assigned by the data node.
            pub error_code: $crate::error::ErrorCode,
        }

        impl $crate::protocol::Message for $name {
            const KIND: $crate::signal::SignalKind = $crate::signal::SignalKind::$kind;
            const MIN_LENGTH: usize = 4;

            fn encode(
                &self,
                signal: &mut $crate::signal::Signal,
            ) -> Result<(), $crate::signal::SignalError> {
                signal.set_data(&[
                    self.api_ptr,
                    self.transaction_id.low(),
                    self.transaction_id.high(),
                    self.error_code.0,
                ])
            }

            fn decode_unchecked(
                signal: &$crate::signal::Signal,
            ) -> Result<Self, $crate::signal::SignalError> {
                Ok(Self {
                    api_ptr: signal.word(0),
                    transaction_id: $crate::protocol::transid_at(signal, 1),
                    error_code: $crate::error::ErrorCode(signal.word(3)),
                })
            }
        }
    };
}

pub(crate) use transid_error_message;
pub(crate) use transid_message;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_checks_kind_and_length() {
        let conf = TcCommitConf {
            api_ptr: 3,
            transaction_id: TransactionId(0x0000_0001_0000_0002),
        };
        let signal = conf.to_signal().expect("encode");
        assert_eq!(signal.length(), 3);
        assert_eq!(TcCommitConf::decode(&signal), Ok(conf));

        assert!(matches!(
            TcRollbackConf::decode(&signal),
            Err(SignalError::Malformed { .. })
        ));

        let mut short = Signal::with_kind(SignalKind::TcCommitRef);
        short.set_data(&[1, 2]).expect("data");
        assert!(matches!(
            TcCommitRef::decode(&short),
            Err(SignalError::Malformed { kind: "TcCommitRef", .. })
        ));
    }
}
