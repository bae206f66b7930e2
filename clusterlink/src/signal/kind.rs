//! Closed set of signal types understood by the client.

use crate::types::BlockNumber;

macro_rules! signal_kinds {
    ($( $(#[$doc:meta])* $name:ident = $gsn:literal, len $len:literal, to $block:expr; )*) => {
        /// Logical signal type (the 16-bit "signal number").
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum SignalKind {
            $( $(#[$doc])* $name, )*
        }

        impl SignalKind {
            /// Every known kind.
            pub const ALL: &'static [SignalKind] = &[ $( SignalKind::$name, )* ];

            /// Wire signal number.
            pub const fn gsn(self) -> u16 {
                match self {
                    $( SignalKind::$name => $gsn, )*
                }
            }

            /// Look up a kind by signal number.
            pub const fn from_gsn(gsn: u16) -> Option<Self> {
                match gsn {
                    $( $gsn => Some(SignalKind::$name), )*
                    _ => None,
                }
            }

            /// Inline length a freshly typed signal starts with.
            pub const fn default_length(self) -> usize {
                match self {
                    $( SignalKind::$name => $len, )*
                }
            }

            /// Destination block a freshly typed signal starts with.
            ///
            /// Replies addressed to the client default to block 0 and are
            /// readdressed by the sender.
            pub const fn default_receiver(self) -> BlockNumber {
                match self {
                    $( SignalKind::$name => $block, )*
                }
            }

            /// Short name used in logs and decode errors.
            pub const fn name(self) -> &'static str {
                match self {
                    $( SignalKind::$name => stringify!($name), )*
                }
            }
        }
    };
}

const CLIENT: BlockNumber = BlockNumber(0);

signal_kinds! {
    /// Single-row key operation request.
    TcKeyReq = 12, len 9, to BlockNumber::TC;
    /// Key operation confirmation, resolving one or more operations.
    TcKeyConf = 13, len 4, to CLIENT;
    /// Key operation rejection.
    TcKeyRef = 14, len 5, to CLIENT;
    /// Continuation of an oversized key.
    KeyInfo = 15, len 3, to BlockNumber::TC;
    /// Continuation of oversized attribute data.
    AttrInfo = 16, len 3, to BlockNumber::TC;
    /// Row data addressed to an operation or scan receiver.
    TransIdAi = 17, len 3, to CLIENT;
    /// Commit request for a started transaction.
    TcCommitReq = 20, len 3, to BlockNumber::TC;
    /// Commit confirmation.
    TcCommitConf = 21, len 3, to CLIENT;
    /// Commit rejection.
    TcCommitRef = 22, len 4, to CLIENT;
    /// Rollback request.
    TcRollbackReq = 23, len 3, to BlockNumber::TC;
    /// Rollback confirmation.
    TcRollbackConf = 24, len 3, to CLIENT;
    /// Rollback rejection.
    TcRollbackRef = 25, len 4, to CLIENT;
    /// Coordinator-initiated abort report.
    TcRollbackRep = 26, len 4, to CLIENT;
    /// Seize a transaction coordinator record.
    TcSeizeReq = 30, len 2, to BlockNumber::TC;
    /// Seize confirmation carrying the TC connect pointer.
    TcSeizeConf = 31, len 2, to CLIENT;
    /// Seize rejection.
    TcSeizeRef = 32, len 2, to CLIENT;
    /// Release a seized coordinator record.
    TcReleaseReq = 33, len 3, to BlockNumber::TC;
    /// Release confirmation.
    TcReleaseConf = 34, len 1, to CLIENT;
    /// Release rejection.
    TcReleaseRef = 35, len 2, to CLIENT;
    /// Keep-alive for an idle transaction.
    TcHbRep = 36, len 3, to BlockNumber::TC;
    /// Start a table scan.
    ScanTabReq = 40, len 8, to BlockNumber::TC;
    /// Scan batch confirmation.
    ScanTabConf = 41, len 5, to CLIENT;
    /// Scan rejection.
    ScanTabRef = 42, len 5, to CLIENT;
    /// Per-receiver completion pairs for a scan batch.
    ScanTabInfo = 43, len 4, to CLIENT;
    /// Continue or stop a scan.
    ScanNextReq = 44, len 4, to BlockNumber::TC;
    /// Node failure report (also synthesized locally).
    NodeFailRep = 50, len 1, to CLIENT;
    /// Administrative registration request.
    ApiRegReq = 60, len 2, to BlockNumber::QMGR;
    /// Administrative registration confirmation.
    ApiRegConf = 61, len 3, to CLIENT;
    /// Administrative registration rejection.
    ApiRegRef = 62, len 2, to CLIENT;
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), self.gsn())
    }
}
