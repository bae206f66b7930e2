//! Core addressing types shared by every layer of the client.
//!
//! - [`NodeId`]: identifies a cluster data node (or this API node)
//! - [`BlockNumber`]: small integer naming a registered callback endpoint
//! - [`BlockRef`]: node + block pair, the sender/receiver address of a signal
//! - [`TransactionId`]: 64-bit client-assigned transaction identifier
//! - [`NodeBitmask`]: set of node ids, used for node-failure reports

use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum node id addressable by the protocol.
pub const MAX_NODES: usize = 256;

/// Identifier of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct NodeId(pub u16);

impl NodeId {
    /// Create a node id.
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    /// Raw numeric value.
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node({})", self.0)
    }
}

/// Block number of a registered endpoint.
///
/// Numbers below [`BlockNumber::FIRST_DYNAMIC`] belong to the server-side
/// blocks (the transaction coordinator and friends); dynamically opened
/// client endpoints are numbered from `FIRST_DYNAMIC` upwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct BlockNumber(pub u16);

impl BlockNumber {
    /// Transaction coordinator block on a data node.
    pub const TC: Self = Self(245);
    /// Query manager block (scan fragments) on a data node.
    pub const QMGR: Self = Self(252);
    /// First block number handed out to client endpoints.
    pub const FIRST_DYNAMIC: Self = Self(0x8000);

    /// Create a block number.
    pub const fn new(n: u16) -> Self {
        Self(n)
    }

    /// Raw numeric value.
    pub const fn get(self) -> u16 {
        self.0
    }

    /// Whether this block number belongs to the dynamic client range.
    pub const fn is_dynamic(self) -> bool {
        self.0 >= Self::FIRST_DYNAMIC.0
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block({:#06x})", self.0)
    }
}

/// Fully qualified endpoint address: block on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BlockRef {
    /// Node hosting the block.
    pub node: NodeId,
    /// Block on that node.
    pub block: BlockNumber,
}

impl BlockRef {
    /// Create a block reference.
    pub const fn new(node: NodeId, block: BlockNumber) -> Self {
        Self { node, block }
    }

    /// Pack into the 32-bit wire representation (`node << 16 | block`).
    pub const fn to_word(self) -> u32 {
        ((self.node.0 as u32) << 16) | self.block.0 as u32
    }

    /// Unpack from the 32-bit wire representation.
    pub const fn from_word(word: u32) -> Self {
        Self {
            node: NodeId((word >> 16) as u16),
            block: BlockNumber(word as u16),
        }
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.block)
    }
}

/// Client-assigned 64-bit transaction identifier.
///
/// Travels on the wire as two 32-bit words (low word first). Successive ids
/// are produced with [`TransactionId::next`], which wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Build from the two wire words.
    pub const fn from_words(low: u32, high: u32) -> Self {
        Self(((high as u64) << 32) | low as u64)
    }

    /// Low wire word.
    pub const fn low(self) -> u32 {
        self.0 as u32
    }

    /// High wire word.
    pub const fn high(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Next id in sequence, wrapping at `u64::MAX`.
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn({:#018x})", self.0)
    }
}

/// Set of node ids.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct NodeBitmask {
    words: [u64; MAX_NODES / 64],
}

impl NodeBitmask {
    /// Empty set.
    pub const fn new() -> Self {
        Self {
            words: [0; MAX_NODES / 64],
        }
    }

    /// Set containing exactly one node.
    pub fn single(node: NodeId) -> Self {
        let mut mask = Self::new();
        mask.set(node);
        mask
    }

    /// Add a node.
    pub fn set(&mut self, node: NodeId) {
        let n = node.0 as usize;
        if n < MAX_NODES {
            self.words[n / 64] |= 1u64 << (n % 64);
        }
    }

    /// Remove a node.
    pub fn clear(&mut self, node: NodeId) {
        let n = node.0 as usize;
        if n < MAX_NODES {
            self.words[n / 64] &= !(1u64 << (n % 64));
        }
    }

    /// Membership test.
    pub fn contains(&self, node: NodeId) -> bool {
        let n = node.0 as usize;
        n < MAX_NODES && self.words[n / 64] & (1u64 << (n % 64)) != 0
    }

    /// True when no node is set.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Number of nodes in the set.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Iterate over member nodes in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..MAX_NODES)
            .filter(|n| self.words[n / 64] & (1u64 << (n % 64)) != 0)
            .map(|n| NodeId(n as u16))
    }
}

impl fmt::Debug for NodeBitmask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|n| n.0)).finish()
    }
}

impl FromIterator<NodeId> for NodeBitmask {
    fn from_iter<I: IntoIterator<Item = NodeId>>(iter: I) -> Self {
        let mut mask = Self::new();
        for node in iter {
            mask.set(node);
        }
        mask
    }
}
