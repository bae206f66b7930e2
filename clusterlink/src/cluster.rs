//! Cluster membership as seen by the client.
//!
//! Membership itself is decided elsewhere; the client only asks whether a
//! node is usable and whether it restarted since a record was seized.

use std::collections::BTreeMap;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::transport::InboundEvent;
use crate::types::NodeId;

/// Liveness queries the client needs from cluster membership.
pub trait ClusterMembership: Send + Sync {
    /// Whether `node` is up and accepting work.
    fn is_node_alive(&self, node: NodeId) -> bool;

    /// Whether `node` is shutting down gracefully.
    fn is_node_stopping(&self, node: NodeId) -> bool;

    /// Sequence number of `node`, bumped each time it (re)starts.
    fn node_sequence(&self, node: NodeId) -> u32;

    /// Whether `node` speaks a compatible protocol version.
    fn is_node_compatible(&self, _node: NodeId) -> bool {
        true
    }

    /// Any node that can take new transactions.
    fn pick_any_alive_node(&self) -> Option<NodeId>;
}

/// Liveness of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Up.
    Alive,
    /// Up but refusing new work.
    Stopping,
    /// Down.
    Dead,
}

#[derive(Debug, Clone, Copy)]
struct NodeInfo {
    state: NodeState,
    sequence: u32,
    compatible: bool,
}

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<NodeId, NodeInfo>,
    next_pick: usize,
    watchers: Vec<Sender<InboundEvent>>,
}

/// In-memory [`ClusterMembership`] fed by whoever observes the cluster.
///
/// Watchers registered with [`NodeTable::watch`] receive
/// [`InboundEvent::NodeFailed`] and [`InboundEvent::NodeAlive`] on every
/// transition.
#[derive(Default)]
pub struct NodeTable {
    inner: Mutex<Inner>,
}

impl NodeTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with `nodes` alive at sequence 1.
    pub fn with_alive(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        let table = Self::new();
        for node in nodes {
            table.set_alive(node);
        }
        table
    }

    /// Forward liveness transitions to `events`.
    pub fn watch(&self, events: Sender<InboundEvent>) {
        self.inner.lock().watchers.push(events);
    }

    /// Mark `node` alive. A dead or unknown node starts a new sequence.
    pub fn set_alive(&self, node: NodeId) {
        let mut inner = self.inner.lock();
        let info = inner.nodes.entry(node).or_insert(NodeInfo {
            state: NodeState::Dead,
            sequence: 0,
            compatible: true,
        });
        if info.state == NodeState::Alive {
            return;
        }
        if info.state == NodeState::Dead {
            info.sequence = info.sequence.wrapping_add(1);
        }
        info.state = NodeState::Alive;
        let sequence = info.sequence;
        info!(%node, sequence, "node alive");
        notify(&mut inner.watchers, InboundEvent::NodeAlive(node));
    }

    /// Mark `node` as stopping.
    pub fn set_stopping(&self, node: NodeId) {
        if let Some(info) = self.inner.lock().nodes.get_mut(&node) {
            info.state = NodeState::Stopping;
        }
    }

    /// Mark `node` dead.
    pub fn set_dead(&self, node: NodeId) {
        let mut inner = self.inner.lock();
        let Some(info) = inner.nodes.get_mut(&node) else {
            return;
        };
        if info.state == NodeState::Dead {
            return;
        }
        info.state = NodeState::Dead;
        info!(%node, "node dead");
        notify(&mut inner.watchers, InboundEvent::NodeFailed(node));
    }

    /// Set the protocol compatibility flag of `node`.
    pub fn set_compatible(&self, node: NodeId, compatible: bool) {
        if let Some(info) = self.inner.lock().nodes.get_mut(&node) {
            info.compatible = compatible;
        }
    }

    /// Current state of `node`, `None` if never seen.
    pub fn state(&self, node: NodeId) -> Option<NodeState> {
        self.inner.lock().nodes.get(&node).map(|i| i.state)
    }
}

fn notify(watchers: &mut Vec<Sender<InboundEvent>>, event: InboundEvent) {
    watchers.retain(|w| w.send(event.clone()).is_ok());
}

impl ClusterMembership for NodeTable {
    fn is_node_alive(&self, node: NodeId) -> bool {
        self.state(node) == Some(NodeState::Alive)
    }

    fn is_node_stopping(&self, node: NodeId) -> bool {
        self.state(node) == Some(NodeState::Stopping)
    }

    fn node_sequence(&self, node: NodeId) -> u32 {
        self.inner
            .lock()
            .nodes
            .get(&node)
            .map_or(0, |i| i.sequence)
    }

    fn is_node_compatible(&self, node: NodeId) -> bool {
        self.inner
            .lock()
            .nodes
            .get(&node)
            .is_some_and(|i| i.compatible)
    }

    fn pick_any_alive_node(&self) -> Option<NodeId> {
        let mut inner = self.inner.lock();
        let usable: Vec<NodeId> = inner
            .nodes
            .iter()
            .filter(|(_, i)| i.state == NodeState::Alive && i.compatible)
            .map(|(n, _)| *n)
            .collect();
        if usable.is_empty() {
            return None;
        }
        let pick = usable[inner.next_pick % usable.len()];
        inner.next_pick = inner.next_pick.wrapping_add(1);
        Some(pick)
    }
}
