//! Fake cluster harness and the scenarios run against it.

mod exchange;
mod fake;
mod scans;
mod transactions;

use std::sync::Arc;

use clusterlink::{Catalog, ClientConfig, ClusterContext, NodeId, NodeTable, TableMetadata};

use self::fake::FakeCluster;

/// Node id of the client under test.
pub const CLIENT: NodeId = NodeId(10);

/// The two data nodes of every harness.
pub const NODES: [NodeId; 2] = [NodeId(1), NodeId(2)];

/// Table id of `accounts`.
pub const ACCOUNTS: u32 = 7;

/// A started client wired to a [`FakeCluster`].
pub struct Harness {
    pub context: ClusterContext,
    pub fake: Arc<FakeCluster>,
    pub nodes: Arc<NodeTable>,
    pub catalog: Arc<Catalog>,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_test_writer()
        .try_init();
}

pub fn accounts() -> TableMetadata {
    TableMetadata {
        id: ACCOUNTS,
        name: "accounts".into(),
        version: 3,
        key_words: 1,
        attribute_count: 4,
        fragment_count: 4,
    }
}

/// Rows `[key, key * 10]` for keys `0..count`.
pub fn account_rows(count: u32) -> Vec<Vec<u32>> {
    (0..count).map(|key| vec![key, key * 10]).collect()
}

pub fn start() -> Harness {
    start_with(ClientConfig::local_network())
}

pub fn start_with(config: ClientConfig) -> Harness {
    init_tracing();
    let (events, inbound) = crossbeam_channel::unbounded();
    let nodes = Arc::new(NodeTable::with_alive(NODES));
    nodes.watch(events.clone());
    let fake = FakeCluster::new(events);
    let catalog = Arc::new(Catalog::new());
    catalog.insert(accounts());

    let context = ClusterContext::start(
        config.with_node_id(CLIENT),
        Arc::clone(&fake) as Arc<dyn clusterlink::Transport>,
        Arc::clone(&nodes) as Arc<dyn clusterlink::ClusterMembership>,
        Arc::clone(&catalog) as Arc<dyn clusterlink::MetadataResolver>,
        inbound,
    )
    .expect("context should start");

    Harness {
        context,
        fake,
        nodes,
        catalog,
    }
}
