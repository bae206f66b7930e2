//! Process-level client context: dispatcher plus receive thread.
//!
//! Lifecycle is explicit: [`ClusterContext::start`] builds everything,
//! [`ClusterContext::shutdown`] (or drop) wakes every blocked caller with
//! [`ClusterError::Shutdown`] and joins the receive thread.

use std::sync::Arc;

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tracing::info;

use crate::cluster::ClusterMembership;
use crate::config::ClientConfig;
use crate::dispatch::{DispatchMetrics, Dispatcher, ReceiveThread};
use crate::error::{ClusterError, ClusterResult};
use crate::exchange::SignalExchange;
use crate::metadata::MetadataResolver;
use crate::session::Session;
use crate::transport::{InboundEvent, Transport, TransportError};
use crate::types::NodeId;

/// A running client.
pub struct ClusterContext {
    dispatcher: Arc<Dispatcher>,
    resolver: Arc<dyn MetadataResolver>,
    receive: Mutex<Option<ReceiveThread>>,
}

impl ClusterContext {
    /// Validate `config`, build the dispatcher and start draining `inbound`.
    pub fn start(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        membership: Arc<dyn ClusterMembership>,
        resolver: Arc<dyn MetadataResolver>,
        inbound: Receiver<InboundEvent>,
    ) -> ClusterResult<Self> {
        config.validate()?;
        let node_id = config.node_id;
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(config), transport, membership));
        let receive = dispatcher
            .spawn_receive_thread(inbound)
            .map_err(|e| ClusterError::Transport(TransportError::from(e)))?;
        info!(%node_id, "cluster context started");
        Ok(Self {
            dispatcher,
            resolver,
            receive: Mutex::new(Some(receive)),
        })
    }

    /// Open a session.
    pub fn session(&self) -> ClusterResult<Session> {
        Session::open(Arc::clone(&self.dispatcher), Arc::clone(&self.resolver))
    }

    /// Open a synchronous signal exchange.
    pub fn signal_exchange(&self) -> ClusterResult<SignalExchange> {
        SignalExchange::open(Arc::clone(&self.dispatcher))
    }

    /// Tell every open block that `node` failed.
    pub fn report_node_failure(&self, node: NodeId) {
        self.dispatcher.deliver(InboundEvent::NodeFailed(node));
    }

    /// The dispatcher.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> DispatchMetrics {
        self.dispatcher.metrics()
    }

    /// Stop accepting work, wake every waiter and join the receive thread.
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
        if let Some(receive) = self.receive.lock().take() {
            receive.stop();
            info!("cluster context stopped");
        }
    }
}

impl Drop for ClusterContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
