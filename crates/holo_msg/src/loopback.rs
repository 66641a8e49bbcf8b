//! In-process messenger connecting nodes through unbounded channels.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::correlator::Messenger;
use crate::types::{Message, NodeId};

#[derive(Default)]
struct Routes {
    inboxes: HashMap<NodeId, mpsc::UnboundedSender<Message>>,
    partitioned: HashSet<NodeId>,
}

/// Loopback "network": one inbox per registered node.
///
/// A partitioned node still accepts sends but silently drops them, which is
/// how tests provoke reply timeouts.
#[derive(Default)]
pub struct LoopbackNetwork {
    routes: Mutex<Routes>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create (or replace) the inbox for `node`.
    pub fn register(&self, node: NodeId) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes().inboxes.insert(node, tx);
        rx
    }

    pub fn unregister(&self, node: NodeId) -> bool {
        self.routes().inboxes.remove(&node).is_some()
    }

    /// Start dropping everything addressed to `node`.
    pub fn partition(&self, node: NodeId) {
        self.routes().partitioned.insert(node);
    }

    pub fn heal(&self, node: NodeId) {
        self.routes().partitioned.remove(&node);
    }

    fn routes(&self) -> std::sync::MutexGuard<'_, Routes> {
        self.routes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Messenger for LoopbackNetwork {
    async fn send(&self, msg: Message) -> anyhow::Result<()> {
        let node = msg.dest.node;
        let tx = {
            let routes = self.routes();
            if routes.partitioned.contains(&node) {
                tracing::trace!(node, key = %msg.key, "dropping message to partitioned node");
                return Ok(());
            }
            routes.inboxes.get(&node).cloned()
        };
        let tx = tx.ok_or_else(|| anyhow::anyhow!("node {node} is not reachable"))?;
        tx.send(msg)
            .map_err(|_| anyhow::anyhow!("inbox for node {node} is closed"))?;
        Ok(())
    }
}
