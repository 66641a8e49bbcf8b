//! Request/reply correlation on top of a fire-and-forget messenger.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::response_map::{lock_map, SharedResponseMap};
use crate::types::{Endpoint, Message, MessageError, MessageKind, NodeId, ReplyResult, ServiceId};

/// Outbound message path. Delivery is not acknowledged; replies come back
/// through `Correlator::deliver`.
#[async_trait]
pub trait Messenger: Send + Sync + 'static {
    async fn send(&self, msg: Message) -> anyhow::Result<()>;
}

/// Server side of a service mailbox: turns a request into reply payload.
#[async_trait]
pub trait ServiceHandler: Send + Sync + 'static {
    async fn handle(&self, request: &Message) -> anyhow::Result<Bytes>;
}

/// Tracks outbound requests in a response map and routes replies back to
/// their waiting callers.
pub struct Correlator {
    node: NodeId,
    map: SharedResponseMap,
    messenger: Arc<dyn Messenger>,
    next_seq: AtomicU64,
}

impl Correlator {
    pub fn new(node: NodeId, map: SharedResponseMap, messenger: Arc<dyn Messenger>) -> Self {
        Self {
            node,
            map,
            messenger,
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn map(&self) -> &SharedResponseMap {
        &self.map
    }

    /// Send `payload` to `dest` and wait for the reply, a timeout, or a
    /// node-death notification. Exactly one of those is returned.
    pub async fn request(
        &self,
        src_service: ServiceId,
        dest: Endpoint,
        payload: Bytes,
    ) -> ReplyResult {
        let (tx, rx) = oneshot::channel();
        let src = Endpoint::new(self.node, src_service);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let key = lock_map(&self.map).track(dest, src, seq, tx);

        let msg = Message {
            kind: MessageKind::Request,
            key,
            src,
            dest,
            seq,
            payload,
        };
        if let Err(err) = self.messenger.send(msg).await {
            let tracker = lock_map(&self.map).resolve(&key);
            if let Some(tracker) = tracker {
                tracker.complete(Err(MessageError::SendFailed {
                    dest,
                    reason: err.to_string(),
                }));
            }
        }

        rx.await.unwrap_or(Err(MessageError::Dropped))
    }

    /// Route an inbound reply. Returns false when no tracker matched, which
    /// is normal for replies that lost the race against a timeout.
    pub fn deliver(&self, reply: Message) -> bool {
        let tracker = lock_map(&self.map).resolve(&reply.key);
        match tracker {
            Some(tracker) => tracker.complete(Ok(reply)),
            None => {
                tracing::debug!(key = %reply.key, src = %reply.src, "late reply dropped");
                false
            }
        }
    }

    /// Fail every in-flight request to `node`.
    pub fn node_dead(&self, node: NodeId) -> usize {
        let failed = lock_map(&self.map).on_node_dead(node);
        if failed > 0 {
            tracing::info!(node, failed, "failed in-flight requests to dead node");
        }
        failed
    }

    /// Serve one inbox: requests go to `handler` and their replies are sent
    /// back, replies are matched against this correlator's map.
    pub fn spawn_inbox(
        self: &Arc<Self>,
        mut inbox: mpsc::UnboundedReceiver<Message>,
        handler: Arc<dyn ServiceHandler>,
    ) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = inbox.recv().await {
                match msg.kind {
                    MessageKind::Reply => {
                        this.deliver(msg);
                    }
                    MessageKind::Request => {
                        let handler = Arc::clone(&handler);
                        let messenger = Arc::clone(&this.messenger);
                        tokio::spawn(async move {
                            match handler.handle(&msg).await {
                                Ok(payload) => {
                                    if let Err(err) = messenger.send(msg.reply(payload)).await {
                                        tracing::warn!(
                                            error = ?err,
                                            dest = %msg.src,
                                            "reply send failed"
                                        );
                                    }
                                }
                                Err(err) => {
                                    tracing::warn!(
                                        error = ?err,
                                        src = %msg.src,
                                        "service handler failed; request left unanswered"
                                    );
                                }
                            }
                        });
                    }
                }
            }
        })
    }
}
