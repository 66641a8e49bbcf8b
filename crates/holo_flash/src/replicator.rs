//! Replication seam used by the put/writeback path.
//!
//! The pool only knows the `Replicator` trait. `FanoutReplicator` is a
//! reference strategy that copies each operation to every live replica over a
//! `Correlator` and waits for a configurable number of acknowledgements; it is
//! not a consistency protocol. `ReplicaApplier` is the receiving side.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::join_all;
use holo_msg::{Correlator, Endpoint, Message, MessageError, NodeId, ServiceHandler, ServiceId};

use crate::flash::{read_u32, read_u64};
use crate::pool::AsyncPool;
use crate::request::{AsyncRequest, Payload, RequestKind};
use crate::types::{ObjectMeta, OpId, Target};

/// Reply status bytes sent back by `ReplicaApplier`.
pub const REPLICA_OK: u8 = 0;
pub const REPLICA_APPLY_FAILED: u8 = 1;
pub const REPLICA_DECODE_FAILED: u8 = 2;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ReplicationError {
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error("replica {node} rejected the operation with status {status}")]
    Rejected { node: NodeId, status: u8 },
    #[error("only {acks} of {needed} required replica acknowledgements")]
    Quorum { acks: usize, needed: usize },
    /// Replication cannot continue; the pool stops replicating.
    #[error("unrecoverable replication failure: {0}")]
    Unrecoverable(String),
}

/// One operation as shipped to replicas.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaOp {
    pub op_id: OpId,
    pub kind: RequestKind,
    pub target: Target,
    pub key: Vec<u8>,
    /// `None` replicates a delete.
    pub data: Option<Vec<u8>>,
    pub meta: ObjectMeta,
}

#[async_trait]
pub trait Replicator: Send + Sync + 'static {
    async fn start(&self) -> anyhow::Result<()>;

    /// Liveness callback from the messaging layer.
    fn node_live(&self, node: NodeId, timestamp: u64);

    fn node_dead(&self, node: NodeId);

    /// Replicate `op` and wait for acknowledgement.
    async fn replicate(&self, op: &ReplicaOp) -> Result<(), ReplicationError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicationConfig {
    /// Service the `ReplicaApplier` listens on at every replica.
    pub service: ServiceId,
    pub replicas: Vec<NodeId>,
    /// Acknowledgements needed for success.
    pub min_acks: usize,
}

impl ReplicationConfig {
    pub fn all_of(service: ServiceId, replicas: Vec<NodeId>) -> Self {
        let min_acks = replicas.len();
        Self {
            service,
            replicas,
            min_acks,
        }
    }
}

pub struct FanoutReplicator {
    config: ReplicationConfig,
    correlator: Arc<Correlator>,
    /// Live replicas and the timestamp of their last liveness report.
    live: Mutex<HashMap<NodeId, u64>>,
    started: AtomicBool,
}

impl FanoutReplicator {
    pub fn alloc(
        config: ReplicationConfig,
        correlator: Arc<Correlator>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            config.min_acks <= config.replicas.len(),
            "min_acks {} exceeds replica count {}",
            config.min_acks,
            config.replicas.len()
        );
        anyhow::ensure!(
            !config.replicas.contains(&correlator.node()),
            "node {} cannot replicate to itself",
            correlator.node()
        );
        Ok(Self {
            config,
            correlator,
            live: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
        })
    }

    pub fn live_replicas(&self) -> Vec<NodeId> {
        let live = self.live();
        self.config
            .replicas
            .iter()
            .copied()
            .filter(|node| live.contains_key(node))
            .collect()
    }

    fn live(&self) -> std::sync::MutexGuard<'_, HashMap<NodeId, u64>> {
        self.live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Replicator for FanoutReplicator {
    async fn start(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.started.swap(true, Ordering::AcqRel),
            "replicator already started"
        );
        let mut live = self.live();
        for node in &self.config.replicas {
            live.entry(*node).or_insert(0);
        }
        tracing::info!(
            replicas = ?self.config.replicas,
            min_acks = self.config.min_acks,
            "fanout replicator started"
        );
        Ok(())
    }

    fn node_live(&self, node: NodeId, timestamp: u64) {
        if !self.config.replicas.contains(&node) {
            return;
        }
        let previous = self.live().insert(node, timestamp);
        if previous.is_none() {
            tracing::info!(node, "replica is live");
        }
    }

    fn node_dead(&self, node: NodeId) {
        if self.live().remove(&node).is_some() {
            tracing::info!(node, "replica is dead");
        }
        self.correlator.node_dead(node);
    }

    async fn replicate(&self, op: &ReplicaOp) -> Result<(), ReplicationError> {
        if !self.started.load(Ordering::Acquire) {
            return Err(ReplicationError::Unrecoverable(
                "replicator used before start".into(),
            ));
        }
        let needed = self.config.min_acks;
        let targets = self.live_replicas();
        if targets.len() < needed {
            return Err(ReplicationError::Quorum {
                acks: 0,
                needed,
            });
        }

        let payload = encode_op(op);
        let service = self.config.service;
        let replies = join_all(targets.iter().map(|node| {
            self.correlator
                .request(service, Endpoint::new(*node, service), payload.clone())
        }))
        .await;

        let mut acks = 0;
        let mut first_error = None;
        for (node, reply) in targets.iter().zip(replies) {
            let outcome = match reply {
                Ok(reply) => match reply.payload.first().copied() {
                    Some(REPLICA_OK) => Ok(()),
                    status => Err(ReplicationError::Rejected {
                        node: *node,
                        status: status.unwrap_or(REPLICA_DECODE_FAILED),
                    }),
                },
                Err(err) => Err(ReplicationError::Message(err)),
            };
            match outcome {
                Ok(()) => acks += 1,
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        if acks >= needed {
            Ok(())
        } else {
            Err(first_error.unwrap_or(ReplicationError::Quorum { acks, needed }))
        }
    }
}

/// Applies replicated operations to the local pool.
pub struct ReplicaApplier {
    pool: AsyncPool,
}

impl ReplicaApplier {
    pub fn new(pool: AsyncPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ServiceHandler for ReplicaApplier {
    async fn handle(&self, request: &Message) -> anyhow::Result<Bytes> {
        let op = match decode_op(&request.payload) {
            Ok(op) => op,
            Err(err) => {
                tracing::warn!(error = ?err, src = %request.src, "undecodable replica op");
                return Ok(Bytes::from_static(&[REPLICA_DECODE_FAILED]));
            }
        };
        let payload = match op.data {
            Some(data) => Payload::Inline(data),
            None => Payload::Delete,
        };
        let local = AsyncRequest::new(op.kind, op.target, op.key, payload)
            .with_op_id(op.op_id)
            .with_meta(op.meta)
            .local_only();

        let status = match self.pool.submit(local).await {
            Ok(submitted) => match submitted.wait().await {
                Ok(()) => REPLICA_OK,
                Err(err) => {
                    tracing::debug!(error = %err, op_id = op.op_id, "replica apply failed");
                    REPLICA_APPLY_FAILED
                }
            },
            Err(err) => {
                tracing::debug!(error = %err, op_id = op.op_id, "replica submit failed");
                REPLICA_APPLY_FAILED
            }
        };
        Ok(Bytes::copy_from_slice(&[status]))
    }
}

pub fn encode_op(op: &ReplicaOp) -> Bytes {
    let data_len = op.data.as_ref().map_or(0, Vec::len);
    let mut out = Vec::with_capacity(1 + 8 * 4 + 4 + 4 + op.key.len() + 1 + 4 + data_len);
    out.push(op.kind.tag());
    out.extend_from_slice(&op.op_id.to_be_bytes());
    out.extend_from_slice(&op.target.container.to_be_bytes());
    out.extend_from_slice(&op.target.shard.to_be_bytes());
    out.extend_from_slice(&op.meta.expiry.to_be_bytes());
    out.extend_from_slice(&op.meta.flags.to_be_bytes());
    out.extend_from_slice(&(op.key.len() as u32).to_be_bytes());
    out.extend_from_slice(&op.key);
    match &op.data {
        Some(data) => {
            out.push(1);
            out.extend_from_slice(&(data.len() as u32).to_be_bytes());
            out.extend_from_slice(data);
        }
        None => out.push(0),
    }
    Bytes::from(out)
}

pub fn decode_op(data: &[u8]) -> anyhow::Result<ReplicaOp> {
    anyhow::ensure!(!data.is_empty(), "empty replica op");
    let mut offset = 0;
    let tag = read_u8(data, &mut offset)?;
    let kind = RequestKind::from_tag(tag)
        .ok_or_else(|| anyhow::anyhow!("unknown replica op kind {tag}"))?;
    let op_id = read_u64(data, &mut offset)?;
    let container = read_u64(data, &mut offset)?;
    let shard = read_u64(data, &mut offset)?;
    let expiry = read_u64(data, &mut offset)?;
    let flags = read_u32(data, &mut offset)?;
    let key_len = read_u32(data, &mut offset)? as usize;
    anyhow::ensure!(offset + key_len <= data.len(), "short key");
    let key = data[offset..offset + key_len].to_vec();
    offset += key_len;
    let payload = match read_u8(data, &mut offset)? {
        0 => None,
        1 => {
            let len = read_u32(data, &mut offset)? as usize;
            anyhow::ensure!(offset + len <= data.len(), "short value");
            let value = data[offset..offset + len].to_vec();
            offset += len;
            Some(value)
        }
        other => anyhow::bail!("bad data marker {other}"),
    };
    anyhow::ensure!(offset == data.len(), "trailing bytes in replica op");
    Ok(ReplicaOp {
        op_id,
        kind,
        target: Target::new(container, shard),
        key,
        data: payload,
        meta: ObjectMeta { expiry, flags },
    })
}

fn read_u8(data: &[u8], offset: &mut usize) -> anyhow::Result<u8> {
    anyhow::ensure!(*offset < data.len(), "short u8");
    let out = data[*offset];
    *offset += 1;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(data: Option<&[u8]>) -> ReplicaOp {
        ReplicaOp {
            op_id: 77,
            kind: RequestKind::Writeback,
            target: Target::new(5, 2),
            key: b"user:1".to_vec(),
            data: data.map(<[u8]>::to_vec),
            meta: ObjectMeta {
                expiry: 1_700_000_000,
                flags: 9,
            },
        }
    }

    #[test]
    fn codec_keeps_delete_distinct_from_empty_value() {
        let delete = decode_op(&encode_op(&op(None))).unwrap();
        let empty = decode_op(&encode_op(&op(Some(b"")))).unwrap();
        assert_eq!(delete.data, None);
        assert_eq!(empty.data, Some(Vec::new()));
        assert_eq!(empty, op(Some(b"")));
    }

    #[test]
    fn codec_rejects_truncated_and_padded_input() {
        let encoded = encode_op(&op(Some(b"value")));
        assert!(decode_op(&encoded[..encoded.len() - 2]).is_err());
        let mut padded = encoded.to_vec();
        padded.push(0);
        assert!(decode_op(&padded).is_err());
        assert!(decode_op(&[]).is_err());
        assert!(decode_op(&[9]).is_err());
    }
}
