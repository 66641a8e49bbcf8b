use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use holo_msg::{
    lock_map, shared, Correlator, Endpoint, LoopbackNetwork, Message, MessageError, MessageKind,
    ResponseMap, ServiceHandler, TimeoutConfig, TimeoutScheduler,
};

const SERVICE: u32 = 3;

struct Echo;

#[async_trait]
impl ServiceHandler for Echo {
    async fn handle(&self, request: &Message) -> anyhow::Result<Bytes> {
        Ok(request.payload.clone())
    }
}

fn config() -> TimeoutConfig {
    TimeoutConfig {
        reply_timeout: Duration::from_millis(300),
        tick: Duration::from_millis(25),
    }
}

fn spawn_node(net: &Arc<LoopbackNetwork>, id: u64) -> Arc<Correlator> {
    let inbox = net.register(id);
    let map = shared(ResponseMap::new(config()));
    let correlator = Arc::new(Correlator::new(id, map, net.clone()));
    correlator.spawn_inbox(inbox, Arc::new(Echo));
    correlator
}

#[tokio::test]
async fn request_gets_matching_reply() {
    let net = LoopbackNetwork::new();
    let a = spawn_node(&net, 1);
    let _b = spawn_node(&net, 2);

    let reply = a
        .request(SERVICE, Endpoint::new(2, SERVICE), Bytes::from_static(b"ping"))
        .await
        .expect("reply");
    assert_eq!(reply.kind, MessageKind::Reply);
    assert_eq!(reply.payload, Bytes::from_static(b"ping"));
    assert_eq!(reply.src, Endpoint::new(2, SERVICE));
    assert_eq!(reply.dest, Endpoint::new(1, SERVICE));
    assert!(lock_map(a.map()).is_empty());
}

#[tokio::test]
async fn concurrent_requests_are_not_crossed() {
    let net = LoopbackNetwork::new();
    let a = spawn_node(&net, 1);
    let _b = spawn_node(&net, 2);

    let mut tasks = Vec::new();
    for i in 0..64u32 {
        let a = a.clone();
        tasks.push(tokio::spawn(async move {
            let payload = Bytes::from(i.to_be_bytes().to_vec());
            let reply = a
                .request(SERVICE, Endpoint::new(2, SERVICE), payload.clone())
                .await
                .expect("reply");
            assert_eq!(reply.payload, payload);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(lock_map(a.map()).stats().resolved, 64);
}

#[tokio::test(start_paused = true)]
async fn partitioned_destination_times_out_once() {
    let net = LoopbackNetwork::new();
    let a = spawn_node(&net, 1);
    let _b = spawn_node(&net, 2);
    let scheduler = TimeoutScheduler::spawn(a.map().clone(), config().tick);
    net.partition(2);

    let err = a
        .request(SERVICE, Endpoint::new(2, SERVICE), Bytes::from_static(b"lost"))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        MessageError::Timeout {
            dest: Endpoint::new(2, SERVICE)
        }
    );
    assert_eq!(lock_map(a.map()).stats().timed_out, 1);

    net.heal(2);
    let reply = a
        .request(SERVICE, Endpoint::new(2, SERVICE), Bytes::from_static(b"back"))
        .await
        .expect("reply after heal");
    assert_eq!(reply.payload, Bytes::from_static(b"back"));

    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn node_death_fails_pending_requests() {
    let net = LoopbackNetwork::new();
    let a = spawn_node(&net, 1);
    let _b = spawn_node(&net, 2);
    net.partition(2);

    let pending = {
        let a = a.clone();
        tokio::spawn(async move {
            a.request(SERVICE, Endpoint::new(2, SERVICE), Bytes::new())
                .await
        })
    };
    while lock_map(a.map()).is_empty() {
        tokio::task::yield_now().await;
    }

    assert_eq!(a.node_dead(2), 1);
    assert_eq!(
        pending.await.unwrap(),
        Err(MessageError::NodeDead { node: 2 })
    );
}

#[tokio::test]
async fn unreachable_destination_fails_fast() {
    let net = LoopbackNetwork::new();
    let a = spawn_node(&net, 1);

    let err = a
        .request(SERVICE, Endpoint::new(9, SERVICE), Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MessageError::SendFailed { .. }));
    assert!(lock_map(a.map()).is_empty());
}

#[tokio::test]
async fn late_reply_is_dropped() {
    let net = LoopbackNetwork::new();
    let a = spawn_node(&net, 1);

    let (tx, rx) = tokio::sync::oneshot::channel();
    let key = lock_map(a.map()).track(Endpoint::new(2, SERVICE), Endpoint::new(1, SERVICE), 0, tx);
    assert_eq!(a.node_dead(2), 1);
    assert_eq!(rx.await.unwrap(), Err(MessageError::NodeDead { node: 2 }));

    let late = Message {
        kind: MessageKind::Reply,
        key,
        src: Endpoint::new(2, SERVICE),
        dest: Endpoint::new(1, SERVICE),
        seq: 0,
        payload: Bytes::new(),
    };
    assert!(!a.deliver(late));
}
