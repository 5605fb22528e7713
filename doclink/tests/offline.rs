mod common;

use common::*;
use async_trait::async_trait;
use doclink::{
    memory::*,
    prelude::*,
    queue::WriteKind,
    transport::{HttpRequest, HttpResponse, Method, TransportError},
};
use futures::FutureExt;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::sync::Notify;

fn queued<T>(outcome: WriteOutcome<T>) -> PendingWrite<T> {
    match outcome {
        WriteOutcome::Queued(pending) => pending,
        WriteOutcome::Completed(_) => panic!("write should have been queued"),
    }
}

/// Forwards to the emulator, except that once armed it holds the next request until
/// released and then times it out.
#[derive(Default)]
struct StallingTransport {
    service: InMemoryService,
    armed: AtomicBool,
    stalled: Notify,
    release: Notify,
}

#[async_trait]
impl Transport for StallingTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.stalled.notify_one();
            self.release.notified().await;
            return Err(TransportError::Timeout("request stalled".into()));
        }
        self.service.send(request).await
    }
}

async fn methods_since(h: &Harness, index: usize) -> Vec<Method> {
    h.service.requests().await[index..].iter().map(|r| r.method).collect()
}

#[tokio::test]
async fn test_reads_fall_back_to_the_cache() {
    let h = Harness::with_collection().await;
    h.client.create(Some(&coll()), &order("a", "alice", 10)).await.unwrap();

    h.service.set_reachable(false);

    let read = h.client.read::<Order>(&doc("a")).await.unwrap();
    assert!(read.from_cache);
    assert_eq!(read.resource, order("a", "alice", 10));

    let err = h.client.read::<Order>(&doc("never-seen")).await.unwrap_err();
    assert!(matches!(err, AccessError::NotFound(_)));

    let err = h.client.read_raw(&doc("a"), None).await.unwrap_err();
    assert!(err.is_transport());
}

#[tokio::test]
async fn test_listing_falls_back_but_queries_do_not() {
    let h = Harness::with_collection().await;
    for id in ["a", "b"] {
        h.client.create(Some(&coll()), &order(id, "alice", 1)).await.unwrap();
    }

    h.service.set_reachable(false);

    let page = h.client.list::<Order>(Some(&coll())).await.unwrap();
    assert!(page.from_cache);
    assert!(!page.has_more());
    assert_eq!(page.items.len(), 2);

    let query = QuerySpec::new("SELECT * FROM root r");
    let err = h.client.query::<Order>(Some(&coll()), &query).await.unwrap_err();
    assert!(err.is_transport());
}

#[tokio::test]
async fn test_offline_create_completes_when_connectivity_returns() {
    let h = Harness::new().await;
    h.client.create(None, &Database { id: "D1".into() }).await.unwrap();
    let before = h.service.request_count().await;

    h.monitor.set_connected(false);

    let outcome = h
        .client
        .create(Some(&db()), &Collection { id: "C1".into() })
        .await
        .unwrap();
    let mut pending = queued(outcome);

    assert_eq!(h.service.request_count().await, before);
    assert!(h.service.resource("dbs/D1/colls/C1").await.is_none());
    let err = h.client.read::<Collection>(&coll()).await.unwrap_err();
    assert!(matches!(err, AccessError::NotFound(_)));

    let writes = h.client.pending_writes().await;
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].kind, WriteKind::Create);

    assert!((&mut pending).now_or_never().is_none());

    h.monitor.set_connected(true);

    let created = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(created.resource.id, "C1");
    assert!(created.stable_address.is_some());
    assert!(h.service.resource("dbs/D1/colls/C1").await.is_some());
    assert!(h.client.registry().resolve_path("dbs/D1/colls/C1").await.is_some());
    assert!(h.client.pending_writes().await.is_empty());
}

#[tokio::test]
async fn test_writes_to_one_resource_replay_in_order() {
    let h = Harness::with_collection().await;
    h.service.set_reachable(false);

    let first = queued(h.client.create(Some(&coll()), &order("a", "alice", 1)).await.unwrap());
    let mut second = queued(h.client.replace(&doc("a"), &order("a", "alice", 2)).await.unwrap());
    let third = queued(h.client.replace(&doc("a"), &order("a", "alice", 3)).await.unwrap());

    // W1 goes through, W2 times out
    h.service.set_reachable(true);
    h.service.fail_after(1, 1);
    let before = h.service.request_count().await;

    let report = h.client.drain().await.unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(report.deferred, 1);
    assert_eq!(methods_since(&h, before).await, vec![Method::Post]);
    assert_eq!(h.service.resource("dbs/D1/colls/C1/docs/a").await.unwrap()["total"], 1);

    assert_eq!(first.now_or_never().unwrap().unwrap().resource.total, 1);
    assert!((&mut second).now_or_never().is_none());

    let pending = h.client.pending_writes().await;
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].kind, WriteKind::Replace);
    assert_eq!(pending[0].attempt_count, 1);
    assert_eq!(pending[1].attempt_count, 0);

    let report = h.client.drain().await.unwrap();
    assert_eq!(report.delivered, 2);
    assert_eq!(
        methods_since(&h, before).await,
        vec![Method::Post, Method::Put, Method::Put]
    );
    assert_eq!(h.service.resource("dbs/D1/colls/C1/docs/a").await.unwrap()["total"], 3);

    assert_eq!(second.await.unwrap().resource.total, 2);
    assert_eq!(third.await.unwrap().resource.total, 3);
}

#[tokio::test]
async fn test_writes_behind_queued_ones_wait_even_online() {
    let h = Harness::with_collection().await;
    h.service.set_reachable(false);
    h.client.create(Some(&coll()), &order("a", "alice", 1)).await.unwrap();
    h.service.set_reachable(true);

    let before = h.service.request_count().await;
    let replace = h.client.replace(&doc("a"), &order("a", "alice", 2)).await.unwrap();
    let other = h.client.create(Some(&coll()), &order("b", "bob", 1)).await.unwrap();

    assert!(replace.is_queued());
    assert!(!other.is_queued());
    assert_eq!(h.service.request_count().await, before + 1);

    h.client.drain().await.unwrap();
    assert_eq!(replace.resolve().await.unwrap().resource.total, 2);
}

#[tokio::test]
async fn test_rejected_replay_reaches_the_caller() {
    let h = Harness::with_collection().await;
    h.client.create(Some(&coll()), &order("a", "alice", 1)).await.unwrap();

    h.service.set_reachable(false);
    let duplicate = h.client.create(Some(&coll()), &order("a", "bob", 2)).await.unwrap();
    h.service.set_reachable(true);

    let report = h.client.drain().await.unwrap();
    assert_eq!(report.rejected, 1);

    let err = duplicate.resolve().await.unwrap_err();
    assert_eq!(err.status_code(), Some(409));
    assert!(h.client.pending_writes().await.is_empty());
}

#[tokio::test]
async fn test_offline_delete_is_replayed() {
    let h = Harness::with_collection().await;
    h.client.create(Some(&coll()), &order("a", "alice", 1)).await.unwrap();

    h.service.set_reachable(false);
    let deleted = h.client.delete(&doc("a")).await.unwrap();
    assert!(deleted.is_queued());
    assert!(h.client.read::<Order>(&doc("a")).await.unwrap().from_cache);

    h.service.set_reachable(true);
    h.client.drain().await.unwrap();
    deleted.resolve().await.unwrap();

    assert!(h.service.resource("dbs/D1/colls/C1/docs/a").await.is_none());
    assert_eq!(h.client.cache().get(&doc("a"), ResourceKind::Document).await.unwrap(), None);
}

#[tokio::test]
async fn test_state_survives_a_restart() {
    let h = Harness::with_collection().await;
    h.client.create(Some(&coll()), &order("a", "alice", 1)).await.unwrap();

    h.service.set_reachable(false);
    let outcome = h.client.create(Some(&coll()), &order("b", "bob", 2)).await.unwrap();
    assert!(outcome.is_queued());
    drop(outcome);

    let monitor = ManualConnectivity::new(false);
    let restarted = Harness::over(h.service.clone(), h.store.clone(), monitor.clone()).await;
    drop(h);

    assert_eq!(restarted.client.pending_writes().await.len(), 1);
    assert!(restarted.client.registry().resolve_path("dbs/D1/colls/C1").await.is_some());

    let cached = restarted.client.read::<Order>(&doc("a")).await.unwrap();
    assert!(cached.from_cache);
    assert_eq!(cached.resource.total, 1);

    restarted.service.set_reachable(true);
    monitor.set_connected(true);
    until_drained(&restarted.client).await;

    assert_eq!(restarted.service.resource("dbs/D1/colls/C1/docs/b").await.unwrap()["total"], 2);
}

#[tokio::test]
async fn test_reconnect_during_a_drain_is_not_lost() {
    let transport = Arc::new(StallingTransport::default());
    let monitor = ManualConnectivity::new(true);
    let client = Client::builder(ENDPOINT)
        .credential(Credential::owner(KEY))
        .transport(transport.clone())
        .store(Arc::new(InMemoryStore::new()))
        .connectivity(Arc::new(monitor.clone()))
        .build()
        .await
        .unwrap();
    client.create(None, &Database { id: "D1".into() }).await.unwrap();
    client.create(Some(&db()), &Collection { id: "C1".into() }).await.unwrap();

    monitor.set_connected(false);
    let pending = queued(client.create(Some(&coll()), &order("a", "alice", 1)).await.unwrap());

    transport.armed.store(true, Ordering::SeqCst);
    monitor.set_connected(true);
    transport.stalled.notified().await;

    // Flaps while the first replay is in flight; the drain it schedules is refused.
    monitor.set_connected(false);
    monitor.set_connected(true);
    tokio::time::sleep(Duration::from_millis(50)).await;

    transport.release.notify_one();
    until_drained(&client).await;

    let created = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(created.resource.total, 1);
    assert!(transport.service.resource("dbs/D1/colls/C1/docs/a").await.is_some());
}

#[tokio::test]
async fn test_delete_does_not_cancel_earlier_queued_writes() {
    let h = Harness::with_collection().await;

    h.service.set_reachable(false);
    let pending = queued(h.client.create(Some(&coll()), &order("a", "alice", 1)).await.unwrap());
    h.service.set_reachable(true);

    let deleted = h.client.delete(&coll()).await.unwrap();
    assert!(!deleted.is_queued());
    assert_eq!(h.client.pending_writes().await.len(), 1);

    let before = h.service.request_count().await;
    let report = h.client.drain().await.unwrap();

    assert_eq!(report.rejected, 1);
    assert_eq!(methods_since(&h, before).await, vec![Method::Post]);
    assert_eq!(pending.await.unwrap_err().status_code(), Some(404));
    assert!(h.client.pending_writes().await.is_empty());
}
