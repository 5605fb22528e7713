//! Durable, ordered queue of writes that could not be delivered.
//!
//! A write lands here only when its request failed to reach the service. The queue persists
//! it, hands the caller a [`PendingWrite`] and replays it once connectivity returns. Replays go
//! through the same token, dispatch and classification path as a fresh write, so a replay may
//! end in any server outcome, not only a connectivity one.
//!
//! # Ordering
//!
//! Writes sharing an ordering key (the resource the write lands on) replay strictly in
//! submission order: a transport failure stops that chain until the next drain, and nothing
//! behind it may overtake it. Chains for different keys are independent and replay
//! concurrently.

use async_trait::async_trait;
use bson::{de::deserialize_from_bson, ser::serialize_to_bson};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use mea::mutex::Mutex;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    marker::PhantomData,
    pin::Pin,
    sync::atomic::{AtomicBool, Ordering},
    task::{Context, Poll},
};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    address::Target,
    error::{AccessError, AccessResult},
    persist::{Namespace, SharedStore},
    resource::ResourceResponse,
};

/// The kind of write being replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteKind {
    Create,
    Replace,
    Delete,
}

/// A write waiting for connectivity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedWrite {
    pub id: Uuid,
    pub sequence: i64,
    pub kind: WriteKind,
    pub target: Target,
    /// Storage key of the resource the write lands on; writes sharing it replay in order.
    pub ordering_key: String,
    /// Serialized JSON body, absent for deletes.
    pub body: Option<String>,
    pub headers: Vec<(String, String)>,
    pub enqueued_at: DateTime<Utc>,
    pub attempt_count: u32,
}

impl QueuedWrite {
    /// Creates an unsequenced write; the queue assigns the sequence on enqueue.
    pub fn new(
        kind: WriteKind,
        target: Target,
        ordering_key: impl Into<String>,
        body: Option<&Value>,
        headers: Vec<(String, String)>,
    ) -> AccessResult<Self> {
        Ok(Self {
            id: Uuid::new_v4(),
            sequence: 0,
            kind,
            target,
            ordering_key: ordering_key.into(),
            body: body.map(serde_json::to_string).transpose()?,
            headers,
            enqueued_at: Utc::now(),
            attempt_count: 0,
        })
    }

    /// The body parsed back into JSON.
    pub fn body_value(&self) -> AccessResult<Option<Value>> {
        Ok(self.body.as_deref().map(serde_json::from_str).transpose()?)
    }
}

type Delivery = AccessResult<ResourceResponse<Value>>;

/// Completion handle of a queued write. Resolves exactly once, when the write's replay
/// resolves.
#[derive(Debug)]
pub struct PendingWrite<T = Value> {
    id: Uuid,
    receiver: oneshot::Receiver<Delivery>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PendingWrite<T> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Reinterprets the eventual resource as `U`.
    pub fn typed<U>(self) -> PendingWrite<U> {
        PendingWrite {
            id: self.id,
            receiver: self.receiver,
            _marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Future for PendingWrite<T> {
    type Output = AccessResult<ResourceResponse<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|delivery| {
            delivery
                .unwrap_or_else(|_| {
                    Err(AccessError::Unknown(
                        "write queue dropped before the write was delivered".into(),
                    ))
                })
                .and_then(ResourceResponse::into_typed)
        })
    }
}

/// Replays a queued write through the full request path.
///
/// Implemented by the request dispatcher. A replay must not enqueue the write again on
/// transport failure; it reports the failure and the queue keeps the entry.
#[async_trait]
pub trait WriteReplayer: Send + Sync {
    async fn replay(&self, write: &QueuedWrite) -> Delivery;

    /// Whether another pass is worth starting right away.
    fn is_connected(&self) -> bool {
        true
    }
}

/// What one drain accomplished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Writes the service accepted.
    pub delivered: usize,
    /// Writes the service rejected; they were removed and their callers notified.
    pub rejected: usize,
    /// Writes that failed to reach the service again and remain queued.
    pub deferred: usize,
    /// Another drain was already in progress, nothing was done.
    pub already_running: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: BTreeMap<i64, QueuedWrite>,
    completions: HashMap<Uuid, oneshot::Sender<Delivery>>,
    next_sequence: i64,
}

#[derive(Debug)]
pub struct WriteReplayQueue {
    store: SharedStore,
    namespace: Namespace,
    state: Mutex<QueueState>,
    draining: AtomicBool,
    /// Set by drains refused while another ran and by writes queued during a drain.
    rerun: AtomicBool,
}

fn sequence_key(sequence: i64) -> String {
    format!("{sequence:020}")
}

/// Clears the drain flag when a drain finishes, whichever way it exits.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

enum ChainStep {
    Delivered,
    Rejected,
    Deferred,
}

impl WriteReplayQueue {
    /// Opens the queue for `account_host`, reloading writes persisted by a previous process.
    /// Reloaded writes have no caller waiting on them; their outcomes are only logged.
    pub async fn open(store: SharedStore, account_host: &str) -> AccessResult<Self> {
        let namespace = Namespace::new(account_host, "writes");
        let mut state = QueueState::default();

        for (_, value) in store.scan(namespace.as_str(), "").await? {
            let write = deserialize_from_bson::<QueuedWrite>(value)?;
            state.next_sequence = state.next_sequence.max(write.sequence + 1);
            state.entries.insert(write.sequence, write);
        }

        if !state.entries.is_empty() {
            info!(pending = state.entries.len(), "reloaded queued writes");
        }

        Ok(Self {
            store,
            namespace,
            state: Mutex::new(state),
            draining: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
        })
    }

    /// Persists `write` at the tail of the queue and returns its completion handle.
    pub async fn enqueue(&self, mut write: QueuedWrite) -> AccessResult<PendingWrite> {
        let mut state = self.state.lock().await;

        write.sequence = state.next_sequence;
        self.store
            .put(
                self.namespace.as_str(),
                &sequence_key(write.sequence),
                serialize_to_bson(&write)?,
            )
            .await?;

        let (sender, receiver) = oneshot::channel();
        state.next_sequence += 1;
        state.completions.insert(write.id, sender);

        debug!(
            id = %write.id,
            sequence = write.sequence,
            kind = ?write.kind,
            key = %write.ordering_key,
            "write queued"
        );

        let id = write.id;
        state.entries.insert(write.sequence, write);

        if self.is_draining() {
            self.rerun.store(true, Ordering::SeqCst);
        }

        Ok(PendingWrite {
            id,
            receiver,
            _marker: PhantomData,
        })
    }

    /// Whether any write for `ordering_key` is still waiting.
    pub async fn has_pending(&self, ordering_key: &str) -> bool {
        self.state
            .lock()
            .await
            .entries
            .values()
            .any(|w| w.ordering_key == ordering_key)
    }

    /// Snapshot of all queued writes in submission order.
    pub async fn pending(&self) -> Vec<QueuedWrite> {
        self.state.lock().await.entries.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Replays every queued write through `replayer`.
    ///
    /// Returns immediately with `already_running` set if another drain is in progress. The
    /// refused request is not lost: the running drain makes another pass before it returns,
    /// as long as the replayer still reports a connection. Writes enqueued while the drain
    /// runs are picked up the same way.
    pub async fn drain(&self, replayer: &dyn WriteReplayer) -> AccessResult<DrainReport> {
        self.rerun.store(true, Ordering::SeqCst);
        if !self.begin_drain() {
            debug!("drain already running, another pass requested");
            return Ok(DrainReport { already_running: true, ..Default::default() });
        }

        let mut report = DrainReport::default();

        loop {
            {
                let _guard = DrainGuard(&self.draining);
                while self.rerun.swap(false, Ordering::SeqCst) {
                    self.drain_pass(replayer, &mut report).await?;
                    if !replayer.is_connected() {
                        break;
                    }
                }
            }

            // A request refused between the last check and the guard drop.
            if !(self.rerun.load(Ordering::SeqCst) && replayer.is_connected() && self.begin_drain()) {
                break;
            }
        }

        Ok(report)
    }

    fn begin_drain(&self) -> bool {
        self.draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Replays chains until the queue is empty, a chain is deferred or nothing moves.
    async fn drain_pass(
        &self,
        replayer: &dyn WriteReplayer,
        report: &mut DrainReport,
    ) -> AccessResult<()> {
        loop {
            let chains = self.chains().await;
            if chains.is_empty() {
                return Ok(());
            }

            info!(chains = chains.len(), "draining queued writes");

            let results = join_all(chains.into_iter().map(|chain| self.replay_chain(chain, replayer))).await;

            let mut progressed = false;
            let mut deferred = false;
            for steps in results {
                for step in steps? {
                    match step {
                        ChainStep::Delivered => {
                            report.delivered += 1;
                            progressed = true;
                        }
                        ChainStep::Rejected => {
                            report.rejected += 1;
                            progressed = true;
                        }
                        ChainStep::Deferred => {
                            report.deferred += 1;
                            deferred = true;
                        }
                    }
                }
            }

            if deferred || !progressed {
                return Ok(());
            }
        }
    }

    /// Groups the current entries into per-key chains, each in submission order, ordered by
    /// the sequence of their oldest write.
    async fn chains(&self) -> Vec<Vec<QueuedWrite>> {
        let state = self.state.lock().await;
        let mut positions: HashMap<&str, usize> = HashMap::new();
        let mut chains: Vec<Vec<QueuedWrite>> = Vec::new();

        for write in state.entries.values() {
            match positions.get(write.ordering_key.as_str()) {
                Some(&index) => chains[index].push(write.clone()),
                None => {
                    positions.insert(&write.ordering_key, chains.len());
                    chains.push(vec![write.clone()]);
                }
            }
        }

        chains
    }

    async fn replay_chain(
        &self,
        chain: Vec<QueuedWrite>,
        replayer: &dyn WriteReplayer,
    ) -> AccessResult<Vec<ChainStep>> {
        let mut steps = Vec::with_capacity(chain.len());

        for write in chain {
            match replayer.replay(&write).await {
                Err(err) if err.is_transport() => {
                    warn!(
                        id = %write.id,
                        key = %write.ordering_key,
                        attempt = write.attempt_count + 1,
                        error = %err,
                        "replay failed to reach the service"
                    );
                    self.defer(&write).await?;
                    steps.push(ChainStep::Deferred);
                    break;
                }
                Ok(response) => {
                    debug!(id = %write.id, key = %write.ordering_key, "replay delivered");
                    self.complete(&write, Ok(response)).await?;
                    steps.push(ChainStep::Delivered);
                }
                Err(err) => {
                    warn!(id = %write.id, key = %write.ordering_key, error = %err, "replay rejected");
                    self.complete(&write, Err(err)).await?;
                    steps.push(ChainStep::Rejected);
                }
            }
        }

        Ok(steps)
    }

    /// Keeps `write` at its position with one more attempt on record.
    async fn defer(&self, write: &QueuedWrite) -> AccessResult<()> {
        let mut state = self.state.lock().await;

        if let Some(entry) = state.entries.get_mut(&write.sequence) {
            entry.attempt_count += 1;
            let value = serialize_to_bson(&*entry)?;
            self.store
                .put(self.namespace.as_str(), &sequence_key(write.sequence), value)
                .await?;
        }

        Ok(())
    }

    /// Removes `write` and delivers its outcome to the caller, if one is waiting.
    async fn complete(&self, write: &QueuedWrite, outcome: Delivery) -> AccessResult<()> {
        let completion = {
            let mut state = self.state.lock().await;
            self.store
                .delete(self.namespace.as_str(), &sequence_key(write.sequence))
                .await?;
            state.entries.remove(&write.sequence);
            state.completions.remove(&write.id)
        };

        match completion {
            Some(sender) => {
                // The caller may have dropped its handle; the write is delivered regardless.
                let _ = sender.send(outcome);
            }
            None => info!(
                id = %write.id,
                delivered = outcome.is_ok(),
                "replayed a write with no waiting caller"
            ),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        address::{ResourceAddress, ResourceKind},
        persist::testing,
    };
    use serde_json::json;
    use std::{
        collections::HashSet,
        sync::{Mutex as StdMutex, atomic::AtomicUsize},
    };
    use tokio::sync::Notify;

    const HOST: &str = "https://acct.example.com";

    /// Delivers everything except writes to unreachable keys, and rejects labels starting
    /// with `bad`.
    #[derive(Default)]
    struct ScriptedReplayer {
        seen: StdMutex<Vec<String>>,
        unreachable: StdMutex<HashSet<String>>,
    }

    impl ScriptedReplayer {
        fn unreachable(&self, key: &str) {
            self.unreachable.lock().unwrap().insert(key.to_string());
        }

        fn reachable(&self) {
            self.unreachable.lock().unwrap().clear();
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WriteReplayer for ScriptedReplayer {
        async fn replay(&self, write: &QueuedWrite) -> Delivery {
            let body = write.body_value()?.unwrap_or(Value::Null);
            let label = body["label"].as_str().unwrap_or_default().to_string();
            self.seen.lock().unwrap().push(label.clone());

            if self.unreachable.lock().unwrap().contains(&write.ordering_key) {
                return Err(AccessError::TransportUnavailable("offline".into()));
            }
            if label.starts_with("bad") {
                return Err(AccessError::ServerApplication { status_code: 409, payload: Value::Null });
            }

            Ok(ResourceResponse::new(body))
        }
    }

    /// Holds its first replay until released, then fails it as a transport error. Later
    /// replays are delivered.
    #[derive(Default)]
    struct GatedReplayer {
        calls: AtomicUsize,
        started: Notify,
        gate: Notify,
        offline: AtomicBool,
    }

    #[async_trait]
    impl WriteReplayer for GatedReplayer {
        async fn replay(&self, write: &QueuedWrite) -> Delivery {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.started.notify_one();
                self.gate.notified().await;
                return Err(AccessError::TransportUnavailable("timed out".into()));
            }
            Ok(ResourceResponse::new(write.body_value()?.unwrap_or(Value::Null)))
        }

        fn is_connected(&self) -> bool {
            !self.offline.load(Ordering::SeqCst)
        }
    }

    fn write(key: &str, label: &str) -> QueuedWrite {
        QueuedWrite::new(
            WriteKind::Create,
            Target::feed(Some(ResourceAddress::database("D1")), ResourceKind::Collection),
            key,
            Some(&json!({ "id": label, "label": label })),
            Vec::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_chain_stops_at_transport_failure_and_resumes_in_order() {
        let queue = WriteReplayQueue::open(testing::shared(), HOST).await.unwrap();
        let replayer = ScriptedReplayer::default();

        let first = queue.enqueue(write("k1", "w1")).await.unwrap();
        let second = queue.enqueue(write("k1", "w2")).await.unwrap();
        let third = queue.enqueue(write("k1", "w3")).await.unwrap();

        replayer.unreachable("k1");
        let report = queue.drain(&replayer).await.unwrap();

        assert_eq!(report.delivered, 0);
        assert_eq!(report.deferred, 1);
        assert_eq!(replayer.seen(), vec!["w1"]);
        let pending = queue.pending().await;
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].attempt_count, 1);
        assert_eq!(pending[1].attempt_count, 0);

        replayer.reachable();
        let report = queue.drain(&replayer).await.unwrap();

        assert_eq!(report.delivered, 3);
        assert_eq!(replayer.seen(), vec!["w1", "w1", "w2", "w3"]);
        assert!(queue.is_empty().await);
        assert!(!queue.is_draining());

        for (handle, label) in [(first, "w1"), (second, "w2"), (third, "w3")] {
            assert_eq!(handle.await.unwrap().resource["label"], label);
        }
    }

    #[tokio::test]
    async fn test_independent_keys_do_not_block_each_other() {
        let queue = WriteReplayQueue::open(testing::shared(), HOST).await.unwrap();
        let replayer = ScriptedReplayer::default();

        queue.enqueue(write("k1", "w1")).await.unwrap();
        let other = queue.enqueue(write("k2", "w2")).await.unwrap();

        replayer.unreachable("k1");
        let report = queue.drain(&replayer).await.unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(report.deferred, 1);
        assert!(queue.has_pending("k1").await);
        assert!(!queue.has_pending("k2").await);
        assert_eq!(other.await.unwrap().resource["label"], "w2");
    }

    #[tokio::test]
    async fn test_rejected_replay_reaches_the_caller() {
        let queue = WriteReplayQueue::open(testing::shared(), HOST).await.unwrap();
        let replayer = ScriptedReplayer::default();

        let rejected = queue.enqueue(write("k1", "bad-1")).await.unwrap();
        let after = queue.enqueue(write("k1", "w2")).await.unwrap();

        let report = queue.drain(&replayer).await.unwrap();

        assert_eq!(report.rejected, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(rejected.await.unwrap_err().status_code(), Some(409));
        assert!(after.await.is_ok());
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_writes_survive_reopen() {
        let store = testing::shared();
        let queue = WriteReplayQueue::open(store.clone(), HOST).await.unwrap();
        queue.enqueue(write("k1", "w1")).await.unwrap();
        queue.enqueue(write("k1", "w2")).await.unwrap();
        drop(queue);

        let reopened = WriteReplayQueue::open(store, HOST).await.unwrap();
        reopened.enqueue(write("k1", "w3")).await.unwrap();

        let sequences: Vec<i64> = reopened.pending().await.iter().map(|w| w.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);

        let replayer = ScriptedReplayer::default();
        let report = reopened.drain(&replayer).await.unwrap();

        assert_eq!(report.delivered, 3);
        assert_eq!(replayer.seen(), vec!["w1", "w2", "w3"]);
    }

    #[tokio::test]
    async fn test_concurrent_drain_returns_immediately() {
        let queue = WriteReplayQueue::open(testing::shared(), HOST).await.unwrap();
        let replayer = GatedReplayer::default();
        queue.enqueue(write("k1", "w1")).await.unwrap();

        let (_, refused) = tokio::join!(queue.drain(&replayer), async {
            replayer.started.notified().await;
            assert!(queue.is_draining());
            let refused = queue.drain(&replayer).await.unwrap();
            replayer.gate.notify_one();
            refused
        });

        assert_eq!(refused, DrainReport { already_running: true, ..Default::default() });
    }

    #[tokio::test]
    async fn test_refused_drain_is_rerun_by_the_running_one() {
        let queue = WriteReplayQueue::open(testing::shared(), HOST).await.unwrap();
        let replayer = GatedReplayer::default();
        let pending = queue.enqueue(write("k1", "w1")).await.unwrap();

        let (report, _) = tokio::join!(queue.drain(&replayer), async {
            replayer.started.notified().await;
            queue.drain(&replayer).await.unwrap();
            replayer.gate.notify_one();
        });

        let report = report.unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(report.delivered, 1);
        assert!(queue.is_empty().await);
        assert!(!queue.is_draining());
        assert_eq!(pending.await.unwrap().resource["label"], "w1");
    }

    #[tokio::test]
    async fn test_write_queued_during_a_drain_is_replayed_by_it() {
        let queue = WriteReplayQueue::open(testing::shared(), HOST).await.unwrap();
        let replayer = GatedReplayer::default();
        queue.enqueue(write("k1", "w1")).await.unwrap();

        let (report, late) = tokio::join!(queue.drain(&replayer), async {
            replayer.started.notified().await;
            let late = queue.enqueue(write("k2", "w2")).await.unwrap();
            replayer.gate.notify_one();
            late
        });

        assert_eq!(report.unwrap().delivered, 2);
        assert_eq!(late.await.unwrap().resource["label"], "w2");
    }

    #[tokio::test]
    async fn test_no_rerun_while_disconnected() {
        let queue = WriteReplayQueue::open(testing::shared(), HOST).await.unwrap();
        let replayer = GatedReplayer::default();
        queue.enqueue(write("k1", "w1")).await.unwrap();

        let (report, _) = tokio::join!(queue.drain(&replayer), async {
            replayer.started.notified().await;
            queue.drain(&replayer).await.unwrap();
            replayer.offline.store(true, Ordering::SeqCst);
            replayer.gate.notify_one();
        });

        let report = report.unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(report.delivered, 0);
        assert_eq!(queue.len().await, 1);
        assert!(!queue.is_draining());
    }
}
