//! Dispatch queue for the orchestrator's worker pool.
//!
//! Operations for one cluster must reach its agent in submission order, so
//! the queue serializes dispatch per cluster while keeping clusters
//! independent: a worker that pops an operation marks its cluster busy, and
//! the cluster's next operation only becomes available once the worker calls
//! `release` (after the send, not after the result; results may complete
//! out of order).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::HubError;

struct Inner {
    /// FIFO of queued operation ids per cluster.
    per_cluster: HashMap<Uuid, VecDeque<Uuid>>,
    /// Clusters with queued work that no worker currently owns.
    ready: VecDeque<Uuid>,
    /// Clusters whose head operation a worker is dispatching right now.
    busy: HashSet<Uuid>,
    closed: bool,
}

/// Multi-producer, multi-worker queue with per-cluster FIFO dispatch.
#[derive(Clone)]
pub struct DispatchQueue {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    depth: usize,
}

impl DispatchQueue {
    /// `depth` bounds the number of queued operations per cluster.
    pub fn new(depth: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                per_cluster: HashMap::new(),
                ready: VecDeque::new(),
                busy: HashSet::new(),
                closed: false,
            })),
            notify: Arc::new(Notify::new()),
            depth: depth.max(1),
        }
    }

    /// Enqueue an operation for its cluster.
    ///
    /// Fails with `channel_full` when the cluster's backlog is at capacity
    /// and `channel_closed` after shutdown.
    pub fn push(&self, cluster_id: Uuid, operation_id: Uuid) -> Result<(), HubError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(HubError::ChannelClosed);
        }
        let deque = inner.per_cluster.entry(cluster_id).or_default();
        if deque.len() >= self.depth {
            return Err(HubError::ChannelFull);
        }
        let was_empty = deque.is_empty();
        deque.push_back(operation_id);
        if was_empty && !inner.busy.contains(&cluster_id) {
            inner.ready.push_back(cluster_id);
        }
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    /// Pop the next dispatchable operation, waiting when none is available.
    /// Marks the cluster busy until `release`. Returns `None` once the
    /// queue is closed and drained.
    pub async fn pop(&self) -> Option<(Uuid, Uuid)> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(cluster_id) = inner.ready.pop_front() {
                    let deque = inner
                        .per_cluster
                        .get_mut(&cluster_id)
                        .expect("ready cluster has a deque");
                    let operation_id = deque.pop_front().expect("ready cluster is non-empty");
                    if deque.is_empty() {
                        inner.per_cluster.remove(&cluster_id);
                    }
                    inner.busy.insert(cluster_id);
                    // Hand the baton on: more ready clusters may be waiting
                    // on a wakeup this pop consumed.
                    if !inner.ready.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some((cluster_id, operation_id));
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Release a cluster after its head operation was dispatched (or its
    /// dispatch abandoned), making the next queued operation available.
    pub fn release(&self, cluster_id: Uuid) {
        let mut inner = self.inner.lock();
        inner.busy.remove(&cluster_id);
        if inner
            .per_cluster
            .get(&cluster_id)
            .is_some_and(|q| !q.is_empty())
        {
            inner.ready.push_back(cluster_id);
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Drop a queued operation (cancellation before dispatch). Returns
    /// whether it was still queued.
    pub fn remove(&self, cluster_id: Uuid, operation_id: Uuid) -> bool {
        let mut inner = self.inner.lock();
        let Some(deque) = inner.per_cluster.get_mut(&cluster_id) else {
            return false;
        };
        let Some(pos) = deque.iter().position(|id| *id == operation_id) else {
            return false;
        };
        deque.remove(pos);
        if deque.is_empty() {
            inner.per_cluster.remove(&cluster_id);
            if let Some(ready_pos) = inner.ready.iter().position(|c| *c == cluster_id) {
                inner.ready.remove(ready_pos);
            }
        }
        true
    }

    /// Close the queue, preventing new pushes and waking all waiting workers.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Total queued operations across clusters.
    pub fn len(&self) -> usize {
        self.inner.lock().per_cluster.values().map(|q| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
