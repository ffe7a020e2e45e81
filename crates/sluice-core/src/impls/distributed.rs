//! DistributedQueue - distribution ごとに分割された blocking queue
//!
//! # 構造
//! - distribution ごとに `nodes` 個の shard（`Mutex<VecDeque>`）
//! - shard の entry には distribution 内の連番を付ける
//! - round-robin 用の cursor（既知の DistributionId の FIFO）
//!
//! Sharding lets many workers hit the same distribution without queuing on one
//! lock. Dequeue always takes the entry with the lowest sequence among the shard
//! heads, so FIFO per distribution survives the split.
//!
//! Waiting is done with `tokio::sync::Notify` raced against a deadline; no call
//! blocks for longer than the configured timeout.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use crate::config::QueueOptions;
use crate::domain::{DistributionId, QueueError, Source};
use crate::ports::{EnqueueStatus, SourceQueue};

// Guarded data is only ever pushed/popped whole, so a poisoned lock is still consistent.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Entry<S> {
    seq: u64,
    source: S,
}

/// One distribution: its shards plus the latch and wake-up signals.
struct Distribution<S> {
    id: DistributionId,
    nodes: Vec<Mutex<VecDeque<Entry<S>>>>,
    node_capacity: Option<usize>,
    next_seq: AtomicU64,
    /// Shard the next push starts probing from.
    next_node: AtomicUsize,
    len: AtomicUsize,
    completed: AtomicBool,
    items: Notify,
    space: Notify,
}

impl<S> Distribution<S> {
    fn new(id: DistributionId, options: &QueueOptions) -> Self {
        Self {
            id,
            // `QueueOptions::validate` rejects zero; direct construction still gets one shard.
            nodes: (0..options.nodes.max(1))
                .map(|_| Mutex::new(VecDeque::new()))
                .collect(),
            node_capacity: options.node_capacity,
            next_seq: AtomicU64::new(0),
            next_node: AtomicUsize::new(0),
            len: AtomicUsize::new(0),
            completed: AtomicBool::new(false),
            items: Notify::new(),
            space: Notify::new(),
        }
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Completed and drained: nothing will ever come out again.
    fn is_finished(&self) -> bool {
        self.is_completed() && self.len() == 0
    }

    fn complete(&self) {
        if !self.completed.swap(true, Ordering::SeqCst) {
            debug!(distribution = %self.id, "distribution completed");
        }
        self.items.notify_waiters();
        self.space.notify_waiters();
    }

    /// Push into the next shard with room, rotating the starting shard per call.
    /// Hands the source back when all are full.
    fn try_push(&self, source: S, bounded: bool) -> Result<(), S> {
        let count = self.nodes.len();
        let start = self.next_node.fetch_add(1, Ordering::Relaxed) % count;
        for offset in 0..count {
            let node = &self.nodes[(start + offset) % count];
            let mut guard = lock(node);
            let has_room = !bounded || self.node_capacity.is_none_or(|cap| guard.len() < cap);
            if has_room {
                let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
                guard.push_back(Entry { seq, source });
                self.len.fetch_add(1, Ordering::SeqCst);
                drop(guard);
                self.items.notify_one();
                return Ok(());
            }
        }
        Err(source)
    }

    /// Lowest sequence among the shard heads.
    fn oldest_head(&self) -> Option<(usize, u64)> {
        let mut oldest: Option<(usize, u64)> = None;
        for (index, node) in self.nodes.iter().enumerate() {
            let guard = lock(node);
            if let Some(head) = guard.front()
                && oldest.is_none_or(|(_, seq)| head.seq < seq)
            {
                oldest = Some((index, head.seq));
            }
        }
        oldest
    }

    /// Pop the oldest entry across all shards, without waiting.
    ///
    /// Shards are scanned one lock at a time, so a push can land behind the scan.
    /// A second scan must agree before anything is taken.
    fn try_take(&self) -> Option<S> {
        loop {
            let (index, seq) = self.oldest_head()?;
            if self.oldest_head() != Some((index, seq)) {
                continue;
            }

            let mut guard = lock(&self.nodes[index]);
            if guard.front().is_some_and(|head| head.seq == seq)
                && let Some(entry) = guard.pop_front()
            {
                drop(guard);
                self.len.fetch_sub(1, Ordering::SeqCst);
                self.space.notify_one();
                return Some(entry.source);
            }
            // 他の consumer に先を越された。もう一度 head を見直す
        }
    }

    #[cfg(test)]
    fn node_lens(&self) -> Vec<usize> {
        self.nodes.iter().map(|node| lock(node).len()).collect()
    }

    async fn push(&self, source: S, timeout: Duration) -> EnqueueStatus {
        let deadline = Instant::now() + timeout;
        let mut source = source;
        loop {
            if self.is_completed() {
                return EnqueueStatus::Completed;
            }

            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            source = match self.try_push(source, true) {
                Ok(()) => return EnqueueStatus::Accepted,
                Err(source) => source,
            };

            if timeout_at(deadline, space).await.is_err() {
                return EnqueueStatus::TimedOut;
            }
        }
    }

    async fn pop(&self, timeout: Duration) -> Option<S> {
        let deadline = Instant::now() + timeout;
        loop {
            let items = self.items.notified();
            tokio::pin!(items);
            items.as_mut().enable();

            if let Some(source) = self.try_take() {
                return Some(source);
            }
            if self.is_finished() {
                return None;
            }
            if timeout_at(deadline, items).await.is_err() {
                return None;
            }
        }
    }

    fn clear(&self) {
        for node in &self.nodes {
            lock(node).clear();
        }
        self.len.store(0, Ordering::SeqCst);
    }
}

/// DistributedQueue は並行・分割・シグナル付きの backend
///
/// # 使用例
/// ```ignore
/// let queue = DistributedQueue::new(QueueOptions::bounded(4, 256));
/// queue.enqueue(source).await?;
/// queue.complete_enqueue();
/// while let Some(source) = queue.dequeue().await? { /* ... */ }
/// ```
pub struct DistributedQueue<S> {
    options: QueueOptions,
    distributions: RwLock<HashMap<DistributionId, Arc<Distribution<S>>>>,
    cursor: Mutex<VecDeque<DistributionId>>,
    completed: AtomicBool,
    disposed: AtomicBool,
    dispose_lock: Mutex<()>,
    available: Notify,
}

impl<S: Source> DistributedQueue<S> {
    pub fn new(options: QueueOptions) -> Self {
        Self {
            options,
            distributions: RwLock::new(HashMap::new()),
            cursor: Mutex::new(VecDeque::new()),
            completed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            dispose_lock: Mutex::new(()),
            available: Notify::new(),
        }
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    /// Every distribution id seen so far, in round-robin order.
    pub fn known_distributions(&self) -> Vec<DistributionId> {
        lock(&self.cursor).iter().copied().collect()
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Completed and drained for one distribution.
    pub fn is_distribution_empty(&self, distribution: DistributionId) -> Result<bool, QueueError> {
        self.ensure_live()?;
        self.distribution(distribution)
            .map(|d| d.is_finished())
            .ok_or(QueueError::UnknownDistribution(distribution))
    }

    fn ensure_live(&self) -> Result<(), QueueError> {
        if self.is_disposed() {
            return Err(QueueError::Disposed);
        }
        Ok(())
    }

    fn distribution(&self, id: DistributionId) -> Option<Arc<Distribution<S>>> {
        self.distributions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Existing distribution, or a new one registered in the round-robin cursor.
    ///
    /// `force` creates even after completion (used by requeue); such a distribution
    /// starts out completed.
    fn distribution_or_register(
        &self,
        id: DistributionId,
        force: bool,
    ) -> Option<Arc<Distribution<S>>> {
        if let Some(existing) = self.distribution(id) {
            return Some(existing);
        }

        let mut map = self
            .distributions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = map.get(&id) {
            return Some(Arc::clone(existing));
        }

        let completed = self.is_completed();
        if completed && !force {
            return None;
        }

        let distribution = Arc::new(Distribution::new(id, &self.options));
        if completed {
            distribution.complete();
        }
        map.insert(id, Arc::clone(&distribution));
        lock(&self.cursor).push_back(id);
        debug!(distribution = %id, "registered distribution");
        Some(distribution)
    }

    /// One full turn of the cursor, taking the first item found.
    fn take_round_robin(&self) -> Option<S> {
        let turns = lock(&self.cursor).len();
        for _ in 0..turns {
            let id = lock(&self.cursor).pop_front()?;
            let distribution = self.distribution(id);
            lock(&self.cursor).push_back(id);

            if let Some(source) = distribution.and_then(|d| d.try_take()) {
                return Some(source);
            }
        }
        None
    }

    #[cfg(test)]
    fn shard_lens(&self, id: DistributionId) -> Vec<usize> {
        self.distribution(id).map(|d| d.node_lens()).unwrap_or_default()
    }

    fn snapshot(&self) -> Vec<Arc<Distribution<S>>> {
        self.distributions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl<S: Source> SourceQueue<S> for DistributedQueue<S> {
    async fn enqueue(&self, source: S) -> Result<EnqueueStatus, QueueError> {
        self.ensure_live()?;
        let id = source.distribution_id();

        let Some(distribution) = self.distribution_or_register(id, false) else {
            warn!(distribution = %id, "enqueue after completion, source dropped");
            return Ok(EnqueueStatus::Completed);
        };

        let status = distribution.push(source, self.options.timeout()).await;
        match status {
            EnqueueStatus::Accepted => self.available.notify_one(),
            EnqueueStatus::TimedOut => warn!(
                distribution = %id,
                timeout_ms = self.options.timeout_ms,
                "queue full, source dropped"
            ),
            EnqueueStatus::Completed => {
                warn!(distribution = %id, "distribution completed, source dropped")
            }
        }
        Ok(status)
    }

    async fn requeue(&self, source: S) -> Result<EnqueueStatus, QueueError> {
        self.ensure_live()?;
        let id = source.distribution_id();
        let Some(distribution) = self.distribution_or_register(id, true) else {
            return Ok(EnqueueStatus::Completed);
        };

        // In-flight items come back regardless of the latch and the shard bound.
        if distribution.try_push(source, false).is_err() {
            return Ok(EnqueueStatus::TimedOut);
        }
        self.available.notify_one();
        Ok(EnqueueStatus::Accepted)
    }

    async fn dequeue(&self) -> Result<Option<S>, QueueError> {
        let deadline = Instant::now() + self.options.timeout();
        loop {
            self.ensure_live()?;

            let available = self.available.notified();
            tokio::pin!(available);
            available.as_mut().enable();

            if let Some(source) = self.take_round_robin() {
                return Ok(Some(source));
            }
            if self.is_empty() {
                return Ok(None);
            }
            if timeout_at(deadline, available).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn dequeue_from(&self, distribution: DistributionId) -> Result<Option<S>, QueueError> {
        self.ensure_live()?;
        let target = self
            .distribution(distribution)
            .ok_or(QueueError::UnknownDistribution(distribution))?;
        Ok(target.pop(self.options.timeout()).await)
    }

    fn complete_enqueue(&self) {
        if !self.completed.swap(true, Ordering::SeqCst) {
            debug!("queue enqueue completed");
        }
        for distribution in self.snapshot() {
            distribution.complete();
        }
        self.available.notify_waiters();
    }

    fn complete_distribution(&self, distribution: DistributionId) -> Result<(), QueueError> {
        self.ensure_live()?;
        let target = self
            .distribution(distribution)
            .ok_or(QueueError::UnknownDistribution(distribution))?;
        target.complete();
        self.available.notify_waiters();
        Ok(())
    }

    fn is_empty(&self) -> bool {
        if self.is_disposed() {
            return true;
        }
        self.is_completed() && self.snapshot().iter().all(|d| d.is_finished())
    }

    fn count(&self) -> usize {
        self.snapshot().iter().map(|d| d.len()).sum()
    }

    fn dispose(&self) {
        let _guard = lock(&self.dispose_lock);
        if self.is_disposed() {
            return;
        }

        self.complete_enqueue();
        self.disposed.store(true, Ordering::SeqCst);

        let drained = self.count();
        for distribution in self.snapshot() {
            distribution.clear();
        }
        self.distributions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        lock(&self.cursor).clear();
        self.available.notify_waiters();

        debug!(dropped = drained, "queue disposed");
    }
}
