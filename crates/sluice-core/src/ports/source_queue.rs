//! SourceQueue port - queue backend の抽象化
//!
//! Dispatchers and buffers talk to storage only through this trait, so a remote
//! backend can replace the in-process ones without touching the runtime.
//!
//! # 実装
//! - **DistributedQueue**: sharded, bounded, blocking with timeout
//! - **MemoryQueue**: plain list, no blocking (reference / tests)

use async_trait::async_trait;

use crate::domain::{DistributionId, QueueError, Source};

/// What happened to an enqueued source.
///
/// `TimedOut` and `Completed` both mean the source was dropped. Callers that
/// ignore the status get best-effort semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueStatus {
    Accepted,
    /// Storage stayed full for the whole timeout.
    TimedOut,
    /// The target scope was already marked complete.
    Completed,
}

impl EnqueueStatus {
    pub fn is_accepted(self) -> bool {
        self == EnqueueStatus::Accepted
    }
}

/// SourceQueue は source を保持する backend
///
/// # 設計原則
/// - distribution ごとに FIFO
/// - `dequeue()` は distribution 間で round-robin
/// - `complete_enqueue()` は一方向の latch（冪等）
/// - `is_empty()` だけが「もう何も来ない」を判定できる
#[async_trait]
pub trait SourceQueue<S: Source>: Send + Sync {
    /// Append one source to its distribution.
    async fn enqueue(&self, source: S) -> Result<EnqueueStatus, QueueError>;

    /// Enqueue a sequence serially; returns how many were accepted.
    ///
    /// Concurrent calls interleave, so per-distribution order only holds for a
    /// single producer.
    async fn enqueue_range(&self, sources: Vec<S>) -> Result<usize, QueueError> {
        let mut accepted = 0;
        for source in sources {
            if self.enqueue(source).await?.is_accepted() {
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    /// Put back a source that was dequeued from this queue earlier.
    ///
    /// Unlike `enqueue`, this ignores the completion latch: a completed queue
    /// still takes back its own in-flight items until it is disposed.
    async fn requeue(&self, source: S) -> Result<EnqueueStatus, QueueError>;

    /// Next source in round-robin order, or `None` if nothing arrived within the timeout.
    ///
    /// Non-blocking backends may return `None` immediately; callers that poll
    /// must back off themselves.
    async fn dequeue(&self) -> Result<Option<S>, QueueError>;

    /// Next source of one distribution, bypassing fairness.
    async fn dequeue_from(&self, distribution: DistributionId) -> Result<Option<S>, QueueError>;

    fn complete_enqueue(&self);

    fn complete_distribution(&self, distribution: DistributionId) -> Result<(), QueueError>;

    /// True once enqueue is complete and every distribution is drained.
    ///
    /// Only `complete_enqueue` closes the queue as a whole. Completing every
    /// distribution one by one with `complete_distribution` never makes it empty.
    fn is_empty(&self) -> bool;

    /// Pending sources across all distributions. Advisory only.
    fn count(&self) -> usize;

    /// Complete, then release storage. Safe to call more than once.
    fn dispose(&self);
}
