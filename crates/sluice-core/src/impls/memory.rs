//! MemoryQueue - 単一リストの参照実装
//!
//! No blocking and no bounds: `dequeue` returns `None` immediately when nothing
//! is pending. Handy for tests and as the simplest conforming backend.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use crate::domain::{DistributionId, QueueError, Source};
use crate::ports::{EnqueueStatus, SourceQueue};

struct MemoryQueueState<S> {
    /// Pending sources in arrival order.
    items: VecDeque<S>,

    /// Distributions seen so far, in first-seen order.
    known: Vec<DistributionId>,

    /// Distributions closed by `complete_distribution`.
    closed: HashSet<DistributionId>,

    /// Rotation point for round-robin `dequeue`.
    cursor: usize,
}

pub struct MemoryQueue<S> {
    state: Mutex<MemoryQueueState<S>>,
    completed: AtomicBool,
    disposed: AtomicBool,
}

impl<S: Source> MemoryQueue<S> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryQueueState {
                items: VecDeque::new(),
                known: Vec::new(),
                closed: HashSet::new(),
                cursor: 0,
            }),
            completed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryQueueState<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_live(&self) -> Result<(), QueueError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(QueueError::Disposed);
        }
        Ok(())
    }

    fn push(&self, source: S) {
        let id = source.distribution_id();
        let mut state = self.state();
        if !state.known.contains(&id) {
            state.known.push(id);
        }
        state.items.push_back(source);
    }
}

impl<S: Source> Default for MemoryQueue<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<S: Source> SourceQueue<S> for MemoryQueue<S> {
    async fn enqueue(&self, source: S) -> Result<EnqueueStatus, QueueError> {
        self.ensure_live()?;
        let id = source.distribution_id();
        if self.completed.load(Ordering::SeqCst) || self.state().closed.contains(&id) {
            return Ok(EnqueueStatus::Completed);
        }
        self.push(source);
        Ok(EnqueueStatus::Accepted)
    }

    async fn requeue(&self, source: S) -> Result<EnqueueStatus, QueueError> {
        self.ensure_live()?;
        self.push(source);
        Ok(EnqueueStatus::Accepted)
    }

    async fn dequeue(&self) -> Result<Option<S>, QueueError> {
        self.ensure_live()?;
        let mut state = self.state();
        let turns = state.known.len();
        for step in 0..turns {
            let slot = (state.cursor + step) % turns;
            let id = state.known[slot];
            if let Some(index) = state.items.iter().position(|s| s.distribution_id() == id) {
                state.cursor = (slot + 1) % turns;
                return Ok(state.items.remove(index));
            }
        }
        Ok(None)
    }

    async fn dequeue_from(&self, distribution: DistributionId) -> Result<Option<S>, QueueError> {
        self.ensure_live()?;
        let mut state = self.state();
        if !state.known.contains(&distribution) {
            return Err(QueueError::UnknownDistribution(distribution));
        }
        let index = state
            .items
            .iter()
            .position(|s| s.distribution_id() == distribution);
        Ok(index.and_then(|index| state.items.remove(index)))
    }

    fn complete_enqueue(&self) {
        self.completed.store(true, Ordering::SeqCst);
    }

    fn complete_distribution(&self, distribution: DistributionId) -> Result<(), QueueError> {
        self.ensure_live()?;
        let mut state = self.state();
        if !state.known.contains(&distribution) {
            return Err(QueueError::UnknownDistribution(distribution));
        }
        state.closed.insert(distribution);
        Ok(())
    }

    fn is_empty(&self) -> bool {
        if self.disposed.load(Ordering::SeqCst) {
            return true;
        }
        self.completed.load(Ordering::SeqCst) && self.state().items.is_empty()
    }

    fn count(&self) -> usize {
        self.state().items.len()
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.completed.store(true, Ordering::SeqCst);
        let mut state = self.state();
        let dropped = state.items.len();
        state.items.clear();
        state.known.clear();
        debug!(dropped, "memory queue disposed");
    }
}
