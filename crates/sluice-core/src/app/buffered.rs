//! BufferedDispatcher - 小さなローカル buffer を backend の前に置く
//!
//! # 構成
//! - producer → buffer（`DistributedQueue`、bounded）
//! - flush workers: buffer → backend（最大 `flush_jobs` 個、遅延起動）
//! - dispatch workers: backend → processors（`Dispatcher` に委譲）
//!
//! The buffer bound is the producer's backpressure; a slow backend only slows
//! the flush workers. With more than one flush worker, items of the same
//! distribution can be reordered on their way to the backend.

use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tracing::{Instrument, debug, debug_span, warn};

use super::cancel::CancelToken;
use super::dispatcher::{DispatchStats, Dispatcher};
use crate::config::BufferOptions;
use crate::domain::{QueueError, Source};
use crate::impls::DistributedQueue;
use crate::ports::{EnqueueStatus, Processor, SourceQueue};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct BufferedInner<S> {
    buffer: DistributedQueue<S>,
    dispatcher: Dispatcher<S>,
    options: BufferOptions,
    active_flushers: AtomicUsize,
    flushers: Mutex<Vec<JoinHandle<()>>>,
    disposed: Mutex<bool>,
}

pub struct BufferedDispatcher<S> {
    inner: Arc<BufferedInner<S>>,
}

impl<S> Clone for BufferedDispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Source> BufferedDispatcher<S> {
    pub fn new(dispatcher: Dispatcher<S>, options: BufferOptions) -> Self {
        Self {
            inner: Arc::new(BufferedInner {
                buffer: DistributedQueue::new(options.queue.clone()),
                dispatcher,
                options,
                active_flushers: AtomicUsize::new(0),
                flushers: Mutex::new(Vec::new()),
                disposed: Mutex::new(false),
            }),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher<S> {
        &self.inner.dispatcher
    }

    pub fn buffer(&self) -> &DistributedQueue<S> {
        &self.inner.buffer
    }

    pub fn options(&self) -> &BufferOptions {
        &self.inner.options
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.inner.dispatcher.cancel_token()
    }

    pub fn register_processor<P>(&self, processor: P) -> bool
    where
        P: Processor<S> + 'static,
    {
        self.inner.dispatcher.register_processor(processor)
    }

    pub fn active_flush_workers(&self) -> usize {
        self.inner.active_flushers.load(Ordering::SeqCst)
    }

    /// Buffer the source. Blocks up to the buffer timeout when the buffer is full.
    pub async fn enqueue(&self, source: S) -> Result<EnqueueStatus, QueueError> {
        self.ensure_flushing();
        self.inner.buffer.enqueue(source).await
    }

    pub async fn enqueue_range(
        &self,
        sources: impl IntoIterator<Item = S>,
    ) -> Result<usize, QueueError> {
        let cancel = self.cancel_token();
        let mut accepted = 0;
        for source in sources {
            if cancel.is_cancelled() {
                break;
            }
            if self.enqueue(source).await?.is_accepted() {
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    /// No more producer input. Only the buffer is completed here; the backend is
    /// completed by the flush workers once the buffer drains.
    pub fn complete_enqueue(&self) {
        let inner = &self.inner;
        inner.buffer.complete_enqueue();
        // nothing was ever buffered, or every flusher is already gone
        if inner.active_flushers.load(Ordering::SeqCst) == 0 && inner.buffer.is_empty() {
            inner.dispatcher.complete_enqueue();
        }
    }

    pub async fn dispatch(&self) -> Result<DispatchStats, QueueError> {
        self.inner.dispatcher.dispatch().await
    }

    /// Wait for every flush worker started so far (and any they race with) to exit.
    pub async fn flush_complete(&self) {
        loop {
            let handles = mem::take(&mut *lock(&self.inner.flushers));
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(error) = handle.await {
                    warn!(%error, "flush worker aborted");
                }
            }
        }
    }

    fn ensure_flushing(&self) {
        let inner = &self.inner;
        if inner.buffer.is_disposed() {
            return;
        }
        loop {
            let active = inner.active_flushers.load(Ordering::SeqCst);
            if active >= inner.options.flush_jobs {
                return;
            }
            if inner
                .active_flushers
                .compare_exchange(active, active + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                continue;
            }

            let this = self.clone();
            let span = debug_span!("flush_worker", worker_id = active);
            let handle = tokio::spawn(async move { this.flush_worker().await }.instrument(span));
            lock(&inner.flushers).push(handle);
        }
    }

    async fn flush_worker(&self) {
        let inner = &self.inner;
        let cancel = inner.dispatcher.cancel_token();
        let mut moved = 0_usize;
        debug!("flush worker started");

        while !inner.buffer.is_empty() && !cancel.is_cancelled() {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = inner.buffer.dequeue() => next,
            };

            match next {
                Ok(Some(source)) => match inner.dispatcher.enqueue(source).await {
                    Ok(EnqueueStatus::Accepted) => moved += 1,
                    Ok(status) => warn!(?status, "backend refused buffered source"),
                    Err(error) => {
                        warn!(%error, "backend unavailable");
                        break;
                    }
                },
                Ok(None) => {}
                Err(QueueError::Disposed) => break,
                Err(error) => {
                    warn!(%error, "buffer dequeue failed");
                    break;
                }
            }
        }

        // The last flusher out completes the backend, so no sibling is still
        // holding an item when the latch closes.
        let last = inner.active_flushers.fetch_sub(1, Ordering::SeqCst) == 1;
        if last && (inner.buffer.is_empty() || cancel.is_cancelled()) {
            inner.dispatcher.complete_enqueue();
        }
        debug!(moved, last, "flush worker stopped");
    }

    /// Dispose the buffer, then the dispatcher (and with it the backend).
    pub fn dispose(&self) {
        let mut disposed = lock(&self.inner.disposed);
        if *disposed {
            return;
        }
        self.inner.buffer.dispose();
        self.inner.dispatcher.dispose();
        *disposed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DispatchOptions, QueueOptions};
    use crate::domain::DistributionId;
    use crate::impls::MemoryQueue;
    use crate::testing::{Behavior, SUBJECT, ScriptedProcessor, TestSource};
    use std::time::Duration;

    fn buffered(flush_jobs: usize, buffer: QueueOptions) -> BufferedDispatcher<TestSource> {
        let backend = Arc::new(DistributedQueue::<TestSource>::new(QueueOptions::default()));
        let dispatcher = Dispatcher::new(
            backend,
            DispatchOptions {
                workers: Some(2),
                ..DispatchOptions::default()
            },
        );
        BufferedDispatcher::new(
            dispatcher,
            BufferOptions {
                queue: buffer,
                flush_jobs,
            },
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn buffered_sources_reach_processors() {
        let frontend = buffered(2, BufferOptions::default().queue);
        let processor = ScriptedProcessor::new(SUBJECT, Behavior::Succeed);
        let calls = processor.calls();
        frontend.register_processor(processor);

        let sources =
            (0..50).map(|n| TestSource::subject(n, DistributionId::new(i64::from(n % 3))));
        assert_eq!(frontend.enqueue_range(sources).await.unwrap(), 50);
        frontend.complete_enqueue();

        let stats = tokio::time::timeout(Duration::from_secs(5), frontend.dispatch())
            .await
            .expect("dispatch should finish")
            .unwrap();

        assert_eq!(stats.succeeded, 50);
        assert_eq!(calls.load(Ordering::SeqCst), 50);
        assert!(frontend.dispatcher().backend().is_empty());
    }

    #[tokio::test]
    async fn flush_moves_everything_then_completes_backend() {
        let frontend = buffered(1, BufferOptions::default().queue);
        for n in 0..5 {
            frontend
                .enqueue(TestSource::subject(n, DistributionId::new(1)))
                .await
                .unwrap();
        }
        frontend.complete_enqueue();

        tokio::time::timeout(Duration::from_secs(2), frontend.flush_complete())
            .await
            .expect("flush workers should exit");

        let backend = frontend.dispatcher().backend();
        assert_eq!(backend.count(), 5);
        assert!(frontend.buffer().is_empty());
        assert_eq!(
            backend
                .enqueue(TestSource::subject(9, DistributionId::new(1)))
                .await
                .unwrap(),
            EnqueueStatus::Completed
        );

        // single flusher keeps distribution order
        for expected in 0..5 {
            let source = backend
                .dequeue_from(DistributionId::new(1))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(source.subject_id, expected);
        }
    }

    #[tokio::test]
    async fn complete_without_input_completes_backend() {
        let frontend = buffered(1, BufferOptions::default().queue);
        frontend.complete_enqueue();

        assert!(frontend.dispatcher().backend().is_empty());
        let stats = tokio::time::timeout(Duration::from_secs(2), frontend.dispatch())
            .await
            .expect("dispatch should finish")
            .unwrap();
        assert_eq!(stats, DispatchStats::default());
    }

    #[tokio::test]
    async fn flush_workers_never_exceed_flush_jobs() {
        let frontend = buffered(2, BufferOptions::default().queue);
        for n in 0..10 {
            frontend
                .enqueue(TestSource::subject(n, DistributionId::new(i64::from(n))))
                .await
                .unwrap();
            assert!(frontend.active_flush_workers() <= 2);
        }
        assert!(frontend.active_flush_workers() >= 1);

        frontend.complete_enqueue();
        frontend.flush_complete().await;
        assert_eq!(frontend.active_flush_workers(), 0);
    }

    #[tokio::test]
    async fn full_buffer_times_out_when_nothing_drains_it() {
        let frontend = buffered(
            1,
            QueueOptions {
                nodes: 1,
                node_capacity: Some(2),
                timeout_ms: 50,
            },
        );
        // cancelled: flush workers exit without draining
        frontend.cancel_token().cancel();

        for n in 0..2 {
            let status = frontend
                .enqueue(TestSource::subject(n, DistributionId::new(1)))
                .await
                .unwrap();
            assert_eq!(status, EnqueueStatus::Accepted);
        }
        let status = frontend
            .enqueue(TestSource::subject(2, DistributionId::new(1)))
            .await
            .unwrap();
        assert_eq!(status, EnqueueStatus::TimedOut);
        assert_eq!(frontend.buffer().count(), 2);
    }

    #[tokio::test]
    async fn dispose_tears_down_buffer_and_backend_once() {
        let backend = Arc::new(MemoryQueue::<TestSource>::new());
        let dispatcher = Dispatcher::new(backend.clone(), DispatchOptions::default());
        let frontend = BufferedDispatcher::new(dispatcher, BufferOptions::default());

        frontend.dispose();
        frontend.dispose();

        assert!(frontend.buffer().is_disposed());
        assert!(frontend.dispatcher().is_disposed());
        assert_eq!(
            backend.enqueue(TestSource::orphan(1)).await.unwrap_err(),
            QueueError::Disposed
        );
        assert_eq!(
            frontend.enqueue(TestSource::orphan(2)).await.unwrap_err(),
            QueueError::Disposed
        );
    }
}
