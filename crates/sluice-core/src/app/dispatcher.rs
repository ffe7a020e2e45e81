//! Dispatcher - backend を消費して processor に振り分ける
//!
//! # 処理の流れ（1 source あたり）
//! 1. キャンセル済みなら何もしない
//! 2. source_type で processor を検索。なければ dead-letter
//! 3. processor を実行。`Err` と panic は Error result に変換
//! 4. Success: requeue があれば通知してから backend に戻し、その後 success として配送
//! 5. Error: unsuccessful として配送
//!
//! `dispatch()` は worker を並列に起動し、cancel されるか backend が
//! empty-and-complete になるまで回し続ける。

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{Instrument, debug, debug_span, info, instrument, warn};

use super::cancel::CancelToken;
use super::handlers::{Accumulator, HandlerList};
use super::registry::ProcessorRegistry;
use crate::config::DispatchOptions;
use crate::domain::{DistributionId, ProcessError, ProcessResult, QueueError, Source};
use crate::ports::{EnqueueStatus, Processor, SourceQueue};

/// Where a single source ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Cancelled before processing; the source was dropped.
    Skipped,
    DeadLettered,
    Succeeded { requeued: usize },
    Failed,
}

/// Totals for one `dispatch()` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Sources taken from the backend.
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    /// Sources put back into the backend.
    pub requeued: usize,
}

impl DispatchStats {
    fn record(&mut self, disposition: Disposition) {
        self.dispatched += 1;
        match disposition {
            Disposition::Skipped => {}
            Disposition::DeadLettered => self.dead_lettered += 1,
            Disposition::Succeeded { requeued } => {
                self.succeeded += 1;
                self.requeued += requeued;
            }
            Disposition::Failed => self.failed += 1,
        }
    }

    fn merge(&mut self, other: DispatchStats) {
        self.dispatched += other.dispatched;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.dead_lettered += other.dead_lettered;
        self.requeued += other.requeued;
    }
}

struct Inner<S> {
    backend: Arc<dyn SourceQueue<S>>,
    registry: ProcessorRegistry<S>,
    options: DispatchOptions,
    cancel: CancelToken,

    success_handlers: HandlerList<ProcessResult<S>>,
    unsuccessful_handlers: HandlerList<ProcessResult<S>>,
    dead_letter_handlers: HandlerList<S>,
    requeue_handlers: HandlerList<ProcessResult<S>>,

    successes: Accumulator<ProcessResult<S>>,
    unsuccessful: Accumulator<ProcessResult<S>>,
    dead_letters: Accumulator<S>,

    /// Sources currently held by a dispatch worker.
    in_flight: AtomicUsize,
    /// Signalled whenever a worker finishes a source.
    settled: Notify,
    disposed: Mutex<bool>,
}

/// Dispatch Frontend
///
/// # 使用例
/// ```ignore
/// let backend = Arc::new(DistributedQueue::new(QueueOptions::default()));
/// let dispatcher = Dispatcher::new(backend, DispatchOptions::default());
/// dispatcher.register_processor(InvoiceProcessor);
/// dispatcher.enqueue_range(sources).await?;
/// dispatcher.complete_enqueue();
/// let stats = dispatcher.dispatch().await?;
/// ```
///
/// Clones share everything: backend, registry, handlers, accumulators and the
/// cancel token.
pub struct Dispatcher<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Source> Dispatcher<S> {
    pub fn new(backend: Arc<dyn SourceQueue<S>>, options: DispatchOptions) -> Self {
        Self::with_cancel_token(backend, options, CancelToken::new())
    }

    pub fn with_cancel_token(
        backend: Arc<dyn SourceQueue<S>>,
        options: DispatchOptions,
        cancel: CancelToken,
    ) -> Self {
        Self::from_parts(backend, ProcessorRegistry::new(), options, cancel)
    }

    pub(crate) fn from_parts(
        backend: Arc<dyn SourceQueue<S>>,
        registry: ProcessorRegistry<S>,
        options: DispatchOptions,
        cancel: CancelToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                registry,
                options,
                cancel,
                success_handlers: HandlerList::new(),
                unsuccessful_handlers: HandlerList::new(),
                dead_letter_handlers: HandlerList::new(),
                requeue_handlers: HandlerList::new(),
                successes: Accumulator::new(),
                unsuccessful: Accumulator::new(),
                dead_letters: Accumulator::new(),
                in_flight: AtomicUsize::new(0),
                settled: Notify::new(),
                disposed: Mutex::new(false),
            }),
        }
    }

    // ------------------------------------------------------------------
    // producer side (backend に素通し)
    // ------------------------------------------------------------------

    pub async fn enqueue(&self, source: S) -> Result<EnqueueStatus, QueueError> {
        self.inner.backend.enqueue(source).await
    }

    /// Enqueue in order, stopping early on cancellation. Returns how many were accepted.
    pub async fn enqueue_range(
        &self,
        sources: impl IntoIterator<Item = S>,
    ) -> Result<usize, QueueError> {
        let mut accepted = 0;
        for source in sources {
            if self.inner.cancel.is_cancelled() {
                debug!(accepted, "enqueue_range stopped by cancellation");
                break;
            }
            if self.inner.backend.enqueue(source).await?.is_accepted() {
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    pub fn complete_enqueue(&self) {
        self.inner.backend.complete_enqueue();
    }

    pub fn complete_distribution(&self, distribution: DistributionId) -> Result<(), QueueError> {
        self.inner.backend.complete_distribution(distribution)
    }

    // ------------------------------------------------------------------
    // wiring
    // ------------------------------------------------------------------

    /// Returns `true` if a processor for the same source type was replaced.
    pub fn register_processor<P>(&self, processor: P) -> bool
    where
        P: Processor<S> + 'static,
    {
        self.inner.registry.register(Arc::new(processor))
    }

    pub fn registry(&self) -> &ProcessorRegistry<S> {
        &self.inner.registry
    }

    pub fn backend(&self) -> &Arc<dyn SourceQueue<S>> {
        &self.inner.backend
    }

    pub fn options(&self) -> &DispatchOptions {
        &self.inner.options
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.inner.cancel.clone()
    }

    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    pub fn success_handlers(&self) -> &HandlerList<ProcessResult<S>> {
        &self.inner.success_handlers
    }

    /// Handlers for Error results. While none is registered, Error results are accumulated.
    pub fn unsuccessful_handlers(&self) -> &HandlerList<ProcessResult<S>> {
        &self.inner.unsuccessful_handlers
    }

    pub fn dead_letter_handlers(&self) -> &HandlerList<S> {
        &self.inner.dead_letter_handlers
    }

    /// Fired once per Success result that carries requeue work, before the re-enqueue.
    pub fn requeue_handlers(&self) -> &HandlerList<ProcessResult<S>> {
        &self.inner.requeue_handlers
    }

    pub fn successes(&self) -> &Accumulator<ProcessResult<S>> {
        &self.inner.successes
    }

    pub fn unsuccessful(&self) -> &Accumulator<ProcessResult<S>> {
        &self.inner.unsuccessful
    }

    pub fn dead_letters(&self) -> &Accumulator<S> {
        &self.inner.dead_letters
    }

    // ------------------------------------------------------------------
    // consumer side
    // ------------------------------------------------------------------

    /// Drain the backend with a pool of workers.
    ///
    /// Returns once cancelled or once the backend is empty-and-complete with no
    /// source left in flight. Processor failures never surface here; only queue
    /// misuse (for example a backend disposed mid-run) does.
    #[instrument(
        name = "dispatch",
        skip(self),
        fields(workers = self.inner.options.worker_count())
    )]
    pub async fn dispatch(&self) -> Result<DispatchStats, QueueError> {
        self.ensure_live()?;

        let workers = self.inner.options.worker_count();
        let mut joins = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let this = self.clone();
            let span = debug_span!("dispatch_worker", worker_id);
            joins.push(tokio::spawn(async move { this.run_worker().await }.instrument(span)));
        }

        let mut stats = DispatchStats::default();
        let mut failure = None;
        for join in joins {
            match join.await {
                Ok((worker_stats, error)) => {
                    stats.merge(worker_stats);
                    if let Some(error) = error {
                        failure.get_or_insert(error);
                    }
                }
                Err(error) => warn!(%error, "dispatch worker aborted"),
            }
        }

        info!(
            dispatched = stats.dispatched,
            succeeded = stats.succeeded,
            failed = stats.failed,
            dead_lettered = stats.dead_lettered,
            requeued = stats.requeued,
            cancelled = self.inner.cancel.is_cancelled(),
            "dispatch finished"
        );

        match failure {
            Some(error) => Err(error),
            None => Ok(stats),
        }
    }

    async fn run_worker(&self) -> (DispatchStats, Option<QueueError>) {
        let inner = &self.inner;
        let mut stats = DispatchStats::default();
        debug!("worker started");

        let error = loop {
            if inner.cancel.is_cancelled() {
                break None;
            }

            let settled = inner.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();

            let next = tokio::select! {
                biased;
                _ = inner.cancel.cancelled() => break None,
                next = inner.backend.dequeue() => next,
            };

            match next {
                Ok(Some(source)) => {
                    inner.in_flight.fetch_add(1, Ordering::SeqCst);
                    let routed = self.dispatch_one(source).await;
                    inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                    inner.settled.notify_waiters();

                    match routed {
                        Ok(disposition) => stats.record(disposition),
                        Err(error) => break Some(error),
                    }
                }
                Ok(None) => {
                    if !inner.backend.is_empty() {
                        // Open queue with nothing ready. Back off before polling again.
                        tokio::select! {
                            biased;
                            _ = inner.cancel.cancelled() => break None,
                            _ = tokio::time::sleep(inner.options.idle_poll()) => {}
                        }
                        continue;
                    }
                    if inner.in_flight.load(Ordering::SeqCst) == 0 {
                        break None;
                    }
                    // Another worker may still requeue; wait for it to settle.
                    let _ = tokio::time::timeout(inner.options.idle_poll(), settled).await;
                }
                Err(error) => break Some(error),
            }
        };

        debug!(dispatched = stats.dispatched, "worker stopped");
        (stats, error)
    }

    /// Route a single source through its processor.
    ///
    /// Success results are handed to handlers after requeue work has been taken
    /// out of them, so `requeue_items()` is empty by then. When the current source
    /// was requeued it is not attached to the success result.
    pub async fn dispatch_one(&self, source: S) -> Result<Disposition, QueueError> {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return Ok(Disposition::Skipped);
        }

        let source_type = source.source_type();
        let Some(processor) = inner.registry.get(source_type) else {
            self.route_dead_letter(source);
            return Ok(Disposition::DeadLettered);
        };

        let mut source = source;
        let outcome = AssertUnwindSafe(processor.process(&mut source))
            .catch_unwind()
            .await;
        let mut result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(error)) => ProcessResult::error(error),
            Err(panic) => ProcessResult::error(ProcessError::from_panic(panic)),
        };
        result.stamp();

        if !result.is_success() {
            if let Some(error) = result.error_detail() {
                debug!(%source_type, %error, "processor reported failure");
            }
            if !result.has_source() {
                result.attach_source(source);
            }
            self.route_unsuccessful(result);
            return Ok(Disposition::Failed);
        }

        let mut current = Some(source);
        let mut requeued = 0;
        let mut failure = None;
        if result.is_requeueable() {
            inner.requeue_handlers.notify(&result);

            let mut items = Vec::new();
            if result.wants_current_requeued() {
                items.extend(current.take());
            }
            items.extend(result.take_requeue());

            for item in items {
                match inner.backend.requeue(item).await {
                    Ok(EnqueueStatus::Accepted) => requeued += 1,
                    Ok(status) => warn!(%source_type, ?status, "requeue dropped"),
                    Err(error) => {
                        warn!(%source_type, %error, "requeue failed");
                        failure.get_or_insert(error);
                    }
                }
            }
        }

        if let Some(source) = current
            && !result.has_source()
        {
            result.attach_source(source);
        }
        self.route_success(result);

        match failure {
            Some(error) => Err(error),
            None => Ok(Disposition::Succeeded { requeued }),
        }
    }

    fn route_dead_letter(&self, source: S) {
        debug!(
            source_type = %source.source_type(),
            distribution = %source.distribution_id(),
            "no processor registered, dead letter"
        );
        if self.inner.options.accumulate_dead_letters {
            self.inner.dead_letters.push(source);
        } else {
            self.inner.dead_letter_handlers.notify(&source);
        }
    }

    fn route_success(&self, result: ProcessResult<S>) {
        if self.inner.options.accumulate_successes {
            self.inner.successes.push(result);
        } else {
            self.inner.success_handlers.notify(&result);
        }
    }

    fn route_unsuccessful(&self, result: ProcessResult<S>) {
        if self.inner.unsuccessful_handlers.is_empty() {
            self.inner.unsuccessful.push(result);
        } else {
            self.inner.unsuccessful_handlers.notify(&result);
        }
    }

    // ------------------------------------------------------------------
    // teardown
    // ------------------------------------------------------------------

    fn ensure_live(&self) -> Result<(), QueueError> {
        if self.is_disposed() {
            return Err(QueueError::Disposed);
        }
        Ok(())
    }

    pub fn is_disposed(&self) -> bool {
        *self
            .inner
            .disposed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Dispose the backend. Only the first call does anything.
    pub fn dispose(&self) {
        let mut disposed = self
            .inner
            .disposed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *disposed {
            return;
        }
        self.inner.backend.dispose();
        *disposed = true;
        debug!("dispatcher disposed");
    }
}
