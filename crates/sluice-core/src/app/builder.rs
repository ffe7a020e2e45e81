//! DispatcherBuilder - dispatcher の構築とワイヤリング
//!
//! # Fail-fast 設計
//! - expect_types() で期待される source_type を登録
//! - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
//! - 不足があれば BuildError を返す
//!
//! Everything unroutable at runtime becomes a dead letter, so a missing
//! processor is cheaper to catch here than in the dead-letter channel.

use std::sync::Arc;

use tracing::{debug, instrument};

use super::buffered::BufferedDispatcher;
use super::cancel::CancelToken;
use super::dispatcher::Dispatcher;
use super::registry::ProcessorRegistry;
use crate::config::{BufferOptions, ConfigError, DispatchOptions, QueueOptions, Settings};
use crate::domain::{Source, SourceType};
use crate::impls::DistributedQueue;
use crate::ports::{Processor, SourceQueue};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing source types: {0:?}. These types were expected but have no processor.")]
    MissingSourceTypes(Vec<SourceType>),

    #[error("No backend queue was configured.")]
    MissingBackend,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// DispatcherBuilder
///
/// # 使用例
/// ```ignore
/// let dispatcher = DispatcherBuilder::new()
///     .distributed(QueueOptions::bounded(4, 256))
///     .register(InvoiceProcessor)
///     .expect_types(&[INVOICE])
///     .build()?;
/// ```
pub struct DispatcherBuilder<S> {
    backend: Option<Arc<dyn SourceQueue<S>>>,
    /// Set by `distributed`; the queue is created in `build` after validation.
    queue_options: Option<QueueOptions>,
    options: DispatchOptions,
    cancel: Option<CancelToken>,
    registry: ProcessorRegistry<S>,
    expected_types: Option<Vec<SourceType>>,
}

impl<S: Source> DispatcherBuilder<S> {
    pub fn new() -> Self {
        Self {
            backend: None,
            queue_options: None,
            options: DispatchOptions::default(),
            cancel: None,
            registry: ProcessorRegistry::new(),
            expected_types: None,
        }
    }

    /// Backend and dispatch options from a settings file.
    ///
    /// `settings.buffer` is not applied; pass it to `build_buffered`.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new()
            .distributed(settings.backend.clone())
            .options(settings.dispatch.clone())
    }

    /// Any backend implementation.
    pub fn backend(mut self, backend: Arc<dyn SourceQueue<S>>) -> Self {
        self.backend = Some(backend);
        self.queue_options = None;
        self
    }

    /// A fresh `DistributedQueue` as backend, created by `build` once the
    /// options pass validation.
    pub fn distributed(mut self, options: QueueOptions) -> Self {
        self.queue_options = Some(options);
        self.backend = None;
        self
    }

    pub fn options(mut self, options: DispatchOptions) -> Self {
        self.options = options;
        self
    }

    /// Share an existing cancellation signal instead of creating one.
    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Processor を登録（同じ source_type は後勝ち）
    pub fn register<P>(self, processor: P) -> Self
    where
        P: Processor<S> + 'static,
    {
        self.registry.register(Arc::new(processor));
        self
    }

    pub fn expect_types(mut self, source_types: &[SourceType]) -> Self {
        self.expected_types = Some(source_types.to_vec());
        self
    }

    #[instrument(name = "build_dispatcher", skip(self))]
    pub fn build(self) -> Result<Dispatcher<S>, BuildError> {
        self.options.validate()?;

        if let Some(expected) = &self.expected_types {
            let registered = self.registry.registered_types();
            let missing: Vec<SourceType> = expected
                .iter()
                .filter(|t| !registered.contains(t))
                .copied()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingSourceTypes(missing));
            }
        }

        let backend: Arc<dyn SourceQueue<S>> = match self.queue_options {
            Some(queue_options) => {
                queue_options.validate()?;
                Arc::new(DistributedQueue::new(queue_options))
            }
            None => self.backend.ok_or(BuildError::MissingBackend)?,
        };
        debug!(
            processors = self.registry.registered_types().len(),
            workers = self.options.worker_count(),
            "dispatcher built"
        );
        Ok(Dispatcher::from_parts(
            backend,
            self.registry,
            self.options,
            self.cancel.unwrap_or_default(),
        ))
    }

    pub fn build_buffered(
        self,
        buffer: BufferOptions,
    ) -> Result<BufferedDispatcher<S>, BuildError> {
        buffer.validate()?;
        Ok(BufferedDispatcher::new(self.build()?, buffer))
    }
}

impl<S: Source> Default for DispatcherBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}
