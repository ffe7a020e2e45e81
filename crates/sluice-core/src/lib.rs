//! sluice-core
//!
//! Batching and queueing runtime: producers enqueue sources, dispatch workers
//! route them to processors by source type.
//!
//! # モジュール構成
//! - **domain**: データモデル（Source, DistributionId, ProcessResult, errors）
//! - **ports**: 抽象化レイヤー（SourceQueue, Processor）
//! - **impls**: backend 実装（DistributedQueue, MemoryQueue）
//! - **app**: runtime（Dispatcher, BufferedDispatcher, DispatcherBuilder, registry, handlers）
//! - **config**: options と JSON settings

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;

#[cfg(test)]
pub(crate) mod testing;

pub use app::{
    Accumulator, BufferedDispatcher, BuildError, CancelToken, DispatchStats, Dispatcher,
    DispatcherBuilder, Disposition, Handler, HandlerList, ProcessorRegistry,
};
pub use config::{BufferOptions, ConfigError, DispatchOptions, QueueOptions, Settings};
pub use domain::{
    DistributionId, ProcessError, ProcessResult, QueueError, ResultState, Source, SourceType,
};
pub use impls::{DistributedQueue, MemoryQueue};
pub use ports::{EnqueueStatus, Processor, SourceQueue};
