//! Ports - 抽象化レイヤー
//!
//! The two capabilities the runtime depends on:
//! - `SourceQueue`: where sources wait (in-process or remote)
//! - `Processor`: what happens to a source of a given type

pub mod processor;
pub mod source_queue;

pub use self::processor::Processor;
pub use self::source_queue::{EnqueueStatus, SourceQueue};
