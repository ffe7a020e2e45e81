//! Errors - エラー型と分類
//!
//! Two families:
//! - `QueueError`: caller misuse (unknown distribution, use after dispose).
//!   These surface at the call site.
//! - `ProcessError`: anything a processor raised. These never escape `dispatch()`;
//!   they are folded into an Error result instead.

use std::any::Any;
use std::error::Error;
use std::sync::Arc;

use thiserror::Error;

use super::source::DistributionId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("distribution {0} was never enqueued into")]
    UnknownDistribution(DistributionId),

    #[error("queue has been disposed")]
    Disposed,
}

/// ProcessError は processor の失敗
///
/// Clone できるようにしておく（accumulator の snapshot 用）。
#[derive(Debug, Clone, Error)]
pub enum ProcessError {
    #[error("processor failed: {0}")]
    Failed(String),

    #[error("processor panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Caused(Arc<dyn Error + Send + Sync>),
}

impl ProcessError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Wrap a causal error so it can be inspected through `source()` later.
    pub fn caused_by<E>(err: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::Caused(Arc::new(err))
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::Panicked(message)
    }
}
