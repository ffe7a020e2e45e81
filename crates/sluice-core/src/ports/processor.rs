//! Processor port - source_type ごとの処理

use async_trait::async_trait;

use crate::domain::{ProcessError, ProcessResult, Source, SourceType};

/// Processor は 1 つの source_type を担当する
///
/// # 使用例
/// ```ignore
/// struct InvoiceProcessor;
///
/// #[async_trait]
/// impl Processor<Work> for InvoiceProcessor {
///     fn source_type(&self) -> SourceType {
///         SourceType::new("billing.invoice.v1")
///     }
///
///     async fn process(&self, work: &mut Work) -> Result<ProcessResult<Work>, ProcessError> {
///         // ...
///         Ok(ProcessResult::success())
///     }
/// }
/// ```
///
/// The dispatcher keeps ownership of the source while `process` runs, so an
/// `Err` (or a panic) still produces an Error result that carries the source.
///
/// One instance is shared by every dispatch worker: implementations must be
/// safe to call concurrently.
#[async_trait]
pub trait Processor<S: Source>: Send + Sync {
    fn source_type(&self) -> SourceType;

    async fn process(&self, source: &mut S) -> Result<ProcessResult<S>, ProcessError>;
}
