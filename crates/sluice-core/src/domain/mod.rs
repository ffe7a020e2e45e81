//! Domain model (sources, results, errors).

pub mod errors;
pub mod result;
pub mod source;

pub use self::errors::{ProcessError, QueueError};
pub use self::result::{ProcessResult, ResultState};
pub use self::source::{DistributionId, Source, SourceType};
