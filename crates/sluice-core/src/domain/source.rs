//! Source - キューを流れる作業単位
//!
//! A source carries two routing keys:
//! - `DistributionId`: which FIFO partition it belongs to
//! - `SourceType`: which processor handles it
//!
//! Both are reported by the source itself, so routing never needs reflection.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Partition key for FIFO ordering.
///
/// Sources with the same id are dequeued in the order they were enqueued.
/// `DistributionId::DEFAULT` (-1) is the ungrouped bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DistributionId(i64);

impl DistributionId {
    pub const DEFAULT: DistributionId = DistributionId(-1);

    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> i64 {
        self.0
    }

    pub fn is_default(self) -> bool {
        self == Self::DEFAULT
    }
}

impl Default for DistributionId {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl From<i64> for DistributionId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for DistributionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Discriminator used for processor lookup.
///
/// # 命名規約
/// - `{namespace}.{kind}.v{major}`
/// - 例: `billing.invoice.v1`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SourceType(&'static str);

impl SourceType {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub const fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Source は queue に投入される作業単位
///
/// # 使用例
/// ```ignore
/// enum Work {
///     Invoice { id: u64, customer: i64 },
///     Refund { id: u64 },
/// }
///
/// impl Source for Work {
///     fn source_type(&self) -> SourceType {
///         match self {
///             Work::Invoice { .. } => SourceType::new("billing.invoice.v1"),
///             Work::Refund { .. } => SourceType::new("billing.refund.v1"),
///         }
///     }
///
///     fn distribution_id(&self) -> DistributionId {
///         match self {
///             Work::Invoice { customer, .. } => DistributionId::new(*customer),
///             Work::Refund { .. } => DistributionId::DEFAULT,
///         }
///     }
/// }
/// ```
///
/// # Trait Bounds
/// - `Send`: worker task 間で所有権を移動するため
/// - `'static`: spawn された task に持ち込むため
pub trait Source: Send + 'static {
    fn source_type(&self) -> SourceType;

    fn distribution_id(&self) -> DistributionId {
        DistributionId::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_distribution_is_minus_one() {
        assert_eq!(DistributionId::default().value(), -1);
        assert!(DistributionId::DEFAULT.is_default());
        assert!(!DistributionId::new(0).is_default());
    }

    #[test]
    fn distribution_id_serializes_as_plain_integer() {
        let s = serde_json::to_string(&DistributionId::new(9)).unwrap();
        assert_eq!(s, "9");
        let back: DistributionId = serde_json::from_str("9").unwrap();
        assert_eq!(back, DistributionId::new(9));
    }

    #[test]
    fn source_type_displays_its_name() {
        let t = SourceType::new("billing.invoice.v1");
        assert_eq!(t.to_string(), "billing.invoice.v1");
        assert_eq!(t.as_str(), "billing.invoice.v1");
    }
}
