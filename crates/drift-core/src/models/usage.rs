//! Remote storage usage model

use serde::{Deserialize, Serialize};

/// Aggregate usage derived server-side. Display-only; refreshed periodically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncUsage {
    /// Number of non-deleted documents
    pub document_count: i64,
    /// Total stored bytes
    pub total_size_bytes: i64,
    /// Quota in bytes
    pub limit_bytes: i64,
    /// Plan tier name
    pub tier: String,
}

impl SyncUsage {
    /// Fraction of the quota in use, clamped to [0, 1]
    #[must_use]
    pub fn used_fraction(&self) -> f64 {
        if self.limit_bytes <= 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let fraction = self.total_size_bytes as f64 / self.limit_bytes as f64;
        fraction.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn used_fraction_clamps() {
        let usage = SyncUsage {
            document_count: 3,
            total_size_bytes: 150,
            limit_bytes: 100,
            tier: "free".to_string(),
        };
        assert!((usage.used_fraction() - 1.0).abs() < f64::EPSILON);

        let empty_limit = SyncUsage {
            limit_bytes: 0,
            ..usage
        };
        assert!(empty_limit.used_fraction().abs() < f64::EPSILON);
    }
}
