//! Request cost estimation.
//!
//! Expensive operations consume more than one unit of quota so they exhaust a
//! limit faster than cheap ones under the same nominal request count.

use serde::{Deserialize, Serialize};

use crate::error::{RateWardenError, Result};

/// Cost applied when no weighted prefix matches.
pub const DEFAULT_COST: u64 = 1;

/// A route prefix and the number of quota units each request under it costs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostRule {
    pub prefix: String,
    pub weight: u64,
}

impl CostRule {
    pub fn new(prefix: &str, weight: u64) -> Self {
        Self {
            prefix: prefix.to_string(),
            weight,
        }
    }

    /// Bulk operations, report generation and cross-system integration calls.
    pub fn defaults() -> Vec<CostRule> {
        vec![
            CostRule::new("/api/v1/bulk", 5),
            CostRule::new("/api/v1/reports", 3),
            CostRule::new("/api/v1/integrations", 2),
        ]
    }

    pub fn validate(&self) -> Result<()> {
        if !self.prefix.starts_with('/') {
            return Err(RateWardenError::Config(format!(
                "cost prefix '{}' must start with '/'",
                self.prefix
            )));
        }
        if self.weight == 0 {
            return Err(RateWardenError::Config(format!(
                "cost weight for '{}' must be at least 1",
                self.prefix
            )));
        }
        Ok(())
    }

    fn matches(&self, path: &str) -> bool {
        let prefix = self.prefix.trim_end_matches('/');
        path.strip_prefix(prefix)
            .map(|rest| rest.is_empty() || rest.starts_with('/'))
            .unwrap_or(false)
    }
}

/// Maps a request path to its quota cost.
#[derive(Debug, Clone)]
pub struct CostEstimator {
    /// Sorted longest prefix first
    rules: Vec<CostRule>,
}

impl CostEstimator {
    pub fn new(rules: &[CostRule]) -> Self {
        let mut rules = rules.to_vec();
        rules.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { rules }
    }

    /// Cost of a request to `path`; always at least 1.
    pub fn cost(&self, path: &str) -> u64 {
        self.rules
            .iter()
            .find(|rule| rule.matches(path))
            .map(|rule| rule.weight)
            .unwrap_or(DEFAULT_COST)
            .max(1)
    }
}

impl Default for CostEstimator {
    fn default() -> Self {
        Self::new(&CostRule::defaults())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cost_is_one() {
        let estimator = CostEstimator::default();
        assert_eq!(estimator.cost("/api/v1/employees"), 1);
        assert_eq!(estimator.cost("/"), 1);
    }

    #[test]
    fn test_weighted_prefixes() {
        let estimator = CostEstimator::default();
        assert_eq!(estimator.cost("/api/v1/bulk/import"), 5);
        assert_eq!(estimator.cost("/api/v1/reports/payroll"), 3);
        assert_eq!(estimator.cost("/api/v1/integrations/1c/sync"), 2);
        assert_eq!(estimator.cost("/api/v1/bulk"), 5);
    }

    #[test]
    fn test_prefix_stops_at_segment_boundary() {
        let estimator = CostEstimator::default();
        assert_eq!(estimator.cost("/api/v1/bulkhead"), 1);
    }

    #[test]
    fn test_longest_prefix_wins() {
        let estimator = CostEstimator::new(&[
            CostRule::new("/api/v1/reports", 3),
            CostRule::new("/api/v1/reports/annual", 10),
        ]);
        assert_eq!(estimator.cost("/api/v1/reports/annual/2024"), 10);
        assert_eq!(estimator.cost("/api/v1/reports/monthly"), 3);
    }

    #[test]
    fn test_zero_weight_rejected() {
        assert!(CostRule::new("/x", 0).validate().is_err());
        assert!(CostRule::new("x", 2).validate().is_err());
        assert!(CostRule::new("/x", 2).validate().is_ok());
    }
}
