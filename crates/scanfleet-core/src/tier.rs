//! Size tiers and scan-size classification.
//!
//! Tiers are declared in ascending order and cover contiguous, inclusive
//! ranges of the size metric (lines of code, file count, or whatever unit
//! the job queue reports). The highest tier's `max_metric` is the largest
//! scan the fleet accepts; anything above classifies to no tier.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// A named capacity class covering `min_metric..=max_metric`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SizeTier {
    pub name: String,
    pub min_metric: u64,
    pub max_metric: u64,
}

impl SizeTier {
    pub fn new(name: impl Into<String>, min_metric: u64, max_metric: u64) -> Self {
        Self {
            name: name.into(),
            min_metric,
            max_metric,
        }
    }

    /// Whether `metric` falls inside this tier's range (both ends inclusive).
    pub fn contains(&self, metric: u64) -> bool {
        metric >= self.min_metric && metric <= self.max_metric
    }
}

/// Maps a scan's size metric onto one of an ordered set of tiers.
#[derive(Debug, Clone, Default)]
pub struct SizeClassifier {
    tiers: Vec<SizeTier>,
}

impl SizeClassifier {
    /// Build a classifier from tiers in declaration order.
    ///
    /// Rejects duplicate names, inverted ranges, and neighbouring ranges
    /// that overlap or leave a gap.
    pub fn new(tiers: Vec<SizeTier>) -> ConfigResult<Self> {
        if tiers.is_empty() {
            return Err(ConfigError::EmptyPool);
        }

        let mut seen = HashSet::new();
        for tier in &tiers {
            if !seen.insert(tier.name.as_str()) {
                return Err(ConfigError::DuplicateTier(tier.name.clone()));
            }
            if tier.min_metric > tier.max_metric {
                return Err(ConfigError::InvertedRange {
                    tier: tier.name.clone(),
                    min: tier.min_metric,
                    max: tier.max_metric,
                });
            }
        }

        for pair in tiers.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if next.min_metric <= prev.max_metric {
                return Err(ConfigError::OverlappingTiers {
                    tier: next.name.clone(),
                    previous: prev.name.clone(),
                });
            }
            if next.min_metric != prev.max_metric + 1 {
                return Err(ConfigError::TierGap {
                    tier: next.name.clone(),
                    min: next.min_metric,
                    previous: prev.name.clone(),
                    previous_max: prev.max_metric,
                });
            }
        }

        Ok(Self { tiers })
    }

    /// Classify a size metric. `None` means no tier can take the scan.
    pub fn classify(&self, metric: u64) -> Option<&SizeTier> {
        // Ranges ascend, so the first tier whose max reaches the metric is
        // the only candidate.
        let idx = self.tiers.partition_point(|t| t.max_metric < metric);
        self.tiers.get(idx).filter(|t| t.contains(metric))
    }

    /// Look up a tier by name.
    pub fn get(&self, name: &str) -> Option<&SizeTier> {
        self.tiers.iter().find(|t| t.name == name)
    }

    /// All tiers in ascending order.
    pub fn tiers(&self) -> &[SizeTier] {
        &self.tiers
    }
}
