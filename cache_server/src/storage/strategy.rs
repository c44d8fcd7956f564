// Storage strategies
//
// Pure selection logic. The engine hands in a snapshot of each backend's
// weight, usage and quota; the per instance counters live in StrategyState.

use crate::error::{CacheServerError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Multiplier applied to the split counter; coprime with 100 so every
/// window of 100 consecutive writes visits each slot once
const SPLIT_STRIDE: u64 = 37;

/// Write placement policy of a cache instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageStrategy {
    #[default]
    RoundRobin,
    InOrder,
    Split,
    LeastUsed,
}

impl StorageStrategy {
    /// Whether an unavailable backend should be skipped in favour of the next
    pub fn falls_back(&self) -> bool {
        matches!(self, StorageStrategy::InOrder | StorageStrategy::LeastUsed)
    }
}

impl FromStr for StorageStrategy {
    type Err = CacheServerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "round-robin" => Ok(StorageStrategy::RoundRobin),
            "in-order" => Ok(StorageStrategy::InOrder),
            "split" => Ok(StorageStrategy::Split),
            "least-used" => Ok(StorageStrategy::LeastUsed),
            other => Err(CacheServerError::ConfigInvalid(format!(
                "Unknown storage strategy: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for StorageStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageStrategy::RoundRobin => "round-robin",
            StorageStrategy::InOrder => "in-order",
            StorageStrategy::Split => "split",
            StorageStrategy::LeastUsed => "least-used",
        };
        f.write_str(name)
    }
}

/// What a strategy needs to know about one backend
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub usage: u64,
    pub quota: Option<u64>,
    pub weight: u8,
    /// Excluded after a failed write in this request
    pub excluded: bool,
}

impl Candidate {
    fn fits(&self, size: u64) -> bool {
        !self.excluded
            && self
                .quota
                .map(|quota| self.usage.saturating_add(size) <= quota)
                .unwrap_or(true)
    }
}

/// Mutable strategy counters of one cache instance
#[derive(Debug, Default)]
pub struct StrategyState {
    cursor: AtomicU64,
    writes: AtomicU64,
}

impl StrategyState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next round robin cursor value; unique per call
    fn next_cursor(&self) -> u64 {
        self.cursor.fetch_add(1, Ordering::SeqCst)
    }

    fn next_write(&self) -> u64 {
        self.writes.fetch_add(1, Ordering::SeqCst)
    }
}

/// Check that split weights are present and sum to 100
pub fn validate_split_weights(weights: &[Option<u8>]) -> Result<()> {
    if weights.iter().any(|w| w.is_none()) {
        return Err(CacheServerError::ConfigInvalid(
            "Split strategy requires a split value on every storage".to_string(),
        ));
    }

    let total: u32 = weights.iter().flatten().map(|w| *w as u32).sum();
    if total != 100 {
        return Err(CacheServerError::ConfigInvalid(format!(
            "Split weights must sum to 100, got {}",
            total
        )));
    }

    Ok(())
}

/// Pick a backend for a write of `size` bytes
///
/// Returns `None` when no backend is eligible.
pub fn choose(
    strategy: StorageStrategy,
    state: &StrategyState,
    candidates: &[Candidate],
    size: u64,
) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }

    match strategy {
        StorageStrategy::RoundRobin => {
            let cursor = state.next_cursor();
            Some((cursor % candidates.len() as u64) as usize)
        }
        StorageStrategy::InOrder => candidates.iter().position(|c| c.fits(size)),
        StorageStrategy::Split => {
            let slot = (state.next_write().wrapping_mul(SPLIT_STRIDE) % 100) as u32;
            let mut cumulative = 0u32;
            for (index, candidate) in candidates.iter().enumerate() {
                cumulative += candidate.weight as u32;
                if slot < cumulative {
                    return Some(index);
                }
            }
            None
        }
        StorageStrategy::LeastUsed => candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.fits(size))
            // min_by_key keeps the first of equal elements
            .min_by_key(|(_, c)| c.usage)
            .map(|(index, _)| index),
    }
}
