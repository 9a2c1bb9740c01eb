//! Scenario driver for nodealloc stress runs.
//!
//! Each scenario drives a private [`Pool`] through a deterministic
//! workload and reports the pool's bookkeeping afterward, so allocator
//! changes can be compared run over run (system calls per operation,
//! growth cadence, free-list occupancy).

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use nodealloc_core::{MAX_BYTES, Pool, PoolStats};

/// Harness failure modes.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// The requested scenario name is not known.
    #[error("unknown scenario `{0}` (expected churn, growth, or mixed)")]
    UnknownScenario(String),
    /// Report serialization failed.
    #[error("failed to encode report: {0}")]
    Encode(#[from] serde_json::Error),
    /// Report output could not be written.
    #[error("failed to write report to {path:?}: {source}")]
    Write {
        /// Destination path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// Deterministic allocation workloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Tight allocate/free cycles across the pooled size classes.
    Churn,
    /// Retained small allocations, forcing sustained arena growth.
    Growth,
    /// Seeded random mix of allocate, free, and resize, crossing the
    /// pooled/raw boundary.
    Mixed,
}

impl Scenario {
    /// Parses a scenario name (case-insensitive).
    pub fn from_str_loose(s: &str) -> Result<Self, HarnessError> {
        match s.to_ascii_lowercase().as_str() {
            "churn" => Ok(Self::Churn),
            "growth" => Ok(Self::Growth),
            "mixed" => Ok(Self::Mixed),
            other => Err(HarnessError::UnknownScenario(other.to_string())),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Churn => "churn",
            Self::Growth => "growth",
            Self::Mixed => "mixed",
        }
    }
}

/// Outcome of a scenario run.
#[derive(Debug, Serialize)]
pub struct ScenarioReport {
    /// Scenario name.
    pub scenario: &'static str,
    /// Operations performed.
    pub operations: u64,
    /// Seed used for the workload.
    pub seed: u64,
    /// Peak number of simultaneously live blocks.
    pub live_peak: usize,
    /// Pool bookkeeping after the run.
    pub stats: PoolStats,
    /// System-call attempts per thousand operations.
    pub system_calls_per_thousand_ops: f64,
}

fn lcg(state: &mut u64) -> u64 {
    *state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
    *state
}

/// Runs `scenario` for `ops` operations with the given `seed`.
#[must_use]
pub fn run(scenario: Scenario, ops: u64, seed: u64) -> ScenarioReport {
    let pool = Pool::new();
    let mut live: Vec<(std::ptr::NonNull<u8>, usize)> = Vec::new();
    let mut live_peak = 0usize;
    let mut rng = seed;

    for step in 0..ops {
        match scenario {
            Scenario::Churn => {
                // Walk the pooled classes; every block is freed immediately.
                let size = ((step as usize % MAX_BYTES) + 1).min(MAX_BYTES);
                if let Ok(ptr) = pool.allocate(size) {
                    // SAFETY: freshly allocated block, freed before reuse.
                    unsafe { pool.deallocate(ptr, size) };
                }
            }
            Scenario::Growth => {
                // Retain everything; drop a tenth occasionally so growth
                // interleaves with list traffic.
                let r = lcg(&mut rng);
                let size = ((r as usize % 64) + 1).min(MAX_BYTES);
                if let Ok(ptr) = pool.allocate(size) {
                    live.push((ptr, size));
                }
                if step % 10 == 9
                    && let Some((ptr, size)) = live.pop()
                {
                    // SAFETY: the block is live exactly once.
                    unsafe { pool.deallocate(ptr, size) };
                }
            }
            Scenario::Mixed => {
                let r = lcg(&mut rng);
                match r % 3 {
                    0 => {
                        let size = ((r >> 8) as usize % (2 * MAX_BYTES)).max(1);
                        if let Ok(ptr) = pool.allocate(size) {
                            live.push((ptr, size));
                        }
                    }
                    1 if !live.is_empty() => {
                        let idx = (r as usize) % live.len();
                        let (ptr, size) = live.swap_remove(idx);
                        // SAFETY: the block is live exactly once.
                        unsafe { pool.deallocate(ptr, size) };
                    }
                    2 if !live.is_empty() => {
                        let idx = (r as usize) % live.len();
                        let (ptr, size) = live[idx];
                        let new_size = (((r >> 16) as usize) % (2 * MAX_BYTES)).max(1);
                        // SAFETY: resize of a live block.
                        if let Ok(moved) = unsafe { pool.reallocate(ptr, size, new_size) } {
                            live[idx] = (moved, new_size);
                        }
                    }
                    _ => {}
                }
            }
        }
        live_peak = live_peak.max(live.len());
    }

    for (ptr, size) in live.drain(..) {
        // SAFETY: remaining blocks are live exactly once.
        unsafe { pool.deallocate(ptr, size) };
    }

    let stats = pool.stats();
    let system_calls_per_thousand_ops = if ops == 0 {
        0.0
    } else {
        stats.system_calls as f64 * 1000.0 / ops as f64
    };
    ScenarioReport {
        scenario: scenario.name(),
        operations: ops,
        seed,
        live_peak,
        stats,
        system_calls_per_thousand_ops,
    }
}
