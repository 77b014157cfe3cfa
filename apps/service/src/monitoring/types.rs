use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;
use tokio::time::{Duration, Instant};

/// Outcome of one check in one cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    /// Registry name of the check
    pub name: String,

    pub passed: bool,

    /// Diagnostic message; empty on a clean pass
    pub message: String,
}

impl CheckOutcome {
    pub fn pass(name: impl Into<String>) -> Self {
        Self { name: name.into(), passed: true, message: String::new() }
    }

    pub fn fail(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self { name: name.into(), passed: false, message: message.into() }
    }
}

impl std::fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.passed {
            write!(f, "✓ {} passed", self.name)
        } else {
            write!(f, "✗ {} failed - {}", self.name, self.message)
        }
    }
}

/// Result of one complete cycle, published as a unit.
///
/// `cycle` is 0 only for the empty snapshot that exists before the first cycle
/// completes.
#[derive(Debug, Clone, Default)]
pub struct CycleSnapshot {
    pub cycle: u64,
    pub results: BTreeMap<String, bool>,
    pub last_check_time: Option<Instant>,
    pub completed_at: Option<SystemTime>,
}

impl CycleSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_outcomes(cycle: u64, outcomes: &[CheckOutcome], at: Instant) -> Self {
        Self {
            cycle,
            results: outcomes.iter().map(|o| (o.name.clone(), o.passed)).collect(),
            last_check_time: Some(at),
            completed_at: Some(SystemTime::now()),
        }
    }

    /// Time since this snapshot was published, `None` before the first cycle
    pub fn age(&self, now: Instant) -> Option<Duration> {
        self.last_check_time.map(|t| now.saturating_duration_since(t))
    }

    pub fn all_passed(&self) -> bool {
        self.results.values().all(|passed| *passed)
    }

    #[cfg(test)]
    pub fn get(&self, name: &str) -> Option<bool> {
        self.results.get(name).copied()
    }
}
