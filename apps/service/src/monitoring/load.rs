use std::sync::Mutex;
use std::time::Duration;

use sysinfo::System;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::LoadError;

/// Source of a current system load reading in `[0, 1]`
pub trait LoadSource: Send + Sync {
    fn measure(&self) -> Result<f64, LoadError>;
}

/// Global CPU usage via sysinfo
pub struct SysinfoLoad {
    system: Mutex<System>,
}

impl SysinfoLoad {
    pub fn new() -> Self {
        let mut system = System::new();
        // the first reading has no baseline and always reports 0
        system.refresh_cpu_usage();
        Self { system: Mutex::new(system) }
    }
}

impl Default for SysinfoLoad {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadSource for SysinfoLoad {
    fn measure(&self) -> Result<f64, LoadError> {
        let mut system = self.system.lock().map_err(|e| LoadError(e.to_string()))?;
        system.refresh_cpu_usage();
        Ok(f64::from(system.global_cpu_usage()) / 100.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct Reading {
    load: f64,
    sampled_at: Option<Instant>,
}

/// Rate-limited, cached view of a [`LoadSource`].
///
/// A reading is reused for `freshness` after the last real measurement. A
/// failed measurement keeps the previous value and still restarts the window,
/// so a broken source is not hammered every tick.
pub struct LoadSampler {
    source: Box<dyn LoadSource>,
    freshness: Duration,
    reading: Mutex<Reading>,
}

impl LoadSampler {
    pub fn new(source: Box<dyn LoadSource>, freshness: Duration) -> Self {
        Self { source, freshness, reading: Mutex::new(Reading { load: 0.0, sampled_at: None }) }
    }

    pub fn sample(&self) -> f64 {
        let now = Instant::now();
        let mut reading = match self.reading.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(at) = reading.sampled_at {
            if now.saturating_duration_since(at) < self.freshness {
                return reading.load;
            }
        }

        match self.source.measure() {
            Ok(load) if load.is_finite() => {
                reading.load = load.clamp(0.0, 1.0);
                debug!(load = reading.load, "sampled system load");
            }
            Ok(load) => warn!(load, "ignoring non-finite load reading"),
            Err(e) => warn!("keeping last load {:.2}: {}", reading.load, e),
        }
        reading.sampled_at = Some(now);
        reading.load
    }

    /// Last value handed out and how long ago it was measured
    pub fn last(&self) -> (f64, Option<Duration>) {
        let reading = match self.reading.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        };
        (reading.load, reading.sampled_at.map(|at| Instant::now().saturating_duration_since(at)))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    /// Load source whose value can be changed from the test
    #[derive(Clone, Default)]
    pub(crate) struct SharedLoad {
        bits: Arc<AtomicU64>,
        pub(crate) calls: Arc<AtomicUsize>,
        failing: Arc<std::sync::atomic::AtomicBool>,
    }

    impl SharedLoad {
        pub(crate) fn set(&self, load: f64) {
            self.bits.store(load.to_bits(), Ordering::SeqCst);
        }

        pub(crate) fn fail(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    impl LoadSource for SharedLoad {
        fn measure(&self) -> Result<f64, LoadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(LoadError("sensor unavailable".to_string()));
            }
            Ok(f64::from_bits(self.bits.load(Ordering::SeqCst)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_value_reused_within_window() {
        let source = SharedLoad::default();
        source.set(0.3);
        let sampler = LoadSampler::new(Box::new(source.clone()), Duration::from_secs(5));

        assert_eq!(sampler.sample(), 0.3);

        source.set(0.95);
        tokio::time::advance(Duration::from_millis(4900)).await;
        assert_eq!(sampler.sample(), 0.3);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(sampler.sample(), 0.95);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_degrades_to_last_value() {
        let source = SharedLoad::default();
        source.set(0.6);
        let sampler = LoadSampler::new(Box::new(source.clone()), Duration::from_secs(5));
        assert_eq!(sampler.sample(), 0.6);

        source.fail(true);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(sampler.sample(), 0.6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reading_is_clamped() {
        let source = SharedLoad::default();
        source.set(1.7);
        let sampler = LoadSampler::new(Box::new(source), Duration::from_secs(5));
        assert_eq!(sampler.sample(), 1.0);
        assert_eq!(sampler.last().0, 1.0);
    }
}
