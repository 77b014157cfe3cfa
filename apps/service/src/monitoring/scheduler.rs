use std::time::Duration;

use rand::Rng;

use super::load::LoadSampler;
use crate::config::EngineConfig;

/// Interval policy for the monitoring loop
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    pub base_interval: Duration,
    pub max_interval: Duration,
    pub load_threshold: f64,
    /// Upper bound on the re-evaluation sleep when a tick is skipped
    pub skip_poll_cap: Duration,
    /// Upper bound on post-cycle jitter
    pub jitter_cap: Duration,
    pub jitter_ratio: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(30),
            max_interval: Duration::from_secs(120),
            load_threshold: 0.8,
            skip_poll_cap: Duration::from_secs(10),
            jitter_cap: Duration::from_secs(5),
            jitter_ratio: 0.1,
        }
    }
}

impl From<&EngineConfig> for SchedulerConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            base_interval: Duration::from_secs(config.base_interval_secs),
            max_interval: Duration::from_secs(config.max_interval_secs),
            load_threshold: config.load_threshold,
            skip_poll_cap: Duration::from_secs(config.skip_poll_cap_secs),
            jitter_cap: Duration::from_secs(config.jitter_cap_secs),
            ..Self::default()
        }
    }
}

/// Decides how long the monitoring loop waits between cycles
pub struct Scheduler {
    config: SchedulerConfig,
    sampler: LoadSampler,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, sampler: LoadSampler) -> Self {
        Self { config, sampler }
    }

    pub fn sampler(&self) -> &LoadSampler {
        &self.sampler
    }

    /// Interval for the next cycle, stretched under load
    pub fn next_interval(&self) -> Duration {
        self.interval_for_load(self.sampler.sample())
    }

    pub fn interval_for_load(&self, load: f64) -> Duration {
        if load > self.config.load_threshold {
            self.config
                .base_interval
                .mul_f64(1.0 + load)
                .min(self.config.max_interval)
        } else {
            self.config.base_interval
        }
    }

    /// `Some(wait)` when the last published cycle is younger than half the
    /// interval; the loop then sleeps `wait` and re-evaluates instead of
    /// dispatching.
    pub fn skip_delay(&self, interval: Duration, since_last: Option<Duration>) -> Option<Duration> {
        match since_last {
            Some(age) if age < interval / 2 => Some((interval / 4).min(self.config.skip_poll_cap)),
            _ => None,
        }
    }

    /// Upper bound on the jitter added to a post-cycle sleep
    pub fn jitter_bound(&self, sleep: Duration) -> Duration {
        sleep.mul_f64(self.config.jitter_ratio).min(self.config.jitter_cap)
    }

    /// Sleep after a completed cycle: the rest of the interval plus jitter
    pub fn sleep_after_cycle(&self, interval: Duration, elapsed: Duration) -> Duration {
        let sleep = interval.saturating_sub(elapsed);
        let bound = self.jitter_bound(sleep);
        let jitter = if bound.is_zero() {
            Duration::ZERO
        } else {
            rand::thread_rng().gen_range(Duration::ZERO..=bound)
        };
        sleep + jitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::load::tests::SharedLoad;

    fn assert_secs(actual: Duration, expected: f64) {
        assert!((actual.as_secs_f64() - expected).abs() < 1e-6, "{actual:?} != {expected}s");
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(
            SchedulerConfig::default(),
            LoadSampler::new(Box::new(SharedLoad::default()), Duration::from_secs(5)),
        )
    }

    #[test]
    fn test_interval_is_base_at_or_below_threshold() {
        let s = scheduler();
        for load in [0.0, 0.25, 0.5, 0.8] {
            assert_eq!(s.interval_for_load(load), Duration::from_secs(30));
        }
    }

    #[test]
    fn test_interval_grows_with_load_and_is_capped() {
        let s = scheduler();
        let mut previous = s.interval_for_load(0.8);
        for step in 1..=20 {
            let load = 0.8 + f64::from(step) * 0.01;
            let interval = s.interval_for_load(load);
            assert!(interval >= previous);
            assert!(interval <= Duration::from_secs(120));
            previous = interval;
        }
        assert_secs(s.interval_for_load(0.9), 57.0);
    }

    #[test]
    fn test_interval_capped_at_max() {
        let config = SchedulerConfig {
            base_interval: Duration::from_secs(70),
            ..SchedulerConfig::default()
        };
        let sampler = LoadSampler::new(Box::new(SharedLoad::default()), Duration::from_secs(5));
        let s = Scheduler::new(config, sampler);
        assert_eq!(s.interval_for_load(0.95), Duration::from_secs(120));
    }

    #[test]
    fn test_skip_delay() {
        let s = scheduler();
        let interval = Duration::from_secs(30);

        assert_eq!(s.skip_delay(interval, None), None);
        assert_eq!(s.skip_delay(interval, Some(Duration::from_secs(15))), None);
        assert_eq!(
            s.skip_delay(interval, Some(Duration::from_secs(14))),
            Some(Duration::from_millis(7500))
        );
        // interval/4 beyond the cap
        assert_eq!(
            s.skip_delay(Duration::from_secs(120), Some(Duration::from_secs(1))),
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn test_sleep_after_cycle_bounds() {
        let s = scheduler();
        for _ in 0..200 {
            let sleep = s.sleep_after_cycle(Duration::from_secs(30), Duration::from_secs(4));
            assert!(sleep >= Duration::from_secs(26));
            assert!(sleep <= Duration::from_millis(28_601));
        }
        // long sleeps hit the 5s jitter cap
        assert_eq!(s.jitter_bound(Duration::from_secs(120)), Duration::from_secs(5));
        // overrun cycles do not sleep at all
        let overrun = s.sleep_after_cycle(Duration::from_secs(30), Duration::from_secs(45));
        assert_eq!(overrun, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_interval_uses_sampled_load() {
        let source = SharedLoad::default();
        source.set(0.9);
        let sampler = LoadSampler::new(Box::new(source), Duration::from_secs(5));
        let s = Scheduler::new(SchedulerConfig::default(), sampler);
        assert_secs(s.next_interval(), 57.0);
    }
}
