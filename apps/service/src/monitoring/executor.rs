use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{Semaphore, watch};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::checker::Check;
use super::types::CheckOutcome;
use crate::error::EngineError;

/// Ordered, fixed set of checks run every cycle
#[derive(Clone)]
pub struct Registry {
    checks: Arc<[Arc<dyn Check>]>,
}

impl Registry {
    pub fn new(checks: Vec<Arc<dyn Check>>) -> Result<Self, EngineError> {
        if checks.is_empty() {
            return Err(EngineError::EmptyRegistry);
        }
        for (i, check) in checks.iter().enumerate() {
            if checks[..i].iter().any(|other| other.name() == check.name()) {
                return Err(EngineError::DuplicateCheck(check.name().to_string()));
            }
        }
        Ok(Self { checks: checks.into() })
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.checks.iter().map(|c| c.name())
    }

    fn iter(&self) -> impl Iterator<Item = &Arc<dyn Check>> {
        self.checks.iter()
    }
}

/// How a dispatched cycle ended
#[derive(Debug)]
pub enum CycleResult {
    /// One outcome per registered check
    Completed(Vec<CheckOutcome>),
    /// Shutdown was requested before every check got a worker; holds the
    /// outcomes of the checks that did run
    Cancelled(Vec<CheckOutcome>),
}

/// Fans a cycle out over a fixed-size worker pool and joins it back.
///
/// Each check runs on its own task once it holds one of the pool's permits and
/// is bounded by `check_timeout`. Timeouts and panics become failing outcomes;
/// checks still waiting for a permit when shutdown is signalled are dropped and
/// the cycle reports [`CycleResult::Cancelled`] with whatever did finish.
pub struct Dispatcher {
    workers: Arc<Semaphore>,
    check_timeout: Duration,
}

impl Dispatcher {
    pub fn new(workers: usize, check_timeout: Duration) -> Self {
        Self { workers: Arc::new(Semaphore::new(workers.max(1))), check_timeout }
    }

    pub async fn run_cycle(
        &self,
        registry: &Registry,
        shutdown: &watch::Receiver<bool>,
    ) -> CycleResult {
        let handles: Vec<(String, tokio::task::JoinHandle<Option<CheckOutcome>>)> = registry
            .iter()
            .map(|check| {
                let name = check.name().to_string();
                let task = run_check(
                    check.clone(),
                    self.workers.clone(),
                    self.check_timeout,
                    shutdown.clone(),
                );
                (name, tokio::spawn(task))
            })
            .collect();

        let (names, handles): (Vec<String>, Vec<_>) = handles.into_iter().unzip();
        let joined = join_all(handles).await;

        let mut outcomes = Vec::with_capacity(names.len());
        let mut cancelled = false;
        for (name, result) in names.into_iter().zip(joined) {
            match result {
                Ok(Some(outcome)) => outcomes.push(CheckOutcome { name, ..outcome }),
                Ok(None) => cancelled = true,
                Err(e) => {
                    warn!("Check {} crashed: {}", name, e);
                    let message = format!("exception/timeout: {e}");
                    outcomes.push(CheckOutcome::fail(name, message));
                }
            }
        }

        if cancelled {
            debug!(completed = outcomes.len(), "cycle cancelled by shutdown");
            CycleResult::Cancelled(outcomes)
        } else {
            CycleResult::Completed(outcomes)
        }
    }
}

async fn run_check(
    check: Arc<dyn Check>,
    workers: Arc<Semaphore>,
    check_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Option<CheckOutcome> {
    let _permit = tokio::select! {
        biased;
        _ = shutdown.wait_for(|stop| *stop) => return None,
        permit = workers.acquire_owned() => permit.ok()?,
    };

    // shutdown may have raced the permit
    if *shutdown.borrow() {
        return None;
    }

    match timeout(check_timeout, check.attempt()).await {
        Ok(outcome) => Some(outcome),
        Err(_) => Some(CheckOutcome::fail(
            check.name(),
            format!("exception/timeout: no result within {check_timeout:?}"),
        )),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    /// Check with scripted latency and result
    pub(crate) struct FakeCheck {
        pub(crate) name: String,
        pub(crate) latency: Duration,
        pub(crate) result: Result<(), String>,
        pub(crate) panics: bool,
        pub(crate) running: Arc<AtomicUsize>,
        pub(crate) peak: Arc<AtomicUsize>,
        pub(crate) started: Arc<AtomicUsize>,
    }

    impl FakeCheck {
        pub(crate) fn passing(name: &str) -> Self {
            Self {
                name: name.to_string(),
                latency: Duration::from_millis(10),
                result: Ok(()),
                panics: false,
                running: Arc::default(),
                peak: Arc::default(),
                started: Arc::default(),
            }
        }

        pub(crate) fn failing(name: &str, message: &str) -> Self {
            Self { result: Err(message.to_string()), ..Self::passing(name) }
        }

        pub(crate) fn latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }
    }

    #[async_trait::async_trait]
    impl Check for FakeCheck {
        fn name(&self) -> &str {
            &self.name
        }

        async fn attempt(&self) -> CheckOutcome {
            self.started.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            sleep(self.latency).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            if self.panics {
                panic!("probe exploded");
            }
            match &self.result {
                Ok(()) => CheckOutcome::pass(&self.name),
                Err(message) => CheckOutcome::fail(&self.name, message),
            }
        }
    }

    fn registry(checks: Vec<FakeCheck>) -> Registry {
        Registry::new(checks.into_iter().map(|c| Arc::new(c) as Arc<dyn Check>).collect()).unwrap()
    }

    fn no_shutdown() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        rx
    }

    fn completed(result: CycleResult) -> Vec<CheckOutcome> {
        match result {
            CycleResult::Completed(outcomes) => outcomes,
            CycleResult::Cancelled(_) => panic!("cycle unexpectedly cancelled"),
        }
    }

    #[test]
    fn test_registry_rejects_duplicates_and_empty() {
        let dup = vec![
            Arc::new(FakeCheck::passing("a")) as Arc<dyn Check>,
            Arc::new(FakeCheck::passing("a")) as Arc<dyn Check>,
        ];
        assert!(matches!(
            Registry::new(dup),
            Err(EngineError::DuplicateCheck(name)) if name == "a"
        ));
        assert!(matches!(Registry::new(vec![]), Err(EngineError::EmptyRegistry)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_bounds_parallelism() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let checks: Vec<FakeCheck> = (0..7)
            .map(|i| FakeCheck {
                running: running.clone(),
                peak: peak.clone(),
                ..FakeCheck::passing(&format!("check_{i}")).latency(Duration::from_secs(1))
            })
            .collect();

        let dispatcher = Dispatcher::new(3, Duration::from_secs(30));
        let outcomes = completed(dispatcher.run_cycle(&registry(checks), &no_shutdown()).await);

        assert_eq!(outcomes.len(), 7);
        assert!(outcomes.iter().all(|o| o.passed));
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_and_panic_become_failures() {
        let checks = vec![
            FakeCheck::passing("fast"),
            FakeCheck::passing("slow").latency(Duration::from_secs(31)),
            FakeCheck { panics: true, ..FakeCheck::passing("broken") },
        ];

        let dispatcher = Dispatcher::new(3, Duration::from_secs(30));
        let outcomes = completed(dispatcher.run_cycle(&registry(checks), &no_shutdown()).await);
        let by_name = |n: &str| outcomes.iter().find(|o| o.name == n).unwrap().clone();

        assert!(by_name("fast").passed);

        let slow = by_name("slow");
        assert!(!slow.passed);
        assert!(slow.message.starts_with("exception/timeout"));

        let broken = by_name("broken");
        assert!(!broken.passed);
        assert!(broken.message.starts_with("exception/timeout"));
        assert!(broken.message.contains("panic"), "{}", broken.message);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_queued_checks() {
        let started = Arc::new(AtomicUsize::new(0));
        let checks: Vec<FakeCheck> = (0..5)
            .map(|i| FakeCheck {
                started: started.clone(),
                ..FakeCheck::passing(&format!("check_{i}")).latency(Duration::from_secs(2))
            })
            .collect();

        let (tx, rx) = watch::channel(false);
        let dispatcher = Dispatcher::new(3, Duration::from_secs(30));
        let registry = registry(checks);

        let cycle = dispatcher.run_cycle(&registry, &rx);
        let stop = async {
            sleep(Duration::from_secs(1)).await;
            tx.send(true).unwrap();
        };
        let (result, ()) = tokio::join!(cycle, stop);

        // the three in-flight checks ran to completion, the queued two never started
        let CycleResult::Cancelled(finished) = result else {
            panic!("cycle should have been cancelled");
        };
        assert_eq!(finished.len(), 3);
        assert!(finished.iter().all(|o| o.passed));
        assert_eq!(started.load(Ordering::SeqCst), 3);
    }
}
