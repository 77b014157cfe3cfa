/// Orchestrator module - owns the monitoring loop
///
/// The orchestrator is the core coordinator that:
/// - Starts and stops the single monitoring loop
/// - Runs each cycle through the dispatcher and publishes the snapshot
/// - Hands failing outcomes to the kill switch
///
/// Only one cycle is ever in flight. Cycle N is published before cycle N+1
/// is dispatched.


use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::EngineError;
use crate::killswitch::firewall::TrafficFilter;
use crate::killswitch::{KillSwitch, KillSwitchState, Restorer, Terminator};
use crate::monitoring::checker::{
    AddressDivergenceCheck, AnonymityServiceCheck, LeakCheck, UnexpectedExposureCheck,
};
use crate::monitoring::probes::{
    DigResolver, HttpAddressProbe, HttpAnonymityProbe, ProcNetEnumerator,
};
use crate::monitoring::{
    Check, CheckOutcome, CycleResult, CycleSnapshot, Dispatcher, LoadSampler, LoadSource, Registry,
    ResultCache, RetryPolicy, Scheduler, SchedulerConfig,
};

pub const TOR_STATUS: &str = "tor_status";
pub const DNS_LEAK: &str = "dns_leak";
pub const IP_ANONYMITY: &str = "ip_anonymity";
pub const UNAUTHORIZED_TRAFFIC: &str = "unauthorized_traffic";

/// Build the four production checks from the config
pub fn default_registry(config: &Config) -> Result<Registry> {
    let policy = RetryPolicy::from(&config.retry);
    let anonymity = &config.anonymity;

    let checks: Vec<Arc<dyn Check>> = vec![
        Arc::new(AnonymityServiceCheck::new(
            TOR_STATUS,
            Arc::new(HttpAnonymityProbe::new(anonymity)?),
            anonymity.check_urls.clone(),
            policy,
        )),
        Arc::new(LeakCheck::new(
            DNS_LEAK,
            Arc::new(DigResolver::new(anonymity)),
            anonymity.leak_test_domain.clone(),
            policy,
        )),
        Arc::new(AddressDivergenceCheck::new(
            IP_ANONYMITY,
            Arc::new(HttpAddressProbe::new(anonymity)?),
            policy,
        )),
        Arc::new(UnexpectedExposureCheck::new(
            UNAUTHORIZED_TRAFFIC,
            Arc::new(ProcNetEnumerator::default()),
            vec![anonymity.socks_port, anonymity.dns_port],
        )),
    ];

    Ok(Registry::new(checks)?)
}

/// Host-facing pieces the engine drives but does not own
pub struct Collaborators {
    pub load: Box<dyn LoadSource>,
    pub filter: Arc<dyn TrafficFilter>,
    pub restorer: Arc<dyn Restorer>,
    pub terminator: Arc<dyn Terminator>,
}

/// Read-only view of the engine
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub is_active: bool,
    pub kill_switch: KillSwitchState,
    pub kill_switch_active: bool,
    pub last_load: f64,
    pub last_load_sample_age: Option<Duration>,
    #[serde(skip)]
    pub snapshot: Arc<CycleSnapshot>,
    pub trigger: Option<Vec<CheckOutcome>>,
}

struct Engine {
    registry: Registry,
    dispatcher: Dispatcher,
    scheduler: Scheduler,
    cache: ResultCache,
    kill_switch: KillSwitch,
    restorer: Arc<dyn Restorer>,
    is_active: AtomicBool,
}

/// Main orchestrator for the anonymity monitor
pub struct Orchestrator {
    engine: Arc<Engine>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Orchestrator {
    pub fn new(config: &Config, registry: Registry, collaborators: Collaborators) -> Self {
        let engine_config = &config.engine;
        let load_cache = Duration::from_secs(engine_config.load_cache_secs);
        let sampler = LoadSampler::new(collaborators.load, load_cache);

        let engine = Engine {
            registry,
            dispatcher: Dispatcher::new(
                engine_config.workers,
                Duration::from_secs(engine_config.check_timeout_secs),
            ),
            scheduler: Scheduler::new(SchedulerConfig::from(engine_config), sampler),
            cache: ResultCache::new(),
            kill_switch: KillSwitch::new(
                collaborators.filter,
                collaborators.restorer.clone(),
                collaborators.terminator,
            ),
            restorer: collaborators.restorer,
            is_active: AtomicBool::new(false),
        };

        let (shutdown, _) = watch::channel(false);
        Self { engine: Arc::new(engine), shutdown, task: Mutex::new(None) }
    }

    /// Spawn the monitoring loop. Must be called inside a tokio runtime.
    pub fn start(&self) -> Result<(), EngineError> {
        if self.engine.kill_switch.is_engaged() {
            return Err(EngineError::KillSwitchEngaged);
        }
        if self
            .engine
            .is_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(EngineError::AlreadyActive);
        }

        self.shutdown.send_replace(false);
        let names: Vec<&str> = self.engine.registry.names().collect();
        info!(count = self.engine.registry.len(), checks = ?names, "Starting anonymity monitor");

        let handle = tokio::spawn(monitor(self.engine.clone(), self.shutdown.subscribe()));
        if let Some(previous) = lock(&self.task).replace(handle) {
            // a loop that already ended on its own
            previous.abort();
        }
        Ok(())
    }

    /// Stop the loop, wait for in-flight checks to drain, then restore the host.
    pub async fn deactivate(&self) {
        self.engine.is_active.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(true);

        let Some(handle) = lock(&self.task).take() else {
            debug!("deactivate called with no running loop");
            return;
        };
        info!("Deactivating anonymity monitor");

        if let Err(e) = handle.await {
            warn!("Monitoring loop ended abnormally: {}", e);
        }

        if let Err(e) = self.engine.restorer.restore().await {
            warn!("System restoration failed: {:#}", e);
        }
        info!("Anonymity monitor stopped");
    }

    pub fn status(&self) -> EngineStatus {
        let (last_load, last_load_sample_age) = self.engine.scheduler.sampler().last();
        let kill_switch = self.engine.kill_switch.state();
        EngineStatus {
            is_active: self.engine.is_active.load(Ordering::SeqCst),
            kill_switch,
            kill_switch_active: kill_switch != KillSwitchState::Inactive,
            last_load,
            last_load_sample_age,
            snapshot: self.engine.cache.read(),
            trigger: self.engine.kill_switch.trigger_reason(),
        }
    }

    /// Run a single cycle without publishing it or arming the kill switch
    pub async fn run_once(&self) -> Vec<CheckOutcome> {
        let (_keep, never) = watch::channel(false);
        match self.engine.dispatcher.run_cycle(&self.engine.registry, &never).await {
            CycleResult::Completed(outcomes) => outcomes,
            CycleResult::Cancelled(finished) => finished,
        }
    }
}

/// Sleeps for `duration`; true when shutdown was requested first
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = shutdown.wait_for(|stop| *stop) => true,
        _ = sleep(duration) => false,
    }
}

fn log_outcomes(outcomes: &[CheckOutcome]) {
    for outcome in outcomes {
        if outcome.passed {
            info!("{}", outcome);
        } else {
            error!("SECURITY BREACH: {} failed - {}", outcome.name, outcome.message);
        }
    }
}

async fn monitor(engine: Arc<Engine>, mut shutdown: watch::Receiver<bool>) {
    let mut cycle = engine.cache.read().cycle;

    while engine.is_active.load(Ordering::SeqCst) && !*shutdown.borrow() {
        let interval = engine.scheduler.next_interval();

        // A skipped tick leaves the previous snapshot current; it is not
        // marked stale.
        let since_last = engine.cache.read().age(Instant::now());
        if let Some(wait) = engine.scheduler.skip_delay(interval, since_last) {
            debug!(?interval, ?wait, "last cycle is recent, skipping tick");
            if wait_or_shutdown(&mut shutdown, wait).await {
                break;
            }
            continue;
        }

        let started = Instant::now();
        debug!(cycle = cycle + 1, ?interval, "dispatching checks");
        let cycle_result = engine.dispatcher.run_cycle(&engine.registry, &shutdown).await;
        let (outcomes, cancelled) = match cycle_result {
            CycleResult::Completed(outcomes) => {
                cycle += 1;
                let snapshot = CycleSnapshot::from_outcomes(cycle, &outcomes, Instant::now());
                engine.cache.publish(snapshot);
                (outcomes, false)
            }
            // partial cycles are never published, but the checks that did
            // finish are still acted on
            CycleResult::Cancelled(finished) => {
                info!(completed = finished.len(), "Cycle cancelled by shutdown");
                (finished, true)
            }
        };
        log_outcomes(&outcomes);

        let failures: Vec<CheckOutcome> = outcomes.into_iter().filter(|o| !o.passed).collect();
        if !failures.is_empty() {
            error!(cycle, cancelled, "CRITICAL: {} security check(s) failed", failures.len());
            engine.is_active.store(false, Ordering::SeqCst);
            engine.kill_switch.activate(&failures).await;
            break;
        }
        if cancelled {
            break;
        }

        let pause = engine.scheduler.sleep_after_cycle(interval, started.elapsed());
        debug!(cycle, ?pause, "all checks passed");
        if wait_or_shutdown(&mut shutdown, pause).await {
            break;
        }
    }

    debug!(cycle, "monitoring loop exited");
}
