//! Fail-closed kill switch.
//!
//! ```text
//! Inactive ──activate()──▶ Activating ──rules applied──▶ Blocked ──▶ Terminated
//!                               │                                        ▲
//!                               └──────────── rule failure ──────────────┘
//! ```
//!
//! The first `activate()` wins; every later call is a no-op. Whether or not
//! the deny rules went in, restoration is attempted and the process is
//! terminated with [`EXIT_CODE`]. Nothing leads back to `Inactive`.

pub mod firewall;

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::FirewallError;
use crate::monitoring::CheckOutcome;
use firewall::{AddressFamily, Chain, Policy, TrafficFilter};

/// Exit status used when the kill switch terminates the process
pub const EXIT_CODE: i32 = 1;

const BANNER_RULE: &str = "============================================================";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KillSwitchState {
    Inactive,
    Activating,
    Blocked,
    Terminated,
}

impl std::fmt::Display for KillSwitchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KillSwitchState::Inactive => write!(f, "inactive"),
            KillSwitchState::Activating => write!(f, "activating"),
            KillSwitchState::Blocked => write!(f, "blocked"),
            KillSwitchState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Ends the process once the kill switch has run
pub trait Terminator: Send + Sync {
    fn terminate(&self, code: i32);
}

pub struct ProcessExit;

impl Terminator for ProcessExit {
    fn terminate(&self, code: i32) {
        std::process::exit(code);
    }
}

/// Best-effort undo of host changes made while the engine was active
#[async_trait::async_trait]
pub trait Restorer: Send + Sync {
    async fn restore(&self) -> anyhow::Result<()>;
}

/// Restoration hook for hosts where the engine changed nothing beyond the
/// firewall
pub struct LoggingRestorer;

#[async_trait::async_trait]
impl Restorer for LoggingRestorer {
    async fn restore(&self) -> anyhow::Result<()> {
        info!("Restoring system configuration");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// This call ran the shutdown sequence; `blocked` tells whether every deny
    /// rule was applied
    Fired { blocked: bool },
    /// Another call got there first
    AlreadyTriggered,
}

pub struct KillSwitch {
    state: Mutex<KillSwitchState>,
    trigger: Mutex<Option<Vec<CheckOutcome>>>,
    filter: Arc<dyn TrafficFilter>,
    restorer: Arc<dyn Restorer>,
    terminator: Arc<dyn Terminator>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl KillSwitch {
    pub fn new(
        filter: Arc<dyn TrafficFilter>,
        restorer: Arc<dyn Restorer>,
        terminator: Arc<dyn Terminator>,
    ) -> Self {
        Self {
            state: Mutex::new(KillSwitchState::Inactive),
            trigger: Mutex::new(None),
            filter,
            restorer,
            terminator,
        }
    }

    pub fn state(&self) -> KillSwitchState {
        *lock(&self.state)
    }

    pub fn is_engaged(&self) -> bool {
        self.state() != KillSwitchState::Inactive
    }

    /// The failing outcomes that fired the switch
    pub fn trigger_reason(&self) -> Option<Vec<CheckOutcome>> {
        lock(&self.trigger).clone()
    }

    fn set_state(&self, next: KillSwitchState) {
        let mut state = lock(&self.state);
        debug!("kill switch {} -> {}", *state, next);
        *state = next;
    }

    pub async fn activate(&self, failures: &[CheckOutcome]) -> Activation {
        {
            let mut state = lock(&self.state);
            if *state != KillSwitchState::Inactive {
                debug!("kill switch already {}, ignoring trigger", *state);
                return Activation::AlreadyTriggered;
            }
            *state = KillSwitchState::Activating;
        }
        *lock(&self.trigger) = Some(failures.to_vec());

        error!("{}", BANNER_RULE);
        error!("EMERGENCY KILL SWITCH ACTIVATED");
        error!("{}", BANNER_RULE);
        for failure in failures {
            error!(check = %failure.name, "triggered by {}: {}", failure.name, failure.message);
        }

        let blocked = match self.block_all_traffic().await {
            Ok(()) => {
                error!("All network traffic blocked");
                self.set_state(KillSwitchState::Blocked);
                true
            }
            Err(e) => {
                error!("CRITICAL: Failed to activate kill switch: {}", e);
                false
            }
        };

        if let Err(e) = self.restorer.restore().await {
            warn!("System restoration failed: {:#}", e);
        }

        self.set_state(KillSwitchState::Terminated);
        self.terminator.terminate(EXIT_CODE);
        Activation::Fired { blocked }
    }

    async fn block_all_traffic(&self) -> Result<(), FirewallError> {
        for family in AddressFamily::ALL {
            self.filter.flush_rules(family).await?;
        }
        for family in AddressFamily::ALL {
            for chain in Chain::ALL {
                self.filter.set_default_policy(family, chain, Policy::Drop).await?;
            }
        }
        Ok(())
    }
}
