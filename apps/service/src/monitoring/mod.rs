/// Monitoring engine module - verifies the anonymity layer every cycle
///
/// This module is responsible for:
/// - Running the registered checks on a bounded worker pool
/// - Choosing the interval between cycles from the sampled system load
/// - Publishing each cycle's results as one immutable snapshot
pub mod cache;
pub mod checker;
pub mod executor;
pub mod load;
pub mod probes;
pub mod scheduler;
pub mod types;

pub use cache::ResultCache;
pub use checker::{Check, RetryPolicy};
pub use executor::{CycleResult, Dispatcher, Registry};
pub use load::{LoadSampler, LoadSource, SysinfoLoad};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use types::{CheckOutcome, CycleSnapshot};
