use std::io::Error as IoError;
use std::time::Duration;

use thiserror::Error;

/// Transient faults raised by a single probe attempt. These never cross the
/// boundary of a check; the retry runner turns them into a failing outcome.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("`{command}` exited unsuccessfully: {stderr}")]
    Command { command: String, stderr: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("no authoritative answer: {0}")]
    Inconclusive(String),
    #[error("{0:#}")]
    Io(#[from] IoError),
}

/// Failures while driving the traffic filter. Any of these during kill switch
/// activation is fatal.
#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: IoError,
    },
    #[error("`{command}` did not finish within {timeout:?}")]
    Timeout { command: String, timeout: Duration },
}

#[derive(Debug, Error)]
#[error("load measurement failed: {0}")]
pub struct LoadError(pub String);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine is already active")]
    AlreadyActive,
    #[error("kill switch has been engaged; restart the process after recovering the network")]
    KillSwitchEngaged,
    #[error("check `{0}` is registered more than once")]
    DuplicateCheck(String),
    #[error("check registry is empty")]
    EmptyRegistry,
}
