use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use super::probes::{
    AddressProbe, AnonymityProbe, ListeningEndpoint, NameResolver, Route, SocketEnumerator,
};
use super::types::CheckOutcome;
use crate::config::RetryConfig;
use crate::error::ProbeError;

/// A named verification probe run once per cycle.
///
/// `attempt` must not panic or return early with an error: every fault inside
/// the check becomes a failing [`CheckOutcome`].
#[async_trait::async_trait]
pub trait Check: Send + Sync {
    fn name(&self) -> &str;

    async fn attempt(&self) -> CheckOutcome;
}

/// Per-source retry budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3, delay: Duration::from_secs(5) }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self { max_retries: config.max_retries, delay: Duration::from_secs(config.delay_secs) }
    }
}

/// Authoritative answer from a probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail(String),
}

impl Verdict {
    fn into_outcome(self, name: &str) -> CheckOutcome {
        match self {
            Verdict::Pass => CheckOutcome::pass(name),
            Verdict::Fail(message) => CheckOutcome::fail(name, message),
        }
    }
}

/// Try every source in order, each up to `policy.max_retries` times.
///
/// The first authoritative verdict wins. Errors are transient: they are
/// remembered, followed by `policy.delay`, and retried. When everything is
/// exhausted the verdict is a failure naming the last error seen.
pub async fn run_with_fallbacks<S, F, Fut>(policy: RetryPolicy, sources: &[S], probe: F) -> Verdict
where
    S: Clone + std::fmt::Display,
    F: Fn(S) -> Fut,
    Fut: Future<Output = Result<Verdict, ProbeError>>,
{
    let attempts = policy.max_retries.max(1);
    let mut last_error = String::from("no sources configured");

    for source in sources {
        for attempt in 0..attempts {
            match probe(source.clone()).await {
                Ok(verdict) => return verdict,
                Err(e) => {
                    debug!(%source, attempt = attempt + 1, error = %e, "probe attempt failed");
                    last_error = format!("{source}: {e}");
                    if attempt + 1 < attempts {
                        sleep(policy.delay).await;
                    }
                }
            }
        }
    }

    Verdict::Fail(format!("all attempts failed. Last error: {last_error}"))
}

/// Passes iff a verification endpoint reports the traffic as anonymized
pub struct AnonymityServiceCheck {
    name: String,
    probe: Arc<dyn AnonymityProbe>,
    sources: Vec<String>,
    policy: RetryPolicy,
}

impl AnonymityServiceCheck {
    pub fn new(
        name: impl Into<String>,
        probe: Arc<dyn AnonymityProbe>,
        sources: Vec<String>,
        policy: RetryPolicy,
    ) -> Self {
        Self { name: name.into(), probe, sources, policy }
    }
}

/// Read an endpoint answer: `IsTor` is authoritative, otherwise a `clients`
/// listing counts as anonymized when non-empty. Both fields are judged by
/// truthiness. Anything else is inconclusive.
pub fn interpret_anonymity_answer(
    source: &str,
    answer: &serde_json::Value,
) -> Result<Verdict, ProbeError> {
    let anonymized = if let Some(flag) = answer.get("IsTor") {
        is_truthy(flag)
    } else if let Some(clients) = answer.get("clients") {
        is_truthy(clients)
    } else {
        return Err(ProbeError::Inconclusive(
            "response has neither IsTor nor clients".to_string(),
        ));
    };

    if anonymized {
        Ok(Verdict::Pass)
    } else {
        Ok(Verdict::Fail(format!("traffic is not anonymized according to {source}")))
    }
}

fn is_truthy(value: &serde_json::Value) -> bool {
    use serde_json::Value;
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[async_trait::async_trait]
impl Check for AnonymityServiceCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn attempt(&self) -> CheckOutcome {
        run_with_fallbacks(self.policy, &self.sources, |source: String| {
            let probe = self.probe.clone();
            async move {
                let answer = probe.query(&source).await?;
                interpret_anonymity_answer(&source, &answer)
            }
        })
        .await
        .into_outcome(&self.name)
    }
}

/// Passes iff a lookup through the anonymity layer's resolver answers
pub struct LeakCheck {
    name: String,
    resolver: Arc<dyn NameResolver>,
    domain: String,
    policy: RetryPolicy,
}

impl LeakCheck {
    pub fn new(
        name: impl Into<String>,
        resolver: Arc<dyn NameResolver>,
        domain: impl Into<String>,
        policy: RetryPolicy,
    ) -> Self {
        Self { name: name.into(), resolver, domain: domain.into(), policy }
    }
}

#[async_trait::async_trait]
impl Check for LeakCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn attempt(&self) -> CheckOutcome {
        let domains = [self.domain.clone()];
        run_with_fallbacks(self.policy, &domains, |domain: String| {
            let resolver = self.resolver.clone();
            async move {
                let answers = resolver.resolve(&domain).await?;
                if answers.is_empty() {
                    Ok(Verdict::Fail(format!(
                        "resolving {domain} through the anonymity layer returned no answer"
                    )))
                } else {
                    Ok(Verdict::Pass)
                }
            }
        })
        .await
        .into_outcome(&self.name)
    }
}

/// Passes iff the anonymized and direct external addresses differ
pub struct AddressDivergenceCheck {
    name: String,
    probe: Arc<dyn AddressProbe>,
    policy: RetryPolicy,
}

impl AddressDivergenceCheck {
    pub fn new(name: impl Into<String>, probe: Arc<dyn AddressProbe>, policy: RetryPolicy) -> Self {
        Self { name: name.into(), probe, policy }
    }
}

pub fn compare_addresses(direct: &str, anonymized: &str) -> Verdict {
    if !direct.is_empty() && !anonymized.is_empty() && direct != anonymized {
        Verdict::Pass
    } else {
        Verdict::Fail(format!(
            "addresses match or invalid: direct={direct}, anonymized={anonymized}"
        ))
    }
}

#[async_trait::async_trait]
impl Check for AddressDivergenceCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn attempt(&self) -> CheckOutcome {
        run_with_fallbacks(self.policy, &["external address"], |_| {
            let probe = self.probe.clone();
            async move {
                // anonymized first, so a broken proxy is noticed before going direct
                let anonymized = probe.observed_address(Route::Anonymized).await?;
                let direct = probe.observed_address(Route::Direct).await?;
                Ok(compare_addresses(&direct, &anonymized))
            }
        })
        .await
        .into_outcome(&self.name)
    }
}

/// Passes iff nothing listens on a non-loopback address outside the
/// anonymity layer's own ports
pub struct UnexpectedExposureCheck {
    name: String,
    enumerator: Arc<dyn SocketEnumerator>,
    allowed_ports: Vec<u16>,
}

impl UnexpectedExposureCheck {
    pub fn new(
        name: impl Into<String>,
        enumerator: Arc<dyn SocketEnumerator>,
        allowed_ports: Vec<u16>,
    ) -> Self {
        Self { name: name.into(), enumerator, allowed_ports }
    }
}

pub fn find_exposed<'a>(
    endpoints: &'a [ListeningEndpoint],
    allowed_ports: &'a [u16],
) -> impl Iterator<Item = &'a ListeningEndpoint> {
    endpoints
        .iter()
        .filter(|ep| !ep.address.is_loopback() && !allowed_ports.contains(&ep.port))
}

#[async_trait::async_trait]
impl Check for UnexpectedExposureCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn attempt(&self) -> CheckOutcome {
        let endpoints = match self.enumerator.listening().await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                let message = format!("listening socket enumeration failed: {e}");
                return CheckOutcome::fail(&self.name, message);
            }
        };

        let exposed: Vec<String> =
            find_exposed(&endpoints, &self.allowed_ports).map(|ep| ep.to_string()).collect();
        match exposed.first() {
            None => CheckOutcome::pass(&self.name),
            Some(first) => CheckOutcome::fail(
                &self.name,
                format!("unexpected listener on {first} ({} exposed in total)", exposed.len()),
            ),
        }
    }
}
