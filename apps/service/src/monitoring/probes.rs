//! Collaborators the checks consult to learn about the outside world.
//!
//! Each trait is the narrow capability a check needs; the concrete types below
//! talk to the anonymity layer's SOCKS proxy, `dig` and `/proc/net`. Tests swap
//! them for scripted fakes.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::config::AnonymityConfig;
use crate::error::ProbeError;

/// Queries an anonymity-verification endpoint through the anonymity layer
#[async_trait::async_trait]
pub trait AnonymityProbe: Send + Sync {
    /// Fetch the structured answer published by `source`
    async fn query(&self, source: &str) -> Result<serde_json::Value, ProbeError>;
}

/// Resolves names through the anonymity layer's resolver only
#[async_trait::async_trait]
pub trait NameResolver: Send + Sync {
    async fn resolve(&self, domain: &str) -> Result<Vec<String>, ProbeError>;
}

/// Which path an outbound probe takes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Anonymized,
    Direct,
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Route::Anonymized => write!(f, "anonymized"),
            Route::Direct => write!(f, "direct"),
        }
    }
}

/// Reports the caller's address as seen by an external service
#[async_trait::async_trait]
pub trait AddressProbe: Send + Sync {
    async fn observed_address(&self, route: Route) -> Result<String, ProbeError>;
}

/// A locally bound listening socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListeningEndpoint {
    pub address: IpAddr,
    pub port: u16,
}

impl std::fmt::Display for ListeningEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.address {
            IpAddr::V4(addr) => write!(f, "{}:{}", addr, self.port),
            IpAddr::V6(addr) => write!(f, "[{}]:{}", addr, self.port),
        }
    }
}

#[async_trait::async_trait]
pub trait SocketEnumerator: Send + Sync {
    async fn listening(&self) -> Result<Vec<ListeningEndpoint>, ProbeError>;
}

fn proxy_url(config: &AnonymityConfig) -> String {
    format!("socks5h://{}:{}", config.socks_host, config.socks_port)
}

/// HTTP client for the anonymity-verification endpoints, always proxied
pub struct HttpAnonymityProbe {
    client: reqwest::Client,
}

impl HttpAnonymityProbe {
    pub fn new(config: &AnonymityConfig) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(proxy_url(config))?)
            .timeout(Duration::from_secs(config.probe_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl AnonymityProbe for HttpAnonymityProbe {
    async fn query(&self, source: &str) -> Result<serde_json::Value, ProbeError> {
        let response = self.client.get(source).send().await?.error_for_status()?;
        let body = response.text().await?;

        serde_json::from_str(&body).map_err(|e| ProbeError::Malformed(format!("{source}: {e}")))
    }
}

/// Resolves through the anonymity layer's DNS port with `dig`
pub struct DigResolver {
    server: String,
    port: u16,
    timeout: Duration,
}

impl DigResolver {
    pub fn new(config: &AnonymityConfig) -> Self {
        Self {
            server: config.socks_host.clone(),
            port: config.dns_port,
            timeout: Duration::from_secs(config.probe_timeout_secs),
        }
    }
}

#[async_trait::async_trait]
impl NameResolver for DigResolver {
    async fn resolve(&self, domain: &str) -> Result<Vec<String>, ProbeError> {
        let server = format!("@{}", self.server);
        let port = self.port.to_string();
        let args = ["+short", server.as_str(), "-p", port.as_str(), domain];

        let mut command = Command::new("dig");
        command.args(args).kill_on_drop(true);

        let output = timeout(self.timeout, command.output())
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout))??;

        if !output.status.success() {
            return Err(ProbeError::Command {
                command: format!("dig {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let answers: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect();

        debug!(domain, answers = answers.len(), "dig finished");
        Ok(answers)
    }
}

/// Asks a what-is-my-ip service, once through the proxy and once around it
pub struct HttpAddressProbe {
    anonymized: reqwest::Client,
    direct: reqwest::Client,
    url: String,
}

impl HttpAddressProbe {
    pub fn new(config: &AnonymityConfig) -> Result<Self, ProbeError> {
        let timeout = Duration::from_secs(config.probe_timeout_secs);

        let anonymized = reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(proxy_url(config))?)
            .timeout(timeout)
            .build()?;
        let direct = reqwest::Client::builder().no_proxy().timeout(timeout).build()?;

        Ok(Self { anonymized, direct, url: config.address_url.clone() })
    }
}

#[async_trait::async_trait]
impl AddressProbe for HttpAddressProbe {
    async fn observed_address(&self, route: Route) -> Result<String, ProbeError> {
        let client = match route {
            Route::Anonymized => &self.anonymized,
            Route::Direct => &self.direct,
        };

        let body = client.get(&self.url).send().await?.error_for_status()?.text().await?;
        Ok(body.trim().to_string())
    }
}

/// Reads listening TCP sockets from procfs
pub struct ProcNetEnumerator {
    tables: Vec<(PathBuf, Family)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Default for ProcNetEnumerator {
    fn default() -> Self {
        Self {
            tables: vec![
                (PathBuf::from("/proc/net/tcp"), Family::V4),
                (PathBuf::from("/proc/net/tcp6"), Family::V6),
            ],
        }
    }
}

#[async_trait::async_trait]
impl SocketEnumerator for ProcNetEnumerator {
    async fn listening(&self) -> Result<Vec<ListeningEndpoint>, ProbeError> {
        let mut endpoints = Vec::new();

        for (path, family) in &self.tables {
            match tokio::fs::read_to_string(path).await {
                Ok(content) => endpoints.extend(parse_proc_net_tcp(&content, *family)?),
                // tcp6 is absent when IPv6 is compiled out
                Err(e) if e.kind() == ErrorKind::NotFound && *family == Family::V6 => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(endpoints)
    }
}

/// State code for LISTEN in `/proc/net/tcp*`
const TCP_LISTEN: &str = "0A";

/// Parse the listening rows of a `/proc/net/tcp` or `/proc/net/tcp6` table.
///
/// Addresses are printed by the kernel as native-endian 32-bit words, so each
/// word is decoded with `to_ne_bytes`.
pub fn parse_proc_net_tcp(
    content: &str,
    family: Family,
) -> Result<Vec<ListeningEndpoint>, ProbeError> {
    let mut endpoints = Vec::new();

    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[3] != TCP_LISTEN {
            continue;
        }

        let (addr_hex, port_hex) = fields[1]
            .split_once(':')
            .ok_or_else(|| ProbeError::Malformed(format!("local address `{}`", fields[1])))?;

        let port = u16::from_str_radix(port_hex, 16)
            .map_err(|e| ProbeError::Malformed(format!("port `{port_hex}`: {e}")))?;
        let address = match family {
            Family::V4 => IpAddr::V4(decode_v4(addr_hex)?),
            Family::V6 => IpAddr::V6(decode_v6(addr_hex)?),
        };

        endpoints.push(ListeningEndpoint { address, port });
    }

    Ok(endpoints)
}

fn decode_word(hex: &str) -> Result<[u8; 4], ProbeError> {
    u32::from_str_radix(hex, 16)
        .map(u32::to_ne_bytes)
        .map_err(|e| ProbeError::Malformed(format!("address word `{hex}`: {e}")))
}

fn decode_v4(hex: &str) -> Result<Ipv4Addr, ProbeError> {
    if hex.len() != 8 {
        return Err(ProbeError::Malformed(format!("IPv4 address `{hex}`")));
    }
    Ok(Ipv4Addr::from(decode_word(hex)?))
}

fn decode_v6(hex: &str) -> Result<Ipv6Addr, ProbeError> {
    if hex.len() != 32 {
        return Err(ProbeError::Malformed(format!("IPv6 address `{hex}`")));
    }

    let mut octets = [0u8; 16];
    for (i, chunk) in octets.chunks_exact_mut(4).enumerate() {
        chunk.copy_from_slice(&decode_word(&hex[i * 8..(i + 1) * 8])?);
    }
    Ok(Ipv6Addr::from(octets))
}
