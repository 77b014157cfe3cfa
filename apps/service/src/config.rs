use std::{env, fmt, fs, path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::validation::{validate_host, validate_http_endpoint, validate_port};

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read {0}")]
    ReadFailed(path::PathBuf, #[source] std::io::Error),
    #[error("failed to write {0}")]
    WriteFailed(path::PathBuf, #[source] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseFailed(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
    #[error("no config path: neither XDG_CONFIG_HOME nor HOME is set")]
    ConfigPathUnavailable,
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub retry: RetryConfig,
    pub anonymity: AnonymityConfig,
    pub killswitch: KillSwitchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub base_interval_secs: u64,
    pub max_interval_secs: u64,
    pub load_threshold: f64,
    pub load_cache_secs: u64,
    pub check_timeout_secs: u64,
    pub workers: usize,
    pub skip_poll_cap_secs: u64,
    pub jitter_cap_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_interval_secs: 30,
            max_interval_secs: 120,
            load_threshold: 0.8,
            load_cache_secs: 5,
            check_timeout_secs: 30,
            workers: 3,
            skip_poll_cap_secs: 10,
            jitter_cap_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: 3, delay_secs: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnonymityConfig {
    pub socks_host: String,
    pub socks_port: u16,
    pub dns_port: u16,
    /// Verification endpoints, tried in order
    pub check_urls: Vec<String>,
    pub address_url: String,
    pub leak_test_domain: String,
    pub probe_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for AnonymityConfig {
    fn default() -> Self {
        Self {
            socks_host: "127.0.0.1".into(),
            socks_port: 9050,
            dns_port: 5353,
            check_urls: vec![
                "https://check.torproject.org/api/ip".into(),
                "https://api.onionoo.torproject.org/details?type=client".into(),
            ],
            address_url: "https://api.ipify.org".into(),
            leak_test_domain: "check.torproject.org".into(),
            probe_timeout_secs: 10,
            user_agent: "curl/7.68.0".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KillSwitchConfig {
    /// Log firewall commands instead of running them
    pub dry_run: bool,
    pub command_timeout_secs: u64,
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self { dry_run: false, command_timeout_secs: 5 }
    }
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

/// Get default config path ($XDG_CONFIG_HOME/anonwatch/config.toml or
/// $HOME/.config/...)
fn default_config_path() -> Result<path::PathBuf, Error> {
    let path = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
        path::PathBuf::from(config_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".config")
    } else {
        return Err(Error::ConfigPathUnavailable);
    };

    Ok(path.join("anonwatch/config.toml"))
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
                writeln!(f, "  {:indent$}{}: {}", "", label, value, indent = level * 2)
            }
        };
        let write_title_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str| {
                writeln!(f, "{:indent$}{}", "", label, indent = level * 2)
            }
        };

        let write_title_1 = write_title_indented(1);
        let write_1 = write_indented(1);

        writeln!(f, "Current Internal Configuration State:")?;
        write_title_1(f, "Engine")?;
        write_1(f, "Base Interval (s)", &self.engine.base_interval_secs)?;
        write_1(f, "Max Interval (s)", &self.engine.max_interval_secs)?;
        write_1(f, "Load Threshold", &self.engine.load_threshold)?;
        write_1(f, "Check Timeout (s)", &self.engine.check_timeout_secs)?;
        write_1(f, "Workers", &self.engine.workers)?;
        write_title_1(f, "Retry")?;
        write_1(f, "Max Retries", &self.retry.max_retries)?;
        write_1(f, "Delay (s)", &self.retry.delay_secs)?;
        write_title_1(f, "Anonymity Layer")?;
        let proxy = format!("{}:{}", self.anonymity.socks_host, self.anonymity.socks_port);
        write_1(f, "SOCKS Proxy", &proxy)?;
        write_1(f, "DNS Port", &self.anonymity.dns_port)?;
        write_1(f, "Check URLs", &self.anonymity.check_urls.join(", "))?;
        write_1(f, "Address URL", &self.anonymity.address_url)?;
        write_1(f, "Leak Test Domain", &self.anonymity.leak_test_domain)?;
        write_title_1(f, "Kill Switch")?;
        write_1(f, "Dry Run", &self.killswitch.dry_run)?;

        Ok(())
    }
}

impl Config {
    /// Generate Config structure from file
    ///
    /// Creates a default config in ~/.config/anonwatch/config.toml
    ///  or the specified path, with the name config.toml if one does not exist
    ///
    /// ```rust,ignore
    /// let cfg = config::Config::from_config(None::<&path::Path>)?;
    /// println!("{}", cfg);
    /// ```
    pub fn from_config(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, Error> {
        let config_path: path::PathBuf = if let Some(path) = optional_path {
            normalize_toml_path(path.as_ref())
        } else {
            default_config_path()?
        };

        let config = if config_path.exists() {
            let raw_string = fs::read_to_string(&config_path)
                .map_err(|err| Error::ReadFailed(config_path.clone(), err))?;
            toml::from_str(raw_string.as_str())?
        } else {
            let config = Self::default();
            config.write_config(&config_path)?;
            config
        };

        config.validate()?;
        Ok(config)
    }

    /// Serialize and write a config to a file
    pub fn write_config(&self, path: &std::path::Path) -> Result<(), Error> {
        let config_str: String = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| Error::WriteFailed(parent.to_path_buf(), err))?;
        }

        std::fs::write(path, config_str).map_err(|err| Error::WriteFailed(path.to_path_buf(), err))
    }

    pub fn validate(&self) -> Result<(), Error> {
        let engine = &self.engine;
        if engine.base_interval_secs == 0 {
            return Err(Error::Invalid("engine.base_interval_secs must be positive".into()));
        }
        if engine.base_interval_secs > engine.max_interval_secs {
            return Err(Error::Invalid(format!(
                "engine.base_interval_secs ({}) exceeds engine.max_interval_secs ({})",
                engine.base_interval_secs, engine.max_interval_secs
            )));
        }
        if !(0.0..=1.0).contains(&engine.load_threshold) {
            return Err(Error::Invalid("engine.load_threshold must be within [0, 1]".into()));
        }
        if engine.workers == 0 {
            return Err(Error::Invalid("engine.workers must be at least 1".into()));
        }
        if engine.check_timeout_secs == 0 {
            return Err(Error::Invalid("engine.check_timeout_secs must be positive".into()));
        }
        if self.retry.max_retries == 0 {
            return Err(Error::Invalid("retry.max_retries must be at least 1".into()));
        }

        let anonymity = &self.anonymity;
        if anonymity.check_urls.is_empty() {
            return Err(Error::Invalid(
                "anonymity.check_urls must list at least one endpoint".into(),
            ));
        }
        for url in anonymity.check_urls.iter().chain(std::iter::once(&anonymity.address_url)) {
            validate_http_endpoint(url).map_err(|e| Error::Invalid(format!("{url}: {e}")))?;
        }
        validate_host(&anonymity.socks_host)
            .map_err(|e| Error::Invalid(format!("anonymity.socks_host: {e}")))?;
        let ports = [
            ("anonymity.socks_port", anonymity.socks_port),
            ("anonymity.dns_port", anonymity.dns_port),
        ];
        for (label, port) in ports {
            validate_port(port).map_err(|e| Error::Invalid(format!("{label}: {e}")))?;
        }
        if anonymity.leak_test_domain.trim().is_empty() {
            return Err(Error::Invalid("anonymity.leak_test_domain must not be empty".into()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_match_reference_constants() {
        let config = Config::default();
        assert_eq!(config.engine.base_interval_secs, 30);
        assert_eq!(config.engine.max_interval_secs, 120);
        assert_eq!(config.engine.workers, 3);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.anonymity.socks_port, 9050);
        assert_eq!(config.anonymity.dns_port, 5353);
        assert_eq!(config.anonymity.check_urls.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_is_created_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/anonwatch");

        let config = Config::from_config(Some(&path)).unwrap();
        assert_eq!(config.engine.base_interval_secs, 30);
        assert!(dir.path().join("nested/anonwatch.toml").exists());
    }

    #[test]
    fn test_partial_file_fills_in_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let partial = "[engine]\nbase_interval_secs = 45\n\n[killswitch]\ndry_run = true\n";
        fs::write(&path, partial).unwrap();

        let config = Config::from_config(Some(&path)).unwrap();
        assert_eq!(config.engine.base_interval_secs, 45);
        assert_eq!(config.engine.max_interval_secs, 120);
        assert!(config.killswitch.dry_run);
        assert_eq!(config.anonymity.socks_port, 9050);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config::default();
        config.engine.base_interval_secs = 200;
        assert!(matches!(config.validate(), Err(Error::Invalid(_))));

        let mut config = Config::default();
        config.anonymity.check_urls = vec!["ftp://example.com".into()];
        assert!(matches!(config.validate(), Err(Error::Invalid(_))));

        let mut config = Config::default();
        config.engine.load_threshold = 1.5;
        assert!(matches!(config.validate(), Err(Error::Invalid(_))));

        let mut config = Config::default();
        config.anonymity.dns_port = 0;
        assert!(matches!(config.validate(), Err(Error::Invalid(_))));

        let mut config = Config::default();
        config.anonymity.socks_host = "bad host".into();
        let Err(Error::Invalid(reason)) = config.validate() else { panic!("host accepted") };
        assert!(reason.starts_with("anonymity.socks_host: "), "{reason}");
        assert!(reason.contains("not an IP address or hostname"), "{reason}");
    }

    #[test]
    fn test_garbage_file_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "engine = [").unwrap();
        assert!(matches!(Config::from_config(Some(&path)), Err(Error::ParseFailed(_))));
    }

    #[test]
    fn test_display_lists_sections() {
        let rendered = Config::default().to_string();
        assert!(rendered.contains("Engine"));
        assert!(rendered.contains("127.0.0.1:9050"));
        assert!(rendered.contains("Dry Run: false"));
    }
}
