//! Field checks used by `Config::validate`. Each returns the reason a value
//! is rejected.

use std::net::IpAddr;

use url::Url;

/// Endpoint must be an absolute http(s) URL with a host
pub fn validate_http_endpoint(target: &str) -> Result<(), String> {
    if target.trim().is_empty() {
        return Err("endpoint cannot be empty".into());
    }

    let url = Url::parse(target).map_err(|e| {
        if target.contains("://") {
            format!("invalid URL: {e}")
        } else {
            "URL must include scheme (http:// or https://)".to_string()
        }
    })?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(format!("invalid scheme '{other}', must be http or https")),
    }
    if url.host_str().is_none() {
        return Err("URL must have a host".into());
    }
    Ok(())
}

pub fn validate_port(port: u16) -> Result<(), String> {
    match port {
        0 => Err("port must be between 1 and 65535".into()),
        _ => Ok(()),
    }
}

/// Proxy host: an IP address or a plain hostname
pub fn validate_host(host: &str) -> Result<(), String> {
    if host.trim().is_empty() {
        return Err("host cannot be empty".into());
    }
    if host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }

    let well_formed = !host.starts_with('-')
        && !host.ends_with('-')
        && host.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    if well_formed { Ok(()) } else { Err(format!("'{host}' is not an IP address or hostname")) }
}
