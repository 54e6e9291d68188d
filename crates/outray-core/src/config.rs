//! `outray.toml` configuration file.
//!
//! A file declares one or more named tunnels plus optional global settings:
//!
//! ```toml
//! [global]
//! server_url = "wss://api.outray.dev/"
//!
//! [tunnel.web]
//! protocol = "http"
//! local_port = 3000
//! subdomain = "acme-web"
//!
//! [tunnel.db]
//! protocol = "tcp"
//! local_port = 5432
//! remote_port = 15432
//! ```
//!
//! Resolution order for the binary is: built-in defaults, then this file,
//! then environment variables, then CLI arguments (highest priority).
//!
//! An `org` key is accepted in `[global]` and in tunnel entries so files
//! shared with the dashboard tooling still load. It selects an organization
//! for account login, which the tunnel connection does not use, so it is
//! discarded.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use outray_proto::TunnelProtocol;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Default file name looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "outray.toml";

/// Default host the local server is reached on.
pub const DEFAULT_LOCAL_HOST: &str = "localhost";

/// `[global]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalConfig {
    pub server_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGlobal {
    server_url: Option<String>,
    #[serde(default, rename = "org")]
    _org: Option<String>,
}

/// Raw `[tunnel.<name>]` entry before validation.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct TunnelEntry {
    protocol: Option<TunnelProtocol>,
    local_port: Option<i64>,
    local_host: Option<String>,
    subdomain: Option<String>,
    custom_domain: Option<String>,
    remote_port: Option<i64>,
    #[serde(default, rename = "org")]
    _org: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    global: Option<RawGlobal>,
    #[serde(default)]
    tunnel: BTreeMap<String, TunnelEntry>,
}

/// A validated tunnel definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTunnel {
    pub name: String,
    pub protocol: TunnelProtocol,
    pub local_port: u16,
    pub local_host: String,
    pub subdomain: Option<String>,
    pub custom_domain: Option<String>,
    pub remote_port: Option<u16>,
}

/// Result of loading a config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedConfig {
    /// Tunnels sorted by name.
    pub tunnels: Vec<ParsedTunnel>,
    pub global: GlobalConfig,
}

impl LoadedConfig {
    /// Pick the tunnel to run: the named one, or the only one defined.
    pub fn select(&self, name: Option<&str>) -> Result<&ParsedTunnel> {
        match name {
            Some(name) => self
                .tunnels
                .iter()
                .find(|t| t.name == name)
                .ok_or_else(|| Error::Config(format!("No tunnel named \"{name}\" in config"))),
            None => match self.tunnels.as_slice() {
                [only] => Ok(only),
                _ => Err(Error::Config(format!(
                    "Config defines {} tunnels; choose one with --tunnel ({})",
                    self.tunnels.len(),
                    self.tunnels
                        .iter()
                        .map(|t| t.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))),
            },
        }
    }
}

/// Path of `outray.toml` in `dir`, if the file exists.
pub fn find_config_file(dir: &Path) -> Option<PathBuf> {
    let path = dir.join(DEFAULT_CONFIG_FILE);
    path.is_file().then_some(path)
}

/// Read and validate a config file.
pub fn load_config(path: &Path) -> Result<LoadedConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    parse_config(&content)
}

/// Parse and validate config file contents. All validation problems are
/// reported together, one per line.
pub fn parse_config(content: &str) -> Result<LoadedConfig> {
    let raw: RawConfig = toml::from_str(content)?;
    let global = GlobalConfig {
        server_url: raw.global.unwrap_or_default().server_url,
    };

    let mut problems = Vec::new();
    if let Some(url) = &global.server_url
        && !(url.starts_with("ws://") || url.starts_with("wss://"))
    {
        problems.push(
            "global.server_url: must be a valid WebSocket URL (ws:// or wss://)".to_string(),
        );
    }
    if raw.tunnel.is_empty() {
        problems.push("No tunnels defined in config file".to_string());
    }

    let mut tunnels = Vec::with_capacity(raw.tunnel.len());
    for (name, entry) in raw.tunnel {
        match validate_tunnel(&name, entry) {
            Ok(tunnel) => tunnels.push(tunnel),
            Err(errs) => problems.extend(errs.into_iter().map(|e| format!("Tunnel \"{name}\": {e}"))),
        }
    }

    if problems.is_empty() {
        Ok(LoadedConfig { tunnels, global })
    } else {
        Err(Error::Config(problems.join("\n")))
    }
}

fn validate_port(value: i64, label: &str) -> std::result::Result<u16, String> {
    u16::try_from(value)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| format!("{label} must be between 1 and 65535"))
}

fn validate_tunnel(
    name: &str,
    entry: TunnelEntry,
) -> std::result::Result<ParsedTunnel, Vec<String>> {
    let mut errs = Vec::new();

    let protocol = entry.protocol.unwrap_or_else(|| {
        errs.push("Protocol is required (must be http, tcp, or udp)".to_string());
        TunnelProtocol::Http
    });

    let local_port = match entry.local_port {
        Some(p) => validate_port(p, "Local port").unwrap_or_else(|e| {
            errs.push(e);
            0
        }),
        None => {
            errs.push("Local port is required".to_string());
            0
        }
    };

    let remote_port = entry.remote_port.and_then(|p| {
        validate_port(p, "Remote port")
            .map_err(|e| errs.push(e))
            .ok()
    });

    match protocol {
        TunnelProtocol::Http => {
            if entry.remote_port.is_some() {
                errs.push(
                    "remote port is not valid for HTTP tunnels. HTTP tunnels use URLs, not ports."
                        .to_string(),
                );
            }
        }
        TunnelProtocol::Tcp | TunnelProtocol::Udp => {
            let upper = protocol.as_str().to_ascii_uppercase();
            if entry.subdomain.is_some() {
                errs.push(format!(
                    "subdomain is not valid for {upper} tunnels. {upper} tunnels use ports, not subdomains."
                ));
            }
            if entry.custom_domain.is_some() {
                errs.push(format!(
                    "custom domain is not valid for {upper} tunnels. {upper} tunnels use ports, not domains."
                ));
            }
        }
    }

    if !errs.is_empty() {
        return Err(errs);
    }

    Ok(ParsedTunnel {
        name: name.to_string(),
        protocol,
        local_port,
        local_host: entry
            .local_host
            .unwrap_or_else(|| DEFAULT_LOCAL_HOST.to_string()),
        subdomain: entry.subdomain,
        custom_domain: entry.custom_domain,
        remote_port,
    })
}
