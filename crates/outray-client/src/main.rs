//! `outray`
//!
//! Exposes a local HTTP server on a public URL through the Outray tunnel
//! server and keeps the tunnel up until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use outray_client::tunnel::transport::SERVER_STOP_REASON;
use outray_client::tunnel::{
    RequestInfo, ShadowConfig, ShadowDiff, TunnelClient, TunnelConfig, TunnelHooks,
};
use outray_core::config::{LoadedConfig, find_config_file, load_config};
use outray_core::tracing_init::{default_filter, init_tracing};
use outray_proto::TunnelProtocol;

#[derive(Parser, Debug)]
#[command(name = "outray")]
#[command(version, about = "Expose a local server through an Outray tunnel")]
struct Args {
    /// Local port to expose (overrides the config file)
    port: Option<u16>,

    /// Host the local server listens on
    #[arg(long)]
    host: Option<String>,

    /// Tunnel server WebSocket URL
    #[arg(long, env = "OUTRAY_SERVER_URL")]
    server_url: Option<String>,

    /// API key used to authenticate the tunnel
    #[arg(long, env = "OUTRAY_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Subdomain to request
    #[arg(long, env = "OUTRAY_SUBDOMAIN")]
    subdomain: Option<String>,

    /// Custom domain to serve instead of a subdomain
    #[arg(long)]
    domain: Option<String>,

    /// Tunnel protocol (http, tcp, udp)
    #[arg(long)]
    protocol: Option<TunnelProtocol>,

    /// Port to expose on the server for tcp/udp tunnels
    #[arg(long)]
    remote_port: Option<u16>,

    /// IP or CIDR range allowed to reach the tunnel (repeatable)
    #[arg(long = "allow-ip", value_name = "IP")]
    allow_ip: Vec<String>,

    /// Config file (defaults to ./outray.toml when present)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Tunnel to run from the config file
    #[arg(long, short = 't')]
    tunnel: Option<String>,

    /// Mirror requests to a second local server on this port and log
    /// responses that differ
    #[arg(long, env = "OUTRAY_SHADOW_PORT")]
    shadow_port: Option<u16>,

    /// Host of the shadow server
    #[arg(long, default_value = "localhost", requires = "shadow_port")]
    shadow_host: String,

    /// Fraction of requests to mirror (0.0 - 1.0)
    #[arg(long, default_value_t = 1.0, requires = "shadow_port")]
    shadow_sample_rate: f64,

    /// Response header to compare with the shadow response (repeatable)
    #[arg(long = "shadow-header", value_name = "NAME", requires = "shadow_port")]
    shadow_headers: Vec<String>,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long, default_value = "info", env = "OUTRAY_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation)
    #[arg(long, env = "OUTRAY_LOG_JSON")]
    log_json: bool,
}

/// Hooks that report tunnel events through tracing.
struct LoggingHooks;

impl TunnelHooks for LoggingHooks {
    fn on_tunnel_ready(&self, url: &str, port: Option<u16>) {
        match port {
            Some(port) => info!(url, port, "Tunnel online"),
            None => info!(url, "Tunnel online"),
        }
    }

    fn on_request(&self, info: &RequestInfo) {
        let duration_ms = info.duration.as_millis();
        match &info.error {
            Some(err) => warn!(
                method = %info.method,
                path = %info.path,
                status = info.status_code,
                duration_ms,
                error = %err,
                "Request failed"
            ),
            None => info!(
                method = %info.method,
                path = %info.path,
                status = info.status_code,
                duration_ms,
                "Request"
            ),
        }
    }

    fn on_error(&self, message: &str, code: &str) {
        error!(code, message, "Tunnel error");
    }

    fn on_reconnecting(&self, attempt: u32, delay: Duration) {
        warn!(attempt, delay_ms = delay.as_millis(), "Connection lost, reconnecting");
    }

    fn on_shadow_diff(&self, diff: &ShadowDiff) {
        warn!(
            request_id = %diff.request_id,
            method = %diff.method,
            path = %diff.path,
            primary_status = ?diff.primary.status_code,
            shadow_status = ?diff.shadow.status_code,
            body_differs = diff.differences.body,
            headers = ?diff.differences.headers,
            shadow_error = diff.shadow.error.as_deref().unwrap_or(""),
            "Shadow response differs"
        );
    }

    fn on_close(&self, reason: &str) {
        info!(reason, "Tunnel closed");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_tracing(&default_filter(&args.log_level), args.log_json)?;

    let config = resolve_config(&args)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        server_url = %config.server_url,
        local = %config.local_base_url(),
        protocol = %config.protocol,
        "Starting outray"
    );

    let client = TunnelClient::new(config, Arc::new(LoggingHooks))?;
    client.start().await?;

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
        () = client.wait_closed() => {}
    }

    let closed_by_server = client.close_reason();
    client.stop().await;

    match closed_by_server {
        Some(reason) if reason == SERVER_STOP_REASON => {
            info!("Tunnel stopped from the dashboard");
            Ok(())
        }
        Some(reason) => anyhow::bail!("Tunnel closed: {reason}"),
        None => {
            info!("outray stopped");
            Ok(())
        }
    }
}

/// Merge the config file (if any) with CLI arguments and environment.
fn resolve_config(args: &Args) -> anyhow::Result<TunnelConfig> {
    let loaded = match &args.config {
        Some(path) => Some(load_config(path)?),
        None => find_config_file(&std::env::current_dir()?)
            .map(|path| load_config(&path))
            .transpose()?,
    };

    let mut config = TunnelConfig::new(0);
    if let Some(loaded) = &loaded {
        apply_file(&mut config, loaded, args)?;
    } else if args.tunnel.is_some() {
        anyhow::bail!("--tunnel requires a config file");
    }

    if let Some(port) = args.port {
        config.local_port = port;
    }
    if let Some(host) = &args.host {
        config.local_host.clone_from(host);
    }
    if let Some(url) = &args.server_url {
        config.server_url.clone_from(url);
    }
    if args.api_key.is_some() {
        config.api_key.clone_from(&args.api_key);
    }
    if args.subdomain.is_some() {
        config.subdomain.clone_from(&args.subdomain);
    }
    if args.domain.is_some() {
        config.custom_domain.clone_from(&args.domain);
    }
    if let Some(protocol) = args.protocol {
        config.protocol = protocol;
    }
    if args.remote_port.is_some() {
        config.remote_port = args.remote_port;
    }
    if !args.allow_ip.is_empty() {
        config.ip_allowlist.clone_from(&args.allow_ip);
    }
    if let Some(port) = args.shadow_port {
        if !(0.0..=1.0).contains(&args.shadow_sample_rate) {
            anyhow::bail!("--shadow-sample-rate must be between 0.0 and 1.0");
        }
        let mut shadow = ShadowConfig::new(port);
        shadow.host.clone_from(&args.shadow_host);
        shadow.sample_rate = args.shadow_sample_rate;
        shadow.compare_headers.clone_from(&args.shadow_headers);
        config.shadow = Some(shadow);
    }

    if config.local_port == 0 {
        anyhow::bail!("No local port given: pass one or define a tunnel in outray.toml");
    }
    Ok(config)
}

/// Global settings always apply; a tunnel entry applies unless only a port
/// was given on the command line.
fn apply_file(config: &mut TunnelConfig, loaded: &LoadedConfig, args: &Args) -> anyhow::Result<()> {
    if let Some(url) = &loaded.global.server_url {
        config.server_url.clone_from(url);
    }
    if args.port.is_some() && args.tunnel.is_none() && args.config.is_none() {
        return Ok(());
    }

    let tunnel = loaded.select(args.tunnel.as_deref())?;
    info!(tunnel = %tunnel.name, "Using tunnel from config file");
    config.local_port = tunnel.local_port;
    config.local_host.clone_from(&tunnel.local_host);
    config.protocol = tunnel.protocol;
    config.subdomain.clone_from(&tunnel.subdomain);
    config.custom_domain.clone_from(&tunnel.custom_domain);
    config.remote_port = tunnel.remote_port;
    Ok(())
}
