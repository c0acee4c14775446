//! kvmdeck daemon
//!
//! Drives a local libvirt daemon: machine synthesis, device changes,
//! snapshots, telemetry and browser consoles over one supervised session.

use clap::Parser;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod clone;
mod config;
mod devices;
mod fragments;
mod host;
mod hypervisor;
mod images;
mod libvirt;
mod machines;
mod networks;
mod saga;
mod session;
mod slots;
mod snapshots;
mod storage;
mod synth;
mod telemetry;

#[cfg(test)]
mod fake;

use config::DaemonConfig;

#[derive(Parser)]
#[command(name = "kvmdeckd")]
#[command(about = "kvmdeck daemon - KVM host control plane over libvirt")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/kvmdeck/config.toml")]
    config: PathBuf,

    /// HTTP listen address, overrides the configuration file
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Write the effective configuration to the config path and exit
    #[arg(long)]
    init_config: bool,
}

fn init_logging(debug: bool, format: &str) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Wait for `stop` or for the server to end on its own, then cancel and
/// collect the server's outcome after its graceful shutdown
async fn supervise<F>(mut api: JoinHandle<anyhow::Result<()>>, stop: F, shutdown: &CancellationToken) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    let finished = tokio::select! {
        _ = stop => {
            info!("Received shutdown signal");
            None
        }
        result = &mut api => Some(result),
    };
    shutdown.cancel();
    let result = match finished {
        Some(result) => result,
        None => api.await,
    };
    result?
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = DaemonConfig::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }

    init_logging(cli.debug, &config.log_format);
    info!("kvmdeck daemon v{}", env!("CARGO_PKG_VERSION"));

    if cli.init_config {
        config.save(&cli.config)?;
        info!("Wrote configuration to {}", cli.config.display());
        return Ok(());
    }

    let addr: SocketAddr = config.listen.parse()?;

    // One supervised transport shared by every component
    let connector = Arc::new(libvirt::LibvirtConnector::new(config.hypervisor.clone()));
    let session = session::Session::new(connector, config.hypervisor.connect_timeout());
    match session.acquire().await {
        Ok(_) => info!("Connected to {}", config.hypervisor.uri),
        Err(e) => warn!("Hypervisor not reachable yet: {}", e),
    }

    let host_cpu = telemetry::HostCpuCache::default();
    let guest_usage = telemetry::GuestUsageCache::default();
    let cloner: Arc<dyn clone::Cloner> = Arc::new(clone::VirtClone::new(
        config.clone.binary.clone(),
        config.hypervisor.uri.clone(),
    ));
    let images = Arc::new(images::QemuImg::new(config.storage.qemu_img_binary.clone()));

    let state = Arc::new(api::AppState {
        machines: machines::Machines::new(
            session.clone(),
            config.storage.clone(),
            guest_usage.clone(),
            cloner.clone(),
        ),
        synth: synth::Synthesizer::new(session.clone(), config.storage.clone(), images),
        devices: devices::DeviceEngine::new(session.clone(), config.storage.clone()),
        snapshots: snapshots::Snapshots::new(session.clone(), cloner),
        host: host::HostInspector::new(session.clone(), config.telemetry.proc_root.clone(), host_cpu.clone()),
        networks: networks::Networks::new(session.clone(), config.hypervisor.lease_dir.clone()),
        storage: storage::Storage::new(session.clone(), config.storage.clone()),
    });

    let shutdown = CancellationToken::new();

    let sampler = telemetry::TelemetrySampler::new(
        session.clone(),
        config.telemetry.clone(),
        host_cpu,
        guest_usage,
    );
    let sampler_handle = tokio::spawn(sampler.run(shutdown.clone()));
    let api_handle = tokio::spawn(api::serve(addr, state, shutdown.clone()));

    info!("Daemon started on {}", addr);

    let stop = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for the shutdown signal: {}", e);
        }
    };
    if let Err(e) = supervise(api_handle, stop, &shutdown).await {
        error!("HTTP server error: {}", e);
    }
    if let Err(e) = sampler_handle.await {
        error!("Telemetry sampler failed: {}", e);
    }
    session.close().await;

    info!("Daemon shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_supervise_reports_errors_from_graceful_shutdown() {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let api = tokio::spawn(async move {
            token.cancelled().await;
            Err(anyhow::anyhow!("listener closed mid-drain"))
        });
        let err = supervise(api, async {}, &shutdown).await.unwrap_err();
        assert!(err.to_string().contains("mid-drain"));
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_supervise_returns_when_server_exits() {
        let shutdown = CancellationToken::new();
        let api = tokio::spawn(async { Ok(()) });
        supervise(api, std::future::pending(), &shutdown).await.unwrap();
        assert!(shutdown.is_cancelled());
    }
}
