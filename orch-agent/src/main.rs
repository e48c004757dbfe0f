// Orchestrator device agent: bootstrap discovery, command dispatcher, config and log transfer.

mod agent;
mod config;
mod discovery;
mod dispatcher;
mod host;
mod logging;
mod settings;
mod transfer;
mod transport;
mod update;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::UdpSocket;
use tracing::{info, warn};

use crate::agent::Agent;
use crate::config::Config;
use crate::dispatcher::Exit;
use crate::logging::DeviceLog;
use crate::settings::Settings;
use crate::update::{NoUpdateSource, UpdateEngine, UpdateSignal};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("orch-agent {}", VERSION);
            return Ok(());
        }
    }

    let cfg = config::load();
    logging::init(&cfg.log, &cfg.log_path()).context("logging setup")?;
    info!(
        version = VERSION,
        port = cfg.port,
        data_dir = %cfg.data_dir.display(),
        "orch-agent starting"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let signal = UpdateSignal::new();
        let engine: Arc<dyn UpdateEngine> = Arc::new(NoUpdateSource);
        tokio::spawn(update::run_poller(
            signal.clone(),
            engine,
            Duration::from_millis(cfg.update_poll_ms),
        ));
        tokio::select! {
            r = serve(&cfg, signal) => r,
            r = shutdown_signal() => {
                info!("shutting down");
                r
            }
        }
    })
}

/// Load, bootstrap, listen; a restart request starts the cycle over.
async fn serve(cfg: &Config, signal: UpdateSignal) -> anyhow::Result<()> {
    loop {
        let settings = match Settings::load(cfg.settings_path()) {
            Ok(s) => s,
            Err(e) => {
                warn!("settings unreadable, using factory defaults: {}", e);
                Settings::defaults(cfg.settings_path())
            }
        };
        let mut agent = Agent::new(
            settings,
            host::identity(cfg),
            DeviceLog::new(cfg.log_path()),
            signal.clone(),
            cfg.timeouts(),
        );
        agent.bootstrap(&cfg.broadcast, cfg.port).await;
        info!(assigned = agent.coordinator().record().assigned, "bootstrap complete");

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, cfg.port))
            .await
            .with_context(|| format!("bind UDP port {}", cfg.port))?;
        info!(addr = %socket.local_addr()?, "listening for commands");
        match dispatcher::run(&socket, &mut agent).await {
            Exit::Restart => {}
        }
        drop(socket);
        info!(delay_ms = cfg.restart_delay_ms, "restarting");
        tokio::time::sleep(Duration::from_millis(cfg.restart_delay_ms)).await;
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
