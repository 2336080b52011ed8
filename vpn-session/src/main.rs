// VPN Session Daemon

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use vpn_session::{
    commands::{CommandSurface, ConnectReply},
    config::load_config,
    control::ControlServer,
    controller::{ControllerOptions, SessionController},
    platform::{CapabilitySet, FwmarkProtector, SystemInterfaces},
    process_core::ProcessCore,
    state_file::StateFile,
    surface,
    tun_provisioner::IpTunProvisioner,
    types::{AutoConnectConfig, Config, SurfaceKind},
};

#[derive(Parser)]
#[command(name = "vpn-session")]
#[command(about = "Single-session VPN lifecycle daemon", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/vpn-session/config.toml")]
    config: PathBuf,
}

/// Connect once from the `[autoconnect]` section
fn autoconnect(commands: &CommandSurface, auto: &AutoConnectConfig) {
    let payload = match std::fs::read_to_string(&auto.config_path) {
        Ok(payload) => payload,
        Err(e) => {
            log::error!(
                "Autoconnect skipped, cannot read {}: {}",
                auto.config_path.display(),
                e
            );
            return;
        }
    };

    match commands.connect(payload, auto.server_name.clone()) {
        ConnectReply::Accepted => log::info!("Autoconnect requested"),
        ConnectReply::Rejected(reason) => log::warn!("Autoconnect rejected: {}", reason),
    }
}

fn log_config(config: &Config) {
    log::info!(
        "Interface: {} (mtu {}, route table {})",
        config.interface.name,
        config.interface.mtu,
        config.interface.route_table
    );
    log::info!("Engine: {}", config.engine.command.display());
    log::debug!(
        "Stats every {}ms, step timeout {}s",
        config.general.stats_interval_ms,
        config.general.step_timeout_secs
    );
}

fn main() -> Result<()> {
    // 2 threads: one for the session worker, one for control clients and process I/O
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("vpn-session")
        .thread_stack_size(2 * 1024 * 1024)
        .enable_time()
        .enable_io()
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.general.log_level),
    )
    .init();

    log::info!("Starting vpn-session daemon");
    log_config(&config);

    let provisioner =
        IpTunProvisioner::new(config.interface.name.clone(), config.interface.route_table)
            .context("Failed to create interface provisioner")?;
    let core = ProcessCore::new(&config.engine);
    let status_surface = surface::from_config(&config.surface).await;

    let platform = CapabilitySet::new()
        .with_socket_protector(FwmarkProtector::new(config.interface.route_table))
        .with_interface_lister(SystemInterfaces);

    let controller = Arc::new(SessionController::new(
        Arc::new(provisioner),
        Arc::new(core),
        status_surface,
        ControllerOptions {
            stats_interval: Duration::from_millis(config.general.stats_interval_ms),
            step_timeout: Duration::from_secs(config.general.step_timeout_secs),
            platform,
        },
    ));
    let commands = CommandSurface::new(controller.clone(), config.interface.network_params());

    let server = ControlServer::new(&config.control.socket, commands.clone());
    let listener = server.bind()?;
    let socket_path = server.socket_path().to_path_buf();
    let mut server_handle = tokio::spawn(server.serve(listener));

    let state_file = match config.surface.kind {
        SurfaceKind::StateFile => {
            let file = StateFile::new(config.surface.state_file.clone());
            if let Err(e) = file.write_state(controller.status().state, None) {
                log::warn!("Failed to write state file: {:#}", e);
            }
            Some(file)
        }
        _ => None,
    };

    if let Some(auto) = &config.autoconnect {
        autoconnect(&commands, auto);
    }

    log::info!("Daemon started successfully");

    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to set up SIGTERM handler")?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("Failed to set up SIGINT handler")?;

    let outcome = tokio::select! {
        _ = sigterm.recv() => {
            log::info!("Received SIGTERM");
            Ok(())
        }
        _ = sigint.recv() => {
            log::info!("Received SIGINT");
            Ok(())
        }
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => log::error!("Control server exited unexpectedly"),
                Ok(Err(e)) => log::error!("Control server failed: {:#}", e),
                Err(e) => log::error!("Control server task panicked: {}", e),
            }
            Err(anyhow::anyhow!("Control server terminated, aborting daemon for systemd restart"))
        }
    };

    log::info!("Shutting down gracefully...");
    server_handle.abort();
    controller.shutdown().await;

    let _ = std::fs::remove_file(&socket_path);
    if let Some(file) = state_file {
        file.cleanup();
    }

    log::info!("Shutdown complete");
    outcome
}
