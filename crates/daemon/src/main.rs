// hardshare daemon — on-device client for a platform that shares
// physical hardware with remote users. Starts the control channel to
// the coordinator and the local admin socket, installs termination
// signal handling, and joins everything on shutdown.

mod admin_socket;
mod config;
mod control_channel;
mod instance;
mod permissions;
mod pidfile;
mod subprocess;
mod tunnel;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use admin_socket::AdminSocket;
use config::DaemonConfig;
use control_channel::ControlChannel;
use subprocess::{ProcessSubprocessAdapter, SubprocessAdapter};

/// hardshare daemon: advertises this workspace's availability to the
/// coordinator and provisions sandboxes for incoming instance launches.
///
/// Configuration-file layout, credential storage, and CLI argument
/// conventions for the operator-facing tool are out of this binary's
/// scope; it only consumes an already-produced descriptor.
#[derive(Parser, Debug)]
#[command(name = "hardshare-daemon", version, about)]
struct Cli {
    /// Path to this workspace's daemon configuration (TOML).
    #[arg(long)]
    config: PathBuf,

    /// Container runtime binary to invoke for sandbox operations.
    #[arg(long, default_value = "docker")]
    runtime: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    permissions::set_restrictive_umask();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hardshare_daemon=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => {
            info!("hardshare daemon shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("hardshare daemon exiting: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    info!("hardshare daemon starting (config: {})", cli.config.display());

    let config = DaemonConfig::load(&cli.config)?;
    let workspace_id = config.workspace.id.clone();
    let group_access = config.group_access;

    // One daemon per workspace at a time; fails fast with a clear error
    // (exit code 1) if another is already running for this id.
    let _pid_guard = pidfile::PidFileGuard::create(&workspace_id)?;

    let work_dir = config::runtime_dir()?.join("work").join(&workspace_id);
    permissions::ensure_directory_with_permissions(&work_dir, group_access)?;

    let subprocess: Arc<dyn SubprocessAdapter> =
        Arc::new(ProcessSubprocessAdapter::new(cli.runtime.clone(), work_dir));
    let control = Arc::new(ControlChannel::new(Arc::new(config), subprocess));

    let socket_path = config::admin_socket_path(&workspace_id)?;
    let admin = AdminSocket::bind(socket_path, group_access)?;

    // The single cancellation token shared by the control channel, the
    // admin socket, and the termination-signal handler. Cancelling it
    // anywhere is the one supported shutdown path.
    let cancel = CancellationToken::new();

    let signal_cancel = cancel.clone();
    let termination_signal = install_termination_signal()?;
    tokio::spawn(async move {
        termination_signal.await;
        info!("termination signal received; shutting down");
        signal_cancel.cancel();
    });

    let control_task = {
        let control = control.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { control.run(cancel).await })
    };

    let admin_task = {
        let control = control.clone();
        let cancel = cancel.clone();
        tokio::spawn(admin.run(control, cancel))
    };

    let control_result = control_task.await;
    if let Err(join_err) = admin_task.await {
        error!("admin socket task panicked: {}", join_err);
    }

    // Best-effort teardown of any Instance still live when shutdown was
    // requested, whether that came from a signal or an admin TERMINATE.
    control.destroy_current().await;

    match control_result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(anyhow!("control channel terminated: {}", e)),
        Err(join_err) => Err(anyhow!("control channel task panicked: {}", join_err)),
    }
}

/// Installs the platform's termination signal handler(s) up front, so a
/// failure to do so is reported through the ordinary `Result` path
/// instead of panicking once shutdown is already underway.
#[cfg(unix)]
fn install_termination_signal() -> Result<impl std::future::Future<Output = ()>> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    Ok(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    })
}

#[cfg(not(unix))]
fn install_termination_signal() -> Result<impl std::future::Future<Output = ()>> {
    Ok(async {
        let _ = tokio::signal::ctrl_c().await;
    })
}
