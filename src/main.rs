//! Patch Server - command-line supervisor for the code patch server
//!
//! # Overview
//!
//! Runs the patch server for a project directory read from disk. It initializes:
//! - Logging infrastructure (file rotation + console output)
//! - Tokio async runtime (download, subprocess and file I/O)
//! - The host thread for project queries ([`HostThread`])
//! - Settings loading ([`ConfigManager`])
//!
//! # Commands
//!
//! - `run`: start the server, wait for Ctrl-C, stop it
//! - `install`: only provision the server binary, printing download progress
//! - `omitted`: print the modules excluded from patching for the given defines
//!
//! # Configuration Files
//!
//! - `<config dir>/patch-server.yaml`: settings, overridable with `PATCH_SERVER_*`
//!   environment variables
//! - `<project>/patch-server-config.json`: custom server binaries per platform

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};
use patch_server::models::{ActiveDefines, HelperPaths};
use patch_server::services::{BinaryProvisioner, HelperOrchestrator};
use patch_server::{
    APP_NAME, ConfigManager, FileSystemHost, HostThread, Metrics, PlatformBinding, StateManager,
    VERSION,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Provision and supervise the code patch server
#[derive(Parser)]
#[command(name = "patch-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Directory containing patch-server.yaml
    #[arg(long, global = true)]
    config_dir: Option<Utf8PathBuf>,

    /// Directory for log files
    #[arg(long, global = true, default_value = "logs")]
    log_dir: Utf8PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the patch server and keep it running until Ctrl-C
    Run {
        /// Project root directory
        #[arg(short, long, default_value = ".")]
        project: Utf8PathBuf,

        /// Listen on the local network interface instead of localhost only
        #[arg(short, long)]
        expose: bool,

        /// Active define symbols, semicolon separated
        #[arg(long, default_value = "")]
        defines: String,

        /// Selected player build target
        #[arg(long, default_value = "")]
        build_target: String,
    },

    /// Download and install the server binary
    Install {
        /// Project root directory (for the override config)
        #[arg(short, long, default_value = ".")]
        project: Utf8PathBuf,

        /// Install directory (default: the versioned cache directory)
        #[arg(long)]
        target_dir: Option<Utf8PathBuf>,
    },

    /// Print the modules excluded from patching
    Omitted {
        /// Project root directory
        #[arg(short, long, default_value = ".")]
        project: Utf8PathBuf,

        /// Active define symbols, semicolon separated
        #[arg(long, default_value = "")]
        defines: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Guard must stay alive until exit to flush file logs
    let _guard = patch_server::logging::setup_logging_with_console(
        &cli.log_dir,
        patch_server::logging::LOG_PREFIX,
        cli.debug,
        true,
    )?;

    tracing::info!("Starting {} v{}", APP_NAME, VERSION);

    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => default_config_dir()?,
    };
    let config_manager = ConfigManager::new(&config_dir)?;
    let settings = config_manager.load_settings()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("patch-server-worker")
        .build()?;

    let metrics = Arc::new(Metrics::new());

    let result = runtime.block_on(async {
        match cli.command {
            Commands::Run {
                project,
                expose,
                defines,
                build_target,
            } => {
                let expose = expose || settings.expose_to_network;
                cmd_run(&project, &defines, build_target, expose, settings, metrics.clone()).await
            }
            Commands::Install {
                project,
                target_dir,
            } => cmd_install(&project, target_dir, settings, metrics.clone()).await,
            Commands::Omitted { project, defines } => {
                cmd_omitted(&project, &defines, settings, metrics.clone()).await
            }
        }
    });

    metrics.log_summary();
    runtime.shutdown_timeout(std::time::Duration::from_secs(5));

    tracing::info!("Shutdown complete");
    result
}

fn default_config_dir() -> Result<Utf8PathBuf> {
    let dir = dirs::config_dir().context("No configuration directory on this system")?;
    let dir = Utf8PathBuf::from_path_buf(dir)
        .map_err(|p| anyhow::anyhow!("Config directory is not UTF-8: {}", p.display()))?;
    Ok(dir.join(APP_NAME))
}

/// Cancel `token` on Ctrl-C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received");
            token.cancel();
        }
    });
}

fn orchestrator_for(
    host: FileSystemHost,
    settings: patch_server::Settings,
    metrics: Arc<Metrics>,
) -> Result<HelperOrchestrator> {
    let state = Arc::new(StateManager::new());
    let host_thread = Arc::new(HostThread::spawn("patch-server-host")?);
    Ok(HelperOrchestrator::with_defaults(
        Arc::new(host),
        host_thread,
        settings,
        state,
        metrics,
    )?)
}

async fn cmd_run(
    project: &Utf8Path,
    defines: &str,
    build_target: String,
    expose: bool,
    settings: patch_server::Settings,
    metrics: Arc<Metrics>,
) -> Result<()> {
    // Absolute from here on: the solution name comes from the directory name
    let host = FileSystemHost::open(project)?
        .with_defines(ActiveDefines::parse(defines))
        .with_build_target(build_target);
    let project = host.project_dir().to_path_buf();
    let orchestrator = orchestrator_for(host, settings, metrics)?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let pid = orchestrator.start(&project, expose, &cancel).await?;
    println!("Patch server running (pid {}), press Ctrl-C to stop", pid);

    cancel.cancelled().await;
    orchestrator.stop().await;
    Ok(())
}

async fn cmd_install(
    project: &Utf8Path,
    target_dir: Option<Utf8PathBuf>,
    settings: patch_server::Settings,
    metrics: Arc<Metrics>,
) -> Result<()> {
    let project = project
        .canonicalize_utf8()
        .with_context(|| format!("Failed to resolve project directory {}", project))?;
    let target_dir = target_dir.unwrap_or_else(|| {
        HelperPaths::resolve(&project, settings.install_root.as_deref(), &settings.version_slug())
            .executable_target_dir
    });

    let provisioner = BinaryProvisioner::new(&settings, metrics)?;
    let overrides = ConfigManager::load_override_config(&project);

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let mut progress = provisioner.progress().subscribe();
    let printer = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let fraction = *progress.borrow_and_update();
            eprint!("\rDownloading... {:>3.0}%", fraction * 100.0);
        }
    });

    let path = provisioner
        .ensure_installed(PlatformBinding::current(), &target_dir, &overrides, &cancel)
        .await;
    printer.abort();
    eprintln!();

    let path = path?;
    println!("{}", path);
    Ok(())
}

async fn cmd_omitted(
    project: &Utf8Path,
    defines: &str,
    settings: patch_server::Settings,
    metrics: Arc<Metrics>,
) -> Result<()> {
    let host = FileSystemHost::open(project)?.with_defines(ActiveDefines::parse(defines));
    let orchestrator = orchestrator_for(host, settings, metrics)?;
    for name in orchestrator.omitted_modules().await? {
        println!("{}", name);
    }
    Ok(())
}
