//! Start/stop/restart of the patch server for one project.
//!
//! Host queries run on the host thread, file writes on the worker pool, then
//! the binary is provisioned and the process launched. Calls are expected to
//! be made sequentially by the caller; concurrent starts are tolerated (the
//! install is race-safe, the controller keeps the last handle) but not
//! serialized here.

use crate::config::ConfigManager;
use crate::host::{HostProject, PlayerData};
use crate::metrics::Metrics;
use crate::models::{ActiveDefines, CliArguments, HelperPaths, ModuleCatalog, Settings, StartArgs};
use crate::scheduler::{HostThread, SchedulerError, run_on_worker};
use crate::services::omission::ModuleOmissionResolver;
use crate::services::process::{ProcessController, StartError};
use crate::services::provisioner::{BinaryProvisioner, ProvisionError};
use crate::state::StateManager;
use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub const PLAYER_DATA_FILE: &str = "playerdata.json";
pub const SYSTEM_ASSEMBLIES_FILE: &str = "systemAssemblies.json";

/// Errors surfaced by [`HelperOrchestrator::start`]
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("server directory not found")]
    ServerDirNotFound,

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Start(#[from] StartError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Prepare(#[from] anyhow::Error),
}

/// Host state gathered on the host thread before a start
#[derive(Debug)]
struct HostSnapshot {
    solution_path: Utf8PathBuf,
    solution_exists: bool,
    catalog: ModuleCatalog,
    defines: ActiveDefines,
    build_target: String,
    system_assembly_dirs: Vec<Utf8PathBuf>,
    server_dir: Option<Utf8PathBuf>,
}

/// Drives the patch server lifecycle for a project.
pub struct HelperOrchestrator {
    host: Arc<dyn HostProject>,
    host_thread: Arc<HostThread>,
    settings: Settings,
    resolver: ModuleOmissionResolver,
    provisioner: BinaryProvisioner,
    controller: ProcessController,
    state: Arc<StateManager>,
}

impl HelperOrchestrator {
    pub fn new(
        host: Arc<dyn HostProject>,
        host_thread: Arc<HostThread>,
        settings: Settings,
        provisioner: BinaryProvisioner,
        controller: ProcessController,
        state: Arc<StateManager>,
    ) -> Self {
        Self {
            host,
            host_thread,
            settings,
            resolver: ModuleOmissionResolver::new(),
            provisioner,
            controller,
            state,
        }
    }

    /// Build an orchestrator with the HTTP provisioner and a controller for
    /// the current platform.
    pub fn with_defaults(
        host: Arc<dyn HostProject>,
        host_thread: Arc<HostThread>,
        settings: Settings,
        state: Arc<StateManager>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, reqwest::Error> {
        let provisioner = BinaryProvisioner::new(&settings, metrics.clone())?;
        let controller = ProcessController::new(
            crate::platform::PlatformBinding::current(),
            &settings,
            metrics,
        )?;
        Ok(Self::new(host, host_thread, settings, provisioner, controller, state))
    }

    pub fn controller(&self) -> &ProcessController {
        &self.controller
    }

    pub fn provisioner(&self) -> &BinaryProvisioner {
        &self.provisioner
    }

    /// Prepare the project, provision the binary and launch the server.
    ///
    /// # Returns
    /// The pid of the launched server. Failures are reported once as a
    /// warning and returned; nothing is retried.
    pub async fn start(
        &self,
        project_root: &Utf8Path,
        expose_to_network: bool,
        cancel: &CancellationToken,
    ) -> Result<u32, OrchestratorError> {
        let result = self.try_start(project_root, expose_to_network, cancel).await;
        match &result {
            Ok(pid) => {
                self.state.server_started(*pid);
            }
            Err(OrchestratorError::ServerDirNotFound) => {
                self.state.warn(
                    "Failed to start the patch server: server directory not found. \
                     Make sure the 'Server' directory is in the project or the server package",
                );
            }
            Err(OrchestratorError::Provision(ProvisionError::Cancelled)) => {
                tracing::info!("Patch server start cancelled");
            }
            Err(e) => {
                self.state.warn(format!("Failed to start the patch server: {}", e));
            }
        }
        result
    }

    async fn try_start(
        &self,
        project_root: &Utf8Path,
        expose_to_network: bool,
        cancel: &CancellationToken,
    ) -> Result<u32, OrchestratorError> {
        let snapshot = self.prepare_on_host().await?;

        let paths = HelperPaths::resolve(
            project_root,
            self.settings.install_root.as_deref(),
            &self.settings.version_slug(),
        );

        let omitted = self
            .resolver
            .compute_omitted(&snapshot.catalog.editor, &snapshot.catalog.player, &snapshot.defines);

        self.write_support_files(&paths, &snapshot, &omitted).await?;

        let Some(server_dir) = snapshot.server_dir.as_deref() else {
            return Err(OrchestratorError::ServerDirNotFound);
        };

        let platform = self.controller.platform();
        if !platform.is_supported() {
            // nothing to download for a platform without a server build
            return Err(StartError::UnsupportedPlatform.into());
        }

        if !snapshot.solution_exists {
            self.state.warn(
                "No project solution file found. Open any source file to generate it so the patch server can work properly",
            );
        }

        let search_paths = snapshot
            .catalog
            .search_paths(&omitted)
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let mut cli_arguments = CliArguments::new()
            .flag("-u", project_root.as_str())
            .flag("-s", snapshot.solution_path.as_str())
            .flag("-t", paths.cli_temp_dir.as_str())
            .flag("-a", search_paths);
        if expose_to_network {
            // listen on the local network interface instead of localhost only
            cli_arguments.push_flag("-e", "true");
        }

        let args = StartArgs {
            helper_temp_dir: paths.helper_temp_dir,
            cli_temp_dir: paths.cli_temp_dir,
            executable_target_dir: paths.executable_target_dir,
            executable_source_dir: server_dir.join(platform.platform_id()),
            cli_arguments,
            project_dir: project_root.to_path_buf(),
        };

        let overrides = ConfigManager::load_override_config(project_root);
        self.provision(&args.executable_target_dir, &overrides, cancel)
            .await?;

        Ok(self.controller.start(&args).await?)
    }

    /// Stop the server; a no-op when it isn't running.
    pub async fn stop(&self) {
        self.controller.stop().await;
        self.state.server_stopped();
    }

    /// Stop, then start. The stop (including clearing the process handle)
    /// completes before the start begins.
    pub async fn restart(
        &self,
        project_root: &Utf8Path,
        expose_to_network: bool,
        cancel: &CancellationToken,
    ) -> Result<u32, OrchestratorError> {
        self.stop().await;
        self.start(project_root, expose_to_network, cancel).await
    }

    /// Module names excluded from patching for the host's current build
    pub async fn omitted_modules(&self) -> Result<Vec<String>, OrchestratorError> {
        let snapshot = self.prepare_on_host().await?;
        let omitted = self
            .resolver
            .compute_omitted(&snapshot.catalog.editor, &snapshot.catalog.player, &snapshot.defines);
        let mut names: Vec<String> = omitted.into_iter().collect();
        names.sort();
        Ok(names)
    }

    async fn prepare_on_host(&self) -> Result<HostSnapshot, OrchestratorError> {
        let host = self.host.clone();
        let snapshot = self
            .host_thread
            .run(move |cx| -> anyhow::Result<HostSnapshot> {
                let solution_path = host.solution_path(cx);
                if !solution_path.exists() {
                    if let Err(e) = host.generate_project_files(cx) {
                        tracing::warn!("Failed to generate project files: {:#}", e);
                    }
                }

                Ok(HostSnapshot {
                    solution_exists: solution_path.exists(),
                    solution_path,
                    catalog: host
                        .module_catalog(cx)
                        .context("Failed to query module catalog")?,
                    defines: host.active_defines(cx),
                    build_target: host.build_target(cx),
                    system_assembly_dirs: host.system_assembly_dirs(cx),
                    server_dir: host.server_dir(cx),
                })
            })
            .await??;

        Ok(snapshot)
    }

    /// Write `playerdata.json` and `systemAssemblies.json` for the server
    async fn write_support_files(
        &self,
        paths: &HelperPaths,
        snapshot: &HostSnapshot,
        omitted: &std::collections::HashSet<String>,
    ) -> Result<(), OrchestratorError> {
        let mut omitted_modules: Vec<String> = omitted.iter().cloned().collect();
        omitted_modules.sort();

        let player_data = PlayerData {
            build_target: snapshot.build_target.clone(),
            define_symbols: snapshot.defines.sorted(),
            omitted_modules,
        };
        let system_dirs = snapshot.system_assembly_dirs.clone();
        let cli_temp_dir = paths.cli_temp_dir.clone();
        let library_cache_dir = paths.library_cache_dir.clone();

        run_on_worker(move || -> anyhow::Result<()> {
            std::fs::create_dir_all(&cli_temp_dir)
                .with_context(|| format!("Failed to create {}", cli_temp_dir))?;
            let player_path = cli_temp_dir.join(PLAYER_DATA_FILE);
            std::fs::write(&player_path, serde_json::to_string(&player_data)?)
                .with_context(|| format!("Failed to write {}", player_path))?;

            std::fs::create_dir_all(&library_cache_dir)
                .with_context(|| format!("Failed to create {}", library_cache_dir))?;
            let system_path = library_cache_dir.join(SYSTEM_ASSEMBLIES_FILE);
            std::fs::write(&system_path, serde_json::to_string(&system_dirs)?)
                .with_context(|| format!("Failed to write {}", system_path))?;
            Ok(())
        })
        .await??;

        Ok(())
    }

    /// Provision the binary, forwarding download progress to the state manager
    async fn provision(
        &self,
        target_dir: &Utf8Path,
        overrides: &crate::models::OverrideConfig,
        cancel: &CancellationToken,
    ) -> Result<Utf8PathBuf, ProvisionError> {
        self.state.begin_install();

        let mut progress = self.provisioner.progress().subscribe();
        let install = self.provisioner.ensure_installed(
            self.controller.platform(),
            target_dir,
            overrides,
            cancel,
        );
        tokio::pin!(install);

        let result = loop {
            tokio::select! {
                result = &mut install => break result,
                Ok(()) = progress.changed() => {
                    let fraction = *progress.borrow_and_update();
                    self.state.set_download_progress(fraction);
                }
            }
        };

        self.state.finish_install(result.is_ok());
        result
    }
}
