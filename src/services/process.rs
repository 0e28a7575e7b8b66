//! Patch server process control.
//!
//! One controller per project; it tracks at most one child process. Starting
//! returns as soon as the process is launched, readiness is the server's own
//! concern.

use crate::metrics::Metrics;
use crate::models::{Settings, StartArgs};
use crate::platform::PlatformBinding;
use crate::scheduler::run_on_worker;
use camino::{Utf8Path, Utf8PathBuf};
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

/// Server output is redirected here, inside the per-project CLI temp dir
pub const SERVER_LOG_FILE: &str = "server.log";

/// Errors surfaced by [`ProcessController::start`]
#[derive(Error, Debug)]
pub enum StartError {
    #[error("Server executable not found at {0}")]
    ExecutableMissing(Utf8PathBuf),

    #[error("Patch server is not supported on this platform")]
    UnsupportedPlatform,

    #[error("Failed to spawn {path}: {source}")]
    SpawnFailed {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to sync server files into {0}")]
    SyncFailed(String),
}

/// Starts and stops the patch server for one platform binding.
pub struct ProcessController {
    platform: PlatformBinding,
    child: Mutex<Option<Child>>,
    client: reqwest::Client,
    control_url: String,
    stop_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl ProcessController {
    pub fn new(
        platform: PlatformBinding,
        settings: &Settings,
        metrics: Arc<Metrics>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(settings.stop_timeout())
            .build()?;

        Ok(Self {
            platform,
            child: Mutex::new(None),
            client,
            control_url: settings.control_url(),
            stop_timeout: settings.stop_timeout(),
            metrics,
        })
    }

    pub fn platform(&self) -> PlatformBinding {
        self.platform
    }

    /// Pid of the tracked process, if any
    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(Child::id)
    }

    /// Whether the tracked process is still alive
    pub async fn is_running(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Launch the server and return its pid.
    ///
    /// # Arguments
    /// * `args` - Fresh start arguments for this launch
    ///
    /// # Returns
    /// The pid of the spawned process. A process started earlier and still
    /// tracked is not stopped; its handle is replaced.
    pub async fn start(&self, args: &StartArgs) -> Result<u32, StartError> {
        match self.platform {
            PlatformBinding::Unsupported => Err(StartError::UnsupportedPlatform),
            PlatformBinding::Windows | PlatformBinding::MacOs { .. } | PlatformBinding::Linux => {
                self.spawn_server(args).await
            }
        }
    }

    async fn spawn_server(&self, args: &StartArgs) -> Result<u32, StartError> {
        let mut cli_arguments = args.cli_arguments.clone();

        if self.platform.requires_install_step() {
            let source = args.executable_source_dir.clone();
            let target = args.executable_target_dir.clone();
            let copied = run_on_worker(move || sync_directory(&source, &target))
                .await
                .map_err(|e| StartError::SyncFailed(e.to_string()))?
                .map_err(|e| {
                    StartError::SyncFailed(format!("{}: {}", args.executable_target_dir, e))
                })?;
            tracing::debug!("Synced {} server files", copied);
        }

        for (flag, path) in self.platform.file_watch_flags(&args.executable_target_dir) {
            cli_arguments.push_flag(flag, path.as_str());
        }

        let executable = self.platform.executable_path(&args.executable_target_dir);
        if !tokio::fs::try_exists(&executable).await.unwrap_or(false) {
            return Err(StartError::ExecutableMissing(executable));
        }

        let spawn_failed = |source: io::Error| StartError::SpawnFailed {
            path: executable.clone(),
            source,
        };

        // Per project; the helper temp dir is shared machine-wide
        tokio::fs::create_dir_all(&args.cli_temp_dir)
            .await
            .map_err(spawn_failed)?;
        let log_file = std::fs::File::create(args.cli_temp_dir.join(SERVER_LOG_FILE))
            .map_err(spawn_failed)?;
        let stdout = Stdio::from(log_file.try_clone().map_err(spawn_failed)?);

        tracing::info!("Starting patch server: {} {}", executable, cli_arguments);

        let mut command = Command::new(&executable);
        command
            .args(cli_arguments.as_slice())
            .current_dir(&args.project_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::from(log_file));

        // Detach from the supervisor's process group / console
        #[cfg(unix)]
        command.process_group(0);
        #[cfg(windows)]
        command.creation_flags(0x0000_0200);

        let child = command.spawn().map_err(spawn_failed)?;
        let pid = child.id().unwrap_or_default();

        let mut guard = self.child.lock().await;
        if let Some(mut previous) = guard.replace(child) {
            if matches!(previous.try_wait(), Ok(None)) {
                tracing::warn!(
                    "Replacing handle of running server (pid {:?}); it is no longer tracked",
                    previous.id()
                );
                self.metrics.record_handle_replaced();
            }
        }
        drop(guard);

        self.metrics.record_server_start();
        tracing::info!("Patch server started with pid {}", pid);

        Ok(pid)
    }

    /// Stop the tracked server. A no-op when nothing was started.
    pub async fn stop(&self) {
        self.stop_with_cancel(&CancellationToken::new()).await;
    }

    /// Stop the tracked server, abandoning the graceful wait when `cancel` fires.
    ///
    /// Asks the server to shut down over its control endpoint and waits for it
    /// to exit; when that fails or times out the process is killed. The handle
    /// is cleared in every case.
    pub async fn stop_with_cancel(&self, cancel: &CancellationToken) {
        let mut guard = self.child.lock().await;
        let Some(mut child) = guard.take() else {
            tracing::debug!("Stop requested but no server is running");
            return;
        };

        if let Ok(Some(status)) = child.try_wait() {
            tracing::debug!("Patch server had already exited ({})", status);
            self.metrics.record_server_stop();
            return;
        }

        let exited = match self.request_shutdown(cancel).await {
            Ok(()) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => false,
                    status = tokio::time::timeout(self.stop_timeout, child.wait()) => {
                        matches!(status, Ok(Ok(_)))
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Graceful shutdown request failed, killing server: {}", e);
                false
            }
        };

        if !exited {
            if let Err(e) = child.kill().await {
                tracing::debug!("Kill failed (process may have exited): {}", e);
            }
            self.metrics.record_forced_kill();
        }

        self.metrics.record_server_stop();
        tracing::info!("Patch server stopped");
    }

    async fn request_shutdown(&self, cancel: &CancellationToken) -> Result<(), reqwest::Error> {
        let request = self.client.post(&self.control_url).send();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            response = request => response?,
        };
        response.error_for_status()?;
        Ok(())
    }
}

/// Copy `source` into `target`, skipping files whose size and modification
/// time already match.
///
/// Returns the number of files copied.
pub fn sync_directory(source: &Utf8Path, target: &Utf8Path) -> io::Result<usize> {
    let mut copied = 0;

    for entry in WalkDir::new(source) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(io::Error::other)?;
        let destination = target.as_std_path().join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&destination)?;
            continue;
        }

        let metadata = entry.metadata().map_err(io::Error::other)?;
        let up_to_date = std::fs::metadata(&destination)
            .map(|existing| {
                existing.len() == metadata.len()
                    && existing.modified().ok() >= metadata.modified().ok()
            })
            .unwrap_or(false);

        if !up_to_date {
            std::fs::copy(entry.path(), &destination)?;
            copied += 1;
        }
    }

    Ok(copied)
}
