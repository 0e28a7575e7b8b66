//! Patch server binary provisioning.
//!
//! Ensures the platform binary exists in the versioned install directory:
//! existing install → project override → download with retry. Installs go
//! through a temporary file in the target directory and a no-clobber rename,
//! so concurrent installers (other projects sharing the same cache) never see
//! a partial binary and the loser of a race simply discards its copy.

use crate::metrics::Metrics;
use crate::models::{OverrideConfig, Settings};
use crate::platform::PlatformBinding;
use crate::scheduler::run_on_worker;
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use reqwest::{Client, StatusCode};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Errors surfaced by [`BinaryProvisioner::ensure_installed`]
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Server binary not found at {0}")]
    NotFound(Utf8PathBuf),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Failed to install server binary to {path}: {source}")]
    InstallFailed {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("No server binary is available for this platform")]
    UnsupportedPlatform,

    #[error("Provisioning was cancelled")]
    Cancelled,
}

/// Errors from a single download attempt
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("HTTP {0}")]
    Status(u16),

    #[error("Network error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Download cancelled")]
    Cancelled,
}

/// Exponential backoff between download attempts: `min(base * 2^attempt, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before retrying after the zero-based `attempt` failed
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(self.max).min(self.max)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        let settings = Settings::default();
        Self::new(settings.backoff_base(), settings.backoff_max())
    }
}

/// Sleep abstraction so retry timing can be driven by tests.
#[async_trait]
pub trait Delay: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// [`Delay`] backed by the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioDelay;

#[async_trait]
impl Delay for TokioDelay {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Download progress for the current attempt.
///
/// The fraction stays in `[0, 1]`, never decreases within an attempt and is
/// reset to 0 when a new attempt starts.
#[derive(Debug, Clone)]
pub struct DownloadState {
    tx: Arc<watch::Sender<f32>>,
}

impl DownloadState {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0.0);
        Self { tx: Arc::new(tx) }
    }

    pub fn progress(&self) -> f32 {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<f32> {
        self.tx.subscribe()
    }

    /// Report progress; values below the current fraction are ignored
    pub fn report(&self, fraction: f32) {
        let fraction = fraction.clamp(0.0, 1.0);
        self.tx.send_if_modified(|current| {
            if fraction > *current {
                *current = fraction;
                true
            } else {
                false
            }
        });
    }

    pub fn begin_attempt(&self) {
        self.tx.send_if_modified(|current| {
            let changed = *current != 0.0;
            *current = 0.0;
            changed
        });
    }

    pub fn complete(&self) {
        self.report(1.0);
    }
}

impl Default for DownloadState {
    fn default() -> Self {
        Self::new()
    }
}

/// Where server binaries are downloaded from.
#[async_trait]
pub trait BinarySource: Send + Sync {
    /// Download `url` into `dest`, reporting progress.
    ///
    /// Returns the number of bytes written.
    async fn download(
        &self,
        url: &str,
        dest: &Utf8Path,
        progress: &DownloadState,
        cancel: &CancellationToken,
    ) -> Result<u64, DownloadError>;
}

/// [`BinarySource`] streaming over HTTP with reqwest
#[derive(Debug, Clone)]
pub struct HttpBinarySource {
    client: Client,
}

impl HttpBinarySource {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BinarySource for HttpBinarySource {
    async fn download(
        &self,
        url: &str,
        dest: &Utf8Path,
        progress: &DownloadState,
        cancel: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let mut response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            response = self.client.get(url).send() => response?,
        };

        if response.status() != StatusCode::OK {
            return Err(DownloadError::Status(response.status().as_u16()));
        }

        // Progress is skipped when the length is unknown, the copy still completes
        let content_length = response.content_length().filter(|&len| len > 0);

        let mut file = tokio::fs::File::create(dest).await?;
        let mut received: u64 = 0;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                chunk = response.chunk() => chunk?,
            };
            let Some(chunk) = chunk else { break };

            file.write_all(&chunk).await?;
            received += chunk.len() as u64;

            if let Some(total) = content_length {
                progress.report(received as f32 / total as f32);
            }
        }

        file.flush().await?;
        file.sync_all().await?;

        Ok(received)
    }
}

/// Outcome of moving a finished temporary file onto the target path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InstallOutcome {
    Installed,
    AlreadyPresent,
}

/// Installs the patch server binary for a platform into a target directory.
pub struct BinaryProvisioner {
    source: Arc<dyn BinarySource>,
    delay: Arc<dyn Delay>,
    backoff: ExponentialBackoff,
    download_host: String,
    version_slug: String,
    progress: DownloadState,
    metrics: Arc<Metrics>,
}

impl BinaryProvisioner {
    /// Provisioner downloading over HTTP with settings-driven timing.
    pub fn new(settings: &Settings, metrics: Arc<Metrics>) -> Result<Self, reqwest::Error> {
        let source = HttpBinarySource::new(settings.download_timeout())?;
        Ok(Self {
            source: Arc::new(source),
            delay: Arc::new(TokioDelay),
            backoff: ExponentialBackoff::new(settings.backoff_base(), settings.backoff_max()),
            download_host: settings.download_host.trim_end_matches('/').to_string(),
            version_slug: settings.version_slug(),
            progress: DownloadState::new(),
            metrics,
        })
    }

    pub fn with_source(mut self, source: Arc<dyn BinarySource>) -> Self {
        self.source = source;
        self
    }

    pub fn with_delay(mut self, delay: Arc<dyn Delay>) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn progress(&self) -> &DownloadState {
        &self.progress
    }

    /// Release URL of the binary for a platform
    pub fn download_url(&self, platform: PlatformBinding) -> String {
        format!(
            "{}/releases/{}/server/{}/{}",
            self.download_host,
            self.version_slug,
            platform.platform_id(),
            platform.binary_file_name()
        )
    }

    /// Make sure the platform binary exists in `target_dir`.
    ///
    /// Downloads are retried with backoff until they succeed or `cancel` fires;
    /// cancellation surfaces as [`ProvisionError::Cancelled`]. Losing an install
    /// race to a concurrent provisioner counts as success.
    pub async fn ensure_installed(
        &self,
        platform: PlatformBinding,
        target_dir: &Utf8Path,
        overrides: &OverrideConfig,
        cancel: &CancellationToken,
    ) -> Result<Utf8PathBuf, ProvisionError> {
        if !platform.is_supported() {
            return Err(ProvisionError::UnsupportedPlatform);
        }

        let target_path = platform.executable_path(target_dir);
        if path_exists(&target_path).await {
            self.progress.complete();
            return Ok(target_path);
        }

        self.progress.begin_attempt();
        let started = Instant::now();

        tokio::fs::create_dir_all(target_dir)
            .await
            .map_err(|source| ProvisionError::InstallFailed {
                path: target_dir.to_path_buf(),
                source,
            })?;

        if self
            .try_use_override(platform, &target_path, overrides)
            .await
        {
            self.progress.complete();
            self.metrics.record_install(started.elapsed());
            return Ok(target_path);
        }

        let mut attempt: u32 = 0;
        let downloaded = loop {
            if cancel.is_cancelled() {
                return Err(ProvisionError::Cancelled);
            }
            if path_exists(&target_path).await {
                tracing::debug!("Server binary appeared at {} while waiting", target_path);
                self.progress.complete();
                return Ok(target_path);
            }

            match self.download_once(platform, target_dir, cancel).await {
                Ok(file) => break file,
                Err(ProvisionError::Cancelled) => return Err(ProvisionError::Cancelled),
                Err(e) => tracing::debug!("Download attempt {} failed: {}", attempt + 1, e),
            }

            let wait = self.backoff.delay(attempt);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProvisionError::Cancelled),
                _ = self.delay.sleep(wait) => {}
            }
            attempt = attempt.saturating_add(1);
        };

        match self.install(downloaded, &target_path).await? {
            InstallOutcome::Installed => {
                tracing::info!("Installed server binary to {}", target_path);
                self.metrics.record_install(started.elapsed());
            }
            InstallOutcome::AlreadyPresent => {
                tracing::debug!("Another installer finished {} first", target_path);
                self.metrics.record_install_race_lost();
            }
        }

        if !path_exists(&target_path).await {
            return Err(ProvisionError::NotFound(target_path));
        }

        self.progress.complete();
        Ok(target_path)
    }

    /// Run a single download attempt into a fresh temporary file in `target_dir`.
    pub async fn download_once(
        &self,
        platform: PlatformBinding,
        target_dir: &Utf8Path,
        cancel: &CancellationToken,
    ) -> Result<NamedTempFile, ProvisionError> {
        self.metrics.record_download_attempt();
        self.progress.begin_attempt();

        let dir = target_dir.to_path_buf();
        let file = run_on_worker(move || temp_file_in(&dir))
            .await
            .map_err(|e| ProvisionError::DownloadFailed(e.to_string()))?
            .map_err(|e| ProvisionError::DownloadFailed(e.to_string()))?;

        let temp_path = Utf8Path::from_path(file.path())
            .ok_or_else(|| ProvisionError::DownloadFailed("temporary path is not UTF-8".into()))?
            .to_path_buf();

        let url = self.download_url(platform);
        match self
            .source
            .download(&url, &temp_path, &self.progress, cancel)
            .await
        {
            Ok(bytes) => {
                self.metrics.record_bytes(bytes);
                Ok(file)
            }
            Err(DownloadError::Cancelled) => Err(ProvisionError::Cancelled),
            Err(e) => {
                self.metrics.record_download_failure();
                Err(ProvisionError::DownloadFailed(e.to_string()))
            }
        }
    }

    /// Copy a user-supplied binary into place.
    ///
    /// Returns `false` (after logging) whenever the download path should be used instead.
    async fn try_use_override(
        &self,
        platform: PlatformBinding,
        target_path: &Utf8Path,
        overrides: &OverrideConfig,
    ) -> bool {
        let Some(custom_path) = overrides.custom_executable(platform.platform_id()) else {
            return false;
        };

        if !path_exists(custom_path).await {
            tracing::warn!(
                "Unable to find server binary for platform '{}' at '{}'. Will proceed with downloading the binary",
                platform.platform_id(),
                custom_path
            );
            return false;
        }

        let custom = custom_path.clone();
        let target = target_path.to_path_buf();
        let copied = run_on_worker(move || -> Result<InstallOutcome, ProvisionError> {
            let dir = target.parent().unwrap_or(Utf8Path::new("."));
            let mut file = temp_file_in(dir).map_err(|source| ProvisionError::InstallFailed {
                path: target.clone(),
                source,
            })?;
            let mut reader = std::fs::File::open(&custom).map_err(|source| {
                ProvisionError::InstallFailed {
                    path: custom.clone(),
                    source,
                }
            })?;
            io::copy(&mut reader, file.as_file_mut()).map_err(|source| {
                ProvisionError::InstallFailed {
                    path: target.clone(),
                    source,
                }
            })?;
            persist_no_clobber(file, &target)
        })
        .await;

        match copied {
            Ok(Ok(_)) => {
                tracing::info!("Using custom server binary from {}", custom_path);
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    "Failed to copy server binary from custom path '{}': {}",
                    custom_path,
                    e
                );
                false
            }
            Err(e) => {
                tracing::warn!("Custom binary copy task failed: {}", e);
                false
            }
        }
    }

    async fn install(
        &self,
        file: NamedTempFile,
        target_path: &Utf8Path,
    ) -> Result<InstallOutcome, ProvisionError> {
        let target = target_path.to_path_buf();
        run_on_worker(move || persist_no_clobber(file, &target))
            .await
            .map_err(|e| ProvisionError::InstallFailed {
                path: target_path.to_path_buf(),
                source: io::Error::other(e),
            })?
    }
}

fn temp_file_in(dir: &Utf8Path) -> io::Result<NamedTempFile> {
    tempfile::Builder::new()
        .prefix(".download-")
        .suffix(".tmp")
        .tempfile_in(dir)
}

/// Atomically move `file` onto `target` unless something is already there.
///
/// When the target already exists the temporary file is deleted and the
/// existing binary wins.
fn persist_no_clobber(file: NamedTempFile, target: &Utf8Path) -> Result<InstallOutcome, ProvisionError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o755)).map_err(
            |source| ProvisionError::InstallFailed {
                path: target.to_path_buf(),
                source,
            },
        )?;
    }

    match file.persist_noclobber(target) {
        Ok(_) => Ok(InstallOutcome::Installed),
        Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists || target.exists() => {
            // Dropping the returned temp file removes it
            drop(e.file);
            Ok(InstallOutcome::AlreadyPresent)
        }
        Err(e) => Err(ProvisionError::InstallFailed {
            path: target.to_path_buf(),
            source: e.error,
        }),
    }
}

async fn path_exists(path: &Utf8Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    const PAYLOAD: &[u8] = b"#!/bin/sh\necho patch server\n";

    fn utf8_dir(temp: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::try_from(temp.path().to_path_buf()).unwrap()
    }

    /// Fails with HTTP 500 a fixed number of times, then succeeds.
    struct FlakySource {
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakySource {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl BinarySource for FlakySource {
        async fn download(
            &self,
            _url: &str,
            dest: &Utf8Path,
            progress: &DownloadState,
            _cancel: &CancellationToken,
        ) -> Result<u64, DownloadError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(DownloadError::Status(500));
            }
            tokio::fs::write(dest, PAYLOAD).await?;
            progress.report(1.0);
            Ok(PAYLOAD.len() as u64)
        }
    }

    /// Records requested delays without sleeping; optionally cancels on first use.
    #[derive(Default)]
    struct RecordingDelay {
        delays: Mutex<Vec<Duration>>,
        cancel_on_sleep: Option<CancellationToken>,
    }

    #[async_trait]
    impl Delay for RecordingDelay {
        async fn sleep(&self, duration: Duration) {
            self.delays.lock().unwrap().push(duration);
            if let Some(token) = &self.cancel_on_sleep {
                token.cancel();
                std::future::pending::<()>().await;
            }
        }
    }

    fn provisioner(source: Arc<dyn BinarySource>, delay: Arc<dyn Delay>) -> BinaryProvisioner {
        BinaryProvisioner::new(&Settings::default(), Arc::new(Metrics::new()))
            .unwrap()
            .with_source(source)
            .with_delay(delay)
            .with_backoff(ExponentialBackoff::new(
                Duration::from_millis(100),
                Duration::from_secs(1),
            ))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(4), Duration::from_secs(1));
        assert_eq!(backoff.delay(200), Duration::from_secs(1));
    }

    #[test]
    fn test_download_state_is_monotonic_within_attempt() {
        let state = DownloadState::new();
        state.report(0.4);
        state.report(0.2);
        assert_eq!(state.progress(), 0.4);

        state.report(3.0);
        assert_eq!(state.progress(), 1.0);

        state.begin_attempt();
        assert_eq!(state.progress(), 0.0);
    }

    #[test]
    fn test_download_url() {
        let settings = Settings {
            download_host: "https://cdn.example.com/".to_string(),
            server_version: "1.5.2".to_string(),
            ..Settings::default()
        };
        let provisioner = BinaryProvisioner::new(&settings, Arc::new(Metrics::new())).unwrap();

        assert_eq!(
            provisioner.download_url(PlatformBinding::Windows),
            "https://cdn.example.com/releases/1-5-2/server/win-x64/CodePatcherCLI.exe"
        );
    }

    #[tokio::test]
    async fn test_existing_binary_is_fast_path() {
        let temp = TempDir::new().unwrap();
        let dir = utf8_dir(&temp);
        std::fs::write(dir.join("CodePatcherCLI"), b"existing").unwrap();

        let source = Arc::new(FlakySource::new(0));
        let provisioner = provisioner(source.clone(), Arc::new(RecordingDelay::default()));

        let path = provisioner
            .ensure_installed(
                PlatformBinding::Linux,
                &dir,
                &OverrideConfig::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(path, dir.join("CodePatcherCLI"));
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read(&path).unwrap(), b"existing");
        assert_eq!(provisioner.progress().progress(), 1.0);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let temp = TempDir::new().unwrap();
        let dir = utf8_dir(&temp).join("1-5-2");

        let source = Arc::new(FlakySource::new(3));
        let delay = Arc::new(RecordingDelay::default());
        let provisioner = provisioner(source.clone(), delay.clone());

        let path = provisioner
            .ensure_installed(
                PlatformBinding::Linux,
                &dir,
                &OverrideConfig::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), PAYLOAD);
        assert_eq!(source.calls.load(Ordering::SeqCst), 4);
        assert_eq!(
            *delay.delays.lock().unwrap(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
        assert_eq!(provisioner.metrics.download_failures.load(Ordering::Relaxed), 3);

        // only the installed binary is left behind
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_override_skips_network() {
        let temp = TempDir::new().unwrap();
        let root = utf8_dir(&temp);
        let custom = root.join("custom-build");
        std::fs::write(&custom, b"locally built").unwrap();
        let target_dir = root.join("install");

        let mut overrides = OverrideConfig::default();
        overrides
            .custom_server_executables
            .insert("linux-x64".to_string(), custom);

        let source = Arc::new(FlakySource::new(0));
        let provisioner = provisioner(source.clone(), Arc::new(RecordingDelay::default()));

        let path = provisioner
            .ensure_installed(PlatformBinding::Linux, &target_dir, &overrides, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read(path).unwrap(), b"locally built");
    }

    #[tokio::test]
    async fn test_missing_override_falls_back_to_download() {
        let temp = TempDir::new().unwrap();
        let root = utf8_dir(&temp);

        let mut overrides = OverrideConfig::default();
        overrides
            .custom_server_executables
            .insert("linux-x64".to_string(), root.join("does-not-exist"));

        let source = Arc::new(FlakySource::new(0));
        let provisioner = provisioner(source.clone(), Arc::new(RecordingDelay::default()));

        let path = provisioner
            .ensure_installed(PlatformBinding::Linux, &root.join("install"), &overrides, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read(path).unwrap(), PAYLOAD);
    }

    #[tokio::test]
    async fn test_cancellation_during_backoff() {
        let temp = TempDir::new().unwrap();
        let dir = utf8_dir(&temp);
        let cancel = CancellationToken::new();

        let delay = Arc::new(RecordingDelay {
            delays: Mutex::new(Vec::new()),
            cancel_on_sleep: Some(cancel.clone()),
        });
        let provisioner = provisioner(Arc::new(FlakySource::new(u32::MAX)), delay);

        let result = provisioner
            .ensure_installed(PlatformBinding::Linux, &dir, &OverrideConfig::default(), &cancel)
            .await;

        assert!(matches!(result, Err(ProvisionError::Cancelled)));
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_platform() {
        let temp = TempDir::new().unwrap();
        let provisioner = provisioner(
            Arc::new(FlakySource::new(0)),
            Arc::new(RecordingDelay::default()),
        );

        let result = provisioner
            .ensure_installed(
                PlatformBinding::Unsupported,
                &utf8_dir(&temp),
                &OverrideConfig::default(),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(ProvisionError::UnsupportedPlatform)));
    }

    #[test]
    fn test_persist_loser_removes_temp_file() {
        let temp = TempDir::new().unwrap();
        let dir = utf8_dir(&temp);
        let target = dir.join("CodePatcherCLI");
        std::fs::write(&target, b"winner").unwrap();

        let loser = temp_file_in(&dir).unwrap();
        let outcome = persist_no_clobber(loser, &target).unwrap();

        assert_eq!(outcome, InstallOutcome::AlreadyPresent);
        assert_eq!(std::fs::read(&target).unwrap(), b"winner");
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 1);
    }
}
