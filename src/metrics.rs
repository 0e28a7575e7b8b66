// Supervisor metrics module
//
// Lightweight counters for provisioning and process lifecycle, shared as Arc<Metrics>

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Supervisor metrics
///
/// Uses atomic operations for lock-free tracking. Logged on shutdown via
/// [`Metrics::log_summary`].
#[derive(Debug)]
pub struct Metrics {
    /// Download attempts, including retries
    pub download_attempts: AtomicU64,

    /// Failed download attempts
    pub download_failures: AtomicU64,

    /// Bytes received across all attempts
    pub bytes_downloaded: AtomicU64,

    /// Binaries this process installed (download or override copy)
    pub installs: AtomicU64,

    /// Installs lost to a concurrent installer
    pub install_races_lost: AtomicU64,

    pub server_starts: AtomicU64,

    pub server_stops: AtomicU64,

    /// Stops that had to kill the process
    pub forced_kills: AtomicU64,

    /// Starts that replaced a still-live tracked process
    pub handles_replaced: AtomicU64,

    /// Total time spent provisioning in milliseconds
    pub total_install_time_ms: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            download_attempts: AtomicU64::new(0),
            download_failures: AtomicU64::new(0),
            bytes_downloaded: AtomicU64::new(0),
            installs: AtomicU64::new(0),
            install_races_lost: AtomicU64::new(0),
            server_starts: AtomicU64::new(0),
            server_stops: AtomicU64::new(0),
            forced_kills: AtomicU64::new(0),
            handles_replaced: AtomicU64::new(0),
            total_install_time_ms: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_download_attempt(&self) {
        self.download_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_download_failure(&self) {
        self.download_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_install(&self, duration: Duration) {
        self.installs.fetch_add(1, Ordering::Relaxed);
        self.total_install_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_install_race_lost(&self) {
        self.install_races_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_server_start(&self) {
        self.server_starts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_server_stop(&self) {
        self.server_stops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forced_kill(&self) {
        self.forced_kills.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handle_replaced(&self) {
        self.handles_replaced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Log metrics summary
    pub fn log_summary(&self) {
        tracing::info!("=== Supervisor Metrics Summary ===");
        tracing::info!("Uptime: {:.2}s", self.uptime().as_secs_f64());
        tracing::info!(
            "Downloads: {} attempts, {} failed, {} bytes",
            self.download_attempts.load(Ordering::Relaxed),
            self.download_failures.load(Ordering::Relaxed),
            self.bytes_downloaded.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Installs: {} ({} races lost, {:.2}s total)",
            self.installs.load(Ordering::Relaxed),
            self.install_races_lost.load(Ordering::Relaxed),
            self.total_install_time_ms.load(Ordering::Relaxed) as f64 / 1000.0
        );
        tracing::info!(
            "Server: {} starts, {} stops, {} forced kills, {} replaced handles",
            self.server_starts.load(Ordering::Relaxed),
            self.server_stops.load(Ordering::Relaxed),
            self.forced_kills.load(Ordering::Relaxed),
            self.handles_replaced.load(Ordering::Relaxed)
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
