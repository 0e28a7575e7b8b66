//! Platform bindings for the patch server binary.
//!
//! Exactly one [`PlatformBinding`] is selected per process, from the host OS and
//! architecture, and never changes afterwards.

use camino::{Utf8Path, Utf8PathBuf};
use std::sync::OnceLock;

/// Supported server platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformBinding {
    Windows,
    MacOs { arm64: bool },
    Linux,
    Unsupported,
}

static CURRENT: OnceLock<PlatformBinding> = OnceLock::new();

impl PlatformBinding {
    /// Binding for the host this process runs on.
    pub fn current() -> Self {
        *CURRENT.get_or_init(|| Self::detect(std::env::consts::OS, std::env::consts::ARCH))
    }

    /// Map an OS/arch pair (as in `std::env::consts`) to a binding.
    pub fn detect(os: &str, arch: &str) -> Self {
        match (os, arch) {
            ("windows", "x86_64") => Self::Windows,
            ("macos", "aarch64") => Self::MacOs { arm64: true },
            ("macos", "x86_64") => Self::MacOs { arm64: false },
            ("linux", "x86_64") => Self::Linux,
            _ => Self::Unsupported,
        }
    }

    /// Server executable file name
    pub fn binary_file_name(self) -> &'static str {
        match self {
            Self::Windows => "CodePatcherCLI.exe",
            Self::MacOs { .. } | Self::Linux => "CodePatcherCLI",
            Self::Unsupported => "",
        }
    }

    /// Platform identifier used in release URLs, the bundled server directory
    /// and the override config
    pub fn platform_id(self) -> &'static str {
        match self {
            Self::Windows => "win-x64",
            Self::MacOs { arm64: true } => "osx-arm64",
            Self::MacOs { arm64: false } => "osx-x64",
            Self::Linux => "linux-x64",
            Self::Unsupported => "unsupported",
        }
    }

    pub fn is_supported(self) -> bool {
        self != Self::Unsupported
    }

    /// Whether the bundled server directory must be synced into the install
    /// directory before starting (it ships the file-watch tools)
    pub fn requires_install_step(self) -> bool {
        matches!(self, Self::Windows | Self::MacOs { .. })
    }

    /// File-watch tool flags appended to the server command line.
    pub fn file_watch_flags(self, target_dir: &Utf8Path) -> Vec<(&'static str, Utf8PathBuf)> {
        match self {
            Self::Windows => vec![
                ("-b", target_dir.join("watchman").join("watchman.exe")),
                ("-w", target_dir.join("watchman-wait").join("watchman-wait.exe")),
            ],
            Self::MacOs { .. } => vec![
                ("-b", target_dir.join("watchman").join("watchman")),
                ("-w", target_dir.join("watchman-wait").join("watchman-wait")),
            ],
            // inotify is used directly on Linux
            Self::Linux | Self::Unsupported => Vec::new(),
        }
    }

    /// Full path of the server executable inside an install directory
    pub fn executable_path(self, target_dir: &Utf8Path) -> Utf8PathBuf {
        target_dir.join(self.binary_file_name())
    }
}
