use camino::{Utf8Path, Utf8PathBuf};
use std::fmt;

/// Name of the per-project cache directory under `Library/`.
pub const LIBRARY_CACHE_DIR: &str = "patch-server";

/// Command-line arguments passed to the patch server.
///
/// Kept as a structured argv so paths with spaces survive process spawning;
/// [`fmt::Display`] renders the quoted single-string form for logs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliArguments(Vec<String>);

impl CliArguments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a flag followed by its value (`-u <value>`)
    pub fn flag(mut self, flag: &str, value: impl Into<String>) -> Self {
        self.push_flag(flag, value);
        self
    }

    pub fn push_flag(&mut self, flag: &str, value: impl Into<String>) {
        self.0.push(flag.to_string());
        self.0.push(value.into());
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CliArguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, arg) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            if arg.starts_with('-') {
                f.write_str(arg)?;
            } else {
                write!(f, "\"{}\"", arg)?;
            }
        }
        Ok(())
    }
}

/// Everything a process controller needs to launch the server.
///
/// Built fresh for every start and never reused across a stop/start cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartArgs {
    /// Scratch directory shared by all server instances on this machine
    pub helper_temp_dir: Utf8PathBuf,

    /// Per-project method patch directory
    pub cli_temp_dir: Utf8PathBuf,

    /// Versioned install directory the binary runs from
    pub executable_target_dir: Utf8PathBuf,

    /// Bundled server directory for the current platform
    pub executable_source_dir: Utf8PathBuf,

    pub cli_arguments: CliArguments,

    pub project_dir: Utf8PathBuf,
}

/// Filesystem locations used while preparing and running the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperPaths {
    pub helper_temp_dir: Utf8PathBuf,
    pub library_cache_dir: Utf8PathBuf,
    pub cli_temp_dir: Utf8PathBuf,
    pub executable_target_dir: Utf8PathBuf,
}

impl HelperPaths {
    /// Resolve the paths for a project.
    ///
    /// `install_root` overrides the machine-wide cache root; the executable
    /// directory is versioned so projects using different server versions can
    /// share one cache.
    pub fn resolve(
        project_dir: &Utf8Path,
        install_root: Option<&Utf8Path>,
        version_slug: &str,
    ) -> Self {
        let helper_temp_dir = Utf8PathBuf::from_path_buf(std::env::temp_dir())
            .unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
            .join(LIBRARY_CACHE_DIR);

        let install_root = install_root.map(Utf8Path::to_path_buf).unwrap_or_else(|| {
            dirs::data_local_dir()
                .and_then(|dir| Utf8PathBuf::from_path_buf(dir).ok())
                .unwrap_or_else(|| helper_temp_dir.clone())
                .join(LIBRARY_CACHE_DIR)
        });

        let library_cache_dir = project_dir.join("Library").join(LIBRARY_CACHE_DIR);

        Self {
            cli_temp_dir: library_cache_dir.join("cli"),
            executable_target_dir: install_root.join("executables").join(version_slug),
            helper_temp_dir,
            library_cache_dir,
        }
    }
}
