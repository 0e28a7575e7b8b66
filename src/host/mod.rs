// Host project seam
//
// Everything the supervisor needs to know about the project it serves. All
// calls require a HostContext, so they only run on the host thread.

pub mod filesystem;

pub use filesystem::FileSystemHost;

use crate::models::{ActiveDefines, ModuleCatalog};
use crate::scheduler::HostContext;
use anyhow::Result;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// Player build state handed to the server at start (`playerdata.json`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerData {
    pub build_target: String,
    pub define_symbols: Vec<String>,
    pub omitted_modules: Vec<String>,
}

/// The development host the patch server works for.
#[cfg_attr(test, mockall::automock)]
pub trait HostProject: Send + Sync {
    /// Path of the project-description (solution) file the server resolves sources from
    fn solution_path(&self, cx: &HostContext) -> Utf8PathBuf;

    /// Ask the host to generate the project-description files
    fn generate_project_files(&self, cx: &HostContext) -> Result<()>;

    fn module_catalog(&self, cx: &HostContext) -> Result<ModuleCatalog>;

    fn active_defines(&self, cx: &HostContext) -> ActiveDefines;

    /// Name of the selected player build target
    fn build_target(&self, cx: &HostContext) -> String;

    /// Directories holding the system libraries modules compile against
    fn system_assembly_dirs(&self, cx: &HostContext) -> Vec<Utf8PathBuf>;

    /// Directory containing the bundled per-platform server directories
    fn server_dir(&self, cx: &HostContext) -> Option<Utf8PathBuf>;
}
