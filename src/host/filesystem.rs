//! Host adapter reading the project straight from disk.
//!
//! Discovers modules from the module definition files (`*.asmdef`) under
//! `Assets/` and `Packages/` instead of asking a running editor. Useful for the
//! command-line binary and for tests.
//!
//! # Examples
//!
//! ```ignore
//! use patch_server::host::FileSystemHost;
//! use patch_server::models::ActiveDefines;
//!
//! let host = FileSystemHost::new("/projects/game")
//!     .with_defines(ActiveDefines::parse("UNITY_ANDROID;DEBUG"))
//!     .with_build_target("Android");
//! ```

use crate::host::HostProject;
use crate::models::{ALWAYS_INCLUDED_MODULE, ActiveDefines, Module, ModuleCatalog, ModuleKind};
use crate::scheduler::HostContext;
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use walkdir::WalkDir;

/// Editor counterpart of [`ALWAYS_INCLUDED_MODULE`]
pub const ALWAYS_INCLUDED_EDITOR_MODULE: &str = "Assembly-CSharp-Editor";

/// Directory holding the bundled per-platform server directories
const SERVER_DIR_NAME: &str = "Server";

const MODULE_DEFINITION_EXTENSION: &str = "asmdef";

/// Directories scanned for module definitions, relative to the project root
const SOURCE_ROOTS: [&str; 2] = ["Assets", "Packages"];

/// Fields read from a module definition file
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ModuleDefinition {
    name: String,
    define_constraints: Vec<String>,
    include_platforms: Vec<String>,
    optional_unity_references: Vec<String>,
    references: Vec<String>,
}

impl ModuleDefinition {
    fn kind(&self) -> ModuleKind {
        let test_reference = |r: &String| r.contains("TestRunner");
        if self.optional_unity_references.iter().any(|r| r == "TestAssemblies")
            || self.references.iter().any(test_reference)
        {
            ModuleKind::Test
        } else if self.include_platforms.len() == 1 && self.include_platforms[0] == "Editor" {
            ModuleKind::Editor
        } else {
            ModuleKind::Player
        }
    }
}

/// [`HostProject`] backed by the project directory on disk.
#[derive(Debug, Clone)]
pub struct FileSystemHost {
    project_dir: Utf8PathBuf,
    defines: ActiveDefines,
    build_target: String,
    system_assembly_dirs: Vec<Utf8PathBuf>,
    server_dir: Option<Utf8PathBuf>,
}

impl FileSystemHost {
    /// Host for an existing project directory, resolved to an absolute path.
    ///
    /// Relative paths such as `.` have no file name to derive the solution
    /// from, and the server runs from a different working directory.
    pub fn open(project_dir: impl AsRef<Utf8Path>) -> Result<Self> {
        let project_dir = project_dir.as_ref();
        let project_dir = project_dir
            .canonicalize_utf8()
            .with_context(|| format!("Failed to resolve project directory {}", project_dir))?;
        Ok(Self::new(project_dir))
    }

    pub fn new(project_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            defines: ActiveDefines::default(),
            build_target: String::new(),
            system_assembly_dirs: Vec::new(),
            server_dir: None,
        }
    }

    pub fn with_defines(mut self, defines: ActiveDefines) -> Self {
        self.defines = defines;
        self
    }

    pub fn with_build_target(mut self, build_target: impl Into<String>) -> Self {
        self.build_target = build_target.into();
        self
    }

    pub fn with_system_assembly_dirs(mut self, dirs: Vec<Utf8PathBuf>) -> Self {
        self.system_assembly_dirs = dirs;
        self
    }

    /// Use a fixed server directory instead of searching the project
    pub fn with_server_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.server_dir = Some(dir.into());
        self
    }

    pub fn project_dir(&self) -> &Utf8Path {
        &self.project_dir
    }

    /// Compiled output path of a module
    fn output_path(&self, module_name: &str) -> Utf8PathBuf {
        self.project_dir
            .join("Library")
            .join("ScriptAssemblies")
            .join(format!("{}.dll", module_name))
    }

    /// Scan the project for module definitions.
    ///
    /// Malformed or unnamed definitions are skipped with a warning.
    ///
    /// # Returns
    /// The catalog, always including the implicit default modules
    pub fn scan_modules(&self) -> Result<ModuleCatalog> {
        let mut catalog = ModuleCatalog::default();

        let player_default = Module::new(ALWAYS_INCLUDED_MODULE, ModuleKind::Player)
            .with_output_path(self.output_path(ALWAYS_INCLUDED_MODULE));
        let editor_default = Module::new(ALWAYS_INCLUDED_EDITOR_MODULE, ModuleKind::Editor)
            .with_output_path(self.output_path(ALWAYS_INCLUDED_EDITOR_MODULE));
        catalog.editor.push(player_default.clone());
        catalog.editor.push(editor_default);
        catalog.player.push(player_default);

        for root in SOURCE_ROOTS {
            let root = self.project_dir.join(root);
            if !root.is_dir() {
                continue;
            }

            for entry in WalkDir::new(&root).sort_by_file_name() {
                let entry = entry.with_context(|| format!("Failed to scan {}", root))?;
                let path = entry.path();
                if !entry.file_type().is_file()
                    || path.extension().and_then(|e| e.to_str()) != Some(MODULE_DEFINITION_EXTENSION)
                {
                    continue;
                }

                let Some(definition) = read_definition(path) else {
                    continue;
                };

                let kind = definition.kind();
                let module = Module::new(definition.name.clone(), kind)
                    .with_constraints(definition.define_constraints)
                    .with_output_path(self.output_path(&definition.name));

                if kind == ModuleKind::Player {
                    catalog.player.push(module.clone());
                }
                catalog.editor.push(module);
            }
        }

        tracing::debug!(
            "Found {} editor modules, {} player modules",
            catalog.editor.len(),
            catalog.player.len()
        );

        Ok(catalog)
    }

    /// Locate the bundled server directory.
    ///
    /// Returns the first directory named `Server` under `Assets/` or `Packages/`.
    pub fn find_server_dir(&self) -> Option<Utf8PathBuf> {
        if let Some(dir) = &self.server_dir {
            return dir.is_dir().then(|| dir.clone());
        }

        SOURCE_ROOTS
            .iter()
            .map(|root| self.project_dir.join(root))
            .filter(|root| root.is_dir())
            .flat_map(|root| {
                WalkDir::new(root)
                    .max_depth(6)
                    .sort_by_file_name()
                    .into_iter()
                    .filter_map(|e| e.ok())
            })
            .find(|e| e.file_type().is_dir() && e.file_name() == SERVER_DIR_NAME)
            .and_then(|e| Utf8PathBuf::from_path_buf(e.into_path()).ok())
    }
}

fn read_definition(path: &std::path::Path) -> Option<ModuleDefinition> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            tracing::warn!("Failed to read module definition {}: {}", path.display(), e);
            return None;
        }
    };

    match serde_json::from_str::<ModuleDefinition>(&content) {
        Ok(definition) if !definition.name.is_empty() => Some(definition),
        Ok(_) => {
            tracing::warn!("Ignoring unnamed module definition {}", path.display());
            None
        }
        Err(e) => {
            tracing::warn!("Ignoring malformed module definition {}: {}", path.display(), e);
            None
        }
    }
}

impl HostProject for FileSystemHost {
    fn solution_path(&self, _cx: &HostContext) -> Utf8PathBuf {
        let name = self.project_dir.file_name().unwrap_or("project");
        self.project_dir.join(format!("{}.sln", name))
    }

    fn generate_project_files(&self, _cx: &HostContext) -> Result<()> {
        // Only the editor can generate them
        tracing::info!("Project files are generated by the editor; open the project to create them");
        Ok(())
    }

    fn module_catalog(&self, _cx: &HostContext) -> Result<ModuleCatalog> {
        self.scan_modules()
    }

    fn active_defines(&self, _cx: &HostContext) -> ActiveDefines {
        self.defines.clone()
    }

    fn build_target(&self, _cx: &HostContext) -> String {
        self.build_target.clone()
    }

    fn system_assembly_dirs(&self, _cx: &HostContext) -> Vec<Utf8PathBuf> {
        self.system_assembly_dirs.clone()
    }

    fn server_dir(&self, _cx: &HostContext) -> Option<Utf8PathBuf> {
        self.find_server_dir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::HostThread;
    use tempfile::TempDir;

    fn write(path: &Utf8Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn project() -> (TempDir, Utf8PathBuf) {
        let temp = TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(temp.path().to_path_buf()).unwrap();
        (temp, root)
    }

    #[test]
    fn test_scan_classifies_modules() {
        let (_temp, root) = project();
        write(
            &root.join("Assets/Game/Game.asmdef"),
            r#"{ "name": "Game", "defineConstraints": ["!UNITY_SERVER"] }"#,
        );
        write(
            &root.join("Assets/Game/Editor/Game.Editor.asmdef"),
            r#"{ "name": "Game.Editor", "includePlatforms": ["Editor"] }"#,
        );
        write(
            &root.join("Assets/Tests/Game.Tests.asmdef"),
            r#"{ "name": "Game.Tests", "optionalUnityReferences": ["TestAssemblies"] }"#,
        );

        let catalog = FileSystemHost::new(root.clone()).scan_modules().unwrap();

        let editor: Vec<&str> = catalog.editor.iter().map(|m| m.name.as_str()).collect();
        let player: Vec<&str> = catalog.player.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(editor.len(), 5);
        assert!(editor.contains(&"Game.Tests"));
        assert!(editor.contains(&ALWAYS_INCLUDED_EDITOR_MODULE));
        assert_eq!(player, vec![ALWAYS_INCLUDED_MODULE, "Game"]);

        let game = catalog.player.iter().find(|m| m.name == "Game").unwrap();
        assert_eq!(game.define_constraints, vec!["!UNITY_SERVER"]);
        assert_eq!(
            game.output_path.as_deref(),
            Some(root.join("Library/ScriptAssemblies/Game.dll").as_path())
        );
    }

    #[test]
    fn test_malformed_definitions_are_ignored() {
        let (_temp, root) = project();
        write(&root.join("Assets/Broken.asmdef"), "{ not json");
        write(&root.join("Packages/pkg/Unnamed.asmdef"), r#"{ "references": [] }"#);
        write(&root.join("Packages/pkg/Pkg.asmdef"), r#"{ "name": "Pkg" }"#);

        let catalog = FileSystemHost::new(root).scan_modules().unwrap();
        let names: Vec<&str> = catalog.player.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec![ALWAYS_INCLUDED_MODULE, "Pkg"]);
    }

    #[test]
    fn test_find_server_dir() {
        let (_temp, root) = project();
        assert!(FileSystemHost::new(root.clone()).find_server_dir().is_none());

        std::fs::create_dir_all(root.join("Packages/patch-server/Server/linux-x64")).unwrap();
        assert_eq!(
            FileSystemHost::new(root.clone()).find_server_dir(),
            Some(root.join("Packages/patch-server/Server"))
        );
    }

    async fn solution_path_of(host: FileSystemHost) -> Utf8PathBuf {
        let host_thread = HostThread::spawn("filesystem-host-test").unwrap();
        host_thread
            .run(move |cx| host.solution_path(cx))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_resolves_relative_project_dir() {
        let (_temp, root) = project();
        std::fs::create_dir_all(root.join("game").join("Assets")).unwrap();
        let canonical_game = root.join("game").canonicalize_utf8().unwrap();

        // a path ending in `..` has no file name until resolved
        let host = FileSystemHost::open(root.join("game").join("Assets").join("..")).unwrap();
        assert_eq!(host.project_dir(), canonical_game);
        assert_eq!(solution_path_of(host).await, canonical_game.join("game.sln"));
    }

    #[tokio::test]
    async fn test_open_current_dir_is_absolute() {
        let cwd = Utf8PathBuf::try_from(std::env::current_dir().unwrap())
            .unwrap()
            .canonicalize_utf8()
            .unwrap();

        let host = FileSystemHost::open(".").unwrap();
        assert!(host.project_dir().is_absolute());
        assert_eq!(host.project_dir(), cwd);

        let sln = solution_path_of(host).await;
        assert_eq!(sln.parent(), Some(cwd.as_path()));
        assert_ne!(sln.file_name(), Some("project.sln"));
    }

    #[test]
    fn test_open_missing_project_dir_fails() {
        let (_temp, root) = project();
        assert!(FileSystemHost::open(root.join("missing")).is_err());
    }

    #[test]
    fn test_explicit_server_dir_must_exist() {
        let (_temp, root) = project();
        let host = FileSystemHost::new(root.clone()).with_server_dir(root.join("missing"));
        assert!(host.find_server_dir().is_none());
    }
}
