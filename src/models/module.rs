use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Module that is always compiled into every build (scripts without a module definition).
pub const ALWAYS_INCLUDED_MODULE: &str = "Assembly-CSharp";

/// Compilation context a module belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    /// Only compiled for the editor
    Editor,
    /// Part of the player build
    Player,
    /// Test module, never part of the player build
    Test,
}

/// A named, independently compiled unit of source code.
///
/// Treated as read-only input sourced from the host project's module graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,

    /// Raw define-constraint expressions; all must pass for the module to be built
    #[serde(default)]
    pub define_constraints: Vec<String>,

    pub kind: ModuleKind,

    /// Compiled output file, when known
    #[serde(default)]
    pub output_path: Option<Utf8PathBuf>,
}

impl Module {
    pub fn new(name: impl Into<String>, kind: ModuleKind) -> Self {
        Self {
            name: name.into(),
            define_constraints: Vec::new(),
            kind,
            output_path: None,
        }
    }

    pub fn with_constraints<I, S>(mut self, constraints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.define_constraints = constraints.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_output_path(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }
}

/// Snapshot of the host's module graph, split by compilation context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleCatalog {
    /// Every module compiled for the editor (includes player and test modules)
    pub editor: Vec<Module>,

    /// Modules that make up the player build, excluding tests
    pub player: Vec<Module>,
}

impl ModuleCatalog {
    /// Directories the server should search for compiled modules.
    ///
    /// Output directories of editor modules that are not omitted, de-duplicated
    /// in first-seen order.
    pub fn search_paths(&self, omitted: &HashSet<String>) -> Vec<Utf8PathBuf> {
        let dirs: IndexSet<Utf8PathBuf> = self
            .editor
            .iter()
            .filter(|module| !omitted.contains(&module.name))
            .filter_map(|module| module.output_path.as_deref())
            .filter_map(Utf8Path::parent)
            .map(Utf8Path::to_path_buf)
            .collect();
        dirs.into_iter().collect()
    }
}

/// Define symbols active for the current build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveDefines(HashSet<String>);

impl ActiveDefines {
    /// Parse the host's semicolon-delimited symbol list (`"UNITY_EDITOR;DEBUG"`).
    pub fn parse(symbols: &str) -> Self {
        Self(
            symbols
                .split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.0.contains(symbol)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Symbols in sorted order, for stable serialization
    pub fn sorted(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.0.iter().cloned().collect();
        symbols.sort();
        symbols
    }
}

impl<S: Into<String>> FromIterator<S> for ActiveDefines {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}
