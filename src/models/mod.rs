//! Data models for the patch server supervisor.
//!
//! - [`Settings`] / [`OverrideConfig`]: runtime settings and the project-local binary override file
//! - [`Module`] / [`ModuleCatalog`] / [`ActiveDefines`]: read-only snapshots of the host's module graph
//! - [`StartArgs`] / [`CliArguments`] / [`HelperPaths`]: inputs assembled for each server start
//! - [`HelperState`]: observable supervisor state held by [`StateManager`](crate::state::StateManager)

pub mod config;
pub mod helper_state;
pub mod module;
pub mod start_args;

pub use config::{OverrideConfig, SERVER_VERSION, Settings};
pub use helper_state::HelperState;
pub use module::{ALWAYS_INCLUDED_MODULE, ActiveDefines, Module, ModuleCatalog, ModuleKind};
pub use start_args::{CliArguments, HelperPaths, LIBRARY_CACHE_DIR, StartArgs};
