// Patch Server - provisioning and lifecycle supervision for the code patch server
//
// This is the library crate containing the core logic and data structures.
// The binary crate (main.rs) provides the command-line entry point.

pub mod config;
pub mod host;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod platform;
pub mod scheduler;
pub mod services;
pub mod state;

// Re-export commonly used types for convenience
pub use config::ConfigManager;
pub use host::{FileSystemHost, HostProject};
pub use metrics::Metrics;
pub use models::{HelperState, OverrideConfig, Settings, StartArgs};
pub use platform::PlatformBinding;
pub use scheduler::{HostContext, HostThread};
pub use state::{StateChange, StateManager};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
