//! Services module - provisioning, process control and module omission.
//!
//! The services have no dependencies on a particular host; the host project is
//! reached only through [`crate::host::HostProject`] on the host thread.
//!
//! # Components
//!
//! - [`ConstraintEvaluator`]: evaluates define-constraint expressions against
//!   the active define symbols.
//!
//! - [`ModuleOmissionResolver`]: computes which modules the patch server must
//!   skip for the current player build.
//!
//! - [`BinaryProvisioner`]: makes sure the server binary for the platform is
//!   installed, using a project override or a download with retry. Installs are
//!   atomic and safe when several projects race for the same cache.
//!
//! - [`ProcessController`]: launches the server with its command line and stops
//!   it, gracefully first.
//!
//! - [`HelperOrchestrator`]: start/stop/restart for one project, tying the
//!   above together.
//!
//! # Usage Example
//!
//! ```ignore
//! use patch_server::services::HelperOrchestrator;
//! use tokio_util::sync::CancellationToken;
//!
//! let orchestrator = HelperOrchestrator::with_defaults(host, host_thread, settings, state, metrics)?;
//! let cancel = CancellationToken::new();
//!
//! let pid = orchestrator.start(project_root, false, &cancel).await?;
//! // ...
//! orchestrator.stop().await;
//! ```

pub mod constraints;
pub mod omission;
pub mod orchestrator;
pub mod process;
pub mod provisioner;

pub use constraints::{ConstraintEvaluator, EvaluationError};
pub use omission::ModuleOmissionResolver;
pub use orchestrator::{HelperOrchestrator, OrchestratorError};
pub use process::{ProcessController, StartError};
pub use provisioner::{
    BinaryProvisioner, BinarySource, Delay, DownloadError, DownloadState, ExponentialBackoff,
    HttpBinarySource, ProvisionError, TokioDelay,
};
