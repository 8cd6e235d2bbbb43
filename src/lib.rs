//! docs-sandbox - documentation assistant sandboxes
//!
//! This library provisions hosted sandboxes (or a local volume) with mirrored
//! reference repositories, templates the agent configuration for the
//! documentation server and starts it.

pub mod backoff;
pub mod config;
pub mod error;
pub mod flow;
pub mod local;
pub mod logging;
pub mod repos;
pub mod sandbox;
pub mod server;
pub mod snapshot;
pub mod sync;
pub mod template;

pub use error::{Error, Result};
pub use repos::{RepoDescriptor, Registry};
pub use sandbox::{DaytonaClient, InMemorySandboxApi, SandboxApi};

pub use config::{ExitPolicy, SandboxBackend, Settings, Validate, ValidationResult};
pub use flow::{ConnectionInfo, FlowOptions, SandboxFlow, SandboxLease, ServerTask, Variant};
pub use local::{LocalServer, LocalVolume};
pub use sync::{
    sync_repos, GitBackend, LocalGit, SandboxGit, SyncAction, SyncOptions, SyncOutcome,
    SyncResult,
};
pub use template::{BundlePaths, ConfigBundle, TemplateParams};
