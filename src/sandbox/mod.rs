//! Hosted sandbox API.
//!
//! This module provides the [`SandboxApi`] trait, a thin proxy over the
//! remote sandbox product, with the [`DaytonaClient`] HTTP implementation and
//! the [`InMemorySandboxApi`] dry-run implementation.

mod daytona;
mod memory;
mod provider;

pub use daytona::{DaytonaClient, DEFAULT_API_URL, DEFAULT_TARGET};
pub use memory::InMemorySandboxApi;
pub use provider::{
    CreateSandboxParams, ExecResponse, FileEntry, ImageSpec, PreviewLink, Resources, SandboxApi,
    SandboxInfo, SandboxSource, SessionCommand, SessionExecRequest, SnapshotParams, SshAccess,
};
