//! Sandbox API trait and request/response types.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// CPU, memory (GiB) and disk (GiB) requested for a sandbox or snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu: u32,
    pub memory: u32,
    pub disk: u32,
}

impl Resources {
    /// Sizing used when building per-repo snapshots.
    pub const SNAPSHOT: Resources = Resources {
        cpu: 3,
        memory: 4,
        disk: 3,
    };

    /// Sizing used for image-based sandboxes.
    pub const IMAGE: Resources = Resources {
        cpu: 2,
        memory: 3,
        disk: 4,
    };
}

/// Declarative container image, rendered to a Dockerfile for the API.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImageSpec {
    base: String,
    steps: Vec<String>,
}

impl ImageSpec {
    /// Starts an image from a base reference such as `debian:stable-slim`.
    pub fn base(image: impl Into<String>) -> Self {
        Self {
            base: image.into(),
            steps: Vec::new(),
        }
    }

    /// Appends one `RUN` instruction per command.
    pub fn run_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.steps
            .extend(commands.into_iter().map(|c| format!("RUN {}", c.into())));
        self
    }

    /// Appends raw Dockerfile instructions.
    pub fn dockerfile_commands<I, S>(mut self, instructions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.steps.extend(instructions.into_iter().map(Into::into));
        self
    }

    /// Renders the Dockerfile text.
    pub fn to_dockerfile(&self) -> String {
        let mut out = format!("FROM {}\n", self.base);
        for step in &self.steps {
            out.push_str(step);
            out.push('\n');
        }
        out
    }
}

/// Where a new sandbox gets its filesystem from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxSource {
    /// A prebuilt snapshot, by name.
    Snapshot(String),
    /// An image built on demand.
    Image(ImageSpec),
}

/// Parameters for creating a sandbox.
#[derive(Debug, Clone)]
pub struct CreateSandboxParams {
    pub source: SandboxSource,
    pub env_vars: HashMap<String, String>,
    /// Whether preview links are reachable without a token.
    pub public: bool,
    /// Minutes of inactivity before auto-stop. `0` disables auto-stop.
    pub auto_stop_interval: u32,
    /// Explicit sizing. Snapshots carry their own when `None`.
    pub resources: Option<Resources>,
}

/// A created sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxInfo {
    pub id: String,
    #[serde(default)]
    pub state: Option<String>,
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    #[serde(default)]
    pub is_dir: bool,
}

/// Result of a one-shot remote command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResponse {
    pub exit_code: i32,
    #[serde(default)]
    pub result: String,
}

impl ExecResponse {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Command submitted to a named session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionExecRequest {
    pub command: String,
    /// Return as soon as the command is started.
    #[serde(default)]
    pub run_async: bool,
}

/// Response to a session command submission.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCommand {
    #[serde(default)]
    pub cmd_id: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

/// Public URL for a sandbox port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewLink {
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
}

/// Time-bounded SSH credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshAccess {
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<String>,
}

/// Parameters for building a named snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotParams {
    pub name: String,
    pub image: ImageSpec,
    pub resources: Resources,
}

/// Hosted sandbox API surface.
///
/// Every method is a direct proxy to one remote call. Callers decide which
/// failures are fatal.
#[async_trait]
pub trait SandboxApi: Send + Sync {
    /// Creates a sandbox and waits until it is started.
    async fn create(&self, params: CreateSandboxParams) -> Result<SandboxInfo>;

    /// Creates a directory with the given octal mode.
    async fn create_folder(&self, sandbox_id: &str, path: &str, mode: &str) -> Result<()>;

    /// Writes a file, replacing any existing content.
    async fn upload_file(&self, sandbox_id: &str, path: &str, content: Vec<u8>) -> Result<()>;

    /// Reads a file.
    async fn download_file(&self, sandbox_id: &str, path: &str) -> Result<Vec<u8>>;

    /// Lists a directory.
    async fn list_files(&self, sandbox_id: &str, path: &str) -> Result<Vec<FileEntry>>;

    /// Runs a command to completion, optionally in `cwd`.
    async fn execute_command(
        &self,
        sandbox_id: &str,
        command: &str,
        cwd: Option<&str>,
    ) -> Result<ExecResponse>;

    /// Creates a named execution session.
    async fn create_session(&self, sandbox_id: &str, session_id: &str) -> Result<()>;

    /// Runs a command inside a session.
    async fn execute_session_command(
        &self,
        sandbox_id: &str,
        session_id: &str,
        request: SessionExecRequest,
    ) -> Result<SessionCommand>;

    /// Fetches the accumulated log of a session command.
    async fn session_command_logs(
        &self,
        sandbox_id: &str,
        session_id: &str,
        command_id: &str,
    ) -> Result<String>;

    /// Deletes a session, terminating its processes.
    async fn delete_session(&self, sandbox_id: &str, session_id: &str) -> Result<()>;

    /// Returns the public preview URL for a port.
    async fn preview_link(&self, sandbox_id: &str, port: u16) -> Result<PreviewLink>;

    /// Mints an SSH credential valid for `expires_in_minutes`.
    async fn create_ssh_access(
        &self,
        sandbox_id: &str,
        expires_in_minutes: u32,
    ) -> Result<SshAccess>;

    /// Deletes the sandbox.
    async fn delete(&self, sandbox_id: &str) -> Result<()>;

    /// Builds a snapshot and waits until it is usable.
    async fn create_snapshot(&self, params: SnapshotParams) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_spec_renders_dockerfile_in_order() {
        let image = ImageSpec::base("debian:stable-slim")
            .run_commands(["apt-get update"])
            .dockerfile_commands(["ENV PATH=/x:$PATH"])
            .run_commands(["echo done"]);

        assert_eq!(
            image.to_dockerfile(),
            "FROM debian:stable-slim\nRUN apt-get update\nENV PATH=/x:$PATH\nRUN echo done\n"
        );
    }

    #[test]
    fn exec_response_parses_camel_case() {
        let resp: ExecResponse =
            serde_json::from_str(r#"{"exitCode":128,"result":"fatal"}"#).unwrap();
        assert!(!resp.success());
        assert_eq!(resp.result, "fatal");
    }

    #[test]
    fn session_command_tolerates_missing_fields() {
        let cmd: SessionCommand = serde_json::from_str("{}").unwrap();
        assert_eq!(cmd, SessionCommand::default());
    }
}
