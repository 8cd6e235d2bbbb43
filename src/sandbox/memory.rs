//! In-process sandbox backend.
//!
//! Keeps sandboxes, files and sessions in memory and records every call.
//! Used for dry runs (`SANDBOX_BACKEND=memory`) and by the test suite.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Error, Result};

use super::provider::{
    CreateSandboxParams, ExecResponse, FileEntry, PreviewLink, SandboxApi, SandboxInfo,
    SessionCommand, SessionExecRequest, SnapshotParams, SshAccess,
};

#[derive(Debug, Default)]
struct MemorySandbox {
    files: BTreeMap<String, Vec<u8>>,
    folders: BTreeSet<String>,
    sessions: BTreeSet<String>,
    params_env: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    sandboxes: HashMap<String, MemorySandbox>,
    snapshots: Vec<String>,
    calls: Vec<String>,
    deletes: usize,
}

/// Sandbox API that never leaves the process.
#[derive(Debug, Default)]
pub struct InMemorySandboxApi {
    state: Mutex<State>,
    failing_ops: Mutex<BTreeSet<&'static str>>,
    failing_commands: Mutex<Vec<String>>,
}

fn parent_and_name(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => ("/", &trimmed[1..]),
        Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
        None => ("", trimmed),
    }
}

impl InMemorySandboxApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call to `op` (e.g. `"create"`, `"upload_file"`) fail.
    pub fn fail_op(&self, op: &'static str) {
        self.lock_failing_ops().insert(op);
    }

    /// Makes `execute_command` exit non-zero for commands containing `needle`.
    pub fn fail_command_containing(&self, needle: impl Into<String>) {
        self.lock_failing_commands().push(needle.into());
    }

    /// Names of all API calls made so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// How many times `delete` was called.
    pub fn delete_count(&self) -> usize {
        self.lock().deletes
    }

    /// Number of sandboxes that have not been deleted.
    pub fn live_sandboxes(&self) -> usize {
        self.lock().sandboxes.len()
    }

    /// Snapshot names built so far.
    pub fn snapshots(&self) -> Vec<String> {
        self.lock().snapshots.clone()
    }

    /// Content of a file in a live sandbox.
    pub fn file(&self, sandbox_id: &str, path: &str) -> Option<Vec<u8>> {
        self.lock()
            .sandboxes
            .get(sandbox_id)
            .and_then(|s| s.files.get(path).cloned())
    }

    /// Environment a live sandbox was created with.
    pub fn env(&self, sandbox_id: &str) -> Option<HashMap<String, String>> {
        self.lock()
            .sandboxes
            .get(sandbox_id)
            .map(|s| s.params_env.clone())
    }

    /// Seeds a file, creating parent folders.
    pub fn put_file(&self, sandbox_id: &str, path: &str, content: &[u8]) {
        let mut state = self.lock();
        if let Some(sandbox) = state.sandboxes.get_mut(sandbox_id) {
            let (parent, _) = parent_and_name(path);
            sandbox.folders.insert(parent.to_string());
            sandbox.files.insert(path.to_string(), content.to_vec());
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_failing_ops(&self) -> std::sync::MutexGuard<'_, BTreeSet<&'static str>> {
        self.failing_ops.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_failing_commands(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.failing_commands.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enter(&self, op: &'static str) -> Result<()> {
        self.lock().calls.push(op.to_string());
        if self.lock_failing_ops().contains(op) {
            return Err(Error::sandbox(op, "injected failure"));
        }
        Ok(())
    }

    fn with_sandbox<T>(
        &self,
        op: &'static str,
        sandbox_id: &str,
        f: impl FnOnce(&mut MemorySandbox) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.lock();
        let sandbox = state
            .sandboxes
            .get_mut(sandbox_id)
            .ok_or_else(|| Error::sandbox(op, format!("no sandbox {sandbox_id}")))?;
        f(sandbox)
    }
}

#[async_trait]
impl SandboxApi for InMemorySandboxApi {
    async fn create(&self, params: CreateSandboxParams) -> Result<SandboxInfo> {
        self.enter("create")?;
        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("mem-{}", state.next_id);
        let mut sandbox = MemorySandbox {
            params_env: params.env_vars,
            ..Default::default()
        };
        sandbox
            .files
            .insert("/root/.bashrc".to_string(), b"# bashrc\n".to_vec());
        sandbox.folders.insert("/root".to_string());
        state.sandboxes.insert(id.clone(), sandbox);
        Ok(SandboxInfo {
            id,
            state: Some("started".to_string()),
        })
    }

    async fn create_folder(&self, sandbox_id: &str, path: &str, _mode: &str) -> Result<()> {
        self.enter("create_folder")?;
        self.with_sandbox("create_folder", sandbox_id, |s| {
            s.folders.insert(path.trim_end_matches('/').to_string());
            Ok(())
        })
    }

    async fn upload_file(&self, sandbox_id: &str, path: &str, content: Vec<u8>) -> Result<()> {
        self.enter("upload_file")?;
        self.with_sandbox("upload_file", sandbox_id, |s| {
            s.files.insert(path.to_string(), content);
            Ok(())
        })
    }

    async fn download_file(&self, sandbox_id: &str, path: &str) -> Result<Vec<u8>> {
        self.enter("download_file")?;
        self.with_sandbox("download_file", sandbox_id, |s| {
            s.files
                .get(path)
                .cloned()
                .ok_or_else(|| Error::sandbox("download_file", format!("no such file {path}")))
        })
    }

    async fn list_files(&self, sandbox_id: &str, path: &str) -> Result<Vec<FileEntry>> {
        self.enter("list_files")?;
        let dir = path.trim_end_matches('/');
        self.with_sandbox("list_files", sandbox_id, |s| {
            let folders = s.folders.iter().filter_map(|f| {
                let (parent, name) = parent_and_name(f);
                (parent == dir && !name.is_empty()).then(|| FileEntry {
                    name: name.to_string(),
                    is_dir: true,
                })
            });
            let files = s.files.keys().filter_map(|f| {
                let (parent, name) = parent_and_name(f);
                (parent == dir).then(|| FileEntry {
                    name: name.to_string(),
                    is_dir: false,
                })
            });
            Ok(folders.chain(files).collect())
        })
    }

    async fn execute_command(
        &self,
        sandbox_id: &str,
        command: &str,
        cwd: Option<&str>,
    ) -> Result<ExecResponse> {
        self.enter("execute_command")?;
        let failing = self
            .lock_failing_commands()
            .iter()
            .any(|needle| command.contains(needle.as_str()));
        self.with_sandbox("execute_command", sandbox_id, |s| {
            if failing {
                return Ok(ExecResponse {
                    exit_code: 128,
                    result: format!("fatal: {command}"),
                });
            }
            if command.starts_with("git clone") {
                if let Some(target) = command.split_whitespace().last() {
                    s.folders.insert(target.to_string());
                }
            }
            Ok(ExecResponse {
                exit_code: 0,
                result: format!("ok: {command} (cwd: {})", cwd.unwrap_or("~")),
            })
        })
    }

    async fn create_session(&self, sandbox_id: &str, session_id: &str) -> Result<()> {
        self.enter("create_session")?;
        self.with_sandbox("create_session", sandbox_id, |s| {
            s.sessions.insert(session_id.to_string());
            Ok(())
        })
    }

    async fn execute_session_command(
        &self,
        sandbox_id: &str,
        session_id: &str,
        request: SessionExecRequest,
    ) -> Result<SessionCommand> {
        self.enter("execute_session_command")?;
        self.with_sandbox("execute_session_command", sandbox_id, |s| {
            if !s.sessions.contains(session_id) {
                return Err(Error::sandbox(
                    "execute_session_command",
                    format!("no session {session_id}"),
                ));
            }
            Ok(SessionCommand {
                cmd_id: Some(format!("cmd-{session_id}")),
                output: None,
                exit_code: (!request.run_async).then_some(0),
            })
        })
    }

    async fn session_command_logs(
        &self,
        _sandbox_id: &str,
        _session_id: &str,
        command_id: &str,
    ) -> Result<String> {
        self.enter("session_command_logs")?;
        Ok(format!("{command_id}: listening"))
    }

    async fn delete_session(&self, sandbox_id: &str, session_id: &str) -> Result<()> {
        self.enter("delete_session")?;
        self.with_sandbox("delete_session", sandbox_id, |s| {
            s.sessions.remove(session_id);
            Ok(())
        })
    }

    async fn preview_link(&self, sandbox_id: &str, port: u16) -> Result<PreviewLink> {
        self.enter("preview_link")?;
        self.with_sandbox("preview_link", sandbox_id, |_| {
            Ok(PreviewLink {
                url: format!("https://{port}-{sandbox_id}.preview.invalid"),
                token: None,
            })
        })
    }

    async fn create_ssh_access(
        &self,
        sandbox_id: &str,
        _expires_in_minutes: u32,
    ) -> Result<SshAccess> {
        self.enter("create_ssh_access")?;
        self.with_sandbox("create_ssh_access", sandbox_id, |_| {
            Ok(SshAccess {
                token: format!("ssh-{sandbox_id}"),
                expires_at: None,
            })
        })
    }

    async fn delete(&self, sandbox_id: &str) -> Result<()> {
        self.enter("delete")?;
        let mut state = self.lock();
        state.deletes += 1;
        state
            .sandboxes
            .remove(sandbox_id)
            .map(|_| ())
            .ok_or_else(|| Error::sandbox("delete", format!("no sandbox {sandbox_id}")))
    }

    async fn create_snapshot(&self, params: SnapshotParams) -> Result<()> {
        self.enter("create_snapshot")?;
        self.lock().snapshots.push(params.name);
        Ok(())
    }
}
