//! Daytona REST API client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::backoff::PollSchedule;
use crate::error::{Error, Result};

use super::provider::{
    CreateSandboxParams, ExecResponse, FileEntry, PreviewLink, SandboxApi, SandboxInfo,
    SandboxSource, SessionCommand, SessionExecRequest, SnapshotParams, SshAccess,
};

/// Default Daytona API endpoint.
pub const DEFAULT_API_URL: &str = "https://app.daytona.io/api";

/// Default region for new sandboxes.
pub const DEFAULT_TARGET: &str = "us";

const SOURCE_HEADER: &str = "x-daytona-source";

#[derive(Debug, Deserialize)]
struct StateResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default, rename = "errorReason")]
    error_reason: Option<String>,
}

/// Client for the Daytona sandbox API.
#[derive(Clone, Debug)]
pub struct DaytonaClient {
    base_url: String,
    target: String,
    http: reqwest::Client,
    start_timeout: Duration,
    snapshot_timeout: Duration,
}

impl DaytonaClient {
    /// Creates a client authenticated with `api_key`.
    pub fn new(api_key: &str, base_url: impl Into<String>, target: impl Into<String>) -> Result<Self> {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }

        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|e| Error::Config(format!("invalid DAYTONA_API_KEY: {e}")))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(SOURCE_HEADER, HeaderValue::from_static("docs-sandbox"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            base_url,
            target: target.into(),
            http,
            start_timeout: Duration::from_secs(60),
            snapshot_timeout: Duration::from_secs(30 * 60),
        })
    }

    /// Overrides how long `create` waits for a sandbox to start.
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Overrides how long `create_snapshot` waits for the build.
    pub fn with_snapshot_timeout(mut self, timeout: Duration) -> Self {
        self.snapshot_timeout = timeout;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn toolbox(&self, sandbox_id: &str, path: &str) -> String {
        self.url(&format!("/toolbox/{sandbox_id}/toolbox{path}"))
    }

    async fn send(&self, method: Method, url: &str, req: RequestBuilder) -> Result<Response> {
        tracing::debug!(%method, %url, "daytona request");
        let res = req.send().await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(Error::Api {
                method: method.to_string(),
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(res)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        req: RequestBuilder,
    ) -> Result<T> {
        let res = self.send(method, url, req).await?;
        Ok(res.json::<T>().await?)
    }

    async fn sandbox_state(&self, sandbox_id: &str) -> Result<StateResponse> {
        let url = self.url(&format!("/sandbox/{sandbox_id}"));
        self.send_json(Method::GET, &url, self.http.get(&url)).await
    }

    async fn wait_until_started(&self, sandbox_id: &str, mut state: Option<String>) -> Result<()> {
        let mut schedule = PollSchedule::new(
            Duration::from_millis(250),
            Duration::from_secs(2),
            self.start_timeout,
        );
        loop {
            match state.as_deref() {
                Some("started") => return Ok(()),
                Some("error") | Some("build_failed") => {
                    return Err(Error::sandbox(
                        "create",
                        format!("sandbox {sandbox_id} entered state {}", state.as_deref().unwrap_or_default()),
                    ));
                }
                _ => {}
            }
            if !schedule.tick().await {
                return Err(Error::sandbox(
                    "create",
                    format!("sandbox {sandbox_id} did not start within {:?}", self.start_timeout),
                ));
            }
            let current = self.sandbox_state(sandbox_id).await?;
            if let Some(reason) = current.error_reason.as_deref() {
                tracing::warn!(sandbox_id, reason, "sandbox reported an error");
            }
            state = current.state;
        }
    }

    /// Logs build output not yet seen. The endpoint returns the whole log
    /// so far; `seen` counts the lines already emitted.
    async fn emit_build_logs(&self, snapshot_id: &str, seen: &mut usize) {
        let url = self.url(&format!("/snapshots/{snapshot_id}/build-logs"));
        match self.send(Method::GET, &url, self.http.get(&url)).await {
            Ok(res) => {
                let text = res.text().await.unwrap_or_default();
                let mut total = 0;
                for (i, line) in text.lines().enumerate() {
                    total = i + 1;
                    if i >= *seen {
                        tracing::info!(target: "docs_sandbox::snapshot_build", "{}", line);
                    }
                }
                *seen = (*seen).max(total);
            }
            Err(e) => tracing::debug!(error = %e, "build logs unavailable"),
        }
    }
}

fn create_body(params: &CreateSandboxParams, target: &str) -> Value {
    let mut body = json!({
        "env": params.env_vars,
        "public": params.public,
        "autoStopInterval": params.auto_stop_interval,
        "target": target,
    });
    match &params.source {
        SandboxSource::Snapshot(name) => {
            body["snapshot"] = json!(name);
        }
        SandboxSource::Image(image) => {
            body["buildInfo"] = json!({ "dockerfileContent": image.to_dockerfile() });
        }
    }
    if let Some(res) = params.resources {
        body["cpu"] = json!(res.cpu);
        body["memory"] = json!(res.memory);
        body["disk"] = json!(res.disk);
    }
    body
}

#[async_trait]
impl SandboxApi for DaytonaClient {
    async fn create(&self, params: CreateSandboxParams) -> Result<SandboxInfo> {
        let url = self.url("/sandbox");
        let body = create_body(&params, &self.target);
        let created: StateResponse = self
            .send_json(Method::POST, &url, self.http.post(&url).json(&body))
            .await?;
        let id = created
            .id
            .ok_or_else(|| Error::sandbox("create", "response did not include a sandbox id"))?;

        tracing::info!(sandbox_id = %id, state = ?created.state, "sandbox created");
        self.wait_until_started(&id, created.state.clone()).await?;

        Ok(SandboxInfo {
            id,
            state: Some("started".to_string()),
        })
    }

    async fn create_folder(&self, sandbox_id: &str, path: &str, mode: &str) -> Result<()> {
        let url = self.toolbox(sandbox_id, "/files/folder");
        let req = self
            .http
            .post(&url)
            .query(&[("path", path), ("mode", mode)]);
        self.send(Method::POST, &url, req).await?;
        Ok(())
    }

    async fn upload_file(&self, sandbox_id: &str, path: &str, content: Vec<u8>) -> Result<()> {
        let url = self.toolbox(sandbox_id, "/files/upload");
        let file_name = path.rsplit('/').next().unwrap_or(path).to_string();
        let part = reqwest::multipart::Part::bytes(content).file_name(file_name);
        let form = reqwest::multipart::Form::new().part("file", part);
        let req = self.http.post(&url).query(&[("path", path)]).multipart(form);
        self.send(Method::POST, &url, req).await?;
        Ok(())
    }

    async fn download_file(&self, sandbox_id: &str, path: &str) -> Result<Vec<u8>> {
        let url = self.toolbox(sandbox_id, "/files/download");
        let req = self.http.get(&url).query(&[("path", path)]);
        let res = self.send(Method::GET, &url, req).await?;
        Ok(res.bytes().await?.to_vec())
    }

    async fn list_files(&self, sandbox_id: &str, path: &str) -> Result<Vec<FileEntry>> {
        let url = self.toolbox(sandbox_id, "/files");
        let req = self.http.get(&url).query(&[("path", path)]);
        self.send_json(Method::GET, &url, req).await
    }

    async fn execute_command(
        &self,
        sandbox_id: &str,
        command: &str,
        cwd: Option<&str>,
    ) -> Result<ExecResponse> {
        let url = self.toolbox(sandbox_id, "/process/execute");
        let mut body = json!({ "command": command });
        if let Some(cwd) = cwd {
            body["cwd"] = json!(cwd);
        }
        self.send_json(Method::POST, &url, self.http.post(&url).json(&body))
            .await
    }

    async fn create_session(&self, sandbox_id: &str, session_id: &str) -> Result<()> {
        let url = self.toolbox(sandbox_id, "/process/session");
        let body = json!({ "sessionId": session_id });
        self.send(Method::POST, &url, self.http.post(&url).json(&body))
            .await?;
        Ok(())
    }

    async fn execute_session_command(
        &self,
        sandbox_id: &str,
        session_id: &str,
        request: SessionExecRequest,
    ) -> Result<SessionCommand> {
        let url = self.toolbox(sandbox_id, &format!("/process/session/{session_id}/exec"));
        self.send_json(Method::POST, &url, self.http.post(&url).json(&request))
            .await
    }

    async fn session_command_logs(
        &self,
        sandbox_id: &str,
        session_id: &str,
        command_id: &str,
    ) -> Result<String> {
        let url = self.toolbox(
            sandbox_id,
            &format!("/process/session/{session_id}/command/{command_id}/logs"),
        );
        let res = self.send(Method::GET, &url, self.http.get(&url)).await?;
        Ok(res.text().await?)
    }

    async fn delete_session(&self, sandbox_id: &str, session_id: &str) -> Result<()> {
        let url = self.toolbox(sandbox_id, &format!("/process/session/{session_id}"));
        self.send(Method::DELETE, &url, self.http.delete(&url))
            .await?;
        Ok(())
    }

    async fn preview_link(&self, sandbox_id: &str, port: u16) -> Result<PreviewLink> {
        let url = self.url(&format!("/sandbox/{sandbox_id}/ports/{port}/preview-url"));
        self.send_json(Method::GET, &url, self.http.get(&url)).await
    }

    async fn create_ssh_access(
        &self,
        sandbox_id: &str,
        expires_in_minutes: u32,
    ) -> Result<SshAccess> {
        let url = self.url(&format!("/sandbox/{sandbox_id}/ssh-access"));
        let req = self
            .http
            .post(&url)
            .query(&[("expiresInMinutes", expires_in_minutes)]);
        self.send_json(Method::POST, &url, req).await
    }

    async fn delete(&self, sandbox_id: &str) -> Result<()> {
        let url = self.url(&format!("/sandbox/{sandbox_id}"));
        self.send(Method::DELETE, &url, self.http.delete(&url))
            .await?;
        Ok(())
    }

    async fn create_snapshot(&self, params: SnapshotParams) -> Result<()> {
        let url = self.url("/snapshots");
        let body = json!({
            "name": params.name,
            "buildInfo": { "dockerfileContent": params.image.to_dockerfile() },
            "cpu": params.resources.cpu,
            "memory": params.resources.memory,
            "disk": params.resources.disk,
        });
        let created: StateResponse = self
            .send_json(Method::POST, &url, self.http.post(&url).json(&body))
            .await?;
        let id = created.id.unwrap_or_else(|| params.name.clone());
        tracing::info!(snapshot = %params.name, snapshot_id = %id, "snapshot build submitted");

        let mut schedule = PollSchedule::new(
            Duration::from_secs(1),
            Duration::from_secs(15),
            self.snapshot_timeout,
        );
        let mut state = created.state;
        let mut seen_log_lines = 0;
        loop {
            self.emit_build_logs(&id, &mut seen_log_lines).await;
            match state.as_deref() {
                Some("active") => return Ok(()),
                Some("error") | Some("build_failed") => {
                    return Err(Error::sandbox(
                        "snapshot",
                        format!("snapshot {} entered state {}", params.name, state.as_deref().unwrap_or_default()),
                    ));
                }
                _ => {}
            }
            if !schedule.tick().await {
                return Err(Error::sandbox(
                    "snapshot",
                    format!("snapshot {} not active within {:?}", params.name, self.snapshot_timeout),
                ));
            }
            let url = self.url(&format!("/snapshots/{id}"));
            let current: StateResponse =
                self.send_json(Method::GET, &url, self.http.get(&url)).await?;
            tracing::debug!(snapshot_id = %id, state = ?current.state, "snapshot build state");
            state = current.state;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::sandbox::provider::{ImageSpec, Resources};

    #[test]
    fn trims_trailing_slashes_from_base_url() {
        let client = DaytonaClient::new("key", "https://example.test/api//", "us").unwrap();
        assert_eq!(client.url("/sandbox"), "https://example.test/api/sandbox");
        assert_eq!(
            client.toolbox("abc", "/files"),
            "https://example.test/api/toolbox/abc/toolbox/files"
        );
    }

    #[test]
    fn rejects_api_key_with_control_characters() {
        let err = DaytonaClient::new("bad\nkey", DEFAULT_API_URL, DEFAULT_TARGET).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn snapshot_source_sets_snapshot_field() {
        let params = CreateSandboxParams {
            source: SandboxSource::Snapshot("effect-docs-snapshot".to_string()),
            env_vars: HashMap::from([("A".to_string(), "1".to_string())]),
            public: true,
            auto_stop_interval: 10,
            resources: None,
        };
        let body = create_body(&params, "us");
        assert_eq!(body["snapshot"], "effect-docs-snapshot");
        assert_eq!(body["autoStopInterval"], 10);
        assert_eq!(body["env"]["A"], "1");
        assert!(body.get("cpu").is_none());
    }

    #[test]
    fn image_source_sends_dockerfile_and_resources() {
        let params = CreateSandboxParams {
            source: SandboxSource::Image(ImageSpec::base("debian:stable-slim")),
            env_vars: HashMap::new(),
            public: true,
            auto_stop_interval: 0,
            resources: Some(Resources::IMAGE),
        };
        let body = create_body(&params, "eu");
        assert_eq!(
            body["buildInfo"]["dockerfileContent"],
            "FROM debian:stable-slim\n"
        );
        assert_eq!(body["cpu"], 2);
        assert_eq!(body["memory"], 3);
        assert_eq!(body["disk"], 4);
        assert_eq!(body["target"], "eu");
    }
}
