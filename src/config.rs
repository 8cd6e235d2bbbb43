//! Runtime settings and validation.
//!
//! Every binary is configured from environment variables. An optional TOML
//! profile named by `DOCS_SANDBOX_CONFIG` can replace the repo registry and
//! the sandbox sizing.
//!
//! Environment variables:
//! - `DAYTONA_API_KEY` - credential for the hosted sandbox API
//! - `DAYTONA_API_URL` / `DAYTONA_TARGET` - API endpoint and region
//! - `OPENCODE_API_KEY` - forwarded into sandboxes (default empty)
//! - `RUN_IN_BACKGROUND=true` - keep the sandbox alive on shutdown
//! - `VOLUME_ROOT` - local volume (default `<cwd>/dev-vol`)
//! - `SANDBOX_REPO` / `SNAPSHOT_REPO` - repo selection for the remote variants
//! - `SANDBOX_BACKEND=daytona|memory` - `memory` runs without a remote API
//! - `EXIT_POLICY=clean|strict` - how failures map to the exit status
//! - `SERVER_PORT` - HTTP variant listen port (default 8080)
//! - `OPENCODE_BIN` - server executable for the local variant

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::repos::{RepoDescriptor, Registry};
use crate::sandbox::{
    DaytonaClient, InMemorySandboxApi, Resources, SandboxApi, DEFAULT_API_URL, DEFAULT_TARGET,
};

/// Repo used by the snapshot sandbox variant when `SANDBOX_REPO` is unset.
pub const DEFAULT_SANDBOX_REPO: &str = "opencode";

/// Port the HTTP variant listens on by default.
pub const DEFAULT_SERVER_PORT: u16 = 8080;

/// Volume directory name under the working directory.
pub const DEFAULT_VOLUME_DIR: &str = "dev-vol";

/// Which [`SandboxApi`] implementation the binaries talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SandboxBackend {
    #[default]
    Daytona,
    Memory,
}

impl FromStr for SandboxBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daytona" => Ok(Self::Daytona),
            "memory" => Ok(Self::Memory),
            other => Err(Error::Config(format!(
                "unknown SANDBOX_BACKEND '{}', expected daytona or memory",
                other
            ))),
        }
    }
}

/// How a failed run maps to the process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitPolicy {
    /// Log the failure and exit 0.
    Clean,
    /// Log the failure and exit 1.
    Strict,
}

impl ExitPolicy {
    /// Whether `result` should produce a failing exit status.
    pub fn is_failure(self, result: &Result<()>) -> bool {
        result.is_err() && self == Self::Strict
    }

    /// Converts the outcome of a run into an exit status, logging any error.
    pub fn exit_code(self, result: &Result<()>) -> ExitCode {
        if let Err(e) = result {
            tracing::error!(error = %e, policy = ?self, "run failed");
        }
        if self.is_failure(result) {
            ExitCode::FAILURE
        } else {
            ExitCode::SUCCESS
        }
    }
}

impl FromStr for ExitPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "clean" => Ok(Self::Clean),
            "strict" => Ok(Self::Strict),
            other => Err(Error::Config(format!(
                "unknown EXIT_POLICY '{}', expected clean or strict",
                other
            ))),
        }
    }
}

/// Sandbox sizing for the two remote build paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ResourceProfile {
    #[serde(default = "snapshot_resources")]
    pub snapshot: Resources,
    #[serde(default = "image_resources")]
    pub image: Resources,
}

fn snapshot_resources() -> Resources {
    Resources::SNAPSHOT
}

fn image_resources() -> Resources {
    Resources::IMAGE
}

impl Default for ResourceProfile {
    fn default() -> Self {
        Self {
            snapshot: Resources::SNAPSHOT,
            image: Resources::IMAGE,
        }
    }
}

/// Optional TOML overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Profile {
    /// Replaces the built-in registry when present.
    #[serde(default)]
    pub repos: Option<Vec<RepoDescriptor>>,
    /// Replaces the repos cloned into local volumes and image sandboxes.
    #[serde(default)]
    pub context_repos: Option<Vec<String>>,
    /// Replaces the repos cloned into image sandboxes.
    #[serde(default)]
    pub image_repos: Option<Vec<String>>,
    #[serde(default)]
    pub resources: Option<ResourceProfile>,
}

impl Profile {
    /// Parses a profile from TOML text.
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("invalid profile: {}", e)))
    }

    /// Reads and parses a profile file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::parse(&text)
    }
}

/// Resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub daytona_api_key: Option<String>,
    pub daytona_api_url: String,
    pub daytona_target: String,
    pub opencode_api_key: String,
    pub run_in_background: bool,
    pub volume_root: PathBuf,
    pub sandbox_repo: String,
    pub snapshot_repo: Option<String>,
    pub backend: SandboxBackend,
    /// Explicit override; each binary supplies its own default.
    pub exit_policy: Option<ExitPolicy>,
    pub server_port: u16,
    pub opencode_bin: String,
    pub registry: Registry,
    /// Names of the repos cloned into local volumes.
    pub context_repos: Vec<String>,
    /// Names of the repos cloned into image sandboxes.
    pub image_repos: Vec<String>,
    pub resources: ResourceProfile,
}

impl Settings {
    /// Loads settings from the process environment.
    pub fn from_env() -> Result<Self> {
        let cwd = std::env::current_dir()?;
        Self::from_lookup(|key| std::env::var(key).ok(), &cwd)
    }

    /// Loads settings from an arbitrary variable source.
    ///
    /// Relative paths default against `cwd`.
    pub fn from_lookup<F>(lookup: F, cwd: &Path) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let profile = match var("DOCS_SANDBOX_CONFIG") {
            Some(path) => Profile::load(&cwd.join(path))?,
            None => Profile::default(),
        };

        let server_port = match var("SERVER_PORT") {
            Some(port) => port
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("invalid SERVER_PORT '{}'", port)))?,
            None => DEFAULT_SERVER_PORT,
        };

        let names = |registry: &Registry| -> Vec<String> {
            registry.names().into_iter().map(String::from).collect()
        };
        // A replaced registry makes the builtin subsets meaningless, so
        // unset subsets cover the whole replacement.
        let (registry, context_default, image_default) = match profile.repos {
            Some(repos) => {
                let registry = Registry::new(repos);
                let all = names(&registry);
                (registry, all.clone(), all)
            }
            None => (
                Registry::builtin(),
                names(&Registry::local_context()),
                names(&Registry::image_context()),
            ),
        };
        let context_repos = profile.context_repos.unwrap_or(context_default);
        let image_repos = profile.image_repos.unwrap_or(image_default);

        Ok(Self {
            daytona_api_key: var("DAYTONA_API_KEY"),
            daytona_api_url: var("DAYTONA_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            daytona_target: var("DAYTONA_TARGET").unwrap_or_else(|| DEFAULT_TARGET.to_string()),
            opencode_api_key: lookup("OPENCODE_API_KEY").unwrap_or_default(),
            run_in_background: lookup("RUN_IN_BACKGROUND").as_deref() == Some("true"),
            volume_root: var("VOLUME_ROOT")
                .map(|v| cwd.join(v))
                .unwrap_or_else(|| cwd.join(DEFAULT_VOLUME_DIR)),
            sandbox_repo: var("SANDBOX_REPO").unwrap_or_else(|| DEFAULT_SANDBOX_REPO.to_string()),
            snapshot_repo: var("SNAPSHOT_REPO"),
            backend: var("SANDBOX_BACKEND")
                .map(|v| v.parse())
                .transpose()?
                .unwrap_or_default(),
            exit_policy: var("EXIT_POLICY").map(|v| v.parse()).transpose()?,
            server_port,
            opencode_bin: var("OPENCODE_BIN").unwrap_or_else(|| "opencode".to_string()),
            registry,
            context_repos,
            image_repos,
            resources: profile.resources.unwrap_or_default(),
        })
    }

    /// Exit policy to apply, falling back to the binary's default.
    pub fn exit_policy_or(&self, default: ExitPolicy) -> ExitPolicy {
        self.exit_policy.unwrap_or(default)
    }

    /// The Daytona credential, required by every remote variant.
    pub fn require_api_key(&self) -> Result<&str> {
        self.daytona_api_key
            .as_deref()
            .ok_or_else(|| Error::Config("DAYTONA_API_KEY is not set".to_string()))
    }

    /// Registry subset cloned into local volumes.
    ///
    /// Names missing from the registry are an error.
    pub fn context_registry(&self) -> Result<Registry> {
        self.subset(&self.context_repos)
    }

    /// Registry subset cloned into image sandboxes.
    pub fn image_registry(&self) -> Result<Registry> {
        self.subset(&self.image_repos)
    }

    fn subset(&self, names: &[String]) -> Result<Registry> {
        let repos = names
            .iter()
            .map(|name| self.registry.require(name).cloned())
            .collect::<Result<Vec<_>>>()?;
        Ok(Registry::new(repos))
    }

    /// Builds the configured sandbox API client.
    pub fn sandbox_api(&self) -> Result<Arc<dyn SandboxApi>> {
        match self.backend {
            SandboxBackend::Daytona => {
                let client = DaytonaClient::new(
                    self.require_api_key()?,
                    self.daytona_api_url.clone(),
                    self.daytona_target.clone(),
                )?;
                Ok(Arc::new(client))
            }
            SandboxBackend::Memory => {
                tracing::warn!("using in-memory sandbox backend, nothing is provisioned");
                Ok(Arc::new(InMemorySandboxApi::new()))
            }
        }
    }
}

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Logs warnings and fails if there are errors.
    pub fn into_result(self) -> Result<()> {
        for warning in &self.warnings {
            tracing::warn!(warning = %warning, "configuration warning");
        }
        if self.is_valid() {
            Ok(())
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

impl Validate for Resources {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        if self.cpu == 0 || self.memory == 0 || self.disk == 0 {
            result.add_error(format!(
                "resources must be non-zero (cpu {}, memory {}, disk {})",
                self.cpu, self.memory, self.disk
            ));
        }
        result
    }
}

/// Names become checkout directories and snapshot names.
fn is_valid_repo_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(['.', '-'])
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

impl Validate for Registry {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.is_empty() {
            result.add_error("repository registry is empty");
        }

        let mut seen = std::collections::HashSet::new();
        for repo in self.repos() {
            if !is_valid_repo_name(&repo.name) {
                result.add_error(format!("invalid repository name '{}'", repo.name));
            }
            // Leading dashes would be read by git as options.
            if repo.url.starts_with('-') || repo.branch().starts_with('-') {
                result.add_error(format!(
                    "repository '{}' has a url or branch starting with '-'",
                    repo.name
                ));
            }
            if repo.url.trim().is_empty() {
                result.add_error(format!("repository '{}' has no url", repo.name));
            }
            // Duplicates are synced twice into the same directory.
            if !seen.insert(repo.name.as_str()) {
                result.add_warning(format!("repository '{}' listed more than once", repo.name));
            }
        }

        result
    }
}

impl Validate for Settings {
    fn validate(&self) -> ValidationResult {
        let mut result = self.registry.validate();
        result.merge(self.resources.snapshot.validate());
        result.merge(self.resources.image.validate());

        if self.server_port == 0 {
            result.add_error("SERVER_PORT must be non-zero");
        }

        for name in self.context_repos.iter().chain(&self.image_repos) {
            if self.registry.get(name).is_none() {
                result.add_error(format!("context repo '{}' is not in the registry", name));
            }
        }

        if self.registry.get(&self.sandbox_repo).is_none() {
            result.add_warning(format!(
                "SANDBOX_REPO '{}' is not in the registry",
                self.sandbox_repo
            ));
        }

        if self.opencode_api_key.is_empty() {
            result.add_warning("OPENCODE_API_KEY is empty");
        }

        if self.backend == SandboxBackend::Daytona && self.daytona_api_key.is_none() {
            result.add_warning("DAYTONA_API_KEY is not set, remote variants will fail");
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings> {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|k| env.get(k).cloned(), Path::new("/work"))
    }

    #[test]
    fn defaults_without_environment() {
        let s = settings(&[]).unwrap();
        assert_eq!(s.volume_root, PathBuf::from("/work/dev-vol"));
        assert_eq!(s.sandbox_repo, "opencode");
        assert_eq!(s.server_port, 8080);
        assert_eq!(s.backend, SandboxBackend::Daytona);
        assert_eq!(s.daytona_api_url, DEFAULT_API_URL);
        assert_eq!(s.context_repos, vec!["effect", "svelte"]);
        assert_eq!(s.image_repos, vec!["effect", "svelte", "daytona"]);
        assert!(!s.run_in_background);
        assert!(s.exit_policy.is_none());
        assert_eq!(s.resources, ResourceProfile::default());
    }

    #[test]
    fn background_requires_literal_true() {
        assert!(settings(&[("RUN_IN_BACKGROUND", "true")]).unwrap().run_in_background);
        assert!(!settings(&[("RUN_IN_BACKGROUND", "1")]).unwrap().run_in_background);
        assert!(!settings(&[("RUN_IN_BACKGROUND", "TRUE")]).unwrap().run_in_background);
    }

    #[test]
    fn parses_overrides() {
        let s = settings(&[
            ("VOLUME_ROOT", "/data/vol"),
            ("SANDBOX_BACKEND", "memory"),
            ("EXIT_POLICY", "strict"),
            ("SERVER_PORT", "9090"),
            ("SNAPSHOT_REPO", "effect"),
        ])
        .unwrap();
        assert_eq!(s.volume_root, PathBuf::from("/data/vol"));
        assert_eq!(s.backend, SandboxBackend::Memory);
        assert_eq!(s.exit_policy_or(ExitPolicy::Clean), ExitPolicy::Strict);
        assert_eq!(s.server_port, 9090);
        assert_eq!(s.snapshot_repo.as_deref(), Some("effect"));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            settings(&[("SERVER_PORT", "http")]),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            settings(&[("EXIT_POLICY", "sometimes")]),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn missing_api_key_is_config_error() {
        let s = settings(&[]).unwrap();
        assert!(matches!(s.require_api_key(), Err(Error::Config(_))));
        assert!(s.sandbox_api().is_err());
    }

    #[test]
    fn memory_backend_needs_no_key() {
        let s = settings(&[("SANDBOX_BACKEND", "memory")]).unwrap();
        assert!(s.sandbox_api().is_ok());
    }

    #[test]
    fn profile_replaces_registry_and_resources() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
context_repos = ["tokio"]
image_repos = ["tokio"]

[[repos]]
name = "tokio"
url = "https://github.com/tokio-rs/tokio"
branch = "master"

[resources.image]
cpu = 4
memory = 8
disk = 10
"#
        )
        .unwrap();

        let path = file.path().to_string_lossy().into_owned();
        let s = settings(&[("DOCS_SANDBOX_CONFIG", path.as_str())]).unwrap();

        assert_eq!(s.registry.names(), vec!["tokio"]);
        assert_eq!(s.context_registry().unwrap().names(), vec!["tokio"]);
        assert_eq!(s.resources.snapshot, Resources::SNAPSHOT);
        assert_eq!(s.resources.image.memory, 8);
    }

    #[test]
    fn registry_only_profile_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[[repos]]
name = "tokio"
url = "https://github.com/tokio-rs/tokio"

[[repos]]
name = "axum"
url = "https://github.com/tokio-rs/axum"
"#
        )
        .unwrap();

        let path = file.path().to_string_lossy().into_owned();
        let s = settings(&[
            ("DOCS_SANDBOX_CONFIG", path.as_str()),
            ("SANDBOX_REPO", "tokio"),
            ("OPENCODE_API_KEY", "k"),
        ])
        .unwrap();

        assert_eq!(s.context_repos, vec!["tokio", "axum"]);
        assert_eq!(s.image_repos, vec!["tokio", "axum"]);
        assert!(s.validate().into_result().is_ok());
        assert_eq!(s.image_registry().unwrap().names(), vec!["tokio", "axum"]);
    }

    #[test]
    fn registry_rejects_unsafe_names_and_options() {
        let registry = Registry::new(vec![
            RepoDescriptor::new("ok-repo_1.x", "", "https://example.com/ok", "main"),
            RepoDescriptor::new("bad name; rm", "", "https://example.com/a", "main"),
            RepoDescriptor::new("..", "", "https://example.com/b", "main"),
            RepoDescriptor::new("flag", "", "--upload-pack=touch", "main"),
        ]);
        let result = registry.validate();
        assert_eq!(result.errors.len(), 3, "{:?}", result.errors);
        assert!(result.errors[0].contains("bad name; rm"));
        assert!(result.errors[1].contains("'..'"));
        assert!(result.errors[2].contains("'flag'"));
    }

    #[test]
    fn validation_flags_unknown_context_repo() {
        let mut s = settings(&[("OPENCODE_API_KEY", "k")]).unwrap();
        s.context_repos.push("nope".to_string());
        let result = s.validate();
        assert!(!result.is_valid());
        assert!(result.errors[0].contains("nope"));
        assert!(s.context_registry().is_err());
    }

    #[test]
    fn validation_rejects_zero_resources() {
        let result = Resources {
            cpu: 0,
            memory: 1,
            disk: 1,
        }
        .validate();
        assert!(!result.is_valid());
    }

    #[test]
    fn clean_policy_masks_failure() {
        let err: Result<()> = Err(Error::Config("x".to_string()));
        assert!(!ExitPolicy::Clean.is_failure(&err));
        assert!(ExitPolicy::Strict.is_failure(&err));
        assert!(!ExitPolicy::Strict.is_failure(&Ok(())));
    }
}
