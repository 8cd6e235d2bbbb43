//! Agent configuration and prompt templating.
//!
//! Renders the three files the documentation server reads at startup:
//! `opencode.json` and the two agent prompts under `prompts/`. Rendering is
//! pure; writing goes either to a local volume or to a sandbox.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sandbox::SandboxApi;

/// File name of the agent configuration.
pub const CONFIG_FILE: &str = "opencode.json";
/// Directory holding the prompt files.
pub const PROMPTS_DIR: &str = "prompts";
/// File name of the documentation agent prompt.
pub const DOCS_PROMPT_FILE: &str = "docs-agent.txt";
/// File name of the general question agent prompt.
pub const ASK_PROMPT_FILE: &str = "ask-agent.txt";

/// Model pinned for both agents in sandboxes.
pub const SANDBOX_MODEL: &str = "opencode/big-pickle";

const RESPONSE_GUIDELINES: &str = "When responding:

- If something about the question is not clear, ask the user to provide more information
- Really try to keep your responses concise, you don't need tons of examples, just one really good one
- Be extremely concise. Sacrifice grammar for the sake of concision.
- When outputting code snippets, include comments that explain what each piece does
- Always bias towards simple practical examples over complex theoretical explanations
- Give your response in markdown format, make sure to have spacing between code blocks and other content
";

const SVELTE_GUIDELINES: &str = "Special instructions for Svelte:

- always use typescript for svelte code (<script lang=\"ts\">)
- if you are just outputting stuff that goes in the script tag, tag the code as typescript code so the syntax highlighting in the view works correctly (AND DO NOT INCLUDE THE SCRIPT TAG IN THE OUTPUT)
- if you are outputting full svelte files (script, markup, styles), tag the code as html so the syntax highlighting in the view works correctly
- always try to answer the questions by just outputting stuff that goes in the script tag, only include markup and styles if absolutely necessary
";

const SEARCH_GUIDELINES: &str = "When asked a question regarding one of the codebases, search the codebase to get an accurate answer.

Always search the codebase first before using the web to try to answer the question.

When you are searching the codebase, be very careful that you do not read too much at once. Only read a small amount at a time as you're searching, avoid reading dozens of files at once...
";

/// Agent permission level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Allow,
    Deny,
    Ask,
}

/// Permissions for actions that leave the read-only sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    pub webfetch: Permission,
    pub edit: Permission,
    pub bash: Permission,
}

/// Tool availability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ToolSet {
    pub write: bool,
    pub bash: bool,
    pub delete: bool,
    pub read: bool,
    pub grep: bool,
    pub glob: bool,
    pub list: bool,
    pub path: bool,
    pub todowrite: bool,
    pub todoread: bool,
    pub websearch: bool,
}

impl ToolSet {
    /// Read and search the filesystem, run shell commands, search the web.
    pub fn codebase_search() -> Self {
        Self {
            bash: true,
            read: true,
            grep: true,
            glob: true,
            list: true,
            websearch: true,
            ..Default::default()
        }
    }

    /// Web search only.
    pub fn web_only() -> Self {
        Self {
            websearch: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    Primary,
    Subagent,
}

/// One named agent in `opencode.json`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    pub disable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission: Option<PermissionSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<AgentMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolSet>,
}

impl AgentConfig {
    fn disabled() -> Self {
        Self {
            disable: true,
            ..Default::default()
        }
    }
}

/// Top-level `opencode.json` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpencodeConfig {
    pub agent: BTreeMap<String, AgentConfig>,
}

/// Inputs for rendering a [`ConfigBundle`].
#[derive(Debug, Clone)]
pub struct TemplateParams {
    /// Directory the repos are checked out under, as seen by the server.
    pub repos_dir: PathBuf,
    /// Repo names available under `repos_dir`.
    pub repo_names: Vec<String>,
    /// Model pinned for both agents, if any.
    pub model: Option<String>,
    /// Shell permission of the documentation agent.
    pub docs_bash: Permission,
}

impl TemplateParams {
    /// Parameters for a sandbox holding one repo under `repos_dir`.
    pub fn sandbox(repos_dir: impl Into<PathBuf>, repo_name: impl Into<String>) -> Self {
        Self {
            repos_dir: repos_dir.into(),
            repo_names: vec![repo_name.into()],
            model: Some(SANDBOX_MODEL.to_string()),
            docs_bash: Permission::Allow,
        }
    }

    /// Parameters for a volume holding several repos under `repos_dir`.
    pub fn volume<I, S>(repos_dir: impl Into<PathBuf>, repo_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            repos_dir: repos_dir.into(),
            repo_names: repo_names.into_iter().map(Into::into).collect(),
            model: None,
            docs_bash: Permission::Ask,
        }
    }

    /// Path of one repo as listed in the docs prompt.
    pub fn repo_path(&self, name: &str) -> PathBuf {
        self.repos_dir.join(name)
    }
}

/// Builds the agent configuration document.
pub fn opencode_config(params: &TemplateParams) -> OpencodeConfig {
    let mut agent = BTreeMap::new();
    for name in ["build", "general", "codebase-docs-agent", "plan"] {
        agent.insert(name.to_string(), AgentConfig::disabled());
    }

    agent.insert(
        "docs".to_string(),
        AgentConfig {
            prompt: Some(format!("{{file:./{PROMPTS_DIR}/{DOCS_PROMPT_FILE}}}")),
            disable: false,
            model: params.model.clone(),
            description: Some(
                "Get answers about libraries and frameworks by searching their source code"
                    .to_string(),
            ),
            permission: Some(PermissionSet {
                webfetch: Permission::Ask,
                edit: Permission::Deny,
                bash: params.docs_bash,
            }),
            mode: Some(AgentMode::Primary),
            tools: Some(ToolSet::codebase_search()),
        },
    );

    agent.insert(
        "ask".to_string(),
        AgentConfig {
            prompt: Some(format!("{{file:./{PROMPTS_DIR}/{ASK_PROMPT_FILE}}}")),
            disable: false,
            model: params.model.clone(),
            description: Some("Answer coding questions from the user".to_string()),
            permission: Some(PermissionSet {
                webfetch: Permission::Ask,
                edit: Permission::Deny,
                bash: Permission::Deny,
            }),
            mode: Some(AgentMode::Primary),
            tools: Some(ToolSet::web_only()),
        },
    );

    OpencodeConfig { agent }
}

/// Renders the documentation agent prompt listing every repo path.
pub fn docs_prompt(params: &TemplateParams) -> String {
    let listing = params
        .repo_names
        .iter()
        .map(|name| format!("- {}: {}", name, params.repo_path(name).display()))
        .collect::<Vec<_>>()
        .join("\n");

    let access = if params.repo_names.len() == 1 {
        "Currently you have access to the following codebase at the following path:"
    } else {
        "Currently you have access to the following codebases at the following paths:"
    };

    format!(
        "\nYou are an expert internal agent who's job is to answer coding questions and provide accurate and up to date info on different technologies, libraries, frameworks, or tools you're using based on the library codebases you have access to.\n\n{access}\n\n{listing}\n\n{SEARCH_GUIDELINES}\n{RESPONSE_GUIDELINES}\n{SVELTE_GUIDELINES}"
    )
}

/// Renders the general question agent prompt.
pub fn ask_prompt() -> String {
    format!(
        "\nYou are an expert internal agent who's job is to answer coding questions from the user.\n\n{RESPONSE_GUIDELINES}\n{SVELTE_GUIDELINES}"
    )
}

/// Destination paths of a written bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundlePaths {
    pub config: PathBuf,
    pub docs_prompt: PathBuf,
    pub ask_prompt: PathBuf,
}

impl BundlePaths {
    /// Standard layout under `root`.
    pub fn under(root: &Path) -> Self {
        let prompts = root.join(PROMPTS_DIR);
        Self {
            config: root.join(CONFIG_FILE),
            docs_prompt: prompts.join(DOCS_PROMPT_FILE),
            ask_prompt: prompts.join(ASK_PROMPT_FILE),
        }
    }
}

/// The three rendered artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigBundle {
    pub config_json: String,
    pub docs_prompt: String,
    pub ask_prompt: String,
}

impl ConfigBundle {
    /// Renders every artifact from `params`.
    pub fn render(params: &TemplateParams) -> Result<Self> {
        let config_json = serde_json::to_string_pretty(&opencode_config(params))?;
        Ok(Self {
            config_json,
            docs_prompt: docs_prompt(params),
            ask_prompt: ask_prompt(),
        })
    }

    /// Writes the bundle under a local `root`, overwriting prior files.
    pub async fn write_to_dir(&self, root: &Path) -> Result<BundlePaths> {
        let paths = BundlePaths::under(root);
        tokio::fs::create_dir_all(root.join(PROMPTS_DIR)).await?;

        tokio::try_join!(
            tokio::fs::write(&paths.config, &self.config_json),
            tokio::fs::write(&paths.docs_prompt, &self.docs_prompt),
            tokio::fs::write(&paths.ask_prompt, &self.ask_prompt),
        )?;

        Ok(paths)
    }

    /// Uploads the bundle under `root` inside a sandbox.
    ///
    /// The three uploads run concurrently; any failure fails the whole step.
    pub async fn upload_to_sandbox(
        &self,
        api: &dyn SandboxApi,
        sandbox_id: &str,
        root: &Path,
    ) -> Result<BundlePaths> {
        let paths = BundlePaths::under(root);
        let remote = |p: &Path| p.to_string_lossy().into_owned();

        api.create_folder(sandbox_id, &remote(&root.join(PROMPTS_DIR)), "755")
            .await
            .map_err(|e| Error::sandbox("create prompts folder", e))?;

        let docs_path = remote(&paths.docs_prompt);
        let ask_path = remote(&paths.ask_prompt);
        let config_path = remote(&paths.config);
        tokio::try_join!(
            api.upload_file(
                sandbox_id,
                &docs_path,
                self.docs_prompt.clone().into_bytes()
            ),
            api.upload_file(
                sandbox_id,
                &ask_path,
                self.ask_prompt.clone().into_bytes()
            ),
            api.upload_file(
                sandbox_id,
                &config_path,
                self.config_json.clone().into_bytes()
            ),
        )
        .map_err(|e| Error::sandbox("sync config", e))?;

        Ok(paths)
    }
}
