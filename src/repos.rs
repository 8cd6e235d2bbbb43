//! Registry of documentation repositories mirrored into sandboxes.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Branch used when a descriptor does not name one.
pub const DEFAULT_BRANCH: &str = "main";

/// One documentation source to mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoDescriptor {
    /// Short name, also the checkout directory name.
    pub name: String,
    /// Human readable name.
    #[serde(default)]
    pub display_name: String,
    /// Git clone URL.
    pub url: String,
    /// Branch to clone. Falls back to [`DEFAULT_BRANCH`].
    #[serde(default)]
    pub branch: Option<String>,
}

impl RepoDescriptor {
    /// Creates a descriptor with an explicit branch.
    pub fn new(
        name: impl Into<String>,
        display_name: impl Into<String>,
        url: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            url: url.into(),
            branch: Some(branch.into()),
        }
    }

    /// Returns the branch to clone.
    pub fn branch(&self) -> &str {
        self.branch.as_deref().unwrap_or(DEFAULT_BRANCH)
    }

    /// Name of the prebuilt snapshot that contains this repo.
    pub fn snapshot_name(&self) -> String {
        format!("{}-docs-snapshot", self.name)
    }
}

/// Ordered table of known repositories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registry {
    repos: Vec<RepoDescriptor>,
}

impl Registry {
    /// Builds a registry from descriptors, keeping their order.
    pub fn new(repos: Vec<RepoDescriptor>) -> Self {
        Self { repos }
    }

    /// Every repository a sandbox can be created for.
    pub fn builtin() -> Self {
        Self::new(vec![
            RepoDescriptor::new("effect", "Effect", "https://github.com/Effect-TS/effect", "main"),
            RepoDescriptor::new(
                "opencode",
                "OpenCode",
                "https://github.com/sst/opencode",
                "production",
            ),
            RepoDescriptor::new(
                "svelte",
                "Svelte",
                "https://github.com/sveltejs/svelte.dev",
                "main",
            ),
            RepoDescriptor::new(
                "daytona",
                "Daytona",
                "https://github.com/daytonaio/daytona",
                "main",
            ),
        ])
    }

    /// Repositories mirrored into a local development volume.
    pub fn local_context() -> Self {
        Self::builtin().subset(&["effect", "svelte"])
    }

    /// Repositories cloned into an image-based sandbox.
    pub fn image_context() -> Self {
        Self::builtin().subset(&["effect", "svelte", "daytona"])
    }

    fn subset(&self, names: &[&str]) -> Self {
        Self::new(
            self.repos
                .iter()
                .filter(|r| names.contains(&r.name.as_str()))
                .cloned()
                .collect(),
        )
    }

    /// Looks up a descriptor by short name.
    pub fn get(&self, name: &str) -> Option<&RepoDescriptor> {
        self.repos.iter().find(|r| r.name == name)
    }

    /// Looks up a descriptor, failing with the list of valid names.
    pub fn require(&self, name: &str) -> Result<&RepoDescriptor> {
        self.get(name).ok_or_else(|| Error::UnknownRepo {
            name: name.to_string(),
            valid: self.names().join(", "),
        })
    }

    /// Short names in registry order.
    pub fn names(&self) -> Vec<&str> {
        self.repos.iter().map(|r| r.name.as_str()).collect()
    }

    pub fn repos(&self) -> &[RepoDescriptor] {
        &self.repos
    }

    pub fn is_empty(&self) -> bool {
        self.repos.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_lists_known_names_in_order() {
        let registry = Registry::builtin();
        assert_eq!(registry.names(), vec!["effect", "opencode", "svelte", "daytona"]);
    }

    #[test]
    fn opencode_tracks_production_branch() {
        let registry = Registry::builtin();
        let repo = registry.get("opencode").unwrap();
        assert_eq!(repo.branch(), "production");
        assert_eq!(repo.snapshot_name(), "opencode-docs-snapshot");
    }

    #[test]
    fn branch_defaults_to_main() {
        let repo = RepoDescriptor {
            name: "x".to_string(),
            display_name: String::new(),
            url: "https://example.com/x".to_string(),
            branch: None,
        };
        assert_eq!(repo.branch(), "main");
    }

    #[test]
    fn require_reports_valid_names() {
        let err = Registry::builtin().require("nope").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("nope"));
        assert!(msg.contains("effect, opencode, svelte, daytona"));
    }

    #[test]
    fn local_context_is_effect_and_svelte() {
        assert_eq!(Registry::local_context().names(), vec!["effect", "svelte"]);
    }

    #[test]
    fn descriptor_deserializes_without_branch() {
        let repo: RepoDescriptor =
            toml::from_str("name = \"docs\"\nurl = \"https://example.com/docs\"").unwrap();
        assert_eq!(repo.branch, None);
        assert_eq!(repo.branch(), "main");
    }
}
