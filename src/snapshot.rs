//! Per-repo snapshot images.
//!
//! A snapshot bakes the documentation server and one shallow checkout into an
//! image so sandboxes created from it start without cloning.

use std::path::Path;

use crate::error::{Error, Result};
use crate::repos::RepoDescriptor;
use crate::sandbox::{ImageSpec, Resources, SandboxApi, SnapshotParams};
use crate::sync::{clone_args, shell_join};

/// Base image for every sandbox this crate builds.
pub const BASE_IMAGE: &str = "debian:stable-slim";

/// Checkout directory inside the image, relative to the build workdir.
pub const IMAGE_REPOS_DIR: &str = "context/repos";

/// Debian with git, bun and the documentation server installed.
pub fn runtime_image() -> ImageSpec {
    ImageSpec::base(BASE_IMAGE)
        .run_commands([
            "apt-get update",
            "apt-get install -y git curl unzip && rm -rf /var/lib/apt/lists/*",
            "curl -fsSL https://bun.com/install | bash",
        ])
        .dockerfile_commands(["ENV BUN_INSTALL=/root/.bun", "ENV PATH=$BUN_INSTALL/bin:$PATH"])
        .run_commands(["bun add -g opencode-ai@latest"])
}

/// [`runtime_image`] plus a shallow clone of `repo`.
pub fn snapshot_image(repo: &RepoDescriptor) -> ImageSpec {
    let target = Path::new(IMAGE_REPOS_DIR).join(&repo.name);
    let clone = shell_join(&clone_args(repo, &target));
    runtime_image().run_commands([format!("mkdir -p {IMAGE_REPOS_DIR} && git {clone}")])
}

pub fn snapshot_params(repo: &RepoDescriptor, resources: Resources) -> SnapshotParams {
    SnapshotParams {
        name: repo.snapshot_name(),
        image: snapshot_image(repo),
        resources,
    }
}

/// Builds the snapshot for `repo` and waits until it is usable.
pub async fn build_snapshot(
    api: &dyn SandboxApi,
    repo: &RepoDescriptor,
    resources: Resources,
) -> Result<String> {
    let params = snapshot_params(repo, resources);
    let name = params.name.clone();

    tracing::info!(snapshot = %name, repo = %repo.name, "creating snapshot");
    api.create_snapshot(params).await.map_err(|e| {
        tracing::error!(snapshot = %name, error = %e, "failed to create snapshot");
        Error::sandbox("create snapshot", e)
    })?;
    tracing::info!(snapshot = %name, "snapshot created successfully");

    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repos::Registry;
    use crate::sandbox::InMemorySandboxApi;

    #[test]
    fn svelte_snapshot_clones_svelte_dev() {
        let registry = Registry::builtin();
        let repo = registry.require("svelte").unwrap();
        let dockerfile = snapshot_image(repo).to_dockerfile();

        assert!(dockerfile.starts_with("FROM debian:stable-slim\nRUN apt-get update\n"));
        assert!(dockerfile.contains("ENV PATH=$BUN_INSTALL/bin:$PATH\nRUN bun add -g opencode-ai@latest\n"));
        assert!(dockerfile.ends_with(
            "RUN mkdir -p context/repos && git clone --depth 1 --single-branch --branch main \
             https://github.com/sveltejs/svelte.dev context/repos/svelte\n"
        ));
    }

    #[test]
    fn clone_command_quotes_profile_values() {
        let repo = RepoDescriptor::new("docs", "Docs", "https://example.com/a b", "main");
        let dockerfile = snapshot_image(&repo).to_dockerfile();
        assert!(dockerfile.contains("--branch main 'https://example.com/a b' context/repos/docs\n"));
    }

    #[test]
    fn snapshot_uses_descriptor_branch() {
        let registry = Registry::builtin();
        let params = snapshot_params(registry.require("opencode").unwrap(), Resources::SNAPSHOT);
        assert_eq!(params.name, "opencode-docs-snapshot");
        assert!(params.image.to_dockerfile().contains("--branch production"));
        assert_eq!(params.resources, Resources::SNAPSHOT);
    }

    #[tokio::test]
    async fn build_records_snapshot_name() {
        let api = InMemorySandboxApi::new();
        let registry = Registry::builtin();
        let name = build_snapshot(&api, registry.require("effect").unwrap(), Resources::SNAPSHOT)
            .await
            .unwrap();
        assert_eq!(name, "effect-docs-snapshot");
        assert_eq!(api.snapshots(), vec!["effect-docs-snapshot"]);
    }

    #[tokio::test]
    async fn build_failure_is_sandbox_error() {
        let api = InMemorySandboxApi::new();
        api.fail_op("create_snapshot");
        let registry = Registry::builtin();
        let err = build_snapshot(&api, registry.require("effect").unwrap(), Resources::SNAPSHOT)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Sandbox { op: "create snapshot", .. }));
    }
}
