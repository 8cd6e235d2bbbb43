//! Repo sync behaviour against a recording git backend.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use docs_sandbox::sync::{report, sync_repos, GitBackend, SyncAction, SyncOptions, SyncOutcome};
use docs_sandbox::{Error, RepoDescriptor, Result};

#[derive(Default)]
struct RecordingGit {
    existing: HashSet<PathBuf>,
    failing: HashSet<String>,
    clones: Mutex<Vec<Vec<String>>>,
    pulls: Mutex<Vec<PathBuf>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl RecordingGit {
    fn with_existing(mut self, path: impl Into<PathBuf>) -> Self {
        self.existing.insert(path.into());
        self
    }

    fn failing_on(mut self, needle: &str) -> Self {
        self.failing.insert(needle.to_string());
        self
    }

    async fn work(&self, subject: &str) -> Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.iter().any(|needle| subject.contains(needle.as_str())) {
            return Err(Error::Git(format!("{subject}: exit status 128")));
        }
        Ok(())
    }
}

#[async_trait]
impl GitBackend for RecordingGit {
    async fn prepare(&self, _base_dir: &Path) -> Result<()> {
        Ok(())
    }

    async fn is_dir(&self, path: &Path) -> Result<bool> {
        Ok(self.existing.contains(path))
    }

    async fn clone_repo(&self, args: &[String]) -> Result<()> {
        self.clones.lock().unwrap().push(args.to_vec());
        self.work(&args.join(" ")).await
    }

    async fn pull(&self, repo_path: &Path) -> Result<()> {
        self.pulls.lock().unwrap().push(repo_path.to_path_buf());
        self.work(&repo_path.to_string_lossy()).await
    }

    async fn current_branch(&self, _repo_path: &Path) -> Result<String> {
        Ok("main".to_string())
    }
}

fn repo(name: &str, branch: Option<&str>) -> RepoDescriptor {
    RepoDescriptor {
        name: name.to_string(),
        display_name: name.to_string(),
        url: format!("https://example.test/{name}.git"),
        branch: branch.map(String::from),
    }
}

#[tokio::test]
async fn existing_checkout_is_pulled_never_cloned() {
    let git = Arc::new(RecordingGit::default().with_existing("/vol/repos/effect"));
    let results = sync_repos(
        git.clone(),
        &[repo("effect", None)],
        Path::new("/vol/repos"),
        &SyncOptions::default(),
    )
    .await
    .unwrap();

    assert!(git.clones.lock().unwrap().is_empty());
    assert_eq!(*git.pulls.lock().unwrap(), vec![PathBuf::from("/vol/repos/effect")]);
    assert!(matches!(
        results[0].outcome,
        SyncOutcome::Synced {
            action: SyncAction::Pulled,
            ..
        }
    ));
}

#[tokio::test]
async fn missing_checkout_is_shallow_cloned_on_its_branch() {
    let git = Arc::new(RecordingGit::default());
    sync_repos(
        git.clone(),
        &[repo("opencode", Some("production")), repo("svelte", None)],
        Path::new("/vol/repos"),
        &SyncOptions::default(),
    )
    .await
    .unwrap();

    let mut clones = git.clones.lock().unwrap().clone();
    // Sorted by target directory.
    clones.sort_by(|a, b| a.last().cmp(&b.last()));
    assert_eq!(
        clones,
        vec![
            vec![
                "clone",
                "--depth",
                "1",
                "--single-branch",
                "--branch",
                "production",
                "https://example.test/opencode.git",
                "/vol/repos/opencode",
            ],
            vec![
                "clone",
                "--depth",
                "1",
                "--single-branch",
                "--branch",
                "main",
                "https://example.test/svelte.git",
                "/vol/repos/svelte",
            ],
        ]
    );
    assert!(git.pulls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn failures_are_isolated_and_ordered() {
    let git = Arc::new(
        RecordingGit::default()
            .with_existing("/vol/repos/b")
            .failing_on("/vol/repos/b")
            .failing_on("d.git"),
    );
    let repos: Vec<_> = ["a", "b", "c", "d", "e", "f", "g"]
        .iter()
        .map(|name| repo(name, None))
        .collect();

    let results = sync_repos(git, &repos, Path::new("/vol/repos"), &SyncOptions::default())
        .await
        .unwrap();

    assert_eq!(results.len(), 7);
    let names: Vec<_> = results.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, ["a", "b", "c", "d", "e", "f", "g"]);

    let failed: Vec<_> = results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.name.as_str())
        .collect();
    assert_eq!(failed, ["b", "d"]);
    assert_eq!(report(&results).len(), 5);
    assert_eq!(results[2].path(), Some(Path::new("/vol/repos/c")));
}

#[tokio::test]
async fn never_more_than_five_in_flight() {
    let git = Arc::new(RecordingGit::default());
    let repos: Vec<_> = (0..12).map(|i| repo(&format!("repo-{i}"), None)).collect();

    let results = sync_repos(
        git.clone(),
        &repos,
        Path::new("/vol/repos"),
        &SyncOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(results.len(), 12);
    let peak = git.peak.load(Ordering::SeqCst);
    assert!(peak <= 5, "peak concurrency was {peak}");
    assert!(peak > 1, "sync did not run concurrently");
}

#[tokio::test]
async fn duplicate_descriptors_each_get_a_result() {
    let git = Arc::new(RecordingGit::default());
    let repos = vec![repo("effect", None), repo("effect", None)];

    let results = sync_repos(git.clone(), &repos, Path::new("/vol"), &SyncOptions::default())
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(git.clones.lock().unwrap().len(), 2);
}
