//! Collaborator interface: the external issue tracker and version control.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::subprocess::Tool;

/// Hidden marker prefix embedded in everything tandem writes.
pub const MARKER_PREFIX: &str = "<!-- tandem:";

fn branch_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._/-]*$").expect("branch pattern compiles"))
}

#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("artifact not found: {0}")]
    NotFound(String),
    #[error("refusing unsafe path {0:?}")]
    UnsafePath(String),
    #[error("refusing unsafe branch name {0:?}")]
    UnsafeBranch(String),
    #[error("{operation} failed after {attempts} attempts: {message}")]
    Exhausted {
        operation: String,
        attempts: u32,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactRead {
    Found(String),
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRequest {
    pub branch: String,
    pub title: String,
    pub body: String,
    pub base: String,
    pub files: BTreeMap<String, String>,
    pub idempotency_key: String,
}

pub trait Collaborator: Send + Sync {
    fn read_artifact(&self, path: &str) -> anyhow::Result<ArtifactRead>;
    fn post_comment(&self, issue: u64, text: &str, idempotency_key: &str) -> anyhow::Result<()>;
    /// Returns the delivery id (for `gh`, the pull request URL).
    fn propose_delivery(&self, request: &DeliveryRequest) -> anyhow::Result<String>;
    fn add_labels(&self, issue: u64, labels: &[String]) -> anyhow::Result<()>;
}

/// Stable key for the `round`-th write of `step` on an issue.
pub fn idempotency_key(issue: u64, step: &str, round: usize) -> String {
    let digest = Sha256::digest(format!("tandem:{issue}:{step}:{round}").as_bytes());
    hex::encode(&digest[..12])
}

pub fn marker(key: &str) -> String {
    format!("{MARKER_PREFIX}{key} -->")
}

/// Bounded retries with exponential backoff and jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base: Duration) -> Self {
        Self { max_attempts, base }
    }

    fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(1 << attempt.saturating_sub(1).min(10));
        let jitter_ms = u64::try_from(self.base.as_millis() / 2).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        exp + Duration::from_millis(jitter)
    }

    pub fn run<T>(&self, operation: &str, mut op: impl FnMut(u32) -> anyhow::Result<T>) -> anyhow::Result<T> {
        let attempts = self.max_attempts.max(1);
        let mut last = None;
        for attempt in 1..=attempts {
            match op(attempt) {
                Ok(v) => return Ok(v),
                Err(e) => {
                    warn!(operation, attempt, error = %format!("{e:#}"), "collaborator call failed");
                    last = Some(e);
                    if attempt < attempts {
                        thread::sleep(self.delay(attempt));
                    }
                }
            }
        }
        let message = last.map_or_else(|| "no attempts made".to_string(), |e| format!("{e:#}"));
        error!(operation, attempts, %message, "giving up");
        Err(CollaboratorError::Exhausted {
            operation: operation.to_string(),
            attempts,
            message,
        }
        .into())
    }
}

/// Relative, normal-component paths only.
pub fn validate_path(path: &str) -> Result<&str, CollaboratorError> {
    let p = Path::new(path);
    let ok = !path.is_empty()
        && p.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if ok {
        Ok(path)
    } else {
        Err(CollaboratorError::UnsafePath(path.to_string()))
    }
}

pub fn validate_branch(branch: &str) -> Result<&str, CollaboratorError> {
    if branch_re().is_match(branch) && !branch.contains("..") {
        Ok(branch)
    } else {
        Err(CollaboratorError::UnsafeBranch(branch.to_string()))
    }
}

fn upstream_ref(base: &str) -> String {
    format!("origin/{base}")
}

/// `gh` + `git` adapter working on a local checkout.
#[derive(Debug, Clone)]
pub struct GhCollaborator {
    repository: String,
    base: String,
    checkout: PathBuf,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct IssueComments {
    comments: Vec<CommentBody>,
}

#[derive(Debug, Deserialize)]
struct CommentBody {
    body: String,
}

#[derive(Debug, Deserialize)]
struct PullRequestRef {
    url: String,
}

impl GhCollaborator {
    pub fn new(repository: impl Into<String>, base: impl Into<String>, checkout: impl Into<PathBuf>) -> Self {
        Self {
            repository: repository.into(),
            base: base.into(),
            checkout: checkout.into(),
            timeout: Duration::from_secs(120),
        }
    }

    fn git(&self, args: &[&str]) -> Tool {
        Tool::new("git").args(args).in_dir(&self.checkout).timeout(self.timeout)
    }

    fn gh(&self, args: &[&str]) -> Tool {
        Tool::new("gh")
            .args(args)
            .args(&["--repo", &self.repository])
            .in_dir(&self.checkout)
            .timeout(self.timeout)
    }

    fn already_commented(&self, issue: u64, key: &str) -> anyhow::Result<bool> {
        let number = issue.to_string();
        let existing: IssueComments = self
            .gh(&["issue", "view", &number, "--json", "comments"])
            .run_ok()?
            .parse_json()?;
        let needle = marker(key);
        Ok(existing.comments.iter().any(|c| c.body.contains(&needle)))
    }

    fn open_pull_request(&self, branch: &str) -> anyhow::Result<Option<String>> {
        let prs: Vec<PullRequestRef> = self
            .gh(&["pr", "list", "--head", branch, "--state", "open", "--json", "url"])
            .run_ok()?
            .parse_json()?;
        Ok(prs.into_iter().next().map(|p| p.url))
    }
}

impl Collaborator for GhCollaborator {
    fn read_artifact(&self, path: &str) -> anyhow::Result<ArtifactRead> {
        let path = validate_path(path)?;
        let base = validate_branch(&self.base)?;
        // Read what the delivery branch will be cut from, not the local ref.
        self.git(&["fetch", "origin", base]).run_ok()?;
        let spec = format!("{}:{path}", upstream_ref(base));
        let out = self.git(&["show", &spec]).run()?;
        if out.success() {
            debug!(path, bytes = out.stdout.len(), "read artifact");
            return Ok(ArtifactRead::Found(out.stdout));
        }
        let stderr = out.stderr.to_lowercase();
        if stderr.contains("does not exist") || stderr.contains("exists on disk, but not in") {
            return Ok(ArtifactRead::NotFound);
        }
        anyhow::bail!("git show {spec} failed: {}", out.stderr.trim())
    }

    fn post_comment(&self, issue: u64, text: &str, idempotency_key: &str) -> anyhow::Result<()> {
        if self.already_commented(issue, idempotency_key)? {
            info!(issue, key = idempotency_key, "comment already posted");
            return Ok(());
        }
        let number = issue.to_string();
        let body = format!("{}\n\n{}\n", text.trim_end(), marker(idempotency_key));
        self.gh(&["issue", "comment", &number, "--body-file", "-"])
            .stdin(body)
            .run_ok()?;
        info!(issue, key = idempotency_key, "comment posted");
        Ok(())
    }

    fn propose_delivery(&self, request: &DeliveryRequest) -> anyhow::Result<String> {
        let branch = validate_branch(&request.branch)?;
        validate_branch(&request.base)?;
        if let Some(url) = self.open_pull_request(branch)? {
            info!(branch, %url, "delivery already open");
            return Ok(url);
        }

        let upstream = upstream_ref(&request.base);
        self.git(&["fetch", "origin", &request.base]).run_ok()?;
        self.git(&["checkout", "-B", branch, &upstream]).run_ok()?;
        for (path, content) in &request.files {
            let path = validate_path(path)?;
            let full = self.checkout.join(path);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            std::fs::write(&full, content).with_context(|| format!("writing {}", full.display()))?;
            self.git(&["add", "--", path]).run_ok()?;
        }
        self.git(&["commit", "-m", &request.title]).run_ok()?;
        self.git(&["push", "--force-with-lease", "-u", "origin", branch]).run_ok()?;

        let body = format!("{}\n\n{}\n", request.body.trim_end(), marker(&request.idempotency_key));
        let out = self
            .gh(&[
                "pr", "create", "--base", &request.base, "--head", branch, "--title", &request.title,
                "--body-file", "-",
            ])
            .stdin(body)
            .run_ok()?;
        let url = out.stdout.trim().to_string();
        info!(branch, %url, "delivery opened");
        Ok(url)
    }

    fn add_labels(&self, issue: u64, labels: &[String]) -> anyhow::Result<()> {
        if labels.is_empty() {
            return Ok(());
        }
        let number = issue.to_string();
        let joined = labels.join(",");
        self.gh(&["issue", "edit", &number, "--add-label", &joined]).run_ok()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn keys_are_stable_and_distinct() {
        let a = idempotency_key(7, "clarify", 1);
        assert_eq!(a, idempotency_key(7, "clarify", 1));
        assert_ne!(a, idempotency_key(7, "clarify", 2));
        assert_ne!(a, idempotency_key(8, "clarify", 1));
        assert_eq!(a.len(), 24);
        assert!(marker(&a).starts_with(MARKER_PREFIX));
    }

    #[test]
    fn retry_succeeds_after_transient_failures() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let v = policy
            .run("post_comment", |attempt| {
                calls.set(calls.get() + 1);
                if attempt < 3 {
                    anyhow::bail!("HTTP 502")
                }
                Ok(attempt)
            })
            .unwrap();
        assert_eq!(v, 3);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn retry_is_bounded() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let err = policy
            .run::<()>("propose_delivery", |_| {
                calls.set(calls.get() + 1);
                anyhow::bail!("HTTP 500")
            })
            .unwrap_err();
        assert_eq!(calls.get(), 2);
        assert!(err.to_string().contains("propose_delivery failed after 2 attempts: HTTP 500"));
    }

    #[test]
    fn unsafe_paths_and_branches_are_refused() {
        assert!(validate_path("docs/README.md").is_ok());
        assert!(validate_path("../etc/passwd").is_err());
        assert!(validate_path("/etc/passwd").is_err());
        assert!(validate_path("").is_err());
        assert!(validate_branch("tandem/issue-7").is_ok());
        assert!(validate_branch("-rf").is_err());
        assert!(validate_branch("a..b").is_err());
        assert!(validate_branch("a b").is_err());
    }

    #[test]
    fn gh_reads_artifacts_from_the_fetched_base() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = dir.path().join("upstream");
        let checkout = dir.path().join("checkout");
        std::fs::create_dir(&upstream).unwrap();
        let git = |root: &Path, args: &[&str]| Tool::new("git").args(args).in_dir(root).run_ok().unwrap();
        git(&upstream, &["init", "-q", "-b", "main"]);
        git(&upstream, &["config", "user.email", "t@example.test"]);
        git(&upstream, &["config", "user.name", "t"]);
        std::fs::write(upstream.join("F"), "abc X def").unwrap();
        git(&upstream, &["add", "F"]);
        git(&upstream, &["commit", "-q", "-m", "init"]);
        git(dir.path(), &["clone", "-q", "upstream", "checkout"]);

        // Upstream moves on after the clone; the local main is now stale.
        std::fs::write(upstream.join("F"), "abc X def ghi").unwrap();
        git(&upstream, &["commit", "-q", "-am", "extend"]);

        let collab = GhCollaborator::new("acme/docs", "main", &checkout);
        assert_eq!(
            collab.read_artifact("F").unwrap(),
            ArtifactRead::Found("abc X def ghi".into())
        );
        assert_eq!(collab.read_artifact("missing.md").unwrap(), ArtifactRead::NotFound);
        assert!(collab.read_artifact("../F").is_err());
    }
}
