//! Durable per-issue workflow records.
//!
//! One pretty-printed JSON file per issue under the state directory, always
//! replaced atomically. Cancel requests are marker files next to it, and a
//! lock file marks the one process currently advancing a workflow.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::intake::IssueRef;
use super::state::WorkflowState;
use crate::analyst::{Clarification, ClarificationQuestion, RequirementsSpec};
use crate::model::{StructuredOutput, TaskPairResult};
use crate::pair::Journal;
use crate::verify::VerificationSuite;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub from: String,
    pub to: String,
    pub event: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationRound {
    pub questions: Vec<ClarificationQuestion>,
    pub asked_at: DateTime<Utc>,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub answered_at: Option<DateTime<Utc>>,
}

/// Everything needed to resume a workflow after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub issue: IssueRef,
    pub state: WorkflowState,
    #[serde(default)]
    pub history: Vec<StateChange>,
    /// One per delegated pair run, in delegation order.
    #[serde(default)]
    pub results: Vec<TaskPairResult>,
    #[serde(default)]
    pub requirements: Option<RequirementsSpec>,
    #[serde(default)]
    pub clarifications: Vec<ClarificationRound>,
    /// Artifact contents as read before any change was proposed.
    #[serde(default)]
    pub originals: BTreeMap<String, String>,
    #[serde(default)]
    pub verification: Option<VerificationSuite>,
    #[serde(default)]
    pub implementation: Option<StructuredOutput>,
    /// Identifier returned by the tracker once the delivery went through.
    #[serde(default)]
    pub delivery_id: Option<String>,
    /// Idempotency keys of writes that already went through.
    #[serde(default)]
    pub completed_writes: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRecord {
    pub fn new(issue: IssueRef) -> Self {
        let now = Utc::now();
        Self {
            issue,
            state: WorkflowState::Received,
            history: Vec::new(),
            results: Vec::new(),
            requirements: None,
            clarifications: Vec::new(),
            originals: BTreeMap::new(),
            verification: None,
            implementation: None,
            delivery_id: None,
            completed_writes: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Answered rounds, in the shape the analyst consumes.
    pub fn answered_clarifications(&self) -> Vec<Clarification> {
        self.clarifications
            .iter()
            .filter_map(|r| {
                r.answer.as_ref().map(|a| Clarification {
                    questions: r.questions.clone(),
                    answer: a.clone(),
                })
            })
            .collect()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match &self.state {
            WorkflowState::Failed { reason } => Some(reason),
            _ => None,
        }
    }
}

/// A lock not refreshed for this long belongs to a process that died.
pub const LOCK_STALE_AFTER: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, thiserror::Error)]
#[error("issue #{issue} is being advanced by another tandem process (lock {})", path.display())]
pub struct WorkflowBusy {
    pub issue: u64,
    pub path: PathBuf,
}

/// Exclusive right to advance one workflow. Released on drop.
#[derive(Debug)]
pub struct IssueLock {
    path: PathBuf,
}

impl IssueLock {
    /// Mark the holder as alive.
    pub fn refresh(&self) -> Result<()> {
        fs::write(&self.path, lock_stamp()).with_context(|| format!("refresh lock {}", self.path.display()))
    }
}

impl Drop for IssueLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "failed to release workflow lock");
        }
    }
}

fn lock_stamp() -> String {
    format!("{} {}\n", std::process::id(), Utc::now().to_rfc3339())
}

fn lock_is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.elapsed().ok())
        .is_some_and(|age| age > LOCK_STALE_AFTER)
}

#[derive(Debug, Clone)]
pub struct WorkflowStore {
    dir: PathBuf,
}

impl WorkflowStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, issue: u64) -> PathBuf {
        self.dir.join(format!("issue-{issue}.json"))
    }

    fn cancel_path(&self, issue: u64) -> PathBuf {
        self.dir.join(format!("issue-{issue}.cancel"))
    }

    pub fn lock_path(&self, issue: u64) -> PathBuf {
        self.dir.join(format!("issue-{issue}.lock"))
    }

    /// Take the per-issue lock, failing with [`WorkflowBusy`] while another
    /// process holds it. A stale lock is broken.
    pub fn lock(&self, issue: u64) -> Result<IssueLock> {
        fs::create_dir_all(&self.dir).with_context(|| format!("create directory {}", self.dir.display()))?;
        let path = self.lock_path(issue);
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(lock_stamp().as_bytes())
                        .with_context(|| format!("write lock {}", path.display()))?;
                    debug!(issue, "workflow lock taken");
                    return Ok(IssueLock { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if !lock_is_stale(&path) {
                        break;
                    }
                    warn!(issue, path = %path.display(), "breaking stale workflow lock");
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e).with_context(|| format!("remove {}", path.display())),
                    }
                }
                Err(e) => return Err(e).with_context(|| format!("create lock {}", path.display())),
            }
        }
        Err(WorkflowBusy { issue, path }.into())
    }

    pub fn journal(&self, issue: u64) -> Journal {
        Journal::new(self.dir.join(format!("issue-{issue}.audit.jsonl")))
    }

    pub fn load(&self, issue: u64) -> Result<Option<WorkflowRecord>> {
        let path = self.record_path(issue);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("read workflow record {}", path.display())),
        };
        let record: WorkflowRecord = serde_json::from_str(&contents)
            .with_context(|| format!("parse workflow record {}", path.display()))?;
        debug!(issue, state = record.state.name(), "workflow record loaded");
        Ok(Some(record))
    }

    /// Atomically persist `record` (temp file + rename).
    pub fn save(&self, record: &mut WorkflowRecord) -> Result<()> {
        record.updated_at = Utc::now();
        let path = self.record_path(record.issue.number);
        debug!(issue = record.issue.number, state = record.state.name(), "writing workflow record");
        let mut buf = serde_json::to_string_pretty(record)?;
        buf.push('\n');
        write_atomic(&path, &buf)
    }

    /// Every record in the store, ordered by issue number.
    pub fn list(&self) -> Result<Vec<WorkflowRecord>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("list {}", self.dir.display())),
        };
        let mut numbers: Vec<u64> = entries
            .filter_map(std::result::Result::ok)
            .filter_map(|e| {
                e.file_name()
                    .to_str()
                    .and_then(|n| n.strip_prefix("issue-"))
                    .and_then(|n| n.strip_suffix(".json"))
                    .and_then(|n| n.parse().ok())
            })
            .collect();
        numbers.sort_unstable();

        let mut records = Vec::with_capacity(numbers.len());
        for n in numbers {
            if let Some(r) = self.load(n)? {
                records.push(r);
            }
        }
        Ok(records)
    }

    pub fn request_cancel(&self, issue: u64) -> Result<()> {
        let path = self.cancel_path(issue);
        write_atomic(&path, &format!("{}\n", Utc::now().to_rfc3339()))
    }

    pub fn cancel_requested(&self, issue: u64) -> bool {
        self.cancel_path(issue).exists()
    }

    pub fn clear_cancel(&self, issue: u64) -> Result<()> {
        let path = self.cancel_path(issue);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
        }
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents).with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(n: u64) -> IssueRef {
        IssueRef {
            number: n,
            title: "Remove X".into(),
            body: "from F".into(),
            repository: "acme/docs".into(),
            sender: "alice".into(),
        }
    }

    #[test]
    fn record_round_trips() {
        let temp = tempfile::tempdir().unwrap();
        let store = WorkflowStore::new(temp.path().join("state"));
        let mut record = WorkflowRecord::new(issue(7));
        record.state = WorkflowState::WaitingForClarification;
        record.completed_writes.insert("k1".into());
        store.save(&mut record).unwrap();

        let loaded = store.load(7).unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(store.load(8).unwrap().is_none());
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let temp = tempfile::tempdir().unwrap();
        let store = WorkflowStore::new(temp.path());
        store.save(&mut WorkflowRecord::new(issue(1))).unwrap();
        let names: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["issue-1.json"]);
    }

    #[test]
    fn list_ignores_other_files_and_orders_by_issue() {
        let temp = tempfile::tempdir().unwrap();
        let store = WorkflowStore::new(temp.path());
        for n in [12, 3] {
            store.save(&mut WorkflowRecord::new(issue(n))).unwrap();
        }
        store.request_cancel(3).unwrap();
        store.journal(3).append(&crate::pair::audit::JournalEntry {
            task_id: crate::model::TaskId::new("t"),
            role: crate::model::Role::Analyst,
            iteration: crate::model::IterationResult::new(
                1,
                StructuredOutput::default(),
                crate::model::ReviewFeedback::reviewer_failure(1, "x"),
                std::time::Duration::ZERO,
            ),
        })
        .unwrap();
        let numbers: Vec<u64> = store.list().unwrap().iter().map(|r| r.issue.number).collect();
        assert_eq!(numbers, vec![3, 12]);
    }

    #[test]
    fn cancel_marker_lifecycle() {
        let temp = tempfile::tempdir().unwrap();
        let store = WorkflowStore::new(temp.path());
        assert!(!store.cancel_requested(5));
        store.request_cancel(5).unwrap();
        assert!(store.cancel_requested(5));
        store.clear_cancel(5).unwrap();
        store.clear_cancel(5).unwrap();
        assert!(!store.cancel_requested(5));
    }

    #[test]
    fn lock_is_exclusive_until_dropped() {
        let temp = tempfile::tempdir().unwrap();
        let store = WorkflowStore::new(temp.path().join("state"));
        let held = store.lock(4).unwrap();
        let err = store.lock(4).unwrap_err();
        assert!(err.downcast_ref::<WorkflowBusy>().is_some(), "{err:#}");
        assert!(store.lock(5).is_ok());

        held.refresh().unwrap();
        drop(held);
        assert!(store.lock(4).is_ok());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn stale_lock_is_broken() {
        let temp = tempfile::tempdir().unwrap();
        let store = WorkflowStore::new(temp.path());
        let path = temp.path().join("issue-6.lock");
        fs::write(&path, "1 then\n").unwrap();
        let old = std::time::SystemTime::now() - LOCK_STALE_AFTER - Duration::from_secs(60);
        fs::File::options().write(true).open(&path).unwrap().set_modified(old).unwrap();

        let lock = store.lock(6).unwrap();
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn missing_store_lists_empty() {
        let temp = tempfile::tempdir().unwrap();
        let store = WorkflowStore::new(temp.path().join("nope"));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn answered_rounds_only() {
        let mut record = WorkflowRecord::new(issue(1));
        record.clarifications.push(ClarificationRound {
            questions: vec![],
            asked_at: Utc::now(),
            answer: Some("yes".into()),
            answered_at: Some(Utc::now()),
        });
        record.clarifications.push(ClarificationRound {
            questions: vec![],
            asked_at: Utc::now(),
            answer: None,
            answered_at: None,
        });
        assert_eq!(record.answered_clarifications().len(), 1);
    }
}
