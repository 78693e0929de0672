use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{IterationResult, Role, Task, TaskId};

/// Receives each iteration as soon as it is recorded.
pub trait IterationSink: Send + Sync {
    fn record(&self, task: &Task, iteration: &IterationResult) -> anyhow::Result<()>;
}

/// Append-only, in-memory log of iterations indexed by task id.
#[derive(Debug, Default)]
pub struct AuditTrail {
    entries: Mutex<BTreeMap<TaskId, Vec<IterationResult>>>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iterations(&self, task_id: &TaskId) -> Vec<IterationResult> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

impl IterationSink for AuditTrail {
    fn record(&self, task: &Task, iteration: &IterationResult) -> anyhow::Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(task.id.clone())
            .or_default()
            .push(iteration.clone());
        Ok(())
    }
}

/// One line of the per-issue JSONL journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub task_id: TaskId,
    pub role: Role,
    #[serde(flatten)]
    pub iteration: IterationResult,
}

/// Per-issue iteration journal, one JSON object per line.
#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &JournalEntry) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(entry).context("serializing journal entry")?;
        line.push('\n');
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(line.as_bytes()))
            .with_context(|| format!("appending to {}", self.path.display()))?;
        debug!(path = %self.path.display(), task_id = %entry.task_id, "journaled iteration");
        Ok(())
    }

    /// All entries in write order. A missing journal reads as empty.
    pub fn read_all(&self) -> anyhow::Result<Vec<JournalEntry>> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("opening {}", self.path.display())));
            }
        };
        let mut entries = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("reading {}", self.path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(
                serde_json::from_str(&line)
                    .with_context(|| format!("{}:{}: malformed entry", self.path.display(), n + 1))?,
            );
        }
        Ok(entries)
    }
}

impl IterationSink for Journal {
    fn record(&self, task: &Task, iteration: &IterationResult) -> anyhow::Result<()> {
        self.append(&JournalEntry {
            task_id: task.id.clone(),
            role: task.assigned_role,
            iteration: iteration.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::model::{ReviewFeedback, StructuredOutput};

    fn iteration(n: u32) -> IterationResult {
        IterationResult::new(
            n,
            StructuredOutput::default().with_summary(format!("attempt {n}")),
            ReviewFeedback::reviewer_failure(n, "offline"),
            Duration::from_millis(5),
        )
    }

    #[test]
    fn trail_is_indexed_by_task_and_append_only() {
        let trail = AuditTrail::new();
        let a = Task::new(TaskId::new("a"), Role::Tester, "a");
        let b = Task::new(TaskId::new("b"), Role::Tester, "b");
        trail.record(&a, &iteration(1)).unwrap();
        trail.record(&b, &iteration(1)).unwrap();
        trail.record(&a, &iteration(2)).unwrap();

        let its = trail.iterations(&TaskId::new("a"));
        assert_eq!(its.iter().map(|i| i.iteration_number).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(its[0].tasker_output.summary, "attempt 1");
        assert_eq!(trail.task_ids().len(), 2);
    }

    #[test]
    fn journal_appends_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path().join("nested/issue-7.audit.jsonl"));
        let task = Task::new(TaskId::new("issue-7-developer-1"), Role::Developer, "x");
        journal.record(&task, &iteration(1)).unwrap();
        journal.record(&task, &iteration(2)).unwrap();

        let entries = journal.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].iteration.iteration_number, 2);
        assert_eq!(entries[0].role, Role::Developer);
    }

    #[test]
    fn missing_journal_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path().join("none.jsonl"));
        assert!(journal.read_all().unwrap().is_empty());
    }

    #[test]
    fn malformed_line_names_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        fs::write(&path, "{not json}\n").unwrap();
        let err = Journal::new(&path).read_all().unwrap_err();
        assert!(format!("{err:#}").contains("bad.jsonl:1"));
    }
}
