//! Core data model shared by the pair controller, the navigator, and the
//! workflow orchestrator.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::navigator::Strictness;

/// The specialization a Tasker works under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Analyst,
    Tester,
    Developer,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Analyst => "analyst",
            Self::Tester => "tester",
            Self::Developer => "developer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Deterministic id for the `attempt`-th delegation of `role` on an issue.
    pub fn for_issue(issue: u64, role: Role, attempt: usize) -> Self {
        Self(format!("issue-{issue}-{role}-{attempt}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A partial modification to one existing artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Change {
    /// Remove every occurrence of `text`.
    Remove { text: String },
    /// Replace every occurrence of `from` with `to`.
    Replace { from: String, to: String },
}

impl Change {
    /// The phrase being targeted in the original artifact.
    pub fn needle(&self) -> &str {
        match self {
            Self::Remove { text } => text,
            Self::Replace { from, .. } => from,
        }
    }

    /// What a targeted occurrence turns into.
    pub fn replacement(&self) -> &str {
        match self {
            Self::Remove { .. } => "",
            Self::Replace { to, .. } => to,
        }
    }
}

/// A targeted change bound to the artifact content read before any
/// modification was proposed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetedEdit {
    pub path: String,
    pub original: String,
    pub change: Change,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Grows by one feedback block per `NeedsChanges` iteration.
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub assigned_role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit: Option<TargetedEdit>,
}

impl Task {
    pub fn new(id: TaskId, role: Role, description: impl Into<String>) -> Self {
        Self {
            id,
            description: description.into(),
            acceptance_criteria: Vec::new(),
            assigned_role: role,
            edit: None,
        }
    }

    #[must_use]
    pub fn with_criteria<I, S>(mut self, criteria: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.acceptance_criteria
            .extend(criteria.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_edit(mut self, edit: TargetedEdit) -> Self {
        self.edit = Some(edit);
        self
    }

    /// Fold a rendered feedback block and its required changes into the task
    /// for the next iteration.
    pub fn fold_feedback(&mut self, block: &str, required_changes: &[String]) {
        self.description.push_str("\n\n");
        self.description.push_str(block.trim_end());
        self.acceptance_criteria
            .extend(required_changes.iter().cloned());
    }
}

/// The opaque artifact bag a capability returns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredOutput {
    #[serde(default)]
    pub summary: String,
    /// Proposed full contents keyed by artifact path.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StructuredOutput {
    /// Stand-in output for a generation call that errored or timed out.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            failed: true,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.insert(path.into(), content.into());
        self
    }

    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    /// True when the bag carries nothing at all.
    pub fn is_empty(&self) -> bool {
        self.summary.trim().is_empty() && self.files.is_empty() && self.data.is_empty()
    }

    /// Deserialize a typed field out of `data`.
    pub fn field<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, serde_json::Error> {
        self.data
            .get(key)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approved,
    NeedsChanges,
    Rejected,
}

impl ReviewDecision {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Approved | Self::Rejected)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::NeedsChanges => "needs_changes",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ReviewDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The Navigator's verdict on one iteration.
///
/// Invariant: an `Approved` feedback has no required changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewFeedback {
    pub decision: ReviewDecision,
    pub overall_assessment: String,
    pub specific_issues: Vec<String>,
    pub required_changes: Vec<String>,
    pub suggestions: Vec<String>,
    pub positive_aspects: Vec<String>,
    pub quality_score: u8,
    /// Critical and catastrophic issues, also listed in `specific_issues`.
    #[serde(default)]
    pub critical_issues: Vec<String>,
    pub strictness: Strictness,
}

impl ReviewFeedback {
    /// Feedback for a review call that errored or timed out.
    pub fn reviewer_failure(iteration: u32, error: &str) -> Self {
        Self {
            decision: ReviewDecision::Rejected,
            overall_assessment: format!("review failed: {error}"),
            specific_issues: Vec::new(),
            required_changes: Vec::new(),
            suggestions: Vec::new(),
            positive_aspects: Vec::new(),
            quality_score: 0,
            critical_issues: Vec::new(),
            strictness: Strictness::for_iteration(iteration),
        }
    }

    pub const fn is_approved(&self) -> bool {
        matches!(self.decision, ReviewDecision::Approved)
    }
}

/// One generate-then-review cycle. Never mutated once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationResult {
    pub iteration_number: u32,
    pub tasker_output: StructuredOutput,
    pub navigator_feedback: ReviewFeedback,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub succeeded: bool,
    pub finished_at: DateTime<Utc>,
}

impl IterationResult {
    pub fn new(
        iteration_number: u32,
        tasker_output: StructuredOutput,
        navigator_feedback: ReviewFeedback,
        duration: Duration,
    ) -> Self {
        let succeeded = navigator_feedback.is_approved();
        Self {
            iteration_number,
            tasker_output,
            navigator_feedback,
            duration,
            succeeded,
            finished_at: Utc::now(),
        }
    }

    pub const fn decision(&self) -> ReviewDecision {
        self.navigator_feedback.decision
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPairResult {
    pub task_id: TaskId,
    pub role: Role,
    pub success: bool,
    pub iterations: Vec<IterationResult>,
    pub final_output: Option<StructuredOutput>,
    pub failure_reason: Option<String>,
    /// Set when the ceiling was reached and the last output was accepted
    /// under the provisional exhaustion policy.
    #[serde(default)]
    pub provisional: bool,
}

impl TaskPairResult {
    pub fn last_iteration(&self) -> Option<&IterationResult> {
        self.iterations.last()
    }
}

/// A prior iteration as the Tasker sees it on later attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorAttempt {
    pub iteration: u32,
    pub output: StructuredOutput,
    pub feedback: ReviewFeedback,
}

/// Named context documents plus, for the Tasker, its own history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    #[serde(default)]
    pub notes: BTreeMap<String, String>,
    #[serde(default)]
    pub history: Vec<PriorAttempt>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_note(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.notes.insert(key.into(), value.into());
        self
    }

    pub fn note(&self, key: &str) -> Option<&str> {
        self.notes.get(key).map(String::as_str)
    }

    /// Base context plus every prior output and feedback, in iteration order.
    #[must_use]
    pub fn enhanced(&self, iterations: &[IterationResult]) -> Self {
        let mut ctx = self.clone();
        ctx.history.extend(iterations.iter().map(|it| PriorAttempt {
            iteration: it.iteration_number,
            output: it.tasker_output.clone(),
            feedback: it.navigator_feedback.clone(),
        }));
        ctx
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
