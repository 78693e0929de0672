//! Navigator review engine.
//!
//! Scores a Tasker's output along five dimensions, layers structural and
//! integrity findings on top of the review capability's assessment, and
//! derives a decision under the progressive leniency schedule.

pub mod integrity;
mod leniency;

use std::fmt;
use std::sync::Arc;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::capability::{Capability, CapabilityRole};
use crate::model::{
    Context, ReviewDecision, ReviewFeedback, Role, StructuredOutput, Task,
};

pub use leniency::Strictness;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Minor,
    Major,
    Critical,
    /// Unrecoverable: the artifact is gone, corrupted, or violates a hard
    /// constraint. Always rejects.
    Catastrophic,
}

impl Severity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Minor => "minor",
            Self::Major => "major",
            Self::Critical => "critical",
            Self::Catastrophic => "catastrophic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Clarity,
    Completeness,
    Testability,
    Specificity,
    Consistency,
}

impl Dimension {
    pub const ALL: [Self; 5] = [
        Self::Clarity,
        Self::Completeness,
        Self::Testability,
        Self::Specificity,
        Self::Consistency,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Clarity => "clarity",
            Self::Completeness => "completeness",
            Self::Testability => "testability",
            Self::Specificity => "specificity",
            Self::Consistency => "consistency",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub severity: Severity,
    pub dimension: Dimension,
    pub description: String,
    #[serde(default)]
    pub required_change: Option<String>,
}

impl Issue {
    pub fn new(severity: Severity, dimension: Dimension, description: impl Into<String>) -> Self {
        Self {
            severity,
            dimension,
            description: description.into(),
            required_change: None,
        }
    }

    #[must_use]
    pub fn requiring(mut self, change: impl Into<String>) -> Self {
        self.required_change = Some(change.into());
        self
    }

    fn label(&self) -> String {
        format!("[{}/{}] {}", self.severity.as_str(), self.dimension, self.description)
    }

    fn change_text(&self) -> String {
        self.required_change
            .clone()
            .unwrap_or_else(|| format!("Resolve: {}", self.description))
    }
}

/// Per-dimension scores, each 0..=10.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionScores {
    pub clarity: u8,
    pub completeness: u8,
    pub testability: u8,
    pub specificity: u8,
    pub consistency: u8,
}

impl DimensionScores {
    pub const fn uniform(score: u8) -> Self {
        Self {
            clarity: score,
            completeness: score,
            testability: score,
            specificity: score,
            consistency: score,
        }
    }

    pub const fn get(&self, dimension: Dimension) -> u8 {
        let raw = match dimension {
            Dimension::Clarity => self.clarity,
            Dimension::Completeness => self.completeness,
            Dimension::Testability => self.testability,
            Dimension::Specificity => self.specificity,
            Dimension::Consistency => self.consistency,
        };
        if raw > 10 { 10 } else { raw }
    }

    /// Rounded mean of the clamped dimension scores.
    pub fn quality_score(&self) -> u8 {
        let sum: u32 = Dimension::ALL.iter().map(|d| u32::from(self.get(*d))).sum();
        // round(sum / 5), half up
        u8::try_from((sum * 2 + 5) / 10).unwrap_or(10)
    }

    pub fn weakest(&self) -> Dimension {
        Dimension::ALL
            .into_iter()
            .min_by_key(|d| self.get(*d))
            .unwrap_or(Dimension::Clarity)
    }
}

/// What the review capability returns in `StructuredOutput::data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewAssessment {
    pub scores: DimensionScores,
    #[serde(default)]
    pub overall_assessment: String,
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub positive_aspects: Vec<String>,
    /// Set when the artifact contradicts an explicit non-negotiable constraint.
    #[serde(default)]
    pub constraint_violation: Option<String>,
}

impl ReviewAssessment {
    pub fn from_output(output: &StructuredOutput) -> anyhow::Result<Self> {
        if output.failed {
            anyhow::bail!(
                "review capability reported failure: {}",
                output.error.as_deref().unwrap_or("no detail")
            );
        }
        serde_json::from_value(serde_json::Value::Object(output.data.clone()))
            .context("parsing review assessment")
    }
}

/// Role-specific structural checks run before the review capability.
pub trait ReviewPolicy: Send + Sync {
    fn inspect(&self, task: &Task, output: &StructuredOutput) -> Vec<Issue>;
}

/// Independent reviewer half of a Task Pair.
#[derive(Clone)]
pub struct Navigator {
    role: Role,
    capability: Arc<dyn Capability>,
    policies: Vec<Arc<dyn ReviewPolicy>>,
}

impl fmt::Debug for Navigator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Navigator")
            .field("role", &self.role)
            .field("policies", &self.policies.len())
            .finish_non_exhaustive()
    }
}

impl Navigator {
    pub fn new(role: Role, capability: Arc<dyn Capability>) -> Self {
        Self {
            role,
            capability,
            policies: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn ReviewPolicy>) -> Self {
        self.policies.push(policy);
        self
    }

    pub const fn role(&self) -> Role {
        self.role
    }

    pub fn review(
        &self,
        task: &Task,
        work_output: &StructuredOutput,
        context: &Context,
        iteration_number: u32,
    ) -> anyhow::Result<ReviewFeedback> {
        let strictness = Strictness::for_iteration(iteration_number);
        let mut issues = self.structural_issues(task, work_output);

        let skip_capability = work_output.failed
            || issues.iter().any(|i| i.severity == Severity::Catastrophic);

        let assessment = if skip_capability {
            debug!(task_id = %task.id, "skipping review capability");
            None
        } else {
            let ctx = context
                .clone()
                .with_note("strictness", strictness.as_str())
                .with_note(
                    "work_output",
                    serde_json::to_string(work_output).context("serializing work output")?,
                );
            let raw = self
                .capability
                .invoke(CapabilityRole::Navigator(self.role), task, &ctx)?;
            Some(ReviewAssessment::from_output(&raw)?)
        };

        if let Some(a) = &assessment {
            issues.extend(a.issues.iter().cloned());
            if let Some(violation) = &a.constraint_violation {
                issues.push(Issue::new(
                    Severity::Catastrophic,
                    Dimension::Consistency,
                    format!("violates a non-negotiable constraint: {violation}"),
                ));
            }
        }

        let feedback = derive_feedback(strictness, assessment.as_ref(), &issues);
        info!(
            task_id = %task.id,
            iteration = iteration_number,
            strictness = %strictness,
            decision = %feedback.decision,
            score = feedback.quality_score,
            issues = feedback.specific_issues.len(),
            "navigator verdict"
        );
        Ok(feedback)
    }

    fn structural_issues(&self, task: &Task, output: &StructuredOutput) -> Vec<Issue> {
        let mut issues = Vec::new();

        if output.failed {
            issues.push(
                Issue::new(
                    Severity::Critical,
                    Dimension::Completeness,
                    format!(
                        "generation failed: {}",
                        output.error.as_deref().unwrap_or("no detail")
                    ),
                )
                .requiring("Produce the requested artifact"),
            );
            return issues;
        }

        if output.is_empty() {
            issues.push(Issue::new(
                Severity::Catastrophic,
                Dimension::Completeness,
                "the artifact is empty",
            ));
            return issues;
        }

        if let Some(edit) = &task.edit {
            for path in output.files.keys().filter(|p| **p != edit.path) {
                issues.push(
                    Issue::new(
                        Severity::Catastrophic,
                        Dimension::Consistency,
                        format!("{path} is outside the targeted artifact {} and was never read", edit.path),
                    )
                    .requiring(format!("Change only {}", edit.path)),
                );
            }
            let candidate = output.files.get(&edit.path).map(String::as_str);
            if candidate.is_some() || self.role == Role::Developer {
                let report = integrity::check_edit(edit, candidate);
                for finding in report.findings(&edit.path) {
                    let severity = if report.is_violation() {
                        Severity::Catastrophic
                    } else {
                        Severity::Critical
                    };
                    issues.push(
                        Issue::new(severity, Dimension::Consistency, finding).requiring(format!(
                            "Apply only the requested change to {} and keep everything else byte-for-byte",
                            edit.path
                        )),
                    );
                }
            }
        }

        for policy in &self.policies {
            issues.extend(policy.inspect(task, output));
        }
        issues
    }
}

fn derive_feedback(
    strictness: Strictness,
    assessment: Option<&ReviewAssessment>,
    issues: &[Issue],
) -> ReviewFeedback {
    let catastrophic = issues.iter().any(|i| i.severity == Severity::Catastrophic);
    let quality_score = match assessment {
        Some(a) if !catastrophic => a.scores.quality_score(),
        _ => 0,
    };

    let blocking: Vec<&Issue> = issues.iter().filter(|i| strictness.blocks(i.severity)).collect();

    let decision = if catastrophic {
        ReviewDecision::Rejected
    } else if blocking.is_empty() && strictness.meets(quality_score) {
        ReviewDecision::Approved
    } else {
        ReviewDecision::NeedsChanges
    };

    let mut required_changes = Vec::new();
    let mut suggestions: Vec<String> = assessment.map(|a| a.suggestions.clone()).unwrap_or_default();
    if decision != ReviewDecision::Approved {
        required_changes.extend(blocking.iter().map(|i| i.change_text()));
        if required_changes.is_empty()
            && let Some(a) = assessment
        {
            required_changes.push(format!(
                "Raise overall quality to at least {} (currently {}); weakest dimension: {}",
                strictness.threshold_label(),
                quality_score,
                a.scores.weakest()
            ));
        }
    }
    suggestions.extend(
        issues
            .iter()
            .filter(|i| !strictness.blocks(i.severity))
            .filter_map(|i| i.required_change.clone()),
    );

    let overall_assessment = match assessment {
        Some(a) if !catastrophic && !a.overall_assessment.is_empty() => a.overall_assessment.clone(),
        // First of the worst, so the headline matches the findings order.
        _ => issues
            .iter()
            .rev()
            .max_by_key(|i| i.severity)
            .map_or_else(|| "no assessment provided".to_string(), |i| i.description.clone()),
    };

    ReviewFeedback {
        decision,
        overall_assessment,
        specific_issues: issues.iter().map(Issue::label).collect(),
        required_changes,
        suggestions,
        positive_aspects: assessment.map(|a| a.positive_aspects.clone()).unwrap_or_default(),
        quality_score,
        critical_issues: issues
            .iter()
            .filter(|i| i.severity >= Severity::Critical)
            .map(|i| i.description.clone())
            .collect(),
        strictness,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Change, TargetedEdit, TaskId};
    use serde_json::json;

    struct FixedReview(serde_json::Value);

    impl Capability for FixedReview {
        fn invoke(
            &self,
            _role: CapabilityRole,
            _task: &Task,
            _context: &Context,
        ) -> anyhow::Result<StructuredOutput> {
            let serde_json::Value::Object(data) = self.0.clone() else {
                anyhow::bail!("fixture must be an object");
            };
            Ok(StructuredOutput {
                data,
                ..StructuredOutput::default()
            })
        }
    }

    fn scored(score: u8) -> Arc<dyn Capability> {
        Arc::new(FixedReview(json!({
            "scores": {
                "clarity": score, "completeness": score, "testability": score,
                "specificity": score, "consistency": score
            },
            "overall_assessment": "looks fine",
        })))
    }

    fn removal_task() -> Task {
        Task::new(TaskId::new("t"), Role::Developer, "remove X from F").with_edit(TargetedEdit {
            path: "F".into(),
            original: "abc X def".into(),
            change: Change::Remove { text: "X".into() },
        })
    }

    #[test]
    fn score_eight_follows_the_schedule() {
        let nav = Navigator::new(Role::Developer, scored(8));
        let task = removal_task();
        let out = StructuredOutput::default().with_file("F", "abc  def");
        let decisions: Vec<_> = (1..=3)
            .map(|i| nav.review(&task, &out, &Context::new(), i).unwrap().decision)
            .collect();
        assert_eq!(
            decisions,
            vec![
                ReviewDecision::NeedsChanges,
                ReviewDecision::Approved,
                ReviewDecision::Approved
            ]
        );
    }

    #[test]
    fn emptied_document_rejected_even_when_lenient() {
        let nav = Navigator::new(Role::Developer, scored(10));
        let task = removal_task();
        let out = StructuredOutput::default().with_file("F", "");
        for i in 1..=3 {
            let fb = nav.review(&task, &out, &Context::new(), i).unwrap();
            assert_eq!(fb.decision, ReviewDecision::Rejected);
            assert!(!fb.critical_issues.is_empty());
            assert_eq!(fb.quality_score, 0);
        }
    }

    #[test]
    fn files_outside_the_target_are_rejected() {
        let nav = Navigator::new(Role::Developer, scored(10));
        let out = StructuredOutput::default()
            .with_file("F", "abc  def")
            .with_file("LICENSE", "");
        for i in 1..=3 {
            let fb = nav.review(&removal_task(), &out, &Context::new(), i).unwrap();
            assert_eq!(fb.decision, ReviewDecision::Rejected);
            assert!(fb.critical_issues.iter().any(|c| c.contains("LICENSE is outside")));
        }
    }

    #[test]
    fn unapplied_change_needs_changes() {
        let nav = Navigator::new(Role::Developer, scored(10));
        let out = StructuredOutput::default().with_file("F", "abc X def");
        let fb = nav.review(&removal_task(), &out, &Context::new(), 3).unwrap();
        assert_eq!(fb.decision, ReviewDecision::NeedsChanges);
        assert!(fb.critical_issues[0].contains("not applied"));
        assert!(!fb.required_changes.is_empty());
    }

    #[test]
    fn failed_generation_needs_changes_without_calling_reviewer() {
        struct Panics;
        impl Capability for Panics {
            fn invoke(&self, _: CapabilityRole, _: &Task, _: &Context) -> anyhow::Result<StructuredOutput> {
                anyhow::bail!("reviewer must not be called")
            }
        }
        let nav = Navigator::new(Role::Developer, Arc::new(Panics));
        let out = StructuredOutput::failure("timed out");
        let fb = nav.review(&removal_task(), &out, &Context::new(), 1).unwrap();
        assert_eq!(fb.decision, ReviewDecision::NeedsChanges);
        assert!(fb.specific_issues[0].contains("generation failed: timed out"));
    }

    #[test]
    fn empty_bag_is_rejected() {
        let nav = Navigator::new(Role::Analyst, scored(10));
        let task = Task::new(TaskId::new("t"), Role::Analyst, "clarify");
        let fb = nav
            .review(&task, &StructuredOutput::default(), &Context::new(), 1)
            .unwrap();
        assert_eq!(fb.decision, ReviewDecision::Rejected);
        assert_eq!(fb.overall_assessment, "the artifact is empty");
    }

    #[test]
    fn major_issue_stops_blocking_when_lenient_but_is_still_reported() {
        let cap = Arc::new(FixedReview(json!({
            "scores": {
                "clarity": 9, "completeness": 9, "testability": 9,
                "specificity": 9, "consistency": 9
            },
            "issues": [{
                "severity": "major",
                "dimension": "specificity",
                "description": "boundary left vague",
                "required_change": "State the boundary"
            }]
        })));
        let nav = Navigator::new(Role::Analyst, cap);
        let task = Task::new(TaskId::new("t"), Role::Analyst, "clarify");
        let out = StructuredOutput::default().with_summary("draft");

        let strict = nav.review(&task, &out, &Context::new(), 1).unwrap();
        assert_eq!(strict.decision, ReviewDecision::NeedsChanges);
        assert_eq!(strict.required_changes, vec!["State the boundary"]);

        let lenient = nav.review(&task, &out, &Context::new(), 3).unwrap();
        assert_eq!(lenient.decision, ReviewDecision::Approved);
        assert!(lenient.required_changes.is_empty());
        assert_eq!(lenient.specific_issues, vec!["[major/specificity] boundary left vague"]);
        assert_eq!(lenient.suggestions, vec!["State the boundary"]);
    }

    #[test]
    fn constraint_violation_rejects() {
        let cap = Arc::new(FixedReview(json!({
            "scores": {
                "clarity": 10, "completeness": 10, "testability": 10,
                "specificity": 10, "consistency": 10
            },
            "constraint_violation": "touches a frozen file"
        })));
        let nav = Navigator::new(Role::Analyst, cap);
        let task = Task::new(TaskId::new("t"), Role::Analyst, "clarify");
        let out = StructuredOutput::default().with_summary("draft");
        let fb = nav.review(&task, &out, &Context::new(), 2).unwrap();
        assert_eq!(fb.decision, ReviewDecision::Rejected);
    }

    #[test]
    fn low_score_without_issues_names_weakest_dimension() {
        let cap = Arc::new(FixedReview(json!({
            "scores": {
                "clarity": 9, "completeness": 9, "testability": 4,
                "specificity": 9, "consistency": 9
            }
        })));
        let nav = Navigator::new(Role::Tester, cap);
        let task = Task::new(TaskId::new("t"), Role::Tester, "write checks");
        let out = StructuredOutput::default().with_summary("suite");
        let fb = nav.review(&task, &out, &Context::new(), 1).unwrap();
        assert_eq!(fb.quality_score, 8);
        assert_eq!(fb.decision, ReviewDecision::NeedsChanges);
        assert!(fb.required_changes[0].contains("testability"));
    }

    #[test]
    fn malformed_assessment_is_an_error() {
        let nav = Navigator::new(Role::Tester, Arc::new(FixedReview(json!({"nope": 1}))));
        let task = Task::new(TaskId::new("t"), Role::Tester, "write checks");
        let out = StructuredOutput::default().with_summary("suite");
        assert!(nav.review(&task, &out, &Context::new(), 1).is_err());
    }

    #[test]
    fn quality_score_rounds_half_up_and_clamps() {
        let s = DimensionScores {
            clarity: 8,
            completeness: 8,
            testability: 7,
            specificity: 7,
            consistency: 7,
        };
        // mean 7.4
        assert_eq!(s.quality_score(), 7);
        let s = DimensionScores {
            clarity: 8,
            completeness: 8,
            testability: 8,
            specificity: 7,
            consistency: 7,
        };
        // mean 7.6
        assert_eq!(s.quality_score(), 8);
        assert_eq!(DimensionScores::uniform(200).quality_score(), 10);
    }
}
