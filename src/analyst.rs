//! Requirements Analyst pair: turns a free-text issue into a requirements
//! spec precise enough to implement, or into questions only a human can
//! answer.

use std::fmt;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::model::{Change, Context, Role, StructuredOutput, Task, TaskId, TaskPairResult};
use crate::navigator::{Dimension, Issue, Navigator, ReviewPolicy, Severity};
use crate::pair::{PairError, TaskPair, Tasker};

/// Key under which the Analyst pair returns its spec.
pub const SPEC_FIELD: &str = "requirements";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionCategory {
    /// Needs a stakeholder decision. Suspends the workflow.
    BusinessPolicy,
    /// Answerable by the pair itself.
    #[default]
    Technical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationQuestion {
    pub question: String,
    /// What in the request was unclear.
    #[serde(default)]
    pub unclear: String,
    #[serde(default)]
    pub why_it_matters: String,
    #[serde(default)]
    pub category: QuestionCategory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeTarget {
    pub path: String,
    /// `None` when the artifact is written as a whole (for example a new file).
    #[serde(default)]
    pub change: Option<Change>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementsSpec {
    pub summary: String,
    #[serde(default)]
    pub target: Option<ChangeTarget>,
    /// What must survive the change untouched.
    #[serde(default)]
    pub preserve: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub open_questions: Vec<ClarificationQuestion>,
}

impl RequirementsSpec {
    pub fn policy_questions(&self) -> Vec<ClarificationQuestion> {
        self.open_questions
            .iter()
            .filter(|q| q.category == QuestionCategory::BusinessPolicy)
            .cloned()
            .collect()
    }
}

/// A human answer to a round of questions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clarification {
    pub questions: Vec<ClarificationQuestion>,
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome {
    Clarified {
        spec: RequirementsSpec,
        result: TaskPairResult,
    },
    NeedsClarification {
        spec: RequirementsSpec,
        questions: Vec<ClarificationQuestion>,
        result: TaskPairResult,
    },
    Failed {
        reason: String,
        result: TaskPairResult,
    },
}

impl AnalysisOutcome {
    pub const fn result(&self) -> &TaskPairResult {
        match self {
            Self::Clarified { result, .. }
            | Self::NeedsClarification { result, .. }
            | Self::Failed { result, .. } => result,
        }
    }
}

impl fmt::Display for AnalysisOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clarified { .. } => f.write_str("clarified"),
            Self::NeedsClarification { questions, .. } => {
                write!(f, "needs clarification ({} questions)", questions.len())
            }
            Self::Failed { reason, .. } => write!(f, "failed: {reason}"),
        }
    }
}

/// The issue as the analyst sees it.
#[derive(Debug, Clone)]
pub struct AnalysisRequest<'a> {
    pub issue_number: u64,
    pub title: &'a str,
    pub body: &'a str,
    pub clarifications: &'a [Clarification],
    /// Distinguishes re-runs after each clarification round.
    pub attempt: usize,
}

impl AnalysisRequest<'_> {
    fn description(&self) -> String {
        let mut out = format!(
            "Analyze change request #{}: {}\n\n{}",
            self.issue_number,
            self.title,
            self.body.trim()
        );
        for (n, c) in self.clarifications.iter().enumerate() {
            let _ = write!(out, "\n\nClarification round {}:\n", n + 1);
            for q in &c.questions {
                let _ = writeln!(out, "- Q: {}", q.question);
            }
            let _ = write!(out, "Answer: {}", c.answer.trim());
        }
        out
    }

    pub fn task(&self) -> Task {
        Task::new(
            TaskId::for_issue(self.issue_number, Role::Analyst, self.attempt),
            Role::Analyst,
            self.description(),
        )
        .with_criteria([
            "Name the target artifact path and the exact change (remove or replace)",
            "State which content must be preserved",
            "List acceptance criteria that can be checked objectively",
            "Raise business-policy questions that the issue text cannot answer; resolve technical ones yourself",
        ])
    }
}

pub struct RequirementsAnalyst<'a> {
    pair: &'a TaskPair,
    tasker: Tasker,
    navigator: Navigator,
    max_iterations: u32,
}

impl<'a> RequirementsAnalyst<'a> {
    pub const fn new(pair: &'a TaskPair, tasker: Tasker, navigator: Navigator, max_iterations: u32) -> Self {
        Self {
            pair,
            tasker,
            navigator,
            max_iterations,
        }
    }

    pub fn analyze(&self, request: &AnalysisRequest<'_>, context: &Context) -> Result<AnalysisOutcome, PairError> {
        let context = context
            .clone()
            .with_note("issue", format!("#{} {}\n\n{}", request.issue_number, request.title, request.body));
        let result = self
            .pair
            .run(&self.tasker, &self.navigator, request.task(), &context, self.max_iterations)?;

        let Some(output) = result.final_output.as_ref().filter(|_| result.success) else {
            let reason = result
                .failure_reason
                .clone()
                .unwrap_or_else(|| "requirements analysis failed".to_string());
            return Ok(AnalysisOutcome::Failed { reason, result });
        };

        let spec = match output.field::<RequirementsSpec>(SPEC_FIELD) {
            Ok(Some(spec)) => spec,
            Ok(None) => {
                return Ok(AnalysisOutcome::Failed {
                    reason: "approved analysis carried no requirements spec".into(),
                    result,
                });
            }
            Err(e) => {
                return Ok(AnalysisOutcome::Failed {
                    reason: format!("approved analysis carried a malformed requirements spec: {e}"),
                    result,
                });
            }
        };

        let questions = spec.policy_questions();
        info!(issue = request.issue_number, questions = questions.len(), "analysis complete");
        if questions.is_empty() {
            Ok(AnalysisOutcome::Clarified { spec, result })
        } else {
            Ok(AnalysisOutcome::NeedsClarification {
                spec,
                questions,
                result,
            })
        }
    }
}

/// Requirements-quality gate run by the analyst Navigator.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequirementsPolicy;

impl ReviewPolicy for RequirementsPolicy {
    fn inspect(&self, _task: &Task, output: &StructuredOutput) -> Vec<Issue> {
        let spec: RequirementsSpec = match output.field(SPEC_FIELD) {
            Ok(Some(spec)) => spec,
            Ok(None) => {
                return vec![
                    Issue::new(Severity::Critical, Dimension::Completeness, "no requirements spec in output")
                        .requiring(format!("Return a `{SPEC_FIELD}` object")),
                ];
            }
            Err(e) => {
                return vec![Issue::new(
                    Severity::Critical,
                    Dimension::Clarity,
                    format!("requirements spec is malformed: {e}"),
                )];
            }
        };

        // Gaps a pending business answer may fill are reported but do not block.
        let awaiting_answers = !spec.policy_questions().is_empty();
        let gap = |severity| if awaiting_answers { Severity::Minor } else { severity };

        let mut issues = Vec::new();
        if spec.summary.trim().is_empty() {
            issues.push(
                Issue::new(Severity::Major, Dimension::Clarity, "the requirements have no summary")
                    .requiring("Summarize the requested change in one sentence"),
            );
        }

        match &spec.target {
            None => issues.push(
                Issue::new(gap(Severity::Critical), Dimension::Specificity, "the requirements do not name the artifact to change")
                    .requiring("Name the target artifact path"),
            ),
            Some(target) => {
                if target.path.trim().is_empty() {
                    issues.push(Issue::new(
                        Severity::Critical,
                        Dimension::Specificity,
                        "the target path is empty",
                    ));
                }
                if let Some(change) = &target.change {
                    if change.needle().is_empty() {
                        issues.push(Issue::new(
                            Severity::Critical,
                            Dimension::Specificity,
                            "the targeted text is empty",
                        ));
                    }
                    if spec.preserve.is_empty() {
                        issues.push(
                            Issue::new(
                                gap(Severity::Major),
                                Dimension::Completeness,
                                "a partial change does not say what must be preserved",
                            )
                            .requiring("State that all content outside the targeted text must stay unchanged"),
                        );
                    }
                }
            }
        }

        if spec.acceptance_criteria.is_empty() {
            issues.push(
                Issue::new(gap(Severity::Major), Dimension::Testability, "no acceptance criteria")
                    .requiring("List objectively checkable acceptance criteria"),
            );
        }

        for q in spec
            .open_questions
            .iter()
            .filter(|q| q.category == QuestionCategory::Technical)
        {
            issues.push(
                Issue::new(
                    Severity::Major,
                    Dimension::Clarity,
                    format!("unresolved technical question: {}", q.question),
                )
                .requiring("Resolve technical questions in the requirements instead of escalating them"),
            );
        }
        issues
    }
}
