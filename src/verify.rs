//! Verification suites produced by the Tester pair and evaluated against the
//! Developer pair's output.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{StructuredOutput, Task};
use crate::navigator::integrity;
use crate::navigator::{Dimension, Issue, ReviewPolicy, Severity};

/// Key under which the Tester pair returns its suite.
pub const SUITE_FIELD: &str = "verification";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Check {
    Contains { text: String },
    NotContains { text: String },
    /// Minimum length in characters.
    MinLength { chars: usize },
    MaxLength { chars: usize },
    Equals { text: String },
}

impl Check {
    pub fn passes(&self, content: &str) -> bool {
        match self {
            Self::Contains { text } => content.contains(text.as_str()),
            Self::NotContains { text } => !content.contains(text.as_str()),
            Self::MinLength { chars } => content.chars().count() >= *chars,
            Self::MaxLength { chars } => content.chars().count() <= *chars,
            Self::Equals { text } => content == text,
        }
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Contains { text } => write!(f, "{text:?} in result"),
            Self::NotContains { text } => write!(f, "{text:?} not in result"),
            Self::MinLength { chars } => write!(f, "len(result) >= {chars}"),
            Self::MaxLength { chars } => write!(f, "len(result) <= {chars}"),
            Self::Equals { text } => write!(f, "result == {text:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationSuite {
    pub path: String,
    pub checks: Vec<Check>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub check: Check,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VerificationReport {
    pub outcomes: Vec<CheckOutcome>,
}

impl VerificationReport {
    /// An empty suite never passes.
    pub fn passed(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.iter().all(|o| o.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &Check> {
        self.outcomes.iter().filter(|o| !o.passed).map(|o| &o.check)
    }

    pub fn summary(&self) -> String {
        let failed: Vec<String> = self.failures().map(ToString::to_string).collect();
        if self.outcomes.is_empty() {
            "no checks to run".to_string()
        } else if failed.is_empty() {
            format!("all {} checks passed", self.outcomes.len())
        } else {
            format!("failed checks: {}", failed.join("; "))
        }
    }
}

impl VerificationSuite {
    pub fn evaluate(&self, content: &str) -> VerificationReport {
        VerificationReport {
            outcomes: self
                .checks
                .iter()
                .map(|c| CheckOutcome {
                    check: c.clone(),
                    passed: c.passes(content),
                })
                .collect(),
        }
    }

    /// Evaluate against the proposed file in `output`. A missing file fails.
    pub fn evaluate_output(&self, output: &StructuredOutput) -> VerificationReport {
        match output.files.get(&self.path) {
            Some(content) => self.evaluate(content),
            None => VerificationReport {
                outcomes: self
                    .checks
                    .iter()
                    .map(|c| CheckOutcome {
                        check: c.clone(),
                        passed: false,
                    })
                    .collect(),
            },
        }
    }
}

/// Structural review of a Tester pair's output.
#[derive(Debug, Default, Clone, Copy)]
pub struct SuitePolicy;

impl ReviewPolicy for SuitePolicy {
    fn inspect(&self, task: &Task, output: &StructuredOutput) -> Vec<Issue> {
        let suite: VerificationSuite = match output.field(SUITE_FIELD) {
            Ok(Some(s)) => s,
            Ok(None) => {
                return vec![
                    Issue::new(
                        Severity::Critical,
                        Dimension::Testability,
                        "no verification suite in output",
                    )
                    .requiring(format!("Return a `{SUITE_FIELD}` object with a path and checks")),
                ];
            }
            Err(e) => {
                return vec![Issue::new(
                    Severity::Critical,
                    Dimension::Testability,
                    format!("verification suite is malformed: {e}"),
                )];
            }
        };

        let mut issues = Vec::new();
        if suite.checks.is_empty() {
            issues.push(
                Issue::new(Severity::Major, Dimension::Testability, "the suite has no checks")
                    .requiring("Add checks that verify the change and the preserved content"),
            );
        }

        if let Some(edit) = &task.edit {
            if suite.path != edit.path {
                issues.push(Issue::new(
                    Severity::Critical,
                    Dimension::Consistency,
                    format!("suite targets {} but the change is to {}", suite.path, edit.path),
                ));
                return issues;
            }
            let target = integrity::expected(&edit.original, &edit.change);
            for check in suite.evaluate(&target).failures() {
                issues.push(
                    Issue::new(
                        Severity::Major,
                        Dimension::Consistency,
                        format!("check `{check}` fails against the correctly edited artifact"),
                    )
                    .requiring(format!("Fix or drop `{check}`")),
                );
            }
            if !suite.checks.is_empty() && suite.evaluate(&edit.original).passed() {
                issues.push(
                    Issue::new(
                        Severity::Major,
                        Dimension::Testability,
                        "the suite also passes on the unmodified artifact",
                    )
                    .requiring("Add a check that fails until the change is applied"),
                );
            }
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::model::{Change, Role, TargetedEdit, TaskId};

    fn scenario_suite() -> VerificationSuite {
        VerificationSuite {
            path: "F".into(),
            checks: vec![
                Check::NotContains { text: "X".into() },
                Check::MinLength { chars: 6 },
                Check::Contains { text: "abc".into() },
                Check::Contains { text: "def".into() },
            ],
        }
    }

    fn task() -> Task {
        Task::new(TaskId::new("t"), Role::Tester, "checks").with_edit(TargetedEdit {
            path: "F".into(),
            original: "abc X def".into(),
            change: Change::Remove { text: "X".into() },
        })
    }

    #[test]
    fn suite_passes_on_correct_edit_only() {
        let suite = scenario_suite();
        assert!(suite.evaluate("abc  def").passed());
        let report = suite.evaluate("abc X def");
        assert!(!report.passed());
        assert_eq!(report.summary(), "failed checks: \"X\" not in result");
        assert!(!suite.evaluate("").passed());
    }

    #[test]
    fn length_counts_characters() {
        assert!(Check::MaxLength { chars: 3 }.passes("héé"));
        assert!(!Check::MinLength { chars: 4 }.passes("héé"));
    }

    #[test]
    fn missing_file_fails_every_check() {
        let report = scenario_suite().evaluate_output(&StructuredOutput::default());
        assert_eq!(report.failures().count(), 4);
    }

    #[test]
    fn empty_suite_never_passes() {
        let suite = VerificationSuite {
            path: "F".into(),
            checks: vec![],
        };
        assert!(!suite.evaluate("anything").passed());
    }

    #[test]
    fn parses_tagged_checks() {
        let suite: VerificationSuite = serde_json::from_value(json!({
            "path": "F",
            "checks": [
                {"kind": "not_contains", "text": "X"},
                {"kind": "min_length", "chars": 6}
            ]
        }))
        .unwrap();
        assert_eq!(suite.checks[1], Check::MinLength { chars: 6 });
    }

    #[test]
    fn policy_accepts_a_discriminating_suite() {
        let out = StructuredOutput::default()
            .with_data(SUITE_FIELD, serde_json::to_value(scenario_suite()).unwrap());
        assert!(SuitePolicy.inspect(&task(), &out).is_empty());
    }

    #[test]
    fn policy_flags_missing_and_empty_suites() {
        let issues = SuitePolicy.inspect(&task(), &StructuredOutput::default().with_summary("s"));
        assert_eq!(issues[0].severity, Severity::Critical);

        let empty = VerificationSuite {
            path: "F".into(),
            checks: vec![],
        };
        let out = StructuredOutput::default().with_data(SUITE_FIELD, serde_json::to_value(empty).unwrap());
        let issues = SuitePolicy.inspect(&task(), &out);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::Major);
    }

    #[test]
    fn policy_flags_checks_that_contradict_the_change() {
        let suite = VerificationSuite {
            path: "F".into(),
            checks: vec![Check::Contains { text: "X".into() }],
        };
        let out = StructuredOutput::default().with_data(SUITE_FIELD, serde_json::to_value(suite).unwrap());
        let issues = SuitePolicy.inspect(&task(), &out);
        assert!(issues.iter().any(|i| i.description.contains("correctly edited")));
        assert!(issues.iter().any(|i| i.description.contains("unmodified")));
    }
}
