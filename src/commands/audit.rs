use std::fmt::Write as _;

use clap::Args;

use super::{OutputFormat, ProjectArgs};
use crate::pair::audit::JournalEntry;

#[derive(Debug, Args)]
pub struct AuditArgs {
    /// Issue number
    pub issue: u64,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
    #[command(flatten)]
    pub project: ProjectArgs,
}

impl AuditArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let journal = self.project.store()?.journal(self.issue);
        let entries = journal.read_all()?;
        match OutputFormat::resolve(self.format) {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
            OutputFormat::Pretty | OutputFormat::Text => {
                if entries.is_empty() {
                    println!("no iterations recorded for issue #{}", self.issue);
                }
                for entry in &entries {
                    println!("{}", line(entry));
                }
            }
        }
        Ok(())
    }
}

fn line(entry: &JournalEntry) -> String {
    let it = &entry.iteration;
    let fb = &it.navigator_feedback;
    let mut out = format!(
        "{}  {}  iteration={}  decision={}  score={}  strictness={}  duration_ms={}",
        entry.task_id,
        entry.role,
        it.iteration_number,
        fb.decision.as_str(),
        fb.quality_score,
        fb.strictness,
        it.duration.as_millis(),
    );
    if let Some(err) = &it.tasker_output.error {
        let _ = write!(out, "\n  tasker error: {err}");
    }
    for issue in &fb.critical_issues {
        let _ = write!(out, "\n  critical: {issue}");
    }
    out
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::model::{IterationResult, ReviewFeedback, Role, StructuredOutput, TaskId};

    #[test]
    fn line_shows_decision_and_errors() {
        let entry = JournalEntry {
            task_id: TaskId::new("issue-3-developer-1"),
            role: Role::Developer,
            iteration: IterationResult::new(
                2,
                StructuredOutput::failure("boom"),
                ReviewFeedback::reviewer_failure(2, "timeout"),
                Duration::from_millis(40),
            ),
        };
        let text = line(&entry);
        assert!(text.starts_with("issue-3-developer-1  developer  iteration=2  decision=rejected  score=0"));
        assert!(text.contains("tasker error: boom"));
    }
}
