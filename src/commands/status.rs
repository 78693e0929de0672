use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use clap::Args;
use serde::{Deserialize, Serialize};

use super::{OutputFormat, ProjectArgs};
use crate::error::ExitError;
use crate::model::Role;
use crate::workflow::state::WorkflowState;
use crate::workflow::store::WorkflowRecord;

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Show a single issue
    pub issue: Option<u64>,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
    #[command(flatten)]
    pub project: ProjectArgs,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusReport {
    pub workflows: Vec<WorkflowSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub issue: u64,
    pub title: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub steps: Vec<StepLine>,
    pub open_questions: usize,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StepLine {
    pub role: Role,
    pub success: bool,
    pub iterations: usize,
}

impl WorkflowSummary {
    fn from_record(record: &WorkflowRecord) -> Self {
        let detail = match &record.state {
            WorkflowState::Completed { delivery_id } => Some(delivery_id.clone()),
            WorkflowState::Failed { reason } => Some(reason.clone()),
            _ => None,
        };
        let open_questions = record
            .clarifications
            .iter()
            .filter(|r| r.answer.is_none())
            .map(|r| r.questions.len())
            .sum();
        Self {
            issue: record.issue.number,
            title: record.issue.title.clone(),
            state: record.state.name().to_string(),
            detail,
            steps: record
                .results
                .iter()
                .map(|r| StepLine {
                    role: r.role,
                    success: r.success,
                    iterations: r.iterations.len(),
                })
                .collect(),
            open_questions,
            updated_at: record.updated_at,
        }
    }
}

impl StatusArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let format = OutputFormat::resolve(self.format);
        let store = self.project.store()?;

        let records = match self.issue {
            Some(n) => vec![
                store
                    .load(n)?
                    .ok_or_else(|| ExitError::Other(format!("no workflow for issue #{n}")))?,
            ],
            None => store.list()?,
        };
        let report = StatusReport {
            workflows: records.iter().map(WorkflowSummary::from_record).collect(),
        };

        match format {
            OutputFormat::Pretty => {
                termimad::MadSkin::default().print_text(&render_markdown(&report));
            }
            OutputFormat::Text => print!("{}", render_text(&report)),
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        }
        Ok(())
    }
}

fn render_markdown(report: &StatusReport) -> String {
    let mut md = String::from("# tandem status\n\n");
    if report.workflows.is_empty() {
        md.push_str("No workflows.\n");
        return md;
    }
    md.push_str("|Issue|State|Title|Steps|\n|-:|:-|:-|:-|\n");
    for w in &report.workflows {
        let steps: Vec<String> = w
            .steps
            .iter()
            .map(|s| format!("{}{}({})", s.role, if s.success { "✓" } else { "✗" }, s.iterations))
            .collect();
        let _ = writeln!(md, "|#{}|{}|{}|{}|", w.issue, w.state, w.title, steps.join(" "));
    }
    for w in report.workflows.iter().filter(|w| w.detail.is_some() || w.open_questions > 0) {
        let _ = write!(md, "\n**#{}**", w.issue);
        if let Some(detail) = &w.detail {
            let _ = write!(md, " {detail}");
        }
        if w.open_questions > 0 {
            let _ = write!(md, " ({} open question(s))", w.open_questions);
        }
        md.push('\n');
    }
    md
}

fn render_text(report: &StatusReport) -> String {
    let mut out = String::new();
    for w in &report.workflows {
        let _ = writeln!(
            out,
            "issue={}  state={}  steps={}  updated={}  title={}",
            w.issue,
            w.state,
            w.steps.len(),
            w.updated_at.to_rfc3339(),
            w.title
        );
        if let Some(detail) = &w.detail {
            let _ = writeln!(out, "  detail={detail}");
        }
        if w.open_questions > 0 {
            let _ = writeln!(out, "  open-questions={}", w.open_questions);
        }
    }
    out
}
