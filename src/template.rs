//! Template rendering for capability prompts and human-facing text.

use minijinja::{Environment, context};
use serde::Serialize;

use crate::analyst::{ClarificationQuestion, RequirementsSpec};
use crate::model::{Context, ReviewFeedback, Role, Task, TaskPairResult};
use crate::verify::{VerificationReport, VerificationSuite};
use crate::workflow::intake::IssueRef;

const TASKER_PROMPT: &str = include_str!("templates/tasker-prompt.md.jinja");
const NAVIGATOR_PROMPT: &str = include_str!("templates/navigator-prompt.md.jinja");
const FEEDBACK: &str = include_str!("templates/feedback.md.jinja");
const CLARIFICATION: &str = include_str!("templates/clarification.md.jinja");
const STATUS: &str = include_str!("templates/status.md.jinja");
const DELIVERY: &str = include_str!("templates/delivery.md.jinja");

/// One row of a step summary.
#[derive(Debug, Serialize)]
pub struct StepSummary {
    pub role: Role,
    pub success: bool,
    pub iterations: usize,
}

impl StepSummary {
    pub fn from_results(results: &[TaskPairResult]) -> Vec<Self> {
        results
            .iter()
            .map(|r| Self {
                role: r.role,
                success: r.success,
                iterations: r.iterations.len(),
            })
            .collect()
    }
}

fn environment() -> anyhow::Result<Environment<'static>> {
    let mut env = Environment::new();
    env.add_template("tasker-prompt.md", TASKER_PROMPT)?;
    env.add_template("navigator-prompt.md", NAVIGATOR_PROMPT)?;
    env.add_template("feedback.md", FEEDBACK)?;
    env.add_template("clarification.md", CLARIFICATION)?;
    env.add_template("status.md", STATUS)?;
    env.add_template("delivery.md", DELIVERY)?;
    Ok(env)
}

fn render<S: Serialize>(name: &str, ctx: S) -> anyhow::Result<String> {
    let env = environment()?;
    let rendered = env.get_template(name)?.render(ctx)?;
    Ok(rendered)
}

pub fn render_tasker_prompt(role: Role, task: &Task, ctx: &Context) -> anyhow::Result<String> {
    render("tasker-prompt.md", context! { role, task, context => ctx })
}

pub fn render_navigator_prompt(role: Role, task: &Task, ctx: &Context) -> anyhow::Result<String> {
    render("navigator-prompt.md", context! { role, task, context => ctx })
}

/// The block folded into a task description after a `NeedsChanges` verdict.
pub fn render_feedback(iteration: u32, feedback: &ReviewFeedback) -> anyhow::Result<String> {
    render("feedback.md", context! { iteration, feedback })
}

pub fn render_clarification(
    issue: &IssueRef,
    summary: &str,
    questions: &[ClarificationQuestion],
) -> anyhow::Result<String> {
    render("clarification.md", context! { issue, summary, questions })
}

pub fn render_failure(issue: &IssueRef, reason: &str, results: &[TaskPairResult]) -> anyhow::Result<String> {
    let steps = StepSummary::from_results(results);
    render("status.md", context! { issue, reason, steps })
}

pub fn render_completion(issue: &IssueRef, delivery_id: &str, results: &[TaskPairResult]) -> anyhow::Result<String> {
    let steps = StepSummary::from_results(results);
    render("status.md", context! { issue, delivery_id, steps })
}

pub fn render_delivery_body(
    issue: &IssueRef,
    spec: &RequirementsSpec,
    suite: Option<&VerificationSuite>,
    report: &VerificationReport,
    results: &[TaskPairResult],
) -> anyhow::Result<String> {
    let checks: Vec<String> = suite
        .map(|s| s.checks.iter().map(ToString::to_string).collect())
        .unwrap_or_default();
    let steps = StepSummary::from_results(results);
    render(
        "delivery.md",
        context! { issue, spec, checks, report => report.summary(), steps },
    )
}
