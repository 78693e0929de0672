//! Task Pair controller: one Tasker, one Navigator, iterate until the
//! Navigator approves, rejects, or the iteration ceiling is reached.

pub mod audit;

use std::fmt;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn};

use crate::capability::{Capability, CapabilityRole};
use crate::model::{
    Context, IterationResult, ReviewDecision, ReviewFeedback, Role, StructuredOutput, Task,
    TaskPairResult,
};
use crate::navigator::Navigator;
use crate::template;

pub use audit::{AuditTrail, IterationSink, Journal};

pub const MAX_ITERATIONS_REASON: &str = "Max iterations reached without approval";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PairError {
    #[error("max_iterations must be at least 1")]
    NoIterations,
    #[error("task {task_id} is assigned to {task_role} but the tasker is a {tasker_role}")]
    RoleMismatch {
        task_id: String,
        task_role: Role,
        tasker_role: Role,
    },
    #[error("navigator for {navigator_role} cannot review a {task_role} task")]
    NavigatorMismatch { task_role: Role, navigator_role: Role },
}

/// What to do when the ceiling is reached without a verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    #[default]
    Fail,
    /// Accept the last iteration's output, flagged as provisional.
    Provisional,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PairSettings {
    pub tasker_timeout: Option<Duration>,
    pub navigator_timeout: Option<Duration>,
    pub on_exhaustion: ExhaustionPolicy,
}

/// Generating half of a Task Pair.
#[derive(Clone)]
pub struct Tasker {
    role: Role,
    capability: Arc<dyn Capability>,
}

impl fmt::Debug for Tasker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tasker").field("role", &self.role).finish_non_exhaustive()
    }
}

impl Tasker {
    pub fn new(role: Role, capability: Arc<dyn Capability>) -> Self {
        Self { role, capability }
    }

    pub const fn role(&self) -> Role {
        self.role
    }

    pub fn generate(&self, task: &Task, context: &Context) -> anyhow::Result<StructuredOutput> {
        self.capability
            .invoke(CapabilityRole::Tasker(self.role), task, context)
    }
}

#[derive(Default)]
pub struct TaskPair {
    settings: PairSettings,
    sinks: Vec<Arc<dyn IterationSink>>,
}

impl fmt::Debug for TaskPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPair")
            .field("settings", &self.settings)
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl TaskPair {
    pub fn new(settings: PairSettings) -> Self {
        Self {
            settings,
            sinks: Vec::new(),
        }
    }

    /// Record every iteration into `sink` as it completes.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn IterationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn run(
        &self,
        tasker: &Tasker,
        navigator: &Navigator,
        mut task: Task,
        context: &Context,
        max_iterations: u32,
    ) -> Result<TaskPairResult, PairError> {
        if max_iterations == 0 {
            return Err(PairError::NoIterations);
        }
        if task.assigned_role != tasker.role() {
            return Err(PairError::RoleMismatch {
                task_id: task.id.to_string(),
                task_role: task.assigned_role,
                tasker_role: tasker.role(),
            });
        }
        if task.assigned_role != navigator.role() {
            return Err(PairError::NavigatorMismatch {
                task_role: task.assigned_role,
                navigator_role: navigator.role(),
            });
        }

        let _span = info_span!("pair", task_id = %task.id, role = %task.assigned_role).entered();
        let mut iterations: Vec<IterationResult> = Vec::new();

        for i in 1..=max_iterations {
            let _iter_span = info_span!("iteration", iteration = i).entered();
            let started = Instant::now();
            let enhanced = context.enhanced(&iterations);

            let output = {
                let (tasker, task, ctx) = (tasker.clone(), task.clone(), enhanced);
                match call_with_timeout(self.settings.tasker_timeout, "tasker", move || {
                    tasker.generate(&task, &ctx)
                }) {
                    Ok(out) => out,
                    Err(e) => {
                        warn!(error = %format!("{e:#}"), "tasker call failed; forwarding to review");
                        StructuredOutput::failure(format!("{e:#}"))
                    }
                }
            };

            let feedback = {
                let (navigator, task, out, ctx) =
                    (navigator.clone(), task.clone(), output.clone(), context.clone());
                match call_with_timeout(self.settings.navigator_timeout, "navigator", move || {
                    navigator.review(&task, &out, &ctx, i)
                }) {
                    Ok(fb) => fb,
                    Err(e) => {
                        warn!(error = %format!("{e:#}"), "navigator call failed; treating as rejection");
                        ReviewFeedback::reviewer_failure(i, &format!("{e:#}"))
                    }
                }
            };

            let result = IterationResult::new(i, output, feedback, started.elapsed());
            for sink in &self.sinks {
                if let Err(e) = sink.record(&task, &result) {
                    warn!(error = %format!("{e:#}"), "failed to record iteration");
                }
            }
            let decision = result.decision();
            iterations.push(result);

            match decision {
                ReviewDecision::Approved => {
                    info!(iterations = i, "approved");
                    let final_output = iterations.last().map(|it| it.tasker_output.clone());
                    return Ok(TaskPairResult {
                        task_id: task.id,
                        role: task.assigned_role,
                        success: true,
                        iterations,
                        final_output,
                        failure_reason: None,
                        provisional: false,
                    });
                }
                ReviewDecision::Rejected => {
                    let assessment = iterations
                        .last()
                        .map(|it| it.navigator_feedback.overall_assessment.clone())
                        .unwrap_or_default();
                    info!(iterations = i, %assessment, "rejected");
                    return Ok(TaskPairResult {
                        task_id: task.id,
                        role: task.assigned_role,
                        success: false,
                        iterations,
                        final_output: None,
                        failure_reason: Some(format!("Navigator rejected: {assessment}")),
                        provisional: false,
                    });
                }
                ReviewDecision::NeedsChanges => {
                    if let Some(last) = iterations.last() {
                        fold(&mut task, i, &last.navigator_feedback);
                    }
                }
            }
        }

        Ok(self.exhausted(task, iterations))
    }

    fn exhausted(&self, task: Task, iterations: Vec<IterationResult>) -> TaskPairResult {
        match self.settings.on_exhaustion {
            ExhaustionPolicy::Provisional => {
                let last = iterations
                    .last()
                    .map(|it| it.tasker_output.clone())
                    .filter(|o| !o.failed);
                warn!(accepted = last.is_some(), "ceiling reached; provisional policy");
                TaskPairResult {
                    task_id: task.id,
                    role: task.assigned_role,
                    success: last.is_some(),
                    provisional: last.is_some(),
                    failure_reason: last.is_none().then(|| MAX_ITERATIONS_REASON.to_string()),
                    final_output: last,
                    iterations,
                }
            }
            ExhaustionPolicy::Fail => {
                info!("ceiling reached without approval");
                TaskPairResult {
                    task_id: task.id,
                    role: task.assigned_role,
                    success: false,
                    iterations,
                    final_output: None,
                    failure_reason: Some(MAX_ITERATIONS_REASON.to_string()),
                    provisional: false,
                }
            }
        }
    }
}

fn fold(task: &mut Task, iteration: u32, feedback: &ReviewFeedback) {
    let block = template::render_feedback(iteration, feedback).unwrap_or_else(|e| {
        warn!(error = %e, "feedback template failed; folding assessment only");
        format!("Feedback (iteration {iteration}): {}", feedback.overall_assessment)
    });
    task.fold_feedback(&block, &feedback.required_changes);
}

/// Run `f` on its own thread and give up after `timeout`.
///
/// A call that outlives its deadline is abandoned, not killed; its result is
/// dropped when it eventually arrives.
pub fn call_with_timeout<T, F>(timeout: Option<Duration>, what: &str, f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    let Some(timeout) = timeout else {
        return f();
    };

    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name(format!("tandem-{what}"))
        .spawn(move || {
            let _ = tx.send(f());
        })
        .map_err(|e| anyhow::anyhow!("spawning {what} call: {e}"))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            anyhow::bail!("{what} call timed out after {}ms", timeout.as_millis())
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            anyhow::bail!("{what} call ended without a result")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_returns_error_promptly() {
        let started = Instant::now();
        let err = call_with_timeout(Some(Duration::from_millis(50)), "tasker", || {
            thread::sleep(Duration::from_secs(2));
            Ok(1)
        })
        .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn fast_call_passes_through() {
        let v = call_with_timeout(Some(Duration::from_secs(5)), "tasker", || Ok(7)).unwrap();
        assert_eq!(v, 7);
    }

    #[test]
    fn no_timeout_runs_inline() {
        let err = call_with_timeout::<u8, _>(None, "navigator", || anyhow::bail!("down")).unwrap_err();
        assert_eq!(err.to_string(), "down");
    }

    #[test]
    fn panicking_call_is_reported() {
        let err = call_with_timeout::<u8, _>(Some(Duration::from_secs(5)), "tasker", || {
            panic!("boom")
        })
        .unwrap_err();
        assert!(err.to_string().contains("without a result"));
    }
}
