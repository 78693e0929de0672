//! Workflow orchestrator: routes one issue through analysis, clarification,
//! test creation, implementation, and delivery, one persisted step at a time.

pub mod collaborator;
pub mod intake;
pub mod state;
pub mod store;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context as _;
use chrono::Utc;
use tracing::{error, info, info_span, warn};

use crate::analyst::{AnalysisOutcome, AnalysisRequest, RequirementsAnalyst, RequirementsPolicy};
use crate::capability::Capability;
use crate::config::{Config, LabelsConfig, PairConfig};
use crate::model::{Context, Role, StructuredOutput, TargetedEdit, Task, TaskId, TaskPairResult};
use crate::navigator::{Navigator, integrity};
use crate::pair::{AuditTrail, IterationSink, PairSettings, TaskPair, Tasker};
use crate::template;
use crate::verify::{SUITE_FIELD, SuitePolicy, VerificationSuite};

use collaborator::{ArtifactRead, Collaborator, CollaboratorError, DeliveryRequest, RetryPolicy, idempotency_key};
use intake::IssueRef;
use state::{StepEvent, WorkflowState, transition};
use store::{ClarificationRound, IssueLock, StateChange, WorkflowRecord, WorkflowStore};

/// Per-role limits and the settings shared by every step.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub analyst: PairConfig,
    pub tester: PairConfig,
    pub developer: PairConfig,
    pub base: String,
    pub labels: LabelsConfig,
    pub retry: RetryPolicy,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            analyst: config.pairs.analyst.clone(),
            tester: config.pairs.tester.clone(),
            developer: config.pairs.developer.clone(),
            base: config.repository.base.clone(),
            labels: config.collaborator.labels.clone(),
            retry: RetryPolicy::new(
                config.collaborator.max_retries,
                Duration::from_millis(config.collaborator.retry_base_ms),
            ),
        }
    }

    const fn pair(&self, role: Role) -> &PairConfig {
        match role {
            Role::Analyst => &self.analyst,
            Role::Tester => &self.tester,
            Role::Developer => &self.developer,
        }
    }
}

/// What one call to [`Orchestrator::step`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    Moved(WorkflowState),
    /// Waiting for a human; nothing was done.
    Suspended,
    /// Already terminal; nothing was done.
    Finished,
    /// Shutdown was requested before the step began.
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    Resumed(WorkflowState),
    Ignored { state: String },
    UnknownIssue,
}

pub struct Orchestrator {
    store: WorkflowStore,
    capability: Arc<dyn Capability>,
    collaborator: Arc<dyn Collaborator>,
    settings: OrchestratorSettings,
    audit: Arc<AuditTrail>,
    shutdown: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(
        store: WorkflowStore,
        capability: Arc<dyn Capability>,
        collaborator: Arc<dyn Collaborator>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            capability,
            collaborator,
            settings,
            audit: Arc::new(AuditTrail::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub const fn store(&self) -> &WorkflowStore {
        &self.store
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    /// Flag checked at every step boundary. Setting it leaves records resumable.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Create the record for a newly accepted issue, or refresh the issue
    /// text of one that is still waiting to start.
    pub fn accept(&self, issue: IssueRef) -> anyhow::Result<WorkflowRecord> {
        let number = issue.number;
        let _lock = self.store.lock(number)?;
        let mut record = match self.store.load(number)? {
            Some(mut existing) => {
                if existing.state == WorkflowState::Received {
                    existing.issue = issue;
                }
                info!(issue = number, state = existing.state.name(), "issue already tracked");
                existing
            }
            None => {
                info!(issue = number, "workflow created");
                WorkflowRecord::new(issue)
            }
        };
        self.store.save(&mut record)?;
        Ok(record)
    }

    /// Run steps until the workflow suspends, terminates, or shutdown is requested.
    pub fn drive(&self, issue: u64) -> anyhow::Result<WorkflowState> {
        let lock = self.store.lock(issue)?;
        let mut record = self
            .store
            .load(issue)?
            .with_context(|| format!("no workflow for issue #{issue}"))?;
        self.advance(&mut record, &lock)
    }

    fn advance(&self, record: &mut WorkflowRecord, lock: &IssueLock) -> anyhow::Result<WorkflowState> {
        loop {
            match self.step(record)? {
                Advance::Moved(_) => {
                    if let Err(e) = lock.refresh() {
                        warn!(issue = record.issue.number, error = %format!("{e:#}"), "lock refresh failed");
                    }
                }
                Advance::Suspended | Advance::Finished | Advance::Interrupted => {
                    return Ok(record.state.clone());
                }
            }
        }
    }

    /// Advance every resumable workflow, each on its own thread. Suspended
    /// workflows are only touched when a cancel request is pending.
    pub fn resume_all(&self) -> anyhow::Result<Vec<(u64, anyhow::Result<WorkflowState>)>> {
        let runnable: Vec<u64> = self
            .store
            .list()?
            .into_iter()
            .filter(|r| {
                !r.state.is_terminal()
                    && (!r.state.is_suspended() || self.store.cancel_requested(r.issue.number))
            })
            .map(|r| r.issue.number)
            .collect();
        info!(count = runnable.len(), "resuming workflows");

        Ok(thread::scope(|s| {
            let handles: Vec<_> = runnable
                .iter()
                .map(|&n| (n, s.spawn(move || self.drive(n))))
                .collect();
            handles
                .into_iter()
                .map(|(n, h)| {
                    let result = h
                        .join()
                        .unwrap_or_else(|_| Err(anyhow::anyhow!("workflow thread for #{n} panicked")));
                    (n, result)
                })
                .collect()
        }))
    }

    /// Feed a human reply to a suspended workflow, then keep driving it.
    pub fn on_reply(&self, issue: u64, reply: &str) -> anyhow::Result<ReplyOutcome> {
        let lock = self.store.lock(issue)?;
        let Some(mut record) = self.store.load(issue)? else {
            return Ok(ReplyOutcome::UnknownIssue);
        };
        if !record.state.is_suspended() {
            info!(issue, state = record.state.name(), "reply ignored");
            return Ok(ReplyOutcome::Ignored {
                state: record.state.name().to_string(),
            });
        }
        if let Some(round) = record.clarifications.iter_mut().rev().find(|r| r.answer.is_none()) {
            round.answer = Some(reply.trim().to_string());
            round.answered_at = Some(Utc::now());
        }
        self.apply(&mut record, StepEvent::HumanReplied)?;
        self.store.save(&mut record)?;
        Ok(ReplyOutcome::Resumed(self.advance(&mut record, &lock)?))
    }

    /// Request cancellation; observed at the next step boundary.
    pub fn cancel(&self, issue: u64) -> anyhow::Result<()> {
        self.store.request_cancel(issue)
    }

    /// Perform exactly one step and persist the result.
    pub fn step(&self, record: &mut WorkflowRecord) -> anyhow::Result<Advance> {
        let issue = record.issue.number;
        if record.state.is_terminal() {
            return Ok(Advance::Finished);
        }
        if self.store.cancel_requested(issue) {
            info!(issue, "cancellation observed");
            self.apply(record, StepEvent::Cancelled)?;
            self.store.save(record)?;
            self.store.clear_cancel(issue)?;
            self.report_failure(record);
            return Ok(Advance::Moved(record.state.clone()));
        }
        if record.state.is_suspended() {
            return Ok(Advance::Suspended);
        }
        if self.shutdown.load(Ordering::SeqCst) {
            info!(issue, "shutdown requested; leaving workflow resumable");
            return Ok(Advance::Interrupted);
        }

        let _span = info_span!("step", issue, state = record.state.name()).entered();
        let event = match &record.state {
            WorkflowState::Received | WorkflowState::RequirementsClarified => StepEvent::Proceed,
            WorkflowState::AnalyzingRequirements => self.analyze(record)?,
            WorkflowState::CreatingTests => self.create_tests(record)?,
            WorkflowState::Implementing => self.implement(record)?,
            WorkflowState::CreatingDelivery => self.deliver(record)?,
            WorkflowState::WaitingForClarification
            | WorkflowState::Completed { .. }
            | WorkflowState::Failed { .. } => return Ok(Advance::Finished),
        };

        self.apply(record, event)?;
        self.store.save(record)?;

        match &record.state {
            WorkflowState::Failed { .. } => self.report_failure(record),
            WorkflowState::Completed { delivery_id } => {
                let delivery_id = delivery_id.clone();
                self.report_completion(record, &delivery_id);
            }
            _ => {}
        }
        Ok(Advance::Moved(record.state.clone()))
    }

    fn apply(&self, record: &mut WorkflowRecord, event: StepEvent) -> anyhow::Result<()> {
        let event_name = event.name();
        let next = transition(&record.state, event)?;
        info!(
            issue = record.issue.number,
            from = record.state.name(),
            to = next.name(),
            event = event_name,
            "transition"
        );
        record.history.push(StateChange {
            from: record.state.name().to_string(),
            to: next.name().to_string(),
            event: event_name.to_string(),
            at: Utc::now(),
        });
        record.state = next;
        Ok(())
    }

    fn pair(&self, role: Role, issue: u64) -> TaskPair {
        let cfg = self.settings.pair(role);
        TaskPair::new(PairSettings {
            tasker_timeout: cfg.tasker_timeout(),
            navigator_timeout: cfg.navigator_timeout(),
            on_exhaustion: cfg.on_exhaustion,
        })
        .with_sink(Arc::clone(&self.audit) as Arc<dyn IterationSink>)
        .with_sink(Arc::new(self.store.journal(issue)))
    }

    fn tasker(&self, role: Role) -> Tasker {
        Tasker::new(role, Arc::clone(&self.capability))
    }

    fn navigator(&self, role: Role) -> Navigator {
        let nav = Navigator::new(role, Arc::clone(&self.capability));
        match role {
            Role::Analyst => nav.with_policy(Arc::new(RequirementsPolicy)),
            Role::Tester => nav.with_policy(Arc::new(SuitePolicy)),
            Role::Developer => nav,
        }
    }

    fn attempt(record: &WorkflowRecord, role: Role) -> usize {
        record.results.iter().filter(|r| r.role == role).count() + 1
    }

    fn run_pair(&self, record: &WorkflowRecord, task: Task, context: &Context) -> anyhow::Result<TaskPairResult> {
        let role = task.assigned_role;
        let pair = self.pair(role, record.issue.number);
        let result = pair.run(
            &self.tasker(role),
            &self.navigator(role),
            task,
            context,
            self.settings.pair(role).max_iterations,
        )?;
        Ok(result)
    }

    fn base_context(record: &WorkflowRecord) -> Context {
        let mut ctx = Context::new().with_note(
            "issue",
            format!("#{} {}\n\n{}", record.issue.number, record.issue.title, record.issue.body),
        );
        if let Some(spec) = &record.requirements
            && let Ok(json) = serde_json::to_string_pretty(spec)
        {
            ctx = ctx.with_note("requirements", json);
        }
        ctx
    }

    fn analyze(&self, record: &mut WorkflowRecord) -> anyhow::Result<StepEvent> {
        let clarifications = record.answered_clarifications();
        let analyst_pair = self.pair(Role::Analyst, record.issue.number);
        let analyst = RequirementsAnalyst::new(
            &analyst_pair,
            self.tasker(Role::Analyst),
            self.navigator(Role::Analyst),
            self.settings.analyst.max_iterations,
        );
        let request = AnalysisRequest {
            issue_number: record.issue.number,
            title: &record.issue.title,
            body: &record.issue.body,
            clarifications: &clarifications,
            attempt: Self::attempt(record, Role::Analyst),
        };
        let outcome = analyst.analyze(&request, &Context::new())?;
        info!(issue = record.issue.number, outcome = %outcome, "analysis finished");
        record.results.push(outcome.result().clone());

        match outcome {
            AnalysisOutcome::Clarified { spec, .. } => {
                record.requirements = Some(spec);
                Ok(StepEvent::AnalysisSucceeded)
            }
            AnalysisOutcome::Failed { reason, .. } => Ok(StepEvent::AnalysisFailed { reason }),
            AnalysisOutcome::NeedsClarification { spec, questions, .. } => {
                let round = record.clarifications.len() + 1;
                let text = template::render_clarification(&record.issue, &spec.summary, &questions)?;
                record.requirements = Some(spec);
                record.clarifications.push(ClarificationRound {
                    questions,
                    asked_at: Utc::now(),
                    answer: None,
                    answered_at: None,
                });

                let issue = record.issue.number;
                let key = idempotency_key(issue, "clarify", round);
                if let Err(e) = self.write_once(record, &key, "post_comment", |c| c.post_comment(issue, &text, &key)) {
                    return Ok(StepEvent::ExternalFailure { reason: format!("{e:#}") });
                }
                let labels = vec![self.settings.labels.clarification.clone()];
                let label_key = idempotency_key(issue, "label-clarify", round);
                if let Err(e) = self.write_once(record, &label_key, "add_labels", |c| c.add_labels(issue, &labels)) {
                    return Ok(StepEvent::ExternalFailure { reason: format!("{e:#}") });
                }
                Ok(StepEvent::ClarificationNeeded)
            }
        }
    }

    fn targeted_edit(&self, record: &mut WorkflowRecord) -> anyhow::Result<Result<Option<TargetedEdit>, StepEvent>> {
        let Some(target) = record.requirements.as_ref().and_then(|s| s.target.clone()) else {
            return Ok(Err(StepEvent::TestsFailed {
                reason: "requirements do not name a target artifact".into(),
            }));
        };

        let original = if let Some(content) = record.originals.get(&target.path) {
            Some(content.clone())
        } else {
            let read = self
                .settings
                .retry
                .run("read_artifact", |_| self.collaborator.read_artifact(&target.path));
            match read {
                Ok(ArtifactRead::Found(content)) => {
                    record.originals.insert(target.path.clone(), content.clone());
                    self.store.save(record)?;
                    Some(content)
                }
                Ok(ArtifactRead::NotFound) => None,
                Err(e) => {
                    return Ok(Err(StepEvent::ExternalFailure {
                        reason: format!("{e:#}"),
                    }));
                }
            }
        };

        match (original, target.change) {
            (Some(original), Some(change)) => Ok(Ok(Some(TargetedEdit {
                path: target.path,
                original,
                change,
            }))),
            (Some(_), None) => Ok(Ok(None)),
            (None, Some(_)) => Ok(Err(StepEvent::TestsFailed {
                reason: CollaboratorError::NotFound(target.path).to_string(),
            })),
            (None, None) => Ok(Ok(None)),
        }
    }

    fn create_tests(&self, record: &mut WorkflowRecord) -> anyhow::Result<StepEvent> {
        let edit = match self.targeted_edit(record)? {
            Ok(edit) => edit,
            Err(event) => return Ok(event),
        };
        let issue = record.issue.number;
        let path = record
            .requirements
            .as_ref()
            .and_then(|s| s.target.as_ref())
            .map(|t| t.path.clone())
            .unwrap_or_default();
        let criteria = record
            .requirements
            .as_ref()
            .map(|s| s.acceptance_criteria.clone())
            .unwrap_or_default();

        let mut task = Task::new(
            TaskId::for_issue(issue, Role::Tester, Self::attempt(record, Role::Tester)),
            Role::Tester,
            format!(
                "Write a verification suite for {path} that passes only once the requested change is correctly applied."
            ),
        )
        .with_criteria(criteria)
        .with_criteria([
            "Check that the targeted text is gone or replaced",
            "Check that the content around the target survives",
        ]);
        if let Some(edit) = edit {
            task = task.with_edit(edit);
        }

        let result = self.run_pair(record, task, &Self::base_context(record))?;
        record.results.push(result.clone());
        if !result.success {
            return Ok(StepEvent::TestsFailed {
                reason: result
                    .failure_reason
                    .unwrap_or_else(|| "tester pair failed".into()),
            });
        }

        let suite = result
            .final_output
            .as_ref()
            .map(|o| o.field::<VerificationSuite>(SUITE_FIELD));
        match suite {
            Some(Ok(Some(suite))) if !suite.checks.is_empty() => {
                info!(issue, checks = suite.checks.len(), "verification suite accepted");
                record.verification = Some(suite);
                Ok(StepEvent::TestsCreated)
            }
            Some(Err(e)) => Ok(StepEvent::TestsFailed {
                reason: format!("verification suite is malformed: {e}"),
            }),
            _ => Ok(StepEvent::TestsFailed {
                reason: "tester pair produced no checks".into(),
            }),
        }
    }

    fn implement(&self, record: &mut WorkflowRecord) -> anyhow::Result<StepEvent> {
        let edit = match self.targeted_edit(record)? {
            Ok(edit) => edit,
            Err(StepEvent::TestsFailed { reason }) => {
                return Ok(StepEvent::ImplementationFailed { reason });
            }
            Err(other) => return Ok(other),
        };
        let Some(suite) = record.verification.clone() else {
            return Ok(StepEvent::ImplementationFailed {
                reason: "no verification suite recorded".into(),
            });
        };
        let issue = record.issue.number;
        let summary = record
            .requirements
            .as_ref()
            .map(|s| s.summary.clone())
            .unwrap_or_default();

        let mut task = Task::new(
            TaskId::for_issue(issue, Role::Developer, Self::attempt(record, Role::Developer)),
            Role::Developer,
            format!("Implement: {summary}"),
        )
        .with_criteria(suite.checks.iter().map(ToString::to_string));
        if let Some(edit) = edit {
            task = task.with_edit(edit);
        }

        let ctx = Self::base_context(record).with_note(
            "verification",
            serde_json::to_string_pretty(&suite).context("serializing verification suite")?,
        );
        let result = self.run_pair(record, task, &ctx)?;
        record.results.push(result.clone());
        if !result.success {
            return Ok(StepEvent::ImplementationFailed {
                reason: result
                    .failure_reason
                    .unwrap_or_else(|| "developer pair failed".into()),
            });
        }

        let output = result.final_output.unwrap_or_default();
        let report = suite.evaluate_output(&output);
        if !report.passed() {
            warn!(issue, summary = %report.summary(), "verification failed");
            return Ok(StepEvent::ImplementationFailed {
                reason: format!("verification failed: {}", report.summary()),
            });
        }
        info!(issue, summary = %report.summary(), "verification passed");
        record.implementation = Some(output);
        Ok(StepEvent::ImplementationSucceeded)
    }

    fn deliver(&self, record: &mut WorkflowRecord) -> anyhow::Result<StepEvent> {
        let issue = record.issue.number;
        let Some(output) = record.implementation.clone() else {
            return Ok(StepEvent::DeliveryRejected {
                reason: "no approved implementation recorded".into(),
            });
        };
        let Some(spec) = record.requirements.clone() else {
            return Ok(StepEvent::DeliveryRejected {
                reason: "no requirements recorded".into(),
            });
        };
        let report = record
            .verification
            .as_ref()
            .map(|s| s.evaluate_output(&output))
            .unwrap_or_default();
        let body = template::render_delivery_body(
            &record.issue,
            &spec,
            record.verification.as_ref(),
            &report,
            &record.results,
        )?;
        let key = idempotency_key(issue, "deliver", 1);
        if record.completed_writes.contains(&key)
            && let Some(delivery_id) = record.delivery_id.clone()
        {
            info!(issue, key, "delivery already proposed");
            return Ok(StepEvent::DeliveryAccepted { delivery_id });
        }
        let files = match delivery_files(record, &output) {
            Ok(files) => files,
            Err(reason) => {
                warn!(issue, %reason, "delivery refused");
                return Ok(StepEvent::DeliveryRejected { reason });
            }
        };
        let request = DeliveryRequest {
            branch: format!("tandem/issue-{issue}"),
            title: format!("{} (#{issue})", record.issue.title),
            body,
            base: self.settings.base.clone(),
            files,
            idempotency_key: key,
        };

        match self
            .settings
            .retry
            .run("propose_delivery", |_| self.collaborator.propose_delivery(&request))
        {
            Ok(delivery_id) => {
                record.completed_writes.insert(request.idempotency_key.clone());
                record.delivery_id = Some(delivery_id.clone());
                self.store.save(record)?;
                Ok(StepEvent::DeliveryAccepted { delivery_id })
            }
            Err(e) => Ok(StepEvent::DeliveryRejected {
                reason: format!("{e:#}"),
            }),
        }
    }

    /// Perform a keyed write at most once per workflow, persisting the key.
    fn write_once(
        &self,
        record: &mut WorkflowRecord,
        key: &str,
        operation: &str,
        write: impl Fn(&dyn Collaborator) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        if record.completed_writes.contains(key) {
            info!(issue = record.issue.number, key, "write already done");
            return Ok(());
        }
        self.settings
            .retry
            .run(operation, |_| write(self.collaborator.as_ref()))?;
        record.completed_writes.insert(key.to_string());
        self.store.save(record)
    }

    fn report_failure(&self, record: &mut WorkflowRecord) {
        let issue = record.issue.number;
        let reason = record.failure_reason().unwrap_or("unknown").to_string();
        let text = match template::render_failure(&record.issue, &reason, &record.results) {
            Ok(t) => t,
            Err(e) => {
                error!(issue, error = %e, "rendering failure comment");
                format!("We stopped working on this issue.\n\nReason: {reason}")
            }
        };
        let key = idempotency_key(issue, "failed", 1);
        if let Err(e) = self.write_once(record, &key, "post_comment", |c| c.post_comment(issue, &text, &key)) {
            error!(issue, error = %format!("{e:#}"), "could not report failure");
        }
        let labels = vec![self.settings.labels.failed.clone()];
        let label_key = idempotency_key(issue, "label-failed", 1);
        if let Err(e) = self.write_once(record, &label_key, "add_labels", |c| c.add_labels(issue, &labels)) {
            error!(issue, error = %format!("{e:#}"), "could not label failure");
        }
    }

    fn report_completion(&self, record: &mut WorkflowRecord, delivery_id: &str) {
        let issue = record.issue.number;
        let text = match template::render_completion(&record.issue, delivery_id, &record.results) {
            Ok(t) => t,
            Err(e) => {
                error!(issue, error = %e, "rendering completion comment");
                format!("Done: {delivery_id}")
            }
        };
        let key = idempotency_key(issue, "completed", 1);
        if let Err(e) = self.write_once(record, &key, "post_comment", |c| c.post_comment(issue, &text, &key)) {
            error!(issue, error = %format!("{e:#}"), "could not report completion");
        }
        let labels = vec![self.settings.labels.delivered.clone()];
        let label_key = idempotency_key(issue, "label-delivered", 1);
        if let Err(e) = self.write_once(record, &label_key, "add_labels", |c| c.add_labels(issue, &labels)) {
            error!(issue, error = %format!("{e:#}"), "could not label delivery");
        }
    }
}

/// Files the delivery may write: only artifacts that were read first, and
/// only content that still passes the integrity policy.
fn delivery_files(record: &WorkflowRecord, output: &StructuredOutput) -> Result<BTreeMap<String, String>, String> {
    let change = record
        .requirements
        .as_ref()
        .and_then(|s| s.target.as_ref())
        .and_then(|t| t.change.as_ref());
    let mut files = BTreeMap::new();
    for (path, content) in &output.files {
        let Some(original) = record.originals.get(path) else {
            return Err(format!("refusing to deliver {path}: it was never read"));
        };
        if let Some(change) = change {
            let report = integrity::check(original, content, change);
            if !report.is_clean() {
                return Err(format!(
                    "refusing to deliver {path}: {}",
                    report.findings(path).join("; ")
                ));
            }
        }
        files.insert(path.clone(), content.clone());
    }
    if files.is_empty() {
        return Err("the approved implementation changes no files".into());
    }
    Ok(files)
}
