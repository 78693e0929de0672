#![allow(dead_code, clippy::unwrap_used)]

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};

use tandem::capability::{Capability, CapabilityRole};
use tandem::config::Config;
use tandem::model::{Context, Role, StructuredOutput, Task};
use tandem::workflow::collaborator::{ArtifactRead, Collaborator, DeliveryRequest, RetryPolicy};
use tandem::workflow::intake::IssueRef;
use tandem::workflow::store::WorkflowStore;
use tandem::workflow::{Orchestrator, OrchestratorSettings};

type Handler = Box<dyn Fn(usize, &Task, &Context) -> anyhow::Result<StructuredOutput> + Send + Sync>;

/// Capability driven by per-role closures. Each closure gets the 1-based call
/// number for its role.
#[derive(Default)]
pub struct ScriptedCapability {
    handlers: HashMap<CapabilityRole, Handler>,
    calls: Mutex<HashMap<CapabilityRole, usize>>,
}

impl ScriptedCapability {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(
        mut self,
        role: CapabilityRole,
        f: impl Fn(usize, &Task, &Context) -> anyhow::Result<StructuredOutput> + Send + Sync + 'static,
    ) -> Self {
        self.handlers.insert(role, Box::new(f));
        self
    }

    /// Return the outputs in order, repeating the last one once exhausted.
    pub fn sequence(self, role: CapabilityRole, outputs: Vec<Result<StructuredOutput, String>>) -> Self {
        self.on(role, move |n, _, _| {
            let idx = (n - 1).min(outputs.len() - 1);
            outputs[idx].clone().map_err(anyhow::Error::msg)
        })
    }

    pub fn always(self, role: CapabilityRole, output: StructuredOutput) -> Self {
        self.on(role, move |_, _, _| Ok(output.clone()))
    }

    pub fn calls(&self, role: CapabilityRole) -> usize {
        self.calls.lock().unwrap().get(&role).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

impl Capability for ScriptedCapability {
    fn invoke(&self, role: CapabilityRole, task: &Task, context: &Context) -> anyhow::Result<StructuredOutput> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(role).or_insert(0);
            *n += 1;
            *n
        };
        match self.handlers.get(&role) {
            Some(h) => h(n, task, context),
            None => anyhow::bail!("no script for {role}"),
        }
    }
}

pub const fn tasker(role: Role) -> CapabilityRole {
    CapabilityRole::Tasker(role)
}

pub const fn navigator(role: Role) -> CapabilityRole {
    CapabilityRole::Navigator(role)
}

/// A review capability answer with every dimension at `score`.
pub fn review(score: u8) -> StructuredOutput {
    review_with(score, json!([]))
}

pub fn review_with(score: u8, issues: Value) -> StructuredOutput {
    StructuredOutput::default()
        .with_data(
            "scores",
            json!({
                "clarity": score,
                "completeness": score,
                "testability": score,
                "specificity": score,
                "consistency": score,
            }),
        )
        .with_data("overall_assessment", json!(format!("scored {score}")))
        .with_data("issues", issues)
}

pub fn requirements(spec: Value) -> StructuredOutput {
    StructuredOutput::default()
        .with_summary("requirements")
        .with_data("requirements", spec)
}

pub fn suite(path: &str, checks: Value) -> StructuredOutput {
    StructuredOutput::default()
        .with_summary("verification suite")
        .with_data("verification", json!({ "path": path, "checks": checks }))
}

/// Requirements for "remove X from F" with everything the gate asks for.
pub fn complete_spec() -> Value {
    json!({
        "summary": "Remove X from F",
        "target": { "path": "F", "change": { "kind": "remove", "text": "X" } },
        "preserve": ["abc", "def"],
        "acceptance_criteria": ["X no longer appears in F", "abc and def are unchanged"],
    })
}

/// The same request, missing the preservation criteria.
pub fn vague_spec() -> Value {
    json!({
        "summary": "Remove X from F",
        "target": { "path": "F", "change": { "kind": "remove", "text": "X" } },
        "acceptance_criteria": ["X no longer appears in F"],
    })
}

pub fn scenario_checks() -> Value {
    json!([
        { "kind": "not_contains", "text": "X" },
        { "kind": "min_length", "chars": 6 },
        { "kind": "contains", "text": "abc" },
        { "kind": "contains", "text": "def" },
    ])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedComment {
    pub issue: u64,
    pub text: String,
    pub key: String,
}

/// In-memory collaborator recording every write.
#[derive(Default)]
pub struct MemoryCollaborator {
    pub files: Mutex<BTreeMap<String, String>>,
    pub comments: Mutex<Vec<PostedComment>>,
    pub labels: Mutex<Vec<(u64, String)>>,
    pub deliveries: Mutex<Vec<DeliveryRequest>>,
    /// Remaining comment posts that fail before one succeeds.
    pub failing_comments: AtomicU32,
    pub failing_deliveries: AtomicU32,
}

impl MemoryCollaborator {
    pub fn with_file(path: &str, content: &str) -> Self {
        let c = Self::default();
        c.files.lock().unwrap().insert(path.into(), content.into());
        c
    }

    pub fn comments(&self) -> Vec<PostedComment> {
        self.comments.lock().unwrap().clone()
    }

    pub fn labels(&self) -> Vec<(u64, String)> {
        self.labels.lock().unwrap().clone()
    }

    pub fn deliveries(&self) -> Vec<DeliveryRequest> {
        self.deliveries.lock().unwrap().clone()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Collaborator for MemoryCollaborator {
    fn read_artifact(&self, path: &str) -> anyhow::Result<ArtifactRead> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .get(path)
            .map_or(ArtifactRead::NotFound, |c| ArtifactRead::Found(c.clone())))
    }

    fn post_comment(&self, issue: u64, text: &str, idempotency_key: &str) -> anyhow::Result<()> {
        if Self::take_failure(&self.failing_comments) {
            anyhow::bail!("tracker unavailable");
        }
        self.comments.lock().unwrap().push(PostedComment {
            issue,
            text: text.into(),
            key: idempotency_key.into(),
        });
        Ok(())
    }

    fn propose_delivery(&self, request: &DeliveryRequest) -> anyhow::Result<String> {
        if Self::take_failure(&self.failing_deliveries) {
            anyhow::bail!("tracker unavailable");
        }
        let mut deliveries = self.deliveries.lock().unwrap();
        deliveries.push(request.clone());
        Ok(format!("https://example.test/pr/{}", deliveries.len()))
    }

    fn add_labels(&self, issue: u64, labels: &[String]) -> anyhow::Result<()> {
        let mut recorded = self.labels.lock().unwrap();
        recorded.extend(labels.iter().map(|l| (issue, l.clone())));
        Ok(())
    }
}

pub fn issue(number: u64) -> IssueRef {
    IssueRef {
        number,
        title: "Remove X from F".into(),
        body: "Please take X out of F.".into(),
        repository: "acme/docs".into(),
        sender: "alice".into(),
    }
}

pub fn settings() -> OrchestratorSettings {
    let mut settings = OrchestratorSettings::from_config(&Config::for_repository("acme/docs"));
    settings.retry = RetryPolicy::new(3, Duration::from_millis(1));
    settings
}

pub fn orchestrator(
    state_dir: &Path,
    capability: &Arc<ScriptedCapability>,
    collaborator: &Arc<MemoryCollaborator>,
) -> Orchestrator {
    Orchestrator::new(
        WorkflowStore::new(state_dir),
        Arc::clone(capability) as Arc<dyn Capability>,
        Arc::clone(collaborator) as Arc<dyn Collaborator>,
        settings(),
    )
}

/// Capability for the happy path of "remove X from F" on `abc X def`.
pub fn scenario_a_capability() -> ScriptedCapability {
    ScriptedCapability::new()
        .sequence(
            tasker(Role::Analyst),
            vec![Ok(requirements(vague_spec())), Ok(requirements(complete_spec()))],
        )
        .always(navigator(Role::Analyst), review(9))
        .always(tasker(Role::Tester), suite("F", scenario_checks()))
        .always(navigator(Role::Tester), review(9))
        .always(
            tasker(Role::Developer),
            StructuredOutput::default()
                .with_summary("removed X")
                .with_file("F", "abc  def"),
        )
        .always(navigator(Role::Developer), review(9))
}
