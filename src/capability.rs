//! The opaque generation/review capability and its adapters.
//!
//! The orchestration code never branches on what kind of engine answered:
//! everything goes through [`Capability::invoke`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use serde::Serialize;
use tracing::debug;

use crate::config::{CapabilityConfig, CapabilityKind};
use crate::model::{Context, Role, StructuredOutput, Task};
use crate::subprocess::Tool;
use crate::template;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "side", content = "role", rename_all = "snake_case")]
pub enum CapabilityRole {
    Tasker(Role),
    Navigator(Role),
}

impl CapabilityRole {
    pub const fn role(self) -> Role {
        match self {
            Self::Tasker(r) | Self::Navigator(r) => r,
        }
    }
}

impl fmt::Display for CapabilityRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tasker(r) => write!(f, "tasker:{r}"),
            Self::Navigator(r) => write!(f, "navigator:{r}"),
        }
    }
}

pub trait Capability: Send + Sync {
    fn invoke(
        &self,
        role: CapabilityRole,
        task: &Task,
        context: &Context,
    ) -> anyhow::Result<StructuredOutput>;
}

/// Wire shape sent to external capabilities.
#[derive(Debug, Serialize)]
pub struct CapabilityRequest<'a> {
    pub role: CapabilityRole,
    pub prompt: String,
    pub task: &'a Task,
    pub context: &'a Context,
}

impl<'a> CapabilityRequest<'a> {
    pub fn build(role: CapabilityRole, task: &'a Task, context: &'a Context) -> anyhow::Result<Self> {
        let prompt = match role {
            CapabilityRole::Tasker(r) => template::render_tasker_prompt(r, task, context)?,
            CapabilityRole::Navigator(r) => template::render_navigator_prompt(r, task, context)?,
        };
        Ok(Self {
            role,
            prompt,
            task,
            context,
        })
    }
}

/// Runs an external program: request JSON on stdin, `StructuredOutput` JSON
/// on stdout.
#[derive(Debug, Clone)]
pub struct CommandCapability {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandCapability {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: None,
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Capability for CommandCapability {
    fn invoke(
        &self,
        role: CapabilityRole,
        task: &Task,
        context: &Context,
    ) -> anyhow::Result<StructuredOutput> {
        let request = CapabilityRequest::build(role, task, context)?;
        let body = serde_json::to_string(&request).context("serializing capability request")?;

        let args: Vec<&str> = self.args.iter().map(String::as_str).collect();
        let mut tool = Tool::new(&self.program).args(&args).arg(&role.to_string()).stdin(body);
        if let Some(t) = self.timeout {
            tool = tool.timeout(t);
        }

        debug!(program = %self.program, %role, task_id = %task.id, "invoking command capability");
        tool.run_ok()?
            .parse_json()
            .with_context(|| format!("{} returned malformed output for {role}", self.program))
    }
}

/// Posts the request JSON to an HTTP endpoint.
#[derive(Debug)]
pub struct HttpCapability {
    endpoint: String,
    agent: ureq::Agent,
}

impl HttpCapability {
    pub fn new(endpoint: impl Into<String>, timeout: Option<Duration>) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(timeout)
            .build()
            .into();
        Self {
            endpoint: endpoint.into(),
            agent,
        }
    }
}

impl Capability for HttpCapability {
    fn invoke(
        &self,
        role: CapabilityRole,
        task: &Task,
        context: &Context,
    ) -> anyhow::Result<StructuredOutput> {
        let request = CapabilityRequest::build(role, task, context)?;
        debug!(endpoint = %self.endpoint, %role, task_id = %task.id, "invoking http capability");
        let output = self
            .agent
            .post(&self.endpoint)
            .send_json(&request)
            .with_context(|| format!("POST {}", self.endpoint))?
            .into_body()
            .read_json::<StructuredOutput>()
            .with_context(|| format!("{} returned malformed output for {role}", self.endpoint))?;
        Ok(output)
    }
}

/// Build the configured capability.
pub fn from_config(config: &CapabilityConfig) -> anyhow::Result<Arc<dyn Capability>> {
    let timeout = config.timeout_secs.map(Duration::from_secs);
    match config.kind {
        CapabilityKind::Command => {
            let Some(command) = config.command.as_deref().filter(|c| !c.is_empty()) else {
                anyhow::bail!(crate::error::ExitError::Config(
                    "capability.command is required when kind = \"command\"".into()
                ));
            };
            let mut cap = CommandCapability::new(command, config.args.clone());
            if let Some(t) = timeout {
                cap = cap.with_timeout(t);
            }
            Ok(Arc::new(cap))
        }
        CapabilityKind::Http => {
            let Some(endpoint) = config.endpoint.as_deref().filter(|e| !e.is_empty()) else {
                anyhow::bail!(crate::error::ExitError::Config(
                    "capability.endpoint is required when kind = \"http\"".into()
                ));
            };
            Ok(Arc::new(HttpCapability::new(endpoint, timeout)))
        }
    }
}
