use std::io::Read;
use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use tracing::info;

use super::ProjectArgs;
use crate::error::ExitError;
use crate::workflow::ReplyOutcome;
use crate::workflow::intake::{Intake, IntakeDecision, IntakeError, ReplyDecision};

/// Environment fallback for `--signature`.
pub const SIGNATURE_ENV: &str = "TANDEM_SIGNATURE";

#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum EventKind {
    /// `issues` webhook event
    #[default]
    Issues,
    /// `issue_comment` webhook event (a clarification reply)
    IssueComment,
}

#[derive(Debug, Args)]
pub struct IntakeArgs {
    /// Raw webhook body ("-" reads stdin)
    #[arg(long)]
    pub event: PathBuf,
    /// X-Hub-Signature-256 header value (defaults to $TANDEM_SIGNATURE)
    #[arg(long)]
    pub signature: Option<String>,
    /// Webhook event type
    #[arg(long, value_enum, default_value_t)]
    pub kind: EventKind,
    #[command(flatten)]
    pub project: ProjectArgs,
}

fn rejected(e: IntakeError) -> anyhow::Error {
    match e {
        IntakeError::Payload(msg) => ExitError::Other(format!("malformed event: {msg}")).into(),
        other => ExitError::SignatureRejected(other.to_string()).into(),
    }
}

impl IntakeArgs {
    fn read_body(&self) -> anyhow::Result<Vec<u8>> {
        if self.event.as_os_str() == "-" {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf).context("reading event from stdin")?;
            return Ok(buf);
        }
        std::fs::read(&self.event).with_context(|| format!("reading {}", self.event.display()))
    }

    pub fn execute(&self) -> anyhow::Result<()> {
        let (root, config) = self.project.config()?;
        let body = self.read_body()?;
        let signature = self
            .signature
            .clone()
            .or_else(|| std::env::var(SIGNATURE_ENV).ok());
        let intake = Intake::new(
            config.webhook_secret()?.into_bytes(),
            config.repository.name.clone(),
            config.intake.actions.clone(),
        );

        match self.kind {
            EventKind::Issues => match intake.issue_event(&body, signature.as_deref()).map_err(rejected)? {
                IntakeDecision::Ignored { reason } => {
                    println!("ignored: {reason}");
                    Ok(())
                }
                IntakeDecision::Accepted(issue) => {
                    let number = issue.number;
                    let orchestrator = super::orchestrator(&root, &config)?;
                    let state = match orchestrator.accept(issue).and_then(|_| orchestrator.drive(number)) {
                        Ok(state) => state,
                        Err(e) if super::busy(&e).is_some() => {
                            println!("issue #{number}: busy; {e}");
                            return Ok(());
                        }
                        Err(e) => return Err(e),
                    };
                    info!(issue = number, state = state.name(), "intake finished");
                    println!("issue #{number}: {state}");
                    Ok(())
                }
            },
            EventKind::IssueComment => match intake.comment_event(&body, signature.as_deref()).map_err(rejected)? {
                ReplyDecision::Ignored { reason } => {
                    println!("ignored: {reason}");
                    Ok(())
                }
                ReplyDecision::Reply(reply) => {
                    let orchestrator = super::orchestrator(&root, &config)?;
                    let outcome = match orchestrator.on_reply(reply.issue, &reply.body) {
                        Ok(outcome) => outcome,
                        Err(e) if super::busy(&e).is_some() => {
                            println!("issue #{}: busy; {e}", reply.issue);
                            return Ok(());
                        }
                        Err(e) => return Err(e),
                    };
                    match outcome {
                        ReplyOutcome::Resumed(state) => println!("issue #{}: {state}", reply.issue),
                        ReplyOutcome::Ignored { state } => {
                            println!("issue #{} is {state}; reply acknowledged and ignored", reply.issue);
                        }
                        ReplyOutcome::UnknownIssue => println!("issue #{} is not tracked", reply.issue),
                    }
                    Ok(())
                }
            },
        }
    }
}
