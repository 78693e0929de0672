use std::io::IsTerminal;

use anyhow::Context;
use clap::Args;
use tracing::info;

use super::ProjectArgs;
use crate::error::ExitError;

#[derive(Debug, Args)]
pub struct CancelArgs {
    /// Issue number
    pub issue: u64,
    /// Skip the confirmation prompt
    #[arg(long)]
    pub yes: bool,
    #[command(flatten)]
    pub project: ProjectArgs,
}

impl CancelArgs {
    fn confirmed(&self, title: &str) -> anyhow::Result<bool> {
        if self.yes {
            return Ok(true);
        }
        if !std::io::stdin().is_terminal() {
            return Err(ExitError::Config("refusing to cancel without --yes when not interactive".into()).into());
        }
        dialoguer::Confirm::new()
            .with_prompt(format!("Cancel work on #{} ({title})?", self.issue))
            .default(false)
            .interact()
            .context("reading user confirmation")
    }

    pub fn execute(&self) -> anyhow::Result<()> {
        let (root, config) = self.project.config()?;
        let orchestrator = super::orchestrator(&root, &config)?;
        let Some(record) = orchestrator.store().load(self.issue)? else {
            return Err(ExitError::Other(format!("no workflow for issue #{}", self.issue)).into());
        };
        if record.state.is_terminal() {
            println!("issue #{} already finished: {}", self.issue, record.state);
            return Ok(());
        }
        if !self.confirmed(&record.issue.title)? {
            println!("not cancelled");
            return Ok(());
        }

        orchestrator.cancel(self.issue)?;
        info!(issue = self.issue, "cancel requested");
        // Nothing else will step a suspended workflow, so apply it now.
        if record.state.is_suspended() {
            match orchestrator.drive(self.issue) {
                Ok(state) => println!("issue #{}: {state}", self.issue),
                Err(e) if super::busy(&e).is_some() => {
                    println!("issue #{}: cancel requested; another process holds the workflow", self.issue);
                }
                Err(e) => return Err(e),
            }
        } else {
            println!("issue #{}: cancel requested; takes effect at the next step", self.issue);
        }
        Ok(())
    }
}
