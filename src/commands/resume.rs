use clap::Args;
use tracing::error;

use super::ProjectArgs;
use crate::error::ExitError;

#[derive(Debug, Args)]
pub struct ResumeArgs {
    #[command(flatten)]
    pub project: ProjectArgs,
}

impl ResumeArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let (root, config) = self.project.config()?;
        let orchestrator = super::orchestrator(&root, &config)?;
        let results = orchestrator.resume_all()?;
        if results.is_empty() {
            println!("nothing to resume");
            return Ok(());
        }

        let mut failed = 0usize;
        for (issue, result) in results {
            match result {
                Ok(state) => println!("issue #{issue}: {state}"),
                Err(e) if super::busy(&e).is_some() => println!("issue #{issue}: busy; skipped"),
                Err(e) => {
                    failed += 1;
                    error!(issue, error = %format!("{e:#}"), "resume failed");
                    println!("issue #{issue}: error: {e:#}");
                }
            }
        }
        if failed > 0 {
            return Err(ExitError::Other(format!("{failed} workflow(s) could not be advanced")).into());
        }
        Ok(())
    }
}
