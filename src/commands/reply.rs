use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

use super::ProjectArgs;
use crate::error::ExitError;
use crate::workflow::ReplyOutcome;

#[derive(Debug, Args)]
pub struct ReplyArgs {
    /// Issue number
    pub issue: u64,
    /// Reply text
    #[arg(long, conflicts_with = "body_file")]
    pub body: Option<String>,
    /// Read the reply from a file
    #[arg(long)]
    pub body_file: Option<PathBuf>,
    #[command(flatten)]
    pub project: ProjectArgs,
}

impl ReplyArgs {
    fn text(&self) -> anyhow::Result<String> {
        if let Some(body) = &self.body {
            return Ok(body.clone());
        }
        if let Some(path) = &self.body_file {
            return std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()));
        }
        let edited = dialoguer::Editor::new()
            .extension(".md")
            .edit(&format!("\n<!-- Reply to issue #{}. Lines in this comment are ignored. -->\n", self.issue))
            .context("opening editor")?;
        let text = edited
            .map(|t| {
                t.lines()
                    .filter(|l| !l.trim_start().starts_with("<!--"))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();
        Ok(text)
    }

    pub fn execute(&self) -> anyhow::Result<()> {
        let text = self.text()?;
        if text.trim().is_empty() {
            return Err(ExitError::Other("empty reply; nothing sent".into()).into());
        }
        let (root, config) = self.project.config()?;
        let orchestrator = super::orchestrator(&root, &config)?;
        match orchestrator.on_reply(self.issue, &text)? {
            ReplyOutcome::Resumed(state) => println!("issue #{}: {state}", self.issue),
            ReplyOutcome::Ignored { state } => {
                println!("issue #{} is {state}; reply acknowledged and ignored", self.issue);
            }
            ReplyOutcome::UnknownIssue => {
                return Err(ExitError::Other(format!("no workflow for issue #{}", self.issue)).into());
            }
        }
        Ok(())
    }
}
