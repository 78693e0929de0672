use std::fs;
use std::io::IsTerminal;

use anyhow::{Context, Result};
use clap::Args;

use super::ProjectArgs;
use crate::config::{CONFIG_TOML, Config};
use crate::error::ExitError;

#[derive(Debug, Args)]
pub struct InitArgs {
    /// Trusted repository as owner/name (prompted for when omitted on a terminal)
    #[arg(long)]
    pub repository: Option<String>,
    /// Overwrite an existing .tandem.toml
    #[arg(long)]
    pub force: bool,
    #[command(flatten)]
    pub project: ProjectArgs,
}

impl InitArgs {
    fn repository(&self) -> Result<String> {
        if let Some(repo) = &self.repository {
            return Ok(repo.clone());
        }
        if !std::io::stdin().is_terminal() {
            return Err(ExitError::Config("--repository is required when not interactive".into()).into());
        }
        dialoguer::Input::<String>::new()
            .with_prompt("Repository (owner/name)")
            .interact_text()
            .context("reading user input")
    }

    pub fn execute(&self) -> Result<()> {
        let root = self.project.root()?;
        let path = root.join(CONFIG_TOML);
        if path.exists() && !self.force {
            return Err(ExitError::Config(format!(
                "{} already exists (use --force to overwrite)",
                path.display()
            ))
            .into());
        }

        let config = Config::for_repository(&self.repository()?);
        config.validate()?;
        fs::create_dir_all(&root).with_context(|| format!("creating {}", root.display()))?;
        fs::write(&path, config.to_toml()?).with_context(|| format!("writing {}", path.display()))?;

        println!("wrote {}", path.display());
        println!(
            "set {} to the webhook secret, then point `capability.command` at your generation program",
            config.intake.secret_env
        );
        Ok(())
    }
}
