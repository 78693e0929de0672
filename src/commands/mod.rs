pub mod audit;
pub mod cancel;
pub mod init;
pub mod intake;
pub mod reply;
pub mod resume;
pub mod schema;
pub mod status;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use clap::Args;
use tracing::warn;

use crate::capability;
use crate::config::{self, Config};
use crate::workflow::collaborator::GhCollaborator;
use crate::workflow::store::{WorkflowBusy, WorkflowStore};
use crate::workflow::{Orchestrator, OrchestratorSettings};

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Text,
    Json,
}

impl OutputFormat {
    /// Pretty on a terminal, plain text otherwise.
    pub fn resolve(format: Option<Self>) -> Self {
        format.unwrap_or_else(|| {
            if std::io::stdout().is_terminal() {
                Self::Pretty
            } else {
                Self::Text
            }
        })
    }
}

/// Arguments shared by every command that works on a project.
#[derive(Debug, Clone, Args)]
pub struct ProjectArgs {
    /// Project root directory
    #[arg(long)]
    pub project_root: Option<PathBuf>,
}

impl ProjectArgs {
    pub fn root(&self) -> anyhow::Result<PathBuf> {
        match &self.project_root {
            Some(p) => Ok(p.clone()),
            None => std::env::current_dir().context("resolving current directory"),
        }
    }

    pub fn config(&self) -> anyhow::Result<(PathBuf, Config)> {
        let root = self.root()?;
        let path = config::find_config_in_project(&root)?;
        let config = Config::load(&path)?;
        Ok((root, config))
    }

    pub fn store(&self) -> anyhow::Result<WorkflowStore> {
        let (root, config) = self.config()?;
        Ok(WorkflowStore::new(config.state_dir(&root)))
    }
}

/// Wire the configured capability and the `gh` collaborator into an
/// orchestrator. Ctrl-C stops after the in-flight step.
pub fn orchestrator(root: &Path, config: &Config) -> anyhow::Result<Orchestrator> {
    let capability = capability::from_config(&config.capability)?;
    let collaborator = GhCollaborator::new(
        config.repository.name.clone(),
        config.repository.base.clone(),
        config.checkout_dir(root),
    );
    let orchestrator = Orchestrator::new(
        WorkflowStore::new(config.state_dir(root)),
        capability,
        Arc::new(collaborator),
        OrchestratorSettings::from_config(config),
    );

    let flag = orchestrator.shutdown_flag();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("interrupt received; stopping after the current step");
        flag.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "could not install interrupt handler");
    }
    Ok(orchestrator)
}

/// The lock error when another process already holds the issue.
pub fn busy(e: &anyhow::Error) -> Option<&WorkflowBusy> {
    e.downcast_ref::<WorkflowBusy>()
}
