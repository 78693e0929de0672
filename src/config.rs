use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ExitError;
use crate::pair::ExhaustionPolicy;
use crate::workflow::intake::DEFAULT_ACTIONS;

/// Config file name constants.
pub const CONFIG_TOML: &str = ".tandem.toml";
pub const CONFIG_JSON: &str = ".tandem.json";

/// Find the config file path, preferring .tandem.toml over .tandem.json.
/// Returns None if neither exists.
pub fn find_config(dir: &Path) -> Option<PathBuf> {
    let toml_path = dir.join(CONFIG_TOML);
    if toml_path.exists() {
        return Some(toml_path);
    }
    let json_path = dir.join(CONFIG_JSON);
    if json_path.exists() {
        return Some(json_path);
    }
    None
}

/// Per-user fallback: `<config dir>/tandem/config.toml`.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("tandem").join("config.toml"))
}

/// Find config for a project root: the project file first, then the user file.
pub fn find_config_in_project(root: &Path) -> anyhow::Result<PathBuf> {
    if let Some(path) = find_config(root) {
        return Ok(path);
    }
    if let Some(path) = user_config_path().filter(|p| p.exists()) {
        return Ok(path);
    }
    Err(ExitError::Config(format!(
        "no {CONFIG_TOML} or {CONFIG_JSON} found in {} (run `tandem init`)",
        root.display()
    ))
    .into())
}

/// Top-level .tandem.toml config.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    pub version: String,
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub intake: IntakeConfig,
    #[serde(default)]
    pub capability: CapabilityConfig,
    #[serde(default)]
    pub pairs: PairsConfig,
    #[serde(default)]
    pub collaborator: CollaboratorConfig,
    #[serde(default)]
    pub state: StateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RepositoryConfig {
    /// `owner/name`; events for any other repository are ignored.
    pub name: String,
    #[serde(default = "default_base")]
    pub base: String,
    /// Local checkout used for reads and delivery branches, relative to the project root.
    #[serde(default = "default_checkout")]
    pub checkout: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct IntakeConfig {
    /// Environment variable holding the webhook HMAC secret.
    #[serde(default = "default_secret_env")]
    pub secret_env: String,
    #[serde(default = "default_actions")]
    pub actions: Vec<String>,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            secret_env: default_secret_env(),
            actions: default_actions(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    #[default]
    Command,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CapabilityConfig {
    #[serde(default)]
    pub kind: CapabilityKind,
    /// Program that reads a request on stdin and prints a structured output.
    #[serde(default = "default_command")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Transport-level timeout; pair timeouts still apply on top.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            kind: CapabilityKind::Command,
            command: default_command(),
            args: Vec::new(),
            endpoint: None,
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PairConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// 0 disables the timeout.
    #[serde(default = "default_timeout_600")]
    pub tasker_timeout_secs: u64,
    #[serde(default = "default_timeout_300")]
    pub navigator_timeout_secs: u64,
    #[serde(default)]
    pub on_exhaustion: ExhaustionPolicy,
}

impl Default for PairConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            tasker_timeout_secs: default_timeout_600(),
            navigator_timeout_secs: default_timeout_300(),
            on_exhaustion: ExhaustionPolicy::Fail,
        }
    }
}

impl PairConfig {
    pub const fn tasker_timeout(&self) -> Option<Duration> {
        secs(self.tasker_timeout_secs)
    }

    pub const fn navigator_timeout(&self) -> Option<Duration> {
        secs(self.navigator_timeout_secs)
    }
}

const fn secs(n: u64) -> Option<Duration> {
    if n == 0 { None } else { Some(Duration::from_secs(n)) }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct PairsConfig {
    #[serde(default)]
    pub analyst: PairConfig,
    #[serde(default)]
    pub tester: PairConfig,
    #[serde(default)]
    pub developer: PairConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CollaboratorConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default)]
    pub labels: LabelsConfig,
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            labels: LabelsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LabelsConfig {
    #[serde(default = "default_label_clarification")]
    pub clarification: String,
    #[serde(default = "default_label_delivered")]
    pub delivered: String,
    #[serde(default = "default_label_failed")]
    pub failed: String,
}

impl Default for LabelsConfig {
    fn default() -> Self {
        Self {
            clarification: default_label_clarification(),
            delivered: default_label_delivered(),
            failed: default_label_failed(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StateConfig {
    /// Workflow records, audit journals and cancel markers, relative to the project root.
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
        }
    }
}

// Default value functions for serde
fn default_base() -> String { "main".into() }
fn default_checkout() -> PathBuf { PathBuf::from(".") }
fn default_secret_env() -> String { "TANDEM_WEBHOOK_SECRET".into() }
fn default_actions() -> Vec<String> { DEFAULT_ACTIONS.iter().map(ToString::to_string).collect() }
#[allow(clippy::unnecessary_wraps)]
fn default_command() -> Option<String> { Some("tandem-agent".into()) }
const fn default_max_iterations() -> u32 { 3 }
const fn default_timeout_300() -> u64 { 300 }
const fn default_timeout_600() -> u64 { 600 }
const fn default_max_retries() -> u32 { 3 }
const fn default_retry_base_ms() -> u64 { 500 }
fn default_label_clarification() -> String { "tandem:needs-clarification".into() }
fn default_label_delivered() -> String { "tandem:delivered".into() }
fn default_label_failed() -> String { "tandem:failed".into() }
fn default_state_dir() -> PathBuf { PathBuf::from(".tandem/state") }

impl Config {
    /// Default config for `repository`, as written by `tandem init`.
    pub fn for_repository(repository: &str) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            repository: RepositoryConfig {
                name: repository.to_string(),
                base: default_base(),
                checkout: default_checkout(),
            },
            intake: IntakeConfig::default(),
            capability: CapabilityConfig::default(),
            pairs: PairsConfig::default(),
            collaborator: CollaboratorConfig::default(),
            state: StateConfig::default(),
        }
    }

    /// Load config from a file (TOML or JSON, auto-detected by extension).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let config = match ext {
            "toml" => Self::parse_toml(&contents),
            "json" => Self::parse_json(&contents),
            _ => Self::parse_toml(&contents).or_else(|_| Self::parse_json(&contents)),
        }?;
        config.validate()?;
        Ok(config)
    }

    /// Parse config from a TOML string.
    pub fn parse_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| ExitError::Config(format!("invalid {CONFIG_TOML}: {e}")).into())
    }

    /// Parse config from a JSON string.
    pub fn parse_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| ExitError::Config(format!("invalid {CONFIG_JSON}: {e}")).into())
    }

    /// Reject values that would make a pair run meaningless.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (role, pair) in [
            ("analyst", &self.pairs.analyst),
            ("tester", &self.pairs.tester),
            ("developer", &self.pairs.developer),
        ] {
            if pair.max_iterations == 0 {
                return Err(ExitError::Config(format!("pairs.{role}.max_iterations must be at least 1")).into());
            }
        }
        if !self.repository.name.contains('/') {
            return Err(ExitError::Config(format!(
                "repository.name must be owner/name, got {:?}",
                self.repository.name
            ))
            .into());
        }
        Ok(())
    }

    pub fn state_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.state.dir)
    }

    pub fn checkout_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.repository.checkout)
    }

    /// Read the webhook secret from the configured environment variable.
    pub fn webhook_secret(&self) -> anyhow::Result<String> {
        match std::env::var(&self.intake.secret_env) {
            Ok(s) if !s.is_empty() => Ok(s),
            _ => Err(ExitError::Config(format!("{} is not set", self.intake.secret_env)).into()),
        }
    }

    /// Serialize config to a TOML string with helpful comments.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        fn set_table_comment(doc: &mut toml_edit::DocumentMut, key: &str, comment: &str) {
            if let Some(tbl) = doc.get_mut(key).and_then(toml_edit::Item::as_table_mut) {
                tbl.decor_mut().set_prefix(comment);
            }
        }

        let raw = toml::to_string_pretty(self).context("serializing config to TOML")?;
        let mut doc: toml_edit::DocumentMut = raw
            .parse()
            .context("parsing generated TOML for comment injection")?;

        doc.decor_mut()
            .set_prefix("# tandem configuration\n# Print the schema with `tandem schema`.\n\n");
        set_table_comment(&mut doc, "repository", "\n# Trusted repository and delivery target\n");
        set_table_comment(&mut doc, "intake", "\n# Webhook authentication and accepted issue actions\n");
        set_table_comment(
            &mut doc,
            "capability",
            "\n# Generation/review capability: kind = \"command\" | \"http\"\n",
        );
        // `pairs` only holds subtables, so its own header is never rendered.
        if let Some(tbl) = doc
            .get_mut("pairs")
            .and_then(|p| p.get_mut("analyst"))
            .and_then(toml_edit::Item::as_table_mut)
        {
            tbl.decor_mut().set_prefix(
                "\n# Per-role iteration ceilings and timeouts (0 disables a timeout)\n# on_exhaustion = \"fail\" | \"provisional\"\n",
            );
        }
        set_table_comment(&mut doc, "collaborator", "\n# Retries and labels for issue tracker writes\n");
        set_table_comment(&mut doc, "state", "\n# Durable workflow state\n");

        Ok(doc.to_string())
    }
}
