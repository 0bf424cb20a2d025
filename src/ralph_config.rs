//! Project configuration file: `.ralph-tui/config.toml`.
//!
//! Every key is optional. A missing file means defaults.
//!
//! ```toml
//! configVersion = "2.1"
//! maxIterations = 10
//! agent = "claude"
//! iterationDelayMs = 2000
//! completionMarker = "<promise>COMPLETE</promise>"
//!
//! [agentOptions]
//! command = "/opt/bin/claude"
//! model = "opus"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::controller::{DEFAULT_COMPLETION_MARKER, DEFAULT_MAX_ITERATIONS};

pub const STATE_DIR: &str = ".ralph-tui";
pub const CONFIG_FILE: &str = "config.toml";

/// `<project>/.ralph-tui`
pub fn state_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(STATE_DIR)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RalphConfig {
    pub config_version: String,
    pub max_iterations: i64,
    pub agent: String,
    pub tracker: String,
    pub auto_commit: bool,
    pub subagent_tracing_detail: String,
    pub iteration_delay_ms: u64,
    pub completion_marker: String,
    pub agent_options: AgentOptions,
    pub tracker_options: toml::Table,
}

impl Default for RalphConfig {
    fn default() -> Self {
        Self {
            config_version: "2.1".to_string(),
            max_iterations: i64::from(DEFAULT_MAX_ITERATIONS),
            agent: "amp".to_string(),
            tracker: "json".to_string(),
            auto_commit: true,
            subagent_tracing_detail: "full".to_string(),
            iteration_delay_ms: 2000,
            completion_marker: DEFAULT_COMPLETION_MARKER.to_string(),
            agent_options: AgentOptions::default(),
            tracker_options: toml::Table::new(),
        }
    }
}

/// Agent overrides. Keys this crate does not know about are kept as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentOptions {
    /// Executable to run instead of the agent's default CLI name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(flatten)]
    pub extra: toml::Table,
}

impl RalphConfig {
    pub fn path(project_dir: &Path) -> PathBuf {
        state_dir(project_dir).join(CONFIG_FILE)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config.toml")
    }

    /// Load the project's config, falling back to defaults when there is none.
    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        let path = Self::path(project_dir);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, project_dir: &Path) -> Result<PathBuf> {
        let dir = state_dir(project_dir);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(CONFIG_FILE);
        let content = toml::to_string_pretty(self).context("Failed to serialize config.toml")?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = RalphConfig::default();
        assert_eq!(config.config_version, "2.1");
        assert_eq!(config.max_iterations, 10);
        assert_eq!(config.agent, "amp");
        assert_eq!(config.iteration_delay_ms, 2000);
        assert_eq!(config.completion_marker, "<promise>COMPLETE</promise>");
        assert!(config.auto_commit);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = RalphConfig::parse(
            r#"
agent = "claude"
maxIterations = 3

[agentOptions]
command = "/opt/claude"
temperature = 0.2
"#,
        )
        .unwrap();
        assert_eq!(config.agent, "claude");
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.iteration_delay_ms, 2000);
        assert_eq!(config.agent_options.command.as_deref(), Some("/opt/claude"));
        assert!(config.agent_options.model.is_none());
        assert!(config.agent_options.extra.contains_key("temperature"));
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let err = RalphConfig::parse("maxIterations = \"lots\"").unwrap_err();
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = RalphConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config, RalphConfig::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let mut config = RalphConfig::default();
        config.agent = "claude".to_string();
        config.agent_options.model = Some("sonnet".to_string());

        let path = config.save(dir.path()).unwrap();
        assert_eq!(path, dir.path().join(".ralph-tui/config.toml"));

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("maxIterations = 10"));
        assert!(written.contains("[agentOptions]"));

        let loaded = RalphConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded, config);
    }
}
