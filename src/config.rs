use anyhow::{Context, Result, anyhow, bail};
use std::path::{Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;

use crate::agent::AgentKind;
use crate::controller::{DEFAULT_MAX_ITERATIONS, HISTORY_LIMIT, LoopSettings};
use crate::ralph_config::{RalphConfig, state_dir};
use crate::tasks::Prd;

pub const PRD_FILE: &str = "prd.json";
pub const RALPH_DIR_ENV: &str = "RALPH_DIR";

/// Directories never searched for task lists.
const SKIP_DIRS: [&str; 3] = [".git", "node_modules", "vendor"];

/// Command-line values that take precedence over `config.toml`.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub project_dir: Option<PathBuf>,
    pub ralph_dir: Option<PathBuf>,
    pub tool: Option<AgentKind>,
    pub model: Option<String>,
    pub max_iterations: Option<i64>,
    pub verbose: bool,
}

/// Runtime configuration for a loop.
///
/// Bridges `config.toml` with command-line overrides and the on-disk layout of
/// the project (where the task list and prompt files live).
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub ralph_dir: PathBuf,
    pub prd_path: PathBuf,
    pub state_dir: PathBuf,
    pub agent: AgentKind,
    pub agent_command: Option<String>,
    pub model: Option<String>,
    pub max_iterations: u32,
    pub iteration_delay: Duration,
    pub completion_marker: String,
    pub verbose: bool,
    file: RalphConfig,
}

impl Config {
    /// Resolve using the process environment for `RALPH_DIR`.
    pub fn resolve(overrides: Overrides) -> Result<Self> {
        let env_dir = std::env::var_os(RALPH_DIR_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        Self::resolve_with_env(overrides, env_dir)
    }

    pub fn resolve_with_env(overrides: Overrides, env_dir: Option<PathBuf>) -> Result<Self> {
        let project_dir = match overrides.project_dir {
            Some(dir) => dir,
            None => std::env::current_dir().context("Failed to get current directory")?,
        };
        let project_dir = project_dir.canonicalize().with_context(|| {
            format!(
                "Failed to resolve project directory: {}",
                project_dir.display()
            )
        })?;

        let file = RalphConfig::load_or_default(&project_dir)?;

        let ralph_dir = resolve_ralph_dir(
            overrides.ralph_dir.as_deref(),
            env_dir.as_deref(),
            &project_dir,
        )
        .ok_or_else(|| {
            anyhow!("Cannot find ralph directory (no prd.json found). Use --ralph-dir to specify")
        })?;
        let ralph_dir = std::path::absolute(&ralph_dir).with_context(|| {
            format!("Failed to resolve ralph directory: {}", ralph_dir.display())
        })?;

        let agent = match overrides.tool {
            Some(kind) => kind,
            None => file
                .agent
                .parse::<AgentKind>()
                .map_err(|_| anyhow!("Invalid tool '{}'. Must be 'amp' or 'claude'", file.agent))?,
        };

        let model = overrides
            .model
            .or_else(|| file.agent_options.model.clone())
            .filter(|m| !m.is_empty());
        let agent_command = file
            .agent_options
            .command
            .clone()
            .filter(|c| !c.trim().is_empty());

        Ok(Self {
            prd_path: ralph_dir.join(PRD_FILE),
            state_dir: state_dir(&project_dir),
            max_iterations: effective_max_iterations(overrides.max_iterations, file.max_iterations),
            iteration_delay: Duration::from_millis(file.iteration_delay_ms),
            completion_marker: if file.completion_marker.is_empty() {
                crate::controller::DEFAULT_COMPLETION_MARKER.to_string()
            } else {
                file.completion_marker.clone()
            },
            verbose: overrides.verbose,
            project_dir,
            ralph_dir,
            agent,
            agent_command,
            model,
            file,
        })
    }

    pub fn file(&self) -> &RalphConfig {
        &self.file
    }

    pub fn log_file(&self) -> PathBuf {
        self.state_dir.join("ralph.log")
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            max_iterations: self.max_iterations,
            iteration_delay: self.iteration_delay,
            completion_marker: self.completion_marker.clone(),
            history_limit: HISTORY_LIMIT,
        }
    }

    /// Fail early with a readable message when the prompt file is missing.
    pub fn check_prompt_file(&self) -> Result<()> {
        let prompt = self.ralph_dir.join(self.agent.prompt_file());
        if !prompt.is_file() {
            bail!(
                "Prompt file for {} not found: {}",
                self.agent,
                prompt.display()
            );
        }
        Ok(())
    }
}

/// A positive flag wins over the file; anything non-positive falls back to 10.
pub fn effective_max_iterations(flag: Option<i64>, file: i64) -> u32 {
    let chosen = flag.filter(|n| *n > 0).unwrap_or(file);
    if chosen <= 0 {
        DEFAULT_MAX_ITERATIONS
    } else {
        u32::try_from(chosen).unwrap_or(u32::MAX)
    }
}

fn has_prd(dir: &Path) -> bool {
    dir.join(PRD_FILE).is_file()
}

/// Directory holding `prd.json` and the prompt files.
///
/// Order: explicit path, `RALPH_DIR` when it holds a `prd.json`, `scripts/ralph`,
/// then the project directory itself.
pub fn resolve_ralph_dir(
    explicit: Option<&Path>,
    env_dir: Option<&Path>,
    project_dir: &Path,
) -> Option<PathBuf> {
    if let Some(dir) = explicit {
        return Some(dir.to_path_buf());
    }
    if let Some(dir) = env_dir.filter(|d| has_prd(d)) {
        return Some(dir.to_path_buf());
    }
    let scripts = project_dir.join("scripts").join("ralph");
    if has_prd(&scripts) {
        return Some(scripts);
    }
    has_prd(project_dir).then(|| project_dir.to_path_buf())
}

/// Every `prd.json` under `root`, skipping VCS and dependency directories.
pub fn find_prd_files(root: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| {
            !(entry.file_type().is_dir()
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| SKIP_DIRS.contains(&name)))
        })
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file() && entry.file_name() == PRD_FILE)
        .map(|entry| entry.into_path())
        .collect();
    found.sort();
    found
}

/// Short description of a task list for the duplicate warning.
pub fn prd_summary(path: &Path) -> String {
    let Ok(content) = std::fs::read_to_string(path) else {
        return "unreadable".to_string();
    };
    if content.trim().is_empty() {
        return "empty file".to_string();
    }
    let Ok(value) = serde_json::from_str::<serde_json::Value>(&content) else {
        return "invalid JSON".to_string();
    };
    if value.get("userStories").is_none() {
        return "no userStories field".to_string();
    }
    match serde_json::from_value::<Prd>(value) {
        Ok(prd) => format!(
            "{} tasks active, {} tasks total",
            prd.remaining_count(),
            prd.total_count()
        ),
        Err(_) => "invalid JSON".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_prd(dir: &Path, stories: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(
            dir.join(PRD_FILE),
            format!(r#"{{"name":"p","userStories":[{stories}]}}"#),
        )
        .unwrap();
    }

    #[test]
    fn test_effective_max_iterations() {
        assert_eq!(effective_max_iterations(None, 10), 10);
        assert_eq!(effective_max_iterations(Some(3), 10), 3);
        assert_eq!(effective_max_iterations(Some(0), 7), 7);
        assert_eq!(effective_max_iterations(Some(-1), 7), 7);
        assert_eq!(effective_max_iterations(None, 0), 10);
        assert_eq!(effective_max_iterations(None, -5), 10);
    }

    #[test]
    fn test_resolve_ralph_dir_order() {
        let project = tempdir().unwrap();
        let root = project.path();
        assert_eq!(resolve_ralph_dir(None, None, root), None);

        write_prd(root, "");
        assert_eq!(resolve_ralph_dir(None, None, root), Some(root.to_path_buf()));

        let scripts = root.join("scripts/ralph");
        write_prd(&scripts, "");
        assert_eq!(resolve_ralph_dir(None, None, root), Some(scripts.clone()));

        let env = tempdir().unwrap();
        // RALPH_DIR without a prd.json is ignored.
        assert_eq!(
            resolve_ralph_dir(None, Some(env.path()), root),
            Some(scripts.clone())
        );
        write_prd(env.path(), "");
        assert_eq!(
            resolve_ralph_dir(None, Some(env.path()), root),
            Some(env.path().to_path_buf())
        );

        let explicit = Path::new("/somewhere/else");
        assert_eq!(
            resolve_ralph_dir(Some(explicit), Some(env.path()), root),
            Some(explicit.to_path_buf())
        );
    }

    #[test]
    fn test_find_prd_files_skips_noise_dirs() {
        let project = tempdir().unwrap();
        let root = project.path();
        write_prd(root, "");
        write_prd(&root.join("scripts/ralph"), "");
        write_prd(&root.join("node_modules/pkg"), "");
        write_prd(&root.join(".git/x"), "");
        write_prd(&root.join("vendor"), "");

        let found = find_prd_files(root);
        assert_eq!(
            found,
            vec![root.join("prd.json"), root.join("scripts/ralph/prd.json")]
        );
    }

    #[test]
    fn test_prd_summary() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(PRD_FILE);
        assert_eq!(prd_summary(&path), "unreadable");

        std::fs::write(&path, "  \n").unwrap();
        assert_eq!(prd_summary(&path), "empty file");

        std::fs::write(&path, "{").unwrap();
        assert_eq!(prd_summary(&path), "invalid JSON");

        std::fs::write(&path, r#"{"name":"x"}"#).unwrap();
        assert_eq!(prd_summary(&path), "no userStories field");

        write_prd(
            dir.path(),
            r#"{"id":"a","passes":true},{"id":"b","passes":false}"#,
        );
        assert_eq!(prd_summary(&path), "1 tasks active, 2 tasks total");
    }

    #[test]
    fn test_resolve_reads_config_and_applies_overrides() {
        let project = tempdir().unwrap();
        let root = project.path();
        write_prd(root, "");
        RalphConfig {
            agent: "claude".to_string(),
            max_iterations: 4,
            iteration_delay_ms: 0,
            ..Default::default()
        }
        .save(root)
        .unwrap();

        let config = Config::resolve_with_env(
            Overrides {
                project_dir: Some(root.to_path_buf()),
                ..Default::default()
            },
            None,
        )
        .unwrap();
        let canonical = root.canonicalize().unwrap();
        assert_eq!(config.project_dir, canonical);
        assert_eq!(config.ralph_dir, canonical);
        assert_eq!(config.prd_path, canonical.join("prd.json"));
        assert_eq!(config.agent, AgentKind::Claude);
        assert_eq!(config.max_iterations, 4);
        assert_eq!(config.iteration_delay, Duration::ZERO);
        assert_eq!(config.log_file(), canonical.join(".ralph-tui/ralph.log"));

        let config = Config::resolve_with_env(
            Overrides {
                project_dir: Some(root.to_path_buf()),
                tool: Some(AgentKind::Amp),
                max_iterations: Some(2),
                model: Some("fast".to_string()),
                ..Default::default()
            },
            None,
        )
        .unwrap();
        assert_eq!(config.agent, AgentKind::Amp);
        assert_eq!(config.max_iterations, 2);
        assert_eq!(config.model.as_deref(), Some("fast"));
        assert_eq!(config.loop_settings().max_iterations, 2);
    }

    #[test]
    fn test_resolve_rejects_unknown_agent_in_config() {
        let project = tempdir().unwrap();
        write_prd(project.path(), "");
        std::fs::create_dir_all(project.path().join(".ralph-tui")).unwrap();
        std::fs::write(
            project.path().join(".ralph-tui/config.toml"),
            "agent = \"codex\"\n",
        )
        .unwrap();

        let err = Config::resolve_with_env(
            Overrides {
                project_dir: Some(project.path().to_path_buf()),
                ..Default::default()
            },
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Invalid tool 'codex'"));
    }

    #[test]
    fn test_resolve_without_task_list_fails() {
        let project = tempdir().unwrap();
        let err = Config::resolve_with_env(
            Overrides {
                project_dir: Some(project.path().to_path_buf()),
                ..Default::default()
            },
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Cannot find ralph directory"));
    }

    #[test]
    fn test_check_prompt_file() {
        let project = tempdir().unwrap();
        write_prd(project.path(), "");
        let config = Config::resolve_with_env(
            Overrides {
                project_dir: Some(project.path().to_path_buf()),
                tool: Some(AgentKind::Amp),
                ..Default::default()
            },
            None,
        )
        .unwrap();
        assert!(config.check_prompt_file().is_err());

        std::fs::write(project.path().join("prompt.md"), "do it").unwrap();
        assert!(config.check_prompt_file().is_ok());
    }
}
