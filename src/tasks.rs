//! Task list (`prd.json`) and the task source the iteration loop reads from.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Product requirements document: the list of user stories the agent works through.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prd {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub branch_name: String,
    #[serde(default)]
    pub user_stories: Vec<UserStory>,
    #[serde(default)]
    pub metadata: Option<PrdMetadata>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStory {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub passes: bool,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub iterations: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrdMetadata {
    #[serde(default)]
    pub updated_at: String,
}

impl Prd {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read task list: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse task list: {}", path.display()))
    }

    /// Highest-priority story that does not pass yet. Lower number wins; ties go
    /// to the story listed first.
    pub fn current_story(&self) -> Option<&UserStory> {
        self.user_stories
            .iter()
            .filter(|story| !story.passes)
            .min_by_key(|story| story.priority)
    }

    pub fn completed_count(&self) -> usize {
        self.user_stories.iter().filter(|story| story.passes).count()
    }

    pub fn total_count(&self) -> usize {
        self.user_stories.len()
    }

    pub fn remaining_count(&self) -> usize {
        self.total_count() - self.completed_count()
    }
}

/// The task an iteration targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRef {
    pub id: String,
    pub title: String,
}

impl TaskRef {
    pub fn unknown() -> Self {
        Self {
            id: "unknown".to_string(),
            title: String::new(),
        }
    }
}

/// Where the iteration loop gets its current task from.
pub trait TaskSource: Send {
    /// Re-read the backing store. The agent edits it between iterations.
    fn refresh(&mut self) -> Result<()>;

    fn current_task(&self) -> Option<TaskRef>;

    fn completed_count(&self) -> usize;

    fn total_count(&self) -> usize;
}

/// Task source backed by a `prd.json` file.
pub struct PrdTaskSource {
    path: PathBuf,
    prd: Prd,
}

impl PrdTaskSource {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let prd = Prd::load(&path)?;
        Ok(Self { path, prd })
    }
}

impl TaskSource for PrdTaskSource {
    fn refresh(&mut self) -> Result<()> {
        match Prd::load(&self.path) {
            Ok(prd) => {
                self.prd = prd;
                Ok(())
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "keeping previous task list");
                Err(e)
            }
        }
    }

    fn current_task(&self) -> Option<TaskRef> {
        self.prd.current_story().map(|story| TaskRef {
            id: story.id.clone(),
            title: story.title.clone(),
        })
    }

    fn completed_count(&self) -> usize {
        self.prd.completed_count()
    }

    fn total_count(&self) -> usize {
        self.prd.total_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"{
  "name": "Shop",
  "branchName": "ralph/shop",
  "userStories": [
    {"id": "US-001", "title": "Cart", "priority": 2, "passes": true},
    {"id": "US-002", "title": "Checkout", "priority": 3, "passes": false},
    {"id": "US-003", "title": "Search", "priority": 1, "passes": false},
    {"id": "US-004", "title": "Filters", "priority": 1, "passes": false}
  ]
}"#;

    #[test]
    fn test_current_story_prefers_lowest_priority_then_file_order() {
        let prd: Prd = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(prd.current_story().unwrap().id, "US-003");
        assert_eq!(prd.completed_count(), 1);
        assert_eq!(prd.total_count(), 4);
        assert_eq!(prd.remaining_count(), 3);
    }

    #[test]
    fn test_current_story_none_when_all_pass() {
        let mut prd: Prd = serde_json::from_str(SAMPLE).unwrap();
        for story in &mut prd.user_stories {
            story.passes = true;
        }
        assert!(prd.current_story().is_none());
    }

    #[test]
    fn test_load_reads_camel_case_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prd.json");
        std::fs::write(
            &path,
            r#"{"branchName":"ralph/shop","userStories":[
                {"id":"US-1","acceptanceCriteria":["works"],"iterations":2}
            ]}"#,
        )
        .unwrap();

        let loaded = Prd::load(&path).unwrap();
        assert_eq!(loaded.branch_name, "ralph/shop");
        assert_eq!(loaded.user_stories[0].acceptance_criteria, vec!["works"]);
        assert_eq!(loaded.user_stories[0].iterations, 2);
        assert!(loaded.metadata.is_none());
    }

    #[test]
    fn test_load_errors_name_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prd.json");
        let err = Prd::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("prd.json"));

        std::fs::write(&path, "{ not json").unwrap();
        let err = Prd::load(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }

    #[test]
    fn test_task_source_follows_file_changes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prd.json");
        std::fs::write(&path, SAMPLE).unwrap();

        let mut source = PrdTaskSource::open(&path).unwrap();
        assert_eq!(
            source.current_task(),
            Some(TaskRef {
                id: "US-003".into(),
                title: "Search".into()
            })
        );

        let updated = SAMPLE.replace(
            r#""title": "Search", "priority": 1, "passes": false"#,
            r#""title": "Search", "priority": 1, "passes": true"#,
        );
        std::fs::write(&path, updated).unwrap();
        source.refresh().unwrap();
        assert_eq!(source.current_task().unwrap().id, "US-004");
        assert_eq!(source.completed_count(), 2);
    }

    #[test]
    fn test_failed_refresh_keeps_last_good_copy() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prd.json");
        std::fs::write(&path, SAMPLE).unwrap();
        let mut source = PrdTaskSource::open(&path).unwrap();

        std::fs::write(&path, "garbage").unwrap();
        assert!(source.refresh().is_err());
        assert_eq!(source.current_task().unwrap().id, "US-003");
        assert_eq!(source.total_count(), 4);
    }
}
