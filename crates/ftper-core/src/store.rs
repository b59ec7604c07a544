// SPDX-License-Identifier: AGPL-3.0
// Ftper Core - Task list persistence
//
// Stores the task table in a local JSON file so queued and paused
// transfers survive a restart.

use crate::paths;
use crate::task::{Task, TaskId, TaskState};
use crate::types::AppError;
use std::fs;
use std::path::{Path, PathBuf};

/// File-based task storage
pub struct TaskStore {
    file_path: PathBuf,
}

#[derive(Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct TasksFile {
    #[serde(default)]
    next_id: TaskId,
    #[serde(default)]
    tasks: Vec<Task>,
}

/// What a previous session left behind
#[derive(Debug, Default)]
pub struct Snapshot {
    pub tasks: Vec<Task>,
    /// First id the registry may hand out
    pub next_id: TaskId,
}

impl TaskStore {
    /// Open the task file in the per-user config directory
    pub fn new() -> Result<Self, AppError> {
        Ok(Self::open(paths::tasks_path()?))
    }

    pub fn open(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Where an unparseable task file is moved before starting fresh
    pub fn corrupt_path(&self) -> PathBuf {
        self.file_path.with_extension("json.corrupt")
    }

    /// Load the saved task table.
    ///
    /// A transfer that was running when the process died cannot still be running,
    /// so it comes back paused at its last saved offset.
    pub fn load(&self) -> Result<Snapshot, AppError> {
        if !self.file_path.exists() {
            return Ok(Snapshot {
                tasks: Vec::new(),
                next_id: 1,
            });
        }

        let content = fs::read_to_string(&self.file_path)
            .map_err(|e| AppError::FileIo(format!("Failed to read tasks: {}", e)))?;

        let file: TasksFile = match serde_json::from_str(&content) {
            Ok(file) => file,
            Err(e) => {
                // keep the unreadable table around for whoever wants to recover it
                let aside = self.corrupt_path();
                fs::rename(&self.file_path, &aside).map_err(|err| {
                    AppError::FileIo(format!("Failed to move corrupt tasks file aside: {}", err))
                })?;
                tracing::warn!(
                    "Failed to parse tasks, moved them to {:?} and starting fresh: {}",
                    aside,
                    e
                );
                TasksFile::default()
            }
        };

        let mut tasks: Vec<Task> = file
            .tasks
            .into_iter()
            .filter(|t| t.state != TaskState::Removed)
            .collect();

        for task in tasks.iter_mut() {
            if task.state == TaskState::Running {
                tracing::info!("Task {} was interrupted, marking paused", task.id);
                task.state = TaskState::Paused;
            }
        }

        let max_id = tasks.iter().map(|t| t.id).max().unwrap_or(0);
        let next_id = file.next_id.max(max_id + 1);

        tracing::info!("Loaded {} tasks from disk", tasks.len());
        Ok(Snapshot { tasks, next_id })
    }

    /// Write the task table, replacing the previous file atomically
    pub fn save(&self, tasks: &[Task], next_id: TaskId) -> Result<(), AppError> {
        if let Some(parent) = self.file_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| AppError::FileIo(format!("Failed to create config dir: {}", e)))?;
        }

        let file = TasksFile {
            next_id,
            tasks: tasks.to_vec(),
        };

        let content = serde_json::to_string_pretty(&file)
            .map_err(|e| AppError::Serialization(format!("Failed to serialize tasks: {}", e)))?;

        let tmp = self.file_path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .map_err(|e| AppError::FileIo(format!("Failed to write tasks: {}", e)))?;
        fs::rename(&tmp, &self.file_path)
            .map_err(|e| AppError::FileIo(format!("Failed to replace tasks file: {}", e)))?;

        Ok(())
    }
}
