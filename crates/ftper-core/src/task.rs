// SPDX-License-Identifier: AGPL-3.0
// Ftper Core - Transfer task model and state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Stable task identifier, assigned at creation and never reused
pub type TaskId = u64;

/// Which way the bytes flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    Upload,
    Download,
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskState {
    Queued,
    Running,
    Paused,
    Failed,
    Completed,
    Removed,
}

impl TaskState {
    pub const ALL: [TaskState; 6] = [
        TaskState::Queued,
        TaskState::Running,
        TaskState::Paused,
        TaskState::Failed,
        TaskState::Completed,
        TaskState::Removed,
    ];

    /// State reached by applying `event`, or `None` when the pair is not a legal transition
    pub fn next(self, event: &TaskEvent) -> Option<TaskState> {
        use TaskState::*;

        match (self, event) {
            (Queued, TaskEvent::Dispatch { .. }) => Some(Running),
            (Running, TaskEvent::Progress { .. }) => Some(Running),
            (Running, TaskEvent::Pause) => Some(Paused),
            (Paused | Failed, TaskEvent::Resume) => Some(Queued),
            (Running, TaskEvent::Complete) => Some(Completed),
            (Running, TaskEvent::Fail(_)) => Some(Failed),
            (Queued | Running | Paused | Failed | Completed, TaskEvent::Remove) => Some(Removed),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Paused => "paused",
            TaskState::Failed => "failed",
            TaskState::Completed => "completed",
            TaskState::Removed => "removed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A state-transition request submitted to the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    /// Budget available; the transfer starts at `offset`
    Dispatch { offset: u64 },
    /// Bytes confirmed by the transport, plus the total once it is known
    Progress { bytes: u64, total: Option<u64> },
    Pause,
    Resume,
    Complete,
    /// Transport or cancellation failure with a user-displayable message
    Fail(String),
    Remove,
}

impl TaskEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::Dispatch { .. } => "dispatch",
            TaskEvent::Progress { .. } => "update progress of",
            TaskEvent::Pause => "pause",
            TaskEvent::Resume => "resume",
            TaskEvent::Complete => "complete",
            TaskEvent::Fail(_) => "fail",
            TaskEvent::Remove => "remove",
        }
    }

    /// Whether the event changes the task's state (and therefore deserves persisting)
    pub fn is_state_change(&self) -> bool {
        !matches!(self, TaskEvent::Progress { .. })
    }
}

/// What the UI asks for when it adds a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    /// Local side of the transfer: read for uploads, written for downloads
    pub source_path: String,
    pub remote_path: String,
    pub direction: Direction,
}

impl TaskSpec {
    pub fn upload(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            source_path: local.into(),
            remote_path: remote.into(),
            direction: Direction::Upload,
        }
    }

    pub fn download(remote: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            source_path: local.into(),
            remote_path: remote.into(),
            direction: Direction::Download,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.source_path.trim().is_empty() {
            return Err("local path must not be empty".to_string());
        }
        if self.remote_path.trim().is_empty() {
            return Err("remote path must not be empty".to_string());
        }
        Ok(())
    }
}

/// One queued or active file transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub source_path: String,
    pub remote_path: String,
    pub direction: Direction,
    pub state: TaskState,
    pub bytes_transferred: u64,
    /// `None` until the transport learns the size
    pub bytes_total: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Position in the scheduling queue; refreshed each time the task (re-)enters `Queued`
    #[serde(default)]
    pub queue_seq: u64,
}

impl Task {
    pub(crate) fn new(id: TaskId, spec: TaskSpec, queue_seq: u64) -> Self {
        Self {
            id,
            source_path: spec.source_path,
            remote_path: spec.remote_path,
            direction: spec.direction,
            state: TaskState::Queued,
            bytes_transferred: 0,
            bytes_total: None,
            created_at: Utc::now(),
            last_error: None,
            queue_seq,
        }
    }

    /// Short name for messages: the file name of whichever side is being written
    pub fn display_name(&self) -> String {
        let path = match self.direction {
            Direction::Upload => self.source_path.as_str(),
            Direction::Download => self.remote_path.as_str(),
        };
        path.rsplit(['/', '\\'])
            .find(|s| !s.is_empty())
            .unwrap_or(path)
            .to_string()
    }

    /// Fraction complete in `0.0..=1.0`, if the total is known
    pub fn progress(&self) -> Option<f64> {
        match self.bytes_total {
            Some(0) => Some(1.0),
            Some(total) => Some(self.bytes_transferred as f64 / total as f64),
            None => None,
        }
    }

    /// Apply `event` in place. On an illegal pair the task is left untouched.
    pub(crate) fn apply(&mut self, event: &TaskEvent) -> Result<(), TaskState> {
        let next = self.state.next(event).ok_or(self.state)?;

        match event {
            TaskEvent::Dispatch { offset } => {
                self.bytes_transferred = self.clamp_to_total(*offset);
                self.last_error = None;
            }
            TaskEvent::Progress { bytes, total } => {
                if let Some(total) = total {
                    // a late or smaller total never moves the counter backwards
                    self.bytes_total = Some((*total).max(self.bytes_transferred));
                }
                let bytes = (*bytes).max(self.bytes_transferred);
                self.bytes_transferred = self.clamp_to_total(bytes);
            }
            TaskEvent::Complete => match self.bytes_total {
                Some(total) => self.bytes_transferred = total,
                None => self.bytes_total = Some(self.bytes_transferred),
            },
            TaskEvent::Fail(message) => self.last_error = Some(message.clone()),
            TaskEvent::Pause | TaskEvent::Resume | TaskEvent::Remove => {}
        }

        self.state = next;
        Ok(())
    }

    fn clamp_to_total(&self, bytes: u64) -> u64 {
        match self.bytes_total {
            Some(total) => bytes.min(total),
            None => bytes,
        }
    }
}

/// A local file picked by the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileItem {
    pub path: PathBuf,
    pub name: String,
    pub size: Option<u64>,
}

impl FileItem {
    /// Describe the file at `path`, reading its size when it exists
    pub fn from_path(path: impl AsRef<Path>) -> Option<Self> {
        let path = path.as_ref();
        let name = path.file_name()?.to_string_lossy().to_string();
        let size = std::fs::metadata(path).ok().map(|m| m.len());
        Some(Self {
            path: path.to_path_buf(),
            name,
            size,
        })
    }
}
