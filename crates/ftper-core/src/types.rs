// SPDX-License-Identifier: AGPL-3.0
// Ftper Core - Type definitions

use crate::scheduler::SchedulerConfig;
use crate::task::{TaskId, TaskState};
use crate::transport::ftp::FtpConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Application settings (frontend-agnostic)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSettings {
    /// Maximum number of transfers running at the same time
    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: usize,
    /// How long a paused or removed transfer may take to stop, in milliseconds
    #[serde(default = "default_cancel_timeout_ms")]
    pub cancel_timeout_ms: u64,
    /// Control connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Data channel stall timeout in milliseconds
    #[serde(default = "default_data_timeout_ms")]
    pub data_timeout_ms: u64,
    /// Continue paused transfers from their last offset instead of byte 0
    #[serde(default = "default_true")]
    pub resume_transfers: bool,
    /// Keep the task list on disk across restarts
    #[serde(default = "default_true")]
    pub persist_tasks: bool,
    /// Where downloads land when no local path is given
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Remote directory used for files picked with `select_file`
    #[serde(default = "default_remote_dir")]
    pub default_remote_dir: String,
}

fn default_max_concurrent_transfers() -> usize {
    2
}

fn default_cancel_timeout_ms() -> u64 {
    5000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_data_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_download_dir() -> PathBuf {
    directories::UserDirs::new()
        .and_then(|d| d.download_dir().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_remote_dir() -> String {
    "/".to_string()
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: default_max_concurrent_transfers(),
            cancel_timeout_ms: default_cancel_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            data_timeout_ms: default_data_timeout_ms(),
            resume_transfers: true,
            persist_tasks: true,
            download_dir: default_download_dir(),
            default_remote_dir: default_remote_dir(),
        }
    }
}

impl AppSettings {
    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), AppError> {
        if self.max_concurrent_transfers == 0 {
            return Err(AppError::InvalidConfig(
                "maxConcurrentTransfers must be at least 1".to_string(),
            ));
        }
        if self.cancel_timeout_ms == 0 {
            return Err(AppError::InvalidConfig(
                "cancelTimeoutMs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }

    /// Convert to scheduler configuration
    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent: self.max_concurrent_transfers,
            cancel_timeout: self.cancel_timeout(),
        }
    }

    /// Convert to FTP transport configuration
    pub fn to_ftp_config(&self) -> FtpConfig {
        FtpConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            data_timeout: Duration::from_millis(self.data_timeout_ms),
            resume: self.resume_transfers,
        }
    }
}

/// Error types for the application
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Cannot {event} task {id} while it is {state}")]
    InvalidTransition {
        id: TaskId,
        state: TaskState,
        event: &'static str,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    #[error("No active profile selected")]
    NoActiveProfile,

    #[error("Invalid profile: {0}")]
    InvalidProfile(String),

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("File I/O error: {0}")]
    FileIo(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Engine is stopped")]
    EngineStopped,

    /// A remote browsing command failed; the message is the server's
    #[error("{0}")]
    Remote(String),
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::FileIo(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<TransportError> for AppError {
    fn from(err: TransportError) -> Self {
        AppError::Remote(err.to_string())
    }
}

/// Failures reported by a transport.
///
/// `Display` is the bare message so it can be recorded as a task's last error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Server unreachable or login refused
    #[error("{0}")]
    Connect(String),

    /// I/O or protocol failure in the middle of a transfer
    #[error("{0}")]
    Transfer(String),

    /// The transfer stopped because cancellation was requested
    #[error("transfer cancelled")]
    Cancelled,

    /// The server cannot perform what was asked (e.g. resume)
    #[error("{0}")]
    Unsupported(String),
}

impl TransportError {
    pub fn is_connect(&self) -> bool {
        matches!(self, TransportError::Connect(_))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::TimedOut {
            TransportError::Transfer("timeout".to_string())
        } else {
            TransportError::Transfer(err.to_string())
        }
    }
}
