// SPDX-License-Identifier: AGPL-3.0
// Ftper Core - Transport abstraction
//
// A Transport opens sessions against a profile; a session moves one file at
// a time and reports progress as it goes. Sessions can also look around the
// server: list, create and delete.

pub mod codec;
pub mod ftp;
pub mod listing;

#[cfg(test)]
pub(crate) mod testing;

use crate::profiles::Profile;
use crate::task::{Direction, Task, TaskId};
use crate::types::TransportError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// One file transfer as handed to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferJob {
    pub task_id: TaskId,
    pub direction: Direction,
    pub local_path: PathBuf,
    pub remote_path: String,
    /// First byte to move; 0 unless resuming
    pub offset: u64,
}

impl TransferJob {
    pub fn for_task(task: &Task) -> Self {
        Self {
            task_id: task.id,
            direction: task.direction,
            local_path: PathBuf::from(&task.source_path),
            remote_path: task.remote_path.clone(),
            offset: task.bytes_transferred,
        }
    }
}

/// Absolute position of a running transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub bytes_transferred: u64,
    pub bytes_total: Option<u64>,
}

/// What a directory entry is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntryKind {
    File,
    Directory,
    Link,
    Other,
}

/// One line of a remote directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    /// Date column as the server printed it
    pub modified: Option<String>,
}

impl RemoteEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Factory for connections to a server
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether a transfer may continue from a byte offset instead of restarting
    fn supports_resume(&self) -> bool;

    /// Connect and log in; failures are `TransportError::Connect`
    async fn open(&self, profile: &Profile) -> Result<Box<dyn TransportSession>, TransportError>;
}

/// A logged-in connection
#[async_trait]
pub trait TransportSession: Send {
    /// Move one file. Returns the final byte count.
    ///
    /// Must stop promptly with `TransportError::Cancelled` once `cancel` fires,
    /// leaving the bytes already written intact.
    async fn transfer(
        &mut self,
        job: &TransferJob,
        progress: &(dyn Fn(TransferProgress) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<u64, TransportError>;

    /// Whether this connection can continue a transfer at a byte offset.
    /// When it cannot, resumed jobs are handed over with offset 0.
    fn can_resume(&self) -> bool {
        true
    }

    /// Current directory on the server
    async fn working_dir(&mut self) -> Result<String, TransportError> {
        Err(unsupported("PWD"))
    }

    /// Enter `path` and return the directory the server actually put us in
    async fn change_dir(&mut self, _path: &str) -> Result<String, TransportError> {
        Err(unsupported("CWD"))
    }

    async fn list(&mut self, _path: &str) -> Result<Vec<RemoteEntry>, TransportError> {
        Err(unsupported("LIST"))
    }

    async fn make_dir(&mut self, _path: &str) -> Result<(), TransportError> {
        Err(unsupported("MKD"))
    }

    /// Delete a file
    async fn delete(&mut self, _path: &str) -> Result<(), TransportError> {
        Err(unsupported("DELE"))
    }

    /// Say goodbye to the server; errors are not interesting at this point
    async fn close(&mut self);
}

fn unsupported(verb: &str) -> TransportError {
    TransportError::Unsupported(format!("{} is not supported by this transport", verb))
}
