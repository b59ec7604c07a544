// SPDX-License-Identifier: AGPL-3.0
// Ftper Core - Scripted transport for tests

use super::{EntryKind, RemoteEntry, TransferJob, TransferProgress, Transport, TransportSession};
use crate::profiles::Profile;
use crate::types::TransportError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// How a transfer of a given source path behaves
#[derive(Debug, Clone)]
pub(crate) enum Script {
    /// Report `total` bytes and succeed
    Succeed { total: u64 },
    /// Fail straight away with a transfer error
    Fail(String),
    /// Report `progress` bytes past the offset, then wait for `release` or cancellation
    Hold { progress: u64, total: u64 },
    /// Report progress, then ignore cancellation forever
    Unresponsive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Call {
    pub source_path: String,
    pub offset: u64,
    pub host: String,
}

#[derive(Default)]
struct MockState {
    scripts: HashMap<String, Script>,
    calls: Vec<Call>,
    refuse: Option<String>,
    no_resume: bool,
    waiting: HashMap<String, oneshot::Sender<Result<u64, TransportError>>>,
    /// Remote tree: directory path to its entries
    dirs: BTreeMap<String, Vec<RemoteEntry>>,
    opened: usize,
}

#[derive(Clone)]
pub(crate) struct MockTransport {
    resume: bool,
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new(resume: bool) -> Self {
        Self {
            resume,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    pub fn script(&self, source_path: &str, script: Script) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .insert(source_path.to_string(), script);
    }

    pub fn refuse_connections(&self, message: &str) {
        self.state.lock().unwrap().refuse = Some(message.to_string());
    }

    /// Sessions opened from now on cannot continue at an offset
    pub fn server_cannot_resume(&self) {
        self.state.lock().unwrap().no_resume = true;
    }

    /// Put a directory with the given files on the fake server
    pub fn remote_dir(&self, path: &str, files: &[(&str, u64)]) {
        let entries = files
            .iter()
            .map(|(name, size)| RemoteEntry {
                name: name.to_string(),
                kind: EntryKind::File,
                size: *size,
                modified: None,
            })
            .collect();
        self.state
            .lock()
            .unwrap()
            .dirs
            .insert(path.to_string(), entries);
    }

    /// Number of sessions opened so far
    pub fn opened(&self) -> usize {
        self.state.lock().unwrap().opened
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Finish a held transfer with `result`, waiting for it to start if needed
    pub async fn release(&self, source_path: &str, result: Result<u64, TransportError>) {
        for _ in 0..200 {
            let sender = self.state.lock().unwrap().waiting.remove(source_path);
            if let Some(sender) = sender {
                let _ = sender.send(result);
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("transfer of {} never started", source_path);
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn supports_resume(&self) -> bool {
        self.resume
    }

    async fn open(&self, profile: &Profile) -> Result<Box<dyn TransportSession>, TransportError> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = state.refuse.clone() {
            return Err(TransportError::Connect(message));
        }
        state.opened += 1;
        Ok(Box::new(MockSession {
            host: profile.host.clone(),
            resume: !state.no_resume,
            cwd: "/".to_string(),
            state: self.state.clone(),
        }))
    }
}

struct MockSession {
    host: String,
    resume: bool,
    cwd: String,
    state: Arc<Mutex<MockState>>,
}

fn split_path(path: &str) -> (String, String) {
    match path.rsplit_once('/') {
        Some(("", name)) => ("/".to_string(), name.to_string()),
        Some((dir, name)) => (dir.to_string(), name.to_string()),
        None => ("/".to_string(), path.to_string()),
    }
}

#[async_trait]
impl TransportSession for MockSession {
    async fn transfer(
        &mut self,
        job: &TransferJob,
        progress: &(dyn Fn(TransferProgress) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<u64, TransportError> {
        let source_path = job.local_path.to_string_lossy().to_string();
        let script = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(Call {
                source_path: source_path.clone(),
                offset: job.offset,
                host: self.host.clone(),
            });
            state
                .scripts
                .get(&source_path)
                .cloned()
                .unwrap_or(Script::Hold {
                    progress: 0,
                    total: 1000,
                })
        };

        match script {
            Script::Succeed { total } => {
                progress(TransferProgress {
                    bytes_transferred: total,
                    bytes_total: Some(total),
                });
                Ok(total)
            }
            Script::Fail(message) => Err(TransportError::Transfer(message)),
            Script::Hold {
                progress: step,
                total,
            } => {
                progress(TransferProgress {
                    bytes_transferred: job.offset + step,
                    bytes_total: Some(total),
                });
                let (tx, rx) = oneshot::channel();
                self.state.lock().unwrap().waiting.insert(source_path, tx);

                tokio::select! {
                    _ = cancel.cancelled() => Err(TransportError::Cancelled),
                    result = rx => result.unwrap_or(Err(TransportError::Cancelled)),
                }
            }
            Script::Unresponsive => {
                progress(TransferProgress {
                    bytes_transferred: job.offset + 1,
                    bytes_total: None,
                });
                std::future::pending().await
            }
        }
    }

    fn can_resume(&self) -> bool {
        self.resume
    }

    async fn working_dir(&mut self) -> Result<String, TransportError> {
        Ok(self.cwd.clone())
    }

    async fn change_dir(&mut self, path: &str) -> Result<String, TransportError> {
        if !self.state.lock().unwrap().dirs.contains_key(path) {
            return Err(TransportError::Transfer(format!(
                "CWD failed: 550 {}: no such directory",
                path
            )));
        }
        self.cwd = path.to_string();
        Ok(self.cwd.clone())
    }

    async fn list(&mut self, path: &str) -> Result<Vec<RemoteEntry>, TransportError> {
        self.state
            .lock()
            .unwrap()
            .dirs
            .get(path)
            .cloned()
            .ok_or_else(|| {
                TransportError::Transfer("LIST failed: 550 no such directory".to_string())
            })
    }

    async fn make_dir(&mut self, path: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.dirs.contains_key(path) {
            return Err(TransportError::Transfer("MKD failed: 550 exists".to_string()));
        }
        let (parent, name) = split_path(path);
        state.dirs.insert(path.to_string(), Vec::new());
        state.dirs.entry(parent).or_default().push(RemoteEntry {
            name,
            kind: EntryKind::Directory,
            size: 0,
            modified: None,
        });
        Ok(())
    }

    async fn delete(&mut self, path: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        let (parent, name) = split_path(path);
        let entries = state.dirs.entry(parent).or_default();
        match entries.iter().position(|e| e.name == name && !e.is_dir()) {
            Some(i) => {
                entries.remove(i);
                Ok(())
            }
            None => Err(TransportError::Transfer(
                "DELE failed: 550 no such file".to_string(),
            )),
        }
    }

    async fn close(&mut self) {}
}
