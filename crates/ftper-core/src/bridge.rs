// SPDX-License-Identifier: AGPL-3.0
// Ftper Core - Engine Bridge
//
// Bridges the async TransferEngine with synchronous frontends. The bridge
// owns its own Tokio runtime; frontends talk to it through a command channel.

use crate::engine::TransferEngine;
use crate::events::EventBus;
use crate::profiles::{Profile, ProfileStore};
use crate::remote::RemoteListing;
use crate::settings::SettingsStore;
use crate::store::TaskStore;
use crate::subscription::SubscriptionScope;
use crate::task::{FileItem, Task, TaskId, TaskSpec};
use crate::transport::ftp::FtpTransport;
use crate::transport::Transport;
use crate::types::{AppError, AppSettings};
use async_channel::{Receiver, Sender};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::watch;

/// Commands that can be sent to the engine
#[derive(Debug)]
pub enum EngineCommand {
    AddTask {
        spec: TaskSpec,
        reply: Sender<Result<Task, AppError>>,
    },
    SelectFile {
        item: FileItem,
        reply: Sender<Result<Task, AppError>>,
    },
    Download {
        remote_path: String,
        local_path: Option<PathBuf>,
        reply: Sender<Result<Task, AppError>>,
    },
    Start {
        id: TaskId,
        reply: Sender<Result<Task, AppError>>,
    },
    Pause {
        id: TaskId,
        reply: Sender<Result<(), AppError>>,
    },
    Remove {
        id: TaskId,
        reply: Sender<Result<(), AppError>>,
    },
    SetActiveProfile {
        id: String,
        reply: Sender<Result<Profile, AppError>>,
    },
    ListTasks {
        reply: Sender<Vec<Task>>,
    },
    ListRemote {
        path: Option<String>,
        reply: Sender<Result<RemoteListing, AppError>>,
    },
    MakeRemoteDir {
        path: String,
        reply: Sender<Result<RemoteListing, AppError>>,
    },
    DeleteRemote {
        path: String,
        reply: Sender<Result<RemoteListing, AppError>>,
    },
    Shutdown {
        reply: Sender<Result<(), AppError>>,
    },
}

/// Bridge between a synchronous frontend and the async engine
pub struct EngineBridge {
    command_tx: Sender<EngineCommand>,
    engine: Arc<TransferEngine>,
    runtime: Arc<Runtime>,
}

impl EngineBridge {
    /// Open the on-disk settings, profiles and tasks and start an FTP engine
    pub fn new() -> Result<Self, AppError> {
        let settings = SettingsStore::new()?.get();
        let profiles = Arc::new(ProfileStore::new()?);
        let transport = Arc::new(FtpTransport::new(settings.to_ftp_config()));
        let store = TaskStore::new()?;

        Self::with_parts(settings, profiles, transport, Some(store))
    }

    pub fn with_parts(
        settings: AppSettings,
        profiles: Arc<ProfileStore>,
        transport: Arc<dyn Transport>,
        store: Option<TaskStore>,
    ) -> Result<Self, AppError> {
        let (command_tx, command_rx) = async_channel::bounded::<EngineCommand>(32);

        let runtime = Arc::new(
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .map_err(|e| AppError::Runtime(format!("Failed to create Tokio runtime: {}", e)))?,
        );

        let engine = {
            let _guard = runtime.enter();
            TransferEngine::start(settings, profiles, transport, store)?
        };

        runtime.spawn(Self::run_engine(engine.clone(), command_rx));

        Ok(Self {
            command_tx,
            engine,
            runtime,
        })
    }

    async fn run_engine(engine: Arc<TransferEngine>, command_rx: Receiver<EngineCommand>) {
        while let Ok(cmd) = command_rx.recv().await {
            match cmd {
                EngineCommand::AddTask { spec, reply } => {
                    let result = engine.add_task(spec);
                    if let Err(e) = &result {
                        tracing::error!("Add task failed: {}", e);
                    }
                    let _ = reply.send(result).await;
                }
                EngineCommand::SelectFile { item, reply } => {
                    let _ = reply.send(engine.select_file(&item)).await;
                }
                EngineCommand::Download {
                    remote_path,
                    local_path,
                    reply,
                } => {
                    let _ = reply.send(engine.download(&remote_path, local_path)).await;
                }
                EngineCommand::Start { id, reply } => {
                    let _ = reply.send(engine.start_task(id)).await;
                }
                EngineCommand::Pause { id, reply } => {
                    let _ = reply.send(engine.pause(id)).await;
                }
                EngineCommand::Remove { id, reply } => {
                    let _ = reply.send(engine.remove(id)).await;
                }
                EngineCommand::SetActiveProfile { id, reply } => {
                    let _ = reply.send(engine.set_active_profile(&id)).await;
                }
                EngineCommand::ListTasks { reply } => {
                    let _ = reply.send(engine.tasks()).await;
                }
                // server round trips run off the loop so task commands stay responsive
                EngineCommand::ListRemote { path, reply } => {
                    let engine = engine.clone();
                    tokio::spawn(async move {
                        let _ = reply.send(engine.list_remote(path.as_deref()).await).await;
                    });
                }
                EngineCommand::MakeRemoteDir { path, reply } => {
                    let engine = engine.clone();
                    tokio::spawn(async move {
                        let _ = reply.send(engine.make_remote_dir(&path).await).await;
                    });
                }
                EngineCommand::DeleteRemote { path, reply } => {
                    let engine = engine.clone();
                    tokio::spawn(async move {
                        let _ = reply.send(engine.delete_remote(&path).await).await;
                    });
                }
                EngineCommand::Shutdown { reply } => {
                    let result = engine.shutdown().await;
                    if let Err(e) = &result {
                        tracing::error!("Failed to save tasks on shutdown: {}", e);
                    }
                    let _ = reply.send(result).await;
                    break;
                }
            }
        }
        tracing::info!("Engine command loop stopped");
    }

    /// Send a command and block until it is answered
    fn request<T>(&self, command: impl FnOnce(Sender<T>) -> EngineCommand) -> Result<T, AppError> {
        let (reply, response) = async_channel::bounded(1);
        self.command_tx
            .send_blocking(command(reply))
            .map_err(|_| AppError::EngineStopped)?;
        response.recv_blocking().map_err(|_| AppError::EngineStopped)
    }

    pub fn add_task(&self, spec: TaskSpec) -> Result<Task, AppError> {
        self.request(|reply| EngineCommand::AddTask { spec, reply })?
    }

    pub fn select_file(&self, item: FileItem) -> Result<Task, AppError> {
        self.request(|reply| EngineCommand::SelectFile { item, reply })?
    }

    pub fn download(&self, remote_path: &str, local_path: Option<PathBuf>) -> Result<Task, AppError> {
        self.request(|reply| EngineCommand::Download {
            remote_path: remote_path.to_string(),
            local_path,
            reply,
        })?
    }

    pub fn start(&self, id: TaskId) -> Result<Task, AppError> {
        self.request(|reply| EngineCommand::Start { id, reply })?
    }

    pub fn pause(&self, id: TaskId) -> Result<(), AppError> {
        self.request(|reply| EngineCommand::Pause { id, reply })?
    }

    pub fn remove(&self, id: TaskId) -> Result<(), AppError> {
        self.request(|reply| EngineCommand::Remove { id, reply })?
    }

    pub fn set_active_profile(&self, id: &str) -> Result<Profile, AppError> {
        self.request(|reply| EngineCommand::SetActiveProfile {
            id: id.to_string(),
            reply,
        })?
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>, AppError> {
        self.request(|reply| EngineCommand::ListTasks { reply })
    }

    /// List the current remote directory, or `path` after moving into it
    pub fn list_remote(&self, path: Option<&str>) -> Result<RemoteListing, AppError> {
        self.request(|reply| EngineCommand::ListRemote {
            path: path.map(str::to_string),
            reply,
        })?
    }

    pub fn make_remote_dir(&self, path: &str) -> Result<RemoteListing, AppError> {
        self.request(|reply| EngineCommand::MakeRemoteDir {
            path: path.to_string(),
            reply,
        })?
    }

    pub fn delete_remote(&self, path: &str) -> Result<RemoteListing, AppError> {
        self.request(|reply| EngineCommand::DeleteRemote {
            path: path.to_string(),
            reply,
        })?
    }

    /// Pause running transfers and save the task list. Later commands fail.
    pub fn shutdown(&self) -> Result<(), AppError> {
        self.request(|reply| EngineCommand::Shutdown { reply })?
    }

    /// Block until nothing is running or queued
    pub fn wait_until_idle(&self) {
        self.runtime.block_on(self.engine.wait_until_idle());
    }

    /// Run a future on the bridge's runtime from synchronous code
    pub fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    pub fn engine(&self) -> &Arc<TransferEngine> {
        &self.engine
    }

    pub fn events(&self) -> &Arc<EventBus> {
        self.engine.events()
    }

    pub fn subscribe_tasks(&self) -> watch::Receiver<Vec<Task>> {
        self.engine.subscribe_tasks()
    }

    /// A scope whose listeners run on the bridge's runtime
    pub fn subscription_scope(&self) -> SubscriptionScope {
        SubscriptionScope::new(self.runtime_handle())
    }

    pub fn runtime_handle(&self) -> Handle {
        self.runtime.handle().clone()
    }
}
