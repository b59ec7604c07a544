// SPDX-License-Identifier: AGPL-3.0
// Ftper Core - Transfer engine
//
// The process-wide handle frontends hold. Built once at startup, shut down
// explicitly. Every call returns immediately; outcomes show up on the task
// snapshot stream and the event channels.

use crate::events::EventBus;
use crate::profiles::{Profile, ProfileDraft, ProfileStore};
use crate::registry::TaskRegistry;
use crate::remote::{RemoteBrowser, RemoteListing};
use crate::scheduler::Scheduler;
use crate::store::TaskStore;
use crate::task::{FileItem, Task, TaskId, TaskSpec};
use crate::transport::Transport;
use crate::types::{AppError, AppSettings};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;

pub struct TransferEngine {
    settings: AppSettings,
    registry: Arc<TaskRegistry>,
    profiles: Arc<ProfileStore>,
    events: Arc<EventBus>,
    scheduler: Arc<Scheduler>,
    browser: RemoteBrowser,
    stopped: AtomicBool,
}

impl TransferEngine {
    /// Build the engine on the current Tokio runtime.
    ///
    /// With `persistTasks` on and a store given, tasks from the previous run
    /// are restored and any queued ones start right away.
    pub fn start(
        settings: AppSettings,
        profiles: Arc<ProfileStore>,
        transport: Arc<dyn Transport>,
        store: Option<TaskStore>,
    ) -> Result<Arc<Self>, AppError> {
        settings.validate()?;
        let handle = Handle::try_current()
            .map_err(|e| AppError::Runtime(format!("No Tokio runtime: {}", e)))?;

        let registry = match store.filter(|_| settings.persist_tasks) {
            Some(store) => {
                tracing::info!("Task file path: {:?}", store.path());
                TaskRegistry::with_store(store)?
            }
            None => TaskRegistry::new(),
        };
        let registry = Arc::new(registry);
        let events = Arc::new(EventBus::default());

        let scheduler = Scheduler::new(
            registry.clone(),
            profiles.clone(),
            transport.clone(),
            events.clone(),
            settings.to_scheduler_config(),
            handle,
        );
        scheduler.dispatch();
        let browser = RemoteBrowser::new(profiles.clone(), transport, events.clone());

        tracing::info!("Transfer engine started with {} tasks", registry.list().len());

        Ok(Arc::new(Self {
            settings,
            registry,
            profiles,
            events,
            scheduler,
            browser,
            stopped: AtomicBool::new(false),
        }))
    }

    fn ensure_running(&self) -> Result<(), AppError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(AppError::EngineStopped);
        }
        Ok(())
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn profiles(&self) -> &Arc<ProfileStore> {
        &self.profiles
    }

    /// Queue a transfer using whatever profile is active when it starts
    pub fn add_task(&self, spec: TaskSpec) -> Result<Task, AppError> {
        self.ensure_running()?;
        if self.profiles.active().is_none() {
            return Err(AppError::NoActiveProfile);
        }
        self.scheduler.enqueue(spec)
    }

    /// Upload a picked file into the default remote directory
    pub fn select_file(&self, item: &FileItem) -> Result<Task, AppError> {
        let remote = remote_join(&self.settings.default_remote_dir, &item.name);
        let task = self.add_task(TaskSpec::upload(
            item.path.to_string_lossy().to_string(),
            remote,
        ))?;
        self.events.success("upload queued");
        Ok(task)
    }

    /// Queue a download; without a local path it lands in the download directory
    pub fn download(&self, remote_path: &str, local_path: Option<PathBuf>) -> Result<Task, AppError> {
        let local_path = match local_path {
            Some(path) => path,
            None => {
                let name = remote_path
                    .rsplit('/')
                    .find(|s| !s.is_empty())
                    .ok_or_else(|| {
                        AppError::InvalidTask(format!("no file name in {:?}", remote_path))
                    })?;
                self.settings.download_dir.join(name)
            }
        };

        self.add_task(TaskSpec::download(
            remote_path,
            local_path.to_string_lossy().to_string(),
        ))
    }

    /// Requeue a paused or failed task
    pub fn start_task(&self, id: TaskId) -> Result<Task, AppError> {
        self.ensure_running()?;
        self.scheduler.start(id)
    }

    pub fn pause(&self, id: TaskId) -> Result<(), AppError> {
        self.ensure_running()?;
        self.scheduler.pause(id)
    }

    pub fn remove(&self, id: TaskId) -> Result<(), AppError> {
        self.ensure_running()?;
        self.scheduler.remove(id)
    }

    pub fn set_active_profile(&self, id: &str) -> Result<Profile, AppError> {
        match self.profiles.set_active(id) {
            Ok(profile) => {
                self.events.info(format!("Using {}", profile.label()));
                Ok(profile)
            }
            Err(e) => {
                self.events.error(e.to_string());
                Err(e)
            }
        }
    }

    pub fn add_profile(&self, draft: ProfileDraft) -> Result<Profile, AppError> {
        match self.profiles.add(draft) {
            Ok(profile) => {
                self.events.success(format!("Saved {}", profile.label()));
                Ok(profile)
            }
            Err(e) => {
                self.events.error(e.to_string());
                Err(e)
            }
        }
    }

    pub fn update_profile(&self, id: &str, draft: ProfileDraft) -> Result<Profile, AppError> {
        match self.profiles.update(id, draft) {
            Ok(profile) => {
                self.events.success(format!("Saved {}", profile.label()));
                Ok(profile)
            }
            Err(e) => {
                self.events.error(e.to_string());
                Err(e)
            }
        }
    }

    /// Delete a profile. Running transfers keep the copy they started with.
    pub fn delete_profile(&self, id: &str) -> Result<(), AppError> {
        let label = self.profiles.get(id).map(|p| p.label().to_string());
        match self.profiles.delete(id) {
            Ok(()) => {
                if let Some(label) = label {
                    self.events.info(format!("Deleted {}", label));
                }
                Ok(())
            }
            Err(e) => {
                self.events.error(e.to_string());
                Err(e)
            }
        }
    }

    /// List a remote directory on the active profile's server. With a path
    /// the browser moves there first; relative paths start from where it is.
    pub async fn list_remote(&self, path: Option<&str>) -> Result<RemoteListing, AppError> {
        self.ensure_running()?;
        self.browser.list(path).await
    }

    pub async fn make_remote_dir(&self, path: &str) -> Result<RemoteListing, AppError> {
        self.ensure_running()?;
        self.browser.make_dir(path).await
    }

    pub async fn delete_remote(&self, path: &str) -> Result<RemoteListing, AppError> {
        self.ensure_running()?;
        self.browser.delete(path).await
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.registry.list()
    }

    pub fn task(&self, id: TaskId) -> Option<Task> {
        self.registry.get(id)
    }

    /// Latest-wins stream of the task list
    pub fn subscribe_tasks(&self) -> watch::Receiver<Vec<Task>> {
        self.registry.subscribe()
    }

    /// Nothing running and nothing queued
    pub fn is_idle(&self) -> bool {
        self.scheduler.is_idle()
    }

    /// Resolve once nothing is running or queued
    pub async fn wait_until_idle(&self) {
        let mut rx = self.subscribe_tasks();
        while !self.is_idle() {
            // slots free up just before the snapshot that shows it, so re-check on a timer too
            let _ = tokio::time::timeout(Duration::from_millis(100), rx.changed()).await;
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Pause running transfers, save the task list and refuse further work
    pub async fn shutdown(&self) -> Result<(), AppError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("Shutting down transfer engine");

        self.scheduler.shutdown().await;
        self.browser.disconnect().await;
        self.registry.flush()
    }
}

fn remote_join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        format!("/{}", name)
    } else if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}
