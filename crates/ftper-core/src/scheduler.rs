// SPDX-License-Identifier: AGPL-3.0
// Ftper Core - Transfer scheduler
//
// Runs at most `max_concurrent` transfers at once, oldest queued first.
// Pause and remove on a running task are cooperative: the worker is asked
// to stop and the task only changes state once it has. A watchdog forces
// the task to Failed when the worker does not stop in time.
//
// Lock order: slots, then the registry. Neither is held across an await.

use crate::events::EventBus;
use crate::profiles::{Profile, ProfileStore};
use crate::registry::TaskRegistry;
use crate::task::{Direction, Task, TaskEvent, TaskId, TaskSpec, TaskState};
use crate::transport::{TransferJob, TransferProgress, Transport, TransportSession};
use crate::types::{AppError, TransportError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Message recorded when a transfer ignores a stop request
pub const CANCELLATION_TIMEOUT: &str = "cancellation timed out";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Concurrency budget
    pub max_concurrent: usize,
    /// How long a worker may take to acknowledge a stop request
    pub cancel_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            cancel_timeout: Duration::from_secs(5),
        }
    }
}

/// Why a running transfer was asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopIntent {
    Pause,
    Remove,
}

/// Bookkeeping for one running transfer
struct Slot {
    /// Distinguishes this run from earlier runs of the same task
    run: u64,
    cancel: CancellationToken,
    intent: Option<StopIntent>,
    watchdog_armed: bool,
    worker: JoinHandle<()>,
}

type Slots = HashMap<TaskId, Slot>;

pub struct Scheduler {
    registry: Arc<TaskRegistry>,
    profiles: Arc<ProfileStore>,
    transport: Arc<dyn Transport>,
    events: Arc<EventBus>,
    config: SchedulerConfig,
    slots: Mutex<Slots>,
    next_run: AtomicU64,
    closed: AtomicBool,
    handle: Handle,
}

impl Scheduler {
    pub fn new(
        registry: Arc<TaskRegistry>,
        profiles: Arc<ProfileStore>,
        transport: Arc<dyn Transport>,
        events: Arc<EventBus>,
        config: SchedulerConfig,
        handle: Handle,
    ) -> Arc<Self> {
        tracing::info!(
            "Scheduler ready: {} concurrent transfers, resume {}",
            config.max_concurrent,
            if transport.supports_resume() { "on" } else { "off" }
        );

        Arc::new(Self {
            registry,
            profiles,
            transport,
            events,
            config,
            slots: Mutex::new(HashMap::new()),
            next_run: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            handle,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn lock_slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<(), AppError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::EngineStopped);
        }
        Ok(())
    }

    /// Number of transfers currently holding a slot
    pub fn active_count(&self) -> usize {
        self.lock_slots().len()
    }

    /// Nothing running and nothing waiting to run
    pub fn is_idle(&self) -> bool {
        let slots = self.lock_slots();
        slots.is_empty() && self.registry.count(TaskState::Queued) == 0
    }

    /// Queue a new task and start it if budget allows
    pub fn enqueue(self: &Arc<Self>, spec: TaskSpec) -> Result<Task, AppError> {
        self.ensure_open()?;

        let mut slots = self.lock_slots();
        let task = self.registry.create(spec)?;
        self.dispatch_locked(&mut slots);

        Ok(self.registry.get(task.id).unwrap_or(task))
    }

    /// Requeue a paused or failed task
    pub fn start(self: &Arc<Self>, id: TaskId) -> Result<Task, AppError> {
        self.ensure_open()?;

        let mut slots = self.lock_slots();
        let task = self.registry.apply(id, TaskEvent::Resume)?;
        tracing::info!("Task {} resumed", id);
        self.events.info(format!("{} resumed", task.display_name()));
        self.dispatch_locked(&mut slots);

        Ok(self.registry.get(id).unwrap_or(task))
    }

    /// Ask a running task to stop; it turns Paused once the transfer acknowledges
    pub fn pause(self: &Arc<Self>, id: TaskId) -> Result<(), AppError> {
        let mut slots = self.lock_slots();
        self.registry.check(id, &TaskEvent::Pause)?;

        let Some(slot) = slots.get_mut(&id) else {
            // running without a worker; nothing to wait for
            let task = self.registry.apply(id, TaskEvent::Pause)?;
            self.events.info(format!("{} paused", task.display_name()));
            return Ok(());
        };

        match slot.intent {
            Some(StopIntent::Remove) => Err(AppError::InvalidTransition {
                id,
                state: TaskState::Running,
                event: TaskEvent::Pause.name(),
            }),
            Some(StopIntent::Pause) => Ok(()),
            None => {
                tracing::info!("Pausing task {}", id);
                slot.intent = Some(StopIntent::Pause);
                slot.cancel.cancel();
                let run = slot.run;
                self.arm_watchdog(slot, id, run);
                Ok(())
            }
        }
    }

    /// Remove a task in any state. Unknown ids are ignored.
    pub fn remove(self: &Arc<Self>, id: TaskId) -> Result<(), AppError> {
        let mut slots = self.lock_slots();
        let Some(task) = self.registry.get(id) else {
            tracing::debug!("Task {} already gone", id);
            return Ok(());
        };

        if let Some(slot) = slots.get_mut(&id) {
            if slot.intent != Some(StopIntent::Remove) {
                tracing::info!("Stopping task {} for removal", id);
                slot.intent = Some(StopIntent::Remove);
                slot.cancel.cancel();
                let run = slot.run;
                self.arm_watchdog(slot, id, run);
            }
            return Ok(());
        }

        self.registry.apply(id, TaskEvent::Remove)?;
        self.events.info(format!("{} removed", task.display_name()));
        Ok(())
    }

    /// Fill free slots from the queue
    pub fn dispatch(self: &Arc<Self>) {
        let mut slots = self.lock_slots();
        self.dispatch_locked(&mut slots);
    }

    fn dispatch_locked(self: &Arc<Self>, slots: &mut Slots) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let resume = self.transport.supports_resume();
        while slots.len() < self.config.max_concurrent {
            let Some(task) = self
                .registry
                .dispatch_next(|t| if resume { t.bytes_transferred } else { 0 })
            else {
                break;
            };

            // read once per dispatch; later profile edits do not reach this run
            let profile = self.profiles.active();
            let run = self.next_run.fetch_add(1, Ordering::SeqCst);
            let cancel = CancellationToken::new();
            let job = TransferJob::for_task(&task);

            let worker = self
                .handle
                .spawn(Arc::clone(self).run(run, job, profile, cancel.clone()));

            slots.insert(
                task.id,
                Slot {
                    run,
                    cancel,
                    intent: None,
                    watchdog_armed: false,
                    worker,
                },
            );
        }
    }

    async fn run(
        self: Arc<Self>,
        run: u64,
        job: TransferJob,
        profile: Option<Profile>,
        cancel: CancellationToken,
    ) {
        let (result, session) = self.execute(&job, profile, &cancel).await;
        self.finish(job.task_id, run, result);

        if let Some(mut session) = session {
            session.close().await;
        }
    }

    async fn execute(
        &self,
        job: &TransferJob,
        profile: Option<Profile>,
        cancel: &CancellationToken,
    ) -> (Result<u64, TransportError>, Option<Box<dyn TransportSession>>) {
        let Some(profile) = profile else {
            return (
                Err(TransportError::Connect("no active profile".to_string())),
                None,
            );
        };

        let opened = tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            opened = self.transport.open(&profile) => opened,
        };
        let mut session = match opened {
            Ok(session) => session,
            Err(e) => return (Err(e), None),
        };

        let restarted;
        let job = if job.offset > 0 && !session.can_resume() {
            tracing::info!("Task {}: server cannot resume, starting over", job.task_id);
            let _ = self.registry.rewind(job.task_id);
            restarted = TransferJob {
                offset: 0,
                ..job.clone()
            };
            &restarted
        } else {
            job
        };

        let registry = Arc::clone(&self.registry);
        let id = job.task_id;
        let on_progress = move |p: TransferProgress| {
            // late reports for a task that already stopped are dropped
            let _ = registry.apply(
                id,
                TaskEvent::Progress {
                    bytes: p.bytes_transferred,
                    total: p.bytes_total,
                },
            );
        };

        let result = session.transfer(job, &on_progress, cancel).await;
        (result, Some(session))
    }

    /// Record how a run ended and hand its slot to the next task
    fn finish(self: &Arc<Self>, id: TaskId, run: u64, result: Result<u64, TransportError>) {
        let mut slots = self.lock_slots();
        if slots.get(&id).map(|s| s.run) != Some(run) {
            // the watchdog already gave up on this run
            tracing::debug!("Ignoring late result for task {}", id);
            return;
        }
        let Some(slot) = slots.remove(&id) else {
            return;
        };

        let name = self
            .registry
            .get(id)
            .map(|t| t.display_name())
            .unwrap_or_else(|| format!("task {}", id));

        match (result, slot.intent) {
            (Ok(bytes), intent) => {
                if let Ok(task) = self.apply_logged(id, TaskEvent::Complete) {
                    tracing::info!("Task {} completed, {} bytes", id, bytes);
                    let verb = match task.direction {
                        Direction::Upload => "uploaded",
                        Direction::Download => "downloaded",
                    };
                    self.events.success(format!("{} {}", name, verb));
                }
                if intent == Some(StopIntent::Remove) {
                    let _ = self.apply_logged(id, TaskEvent::Remove);
                    self.events.info(format!("{} removed", name));
                }
            }
            (Err(_), Some(StopIntent::Remove)) => {
                let _ = self.apply_logged(id, TaskEvent::Remove);
                self.events.info(format!("{} removed", name));
            }
            (Err(TransportError::Cancelled), Some(StopIntent::Pause)) => {
                if self.apply_logged(id, TaskEvent::Pause).is_ok() {
                    tracing::info!("Task {} paused", id);
                    self.events.info(format!("{} paused", name));
                }
            }
            (Err(e), _) => {
                tracing::error!("Task {} failed: {}", id, e);
                let _ = self.apply_logged(id, TaskEvent::Fail(e.to_string()));
                self.events.error(format!("{} failed: {}", name, e));
            }
        }

        self.dispatch_locked(&mut slots);
    }

    fn apply_logged(&self, id: TaskId, event: TaskEvent) -> Result<Task, AppError> {
        self.registry.apply(id, event).map_err(|e| {
            tracing::warn!("Task {}: {}", id, e);
            e
        })
    }

    fn arm_watchdog(self: &Arc<Self>, slot: &mut Slot, id: TaskId, run: u64) {
        if slot.watchdog_armed {
            return;
        }
        slot.watchdog_armed = true;

        let this = Arc::clone(self);
        self.handle.spawn(async move {
            tokio::time::sleep(this.config.cancel_timeout).await;
            this.cancellation_timed_out(id, run);
        });
    }

    fn cancellation_timed_out(self: &Arc<Self>, id: TaskId, run: u64) {
        let mut slots = self.lock_slots();
        if slots.get(&id).map(|s| s.run) != Some(run) {
            return;
        }
        let Some(slot) = slots.remove(&id) else {
            return;
        };
        slot.worker.abort();

        tracing::warn!(
            "Task {} did not stop within {:?}, giving up on it",
            id,
            self.config.cancel_timeout
        );

        if let Ok(task) = self.apply_logged(id, TaskEvent::Fail(CANCELLATION_TIMEOUT.to_string())) {
            self.events
                .error(format!("{} failed: {}", task.display_name(), CANCELLATION_TIMEOUT));
        }
        if slot.intent == Some(StopIntent::Remove) {
            let _ = self.apply_logged(id, TaskEvent::Remove);
        }

        self.dispatch_locked(&mut slots);
    }

    /// Stop dispatching, pause everything that runs and wait for it to settle
    pub async fn shutdown(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let mut slots = self.lock_slots();
            tracing::info!("Scheduler shutting down, stopping {} transfers", slots.len());
            for (id, slot) in slots.iter_mut() {
                if slot.intent.is_none() {
                    slot.intent = Some(StopIntent::Pause);
                }
                slot.cancel.cancel();
                let run = slot.run;
                self.arm_watchdog(slot, *id, run);
            }
        }

        let settle = async {
            while self.active_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        let deadline = self.config.cancel_timeout + Duration::from_millis(500);
        if tokio::time::timeout(deadline, settle).await.is_err() {
            tracing::warn!("Scheduler shutdown timed out");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Channel;
    use crate::profiles::ProfileDraft;
    use crate::transport::testing::{MockTransport, Script};

    struct Harness {
        scheduler: Arc<Scheduler>,
        registry: Arc<TaskRegistry>,
        profiles: Arc<ProfileStore>,
        events: Arc<EventBus>,
        transport: MockTransport,
    }

    fn harness(max_concurrent: usize, resume: bool) -> Harness {
        harness_with(
            SchedulerConfig {
                max_concurrent,
                cancel_timeout: Duration::from_secs(2),
            },
            resume,
        )
    }

    fn harness_with(config: SchedulerConfig, resume: bool) -> Harness {
        let registry = Arc::new(TaskRegistry::new());
        let profiles = Arc::new(ProfileStore::in_memory());
        let profile = profiles
            .add(ProfileDraft::new("a.example.com", 21, "me", "pw"))
            .unwrap();
        profiles.set_active(&profile.id).unwrap();
        let events = Arc::new(EventBus::default());
        let transport = MockTransport::new(resume);

        let scheduler = Scheduler::new(
            registry.clone(),
            profiles.clone(),
            Arc::new(transport.clone()),
            events.clone(),
            config,
            Handle::current(),
        );

        Harness {
            scheduler,
            registry,
            profiles,
            events,
            transport,
        }
    }

    fn spec(name: &str) -> TaskSpec {
        TaskSpec::upload(format!("/tmp/{}", name), format!("/{}", name))
    }

    async fn wait_for(registry: &TaskRegistry, id: TaskId, state: TaskState) -> Task {
        for _ in 0..400 {
            if let Some(task) = registry.get(id) {
                if task.state == state {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {} never reached {:?}: {:?}", id, state, registry.get(id));
    }

    async fn wait_gone(registry: &TaskRegistry, id: TaskId) {
        for _ in 0..400 {
            if registry.get(id).is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {} was never purged", id);
    }

    #[tokio::test]
    async fn test_budget_and_pause_hands_slot_to_next() {
        let h = harness(2, true);
        let a = h.scheduler.enqueue(spec("a")).unwrap();
        let b = h.scheduler.enqueue(spec("b")).unwrap();
        let c = h.scheduler.enqueue(spec("c")).unwrap();
        let d = h.scheduler.enqueue(spec("d")).unwrap();

        assert_eq!(a.state, TaskState::Running);
        assert_eq!(b.state, TaskState::Running);
        assert_eq!(c.state, TaskState::Queued);
        assert_eq!(d.state, TaskState::Queued);

        let mut info = h.events.subscribe(Channel::Info);
        h.scheduler.pause(a.id).unwrap();
        wait_for(&h.registry, a.id, TaskState::Paused).await;
        wait_for(&h.registry, c.id, TaskState::Running).await;

        assert_eq!(h.registry.get(d.id).unwrap().state, TaskState::Queued);
        assert_eq!(h.registry.count(TaskState::Running), 2);
        assert_eq!(info.recv().await.unwrap(), "a paused");
    }

    #[tokio::test]
    async fn test_running_count_never_exceeds_budget() {
        let h = harness(2, true);
        let ids: Vec<TaskId> = (0..6)
            .map(|i| h.scheduler.enqueue(spec(&format!("f{}", i))).unwrap().id)
            .collect();

        for (i, id) in ids.iter().enumerate() {
            assert!(h.registry.count(TaskState::Running) <= 2);
            h.transport
                .release(&format!("/tmp/f{}", i), Ok(1000))
                .await;
            wait_for(&h.registry, *id, TaskState::Completed).await;
        }
        assert!(h.scheduler.is_idle());
    }

    #[tokio::test]
    async fn test_transport_error_fails_task_and_frees_slot() {
        let h = harness(1, true);
        h.transport
            .script("/tmp/a", Script::Fail("timeout".to_string()));
        let mut errors = h.events.subscribe(Channel::Error);

        let a = h.scheduler.enqueue(spec("a")).unwrap();
        let b = h.scheduler.enqueue(spec("b")).unwrap();

        let failed = wait_for(&h.registry, a.id, TaskState::Failed).await;
        assert_eq!(failed.last_error.as_deref(), Some("timeout"));
        wait_for(&h.registry, b.id, TaskState::Running).await;
        assert_eq!(errors.recv().await.unwrap(), "a failed: timeout");
    }

    #[tokio::test]
    async fn test_failed_task_is_not_retried_until_started() {
        let h = harness(1, true);
        h.transport
            .script("/tmp/a", Script::Fail("550 denied".to_string()));

        let a = h.scheduler.enqueue(spec("a")).unwrap();
        wait_for(&h.registry, a.id, TaskState::Failed).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.transport.calls().len(), 1);

        h.transport.script("/tmp/a", Script::Succeed { total: 10 });
        h.scheduler.start(a.id).unwrap();
        let done = wait_for(&h.registry, a.id, TaskState::Completed).await;
        assert!(done.last_error.is_none());
        assert_eq!(h.transport.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_resume_continues_from_offset() {
        let h = harness(1, true);
        h.transport.script(
            "/tmp/a",
            Script::Hold {
                progress: 4096,
                total: 10_000,
            },
        );

        let a = h.scheduler.enqueue(spec("a")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.scheduler.pause(a.id).unwrap();
        let paused = wait_for(&h.registry, a.id, TaskState::Paused).await;
        assert_eq!(paused.bytes_transferred, 4096);

        h.transport.script("/tmp/a", Script::Succeed { total: 10_000 });
        h.scheduler.start(a.id).unwrap();
        wait_for(&h.registry, a.id, TaskState::Completed).await;

        let offsets: Vec<u64> = h.transport.calls().iter().map(|c| c.offset).collect();
        assert_eq!(offsets, vec![0, 4096]);
    }

    #[tokio::test]
    async fn test_resume_restarts_without_capability() {
        let h = harness(1, false);
        h.transport.script(
            "/tmp/a",
            Script::Hold {
                progress: 4096,
                total: 10_000,
            },
        );

        let a = h.scheduler.enqueue(spec("a")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.scheduler.pause(a.id).unwrap();
        wait_for(&h.registry, a.id, TaskState::Paused).await;

        h.scheduler.start(a.id).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.transport.calls()[1].offset, 0);
    }

    #[tokio::test]
    async fn test_resume_starts_over_when_server_cannot_resume() {
        let h = harness(1, true);
        h.transport.script(
            "/tmp/a",
            Script::Hold {
                progress: 4096,
                total: 10_000,
            },
        );

        let a = h.scheduler.enqueue(spec("a")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.scheduler.pause(a.id).unwrap();
        wait_for(&h.registry, a.id, TaskState::Paused).await;

        h.transport.server_cannot_resume();
        h.transport.script(
            "/tmp/a",
            Script::Hold {
                progress: 100,
                total: 10_000,
            },
        );
        h.scheduler.start(a.id).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let running = h.registry.get(a.id).unwrap();
        assert_eq!(running.state, TaskState::Running);
        assert_eq!(running.bytes_transferred, 100);
        let offsets: Vec<u64> = h.transport.calls().iter().map(|c| c.offset).collect();
        assert_eq!(offsets, vec![0, 0]);

        h.transport.release("/tmp/a", Ok(10_000)).await;
        wait_for(&h.registry, a.id, TaskState::Completed).await;
    }

    #[tokio::test]
    async fn test_remove_running_waits_for_stop() {
        let h = harness(1, true);
        let a = h.scheduler.enqueue(spec("a")).unwrap();
        let b = h.scheduler.enqueue(spec("b")).unwrap();

        h.scheduler.remove(a.id).unwrap();
        wait_gone(&h.registry, a.id).await;
        wait_for(&h.registry, b.id, TaskState::Running).await;

        // second call on a purged id is a no-op
        h.scheduler.remove(a.id).unwrap();
    }

    #[tokio::test]
    async fn test_remove_in_every_idle_state() {
        let h = harness(1, true);
        h.transport.script("/tmp/done", Script::Succeed { total: 5 });
        h.transport
            .script("/tmp/bad", Script::Fail("boom".to_string()));

        let done = h.scheduler.enqueue(spec("done")).unwrap();
        wait_for(&h.registry, done.id, TaskState::Completed).await;
        let bad = h.scheduler.enqueue(spec("bad")).unwrap();
        wait_for(&h.registry, bad.id, TaskState::Failed).await;
        let held = h.scheduler.enqueue(spec("held")).unwrap();
        let queued = h.scheduler.enqueue(spec("queued")).unwrap();

        for id in [done.id, bad.id, queued.id, held.id] {
            h.scheduler.remove(id).unwrap();
            wait_gone(&h.registry, id).await;
        }
        assert!(h.registry.list().is_empty());
    }

    #[tokio::test]
    async fn test_pause_outside_running_is_invalid() {
        let h = harness(1, true);
        h.transport.script("/tmp/a", Script::Succeed { total: 5 });
        let a = h.scheduler.enqueue(spec("a")).unwrap();
        wait_for(&h.registry, a.id, TaskState::Completed).await;

        let b = h.scheduler.enqueue(spec("b")).unwrap();
        let c = h.scheduler.enqueue(spec("c")).unwrap();
        assert_eq!(b.state, TaskState::Running);

        for id in [a.id, c.id] {
            assert!(matches!(
                h.scheduler.pause(id),
                Err(AppError::InvalidTransition { .. })
            ));
        }
        assert!(matches!(
            h.scheduler.start(b.id),
            Err(AppError::InvalidTransition { .. })
        ));
        assert!(matches!(
            h.scheduler.pause(999),
            Err(AppError::TaskNotFound(999))
        ));
    }

    #[tokio::test]
    async fn test_unresponsive_transport_is_forced_to_failed() {
        let h = harness_with(
            SchedulerConfig {
                max_concurrent: 1,
                cancel_timeout: Duration::from_millis(100),
            },
            true,
        );
        h.transport.script("/tmp/a", Script::Unresponsive);

        let a = h.scheduler.enqueue(spec("a")).unwrap();
        let b = h.scheduler.enqueue(spec("b")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.scheduler.pause(a.id).unwrap();

        let failed = wait_for(&h.registry, a.id, TaskState::Failed).await;
        assert_eq!(failed.last_error.as_deref(), Some(CANCELLATION_TIMEOUT));
        wait_for(&h.registry, b.id, TaskState::Running).await;
    }

    #[tokio::test]
    async fn test_unresponsive_remove_still_purges() {
        let h = harness_with(
            SchedulerConfig {
                max_concurrent: 1,
                cancel_timeout: Duration::from_millis(100),
            },
            true,
        );
        h.transport.script("/tmp/a", Script::Unresponsive);

        let a = h.scheduler.enqueue(spec("a")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.scheduler.remove(a.id).unwrap();
        wait_gone(&h.registry, a.id).await;
    }

    #[tokio::test]
    async fn test_profile_is_read_at_dispatch() {
        let h = harness(1, true);
        let a = h.scheduler.enqueue(spec("a")).unwrap();
        let b = h.scheduler.enqueue(spec("b")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let other = h
            .profiles
            .add(ProfileDraft::new("b.example.com", 21, "me", "pw"))
            .unwrap();
        h.profiles.set_active(&other.id).unwrap();

        h.transport.release("/tmp/a", Ok(1000)).await;
        wait_for(&h.registry, a.id, TaskState::Completed).await;
        wait_for(&h.registry, b.id, TaskState::Running).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let hosts: Vec<String> = h.transport.calls().into_iter().map(|c| c.host).collect();
        assert_eq!(hosts, vec!["a.example.com", "b.example.com"]);
    }

    #[tokio::test]
    async fn test_no_active_profile_fails_task() {
        let h = harness(1, true);
        h.profiles.clear_active().unwrap();

        let a = h.scheduler.enqueue(spec("a")).unwrap();
        let failed = wait_for(&h.registry, a.id, TaskState::Failed).await;
        assert_eq!(failed.last_error.as_deref(), Some("no active profile"));
    }

    #[tokio::test]
    async fn test_connect_error_fails_task() {
        let h = harness(1, true);
        h.transport.refuse_connections("login failed: 530 Login incorrect");

        let a = h.scheduler.enqueue(spec("a")).unwrap();
        let failed = wait_for(&h.registry, a.id, TaskState::Failed).await;
        assert_eq!(
            failed.last_error.as_deref(),
            Some("login failed: 530 Login incorrect")
        );
    }

    #[tokio::test]
    async fn test_shutdown_pauses_running_and_rejects_work() {
        let h = harness(2, true);
        let a = h.scheduler.enqueue(spec("a")).unwrap();
        let b = h.scheduler.enqueue(spec("b")).unwrap();
        let c = h.scheduler.enqueue(spec("c")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.scheduler.shutdown().await;

        assert_eq!(h.registry.get(a.id).unwrap().state, TaskState::Paused);
        assert_eq!(h.registry.get(b.id).unwrap().state, TaskState::Paused);
        assert_eq!(h.registry.get(c.id).unwrap().state, TaskState::Queued);
        assert!(matches!(
            h.scheduler.enqueue(spec("d")),
            Err(AppError::EngineStopped)
        ));
    }
}
