// SPDX-License-Identifier: AGPL-3.0
// Ftper Core - Transfer task engine shared by all frontends
//
// This crate provides:
// - AppSettings, AppError and TransportError types
// - SettingsStore and ProfileStore for persistent configuration
// - TaskRegistry, the single-writer table of transfer tasks
// - Scheduler, which runs a bounded number of transfers at once
// - RemoteBrowser for listing and editing the server's directories
// - EventBus and SubscriptionScope for UI notifications
// - TransferEngine and EngineBridge, the handles frontends hold
//
// Frontend-specific code lives in separate crates.

pub mod bridge;
pub mod engine;
pub mod events;
pub mod paths;
pub mod profiles;
pub mod registry;
pub mod remote;
pub mod scheduler;
pub mod settings;
pub mod store;
pub mod subscription;
pub mod task;
pub mod transport;
pub mod types;

// Re-export commonly used items
pub use bridge::{EngineBridge, EngineCommand};
pub use engine::TransferEngine;
pub use events::{Channel, EventBus};
pub use profiles::{Profile, ProfileDraft, ProfileStore};
pub use registry::TaskRegistry;
pub use remote::{RemoteBrowser, RemoteListing};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use settings::SettingsStore;
pub use store::TaskStore;
pub use subscription::{Subscription, SubscriptionScope};
pub use task::{Direction, FileItem, Task, TaskEvent, TaskId, TaskSpec, TaskState};
pub use transport::ftp::{FtpConfig, FtpTransport};
pub use transport::{
    EntryKind, RemoteEntry, TransferJob, TransferProgress, Transport, TransportSession,
};
pub use types::{AppError, AppSettings, TransportError};
