// SPDX-License-Identifier: AGPL-3.0
// Ftper CLI - Headless frontend
//
// Profile commands edit the stores directly. Browsing commands talk to the
// active profile's server without touching the queue. Transfer commands
// start the engine, stay attached while the queue drains, and pause whatever
// is still running on Ctrl-C.

use clap::{Parser, Subcommand};
use ftper_core::{
    AppError, Channel, EngineBridge, EntryKind, EventBus, FileItem, FtpTransport, ProfileDraft,
    ProfileStore, RemoteBrowser, RemoteEntry, RemoteListing, SettingsStore, Task, TaskId,
    TaskState, TaskStore,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "ftper", version, about = "Ftper - queued FTP transfers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List saved profiles
    Profiles,
    /// Save a server profile; the first one becomes active
    ProfileAdd {
        name: String,
        host: String,
        #[arg(default_value_t = 21)]
        port: u16,
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        password: String,
    },
    /// Make a profile active
    ProfileUse { id: String },
    /// Delete a profile
    #[command(name = "profile-rm")]
    ProfileRemove { id: String },

    /// List a remote directory, the home directory by default
    Ls { path: Option<String> },
    /// Create a remote directory
    Mkdir { path: String },
    /// Delete a remote file
    RmRemote { path: String },

    /// Upload files into the default remote directory
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Download a remote file
    Download {
        remote: String,
        /// Where to save it, the download directory by default
        local: Option<PathBuf>,
    },
    /// List saved tasks
    Tasks,
    /// Requeue a paused or failed task
    Resume { id: TaskId },
    /// Remove a task
    Remove { id: TaskId },
    /// Process the queue until it is empty
    Run,
}

fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ftper_cli=info".parse().unwrap())
                .add_directive("ftper_core=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    tracing::debug!("Starting Ftper CLI v{}", env!("CARGO_PKG_VERSION"));

    match execute(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn execute(command: Commands) -> Result<(), AppError> {
    match command {
        Commands::Profiles => {
            let store = ProfileStore::new()?;
            let profiles = store.list();
            if profiles.is_empty() {
                println!("No profiles. Add one with profile-add.");
            }
            for p in profiles {
                println!(
                    "{} {}  {}@{}:{}  ({})",
                    if p.is_active { "*" } else { " " },
                    p.id,
                    p.username,
                    p.host,
                    p.port,
                    p.label()
                );
            }
            Ok(())
        }
        Commands::ProfileAdd {
            name,
            host,
            port,
            user,
            password,
        } => {
            let store = ProfileStore::new()?;
            let first = store.list().is_empty();
            let profile =
                store.add(ProfileDraft::new(host, port, user, password).with_display_name(name))?;
            // the first profile is the obvious choice
            if first {
                store.set_active(&profile.id)?;
            }
            println!("Added {} ({})", profile.label(), profile.id);
            Ok(())
        }
        Commands::ProfileUse { id } => {
            let profile = ProfileStore::new()?.set_active(&id)?;
            println!("Using {}", profile.label());
            Ok(())
        }
        Commands::ProfileRemove { id } => {
            ProfileStore::new()?.delete(&id)?;
            println!("Deleted {}", id);
            Ok(())
        }
        Commands::Ls { path } => browsing(|browser| async move {
            browser.list(path.as_deref()).await
        }),
        Commands::Mkdir { path } => browsing(|browser| async move {
            browser.make_dir(&path).await
        }),
        Commands::RmRemote { path } => browsing(|browser| async move {
            browser.delete(&path).await
        }),
        Commands::Tasks => {
            let snapshot = TaskStore::new()?.load()?;
            if snapshot.tasks.is_empty() {
                println!("No tasks.");
            }
            for task in &snapshot.tasks {
                println!("{}", describe(task));
            }
            Ok(())
        }
        Commands::Upload { files } => attached(|bridge| {
            for path in files {
                let item = FileItem::from_path(&path)
                    .filter(|_| path.is_file())
                    .ok_or_else(|| {
                        AppError::InvalidTask(format!("not a file: {}", path.display()))
                    })?;
                let task = bridge.select_file(item)?;
                println!("Queued #{} {}", task.id, task.remote_path);
            }
            Ok(())
        }),
        Commands::Download { remote, local } => attached(|bridge| {
            let task = bridge.download(&remote, local)?;
            println!("Queued #{} {}", task.id, task.source_path);
            Ok(())
        }),
        Commands::Resume { id } => attached(|bridge| {
            bridge.start(id)?;
            Ok(())
        }),
        Commands::Remove { id } => attached(|bridge| {
            bridge.remove(id)?;
            println!("Removed #{}", id);
            Ok(())
        }),
        Commands::Run => attached(|_| Ok(())),
    }
}

/// Run one browsing command against the active profile and print the
/// directory it leaves us in. Queued transfers are left alone.
fn browsing<F, Fut>(action: F) -> Result<(), AppError>
where
    F: FnOnce(Arc<RemoteBrowser>) -> Fut,
    Fut: std::future::Future<Output = Result<RemoteListing, AppError>>,
{
    let settings = SettingsStore::new()?.get();
    let profiles = Arc::new(ProfileStore::new()?);
    let transport = Arc::new(FtpTransport::new(settings.to_ftp_config()));
    let events = Arc::new(EventBus::default());
    let mut success = events.subscribe(Channel::Success);
    let browser = Arc::new(RemoteBrowser::new(profiles, transport, events));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| AppError::Runtime(format!("Failed to create Tokio runtime: {}", e)))?;

    let result = runtime.block_on(async {
        let result = action(browser.clone()).await;
        browser.disconnect().await;
        result
    });

    while let Ok(message) = success.try_recv() {
        println!("{}", message);
    }
    let listing = result?;
    println!("{}", listing.path);
    for entry in &listing.entries {
        println!("{}", describe_entry(&listing, entry));
    }
    Ok(())
}

fn describe_entry(listing: &RemoteListing, entry: &RemoteEntry) -> String {
    let marker = match entry.kind {
        EntryKind::Directory => "d",
        EntryKind::Link => "l",
        EntryKind::File => "-",
        EntryKind::Other => "?",
    };
    format!(
        "{} {:>12}  {:<12}  {}",
        marker,
        entry.size,
        entry.modified.as_deref().unwrap_or(""),
        listing.path_of(&entry.name)
    )
}

/// Start the engine, run `action`, then report progress until the queue drains
fn attached(action: impl FnOnce(&EngineBridge) -> Result<(), AppError>) -> Result<(), AppError> {
    let bridge = EngineBridge::new()?;
    let scope = bridge.subscription_scope();

    scope.on_message(bridge.events().subscribe(Channel::Error), |m| {
        eprintln!("error: {}", m)
    });
    scope.on_message(bridge.events().subscribe(Channel::Success), |m| {
        println!("{}", m)
    });
    scope.on_message(bridge.events().subscribe(Channel::Info), |m| println!("{}", m));

    let mut shown: HashMap<TaskId, (TaskState, u64)> = HashMap::new();
    scope.on_snapshot(bridge.subscribe_tasks(), move |tasks| {
        for task in tasks {
            let decile = task.progress().map(|p| (p * 10.0) as u64).unwrap_or(0);
            let key = (task.state, decile);
            if shown.get(&task.id) != Some(&key) {
                shown.insert(task.id, key);
                if task.state == TaskState::Running {
                    println!("{}", describe(task));
                }
            }
        }
    });

    let result = action(&bridge);

    if result.is_ok() {
        let engine = bridge.engine().clone();
        bridge.block_on(async move {
            tokio::select! {
                _ = engine.wait_until_idle() => {}
                _ = tokio::signal::ctrl_c() => {
                    println!("Interrupted, pausing transfers");
                }
            }
        });
    }

    scope.close();
    bridge.shutdown()?;
    result
}

fn describe(task: &Task) -> String {
    let size = match task.bytes_total {
        Some(total) => format!("{}/{} bytes", task.bytes_transferred, total),
        None => format!("{} bytes", task.bytes_transferred),
    };
    let mut line = format!(
        "#{:<4} {:<9} {:?} {} -> {}  {}",
        task.id,
        task.state.label(),
        task.direction,
        task.source_path,
        task.remote_path,
        size
    );
    if let Some(error) = &task.last_error {
        line.push_str(&format!("  ({})", error));
    }
    line
}
