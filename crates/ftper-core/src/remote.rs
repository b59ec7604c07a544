// SPDX-License-Identifier: AGPL-3.0
// Ftper Core - Remote browsing
//
// One session against the active profile for looking around the server.
// Transfers open their own sessions and never share this one. A failed
// command drops the session so the next call connects afresh, and a change
// of active profile does the same.

use crate::events::EventBus;
use crate::profiles::{Profile, ProfileStore};
use crate::transport::{RemoteEntry, Transport, TransportSession};
use crate::types::{AppError, TransportError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Contents of one remote directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteListing {
    pub path: String,
    pub entries: Vec<RemoteEntry>,
}

impl RemoteListing {
    /// Full remote path of an entry in this directory
    pub fn path_of(&self, name: &str) -> String {
        resolve(&self.path, name)
    }
}

struct Connection {
    profile: Profile,
    session: Box<dyn TransportSession>,
    cwd: String,
}

pub struct RemoteBrowser {
    profiles: Arc<ProfileStore>,
    transport: Arc<dyn Transport>,
    events: Arc<EventBus>,
    connection: Mutex<Option<Connection>>,
}

impl RemoteBrowser {
    pub fn new(
        profiles: Arc<ProfileStore>,
        transport: Arc<dyn Transport>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            profiles,
            transport,
            events,
            connection: Mutex::new(None),
        }
    }

    /// List the current directory, or `path` after moving into it.
    /// Relative paths are taken from the current directory.
    pub async fn list(&self, path: Option<&str>) -> Result<RemoteListing, AppError> {
        let mut slot = self.connection.lock().await;
        let mut conn = self.connect(slot.take()).await?;

        let result = refresh(&mut conn, path).await;
        if let Err(e) = &result {
            let target = path.map_or_else(|| conn.cwd.clone(), |p| resolve(&conn.cwd, p));
            self.events.error(format!("Cannot open {}: {}", target, e));
        }
        self.settle(&mut slot, conn, &result).await;
        result.map_err(AppError::from)
    }

    /// Create a directory and return the refreshed listing
    pub async fn make_dir(&self, path: &str) -> Result<RemoteListing, AppError> {
        let mut slot = self.connection.lock().await;
        let mut conn = self.connect(slot.take()).await?;
        let target = resolve(&conn.cwd, path);

        let result = match conn.session.make_dir(&target).await {
            Ok(()) => refresh(&mut conn, None).await,
            Err(e) => Err(e),
        };
        match &result {
            Ok(_) => self.events.success(format!("Created {}", target)),
            Err(e) => self.events.error(format!("Cannot create {}: {}", target, e)),
        }
        self.settle(&mut slot, conn, &result).await;
        result.map_err(AppError::from)
    }

    /// Delete a file and return the refreshed listing
    pub async fn delete(&self, path: &str) -> Result<RemoteListing, AppError> {
        let mut slot = self.connection.lock().await;
        let mut conn = self.connect(slot.take()).await?;
        let target = resolve(&conn.cwd, path);

        let result = match conn.session.delete(&target).await {
            Ok(()) => refresh(&mut conn, None).await,
            Err(e) => Err(e),
        };
        match &result {
            Ok(_) => self.events.success(format!("Deleted {}", target)),
            Err(e) => self.events.error(format!("Cannot delete {}: {}", target, e)),
        }
        self.settle(&mut slot, conn, &result).await;
        result.map_err(AppError::from)
    }

    /// Close the browsing session, if any
    pub async fn disconnect(&self) {
        if let Some(mut conn) = self.connection.lock().await.take() {
            conn.session.close().await;
        }
    }

    /// Reuse `current` when it belongs to the active profile, otherwise log in again
    async fn connect(&self, current: Option<Connection>) -> Result<Connection, AppError> {
        let Some(profile) = self.profiles.active() else {
            if let Some(mut old) = current {
                old.session.close().await;
            }
            self.events.error(AppError::NoActiveProfile.to_string());
            return Err(AppError::NoActiveProfile);
        };

        if let Some(conn) = current {
            // an edited profile may point somewhere else now
            if conn.profile.id == profile.id && conn.profile.updated_at == profile.updated_at {
                return Ok(conn);
            }
            let mut old = conn;
            old.session.close().await;
        }

        tracing::info!("Browsing {}", profile.label());
        let opened = match self.transport.open(&profile).await {
            Ok(mut session) => match session.working_dir().await {
                Ok(cwd) => Ok((session, cwd)),
                Err(e) => {
                    session.close().await;
                    Err(e)
                }
            },
            Err(e) => Err(e),
        };

        match opened {
            Ok((session, cwd)) => {
                self.events.success(format!("Connected to {}", profile.label()));
                Ok(Connection {
                    profile,
                    session,
                    cwd,
                })
            }
            Err(e) => {
                tracing::warn!("Cannot browse {}: {}", profile.label(), e);
                self.events
                    .error(format!("Cannot connect to {}: {}", profile.label(), e));
                Err(e.into())
            }
        }
    }

    /// Keep the session after a success; drop it after a failure
    async fn settle<T>(
        &self,
        slot: &mut Option<Connection>,
        mut conn: Connection,
        result: &Result<T, TransportError>,
    ) {
        match result {
            Ok(_) => *slot = Some(conn),
            Err(e) => {
                tracing::debug!("Dropping browsing session after error: {}", e);
                conn.session.close().await;
            }
        }
    }
}

/// Move into `path` when given, then list where we are
async fn refresh(conn: &mut Connection, path: Option<&str>) -> Result<RemoteListing, TransportError> {
    if let Some(path) = path {
        let target = resolve(&conn.cwd, path);
        conn.cwd = conn.session.change_dir(&target).await?;
    }
    let entries = conn.session.list(&conn.cwd).await?;
    Ok(RemoteListing {
        path: conn.cwd.clone(),
        entries,
    })
}

/// Absolute form of `path` seen from `cwd`, with `.` and `..` folded away
fn resolve(cwd: &str, path: &str) -> String {
    let mut parts: Vec<&str> = if path.starts_with('/') {
        Vec::new()
    } else {
        cwd.split('/').filter(|p| !p.is_empty()).collect()
    };

    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }
    format!("/{}", parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Channel;
    use crate::profiles::ProfileDraft;
    use crate::transport::testing::MockTransport;

    fn browser() -> (RemoteBrowser, MockTransport, Arc<ProfileStore>, Arc<EventBus>) {
        let profiles = Arc::new(ProfileStore::in_memory());
        let profile = profiles
            .add(ProfileDraft::new("ftp.example.com", 21, "me", "pw").with_display_name("Home"))
            .unwrap();
        profiles.set_active(&profile.id).unwrap();

        let transport = MockTransport::new(true);
        transport.remote_dir("/", &[("readme.txt", 12)]);
        transport.remote_dir("/pub", &[("a.iso", 700), ("b.iso", 800)]);

        let events = Arc::new(EventBus::new(16));
        let browser = RemoteBrowser::new(
            profiles.clone(),
            Arc::new(transport.clone()),
            events.clone(),
        );
        (browser, transport, profiles, events)
    }

    #[test]
    fn test_resolve() {
        assert_eq!(resolve("/", "pub"), "/pub");
        assert_eq!(resolve("/pub", "a.iso"), "/pub/a.iso");
        assert_eq!(resolve("/pub/x", ".."), "/pub");
        assert_eq!(resolve("/pub", "/etc/./motd"), "/etc/motd");
        assert_eq!(resolve("/", ".."), "/");
    }

    #[tokio::test]
    async fn test_list_and_change_dir() {
        let (browser, transport, _profiles, events) = browser();
        let mut success = events.subscribe(Channel::Success);

        let root = browser.list(None).await.unwrap();
        assert_eq!(root.path, "/");
        assert_eq!(root.entries[0].name, "readme.txt");
        assert_eq!(success.recv().await.unwrap(), "Connected to Home");

        let public = browser.list(Some("pub")).await.unwrap();
        assert_eq!(public.path, "/pub");
        assert_eq!(public.entries.len(), 2);
        assert_eq!(public.path_of("a.iso"), "/pub/a.iso");

        // relative to where we are now
        let back = browser.list(Some("..")).await.unwrap();
        assert_eq!(back.path, "/");
        assert_eq!(transport.opened(), 1);
    }

    #[tokio::test]
    async fn test_make_dir_and_delete_publish_outcomes() {
        let (browser, _transport, _profiles, events) = browser();
        let mut success = events.subscribe(Channel::Success);
        let mut errors = events.subscribe(Channel::Error);

        browser.list(Some("/pub")).await.unwrap();
        assert_eq!(success.recv().await.unwrap(), "Connected to Home");

        let listing = browser.make_dir("new").await.unwrap();
        assert!(listing.entries.iter().any(|e| e.name == "new" && e.is_dir()));
        assert_eq!(success.recv().await.unwrap(), "Created /pub/new");

        let listing = browser.delete("a.iso").await.unwrap();
        assert_eq!(listing.entries.len(), 2);
        assert_eq!(success.recv().await.unwrap(), "Deleted /pub/a.iso");

        assert!(browser.delete("a.iso").await.is_err());
        assert_eq!(
            errors.recv().await.unwrap(),
            "Cannot delete /pub/a.iso: DELE failed: 550 no such file"
        );
    }

    #[tokio::test]
    async fn test_failure_drops_session() {
        let (browser, transport, _profiles, events) = browser();
        let mut errors = events.subscribe(Channel::Error);

        browser.list(None).await.unwrap();
        assert!(browser.list(Some("/missing")).await.is_err());
        assert!(errors.recv().await.unwrap().starts_with("Cannot open /missing"));

        // the next call logs in again and starts from the home directory
        let listing = browser.list(None).await.unwrap();
        assert_eq!(listing.path, "/");
        assert_eq!(transport.opened(), 2);
    }

    #[tokio::test]
    async fn test_switching_profile_reconnects() {
        let (browser, transport, profiles, _events) = browser();
        browser.list(Some("/pub")).await.unwrap();

        let other = profiles
            .add(ProfileDraft::new("mirror.example.com", 21, "me", "pw"))
            .unwrap();
        profiles.set_active(&other.id).unwrap();

        let listing = browser.list(None).await.unwrap();
        assert_eq!(listing.path, "/");
        assert_eq!(transport.opened(), 2);
    }

    #[tokio::test]
    async fn test_no_active_profile() {
        let (browser, _transport, profiles, _events) = browser();
        profiles.clear_active().unwrap();
        assert!(matches!(
            browser.list(None).await,
            Err(AppError::NoActiveProfile)
        ));
    }

    #[tokio::test]
    async fn test_refused_connection_is_reported() {
        let (browser, transport, _profiles, events) = browser();
        let mut errors = events.subscribe(Channel::Error);
        transport.refuse_connections("login failed: 530 Login incorrect");

        let err = browser.list(None).await.unwrap_err();
        assert_eq!(err.to_string(), "login failed: 530 Login incorrect");
        assert_eq!(
            errors.recv().await.unwrap(),
            "Cannot connect to Home: login failed: 530 Login incorrect"
        );
    }
}
