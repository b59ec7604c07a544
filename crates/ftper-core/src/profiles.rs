// SPDX-License-Identifier: AGPL-3.0
// Ftper Core - FTP profile storage
//
// Profiles and the active selection are stored in a local JSON file.

use crate::paths;
use crate::types::AppError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A saved FTP server connection
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credential_secret: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Derived from the store's active selection, never stored per profile
    #[serde(skip)]
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
}

impl Profile {
    /// Display name, or the host when none was given
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.host)
    }
}

impl fmt::Debug for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Profile")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("credential_secret", &"<redacted>")
            .field("display_name", &self.display_name)
            .field("is_active", &self.is_active)
            .finish()
    }
}

/// User input for creating or editing a profile
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileDraft {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credential_secret: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl ProfileDraft {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        credential_secret: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            credential_secret: credential_secret.into(),
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    fn validate(&self) -> Result<(), AppError> {
        let host = self.host.trim();
        if host.is_empty() {
            return Err(AppError::InvalidProfile("host must not be empty".to_string()));
        }
        // bracketed IPv6 literals carry colons of their own
        if !host.starts_with('[') && host.matches(':').count() == 1 {
            return Err(AppError::InvalidProfile(
                "host must not include a port".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(AppError::InvalidProfile(
                "port must be between 1 and 65535".to_string(),
            ));
        }
        Ok(())
    }

    fn into_profile(self, id: String) -> Profile {
        let display_name = self
            .display_name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());

        Profile {
            id,
            host: self.host.trim().to_string(),
            port: self.port,
            username: self.username,
            credential_secret: self.credential_secret,
            display_name,
            is_active: false,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfilesFile {
    #[serde(default)]
    active_id: Option<String>,
    #[serde(default)]
    profiles: Vec<Profile>,
}

/// File-based profile store with a single active selection
pub struct ProfileStore {
    state: RwLock<ProfilesFile>,
    file_path: Option<PathBuf>,
}

impl ProfileStore {
    /// Open the profiles file in the per-user config directory
    pub fn new() -> Result<Self, AppError> {
        Self::open(paths::profiles_path()?)
    }

    /// Create a store backed by `file_path`, loading it if present
    pub fn open(file_path: impl Into<PathBuf>) -> Result<Self, AppError> {
        let file_path = file_path.into();

        let state = if file_path.exists() {
            let content = fs::read_to_string(&file_path)
                .map_err(|e| AppError::FileIo(format!("Failed to read profiles: {}", e)))?;

            let mut file: ProfilesFile = serde_json::from_str(&content)
                .map_err(|e| AppError::Serialization(format!("Failed to parse profiles: {}", e)))?;

            // a dangling selection is no selection
            if let Some(active) = &file.active_id {
                if !file.profiles.iter().any(|p| &p.id == active) {
                    tracing::warn!("Active profile {} no longer exists", active);
                    file.active_id = None;
                }
            }
            file
        } else {
            ProfilesFile::default()
        };

        Ok(Self {
            state: RwLock::new(state),
            file_path: Some(file_path),
        })
    }

    /// A store that never touches the disk
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(ProfilesFile::default()),
            file_path: None,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, ProfilesFile> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ProfilesFile> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persist profiles to disk
    fn persist(&self, state: &ProfilesFile) -> Result<(), AppError> {
        let Some(file_path) = &self.file_path else {
            return Ok(());
        };

        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| AppError::FileIo(format!("Failed to create config dir: {}", e)))?;
        }

        let content = serde_json::to_string_pretty(state)
            .map_err(|e| AppError::Serialization(format!("Failed to serialize profiles: {}", e)))?;

        fs::write(file_path, content)
            .map_err(|e| AppError::FileIo(format!("Failed to write profiles: {}", e)))?;

        Ok(())
    }

    /// Apply `change` to a copy of the state, write the copy, then make it
    /// current. A failed write leaves memory as it was.
    fn commit<T>(
        &self,
        change: impl FnOnce(&mut ProfilesFile) -> Result<T, AppError>,
    ) -> Result<T, AppError> {
        let mut state = self.write();
        let mut next = state.clone();
        let out = change(&mut next)?;
        self.persist(&next)?;
        *state = next;
        Ok(out)
    }

    fn with_active_flag(state: &ProfilesFile, profile: &Profile) -> Profile {
        let mut profile = profile.clone();
        profile.is_active = state.active_id.as_deref() == Some(profile.id.as_str());
        profile
    }

    pub fn list(&self) -> Vec<Profile> {
        let state = self.read();
        state
            .profiles
            .iter()
            .map(|p| Self::with_active_flag(&state, p))
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Profile> {
        let state = self.read();
        state
            .profiles
            .iter()
            .find(|p| p.id == id)
            .map(|p| Self::with_active_flag(&state, p))
    }

    pub fn add(&self, draft: ProfileDraft) -> Result<Profile, AppError> {
        draft.validate()?;
        let profile = draft.into_profile(uuid::Uuid::new_v4().to_string());

        self.commit(|state| {
            state.profiles.push(profile.clone());
            Ok(())
        })?;

        tracing::info!("Added profile {} ({})", profile.id, profile.label());
        Ok(profile)
    }

    pub fn update(&self, id: &str, draft: ProfileDraft) -> Result<Profile, AppError> {
        draft.validate()?;

        let updated = self.commit(|state| {
            let index = state
                .profiles
                .iter()
                .position(|p| p.id == id)
                .ok_or_else(|| AppError::ProfileNotFound(id.to_string()))?;

            state.profiles[index] = draft.into_profile(id.to_string());
            Ok(Self::with_active_flag(state, &state.profiles[index]))
        })?;

        tracing::info!("Updated profile {} ({})", updated.id, updated.label());
        Ok(updated)
    }

    /// Delete a profile; deleting the active one leaves nothing active
    pub fn delete(&self, id: &str) -> Result<(), AppError> {
        self.commit(|state| {
            let original_len = state.profiles.len();
            state.profiles.retain(|p| p.id != id);

            if state.profiles.len() == original_len {
                return Err(AppError::ProfileNotFound(id.to_string()));
            }
            if state.active_id.as_deref() == Some(id) {
                tracing::info!("Deleted the active profile, no profile is active now");
                state.active_id = None;
            }
            Ok(())
        })
    }

    /// Make `id` the one active profile
    pub fn set_active(&self, id: &str) -> Result<Profile, AppError> {
        let mut profile = self.commit(|state| {
            let profile = state
                .profiles
                .iter()
                .find(|p| p.id == id)
                .cloned()
                .ok_or_else(|| AppError::ProfileNotFound(id.to_string()))?;
            state.active_id = Some(id.to_string());
            Ok(profile)
        })?;

        profile.is_active = true;
        tracing::info!("Active profile is now {} ({})", profile.id, profile.label());
        Ok(profile)
    }

    pub fn clear_active(&self) -> Result<(), AppError> {
        self.commit(|state| {
            state.active_id = None;
            Ok(())
        })
    }

    /// Copy of the active profile, if any
    pub fn active(&self) -> Option<Profile> {
        let state = self.read();
        let id = state.active_id.as_deref()?;
        state
            .profiles
            .iter()
            .find(|p| p.id == id)
            .map(|p| Self::with_active_flag(&state, p))
    }
}
