// SPDX-License-Identifier: AGPL-3.0
// Ftper Core - On-disk locations
//
// Every persisted file lives in the per-user config directory.

use crate::types::AppError;
use std::fs;
use std::path::PathBuf;

/// Resolve (and create) the per-user config directory
pub fn config_dir() -> Result<PathBuf, AppError> {
    let config_dir = directories::ProjectDirs::from("org", "kexie", "ftper")
        .ok_or_else(|| AppError::FileIo("Could not determine config directory".to_string()))?
        .config_dir()
        .to_path_buf();

    fs::create_dir_all(&config_dir)
        .map_err(|e| AppError::FileIo(format!("Failed to create config dir: {}", e)))?;

    Ok(config_dir)
}

pub fn settings_path() -> Result<PathBuf, AppError> {
    Ok(config_dir()?.join("settings.json"))
}

pub fn profiles_path() -> Result<PathBuf, AppError> {
    Ok(config_dir()?.join("profiles.json"))
}

pub fn tasks_path() -> Result<PathBuf, AppError> {
    Ok(config_dir()?.join("tasks.json"))
}
