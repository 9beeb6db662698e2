//! Snapshot persistence for the store
//!
//! Writes all tables as one JSON document, atomically (temp file, fsync,
//! rename) with a SHA-256 sidecar that is validated before loading.

use super::{Store, Tables};
use crate::error::{EngineError, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use tracing::{debug, info};

impl Store {
    /// Persist all tables to `path`
    pub async fn save_snapshot(&self, path: &Path) -> Result<()> {
        let data = {
            let tables = self.tables.read().await;
            // Cleared under the read guard so writes racing the flush re-mark it
            self.dirty.store(false, Ordering::Release);
            serde_json::to_vec(&*tables).map_err(EngineError::persistence)?
        };

        if let Err(e) = write_atomic(path, &data) {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        let checksum = compute_checksum(&data);
        if let Err(e) = write_atomic(&checksum_path(path), checksum.as_bytes()) {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }

        debug!(path = %path.display(), bytes = data.len(), "Store snapshot written");
        Ok(())
    }

    /// Persist only if something changed since the last snapshot
    pub async fn flush(&self, path: &Path) -> Result<bool> {
        if !self.is_dirty() {
            return Ok(false);
        }
        self.save_snapshot(path).await?;
        Ok(true)
    }

    /// Load a store from a snapshot written by `save_snapshot`
    pub fn load_snapshot(path: &Path) -> Result<Store> {
        let data = fs::read(path)
            .map_err(|e| EngineError::Persistence(format!("failed to read {:?}: {}", path, e)))?;

        let expected = fs::read_to_string(checksum_path(path)).map_err(|e| {
            EngineError::Persistence(format!("missing snapshot checksum for {:?}: {}", path, e))
        })?;
        let computed = compute_checksum(&data);
        if computed != expected.trim() {
            return Err(EngineError::Persistence(format!(
                "checksum mismatch: expected {}, got {}",
                expected.trim(),
                computed
            )));
        }

        let tables: Tables = serde_json::from_slice(&data).map_err(EngineError::persistence)?;
        info!(
            path = %path.display(),
            models = tables.models.len(),
            jobs = tables.jobs.len(),
            "Loaded store snapshot"
        );
        Ok(Store::from_tables(tables))
    }
}

fn checksum_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".sha256");
    PathBuf::from(name)
}

/// Write to a temp file first, then rename over the target
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Persistence(format!("failed to create directory {:?}: {}", parent, e))
            })?;
        }
    }

    let temp_path = path.with_extension("tmp");
    let mut file = File::create(&temp_path).map_err(|e| {
        EngineError::Persistence(format!("failed to create temp file {:?}: {}", temp_path, e))
    })?;
    file.write_all(data).map_err(EngineError::persistence)?;
    file.sync_all().map_err(EngineError::persistence)?;

    fs::rename(&temp_path, path).map_err(|e| {
        EngineError::Persistence(format!("failed to rename {:?} to {:?}: {}", temp_path, path, e))
    })?;
    Ok(())
}

/// Compute SHA256 checksum of data
fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
