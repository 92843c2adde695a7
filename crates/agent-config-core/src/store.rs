// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sled-backed persistence for configuration versions.
//!
//! Each feature gets its own tree (`config_versions/<element_type>`) holding
//! JSON-encoded [`ConfigVersion`] records keyed by the big-endian version
//! number, so sled's key order is version order.
//!
//! The store handle is constructed explicitly and passed to the version
//! manager; there is no process-wide database.

use std::fs;
use std::path::{Path, PathBuf};

use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Config as SledConfig, Db, IVec, Tree};
use thiserror::Error;

use crate::history::{ConfigVersion, DeployStatus};

/// Prefix of the per-feature version trees.
const VERSIONS_TREE_PREFIX: &str = "config_versions/";

/// Errors emitted by the [`Store`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupted record: {0}")]
    Corrupted(String),
}

/// Handle to the version database.
#[derive(Debug, Clone)]
pub struct Store {
    db: Db,
    path: PathBuf,
}

impl Store {
    /// Opens (or creates) a store at the provided path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                // sled does not create intermediate directories automatically.
                fs::create_dir_all(parent)?;
            }
        }
        let db = SledConfig::new()
            .path(&path)
            .cache_capacity(16 * 1024 * 1024)
            .open()?;
        Ok(Self { db, path })
    }

    /// Opens an in-memory store (ephemeral across restarts).
    pub fn open_ephemeral() -> Result<Self, StoreError> {
        let db = SledConfig::new().temporary(true).open()?;
        Ok(Self {
            db,
            path: PathBuf::new(),
        })
    }

    /// Returns the filesystem path backing the store.
    ///
    /// Ephemeral stores return an empty path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn versions(&self, element_type: &str) -> Result<Tree, StoreError> {
        Ok(self
            .db
            .open_tree(format!("{VERSIONS_TREE_PREFIX}{element_type}"))?)
    }

    /// Newest version of `element_type`, if any.
    pub fn latest_version(&self, element_type: &str) -> Result<Option<ConfigVersion>, StoreError> {
        match self.versions(element_type)?.last()? {
            Some((key, value)) => decode(&key, &value).map(Some),
            None => Ok(None),
        }
    }

    /// All versions of `element_type`, newest first.
    pub fn list_versions(&self, element_type: &str) -> Result<Vec<ConfigVersion>, StoreError> {
        self.versions(element_type)?
            .iter()
            .rev()
            .map(|entry| {
                let (key, value) = entry?;
                decode(&key, &value)
            })
            .collect()
    }

    /// A single version of `element_type`, looked up by key.
    pub fn get_version(
        &self,
        element_type: &str,
        version: u64,
    ) -> Result<Option<ConfigVersion>, StoreError> {
        match self.versions(element_type)?.get(version.to_be_bytes())? {
            Some(value) => decode(&version.to_be_bytes(), &value).map(Some),
            None => Ok(None),
        }
    }

    /// Inserts `record` and, in the same transaction, demotes `previous` to
    /// [`DeployStatus::Unknown`] when it is still Initiated.
    ///
    /// The write is flushed before returning.
    pub fn append_version(
        &self,
        previous: Option<u64>,
        record: &ConfigVersion,
    ) -> Result<(), StoreError> {
        let tree = self.versions(&record.element_type)?;
        let encoded = serde_json::to_vec(record)?;
        let result = tree.transaction(|tx| {
            if let Some(prev) = previous {
                if let Some(bytes) = tx.get(prev.to_be_bytes())? {
                    let mut prior: ConfigVersion = serde_json::from_slice(&bytes)
                        .map_err(|err| ConflictableTransactionError::Abort(StoreError::from(err)))?;
                    if prior.deploy_status == DeployStatus::Initiated {
                        prior.deploy_status = DeployStatus::Unknown;
                        let bytes = serde_json::to_vec(&prior).map_err(|err| {
                            ConflictableTransactionError::Abort(StoreError::from(err))
                        })?;
                        tx.insert(prev.to_be_bytes().as_slice(), bytes)?;
                    }
                }
            }
            tx.insert(record.version.to_be_bytes().as_slice(), encoded.as_slice())?;
            Ok(())
        });
        match result {
            Ok(()) => {}
            Err(TransactionError::Abort(err)) => return Err(err),
            Err(TransactionError::Storage(err)) => return Err(StoreError::Db(err)),
        }
        tree.flush()?;
        Ok(())
    }

    /// Overwrites an existing record (status changes only).
    pub fn update_version(&self, record: &ConfigVersion) -> Result<(), StoreError> {
        let tree = self.versions(&record.element_type)?;
        tree.insert(record.version.to_be_bytes(), serde_json::to_vec(record)?)?;
        tree.flush()?;
        Ok(())
    }
}

fn decode(key: &[u8], value: &IVec) -> Result<ConfigVersion, StoreError> {
    let key: [u8; 8] = key
        .try_into()
        .map_err(|_| StoreError::Corrupted(format!("version key of {} bytes", key.len())))?;
    let record: ConfigVersion = serde_json::from_slice(value)?;
    if record.version != u64::from_be_bytes(key) {
        return Err(StoreError::Corrupted(format!(
            "record for version {} stored under key {}",
            record.version,
            u64::from_be_bytes(key)
        )));
    }
    Ok(record)
}
