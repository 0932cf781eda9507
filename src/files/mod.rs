//! File Module - File entity lifecycle
//!
//! The registry owns file rows and delegates every byte of quota
//! movement to the quota manager: reserve before persisting, release
//! after deleting. A reservation left without a file row would
//! permanently overcharge the account, so persistence failures are
//! compensated with a matching release.

use crate::quota::{QuotaError, QuotaManager};
use crate::store::{FileStore, StoreError};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

/// An uploaded file charged against its owner's quota
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// Unique file id (generated, or caller-supplied at creation)
    pub id: String,

    /// Original file name
    pub name: String,

    /// Public URL
    pub url: String,

    /// Optional shortened URL
    pub short_url: Option<String>,

    /// Content type hint
    pub kind: Option<String>,

    /// Size in bytes, fixed at creation
    pub size: i64,

    /// Owning account id
    pub owner_id: String,

    /// Creation timestamp (unix seconds), the listing order key
    pub created_at: i64,
}

/// Parameters for a file creation.
#[derive(Debug, Clone, Default)]
pub struct NewFile {
    /// Caller-supplied id; generated when absent.
    pub id: Option<String>,
    pub name: String,
    pub url: String,
    pub size: i64,
    pub short_url: Option<String>,
    pub kind: Option<String>,
}

#[derive(Error, Debug)]
pub enum FileError {
    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("duplicate file id: {0}")]
    DuplicateId(String),

    #[error("invalid file size: {0}")]
    InvalidSize(i64),

    #[error(transparent)]
    Quota(#[from] QuotaError),

    /// A reservation could not be reversed after a downstream failure.
    /// The account is overcharged by `amount` bytes until reconciled
    /// out of band.
    #[error("quota compensation failed for account {account_id} ({amount} bytes): {source}")]
    CompensationFailed {
        account_id: String,
        amount: i64,
        #[source]
        source: QuotaError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Owns file rows and the reserve/release protocol around them.
#[derive(Clone)]
pub struct FileRegistry {
    files: Arc<dyn FileStore>,
    quota: QuotaManager,
}

impl FileRegistry {
    pub fn new(files: Arc<dyn FileStore>, quota: QuotaManager) -> Self {
        Self { files, quota }
    }

    /// Create a file for the account, charging its size against the
    /// owner's quota first. Zero-byte files are legal; negative sizes
    /// are rejected.
    pub async fn create(&self, account_id: &str, new_file: NewFile) -> Result<FileRecord, FileError> {
        if new_file.size < 0 {
            return Err(FileError::InvalidSize(new_file.size));
        }

        let id = match &new_file.id {
            Some(id) => {
                if self.files.get(id).await?.is_some() {
                    return Err(FileError::DuplicateId(id.clone()));
                }
                id.clone()
            }
            None => Uuid::new_v4().simple().to_string(),
        };

        self.quota.reserve(account_id, new_file.size).await?;

        let record = FileRecord {
            id,
            name: new_file.name,
            url: new_file.url,
            short_url: new_file.short_url,
            kind: new_file.kind,
            size: new_file.size,
            owner_id: account_id.to_string(),
            created_at: chrono::Utc::now().timestamp(),
        };

        match self.files.insert_new(record.clone()).await {
            Ok(true) => Ok(record),
            Ok(false) => {
                // Lost a duplicate-id race after the pre-check.
                self.compensate(account_id, record.size).await?;
                Err(FileError::DuplicateId(record.id))
            }
            Err(store_err) => {
                self.compensate(account_id, record.size).await?;
                Err(FileError::Store(store_err))
            }
        }
    }

    /// Delete a file and return its size to the owner's quota. Scoped
    /// to the calling account: a file owned by someone else reports
    /// `FileNotFound` rather than crediting the wrong account.
    pub async fn delete(&self, account_id: &str, file_id: &str) -> Result<FileRecord, FileError> {
        let file = self
            .files
            .get(file_id)
            .await?
            .ok_or_else(|| FileError::FileNotFound(file_id.to_string()))?;
        if file.owner_id != account_id {
            return Err(FileError::FileNotFound(file_id.to_string()));
        }

        let removed = self
            .files
            .delete(file_id)
            .await?
            .ok_or_else(|| FileError::FileNotFound(file_id.to_string()))?;

        match self.quota.release(account_id, removed.size).await {
            Ok(_) => Ok(removed),
            Err(source) => {
                error!(
                    account_id,
                    file_id,
                    amount = removed.size,
                    %source,
                    "file deleted but quota release failed, account stays overcharged"
                );
                Err(FileError::CompensationFailed {
                    account_id: account_id.to_string(),
                    amount: removed.size,
                    source,
                })
            }
        }
    }

    pub async fn get(&self, file_id: &str) -> Result<FileRecord, FileError> {
        self.files
            .get(file_id)
            .await?
            .ok_or_else(|| FileError::FileNotFound(file_id.to_string()))
    }

    /// Most recent files, newest first.
    pub async fn list_recent(&self, account_id: &str, limit: usize) -> Result<Vec<FileRecord>, FileError> {
        Ok(self.files.list_for_owner(account_id, Some(limit)).await?)
    }

    /// All files for the account, newest first.
    pub async fn list_all(&self, account_id: &str) -> Result<Vec<FileRecord>, FileError> {
        Ok(self.files.list_for_owner(account_id, None).await?)
    }

    pub async fn count(&self, account_id: &str) -> Result<u64, FileError> {
        Ok(self.files.count_for_owner(account_id).await?)
    }

    async fn compensate(&self, account_id: &str, amount: i64) -> Result<(), FileError> {
        if let Err(source) = self.quota.release(account_id, amount).await {
            error!(
                account_id,
                amount,
                %source,
                "reservation compensation failed, account stays overcharged"
            );
            return Err(FileError::CompensationFailed {
                account_id: account_id.to_string(),
                amount,
                source,
            });
        }
        Ok(())
    }
}
