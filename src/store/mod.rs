//! Entity Store - Durable storage boundary for accounts and files
//!
//! Every mutation of `used_storage` goes through the atomic primitives
//! defined here (`reserve_storage`, `release_storage`). Callers never
//! read-modify-write the counter themselves; that would lose updates
//! under concurrent requests.

mod memory;
mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

use crate::account::{Account, PlanTier};
use crate::files::FileRecord;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("record serialization failed: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Partial account update, merged atomically in a single store write.
/// `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct AccountPatch {
    pub api_key: Option<String>,
    pub plan: Option<PlanTier>,
    pub total_storage: Option<i64>,
    pub customer_id: Option<u64>,
    pub subscription_id: Option<u64>,
    pub preferred_region: Option<String>,
    pub embed_header: Option<String>,
    pub embed_footer: Option<String>,
    pub embed_color: Option<String>,
}

impl AccountPatch {
    pub fn apply(&self, account: &mut Account) {
        if let Some(api_key) = &self.api_key {
            account.api_key = api_key.clone();
        }
        if let Some(plan) = self.plan {
            account.plan = plan;
        }
        if let Some(total_storage) = self.total_storage {
            account.total_storage = total_storage;
        }
        if let Some(customer_id) = self.customer_id {
            account.customer_id = customer_id;
        }
        if let Some(subscription_id) = self.subscription_id {
            account.subscription_id = subscription_id;
        }
        if let Some(region) = &self.preferred_region {
            account.preferred_region = Some(region.clone());
        }
        if let Some(header) = &self.embed_header {
            account.embed_header = Some(header.clone());
        }
        if let Some(footer) = &self.embed_footer {
            account.embed_footer = Some(footer.clone());
        }
        if let Some(color) = &self.embed_color {
            account.embed_color = Some(color.clone());
        }
    }
}

/// Result of an atomic conditional reservation.
#[derive(Debug, Clone)]
pub enum ReserveOutcome {
    /// Increment applied; the updated account.
    Reserved(Account),
    /// Ceiling would be exceeded; counters unchanged.
    Exceeded { used: i64, total: i64 },
    NotFound,
}

/// Account persistence operations.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Account>, StoreError>;

    async fn find_by_api_key(&self, api_key: &str) -> Result<Option<Account>, StoreError>;

    /// Insert the account unless a row with the same id already exists.
    /// Returns the stored row either way (winner-or-existing).
    async fn create_if_absent(&self, account: Account) -> Result<Account, StoreError>;

    /// Merge `patch` into the account in one atomic write. Returns the
    /// updated row, or `None` if the account does not exist.
    async fn update(&self, id: &str, patch: AccountPatch) -> Result<Option<Account>, StoreError>;

    /// Atomically add `amount` to `used_storage` iff the result stays
    /// within `total_storage`. A zero amount always succeeds, even on an
    /// over-quota account.
    async fn reserve_storage(&self, id: &str, amount: i64) -> Result<ReserveOutcome, StoreError>;

    /// Atomically subtract `amount` from `used_storage`, clamping at
    /// zero. Returns the updated account and the amount actually
    /// released, or `None` if the account does not exist.
    async fn release_storage(
        &self,
        id: &str,
        amount: i64,
    ) -> Result<Option<(Account, i64)>, StoreError>;
}

/// File persistence operations.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<FileRecord>, StoreError>;

    /// Insert a new record. Returns `false` (and stores nothing) when
    /// the id is already taken.
    async fn insert_new(&self, file: FileRecord) -> Result<bool, StoreError>;

    /// Remove the record, returning it if it existed.
    async fn delete(&self, id: &str) -> Result<Option<FileRecord>, StoreError>;

    /// Files owned by `owner_id`, newest first (`created_at` descending,
    /// ties broken by id descending), bounded to `limit` when given.
    async fn list_for_owner(
        &self,
        owner_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<FileRecord>, StoreError>;

    async fn count_for_owner(&self, owner_id: &str) -> Result<u64, StoreError>;
}

/// Newest-first ordering shared by the store implementations.
pub(crate) fn sort_newest_first(files: &mut [FileRecord]) {
    files.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}
