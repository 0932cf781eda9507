//! In-memory store backed by dashmap.
//!
//! The per-key entry locks provide the read-modify-write atomicity the
//! store contract requires. Used in tests and single-process dev setups.

use super::{sort_newest_first, AccountPatch, AccountStore, FileStore, ReserveOutcome, StoreError};
use crate::account::Account;
use crate::files::FileRecord;

use async_trait::async_trait;
use dashmap::DashMap;

#[derive(Default)]
pub struct MemoryStore {
    accounts: DashMap<String, Account>,
    files: DashMap<String, FileRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<Account>, StoreError> {
        Ok(self.accounts.get(id).map(|a| a.clone()))
    }

    async fn find_by_api_key(&self, api_key: &str) -> Result<Option<Account>, StoreError> {
        Ok(self
            .accounts
            .iter()
            .find(|a| a.api_key == api_key)
            .map(|a| a.clone()))
    }

    async fn create_if_absent(&self, account: Account) -> Result<Account, StoreError> {
        let entry = self
            .accounts
            .entry(account.id.clone())
            .or_insert(account);
        Ok(entry.clone())
    }

    async fn update(&self, id: &str, patch: AccountPatch) -> Result<Option<Account>, StoreError> {
        match self.accounts.get_mut(id) {
            Some(mut account) => {
                patch.apply(&mut account);
                Ok(Some(account.clone()))
            }
            None => Ok(None),
        }
    }

    async fn reserve_storage(&self, id: &str, amount: i64) -> Result<ReserveOutcome, StoreError> {
        match self.accounts.get_mut(id) {
            Some(mut account) => {
                let available = account.total_storage - account.used_storage;
                if amount > 0 && amount > available {
                    return Ok(ReserveOutcome::Exceeded {
                        used: account.used_storage,
                        total: account.total_storage,
                    });
                }
                account.used_storage += amount;
                Ok(ReserveOutcome::Reserved(account.clone()))
            }
            None => Ok(ReserveOutcome::NotFound),
        }
    }

    async fn release_storage(
        &self,
        id: &str,
        amount: i64,
    ) -> Result<Option<(Account, i64)>, StoreError> {
        match self.accounts.get_mut(id) {
            Some(mut account) => {
                let released = amount.min(account.used_storage);
                account.used_storage -= released;
                Ok(Some((account.clone(), released)))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl FileStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<FileRecord>, StoreError> {
        Ok(self.files.get(id).map(|f| f.clone()))
    }

    async fn insert_new(&self, file: FileRecord) -> Result<bool, StoreError> {
        match self.files.entry(file.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(file);
                Ok(true)
            }
        }
    }

    async fn delete(&self, id: &str) -> Result<Option<FileRecord>, StoreError> {
        Ok(self.files.remove(id).map(|(_, file)| file))
    }

    async fn list_for_owner(
        &self,
        owner_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<FileRecord>, StoreError> {
        let mut files: Vec<FileRecord> = self
            .files
            .iter()
            .filter(|f| f.owner_id == owner_id)
            .map(|f| f.clone())
            .collect();
        sort_newest_first(&mut files);
        if let Some(limit) = limit {
            files.truncate(limit);
        }
        Ok(files)
    }

    async fn count_for_owner(&self, owner_id: &str) -> Result<u64, StoreError> {
        Ok(self.files.iter().filter(|f| f.owner_id == owner_id).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_if_absent_keeps_first_row() {
        let store = MemoryStore::new();

        let first = store
            .create_if_absent(Account::new("user1".to_string()))
            .await
            .unwrap();
        let second = store
            .create_if_absent(Account::new("user1".to_string()))
            .await
            .unwrap();

        assert_eq!(first.api_key, second.api_key);
    }

    #[tokio::test]
    async fn test_reserve_respects_ceiling() {
        let store = MemoryStore::new();
        store
            .create_if_absent(Account::new("user1".to_string()))
            .await
            .unwrap();

        // Default ceiling is 1024.
        assert!(matches!(
            store.reserve_storage("user1", 1024).await.unwrap(),
            ReserveOutcome::Reserved(_)
        ));
        assert!(matches!(
            store.reserve_storage("user1", 1).await.unwrap(),
            ReserveOutcome::Exceeded { used: 1024, total: 1024 }
        ));
    }

    #[tokio::test]
    async fn test_zero_reserve_allowed_over_quota() {
        let store = MemoryStore::new();
        store
            .create_if_absent(Account::new("user1".to_string()))
            .await
            .unwrap();
        store.reserve_storage("user1", 1000).await.unwrap();

        // Simulate a downgrade below current usage.
        store
            .update(
                "user1",
                AccountPatch {
                    total_storage: Some(512),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(matches!(
            store.reserve_storage("user1", 0).await.unwrap(),
            ReserveOutcome::Reserved(_)
        ));
        assert!(matches!(
            store.reserve_storage("user1", 1).await.unwrap(),
            ReserveOutcome::Exceeded { .. }
        ));
    }

    #[tokio::test]
    async fn test_release_clamps_at_zero() {
        let store = MemoryStore::new();
        store
            .create_if_absent(Account::new("user1".to_string()))
            .await
            .unwrap();
        store.reserve_storage("user1", 100).await.unwrap();

        let (account, released) = store.release_storage("user1", 500).await.unwrap().unwrap();
        assert_eq!(released, 100);
        assert_eq!(account.used_storage, 0);
    }
}
