//! Durable store backed by sled.
//!
//! Records are bincode-encoded. Two secondary index trees are kept
//! consistent with the primary trees inside sled transactions: an
//! api-key index for credential lookup and an owner-prefixed index for
//! per-account file listing. Conditional increments run as single-tree
//! transactions, which gives the check-and-increment atomicity the
//! store contract requires.

use super::{sort_newest_first, AccountPatch, AccountStore, FileStore, ReserveOutcome, StoreError};
use crate::account::Account;
use crate::files::FileRecord;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use std::path::Path;

pub struct SledStore {
    _db: sled::Db,
    accounts: sled::Tree,
    api_keys: sled::Tree,
    files: sled::Tree,
    files_by_owner: sled::Tree,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(sled_err)?;
        let accounts = db.open_tree("accounts").map_err(sled_err)?;
        let api_keys = db.open_tree("accounts_by_key").map_err(sled_err)?;
        let files = db.open_tree("files").map_err(sled_err)?;
        let files_by_owner = db.open_tree("files_by_owner").map_err(sled_err)?;
        Ok(Self {
            _db: db,
            accounts,
            api_keys,
            files,
            files_by_owner,
        })
    }
}

fn sled_err(e: sled::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(raw: &[u8]) -> Result<T, StoreError> {
    bincode::deserialize(raw).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn unwrap_txn<T>(
    result: Result<T, TransactionError<StoreError>>,
) -> Result<T, StoreError> {
    result.map_err(|e| match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => sled_err(e),
    })
}

/// Composite key `{owner}\0{file_id}` for the owner index tree.
fn owner_key(owner_id: &str, file_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(owner_id.len() + 1 + file_id.len());
    key.extend_from_slice(owner_id.as_bytes());
    key.push(0);
    key.extend_from_slice(file_id.as_bytes());
    key
}

fn owner_prefix(owner_id: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(owner_id.len() + 1);
    prefix.extend_from_slice(owner_id.as_bytes());
    prefix.push(0);
    prefix
}

#[async_trait]
impl AccountStore for SledStore {
    async fn get(&self, id: &str) -> Result<Option<Account>, StoreError> {
        match self.accounts.get(id.as_bytes()).map_err(sled_err)? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    async fn find_by_api_key(&self, api_key: &str) -> Result<Option<Account>, StoreError> {
        let id = match self.api_keys.get(api_key.as_bytes()).map_err(sled_err)? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        match self.accounts.get(&id).map_err(sled_err)? {
            // Guard against a stale index entry read mid-rotation.
            Some(raw) => {
                let account: Account = decode(&raw)?;
                Ok((account.api_key == api_key).then_some(account))
            }
            None => Ok(None),
        }
    }

    async fn create_if_absent(&self, account: Account) -> Result<Account, StoreError> {
        let result = (&self.accounts, &self.api_keys).transaction(|(accounts, keys)| {
            if let Some(raw) = accounts.get(account.id.as_bytes())? {
                let existing: Account =
                    decode(&raw).map_err(ConflictableTransactionError::Abort)?;
                return Ok(existing);
            }
            let bytes = encode(&account).map_err(ConflictableTransactionError::Abort)?;
            accounts.insert(account.id.as_bytes(), bytes)?;
            keys.insert(account.api_key.as_bytes(), account.id.as_bytes())?;
            Ok(account.clone())
        });
        unwrap_txn(result)
    }

    async fn update(&self, id: &str, patch: AccountPatch) -> Result<Option<Account>, StoreError> {
        let result = (&self.accounts, &self.api_keys).transaction(|(accounts, keys)| {
            let raw = match accounts.get(id.as_bytes())? {
                Some(raw) => raw,
                None => return Ok(None),
            };
            let mut account: Account =
                decode(&raw).map_err(ConflictableTransactionError::Abort)?;
            if let Some(new_key) = &patch.api_key {
                keys.remove(account.api_key.as_bytes())?;
                keys.insert(new_key.as_bytes(), id.as_bytes())?;
            }
            patch.apply(&mut account);
            let bytes = encode(&account).map_err(ConflictableTransactionError::Abort)?;
            accounts.insert(id.as_bytes(), bytes)?;
            Ok(Some(account))
        });
        unwrap_txn(result)
    }

    async fn reserve_storage(&self, id: &str, amount: i64) -> Result<ReserveOutcome, StoreError> {
        let result = self.accounts.transaction(|accounts| {
            let raw = match accounts.get(id.as_bytes())? {
                Some(raw) => raw,
                None => return Ok(ReserveOutcome::NotFound),
            };
            let mut account: Account =
                decode(&raw).map_err(ConflictableTransactionError::Abort)?;
            let available = account.total_storage - account.used_storage;
            if amount > 0 && amount > available {
                return Ok(ReserveOutcome::Exceeded {
                    used: account.used_storage,
                    total: account.total_storage,
                });
            }
            account.used_storage += amount;
            let bytes = encode(&account).map_err(ConflictableTransactionError::Abort)?;
            accounts.insert(id.as_bytes(), bytes)?;
            Ok(ReserveOutcome::Reserved(account))
        });
        unwrap_txn(result)
    }

    async fn release_storage(
        &self,
        id: &str,
        amount: i64,
    ) -> Result<Option<(Account, i64)>, StoreError> {
        let result = self.accounts.transaction(|accounts| {
            let raw = match accounts.get(id.as_bytes())? {
                Some(raw) => raw,
                None => return Ok(None),
            };
            let mut account: Account =
                decode(&raw).map_err(ConflictableTransactionError::Abort)?;
            let released = amount.min(account.used_storage);
            account.used_storage -= released;
            let bytes = encode(&account).map_err(ConflictableTransactionError::Abort)?;
            accounts.insert(id.as_bytes(), bytes)?;
            Ok(Some((account, released)))
        });
        unwrap_txn(result)
    }
}

#[async_trait]
impl FileStore for SledStore {
    async fn get(&self, id: &str) -> Result<Option<FileRecord>, StoreError> {
        match self.files.get(id.as_bytes()).map_err(sled_err)? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    async fn insert_new(&self, file: FileRecord) -> Result<bool, StoreError> {
        let result = (&self.files, &self.files_by_owner).transaction(|(files, by_owner)| {
            if files.get(file.id.as_bytes())?.is_some() {
                return Ok(false);
            }
            let bytes = encode(&file).map_err(ConflictableTransactionError::Abort)?;
            files.insert(file.id.as_bytes(), bytes)?;
            by_owner.insert(owner_key(&file.owner_id, &file.id), Vec::<u8>::new())?;
            Ok(true)
        });
        unwrap_txn(result)
    }

    async fn delete(&self, id: &str) -> Result<Option<FileRecord>, StoreError> {
        let result = (&self.files, &self.files_by_owner).transaction(|(files, by_owner)| {
            let raw = match files.remove(id.as_bytes())? {
                Some(raw) => raw,
                None => return Ok(None),
            };
            let file: FileRecord =
                decode(&raw).map_err(ConflictableTransactionError::Abort)?;
            by_owner.remove(owner_key(&file.owner_id, id))?;
            Ok(Some(file))
        });
        unwrap_txn(result)
    }

    async fn list_for_owner(
        &self,
        owner_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<FileRecord>, StoreError> {
        let mut files = Vec::new();
        for entry in self.files_by_owner.scan_prefix(owner_prefix(owner_id)) {
            let (key, _) = entry.map_err(sled_err)?;
            let file_id = &key[owner_id.len() + 1..];
            if let Some(raw) = self.files.get(file_id).map_err(sled_err)? {
                files.push(decode(&raw)?);
            }
        }
        sort_newest_first(&mut files);
        if let Some(limit) = limit {
            files.truncate(limit);
        }
        Ok(files)
    }

    async fn count_for_owner(&self, owner_id: &str) -> Result<u64, StoreError> {
        let mut count = 0u64;
        for entry in self.files_by_owner.scan_prefix(owner_prefix(owner_id)) {
            entry.map_err(sled_err)?;
            count += 1;
        }
        Ok(count)
    }
}
