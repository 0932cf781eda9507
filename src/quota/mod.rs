//! Quota Module - Capacity accounting for account storage
//!
//! Every byte charged against an account flows through `reserve`, and
//! every byte given back flows through `release`. Both are atomic at
//! the store, so concurrent uploads for one account serialize their
//! effect on `used_storage` and the `0 <= used <= total` invariant
//! holds between completed operations.

use crate::account::Account;
use crate::store::{AccountPatch, AccountStore, ReserveOutcome, StoreError};

use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum QuotaError {
    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("insufficient quota: requested {requested} bytes, {available} available")]
    InsufficientQuota { requested: i64, available: i64 },

    #[error("negative byte amount: {0}")]
    NegativeAmount(i64),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Enforces the capacity invariant on every charge and refund.
#[derive(Clone)]
pub struct QuotaManager {
    store: Arc<dyn AccountStore>,
}

impl QuotaManager {
    pub fn new(store: Arc<dyn AccountStore>) -> Self {
        Self { store }
    }

    /// Charge `amount` bytes against the account.
    ///
    /// The check-and-increment runs as one atomic conditional update at
    /// the store; concurrent reservations cannot overshoot the ceiling.
    /// A negative amount is a caller error, never a silent credit.
    pub async fn reserve(&self, account_id: &str, amount: i64) -> Result<Account, QuotaError> {
        if amount < 0 {
            return Err(QuotaError::NegativeAmount(amount));
        }
        match self.store.reserve_storage(account_id, amount).await? {
            ReserveOutcome::Reserved(account) => Ok(account),
            ReserveOutcome::Exceeded { used, total } => Err(QuotaError::InsufficientQuota {
                requested: amount,
                available: (total - used).max(0),
            }),
            ReserveOutcome::NotFound => {
                Err(QuotaError::AccountNotFound(account_id.to_string()))
            }
        }
    }

    /// Give back `amount` bytes. Clamps at zero instead of underflowing;
    /// a clamp means the caller's amount was stale and is flagged as a
    /// data-integrity signal.
    pub async fn release(&self, account_id: &str, amount: i64) -> Result<Account, QuotaError> {
        if amount < 0 {
            return Err(QuotaError::NegativeAmount(amount));
        }
        match self.store.release_storage(account_id, amount).await? {
            Some((account, released)) => {
                if released < amount {
                    warn!(
                        account_id,
                        requested = amount,
                        released,
                        "release clamped at zero, usage counter was out of sync"
                    );
                }
                Ok(account)
            }
            None => Err(QuotaError::AccountNotFound(account_id.to_string())),
        }
    }

    /// Overwrite the storage ceiling. Existing usage is not revalidated:
    /// a downgrade may leave the account over quota, which only blocks
    /// further reservations.
    pub async fn set_ceiling(&self, account_id: &str, new_total: i64) -> Result<Account, QuotaError> {
        if new_total < 0 {
            return Err(QuotaError::NegativeAmount(new_total));
        }
        let patch = AccountPatch {
            total_storage: Some(new_total),
            ..Default::default()
        };
        self.store
            .update(account_id, patch)
            .await?
            .ok_or_else(|| QuotaError::AccountNotFound(account_id.to_string()))
    }
}
