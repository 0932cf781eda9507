//! Account Module - User accounts, plan tiers, and provisioning
//!
//! Accounts are created lazily on first sight of a new user id and are
//! never deleted. Storage accounting (`used_storage`) is owned by the
//! quota module; this module owns the credential and cosmetic fields.

use crate::store::{AccountPatch, AccountStore, StoreError};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Subscription tier determining the storage ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlanTier {
    Free,
    ProLite,
    ProStd,
    ProUlt,
}

impl PlanTier {
    /// Storage ceiling for this tier, in bytes.
    pub const fn ceiling_bytes(&self) -> i64 {
        match self {
            PlanTier::Free => 1024,
            PlanTier::ProLite => 51_200,
            PlanTier::ProStd => 153_600,
            PlanTier::ProUlt => 307_200,
        }
    }
}

/// A user account with its storage counters and billing identifiers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Opaque external user id (caller-supplied, primary key)
    pub id: String,

    /// Random API credential, regenerable
    pub api_key: String,

    /// Current subscription tier
    pub plan: PlanTier,

    /// Byte capacity ceiling, determined by `plan`
    pub total_storage: i64,

    /// Bytes currently consumed by the account's files
    pub used_storage: i64,

    /// Preferred upload region (cosmetic)
    pub preferred_region: Option<String>,

    /// Embed presentation fields (cosmetic)
    pub embed_header: Option<String>,
    pub embed_footer: Option<String>,
    pub embed_color: Option<String>,

    /// Billing provider customer id (0 = no active subscription)
    pub customer_id: u64,

    /// Billing provider subscription id (0 = no active subscription)
    pub subscription_id: u64,

    /// Creation timestamp (unix seconds)
    pub created_at: i64,
}

impl Account {
    /// Create a fresh account at the default tier with a new API key.
    pub fn new(id: String) -> Self {
        Self {
            id,
            api_key: generate_api_key(),
            plan: PlanTier::Free,
            total_storage: PlanTier::Free.ceiling_bytes(),
            used_storage: 0,
            preferred_region: None,
            embed_header: None,
            embed_footer: None,
            embed_color: None,
            customer_id: 0,
            subscription_id: 0,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Remaining capacity, floored at zero (a downgraded account may be
    /// over its ceiling).
    pub fn remaining_storage(&self) -> i64 {
        (self.total_storage - self.used_storage).max(0)
    }
}

/// Generate a 16-byte hex API key.
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[derive(Error, Debug)]
pub enum AccountError {
    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Provisions accounts lazily and manages their API credentials.
#[derive(Clone)]
pub struct AccountProvisioner {
    store: Arc<dyn AccountStore>,
}

impl AccountProvisioner {
    pub fn new(store: Arc<dyn AccountStore>) -> Self {
        Self { store }
    }

    /// Return the existing account, or create one at the default tier.
    ///
    /// Safe under concurrent first access: the store's create-if-absent
    /// guarantees a single stored row, and every caller gets that row.
    pub async fn get_or_create(&self, account_id: &str) -> Result<Account, AccountError> {
        let candidate = Account::new(account_id.to_string());
        let candidate_key = candidate.api_key.clone();
        let stored = self.store.create_if_absent(candidate).await?;
        if stored.api_key == candidate_key {
            info!(account_id, "provisioned new account");
        }
        Ok(stored)
    }

    /// Replace the account's API key. The old key stops resolving
    /// immediately.
    pub async fn rotate_key(&self, account_id: &str) -> Result<String, AccountError> {
        let new_key = generate_api_key();
        let patch = AccountPatch {
            api_key: Some(new_key.clone()),
            ..Default::default()
        };
        self.store
            .update(account_id, patch)
            .await?
            .ok_or_else(|| AccountError::AccountNotFound(account_id.to_string()))?;
        info!(account_id, "rotated api key");
        Ok(new_key)
    }

    pub async fn find_by_api_key(&self, api_key: &str) -> Result<Account, AccountError> {
        self.store
            .find_by_api_key(api_key)
            .await?
            .ok_or_else(|| AccountError::AccountNotFound("<by api key>".to_string()))
    }

    /// Update the preferred upload region. No quota interaction.
    pub async fn set_preferred_region(
        &self,
        account_id: &str,
        region: String,
    ) -> Result<Account, AccountError> {
        let patch = AccountPatch {
            preferred_region: Some(region),
            ..Default::default()
        };
        self.store
            .update(account_id, patch)
            .await?
            .ok_or_else(|| AccountError::AccountNotFound(account_id.to_string()))
    }

    /// Update embed presentation fields. Fields left as `None` are
    /// untouched.
    pub async fn update_embed(
        &self,
        account_id: &str,
        header: Option<String>,
        footer: Option<String>,
        color: Option<String>,
    ) -> Result<Account, AccountError> {
        let patch = AccountPatch {
            embed_header: header,
            embed_footer: footer,
            embed_color: color,
            ..Default::default()
        };
        self.store
            .update(account_id, patch)
            .await?
            .ok_or_else(|| AccountError::AccountNotFound(account_id.to_string()))
    }
}
