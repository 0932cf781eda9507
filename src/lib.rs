//! Hostbin Core - Storage accounting for a hosted upload service
//!
//! This crate provides the quota-and-plan accounting engine behind a
//! hosted upload service: per-account storage quotas, a registry of
//! uploaded files debited against them, and a subscription plan state
//! machine that sizes each account's ceiling. The HTTP layer, request
//! authentication, and payment processing live outside this crate and
//! talk to it through `StorageCore`.

pub mod account;
pub mod billing;
pub mod files;
pub mod quota;
pub mod store;

use std::sync::Arc;
use thiserror::Error;

/// Main error type for core operations
#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Account(#[from] account::AccountError),

    #[error(transparent)]
    Quota(#[from] quota::QuotaError),

    #[error(transparent)]
    File(#[from] files::FileError),

    #[error(transparent)]
    Billing(#[from] billing::BillingError),

    #[error(transparent)]
    Store(#[from] store::StoreError),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Core configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CoreConfig {
    /// Local path for the durable store
    pub data_path: String,

    /// Billing product family accepted from webhook events
    pub product_id: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_path: "./hostbin_data".to_string(),
            product_id: billing::DEFAULT_PRODUCT_ID,
        }
    }
}

/// The assembled accounting engine. Every operation the request layer
/// needs is reachable from here; calls are assumed to be authorized
/// already.
#[derive(Clone)]
pub struct StorageCore {
    pub accounts: account::AccountProvisioner,
    pub quota: quota::QuotaManager,
    pub files: files::FileRegistry,
    pub plans: billing::SubscriptionPlanManager,
}

impl StorageCore {
    /// Assemble the core over explicit store and billing collaborators.
    pub fn new(
        account_store: Arc<dyn store::AccountStore>,
        file_store: Arc<dyn store::FileStore>,
        provider: Arc<dyn billing::BillingProvider>,
        config: &CoreConfig,
    ) -> Self {
        let quota = quota::QuotaManager::new(account_store.clone());
        Self {
            accounts: account::AccountProvisioner::new(account_store.clone()),
            files: files::FileRegistry::new(file_store, quota.clone()),
            plans: billing::SubscriptionPlanManager::new(
                account_store,
                provider,
                config.product_id,
            ),
            quota,
        }
    }

    /// Open a sled-backed core at `config.data_path`.
    pub fn open(
        config: &CoreConfig,
        provider: Arc<dyn billing::BillingProvider>,
    ) -> Result<Self> {
        let sled = Arc::new(store::SledStore::open(&config.data_path)?);
        Ok(Self::new(sled.clone(), sled, provider, config))
    }

    /// In-memory core for tests and single-process dev setups.
    pub fn in_memory(provider: Arc<dyn billing::BillingProvider>) -> Self {
        let memory = Arc::new(store::MemoryStore::new());
        Self::new(memory.clone(), memory, provider, &CoreConfig::default())
    }
}
