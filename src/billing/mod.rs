//! Billing Module - Subscription lifecycle and plan transitions
//!
//! Inbound webhook events drive a state machine over the account's
//! plan tier. Each transition lands as one atomic account update, so
//! plan and ceiling can never be observed disagreeing. The billing
//! provider itself is only consulted to fetch the self-service portal
//! link; no account state depends on it.

use crate::account::{Account, AccountError, AccountProvisioner, PlanTier};
use crate::store::{AccountPatch, AccountStore, StoreError};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Product family this service sells storage under. Events referencing
/// any other product are rejected.
pub const DEFAULT_PRODUCT_ID: u64 = 284_213;

/// Variant id -> tier lookup. Each paid tier keeps a legacy variant id
/// alongside its current one; new variants only need a row here.
static VARIANT_TIERS: Lazy<HashMap<u64, PlanTier>> = Lazy::new(|| {
    HashMap::from([
        (542_412, PlanTier::ProLite),
        (599_371, PlanTier::ProLite),
        (542_413, PlanTier::ProStd),
        (599_372, PlanTier::ProStd),
        (542_414, PlanTier::ProUlt),
        (599_373, PlanTier::ProUlt),
    ])
});

/// Resolve a billing variant id to a plan tier.
pub fn tier_for_variant(variant_id: u64) -> Option<PlanTier> {
    VARIANT_TIERS.get(&variant_id).copied()
}

#[derive(Error, Debug)]
pub enum BillingError {
    #[error("unrecognized billing event: {0}")]
    UnrecognizedEvent(String),

    #[error("event carries no account reference")]
    MissingReference,

    #[error("event references product {got}, expected {expected}")]
    InvalidProduct { expected: u64, got: u64 },

    #[error("unrecognized plan variant: {0}")]
    InvalidPlan(u64),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("account has no active subscription")]
    NoActiveSubscription,

    #[error("billing customer not found: {0}")]
    CustomerNotFound(u64),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<AccountError> for BillingError {
    fn from(err: AccountError) -> Self {
        match err {
            AccountError::AccountNotFound(id) => BillingError::AccountNotFound(id),
            AccountError::Store(e) => BillingError::Store(e),
        }
    }
}

/// Raw webhook payload shape from the billing provider.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    pub meta: WebhookMeta,
    pub data: WebhookData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookMeta {
    pub event_name: String,
    #[serde(default)]
    pub custom_data: Option<WebhookCustomData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookCustomData {
    /// External account id the event applies to.
    #[serde(default)]
    pub cid: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookData {
    /// Subscription id, stringly-typed on the wire.
    pub id: String,
    pub attributes: WebhookAttributes,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookAttributes {
    pub product_id: u64,
    pub variant_id: u64,
    pub customer_id: u64,
}

/// A validated subscription lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    Created {
        account_id: String,
        product_id: u64,
        variant_id: u64,
        customer_id: u64,
        subscription_id: u64,
    },
    Expired {
        account_id: String,
    },
}

impl SubscriptionEvent {
    /// Extract the event from a webhook payload. Unknown event kinds
    /// and payloads without an account reference are rejected here,
    /// before any side effect.
    pub fn from_payload(payload: &WebhookPayload) -> Result<Self, BillingError> {
        match payload.meta.event_name.as_str() {
            "subscription_created" => {
                let account_id = account_ref(payload)?;
                let subscription_id = payload
                    .data
                    .id
                    .parse::<u64>()
                    .map_err(|_| BillingError::MissingReference)?;
                Ok(SubscriptionEvent::Created {
                    account_id,
                    product_id: payload.data.attributes.product_id,
                    variant_id: payload.data.attributes.variant_id,
                    customer_id: payload.data.attributes.customer_id,
                    subscription_id,
                })
            }
            "subscription_expired" => Ok(SubscriptionEvent::Expired {
                account_id: account_ref(payload)?,
            }),
            other => Err(BillingError::UnrecognizedEvent(other.to_string())),
        }
    }
}

fn account_ref(payload: &WebhookPayload) -> Result<String, BillingError> {
    payload
        .meta
        .custom_data
        .as_ref()
        .and_then(|c| c.cid.clone())
        .ok_or(BillingError::MissingReference)
}

/// Self-service portal info fetched from the billing provider.
#[derive(Debug, Clone)]
pub struct BillingCustomer {
    pub id: u64,
    pub portal_url: String,
}

/// Billing provider boundary, consulted only for the customer portal.
#[async_trait]
pub trait BillingProvider: Send + Sync {
    async fn fetch_customer(&self, customer_id: u64) -> Result<BillingCustomer, BillingError>;
}

/// State machine over an account's plan tier.
#[derive(Clone)]
pub struct SubscriptionPlanManager {
    store: Arc<dyn AccountStore>,
    provisioner: AccountProvisioner,
    provider: Arc<dyn BillingProvider>,
    product_id: u64,
}

impl SubscriptionPlanManager {
    pub fn new(
        store: Arc<dyn AccountStore>,
        provider: Arc<dyn BillingProvider>,
        product_id: u64,
    ) -> Self {
        let provisioner = AccountProvisioner::new(store.clone());
        Self {
            store,
            provisioner,
            provider,
            product_id,
        }
    }

    /// Apply a subscription lifecycle event.
    ///
    /// Replays are safe: the terminal state is a pure function of the
    /// event payload, and the update is applied unconditionally.
    pub async fn apply(&self, event: SubscriptionEvent) -> Result<Account, BillingError> {
        match event {
            SubscriptionEvent::Created {
                account_id,
                product_id,
                variant_id,
                customer_id,
                subscription_id,
            } => {
                if product_id != self.product_id {
                    return Err(BillingError::InvalidProduct {
                        expected: self.product_id,
                        got: product_id,
                    });
                }
                let tier =
                    tier_for_variant(variant_id).ok_or(BillingError::InvalidPlan(variant_id))?;

                // First subscription may arrive before the account has
                // ever been seen.
                self.provisioner.get_or_create(&account_id).await?;

                let patch = AccountPatch {
                    plan: Some(tier),
                    total_storage: Some(tier.ceiling_bytes()),
                    customer_id: Some(customer_id),
                    subscription_id: Some(subscription_id),
                    ..Default::default()
                };
                let account = self
                    .store
                    .update(&account_id, patch)
                    .await?
                    .ok_or_else(|| BillingError::AccountNotFound(account_id.clone()))?;
                info!(%account_id, ?tier, subscription_id, "subscription created");
                Ok(account)
            }
            SubscriptionEvent::Expired { account_id } => {
                let patch = AccountPatch {
                    plan: Some(PlanTier::Free),
                    total_storage: Some(PlanTier::Free.ceiling_bytes()),
                    subscription_id: Some(0),
                    ..Default::default()
                };
                let account = self
                    .store
                    .update(&account_id, patch)
                    .await?
                    .ok_or_else(|| BillingError::AccountNotFound(account_id.clone()))?;
                info!(%account_id, "subscription expired, reset to free tier");
                Ok(account)
            }
        }
    }

    /// Fetch the account's self-service billing portal URL. Never
    /// mutates account state.
    pub async fn customer_portal(&self, account_id: &str) -> Result<String, BillingError> {
        let account = self
            .store
            .get(account_id)
            .await?
            .ok_or_else(|| BillingError::AccountNotFound(account_id.to_string()))?;
        if account.customer_id == 0 {
            return Err(BillingError::NoActiveSubscription);
        }
        let customer = self
            .provider
            .fetch_customer(account.customer_id)
            .await
            .map_err(|_| BillingError::CustomerNotFound(account.customer_id))?;
        Ok(customer.portal_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::{QuotaError, QuotaManager};
    use crate::store::MemoryStore;

    struct StubProvider {
        known_customer: u64,
    }

    #[async_trait]
    impl BillingProvider for StubProvider {
        async fn fetch_customer(&self, customer_id: u64) -> Result<BillingCustomer, BillingError> {
            if customer_id == self.known_customer {
                Ok(BillingCustomer {
                    id: customer_id,
                    portal_url: format!("https://billing.example/portal/{customer_id}"),
                })
            } else {
                Err(BillingError::CustomerNotFound(customer_id))
            }
        }
    }

    fn manager(store: Arc<MemoryStore>) -> SubscriptionPlanManager {
        SubscriptionPlanManager::new(
            store,
            Arc::new(StubProvider { known_customer: 77 }),
            DEFAULT_PRODUCT_ID,
        )
    }

    fn created(account_id: &str, variant_id: u64) -> SubscriptionEvent {
        SubscriptionEvent::Created {
            account_id: account_id.to_string(),
            product_id: DEFAULT_PRODUCT_ID,
            variant_id,
            customer_id: 77,
            subscription_id: 9001,
        }
    }

    #[test]
    fn test_variant_table_covers_all_tiers() {
        assert_eq!(tier_for_variant(542_412), Some(PlanTier::ProLite));
        assert_eq!(tier_for_variant(599_371), Some(PlanTier::ProLite));
        assert_eq!(tier_for_variant(542_413), Some(PlanTier::ProStd));
        assert_eq!(tier_for_variant(599_372), Some(PlanTier::ProStd));
        assert_eq!(tier_for_variant(542_414), Some(PlanTier::ProUlt));
        assert_eq!(tier_for_variant(599_373), Some(PlanTier::ProUlt));
        assert_eq!(tier_for_variant(1), None);
    }

    #[test]
    fn test_payload_parsing() {
        let raw = serde_json::json!({
            "meta": {
                "event_name": "subscription_created",
                "custom_data": { "cid": "user1" }
            },
            "data": {
                "id": "9001",
                "attributes": {
                    "product_id": DEFAULT_PRODUCT_ID,
                    "variant_id": 542_413,
                    "customer_id": 77
                }
            }
        });
        let payload: WebhookPayload = serde_json::from_value(raw).unwrap();
        let event = SubscriptionEvent::from_payload(&payload).unwrap();
        assert_eq!(event, created("user1", 542_413));
    }

    #[test]
    fn test_payload_missing_reference() {
        let raw = serde_json::json!({
            "meta": { "event_name": "subscription_expired" },
            "data": {
                "id": "9001",
                "attributes": { "product_id": 1, "variant_id": 1, "customer_id": 1 }
            }
        });
        let payload: WebhookPayload = serde_json::from_value(raw).unwrap();
        assert!(matches!(
            SubscriptionEvent::from_payload(&payload).unwrap_err(),
            BillingError::MissingReference
        ));
    }

    #[test]
    fn test_payload_unrecognized_event() {
        let raw = serde_json::json!({
            "meta": {
                "event_name": "subscription_payment_success",
                "custom_data": { "cid": "user1" }
            },
            "data": {
                "id": "9001",
                "attributes": { "product_id": 1, "variant_id": 1, "customer_id": 1 }
            }
        });
        let payload: WebhookPayload = serde_json::from_value(raw).unwrap();
        assert!(matches!(
            SubscriptionEvent::from_payload(&payload).unwrap_err(),
            BillingError::UnrecognizedEvent(_)
        ));
    }

    #[tokio::test]
    async fn test_created_sets_plan_atomically() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_if_absent(Account::new("user1".to_string()))
            .await
            .unwrap();
        let manager = manager(store);

        let account = manager.apply(created("user1", 542_413)).await.unwrap();
        assert_eq!(account.plan, PlanTier::ProStd);
        assert_eq!(account.total_storage, 153_600);
        assert_eq!(account.customer_id, 77);
        assert_eq!(account.subscription_id, 9001);
    }

    #[tokio::test]
    async fn test_created_is_deterministic_regardless_of_prior_state() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_if_absent(Account::new("user1".to_string()))
            .await
            .unwrap();
        let quota = QuotaManager::new(store.clone());
        let manager = manager(store);

        // Start from ProUlt with accumulated usage.
        manager.apply(created("user1", 542_414)).await.unwrap();
        quota.reserve("user1", 200_000).await.unwrap();

        let account = manager.apply(created("user1", 542_413)).await.unwrap();
        assert_eq!(account.plan, PlanTier::ProStd);
        assert_eq!(account.total_storage, 153_600);
        // Usage is never touched by plan transitions.
        assert_eq!(account.used_storage, 200_000);

        // Replay lands in the same terminal state.
        let replayed = manager.apply(created("user1", 542_413)).await.unwrap();
        assert_eq!(replayed.plan, PlanTier::ProStd);
        assert_eq!(replayed.total_storage, 153_600);
    }

    #[tokio::test]
    async fn test_created_provisions_unknown_account() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(store.clone());

        let account = manager.apply(created("fresh", 542_412)).await.unwrap();
        assert_eq!(account.plan, PlanTier::ProLite);
        assert_eq!(account.total_storage, 51_200);
        assert_eq!(account.used_storage, 0);
        assert!(AccountStore::get(store.as_ref(), "fresh")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_created_rejects_foreign_product() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(store);

        let event = SubscriptionEvent::Created {
            account_id: "user1".to_string(),
            product_id: 999,
            variant_id: 542_413,
            customer_id: 77,
            subscription_id: 9001,
        };
        assert!(matches!(
            manager.apply(event).await.unwrap_err(),
            BillingError::InvalidProduct { got: 999, .. }
        ));
    }

    #[tokio::test]
    async fn test_created_rejects_unknown_variant() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(store.clone());

        assert!(matches!(
            manager.apply(created("user1", 123)).await.unwrap_err(),
            BillingError::InvalidPlan(123)
        ));
        // Rejected before any side effect.
        assert!(AccountStore::get(store.as_ref(), "user1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_expired_resets_regardless_of_usage() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_if_absent(Account::new("user1".to_string()))
            .await
            .unwrap();
        let quota = QuotaManager::new(store.clone());
        let manager = manager(store);

        manager.apply(created("user1", 542_414)).await.unwrap();
        quota.reserve("user1", 200_000).await.unwrap();

        let account = manager
            .apply(SubscriptionEvent::Expired {
                account_id: "user1".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(account.plan, PlanTier::Free);
        assert_eq!(account.total_storage, 1024);
        assert_eq!(account.subscription_id, 0);
        assert_eq!(account.used_storage, 200_000);

        // Over quota: blocked from any positive reservation until usage
        // drops below the free ceiling.
        assert!(matches!(
            quota.reserve("user1", 1).await.unwrap_err(),
            QuotaError::InsufficientQuota { .. }
        ));
        quota.release("user1", 199_500).await.unwrap();
        quota.reserve("user1", 100).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_unknown_account() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(store);

        assert!(matches!(
            manager
                .apply(SubscriptionEvent::Expired {
                    account_id: "ghost".to_string(),
                })
                .await
                .unwrap_err(),
            BillingError::AccountNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_customer_portal() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_if_absent(Account::new("user1".to_string()))
            .await
            .unwrap();
        let manager = manager(store);

        // No subscription yet.
        assert!(matches!(
            manager.customer_portal("user1").await.unwrap_err(),
            BillingError::NoActiveSubscription
        ));

        manager.apply(created("user1", 542_413)).await.unwrap();
        let url = manager.customer_portal("user1").await.unwrap();
        assert_eq!(url, "https://billing.example/portal/77");
    }

    #[tokio::test]
    async fn test_customer_portal_provider_failure() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_if_absent(Account::new("user1".to_string()))
            .await
            .unwrap();
        // Provider that knows no customers.
        let manager = SubscriptionPlanManager::new(
            store.clone(),
            Arc::new(StubProvider { known_customer: 0 }),
            DEFAULT_PRODUCT_ID,
        );

        manager.apply(created("user1", 542_413)).await.unwrap();
        assert!(matches!(
            manager.customer_portal("user1").await.unwrap_err(),
            BillingError::CustomerNotFound(77)
        ));

        // Lookup failure mutates nothing.
        let account = AccountStore::get(store.as_ref(), "user1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.plan, PlanTier::ProStd);
        assert_eq!(account.customer_id, 77);
    }
}
