use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::background::Background;
use crate::connectivity::ConnectivityMonitor;
use crate::notice::Notifier;
use crate::optimistic::ResourceRegistry;
use crate::service::CURRENT_USER_ENDPOINT;
use crate::store::{OfflineStore, StoreError};
use crate::tier::{TierCell, TierPolicy, TierState};

/// Everything the orchestrator and the sync engine share. Built once at
/// startup and handed to both; tests build their own isolated instances.
#[derive(Clone)]
pub struct OfflineContext {
    pub store: OfflineStore,
    pub connectivity: ConnectivityMonitor,
    pub tier: TierCell,
    pub policy: Arc<TierPolicy>,
    pub registry: Arc<ResourceRegistry>,
    pub notifier: Notifier,
    pub background: Background,
    session: Arc<RwLock<Option<String>>>,
}

impl OfflineContext {
    pub fn new(store: OfflineStore, connectivity: ConnectivityMonitor) -> Self {
        Self {
            store,
            connectivity,
            tier: TierCell::default(),
            policy: Arc::new(TierPolicy::default()),
            registry: Arc::new(ResourceRegistry::with_defaults()),
            notifier: Notifier::new(),
            background: Background::default(),
            session: Arc::new(RwLock::new(None)),
        }
    }

    /// Like [`OfflineContext::new`], with the tier seeded from the last
    /// cached current-user payload so a cold start offline keeps its
    /// entitlement.
    pub async fn restore(
        store: OfflineStore,
        connectivity: ConnectivityMonitor,
    ) -> Result<Self, StoreError> {
        let ctx = Self::new(store, connectivity);
        ctx.restore_tier().await?;
        Ok(ctx)
    }

    pub async fn restore_tier(&self) -> Result<Option<TierState>, StoreError> {
        let Some(entry) = self.store.cache_get(CURRENT_USER_ENDPOINT).await? else {
            return Ok(None);
        };
        let state = TierState::from_user_payload(&entry.value);
        if let Some(state) = state {
            debug!(?state, "subscription tier restored from cache");
            self.tier.set(state);
        }
        Ok(state)
    }

    pub fn with_tier(self, state: TierState) -> Self {
        self.tier.set(state);
        self
    }

    pub fn with_policy(mut self, policy: TierPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn with_registry(mut self, registry: ResourceRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_background(mut self, background: Background) -> Self {
        self.background = background;
        self
    }

    /// Bearer token used by background sweeps that have no caller token.
    pub fn set_session_token(&self, token: Option<String>) {
        match self.session.write() {
            Ok(mut guard) => *guard = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
    }

    pub fn session_token(&self) -> Option<String> {
        match self.session.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
