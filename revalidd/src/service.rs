use std::sync::Arc;

use futures_util::future::join_all;
use revalid_core::{ApiClient, ApiError, FileDescriptor, HttpMethod};
use serde_json::{Map, Value, json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::OfflineContext;
use crate::error::ServiceError;
use crate::notice::Notice;
use crate::optimistic::OptimisticUpdater;
use crate::store::{NewOperation, cache_key};
use crate::tier::{TierDecision, TierState};

/// The probe whose payload carries the subscription tier.
pub const CURRENT_USER_ENDPOINT: &str = "/api/v1/users/me";

/// `message` of the placeholder returned for uncached offline reads.
pub const OFFLINE_NO_CACHE_MARKER: &str = "OFFLINE_NO_CACHE";

pub const DEFAULT_IMPORTANT_ENDPOINTS: &[&str] = &[
    "/api/v1/cpd-hours",
    "/api/v1/work-hours",
    "/api/v1/feedback",
    "/api/v1/reflections",
    "/api/v1/appraisals",
    "/api/v1/calendar/events",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    pub force_refresh: bool,
}

impl GetOptions {
    pub fn force_refresh() -> Self {
        Self {
            force_refresh: true,
        }
    }
}

/// Request orchestrator: picks network, cache or queue per call according to
/// the tier policy and live connectivity.
#[derive(Clone)]
pub struct ApiService {
    client: ApiClient,
    ctx: OfflineContext,
    updater: OptimisticUpdater,
    important: Arc<Vec<String>>,
}

impl ApiService {
    pub fn new(client: ApiClient, ctx: OfflineContext) -> Self {
        let updater = OptimisticUpdater::new(
            ctx.store.clone(),
            Arc::clone(&ctx.registry),
            ctx.background.clone(),
        );
        Self {
            client,
            ctx,
            updater,
            important: Arc::new(
                DEFAULT_IMPORTANT_ENDPOINTS
                    .iter()
                    .map(|endpoint| endpoint.to_string())
                    .collect(),
            ),
        }
    }

    pub fn with_important_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.important = Arc::new(endpoints);
        self
    }

    pub fn context(&self) -> &OfflineContext {
        &self.ctx
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub fn important_endpoints(&self) -> &[String] {
        &self.important
    }

    pub fn decision_for(&self, endpoint: &str) -> TierDecision {
        self.ctx.policy.classify(endpoint, &self.ctx.tier.get())
    }

    pub async fn get(&self, endpoint: &str, token: Option<&str>) -> Result<Value, ServiceError> {
        self.get_with_options(endpoint, token, GetOptions::default())
            .await
    }

    pub async fn get_with_options(
        &self,
        endpoint: &str,
        token: Option<&str>,
        options: GetOptions,
    ) -> Result<Value, ServiceError> {
        let decision = self.decision_for(endpoint);
        if decision != TierDecision::OfflineCapable {
            return match self.fetch(endpoint, token, decision).await {
                Ok(value) => Ok(value),
                Err(err) => Err(self.online_only_failure(endpoint, err).await),
            };
        }

        if !options.force_refresh
            && let Some(entry) = self.ctx.store.cache_get(endpoint).await?
        {
            self.spawn_revalidation(endpoint, token);
            return Ok(entry.value);
        }

        match self.fetch(endpoint, token, decision).await {
            Ok(value) => Ok(value),
            Err(err) if !err.is_transport() => Err(err.into()),
            Err(err) => {
                if self.ctx.connectivity.check().await.is_online() {
                    return Err(err.into());
                }
                if options.force_refresh
                    && let Some(entry) = self.ctx.store.cache_get(endpoint).await?
                {
                    debug!(endpoint, "forced refresh failed offline, serving cache");
                    return Ok(entry.value);
                }
                warn!(endpoint, "offline without cached data, returning placeholder");
                Ok(offline_placeholder())
            }
        }
    }

    pub async fn post(
        &self,
        endpoint: &str,
        body: Option<&Value>,
        token: Option<&str>,
    ) -> Result<Value, ServiceError> {
        self.write(HttpMethod::Post, endpoint, body, token).await
    }

    pub async fn put(
        &self,
        endpoint: &str,
        body: Option<&Value>,
        token: Option<&str>,
    ) -> Result<Value, ServiceError> {
        self.write(HttpMethod::Put, endpoint, body, token).await
    }

    pub async fn patch(
        &self,
        endpoint: &str,
        body: Option<&Value>,
        token: Option<&str>,
    ) -> Result<Value, ServiceError> {
        self.write(HttpMethod::Patch, endpoint, body, token).await
    }

    pub async fn delete(&self, endpoint: &str, token: Option<&str>) -> Result<Value, ServiceError> {
        self.write(HttpMethod::Delete, endpoint, None, token).await
    }

    pub async fn upload_file(
        &self,
        endpoint: &str,
        file: &FileDescriptor,
        token: Option<&str>,
        extra_fields: Option<&Map<String, Value>>,
    ) -> Result<Value, ServiceError> {
        let fields = extra_fields.cloned().unwrap_or_default();
        match self.client.upload(endpoint, file, token, &fields).await {
            Ok(value) => Ok(value),
            Err(err) => {
                let mut body = fields;
                body.insert("file".into(), serde_json::to_value(file)?);
                let body = Value::Object(body);
                self.write_failure(HttpMethod::Post, endpoint, Some(&body), token, err)
                    .await
            }
        }
    }

    /// Warms the cache with the important collections. Only for entitled
    /// callers with a live connection; returns how many endpoints were cached.
    pub async fn pre_cache_offline_data(&self, token: Option<&str>) -> Result<usize, ServiceError> {
        if !self.ctx.tier.get().offline_entitled {
            debug!("pre-cache skipped: not offline entitled");
            return Ok(0);
        }
        if !self.ctx.connectivity.check().await.is_online() {
            debug!("pre-cache skipped: offline");
            return Ok(0);
        }
        let mut endpoints = vec![CURRENT_USER_ENDPOINT.to_string()];
        endpoints.extend(self.important.iter().cloned());
        let cached = self.refresh_endpoints(&endpoints, token).await;
        info!(cached, total = endpoints.len(), "pre-cached offline data");
        Ok(cached)
    }

    pub async fn pending_operation_count(&self) -> Result<i64, ServiceError> {
        Ok(self.ctx.store.pending_count().await?)
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.ctx.notifier.subscribe()
    }

    /// Drops cached responses and queued writes, e.g. on logout.
    pub async fn clear_offline_data(&self) -> Result<(), ServiceError> {
        self.ctx.store.clear_all().await?;
        info!("offline data cleared");
        Ok(())
    }

    /// Network GET that always writes through to the cache (unless the
    /// endpoint is online-mandatory). Used for replayed GETs and sweeps.
    pub async fn refresh(&self, endpoint: &str, token: Option<&str>) -> Result<Value, ServiceError> {
        let decision = self.decision_for(endpoint);
        Ok(self.fetch(endpoint, token, decision).await?)
    }

    /// Refreshes each endpoint concurrently and returns the success count.
    pub async fn refresh_endpoints(&self, endpoints: &[String], token: Option<&str>) -> usize {
        let results = join_all(
            endpoints
                .iter()
                .map(|endpoint| async move { (endpoint, self.refresh(endpoint, token).await) }),
        )
        .await;
        results
            .into_iter()
            .filter(|(endpoint, result)| match result {
                Ok(_) => true,
                Err(err) => {
                    self.ctx
                        .background
                        .report(&format!("refresh {endpoint}"), err);
                    false
                }
            })
            .count()
    }

    async fn fetch(
        &self,
        endpoint: &str,
        token: Option<&str>,
        decision: TierDecision,
    ) -> Result<Value, ApiError> {
        let value = self.client.get(endpoint, token).await?;
        if decision != TierDecision::OnlineMandatory
            && let Err(err) = self.ctx.store.cache_put(endpoint, &value).await
        {
            self.ctx
                .background
                .report(&format!("cache write {endpoint}"), &err);
        }
        self.sync_tier(endpoint, &value);
        Ok(value)
    }

    fn sync_tier(&self, endpoint: &str, value: &Value) {
        if cache_key(endpoint) != CURRENT_USER_ENDPOINT {
            return;
        }
        let Some(state) = TierState::from_user_payload(value) else {
            return;
        };
        if self.ctx.tier.get() != state {
            info!(?state, "subscription tier updated");
            self.ctx.tier.set(state);
        }
    }

    fn spawn_revalidation(&self, endpoint: &str, token: Option<&str>) -> JoinHandle<()> {
        let service = self.clone();
        let endpoint = endpoint.to_string();
        let token = token.map(str::to_string);
        self.ctx
            .background
            .spawn(format!("revalidate {endpoint}"), async move {
                let decision = service.decision_for(&endpoint);
                service
                    .fetch(&endpoint, token.as_deref(), decision)
                    .await
                    .map(|_| ())
            })
    }

    async fn online_only_failure(&self, endpoint: &str, err: ApiError) -> ServiceError {
        if !err.is_transport() {
            return err.into();
        }
        if self.ctx.connectivity.check().await.is_online() {
            return err.into();
        }
        ServiceError::NetworkRequired {
            endpoint: endpoint.to_string(),
        }
    }

    async fn write(
        &self,
        method: HttpMethod,
        endpoint: &str,
        body: Option<&Value>,
        token: Option<&str>,
    ) -> Result<Value, ServiceError> {
        match self.client.request(method, endpoint, body, token).await {
            Ok(value) => Ok(value),
            Err(err) => self.write_failure(method, endpoint, body, token, err).await,
        }
    }

    async fn write_failure(
        &self,
        method: HttpMethod,
        endpoint: &str,
        body: Option<&Value>,
        token: Option<&str>,
        err: ApiError,
    ) -> Result<Value, ServiceError> {
        // Server rejections are never queued.
        if !err.is_transport() {
            return Err(err.into());
        }
        if self.ctx.connectivity.check().await.is_online() {
            return Err(err.into());
        }
        match self.decision_for(endpoint) {
            TierDecision::OfflineCapable => {
                self.queue_write(method, endpoint, body, token).await?;
                Ok(queued_envelope())
            }
            TierDecision::OnlineMandatory | TierDecision::FreeOnlineOnly => {
                Err(ServiceError::NetworkRequired {
                    endpoint: endpoint.to_string(),
                })
            }
        }
    }

    async fn queue_write(
        &self,
        method: HttpMethod,
        endpoint: &str,
        body: Option<&Value>,
        token: Option<&str>,
    ) -> Result<i64, ServiceError> {
        let headers = token.map(|token| json!({"Authorization": format!("Bearer {token}")}));
        let id = self
            .ctx
            .store
            .enqueue_operation(&NewOperation {
                method,
                endpoint,
                data: body,
                headers: headers.as_ref(),
            })
            .await?;
        info!(id, %method, endpoint, "write queued offline");

        self.updater.apply(method, endpoint, body).await;
        self.ctx.notifier.emit(Notice::SavedOffline {
            endpoint: endpoint.to_string(),
        });
        Ok(id)
    }
}

pub fn offline_placeholder() -> Value {
    json!({
        "success": true,
        "data": [],
        "message": OFFLINE_NO_CACHE_MARKER,
    })
}

pub fn is_offline_placeholder(value: &Value) -> bool {
    value.get("message").and_then(Value::as_str) == Some(OFFLINE_NO_CACHE_MARKER)
}

fn queued_envelope() -> Value {
    json!({"success": true, "data": null})
}
