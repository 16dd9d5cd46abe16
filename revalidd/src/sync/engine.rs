use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use revalid_core::{FileDescriptor, HttpMethod};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ServiceError;
use crate::notice::Notice;
use crate::service::{ApiService, CURRENT_USER_ENDPOINT};
use crate::store::{MAX_RETRIES, OperationStatus, QueuedOperation, StoreError};

pub const DEFAULT_REFRESH_COOLDOWN: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncReport {
    pub synced: usize,
    /// Abandoned after exhausting their retries.
    pub failed: usize,
    /// Failed this pass, kept for the next one.
    pub retrying: usize,
    /// Endpoints refreshed by the sweep, `None` while the cooldown holds.
    pub refreshed: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    AlreadyRunning,
    Offline,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drains the offline write queue through the orchestrator.
pub struct SyncEngine {
    service: ApiService,
    running: AtomicBool,
    last_refresh: Mutex<Option<Instant>>,
    refresh_cooldown: Duration,
}

impl SyncEngine {
    pub fn new(service: ApiService) -> Self {
        Self {
            service,
            running: AtomicBool::new(false),
            last_refresh: Mutex::new(None),
            refresh_cooldown: DEFAULT_REFRESH_COOLDOWN,
        }
    }

    pub fn with_refresh_cooldown(mut self, cooldown: Duration) -> Self {
        self.refresh_cooldown = cooldown;
        self
    }

    pub fn service(&self) -> &ApiService {
        &self.service
    }

    pub fn is_syncing(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One full pass: drain, report, then the throttled refresh sweep.
    pub async fn sync_pending(&self) -> Result<SyncOutcome, SyncError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("sync pass already running");
            return Ok(SyncOutcome::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);

        let ctx = self.service.context();
        if !ctx.connectivity.check().await.is_online() {
            debug!("sync pass skipped: offline");
            return Ok(SyncOutcome::Offline);
        }

        let mut report = self.drain().await?;
        if report.synced > 0 || report.failed > 0 {
            info!(
                synced = report.synced,
                failed = report.failed,
                retrying = report.retrying,
                "sync pass finished"
            );
            ctx.notifier.emit(Notice::SyncSummary {
                synced: report.synced,
                failed: report.failed,
            });
        }
        report.refreshed = self.refresh_if_due().await;
        Ok(SyncOutcome::Completed(report))
    }

    async fn drain(&self) -> Result<SyncReport, SyncError> {
        let store = &self.service.context().store;
        let recovered = store.reset_interrupted().await?;
        if recovered > 0 {
            info!(recovered, "recovered operations from an interrupted sync");
        }

        let mut report = SyncReport::default();
        for op in store.list_replayable().await? {
            store.set_status(op.id, OperationStatus::Syncing).await?;
            match self.replay(&op).await {
                Ok(()) => {
                    store.delete_operation(op.id).await?;
                    debug!(id = op.id, method = %op.method, endpoint = %op.endpoint, "operation synced");
                    report.synced += 1;
                }
                Err(err) => {
                    let retries = store.record_failure(op.id).await?;
                    if retries >= MAX_RETRIES {
                        store.delete_operation(op.id).await?;
                        warn!(
                            id = op.id,
                            method = %op.method,
                            endpoint = %op.endpoint,
                            error = %err,
                            "operation abandoned after {retries} attempts"
                        );
                        report.failed += 1;
                    } else {
                        warn!(
                            id = op.id,
                            method = %op.method,
                            endpoint = %op.endpoint,
                            retries,
                            error = %err,
                            "operation replay failed"
                        );
                        report.retrying += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    async fn replay(&self, op: &QueuedOperation) -> Result<(), ServiceError> {
        let token = op.bearer_token();
        match (op.method, embedded_file(op.data.as_ref())) {
            (HttpMethod::Get, _) => {
                self.service.refresh(&op.endpoint, token).await?;
            }
            (HttpMethod::Post, Some((file, fields))) => {
                self.service
                    .client()
                    .upload(&op.endpoint, &file, token, &fields)
                    .await?;
            }
            (method, _) => {
                self.service
                    .client()
                    .request(method, &op.endpoint, op.data.as_ref(), token)
                    .await?;
            }
        }
        Ok(())
    }

    /// Refreshes the current user and the important collections unless the
    /// last sweep ran within the cooldown.
    pub async fn refresh_if_due(&self) -> Option<usize> {
        {
            let mut last = match self.last_refresh.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if last.is_some_and(|at| at.elapsed() < self.refresh_cooldown) {
                return None;
            }
            *last = Some(Instant::now());
        }

        let token = self.service.context().session_token();
        let mut endpoints = vec![CURRENT_USER_ENDPOINT.to_string()];
        endpoints.extend(self.service.important_endpoints().iter().cloned());
        let refreshed = self
            .service
            .refresh_endpoints(&endpoints, token.as_deref())
            .await;
        debug!(refreshed, total = endpoints.len(), "cache refresh sweep");
        Some(refreshed)
    }

    /// Runs a pass now if online, then on every offline→online transition.
    pub fn spawn_watcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut rx = self.service.context().connectivity.subscribe();
            let mut previous = *rx.borrow_and_update();
            if previous.is_online() {
                self.run_logged().await;
            }
            while rx.changed().await.is_ok() {
                let current = *rx.borrow_and_update();
                if current.is_online() && !previous.is_online() {
                    self.run_logged().await;
                }
                previous = current;
            }
        })
    }

    async fn run_logged(&self) {
        match self.sync_pending().await {
            Ok(outcome) => debug!(?outcome, "sync trigger handled"),
            Err(err) => self
                .service
                .context()
                .background
                .report("sync pass", &err),
        }
    }
}

/// A queued upload: `{"file": {uri, name, type}, ...fields}`.
fn embedded_file(data: Option<&Value>) -> Option<(FileDescriptor, Map<String, Value>)> {
    let map = data?.as_object()?;
    let file: FileDescriptor = serde_json::from_value(map.get("file")?.clone()).ok()?;
    let mut fields = map.clone();
    fields.remove("file");
    Some((file, fields))
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
