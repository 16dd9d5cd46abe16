use super::*;
use crate::background::{Background, RecordingSink};
use crate::connectivity::{ConnectivityMonitor, Reachability};
use crate::context::OfflineContext;
use crate::store::{NewOperation, OfflineStore};
use crate::tier::TierState;
use revalid_core::ApiClient;
use serde_json::json;
use tokio::sync::broadcast::error::TryRecvError;
use wiremock::matchers::{body_json, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn make_engine(
    server: &MockServer,
    reachability: Reachability,
) -> (SyncEngine, OfflineContext, Arc<RecordingSink>) {
    let store = OfflineStore::in_memory().await.unwrap();
    let sink = Arc::new(RecordingSink::default());
    let ctx = OfflineContext::new(store, ConnectivityMonitor::manual(reachability))
        .with_tier(TierState::ENTITLED)
        .with_background(Background::new(sink.clone()));
    let client = ApiClient::with_base_url(&server.uri()).unwrap();
    let service = ApiService::new(client, ctx.clone()).with_important_endpoints(Vec::new());
    (SyncEngine::new(service), ctx, sink)
}

async fn mount_current_user(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/v1/users/me"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": {"id": 1, "subscription_tier": "premium"}
        })))
        .mount(server)
        .await;
}

fn completed(outcome: SyncOutcome) -> SyncReport {
    match outcome {
        SyncOutcome::Completed(report) => report,
        other => panic!("expected a completed pass, got {other:?}"),
    }
}

#[tokio::test]
async fn replayed_write_is_deleted_immediately() {
    let server = MockServer::start().await;
    mount_current_user(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/v1/cpd-hours"))
        .and(header("authorization", "Bearer tok"))
        .and(body_json(json!({"training_name": "CPR"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "success": true,
            "data": {"id": 31}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (engine, ctx, _) = make_engine(&server, Reachability::Online).await;
    let mut notices = ctx.notifier.subscribe();
    let body = json!({"training_name": "CPR"});
    let headers = json!({"Authorization": "Bearer tok"});
    let id = ctx
        .store
        .enqueue_operation(&NewOperation {
            method: HttpMethod::Post,
            endpoint: "/api/v1/cpd-hours",
            data: Some(&body),
            headers: Some(&headers),
        })
        .await
        .unwrap();

    let report = completed(engine.sync_pending().await.unwrap());

    assert_eq!(report.synced, 1);
    assert_eq!(report.failed, 0);
    assert!(ctx.store.get_operation(id).await.unwrap().is_none());
    assert_eq!(ctx.store.pending_count().await.unwrap(), 0);
    assert_eq!(
        notices.recv().await.unwrap(),
        Notice::SyncSummary {
            synced: 1,
            failed: 0
        }
    );
    assert!(!engine.is_syncing());
}

#[tokio::test]
async fn failing_operation_is_abandoned_after_three_attempts() {
    let server = MockServer::start().await;
    mount_current_user(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/v1/feedback"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(3)
        .mount(&server)
        .await;

    let (engine, ctx, _) = make_engine(&server, Reachability::Online).await;
    let id = ctx
        .store
        .enqueue_operation(&NewOperation {
            method: HttpMethod::Post,
            endpoint: "/api/v1/feedback",
            data: Some(&json!({"title": "x"})),
            headers: None,
        })
        .await
        .unwrap();

    for attempt in 1..=2 {
        let report = completed(engine.sync_pending().await.unwrap());
        assert_eq!(report.retrying, 1);
        assert_eq!(report.failed, 0);
        let op = ctx.store.get_operation(id).await.unwrap().unwrap();
        assert_eq!(op.retry_count, attempt);
        assert_eq!(op.status, OperationStatus::Failed);
    }

    let report = completed(engine.sync_pending().await.unwrap());
    assert_eq!(report.failed, 1);
    assert!(ctx.store.get_operation(id).await.unwrap().is_none());

    let report = completed(engine.sync_pending().await.unwrap());
    assert_eq!(report, SyncReport::default());
}

#[tokio::test]
async fn offline_pass_leaves_queue_untouched() {
    let server = MockServer::start().await;
    let (engine, ctx, _) = make_engine(&server, Reachability::Offline).await;
    let id = ctx
        .store
        .enqueue_operation(&NewOperation {
            method: HttpMethod::Delete,
            endpoint: "/api/v1/work-hours/4",
            data: None,
            headers: None,
        })
        .await
        .unwrap();

    assert_eq!(engine.sync_pending().await.unwrap(), SyncOutcome::Offline);

    let op = ctx.store.get_operation(id).await.unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Pending);
    assert_eq!(op.retry_count, 0);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn trigger_during_a_pass_is_ignored() {
    let server = MockServer::start().await;
    let (engine, _, _) = make_engine(&server, Reachability::Online).await;

    engine.running.store(true, Ordering::SeqCst);
    assert_eq!(
        engine.sync_pending().await.unwrap(),
        SyncOutcome::AlreadyRunning
    );
    assert!(engine.is_syncing());
    engine.running.store(false, Ordering::SeqCst);
}

#[tokio::test]
async fn operation_left_syncing_is_replayed() {
    let server = MockServer::start().await;
    mount_current_user(&server).await;
    Mock::given(method("PUT"))
        .and(path("/api/v1/reflections/3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .expect(1)
        .mount(&server)
        .await;

    let (engine, ctx, _) = make_engine(&server, Reachability::Online).await;
    let id = ctx
        .store
        .enqueue_operation(&NewOperation {
            method: HttpMethod::Put,
            endpoint: "/api/v1/reflections/3",
            data: Some(&json!({"title": "edited"})),
            headers: None,
        })
        .await
        .unwrap();
    ctx.store
        .set_status(id, OperationStatus::Syncing)
        .await
        .unwrap();

    let report = completed(engine.sync_pending().await.unwrap());

    assert_eq!(report.synced, 1);
    assert!(ctx.store.get_operation(id).await.unwrap().is_none());
}

#[tokio::test]
async fn operations_replay_oldest_first() {
    let server = MockServer::start().await;
    mount_current_user(&server).await;
    for (verb, route) in [
        ("POST", "/api/v1/appraisals"),
        ("PATCH", "/api/v1/appraisals/8"),
        ("DELETE", "/api/v1/appraisals/8"),
    ] {
        Mock::given(method(verb))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .mount(&server)
            .await;
    }

    let (engine, ctx, _) = make_engine(&server, Reachability::Online).await;
    for (verb, endpoint) in [
        (HttpMethod::Post, "/api/v1/appraisals"),
        (HttpMethod::Patch, "/api/v1/appraisals/8"),
        (HttpMethod::Delete, "/api/v1/appraisals/8"),
    ] {
        ctx.store
            .enqueue_operation(&NewOperation {
                method: verb,
                endpoint,
                data: None,
                headers: None,
            })
            .await
            .unwrap();
    }

    let report = completed(engine.sync_pending().await.unwrap());
    assert_eq!(report.synced, 3);

    let writes: Vec<String> = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|request| request.method.as_str() != "GET")
        .map(|request| request.method.to_string())
        .collect();
    assert_eq!(writes, vec!["POST", "PATCH", "DELETE"]);
}

#[tokio::test]
async fn queued_get_replays_as_cache_refresh() {
    let server = MockServer::start().await;
    mount_current_user(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/v1/reflections"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": [{"id": 4, "title": "Handover"}]
        })))
        .mount(&server)
        .await;

    let (engine, ctx, _) = make_engine(&server, Reachability::Online).await;
    ctx.store
        .enqueue_operation(&NewOperation {
            method: HttpMethod::Get,
            endpoint: "/api/v1/reflections",
            data: None,
            headers: None,
        })
        .await
        .unwrap();

    let report = completed(engine.sync_pending().await.unwrap());

    assert_eq!(report.synced, 1);
    let cached = ctx
        .store
        .cache_get("/api/v1/reflections")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cached.value["data"][0]["title"], "Handover");
}

#[tokio::test]
async fn embedded_file_post_replays_as_upload() {
    let server = MockServer::start().await;
    mount_current_user(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/v1/documents/upload"))
        .and(body_string_contains("name=\"file\""))
        .and(body_string_contains("scan-bytes"))
        .and(body_string_contains("name=\"category\""))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"success": true})))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("scan.png");
    std::fs::write(&source, b"scan-bytes").unwrap();

    let (engine, ctx, _) = make_engine(&server, Reachability::Online).await;
    let body = json!({
        "file": {"uri": source.to_string_lossy(), "name": "scan.png", "type": "image/png"},
        "category": "certificate"
    });
    ctx.store
        .enqueue_operation(&NewOperation {
            method: HttpMethod::Post,
            endpoint: "/api/v1/documents/upload",
            data: Some(&body),
            headers: None,
        })
        .await
        .unwrap();

    let report = completed(engine.sync_pending().await.unwrap());
    assert_eq!(report.synced, 1);
}

#[tokio::test]
async fn refresh_sweep_respects_cooldown() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/users/me"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": {"id": 1, "subscription_tier": "free"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (engine, ctx, _) = make_engine(&server, Reachability::Online).await;

    let first = completed(engine.sync_pending().await.unwrap());
    let second = completed(engine.sync_pending().await.unwrap());

    assert_eq!(first.refreshed, Some(1));
    assert_eq!(second.refreshed, None);
    assert_eq!(ctx.tier.get(), TierState::FREE);
}

#[tokio::test]
async fn empty_pass_emits_no_summary() {
    let server = MockServer::start().await;
    mount_current_user(&server).await;
    let (engine, ctx, _) = make_engine(&server, Reachability::Online).await;
    let mut notices = ctx.notifier.subscribe();

    completed(engine.sync_pending().await.unwrap());

    assert!(matches!(notices.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn watcher_drains_on_reconnect() {
    let server = MockServer::start().await;
    mount_current_user(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/v1/work-hours"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"success": true})))
        .expect(1)
        .mount(&server)
        .await;

    let (engine, ctx, _) = make_engine(&server, Reachability::Offline).await;
    ctx.store
        .enqueue_operation(&NewOperation {
            method: HttpMethod::Post,
            endpoint: "/api/v1/work-hours",
            data: Some(&json!({"hours": 7})),
            headers: None,
        })
        .await
        .unwrap();

    let handle = Arc::new(engine).spawn_watcher();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(ctx.store.pending_count().await.unwrap(), 1);

    ctx.connectivity.set(Reachability::Online);
    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if ctx.store.pending_count().await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;

    assert!(drained.is_ok());
    handle.abort();
}

#[test]
fn embedded_file_splits_descriptor_from_fields() {
    let body = json!({
        "file": {"uri": "/tmp/a.pdf", "name": "a.pdf", "type": "application/pdf"},
        "title": "Certificate"
    });
    let (file, fields) = embedded_file(Some(&body)).unwrap();
    assert_eq!(file.name, "a.pdf");
    assert_eq!(fields.get("title"), Some(&json!("Certificate")));
    assert!(!fields.contains_key("file"));

    assert!(embedded_file(Some(&json!({"title": "plain"}))).is_none());
    assert!(embedded_file(None).is_none());
}
