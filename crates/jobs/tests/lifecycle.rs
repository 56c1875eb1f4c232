// crates/jobs/tests/lifecycle.rs
//! End-to-end lifecycle scenarios: submit through the processor, observe the
//! record through the store and the push channel together.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map};
use tokio::sync::mpsc::UnboundedReceiver;

use beacon_jobs::{HandlerRegistry, JobProcessor, JobStatus, JobStore, JobsConfig};
use beacon_notify::{
    ConnectionRegistry, Notification, NotificationKind, Notifier, NotifyConfig, OwnerId,
};

struct TestApp {
    store: Arc<JobStore>,
    processor: JobProcessor,
    connections: Arc<ConnectionRegistry>,
}

fn test_app(wire: impl FnOnce(&mut HandlerRegistry)) -> TestApp {
    test_app_with(JobsConfig::default(), wire)
}

fn test_app_with(config: JobsConfig, wire: impl FnOnce(&mut HandlerRegistry)) -> TestApp {
    let store = Arc::new(JobStore::new(config.clone()));
    let mut handlers = HandlerRegistry::new();
    wire(&mut handlers);
    let connections = Arc::new(ConnectionRegistry::new(NotifyConfig::default()));
    let processor = JobProcessor::new(
        Arc::clone(&store),
        Arc::new(handlers),
        Notifier::new(Arc::clone(&connections)),
        &config,
    );
    TestApp {
        store,
        processor,
        connections,
    }
}

async fn subscribe(app: &TestApp, owner: OwnerId) -> UnboundedReceiver<Notification> {
    let (_id, mut rx) = app.connections.open_channel(Some(owner), Vec::new());
    let ack = rx.recv().await.expect("connected ack");
    assert_eq!(ack.kind, NotificationKind::Connected);
    rx
}

async fn next(rx: &mut UnboundedReceiver<Notification>) -> Notification {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for notification")
        .expect("channel closed")
}

#[tokio::test]
async fn test_export_job_full_lifecycle() {
    let app = test_app(|handlers| {
        handlers.register_async("export", |ctx| async move {
            ctx.progress.report(20, "loading rows");
            ctx.progress.report(50, "rendering");
            ctx.progress.report(90, "uploading");
            Ok(json!({ "url": "/x.csv" }))
        });
    });
    let mut rx = subscribe(&app, 7).await;

    let mut metadata = Map::new();
    metadata.insert("format".to_string(), json!("csv"));
    let id = app.processor.submit("export", 7, metadata);

    // The record is visible to polling immediately, before execution.
    let pending = app.store.get(id).expect("record exists at submit time");
    assert!(matches!(
        pending.status,
        JobStatus::Pending | JobStatus::Running | JobStatus::Completed
    ));

    let started = next(&mut rx).await;
    assert_eq!(started.kind, NotificationKind::JobStarted);
    assert_eq!(started.payload["jobId"], id);
    assert_eq!(started.payload["jobType"], "export");

    for (pct, msg) in [(20, "loading rows"), (50, "rendering"), (90, "uploading")] {
        let progress = next(&mut rx).await;
        assert_eq!(progress.kind, NotificationKind::JobProgress);
        assert_eq!(progress.payload["progress"], pct);
        assert_eq!(progress.payload["message"], msg);
    }

    let completed = next(&mut rx).await;
    assert_eq!(completed.kind, NotificationKind::JobCompleted);
    assert_eq!(completed.payload["result"], json!({ "url": "/x.csv" }));

    let job = app.store.get(id).expect("completed record retained");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    assert_eq!(job.result, Some(json!({ "url": "/x.csv" })));
    assert!(job.completed_at.is_some());
}

#[tokio::test]
async fn test_failure_and_cancellation_are_isolated_per_job() {
    let app = test_app(|handlers| {
        handlers.register_async("flaky", |_ctx| async move {
            Err(anyhow::anyhow!("upstream returned 503"))
        });
        handlers.register_async("slow", |_ctx| async move {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(json!(null))
        });
    });
    let mut rx = subscribe(&app, 7).await;

    let failing = app.processor.submit("flaky", 7, Map::new());
    assert_eq!(next(&mut rx).await.kind, NotificationKind::JobStarted);
    let failed = next(&mut rx).await;
    assert_eq!(failed.kind, NotificationKind::JobFailed);
    assert_eq!(failed.payload["error"], "upstream returned 503");

    let slow = app.processor.submit("slow", 7, Map::new());
    assert_eq!(next(&mut rx).await.kind, NotificationKind::JobStarted);
    assert!(app.processor.cancel(slow));
    assert_eq!(next(&mut rx).await.kind, NotificationKind::JobCancelled);

    assert_eq!(app.store.get(failing).unwrap().status, JobStatus::Failed);
    assert_eq!(app.store.get(slow).unwrap().status, JobStatus::Cancelled);

    let stats = app.store.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.cancelled, 1);
    assert_eq!(app.processor.active_count(), 0);
}

#[tokio::test]
async fn test_notifications_stop_after_disconnect() {
    let app = test_app(|handlers| {
        handlers.register_async("export", |_ctx| async move { Ok(json!(null)) });
    });

    let (conn, mut rx) = app.connections.open_channel(Some(7), Vec::new());
    assert_eq!(next(&mut rx).await.kind, NotificationKind::Connected);
    assert!(app.connections.disconnect(conn));

    let id = app.processor.submit("export", 7, Map::new());
    // Delivery is best effort: the job still runs to completion with no
    // sink attached.
    loop {
        let job = app.store.get(id).unwrap();
        if job.status.is_terminal() {
            assert_eq!(job.status, JobStatus::Completed);
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_recent_history_survives_offline_owner() {
    let app = test_app(|handlers| {
        handlers.register_async("export", |ctx| async move {
            ctx.progress.report(60, "rendering");
            Ok(json!({ "url": "/y.csv" }))
        });
    });

    // No connection at all for owner 9; events land in history only.
    let id = app.processor.submit("export", 9, Map::new());
    loop {
        if app.store.get(id).unwrap().status.is_terminal() {
            break;
        }
        tokio::task::yield_now().await;
    }

    let recent = app.connections.recent_for_owner(9);
    let kinds: Vec<NotificationKind> = recent.iter().map(|n| n.kind).collect();
    assert_eq!(
        kinds,
        vec![
            NotificationKind::JobCompleted,
            NotificationKind::JobProgress,
            NotificationKind::JobStarted,
        ],
        "newest first"
    );
}

#[tokio::test]
async fn test_owner_channels_do_not_cross() {
    let app = test_app(|handlers| {
        handlers.register_async("export", |_ctx| async move { Ok(json!(null)) });
    });
    let mut rx_seven = subscribe(&app, 7).await;
    let mut rx_eight = subscribe(&app, 8).await;

    app.processor.submit("export", 7, Map::new());
    assert_eq!(next(&mut rx_seven).await.kind, NotificationKind::JobStarted);
    assert_eq!(
        next(&mut rx_seven).await.kind,
        NotificationKind::JobCompleted
    );
    assert!(rx_eight.try_recv().is_err(), "owner 8 saw owner 7's events");
}

#[tokio::test]
async fn test_poll_and_push_agree_on_the_terminal_record() {
    let app = test_app(|handlers| {
        handlers.register_blocking("train", |ctx| {
            ctx.progress.report(45, "fitting model");
            Ok(json!({ "accuracy": 0.91 }))
        });
    });
    let mut rx = subscribe(&app, 7).await;

    let id = app.processor.submit("train", 7, Map::new());
    assert_eq!(next(&mut rx).await.kind, NotificationKind::JobStarted);
    let progress = next(&mut rx).await;
    assert_eq!(progress.kind, NotificationKind::JobProgress);
    assert_eq!(progress.payload["progress"], 45);
    let completed = next(&mut rx).await;
    assert_eq!(completed.kind, NotificationKind::JobCompleted);

    // The push event is emitted only after the store transition, so a poll
    // issued on receipt observes the same terminal state.
    let job = app.store.get(id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(completed.payload["result"], job.result.unwrap());
}

#[tokio::test]
async fn test_eviction_under_sustained_load() {
    let app = test_app_with(
        JobsConfig {
            max_tracked_jobs: 3,
            ..JobsConfig::default()
        },
        |handlers| {
            handlers.register_async("export", |_ctx| async move { Ok(json!(null)) });
        },
    );
    let mut rx = subscribe(&app, 7).await;

    let mut ids = Vec::new();
    for _ in 0..6 {
        let id = app.processor.submit("export", 7, Map::new());
        assert_eq!(next(&mut rx).await.kind, NotificationKind::JobStarted);
        assert_eq!(next(&mut rx).await.kind, NotificationKind::JobCompleted);
        ids.push(id);
    }

    let stats = app.store.stats();
    assert_eq!(stats.total, 3, "retention stays at the configured cap");
    // Oldest terminal records went first; the newest three remain.
    for id in &ids[..3] {
        assert!(app.store.get(*id).is_none());
    }
    for id in &ids[3..] {
        assert!(app.store.get(*id).is_some());
    }
}

#[tokio::test]
async fn test_room_fanout_is_isolated_from_job_events() {
    let app = test_app(|handlers| {
        handlers.register_async("export", |_ctx| async move { Ok(json!(null)) });
    });
    let (_a, mut rx_analytics) = app
        .connections
        .open_channel(Some(7), vec!["analytics".to_string()]);
    let (_b, mut rx_billing) = app
        .connections
        .open_channel(Some(8), vec!["billing".to_string()]);
    assert_eq!(next(&mut rx_analytics).await.kind, NotificationKind::Connected);
    assert_eq!(next(&mut rx_billing).await.kind, NotificationKind::Connected);

    let notifier = Notifier::new(Arc::clone(&app.connections));
    notifier.info_room("analytics", "nightly rollup finished");
    let info = next(&mut rx_analytics).await;
    assert_eq!(info.kind, NotificationKind::Info);
    assert!(rx_billing.try_recv().is_err(), "room message crossed rooms");

    // Job events route by owner, independent of room membership.
    app.processor.submit("export", 7, Map::new());
    assert_eq!(next(&mut rx_analytics).await.kind, NotificationKind::JobStarted);
    assert_eq!(
        next(&mut rx_analytics).await.kind,
        NotificationKind::JobCompleted
    );
    assert!(rx_billing.try_recv().is_err());
}

#[tokio::test]
async fn test_dead_sink_is_cleaned_up_by_job_fanout() {
    let app = test_app(|handlers| {
        handlers.register_async("export", |_ctx| async move { Ok(json!(null)) });
    });

    let (_id, rx) = app.connections.open_channel(Some(7), Vec::new());
    assert_eq!(app.connections.stats().total, 1);
    drop(rx);

    let id = app.processor.submit("export", 7, Map::new());
    loop {
        if app.store.get(id).unwrap().status.is_terminal() {
            break;
        }
        tokio::task::yield_now().await;
    }

    // The first lifecycle send hit the dropped receiver and retired it.
    assert_eq!(app.connections.stats().total, 0);
}

#[tokio::test]
async fn test_listing_by_owner_after_a_batch() {
    let app = test_app(|handlers| {
        handlers.register_async("export", |_ctx| async move { Ok(json!(null)) });
    });
    let mut rx = subscribe(&app, 7).await;

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(app.processor.submit("export", 7, Map::new()));
    }
    let mut completed = 0;
    while completed < 3 {
        if next(&mut rx).await.kind == NotificationKind::JobCompleted {
            completed += 1;
        }
    }

    let listed = app.store.list_by_owner(7, None);
    assert_eq!(listed.len(), 3);
    let mut expected = ids.clone();
    expected.reverse();
    let got: Vec<u64> = listed.iter().map(|j| j.id).collect();
    assert_eq!(got, expected, "newest first");
    assert!(app
        .store
        .list_by_owner(7, Some(JobStatus::Running))
        .is_empty());
}
