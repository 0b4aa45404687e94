//! End-to-end tests over WebSocket
//!
//! A real coordinator on an ephemeral port, real worker clients, and client
//! sessions speaking the wire protocol.

mod common;

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use common::TestServer;
use pdexec_coord::client::ClientSession;
use pdexec_coord::dispatch::{
    AggregateResult, CommandPayload, DispatcherConfig, ParticipantOutcome, WorkerId,
};
use pdexec_coord::failure::ExecutionFailure;
use pdexec_coord::lock::{LockCoordinatorConfig, LockKey};
use pdexec_coord::protocol::{InitCommandResponse, LockRequest, Message, MessageEnvelope, OkReply};
use pdexec_coord::Error;

fn short_leases() -> LockCoordinatorConfig {
    LockCoordinatorConfig {
        lease: Some(Duration::from_millis(500)),
        reap_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

// ─────────────────────────────────────────────────────────────────
// Dispatch
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_broadcast_noop_to_three_workers() {
    let server = TestServer::start().await;
    let _w1 = server.spawn_worker("w1").await;
    let _w2 = server.spawn_worker("w2").await;
    let _w3 = server.spawn_worker("w3").await;

    let mut client = ClientSession::connect(&server.url()).await.unwrap();
    let result = client.submit(CommandPayload::new("noop")).await.unwrap();

    assert_eq!(result, AggregateResult::Ok(OkReply {}));
    client.close().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_disk_full_failure_travels_back() {
    let server = TestServer::start().await;
    let _w1 = server.spawn_worker("w1").await;
    let _w2 = server.spawn_worker("w2").await;
    let _w3 = server.spawn_worker("w3").await;

    let mut client = ClientSession::connect(&server.url()).await.unwrap();
    let result = client
        .submit(CommandPayload::with_args(
            "fail",
            json!({"message": "disk full", "only_on": "w2"}),
        ))
        .await
        .unwrap();

    let report = result.report().expect("failed dispatch carries a report");
    assert_eq!(
        report.get(&WorkerId::from("w2")),
        Some(&ParticipantOutcome::Failed(ExecutionFailure::new("disk full")))
    );
    assert_eq!(report.successes().count(), 2);
    assert_eq!(server.sink.workers(), vec![WorkerId::from("w2")]);

    let err = client
        .submit_ok(CommandPayload::with_args(
            "fail",
            json!({"message": "disk full", "only_on": "w2"}),
        ))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("disk full"));
}

#[tokio::test]
async fn test_submit_without_workers() {
    let server = TestServer::start().await;
    let mut client = ClientSession::connect(&server.url()).await.unwrap();

    let err = client.submit(CommandPayload::new("noop")).await.unwrap_err();

    assert!(matches!(err, Error::NoWorkersAvailable { .. }));
}

#[tokio::test]
async fn test_worker_disconnect_mid_dispatch() {
    let server = TestServer::start().await;
    let _w1 = server.spawn_worker("w1").await;
    let w2 = server.spawn_worker("w2").await;

    let url = server.url();
    let submit = tokio::spawn(async move {
        let mut client = ClientSession::connect(&url).await.unwrap();
        client
            .submit(CommandPayload::with_args("sleep", json!({"millis": 500})))
            .await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    w2.shutdown().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), submit)
        .await
        .expect("dispatch must resolve after the worker leaves")
        .unwrap()
        .unwrap();

    let report = result.report().expect("report");
    assert!(matches!(
        report.get(&WorkerId::from("w2")),
        Some(ParticipantOutcome::Unreachable { .. })
    ));
    assert_eq!(report.get(&WorkerId::from("w1")), Some(&ParticipantOutcome::Succeeded));
    server.wait_for_workers(1).await;
}

#[tokio::test]
async fn test_same_name_workers_get_distinct_ids() {
    let server = TestServer::start().await;
    let first = server.spawn_worker("w1").await;
    let _second = server.spawn_worker("w1").await;

    let ids = server.dispatcher.registry().ids();
    assert_eq!(ids.len(), 2);
    assert_eq!(ids[0], WorkerId::from("w1"));
    assert!(ids[1].as_str().starts_with("w1-"));

    // Teardown of the first session must not touch the second entry
    first.shutdown().await.unwrap();
    server.wait_for_workers(1).await;
    let left = server.dispatcher.registry().ids();
    assert!(left[0].as_str().starts_with("w1-"));
}

// ─────────────────────────────────────────────────────────────────
// Worker Count and Init Command
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_worker_count() {
    let server = TestServer::start().await;
    let mut client = ClientSession::connect(&server.url()).await.unwrap();
    assert_eq!(client.worker_count().await.unwrap(), 0);

    let _w1 = server.spawn_worker("w1").await;
    let _w2 = server.spawn_worker("w2").await;

    assert_eq!(client.worker_count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_first_init_command_wins() {
    let server = TestServer::start().await;
    let _w1 = server.spawn_worker("w1").await;
    let mut client = ClientSession::connect(&server.url()).await.unwrap();

    let first = client.submit_init(CommandPayload::new("noop")).await.unwrap();
    assert_eq!(first, InitCommandResponse { applied: true, workers: 1 });

    let second = client
        .submit_init(CommandPayload::with_args("fail", json!({"message": "too late"})))
        .await
        .unwrap();
    assert!(!second.applied);

    // A worker joining now runs the kept init command, not the rejected one
    let _w2 = server.spawn_worker("w2").await;
    assert_eq!(client.worker_count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_failed_init_keeps_worker_out() {
    let server = TestServer::start().await;
    let mut client = ClientSession::connect(&server.url()).await.unwrap();

    let installed = client
        .submit_init(CommandPayload::with_args(
            "fail",
            json!({"message": "no scratch space", "only_on": "late"}),
        ))
        .await
        .unwrap();
    assert_eq!(installed, InitCommandResponse { applied: true, workers: 0 });

    let _early = server.spawn_worker("early").await;
    let _late = server.start_worker("late");
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(server.dispatcher.registry().ids(), vec![WorkerId::from("early")]);
    let result = client.submit(CommandPayload::new("noop")).await.unwrap();
    assert!(result.is_ok());
}

// ─────────────────────────────────────────────────────────────────
// Locks
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_busy_holder_keeps_lock_past_lease() {
    let server = TestServer::start_with(short_leases(), DispatcherConfig::default()).await;
    let _w1 = server.spawn_worker("w1").await;
    let mut a = ClientSession::connect(&server.url()).await.unwrap();
    let mut b = ClientSession::connect(&server.url()).await.unwrap();
    a.lock(Some("K")).await.unwrap();

    // The dispatch runs three times longer than the lease
    let busy = tokio::spawn(async move {
        let result = a
            .submit_ok(CommandPayload::with_args("sleep", json!({"millis": 1500})))
            .await;
        (a, result)
    });

    let until = tokio::time::Instant::now() + Duration::from_millis(1200);
    while tokio::time::Instant::now() < until {
        assert!(
            b.try_lock(Some("K")).await.unwrap().is_none(),
            "lock was reclaimed from a connected holder"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let (mut a, result) = busy.await.unwrap();
    result.unwrap();
    let released = a.unlock(Some("K")).await.unwrap();
    assert!(!released.handed_off);
}

#[tokio::test]
async fn test_silent_holder_loses_lock() {
    let server = TestServer::start_with(short_leases(), DispatcherConfig::default()).await;
    let mut a = ClientSession::connect(&server.url()).await.unwrap();
    let mut b = ClientSession::connect(&server.url()).await.unwrap();
    a.lock(Some("K")).await.unwrap();

    // `a` stops reading, so the server's pings go unanswered
    let granted = tokio::time::timeout(Duration::from_secs(5), b.lock(Some("K")))
        .await
        .expect("lease of an unresponsive holder should expire")
        .unwrap();

    assert_eq!(granted.key, "K");
    assert_eq!(
        server.locks.holder(&LockKey::from("K")).map(|r| r.to_string()),
        Some(b.session_id().to_string())
    );
    drop(a);
}

#[tokio::test]
async fn test_lock_hand_off_between_sessions() {
    let server = TestServer::start().await;
    let mut a = ClientSession::connect(&server.url()).await.unwrap();
    let mut b = ClientSession::connect(&server.url()).await.unwrap();

    a.lock(Some("K")).await.unwrap();
    assert!(b.try_lock(Some("K")).await.unwrap().is_none());

    let waiting = tokio::spawn(async move {
        let granted = b.lock(Some("K")).await;
        (b, granted)
    });
    let key = LockKey::from("K");
    while server.locks.queue_len(&key) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let released = a.unlock(Some("K")).await.unwrap();
    assert!(released.handed_off);

    let (mut b, granted) = waiting.await.unwrap();
    assert_eq!(granted.unwrap().key, "K");
    b.renew(Some("K")).await.unwrap();
    b.unlock(Some("K")).await.unwrap();
}

#[tokio::test]
async fn test_unlock_by_non_holder_is_rejected() {
    let server = TestServer::start().await;
    let mut a = ClientSession::connect(&server.url()).await.unwrap();
    let mut b = ClientSession::connect(&server.url()).await.unwrap();
    a.lock(None).await.unwrap();

    let err = b.unlock(None).await.unwrap_err();

    match err {
        Error::Remote { code, .. } => assert_eq!(code, "E500"),
        other => panic!("expected remote NotHolder, got {:?}", other),
    }
    assert_eq!(
        server.locks.holder(&LockKey::default()).map(|r| r.to_string()),
        Some(a.session_id().to_string())
    );
}

#[tokio::test]
async fn test_disconnect_releases_locks() {
    let server = TestServer::start().await;
    let mut a = ClientSession::connect(&server.url()).await.unwrap();
    let mut b = ClientSession::connect(&server.url()).await.unwrap();
    a.lock(Some("K")).await.unwrap();

    a.close().await.unwrap();

    let granted = tokio::time::timeout(Duration::from_secs(5), b.lock(Some("K")))
        .await
        .expect("lock should be released when its holder disconnects")
        .unwrap();
    assert_eq!(granted.key, "K");
}

// ─────────────────────────────────────────────────────────────────
// Protocol
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_request_before_hello_is_rejected() {
    let server = TestServer::start().await;
    let (mut ws, _) = connect_async(server.url()).await.unwrap();

    let request = MessageEnvelope::new(Message::LockRequest(LockRequest::default()));
    ws.send(WsMessage::Text(request.to_json().unwrap())).await.unwrap();

    let reply = loop {
        match ws.next().await {
            Some(Ok(WsMessage::Text(text))) => break MessageEnvelope::from_json(&text).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("expected an error reply, got {:?}", other),
        }
    };
    match reply.payload {
        Message::Error(err) => assert!(err.fatal),
        other => panic!("expected ERROR, got {}", other.type_name()),
    }
}
