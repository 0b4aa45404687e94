//! Broadcast dispatch tests
//!
//! Drives the dispatcher against in-process workers: aggregation, failure
//! reporting, membership changes during a dispatch, and cancellation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use common::RecordingSink;
use pdexec_coord::dispatch::{
    AggregateResult, CommandContext, CommandDispatcher, CommandPayload, CommandRegistry,
    CommandSpec, DispatcherConfig, ExecCommand, ParticipantOutcome, WorkerId, WorkerLink,
    WorkerRegistry, WorkerReply,
};
use pdexec_coord::failure::ExecutionFailure;
use pdexec_coord::protocol::OkReply;
use pdexec_coord::worker::{CommandExecutor, LocalWorker};
use pdexec_coord::error::ErrorCode;
use pdexec_coord::Error;

fn executor() -> Arc<CommandExecutor> {
    Arc::new(CommandExecutor::new(Arc::new(CommandRegistry::with_builtins()), None))
}

fn cluster(names: &[&str], config: DispatcherConfig) -> (CommandDispatcher, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let dispatcher = CommandDispatcher::new(config, Arc::new(WorkerRegistry::new()))
        .with_failure_sink(sink.clone());
    let exec = executor();
    for name in names {
        dispatcher
            .registry()
            .register(WorkerId::from(*name), Arc::new(LocalWorker::new(*name, exec.clone())));
    }
    (dispatcher, sink)
}

/// Never answers
struct Silent;

#[async_trait]
impl WorkerLink for Silent {
    async fn execute(&self, _: Uuid, _: &CommandPayload) -> pdexec_coord::Result<WorkerReply> {
        std::future::pending().await
    }
}

// ─────────────────────────────────────────────────────────────────
// Aggregation
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_three_workers_noop_single_ok() {
    let (dispatcher, sink) = cluster(&["w1", "w2", "w3"], DispatcherConfig::default());

    let result = dispatcher.dispatch(&CommandPayload::new("noop")).await.unwrap();

    assert_eq!(result, AggregateResult::Ok(OkReply {}));
    assert_eq!(sink.len(), 0);
    assert_eq!(dispatcher.stats().succeeded, 1);
}

#[tokio::test]
async fn test_disk_full_on_second_worker() {
    let (dispatcher, sink) = cluster(&["w1", "w2", "w3"], DispatcherConfig::default());
    let command = CommandPayload::with_args("fail", json!({"message": "disk full", "only_on": "w2"}));

    let result = dispatcher.dispatch(&command).await.unwrap();

    let report = match &result {
        AggregateResult::Failed(report) => report,
        other => panic!("expected failure, got {:?}", other),
    };
    assert_eq!(report.len(), 3);
    assert_eq!(
        report.get(&WorkerId::from("w2")),
        Some(&ParticipantOutcome::Failed(ExecutionFailure::new("disk full")))
    );
    let ok: Vec<_> = report.successes().cloned().collect();
    assert_eq!(ok, vec![WorkerId::from("w1"), WorkerId::from("w3")]);

    // Exactly one failure reaches the sink, carrying its message
    assert_eq!(sink.workers(), vec![WorkerId::from("w2")]);
    assert!(report.summary().contains("disk full"));

    // Failed workers stay registered by default
    assert_eq!(dispatcher.registry().count(), 3);

    // A single failing worker surfaces as its own failure
    let err = result.into_result("fail").unwrap_err();
    assert!(matches!(&err, Error::ExecutionFailed(f) if f.message() == "disk full"));
    assert_eq!(err.code(), ErrorCode::ExecutionFailed);
}

#[tokio::test]
async fn test_unknown_kind_fails_everywhere() {
    let (dispatcher, sink) = cluster(&["w1", "w2"], DispatcherConfig::default());

    let result = dispatcher.dispatch(&CommandPayload::new("reticulate")).await.unwrap();

    let report = result.report().expect("report");
    for (_, outcome) in report.outcomes.iter() {
        assert!(outcome.reason().unwrap().contains("reticulate"));
    }
    assert_eq!(sink.len(), 2);
}

#[tokio::test]
async fn test_no_workers_available() {
    let (dispatcher, _sink) = cluster(&[], DispatcherConfig::default());

    let err = dispatcher.dispatch(&CommandPayload::new("noop")).await.unwrap_err();

    assert!(matches!(err, Error::NoWorkersAvailable { ref kind } if kind == "noop"));
    assert_eq!(dispatcher.stats().no_workers, 1);
}

// ─────────────────────────────────────────────────────────────────
// Panics
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct Explode {}

#[async_trait]
impl ExecCommand for Explode {
    fn kind(&self) -> &str {
        Self::KIND
    }

    async fn execute(&self, ctx: &CommandContext) -> anyhow::Result<()> {
        if ctx.worker_id.as_str() == "w1" {
            panic!("bad sector");
        }
        Ok(())
    }
}

impl CommandSpec for Explode {
    const KIND: &'static str = "explode";
}

#[tokio::test]
async fn test_panic_becomes_failure() {
    let mut registry = CommandRegistry::with_builtins();
    registry.register::<Explode>();
    let exec = Arc::new(CommandExecutor::new(Arc::new(registry), None));

    let dispatcher = CommandDispatcher::new(DispatcherConfig::default(), Arc::new(WorkerRegistry::new()));
    for name in ["w1", "w2"] {
        dispatcher
            .registry()
            .register(WorkerId::from(name), Arc::new(LocalWorker::new(name, exec.clone())));
    }

    let result = dispatcher.dispatch(&CommandPayload::new("explode")).await.unwrap();

    let report = result.report().expect("report");
    assert_eq!(
        report.get(&WorkerId::from("w1")),
        Some(&ParticipantOutcome::Failed(ExecutionFailure::new(
            "command panicked: bad sector"
        )))
    );
    assert_eq!(report.get(&WorkerId::from("w2")), Some(&ParticipantOutcome::Succeeded));
    assert_eq!(exec.stats().panicked, 1);
}

// ─────────────────────────────────────────────────────────────────
// Membership Changes
// ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_joiner_is_not_part_of_running_dispatch() {
    let (dispatcher, _sink) = cluster(&["w1", "w2", "w3"], DispatcherConfig::default());
    let command = CommandPayload::with_args("sleep", json!({"millis": 100}));

    // A silent joiner would time the dispatch out if it were included
    let join_late = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        dispatcher.registry().register(WorkerId::from("w4"), Arc::new(Silent));
    };
    let (result, ()) = tokio::join!(dispatcher.dispatch(&command), join_late);

    assert_eq!(result.unwrap(), AggregateResult::Ok(OkReply {}));
    assert_eq!(dispatcher.registry().count(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_departure_mid_dispatch_is_unreachable() {
    let (dispatcher, sink) = cluster(&["w1", "w3"], DispatcherConfig {
        participant_timeout: None,
        ..Default::default()
    });
    dispatcher.registry().register(WorkerId::from("w2"), Arc::new(Silent));

    let leave = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        dispatcher.registry().deregister(&WorkerId::from("w2"));
    };
    let payload = CommandPayload::new("noop");
    let (result, ()) = tokio::join!(dispatcher.dispatch(&payload), leave);

    let result = result.unwrap();
    let report = result.report().expect("report");
    assert!(matches!(
        report.get(&WorkerId::from("w2")),
        Some(ParticipantOutcome::Unreachable { .. })
    ));
    assert_eq!(report.successes().count(), 2);
    assert_eq!(sink.workers(), vec![WorkerId::from("w2")]);
}

#[tokio::test(start_paused = true)]
async fn test_silent_worker_times_out_and_is_evicted() {
    let (dispatcher, _sink) = cluster(&["w1"], DispatcherConfig {
        participant_timeout: Some(Duration::from_secs(5)),
        ..Default::default()
    });
    dispatcher.registry().register(WorkerId::from("w2"), Arc::new(Silent));

    let result = dispatcher.dispatch(&CommandPayload::new("noop")).await.unwrap();

    let report = result.report().expect("report");
    assert_eq!(
        report.get(&WorkerId::from("w2")),
        Some(&ParticipantOutcome::TimedOut { after_ms: 5000 })
    );
    assert_eq!(dispatcher.registry().ids(), vec![WorkerId::from("w1")]);
    assert_eq!(dispatcher.stats().evictions, 1);
}

// ─────────────────────────────────────────────────────────────────
// Cancellation
// ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_cancelled_dispatch_reports_pending_workers() {
    let (dispatcher, sink) = cluster(&["w1", "w2"], DispatcherConfig::default());
    let command = CommandPayload::with_args("sleep", json!({"millis": 10_000}));

    let result = dispatcher
        .dispatch_until(&command, tokio::time::sleep(Duration::from_millis(50)))
        .await
        .unwrap();

    let report = match &result {
        AggregateResult::Cancelled(report) => report,
        other => panic!("expected cancellation, got {:?}", other),
    };
    assert!(report
        .outcomes
        .values()
        .all(|o| *o == ParticipantOutcome::Cancelled));
    // Cancellation is not a worker failure
    assert_eq!(sink.len(), 0);
    assert_eq!(dispatcher.registry().count(), 2);
    assert!(matches!(
        result.into_result("sleep"),
        Err(Error::DispatchCancelled { .. })
    ));
}
