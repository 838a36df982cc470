use chrono::Duration as ChronoDuration;
use hive_devkit::{spec, ScenarioBuilder, TestHarness};
use hive_kernel::aggregator::replay;
use hive_kernel::health::HealthMonitor;
use hive_kernel::{Aggregator, ParticipantStatus, Role, SharedBus, SnapshotBuilder, TaskStatus};

fn run_log(origin: chrono::DateTime<chrono::Utc>) -> ScenarioBuilder {
    ScenarioBuilder::new(origin)
        .leader_claim(1, 0, "lead")
        .announce(2, 1, "lead", Role::Leader, &[])
        .announce(3, 1, "w1", Role::Worker, &["backend"])
        .announce(4, 2, "w2", Role::Worker, &[])
        .publish(5, 5, "lead", vec![spec("task-1", &["backend"]), spec("task-2", &[])])
        .claim(6, 6, "w1", "task-1")
        .claim(7, 7, "w2", "task-2")
        .progress(8, 20, "w1", "task-1", 50, TaskStatus::InProgress)
        .progress(9, 30, "w2", "task-2", 100, TaskStatus::Completed)
        .heartbeat(10, 31, "w2", ParticipantStatus::Completed)
}

#[test]
fn snapshot_of_a_run_in_flight() {
    let log = run_log(chrono::Utc::now());
    let now = log.at(325);
    let snap = replay(&log.messages(), now, &HealthMonitor::default());

    assert_eq!(snap.as_of.value(), 10);
    assert_eq!(snap.messages, 10);
    assert_eq!(snap.generated_at, now);
    assert_eq!(snap.leader.as_deref(), Some("lead"));
    assert_eq!(snap.counts.in_progress, 1);
    assert_eq!(snap.counts.completed, 1);
    assert_eq!(snap.progress_percent, 75);

    let w1 = &snap.participants["w1"];
    assert!(w1.stale);
    assert_eq!(w1.status, ParticipantStatus::Stale);
    assert_eq!(w1.skills, vec!["backend".to_string()]);
    assert_eq!(w1.current_task.as_ref().map(|t| t.progress_percent), Some(50));

    // w2 posted its final status before leaving
    let w2 = &snap.participants["w2"];
    assert!(!w2.stale);
    assert!(w2.departed);
    assert_eq!(w2.status, ParticipantStatus::Completed);
    assert_eq!(w2.last_heartbeat_position.map(|p| p.value()), Some(10));

    let stale: Vec<&str> = snap.stale_participants().map(|p| p.id.as_str()).collect();
    assert_eq!(stale, vec!["lead", "w1"]);
    assert_eq!(snap.task("task-1").unwrap().assignee.as_deref(), Some("w1"));
}

#[test]
fn snapshot_serializes_for_consumers() {
    let log = run_log(chrono::Utc::now());
    let snap = replay(&log.messages(), log.at(40), &HealthMonitor::default());
    let json = serde_json::to_value(&snap).unwrap();
    assert_eq!(json["asOf"], 10);
    assert_eq!(json["counts"]["inProgress"], 1);
    assert_eq!(json["participants"]["w2"]["departed"], true);
    assert_eq!(json["tasks"][0]["id"], "task-1");
}

#[test]
fn replay_is_idempotent_and_matches_incremental_folding() {
    let log = run_log(chrono::Utc::now());
    let messages = log.messages();
    let now = log.at(60);
    let monitor = HealthMonitor::default();
    assert_eq!(replay(&messages, now, &monitor), replay(&messages, now, &monitor));

    let mut builder = SnapshotBuilder::new();
    builder.extend(&messages[..4]);
    assert_eq!(builder.checkpoint().value(), 4);
    builder.extend(&messages[4..]);
    // already folded entries are ignored
    builder.extend(&messages[2..6]);
    assert_eq!(builder.build(now, &monitor), replay(&messages, now, &monitor));
}

#[tokio::test(start_paused = true)]
async fn refresh_pushes_to_subscribers() {
    let harness = TestHarness::new();
    run_log(harness.clock.now()).into_bus(&harness.bus).unwrap();
    let bus: SharedBus = harness.shared_bus();
    let aggregator = Aggregator::new(bus, harness.clock.clone(), HealthMonitor::default());
    let hub = aggregator.hub();
    let mut rx = hub.subscribe();
    assert_eq!(hub.fetch().messages, 0);

    aggregator.refresh().await.unwrap();
    rx.changed().await.unwrap();
    let pushed = rx.borrow_and_update().clone();
    assert_eq!(pushed.as_of.value(), 10);
    assert_eq!(hub.fetch().as_of, pushed.as_of);
}

#[tokio::test(start_paused = true)]
async fn incremental_mode_catches_entries_surfacing_below_checkpoint() {
    let harness = TestHarness::new();
    let origin = harness.clock.now();
    ScenarioBuilder::new(origin)
        .publish(1, 0, "lead", vec![spec("task-1", &[])])
        .claim(9, 2, "w2", "task-1")
        .into_bus(&harness.bus)
        .unwrap();

    let full = Aggregator::new(harness.shared_bus(), harness.clock.clone(), HealthMonitor::default());
    let incremental = Aggregator::new(harness.shared_bus(), harness.clock.clone(), HealthMonitor::default())
        .incremental(true);
    assert_eq!(full.refresh().await.unwrap().task("task-1").unwrap().assignee.as_deref(), Some("w2"));
    assert_eq!(incremental.refresh().await.unwrap().task("task-1").unwrap().assignee.as_deref(), Some("w2"));

    // an earlier claim becomes visible late
    harness
        .bus
        .insert_at(
            hive_kernel::LogPosition(5),
            origin + ChronoDuration::seconds(1),
            "w1",
            &hive_kernel::MessageBody::TaskClaim(hive_kernel::message::TaskClaim {
                task_id: "task-1".into(),
                participant_id: "w1".into(),
                observed_at: origin,
            }),
        )
        .unwrap();

    let expected = full.refresh().await.unwrap();
    assert_eq!(expected.task("task-1").unwrap().assignee.as_deref(), Some("w1"));
    let inc = incremental.refresh().await.unwrap();
    assert_eq!(inc, expected);
    assert_eq!(inc.messages, 3);

    // nothing new: the folded state is kept as is
    assert_eq!(incremental.refresh().await.unwrap(), expected);
}
