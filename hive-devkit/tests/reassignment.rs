use hive_devkit::{spec, ScenarioBuilder, TestHarness};
use hive_kernel::health::HealthMonitor;
use hive_kernel::message::PublishReason;
use hive_kernel::reassign::ReassignmentController;
use hive_kernel::tasks::TaskDistributor;
use hive_kernel::{Role, TaskStatus};
use std::time::Duration;

/// lead publie task-1 et task-2 ; w1 prend task-1, w2 prend task-2, tout à t=0.
fn seeded(harness: &TestHarness) {
    ScenarioBuilder::new(harness.clock.now())
        .leader_claim(1, 0, "lead")
        .publish(2, 0, "lead", vec![spec("task-1", &[]), spec("task-2", &[])])
        .claim(3, 0, "w1", "task-1")
        .claim(4, 0, "w2", "task-2")
        .progress(5, 0, "w1", "task-1", 30, TaskStatus::InProgress)
        .into_bus(&harness.bus)
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn silence_beyond_threshold_triggers_republication() {
    let harness = TestHarness::new();
    seeded(&harness);
    let lead = harness.candidate("lead").into_context(Role::Leader);
    let w2 = harness.candidate("w2").into_context(Role::Worker);
    let controller = ReassignmentController::default();
    let monitor = HealthMonitor::default();
    let distributor = TaskDistributor::default();

    // exactly at the threshold nobody is stale yet
    tokio::time::advance(Duration::from_secs(300)).await;
    let report = controller.sweep(&lead, &monitor, &distributor).await.unwrap();
    assert!(report.stale.is_empty());
    assert!(report.republished.is_empty());

    // w2 speaks up, w1 stays silent
    w2.append(&hive_kernel::MessageBody::Heartbeat(hive_kernel::message::StatusReport::new(
        hive_kernel::ParticipantStatus::InProgress,
        Role::Worker,
    )))
    .await
    .unwrap();

    tokio::time::advance(Duration::from_secs(1)).await;
    let report = controller.sweep(&lead, &monitor, &distributor).await.unwrap();
    assert!(report.stale.contains("w1"));
    assert!(!report.stale.contains("w2"));
    assert_eq!(report.republished.len(), 1);
    assert_eq!(report.republished[0].task.id, "task-1");
    assert_eq!(
        report.republished[0].reason,
        PublishReason::Reassigned { previous_assignee: "w1".into() }
    );

    let board = harness.board().await;
    let task = board.get("task-1").unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.assignee, None);
    assert_eq!(task.attempts, 2);
    assert_eq!(board.assignee("task-2"), Some("w2"));

    // a pending task is left alone
    let again = controller.sweep(&lead, &monitor, &distributor).await.unwrap();
    assert!(again.republished.is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_tasks_are_retried_until_the_cap() {
    let harness = TestHarness::new();
    ScenarioBuilder::new(harness.clock.now())
        .publish(1, 0, "lead", vec![spec("task-1", &[])])
        .claim(2, 0, "w1", "task-1")
        .progress(3, 0, "w1", "task-1", 10, TaskStatus::Failed)
        .into_bus(&harness.bus)
        .unwrap();
    let lead = harness.candidate("lead").into_context(Role::Leader);
    let controller = ReassignmentController::new(2);
    let monitor = HealthMonitor::default();
    let distributor = TaskDistributor::default();

    let report = controller.sweep(&lead, &monitor, &distributor).await.unwrap();
    assert_eq!(report.republished[0].reason, PublishReason::Retry { attempt: 2 });

    // second attempt fails too: cap reached, the failure stands
    ScenarioBuilder::new(harness.clock.now())
        .claim(10, 0, "w1", "task-1")
        .progress(11, 0, "w1", "task-1", 10, TaskStatus::Failed)
        .into_bus(&harness.bus)
        .unwrap();
    let report = controller.sweep(&lead, &monitor, &distributor).await.unwrap();
    assert!(report.republished.is_empty());
    let board = harness.board().await;
    assert_eq!(board.get("task-1").unwrap().status, TaskStatus::Failed);
    assert!(board.is_settled(2));
}

#[tokio::test(start_paused = true)]
async fn only_the_leader_sweeps() {
    let harness = TestHarness::new();
    seeded(&harness);
    let w1 = harness.candidate("w1").into_context(Role::Worker);
    let err = ReassignmentController::default()
        .sweep(&w1, &HealthMonitor::default(), &TaskDistributor::default())
        .await
        .unwrap_err();
    assert!(matches!(err, hive_kernel::HiveError::NotLeader));
}
