mod support;

use std::sync::Arc;
use std::time::Duration;

use arbor_core::{ArborRuntime, ComputedContainer, ContainerSettings, RuntimeConfig};
use arbor_model::{Cause, ComputationResult, FullName};

use support::{
    wait_for_result, wait_for_running, ConcurrencyTracker, FakeLoader, ScriptedReconciler,
};

fn user_cause() -> Cause {
    Cause::User {
        user: "tests".to_string(),
    }
}

async fn new_container(
    runtime: &Arc<ArborRuntime>,
    name: &str,
    root: std::path::PathBuf,
    reconciler: Arc<ScriptedReconciler>,
) -> Arc<ComputedContainer> {
    let settings = ContainerSettings::new(FullName::new(name), root, runtime.config().clone());
    runtime
        .create_container(settings, reconciler, Arc::new(FakeLoader))
        .await
        .expect("container creation")
}

#[tokio::test]
async fn throttle_caps_concurrent_computations() {
    let dir = tempfile::tempdir().unwrap();
    let config = RuntimeConfig {
        throttle_limit: 2,
        ..RuntimeConfig::default()
    };
    let runtime = ArborRuntime::start(config);
    let tracker = Arc::new(ConcurrencyTracker::default());

    let mut containers = Vec::new();
    for index in 0..5 {
        let name = format!("tenant-{index}");
        let reconciler = ScriptedReconciler::slow(
            &["x"],
            Duration::from_millis(200),
            tracker.clone(),
        );
        let container = new_container(
            &runtime,
            &name,
            dir.path().join(&name),
            reconciler,
        )
        .await;
        containers.push(container);
    }

    for container in &containers {
        assert!(container.schedule_build(Duration::ZERO, user_cause()));
    }
    for container in &containers {
        let result = wait_for_result(container, Duration::from_secs(30)).await;
        assert_eq!(result, ComputationResult::Success);
    }

    assert!(
        tracker.peak() <= 2,
        "no more than two computations may run at once, saw {}",
        tracker.peak()
    );
    runtime.shutdown().await;
}

#[tokio::test]
async fn disabled_ancestors_block_scheduling() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = ArborRuntime::start(RuntimeConfig::default());

    let parent = new_container(
        &runtime,
        "org",
        dir.path().join("org"),
        ScriptedReconciler::new(&[]),
    )
    .await;
    let child = new_container(
        &runtime,
        "org/feature",
        dir.path().join("org").join("jobs").join("feature"),
        ScriptedReconciler::new(&["x"]),
    )
    .await;

    parent.make_disabled(true);
    assert!(!child.schedule_build(Duration::ZERO, user_cause()));
    assert!(!child.is_buildable());

    // An item queued before the disable stays parked, not dispatched.
    parent.make_disabled(false);
    assert!(child.schedule_build(Duration::from_millis(150), user_cause()));
    parent.make_disabled(true);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(child.computation().is_none());
    assert!(runtime.queue().is_queued(child.full_name()));

    // Re-enabling lets the parked item through.
    parent.make_disabled(false);
    let result = wait_for_result(&child, Duration::from_secs(5)).await;
    assert_eq!(result, ComputationResult::Success);

    runtime.shutdown().await;
}

#[tokio::test]
async fn directly_disabled_containers_refuse_builds() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = ArborRuntime::start(RuntimeConfig::default());
    let container = new_container(
        &runtime,
        "acme",
        dir.path().join("acme"),
        ScriptedReconciler::new(&["x"]),
    )
    .await;

    container.make_disabled(true);
    assert!(!container.schedule_build(Duration::ZERO, user_cause()));
    container.make_disabled(false);
    assert!(container.schedule_build(Duration::ZERO, user_cause()));
    wait_for_result(&container, Duration::from_secs(5)).await;
    runtime.shutdown().await;
}

#[tokio::test]
async fn delete_cascade_interrupts_running_descendants() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = ArborRuntime::start(RuntimeConfig::default());

    let parent = new_container(
        &runtime,
        "org",
        dir.path().join("org"),
        ScriptedReconciler::new(&[]),
    )
    .await;

    // A descendant with a deliberately long-running computation.
    let names: Vec<String> = (0..100).map(|i| format!("branch-{i:02}")).collect();
    let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let tracker = Arc::new(ConcurrencyTracker::default());
    let child_reconciler =
        ScriptedReconciler::slow(&name_refs, Duration::from_millis(50), tracker);
    let child = new_container(
        &runtime,
        "org/feature",
        dir.path().join("org").join("jobs").join("feature"),
        child_reconciler,
    )
    .await;

    assert!(child.schedule_build(Duration::ZERO, user_cause()));
    wait_for_running(&child, Duration::from_secs(5)).await;
    let computation = child.computation().unwrap();

    parent.delete().await.expect("cascade delete");

    // The running build observed the interrupt and aborted with the
    // cascade cause attached.
    assert_eq!(computation.result(), Some(ComputationResult::Aborted));
    assert!(computation.causes().iter().any(|cause| matches!(
        cause,
        Cause::OrphanedParent { full_name } if full_name == "org"
    )));

    // Registry and disk are both clean.
    assert!(runtime.registry().get(&FullName::new("org")).is_none());
    assert!(runtime
        .registry()
        .get(&FullName::new("org/feature"))
        .is_none());
    assert!(!dir.path().join("org").exists());

    // Scheduling against the deleted container is refused.
    assert!(!child.schedule_build(Duration::ZERO, user_cause()));

    runtime.shutdown().await;
}

#[tokio::test]
async fn queue_coalesces_repeat_schedules() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = ArborRuntime::start(RuntimeConfig::default());
    let reconciler = ScriptedReconciler::new(&["x"]);
    let container = new_container(
        &runtime,
        "acme",
        dir.path().join("acme"),
        reconciler.clone(),
    )
    .await;

    // Several requests inside the quiet period collapse into one run.
    for _ in 0..3 {
        assert!(container.schedule_build(Duration::from_millis(200), user_cause()));
    }
    assert_eq!(runtime.queue().pending_count(), 1);
    wait_for_result(&container, Duration::from_secs(5)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        reconciler.runs.load(std::sync::atomic::Ordering::SeqCst),
        1
    );
    runtime.shutdown().await;
}
