mod support;

use std::sync::Arc;
use std::time::Duration;

use arbor_core::{
    ArborRuntime, ChildItem, ContainerSettings, DefaultMangler, NameMangler, RuntimeConfig,
};
use arbor_model::{Cause, ChildName, FullName};

use support::{wait_for_result, FakeChild, FakeLoader, ScriptedReconciler};

#[tokio::test]
async fn legacy_directories_are_upgraded_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("acme");

    // A pre-mangler child: its directory name is the business name and
    // nothing records either one.
    let legacy_dir = root.join("jobs").join("Feature One");
    std::fs::create_dir_all(&legacy_dir).unwrap();
    std::fs::write(
        legacy_dir.join("config.json"),
        br#"{"name":null,"dir_name":null}"#,
    )
    .unwrap();

    let runtime = ArborRuntime::start(RuntimeConfig::default());
    let settings = ContainerSettings::new(
        FullName::new("acme"),
        root.clone(),
        runtime.config().clone(),
    );
    let container = runtime
        .create_container(settings, ScriptedReconciler::new(&[]), Arc::new(FakeLoader))
        .await
        .unwrap();

    let children = container.children().await;
    let child = children
        .get(&ChildName::new("Feature One"))
        .expect("legacy child inferred");
    let fake = child.as_any().downcast_ref::<FakeChild>().unwrap();
    assert_eq!(fake.stored_business_name().as_deref(), Some("Feature One"));

    // The directory moved to the mangled name and carries the sidecar.
    let mangled = DefaultMangler.mangle("Feature One");
    assert_ne!(mangled, "Feature One");
    let new_dir = root.join("jobs").join(&mangled);
    assert!(new_dir.exists());
    assert!(!legacy_dir.exists());
    assert_eq!(
        std::fs::read_to_string(new_dir.join("name-utf8.txt"))
            .unwrap()
            .trim(),
        "Feature One"
    );

    // The upgrade dirtied the child and saved it.
    assert!(fake.saves.load(std::sync::atomic::Ordering::SeqCst) >= 1);

    runtime.shutdown().await;
}

#[tokio::test]
async fn business_names_round_trip_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("acme");

    {
        let runtime = ArborRuntime::start(RuntimeConfig::default());
        let settings = ContainerSettings::new(
            FullName::new("acme"),
            root.clone(),
            runtime.config().clone(),
        );
        let container = runtime
            .create_container(
                settings,
                ScriptedReconciler::new(&["release-2.4", "Feature One"]),
                Arc::new(FakeLoader),
            )
            .await
            .unwrap();
        assert!(container.schedule_build(
            Duration::ZERO,
            Cause::User {
                user: "tests".to_string()
            }
        ));
        wait_for_result(&container, Duration::from_secs(5)).await;
        runtime.shutdown().await;
    }

    // A fresh process loads the same tree; every business name reads
    // back exactly.
    let runtime = ArborRuntime::start(RuntimeConfig::default());
    let settings =
        ContainerSettings::new(FullName::new("acme"), root, runtime.config().clone());
    let container = runtime
        .create_container(settings, ScriptedReconciler::new(&[]), Arc::new(FakeLoader))
        .await
        .unwrap();
    let children = container.children().await;
    assert_eq!(children.len(), 2);
    for name in ["release-2.4", "Feature One"] {
        let child = children.get(&ChildName::new(name)).expect("child loaded");
        assert_eq!(child.stored_business_name().as_deref(), Some(name));
    }
    runtime.shutdown().await;
}

#[tokio::test]
async fn relocation_collisions_skip_the_child() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("acme");

    // Legacy directory whose mangled target already exists.
    let mangled = DefaultMangler.mangle("Feature One");
    let legacy_dir = root.join("jobs").join("Feature One");
    let target_dir = root.join("jobs").join(&mangled);
    for d in [&legacy_dir, &target_dir] {
        std::fs::create_dir_all(d).unwrap();
        std::fs::write(d.join("config.json"), br#"{"name":null,"dir_name":null}"#).unwrap();
    }
    std::fs::write(
        target_dir.join("config.json"),
        format!(r#"{{"name":"Feature One","dir_name":"{mangled}"}}"#),
    )
    .unwrap();

    let runtime = ArborRuntime::start(RuntimeConfig::default());
    let settings =
        ContainerSettings::new(FullName::new("acme"), root.clone(), runtime.config().clone());
    let container = runtime
        .create_container(settings, ScriptedReconciler::new(&[]), Arc::new(FakeLoader))
        .await
        .unwrap();

    // Both directories are left untouched; only the well-named child
    // made it into the map.
    assert!(legacy_dir.exists());
    assert!(target_dir.exists());
    assert_eq!(container.children().await.len(), 1);

    runtime.shutdown().await;
}
