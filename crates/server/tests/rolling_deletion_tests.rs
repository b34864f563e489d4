//! Rolling deletion policy tests.

mod common;

use archivist_core::config::{Cadence, RollingDeletionConfig};
use archivist_core::DeletionPolicy;
use archivist_catalog::Catalog;
use archivist_server::notify::Event;
use archivist_server::tasks::{RollingDeletion, Task, TaskOutcome};
use common::{build_site, ingest_file, link_sites, soon, LoopbackRegistry, StoreSpec, TestSite};
use time::OffsetDateTime;

fn cadence(s: &str) -> Cadence {
    Cadence::parse(s).unwrap()
}

fn deletion_config(
    store: &str,
    copies: u32,
    mark_unavailable: bool,
    force: bool,
) -> RollingDeletionConfig {
    RollingDeletionConfig {
        task_name: None,
        every: cadence("24:00:00"),
        soft_timeout: cadence("00:10:00"),
        store_name: store.to_string(),
        age_in_days: 0,
        number_of_remote_copies: copies,
        verify_downstream_checksums: true,
        mark_unavailable,
        force_deletion: force,
    }
}

/// Give B its own copy of the file and record it on A as a remote
/// instance, so downstream verification succeeds.
async fn seed_remote_copy(a: &TestSite, b: &TestSite, file: &str, data: &[u8]) {
    let checksum = ingest_file(b, "primary", file, data, 1, DeletionPolicy::Disallowed).await;
    let peer_row = a
        .state
        .catalog
        .get_librarian("site-b")
        .await
        .unwrap()
        .unwrap();
    a.state
        .catalog
        .register_remote_instance(
            file,
            peer_row.id,
            &checksum,
            OffsetDateTime::now_utc(),
            "site-a",
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn deletion_blocked_without_remote_copies() {
    let registry = LoopbackRegistry::new();
    let a = build_site(&registry, "site-a", &[StoreSpec::new("s1", 1 << 20)]).await;

    // Two days old, so the candidate has been deletion-eligible for more
    // than the notification grace period.
    ingest_file(&a, "s1", "f1", b"precious bytes", 2, DeletionPolicy::Allowed).await;

    let task = RollingDeletion::new(deletion_config("s1", 1, true, false));
    assert_eq!(
        task.run(&a.ctx, soon()).await.unwrap(),
        TaskOutcome::Completed
    );

    // Nothing was deleted and the operator heard about it.
    let instances = a
        .state
        .catalog
        .available_instances_for_file("f1")
        .await
        .unwrap();
    assert_eq!(instances.len(), 1);
    let backend = a.state.stores.get("s1").unwrap();
    assert!(backend.read(&instances[0].path).await.is_ok());

    assert!(a.notifier.events().iter().any(|e| matches!(
        e,
        Event::DeletionBlocked { file, verified_copies: 0, required: 1, .. } if file == "f1"
    )));
}

#[tokio::test]
async fn deletes_once_remote_copy_verifies() {
    let registry = LoopbackRegistry::new();
    let a = build_site(&registry, "site-a", &[StoreSpec::new("s1", 1 << 20)]).await;
    let b = build_site(&registry, "site-b", &[StoreSpec::new("primary", 1 << 20)]).await;
    link_sites(&a, &b).await;

    let data = b"replicated bytes";
    ingest_file(&a, "s1", "f1", data, 2, DeletionPolicy::Allowed).await;
    seed_remote_copy(&a, &b, "f1", data).await;

    let task = RollingDeletion::new(deletion_config("s1", 1, false, false));
    assert_eq!(
        task.run(&a.ctx, soon()).await.unwrap(),
        TaskOutcome::Completed
    );

    // Row and bytes are gone, accounting released.
    assert!(a
        .state
        .catalog
        .available_instances_for_file("f1")
        .await
        .unwrap()
        .is_empty());
    let backend = a.state.stores.get("s1").unwrap();
    assert!(backend.read("f1").await.is_err());
    let store = a.state.catalog.get_store("s1").await.unwrap().unwrap();
    assert_eq!(store.used_bytes, 0);

    // Downstream verification refreshed the remote instance row.
    let remotes = a
        .state
        .catalog
        .remote_instances_for_file("f1")
        .await
        .unwrap();
    assert!(remotes[0].last_verified_at.is_some());
}

#[tokio::test]
async fn mark_unavailable_keeps_the_row() {
    let registry = LoopbackRegistry::new();
    let a = build_site(&registry, "site-a", &[StoreSpec::new("s1", 1 << 20)]).await;
    let b = build_site(&registry, "site-b", &[StoreSpec::new("primary", 1 << 20)]).await;
    link_sites(&a, &b).await;

    let data = b"soft deleted bytes";
    ingest_file(&a, "s1", "f1", data, 2, DeletionPolicy::Allowed).await;
    seed_remote_copy(&a, &b, "f1", data).await;
    let instance_id = a
        .state
        .catalog
        .available_instances_for_file("f1")
        .await
        .unwrap()[0]
        .id;

    let task = RollingDeletion::new(deletion_config("s1", 1, true, false));
    task.run(&a.ctx, soon()).await.unwrap();

    // Bytes removed, row kept for audit but unavailable.
    assert!(a
        .state
        .catalog
        .available_instances_for_file("f1")
        .await
        .unwrap()
        .is_empty());
    let row = a
        .state
        .catalog
        .get_instance(instance_id)
        .await
        .unwrap()
        .unwrap();
    assert!(!row.available);
    let backend = a.state.stores.get("s1").unwrap();
    assert!(backend.read("f1").await.is_err());
    assert_eq!(
        a.state.catalog.get_store("s1").await.unwrap().unwrap().used_bytes,
        0
    );
}

#[tokio::test]
async fn deletion_policy_gate_honored_unless_forced() {
    let registry = LoopbackRegistry::new();
    let a = build_site(&registry, "site-a", &[StoreSpec::new("s1", 1 << 20)]).await;
    let b = build_site(&registry, "site-b", &[StoreSpec::new("primary", 1 << 20)]).await;
    link_sites(&a, &b).await;

    let data = b"policy guarded bytes";
    ingest_file(&a, "s1", "f1", data, 2, DeletionPolicy::Disallowed).await;
    seed_remote_copy(&a, &b, "f1", data).await;

    // Redundancy is satisfied but the per-instance policy says no.
    let task = RollingDeletion::new(deletion_config("s1", 1, true, false));
    task.run(&a.ctx, soon()).await.unwrap();
    assert_eq!(
        a.state
            .catalog
            .available_instances_for_file("f1")
            .await
            .unwrap()
            .len(),
        1
    );

    // force_deletion overrides the policy gate, not the redundancy gate.
    let task = RollingDeletion::new(deletion_config("s1", 1, true, true));
    task.run(&a.ctx, soon()).await.unwrap();
    assert!(a
        .state
        .catalog
        .available_instances_for_file("f1")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn never_deletes_last_federation_copy() {
    let registry = LoopbackRegistry::new();
    let a = build_site(&registry, "site-a", &[StoreSpec::new("s1", 1 << 20)]).await;

    ingest_file(&a, "s1", "f1", b"the only copy", 2, DeletionPolicy::Allowed).await;

    // Zero required copies still refuses to remove the last copy anywhere.
    let task = RollingDeletion::new(deletion_config("s1", 0, false, true));
    task.run(&a.ctx, soon()).await.unwrap();

    assert_eq!(
        a.state
            .catalog
            .available_instances_for_file("f1")
            .await
            .unwrap()
            .len(),
        1
    );
    assert!(a
        .notifier
        .events()
        .iter()
        .any(|e| matches!(e, Event::DeletionBlocked { .. })));
}
