//! Corruption detection and repair, end to end: tamper, detect, request a
//! fresh copy from the origin, confirm the replacement.

mod common;

use archivist_core::config::{
    Cadence, CheckIntegrityConfig, ConsumeQueueConfig, CorruptionFixerConfig,
};
use archivist_core::{Checksum, DeletionPolicy, TransferStatus};
use archivist_catalog::Catalog;
use archivist_server::notify::Event;
use archivist_server::tasks::{
    CheckIntegrity, ConsumeQueue, CorruptionFixer, Task, TaskOutcome,
};
use common::{build_site, ingest_file, link_sites, soon, LoopbackRegistry, StoreSpec};

fn cadence(s: &str) -> Cadence {
    Cadence::parse(s).unwrap()
}

fn integrity_config(store: &str) -> CheckIntegrityConfig {
    CheckIntegrityConfig {
        task_name: None,
        every: cadence("01:00:00"),
        soft_timeout: cadence("00:10:00"),
        store_name: store.to_string(),
        age_in_days: 365,
    }
}

fn fixer_config() -> CorruptionFixerConfig {
    CorruptionFixerConfig {
        task_name: None,
        every: cadence("01:00:00"),
        soft_timeout: cadence("00:10:00"),
    }
}

#[tokio::test]
async fn integrity_check_flags_tampered_instance() {
    let registry = LoopbackRegistry::new();
    let site = build_site(&registry, "site-a", &[StoreSpec::new("s1", 1 << 20)]).await;

    ingest_file(&site, "s1", "f1", b"original bytes", 1, DeletionPolicy::Allowed).await;
    ingest_file(&site, "s1", "f2", b"untouched bytes", 1, DeletionPolicy::Allowed).await;

    // Flip the bytes behind the catalog's back.
    std::fs::write(site.store_roots["s1"].join("f1"), b"tampered bytes").unwrap();

    let task = CheckIntegrity::new(integrity_config("s1"));
    assert_eq!(
        task.run(&site.ctx, soon()).await.unwrap(),
        TaskOutcome::Completed
    );

    assert!(site
        .state
        .catalog
        .available_instances_for_file("f1")
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        site.state
            .catalog
            .available_instances_for_file("f2")
            .await
            .unwrap()
            .len(),
        1
    );

    let pending = site.state.catalog.corrupt_files_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].file_name, "f1");
    assert_eq!(pending[0].detector, "integrity_check");

    assert!(site.notifier.events().iter().any(|e| matches!(
        e,
        Event::FileCorrupt { file, detector, .. }
            if file == "f1" && detector == "integrity_check"
    )));

    // A second pass re-detects without inserting a second row.
    task.run(&site.ctx, soon()).await.unwrap();
    let pending = site.state.catalog.corrupt_files_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].corrupt_count, 1);
}

#[tokio::test]
async fn missing_instance_counts_as_corrupt() {
    let registry = LoopbackRegistry::new();
    let site = build_site(&registry, "site-a", &[StoreSpec::new("s1", 1 << 20)]).await;

    ingest_file(&site, "s1", "f1", b"soon to vanish", 1, DeletionPolicy::Allowed).await;
    std::fs::remove_file(site.store_roots["s1"].join("f1")).unwrap();

    let task = CheckIntegrity::new(integrity_config("s1"));
    task.run(&site.ctx, soon()).await.unwrap();

    assert!(site
        .state
        .catalog
        .available_instances_for_file("f1")
        .await
        .unwrap()
        .is_empty());
    assert_eq!(site.state.catalog.corrupt_files_pending().await.unwrap().len(), 1);
    // The vanished bytes no longer count against the store.
    assert_eq!(
        site.state.catalog.get_store("s1").await.unwrap().unwrap().used_bytes,
        0
    );
}

#[tokio::test]
async fn corruption_detected_and_repaired_from_origin() {
    let registry = LoopbackRegistry::new();
    let a = build_site(&registry, "site-a", &[StoreSpec::new("s1", 1 << 20)]).await;
    let b = build_site(&registry, "site-b", &[StoreSpec::new("primary", 1 << 20)]).await;
    link_sites(&a, &b).await;

    let data = b"authoritative bytes";
    let checksum = Checksum::compute(data);

    // B originated the file and still holds a good copy; A's copy came
    // from B at some point.
    ingest_file(&b, "primary", "f1", data, 5, DeletionPolicy::Disallowed).await;
    {
        // A's rows mirror a completed clone from B.
        let backend = a.state.stores.get("s1").unwrap();
        let handle = backend.stage("f1", data.len() as u64).await.unwrap();
        backend.write(&handle, data.to_vec().into()).await.unwrap();
        backend.commit(&handle, "f1", &checksum).await.unwrap();
        let store = a.state.catalog.get_store("s1").await.unwrap().unwrap();
        let when = time::OffsetDateTime::now_utc() - time::Duration::days(3);
        a.state
            .catalog
            .create_file(
                &archivist_catalog::models::NewFile {
                    name: "f1".to_string(),
                    source_librarian: "site-b".to_string(),
                    size_bytes: data.len() as i64,
                    checksum,
                    uploaded_at: when,
                    observation_id: None,
                },
                Some(&archivist_catalog::models::NewInstance {
                    file_name: "f1".to_string(),
                    store_id: store.id,
                    path: "f1".to_string(),
                    deletion_policy: DeletionPolicy::Disallowed,
                    created_at: when,
                }),
            )
            .await
            .unwrap();
    }

    // Tamper A's copy, then detect it.
    std::fs::write(a.store_roots["s1"].join("f1"), b"bit-rotted bytes!!!").unwrap();
    CheckIntegrity::new(integrity_config("s1"))
        .run(&a.ctx, soon())
        .await
        .unwrap();
    let pending = a.state.catalog.corrupt_files_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].file_source, "site-b");

    // Fixer phase one: ask B for a fresh copy. The bad rows are gone and
    // B has an outbound transfer queued toward A.
    CorruptionFixer::new(fixer_config())
        .run(&a.ctx, soon())
        .await
        .unwrap();
    assert!(a.state.catalog.get_file("f1").await.unwrap().is_none());
    let awaiting = a
        .state
        .catalog
        .corrupt_files_awaiting_replacement()
        .await
        .unwrap();
    assert_eq!(awaiting.len(), 1);
    let repair_id = awaiting[0].repair_transfer_id.unwrap();
    assert!(b.state.catalog.get_outgoing(repair_id).await.unwrap().is_some());

    // B's queue consumer pushes the replacement over.
    ConsumeQueue::new(ConsumeQueueConfig {
        task_name: None,
        every: cadence("00:01:00"),
        soft_timeout: cadence("00:10:00"),
        batch_size: 16,
        claim_ttl: cadence("01:00:00"),
    })
    .run(&b.ctx, soon())
    .await
    .unwrap();

    let restored = a.state.catalog.get_file("f1").await.unwrap().unwrap();
    assert_eq!(restored.checksum().unwrap(), checksum);
    let instances = a
        .state
        .catalog
        .available_instances_for_file("f1")
        .await
        .unwrap();
    assert_eq!(instances.len(), 1);
    let backend = a.state.stores.get("s1").unwrap();
    assert_eq!(
        backend.path_info(&instances[0].path).await.unwrap().checksum,
        checksum
    );

    // Fixer phase two: the replacement landed, so the corrupt row clears.
    CorruptionFixer::new(fixer_config())
        .run(&a.ctx, soon())
        .await
        .unwrap();
    assert!(a.state.catalog.corrupt_files_pending().await.unwrap().is_empty());
    assert!(a
        .state
        .catalog
        .corrupt_files_awaiting_replacement()
        .await
        .unwrap()
        .is_empty());

    // B's transfer closed out and recorded A's copy.
    let outgoing = b.state.catalog.get_outgoing(repair_id).await.unwrap().unwrap();
    assert_eq!(outgoing.transfer_status().unwrap(), TransferStatus::Completed);
    let remotes = b.state.catalog.remote_instances_for_file("f1").await.unwrap();
    assert_eq!(remotes.len(), 1);
}

#[tokio::test]
async fn fixer_clears_rows_fixed_behind_its_back() {
    let registry = LoopbackRegistry::new();
    let site = build_site(&registry, "site-a", &[StoreSpec::new("s1", 1 << 20)]).await;

    let data = b"actually fine";
    ingest_file(&site, "s1", "f1", data, 1, DeletionPolicy::Allowed).await;
    let instance = site
        .state
        .catalog
        .available_instances_for_file("f1")
        .await
        .unwrap()[0]
        .clone();

    // A stale detection for bytes that verify clean today.
    site.state
        .catalog
        .record_corrupt_file(
            "f1",
            "site-a",
            instance.id,
            "integrity_check",
            time::OffsetDateTime::now_utc(),
        )
        .await
        .unwrap();

    CorruptionFixer::new(fixer_config())
        .run(&site.ctx, soon())
        .await
        .unwrap();

    assert!(site.state.catalog.corrupt_files_pending().await.unwrap().is_empty());
    assert_eq!(
        site.state
            .catalog
            .available_instances_for_file("f1")
            .await
            .unwrap()
            .len(),
        1
    );
}
