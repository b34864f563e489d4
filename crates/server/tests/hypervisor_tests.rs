//! Hypervisor reconciliation tests: stalled transfers, orphaned queue
//! claims and duplicate remote-instance rows.

mod common;

use archivist_core::config::{
    Cadence, CheckConsumedQueueConfig, ConsumeQueueConfig, DuplicateRemoteInstanceHypervisorConfig,
    IncomingTransferHypervisorConfig, OutgoingTransferHypervisorConfig, SendCloneConfig,
};
use archivist_core::rpc::PrepareTransferRequest;
use archivist_core::{DeletionPolicy, QueueItemStatus, TransferStatus, Transport};
use archivist_catalog::Catalog;
use archivist_server::handlers::clone;
use archivist_server::tasks::{
    CheckConsumedQueue, ConsumeQueue, DuplicateRemoteInstanceHypervisor,
    IncomingTransferHypervisor, OutgoingTransferHypervisor, SendClone, Task, TaskOutcome,
};
use common::{build_site, ingest_file, link_sites, soon, LoopbackRegistry, StoreSpec};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

fn cadence(s: &str) -> Cadence {
    Cadence::parse(s).unwrap()
}

#[tokio::test]
async fn stalled_outgoing_transfer_fails_and_queue_item_settles() {
    let registry = LoopbackRegistry::new();
    let a = build_site(&registry, "site-a", &[StoreSpec::new("s1", 1 << 20)]).await;
    let b = build_site(&registry, "site-b", &[StoreSpec::new("primary", 1 << 20)]).await;
    link_sites(&a, &b).await;

    ingest_file(&a, "s1", "f1", b"stranded bytes", 1, DeletionPolicy::Allowed).await;

    let send = SendClone::new(SendCloneConfig {
        task_name: None,
        every: cadence("00:10:00"),
        soft_timeout: cadence("00:10:00"),
        destination_librarian: "site-b".to_string(),
        age_in_days: 30,
        store_preference: None,
        send_batch_size: 16,
        warn_disabled_timer: 7,
    });
    send.run(&a.ctx, soon()).await.unwrap();

    // Destination dies before the transfer ever reaches it. A tight
    // deadline keeps the unreachable-backoff from sleeping.
    registry.set_down("site-b", true);
    let consume = ConsumeQueue::new(ConsumeQueueConfig {
        task_name: None,
        every: cadence("00:01:00"),
        soft_timeout: cadence("00:10:00"),
        batch_size: 16,
        claim_ttl: cadence("01:00:00"),
    });
    let deadline = OffsetDateTime::now_utc() + Duration::seconds(1);
    consume.run(&a.ctx, deadline).await.unwrap();

    let stuck = a
        .state
        .catalog
        .outgoing_by_status(TransferStatus::Initiated)
        .await
        .unwrap();
    assert_eq!(stuck.len(), 1);
    assert!(stuck[0].remote_transfer_id.is_none());

    // Old enough for the hypervisor; it never reached the destination,
    // so there is nothing to reconcile remotely.
    let hypervisor = OutgoingTransferHypervisor::new(OutgoingTransferHypervisorConfig {
        task_name: None,
        every: cadence("01:00:00"),
        soft_timeout: cadence("00:10:00"),
        age_in_days: 0,
    });
    assert_eq!(
        hypervisor.run(&a.ctx, soon()).await.unwrap(),
        TaskOutcome::Completed
    );

    let failed = a
        .state
        .catalog
        .outgoing_by_status(TransferStatus::Failed)
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert!(a
        .state
        .catalog
        .remote_instances_for_file("f1")
        .await
        .unwrap()
        .is_empty());

    // The orphaned claim settles as failed once the transfer is terminal.
    let check = CheckConsumedQueue::new(CheckConsumedQueueConfig {
        task_name: None,
        every: cadence("00:10:00"),
        soft_timeout: cadence("00:10:00"),
    });
    check.run(&a.ctx, soon()).await.unwrap();
    let item = a
        .state
        .catalog
        .queue_item_for_transfer(failed[0].id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(item.item_status().unwrap(), QueueItemStatus::Failed);
}

#[tokio::test]
async fn outgoing_hypervisor_follows_remote_cancellation() {
    let registry = LoopbackRegistry::new();
    let a = build_site(&registry, "site-a", &[StoreSpec::new("s1", 1 << 20)]).await;
    let b = build_site(&registry, "site-b", &[StoreSpec::new("primary", 1 << 20)]).await;
    link_sites(&a, &b).await;

    let data = b"cancelled midway";
    let checksum = ingest_file(&a, "s1", "f1", data, 1, DeletionPolicy::Allowed).await;

    // Hand-build a transfer that made it to ongoing, with a prepared
    // remote side.
    let dest = a.state.catalog.get_librarian("site-b").await.unwrap().unwrap();
    let outgoing = a
        .state
        .catalog
        .create_outgoing(&archivist_catalog::models::NewOutgoingTransfer {
            id: Uuid::new_v4(),
            file_name: "f1".to_string(),
            destination_id: dest.id,
            source_store_id: None,
            transport: Transport::Network,
            created_at: OffsetDateTime::now_utc() - Duration::days(2),
        })
        .await
        .unwrap();

    let origin_on_b = b.state.catalog.get_librarian("site-a").await.unwrap().unwrap();
    let prepared = clone::prepare_clone(
        &b.state,
        origin_on_b.id,
        &PrepareTransferRequest {
            origin_librarian: "site-a".to_string(),
            origin_transfer_id: outgoing.id.into(),
            file_name: "f1".to_string(),
            size: data.len() as u64,
            checksum,
            transport: Transport::Network,
        },
    )
    .await
    .unwrap();

    a.state
        .catalog
        .transition_outgoing(
            outgoing.id,
            TransferStatus::Initiated,
            TransferStatus::Ongoing,
            &archivist_catalog::models::TransferUpdates {
                remote_transfer_id: Some(*prepared.remote_id.as_uuid()),
                ..Default::default()
            },
            OffsetDateTime::now_utc(),
        )
        .await
        .unwrap();

    // The destination gives up on its side.
    clone::cancel_transfer(&b.state, *prepared.remote_id.as_uuid())
        .await
        .unwrap();

    let hypervisor = OutgoingTransferHypervisor::new(OutgoingTransferHypervisorConfig {
        task_name: None,
        every: cadence("01:00:00"),
        soft_timeout: cadence("00:10:00"),
        age_in_days: 1,
    });
    hypervisor.run(&a.ctx, soon()).await.unwrap();

    let row = a.state.catalog.get_outgoing(outgoing.id).await.unwrap().unwrap();
    assert_eq!(row.transfer_status().unwrap(), TransferStatus::Failed);
}

#[tokio::test]
async fn incoming_hypervisor_fails_transfer_origin_abandoned() {
    let registry = LoopbackRegistry::new();
    let a = build_site(&registry, "site-a", &[StoreSpec::new("s1", 1 << 20)]).await;
    let b = build_site(&registry, "site-b", &[StoreSpec::new("primary", 1 << 20)]).await;
    link_sites(&a, &b).await;

    let data = b"abandoned bytes";
    let checksum = ingest_file(&a, "s1", "f1", data, 1, DeletionPolicy::Allowed).await;

    // A opens a transfer toward B, then cancels its side.
    let dest = a.state.catalog.get_librarian("site-b").await.unwrap().unwrap();
    let outgoing = a
        .state
        .catalog
        .create_outgoing(&archivist_catalog::models::NewOutgoingTransfer {
            id: Uuid::new_v4(),
            file_name: "f1".to_string(),
            destination_id: dest.id,
            source_store_id: None,
            transport: Transport::Network,
            created_at: OffsetDateTime::now_utc() - Duration::days(2),
        })
        .await
        .unwrap();
    let origin_on_b = b.state.catalog.get_librarian("site-a").await.unwrap().unwrap();
    clone::prepare_clone(
        &b.state,
        origin_on_b.id,
        &PrepareTransferRequest {
            origin_librarian: "site-a".to_string(),
            origin_transfer_id: outgoing.id.into(),
            file_name: "f1".to_string(),
            size: data.len() as u64,
            checksum,
            transport: Transport::Network,
        },
    )
    .await
    .unwrap();
    clone::cancel_transfer(&a.state, outgoing.id).await.unwrap();

    // Backdate B's incoming row so the sweep picks it up.
    sqlx::query("UPDATE incoming_transfers SET created_at = ?")
        .bind(OffsetDateTime::now_utc() - Duration::days(2))
        .execute(b.sqlite.pool())
        .await
        .unwrap();

    let hypervisor = IncomingTransferHypervisor::new(IncomingTransferHypervisorConfig {
        task_name: None,
        every: cadence("01:00:00"),
        soft_timeout: cadence("00:10:00"),
        age_in_days: 1,
    });
    hypervisor.run(&b.ctx, soon()).await.unwrap();

    let incoming = b
        .state
        .catalog
        .incoming_by_status(TransferStatus::Failed)
        .await
        .unwrap();
    assert_eq!(incoming.len(), 1);
    // Staging space was reclaimed.
    let backend = b.state.stores.get("primary").unwrap();
    assert_eq!(backend.free_space().await.unwrap(), 1 << 20);
}

#[tokio::test]
async fn incoming_hypervisor_commits_when_origin_completed() {
    let registry = LoopbackRegistry::new();
    let a = build_site(&registry, "site-a", &[StoreSpec::new("s1", 1 << 20)]).await;
    let b = build_site(&registry, "site-b", &[StoreSpec::new("primary", 1 << 20)]).await;
    link_sites(&a, &b).await;

    let data = b"completed upstream";
    let checksum = ingest_file(&a, "s1", "f1", data, 1, DeletionPolicy::Allowed).await;

    let dest = a.state.catalog.get_librarian("site-b").await.unwrap().unwrap();
    let outgoing = a
        .state
        .catalog
        .create_outgoing(&archivist_catalog::models::NewOutgoingTransfer {
            id: Uuid::new_v4(),
            file_name: "f1".to_string(),
            destination_id: dest.id,
            source_store_id: None,
            transport: Transport::Network,
            created_at: OffsetDateTime::now_utc() - Duration::days(2),
        })
        .await
        .unwrap();
    let origin_on_b = b.state.catalog.get_librarian("site-a").await.unwrap().unwrap();
    let prepared = clone::prepare_clone(
        &b.state,
        origin_on_b.id,
        &PrepareTransferRequest {
            origin_librarian: "site-a".to_string(),
            origin_transfer_id: outgoing.id.into(),
            file_name: "f1".to_string(),
            size: data.len() as u64,
            checksum,
            transport: Transport::Network,
        },
    )
    .await
    .unwrap();
    // Bytes landed and verified on B; A's row records completion (a
    // sneakernet-style move where the sender closed out early).
    clone::receive_clone_bytes(&b.state, *prepared.remote_id.as_uuid(), data.to_vec().into())
        .await
        .unwrap();
    let now = OffsetDateTime::now_utc();
    for (from, to) in [
        (TransferStatus::Initiated, TransferStatus::Ongoing),
        (TransferStatus::Ongoing, TransferStatus::Staged),
        (TransferStatus::Staged, TransferStatus::Completed),
    ] {
        a.state
            .catalog
            .transition_outgoing(
                outgoing.id,
                from,
                to,
                &archivist_catalog::models::TransferUpdates::default(),
                now,
            )
            .await
            .unwrap();
    }

    sqlx::query("UPDATE incoming_transfers SET created_at = ?")
        .bind(OffsetDateTime::now_utc() - Duration::days(2))
        .execute(b.sqlite.pool())
        .await
        .unwrap();

    let hypervisor = IncomingTransferHypervisor::new(IncomingTransferHypervisorConfig {
        task_name: None,
        every: cadence("01:00:00"),
        soft_timeout: cadence("00:10:00"),
        age_in_days: 1,
    });
    hypervisor.run(&b.ctx, soon()).await.unwrap();

    // The staged transfer was committed rather than discarded.
    let file = b.state.catalog.get_file("f1").await.unwrap().unwrap();
    assert_eq!(file.checksum().unwrap(), checksum);
    assert_eq!(
        b.state
            .catalog
            .incoming_by_status(TransferStatus::Completed)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn duplicate_remote_instances_collapse_to_latest() {
    let registry = LoopbackRegistry::new();
    let a = build_site(&registry, "site-a", &[StoreSpec::new("s1", 1 << 20)]).await;
    let b = build_site(&registry, "site-b", &[StoreSpec::new("primary", 1 << 20)]).await;
    link_sites(&a, &b).await;

    let checksum = ingest_file(&a, "s1", "f1", b"duplicated", 1, DeletionPolicy::Allowed).await;
    let peer = a.state.catalog.get_librarian("site-b").await.unwrap().unwrap();

    let base = OffsetDateTime::now_utc();
    for offset in [0i64, 5, 10] {
        sqlx::query(
            r#"
            INSERT INTO remote_instances
                (file_name, librarian_id, copy_time, last_verified_at, verified_checksum, sender)
            VALUES (?, ?, ?, ?, ?, 'site-a')
            "#,
        )
        .bind("f1")
        .bind(peer.id)
        .bind(base + Duration::minutes(offset))
        .bind(base + Duration::minutes(offset))
        .bind(checksum.to_string())
        .execute(a.sqlite.pool())
        .await
        .unwrap();
    }

    let task = DuplicateRemoteInstanceHypervisor::new(DuplicateRemoteInstanceHypervisorConfig {
        task_name: None,
        every: cadence("01:00:00"),
        soft_timeout: cadence("00:10:00"),
    });
    task.run(&a.ctx, soon()).await.unwrap();

    let remaining = a
        .state
        .catalog
        .remote_instances_for_file("f1")
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].copy_time, base + Duration::minutes(10));
    assert_eq!(
        remaining[0].verified_checksum.as_deref(),
        Some(checksum.to_string().as_str())
    );
}

#[tokio::test]
async fn expired_claims_return_to_pending_exactly_once() {
    let registry = LoopbackRegistry::new();
    let a = build_site(&registry, "site-a", &[StoreSpec::new("s1", 1 << 20)]).await;
    let b = build_site(&registry, "site-b", &[StoreSpec::new("primary", 1 << 20)]).await;
    link_sites(&a, &b).await;

    ingest_file(&a, "s1", "f1", b"claim me", 1, DeletionPolicy::Allowed).await;
    let dest = a.state.catalog.get_librarian("site-b").await.unwrap().unwrap();
    let outgoing = a
        .state
        .catalog
        .create_outgoing(&archivist_catalog::models::NewOutgoingTransfer {
            id: Uuid::new_v4(),
            file_name: "f1".to_string(),
            destination_id: dest.id,
            source_store_id: None,
            transport: Transport::Network,
            created_at: OffsetDateTime::now_utc(),
        })
        .await
        .unwrap();
    a.state
        .catalog
        .enqueue_send(outgoing.id, 0, OffsetDateTime::now_utc())
        .await
        .unwrap();

    // Claim with a TTL already in the past.
    let claimed = a
        .state
        .catalog
        .claim_queue_items(
            1,
            Uuid::new_v4(),
            Duration::seconds(1),
            OffsetDateTime::now_utc() - Duration::hours(1),
        )
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);

    let check = CheckConsumedQueue::new(CheckConsumedQueueConfig {
        task_name: None,
        every: cadence("00:10:00"),
        soft_timeout: cadence("00:10:00"),
    });
    check.run(&a.ctx, soon()).await.unwrap();

    let item = a
        .state
        .catalog
        .queue_item_for_transfer(outgoing.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(item.item_status().unwrap(), QueueItemStatus::Pending);
    assert!(item.claimed_by.is_none());
}
