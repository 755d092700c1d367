//! Inventory reconciliation with a source.

mod common;

use common::Harness;
use migration_test::fixtures;
use migration_types::{MigrationStatus, Network};
use migrationd::batch::BatchManager;
use migrationd::sync::{InventorySync, SyncSummary};
use pretty_assertions::assert_eq;

fn network(identifier: &str, name: &str) -> Network {
    Network {
        identifier: identifier.to_string(),
        location: format!("/dc1/network/{}", name),
        source: fixtures::SOURCE.to_string(),
        name: name.to_string(),
        target_network: None,
    }
}

#[tokio::test]
async fn test_sync_creates_updates_and_deletes() {
    let h = Harness::new().await;
    let web01 = fixtures::linux_instance("web01");
    let web02 = fixtures::linux_instance("web02");
    let db01 = fixtures::linux_instance("db01");
    h.add_instances(&[web01.clone(), web02.clone(), db01.clone()]);

    // web02 is claimed by a batch, the rest is unassigned.
    BatchManager::new(h.ctx.clone())
        .create_batch(fixtures::batch("web02", "name == \"web02\""))
        .unwrap();

    let mut resized = web01.clone();
    resized.properties.cpus = 8;
    let mut claimed = web02.clone();
    claimed.properties.cpus = 16;
    let app01 = fixtures::linux_instance("app01");
    {
        let mut source = h.source.lock();
        // db01 disappeared from the source.
        source.vms = vec![resized, claimed, app01.clone()];
    }

    let sync = InventorySync::new(h.ctx.clone());
    let summary = sync.sync_source(&fixtures::source()).await.unwrap();
    assert_eq!(
        summary,
        SyncSummary {
            created: 1,
            updated: 1,
            deleted: 1,
            networks: 0,
        }
    );

    assert_eq!(h.instance(web01.uuid).properties.cpus, 8);
    // Claimed instances keep the properties they were queued with.
    assert_eq!(h.instance(web02.uuid).properties.cpus, 2);
    let created = h.instance(app01.uuid);
    assert_eq!(created.migration_status, MigrationStatus::NotAssignedBatch);
    assert_eq!(created.batch, None);
    let gone = h
        .ctx
        .store
        .transaction(|tx| tx.get_instance(db01.uuid))
        .unwrap();
    assert!(gone.is_none());

    // Nothing changed since.
    let summary = sync.sync_source(&fixtures::source()).await.unwrap();
    assert_eq!(summary, SyncSummary::default());
}

#[tokio::test]
async fn test_sync_keeps_target_network_mapping() {
    let h = Harness::new().await;
    h.ctx
        .store
        .transaction(|tx| {
            let mut mapped = network("network-2", "Storage");
            mapped.target_network = Some("storage".to_string());
            tx.upsert_network(&mapped)
        })
        .unwrap();

    h.source.lock().networks = vec![
        network("network-2", "Storage"),
        network("network-3", "Backup"),
    ];

    let summary = InventorySync::new(h.ctx.clone())
        .sync_source(&fixtures::source())
        .await
        .unwrap();
    assert_eq!(summary.networks, 1);

    let (storage, backup) = h
        .ctx
        .store
        .transaction(|tx| {
            Ok::<_, migrationd::StoreError>((
                tx.find_network(fixtures::SOURCE, "network-2")?,
                tx.find_network(fixtures::SOURCE, "network-3")?,
            ))
        })
        .unwrap();
    assert_eq!(storage.unwrap().target_network.as_deref(), Some("storage"));
    assert_eq!(backup.unwrap().target_network, None);
}

#[tokio::test]
async fn test_sync_assigns_new_instances_to_defined_batches() {
    let h = Harness::new().await;
    BatchManager::new(h.ctx.clone())
        .create_batch(fixtures::batch("web", "name matches \"web*\""))
        .unwrap();

    let web01 = fixtures::linux_instance("web01");
    h.source.lock().vms = vec![web01.clone()];

    InventorySync::new(h.ctx.clone()).run_once().await.unwrap();

    let instance = h.instance(web01.uuid);
    assert_eq!(instance.batch.as_deref(), Some("web"));
    assert_eq!(instance.migration_status, MigrationStatus::AssignedBatch);
}

#[tokio::test]
async fn test_unreachable_source_changes_nothing() {
    let h = Harness::new().await;
    let web01 = fixtures::linux_instance("web01");
    h.add_instances(&[web01.clone()]);
    h.source.lock().unreachable = true;

    let sync = InventorySync::new(h.ctx.clone());
    assert!(sync.sync_source(&fixtures::source()).await.is_err());
    // A failing source does not fail the pass.
    sync.run_once().await.unwrap();

    assert_eq!(h.instance(web01.uuid).properties.name, "web01");
}
