//! Queueing and provisioning scenarios against in-memory endpoints.

mod common;

use common::{serve_file, Harness};
use migration_test::fixtures;
use migration_types::{BatchStatus, MigrationStatus, SourceType};
use migrationd::provision::{Provisioner, WORKER_IMAGE_VOLUME};
use migrationd::queue::QueueRunner;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_linux_instances_reach_idle() {
    let h = Harness::new().await;
    let web01 = fixtures::linux_instance("web01");
    let web02 = fixtures::linux_instance("web02");
    h.add_instances(&[web01.clone(), web02.clone()]);
    h.add_worker_and_sdk().await;

    h.start_batch(fixtures::batch("wave-1", "true")).await;
    assert_eq!(h.batch("wave-1").status, BatchStatus::Running);
    assert_eq!(h.entry(web01.uuid).migration_status, MigrationStatus::Waiting);

    h.provision().await;

    for uuid in [web01.uuid, web02.uuid] {
        let entry = h.entry(uuid);
        assert_eq!(entry.migration_status, MigrationStatus::Idle);
        assert!(entry.last_worker_update.is_some());
        assert_eq!(h.instance(uuid).migration_status, MigrationStatus::Idle);
    }
    assert_eq!(h.batch("wave-1").status, BatchStatus::Running);

    let target = h.target.lock();
    assert_eq!(target.create_calls, 2);
    assert_eq!(target.imports, 1);
    assert!(target.has_volume(fixtures::POOL, WORKER_IMAGE_VOLUME));
    assert!(target.started.contains("web01"));
    assert!(target.started.contains("web02"));
    assert_eq!(target.vms["web01"].project, fixtures::PROJECT);
}

#[tokio::test]
async fn test_windows_without_driver_iso_is_blocked() {
    let h = Harness::new().await;
    let web01 = fixtures::linux_instance("web01");
    let win01 = fixtures::windows_instance("win01");
    h.add_instances(&[web01.clone(), win01.clone()]);
    h.add_worker_and_sdk().await;

    h.start_batch(fixtures::batch("wave-1", "true")).await;
    h.provision().await;

    let blocked = h.entry(win01.uuid);
    assert_eq!(blocked.migration_status, MigrationStatus::Blocked);
    assert!(blocked.migration_status_message.contains("driver ISO"));
    assert_eq!(h.entry(web01.uuid).migration_status, MigrationStatus::Idle);
    assert_eq!(h.batch("wave-1").status, BatchStatus::Running);
    assert!(!h.target.lock().vms.contains_key("win01"));

    // Uploading a matching ISO unblocks the instance on the next pass.
    h.add_artifact(fixtures::driver_iso_artifact("x86_64"), "virtio-win.iso")
        .await;
    QueueRunner::new(h.ctx.clone()).run_once().await.unwrap();
    assert_eq!(h.entry(win01.uuid).migration_status, MigrationStatus::Waiting);

    h.provision().await;
    assert_eq!(h.entry(win01.uuid).migration_status, MigrationStatus::Idle);
    let target = h.target.lock();
    assert!(target.has_volume(fixtures::POOL, "virtio-win.iso"));
    assert_eq!(target.imports, 2);
}

#[tokio::test]
async fn test_worker_image_is_downloaded_alongside_local_driver_iso() {
    let h = Harness::new().await;
    let win01 = fixtures::windows_instance("win01");
    h.add_instances(&[win01.clone()]);
    let worker = fixtures::worker_artifact();
    h.add_remote_artifact(worker.clone(), serve_file("worker.img", b"image").await);
    h.add_artifact(fixtures::sdk_artifact(SourceType::Vmware), "sdk.tar.gz")
        .await;
    h.add_artifact(fixtures::driver_iso_artifact("x86_64"), "virtio-win.iso")
        .await;

    h.start_batch(fixtures::batch("wave-1", "true")).await;
    tokio::time::timeout(std::time::Duration::from_secs(10), h.provision())
        .await
        .expect("provisioning did not finish");

    assert_eq!(h.entry(win01.uuid).migration_status, MigrationStatus::Idle);
    assert!(h.ctx.artifacts.dir(worker.uuid).join("worker.img").exists());
    let target = h.target.lock();
    assert!(target.has_volume(fixtures::POOL, WORKER_IMAGE_VOLUME));
    assert!(target.has_volume(fixtures::POOL, "virtio-win.iso"));
    assert_eq!(target.imports, 2);
}

#[tokio::test]
async fn test_create_limit_is_shared_across_batches() {
    let h = Harness::new().await;
    let instances = [
        fixtures::linux_instance("web01"),
        fixtures::linux_instance("web02"),
        fixtures::linux_instance("db01"),
        fixtures::linux_instance("db02"),
    ];
    h.add_instances(&instances);
    h.add_worker_and_sdk().await;
    h.ctx
        .store
        .transaction(|tx| {
            let mut target = tx.require_target(fixtures::TARGET)?;
            target.create_limit = Some(1);
            tx.update_target(&target)
        })
        .unwrap();
    h.target.lock().create_delay = std::time::Duration::from_millis(30);

    h.start_batch(fixtures::batch("web", "name matches \"web*\"")).await;
    h.start_batch(fixtures::batch("db", "name matches \"db*\"")).await;

    let cancel = CancellationToken::new();
    let provisioner = Provisioner::new(h.ctx.clone());
    let (a, b) = tokio::join!(
        provisioner.provision_batch(h.batch("web"), &cancel),
        provisioner.provision_batch(h.batch("db"), &cancel),
    );
    assert_eq!(a.unwrap(), 2);
    assert_eq!(b.unwrap(), 2);

    for instance in &instances {
        assert_eq!(h.entry(instance.uuid).migration_status, MigrationStatus::Idle);
    }
    let target = h.target.lock();
    assert_eq!(target.create_calls, 4);
    assert_eq!(target.max_concurrent_creates, 1);
}

#[tokio::test]
async fn test_driver_iso_for_other_architecture_does_not_match() {
    let h = Harness::new().await;
    let win01 = fixtures::windows_instance("win01");
    h.add_instances(&[win01.clone()]);
    h.add_worker_and_sdk().await;
    h.add_artifact(fixtures::driver_iso_artifact("aarch64"), "virtio-win-arm.iso")
        .await;

    h.start_batch(fixtures::batch("wave-1", "true")).await;
    assert_eq!(h.entry(win01.uuid).migration_status, MigrationStatus::Blocked);
}

#[tokio::test]
async fn test_missing_worker_artifact_errors_batch() {
    let h = Harness::new().await;
    let web01 = fixtures::linux_instance("web01");
    let web02 = fixtures::linux_instance("web02");
    h.add_instances(&[web01.clone(), web02.clone()]);

    h.start_batch(fixtures::batch("wave-1", "true")).await;
    h.provision().await;

    let batch = h.batch("wave-1");
    assert_eq!(batch.status, BatchStatus::Error);
    assert!(batch.status_message.contains("worker"));
    assert_eq!(h.entry(web01.uuid).migration_status, MigrationStatus::Waiting);
    assert_eq!(h.entry(web02.uuid).migration_status, MigrationStatus::Waiting);
    assert_eq!(h.target.lock().create_calls, 0);
}

#[tokio::test]
async fn test_missing_sdk_errors_batch() {
    let h = Harness::new().await;
    let web01 = fixtures::linux_instance("web01");
    h.add_instances(&[web01.clone()]);
    h.add_artifact(fixtures::worker_artifact(), "worker.img").await;

    h.start_batch(fixtures::batch("wave-1", "true")).await;
    h.provision().await;

    let batch = h.batch("wave-1");
    assert_eq!(batch.status, BatchStatus::Error);
    assert!(batch.status_message.contains("SDK"));
    assert_eq!(h.entry(web01.uuid).migration_status, MigrationStatus::Waiting);
}

#[tokio::test]
async fn test_start_failure_reverts_vm_in_cleanup_mode() {
    let h = Harness::new().await;
    let web01 = fixtures::linux_instance("web01");
    let web02 = fixtures::linux_instance("web02");
    h.add_instances(&[web01.clone(), web02.clone()]);
    h.add_worker_and_sdk().await;
    h.target.lock().fail_start.insert("web02".to_string());

    h.start_batch(fixtures::batch("wave-1", "true")).await;
    h.provision().await;

    assert_eq!(h.entry(web01.uuid).migration_status, MigrationStatus::Idle);
    let failed = h.entry(web02.uuid);
    assert_eq!(failed.migration_status, MigrationStatus::Waiting);
    assert!(failed.migration_status_message.contains("Failed to start VM"));

    let target = h.target.lock();
    assert_eq!(target.deleted, vec!["web02".to_string()]);
    assert!(!target.vms.contains_key("web02"));
    assert!(!target.has_volume(fixtures::POOL, "web02-worker"));
    assert!(target.vms.contains_key("web01"));
}

#[tokio::test]
async fn test_start_failure_without_cleanup_errors_instance() {
    let h = Harness::new().await;
    let web01 = fixtures::linux_instance("web01");
    h.add_instances(&[web01.clone()]);
    h.add_worker_and_sdk().await;
    h.target.lock().fail_start.insert("web01".to_string());

    let mut batch = fixtures::batch("wave-1", "true");
    batch.config.cleanup_on_failure = false;
    h.start_batch(batch).await;
    h.provision().await;

    assert_eq!(h.entry(web01.uuid).migration_status, MigrationStatus::Error);
    assert_eq!(h.batch("wave-1").status, BatchStatus::Running);
    let target = h.target.lock();
    assert!(target.deleted.is_empty());
    assert!(target.vms.contains_key("web01"));
}

#[tokio::test]
async fn test_silent_agent_reverts_vm() {
    let h = Harness::new().await;
    let web01 = fixtures::linux_instance("web01");
    h.add_instances(&[web01.clone()]);
    h.add_worker_and_sdk().await;
    h.target.lock().silent_agents.insert("web01".to_string());

    h.start_batch(fixtures::batch("wave-1", "true")).await;
    h.provision().await;

    let entry = h.entry(web01.uuid);
    assert_eq!(entry.migration_status, MigrationStatus::Waiting);
    assert!(entry.migration_status_message.contains("Timed out waiting for agent"));
    assert_eq!(h.target.lock().deleted, vec!["web01".to_string()]);
}

#[tokio::test]
async fn test_unreachable_target_keeps_instances_retryable() {
    let h = Harness::new().await;
    let web01 = fixtures::linux_instance("web01");
    h.add_instances(&[web01.clone()]);
    h.add_worker_and_sdk().await;

    h.start_batch(fixtures::batch("wave-1", "true")).await;
    h.target.lock().unreachable = true;
    h.provision().await;

    assert_eq!(h.entry(web01.uuid).migration_status, MigrationStatus::Waiting);
    assert_eq!(h.batch("wave-1").status, BatchStatus::Running);

    h.target.lock().unreachable = false;
    h.provision().await;
    assert_eq!(h.entry(web01.uuid).migration_status, MigrationStatus::Idle);
}

#[tokio::test]
async fn test_unreachable_target_leaves_batch_queued() {
    let h = Harness::new().await;
    let web01 = fixtures::linux_instance("web01");
    h.add_instances(&[web01.clone()]);
    h.target.lock().unreachable = true;

    h.start_batch(fixtures::batch("wave-1", "true")).await;
    assert_eq!(h.batch("wave-1").status, BatchStatus::Queued);

    h.target.lock().unreachable = false;
    QueueRunner::new(h.ctx.clone()).run_once().await.unwrap();
    assert_eq!(h.batch("wave-1").status, BatchStatus::Running);
    assert_eq!(h.entry(web01.uuid).migration_status, MigrationStatus::Waiting);
}

#[tokio::test]
async fn test_provisioning_is_idempotent() {
    let h = Harness::new().await;
    let web01 = fixtures::linux_instance("web01");
    let web02 = fixtures::linux_instance("web02");
    h.add_instances(&[web01, web02]);
    h.add_worker_and_sdk().await;

    h.start_batch(fixtures::batch("wave-1", "true")).await;
    h.provision().await;
    assert_eq!(h.target.lock().create_calls, 2);

    h.provision().await;
    h.provision().await;
    let target = h.target.lock();
    assert_eq!(target.create_calls, 2);
    assert_eq!(target.imports, 1);
}

#[tokio::test]
async fn test_existing_worker_volume_skips_creation() {
    let h = Harness::new().await;
    let web01 = fixtures::linux_instance("web01");
    h.add_instances(&[web01.clone()]);
    h.add_worker_and_sdk().await;

    h.start_batch(fixtures::batch("wave-1", "true")).await;
    // Left behind by an attempt interrupted after creation.
    {
        let mut target = h.target.lock();
        target.add_volume(fixtures::POOL, "web01-worker");
        let definition = migration_endpoint::VmDefinition {
            name: "web01".to_string(),
            project: fixtures::PROJECT.to_string(),
            architecture: "x86_64".to_string(),
            config: Default::default(),
            devices: Default::default(),
        };
        target.vms.insert("web01".to_string(), definition);
    }

    h.provision().await;
    assert_eq!(h.entry(web01.uuid).migration_status, MigrationStatus::Idle);
    assert_eq!(h.target.lock().create_calls, 0);
}

#[tokio::test]
async fn test_concurrent_runs_import_once_per_pool() {
    let h = Harness::new().await;
    let instances = [
        fixtures::linux_instance("web01"),
        fixtures::linux_instance("web02"),
        fixtures::linux_instance("db01"),
        fixtures::linux_instance("db02"),
    ];
    h.add_instances(&instances);
    h.add_worker_and_sdk().await;
    h.target.lock().import_delay = std::time::Duration::from_millis(50);

    h.start_batch(fixtures::batch("web", "name matches \"web*\"")).await;
    h.start_batch(fixtures::batch("db", "name matches \"db*\"")).await;

    let cancel = CancellationToken::new();
    let first = Provisioner::new(h.ctx.clone());
    let second = Provisioner::new(h.ctx.clone());
    let (a, b) = tokio::join!(
        first.provision_batch(h.batch("web"), &cancel),
        second.provision_batch(h.batch("db"), &cancel),
    );
    assert_eq!(a.unwrap(), 2);
    assert_eq!(b.unwrap(), 2);

    for instance in &instances {
        assert_eq!(h.entry(instance.uuid).migration_status, MigrationStatus::Idle);
    }
    let target = h.target.lock();
    assert_eq!(target.max_concurrent_imports, 1);
    assert_eq!(target.imports, 1);
}

#[tokio::test]
async fn test_constraint_limits_in_flight_instances() {
    let h = Harness::new().await;
    let instances = [
        fixtures::linux_instance("web01"),
        fixtures::linux_instance("web02"),
        fixtures::linux_instance("web03"),
    ];
    h.add_instances(&instances);
    h.add_worker_and_sdk().await;

    let mut batch = fixtures::batch("wave-1", "true");
    batch.constraints.push(migration_types::Constraint {
        name: "two-at-a-time".to_string(),
        include_expression: "true".to_string(),
        max_concurrent_instances: Some(2),
    });
    h.start_batch(batch).await;
    h.provision().await;

    let statuses: Vec<_> = instances
        .iter()
        .map(|i| h.entry(i.uuid).migration_status)
        .collect();
    assert_eq!(statuses.iter().filter(|s| **s == MigrationStatus::Idle).count(), 2);
    assert_eq!(statuses.iter().filter(|s| **s == MigrationStatus::Waiting).count(), 1);

    // Idle instances still count as in flight.
    h.provision().await;
    assert_eq!(h.target.lock().create_calls, 2);
}

#[tokio::test]
async fn test_placement_validation_blocks_only_that_instance() {
    let h = Harness::new().await;
    let web01 = fixtures::linux_instance("web01");
    let mut web02 = fixtures::linux_instance("web02");
    let hwaddr = web02.properties.nics[0].hardware_address.clone();
    web02.overrides.networks.insert(hwaddr, "dmz".to_string());
    h.add_instances(&[web01.clone(), web02.clone()]);
    h.add_worker_and_sdk().await;

    h.start_batch(fixtures::batch("wave-1", "true")).await;

    let blocked = h.entry(web02.uuid);
    assert_eq!(blocked.migration_status, MigrationStatus::Blocked);
    assert!(blocked.migration_status_message.contains("Network dmz"));
    assert_eq!(h.entry(web01.uuid).migration_status, MigrationStatus::Waiting);
    assert_eq!(h.batch("wave-1").status, BatchStatus::Running);

    // Creating the network on the target lifts the block.
    h.target
        .lock()
        .details
        .networks_by_project
        .entry(fixtures::PROJECT.to_string())
        .or_default()
        .insert("dmz".to_string());
    QueueRunner::new(h.ctx.clone()).run_once().await.unwrap();
    let entry = h.entry(web02.uuid);
    assert_eq!(entry.migration_status, MigrationStatus::Waiting);
    assert_eq!(entry.placement.networks.values().next().map(String::as_str), Some("dmz"));
}

#[tokio::test]
async fn test_restrictions_block_instance() {
    let h = Harness::new().await;
    let mut web01 = fixtures::linux_instance("web01");
    web01.properties.nics[0].ipv4_address = None;
    h.add_instances(&[web01.clone()]);

    h.start_batch(fixtures::batch("wave-1", "true")).await;

    let entry = h.entry(web01.uuid);
    assert_eq!(entry.migration_status, MigrationStatus::Blocked);
    assert!(entry.migration_status_message.contains("no IPv4 address"));
}

#[tokio::test]
async fn test_cancelled_run_leaves_instances_retryable() {
    let h = Harness::new().await;
    let web01 = fixtures::linux_instance("web01");
    h.add_instances(&[web01.clone()]);
    h.add_worker_and_sdk().await;
    h.start_batch(fixtures::batch("wave-1", "true")).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    Provisioner::new(h.ctx.clone())
        .run_once(&cancel)
        .await
        .unwrap();

    assert_eq!(h.entry(web01.uuid).migration_status, MigrationStatus::Waiting);
    assert!(h.target.lock().vms.is_empty());
}
