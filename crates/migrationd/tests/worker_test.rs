//! Worker protocol, finalization and liveness.

mod common;

use common::Harness;
use migration_test::fixtures;
use migration_types::{
    BatchStatus, ImportStage, Instance, MigrationStatus, WorkerCommandType, WorkerResponse,
    WorkerResponseStatus as WorkerStatus,
};
use migrationd::finalize::Finalizer;
use migrationd::worker::WorkerHandler;
use migrationd::MigrationError;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One Linux instance provisioned up to IDLE.
async fn provisioned(h: &Harness) -> (Instance, Uuid) {
    let web01 = fixtures::linux_instance("web01");
    h.add_instances(&[web01.clone()]);
    h.add_worker_and_sdk().await;
    h.start_batch(fixtures::batch("wave-1", "true")).await;
    h.provision().await;
    let token = h.entry(web01.uuid).secret_token;
    (web01, token)
}

fn response(status: WorkerStatus, message: &str) -> WorkerResponse {
    WorkerResponse {
        status,
        status_message: message.to_string(),
    }
}

#[tokio::test]
async fn test_full_worker_flow() {
    let h = Harness::new().await;
    let (web01, token) = provisioned(&h).await;
    let workers = WorkerHandler::new(h.ctx.clone());
    let uuid = web01.uuid;

    let command = workers.get_command(uuid, token).unwrap();
    assert_eq!(command.command, WorkerCommandType::InitialSync);
    assert_eq!(command.location, "/dc1/vm/web01");
    assert_eq!(command.source["endpoint"], "https://vcenter.example.com");

    workers
        .apply_response(uuid, token, response(WorkerStatus::Running, "Syncing disk 1"))
        .await
        .unwrap();
    let entry = h.entry(uuid);
    assert_eq!(entry.migration_status, MigrationStatus::BackgroundImport);
    assert_eq!(entry.migration_status_message, "Syncing disk 1");

    workers
        .apply_response(uuid, token, response(WorkerStatus::Success, "Initial sync done"))
        .await
        .unwrap();
    let entry = h.entry(uuid);
    assert_eq!(entry.migration_status, MigrationStatus::Idle);
    assert!(entry.last_background_sync.is_some());

    // No migration window, so the final import may start right away.
    let command = workers.get_command(uuid, token).unwrap();
    assert_eq!(command.command, WorkerCommandType::FinalSync);
    assert_eq!(h.entry(uuid).import_stage, ImportStage::Final);

    workers
        .apply_response(uuid, token, response(WorkerStatus::Running, "Final sync"))
        .await
        .unwrap();
    assert_eq!(h.entry(uuid).migration_status, MigrationStatus::FinalImport);

    workers
        .apply_response(uuid, token, response(WorkerStatus::Success, ""))
        .await
        .unwrap();
    let entry = h.entry(uuid);
    assert_eq!(entry.migration_status, MigrationStatus::ImportComplete);
    assert_eq!(entry.import_stage, ImportStage::Complete);

    Finalizer::new(h.ctx.clone())
        .run_once(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(h.entry(uuid).migration_status, MigrationStatus::Finished);
    assert_eq!(h.instance(uuid).migration_status, MigrationStatus::Finished);
    let batch = h.batch("wave-1");
    assert_eq!(batch.status, BatchStatus::Finished);
    assert_eq!(batch.status_message, "");
    assert!(h.target.lock().post_migration.contains_key("web01"));

    let command = workers.get_command(uuid, token).unwrap();
    assert_eq!(command.command, WorkerCommandType::Shutdown);
}

#[tokio::test]
async fn test_background_sync_waits_for_interval() {
    let h = Harness::new().await;
    let web01 = fixtures::linux_instance("web01");
    h.add_instances(&[web01.clone()]);
    h.add_worker_and_sdk().await;

    // Final import only inside a window that has not opened yet.
    let mut batch = fixtures::batch("wave-1", "true");
    let now = chrono::Utc::now();
    batch.migration_windows.push(migration_types::MigrationWindow {
        start: Some(now + chrono::Duration::hours(1)),
        end: Some(now + chrono::Duration::hours(2)),
        lockout: None,
    });
    h.start_batch(batch).await;
    h.provision().await;

    let workers = WorkerHandler::new(h.ctx.clone());
    let token = h.entry(web01.uuid).secret_token;
    assert_eq!(
        workers.get_command(web01.uuid, token).unwrap().command,
        WorkerCommandType::InitialSync
    );
    workers
        .apply_response(web01.uuid, token, response(WorkerStatus::Running, ""))
        .await
        .unwrap();
    workers
        .apply_response(web01.uuid, token, response(WorkerStatus::Success, ""))
        .await
        .unwrap();

    // Synced just now, and the default interval is far longer than this test.
    assert_eq!(
        workers.get_command(web01.uuid, token).unwrap().command,
        WorkerCommandType::Idle
    );
    assert_eq!(h.entry(web01.uuid).import_stage, ImportStage::Background);

    // Once the interval has passed the next incremental sync is due.
    h.ctx
        .store
        .transaction(|tx| {
            let mut entry = tx.require_queue_entry(web01.uuid)?;
            entry.last_background_sync = Some(now - chrono::Duration::days(1));
            tx.update_queue_entry(&entry)
        })
        .unwrap();
    assert_eq!(
        workers.get_command(web01.uuid, token).unwrap().command,
        WorkerCommandType::BackgroundSync
    );
}

#[tokio::test]
async fn test_final_sync_limit() {
    let h = Harness::new().await;
    let web01 = fixtures::linux_instance("web01");
    let web02 = fixtures::linux_instance("web02");
    h.add_instances(&[web01.clone(), web02.clone()]);
    h.add_worker_and_sdk().await;

    let mut batch = fixtures::batch("wave-1", "true");
    batch.config.final_sync_limit = 1;
    h.start_batch(batch).await;
    h.provision().await;

    let workers = WorkerHandler::new(h.ctx.clone());
    let tokens: Vec<(Uuid, Uuid)> = [web01.uuid, web02.uuid]
        .into_iter()
        .map(|uuid| (uuid, h.entry(uuid).secret_token))
        .collect();
    for &(uuid, token) in &tokens {
        workers.get_command(uuid, token).unwrap();
        workers
            .apply_response(uuid, token, response(WorkerStatus::Running, ""))
            .await
            .unwrap();
        workers
            .apply_response(uuid, token, response(WorkerStatus::Success, ""))
            .await
            .unwrap();
    }

    let (first, first_token) = tokens[0];
    let (second, second_token) = tokens[1];
    assert_eq!(
        workers.get_command(first, first_token).unwrap().command,
        WorkerCommandType::FinalSync
    );
    workers
        .apply_response(first, first_token, response(WorkerStatus::Running, ""))
        .await
        .unwrap();

    // The one final slot is taken.
    assert_eq!(
        workers.get_command(second, second_token).unwrap().command,
        WorkerCommandType::Idle
    );
    // The holder keeps getting its command.
    assert_eq!(
        workers.get_command(first, first_token).unwrap().command,
        WorkerCommandType::FinalSync
    );
}

#[tokio::test]
async fn test_final_success_requires_final_import() {
    let h = Harness::new().await;
    let (web01, token) = provisioned(&h).await;
    let workers = WorkerHandler::new(h.ctx.clone());

    workers.get_command(web01.uuid, token).unwrap();
    workers
        .apply_response(web01.uuid, token, response(WorkerStatus::Running, ""))
        .await
        .unwrap();
    workers
        .apply_response(web01.uuid, token, response(WorkerStatus::Success, ""))
        .await
        .unwrap();
    assert_eq!(
        workers.get_command(web01.uuid, token).unwrap().command,
        WorkerCommandType::FinalSync
    );

    // Reporting success of the final sync without ever running it.
    let result = workers
        .apply_response(web01.uuid, token, response(WorkerStatus::Success, ""))
        .await;
    assert!(result.is_err());
    assert_eq!(h.entry(web01.uuid).migration_status, MigrationStatus::Idle);
}

#[tokio::test]
async fn test_invalid_token_is_rejected() {
    let h = Harness::new().await;
    let (web01, _) = provisioned(&h).await;
    let workers = WorkerHandler::new(h.ctx.clone());
    let before = h.entry(web01.uuid);

    let err = workers.get_command(web01.uuid, Uuid::new_v4()).unwrap_err();
    assert!(matches!(err, MigrationError::Authentication(uuid) if uuid == web01.uuid));

    let err = workers
        .apply_response(web01.uuid, Uuid::new_v4(), response(WorkerStatus::Failed, "boom"))
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Authentication(_)));

    let err = workers.get_command(Uuid::new_v4(), before.secret_token).unwrap_err();
    assert!(matches!(err, MigrationError::Authentication(_)));

    assert_eq!(h.entry(web01.uuid), before);
    assert!(h.source.lock().powered_on.is_empty());
}

#[tokio::test]
async fn test_worker_failure_powers_source_back_on() {
    let h = Harness::new().await;
    let (web01, token) = provisioned(&h).await;
    let workers = WorkerHandler::new(h.ctx.clone());

    workers
        .apply_response(web01.uuid, token, response(WorkerStatus::Failed, "Disk read error"))
        .await
        .unwrap();

    let entry = h.entry(web01.uuid);
    assert_eq!(entry.migration_status, MigrationStatus::Error);
    assert_eq!(entry.migration_status_message, "Disk read error");
    assert_eq!(h.source.lock().powered_on, vec!["/dc1/vm/web01".to_string()]);

    assert_eq!(
        workers.get_command(web01.uuid, token).unwrap().command,
        WorkerCommandType::Shutdown
    );

    Finalizer::new(h.ctx.clone()).complete_batches().unwrap();
    let batch = h.batch("wave-1");
    assert_eq!(batch.status, BatchStatus::Finished);
    assert_eq!(batch.status_message, "1 of 1 instances failed");
}

#[tokio::test]
async fn test_stopped_batch_idles_workers() {
    let h = Harness::new().await;
    let (web01, token) = provisioned(&h).await;
    migrationd::BatchManager::new(h.ctx.clone())
        .stop_batch("wave-1")
        .await
        .unwrap();

    let workers = WorkerHandler::new(h.ctx.clone());
    assert_eq!(
        workers.get_command(web01.uuid, token).unwrap().command,
        WorkerCommandType::Idle
    );
}

#[tokio::test]
async fn test_silent_worker_times_out() {
    let h = Harness::with_config(|config| config.worker_timeout_secs = 30).await;
    let (web01, _) = provisioned(&h).await;
    let workers = WorkerHandler::new(h.ctx.clone());

    assert_eq!(workers.check_liveness().unwrap(), 0);

    h.ctx
        .store
        .transaction(|tx| {
            let mut entry = tx.require_queue_entry(web01.uuid)?;
            entry.last_worker_update = Some(chrono::Utc::now() - chrono::Duration::seconds(60));
            tx.update_queue_entry(&entry)
        })
        .unwrap();

    assert_eq!(workers.check_liveness().unwrap(), 1);
    let entry = h.entry(web01.uuid);
    assert_eq!(entry.migration_status, MigrationStatus::Error);
    assert_eq!(entry.migration_status_message, "Timed out waiting for worker");

    // Already errored, nothing left to time out.
    assert_eq!(workers.check_liveness().unwrap(), 0);
}

#[tokio::test]
async fn test_finalization_defers_while_target_unreachable() {
    let h = Harness::new().await;
    let (web01, token) = provisioned(&h).await;
    let workers = WorkerHandler::new(h.ctx.clone());
    // One background round, then the final one.
    for _ in 0..2 {
        workers.get_command(web01.uuid, token).unwrap();
        for status in [WorkerStatus::Running, WorkerStatus::Success] {
            workers
                .apply_response(web01.uuid, token, response(status, ""))
                .await
                .unwrap();
        }
    }
    assert_eq!(h.entry(web01.uuid).migration_status, MigrationStatus::ImportComplete);

    h.target.lock().unreachable = true;
    let finalizer = Finalizer::new(h.ctx.clone());
    finalizer.run_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(h.entry(web01.uuid).migration_status, MigrationStatus::ImportComplete);
    assert_eq!(h.batch("wave-1").status, BatchStatus::Running);

    h.target.lock().unreachable = false;
    finalizer.run_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(h.entry(web01.uuid).migration_status, MigrationStatus::Finished);
}

#[tokio::test]
async fn test_window_opening_mid_sync_waits_for_sync_to_finish() {
    let h = Harness::new().await;
    let web01 = fixtures::linux_instance("web01");
    h.add_instances(&[web01.clone()]);
    h.add_worker_and_sdk().await;

    let mut batch = fixtures::batch("wave-1", "true");
    let now = chrono::Utc::now();
    batch.migration_windows.push(migration_types::MigrationWindow {
        start: Some(now + chrono::Duration::hours(1)),
        end: Some(now + chrono::Duration::hours(2)),
        lockout: None,
    });
    h.start_batch(batch).await;
    h.provision().await;

    let workers = WorkerHandler::new(h.ctx.clone());
    let uuid = web01.uuid;
    let token = h.entry(uuid).secret_token;
    workers.get_command(uuid, token).unwrap();
    workers
        .apply_response(uuid, token, response(WorkerStatus::Success, ""))
        .await
        .unwrap();

    // A background sync is due and gets under way.
    h.ctx
        .store
        .transaction(|tx| {
            let mut entry = tx.require_queue_entry(uuid)?;
            entry.last_background_sync = Some(now - chrono::Duration::days(1));
            tx.update_queue_entry(&entry)
        })
        .unwrap();
    assert_eq!(
        workers.get_command(uuid, token).unwrap().command,
        WorkerCommandType::BackgroundSync
    );
    workers
        .apply_response(uuid, token, response(WorkerStatus::Running, "Syncing"))
        .await
        .unwrap();

    // The window opens while that sync is still running.
    h.ctx
        .store
        .transaction(|tx| {
            let mut batch = tx.require_batch("wave-1")?;
            batch.migration_windows.clear();
            tx.update_batch(&batch)
        })
        .unwrap();

    let command = workers.get_command(uuid, token).unwrap();
    assert_ne!(command.command, WorkerCommandType::FinalSync);
    let entry = h.entry(uuid);
    assert_eq!(entry.import_stage, ImportStage::Background);
    assert_eq!(entry.migration_status, MigrationStatus::BackgroundImport);

    // The running sync still completes as a background sync.
    workers
        .apply_response(uuid, token, response(WorkerStatus::Success, ""))
        .await
        .unwrap();
    let entry = h.entry(uuid);
    assert_eq!(entry.migration_status, MigrationStatus::Idle);
    assert_eq!(entry.import_stage, ImportStage::Background);

    // Only now does the final import begin.
    assert_eq!(
        workers.get_command(uuid, token).unwrap().command,
        WorkerCommandType::FinalSync
    );
    workers
        .apply_response(uuid, token, response(WorkerStatus::Running, "Final sync"))
        .await
        .unwrap();
    workers
        .apply_response(uuid, token, response(WorkerStatus::Success, ""))
        .await
        .unwrap();
    let entry = h.entry(uuid);
    assert_eq!(entry.migration_status, MigrationStatus::ImportComplete);
    assert_eq!(entry.import_stage, ImportStage::Complete);
}
