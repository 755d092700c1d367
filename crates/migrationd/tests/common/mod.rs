//! Shared setup for engine integration tests.

#![allow(dead_code)]

use migration_test::{fixtures, FakeFactory, SourceState, TargetState};
use migration_types::{Artifact, Batch, Instance, QueueEntry, SourceType};
use migrationd::batch::BatchManager;
use migrationd::provision::Provisioner;
use migrationd::queue::QueueRunner;
use migrationd::{Context, DaemonConfig, Store};
use parking_lot::Mutex;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct Harness {
    pub ctx: Context,
    pub factory: Arc<FakeFactory>,
    pub target: Arc<Mutex<TargetState>>,
    pub source: Arc<Mutex<SourceState>>,
    _dir: TempDir,
    _worker_listener: TcpListener,
}

impl Harness {
    /// Engine with one source, one target and the fixture network mapping.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(adjust: impl FnOnce(&mut DaemonConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut config = DaemonConfig {
            database_path: dir.path().join("migrationd.db"),
            artifacts_dir: dir.path().join("artifacts"),
            worker_endpoint: format!("https://127.0.0.1:{}", port),
            agent_timeout_secs: 1,
            agent_poll_interval_ms: 10,
            ..Default::default()
        };
        adjust(&mut config);

        let factory = Arc::new(FakeFactory::new());
        let target = factory.add_target(fixtures::TARGET, fixtures::target_details());
        let source = factory.add_source(fixtures::SOURCE);

        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .transaction(|tx| {
                tx.create_source(&fixtures::source())?;
                tx.create_target(&fixtures::target())?;
                tx.upsert_network(&fixtures::source_network())
            })
            .unwrap();

        let ctx = Context::new(store, factory.clone(), config).unwrap();
        Self {
            ctx,
            factory,
            target,
            source,
            _dir: dir,
            _worker_listener: listener,
        }
    }

    pub fn add_instances(&self, instances: &[Instance]) {
        self.ctx
            .store
            .transaction(|tx| {
                for instance in instances {
                    tx.create_instance(instance)?;
                }
                Ok::<_, migrationd::StoreError>(())
            })
            .unwrap();
    }

    /// Registers `artifact` and gives it a local file.
    pub async fn add_artifact(&self, artifact: Artifact, file_name: &str) {
        self.ctx
            .store
            .transaction(|tx| tx.create_artifact(&artifact))
            .unwrap();
        self.ctx
            .artifacts
            .write_file(artifact.uuid, file_name, b"contents")
            .await
            .unwrap();
    }

    /// Registers `artifact` with only a download URL.
    pub fn add_remote_artifact(&self, mut artifact: Artifact, url: String) {
        artifact.source_url = Some(url);
        self.ctx
            .store
            .transaction(|tx| tx.create_artifact(&artifact))
            .unwrap();
    }

    /// Worker image plus the SDK the fixture source needs.
    pub async fn add_worker_and_sdk(&self) {
        self.add_artifact(fixtures::worker_artifact(), "worker.img").await;
        self.add_artifact(fixtures::sdk_artifact(SourceType::Vmware), "sdk.tar.gz")
            .await;
    }

    /// Creates and starts `batch`, then runs one queue pass.
    pub async fn start_batch(&self, batch: Batch) {
        let name = batch.name.clone();
        let manager = BatchManager::new(self.ctx.clone());
        manager.create_batch(batch).unwrap();
        manager.start_batch(&name).await.unwrap();
        QueueRunner::new(self.ctx.clone()).run_once().await.unwrap();
    }

    pub async fn provision(&self) {
        Provisioner::new(self.ctx.clone())
            .run_once(&CancellationToken::new())
            .await
            .unwrap();
    }

    pub fn instance(&self, uuid: Uuid) -> Instance {
        self.ctx
            .store
            .transaction(|tx| tx.require_instance(uuid))
            .unwrap()
    }

    pub fn entry(&self, uuid: Uuid) -> QueueEntry {
        self.ctx
            .store
            .transaction(|tx| tx.require_queue_entry(uuid))
            .unwrap()
    }

    pub fn batch(&self, name: &str) -> Batch {
        self.ctx
            .store
            .transaction(|tx| tx.require_batch(name))
            .unwrap()
    }
}

/// Serves `body` over plain HTTP for every request; returns the file URL.
pub async fn serve_file(file_name: &str, body: &'static [u8]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/files/{}", listener.local_addr().unwrap(), file_name);

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(head.as_bytes()).await;
                let _ = stream.write_all(body).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    url
}
