//! Shuttle integration test harness.
//!
//! Every test runs a real server (registry, reaper, server loop) on a
//! loopback UDP socket inside the test's runtime and drives it with a real
//! receiver. Timeouts are shortened so recovery paths run in milliseconds.
//!
//!   cargo test --test integration
//!
//! Each test owns its scratch directory and its server; nothing is shared.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use shuttle_services::{
    serve, FsStore, Receiver, ReceiverSettings, Registry, SessionError, SessionReport,
    TransferReport, WorkerSettings,
};

mod failures;
mod recovery;
mod transfer;

// ── Harness ───────────────────────────────────────────────────────────────────

static SCRATCH: AtomicU64 = AtomicU64::new(0);

/// Fresh, empty scratch directory unique to this process and call.
pub fn scratch_dir(label: &str) -> PathBuf {
    let id = SCRATCH.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "shuttle-it-{label}-{}-{id}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("create scratch dir");
    dir
}

/// Deterministic, non-repeating-per-chunk test content.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}

pub fn worker_settings(chunk_size: usize) -> WorkerSettings {
    WorkerSettings {
        chunk_size,
        idle_timeout: Duration::from_secs(3),
        ..WorkerSettings::default()
    }
}

pub fn receiver_settings(out: &Path) -> ReceiverSettings {
    ReceiverSettings {
        retransmit_timeout: Duration::from_millis(300),
        max_stalls: 8,
        output_dir: out.to_path_buf(),
        ..ReceiverSettings::default()
    }
}

/// A running server. Shut down on drop.
pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: Registry,
    shutdown: broadcast::Sender<()>,
}

impl TestServer {
    pub async fn start(settings: WorkerSettings) -> Result<Self> {
        let socket = Arc::new(
            UdpSocket::bind("127.0.0.1:0")
                .await
                .context("bind server socket")?,
        );
        let addr = socket.local_addr()?;
        let (registry, reaper) = Registry::new(socket.clone(), Arc::new(FsStore::new()), settings);

        let (shutdown, _) = broadcast::channel(1);
        tokio::spawn(reaper.run(shutdown.subscribe()));
        tokio::spawn(serve(socket, registry.clone(), shutdown.subscribe()));

        Ok(Self {
            addr,
            registry,
            shutdown,
        })
    }

    pub fn reports(&self) -> broadcast::Receiver<SessionReport> {
        self.registry.subscribe()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

/// Fetch `path` from `server` with a fresh receiver.
pub async fn fetch(
    server: SocketAddr,
    path: &str,
    settings: ReceiverSettings,
) -> Result<TransferReport, SessionError> {
    let mut receiver = Receiver::connect(server, Arc::new(FsStore::new()), settings).await?;
    receiver.request_file(path).await
}

/// Next session report, or panic after a few seconds.
pub async fn next_report(reports: &mut broadcast::Receiver<SessionReport>) -> SessionReport {
    tokio::time::timeout(Duration::from_secs(10), reports.recv())
        .await
        .expect("no session report")
        .expect("report channel closed")
}

pub fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
