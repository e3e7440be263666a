//! Connection registry — routes each client address to its worker.
//!
//! The first datagram from an address spawns a [`Worker`]; later ones are
//! queued to it. A worker that has exited counts as absent, so the next
//! datagram from that address starts a fresh session, as does a REQUEST
//! left queued behind the datagram that ended the previous one. Finished
//! workers report to the [`Reaper`], which drops their table entry and
//! republishes the report to subscribers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

use shuttle_core::wire::{split_frame, Verb};

use crate::session::{new_worker_table, SessionOutcome, SessionReport, WorkerHandle, WorkerTable};
use crate::store::ContentStore;
use crate::worker::{Worker, WorkerSettings};

/// How often the reaper sweeps entries whose worker exited without a report.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Report fan-out capacity. Slow subscribers lag rather than block reaping.
const REPORT_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct Registry {
    workers: WorkerTable,
    socket: Arc<UdpSocket>,
    store: Arc<dyn ContentStore>,
    settings: WorkerSettings,
    next_session: Arc<AtomicU64>,
    done_tx: mpsc::UnboundedSender<SessionReport>,
    reports: broadcast::Sender<SessionReport>,
}

impl Registry {
    /// Build a registry that answers on `socket`. The returned [`Reaper`]
    /// must be run for finished sessions to be cleaned up.
    pub fn new(
        socket: Arc<UdpSocket>,
        store: Arc<dyn ContentStore>,
        settings: WorkerSettings,
    ) -> (Self, Reaper) {
        let workers = new_worker_table();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let (reports, _) = broadcast::channel(REPORT_CAPACITY);

        let reaper = Reaper {
            workers: workers.clone(),
            done_rx,
            reports: reports.clone(),
        };
        let registry = Self {
            workers,
            socket,
            store,
            settings,
            next_session: Arc::new(AtomicU64::new(1)),
            done_tx,
            reports,
        };
        (registry, reaper)
    }

    /// Hand a datagram from `peer` to its worker, spawning one if needed.
    pub async fn route(&self, peer: SocketAddr, packet: Bytes) {
        let inbound = self.worker_for(peer);
        if let Err(mpsc::error::SendError(packet)) = inbound.send(packet).await {
            // Worker exited between lookup and send; this datagram opens a new session.
            tracing::debug!(%peer, "session ended under us, starting a fresh one");
            let inbound = self.worker_for(peer);
            if inbound.send(packet).await.is_err() {
                tracing::warn!(%peer, "fresh worker dropped its queue, datagram lost");
            }
        }
    }

    /// Sessions currently in the table, finished-but-unreaped included.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// A live worker is serving `peer`.
    pub fn is_active(&self, peer: &SocketAddr) -> bool {
        self.workers.get(peer).is_some_and(|h| !h.is_done())
    }

    /// Receive a copy of every session report from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionReport> {
        self.reports.subscribe()
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Queue of the live worker for `peer`. The shard lock is released
    /// before this returns, so callers may await on the sender.
    fn worker_for(&self, peer: SocketAddr) -> mpsc::Sender<Bytes> {
        match self.workers.entry(peer) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_done() {
                    let handle = self.spawn_worker(peer);
                    let inbound = handle.inbound.clone();
                    entry.insert(handle);
                    inbound
                } else {
                    entry.get().inbound.clone()
                }
            }
            Entry::Vacant(entry) => {
                let handle = self.spawn_worker(peer);
                let inbound = handle.inbound.clone();
                entry.insert(handle);
                inbound
            }
        }
    }

    /// Route a finished session's leftover requests to a fresh one. Anything
    /// else was addressed to the session that just ended.
    async fn requeue(&self, peer: SocketAddr, backlog: Vec<Bytes>) {
        for packet in backlog {
            if matches!(split_frame(&packet), Ok((Verb::Request, _))) {
                tracing::debug!(%peer, "requeueing request for a fresh session");
                self.route(peer, packet).await;
            } else {
                tracing::trace!(%peer, len = packet.len(), "dropping datagram for ended session");
            }
        }
    }

    fn spawn_worker(&self, peer: SocketAddr) -> WorkerHandle {
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.settings.queue_depth.max(1));
        let worker = Worker::new(
            session,
            peer,
            self.socket.clone(),
            rx,
            self.store.clone(),
            self.settings.clone(),
        );

        let registry = self.clone();
        tokio::spawn(async move {
            let mut report = worker.run().await;
            registry.requeue(peer, std::mem::take(&mut report.backlog)).await;
            let _ = registry.done_tx.send(report);
        });

        tracing::debug!(session, %peer, "session opened");
        WorkerHandle {
            session,
            inbound: tx,
        }
    }
}

/// Removes finished sessions from the table and publishes their reports.
pub struct Reaper {
    workers: WorkerTable,
    done_rx: mpsc::UnboundedReceiver<SessionReport>,
    reports: broadcast::Sender<SessionReport>,
}

impl Reaper {
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("reaper shutting down");
                    return;
                }

                Some(report) = self.done_rx.recv() => self.reap(report),

                _ = sweep.tick() => self.sweep(),
            }
        }
    }

    fn reap(&self, report: SessionReport) {
        // Only the entry for this session; the address may already have a newer one.
        self.workers
            .remove_if(&report.peer, |_, h| h.session == report.session);

        match &report.outcome {
            SessionOutcome::Completed => tracing::info!(
                session = report.session,
                peer = %report.peer,
                path = report.path.as_deref().unwrap_or("-"),
                tokens = report.tokens,
                resent = report.resent.len(),
                "session completed"
            ),
            outcome => tracing::warn!(
                session = report.session,
                peer = %report.peer,
                path = report.path.as_deref().unwrap_or("-"),
                outcome = %outcome,
                "session ended"
            ),
        }

        // No subscribers is fine.
        let _ = self.reports.send(report);
    }

    fn sweep(&self) {
        let before = self.workers.len();
        self.workers.retain(|_, h| !h.is_done());
        let swept = before.saturating_sub(self.workers.len());
        if swept > 0 {
            tracing::debug!(swept, "swept finished sessions");
        }
    }
}
