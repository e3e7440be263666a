//! Session bookkeeping — one server-side session per client address.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;

use shuttle_core::ConfirmResult;

/// How a worker's session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Every token acknowledged and the checksum offered.
    Completed,
    /// Ended after telling the client `result`.
    Failed(ConfirmResult),
    /// Idle timeout before the transfer finished.
    TimedOut,
    /// Ended by a local error the client was not told about.
    Aborted(String),
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::Completed => f.write_str("completed"),
            SessionOutcome::Failed(result) => write!(f, "failed ({result})"),
            SessionOutcome::TimedOut => f.write_str("timed out"),
            SessionOutcome::Aborted(reason) => write!(f, "aborted: {reason}"),
        }
    }
}

/// Summary a worker hands back when it finishes.
#[derive(Debug, Clone)]
pub struct SessionReport {
    /// Registry-assigned, unique for the life of the process.
    pub session: u64,
    pub peer: SocketAddr,
    /// Requested path, if a REQUEST was ever accepted.
    pub path: Option<String>,
    pub tokens: usize,
    /// Offsets retransmitted because of PACKET_MISS or a repeated REQUEST.
    pub resent: Vec<u64>,
    pub outcome: SessionOutcome,
    /// Datagrams queued behind the one that ended the session. The registry
    /// routes them to a fresh session.
    pub backlog: Vec<Bytes>,
}

/// Registry's handle on a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    pub session: u64,
    pub inbound: mpsc::Sender<Bytes>,
}

impl WorkerHandle {
    /// The worker has exited and dropped its queue.
    pub fn is_done(&self) -> bool {
        self.inbound.is_closed()
    }
}

/// The worker table — shared between the router and the reaper.
pub type WorkerTable = Arc<DashMap<SocketAddr, WorkerHandle>>;

pub fn new_worker_table() -> WorkerTable {
    Arc::new(DashMap::new())
}
