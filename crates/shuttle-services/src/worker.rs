//! Worker — the server side of one transfer session.
//!
//! A worker owns everything about its session: the open content, the
//! token table, the state machine. The registry feeds it raw datagrams
//! from its client over a bounded queue; the worker decodes them, answers
//! on the shared socket, and exits when the transfer completes, fails, or
//! goes idle. Nothing else touches its state, so there are no locks.
//!
//! Stop-and-wait: exactly one chunk is outstanding at a time. The next
//! chunk goes out only after the outstanding one is acknowledged.

use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use shuttle_core::config::ShuttleConfig;
use shuttle_core::{parse_token_id, token_id};
use shuttle_core::wire::{
    chunk_frame_len, ConfirmResult, Confirmation, FileChunk, Message, RequestFile, Verb, WireError,
};

use crate::error::SessionError;
use crate::session::{SessionOutcome, SessionReport};
use crate::store::ContentStore;
use crate::tokenizable::TokenizableFile;

/// Knobs shared by every worker the registry spawns.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub chunk_size: usize,
    pub max_datagram: usize,
    pub idle_timeout: Duration,
    /// Requests resolve under this directory when set.
    pub serve_root: Option<PathBuf>,
    pub queue_depth: usize,
}

impl WorkerSettings {
    pub fn from_config(config: &ShuttleConfig) -> Self {
        Self {
            chunk_size: config.protocol.chunk_size,
            max_datagram: config.protocol.max_datagram,
            idle_timeout: config.server.idle_timeout(),
            serve_root: config.server.serve_root().map(Path::to_path_buf),
            queue_depth: config.server.queue_depth,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&ShuttleConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Fresh session, no REQUEST accepted yet.
    AwaitingRequest,
    /// A chunk is being put on the wire.
    Sending,
    /// Chunk at this offset is outstanding.
    AwaitingConfirmation(u64),
    /// All tokens acknowledged, checksum offered. Stays alive to re-offer it.
    Completed,
}

pub struct Worker {
    session: u64,
    peer: SocketAddr,
    socket: Arc<UdpSocket>,
    inbound: mpsc::Receiver<Bytes>,
    store: Arc<dyn ContentStore>,
    settings: WorkerSettings,
    state: WorkerState,
    file: Option<TokenizableFile>,
    path: Option<String>,
    resent: Vec<u64>,
    /// Datagrams that belong to the client's next session.
    backlog: Vec<Bytes>,
}

impl Worker {
    pub fn new(
        session: u64,
        peer: SocketAddr,
        socket: Arc<UdpSocket>,
        inbound: mpsc::Receiver<Bytes>,
        store: Arc<dyn ContentStore>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            session,
            peer,
            socket,
            inbound,
            store,
            settings,
            state: WorkerState::AwaitingRequest,
            file: None,
            path: None,
            resent: Vec::new(),
            backlog: Vec::new(),
        }
    }

    /// Serve the session until it ends, then report how it went. Datagrams
    /// still queued at that point come back in [`SessionReport::backlog`].
    pub async fn run(mut self) -> SessionReport {
        tracing::debug!(session = self.session, peer = %self.peer, "worker started");

        let outcome = loop {
            let packet =
                match tokio::time::timeout(self.settings.idle_timeout, self.inbound.recv()).await {
                    Ok(Some(packet)) => packet,
                    Ok(None) => break SessionOutcome::Aborted("inbound queue closed".into()),
                    Err(_) => break self.on_idle(),
                };

            match self.handle_packet(&packet).await {
                Ok(None) => {}
                Ok(Some(outcome)) => break outcome,
                Err(e) => break self.fail(e).await,
            }
        };

        self.finish(outcome)
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    async fn handle_packet(&mut self, packet: &Bytes) -> Result<Option<SessionOutcome>, SessionError> {
        let message = match Message::decode(packet) {
            Ok(m) => m,
            Err(
                e @ WireError::Malformed {
                    verb: Verb::Request | Verb::Confirmation,
                    ..
                },
            ) => return Err(e.into()),
            Err(e) => {
                // Harmless to the session: tell the client and keep going.
                tracing::debug!(session = self.session, error = %e, "unparseable datagram");
                self.send_confirmation(Confirmation::bare(ConfirmResult::InvalidPacketFormat))
                    .await?;
                return Ok(None);
            }
        };

        match message {
            Message::Request(_) if self.state == WorkerState::Completed => {
                // Everything was delivered, so this is the client's next transfer.
                tracing::debug!(session = self.session, "new request after completion, handing off");
                self.backlog.push(packet.clone());
                return Ok(Some(SessionOutcome::Completed));
            }
            Message::Request(request) => self.on_request(request).await?,
            Message::Response(_) => {
                tracing::debug!(session = self.session, "client sent a RESPONSE, ignoring");
            }
            Message::Confirmation(confirmation) => return self.on_confirmation(confirmation).await,
        }
        Ok(None)
    }

    async fn on_request(&mut self, request: RequestFile) -> Result<(), SessionError> {
        if self.state != WorkerState::AwaitingRequest {
            if self.path.as_deref() == Some(request.path.as_str()) {
                // Client never saw our first answer.
                return self.resend_outstanding().await;
            }
            tracing::warn!(
                session = self.session,
                requested = %request.path,
                "second request for a different path, ignoring"
            );
            return Ok(());
        }

        let resolved = self.resolve(&request.path)?;
        let mut file = TokenizableFile::open(self.store.as_ref(), &resolved, self.settings.chunk_size)
            .map_err(|e| {
                tracing::debug!(session = self.session, error = %e, "cannot open requested content");
                SessionError::ContentNotFound(request.path.clone())
            })?;
        self.path = Some(request.path);

        let checksum = file.compute_checksum()?.to_string();
        let tokens = file.tokenize();
        tracing::info!(
            session = self.session,
            peer = %self.peer,
            path = %resolved.display(),
            bytes = file.size(),
            tokens,
            checksum = %checksum,
            "transfer started"
        );

        self.file = Some(file);
        self.advance().await
    }

    async fn on_confirmation(
        &mut self,
        confirmation: Confirmation,
    ) -> Result<Option<SessionOutcome>, SessionError> {
        match confirmation.result {
            ConfirmResult::Ok => self.on_ack(&confirmation.token).await?,
            ConfirmResult::PacketMiss | ConfirmResult::InvalidPacketFormat => {
                self.resend_outstanding().await?
            }
            ConfirmResult::ValidChecksum if self.file.is_some() => {
                tracing::info!(session = self.session, peer = %self.peer, "client verified checksum");
                return Ok(Some(SessionOutcome::Completed));
            }
            other => {
                tracing::debug!(session = self.session, result = %other, "ignoring confirmation");
            }
        }
        Ok(None)
    }

    async fn on_ack(&mut self, token: &str) -> Result<(), SessionError> {
        let Some(file) = self.file.as_mut() else {
            tracing::debug!(session = self.session, token, "ack before any request, ignoring");
            return Ok(());
        };

        // Only the chunk on the wire can be acknowledged.
        let outstanding = match self.state {
            WorkerState::AwaitingConfirmation(index) => parse_token_id(token).ok() == Some(index),
            _ => false,
        };
        let confirmed = if outstanding {
            file.confirm(token)
        } else {
            Err(SessionError::UnknownToken(token.to_string()))
        };

        match confirmed {
            Ok(index) => {
                tracing::trace!(session = self.session, index, "chunk acknowledged");
                self.advance().await
            }
            Err(e @ (SessionError::UnknownToken(_) | SessionError::DuplicateAck(_))) => {
                tracing::debug!(session = self.session, error = %e, state = ?self.state, "rejecting acknowledgment");
                self.send_confirmation(Confirmation::new(ConfirmResult::InvalidToken, token))
                    .await
            }
            Err(e) => Err(e),
        }
    }

    fn on_idle(&self) -> SessionOutcome {
        if self.state == WorkerState::Completed {
            // Client went quiet after the checksum offer.
            SessionOutcome::Completed
        } else {
            tracing::warn!(
                session = self.session,
                peer = %self.peer,
                state = ?self.state,
                idle = ?self.settings.idle_timeout,
                "session idle, dropping"
            );
            SessionOutcome::TimedOut
        }
    }

    // ── Outbound ──────────────────────────────────────────────────────────────

    /// Put the next pending chunk on the wire, or offer the checksum once
    /// every token is acknowledged.
    async fn advance(&mut self) -> Result<(), SessionError> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        match file.next_pending() {
            Some(index) => {
                self.state = WorkerState::Sending;
                self.send_chunk(index).await?;
                self.state = WorkerState::AwaitingConfirmation(index);
            }
            None => {
                self.offer_checksum().await?;
                self.state = WorkerState::Completed;
            }
        }
        Ok(())
    }

    /// Answer to PACKET_MISS or a repeated REQUEST: resend whatever the
    /// client is missing.
    async fn resend_outstanding(&mut self) -> Result<(), SessionError> {
        match self.state {
            WorkerState::AwaitingConfirmation(index) => {
                tracing::debug!(session = self.session, index, "resending outstanding chunk");
                self.resent.push(index);
                self.send_chunk(index).await
            }
            WorkerState::Completed => self.offer_checksum().await,
            WorkerState::AwaitingRequest | WorkerState::Sending => Ok(()),
        }
    }

    async fn send_chunk(&self, index: u64) -> Result<(), SessionError> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let data = file.read_chunk(index)?;
        let chunk = FileChunk {
            token: token_id(index),
            chunk: data.to_vec(),
            // The first token carries the whole-content checksum.
            checksum: if index == 0 {
                file.checksum().map(str::to_string)
            } else {
                None
            },
        };
        let frame = Message::from(chunk).encode()?;
        if frame.len() > self.settings.max_datagram {
            tracing::warn!(
                session = self.session,
                len = frame.len(),
                bound = chunk_frame_len(self.settings.chunk_size),
                max = self.settings.max_datagram,
                "chunk frame exceeds max datagram"
            );
        }
        self.socket.send_to(&frame, self.peer).await?;
        Ok(())
    }

    async fn offer_checksum(&self) -> Result<(), SessionError> {
        let checksum = self
            .file
            .as_ref()
            .and_then(|f| f.checksum())
            .unwrap_or_default()
            .to_string();
        tracing::debug!(session = self.session, "offering checksum");
        self.send_confirmation(Confirmation::new(ConfirmResult::ValidChecksum, checksum))
            .await
    }

    async fn send_confirmation(&self, confirmation: Confirmation) -> Result<(), SessionError> {
        let frame = Message::from(confirmation).encode()?;
        self.socket.send_to(&frame, self.peer).await?;
        Ok(())
    }

    // ── Termination ───────────────────────────────────────────────────────────

    async fn fail(&self, error: SessionError) -> SessionOutcome {
        match error.result() {
            Some(result) => {
                tracing::warn!(session = self.session, peer = %self.peer, error = %error, "session failed");
                if let Err(e) = self.send_confirmation(Confirmation::bare(result)).await {
                    tracing::debug!(session = self.session, error = %e, "could not notify client");
                }
                SessionOutcome::Failed(result)
            }
            None => {
                tracing::error!(session = self.session, peer = %self.peer, error = %error, "session aborted");
                SessionOutcome::Aborted(error.to_string())
            }
        }
    }

    fn finish(self, outcome: SessionOutcome) -> SessionReport {
        let Worker {
            session,
            peer,
            mut inbound,
            mut file,
            path,
            resent,
            mut backlog,
            ..
        } = self;

        // Refuse new datagrams, then keep whatever was already queued.
        inbound.close();
        while let Ok(packet) = inbound.try_recv() {
            backlog.push(packet);
        }
        if !backlog.is_empty() {
            tracing::debug!(session, queued = backlog.len(), "session ended with datagrams queued");
        }

        let tokens = file.as_ref().map_or(0, TokenizableFile::token_count);
        if let Some(file) = file.as_mut() {
            if let Err(e) = file.close() {
                tracing::debug!(session, error = %e, "closing content failed");
            }
        }

        SessionReport {
            session,
            peer,
            path,
            tokens,
            resent,
            outcome,
            backlog,
        }
    }

    /// Map a requested path onto the store, confined to the serve root if
    /// one is configured.
    fn resolve(&self, requested: &str) -> Result<PathBuf, SessionError> {
        let Some(root) = &self.settings.serve_root else {
            return Ok(PathBuf::from(requested));
        };
        let relative = Path::new(requested.trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || requested.is_empty() {
            tracing::warn!(session = self.session, requested, "path escapes serve root");
            return Err(SessionError::ContentNotFound(requested.to_string()));
        }
        Ok(root.join(relative))
    }
}
