//! Receiver — the client side of a transfer.
//!
//! Sends one REQUEST, then acknowledges every chunk as it lands, writing it
//! at its offset. Silence longer than the retransmit timeout means a
//! datagram was lost somewhere: the receiver sends PACKET_MISS and the
//! server resends whatever is outstanding. After `max_stalls` silent
//! timeouts in a row the server is presumed gone.
//!
//! When the server offers VALID_CHECKSUM the output is digested and
//! compared. Any failure deletes the partial output.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use shuttle_core::config::ShuttleConfig;
use shuttle_core::parse_token_id;
use shuttle_core::wire::{
    split_frame, ConfirmResult, Confirmation, FileChunk, Message, RequestFile, Verb,
};

use crate::error::SessionError;
use crate::store::{ContentStore, StoreError};
use crate::tokenizable::{Applied, TokenizableFile};

/// Datagrams buffered between the socket reader and the state machine.
const READ_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub struct ReceiverSettings {
    pub max_datagram: usize,
    pub retransmit_timeout: Duration,
    pub max_stalls: u32,
    pub output_dir: PathBuf,
    pub output_suffix: String,
    /// Fault injection: silently drop the n-th chunk datagram (1-based).
    pub drop_nth_chunk: Option<usize>,
}

impl ReceiverSettings {
    pub fn from_config(config: &ShuttleConfig) -> Self {
        Self {
            max_datagram: config.protocol.max_datagram,
            retransmit_timeout: config.client.retransmit_timeout(),
            max_stalls: config.client.max_stalls,
            output_dir: config.client.output_dir.clone(),
            output_suffix: config.client.output_suffix.clone(),
            drop_nth_chunk: None,
        }
    }
}

impl Default for ReceiverSettings {
    fn default() -> Self {
        Self::from_config(&ShuttleConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Idle,
    /// REQUEST sent, nothing back yet.
    Requesting,
    Receiving,
    /// Went silent; PACKET_MISS sent, waiting for the resend.
    GapRecovery,
    Verifying,
    Succeeded,
    Failed,
}

/// What a successful transfer produced.
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub output: PathBuf,
    pub checksum: String,
    pub bytes: u64,
    pub tokens: usize,
    /// Chunks that arrived again after being applied.
    pub duplicates: usize,
    /// Chunks discarded by fault injection.
    pub dropped: usize,
    /// PACKET_MISS confirmations sent.
    pub gap_requests: usize,
}

pub struct Receiver {
    server: SocketAddr,
    socket: Arc<UdpSocket>,
    store: Arc<dyn ContentStore>,
    settings: ReceiverSettings,
    state: ReceiverState,
    requested: String,
    request: Bytes,
    file: Option<TokenizableFile>,
    expected_checksum: Option<String>,
    last_token: Option<String>,
    chunks_seen: usize,
    duplicates: usize,
    dropped: usize,
    gap_requests: usize,
}

impl Receiver {
    /// Bind an ephemeral local port and associate it with `server`.
    pub async fn connect(
        server: SocketAddr,
        store: Arc<dyn ContentStore>,
        settings: ReceiverSettings,
    ) -> Result<Self, SessionError> {
        let local = if server.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(server).await?;
        tracing::debug!(%server, local = %socket.local_addr()?, "receiver bound");

        Ok(Self {
            server,
            socket: Arc::new(socket),
            store,
            settings,
            state: ReceiverState::Idle,
            requested: String::new(),
            request: Bytes::new(),
            file: None,
            expected_checksum: None,
            last_token: None,
            chunks_seen: 0,
            duplicates: 0,
            dropped: 0,
            gap_requests: 0,
        })
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Where the transfer of `path` is written: the base name plus the
    /// configured suffix, under the output directory.
    pub fn output_path(&self, path: &str) -> PathBuf {
        let base = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string());
        self.settings
            .output_dir
            .join(format!("{base}{}", self.settings.output_suffix))
    }

    /// Fetch `path` from the server. On failure nothing is left on disk.
    pub async fn request_file(&mut self, path: &str) -> Result<TransferReport, SessionError> {
        let request = Message::from(RequestFile {
            path: path.to_string(),
        })
        .encode()?;
        if request.len() > self.settings.max_datagram {
            return Err(SessionError::RequestTooLarge {
                len: request.len(),
                max: self.settings.max_datagram,
            });
        }

        let output = self.output_path(path);
        self.file = Some(TokenizableFile::create(self.store.as_ref(), &output)?);
        self.requested = path.to_string();
        self.request = request;
        self.expected_checksum = None;
        self.last_token = None;
        self.chunks_seen = 0;
        self.duplicates = 0;
        self.dropped = 0;
        self.gap_requests = 0;

        tracing::info!(server = %self.server, path, output = %output.display(), "requesting file");

        let (tx, mut rx) = mpsc::channel(READ_QUEUE_DEPTH);
        let reader = tokio::spawn(read_loop(self.socket.clone(), self.settings.max_datagram, tx));

        let sent = self.socket.send(&self.request).await;
        let result = match sent {
            Ok(_) => {
                self.state = ReceiverState::Requesting;
                self.drive(&mut rx).await
            }
            Err(e) => Err(e.into()),
        };
        reader.abort();

        match result {
            Ok(report) => {
                self.state = ReceiverState::Succeeded;
                tracing::info!(
                    output = %report.output.display(),
                    bytes = report.bytes,
                    tokens = report.tokens,
                    gap_requests = report.gap_requests,
                    "transfer verified"
                );
                Ok(report)
            }
            Err(e) => {
                self.state = ReceiverState::Failed;
                tracing::warn!(path, error = %e, "transfer failed");
                self.abandon();
                Err(e)
            }
        }
    }

    // ── Event loop ────────────────────────────────────────────────────────────

    async fn drive(
        &mut self,
        inbound: &mut mpsc::Receiver<Bytes>,
    ) -> Result<TransferReport, SessionError> {
        let mut stalls = 0u32;
        loop {
            match tokio::time::timeout(self.settings.retransmit_timeout, inbound.recv()).await {
                Ok(Some(datagram)) => {
                    stalls = 0;
                    if let Some(report) = self.handle_datagram(&datagram).await? {
                        return Ok(report);
                    }
                }
                Ok(None) => {
                    return Err(SessionError::Transport(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "socket reader stopped",
                    )))
                }
                Err(_) => {
                    stalls += 1;
                    if stalls >= self.settings.max_stalls {
                        return Err(SessionError::SessionTimeout(
                            self.settings.retransmit_timeout * stalls,
                        ));
                    }
                    self.on_silence(stalls).await?;
                }
            }
        }
    }

    async fn on_silence(&mut self, stalls: u32) -> Result<(), SessionError> {
        match self.state {
            ReceiverState::Requesting => {
                tracing::debug!(stalls, "no answer yet, re-sending request");
                self.socket.send(&self.request).await?;
            }
            ReceiverState::Receiving | ReceiverState::GapRecovery => {
                self.state = ReceiverState::GapRecovery;
                self.gap_requests += 1;
                tracing::debug!(stalls, last = ?self.last_token, "stalled, asking for a resend");
                self.send(Confirmation::bare(ConfirmResult::PacketMiss)).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn handle_datagram(
        &mut self,
        datagram: &[u8],
    ) -> Result<Option<TransferReport>, SessionError> {
        if matches!(split_frame(datagram), Ok((Verb::Response, _))) {
            self.chunks_seen += 1;
            if self.settings.drop_nth_chunk == Some(self.chunks_seen) {
                self.dropped += 1;
                tracing::info!(nth = self.chunks_seen, "fault injection: dropping chunk");
                return Ok(None);
            }
        }

        let message = match Message::decode(datagram) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "skipping undecodable datagram");
                return Ok(None);
            }
        };

        match message {
            Message::Response(chunk) => {
                self.on_chunk(chunk).await?;
                Ok(None)
            }
            Message::Confirmation(confirmation) => self.on_confirmation(confirmation).await,
            Message::Request(_) => {
                tracing::warn!("server sent a REQUEST, ignoring");
                Ok(None)
            }
        }
    }

    async fn on_chunk(&mut self, chunk: FileChunk) -> Result<(), SessionError> {
        let index = match parse_token_id(&chunk.token) {
            Ok(index) => index,
            Err(e) => {
                tracing::warn!(error = %e, "chunk with malformed token, skipping");
                return Ok(());
            }
        };
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };

        if let Some(checksum) = chunk.checksum {
            self.expected_checksum.get_or_insert(checksum);
        }
        match file.apply_chunk(index, &chunk.chunk)? {
            Applied::Written => {
                tracing::trace!(index, len = chunk.chunk.len(), "chunk applied");
            }
            Applied::Duplicate => {
                self.duplicates += 1;
                tracing::debug!(index, "duplicate chunk, re-acknowledging");
            }
        }

        self.state = ReceiverState::Receiving;
        self.send(Confirmation::new(ConfirmResult::Ok, chunk.token.as_str()))
            .await?;
        self.last_token = Some(chunk.token);
        Ok(())
    }

    async fn on_confirmation(
        &mut self,
        confirmation: Confirmation,
    ) -> Result<Option<TransferReport>, SessionError> {
        match confirmation.result {
            ConfirmResult::ValidChecksum => self.verify(confirmation.token).await.map(Some),
            ConfirmResult::FileNotFound => {
                Err(SessionError::ContentNotFound(self.requested.clone()))
            }
            ConfirmResult::ErrorChecksum => Err(SessionError::Rejected(ConfirmResult::ErrorChecksum)),
            ConfirmResult::Ok | ConfirmResult::InvalidPacketFormat => {
                // Server did not get our last ack in a usable form.
                if let Some(token) = self.last_token.clone() {
                    tracing::debug!(%token, result = %confirmation.result, "re-acknowledging");
                    self.send(Confirmation::new(ConfirmResult::Ok, token)).await?;
                }
                Ok(None)
            }
            ConfirmResult::InvalidToken => {
                tracing::debug!(token = %confirmation.token, "server already had that ack");
                Ok(None)
            }
            ConfirmResult::PacketMiss => {
                tracing::debug!("server sent PACKET_MISS, ignoring");
                Ok(None)
            }
        }
    }

    async fn verify(&mut self, offered: String) -> Result<TransferReport, SessionError> {
        self.state = ReceiverState::Verifying;
        let expected = if offered.is_empty() {
            self.expected_checksum.clone().unwrap_or_default()
        } else {
            offered
        };

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StoreError::Closed(PathBuf::from(&self.requested)))?;
        let actual = file.verify(self.store.as_ref())?;
        if actual != expected {
            return Err(SessionError::ChecksumMismatch { expected, actual });
        }
        file.set_checksum(actual.clone());

        self.send(Confirmation::new(ConfirmResult::ValidChecksum, actual.as_str()))
            .await?;

        let file = self.file.take();
        let (output, bytes, tokens) = file
            .as_ref()
            .map(|f| (f.path().to_path_buf(), f.size(), f.token_count()))
            .unwrap_or_default();
        Ok(TransferReport {
            output,
            checksum: actual,
            bytes,
            tokens,
            duplicates: self.duplicates,
            dropped: self.dropped,
            gap_requests: self.gap_requests,
        })
    }

    async fn send(&self, confirmation: Confirmation) -> Result<(), SessionError> {
        let frame = Message::from(confirmation).encode()?;
        self.socket.send(&frame).await?;
        Ok(())
    }

    fn abandon(&mut self) {
        if let Some(file) = self.file.take() {
            let path = file.path().to_path_buf();
            if let Err(e) = file.discard(self.store.as_ref()) {
                tracing::warn!(path = %path.display(), error = %e, "could not remove partial output");
            }
        }
    }
}

/// Pump datagrams from the socket into the receiver's queue.
async fn read_loop(socket: Arc<UdpSocket>, max_datagram: usize, inbound: mpsc::Sender<Bytes>) {
    let mut buf = vec![0u8; max_datagram + 1];
    loop {
        match socket.recv(&mut buf).await {
            Ok(len) if len > max_datagram => {
                tracing::warn!(len, max_datagram, "oversized datagram dropped");
            }
            Ok(len) => {
                if inbound.send(Bytes::copy_from_slice(&buf[..len])).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                // ICMP unreachable surfaces here on connected sockets; the stall
                // counter decides when to give up.
                tracing::debug!(error = %e, "recv failed");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}
