//! Chunked transfer protocol
//!
//! One session moves one file over one [`Channel`]. The sender announces the
//! file with a `Request`, waits for the receiver's decision and then streams
//! 64 KiB chunks in ascending order followed by `Complete`:
//!
//! ```text
//! sender:   Idle -> AwaitingResponse -> Transferring -> Done
//!                   AwaitingResponse -> Rejected | TimedOut
//! receiver: Listening -> PendingDecision -> Receiving -> Done
//!                        PendingDecision -> Idle (declined)
//!                        Receiving -> Aborted (channel lost)
//! ```
//!
//! Either side may cancel at any non-terminal state. The `Cancel` (or
//! `Error`) message is queued before the channel is released so the remote
//! session observes it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use super::connection::{Channel, ConnectionError, InboundRequest, Subscription};
use super::identity::PeerId;
use super::wire::{checked_total_chunks, FileMetadata, Message, TransferId, CHUNK_SIZE};

/// Default time the sender waits for Accept/Reject.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time the receiver waits between two messages.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const FALLBACK_FILE_NAME: &str = "received.bin";

/// Chunk slots reserved up front by the assembler.
const PREALLOCATED_CHUNKS: u32 = 64;

/// Errors that end a transfer session
#[derive(Error, Debug, Clone)]
pub enum TransferError {
    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("transfer rejected by peer")]
    Rejected,

    #[error("no response from peer within {0:?}")]
    ResponseTimeout(Duration),

    #[error("no data from peer within {0:?}")]
    InactivityTimeout(Duration),

    #[error("transfer incomplete: {missing} of {total} chunks missing")]
    Incomplete { missing: u32, total: u32 },

    #[error("chunk {got} arrived while chunk {expected} was expected")]
    OutOfOrder { expected: u32, got: u32 },

    #[error("transfer cancelled{}", cancelled_by(.by_peer))]
    Cancelled { by_peer: bool },

    #[error("channel closed before the transfer completed")]
    Aborted,

    #[error("peer reported an error: {0}")]
    Remote(Arc<str>),

    #[error("protocol violation: {0}")]
    Protocol(Arc<str>),

    #[error("I/O error: {0}")]
    Io(Arc<str>),

    #[error("transfer task failed: {0}")]
    Task(Arc<str>),
}

fn cancelled_by(by_peer: &bool) -> &'static str {
    if *by_peer {
        " by peer"
    } else {
        ""
    }
}

impl TransferError {
    fn protocol(reason: impl Into<Arc<str>>) -> Self {
        TransferError::Protocol(reason.into())
    }

    fn io(e: std::io::Error) -> Self {
        TransferError::Io(Arc::from(e.to_string()))
    }

    /// The message, if any, that tells the remote side why we stopped.
    fn notice(&self, transfer_id: TransferId) -> Option<Message> {
        match self {
            TransferError::Cancelled { by_peer: false } | TransferError::ResponseTimeout(_) => {
                Some(Message::Cancel { transfer_id })
            }
            TransferError::Incomplete { .. }
            | TransferError::OutOfOrder { .. }
            | TransferError::Protocol(_)
            | TransferError::InactivityTimeout(_)
            | TransferError::Io(_) => Some(Message::Error {
                transfer_id,
                reason: Arc::from(self.to_string()),
            }),
            _ => None,
        }
    }

    /// Session state a session ends in after this error.
    fn terminal_state(&self) -> SessionState {
        match self {
            TransferError::Rejected => SessionState::Rejected,
            TransferError::ResponseTimeout(_) => SessionState::TimedOut,
            TransferError::Cancelled { .. } => SessionState::Cancelled,
            TransferError::Aborted => SessionState::Aborted,
            other => SessionState::Failed {
                reason: Arc::from(other.to_string()),
            },
        }
    }
}

/// Direction of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Send,
    Receive,
}

/// State of one protocol session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Listening,
    AwaitingResponse,
    PendingDecision,
    Transferring,
    Receiving,
    Done,
    Rejected,
    TimedOut,
    Cancelled,
    Aborted,
    Failed { reason: Arc<str> },
}

impl SessionState {
    /// Returns true if the session can no longer change state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Done
                | SessionState::Rejected
                | SessionState::TimedOut
                | SessionState::Cancelled
                | SessionState::Aborted
                | SessionState::Failed { .. }
        )
    }

    /// Returns true if chunks are processed in this state
    pub fn accepts_chunks(&self) -> bool {
        matches!(self, SessionState::Transferring | SessionState::Receiving)
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_advance(&self, next: &SessionState) -> bool {
        use SessionState::*;

        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Cancelled | Failed { .. } | Aborted) => true,
            (Idle, AwaitingResponse | Listening) => true,
            (Listening, PendingDecision) => true,
            (AwaitingResponse, Transferring | Rejected | TimedOut) => true,
            (PendingDecision, Receiving | Idle) => true,
            (Transferring | Receiving, Done) => true,
            _ => false,
        }
    }

    /// Moves to `next` if the transition is legal.
    pub fn advance(&mut self, next: SessionState) -> bool {
        if self.can_advance(&next) {
            *self = next;
            true
        } else {
            false
        }
    }
}

/// Progress information for a transfer
#[derive(Debug, Clone)]
pub struct TransferProgress {
    pub transfer_id: TransferId,
    pub direction: TransferDirection,
    pub peer_id: PeerId,
    pub file_name: Arc<str>,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub state: SessionState,
    pub started_at: Instant,
    pub speed_bps: u64,
}

impl TransferProgress {
    fn new(
        transfer_id: TransferId,
        direction: TransferDirection,
        peer_id: PeerId,
        metadata: &FileMetadata,
        state: SessionState,
    ) -> Self {
        Self {
            transfer_id,
            direction,
            peer_id,
            file_name: Arc::from(metadata.name.as_str()),
            total_bytes: metadata.size,
            transferred_bytes: 0,
            state,
            started_at: Instant::now(),
            speed_bps: 0,
        }
    }

    /// Rounded percentage; an empty file counts as complete.
    pub fn percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 100;
        }
        let pct = (self.transferred_bytes as f64 / self.total_bytes as f64) * 100.0;
        pct.round().min(100.0) as u8
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, SessionState::Done)
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self.state,
            SessionState::Failed { .. } | SessionState::Aborted | SessionState::TimedOut
        )
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Calculates ETA in seconds based on current speed
    pub fn eta_seconds(&self) -> Option<u64> {
        if self.speed_bps == 0 || self.transferred_bytes >= self.total_bytes {
            return None;
        }
        let remaining = self.total_bytes - self.transferred_bytes;
        Some(remaining / self.speed_bps)
    }
}

/// Instantaneous throughput: bytes since the last sample over the time since
/// the last sample.
#[derive(Debug)]
struct SpeedSampler {
    at: Instant,
    bytes: u64,
}

impl SpeedSampler {
    fn new() -> Self {
        Self {
            at: Instant::now(),
            bytes: 0,
        }
    }

    fn sample(&mut self, total: u64) -> Option<u64> {
        let now = Instant::now();
        let secs = now.duration_since(self.at).as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        let speed = (total.saturating_sub(self.bytes) as f64 / secs) as u64;
        self.at = now;
        self.bytes = total;
        Some(speed)
    }
}

/// Publishes a session's progress.
struct Tracker {
    tx: watch::Sender<TransferProgress>,
    sampler: SpeedSampler,
}

impl Tracker {
    fn new(tx: watch::Sender<TransferProgress>) -> Self {
        Self {
            tx,
            sampler: SpeedSampler::new(),
        }
    }

    fn state(&self) -> SessionState {
        self.tx.borrow().state.clone()
    }

    fn advance(&mut self, next: SessionState) {
        self.tx.send_modify(|progress| {
            let from = progress.state.clone();
            if progress.state.advance(next.clone()) {
                trace!(transfer_id = %progress.transfer_id, ?from, to = ?next, "Session state changed");
            } else {
                warn!(transfer_id = %progress.transfer_id, ?from, to = ?next, "Ignoring illegal state transition");
            }
        });
    }

    fn add_bytes(&mut self, n: u64) {
        let sampler = &mut self.sampler;
        self.tx.send_modify(|progress| {
            progress.transferred_bytes = (progress.transferred_bytes + n).min(progress.total_bytes);
            if let Some(speed) = sampler.sample(progress.transferred_bytes) {
                progress.speed_bps = speed;
            }
        });
    }
}

/// Timeouts applied by sessions
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub response_timeout: Duration,
    pub inactivity_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
        }
    }
}

/// What a finished session moved.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub transfer_id: TransferId,
    pub peer_id: PeerId,
    pub bytes: u64,
    pub chunks: u32,
    pub elapsed: Duration,
}

/// Maps a file extension to a MIME type.
pub fn mime_for(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("txt" | "log") => "text/plain",
        Some("md") => "text/markdown",
        Some("html" | "htm") => "text/html",
        Some("css") => "text/css",
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("gz") => "application/gzip",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        _ => "application/octet-stream",
    }
}

/// A file ready to be sent.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub metadata: FileMetadata,
    pub data: Bytes,
}

impl OutgoingFile {
    /// Wraps in-memory contents.
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let name = name.into();
        let data = data.into();
        let last_modified_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            metadata: FileMetadata {
                mime_type: mime_for(&name).to_string(),
                size: data.len() as u64,
                name,
                last_modified_ms,
            },
            data,
        }
    }

    /// Reads a file from disk.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, TransferError> {
        let path = path.as_ref();
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TransferError::FileNotFound(path.to_path_buf()))
            }
            Err(e) => return Err(TransferError::io(e)),
        };
        let meta = tokio::fs::metadata(path).await.map_err(TransferError::io)?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string());
        let last_modified_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Ok(Self {
            metadata: FileMetadata {
                mime_type: mime_for(&name).to_string(),
                size: data.len() as u64,
                name,
                last_modified_ms,
            },
            data: Bytes::from(data),
        })
    }
}

/// A fully assembled incoming file.
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    pub transfer_id: TransferId,
    pub from: PeerId,
    pub metadata: FileMetadata,
    pub data: Bytes,
}

impl ReceivedFile {
    /// Writes the file into `dir`, never overwriting an existing file.
    /// Returns the path written.
    pub async fn save_to(&self, dir: &Path) -> Result<PathBuf, TransferError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(TransferError::io)?;

        let name = sanitize_file_name(&self.metadata.name);
        let (stem, ext) = match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), Some(ext.to_string())),
            _ => (name.clone(), None),
        };

        for attempt in 0u32.. {
            let candidate = match (attempt, &ext) {
                (0, _) => name.clone(),
                (n, Some(ext)) => format!("{stem} ({n}).{ext}"),
                (n, None) => format!("{stem} ({n})"),
            };
            let path = dir.join(&candidate);

            let opened = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await;
            let mut file = match opened {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(TransferError::io(e)),
            };

            file.write_all(&self.data).await.map_err(TransferError::io)?;
            file.flush().await.map_err(TransferError::io)?;
            info!(path = %path.display(), size = self.data.len(), "Saved received file");
            return Ok(path);
        }

        Err(TransferError::protocol("no free file name"))
    }
}

/// Strips directories and other unsafe parts from a remote-supplied name.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control() && *c != ':')
        .collect();
    let cleaned = cleaned.trim();

    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        FALLBACK_FILE_NAME.to_string()
    } else {
        cleaned.to_string()
    }
}

/// Reassembles chunks of one file.
///
/// Chunks must arrive in ascending order. A repeated index is ignored; an
/// index past the next missing one means the transport reordered messages.
/// Storage grows with the chunks actually received, never with the size the
/// sender announced.
#[derive(Debug)]
pub struct ChunkAssembler {
    chunks: Vec<Bytes>,
    total_chunks: u32,
    expected_size: u64,
    received_bytes: u64,
}

impl ChunkAssembler {
    pub fn new(total_chunks: u32, expected_size: u64) -> Result<Self, TransferError> {
        let Some(expected_chunks) = checked_total_chunks(expected_size) else {
            return Err(TransferError::protocol(format!(
                "{expected_size} bytes exceed the largest transferable file"
            )));
        };
        if total_chunks != expected_chunks {
            return Err(TransferError::protocol(format!(
                "{total_chunks} chunks announced for {expected_size} bytes"
            )));
        }
        Ok(Self {
            chunks: Vec::with_capacity(total_chunks.min(PREALLOCATED_CHUNKS) as usize),
            total_chunks,
            expected_size,
            received_bytes: 0,
        })
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn missing(&self) -> u32 {
        self.total_chunks - self.received()
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    fn received(&self) -> u32 {
        self.chunks.len() as u32
    }

    /// Stores a chunk. Returns false for a duplicate.
    pub fn insert(&mut self, index: u32, payload: Bytes) -> Result<bool, TransferError> {
        if index >= self.total_chunks {
            return Err(TransferError::protocol(format!(
                "chunk index {index} out of range (total {})",
                self.total_chunks
            )));
        }
        let next_expected = self.received();
        if index < next_expected {
            return Ok(false);
        }
        if index > next_expected {
            return Err(TransferError::OutOfOrder {
                expected: next_expected,
                got: index,
            });
        }
        let len = payload.len() as u64;
        if self.received_bytes + len > self.expected_size {
            return Err(TransferError::protocol("more bytes than announced"));
        }

        self.chunks.push(payload);
        self.received_bytes += len;
        Ok(true)
    }

    /// Joins the chunks. Fails if any slot is empty or the size is off.
    pub fn finish(self) -> Result<Bytes, TransferError> {
        let missing = self.missing();
        if missing > 0 {
            return Err(TransferError::Incomplete {
                missing,
                total: self.total_chunks(),
            });
        }
        if self.received_bytes != self.expected_size {
            return Err(TransferError::protocol(format!(
                "assembled {} bytes, expected {}",
                self.received_bytes, self.expected_size
            )));
        }

        let mut slots = self.chunks.into_iter();
        match (slots.next(), slots.next()) {
            (None, _) => Ok(Bytes::new()),
            (Some(only), None) => Ok(only),
            (Some(first), Some(second)) => {
                let mut buf = BytesMut::with_capacity(self.expected_size as usize);
                buf.extend_from_slice(&first);
                buf.extend_from_slice(&second);
                for chunk in slots {
                    buf.extend_from_slice(&chunk);
                }
                Ok(buf.freeze())
            }
        }
    }
}

/// Sender side of one transfer.
pub struct SendSession {
    transfer_id: TransferId,
    peer_id: PeerId,
    file: OutgoingFile,
    config: SessionConfig,
    progress: watch::Sender<TransferProgress>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for SendSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendSession")
            .field("transfer_id", &self.transfer_id)
            .field("peer_id", &self.peer_id)
            .field("file", &self.file.metadata.name)
            .finish_non_exhaustive()
    }
}

impl SendSession {
    /// Prepares a session with a fresh transfer id.
    pub fn new(peer_id: PeerId, file: OutgoingFile, config: SessionConfig) -> Self {
        let transfer_id = TransferId::new();
        let (progress, _) = watch::channel(TransferProgress::new(
            transfer_id,
            TransferDirection::Send,
            peer_id,
            &file.metadata,
            SessionState::Idle,
        ));
        Self {
            transfer_id,
            peer_id,
            file,
            config,
            progress,
            cancel: CancellationToken::new(),
        }
    }

    pub fn transfer_id(&self) -> TransferId {
        self.transfer_id
    }

    pub fn progress(&self) -> watch::Receiver<TransferProgress> {
        self.progress.subscribe()
    }

    /// Token that cancels this session when triggered.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the whole sender state machine on `channel`.
    #[instrument(skip_all, fields(transfer_id = %self.transfer_id, peer = %self.peer_id.short()))]
    pub async fn run(self, channel: &Arc<Channel>) -> Result<SessionReport, TransferError> {
        let started = Instant::now();
        let mut tracker = Tracker::new(self.progress.clone());
        let mut subscription = match channel.subscribe(self.transfer_id) {
            Ok(subscription) => subscription,
            Err(e) => {
                let err = TransferError::from(e);
                tracker.advance(err.terminal_state());
                return Err(err);
            }
        };

        let result = self.drive(&mut subscription, &mut tracker).await;
        match &result {
            Ok(chunks) => {
                info!(chunks, size = self.file.metadata.size, elapsed = ?started.elapsed(), "Transfer sent");
            }
            Err(e) => {
                if let Some(notice) = e.notice(self.transfer_id) {
                    let _ = subscription.send(&notice);
                }
                tracker.advance(e.terminal_state());
                warn!(error = %e, "Send session ended");
            }
        }

        result.map(|chunks| SessionReport {
            transfer_id: self.transfer_id,
            peer_id: self.peer_id,
            bytes: self.file.metadata.size,
            chunks,
            elapsed: started.elapsed(),
        })
    }

    async fn drive(
        &self,
        subscription: &mut Subscription,
        tracker: &mut Tracker,
    ) -> Result<u32, TransferError> {
        let transfer_id = self.transfer_id;
        let total_chunks = self.file.metadata.total_chunks();

        tracker.advance(SessionState::AwaitingResponse);
        subscription.send(&Message::Request {
            transfer_id,
            metadata: self.file.metadata.clone(),
            total_chunks,
        })?;
        debug!(total_chunks, "Transfer request sent, awaiting response");

        let timeout = self.config.response_timeout;
        let waited = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(TransferError::Cancelled { by_peer: false }),
            waited = tokio::time::timeout(timeout, await_decision(subscription)) => waited,
        };
        match waited {
            Err(_) => return Err(TransferError::ResponseTimeout(timeout)),
            Ok(decision) => decision?,
        }

        tracker.advance(SessionState::Transferring);
        debug!("Request accepted, sending chunks");

        let data = &self.file.data;
        for index in 0..total_chunks {
            if self.cancel.is_cancelled() {
                return Err(TransferError::Cancelled { by_peer: false });
            }
            match subscription.try_recv() {
                Ok(Message::Cancel { .. }) => {
                    return Err(TransferError::Cancelled { by_peer: true })
                }
                Ok(Message::Error { reason, .. }) => return Err(TransferError::Remote(reason)),
                Ok(other) => debug!(kind = ?other.kind(), "Ignoring message while sending"),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    return Err(ConnectionError::Closed(self.peer_id).into())
                }
            }

            let start = index as usize * CHUNK_SIZE;
            let end = (start + CHUNK_SIZE).min(data.len());
            subscription.send(&Message::Chunk {
                transfer_id,
                index,
                payload: data.slice(start..end),
            })?;
            tracker.add_bytes((end - start) as u64);
            tokio::task::yield_now().await;
        }

        subscription.send(&Message::Complete {
            transfer_id,
            total_chunks,
        })?;
        tracker.advance(SessionState::Done);
        Ok(total_chunks)
    }
}

/// Waits for the receiver's decision on our request.
async fn await_decision(subscription: &mut Subscription) -> Result<(), TransferError> {
    loop {
        match subscription.recv().await {
            Some(Message::Accept { .. }) => return Ok(()),
            Some(Message::Reject { .. }) => return Err(TransferError::Rejected),
            Some(Message::Cancel { .. }) => return Err(TransferError::Cancelled { by_peer: true }),
            Some(Message::Error { reason, .. }) => return Err(TransferError::Remote(reason)),
            Some(other) => debug!(kind = ?other.kind(), "Ignoring message while awaiting response"),
            None => {
                let peer = subscription.channel().peer_id();
                return Err(ConnectionError::Closed(peer).into());
            }
        }
    }
}

/// An incoming request awaiting the local decision.
///
/// Dropping it without deciding declines the transfer.
pub struct PendingTransfer {
    inner: Option<PendingInner>,
}

struct PendingInner {
    request: InboundRequest,
    progress: watch::Sender<TransferProgress>,
}

impl std::fmt::Debug for PendingTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("PendingTransfer");
        if let Some(inner) = &self.inner {
            s.field("transfer_id", &inner.request.transfer_id)
                .field("peer_id", &inner.request.peer_id)
                .field("file", &inner.request.metadata.name);
        }
        s.finish_non_exhaustive()
    }
}

impl PendingTransfer {
    pub fn new(request: InboundRequest) -> Self {
        let mut progress = TransferProgress::new(
            request.transfer_id,
            TransferDirection::Receive,
            request.peer_id,
            &request.metadata,
            SessionState::Listening,
        );
        progress.state.advance(SessionState::PendingDecision);
        let (progress, _) = watch::channel(progress);

        Self {
            inner: Some(PendingInner { request, progress }),
        }
    }

    fn request(&self) -> Option<&InboundRequest> {
        self.inner.as_ref().map(|inner| &inner.request)
    }

    pub fn transfer_id(&self) -> Option<TransferId> {
        self.request().map(|r| r.transfer_id)
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.request().map(|r| r.peer_id)
    }

    pub fn metadata(&self) -> Option<&FileMetadata> {
        self.request().map(|r| &r.metadata)
    }

    pub fn total_chunks(&self) -> Option<u32> {
        self.request().map(|r| r.total_chunks)
    }

    pub fn progress(&self) -> Option<watch::Receiver<TransferProgress>> {
        self.inner.as_ref().map(|inner| inner.progress.subscribe())
    }

    /// The channel the request arrived on.
    pub fn channel(&self) -> Option<Arc<Channel>> {
        self.request().map(|r| Arc::clone(r.subscription.channel()))
    }

    /// Declines the transfer. The session ends in `Idle`.
    pub fn reject(mut self) -> Result<(), TransferError> {
        let Some(inner) = self.inner.take() else {
            return Ok(());
        };
        decline(inner)
    }

    /// Accepts the transfer and receives the file.
    #[instrument(skip_all, fields(transfer_id = ?self.transfer_id()))]
    pub async fn accept(
        mut self,
        config: &SessionConfig,
        cancel: CancellationToken,
    ) -> Result<ReceivedFile, TransferError> {
        let Some(PendingInner {
            request,
            progress,
        }) = self.inner.take()
        else {
            return Err(TransferError::protocol("transfer already decided"));
        };

        let InboundRequest {
            peer_id,
            transfer_id,
            metadata,
            total_chunks,
            mut subscription,
        } = request;
        let mut tracker = Tracker::new(progress);

        let result = receive(
            &mut subscription,
            &mut tracker,
            &metadata,
            total_chunks,
            config,
            &cancel,
        )
        .await;

        match result {
            Ok(data) => {
                info!(file_name = %metadata.name, size = data.len(), "Transfer received");
                Ok(ReceivedFile {
                    transfer_id,
                    from: peer_id,
                    metadata,
                    data,
                })
            }
            Err(e) => {
                if let Some(notice) = e.notice(transfer_id) {
                    let _ = subscription.send(&notice);
                }
                tracker.advance(e.terminal_state());
                warn!(error = %e, "Receive session ended");
                Err(e)
            }
        }
    }
}

impl Drop for PendingTransfer {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            debug!(transfer_id = %inner.request.transfer_id, "Undecided transfer dropped, declining");
            let _ = decline(inner);
        }
    }
}

fn decline(inner: PendingInner) -> Result<(), TransferError> {
    let PendingInner { request, progress } = inner;
    let mut tracker = Tracker::new(progress);
    let sent = request.subscription.send(&Message::Reject {
        transfer_id: request.transfer_id,
    });
    tracker.advance(SessionState::Idle);
    info!(transfer_id = %request.transfer_id, peer = %request.peer_id.short(), "Transfer declined");
    sent.map_err(TransferError::from)
}

async fn receive(
    subscription: &mut Subscription,
    tracker: &mut Tracker,
    metadata: &FileMetadata,
    total_chunks: u32,
    config: &SessionConfig,
    cancel: &CancellationToken,
) -> Result<Bytes, TransferError> {
    let transfer_id = subscription.transfer_id();

    // Anything that arrived before the decision was not ours to process.
    loop {
        match subscription.try_recv() {
            Ok(Message::Cancel { .. }) => return Err(TransferError::Cancelled { by_peer: true }),
            Ok(Message::Error { reason, .. }) => return Err(TransferError::Remote(reason)),
            Ok(other) => debug!(kind = ?other.kind(), "Ignoring message received before accept"),
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => return Err(TransferError::Aborted),
        }
    }

    let mut assembler = ChunkAssembler::new(total_chunks, metadata.size)?;
    subscription
        .send(&Message::Accept { transfer_id })
        .map_err(|_| TransferError::Aborted)?;
    tracker.advance(SessionState::Receiving);
    debug!(total_chunks, "Transfer accepted, receiving chunks");

    let timeout = config.inactivity_timeout;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled { by_peer: false }),
            next = tokio::time::timeout(timeout, subscription.recv()) => next,
        };
        let message = match next {
            Err(_) => return Err(TransferError::InactivityTimeout(timeout)),
            Ok(None) => return Err(TransferError::Aborted),
            Ok(Some(message)) => message,
        };

        match message {
            Message::Chunk { index, payload, .. } => {
                if !tracker.state().accepts_chunks() {
                    continue;
                }
                let len = payload.len() as u64;
                if assembler.insert(index, payload)? {
                    tracker.add_bytes(len);
                } else {
                    trace!(index, "Duplicate chunk ignored");
                }
            }
            Message::Complete {
                total_chunks: announced,
                ..
            } => {
                if announced != total_chunks {
                    return Err(TransferError::protocol(format!(
                        "complete announced {announced} chunks, request announced {total_chunks}"
                    )));
                }
                let data = assembler.finish()?;
                tracker.advance(SessionState::Done);
                return Ok(data);
            }
            Message::Cancel { .. } => return Err(TransferError::Cancelled { by_peer: true }),
            Message::Error { reason, .. } => return Err(TransferError::Remote(reason)),
            other => debug!(kind = ?other.kind(), "Ignoring message while receiving"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::{ConnectionConfig, ConnectionManager};
    use crate::net::memory::MemoryNetwork;
    use crate::net::wire::total_chunks_for;
    use tempfile::TempDir;

    fn pattern(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    fn test_progress(total: u64, transferred: u64, state: SessionState) -> TransferProgress {
        TransferProgress {
            transfer_id: TransferId::new(),
            direction: TransferDirection::Send,
            peer_id: PeerId::random(),
            file_name: Arc::from("test.txt"),
            total_bytes: total,
            transferred_bytes: transferred,
            state,
            started_at: Instant::now(),
            speed_bps: 1000,
        }
    }

    async fn pair() -> (ConnectionManager, ConnectionManager, Arc<Channel>) {
        let network = MemoryNetwork::new();
        let a_id = PeerId::random();
        let b_id = PeerId::random();
        let config = ConnectionConfig {
            cleanup_interval: Duration::from_secs(3600),
            ..ConnectionConfig::default()
        };
        let a = ConnectionManager::new(network.join(a_id, None), config.clone());
        let b = ConnectionManager::new(network.join(b_id, None), config);
        a.start();
        b.start();
        let channel = a.connect(b_id, Duration::from_secs(5)).await.unwrap();
        (a, b, channel)
    }

    // ==================== SessionState Tests ====================

    #[test]
    fn test_sender_happy_path_transitions() {
        let mut state = SessionState::Idle;
        assert!(state.advance(SessionState::AwaitingResponse));
        assert!(!state.accepts_chunks());
        assert!(state.advance(SessionState::Transferring));
        assert!(state.accepts_chunks());
        assert!(state.advance(SessionState::Done));
        assert!(state.is_terminal());
        assert!(!state.advance(SessionState::Cancelled));
    }

    #[test]
    fn test_receiver_transitions() {
        let mut state = SessionState::Listening;
        assert!(!state.advance(SessionState::Receiving));
        assert!(state.advance(SessionState::PendingDecision));
        assert!(state.advance(SessionState::Receiving));
        assert!(state.advance(SessionState::Aborted));
        assert!(state.is_terminal());

        let mut declined = SessionState::PendingDecision;
        assert!(declined.advance(SessionState::Idle));
        assert!(!declined.is_terminal());
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut state = SessionState::AwaitingResponse;
        assert!(!state.advance(SessionState::Done));
        assert!(!state.advance(SessionState::Receiving));
        assert_eq!(state, SessionState::AwaitingResponse);
        assert!(state.advance(SessionState::TimedOut));
    }

    // ==================== TransferProgress Tests ====================

    #[test]
    fn test_progress_percent_rounds() {
        assert_eq!(test_progress(100, 50, SessionState::Transferring).percent(), 50);
        assert_eq!(test_progress(0, 0, SessionState::Transferring).percent(), 100);
        assert_eq!(test_progress(3, 1, SessionState::Transferring).percent(), 33);
        assert_eq!(test_progress(3, 2, SessionState::Transferring).percent(), 67);
        assert_eq!(test_progress(100, 150, SessionState::Done).percent(), 100);
    }

    #[test]
    fn test_progress_flags_and_eta() {
        let active = test_progress(10_000, 5_000, SessionState::Receiving);
        assert!(active.is_active());
        assert_eq!(active.eta_seconds(), Some(5));

        let done = test_progress(10_000, 10_000, SessionState::Done);
        assert!(done.is_complete());
        assert!(!done.is_active());
        assert_eq!(done.eta_seconds(), None);

        let timed_out = test_progress(10, 0, SessionState::TimedOut);
        assert!(timed_out.is_failed());
    }

    // ==================== ChunkAssembler Tests ====================

    #[test]
    fn test_assembler_reassembles_in_order() {
        let data = pattern(200 * 1024);
        let total = total_chunks_for(data.len() as u64);
        assert_eq!(total, 4);

        let mut assembler = ChunkAssembler::new(total, data.len() as u64).unwrap();
        for index in 0..total {
            let start = index as usize * CHUNK_SIZE;
            let end = (start + CHUNK_SIZE).min(data.len());
            assert!(assembler.insert(index, data.slice(start..end)).unwrap());
        }
        assert_eq!(assembler.missing(), 0);
        assert_eq!(assembler.finish().unwrap(), data);
    }

    #[test]
    fn test_assembler_ignores_duplicates() {
        let mut assembler = ChunkAssembler::new(2, CHUNK_SIZE as u64 + 1).unwrap();
        assert!(assembler.insert(0, pattern(CHUNK_SIZE)).unwrap());
        assert!(!assembler.insert(0, pattern(CHUNK_SIZE)).unwrap());
        assert_eq!(assembler.received_bytes(), CHUNK_SIZE as u64);
        assert_eq!(assembler.missing(), 1);
    }

    #[test]
    fn test_assembler_detects_gap() {
        let mut assembler = ChunkAssembler::new(3, 3 * CHUNK_SIZE as u64).unwrap();
        assert!(assembler.insert(0, pattern(CHUNK_SIZE)).unwrap());
        let err = assembler.insert(2, pattern(CHUNK_SIZE)).unwrap_err();
        assert!(matches!(err, TransferError::OutOfOrder { expected: 1, got: 2 }));
    }

    #[test]
    fn test_assembler_rejects_bad_index_and_size() {
        let mut assembler = ChunkAssembler::new(1, 10).unwrap();
        assert!(matches!(
            assembler.insert(1, pattern(10)),
            Err(TransferError::Protocol(_))
        ));
        assert!(matches!(
            assembler.insert(0, pattern(11)),
            Err(TransferError::Protocol(_))
        ));
        assert!(ChunkAssembler::new(2, 10).is_err());
    }

    #[test]
    fn test_assembler_incomplete_and_empty() {
        let assembler = ChunkAssembler::new(2, CHUNK_SIZE as u64 + 1).unwrap();
        assert!(matches!(
            assembler.finish(),
            Err(TransferError::Incomplete { missing: 2, total: 2 })
        ));

        let empty = ChunkAssembler::new(0, 0).unwrap();
        assert!(empty.finish().unwrap().is_empty());
    }

    #[test]
    fn test_assembler_does_not_trust_announced_size() {
        let mut huge = ChunkAssembler::new(1 << 30, 1 << 46).unwrap();
        assert_eq!(huge.missing(), 1 << 30);
        assert!(huge.insert(0, pattern(CHUNK_SIZE)).unwrap());
        assert_eq!(huge.received_bytes(), CHUNK_SIZE as u64);

        assert!(matches!(
            ChunkAssembler::new(0, 1 << 48),
            Err(TransferError::Protocol(_))
        ));
        assert!(matches!(
            ChunkAssembler::new(u32::MAX, u64::MAX),
            Err(TransferError::Protocol(_))
        ));
    }

    // ==================== File Tests ====================

    #[test]
    fn test_mime_lookup() {
        assert_eq!(mime_for("notes.TXT"), "text/plain");
        assert_eq!(mime_for("photo.jpeg"), "image/jpeg");
        assert_eq!(mime_for("archive"), "application/octet-stream");
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\temp\\report.pdf"), "report.pdf");
        assert_eq!(sanitize_file_name(".."), FALLBACK_FILE_NAME);
        assert_eq!(sanitize_file_name("  "), FALLBACK_FILE_NAME);
    }

    #[tokio::test]
    async fn test_outgoing_file_from_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.md");
        std::fs::write(&path, b"# hello").unwrap();

        let file = OutgoingFile::from_path(&path).await.unwrap();
        assert_eq!(file.metadata.name, "notes.md");
        assert_eq!(file.metadata.size, 7);
        assert_eq!(file.metadata.mime_type, "text/markdown");
        assert!(file.metadata.last_modified_ms > 0);

        let missing = OutgoingFile::from_path(dir.path().join("nope")).await;
        assert!(matches!(missing, Err(TransferError::FileNotFound(_))));
    }

    #[tokio::test]
    async fn test_save_to_never_overwrites() {
        let dir = TempDir::new().unwrap();
        let file = ReceivedFile {
            transfer_id: TransferId::new(),
            from: PeerId::random(),
            metadata: OutgoingFile::from_bytes("../report.pdf", Bytes::from_static(b"v1")).metadata,
            data: Bytes::from_static(b"v1"),
        };

        let first = file.save_to(dir.path()).await.unwrap();
        let second = file.save_to(dir.path()).await.unwrap();

        assert_eq!(first, dir.path().join("report.pdf"));
        assert_eq!(second, dir.path().join("report (1).pdf"));
        assert_eq!(std::fs::read(second).unwrap(), b"v1");
    }

    // ==================== Session Tests ====================

    #[tokio::test]
    async fn test_session_moves_file_byte_identical() {
        let (_a, b, channel) = pair().await;
        let data = pattern(200 * 1024);
        let session = SendSession::new(
            channel.peer_id(),
            OutgoingFile::from_bytes("big.bin", data.clone()),
            SessionConfig::default(),
        );
        let progress = session.progress();

        let receiver = tokio::spawn(async move {
            let pending = PendingTransfer::new(b.next_request().await.unwrap());
            assert_eq!(pending.total_chunks(), Some(4));
            pending
                .accept(&SessionConfig::default(), CancellationToken::new())
                .await
        });

        let report = session.run(&channel).await.unwrap();
        let received = receiver.await.unwrap().unwrap();

        assert_eq!(report.chunks, 4);
        assert_eq!(received.data, data);
        assert_eq!(received.metadata.name, "big.bin");
        assert_eq!(progress.borrow().state, SessionState::Done);
        assert_eq!(progress.borrow().percent(), 100);
        assert_eq!(channel.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_session_rejected() {
        let (_a, b, channel) = pair().await;
        let session = SendSession::new(
            channel.peer_id(),
            OutgoingFile::from_bytes("nope.txt", Bytes::from_static(b"data")),
            SessionConfig::default(),
        );
        let progress = session.progress();

        let receiver = tokio::spawn(async move {
            let pending = PendingTransfer::new(b.next_request().await.unwrap());
            let progress = pending.progress().unwrap();
            pending.reject().unwrap();
            let state = progress.borrow().state.clone();
            state
        });

        let err = session.run(&channel).await.unwrap_err();
        assert!(matches!(err, TransferError::Rejected));
        assert_eq!(progress.borrow().state, SessionState::Rejected);
        assert_eq!(receiver.await.unwrap(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_dropping_pending_declines() {
        let (_a, b, channel) = pair().await;
        let session = SendSession::new(
            channel.peer_id(),
            OutgoingFile::from_bytes("nope.txt", Bytes::from_static(b"data")),
            SessionConfig::default(),
        );

        tokio::spawn(async move {
            drop(PendingTransfer::new(b.next_request().await.unwrap()));
        });

        assert!(matches!(
            session.run(&channel).await,
            Err(TransferError::Rejected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_response_times_out_without_chunks() {
        let (_a, b, channel) = pair().await;
        let session = SendSession::new(
            channel.peer_id(),
            OutgoingFile::from_bytes("slow.bin", pattern(100_000)),
            SessionConfig::default(),
        );
        let progress = session.progress();

        let sender = tokio::spawn(async move { session.run(&channel).await });
        let mut request = b.next_request().await.unwrap();

        let err = sender.await.unwrap().unwrap_err();
        assert!(matches!(err, TransferError::ResponseTimeout(t) if t == DEFAULT_RESPONSE_TIMEOUT));
        assert_eq!(progress.borrow().state, SessionState::TimedOut);

        let mut seen = Vec::new();
        while let Ok(Some(message)) =
            tokio::time::timeout(Duration::from_millis(10), request.subscription.recv()).await
        {
            seen.push(message.kind());
        }
        assert_eq!(seen, vec![crate::net::wire::MessageKind::Cancel]);
    }

    #[tokio::test]
    async fn test_local_cancel_reaches_receiver() {
        let (_a, b, channel) = pair().await;
        let session = SendSession::new(
            channel.peer_id(),
            OutgoingFile::from_bytes("big.bin", pattern(64 * 1024 * 8)),
            SessionConfig::default(),
        );
        let cancel = session.cancel_token();

        let receiver = tokio::spawn(async move {
            let pending = PendingTransfer::new(b.next_request().await.unwrap());
            cancel.cancel();
            pending
                .accept(&SessionConfig::default(), CancellationToken::new())
                .await
        });

        let sent = session.run(&channel).await;
        assert!(matches!(sent, Err(TransferError::Cancelled { by_peer: false })));
        assert!(matches!(
            receiver.await.unwrap(),
            Err(TransferError::Cancelled { by_peer: true })
        ));
    }

    #[tokio::test]
    async fn test_receiver_detects_reordered_chunks() {
        let (_a, b, channel) = pair().await;
        let transfer_id = TransferId::new();
        let data = pattern(3 * CHUNK_SIZE);
        let metadata = OutgoingFile::from_bytes("r.bin", data.clone()).metadata;
        let mut subscription = channel.subscribe(transfer_id).unwrap();

        let receiver = tokio::spawn(async move {
            PendingTransfer::new(b.next_request().await.unwrap())
                .accept(&SessionConfig::default(), CancellationToken::new())
                .await
        });

        subscription
            .send(&Message::Request {
                transfer_id,
                metadata,
                total_chunks: 3,
            })
            .unwrap();
        assert!(matches!(subscription.recv().await, Some(Message::Accept { .. })));

        for index in [1u32, 0, 2] {
            let start = index as usize * CHUNK_SIZE;
            subscription
                .send(&Message::Chunk {
                    transfer_id,
                    index,
                    payload: data.slice(start..start + CHUNK_SIZE),
                })
                .unwrap();
        }

        let err = receiver.await.unwrap().unwrap_err();
        assert!(matches!(err, TransferError::OutOfOrder { expected: 0, got: 1 }));
        assert!(matches!(subscription.recv().await, Some(Message::Error { .. })));
    }

    #[tokio::test]
    async fn test_receiver_reports_missing_chunks() {
        let (_a, b, channel) = pair().await;
        let transfer_id = TransferId::new();
        let data = pattern(2 * CHUNK_SIZE);
        let metadata = OutgoingFile::from_bytes("m.bin", data.clone()).metadata;
        let mut subscription = channel.subscribe(transfer_id).unwrap();

        let receiver = tokio::spawn(async move {
            PendingTransfer::new(b.next_request().await.unwrap())
                .accept(&SessionConfig::default(), CancellationToken::new())
                .await
        });

        subscription
            .send(&Message::Request {
                transfer_id,
                metadata,
                total_chunks: 2,
            })
            .unwrap();
        assert!(matches!(subscription.recv().await, Some(Message::Accept { .. })));
        subscription
            .send(&Message::Chunk {
                transfer_id,
                index: 0,
                payload: data.slice(0..CHUNK_SIZE),
            })
            .unwrap();
        subscription
            .send(&Message::Complete {
                transfer_id,
                total_chunks: 2,
            })
            .unwrap();

        let err = receiver.await.unwrap().unwrap_err();
        assert!(matches!(err, TransferError::Incomplete { missing: 1, total: 2 }));
        match subscription.recv().await {
            Some(Message::Error { reason, .. }) => assert!(reason.contains("incomplete")),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_receiver_aborts_when_channel_closes() {
        let (a, b, channel) = pair().await;
        let transfer_id = TransferId::new();
        let data = pattern(2 * CHUNK_SIZE);
        let metadata = OutgoingFile::from_bytes("c.bin", data.clone()).metadata;
        let mut subscription = channel.subscribe(transfer_id).unwrap();

        let receiver = tokio::spawn(async move {
            let pending = PendingTransfer::new(b.next_request().await.unwrap());
            let progress = pending.progress().unwrap();
            let result = pending
                .accept(&SessionConfig::default(), CancellationToken::new())
                .await;
            let state = progress.borrow().state.clone();
            (result, state)
        });

        subscription
            .send(&Message::Request {
                transfer_id,
                metadata,
                total_chunks: 2,
            })
            .unwrap();
        assert!(matches!(subscription.recv().await, Some(Message::Accept { .. })));
        subscription
            .send(&Message::Chunk {
                transfer_id,
                index: 0,
                payload: data.slice(0..CHUNK_SIZE),
            })
            .unwrap();
        a.close(channel.peer_id());

        let (result, state) = receiver.await.unwrap();
        assert!(matches!(result, Err(TransferError::Aborted)));
        assert_eq!(state, SessionState::Aborted);
    }

    fn announced(name: &str, size: u64, total_chunks: u32) -> (TransferId, Message) {
        let transfer_id = TransferId::new();
        let mut metadata = OutgoingFile::from_bytes(name, Bytes::new()).metadata;
        metadata.size = size;
        (
            transfer_id,
            Message::Request {
                transfer_id,
                metadata,
                total_chunks,
            },
        )
    }

    #[tokio::test]
    async fn test_receiver_survives_huge_announced_size() {
        let (_a, b, channel) = pair().await;
        let (transfer_id, request) = announced("huge.bin", 1 << 46, 1 << 30);
        let mut subscription = channel.subscribe(transfer_id).unwrap();

        let receiver = tokio::spawn(async move {
            let pending = PendingTransfer::new(b.next_request().await.unwrap());
            let progress = pending.progress().unwrap();
            let result = pending
                .accept(&SessionConfig::default(), CancellationToken::new())
                .await;
            let received = progress.borrow().transferred_bytes;
            (result, received)
        });

        subscription.send(&request).unwrap();
        assert!(matches!(subscription.recv().await, Some(Message::Accept { .. })));
        subscription
            .send(&Message::Chunk {
                transfer_id,
                index: 0,
                payload: pattern(CHUNK_SIZE),
            })
            .unwrap();
        subscription.send(&Message::Cancel { transfer_id }).unwrap();

        let (result, received) = receiver.await.unwrap();
        assert!(matches!(result, Err(TransferError::Cancelled { by_peer: true })));
        assert_eq!(received, CHUNK_SIZE as u64);
    }

    #[tokio::test]
    async fn test_receiver_refuses_unindexable_size() {
        let (_a, b, channel) = pair().await;
        let (transfer_id, request) = announced("vast.bin", 1 << 48, u32::MAX);
        let mut subscription = channel.subscribe(transfer_id).unwrap();

        let receiver = tokio::spawn(async move {
            PendingTransfer::new(b.next_request().await.unwrap())
                .accept(&SessionConfig::default(), CancellationToken::new())
                .await
        });

        subscription.send(&request).unwrap();
        assert!(matches!(
            receiver.await.unwrap(),
            Err(TransferError::Protocol(_))
        ));
        assert!(matches!(subscription.recv().await, Some(Message::Error { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_sender_hits_inactivity_timeout() {
        let (_a, b, channel) = pair().await;
        let transfer_id = TransferId::new();
        let data = pattern(2 * CHUNK_SIZE);
        let metadata = OutgoingFile::from_bytes("stall.bin", data.clone()).metadata;
        let mut subscription = channel.subscribe(transfer_id).unwrap();

        let receiver = tokio::spawn(async move {
            let pending = PendingTransfer::new(b.next_request().await.unwrap());
            let progress = pending.progress().unwrap();
            let result = pending
                .accept(&SessionConfig::default(), CancellationToken::new())
                .await;
            let state = progress.borrow().state.clone();
            (result, state)
        });

        subscription
            .send(&Message::Request {
                transfer_id,
                metadata,
                total_chunks: 2,
            })
            .unwrap();
        assert!(matches!(subscription.recv().await, Some(Message::Accept { .. })));
        subscription
            .send(&Message::Chunk {
                transfer_id,
                index: 0,
                payload: data.slice(0..CHUNK_SIZE),
            })
            .unwrap();

        let started = tokio::time::Instant::now();
        let (result, state) = receiver.await.unwrap();

        assert!(matches!(
            result,
            Err(TransferError::InactivityTimeout(t)) if t == DEFAULT_INACTIVITY_TIMEOUT
        ));
        assert!(started.elapsed() >= DEFAULT_INACTIVITY_TIMEOUT);
        assert!(matches!(state, SessionState::Failed { .. }));
        match subscription.recv().await {
            Some(Message::Error { reason, .. }) => assert!(reason.contains("no data from peer")),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_receiver_cancel_while_receiving_reaches_sender() {
        let (_a, b, channel) = pair().await;
        let session = SendSession::new(
            channel.peer_id(),
            OutgoingFile::from_bytes("long.bin", pattern(64 * CHUNK_SIZE)),
            SessionConfig::default(),
        );
        let sent_progress = session.progress();

        let receiver = tokio::spawn(async move {
            let pending = PendingTransfer::new(b.next_request().await.unwrap());
            let mut progress = pending.progress().unwrap();
            let cancel = CancellationToken::new();

            let watcher = {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let _ = progress
                        .wait_for(|p| p.state == SessionState::Receiving)
                        .await;
                    cancel.cancel();
                })
            };
            let result = pending.accept(&SessionConfig::default(), cancel).await;
            let _ = watcher.await;
            result
        });

        let sent = session.run(&channel).await;
        assert!(matches!(sent, Err(TransferError::Cancelled { by_peer: true })));
        assert_eq!(sent_progress.borrow().state, SessionState::Cancelled);
        assert!(sent_progress.borrow().transferred_bytes < 64 * CHUNK_SIZE as u64);
        assert!(matches!(
            receiver.await.unwrap(),
            Err(TransferError::Cancelled { by_peer: false })
        ));
    }
}
