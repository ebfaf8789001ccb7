//! Transfer orchestration
//!
//! The [`TransferManager`] turns a user intent ("send this file to that
//! peer", "accept this request") into one tracked transfer: it acquires a
//! channel from the [`ConnectionManager`], runs a single protocol session on
//! it and reports a coarse [`TransferStatus`] next to the detailed progress.
//!
//! Channels are kept pooled after a successful transfer and closed after a
//! cancelled or failed one, unless another session still uses them. A
//! detached channel (one that lost its pool slot to a crossed connect) is
//! closed as soon as its last session ends.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::{Channel, ConnectionManager, FanOut, DEFAULT_CONNECT_TIMEOUT};
use super::identity::PeerId;
use super::presence::{PresenceRegistry, PresenceStatus};
use super::protocol::{
    OutgoingFile, PendingTransfer, ReceivedFile, SendSession, SessionConfig, SessionReport,
    SessionState, TransferDirection, TransferError, TransferProgress,
};
use super::wire::TransferId;

/// Folder created inside the user's download directory.
const DOWNLOAD_SUBDIR: &str = "lanbeam";

/// Coarse, user-facing state of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    Idle,
    Connecting,
    Waiting,
    Transferring,
    Complete,
    Error,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Complete | TransferStatus::Error | TransferStatus::Cancelled
        )
    }

    fn from_session(state: &SessionState) -> Self {
        match state {
            SessionState::Idle | SessionState::Listening => TransferStatus::Idle,
            SessionState::AwaitingResponse | SessionState::PendingDecision => {
                TransferStatus::Waiting
            }
            SessionState::Transferring | SessionState::Receiving => TransferStatus::Transferring,
            SessionState::Done => TransferStatus::Complete,
            SessionState::Cancelled => TransferStatus::Cancelled,
            SessionState::Rejected
            | SessionState::TimedOut
            | SessionState::Aborted
            | SessionState::Failed { .. } => TransferStatus::Error,
        }
    }

    fn from_error(error: &TransferError) -> Self {
        match error {
            TransferError::Cancelled { .. } => TransferStatus::Cancelled,
            _ => TransferStatus::Error,
        }
    }

    fn from_result<T>(result: &Result<T, TransferError>) -> Self {
        result
            .as_ref()
            .map_or_else(Self::from_error, |_| TransferStatus::Complete)
    }
}

/// Configuration for transfer manager
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Time allowed for acquiring a channel
    pub connect_timeout: Duration,
    /// Session timeouts
    pub session: SessionConfig,
    /// Where accepted files are saved
    pub download_dir: PathBuf,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            session: SessionConfig::default(),
            download_dir: default_download_dir(),
        }
    }
}

/// `<Downloads>/lanbeam`, falling back to the home directory and then the
/// working directory.
pub fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DOWNLOAD_SUBDIR)
}

/// Point-in-time view of a tracked transfer.
#[derive(Debug, Clone)]
pub struct TransferSnapshot {
    pub status: TransferStatus,
    pub progress: TransferProgress,
}

impl TransferSnapshot {
    pub fn id(&self) -> TransferId {
        self.progress.transfer_id
    }

    pub fn peer_id(&self) -> PeerId {
        self.progress.peer_id
    }

    pub fn direction(&self) -> TransferDirection {
        self.progress.direction
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Internal transfer tracking info
#[derive(Debug)]
struct TransferEntry {
    status: watch::Receiver<TransferStatus>,
    progress: watch::Receiver<TransferProgress>,
    cancel: CancellationToken,
}

impl TransferEntry {
    fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            status: *self.status.borrow(),
            progress: self.progress.borrow().clone(),
        }
    }

    fn is_active(&self) -> bool {
        !self.status.borrow().is_terminal()
    }
}

/// A handle to a running transfer
pub struct TransferHandle<T> {
    id: TransferId,
    peer_id: PeerId,
    status: watch::Receiver<TransferStatus>,
    progress: watch::Receiver<TransferProgress>,
    cancel: CancellationToken,
    task: JoinHandle<Result<T, TransferError>>,
}

impl<T> std::fmt::Debug for TransferHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferHandle")
            .field("id", &self.id)
            .field("peer_id", &self.peer_id)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

impl<T> TransferHandle<T> {
    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn status(&self) -> TransferStatus {
        *self.status.borrow()
    }

    /// Receiver notified on every status change.
    pub fn status_watch(&self) -> watch::Receiver<TransferStatus> {
        self.status.clone()
    }

    pub fn progress(&self) -> TransferProgress {
        self.progress.borrow().clone()
    }

    /// Receiver notified on every progress update.
    pub fn progress_watch(&self) -> watch::Receiver<TransferProgress> {
        self.progress.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Waits for the transfer to finish.
    pub async fn wait(self) -> Result<T, TransferError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(TransferError::Task(Arc::from(e.to_string()))),
        }
    }
}

struct ManagerInner {
    connections: ConnectionManager,
    presence: Option<PresenceRegistry>,
    transfers: DashMap<TransferId, TransferEntry>,
    config: TransferConfig,
    in_flight: AtomicUsize,
}

impl ManagerInner {
    fn register(
        &self,
        id: TransferId,
        status: &watch::Receiver<TransferStatus>,
        progress: &watch::Receiver<TransferProgress>,
        cancel: &CancellationToken,
    ) {
        self.transfers.insert(
            id,
            TransferEntry {
                status: status.clone(),
                progress: progress.clone(),
                cancel: cancel.clone(),
            },
        );
    }

    /// Publishes Busy while anything is in flight, Online otherwise.
    fn sync_presence(self: &Arc<Self>) {
        let Some(registry) = self.presence.clone() else {
            return;
        };
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let status = if inner.in_flight.load(Ordering::Acquire) > 0 {
                PresenceStatus::Busy
            } else {
                PresenceStatus::Online
            };
            if registry.status() != status {
                if let Err(e) = registry.set_status(status).await {
                    warn!(error = %e, "Failed to publish presence status");
                }
            }
        });
    }

    /// Keeps the channel after success, closes it after failure unless other
    /// sessions still run on it.
    fn release<T>(&self, channel: &Arc<Channel>, result: &Result<T, TransferError>) {
        match result {
            Ok(_) => {
                if self.connections.release(channel) {
                    debug!(peer = %channel.peer_id().short(), "Detached channel closed after transfer");
                }
            }
            Err(_) if channel.active_sessions() == 0 => {
                if self.connections.close_channel(channel) {
                    debug!(peer = %channel.peer_id().short(), "Channel closed after failed transfer");
                }
            }
            Err(_) => debug!(peer = %channel.peer_id().short(), "Channel kept for other sessions"),
        }
    }

    async fn run_send(
        self: Arc<Self>,
        session: SendSession,
        peer_id: PeerId,
        status: watch::Sender<TransferStatus>,
        cancel: CancellationToken,
    ) -> Result<SessionReport, TransferError> {
        let _busy = BusyGuard::enter(&self);
        status.send_replace(TransferStatus::Connecting);

        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransferError::Cancelled { by_peer: false }),
            connected = self.connections.connect(peer_id, self.config.connect_timeout) => {
                connected.map_err(TransferError::from)
            }
        };
        let channel = match connected {
            Ok(channel) => channel,
            Err(e) => {
                status.send_replace(TransferStatus::from_error(&e));
                warn!(error = %e, "Could not reach peer");
                return Err(e);
            }
        };

        status.send_replace(TransferStatus::Waiting);
        let progress = session.progress();
        let result = mirror_status(session.run(&channel), progress, &status).await;

        status.send_replace(TransferStatus::from_result(&result));
        self.release(&channel, &result);
        result
    }

    async fn run_receive(
        self: Arc<Self>,
        pending: PendingTransfer,
        channel: Option<Arc<Channel>>,
        status: watch::Sender<TransferStatus>,
        cancel: CancellationToken,
    ) -> Result<ReceivedFile, TransferError> {
        let _busy = BusyGuard::enter(&self);
        let progress = pending.progress();
        let session_config = self.config.session.clone();
        let accepted = pending.accept(&session_config, cancel);

        let result = match progress {
            Some(progress) => mirror_status(accepted, progress, &status).await,
            None => accepted.await,
        };

        status.send_replace(TransferStatus::from_result(&result));
        if let Some(channel) = channel {
            self.release(&channel, &result);
        }
        result
    }
}

/// Drives `session` while translating its progress into status updates.
async fn mirror_status<T>(
    session: impl std::future::Future<Output = Result<T, TransferError>>,
    mut progress: watch::Receiver<TransferProgress>,
    status: &watch::Sender<TransferStatus>,
) -> Result<T, TransferError> {
    tokio::pin!(session);
    loop {
        tokio::select! {
            result = &mut session => return result,
            changed = progress.changed() => {
                if changed.is_err() {
                    return (&mut session).await;
                }
                let next = TransferStatus::from_session(&progress.borrow_and_update().state);
                if !next.is_terminal() && next != TransferStatus::Idle {
                    status.send_if_modified(|current| {
                        if *current != next {
                            *current = next;
                            true
                        } else {
                            false
                        }
                    });
                }
            }
        }
    }
}

/// Counts in-flight transfers for the presence status.
struct BusyGuard {
    inner: Arc<ManagerInner>,
}

impl BusyGuard {
    fn enter(inner: &Arc<ManagerInner>) -> Self {
        if inner.in_flight.fetch_add(1, Ordering::AcqRel) == 0 {
            inner.sync_presence();
        }
        Self {
            inner: Arc::clone(inner),
        }
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.sync_presence();
        }
    }
}

/// Drives file transfers end to end.
///
/// Cloning is cheap; clones share the transfer registry.
#[derive(Clone)]
pub struct TransferManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for TransferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferManager")
            .field("download_dir", &self.inner.config.download_dir)
            .field("transfers", &self.inner.transfers.len())
            .finish_non_exhaustive()
    }
}

impl TransferManager {
    /// Creates a transfer manager. With a presence registry the manager
    /// advertises `Busy` while transfers are in flight.
    pub fn new(
        connections: ConnectionManager,
        presence: Option<PresenceRegistry>,
        config: TransferConfig,
    ) -> Self {
        info!(download_dir = %config.download_dir.display(), "Transfer manager initialized");
        Self {
            inner: Arc::new(ManagerInner {
                connections,
                presence,
                transfers: DashMap::new(),
                config,
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.inner.connections
    }

    pub fn presence(&self) -> Option<&PresenceRegistry> {
        self.inner.presence.as_ref()
    }

    /// Gets the download directory.
    pub fn download_dir(&self) -> &Path {
        &self.inner.config.download_dir
    }

    /// Sends one file to one peer.
    #[instrument(skip(self, file), fields(peer = %peer_id.short(), file_name = %file.metadata.name))]
    pub fn send_file(&self, peer_id: PeerId, file: OutgoingFile) -> TransferHandle<SessionReport> {
        let session = SendSession::new(peer_id, file, self.inner.config.session.clone());
        let id = session.transfer_id();
        let progress = session.progress();
        let cancel = session.cancel_token();
        let (status_tx, status) = watch::channel(TransferStatus::Idle);

        self.inner.register(id, &status, &progress, &cancel);
        info!(transfer_id = %id, "Starting file send");

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(inner.run_send(session, peer_id, status_tx, cancel.clone()));

        TransferHandle {
            id,
            peer_id,
            status,
            progress,
            cancel,
            task,
        }
    }

    /// Sends `file` to several peers. Every peer gets its own session and
    /// its own entry in the result; a failure never stops the others.
    #[instrument(skip(self, peers, file, mode), fields(peer_count = peers.len(), mode = ?mode))]
    pub async fn send_to_many(
        &self,
        peers: &[PeerId],
        file: OutgoingFile,
        mode: FanOut,
    ) -> HashMap<PeerId, Result<SessionReport, TransferError>> {
        let mut results = HashMap::with_capacity(peers.len());

        match mode {
            FanOut::Sequential => {
                for &peer in peers {
                    let outcome = self.send_file(peer, file.clone()).wait().await;
                    results.insert(peer, outcome);
                }
            }
            FanOut::Parallel => {
                let handles: Vec<_> = peers
                    .iter()
                    .map(|&peer| (peer, self.send_file(peer, file.clone())))
                    .collect();
                for (peer, handle) in handles {
                    results.insert(peer, handle.wait().await);
                }
            }
        }

        let delivered = results.values().filter(|r| r.is_ok()).count();
        info!(delivered, failed = results.len() - delivered, "Fan-out finished");
        results
    }

    /// Waits for the next transfer request from any peer.
    pub async fn next_incoming(&self) -> Option<PendingTransfer> {
        self.inner
            .connections
            .next_request()
            .await
            .map(PendingTransfer::new)
    }

    /// Accepts a pending request and starts receiving it.
    pub fn accept(
        &self,
        pending: PendingTransfer,
    ) -> Result<TransferHandle<ReceivedFile>, TransferError> {
        let (Some(id), Some(peer_id), Some(progress)) =
            (pending.transfer_id(), pending.peer_id(), pending.progress())
        else {
            return Err(TransferError::Protocol(Arc::from("transfer already decided")));
        };
        let channel = pending.channel();
        let cancel = CancellationToken::new();
        let (status_tx, status) = watch::channel(TransferStatus::Waiting);

        self.inner.register(id, &status, &progress, &cancel);
        info!(transfer_id = %id, peer = %peer_id.short(), "Accepting transfer");

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(inner.run_receive(pending, channel, status_tx, cancel.clone()));

        Ok(TransferHandle {
            id,
            peer_id,
            status,
            progress,
            cancel,
            task,
        })
    }

    /// Declines a pending request.
    pub fn reject(&self, pending: PendingTransfer) -> Result<(), TransferError> {
        pending.reject()
    }

    /// Returns all active transfers
    pub fn active_transfers(&self) -> Vec<TransferSnapshot> {
        self.inner
            .transfers
            .iter()
            .filter(|entry| entry.value().is_active())
            .map(|entry| entry.value().snapshot())
            .collect()
    }

    /// Returns all transfers (including finished ones)
    pub fn all_transfers(&self) -> Vec<TransferSnapshot> {
        self.inner
            .transfers
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect()
    }

    pub fn get_transfer(&self, id: TransferId) -> Option<TransferSnapshot> {
        self.inner.transfers.get(&id).map(|entry| entry.value().snapshot())
    }

    /// Cancels a transfer
    #[instrument(skip(self), fields(transfer_id = %id))]
    pub fn cancel_transfer(&self, id: TransferId) -> bool {
        match self.inner.transfers.get(&id) {
            Some(entry) if entry.is_active() => {
                entry.cancel.cancel();
                info!("Transfer cancelled");
                true
            }
            Some(_) => {
                debug!("Transfer already finished");
                false
            }
            None => {
                warn!("Transfer not found");
                false
            }
        }
    }

    /// Removes finished transfers from tracking
    pub fn cleanup_finished(&self) -> usize {
        let before = self.inner.transfers.len();
        self.inner.transfers.retain(|_, entry| entry.is_active());
        before - self.inner.transfers.len()
    }

    /// Returns the number of active transfers
    pub fn active_transfer_count(&self) -> usize {
        self.inner
            .transfers
            .iter()
            .filter(|entry| entry.value().is_active())
            .count()
    }

    /// Number of sessions currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }
}

/// Collapses a fan-out result into delivered / not delivered.
pub fn success_map(
    results: &HashMap<PeerId, Result<SessionReport, TransferError>>,
) -> HashMap<PeerId, bool> {
    results
        .iter()
        .map(|(peer, result)| (*peer, result.is_ok()))
        .collect()
}
