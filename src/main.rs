//! lanbeam - loopback demo.
//!
//! Starts two endpoints on an in-process network sharing one presence
//! store, waits until they see each other and sends a file from one to the
//! other. The receiver saves it to the download directory.
//!
//! ```bash
//! RUST_LOG=lanbeam=debug cargo run -- --file ./photo.jpg
//! cargo run -- --size 1048576 --download-dir /tmp/inbox
//! ```

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::RngCore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lanbeam::net::{
    ConnectionManager, DeviceIdentity, LocalAddrIdentifier, MemoryNetwork, MemoryPresenceStore,
    OutgoingFile, PeerEvent, PeerId, PeerTransport, PresenceRegistry, PresenceStore,
    TransferManager, TransferStatus,
};
use lanbeam::Config;

/// How long the demo waits for the two endpoints to discover each other.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "lanbeam", about = "Send a file between two local endpoints")]
struct Args {
    /// File to send. A random payload is generated when omitted.
    #[arg(long)]
    file: Option<PathBuf>,

    /// Size of the generated payload in bytes
    #[arg(long, default_value_t = 200 * 1024)]
    size: usize,

    /// Where the received file is saved
    #[arg(long)]
    download_dir: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

/// One endpoint of the demo.
struct Node {
    presence: PresenceRegistry,
    connections: ConnectionManager,
    transfers: TransferManager,
}

impl Node {
    async fn start(
        identity: &DeviceIdentity,
        addr: IpAddr,
        network: &Arc<MemoryNetwork>,
        store: Arc<dyn PresenceStore>,
        config: &Config,
    ) -> Result<Self> {
        let transport: Arc<dyn PeerTransport> = network.join(identity.id, Some(addr));
        let identifier = LocalAddrIdentifier::new(Arc::clone(&transport));

        let presence =
            PresenceRegistry::start(identity, &identifier, store, config.presence.clone())
                .await
                .with_context(|| {
                    format!("Failed to start presence for {}", identity.display_name)
                })?;

        let connections = ConnectionManager::new(transport, config.connection.clone());
        connections.start();

        let transfers = TransferManager::new(
            connections.clone(),
            Some(presence.clone()),
            config.transfer.clone(),
        );

        Ok(Self {
            presence,
            connections,
            transfers,
        })
    }

    async fn stop(&self) {
        if let Err(e) = self.presence.stop().await {
            warn!(error = %e, "Failed to withdraw presence");
        }
        self.connections.shutdown();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = Config::from_env().context("Invalid LANBEAM_* configuration")?;
    if let Some(dir) = args.download_dir.clone() {
        config.transfer.download_dir = dir;
    }

    let file = match &args.file {
        Some(path) => OutgoingFile::from_path(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut data = vec![0u8; args.size];
            rand::thread_rng().fill_bytes(&mut data);
            OutgoingFile::from_bytes("lanbeam-demo.bin", data)
        }
    };

    let network = MemoryNetwork::new();
    let store: Arc<dyn PresenceStore> = MemoryPresenceStore::new();

    let sender_identity = DeviceIdentity::load_or_create()
        .await
        .context("Failed to load device identity")?;
    let receiver_identity = DeviceIdentity::generate();

    let lan = |last| IpAddr::V4(Ipv4Addr::new(192, 168, 1, last));
    let sender =
        Node::start(&sender_identity, lan(10), &network, Arc::clone(&store), &config).await?;
    let receiver = Node::start(&receiver_identity, lan(20), &network, store, &config).await?;

    info!(
        sender = %sender_identity.display_name,
        receiver = %receiver_identity.display_name,
        group = %sender.presence.group_key(),
        "Endpoints started"
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted");
                cancel.cancel();
            }
        }
    });

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(anyhow::anyhow!("Interrupted")),
        outcome = run_transfer(&sender, &receiver, receiver_identity.id, file) => outcome,
    };

    for node in [&sender, &receiver] {
        for transfer in node.transfers.active_transfers() {
            node.transfers.cancel_transfer(transfer.id());
        }
    }
    sender.stop().await;
    receiver.stop().await;

    outcome
}

async fn run_transfer(
    sender: &Node,
    receiver: &Node,
    receiver_id: PeerId,
    file: OutgoingFile,
) -> Result<()> {
    wait_for_peer(&sender.presence, receiver_id).await?;

    let inbox = receiver.transfers.clone();
    let receive_task = tokio::spawn(async move {
        let pending = inbox
            .next_incoming()
            .await
            .context("Connection manager stopped")?;
        if let Some(metadata) = pending.metadata() {
            info!(file_name = %metadata.name, size = metadata.size, mime = %metadata.mime_type, "Incoming transfer");
        }

        let received = inbox.accept(pending)?.wait().await?;
        let path = received.save_to(inbox.download_dir()).await?;
        anyhow::Ok(path)
    });

    let handle = sender.transfers.send_file(receiver_id, file);
    let mut progress = handle.progress_watch();
    let mut status = handle.status_watch();
    let reporter = tokio::spawn(async move {
        let mut last = None;
        while progress.changed().await.is_ok() {
            let percent = progress.borrow_and_update().percent();
            if last.map_or(true, |p: u8| percent >= p.saturating_add(25) || percent == 100) {
                info!(percent, "Sending");
                last = Some(percent);
            }
        }
    });
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            debug!(status = ?current, "Transfer status");
        }
    });

    let report = handle.wait().await.context("Send failed")?;
    reporter.abort();

    let path = receive_task.await.context("Receiver task panicked")??;
    info!(
        bytes = report.bytes,
        chunks = report.chunks,
        elapsed = ?report.elapsed,
        path = %path.display(),
        "Transfer complete"
    );

    let summary = sender
        .transfers
        .all_transfers()
        .into_iter()
        .filter(|t| t.status == TransferStatus::Complete)
        .count();
    debug!(completed = summary, pooled = sender.connections.stats().open, "Sender state");
    Ok(())
}

async fn wait_for_peer(presence: &PresenceRegistry, peer_id: PeerId) -> Result<()> {
    let mut events = presence.watch();
    let discovered = tokio::time::timeout(DISCOVERY_TIMEOUT, async {
        while let Some(event) = events.recv().await {
            if let PeerEvent::Discovered(peer) = event {
                info!(peer = %peer.display_name, status = ?peer.status, "Discovered peer");
                if peer.id == peer_id {
                    return true;
                }
            }
        }
        false
    })
    .await;

    match discovered {
        Ok(true) => Ok(()),
        Ok(false) => bail!("Presence registry stopped before the peer appeared"),
        Err(_) => bail!("Peer not discovered within {:?}", DISCOVERY_TIMEOUT),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "lanbeam=debug" } else { "lanbeam=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
