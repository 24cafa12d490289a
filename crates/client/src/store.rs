//! Write-behind persistence: background writers drain queues into the
//! key-value stores. The in-memory state is authoritative; a failed write is
//! logged and the entry is simply re-downloaded after a restart.

use std::net::SocketAddr;
use std::sync::Arc;

use chaintip_graph::Changeset;
use chaintip_primitives::BlockHeader;
use chaintip_storage::{Column, KeyValueStore, StoreError, WriteBatch};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics::PeerMetrics;
use crate::peer_book::{PeerBook, PeerWrite};

pub fn height_key(height: u32) -> [u8; 4] {
    height.to_be_bytes()
}

fn height_from_key(key: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = key.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// Canonical textual key for a peer record.
pub fn peer_key(addr: &SocketAddr) -> String {
    addr.to_string()
}

/// Apply one changeset: stale heights deleted, new chain suffix written.
fn changeset_batch(changeset: &Changeset) -> WriteBatch {
    let mut batch = WriteBatch::new();
    for node in &changeset.removed {
        batch.delete(Column::Headers, height_key(node.height));
    }
    for node in &changeset.added {
        batch.put(Column::Headers, height_key(node.height), node.raw().to_vec());
    }
    batch
}

pub fn spawn_header_writer(
    store: Arc<dyn KeyValueStore>,
    mut rx: mpsc::UnboundedReceiver<Changeset>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changeset = rx.recv() => match changeset {
                    Some(changeset) => write_changeset(store.as_ref(), &changeset),
                    None => return,
                }
            }
        }
        // Drain whatever was queued before the stop signal.
        while let Ok(changeset) = rx.try_recv() {
            write_changeset(store.as_ref(), &changeset);
        }
    })
}

fn write_changeset(store: &dyn KeyValueStore, changeset: &Changeset) {
    let batch = changeset_batch(changeset);
    if let Err(err) = store.write_batch(&batch) {
        warn!(%err, "header persistence failed; in-memory chain stays authoritative");
    }
}

pub fn spawn_peer_writer(
    store: Arc<dyn KeyValueStore>,
    mut rx: mpsc::UnboundedReceiver<PeerWrite>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                write = rx.recv() => match write {
                    Some(write) => apply_peer_write(store.as_ref(), write),
                    None => return,
                }
            }
        }
        while let Ok(write) = rx.try_recv() {
            apply_peer_write(store.as_ref(), write);
        }
    })
}

fn apply_peer_write(store: &dyn KeyValueStore, write: PeerWrite) {
    let result = match &write {
        PeerWrite::Put(addr, metrics) => {
            store.put(Column::Peers, peer_key(addr).as_bytes(), &metrics.encode())
        }
        PeerWrite::Delete(addr) => store.delete(Column::Peers, peer_key(addr).as_bytes()),
    };
    if let Err(err) = result {
        warn!(%err, "peer metrics persistence failed");
    }
}

/// Replay the persisted chain in height order; the caller feeds the result
/// through `Chain::add_headers`. Height 0 is the seeded genesis and is
/// skipped. A gap or corrupt record stops the replay; later headers are
/// treated as unknown and re-downloaded.
pub fn load_headers(store: &dyn KeyValueStore) -> Result<Vec<BlockHeader>, StoreError> {
    let entries = store.scan_prefix(Column::Headers, &[])?;
    let mut headers = Vec::with_capacity(entries.len());
    let mut expected_height = 1u32;
    for (key, value) in entries {
        let Some(height) = height_from_key(&key) else {
            warn!("skipping malformed header key");
            continue;
        };
        if height == 0 {
            continue;
        }
        if height != expected_height {
            warn!(height, expected_height, "gap in persisted headers; dropping the tail");
            break;
        }
        match BlockHeader::parse(&value, true) {
            Ok(header) => headers.push(header),
            Err(err) => {
                warn!(height, %err, "corrupt persisted header; dropping the tail");
                break;
            }
        }
        expected_height += 1;
    }
    debug!(count = headers.len(), "loaded persisted headers");
    Ok(headers)
}

/// Seed the headers store with genesis so iteration always starts at 0.
pub fn persist_genesis(store: &dyn KeyValueStore, raw: &[u8; 80]) {
    if let Err(err) = store.put(Column::Headers, &height_key(0), raw) {
        warn!(%err, "failed to persist genesis header");
    }
}

pub fn load_peers(store: &dyn KeyValueStore, book: &PeerBook) -> Result<usize, StoreError> {
    let entries = store.scan_prefix(Column::Peers, &[])?;
    let mut loaded = 0usize;
    for (key, value) in entries {
        let Ok(text) = std::str::from_utf8(&key) else {
            continue;
        };
        let Ok(addr) = text.parse::<SocketAddr>() else {
            continue;
        };
        match PeerMetrics::decode(&value) {
            Ok(metrics) => {
                book.insert_loaded(addr, metrics);
                loaded += 1;
            }
            Err(err) => {
                debug!(peer = text, %err, "dropping unreadable peer record");
            }
        }
    }
    Ok(loaded)
}
