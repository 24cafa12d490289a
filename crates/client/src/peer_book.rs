//! The peer metrics database: per-address behavior records, lazily rebuilt
//! rating and seen-time indexes, and the derived blacklist.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::warn;

use crate::metrics::PeerMetrics;
use crate::rating::{blacklist_threshold, rate};
use crate::unix_now_ms;

/// Full-index rebuild cooldown.
const REBUILD_COOLDOWN_MS: u64 = 10_000;

/// Persistence requests drained by a single background writer.
#[derive(Debug)]
pub enum PeerWrite {
    Put(SocketAddr, PeerMetrics),
    Delete(SocketAddr),
}

#[derive(Default)]
struct BookInner {
    metrics: HashMap<SocketAddr, PeerMetrics>,
    /// `(rating, computed_at_ms)` per address.
    ratings: HashMap<SocketAddr, (f64, u64)>,
    seen_index: BTreeMap<u64, HashSet<SocketAddr>>,
    rating_index: BTreeMap<u64, HashSet<SocketAddr>>,
    non_blacklisted: HashSet<SocketAddr>,
    last_rebuild_ms: u64,
}

pub struct PeerBook {
    threshold: f64,
    inner: Mutex<BookInner>,
    persist: Mutex<Option<mpsc::UnboundedSender<PeerWrite>>>,
}

fn rating_key(rating: f64) -> u64 {
    (rating.clamp(0.0, 1.0) * 1e12) as u64
}

impl BookInner {
    fn detach_seen(&mut self, addr: SocketAddr, seen_ms: u64) {
        if let Some(addrs) = self.seen_index.get_mut(&seen_ms) {
            addrs.remove(&addr);
            if addrs.is_empty() {
                self.seen_index.remove(&seen_ms);
            }
        }
    }

    fn detach_rating(&mut self, addr: SocketAddr) {
        if let Some((rating, _)) = self.ratings.remove(&addr) {
            let key = rating_key(rating);
            if let Some(addrs) = self.rating_index.get_mut(&key) {
                addrs.remove(&addr);
                if addrs.is_empty() {
                    self.rating_index.remove(&key);
                }
            }
        }
        self.non_blacklisted.remove(&addr);
    }

    fn attach_rating(&mut self, addr: SocketAddr, rating: f64, threshold: f64, now_ms: u64) {
        self.ratings.insert(addr, (rating, now_ms));
        self.rating_index.entry(rating_key(rating)).or_default().insert(addr);
        if rating >= threshold {
            self.non_blacklisted.insert(addr);
        }
    }

    fn rating_of(&mut self, addr: SocketAddr, threshold: f64, now_ms: u64) -> Option<f64> {
        if let Some((rating, computed_at)) = self.ratings.get(&addr) {
            if now_ms.saturating_sub(*computed_at) < REBUILD_COOLDOWN_MS {
                return Some(*rating);
            }
        }
        let metrics = self.metrics.get(&addr)?.clone();
        let rating = rate(&metrics, now_ms);
        self.detach_rating(addr);
        self.attach_rating(addr, rating, threshold, now_ms);
        Some(rating)
    }

    fn rebuild_if_due(&mut self, threshold: f64, now_ms: u64) {
        if now_ms.saturating_sub(self.last_rebuild_ms) < REBUILD_COOLDOWN_MS {
            return;
        }
        self.last_rebuild_ms = now_ms;
        self.ratings.clear();
        self.rating_index.clear();
        self.non_blacklisted.clear();
        let addrs: Vec<(SocketAddr, PeerMetrics)> = self
            .metrics
            .iter()
            .map(|(addr, metrics)| (*addr, metrics.clone()))
            .collect();
        for (addr, metrics) in addrs {
            let rating = rate(&metrics, now_ms);
            self.attach_rating(addr, rating, threshold, now_ms);
        }
    }
}

impl PeerBook {
    pub fn new() -> Self {
        Self {
            threshold: blacklist_threshold(unix_now_ms()),
            inner: Mutex::new(BookInner::default()),
            persist: Mutex::new(None),
        }
    }

    /// The fixed blacklist cutoff, derived once at construction.
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn set_persist(&self, tx: Option<mpsc::UnboundedSender<PeerWrite>>) {
        if let Ok(mut persist) = self.persist.lock() {
            *persist = tx;
        }
    }

    fn enqueue_put(&self, addr: SocketAddr, metrics: PeerMetrics) {
        if let Ok(persist) = self.persist.lock() {
            if let Some(tx) = persist.as_ref() {
                let _ = tx.send(PeerWrite::Put(addr, metrics));
            }
        }
    }

    fn enqueue_delete(&self, addr: SocketAddr) {
        if let Ok(persist) = self.persist.lock() {
            if let Some(tx) = persist.as_ref() {
                let _ = tx.send(PeerWrite::Delete(addr));
            }
        }
    }

    /// Read-modify-write one record; every update is also a seen signal.
    fn update(&self, addr: SocketAddr, apply: impl FnOnce(&mut PeerMetrics, u64)) {
        let now_ms = unix_now_ms();
        let Ok(mut inner) = self.inner.lock() else {
            warn!("peer book lock poisoned");
            return;
        };
        let old_seen = inner.metrics.get(&addr).map(|metrics| metrics.last_seen_ms);
        let entry = inner.metrics.entry(addr).or_default();
        apply(entry, now_ms);
        let snapshot = entry.clone();
        if let Some(old_seen) = old_seen {
            if old_seen != snapshot.last_seen_ms {
                inner.detach_seen(addr, old_seen);
            }
        }
        inner
            .seen_index
            .entry(snapshot.last_seen_ms)
            .or_default()
            .insert(addr);
        // Refresh this one address in place; the bulk rebuild only covers
        // records going stale without updates.
        let rating = rate(&snapshot, now_ms);
        inner.detach_rating(addr);
        inner.attach_rating(addr, rating, self.threshold, now_ms);
        drop(inner);
        self.enqueue_put(addr, snapshot);
    }

    pub fn add_seen(&self, addr: SocketAddr) {
        self.update(addr, |metrics, now| metrics.add_seen(now));
    }

    pub fn add_seen_batch(&self, addrs: &[SocketAddr]) {
        for addr in addrs {
            self.add_seen(*addr);
        }
    }

    pub fn add_ping(&self, addr: SocketAddr, duration_ms: u64) {
        self.update(addr, |metrics, now| metrics.add_ping(duration_ms, now));
    }

    pub fn add_last_connect(&self, addr: SocketAddr) {
        self.update(addr, |metrics, now| metrics.add_last_connect(now));
    }

    pub fn add_last_connect_and_test(&self, addr: SocketAddr) {
        self.update(addr, |metrics, now| metrics.add_last_connect_and_test(now));
    }

    pub fn add_data_received(&self, addr: SocketAddr) {
        self.update(addr, |metrics, now| metrics.add_data_received(now));
    }

    pub fn add_out_of_sync(&self, addr: SocketAddr) {
        self.update(addr, |metrics, now| metrics.add_out_of_sync(now));
    }

    pub fn add_invalid_chain(&self, addr: SocketAddr) {
        self.update(addr, |metrics, now| metrics.add_invalid_chain(now));
    }

    pub fn add_unintentional_disconnect(&self, addr: SocketAddr) {
        self.update(addr, |metrics, now| metrics.add_unintentional_disconnect(now));
    }

    /// Install a record loaded from disk without re-persisting it.
    pub fn insert_loaded(&self, addr: SocketAddr, metrics: PeerMetrics) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner
            .seen_index
            .entry(metrics.last_seen_ms)
            .or_default()
            .insert(addr);
        inner.metrics.insert(addr, metrics);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.metrics.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics_of(&self, addr: SocketAddr) -> Option<PeerMetrics> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.metrics.get(&addr).cloned())
    }

    pub fn rating(&self, addr: SocketAddr) -> Option<f64> {
        let now_ms = unix_now_ms();
        let mut inner = self.inner.lock().ok()?;
        inner.rating_of(addr, self.threshold, now_ms)
    }

    pub fn is_blacklisted(&self, addr: SocketAddr) -> bool {
        match self.rating(addr) {
            Some(rating) => rating < self.threshold,
            None => false,
        }
    }

    pub fn non_blacklisted_count(&self) -> usize {
        let now_ms = unix_now_ms();
        let Ok(mut inner) = self.inner.lock() else {
            return 0;
        };
        inner.rebuild_if_due(self.threshold, now_ms);
        inner.non_blacklisted.len()
    }

    /// Best-rated candidates, highest first, excluding blacklisted and
    /// caller-excluded addresses.
    pub fn top_rated(&self, limit: usize, exclude: &HashSet<SocketAddr>) -> Vec<SocketAddr> {
        if limit == 0 {
            return Vec::new();
        }
        let now_ms = unix_now_ms();
        let Ok(mut inner) = self.inner.lock() else {
            return Vec::new();
        };
        inner.rebuild_if_due(self.threshold, now_ms);
        let mut out = Vec::new();
        for addrs in inner.rating_index.values().rev() {
            for addr in addrs {
                if inner.non_blacklisted.contains(addr) && !exclude.contains(addr) {
                    out.push(*addr);
                    if out.len() >= limit {
                        return out;
                    }
                }
            }
        }
        out
    }

    /// Shed the oldest-seen surplus above `cap`, sparing `keep`.
    pub fn prune_oldest(&self, cap: usize, keep: &HashSet<SocketAddr>) -> usize {
        let Ok(mut inner) = self.inner.lock() else {
            return 0;
        };
        let mut victims = Vec::new();
        if inner.metrics.len() > cap {
            let surplus = inner.metrics.len() - cap;
            'scan: for addrs in inner.seen_index.values() {
                for addr in addrs {
                    if keep.contains(addr) {
                        continue;
                    }
                    victims.push(*addr);
                    if victims.len() >= surplus {
                        break 'scan;
                    }
                }
            }
            for addr in &victims {
                if let Some(metrics) = inner.metrics.remove(addr) {
                    inner.detach_seen(*addr, metrics.last_seen_ms);
                }
                inner.detach_rating(*addr);
            }
        }
        drop(inner);
        for addr in &victims {
            self.enqueue_delete(*addr);
        }
        victims.len()
    }
}

impl Default for PeerBook {
    fn default() -> Self {
        Self::new()
    }
}
