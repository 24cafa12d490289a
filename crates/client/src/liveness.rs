//! Process-wide internet liveness evidence.
//!
//! Sessions report inbound traffic here, so an active connection doubles as
//! proof of connectivity and the HTTP probe stays quiet. The pool consults
//! the monitor before deciding whether a connect failure was the peer's
//! fault or ours.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::unix_now_ms;

const PROBE_URLS: [&str; 3] = [
    "https://www.google.com/generate_204",
    "https://www.cloudflare.com/cdn-cgi/trace",
    "https://connectivitycheck.gstatic.com/generate_204",
];

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

pub struct LivenessMonitor {
    /// Unix millis of the last known moment of connectivity; 0 = never.
    last_online_ms: AtomicU64,
    poll_interval: Duration,
}

impl LivenessMonitor {
    pub fn new(poll_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            last_online_ms: AtomicU64::new(0),
            poll_interval,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Record connectivity evidence, e.g. bytes arriving on any session.
    pub fn note_online(&self) {
        self.last_online_ms.store(unix_now_ms(), Ordering::Relaxed);
    }

    pub fn last_online_ms(&self) -> u64 {
        self.last_online_ms.load(Ordering::Relaxed)
    }

    pub fn online_within(&self, window: Duration) -> bool {
        let last = self.last_online_ms();
        if last == 0 {
            return false;
        }
        unix_now_ms().saturating_sub(last) <= window.as_millis() as u64
    }

    /// One probe round; any URL answering counts as online.
    pub async fn probe(&self) -> bool {
        let Ok(client) = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() else {
            return false;
        };
        for url in PROBE_URLS {
            match client.head(url).send().await {
                Ok(_) => {
                    self.note_online();
                    return true;
                }
                Err(err) => {
                    debug!(url, %err, "liveness probe failed");
                }
            }
        }
        false
    }

    /// Cheap online check: recent evidence short-circuits the HTTP probe.
    pub async fn is_online(&self) -> bool {
        if self.online_within(self.poll_interval) {
            return true;
        }
        self.probe().await
    }

    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(monitor.poll_interval) => {}
                }
                // Sessions feeding note_online make the probe redundant.
                if !monitor.online_within(Duration::from_secs(1)) {
                    monitor.probe().await;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_online_updates_the_window() {
        let monitor = LivenessMonitor::new(Duration::from_secs(30));
        assert!(!monitor.online_within(Duration::from_secs(1)));
        monitor.note_online();
        assert!(monitor.online_within(Duration::from_secs(1)));
    }
}
