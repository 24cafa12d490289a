//! Seed-address acquisition: HTTPS bootstrap list and DNS seed resolution.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use rand::seq::SliceRandom;
use serde::Deserialize;
use tracing::warn;

#[derive(Debug)]
pub enum BootstrapError {
    Http(String),
    Parse(String),
}

impl fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapError::Http(what) => write!(f, "bootstrap fetch failed: {what}"),
            BootstrapError::Parse(what) => write!(f, "bootstrap list unreadable: {what}"),
        }
    }
}

impl std::error::Error for BootstrapError {}

#[derive(Debug, Deserialize)]
struct BootstrapPeer {
    addr: String,
    #[serde(default)]
    banscore: i64,
}

/// One-shot fetch of the bootstrap peer list; banned peers are dropped.
pub async fn fetch_bootstrap_peers(
    url: &str,
    timeout: Duration,
) -> Result<Vec<SocketAddr>, BootstrapError> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| BootstrapError::Http(err.to_string()))?;
    let body = client
        .get(url)
        .send()
        .await
        .map_err(|err| BootstrapError::Http(err.to_string()))?
        .text()
        .await
        .map_err(|err| BootstrapError::Http(err.to_string()))?;

    let peers: Vec<BootstrapPeer> =
        serde_json::from_str(&body).map_err(|err| BootstrapError::Parse(err.to_string()))?;

    let mut addrs = Vec::new();
    for peer in peers {
        if peer.banscore != 0 {
            continue;
        }
        match peer.addr.parse::<SocketAddr>() {
            Ok(addr) => addrs.push(addr),
            Err(_) => warn!(addr = %peer.addr, "skipping unparseable bootstrap address"),
        }
    }
    Ok(addrs)
}

/// Resolve fixed and configured seeds to socket addresses, shuffled.
pub async fn resolve_seed_addresses(seeds: &[String], default_port: u16) -> Vec<SocketAddr> {
    let mut addrs = Vec::new();
    let mut seen = HashSet::new();
    for seed in seeds {
        if let Ok(addr) = seed.parse::<SocketAddr>() {
            if seen.insert(addr) {
                addrs.push(addr);
            }
            continue;
        }
        let host = if seed.contains(':') {
            seed.clone()
        } else {
            format!("{seed}:{default_port}")
        };
        match tokio::net::lookup_host(host).await {
            Ok(entries) => {
                for addr in entries {
                    if seen.insert(addr) {
                        addrs.push(addr);
                    }
                }
            }
            Err(err) => {
                warn!(seed = %seed, %err, "failed to resolve seed");
            }
        }
    }
    addrs.shuffle(&mut rand::thread_rng());
    addrs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_json_shape_parses_and_filters() {
        let body = r#"[
            {"addr": "203.0.113.1:8333", "banscore": 0},
            {"addr": "203.0.113.2:8333", "banscore": 40},
            {"addr": "not-an-addr", "banscore": 0},
            {"addr": "203.0.113.3:8333"}
        ]"#;
        let peers: Vec<BootstrapPeer> = serde_json::from_str(body).expect("json parses");
        let kept: Vec<SocketAddr> = peers
            .iter()
            .filter(|peer| peer.banscore == 0)
            .filter_map(|peer| peer.addr.parse().ok())
            .collect();
        assert_eq!(
            kept,
            vec![
                "203.0.113.1:8333".parse::<SocketAddr>().expect("addr"),
                "203.0.113.3:8333".parse::<SocketAddr>().expect("addr"),
            ]
        );
    }

    #[tokio::test]
    async fn literal_seeds_resolve_without_dns() {
        let seeds = vec!["203.0.113.7:8333".to_string(), "203.0.113.7:8333".to_string()];
        let addrs = resolve_seed_addresses(&seeds, 8333).await;
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].port(), 8333);
    }
}
