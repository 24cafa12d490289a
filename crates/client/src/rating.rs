//! Multi-factor peer reputation scoring.
//!
//! The rating is a weighted geometric product of six subscores in [ε, 1].
//! The blacklist cutoff is not hard-coded: it is the maximum rating over a
//! set of canonical borderline-bad profiles, so retuning any subscore
//! re-centers the decision boundary automatically.

use crate::metrics::PeerMetrics;

pub const WEIGHT_PING: f64 = 0.60;
pub const WEIGHT_DISCONNECT_BEFORE: f64 = 0.30;
pub const WEIGHT_DISCONNECT_AFTER: f64 = 0.30;
pub const WEIGHT_OUT_OF_SYNC: f64 = 0.38;
pub const WEIGHT_INVALID_CHAIN: f64 = 0.50;
pub const WEIGHT_CONNECT_RECENCY: f64 = 0.20;

const SCORE_FLOOR: f64 = 1e-6;

const MS_PER_DAY: f64 = 86_400_000.0;
const MS_PER_WEEK: f64 = 7.0 * MS_PER_DAY;
const MS_PER_FOUR_HOURS: f64 = 4.0 * 60.0 * 60.0 * 1000.0;

const HOUR_MS: u64 = 60 * 60 * 1000;
const DAY_MS: u64 = 24 * HOUR_MS;

fn clamp_score(score: f64) -> f64 {
    score.clamp(SCORE_FLOOR, 1.0)
}

fn days_since(now_ms: u64, then_ms: u64) -> f64 {
    now_ms.saturating_sub(then_ms) as f64 / MS_PER_DAY
}

/// Rises toward 1 as `days` grows past the midpoint; bad events age out.
fn rising_sigmoid(days: f64, steepness: f64, midpoint: f64) -> f64 {
    1.0 / (1.0 + (-steepness * (days - midpoint)).exp())
}

/// Falls toward 0 as `days` grows past the midpoint; staleness decays.
fn falling_sigmoid(days: f64, steepness: f64, midpoint: f64) -> f64 {
    1.0 / (1.0 + (steepness * (days - midpoint)).exp())
}

/// Recency-weighted average of per-ping quality; 2 s is the half-way point
/// and any single ping scores at least 0.1.
fn ping_score(metrics: &PeerMetrics, now_ms: u64) -> f64 {
    if metrics.recent_pings.is_empty() {
        return 0.25;
    }
    let mut weighted_sum = 0.0;
    let mut weight_sum = 0.0;
    for (duration_ms, timestamp_ms) in &metrics.recent_pings {
        let quality = 1.0 / (1.0 + (0.0022 * (*duration_ms as f64 - 2000.0)).exp());
        let quality = quality.max(0.1);
        let age_ms = now_ms.saturating_sub(*timestamp_ms) as f64;
        let weight = (-age_ms / MS_PER_WEEK).exp();
        weighted_sum += weight * quality;
        weight_sum += weight;
    }
    if weight_sum <= 0.0 {
        return 0.25;
    }
    weighted_sum / weight_sum
}

fn disconnect_before_score(metrics: &PeerMetrics, now_ms: u64) -> f64 {
    let Some(latest) = metrics.disconnects_before_connect_ms.iter().max() else {
        return 1.0;
    };
    let mut days = days_since(now_ms, *latest);
    // Seen through other peers after the event: likely reputable, age it.
    if metrics.last_seen_ms > *latest {
        days += 10.0;
    }
    rising_sigmoid(days, 0.4, 22.0)
}

/// Clustered recent drops crash the score: each event's recency is
/// amplified by its neighbors within a four-hour radius.
fn disconnect_after_score(metrics: &PeerMetrics, now_ms: u64) -> f64 {
    if metrics.disconnects_after_connect_ms.is_empty() {
        return 1.0;
    }
    let mut worst = 0.0f64;
    for t_i in &metrics.disconnects_after_connect_ms {
        let recency = (-(now_ms.saturating_sub(*t_i) as f64) / MS_PER_WEEK).exp();
        let amplification: f64 = metrics
            .disconnects_after_connect_ms
            .iter()
            .map(|t_j| (-(t_i.abs_diff(*t_j) as f64) / MS_PER_FOUR_HOURS).exp())
            .sum();
        worst = worst.max(recency * amplification);
    }
    1.0 / (1.0 + 0.5 * (2.7 * worst).powi(5))
}

fn out_of_sync_score(metrics: &PeerMetrics, now_ms: u64) -> f64 {
    match metrics.last_out_of_sync_ms {
        Some(then) => rising_sigmoid(days_since(now_ms, then), 0.98, 3.0),
        None => 1.0,
    }
}

fn invalid_chain_score(metrics: &PeerMetrics, now_ms: u64) -> f64 {
    match metrics.last_invalid_chain_ms {
        Some(then) => rising_sigmoid(days_since(now_ms, then), 0.049, 70.0),
        None => 1.0,
    }
}

fn connect_recency_score(metrics: &PeerMetrics, now_ms: u64) -> f64 {
    match metrics.latest_connect_signal() {
        Some(then) => {
            let sigmoid = falling_sigmoid(days_since(now_ms, then), 0.25, 30.0);
            0.8 + 0.2 * sigmoid
        }
        None => 0.5,
    }
}

/// Weighted geometric product of the six subscores.
pub fn rate(metrics: &PeerMetrics, now_ms: u64) -> f64 {
    let factors = [
        (ping_score(metrics, now_ms), WEIGHT_PING),
        (disconnect_before_score(metrics, now_ms), WEIGHT_DISCONNECT_BEFORE),
        (disconnect_after_score(metrics, now_ms), WEIGHT_DISCONNECT_AFTER),
        (out_of_sync_score(metrics, now_ms), WEIGHT_OUT_OF_SYNC),
        (invalid_chain_score(metrics, now_ms), WEIGHT_INVALID_CHAIN),
        (connect_recency_score(metrics, now_ms), WEIGHT_CONNECT_RECENCY),
    ];
    factors
        .into_iter()
        .map(|(score, weight)| clamp_score(score).powf(weight))
        .product()
}

/// Canonical borderline profiles; the blacklist cutoff is the best rating
/// any of them achieves at `now_ms`.
fn borderline_profiles(now_ms: u64) -> [PeerMetrics; 5] {
    // Connected fine, then dropped three times within a day.
    let mut flaky = PeerMetrics::default();
    flaky.add_last_connect(now_ms.saturating_sub(22 * HOUR_MS));
    for ago in [20 * HOUR_MS, 8 * HOUR_MS, 2 * HOUR_MS] {
        flaky.add_ping(90, now_ms.saturating_sub(ago + HOUR_MS));
        flaky.add_unintentional_disconnect(now_ms.saturating_sub(ago));
    }

    // Served headers two days ago but was lagging the longest chain.
    let mut lagging = PeerMetrics::default();
    lagging.add_last_connect(now_ms.saturating_sub(2 * DAY_MS));
    lagging.add_out_of_sync(now_ms.saturating_sub(2 * DAY_MS));

    // Advertised an invalid branch two months ago.
    let mut poisoned = PeerMetrics::default();
    poisoned.add_last_connect(now_ms.saturating_sub(60 * DAY_MS));
    poisoned.add_invalid_chain(now_ms.saturating_sub(60 * DAY_MS));

    // Refused the handshake two days ago and has never connected.
    let mut unreachable = PeerMetrics::default();
    unreachable.add_unintentional_disconnect(now_ms.saturating_sub(2 * DAY_MS));

    // Reachable but consistently near the ping ceiling.
    let mut sluggish = PeerMetrics::default();
    sluggish.add_last_connect(now_ms.saturating_sub(HOUR_MS));
    for ago in [26 * HOUR_MS, 14 * HOUR_MS, 2 * HOUR_MS] {
        sluggish.add_ping(4_000, now_ms.saturating_sub(ago));
    }

    [flaky, lagging, poisoned, unreachable, sluggish]
}

/// Computed once at startup and cached by the pool.
pub fn blacklist_threshold(now_ms: u64) -> f64 {
    borderline_profiles(now_ms)
        .iter()
        .map(|profile| rate(profile, now_ms))
        .fold(0.0, f64::max)
}
