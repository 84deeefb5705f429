//! The risk model behind pinning, and the pin cache.
//!
//! A pin is a short-lived promise that content remains available for a
//! bounded window. Whether a set of location records is promise-worthy is a
//! risk calculation, not a fixed count: with `n` records, the chance the
//! content is unavailable everywhere is roughly `q_m^n` when each location
//! was verified recently and `(q_m + q_f·(1-q_m))^n` when not, where `q_m`
//! is the machine-unavailability risk and `q_f` the per-record staleness
//! risk. Given a tolerance `Q`, the minimum record counts follow directly:
//!
//! ```text
//! n_v = ⌈ln Q / ln q_m⌉
//! n_u = ⌈ln Q / ln(q_m + q_f·(1-q_m))⌉
//! ```
//!
//! All thresholds derive from [`PinConfig`] at call time; nothing numeric
//! is hardcoded here.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use strum::Display as StrumDisplay;
use tracing::trace;
use wire::ContentHash;

use crate::config::PinConfig;

/// The combined risk that an unverified location record fails to produce
/// the content: the machine is down, or it is up but the record is stale.
pub fn unverified_risk(config: &PinConfig) -> f64 {
    config.machine_risk + config.file_risk * (1.0 - config.machine_risk)
}

/// Minimum number of *verified* records for a pin to succeed on records
/// alone.
pub fn min_verified_records(config: &PinConfig) -> usize {
    records_for_risk(config.risk_tolerance, config.machine_risk)
}

/// Minimum number of *unverified* records for a pin to succeed on records
/// alone.
pub fn min_unverified_records(config: &PinConfig) -> usize {
    records_for_risk(config.risk_tolerance, unverified_risk(config))
}

fn records_for_risk(tolerance: f64, per_record_risk: f64) -> usize {
    // Degenerate configurations (risk 0 or ≥ 1) collapse to one record or
    // an unreachable threshold respectively.
    if per_record_risk <= 0.0 {
        return 1;
    }
    if per_record_risk >= 1.0 {
        return usize::MAX;
    }
    (tolerance.ln() / per_record_risk.ln()).ceil().max(1.0) as usize
}

/// The pin-cache TTL for content with `records` known locations: a
/// geometric series in the configured decay factor, so each additional
/// replica extends the promise by a diminishing amount.
pub fn ttl_for_records(config: &PinConfig, records: usize) -> Duration {
    let decay = config.ttl_decay.clamp(0.0, 0.99);
    let mut factor = 0.0;
    let mut term = 1.0;
    for _ in 0..records {
        factor += term;
        term *= decay;
    }
    config.base_ttl.mul_f64(factor)
}

/// How a pin was satisfied. Carried in pin results for observability and
/// asserted on by the pin tests.
#[derive(Copy, Clone, Eq, PartialEq, Debug, StrumDisplay)]
pub enum PinSource {
    /// The content is in the local store.
    Local,
    /// A fresh pin-cache entry answered.
    PinCache,
    /// Enough unverified location records existed.
    RecordCount,
    /// Enough locations were verified on the spot.
    Verified,
    /// The content was copied into the local store to satisfy the pin.
    LocalCopy,
    /// Bulk-pin fast path: the content exists somewhere, with no promise of
    /// local materialization.
    GlobalExistence,
}

/// A concurrent TTL cache of recent successful pins.
#[derive(Debug, Default)]
pub struct PinCache {
    entries: DashMap<ContentHash, Instant>,
}

impl PinCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a fresh entry exists for this hash.
    pub fn is_fresh(&self, hash: &ContentHash) -> bool {
        match self.entries.get(hash) {
            Some(expiry) => *expiry > Instant::now(),
            None => false,
        }
    }

    /// Record a successful pin valid for `ttl`.
    pub fn insert(&self, hash: ContentHash, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        trace!(%hash, ?ttl, "pin cached");
        self.entries.insert(hash, Instant::now() + ttl);
    }

    /// Drop expired entries. Called opportunistically; correctness never
    /// depends on it.
    pub fn evict_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, expiry| *expiry > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    fn config(machine_risk: f64, file_risk: f64, tolerance: f64) -> PinConfig {
        PinConfig::builder()
            .machine_risk(machine_risk)
            .file_risk(file_risk)
            .risk_tolerance(tolerance)
            .build()
    }

    #[test]
    fn thresholds_follow_the_model() {
        // q_m = 0.1, Q = 1e-3: n_v = ceil(ln 1e-3 / ln 0.1) = 3.
        let config = config(0.1, 0.2, 1e-3);
        pretty_assert_eq!(min_verified_records(&config), 3);

        // Unverified risk = 0.1 + 0.2*0.9 = 0.28; ceil(ln 1e-3 / ln 0.28) = 6.
        pretty_assert_eq!(min_unverified_records(&config), 6);
    }

    #[test]
    fn tighter_tolerance_needs_more_records() {
        let loose = config(0.05, 0.1, 1e-2);
        let tight = config(0.05, 0.1, 1e-6);
        assert!(min_verified_records(&tight) > min_verified_records(&loose));
        assert!(min_unverified_records(&tight) > min_unverified_records(&loose));
    }

    #[test]
    fn unverified_threshold_never_below_verified() {
        for (qm, qf, tol) in [(0.01, 0.05, 1e-4), (0.2, 0.3, 1e-3), (0.5, 0.5, 1e-2)] {
            let config = config(qm, qf, tol);
            assert!(
                min_unverified_records(&config) >= min_verified_records(&config),
                "qm={qm} qf={qf} tol={tol}"
            );
        }
    }

    #[test]
    fn ttl_grows_geometrically_and_saturates() {
        let config = PinConfig::builder().ttl_decay(0.5).build();
        let one = ttl_for_records(&config, 1);
        let two = ttl_for_records(&config, 2);
        let many = ttl_for_records(&config, 50);

        pretty_assert_eq!(one, config.base_ttl);
        pretty_assert_eq!(two, config.base_ttl.mul_f64(1.5));
        // Geometric series with r=0.5 converges to 2x.
        assert!(many < config.base_ttl.mul_f64(2.01));
        assert!(many > config.base_ttl.mul_f64(1.99));
    }

    #[test]
    fn pin_cache_expires() {
        let cache = PinCache::new();
        let hash = ContentHash::from_buffer(b"h");

        cache.insert(hash, Duration::from_secs(60));
        assert!(cache.is_fresh(&hash));

        let expired = ContentHash::from_buffer(b"e");
        cache.insert(expired, Duration::from_nanos(1));
        std::thread::sleep(Duration::from_millis(2));
        assert!(!cache.is_fresh(&expired));

        cache.evict_expired();
        pretty_assert_eq!(cache.len(), 1);
    }
}
