use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Confidence is tracked in millionths so it fits an atomic counter.
const CONFIDENCE_ONE: u64 = 1_000_000;
const CONFIDENCE_MIN: u64 = 100_000;

/// Peer count at which the estimate is considered saturated; registrations
/// beyond it no longer shake confidence.
pub(crate) const QOS_CONFIDENCE_CAP: usize = 10;
/// Weight of a fresh median measurement against the smoothed estimate.
const QOS_TUNING_IMPACT: f64 = 0.25;
const TTL_SCALING: u32 = 3;

/// Exponentially smoothed round-trip estimate with a confidence weight,
/// shared lock-free between the tuner task and every request site.
pub(crate) struct QosEstimator {
    rtt_estimate: AtomicU64,   // nanoseconds
    rtt_confidence: AtomicU64, // millionths
    rtt_min: Duration,
    rtt_max: Duration,
    ttl_limit: Duration,
}

impl QosEstimator {
    pub fn new(rtt_min: Duration, rtt_max: Duration, ttl_limit: Duration) -> Self {
        Self {
            rtt_estimate: AtomicU64::new(rtt_max.as_nanos() as u64),
            rtt_confidence: AtomicU64::new(CONFIDENCE_ONE),
            rtt_min,
            rtt_max,
            ttl_limit,
        }
    }

    pub fn estimate(&self) -> Duration {
        Duration::from_nanos(self.rtt_estimate.load(Ordering::Relaxed))
    }

    pub fn confidence(&self) -> f64 {
        self.rtt_confidence.load(Ordering::Relaxed) as f64 / CONFIDENCE_ONE as f64
    }

    /// One tuner tick: fold the peer median into the estimate and let the
    /// confidence recover halfway toward certain.
    pub fn tune(&self, median: Duration) {
        let current = self.rtt_estimate.load(Ordering::Relaxed) as f64;
        let mut rtt = (1.0 - QOS_TUNING_IMPACT) * current
            + QOS_TUNING_IMPACT * median.as_nanos() as f64;
        rtt = rtt.clamp(self.rtt_min.as_nanos() as f64, self.rtt_max.as_nanos() as f64);
        self.rtt_estimate.store(rtt as u64, Ordering::Relaxed);

        let conf = self.rtt_confidence.load(Ordering::Relaxed);
        self.rtt_confidence
            .store(conf + (CONFIDENCE_ONE - conf) / 2, Ordering::Relaxed);
    }

    /// A new peer joined: its RTT is unknown, so the estimate deserves less
    /// trust. A lone peer defines the estimate outright; a saturated set is
    /// unaffected.
    pub fn reduce_confidence(&self, peer_count: usize) {
        let peers = peer_count as u64;
        if peers == 0 {
            return;
        }
        if peers == 1 {
            self.rtt_confidence.store(CONFIDENCE_ONE, Ordering::Relaxed);
            return;
        }
        if peers >= QOS_CONFIDENCE_CAP as u64 {
            return;
        }
        let mut conf = self.rtt_confidence.load(Ordering::Relaxed) * (peers - 1) / peers;
        if conf < CONFIDENCE_MIN {
            conf = CONFIDENCE_MIN;
        }
        self.rtt_confidence.store(conf, Ordering::Relaxed);
    }

    /// Target round-trip used to budget per-peer request sizes. Slightly
    /// under the estimate so a healthy peer finishes inside one window.
    pub fn request_rtt(&self) -> Duration {
        self.estimate() * 9 / 10
    }

    /// Hard deadline for outstanding requests. Low confidence inflates it
    /// so sparse-peer sessions do not thrash on timeouts.
    pub fn request_ttl(&self) -> Duration {
        let rtt = self.estimate().as_nanos() as f64;
        let ttl = Duration::from_nanos((TTL_SCALING as f64 * rtt / self.confidence()) as u64);
        ttl.min(self.ttl_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator() -> QosEstimator {
        QosEstimator::new(
            Duration::from_secs(2),
            Duration::from_secs(20),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn ttl_stays_within_contract_bounds() {
        let qos = estimator();
        // Fresh estimator: rtt = 20s, conf = 1.
        assert_eq!(qos.request_ttl(), Duration::from_secs(60));
        for _ in 0..32 {
            qos.tune(Duration::from_millis(1));
        }
        // Converged to the minimum clamp.
        assert_eq!(qos.estimate(), Duration::from_secs(2));
        assert!(qos.request_ttl() >= Duration::from_secs(6));
        assert!(qos.request_ttl() <= Duration::from_secs(60));
        assert!(qos.request_rtt() <= qos.request_ttl());
    }

    #[test]
    fn confidence_drops_on_register_and_recovers_on_tune() {
        let qos = estimator();
        qos.reduce_confidence(2);
        assert!(qos.confidence() < 1.0);
        qos.reduce_confidence(3);
        let reduced = qos.confidence();
        qos.tune(Duration::from_secs(5));
        assert!(qos.confidence() > reduced);
    }

    #[test]
    fn lone_peer_resets_confidence() {
        let qos = estimator();
        qos.reduce_confidence(5);
        qos.reduce_confidence(1);
        assert_eq!(qos.confidence(), 1.0);
    }

    #[test]
    fn confidence_floor_holds() {
        let qos = estimator();
        for _ in 0..64 {
            qos.reduce_confidence(9);
        }
        assert!(qos.confidence() >= 0.1);
    }

    #[test]
    fn saturated_peer_set_keeps_confidence() {
        let qos = estimator();
        let before = qos.confidence();
        qos.reduce_confidence(QOS_CONFIDENCE_CAP);
        assert_eq!(qos.confidence(), before);
    }
}
