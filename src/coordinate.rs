//! Vivaldi network coordinates.
//!
//! Each node maintains a point in an 8-dimensional Euclidean space plus a
//! non-Euclidean height (access-link delay) and an adjustment term. Every
//! probe ack carries the responder's coordinate; the observed round-trip time
//! pulls our coordinate so that inter-node distance estimates RTT.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

pub const COORDINATE_DIMENSIONS: usize = 8;

const ERROR_MAX: f64 = 1.5;
/// Weight of one observation on the error estimate.
const CE: f64 = 0.25;
/// Weight of one observation on the coordinate itself.
const CC: f64 = 0.25;
const ADJUSTMENT_WINDOW: usize = 20;
const LATENCY_FILTER_WINDOW: usize = 3;
const HEIGHT_MIN: f64 = 10.0e-6;
/// RTTs below this are treated as this value; a zero RTT would blow up the
/// relative-error term.
const RTT_FLOOR: f64 = 1.0e-6;

/// Nodes a client keeps latency filters for before evicting the oldest.
const MAX_FILTERED_NODES: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub vec: Vec<f64>,
    pub error: f64,
    pub adjustment: f64,
    pub height: f64,
}

impl Default for Coordinate {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinate {
    pub fn new() -> Self {
        Self {
            vec: vec![0.0; COORDINATE_DIMENSIONS],
            error: ERROR_MAX,
            adjustment: 0.0,
            height: HEIGHT_MIN,
        }
    }

    /// Coordinates from different configurations (or corrupted snapshots)
    /// must never be mixed into the model.
    pub fn is_valid(&self) -> bool {
        self.vec.len() == COORDINATE_DIMENSIONS
            && self.vec.iter().all(|c| c.is_finite())
            && self.error.is_finite()
            && self.adjustment.is_finite()
            && self.height.is_finite()
            && self.height >= 0.0
    }

    /// Estimated RTT to `other`.
    pub fn distance_to(&self, other: &Coordinate) -> Duration {
        let raw = self.raw_distance_to(other);
        let adjusted = raw + self.adjustment + other.adjustment;
        let secs = if adjusted > 0.0 { adjusted } else { raw };
        Duration::from_secs_f64(secs.max(0.0))
    }

    fn raw_distance_to(&self, other: &Coordinate) -> f64 {
        let sq: f64 = self
            .vec
            .iter()
            .zip(&other.vec)
            .map(|(a, b)| (a - b) * (a - b))
            .sum();
        sq.sqrt() + self.height + other.height
    }

    /// Move `force` seconds along the line from `other` through us.
    fn apply_force(&self, other: &Coordinate, force: f64) -> Coordinate {
        let mut out = self.clone();
        let (unit, dist) = unit_vector(&self.vec, &other.vec);
        for (o, u) in out.vec.iter_mut().zip(&unit) {
            *o += u * force;
        }
        if dist > 0.0 {
            out.height = ((self.height + other.height) * force / dist + self.height)
                .max(HEIGHT_MIN);
        }
        out
    }
}

/// Unit vector from `b` to `a`, and the distance between them. Coincident
/// points get a random direction so identical nodes can still separate.
fn unit_vector(a: &[f64], b: &[f64]) -> (Vec<f64>, f64) {
    let diff: Vec<f64> = a.iter().zip(b).map(|(x, y)| x - y).collect();
    let mag = diff.iter().map(|d| d * d).sum::<f64>().sqrt();
    if mag > 1.0e-9 {
        return (diff.iter().map(|d| d / mag).collect(), mag);
    }

    use rand::Rng;
    let mut rng = rand::thread_rng();
    let random: Vec<f64> = (0..a.len()).map(|_| rng.gen::<f64>() - 0.5).collect();
    let mag = random.iter().map(|d| d * d).sum::<f64>().sqrt();
    if mag > 1.0e-9 {
        (random.iter().map(|d| d / mag).collect(), 0.0)
    } else {
        let mut v = vec![0.0; a.len()];
        v[0] = 1.0;
        (v, 0.0)
    }
}

pub struct CoordinateClient {
    coord: Mutex<Coordinate>,
    adjustment_samples: Mutex<VecDeque<f64>>,
    latency_filters: Mutex<HashMap<String, VecDeque<f64>>>,
    filter_order: Mutex<VecDeque<String>>,
}

impl Default for CoordinateClient {
    fn default() -> Self {
        Self::new()
    }
}

impl CoordinateClient {
    pub fn new() -> Self {
        Self {
            coord: Mutex::new(Coordinate::new()),
            adjustment_samples: Mutex::new(VecDeque::with_capacity(ADJUSTMENT_WINDOW)),
            latency_filters: Mutex::new(HashMap::new()),
            filter_order: Mutex::new(VecDeque::new()),
        }
    }

    pub fn get(&self) -> Coordinate {
        self.coord.lock().unwrap().clone()
    }

    /// Restore a snapshot-recovered coordinate. Invalid blobs are ignored.
    pub fn set(&self, coord: Coordinate) {
        if coord.is_valid() {
            *self.coord.lock().unwrap() = coord;
        }
    }

    /// Fold one RTT observation against `node` into our coordinate and
    /// return the updated value.
    pub fn update(&self, node: &str, other: &Coordinate, rtt: Duration) -> Coordinate {
        if !other.is_valid() {
            return self.get();
        }

        let rtt_secs = self.filtered_rtt(node, rtt.as_secs_f64().max(RTT_FLOOR));
        let mut coord = self.coord.lock().unwrap();

        let dist = coord.raw_distance_to(other);
        let wrongness = (dist - rtt_secs).abs() / rtt_secs;

        let total_error = (coord.error + other.error).max(RTT_FLOOR);
        let weight = coord.error / total_error;

        coord.error =
            (wrongness * CE * weight + coord.error * (1.0 - CE * weight)).min(ERROR_MAX);

        let force = CC * weight * (rtt_secs - dist);
        *coord = coord.apply_force(other, force);

        // Adjustment term: rolling average of how far raw distance misses
        // observed RTT.
        let mut samples = self.adjustment_samples.lock().unwrap();
        if samples.len() >= ADJUSTMENT_WINDOW {
            samples.pop_front();
        }
        samples.push_back(rtt_secs - coord.raw_distance_to(other));
        coord.adjustment = samples.iter().sum::<f64>() / (2.0 * samples.len() as f64);

        coord.clone()
    }

    /// Drop per-node filter state for a departed member.
    pub fn forget_node(&self, node: &str) {
        self.latency_filters.lock().unwrap().remove(node);
    }

    /// Median-of-window filter smoothing per-node RTT spikes.
    fn filtered_rtt(&self, node: &str, rtt_secs: f64) -> f64 {
        let mut filters = self.latency_filters.lock().unwrap();

        if !filters.contains_key(node) {
            let mut order = self.filter_order.lock().unwrap();
            order.push_back(node.to_string());
            if order.len() > MAX_FILTERED_NODES {
                if let Some(evict) = order.pop_front() {
                    filters.remove(&evict);
                }
            }
        }

        let window = filters.entry(node.to_string()).or_default();
        if window.len() >= LATENCY_FILTER_WINDOW {
            window.pop_front();
        }
        window.push_back(rtt_secs);

        let mut sorted: Vec<f64> = window.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        sorted[sorted.len() / 2]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_coordinate_at_origin() {
        let c = Coordinate::new();
        assert!(c.is_valid());
        assert_eq!(c.vec, vec![0.0; COORDINATE_DIMENSIONS]);
    }

    #[test]
    fn test_invalid_coordinate_detected() {
        let mut c = Coordinate::new();
        c.vec[0] = f64::NAN;
        assert!(!c.is_valid());

        let mut c = Coordinate::new();
        c.vec.push(0.0);
        assert!(!c.is_valid());
    }

    #[test]
    fn test_update_converges_toward_rtt() {
        let client = CoordinateClient::new();
        let other = Coordinate::new();
        let rtt = Duration::from_millis(100);

        for _ in 0..64 {
            client.update("peer", &other, rtt);
        }

        let est = client.get().distance_to(&other);
        let err = (est.as_secs_f64() - 0.1).abs();
        assert!(err < 0.05, "estimate {:?} too far from 100ms", est);
    }

    #[test]
    fn test_update_rejects_invalid_remote() {
        let client = CoordinateClient::new();
        let before = client.get();
        let mut bad = Coordinate::new();
        bad.vec[0] = f64::INFINITY;
        let after = client.update("peer", &bad, Duration::from_millis(10));
        assert_eq!(before, after);
    }

    #[test]
    fn test_latency_filter_is_median() {
        let client = CoordinateClient::new();
        assert_eq!(client.filtered_rtt("n", 0.1), 0.1);
        client.filtered_rtt("n", 9.0);
        // Window is now [0.1, 9.0, 0.11]; the median damps the spike.
        let m = client.filtered_rtt("n", 0.11);
        assert!(m < 1.0, "median {} should ignore the spike", m);
    }

    #[test]
    fn test_snapshot_set_ignores_garbage() {
        let client = CoordinateClient::new();
        let mut bad = Coordinate::new();
        bad.height = -1.0;
        client.set(bad);
        assert!(client.get().is_valid());
    }
}
