//! Bounded TX/RX frame ring with latency pairing.
//!
//! At most one TX is pending at a time; the next RX closes it and adds
//! one request/response latency sample. Extra RX frames are stored but
//! never paired, which is the right behavior for half-duplex polling
//! protocols and intentionally does not generalize to pipelining.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::capture::describe::{self, FrameFlavor};

/// Frame direction relative to this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    #[serde(rename = "TX")]
    Tx,
    #[serde(rename = "RX")]
    Rx,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tx => "TX",
            Self::Rx => "RX",
        }
    }
}

/// One captured frame.
#[derive(Debug, Clone, Serialize)]
pub struct MessageRecord {
    /// Monotonic per-capture sequence number.
    pub sequence_id: u64,
    pub direction: Direction,
    /// Raw frame bytes.
    #[serde(serialize_with = "hex_bytes")]
    pub bytes: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    /// TX→RX latency in milliseconds, set on the RX of a pair.
    pub latency_ms: Option<f64>,
    /// Human-readable frame summary.
    pub description: String,
}

fn hex_bytes<S: serde::Serializer>(bytes: &[u8], s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&bytes.iter().map(|b| format!("{b:02x}")).collect::<String>())
}

impl MessageRecord {
    /// Spaced lowercase hex rendering for the operator view.
    pub fn hex_spaced(&self) -> String {
        self.bytes
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Millisecond-precision wall-clock time.
    pub fn formatted_time(&self) -> String {
        self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
    }
}

/// Capture counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CaptureStats {
    pub tx_count: u64,
    pub rx_count: u64,
    pub total_count: u64,
    pub pair_count: u64,
    /// Average TX→RX latency over all pairs, 0 when no pair exists.
    pub avg_latency_ms: f64,
}

struct CaptureInner {
    queue: VecDeque<MessageRecord>,
    sequence: u64,
    tx_count: u64,
    rx_count: u64,
    pair_count: u64,
    total_latency_ms: f64,
    pending_tx: Option<Instant>,
}

/// Thread-safe bounded capture ring.
pub struct MessageCapture {
    capacity: usize,
    flavor: FrameFlavor,
    enabled: AtomicBool,
    inner: Mutex<CaptureInner>,
}

impl MessageCapture {
    /// Create a ring holding at most `capacity` frames.
    pub fn new(capacity: usize, flavor: FrameFlavor) -> Self {
        Self {
            capacity,
            flavor,
            enabled: AtomicBool::new(true),
            inner: Mutex::new(CaptureInner {
                queue: VecDeque::with_capacity(capacity),
                sequence: 0,
                tx_count: 0,
                rx_count: 0,
                pair_count: 0,
                total_latency_ms: 0.0,
                pending_tx: None,
            }),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    /// Store a transmitted frame and open a pairing window.
    pub fn record_tx(&self, bytes: &[u8]) {
        self.record_tx_at(bytes, Instant::now());
    }

    /// Store a received frame, closing the pairing window if one is open.
    pub fn record_rx(&self, bytes: &[u8]) {
        self.record_rx_at(bytes, Instant::now());
    }

    pub(crate) fn record_tx_at(&self, bytes: &[u8], at: Instant) {
        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.tx_count += 1;
        inner.pending_tx = Some(at);
        self.push(&mut inner, Direction::Tx, bytes, None);
    }

    pub(crate) fn record_rx_at(&self, bytes: &[u8], at: Instant) {
        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.rx_count += 1;
        let latency_ms = inner.pending_tx.take().map(|mark| {
            let ms = at.saturating_duration_since(mark).as_secs_f64() * 1000.0;
            inner.total_latency_ms += ms;
            inner.pair_count += 1;
            ms
        });
        self.push(&mut inner, Direction::Rx, bytes, latency_ms);
    }

    fn push(
        &self,
        inner: &mut CaptureInner,
        direction: Direction,
        bytes: &[u8],
        latency_ms: Option<f64>,
    ) {
        inner.sequence += 1;
        if inner.queue.len() == self.capacity {
            inner.queue.pop_front();
        }
        let record = MessageRecord {
            sequence_id: inner.sequence,
            direction,
            bytes: bytes.to_vec(),
            timestamp: Utc::now(),
            latency_ms,
            description: describe::describe(self.flavor, direction, bytes),
        };
        inner.queue.push_back(record);
    }

    /// Capture counters and average latency.
    pub fn stats(&self) -> CaptureStats {
        let inner = self.inner.lock().unwrap();
        let avg_latency_ms = if inner.pair_count > 0 {
            inner.total_latency_ms / inner.pair_count as f64
        } else {
            0.0
        };
        CaptureStats {
            tx_count: inner.tx_count,
            rx_count: inner.rx_count,
            total_count: inner.tx_count + inner.rx_count,
            pair_count: inner.pair_count,
            avg_latency_ms,
        }
    }

    /// Copy out up to `limit` newest frames, newest last.
    ///
    /// `limit == 0` returns everything.
    pub fn snapshot(&self, limit: usize) -> Vec<MessageRecord> {
        let inner = self.inner.lock().unwrap();
        let skip = if limit > 0 && inner.queue.len() > limit {
            inner.queue.len() - limit
        } else {
            0
        };
        inner.queue.iter().skip(skip).cloned().collect()
    }

    /// Drop all frames and reset the counters.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.clear();
        inner.tx_count = 0;
        inner.rx_count = 0;
        inner.pair_count = 0;
        inner.total_latency_ms = 0.0;
        inner.pending_tx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn capture() -> MessageCapture {
        MessageCapture::new(200, FrameFlavor::ModbusTcp)
    }

    #[test]
    fn test_latency_pairing() {
        let c = capture();
        let t0 = Instant::now();
        c.record_tx_at(&[1], t0);
        c.record_rx_at(&[2], t0 + Duration::from_millis(50));
        c.record_tx_at(&[3], t0 + Duration::from_millis(200));
        c.record_rx_at(&[4], t0 + Duration::from_millis(260));

        let stats = c.stats();
        assert_eq!(stats.tx_count, 2);
        assert_eq!(stats.rx_count, 2);
        assert_eq!(stats.pair_count, 2);
        assert!((stats.avg_latency_ms - 55.0).abs() < 1.0);
    }

    #[test]
    fn test_unpaired_rx_is_stored_not_paired() {
        let c = capture();
        let t0 = Instant::now();
        c.record_rx_at(&[1], t0);
        c.record_tx_at(&[2], t0);
        c.record_rx_at(&[3], t0 + Duration::from_millis(10));
        c.record_rx_at(&[4], t0 + Duration::from_millis(20));

        let stats = c.stats();
        assert_eq!(stats.rx_count, 3);
        assert_eq!(stats.pair_count, 1);
        assert_eq!(c.snapshot(0).len(), 4);
    }

    #[test]
    fn test_ring_eviction_keeps_sequence_monotonic() {
        let c = MessageCapture::new(3, FrameFlavor::ModbusTcp);
        for i in 0..5u8 {
            c.record_tx(&[i]);
        }
        let frames = c.snapshot(0);
        assert_eq!(frames.len(), 3);
        let ids: Vec<u64> = frames.iter().map(|m| m.sequence_id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[test]
    fn test_snapshot_limit_newest_last() {
        let c = capture();
        for i in 0..10u8 {
            c.record_tx(&[i]);
        }
        let frames = c.snapshot(4);
        assert_eq!(frames.len(), 4);
        assert_eq!(frames.last().unwrap().bytes, vec![9]);
    }

    #[test]
    fn test_clear_resets_everything() {
        let c = capture();
        c.record_tx(&[1]);
        c.record_rx(&[2]);
        c.clear();
        assert_eq!(c.stats(), CaptureStats::default());
        assert!(c.snapshot(0).is_empty());
    }

    #[test]
    fn test_stats_invariants() {
        let c = capture();
        c.record_tx(&[1]);
        c.record_tx(&[2]);
        c.record_rx(&[3]);
        let s = c.stats();
        assert!(s.tx_count >= s.pair_count);
        assert!(s.rx_count >= s.pair_count);
    }

    #[test]
    fn test_disabled_capture_drops_frames() {
        let c = capture();
        c.disable();
        c.record_tx(&[1]);
        assert_eq!(c.stats().tx_count, 0);
        c.enable();
        c.record_tx(&[1]);
        assert_eq!(c.stats().tx_count, 1);
    }

    #[test]
    fn test_hex_rendering() {
        let c = capture();
        c.record_tx(&[0x00, 0x01, 0xAB]);
        let frames = c.snapshot(1);
        assert_eq!(frames[0].hex_spaced(), "00 01 ab");
    }
}
