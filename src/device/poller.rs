//! Batched polling with address-range coalescing.
//!
//! Candidate points are bucketed by `(slave_id, function_code)`, sorted
//! by address and merged into contiguous runs, so one framed request
//! covers as many points as the protocol allows. Adapters without batch
//! support fall back to single-point reads. Failures are isolated per
//! group: affected points go stale, the next group still runs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::codec;
use crate::core::point::Point;
use crate::core::validity::Validity;
use crate::protocols::adapter::{bit_of, ProtocolAdapter};

/// One coalesced read: a contiguous register span of one slave/function.
#[derive(Debug, Clone)]
pub struct AddressGroup {
    pub slave_id: u8,
    pub function_code: u8,
    pub start_address: u32,
    pub register_count: u16,
    pub points: Vec<Arc<Point>>,
}

/// Totals of one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOutcome {
    pub success: usize,
    pub fail: usize,
}

impl ReadOutcome {
    fn absorb(&mut self, other: ReadOutcome) {
        self.success += other.success;
        self.fail += other.fail;
    }
}

/// Function codes that name a readable address space.
fn is_pollable(function_code: u8) -> bool {
    (1..=4).contains(&function_code)
}

/// Merge points into maximal contiguous address runs.
///
/// A point extends the current run when its start lies within `max_gap`
/// of the run's end and the merged span stays within `max_count`
/// registers. Emission order follows `(slave_id, function_code)` then
/// address.
pub fn group_points(points: &[Arc<Point>], max_gap: u32, max_count: u16) -> Vec<AddressGroup> {
    let mut buckets: BTreeMap<(u8, u8), Vec<Arc<Point>>> = BTreeMap::new();
    for point in points {
        if !is_pollable(point.function_code()) {
            continue;
        }
        buckets
            .entry((point.slave_id(), point.function_code()))
            .or_default()
            .push(point.clone());
    }

    let mut groups = Vec::new();
    for ((slave_id, function_code), mut bucket) in buckets {
        bucket.sort_by_key(|p| p.address());

        let mut current: Option<AddressGroup> = None;
        for point in bucket {
            let reg_count = point.register_count() as u32;
            let point_end = point.address() + reg_count;

            match current.as_mut() {
                None => {
                    current = Some(AddressGroup {
                        slave_id,
                        function_code,
                        start_address: point.address(),
                        register_count: reg_count as u16,
                        points: vec![point],
                    });
                }
                Some(group) => {
                    let end = group.start_address + group.register_count as u32;
                    let new_end = end.max(point_end);
                    let new_count = new_end - group.start_address;
                    if point.address() <= end + max_gap && new_count <= max_count as u32 {
                        group.register_count = new_count as u16;
                        group.points.push(point);
                    } else if let Some(done) = current.take() {
                        groups.push(done);
                        current = Some(AddressGroup {
                            slave_id,
                            function_code,
                            start_address: point.address(),
                            register_count: reg_count as u16,
                            points: vec![point],
                        });
                    }
                }
            }
        }
        if let Some(group) = current {
            groups.push(group);
        }
    }
    groups
}

/// Decode a batch response into the group's points.
pub fn decode_group(group: &AddressGroup, registers: &[u16]) -> ReadOutcome {
    let mut outcome = ReadOutcome::default();
    for point in &group.points {
        let offset = (point.address() - group.start_address) as usize;
        let reg_count = point.register_count() as usize;
        if offset + reg_count > registers.len() {
            // Should not happen when grouping is correct; stay defensive.
            warn!(code = point.code(), offset, "batch offset out of range");
            point.set_validity(Validity::Stale);
            outcome.fail += 1;
            continue;
        }
        let words = &registers[offset..offset + reg_count];

        let raw = if point.kind().is_binary() {
            match point.bit() {
                Some(bit) if !is_bit_space(group.function_code) => bit_of(words[0], bit),
                _ => (words[0] != 0) as i64,
            }
        } else {
            let bytes = codec::registers_to_bytes(words);
            match codec::unpack(point.decode_code(), &bytes) {
                Ok(value) => value.as_i64(),
                Err(e) => {
                    warn!(code = point.code(), error = %e, "batch decode failed");
                    point.set_validity(Validity::Stale);
                    outcome.fail += 1;
                    continue;
                }
            }
        };

        point.set_raw(raw);
        point.set_validity(Validity::Fresh);
        outcome.success += 1;
    }
    outcome
}

fn is_bit_space(function_code: u8) -> bool {
    function_code == 1 || function_code == 2
}

/// Execute one poll cycle over the given points.
///
/// Sleeps `interval_ms` between requests (never before the first). A
/// pending stop keeps the in-flight request running but prevents the
/// next from starting.
pub async fn poll_cycle(
    adapter: &dyn ProtocolAdapter,
    points: &[Arc<Point>],
    interval_ms: u64,
    max_gap: u32,
    max_count: u16,
    stop: Option<&watch::Receiver<bool>>,
) -> ReadOutcome {
    let groups = group_points(points, max_gap, max_count);
    if points.len() > groups.len() && groups.len() > 1 {
        debug!(
            points = points.len(),
            requests = groups.len(),
            "coalesced poll plan"
        );
    }

    let mut outcome = ReadOutcome::default();
    let mut first_request = true;
    for group in groups {
        if let Some(stop) = stop {
            if *stop.borrow() {
                break;
            }
        }
        if !first_request && interval_ms > 0 {
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        }
        first_request = false;

        match adapter
            .read_batch(
                group.slave_id,
                group.function_code,
                group.start_address,
                group.register_count,
            )
            .await
        {
            Ok(Some(registers)) => {
                outcome.absorb(decode_group(&group, &registers));
            }
            Ok(None) => {
                // No batch support on this endpoint: read point by point.
                outcome.absorb(poll_single(adapter, &group.points).await);
            }
            Err(e) => {
                debug!(
                    slave = group.slave_id,
                    function = group.function_code,
                    start = group.start_address,
                    error = %e,
                    "batch read failed"
                );
                for point in &group.points {
                    point.set_validity(Validity::Stale);
                }
                outcome.fail += group.points.len();
            }
        }
    }
    outcome
}

/// Fallback: read each point with its own request.
async fn poll_single(adapter: &dyn ProtocolAdapter, points: &[Arc<Point>]) -> ReadOutcome {
    let mut outcome = ReadOutcome::default();
    for point in points {
        match adapter.read_value(point).await {
            Ok(Some(raw)) => {
                point.set_raw(raw);
                point.set_validity(Validity::Fresh);
                outcome.success += 1;
            }
            Ok(None) => {
                point.set_validity(Validity::Stale);
                outcome.fail += 1;
            }
            Err(e) => {
                debug!(code = point.code(), error = %e, "point read failed");
                point.set_validity(Validity::Stale);
                outcome.fail += 1;
            }
        }
    }
    outcome
}
