//! The measurement point model.
//!
//! One `Point` is a typed entry in a device's address space, based on the
//! "four remotes" (四遥) classification: telemetry, signal, command and
//! setpoint. Points carry both the wire-level register image (`raw_value`)
//! and the scaled engineering value (`real_value`); the two are kept
//! consistent by construction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::core::signal::{next_point_id, ChangeEvent, ChangeSignal, PointId};
use crate::core::validity::Validity;

/// The four measurement-point variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointKind {
    /// Analog input measurement (遥测)
    Analog = 0,
    /// Digital input status (遥信)
    Signal = 1,
    /// Digital output command (遥控)
    Command = 2,
    /// Analog output setpoint (遥调)
    Setpoint = 3,
}

impl PointKind {
    /// Build from the persisted frame-type discriminant.
    pub fn from_frame_type(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Analog),
            1 => Some(Self::Signal),
            2 => Some(Self::Command),
            3 => Some(Self::Setpoint),
            _ => None,
        }
    }

    /// Persisted frame-type discriminant.
    #[inline]
    pub fn frame_type(&self) -> u8 {
        *self as u8
    }

    /// Check if values of this kind carry scaling coefficients.
    #[inline]
    pub fn is_scaled(&self) -> bool {
        matches!(self, Self::Analog | Self::Setpoint)
    }

    /// Check if values of this kind are 0/1.
    #[inline]
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Signal | Self::Command)
    }

    /// Display label used by the operator table.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Analog => "遥测",
            Self::Signal => "遥信",
            Self::Command => "遥控",
            Self::Setpoint => "遥调",
        }
    }
}

impl std::fmt::Display for PointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Linear scaling of a register image into an engineering value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scaling {
    /// Multiplier: `real = raw * mul_coe + add_coe`.
    pub mul_coe: f64,
    /// Offset.
    pub add_coe: f64,
    /// Upper simulation/limit bound of the engineering value.
    pub max_limit: f64,
    /// Lower simulation/limit bound of the engineering value.
    pub min_limit: f64,
}

impl Default for Scaling {
    fn default() -> Self {
        Self {
            mul_coe: 1.0,
            add_coe: 0.0,
            max_limit: 0.0,
            min_limit: 0.0,
        }
    }
}

/// Editable point metadata.
#[derive(Debug, Clone)]
pub struct PointMeta {
    /// Display label.
    pub name: String,
    /// Remote terminal unit address.
    pub slave_id: u8,
    /// Protocol-native address (register / IOA / data identifier).
    pub address: u32,
    /// Protocol operation code.
    pub function_code: u8,
    /// Codec table tag.
    pub decode_code: u8,
    /// Bit position inside a 16-bit register, for bit-mapped binaries.
    pub bit: Option<u8>,
    /// Scaling coefficients (meaningful for Analog/Setpoint).
    pub scaling: Scaling,
    /// Command kinetics (0/1 for on/off), Command points only.
    pub command_type: u8,
}

/// Metadata patch applied by `edit_point_metadata`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PointMetaPatch {
    pub name: Option<String>,
    pub address: Option<u32>,
    pub function_code: Option<u8>,
    pub decode_code: Option<u8>,
    pub bit: Option<u8>,
    pub mul_coe: Option<f64>,
    pub add_coe: Option<f64>,
    pub max_limit: Option<f64>,
    pub min_limit: Option<f64>,
}

impl PointMetaPatch {
    /// Whether applying this patch changes the wire representation.
    pub fn touches_wire(&self) -> bool {
        self.address.is_some()
            || self.function_code.is_some()
            || self.decode_code.is_some()
            || self.mul_coe.is_some()
            || self.add_coe.is_some()
    }
}

/// Live value state.
#[derive(Debug, Clone)]
struct PointState {
    raw_value: i64,
    real_value: f64,
    hex_value: String,
    validity: Validity,
}

struct RelatedLink {
    point: Weak<Point>,
    /// Optional raw → raw translation table.
    values: Option<HashMap<i64, i64>>,
}

/// One measurement point.
pub struct Point {
    id: PointId,
    kind: PointKind,
    code: String,
    /// Back-reference for identity-carrying change events.
    self_ref: Weak<Point>,
    meta: RwLock<PointMeta>,
    state: RwLock<PointState>,
    related: RwLock<Option<RelatedLink>>,
    signal: ChangeSignal,
    updating: AtomicBool,
    send_signal: AtomicBool,
    locked_by_mapping: AtomicBool,
    simulated: AtomicBool,
}

impl Point {
    /// Start building a point of the given kind.
    pub fn builder(
        kind: PointKind,
        code: impl Into<String>,
        slave_id: u8,
        address: u32,
        function_code: u8,
    ) -> PointBuilder {
        PointBuilder {
            kind,
            code: code.into(),
            meta: PointMeta {
                name: String::new(),
                slave_id,
                address,
                function_code,
                decode_code: default_decode(kind),
                bit: None,
                scaling: Scaling::default(),
                command_type: 0,
            },
        }
    }

    // === Identity ===

    #[inline]
    pub fn id(&self) -> PointId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> PointKind {
        self.kind
    }

    #[inline]
    pub fn code(&self) -> &str {
        &self.code
    }

    // === Metadata accessors ===

    pub fn name(&self) -> String {
        self.meta.read().unwrap().name.clone()
    }

    pub fn slave_id(&self) -> u8 {
        self.meta.read().unwrap().slave_id
    }

    pub fn address(&self) -> u32 {
        self.meta.read().unwrap().address
    }

    /// Canonical hex rendering of the address.
    pub fn hex_address(&self) -> String {
        format!("0x{:04X}", self.meta.read().unwrap().address)
    }

    pub fn function_code(&self) -> u8 {
        self.meta.read().unwrap().function_code
    }

    pub fn decode_code(&self) -> u8 {
        self.meta.read().unwrap().decode_code
    }

    pub fn bit(&self) -> Option<u8> {
        self.meta.read().unwrap().bit
    }

    pub fn scaling(&self) -> Scaling {
        self.meta.read().unwrap().scaling
    }

    pub fn command_type(&self) -> u8 {
        self.meta.read().unwrap().command_type
    }

    /// Number of 16-bit registers occupied on the wire.
    pub fn register_count(&self) -> u16 {
        codec::register_count(self.decode_code())
    }

    pub(crate) fn set_slave_id(&self, slave_id: u8) {
        self.meta.write().unwrap().slave_id = slave_id;
    }

    // === Flags ===

    pub fn is_send_signal(&self) -> bool {
        self.send_signal.load(Ordering::SeqCst)
    }

    pub fn set_send_signal(&self, on: bool) {
        self.send_signal.store(on, Ordering::SeqCst);
    }

    pub fn is_locked_by_mapping(&self) -> bool {
        self.locked_by_mapping.load(Ordering::SeqCst)
    }

    pub fn set_locked_by_mapping(&self, on: bool) {
        self.locked_by_mapping.store(on, Ordering::SeqCst);
    }

    pub fn is_simulated(&self) -> bool {
        self.simulated.load(Ordering::SeqCst)
    }

    pub fn set_simulated(&self, on: bool) {
        self.simulated.store(on, Ordering::SeqCst);
    }

    // === Value state ===

    pub fn raw_value(&self) -> i64 {
        self.state.read().unwrap().raw_value
    }

    pub fn real_value(&self) -> f64 {
        self.state.read().unwrap().real_value
    }

    pub fn hex_value(&self) -> String {
        self.state.read().unwrap().hex_value.clone()
    }

    pub fn validity(&self) -> Validity {
        self.state.read().unwrap().validity
    }

    pub fn set_validity(&self, validity: Validity) {
        self.state.write().unwrap().validity = validity;
    }

    // === Related point ===

    /// Wire this point to drive a second one on every change.
    pub fn set_related_point(&self, related: &Arc<Point>, values: Option<HashMap<i64, i64>>) {
        *self.related.write().unwrap() = Some(RelatedLink {
            point: Arc::downgrade(related),
            values,
        });
        self.set_send_signal(true);
    }

    /// The reverse-linked point, if still alive.
    pub fn related_point(&self) -> Option<Arc<Point>> {
        self.related
            .read()
            .unwrap()
            .as_ref()
            .and_then(|link| link.point.upgrade())
    }

    /// Translate a raw value through the related-value table.
    ///
    /// Returns `None` when a table exists but has no entry for the key;
    /// without a table the value passes through unchanged.
    pub fn translate_related(&self, raw: i64) -> Option<i64> {
        match self.related.read().unwrap().as_ref() {
            Some(RelatedLink {
                values: Some(map), ..
            }) => map.get(&raw).copied(),
            _ => Some(raw),
        }
    }

    /// Whether a related-value translation table is configured.
    pub fn has_related_values(&self) -> bool {
        matches!(
            self.related.read().unwrap().as_ref(),
            Some(RelatedLink { values: Some(_), .. })
        )
    }

    /// Subscriber registry for change notifications.
    pub fn on_change(&self) -> &ChangeSignal {
        &self.signal
    }

    // === Mutation ===

    /// Assign the wire-level register image.
    ///
    /// Recomputes the canonical hex string and, for scaled kinds, the
    /// engineering value. Emits a change notification when the value
    /// actually changed and `is_send_signal` is set. The reentrancy guard
    /// makes a listener's write back into the same point a no-op.
    pub fn set_raw(&self, raw: i64) {
        if self.updating.swap(true, Ordering::SeqCst) {
            return;
        }

        let changed = {
            let meta = self.meta.read().unwrap();
            let mut state = self.state.write().unwrap();
            if state.raw_value == raw {
                false
            } else {
                state.raw_value = raw;
                state.hex_value = hex_of(raw, meta.decode_code);
                if self.kind.is_scaled() {
                    state.real_value = raw as f64 * meta.scaling.mul_coe + meta.scaling.add_coe;
                } else {
                    state.real_value = raw as f64;
                }
                true
            }
        };

        if changed && self.is_send_signal() {
            if let Some(point) = self.self_ref.upgrade() {
                self.signal.emit(&ChangeEvent {
                    point,
                    related: self.related_point(),
                });
            }
        }

        self.updating.store(false, Ordering::SeqCst);
    }

    /// Assign the engineering value.
    ///
    /// For Analog/Setpoint the register image `round((v - add) / mul)`
    /// must fit the codec's representable range; for Signal/Command the
    /// value must be exactly 0 or 1. On failure nothing is mutated and
    /// `false` is returned.
    pub fn set_real_value(&self, value: f64) -> bool {
        if self.kind.is_binary() {
            if value != 0.0 && value != 1.0 {
                return false;
            }
            self.set_raw(value as i64);
            return true;
        }

        let (mul_coe, add_coe, decode_code) = {
            let meta = self.meta.read().unwrap();
            (meta.scaling.mul_coe, meta.scaling.add_coe, meta.decode_code)
        };
        // A zero multiplier cannot be inverted; treated as a write failure.
        if mul_coe == 0.0 {
            return false;
        }

        let raw = ((value - add_coe) / mul_coe).round();
        let (min, max) = codec::bounds(decode_code);
        if !raw.is_finite() || raw < min || raw > max {
            return false;
        }

        self.set_raw(raw as i64);
        true
    }

    /// Apply a metadata patch and re-derive the value state.
    pub fn apply_metadata(&self, patch: &PointMetaPatch) {
        {
            let mut meta = self.meta.write().unwrap();
            if let Some(name) = &patch.name {
                meta.name = name.clone();
            }
            if let Some(address) = patch.address {
                meta.address = address;
            }
            if let Some(function_code) = patch.function_code {
                meta.function_code = function_code;
            }
            if let Some(decode_code) = patch.decode_code {
                meta.decode_code = decode_code;
            }
            if let Some(bit) = patch.bit {
                meta.bit = Some(bit);
            }
            if let Some(mul_coe) = patch.mul_coe {
                meta.scaling.mul_coe = mul_coe;
            }
            if let Some(add_coe) = patch.add_coe {
                meta.scaling.add_coe = add_coe;
            }
            if let Some(max_limit) = patch.max_limit {
                meta.scaling.max_limit = max_limit;
            }
            if let Some(min_limit) = patch.min_limit {
                meta.scaling.min_limit = min_limit;
            }
        }
        self.rederive_state();
    }

    /// Update the simulation limits.
    pub fn set_limits(&self, min_limit: f64, max_limit: f64) {
        let mut meta = self.meta.write().unwrap();
        meta.scaling.min_limit = min_limit;
        meta.scaling.max_limit = max_limit;
    }

    fn rederive_state(&self) {
        let meta = self.meta.read().unwrap();
        let mut state = self.state.write().unwrap();
        state.hex_value = hex_of(state.raw_value, meta.decode_code);
        if self.kind.is_scaled() {
            state.real_value =
                state.raw_value as f64 * meta.scaling.mul_coe + meta.scaling.add_coe;
        }
    }
}

impl std::fmt::Debug for Point {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Point")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("code", &self.code)
            .field("slave_id", &self.slave_id())
            .field("address", &self.hex_address())
            .field("raw", &self.raw_value())
            .finish()
    }
}

/// Builder for [`Point`].
pub struct PointBuilder {
    kind: PointKind,
    code: String,
    meta: PointMeta,
}

impl PointBuilder {
    /// Set the display name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.meta.name = name.into();
        self
    }

    /// Set the decode code.
    pub fn decode_code(mut self, decode_code: u8) -> Self {
        self.meta.decode_code = decode_code;
        self
    }

    /// Set the bit position inside a 16-bit register.
    pub fn bit(mut self, bit: u8) -> Self {
        self.meta.bit = Some(bit);
        self
    }

    /// Set the scaling coefficients.
    pub fn scaling(mut self, mul_coe: f64, add_coe: f64) -> Self {
        self.meta.scaling.mul_coe = mul_coe;
        self.meta.scaling.add_coe = add_coe;
        self
    }

    /// Set the simulation limits.
    pub fn limits(mut self, min_limit: f64, max_limit: f64) -> Self {
        self.meta.scaling.min_limit = min_limit;
        self.meta.scaling.max_limit = max_limit;
        self
    }

    /// Set the command kinetics type.
    pub fn command_type(mut self, command_type: u8) -> Self {
        self.meta.command_type = command_type;
        self
    }

    /// Finish and allocate the point.
    pub fn build(self) -> Arc<Point> {
        let decode_code = self.meta.decode_code;
        let real = if self.kind.is_scaled() {
            self.meta.scaling.add_coe
        } else {
            0.0
        };
        Arc::new_cyclic(|self_ref| Point {
            id: next_point_id(),
            kind: self.kind,
            code: self.code,
            self_ref: self_ref.clone(),
            meta: RwLock::new(self.meta),
            state: RwLock::new(PointState {
                raw_value: 0,
                real_value: real,
                hex_value: hex_of(0, decode_code),
                validity: Validity::Unknown,
            }),
            related: RwLock::new(None),
            signal: ChangeSignal::new(),
            updating: AtomicBool::new(false),
            send_signal: AtomicBool::new(false),
            locked_by_mapping: AtomicBool::new(false),
            simulated: AtomicBool::new(false),
        })
    }
}

fn default_decode(kind: PointKind) -> u8 {
    match kind {
        PointKind::Analog | PointKind::Setpoint => 0x41,
        PointKind::Signal | PointKind::Command => 0x20,
    }
}

/// Canonical zero-padded hex of a register image, 4 nibbles per register.
fn hex_of(raw: i64, decode_code: u8) -> String {
    let width = codec::register_count(decode_code) as usize * 4;
    let masked = match codec::register_count(decode_code) {
        1 => raw as u16 as u64,
        2 => raw as u32 as u64,
        _ => raw as u64,
    };
    format!("0x{masked:0width$X}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analog(decode_code: u8, mul_coe: f64, add_coe: f64) -> Arc<Point> {
        Point::builder(PointKind::Analog, "yc1", 1, 0x0000, 3)
            .decode_code(decode_code)
            .scaling(mul_coe, add_coe)
            .build()
    }

    #[test]
    fn test_set_raw_updates_hex_and_real() {
        let p = analog(0x21, 0.1, 5.0);
        p.set_raw(100);
        assert_eq!(p.raw_value(), 100);
        assert_eq!(p.hex_value(), "0x0064");
        assert!((p.real_value() - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_hex_width_follows_register_count() {
        let p = analog(0x41, 1.0, 0.0);
        p.set_raw(0x1234);
        assert_eq!(p.hex_value(), "0x00001234");
    }

    #[test]
    fn test_set_real_value_roundtrip() {
        let p = analog(0x21, 0.5, 0.0);
        assert!(p.set_real_value(12.0));
        assert_eq!(p.raw_value(), 24);
        assert!((p.real_value() - 12.0).abs() <= 0.25);
    }

    #[test]
    fn test_set_real_value_overflow() {
        let p = analog(0x21, 1.0, 0.0);
        assert!(p.set_real_value(32767.0));
        assert_eq!(p.raw_value(), 32767);
        // One beyond the signed 16-bit maximum must not mutate the store.
        assert!(!p.set_real_value(32768.0));
        assert_eq!(p.raw_value(), 32767);
    }

    #[test]
    fn test_set_real_value_zero_multiplier() {
        let p = analog(0x21, 0.0, 0.0);
        assert!(!p.set_real_value(10.0));
    }

    #[test]
    fn test_binary_accepts_only_zero_or_one() {
        let p = Point::builder(PointKind::Signal, "yx1", 1, 0x0001, 1).build();
        assert!(p.set_real_value(1.0));
        assert_eq!(p.raw_value(), 1);
        assert!(!p.set_real_value(2.0));
        assert_eq!(p.raw_value(), 1);
    }

    #[test]
    fn test_signal_emitted_once_per_change() {
        use std::sync::atomic::AtomicUsize;

        let p = Point::builder(PointKind::Signal, "yx2", 1, 0x0002, 1).build();
        p.set_send_signal(true);
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = hits.clone();
            p.on_change().connect(
                crate::core::signal::SubscriberId(1),
                Arc::new(move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        p.set_raw(1);
        p.set_raw(1); // unchanged, no re-fire
        p.set_raw(0);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reentrancy_guard() {
        let p = Point::builder(PointKind::Signal, "yx3", 1, 0x0003, 1).build();
        p.set_send_signal(true);
        {
            let inner = p.clone();
            p.on_change().connect(
                crate::core::signal::SubscriberId(1),
                Arc::new(move |_| {
                    // A cascading write into the emitting point must be ignored.
                    inner.set_raw(0);
                }),
            );
        }
        p.set_raw(1);
        assert_eq!(p.raw_value(), 1);
    }

    #[test]
    fn test_related_translation() {
        let a = Point::builder(PointKind::Signal, "a", 1, 0x0001, 1).build();
        let b = Point::builder(PointKind::Signal, "b", 1, 0x0002, 1).build();
        a.set_related_point(&b, Some(HashMap::from([(1, 2), (0, 0)])));
        assert_eq!(a.translate_related(1), Some(2));
        assert_eq!(a.translate_related(0), Some(0));
        assert_eq!(a.translate_related(5), None);
    }

    #[test]
    fn test_metadata_patch_rederives() {
        let p = analog(0x21, 1.0, 0.0);
        p.set_raw(1000);
        p.apply_metadata(&PointMetaPatch {
            mul_coe: Some(0.1),
            ..Default::default()
        });
        assert!((p.real_value() - 100.0).abs() < 1e-9);
        assert_eq!(p.raw_value(), 1000);
    }
}
