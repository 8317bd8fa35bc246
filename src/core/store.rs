//! In-memory point indexes for one device.
//!
//! Three views are kept coherent under one lock: by slave id (split per
//! variant, in address-file order), by globally unique code, and the
//! sorted slave set.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use crate::core::error::{Result, SimError};
use crate::core::point::{Point, PointKind};

/// Points of one slave, split by variant.
#[derive(Default)]
pub struct SlavePoints {
    pub analogs: Vec<Arc<Point>>,
    pub signals: Vec<Arc<Point>>,
    pub commands: Vec<Arc<Point>>,
    pub setpoints: Vec<Arc<Point>>,
}

impl SlavePoints {
    /// All points of the slave in variant order.
    pub fn all(&self) -> Vec<Arc<Point>> {
        self.analogs
            .iter()
            .chain(self.signals.iter())
            .chain(self.commands.iter())
            .chain(self.setpoints.iter())
            .cloned()
            .collect()
    }

    fn list_mut(&mut self, kind: PointKind) -> &mut Vec<Arc<Point>> {
        match kind {
            PointKind::Analog => &mut self.analogs,
            PointKind::Signal => &mut self.signals,
            PointKind::Command => &mut self.commands,
            PointKind::Setpoint => &mut self.setpoints,
        }
    }

    fn is_empty(&self) -> bool {
        self.analogs.is_empty()
            && self.signals.is_empty()
            && self.commands.is_empty()
            && self.setpoints.is_empty()
    }
}

#[derive(Default)]
struct StoreInner {
    by_slave: BTreeMap<u8, SlavePoints>,
    by_code: HashMap<String, Arc<Point>>,
}

/// The point store of one device runtime.
///
/// Shared by the poll loop, the simulator, the formula engine and the
/// operator API; mutations take the exclusive lock, reads the shared one.
#[derive(Default)]
pub struct PointStore {
    inner: RwLock<StoreInner>,
}

impl PointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a point. Codes are unique across all variants.
    pub fn add_point(&self, point: Arc<Point>) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.by_code.contains_key(point.code()) {
            return Err(SimError::config(format!(
                "duplicate point code: {}",
                point.code()
            )));
        }
        inner.by_code.insert(point.code().to_string(), point.clone());
        inner
            .by_slave
            .entry(point.slave_id())
            .or_default()
            .list_mut(point.kind())
            .push(point);
        Ok(())
    }

    /// Remove a point by code.
    pub fn remove_point(&self, code: &str) -> Option<Arc<Point>> {
        let mut inner = self.inner.write().unwrap();
        let point = inner.by_code.remove(code)?;
        let slave_id = point.slave_id();
        let mut drained = false;
        if let Some(slave) = inner.by_slave.get_mut(&slave_id) {
            slave
                .list_mut(point.kind())
                .retain(|p| p.code() != point.code());
            drained = slave.is_empty();
        }
        if drained {
            inner.by_slave.remove(&slave_id);
        }
        Some(point)
    }

    /// Look up a point by code.
    pub fn get(&self, code: &str) -> Option<Arc<Point>> {
        self.inner.read().unwrap().by_code.get(code).cloned()
    }

    /// First existing point out of a candidate code list.
    pub fn get_first(&self, codes: &[&str]) -> Option<Arc<Point>> {
        let inner = self.inner.read().unwrap();
        codes.iter().find_map(|c| inner.by_code.get(*c).cloned())
    }

    /// Sorted slave ids.
    pub fn slave_ids(&self) -> Vec<u8> {
        self.inner.read().unwrap().by_slave.keys().copied().collect()
    }

    /// Whether a slave has any points.
    pub fn has_slave(&self, slave_id: u8) -> bool {
        self.inner.read().unwrap().by_slave.contains_key(&slave_id)
    }

    /// Register an empty slave bucket.
    pub fn add_slave(&self, slave_id: u8) -> bool {
        let mut inner = self.inner.write().unwrap();
        match inner.by_slave.entry(slave_id) {
            std::collections::btree_map::Entry::Vacant(e) => {
                e.insert(SlavePoints::default());
                true
            }
            std::collections::btree_map::Entry::Occupied(_) => false,
        }
    }

    /// Drop a slave and all its points. Returns the removed points.
    pub fn remove_slave(&self, slave_id: u8) -> Vec<Arc<Point>> {
        let mut inner = self.inner.write().unwrap();
        let Some(slave) = inner.by_slave.remove(&slave_id) else {
            return Vec::new();
        };
        let points = slave.all();
        for p in &points {
            inner.by_code.remove(p.code());
        }
        points
    }

    /// Rehome every point of `old` under `new`.
    ///
    /// Fails when the target slave id is already occupied.
    pub fn change_slave_id(&self, old: u8, new: u8) -> bool {
        if old == new {
            return true;
        }
        let mut inner = self.inner.write().unwrap();
        if inner.by_slave.contains_key(&new) {
            return false;
        }
        let Some(slave) = inner.by_slave.remove(&old) else {
            return false;
        };
        for p in slave.all() {
            p.set_slave_id(new);
        }
        inner.by_slave.insert(new, slave);
        true
    }

    /// Points of one slave, all variants.
    pub fn points_of_slave(&self, slave_id: u8) -> Vec<Arc<Point>> {
        self.inner
            .read()
            .unwrap()
            .by_slave
            .get(&slave_id)
            .map(|s| s.all())
            .unwrap_or_default()
    }

    /// Every point of the device, slave order then variant order.
    pub fn all_points(&self) -> Vec<Arc<Point>> {
        self.inner
            .read()
            .unwrap()
            .by_slave
            .values()
            .flat_map(|s| s.all())
            .collect()
    }

    /// Reset every register image to zero.
    pub fn reset_all_values(&self) {
        for point in self.all_points() {
            point.set_raw(0);
        }
    }

    /// Number of points in the store.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().by_code.len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(kind: PointKind, code: &str, slave_id: u8, address: u32) -> Arc<Point> {
        Point::builder(kind, code, slave_id, address, 3).build()
    }

    #[test]
    fn test_add_and_lookup() {
        let store = PointStore::new();
        store.add_point(point(PointKind::Analog, "a", 1, 0)).unwrap();
        store.add_point(point(PointKind::Signal, "b", 1, 1)).unwrap();
        store.add_point(point(PointKind::Analog, "c", 2, 0)).unwrap();

        assert_eq!(store.len(), 3);
        assert_eq!(store.slave_ids(), vec![1, 2]);
        assert_eq!(store.points_of_slave(1).len(), 2);
        assert!(store.get("b").is_some());
    }

    #[test]
    fn test_duplicate_code_rejected() {
        let store = PointStore::new();
        store.add_point(point(PointKind::Analog, "a", 1, 0)).unwrap();
        let err = store.add_point(point(PointKind::Signal, "a", 2, 1));
        assert!(err.is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_remove_point_drains_slave() {
        let store = PointStore::new();
        store.add_point(point(PointKind::Analog, "a", 5, 0)).unwrap();
        assert!(store.remove_point("a").is_some());
        assert!(store.get("a").is_none());
        assert!(store.slave_ids().is_empty());
    }

    #[test]
    fn test_change_slave_id() {
        let store = PointStore::new();
        store.add_point(point(PointKind::Analog, "a", 1, 0)).unwrap();
        assert!(store.change_slave_id(1, 9));
        assert_eq!(store.slave_ids(), vec![9]);
        assert_eq!(store.get("a").unwrap().slave_id(), 9);
        // Occupied target is refused.
        store.add_point(point(PointKind::Analog, "b", 2, 0)).unwrap();
        assert!(!store.change_slave_id(9, 2));
    }

    #[test]
    fn test_reset_all_values() {
        let store = PointStore::new();
        let p = point(PointKind::Analog, "a", 1, 0);
        store.add_point(p.clone()).unwrap();
        p.set_raw(42);
        store.reset_all_values();
        assert_eq!(p.raw_value(), 0);
    }
}
