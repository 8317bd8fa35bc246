//! The per-device runtime: one protocol endpoint, its point bank, the
//! poll loop, the simulation engine and the formula engine, composed
//! behind a single lifecycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

use crate::capture::MessageRecord;
use crate::config::{ConnectionConfig, POLL_MAX_COUNT, POLL_MAX_GAP};
use crate::core::error::{Result, SimError};
use crate::core::point::{Point, PointMetaPatch};
use crate::core::signal::next_subscriber_id;
use crate::core::store::PointStore;
use crate::core::validity::Validity;
use crate::device::poller::{self, ReadOutcome};
use crate::device::simulator::{SimulateMethod, Simulator};
use crate::device::table::{self, TableQuery, TableRow};
use crate::formula::engine::FormulaEngine;
use crate::protocols::{self, ProtocolAdapter, ProtocolKind};
use crate::repository::{ConfigRepository, PointRow};

/// Device classification tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Pcs,
    Bms,
    ElectricityMeter,
    GridMeter,
    CircuitBreaker,
    #[default]
    Other,
}

type WriteBackSlot = Arc<StdMutex<Option<mpsc::UnboundedSender<(String, i64)>>>>;

/// One simulated device.
pub struct DeviceRuntime {
    id: i64,
    self_ref: Weak<DeviceRuntime>,
    name: String,
    device_type: DeviceType,
    protocol: ProtocolKind,
    conn: ConnectionConfig,
    store: Arc<PointStore>,
    adapter: RwLock<Arc<dyn ProtocolAdapter>>,
    simulator: Simulator,
    formula: StdRwLock<Option<Arc<FormulaEngine>>>,
    repository: StdRwLock<Option<Arc<dyn ConfigRepository>>>,
    poll_interval_ms: u64,
    running: AtomicBool,
    auto_read: AtomicBool,
    simulating: AtomicBool,
    stop_tx: StdMutex<Option<watch::Sender<bool>>>,
    write_back: WriteBackSlot,
}

impl DeviceRuntime {
    /// Construct the runtime and its protocol adapter.
    pub fn new(
        id: i64,
        name: impl Into<String>,
        device_type: DeviceType,
        protocol: ProtocolKind,
        conn: ConnectionConfig,
    ) -> Result<Arc<Self>> {
        let adapter = protocols::build_adapter(protocol, &conn)?;
        let name = name.into();
        Ok(Arc::new_cyclic(|self_ref| Self {
            id,
            self_ref: self_ref.clone(),
            name,
            device_type,
            protocol,
            conn,
            store: Arc::new(PointStore::new()),
            adapter: RwLock::new(adapter),
            simulator: Simulator::new(),
            formula: StdRwLock::new(None),
            repository: StdRwLock::new(None),
            poll_interval_ms: 1000,
            running: AtomicBool::new(false),
            auto_read: AtomicBool::new(false),
            simulating: AtomicBool::new(false),
            stop_tx: StdMutex::new(None),
            write_back: Arc::new(StdMutex::new(None)),
        }))
    }

    // === Identity ===

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn protocol(&self) -> ProtocolKind {
        self.protocol
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The point store (shared with the formula engine and controller).
    pub fn store(&self) -> Arc<PointStore> {
        self.store.clone()
    }

    /// The simulation engine.
    pub fn simulator(&self) -> &Simulator {
        &self.simulator
    }

    /// Attach the external repository used for metadata persistence.
    pub fn set_repository(&self, repository: Arc<dyn ConfigRepository>) {
        *self.repository.write().unwrap() = Some(repository);
    }

    /// Attach the formula engine built by the controller.
    pub fn install_formula_engine(&self, engine: Arc<FormulaEngine>) {
        *self.formula.write().unwrap() = Some(engine);
    }

    pub fn formula_engine(&self) -> Option<Arc<FormulaEngine>> {
        self.formula.read().unwrap().clone()
    }

    async fn adapter(&self) -> Arc<dyn ProtocolAdapter> {
        self.adapter.read().await.clone()
    }

    // === Lifecycle ===

    /// Start the adapter, the poll loop and the simulation loop.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        let this = self
            .self_ref
            .upgrade()
            .ok_or_else(|| SimError::state("runtime dropped"))?;
        self.adapter().await.start().await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        *self.stop_tx.lock().unwrap() = Some(stop_tx);

        let (wb_tx, wb_rx) = mpsc::unbounded_channel();
        *self.write_back.lock().unwrap() = Some(wb_tx);

        self.running.store(true, Ordering::SeqCst);
        Self::spawn_poll_loop(this.clone(), stop_rx.clone());
        Self::spawn_simulation_loop(this.clone(), stop_rx.clone());
        Self::spawn_write_back(this, wb_rx, stop_rx);

        info!(device = %self.name, protocol = %self.protocol, "device started");
        Ok(())
    }

    /// Stop every loop and the adapter.
    ///
    /// Loops observe the signal within one tick; in-flight protocol
    /// calls complete or fail on their own.
    pub async fn stop(&self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.lock().unwrap().take() {
            let _ = stop_tx.send(true);
        }
        *self.write_back.lock().unwrap() = None;
        self.running.store(false, Ordering::SeqCst);
        if let Some(engine) = self.formula_engine() {
            engine.shutdown();
        }
        self.adapter().await.stop().await?;
        info!(device = %self.name, "device stopped");
        Ok(())
    }

    fn spawn_poll_loop(runtime: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        tokio::spawn(async move {
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                if runtime.auto_read.load(Ordering::SeqCst) {
                    let _ = runtime.read_all_slaves(0, Some(&stop_rx)).await;
                }
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(std::time::Duration::from_millis(
                        runtime.poll_interval_ms,
                    )) => {}
                }
            }
            debug!(device = %runtime.name, "poll loop exited");
        });
    }

    fn spawn_simulation_loop(runtime: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(crate::device::simulator::tick_period()) => {}
                }
                if *stop_rx.borrow() {
                    break;
                }
                if !runtime.simulating.load(Ordering::SeqCst) {
                    continue;
                }
                for (code, value) in runtime.simulator.tick() {
                    if let Err(e) = runtime.edit_point_value(&code, value).await {
                        debug!(device = %runtime.name, code, error = %e, "simulated write failed");
                    }
                }
            }
            debug!(device = %runtime.name, "simulation loop exited");
        });
    }

    fn spawn_write_back(
        runtime: Arc<Self>,
        mut wb_rx: mpsc::UnboundedReceiver<(String, i64)>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    item = wb_rx.recv() => {
                        let Some((code, raw)) = item else { break };
                        let Some(point) = runtime.store.get(&code) else { continue };
                        let adapter = runtime.adapter().await;
                        match adapter.write_value(&point, raw).await {
                            Ok(true) => point.set_validity(Validity::Fresh),
                            Ok(false) => {}
                            Err(e) => {
                                debug!(device = %runtime.name, code, error = %e, "write-back failed");
                                point.set_validity(Validity::Stale);
                            }
                        }
                    }
                }
            }
        });
    }

    // === Point import ===

    /// Materialize the channel's point rows into the store and register
    /// them with the adapter and the simulator.
    pub async fn import_points_from_channel(&self, channel_id: i64) -> Result<usize> {
        let repository = self
            .repository
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| SimError::config("no repository attached"))?;
        let rows = repository.points(channel_id).await?;
        let mut imported = 0;
        for row in &rows {
            let point = row.materialize(self.protocol)?;
            match self.store.add_point(point.clone()) {
                Ok(()) => {
                    self.simulator.add_point(point, SimulateMethod::Random, 1);
                    self.simulator.set_enabled(&row.code, true);
                    imported += 1;
                }
                Err(e) => warn!(device = %self.name, code = %row.code, error = %e, "point skipped"),
            }
        }
        self.adapter().await.add_points(&self.store.all_points());
        info!(device = %self.name, imported, "points imported");
        Ok(imported)
    }

    // === Value operations ===

    /// Set a point's engineering value and push it through the adapter.
    pub async fn edit_point_value(&self, code: &str, real_value: f64) -> Result<bool> {
        if !self.is_running() {
            return Err(SimError::state(format!("device {} stopped", self.name)));
        }
        let point = self
            .store
            .get(code)
            .ok_or_else(|| SimError::PointNotFound(code.to_string()))?;

        if !point.set_real_value(real_value) {
            return Ok(false);
        }

        let adapter = self.adapter().await;
        match adapter.write_value(&point, point.raw_value()).await {
            Ok(true) => {
                point.set_validity(Validity::Fresh);
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) => {
                point.set_validity(Validity::Stale);
                if e.is_transient() {
                    Ok(false)
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Read a single point's current value from the adapter.
    pub async fn read_point_value(&self, code: &str) -> Result<Option<f64>> {
        let point = self
            .store
            .get(code)
            .ok_or_else(|| SimError::PointNotFound(code.to_string()))?;
        let adapter = self.adapter().await;
        match adapter.read_value(&point).await {
            Ok(Some(raw)) => {
                point.set_raw(raw);
                point.set_validity(Validity::Fresh);
                Ok(Some(if point.kind().is_scaled() {
                    point.real_value()
                } else {
                    point.raw_value() as f64
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                point.set_validity(Validity::Stale);
                debug!(device = %self.name, code, error = %e, "single read failed");
                Ok(None)
            }
        }
    }

    /// One synchronous poll cycle across all slaves.
    pub async fn single_read(&self, interval_ms: u64) -> Result<ReadOutcome> {
        if !self.is_running() {
            return Err(SimError::state(format!("device {} stopped", self.name)));
        }
        self.read_all_slaves(interval_ms, None).await
    }

    async fn read_all_slaves(
        &self,
        interval_ms: u64,
        stop: Option<&watch::Receiver<bool>>,
    ) -> Result<ReadOutcome> {
        let adapter = self.adapter().await;
        let mut outcome = ReadOutcome::default();
        for slave_id in self.store.slave_ids() {
            let points = self.store.points_of_slave(slave_id);
            let cycle = poller::poll_cycle(
                adapter.as_ref(),
                &points,
                interval_ms,
                POLL_MAX_GAP,
                POLL_MAX_COUNT,
                stop,
            )
            .await;
            outcome.success += cycle.success;
            outcome.fail += cycle.fail;
        }
        Ok(outcome)
    }

    /// Enable or disable the background poll loop.
    pub fn set_auto_read(&self, enabled: bool) {
        self.auto_read.store(enabled, Ordering::SeqCst);
    }

    pub fn is_auto_read(&self) -> bool {
        self.auto_read.load(Ordering::SeqCst)
    }

    /// Enable or disable the simulation loop.
    pub fn set_simulating(&self, enabled: bool) {
        self.simulating.store(enabled, Ordering::SeqCst);
    }

    pub fn is_simulating(&self) -> bool {
        self.simulating.load(Ordering::SeqCst)
    }

    /// Reset every point to zero, wire included.
    pub async fn reset_point_values(&self) {
        for point in self.store.all_points() {
            point.set_raw(0);
            if self.is_running() {
                let adapter = self.adapter().await;
                let _ = adapter.write_value(&point, 0).await;
            }
        }
    }

    // === Metadata operations ===

    /// Patch a point's metadata, persist it, and keep the wire image
    /// consistent when layout-affecting fields changed.
    pub async fn edit_point_metadata(&self, code: &str, patch: PointMetaPatch) -> Result<()> {
        let point = self
            .store
            .get(code)
            .ok_or_else(|| SimError::PointNotFound(code.to_string()))?;
        let rewrite = patch.touches_wire();
        point.apply_metadata(&patch);

        if let Some(repository) = self.repository.read().unwrap().clone() {
            if let Err(e) = repository.update_point(code, &patch).await {
                warn!(device = %self.name, code, error = %e, "metadata persistence failed");
            }
        }

        if rewrite && self.is_running() {
            if self.needs_reinit_on_mutation() {
                self.reinit_adapter().await?;
            } else {
                let adapter = self.adapter().await;
                adapter.add_points(&[point.clone()]);
                let _ = adapter.write_value(&point, point.raw_value()).await;
            }
        }
        Ok(())
    }

    /// Update a point's simulation limits.
    pub async fn edit_point_limits(&self, code: &str, min_limit: f64, max_limit: f64) -> Result<()> {
        let point = self
            .store
            .get(code)
            .ok_or_else(|| SimError::PointNotFound(code.to_string()))?;
        point.set_limits(min_limit, max_limit);
        if let Some(repository) = self.repository.read().unwrap().clone() {
            let patch = PointMetaPatch {
                min_limit: Some(min_limit),
                max_limit: Some(max_limit),
                ..Default::default()
            };
            if let Err(e) = repository.update_point(code, &patch).await {
                warn!(device = %self.name, code, error = %e, "limit persistence failed");
            }
        }
        Ok(())
    }

    // === Dynamic point/slave management ===

    /// The IEC-104 stack cannot hot-add information objects, so every
    /// point or slave mutation rebuilds its adapter. Modbus extends the
    /// banks in place.
    fn needs_reinit_on_mutation(&self) -> bool {
        matches!(
            self.protocol,
            ProtocolKind::Iec104Server | ProtocolKind::Iec104Client
        )
    }

    async fn reinit_adapter(&self) -> Result<()> {
        let was_running = self.is_running();
        let fresh = protocols::build_adapter(self.protocol, &self.conn)?;
        fresh.add_points(&self.store.all_points());

        let mut slot = self.adapter.write().await;
        let old = slot.clone();
        if was_running {
            let _ = old.stop().await;
            fresh.start().await?;
        }
        *slot = fresh;
        info!(device = %self.name, "adapter reinitialized");
        Ok(())
    }

    /// Add one point at runtime.
    pub async fn add_point_dynamic(&self, point: Arc<Point>) -> Result<()> {
        self.store.add_point(point.clone())?;
        self.simulator
            .add_point(point.clone(), SimulateMethod::Random, 1);
        if self.needs_reinit_on_mutation() {
            self.reinit_adapter().await?;
        } else {
            self.adapter().await.add_points(&[point]);
        }
        Ok(())
    }

    /// Remove one point at runtime.
    pub async fn remove_point_dynamic(&self, code: &str) -> Result<()> {
        let point = self
            .store
            .remove_point(code)
            .ok_or_else(|| SimError::PointNotFound(code.to_string()))?;
        self.simulator.remove_point(point.id());
        if self.needs_reinit_on_mutation() {
            self.reinit_adapter().await?;
        }
        Ok(())
    }

    /// Register an empty slave.
    pub async fn add_slave_dynamic(&self, slave_id: u8) -> Result<bool> {
        let added = self.store.add_slave(slave_id);
        if added && self.needs_reinit_on_mutation() {
            self.reinit_adapter().await?;
        }
        Ok(added)
    }

    /// Drop a slave and all of its points.
    pub async fn remove_slave_dynamic(&self, slave_id: u8) -> Result<usize> {
        let removed = self.store.remove_slave(slave_id);
        for point in &removed {
            self.simulator.remove_point(point.id());
        }
        if !removed.is_empty() && self.needs_reinit_on_mutation() {
            self.reinit_adapter().await?;
        }
        Ok(removed.len())
    }

    /// Rehome a slave id.
    pub async fn change_slave_id(&self, old: u8, new: u8) -> Result<bool> {
        let changed = self.store.change_slave_id(old, new);
        if changed {
            if self.needs_reinit_on_mutation() {
                self.reinit_adapter().await?;
            } else {
                self.adapter().await.add_points(&self.store.all_points());
            }
        }
        Ok(changed)
    }

    // === Related points ===

    /// Wire point `code` so that changes propagate to `related_code`,
    /// optionally through a raw → raw translation table.
    pub fn set_related_point(
        &self,
        code: &str,
        related_code: &str,
        values: Option<HashMap<i64, i64>>,
    ) -> Result<()> {
        let point = self
            .store
            .get(code)
            .ok_or_else(|| SimError::PointNotFound(code.to_string()))?;
        let related = self
            .store
            .get(related_code)
            .ok_or_else(|| SimError::PointNotFound(related_code.to_string()))?;

        point.set_related_point(&related, values);

        let write_back = self.write_back.clone();
        let device_name = self.name.clone();
        point.on_change().connect(
            next_subscriber_id(),
            Arc::new(move |event| {
                let Some(related) = event.related.clone() else {
                    return;
                };
                let source = &event.point;

                if source.has_related_values() {
                    match source.translate_related(source.raw_value()) {
                        Some(mapped) => related.set_raw(mapped),
                        None => {
                            warn!(
                                device = %device_name,
                                code = source.code(),
                                raw = source.raw_value(),
                                "no related value for key"
                            );
                            return;
                        }
                    }
                } else {
                    let value = if source.kind().is_scaled() {
                        source.real_value()
                    } else {
                        source.raw_value() as f64
                    };
                    if !related.set_real_value(value) {
                        return;
                    }
                }

                // The wire write happens off the notification path.
                if let Some(tx) = write_back.lock().unwrap().as_ref() {
                    let _ = tx.send((related.code().to_string(), related.raw_value()));
                }
            }),
        );
        Ok(())
    }

    // === Operator projections ===

    /// Operator table for one slave.
    pub async fn get_table_data(
        &self,
        slave_id: u8,
        mut query: TableQuery,
    ) -> (Vec<TableRow>, usize) {
        let points = self.store.points_of_slave(slave_id);
        let adapter = self.adapter().await;

        if self.protocol.is_server() {
            // Local datastore refresh is cheap; mirror it into the model.
            for point in &points {
                if let Ok(Some(raw)) = adapter.read_value(point).await {
                    point.set_raw(raw);
                }
            }
        } else if self.protocol == ProtocolKind::Iec104Client {
            // Asynchronously received values surface here, not in the
            // socket callback.
            let _ = adapter.sync_mirror(&points).await;
        }

        // Client devices blank stale rows instead of showing stale numbers.
        query.mask_errors = self.protocol.is_client();
        table::project(&points, &query)
    }

    /// Captured frames, newest last.
    pub async fn get_messages(&self, limit: usize) -> Vec<MessageRecord> {
        self.adapter().await.capture().snapshot(limit)
    }

    /// Drop captured frames and statistics.
    pub async fn clear_messages(&self) {
        self.adapter().await.capture().clear();
    }

    /// Average TX→RX latency in milliseconds.
    pub async fn avg_latency(&self) -> f64 {
        self.adapter().await.capture().stats().avg_latency_ms
    }
}

impl std::fmt::Debug for DeviceRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRuntime")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("protocol", &self.protocol)
            .field("points", &self.store.len())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Materialization of a repository row into a live point.
impl PointRow {
    /// Build the point, applying the protocol's address strategy.
    pub fn materialize(&self, protocol: ProtocolKind) -> Result<Arc<Point>> {
        let kind = crate::core::point::PointKind::from_frame_type(self.frame_type)
            .ok_or_else(|| SimError::config(format!("bad frame type: {}", self.frame_type)))?;
        let base_address = parse_address(&self.reg_addr)?;
        let address = protocols::wire_address(protocol, kind, base_address);
        let decode_code = parse_decode(&self.decode_code)?;

        let mut builder = Point::builder(kind, &self.code, self.rtu_addr, address, self.func_code)
            .name(&self.name)
            .decode_code(decode_code)
            .scaling(self.mul_coe, self.add_coe)
            .limits(self.min_limit, self.max_limit);
        if let Some(bit) = self.bit {
            builder = builder.bit(bit);
        }
        Ok(builder.build())
    }
}

/// Parse a register address written as hex (`0x0010`) or decimal.
pub fn parse_address(text: &str) -> Result<u32> {
    let text = text.trim();
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        text.parse()
    };
    parsed.map_err(|_| SimError::InvalidAddress(text.to_string()))
}

/// Parse a decode code written as hex (`0x41`) or decimal.
pub fn parse_decode(text: &str) -> Result<u8> {
    let text = text.trim();
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u8::from_str_radix(hex, 16)
    } else {
        text.parse()
    };
    parsed.map_err(|_| SimError::config(format!("bad decode code: {text}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::point::PointKind;
    use tokio::net::TcpListener;

    async fn modbus_runtime() -> Arc<DeviceRuntime> {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        DeviceRuntime::new(
            1,
            "pcs-1",
            DeviceType::Pcs,
            ProtocolKind::ModbusTcpServer,
            ConnectionConfig {
                ip: "127.0.0.1".into(),
                port,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn analog(code: &str, address: u32) -> Arc<Point> {
        Point::builder(PointKind::Analog, code, 1, address, 3)
            .decode_code(0x21)
            .scaling(1.0, 0.0)
            .limits(0.0, 1000.0)
            .build()
    }

    #[tokio::test]
    async fn test_lifecycle_preserves_store() {
        let runtime = modbus_runtime().await;
        runtime.add_point_dynamic(analog("a", 0)).await.unwrap();
        runtime.add_point_dynamic(analog("b", 1)).await.unwrap();

        runtime.start().await.unwrap();
        runtime.edit_point_value("a", 42.0).await.unwrap();
        runtime.stop().await.unwrap();
        runtime.start().await.unwrap();

        assert_eq!(runtime.store().len(), 2);
        assert_eq!(runtime.store().get("a").unwrap().real_value(), 42.0);
        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_edit_point_value_roundtrip() {
        let runtime = modbus_runtime().await;
        runtime.add_point_dynamic(analog("a", 0)).await.unwrap();
        runtime.start().await.unwrap();

        assert!(runtime.edit_point_value("a", 123.0).await.unwrap());
        assert_eq!(runtime.read_point_value("a").await.unwrap(), Some(123.0));

        // Out-of-range stays untouched.
        assert!(!runtime.edit_point_value("a", 40000.0).await.unwrap());
        assert_eq!(runtime.read_point_value("a").await.unwrap(), Some(123.0));

        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_edit_rejected_when_stopped() {
        let runtime = modbus_runtime().await;
        runtime.add_point_dynamic(analog("a", 0)).await.unwrap();
        let err = runtime.edit_point_value("a", 1.0).await.unwrap_err();
        assert!(matches!(err, SimError::State(_)));
    }

    #[tokio::test]
    async fn test_single_read_counts() {
        let runtime = modbus_runtime().await;
        runtime.add_point_dynamic(analog("a", 0)).await.unwrap();
        runtime.add_point_dynamic(analog("b", 1)).await.unwrap();
        runtime.start().await.unwrap();

        let outcome = runtime.single_read(0).await.unwrap();
        assert_eq!(outcome, ReadOutcome { success: 2, fail: 0 });

        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_related_point_fires_once() {
        let runtime = modbus_runtime().await;
        let a = Point::builder(PointKind::Signal, "A", 1, 10, 1).build();
        let b = Point::builder(PointKind::Signal, "B", 1, 11, 3)
            .decode_code(0x20)
            .build();
        runtime.add_point_dynamic(a.clone()).await.unwrap();
        runtime.add_point_dynamic(b.clone()).await.unwrap();
        runtime
            .set_related_point("A", "B", Some(HashMap::from([(1, 2), (0, 0)])))
            .unwrap();
        runtime.start().await.unwrap();

        a.set_raw(1);
        assert_eq!(b.raw_value(), 2);

        // Same value again must not re-fire the propagation.
        b.set_raw(7);
        a.set_raw(1);
        assert_eq!(b.raw_value(), 7);

        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_decode_code_edit_roundtrip() {
        let runtime = modbus_runtime().await;
        runtime.add_point_dynamic(analog("a", 0)).await.unwrap();
        runtime.start().await.unwrap();
        runtime.edit_point_value("a", 77.0).await.unwrap();
        let before = runtime.store().get("a").unwrap().hex_value();

        runtime
            .edit_point_metadata(
                "a",
                PointMetaPatch {
                    decode_code: Some(0x41),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        runtime
            .edit_point_metadata(
                "a",
                PointMetaPatch {
                    decode_code: Some(0x21),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(runtime.store().get("a").unwrap().hex_value(), before);
        assert_eq!(runtime.read_point_value("a").await.unwrap(), Some(77.0));
        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_table_projection_masks_nothing_on_server() {
        let runtime = modbus_runtime().await;
        runtime.add_point_dynamic(analog("a", 0)).await.unwrap();
        runtime.start().await.unwrap();
        runtime.edit_point_value("a", 5.0).await.unwrap();

        let (rows, total) = runtime.get_table_data(1, TableQuery::default()).await;
        assert_eq!(total, 1);
        assert_eq!(rows[0].value, "5");

        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_client_batch_read_is_one_request() {
        use crate::protocols::modbus::ModbusServerAdapter;

        // A served bank with three 32-bit analogs at 0x0000/0x0002/0x0004.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);
        let server = ModbusServerAdapter::tcp(addr.to_string());
        let served: Vec<Arc<Point>> = (0..3)
            .map(|i| {
                Point::builder(PointKind::Analog, &format!("s{i}"), 1, i * 2, 3)
                    .decode_code(0x41)
                    .scaling(1.0, 0.0)
                    .build()
            })
            .collect();
        server.add_points(&served);
        for (i, p) in served.iter().enumerate() {
            server.write_value(p, (i as i64 + 1) * 100).await.unwrap();
        }
        server.start().await.unwrap();

        // The client device polls the same layout.
        let runtime = DeviceRuntime::new(
            2,
            "poller",
            DeviceType::Other,
            ProtocolKind::ModbusTcpClient,
            ConnectionConfig {
                ip: addr.ip().to_string(),
                port: addr.port(),
                ..Default::default()
            },
        )
        .unwrap();
        for i in 0..3u32 {
            runtime
                .add_point_dynamic(
                    Point::builder(PointKind::Analog, &format!("c{i}"), 1, i * 2, 3)
                        .decode_code(0x41)
                        .scaling(1.0, 0.0)
                        .build(),
                )
                .await
                .unwrap();
        }
        runtime.start().await.unwrap();

        let outcome = runtime.single_read(10).await.unwrap();
        assert_eq!(outcome, ReadOutcome { success: 3, fail: 0 });
        assert_eq!(runtime.store().get("c0").unwrap().raw_value(), 100);
        assert_eq!(runtime.store().get("c1").unwrap().raw_value(), 200);
        assert_eq!(runtime.store().get("c2").unwrap().raw_value(), 300);

        // Exactly one framed request crossed the wire.
        let frames = runtime.get_messages(0).await;
        assert_eq!(frames.len(), 2);
        assert!(runtime.avg_latency().await >= 0.0);

        runtime.stop().await.unwrap();
        server.stop().await.unwrap();
    }

    #[test]
    fn test_address_parsing() {
        assert_eq!(parse_address("0x0010").unwrap(), 16);
        assert_eq!(parse_address("16").unwrap(), 16);
        assert!(parse_address("bogus").is_err());
        assert_eq!(parse_decode("0x41").unwrap(), 0x41);
        assert_eq!(parse_decode("65").unwrap(), 65);
    }
}
