//! The process-wide device registry.
//!
//! Builds one runtime per configured channel, starts and stops them,
//! resolves cross-device points for the formula engines, and runs the
//! PCS-to-meter power aggregation loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock, Weak};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{ConnectionConfig, SerialParams};
use crate::core::error::Result;
use crate::core::point::Point;
use crate::device::runtime::{DeviceRuntime, DeviceType};
use crate::formula::engine::{DeviceResolver, FormulaEngine};
use crate::repository::{ChannelRow, ConfigRepository};

/// Point code the PCS sync loop reads on every PCS device.
const PCS_POWER_CODE: &str = "totalAcP";
/// Point code the aggregated power is written into on the meter.
const METER_POWER_CODE: &str = "power";

/// Process-wide registry of device runtimes.
pub struct DeviceController {
    self_ref: Weak<DeviceController>,
    repository: Arc<dyn ConfigRepository>,
    devices: RwLock<HashMap<String, Arc<DeviceRuntime>>>,
    /// The designated energy meter for the PCS power aggregation.
    energy_meter: RwLock<Option<String>>,
    sync_stop: StdMutex<Option<watch::Sender<bool>>>,
}

impl DeviceController {
    pub fn new(repository: Arc<dyn ConfigRepository>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            repository,
            devices: RwLock::new(HashMap::new()),
            energy_meter: RwLock::new(None),
            sync_stop: StdMutex::new(None),
        })
    }

    // === Registry access ===

    pub fn device(&self, name: &str) -> Option<Arc<DeviceRuntime>> {
        self.devices.read().unwrap().get(name).cloned()
    }

    pub fn device_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.devices.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn devices(&self) -> Vec<Arc<DeviceRuntime>> {
        self.devices.read().unwrap().values().cloned().collect()
    }

    /// Register a runtime built outside `load` (tests, dynamic setups).
    pub fn register(&self, runtime: Arc<DeviceRuntime>) {
        self.attach_formula_engine(&runtime);
        if runtime.device_type() == DeviceType::ElectricityMeter {
            *self.energy_meter.write().unwrap() = Some(runtime.name().to_string());
        }
        self.devices
            .write()
            .unwrap()
            .insert(runtime.name().to_string(), runtime);
    }

    /// Remove a runtime. The caller stops it first.
    pub fn unregister(&self, name: &str) -> Option<Arc<DeviceRuntime>> {
        let removed = self.devices.write().unwrap().remove(name);
        let mut meter = self.energy_meter.write().unwrap();
        if meter.as_deref() == Some(name) {
            *meter = None;
        }
        removed
    }

    // === Construction from the repository ===

    /// Build one runtime per enabled channel and import its points.
    pub async fn load(&self) -> Result<usize> {
        let channels = self.repository.channels().await?;
        let mut loaded = 0;
        for channel in channels.iter().filter(|c| c.enable) {
            match self.build_runtime(channel).await {
                Ok(runtime) => {
                    self.register(runtime);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(channel = %channel.code, error = %e, "channel skipped");
                }
            }
        }
        info!(devices = loaded, "device registry loaded");
        Ok(loaded)
    }

    async fn build_runtime(&self, channel: &ChannelRow) -> Result<Arc<DeviceRuntime>> {
        let kind = channel.protocol_kind();
        let conn = ConnectionConfig {
            // Clients dial the configured peer; servers bind all interfaces.
            ip: if kind.is_client() {
                channel.ip.clone()
            } else {
                "0.0.0.0".to_string()
            },
            port: channel.port,
            serial: (!channel.com_port.is_empty()).then(|| SerialParams {
                port: channel.com_port.clone(),
                baud_rate: channel.baud_rate,
                data_bits: channel.data_bits,
                stop_bits: channel.stop_bits,
                parity: channel.parity,
            }),
            meter_address: if channel.rtu_addr.is_empty() {
                "000000000000".to_string()
            } else {
                channel.rtu_addr.clone()
            },
            timeout_s: channel.timeout_s,
        };

        let device_type = device_type_of(&channel.code);
        let runtime = DeviceRuntime::new(channel.id, &channel.name, device_type, kind, conn)?;
        runtime.set_repository(self.repository.clone());
        runtime.import_points_from_channel(channel.id).await?;
        Ok(runtime)
    }

    // === Lifecycle ===

    /// Start every runtime, arm the formula engines, start the PCS sync.
    pub async fn start_all(&self) -> Result<()> {
        for runtime in self.devices() {
            if let Err(e) = runtime.start().await {
                warn!(device = %runtime.name(), error = %e, "device failed to start");
            }
        }
        self.reload_mappings().await?;
        self.start_pcs_sync();
        Ok(())
    }

    /// Stop the sync loop and every runtime.
    pub async fn stop_all(&self) -> Result<()> {
        if let Some(stop_tx) = self.sync_stop.lock().unwrap().take() {
            let _ = stop_tx.send(true);
        }
        for runtime in self.devices() {
            if let Err(e) = runtime.stop().await {
                warn!(device = %runtime.name(), error = %e, "device failed to stop");
            }
        }
        Ok(())
    }

    // === Formula engines ===

    fn attach_formula_engine(&self, runtime: &Arc<DeviceRuntime>) {
        if runtime.formula_engine().is_none() {
            let Some(controller) = self.self_ref.upgrade() else {
                return;
            };
            let resolver: Arc<dyn DeviceResolver> = controller;
            runtime.install_formula_engine(FormulaEngine::new(runtime.name(), resolver));
        }
    }

    /// Re-read mapping rows and re-arm every engine.
    ///
    /// Called at startup and after any mapping CRUD event.
    pub async fn reload_mappings(&self) -> Result<()> {
        let mappings = self.repository.mappings().await?;
        for runtime in self.devices() {
            if let Some(engine) = runtime.formula_engine() {
                engine.reload(&mappings);
            }
        }
        Ok(())
    }

    // === PCS power aggregation ===

    /// Designate the runtime receiving the aggregated PCS power.
    pub fn set_energy_meter(&self, name: impl Into<String>) {
        *self.energy_meter.write().unwrap() = Some(name.into());
    }

    fn start_pcs_sync(&self) {
        let Some(controller) = self.self_ref.upgrade() else {
            return;
        };
        let (stop_tx, mut stop_rx) = watch::channel(false);
        *self.sync_stop.lock().unwrap() = Some(stop_tx);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
                }
                if *stop_rx.borrow() {
                    break;
                }
                controller.sync_pcs_power_to_meter().await;
            }
            debug!("pcs sync loop exited");
        });
    }

    /// Sum `totalAcP` across every `*PCS*` runtime into the meter's
    /// `power` point. A documented special case, not a generic feature.
    pub async fn sync_pcs_power_to_meter(&self) {
        let meter_name = match self.energy_meter.read().unwrap().clone() {
            Some(name) => name,
            None => return,
        };

        let mut total_power = 0.0;
        let mut found = false;
        for runtime in self.devices() {
            if !runtime.name().to_uppercase().contains("PCS") {
                continue;
            }
            if let Some(point) = runtime.store().get_first(&[PCS_POWER_CODE]) {
                total_power += point.real_value();
                found = true;
            }
        }
        if !found {
            return;
        }

        if let Some(meter) = self.device(&meter_name) {
            match meter.edit_point_value(METER_POWER_CODE, total_power).await {
                Ok(true) => debug!(total_power, "pcs power synced to meter"),
                Ok(false) => {}
                Err(e) => debug!(error = %e, "pcs power sync failed"),
            }
        }
    }
}

#[async_trait]
impl DeviceResolver for DeviceController {
    fn resolve_point(&self, device_name: &str, point_code: &str) -> Option<Arc<Point>> {
        self.device(device_name)?.store().get(point_code)
    }

    async fn write_point_value(&self, device_name: &str, point_code: &str, value: f64) -> bool {
        match self.device(device_name) {
            Some(runtime) => runtime
                .edit_point_value(point_code, value)
                .await
                .unwrap_or(false),
            None => false,
        }
    }
}

/// Derive the device classification from its channel code.
fn device_type_of(code: &str) -> DeviceType {
    let upper = code.to_uppercase();
    if upper.contains("PCS") {
        DeviceType::Pcs
    } else if upper.contains("BMS") {
        DeviceType::Bms
    } else if upper.contains("BREAKER") {
        DeviceType::CircuitBreaker
    } else if upper.contains("GRID") {
        DeviceType::GridMeter
    } else if upper.contains("METER") || upper.contains("EM") {
        DeviceType::ElectricityMeter
    } else {
        DeviceType::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::core::point::PointKind;
    use crate::protocols::ProtocolKind;
    use crate::repository::MemoryRepository;
    use tokio::net::TcpListener;

    async fn runtime_named(name: &str, device_type: DeviceType) -> Arc<DeviceRuntime> {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        DeviceRuntime::new(
            1,
            name,
            device_type,
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
            .decode_code(0x41)
            .scaling(1.0, 0.0)
            .build()
    }

    #[tokio::test]
    async fn test_registry_and_resolver() {
        let controller = DeviceController::new(Arc::new(MemoryRepository::new()));
        let runtime = runtime_named("PCS-1", DeviceType::Pcs).await;
        runtime.add_point_dynamic(analog("totalAcP", 0)).await.unwrap();
        controller.register(runtime);

        assert_eq!(controller.device_names(), vec!["PCS-1".to_string()]);
        assert!(controller.resolve_point("PCS-1", "totalAcP").is_some());
        assert!(controller.resolve_point("PCS-1", "missing").is_none());
        assert!(controller.resolve_point("nope", "totalAcP").is_none());
    }

    #[tokio::test]
    async fn test_pcs_power_aggregation() {
        let controller = DeviceController::new(Arc::new(MemoryRepository::new()));

        let pcs1 = runtime_named("PCS-1", DeviceType::Pcs).await;
        pcs1.add_point_dynamic(analog("totalAcP", 0)).await.unwrap();
        let pcs2 = runtime_named("pcs-2", DeviceType::Pcs).await;
        pcs2.add_point_dynamic(analog("totalAcP", 0)).await.unwrap();
        let other = runtime_named("BMS-1", DeviceType::Bms).await;
        other.add_point_dynamic(analog("totalAcP", 0)).await.unwrap();
        let meter = runtime_named("EM-1", DeviceType::ElectricityMeter).await;
        meter.add_point_dynamic(analog("power", 0)).await.unwrap();

        controller.register(pcs1.clone());
        controller.register(pcs2.clone());
        controller.register(other.clone());
        controller.register(meter.clone());

        pcs1.start().await.unwrap();
        pcs2.start().await.unwrap();
        other.start().await.unwrap();
        meter.start().await.unwrap();

        pcs1.edit_point_value("totalAcP", 120.0).await.unwrap();
        pcs2.edit_point_value("totalAcP", 80.0).await.unwrap();
        other.edit_point_value("totalAcP", 999.0).await.unwrap();

        controller.sync_pcs_power_to_meter().await;
        assert_eq!(meter.store().get("power").unwrap().real_value(), 200.0);

        controller.stop_all().await.unwrap();
    }

    #[test]
    fn test_device_type_inference() {
        assert_eq!(device_type_of("pcs01"), DeviceType::Pcs);
        assert_eq!(device_type_of("grid_meter"), DeviceType::GridMeter);
        assert_eq!(device_type_of("breaker-a"), DeviceType::CircuitBreaker);
        assert_eq!(device_type_of("random"), DeviceType::Other);
    }
}
