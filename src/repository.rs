//! The external configuration store, seen as opaque row sets.
//!
//! The simulator consumes channel, slave, point and mapping rows through
//! this trait; where they actually live (SQLite, a remote service, a
//! test fixture) is the embedder's business. `MemoryRepository` is the
//! in-crate implementation used by tests and simple deployments.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::error::{Result, SimError};
use crate::core::point::PointMetaPatch;
use crate::formula::engine::{Mapping, MappingSource};
use crate::protocols::ProtocolKind;

/// One communication channel (becomes one device runtime).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRow {
    pub id: i64,
    pub code: String,
    pub name: String,
    /// 0 Modbus RTU, 1 Modbus TCP, 2 IEC-104, 3 DL/T 645.
    pub protocol_type: u8,
    /// 0 serial, 1 TCP client, 2 TCP server, 3 serial slave.
    pub conn_type: u8,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub com_port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default = "default_parity")]
    pub parity: char,
    /// DL/T 645 meter address.
    #[serde(default)]
    pub rtu_addr: String,
    #[serde(default = "default_timeout")]
    pub timeout_s: u64,
    pub enable: bool,
    #[serde(default)]
    pub group_id: i64,
}

fn default_baud_rate() -> u32 {
    9600
}
fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> u8 {
    1
}
fn default_parity() -> char {
    'E'
}
fn default_timeout() -> u64 {
    3
}

impl ChannelRow {
    /// Resolve the protocol endpoint this channel terminates.
    pub fn protocol_kind(&self) -> ProtocolKind {
        match (self.protocol_type, self.conn_type) {
            (0, 3) => ProtocolKind::ModbusRtuServer,
            (0, _) => ProtocolKind::ModbusRtuClient,
            (1, 1) => ProtocolKind::ModbusTcpClient,
            (1, _) => ProtocolKind::ModbusTcpServer,
            (2, 1) => ProtocolKind::Iec104Client,
            (2, _) => ProtocolKind::Iec104Server,
            (3, 1) => ProtocolKind::Dlt645Client,
            (3, _) => ProtocolKind::Dlt645Server,
            _ => ProtocolKind::ModbusTcpServer,
        }
    }
}

/// One remote terminal unit of a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveRow {
    pub id: i64,
    pub channel_id: i64,
    pub slave_id: u8,
    pub name: String,
    pub enable: bool,
}

/// One measurement point. All four variant tables share this shape; the
/// `frame_type` discriminant selects the variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointRow {
    pub channel_id: i64,
    /// Globally unique across all variants.
    pub code: String,
    pub name: String,
    pub rtu_addr: u8,
    /// Hex (`0x0010`) or decimal register address.
    pub reg_addr: String,
    pub func_code: u8,
    /// Hex (`0x41`) or decimal decode code.
    pub decode_code: String,
    /// 0 Analog, 1 Signal, 2 Command, 3 Setpoint.
    pub frame_type: u8,
    #[serde(default = "default_mul_coe")]
    pub mul_coe: f64,
    #[serde(default)]
    pub add_coe: f64,
    #[serde(default)]
    pub max_limit: f64,
    #[serde(default)]
    pub min_limit: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bit: Option<u8>,
}

fn default_mul_coe() -> f64 {
    1.0
}

/// One formula-mapping row as the store keeps it: the source list is a
/// JSON array of `{device_name, point_code, alias}` objects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingRow {
    pub id: i64,
    pub device_name: String,
    pub target_point_code: String,
    pub source_point_codes: String,
    pub formula: String,
    pub enable: bool,
}

impl MappingRow {
    /// Decode the JSON source list into a typed mapping.
    pub fn into_mapping(self) -> Result<Mapping> {
        let sources: Vec<MappingSource> = serde_json::from_str(&self.source_point_codes)
            .map_err(|e| {
                SimError::mapping(format!("bad source_point_codes for mapping {}: {e}", self.id))
            })?;
        Ok(Mapping {
            id: self.id,
            device_name: self.device_name,
            target_point_code: self.target_point_code,
            sources,
            expression: self.formula,
            enabled: self.enable,
        })
    }
}

/// Read access to the configuration collections plus best-effort
/// write-back of operator edits.
#[async_trait]
pub trait ConfigRepository: Send + Sync {
    /// All configured channels.
    async fn channels(&self) -> Result<Vec<ChannelRow>>;

    /// Slaves of one channel.
    async fn slaves(&self, channel_id: i64) -> Result<Vec<SlaveRow>>;

    /// Points of one channel, all variants.
    async fn points(&self, channel_id: i64) -> Result<Vec<PointRow>>;

    /// All formula mappings.
    async fn mappings(&self) -> Result<Vec<Mapping>>;

    /// Persist a metadata patch. The default discards it.
    async fn update_point(&self, _code: &str, _patch: &PointMetaPatch) -> Result<()> {
        Ok(())
    }
}

/// In-memory repository for tests and embedders without a database.
#[derive(Default)]
pub struct MemoryRepository {
    channels: Mutex<Vec<ChannelRow>>,
    slaves: Mutex<Vec<SlaveRow>>,
    points: Mutex<Vec<PointRow>>,
    mappings: Mutex<Vec<Mapping>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_channel(&self, row: ChannelRow) {
        self.channels.lock().unwrap().push(row);
    }

    pub fn add_slave(&self, row: SlaveRow) {
        self.slaves.lock().unwrap().push(row);
    }

    pub fn add_point(&self, row: PointRow) {
        self.points.lock().unwrap().push(row);
    }

    pub fn add_mapping(&self, mapping: Mapping) {
        self.mappings.lock().unwrap().push(mapping);
    }
}

#[async_trait]
impl ConfigRepository for MemoryRepository {
    async fn channels(&self) -> Result<Vec<ChannelRow>> {
        Ok(self.channels.lock().unwrap().clone())
    }

    async fn slaves(&self, channel_id: i64) -> Result<Vec<SlaveRow>> {
        Ok(self
            .slaves
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.channel_id == channel_id)
            .cloned()
            .collect())
    }

    async fn points(&self, channel_id: i64) -> Result<Vec<PointRow>> {
        Ok(self
            .points
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.channel_id == channel_id)
            .cloned()
            .collect())
    }

    async fn mappings(&self) -> Result<Vec<Mapping>> {
        Ok(self.mappings.lock().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(protocol_type: u8, conn_type: u8) -> ChannelRow {
        ChannelRow {
            id: 1,
            code: "ch1".into(),
            name: "Channel 1".into(),
            protocol_type,
            conn_type,
            ip: "127.0.0.1".into(),
            port: 502,
            com_port: String::new(),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: 'E',
            rtu_addr: String::new(),
            timeout_s: 3,
            enable: true,
            group_id: 0,
        }
    }

    #[test]
    fn test_protocol_kind_mapping() {
        assert_eq!(channel(1, 2).protocol_kind(), ProtocolKind::ModbusTcpServer);
        assert_eq!(channel(1, 1).protocol_kind(), ProtocolKind::ModbusTcpClient);
        assert_eq!(channel(2, 2).protocol_kind(), ProtocolKind::Iec104Server);
        assert_eq!(channel(2, 1).protocol_kind(), ProtocolKind::Iec104Client);
        assert_eq!(channel(3, 2).protocol_kind(), ProtocolKind::Dlt645Server);
        assert_eq!(channel(3, 1).protocol_kind(), ProtocolKind::Dlt645Client);
        assert_eq!(channel(0, 0).protocol_kind(), ProtocolKind::ModbusRtuClient);
        assert_eq!(channel(0, 3).protocol_kind(), ProtocolKind::ModbusRtuServer);
    }

    #[tokio::test]
    async fn test_memory_repository_filters_by_channel() {
        let repo = MemoryRepository::new();
        repo.add_point(PointRow {
            channel_id: 1,
            code: "a".into(),
            name: "A".into(),
            rtu_addr: 1,
            reg_addr: "0x0000".into(),
            func_code: 3,
            decode_code: "0x41".into(),
            frame_type: 0,
            mul_coe: 1.0,
            add_coe: 0.0,
            max_limit: 100.0,
            min_limit: 0.0,
            bit: None,
        });
        repo.add_point(PointRow {
            channel_id: 2,
            code: "b".into(),
            name: "B".into(),
            rtu_addr: 1,
            reg_addr: "1".into(),
            func_code: 3,
            decode_code: "0x21".into(),
            frame_type: 0,
            mul_coe: 1.0,
            add_coe: 0.0,
            max_limit: 0.0,
            min_limit: 0.0,
            bit: None,
        });

        assert_eq!(repo.points(1).await.unwrap().len(), 1);
        assert_eq!(repo.points(2).await.unwrap().len(), 1);
        assert_eq!(repo.points(3).await.unwrap().len(), 0);
    }

    #[test]
    fn test_mapping_row_decodes_json_sources() {
        let row = MappingRow {
            id: 7,
            device_name: "devA".into(),
            target_point_code: "T".into(),
            source_point_codes: r#"[
                {"device_name": "devA", "point_code": "P1", "alias": "a"},
                {"device_name": "devB", "point_code": "P2", "alias": "b"}
            ]"#
            .into(),
            formula: "a+b*2".into(),
            enable: true,
        };
        let mapping = row.into_mapping().unwrap();
        assert_eq!(mapping.sources.len(), 2);
        assert_eq!(mapping.sources[1].alias, "b");
        assert_eq!(mapping.expression, "a+b*2");
    }

    #[test]
    fn test_mapping_row_rejects_bad_json() {
        let row = MappingRow {
            id: 8,
            device_name: "devA".into(),
            target_point_code: "T".into(),
            source_point_codes: "not json".into(),
            formula: "a".into(),
            enable: true,
        };
        assert!(row.into_mapping().is_err());
    }
}
