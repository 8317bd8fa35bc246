//! Protocol adapters: one uniform surface, six concrete endpoints.

pub mod adapter;
pub mod dlt645;
pub mod iec104;
pub mod modbus;

use std::sync::Arc;

use crate::config::{ConnectionConfig, DLT645_IDLE_TIMEOUT, IEC104_COMMON_ADDRESS};
use crate::core::error::{Result, SimError};
use crate::core::point::PointKind;

pub use adapter::{ProtocolAdapter, ProtocolKind};

/// IEC-104 information-object address offset of a point variant.
///
/// Analogs sit at database address + 16385 and signals at + 1; commands
/// and set-points are taken verbatim. Modbus and DL/T 645 use addresses
/// as stored.
pub fn iec104_address_offset(kind: PointKind) -> u32 {
    match kind {
        PointKind::Analog => 16385,
        PointKind::Signal => 1,
        PointKind::Command | PointKind::Setpoint => 0,
    }
}

/// Translate a stored point address into the protocol-native one.
pub fn wire_address(protocol: ProtocolKind, kind: PointKind, address: u32) -> u32 {
    match protocol {
        ProtocolKind::Iec104Server | ProtocolKind::Iec104Client => {
            address + iec104_address_offset(kind)
        }
        _ => address,
    }
}

/// Construct the adapter for a protocol endpoint.
pub fn build_adapter(
    kind: ProtocolKind,
    conn: &ConnectionConfig,
) -> Result<Arc<dyn ProtocolAdapter>> {
    match kind {
        ProtocolKind::ModbusTcpServer => {
            Ok(modbus::ModbusServerAdapter::tcp(conn.endpoint()))
        }
        ProtocolKind::ModbusTcpClient => Ok(modbus::ModbusClientAdapter::tcp(
            conn.endpoint(),
            conn.timeout(),
        )),
        #[cfg(feature = "serial")]
        ProtocolKind::ModbusRtuServer => {
            let serial = conn
                .serial
                .clone()
                .ok_or_else(|| SimError::config("RTU server requires serial parameters"))?;
            Ok(modbus::ModbusServerAdapter::rtu(serial))
        }
        #[cfg(feature = "serial")]
        ProtocolKind::ModbusRtuClient => {
            let serial = conn
                .serial
                .clone()
                .ok_or_else(|| SimError::config("RTU client requires serial parameters"))?;
            Ok(modbus::ModbusClientAdapter::rtu(serial, conn.timeout()))
        }
        #[cfg(not(feature = "serial"))]
        ProtocolKind::ModbusRtuServer | ProtocolKind::ModbusRtuClient => Err(SimError::config(
            "modbus RTU requires the `serial` feature",
        )),
        ProtocolKind::Iec104Server => Ok(iec104::Iec104ServerAdapter::new(
            conn.endpoint(),
            IEC104_COMMON_ADDRESS,
        )),
        ProtocolKind::Iec104Client => Ok(iec104::Iec104ClientAdapter::new(
            conn.endpoint(),
            IEC104_COMMON_ADDRESS,
            conn.timeout(),
        )),
        ProtocolKind::Dlt645Server => {
            let meter = dlt645::frame::meter_address_from_str(&conn.meter_address)?;
            Ok(dlt645::Dlt645ServerAdapter::new(
                conn.endpoint(),
                meter,
                DLT645_IDLE_TIMEOUT,
            ))
        }
        ProtocolKind::Dlt645Client => {
            let meter = dlt645::frame::meter_address_from_str(&conn.meter_address)?;
            Ok(dlt645::Dlt645ClientAdapter::new(
                conn.endpoint(),
                meter,
                conn.timeout(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iec104_address_strategy() {
        assert_eq!(
            wire_address(ProtocolKind::Iec104Server, PointKind::Analog, 1),
            16386
        );
        assert_eq!(
            wire_address(ProtocolKind::Iec104Client, PointKind::Signal, 1),
            2
        );
        assert_eq!(
            wire_address(ProtocolKind::Iec104Server, PointKind::Setpoint, 100),
            100
        );
        assert_eq!(
            wire_address(ProtocolKind::ModbusTcpServer, PointKind::Analog, 1),
            1
        );
    }

    #[test]
    fn test_build_adapter_kinds() {
        let conn = ConnectionConfig::default();
        for kind in [
            ProtocolKind::ModbusTcpServer,
            ProtocolKind::ModbusTcpClient,
            ProtocolKind::Iec104Server,
            ProtocolKind::Iec104Client,
            ProtocolKind::Dlt645Server,
            ProtocolKind::Dlt645Client,
        ] {
            let adapter = build_adapter(kind, &conn).unwrap();
            assert_eq!(adapter.kind(), kind);
        }
    }
}
