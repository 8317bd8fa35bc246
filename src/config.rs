//! Process-wide defaults and connection configuration.
//!
//! This module is the single source of truth for every default the
//! simulator carries; repository implementations and adapters receive
//! explicit values and never maintain fallback tables of their own.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Frames retained per capture ring.
pub const CAPTURE_CAPACITY: usize = 200;

/// Client-side I/O timeout.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(3);

/// DL/T 645 server idle-close window.
pub const DLT645_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default TCP ports per protocol.
pub const MODBUS_TCP_PORT: u16 = 502;
pub const IEC104_PORT: u16 = 2404;
pub const DLT645_PORT: u16 = 8899;

/// IEC-104 common address of the station.
pub const IEC104_COMMON_ADDRESS: u16 = 1;

/// Batch polling limits: strict adjacency, at most 120 registers.
pub const POLL_MAX_GAP: u32 = 0;
pub const POLL_MAX_COUNT: u16 = 120;

/// Simulation tick period.
pub const SIMULATION_TICK: Duration = Duration::from_secs(1);

/// Formula executor queue depth.
pub const FORMULA_QUEUE_DEPTH: usize = 256;

/// Serial line parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialParams {
    /// Device path, e.g. `/dev/ttyUSB0` or `COM3`.
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    /// `N`, `E` or `O`.
    pub parity: char,
}

impl Default for SerialParams {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: 'E',
        }
    }
}

#[cfg(feature = "serial")]
impl SerialParams {
    /// Open the serial line with these parameters.
    pub fn open(&self) -> crate::core::error::Result<tokio_serial::SerialStream> {
        use tokio_serial::SerialPortBuilderExt;

        let parity = match self.parity.to_ascii_uppercase() {
            'E' => tokio_serial::Parity::Even,
            'O' => tokio_serial::Parity::Odd,
            _ => tokio_serial::Parity::None,
        };
        let data_bits = match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let stop_bits = match self.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };

        tokio_serial::new(&self.port, self.baud_rate)
            .parity(parity)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .open_native_async()
            .map_err(|e| {
                crate::core::error::SimError::link(format!("open {}: {e}", self.port))
            })
    }
}

/// Connection configuration of one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Peer address for clients, bind address for servers.
    pub ip: String,
    pub port: u16,
    /// Serial parameters; present selects RTU transports.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<SerialParams>,
    /// DL/T 645 meter address, 12 decimal digits.
    pub meter_address: String,
    /// Client I/O timeout in seconds.
    pub timeout_s: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ip: "0.0.0.0".to_string(),
            port: MODBUS_TCP_PORT,
            serial: None,
            meter_address: "000000000000".to_string(),
            timeout_s: CLIENT_TIMEOUT.as_secs(),
        }
    }
}

impl ConnectionConfig {
    /// `ip:port` endpoint string.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Client I/O timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_s.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_format() {
        let conn = ConnectionConfig {
            ip: "192.168.1.10".into(),
            port: 2404,
            ..Default::default()
        };
        assert_eq!(conn.endpoint(), "192.168.1.10:2404");
    }

    #[test]
    fn test_timeout_floor() {
        let conn = ConnectionConfig {
            timeout_s: 0,
            ..Default::default()
        };
        assert_eq!(conn.timeout(), Duration::from_secs(1));
    }
}
