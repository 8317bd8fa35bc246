//! The protocol adapter capability surface.
//!
//! Every device runtime drives exactly one adapter. The trait is
//! object-safe (`Box<dyn ProtocolAdapter>` / `Arc<dyn ProtocolAdapter>`)
//! because runtimes hold heterogeneous protocol endpoints behind one
//! interface; `async_trait` bridges the dynamic dispatch.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::capture::MessageCapture;
use crate::core::error::Result;
use crate::core::point::Point;

/// The protocol endpoint variants a device can terminate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    ModbusTcpServer,
    ModbusTcpClient,
    ModbusRtuServer,
    ModbusRtuClient,
    Iec104Server,
    Iec104Client,
    Dlt645Server,
    Dlt645Client,
}

impl ProtocolKind {
    /// Check if this endpoint initiates requests.
    #[inline]
    pub fn is_client(&self) -> bool {
        matches!(
            self,
            Self::ModbusTcpClient
                | Self::ModbusRtuClient
                | Self::Iec104Client
                | Self::Dlt645Client
        )
    }

    /// Check if this endpoint answers requests.
    #[inline]
    pub fn is_server(&self) -> bool {
        !self.is_client()
    }

    /// Short protocol name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ModbusTcpServer => "modbus_tcp_server",
            Self::ModbusTcpClient => "modbus_tcp_client",
            Self::ModbusRtuServer => "modbus_rtu_server",
            Self::ModbusRtuClient => "modbus_rtu_client",
            Self::Iec104Server => "iec104_server",
            Self::Iec104Client => "iec104_client",
            Self::Dlt645Server => "dlt645_server",
            Self::Dlt645Client => "dlt645_client",
        }
    }
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Uniform read/write/serve surface implemented by every protocol variant.
///
/// Raw values cross this boundary unscaled: an adapter converts to and
/// from its wire representation using the point's codec and scaling, but
/// the caller always sees the register image.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    /// Which protocol endpoint this adapter terminates.
    fn kind(&self) -> ProtocolKind;

    /// Whether the endpoint is currently serving or connected.
    fn is_running(&self) -> bool;

    /// Open the socket or serial line and begin serving / connect.
    async fn start(&self) -> Result<()>;

    /// Stop serving and release the transport.
    async fn stop(&self) -> Result<()>;

    /// Register addressable items with the endpoint's local data model.
    fn add_points(&self, points: &[Arc<Point>]);

    /// Read the raw register image of one point.
    ///
    /// `Ok(None)` means the point is not addressable on this endpoint.
    async fn read_value(&self, point: &Point) -> Result<Option<i64>>;

    /// Write the raw register image of one point. Returns success.
    async fn write_value(&self, point: &Point, raw: i64) -> Result<bool>;

    /// Issue one framed batch read (client variants only).
    ///
    /// `Ok(None)` means batch reads are not supported by this endpoint
    /// and the caller must fall back to single-point reads.
    async fn read_batch(
        &self,
        _slave_id: u8,
        _function_code: u8,
        _start_address: u32,
        _count: u16,
    ) -> Result<Option<Vec<u16>>> {
        Ok(None)
    }

    /// The capture ring wired into this adapter's transport.
    fn capture(&self) -> Arc<MessageCapture>;

    /// Pull asynchronously received values into the point model.
    ///
    /// Only meaningful for the IEC-104 client, whose socket callbacks
    /// mutate a library-owned mirror; everyone else is a no-op.
    async fn sync_mirror(&self, _points: &[Arc<Point>]) -> Result<()> {
        Ok(())
    }
}

/// Extract a single bit of a 16-bit register image.
#[inline]
pub fn bit_of(value: u16, bit: u8) -> i64 {
    ((value >> bit) & 1) as i64
}

/// Set or clear a single bit of a 16-bit register image.
#[inline]
pub fn with_bit(value: u16, bit: u8, on: bool) -> u16 {
    if on {
        value | (1 << bit)
    } else {
        value & !(1 << bit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roles() {
        assert!(ProtocolKind::ModbusTcpClient.is_client());
        assert!(ProtocolKind::Iec104Server.is_server());
        assert!(!ProtocolKind::Dlt645Server.is_client());
    }

    #[test]
    fn test_bit_helpers() {
        assert_eq!(bit_of(0b1010, 1), 1);
        assert_eq!(bit_of(0b1010, 2), 0);
        assert_eq!(with_bit(0, 3, true), 0b1000);
        assert_eq!(with_bit(0b1111, 0, false), 0b1110);
    }
}
