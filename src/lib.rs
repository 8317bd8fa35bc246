//! # Device Simulation Server (simsrv)
//!
//! An industrial device simulator and protocol gateway core for
//! energy-management installations. Each configured device terminates
//! one industrial-control protocol endpoint and exposes a bank of
//! measurement points that can be edited by an operator, driven by a
//! simulation engine, derived from other points via formulas, or read
//! from a remote peer.
//!
//! ## Architecture
//!
//! | Layer | Responsibility |
//! |-------|----------------|
//! | `codec` | Register byte layout: endianness, word swap, sign rules |
//! | `core` | Typed points, indexes, validity, change notification |
//! | `capture` | TX/RX frame ring with request/response latency pairing |
//! | `protocols` | Modbus TCP/RTU, IEC 60870-5-104 and DL/T 645 endpoints |
//! | `device` | Per-device runtime: polling, simulation, projections |
//! | `formula` | Derived points: safe expressions over cross-device sources |
//! | `controller` | Process-wide registry and cross-device lookup |
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use simsrv::prelude::*;
//!
//! // A Modbus TCP server device with one telemetry point
//! let runtime = DeviceRuntime::new(
//!     1,
//!     "PCS-1",
//!     DeviceType::Pcs,
//!     ProtocolKind::ModbusTcpServer,
//!     ConnectionConfig { port: 502, ..Default::default() },
//! )?;
//! runtime.add_point_dynamic(
//!     Point::builder(PointKind::Analog, "totalAcP", 1, 0x0000, 3)
//!         .decode_code(0x41)
//!         .scaling(0.1, 0.0)
//!         .build(),
//! ).await?;
//! runtime.start().await?;
//! runtime.edit_point_value("totalAcP", 230.0).await?;
//! ```
//!
//! ## Supported endpoints
//!
//! | Protocol | Server | Client |
//! |----------|--------|--------|
//! | Modbus TCP | yes | yes |
//! | Modbus RTU | `serial` feature | `serial` feature |
//! | IEC 60870-5-104 | yes | yes |
//! | DL/T 645-2007 | yes | yes |

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod capture;
pub mod codec;
pub mod config;
pub mod controller;
pub mod core;
pub mod device;
pub mod formula;
pub mod protocols;
pub mod repository;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::capture::{CaptureStats, MessageCapture, MessageRecord};
    pub use crate::config::{ConnectionConfig, SerialParams};
    pub use crate::controller::DeviceController;
    pub use crate::core::{
        error::{Result, SimError},
        point::{Point, PointBuilder, PointKind, PointMetaPatch, Scaling},
        store::PointStore,
        validity::Validity,
    };
    pub use crate::device::{
        DeviceRuntime, DeviceType, ReadOutcome, SimulateMethod, TableQuery,
    };
    pub use crate::formula::{DeviceResolver, FormulaEngine, Mapping, MappingSource};
    pub use crate::protocols::{ProtocolAdapter, ProtocolKind};
    pub use crate::repository::{
        ChannelRow, ConfigRepository, MappingRow, MemoryRepository, PointRow, SlaveRow,
    };
}

// Re-export core types at crate root for convenience
pub use crate::core::error::{Result, SimError};
pub use crate::core::point::{Point, PointKind};
pub use crate::core::validity::Validity;
pub use crate::device::runtime::{DeviceRuntime, DeviceType};
pub use crate::protocols::{ProtocolAdapter, ProtocolKind};
