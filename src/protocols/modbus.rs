//! Modbus TCP/RTU server and client adapters.

pub mod bank;
pub mod client;
pub mod frame;
pub mod server;

pub use bank::{RegisterBank, Space};
pub use client::ModbusClientAdapter;
pub use server::ModbusServerAdapter;
