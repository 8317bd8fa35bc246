//! IEC 60870-5-104 server and client adapters.

pub mod client;
pub mod frame;
pub mod server;

pub use client::Iec104ClientAdapter;
pub use server::Iec104ServerAdapter;
