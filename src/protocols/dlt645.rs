//! DL/T 645-2007 electricity-meter server and client adapters.

pub mod client;
pub mod frame;
pub mod server;

pub use client::Dlt645ClientAdapter;
pub use server::Dlt645ServerAdapter;
