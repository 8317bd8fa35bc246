//! Register byte-layout codec.
//!
//! Maps 8-bit decode codes to register count, signedness, endianness and
//! word-swap policy, and packs/unpacks values accordingly. Centralising
//! layout decisions here keeps every other subsystem protocol-agnostic.

pub mod byte_order;
pub mod table;

pub use byte_order::{bytes_to_registers, pack, registers_to_bytes, unpack, CodecValue};
pub use table::{bounds, entry, is_float, is_signed, register_count, CodecEntry, Endian, WordSwap};
