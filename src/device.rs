//! The per-device runtime and its engines.

pub mod poller;
pub mod runtime;
pub mod simulator;
pub mod table;

pub use poller::{group_points, poll_cycle, AddressGroup, ReadOutcome};
pub use runtime::{DeviceRuntime, DeviceType};
pub use simulator::{SimPointInfo, SimulateMethod, Simulator};
pub use table::{table_head, TableQuery, TableRow};
