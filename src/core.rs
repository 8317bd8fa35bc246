//! Core data model: points, indexes, validity and change notification.

pub mod error;
pub mod point;
pub mod signal;
pub mod store;
pub mod validity;

pub use error::{Result, SimError};
pub use point::{Point, PointBuilder, PointKind, PointMetaPatch, Scaling};
pub use signal::{ChangeEvent, ChangeSignal, PointId, SubscriberId};
pub use store::{PointStore, SlavePoints};
pub use validity::Validity;
