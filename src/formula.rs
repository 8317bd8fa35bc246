//! The formula-driven derived-point engine.

pub mod ast;
pub mod engine;

pub use ast::{parse, BinaryOp, Expr};
pub use engine::{DeviceResolver, FormulaEngine, Mapping, MappingSource};
