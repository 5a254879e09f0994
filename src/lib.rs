//! Expression graphs compiled to per-element scripts, with reverse-mode
//! gradients and buffers that migrate between host and accelerator memory.

mod backward;
pub mod buffer;
pub mod config;
pub mod device;
pub mod error;
mod exec;
pub mod float;
pub mod graph;
pub mod opcode;
pub mod script;
pub mod shape;

pub use buffer::{Buffer, BufferId, BufferLease, BufferManager, Location};
pub use config::Config;
pub use device::{Accelerator, DeviceBlock, DeviceError, DeviceId, SimulatedAccelerator};
pub use error::{Error, Result};
pub use exec::Reduction;
pub use float::Numeric;
pub use graph::{Graph, Node, NodeId, NodeOp, NodeResult};
pub use opcode::OpCode;
pub use script::{CompileStats, OperationRecord, Script, Slot};
pub use shape::Shape;

/// Graph over `f64` elements.
pub type Graph64 = Graph<f64>;
/// Graph over `f32` elements.
pub type Graph32 = Graph<f32>;
