//! Error taxonomy shared by graph construction, compilation and execution.

use thiserror::Error;

use crate::buffer::BufferId;
use crate::device::DeviceError;
use crate::graph::NodeId;
use crate::opcode::OpCode;
use crate::shape::Shape;

/// Convenience alias used by every fallible operation in the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers.
///
/// Shape and index errors are raised at the call that caused them and never
/// deferred into a compiled script. [`Error::InternalInconsistency`] signals a
/// compiler defect and aborts the compile rather than producing a schedule.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Two non-scalar shapes that cannot broadcast against each other.
    #[error("shape mismatch: {left} vs {right}")]
    ShapeMismatch { left: Shape, right: Shape },

    /// A value slice whose length disagrees with the shape it is stored under.
    #[error("expected {expected} elements, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// A coordinate outside a shape's bounds.
    #[error("index {index:?} out of range for shape {shape}")]
    IndexOutOfRange { index: Vec<usize>, shape: Shape },

    /// An axis argument past the rank of a shape.
    #[error("axis {axis} out of range for rank {rank}")]
    AxisOutOfRange { axis: usize, rank: usize },

    /// Accelerator allocation failed even after one eviction-and-retry cycle.
    #[error("accelerator exhausted: requested {requested} elements, eviction freed {freed}")]
    ResourceExhausted { requested: usize, freed: usize },

    /// The compiler could not resolve an operand slot.
    #[error("internal inconsistency: {0}")]
    InternalInconsistency(String),

    /// An opcode without a backward rule or without a mapping on the active backend.
    #[error("operation {op:?} is not supported by {backend}")]
    UnsupportedOperation { op: OpCode, backend: String },

    /// An opcode applied to the wrong number of operands.
    #[error("operation {op:?} takes {expected} operands, got {actual}")]
    ArityMismatch {
        op: OpCode,
        expected: usize,
        actual: usize,
    },

    /// A leased buffer could not be migrated because other leases held it
    /// past the lock timeout.
    #[error("{0} is leased elsewhere and cannot migrate")]
    BufferBusy(BufferId),

    /// A node handle past the end of the graph's arena.
    ///
    /// Handles carry no graph or generation tag, so a handle from another
    /// graph, or one kept across [`Graph::clear`](crate::Graph::clear), is only
    /// caught when its index is out of range.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// An operation that requires a leaf was handed an interior node.
    #[error("node {0} is not a leaf")]
    NotALeaf(NodeId),

    /// A gradient was requested from a node that is not gradient-tracked.
    #[error("node {0} does not track gradients")]
    NoGradient(NodeId),
}

impl From<DeviceError> for Error {
    fn from(e: DeviceError) -> Self {
        match e {
            DeviceError::OutOfMemory { requested, .. } => Error::ResourceExhausted {
                requested,
                freed: 0,
            },
            other => Error::InternalInconsistency(other.to_string()),
        }
    }
}
