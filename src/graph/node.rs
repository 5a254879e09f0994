use std::fmt;

use crate::buffer::Buffer;
use crate::float::Numeric;
use crate::opcode::OpCode;
use crate::shape::Shape;

/// Arena index of a node inside its [`Graph`](super::Graph).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// What a node computes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeOp {
    Leaf,
    Unary(OpCode, NodeId),
    Binary(OpCode, NodeId, NodeId),
}

impl NodeOp {
    #[inline]
    pub fn opcode(&self) -> Option<OpCode> {
        match *self {
            NodeOp::Leaf => None,
            NodeOp::Unary(op, _) | NodeOp::Binary(op, _, _) => Some(op),
        }
    }

    /// Operands in order (left first).
    pub fn operands(&self) -> impl Iterator<Item = NodeId> {
        let (a, b) = match *self {
            NodeOp::Leaf => (None, None),
            NodeOp::Unary(_, a) => (Some(a), None),
            NodeOp::Binary(_, a, b) => (Some(a), Some(b)),
        };
        a.into_iter().chain(b)
    }
}

/// Interning key. Leaves are never interned except scalar constants, which
/// are keyed by their bit pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum NodeKey {
    Op(NodeOp),
    Constant(u64),
}

impl NodeKey {
    /// Key for an operation, with commutative operands in canonical order.
    pub(crate) fn op(op: NodeOp) -> Self {
        match op {
            NodeOp::Binary(code, a, b) if code.is_commutative() && b < a => {
                NodeKey::Op(NodeOp::Binary(code, b, a))
            }
            other => NodeKey::Op(other),
        }
    }
}

/// Content buffer of a node plus its gradient buffer when gradient-tracked.
///
/// Both buffers always have the same length.
pub struct NodeResult<F: Numeric> {
    pub(crate) content: Buffer<F>,
    pub(crate) gradient: Option<Buffer<F>>,
}

impl<F: Numeric> NodeResult<F> {
    pub fn content(&self) -> &Buffer<F> {
        &self.content
    }

    pub fn gradient(&self) -> Option<&Buffer<F>> {
        self.gradient.as_ref()
    }
}

/// A vertex of the expression graph.
///
/// The operation and shape never change after creation; only the flags and
/// the lazily allocated result do.
pub struct Node<F: Numeric> {
    pub(crate) op: NodeOp,
    pub(crate) shape: Shape,
    /// Nodes that take this one as an operand, in creation order.
    pub(crate) users: Vec<NodeId>,
    pub(crate) is_output: bool,
    pub(crate) needs_gradient: bool,
    /// The content buffer holds the value for the current leaf values.
    pub(crate) has_cached_result: bool,
    pub(crate) result: Option<NodeResult<F>>,
}

impl<F: Numeric> Node<F> {
    pub fn op(&self) -> NodeOp {
        self.op
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.shape.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shape.is_empty()
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.op == NodeOp::Leaf
    }

    pub fn users(&self) -> &[NodeId] {
        &self.users
    }

    pub fn is_output(&self) -> bool {
        self.is_output
    }

    pub fn needs_gradient(&self) -> bool {
        self.needs_gradient
    }

    pub fn has_cached_result(&self) -> bool {
        self.has_cached_result
    }

    pub fn result(&self) -> Option<&NodeResult<F>> {
        self.result.as_ref()
    }

    pub(crate) fn content(&self) -> Option<&Buffer<F>> {
        self.result.as_ref().map(|r| &r.content)
    }

    pub(crate) fn gradient_buffer(&self) -> Option<&Buffer<F>> {
        self.result.as_ref().and_then(|r| r.gradient.as_ref())
    }
}
