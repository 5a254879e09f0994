use crate::error::Result;
use crate::float::Numeric;
use crate::opcode::OpCode;

use super::{Graph, NodeId};

/// Operator combinators. Each interns through [`Graph::create`].
impl<F: Numeric> Graph<F> {
    pub fn add(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.create(OpCode::Add, &[a, b])
    }

    pub fn sub(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.create(OpCode::Sub, &[a, b])
    }

    pub fn mul(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.create(OpCode::Mul, &[a, b])
    }

    pub fn div(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.create(OpCode::Div, &[a, b])
    }

    /// `a` raised to `b`, elementwise.
    pub fn pow(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.create(OpCode::Pow, &[a, b])
    }

    pub fn neg(&mut self, a: NodeId) -> Result<NodeId> {
        self.create(OpCode::Neg, &[a])
    }

    /// Natural logarithm.
    pub fn log(&mut self, a: NodeId) -> Result<NodeId> {
        self.create(OpCode::Log, &[a])
    }

    pub fn exp(&mut self, a: NodeId) -> Result<NodeId> {
        self.create(OpCode::Exp, &[a])
    }

    pub fn relu(&mut self, a: NodeId) -> Result<NodeId> {
        self.create(OpCode::Relu, &[a])
    }

    pub fn sigmoid(&mut self, a: NodeId) -> Result<NodeId> {
        self.create(OpCode::Sigmoid, &[a])
    }

    pub fn tanh(&mut self, a: NodeId) -> Result<NodeId> {
        self.create(OpCode::Tanh, &[a])
    }
}
