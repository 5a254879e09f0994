//! Opcodes for graph nodes and compiled scripts.
//!
//! Each opcode is an elementwise operation. [`eval_forward`] evaluates one
//! opcode at one coordinate and [`reverse_partials`] returns its local partial
//! derivatives, which the gradient engine multiplies by the upstream gradient.

use std::fmt;

use num_traits::Float;

/// Elementwise operation codes.
///
/// Binary ops read both operands; unary ops read the left operand only.
/// [`OpCode::Copy`] never appears on a graph node: the compiler emits it when
/// the requested output is itself a leaf.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpCode {
    /// Move the left operand to the result slot.
    Copy,

    // ── Binary ──
    Add,
    Sub,
    Mul,
    Div,
    Pow,

    // ── Unary ──
    Neg,
    Log,
    Exp,
    Relu,
    Sigmoid,
    Tanh,
}

impl OpCode {
    /// Every opcode, in discriminant order.
    pub const ALL: [OpCode; 12] = [
        OpCode::Copy,
        OpCode::Add,
        OpCode::Sub,
        OpCode::Mul,
        OpCode::Div,
        OpCode::Pow,
        OpCode::Neg,
        OpCode::Log,
        OpCode::Exp,
        OpCode::Relu,
        OpCode::Sigmoid,
        OpCode::Tanh,
    ];

    /// Number of operands read by this opcode.
    #[inline]
    pub fn arity(self) -> usize {
        match self {
            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Pow => 2,
            _ => 1,
        }
    }

    #[inline]
    pub fn is_binary(self) -> bool {
        self.arity() == 2
    }

    /// Operand order does not matter; interning matches either order.
    #[inline]
    pub fn is_commutative(self) -> bool {
        matches!(self, OpCode::Add | OpCode::Mul)
    }

    /// Lower-case mnemonic used in script listings.
    pub fn mnemonic(self) -> &'static str {
        match self {
            OpCode::Copy => "copy",
            OpCode::Add => "add",
            OpCode::Sub => "sub",
            OpCode::Mul => "mul",
            OpCode::Div => "div",
            OpCode::Pow => "pow",
            OpCode::Neg => "neg",
            OpCode::Log => "log",
            OpCode::Exp => "exp",
            OpCode::Relu => "relu",
            OpCode::Sigmoid => "sigmoid",
            OpCode::Tanh => "tanh",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Evaluate a single opcode in the forward direction.
///
/// For unary ops `b` is ignored.
#[inline]
pub fn eval_forward<T: Float>(op: OpCode, a: T, b: T) -> T {
    match op {
        OpCode::Copy => a,

        OpCode::Add => a + b,
        OpCode::Sub => a - b,
        OpCode::Mul => a * b,
        OpCode::Div => a / b,
        OpCode::Pow => a.powf(b),

        OpCode::Neg => -a,
        OpCode::Log => a.ln(),
        OpCode::Exp => a.exp(),
        OpCode::Relu => {
            if a > T::zero() {
                a
            } else {
                T::zero()
            }
        }
        OpCode::Sigmoid => T::one() / (T::one() + (-a).exp()),
        OpCode::Tanh => a.tanh(),
    }
}

/// Local partial derivatives of a single opcode.
///
/// Returns `(∂result/∂a, ∂result/∂b)`; the second partial is zero for unary
/// ops. `r` is the node's own forward value, reused by the rules for `exp`,
/// `sigmoid` and `tanh`.
#[inline]
pub fn reverse_partials<T: Float>(op: OpCode, a: T, b: T, r: T) -> (T, T) {
    let zero = T::zero();
    let one = T::one();
    match op {
        OpCode::Copy => (one, zero),

        OpCode::Add => (one, one),
        OpCode::Sub => (one, -one),
        OpCode::Mul => (b, a),
        OpCode::Div => {
            let inv = one / b;
            (inv, -a * inv * inv)
        }
        OpCode::Pow => {
            // d/da a^b = b * a^(b-1), d/db a^b = a^b * ln(a)
            (b * a.powf(b - one), r * a.ln())
        }

        OpCode::Neg => (-one, zero),
        OpCode::Log => (one / a, zero),
        OpCode::Exp => (r, zero),
        OpCode::Relu => {
            if a > zero {
                (one, zero)
            } else {
                (zero, zero)
            }
        }
        OpCode::Sigmoid => (r * (one - r), zero),
        OpCode::Tanh => (one - r * r, zero),
    }
}
