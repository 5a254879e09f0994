//! Expression graph: an arena of interned nodes owned by one [`Graph`].
//!
//! Nodes are created through [`Graph::leaf`], [`Graph::scalar`],
//! [`Graph::create`] and the combinators in this module (`add`, `mul`,
//! `sigmoid`, ...). Structurally equal operation nodes are interned to the same
//! [`NodeId`]; for commutative opcodes either operand order matches.
//!
//! Values are produced lazily: [`Graph::value`] marks the node as an output,
//! compiles the reachable subgraph into a [`Script`](crate::Script) (cached
//! per output) and runs it on the accelerator. Updating a leaf with
//! [`Graph::set_value`] clears the cached-result flag of every downstream
//! node so the next read recomputes.

use std::collections::HashMap;
use std::sync::Arc;

use crate::buffer::{Buffer, BufferManager, Location};
use crate::config::Config;
use crate::device::{Accelerator, SimulatedAccelerator};
use crate::error::{Error, Result};
use crate::exec;
use crate::float::Numeric;
use crate::opcode::OpCode;
use crate::script::{self, Script};
use crate::shape::Shape;

mod node;
mod ops;

pub use self::node::{Node, NodeId, NodeOp, NodeResult};
pub(crate) use self::node::NodeKey;

/// Graph context: node arena, interning table, compiled scripts and the
/// buffer manager backing every node's storage.
pub struct Graph<F: Numeric> {
    nodes: Vec<Node<F>>,
    interned: HashMap<NodeKey, NodeId>,
    /// Interning key of each scalar constant, for removal on rewrite.
    constants: HashMap<NodeId, NodeKey>,
    scripts: HashMap<NodeId, Arc<Script>>,
    buffers: BufferManager<F>,
    config: Config,
}

impl<F: Numeric> Default for Graph<F> {
    fn default() -> Self {
        Graph::new(Config::default())
    }
}

impl<F: Numeric> Graph<F> {
    /// Graph backed by a fresh [`SimulatedAccelerator`] sized from `config`.
    pub fn new(config: Config) -> Self {
        let device = SimulatedAccelerator::new(config.accelerator_capacity)
            .with_parallel(config.parallel);
        Graph::with_accelerator(Arc::new(device), config)
    }

    pub fn with_accelerator(accelerator: Arc<dyn Accelerator<F>>, config: Config) -> Self {
        Graph {
            nodes: Vec::new(),
            interned: HashMap::new(),
            constants: HashMap::new(),
            scripts: HashMap::new(),
            buffers: BufferManager::new(accelerator),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn buffers(&self) -> &BufferManager<F> {
        &self.buffers
    }

    /// Number of nodes in the arena.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Result<&Node<F>> {
        self.nodes.get(id.index()).ok_or(Error::UnknownNode(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node<F>> {
        self.nodes.get_mut(id.index()).ok_or(Error::UnknownNode(id))
    }

    pub fn shape(&self, id: NodeId) -> Result<&Shape> {
        Ok(&self.node(id)?.shape)
    }

    fn push(&mut self, op: NodeOp, shape: Shape, needs_gradient: bool) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        for operand in op.operands() {
            let users = &mut self.nodes[operand.index()].users;
            if users.last() != Some(&id) {
                users.push(id);
            }
        }
        self.nodes.push(Node {
            op,
            shape,
            users: Vec::new(),
            is_output: false,
            needs_gradient,
            has_cached_result: false,
            result: None,
        });
        id
    }

    /// New leaf holding `values`; trainable leaves get a zeroed gradient buffer.
    ///
    /// Leaves are never interned: every call creates a distinct node.
    pub fn leaf(&mut self, shape: impl Into<Shape>, values: &[F], trainable: bool) -> Result<NodeId> {
        let shape = shape.into();
        if values.len() != shape.len() {
            return Err(Error::LengthMismatch {
                expected: shape.len(),
                actual: values.len(),
            });
        }
        let len = shape.len();
        let id = self.push(NodeOp::Leaf, shape, trainable);
        let content = self.buffers.allocate_from(values.to_vec());
        let gradient = trainable.then(|| self.buffers.allocate(len));
        let node = &mut self.nodes[id.index()];
        node.result = Some(NodeResult { content, gradient });
        node.has_cached_result = true;
        Ok(id)
    }

    /// Non-trainable scalar constant; equal constants share one node.
    pub fn scalar(&mut self, value: F) -> NodeId {
        let key = NodeKey::Constant(value.to_key_bits());
        if let Some(&id) = self.interned.get(&key) {
            return id;
        }
        let id = self.push(NodeOp::Leaf, Shape::scalar(), false);
        let content = self.buffers.allocate_from(vec![value]);
        let node = &mut self.nodes[id.index()];
        node.result = Some(NodeResult {
            content,
            gradient: None,
        });
        node.has_cached_result = true;
        self.interned.insert(key, id);
        self.constants.insert(id, key);
        id
    }

    /// Intern an operation node over `operands`.
    ///
    /// Returns the existing node when one with the same opcode and operands
    /// exists. Fails with [`Error::ShapeMismatch`] when binary operands do not
    /// broadcast.
    pub fn create(&mut self, op: OpCode, operands: &[NodeId]) -> Result<NodeId> {
        if op == OpCode::Copy {
            return Err(Error::UnsupportedOperation {
                op,
                backend: "graph".to_string(),
            });
        }
        if operands.len() != op.arity() {
            return Err(Error::ArityMismatch {
                op,
                expected: op.arity(),
                actual: operands.len(),
            });
        }

        let (node_op, shape, needs_gradient) = match *operands {
            [a] => {
                let na = self.node(a)?;
                (NodeOp::Unary(op, a), na.shape.clone(), na.needs_gradient)
            }
            [a, b] => {
                let na = self.node(a)?;
                let nb = self.node(b)?;
                let shape = na.shape.broadcast(&nb.shape)?;
                (
                    NodeOp::Binary(op, a, b),
                    shape,
                    na.needs_gradient || nb.needs_gradient,
                )
            }
            _ => {
                return Err(Error::InternalInconsistency(format!(
                    "{op} with {} operands",
                    operands.len()
                )))
            }
        };

        let key = NodeKey::op(node_op);
        if let Some(&id) = self.interned.get(&key) {
            return Ok(id);
        }
        let id = self.push(node_op, shape, needs_gradient);
        self.interned.insert(key, id);
        log::trace!("create {id} = {node_op:?}");
        Ok(id)
    }

    /// Flag `id` as an output and allocate its content (and gradient) buffers.
    pub fn mark_output(&mut self, id: NodeId) -> Result<()> {
        let buffers = self.buffers.clone();
        let node = self.node_mut(id)?;
        node.is_output = true;
        if node.result.is_none() {
            let len = node.shape.len();
            node.result = Some(NodeResult {
                content: buffers.allocate(len),
                gradient: node.needs_gradient.then(|| buffers.allocate(len)),
            });
        }
        Ok(())
    }

    /// Compiled script for `output`, compiling on first request.
    pub fn script(&mut self, output: NodeId) -> Result<Arc<Script>> {
        if let Some(script) = self.scripts.get(&output) {
            return Ok(Arc::clone(script));
        }
        self.compile(output)
    }

    /// Compile `output` afresh, replacing any cached script.
    pub fn compile(&mut self, output: NodeId) -> Result<Arc<Script>> {
        let script = Arc::new(script::compile(self, output)?);
        self.scripts.insert(output, Arc::clone(&script));
        Ok(script)
    }

    /// Content buffers of a script's data slots, in slot order.
    pub(crate) fn data_buffers(&self, script: &Script) -> Result<Vec<Buffer<F>>> {
        script
            .data()
            .iter()
            .map(|&id| {
                self.node(id)?.content().cloned().ok_or_else(|| {
                    Error::InternalInconsistency(format!("data leaf {id} has no content"))
                })
            })
            .collect()
    }

    /// Make sure `id`'s content buffer holds its current value and return it.
    pub(crate) fn materialize(&mut self, id: NodeId) -> Result<Buffer<F>> {
        self.mark_output(id)?;
        let node = self.node(id)?;
        let content = node
            .content()
            .cloned()
            .ok_or_else(|| Error::InternalInconsistency(format!("{id} has no content")))?;
        if node.has_cached_result {
            return Ok(content);
        }

        let script = self.script(id)?;
        let data = self.data_buffers(&script)?;
        exec::forward(self.buffers.accelerator().as_ref(), &script, &data, &content)?;
        self.nodes[id.index()].has_cached_result = true;
        Ok(content)
    }

    /// Current value of `id`, computing it if needed.
    pub fn value(&mut self, id: NodeId) -> Result<Vec<F>> {
        self.materialize(id)?.to_vec()
    }

    /// One element of `id`'s value.
    pub fn value_at(&mut self, id: NodeId, index: &[usize]) -> Result<F> {
        let flat = self.node(id)?.shape.flatten(index)?;
        let content = self.materialize(id)?;
        let lease = content.lease(Location::Host)?;
        lease
            .host()
            .and_then(|data| data.get(flat).copied())
            .ok_or_else(|| Error::InternalInconsistency(format!("{id}: host lease without data")))
    }

    /// Accumulated gradient of `id`.
    ///
    /// Zero until a backward pass reaches the node. Fails with
    /// [`Error::NoGradient`] unless the node is a trainable leaf or a
    /// gradient-tracked node marked as output.
    pub fn gradient(&self, id: NodeId) -> Result<Vec<F>> {
        self.node(id)?
            .gradient_buffer()
            .ok_or(Error::NoGradient(id))?
            .to_vec()
    }

    /// Overwrite a leaf's values and invalidate every node computed from it.
    pub fn set_value(&mut self, leaf: NodeId, values: &[F]) -> Result<()> {
        let node = self.node(leaf)?;
        if !node.is_leaf() {
            return Err(Error::NotALeaf(leaf));
        }
        let content = node
            .content()
            .ok_or_else(|| Error::InternalInconsistency(format!("leaf {leaf} has no content")))?;
        content.write(values)?;
        // A rewritten constant no longer matches its interning key.
        if let Some(key) = self.constants.remove(&leaf) {
            self.interned.remove(&key);
        }
        self.invalidate(leaf);
        Ok(())
    }

    /// Clear the cached-result flag on every node downstream of `source`.
    pub(crate) fn invalidate(&mut self, source: NodeId) {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack: Vec<NodeId> = self.nodes[source.index()].users.clone();
        let mut cleared = 0usize;
        while let Some(id) = stack.pop() {
            if std::mem::replace(&mut seen[id.index()], true) {
                continue;
            }
            let node = &mut self.nodes[id.index()];
            if node.has_cached_result {
                node.has_cached_result = false;
                cleared += 1;
            }
            stack.extend(node.users.iter().copied());
        }
        log::trace!("invalidate {source}: cleared {cleared} cached results");
    }

    /// Drop every node, result and compiled script.
    pub fn clear(&mut self) {
        log::debug!(
            "clearing graph: {} nodes, {} scripts",
            self.nodes.len(),
            self.scripts.len()
        );
        self.scripts.clear();
        self.interned.clear();
        self.constants.clear();
        self.nodes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> Graph<f64> {
        Graph::new(Config::default().with_accelerator_capacity(1024))
    }

    #[test]
    fn interning_respects_commutativity() {
        let mut g = graph();
        let a = g.leaf([2], &[1.0, 2.0], false).unwrap();
        let b = g.leaf([2], &[3.0, 4.0], false).unwrap();
        assert_eq!(g.add(a, b).unwrap(), g.add(b, a).unwrap());
        assert_eq!(g.mul(a, b).unwrap(), g.mul(b, a).unwrap());
        assert_ne!(g.sub(a, b).unwrap(), g.sub(b, a).unwrap());
        assert_eq!(g.neg(a).unwrap(), g.neg(a).unwrap());
    }

    #[test]
    fn leaves_are_distinct_constants_are_shared() {
        let mut g = graph();
        let a = g.leaf([1], &[1.0], false).unwrap();
        let b = g.leaf([1], &[1.0], false).unwrap();
        assert_ne!(a, b);
        assert_eq!(g.scalar(2.0), g.scalar(2.0));
        assert_ne!(g.scalar(2.0), g.scalar(3.0));
    }

    #[test]
    fn users_recorded_once() {
        let mut g = graph();
        let a = g.leaf([3], &[1.0, 2.0, 3.0], false).unwrap();
        let sq = g.mul(a, a).unwrap();
        assert_eq!(g.node(a).unwrap().users(), &[sq]);
    }

    #[test]
    fn gradient_flag_propagates() {
        let mut g = graph();
        let w = g.leaf([2], &[1.0, 2.0], true).unwrap();
        let x = g.leaf([2], &[1.0, 2.0], false).unwrap();
        let wx = g.mul(w, x).unwrap();
        let xx = g.mul(x, x).unwrap();
        assert!(g.node(wx).unwrap().needs_gradient());
        assert!(!g.node(xx).unwrap().needs_gradient());
    }

    #[test]
    fn construction_errors_fail_fast() {
        let mut g = graph();
        let a = g.leaf([2], &[1.0, 2.0], false).unwrap();
        let b = g.leaf([3], &[1.0, 2.0, 3.0], false).unwrap();
        assert!(matches!(g.add(a, b), Err(Error::ShapeMismatch { .. })));
        assert!(matches!(
            g.leaf([2, 2], &[1.0], false),
            Err(Error::LengthMismatch { expected: 4, actual: 1 })
        ));
        assert!(matches!(
            g.create(OpCode::Add, &[a]),
            Err(Error::ArityMismatch { .. })
        ));
        assert!(matches!(
            g.neg(NodeId(99)),
            Err(Error::UnknownNode(NodeId(99)))
        ));
    }

    #[test]
    fn mark_output_allocates_results() {
        let mut g = graph();
        let w = g.leaf([2], &[1.0, 2.0], true).unwrap();
        let y = g.exp(w).unwrap();
        assert!(g.node(y).unwrap().result().is_none());
        g.mark_output(y).unwrap();
        let result = g.node(y).unwrap().result().unwrap();
        assert_eq!(result.content().len(), 2);
        assert_eq!(result.gradient().map(|b| b.len()), Some(2));
    }

    #[test]
    fn set_value_invalidates_downstream() {
        let mut g = graph();
        let a = g.leaf([2], &[1.0, 2.0], false).unwrap();
        let b = g.leaf([2], &[3.0, 4.0], false).unwrap();
        let s = g.add(a, b).unwrap();
        let t = g.mul(s, b).unwrap();
        assert_eq!(g.value(t).unwrap(), vec![12.0, 24.0]);
        assert_eq!(g.value(s).unwrap(), vec![4.0, 6.0]);

        g.set_value(a, &[0.0, 0.0]).unwrap();
        assert!(!g.node(s).unwrap().has_cached_result());
        assert!(!g.node(t).unwrap().has_cached_result());
        assert_eq!(g.value(t).unwrap(), vec![9.0, 16.0]);
        assert_eq!(g.value(s).unwrap(), vec![3.0, 4.0]);
        assert!(matches!(g.set_value(s, &[0.0, 0.0]), Err(Error::NotALeaf(_))));
    }

    #[test]
    fn rewriting_constants_touches_only_their_own_key() {
        let mut g = graph();
        let two = g.scalar(2.0);
        let three = g.scalar(3.0);
        let x = g.leaf([2], &[1.0, 2.0], false).unwrap();
        let y = g.mul(x, two).unwrap();
        let interned = g.interned.len();

        // Ordinary leaves have no interning key to drop.
        g.set_value(x, &[5.0, 6.0]).unwrap();
        assert_eq!(g.interned.len(), interned);
        assert_eq!(g.mul(x, two).unwrap(), y);

        g.set_value(two, &[4.0]).unwrap();
        assert_eq!(g.interned.len(), interned - 1);
        assert!(!g.constants.contains_key(&two));
        assert_eq!(g.scalar(3.0), three);
        assert_ne!(g.scalar(2.0), two);
        assert_eq!(g.value(y).unwrap(), vec![20.0, 24.0]);
    }

    #[test]
    fn clear_empties_the_arena() {
        let mut g = graph();
        let a = g.leaf([2], &[1.0, 2.0], false).unwrap();
        let y = g.exp(a).unwrap();
        g.value(y).unwrap();
        g.clear();
        assert!(g.is_empty());
        assert!(matches!(g.value(y), Err(Error::UnknownNode(_))));
        assert_eq!(g.buffers().len(), 0);
    }
}
