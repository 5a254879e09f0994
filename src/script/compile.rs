use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};
use crate::float::Numeric;
use crate::graph::{Graph, NodeId, NodeOp};
use crate::opcode::OpCode;

use super::{CompileStats, OperationRecord, Script, Slot};

/// Operands-before-node DFS from `output`, visiting each node once.
fn topological_order<F: Numeric>(graph: &Graph<F>, output: NodeId) -> Result<Vec<NodeId>> {
    graph.node(output)?;
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    let mut stack = vec![(output, false)];

    while let Some((id, expanded)) = stack.pop() {
        if expanded {
            order.push(id);
            continue;
        }
        if !visited.insert(id) {
            continue;
        }
        stack.push((id, true));
        let operands: Vec<NodeId> = graph.node(id)?.op().operands().collect();
        // Reversed so the left operand is visited first.
        for &operand in operands.iter().rev() {
            if !visited.contains(&operand) {
                stack.push((operand, false));
            }
        }
    }
    Ok(order)
}

/// Cache slot bookkeeping for one compilation.
#[derive(Default)]
struct CacheSlots {
    slots: Vec<Option<NodeId>>,
    resident: HashMap<NodeId, u32>,
    reused: usize,
}

impl CacheSlots {
    /// First free slot, or a new one at the end.
    fn allocate(&mut self, id: NodeId) -> u32 {
        let k = match self.slots.iter().position(Option::is_none) {
            Some(k) => {
                self.reused += 1;
                self.slots[k] = Some(id);
                k
            }
            None => {
                self.slots.push(Some(id));
                self.slots.len() - 1
            }
        };
        self.resident.insert(id, k as u32);
        k as u32
    }

    fn get(&self, id: NodeId) -> Option<u32> {
        self.resident.get(&id).copied()
    }

    fn free(&mut self, id: NodeId) {
        if let Some(k) = self.resident.remove(&id) {
            self.slots[k as usize] = None;
        }
    }
}

/// Compile the subgraph reachable from `output` into a [`Script`].
///
/// Every leaf is read through a deduplicated data slot. Each operation node
/// gets the first free cache slot (the last one writes the output) and its
/// operands' cache slots are freed right after the record that last reads
/// them. A leaf output compiles to a single [`OpCode::Copy`].
pub(crate) fn compile<F: Numeric>(graph: &Graph<F>, output: NodeId) -> Result<Script> {
    let order = topological_order(graph, output)?;

    let mut last_use: HashMap<NodeId, usize> = HashMap::new();
    let mut refs: HashMap<NodeId, usize> = HashMap::new();
    for (pos, &id) in order.iter().enumerate() {
        for operand in graph.node(id)?.op().operands() {
            last_use.insert(operand, pos);
            *refs.entry(operand).or_default() += 1;
        }
    }

    let mut data: Vec<NodeId> = Vec::new();
    let mut data_index: HashMap<NodeId, u32> = HashMap::new();
    let mut cache = CacheSlots::default();
    let mut records = Vec::new();
    let mut nodes = Vec::new();
    let mut leaves_inlined = 0;
    let last = order.len() - 1;

    for (pos, &id) in order.iter().enumerate() {
        let (opcode, a, b) = match graph.node(id)?.op() {
            NodeOp::Leaf => {
                data_index.entry(id).or_insert_with(|| {
                    data.push(id);
                    (data.len() - 1) as u32
                });
                if refs.get(&id) == Some(&1) {
                    leaves_inlined += 1;
                }
                if pos == last {
                    records.push(OperationRecord {
                        opcode: OpCode::Copy,
                        result: Slot::Output,
                        left: Slot::Data(data_index[&id]),
                        right: None,
                    });
                    nodes.push(id);
                }
                continue;
            }
            NodeOp::Unary(op, a) => (op, a, None),
            NodeOp::Binary(op, a, b) => (op, a, Some(b)),
        };

        let resolve = |operand: NodeId| -> Result<Slot> {
            if let Some(k) = cache.get(operand) {
                Ok(Slot::Cache(k))
            } else if let Some(&k) = data_index.get(&operand) {
                Ok(Slot::Data(k))
            } else {
                Err(Error::InternalInconsistency(format!(
                    "operand {operand} of {id} has no slot at position {pos}"
                )))
            }
        };
        let left = resolve(a)?;
        let right = b.map(resolve).transpose()?;

        let result = if pos == last {
            Slot::Output
        } else {
            Slot::Cache(cache.allocate(id))
        };
        let record = OperationRecord {
            opcode,
            result,
            left,
            right,
        };
        log::trace!("{:>4}: {record} ; {id}", records.len());
        records.push(record);
        nodes.push(id);

        for operand in std::iter::once(a).chain(b) {
            if last_use.get(&operand) == Some(&pos) {
                cache.free(operand);
            }
        }
    }

    let stats = CompileStats {
        records: records.len(),
        data_slots: data.len(),
        cache_slots: cache.slots.len(),
        reused_slots: cache.reused,
        leaves_inlined,
    };
    let script = Script {
        output,
        records,
        nodes,
        data,
        cache_size: cache.slots.len(),
        stats,
    };
    debug_assert!(
        script.validate().is_ok(),
        "compiled script failed validation:\n{script}"
    );
    log::debug!("compiled {output}: {stats}");
    Ok(script)
}
