//! Compiled scripts: the linear instruction form of a subgraph.
//!
//! A [`Script`] is an ordered list of [`OperationRecord`]s. Each record reads
//! its operands from [`Slot`]s and writes its result to a slot:
//!
//! - `Data(k)`: the content buffer of the `k`-th leaf in [`Script::data`],
//! - `Cache(k)`: a per-coordinate scratch value that lives for one execution,
//! - `Output`: the materialized result, written only by the last record.
//!
//! Every operand slot read by record `i` is either a data slot or was written
//! by some record `j < i` and not overwritten since. The compiler guarantees
//! this by construction; [`Script::validate`] re-checks the population order.

use std::fmt;

use crate::error::{Error, Result};
use crate::graph::NodeId;
use crate::opcode::OpCode;

mod compile;

pub(crate) use self::compile::compile;

/// Operand or result location of a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Slot {
    Data(u32),
    Cache(u32),
    Output,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Data(k) => write!(f, "d{k}"),
            Slot::Cache(k) => write!(f, "c{k}"),
            Slot::Output => f.write_str("out"),
        }
    }
}

/// One instruction of a script.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationRecord {
    pub opcode: OpCode,
    pub result: Slot,
    pub left: Slot,
    /// Present exactly when `opcode` is binary.
    pub right: Option<Slot>,
}

impl OperationRecord {
    pub fn operands(&self) -> impl Iterator<Item = Slot> {
        std::iter::once(self.left).chain(self.right)
    }
}

impl fmt::Display for OperationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {} {}", self.result, self.opcode, self.left)?;
        if let Some(right) = self.right {
            write!(f, ", {right}")?;
        }
        Ok(())
    }
}

/// Summary of one compilation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompileStats {
    pub records: usize,
    pub data_slots: usize,
    /// Peak number of simultaneously live cache slots.
    pub cache_slots: usize,
    /// Results that were placed in a previously freed cache slot.
    pub reused_slots: usize,
    /// Leaves with a single consumer.
    pub leaves_inlined: usize,
}

impl fmt::Display for CompileStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} records, {} data, {} cache ({} reused), {} leaves inlined",
            self.records, self.data_slots, self.cache_slots, self.reused_slots, self.leaves_inlined
        )
    }
}

/// Compiled form of the subgraph reachable from one output node.
#[derive(Clone, Debug)]
pub struct Script {
    pub(crate) output: NodeId,
    pub(crate) records: Vec<OperationRecord>,
    /// Node computed by each record.
    pub(crate) nodes: Vec<NodeId>,
    pub(crate) data: Vec<NodeId>,
    pub(crate) cache_size: usize,
    pub(crate) stats: CompileStats,
}

impl Script {
    pub fn output(&self) -> NodeId {
        self.output
    }

    pub fn records(&self) -> &[OperationRecord] {
        &self.records
    }

    /// Node each record computes, parallel to [`records`](Self::records).
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Leaves referenced by `Data` slots, in slot order.
    pub fn data(&self) -> &[NodeId] {
        &self.data
    }

    /// Number of scratch values one coordinate needs.
    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    pub fn stats(&self) -> CompileStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Check that every operand is a data slot or a cache slot written by an
    /// earlier record, and that only the last record writes the output.
    pub fn validate(&self) -> Result<()> {
        let fail = |i: usize, what: String| {
            Err(Error::InternalInconsistency(format!("record {i}: {what}")))
        };
        let Some(last) = self.records.len().checked_sub(1) else {
            return Err(Error::InternalInconsistency("empty script".to_string()));
        };
        if self.nodes.len() != self.records.len() {
            return fail(last, "node list out of step with records".to_string());
        }

        let mut written = vec![false; self.cache_size];
        for (i, rec) in self.records.iter().enumerate() {
            if rec.opcode.is_binary() != rec.right.is_some() {
                return fail(i, format!("{} with wrong operand count", rec.opcode));
            }
            for slot in rec.operands() {
                match slot {
                    Slot::Data(k) if (k as usize) < self.data.len() => {}
                    Slot::Cache(k) if written.get(k as usize).copied().unwrap_or(false) => {}
                    other => return fail(i, format!("reads unpopulated slot {other}")),
                }
            }
            match rec.result {
                Slot::Output if i == last => {}
                Slot::Cache(k) if (k as usize) < self.cache_size && i != last => {
                    written[k as usize] = true;
                }
                other => return fail(i, format!("writes invalid slot {other}")),
            }
        }
        Ok(())
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "script for {} ({})", self.output, self.stats)?;
        for (i, (rec, node)) in self.records.iter().zip(&self.nodes).enumerate() {
            writeln!(f, "  {i:>3}: {rec}  ; {node}")?;
        }
        Ok(())
    }
}
