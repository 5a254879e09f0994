//! Reverse-mode gradients over a compiled script.
//!
//! The backward pass reuses the output's forward [`Script`]. A
//! [`BackwardPlan`] replaces cache slots (which are recycled during forward
//! execution) with direct references to the record that produced each
//! operand. Each coordinate then runs one forward trace over all records,
//! seeds the last record's adjoint with 1 and sweeps the records in reverse,
//! accumulating `partial × adjoint` into operand adjoints. Since every
//! consumer comes after its operands in the schedule, a record's adjoint is
//! complete by the time the sweep reaches it.
//!
//! Gradients accumulate into the targets' gradient buffers (`+=`). They are
//! never reset implicitly; call [`Graph::zero_gradient`] between passes unless
//! accumulation is wanted.

use std::collections::HashMap;

use crate::buffer::{Buffer, Location};
use crate::error::{Error, Result};
use crate::exec::{self, broadcast_get, AxisLayout, Reduction};
use crate::float::Numeric;
use crate::graph::{Graph, NodeId};
use crate::opcode::{self, OpCode};
use crate::script::{Script, Slot};

/// Where a record reads an operand from, once cache slots are resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Operand {
    /// Result of an earlier record.
    Record(usize),
    /// Data slot.
    Data(usize),
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct PlannedRecord {
    pub opcode: OpCode,
    pub left: Operand,
    pub right: Option<Operand>,
}

/// A script's records with operands resolved to producing records.
#[derive(Clone, Debug)]
pub(crate) struct BackwardPlan {
    pub records: Vec<PlannedRecord>,
    pub data_len: usize,
}

impl BackwardPlan {
    pub fn new(script: &Script) -> Result<Self> {
        let mut writer: HashMap<Slot, usize> = HashMap::new();
        let mut records = Vec::with_capacity(script.len());
        for (i, rec) in script.records().iter().enumerate() {
            let resolve = |slot: Slot| match slot {
                Slot::Data(k) => Ok(Operand::Data(k as usize)),
                other => writer.get(&other).map(|&r| Operand::Record(r)).ok_or_else(|| {
                    Error::InternalInconsistency(format!("record {i} reads unwritten slot {other}"))
                }),
            };
            let left = resolve(rec.left)?;
            let right = rec.right.map(resolve).transpose()?;
            records.push(PlannedRecord {
                opcode: rec.opcode,
                left,
                right,
            });
            writer.insert(rec.result, i);
        }
        Ok(BackwardPlan {
            records,
            data_len: script.data().len(),
        })
    }

    #[inline]
    fn read<F: Numeric>(operand: Operand, values: &[F], inputs: &[&[F]], i: usize) -> F {
        match operand {
            Operand::Record(r) => values[r],
            Operand::Data(k) => broadcast_get(inputs[k], i),
        }
    }

    /// Adjoints of every record and data slot at coordinate `i`.
    ///
    /// `values` and `adjoints` must hold one entry per record, `data_adjoints`
    /// one per data slot.
    pub fn sweep<F: Numeric>(
        &self,
        inputs: &[&[F]],
        i: usize,
        values: &mut [F],
        adjoints: &mut [F],
        data_adjoints: &mut [F],
    ) {
        for (r, rec) in self.records.iter().enumerate() {
            let a = Self::read(rec.left, values, inputs, i);
            let b = rec
                .right
                .map_or_else(F::zero, |o| Self::read(o, values, inputs, i));
            values[r] = opcode::eval_forward(rec.opcode, a, b);
        }

        adjoints.iter_mut().for_each(|v| *v = F::zero());
        data_adjoints.iter_mut().for_each(|v| *v = F::zero());
        let Some(last) = self.records.len().checked_sub(1) else {
            return;
        };
        adjoints[last] = F::one();

        for (r, rec) in self.records.iter().enumerate().rev() {
            let g = adjoints[r];
            if g == F::zero() {
                continue;
            }
            let a = Self::read(rec.left, values, inputs, i);
            let b = rec
                .right
                .map_or_else(F::zero, |o| Self::read(o, values, inputs, i));
            let (da, db) = opcode::reverse_partials(rec.opcode, a, b, values[r]);
            let mut accumulate = |operand: Operand, d: F| match operand {
                Operand::Record(p) => adjoints[p] = adjoints[p] + d * g,
                Operand::Data(k) => data_adjoints[k] = data_adjoints[k] + d * g,
            };
            accumulate(rec.left, da);
            if let Some(right) = rec.right {
                accumulate(right, db);
            }
        }
    }
}

/// One gradient buffer the pass contributes to.
enum Target {
    Record(usize),
    Data(usize),
}

impl<F: Numeric> Graph<F> {
    /// Accumulate d`output`/d`x` into the gradient buffer of every
    /// gradient-tracked node `x` in `output`'s subgraph.
    ///
    /// Runs the forward pass first if `output`'s value is stale. Trainable
    /// leaves always receive a contribution; interior nodes only when they
    /// were marked as outputs (and so own a gradient buffer). A broadcast
    /// scalar leaf receives the sum of its contributions over the domain.
    pub fn backward(&mut self, output: NodeId) -> Result<()> {
        self.materialize(output)?;
        let script = self.script(output)?;
        let acc = self.buffers().accelerator().clone();
        exec::check_supported(acc.as_ref(), &script)?;
        let plan = BackwardPlan::new(&script)?;
        let domain = self.node(output)?.len();

        let mut targets = Vec::new();
        let mut grads: Vec<Buffer<F>> = Vec::new();
        for (k, &leaf) in script.data().iter().enumerate() {
            if let Some(g) = self.node(leaf)?.gradient_buffer() {
                targets.push(Target::Data(k));
                grads.push(g.clone());
            }
        }
        for (r, &id) in script.nodes().iter().enumerate() {
            let node = self.node(id)?;
            if node.is_leaf() {
                continue;
            }
            if let Some(g) = node.gradient_buffer() {
                targets.push(Target::Record(r));
                grads.push(g.clone());
            }
        }
        if targets.is_empty() {
            log::debug!("backward {output}: nothing tracks gradients");
            return Ok(());
        }

        // Full-length gradients accumulate in place; broadcast ones get a
        // scratch buffer that is summed afterwards.
        let scratch: Vec<Option<Buffer<F>>> = grads
            .iter()
            .map(|g| (g.len() != domain).then(|| self.buffers().allocate(domain)))
            .collect();

        let data = self.data_buffers(&script)?;
        {
            let accum: Vec<Buffer<F>> = grads
                .iter()
                .zip(&scratch)
                .filter(|(_, s)| s.is_none())
                .map(|(g, _)| g.clone())
                .collect();
            let (n_data, n_accum) = (data.len(), accum.len());
            let leased: Vec<Buffer<F>> = data
                .iter()
                .chain(&accum)
                .chain(scratch.iter().flatten())
                .cloned()
                .collect();
            let leases = exec::lease_all(&leased)?;
            let all_blocks = exec::blocks(&leases)?;
            let inputs = &all_blocks[..n_data + n_accum];
            let accum_blocks = &all_blocks[n_data..n_data + n_accum];
            let scratch_blocks = &all_blocks[n_data + n_accum..];

            // Output j reads its running total from input `accum_input[j]`.
            let mut outputs = Vec::with_capacity(targets.len());
            let mut accum_input = Vec::with_capacity(targets.len());
            let (mut next_accum, mut next_scratch) = (0, 0);
            for s in &scratch {
                if s.is_some() {
                    outputs.push(scratch_blocks[next_scratch]);
                    accum_input.push(None);
                    next_scratch += 1;
                } else {
                    outputs.push(accum_blocks[next_accum]);
                    accum_input.push(Some(plan.data_len + next_accum));
                    next_accum += 1;
                }
            }

            let n_records = plan.records.len();
            let plan = &plan;
            let targets = &targets;
            let accum_input = &accum_input;
            acc.launch(domain, inputs, &outputs, &|i, ins, row, work| {
                work.resize(2 * n_records + plan.data_len, F::zero());
                let (values, rest) = work.split_at_mut(n_records);
                let (adjoints, data_adjoints) = rest.split_at_mut(n_records);
                plan.sweep(&ins[..plan.data_len], i, values, adjoints, data_adjoints);
                for (j, target) in targets.iter().enumerate() {
                    let contribution = match *target {
                        Target::Record(r) => adjoints[r],
                        Target::Data(k) => data_adjoints[k],
                    };
                    row[j] = match accum_input[j] {
                        Some(slot) => ins[slot][i] + contribution,
                        None => contribution,
                    };
                }
            })?;
            acc.synchronize();
        }

        for (grad, partial) in grads.iter().zip(&scratch) {
            let Some(partial) = partial else { continue };
            let total = {
                let lease = partial.lease(Location::Accelerator)?;
                let summed = exec::tree_reduce(
                    self.buffers(),
                    AxisLayout::flat(domain),
                    self.config().reduce_fan_in,
                    Reduction::Sum,
                    &[lease.require_block()?],
                    &|c, ins, _| ins[0][c],
                )?;
                drop(lease);
                let total = summed.to_vec()?;
                self.buffers().release(&summed)?;
                total
            };
            self.buffers().release(partial)?;
            grad.update_host(|g| {
                for (dst, &src) in g.iter_mut().zip(&total) {
                    *dst = *dst + src;
                }
            })?;
        }

        log::debug!(
            "backward {output}: {} records, {} gradient targets over {domain} coordinates",
            plan.records.len(),
            targets.len()
        );
        Ok(())
    }

    /// Gradient-descent step: `content -= learning_rate * gradient` on a leaf.
    ///
    /// The gradient is left as is. Nodes computed from the leaf are invalidated.
    pub fn apply_gradient(&mut self, leaf: NodeId, learning_rate: F) -> Result<()> {
        let node = self.node(leaf)?;
        if !node.is_leaf() {
            return Err(Error::NotALeaf(leaf));
        }
        let grad = node.gradient_buffer().ok_or(Error::NoGradient(leaf))?.clone();
        let content = node
            .content()
            .ok_or_else(|| Error::InternalInconsistency(format!("leaf {leaf} has no content")))?
            .clone();
        let acc = self.buffers().accelerator().clone();
        {
            let c = content.lease(Location::Accelerator)?;
            let g = grad.lease(Location::Accelerator)?;
            let cb = c.require_block()?;
            acc.launch(content.len(), &[cb, g.require_block()?], &[cb], &|i, ins, row, _| {
                row[0] = ins[0][i] - learning_rate * ins[1][i];
            })?;
            acc.synchronize();
        }
        self.invalidate(leaf);
        Ok(())
    }

    /// Reset a node's gradient buffer to zero.
    pub fn zero_gradient(&mut self, id: NodeId) -> Result<()> {
        self.node(id)?
            .gradient_buffer()
            .ok_or(Error::NoGradient(id))?
            .zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use approx::assert_relative_eq;

    fn graph() -> Graph<f64> {
        Graph::new(Config::default().with_accelerator_capacity(4096))
    }

    #[test]
    fn plan_resolves_recycled_cache_slots() {
        let mut g = graph();
        let x = g.leaf([1], &[0.3], true).unwrap();
        let a = g.sigmoid(x).unwrap();
        let b = g.tanh(a).unwrap();
        let c = g.exp(b).unwrap();
        let script = g.compile(c).unwrap();
        let plan = BackwardPlan::new(&script).unwrap();
        assert_eq!(plan.records[0].left, Operand::Data(0));
        assert_eq!(plan.records[1].left, Operand::Record(0));
        assert_eq!(plan.records[2].left, Operand::Record(1));
    }

    #[test]
    fn chain_rule_through_unary_ops() {
        let mut g = graph();
        let x0 = 0.3;
        let x = g.leaf([1], &[x0], true).unwrap();
        let s = g.sigmoid(x).unwrap();
        let y = g.tanh(s).unwrap();
        g.backward(y).unwrap();

        let sv = 1.0 / (1.0 + f64::exp(-x0));
        let expected = (1.0 - sv.tanh().powi(2)) * sv * (1.0 - sv);
        assert_relative_eq!(g.gradient(x).unwrap()[0], expected, epsilon = 1e-12);
    }

    #[test]
    fn broadcast_scalar_gets_summed_gradient() {
        let mut g = graph();
        let w = g.leaf([1], &[2.0], true).unwrap();
        let x = g.leaf([4], &[1.0, 2.0, 3.0, 4.0], false).unwrap();
        let y = g.mul(w, x).unwrap();
        g.backward(y).unwrap();
        assert_relative_eq!(g.gradient(w).unwrap()[0], 10.0);
        // Seed of the output itself.
        assert_eq!(g.gradient(y).unwrap(), vec![1.0; 4]);
    }

    #[test]
    fn squared_leaf_counts_both_operands() {
        let mut g = graph();
        let x = g.leaf([3], &[1.0, -2.0, 0.5], true).unwrap();
        let y = g.mul(x, x).unwrap();
        g.backward(y).unwrap();
        assert_eq!(g.gradient(x).unwrap(), vec![2.0, -4.0, 1.0]);
    }

    #[test]
    fn apply_gradient_updates_and_invalidates() {
        let mut g = graph();
        let w = g.leaf([2], &[1.0, 2.0], true).unwrap();
        let y = g.mul(w, w).unwrap();
        g.backward(y).unwrap();
        g.apply_gradient(w, 0.25).unwrap();
        // w -= 0.25 * 2w
        assert_eq!(g.value(w).unwrap(), vec![0.5, 1.0]);
        assert!(!g.node(y).unwrap().has_cached_result());
        assert_eq!(g.value(y).unwrap(), vec![0.25, 1.0]);
        // Gradient untouched by the update.
        assert_eq!(g.gradient(w).unwrap(), vec![2.0, 4.0]);
    }

    #[test]
    fn errors_on_untracked_nodes() {
        let mut g = graph();
        let x = g.leaf([1], &[1.0], false).unwrap();
        let y = g.exp(x).unwrap();
        g.backward(y).unwrap();
        assert!(matches!(g.gradient(x), Err(Error::NoGradient(_))));
        assert!(matches!(g.zero_gradient(x), Err(Error::NoGradient(_))));
        assert!(matches!(g.apply_gradient(y, 0.1), Err(Error::NotALeaf(_))));
    }
}
