//! Script execution on an [`Accelerator`].
//!
//! The forward executor launches one per-coordinate program over the output
//! domain: each coordinate interprets the script's records with a private
//! scratch array of [`Script::cache_size`] values and writes the last
//! record's result into the output buffer. Coordinates never communicate.
//!
//! Data buffers whose length is 1 broadcast: every coordinate reads element 0.

mod reduce;

pub use self::reduce::Reduction;
pub(crate) use self::reduce::{tree_reduce, AxisLayout};

use crate::buffer::{Buffer, BufferLease, Location};
use crate::device::{Accelerator, DeviceBlock};
use crate::error::{Error, Result};
use crate::float::Numeric;
use crate::opcode::{self, OpCode};
use crate::script::{OperationRecord, Script, Slot};

/// Element `i` of `data`, or element 0 for a broadcast scalar.
#[inline]
pub(crate) fn broadcast_get<F: Copy>(data: &[F], i: usize) -> F {
    if data.len() == 1 {
        data[0]
    } else {
        data[i]
    }
}

#[inline]
fn read<F: Numeric>(slot: Slot, inputs: &[&[F]], i: usize, scratch: &[F], out: F) -> F {
    match slot {
        Slot::Data(k) => broadcast_get(inputs[k as usize], i),
        Slot::Cache(k) => scratch[k as usize],
        Slot::Output => out,
    }
}

/// Interpret `records` at coordinate `i`, returning the output value.
///
/// `inputs` are the data slots' contents; `scratch` must hold at least
/// `cache_size` elements.
#[inline]
pub(crate) fn eval_at<F: Numeric>(
    records: &[OperationRecord],
    inputs: &[&[F]],
    i: usize,
    scratch: &mut [F],
) -> F {
    let mut out = F::zero();
    for rec in records {
        let a = read(rec.left, inputs, i, scratch, out);
        let b = rec
            .right
            .map_or_else(F::zero, |s| read(s, inputs, i, scratch, out));
        let v = opcode::eval_forward(rec.opcode, a, b);
        match rec.result {
            Slot::Cache(k) => scratch[k as usize] = v,
            Slot::Output => out = v,
            Slot::Data(_) => {}
        }
    }
    out
}

/// Fail with [`Error::UnsupportedOperation`] if the backend lacks any opcode of `script`.
pub(crate) fn check_supported<F: Numeric>(acc: &dyn Accelerator<F>, script: &Script) -> Result<()> {
    match script.records().iter().find(|r| !acc.supports(r.opcode)) {
        Some(rec) => Err(Error::UnsupportedOperation {
            op: rec.opcode,
            backend: acc.name().to_string(),
        }),
        None => Ok(()),
    }
}

/// Lease every buffer on the accelerator.
///
/// Locks are taken in [`BufferId`](crate::BufferId) order so that two
/// launches sharing buffers always acquire them in the same sequence. The
/// returned leases are in the order of `buffers`.
pub(crate) fn lease_all<F: Numeric>(buffers: &[Buffer<F>]) -> Result<Vec<BufferLease<'_, F>>> {
    let mut order: Vec<usize> = (0..buffers.len()).collect();
    order.sort_by_key(|&i| buffers[i].id());
    let mut leases: Vec<Option<BufferLease<'_, F>>> = buffers.iter().map(|_| None).collect();
    for i in order {
        leases[i] = Some(buffers[i].lease(Location::Accelerator)?);
    }
    leases
        .into_iter()
        .map(|lease| {
            lease.ok_or_else(|| Error::InternalInconsistency("buffer left unleased".to_string()))
        })
        .collect()
}

pub(crate) fn blocks<'a, F: Numeric>(leases: &'a [BufferLease<'_, F>]) -> Result<Vec<&'a DeviceBlock>> {
    leases.iter().map(BufferLease::require_block).collect()
}

/// Run `script` over every coordinate of `output`.
pub(crate) fn forward<F: Numeric>(
    acc: &dyn Accelerator<F>,
    script: &Script,
    data: &[Buffer<F>],
    output: &Buffer<F>,
) -> Result<()> {
    check_supported(acc, script)?;

    let data_leases = lease_all(data)?;
    let inputs = blocks(&data_leases)?;
    let out = output.lease(Location::Accelerator)?;

    let records = script.records();
    if let [OperationRecord {
        opcode: OpCode::Copy,
        left: Slot::Data(k),
        ..
    }] = records
    {
        let src = inputs[*k as usize];
        if src.len() == output.len() {
            acc.copy(src, out.require_block()?)?;
            log::trace!("forward {}: device copy", script.output());
            return Ok(());
        }
    }

    let cache_size = script.cache_size();
    acc.launch(output.len(), &inputs, &[out.require_block()?], &|i, ins, row, scratch| {
        scratch.resize(cache_size, F::zero());
        row[0] = eval_at(records, ins, i, scratch);
    })?;
    acc.synchronize();
    log::trace!(
        "forward {}: {} records over {} coordinates",
        script.output(),
        script.len(),
        output.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferManager;
    use crate::device::SimulatedAccelerator;
    use crate::graph::NodeId;
    use crate::script::CompileStats;
    use std::sync::Arc;

    #[test]
    fn interpreter_uses_scratch_and_broadcast() {
        // out = (d0 + d1) * d0, with d1 a broadcast scalar
        let records = [
            OperationRecord {
                opcode: OpCode::Add,
                result: Slot::Cache(0),
                left: Slot::Data(0),
                right: Some(Slot::Data(1)),
            },
            OperationRecord {
                opcode: OpCode::Mul,
                result: Slot::Output,
                left: Slot::Cache(0),
                right: Some(Slot::Data(0)),
            },
        ];
        let x = [1.0, 2.0, 3.0];
        let k = [10.0];
        let inputs: [&[f64]; 2] = [&x, &k];
        let mut scratch = [0.0];
        let got: Vec<f64> = (0..3)
            .map(|i| eval_at(&records, &inputs, i, &mut scratch))
            .collect();
        assert_eq!(got, vec![11.0, 24.0, 39.0]);
    }

    #[test]
    fn copy_script_uses_device_copy() {
        let dev = Arc::new(SimulatedAccelerator::<f64>::new(64));
        let mgr = BufferManager::new(dev.clone() as Arc<dyn Accelerator<f64>>);
        let src = mgr.allocate_from(vec![1.0, 2.0, 3.0]);
        let dst = mgr.allocate(3);
        let script = Script {
            output: NodeId(0),
            records: vec![OperationRecord {
                opcode: OpCode::Copy,
                result: Slot::Output,
                left: Slot::Data(0),
                right: None,
            }],
            nodes: vec![NodeId(0)],
            data: vec![NodeId(0)],
            cache_size: 0,
            stats: CompileStats::default(),
        };
        forward(dev.as_ref(), &script, &[src], &dst).unwrap();
        assert_eq!(dev.counters().launches, 0);
        assert_eq!(dst.to_vec().unwrap(), vec![1.0, 2.0, 3.0]);
    }
}
