use crate::buffer::{Buffer, BufferManager, Location};
use crate::device::{Accelerator, DeviceBlock};
use crate::error::{Error, Result};
use crate::float::Numeric;
use crate::graph::{Graph, NodeId};
use crate::shape::Shape;

use super::{blocks, check_supported, eval_at, lease_all};

/// Associative, commutative combiner for [`Graph::reduce`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Reduction {
    Sum,
    Prod,
    Min,
    Max,
}

impl Reduction {
    #[inline]
    pub fn combine<F: Numeric>(self, a: F, b: F) -> F {
        match self {
            Reduction::Sum => a + b,
            Reduction::Prod => a * b,
            Reduction::Min => a.min(b),
            Reduction::Max => a.max(b),
        }
    }

    /// Result of reducing zero elements.
    pub fn identity<F: Numeric>(self) -> F {
        match self {
            Reduction::Sum => F::zero(),
            Reduction::Prod => F::one(),
            Reduction::Min => F::infinity(),
            Reduction::Max => F::neg_infinity(),
        }
    }
}

/// A row-major tensor viewed as `outer × n × inner` around the reduced axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct AxisLayout {
    pub outer: usize,
    pub n: usize,
    pub inner: usize,
}

impl AxisLayout {
    pub fn new(shape: &Shape, axis: usize) -> Result<Self> {
        shape.check_axis(axis)?;
        let dims = shape.dims();
        Ok(AxisLayout {
            outer: dims[..axis].iter().product(),
            n: dims[axis],
            inner: dims[axis + 1..].iter().product(),
        })
    }

    /// The whole of a flat buffer as one axis.
    pub fn flat(len: usize) -> Self {
        AxisLayout {
            outer: 1,
            n: len,
            inner: 1,
        }
    }

    #[inline]
    fn offset(&self, o: usize, k: usize, j: usize) -> usize {
        (o * self.n + k) * self.inner + j
    }

    fn reduced_len(&self) -> usize {
        self.outer * self.inner
    }
}

/// Per-coordinate value read by a fold pass, with the worker's workspace.
type Source<'a, F> = dyn Fn(usize, &[&[F]], &mut Vec<F>) -> F + Sync + 'a;

/// Fold runs of `fan_in` entries along the axis of `layout` into `out`.
fn launch_pass<F: Numeric>(
    acc: &dyn Accelerator<F>,
    inputs: &[&DeviceBlock],
    out: &DeviceBlock,
    layout: AxisLayout,
    fan_in: usize,
    reduction: Reduction,
    value: &Source<'_, F>,
) -> Result<usize> {
    let m = layout.n.div_ceil(fan_in);
    let len = layout.outer * m * layout.inner;
    acc.launch(len, inputs, &[out], &|idx, ins, row, scratch| {
        let j = idx % layout.inner;
        let rest = idx / layout.inner;
        let (o, run) = (rest / m, rest % m);
        let start = run * fan_in;
        let end = (start + fan_in).min(layout.n);
        let mut folded = value(layout.offset(o, start, j), ins, scratch);
        for k in start + 1..end {
            folded = reduction.combine(folded, value(layout.offset(o, k, j), ins, scratch));
        }
        row[0] = folded;
    })?;
    Ok(m)
}

/// Tree-reduce the axis of `layout` to size 1.
///
/// The first pass reads values through `first` from `inputs`; later passes
/// fold the previous pass's buffer with the same fan-in until one entry per
/// `outer × inner` position remains. Returns a buffer of
/// `layout.outer * layout.inner` elements. `layout.n` must be non-zero.
pub(crate) fn tree_reduce<F: Numeric>(
    buffers: &BufferManager<F>,
    layout: AxisLayout,
    fan_in: usize,
    reduction: Reduction,
    inputs: &[&DeviceBlock],
    first: &Source<'_, F>,
) -> Result<Buffer<F>> {
    let acc = buffers.accelerator().as_ref();
    let fan_in = fan_in.max(crate::config::MIN_REDUCE_FAN_IN);

    let mut m = layout.n.div_ceil(fan_in);
    let mut current = buffers.allocate(layout.outer * m * layout.inner);
    {
        let out = current.lease(Location::Accelerator)?;
        launch_pass(acc, inputs, out.require_block()?, layout, fan_in, reduction, first)?;
    }

    let mut passes = 1;
    while m > 1 {
        let pass_layout = AxisLayout { n: m, ..layout };
        let next = buffers.allocate(layout.outer * m.div_ceil(fan_in) * layout.inner);
        {
            let src = current.lease(Location::Accelerator)?;
            let dst = next.lease(Location::Accelerator)?;
            m = launch_pass(
                acc,
                &[src.require_block()?],
                dst.require_block()?,
                pass_layout,
                fan_in,
                reduction,
                &|c, ins, _| ins[0][c],
            )?;
        }
        buffers.release(&current)?;
        current = next;
        passes += 1;
    }
    acc.synchronize();
    log::trace!(
        "tree reduce {}x{}x{} with fan-in {fan_in}: {passes} passes",
        layout.outer,
        layout.n,
        layout.inner
    );
    Ok(current)
}

impl<F: Numeric> Graph<F> {
    /// Reduce `id`'s value along `axis` (the last axis when `None`).
    ///
    /// Evaluates the node's script directly inside the first fold pass, so
    /// the full unreduced value is never materialized. Returns the reduced
    /// shape (the axis set to 1) and its values.
    pub fn reduce(
        &mut self,
        id: NodeId,
        axis: Option<usize>,
        reduction: Reduction,
    ) -> Result<(Shape, Vec<F>)> {
        let shape = self.node(id)?.shape().clone();
        let axis = match axis {
            Some(axis) => axis,
            None => shape
                .rank()
                .checked_sub(1)
                .ok_or(Error::AxisOutOfRange { axis: 0, rank: 0 })?,
        };
        let layout = AxisLayout::new(&shape, axis)?;
        let reduced = shape.with_dim(axis, 1)?;
        if layout.n == 0 || layout.reduced_len() == 0 {
            return Ok((reduced.clone(), vec![reduction.identity(); reduced.len()]));
        }

        let script = self.script(id)?;
        let acc = self.buffers().accelerator().clone();
        check_supported(acc.as_ref(), &script)?;
        let data = self.data_buffers(&script)?;
        let leases = lease_all(&data)?;
        let inputs = blocks(&leases)?;

        let records = script.records();
        let cache_size = script.cache_size();
        let result = tree_reduce(
            self.buffers(),
            layout,
            self.config().reduce_fan_in,
            reduction,
            &inputs,
            &|c, ins, scratch| {
                scratch.resize(cache_size, F::zero());
                eval_at(records, ins, c, scratch)
            },
        )?;
        drop(inputs);
        drop(leases);

        let values = result.to_vec()?;
        self.buffers().release(&result)?;
        log::debug!("reduce {id} {reduction:?} over axis {axis}: {shape} -> {reduced}");
        Ok((reduced, values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimulatedAccelerator;
    use std::sync::Arc;

    #[test]
    fn layout_offsets() {
        let l = AxisLayout::new(&Shape::new([2, 3, 4]), 1).unwrap();
        assert_eq!(l, AxisLayout { outer: 2, n: 3, inner: 4 });
        assert_eq!(l.offset(1, 2, 3), 23);
        assert!(AxisLayout::new(&Shape::new([2]), 1).is_err());
    }

    #[test]
    fn identities() {
        assert_eq!(Reduction::Sum.identity::<f64>(), 0.0);
        assert_eq!(Reduction::Prod.identity::<f64>(), 1.0);
        assert_eq!(Reduction::Min.combine(2.0f32, -1.0), -1.0);
        assert_eq!(Reduction::Max.combine(2.0f32, -1.0), 2.0);
    }

    #[test]
    fn flat_tree_reduce_needs_multiple_passes() {
        let dev = Arc::new(SimulatedAccelerator::<f64>::new(4096));
        let mgr = BufferManager::new(dev.clone() as Arc<dyn Accelerator<f64>>);
        let src = mgr.allocate_from((1..=1000).map(f64::from).collect());
        let lease = src.lease(Location::Accelerator).unwrap();
        let out = tree_reduce(
            &mgr,
            AxisLayout::flat(1000),
            4,
            Reduction::Sum,
            &[lease.require_block().unwrap()],
            &|c, ins, _| ins[0][c],
        )
        .unwrap();
        drop(lease);
        assert_eq!(out.to_vec().unwrap(), vec![500_500.0]);
        // 1000 -> 250 -> 63 -> 16 -> 4 -> 1
        assert!(dev.counters().launches >= 5);
    }
}
