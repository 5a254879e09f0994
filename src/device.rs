//! Accelerator contract and the in-process simulated accelerator.
//!
//! The buffer manager and executor talk to an accelerator only through the
//! [`Accelerator`] trait:
//!
//! - memory pool: [`allocate`](Accelerator::allocate) / [`free`](Accelerator::free)
//!   with a hard element capacity,
//! - transfers: [`upload`](Accelerator::upload) / [`download`](Accelerator::download),
//! - dispatch: [`launch`](Accelerator::launch) runs a per-index program over
//!   `0..len` with no ordering guarantee between indices, and
//!   [`synchronize`](Accelerator::synchronize) blocks until all launched work
//!   is complete.
//!
//! Capacities and sizes are counted in elements of `F`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

use crate::float::Numeric;
use crate::opcode::OpCode;

/// Identifies one accelerator; used by eviction's device filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

/// Owned handle to a block of accelerator memory.
///
/// Not `Clone`: a block has exactly one owner, which hands it back through
/// [`Accelerator::free`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct DeviceBlock {
    handle: u64,
    len: usize,
    device: DeviceId,
}

impl DeviceBlock {
    /// Build a block handle. Only accelerator implementations should call this.
    pub fn new(handle: u64, len: usize, device: DeviceId) -> Self {
        DeviceBlock {
            handle,
            len,
            device,
        }
    }

    #[inline]
    pub fn handle(&self) -> u64 {
        self.handle
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn device(&self) -> DeviceId {
        self.device
    }
}

/// Errors reported by an accelerator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// The pool cannot hold `requested` more elements.
    #[error("out of accelerator memory: requested {requested}, available {available}")]
    OutOfMemory { requested: usize, available: usize },
    /// The handle does not name a live block on this device.
    #[error("invalid device block {0}")]
    InvalidBlock(u64),
    /// A transfer whose host slice length differs from the block length.
    #[error("transfer of {actual} elements into a block of {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Per-index program run by [`Accelerator::launch`].
///
/// Called once per index with every input block's contents, a row holding one
/// result per output block, and a per-worker workspace. The workspace is
/// reused across the indices one worker runs, so its contents on entry are
/// whatever the previous call left; kernels resize and overwrite it.
pub type Kernel<'a, F> = dyn Fn(usize, &[&[F]], &mut [F], &mut Vec<F>) + Sync + 'a;

/// Common interface for accelerator backends.
///
/// # Implementing a New Backend
///
/// Blocks returned by `allocate` must be zero-filled. `launch` may run indices
/// in any order and in parallel, but must have completed every write by the
/// time `synchronize` returns.
pub trait Accelerator<F: Numeric>: Send + Sync {
    fn id(&self) -> DeviceId;

    /// Human-readable backend name, used in error messages.
    fn name(&self) -> &str;

    /// Total pool size in elements.
    fn capacity(&self) -> usize;

    /// Elements currently allocated.
    fn used(&self) -> usize;

    /// Allocate a zero-filled block of `len` elements.
    fn allocate(&self, len: usize) -> Result<DeviceBlock, DeviceError>;

    /// Return a block to the pool.
    fn free(&self, block: DeviceBlock);

    fn upload(&self, block: &DeviceBlock, data: &[F]) -> Result<(), DeviceError>;

    fn download(&self, block: &DeviceBlock, out: &mut [F]) -> Result<(), DeviceError>;

    fn fill(&self, block: &DeviceBlock, value: F) -> Result<(), DeviceError>;

    /// Device-to-device copy between blocks of equal length.
    fn copy(&self, src: &DeviceBlock, dst: &DeviceBlock) -> Result<(), DeviceError>;

    /// Whether the backend has an executor mapping for `op`.
    fn supports(&self, _op: OpCode) -> bool {
        true
    }

    /// Run `kernel` for every index in `0..len`.
    ///
    /// Output block `j` receives `row[j]` at each index; every output block
    /// must hold at least `len` elements. An output may also appear among the
    /// inputs as long as the kernel reads it only at its own index.
    fn launch(
        &self,
        len: usize,
        inputs: &[&DeviceBlock],
        outputs: &[&DeviceBlock],
        kernel: &Kernel<'_, F>,
    ) -> Result<(), DeviceError>;

    /// Block until all launched work has completed.
    fn synchronize(&self);
}

static NEXT_DEVICE_ID: AtomicU32 = AtomicU32::new(0);

/// Transfer and allocation counters of a [`SimulatedAccelerator`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceCounters {
    pub allocations: usize,
    pub frees: usize,
    pub uploads: usize,
    pub downloads: usize,
    pub launches: usize,
}

struct Pool<F> {
    blocks: HashMap<u64, Vec<F>>,
    used: usize,
    next_handle: u64,
    counters: DeviceCounters,
}

/// In-process accelerator whose blocks live in host memory.
///
/// Enforces a hard element capacity so that exhaustion and eviction behave as
/// on a real device. Launches run on the rayon pool when the `parallel`
/// feature is enabled and the instance was created with parallelism on.
pub struct SimulatedAccelerator<F: Numeric> {
    id: DeviceId,
    name: String,
    capacity: usize,
    parallel: bool,
    unsupported: HashSet<OpCode>,
    pool: Mutex<Pool<F>>,
}

impl<F: Numeric> SimulatedAccelerator<F> {
    pub fn new(capacity: usize) -> Self {
        let id = DeviceId(NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed));
        SimulatedAccelerator {
            id,
            name: format!("simulated:{}", id.0),
            capacity,
            parallel: true,
            unsupported: HashSet::new(),
            pool: Mutex::new(Pool {
                blocks: HashMap::new(),
                used: 0,
                next_handle: 0,
                counters: DeviceCounters::default(),
            }),
        }
    }

    /// Toggle parallel dispatch (serial when the `parallel` feature is off).
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Pretend the backend lacks a mapping for `ops`.
    pub fn with_unsupported(mut self, ops: &[OpCode]) -> Self {
        self.unsupported.extend(ops.iter().copied());
        self
    }

    pub fn counters(&self) -> DeviceCounters {
        self.pool.lock().counters
    }

    /// Number of live blocks.
    pub fn live_blocks(&self) -> usize {
        self.pool.lock().blocks.len()
    }

    fn run_rows(&self, len: usize, width: usize, inputs: &[&[F]], kernel: &Kernel<'_, F>) -> Vec<F> {
        let mut rows = vec![F::zero(); len * width];
        if width == 0 {
            return rows;
        }

        #[cfg(feature = "parallel")]
        if self.parallel {
            use rayon::prelude::*;
            rows.par_chunks_mut(width)
                .enumerate()
                .for_each_init(Vec::new, |scratch, (i, row)| kernel(i, inputs, row, scratch));
            return rows;
        }

        let mut scratch = Vec::new();
        for (i, row) in rows.chunks_mut(width).enumerate() {
            kernel(i, inputs, row, &mut scratch);
        }
        rows
    }
}

impl<F: Numeric> Accelerator<F> for SimulatedAccelerator<F> {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn used(&self) -> usize {
        self.pool.lock().used
    }

    fn allocate(&self, len: usize) -> Result<DeviceBlock, DeviceError> {
        let mut pool = self.pool.lock();
        let available = self.capacity - pool.used;
        if len > available {
            return Err(DeviceError::OutOfMemory {
                requested: len,
                available,
            });
        }
        let handle = pool.next_handle;
        pool.next_handle += 1;
        pool.used += len;
        pool.counters.allocations += 1;
        pool.blocks.insert(handle, vec![F::zero(); len]);
        Ok(DeviceBlock::new(handle, len, self.id))
    }

    fn free(&self, block: DeviceBlock) {
        let mut pool = self.pool.lock();
        if pool.blocks.remove(&block.handle).is_some() {
            pool.used -= block.len;
            pool.counters.frees += 1;
        }
    }

    fn upload(&self, block: &DeviceBlock, data: &[F]) -> Result<(), DeviceError> {
        let mut pool = self.pool.lock();
        let dst = pool
            .blocks
            .get_mut(&block.handle)
            .ok_or(DeviceError::InvalidBlock(block.handle))?;
        if dst.len() != data.len() {
            return Err(DeviceError::LengthMismatch {
                expected: dst.len(),
                actual: data.len(),
            });
        }
        dst.copy_from_slice(data);
        pool.counters.uploads += 1;
        Ok(())
    }

    fn download(&self, block: &DeviceBlock, out: &mut [F]) -> Result<(), DeviceError> {
        let mut pool = self.pool.lock();
        let src = pool
            .blocks
            .get(&block.handle)
            .ok_or(DeviceError::InvalidBlock(block.handle))?;
        if src.len() != out.len() {
            return Err(DeviceError::LengthMismatch {
                expected: src.len(),
                actual: out.len(),
            });
        }
        out.copy_from_slice(src);
        pool.counters.downloads += 1;
        Ok(())
    }

    fn fill(&self, block: &DeviceBlock, value: F) -> Result<(), DeviceError> {
        let mut pool = self.pool.lock();
        let dst = pool
            .blocks
            .get_mut(&block.handle)
            .ok_or(DeviceError::InvalidBlock(block.handle))?;
        dst.iter_mut().for_each(|v| *v = value);
        Ok(())
    }

    fn copy(&self, src: &DeviceBlock, dst: &DeviceBlock) -> Result<(), DeviceError> {
        let mut pool = self.pool.lock();
        let data = pool
            .blocks
            .get(&src.handle)
            .ok_or(DeviceError::InvalidBlock(src.handle))?
            .clone();
        let out = pool
            .blocks
            .get_mut(&dst.handle)
            .ok_or(DeviceError::InvalidBlock(dst.handle))?;
        if out.len() != data.len() {
            return Err(DeviceError::LengthMismatch {
                expected: out.len(),
                actual: data.len(),
            });
        }
        out.copy_from_slice(&data);
        Ok(())
    }

    fn supports(&self, op: OpCode) -> bool {
        !self.unsupported.contains(&op)
    }

    fn launch(
        &self,
        len: usize,
        inputs: &[&DeviceBlock],
        outputs: &[&DeviceBlock],
        kernel: &Kernel<'_, F>,
    ) -> Result<(), DeviceError> {
        let mut pool = self.pool.lock();
        for out in outputs {
            let block = pool
                .blocks
                .get(&out.handle)
                .ok_or(DeviceError::InvalidBlock(out.handle))?;
            if block.len() < len {
                return Err(DeviceError::LengthMismatch {
                    expected: len,
                    actual: block.len(),
                });
            }
        }

        let rows = {
            let mut views: Vec<&[F]> = Vec::with_capacity(inputs.len());
            for b in inputs {
                let data = pool
                    .blocks
                    .get(&b.handle)
                    .ok_or(DeviceError::InvalidBlock(b.handle))?;
                views.push(data.as_slice());
            }
            self.run_rows(len, outputs.len(), &views, kernel)
        };

        let width = outputs.len();
        for (j, out) in outputs.iter().enumerate() {
            let dst = pool
                .blocks
                .get_mut(&out.handle)
                .ok_or(DeviceError::InvalidBlock(out.handle))?;
            for (i, v) in dst.iter_mut().take(len).enumerate() {
                *v = rows[i * width + j];
            }
        }
        pool.counters.launches += 1;
        Ok(())
    }

    fn synchronize(&self) {
        // Launches complete before `launch` returns.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_respects_capacity() {
        let dev = SimulatedAccelerator::<f64>::new(10);
        let a = dev.allocate(6).unwrap();
        assert_eq!(dev.used(), 6);
        let err = dev.allocate(5).unwrap_err();
        assert_eq!(
            err,
            DeviceError::OutOfMemory {
                requested: 5,
                available: 4
            }
        );
        dev.free(a);
        assert_eq!(dev.used(), 0);
        assert!(dev.allocate(10).is_ok());
    }

    #[test]
    fn upload_download_roundtrip() {
        let dev = SimulatedAccelerator::<f32>::new(8);
        let b = dev.allocate(3).unwrap();
        dev.upload(&b, &[1.0, 2.0, 3.0]).unwrap();
        let mut out = [0.0; 3];
        dev.download(&b, &mut out).unwrap();
        assert_eq!(out, [1.0, 2.0, 3.0]);
        assert!(dev.upload(&b, &[1.0]).is_err());
    }

    #[test]
    fn launch_writes_every_output() {
        let dev = SimulatedAccelerator::<f64>::new(64).with_parallel(false);
        let x = dev.allocate(4).unwrap();
        dev.upload(&x, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let y = dev.allocate(4).unwrap();
        let z = dev.allocate(4).unwrap();
        dev.launch(4, &[&x], &[&y, &z], &|i, ins, row, _| {
            row[0] = ins[0][i] * 2.0;
            row[1] = ins[0][i] + 1.0;
        })
        .unwrap();
        let mut out = [0.0; 4];
        dev.download(&y, &mut out).unwrap();
        assert_eq!(out, [2.0, 4.0, 6.0, 8.0]);
        dev.download(&z, &mut out).unwrap();
        assert_eq!(out, [2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn serial_launch_reuses_one_workspace() {
        let dev = SimulatedAccelerator::<f64>::new(16).with_parallel(false);
        let y = dev.allocate(5).unwrap();
        dev.launch(5, &[], &[&y], &|_, _, row, scratch| {
            scratch.push(1.0);
            row[0] = scratch.len() as f64;
        })
        .unwrap();
        let mut out = [0.0; 5];
        dev.download(&y, &mut out).unwrap();
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0, 5.0]);
    }
}
