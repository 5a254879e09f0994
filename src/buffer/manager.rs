use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use super::{Buffer, BufferId, BufferInner, Location, Storage};
use crate::device::{Accelerator, DeviceBlock, DeviceError, DeviceId};
use crate::error::{Error, Result};
use crate::float::Numeric;

/// Dead registry entries are pruned once per this many registrations.
const PRUNE_INTERVAL: usize = 64;

pub(crate) struct Shared<F: Numeric> {
    pub(super) accelerator: Arc<dyn Accelerator<F>>,
    registry: RwLock<HashMap<BufferId, Weak<BufferInner<F>>>>,
    clock: AtomicU64,
    next_id: AtomicU64,
    inserts: AtomicUsize,
    cached_device_used: AtomicUsize,
    cached_host_used: AtomicUsize,
}

impl<F: Numeric> Shared<F> {
    /// Advance the logical access clock.
    #[inline]
    pub(super) fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Allocate on the accelerator, evicting and retrying once on exhaustion.
    pub(super) fn allocate_device(&self, len: usize) -> Result<DeviceBlock> {
        match self.accelerator.allocate(len) {
            Ok(block) => return Ok(block),
            Err(DeviceError::OutOfMemory { available, .. }) => {
                log::debug!(
                    "allocation of {len} elements failed ({available} available), evicting"
                );
            }
            Err(e) => return Err(e.into()),
        }

        let freed = self.offload(len, Some(self.accelerator.id()));
        match self.accelerator.allocate(len) {
            Ok(block) => Ok(block),
            Err(DeviceError::OutOfMemory { available, .. }) => {
                log::warn!(
                    "allocation of {len} elements failed after evicting {freed} ({available} available)"
                );
                Err(Error::ResourceExhausted {
                    requested: len,
                    freed,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn live(&self) -> Vec<Arc<BufferInner<F>>> {
        self.registry
            .read()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub(super) fn offload(&self, target: usize, device: Option<DeviceId>) -> usize {
        let mut candidates: Vec<(u64, Arc<BufferInner<F>>)> = self
            .live()
            .into_iter()
            .filter(|b| b.location() == Location::Accelerator)
            .filter_map(|b| {
                let on_device = match &*b.storage.try_read()? {
                    Storage::Device(block) => device.map_or(true, |d| block.device() == d),
                    _ => false,
                };
                on_device.then(|| (b.last_access.load(Ordering::Acquire), b))
            })
            .collect();
        candidates.sort_by_key(|(stamp, _)| *stamp);

        let mut freed = 0;
        let mut evicted = 0;
        for (_, buf) in candidates {
            if target > 0 && freed >= target {
                break;
            }
            // Leased buffers hold a shared lock and are skipped.
            let Some(mut storage) = buf.storage.try_write() else {
                continue;
            };
            if !matches!(*storage, Storage::Device(_)) {
                continue;
            }
            match buf.migrate_to_host(&mut storage) {
                Ok(()) => {
                    freed += buf.len;
                    evicted += 1;
                }
                Err(e) => log::warn!("failed to offload {}: {e}", buf.id),
            }
        }
        log::debug!("offload: evicted {evicted} buffers, freed {freed} of {target} elements");
        freed
    }

    fn register(&self, inner: &Arc<BufferInner<F>>) {
        let mut registry = self.registry.write();
        registry.insert(inner.id, Arc::downgrade(inner));
        if self.inserts.fetch_add(1, Ordering::Relaxed) % PRUNE_INTERVAL == PRUNE_INTERVAL - 1 {
            registry.retain(|_, weak| weak.strong_count() > 0);
        }
    }

    /// Sum resident lengths, or return the last cached sum if the registry is busy.
    fn resident(&self, tier: Location, cache: &AtomicUsize) -> usize {
        match self.registry.try_read() {
            Some(registry) => {
                let total = registry
                    .values()
                    .filter_map(Weak::upgrade)
                    .filter(|b| b.location() == tier)
                    .map(|b| b.len)
                    .sum();
                cache.store(total, Ordering::Release);
                total
            }
            None => cache.load(Ordering::Acquire),
        }
    }
}

/// Owns the registry of every buffer and the accelerator they migrate to.
///
/// Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct BufferManager<F: Numeric> {
    shared: Arc<Shared<F>>,
}

impl<F: Numeric> BufferManager<F> {
    pub fn new(accelerator: Arc<dyn Accelerator<F>>) -> Self {
        BufferManager {
            shared: Arc::new(Shared {
                accelerator,
                registry: RwLock::new(HashMap::new()),
                clock: AtomicU64::new(0),
                next_id: AtomicU64::new(0),
                inserts: AtomicUsize::new(0),
                cached_device_used: AtomicUsize::new(0),
                cached_host_used: AtomicUsize::new(0),
            }),
        }
    }

    pub fn accelerator(&self) -> &Arc<dyn Accelerator<F>> {
        &self.shared.accelerator
    }

    fn register(&self, len: usize, storage: Storage<F>) -> Buffer<F> {
        let location = storage.location();
        let inner = Arc::new(BufferInner {
            id: BufferId(self.shared.next_id.fetch_add(1, Ordering::Relaxed)),
            len,
            storage: RwLock::new(storage),
            location: AtomicU8::new(location as u8),
            last_access: AtomicU64::new(self.shared.tick()),
            shared: Arc::clone(&self.shared),
        });
        self.shared.register(&inner);
        Buffer::from_inner(inner)
    }

    /// New buffer of `len` elements; nothing is materialized until first access.
    pub fn allocate(&self, len: usize) -> Buffer<F> {
        self.register(len, Storage::Empty)
    }

    /// New host-resident buffer holding `data`.
    pub fn allocate_from(&self, data: Vec<F>) -> Buffer<F> {
        self.register(data.len(), Storage::Host(data))
    }

    /// Free both representations of `buffer`, leaving it [`Location::Empty`].
    ///
    /// Fails with [`Error::BufferBusy`] if the buffer stays leased past
    /// [`LOCK_TIMEOUT`](super::LOCK_TIMEOUT).
    pub fn release(&self, buffer: &Buffer<F>) -> Result<()> {
        buffer.ensure_location(Location::Empty)
    }

    /// Migrate least-recently-used accelerator buffers to the host.
    ///
    /// Stops once at least `target` elements are freed; a `target` of zero
    /// evicts everything evictable. Only buffers on `device` are considered
    /// when a filter is given, and buffers currently leased are skipped.
    /// Returns the number of elements freed.
    pub fn offload(&self, target: usize, device: Option<DeviceId>) -> usize {
        self.shared.offload(target, device)
    }

    pub fn synchronize(&self) {
        self.shared.accelerator.synchronize();
    }

    /// Number of live buffers.
    pub fn len(&self) -> usize {
        self.shared
            .registry
            .read()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Elements resident on the accelerator.
    ///
    /// May return a stale value instead of blocking while the registry is
    /// being modified.
    pub fn used_accelerator_memory(&self) -> usize {
        self.shared
            .resident(Location::Accelerator, &self.shared.cached_device_used)
    }

    /// Elements resident on the host. Same consistency as
    /// [`used_accelerator_memory`](Self::used_accelerator_memory).
    pub fn used_host_memory(&self) -> usize {
        self.shared
            .resident(Location::Host, &self.shared.cached_host_used)
    }

    pub fn used_accelerator_bytes(&self) -> usize {
        self.used_accelerator_memory() * F::BYTES
    }

    pub fn used_host_bytes(&self) -> usize {
        self.used_host_memory() * F::BYTES
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimulatedAccelerator;

    fn manager(capacity: usize) -> (Arc<SimulatedAccelerator<f64>>, BufferManager<f64>) {
        let dev = Arc::new(SimulatedAccelerator::new(capacity));
        let mgr = BufferManager::new(dev.clone() as Arc<dyn Accelerator<f64>>);
        (dev, mgr)
    }

    #[test]
    fn empty_buffer_zero_fills_on_host() {
        let (_, mgr) = manager(16);
        let b = mgr.allocate(3);
        assert_eq!(b.location(), Location::Empty);
        assert_eq!(b.to_vec().unwrap(), vec![0.0; 3]);
        assert_eq!(b.location(), Location::Host);
    }

    #[test]
    fn migration_frees_the_other_side() {
        let (dev, mgr) = manager(16);
        let b = mgr.allocate_from(vec![1.0, 2.0, 3.0]);
        b.ensure_location(Location::Accelerator).unwrap();
        assert_eq!(dev.used(), 3);
        assert_eq!(mgr.used_host_memory(), 0);
        assert_eq!(mgr.used_accelerator_memory(), 3);

        b.ensure_location(Location::Host).unwrap();
        assert_eq!(dev.used(), 0);
        assert_eq!(mgr.used_host_memory(), 3);
        assert_eq!(b.to_vec().unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn release_and_drop_return_device_memory() {
        let (dev, mgr) = manager(16);
        let a = mgr.allocate(4);
        let b = mgr.allocate(4);
        a.ensure_location(Location::Accelerator).unwrap();
        b.ensure_location(Location::Accelerator).unwrap();
        assert_eq!(dev.used(), 8);
        mgr.release(&a).unwrap();
        assert_eq!(a.location(), Location::Empty);
        assert_eq!(dev.used(), 4);
        drop(b);
        assert_eq!(dev.used(), 0);
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn offload_skips_leased_buffers() {
        let (_, mgr) = manager(16);
        let a = mgr.allocate(4);
        let b = mgr.allocate(4);
        a.ensure_location(Location::Accelerator).unwrap();
        b.ensure_location(Location::Accelerator).unwrap();

        let lease = a.lease(Location::Accelerator).unwrap();
        assert_eq!(mgr.offload(0, None), 4);
        assert_eq!(a.location(), Location::Accelerator);
        assert_eq!(b.location(), Location::Host);
        drop(lease);

        assert_eq!(mgr.offload(0, None), 4);
        assert_eq!(a.location(), Location::Host);
    }

    #[test]
    fn offload_respects_device_filter() {
        let (_, mgr) = manager(16);
        let a = mgr.allocate(4);
        a.ensure_location(Location::Accelerator).unwrap();
        assert_eq!(mgr.offload(0, Some(DeviceId(u32::MAX))), 0);
        assert_eq!(a.location(), Location::Accelerator);
        let own = mgr.accelerator().id();
        assert_eq!(mgr.offload(0, Some(own)), 4);
    }

    #[test]
    fn allocation_evicts_then_retries() {
        let (dev, mgr) = manager(8);
        let a = mgr.allocate_from(vec![1.0; 6]);
        a.ensure_location(Location::Accelerator).unwrap();
        let b = mgr.allocate(6);
        b.ensure_location(Location::Accelerator).unwrap();
        assert_eq!(a.location(), Location::Host);
        assert_eq!(b.location(), Location::Accelerator);
        assert_eq!(dev.used(), 6);
        assert_eq!(a.to_vec().unwrap(), vec![1.0; 6]);
    }

    #[test]
    fn exhaustion_leaves_buffer_untouched() {
        let (_, mgr) = manager(8);
        let a = mgr.allocate(6);
        a.ensure_location(Location::Accelerator).unwrap();
        let _pin = a.lease(Location::Accelerator).unwrap();

        let b = mgr.allocate_from(vec![2.0; 4]);
        let err = b.ensure_location(Location::Accelerator).unwrap_err();
        assert_eq!(
            err,
            Error::ResourceExhausted {
                requested: 4,
                freed: 0
            }
        );
        assert_eq!(b.location(), Location::Host);
        assert_eq!(b.to_vec().unwrap(), vec![2.0; 4]);
    }

    #[test]
    fn write_checks_length() {
        let (_, mgr) = manager(8);
        let b = mgr.allocate(2);
        assert_eq!(
            b.write(&[1.0]).unwrap_err(),
            Error::LengthMismatch {
                expected: 2,
                actual: 1
            }
        );
    }
}
