//! Buffers that live on the host or on an accelerator, never both.
//!
//! A [`Buffer`] starts [`Location::Empty`] and is zero-filled on first access.
//! Reading or writing through one tier's view migrates the contents to that
//! tier and frees the other representation. Migration is explicit: callers
//! go through [`Buffer::ensure_location`] or [`Buffer::lease`], both of which
//! return a `Result` so allocation failures are visible at the call site.
//!
//! # Exclusivity
//!
//! Each buffer's storage sits behind a `parking_lot::RwLock`. A
//! [`BufferLease`] holds a shared lock for as long as a launch uses the
//! buffer; eviction only migrates buffers it can lock exclusively with
//! `try_write`, so it never moves a buffer that is in use.
//!
//! Every other exclusive acquisition (migration inside [`Buffer::lease`],
//! [`Buffer::ensure_location`], writes and fills) waits at most
//! [`LOCK_TIMEOUT`] and then fails with [`Error::BufferBusy`]. A thread that
//! holds one lease while migrating another buffer therefore gets an error
//! instead of waiting forever on a peer doing the same in reverse.

mod manager;

pub use manager::BufferManager;

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard};

use crate::device::DeviceBlock;
use crate::error::{Error, Result};
use crate::float::Numeric;

use self::manager::Shared;

/// Longest a buffer operation waits for exclusive access before giving up.
pub const LOCK_TIMEOUT: Duration = Duration::from_millis(200);

/// Where a buffer's contents currently live.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Location {
    /// Nothing materialized yet (or released).
    Empty = 0,
    Host = 1,
    Accelerator = 2,
}

impl Location {
    fn from_u8(v: u8) -> Location {
        match v {
            1 => Location::Host,
            2 => Location::Accelerator,
            _ => Location::Empty,
        }
    }
}

/// Registry key of a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf{}", self.0)
    }
}

pub(crate) enum Storage<F> {
    Empty,
    Host(Vec<F>),
    Device(DeviceBlock),
}

impl<F> Storage<F> {
    fn location(&self) -> Location {
        match self {
            Storage::Empty => Location::Empty,
            Storage::Host(_) => Location::Host,
            Storage::Device(_) => Location::Accelerator,
        }
    }
}

pub(crate) struct BufferInner<F: Numeric> {
    id: BufferId,
    len: usize,
    storage: RwLock<Storage<F>>,
    /// Lock-free mirror of `storage`'s variant, read by usage aggregates.
    location: AtomicU8,
    last_access: AtomicU64,
    shared: Arc<Shared<F>>,
}

impl<F: Numeric> BufferInner<F> {
    #[inline]
    fn location(&self) -> Location {
        Location::from_u8(self.location.load(Ordering::Acquire))
    }

    fn busy(&self) -> Error {
        log::debug!("{}: lock not acquired within {LOCK_TIMEOUT:?}", self.id);
        Error::BufferBusy(self.id)
    }

    /// Exclusive access to the storage, bounded by [`LOCK_TIMEOUT`].
    fn write(&self) -> Result<RwLockWriteGuard<'_, Storage<F>>> {
        self.storage
            .try_write_for(LOCK_TIMEOUT)
            .ok_or_else(|| self.busy())
    }

    #[inline]
    fn touch(&self) {
        self.last_access
            .store(self.shared.tick(), Ordering::Release);
    }

    fn set(&self, storage: &mut Storage<F>, next: Storage<F>) {
        let loc = next.location();
        if let Storage::Device(block) = std::mem::replace(storage, next) {
            self.shared.accelerator.free(block);
        }
        self.location.store(loc as u8, Ordering::Release);
    }

    /// Move contents to the host, zero-filling if nothing was materialized.
    fn migrate_to_host(&self, storage: &mut Storage<F>) -> Result<()> {
        match storage {
            Storage::Host(_) => Ok(()),
            Storage::Empty => {
                log::trace!("{}: empty -> host ({} elements)", self.id, self.len);
                self.set(storage, Storage::Host(vec![F::zero(); self.len]));
                Ok(())
            }
            Storage::Device(block) => {
                let mut data = vec![F::zero(); self.len];
                self.shared.accelerator.download(block, &mut data)?;
                log::trace!("{}: accelerator -> host ({} elements)", self.id, self.len);
                self.set(storage, Storage::Host(data));
                Ok(())
            }
        }
    }

    /// Move contents to the accelerator, allocating (with eviction) as needed.
    ///
    /// On failure the buffer keeps its previous representation.
    fn migrate_to_accelerator(&self, storage: &mut Storage<F>) -> Result<()> {
        match storage {
            Storage::Device(_) => Ok(()),
            Storage::Empty => {
                let block = self.shared.allocate_device(self.len)?;
                log::trace!("{}: empty -> accelerator ({} elements)", self.id, self.len);
                self.set(storage, Storage::Device(block));
                Ok(())
            }
            Storage::Host(data) => {
                let block = self.shared.allocate_device(self.len)?;
                if let Err(e) = self.shared.accelerator.upload(&block, data) {
                    self.shared.accelerator.free(block);
                    return Err(e.into());
                }
                log::trace!("{}: host -> accelerator ({} elements)", self.id, self.len);
                self.set(storage, Storage::Device(block));
                Ok(())
            }
        }
    }

    fn migrate(&self, storage: &mut Storage<F>, tier: Location) -> Result<()> {
        match tier {
            Location::Host => self.migrate_to_host(storage),
            Location::Accelerator => self.migrate_to_accelerator(storage),
            Location::Empty => {
                self.set(storage, Storage::Empty);
                Ok(())
            }
        }
    }
}

impl<F: Numeric> Drop for BufferInner<F> {
    fn drop(&mut self) {
        if let Storage::Device(block) = std::mem::replace(self.storage.get_mut(), Storage::Empty) {
            self.shared.accelerator.free(block);
        }
    }
}

/// Shared handle to one flat array of `F`.
///
/// Cloning the handle does not copy data. The storage is freed when the last
/// handle is dropped or when [`BufferManager::release`] is called.
pub struct Buffer<F: Numeric> {
    inner: Arc<BufferInner<F>>,
}

impl<F: Numeric> Clone for Buffer<F> {
    fn clone(&self) -> Self {
        Buffer {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: Numeric> fmt::Debug for Buffer<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.inner.id)
            .field("len", &self.inner.len)
            .field("location", &self.location())
            .finish()
    }
}

impl<F: Numeric> Buffer<F> {
    #[inline]
    pub fn id(&self) -> BufferId {
        self.inner.id
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Current tier. May be stale by the time it is read if another thread migrates.
    #[inline]
    pub fn location(&self) -> Location {
        self.inner.location()
    }

    /// Logical time of the last access (larger is more recent).
    #[inline]
    pub fn last_access(&self) -> u64 {
        self.inner.last_access.load(Ordering::Acquire)
    }

    /// Whether two handles name the same buffer.
    #[inline]
    pub fn same_as(&self, other: &Buffer<F>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Migrate to `tier` (or free everything for [`Location::Empty`]).
    pub fn ensure_location(&self, tier: Location) -> Result<()> {
        let mut storage = self.inner.write()?;
        self.inner.touch();
        self.inner.migrate(&mut storage, tier)
    }

    /// Lock the buffer in place on `tier` for the lifetime of the lease.
    ///
    /// Migrates first if needed. While the lease is alive other readers may
    /// coexist but eviction skips the buffer. Migration needs every other
    /// lease on this buffer to be dropped; if that does not happen within
    /// [`LOCK_TIMEOUT`] the call fails with [`Error::BufferBusy`].
    pub fn lease(&self, tier: Location) -> Result<BufferLease<'_, F>> {
        if tier == Location::Empty {
            return Err(Error::InternalInconsistency(format!(
                "{}: cannot lease an empty tier",
                self.inner.id
            )));
        }
        self.inner.touch();
        let guard = self
            .inner
            .storage
            .try_upgradable_read_for(LOCK_TIMEOUT)
            .ok_or_else(|| self.inner.busy())?;
        let guard = if guard.location() == tier {
            RwLockUpgradableReadGuard::downgrade(guard)
        } else {
            let mut write = RwLockUpgradableReadGuard::try_upgrade_for(guard, LOCK_TIMEOUT)
                .map_err(|_| self.inner.busy())?;
            self.inner.migrate(&mut write, tier)?;
            RwLockWriteGuard::downgrade(write)
        };
        Ok(BufferLease {
            guard,
            len: self.inner.len,
        })
    }

    /// Copy the contents out through the host view.
    pub fn to_vec(&self) -> Result<Vec<F>> {
        let lease = self.lease(Location::Host)?;
        Ok(lease.host().map(<[F]>::to_vec).unwrap_or_default())
    }

    /// Replace the contents with `data`, leaving the buffer on the host.
    pub fn write(&self, data: &[F]) -> Result<()> {
        if data.len() != self.inner.len {
            return Err(Error::LengthMismatch {
                expected: self.inner.len,
                actual: data.len(),
            });
        }
        let mut storage = self.inner.write()?;
        self.inner.touch();
        self.inner.set(&mut storage, Storage::Host(data.to_vec()));
        Ok(())
    }

    /// Mutate the contents in place through the host view.
    pub fn update_host<R>(&self, f: impl FnOnce(&mut [F]) -> R) -> Result<R> {
        let mut storage = self.inner.write()?;
        self.inner.touch();
        self.inner.migrate_to_host(&mut storage)?;
        match &mut *storage {
            Storage::Host(data) => Ok(f(data)),
            _ => Err(Error::InternalInconsistency(format!(
                "{}: host migration left no host data",
                self.inner.id
            ))),
        }
    }

    /// Set every element to `value` on whichever tier currently holds the data.
    pub fn fill(&self, value: F) -> Result<()> {
        let mut storage = self.inner.write()?;
        self.inner.touch();
        match &mut *storage {
            Storage::Device(block) => self.inner.shared.accelerator.fill(block, value)?,
            Storage::Host(data) => data.iter_mut().for_each(|v| *v = value),
            Storage::Empty => self
                .inner
                .set(&mut storage, Storage::Host(vec![value; self.inner.len])),
        }
        Ok(())
    }

    /// Zero the contents in place.
    pub fn zero(&self) -> Result<()> {
        self.fill(F::zero())
    }

    pub(crate) fn from_inner(inner: Arc<BufferInner<F>>) -> Self {
        Buffer { inner }
    }
}

/// Shared lock on a buffer pinned to one tier.
pub struct BufferLease<'a, F: Numeric> {
    guard: RwLockReadGuard<'a, Storage<F>>,
    len: usize,
}

impl<F: Numeric> BufferLease<'_, F> {
    pub fn location(&self) -> Location {
        self.guard.location()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Host contents, if leased on the host.
    pub fn host(&self) -> Option<&[F]> {
        match &*self.guard {
            Storage::Host(data) => Some(data),
            _ => None,
        }
    }

    /// Accelerator block, if leased on the accelerator.
    pub fn block(&self) -> Option<&DeviceBlock> {
        match &*self.guard {
            Storage::Device(block) => Some(block),
            _ => None,
        }
    }

    /// Accelerator block, or an error naming the tier actually held.
    pub(crate) fn require_block(&self) -> Result<&DeviceBlock> {
        self.block().ok_or_else(|| {
            Error::InternalInconsistency(format!(
                "lease expected accelerator storage, found {:?}",
                self.location()
            ))
        })
    }
}
