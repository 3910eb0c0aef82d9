//! The software device's memory.
//!
//! Every buffer gets its own [`Allocation`] in a single flat device address space. Allocations
//! are placed in increasing address order, aligned to [`ALLOCATION_ALIGNMENT`], and separated by
//! a gap of [`GUARD_SIZE`] bytes that no allocation ever occupies. Like a device with robust
//! buffer access, reads of unallocated addresses return zeroes and writes to them are dropped.

use crate::{DeviceAddress, DeviceSize};
use parking_lot::{Mutex, RwLock};
use std::{collections::BTreeMap, ops::Bound, sync::Arc};

/// The address of the first allocation.
pub const BASE_ADDRESS: DeviceAddress = 0x1_0000_0000;

/// The alignment of every allocation's base address.
pub const ALLOCATION_ALIGNMENT: DeviceSize = 256;

/// The size of the unallocated gap that follows every allocation.
pub const GUARD_SIZE: DeviceSize = 256;

#[derive(Debug)]
pub(crate) struct Allocation {
    base: DeviceAddress,
    size: DeviceSize,
    data: RwLock<Box<[u8]>>,
}

impl Allocation {
    #[inline]
    pub(crate) fn base(&self) -> DeviceAddress {
        self.base
    }

    #[inline]
    pub(crate) fn size(&self) -> DeviceSize {
        self.size
    }

    /// Copies `dst.len()` bytes starting at `offset`. The range must be in bounds.
    pub(crate) fn read_at(&self, offset: usize, dst: &mut [u8]) {
        dst.copy_from_slice(&self.data.read()[offset..offset + dst.len()]);
    }

    /// Copies `src` to `offset`. The range must be in bounds.
    pub(crate) fn write_at(&self, offset: usize, src: &[u8]) {
        self.data.write()[offset..offset + src.len()].copy_from_slice(src);
    }
}

#[derive(Debug)]
pub(crate) struct DeviceMemory {
    next_address: Mutex<DeviceAddress>,
    allocations: RwLock<BTreeMap<DeviceAddress, Arc<Allocation>>>,
}

impl DeviceMemory {
    pub(crate) fn new() -> Self {
        DeviceMemory {
            next_address: Mutex::new(BASE_ADDRESS),
            allocations: RwLock::new(BTreeMap::new()),
        }
    }

    /// Allocates `size` zeroed bytes. Returns `None` if the address space is exhausted.
    pub(crate) fn allocate(&self, size: DeviceSize) -> Option<Arc<Allocation>> {
        let len = usize::try_from(size).ok()?;
        let mut next_address = self.next_address.lock();
        let base = *next_address;
        let end = base.checked_add(size)?.checked_add(GUARD_SIZE)?;
        *next_address = end.checked_next_multiple_of(ALLOCATION_ALIGNMENT)?;

        let allocation = Arc::new(Allocation {
            base,
            size,
            data: RwLock::new(vec![0; len].into_boxed_slice()),
        });
        self.allocations.write().insert(base, allocation.clone());

        Some(allocation)
    }

    pub(crate) fn free(&self, base: DeviceAddress) {
        self.allocations.write().remove(&base);
    }

    /// Reads `dst.len()` bytes starting at `address`. Bytes outside every allocation read as 0.
    pub(crate) fn read(&self, address: DeviceAddress, dst: &mut [u8]) {
        dst.fill(0);
        self.for_each_overlap(address, dst.len(), |allocation, offset, start, len| {
            allocation.read_at(offset, &mut dst[start..start + len]);
        });
    }

    /// Writes `src` starting at `address`. Bytes outside every allocation are dropped.
    pub(crate) fn write(&self, address: DeviceAddress, src: &[u8]) {
        self.for_each_overlap(address, src.len(), |allocation, offset, start, len| {
            allocation.write_at(offset, &src[start..start + len]);
        });
    }

    // Calls `f(allocation, offset_in_allocation, offset_in_access, len)` for every allocation
    // that overlaps `address..address + len`.
    fn for_each_overlap(
        &self,
        address: DeviceAddress,
        len: usize,
        mut f: impl FnMut(&Allocation, usize, usize, usize),
    ) {
        let end = address.saturating_add(len as DeviceSize);
        let allocations = self.allocations.read();

        let first = allocations
            .range(..=address)
            .next_back()
            .map_or(address, |(&base, _)| base);

        for allocation in allocations
            .range((Bound::Included(first), Bound::Excluded(end)))
            .map(|(_, allocation)| allocation)
        {
            let alloc_end = allocation.base + allocation.size();
            let start = address.max(allocation.base);
            let stop = end.min(alloc_end);

            if start >= stop {
                continue;
            }

            f(
                allocation,
                (start - allocation.base) as usize,
                (start - address) as usize,
                (stop - start) as usize,
            );
        }
    }
}
