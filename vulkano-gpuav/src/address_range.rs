//! Tracking of the device address ranges that shaders are allowed to dereference.
//!
//! Every allocation that is created with address-capable memory (a buffer with the
//! `SHADER_DEVICE_ADDRESS` usage) contributes one [`AddressRange`] to the
//! [`AddressRangeRegistry`]. Instrumented shaders never see the registry itself: at submission time
//! the registry is flattened into an immutable [`RangeSnapshot`], which is what the bounds-check
//! routine searches on the device.

use crate::{DeviceAddress, DeviceSize};
use ash::vk::Handle;
use bytemuck::{Pod, Zeroable};
use foldhash::HashMap;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use std::{
    collections::BTreeMap,
    error::Error,
    fmt,
    ops::{Bound, Range},
    sync::Arc,
};

/// An opaque identifier of the resource that owns an [`AddressRange`].
///
/// This is never dereferenced. It is only used to find the ranges to remove when the resource is
/// destroyed, and to name the resource in validation messages.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OwnerHandle(u64);

impl OwnerHandle {
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        OwnerHandle(raw)
    }

    /// Creates an `OwnerHandle` from the raw value of a Vulkan handle.
    #[inline]
    pub fn from_handle<H: Handle>(handle: H) -> Self {
        OwnerHandle(handle.as_raw())
    }

    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for OwnerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnerHandle({:#x})", self.0)
    }
}

/// A live range of device addresses, `base..base + size`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AddressRange {
    pub base: DeviceAddress,
    pub size: DeviceSize,
    pub owner: OwnerHandle,
}

impl AddressRange {
    #[inline]
    pub const fn new(base: DeviceAddress, size: DeviceSize, owner: OwnerHandle) -> Self {
        AddressRange { base, size, owner }
    }

    /// Returns the address one past the last byte of the range.
    ///
    /// Saturates at `u64::MAX` for a range that reaches the top of the address space. Membership
    /// and access checks don't go through this, so such a range still contains its last byte.
    #[inline]
    pub const fn end(&self) -> DeviceAddress {
        self.base.saturating_add(self.size)
    }

    #[inline]
    pub const fn contains(&self, address: DeviceAddress) -> bool {
        self.base <= address && address - self.base < self.size
    }

    #[inline]
    pub const fn as_range(&self) -> Range<DeviceAddress> {
        self.base..self.end()
    }

    /// Returns how `size` bytes accessed at `address` relate to this range.
    ///
    /// `address` is assumed to be inside the range.
    fn classify(&self, address: DeviceAddress, size: DeviceSize) -> AccessStatus {
        let remaining = self.size.saturating_sub(address.saturating_sub(self.base));

        if size <= remaining {
            AccessStatus::Ok
        } else {
            AccessStatus::OutOfBounds { range: *self }
        }
    }
}

/// The result of validating an access against the registered ranges.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub enum AccessStatus {
    /// The access lies entirely inside one registered range.
    Ok,

    /// The first byte of the access lies inside `range`, but the access extends past its end.
    OutOfBounds { range: AddressRange },

    /// No registered range contains the first byte of the access.
    Unregistered,
}

impl AccessStatus {
    #[inline]
    pub fn is_ok(&self) -> bool {
        matches!(self, AccessStatus::Ok)
    }
}

/// Host-side registry of the live address ranges.
///
/// Ranges are kept sorted by their base address. All mutation happens behind a single exclusive
/// lock, while lookups share a read lock, so it is fine to register and unregister from many
/// threads at once.
#[derive(Debug, Default)]
pub struct AddressRangeRegistry {
    state: RwLock<RegistryState>,
    // The last snapshot that was built, reused for as long as the generation doesn't change.
    snapshot: Mutex<Option<Arc<RangeSnapshot>>>,
}

#[derive(Debug, Default)]
struct RegistryState {
    ranges: BTreeMap<DeviceAddress, AddressRange>,
    owners: HashMap<OwnerHandle, SmallVec<[DeviceAddress; 1]>>,
    generation: u64,
}

impl RegistryState {
    fn containing(&self, address: DeviceAddress) -> Option<&AddressRange> {
        // The only stored range that could contain the address is the last one whose base is
        // less than or equal to it.
        self.ranges
            .range((Bound::Unbounded, Bound::Included(address)))
            .next_back()
            .map(|(_, range)| range)
            .filter(|range| range.contains(address))
    }

    fn overlapping(&self, range: &AddressRange) -> Option<&AddressRange> {
        // Ranges are disjoint, so if anything overlaps `range` then the last stored range that
        // starts before its end does.
        let end = match range.base.checked_add(range.size) {
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        };

        self.ranges
            .range((Bound::Unbounded, end))
            .next_back()
            .map(|(_, existing)| existing)
            .filter(|existing| existing.base >= range.base || existing.contains(range.base))
    }
}

impl AddressRangeRegistry {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `range` to the registry.
    ///
    /// Zero-sized ranges can't contain any access and are ignored.
    ///
    /// # Errors
    ///
    /// - Returns an error if any part of `range` is already covered by a registered range. The
    ///   registry is left unchanged in that case.
    pub fn register(&self, range: AddressRange) -> Result<(), OverlapError> {
        if range.size == 0 {
            tracing::debug!(?range, "ignoring zero-sized address range");
            return Ok(());
        }

        let mut state = self.state.write();

        if let Some(&existing) = state.overlapping(&range) {
            return Err(OverlapError {
                range,
                existing,
            });
        }

        state.ranges.insert(range.base, range);
        state.owners.entry(range.owner).or_default().push(range.base);
        state.generation += 1;

        tracing::debug!(
            base = range.base,
            size = range.size,
            owner = ?range.owner,
            "registered address range",
        );

        Ok(())
    }

    /// Removes every range owned by `owner`. Does nothing if `owner` has no ranges.
    pub fn unregister(&self, owner: OwnerHandle) {
        let mut state = self.state.write();

        let Some(bases) = state.owners.remove(&owner) else {
            return;
        };

        for base in &bases {
            state.ranges.remove(base);
        }

        state.generation += 1;

        tracing::debug!(?owner, count = bases.len(), "unregistered address ranges");
    }

    /// Returns the range containing `address`, if any.
    #[inline]
    pub fn lookup(&self, address: DeviceAddress) -> Option<AddressRange> {
        self.state.read().containing(address).copied()
    }

    /// Validates an access of `size` bytes starting at `address`.
    pub fn validate_access(&self, address: DeviceAddress, size: DeviceSize) -> AccessStatus {
        match self.state.read().containing(address) {
            Some(range) => range.classify(address, size),
            None => AccessStatus::Unregistered,
        }
    }

    /// Returns the range that is closest to `address`: the range containing it if there is one,
    /// otherwise whichever of the preceding and following ranges has the smaller gap to it.
    pub fn nearest(&self, address: DeviceAddress) -> Option<AddressRange> {
        let state = self.state.read();

        if let Some(&range) = state.containing(address) {
            return Some(range);
        }

        let before = state
            .ranges
            .range((Bound::Unbounded, Bound::Excluded(address)))
            .next_back()
            .map(|(_, range)| *range);
        let after = state
            .ranges
            .range((Bound::Excluded(address), Bound::Unbounded))
            .next()
            .map(|(_, range)| *range);

        match (before, after) {
            (Some(before), Some(after)) => {
                if address - before.end() <= after.base - address {
                    Some(before)
                } else {
                    Some(after)
                }
            }
            (before, after) => before.or(after),
        }
    }

    /// Returns the number of registered ranges.
    #[inline]
    pub fn len(&self) -> usize {
        self.state.read().ranges.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.state.read().ranges.is_empty()
    }

    /// Returns a copy of all registered ranges, ordered by base address.
    pub fn ranges(&self) -> Vec<AddressRange> {
        self.state.read().ranges.values().copied().collect()
    }

    /// Returns an immutable snapshot of the registry, in the form that is handed to the device.
    ///
    /// Consecutive calls without any registration or unregistration in between return the same
    /// snapshot.
    pub fn snapshot(&self) -> Arc<RangeSnapshot> {
        let state = self.state.read();
        let mut cached = self.snapshot.lock();

        if let Some(snapshot) = cached.as_ref() {
            if snapshot.generation == state.generation {
                return snapshot.clone();
            }
        }

        let snapshot = Arc::new(RangeSnapshot {
            generation: state.generation,
            entries: state
                .ranges
                .values()
                .map(|range| RangeEntry {
                    base: range.base,
                    size: range.size,
                })
                .collect(),
        });
        *cached = Some(snapshot.clone());

        snapshot
    }
}

/// One entry of the device-resident range table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct RangeEntry {
    pub base: u64,
    pub size: u64,
}

/// Header of the device-resident range table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct RangeTableHeader {
    pub count: u32,
    pub _reserved: [u32; 3],
}

/// An immutable, sorted copy of the registry's ranges, as seen by instrumented shaders.
#[derive(Debug)]
pub struct RangeSnapshot {
    generation: u64,
    entries: Box<[RangeEntry]>,
}

impl RangeSnapshot {
    /// Returns the registry generation this snapshot was taken at.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn entries(&self) -> &[RangeEntry] {
        &self.entries
    }

    /// Validates an access the same way as [`AddressRangeRegistry::validate_access`], but using a
    /// binary search over the snapshot. This is the lookup that the device-side bounds check
    /// performs.
    pub fn validate_access(&self, address: DeviceAddress, size: DeviceSize) -> AccessStatus {
        let index = self.entries.partition_point(|entry| entry.base <= address);

        let Some(entry) = index.checked_sub(1).map(|i| &self.entries[i]) else {
            return AccessStatus::Unregistered;
        };

        // The owner isn't known on the device, only the extent matters here.
        let range = AddressRange::new(entry.base, entry.size, OwnerHandle::from_raw(0));

        if range.contains(address) {
            range.classify(address, size)
        } else {
            AccessStatus::Unregistered
        }
    }

    /// Serializes the snapshot into its little-endian device layout: a 16-byte
    /// [`RangeTableHeader`] followed by one 16-byte [`RangeEntry`] per range.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(
            size_of::<RangeTableHeader>() + self.entries.len() * size_of::<RangeEntry>(),
        );

        bytes.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&[0; 12]);

        for entry in self.entries.iter() {
            bytes.extend_from_slice(&entry.base.to_le_bytes());
            bytes.extend_from_slice(&entry.size.to_le_bytes());
        }

        bytes
    }

    /// Deserializes a range table produced by [`to_bytes`](Self::to_bytes).
    ///
    /// Returns `None` if `bytes` is too short for the count in the header, or if the entries are
    /// not sorted and disjoint. The generation of the returned snapshot is 0.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let header_size = size_of::<RangeTableHeader>();
        let count = u32::from_le_bytes(bytes.get(..4)?.try_into().ok()?) as usize;
        let body = bytes.get(header_size..header_size + count * size_of::<RangeEntry>())?;

        let entries = body
            .chunks_exact(size_of::<RangeEntry>())
            .map(|chunk| {
                Some(RangeEntry {
                    base: u64::from_le_bytes(chunk[..8].try_into().ok()?),
                    size: u64::from_le_bytes(chunk[8..].try_into().ok()?),
                })
            })
            .collect::<Option<Box<[_]>>>()?;

        let disjoint = entries
            .windows(2)
            .all(|pair| {
                pair[0]
                    .base
                    .checked_add(pair[0].size)
                    .is_some_and(|end| end <= pair[1].base)
            });

        disjoint.then_some(RangeSnapshot {
            generation: 0,
            entries,
        })
    }
}

/// Error returned when registering a range that overlaps an already registered one.
///
/// This indicates a bug in the allocator that produced the addresses, not in a shader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OverlapError {
    /// The range that was being registered.
    pub range: AddressRange,

    /// The registered range that it overlaps.
    pub existing: AddressRange,
}

impl fmt::Display for OverlapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "the address range {:#x}..{:#x} of {:?} overlaps the registered range {:#x}..{:#x} of \
            {:?}",
            self.range.base,
            self.range.end(),
            self.range.owner,
            self.existing.base,
            self.existing.end(),
            self.existing.owner,
        )
    }
}

impl Error for OverlapError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const P: DeviceAddress = 0x1_0000_0000;

    fn owner(raw: u64) -> OwnerHandle {
        OwnerHandle::from_raw(raw)
    }

    #[test]
    fn validate_access_boundaries() {
        let registry = AddressRangeRegistry::new();
        registry.register(AddressRange::new(P, 64, owner(1))).unwrap();

        assert_eq!(registry.validate_access(P, 4), AccessStatus::Ok);
        assert_eq!(registry.validate_access(P + 60, 4), AccessStatus::Ok);
        assert_eq!(registry.validate_access(P, 64), AccessStatus::Ok);
        assert_eq!(registry.validate_access(P + 63, 0), AccessStatus::Ok);
        assert_eq!(
            registry.validate_access(P + 61, 4),
            AccessStatus::OutOfBounds {
                range: AddressRange::new(P, 64, owner(1)),
            },
        );
        assert_eq!(registry.validate_access(P + 64, 4), AccessStatus::Unregistered);
        assert_eq!(registry.validate_access(P - 16, 4), AccessStatus::Unregistered);
        assert_eq!(registry.validate_access(P - 1, 4), AccessStatus::Unregistered);
    }

    #[test]
    fn access_end_overflow() {
        let registry = AddressRangeRegistry::new();
        registry
            .register(AddressRange::new(u64::MAX - 15, 16, owner(1)))
            .unwrap();

        assert!(matches!(
            registry.validate_access(u64::MAX - 3, u64::MAX),
            AccessStatus::OutOfBounds { .. },
        ));
        assert!(registry.validate_access(u64::MAX - 15, 8).is_ok());
    }

    #[test]
    fn range_reaching_top_of_address_space() {
        let registry = AddressRangeRegistry::new();
        let range = AddressRange::new(u64::MAX - 15, 16, owner(1));
        registry.register(range).unwrap();

        assert!(range.contains(u64::MAX));
        assert_eq!(registry.lookup(u64::MAX), Some(range));

        // The last four bytes, ending exactly at 2^64.
        assert!(registry.validate_access(u64::MAX - 3, 4).is_ok());
        assert!(registry.snapshot().validate_access(u64::MAX - 3, 4).is_ok());
        assert!(registry.validate_access(u64::MAX, 1).is_ok());
        assert!(matches!(
            registry.validate_access(u64::MAX - 3, 5),
            AccessStatus::OutOfBounds { .. },
        ));
        assert!(matches!(
            registry.snapshot().validate_access(u64::MAX, 2),
            AccessStatus::OutOfBounds { .. },
        ));

        assert!(registry
            .register(AddressRange::new(u64::MAX, 1, owner(2)))
            .is_err());
        assert!(registry
            .register(AddressRange::new(u64::MAX - 31, 17, owner(3)))
            .is_err());
        registry
            .register(AddressRange::new(u64::MAX - 31, 16, owner(4)))
            .unwrap();

        let snapshot = registry.snapshot();
        assert_eq!(
            RangeSnapshot::from_bytes(&snapshot.to_bytes())
                .unwrap()
                .entries(),
            snapshot.entries(),
        );
    }

    #[test]
    fn overlap_rejected() {
        let registry = AddressRangeRegistry::new();
        registry.register(AddressRange::new(P, 64, owner(1))).unwrap();

        for (base, size) in [(P, 64), (P - 8, 16), (P + 63, 1), (P + 8, 8), (P - 64, 256)] {
            let err = registry
                .register(AddressRange::new(base, size, owner(2)))
                .unwrap_err();
            assert_eq!(err.existing.owner, owner(1));
        }

        // Adjacent ranges don't overlap.
        registry.register(AddressRange::new(P + 64, 16, owner(2))).unwrap();
        registry.register(AddressRange::new(P - 16, 16, owner(3))).unwrap();
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn unregister_round_trip() {
        let registry = AddressRangeRegistry::new();
        let range = AddressRange::new(P, 64, owner(7));
        registry.register(range).unwrap();
        registry.register(AddressRange::new(P + 256, 32, owner(7))).unwrap();
        registry.register(AddressRange::new(P + 512, 32, owner(8))).unwrap();

        assert_eq!(registry.lookup(P + 10), Some(range));

        registry.unregister(owner(7));

        for address in range.as_range() {
            assert_eq!(registry.lookup(address), None);
        }
        assert_eq!(registry.lookup(P + 256), None);
        assert!(registry.lookup(P + 512).is_some());

        // Unknown owners are ignored.
        registry.unregister(owner(7));
        registry.unregister(owner(42));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn zero_sized_range_ignored() {
        let registry = AddressRangeRegistry::new();
        registry.register(AddressRange::new(P, 0, owner(1))).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn nearest_range() {
        let registry = AddressRangeRegistry::new();
        let low = AddressRange::new(P, 64, owner(1));
        let high = AddressRange::new(P + 1024, 64, owner(2));
        registry.register(low).unwrap();
        registry.register(high).unwrap();

        assert_eq!(registry.nearest(P - 16), Some(low));
        assert_eq!(registry.nearest(P + 32), Some(low));
        assert_eq!(registry.nearest(P + 100), Some(low));
        assert_eq!(registry.nearest(P + 1000), Some(high));
        assert_eq!(registry.nearest(P + 4096), Some(high));
        assert_eq!(AddressRangeRegistry::new().nearest(P), None);
    }

    #[test]
    fn snapshot_matches_registry() {
        let registry = AddressRangeRegistry::new();
        registry.register(AddressRange::new(P + 512, 32, owner(2))).unwrap();
        registry.register(AddressRange::new(P, 64, owner(1))).unwrap();

        let snapshot = registry.snapshot();
        assert!(Arc::ptr_eq(&snapshot, &registry.snapshot()));
        assert_eq!(
            snapshot.entries(),
            &[
                RangeEntry { base: P, size: 64 },
                RangeEntry {
                    base: P + 512,
                    size: 32,
                },
            ],
        );

        for (address, size) in [
            (P, 4),
            (P - 16, 4),
            (P + 60, 8),
            (P + 64, 4),
            (P + 520, 24),
            (P + 540, 4),
            (0, 4),
        ] {
            assert_eq!(
                snapshot.validate_access(address, size).is_ok(),
                registry.validate_access(address, size).is_ok(),
            );
        }

        registry.unregister(owner(1));
        let newer = registry.snapshot();
        assert!(newer.generation() > snapshot.generation());
        assert_eq!(newer.validate_access(P, 4), AccessStatus::Unregistered);
        // The old snapshot is immutable.
        assert_eq!(snapshot.validate_access(P, 4), AccessStatus::Ok);
    }

    #[test]
    fn snapshot_layout() {
        assert_eq!(size_of::<RangeEntry>(), 16);
        assert_eq!(size_of::<RangeTableHeader>(), 16);

        let registry = AddressRangeRegistry::new();
        registry.register(AddressRange::new(P, 64, owner(1))).unwrap();
        let bytes = registry.snapshot().to_bytes();

        assert_eq!(bytes.len(), 32);
        assert_eq!(&bytes[0..4], &1u32.to_le_bytes());
        assert_eq!(&bytes[16..24], &P.to_le_bytes());
        assert_eq!(&bytes[24..32], &64u64.to_le_bytes());

        let decoded = RangeSnapshot::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.entries(), registry.snapshot().entries());
        assert!(RangeSnapshot::from_bytes(&bytes[..24]).is_none());
    }

    #[test]
    fn concurrent_registration() {
        let registry = AddressRangeRegistry::new();

        thread::scope(|scope| {
            for t in 0..8u64 {
                let registry = &registry;
                scope.spawn(move || {
                    for i in 0..64u64 {
                        let base = P + (t * 64 + i) * 256;
                        registry
                            .register(AddressRange::new(base, 128, owner(t * 64 + i + 1)))
                            .unwrap();
                        assert!(registry.validate_access(base, 128).is_ok());
                    }
                });
            }
        });

        assert_eq!(registry.len(), 512);
        let snapshot = registry.snapshot();
        assert!(snapshot
            .entries()
            .windows(2)
            .all(|pair| pair[0].base + pair[0].size <= pair[1].base));
    }
}
