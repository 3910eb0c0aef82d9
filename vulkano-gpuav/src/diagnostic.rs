//! The channel through which instrumented shaders report violations back to the host.
//!
//! A [`DiagnosticBuffer`] is a fixed number of record slots behind a small header. Any number of
//! shader invocations may write to it at once: each one reserves a slot with a single atomic
//! increment of the write cursor and then fills in its own slot. Writers never wait for each
//! other and never retry. When the cursor has moved past the capacity, the overflow flag is set
//! instead and the record is dropped.
//!
//! The host only reads the buffer after the submission that wrote to it has completed, and
//! resets it before it is bound again.
//!
//! # Layout
//!
//! All values are little-endian `u32` words.
//!
//! | Offset | Field                                  |
//! |--------|----------------------------------------|
//! | 0      | write cursor                           |
//! | 4      | overflow flag                          |
//! | 8      | capacity                               |
//! | 12     | reserved                               |
//! | 16     | `capacity` records of 32 bytes each    |
//!
//! See [`RawViolationRecord`] for the layout of one record.

use crate::DeviceAddress;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use crossbeam_queue::SegQueue;
use std::{
    cmp,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

/// The size of the buffer header in bytes.
pub const HEADER_SIZE: usize = 16;

/// The size of one record in bytes.
pub const RECORD_SIZE: usize = 32;

const HEADER_WORDS: usize = HEADER_SIZE / 4;
const RECORD_WORDS: usize = RECORD_SIZE / 4;

const CURSOR_WORD: usize = 0;
const OVERFLOW_WORD: usize = 1;
const CAPACITY_WORD: usize = 2;

/// Whether a violating access was a read or a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u32)]
pub enum AccessKind {
    Read = 0,
    Write = 1,
}

impl AccessKind {
    #[inline]
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(AccessKind::Read),
            1 => Some(AccessKind::Write),
            _ => None,
        }
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            AccessKind::Read => "read",
            AccessKind::Write => "write",
        }
    }
}

/// One violation record exactly as it is laid out in the diagnostic buffer.
///
/// The 64-bit faulting address sits at byte offset 4, which isn't 8-byte aligned, so it is stored
/// as two 32-bit halves. This way the struct has no padding and can be shared with shader code
/// that only deals in 32-bit words.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct RawViolationRecord {
    /// 0 if the slot is empty, 1 if it was populated.
    pub valid: u32,
    pub address_low: u32,
    pub address_high: u32,
    pub access_size: u32,
    pub shader_module_id: u32,
    pub instruction_index: u32,
    /// A single `VkShaderStageFlagBits` value.
    pub shader_stage: u32,
    /// An [`AccessKind`] value.
    pub access_kind: u32,
}

/// A decoded violation, produced by a failed bounds check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ViolationRecord {
    pub address: DeviceAddress,
    pub access_size: u32,
    pub shader_module_id: u32,
    /// The index of the faulting instruction in the original, uninstrumented program.
    pub instruction_index: u32,
    #[cfg_attr(feature = "serde", serde(with = "stage_bits"))]
    pub shader_stage: vk::ShaderStageFlags,
    pub access_kind: AccessKind,
}

impl ViolationRecord {
    /// Converts the record to its buffer layout, with the valid flag set.
    pub fn to_raw(&self) -> RawViolationRecord {
        RawViolationRecord {
            valid: 1,
            address_low: self.address as u32,
            address_high: (self.address >> 32) as u32,
            access_size: self.access_size,
            shader_module_id: self.shader_module_id,
            instruction_index: self.instruction_index,
            shader_stage: self.shader_stage.as_raw(),
            access_kind: self.access_kind as u32,
        }
    }

    /// Decodes a record from its buffer layout. Returns `None` if the slot isn't marked valid or
    /// the access kind is unknown.
    pub fn from_raw(raw: &RawViolationRecord) -> Option<Self> {
        if raw.valid != 1 {
            return None;
        }

        Some(ViolationRecord {
            address: u64::from(raw.address_low) | (u64::from(raw.address_high) << 32),
            access_size: raw.access_size,
            shader_module_id: raw.shader_module_id,
            instruction_index: raw.instruction_index,
            shader_stage: vk::ShaderStageFlags::from_raw(raw.shader_stage),
            access_kind: AccessKind::from_raw(raw.access_kind)?,
        })
    }

    /// Decodes a record from the first [`RECORD_SIZE`] little-endian bytes of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..RECORD_SIZE)?;
        let mut words = [0u32; RECORD_WORDS];

        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }

        Self::from_raw(&bytemuck::cast(words))
    }
}

#[cfg(feature = "serde")]
mod stage_bits {
    use ash::vk;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub(super) fn serialize<S: Serializer>(
        stage: &vk::ShaderStageFlags,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        stage.as_raw().serialize(serializer)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<vk::ShaderStageFlags, D::Error> {
        u32::deserialize(deserializer).map(vk::ShaderStageFlags::from_raw)
    }
}

/// A bounded many-writer, single-reader buffer of violation records.
#[derive(Debug)]
pub struct DiagnosticBuffer {
    words: Box<[AtomicU32]>,
    capacity: u32,
}

impl DiagnosticBuffer {
    /// Creates a new empty buffer with room for `capacity` records.
    pub fn new(capacity: u32) -> Self {
        let words = (0..HEADER_WORDS + capacity as usize * RECORD_WORDS)
            .map(|_| AtomicU32::new(0))
            .collect::<Box<[_]>>();
        words[CAPACITY_WORD].store(capacity, Ordering::Relaxed);

        DiagnosticBuffer { words, capacity }
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Returns the current value of the write cursor. This is the number of slot reservations
    /// that were attempted since the last reset, and can exceed the capacity.
    #[inline]
    pub fn write_cursor(&self) -> u32 {
        self.words[CURSOR_WORD].load(Ordering::Acquire)
    }

    /// Returns `true` if a reservation failed since the last reset.
    #[inline]
    pub fn overflowed(&self) -> bool {
        self.words[OVERFLOW_WORD].load(Ordering::Acquire) != 0
    }

    /// Reserves the next free slot. Returns `None` and raises the overflow flag if the buffer is
    /// full.
    ///
    /// This is a single atomic increment, it never blocks and never retries.
    #[inline]
    pub fn try_reserve_slot(&self) -> Option<u32> {
        let index = self.words[CURSOR_WORD].fetch_add(1, Ordering::Relaxed);

        if index < self.capacity {
            Some(index)
        } else {
            self.words[OVERFLOW_WORD].store(1, Ordering::Relaxed);
            None
        }
    }

    /// Writes `record` into the slot at `index`, which must have been reserved with
    /// [`try_reserve_slot`]. The valid flag is published last.
    ///
    /// [`try_reserve_slot`]: Self::try_reserve_slot
    pub fn write_record(&self, index: u32, record: &ViolationRecord) {
        let Some(slot) = self.slot(index) else {
            debug_assert!(false, "slot {index} is out of range");
            return;
        };

        let words: [u32; RECORD_WORDS] = bytemuck::cast(record.to_raw());

        for (dst, &src) in slot.iter().zip(&words).skip(1) {
            dst.store(src, Ordering::Relaxed);
        }

        slot[0].store(words[0], Ordering::Release);
    }

    /// Reserves a slot and writes `record` into it. Returns `false` if the buffer was full.
    #[inline]
    pub fn push(&self, record: &ViolationRecord) -> bool {
        match self.try_reserve_slot() {
            Some(index) => {
                self.write_record(index, record);
                true
            }
            None => false,
        }
    }

    /// Clears the cursor and the overflow flag, and invalidates every slot.
    ///
    /// Must not be called while a submission that writes to the buffer might still be executing.
    pub fn reset(&self) {
        for word in &self.words[HEADER_WORDS..] {
            word.store(0, Ordering::Relaxed);
        }

        self.words[OVERFLOW_WORD].store(0, Ordering::Relaxed);
        self.words[CURSOR_WORD].store(0, Ordering::Release);
    }

    /// Reads every valid record, in slot order.
    ///
    /// Slots are read up to the write cursor, capped at the capacity. A slot that was reserved but
    /// never written is skipped.
    pub fn drain(&self) -> Drained {
        let write_cursor = self.write_cursor();
        let count = cmp::min(write_cursor, self.capacity);
        let records = (0..count)
            .filter_map(|index| self.read_record(index))
            .collect();

        Drained {
            records,
            overflowed: self.overflowed(),
            write_cursor,
        }
    }

    /// Returns the little-endian byte image of the whole buffer, header included.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.words
            .iter()
            .flat_map(|word| word.load(Ordering::Acquire).to_le_bytes())
            .collect()
    }

    fn slot(&self, index: u32) -> Option<&[AtomicU32]> {
        if index >= self.capacity {
            return None;
        }

        let start = HEADER_WORDS + index as usize * RECORD_WORDS;

        self.words.get(start..start + RECORD_WORDS)
    }

    fn read_record(&self, index: u32) -> Option<ViolationRecord> {
        let slot = self.slot(index)?;

        if slot[0].load(Ordering::Acquire) == 0 {
            return None;
        }

        let mut words = [0u32; RECORD_WORDS];

        for (dst, src) in words.iter_mut().zip(slot) {
            *dst = src.load(Ordering::Relaxed);
        }

        ViolationRecord::from_raw(&bytemuck::cast(words))
    }
}

/// The contents of a [`DiagnosticBuffer`] after a submission completed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Drained {
    pub records: Vec<ViolationRecord>,

    /// Whether at least one violation was dropped because the buffer was full.
    pub overflowed: bool,

    /// The number of reservations that were attempted, including the dropped ones.
    pub write_cursor: u32,
}

/// Recycles diagnostic buffers of one capacity between command buffers.
#[derive(Debug)]
pub(crate) struct DiagnosticBufferPool {
    capacity: u32,
    // Buffers that were drained and reset, available for reuse.
    free: SegQueue<Arc<DiagnosticBuffer>>,
}

impl DiagnosticBufferPool {
    pub(crate) fn new(capacity: u32) -> Self {
        DiagnosticBufferPool {
            capacity,
            free: SegQueue::new(),
        }
    }

    /// Returns an empty buffer, reusing a released one if possible.
    pub(crate) fn acquire(&self) -> Arc<DiagnosticBuffer> {
        match self.free.pop() {
            Some(buffer) => {
                buffer.reset();
                buffer
            }
            None => Arc::new(DiagnosticBuffer::new(self.capacity)),
        }
    }

    pub(crate) fn release(&self, buffer: Arc<DiagnosticBuffer>) {
        buffer.reset();
        self.free.push(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn record(address: DeviceAddress, instruction_index: u32) -> ViolationRecord {
        ViolationRecord {
            address,
            access_size: 4,
            shader_module_id: 3,
            instruction_index,
            shader_stage: vk::ShaderStageFlags::VERTEX,
            access_kind: AccessKind::Write,
        }
    }

    #[test]
    fn record_layout() {
        assert_eq!(size_of::<RawViolationRecord>(), RECORD_SIZE);

        let buffer = DiagnosticBuffer::new(2);
        let record = ViolationRecord {
            address: 0x1234_5678_9abc_def0,
            access_size: 20,
            shader_module_id: 7,
            instruction_index: 11,
            shader_stage: vk::ShaderStageFlags::FRAGMENT,
            access_kind: AccessKind::Write,
        };
        assert!(buffer.push(&record));

        let bytes = buffer.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE + 2 * RECORD_SIZE);

        // Header
        assert_eq!(&bytes[0..4], &1u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &0u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &2u32.to_le_bytes());

        let slot = &bytes[HEADER_SIZE..HEADER_SIZE + RECORD_SIZE];
        assert_eq!(&slot[0..4], &1u32.to_le_bytes());
        assert_eq!(&slot[4..12], &0x1234_5678_9abc_def0u64.to_le_bytes());
        assert_eq!(&slot[12..16], &20u32.to_le_bytes());
        assert_eq!(&slot[16..20], &7u32.to_le_bytes());
        assert_eq!(&slot[20..24], &11u32.to_le_bytes());
        assert_eq!(
            &slot[24..28],
            &vk::ShaderStageFlags::FRAGMENT.as_raw().to_le_bytes(),
        );
        assert_eq!(&slot[28..32], &1u32.to_le_bytes());

        assert_eq!(ViolationRecord::from_bytes(slot), Some(record));
        // The second slot is empty.
        assert_eq!(ViolationRecord::from_bytes(&bytes[HEADER_SIZE + RECORD_SIZE..]), None);
    }

    #[test]
    fn reserve_until_full() {
        let buffer = DiagnosticBuffer::new(2);

        assert_eq!(buffer.try_reserve_slot(), Some(0));
        assert_eq!(buffer.try_reserve_slot(), Some(1));
        assert!(!buffer.overflowed());
        assert_eq!(buffer.try_reserve_slot(), None);
        assert_eq!(buffer.try_reserve_slot(), None);
        assert!(buffer.overflowed());
        assert_eq!(buffer.write_cursor(), 4);

        buffer.reset();
        assert!(!buffer.overflowed());
        assert_eq!(buffer.write_cursor(), 0);
        assert_eq!(buffer.try_reserve_slot(), Some(0));
    }

    #[test]
    fn reserved_but_unwritten_slot_is_skipped() {
        let buffer = DiagnosticBuffer::new(4);
        let first = buffer.try_reserve_slot().unwrap();
        let _second = buffer.try_reserve_slot().unwrap();
        buffer.write_record(first, &record(0x1000, 1));

        let drained = buffer.drain();
        assert_eq!(drained.records, vec![record(0x1000, 1)]);
        assert_eq!(drained.write_cursor, 2);
    }

    #[test]
    fn identical_records_are_kept() {
        let buffer = DiagnosticBuffer::new(8);

        for _ in 0..5 {
            assert!(buffer.push(&record(0xdead_0000, 4)));
        }

        let drained = buffer.drain();
        assert_eq!(drained.records.len(), 5);
        assert!(drained.records.iter().all(|r| *r == record(0xdead_0000, 4)));
        assert!(!drained.overflowed);
    }

    #[test]
    fn reset_invalidates_slots() {
        let buffer = DiagnosticBuffer::new(4);
        buffer.push(&record(0x1000, 1));
        buffer.push(&record(0x2000, 2));
        buffer.reset();

        assert!(buffer.drain().records.is_empty());
        assert!(buffer.to_bytes()[HEADER_SIZE..].iter().all(|&b| b == 0));
        assert_eq!(buffer.capacity(), 4);
        assert_eq!(&buffer.to_bytes()[8..12], &4u32.to_le_bytes());
    }

    #[test]
    fn concurrent_writers_overflow() {
        const CAPACITY: u32 = 64;
        const WRITERS: u64 = 16;
        const PER_WRITER: u64 = 32;

        let buffer = DiagnosticBuffer::new(CAPACITY);

        thread::scope(|scope| {
            for writer in 0..WRITERS {
                let buffer = &buffer;
                scope.spawn(move || {
                    for i in 0..PER_WRITER {
                        buffer.push(&record(writer << 32 | i, writer as u32));
                    }
                });
            }
        });

        let drained = buffer.drain();
        assert_eq!(drained.records.len(), CAPACITY as usize);
        assert!(drained.overflowed);
        assert_eq!(u64::from(drained.write_cursor), WRITERS * PER_WRITER);

        // Every record is intact: the instruction index always matches the writer encoded in the
        // high half of the address.
        for record in &drained.records {
            assert_eq!(u64::from(record.instruction_index), record.address >> 32);
            assert_eq!(record.access_size, 4);
        }
    }

    #[test]
    fn pool_reuses_reset_buffers() {
        let pool = DiagnosticBufferPool::new(4);
        let buffer = pool.acquire();
        buffer.push(&record(0x1000, 1));
        let ptr = Arc::as_ptr(&buffer);
        pool.release(buffer);

        let buffer = pool.acquire();
        assert_eq!(Arc::as_ptr(&buffer), ptr);
        assert!(buffer.drain().records.is_empty());

        let other = pool.acquire();
        assert_ne!(Arc::as_ptr(&other), ptr);
        assert_eq!(other.capacity(), 4);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn record_serializes_stage_as_bits() {
        let json = serde_json::to_value(record(0x1000, 5)).unwrap();

        assert_eq!(json["shader_stage"], vk::ShaderStageFlags::VERTEX.as_raw());
        assert_eq!(json["access_kind"], "Write");
    }
}
