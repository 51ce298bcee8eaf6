//! Shared memory objects and the device's guest-physical view of them.
//!
//! Memory shared between domains is mutated concurrently by the other side, so plain loads
//! and stores would be data races. Every access therefore goes through atomics on the
//! backing 64-bit words: byte copies use relaxed word loads and compare-exchange updates,
//! and the few synchronizing fields (ring indices, generation, status) get aligned 16/32-bit
//! loads and stores with an explicit [`Ordering`]. No `unsafe` is involved and no location
//! is ever accessed with mixed-size atomics.
//!
//! Values are stored little-endian: byte `k` of a word lives in bits `8k..8k + 8`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

use crate::error::{MemoryError, Result, TransportError};

bitflags! {
    /// Access rights attached to a capability or a registered region.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct Rights: u8 {
        const READ = 1;
        const WRITE = 2;
        /// May trigger a notification object.
        const SIGNAL = 4;
    }
}

impl Rights {
    pub const RW: Rights = Rights::READ.union(Rights::WRITE);
}

pub type MemoryResult<T> = core::result::Result<T, MemoryError>;

/// A shared-memory object. Cloning yields another handle to the same bytes.
#[derive(Clone)]
pub struct SharedMemory {
    words: Arc<[AtomicU64]>,
    len: u64,
}

impl fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemory")
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

fn load_order(order: Ordering) -> Ordering {
    match order {
        Ordering::Release | Ordering::Relaxed => Ordering::Relaxed,
        Ordering::AcqRel => Ordering::Acquire,
        other => other,
    }
}

fn update_order(order: Ordering) -> (Ordering, Ordering) {
    match order {
        Ordering::SeqCst => (Ordering::SeqCst, Ordering::SeqCst),
        Ordering::Acquire | Ordering::AcqRel => (order, Ordering::Acquire),
        _ => (order, Ordering::Relaxed),
    }
}

impl SharedMemory {
    /// Allocate `len` zeroed bytes.
    pub fn new(len: usize) -> Self {
        let words = len.div_ceil(8);
        Self {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
            len: len as u64,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether both handles name the same object.
    pub fn same_object(&self, other: &SharedMemory) -> bool {
        Arc::ptr_eq(&self.words, &other.words)
    }

    fn check_range(&self, offset: u64, len: usize) -> MemoryResult<()> {
        let err = MemoryError::OutOfRange {
            offset,
            len,
            size: self.len,
        };
        let end = offset.checked_add(len as u64).ok_or(err.clone())?;
        if end > self.len {
            return Err(err);
        }
        Ok(())
    }

    fn check_aligned(&self, offset: u64, width: usize) -> MemoryResult<()> {
        self.check_range(offset, width)?;
        if offset % width as u64 != 0 {
            return Err(MemoryError::Misaligned { offset, width });
        }
        Ok(())
    }

    fn word(&self, offset: u64) -> &AtomicU64 {
        &self.words[(offset / 8) as usize]
    }

    /// Replace the bits selected by `mask` (already shifted into place) in the word holding
    /// `offset`.
    fn update_word(&self, offset: u64, mask: u64, bits: u64, order: Ordering) {
        let (set, fetch) = update_order(order);
        // The closure never returns `None`, so the update cannot fail.
        let _ = self
            .word(offset)
            .fetch_update(set, fetch, |w| Some((w & !mask) | (bits & mask)));
    }

    /// Copy bytes out of the object.
    pub fn read(&self, offset: u64, dst: &mut [u8]) -> MemoryResult<()> {
        self.check_range(offset, dst.len())?;
        let mut pos = offset;
        let mut done = 0usize;
        while done < dst.len() {
            let shift = (pos % 8) as usize;
            let take = (8 - shift).min(dst.len() - done);
            let bytes = self.word(pos).load(Ordering::Relaxed).to_le_bytes();
            dst[done..done + take].copy_from_slice(&bytes[shift..shift + take]);
            done += take;
            pos += take as u64;
        }
        Ok(())
    }

    /// Copy bytes into the object.
    pub fn write(&self, offset: u64, src: &[u8]) -> MemoryResult<()> {
        self.check_range(offset, src.len())?;
        let mut pos = offset;
        let mut done = 0usize;
        while done < src.len() {
            let shift = (pos % 8) as usize;
            let take = (8 - shift).min(src.len() - done);
            let mut bytes = [0u8; 8];
            let mut mask = [0u8; 8];
            bytes[shift..shift + take].copy_from_slice(&src[done..done + take]);
            mask[shift..shift + take].fill(0xff);
            self.update_word(
                pos,
                u64::from_le_bytes(mask),
                u64::from_le_bytes(bytes),
                Ordering::Relaxed,
            );
            done += take;
            pos += take as u64;
        }
        Ok(())
    }

    pub fn fill(&self, offset: u64, len: usize, value: u8) -> MemoryResult<()> {
        self.check_range(offset, len)?;
        let chunk = [value; 64];
        let mut done = 0usize;
        while done < len {
            let take = chunk.len().min(len - done);
            self.write(offset + done as u64, &chunk[..take])?;
            done += take;
        }
        Ok(())
    }

    pub fn load_u16(&self, offset: u64, order: Ordering) -> MemoryResult<u16> {
        self.check_aligned(offset, 2)?;
        let w = self.word(offset).load(load_order(order));
        Ok((w >> ((offset % 8) * 8)) as u16)
    }

    pub fn store_u16(&self, offset: u64, value: u16, order: Ordering) -> MemoryResult<()> {
        self.check_aligned(offset, 2)?;
        let shift = (offset % 8) * 8;
        self.update_word(offset, 0xffff << shift, u64::from(value) << shift, order);
        Ok(())
    }

    pub fn load_u32(&self, offset: u64, order: Ordering) -> MemoryResult<u32> {
        self.check_aligned(offset, 4)?;
        let w = self.word(offset).load(load_order(order));
        Ok((w >> ((offset % 8) * 8)) as u32)
    }

    pub fn store_u32(&self, offset: u64, value: u32, order: Ordering) -> MemoryResult<()> {
        self.check_aligned(offset, 4)?;
        let shift = (offset % 8) * 8;
        self.update_word(
            offset,
            0xffff_ffff << shift,
            u64::from(value) << shift,
            order,
        );
        Ok(())
    }

    /// Compare-and-swap on an aligned 32-bit field. Returns the previous value on failure.
    pub fn compare_exchange_u32(
        &self,
        offset: u64,
        current: u32,
        new: u32,
        success: Ordering,
        failure: Ordering,
    ) -> MemoryResult<core::result::Result<u32, u32>> {
        self.check_aligned(offset, 4)?;
        let shift = (offset % 8) * 8;
        let mask = 0xffff_ffffu64 << shift;
        let word = self.word(offset);
        let mut w = word.load(failure);
        loop {
            let found = (w >> shift) as u32;
            if found != current {
                return Ok(Err(found));
            }
            let next = (w & !mask) | (u64::from(new) << shift);
            match word.compare_exchange_weak(w, next, success, failure) {
                Ok(_) => return Ok(Ok(current)),
                Err(actual) => w = actual,
            }
        }
    }

    /// A bounds-checked window `[offset, offset + len)` of this object.
    pub fn view(&self, offset: u64, len: u64) -> MemoryResult<RegionView> {
        let len_usize = usize::try_from(len).map_err(|_| MemoryError::OutOfRange {
            offset,
            len: usize::MAX,
            size: self.len,
        })?;
        self.check_range(offset, len_usize)?;
        Ok(RegionView {
            mem: self.clone(),
            base: offset,
            len,
        })
    }
}

/// A window into a [`SharedMemory`] object. Offsets are relative to the window start and
/// every access is checked against the window length.
#[derive(Debug, Clone)]
pub struct RegionView {
    mem: SharedMemory,
    base: u64,
    len: u64,
}

impl RegionView {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn memory(&self) -> &SharedMemory {
        &self.mem
    }

    fn at(&self, offset: u64, len: usize) -> MemoryResult<u64> {
        let err = MemoryError::OutOfRange {
            offset,
            len,
            size: self.len,
        };
        let end = offset.checked_add(len as u64).ok_or(err.clone())?;
        if end > self.len {
            return Err(err);
        }
        Ok(self.base + offset)
    }

    /// Narrow the view further.
    pub fn subview(&self, offset: u64, len: u64) -> MemoryResult<RegionView> {
        let len_usize = usize::try_from(len).map_err(|_| MemoryError::OutOfRange {
            offset,
            len: usize::MAX,
            size: self.len,
        })?;
        let base = self.at(offset, len_usize)?;
        Ok(RegionView {
            mem: self.mem.clone(),
            base,
            len,
        })
    }

    pub fn read(&self, offset: u64, dst: &mut [u8]) -> MemoryResult<()> {
        let at = self.at(offset, dst.len())?;
        self.mem.read(at, dst)
    }

    pub fn write(&self, offset: u64, src: &[u8]) -> MemoryResult<()> {
        let at = self.at(offset, src.len())?;
        self.mem.write(at, src)
    }

    pub fn read_u32_le(&self, offset: u64) -> MemoryResult<u32> {
        let mut buf = [0u8; 4];
        self.read(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_u32_le(&self, offset: u64, value: u32) -> MemoryResult<()> {
        self.write(offset, &value.to_le_bytes())
    }

    pub fn read_u16_le(&self, offset: u64) -> MemoryResult<u16> {
        let mut buf = [0u8; 2];
        self.read(offset, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn write_u16_le(&self, offset: u64, value: u16) -> MemoryResult<()> {
        self.write(offset, &value.to_le_bytes())
    }

    pub fn load_u32(&self, offset: u64, order: Ordering) -> MemoryResult<u32> {
        let at = self.at(offset, 4)?;
        self.mem.load_u32(at, order)
    }

    pub fn store_u32(&self, offset: u64, value: u32, order: Ordering) -> MemoryResult<()> {
        let at = self.at(offset, 4)?;
        self.mem.store_u32(at, value, order)
    }

    pub fn compare_exchange_u32(
        &self,
        offset: u64,
        current: u32,
        new: u32,
        success: Ordering,
        failure: Ordering,
    ) -> MemoryResult<core::result::Result<u32, u32>> {
        let at = self.at(offset, 4)?;
        self.mem
            .compare_exchange_u32(at, current, new, success, failure)
    }
}

/// One registered window of a shared-memory object.
#[derive(Debug, Clone)]
pub struct Mapping {
    pub gpa: u64,
    pub size: u64,
    pub offset: u64,
    pub rights: Rights,
    mem: SharedMemory,
}

impl Mapping {
    pub fn end(&self) -> u64 {
        self.gpa + self.size
    }

    fn contains(&self, gpa: u64, len: u64) -> bool {
        gpa >= self.gpa && gpa.checked_add(len).is_some_and(|end| end <= self.end())
    }
}

/// Guest-physical address space built from registered regions.
///
/// An access must fall entirely inside a single mapping and the mapping must grant the
/// needed rights.
#[derive(Debug, Clone, Default)]
pub struct AddressSpace {
    mappings: Vec<Mapping>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `[offset, offset + size)` of `mem` at guest-physical `gpa`.
    ///
    /// The window must lie inside `mem`, must not overlap an existing mapping, and `gpa` must
    /// share 8-byte alignment with `offset` so aligned guest-physical fields stay aligned in
    /// the backing object.
    pub fn map(
        &mut self,
        gpa: u64,
        mem: SharedMemory,
        offset: u64,
        size: u64,
        rights: Rights,
    ) -> Result<()> {
        if size == 0 {
            return Err(TransportError::InvalidArgument("region size is zero"));
        }
        let window_end = offset
            .checked_add(size)
            .ok_or(TransportError::InvalidArgument("region window overflows"))?;
        if window_end > mem.len() {
            return Err(TransportError::InvalidArgument(
                "region window exceeds the memory object",
            ));
        }
        let gpa_end = gpa
            .checked_add(size)
            .ok_or(TransportError::InvalidArgument("guest-physical range overflows"))?;
        if gpa % 8 != offset % 8 {
            return Err(TransportError::InvalidArgument(
                "guest-physical base and window offset are not co-aligned",
            ));
        }
        if self
            .mappings
            .iter()
            .any(|m| gpa < m.end() && m.gpa < gpa_end)
        {
            return Err(TransportError::InvalidArgument(
                "guest-physical range overlaps a registered region",
            ));
        }
        let pos = self.mappings.partition_point(|m| m.gpa < gpa);
        self.mappings.insert(
            pos,
            Mapping {
                gpa,
                size,
                offset,
                rights,
                mem,
            },
        );
        Ok(())
    }

    pub fn clear(&mut self) {
        self.mappings.clear();
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn mappings(&self) -> impl Iterator<Item = &Mapping> {
        self.mappings.iter()
    }

    fn translate(
        &self,
        gpa: u64,
        len: usize,
        needed: Rights,
    ) -> MemoryResult<(&SharedMemory, u64)> {
        let pos = self.mappings.partition_point(|m| m.gpa <= gpa);
        let mapping = pos
            .checked_sub(1)
            .map(|i| &self.mappings[i])
            .filter(|m| m.contains(gpa, len as u64))
            .ok_or(MemoryError::Unmapped { gpa, len })?;
        if !mapping.rights.contains(needed) {
            return Err(MemoryError::Denied {
                gpa,
                needed,
                granted: mapping.rights,
            });
        }
        Ok((&mapping.mem, mapping.offset + (gpa - mapping.gpa)))
    }

    /// Check that `[gpa, gpa + len)` is mapped with at least `needed`.
    pub fn check(&self, gpa: u64, len: u64, needed: Rights) -> MemoryResult<()> {
        let len_usize = usize::try_from(len).map_err(|_| MemoryError::Unmapped {
            gpa,
            len: usize::MAX,
        })?;
        self.translate(gpa, len_usize, needed).map(|_| ())
    }

    pub fn read(&self, gpa: u64, dst: &mut [u8]) -> MemoryResult<()> {
        let (mem, at) = self.translate(gpa, dst.len(), Rights::READ)?;
        mem.read(at, dst)
    }

    pub fn write(&self, gpa: u64, src: &[u8]) -> MemoryResult<()> {
        let (mem, at) = self.translate(gpa, src.len(), Rights::WRITE)?;
        mem.write(at, src)
    }

    pub fn fill(&self, gpa: u64, len: usize, value: u8) -> MemoryResult<()> {
        let (mem, at) = self.translate(gpa, len, Rights::WRITE)?;
        mem.fill(at, len, value)
    }

    pub fn read_u16_le(&self, gpa: u64) -> MemoryResult<u16> {
        let mut buf = [0u8; 2];
        self.read(gpa, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u32_le(&self, gpa: u64) -> MemoryResult<u32> {
        let mut buf = [0u8; 4];
        self.read(gpa, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_u32_le(&self, gpa: u64, value: u32) -> MemoryResult<()> {
        self.write(gpa, &value.to_le_bytes())
    }

    pub fn load_u16(&self, gpa: u64, order: Ordering) -> MemoryResult<u16> {
        let (mem, at) = self.translate(gpa, 2, Rights::READ)?;
        mem.load_u16(at, order)
    }

    pub fn store_u16(&self, gpa: u64, value: u16, order: Ordering) -> MemoryResult<()> {
        let (mem, at) = self.translate(gpa, 2, Rights::WRITE)?;
        mem.store_u16(at, value, order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_copies_straddle_words() {
        let mem = SharedMemory::new(32);
        let src: Vec<u8> = (1..=13).collect();
        mem.write(5, &src).unwrap();
        let mut dst = [0u8; 13];
        mem.read(5, &mut dst).unwrap();
        assert_eq!(&dst[..], &src[..]);

        let mut around = [0xAAu8; 2];
        mem.read(4, &mut around[..1]).unwrap();
        mem.read(18, &mut around[1..]).unwrap();
        assert_eq!(around, [0, 0]);
    }

    #[test]
    fn narrow_atomics_see_little_endian_bytes() {
        let mem = SharedMemory::new(16);
        mem.write(8, &[0x34, 0x12, 0x78, 0x56]).unwrap();
        assert_eq!(mem.load_u16(8, Ordering::Acquire).unwrap(), 0x1234);
        assert_eq!(mem.load_u32(8, Ordering::Acquire).unwrap(), 0x5678_1234);

        mem.store_u16(10, 0xBEEF, Ordering::Release).unwrap();
        let mut buf = [0u8; 4];
        mem.read(8, &mut buf).unwrap();
        assert_eq!(buf, [0x34, 0x12, 0xEF, 0xBE]);
    }

    #[test]
    fn misaligned_and_out_of_range_accesses_fail() {
        let mem = SharedMemory::new(10);
        assert_eq!(
            mem.load_u16(3, Ordering::Relaxed),
            Err(MemoryError::Misaligned {
                offset: 3,
                width: 2
            })
        );
        assert!(matches!(
            mem.load_u32(8, Ordering::Relaxed),
            Err(MemoryError::OutOfRange { .. })
        ));
        assert!(mem.write(9, &[1, 2]).is_err());
        assert!(mem.read(u64::MAX, &mut [0u8; 1]).is_err());
    }

    #[test]
    fn compare_exchange_reports_current_value() {
        let mem = SharedMemory::new(8);
        mem.store_u32(4, 7, Ordering::Relaxed).unwrap();
        assert_eq!(
            mem.compare_exchange_u32(4, 1, 2, Ordering::AcqRel, Ordering::Acquire)
                .unwrap(),
            Err(7)
        );
        assert_eq!(
            mem.compare_exchange_u32(4, 7, 9, Ordering::AcqRel, Ordering::Acquire)
                .unwrap(),
            Ok(7)
        );
        assert_eq!(mem.load_u32(4, Ordering::Acquire).unwrap(), 9);
        assert_eq!(mem.load_u32(0, Ordering::Acquire).unwrap(), 0);
    }

    #[test]
    fn views_are_bounds_checked_relative_to_their_window() {
        let mem = SharedMemory::new(64);
        let view = mem.view(16, 16).unwrap();
        view.write_u32_le(12, 0xDEAD_BEEF).unwrap();
        assert_eq!(mem.load_u32(28, Ordering::Relaxed).unwrap(), 0xDEAD_BEEF);
        assert!(view.write_u32_le(13, 0).is_err());
        assert!(view.subview(8, 9).is_err());
        assert!(mem.view(60, 8).is_err());
    }

    #[test]
    fn address_space_translates_and_enforces_rights() {
        let mem = SharedMemory::new(0x2000);
        let mut space = AddressSpace::new();
        space
            .map(0x10_0000, mem.clone(), 0x1000, 0x1000, Rights::READ)
            .unwrap();

        mem.write(0x1010, &[9, 8, 7]).unwrap();
        let mut buf = [0u8; 3];
        space.read(0x10_0010, &mut buf).unwrap();
        assert_eq!(buf, [9, 8, 7]);

        assert!(matches!(
            space.write(0x10_0010, &[1]),
            Err(MemoryError::Denied { .. })
        ));
        assert!(matches!(
            space.read(0x10_0FFF, &mut [0u8; 2]),
            Err(MemoryError::Unmapped { .. })
        ));
        assert!(matches!(
            space.read(0xF_FFFF, &mut [0u8; 1]),
            Err(MemoryError::Unmapped { .. })
        ));
    }

    #[test]
    fn address_space_rejects_bad_windows() {
        let mem = SharedMemory::new(0x1000);
        let mut space = AddressSpace::new();
        assert!(space.map(0, mem.clone(), 0, 0, Rights::RW).is_err());
        assert!(space.map(0, mem.clone(), 0x800, 0x801, Rights::RW).is_err());
        assert!(space.map(u64::MAX - 4, mem.clone(), 0, 0x10, Rights::RW).is_err());
        assert!(space.map(0x1004, mem.clone(), 0, 0x10, Rights::RW).is_err());

        space.map(0x1000, mem.clone(), 0, 0x800, Rights::RW).unwrap();
        assert!(space.map(0x17F8, mem.clone(), 0x800, 0x10, Rights::RW).is_err());
        space.map(0x1800, mem, 0x800, 0x800, Rights::RW).unwrap();
        assert_eq!(space.len(), 2);
    }
}
