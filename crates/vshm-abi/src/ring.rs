//! Split-virtqueue ring structures and the fixed ring layout.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

/// Virtqueue descriptor table entry (`struct virtq_desc`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct VirtqDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl VirtqDesc {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub fn flags(&self) -> DescFlags {
        DescFlags::from_bits_retain(self.flags)
    }

    pub fn has_next(&self) -> bool {
        self.flags().contains(DescFlags::NEXT)
    }

    pub fn is_write_only(&self) -> bool {
        self.flags().contains(DescFlags::WRITE)
    }

    pub fn is_indirect(&self) -> bool {
        self.flags().contains(DescFlags::INDIRECT)
    }

    pub fn to_le_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..8].copy_from_slice(&self.addr.to_le_bytes());
        out[8..12].copy_from_slice(&self.len.to_le_bytes());
        out[12..14].copy_from_slice(&self.flags.to_le_bytes());
        out[14..16].copy_from_slice(&self.next.to_le_bytes());
        out
    }

    pub fn from_le_bytes(bytes: [u8; 16]) -> Self {
        Self {
            addr: u64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]),
            len: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            flags: u16::from_le_bytes([bytes[12], bytes[13]]),
            next: u16::from_le_bytes([bytes[14], bytes[15]]),
        }
    }
}

bitflags! {
    /// Descriptor flags.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct DescFlags: u16 {
        /// The buffer continues via `next`.
        const NEXT = 1;
        /// The buffer is device write-only (otherwise device read-only).
        const WRITE = 2;
        /// The buffer holds a table of descriptors.
        const INDIRECT = 4;
    }
}

/// Available ring header (the `ring[]` array and `used_event` follow it).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct VirtqAvailHeader {
    pub flags: u16,
    pub idx: u16,
}

/// Set by the driver: the device should not signal used-ring updates.
pub const VRING_AVAIL_F_NO_INTERRUPT: u16 = 1;

/// Used ring header (the `ring[]` array and `avail_event` follow it).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct VirtqUsedHeader {
    pub flags: u16,
    pub idx: u16,
}

/// Set by the device: the driver should not signal available-ring updates.
pub const VRING_USED_F_NO_NOTIFY: u16 = 1;

/// Used ring element (`struct virtq_used_elem`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct VirtqUsedElem {
    pub id: u32,
    pub len: u32,
}

impl VirtqUsedElem {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + (align - 1)) & !(align - 1)
}

/// Total bytes occupied by a split virtqueue of `num` entries whose used ring is aligned
/// to `align` (a power of two).
pub const fn vring_size(num: u16, align: u32) -> u64 {
    let num = num as u64;
    let avail_end = 16 * num + 6 + 2 * num;
    align_up(avail_end, align as u64) + 6 + 8 * num
}

/// Absolute addresses of the three parts of a split virtqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VringLayout {
    pub num: u16,
    pub desc: u64,
    pub avail: u64,
    pub used: u64,
    pub size: u64,
}

impl VringLayout {
    /// Returns `None` if `align` is not a power of two or the layout overflows `u64`.
    pub fn new(base: u64, num: u16, align: u32) -> Option<Self> {
        if !align.is_power_of_two() {
            return None;
        }
        let n = u64::from(num);
        let desc = base;
        let avail = desc.checked_add(16 * n)?;
        let avail_end = avail.checked_add(6 + 2 * n)?;
        let used = avail_end.checked_add(u64::from(align) - 1)? & !(u64::from(align) - 1);
        let size = vring_size(num, align);
        base.checked_add(size)?;
        Some(Self {
            num,
            desc,
            avail,
            used,
            size,
        })
    }

    pub fn end(&self) -> u64 {
        self.desc + self.size
    }

    pub fn desc_addr(&self, index: u16) -> u64 {
        self.desc + 16 * u64::from(index)
    }

    pub fn avail_flags_addr(&self) -> u64 {
        self.avail
    }

    pub fn avail_idx_addr(&self) -> u64 {
        self.avail + 2
    }

    pub fn avail_slot_addr(&self, ring_idx: u16) -> u64 {
        self.avail + 4 + 2 * u64::from(ring_idx % self.num)
    }

    pub fn used_event_addr(&self) -> u64 {
        self.avail + 4 + 2 * u64::from(self.num)
    }

    pub fn used_flags_addr(&self) -> u64 {
        self.used
    }

    pub fn used_idx_addr(&self) -> u64 {
        self.used + 2
    }

    pub fn used_slot_addr(&self, ring_idx: u16) -> u64 {
        self.used + 4 + 8 * u64::from(ring_idx % self.num)
    }

    pub fn avail_event_addr(&self) -> u64 {
        self.used + 4 + 8 * u64::from(self.num)
    }
}
