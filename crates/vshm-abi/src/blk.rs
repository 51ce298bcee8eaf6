//! Block device config blob and request vocabulary.

use bytemuck::{Pod, Zeroable};

pub const VIRTIO_BLK_SECTOR_SIZE: u64 = 512;

// Feature bit numbers.
pub const VIRTIO_BLK_F_SIZE_MAX: u32 = 1;
pub const VIRTIO_BLK_F_SEG_MAX: u32 = 2;
pub const VIRTIO_BLK_F_GEOMETRY: u32 = 4;
pub const VIRTIO_BLK_F_RO: u32 = 5;
pub const VIRTIO_BLK_F_BLK_SIZE: u32 = 6;
pub const VIRTIO_BLK_F_FLUSH: u32 = 9;
pub const VIRTIO_BLK_F_TOPOLOGY: u32 = 10;
pub const VIRTIO_BLK_F_DISCARD: u32 = 13;
pub const VIRTIO_BLK_F_WRITE_ZEROES: u32 = 14;

pub const VIRTIO_BLK_T_IN: u32 = 0;
pub const VIRTIO_BLK_T_OUT: u32 = 1;
pub const VIRTIO_BLK_T_FLUSH: u32 = 4;
pub const VIRTIO_BLK_T_GET_ID: u32 = 8;
pub const VIRTIO_BLK_T_DISCARD: u32 = 11;
pub const VIRTIO_BLK_T_WRITE_ZEROES: u32 = 13;

pub const VIRTIO_BLK_S_OK: u8 = 0;
pub const VIRTIO_BLK_S_IOERR: u8 = 1;
pub const VIRTIO_BLK_S_UNSUPP: u8 = 2;

pub const VIRTIO_BLK_DISCARD_F_UNMAP: u32 = 0x0000_0001;
pub const VIRTIO_BLK_DISCARD_F_RESERVED: u32 = 0xFFFF_FFFE;

/// Length of the identification string returned by `GET_ID`.
pub const VIRTIO_BLK_ID_BYTES: usize = 20;

/// Request header at the start of every block request chain.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct BlkRequestHeader {
    pub req_type: u32,
    /// Unused.
    pub ioprio: u32,
    pub sector: u64,
}

impl BlkRequestHeader {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

/// Segment of a discard or write-zeroes request.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct BlkDiscardSegment {
    pub sector: u64,
    pub num_sectors: u32,
    pub flags: u32,
}

impl BlkDiscardSegment {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct BlkGeometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors: u8,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct BlkTopology {
    /// log2 of logical blocks per physical block.
    pub physical_block_exp: u8,
    pub alignment_offset: u8,
    pub min_io_size: u16,
    pub opt_io_size: u32,
}

/// Block device config blob.
///
/// The wire record is 60 bytes; `capacity` sits at offset 0 so 4-byte packing loses no
/// alignment that matters to readers of the shared region.
#[repr(C, packed(4))]
#[derive(Clone, Copy, Default, Pod, Zeroable)]
pub struct BlkConfig {
    /// Capacity in 512-byte sectors.
    pub capacity: u64,
    pub size_max: u32,
    pub seg_max: u32,
    pub geometry: BlkGeometry,
    pub blk_size: u32,
    pub topology: BlkTopology,
    pub writeback: u8,
    pub unused0: u8,
    pub num_queues: u16,
    pub max_discard_sectors: u32,
    pub max_discard_seg: u32,
    pub discard_sector_alignment: u32,
    pub max_write_zeroes_sectors: u32,
    pub max_write_zeroes_seg: u32,
    pub write_zeroes_may_unmap: u8,
    pub unused1: [u8; 3],
}

impl BlkConfig {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

impl core::fmt::Debug for BlkConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // Copy out of the packed struct before taking references.
        let capacity = self.capacity;
        let blk_size = self.blk_size;
        let seg_max = self.seg_max;
        let num_queues = self.num_queues;
        f.debug_struct("BlkConfig")
            .field("capacity", &capacity)
            .field("seg_max", &seg_max)
            .field("blk_size", &blk_size)
            .field("num_queues", &num_queues)
            .finish_non_exhaustive()
    }
}
