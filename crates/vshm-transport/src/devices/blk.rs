//! RAM-backed block device.

use tracing::{trace, warn};
use vshm_abi::blk::*;
use vshm_abi::{device_id, FeatureBits, VirtqDesc};

use crate::device::DeviceBackend;
use crate::error::Result;
use crate::memory::{AddressSpace, MemoryResult};
use crate::queue::DescriptorChain;

/// Upper bound on the data payload of a single request.
pub const MAX_REQUEST_DATA_BYTES: u64 = 4 * 1024 * 1024;

/// Upper bound on the sectors touched by a single request.
pub const MAX_REQUEST_SECTORS: u64 = MAX_REQUEST_DATA_BYTES / VIRTIO_BLK_SECTOR_SIZE;

const DEFAULT_QUEUE_SIZE: u16 = 128;

#[derive(Debug, Clone, Copy)]
struct Segment {
    addr: u64,
    len: u32,
    write: bool,
}

/// Block device over an in-memory disk image.
#[derive(Debug, Clone)]
pub struct RamBlock {
    data: Vec<u8>,
    id: [u8; VIRTIO_BLK_ID_BYTES],
    queue_size: u16,
    negotiated: FeatureBits,
    flushes: u64,
}

impl RamBlock {
    /// A zeroed disk of `sectors` 512-byte sectors.
    pub fn new(sectors: u64) -> Self {
        let len = sectors.saturating_mul(VIRTIO_BLK_SECTOR_SIZE) as usize;
        Self {
            data: vec![0; len],
            id: [0; VIRTIO_BLK_ID_BYTES],
            queue_size: DEFAULT_QUEUE_SIZE,
            negotiated: FeatureBits::empty(),
            flushes: 0,
        }
    }

    /// Use `image` as the disk contents. A trailing partial sector is zero-padded.
    pub fn from_image(mut image: Vec<u8>) -> Self {
        let sector = VIRTIO_BLK_SECTOR_SIZE as usize;
        let padded = image.len().div_ceil(sector) * sector;
        image.resize(padded, 0);
        Self {
            data: image,
            ..Self::new(0)
        }
    }

    /// Set the serial returned by `GET_ID`. Longer ids are truncated to 20 bytes.
    pub fn with_id(mut self, id: &[u8]) -> Self {
        let n = id.len().min(VIRTIO_BLK_ID_BYTES);
        self.id = [0; VIRTIO_BLK_ID_BYTES];
        self.id[..n].copy_from_slice(&id[..n]);
        self
    }

    pub fn with_queue_size(mut self, queue_size: u16) -> Self {
        self.queue_size = queue_size;
        self
    }

    pub fn capacity_sectors(&self) -> u64 {
        self.data.len() as u64 / VIRTIO_BLK_SECTOR_SIZE
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    pub fn config(&self) -> BlkConfig {
        let seg_max = u32::from(self.queue_size.saturating_sub(2)).max(1);
        let max_sectors = MAX_REQUEST_SECTORS as u32;
        BlkConfig {
            capacity: self.capacity_sectors(),
            seg_max,
            blk_size: VIRTIO_BLK_SECTOR_SIZE as u32,
            num_queues: 1,
            max_discard_sectors: max_sectors,
            max_discard_seg: seg_max,
            discard_sector_alignment: 1,
            max_write_zeroes_sectors: max_sectors,
            max_write_zeroes_seg: seg_max,
            write_zeroes_may_unmap: 1,
            ..BlkConfig::default()
        }
    }

    fn byte_range(&self, sector: u64, len: u64) -> Option<core::ops::Range<usize>> {
        let start = sector.checked_mul(VIRTIO_BLK_SECTOR_SIZE)?;
        let end = start.checked_add(len)?;
        if end > self.data.len() as u64 {
            return None;
        }
        Some(start as usize..end as usize)
    }

    fn read_into(&self, mem: &AddressSpace, sector: u64, segs: &[Segment]) -> MemoryResult<u8> {
        let total: u64 = segs.iter().map(|s| u64::from(s.len)).sum();
        if segs.iter().any(|s| !s.write) || total % VIRTIO_BLK_SECTOR_SIZE != 0 {
            return Ok(VIRTIO_BLK_S_IOERR);
        }
        let Some(range) = self.byte_range(sector, total) else {
            return Ok(VIRTIO_BLK_S_IOERR);
        };
        let mut at = range.start;
        for seg in segs {
            let len = seg.len as usize;
            mem.write(seg.addr, &self.data[at..at + len])?;
            at += len;
        }
        Ok(VIRTIO_BLK_S_OK)
    }

    fn write_from(
        &mut self,
        mem: &AddressSpace,
        sector: u64,
        segs: &[Segment],
    ) -> MemoryResult<u8> {
        let total: u64 = segs.iter().map(|s| u64::from(s.len)).sum();
        if segs.iter().any(|s| s.write) || total % VIRTIO_BLK_SECTOR_SIZE != 0 {
            return Ok(VIRTIO_BLK_S_IOERR);
        }
        let Some(range) = self.byte_range(sector, total) else {
            return Ok(VIRTIO_BLK_S_IOERR);
        };
        let mut at = range.start;
        for seg in segs {
            let len = seg.len as usize;
            mem.read(seg.addr, &mut self.data[at..at + len])?;
            at += len;
        }
        Ok(VIRTIO_BLK_S_OK)
    }

    fn get_id(&self, mem: &AddressSpace, segs: &[Segment]) -> MemoryResult<(u8, u32)> {
        if segs.is_empty() || segs.iter().any(|s| !s.write) {
            return Ok((VIRTIO_BLK_S_IOERR, 0));
        }
        let mut remaining: &[u8] = &self.id;
        let mut written = 0u32;
        for seg in segs {
            if remaining.is_empty() {
                break;
            }
            let n = (seg.len as usize).min(remaining.len());
            mem.write(seg.addr, &remaining[..n])?;
            remaining = &remaining[n..];
            written += n as u32;
        }
        Ok((VIRTIO_BLK_S_OK, written))
    }

    /// `DISCARD` and `WRITE_ZEROES` both zero the ranges; a RAM disk has nothing to reclaim.
    fn zero_ranges(
        &mut self,
        mem: &AddressSpace,
        segs: &[Segment],
        discard: bool,
    ) -> MemoryResult<u8> {
        let total: u64 = segs.iter().map(|s| u64::from(s.len)).sum();
        if segs.is_empty()
            || segs.iter().any(|s| s.write)
            || total % BlkDiscardSegment::SIZE as u64 != 0
        {
            return Ok(VIRTIO_BLK_S_IOERR);
        }
        let mut bytes = Vec::with_capacity(total as usize);
        for seg in segs {
            let start = bytes.len();
            bytes.resize(start + seg.len as usize, 0);
            mem.read(seg.addr, &mut bytes[start..])?;
        }
        let mut ranges = Vec::new();
        for raw in bytes.chunks_exact(BlkDiscardSegment::SIZE) {
            let seg: BlkDiscardSegment = bytemuck::pod_read_unaligned(raw);
            let reserved = if discard {
                VIRTIO_BLK_DISCARD_F_RESERVED | VIRTIO_BLK_DISCARD_F_UNMAP
            } else {
                VIRTIO_BLK_DISCARD_F_RESERVED
            };
            if seg.flags & reserved != 0 {
                return Ok(VIRTIO_BLK_S_UNSUPP);
            }
            if u64::from(seg.num_sectors) > MAX_REQUEST_SECTORS {
                return Ok(VIRTIO_BLK_S_IOERR);
            }
            let len = u64::from(seg.num_sectors) * VIRTIO_BLK_SECTOR_SIZE;
            let Some(range) = self.byte_range(seg.sector, len) else {
                return Ok(VIRTIO_BLK_S_IOERR);
            };
            ranges.push(range);
        }
        for range in ranges {
            self.data[range].fill(0);
        }
        Ok(VIRTIO_BLK_S_OK)
    }

    fn execute(
        &mut self,
        mem: &AddressSpace,
        header: &BlkRequestHeader,
        segs: &[Segment],
    ) -> MemoryResult<(u8, u32)> {
        let data_len: u64 = segs.iter().map(|s| u64::from(s.len)).sum();
        if data_len > MAX_REQUEST_DATA_BYTES {
            return Ok((VIRTIO_BLK_S_IOERR, 0));
        }
        Ok(match header.req_type {
            VIRTIO_BLK_T_IN => {
                let status = self.read_into(mem, header.sector, segs)?;
                let written = if status == VIRTIO_BLK_S_OK { data_len as u32 } else { 0 };
                (status, written)
            }
            VIRTIO_BLK_T_OUT => (self.write_from(mem, header.sector, segs)?, 0),
            VIRTIO_BLK_T_FLUSH => {
                if self.negotiated.contains(VIRTIO_BLK_F_FLUSH) {
                    self.flushes += 1;
                    (VIRTIO_BLK_S_OK, 0)
                } else {
                    (VIRTIO_BLK_S_UNSUPP, 0)
                }
            }
            VIRTIO_BLK_T_GET_ID => self.get_id(mem, segs)?,
            VIRTIO_BLK_T_DISCARD if self.negotiated.contains(VIRTIO_BLK_F_DISCARD) => {
                (self.zero_ranges(mem, segs, true)?, 0)
            }
            VIRTIO_BLK_T_WRITE_ZEROES if self.negotiated.contains(VIRTIO_BLK_F_WRITE_ZEROES) => {
                (self.zero_ranges(mem, segs, false)?, 0)
            }
            _ => (VIRTIO_BLK_S_UNSUPP, 0),
        })
    }
}

/// Split a request into its header, its data segments and its status descriptor.
///
/// The header may span several leading device-readable descriptors. Returns `None` when the
/// last descriptor cannot carry a status byte or the header is short.
fn split_request(
    descs: &[VirtqDesc],
    mem: &AddressSpace,
) -> MemoryResult<Option<(BlkRequestHeader, Vec<Segment>, u64)>> {
    let Some((status, body)) = descs.split_last() else {
        return Ok(None);
    };
    if !status.is_write_only() || status.len == 0 {
        return Ok(None);
    }

    let mut header = [0u8; BlkRequestHeader::SIZE];
    let mut filled = 0usize;
    let mut segs = Vec::new();
    for desc in body {
        let mut seg = Segment {
            addr: desc.addr,
            len: desc.len,
            write: desc.is_write_only(),
        };
        if filled < header.len() {
            if seg.write {
                return Ok(None);
            }
            let take = (seg.len as usize).min(header.len() - filled);
            mem.read(seg.addr, &mut header[filled..filled + take])?;
            filled += take;
            seg.addr += take as u64;
            seg.len -= take as u32;
        }
        if seg.len != 0 {
            segs.push(seg);
        }
    }
    if filled < header.len() {
        return Ok(None);
    }
    Ok(Some((bytemuck::pod_read_unaligned(&header), segs, status.addr)))
}

impl DeviceBackend for RamBlock {
    fn device_id(&self) -> u32 {
        device_id::BLOCK
    }

    fn host_features(&self) -> FeatureBits {
        FeatureBits::from_bits(&[
            VIRTIO_BLK_F_SEG_MAX,
            VIRTIO_BLK_F_BLK_SIZE,
            VIRTIO_BLK_F_FLUSH,
            VIRTIO_BLK_F_DISCARD,
            VIRTIO_BLK_F_WRITE_ZEROES,
        ])
    }

    fn num_queues(&self) -> u16 {
        1
    }

    fn queue_max_size(&self, _queue: u16) -> u16 {
        self.queue_size
    }

    fn device_config(&self) -> Vec<u8> {
        bytemuck::bytes_of(&self.config()).to_vec()
    }

    fn set_features(&mut self, features: &FeatureBits) -> Result<()> {
        self.negotiated = *features;
        Ok(())
    }

    fn process(&mut self, _queue: u16, chain: &DescriptorChain, mem: &AddressSpace) -> Result<u32> {
        let Some((header, segs, status_addr)) = split_request(chain.descriptors(), mem)? else {
            warn!(head = chain.head_index(), "block request without header or status");
            return Ok(0);
        };
        let (status, written) = match self.execute(mem, &header, &segs) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(head = chain.head_index(), error = %err, "block request buffer fault");
                (VIRTIO_BLK_S_IOERR, 0)
            }
        };
        mem.write(status_addr, &[status])?;
        trace!(
            head = chain.head_index(),
            req_type = header.req_type,
            sector = header.sector,
            status,
            "block request done"
        );
        Ok(written + 1)
    }

    fn malformed(&mut self, _queue: u16, partial: &[VirtqDesc], mem: &AddressSpace) {
        if let Some(status) = partial.iter().rev().find(|d| d.is_write_only() && d.len > 0) {
            // The chain is dropped either way; a failed status write changes nothing.
            let _ = mem.write(status.addr, &[VIRTIO_BLK_S_IOERR]);
        }
    }

    fn reset(&mut self) {
        self.negotiated = FeatureBits::empty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Rights, SharedMemory};
    use crate::queue::{Buffer, DeviceQueue, DriverQueue, Popped};
    use vshm_abi::VringLayout;

    const RING: u64 = 0x10_0000;
    const HDR: u64 = 0x20_0000;
    const DATA: u64 = 0x20_1000;
    const STATUS: u64 = 0x20_3000;

    struct Rig {
        mem: AddressSpace,
        drv: DriverQueue,
        dev: DeviceQueue,
        blk: RamBlock,
    }

    impl Rig {
        fn new() -> Self {
            let mut mem = AddressSpace::new();
            mem.map(RING, SharedMemory::new(0x4000), 0, 0x4000, Rights::RW)
                .unwrap();
            mem.map(HDR, SharedMemory::new(0x4000), 0, 0x4000, Rights::RW)
                .unwrap();
            let layout = VringLayout::new(RING, 16, 4096).unwrap();
            let drv = DriverQueue::new(layout, &mem).unwrap();
            let dev = DeviceQueue::new(layout, false, &mem).unwrap();
            let mut blk = RamBlock::new(16).with_id(b"vshm-ram0");
            blk.set_features(&blk.host_features()).unwrap();
            Self { mem, drv, dev, blk }
        }

        fn submit(&mut self, req_type: u32, sector: u64, data: Option<Buffer>) -> (u8, u32) {
            let header = BlkRequestHeader {
                req_type,
                ioprio: 0,
                sector,
            };
            self.mem.write(HDR, bytemuck::bytes_of(&header)).unwrap();
            self.mem.write(STATUS, &[0xff]).unwrap();
            let mut bufs = vec![Buffer::readable(HDR, BlkRequestHeader::SIZE as u32)];
            bufs.extend(data);
            bufs.push(Buffer::writable(STATUS, 1));
            self.drv.add(&self.mem, &bufs).unwrap().unwrap();
            let Some(Popped::Chain(chain)) = self.dev.pop(&self.mem).unwrap() else {
                panic!("expected a chain");
            };
            let len = self.blk.process(0, &chain, &self.mem).unwrap();
            let mut status = [0u8];
            self.mem.read(STATUS, &mut status).unwrap();
            (status[0], len)
        }
    }

    #[test]
    fn write_then_read_back() {
        let mut rig = Rig::new();
        let pattern: Vec<u8> = (0..1024u32).map(|i| (i * 7) as u8).collect();
        rig.mem.write(DATA, &pattern).unwrap();
        assert_eq!(
            rig.submit(VIRTIO_BLK_T_OUT, 2, Some(Buffer::readable(DATA, 1024))),
            (VIRTIO_BLK_S_OK, 1)
        );
        assert_eq!(&rig.blk.data()[1024..2048], &pattern[..]);

        rig.mem.fill(DATA, 1024, 0).unwrap();
        assert_eq!(
            rig.submit(VIRTIO_BLK_T_IN, 2, Some(Buffer::writable(DATA, 1024))),
            (VIRTIO_BLK_S_OK, 1025)
        );
        let mut back = vec![0u8; 1024];
        rig.mem.read(DATA, &mut back).unwrap();
        assert_eq!(back, pattern);
    }

    #[test]
    fn out_of_range_and_unaligned_requests_fail() {
        let mut rig = Rig::new();
        assert_eq!(
            rig.submit(VIRTIO_BLK_T_IN, 16, Some(Buffer::writable(DATA, 512))).0,
            VIRTIO_BLK_S_IOERR
        );
        assert_eq!(
            rig.submit(VIRTIO_BLK_T_IN, 0, Some(Buffer::writable(DATA, 100))).0,
            VIRTIO_BLK_S_IOERR
        );
        assert_eq!(
            rig.submit(VIRTIO_BLK_T_OUT, 0, Some(Buffer::writable(DATA, 512))).0,
            VIRTIO_BLK_S_IOERR
        );
    }

    #[test]
    fn flush_get_id_and_unknown_types() {
        let mut rig = Rig::new();
        assert_eq!(rig.submit(VIRTIO_BLK_T_FLUSH, 0, None).0, VIRTIO_BLK_S_OK);
        assert_eq!(rig.blk.flushes(), 1);

        assert_eq!(
            rig.submit(VIRTIO_BLK_T_GET_ID, 0, Some(Buffer::writable(DATA, 64))),
            (VIRTIO_BLK_S_OK, 21)
        );
        let mut id = [0u8; 9];
        rig.mem.read(DATA, &mut id).unwrap();
        assert_eq!(&id, b"vshm-ram0");

        assert_eq!(rig.submit(99, 0, None).0, VIRTIO_BLK_S_UNSUPP);

        rig.blk.reset();
        assert_eq!(rig.submit(VIRTIO_BLK_T_FLUSH, 0, None).0, VIRTIO_BLK_S_UNSUPP);
    }

    #[test]
    fn write_zeroes_and_discard_clear_ranges() {
        let mut rig = Rig::new();
        rig.blk.data_mut().fill(0xAB);
        let seg = BlkDiscardSegment {
            sector: 1,
            num_sectors: 2,
            flags: 0,
        };
        rig.mem.write(DATA, bytemuck::bytes_of(&seg)).unwrap();
        assert_eq!(
            rig.submit(VIRTIO_BLK_T_WRITE_ZEROES, 0, Some(Buffer::readable(DATA, 16))).0,
            VIRTIO_BLK_S_OK
        );
        assert!(rig.blk.data()[512..1536].iter().all(|&b| b == 0));
        assert_eq!(rig.blk.data()[0], 0xAB);
        assert_eq!(rig.blk.data()[1536], 0xAB);

        let bad = BlkDiscardSegment {
            sector: 4,
            num_sectors: 1,
            flags: VIRTIO_BLK_DISCARD_F_UNMAP,
        };
        rig.mem.write(DATA, bytemuck::bytes_of(&bad)).unwrap();
        assert_eq!(
            rig.submit(VIRTIO_BLK_T_DISCARD, 0, Some(Buffer::readable(DATA, 16))).0,
            VIRTIO_BLK_S_UNSUPP
        );
        assert_eq!(rig.blk.data()[4 * 512], 0xAB);
    }

    #[test]
    fn header_split_across_descriptors() {
        let mut rig = Rig::new();
        let header = BlkRequestHeader {
            req_type: VIRTIO_BLK_T_IN,
            ioprio: 0,
            sector: 0,
        };
        rig.mem.write(HDR, bytemuck::bytes_of(&header)).unwrap();
        rig.blk.data_mut()[..512].fill(0x5A);
        let bufs = [
            Buffer::readable(HDR, 4),
            Buffer::readable(HDR + 4, 12),
            Buffer::writable(DATA, 512),
            Buffer::writable(STATUS, 1),
        ];
        rig.drv.add(&rig.mem, &bufs).unwrap().unwrap();
        let Some(Popped::Chain(chain)) = rig.dev.pop(&rig.mem).unwrap() else {
            panic!("expected a chain");
        };
        assert_eq!(rig.blk.process(0, &chain, &rig.mem).unwrap(), 513);
        let mut byte = [0u8];
        rig.mem.read(DATA + 511, &mut byte).unwrap();
        assert_eq!(byte[0], 0x5A);
    }

    #[test]
    fn config_blob_describes_the_disk() {
        let blk = RamBlock::new(2048).with_queue_size(64);
        let cfg = blk.config();
        let (capacity, seg_max, blk_size) = (cfg.capacity, cfg.seg_max, cfg.blk_size);
        assert_eq!(capacity, 2048);
        assert_eq!(seg_max, 62);
        assert_eq!(blk_size, 512);
        assert_eq!(blk.device_config().len(), BlkConfig::SIZE);

        let img = RamBlock::from_image(vec![1; 700]);
        assert_eq!(img.capacity_sectors(), 2);
        assert_eq!(img.data()[699], 1);
        assert_eq!(img.data()[700], 0);
    }
}
