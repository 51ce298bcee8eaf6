//! The shared config region: header, queue-config array and device config blob.
//!
//! The device publishes multi-word changes with a seqlock on `generation`:
//!
//! 1) set [`GENERATION_BUSY_BIT`] with a compare-exchange,
//! 2) write the fields,
//! 3) store `start + 1` with the busy bit cleared (release).
//!
//! Generations therefore count modulo 2^31: `0x7fff_ffff` is followed by 0. Readers snapshot
//! the generation, read, and retry if it was busy or differs from the snapshot; they never
//! order two generations. The retry loop is bounded; running out of attempts is a
//! [`ProtocolViolation::GenerationUnstable`].

use std::sync::atomic::{fence, Ordering};

use bytemuck::Pod;
use tracing::trace;
use vshm_abi::{
    hdr_offset, ConfigHeader, DeviceStatus, FeatureBits, IrqStatus, QueueConfigEntry,
    CONFIG_MAGIC,
};

use crate::error::{ProtocolViolation, Result, TransportError};
use crate::memory::{MemoryResult, RegionView, SharedMemory};

/// Set in `generation` while the device is in the middle of an update.
pub const GENERATION_BUSY_BIT: u32 = 1 << 31;

const GEN: u64 = hdr_offset::GENERATION as u64;
const STATUS: u64 = hdr_offset::STATUS as u64;
const IRQ_STATUS: u64 = hdr_offset::IRQ_STATUS as u64;
const FEATURE_BYTES: usize = 32;

fn align8(v: u64) -> u64 {
    (v + 7) & !7
}

fn feature_words(bytes: &[u8; FEATURE_BYTES]) -> FeatureBits {
    let mut words = [0u32; 8];
    for (i, w) in words.iter_mut().enumerate() {
        *w = u32::from_le_bytes([
            bytes[4 * i],
            bytes[4 * i + 1],
            bytes[4 * i + 2],
            bytes[4 * i + 3],
        ]);
    }
    FeatureBits::from_words(words)
}

fn feature_bytes(features: &FeatureBits) -> [u8; FEATURE_BYTES] {
    let mut out = [0u8; FEATURE_BYTES];
    for (i, w) in features.words().iter().enumerate() {
        out[4 * i..4 * i + 4].copy_from_slice(&w.to_le_bytes());
    }
    out
}

fn read_entry(view: &RegionView, at: u64) -> MemoryResult<QueueConfigEntry> {
    let mut buf = [0u8; QueueConfigEntry::SIZE];
    view.read(at, &mut buf)?;
    Ok(QueueConfigEntry {
        num_max: u16::from_le_bytes([buf[0], buf[1]]),
        num: u16::from_le_bytes([buf[2], buf[3]]),
        align: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        pfn: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
    })
}

/// Snapshot `generation`, run `read`, and accept the result only if `generation` was not busy
/// and did not move in between.
pub fn read_with_generation_guard<T>(
    view: &RegionView,
    retry_limit: u32,
    mut read: impl FnMut(&RegionView) -> MemoryResult<T>,
) -> Result<T> {
    let attempts = retry_limit.max(1);
    for _ in 0..attempts {
        let gen0 = view.load_u32(GEN, Ordering::Acquire)?;
        if gen0 & GENERATION_BUSY_BIT != 0 {
            std::hint::spin_loop();
            continue;
        }
        let value = read(view)?;
        fence(Ordering::Acquire);
        let gen1 = view.load_u32(GEN, Ordering::Relaxed)?;
        if gen0 == gen1 {
            return Ok(value);
        }
        trace!(gen0, gen1, "config changed during read; retrying");
    }
    Err(ProtocolViolation::GenerationUnstable { attempts }.into())
}

/// Offsets of the variable parts of the config region, validated against its length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigLayout {
    pub num_queues: u32,
    pub queues_offset: u32,
    pub dev_cfg_offset: u32,
    /// Bytes from `dev_cfg_offset` to the end of the region.
    pub dev_cfg_len: u64,
}

impl ConfigLayout {
    /// Layout a device lays out for itself: header, then the queue array, then the blob,
    /// each 8-byte aligned.
    pub fn for_device(num_queues: u32, dev_cfg_len: u64) -> Self {
        let queues_offset = align8(ConfigHeader::SIZE as u64);
        let dev_cfg_offset =
            align8(queues_offset + u64::from(num_queues) * QueueConfigEntry::SIZE as u64);
        Self {
            num_queues,
            queues_offset: queues_offset as u32,
            dev_cfg_offset: dev_cfg_offset as u32,
            dev_cfg_len: align8(dev_cfg_len),
        }
    }

    pub fn region_len(&self) -> u64 {
        u64::from(self.dev_cfg_offset) + self.dev_cfg_len
    }

    /// Check header-supplied offsets against a region of `region_len` bytes.
    pub fn validate(
        num_queues: u32,
        queues_offset: u32,
        dev_cfg_offset: u32,
        region_len: u64,
    ) -> Result<Self> {
        let queues_end = u64::from(num_queues)
            .checked_mul(QueueConfigEntry::SIZE as u64)
            .and_then(|len| len.checked_add(u64::from(queues_offset)))
            .ok_or(ProtocolViolation::BadLayout("queue array overflows"))?;
        if queues_end > region_len {
            return Err(ProtocolViolation::BadLayout("queue array exceeds the region").into());
        }
        let dev_cfg_len = region_len
            .checked_sub(u64::from(dev_cfg_offset))
            .ok_or(ProtocolViolation::BadLayout(
                "device config offset exceeds the region",
            ))?;
        Ok(Self {
            num_queues,
            queues_offset,
            dev_cfg_offset,
            dev_cfg_len,
        })
    }

    fn entry_offset(&self, index: u32) -> Result<u64> {
        if index >= self.num_queues {
            return Err(TransportError::OutOfRange("queue index"));
        }
        Ok(u64::from(self.queues_offset) + u64::from(index) * QueueConfigEntry::SIZE as u64)
    }
}

/// Identity fields of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub version: u32,
    pub device: u32,
    pub vendor: u32,
    pub host_features: FeatureBits,
}

/// Fields a device writes into a fresh header.
#[derive(Debug, Clone)]
pub struct HeaderInit<'a> {
    pub device: u32,
    pub vendor: u32,
    pub version: u32,
    pub host_features: FeatureBits,
    pub guest_page_size: u32,
    pub queue_num_max: &'a [u16],
    pub device_config: &'a [u8],
    /// Minimum bytes reserved for the blob.
    pub device_config_reserve: u64,
}

/// Device-side owner of the config region.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    view: RegionView,
    layout: ConfigLayout,
}

impl DeviceConfig {
    /// Allocate and initialize a config region.
    pub fn create(init: &HeaderInit<'_>) -> Result<Self> {
        let num_queues = u32::try_from(init.queue_num_max.len())
            .map_err(|_| TransportError::InvalidArgument("too many queues"))?;
        let blob_len = (init.device_config.len() as u64).max(init.device_config_reserve);
        let layout = ConfigLayout::for_device(num_queues, blob_len);
        let len = usize::try_from(layout.region_len())
            .map_err(|_| TransportError::InvalidArgument("config region too large"))?;
        let mem = SharedMemory::new(len);
        let view = mem.view(0, layout.region_len())?;

        let header = ConfigHeader {
            magic: CONFIG_MAGIC,
            version: init.version,
            device: init.device,
            vendor: init.vendor,
            num_queues,
            queues_offset: layout.queues_offset,
            dev_cfg_offset: layout.dev_cfg_offset,
            generation: 0,
            status: 0,
            irq_status: 0,
            host_features: init.host_features.words(),
            guest_features: [0; 8],
            guest_page_size: init.guest_page_size,
        };
        view.write(0, bytemuck::bytes_of(&header))?;
        let config = Self { view, layout };
        for (i, &num_max) in init.queue_num_max.iter().enumerate() {
            let at = config.layout.entry_offset(i as u32)?;
            config.view.write(
                at,
                bytemuck::bytes_of(&QueueConfigEntry {
                    num_max,
                    ..Default::default()
                }),
            )?;
        }
        config
            .view
            .write(u64::from(layout.dev_cfg_offset), init.device_config)?;
        Ok(config)
    }

    pub fn memory(&self) -> SharedMemory {
        self.view.memory().clone()
    }

    pub fn view(&self) -> &RegionView {
        &self.view
    }

    pub fn layout(&self) -> &ConfigLayout {
        &self.layout
    }

    /// Run `write` as one published update. The generation advances even if `write` fails
    /// part-way, so readers never accept a half-written state.
    pub fn update<R>(&self, write: impl FnOnce(&RegionView) -> MemoryResult<R>) -> Result<R> {
        let mut start = self.view.load_u32(GEN, Ordering::Relaxed)?;
        loop {
            if start & GENERATION_BUSY_BIT != 0 {
                std::hint::spin_loop();
                start = self.view.load_u32(GEN, Ordering::Relaxed)?;
                continue;
            }
            match self.view.compare_exchange_u32(
                GEN,
                start,
                start | GENERATION_BUSY_BIT,
                Ordering::Acquire,
                Ordering::Relaxed,
            )? {
                Ok(_) => break,
                Err(actual) => start = actual,
            }
        }
        fence(Ordering::Release);

        let out = write(&self.view);

        let next = start.wrapping_add(1) & !GENERATION_BUSY_BIT;
        self.view.store_u32(GEN, next, Ordering::Release)?;
        trace!(generation = next, "config published");
        Ok(out?)
    }

    pub fn bump_generation(&self) -> Result<u32> {
        self.update(|_| Ok(()))?;
        self.generation()
    }

    pub fn generation(&self) -> Result<u32> {
        Ok(self.view.load_u32(GEN, Ordering::Acquire)?)
    }

    pub fn status(&self) -> Result<DeviceStatus> {
        let raw = self.view.load_u32(STATUS, Ordering::Acquire)?;
        Ok(DeviceStatus::from_bits_retain(raw))
    }

    pub fn set_status(&self, status: DeviceStatus) -> Result<()> {
        Ok(self
            .view
            .store_u32(STATUS, status.bits(), Ordering::Release)?)
    }

    /// Record a pending cause. The driver clears causes with [`DriverConfig::take_irq_status`].
    pub fn raise_irq(&self, cause: IrqStatus) -> Result<()> {
        let mut current = self.view.load_u32(IRQ_STATUS, Ordering::Relaxed)?;
        loop {
            match self.view.compare_exchange_u32(
                IRQ_STATUS,
                current,
                current | cause.bits(),
                Ordering::Release,
                Ordering::Relaxed,
            )? {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn host_features(&self) -> Result<FeatureBits> {
        let mut buf = [0u8; FEATURE_BYTES];
        self.view.read(hdr_offset::HOST_FEATURES as u64, &mut buf)?;
        Ok(feature_words(&buf))
    }

    pub fn guest_features(&self) -> Result<FeatureBits> {
        let mut buf = [0u8; FEATURE_BYTES];
        self.view.read(hdr_offset::GUEST_FEATURES as u64, &mut buf)?;
        Ok(feature_words(&buf))
    }

    pub fn guest_page_size(&self) -> Result<u32> {
        Ok(self.view.read_u32_le(hdr_offset::GUEST_PAGE_SIZE as u64)?)
    }

    pub fn queue_entry(&self, index: u32) -> Result<QueueConfigEntry> {
        let at = self.layout.entry_offset(index)?;
        Ok(read_entry(&self.view, at)?)
    }

    pub fn device_config(&self) -> Result<RegionView> {
        Ok(self
            .view
            .subview(u64::from(self.layout.dev_cfg_offset), self.layout.dev_cfg_len)?)
    }

    /// Overwrite part of the device config blob as one published update.
    pub fn write_device_config(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let blob = self.device_config()?;
        self.update(|_| blob.write(offset, bytes))
    }

    /// Return the header to its post-reset state: no status, no pending causes, no guest
    /// features and no queue layouts.
    pub fn reset(&self) -> Result<()> {
        let layout = self.layout;
        self.update(|view| {
            view.store_u32(STATUS, 0, Ordering::Release)?;
            view.store_u32(IRQ_STATUS, 0, Ordering::Release)?;
            view.write(hdr_offset::GUEST_FEATURES as u64, &[0u8; FEATURE_BYTES])?;
            for i in 0..layout.num_queues {
                let at = u64::from(layout.queues_offset)
                    + u64::from(i) * QueueConfigEntry::SIZE as u64;
                view.write(at + QueueConfigEntry::OFFSET_NUM as u64, &[0u8; 10])?;
            }
            Ok(())
        })
    }
}

/// Driver-side accessor for a config region obtained through registration.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    view: RegionView,
    layout: ConfigLayout,
    retry_limit: u32,
}

impl DriverConfig {
    /// Validate the magic and the layout once. Later accesses go through the checked views.
    pub fn attach(mem: SharedMemory, retry_limit: u32) -> Result<Self> {
        if mem.len() < ConfigHeader::SIZE as u64 {
            return Err(
                ProtocolViolation::BadLayout("region is smaller than the config header").into(),
            );
        }
        let view = mem.view(0, mem.len())?;
        let magic = view.read_u32_le(hdr_offset::MAGIC as u64)?;
        if magic != CONFIG_MAGIC {
            return Err(ProtocolViolation::BadMagic { found: magic }.into());
        }
        let (version, num_queues, queues_offset, dev_cfg_offset) =
            read_with_generation_guard(&view, retry_limit, |v| {
                Ok((
                    v.read_u32_le(hdr_offset::VERSION as u64)?,
                    v.read_u32_le(hdr_offset::NUM_QUEUES as u64)?,
                    v.read_u32_le(hdr_offset::QUEUES_OFFSET as u64)?,
                    v.read_u32_le(hdr_offset::DEV_CFG_OFFSET as u64)?,
                ))
            })?;
        if version == 0 {
            return Err(ProtocolViolation::BadLayout("version is zero").into());
        }
        let layout = ConfigLayout::validate(num_queues, queues_offset, dev_cfg_offset, mem.len())?;
        Ok(Self {
            view,
            layout,
            retry_limit,
        })
    }

    pub fn layout(&self) -> &ConfigLayout {
        &self.layout
    }

    pub fn num_queues(&self) -> u32 {
        self.layout.num_queues
    }

    pub fn read_with_generation_guard<T>(
        &self,
        read: impl FnMut(&RegionView) -> MemoryResult<T>,
    ) -> Result<T> {
        read_with_generation_guard(&self.view, self.retry_limit, read)
    }

    /// Attempts each guarded read makes before giving up.
    pub fn retry_limit(&self) -> u32 {
        self.retry_limit.max(1)
    }

    pub fn read_identity(&self) -> Result<DeviceIdentity> {
        self.read_with_generation_guard(|v| {
            let mut features = [0u8; FEATURE_BYTES];
            v.read(hdr_offset::HOST_FEATURES as u64, &mut features)?;
            Ok(DeviceIdentity {
                version: v.read_u32_le(hdr_offset::VERSION as u64)?,
                device: v.read_u32_le(hdr_offset::DEVICE as u64)?,
                vendor: v.read_u32_le(hdr_offset::VENDOR as u64)?,
                host_features: feature_words(&features),
            })
        })
    }

    /// Write `subset` into the guest feature bitmap. Bits the device did not offer are refused
    /// and nothing is written.
    pub fn negotiate_features(&self, subset: &FeatureBits) -> Result<()> {
        let host = self.read_identity()?.host_features;
        if let Some(bit) = subset.difference(&host).iter().next() {
            return Err(ProtocolViolation::UnofferedFeature { bit }.into());
        }
        self.view
            .write(hdr_offset::GUEST_FEATURES as u64, &feature_bytes(subset))?;
        Ok(())
    }

    pub fn guest_features(&self) -> Result<FeatureBits> {
        let mut buf = [0u8; FEATURE_BYTES];
        self.view.read(hdr_offset::GUEST_FEATURES as u64, &mut buf)?;
        Ok(feature_words(&buf))
    }

    pub fn generation(&self) -> Result<u32> {
        Ok(self.view.load_u32(GEN, Ordering::Acquire)?)
    }

    pub fn status(&self) -> Result<DeviceStatus> {
        let raw = self.view.load_u32(STATUS, Ordering::Acquire)?;
        Ok(DeviceStatus::from_bits_retain(raw))
    }

    pub fn irq_status(&self) -> Result<IrqStatus> {
        let raw = self.view.load_u32(IRQ_STATUS, Ordering::Acquire)?;
        Ok(IrqStatus::from_bits_retain(raw))
    }

    /// Read and clear the pending causes.
    pub fn take_irq_status(&self) -> Result<IrqStatus> {
        let mut current = self.view.load_u32(IRQ_STATUS, Ordering::Relaxed)?;
        loop {
            match self.view.compare_exchange_u32(
                IRQ_STATUS,
                current,
                0,
                Ordering::Acquire,
                Ordering::Relaxed,
            )? {
                Ok(_) => return Ok(IrqStatus::from_bits_retain(current)),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn guest_page_size(&self) -> Result<u32> {
        self.read_with_generation_guard(|v| v.read_u32_le(hdr_offset::GUEST_PAGE_SIZE as u64))
    }

    pub fn set_guest_page_size(&self, page_size: u32) -> Result<()> {
        Ok(self
            .view
            .write_u32_le(hdr_offset::GUEST_PAGE_SIZE as u64, page_size)?)
    }

    pub fn queue_entry(&self, index: u32) -> Result<QueueConfigEntry> {
        let at = self.layout.entry_offset(index)?;
        self.read_with_generation_guard(|v| read_entry(v, at))
    }

    /// Write the driver-owned fields of one queue entry. `num_max` is left alone.
    pub fn write_queue_entry(&self, index: u32, num: u16, align: u32, pfn: u32) -> Result<()> {
        let at = self.layout.entry_offset(index)?;
        self.view
            .write_u16_le(at + QueueConfigEntry::OFFSET_NUM as u64, num)?;
        self.view
            .write_u32_le(at + QueueConfigEntry::OFFSET_ALIGN as u64, align)?;
        self.view
            .write_u32_le(at + QueueConfigEntry::OFFSET_PFN as u64, pfn)?;
        Ok(())
    }

    /// A consistent copy of the whole device config blob.
    pub fn device_config_bytes(&self) -> Result<Vec<u8>> {
        let offset = u64::from(self.layout.dev_cfg_offset);
        let len = usize::try_from(self.layout.dev_cfg_len)
            .map_err(|_| ProtocolViolation::BadLayout("device config blob too large"))?;
        self.read_with_generation_guard(|v| {
            let mut buf = vec![0u8; len];
            v.read(offset, &mut buf)?;
            Ok(buf)
        })
    }

    /// Decode the start of the device config blob as `T`.
    pub fn device_config<T: Pod>(&self) -> Result<T> {
        let bytes = self.device_config_bytes()?;
        let need = core::mem::size_of::<T>();
        if bytes.len() < need {
            return Err(ProtocolViolation::BadLayout("device config blob is too small").into());
        }
        Ok(bytemuck::pod_read_unaligned(&bytes[..need]))
    }

    /// Write driver-owned bytes of the device config blob (for example input `select`).
    pub fn write_device_config(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let blob = self
            .view
            .subview(u64::from(self.layout.dev_cfg_offset), self.layout.dev_cfg_len)?;
        Ok(blob.write(offset, bytes)?)
    }
}
