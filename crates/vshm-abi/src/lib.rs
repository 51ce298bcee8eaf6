//! Shared-memory ABI of the vshm virtio transport.
//!
//! Everything in this crate describes bytes that are visible to *both* the driver domain
//! and the device domain: the config header at the start of the config region, the
//! queue-config array, split-virtqueue rings and the per-class device config blobs. All
//! multi-byte fields are little-endian.
//!
//! The layouts are fixed for interoperability; the unit tests pin every offset.

#![no_std]

pub mod blk;
pub mod features;
pub mod input;
pub mod net;
pub mod ring;

pub use features::FeatureBits;
pub use ring::{
    vring_size, DescFlags, VirtqAvailHeader, VirtqDesc, VirtqUsedElem, VirtqUsedHeader,
    VringLayout, VRING_AVAIL_F_NO_INTERRUPT, VRING_USED_F_NO_NOTIFY,
};

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

/// `b"virt"` as a little-endian `u32`.
pub const CONFIG_MAGIC: u32 = 0x7472_6976;

/// Config header version written by devices implementing this crate.
pub const CONFIG_VERSION: u32 = 2;

/// Protocol number of the control channel.
pub const PROTOCOL: u32 = 0;

/// Control-plane opcodes.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Write the status register.
    SetStatus = 0,
    /// Apply the queue-config entry of one queue.
    ConfigQueue = 1,
    /// Exchange notification handles and obtain the config region.
    RegisterIface = 2,
    /// Bind a shared-memory window into the device's guest-physical view.
    RegisterDs = 3,
}

impl Opcode {
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::SetStatus),
            1 => Some(Self::ConfigQueue),
            2 => Some(Self::RegisterIface),
            3 => Some(Self::RegisterDs),
            _ => None,
        }
    }
}

/// Device-class identifiers as reported in [`ConfigHeader::device`].
pub mod device_id {
    pub const NET: u32 = 1;
    pub const BLOCK: u32 = 2;
    pub const CONSOLE: u32 = 3;
    pub const RNG: u32 = 4;
    pub const BALLOON: u32 = 5;
    pub const RPMSG: u32 = 7;
    pub const SCSI: u32 = 8;
    pub const P9: u32 = 9;
    pub const RPROC_SERIAL: u32 = 11;
    pub const CAIF: u32 = 12;
    pub const INPUT: u32 = 18;
    /// Non-standard socket device.
    pub const SOCK: u32 = 0x9999;

    pub const fn name(id: u32) -> Option<&'static str> {
        match id {
            NET => Some("net"),
            BLOCK => Some("block"),
            CONSOLE => Some("console"),
            RNG => Some("rng"),
            BALLOON => Some("balloon"),
            RPMSG => Some("rpmsg"),
            SCSI => Some("scsi"),
            P9 => Some("9p"),
            RPROC_SERIAL => Some("rproc-serial"),
            CAIF => Some("caif"),
            INPUT => Some("input"),
            SOCK => Some("sock"),
            _ => None,
        }
    }
}

bitflags! {
    /// Device status register bits.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct DeviceStatus: u32 {
        /// The driver found the device.
        const ACKNOWLEDGE = 1;
        /// The driver knows how to drive the device.
        const DRIVER = 2;
        /// The driver is set up and the device is live.
        const DRIVER_OK = 4;
        /// The driver acknowledged the feature set.
        const FEATURES_OK = 8;
        /// The device ran into an error it can only leave through a reset.
        const DEVICE_NEEDS_RESET = 0x40;
        /// Fatal error in driver or device.
        const FAILED = 0x80;
    }
}

bitflags! {
    /// Pending interrupt causes (`irq_status`). Advisory only.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct IrqStatus: u32 {
        const VRING = 1;
        const CONFIG = 2;
    }
}

/// Config header at offset 0 of the config region.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct ConfigHeader {
    pub magic: u32,
    pub version: u32,
    pub device: u32,
    pub vendor: u32,
    pub num_queues: u32,
    pub queues_offset: u32,
    pub dev_cfg_offset: u32,
    pub generation: u32,
    /// Status register. Only the device writes it; drivers go through the set-status call.
    pub status: u32,
    pub irq_status: u32,
    pub host_features: [u32; 8],
    pub guest_features: [u32; 8],
    /// Page size used to turn a queue `pfn` into a guest-physical address.
    pub guest_page_size: u32,
}

impl ConfigHeader {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub fn host_features(&self) -> FeatureBits {
        FeatureBits::from_words(self.host_features)
    }

    pub fn guest_features(&self) -> FeatureBits {
        FeatureBits::from_words(self.guest_features)
    }
}

/// Byte offsets of [`ConfigHeader`] fields, for word-granular shared-memory access.
pub mod hdr_offset {
    use super::ConfigHeader;
    use core::mem::offset_of;

    pub const MAGIC: usize = offset_of!(ConfigHeader, magic);
    pub const VERSION: usize = offset_of!(ConfigHeader, version);
    pub const DEVICE: usize = offset_of!(ConfigHeader, device);
    pub const VENDOR: usize = offset_of!(ConfigHeader, vendor);
    pub const NUM_QUEUES: usize = offset_of!(ConfigHeader, num_queues);
    pub const QUEUES_OFFSET: usize = offset_of!(ConfigHeader, queues_offset);
    pub const DEV_CFG_OFFSET: usize = offset_of!(ConfigHeader, dev_cfg_offset);
    pub const GENERATION: usize = offset_of!(ConfigHeader, generation);
    pub const STATUS: usize = offset_of!(ConfigHeader, status);
    pub const IRQ_STATUS: usize = offset_of!(ConfigHeader, irq_status);
    pub const HOST_FEATURES: usize = offset_of!(ConfigHeader, host_features);
    pub const GUEST_FEATURES: usize = offset_of!(ConfigHeader, guest_features);
    pub const GUEST_PAGE_SIZE: usize = offset_of!(ConfigHeader, guest_page_size);
}

/// One entry of the queue-config array.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct QueueConfigEntry {
    /// Maximum number of descriptors supported (device-written).
    pub num_max: u16,
    /// Number of descriptors configured (driver-written).
    pub num: u16,
    /// Alignment of the used ring (driver-written).
    pub align: u32,
    /// Start page frame of the queue (driver-written).
    pub pfn: u32,
}

impl QueueConfigEntry {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub const OFFSET_NUM_MAX: usize = core::mem::offset_of!(QueueConfigEntry, num_max);
    pub const OFFSET_NUM: usize = core::mem::offset_of!(QueueConfigEntry, num);
    pub const OFFSET_ALIGN: usize = core::mem::offset_of!(QueueConfigEntry, align);
    pub const OFFSET_PFN: usize = core::mem::offset_of!(QueueConfigEntry, pfn);

    pub fn is_disable_request(&self) -> bool {
        self.num == 0 && self.pfn == 0
    }
}

/// Wire error codes returned by control-plane calls (negated).
pub mod errno {
    pub const EPERM: i32 = 1;
    pub const EIO: i32 = 5;
    pub const EINVAL: i32 = 22;
    pub const ERANGE: i32 = 34;
}

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn config_header_layout() {
        assert_eq!(size_of::<ConfigHeader>(), 108);
        assert_eq!(offset_of!(ConfigHeader, magic), 0);
        assert_eq!(offset_of!(ConfigHeader, version), 4);
        assert_eq!(offset_of!(ConfigHeader, device), 8);
        assert_eq!(offset_of!(ConfigHeader, vendor), 12);
        assert_eq!(offset_of!(ConfigHeader, num_queues), 16);
        assert_eq!(offset_of!(ConfigHeader, queues_offset), 20);
        assert_eq!(offset_of!(ConfigHeader, dev_cfg_offset), 24);
        assert_eq!(offset_of!(ConfigHeader, generation), 28);
        assert_eq!(offset_of!(ConfigHeader, status), 32);
        assert_eq!(offset_of!(ConfigHeader, irq_status), 36);
        assert_eq!(offset_of!(ConfigHeader, host_features), 40);
        assert_eq!(offset_of!(ConfigHeader, guest_features), 72);
        assert_eq!(offset_of!(ConfigHeader, guest_page_size), 104);
    }

    #[test]
    fn queue_config_entry_layout() {
        assert_eq!(size_of::<QueueConfigEntry>(), 12);
        assert_eq!(QueueConfigEntry::OFFSET_NUM_MAX, 0);
        assert_eq!(QueueConfigEntry::OFFSET_NUM, 2);
        assert_eq!(QueueConfigEntry::OFFSET_ALIGN, 4);
        assert_eq!(QueueConfigEntry::OFFSET_PFN, 8);
    }

    #[test]
    fn magic_spells_virt() {
        assert_eq!(&CONFIG_MAGIC.to_le_bytes(), b"virt");
    }

    #[test]
    fn status_bits_match_wire_values() {
        assert_eq!(DeviceStatus::ACKNOWLEDGE.bits(), 1);
        assert_eq!(DeviceStatus::DRIVER.bits(), 2);
        assert_eq!(DeviceStatus::DRIVER_OK.bits(), 4);
        assert_eq!(DeviceStatus::FEATURES_OK.bits(), 8);
        assert_eq!(DeviceStatus::FAILED.bits(), 0x80);
    }

    #[test]
    fn opcodes_roundtrip_through_u32() {
        for op in [
            Opcode::SetStatus,
            Opcode::ConfigQueue,
            Opcode::RegisterIface,
            Opcode::RegisterDs,
        ] {
            assert_eq!(Opcode::from_u32(op as u32), Some(op));
        }
        assert_eq!(Opcode::from_u32(4), None);
    }

    #[test]
    fn device_ids_are_preserved() {
        assert_eq!(device_id::NET, 1);
        assert_eq!(device_id::BLOCK, 2);
        assert_eq!(device_id::RPROC_SERIAL, 11);
        assert_eq!(device_id::CAIF, 12);
        assert_eq!(device_id::SOCK, 0x9999);
        assert_eq!(device_id::name(device_id::P9), Some("9p"));
        assert_eq!(device_id::name(6), None);
    }
}
