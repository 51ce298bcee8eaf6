//! Input device config blob and event record.

use bytemuck::{Pod, Zeroable};

pub const VIRTIO_INPUT_CFG_UNSET: u8 = 0x00;
pub const VIRTIO_INPUT_CFG_ID_NAME: u8 = 0x01;
pub const VIRTIO_INPUT_CFG_ID_SERIAL: u8 = 0x02;
pub const VIRTIO_INPUT_CFG_ID_DEVIDS: u8 = 0x03;
pub const VIRTIO_INPUT_CFG_PROP_BITS: u8 = 0x10;
pub const VIRTIO_INPUT_CFG_EV_BITS: u8 = 0x11;
pub const VIRTIO_INPUT_CFG_ABS_INFO: u8 = 0x12;

/// Size of the payload overlay.
pub const VIRTIO_INPUT_PAYLOAD_BYTES: usize = 128;

/// Absolute axis information.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct InputAbsInfo {
    pub min: u32,
    pub max: u32,
    pub fuzz: u32,
    pub flat: u32,
    pub res: u32,
}

impl InputAbsInfo {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct InputDevIds {
    pub bustype: u16,
    pub vendor: u16,
    pub product: u16,
    pub version: u16,
}

impl InputDevIds {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

/// Input device config blob. `payload` is an overlay whose meaning depends on `select`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Pod, Zeroable)]
pub struct InputConfig {
    pub select: u8,
    pub subsel: u8,
    /// Number of valid payload bytes.
    pub size: u8,
    pub reserved: [u8; 5],
    pub payload: [u8; VIRTIO_INPUT_PAYLOAD_BYTES],
}

impl InputConfig {
    pub const SIZE: usize = core::mem::size_of::<Self>();
    pub const OFFSET_SELECT: usize = core::mem::offset_of!(InputConfig, select);
    pub const OFFSET_SUBSEL: usize = core::mem::offset_of!(InputConfig, subsel);
    pub const OFFSET_SIZE: usize = core::mem::offset_of!(InputConfig, size);
    pub const OFFSET_PAYLOAD: usize = core::mem::offset_of!(InputConfig, payload);
}

impl Default for InputConfig {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// One event on the event or status queue.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct InputEvent {
    pub event_type: u16,
    pub code: u16,
    pub value: u32,
}

impl InputEvent {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}
