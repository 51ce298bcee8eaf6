//! Network device config blob, packet header and feature bits.

use bytemuck::{Pod, Zeroable};

pub const VIRTIO_NET_F_CSUM: u32 = 0;
pub const VIRTIO_NET_F_GUEST_CSUM: u32 = 1;
pub const VIRTIO_NET_F_MTU: u32 = 3;
pub const VIRTIO_NET_F_MAC: u32 = 5;
pub const VIRTIO_NET_F_GUEST_TSO4: u32 = 7;
pub const VIRTIO_NET_F_GUEST_TSO6: u32 = 8;
pub const VIRTIO_NET_F_GUEST_ECN: u32 = 9;
pub const VIRTIO_NET_F_GUEST_UFO: u32 = 10;
pub const VIRTIO_NET_F_HOST_TSO4: u32 = 11;
pub const VIRTIO_NET_F_HOST_TSO6: u32 = 12;
pub const VIRTIO_NET_F_HOST_ECN: u32 = 13;
pub const VIRTIO_NET_F_HOST_UFO: u32 = 14;
pub const VIRTIO_NET_F_MRG_RXBUF: u32 = 15;
pub const VIRTIO_NET_F_STATUS: u32 = 16;
pub const VIRTIO_NET_F_CTRL_VQ: u32 = 17;
pub const VIRTIO_NET_F_CTRL_RX: u32 = 18;
pub const VIRTIO_NET_F_CTRL_VLAN: u32 = 19;
pub const VIRTIO_NET_F_GUEST_ANNOUNCE: u32 = 21;
pub const VIRTIO_NET_F_MQ: u32 = 22;
pub const VIRTIO_NET_F_CTRL_MAC_ADDR: u32 = 23;

/// `status` field: link is up.
pub const VIRTIO_NET_S_LINK_UP: u16 = 1;

/// Header prepended to every packet buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct NetHeader {
    pub flags: u8,
    pub gso_type: u8,
    pub hdr_len: u16,
    pub gso_size: u16,
    pub csum_start: u16,
    pub csum_offset: u16,
    pub num_buffers: u16,
}

impl NetHeader {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

/// Network device config blob. The trailing padding is part of the exposed blob.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct NetConfig {
    pub mac: [u8; 6],
    pub status: u16,
    pub max_virtqueue_pairs: u16,
    pub mtu: u16,
    pub speed: u32,
    pub duplex: u8,
    pub _pad: [u8; 3],
}

impl NetConfig {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub fn link_up(&self) -> bool {
        self.status & VIRTIO_NET_S_LINK_UP != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn header_layout() {
        assert_eq!(size_of::<NetHeader>(), 12);
        assert_eq!(offset_of!(NetHeader, hdr_len), 2);
        assert_eq!(offset_of!(NetHeader, num_buffers), 10);
    }

    #[test]
    fn config_layout() {
        assert_eq!(size_of::<NetConfig>(), 20);
        assert_eq!(offset_of!(NetConfig, status), 6);
        assert_eq!(offset_of!(NetConfig, max_virtqueue_pairs), 8);
        assert_eq!(offset_of!(NetConfig, mtu), 10);
        assert_eq!(offset_of!(NetConfig, speed), 12);
        assert_eq!(offset_of!(NetConfig, duplex), 16);
    }
}
