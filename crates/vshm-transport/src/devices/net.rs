//! Network device config blob.

use vshm_abi::net::*;
use vshm_abi::FeatureBits;

/// Builder for the net config blob and the class features that advertise its fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetConfigBuilder {
    mac: Option<[u8; 6]>,
    link_up: Option<bool>,
    mtu: Option<u16>,
    queue_pairs: Option<u16>,
}

impl NetConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mac(mut self, mac: [u8; 6]) -> Self {
        self.mac = Some(mac);
        self
    }

    /// Report link state through `status`. Without this the field is not advertised.
    pub fn link_up(mut self, up: bool) -> Self {
        self.link_up = Some(up);
        self
    }

    pub fn mtu(mut self, mtu: u16) -> Self {
        self.mtu = Some(mtu);
        self
    }

    /// More than one pair advertises multiqueue.
    pub fn queue_pairs(mut self, pairs: u16) -> Self {
        self.queue_pairs = Some(pairs.max(1));
        self
    }

    pub fn config(&self) -> NetConfig {
        NetConfig {
            mac: self.mac.unwrap_or_default(),
            status: match self.link_up {
                Some(true) => VIRTIO_NET_S_LINK_UP,
                _ => 0,
            },
            max_virtqueue_pairs: self.queue_pairs.unwrap_or(1),
            mtu: self.mtu.unwrap_or(0),
            ..NetConfig::default()
        }
    }

    /// Feature bits that tell the driver which config fields are valid.
    pub fn features(&self) -> FeatureBits {
        let mut features = FeatureBits::empty();
        if self.mac.is_some() {
            features.set(VIRTIO_NET_F_MAC);
        }
        if self.link_up.is_some() {
            features.set(VIRTIO_NET_F_STATUS);
        }
        if self.mtu.is_some() {
            features.set(VIRTIO_NET_F_MTU);
        }
        if self.queue_pairs.is_some_and(|pairs| pairs > 1) {
            features.set(VIRTIO_NET_F_MQ);
        }
        features
    }

    /// Number of queues the device exposes: one rx/tx pair per queue pair.
    pub fn num_queues(&self) -> u16 {
        self.queue_pairs.unwrap_or(1).saturating_mul(2)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bytemuck::bytes_of(&self.config()).to_vec()
    }
}
