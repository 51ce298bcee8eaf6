//! Device and driver configuration.

use serde::{Deserialize, Serialize};
use vshm_abi::features::{VIRTIO_F_RING_INDIRECT_DESC, VIRTIO_F_VERSION_1};
use vshm_abi::{FeatureBits, CONFIG_VERSION};

/// What to do when the driver sets `DRIVER_OK` without `FEATURES_OK`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverOkPolicy {
    /// Fail the call with `-EIO`; status is left unchanged.
    #[default]
    Reject,
    /// Report success but leave status unchanged.
    Ignore,
}

/// What to do when the driver reconfigures a queue that is already active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconfigurePolicy {
    /// Fail with `-EIO` while the driver has published chains the device has not completed.
    #[default]
    RejectWhileBusy,
    /// Drop the old queue state unconditionally.
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceOptions {
    pub vendor: u32,
    pub version: u32,
    /// Transport feature bits offered in addition to the backend's class features.
    pub host_features: Vec<u32>,
    /// Upper bound for every queue's `num_max`. The backend's own maximum still applies.
    pub queue_num_max: Option<u16>,
    pub guest_page_size: u32,
    pub driver_ok_policy: DriverOkPolicy,
    pub reconfigure_policy: ReconfigurePolicy,
    /// Bytes reserved for the device config blob. The blob is never truncated; a larger
    /// value leaves zeroed room after it.
    pub device_config_size: u32,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            vendor: 0x4b4b_0000,
            version: CONFIG_VERSION,
            host_features: vec![VIRTIO_F_VERSION_1, VIRTIO_F_RING_INDIRECT_DESC],
            queue_num_max: None,
            guest_page_size: 4096,
            driver_ok_policy: DriverOkPolicy::default(),
            reconfigure_policy: ReconfigurePolicy::default(),
            device_config_size: 0,
        }
    }
}

impl DeviceOptions {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn transport_features(&self) -> FeatureBits {
        FeatureBits::from_bits(&self.host_features)
    }

    pub fn clamp_queue_size(&self, backend_max: u16) -> u16 {
        match self.queue_num_max {
            Some(cap) => backend_max.min(cap),
            None => backend_max,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverOptions {
    /// Attempts per generation-guarded config read before giving up. Zero still reads once.
    pub generation_retry_limit: u32,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            generation_retry_limit: 64,
        }
    }
}

impl DriverOptions {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
