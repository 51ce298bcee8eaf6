//! Driver side of the transport.

use std::time::Duration;

use tracing::{debug, warn};
use vshm_abi::{DeviceStatus, FeatureBits, IrqStatus, VringLayout};

use crate::caps::CapRef;
use crate::config_space::{DeviceIdentity, DriverConfig};
use crate::error::{Result, TransportError};
use crate::ipc::ControlClient;
use crate::memory::{AddressSpace, Rights, SharedMemory};
use crate::notify::Notifier;
use crate::options::DriverOptions;
use crate::queue::DriverQueue;

/// A bound driver instance: control channel, config region, notifiers and the driver's own
/// view of the memory it shared with the device.
#[derive(Debug)]
pub struct DriverTransport {
    client: ControlClient,
    config: DriverConfig,
    doorbell: Notifier,
    guest_irq: Notifier,
    memory: AddressSpace,
}

impl DriverTransport {
    /// Register the interface and attach to the returned config region.
    ///
    /// `guest_irq` is the notifier behind `guest_irq_cap`; the driver keeps it to wait for
    /// interrupts.
    pub fn connect(
        client: ControlClient,
        guest_irq_cap: CapRef,
        guest_irq: Notifier,
        options: &DriverOptions,
    ) -> Result<Self> {
        let handles = client.register_iface(guest_irq_cap)?;
        let config = DriverConfig::attach(handles.config, options.generation_retry_limit)?;
        let identity = config.read_identity()?;
        debug!(
            device = identity.device,
            vendor = identity.vendor,
            queues = config.num_queues(),
            "attached to device"
        );
        Ok(Self {
            client,
            config,
            doorbell: handles.host_notifier,
            guest_irq,
            memory: AddressSpace::new(),
        })
    }

    pub fn identity(&self) -> Result<DeviceIdentity> {
        self.config.read_identity()
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn client(&self) -> &ControlClient {
        &self.client
    }

    /// The driver's own guest-physical view.
    pub fn memory(&self) -> &AddressSpace {
        &self.memory
    }

    /// Share `[offset, offset + size)` of `mem` with the device at `gpa` and map it into the
    /// driver's own view.
    pub fn add_region(
        &mut self,
        cap: CapRef,
        gpa: u64,
        offset: u64,
        size: u64,
        mem: SharedMemory,
    ) -> Result<()> {
        let mut memory = self.memory.clone();
        memory.map(gpa, mem, offset, size, Rights::RW)?;
        self.client.register_ds(cap, gpa, offset, size)?;
        self.memory = memory;
        Ok(())
    }

    pub fn set_status(&self, status: DeviceStatus) -> Result<()> {
        self.client.set_status(status.bits())
    }

    pub fn status(&self) -> Result<DeviceStatus> {
        self.config.status()
    }

    /// Hard reset. The driver's own region view is dropped along with the device's.
    pub fn reset(&mut self) -> Result<()> {
        self.client.set_status(0)?;
        self.memory.clear();
        Ok(())
    }

    /// Run the status handshake up to `FEATURES_OK` and return the negotiated features.
    ///
    /// This starts with a reset, which drops registered regions; share memory afterwards.
    pub fn initialize(&mut self, wanted: &FeatureBits) -> Result<FeatureBits> {
        self.reset()?;
        let mut status = DeviceStatus::ACKNOWLEDGE;
        self.set_status(status)?;
        status |= DeviceStatus::DRIVER;
        self.set_status(status)?;

        let host = self.identity()?.host_features;
        let negotiated = host.intersection(wanted);
        self.config.negotiate_features(&negotiated)?;
        status |= DeviceStatus::FEATURES_OK;
        self.set_status(status)?;
        if !self.status()?.contains(DeviceStatus::FEATURES_OK) {
            warn!("device did not keep FEATURES_OK");
            return Err(TransportError::InvalidConfiguration(
                "device did not accept the negotiated features",
            ));
        }
        debug!(features = ?negotiated.iter().collect::<Vec<_>>(), "features negotiated");
        Ok(negotiated)
    }

    /// Lay out queue `index` at `gpa` and have the device attach to it.
    ///
    /// `gpa` must be page-aligned. A new layout is zeroed before the device sees it; the
    /// layout already configured for `index` is resumed in place, which requires every
    /// published chain to have completed.
    pub fn setup_queue(
        &mut self,
        index: u32,
        num: u16,
        align: u32,
        gpa: u64,
    ) -> Result<DriverQueue> {
        let page_size = u64::from(self.config.guest_page_size()?);
        if page_size == 0 {
            return Err(TransportError::InvalidArgument("guest page size is zero"));
        }
        if gpa % page_size != 0 {
            return Err(TransportError::InvalidArgument("ring is not page-aligned"));
        }
        let pfn = u32::try_from(gpa / page_size)
            .map_err(|_| TransportError::InvalidArgument("ring page number overflows"))?;
        let entry = self.config.queue_entry(index)?;
        if num > entry.num_max {
            return Err(TransportError::InvalidConfiguration(
                "queue size exceeds num_max",
            ));
        }
        let layout = VringLayout::new(gpa, num, align)
            .ok_or(TransportError::InvalidArgument("bad ring layout"))?;
        let in_place = entry.num == num && entry.align == align && entry.pfn == pfn;
        let queue = if in_place {
            DriverQueue::resume(layout, &self.memory)?
        } else {
            DriverQueue::new(layout, &self.memory)?
        };
        self.config.write_queue_entry(index, num, align, pfn)?;
        self.client.config_queue(index)?;
        debug!(queue = index, num, align, gpa, "queue set up");
        Ok(queue)
    }

    /// Ask the device to drop queue `index`.
    pub fn disable_queue(&self, index: u32) -> Result<()> {
        self.config.write_queue_entry(index, 0, 0, 0)?;
        self.client.config_queue(index)
    }

    pub fn driver_ok(&self) -> Result<()> {
        let status = self.status()? | DeviceStatus::DRIVER_OK;
        self.set_status(status)
    }

    /// Notify the device about newly published chains on `queue`, unless it suppressed
    /// notifications. Returns whether the doorbell was rung.
    pub fn notify(&self, queue: &DriverQueue) -> Result<bool> {
        queue.kick(&self.memory, &self.doorbell)
    }

    /// Wait for an interrupt and return the causes the device recorded.
    ///
    /// Returns an empty set on timeout.
    pub fn wait_for_interrupt(&self, timeout: Duration) -> Result<IrqStatus> {
        if self.guest_irq.wait_timeout(timeout) == 0 {
            return Ok(IrqStatus::empty());
        }
        self.config.take_irq_status()
    }
}
