//! Device side of the transport: control-plane handlers and queue processing.
//!
//! [`VshmDevice`] owns the config region, the guest-physical view built from registered
//! regions, and one [`DeviceQueue`] per configured queue. Device-class behavior lives in a
//! [`DeviceBackend`].

use std::sync::atomic::Ordering;

use tracing::{debug, trace, warn};
use vshm_abi::features::VIRTIO_F_RING_INDIRECT_DESC;
use vshm_abi::{hdr_offset, DeviceStatus, FeatureBits, IrqStatus, VirtqDesc, VringLayout};

use crate::caps::{CapRef, CapabilityResolver};
use crate::config_space::{DeviceConfig, HeaderInit};
use crate::error::{ProtocolViolation, Result, TransportError};
use crate::memory::{AddressSpace, Rights, SharedMemory};
use crate::notify::Notifier;
use crate::options::{DeviceOptions, ReconfigurePolicy};
use crate::queue::{DescriptorChain, DeviceQueue, Popped};
use crate::status::{self, Transition};

/// Device-class behavior plugged into a [`VshmDevice`].
pub trait DeviceBackend: Send {
    /// Device-class id written to the config header.
    fn device_id(&self) -> u32;

    /// Class feature bits. Transport bits from [`DeviceOptions::host_features`] are added.
    fn host_features(&self) -> FeatureBits;

    fn num_queues(&self) -> u16;

    fn queue_max_size(&self, queue: u16) -> u16;

    /// Initial device config blob.
    fn device_config(&self) -> Vec<u8>;

    /// Called when the driver sets `FEATURES_OK`. An error refuses the status write.
    fn set_features(&mut self, _features: &FeatureBits) -> Result<()> {
        Ok(())
    }

    /// Handle one request and return the number of bytes written into the chain's
    /// device-writable buffers.
    ///
    /// Per-request failures should be reported in-band (for example a block status byte).
    /// An error here means the device can no longer operate; it is marked as needing reset.
    fn process(&mut self, queue: u16, chain: &DescriptorChain, mem: &AddressSpace)
        -> Result<u32>;

    /// A chain was rejected by the ring walk before reaching [`DeviceBackend::process`].
    /// `partial` holds the descriptors accepted before the walk failed.
    fn malformed(&mut self, _queue: u16, _partial: &[VirtqDesc], _mem: &AddressSpace) {}

    fn reset(&mut self) {}
}

/// Handles returned by [`VshmDevice::register_interface`].
#[derive(Debug, Clone)]
pub struct InterfaceHandles {
    /// Signaled by the driver when it publishes new chains or issues a control call.
    pub host_notifier: Notifier,
    /// The config region.
    pub config: SharedMemory,
}

pub struct VshmDevice<B> {
    backend: B,
    options: DeviceOptions,
    config: DeviceConfig,
    resolver: Box<dyn CapabilityResolver>,
    doorbell: Notifier,
    guest_irq: Option<Notifier>,
    regions: AddressSpace,
    queues: Vec<Option<DeviceQueue>>,
    host_features: FeatureBits,
    negotiated: FeatureBits,
}

impl<B> std::fmt::Debug for VshmDevice<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VshmDevice")
            .field("options", &self.options)
            .field("regions", &self.regions.len())
            .field("queues", &self.queues.len())
            .field("interface_bound", &self.guest_irq.is_some())
            .finish_non_exhaustive()
    }
}

impl<B: DeviceBackend> VshmDevice<B> {
    pub fn new(
        backend: B,
        options: DeviceOptions,
        resolver: impl CapabilityResolver + 'static,
    ) -> Result<Self> {
        let num_queues = backend.num_queues();
        let num_max: Vec<u16> = (0..num_queues)
            .map(|q| options.clamp_queue_size(backend.queue_max_size(q)))
            .collect();
        let host_features = backend.host_features().union(&options.transport_features());
        let blob = backend.device_config();
        let config = DeviceConfig::create(&HeaderInit {
            device: backend.device_id(),
            vendor: options.vendor,
            version: options.version,
            host_features,
            guest_page_size: options.guest_page_size,
            queue_num_max: &num_max,
            device_config: &blob,
            device_config_reserve: u64::from(options.device_config_size),
        })?;
        debug!(
            device = backend.device_id(),
            queues = num_queues,
            config_len = config.memory().len(),
            "device created"
        );
        Ok(Self {
            backend,
            options,
            config,
            resolver: Box::new(resolver),
            doorbell: Notifier::new(),
            guest_irq: None,
            regions: AddressSpace::new(),
            queues: (0..num_queues).map(|_| None).collect(),
            host_features,
            negotiated: FeatureBits::empty(),
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn options(&self) -> &DeviceOptions {
        &self.options
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn regions(&self) -> &AddressSpace {
        &self.regions
    }

    /// The notifier the driver signals. Valid before and after registration.
    pub fn host_notifier(&self) -> Notifier {
        self.doorbell.clone()
    }

    pub fn status(&self) -> Result<DeviceStatus> {
        self.config.status()
    }

    /// Feature bits accepted with the last `FEATURES_OK`.
    pub fn negotiated_features(&self) -> FeatureBits {
        self.negotiated
    }

    pub fn queue(&self, index: u16) -> Option<&DeviceQueue> {
        self.queues.get(usize::from(index))?.as_ref()
    }

    /// Bind the driver's interrupt notifier and hand out the device's handles.
    pub fn register_interface(&mut self, guest_irq: CapRef) -> Result<InterfaceHandles> {
        if self.guest_irq.is_some() {
            warn!(?guest_irq, "interface already registered");
            return Err(TransportError::InvalidArgument("interface already registered"));
        }
        let Some((notifier, held)) = self.resolver.resolve_notifier(guest_irq) else {
            warn!(?guest_irq, "unknown notifier capability");
            return Err(TransportError::InvalidArgument("unknown notifier capability"));
        };
        if !held.intersection(guest_irq.mask()).contains(Rights::SIGNAL) {
            warn!(?guest_irq, ?held, "notifier capability cannot signal");
            return Err(TransportError::InvalidArgument(
                "notifier capability lacks the signal right",
            ));
        }
        self.guest_irq = Some(notifier);
        debug!(?guest_irq, "interface registered");
        Ok(InterfaceHandles {
            host_notifier: self.doorbell.clone(),
            config: self.config.memory(),
        })
    }

    /// Bind `[offset, offset + size)` of the object behind `cap` at guest-physical `gpa`.
    ///
    /// The rights recorded are the mask carried in `cap` intersected with the rights the
    /// caller holds.
    pub fn register_region(&mut self, cap: CapRef, gpa: u64, offset: u64, size: u64) -> Result<()> {
        let Some((mem, held)) = self.resolver.resolve_region(cap) else {
            warn!(?cap, "unknown region capability");
            return Err(TransportError::InvalidArgument("unknown region capability"));
        };
        let effective = cap.mask().intersection(held).intersection(Rights::RW);
        if cap.raw_mask() != 0 && effective.is_empty() {
            warn!(?cap, ?held, "requested rights are not held");
            return Err(TransportError::RightsViolation(
                "none of the requested rights are held",
            ));
        }
        if let Err(err) = self.regions.map(gpa, mem, offset, size, effective) {
            warn!(?cap, gpa, offset, size, error = %err, "region rejected");
            return Err(err);
        }
        debug!(?cap, gpa, offset, size, rights = ?effective, "region registered");
        Ok(())
    }

    /// Apply a status write from the driver.
    pub fn set_status(&mut self, requested: u32) -> Result<()> {
        let current = self.config.status()?;
        let guest = self.config.guest_features()?;
        let unoffered = guest.difference(&self.host_features).iter().next();
        let transition =
            match status::evaluate(current, requested, unoffered, self.options.driver_ok_policy) {
                Ok(t) => t,
                Err(err) => {
                    warn!(
                        current = current.bits(),
                        requested,
                        error = %err,
                        "status write rejected"
                    );
                    return Err(err);
                }
            };
        match transition {
            Transition::Reset => {
                self.reset()?;
                debug!("device reset");
            }
            Transition::Unchanged => {
                trace!(current = current.bits(), requested, "status unchanged");
            }
            Transition::Apply { status, newly_set } => {
                if newly_set.contains(DeviceStatus::FEATURES_OK) {
                    if let Err(err) = self.backend.set_features(&guest) {
                        warn!(error = %err, "backend refused the negotiated features");
                        return Err(err);
                    }
                    self.negotiated = guest;
                }
                self.config.set_status(status)?;
                debug!(
                    from = current.bits(),
                    to = status.bits(),
                    "status changed"
                );
            }
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        for queue in &mut self.queues {
            *queue = None;
        }
        self.regions.clear();
        self.negotiated = FeatureBits::empty();
        self.backend.reset();
        self.config.reset()
    }

    /// Apply the queue-config entry of queue `index`.
    pub fn configure_queue(&mut self, index: u32) -> Result<()> {
        let result = self.try_configure_queue(index);
        if let Err(err) = &result {
            warn!(queue = index, error = %err, "queue configuration rejected");
        }
        result
    }

    fn try_configure_queue(&mut self, index: u32) -> Result<()> {
        let slot = usize::try_from(index)
            .ok()
            .filter(|&i| i < self.queues.len())
            .ok_or(TransportError::OutOfRange("queue index"))?;
        if self.config.status()?.contains(DeviceStatus::FAILED) {
            return Err(TransportError::DeviceFailure);
        }
        let entry = self.config.queue_entry(index)?;
        if entry.is_disable_request() {
            self.queues[slot] = None;
            debug!(queue = index, "queue disabled");
            return Ok(());
        }
        if entry.num == 0 || !entry.num.is_power_of_two() {
            return Err(TransportError::InvalidConfiguration(
                "queue size must be a non-zero power of two",
            ));
        }
        if entry.num > entry.num_max {
            return Err(TransportError::InvalidConfiguration(
                "queue size exceeds num_max",
            ));
        }
        if !entry.align.is_power_of_two() {
            return Err(TransportError::InvalidConfiguration(
                "ring alignment must be a power of two",
            ));
        }
        let page_size = self.config.guest_page_size()?;
        if page_size == 0 {
            return Err(TransportError::InvalidArgument("guest page size is zero"));
        }
        let base = u64::from(entry.pfn)
            .checked_mul(u64::from(page_size))
            .ok_or(TransportError::InvalidArgument("ring address overflows"))?;
        let layout = VringLayout::new(base, entry.num, entry.align)
            .ok_or(TransportError::InvalidArgument("ring layout overflows"))?;
        if self.regions.check(layout.desc, layout.size, Rights::RW).is_err() {
            return Err(TransportError::InvalidConfiguration(
                "ring is not inside read-write registered memory",
            ));
        }

        if let Some(active) = &self.queues[slot] {
            let busy = active.is_busy(&self.regions).unwrap_or(true);
            if busy && self.options.reconfigure_policy == ReconfigurePolicy::RejectWhileBusy {
                return Err(TransportError::InvalidConfiguration(
                    "queue has requests in flight",
                ));
            }
        }

        let indirect = self.negotiated.contains(VIRTIO_F_RING_INDIRECT_DESC);
        self.queues[slot] = Some(DeviceQueue::new(layout, indirect, &self.regions)?);
        debug!(
            queue = index,
            num = entry.num,
            align = entry.align,
            base,
            indirect,
            "queue configured"
        );
        Ok(())
    }

    /// Drain every configured queue. Returns the number of completed chains.
    ///
    /// Nothing is processed unless the device is live. A ring-level error marks the device as
    /// needing reset.
    pub fn process_queues(&mut self) -> Result<usize> {
        if !status::is_live(self.config.status()?) {
            return Ok(0);
        }
        let mut completed = 0;
        let mut interrupt = false;
        for index in 0..self.queues.len() {
            match self.process_queue(index) {
                Ok((n, notify)) => {
                    completed += n;
                    interrupt |= notify;
                }
                Err(err) => {
                    warn!(queue = index, error = %err, "queue failed; device needs reset");
                    self.fail(true)?;
                    break;
                }
            }
        }
        if interrupt {
            self.signal(IrqStatus::VRING)?;
        }
        Ok(completed)
    }

    fn process_queue(&mut self, index: usize) -> Result<(usize, bool)> {
        let Self {
            queues,
            backend,
            regions,
            ..
        } = self;
        let Some(queue) = queues[index].as_mut() else {
            return Ok((0, false));
        };
        let queue_index = index as u16;
        let mut completed = 0;
        let mut notify = false;
        while let Some(popped) = queue.pop(regions)? {
            let (head, len) = match popped {
                Popped::Chain(chain) => {
                    let len = backend.process(queue_index, &chain, regions)?;
                    (chain.head_index(), len)
                }
                Popped::Malformed {
                    head,
                    error,
                    partial,
                } => {
                    let violation = ProtocolViolation::MalformedChain {
                        head,
                        reason: error,
                    };
                    warn!(queue = index, %violation, "dropping chain");
                    backend.malformed(queue_index, &partial, regions);
                    (head, 0)
                }
            };
            notify |= queue.add_used(regions, head, len)?;
            completed += 1;
        }
        Ok((completed, notify))
    }

    /// Mark the device as needing reset (or as failed) and tell the driver.
    pub fn fail(&mut self, needs_reset: bool) -> Result<()> {
        let bit = if needs_reset {
            DeviceStatus::DEVICE_NEEDS_RESET
        } else {
            DeviceStatus::FAILED
        };
        let status = self.config.status()? | bit;
        self.config.update(|view| {
            view.store_u32(hdr_offset::STATUS as u64, status.bits(), Ordering::Release)
        })?;
        warn!(status = status.bits(), "device entered an error state");
        self.signal(IrqStatus::CONFIG)
    }

    /// Overwrite part of the device config blob and raise a config interrupt.
    pub fn update_device_config(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.config.write_device_config(offset, bytes)?;
        self.signal(IrqStatus::CONFIG)
    }

    fn signal(&self, cause: IrqStatus) -> Result<()> {
        self.config.raise_irq(cause)?;
        if let Some(irq) = &self.guest_irq {
            irq.trigger();
        }
        trace!(cause = cause.bits(), "interrupt raised");
        Ok(())
    }
}
