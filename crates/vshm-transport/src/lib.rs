//! Virtio transport over shared memory.
//!
//! A driver domain and a device domain share a config region and the memory holding the
//! split virtqueues. Control-plane calls (status writes, queue configuration, interface and
//! region registration) travel over a synchronous channel; the data plane is lock-free and
//! synchronizes only through acquire/release accesses to the ring indices and the config
//! generation counter.
//!
//! The driver side is [`DriverTransport`] with [`DriverQueue`] per queue. The device side is
//! [`VshmDevice`], which drives a [`DeviceBackend`] through [`DeviceQueue`]s.

pub mod caps;
pub mod config_space;
pub mod device;
pub mod devices;
pub mod driver;
pub mod error;
pub mod ipc;
pub mod memory;
pub mod notify;
pub mod options;
pub mod queue;
pub mod status;

pub use caps::{CapRef, CapTable, CapabilityResolver};
pub use config_space::{read_with_generation_guard, DeviceConfig, DeviceIdentity, DriverConfig};
pub use device::{DeviceBackend, InterfaceHandles, VshmDevice};
pub use driver::DriverTransport;
pub use error::{ChainError, MemoryError, ProtocolViolation, Result, TransportError};
pub use ipc::{channel, ControlClient, ControlRequest, ControlResponse, ControlServer};
pub use memory::{AddressSpace, RegionView, Rights, SharedMemory};
pub use notify::Notifier;
pub use options::{DeviceOptions, DriverOkPolicy, DriverOptions, ReconfigurePolicy};
pub use queue::{Buffer, DescriptorChain, DeviceQueue, DriverQueue, Popped, UsedElem};
