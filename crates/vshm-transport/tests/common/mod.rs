#![allow(dead_code)]

use vshm_abi::{device_id, DeviceStatus, FeatureBits, VirtqDesc};
use vshm_transport::{
    AddressSpace, CapTable, DescriptorChain, DeviceBackend, DeviceOptions, DriverConfig, Result,
    Rights, SharedMemory, VshmDevice,
};

pub const RAM_GPA: u64 = 0x10_0000;
pub const RAM_SIZE: u64 = 0x10_0000;
pub const PAGE: u64 = 4096;
pub const NUM_MAX: u16 = 64;

/// Backend that records every chain it sees and reports all writable bytes as used.
#[derive(Default)]
pub struct Recorder {
    pub chains: Vec<(u16, Vec<VirtqDesc>)>,
    pub malformed: usize,
    pub features: Option<FeatureBits>,
}

impl DeviceBackend for Recorder {
    fn device_id(&self) -> u32 {
        device_id::CONSOLE
    }

    fn host_features(&self) -> FeatureBits {
        FeatureBits::from_bits(&[0, 1])
    }

    fn num_queues(&self) -> u16 {
        2
    }

    fn queue_max_size(&self, _queue: u16) -> u16 {
        NUM_MAX
    }

    fn device_config(&self) -> Vec<u8> {
        vec![0; 8]
    }

    fn set_features(&mut self, features: &FeatureBits) -> Result<()> {
        self.features = Some(*features);
        Ok(())
    }

    fn process(&mut self, queue: u16, chain: &DescriptorChain, _mem: &AddressSpace) -> Result<u32> {
        self.chains.push((queue, chain.descriptors().to_vec()));
        Ok(chain.writable_len() as u32)
    }

    fn malformed(&mut self, _queue: u16, _partial: &[VirtqDesc], _mem: &AddressSpace) {
        self.malformed += 1;
    }

    fn reset(&mut self) {
        self.features = None;
    }
}

/// A device with no registered memory.
pub fn bare_device(options: DeviceOptions) -> (VshmDevice<Recorder>, CapTable) {
    let caps = CapTable::new();
    let dev = VshmDevice::new(Recorder::default(), options, caps.clone()).unwrap();
    (dev, caps)
}

pub struct Rig {
    pub dev: VshmDevice<Recorder>,
    pub caps: CapTable,
    pub ram: SharedMemory,
    pub drv: DriverConfig,
    /// The driver's view of the same RAM.
    pub mem: AddressSpace,
}

impl Rig {
    pub fn new(options: DeviceOptions) -> Self {
        let (mut dev, caps) = bare_device(options);
        let ram = SharedMemory::new(RAM_SIZE as usize);
        let cap = caps.insert_region(ram.clone(), Rights::RW);
        dev.register_region(cap, RAM_GPA, 0, RAM_SIZE).unwrap();
        let drv = DriverConfig::attach(dev.config().memory(), 64).unwrap();
        let mut mem = AddressSpace::new();
        mem.map(RAM_GPA, ram.clone(), 0, RAM_SIZE, Rights::RW).unwrap();
        Self {
            dev,
            caps,
            ram,
            drv,
            mem,
        }
    }

    /// Walk the status handshake to `DRIVER_OK`, negotiating `features`.
    pub fn go_live(&mut self, features: &FeatureBits) {
        let mut status = DeviceStatus::ACKNOWLEDGE;
        self.dev.set_status(status.bits()).unwrap();
        status |= DeviceStatus::DRIVER;
        self.dev.set_status(status.bits()).unwrap();
        self.drv.negotiate_features(features).unwrap();
        status |= DeviceStatus::FEATURES_OK;
        self.dev.set_status(status.bits()).unwrap();
        status |= DeviceStatus::DRIVER_OK;
        self.dev.set_status(status.bits()).unwrap();
    }

    /// Fill in queue `index` and ask the device to apply it.
    pub fn configure(&mut self, index: u32, num: u16, align: u32, gpa: u64) -> Result<()> {
        self.drv
            .write_queue_entry(index, num, align, (gpa / PAGE) as u32)?;
        self.dev.configure_queue(index)
    }
}
