mod common;

use common::{bare_device, Recorder, PAGE};
use vshm_abi::errno;
use vshm_transport::{
    DeviceOptions, DriverConfig, MemoryError, Notifier, Rights, SharedMemory, TransportError,
    VshmDevice,
};

const GPA: u64 = 0x20_0000;

/// Point queue 0 at a 16-entry ring at `gpa`.
fn entry(dev: &VshmDevice<Recorder>, gpa: u64) -> DriverConfig {
    let drv = DriverConfig::attach(dev.config().memory(), 16).unwrap();
    drv.write_queue_entry(0, 16, 4096, (gpa / PAGE) as u32).unwrap();
    drv
}

#[test]
fn zero_mask_maps_a_region_with_no_access() {
    let (mut dev, caps) = bare_device(DeviceOptions::default());
    let mem = SharedMemory::new(0x4000);
    let cap = caps.insert_region(mem, Rights::RW);
    dev.register_region(cap.with_mask(0), GPA, 0, 0x4000).unwrap();

    let regions = dev.regions();
    assert_eq!(regions.mappings().next().unwrap().rights, Rights::empty());
    assert!(matches!(
        regions.check(GPA, 8, Rights::READ),
        Err(MemoryError::Denied { .. })
    ));
    let mut buf = [0u8; 4];
    assert!(regions.read(GPA, &mut buf).is_err());
    assert!(regions.write(GPA, &buf).is_err());

    let _drv = entry(&dev, GPA);
    let err = dev.configure_queue(0).unwrap_err();
    assert!(matches!(err, TransportError::InvalidConfiguration(_)));
    assert!(dev.queue(0).is_none());
}

#[test]
fn rights_are_the_intersection_of_mask_and_held() {
    let (mut dev, caps) = bare_device(DeviceOptions::default());
    let held_read = caps.insert_region(SharedMemory::new(0x4000), Rights::READ);

    // Asking for more than is held only keeps what is held.
    let wide = held_read.with_mask(Rights::RW.bits());
    dev.register_region(wide, GPA, 0, 0x4000).unwrap();
    let regions = dev.regions();
    assert!(regions.check(GPA, 16, Rights::READ).is_ok());
    assert!(regions.check(GPA, 16, Rights::WRITE).is_err());

    // A read-only region cannot carry a ring.
    let _drv = entry(&dev, GPA);
    assert!(dev.configure_queue(0).is_err());

    // Asking only for a right that is not held is refused outright.
    let write_only = held_read.with_mask(Rights::WRITE.bits());
    let err = dev
        .register_region(write_only, GPA + 0x10_0000, 0, 0x1000)
        .unwrap_err();
    assert!(matches!(err, TransportError::RightsViolation(_)));
    assert_eq!(err.code(), -errno::EPERM);
}

#[test]
fn bad_windows_are_invalid_arguments() {
    let (mut dev, caps) = bare_device(DeviceOptions::default());
    let cap = caps.insert_region(SharedMemory::new(0x4000), Rights::RW);
    dev.register_region(cap, GPA, 0, 0x2000).unwrap();

    let cases = [
        // Overlaps the first mapping.
        (GPA + 0x1000, 0x2000, 0x1000),
        // Runs past the end of the object.
        (GPA + 0x10_0000, 0x3000, 0x2000),
        // Zero size.
        (GPA + 0x10_0000, 0, 0),
        // Guest-physical base and offset disagree modulo 8.
        (GPA + 0x10_0004, 0x2000, 0x100),
    ];
    for (gpa, offset, size) in cases {
        let err = dev.register_region(cap, gpa, offset, size).unwrap_err();
        assert!(
            matches!(err, TransportError::InvalidArgument(_)),
            "gpa={gpa:#x} offset={offset:#x} size={size:#x}: {err}"
        );
        assert_eq!(err.code(), -errno::EINVAL);
    }
    assert_eq!(dev.regions().len(), 1);
}

#[test]
fn unknown_and_revoked_caps_are_refused() {
    let (mut dev, caps) = bare_device(DeviceOptions::default());
    let cap = caps.insert_region(SharedMemory::new(0x1000), Rights::RW);
    caps.revoke(cap);
    assert!(matches!(
        dev.register_region(cap, GPA, 0, 0x1000),
        Err(TransportError::InvalidArgument(_))
    ));

    let notifier = caps.insert_notifier(Notifier::new(), Rights::SIGNAL);
    assert!(matches!(
        dev.register_region(notifier, GPA, 0, 0x1000),
        Err(TransportError::InvalidArgument(_))
    ));
}

#[test]
fn windows_translate_to_object_offsets() {
    let (mut dev, caps) = bare_device(DeviceOptions::default());
    let mem = SharedMemory::new(0x4000);
    let cap = caps.insert_region(mem.clone(), Rights::RW);
    dev.register_region(cap, GPA, 0x1000, 0x1000).unwrap();

    dev.regions().write(GPA + 0x10, b"vshm").unwrap();
    let mut buf = [0u8; 4];
    mem.read(0x1010, &mut buf).unwrap();
    assert_eq!(&buf, b"vshm");

    // The window ends at GPA + 0x1000 even though the object continues.
    assert!(dev.regions().check(GPA + 0xFFC, 8, Rights::READ).is_err());
}

#[test]
fn a_ring_cannot_span_adjacent_regions() {
    let (mut dev, caps) = bare_device(DeviceOptions::default());
    let a = caps.insert_region(SharedMemory::new(0x1000), Rights::RW);
    let b = caps.insert_region(SharedMemory::new(0x1000), Rights::RW);
    dev.register_region(a, GPA, 0, 0x1000).unwrap();
    dev.register_region(b, GPA + 0x1000, 0, 0x1000).unwrap();

    // A 16-entry ring with 4 KiB alignment needs two pages.
    let _drv = entry(&dev, GPA);
    assert!(matches!(
        dev.configure_queue(0),
        Err(TransportError::InvalidConfiguration(_))
    ));
}

#[test]
fn reset_drops_every_region() {
    let (mut dev, caps) = bare_device(DeviceOptions::default());
    let cap = caps.insert_region(SharedMemory::new(0x1000), Rights::RW);
    dev.register_region(cap, GPA, 0, 0x1000).unwrap();
    dev.set_status(0).unwrap();
    assert!(dev.regions().is_empty());
    dev.register_region(cap, GPA, 0, 0x1000).unwrap();
}
