mod common;

use common::Rig;
use vshm_abi::{errno, hdr_offset, DeviceStatus, FeatureBits, IrqStatus};
use vshm_transport::{DeviceOptions, DriverOkPolicy, ProtocolViolation, TransportError};

const ACK: u32 = DeviceStatus::ACKNOWLEDGE.bits();
const DRIVER: u32 = DeviceStatus::DRIVER.bits();
const FEATURES_OK: u32 = DeviceStatus::FEATURES_OK.bits();
const DRIVER_OK: u32 = DeviceStatus::DRIVER_OK.bits();
const FAILED: u32 = DeviceStatus::FAILED.bits();

#[test]
fn handshake_reaches_driver_ok() {
    let mut rig = Rig::new(DeviceOptions::default());
    let wanted = FeatureBits::from_bits(&[1]);
    rig.go_live(&wanted);

    let status = rig.drv.status().unwrap();
    assert_eq!(status.bits(), ACK | DRIVER | FEATURES_OK | DRIVER_OK);
    assert_eq!(rig.dev.negotiated_features(), wanted);
    assert_eq!(rig.dev.backend().features, Some(wanted));
}

#[test]
fn bits_cannot_be_cleared() {
    let mut rig = Rig::new(DeviceOptions::default());
    rig.dev.set_status(ACK | DRIVER).unwrap();
    let err = rig.dev.set_status(ACK).unwrap_err();
    assert!(matches!(err, TransportError::InvalidArgument(_)));
    assert_eq!(err.code(), -errno::EINVAL);
    assert_eq!(rig.drv.status().unwrap().bits(), ACK | DRIVER);

    // Rewriting the current value is accepted and changes nothing.
    rig.dev.set_status(ACK | DRIVER).unwrap();
    assert_eq!(rig.drv.status().unwrap().bits(), ACK | DRIVER);
}

#[test]
fn needs_reset_and_unknown_bits_are_not_driver_writable() {
    let mut rig = Rig::new(DeviceOptions::default());
    let needs_reset = DeviceStatus::DEVICE_NEEDS_RESET.bits();
    assert!(rig.dev.set_status(ACK | needs_reset).is_err());
    assert!(rig.dev.set_status(ACK | 0x100).is_err());
    assert_eq!(rig.drv.status().unwrap(), DeviceStatus::empty());
}

#[test]
fn driver_ok_before_features_ok_follows_policy() {
    let mut rig = Rig::new(DeviceOptions::default());
    rig.dev.set_status(ACK | DRIVER).unwrap();
    let err = rig.dev.set_status(ACK | DRIVER | DRIVER_OK).unwrap_err();
    assert_eq!(err.code(), -errno::EIO);
    assert_eq!(rig.drv.status().unwrap().bits(), ACK | DRIVER);

    let mut rig = Rig::new(DeviceOptions {
        driver_ok_policy: DriverOkPolicy::Ignore,
        ..DeviceOptions::default()
    });
    rig.dev.set_status(ACK | DRIVER).unwrap();
    rig.dev.set_status(ACK | DRIVER | DRIVER_OK).unwrap();
    assert_eq!(rig.drv.status().unwrap().bits(), ACK | DRIVER);
}

#[test]
fn features_ok_refuses_unoffered_bits() {
    let mut rig = Rig::new(DeviceOptions::default());
    rig.dev.set_status(ACK | DRIVER).unwrap();

    // Bypass the driver-side check to plant a bit the device never offered.
    let mut rogue = [0u8; 32];
    rogue[0] = 0b100;
    rig.dev
        .config()
        .view()
        .write(hdr_offset::GUEST_FEATURES as u64, &rogue)
        .unwrap();

    let err = rig.dev.set_status(ACK | DRIVER | FEATURES_OK).unwrap_err();
    assert_eq!(
        err,
        TransportError::Protocol(ProtocolViolation::UnofferedFeature { bit: 2 })
    );
    assert_eq!(err.code(), -errno::EINVAL);
    assert!(!rig.drv.status().unwrap().contains(DeviceStatus::FEATURES_OK));
    assert!(rig.dev.backend().features.is_none());
}

#[test]
fn failed_is_absorbing_until_reset() {
    let mut rig = Rig::new(DeviceOptions::default());
    rig.dev.set_status(ACK | FAILED).unwrap();
    assert_eq!(
        rig.dev.set_status(ACK | DRIVER | FAILED),
        Err(TransportError::DeviceFailure)
    );

    rig.dev.set_status(0).unwrap();
    assert_eq!(rig.drv.status().unwrap(), DeviceStatus::empty());
    rig.dev.set_status(ACK).unwrap();
}

#[test]
fn reset_returns_to_a_clean_header() {
    let mut rig = Rig::new(DeviceOptions::default());
    rig.go_live(&FeatureBits::from_bits(&[0]));
    rig.configure(0, 16, 4096, common::RAM_GPA).unwrap();
    rig.dev.update_device_config(0, &[9]).unwrap();
    let before = rig.drv.generation().unwrap();

    rig.dev.set_status(0).unwrap();
    assert!(rig.drv.generation().unwrap() > before);
    assert_eq!(rig.drv.status().unwrap(), DeviceStatus::empty());
    assert_eq!(rig.drv.irq_status().unwrap(), IrqStatus::empty());
    assert!(rig.drv.guest_features().unwrap().is_empty());
    let entry = rig.drv.queue_entry(0).unwrap();
    assert_eq!((entry.num, entry.align, entry.pfn), (0, 0, 0));
    assert_eq!(entry.num_max, common::NUM_MAX);
    assert!(rig.dev.queue(0).is_none());
    assert!(rig.dev.negotiated_features().is_empty());
    assert!(rig.dev.backend().features.is_none());

    // Reset is idempotent.
    rig.dev.set_status(0).unwrap();
}

#[test]
fn device_errors_raise_a_config_interrupt() {
    let mut rig = Rig::new(DeviceOptions::default());
    rig.go_live(&FeatureBits::empty());
    rig.dev.fail(true).unwrap();

    let status = rig.drv.status().unwrap();
    assert!(status.contains(DeviceStatus::DEVICE_NEEDS_RESET));
    assert!(rig.drv.take_irq_status().unwrap().contains(IrqStatus::CONFIG));
    assert_eq!(rig.drv.take_irq_status().unwrap(), IrqStatus::empty());
    assert_eq!(rig.dev.process_queues().unwrap(), 0);

    // The driver may keep writing status with the device-owned bit carried along.
    rig.dev.set_status(status.bits()).unwrap();
}
