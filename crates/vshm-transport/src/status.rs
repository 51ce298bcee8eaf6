//! Device status transitions.
//!
//! Status bits are only ever added. Writing `0` is a hard reset; writing a value that would
//! clear a bit is refused. `FAILED` is absorbing: after it, only reset moves the device.

use vshm_abi::DeviceStatus;

use crate::error::{ProtocolViolation, Result, TransportError};
use crate::options::DriverOkPolicy;

/// Bits a driver may write. `DEVICE_NEEDS_RESET` is device-owned.
const DRIVER_WRITABLE: DeviceStatus = DeviceStatus::ACKNOWLEDGE
    .union(DeviceStatus::DRIVER)
    .union(DeviceStatus::DRIVER_OK)
    .union(DeviceStatus::FEATURES_OK)
    .union(DeviceStatus::FAILED);

/// Outcome of an accepted status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Drop all queue and region state and return to status 0.
    Reset,
    /// Store the new status. `newly_set` holds the bits this write added.
    Apply {
        status: DeviceStatus,
        newly_set: DeviceStatus,
    },
    /// Accept the call but leave status as it is.
    Unchanged,
}

/// Decide how the device answers `set_status(requested)` while in `current`.
///
/// `unoffered` is the lowest guest feature bit the device did not offer, if any; it makes
/// `FEATURES_OK` unacceptable.
pub fn evaluate(
    current: DeviceStatus,
    requested: u32,
    unoffered: Option<u32>,
    driver_ok_policy: DriverOkPolicy,
) -> Result<Transition> {
    if requested == 0 {
        return Ok(Transition::Reset);
    }
    let Some(new) = DeviceStatus::from_bits(requested) else {
        return Err(TransportError::InvalidArgument("unknown status bits"));
    };
    // The device may already hold DEVICE_NEEDS_RESET; the driver never writes it.
    let driver_bits = new.difference(current);
    if !DRIVER_WRITABLE.contains(driver_bits) {
        return Err(TransportError::InvalidArgument(
            "status bit is not driver-writable",
        ));
    }
    if !new.contains(current) {
        return Err(TransportError::InvalidArgument("status bits may not be cleared"));
    }
    if new == current {
        return Ok(Transition::Unchanged);
    }
    if current.contains(DeviceStatus::FAILED) {
        return Err(TransportError::DeviceFailure);
    }

    let newly_set = driver_bits;
    if newly_set.contains(DeviceStatus::FEATURES_OK) {
        if let Some(bit) = unoffered {
            return Err(ProtocolViolation::UnofferedFeature { bit }.into());
        }
    }
    if newly_set.contains(DeviceStatus::DRIVER_OK) && !new.contains(DeviceStatus::FEATURES_OK) {
        return match driver_ok_policy {
            DriverOkPolicy::Reject => Err(TransportError::InvalidConfiguration(
                "DRIVER_OK before FEATURES_OK",
            )),
            DriverOkPolicy::Ignore => Ok(Transition::Unchanged),
        };
    }
    Ok(Transition::Apply {
        status: new,
        newly_set,
    })
}

/// Whether queues may be processed in `status`.
pub fn is_live(status: DeviceStatus) -> bool {
    status.contains(DeviceStatus::DRIVER_OK)
        && !status.intersects(DeviceStatus::FAILED | DeviceStatus::DEVICE_NEEDS_RESET)
}
