use thiserror::Error;
use vshm_abi::errno;

use crate::memory::Rights;

/// Errors raised by shared-memory accessors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("shared memory access out of range: offset=0x{offset:x} len={len} size=0x{size:x}")]
    OutOfRange { offset: u64, len: usize, size: u64 },

    #[error("misaligned {width}-byte atomic access at offset 0x{offset:x}")]
    Misaligned { offset: u64, width: usize },

    #[error("no registered region covers guest-physical 0x{gpa:x} (len {len})")]
    Unmapped { gpa: u64, len: usize },

    #[error("access to guest-physical 0x{gpa:x} denied: need {needed:?}, region grants {granted:?}")]
    Denied {
        gpa: u64,
        needed: Rights,
        granted: Rights,
    },
}

/// Reasons a descriptor chain is rejected by the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("head index {head} out of range (queue size {num})")]
    HeadOutOfRange { head: u16, num: u16 },

    #[error("next index {next} out of range (table size {num})")]
    NextOutOfRange { next: u16, num: u16 },

    #[error("descriptor chain loops")]
    Cycle,

    #[error("descriptor chain has zero total length")]
    ZeroLength,

    #[error("indirect descriptor used but not negotiated")]
    IndirectNotNegotiated,

    #[error("indirect descriptor inside an indirect table")]
    NestedIndirect,

    #[error("indirect table of {len} bytes is malformed")]
    BadIndirectTable { len: u32 },

    #[error("descriptor buffer rejected: {0}")]
    Buffer(MemoryError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("bad config magic 0x{found:08x}")]
    BadMagic { found: u32 },

    #[error("config header layout does not fit the region: {0}")]
    BadLayout(&'static str),

    #[error("config generation did not settle after {attempts} attempts")]
    GenerationUnstable { attempts: u32 },

    #[error("malformed descriptor chain at head {head}: {reason}")]
    MalformedChain { head: u16, reason: ChainError },

    #[error("feature bit {bit} was not offered by the device")]
    UnofferedFeature { bit: u32 },

    #[error("used ring returned unknown id {id}")]
    UnknownUsedId { id: u32 },

    #[error("available index {avail_idx} is more than a ring ahead of {last_avail_idx}")]
    AvailOverrun { avail_idx: u16, last_avail_idx: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(&'static str),

    #[error("out of range: {0}")]
    OutOfRange(&'static str),

    #[error("rights violation: {0}")]
    RightsViolation(&'static str),

    #[error("device has failed")]
    DeviceFailure,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("control channel disconnected")]
    Disconnected,

    #[error("control call timed out")]
    TimedOut,

    #[error("remote call failed with code {0}")]
    Remote(i32),
}

pub type Result<T> = core::result::Result<T, TransportError>;

impl TransportError {
    /// Negative wire code reported by a control call that failed with this error.
    pub fn code(&self) -> i32 {
        let errno = match self {
            TransportError::OutOfRange(_) => errno::ERANGE,
            TransportError::InvalidConfiguration(_)
            | TransportError::DeviceFailure
            | TransportError::Disconnected
            | TransportError::TimedOut => errno::EIO,
            TransportError::RightsViolation(_)
            | TransportError::Memory(MemoryError::Denied { .. }) => errno::EPERM,
            TransportError::Remote(code) => return *code,
            _ => errno::EINVAL,
        };
        -errno
    }

    /// Rebuild a coarse error from a wire code. `0` is success and yields `None`.
    ///
    /// `-EIO` is ambiguous on the wire; callers that care about `DeviceFailure` should check
    /// the status register for `FAILED`.
    pub fn from_code(code: i32) -> Option<Self> {
        if code == 0 {
            return None;
        }
        Some(match code.checked_neg() {
            Some(errno::ERANGE) => TransportError::OutOfRange("reported by device"),
            Some(errno::EIO) => TransportError::InvalidConfiguration("reported by device"),
            Some(errno::EPERM) => TransportError::RightsViolation("reported by device"),
            Some(errno::EINVAL) => TransportError::InvalidArgument("reported by device"),
            _ => TransportError::Remote(code),
        })
    }

    /// `Ok(())` for `0`, otherwise the reconstructed error.
    pub fn check(code: i32) -> Result<()> {
        match Self::from_code(code) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}
