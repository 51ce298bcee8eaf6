//! Capability references and the resolver seam.
//!
//! The transport never grants or forges access. It receives opaque [`CapRef`] values from
//! the driver and asks a [`CapabilityResolver`] what object they name and which rights the
//! caller holds on it. [`CapTable`] is an in-process resolver for loopback setups and tests.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::memory::{Rights, SharedMemory};
use crate::notify::Notifier;

/// Capability reference: a slot index in the upper bits and a rights mask in the low 8 bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CapRef(pub u64);

impl CapRef {
    pub const MASK_BITS: u32 = 8;

    pub const fn new(slot: u64, mask: u8) -> Self {
        Self((slot << Self::MASK_BITS) | mask as u64)
    }

    pub const fn slot(self) -> u64 {
        self.0 >> Self::MASK_BITS
    }

    /// Raw mask bits as transmitted.
    pub const fn raw_mask(self) -> u8 {
        self.0 as u8
    }

    /// Requested rights. Unknown mask bits are dropped.
    pub fn mask(self) -> Rights {
        Rights::from_bits_truncate(self.raw_mask())
    }

    /// Same slot, different mask.
    pub const fn with_mask(self, mask: u8) -> Self {
        Self::new(self.slot(), mask)
    }
}

impl fmt::Debug for CapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapRef(slot={}, mask={:#04x})", self.slot(), self.raw_mask())
    }
}

/// Resolves capability references to objects plus the rights the caller holds on them.
///
/// The mask carried in the reference is *not* applied here; callers intersect it with the
/// returned rights.
pub trait CapabilityResolver: Send {
    fn resolve_region(&self, cap: CapRef) -> Option<(SharedMemory, Rights)>;

    fn resolve_notifier(&self, cap: CapRef) -> Option<(Notifier, Rights)>;
}

#[derive(Clone)]
enum CapObject {
    Region(SharedMemory),
    Notifier(Notifier),
}

#[derive(Clone)]
struct CapEntry {
    object: CapObject,
    rights: Rights,
}

/// In-process capability table shared by both sides of a loopback transport.
#[derive(Clone, Default)]
pub struct CapTable {
    slots: Arc<Mutex<Vec<Option<CapEntry>>>>,
}

impl fmt::Debug for CapTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapTable")
            .field("slots", &self.lock().len())
            .finish()
    }
}

impl CapTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Option<CapEntry>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, object: CapObject, rights: Rights) -> CapRef {
        let mut slots = self.lock();
        let slot = slots.len() as u64;
        slots.push(Some(CapEntry { object, rights }));
        CapRef::new(slot, rights.bits())
    }

    /// Register a memory object held with `rights`. The returned reference requests all of
    /// them.
    pub fn insert_region(&self, mem: SharedMemory, rights: Rights) -> CapRef {
        self.insert(CapObject::Region(mem), rights)
    }

    pub fn insert_notifier(&self, notifier: Notifier, rights: Rights) -> CapRef {
        self.insert(CapObject::Notifier(notifier), rights)
    }

    /// Drop the object behind `cap`. Later resolutions of the slot fail.
    pub fn revoke(&self, cap: CapRef) {
        if let Some(entry) = self.lock().get_mut(cap.slot() as usize) {
            *entry = None;
        }
    }

    fn entry(&self, cap: CapRef) -> Option<CapEntry> {
        self.lock().get(cap.slot() as usize).cloned().flatten()
    }
}

impl CapabilityResolver for CapTable {
    fn resolve_region(&self, cap: CapRef) -> Option<(SharedMemory, Rights)> {
        match self.entry(cap)? {
            CapEntry {
                object: CapObject::Region(mem),
                rights,
            } => Some((mem, rights)),
            _ => None,
        }
    }

    fn resolve_notifier(&self, cap: CapRef) -> Option<(Notifier, Rights)> {
        match self.entry(cap)? {
            CapEntry {
                object: CapObject::Notifier(n),
                rights,
            } => Some((n, rights)),
            _ => None,
        }
    }
}
