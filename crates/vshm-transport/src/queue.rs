//! Split-virtqueue ring engine.
//!
//! [`DriverQueue`] is the producer side: it owns the descriptor table and the available ring.
//! [`DeviceQueue`] is the consumer side: it owns the used ring. Both sides access the ring
//! memory through an [`AddressSpace`]; the only synchronizing accesses are the release
//! stores and acquire loads of `avail.idx` and `used.idx`. Everything else is a byte copy.

use std::sync::atomic::{fence, Ordering};

use tracing::trace;
use vshm_abi::{
    DescFlags, VirtqDesc, VringLayout, VRING_AVAIL_F_NO_INTERRUPT, VRING_USED_F_NO_NOTIFY,
};

use crate::error::{ChainError, ProtocolViolation, Result, TransportError};
use crate::memory::{AddressSpace, MemoryResult, Rights};
use crate::notify::Notifier;

fn read_desc(mem: &AddressSpace, addr: u64) -> MemoryResult<VirtqDesc> {
    let mut buf = [0u8; VirtqDesc::SIZE];
    mem.read(addr, &mut buf)?;
    Ok(VirtqDesc::from_le_bytes(buf))
}

fn write_desc(mem: &AddressSpace, addr: u64, desc: &VirtqDesc) -> MemoryResult<()> {
    mem.write(addr, &desc.to_le_bytes())
}

/// A descriptor chain popped by the device, with every buffer already checked against the
/// registered regions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorChain {
    head: u16,
    descs: Vec<VirtqDesc>,
    indirect: bool,
}

impl DescriptorChain {
    pub fn head_index(&self) -> u16 {
        self.head
    }

    /// Descriptors in chain order. For an indirect chain these are the table entries.
    pub fn descriptors(&self) -> &[VirtqDesc] {
        &self.descs
    }

    pub fn is_indirect(&self) -> bool {
        self.indirect
    }

    pub fn readable(&self) -> impl Iterator<Item = &VirtqDesc> {
        self.descs.iter().filter(|d| !d.is_write_only())
    }

    pub fn writable(&self) -> impl Iterator<Item = &VirtqDesc> {
        self.descs.iter().filter(|d| d.is_write_only())
    }

    pub fn total_len(&self) -> u64 {
        self.descs.iter().map(|d| u64::from(d.len)).sum()
    }

    pub fn writable_len(&self) -> u64 {
        self.writable().map(|d| u64::from(d.len)).sum()
    }
}

/// One available-ring entry as seen by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Popped {
    Chain(DescriptorChain),
    /// The chain was rejected. It still has to be completed so the driver can reclaim it.
    /// `partial` holds the descriptors validated before the walk failed.
    Malformed {
        head: u16,
        error: ChainError,
        partial: Vec<VirtqDesc>,
    },
}

impl Popped {
    pub fn head_index(&self) -> u16 {
        match self {
            Popped::Chain(chain) => chain.head,
            Popped::Malformed { head, .. } => *head,
        }
    }
}

/// A completion read back by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsedElem {
    pub head: u16,
    pub len: u32,
}

/// A buffer handed to [`DriverQueue::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Buffer {
    pub addr: u64,
    pub len: u32,
    /// Device-writable.
    pub write: bool,
}

impl Buffer {
    pub fn readable(addr: u64, len: u32) -> Self {
        Self {
            addr,
            len,
            write: false,
        }
    }

    pub fn writable(addr: u64, len: u32) -> Self {
        Self {
            addr,
            len,
            write: true,
        }
    }

    fn flags(&self) -> DescFlags {
        if self.write {
            DescFlags::WRITE
        } else {
            DescFlags::empty()
        }
    }
}

/// Device side of one queue.
#[derive(Debug)]
pub struct DeviceQueue {
    layout: VringLayout,
    last_avail_idx: u16,
    used_idx: u16,
    indirect: bool,
    outstanding: usize,
}

impl DeviceQueue {
    /// Start consuming at the ring's current `used.idx`. A freshly zeroed ring starts at 0.
    pub fn new(layout: VringLayout, indirect: bool, mem: &AddressSpace) -> Result<Self> {
        let used_idx = mem.read_u16_le(layout.used_idx_addr())?;
        Ok(Self {
            layout,
            last_avail_idx: used_idx,
            used_idx,
            indirect,
            outstanding: 0,
        })
    }

    pub fn layout(&self) -> &VringLayout {
        &self.layout
    }

    pub fn size(&self) -> u16 {
        self.layout.num
    }

    pub fn last_avail_idx(&self) -> u16 {
        self.last_avail_idx
    }

    pub fn used_idx(&self) -> u16 {
        self.used_idx
    }

    /// Chains popped but not yet completed.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    fn avail_pending(&self, mem: &AddressSpace) -> Result<u16> {
        let avail_idx = mem.load_u16(self.layout.avail_idx_addr(), Ordering::Acquire)?;
        let pending = avail_idx.wrapping_sub(self.last_avail_idx);
        if pending > self.layout.num {
            return Err(ProtocolViolation::AvailOverrun {
                avail_idx,
                last_avail_idx: self.last_avail_idx,
            }
            .into());
        }
        Ok(pending)
    }

    /// Whether the driver published chains the device has not completed.
    ///
    /// An `avail.idx` more than a ring ahead means the driver rewrote the ring; none of its
    /// entries belong to this queue, so only chains already popped count.
    pub fn is_busy(&self, mem: &AddressSpace) -> Result<bool> {
        if self.outstanding > 0 {
            return Ok(true);
        }
        match self.avail_pending(mem) {
            Ok(pending) => Ok(pending > 0),
            Err(TransportError::Protocol(ProtocolViolation::AvailOverrun { .. })) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Take the next available entry, if any.
    ///
    /// A malformed chain is returned as [`Popped::Malformed`]; only ring-level problems (the
    /// ring itself unreadable, or `avail.idx` running ahead by more than a ring) are errors.
    pub fn pop(&mut self, mem: &AddressSpace) -> Result<Option<Popped>> {
        if self.avail_pending(mem)? == 0 {
            return Ok(None);
        }
        let head = mem.read_u16_le(self.layout.avail_slot_addr(self.last_avail_idx))?;
        self.last_avail_idx = self.last_avail_idx.wrapping_add(1);
        self.outstanding += 1;

        let mut descs = Vec::new();
        let mut indirect = false;
        match self.walk(mem, head, &mut descs, &mut indirect) {
            Ok(()) => {
                trace!(head, descs = descs.len(), "popped chain");
                Ok(Some(Popped::Chain(DescriptorChain {
                    head,
                    descs,
                    indirect,
                })))
            }
            Err(error) => Ok(Some(Popped::Malformed {
                head,
                error,
                partial: descs,
            })),
        }
    }

    fn check_buffer(mem: &AddressSpace, desc: &VirtqDesc) -> core::result::Result<(), ChainError> {
        if desc.len == 0 {
            return Ok(());
        }
        let needed = if desc.is_write_only() {
            Rights::WRITE
        } else {
            Rights::READ
        };
        mem.check(desc.addr, u64::from(desc.len), needed)
            .map_err(ChainError::Buffer)
    }

    fn walk(
        &self,
        mem: &AddressSpace,
        head: u16,
        descs: &mut Vec<VirtqDesc>,
        indirect: &mut bool,
    ) -> core::result::Result<(), ChainError> {
        let num = self.layout.num;
        if head >= num {
            return Err(ChainError::HeadOutOfRange { head, num });
        }
        let mut idx = head;
        let mut visited = 0u16;
        loop {
            if visited >= num {
                return Err(ChainError::Cycle);
            }
            visited += 1;
            let desc = read_desc(mem, self.layout.desc_addr(idx)).map_err(ChainError::Buffer)?;

            if desc.is_indirect() {
                if !self.indirect {
                    return Err(ChainError::IndirectNotNegotiated);
                }
                // An indirect descriptor must be the only one in the ring chain.
                if desc.has_next() || !descs.is_empty() {
                    return Err(ChainError::BadIndirectTable { len: desc.len });
                }
                *indirect = true;
                Self::walk_indirect(mem, &desc, descs)?;
                break;
            }

            Self::check_buffer(mem, &desc)?;
            descs.push(desc);
            if !desc.has_next() {
                break;
            }
            if desc.next >= num {
                return Err(ChainError::NextOutOfRange {
                    next: desc.next,
                    num,
                });
            }
            idx = desc.next;
        }

        if descs.iter().all(|d| d.len == 0) {
            return Err(ChainError::ZeroLength);
        }
        Ok(())
    }

    fn walk_indirect(
        mem: &AddressSpace,
        table: &VirtqDesc,
        descs: &mut Vec<VirtqDesc>,
    ) -> core::result::Result<(), ChainError> {
        let entries = table.len / VirtqDesc::SIZE as u32;
        if table.len == 0
            || table.len % VirtqDesc::SIZE as u32 != 0
            || entries > u32::from(u16::MAX)
        {
            return Err(ChainError::BadIndirectTable { len: table.len });
        }
        mem.check(table.addr, u64::from(table.len), Rights::READ)
            .map_err(ChainError::Buffer)?;
        let entries = entries as u16;
        let mut idx = 0u16;
        let mut visited = 0u16;
        loop {
            if visited >= entries {
                return Err(ChainError::Cycle);
            }
            visited += 1;
            let desc = read_desc(mem, table.addr + u64::from(idx) * VirtqDesc::SIZE as u64)
                .map_err(ChainError::Buffer)?;
            if desc.is_indirect() {
                return Err(ChainError::NestedIndirect);
            }
            Self::check_buffer(mem, &desc)?;
            descs.push(desc);
            if !desc.has_next() {
                return Ok(());
            }
            if desc.next >= entries {
                return Err(ChainError::NextOutOfRange {
                    next: desc.next,
                    num: entries,
                });
            }
            idx = desc.next;
        }
    }

    /// Complete the chain with the given head. Returns whether the driver wants a
    /// notification for this completion.
    pub fn add_used(&mut self, mem: &AddressSpace, head: u16, len: u32) -> Result<bool> {
        let mut elem = [0u8; 8];
        elem[..4].copy_from_slice(&u32::from(head).to_le_bytes());
        elem[4..].copy_from_slice(&len.to_le_bytes());
        mem.write(self.layout.used_slot_addr(self.used_idx), &elem)?;

        self.used_idx = self.used_idx.wrapping_add(1);
        mem.store_u16(self.layout.used_idx_addr(), self.used_idx, Ordering::Release)?;
        self.outstanding = self.outstanding.saturating_sub(1);
        trace!(head, len, used_idx = self.used_idx, "completed chain");

        // Order the index store before reading the driver's suppression flag.
        fence(Ordering::SeqCst);
        let flags = mem.load_u16(self.layout.avail_flags_addr(), Ordering::Acquire)?;
        Ok(flags & VRING_AVAIL_F_NO_INTERRUPT == 0)
    }

    /// Ask the driver not to notify on new available entries, or lift the request.
    pub fn set_notify_suppressed(&self, mem: &AddressSpace, suppressed: bool) -> Result<()> {
        let flags = if suppressed { VRING_USED_F_NO_NOTIFY } else { 0 };
        mem.store_u16(self.layout.used_flags_addr(), flags, Ordering::Release)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct InFlight {
    descs: Vec<u16>,
}

/// Driver side of one queue.
#[derive(Debug)]
pub struct DriverQueue {
    layout: VringLayout,
    free: Vec<u16>,
    in_flight: Vec<Option<InFlight>>,
    avail_idx: u16,
    last_used_idx: u16,
}

impl DriverQueue {
    /// Zero the ring memory and take ownership of all descriptors.
    pub fn new(layout: VringLayout, mem: &AddressSpace) -> Result<Self> {
        if layout.num == 0 {
            return Err(TransportError::InvalidArgument("queue size is zero"));
        }
        let len = usize::try_from(layout.size)
            .map_err(|_| TransportError::InvalidArgument("ring too large"))?;
        mem.fill(layout.desc, len, 0)?;
        Ok(Self {
            layout,
            free: (0..layout.num).rev().collect(),
            in_flight: vec![None; usize::from(layout.num)],
            avail_idx: 0,
            last_used_idx: 0,
        })
    }

    /// Take over an idle ring in place, continuing from its current indices.
    ///
    /// Fails without touching the ring if `avail.idx` and `used.idx` differ, i.e. the device
    /// still owes completions.
    pub fn resume(layout: VringLayout, mem: &AddressSpace) -> Result<Self> {
        if layout.num == 0 {
            return Err(TransportError::InvalidArgument("queue size is zero"));
        }
        let used_idx = mem.load_u16(layout.used_idx_addr(), Ordering::Acquire)?;
        let avail_idx = mem.load_u16(layout.avail_idx_addr(), Ordering::Relaxed)?;
        if avail_idx != used_idx {
            return Err(TransportError::InvalidConfiguration(
                "queue has requests in flight",
            ));
        }
        mem.store_u16(layout.avail_flags_addr(), 0, Ordering::Relaxed)?;
        Ok(Self {
            layout,
            free: (0..layout.num).rev().collect(),
            in_flight: vec![None; usize::from(layout.num)],
            avail_idx,
            last_used_idx: used_idx,
        })
    }

    pub fn layout(&self) -> &VringLayout {
        &self.layout
    }

    pub fn size(&self) -> u16 {
        self.layout.num
    }

    pub fn num_free(&self) -> usize {
        self.free.len()
    }

    /// Chains published and not yet returned through the used ring.
    pub fn outstanding(&self) -> usize {
        self.in_flight.iter().filter(|c| c.is_some()).count()
    }

    pub fn avail_idx(&self) -> u16 {
        self.avail_idx
    }

    fn publish(&mut self, mem: &AddressSpace, head: u16) -> Result<()> {
        mem.write(
            self.layout.avail_slot_addr(self.avail_idx),
            &head.to_le_bytes(),
        )?;
        self.avail_idx = self.avail_idx.wrapping_add(1);
        mem.store_u16(self.layout.avail_idx_addr(), self.avail_idx, Ordering::Release)?;
        trace!(head, avail_idx = self.avail_idx, "published chain");
        Ok(())
    }

    /// Build a chain from `bufs` and publish it.
    ///
    /// Returns `Ok(None)` when not enough descriptors are free; the caller retries after
    /// reclaiming completions.
    pub fn add(&mut self, mem: &AddressSpace, bufs: &[Buffer]) -> Result<Option<u16>> {
        if bufs.is_empty() {
            return Err(TransportError::InvalidArgument("empty chain"));
        }
        if bufs.len() > usize::from(self.layout.num) {
            return Err(TransportError::InvalidArgument("chain longer than the queue"));
        }
        if bufs.len() > self.free.len() {
            return Ok(None);
        }
        let split = self.free.len() - bufs.len();
        let mut ids = self.free.split_off(split);
        ids.reverse();

        for (i, buf) in bufs.iter().enumerate() {
            let mut flags = buf.flags();
            let next = match ids.get(i + 1) {
                Some(&next) => {
                    flags |= DescFlags::NEXT;
                    next
                }
                None => 0,
            };
            let desc = VirtqDesc {
                addr: buf.addr,
                len: buf.len,
                flags: flags.bits(),
                next,
            };
            if let Err(err) = write_desc(mem, self.layout.desc_addr(ids[i]), &desc) {
                self.free.extend(ids.iter().rev());
                return Err(err.into());
            }
        }
        let head = ids[0];
        self.in_flight[usize::from(head)] = Some(InFlight { descs: ids });
        self.publish(mem, head)?;
        Ok(Some(head))
    }

    /// Write `bufs` as an indirect table at `table_addr` and publish it through a single ring
    /// descriptor. The table memory must stay untouched until the chain completes.
    pub fn add_indirect(
        &mut self,
        mem: &AddressSpace,
        table_addr: u64,
        bufs: &[Buffer],
    ) -> Result<Option<u16>> {
        if bufs.is_empty() || bufs.len() > usize::from(u16::MAX) / VirtqDesc::SIZE {
            return Err(TransportError::InvalidArgument("bad indirect table length"));
        }
        let Some(head) = self.free.pop() else {
            return Ok(None);
        };
        for (i, buf) in bufs.iter().enumerate() {
            let mut flags = buf.flags();
            let next = if i + 1 < bufs.len() {
                flags |= DescFlags::NEXT;
                (i + 1) as u16
            } else {
                0
            };
            let desc = VirtqDesc {
                addr: buf.addr,
                len: buf.len,
                flags: flags.bits(),
                next,
            };
            if let Err(err) = write_desc(mem, table_addr + (i * VirtqDesc::SIZE) as u64, &desc) {
                self.free.push(head);
                return Err(err.into());
            }
        }
        let desc = VirtqDesc {
            addr: table_addr,
            len: (bufs.len() * VirtqDesc::SIZE) as u32,
            flags: DescFlags::INDIRECT.bits(),
            next: 0,
        };
        if let Err(err) = write_desc(mem, self.layout.desc_addr(head), &desc) {
            self.free.push(head);
            return Err(err.into());
        }
        self.in_flight[usize::from(head)] = Some(InFlight { descs: vec![head] });
        self.publish(mem, head)?;
        Ok(Some(head))
    }

    /// Whether the device wants to be notified about newly published chains.
    pub fn needs_notify(&self, mem: &AddressSpace) -> Result<bool> {
        // Order the avail.idx store before reading the device's suppression flag.
        fence(Ordering::SeqCst);
        let flags = mem.load_u16(self.layout.used_flags_addr(), Ordering::Acquire)?;
        Ok(flags & VRING_USED_F_NO_NOTIFY == 0)
    }

    /// Trigger `doorbell` unless the device suppressed notifications. Returns whether it
    /// was triggered.
    pub fn kick(&self, mem: &AddressSpace, doorbell: &Notifier) -> Result<bool> {
        let notify = self.needs_notify(mem)?;
        if notify {
            doorbell.trigger();
        }
        Ok(notify)
    }

    /// Reclaim the next completion, if any.
    pub fn pop_used(&mut self, mem: &AddressSpace) -> Result<Option<UsedElem>> {
        let used_idx = mem.load_u16(self.layout.used_idx_addr(), Ordering::Acquire)?;
        if used_idx == self.last_used_idx {
            return Ok(None);
        }
        let mut elem = [0u8; 8];
        mem.read(self.layout.used_slot_addr(self.last_used_idx), &mut elem)?;
        self.last_used_idx = self.last_used_idx.wrapping_add(1);

        let id = u32::from_le_bytes([elem[0], elem[1], elem[2], elem[3]]);
        let len = u32::from_le_bytes([elem[4], elem[5], elem[6], elem[7]]);
        let chain = usize::try_from(id)
            .ok()
            .and_then(|i| self.in_flight.get_mut(i))
            .and_then(Option::take)
            .ok_or(ProtocolViolation::UnknownUsedId { id })?;
        self.free.extend(chain.descs.iter().rev());
        Ok(Some(UsedElem {
            head: id as u16,
            len,
        }))
    }

    /// Ask the device not to notify on completions, or lift the request.
    pub fn set_interrupt_suppressed(&self, mem: &AddressSpace, suppressed: bool) -> Result<()> {
        let flags = if suppressed {
            VRING_AVAIL_F_NO_INTERRUPT
        } else {
            0
        };
        mem.store_u16(self.layout.avail_flags_addr(), flags, Ordering::Release)?;
        Ok(())
    }
}
