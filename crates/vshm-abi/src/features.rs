//! 256-bit feature bitmaps (`host_features` / `guest_features`).

/// Indirect descriptor tables.
pub const VIRTIO_F_RING_INDIRECT_DESC: u32 = 28;
/// `used_event` / `avail_event` notification suppression.
pub const VIRTIO_F_RING_EVENT_IDX: u32 = 29;
/// Virtio 1.0 compliance.
pub const VIRTIO_F_VERSION_1: u32 = 32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FeatureBits {
    words: [u32; 8],
}

impl FeatureBits {
    pub const BITS: u32 = 256;

    pub const fn empty() -> Self {
        Self { words: [0; 8] }
    }

    pub const fn from_words(words: [u32; 8]) -> Self {
        Self { words }
    }

    /// Build a bitmap from a list of bit numbers. Bits `>= 256` are ignored.
    pub fn from_bits(bits: &[u32]) -> Self {
        let mut out = Self::empty();
        for &bit in bits {
            out.set(bit);
        }
        out
    }

    pub const fn words(&self) -> [u32; 8] {
        self.words
    }

    pub fn contains(&self, bit: u32) -> bool {
        if bit >= Self::BITS {
            return false;
        }
        self.words[(bit / 32) as usize] & (1 << (bit % 32)) != 0
    }

    pub fn set(&mut self, bit: u32) {
        if bit < Self::BITS {
            self.words[(bit / 32) as usize] |= 1 << (bit % 32);
        }
    }

    pub fn clear(&mut self, bit: u32) {
        if bit < Self::BITS {
            self.words[(bit / 32) as usize] &= !(1 << (bit % 32));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn intersection(&self, other: &Self) -> Self {
        let mut words = [0u32; 8];
        for (i, w) in words.iter_mut().enumerate() {
            *w = self.words[i] & other.words[i];
        }
        Self { words }
    }

    pub fn union(&self, other: &Self) -> Self {
        let mut words = [0u32; 8];
        for (i, w) in words.iter_mut().enumerate() {
            *w = self.words[i] | other.words[i];
        }
        Self { words }
    }

    /// Bits set in `self` but not in `other`.
    pub fn difference(&self, other: &Self) -> Self {
        let mut words = [0u32; 8];
        for (i, w) in words.iter_mut().enumerate() {
            *w = self.words[i] & !other.words[i];
        }
        Self { words }
    }

    pub fn is_subset_of(&self, other: &Self) -> bool {
        self.difference(other).is_empty()
    }

    /// Iterate over the numbers of all set bits in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..Self::BITS).filter(move |bit| self.contains(*bit))
    }
}
