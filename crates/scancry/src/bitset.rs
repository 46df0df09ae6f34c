//! A simple, stripped down bitset implementation.

#[derive(Debug, Clone, Default)]
#[repr(transparent)]
pub struct BitSet {
    slots: Vec<u64>,
}

impl BitSet {
    const BITS_IN_SLOT: usize = std::mem::size_of::<u64>() * 8;

    /// Construct a bitset with room for `bits` bits.
    pub fn with_capacity(bits: usize) -> Self {
        let slots = (bits + Self::BITS_IN_SLOT - 1) / Self::BITS_IN_SLOT;

        Self {
            slots: vec![0u64; slots],
        }
    }

    /// Test if the given bit is set.
    pub fn test(&self, index: usize) -> bool {
        let slot = index / Self::BITS_IN_SLOT;

        if let Some(slot) = self.slots.get(slot) {
            let o = index % Self::BITS_IN_SLOT;
            1 & (slot >> o) == 1
        } else {
            false
        }
    }

    /// Set the given bit.
    pub fn set(&mut self, index: usize) {
        let slot = index / Self::BITS_IN_SLOT;
        let offset = index % Self::BITS_IN_SLOT;

        if self.slots.len() <= slot {
            self.slots.resize(slot + 1, 0u64);
        }

        self.slots[slot] |= 1u64 << offset;
    }
}

#[cfg(test)]
mod tests {
    use super::BitSet;

    #[test]
    fn test_set_beyond_capacity() {
        let mut set = BitSet::with_capacity(4);
        set.set(1);
        set.set(64);
        set.set(200);

        assert!(set.test(1));
        assert!(set.test(64));
        assert!(set.test(200));
        assert!(!set.test(0));
        assert!(!set.test(63));
        assert!(!set.test(1000));
    }
}
