//! Synthetic processes for tests.

use crate::{Access, Address, AddressRange, MemoryMap, MemoryMapBuilder, PointerWidth, Snapshot};
use std::sync::Arc;

/// Builds a memory map together with zeroed, fully captured memory.
#[derive(Default)]
pub(crate) struct FixtureBuilder {
    map: MemoryMapBuilder,
    memory: Snapshot,
}

impl FixtureBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a region of `size` zeroed bytes at `start`.
    pub(crate) fn region(
        mut self,
        start: u64,
        size: u64,
        access: Access,
        pathname: Option<&str>,
    ) -> Self {
        let range = AddressRange::new(Address::new(start), Address::new(start + size)).unwrap();
        self.map.push(range, access, pathname);
        self.memory
            .insert(Address::new(start), vec![0u8; size as usize]);
        self
    }

    /// Store an eight byte pointer at `at`.
    pub(crate) fn pointer(mut self, at: u64, value: u64) -> Self {
        let bytes = self.memory.bytes_mut(Address::new(at)).unwrap();
        PointerWidth::Eight.encode(bytes, Address::new(value));
        self
    }

    pub(crate) fn build(self) -> (Arc<MemoryMap>, Arc<Snapshot>) {
        (Arc::new(self.map.build().unwrap()), Arc::new(self.memory))
    }
}

/// A small game-like process.
///
/// ```text
/// 0x10000-0x12000 rw- game         target struct at 0x10840
///                                  0x10100 -> 0x10830
/// 0x20000-0x21000 rw- unit_target  0x200b0 -> 0x10840
///                                  0x20200 -> 0x100f8
/// 0x21000-0x22000 r-- unit_target
/// 0x30000-0x31000 rw- anonymous    0x30010 -> 0x10840
/// ```
pub(crate) struct Fixture {
    pub(crate) map: Arc<MemoryMap>,
    pub(crate) memory: Arc<Snapshot>,
    pub(crate) target: Address,
}

impl Fixture {
    pub(crate) fn game() -> Self {
        let rw = Access::READ | Access::WRITE;

        let (map, memory) = FixtureBuilder::new()
            .region(0x10000, 0x2000, rw, Some("game"))
            .region(0x20000, 0x1000, rw, Some("unit_target"))
            .region(0x21000, 0x1000, Access::READ, Some("unit_target"))
            .region(0x30000, 0x1000, rw, None)
            .pointer(0x10100, 0x10830)
            .pointer(0x200b0, 0x10840)
            .pointer(0x20200, 0x100f8)
            .pointer(0x30010, 0x10840)
            .build();

        Self {
            map,
            memory,
            target: Address::new(0x10840),
        }
    }
}
