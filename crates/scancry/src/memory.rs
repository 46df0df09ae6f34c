//! The view of a target process that the scanner consumes.
//!
//! A [MemoryMap] is a snapshot of the mapped regions of a process, together
//! with the objects (backing files) that own them. A [MemoryReader] is a
//! session capable of reading the memory of that process.

use crate::{error::Error, Address, AddressRange};
use anyhow::anyhow;
use byteorder::{ByteOrder as _, NativeEndian};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::{fmt, ops, sync::Arc};

/// Identifies a region in a [MemoryMap] by its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegionId(pub usize);

impl fmt::Display for RegionId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "#{}", self.0)
    }
}

/// Identifies an object in a [MemoryMap] by its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub usize);

impl fmt::Display for ObjectId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "@{}", self.0)
    }
}

/// Access permissions of a region.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Access(u8);

impl Access {
    pub const NONE: Access = Access(0);
    pub const READ: Access = Access(0b0001);
    pub const WRITE: Access = Access(0b0010);
    pub const EXEC: Access = Access(0b0100);
    pub const SHARED: Access = Access(0b1000);

    /// Construct from raw bits, ignoring unknown ones.
    pub const fn from_bits(bits: u8) -> Access {
        Access(bits & 0b1111)
    }

    /// Raw bits of the access mask.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Test if no bits are set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Test if every bit in `other` is also set in `self`.
    pub fn contains(self, other: Access) -> bool {
        self.0 & other.0 == other.0
    }
}

impl ops::BitOr for Access {
    type Output = Access;

    fn bitor(self, rhs: Access) -> Access {
        Access(self.0 | rhs.0)
    }
}

impl fmt::Display for Access {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |bit: Access, c: char| if self.contains(bit) { c } else { '-' };

        write!(
            fmt,
            "{}{}{}{}",
            flag(Access::READ, 'r'),
            flag(Access::WRITE, 'w'),
            flag(Access::EXEC, 'x'),
            if self.contains(Access::SHARED) { 's' } else { 'p' },
        )
    }
}

impl fmt::Debug for Access {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, fmt)
    }
}

/// The width of pointers in the target process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PointerWidth {
    Four,
    Eight,
}

impl PointerWidth {
    /// The pointer width of the current platform.
    pub fn native() -> Self {
        if cfg!(target_pointer_width = "32") {
            PointerWidth::Four
        } else {
            PointerWidth::Eight
        }
    }

    /// Size of a pointer in bytes.
    pub fn size(self) -> usize {
        match self {
            PointerWidth::Four => 4,
            PointerWidth::Eight => 8,
        }
    }

    /// Decode a pointer from the start of the given buffer.
    ///
    /// The buffer must be at least [size][PointerWidth::size] bytes long.
    pub fn decode(self, buf: &[u8]) -> Address {
        match self {
            PointerWidth::Four => Address(u64::from(NativeEndian::read_u32(buf))),
            PointerWidth::Eight => Address(NativeEndian::read_u64(buf)),
        }
    }

    /// Encode a pointer into the start of the given buffer.
    pub fn encode(self, buf: &mut [u8], address: Address) {
        match self {
            PointerWidth::Four => NativeEndian::write_u32(buf, address.0 as u32),
            PointerWidth::Eight => NativeEndian::write_u64(buf, address.0),
        }
    }
}

impl Default for PointerWidth {
    fn default() -> Self {
        Self::native()
    }
}

/// A single contiguous mapping in the target process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub id: RegionId,
    pub range: AddressRange,
    pub access: Access,
    pub object: Option<ObjectId>,
}

impl MemoryRegion {
    /// Size of the region in bytes.
    pub fn size(&self) -> u64 {
        self.range.size()
    }
}

/// A backing object, like an executable or a shared library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwningObject {
    pub id: ObjectId,
    pub pathname: String,
    /// Regions owned by the object, in address order.
    pub regions: Vec<RegionId>,
    /// Start address of the lowest owned region.
    pub base: Address,
}

/// A snapshot of the memory map of a process.
#[derive(Debug, Clone, Default)]
pub struct MemoryMap {
    regions: Vec<MemoryRegion>,
    objects: Vec<OwningObject>,
    by_pathname: HashMap<String, ObjectId>,
}

impl MemoryMap {
    /// Start building a new memory map.
    pub fn builder() -> MemoryMapBuilder {
        MemoryMapBuilder::default()
    }

    /// All regions, ordered by address.
    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    /// All objects, ordered by their lowest region.
    pub fn objects(&self) -> &[OwningObject] {
        &self.objects
    }

    /// Access a region by id.
    pub fn region(&self, id: RegionId) -> Option<&MemoryRegion> {
        self.regions.get(id.0)
    }

    /// Access an object by id.
    pub fn object(&self, id: ObjectId) -> Option<&OwningObject> {
        self.objects.get(id.0)
    }

    /// Find the region that contains the given address.
    pub fn find_region(&self, address: Address) -> Option<&MemoryRegion> {
        AddressRange::find_in_range(&self.regions, |r| &r.range, address)
    }

    /// Find an object by its pathname.
    pub fn find_object(&self, pathname: &str) -> Option<&OwningObject> {
        let id = self.by_pathname.get(pathname)?;
        self.objects.get(id.0)
    }

    /// Find the object that owns the given region, if any.
    pub fn object_of(&self, region: RegionId) -> Option<&OwningObject> {
        let id = self.region(region)?.object?;
        self.objects.get(id.0)
    }
}

/// Builder for a [MemoryMap].
#[derive(Debug, Default)]
pub struct MemoryMapBuilder {
    regions: Vec<(AddressRange, Access, Option<String>)>,
}

impl MemoryMapBuilder {
    /// Add a region.
    pub fn region(
        mut self,
        range: AddressRange,
        access: Access,
        pathname: Option<&str>,
    ) -> Self {
        self.push(range, access, pathname);
        self
    }

    /// Add a region in-place.
    pub fn push(&mut self, range: AddressRange, access: Access, pathname: Option<&str>) {
        let pathname = pathname.filter(|p| !p.is_empty()).map(String::from);
        self.regions.push((range, access, pathname));
    }

    /// Build the memory map.
    ///
    /// Regions are sorted by address and must not overlap.
    pub fn build(mut self) -> Result<MemoryMap, Error> {
        self.regions.sort_by_key(|(range, _, _)| range.start);

        let mut regions = Vec::with_capacity(self.regions.len());
        let mut objects = Vec::<OwningObject>::new();
        let mut by_pathname = HashMap::new();
        let mut last_end = None;

        for (index, (range, access, pathname)) in self.regions.into_iter().enumerate() {
            if let Some(last_end) = last_end {
                if range.start < last_end {
                    return Err(Error::invalid_option(
                        "memory map",
                        format!("region {} overlaps previous region", range),
                    ));
                }
            }

            last_end = Some(range.end);
            let id = RegionId(index);

            let object = match pathname {
                Some(pathname) => {
                    let object = *by_pathname.entry(pathname.clone()).or_insert_with(|| {
                        let object = ObjectId(objects.len());

                        objects.push(OwningObject {
                            id: object,
                            pathname,
                            regions: Vec::new(),
                            base: range.start,
                        });

                        object
                    });

                    objects[object.0].regions.push(id);
                    Some(object)
                }
                None => None,
            };

            regions.push(MemoryRegion {
                id,
                range,
                access,
                object,
            });
        }

        Ok(MemoryMap {
            regions,
            objects,
            by_pathname,
        })
    }
}

/// A session capable of reading memory from a process.
pub trait MemoryReader {
    /// Read memory at `address` into `buf`.
    ///
    /// Returns the number of bytes read, which might be less than the length
    /// of the buffer if the end of readable memory was reached.
    fn read_memory(&self, address: Address, buf: &mut [u8]) -> anyhow::Result<usize>;
}

impl<T> MemoryReader for &T
where
    T: ?Sized + MemoryReader,
{
    fn read_memory(&self, address: Address, buf: &mut [u8]) -> anyhow::Result<usize> {
        (**self).read_memory(address, buf)
    }
}

impl<T> MemoryReader for Arc<T>
where
    T: ?Sized + MemoryReader,
{
    fn read_memory(&self, address: Address, buf: &mut [u8]) -> anyhow::Result<usize> {
        (**self).read_memory(address, buf)
    }
}

/// Fill the whole buffer or fail.
pub(crate) fn read_exact<R>(reader: &R, address: Address, buf: &mut [u8]) -> Result<(), Error>
where
    R: ?Sized + MemoryReader,
{
    let len = buf.len();

    let read = reader
        .read_memory(address, buf)
        .map_err(|source| Error::Read {
            address,
            len,
            source,
        })?;

    if read != len {
        return Err(Error::ShortRead { address, read, len });
    }

    Ok(())
}

/// Read a single pointer of the given width.
pub(crate) fn read_pointer<R>(
    reader: &R,
    width: PointerWidth,
    address: Address,
) -> Result<Address, Error>
where
    R: ?Sized + MemoryReader,
{
    let mut buf = [0u8; 8];
    let buf = &mut buf[..width.size()];
    read_exact(reader, address, buf)?;
    Ok(width.decode(buf))
}

/// Memory captured into local buffers.
///
/// Reads past the end of a captured chunk are short, reads of memory that
/// was never captured fail.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    chunks: Vec<(Address, Vec<u8>)>,
}

impl Snapshot {
    /// Construct an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a captured chunk of memory starting at `address`.
    pub fn insert(&mut self, address: Address, data: Vec<u8>) {
        let index = match self.chunks.binary_search_by_key(&address, |(a, _)| *a) {
            Ok(index) => {
                self.chunks[index].1 = data;
                return;
            }
            Err(index) => index,
        };

        self.chunks.insert(index, (address, data));
    }

    /// Access the chunk containing the given address mutably.
    pub fn bytes_mut(&mut self, address: Address) -> Option<&mut [u8]> {
        let (start, data) = self.find_mut(address)?;
        let offset = address.offset_from(start)? as usize;
        Some(&mut data[offset..])
    }

    fn find(&self, address: Address) -> Option<(Address, &[u8])> {
        let index = match self.chunks.binary_search_by_key(&address, |(a, _)| *a) {
            Ok(index) => index,
            Err(0) => return None,
            Err(index) => index - 1,
        };

        let (start, data) = &self.chunks[index];
        let offset = address.offset_from(*start)?;

        if offset >= data.len() as u64 {
            return None;
        }

        Some((*start, &data[..]))
    }

    fn find_mut(&mut self, address: Address) -> Option<(Address, &mut Vec<u8>)> {
        let (start, _) = self.find(address)?;
        let index = self
            .chunks
            .binary_search_by_key(&start, |(a, _)| *a)
            .ok()?;
        let (start, data) = &mut self.chunks[index];
        Some((*start, data))
    }
}

impl MemoryReader for Snapshot {
    fn read_memory(&self, address: Address, buf: &mut [u8]) -> anyhow::Result<usize> {
        let (start, data) = self
            .find(address)
            .ok_or_else(|| anyhow!("address {} is not captured", address))?;

        let offset = (address.0 - start.0) as usize;
        let source = &data[offset..];
        let len = usize::min(buf.len(), source.len());
        buf[..len].copy_from_slice(&source[..len]);
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::{read_pointer, Access, MemoryMap, MemoryReader, PointerWidth, Snapshot};
    use crate::{Address, AddressRange};

    fn range(start: u64, end: u64) -> AddressRange {
        AddressRange::new(Address::new(start), Address::new(end)).unwrap()
    }

    #[test]
    fn test_build_groups_objects() {
        let map = MemoryMap::builder()
            .region(range(0x3000, 0x4000), Access::READ, Some("/bin/game"))
            .region(range(0x1000, 0x2000), Access::READ | Access::EXEC, Some("/bin/game"))
            .region(range(0x2000, 0x3000), Access::READ, None)
            .region(range(0x5000, 0x6000), Access::READ, Some("/lib/libc.so"))
            .build()
            .unwrap();

        assert_eq!(4, map.regions().len());
        assert_eq!(2, map.objects().len());

        let game = map.find_object("/bin/game").unwrap();
        assert_eq!(Address::new(0x1000), game.base);
        assert_eq!(2, game.regions.len());
        assert!(map.regions()[1].object.is_none());

        let region = map.find_region(Address::new(0x5010)).unwrap();
        assert_eq!("/lib/libc.so", map.object_of(region.id).unwrap().pathname);
        assert!(map.find_region(Address::new(0x4800)).is_none());
    }

    #[test]
    fn test_build_rejects_overlap() {
        let result = MemoryMap::builder()
            .region(range(0x1000, 0x3000), Access::READ, None)
            .region(range(0x2000, 0x4000), Access::READ, None)
            .build();

        assert!(result.is_err());
    }

    #[test]
    fn test_access() {
        let access = Access::READ | Access::WRITE;
        assert!(access.contains(Access::READ));
        assert!(!access.contains(Access::READ | Access::EXEC));
        assert!(access.contains(Access::NONE));
        assert_eq!("rw-p", access.to_string());
    }

    #[test]
    fn test_snapshot_reads() {
        let mut snapshot = Snapshot::new();
        snapshot.insert(Address::new(0x1000), vec![1, 2, 3, 4]);

        let mut buf = [0u8; 8];
        assert_eq!(2, snapshot.read_memory(Address::new(0x1002), &mut buf).unwrap());
        assert_eq!(&[3, 4], &buf[..2]);
        assert!(snapshot.read_memory(Address::new(0x1004), &mut buf).is_err());
        assert!(snapshot.read_memory(Address::new(0x0fff), &mut buf).is_err());
    }

    #[test]
    fn test_read_pointer() {
        let width = PointerWidth::Eight;
        let mut data = vec![0u8; 16];
        width.encode(&mut data[8..], Address::new(0xdead_beef_0000));

        let mut snapshot = Snapshot::new();
        snapshot.insert(Address::new(0x1000), data);

        let value = read_pointer(&snapshot, width, Address::new(0x1008)).unwrap();
        assert_eq!(Address::new(0xdead_beef_0000), value);
        assert!(read_pointer(&snapshot, width, Address::new(0x100c)).is_err());
    }
}
