//! Scan configuration.

use crate::{error::Error, Access, Address, AddressRange, MemoryMap, ObjectId, PointerWidth, RegionId};
use hashbrown::HashSet;
use parking_lot::{RwLock, RwLockReadGuard};
use std::{path::PathBuf, sync::Arc};

/// Size of a native page, used as the default read buffer size.
pub const PAGE_SIZE: usize = 0x1000;

/// Constraints and collaborators shared by every scan kind.
#[derive(Debug, Clone)]
pub struct Options {
    pub(crate) omit_regions: Option<HashSet<RegionId>>,
    pub(crate) omit_objects: Option<HashSet<ObjectId>>,
    pub(crate) exclusive_regions: Option<HashSet<RegionId>>,
    pub(crate) exclusive_objects: Option<HashSet<ObjectId>>,
    pub(crate) omit_ranges: Option<Vec<AddressRange>>,
    pub(crate) exclusive_ranges: Option<Vec<AddressRange>>,
    pub(crate) access: Access,
    pub(crate) map: Option<Arc<MemoryMap>>,
    pub(crate) pointer_width: PointerWidth,
    pub(crate) buffer_size: usize,
    pub(crate) output_path: Option<PathBuf>,
    pub(crate) input_path: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            omit_regions: None,
            omit_objects: None,
            exclusive_regions: None,
            exclusive_objects: None,
            omit_ranges: None,
            exclusive_ranges: None,
            access: Access::NONE,
            map: None,
            pointer_width: PointerWidth::native(),
            buffer_size: PAGE_SIZE,
            output_path: None,
            input_path: None,
        }
    }
}

impl Options {
    /// Construct default, unconstrained options.
    pub fn new() -> Self {
        Self::default()
    }

    /// The memory map of the target process.
    pub fn map(&self) -> Result<&Arc<MemoryMap>, Error> {
        self.map.as_ref().ok_or(Error::MissingOption("map"))
    }

    /// Set the memory map of the target process.
    pub fn set_map(&mut self, map: impl Into<Arc<MemoryMap>>) {
        self.map = Some(map.into());
    }

    /// Require every bit in `access` for scanned regions. `Access::NONE`
    /// removes the constraint.
    pub fn set_access(&mut self, access: Access) {
        self.access = access;
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn set_pointer_width(&mut self, width: PointerWidth) {
        self.pointer_width = width;
    }

    pub fn pointer_width(&self) -> PointerWidth {
        self.pointer_width
    }

    /// Set the size of the per-worker read buffer.
    pub fn set_buffer_size(&mut self, size: usize) -> Result<(), Error> {
        if size < 2 * self.pointer_width.size() {
            return Err(Error::invalid_option(
                "buffer_size",
                format!("{} bytes cannot hold two pointers", size),
            ));
        }

        self.buffer_size = size;
        Ok(())
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn set_omit_regions(&mut self, regions: Option<HashSet<RegionId>>) {
        self.omit_regions = regions;
    }

    pub fn set_omit_objects(&mut self, objects: Option<HashSet<ObjectId>>) {
        self.omit_objects = objects;
    }

    pub fn set_exclusive_regions(&mut self, regions: Option<HashSet<RegionId>>) {
        self.exclusive_regions = regions;
    }

    pub fn set_exclusive_objects(&mut self, objects: Option<HashSet<ObjectId>>) {
        self.exclusive_objects = objects;
    }

    /// Omit regions that lie fully inside any of the given ranges.
    pub fn set_omit_ranges(&mut self, ranges: Option<Vec<AddressRange>>) -> Result<(), Error> {
        self.omit_ranges = ranges.map(|r| normalize_ranges("omit_ranges", r)).transpose()?;
        Ok(())
    }

    /// Only scan regions that lie fully inside any of the given ranges.
    pub fn set_exclusive_ranges(
        &mut self,
        ranges: Option<Vec<AddressRange>>,
    ) -> Result<(), Error> {
        self.exclusive_ranges = ranges
            .map(|r| normalize_ranges("exclusive_ranges", r))
            .transpose()?;
        Ok(())
    }

    pub fn set_output_path(&mut self, path: Option<PathBuf>) {
        self.output_path = path;
    }

    pub fn output_path(&self) -> Result<&PathBuf, Error> {
        self.output_path
            .as_ref()
            .ok_or(Error::MissingOption("output_path"))
    }

    pub fn set_input_path(&mut self, path: Option<PathBuf>) {
        self.input_path = path;
    }

    pub fn input_path(&self) -> Result<&PathBuf, Error> {
        self.input_path
            .as_ref()
            .ok_or(Error::MissingOption("input_path"))
    }
}

/// Sort ranges and reject malformed or overlapping ones.
fn normalize_ranges(
    name: &'static str,
    mut ranges: Vec<AddressRange>,
) -> Result<Vec<AddressRange>, Error> {
    ranges.sort();

    for range in &ranges {
        if range.start >= range.end {
            return Err(Error::invalid_option(name, format!("empty range {}", range)));
        }
    }

    for w in ranges.windows(2) {
        if w[1].start < w[0].end {
            return Err(Error::invalid_option(
                name,
                format!("{} overlaps {}", w[0], w[1]),
            ));
        }
    }

    Ok(ranges)
}

/// Parameters specific to a pointer scan.
#[derive(Debug, Clone, Default)]
pub struct PointerScanOptions {
    pub(crate) target: Option<Address>,
    pub(crate) alignment: Option<usize>,
    pub(crate) max_obj_size: Option<u64>,
    pub(crate) max_depth: Option<usize>,
    pub(crate) smart_scan: bool,
    pub(crate) preset_offsets: Vec<Option<u64>>,
    pub(crate) static_areas: Option<HashSet<RegionId>>,
}

/// Validated, required pointer scan parameters.
#[derive(Debug, Clone)]
pub(crate) struct PointerScanParams {
    pub(crate) target: Address,
    pub(crate) alignment: usize,
    pub(crate) max_obj_size: u64,
    pub(crate) max_depth: usize,
    pub(crate) smart_scan: bool,
    pub(crate) preset_offsets: Vec<Option<u64>>,
}

impl PointerScanOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// The address the pointer chains should resolve to.
    pub fn set_target(&mut self, target: Address) {
        self.target = Some(target);
    }

    pub fn target(&self) -> Option<Address> {
        self.target
    }

    /// Only consider candidate pointers stored at addresses with this alignment.
    pub fn set_alignment(&mut self, alignment: usize) -> Result<(), Error> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(Error::invalid_option(
                "alignment",
                format!("{} is not a power of two", alignment),
            ));
        }

        self.alignment = Some(alignment);
        Ok(())
    }

    /// The largest distance between a pointer and the next node in a chain.
    pub fn set_max_obj_size(&mut self, size: u64) -> Result<(), Error> {
        if size == 0 {
            return Err(Error::invalid_option("max_obj_size", "must not be zero"));
        }

        if let Some(offset) = self.preset_offsets.iter().flatten().find(|o| **o > size) {
            return Err(Error::invalid_option(
                "max_obj_size",
                format!("smaller than preset offset {:#x}", offset),
            ));
        }

        self.max_obj_size = Some(size);
        Ok(())
    }

    /// The number of levels in the pointer tree, including the target itself.
    pub fn set_max_depth(&mut self, depth: usize) -> Result<(), Error> {
        if depth < 2 {
            return Err(Error::invalid_option(
                "max_depth",
                format!("{} leaves no room for a pointer", depth),
            ));
        }

        self.max_depth = Some(depth);
        Ok(())
    }

    /// Only keep the nearest match for every candidate pointer.
    pub fn set_smart_scan(&mut self, smart_scan: bool) {
        self.smart_scan = smart_scan;
    }

    /// Require an exact offset at the given depth.
    pub fn set_preset_offset(&mut self, depth: usize, offset: Option<u64>) -> Result<(), Error> {
        if depth == 0 {
            return Err(Error::invalid_option(
                "preset_offsets",
                "depth 0 is the target itself",
            ));
        }

        if let (Some(offset), Some(max)) = (offset, self.max_obj_size) {
            if offset > max {
                return Err(Error::invalid_option(
                    "preset_offsets",
                    format!("{:#x} exceeds max_obj_size {:#x}", offset, max),
                ));
            }
        }

        if self.preset_offsets.len() <= depth {
            self.preset_offsets.resize(depth + 1, None);
        }

        self.preset_offsets[depth] = offset;
        Ok(())
    }

    /// Regions considered static roots. Recorded, but not used to filter.
    pub fn set_static_areas(&mut self, areas: Option<HashSet<RegionId>>) {
        self.static_areas = areas;
    }

    pub fn static_areas(&self) -> Option<&HashSet<RegionId>> {
        self.static_areas.as_ref()
    }

    /// Validate that every required parameter is present.
    pub(crate) fn params(&self) -> Result<PointerScanParams, Error> {
        Ok(PointerScanParams {
            target: self.target.ok_or(Error::MissingOption("target"))?,
            alignment: self.alignment.ok_or(Error::MissingOption("alignment"))?,
            max_obj_size: self
                .max_obj_size
                .ok_or(Error::MissingOption("max_obj_size"))?,
            max_depth: self.max_depth.ok_or(Error::MissingOption("max_depth"))?,
            smart_scan: self.smart_scan,
            preset_offsets: self.preset_offsets.clone(),
        })
    }
}

impl PointerScanParams {
    /// The preset offset required at the given depth.
    pub(crate) fn preset_offset(&self, depth: usize) -> Option<u64> {
        self.preset_offsets.get(depth).copied().flatten()
    }
}

/// A configuration object which can be locked for the duration of a scan.
///
/// Locking never blocks. A scan that finds the object being modified, or a
/// modification that finds the object locked by a scan, fails with
/// [Error::InUse].
#[derive(Debug, Default)]
pub struct Guarded<T> {
    name: &'static str,
    inner: RwLock<T>,
}

impl<T> Guarded<T> {
    /// Wrap a value, using `name` to identify it in errors.
    pub fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            inner: RwLock::new(value),
        }
    }

    /// Lock for reading during a scan.
    pub fn lock_for_scan(&self) -> Result<RwLockReadGuard<'_, T>, Error> {
        self.inner.try_read().ok_or(Error::InUse(self.name))
    }

    /// Modify the value unless it is currently locked.
    pub fn try_update<F, O>(&self, f: F) -> Result<O, Error>
    where
        F: FnOnce(&mut T) -> Result<O, Error>,
    {
        let mut guard = self.inner.try_write().ok_or(Error::InUse(self.name))?;
        f(&mut *guard)
    }

    /// Consume the guard, returning the inner value.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::{Guarded, Options, PointerScanOptions};
    use crate::{error::Error, Address, AddressRange};

    fn range(start: u64, end: u64) -> AddressRange {
        AddressRange {
            start: Address::new(start),
            end: Address::new(end),
        }
    }

    #[test]
    fn test_missing_required_options() {
        let mut opts = PointerScanOptions::new();
        assert!(matches!(opts.params(), Err(Error::MissingOption("target"))));

        opts.set_target(Address::new(0x1000));
        opts.set_alignment(4).unwrap();
        opts.set_max_obj_size(0x20).unwrap();
        assert!(matches!(opts.params(), Err(Error::MissingOption("max_depth"))));

        opts.set_max_depth(2).unwrap();
        assert!(opts.params().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut opts = PointerScanOptions::new();
        assert!(opts.set_alignment(3).is_err());
        assert!(opts.set_max_depth(1).is_err());
        assert!(opts.set_max_obj_size(0).is_err());
        assert!(opts.set_preset_offset(0, Some(0)).is_err());

        opts.set_max_obj_size(0x20).unwrap();
        assert!(opts.set_preset_offset(1, Some(0x40)).is_err());
        opts.set_preset_offset(2, Some(0x10)).unwrap();
        assert_eq!(Some(0x10), opts.preset_offsets[2]);
        assert_eq!(None, opts.preset_offsets[1]);
        assert!(opts.set_max_obj_size(0x8).is_err());
    }

    #[test]
    fn test_malformed_ranges() {
        let mut opts = Options::new();
        assert!(opts.set_omit_ranges(Some(vec![range(0x20, 0x10)])).is_err());
        assert!(opts
            .set_exclusive_ranges(Some(vec![range(0x10, 0x30), range(0x20, 0x40)]))
            .is_err());

        opts.set_omit_ranges(Some(vec![range(0x30, 0x40), range(0x10, 0x20)]))
            .unwrap();
        assert_eq!(Some(vec![range(0x10, 0x20), range(0x30, 0x40)]), opts.omit_ranges);
    }

    #[test]
    fn test_guarded_fails_fast() {
        let guarded = Guarded::new("options", Options::new());

        {
            let _scan = guarded.lock_for_scan().unwrap();
            let result = guarded.try_update(|o| {
                o.set_pointer_width(crate::PointerWidth::Four);
                Ok(())
            });
            assert!(matches!(result, Err(Error::InUse("options"))));
        }

        guarded
            .try_update(|o| {
                o.set_pointer_width(crate::PointerWidth::Four);
                Ok(())
            })
            .unwrap();

        assert_eq!(
            crate::PointerWidth::Four,
            guarded.lock_for_scan().unwrap().pointer_width()
        );
    }
}
