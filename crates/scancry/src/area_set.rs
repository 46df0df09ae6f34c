//! Selection of the memory regions to scan.

use crate::{bitset::BitSet, error::Error, MemoryMap, MemoryRegion, Options, RegionId};
use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};

/// Objects whose regions are known to hang or fail when read.
const BLACKLIST: &[&str] = &[
    "/dev/",
    "/memfd:",
    "/run/",
    "[vvar]",
    "[vvar_vclock]",
    "[vsyscall]",
];

static GENERATION: AtomicU64 = AtomicU64::new(1);

/// The set of regions that satisfy the current constraints.
#[derive(Debug, Clone, Default)]
pub struct AreaSet {
    regions: Vec<RegionId>,
    generation: u64,
}

impl AreaSet {
    /// Construct an empty area set. Call [update][AreaSet::update] before use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute the set from the constraints and memory map in `options`.
    ///
    /// An empty result is reported as [Error::EmptyAreaSet] and leaves the
    /// previous selection in place.
    pub fn update(&mut self, options: &Options) -> Result<(), Error> {
        let regions = select(options, options.map()?)?;

        debug!("selected {} regions", regions.len());
        self.regions = regions;
        self.generation = GENERATION.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Selected regions, in map order.
    pub fn regions(&self) -> &[RegionId] {
        &self.regions
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Changes every time the selection is recomputed.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Test if an object's pathname is on the blacklist.
fn is_blacklisted(pathname: &str) -> bool {
    BLACKLIST.iter().any(|prefix| pathname.starts_with(prefix))
}

/// Apply every constraint in `options` to `map`.
pub fn select(options: &Options, map: &MemoryMap) -> Result<Vec<RegionId>, Error> {
    let regions = map.regions();
    let mut rejected_objects = BitSet::with_capacity(map.objects().len());
    let mut selected = Vec::new();

    let exclusive = options.exclusive_objects.is_some()
        || options.exclusive_regions.is_some()
        || options.exclusive_ranges.is_some();

    let mut index = 0;

    while index < regions.len() {
        let region = &regions[index];
        index += 1;

        if !options.access.is_empty() && !region.access.contains(options.access) {
            continue;
        }

        if let Some(object) = region.object {
            if rejected_objects.test(object.0) {
                continue;
            }

            let reject_object = match &options.exclusive_objects {
                Some(set) if !set.contains(&object) => true,
                _ => false,
            } || match &options.omit_objects {
                Some(set) => set.contains(&object),
                None => false,
            } || map
                .object(object)
                .map(|o| is_blacklisted(&o.pathname))
                .unwrap_or_default();

            if reject_object {
                rejected_objects.set(object.0);
                continue;
            }
        }

        if let Some(set) = &options.omit_regions {
            if set.contains(&region.id) {
                continue;
            }
        }

        if let Some(ranges) = &options.omit_ranges {
            if let Some(range) = ranges.iter().find(|r| r.covers(&region.range)) {
                // skip over every following region swallowed by the same range.
                while index < regions.len() && range.covers(&regions[index].range) {
                    index += 1;
                }

                continue;
            }
        }

        if exclusive && !matches_exclusive(options, region) {
            continue;
        }

        selected.push(region.id);
    }

    if selected.is_empty() {
        return Err(Error::EmptyAreaSet);
    }

    Ok(selected)
}

/// Test the exclusive constraints in order: object, region, range.
fn matches_exclusive(options: &Options, region: &MemoryRegion) -> bool {
    if let (Some(set), Some(object)) = (&options.exclusive_objects, region.object) {
        if set.contains(&object) {
            return true;
        }
    }

    if let Some(set) = &options.exclusive_regions {
        if set.contains(&region.id) {
            return true;
        }
    }

    if let Some(ranges) = &options.exclusive_ranges {
        if ranges.iter().any(|r| r.covers(&region.range)) {
            return true;
        }
    }

    false
}
