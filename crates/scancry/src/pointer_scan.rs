//! Multi-level pointer scan.
//!
//! Starting at the target address, every pass scans all selected memory for
//! values pointing at or shortly before a node found by the previous pass.
//! Nodes that turn out to live in memory owned by an object are turned into
//! chains that can be followed from the object base back to the target.

use crate::{
    chain::ChainData,
    error::Error,
    memory::read_pointer,
    options::PointerScanParams,
    tree::{Candidate, LevelBuilder, PointerTree},
    worker_pool::{ScanCallback, ScanContext, SetupFlags},
    Address, AreaSet, Guarded, MemoryMap, MemoryReader, Options, PointerScanOptions,
    PointerWidth, WorkerPool,
};
use log::{debug, info, warn};
use rayon::prelude::*;
use smallvec::SmallVec;
use std::sync::Arc;

/// Where a [PointerScan] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    /// The pass for the given depth is running.
    ///
    /// Only visible while [PointerScan::scan] holds the scan. A completed
    /// scan ends up [Flattened][ScanState::Flattened], a failed one
    /// [Idle][ScanState::Idle].
    Scanning(usize),
    /// Chains are available.
    Flattened,
    /// Chains have been verified against live memory.
    Verified,
}

impl Default for ScanState {
    fn default() -> Self {
        ScanState::Idle
    }
}

/// Drives a pointer scan and owns its results.
#[derive(Debug)]
pub struct PointerScan {
    tree: PointerTree,
    chains: ChainData,
    state: ScanState,
}

impl Default for PointerScan {
    fn default() -> Self {
        Self::new()
    }
}

impl PointerScan {
    pub fn new() -> Self {
        Self {
            tree: PointerTree::new(0),
            chains: ChainData::new(),
            state: ScanState::Idle,
        }
    }

    /// Scan for pointer chains leading to the configured target.
    ///
    /// Every configuration object is locked for the duration of the scan.
    /// Previous results are discarded, and on error the scan is left idle.
    pub fn scan<R>(
        &mut self,
        options: &Guarded<Options>,
        ptrscan: &Guarded<PointerScanOptions>,
        areas: &Guarded<AreaSet>,
        pool: &mut WorkerPool<R>,
    ) -> Result<(), Error>
    where
        R: 'static + Send + MemoryReader,
    {
        let options = options.lock_for_scan()?;
        let ptrscan = ptrscan.lock_for_scan()?;
        let areas = areas.lock_for_scan()?;

        let params = ptrscan.params()?;
        let map = options.map()?.clone();

        self.reset();

        let result = self.run(&options, &areas, &params, &map, pool);

        if let Err(e) = &result {
            warn!("pointer scan failed: {}", e);
            self.reset();
        }

        result
    }

    fn run<R>(
        &mut self,
        options: &Options,
        areas: &AreaSet,
        params: &PointerScanParams,
        map: &MemoryMap,
        pool: &mut WorkerPool<R>,
    ) -> Result<(), Error>
    where
        R: 'static + Send + MemoryReader,
    {
        let root = map
            .find_region(params.target)
            .ok_or(Error::TargetNotMapped(params.target))?;

        self.tree = PointerTree::new(params.max_depth);
        self.tree
            .add_node(None, root.id, params.target, Address::null(), 0)?;

        for depth in 1..params.max_depth {
            self.state = ScanState::Scanning(depth);

            let level = Arc::new(self.tree.level_builder(depth)?);

            if level.previous().is_empty() {
                debug!("depth {}: no nodes left to extend", depth);
                break;
            }

            let matcher = Arc::new(LevelMatcher {
                level: level.clone(),
                width: options.pointer_width(),
                alignment: params.alignment,
                max_obj_size: params.max_obj_size,
                preset: params.preset_offset(depth),
                smart_scan: params.smart_scan,
            });

            pool.setup(
                options,
                areas,
                matcher,
                params.alignment,
                SetupFlags::default(),
            )?;

            let stats = pool.run_one_pass()?;
            let added = self.tree.commit(&level)?;

            info!(
                "depth {}: {} nodes from {} addresses",
                depth, added, stats.addresses
            );
        }

        self.chains = flatten(&self.tree, map)?;
        self.state = ScanState::Flattened;

        info!("found {} chains", self.chains.len());
        Ok(())
    }

    /// Walk every chain through `reader`, keeping only chains that still
    /// resolve to the configured target.
    ///
    /// Chains which fail to read are discarded. A chain loaded without its
    /// object being resolved is an error.
    pub fn verify<R>(
        &mut self,
        reader: &R,
        options: &Guarded<Options>,
        ptrscan: &Guarded<PointerScanOptions>,
    ) -> Result<(), Error>
    where
        R: Sync + MemoryReader,
    {
        let options = options.lock_for_scan()?;
        let ptrscan = ptrscan.lock_for_scan()?;

        let target = ptrscan.target().ok_or(Error::MissingOption("target"))?;
        let map = options.map()?;
        let width = options.pointer_width();

        let mut bases = Vec::with_capacity(self.chains.len());

        for (n, chain) in self.chains.chains().iter().enumerate() {
            let object = chain
                .object
                .and_then(|id| map.object(id))
                .ok_or(Error::UnresolvedChain(n))?;

            bases.push(object.base);
        }

        let keep = self
            .chains
            .chains()
            .par_iter()
            .zip(bases.par_iter())
            .map(|(chain, base)| match walk(reader, width, *base, &chain.offsets) {
                Ok(address) => address == target,
                Err(e) => {
                    debug!("dropping chain: {}", e);
                    false
                }
            })
            .collect::<Vec<_>>();

        let before = self.chains.len();
        let mut keep = keep.into_iter();
        self.chains.retain(|_| keep.next().unwrap_or_default());

        info!("verified {} of {} chains", self.chains.len(), before);
        self.state = ScanState::Verified;
        Ok(())
    }

    /// Discard the tree and every chain.
    pub fn reset(&mut self) {
        self.tree.reset();
        self.chains = ChainData::new();
        self.state = ScanState::Idle;
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn tree(&self) -> &PointerTree {
        &self.tree
    }

    pub fn chains(&self) -> &ChainData {
        &self.chains
    }

    /// Replace the current chains, like after loading them from a file.
    pub fn set_chains(&mut self, chains: ChainData) {
        self.tree.reset();
        self.chains = chains;
        self.state = ScanState::Flattened;
    }
}

/// Scan callback matching pointer values against the previous level.
struct LevelMatcher {
    level: Arc<LevelBuilder>,
    width: PointerWidth,
    alignment: usize,
    max_obj_size: u64,
    preset: Option<u64>,
    smart_scan: bool,
}

impl ScanCallback for LevelMatcher {
    fn scan(&self, context: &ScanContext<'_>) -> Result<usize, Error> {
        if context.bytes.len() < self.width.size() {
            return Ok(self.alignment);
        }

        let value = self.width.decode(context.bytes);
        let mut batch = SmallVec::<[Candidate; 4]>::new();
        let mut nearest = None;

        // nearest first, since own_addr >= value.
        for (own_addr, parent) in self.level.candidates_for(value, self.max_obj_size) {
            let distance = own_addr.0 - value.0;

            if let Some(preset) = self.preset {
                if distance != preset {
                    continue;
                }
            }

            if self.smart_scan {
                match nearest {
                    Some(nearest) if distance > nearest => break,
                    _ => nearest = Some(distance),
                }
            }

            batch.push(Candidate {
                parent: *parent,
                region: context.region,
                own_addr: context.address,
                ptr_addr: value,
            });
        }

        self.level.flush(&mut batch);
        Ok(self.alignment)
    }
}

/// Follow a chain from `base`, returning the address it lands on.
fn walk<R>(reader: &R, width: PointerWidth, base: Address, offsets: &[u64]) -> Result<Address, Error>
where
    R: MemoryReader,
{
    let (first, rest) = match offsets.split_first() {
        Some(split) => split,
        None => return Err(Error::Corrupt("chain without offsets")),
    };

    let mut address = base.add(*first)?;

    for offset in rest {
        address = read_pointer(reader, width, address)?.add(*offset)?;
    }

    Ok(address)
}

/// Turn every leaf with an owning object into a chain.
fn flatten(tree: &PointerTree, map: &MemoryMap) -> Result<ChainData, Error> {
    let mut data = ChainData::new();

    for depth in 1..tree.max_depth() {
        for node in tree.depth_level(depth) {
            if !node.children.is_empty() {
                continue;
            }

            let object = match map.object_of(node.region) {
                Some(object) => object,
                None => continue,
            };

            let mut offsets = Vec::with_capacity(depth + 1);

            offsets.push(node.own_addr.offset_from(object.base).ok_or_else(|| {
                Error::InvalidNode(format!("{} is below {}", node.own_addr, object.pathname))
            })?);

            let mut current = node;

            while let Some(parent) = current.parent {
                let parent = tree
                    .node(parent)
                    .ok_or_else(|| Error::InvalidNode(format!("missing parent {}", parent)))?;

                offsets.push(parent.own_addr.offset_from(current.ptr_addr).ok_or_else(|| {
                    Error::InvalidNode(format!(
                        "{} points past {}",
                        current.own_addr, parent.own_addr
                    ))
                })?);

                current = parent;
            }

            data.push(&object.pathname, Some(object.id), offsets);
        }
    }

    Ok(data)
}
