//! A multi-threaded pointer scanner.
//!
//! Given the memory map of a process and a target address, [PointerScan]
//! finds chains of pointers leading from static objects (executables and
//! shared libraries) to the target. Such chains keep working after the
//! process restarts, even when the target itself is allocated elsewhere.
//!
//! The moving parts are:
//! * [AreaSet], the regions of the process selected for scanning.
//! * [WorkLister], which spreads the regions evenly across workers.
//! * [WorkerPool], long-lived threads scanning memory one pass at a time.
//! * [PointerTree], the candidate nodes found at every depth.
//! * [serializer], to store chains on disk and load them back.

mod address;
mod address_range;
mod area_set;
mod bitset;
mod chain;
mod error;
mod memory;
mod options;
mod pointer_scan;
mod procfs;
pub mod serializer;
mod token;
mod tree;
mod work_lister;
mod worker_pool;

#[cfg(test)]
mod testing;

pub use self::address::Address;
pub use self::address_range::AddressRange;
pub use self::area_set::AreaSet;
pub use self::chain::{ChainData, PtrChain};
pub use self::error::{Error, ErrorKind};
pub use self::memory::{
    Access, MemoryMap, MemoryMapBuilder, MemoryReader, MemoryRegion, ObjectId, OwningObject,
    PointerWidth, RegionId, Snapshot,
};
pub use self::options::{Guarded, Options, PointerScanOptions, PAGE_SIZE};
pub use self::pointer_scan::{PointerScan, ScanState};
#[cfg(unix)]
pub use self::procfs::ProcMemory;
pub use self::token::Token;
pub use self::tree::{Candidate, LevelBuilder, Node, NodeRef, PointerTree};
pub use self::work_lister::WorkLister;
pub use self::worker_pool::{PassStats, ScanCallback, ScanContext, SetupFlags, WorkerPool};
