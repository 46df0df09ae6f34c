use crate::{Address, RegionId};
use std::{collections::TryReserveError, io};
use thiserror::Error;

/// Broad classification of an [Error].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or malformed configuration. Never retried automatically.
    Configuration,
    /// A lock was held or a synchronization primitive failed. May be retried.
    Concurrency,
    /// Reading the target process or a file failed.
    Io,
    /// Well-formed request, but the data could not satisfy it.
    Data,
    /// Allocation failure.
    Resource,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("missing required option `{0}`")]
    MissingOption(&'static str),
    #[error("invalid option `{name}`: {reason}")]
    InvalidOption { name: &'static str, reason: String },
    #[error("at least one read session is required")]
    NoSessions,
    #[error("region {0} is not part of the memory map")]
    UnknownRegion(RegionId),
    #[error("invalid tree node: {0}")]
    InvalidNode(String),
    #[error("{0} is in use")]
    InUse(&'static str),
    #[error("worker pool has not been set up")]
    PoolNotSetUp,
    #[error("failed to spawn worker thread")]
    Spawn(#[source] io::Error),
    #[error("worker {0} terminated unexpectedly")]
    WorkerLost(usize),
    #[error("scan was cancelled")]
    Cancelled,
    #[error("BUG: scan callback attempted to advance by 0 bytes")]
    ZeroAdvance,
    #[error("failed to read {len} bytes at {address}")]
    Read {
        address: Address,
        len: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error("short read at {address}: got {read} of {len} bytes")]
    ShortRead {
        address: Address,
        read: usize,
        len: usize,
    },
    #[error("file error")]
    File(#[from] io::Error),
    #[error("no memory regions satisfy the current constraints")]
    EmptyAreaSet,
    #[error("target address {0} is not mapped")]
    TargetNotMapped(Address),
    #[error("bad magic in file header: {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("unsupported file format version: {0}")]
    UnsupportedVersion(u8),
    #[error("unsupported scan kind: {0}")]
    UnsupportedScanKind(u8),
    #[error("corrupt scan file: {0}")]
    Corrupt(&'static str),
    #[error("chain {0} was loaded without resolving its object and cannot be verified")]
    UnresolvedChain(usize),
    #[error("chain {0} has no offsets")]
    EmptyChain(usize),
    #[error("offset {0:#x} does not fit in 32 bits")]
    OffsetOverflow(u64),
    #[error("address add operation `{0} + {1:#x}` overflowed")]
    AddressAdd(Address, u64),
    #[error("failed to allocate memory")]
    Allocation(#[from] TryReserveError),
}

impl Error {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingOption(..)
            | Self::InvalidOption { .. }
            | Self::NoSessions
            | Self::UnknownRegion(..)
            | Self::InvalidNode(..) => ErrorKind::Configuration,
            Self::InUse(..)
            | Self::PoolNotSetUp
            | Self::Spawn(..)
            | Self::WorkerLost(..)
            | Self::Cancelled
            | Self::ZeroAdvance => ErrorKind::Concurrency,
            Self::Read { .. } | Self::ShortRead { .. } | Self::File(..) => ErrorKind::Io,
            Self::EmptyAreaSet
            | Self::TargetNotMapped(..)
            | Self::BadMagic(..)
            | Self::UnsupportedVersion(..)
            | Self::UnsupportedScanKind(..)
            | Self::Corrupt(..)
            | Self::UnresolvedChain(..)
            | Self::EmptyChain(..)
            | Self::OffsetOverflow(..)
            | Self::AddressAdd(..) => ErrorKind::Data,
            Self::Allocation(..) => ErrorKind::Resource,
        }
    }

    /// Construct an invalid option error.
    pub(crate) fn invalid_option(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            name,
            reason: reason.into(),
        }
    }
}
