//! Flattened pointer chains.

use crate::ObjectId;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A path from a static object to the target.
///
/// Walking a chain starts at the base of the object plus the first offset.
/// Every following offset is applied after dereferencing the current
/// address, and the last step lands on the target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PtrChain {
    /// Index into the pathname table of the owning [ChainData].
    pub pathname: usize,
    /// The object the chain starts at, if it is known in the current map.
    pub object: Option<ObjectId>,
    pub offsets: Vec<u64>,
}

/// A set of chains with a shared, deduplicated pathname table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainData {
    pathnames: Vec<String>,
    by_pathname: HashMap<String, usize>,
    chains: Vec<PtrChain>,
}

impl ChainData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a pathname, returning its index.
    pub fn intern(&mut self, pathname: &str) -> usize {
        if let Some(index) = self.by_pathname.get(pathname) {
            return *index;
        }

        let index = self.pathnames.len();
        self.pathnames.push(pathname.to_owned());
        self.by_pathname.insert(pathname.to_owned(), index);
        index
    }

    /// Add a chain starting at the object with the given pathname.
    pub fn push(&mut self, pathname: &str, object: Option<ObjectId>, offsets: Vec<u64>) {
        let pathname = self.intern(pathname);

        self.chains.push(PtrChain {
            pathname,
            object,
            offsets,
        });
    }

    pub fn pathnames(&self) -> &[String] {
        &self.pathnames
    }

    pub fn chains(&self) -> &[PtrChain] {
        &self.chains
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    /// The pathname of the object a chain starts at.
    pub fn pathname(&self, chain: &PtrChain) -> Option<&str> {
        self.pathnames.get(chain.pathname).map(String::as_str)
    }

    /// Keep only the chains matching the predicate, preserving order.
    pub fn retain<F>(&mut self, f: F)
    where
        F: FnMut(&PtrChain) -> bool,
    {
        self.chains.retain(f);
    }

    /// Display a chain as `"pathname" + 0xB0 -> 0x0`.
    pub fn display<'a>(&'a self, chain: &'a PtrChain) -> impl fmt::Display + 'a {
        Display { data: self, chain }
    }
}

struct Display<'a> {
    data: &'a ChainData,
    chain: &'a PtrChain,
}

impl fmt::Display for Display<'_> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.data.pathname(self.chain) {
            Some(pathname) => write!(fmt, "{:?}", pathname)?,
            None => write!(fmt, "?")?,
        }

        let mut it = self.chain.offsets.iter();

        if let Some(first) = it.next() {
            write!(fmt, " + {:#X}", first)?;
        }

        for offset in it {
            write!(fmt, " -> {:#X}", offset)?;
        }

        Ok(())
    }
}
