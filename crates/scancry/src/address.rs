//! Abstraction to help deal with virtual addresses.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::{fmt, str};

#[derive(Clone, Default, Copy, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address(pub(crate) u64);

impl Address {
    /// Construct a new address.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Construct a null pointer.
    pub const fn null() -> Self {
        Self(0)
    }

    /// If the address is null.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Convert into the inner type.
    pub fn into_inner(self) -> u64 {
        self.0
    }

    /// Try to add an offset to the address.
    pub fn checked_add(self, offset: u64) -> Option<Self> {
        Some(Address(self.0.checked_add(offset)?))
    }

    /// Try to subtract an offset from the address.
    pub fn checked_sub(self, offset: u64) -> Option<Self> {
        Some(Address(self.0.checked_sub(offset)?))
    }

    /// Add the given offset in a saturating manner.
    pub fn saturating_add(self, offset: u64) -> Address {
        Address(self.0.saturating_add(offset))
    }

    /// Subtract the given offset in a saturating manner.
    pub fn saturating_sub(self, offset: u64) -> Address {
        Address(self.0.saturating_sub(offset))
    }

    /// Performed a checked add with an address and an offset.
    pub fn add(self, offset: u64) -> Result<Address, Error> {
        self.checked_add(offset)
            .ok_or_else(|| Error::AddressAdd(self, offset))
    }

    /// Find how far this address lies above `base`.
    ///
    /// Returns `None` if the address is below `base`.
    pub fn offset_from(self, base: Address) -> Option<u64> {
        self.0.checked_sub(base.0)
    }
}

impl From<u64> for Address {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl str::FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = if s.starts_with("0x") || s.starts_with("0X") {
            &s[2..]
        } else {
            s
        };

        Ok(Address(u64::from_str_radix(s, 16).map_err(|e| {
            Error::invalid_option("address", e.to_string())
        })?))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "0x{:X}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, fmt)
    }
}
