use crate::{error::Error, Address};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A half-open range of addresses, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AddressRange {
    pub start: Address,
    pub end: Address,
}

impl AddressRange {
    /// Construct a new range, rejecting empty and inverted ones.
    pub fn new(start: Address, end: Address) -> Result<Self, Error> {
        if start >= end {
            return Err(Error::invalid_option(
                "address range",
                format!("{} is not below {}", start, end),
            ));
        }

        Ok(Self { start, end })
    }

    /// The number of bytes covered by the range.
    pub fn size(&self) -> u64 {
        self.end.0.saturating_sub(self.start.0)
    }

    /// Test if the address is inside of the range.
    pub fn contains(&self, value: Address) -> bool {
        self.start <= value && value < self.end
    }

    /// Test if `other` lies fully inside of this range.
    pub fn covers(&self, other: &AddressRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Helper function to find which range a given address is contained in.
    ///
    /// This assumes the ranges are sorted by their `start`.
    pub fn find_index_in_range<T>(
        things: &[T],
        accessor: impl Fn(&T) -> &AddressRange,
        address: Address,
    ) -> Option<usize> {
        let index = match things.binary_search_by(|m| accessor(m).start.cmp(&address)) {
            Ok(exact) => exact,
            Err(closest) => {
                if closest == 0 {
                    return None;
                }

                closest - 1
            }
        };

        if accessor(&things[index]).contains(address) {
            return Some(index);
        }

        None
    }

    /// Find the element whose range contains the given address.
    pub fn find_in_range<T>(
        things: &[T],
        accessor: impl Fn(&T) -> &AddressRange,
        address: Address,
    ) -> Option<&T> {
        let index = Self::find_index_in_range(things, accessor, address)?;
        Some(&things[index])
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}-{}", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::AddressRange;
    use crate::Address;

    fn range(start: u64, end: u64) -> AddressRange {
        AddressRange::new(Address::new(start), Address::new(end)).unwrap()
    }

    #[test]
    fn test_rejects_inverted() {
        assert!(AddressRange::new(Address::new(0x20), Address::new(0x10)).is_err());
        assert!(AddressRange::new(Address::new(0x20), Address::new(0x20)).is_err());
    }

    #[test]
    fn test_find_in_range() {
        let ranges = vec![range(0x1000, 0x2000), range(0x3000, 0x4000)];
        let find = |a| AddressRange::find_index_in_range(&ranges, |r| r, Address::new(a));

        assert_eq!(None, find(0x0fff));
        assert_eq!(Some(0), find(0x1000));
        assert_eq!(Some(0), find(0x1fff));
        assert_eq!(None, find(0x2000));
        assert_eq!(Some(1), find(0x3abc));
        assert_eq!(None, find(0x4000));
    }

    #[test]
    fn test_covers() {
        assert!(range(0x1000, 0x4000).covers(&range(0x1000, 0x2000)));
        assert!(!range(0x1000, 0x4000).covers(&range(0x3000, 0x5000)));
    }
}
