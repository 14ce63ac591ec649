//! Group address patterns for subscriptions.
//!
//! A pattern has one to three `/`-separated levels, matching the free,
//! 2-level and 3-level group address formats. Each level is a comma-separated
//! list of ranges: `*` (anything), `8`, `8-10`, `-10` (from zero), `8-`
//! (to the maximum). Reversed ranges are flipped.
//!
//! ```
//! use knx_engine::addressing::AddressFilter;
//!
//! let filter: AddressFilter = "1/*/2-5".parse().unwrap();
//! assert!(filter.matches("1/7/3".parse().unwrap()));
//! assert!(!filter.matches("1/7/6".parse().unwrap()));
//! ```

use super::GroupAddress;
use crate::error::{KnxError, Result};

const MAX_FREE: u16 = u16::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Range {
    from: u16,
    to: u16,
}

impl Range {
    fn parse(pattern: &str) -> Result<Self> {
        let pattern = pattern.trim();
        let number = |text: &str, default: u16| -> Result<u16> {
            if text.is_empty() {
                return Ok(default);
            }
            text.parse::<u32>()
                .ok()
                .map(|n| n.min(u32::from(MAX_FREE)) as u16)
                .ok_or_else(KnxError::invalid_address_format)
        };
        let (from, to) = if pattern == "*" {
            (0, MAX_FREE)
        } else if let Some((from, to)) = pattern.split_once('-') {
            (number(from, 0)?, number(to, MAX_FREE)?)
        } else if pattern.is_empty() {
            return Err(KnxError::invalid_address_format());
        } else {
            let n = number(pattern, 0)?;
            (n, n)
        };
        Ok(Self {
            from: from.min(to),
            to: from.max(to),
        })
    }

    fn contains(self, value: u16) -> bool {
        (self.from..=self.to).contains(&value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LevelFilter {
    ranges: Vec<Range>,
}

impl LevelFilter {
    fn parse(pattern: &str) -> Result<Self> {
        let ranges = pattern.split(',').map(Range::parse).collect::<Result<_>>()?;
        Ok(Self { ranges })
    }

    fn matches(&self, value: u16) -> bool {
        self.ranges.iter().any(|range| range.contains(value))
    }
}

/// Pattern over group addresses, see the module documentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressFilter {
    levels: Vec<LevelFilter>,
}

impl AddressFilter {
    /// Filter that matches every group address.
    pub fn any() -> Self {
        Self {
            levels: vec![LevelFilter {
                ranges: vec![Range { from: 0, to: MAX_FREE }],
            }],
        }
    }

    /// Test a group address against the pattern.
    pub fn matches(&self, address: GroupAddress) -> bool {
        match self.levels.as_slice() {
            [main, middle, sub] => {
                main.matches(address.main().into())
                    && middle.matches(address.middle().into())
                    && sub.matches(address.sub().into())
            }
            [main, sub] => main.matches(address.main().into()) && sub.matches(address.sub_2level()),
            [free] => free.matches(address.raw()),
            _ => false,
        }
    }
}

impl core::str::FromStr for AddressFilter {
    type Err = KnxError;

    fn from_str(pattern: &str) -> Result<Self> {
        let levels = pattern
            .split('/')
            .map(LevelFilter::parse)
            .collect::<Result<Vec<_>>>()?;
        if levels.len() > 3 {
            return Err(KnxError::invalid_address_format());
        }
        Ok(Self { levels })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ga(text: &str) -> GroupAddress {
        text.parse().unwrap()
    }

    #[test]
    fn test_three_level_wildcard() {
        let filter: AddressFilter = "1/*/2-5".parse().unwrap();
        assert!(filter.matches(ga("1/0/2")));
        assert!(filter.matches(ga("1/7/5")));
        assert!(!filter.matches(ga("1/7/6")));
        assert!(!filter.matches(ga("2/0/2")));
    }

    #[test]
    fn test_two_level_lists() {
        let filter: AddressFilter = "1-3,5/*".parse().unwrap();
        assert!(filter.matches(ga("2/2000")));
        assert!(filter.matches(ga("5/0")));
        assert!(!filter.matches(ga("4/0")));
    }

    #[test]
    fn test_free_format_and_open_ranges() {
        let filter: AddressFilter = "-10".parse().unwrap();
        assert!(filter.matches(GroupAddress::from(0)));
        assert!(filter.matches(GroupAddress::from(10)));
        assert!(!filter.matches(GroupAddress::from(11)));

        let filter: AddressFilter = "65000-".parse().unwrap();
        assert!(filter.matches(GroupAddress::from(u16::MAX)));
    }

    #[test]
    fn test_reversed_range_is_flipped() {
        let filter: AddressFilter = "1/0/10-5".parse().unwrap();
        assert!(filter.matches(ga("1/0/7")));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!("1/2/3/4".parse::<AddressFilter>().is_err());
        assert!("a/b".parse::<AddressFilter>().is_err());
        assert!("1//2".parse::<AddressFilter>().is_err());
    }
}
