//! Byte quantities with binary unit suffixes
//!
//! Accepts `<digits>[K|M|G][B]`, case-insensitive, where K/M/G are powers
//! of 1024. The empty string is zero bytes.

use crate::error::InvalidMemorySize;
use nom::{
    IResult, Parser,
    character::complete::{digit1, one_of},
    combinator::{all_consuming, opt},
};
use std::fmt;
use std::str::FromStr;

const KILO: i64 = 1024;
const MEGA: i64 = KILO * KILO;
const GIGA: i64 = MEGA * KILO;

/// An amount of memory or disk space, in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemorySize {
    bytes: i64,
}

impl MemorySize {
    /// Parse a size string such as `"3G"`, `"512mb"` or `"1024"`
    pub fn parse(s: &str) -> Result<Self, InvalidMemorySize> {
        if s.is_empty() {
            return Ok(Self::default());
        }

        let invalid = || InvalidMemorySize(s.to_string());

        let (_, (digits, unit)) = size_expr(s).map_err(|_| invalid())?;
        let value: i64 = digits.parse().map_err(|_| invalid())?;
        let factor = match unit.map(|u| u.to_ascii_lowercase()) {
            Some('k') => KILO,
            Some('m') => MEGA,
            Some('g') => GIGA,
            _ => 1,
        };

        value
            .checked_mul(factor)
            .map(Self::from_bytes)
            .ok_or_else(invalid)
    }

    pub const fn from_bytes(bytes: i64) -> Self {
        Self { bytes }
    }

    pub fn in_bytes(&self) -> i64 {
        self.bytes
    }

    pub fn in_kilobytes(&self) -> i64 {
        self.bytes / KILO
    }

    pub fn in_megabytes(&self) -> i64 {
        self.bytes / MEGA
    }

    pub fn in_gigabytes(&self) -> i64 {
        self.bytes / GIGA
    }
}

/// digits, optional unit letter, optional trailing B, nothing else
fn size_expr(input: &str) -> IResult<&str, (&str, Option<char>)> {
    all_consuming((digit1, opt(one_of("kKmMgG")), opt(one_of("bB"))))
        .map(|(digits, unit, _)| (digits, unit))
        .parse(input)
}

impl FromStr for MemorySize {
    type Err = InvalidMemorySize;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bytes)
    }
}
