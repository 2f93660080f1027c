use std::fmt;
use std::str::FromStr;

use human_size::{Any, Byte, ParsingError, SpecificSize};

/// Represents a size in bytes.
///
/// `ByteSize` can be parsed from strings or with human-readable units such as `"500KB"` or
/// `"1MiB"`. Plain numbers are interpreted as bytes.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct ByteSize(u64);

impl ByteSize {
    /// Creates a byte size from a number of bytes.
    pub const fn bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Creates a byte size from a number of kibibytes (1,024 bytes).
    pub const fn kibibytes(kib: u64) -> Self {
        Self(kib * 1024)
    }

    /// Creates a byte size from a number of mebibytes (1,048,576 bytes).
    pub const fn mebibytes(mib: u64) -> Self {
        Self(mib * 1_048_576)
    }

    /// Returns the number of bytes in this size.
    pub const fn as_bytes(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1_048_576 && self.0 % 1_048_576 == 0 {
            write!(f, "{}MiB", self.0 / 1_048_576)
        } else if self.0 >= 1024 && self.0 % 1024 == 0 {
            write!(f, "{}KiB", self.0 / 1024)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl FromStr for ByteSize {
    type Err = ParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(bytes) = s.parse::<u64>() {
            return Ok(Self::bytes(bytes));
        }

        s.parse::<SpecificSize<Any>>()
            .map(|size| Self(size.into::<Byte>().value() as u64))
    }
}

relay_common::impl_str_serde!(ByteSize, "data size");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_bytes() {
        assert_eq!("42".parse::<ByteSize>().unwrap().as_bytes(), 42);
    }

    #[test]
    fn test_parse_units() {
        assert_eq!("1KiB".parse::<ByteSize>().unwrap().as_bytes(), 1024);
        assert_eq!("1MiB".parse::<ByteSize>().unwrap().as_bytes(), 1_048_576);
        // human-size treats the bare "KB" suffix as 1024-based.
        assert_eq!("500KB".parse::<ByteSize>().unwrap().as_bytes(), 512_000);
    }

    #[test]
    fn test_display_roundtrip() {
        assert_eq!(ByteSize::mebibytes(1).to_string(), "1MiB");
        assert_eq!(ByteSize::kibibytes(4).to_string(), "4KiB");
        assert_eq!(ByteSize::bytes(1000).to_string(), "1000");

        let size: ByteSize = ByteSize::mebibytes(1).to_string().parse().unwrap();
        assert_eq!(size, ByteSize::mebibytes(1));
    }
}
