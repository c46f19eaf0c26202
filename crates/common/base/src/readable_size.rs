// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Human readable byte sizes for configuration files.
//!
//! Sizes are binary multiples: `"64KiB"`, `"64KB"` and `"64k"` all mean
//! 65536 bytes. A bare integer is a byte count.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use snafu::{OptionExt, ResultExt, Snafu};

const UNIT: u64 = 1024;

const KIB: u64 = UNIT;
const MIB: u64 = KIB * UNIT;
const GIB: u64 = MIB * UNIT;
const TIB: u64 = GIB * UNIT;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ParseSizeError {
    #[snafu(display("empty size string"))]
    Empty,

    #[snafu(display("invalid size number in '{input}'"))]
    InvalidNumber {
        input:  String,
        source: std::num::ParseIntError,
    },

    #[snafu(display("unknown size unit '{unit}'"))]
    UnknownUnit { unit: String },

    #[snafu(display("size '{input}' overflows u64"))]
    Overflow { input: String },
}

/// A byte count that reads and prints like `"100MiB"`.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    derive_more::From,
    derive_more::Into,
)]
pub struct ReadableSize(pub u64);

impl ReadableSize {
    #[must_use]
    pub const fn bytes(count: u64) -> Self { Self(count) }

    #[must_use]
    pub const fn kb(count: u64) -> Self { Self(count * KIB) }

    #[must_use]
    pub const fn mb(count: u64) -> Self { Self(count * MIB) }

    #[must_use]
    pub const fn gb(count: u64) -> Self { Self(count * GIB) }

    #[must_use]
    pub const fn as_bytes(self) -> u64 { self.0 }

    /// Byte count as `usize`, saturating on 32-bit targets.
    #[must_use]
    pub fn as_usize(self) -> usize { usize::try_from(self.0).unwrap_or(usize::MAX) }
}

impl fmt::Display for ReadableSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = self.0;
        if size == 0 {
            return write!(f, "0B");
        }
        for (unit, suffix) in [(TIB, "TiB"), (GIB, "GiB"), (MIB, "MiB"), (KIB, "KiB")] {
            if size % unit == 0 {
                return write!(f, "{}{suffix}", size / unit);
            }
        }
        write!(f, "{size}B")
    }
}

impl FromStr for ReadableSize {
    type Err = ParseSizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        snafu::ensure!(!input.is_empty(), EmptySnafu);

        let split = input
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(input.len());
        let (number, unit) = input.split_at(split);
        let number: u64 = number.parse().context(InvalidNumberSnafu { input })?;

        let multiplier = match unit.trim().to_ascii_lowercase().as_str() {
            "" | "b" => 1,
            "k" | "kb" | "kib" => KIB,
            "m" | "mb" | "mib" => MIB,
            "g" | "gb" | "gib" => GIB,
            "t" | "tb" | "tib" => TIB,
            other => {
                return UnknownUnitSnafu {
                    unit: other.to_string(),
                }
                .fail();
            }
        };

        number
            .checked_mul(multiplier)
            .map(Self)
            .context(OverflowSnafu { input })
    }
}

impl Serialize for ReadableSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ReadableSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SizeVisitor;

        impl de::Visitor<'_> for SizeVisitor {
            type Value = ReadableSize;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a byte count or a size string like \"64KiB\"")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
                Ok(ReadableSize(value))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
                u64::try_from(value)
                    .map(ReadableSize)
                    .map_err(|_| E::custom("size must not be negative"))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                value.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(SizeVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!("0".parse::<ReadableSize>().unwrap(), ReadableSize(0));
        assert_eq!("512B".parse::<ReadableSize>().unwrap(), ReadableSize(512));
        assert_eq!("64KiB".parse::<ReadableSize>().unwrap(), ReadableSize::kb(64));
        assert_eq!("64kb".parse::<ReadableSize>().unwrap(), ReadableSize::kb(64));
        assert_eq!("100MB".parse::<ReadableSize>().unwrap(), ReadableSize::mb(100));
        assert_eq!(" 2 GiB ".parse::<ReadableSize>().unwrap(), ReadableSize::gb(2));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            "".parse::<ReadableSize>(),
            Err(ParseSizeError::Empty)
        ));
        assert!(matches!(
            "12XB".parse::<ReadableSize>(),
            Err(ParseSizeError::UnknownUnit { .. })
        ));
        assert!(matches!(
            "MB".parse::<ReadableSize>(),
            Err(ParseSizeError::InvalidNumber { .. })
        ));
        assert!(matches!(
            "99999999999999TiB".parse::<ReadableSize>(),
            Err(ParseSizeError::Overflow { .. })
        ));
    }

    #[test]
    fn test_display_picks_largest_exact_unit() {
        assert_eq!(ReadableSize::mb(100).to_string(), "100MiB");
        assert_eq!(ReadableSize::kb(1536).to_string(), "1536KiB");
        assert_eq!(ReadableSize(1000).to_string(), "1000B");
        assert_eq!(ReadableSize(0).to_string(), "0B");
    }

    #[test]
    fn test_serde() {
        let size: ReadableSize = serde_json::from_str("\"64KiB\"").unwrap();
        assert_eq!(size, ReadableSize::kb(64));
        let size: ReadableSize = serde_json::from_str("4096").unwrap();
        assert_eq!(size, ReadableSize::kb(4));
        assert_eq!(serde_json::to_string(&ReadableSize::kb(64)).unwrap(), "\"64KiB\"");
    }
}
