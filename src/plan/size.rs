//! Partition size values: `512MiB`, `1GiB`, `32G`, `remainder`.
//!
//! Bare `K`/`M`/`G`/`T` suffixes are binary (parted and sgdisk read them that
//! way); `KB`/`MB`/`GB`/`TB` are decimal.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;
pub const TIB: u64 = 1024 * GIB;

/// A partition or node size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Size {
    Bytes(u64),
    /// Everything left on the disk after the preceding partitions
    Remainder,
}

impl Size {
    pub fn gib(n: u64) -> Self {
        Self::Bytes(n * GIB)
    }

    pub fn mib(n: u64) -> Self {
        Self::Bytes(n * MIB)
    }

    /// Byte count, `None` for `Remainder`.
    pub fn bytes(&self) -> Option<u64> {
        match self {
            Self::Bytes(b) => Some(*b),
            Self::Remainder => None,
        }
    }

    /// Size in MiB rounded up, `None` for `Remainder`.
    pub fn mib_ceil(&self) -> Option<u64> {
        self.bytes().map(|b| b.div_ceil(MIB))
    }
}

/// Error for unparseable size strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeParseError(String);

impl fmt::Display for SizeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Invalid size '{}'. Expected e.g. 512MiB, 1GiB, 32G or remainder",
            self.0
        )
    }
}

impl std::error::Error for SizeParseError {}

impl FromStr for Size {
    type Err = SizeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "remainder" | "rest" | "100%" => return Ok(Self::Remainder),
            _ => {}
        }

        let split = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(trimmed.len());
        let (number, unit) = trimmed.split_at(split);
        if number.is_empty() {
            return Err(SizeParseError(s.to_string()));
        }

        let multiplier = match unit.trim().to_ascii_lowercase().as_str() {
            "" | "b" => 1,
            "k" | "kib" => KIB,
            "m" | "mib" => MIB,
            "g" | "gib" => GIB,
            "t" | "tib" => TIB,
            "kb" => 1_000,
            "mb" => 1_000_000,
            "gb" => 1_000_000_000,
            "tb" => 1_000_000_000_000,
            _ => return Err(SizeParseError(s.to_string())),
        };

        let bytes = if let Ok(whole) = number.parse::<u64>() {
            whole
                .checked_mul(multiplier)
                .ok_or_else(|| SizeParseError(s.to_string()))?
        } else {
            let fractional: f64 = number.parse().map_err(|_| SizeParseError(s.to_string()))?;
            (fractional * multiplier as f64).round() as u64
        };

        if bytes == 0 {
            return Err(SizeParseError(s.to_string()));
        }
        Ok(Self::Bytes(bytes))
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remainder => write!(f, "remainder"),
            Self::Bytes(b) if b % TIB == 0 => write!(f, "{}TiB", b / TIB),
            Self::Bytes(b) if b % GIB == 0 => write!(f, "{}GiB", b / GIB),
            Self::Bytes(b) if b % MIB == 0 => write!(f, "{}MiB", b / MIB),
            Self::Bytes(b) if b % KIB == 0 => write!(f, "{}KiB", b / KIB),
            Self::Bytes(b) => write!(f, "{}", b),
        }
    }
}

impl TryFrom<String> for Size {
    type Error = SizeParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Size> for String {
    fn from(size: Size) -> Self {
        size.to_string()
    }
}
