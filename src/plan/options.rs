//! Mount-time options for partitions and btrfs subvolumes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::{CompressAlgo, DiscardMode};

/// `compress=` value, e.g. `zstd:3` or `lzo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Compression {
    pub algo: CompressAlgo,
    pub level: Option<u8>,
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algo, level) = match s.split_once(':') {
            Some((algo, level)) => (algo, Some(level)),
            None => (s, None),
        };
        let algo: CompressAlgo = algo
            .trim()
            .parse()
            .map_err(|_| format!("Unknown compression '{}'. Valid: zstd, lzo, zlib", algo))?;
        let level = level
            .map(|l| {
                l.trim()
                    .parse::<u8>()
                    .map_err(|_| format!("Invalid compression level '{}'", l))
            })
            .transpose()?;
        Ok(Self { algo, level })
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.level {
            Some(level) => write!(f, "{}:{}", self.algo, level),
            None => write!(f, "{}", self.algo),
        }
    }
}

impl TryFrom<String> for Compression {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Compression> for String {
    fn from(c: Compression) -> Self {
        c.to_string()
    }
}

/// Mount options declared on a partition or subvolume.
///
/// Subvolumes inherit their filesystem's options via [`MountOptions::overlay`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MountOptions {
    pub compress: Option<Compression>,
    pub noatime: bool,
    pub discard: Option<DiscardMode>,
    /// btrfs transaction commit interval in seconds
    pub commit: Option<u32>,
    pub nodatacow: bool,
    /// Keep the entry out of boot-time mounting
    pub noauto: bool,
    /// Passed through verbatim
    pub extra: Vec<String>,
}

impl MountOptions {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// `self` as the base, with every field set in `other` taking precedence.
    pub fn overlay(&self, other: &MountOptions) -> MountOptions {
        let mut extra = self.extra.clone();
        for opt in &other.extra {
            if !extra.contains(opt) {
                extra.push(opt.clone());
            }
        }
        MountOptions {
            compress: other.compress.or(self.compress),
            noatime: self.noatime || other.noatime,
            discard: other.discard.or(self.discard),
            commit: other.commit.or(self.commit),
            nodatacow: self.nodatacow || other.nodatacow,
            noauto: self.noauto || other.noauto,
            extra,
        }
    }

    /// Individual option words in the order `mount` receives them.
    pub fn to_words(&self) -> Vec<String> {
        let mut words = Vec::new();
        if self.noatime {
            words.push("noatime".to_string());
        }
        if let Some(compress) = self.compress {
            words.push(format!("compress={}", compress));
        }
        match self.discard {
            Some(DiscardMode::Off) => words.push("nodiscard".to_string()),
            Some(mode) => words.push(format!("discard={}", mode)),
            None => {}
        }
        if let Some(commit) = self.commit {
            words.push(format!("commit={}", commit));
        }
        if self.nodatacow {
            words.push("nodatacow".to_string());
        }
        if self.noauto {
            words.push("noauto".to_string());
        }
        words.extend(self.extra.iter().cloned());
        words
    }

    /// Comma-joined option string, optionally qualified with a subvolume.
    ///
    /// Returns `defaults` when nothing is set.
    pub fn render(&self, subvolume: Option<&str>) -> String {
        let mut words = Vec::new();
        if let Some(name) = subvolume {
            words.push(format!("subvol=/{}", name.trim_start_matches('/')));
        }
        words.extend(self.to_words());
        if words.is_empty() {
            "defaults".to_string()
        } else {
            words.join(",")
        }
    }
}
