//! Bandwidth quantity parsing and representation.
//!
//! Bandwidth is carried in bits per second. Strings use the `tc` unit style:
//! - "100mbit" -> 100 * 1000^2 bits/s
//! - "1gbit" -> 1000^3 bits/s
//! - "512kbit" -> 512 * 1000 bits/s
//! - "2500" -> 2500 bits/s
//!
//! Zero means "unlimited".

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{MeshbedError, MeshbedResult};

const KBIT: u64 = 1000;
const MBIT: u64 = 1000 * KBIT;
const GBIT: u64 = 1000 * MBIT;
const TBIT: u64 = 1000 * GBIT;

/// A link bandwidth in bits per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bandwidth(u64);

impl Bandwidth {
    /// No bandwidth limit.
    pub const UNLIMITED: Self = Self(0);

    /// Create a bandwidth from bits per second.
    #[must_use]
    pub const fn bits_per_sec(bits: u64) -> Self {
        Self(bits)
    }

    /// Create a bandwidth from kilobits per second.
    #[must_use]
    pub const fn kbit(kbit: u64) -> Self {
        Self(kbit * KBIT)
    }

    /// Create a bandwidth from megabits per second.
    #[must_use]
    pub const fn mbit(mbit: u64) -> Self {
        Self(mbit * MBIT)
    }

    /// Create a bandwidth from gigabits per second.
    #[must_use]
    pub const fn gbit(gbit: u64) -> Self {
        Self(gbit * GBIT)
    }

    /// Bits per second.
    #[must_use]
    pub const fn as_bits(&self) -> u64 {
        self.0
    }

    /// Whether this bandwidth imposes no limit.
    #[must_use]
    pub const fn is_unlimited(&self) -> bool {
        self.0 == 0
    }

    /// Parse a bandwidth string.
    ///
    /// # Errors
    ///
    /// Returns [`MeshbedError::InvalidBandwidth`] if the string has an unknown
    /// unit, is not a number, or overflows.
    pub fn parse(s: &str) -> MeshbedResult<Self> {
        let s = s.trim();
        let invalid = || MeshbedError::InvalidBandwidth {
            value: s.to_string(),
        };

        let suffixes = [
            ("tbit", TBIT),
            ("gbit", GBIT),
            ("mbit", MBIT),
            ("kbit", KBIT),
            ("bit", 1u64),
        ];

        for (suffix, multiplier) in suffixes {
            if let Some(stripped) = s.strip_suffix(suffix) {
                let value: u64 = stripped.trim().parse().map_err(|_| invalid())?;
                return value.checked_mul(multiplier).map(Self).ok_or_else(invalid);
            }
        }

        s.parse().map(Self).map_err(|_| invalid())
    }
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let units = [(TBIT, "tbit"), (GBIT, "gbit"), (MBIT, "mbit"), (KBIT, "kbit")];
        for (size, unit) in units {
            if self.0 >= size && self.0 % size == 0 {
                return write!(f, "{}{}", self.0 / size, unit);
            }
        }
        write!(f, "{}bit", self.0)
    }
}

impl FromStr for Bandwidth {
    type Err = MeshbedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Bandwidth {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for Bandwidth {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bits(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Bits(bits) => Ok(Self(bits)),
            Raw::Text(text) => Self::parse(&text).map_err(serde::de::Error::custom),
        }
    }
}
