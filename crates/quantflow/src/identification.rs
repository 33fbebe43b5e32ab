//! Peptide-spectrum matches supplied by the host, and the back-reference
//! keys that tie exported identifications to them

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;

/// Back-references of decoy matches carry this prefix
pub const DECOY_PREFIX: &str = "DECOY_";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Psm {
    pub id: u64,
    /// Unmodified sequence
    pub sequence: String,
    /// `;`-delimited positional modification tags
    pub modifications: String,
    pub proteins: Vec<String>,
    /// Spectrum file the match came from
    pub filename: String,
    pub charge: i32,
    /// Precursor m/z
    pub mz: f64,
    /// Minutes
    pub rt: f64,
    pub q_value: f64,
    /// Posterior error probability
    pub pep: f64,
    pub decoy: bool,
}

impl Psm {
    pub fn back_reference(&self) -> BackReference {
        match self.decoy {
            true => BackReference::Decoy(self.id),
            false => BackReference::Target(self.id),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BackReference {
    Target(u64),
    Decoy(u64),
}

impl Display for BackReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackReference::Target(id) => write!(f, "{}", id),
            BackReference::Decoy(id) => write!(f, "{}{}", DECOY_PREFIX, id),
        }
    }
}

impl FromStr for BackReference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || Error::Malformed {
            field: "psm_ref",
            value: s.into(),
        };
        match s.strip_prefix(DECOY_PREFIX) {
            Some(id) => id.parse().map(BackReference::Decoy).map_err(|_| malformed()),
            None => s.parse().map(BackReference::Target).map_err(|_| malformed()),
        }
    }
}

/// Host-side provider of identifications
pub trait IdentificationSource {
    fn load(&mut self) -> Result<Vec<Psm>>;
}

impl IdentificationSource for Vec<Psm> {
    fn load(&mut self) -> Result<Vec<Psm>> {
        Ok(self.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn back_references() {
        assert_eq!(BackReference::Target(42).to_string(), "42");
        assert_eq!(BackReference::Decoy(42).to_string(), "DECOY_42");
        assert_eq!(
            "DECOY_7".parse::<BackReference>().unwrap(),
            BackReference::Decoy(7)
        );
        assert_eq!(
            "7".parse::<BackReference>().unwrap(),
            BackReference::Target(7)
        );
        assert!("DECOY_".parse::<BackReference>().is_err());
        assert!("PSM_7".parse::<BackReference>().is_err());
    }
}
