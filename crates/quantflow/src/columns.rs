//! Per-sample abundance columns

use crate::{Error, Result};
use itertools::Itertools;
use serde::Serialize;
use std::path::Path;

/// Typed handle to one sample's abundance column
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ColumnHandle(usize);

impl ColumnHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Ordered, one-to-one mapping between samples and abundance columns. Built
/// once per run from the sample files.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AbundanceColumns {
    names: Vec<String>,
}

impl AbundanceColumns {
    /// Column names are `abundance_<file stem>`, suffixed with the sample
    /// index when two samples share a stem
    pub fn new<P: AsRef<Path>>(samples: &[P]) -> Self {
        let stems = samples
            .iter()
            .map(|p| {
                p.as_ref()
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default()
            })
            .collect::<Vec<_>>();

        let counts = stems.iter().counts();
        let names = stems
            .iter()
            .enumerate()
            .map(|(idx, stem)| {
                let shared = counts[&stem] > 1;
                match (stem.is_empty(), shared) {
                    (true, _) => format!("abundance_{}", idx + 1),
                    (false, true) => format!("abundance_{}_{}", stem, idx + 1),
                    (false, false) => format!("abundance_{}", stem),
                }
            })
            .collect();
        Self { names }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Handle for sample `sample`; a sample outside the run is a join error
    pub fn handle(&self, sample: usize) -> Result<ColumnHandle> {
        if sample < self.names.len() {
            Ok(ColumnHandle(sample))
        } else {
            Err(Error::DataJoin(format!(
                "sample index {} outside of a run with {} samples",
                sample,
                self.names.len()
            )))
        }
    }

    pub fn name(&self, handle: ColumnHandle) -> &str {
        &self.names[handle.0]
    }

    pub fn iter(&self) -> impl Iterator<Item = (ColumnHandle, &str)> + '_ {
        self.names
            .iter()
            .enumerate()
            .map(|(idx, name)| (ColumnHandle(idx), name.as_str()))
    }

    /// An empty row with one cell per column
    pub fn row(&self) -> Abundances {
        Abundances(vec![None; self.names.len()])
    }
}

/// One optional value per abundance column; `None` means not observed
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Abundances(Vec<Option<f64>>);

impl Abundances {
    pub fn set(&mut self, handle: ColumnHandle, value: f64) {
        self.0[handle.0] = Some(value);
    }

    pub fn get(&self, handle: ColumnHandle) -> Option<f64> {
        self.0.get(handle.0).copied().flatten()
    }

    pub fn values(&self) -> &[Option<f64>] {
        &self.0
    }

    /// Number of columns holding a value
    pub fn populated(&self) -> usize {
        self.0.iter().filter(|v| v.is_some()).count()
    }
}

impl From<Vec<Option<f64>>> for Abundances {
    fn from(values: Vec<Option<f64>>) -> Self {
        Abundances(values)
    }
}
