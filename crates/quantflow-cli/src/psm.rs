//! Peptide-spectrum matches from a tab-separated search engine export

use quantflow_core::identification::{IdentificationSource, Psm};
use quantflow_core::{Error, IoContext, Result};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Deserialize)]
struct Row {
    psm_id: u64,
    sequence: String,
    #[serde(default)]
    modifications: String,
    #[serde(default)]
    proteins: String,
    filename: String,
    charge: i32,
    mz: f64,
    rt: f64,
    q_value: f64,
    pep: f64,
    label: i32,
}

/// Reads `psm_id, sequence, modifications, proteins, filename, charge, mz,
/// rt, q_value, pep, label` rows. Proteins are `;`-separated; a label of
/// `-1`, or only decoy-tagged proteins, marks a decoy.
pub struct PsmTable {
    path: PathBuf,
    decoy_tag: String,
}

impl PsmTable {
    pub fn new<P: Into<PathBuf>, S: Into<String>>(path: P, decoy_tag: S) -> Self {
        Self {
            path: path.into(),
            decoy_tag: decoy_tag.into(),
        }
    }

    fn convert(&self, row: Row) -> Result<Psm> {
        if !(0.0..=1.0).contains(&row.pep) {
            return Err(Error::Malformed {
                field: "pep",
                value: row.pep.to_string(),
            });
        }
        let proteins = row
            .proteins
            .split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect::<Vec<_>>();
        let decoy = row.label == -1
            || (!proteins.is_empty() && proteins.iter().all(|p| p.starts_with(&self.decoy_tag)));

        Ok(Psm {
            id: row.psm_id,
            sequence: row.sequence,
            modifications: row.modifications,
            proteins,
            filename: row.filename,
            charge: row.charge,
            mz: row.mz,
            rt: row.rt,
            q_value: row.q_value,
            pep: row.pep,
            decoy,
        })
    }
}

impl IdentificationSource for PsmTable {
    fn load(&mut self) -> Result<Vec<Psm>> {
        let file = std::fs::File::open(&self.path).at(&self.path)?;
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .comment(Some(b'#'))
            .from_reader(file);

        let mut psms = Vec::new();
        for row in rdr.deserialize::<Row>() {
            psms.push(self.convert(row?)?);
        }

        let mut ids = fnv::FnvHashSet::default();
        if let Some(dup) = psms.iter().find(|psm| !ids.insert(psm.id)) {
            return Err(Error::InputContract(format!(
                "duplicate psm_id {} in {}",
                dup.id,
                self.path.display()
            )));
        }

        log::info!(
            "read {} peptide-spectrum matches ({} decoys) from {}",
            psms.len(),
            psms.iter().filter(|p| p.decoy).count(),
            self.path.display()
        );
        Ok(psms)
    }
}
