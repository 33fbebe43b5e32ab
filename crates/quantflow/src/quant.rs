//! Peptide and protein abundance tables written by the quantifier

use crate::columns::{AbundanceColumns, Abundances};
use crate::{Error, IoContext, Result};
use serde::Serialize;
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PeptideAbundance {
    /// Modified peptide sequence
    pub peptide: String,
    pub proteins: Vec<String>,
    pub n_proteins: usize,
    pub charge: i32,
    pub abundances: Abundances,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProteinAbundance {
    /// Accessions of the protein group
    pub proteins: Vec<String>,
    pub n_proteins: usize,
    pub protein_score: Option<f64>,
    pub n_peptides: usize,
    pub abundances: Abundances,
}

/// `0` and empty cells mean "not quantified", not zero abundance
pub fn parse_abundance(cell: &str) -> Result<Option<f64>> {
    let cell = cell.trim();
    if cell.is_empty() {
        return Ok(None);
    }
    let value = cell.parse::<f64>().map_err(|_| Error::Malformed {
        field: "abundance",
        value: cell.into(),
    })?;
    Ok(if value == 0.0 || value.is_nan() {
        None
    } else {
        Some(value)
    })
}

fn split_accessions(cell: &str) -> Vec<String> {
    cell.split('/')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Column layout of one table: fixed leading columns by name, followed by
/// the abundance columns in sample order
struct Layout {
    fixed: Vec<Option<usize>>,
    abundance: Vec<usize>,
}

impl Layout {
    fn new(
        headers: &csv::StringRecord,
        fixed: &[&str],
        columns: &AbundanceColumns,
        path: &Path,
    ) -> Result<Self> {
        let position = |name: &str| headers.iter().position(|h| h.trim() == name);
        let abundance = headers
            .iter()
            .enumerate()
            .filter(|(_, h)| h.trim().starts_with("abundance"))
            .map(|(idx, _)| idx)
            .collect::<Vec<_>>();

        if abundance.len() != columns.len() {
            return Err(Error::DataJoin(format!(
                "{} has {} abundance columns, expected one for each of {} samples",
                path.display(),
                abundance.len(),
                columns.len()
            )));
        }
        Ok(Layout {
            fixed: fixed.iter().map(|f| position(f)).collect(),
            abundance,
        })
    }

    fn field<'r>(&self, record: &'r csv::StringRecord, fixed: usize) -> &'r str {
        self.fixed[fixed]
            .and_then(|idx| record.get(idx))
            .unwrap_or_default()
            .trim()
    }

    fn abundances(&self, record: &csv::StringRecord) -> Result<Abundances> {
        self.abundance
            .iter()
            .map(|&idx| parse_abundance(record.get(idx).unwrap_or_default()))
            .collect::<Result<Vec<_>>>()
            .map(Abundances::from)
    }
}

fn reader(path: &Path) -> Result<csv::Reader<std::fs::File>> {
    let file = std::fs::File::open(path).at(path)?;
    Ok(csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .comment(Some(b'#'))
        .flexible(true)
        .from_reader(file))
}

fn count(field: &'static str, cell: &str) -> Result<usize> {
    if cell.is_empty() {
        return Ok(0);
    }
    cell.parse().map_err(|_| Error::Malformed {
        field,
        value: cell.into(),
    })
}

/// Parse the quantifier's peptide table
pub fn read_peptide_table<P: AsRef<Path>>(
    path: P,
    columns: &AbundanceColumns,
) -> Result<Vec<PeptideAbundance>> {
    let path = path.as_ref();
    let mut rdr = reader(path)?;
    let layout = Layout::new(
        rdr.headers()?,
        &["peptide", "protein", "n_proteins", "charge"],
        columns,
        path,
    )?;

    let mut peptides = Vec::new();
    for record in rdr.records() {
        let record = record?;
        let proteins = split_accessions(layout.field(&record, 1));
        let n_proteins = match layout.field(&record, 2) {
            "" => proteins.len(),
            n => count("n_proteins", n)?,
        };
        let charge = match layout.field(&record, 3) {
            "" => 0,
            c => c.parse().map_err(|_| Error::Malformed {
                field: "charge",
                value: c.into(),
            })?,
        };
        peptides.push(PeptideAbundance {
            peptide: layout.field(&record, 0).to_string(),
            proteins,
            n_proteins,
            charge,
            abundances: layout.abundances(&record)?,
        });
    }
    log::trace!("read {} peptides from {}", peptides.len(), path.display());
    Ok(peptides)
}

/// Parse the quantifier's protein table
pub fn read_protein_table<P: AsRef<Path>>(
    path: P,
    columns: &AbundanceColumns,
) -> Result<Vec<ProteinAbundance>> {
    let path = path.as_ref();
    let mut rdr = reader(path)?;
    let layout = Layout::new(
        rdr.headers()?,
        &["protein", "n_proteins", "protein_score", "n_peptides"],
        columns,
        path,
    )?;

    let mut proteins = Vec::new();
    for record in rdr.records() {
        let record = record?;
        let accessions = split_accessions(layout.field(&record, 0));
        let n_proteins = match layout.field(&record, 1) {
            "" => accessions.len(),
            n => count("n_proteins", n)?,
        };
        let protein_score = match layout.field(&record, 2) {
            "" => None,
            s => Some(s.parse().map_err(|_| Error::Malformed {
                field: "protein_score",
                value: s.into(),
            })?),
        };
        proteins.push(ProteinAbundance {
            proteins: accessions,
            n_proteins,
            protein_score,
            n_peptides: count("n_peptides", layout.field(&record, 3))?,
            abundances: layout.abundances(&record)?,
        });
    }
    log::trace!("read {} proteins from {}", proteins.len(), path.display());
    Ok(proteins)
}

#[cfg(test)]
mod test {
    use super::*;

    fn columns() -> AbundanceColumns {
        AbundanceColumns::new(&["a.featureXML", "b.featureXML"])
    }

    #[test]
    fn missing_values() {
        assert_eq!(parse_abundance("").unwrap(), None);
        assert_eq!(parse_abundance(" 0 ").unwrap(), None);
        assert_eq!(parse_abundance("0.0").unwrap(), None);
        assert_eq!(parse_abundance("12.5").unwrap(), Some(12.5));
        assert_eq!(parse_abundance("1e6").unwrap(), Some(1e6));
        assert!(parse_abundance("many").is_err());
    }

    #[test]
    fn peptide_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peptides.tsv");
        std::fs::write(
            &path,
            "# Peptide abundances\n\
             # Files/samples associated with abundance values below: 1: 'a.mzML', 2: 'b.mzML'\n\
             \"peptide\"\t\"protein\"\t\"n_proteins\"\t\"charge\"\t\"abundance_1\"\t\"abundance_2\"\n\
             \"PEPT(Phospho)IDE\"\t\"P12345/P67890\"\t2\t2\t1500\t0\n\
             \"LESLIEK\"\t\"Q99999\"\t1\t3\t\t2.5e4\n",
        )
        .unwrap();

        let peptides = read_peptide_table(&path, &columns()).unwrap();
        assert_eq!(peptides.len(), 2);
        assert_eq!(peptides[0].peptide, "PEPT(Phospho)IDE");
        assert_eq!(peptides[0].proteins, vec!["P12345", "P67890"]);
        assert_eq!(peptides[0].n_proteins, 2);
        assert_eq!(peptides[0].abundances.values(), &[Some(1500.0), None]);
        assert_eq!(peptides[1].charge, 3);
        assert_eq!(peptides[1].abundances.values(), &[None, Some(2.5e4)]);
    }

    #[test]
    fn protein_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proteins.tsv");
        std::fs::write(
            &path,
            "# Protein abundances\n\
             protein\tn_proteins\tprotein_score\tn_peptides\tabundance_1\tabundance_2\n\
             P12345/P67890\t2\t0.99\t3\t100\t200\n\
             Q99999\t1\t\t1\t0\t\n",
        )
        .unwrap();

        let proteins = read_protein_table(&path, &columns()).unwrap();
        assert_eq!(proteins.len(), 2);
        assert_eq!(proteins[0].protein_score, Some(0.99));
        assert_eq!(proteins[0].n_peptides, 3);
        assert_eq!(proteins[1].protein_score, None);
        assert_eq!(proteins[1].abundances.populated(), 0);
    }

    #[test]
    fn column_count_must_match_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proteins.tsv");
        std::fs::write(
            &path,
            "protein\tn_proteins\tprotein_score\tn_peptides\tabundance_1\n\
             P1\t1\t1\t1\t100\n",
        )
        .unwrap();
        assert!(matches!(
            read_protein_table(&path, &columns()),
            Err(Error::DataJoin(_))
        ));
    }
}
