use quantflow_core::assembly::ConsensusRecord;
use quantflow_core::columns::{AbundanceColumns, Abundances};
use quantflow_core::quant::{PeptideAbundance, ProteinAbundance};
use quantflow_core::sink::{QuantResults, QuantSink};
use quantflow_core::{Error, IoContext, Result};
use std::path::PathBuf;

/// Writes the three result tables into an output directory
pub struct TsvSink {
    directory: PathBuf,
    written: Vec<PathBuf>,
}

impl TsvSink {
    pub fn new<P: Into<PathBuf>>(directory: P) -> Self {
        Self {
            directory: directory.into(),
            written: Vec::new(),
        }
    }

    /// Files produced by [`QuantSink::publish`]
    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }

    /// Serialize one table into a temporary file next to its final path
    fn stage(
        &self,
        name: &str,
        headers: &[&str],
        columns: &AbundanceColumns,
        records: Vec<csv::ByteRecord>,
    ) -> Result<Staged> {
        let path = self.directory.join(name);
        if path.is_dir() {
            return Err(Error::Io {
                path,
                source: std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "a directory occupies the output path",
                ),
            });
        }

        let mut file = tempfile::Builder::new()
            .prefix(".quantflow-")
            .suffix(".tsv")
            .tempfile_in(&self.directory)
            .at(&self.directory)?;

        let rows = records.len();
        let mut wtr = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(file.as_file_mut());
        let mut header = csv::ByteRecord::from(headers.to_vec());
        header.extend(columns.iter().map(|(_, name)| name));
        wtr.write_byte_record(&header)?;
        for record in records {
            wtr.write_byte_record(&record)?;
        }
        wtr.flush().at(&path)?;
        drop(wtr);

        Ok(Staged { file, path, rows })
    }

    /// Move staged tables into place. Either every table lands or none does:
    /// tables already moved are removed again if a later one fails.
    fn persist(&mut self, staged: Vec<Staged>) -> Result<()> {
        let mut moved: Vec<PathBuf> = Vec::with_capacity(staged.len());
        for Staged { file, path, rows } in staged {
            if let Err(err) = file.persist(&path) {
                for done in &moved {
                    if let Err(e) = std::fs::remove_file(done) {
                        log::warn!("failed to remove {}: {}", done.display(), e);
                    }
                }
                return Err(err.error).at(&path);
            }
            log::info!("wrote {} rows to {}", rows, path.display());
            moved.push(path);
        }
        self.written.extend(moved);
        Ok(())
    }
}

struct Staged {
    file: tempfile::NamedTempFile,
    path: PathBuf,
    rows: usize,
}

fn push_abundances(record: &mut csv::ByteRecord, abundances: &Abundances) {
    for value in abundances.values() {
        match value {
            Some(x) => record.push_field(ryu::Buffer::new().format(*x).as_bytes()),
            None => record.push_field(b""),
        }
    }
}

fn serialize_consensus(record: &ConsensusRecord) -> csv::ByteRecord {
    let mut out = csv::ByteRecord::new();
    out.push_field(itoa::Buffer::new().format(record.id).as_bytes());
    out.push_field(record.feature_id.as_bytes());
    out.push_field(record.sequence.as_deref().unwrap_or_default().as_bytes());
    out.push_field(
        record
            .modified_sequence
            .as_deref()
            .unwrap_or_default()
            .as_bytes(),
    );
    out.push_field(record.accessions.join(";").as_bytes());
    out.push_field(itoa::Buffer::new().format(record.charge).as_bytes());
    out.push_field(ryu::Buffer::new().format(record.mz).as_bytes());
    out.push_field(ryu::Buffer::new().format(record.rt).as_bytes());
    out.push_field(ryu::Buffer::new().format(record.quality).as_bytes());
    push_abundances(&mut out, &record.abundances);
    out
}

fn serialize_peptide(peptide: &PeptideAbundance) -> csv::ByteRecord {
    let mut out = csv::ByteRecord::new();
    out.push_field(peptide.peptide.as_bytes());
    out.push_field(peptide.proteins.join(";").as_bytes());
    out.push_field(itoa::Buffer::new().format(peptide.n_proteins).as_bytes());
    out.push_field(itoa::Buffer::new().format(peptide.charge).as_bytes());
    push_abundances(&mut out, &peptide.abundances);
    out
}

fn serialize_protein(protein: &ProteinAbundance) -> csv::ByteRecord {
    let mut out = csv::ByteRecord::new();
    out.push_field(protein.proteins.join(";").as_bytes());
    out.push_field(itoa::Buffer::new().format(protein.n_proteins).as_bytes());
    match protein.protein_score {
        Some(score) => out.push_field(ryu::Buffer::new().format(score).as_bytes()),
        None => out.push_field(b""),
    }
    out.push_field(itoa::Buffer::new().format(protein.n_peptides).as_bytes());
    push_abundances(&mut out, &protein.abundances);
    out
}

impl QuantSink for TsvSink {
    fn publish(&mut self, results: QuantResults) -> Result<()> {
        let staged = vec![
            self.stage(
                "consensus.tsv",
                &[
                    "id",
                    "feature_id",
                    "sequence",
                    "modified_sequence",
                    "proteins",
                    "charge",
                    "mz",
                    "rt",
                    "quality",
                ],
                &results.columns,
                results.consensus.iter().map(serialize_consensus).collect(),
            )?,
            self.stage(
                "peptides.tsv",
                &["peptide", "proteins", "n_proteins", "charge"],
                &results.columns,
                results.peptides.iter().map(serialize_peptide).collect(),
            )?,
            self.stage(
                "proteins.tsv",
                &["proteins", "n_proteins", "protein_score", "n_peptides"],
                &results.columns,
                results.proteins.iter().map(serialize_protein).collect(),
            )?,
        ];
        self.persist(staged)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn results() -> QuantResults {
        let columns = AbundanceColumns::new(&["a.mzML", "b.mzML"]);
        QuantResults {
            columns,
            consensus: vec![ConsensusRecord {
                id: 1,
                feature_id: "42".into(),
                sequence: Some("PEPTIDE".into()),
                modified_sequence: Some("PEPT(Phospho)IDE".into()),
                accessions: vec!["P1".into(), "P2".into()],
                charge: 2,
                mz: 450.5,
                rt: 10.0,
                quality: 0.5,
                abundances: vec![Some(1000.0), None].into(),
            }],
            peptides: vec![],
            proteins: vec![ProteinAbundance {
                proteins: vec!["P1".into()],
                n_proteins: 1,
                protein_score: None,
                n_peptides: 3,
                abundances: vec![None, Some(2.5)].into(),
            }],
        }
    }

    fn listing(dir: &std::path::Path) -> Vec<String> {
        let mut names = std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    #[test]
    fn write_tables() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = TsvSink::new(dir.path());
        sink.publish(results()).unwrap();
        assert_eq!(sink.written().len(), 3);
        assert_eq!(
            listing(dir.path()),
            vec!["consensus.tsv", "peptides.tsv", "proteins.tsv"]
        );

        let consensus = std::fs::read_to_string(dir.path().join("consensus.tsv")).unwrap();
        let mut lines = consensus.lines();
        assert_eq!(
            lines.next().unwrap(),
            "id\tfeature_id\tsequence\tmodified_sequence\tproteins\tcharge\tmz\trt\tquality\tabundance_a\tabundance_b"
        );
        assert_eq!(
            lines.next().unwrap(),
            "1\t42\tPEPTIDE\tPEPT(Phospho)IDE\tP1;P2\t2\t450.5\t10.0\t0.5\t1000.0\t"
        );

        let peptides = std::fs::read_to_string(dir.path().join("peptides.tsv")).unwrap();
        assert_eq!(peptides.lines().count(), 1, "header only");

        let proteins = std::fs::read_to_string(dir.path().join("proteins.tsv")).unwrap();
        assert_eq!(
            proteins.lines().nth(1).unwrap(),
            "P1\t1\t\t3\t\t2.5"
        );
    }

    #[test]
    fn blocked_table_publishes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("peptides.tsv")).unwrap();

        let mut sink = TsvSink::new(dir.path());
        let err = sink.publish(results()).unwrap_err();
        assert!(matches!(err, Error::Io { .. }), "{}", err);
        assert!(sink.written().is_empty());
        assert_eq!(listing(dir.path()), vec!["peptides.tsv"]);
    }

    #[test]
    fn failed_move_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let sink_dir = dir.path().to_path_buf();
        let mut sink = TsvSink::new(&sink_dir);

        let columns = AbundanceColumns::new(&["a.mzML"]);
        let first = sink
            .stage("consensus.tsv", &["id"], &columns, vec![])
            .unwrap();
        let second = sink
            .stage("proteins.tsv", &["proteins"], &columns, vec![])
            .unwrap();
        // Occupy the second target after staging so the move itself fails
        std::fs::create_dir(sink_dir.join("proteins.tsv")).unwrap();
        std::fs::write(sink_dir.join("proteins.tsv").join("keep"), b"x").unwrap();

        assert!(sink.persist(vec![first, second]).is_err());
        assert!(sink.written().is_empty());
        assert_eq!(listing(&sink_dir), vec!["proteins.tsv"]);
    }
}
