use fnv::FnvHashMap;
use quantflow_core::identification::Psm;
use quantflow_core::modification::translate;
use quantflow_core::{IoContext, Result};
use serde::Serialize;
use std::io::Write;
use std::path::Path;

const VERSION: &str = "1.5";
const XSI: &str = "http://www.w3.org/2001/XMLSchema-instance";
const SCHEMA_LOCATION: &str = "https://www.openms.de/xml-schema/IdXML_1_5.xsd";
const SEARCH_PARAMETERS_REF: &str = "SP_0";
const SCORE_TYPE: &str = "Posterior Error Probability";

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct UserParam {
    #[serde(rename = "@type")]
    kind: &'static str,
    #[serde(rename = "@name")]
    name: &'static str,
    #[serde(rename = "@value")]
    value: String,
}

impl UserParam {
    fn string<S: ToString>(name: &'static str, value: S) -> Self {
        Self {
            kind: "string",
            name,
            value: value.to_string(),
        }
    }

    fn int(name: &'static str, value: usize) -> Self {
        Self {
            kind: "int",
            name,
            value: value.to_string(),
        }
    }

    fn float(name: &'static str, value: f64) -> Self {
        Self {
            kind: "float",
            name,
            value: value.to_string(),
        }
    }
}

#[derive(Serialize)]
struct SearchParameters {
    #[serde(rename = "@id")]
    id: &'static str,
    #[serde(rename = "@db")]
    db: String,
    #[serde(rename = "@db_version")]
    db_version: &'static str,
    #[serde(rename = "@taxonomy")]
    taxonomy: &'static str,
    #[serde(rename = "@mass_type")]
    mass_type: &'static str,
    #[serde(rename = "@charges")]
    charges: &'static str,
    #[serde(rename = "@enzyme")]
    enzyme: &'static str,
    #[serde(rename = "@missed_cleavages")]
    missed_cleavages: usize,
    #[serde(rename = "@precursor_peak_tolerance")]
    precursor_peak_tolerance: f64,
    #[serde(rename = "@precursor_peak_tolerance_ppm")]
    precursor_peak_tolerance_ppm: bool,
    #[serde(rename = "@peak_mass_tolerance")]
    peak_mass_tolerance: f64,
    #[serde(rename = "@peak_mass_tolerance_ppm")]
    peak_mass_tolerance_ppm: bool,
}

#[derive(Serialize)]
struct ProteinHit {
    #[serde(rename = "@id")]
    id: String,
    #[serde(rename = "@accession")]
    accession: String,
    #[serde(rename = "@score")]
    score: f64,
    #[serde(rename = "@sequence")]
    sequence: &'static str,
}

#[derive(Serialize)]
struct ProteinIdentification {
    #[serde(rename = "@score_type")]
    score_type: &'static str,
    #[serde(rename = "@higher_score_better")]
    higher_score_better: bool,
    #[serde(rename = "@significance_threshold")]
    significance_threshold: f64,
    #[serde(rename = "ProteinHit")]
    hits: Vec<ProteinHit>,
}

/// A single candidate sequence for a spectrum
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct PeptideHit {
    /// Posterior error probability
    #[serde(rename = "@score")]
    pub score: f64,
    /// Bracket-notation modified sequence
    #[serde(rename = "@sequence")]
    pub sequence: String,
    #[serde(rename = "@charge")]
    pub charge: i32,
    #[serde(rename = "@protein_refs", skip_serializing_if = "String::is_empty")]
    protein_refs: String,
    #[serde(rename = "UserParam")]
    params: Vec<UserParam>,
}

/// Minimal export record: one spectrum, one hit
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct PeptideIdentification {
    #[serde(rename = "@score_type")]
    score_type: &'static str,
    #[serde(rename = "@higher_score_better")]
    higher_score_better: bool,
    #[serde(rename = "@significance_threshold")]
    significance_threshold: f64,
    #[serde(rename = "@MZ")]
    pub mz: f64,
    /// Seconds
    #[serde(rename = "@RT")]
    pub rt: f64,
    #[serde(rename = "PeptideHit")]
    pub hit: PeptideHit,
    #[serde(rename = "UserParam")]
    params: Vec<UserParam>,
}

#[derive(Serialize)]
struct IdentificationRun {
    #[serde(rename = "@date")]
    date: String,
    #[serde(rename = "@search_engine")]
    search_engine: &'static str,
    #[serde(rename = "@search_engine_version")]
    search_engine_version: &'static str,
    #[serde(rename = "@search_parameters_ref")]
    search_parameters_ref: &'static str,
    #[serde(rename = "ProteinIdentification")]
    proteins: ProteinIdentification,
    #[serde(rename = "PeptideIdentification")]
    peptides: Vec<PeptideIdentification>,
}

#[derive(Serialize)]
struct IdXml {
    #[serde(rename = "@version")]
    version: &'static str,
    #[serde(rename = "@xsi:noNamespaceSchemaLocation")]
    schema_location: &'static str,
    #[serde(rename = "@xmlns:xsi")]
    xsi: &'static str,
    #[serde(rename = "SearchParameters")]
    search_parameters: SearchParameters,
    #[serde(rename = "IdentificationRun")]
    run: IdentificationRun,
}

/// Collects identifications for one idXML file
#[derive(Default)]
pub struct IdXmlBuilder {
    fasta: String,
    accessions: Vec<String>,
    accession_index: FnvHashMap<String, usize>,
    peptides: Vec<PeptideIdentification>,
}

impl IdXmlBuilder {
    pub fn new<S: Into<String>>(fasta: S) -> Self {
        Self {
            fasta: fasta.into(),
            ..Default::default()
        }
    }

    fn protein_ref(&mut self, accession: &str) -> String {
        let next = self.accessions.len();
        let idx = *self
            .accession_index
            .entry(accession.to_string())
            .or_insert(next);
        if idx == next {
            self.accessions.push(accession.to_string());
        }
        format!("PH_{}", idx)
    }

    /// Export `psm`; `map_index` ties it to the feature map of its sample
    pub fn add(&mut self, psm: &Psm, map_index: Option<usize>) -> Result<&PeptideIdentification> {
        let sequence = translate(&psm.sequence, &psm.modifications)?;
        let protein_refs = psm
            .proteins
            .iter()
            .map(|accession| self.protein_ref(accession))
            .collect::<Vec<_>>()
            .join(" ");

        let hit = PeptideHit {
            score: psm.pep,
            sequence,
            charge: psm.charge,
            protein_refs,
            params: vec![
                UserParam::string("target_decoy", if psm.decoy { "decoy" } else { "target" }),
                UserParam::float("Posterior Probability_score", 1.0 - psm.pep),
                UserParam::float("q-value_score", psm.q_value),
                UserParam::string("psm_ref", psm.back_reference()),
            ],
        };

        self.peptides.push(PeptideIdentification {
            score_type: SCORE_TYPE,
            higher_score_better: false,
            significance_threshold: 0.0,
            mz: psm.mz,
            rt: psm.rt * 60.0,
            hit,
            params: map_index
                .map(|idx| vec![UserParam::int("map_index", idx)])
                .unwrap_or_default(),
        });
        Ok(&self.peptides[self.peptides.len() - 1])
    }

    pub fn len(&self) -> usize {
        self.peptides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peptides.is_empty()
    }

    pub fn to_xml(&self) -> Result<String> {
        let doc = IdXml {
            version: VERSION,
            schema_location: SCHEMA_LOCATION,
            xsi: XSI,
            search_parameters: SearchParameters {
                id: SEARCH_PARAMETERS_REF,
                db: self.fasta.clone(),
                db_version: "",
                taxonomy: "",
                mass_type: "monoisotopic",
                charges: "",
                enzyme: "unknown_enzyme",
                missed_cleavages: 0,
                precursor_peak_tolerance: 0.0,
                precursor_peak_tolerance_ppm: false,
                peak_mass_tolerance: 0.0,
                peak_mass_tolerance_ppm: false,
            },
            run: IdentificationRun {
                date: chrono::Local::now()
                    .format("%Y-%m-%dT%H:%M:%S")
                    .to_string(),
                search_engine: "quantflow",
                search_engine_version: env!("CARGO_PKG_VERSION"),
                search_parameters_ref: SEARCH_PARAMETERS_REF,
                proteins: ProteinIdentification {
                    score_type: "",
                    higher_score_better: false,
                    significance_threshold: 0.0,
                    hits: self
                        .accessions
                        .iter()
                        .enumerate()
                        .map(|(idx, accession)| ProteinHit {
                            id: format!("PH_{}", idx),
                            accession: accession.clone(),
                            score: 0.0,
                            sequence: "",
                        })
                        .collect(),
                },
                peptides: self.peptides.clone(),
            },
        };
        Ok(quick_xml::se::to_string_with_root("IdXML", &doc)?)
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let xml = self.to_xml()?;
        let mut file = std::io::BufWriter::new(std::fs::File::create(path).at(path)?);
        file.write_all(br#"<?xml version="1.0" encoding="UTF-8"?>"#)
            .and_then(|_| file.write_all(b"\n"))
            .and_then(|_| file.write_all(xml.as_bytes()))
            .and_then(|_| file.flush())
            .at(path)?;
        log::trace!(
            "wrote {} peptide identifications to {}",
            self.peptides.len(),
            path.display()
        );
        Ok(())
    }
}
