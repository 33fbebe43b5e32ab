//! Merge ID-mapped consensus features with host identifications into
//! quantification records

use crate::columns::{AbundanceColumns, Abundances};
use crate::consensus::{ConsensusMap, PeptideHit};
use crate::identification::{BackReference, Psm};
use crate::{Error, Result};
use fnv::FnvHashMap;
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConsensusRecord {
    /// 1-based row number, in consensus file order
    pub id: usize,
    /// Element id assigned by the linker
    pub feature_id: String,
    pub sequence: Option<String>,
    pub modified_sequence: Option<String>,
    pub accessions: Vec<String>,
    pub charge: i32,
    pub mz: f64,
    /// Minutes
    pub rt: f64,
    pub quality: f64,
    pub abundances: Abundances,
}

/// Pick the non-decoy hit with the lowest error probability. Hits without a
/// back-reference cannot be traced to a host record and are skipped; on
/// equal scores the first hit wins.
pub fn select_representative(hits: &[PeptideHit]) -> Result<Option<(&PeptideHit, u64)>> {
    let mut best: Option<(&PeptideHit, u64)> = None;
    for hit in hits {
        let Some(psm_ref) = hit.psm_ref.as_deref() else {
            log::trace!("skipping peptide hit {} without back-reference", hit.sequence);
            continue;
        };
        let id = match psm_ref.parse::<BackReference>()? {
            BackReference::Decoy(_) => continue,
            BackReference::Target(id) => id,
        };
        match best {
            Some((current, _)) if current.score.total_cmp(&hit.score).is_le() => {}
            _ => best = Some((hit, id)),
        }
    }
    Ok(best)
}

pub struct Assembler<'a> {
    columns: &'a AbundanceColumns,
    psms: FnvHashMap<u64, &'a Psm>,
}

impl<'a> Assembler<'a> {
    pub fn new(columns: &'a AbundanceColumns, psms: &'a [Psm]) -> Self {
        Self {
            columns,
            psms: psms.iter().map(|psm| (psm.id, psm)).collect(),
        }
    }

    /// One record per consensus feature of the ID-mapped map
    pub fn assemble(&self, map: &ConsensusMap) -> Result<Vec<ConsensusRecord>> {
        let mut records = Vec::with_capacity(map.features.len());
        let mut identified = 0;

        for (idx, feature) in map.features.iter().enumerate() {
            let mut abundances = self.columns.row();
            for element in &feature.elements {
                let handle = self.columns.handle(element.map).map_err(|_| {
                    Error::DataJoin(format!(
                        "consensus feature `{}` has an element from map {}, but the run has {} samples",
                        feature.id,
                        element.map,
                        self.columns.len()
                    ))
                })?;
                if element.intensity > 0.0 {
                    abundances.set(handle, element.intensity);
                }
            }

            let mut record = ConsensusRecord {
                id: idx + 1,
                feature_id: feature.id.clone(),
                sequence: None,
                modified_sequence: None,
                accessions: Vec::new(),
                charge: feature.charge,
                mz: feature.mz,
                rt: feature.rt / 60.0,
                quality: feature.quality,
                abundances,
            };

            if let Some((hit, psm_id)) = select_representative(&feature.hits)? {
                let psm = self.psms.get(&psm_id).ok_or_else(|| {
                    Error::DataJoin(format!(
                        "consensus feature `{}` references unknown identification {}",
                        feature.id, psm_id
                    ))
                })?;
                record.sequence = Some(psm.sequence.clone());
                record.modified_sequence = Some(hit.sequence.clone());
                record.accessions = psm.proteins.clone();
                identified += 1;
            }
            records.push(record);
        }

        log::info!(
            "assembled {} consensus features, {} identified",
            records.len(),
            identified
        );
        Ok(records)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::consensus::{ConsensusFeature, SubElement};
    use quickcheck_macros::quickcheck;

    fn hit(score: f64, psm_ref: Option<&str>) -> PeptideHit {
        PeptideHit {
            score,
            sequence: format!("PEPTIDE{}", score),
            charge: 2,
            psm_ref: psm_ref.map(String::from),
        }
    }

    fn psm(id: u64, sequence: &str) -> Psm {
        Psm {
            id,
            sequence: sequence.into(),
            modifications: String::new(),
            proteins: vec![format!("PROT{}", id)],
            filename: "a.mzML".into(),
            charge: 2,
            mz: 500.0,
            rt: 10.0,
            q_value: 0.001,
            pep: 0.01,
            decoy: false,
        }
    }

    fn element(map: usize, intensity: f64) -> SubElement {
        SubElement {
            map,
            id: format!("{}", map),
            rt: 600.0,
            mz: 500.0,
            intensity,
        }
    }

    #[test]
    fn lowest_error_probability_wins() {
        let hits = vec![
            hit(0.2, Some("1")),
            hit(0.001, Some("DECOY_2")),
            hit(0.05, Some("3")),
            hit(0.01, None),
            hit(0.05, Some("4")),
        ];
        let (best, id) = select_representative(&hits).unwrap().unwrap();
        assert_eq!(id, 3);
        assert_eq!(best.score, 0.05);

        let decoys = vec![hit(0.001, Some("DECOY_1"))];
        assert!(select_representative(&decoys).unwrap().is_none());
        assert!(select_representative(&[hit(0.1, Some("x"))]).is_err());
    }

    #[quickcheck]
    fn decoys_are_never_representative(hits: Vec<(f64, bool)>) -> bool {
        let hits = hits
            .iter()
            .enumerate()
            .map(|(i, &(score, decoy))| {
                let psm_ref = match decoy {
                    true => format!("DECOY_{}", i),
                    false => i.to_string(),
                };
                hit(score, Some(&psm_ref))
            })
            .collect::<Vec<_>>();

        match select_representative(&hits).unwrap() {
            Some((best, id)) => {
                let targets = hits
                    .iter()
                    .filter(|h| !h.psm_ref.as_deref().unwrap_or_default().starts_with("DECOY_"));
                !best.psm_ref.as_deref().unwrap_or_default().starts_with("DECOY_")
                    && best.psm_ref.as_deref() == Some(id.to_string().as_str())
                    && targets
                        .into_iter()
                        .all(|h| best.score.total_cmp(&h.score).is_le())
            }
            None => hits.iter().all(|h| {
                h.psm_ref
                    .as_deref()
                    .unwrap_or_default()
                    .starts_with("DECOY_")
            }),
        }
    }

    #[test]
    fn assemble_records() {
        let columns = AbundanceColumns::new(&["a.featureXML", "b.featureXML"]);
        let psms = vec![psm(1, "PEPTIDE"), psm(2, "LESLIEK")];
        let map = ConsensusMap {
            maps: Vec::new(),
            features: vec![
                ConsensusFeature {
                    id: "10".into(),
                    quality: 0.8,
                    charge: 2,
                    rt: 600.0,
                    mz: 500.0,
                    intensity: 3.0,
                    elements: vec![element(0, 1.0), element(1, 2.0)],
                    hits: vec![
                        PeptideHit {
                            score: 0.01,
                            sequence: "PEPT(Phospho)IDE".into(),
                            charge: 2,
                            psm_ref: Some("1".into()),
                        },
                        hit(0.0001, Some("DECOY_2")),
                    ],
                },
                ConsensusFeature {
                    id: "11".into(),
                    rt: 120.0,
                    elements: vec![element(1, 5.0), element(0, 0.0)],
                    ..Default::default()
                },
            ],
        };

        let records = Assembler::new(&columns, &psms).assemble(&map).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, 1);
        assert_eq!(records[0].sequence.as_deref(), Some("PEPTIDE"));
        assert_eq!(records[0].modified_sequence.as_deref(), Some("PEPT(Phospho)IDE"));
        assert_eq!(records[0].accessions, vec!["PROT1"]);
        assert_eq!(records[0].rt, 10.0);
        assert_eq!(records[0].abundances.values(), &[Some(1.0), Some(2.0)]);

        assert_eq!(records[1].id, 2);
        assert_eq!(records[1].sequence, None);
        assert_eq!(records[1].rt, 2.0);
        assert_eq!(records[1].abundances.values(), &[None, Some(5.0)]);
    }

    #[test]
    fn join_failures() {
        let columns = AbundanceColumns::new(&["a.featureXML"]);
        let psms = vec![psm(1, "PEPTIDE")];

        let out_of_run = ConsensusMap {
            maps: Vec::new(),
            features: vec![ConsensusFeature {
                id: "1".into(),
                elements: vec![element(1, 1.0)],
                ..Default::default()
            }],
        };
        assert!(matches!(
            Assembler::new(&columns, &psms).assemble(&out_of_run),
            Err(Error::DataJoin(_))
        ));

        let unknown_psm = ConsensusMap {
            maps: Vec::new(),
            features: vec![ConsensusFeature {
                id: "1".into(),
                elements: vec![element(0, 1.0)],
                hits: vec![hit(0.01, Some("99"))],
                ..Default::default()
            }],
        };
        assert!(matches!(
            Assembler::new(&columns, &psms).assemble(&unknown_psm),
            Err(Error::DataJoin(_))
        ));
    }
}
