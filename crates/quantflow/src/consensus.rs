//! Reading featureXML/consensusXML, and rewriting consensus element
//! retention times

use crate::{Error, IoContext, Result};
use fnv::FnvHashMap;
use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

/// A top-level feature from a per-sample feature file
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Feature {
    /// Unique id, without the `f_` prefix
    pub id: String,
    /// Seconds
    pub rt: f64,
    pub mz: f64,
    pub intensity: f64,
    pub charge: i32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MapEntry {
    pub index: usize,
    pub name: String,
}

/// One grouped element of a consensus feature, i.e. a feature of `map`
#[derive(Clone, Debug, PartialEq)]
pub struct SubElement {
    pub map: usize,
    pub id: String,
    pub rt: f64,
    pub mz: f64,
    pub intensity: f64,
}

/// Peptide hit attached by ID mapping
#[derive(Clone, Debug, PartialEq)]
pub struct PeptideHit {
    /// Error probability; lower is better
    pub score: f64,
    pub sequence: String,
    pub charge: i32,
    pub psm_ref: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConsensusFeature {
    /// Unique id, without the `e_` prefix
    pub id: String,
    pub quality: f64,
    pub charge: i32,
    pub rt: f64,
    pub mz: f64,
    pub intensity: f64,
    pub elements: Vec<SubElement>,
    pub hits: Vec<PeptideHit>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConsensusMap {
    pub maps: Vec<MapEntry>,
    pub features: Vec<ConsensusFeature>,
}

fn strip_id(id: &str) -> &str {
    id.strip_prefix("f_")
        .or_else(|| id.strip_prefix("e_"))
        .unwrap_or(id)
}

fn optional<B>(ev: &BytesStart<'_>, key: &str, reader: &Reader<B>) -> Result<Option<String>> {
    match ev.try_get_attribute(key)? {
        Some(attr) => Ok(Some(attr.decode_and_unescape_value(reader)?.into_owned())),
        None => Ok(None),
    }
}

fn required<B>(ev: &BytesStart<'_>, key: &'static str, reader: &Reader<B>) -> Result<String> {
    optional(ev, key, reader)?.ok_or_else(|| Error::Malformed {
        field: key,
        value: String::from_utf8_lossy(ev.name().as_ref()).into_owned(),
    })
}

fn parse<T: FromStr>(field: &'static str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| Error::Malformed {
        field,
        value: value.into(),
    })
}

fn open(path: &Path) -> Result<Reader<BufReader<std::fs::File>>> {
    let file = std::fs::File::open(path).at(path)?;
    let mut reader = Reader::from_reader(BufReader::new(file));
    reader.trim_text(true);
    Ok(reader)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
/// Which value does the next text event belong to?
enum Field {
    Rt,
    Mz,
    Intensity,
    Charge,
}

/// Read the top-level features of a featureXML file. Subordinate features
/// and convex hulls are skipped.
pub fn read_features<P: AsRef<Path>>(path: P) -> Result<Vec<Feature>> {
    let mut reader = open(path.as_ref())?;
    let mut buf = Vec::new();

    let mut depth = 0usize;
    let mut field = None;
    let mut feature = Feature::default();
    let mut features = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref ev) => match ev.name().as_ref() {
                b"feature" => {
                    depth += 1;
                    if depth == 1 {
                        feature.id = strip_id(&required(ev, "id", &reader)?).to_string();
                    }
                }
                b"position" if depth == 1 => {
                    field = match required(ev, "dim", &reader)?.as_str() {
                        "0" => Some(Field::Rt),
                        "1" => Some(Field::Mz),
                        _ => None,
                    }
                }
                b"intensity" if depth == 1 => field = Some(Field::Intensity),
                b"charge" if depth == 1 => field = Some(Field::Charge),
                _ => {}
            },
            Event::Text(text) => {
                if let Some(f) = field {
                    let text = text.unescape()?;
                    match f {
                        Field::Rt => feature.rt = parse("position", &text)?,
                        Field::Mz => feature.mz = parse("position", &text)?,
                        Field::Intensity => feature.intensity = parse("intensity", &text)?,
                        Field::Charge => feature.charge = parse("charge", &text)?,
                    }
                }
            }
            Event::End(ref ev) => {
                field = None;
                if ev.name().as_ref() == b"feature" {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        features.push(std::mem::take(&mut feature));
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    log::trace!(
        "read {} features from {}",
        features.len(),
        path.as_ref().display()
    );
    Ok(features)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
/// Which tag are we inside?
enum State {
    Element,
    PeptideHit,
}

fn sub_element<B>(ev: &BytesStart<'_>, reader: &Reader<B>) -> Result<SubElement> {
    Ok(SubElement {
        map: parse("map", &required(ev, "map", reader)?)?,
        id: strip_id(&required(ev, "id", reader)?).to_string(),
        rt: parse("rt", &required(ev, "rt", reader)?)?,
        mz: parse("mz", &required(ev, "mz", reader)?)?,
        intensity: parse("it", &required(ev, "it", reader)?)?,
    })
}

fn peptide_hit<B>(ev: &BytesStart<'_>, reader: &Reader<B>) -> Result<PeptideHit> {
    Ok(PeptideHit {
        score: parse("score", &required(ev, "score", reader)?)?,
        sequence: required(ev, "sequence", reader)?,
        charge: optional(ev, "charge", reader)?
            .map(|c| parse("charge", &c))
            .transpose()?
            .unwrap_or_default(),
        psm_ref: None,
    })
}

/// Read a consensusXML file, including any peptide hits attached by ID mapping
pub fn read_consensus<P: AsRef<Path>>(path: P) -> Result<ConsensusMap> {
    let mut reader = open(path.as_ref())?;
    let mut buf = Vec::new();

    let mut state = None;
    let mut map = ConsensusMap::default();
    let mut feature = ConsensusFeature::default();
    let mut hit: Option<PeptideHit> = None;

    loop {
        let event = reader.read_event_into(&mut buf)?;
        let empty = matches!(event, Event::Empty(_));
        match event {
            Event::Start(ref ev) | Event::Empty(ref ev) => match ev.name().as_ref() {
                b"map" => map.maps.push(MapEntry {
                    index: parse("map", &required(ev, "id", &reader)?)?,
                    name: optional(ev, "name", &reader)?.unwrap_or_default(),
                }),
                b"consensusElement" => {
                    state = Some(State::Element);
                    feature.id = strip_id(&required(ev, "id", &reader)?).to_string();
                    feature.quality = optional(ev, "quality", &reader)?
                        .map(|q| parse("quality", &q))
                        .transpose()?
                        .unwrap_or_default();
                    feature.charge = optional(ev, "charge", &reader)?
                        .map(|c| parse("charge", &c))
                        .transpose()?
                        .unwrap_or_default();
                }
                b"centroid" if state == Some(State::Element) => {
                    feature.rt = parse("rt", &required(ev, "rt", &reader)?)?;
                    feature.mz = parse("mz", &required(ev, "mz", &reader)?)?;
                    feature.intensity = parse("it", &required(ev, "it", &reader)?)?;
                }
                b"element" if state == Some(State::Element) => {
                    feature.elements.push(sub_element(ev, &reader)?);
                }
                b"PeptideHit" if state == Some(State::Element) => {
                    let h = peptide_hit(ev, &reader)?;
                    if empty {
                        feature.hits.push(h);
                    } else {
                        hit = Some(h);
                        state = Some(State::PeptideHit);
                    }
                }
                b"UserParam" if state == Some(State::PeptideHit) => {
                    if optional(ev, "name", &reader)?.as_deref() == Some("psm_ref") {
                        if let Some(h) = hit.as_mut() {
                            h.psm_ref = optional(ev, "value", &reader)?;
                        }
                    }
                }
                _ => {}
            },
            Event::End(ref ev) => match ev.name().as_ref() {
                b"PeptideHit" if state == Some(State::PeptideHit) => {
                    feature.hits.extend(hit.take());
                    state = Some(State::Element);
                }
                b"consensusElement" => {
                    map.features.push(std::mem::take(&mut feature));
                    state = None;
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    log::trace!(
        "read {} consensus features over {} maps from {}",
        map.features.len(),
        map.maps.len(),
        path.as_ref().display()
    );
    Ok(map)
}

/// Copy `consensus` to `output`, replacing the retention time of every
/// grouped element with the value of the matching feature in
/// `feature_files[element.map]`.
///
/// Returns the number of elements rewritten. A feature that has no element
/// in the consensus file is an error.
pub fn restore_retention_times<P: AsRef<Path>>(
    consensus: &Path,
    feature_files: &[P],
    output: &Path,
) -> Result<usize> {
    let mut original: FnvHashMap<(usize, String), f64> = FnvHashMap::default();
    for (map, path) in feature_files.iter().enumerate() {
        for feature in read_features(path)? {
            original.insert((map, feature.id), feature.rt);
        }
    }

    let linked = read_consensus(consensus)?;
    for element in linked.features.iter().flat_map(|f| &f.elements) {
        if element.map >= feature_files.len() {
            return Err(Error::DataJoin(format!(
                "consensus element `{}` refers to map {}, but only {} feature files were supplied",
                element.id,
                element.map,
                feature_files.len()
            )));
        }
    }
    let indexed = linked
        .features
        .iter()
        .flat_map(|f| &f.elements)
        .map(|e| (e.map, e.id.as_str()))
        .collect::<fnv::FnvHashSet<_>>();
    if let Some((map, id)) = original
        .keys()
        .find(|(map, id)| !indexed.contains(&(*map, id.as_str())))
    {
        return Err(Error::DataJoin(format!(
            "feature `{}` of {} has no element in {}",
            id,
            feature_files[*map].as_ref().display(),
            consensus.display()
        )));
    }

    let file = std::fs::File::open(consensus).at(consensus)?;
    let mut reader = Reader::from_reader(BufReader::new(file));
    let out = std::fs::File::create(output).at(output)?;
    let mut writer = Writer::new(BufWriter::new(out));
    let mut buf = Vec::new();
    let mut rewritten = 0;

    loop {
        let event = reader.read_event_into(&mut buf)?;
        match event {
            Event::Eof => break,
            Event::Start(ref ev) | Event::Empty(ref ev) if ev.name().as_ref() == b"element" => {
                let map = parse::<usize>("map", &required(ev, "map", &reader)?)?;
                let id = required(ev, "id", &reader)?;
                let key = (map, strip_id(&id).to_string());
                let mut patched = BytesStart::new("element");
                for attr in ev.attributes() {
                    let attr = attr?;
                    let is_rt = attr.key.as_ref() == b"rt";
                    match original.get(&key) {
                        Some(rt) if is_rt => {
                            patched.push_attribute(("rt", rt.to_string().as_str()));
                            rewritten += 1;
                        }
                        _ => patched.push_attribute(attr),
                    }
                }
                match event {
                    Event::Empty(_) => writer.write_event(Event::Empty(patched))?,
                    _ => writer.write_event(Event::Start(patched))?,
                }
            }
            ev => writer.write_event(ev)?,
        }
        buf.clear();
    }
    writer.into_inner().flush().at(output)?;

    log::info!(
        "restored original retention times of {} consensus elements",
        rewritten
    );
    Ok(rewritten)
}
