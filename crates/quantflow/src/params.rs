//! Tool parameter documents (OpenMS `.ini` XML).
//!
//! A document is generated by the tool itself (`-write_ini`), loaded into a
//! small element tree, patched and written back. Parameters are addressed
//! with `:`-separated paths which are matched against the trailing
//! components of every `ITEM`/`ITEMLIST` path, so `threads` and
//! `algorithm:distance_RT:max_difference` both work as long as they
//! identify exactly one entry.

use crate::{Error, IoContext, Result};
use encoding_rs::{Encoding, UTF_8};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

const NODE: &str = "NODE";
const ITEM: &str = "ITEM";
const ITEMLIST: &str = "ITEMLIST";
const LISTITEM: &str = "LISTITEM";

#[derive(Clone, Debug, Default, PartialEq)]
struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<Element>,
}

impl Element {
    fn from_start<B>(ev: &BytesStart<'_>, reader: &Reader<B>) -> Result<Self> {
        let decoder = reader.decoder();
        let mut attributes = Vec::new();
        for attr in ev.attributes() {
            let attr = attr?;
            attributes.push((
                decoder.decode(attr.key.as_ref())?.into_owned(),
                attr.decode_and_unescape_value(reader)?.into_owned(),
            ));
        }
        Ok(Element {
            name: decoder.decode(ev.name().as_ref())?.into_owned(),
            attributes,
            children: Vec::new(),
        })
    }

    fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn set_attr(&mut self, key: &str, value: String) {
        match self.attributes.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => self.attributes.push((key.into(), value)),
        }
    }

    fn write<W: Write>(&self, writer: &mut Writer<W>) -> Result<()> {
        let mut start = BytesStart::new(self.name.as_str());
        for (k, v) in &self.attributes {
            start.push_attribute((k.as_str(), v.as_str()));
        }
        if self.children.is_empty() {
            writer.write_event(Event::Empty(start))?;
        } else {
            writer.write_event(Event::Start(start))?;
            for child in &self.children {
                child.write(writer)?;
            }
            writer.write_event(Event::End(BytesEnd::new(self.name.as_str())))?;
        }
        Ok(())
    }

    /// Collect child-index routes to every `tag` element whose section path
    /// ends with `path`
    fn locate<'a>(
        &'a self,
        tag: &str,
        path: &[&str],
        sections: &mut Vec<&'a str>,
        route: &mut Vec<usize>,
        found: &mut Vec<Vec<usize>>,
    ) {
        for (ix, child) in self.children.iter().enumerate() {
            route.push(ix);
            if child.name == NODE {
                sections.push(child.attr("name").unwrap_or_default());
                child.locate(tag, path, sections, route, found);
                sections.pop();
            } else if child.name == tag {
                let name = child.attr("name").unwrap_or_default();
                let (last, parents) = path.split_last().expect("paths are never empty");
                if name == *last
                    && sections.len() >= parents.len()
                    && sections[sections.len() - parents.len()..] == *parents
                {
                    found.push(route.clone());
                }
            }
            route.pop();
        }
    }
}

/// The XML declaration of a document, kept so a save writes the file back
/// in the encoding it was read in
#[derive(Clone, Debug)]
struct Declaration {
    version: String,
    label: Option<String>,
    standalone: Option<String>,
    encoding: &'static Encoding,
}

impl Default for Declaration {
    fn default() -> Self {
        Declaration {
            version: "1.0".into(),
            label: Some("UTF-8".into()),
            standalone: None,
            encoding: UTF_8,
        }
    }
}

impl Declaration {
    fn from_decl(decl: &BytesDecl<'_>, encoding: &'static Encoding) -> Result<Self> {
        let text = |bytes: &[u8]| String::from_utf8_lossy(bytes).into_owned();
        Ok(Declaration {
            version: text(&decl.version()?),
            label: decl.encoding().transpose()?.map(|b| text(&b)),
            standalone: decl.standalone().transpose()?.map(|b| text(&b)),
            encoding,
        })
    }
}

/// A loaded parameter document. Every mutation is written back to disk
/// before returning.
#[derive(Clone, Debug)]
pub struct ParameterDocument {
    path: PathBuf,
    declaration: Declaration,
    root: Element,
}

impl ParameterDocument {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).at(path)?;
        let mut reader = Reader::from_reader(BufReader::new(file));
        reader.trim_text(true);

        let mut buf = Vec::new();
        let mut stack: Vec<Element> = Vec::new();
        let mut root = None;
        let mut declaration = None;

        loop {
            let finished = match reader.read_event_into(&mut buf)? {
                Event::Decl(ref decl) => {
                    declaration = Some(Declaration::from_decl(
                        decl,
                        reader.decoder().encoding(),
                    )?);
                    None
                }
                Event::Start(ref ev) => {
                    stack.push(Element::from_start(ev, &reader)?);
                    None
                }
                Event::Empty(ref ev) => Some(Element::from_start(ev, &reader)?),
                Event::End(_) => Some(stack.pop().ok_or_else(|| Error::Malformed {
                    field: "parameter document",
                    value: path.display().to_string(),
                })?),
                Event::Eof => break,
                _ => None,
            };
            if let Some(element) = finished {
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = Some(element),
                }
            }
            buf.clear();
        }

        let root = root.ok_or_else(|| Error::Malformed {
            field: "parameter document",
            value: path.display().to_string(),
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            declaration: declaration.unwrap_or_default(),
            root,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self) -> Result<()> {
        let decl = &self.declaration;
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new(
            &decl.version,
            decl.label.as_deref(),
            decl.standalone.as_deref(),
        )))?;
        self.root.write(&mut writer)?;
        let text = String::from_utf8_lossy(writer.get_ref());

        // characters the declared encoding cannot hold become numeric references
        let (bytes, _, _) = decl.encoding.encode(&text);
        let file = std::fs::File::create(&self.path).at(&self.path)?;
        let mut out = BufWriter::new(file);
        out.write_all(&bytes).at(&self.path)?;
        out.flush().at(&self.path)
    }

    fn route(&self, tag: &str, path: &str) -> Result<Vec<usize>> {
        let components = path.split(':').collect::<Vec<_>>();
        if components.iter().any(|c| c.is_empty()) {
            return Err(Error::UnknownParameter {
                path: path.into(),
                file: self.path.clone(),
            });
        }

        let mut found = Vec::new();
        self.root
            .locate(tag, &components, &mut Vec::new(), &mut Vec::new(), &mut found);

        match found.len() {
            0 => Err(Error::UnknownParameter {
                path: path.into(),
                file: self.path.clone(),
            }),
            1 => Ok(found.pop().expect("length checked")),
            matches => Err(Error::AmbiguousParameter {
                path: path.into(),
                matches,
                file: self.path.clone(),
            }),
        }
    }

    fn element(&self, route: &[usize]) -> &Element {
        route.iter().fold(&self.root, |el, &ix| &el.children[ix])
    }

    fn element_mut(&mut self, route: &[usize]) -> &mut Element {
        route
            .iter()
            .fold(&mut self.root, |el, &ix| &mut el.children[ix])
    }

    /// Current value of a scalar parameter
    pub fn get(&self, path: &str) -> Result<&str> {
        let route = self.route(ITEM, path)?;
        Ok(self.element(&route).attr("value").unwrap_or_default())
    }

    /// Current entries of a list parameter
    pub fn get_list(&self, path: &str) -> Result<Vec<&str>> {
        let route = self.route(ITEMLIST, path)?;
        Ok(self
            .element(&route)
            .children
            .iter()
            .filter(|c| c.name == LISTITEM)
            .filter_map(|c| c.attr("value"))
            .collect())
    }

    /// Overwrite the value of the scalar parameter at `path`
    pub fn set_scalar<V: Display>(&mut self, path: &str, value: V) -> Result<()> {
        let route = self.route(ITEM, path)?;
        let value = value.to_string();
        log::trace!("{}: {} = {}", self.path.display(), path, value);
        self.element_mut(&route).set_attr("value", value);
        self.save()
    }

    /// Overwrite `name` only where it lives directly inside `section`
    pub fn set_nested<V: Display>(&mut self, section: &str, name: &str, value: V) -> Result<()> {
        self.set_scalar(&format!("{}:{}", section, name), value)
    }

    /// Append `values` to the list parameter at `path`, removing the
    /// existing entries first if `clear_first` is set
    pub fn set_list<I, V>(&mut self, path: &str, values: I, clear_first: bool) -> Result<()>
    where
        I: IntoIterator<Item = V>,
        V: Display,
    {
        let route = self.route(ITEMLIST, path)?;
        let list = route
            .iter()
            .fold(&mut self.root, |el, &ix| &mut el.children[ix]);
        if clear_first {
            list.children.retain(|c| c.name != LISTITEM);
        }
        for value in values {
            list.children.push(Element {
                name: LISTITEM.into(),
                attributes: vec![("value".into(), value.to_string())],
                children: Vec::new(),
            });
        }
        log::trace!(
            "{}: {} = {:?}",
            self.path.display(),
            path,
            list.children
                .iter()
                .filter_map(|c| c.attr("value"))
                .collect::<Vec<_>>()
        );
        self.save()
    }

    /// Set the paired m/z (always ppm) and retention time (given in minutes,
    /// written in seconds) distance thresholds used by the aligner and linker
    pub fn set_thresholds(&mut self, mz_tolerance_ppm: f64, rt_tolerance_min: f64) -> Result<()> {
        self.set_scalar("distance_MZ:max_difference", mz_tolerance_ppm)?;
        self.set_scalar("distance_MZ:unit", "ppm")?;
        self.set_scalar("distance_RT:max_difference", rt_tolerance_min * 60.0)
    }

    /// Apply user supplied `path -> value` overrides
    pub fn apply_overrides(&mut self, overrides: &BTreeMap<String, String>) -> Result<()> {
        for (path, value) in overrides {
            self.set_scalar(path, value)?;
        }
        Ok(())
    }
}

/// Parse the bracketed list syntax used for multiplex labels, e.g.
/// `[][Lys8,Arg10]` → `[[], ["Lys8", "Arg10"]]`
pub fn parse_bracketed_list(s: &str) -> Result<Vec<Vec<String>>> {
    let malformed = |why: &str| {
        Error::InputContract(format!("malformed bracketed list `{}`: {}", s, why))
    };

    let mut groups = Vec::new();
    let mut rest = s.trim();
    if rest.is_empty() {
        return Err(malformed("empty"));
    }
    while !rest.is_empty() {
        let inner = rest
            .strip_prefix('[')
            .ok_or_else(|| malformed("expected `[`"))?;
        let close = inner
            .find(']')
            .ok_or_else(|| malformed("unterminated `[`"))?;
        let group = &inner[..close];
        if group.contains('[') {
            return Err(malformed("nested `[`"));
        }
        let entries = group
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(String::from)
            .collect::<Vec<_>>();
        if entries.is_empty() && !group.trim().is_empty() {
            return Err(malformed("empty entry"));
        }
        groups.push(entries);
        rest = inner[close + 1..].trim_start();
    }
    Ok(groups)
}

#[cfg(test)]
mod test {
    use super::*;

    const LINKER_INI: &str = r#"<?xml version="1.0" encoding="ISO-8859-1"?>
<PARAMETERS version="1.7.0" xsi:noNamespaceSchemaLocation="https://raw.githubusercontent.com/OpenMS/OpenMS/develop/share/OpenMS/SCHEMAS/Param_1_7_0.xsd" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
  <NODE name="FeatureLinkerUnlabeledQT" description="Groups corresponding features from multiple maps.">
    <ITEM name="version" value="3.1.0" type="string" description="Version of the tool that generated this parameters file." required="false" advanced="true" />
    <NODE name="1" description="Instance &apos;1&apos; section for &apos;FeatureLinkerUnlabeledQT&apos;">
      <ITEMLIST name="in" type="input-file" description="input files separated by blanks" required="true" advanced="false" supported_formats="*.featureXML,*.consensusXML" />
      <ITEM name="out" value="" type="output-file" description="Output file" required="true" advanced="false" supported_formats="*.consensusXML" />
      <ITEM name="threads" value="1" type="int" description="Sets the number of threads allowed to be used by the TOPP tool" required="false" advanced="false" />
      <NODE name="algorithm" description="Algorithm parameters section">
        <NODE name="distance_RT" description="Distance component based on RT differences">
          <ITEM name="max_difference" value="100.0" type="double" description="Never pair features with a larger RT distance (in seconds)." required="false" advanced="false" />
        </NODE>
        <NODE name="distance_MZ" description="Distance component based on m/z differences">
          <ITEM name="max_difference" value="0.3" type="double" description="Never pair features with larger m/z distance (unit defined by &apos;unit&apos;)" required="false" advanced="false" />
          <ITEM name="unit" value="Da" type="string" description="Unit of the &apos;max_difference&apos; parameter" required="false" advanced="false" restrictions="Da,ppm" />
        </NODE>
      </NODE>
    </NODE>
  </NODE>
</PARAMETERS>
"#;

    fn document(dir: &tempfile::TempDir) -> ParameterDocument {
        let path = dir.path().join("linker.ini");
        std::fs::write(&path, LINKER_INI).unwrap();
        ParameterDocument::load(&path).unwrap()
    }

    #[test]
    fn scalar_by_unique_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = document(&dir);
        assert_eq!(doc.get("threads").unwrap(), "1");
        doc.set_scalar("threads", 8).unwrap();
        doc.set_scalar("out", "linked.consensusXML").unwrap();

        let reloaded = ParameterDocument::load(doc.path()).unwrap();
        assert_eq!(reloaded.get("threads").unwrap(), "8");
        assert_eq!(reloaded.get("1:out").unwrap(), "linked.consensusXML");
        assert_eq!(
            reloaded.get("version").unwrap(),
            "3.1.0",
            "untouched values survive the round trip"
        );
    }

    #[test]
    fn keeps_declared_encoding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linker.ini");
        let text = LINKER_INI.replacen(
            r#"<ITEM name="out""#,
            "<ITEM name=\"label\" value=\"5 \u{b5}m\" type=\"string\" />\n      <ITEM name=\"out\"",
            1,
        );
        let latin1 = text
            .chars()
            .map(|c| u8::try_from(u32::from(c)).unwrap())
            .collect::<Vec<u8>>();
        assert!(latin1.contains(&0xB5));
        std::fs::write(&path, latin1).unwrap();

        let mut doc = ParameterDocument::load(&path).unwrap();
        assert_eq!(doc.get("label").unwrap(), "5 µm");
        doc.set_scalar("label", "10 µm").unwrap();

        let raw = std::fs::read(&path).unwrap();
        assert!(raw.starts_with(br#"<?xml version="1.0" encoding="ISO-8859-1"?>"#));
        assert!(raw.contains(&0xB5));
        assert!(
            !raw.windows(2).any(|w| w == [0xC2, 0xB5]),
            "written back as UTF-8"
        );
        let reloaded = ParameterDocument::load(&path).unwrap();
        assert_eq!(reloaded.get("label").unwrap(), "10 µm");
        assert_eq!(reloaded.get("threads").unwrap(), "1");
    }

    #[test]
    fn shared_names_require_a_section() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = document(&dir);
        match doc.set_scalar("max_difference", 5.0) {
            Err(Error::AmbiguousParameter { matches, .. }) => assert_eq!(matches, 2),
            other => panic!("expected ambiguity, got {:?}", other),
        }
        doc.set_nested("distance_RT", "max_difference", 42.0).unwrap();
        assert_eq!(doc.get("distance_RT:max_difference").unwrap(), "42");
        assert_eq!(doc.get("distance_MZ:max_difference").unwrap(), "0.3");
    }

    #[test]
    fn never_invents_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = document(&dir);
        assert!(matches!(
            doc.set_scalar("does_not_exist", 1),
            Err(Error::UnknownParameter { .. })
        ));
        // `in` is a list, not a scalar
        assert!(matches!(
            doc.set_scalar("in", "a.featureXML"),
            Err(Error::UnknownParameter { .. })
        ));
        assert!(matches!(
            doc.set_scalar("distance_MZ:", 1),
            Err(Error::UnknownParameter { .. })
        ));
    }

    #[test]
    fn list_append_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = document(&dir);
        assert!(doc.get_list("in").unwrap().is_empty());

        doc.set_list("in", ["a.featureXML", "b.featureXML"], false)
            .unwrap();
        doc.set_list("in", ["c.featureXML"], false).unwrap();
        assert_eq!(
            ParameterDocument::load(doc.path())
                .unwrap()
                .get_list("in")
                .unwrap(),
            vec!["a.featureXML", "b.featureXML", "c.featureXML"]
        );

        doc.set_list("in", ["d.featureXML"], true).unwrap();
        assert_eq!(doc.get_list("in").unwrap(), vec!["d.featureXML"]);
    }

    #[test]
    fn thresholds() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = document(&dir);
        doc.set_thresholds(10.0, 1.5).unwrap();
        let doc = ParameterDocument::load(doc.path()).unwrap();
        assert_eq!(doc.get("distance_MZ:max_difference").unwrap(), "10");
        assert_eq!(doc.get("distance_MZ:unit").unwrap(), "ppm");
        assert_eq!(doc.get("distance_RT:max_difference").unwrap(), "90");
    }

    #[test]
    fn overrides() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = document(&dir);
        let mut overrides = BTreeMap::new();
        overrides.insert("algorithm:distance_MZ:unit".to_string(), "Da".to_string());
        doc.apply_overrides(&overrides).unwrap();
        assert_eq!(doc.get("unit").unwrap(), "Da");

        overrides.insert("bogus".to_string(), "1".to_string());
        assert!(doc.apply_overrides(&overrides).is_err());
    }

    #[test]
    fn escaped_attributes_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = document(&dir);
        doc.set_scalar("out", "a&b <c>.consensusXML").unwrap();
        let doc = ParameterDocument::load(doc.path()).unwrap();
        assert_eq!(doc.get("out").unwrap(), "a&b <c>.consensusXML");
    }

    #[test]
    fn bracketed_lists() {
        assert_eq!(parse_bracketed_list("[]").unwrap(), vec![Vec::<String>::new()]);
        assert_eq!(
            parse_bracketed_list("[][Lys8, Arg10]").unwrap(),
            vec![vec![], vec!["Lys8".to_string(), "Arg10".to_string()]]
        );
        assert_eq!(
            parse_bracketed_list(" [Lys4] [Lys8,Arg10] ").unwrap().len(),
            2
        );
        for bad in ["", "Lys8", "[Lys8", "[[Lys8]]", "[Lys8]x", "[,]"] {
            assert!(
                matches!(parse_bracketed_list(bad), Err(Error::InputContract(_))),
                "{} should be rejected",
                bad
            );
        }
    }
}
