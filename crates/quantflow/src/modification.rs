//! Translate positional modification annotations (`T4(Phospho); N-Term(Acetyl)`)
//! into the inline bracket notation understood by the OpenMS tools
//! (`(Acetyl)PEPT(Phospho)IDE`).

use std::{
    fmt::{Display, Write},
    str::FromStr,
};

/// Residues that are never treated as placeholders
pub const VALID_AA: [u8; 22] = [
    b'A', b'C', b'D', b'E', b'F', b'G', b'H', b'I', b'K', b'L', b'M', b'N', b'P', b'Q', b'R', b'S',
    b'T', b'V', b'W', b'Y', b'U', b'O',
];

const PROTEIN_QUALIFIER: &str = "(Prot)";
const N_TERM: &str = "N-Term";
const C_TERM: &str = "C-Term";

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Site {
    NTerm,
    CTerm,
    /// `position` is 1-based
    Residue { residue: u8, position: usize },
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ModificationTag {
    pub site: Site,
    pub name: String,
    /// Tag carried a `(Prot)` qualifier, i.e. protein rather than peptide terminus
    pub protein_terminal: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidModification {
    #[error("empty modification tag")]
    Empty,
    #[error("malformed modification tag `{0}`")]
    Malformed(String),
    #[error("modification `{tag}` is outside of a sequence of length {length}")]
    OutOfRange { tag: String, length: usize },
    #[error("modification at position {position} follows position {previous}; tags must be in ascending order")]
    Unordered { previous: usize, position: usize },
    #[error("sequence `{0}` contains non-ASCII characters")]
    NonAscii(String),
}

impl ModificationTag {
    /// `X3(L)`: an ambiguous residue resolved to a concrete amino acid,
    /// not a real modification
    fn substitution(&self) -> Option<(usize, u8)> {
        match self.site {
            Site::Residue { residue, position }
                if !VALID_AA.contains(&residue)
                    && self.name.len() == 1
                    && VALID_AA.contains(&self.name.as_bytes()[0]) =>
            {
                Some((position, self.name.as_bytes()[0]))
            }
            _ => None,
        }
    }
}

impl Display for ModificationTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.site {
            Site::NTerm => f.write_str(N_TERM)?,
            Site::CTerm => f.write_str(C_TERM)?,
            Site::Residue { residue, position } => {
                f.write_char(residue as char)?;
                write!(f, "{}", position)?;
            }
        }
        if self.protein_terminal {
            f.write_str(PROTEIN_QUALIFIER)?;
        }
        write!(f, "({})", self.name)
    }
}

/// Text between the first `(` and the final `)`, so names such as
/// `Label:13C(6)` survive intact
fn parenthesized(s: &str) -> Option<&str> {
    s.strip_prefix('(')?
        .strip_suffix(')')
        .filter(|name| !name.is_empty())
}

impl FromStr for ModificationTag {
    type Err = InvalidModification;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(InvalidModification::Empty);
        }
        let protein_terminal = trimmed.contains(PROTEIN_QUALIFIER);
        let tag = trimmed.replace(PROTEIN_QUALIFIER, "");
        let malformed = || InvalidModification::Malformed(trimmed.to_string());

        let (site, rest) = if let Some(rest) = tag.strip_prefix(N_TERM) {
            (Site::NTerm, rest)
        } else if let Some(rest) = tag.strip_prefix(C_TERM) {
            (Site::CTerm, rest)
        } else {
            let residue = *tag.as_bytes().first().ok_or_else(malformed)?;
            if !residue.is_ascii_uppercase() {
                return Err(malformed());
            }
            let digits = tag[1..]
                .bytes()
                .take_while(|b| b.is_ascii_digit())
                .count();
            let position = tag[1..1 + digits].parse::<usize>().map_err(|_| malformed())?;
            if position == 0 {
                return Err(malformed());
            }
            (Site::Residue { residue, position }, &tag[1 + digits..])
        };

        let name = parenthesized(rest).ok_or_else(malformed)?;
        Ok(ModificationTag {
            site,
            name: name.to_string(),
            protein_terminal,
        })
    }
}

/// Parse a `;`-delimited modification list. Empty entries are skipped.
pub fn parse_tags(modifications: &str) -> Result<Vec<ModificationTag>, InvalidModification> {
    modifications
        .split(';')
        .filter(|s| !s.trim().is_empty())
        .map(str::parse)
        .collect()
}

/// Translate a sequence plus its `;`-delimited modification list into
/// bracket notation. See [`translate_tags`].
pub fn translate(sequence: &str, modifications: &str) -> Result<String, InvalidModification> {
    translate_tags(sequence, &parse_tags(modifications)?)
}

/// Inline modifications into `sequence`.
///
/// Residue tags must be ordered by ascending position; a decreasing position
/// is rejected rather than producing a scrambled string. Placeholder tags
/// (`X3(L)`) replace the residue and emit no annotation.
pub fn translate_tags(
    sequence: &str,
    tags: &[ModificationTag],
) -> Result<String, InvalidModification> {
    if tags.is_empty() {
        return Ok(sequence.to_string());
    }
    if !sequence.is_ascii() {
        return Err(InvalidModification::NonAscii(sequence.into()));
    }

    let length = sequence.len();
    let out_of_range = |tag: &ModificationTag| InvalidModification::OutOfRange {
        tag: tag.to_string(),
        length,
    };

    let mut working = sequence.as_bytes().to_vec();
    let mut remaining = Vec::with_capacity(tags.len());
    for tag in tags {
        match tag.substitution() {
            Some((position, aa)) => {
                if position > length {
                    return Err(out_of_range(tag));
                }
                working[position - 1] = aa;
            }
            None => remaining.push(tag),
        }
    }
    let working = String::from_utf8(working)
        .map_err(|_| InvalidModification::NonAscii(sequence.into()))?;

    let mut nterm = String::new();
    let mut cterm = String::new();
    let mut body = String::with_capacity(length + 16 * remaining.len());
    let mut cut = 0;

    for tag in remaining {
        match tag.site {
            Site::NTerm => write!(nterm, "({})", tag.name).expect("infallible"),
            Site::CTerm => write!(cterm, "({})", tag.name).expect("infallible"),
            Site::Residue { position, .. } => {
                if position > length {
                    return Err(out_of_range(tag));
                }
                if position < cut {
                    return Err(InvalidModification::Unordered {
                        previous: cut,
                        position,
                    });
                }
                body.push_str(&working[cut..position]);
                write!(body, "({})", tag.name).expect("infallible");
                cut = position;
            }
        }
    }
    body.push_str(&working[cut..]);

    Ok(format!("{}{}{}", nterm, body, cterm))
}

/// Remove every parenthesized annotation, handling nested parentheses
pub fn strip_modifications(modified: &str) -> String {
    let mut depth = 0usize;
    modified
        .chars()
        .filter(|&c| match c {
            '(' => {
                depth += 1;
                false
            }
            ')' => {
                depth = depth.saturating_sub(1);
                false
            }
            _ => depth == 0,
        })
        .collect()
}
