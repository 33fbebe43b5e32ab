pub mod assembly;
pub mod columns;
pub mod consensus;
pub mod identification;
pub mod modification;
pub mod params;
pub mod quant;
pub mod sink;
pub mod tool;

use std::path::{Path, PathBuf};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The process could not be started (or waited on)
    #[error("failed to run `{tool}`: {source}")]
    ToolLaunch {
        tool: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{tool}` failed with exit code {}", .code.map(|c| c.to_string()).unwrap_or_else(|| "<terminated by signal>".into()))]
    ToolExit { tool: String, code: Option<i32> },
    #[error("I/O error on `{}`: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid input: {0}")]
    InputContract(String),
    #[error("inconsistent tool output: {0}")]
    DataJoin(String),
    #[error("unknown parameter `{path}` in `{}`", .file.display())]
    UnknownParameter { path: String, file: PathBuf },
    #[error("parameter `{path}` matches {matches} entries in `{}`, use a longer path", .file.display())]
    AmbiguousParameter {
        path: String,
        matches: usize,
        file: PathBuf,
    },
    #[error("malformed value `{value}` for `{field}`")]
    Malformed { field: &'static str, value: String },
    #[error(transparent)]
    Modification(#[from] modification::InvalidModification),
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("XML attribute error: {0}")]
    XmlAttribute(#[from] quick_xml::events::attributes::AttrError),
    #[error("XML serialization error: {0}")]
    XmlSerialize(#[from] quick_xml::DeError),
    #[error("TSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Attach the offending path to a bare [`std::io::Error`]
pub trait IoContext<T> {
    fn at<P: AsRef<Path>>(self, path: P) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at<P: AsRef<Path>>(self, path: P) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.as_ref().to_path_buf(),
            source,
        })
    }
}

pub fn read_json<P, T>(path: P) -> Result<T>
where
    P: AsRef<Path>,
    T: for<'de> serde::Deserialize<'de>,
{
    let contents = std::fs::read_to_string(path.as_ref()).at(path.as_ref())?;
    Ok(serde_json::from_str(&contents)?)
}
