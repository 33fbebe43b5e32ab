use crate::assembly::ConsensusRecord;
use crate::columns::AbundanceColumns;
use crate::quant::{PeptideAbundance, ProteinAbundance};
use crate::Result;
use serde::Serialize;

/// Everything a successful run publishes
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QuantResults {
    pub columns: AbundanceColumns,
    pub consensus: Vec<ConsensusRecord>,
    pub peptides: Vec<PeptideAbundance>,
    pub proteins: Vec<ProteinAbundance>,
}

/// Destination for quantification results. Called at most once per run,
/// and only after every stage has succeeded.
pub trait QuantSink {
    fn publish(&mut self, results: QuantResults) -> Result<()>;
}

impl QuantSink for Option<QuantResults> {
    fn publish(&mut self, results: QuantResults) -> Result<()> {
        *self = Some(results);
        Ok(())
    }
}
