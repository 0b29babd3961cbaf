// Pipeline execution core: step configuration, compiled runners, and the
// executor that routes record batches between them.

pub mod executor;
pub mod model;
pub mod runner;
pub mod script;
pub mod step;

use crate::error::{Result, ServingError};
use crate::record::Record;

/// An ordered record batch with the input/output names it is aligned to.
///
/// Positional alignment between records and declared step names is part of
/// the step contract, so the names travel with the batch and are validated
/// at every step boundary instead of being inferred from declaration order.
#[derive(Debug, Clone)]
pub struct Batch {
    names: Vec<String>,
    records: Vec<Record>,
}

impl Batch {
    pub fn new(names: Vec<String>, records: Vec<Record>) -> Result<Self> {
        if names.len() != records.len() {
            return Err(ServingError::CardinalityMismatch(format!(
                "batch has {} records but {} names",
                records.len(),
                names.len()
            )));
        }
        Ok(Batch { names, records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_parts(self) -> (Vec<String>, Vec<Record>) {
        (self.names, self.records)
    }

    /// The record aligned to `name`, if present.
    pub fn record_for(&self, name: &str) -> Option<&Record> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| &self.records[i])
    }
}
