//! Multi-year panel of recovered fundamentals with per-row convergence diagnostics.
//!
//! Every value handed to a consumer travels with its convergence flag. Years that
//! failed, and locations left out of a year, still produce rows; they carry no
//! productivity or amenity, but they do carry the reason.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::data::{Exclusion, LocationLabel, Year, YearInput};
use crate::error::{ErrorKind, InversionError, Result};
use crate::normalize::NormalizedEquilibrium;
use crate::solving::ConvergenceRecord;

/// How a panel row came to be.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RowStatus {
    /// The year converged; values are present.
    Converged,
    /// The location took part in a run that failed.
    Failed,
    /// The location was left out of the run.
    Excluded,
}

/// One `(location, year)` row.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PanelRow {
    pub location_id: String,
    pub location_name: Option<String>,
    pub year: Year,
    pub productivity: Option<f64>,
    pub amenity: Option<f64>,
    pub converged: bool,
    pub iterations: usize,
    pub final_residual: Option<f64>,
    pub status: RowStatus,
    pub error: Option<ErrorKind>,
    pub diagnostic: Option<String>,
}

/// Year-level diagnostics, present for every requested year.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct YearSummary {
    pub year: Year,
    pub record: ConvergenceRecord,
    pub reference: Option<String>,
    pub locations: usize,
    pub excluded: usize,
    pub error: Option<ErrorKind>,
    pub diagnostic: Option<String>,
}

/// Everything the assembler needs to know about one year.
#[derive(Clone, Debug)]
pub struct YearOutcome {
    pub year: Year,
    pub locations: Vec<LocationLabel>,
    pub excluded: Vec<Exclusion>,
    pub result: Result<NormalizedEquilibrium>,
}

impl YearOutcome {
    /// Outcome of a screened year; failed years keep their locations and exclusions.
    pub fn new(input: &YearInput, result: Result<NormalizedEquilibrium>) -> Self {
        Self {
            year: input.year,
            locations: input.locations.clone(),
            excluded: input.excluded.clone(),
            result,
        }
    }
}

/// Append-only collection of panel rows keyed by `(location, year)`.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Panel {
    rows: Vec<PanelRow>,
    summaries: BTreeMap<Year, YearSummary>,
    #[serde(skip)]
    keys: HashSet<(String, Year)>,
}

impl Panel {
    pub fn rows(&self) -> &[PanelRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, location_id: &str, year: Year) -> Option<&PanelRow> {
        self.rows
            .iter()
            .find(|row| row.year == year && row.location_id == location_id)
    }

    pub fn rows_for_year(&self, year: Year) -> impl Iterator<Item = &PanelRow> {
        self.rows.iter().filter(move |row| row.year == year)
    }

    /// Years folded into the panel, ascending.
    pub fn years(&self) -> Vec<Year> {
        self.summaries.keys().copied().collect()
    }

    pub fn summary(&self, year: Year) -> Option<&YearSummary> {
        self.summaries.get(&year)
    }

    pub fn summaries(&self) -> impl Iterator<Item = &YearSummary> {
        self.summaries.values()
    }
}

/// Folds per-year outcomes into a [`Panel`].
#[derive(Debug, Default)]
pub struct PanelAssembler {
    panel: Panel,
}

impl PanelAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one year. Either every row of the year is added or none is.
    pub fn append(&mut self, outcome: YearOutcome) -> Result<()> {
        let year = outcome.year;
        if self.panel.summaries.contains_key(&year) {
            return Err(InversionError::DuplicatePanelYear { year });
        }

        let rows = rows_for(&outcome);
        let mut fresh = HashSet::with_capacity(rows.len());
        for row in &rows {
            let key = (row.location_id.clone(), year);
            if self.panel.keys.contains(&key) || !fresh.insert(key) {
                return Err(InversionError::DuplicatePanelRow {
                    location: row.location_id.clone(),
                    year,
                });
            }
        }

        let summary = match &outcome.result {
            Ok(normalized) => YearSummary {
                year,
                record: normalized.record.clone(),
                reference: normalized.reference.clone(),
                locations: outcome.locations.len(),
                excluded: outcome.excluded.len(),
                error: None,
                diagnostic: None,
            },
            Err(err) => YearSummary {
                year,
                record: ConvergenceRecord::from_error(err),
                reference: None,
                locations: outcome.locations.len(),
                excluded: outcome.excluded.len(),
                error: Some(err.kind()),
                diagnostic: Some(err.to_string()),
            },
        };

        self.panel.keys.extend(fresh);
        self.panel.rows.extend(rows);
        self.panel.summaries.insert(year, summary);
        Ok(())
    }

    pub fn panel(&self) -> &Panel {
        &self.panel
    }

    pub fn finish(self) -> Panel {
        self.panel
    }
}

fn rows_for(outcome: &YearOutcome) -> Vec<PanelRow> {
    let year = outcome.year;
    let mut rows = Vec::with_capacity(outcome.locations.len() + outcome.excluded.len());

    match &outcome.result {
        Ok(normalized) => {
            for (index, label) in outcome.locations.iter().enumerate() {
                rows.push(PanelRow {
                    location_id: label.id.clone(),
                    location_name: label.name.clone(),
                    year,
                    productivity: normalized.productivity.get(index).copied(),
                    amenity: normalized.amenity.get(index).copied(),
                    converged: normalized.record.converged,
                    iterations: normalized.record.iterations,
                    final_residual: normalized.record.final_residual,
                    status: RowStatus::Converged,
                    error: None,
                    diagnostic: None,
                });
            }
        }
        Err(err) => {
            let record = ConvergenceRecord::from_error(err);
            let diagnostic = err.to_string();
            for label in &outcome.locations {
                rows.push(PanelRow {
                    location_id: label.id.clone(),
                    location_name: label.name.clone(),
                    year,
                    productivity: None,
                    amenity: None,
                    converged: false,
                    iterations: record.iterations,
                    final_residual: record.final_residual,
                    status: RowStatus::Failed,
                    error: Some(err.kind()),
                    diagnostic: Some(diagnostic.clone()),
                });
            }
        }
    }

    for exclusion in &outcome.excluded {
        rows.push(PanelRow {
            location_id: exclusion.location_id.clone(),
            location_name: exclusion.name.clone(),
            year,
            productivity: None,
            amenity: None,
            converged: false,
            iterations: 0,
            final_residual: None,
            status: RowStatus::Excluded,
            error: Some(exclusion.reason.kind()),
            diagnostic: Some(exclusion.reason.to_string()),
        });
    }

    rows
}
