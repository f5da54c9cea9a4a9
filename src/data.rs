//! Location-level observations, per-year location sets and distance tables.
//!
//! The types here sit at the boundary with whatever loads the raw tables.
//! [`ObservationTable`] accepts incomplete rows exactly as they arrive; the
//! per-year [`YearData`] it produces only ever contains locations with a
//! strictly positive population and wage. Everything else is reported back as
//! an [`Exclusion`] so that it can surface in the panel instead of vanishing.

use std::collections::{BTreeMap, HashMap, HashSet};

use nalgebra::{DMatrix, DVector};

use crate::error::{InversionError, Result};

/// Calendar year of a cross-section.
pub type Year = i32;

/// Relative slack allowed between the population sum and a reported total.
pub const POPULATION_TOTAL_TOLERANCE: f64 = 1e-9;

/// A raw `(location, year)` row as supplied by the data adapter.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub location_id: String,
    pub year: Year,
    pub name: Option<String>,
    pub population: Option<f64>,
    pub wage: Option<f64>,
    pub coordinates: Option<(f64, f64)>,
}

impl Observation {
    /// Starts an observation with no measured values.
    pub fn new<S: Into<String>>(location_id: S, year: Year) -> Self {
        Self {
            location_id: location_id.into(),
            year,
            name: None,
            population: None,
            wage: None,
            coordinates: None,
        }
    }

    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn population(mut self, population: f64) -> Self {
        self.population = Some(population);
        self
    }

    pub fn wage(mut self, wage: f64) -> Self {
        self.wage = Some(wage);
        self
    }

    pub fn coordinates(mut self, x: f64, y: f64) -> Self {
        self.coordinates = Some((x, y));
        self
    }

    /// Returns the reason this row cannot enter an inversion, if any.
    fn screen(&self) -> Option<InversionError> {
        check_value("population", &self.location_id, self.population)
            .and_then(|_| check_value("wage", &self.location_id, self.wage))
            .err()
    }
}

fn check_value(field: &'static str, location: &str, value: Option<f64>) -> Result<f64> {
    match value {
        None => Err(InversionError::MissingObservation {
            field,
            location: location.to_string(),
        }),
        Some(v) if v.is_nan() => Err(InversionError::MissingObservation {
            field,
            location: location.to_string(),
        }),
        Some(v) if v <= 0.0 || !v.is_finite() => Err(InversionError::InvalidObservation {
            field,
            location: location.to_string(),
            value: v,
        }),
        Some(v) => Ok(v),
    }
}

/// A location that was left out of a year's run, with the reason.
#[derive(Clone, Debug, PartialEq)]
pub struct Exclusion {
    pub location_id: String,
    pub name: Option<String>,
    pub reason: InversionError,
}

/// Observations keyed by `(location, year)`, plus optional reported population totals.
#[derive(Clone, Debug, Default)]
pub struct ObservationTable {
    rows: BTreeMap<(Year, String), Observation>,
    reported_totals: BTreeMap<Year, f64>,
}

impl ObservationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table from rows, rejecting duplicate keys.
    pub fn from_observations<I>(observations: I) -> Result<Self>
    where
        I: IntoIterator<Item = Observation>,
    {
        let mut table = Self::new();
        for observation in observations {
            table.insert(observation)?;
        }
        Ok(table)
    }

    /// Adds one row; the `(location, year)` key must be new.
    pub fn insert(&mut self, observation: Observation) -> Result<()> {
        let key = (observation.year, observation.location_id.clone());
        if self.rows.contains_key(&key) {
            return Err(InversionError::DuplicateObservation {
                location: key.1,
                year: key.0,
            });
        }
        self.rows.insert(key, observation);
        Ok(())
    }

    /// Records the externally reported total population for `year`.
    pub fn with_reported_total(mut self, year: Year, total: f64) -> Self {
        self.reported_totals.insert(year, total);
        self
    }

    pub fn reported_total(&self, year: Year) -> Option<f64> {
        self.reported_totals.get(&year).copied()
    }

    /// Number of rows across all years.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Distinct years in ascending order.
    pub fn years(&self) -> Vec<Year> {
        let mut years: Vec<Year> = self.rows.keys().map(|(year, _)| *year).collect();
        years.dedup();
        years
    }

    /// Rows of one year, ordered by location id.
    pub fn observations(&self, year: Year) -> impl Iterator<Item = &Observation> {
        self.rows
            .range((year, String::new())..)
            .take_while(move |((row_year, _), _)| *row_year == year)
            .map(|(_, observation)| observation)
    }

    /// Splits a year's rows into a validated [`YearData`] and the excluded locations.
    ///
    /// The screened labels and exclusions are kept even when the year as a
    /// whole cannot be assembled, so that every row can still be reported.
    pub fn year_input(&self, year: Year) -> YearInput {
        let mut locations = Vec::new();
        let mut coordinates = Vec::new();
        let mut population = Vec::new();
        let mut wage = Vec::new();
        let mut excluded = Vec::new();

        for observation in self.observations(year) {
            if let Some(reason) = observation.screen() {
                log::warn!(
                    "year {year}: excluding `{}` ({reason})",
                    observation.location_id
                );
                excluded.push(Exclusion {
                    location_id: observation.location_id.clone(),
                    name: observation.name.clone(),
                    reason,
                });
                continue;
            }
            locations.push(LocationLabel {
                id: observation.location_id.clone(),
                name: observation.name.clone(),
            });
            coordinates.push(observation.coordinates);
            // Both values were screened above.
            population.push(observation.population.unwrap_or_default());
            wage.push(observation.wage.unwrap_or_default());
        }

        let data = if locations.is_empty() {
            Err(InversionError::NoObservations { year })
        } else {
            let mut builder = YearDataBuilder::new(
                year,
                locations.iter().map(|label| label.id.clone()).collect(),
                DVector::from_vec(population),
                DVector::from_vec(wage),
            )
            .names(locations.iter().map(|label| label.name.clone()).collect())
            .coordinates(coordinates);
            if let Some(total) = self.reported_total(year) {
                builder = builder.reported_total(total);
            }
            builder.build()
        };

        YearInput {
            year,
            locations,
            excluded,
            data,
        }
    }

    /// Id of the location with the largest valid population in `year`.
    ///
    /// Ties go to the lexicographically smallest id.
    pub fn largest_population(&self, year: Year) -> Option<&str> {
        let mut best: Option<(&str, f64)> = None;
        for observation in self.observations(year) {
            let Ok(population) =
                check_value("population", &observation.location_id, observation.population)
            else {
                continue;
            };
            // Rows iterate in id order, so strict comparison keeps the smallest id on ties.
            if best.map_or(true, |(_, current)| population > current) {
                best = Some((observation.location_id.as_str(), population));
            }
        }
        best.map(|(id, _)| id)
    }
}

/// Identifier and display name of a location that passed screening.
#[derive(Clone, Debug, PartialEq)]
pub struct LocationLabel {
    pub id: String,
    pub name: Option<String>,
}

/// One year's screened rows: the validated location set, or why it could not be built.
#[derive(Clone, Debug)]
pub struct YearInput {
    pub year: Year,
    /// Locations that passed screening, in id order.
    pub locations: Vec<LocationLabel>,
    pub excluded: Vec<Exclusion>,
    /// Fails with [`NoObservations`](InversionError::NoObservations) when every row was
    /// excluded, or with the year-level validation error.
    pub data: Result<YearData>,
}

/// A location included in an inversion run.
#[derive(Clone, Debug, PartialEq)]
pub struct Location {
    pub id: String,
    pub name: Option<String>,
    pub year: Year,
    pub population: f64,
    pub wage: f64,
    pub coordinates: Option<(f64, f64)>,
}

/// Validated population and wage data for one year.
#[derive(Clone, Debug)]
pub struct YearData {
    year: Year,
    locations: Vec<Location>,
    population: DVector<f64>,
    wage: DVector<f64>,
    total_population: f64,
}

impl YearData {
    pub fn year(&self) -> Year {
        self.year
    }

    /// Number of locations in the run.
    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn locations(&self) -> &[Location] {
        &self.locations
    }

    /// Location identifiers in inversion order.
    pub fn ids(&self) -> Vec<&str> {
        self.locations.iter().map(|l| l.id.as_str()).collect()
    }

    /// Observed population vector `L`.
    pub fn population(&self) -> &DVector<f64> {
        &self.population
    }

    /// Observed wage vector `w`.
    pub fn wage(&self) -> &DVector<f64> {
        &self.wage
    }

    pub fn total_population(&self) -> f64 {
        self.total_population
    }

    /// Observed population shares `L / sum(L)`.
    pub fn shares(&self) -> DVector<f64> {
        &self.population / self.total_population
    }

    pub fn index_of(&self, location_id: &str) -> Option<usize> {
        self.locations.iter().position(|l| l.id == location_id)
    }

    /// Index of the most populous location; ties go to the smallest id.
    pub fn largest_population(&self) -> usize {
        let mut best = 0usize;
        for (index, location) in self.locations.iter().enumerate().skip(1) {
            let current = &self.locations[best];
            if location.population > current.population
                || (location.population == current.population && location.id < current.id)
            {
                best = index;
            }
        }
        best
    }
}

/// Builder that validates observed values before constructing [`YearData`].
#[derive(Debug)]
pub struct YearDataBuilder {
    year: Year,
    ids: Vec<String>,
    population: DVector<f64>,
    wage: DVector<f64>,
    names: Option<Vec<Option<String>>>,
    coordinates: Option<Vec<Option<(f64, f64)>>>,
    reported_total: Option<f64>,
}

impl YearDataBuilder {
    /// Start building from location ids and the observed population and wage vectors.
    pub fn new(year: Year, ids: Vec<String>, population: DVector<f64>, wage: DVector<f64>) -> Self {
        Self {
            year,
            ids,
            population,
            wage,
            names: None,
            coordinates: None,
            reported_total: None,
        }
    }

    pub fn names(mut self, names: Vec<Option<String>>) -> Self {
        self.names = Some(names);
        self
    }

    pub fn coordinates(mut self, coordinates: Vec<Option<(f64, f64)>>) -> Self {
        self.coordinates = Some(coordinates);
        self
    }

    /// Sets the externally reported total that the population vector must add up to.
    pub fn reported_total(mut self, total: f64) -> Self {
        self.reported_total = Some(total);
        self
    }

    /// Finalizes construction after validating shapes, positivity and the population total.
    pub fn build(self) -> Result<YearData> {
        let n = self.ids.len();
        if n == 0 {
            return Err(InversionError::NoObservations { year: self.year });
        }
        if self.population.len() != n {
            return Err(InversionError::dimension_mismatch(
                "population length",
                n,
                self.population.len(),
            ));
        }
        if self.wage.len() != n {
            return Err(InversionError::dimension_mismatch(
                "wage length",
                n,
                self.wage.len(),
            ));
        }

        let names = self.names.unwrap_or_else(|| vec![None; n]);
        if names.len() != n {
            return Err(InversionError::dimension_mismatch("names length", n, names.len()));
        }
        let coordinates = self.coordinates.unwrap_or_else(|| vec![None; n]);
        if coordinates.len() != n {
            return Err(InversionError::dimension_mismatch(
                "coordinates length",
                n,
                coordinates.len(),
            ));
        }

        let mut seen = HashSet::with_capacity(n);
        let mut locations = Vec::with_capacity(n);
        for (index, ((id, name), coords)) in self
            .ids
            .into_iter()
            .zip(names)
            .zip(coordinates)
            .enumerate()
        {
            if !seen.insert(id.clone()) {
                return Err(InversionError::DuplicateObservation {
                    location: id,
                    year: self.year,
                });
            }
            let population = check_value("population", &id, Some(self.population[index]))?;
            let wage = check_value("wage", &id, Some(self.wage[index]))?;
            locations.push(Location {
                id,
                name,
                year: self.year,
                population,
                wage,
                coordinates: coords,
            });
        }

        let total_population = self.population.sum();
        if let Some(reported) = self.reported_total {
            let slack = (total_population - reported).abs();
            if !(slack <= POPULATION_TOTAL_TOLERANCE * reported.abs().max(1.0)) {
                return Err(InversionError::PopulationTotalMismatch {
                    observed: total_population,
                    reported,
                });
            }
        }

        Ok(YearData {
            year: self.year,
            locations,
            population: self.population,
            wage: self.wage,
            total_population,
        })
    }
}

/// Pairwise distances keyed by `(from, to)` location ids.
///
/// A lookup of `(a, b)` falls back to `(b, a)`, and the self distance is zero
/// unless stated otherwise.
#[derive(Clone, Debug, Default)]
pub struct DistanceTable {
    entries: HashMap<String, HashMap<String, f64>>,
}

impl DistanceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the distance between `from` and `to`.
    pub fn insert<A: Into<String>, B: Into<String>>(&mut self, from: A, to: B, distance: f64) {
        self.entries
            .entry(from.into())
            .or_default()
            .insert(to.into(), distance);
    }

    /// Builder-style variant of [`insert`](Self::insert).
    pub fn with<A: Into<String>, B: Into<String>>(mut self, from: A, to: B, distance: f64) -> Self {
        self.insert(from, to, distance);
        self
    }

    /// Reads a dense square matrix whose rows and columns follow `ids`.
    pub fn from_matrix(ids: &[&str], matrix: &DMatrix<f64>) -> Result<Self> {
        if matrix.nrows() != ids.len() || matrix.ncols() != ids.len() {
            return Err(InversionError::dimension_mismatch(
                "distance matrix",
                ids.len(),
                matrix.nrows().max(matrix.ncols()),
            ));
        }
        let mut table = Self::new();
        for (i, from) in ids.iter().enumerate() {
            for (j, to) in ids.iter().enumerate() {
                table.insert(*from, *to, matrix[(i, j)]);
            }
        }
        Ok(table)
    }

    /// Euclidean distances between planar coordinates, divided by `unit_divisor`
    /// (e.g. `1000.0` to turn metres into kilometres).
    pub fn from_coordinates<'a, I>(points: I, unit_divisor: f64) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, (f64, f64))>,
    {
        if !(unit_divisor > 0.0 && unit_divisor.is_finite()) {
            return Err(InversionError::invalid_parameter(
                "unit_divisor",
                format!("must be positive and finite, found {unit_divisor}"),
            ));
        }
        let points: Vec<(&str, (f64, f64))> = points.into_iter().collect();
        let mut table = Self::new();
        for (from, (x1, y1)) in &points {
            for (to, (x2, y2)) in &points {
                let distance = ((x1 - x2).powi(2) + (y1 - y2).powi(2)).sqrt() / unit_divisor;
                table.insert(*from, *to, distance);
            }
        }
        Ok(table)
    }

    /// Looks up the distance between two locations.
    pub fn distance(&self, from: &str, to: &str) -> Option<f64> {
        let direct = |a: &str, b: &str| self.entries.get(a).and_then(|row| row.get(b)).copied();
        direct(from, to)
            .or_else(|| direct(to, from))
            .or_else(|| (from == to).then_some(0.0))
    }
}

/// A baseline distance table with optional per-year replacements.
#[derive(Clone, Debug, Default)]
pub struct DistanceSource {
    baseline: DistanceTable,
    by_year: BTreeMap<Year, DistanceTable>,
}

impl DistanceSource {
    pub fn new(baseline: DistanceTable) -> Self {
        Self {
            baseline,
            by_year: BTreeMap::new(),
        }
    }

    /// Supplies a year-specific table that replaces the baseline for that year.
    pub fn with_year(mut self, year: Year, table: DistanceTable) -> Self {
        self.by_year.insert(year, table);
        self
    }

    /// Table that applies to `year`.
    pub fn for_year(&self, year: Year) -> &DistanceTable {
        self.by_year.get(&year).unwrap_or(&self.baseline)
    }
}
