//! Scale pinning of recovered fundamentals against a reference location.

use nalgebra::DVector;
use serde::Serialize;

use crate::data::{ObservationTable, Year, YearData};
use crate::equilibrium::EquilibriumState;
use crate::error::{InversionError, Result};
use crate::options::{ModelParameters, ReferenceFallback, ReferencePolicy};
use crate::solving::ConvergenceRecord;

/// A year's fundamentals after scale pinning.
#[derive(Clone, Debug, Serialize)]
pub struct NormalizedEquilibrium {
    pub year: Year,
    pub location_ids: Vec<String>,
    pub productivity: DVector<f64>,
    pub amenity: DVector<f64>,
    pub record: ConvergenceRecord,
    /// Location pinned to unit productivity; `None` when normalization was skipped.
    pub reference: Option<String>,
}

impl NormalizedEquilibrium {
    /// Wraps raw fundamentals without touching their scale.
    pub fn unpinned(state: EquilibriumState) -> Self {
        Self {
            year: state.year,
            location_ids: state.location_ids,
            productivity: state.productivity,
            amenity: state.amenity,
            record: state.record,
            reference: None,
        }
    }
}

/// Rescales `(A, B)` so that `A[reference] == 1`, moving `B` by `A_ref^kappa`.
pub fn rescale_to_reference(
    productivity: &DVector<f64>,
    amenity: &DVector<f64>,
    reference: usize,
    mobility_elasticity: f64,
) -> Result<(DVector<f64>, DVector<f64>)> {
    if productivity.len() != amenity.len() {
        return Err(InversionError::dimension_mismatch(
            "amenity length",
            productivity.len(),
            amenity.len(),
        ));
    }
    if reference >= productivity.len() {
        return Err(InversionError::dimension_mismatch(
            "reference index",
            productivity.len(),
            reference,
        ));
    }
    let anchor = productivity[reference];
    if !(anchor > 0.0 && anchor.is_finite()) {
        return Err(InversionError::invalid_parameter(
            "productivity",
            format!("reference productivity must be positive and finite, found {anchor}"),
        ));
    }

    // Division rather than multiplication by the reciprocal keeps A[reference] at exactly 1.
    let productivity = productivity.map(|a| a / anchor);
    let amenity = amenity * anchor.powf(mobility_elasticity);
    Ok((productivity, amenity))
}

/// Resolves a [`ReferencePolicy`] once for a whole run.
///
/// `LargestPopulation` looks at the base year, by default the earliest of `years`
/// that has a location with a valid population.
pub fn resolve_reference(
    policy: &ReferencePolicy,
    observations: &ObservationTable,
    years: &[Year],
) -> Result<String> {
    match policy {
        ReferencePolicy::Fixed(id) => Ok(id.clone()),
        ReferencePolicy::LargestPopulation {
            base_year: Some(base),
        } => observations
            .largest_population(*base)
            .map(String::from)
            .ok_or_else(|| {
                InversionError::invalid_parameter(
                    "reference_policy",
                    format!("base year {base} has no location with a valid population"),
                )
            }),
        ReferencePolicy::LargestPopulation { base_year: None } => {
            let mut candidates = years.to_vec();
            candidates.sort_unstable();
            candidates
                .into_iter()
                .find_map(|year| observations.largest_population(year))
                .map(String::from)
                .ok_or_else(|| {
                    InversionError::invalid_parameter(
                        "reference_policy",
                        "no requested year has a location with a valid population",
                    )
                })
        }
    }
}

/// Pins every year to the same reference location.
#[derive(Clone, Debug)]
pub struct Normalizer {
    reference: String,
    mobility_elasticity: f64,
    fallback: ReferenceFallback,
}

impl Normalizer {
    pub fn new<S: Into<String>>(reference: S, parameters: &ModelParameters) -> Self {
        Self {
            reference: reference.into(),
            mobility_elasticity: parameters.mobility_elasticity,
            fallback: parameters.reference_fallback,
        }
    }

    /// Builds a normalizer from the policy configured in `parameters`.
    pub fn from_policy(
        parameters: &ModelParameters,
        observations: &ObservationTable,
        years: &[Year],
    ) -> Result<Self> {
        let reference = resolve_reference(&parameters.reference_policy, observations, years)?;
        log::info!("reference location: `{reference}`");
        Ok(Self::new(reference, parameters))
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Pins `state` so that the reference location has unit productivity.
    ///
    /// Fails when the reference is absent from `data`, unless the caller opted into
    /// [`ReferenceFallback::LargestPopulationInYear`].
    pub fn normalize(
        &self,
        state: EquilibriumState,
        data: &YearData,
    ) -> Result<NormalizedEquilibrium> {
        let index = match (data.index_of(&self.reference), self.fallback) {
            (Some(index), _) => index,
            (None, ReferenceFallback::LargestPopulationInYear) => {
                let index = data.largest_population();
                log::warn!(
                    "year {}: reference `{}` absent, substituting `{}`",
                    data.year(),
                    self.reference,
                    data.locations()[index].id
                );
                index
            }
            (None, ReferenceFallback::Fail) => {
                return Err(InversionError::ReferenceLocationAbsent {
                    location: self.reference.clone(),
                    year: data.year(),
                });
            }
        };
        if state.location_ids.len() != data.len() {
            return Err(InversionError::dimension_mismatch(
                "equilibrium state",
                data.len(),
                state.location_ids.len(),
            ));
        }

        let (productivity, amenity) = rescale_to_reference(
            &state.productivity,
            &state.amenity,
            index,
            self.mobility_elasticity,
        )?;
        Ok(NormalizedEquilibrium {
            year: state.year,
            reference: Some(state.location_ids[index].clone()),
            location_ids: state.location_ids,
            productivity,
            amenity,
            record: state.record,
        })
    }
}
