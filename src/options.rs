//! Calibration constants, solver settings and pipeline configuration.

use serde::{Deserialize, Serialize};

use crate::cost::DecayForm;
use crate::data::Year;
use crate::error::{InversionError, Result};

/// How the location whose productivity is pinned to one is chosen.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ReferencePolicy {
    /// The most populous location of `base_year` (when `None`, the earliest requested year with data).
    LargestPopulation {
        /// Year whose populations decide the reference.
        base_year: Option<Year>,
    },
    /// A caller-designated location id.
    Fixed(String),
}

impl Default for ReferencePolicy {
    fn default() -> Self {
        Self::LargestPopulation { base_year: None }
    }
}

/// What happens when the reference location is missing from a year.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceFallback {
    /// Record an error for the year.
    #[default]
    Fail,
    /// Substitute that year's most populous location.
    LargestPopulationInYear,
}

/// Calibrated constants and solver settings shared by every year of a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    /// Trade elasticity `theta`.
    pub trade_elasticity: f64,
    /// Labor-mobility elasticity `kappa`.
    pub mobility_elasticity: f64,
    /// Distance-decay parameter fed to the [`CostModel`](crate::cost::CostModel).
    pub decay_parameter: f64,
    /// Functional form of the distance-decay transform.
    pub decay_form: DecayForm,
    /// Bound on the maximum relative error of implied wages and populations.
    pub tolerance: f64,
    /// Iteration budget per year.
    pub max_iterations: usize,
    /// Initial exponent applied to the multiplicative updates, in `(0, 1]`.
    pub damping: f64,
    /// Floor below which the damping is never halved.
    pub min_damping: f64,
    /// How the location pinned to unit productivity is chosen.
    pub reference_policy: ReferencePolicy,
    /// What to do in a year that lacks the reference location.
    pub reference_fallback: ReferenceFallback,
}

impl ModelParameters {
    /// Parameters with the given calibration and default solver settings.
    pub fn new(trade_elasticity: f64, mobility_elasticity: f64, decay_parameter: f64) -> Self {
        Self {
            trade_elasticity,
            mobility_elasticity,
            decay_parameter,
            decay_form: DecayForm::default(),
            tolerance: 1e-6,
            max_iterations: 1_000,
            damping: 1.0,
            min_damping: 0.01,
            reference_policy: ReferencePolicy::default(),
            reference_fallback: ReferenceFallback::default(),
        }
    }

    pub fn with_decay_form(mut self, form: DecayForm) -> Self {
        self.decay_form = form;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_damping(mut self, damping: f64) -> Self {
        self.damping = damping;
        self
    }

    pub fn with_min_damping(mut self, min_damping: f64) -> Self {
        self.min_damping = min_damping;
        self
    }

    pub fn with_reference_policy(mut self, policy: ReferencePolicy) -> Self {
        self.reference_policy = policy;
        self
    }

    /// Explicitly allow a per-year substitute when the reference location is absent.
    pub fn with_reference_fallback(mut self, fallback: ReferenceFallback) -> Self {
        self.reference_fallback = fallback;
        self
    }

    /// Rejects malformed settings; these errors are fatal to a whole run.
    pub fn validate(&self) -> Result<()> {
        positive("trade_elasticity", self.trade_elasticity)?;
        positive("mobility_elasticity", self.mobility_elasticity)?;
        if !(self.decay_parameter >= 0.0 && self.decay_parameter.is_finite()) {
            return Err(InversionError::invalid_parameter(
                "decay_parameter",
                format!("must be finite and non-negative, found {}", self.decay_parameter),
            ));
        }
        positive("tolerance", self.tolerance)?;
        if self.max_iterations == 0 {
            return Err(InversionError::invalid_parameter(
                "max_iterations",
                "at least one iteration is required",
            ));
        }
        if !(self.damping > 0.0 && self.damping <= 1.0) {
            return Err(InversionError::invalid_parameter(
                "damping",
                format!("must lie in (0, 1], found {}", self.damping),
            ));
        }
        if !(self.min_damping > 0.0 && self.min_damping <= self.damping) {
            return Err(InversionError::invalid_parameter(
                "min_damping",
                format!(
                    "must lie in (0, damping = {}], found {}",
                    self.damping, self.min_damping
                ),
            ));
        }
        if let ReferencePolicy::Fixed(id) = &self.reference_policy {
            if id.is_empty() {
                return Err(InversionError::invalid_parameter(
                    "reference_policy",
                    "fixed reference location id is empty",
                ));
            }
        }
        Ok(())
    }
}

fn positive(name: &'static str, value: f64) -> Result<()> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(InversionError::invalid_parameter(
            name,
            format!("must be positive and finite, found {value}"),
        ))
    }
}

/// Optional pipeline stages. Inversion and panel assembly always run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Derive frictions from distances; when disabled a precomputed matrix is required.
    Friction,
    /// Pin the scale of each year's solution to the reference location.
    Normalization,
}

impl Stage {
    const fn bit(self) -> u8 {
        match self {
            Self::Friction => 1,
            Self::Normalization => 1 << 1,
        }
    }
}

/// Set of enabled [`Stage`]s; every stage is enabled by default.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSet {
    bits: u8,
}

impl Default for StageSet {
    fn default() -> Self {
        Self::all()
    }
}

impl StageSet {
    pub fn all() -> Self {
        Self {
            bits: Stage::Friction.bit() | Stage::Normalization.bit(),
        }
    }

    pub fn none() -> Self {
        Self { bits: 0 }
    }

    pub fn enable(mut self, stage: Stage) -> Self {
        self.bits |= stage.bit();
        self
    }

    pub fn disable(mut self, stage: Stage) -> Self {
        self.bits &= !stage.bit();
        self
    }

    pub fn is_enabled(&self, stage: Stage) -> bool {
        self.bits & stage.bit() != 0
    }
}

/// Aggregated configuration for a multi-year [`Pipeline`](crate::pipeline::Pipeline) run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineOptions {
    /// Calibration and solver settings shared by every year.
    pub model: ModelParameters,
    /// Optional stages to run.
    pub stages: StageSet,
    /// Worker threads for per-year inversions; `None` uses every available core.
    pub workers: Option<usize>,
    /// Seed each year with the previous year's normalized solution (runs years sequentially).
    pub warm_start: bool,
}

impl PipelineOptions {
    pub fn new(model: ModelParameters) -> Self {
        Self {
            model,
            stages: StageSet::default(),
            workers: None,
            warm_start: false,
        }
    }

    pub fn with_stages(mut self, stages: StageSet) -> Self {
        self.stages = stages;
        self
    }

    /// Bound the worker pool; zero is treated as one.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers.max(1));
        self
    }

    pub fn with_warm_start(mut self, warm_start: bool) -> Self {
        self.warm_start = warm_start;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_documented_values() {
        let params = ModelParameters::new(4.0, 2.0, 1.0);
        assert_eq!(params.tolerance, 1e-6);
        assert_eq!(params.max_iterations, 1_000);
        assert_eq!(params.damping, 1.0);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn malformed_parameters_are_rejected() {
        let bad = [
            ModelParameters::new(0.0, 2.0, 1.0),
            ModelParameters::new(4.0, f64::NAN, 1.0),
            ModelParameters::new(4.0, 2.0, -1.0),
            ModelParameters::new(4.0, 2.0, 1.0).with_max_iterations(0),
            ModelParameters::new(4.0, 2.0, 1.0).with_damping(1.5),
            ModelParameters::new(4.0, 2.0, 1.0).with_min_damping(0.0),
            ModelParameters::new(4.0, 2.0, 1.0)
                .with_reference_policy(ReferencePolicy::Fixed(String::new())),
        ];
        for params in bad {
            assert!(matches!(
                params.validate(),
                Err(InversionError::InvalidParameter { .. })
            ));
        }
    }

    #[test]
    fn stage_set_toggles() {
        let stages = StageSet::default().disable(Stage::Normalization);
        assert!(stages.is_enabled(Stage::Friction));
        assert!(!stages.is_enabled(Stage::Normalization));
        assert!(StageSet::none().enable(Stage::Friction).is_enabled(Stage::Friction));
    }
}
