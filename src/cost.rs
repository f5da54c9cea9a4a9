//! Distance-decay transform from pairwise distances to bilateral trade frictions.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::data::DistanceTable;
use crate::error::{InversionError, Result};
use crate::options::ModelParameters;

/// Relative tolerance used when checking that a friction matrix is symmetric.
const SYMMETRY_TOLERANCE: f64 = 1e-12;

/// Largest exponent passed to `exp` by the exponential transform.
const MAX_EXPONENT: f64 = 700.0;

/// Functional form of the distance-decay transform.
///
/// Both forms are non-decreasing in distance and equal one at distance zero.
/// The default is the power law. Trade costs of the form `exp(phi * d)`, such as
/// `phi = 0.01` with distances in kilometres, need [`DecayForm::Exponential`]
/// selected explicitly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecayForm {
    /// `(1 + d)^delta`: `delta` is the distance elasticity of trade flows.
    #[default]
    PowerLaw,
    /// `exp(delta * d)`: `delta` is the semi-elasticity per unit of distance.
    Exponential,
}

impl DecayForm {
    /// Friction implied by `distance` under decay parameter `decay`.
    pub fn friction(self, distance: f64, decay: f64) -> f64 {
        match self {
            Self::PowerLaw => (1.0 + distance).powf(decay),
            Self::Exponential => (decay * distance).clamp(-MAX_EXPONENT, MAX_EXPONENT).exp(),
        }
    }
}

/// Converts distances into a [`FrictionMatrix`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CostModel {
    decay: f64,
    form: DecayForm,
}

impl CostModel {
    /// Creates a cost model; `decay` must be finite and non-negative.
    pub fn new(decay: f64, form: DecayForm) -> Result<Self> {
        if !(decay >= 0.0 && decay.is_finite()) {
            return Err(InversionError::invalid_parameter(
                "decay_parameter",
                format!("must be finite and non-negative, found {decay}"),
            ));
        }
        Ok(Self { decay, form })
    }

    /// Cost model described by the decay settings of `parameters`.
    pub fn from_parameters(parameters: &ModelParameters) -> Result<Self> {
        Self::new(parameters.decay_parameter, parameters.decay_form)
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    pub fn form(&self) -> DecayForm {
        self.form
    }

    /// Builds the friction matrix over `ids` (in that order) from `distances`.
    pub fn build(&self, distances: &DistanceTable, ids: &[&str]) -> Result<FrictionMatrix> {
        let n = ids.len();
        let mut values = DMatrix::zeros(n, n);
        for (i, from) in ids.iter().enumerate() {
            for (j, to) in ids.iter().enumerate() {
                let distance =
                    distances
                        .distance(from, to)
                        .ok_or_else(|| InversionError::MissingDistance {
                            from: from.to_string(),
                            to: to.to_string(),
                        })?;
                if !(distance >= 0.0 && distance.is_finite()) {
                    return Err(InversionError::invalid_parameter(
                        "distance",
                        format!("`{from}`-`{to}` must be finite and non-negative, found {distance}"),
                    ));
                }
                values[(i, j)] = self.form.friction(distance, self.decay);
            }
        }

        FrictionMatrix::from_matrix(ids.iter().map(|id| id.to_string()).collect(), values)
    }
}

/// Square matrix of bilateral frictions in trade-flow units, ordered by location id.
///
/// The gravity weight between `i` and `j` is `1 / friction[(i, j)]`.
#[derive(Clone, Debug, PartialEq)]
pub struct FrictionMatrix {
    ids: Vec<String>,
    values: DMatrix<f64>,
}

impl FrictionMatrix {
    /// Wraps a precomputed matrix after validating it.
    pub fn from_matrix(ids: Vec<String>, values: DMatrix<f64>) -> Result<Self> {
        if values.nrows() != ids.len() || values.ncols() != ids.len() {
            return Err(InversionError::dimension_mismatch(
                "friction matrix",
                ids.len(),
                values.nrows().max(values.ncols()),
            ));
        }
        let matrix = Self { ids, values };
        matrix.validate()?;
        Ok(matrix)
    }

    fn validate(&self) -> Result<()> {
        let n = self.ids.len();
        for i in 0..n {
            let own = self.values[(i, i)];
            for j in 0..n {
                let value = self.values[(i, j)];
                if !(value > 0.0 && value.is_finite()) {
                    return Err(InversionError::invalid_friction(format!(
                        "entry `{}`-`{}` must be positive and finite, found {value}",
                        self.ids[i], self.ids[j]
                    )));
                }
                if value < own {
                    return Err(InversionError::invalid_friction(format!(
                        "self friction of `{}` ({own}) exceeds its friction to `{}` ({value})",
                        self.ids[i], self.ids[j]
                    )));
                }
                let mirrored = self.values[(j, i)];
                if (value - mirrored).abs() > SYMMETRY_TOLERANCE * value.max(mirrored) {
                    return Err(InversionError::invalid_friction(format!(
                        "asymmetric entries between `{}` and `{}` ({value} vs {mirrored})",
                        self.ids[i], self.ids[j]
                    )));
                }
            }
        }
        Ok(())
    }

    /// Location ids in row order.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Returns a read-only view of the frictions.
    pub fn values(&self) -> &DMatrix<f64> {
        &self.values
    }

    /// Gravity weights `1 / friction`.
    pub fn gravity_weights(&self) -> DMatrix<f64> {
        self.values.map(|value| 1.0 / value)
    }

    /// Whether rows follow exactly the order of `ids`.
    pub fn is_aligned_with(&self, ids: &[&str]) -> bool {
        self.ids.len() == ids.len() && self.ids.iter().zip(ids).all(|(a, b)| a == b)
    }

    /// Sub-matrix over `ids`, in that order.
    pub fn restrict(&self, ids: &[&str]) -> Result<Self> {
        let positions = ids
            .iter()
            .map(|id| {
                self.ids
                    .iter()
                    .position(|known| known == id)
                    .ok_or_else(|| InversionError::LocationNotInFriction {
                        location: id.to_string(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let values = DMatrix::from_fn(ids.len(), ids.len(), |i, j| {
            self.values[(positions[i], positions[j])]
        });
        Ok(Self {
            ids: ids.iter().map(|id| id.to_string()).collect(),
            values,
        })
    }
}
