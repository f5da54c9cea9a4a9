//! Inversion of a quantitative spatial equilibrium model.
//!
//! Given observed wages and populations for a set of locations and a matrix of
//! bilateral trade frictions, this crate recovers the productivity and amenity
//! of every location that rationalize the data as a general equilibrium of a
//! gravity-trade model with mobile labor. It offers tools to
//!
//! - validate observations and distances (`data` module),
//! - turn distances into trade frictions (`cost` module),
//! - solve the damped fixed point that inverts the model (`equilibrium` module),
//! - pin the scale of each year's solution to a reference location (`normalize` module), and
//! - run many years in parallel and assemble a panel with per-row diagnostics
//!   (`pipeline` and `panel` modules).
//!
//! # Quick start
//!
//! ```no_run
//! use qsmrs::data::{DistanceSource, DistanceTable, Observation, ObservationTable};
//! use qsmrs::options::{ModelParameters, PipelineOptions};
//! use qsmrs::pipeline::{FrictionInput, Pipeline};
//!
//! let observations = ObservationTable::from_observations(vec![
//!     Observation::new("a", 2000).population(100.0).wage(1.0),
//!     Observation::new("b", 2000).population(50.0).wage(0.9),
//!     Observation::new("c", 2000).population(20.0).wage(1.2),
//! ])
//! .expect("unique observations");
//! let distances = DistanceTable::new()
//!     .with("a", "b", 10.0)
//!     .with("a", "c", 20.0)
//!     .with("b", "c", 15.0);
//!
//! // Trade elasticity 4, mobility elasticity 2, distance decay 1.
//! let options = PipelineOptions::new(ModelParameters::new(4.0, 2.0, 1.0));
//! let pipeline = Pipeline::new(options).expect("valid configuration");
//! let panel = pipeline
//!     .run(
//!         &observations,
//!         &FrictionInput::Distances(DistanceSource::new(distances)),
//!         &[2000],
//!     )
//!     .expect("run completed");
//!
//! for row in panel.rows() {
//!     println!("{} {:?} {:?}", row.location_id, row.productivity, row.amenity);
//! }
//! ```
//!
//! Fundamentals are only identified up to `A -> cA, B -> c^-kappa B`; the
//! normalization stage pins the reference location's productivity to one.

pub mod cost;
pub mod data;
pub mod equilibrium;
pub mod error;
pub mod normalize;
pub mod options;
pub mod panel;
pub mod pipeline;
pub mod solving;
pub mod synthetic;

pub use cost::{CostModel, DecayForm, FrictionMatrix};
pub use data::{DistanceSource, DistanceTable, Observation, ObservationTable, Year, YearData};
pub use equilibrium::{EquilibriumInverter, EquilibriumState};
pub use error::{ErrorKind, InversionError, Result};
pub use normalize::{NormalizedEquilibrium, Normalizer};
pub use options::{ModelParameters, PipelineOptions, ReferenceFallback, ReferencePolicy, Stage, StageSet};
pub use panel::{Panel, PanelAssembler, PanelRow, RowStatus};
pub use pipeline::{FrictionInput, Pipeline};
pub use solving::{CancellationToken, ConvergenceRecord, InitialGuess, SolverPhase};
