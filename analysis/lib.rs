#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod config;
pub mod control;
pub mod covariance;
pub mod identifiability;
pub mod jco;
pub mod progress;
pub mod residuals;
pub mod sensitivity;
mod tokens;
pub mod types;

pub use config::AnalysisConfig;
pub use control::ControlFile;
pub use covariance::{CovarianceError, CovarianceResult};
pub use identifiability::IdentifiabilityTable;
pub use jco::{JacobianMatrix, JcoError};
pub use residuals::ResidualTable;
pub use sensitivity::{SensitivityError, SensitivityOptions, SensitivityResult};
pub use types::{ObservationRecord, ObservationTable, ParameterRecord, ParameterTable};
