//! # kfvertex-core
//!
//! This is an internal crate used by `kfvertex`. It holds the straight-line track model, the
//! linear extrapolator and the Kalman vertex fitter.
#![warn(clippy::perf, clippy::style)]
#![allow(clippy::excessive_precision)]

use thiserror::Error;

/// Local straight-line trajectory states and their covariance.
pub mod track;
/// Propagation of [`TrackState`]s between reference planes.
pub mod extrapolator;
/// The iterative Kalman vertex fitter and its results.
pub mod vertex;
/// Utility functions, packed covariance helpers and vector types.
pub mod utils;

/// Useful traits for all crate structs
pub mod traits {
    pub use crate::extrapolator::Extrapolator;
}

pub use crate::extrapolator::{Extrapolator, LinearExtrapolator};
pub use crate::track::{FitQuality, TrackState};
pub use crate::utils::vectors::{Vec3, Vec4};
pub use crate::vertex::{
    FitDiagnostics, SkipReason, TrackSkip, VertexEstimate, VertexFitConfig, VertexFitter,
};

/// Determinant below which a matrix is treated as singular and its inversion is refused.
pub const SINGULAR_EPSILON: f64 = 1e-20;

/// Speed of light in units which convert a field in tesla and a momentum in GeV into a
/// curvature in mm.
pub const C_LIGHT: f64 = 0.000299792458;

pub type KfResult<T> = Result<T, KfError>;

/// The error type used by all `kfvertex` internal methods
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KfError {
    /// A matrix which had to be inverted was numerically singular.
    #[error("Singular {dim}x{dim} matrix (determinant {determinant:e}) in {context}")]
    SingularMatrix {
        /// Dimension of the square matrix
        dim: usize,
        /// The determinant which failed the threshold
        determinant: f64,
        /// Where the inversion was attempted
        context: String,
    },
    /// A vertex fit was attempted with too few usable measurements for its result to be
    /// trusted.
    #[error("Insufficient measurements: {n_tracks} track(s) contributed, ndf = {ndf}")]
    InsufficientMeasurements {
        /// Tracks which contributed in the final iteration
        n_tracks: usize,
        /// Resulting number of degrees of freedom
        ndf: i32,
    },
    /// An attempt to combine a particle with itself or with one of its own ancestors or
    /// descendants.
    #[error("Particle {daughter} cannot be combined into {parent}: the decay tree would contain a cycle")]
    CyclicCombination {
        /// The composite receiving the daughter
        parent: usize,
        /// The offending daughter
        daughter: usize,
    },
    /// An attempt to add a daughter to a composite which is already used as a daughter
    /// elsewhere.
    #[error("Composite {id} is already a daughter of another particle and cannot be modified")]
    StaleCompositeMutation {
        /// The frozen composite
        id: usize,
    },
    /// An operation which needs a composite particle was given a final-state particle.
    #[error("Particle {id} is not a composite")]
    NotComposite {
        /// The final-state particle
        id: usize,
    },
    /// A particle id which does not belong to the decay tree.
    #[error("No particle with id {id} in this decay tree")]
    UnknownParticle {
        /// The id which failed lookup
        id: usize,
    },
    /// A combination was requested with fewer than two particles.
    #[error("At least two particles are needed for a combination, got {n}")]
    InsufficientDaughters {
        /// Number of particles supplied
        n: usize,
    },
    /// A packed parameter or covariance slice had the wrong length.
    #[error("Expected {expected} values for {what}, found {found}")]
    InvalidLength {
        /// What was being read
        what: &'static str,
        /// Required length
        expected: usize,
        /// Supplied length
        found: usize,
    },
    /// A derived quantity (mass, decay length, ...) whose value or error is not defined for the
    /// current state. The value computed anyway is carried along.
    #[error("Ill-defined {quantity} (value {value})")]
    IllDefinedQuantity {
        /// Name of the quantity
        quantity: &'static str,
        /// The value which was computed before the failure
        value: f64,
    },
    /// A custom fallback error for errors too complex or too infrequent to warrant their own error
    /// category.
    #[error("{0}")]
    Custom(String),
}
