//! # kfvertex-particle
//!
//! This is an internal crate used by `kfvertex`. It holds the kinematic particle state, its
//! transport through a magnetic field and the construction of composite particles from their
//! decay products.
#![warn(clippy::perf, clippy::style)]
#![allow(clippy::excessive_precision)]

/// Sources of magnetic field values.
pub mod field;
/// The kinematic state of a particle and the quantities derived from it.
pub mod particle;
/// Transport of particles along their trajectories and closest-approach searches.
pub mod transport;
/// The nonlinear invariant-mass constraint.
pub mod mass_constraint;
/// The decay tree arena and the vertex-constrained combination of particles.
pub mod composite;

pub use crate::composite::{
    CompositeParticleBuilder, DecayTree, ParticleId, ProductionVertex, ProductionVertexReport,
};
pub use crate::field::{MagneticField, UniformField};
pub use crate::mass_constraint::set_mass_constraint;
pub use crate::particle::{
    Measurement, ParticleMatrix, ParticleState, ParticleVector, UNDETERMINED_ERROR,
};
