//! `kfvertex` is a library for reconstructing decay vertices and composite particles from
//! charged-particle tracks with Kalman-filter techniques. It is meant as a small, dependable
//! building block for the vertexing stage of a reconstruction chain: tracks come in from an
//! upstream track fit, vertices and particle candidates go out to the analysis.
//!
//! <div class="warning">
//!
//! This crate is still in an early development phase, and the API is not stable.
//!
//! </div>
//!
//! # Table of Contents
//! - [Key Features](#key-features)
//! - [Quick Start](#quick-start)
//!   - [Fitting a Vertex](#fitting-a-vertex)
//!   - [Building a Composite Particle](#building-a-composite-particle)
//! - [Conventions](#conventions)
//! - [Diagnostics](#diagnostics)
//!
//! # Key Features
//! * An iterative Kalman [`VertexFitter`] over straight-line [`TrackState`]s with a pluggable
//!   [`Extrapolator`](crate::traits::Extrapolator).
//! * Explicit fit diagnostics: skipped tracks, singular systems and outlier candidates are
//!   reported with every [`VertexEstimate`] instead of being dropped silently.
//! * [`ParticleState`]s with an 8-parameter covariance, transported through a
//!   [`MagneticField`] supplied by the caller.
//! * Vertex-constrained combination of particles into composites held in a [`DecayTree`], with
//!   incremental daughters and transport to an independently known production vertex.
//! * Efficient parallelism over independent events using [`rayon`](https://github.com/rayon-rs/rayon).
//!
//! # Quick Start
//! ## Fitting a Vertex
//! Tracks are given by their local parameters `(x, y, tx, ty, q/p)` at a reference plane `z`,
//! together with the packed lower triangle of their 5×5 covariance:
//!
//! ```rust
//! use kfvertex::{TrackState, Vec3, VertexFitConfig, VertexFitter};
//!
//! let mut cov = [0.0; 15];
//! cov[0] = 0.01; // var(x)
//! cov[2] = 0.01; // var(y)
//! cov[5] = 1e-6; // var(tx)
//! cov[9] = 1e-6; // var(ty)
//! cov[14] = 1e-4; // var(q/p)
//! let tracks = [
//!     TrackState::new([-0.5, 0.0, 0.1, 0.0, 0.5], cov, 0.0),
//!     TrackState::new([0.0, -0.5, 0.0, 0.1, -0.5], cov, 0.0),
//! ];
//! let fitter = VertexFitter::new(VertexFitConfig::default().with_max_iterations(5));
//! let vertex = fitter.fit(&tracks, Vec3::zero());
//! assert!(vertex.is_valid());
//! assert!((vertex.position.z - 5.0).abs() < 1e-6);
//! assert_eq!(vertex.ndf, 1);
//! ```
//!
//! ## Building a Composite Particle
//! Tracks become [`ParticleState`]s once a mass hypothesis is attached. Particles live in a
//! [`DecayTree`] and are combined by a [`CompositeParticleBuilder`], which owns the magnetic
//! field used for every transport:
//!
//! ```rust
//! use kfvertex::{
//!     CompositeParticleBuilder, DecayTree, KfResult, ParticleState, TrackState, UniformField,
//! };
//!
//! fn main() -> KfResult<()> {
//!     let mut cov = [0.0; 15];
//!     cov[0] = 0.01;
//!     cov[2] = 0.01;
//!     cov[5] = 1e-6;
//!     cov[9] = 1e-6;
//!     cov[14] = 1e-6;
//!     let pi_plus = TrackState::new([-0.5, 0.0, 0.1, 0.0, 0.5], cov, 0.0);
//!     let pi_minus = TrackState::new([0.0, -0.5, 0.0, 0.1, -0.5], cov, 0.0);
//!
//!     let mut tree = DecayTree::new();
//!     let a = tree.add_particle(ParticleState::from_track_with_charge_sign(&pi_plus, 0.13957)?);
//!     let b = tree.add_particle(ParticleState::from_track_with_charge_sign(&pi_minus, 0.13957)?);
//!
//!     let builder = CompositeParticleBuilder::new(UniformField::zero());
//!     let k_short = builder.combine(&mut tree, a, b)?;
//!     let candidate = tree.get(k_short)?;
//!     assert_eq!(candidate.charge(), 0);
//!     assert!((candidate.z() - 5.0).abs() < 1e-6);
//!     println!("mass: {}", candidate.four_momentum().m());
//!     Ok(())
//! }
//! ```
//!
//! # Conventions
//! Positions are in millimetres, momenta and energies in GeV and fields in tesla. Symmetric
//! matrices cross the API as packed lower triangles in row-major order, so the element `(i, j)`
//! with `j ≤ i` sits at `i(i+1)/2 + j` (see [`utils::packed`]). The particle parameter vector
//! is `(x, y, z, px, py, pz, E, s)`, where `s` is the signed decay length divided by the
//! momentum.
//!
//! # Diagnostics
//! The library logs through [`tracing`](https://docs.rs/tracing) and never installs a
//! subscriber. Skipped tracks and singular daughter updates are reported at `debug` level,
//! fits which end with too few measurements at `warn` level.

/// Useful traits for all crate structs
pub mod traits {
    pub use kfvertex_core::traits::*;
    pub use kfvertex_particle::MagneticField;
}

/// Utility functions, packed covariance helpers and vector types.
pub mod utils {
    pub use kfvertex_core::utils::*;
}

/// Magnetic field sources.
pub mod field {
    pub use kfvertex_particle::field::*;
}

pub use kfvertex_core::{
    Extrapolator, FitDiagnostics, FitQuality, KfError, KfResult, LinearExtrapolator, SkipReason,
    TrackSkip, TrackState, Vec3, Vec4, VertexEstimate, VertexFitConfig, VertexFitter, C_LIGHT,
    SINGULAR_EPSILON,
};
pub use kfvertex_particle::{
    set_mass_constraint, CompositeParticleBuilder, DecayTree, MagneticField, Measurement,
    ParticleId, ParticleMatrix, ParticleState, ParticleVector, ProductionVertex,
    ProductionVertexReport, UniformField, UNDETERMINED_ERROR,
};
pub use serde::{Deserialize, Serialize};

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Tracks at `z = 0` from a common point with 0.1 mm position smearing.
    fn event(rng: &mut fastrand::Rng, vertex: Vec3, n: usize) -> Vec<TrackState> {
        let mut cov = [0.0; 15];
        cov[0] = 0.01;
        cov[2] = 0.01;
        cov[5] = 1e-6;
        cov[9] = 1e-6;
        cov[14] = 1e-6;
        (0..n)
            .map(|i| {
                let tx = rng.f64() * 0.3 - 0.15;
                let ty = rng.f64() * 0.3 - 0.15;
                let qp = if i % 2 == 0 { 0.4 } else { -0.4 };
                TrackState::new(
                    [
                        vertex.x - vertex.z * tx + (rng.f64() - 0.5) * 0.1,
                        vertex.y - vertex.z * ty + (rng.f64() - 0.5) * 0.1,
                        tx,
                        ty,
                        qp,
                    ],
                    cov,
                    0.0,
                )
            })
            .collect()
    }

    #[test]
    fn test_primary_and_secondary_vertex() {
        let mut rng = fastrand::Rng::with_seed(17);
        let primary_position = Vec3::new(0.0, 0.0, -20.0);
        let fitter = VertexFitter::new(VertexFitConfig::default());
        let primary = fitter.fit(&event(&mut rng, primary_position, 12), Vec3::zero());
        assert!(primary.ensure_valid().is_ok());
        assert_relative_eq!(primary.position.z, -20.0, epsilon = 1.0);

        // a two-prong decay downstream of the primary, flying along its own momentum
        let decay = Vec3::new(0.2, 0.1, 10.0);
        let tracks = event(&mut rng, decay, 2);
        let mut tree = DecayTree::new();
        let ids: Vec<ParticleId> = tracks
            .iter()
            .map(|t| {
                tree.add_particle(ParticleState::from_track_with_charge_sign(t, 0.13957).unwrap())
            })
            .collect();
        let builder = CompositeParticleBuilder::default();
        let candidate = builder.combine_all(&mut tree, &ids).unwrap();
        let secondary = tree.get(candidate).unwrap().clone();
        assert_relative_eq!(secondary.z(), 10.0, epsilon = 2.0);
        assert_eq!(secondary.ndf(), 1);

        let report = builder
            .transport_to_production_vertex(
                &mut tree,
                candidate,
                &ProductionVertex::from(&primary),
            )
            .unwrap();
        assert!(report.ds < 0.0);
        assert!(report.compatibility_chi2.is_some());
        let moved = tree.get(candidate).unwrap();
        assert!(moved.decay_length().unwrap().value > 0.0);
        assert_eq!(moved.momentum(), secondary.momentum());
    }

    #[test]
    fn test_fit_many_matches_fit() {
        let mut rng = fastrand::Rng::with_seed(23);
        let events: Vec<(Vec<TrackState>, Vec3)> = (0..16)
            .map(|i| (event(&mut rng, Vec3::new(0.0, 0.0, i as f64), 4), Vec3::zero()))
            .collect();
        let fitter = VertexFitter::new(VertexFitConfig::default());
        let many = fitter.fit_many(&events);
        for ((tracks, guess), estimate) in events.iter().zip(many.iter()) {
            assert_eq!(&fitter.fit(tracks, *guess), estimate);
        }
    }
}
