use std::fmt::Display;

use kfvertex_core::{
    utils::{
        packed::{pack_into, unpack},
        to_array,
    },
    FitQuality, KfError, KfResult, TrackState, Vec3, Vec4,
};
use nalgebra::{SMatrix, SVector};
use serde::{Deserialize, Serialize};

/// The parameter vector `(x, y, z, px, py, pz, E, s)` of a [`ParticleState`].
pub type ParticleVector = SVector<f64, 8>;
/// The covariance of a [`ParticleVector`].
pub type ParticleMatrix = SMatrix<f64, 8, 8>;

/// Error reported for a quantity whose value is meaningful but whose uncertainty cannot be
/// propagated (the mass of a massless state, for instance).
pub const UNDETERMINED_ERROR: f64 = 1e20;

/// A derived quantity and its propagated one-sigma uncertainty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub value: f64,
    pub error: f64,
}

impl Measurement {
    pub fn new(value: f64, error: f64) -> Self {
        Self { value, error }
    }
}

impl Display for Measurement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ± {}", self.value, self.error)
    }
}

/// The kinematic state of a particle: position, momentum, energy and the decay length
/// parameter `s` (signed decay length divided by momentum), with their 8×8 covariance.
///
/// A [`ParticleState`] is built either from a single [`TrackState`] or by combining other
/// particles (see [`CompositeParticleBuilder`](crate::CompositeParticleBuilder)). It carries
/// its own fit-quality counters, which start at `chi2 = 0`, `ndf = 0` for a particle made from
/// a track; the quality of the upstream track fit is kept separately in
/// [`ParticleState::track_fit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticleState {
    pub(crate) params: ParticleVector,
    pub(crate) covariance: ParticleMatrix,
    pub(crate) charge: i32,
    pub(crate) chi2: f64,
    pub(crate) ndf: i32,
    pub(crate) s_from_decay: f64,
    pub(crate) at_production_vertex: bool,
    pub(crate) vertex_guess: Option<Vec3>,
    pub(crate) mass_hypothesis: Option<f64>,
    pub(crate) sum_daughter_mass: f64,
    pub(crate) track_fit: Option<FitQuality>,
}

impl Display for ParticleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ParticleState(q = {}, r = {}, p4 = {}, chi2/ndf = {}/{})",
            self.charge,
            self.position(),
            self.four_momentum(),
            self.chi2,
            self.ndf
        )
    }
}

impl ParticleState {
    /// Construct a particle from a cartesian state `(x, y, z, px, py, pz)`, the packed lower
    /// triangle of its 6×6 covariance, a charge and a mass hypothesis.
    ///
    /// The energy is `√(m² + p²)` with its covariance row propagated from the momentum. The
    /// decay length parameter starts at zero with unit variance.
    pub fn new(params: [f64; 6], covariance: [f64; 21], charge: i32, mass: f64) -> Self {
        let position = Vec3::new(params[0], params[1], params[2]);
        let momentum = Vec3::new(params[3], params[4], params[5]);
        Self::from_cartesian(position, momentum, &unpack(&covariance), charge, mass)
    }

    /// Like [`ParticleState::new`], reading the state and covariance from slices.
    ///
    /// # Errors
    ///
    /// Returns [`KfError::InvalidLength`] unless the slices hold 6 and 21 values.
    pub fn from_slices(
        params: &[f64],
        covariance: &[f64],
        charge: i32,
        mass: f64,
    ) -> KfResult<Self> {
        Ok(Self::new(
            to_array("particle parameters", params)?,
            to_array("particle covariance", covariance)?,
            charge,
            mass,
        ))
    }

    /// Convert a track into a particle of the given mass and charge.
    ///
    /// With `c² = 1/(1 + tx² + ty²)` and `|p| = 1/|q/p|`, the momentum is
    /// `pz = |p|·c`, `px = tx·pz`, `py = ty·pz`, taken at `(x, y, z)` of the track. The
    /// covariance is the image of the track covariance under the Jacobian of this map.
    ///
    /// # Errors
    ///
    /// Returns [`KfError::IllDefinedQuantity`] if `q/p` is zero or not finite.
    pub fn from_track(track: &TrackState, mass: f64, charge: i32) -> KfResult<Self> {
        let qp = track.q_over_p();
        if qp == 0.0 || !qp.is_finite() {
            return Err(KfError::IllDefinedQuantity {
                quantity: "q/p",
                value: qp,
            });
        }
        let (a, b) = (track.tx(), track.ty());
        let c2 = 1.0 / (1.0 + a * a + b * b);
        let pq = 1.0 / qp;
        let pz = (pq * pq * c2).sqrt();
        let px = a * pz;
        let py = b * pz;
        // d(pz)/d(tx, ty, q/p)
        let h = [-px * c2, -py * c2, -pz * pq];

        let mut j = SMatrix::<f64, 6, 5>::zeros();
        j[(0, 0)] = 1.0;
        j[(1, 1)] = 1.0;
        for (k, hk) in h.iter().enumerate() {
            j[(3, 2 + k)] = a * hk;
            j[(4, 2 + k)] = b * hk;
            j[(5, 2 + k)] = *hk;
        }
        j[(3, 2)] += pz;
        j[(4, 3)] += pz;
        let cov = j * track.covariance_matrix() * j.transpose();

        let mut state = Self::from_cartesian(
            Vec3::new(track.x(), track.y(), track.z()),
            Vec3::new(px, py, pz),
            &cov,
            charge,
            mass,
        );
        state.track_fit = track.fit_quality();
        Ok(state)
    }

    /// Convert a track into a particle, taking the charge from the sign of `q/p`.
    pub fn from_track_with_charge_sign(track: &TrackState, mass: f64) -> KfResult<Self> {
        let charge = if track.q_over_p() > 0.0 {
            1
        } else if track.q_over_p() < 0.0 {
            -1
        } else {
            0
        };
        Self::from_track(track, mass, charge)
    }

    fn from_cartesian(
        position: Vec3,
        momentum: Vec3,
        covariance: &SMatrix<f64, 6, 6>,
        charge: i32,
        mass: f64,
    ) -> Self {
        let energy = (mass * mass + momentum.mag2()).sqrt();
        let mut params = ParticleVector::zeros();
        params[0] = position.x;
        params[1] = position.y;
        params[2] = position.z;
        params[3] = momentum.x;
        params[4] = momentum.y;
        params[5] = momentum.z;
        params[6] = energy;

        // (x, y, z, px, py, pz) -> (x, y, z, px, py, pz, E, s)
        let mut j = SMatrix::<f64, 8, 6>::zeros();
        for i in 0..6 {
            j[(i, i)] = 1.0;
        }
        if energy > 0.0 {
            j[(6, 3)] = momentum.x / energy;
            j[(6, 4)] = momentum.y / energy;
            j[(6, 5)] = momentum.z / energy;
        }
        let mut cov = j * covariance * j.transpose();
        cov[(7, 7)] = 1.0;

        Self {
            params,
            covariance: cov,
            charge,
            chi2: 0.0,
            ndf: 0,
            s_from_decay: 0.0,
            at_production_vertex: false,
            vertex_guess: None,
            mass_hypothesis: Some(mass),
            sum_daughter_mass: mass,
            track_fit: None,
        }
    }

    /// The state of a composite before any daughter was added.
    pub(crate) fn empty_composite() -> Self {
        Self {
            params: ParticleVector::zeros(),
            covariance: ParticleMatrix::zeros(),
            charge: 0,
            chi2: 0.0,
            ndf: -3,
            s_from_decay: 0.0,
            at_production_vertex: false,
            vertex_guess: None,
            mass_hypothesis: None,
            sum_daughter_mass: 0.0,
            track_fit: None,
        }
    }

    pub fn x(&self) -> f64 {
        self.params[0]
    }
    pub fn y(&self) -> f64 {
        self.params[1]
    }
    pub fn z(&self) -> f64 {
        self.params[2]
    }
    pub fn px(&self) -> f64 {
        self.params[3]
    }
    pub fn py(&self) -> f64 {
        self.params[4]
    }
    pub fn pz(&self) -> f64 {
        self.params[5]
    }
    pub fn e(&self) -> f64 {
        self.params[6]
    }
    /// The decay length parameter, signed decay length over momentum.
    pub fn s(&self) -> f64 {
        self.params[7]
    }
    pub fn charge(&self) -> i32 {
        self.charge
    }
    pub fn chi2(&self) -> f64 {
        self.chi2
    }
    pub fn ndf(&self) -> i32 {
        self.ndf
    }
    pub fn position(&self) -> Vec3 {
        Vec3::new(self.params[0], self.params[1], self.params[2])
    }
    pub fn momentum(&self) -> Vec3 {
        Vec3::new(self.params[3], self.params[4], self.params[5])
    }
    pub fn four_momentum(&self) -> Vec4 {
        self.momentum().with_energy(self.e())
    }
    pub fn params(&self) -> &ParticleVector {
        &self.params
    }
    pub fn covariance(&self) -> &ParticleMatrix {
        &self.covariance
    }
    /// The covariance as a packed lower triangle of 36 values.
    pub fn packed_covariance(&self) -> [f64; 36] {
        let mut out = [0.0; 36];
        pack_into(&self.covariance, &mut out);
        out
    }
    /// Path over momentum travelled since the decay vertex.
    pub fn s_from_decay(&self) -> f64 {
        self.s_from_decay
    }
    /// Whether the position errors currently refer to the production vertex.
    pub fn at_production_vertex(&self) -> bool {
        self.at_production_vertex
    }
    pub fn vertex_guess(&self) -> Option<Vec3> {
        self.vertex_guess
    }
    /// Linearise the next daughter update around `guess` instead of searching for it.
    pub fn set_vertex_guess(&mut self, guess: Vec3) {
        self.vertex_guess = Some(guess);
    }
    pub fn clear_vertex_guess(&mut self) {
        self.vertex_guess = None;
    }
    /// The mass this particle is constrained to when used as a daughter, if any.
    pub fn mass_hypothesis(&self) -> Option<f64> {
        self.mass_hypothesis
    }
    pub fn sum_daughter_mass(&self) -> f64 {
        self.sum_daughter_mass
    }
    /// The quality of the track fit this particle was made from.
    pub fn track_fit(&self) -> Option<FitQuality> {
        self.track_fit
    }

    fn variance_along(&self, gradient: &ParticleVector) -> f64 {
        gradient.dot(&(self.covariance * gradient))
    }

    /// Total momentum.
    ///
    /// # Errors
    ///
    /// Returns [`KfError::IllDefinedQuantity`] for momenta below `1e-4` or a vanishing
    /// variance.
    pub fn p(&self) -> KfResult<Measurement> {
        let p = self.momentum().mag();
        let mut g = ParticleVector::zeros();
        g.fixed_rows_mut::<3>(3).copy_from(&self.params.fixed_rows::<3>(3));
        let var = self.variance_along(&g);
        if var > 1e-16 && p > 1e-4 {
            return Ok(Measurement::new(p, var.sqrt() / p));
        }
        Err(KfError::IllDefinedQuantity {
            quantity: "momentum",
            value: p,
        })
    }

    /// Transverse momentum.
    pub fn pt(&self) -> KfResult<Measurement> {
        let (px, py) = (self.px(), self.py());
        let pt = px.hypot(py);
        let mut g = ParticleVector::zeros();
        g[3] = px;
        g[4] = py;
        let var = self.variance_along(&g);
        if var > 0.0 && pt > 1e-4 {
            return Ok(Measurement::new(pt, var.sqrt() / pt));
        }
        Err(KfError::IllDefinedQuantity {
            quantity: "transverse momentum",
            value: pt,
        })
    }

    /// Azimuth of the momentum.
    pub fn phi(&self) -> KfResult<Measurement> {
        let (px, py) = (self.px(), self.py());
        let pt2 = px * px + py * py;
        let phi = py.atan2(px);
        let mut g = ParticleVector::zeros();
        g[3] = -py;
        g[4] = px;
        let var = self.variance_along(&g);
        if var > 0.0 && pt2 > 1e-4 {
            return Ok(Measurement::new(phi, var.sqrt() / pt2));
        }
        Err(KfError::IllDefinedQuantity {
            quantity: "phi",
            value: phi,
        })
    }

    /// Distance of the position from the `z` axis.
    pub fn r(&self) -> KfResult<Measurement> {
        let (x, y) = (self.x(), self.y());
        let r = x.hypot(y);
        let mut g = ParticleVector::zeros();
        g[0] = x;
        g[1] = y;
        let var = self.variance_along(&g);
        if var > 0.0 && r > 1e-4 {
            return Ok(Measurement::new(r, var.sqrt() / r));
        }
        Err(KfError::IllDefinedQuantity {
            quantity: "radius",
            value: r,
        })
    }

    /// Invariant mass.
    ///
    /// A state with `m² < 0` fails, carrying `-√(-m²)` as the value. A (nearly) massless state
    /// succeeds with an error of [`UNDETERMINED_ERROR`].
    pub fn mass(&self) -> KfResult<Measurement> {
        let m2 = self.four_momentum().m2();
        if m2 < 0.0 {
            return Err(KfError::IllDefinedQuantity {
                quantity: "mass",
                value: -(-m2).sqrt(),
            });
        }
        let m = m2.sqrt();
        if m <= 1e-6 {
            return Ok(Measurement::new(m, UNDETERMINED_ERROR));
        }
        // variance of m²/2
        let mut g = ParticleVector::zeros();
        g[3] = -self.px();
        g[4] = -self.py();
        g[5] = -self.pz();
        g[6] = self.e();
        let var = self.variance_along(&g);
        if var >= 0.0 {
            return Ok(Measurement::new(m, var.sqrt() / m));
        }
        Err(KfError::IllDefinedQuantity {
            quantity: "mass",
            value: m,
        })
    }

    /// Decay length `s·|p|`.
    pub fn decay_length(&self) -> KfResult<Measurement> {
        let t = self.s();
        let p2 = self.momentum().mag2();
        let p = p2.sqrt();
        if p2 > 1e-4 {
            let mut g = ParticleVector::zeros();
            for i in 3..6 {
                g[i] = t * self.params[i] / p;
            }
            g[7] = p;
            let var = self.variance_along(&g);
            return Ok(Measurement::new(t * p, var.abs().sqrt()));
        }
        Err(KfError::IllDefinedQuantity {
            quantity: "decay length",
            value: t * p,
        })
    }

    /// Decay length projected on the transverse plane, `s·pt`.
    pub fn decay_length_xy(&self) -> KfResult<Measurement> {
        let t = self.s();
        let pt2 = self.px() * self.px() + self.py() * self.py();
        let pt = pt2.sqrt();
        if pt2 > 1e-4 {
            let mut g = ParticleVector::zeros();
            g[3] = t * self.px() / pt;
            g[4] = t * self.py() / pt;
            g[7] = pt;
            let var = self.variance_along(&g);
            return Ok(Measurement::new(t * pt, var.abs().sqrt()));
        }
        Err(KfError::IllDefinedQuantity {
            quantity: "transverse decay length",
            value: t * pt,
        })
    }

    /// Proper decay length `cτ = s·m`.
    pub fn lifetime(&self) -> KfResult<Measurement> {
        let (m, dm) = match self.mass() {
            Ok(mass) => (mass.value, mass.error),
            Err(KfError::IllDefinedQuantity { value, .. }) => (value, UNDETERMINED_ERROR),
            Err(err) => return Err(err),
        };
        let t = self.s();
        let c = &self.covariance;
        // covariance of s with m²/2
        let c_tm = -self.px() * c[(7, 3)] - self.py() * c[(7, 4)] - self.pz() * c[(7, 5)]
            + self.e() * c[(7, 6)];
        let var = m * m * c[(7, 7)] + 2.0 * t * c_tm + t * t * dm * dm;
        if var > 0.0 {
            return Ok(Measurement::new(t * m, var.sqrt()));
        }
        Err(KfError::IllDefinedQuantity {
            quantity: "lifetime",
            value: t * m,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use kfvertex_core::utils::packed::packed_index;

    /// A track at `z` with 0.1 mm position errors, 1 mrad slope errors and 1% on q/p.
    pub fn test_track(x: f64, y: f64, tx: f64, ty: f64, qp: f64, z: f64) -> TrackState {
        let mut cov = [0.0; 15];
        cov[packed_index(0, 0)] = 0.01;
        cov[packed_index(1, 1)] = 0.01;
        cov[packed_index(2, 2)] = 1e-6;
        cov[packed_index(3, 3)] = 1e-6;
        cov[packed_index(4, 4)] = (0.01 * qp).powi(2);
        TrackState::new([x, y, tx, ty, qp], cov, z)
    }

    #[test]
    fn test_from_track_kinematics() {
        let track = test_track(0.0, 2.0, 0.0, 0.2, 0.1, 10.0).with_fit_quality(3.0, 4);
        let p = ParticleState::from_track(&track, 0.13957, 1).unwrap();
        assert_relative_eq!(p.momentum().mag(), 10.0, epsilon = 1e-12);
        assert_relative_eq!(p.py() / p.pz(), 0.2, epsilon = 1e-12);
        assert_eq!(p.px(), 0.0);
        assert_eq!(p.position(), Vec3::new(0.0, 2.0, 10.0));
        assert_relative_eq!(p.four_momentum().m(), 0.13957, epsilon = 1e-9);
        assert_eq!(p.chi2(), 0.0);
        assert_eq!(p.ndf(), 0);
        assert_eq!(
            p.track_fit(),
            Some(FitQuality {
                chi2: 3.0,
                ndf: 4
            })
        );
        assert_eq!(p.mass_hypothesis(), Some(0.13957));
        assert_eq!(p.covariance()[(7, 7)], 1.0);
        assert_eq!(p.covariance()[(2, 2)], 0.0);
    }

    #[test]
    fn test_from_track_covariance() {
        let track = test_track(1.0, -1.0, 0.1, -0.05, -0.5, 0.0);
        let p = ParticleState::from_track_with_charge_sign(&track, 0.000511).unwrap();
        assert_eq!(p.charge(), -1);
        let c = p.covariance();
        assert_relative_eq!(*c, c.transpose(), epsilon = 1e-15);
        // The momentum error is the q/p error: dp/p = d(q/p)/(q/p) = 1%.
        let pm = p.p().unwrap();
        assert_relative_eq!(pm.value, 2.0, epsilon = 1e-12);
        assert_relative_eq!(pm.error, 0.02, epsilon = 1e-6);
        // Energy is fully correlated with momentum for a light particle.
        let rho = c[(6, 5)] / (c[(6, 6)] * c[(5, 5)]).sqrt();
        assert!(rho > 0.99);
    }

    #[test]
    fn test_new_and_slices() {
        let mut cov = [0.0; 21];
        for i in 0..6 {
            cov[packed_index(i, i)] = 0.1;
        }
        let p = ParticleState::new([0.0, 0.0, 0.0, 3.0, 0.0, 4.0], cov, 0, 0.0);
        assert_relative_eq!(p.e(), 5.0);
        assert_relative_eq!(p.covariance()[(6, 6)], 0.1 * (9.0 + 16.0) / 25.0);
        let err = ParticleState::from_slices(&[0.0; 5], &cov, 0, 0.0).unwrap_err();
        assert!(matches!(err, KfError::InvalidLength { expected: 6, .. }));
        assert_eq!(p.packed_covariance()[35], 1.0);
    }

    #[test]
    fn test_zero_curvature_is_rejected() {
        let track = test_track(0.0, 0.0, 0.0, 0.0, 0.0, 0.0);
        assert!(matches!(
            ParticleState::from_track(&track, 0.1, 1),
            Err(KfError::IllDefinedQuantity { quantity: "q/p", .. })
        ));
    }

    #[test]
    fn test_derived_quantities() {
        let mut cov = [0.0; 21];
        for i in 0..6 {
            cov[packed_index(i, i)] = 0.04;
        }
        let mut p = ParticleState::new([3.0, 4.0, 1.0, 0.6, 0.8, 2.0], cov, 1, 0.5);
        let pt = p.pt().unwrap();
        assert_relative_eq!(pt.value, 1.0);
        assert_relative_eq!(pt.error, 0.2, epsilon = 1e-12);
        let phi = p.phi().unwrap();
        assert_relative_eq!(phi.value, 0.8_f64.atan2(0.6));
        assert_relative_eq!(phi.error, 0.2, epsilon = 1e-12);
        let r = p.r().unwrap();
        assert_relative_eq!(r.value, 5.0);
        assert_relative_eq!(r.error, 0.2, epsilon = 1e-12);

        p.params[7] = 0.5;
        let l = p.decay_length().unwrap();
        assert_relative_eq!(l.value, 0.5 * 5.0_f64.sqrt());
        let lxy = p.decay_length_xy().unwrap();
        assert_relative_eq!(lxy.value, 0.5);
        let ct = p.lifetime().unwrap();
        assert_relative_eq!(ct.value, 0.25, epsilon = 1e-12);
        assert!(ct.error > 0.0);
    }

    #[test]
    fn test_unphysical_mass() {
        let mut p = ParticleState::new([0.0, 0.0, 0.0, 3.0, 0.0, 4.0], [0.0; 21], 0, 0.0);
        p.params[6] = 3.0;
        match p.mass() {
            Err(KfError::IllDefinedQuantity { quantity, value }) => {
                assert_eq!(quantity, "mass");
                assert_relative_eq!(value, -4.0);
            }
            other => panic!("unexpected {:?}", other),
        }
        p.params[6] = 5.0;
        let m = p.mass().unwrap();
        assert_eq!(m.value, 0.0);
        assert_eq!(m.error, UNDETERMINED_ERROR);
    }

    #[test]
    fn test_momentum_needs_variance() {
        let p = ParticleState::new([0.0, 0.0, 0.0, 3.0, 0.0, 4.0], [0.0; 21], 0, 0.1);
        assert!(matches!(
            p.p(),
            Err(KfError::IllDefinedQuantity {
                quantity: "momentum",
                ..
            })
        ));
        assert_eq!(format!("{}", Measurement::new(1.5, 0.25)), "1.5 ± 0.25");
    }
}
