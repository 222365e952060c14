use nalgebra::{SMatrix, SVector};

use crate::particle::ParticleState;

/// The first seven parameters `(x, y, z, px, py, pz, E)` of a particle.
pub type KinematicVector = SVector<f64, 7>;
/// The covariance of a [`KinematicVector`].
pub type KinematicMatrix = SMatrix<f64, 7, 7>;

const MAX_ITERATIONS: usize = 100;
const TOLERANCE: f64 = 1e-8;
const MIN_DERIVATIVE: f64 = 1e-10;

/// Force `E² - p² = mass²` on a kinematic state.
///
/// The momentum is scaled by `1/(1-λ)` and the energy by `1/(1+λ)`, where the multiplier `λ`
/// is the root of
///
/// ```text
/// f(λ) = -m²λ⁴ + aλ² + bλ + c
/// a = E² - p² + 2m²,  b = -2(E² + p²),  c = E² - p² - m²
/// ```
///
/// found by Newton's method from the closed-form root of the quadratic part. The covariance is
/// replaced by `J C Jᵀ` and `J` is returned so that correlated quantities can be propagated
/// consistently.
pub fn set_mass_constraint(
    params: &mut KinematicVector,
    covariance: &mut KinematicMatrix,
    mass: f64,
) -> KinematicMatrix {
    let energy = params[6];
    let energy2 = energy * energy;
    let p2 = params.fixed_rows::<3>(3).norm_squared();
    let mass2 = mass * mass;

    let a = energy2 - p2 + 2.0 * mass2;
    let b = -2.0 * (energy2 + p2);
    let c = energy2 - p2 - mass2;

    let mut lambda = 0.0;
    if b.abs() > MIN_DERIVATIVE {
        lambda = -c / b;
    }
    let d = 4.0 * energy2 * p2 - mass2 * (energy2 - p2 - 2.0 * mass2);
    if d >= 0.0 && a.abs() > MIN_DERIVATIVE {
        lambda = (energy2 + p2 - d.sqrt()) / a;
    }
    // a negative energy needs a large negative multiplier to flip sign
    if energy < 0.0 {
        lambda = -1e6;
    }

    let derivative = |l: f64| -4.0 * mass2 * l * l * l + 2.0 * a * l + b;
    for _ in 0..MAX_ITERATIONS {
        let l2 = lambda * lambda;
        let f = -mass2 * l2 * l2 + a * l2 + b * lambda + c;
        let df = derivative(lambda);
        if df.abs() < MIN_DERIVATIVE {
            break;
        }
        let step = f / df;
        lambda -= step;
        if step.abs() < TOLERANCE {
            break;
        }
    }

    let lpi = 1.0 / (1.0 + lambda);
    let lmi = 1.0 / (1.0 - lambda);
    let dfl = derivative(lambda);
    let dfx = [
        -2.0 * (1.0 + lambda).powi(2) * params[3],
        -2.0 * (1.0 + lambda).powi(2) * params[4],
        -2.0 * (1.0 + lambda).powi(2) * params[5],
        2.0 * (1.0 - lambda).powi(2) * energy,
    ];
    let dlx = if dfl.abs() > MIN_DERIVATIVE {
        dfx.map(|v| -v / dfl)
    } else {
        [1.0; 4]
    };
    let dxx = [
        params[3] * lmi * lmi,
        params[4] * lmi * lmi,
        params[5] * lmi * lmi,
        -energy * lpi * lpi,
    ];

    let mut j = KinematicMatrix::zeros();
    for i in 0..3 {
        j[(i, i)] = 1.0;
    }
    for i in 3..7 {
        for k in 3..7 {
            j[(i, k)] = dlx[k - 3] * dxx[i - 3];
        }
    }
    for i in 3..6 {
        j[(i, i)] += lmi;
    }
    j[(6, 6)] += lpi;

    let cj = j * *covariance * j.transpose();
    *covariance = (cj + cj.transpose()) * 0.5;
    for i in 3..6 {
        params[i] *= lmi;
    }
    params[6] *= lpi;
    j
}

impl ParticleState {
    /// Constrain the invariant mass of this particle to `mass`, leaving the position and decay
    /// length parameter untouched.
    pub fn set_mass_constraint(&mut self, mass: f64) {
        let mut params = self.params.fixed_rows::<7>(0).into_owned();
        let mut cov = self.covariance.fixed_view::<7, 7>(0, 0).into_owned();
        let j = set_mass_constraint(&mut params, &mut cov, mass);
        // propagate the correlations with s
        let cross = j * self.covariance.fixed_view::<7, 1>(0, 7);
        self.params.fixed_rows_mut::<7>(0).copy_from(&params);
        self.covariance.fixed_view_mut::<7, 7>(0, 0).copy_from(&cov);
        self.covariance.fixed_view_mut::<7, 1>(0, 7).copy_from(&cross);
        self.covariance
            .fixed_view_mut::<1, 7>(7, 0)
            .copy_from(&cross.transpose());
        self.mass_hypothesis = Some(mass);
    }
}
