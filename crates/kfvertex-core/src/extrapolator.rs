use nalgebra::Matrix5;
use serde::{Deserialize, Serialize};

use crate::track::TrackState;

/// A propagation model which moves a [`TrackState`] to another reference plane.
///
/// Implementations must be pure: the input state is never modified and the same input always
/// gives the same output.
pub trait Extrapolator: Send + Sync {
    /// Propagate `state` to the plane `z_target`, returning the new state with its propagated
    /// covariance.
    fn extrapolate(&self, state: &TrackState, z_target: f64) -> TrackState;
}

/// Straight-line propagation in a field-free region.
///
/// Positions move along the slopes, `x' = x + dz·tx` and `y' = y + dz·ty`, while slopes and
/// `q/p` are unchanged. The covariance is transformed with the Jacobian
///
/// ```text
///     | 1 0 dz  0 0 |
///     | 0 1  0 dz 0 |
/// J = | 0 0  1  0 0 |
///     | 0 0  0  1 0 |
///     | 0 0  0  0 1 |
/// ```
///
/// as `C' = J C Jᵀ`. The transformation is exact, so extrapolating forth and back returns the
/// original state up to rounding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinearExtrapolator;

impl LinearExtrapolator {
    /// The transport Jacobian for a step of `dz`.
    pub fn jacobian(dz: f64) -> Matrix5<f64> {
        let mut j = Matrix5::identity();
        j[(0, 2)] = dz;
        j[(1, 3)] = dz;
        j
    }
}

impl Extrapolator for LinearExtrapolator {
    fn extrapolate(&self, state: &TrackState, z_target: f64) -> TrackState {
        let dz = z_target - state.z();
        let mut params = state.param_vector();
        params[0] += dz * params[2];
        params[1] += dz * params[3];
        let j = Self::jacobian(dz);
        let cov = j * state.covariance_matrix() * j.transpose();
        state.with_state(params, z_target, &cov)
    }
}
