use std::fmt::Display;

use nalgebra::{Matrix2, Matrix5, Vector5};
use serde::{Deserialize, Serialize};

use crate::{
    utils::{
        packed::{pack_into, packed_index, unpack},
        to_array,
    },
    KfResult,
};

/// Placeholder variance assigned to `q/p` when a track comes from a fit which did not measure
/// curvature. It must stay non-zero so that the curvature is never treated as perfectly known.
pub const UNMEASURED_QOP_VARIANCE: f64 = 1.0;

/// Fixed `q/p` used for tracks from straight-line fits.
pub const DEFAULT_FIXED_QOP: f64 = 1.0;

/// Goodness-of-fit counters of an upstream fit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FitQuality {
    /// The fit chi-square
    pub chi2: f64,
    /// The number of degrees of freedom of the fit
    pub ndf: i32,
}

/// The local linear approximation of a trajectory at the plane `z`.
///
/// The parameter vector is `(x, y, tx, ty, q/p)` with `tx = dx/dz` and `ty = dy/dz`; the
/// covariance of these five values is stored as a packed lower triangle of 15 entries. A
/// [`TrackState`] is a plain value: extrapolations return new states and never touch the
/// original.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackState {
    params: [f64; 5],
    z: f64,
    covariance: [f64; 15],
    fit_quality: Option<FitQuality>,
}

impl Display for TrackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TrackState(z = {}, x = {}, y = {}, tx = {}, ty = {}, q/p = {})",
            self.z, self.params[0], self.params[1], self.params[2], self.params[3], self.params[4]
        )
    }
}

impl TrackState {
    /// Construct a [`TrackState`] from `(x, y, tx, ty, q/p)`, its packed covariance and the
    /// reference coordinate `z`.
    ///
    /// No check is made that the covariance is positive semi-definite.
    pub fn new(params: [f64; 5], covariance: [f64; 15], z: f64) -> Self {
        Self {
            params,
            z,
            covariance,
            fit_quality: None,
        }
    }

    /// Construct a [`TrackState`] from slices, in the six-parameter layout
    /// `(x, y, tx, ty, q/p, z)` plus 15 packed covariance values.
    ///
    /// # Errors
    ///
    /// Returns [`KfError::InvalidLength`](crate::KfError::InvalidLength) if either slice has
    /// the wrong length.
    pub fn from_slices(params: &[f64], covariance: &[f64]) -> KfResult<Self> {
        let p: [f64; 6] = to_array("track parameters", params)?;
        let cov: [f64; 15] = to_array("track covariance", covariance)?;
        Ok(Self::new([p[0], p[1], p[2], p[3], p[4]], cov, p[5]))
    }

    /// Construct a [`TrackState`] from a straight-line fit which only measured
    /// `(x, y, tx, ty)` (packed 4×4 covariance of 10 values) at `z`.
    ///
    /// The curvature is fixed to `q_over_p` and its variance is set to
    /// [`UNMEASURED_QOP_VARIANCE`]; its correlations with the measured parameters are zero.
    pub fn from_line_fit(params: [f64; 4], covariance: [f64; 10], z: f64, q_over_p: f64) -> Self {
        let mut cov = [0.0; 15];
        cov[..10].copy_from_slice(&covariance);
        cov[packed_index(4, 4)] = UNMEASURED_QOP_VARIANCE;
        Self::new(
            [params[0], params[1], params[2], params[3], q_over_p],
            cov,
            z,
        )
    }

    /// Attach the chi-square and degrees of freedom of the upstream track fit.
    pub fn with_fit_quality(mut self, chi2: f64, ndf: i32) -> Self {
        self.fit_quality = Some(FitQuality { chi2, ndf });
        self
    }

    pub fn x(&self) -> f64 {
        self.params[0]
    }
    pub fn y(&self) -> f64 {
        self.params[1]
    }
    pub fn tx(&self) -> f64 {
        self.params[2]
    }
    pub fn ty(&self) -> f64 {
        self.params[3]
    }
    pub fn q_over_p(&self) -> f64 {
        self.params[4]
    }
    pub fn z(&self) -> f64 {
        self.z
    }
    /// The five local parameters `(x, y, tx, ty, q/p)`.
    pub fn params(&self) -> &[f64; 5] {
        &self.params
    }
    /// The packed lower-triangular covariance of the five local parameters.
    pub fn covariance(&self) -> &[f64; 15] {
        &self.covariance
    }
    /// The upstream fit quality, if one was attached.
    pub fn fit_quality(&self) -> Option<FitQuality> {
        self.fit_quality
    }

    pub fn param_vector(&self) -> Vector5<f64> {
        Vector5::from(self.params)
    }
    pub fn covariance_matrix(&self) -> Matrix5<f64> {
        unpack(&self.covariance)
    }
    /// The 2×2 covariance of the transverse position `(x, y)`.
    pub fn position_covariance(&self) -> Matrix2<f64> {
        unpack(&self.covariance[..3])
    }

    /// Replace the parameters, reference coordinate and covariance, keeping the attached fit
    /// quality.
    pub(crate) fn with_state(&self, params: Vector5<f64>, z: f64, cov: &Matrix5<f64>) -> Self {
        let mut covariance = [0.0; 15];
        pack_into(cov, &mut covariance);
        Self {
            params: params.into(),
            z,
            covariance,
            fit_quality: self.fit_quality,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::KfError;

    /// A track with uncorrelated errors: 0.1 mm on positions, 1 mrad on slopes and 1% on q/p.
    pub fn test_track(x: f64, y: f64, tx: f64, ty: f64, z: f64) -> TrackState {
        let mut cov = [0.0; 15];
        cov[packed_index(0, 0)] = 0.01;
        cov[packed_index(1, 1)] = 0.01;
        cov[packed_index(2, 2)] = 1e-6;
        cov[packed_index(3, 3)] = 1e-6;
        cov[packed_index(4, 4)] = 1e-4;
        TrackState::new([x, y, tx, ty, 0.5], cov, z)
    }

    #[test]
    fn test_accessors() {
        let t = test_track(1.0, -2.0, 0.1, -0.05, 30.0);
        assert_eq!(t.x(), 1.0);
        assert_eq!(t.y(), -2.0);
        assert_eq!(t.tx(), 0.1);
        assert_eq!(t.ty(), -0.05);
        assert_eq!(t.q_over_p(), 0.5);
        assert_eq!(t.z(), 30.0);
        assert_eq!(t.position_covariance(), Matrix2::new(0.01, 0.0, 0.0, 0.01));
        assert_eq!(t.covariance_matrix()[(4, 4)], 1e-4);
        assert!(t.fit_quality().is_none());
    }

    #[test]
    fn test_from_slices() {
        let params = [0.5, 0.25, 0.01, 0.02, -0.4, -2338.0];
        let cov: Vec<f64> = (1..=15).map(|i| i as f64 * 0.1).collect();
        let t = TrackState::from_slices(&params, &cov).unwrap();
        assert_eq!(t.z(), -2338.0);
        assert_eq!(t.q_over_p(), -0.4);
        assert_eq!(t.covariance()[14], 1.5);
        let err = TrackState::from_slices(&params[..5], &cov).unwrap_err();
        assert!(matches!(err, KfError::InvalidLength { expected: 6, found: 5, .. }));
    }

    #[test]
    fn test_line_fit_curvature_placeholder() {
        let cov4: [f64; 10] = [1.0, 0.1, 2.0, 0.01, 0.02, 3.0, 0.03, 0.04, 0.05, 4.0];
        let t = TrackState::from_line_fit([1.0, 2.0, 0.1, 0.2], cov4, -2338.0, DEFAULT_FIXED_QOP)
            .with_fit_quality(12.5, 8);
        assert_eq!(t.q_over_p(), 1.0);
        let c = t.covariance_matrix();
        assert_eq!(c[(4, 4)], UNMEASURED_QOP_VARIANCE);
        for i in 0..4 {
            assert_eq!(c[(4, i)], 0.0);
        }
        assert_eq!(c[(3, 2)], 0.05);
        assert_eq!(
            t.fit_quality(),
            Some(FitQuality {
                chi2: 12.5,
                ndf: 8
            })
        );
    }

    #[test]
    fn test_copies_do_not_alias() {
        let a = test_track(0.0, 0.0, 0.0, 0.0, 0.0);
        let mut b = a.clone();
        b.params[0] = 5.0;
        b.covariance[0] = 9.0;
        assert_eq!(a.x(), 0.0);
        assert_eq!(a.covariance()[0], 0.01);
        assert_eq!(b.x(), 5.0);
        assert_eq!(b.covariance()[0], 9.0);
    }
}
