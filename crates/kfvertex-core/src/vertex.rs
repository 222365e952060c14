use std::fmt::Display;

use nalgebra::{Matrix2, Matrix2x3, Matrix3, Matrix3x2, Vector2, Vector3};
#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    extrapolator::{Extrapolator, LinearExtrapolator},
    track::TrackState,
    utils::{
        packed::{invert_sym2_with_epsilon, pack_into, unpack},
        vectors::Vec3,
    },
    KfError, KfResult, SINGULAR_EPSILON,
};

/// Default number of passes over the tracks.
pub const DEFAULT_MAX_ITERATIONS: usize = 10;
/// Default pre-fit deviation threshold, `3.5²`.
pub const DEFAULT_CHI2_CUT_PER_DOF: f64 = 3.5 * 3.5;
/// Default variance (mm²) of the isotropic prior placed on the vertex at the start of each pass.
pub const DEFAULT_PRIOR_VARIANCE: f64 = 100.0;

/// Settings for a [`VertexFitter`].
///
/// All fields have defaults and can be adjusted with the `with_*` methods:
///
/// ```
/// use kfvertex_core::VertexFitConfig;
/// let config = VertexFitConfig::default().with_max_iterations(5);
/// assert_eq!(config.max_iterations, 5);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VertexFitConfig {
    /// Number of passes over the tracks. There is no early exit.
    pub max_iterations: usize,
    /// Threshold on the pre-fit deviation of a track from the previous estimate. Tracks over
    /// the threshold are only counted in [`FitDiagnostics::outlier_candidates`].
    pub chi2_cut_per_dof: f64,
    /// Diagonal of the vertex covariance at the start of every pass.
    pub prior_variance: f64,
    /// Determinant below which a 2×2 matrix is treated as singular.
    pub singular_epsilon: f64,
}

impl Default for VertexFitConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            chi2_cut_per_dof: DEFAULT_CHI2_CUT_PER_DOF,
            prior_variance: DEFAULT_PRIOR_VARIANCE,
            singular_epsilon: SINGULAR_EPSILON,
        }
    }
}

impl VertexFitConfig {
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }
    pub fn with_chi2_cut_per_dof(mut self, chi2_cut_per_dof: f64) -> Self {
        self.chi2_cut_per_dof = chi2_cut_per_dof;
        self
    }
    pub fn with_prior_variance(mut self, prior_variance: f64) -> Self {
        self.prior_variance = prior_variance;
        self
    }
    pub fn with_singular_epsilon(mut self, singular_epsilon: f64) -> Self {
        self.singular_epsilon = singular_epsilon;
        self
    }
}

/// Why a track was left out of one pass of the fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// The 2×2 covariance of the extrapolated track position could not be inverted, so the
    /// slopes could not be re-estimated.
    SingularPositionCovariance,
    /// The 2×2 innovation covariance `V + H C Hᵀ` could not be inverted.
    SingularInnovation,
}

impl Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::SingularPositionCovariance => write!(f, "singular position covariance"),
            SkipReason::SingularInnovation => write!(f, "singular innovation covariance"),
        }
    }
}

/// A track skipped in the final pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackSkip {
    /// Position of the track in the input slice
    pub index: usize,
    pub reason: SkipReason,
    /// The determinant which failed the threshold
    pub determinant: f64,
}

/// Bookkeeping of what the fitter did with each track.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FitDiagnostics {
    /// Number of skipped tracks in each pass, in pass order.
    pub skipped_per_iteration: Vec<usize>,
    /// The tracks skipped in the final pass.
    pub final_skips: Vec<TrackSkip>,
    /// Number of tracks in the final pass whose deviation from the previous estimate exceeded
    /// [`VertexFitConfig::chi2_cut_per_dof`]. They were used in the fit regardless.
    pub outlier_candidates: usize,
}

impl FitDiagnostics {
    /// Total number of skips over all passes.
    pub fn total_skips(&self) -> usize {
        self.skipped_per_iteration.iter().sum()
    }
}

/// The result of a vertex fit.
///
/// Counters and the covariance describe the final pass only. `ndf` is `2·n_tracks - 3` and may
/// be negative; in that case `insufficient_measurements` is set and the estimate is not a
/// constrained vertex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VertexEstimate {
    pub position: Vec3,
    /// Packed lower triangle of the 3×3 position covariance.
    pub covariance: [f64; 6],
    pub chi2: f64,
    pub ndf: i32,
    /// Tracks which contributed to the final pass.
    pub n_tracks: usize,
    pub insufficient_measurements: bool,
    pub diagnostics: FitDiagnostics,
}

impl VertexEstimate {
    /// Whether the estimate is constrained by enough tracks.
    pub fn is_valid(&self) -> bool {
        !self.insufficient_measurements
    }
    /// The full 3×3 position covariance.
    pub fn covariance_matrix(&self) -> Matrix3<f64> {
        unpack(&self.covariance)
    }
    /// Return `self` if it is constrained by enough tracks.
    ///
    /// # Errors
    ///
    /// Returns [`KfError::InsufficientMeasurements`] otherwise.
    pub fn ensure_valid(&self) -> KfResult<&Self> {
        if self.insufficient_measurements {
            return Err(KfError::InsufficientMeasurements {
                n_tracks: self.n_tracks,
                ndf: self.ndf,
            });
        }
        Ok(self)
    }
    /// Like [`VertexEstimate::ensure_valid`], but also refuse fits in which any track was
    /// skipped in the final pass.
    ///
    /// # Errors
    ///
    /// Returns [`KfError::InsufficientMeasurements`] or, for the first skipped track,
    /// [`KfError::SingularMatrix`].
    pub fn ensure_clean(&self) -> KfResult<&Self> {
        self.ensure_valid()?;
        if let Some(skip) = self.diagnostics.final_skips.first() {
            return Err(KfError::SingularMatrix {
                dim: 2,
                determinant: skip.determinant,
                context: format!("vertex fit, track {}: {}", skip.index, skip.reason),
            });
        }
        Ok(self)
    }
}

/// An iterative Kalman-filter fitter of a common vertex of straight tracks.
///
/// Every pass extrapolates each track to the current estimate's `z`, re-estimates its slopes
/// conditioned on passing through the estimate, and adds it to the vertex with a linearised
/// measurement
///
/// ```text
/// h(r) = (r.x - a (r.z - z0), r.y - b (r.z - z0)),    H = | 1 0 -a |
///                                                         | 0 1 -b |
/// ```
///
/// Each pass starts from the previous position with a fresh isotropic prior, so the fixed
/// number of passes acts as a relinearisation loop.
#[derive(Debug, Clone, Default)]
pub struct VertexFitter<E: Extrapolator = LinearExtrapolator> {
    extrapolator: E,
    config: VertexFitConfig,
}

impl VertexFitter<LinearExtrapolator> {
    /// A fitter using straight-line extrapolation.
    pub fn new(config: VertexFitConfig) -> Self {
        Self::with_extrapolator(LinearExtrapolator, config)
    }
}

struct PassResult {
    position: Vector3<f64>,
    covariance: Matrix3<f64>,
    chi2: f64,
    ndf: i32,
    n_tracks: usize,
    skips: Vec<TrackSkip>,
    outlier_candidates: usize,
}

impl<E: Extrapolator> VertexFitter<E> {
    pub fn with_extrapolator(extrapolator: E, config: VertexFitConfig) -> Self {
        Self {
            extrapolator,
            config,
        }
    }
    pub fn config(&self) -> &VertexFitConfig {
        &self.config
    }
    pub fn extrapolator(&self) -> &E {
        &self.extrapolator
    }

    /// Fit the common vertex of `tracks`, starting from `initial_guess`.
    ///
    /// The fit always succeeds. Fewer than two contributing tracks give an estimate with
    /// [`VertexEstimate::insufficient_measurements`] set, and tracks which would need a
    /// singular inversion are skipped and reported in [`VertexEstimate::diagnostics`].
    pub fn fit(&self, tracks: &[TrackState], initial_guess: Vec3) -> VertexEstimate {
        let mut r0: Vector3<f64> = initial_guess.into();
        let mut c0 = Matrix3::zeros();
        let mut last = PassResult {
            position: r0,
            covariance: Matrix3::from_diagonal_element(self.config.prior_variance),
            chi2: 0.0,
            ndf: -3,
            n_tracks: 0,
            skips: Vec::new(),
            outlier_candidates: 0,
        };
        let mut skipped_per_iteration = Vec::with_capacity(self.config.max_iterations);
        for iteration in 0..self.config.max_iterations {
            last = self.pass(tracks, &r0, &c0, iteration);
            skipped_per_iteration.push(last.skips.len());
            r0 = last.position;
            c0 = last.covariance;
        }
        let mut covariance = [0.0; 6];
        pack_into(&last.covariance, &mut covariance);
        let insufficient_measurements = last.n_tracks < 2;
        if insufficient_measurements {
            warn!(
                n_input = tracks.len(),
                n_tracks = last.n_tracks,
                ndf = last.ndf,
                "vertex fit ended with insufficient measurements"
            );
        }
        VertexEstimate {
            position: last.position.into(),
            covariance,
            chi2: last.chi2,
            ndf: last.ndf,
            n_tracks: last.n_tracks,
            insufficient_measurements,
            diagnostics: FitDiagnostics {
                skipped_per_iteration,
                final_skips: last.skips,
                outlier_candidates: last.outlier_candidates,
            },
        }
    }

    /// Fit many independent events, each given as its tracks and initial guess. Results are
    /// returned in input order.
    pub fn fit_many(&self, events: &[(Vec<TrackState>, Vec3)]) -> Vec<VertexEstimate> {
        #[cfg(feature = "rayon")]
        return events
            .par_iter()
            .map(|(tracks, guess)| self.fit(tracks, *guess))
            .collect();
        #[cfg(not(feature = "rayon"))]
        return events
            .iter()
            .map(|(tracks, guess)| self.fit(tracks, *guess))
            .collect();
    }

    fn pass(
        &self,
        tracks: &[TrackState],
        r0: &Vector3<f64>,
        c0: &Matrix3<f64>,
        iteration: usize,
    ) -> PassResult {
        let eps = self.config.singular_epsilon;
        let mut r = *r0;
        let mut c = Matrix3::from_diagonal_element(self.config.prior_variance);
        let mut chi2 = 0.0;
        let mut ndf = -3;
        let mut n_tracks = 0;
        let mut skips = Vec::new();
        let mut outlier_candidates = 0;
        let c0_pos = c0.fixed_view::<2, 2>(0, 0).into_owned();

        for (index, track) in tracks.iter().enumerate() {
            let t = self.extrapolator.extrapolate(track, r0.z);
            let v = t.covariance_matrix();
            let v_pos = t.position_covariance();
            let m = Vector2::new(t.x(), t.y());
            let zeta0 = Vector2::new(r0.x, r0.y) - m;

            if let Ok(s0) = invert_sym2_with_epsilon(&(c0_pos + v_pos), eps, "outlier check") {
                if zeta0.dot(&(s0 * zeta0)) > self.config.chi2_cut_per_dof {
                    outlier_candidates += 1;
                }
            }

            let v_pos_inv = match invert_sym2_with_epsilon(&v_pos, eps, "track position") {
                Ok(inv) => inv,
                Err(err) => {
                    self.record_skip(
                        &mut skips,
                        iteration,
                        index,
                        SkipReason::SingularPositionCovariance,
                        err,
                    );
                    continue;
                }
            };
            let v_slope_pos: Matrix2<f64> = v.fixed_view::<2, 2>(2, 0).into_owned();
            let slopes = Vector2::new(t.tx(), t.ty()) + v_slope_pos * v_pos_inv * zeta0;
            let (a, b) = (slopes.x, slopes.y);

            let h = Matrix2x3::new(1.0, 0.0, -a, 0.0, 1.0, -b);
            let cht: Matrix3x2<f64> = c * h.transpose();
            let s = match invert_sym2_with_epsilon(&(v_pos + h * cht), eps, "innovation") {
                Ok(inv) => inv,
                Err(err) => {
                    self.record_skip(&mut skips, iteration, index, SkipReason::SingularInnovation, err);
                    continue;
                }
            };
            let dz = r.z - r0.z;
            let zeta = m - Vector2::new(r.x - a * dz, r.y - b * dz);
            chi2 += zeta.dot(&(s * zeta));
            ndf += 2;
            n_tracks += 1;
            let k = cht * s;
            r += k * zeta;
            c -= k * cht.transpose();
        }
        PassResult {
            position: r,
            covariance: c,
            chi2,
            ndf,
            n_tracks,
            skips,
            outlier_candidates,
        }
    }

    fn record_skip(
        &self,
        skips: &mut Vec<TrackSkip>,
        iteration: usize,
        index: usize,
        reason: SkipReason,
        err: KfError,
    ) {
        let determinant = match err {
            KfError::SingularMatrix { determinant, .. } => determinant,
            _ => f64::NAN,
        };
        debug!(iteration, track = index, %reason, determinant, "skipping track");
        skips.push(TrackSkip {
            index,
            reason,
            determinant,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::tests::test_track;
    use approx::assert_relative_eq;

    fn crossing_pair() -> Vec<TrackState> {
        vec![
            test_track(-0.5, 0.0, 0.1, 0.0, 0.0),
            test_track(0.0, -0.5, 0.0, 0.1, 0.0),
        ]
    }

    #[test]
    fn test_default_config() {
        let config = VertexFitConfig::default();
        assert_eq!(config.max_iterations, 10);
        assert_relative_eq!(config.chi2_cut_per_dof, 12.25);
        assert_eq!(config.prior_variance, 100.0);
        assert_eq!(config.singular_epsilon, 1e-20);
        let changed = config.with_prior_variance(10.0).with_chi2_cut_per_dof(9.0);
        assert_eq!(changed.prior_variance, 10.0);
        assert_eq!(changed.chi2_cut_per_dof, 9.0);
    }

    #[test]
    fn test_exact_intersection() {
        let fitter = VertexFitter::new(VertexFitConfig::default());
        let vtx = fitter.fit(&crossing_pair(), Vec3::zero());
        assert_relative_eq!(vtx.position.x, 0.0, epsilon = 1e-6);
        assert_relative_eq!(vtx.position.y, 0.0, epsilon = 1e-6);
        assert_relative_eq!(vtx.position.z, 5.0, epsilon = 1e-6);
        assert_relative_eq!(vtx.chi2, 0.0, epsilon = 1e-8);
        assert_eq!(vtx.ndf, 1);
        assert_eq!(vtx.n_tracks, 2);
        assert!(vtx.is_valid());
        assert!(vtx.ensure_clean().is_ok());
        assert_eq!(vtx.diagnostics.skipped_per_iteration, vec![0; 10]);
        let cov = vtx.covariance_matrix();
        for i in 0..3 {
            assert!(cov[(i, i)] > 0.0);
            assert!(cov[(i, i)] < 100.0);
        }
    }

    #[test]
    fn test_independent_of_track_reference_plane() {
        let fitter = VertexFitter::new(VertexFitConfig::default());
        let tracks: Vec<TrackState> = crossing_pair()
            .iter()
            .map(|t| LinearExtrapolator.extrapolate(t, 40.0))
            .collect();
        let vtx = fitter.fit(&tracks, Vec3::new(0.0, 0.0, 20.0));
        assert_relative_eq!(vtx.position.z, 5.0, epsilon = 1e-5);
        assert_relative_eq!(vtx.position.x, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_skew_tracks_converge_to_weighted_minimum() {
        let fitter = VertexFitter::new(VertexFitConfig::default());
        let tracks = vec![
            test_track(-0.5, 0.0, 0.1, 0.0, 0.0),
            test_track(0.0, 0.5, 0.0, 0.1, 0.0),
        ];
        let vtx = fitter.fit(&tracks, Vec3::zero());
        // the lines miss each other by 0.5 mm in x and y at z = 0
        assert_relative_eq!(vtx.position.x, -0.25, epsilon = 1e-6);
        assert_relative_eq!(vtx.position.y, 0.25, epsilon = 1e-6);
        assert_relative_eq!(vtx.position.z, 0.0, epsilon = 1e-6);
        assert_relative_eq!(vtx.chi2, 25.0, epsilon = 1e-6);
        assert_eq!(vtx.ndf, 1);
        assert_eq!(vtx.n_tracks, 2);

        let reversed: Vec<TrackState> = tracks.iter().rev().cloned().collect();
        for (input, guess) in [
            (&reversed, Vec3::zero()),
            (&tracks, Vec3::new(3.0, -2.0, 40.0)),
        ] {
            let other = fitter.fit(input, guess);
            assert_relative_eq!(other.position.x, vtx.position.x, epsilon = 1e-6);
            assert_relative_eq!(other.position.y, vtx.position.y, epsilon = 1e-6);
            assert_relative_eq!(other.position.z, vtx.position.z, epsilon = 1e-6);
            assert_relative_eq!(other.chi2, vtx.chi2, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_too_few_tracks_are_flagged() {
        let fitter = VertexFitter::new(VertexFitConfig::default());
        let guess = Vec3::new(1.0, 2.0, 3.0);
        let empty = fitter.fit(&[], guess);
        assert!(empty.insufficient_measurements);
        assert_eq!(empty.ndf, -3);
        assert_eq!(empty.n_tracks, 0);
        assert_eq!(empty.position, guess);
        assert!(matches!(
            empty.ensure_valid(),
            Err(KfError::InsufficientMeasurements { n_tracks: 0, ndf: -3 })
        ));

        let single = fitter.fit(&crossing_pair()[..1], guess);
        assert!(single.insufficient_measurements);
        assert_eq!(single.ndf, -1);
        assert_eq!(single.n_tracks, 1);
        assert!(single.ndf < 0);
    }

    #[test]
    fn test_singular_tracks_are_skipped() {
        let fitter = VertexFitter::new(VertexFitConfig::default());
        let mut tracks = crossing_pair();
        tracks.push(TrackState::new([0.0, 0.0, 0.0, 0.0, 0.5], [0.0; 15], 0.0));
        let vtx = fitter.fit(&tracks, Vec3::zero());
        assert_eq!(vtx.n_tracks, 2);
        assert_eq!(vtx.ndf, 1);
        assert_eq!(vtx.diagnostics.skipped_per_iteration, vec![1; 10]);
        assert_eq!(vtx.diagnostics.total_skips(), 10);
        assert_eq!(vtx.diagnostics.final_skips.len(), 1);
        assert_eq!(vtx.diagnostics.final_skips[0].index, 2);
        assert_eq!(
            vtx.diagnostics.final_skips[0].reason,
            SkipReason::SingularPositionCovariance
        );
        assert_relative_eq!(vtx.position.z, 5.0, epsilon = 1e-6);
        assert!(vtx.ensure_valid().is_ok());
        assert!(matches!(
            vtx.ensure_clean(),
            Err(KfError::SingularMatrix { dim: 2, .. })
        ));
    }

    #[test]
    fn test_outliers_are_diagnosed_but_kept() {
        let fitter = VertexFitter::new(VertexFitConfig::default());
        let mut tracks = crossing_pair();
        tracks.push(test_track(-0.5, 0.5, 0.1, -0.1, 0.0));
        tracks.push(test_track(20.0, 0.0, 0.0, 0.0, 0.0));
        let vtx = fitter.fit(&tracks, Vec3::zero());
        assert_eq!(vtx.n_tracks, 4);
        assert_eq!(vtx.ndf, 5);
        assert!(vtx.diagnostics.outlier_candidates >= 1);
        assert!(vtx.chi2 > 100.0);
    }

    #[test]
    fn test_fixed_iteration_count() {
        let fitter = VertexFitter::new(VertexFitConfig::default().with_max_iterations(3));
        let vtx = fitter.fit(&crossing_pair(), Vec3::zero());
        assert_eq!(vtx.diagnostics.skipped_per_iteration.len(), 3);
    }

    #[test]
    fn test_fit_many_matches_single_fits() {
        let fitter = VertexFitter::new(VertexFitConfig::default());
        let shifted: Vec<TrackState> = vec![
            test_track(1.0, 2.0, 0.2, 0.0, 0.0),
            test_track(3.0, 0.0, 0.0, 0.2, 0.0),
        ];
        let events = vec![
            (crossing_pair(), Vec3::zero()),
            (shifted, Vec3::new(0.0, 0.0, 5.0)),
            (Vec::new(), Vec3::zero()),
        ];
        let results = fitter.fit_many(&events);
        assert_eq!(results.len(), 3);
        for ((tracks, guess), result) in events.iter().zip(results.iter()) {
            assert_eq!(&fitter.fit(tracks, *guess), result);
        }
        assert_relative_eq!(results[1].position.x, 3.0, epsilon = 1e-6);
        assert_relative_eq!(results[1].position.y, 2.0, epsilon = 1e-6);
        assert_relative_eq!(results[1].position.z, 10.0, epsilon = 1e-5);
        assert!(!results[2].is_valid());
    }
}
