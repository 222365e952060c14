use kfvertex_core::{Vec3, C_LIGHT};
use nalgebra::SMatrix;

use crate::{
    field::MagneticField,
    particle::{ParticleMatrix, ParticleState, ParticleVector},
};

/// Weights of the second-order cross field integral `∫∫ By·Bz`.
const SYZ_WEIGHTS: [[f64; 3]; 3] = [[5.0, -4.0, -1.0], [44.0, 80.0, -4.0], [11.0, 44.0, 5.0]];
/// Weights of the third-order cross field integral `∫∫∫ By·Bz`.
const SSYZ_WEIGHTS: [[f64; 3]; 3] = [
    [38.0, 8.0, -4.0],
    [148.0, 208.0, -20.0],
    [3.0, 36.0, 3.0],
];

/// Momenta squared below this are treated as zero when computing a path length.
const MIN_P2: f64 = 1e-4;
/// Curvatures below this are treated as straight lines.
const MIN_CURVATURE: f64 = 1e-8;

fn symmetric(c: ParticleMatrix) -> ParticleMatrix {
    (c + c.transpose()) * 0.5
}

impl ParticleState {
    /// The state and covariance after moving by `ds` (path over momentum) along the
    /// trajectory, without changing `self`.
    ///
    /// Neutral particles move on straight lines. Charged particles follow the field, which is
    /// integrated to second order over three points of the step.
    pub fn transported(
        &self,
        ds: f64,
        field: &dyn MagneticField,
    ) -> (ParticleVector, ParticleMatrix) {
        let j = if self.charge == 0 {
            Self::line_jacobian(ds)
        } else {
            self.field_jacobian(ds, field)
        };
        (j * self.params, symmetric(j * self.covariance * j.transpose()))
    }

    /// Move the particle by `ds` along its trajectory.
    pub fn transport_to_ds(&mut self, ds: f64, field: &dyn MagneticField) {
        let (params, covariance) = self.transported(ds, field);
        self.params = params;
        self.covariance = covariance;
        self.s_from_decay += ds;
    }

    /// Move the particle back to its decay vertex, restoring the decay-vertex form of the
    /// position errors if needed.
    pub fn transport_to_decay_vertex(&mut self, field: &dyn MagneticField) {
        if self.s_from_decay != 0.0 {
            self.transport_to_ds(-self.s_from_decay, field);
        }
        if self.at_production_vertex {
            self.convert(false, field);
        }
        self.at_production_vertex = false;
    }

    /// Move the particle to where it was produced, `s` before its decay vertex.
    pub fn transport_to_production_vertex(&mut self, field: &dyn MagneticField) {
        let ds = -self.s_from_decay - self.params[7];
        if ds != 0.0 {
            self.transport_to_ds(ds, field);
        }
        if !self.at_production_vertex {
            self.convert(true, field);
        }
        self.at_production_vertex = true;
    }

    /// Straight-line transport: `r += ds·p`.
    pub(crate) fn line_jacobian(ds: f64) -> ParticleMatrix {
        let mut j = ParticleMatrix::identity();
        for i in 0..3 {
            j[(i, i + 3)] = ds;
        }
        j
    }

    fn field_jacobian(&self, ds: f64, field: &dyn MagneticField) -> ParticleMatrix {
        let c = self.charge as f64 * C_LIGHT;
        let p = self.momentum();
        let p0 = self.position();
        let mut p2 = p0 + p * ds;
        let mut p1 = (p0 + p2) * 0.5;

        // bend the sampling points once with the first-order solution
        {
            let f0 = field.field_at(&p0);
            let f1 = field.field_at(&p1);
            let f2 = field.field_at(&p2);
            let ssy1 = (7.0 * f0.y + 6.0 * f1.y - f2.y) * c * ds * ds / 96.0;
            let ssy2 = (f0.y + 2.0 * f1.y) * c * ds * ds / 6.0;
            p1.x -= ssy1 * p.z;
            p1.z += ssy1 * p.x;
            p2.x -= ssy2 * p.z;
            p2.z += ssy2 * p.x;
        }
        let fld = [field.field_at(&p0), field.field_at(&p1), field.field_at(&p2)];
        let (f0, f1, f2) = (fld[0], fld[1], fld[2]);

        let sx = c * (f0.x + 4.0 * f1.x + f2.x) * ds / 6.0;
        let sy = c * (f0.y + 4.0 * f1.y + f2.y) * ds / 6.0;
        let sz = c * (f0.z + 4.0 * f1.z + f2.z) * ds / 6.0;

        let ssx = c * (f0.x + 2.0 * f1.x) * ds * ds / 6.0;
        let ssy = c * (f0.y + 2.0 * f1.y) * ds * ds / 6.0;
        let ssz = c * (f0.z + 2.0 * f1.z) * ds * ds / 6.0;

        let mut syz = 0.0;
        let mut ssyz = 0.0;
        for n in 0..3 {
            for m in 0..3 {
                syz += SYZ_WEIGHTS[n][m] * fld[n].y * fld[m].z;
                ssyz += SSYZ_WEIGHTS[n][m] * fld[n].y * fld[m].z;
            }
        }
        syz *= c * c * ds * ds / 360.0;
        ssyz *= c * c * ds * ds * ds / 2520.0;

        let sy_sum = c * (f0.y + 4.0 * f1.y + f2.y) * ds;
        let syyy = sy_sum * sy_sum * sy_sum / 1296.0;
        let syy = sy_sum * sy_sum / 72.0;

        let ssyy = (f0.y * (38.0 * f0.y + 156.0 * f1.y - f2.y)
            + f1.y * (208.0 * f1.y + 16.0 * f2.y)
            + f2.y * (3.0 * f2.y))
            * ds.powi(3)
            * c
            * c
            / 2520.0;
        let ssyyy = (f0.y * (f0.y * (85.0 * f0.y + 526.0 * f1.y - 7.0 * f2.y)
            + f1.y * (1376.0 * f1.y + 84.0 * f2.y)
            + f2.y * (19.0 * f2.y))
            + f1.y * (f1.y * (1376.0 * f1.y + 256.0 * f2.y) + f2.y * (62.0 * f2.y))
            + f2.y * f2.y * (3.0 * f2.y))
            * ds.powi(4)
            * c.powi(3)
            / 90720.0;

        let mut j = ParticleMatrix::identity();
        let position_rows = SMatrix::<f64, 3, 3>::new(
            ds - ssyy,
            ssx,
            ssyyy - ssy,
            -ssz,
            ds,
            ssx + ssyz,
            ssy - ssyyy,
            -ssx,
            ds - ssyy,
        );
        let momentum_rows = SMatrix::<f64, 3, 3>::new(
            1.0 - syy,
            sx,
            syyy - sy,
            -sz,
            1.0,
            sx + syz,
            sy - syyy,
            -sx,
            1.0 - syy,
        );
        j.fixed_view_mut::<3, 3>(0, 3).copy_from(&position_rows);
        j.fixed_view_mut::<3, 3>(3, 3).copy_from(&momentum_rows);
        j
    }

    /// Move the uncertainty of the decay length into the position errors (towards the
    /// production vertex) or back out of them.
    pub(crate) fn convert(&mut self, to_production: bool, field: &dyn MagneticField) {
        let b = field.curvature_at(&self.position()) * self.charge as f64;
        let mut h = self.momentum();
        if to_production {
            h = -h;
        }
        let dh = h.cross(&b);
        let mut a = ParticleMatrix::identity();
        for (i, hi) in [h.x, h.y, h.z, dh.x, dh.y, dh.z].into_iter().enumerate() {
            a[(i, 7)] = hi;
        }
        self.covariance = symmetric(a * self.covariance * a.transpose());
    }

    /// The state at the point of closest approach to `point`, with its covariance widened
    /// along the trajectory so that it can serve as a measurement of a vertex at `point`.
    pub fn measurement_at(
        &self,
        point: &Vec3,
        field: &dyn MagneticField,
    ) -> (ParticleVector, ParticleMatrix) {
        let b = field.curvature_at(point);
        let ds = self.distance_to_point(point, field);
        let (params, mut cov) = self.transported(ds, field);
        let sigma_s = s_correction(&params, point);
        let h = Vec3::new(params[3], params[4], params[5]) * sigma_s;
        let dh = h.cross(&b) * self.charge as f64;
        let h = ParticleVector::from_column_slice(&[h.x, h.y, h.z, dh.x, dh.y, dh.z, 0.0, 0.0]);
        cov += h * h.transpose();
        (params, cov)
    }

    /// Path over momentum from the current position to the point of closest approach to
    /// `point`, for a straight trajectory.
    pub fn distance_to_point_line(&self, point: &Vec3) -> f64 {
        let p = self.momentum();
        let mut p2 = p.mag2();
        if p2 < MIN_P2 {
            p2 = 1.0;
        }
        p.dot(&(point - self.position())) / p2
    }

    /// Path over momentum to the point of closest approach to `point` in `field`.
    ///
    /// Charged particles use the closed-form solution of a helix around the `y` component of
    /// the field at the particle. In a vanishing field, or for neutral particles, this is
    /// exactly [`ParticleState::distance_to_point_line`].
    pub fn distance_to_point(&self, point: &Vec3, field: &dyn MagneticField) -> f64 {
        let ds = self.distance_to_point_line(point);
        if self.charge == 0 {
            return ds;
        }
        let bq = field.curvature_at(&self.position()).y * self.charge as f64;
        if bq.abs() < MIN_CURVATURE {
            return ds;
        }
        self.distance_to_point_by(bq, point)
    }

    /// Helix solution in the plane transverse to `y`, working in the frame `(x, -z, y)` where
    /// the field is along the third axis.
    fn distance_to_point_by(&self, bq: f64, point: &Vec3) -> f64 {
        let (px, pz) = (self.px(), self.pz());
        let pt2 = px * px + pz * pz;
        if pt2 < MIN_P2 {
            return 0.0;
        }
        let dx = point.x - self.x();
        let dy = -point.z + self.z();
        let a = dx * px - dy * pz;
        (bq * a).atan2(pt2 + bq * (dy * px + dx * pz)) / bq
    }

    /// Path-over-momentum parameters `(ds, ds_other)` which bring `self` and `other` to their
    /// mutual point of closest approach.
    ///
    /// The straight-line solution is used for a neutral `self` and in a vanishing field;
    /// otherwise both trajectories are treated as helices around the mean `y` component of the
    /// field at the two particles.
    pub fn distance_to_particle(
        &self,
        other: &ParticleState,
        field: &dyn MagneticField,
    ) -> (f64, f64) {
        let line = self.distance_to_particle_line(other);
        if self.charge == 0 {
            return line;
        }
        let by = 0.5
            * (field.curvature_at(&self.position()).y + field.curvature_at(&other.position()).y);
        let bq = by * self.charge as f64;
        let bq1 = by * other.charge as f64;
        if bq.abs() <= MIN_CURVATURE && bq1.abs() <= MIN_CURVATURE {
            return line;
        }
        self.distance_to_particle_by(other, bq, bq1)
    }

    /// Straight-line solution of [`ParticleState::distance_to_particle`]. Parallel
    /// trajectories give an arbitrary but finite answer.
    pub fn distance_to_particle_line(&self, other: &ParticleState) -> (f64, f64) {
        let p1 = self.momentum();
        let p2 = other.momentum();
        let p12 = p1.mag2();
        let p22 = p2.mag2();
        let p1p2 = p1.dot(&p2);
        let dr = other.position() - self.position();
        let drp1 = p1.dot(&dr);
        let drp2 = p2.dot(&dr);
        let mut det = p1p2 * p1p2 - p12 * p22;
        if det.abs() < MIN_P2 {
            det = 1.0;
        }
        (
            (drp2 * p1p2 - drp1 * p22) / det,
            (drp2 * p12 - drp1 * p1p2) / det,
        )
    }

    fn distance_to_particle_by(&self, other: &ParticleState, bq: f64, bq1: f64) -> (f64, f64) {
        // (x, -z, y) frame
        let (px, py, pz) = (self.px(), -self.pz(), self.py());
        let (px1, py1, pz1) = (other.px(), -other.pz(), other.py());

        let dx = other.x() - self.x();
        let dy = -other.z() + self.z();
        let d2 = dx * dx + dy * dy;

        let p2 = px * px + py * py;
        let p21 = px1 * px1 + py1 * py1;
        if p2.abs() < MIN_CURVATURE || p21.abs() < MIN_CURVATURE {
            return (0.0, 0.0);
        }

        let a = px * py1 - py * px1;
        let b = px * px1 + py * py1;

        let ldx = bq * bq1 * dx - bq1 * py + bq * py1;
        let ldy = bq * bq1 * dy + bq1 * px - bq * px1;
        let l2 = ldx * ldx + ldy * ldy;

        let cs = bq1 * p2 + bq * bq1 * (dy * px - dx * py) - bq * b;
        let cs1 = bq * p21 - bq * bq1 * (dy * px1 - dx * py1) - bq1 * b;

        let ca = bq * bq * bq1 * d2 + 2.0 * (cs + bq * bq * (py1 * dx - px1 * dy));
        let ca1 = bq * bq1 * bq1 * d2 + 2.0 * (cs1 - bq1 * bq1 * (py * dx - px * dy));

        let sa = (4.0 * l2 * p2 - ca * ca).max(0.0);
        let sa1 = (4.0 * l2 * p21 - ca1 * ca1).max(0.0);

        let (s, ds) = if bq.abs() > MIN_CURVATURE {
            (
                (bq * (bq1 * (dx * px + dy * py) + a)).atan2(cs) / bq,
                sa.sqrt().atan2(ca) / bq,
            )
        } else {
            let s = ((dx * px + dy * py) + (py * px1 - px * py1) / bq1) / p2;
            let ds = s * s - (d2 - 2.0 * (px1 * dy - py1 * dx) / bq1) / p2;
            (s, ds.max(0.0).sqrt())
        };
        let (s1, ds1) = if bq1.abs() > MIN_CURVATURE {
            (
                (-bq1 * (bq * (dx * px1 + dy * py1) + a)).atan2(cs1) / bq1,
                sa1.sqrt().atan2(ca1) / bq1,
            )
        } else {
            let s1 = (-(dx * px1 + dy * py1) + (py * px1 - px * py1) / bq) / p21;
            let ds1 = s1 * s1 - (d2 + 2.0 * (px * dy - py * dx) / bq) / p21;
            (s1, ds1.max(0.0).sqrt())
        };

        let candidates = [s + ds, s - ds];
        let candidates1 = [s1 + ds1, s1 - ds1];
        let start = Vec3::new(self.x(), -self.z(), self.y());
        let start1 = Vec3::new(other.x(), -other.z(), other.y());
        let points = candidates.map(|s| helix_point(&start, px, py, pz, bq, s));
        let points1 = candidates1.map(|s| helix_point(&start1, px1, py1, pz1, bq1, s));

        let mut best = (0, 0);
        let mut d_min = f64::INFINITY;
        for (i, point) in points.iter().enumerate() {
            for (i1, point1) in points1.iter().enumerate() {
                let d = (point - point1).mag2();
                if d < d_min {
                    d_min = d;
                    best = (i, i1);
                }
            }
        }
        (candidates[best.0], candidates1[best.1])
    }
}

/// A path-length uncertainty large enough for a state to be pulled onto `point`.
fn s_correction(params: &ParticleVector, point: &Vec3) -> f64 {
    let d = point - Vec3::new(params[0], params[1], params[2]);
    let p2 = params[3] * params[3] + params[4] * params[4] + params[5] * params[5];
    if p2 > MIN_P2 {
        (0.1 + 10.0 * d.mag()) / p2.sqrt()
    } else {
        1.0
    }
}

/// Position after `s` along a helix around the third axis of the rotated frame.
fn helix_point(start: &Vec3, px: f64, py: f64, pz: f64, bq: f64, s: f64) -> Vec3 {
    let bs = bq * s;
    let (sin, cos) = bs.sin_cos();
    let (s_b, c_b) = if bq.abs() > MIN_CURVATURE {
        (sin / bq, (1.0 - cos) / bq)
    } else {
        let k = 1.0 / 6.0_f64.sqrt();
        let s_b = (1.0 - bs * k) * (1.0 + bs * k) * s;
        (s_b, 0.5 * s_b * bs)
    };
    Vec3::new(
        start.x + s_b * px + c_b * py,
        start.y - c_b * px + s_b * py,
        start.z + s * pz,
    )
}
