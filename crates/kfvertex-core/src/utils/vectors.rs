use std::fmt::Display;

use auto_ops::{impl_op_ex, impl_op_ex_commutative};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// A three-vector, used for positions, momenta and field values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl From<[f64; 3]> for Vec3 {
    fn from(value: [f64; 3]) -> Self {
        Self::new(value[0], value[1], value[2])
    }
}
impl From<Vec3> for [f64; 3] {
    fn from(value: Vec3) -> Self {
        [value.x, value.y, value.z]
    }
}
impl From<Vector3<f64>> for Vec3 {
    fn from(value: Vector3<f64>) -> Self {
        Self::new(value.x, value.y, value.z)
    }
}
impl From<Vec3> for Vector3<f64> {
    fn from(value: Vec3) -> Self {
        Vector3::new(value.x, value.y, value.z)
    }
}

impl Display for Vec3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

impl Vec3 {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
    pub const fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    /// Treat this vector as a three-momentum and attach the energy of a particle of the given
    /// mass.
    pub fn with_mass(&self, mass: f64) -> Vec4 {
        let e = (mass.powi(2) + self.mag2()).sqrt();
        Vec4::new(self.x, self.y, self.z, e)
    }
    pub fn with_energy(&self, energy: f64) -> Vec4 {
        Vec4::new(self.x, self.y, self.z, energy)
    }

    pub fn dot(&self, other: &Self) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }
    pub fn cross(&self, other: &Self) -> Self {
        Self::new(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }
    pub fn mag2(&self) -> f64 {
        self.dot(self)
    }
    pub fn mag(&self) -> f64 {
        self.mag2().sqrt()
    }
    /// Magnitude of the component transverse to the z-axis.
    pub fn perp(&self) -> f64 {
        self.x.hypot(self.y)
    }
    pub fn phi(&self) -> f64 {
        self.y.atan2(self.x)
    }
    pub fn unit(&self) -> Self {
        self / self.mag()
    }
}

impl_op_ex!(+ |a: &Vec3, b: &Vec3| -> Vec3 { Vec3::new(a.x + b.x, a.y + b.y, a.z + b.z) });
impl_op_ex!(-|a: &Vec3, b: &Vec3| -> Vec3 { Vec3::new(a.x - b.x, a.y - b.y, a.z - b.z) });
impl_op_ex!(-|a: &Vec3| -> Vec3 { Vec3::new(-a.x, -a.y, -a.z) });
impl_op_ex!(+= |a: &mut Vec3, b: &Vec3| { a.x += b.x; a.y += b.y; a.z += b.z; });
impl_op_ex_commutative!(*|a: &Vec3, b: &f64| -> Vec3 { Vec3::new(a.x * b, a.y * b, a.z * b) });
impl_op_ex!(/ |a: &Vec3, b: &f64| -> Vec3 { Vec3::new(a.x / b, a.y / b, a.z / b) });

/// A four-momentum `(px, py, pz, E)`, with the energy stored in `t`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec4 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub t: f64,
}

impl Display for Vec4 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[e = {}; p = ({}, {}, {})]", self.t, self.x, self.y, self.z)
    }
}

impl Vec4 {
    pub const fn new(px: f64, py: f64, pz: f64, e: f64) -> Self {
        Self {
            x: px,
            y: py,
            z: pz,
            t: e,
        }
    }
    pub fn px(&self) -> f64 {
        self.x
    }
    pub fn py(&self) -> f64 {
        self.y
    }
    pub fn pz(&self) -> f64 {
        self.z
    }
    pub fn e(&self) -> f64 {
        self.t
    }
    pub fn vec3(&self) -> Vec3 {
        Vec3::new(self.x, self.y, self.z)
    }
    pub fn beta(&self) -> Vec3 {
        self.vec3() / self.e()
    }
    /// The Minkowski norm squared, `E² - |p|²`.
    pub fn m2(&self) -> f64 {
        self.e() * self.e() - self.vec3().mag2()
    }
    /// The invariant mass. Negative `m²` (which can appear after a fit) gives a negative mass.
    pub fn m(&self) -> f64 {
        let m2 = self.m2();
        if m2 < 0.0 {
            -(-m2).sqrt()
        } else {
            m2.sqrt()
        }
    }
}

impl_op_ex!(+ |a: &Vec4, b: &Vec4| -> Vec4 { Vec4::new(a.x + b.x, a.y + b.y, a.z + b.z, a.t + b.t) });
impl_op_ex!(-|a: &Vec4, b: &Vec4| -> Vec4 { Vec4::new(a.x - b.x, a.y - b.y, a.z - b.z, a.t - b.t) });
impl_op_ex!(-|a: &Vec4| -> Vec4 { Vec4::new(-a.x, -a.y, -a.z, -a.t) });

impl std::iter::Sum<Vec4> for Vec4 {
    fn sum<I: Iterator<Item = Vec4>>(iter: I) -> Self {
        iter.fold(Vec4::default(), |a, b| a + b)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn test_vec_sums() {
        let a = Vec3::new(1.0, 2.0, 3.0);
        let b = Vec3::new(4.0, 5.0, 6.0);
        assert_eq!(a + b, Vec3::new(5.0, 7.0, 9.0));
        let mut c = a;
        c += b;
        assert_eq!(c, a + b);
        assert_eq!(2.0 * a, a * 2.0);
    }

    #[test]
    fn test_three_to_four_momentum_conversion() {
        let p3 = Vec3::new(1.0, 2.0, 3.0);
        let target_p4 = Vec4::new(1.0, 2.0, 3.0, 10.0);
        let p4_from_mass = p3.with_mass(target_p4.m());
        let p4_from_energy = p3.with_energy(target_p4.e());
        assert_relative_eq!(p4_from_mass.e(), target_p4.e());
        assert_eq!(p4_from_energy, target_p4);
    }

    #[test]
    fn test_four_momentum_basics() {
        let p = Vec4::new(3.0, 4.0, 5.0, 10.0);
        assert_eq!(p.vec3(), Vec3::new(3.0, 4.0, 5.0));
        assert_relative_eq!(p.beta().x, 0.3);
        assert_relative_eq!(p.beta().y, 0.4);
        assert_relative_eq!(p.beta().z, 0.5);
        assert_relative_eq!(p.m(), 50.0_f64.sqrt());
        assert_relative_eq!(p.m2(), 50.0);
        let spacelike = Vec4::new(3.0, 4.0, 0.0, 3.0);
        assert_relative_eq!(spacelike.m(), -4.0);
    }

    #[test]
    fn test_three_momentum_basics() {
        let p3 = Vec3::new(3.0, 4.0, 5.0);
        let q3 = Vec3::new(1.2, -3.4, 7.6);
        assert_relative_eq!(p3.mag(), 50.0_f64.sqrt());
        assert_relative_eq!(p3.perp(), 5.0);
        assert_relative_eq!(p3.phi(), 4.0_f64.atan2(3.0));
        assert_relative_eq!(p3.unit().mag(), 1.0);
        let cross = p3.cross(&q3);
        assert_relative_eq!(cross.x, 47.4);
        assert_relative_eq!(cross.y, -16.8);
        assert_relative_eq!(cross.z, -15.0);
    }

    #[test]
    fn test_four_momentum_sum() {
        let total: Vec4 = [Vec4::new(1.0, 0.0, 0.0, 2.0), Vec4::new(-1.0, 0.0, 0.0, 2.0)]
            .into_iter()
            .sum();
        assert_eq!(total, Vec4::new(0.0, 0.0, 0.0, 4.0));
        assert_relative_eq!(total.m(), 4.0);
    }
}
