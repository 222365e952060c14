use std::fmt::Debug;

use dyn_clone::DynClone;
use kfvertex_core::{Vec3, C_LIGHT};
use serde::{Deserialize, Serialize};

/// A source of magnetic field values, in tesla.
///
/// The field is handed to every operation which needs it, so different analyses (or different
/// events) can use different fields side by side.
pub trait MagneticField: DynClone + Debug + Send + Sync {
    /// The field vector at `point`.
    fn field_at(&self, point: &Vec3) -> Vec3;

    /// The field at `point` scaled by the speed of light, the form which enters the equations
    /// of motion when multiplied by a charge.
    fn curvature_at(&self, point: &Vec3) -> Vec3 {
        self.field_at(point) * C_LIGHT
    }
}

dyn_clone::clone_trait_object!(MagneticField);

/// A homogeneous field.
///
/// The particle transport is expanded around the `y` component, so fields which are mostly
/// along `y` (a dipole spectrometer) are treated most accurately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UniformField {
    value: Vec3,
}

impl UniformField {
    pub fn new(bx: f64, by: f64, bz: f64) -> Self {
        Self {
            value: Vec3::new(bx, by, bz),
        }
    }
    /// No field at all. Charged particles move on straight lines.
    pub fn zero() -> Self {
        Self::default()
    }
    /// A dipole field along `y`.
    pub fn along_y(by: f64) -> Self {
        Self::new(0.0, by, 0.0)
    }
    pub fn with_value(mut self, value: Vec3) -> Self {
        self.value = value;
        self
    }
    pub fn value(&self) -> Vec3 {
        self.value
    }
}

impl MagneticField for UniformField {
    fn field_at(&self, _point: &Vec3) -> Vec3 {
        self.value
    }
}
