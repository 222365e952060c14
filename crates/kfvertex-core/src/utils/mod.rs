/// Packed lower-triangular storage of symmetric matrices and guarded small inversions.
pub mod packed;
/// Plain three- and four-vectors with the usual kinematic helpers.
pub mod vectors;

use crate::{KfError, KfResult};

/// Check that a slice holds exactly `expected` values, naming it in the error otherwise.
pub fn check_len(what: &'static str, expected: usize, values: &[f64]) -> KfResult<()> {
    if values.len() != expected {
        return Err(KfError::InvalidLength {
            what,
            expected,
            found: values.len(),
        });
    }
    Ok(())
}

/// Copy a slice of known length into a fixed-size array.
///
/// # Errors
///
/// Returns [`KfError::InvalidLength`] if `values` does not hold exactly `N` entries.
pub fn to_array<const N: usize>(what: &'static str, values: &[f64]) -> KfResult<[f64; N]> {
    check_len(what, N, values)?;
    let mut out = [0.0; N];
    out.copy_from_slice(values);
    Ok(out)
}
