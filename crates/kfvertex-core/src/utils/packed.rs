//! Symmetric matrices are exchanged as their lower triangle, row by row:
//!
//! ```text
//! (  0  .  .  . )
//! (  1  2  .  . )
//! (  3  4  5  . )
//! (  6  7  8  9 )
//! ```
//!
//! Internally they are expanded into [`nalgebra::SMatrix`] values for the algebra and packed
//! again on the way out.
use nalgebra::{Matrix2, Matrix3, SMatrix};

use crate::{KfError, KfResult, SINGULAR_EPSILON};

/// Number of independent entries of an `n`×`n` symmetric matrix.
pub const fn packed_len(n: usize) -> usize {
    n * (n + 1) / 2
}

/// Position of element `(i, j)` in the packed lower triangle. The arguments may be given in
/// either order.
#[inline]
pub const fn packed_index(i: usize, j: usize) -> usize {
    if j <= i {
        i * (i + 1) / 2 + j
    } else {
        j * (j + 1) / 2 + i
    }
}

/// Expand a packed lower triangle into a full symmetric matrix.
///
/// `packed` must hold at least [`packed_len`]`(N)` values; any surplus is ignored.
pub fn unpack<const N: usize>(packed: &[f64]) -> SMatrix<f64, N, N> {
    debug_assert!(packed.len() >= packed_len(N));
    SMatrix::<f64, N, N>::from_fn(|i, j| packed[packed_index(i, j)])
}

/// Write the lower triangle of `m` into `out`.
///
/// Only the lower triangle is read, so a matrix which picked up rounding asymmetry is
/// symmetrised by construction.
pub fn pack_into<const N: usize>(m: &SMatrix<f64, N, N>, out: &mut [f64]) {
    debug_assert!(out.len() >= packed_len(N));
    for i in 0..N {
        for j in 0..=i {
            out[packed_index(i, j)] = m[(i, j)];
        }
    }
}

/// Pack the lower triangle of `m` into a freshly allocated vector.
pub fn pack<const N: usize>(m: &SMatrix<f64, N, N>) -> Vec<f64> {
    let mut out = vec![0.0; packed_len(N)];
    pack_into(m, &mut out);
    out
}

/// Invert a symmetric 2×2 matrix, refusing determinants below [`SINGULAR_EPSILON`].
pub fn invert_sym2(m: &Matrix2<f64>, context: &str) -> KfResult<Matrix2<f64>> {
    invert_sym2_with_epsilon(m, SINGULAR_EPSILON, context)
}

/// Invert a symmetric 2×2 matrix, refusing determinants below `epsilon`.
pub fn invert_sym2_with_epsilon(
    m: &Matrix2<f64>,
    epsilon: f64,
    context: &str,
) -> KfResult<Matrix2<f64>> {
    let det = m[(0, 0)] * m[(1, 1)] - m[(1, 0)] * m[(1, 0)];
    if !(det >= epsilon) {
        return Err(KfError::SingularMatrix {
            dim: 2,
            determinant: det,
            context: context.to_string(),
        });
    }
    let s = 1.0 / det;
    Ok(Matrix2::new(
        s * m[(1, 1)],
        -s * m[(1, 0)],
        -s * m[(1, 0)],
        s * m[(0, 0)],
    ))
}

/// Invert a symmetric 3×3 matrix through its adjugate, refusing determinants below
/// [`SINGULAR_EPSILON`].
pub fn invert_sym3(m: &Matrix3<f64>, context: &str) -> KfResult<Matrix3<f64>> {
    let a00 = m[(1, 1)] * m[(2, 2)] - m[(2, 1)] * m[(2, 1)];
    let a10 = m[(2, 0)] * m[(2, 1)] - m[(1, 0)] * m[(2, 2)];
    let a11 = m[(0, 0)] * m[(2, 2)] - m[(2, 0)] * m[(2, 0)];
    let a20 = m[(1, 0)] * m[(2, 1)] - m[(1, 1)] * m[(2, 0)];
    let a21 = m[(1, 0)] * m[(2, 0)] - m[(0, 0)] * m[(2, 1)];
    let a22 = m[(0, 0)] * m[(1, 1)] - m[(1, 0)] * m[(1, 0)];
    let det = m[(0, 0)] * a00 + m[(1, 0)] * a10 + m[(2, 0)] * a20;
    if !(det >= SINGULAR_EPSILON) {
        return Err(KfError::SingularMatrix {
            dim: 3,
            determinant: det,
            context: context.to_string(),
        });
    }
    let s = 1.0 / det;
    Ok(Matrix3::new(
        a00, a10, a20, //
        a10, a11, a21, //
        a20, a21, a22,
    ) * s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Matrix5;

    #[test]
    fn test_packed_layout() {
        assert_eq!(packed_len(3), 6);
        assert_eq!(packed_len(5), 15);
        assert_eq!(packed_len(8), 36);
        assert_eq!(packed_index(0, 0), 0);
        assert_eq!(packed_index(1, 0), 1);
        assert_eq!(packed_index(1, 1), 2);
        assert_eq!(packed_index(2, 0), 3);
        assert_eq!(packed_index(0, 2), 3);
        assert_eq!(packed_index(4, 4), 14);
        assert_eq!(packed_index(7, 7), 35);
    }

    #[test]
    fn test_unpack_pack() {
        let packed: Vec<f64> = (0..15).map(|i| i as f64).collect();
        let m: Matrix5<f64> = unpack(&packed);
        assert_eq!(m[(3, 1)], 7.0);
        assert_eq!(m[(1, 3)], 7.0);
        assert_eq!(m[(4, 2)], 12.0);
        assert_eq!(pack(&m), packed);
    }

    #[test]
    fn test_invert_sym3() {
        let m = Matrix3::new(4.0, 1.0, 0.5, 1.0, 3.0, 0.2, 0.5, 0.2, 2.0);
        let inv = invert_sym3(&m, "test").unwrap();
        let id = m * inv;
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(id[(i, j)], expected, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_singular_inversions_are_refused() {
        let m2 = Matrix2::new(1.0, 1.0, 1.0, 1.0);
        assert!(matches!(
            invert_sym2(&m2, "degenerate"),
            Err(KfError::SingularMatrix { dim: 2, .. })
        ));
        let m3 = Matrix3::zeros();
        assert!(matches!(
            invert_sym3(&m3, "zero"),
            Err(KfError::SingularMatrix { dim: 3, .. })
        ));
        let nan = Matrix2::new(f64::NAN, 0.0, 0.0, 1.0);
        assert!(invert_sym2(&nan, "nan").is_err());
    }
}
