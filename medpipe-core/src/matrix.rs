//! Homogeneous index-space matrices for spatial operations
//!
//! Every spatial operation is described by a `(d+1) x (d+1)` matrix that maps
//! *output* voxel coordinates to *input* voxel coordinates. Composing two
//! operations applied in order `first, second` is `first.dot(&second)`.

use ndarray::Array2;

use crate::error::{Error, Result};

/// Identity matrix of size `(ndim + 1) x (ndim + 1)`
pub fn identity(ndim: usize) -> Array2<f64> {
    Array2::eye(ndim + 1)
}

/// Output-to-input map of a shift: `input = output + offset`
pub fn translation(offset: &[f64]) -> Array2<f64> {
    let ndim = offset.len();
    let mut m = identity(ndim);
    for (axis, &o) in offset.iter().enumerate() {
        m[[axis, ndim]] = o;
    }
    m
}

/// Output-to-input map of a diagonal scaling: `input = output * factor`
pub fn scaling(factors: &[f64]) -> Array2<f64> {
    let ndim = factors.len();
    let mut m = identity(ndim);
    for (axis, &f) in factors.iter().enumerate() {
        m[[axis, axis]] = f;
    }
    m
}

/// Output-to-input map that mirrors the given axes of a grid with `shape`
pub fn flip(shape: &[usize], axes: &[usize]) -> Result<Array2<f64>> {
    let ndim = shape.len();
    let mut m = identity(ndim);
    for &axis in axes {
        if axis >= ndim {
            return Err(Error::Value(format!(
                "flip axis {} out of range for {} spatial dimensions",
                axis, ndim
            )));
        }
        m[[axis, axis]] = -1.0;
        m[[axis, ndim]] = shape[axis] as f64 - 1.0;
    }
    Ok(m)
}

/// Output-to-input map of `k` counter-clockwise quarter turns in the plane
/// `axes`, together with the output shape.
pub fn rot90(shape: &[usize], k: usize, axes: (usize, usize)) -> Result<(Array2<f64>, Vec<usize>)> {
    let ndim = shape.len();
    let (a, b) = axes;
    if a >= ndim || b >= ndim || a == b {
        return Err(Error::Value(format!(
            "rotation plane {:?} is invalid for {} spatial dimensions",
            axes, ndim
        )));
    }

    let mut m = identity(ndim);
    let mut current = shape.to_vec();
    for _ in 0..k % 4 {
        // out[a] = in[b], out[b] = n_b - 1 - in[a] in numpy's rot90 convention
        let mut quarter = Array2::zeros((ndim + 1, ndim + 1));
        for axis in 0..=ndim {
            if axis != a && axis != b {
                quarter[[axis, axis]] = 1.0;
            }
        }
        quarter[[a, b]] = 1.0;
        quarter[[b, a]] = -1.0;
        quarter[[b, ndim]] = current[b] as f64 - 1.0;

        m = m.dot(&quarter);
        current.swap(a, b);
    }
    Ok((m, current))
}

/// Centre of a grid in voxel coordinates
pub fn centre(shape: &[usize]) -> Vec<f64> {
    shape.iter().map(|&n| (n as f64 - 1.0) / 2.0).collect()
}

/// Check that `m` is a square homogeneous matrix for `ndim` spatial dimensions
pub fn check_homogeneous(m: &Array2<f64>, ndim: usize) -> Result<()> {
    if m.dim() != (ndim + 1, ndim + 1) {
        return Err(Error::Shape(format!(
            "expected a {0}x{0} homogeneous matrix, got {1}x{2}",
            ndim + 1,
            m.nrows(),
            m.ncols()
        )));
    }
    Ok(())
}

/// Whether `m` maps integer grid points onto integer grid points
pub fn is_index_exact(m: &Array2<f64>) -> bool {
    m.iter().all(|v| (v - v.round()).abs() < 1e-9)
}

/// Invert a square matrix with Gauss-Jordan elimination and partial pivoting
pub fn invert(m: &Array2<f64>) -> Result<Array2<f64>> {
    let n = m.nrows();
    if n != m.ncols() {
        return Err(Error::Shape(format!(
            "cannot invert a non-square {}x{} matrix",
            m.nrows(),
            m.ncols()
        )));
    }

    let mut a = m.clone();
    let mut inv = Array2::eye(n);
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| a[[i, col]].abs().total_cmp(&a[[j, col]].abs()))
            .unwrap_or(col);
        if a[[pivot, col]].abs() < 1e-12 {
            return Err(Error::Value("matrix is singular".into()));
        }
        if pivot != col {
            for k in 0..n {
                a.swap([pivot, k], [col, k]);
                inv.swap([pivot, k], [col, k]);
            }
        }

        let p = a[[col, col]];
        for k in 0..n {
            a[[col, k]] /= p;
            inv[[col, k]] /= p;
        }

        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = a[[row, col]];
            if factor == 0.0 {
                continue;
            }
            for k in 0..n {
                a[[row, k]] -= factor * a[[col, k]];
                inv[[row, k]] -= factor * inv[[col, k]];
            }
        }
    }
    Ok(inv)
}

/// Apply a homogeneous matrix to a point
pub fn apply_to_point(m: &Array2<f64>, point: &[f64]) -> Vec<f64> {
    let ndim = point.len();
    (0..ndim)
        .map(|row| {
            point
                .iter()
                .enumerate()
                .map(|(col, p)| m[[row, col]] * p)
                .sum::<f64>()
                + m[[row, ndim]]
        })
        .collect()
}
