//! Grid resampling of channel-first arrays

use ndarray::{Array2, ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::matrix;

/// Interpolation used when an output voxel maps between input voxels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interp {
    /// Nearest neighbour
    Nearest,
    /// Multilinear
    #[default]
    Linear,
}

/// Resample `src` (`[C, s1, .., sd]`) onto an output grid of `out_spatial`.
///
/// `matrix` maps output voxel coordinates to input voxel coordinates. Output
/// voxels that map outside the input are zero.
pub fn resample(
    src: &ArrayD<f32>,
    matrix: &Array2<f64>,
    out_spatial: &[usize],
    interp: Interp,
) -> Result<ArrayD<f32>> {
    if src.ndim() < 2 {
        return Err(Error::Shape(format!(
            "expected a channel-first array with at least one spatial dimension, got shape {:?}",
            src.shape()
        )));
    }
    let ndim = src.ndim() - 1;
    if out_spatial.len() != ndim {
        return Err(Error::Shape(format!(
            "output shape {:?} does not have {} spatial dimensions",
            out_spatial, ndim
        )));
    }
    matrix::check_homogeneous(matrix, ndim)?;

    let channels = src.shape()[0];
    let in_spatial = &src.shape()[1..];

    let mut out_shape = Vec::with_capacity(ndim + 1);
    out_shape.push(channels);
    out_shape.extend_from_slice(out_spatial);
    let mut out = ArrayD::<f32>::zeros(IxDyn(&out_shape));

    let mut src_index = vec![0usize; ndim + 1];
    let mut dst_index = vec![0usize; ndim + 1];
    let mut point = vec![0f64; ndim];

    for idx in ndarray::indices(IxDyn(out_spatial)) {
        for axis in 0..ndim {
            point[axis] = idx[axis] as f64;
            dst_index[axis + 1] = idx[axis];
        }
        let coords = matrix::apply_to_point(matrix, &point);

        match interp {
            Interp::Nearest => {
                let mut inside = true;
                for (axis, c) in coords.iter().enumerate() {
                    let r = c.round();
                    if r < 0.0 || r > in_spatial[axis] as f64 - 1.0 {
                        inside = false;
                        break;
                    }
                    src_index[axis + 1] = r as usize;
                }
                if !inside {
                    continue;
                }
                for ch in 0..channels {
                    src_index[0] = ch;
                    dst_index[0] = ch;
                    out[&dst_index[..]] = src[&src_index[..]];
                }
            }
            Interp::Linear => {
                let floors: Vec<f64> = coords.iter().map(|c| c.floor()).collect();
                let fracs: Vec<f64> = coords.iter().zip(&floors).map(|(c, f)| c - f).collect();

                for corner in 0..(1usize << ndim) {
                    let mut weight = 1.0;
                    let mut inside = true;
                    for axis in 0..ndim {
                        let upper = (corner >> axis) & 1 == 1;
                        let w = if upper { fracs[axis] } else { 1.0 - fracs[axis] };
                        if w == 0.0 {
                            weight = 0.0;
                            break;
                        }
                        let pos = floors[axis] + if upper { 1.0 } else { 0.0 };
                        if pos < 0.0 || pos > in_spatial[axis] as f64 - 1.0 {
                            inside = false;
                            break;
                        }
                        weight *= w;
                        src_index[axis + 1] = pos as usize;
                    }
                    if weight == 0.0 || !inside {
                        continue;
                    }
                    for ch in 0..channels {
                        src_index[0] = ch;
                        dst_index[0] = ch;
                        out[&dst_index[..]] += (weight * f64::from(src[&src_index[..]])) as f32;
                    }
                }
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_identity_resample() {
        let src = array![[[1.0f32, 2.0], [3.0, 4.0]]].into_dyn();
        for interp in [Interp::Nearest, Interp::Linear] {
            let out = resample(&src, &matrix::identity(2), &[2, 2], interp).unwrap();
            assert_eq!(out, src);
        }
    }

    #[test]
    fn test_translation_zero_fills() {
        let src = array![[1.0f32, 2.0, 3.0]].into_dyn();
        let out = resample(&src, &matrix::translation(&[1.0]), &[3], Interp::Nearest).unwrap();
        assert_eq!(out, array![[2.0f32, 3.0, 0.0]].into_dyn());
    }

    #[test]
    fn test_linear_midpoint() {
        let src = array![[0.0f32, 10.0]].into_dyn();
        let out = resample(&src, &matrix::scaling(&[0.5]), &[3], Interp::Linear).unwrap();
        assert_eq!(out, array![[0.0f32, 5.0, 10.0]].into_dyn());
    }

    #[test]
    fn test_rejects_wrong_matrix() {
        let src = array![[0.0f32, 10.0]].into_dyn();
        let err = resample(&src, &matrix::identity(2), &[2], Interp::Nearest).unwrap_err();
        assert!(matches!(err, Error::Shape(_)));
    }
}
