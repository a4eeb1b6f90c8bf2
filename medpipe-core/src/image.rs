//! Image-like values: a channel-first array with metadata and provenance

use std::sync::Arc;

use ndarray::{Array2, ArrayD};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::lazy::{self, PendingLedger, PendingOp};
use crate::matrix;
use crate::provenance::OpRecord;
use crate::resample::{resample, Interp};

/// Spatial metadata of an image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMeta {
    /// Voxel-to-world homogeneous matrix, `(d+1) x (d+1)`
    pub affine: Array2<f64>,
    /// Spatial shape as loaded, before any transform
    pub original_shape: Vec<usize>,
    /// Where the image was read from
    pub source: Option<String>,
    /// Free-form metadata carried along unchanged
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// An n-dimensional channel-first array (`[C, s1, .., sd]`) with metadata,
/// applied-operation provenance and a ledger of deferred spatial operations.
///
/// The array buffer is shared between clones and copied on first mutation,
/// so fanning a record out into branches only copies what a branch changes.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaImage {
    array: Arc<ArrayD<f32>>,
    meta: ImageMeta,
    applied: Vec<OpRecord>,
    pending: PendingLedger,
}

impl MetaImage {
    /// Wrap a channel-first array with an identity affine
    pub fn new(array: ArrayD<f32>) -> Result<Self> {
        if array.ndim() < 2 {
            return Err(Error::Shape(format!(
                "an image needs a channel axis and at least one spatial axis, got shape {:?}",
                array.shape()
            )));
        }
        let spatial = array.shape()[1..].to_vec();
        Ok(Self {
            meta: ImageMeta {
                affine: matrix::identity(spatial.len()),
                original_shape: spatial,
                source: None,
                extra: serde_json::Map::new(),
            },
            array: Arc::new(array),
            applied: Vec::new(),
            pending: PendingLedger::default(),
        })
    }

    /// Replace the voxel-to-world affine
    pub fn with_affine(mut self, affine: Array2<f64>) -> Result<Self> {
        matrix::check_homogeneous(&affine, self.spatial_ndim())?;
        self.meta.affine = affine;
        Ok(self)
    }

    /// Record where the image came from
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.meta.source = Some(source.into());
        self
    }

    /// The materialized array. Deferred operations are not reflected.
    pub fn array(&self) -> &ArrayD<f32> {
        &self.array
    }

    /// Mutable access to the array, copying the buffer if it is shared
    pub fn array_mut(&mut self) -> &mut ArrayD<f32> {
        Arc::make_mut(&mut self.array)
    }

    /// Replace the array. The number of spatial axes must not change.
    pub fn set_array(&mut self, array: ArrayD<f32>) -> Result<()> {
        if array.ndim() != self.array.ndim() {
            return Err(Error::Shape(format!(
                "replacement array has {} axes, expected {}",
                array.ndim(),
                self.array.ndim()
            )));
        }
        self.array = Arc::new(array);
        Ok(())
    }

    /// Whether two images share one array buffer
    pub fn shares_buffer_with(&self, other: &MetaImage) -> bool {
        Arc::ptr_eq(&self.array, &other.array)
    }

    /// Spatial metadata
    pub fn meta(&self) -> &ImageMeta {
        &self.meta
    }

    /// Mutable spatial metadata
    pub fn meta_mut(&mut self) -> &mut ImageMeta {
        &mut self.meta
    }

    /// The voxel-to-world affine of the materialized array
    pub fn affine(&self) -> &Array2<f64> {
        &self.meta.affine
    }

    /// Number of channels
    pub fn channels(&self) -> usize {
        self.array.shape()[0]
    }

    /// Shape without the channel axis
    pub fn spatial_shape(&self) -> &[usize] {
        &self.array.shape()[1..]
    }

    /// Number of spatial axes
    pub fn spatial_ndim(&self) -> usize {
        self.array.ndim() - 1
    }

    /// Operations applied so far, oldest first
    pub fn applied_operations(&self) -> &[OpRecord] {
        &self.applied
    }

    /// The most recent applied operation
    pub fn last_applied(&self) -> Option<&OpRecord> {
        self.applied.last()
    }

    /// Append to the provenance
    pub fn push_applied(&mut self, op: OpRecord) {
        self.applied.push(op);
    }

    /// Remove the most recent applied operation
    pub fn pop_applied(&mut self) -> Option<OpRecord> {
        self.applied.pop()
    }

    /// Deferred operations
    pub fn pending(&self) -> &PendingLedger {
        &self.pending
    }

    /// Defer a spatial operation
    pub fn push_pending(&mut self, op: PendingOp) {
        self.pending.push(op);
    }

    pub(crate) fn take_pending(&mut self) -> Vec<PendingOp> {
        self.pending.take()
    }

    /// Spatial shape once all deferred operations are applied
    pub fn peek_pending_shape(&self) -> Vec<usize> {
        self.pending
            .last()
            .map_or_else(|| self.spatial_shape().to_vec(), |op| op.out_spatial_shape.clone())
    }

    /// Affine once all deferred operations are applied
    pub fn peek_pending_affine(&self) -> Array2<f64> {
        self.pending
            .iter()
            .fold(self.meta.affine.clone(), |acc, op| acc.dot(&op.matrix))
    }

    /// Materialize all deferred operations
    pub fn apply_pending(&mut self) -> Result<()> {
        lazy::flush(self)
    }

    /// Resample the array onto a new grid and update the affine accordingly.
    ///
    /// `m` maps output voxel coordinates to current voxel coordinates.
    pub fn resample(&mut self, m: &Array2<f64>, out_spatial: &[usize], interp: Interp) -> Result<()> {
        matrix::check_homogeneous(m, self.spatial_ndim())?;
        let unchanged = out_spatial == self.spatial_shape()
            && m.iter()
                .zip(matrix::identity(self.spatial_ndim()).iter())
                .all(|(a, b)| (a - b).abs() < 1e-12);
        if !unchanged {
            let out = resample(&self.array, m, out_spatial, interp)?;
            self.array = Arc::new(out);
        }
        self.meta.affine = self.meta.affine.dot(m);
        Ok(())
    }

    /// Minimum and maximum of the materialized values
    pub fn value_range(&self) -> Option<(f32, f32)> {
        self.array.iter().fold(None, |acc, &v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn image() -> MetaImage {
        MetaImage::new(array![[[0.0f32, 1.0], [1.0, 2.0]]].into_dyn()).unwrap()
    }

    #[test]
    fn test_requires_channel_axis() {
        let err = MetaImage::new(array![1.0f32, 2.0].into_dyn()).unwrap_err();
        assert!(matches!(err, Error::Shape(_)));
    }

    #[test]
    fn test_clone_shares_until_write() {
        let a = image();
        let mut b = a.clone();
        assert!(a.shares_buffer_with(&b));

        b.array_mut()[[0, 0, 0]] = 9.0;
        assert!(!a.shares_buffer_with(&b));
        assert_eq!(a.array()[[0, 0, 0]], 0.0);
    }

    #[test]
    fn test_resample_updates_affine() {
        let mut img = image();
        img.resample(&matrix::translation(&[1.0, 0.0]), &[1, 2], Interp::Nearest)
            .unwrap();
        assert_eq!(img.array(), &array![[[1.0f32, 2.0]]].into_dyn());
        assert_eq!(img.affine()[[0, 2]], 1.0);
    }

    #[test]
    fn test_rejects_bad_affine() {
        let err = image().with_affine(matrix::identity(3)).unwrap_err();
        assert!(matches!(err, Error::Shape(_)));
    }

    #[test]
    fn test_value_range() {
        assert_eq!(image().value_range(), Some((0.0, 2.0)));
    }

    #[test]
    fn test_meta_serializes() {
        let img = image().with_source("ct.nii.gz");
        let json = serde_json::to_value(img.meta()).unwrap();
        assert_eq!(json["source"], "ct.nii.gz");
        let back: ImageMeta = serde_json::from_value(json).unwrap();
        assert_eq!(&back, img.meta());
    }
}
