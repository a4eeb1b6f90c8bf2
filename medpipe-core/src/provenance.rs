//! Applied-operation records and their registered inverses

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::image::MetaImage;
use crate::matrix;
use crate::resample::Interp;
use crate::transform::TransformId;

/// Inverse name of operations undone by resampling with the inverse matrix
pub const SPATIAL_INVERSE: &str = "spatial";

/// Inverse name of bookkeeping records that leave the data unchanged
pub const MARKER_INVERSE: &str = "marker";

/// A serializable descriptor of one operation applied to an image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpRecord {
    /// Operation kind, e.g. `Flip` or `LazyResample`
    pub kind: String,
    /// Transforms that produced this record; several for fused records
    pub transform_ids: Vec<TransformId>,
    /// Operation parameters
    pub params: serde_json::Value,
    /// Output-to-input index matrix of a spatial operation
    pub matrix: Option<Array2<f64>>,
    /// Spatial shape before the operation
    pub orig_spatial_shape: Vec<usize>,
    /// Interpolation used by the operation
    pub interp: Option<Interp>,
    /// Whether the operation was deferred and fused before being applied
    pub lazy: bool,
    /// Name of the registered inverse, if any
    pub inverse: Option<String>,
}

impl OpRecord {
    /// A spatial operation undone by resampling with the inverse matrix
    pub fn spatial(
        kind: impl Into<String>,
        transform_ids: Vec<TransformId>,
        matrix: Array2<f64>,
        orig_spatial_shape: Vec<usize>,
    ) -> Self {
        Self {
            kind: kind.into(),
            transform_ids,
            params: serde_json::Value::Null,
            matrix: Some(matrix),
            orig_spatial_shape,
            interp: None,
            lazy: false,
            inverse: Some(SPATIAL_INVERSE.to_string()),
        }
    }

    /// A bookkeeping record, e.g. the branch a selection took
    pub fn marker(kind: impl Into<String>, id: TransformId, params: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            transform_ids: vec![id],
            params,
            matrix: None,
            orig_spatial_shape: Vec::new(),
            interp: None,
            lazy: false,
            inverse: Some(MARKER_INVERSE.to_string()),
        }
    }

    /// Set the parameters
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// Set the interpolation mode
    pub fn with_interp(mut self, interp: Option<Interp>) -> Self {
        self.interp = interp;
        self
    }

    /// Mark the record as the result of a lazy flush
    pub fn with_lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    /// Whether every transform that produced this record is in `owners`
    pub fn is_owned_by(&self, owners: &[TransformId]) -> bool {
        !self.transform_ids.is_empty() && self.transform_ids.iter().all(|id| owners.contains(id))
    }
}

/// Signature of a registered inverse
pub type InverseFn = fn(&mut MetaImage, &OpRecord) -> Result<()>;

/// Lookup table from inverse name to the routine that undoes it
#[derive(Clone)]
pub struct InverseRegistry {
    inverses: HashMap<String, InverseFn>,
}

impl fmt::Debug for InverseRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.inverses.keys().collect();
        names.sort();
        f.debug_struct("InverseRegistry").field("inverses", &names).finish()
    }
}

impl Default for InverseRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InverseRegistry {
    /// A registry with no inverses
    pub fn empty() -> Self {
        Self {
            inverses: HashMap::new(),
        }
    }

    /// A registry holding the built-in spatial and marker inverses
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(SPATIAL_INVERSE, invert_spatial);
        registry.register(MARKER_INVERSE, invert_marker);
        registry
    }

    /// The process-wide default registry
    pub fn global() -> &'static InverseRegistry {
        static GLOBAL: OnceLock<InverseRegistry> = OnceLock::new();
        GLOBAL.get_or_init(InverseRegistry::new)
    }

    /// Register or replace an inverse
    pub fn register(&mut self, name: impl Into<String>, inverse: InverseFn) -> &mut Self {
        self.inverses.insert(name.into(), inverse);
        self
    }

    /// Whether `name` has a registered inverse
    pub fn contains(&self, name: &str) -> bool {
        self.inverses.contains_key(name)
    }

    /// Undo `record` on `image`
    pub fn invert_record(&self, image: &mut MetaImage, record: &OpRecord) -> Result<()> {
        let name = record.inverse.as_deref().ok_or_else(|| {
            Error::Inversion(format!("operation `{}` has no inverse", record.kind))
        })?;
        let inverse = self.inverses.get(name).ok_or_else(|| {
            Error::Inversion(format!(
                "operation `{}` refers to unregistered inverse `{}`",
                record.kind, name
            ))
        })?;
        inverse(image, record)
    }

    /// Flush `image` and undo its most recent operation, which must have been
    /// recorded by `owner` alone.
    pub fn invert_last(&self, image: &mut MetaImage, owner: TransformId, name: &str) -> Result<()> {
        image.apply_pending()?;
        match image.last_applied() {
            Some(record) if record.is_owned_by(&[owner]) => {}
            Some(record) => {
                return Err(Error::Inversion(format!(
                    "`{}` cannot invert `{}`, which it did not record",
                    name, record.kind
                )))
            }
            None => {
                return Err(Error::Inversion(format!(
                    "`{}` found no applied operations to invert",
                    name
                )))
            }
        }
        if let Some(record) = image.pop_applied() {
            self.invert_record(image, &record)?;
        }
        Ok(())
    }

    /// Flush `image` and undo, newest first, every operation recorded by
    /// `owners`. Stops at the first operation recorded by anyone else.
    pub fn invert_owned(&self, image: &mut MetaImage, owners: &[TransformId]) -> Result<usize> {
        image.apply_pending()?;
        let mut undone = 0;
        while image
            .last_applied()
            .map_or(false, |record| record.is_owned_by(owners))
        {
            if let Some(record) = image.pop_applied() {
                self.invert_record(image, &record)?;
                undone += 1;
            }
        }
        Ok(undone)
    }
}

fn invert_spatial(image: &mut MetaImage, record: &OpRecord) -> Result<()> {
    let m = record.matrix.as_ref().ok_or_else(|| {
        Error::Inversion(format!("spatial operation `{}` carries no matrix", record.kind))
    })?;
    let inverse = matrix::invert(m)
        .map_err(|e| Error::Inversion(format!("cannot invert `{}`: {}", record.kind, e)))?;
    image.resample(
        &inverse,
        &record.orig_spatial_shape,
        record.interp.unwrap_or(Interp::Nearest),
    )
}

fn invert_marker(_image: &mut MetaImage, _record: &OpRecord) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use serde_json::json;

    fn image() -> MetaImage {
        MetaImage::new(array![[[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]]].into_dyn()).unwrap()
    }

    #[test]
    fn test_spatial_inverse_restores_crop() {
        let id = TransformId::new();
        let mut img = image();
        let m = matrix::translation(&[0.0, 1.0]);
        img.resample(&m, &[2, 2], Interp::Nearest).unwrap();
        img.push_applied(OpRecord::spatial("SpatialCrop", vec![id], m, vec![2, 3]));

        InverseRegistry::global().invert_last(&mut img, id, "SpatialCrop").unwrap();
        assert_eq!(img.array(), &array![[[0.0f32, 2.0, 3.0], [0.0, 5.0, 6.0]]].into_dyn());
        assert_eq!(img.affine(), &matrix::identity(2));
        assert!(img.applied_operations().is_empty());
    }

    #[test]
    fn test_unregistered_inverse_fails() {
        let mut img = image();
        let mut record = OpRecord::marker("Custom", TransformId::new(), json!({}));
        record.inverse = Some("custom".into());
        let err = InverseRegistry::new().invert_record(&mut img, &record).unwrap_err();
        assert!(matches!(err, Error::Inversion(_)));
    }

    #[test]
    fn test_invert_last_checks_owner() {
        let mut img = image();
        img.push_applied(OpRecord::marker("OneOf", TransformId::new(), json!({"index": 0})));
        let err = InverseRegistry::global()
            .invert_last(&mut img, TransformId::new(), "Flip")
            .unwrap_err();
        assert!(matches!(err, Error::Inversion(_)));
        assert_eq!(img.applied_operations().len(), 1);
    }

    #[test]
    fn test_invert_owned_stops_at_foreign_record() {
        let ours = TransformId::new();
        let mut img = image();
        img.push_applied(OpRecord::marker("Load", TransformId::new(), json!(null)));
        img.push_applied(OpRecord::marker("OneOf", ours, json!({"index": 1})));
        img.push_applied(OpRecord::marker("RandomOrder", ours, json!({"order": [1, 0]})));

        let undone = InverseRegistry::global().invert_owned(&mut img, &[ours]).unwrap();
        assert_eq!(undone, 2);
        assert_eq!(img.last_applied().unwrap().kind, "Load");
    }

    #[test]
    fn test_record_roundtrips_through_json() {
        let record = OpRecord::spatial("Flip", vec![TransformId::new()], matrix::identity(2), vec![4, 4])
            .with_params(json!({"axes": [0]}));
        let back: OpRecord = serde_json::from_str(&serde_json::to_string(&record).unwrap()).unwrap();
        assert_eq!(back, record);
    }
}
