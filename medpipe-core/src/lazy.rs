//! Ledger of deferred spatial operations
//!
//! Lazy-capable transforms describe their effect as a [`PendingOp`] instead of
//! resampling immediately. When the ledger is flushed, consecutive compatible
//! operations are multiplied into one matrix and applied in a single
//! resampling, so a chain of crops, flips and affines interpolates once.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::image::MetaImage;
use crate::provenance::OpRecord;
use crate::resample::Interp;
use crate::transform::TransformId;

/// Kind of the record pushed for a fused group of deferred operations
pub const LAZY_RESAMPLE_KIND: &str = "LazyResample";

/// A deferred spatial operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOp {
    /// Operation kind, e.g. `Flip`
    pub kind: String,
    /// Transform that deferred the operation
    pub transform_id: TransformId,
    /// Output-to-input index matrix
    pub matrix: Array2<f64>,
    /// Spatial shape after the operation
    pub out_spatial_shape: Vec<usize>,
    /// Required interpolation; `None` for operations that map grid points
    /// onto grid points and so need none
    pub interp: Option<Interp>,
    /// Operation parameters
    pub params: serde_json::Value,
}

impl PendingOp {
    /// An index-exact operation (crop, pad, flip, quarter turn)
    pub fn new(
        kind: impl Into<String>,
        transform_id: TransformId,
        matrix: Array2<f64>,
        out_spatial_shape: Vec<usize>,
    ) -> Self {
        Self {
            kind: kind.into(),
            transform_id,
            matrix,
            out_spatial_shape,
            interp: None,
            params: serde_json::Value::Null,
        }
    }

    /// Require an interpolation mode
    pub fn with_interp(mut self, interp: Interp) -> Self {
        self.interp = Some(interp);
        self
    }

    /// Set the parameters
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

/// Per-image queue of deferred operations, oldest first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingLedger {
    ops: Vec<PendingOp>,
}

impl PendingLedger {
    /// Append an operation
    pub fn push(&mut self, op: PendingOp) {
        self.ops.push(op);
    }

    /// Number of deferred operations
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether nothing is deferred
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Iterate oldest first
    pub fn iter(&self) -> std::slice::Iter<'_, PendingOp> {
        self.ops.iter()
    }

    /// The newest operation
    pub fn last(&self) -> Option<&PendingOp> {
        self.ops.last()
    }

    /// Kinds of the deferred operations, oldest first
    pub fn kinds(&self) -> Vec<&str> {
        self.ops.iter().map(|op| op.kind.as_str()).collect()
    }

    pub(crate) fn take(&mut self) -> Vec<PendingOp> {
        std::mem::take(&mut self.ops)
    }
}

/// Consecutive operations that resample together
struct FusedGroup {
    matrix: Array2<f64>,
    out_spatial_shape: Vec<usize>,
    interp: Option<Interp>,
    kinds: Vec<String>,
    ids: Vec<TransformId>,
}

impl FusedGroup {
    fn start(op: PendingOp) -> Self {
        Self {
            matrix: op.matrix,
            out_spatial_shape: op.out_spatial_shape,
            interp: op.interp,
            kinds: vec![op.kind],
            ids: vec![op.transform_id],
        }
    }

    fn accepts(&self, op: &PendingOp) -> bool {
        match (self.interp, op.interp) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }

    fn absorb(&mut self, op: PendingOp) {
        self.matrix = self.matrix.dot(&op.matrix);
        self.out_spatial_shape = op.out_spatial_shape;
        self.interp = self.interp.or(op.interp);
        self.kinds.push(op.kind);
        if !self.ids.contains(&op.transform_id) {
            self.ids.push(op.transform_id);
        }
    }
}

fn fuse(ops: Vec<PendingOp>) -> Vec<FusedGroup> {
    let mut groups: Vec<FusedGroup> = Vec::new();
    for op in ops {
        match groups.last_mut() {
            Some(group) if group.accepts(&op) => group.absorb(op),
            _ => groups.push(FusedGroup::start(op)),
        }
    }
    groups
}

/// Materialize every deferred operation on `image`.
///
/// Each fused group is resampled once and recorded as one
/// [`LAZY_RESAMPLE_KIND`] operation listing the kinds it fused. Flushing an
/// empty ledger does nothing.
pub fn flush(image: &mut MetaImage) -> Result<()> {
    let ops = image.take_pending();
    if ops.is_empty() {
        return Ok(());
    }

    let count = ops.len();
    let groups = fuse(ops);
    debug!(
        target: "medpipe::compose",
        pending = count,
        resamplings = groups.len(),
        "flushing deferred operations"
    );

    for group in groups {
        let before = image.spatial_shape().to_vec();
        image.resample(
            &group.matrix,
            &group.out_spatial_shape,
            group.interp.unwrap_or(Interp::Nearest),
        )?;
        let record = OpRecord::spatial(LAZY_RESAMPLE_KIND, group.ids, group.matrix, before)
            .with_params(serde_json::json!({ "fused": group.kinds }))
            .with_interp(group.interp)
            .with_lazy(true);
        image.push_applied(record);
    }
    Ok(())
}

/// Apply a spatial operation to `image`, deferring it when `lazy` is set.
///
/// An eager application first flushes anything already deferred so the
/// operation sees the grid it was planned against.
pub fn apply_spatial(image: &mut MetaImage, op: PendingOp, lazy: bool) -> Result<()> {
    if lazy {
        debug!(target: "medpipe::compose", kind = %op.kind, "deferring operation");
        image.push_pending(op);
        return Ok(());
    }

    image.apply_pending()?;
    let before = image.spatial_shape().to_vec();
    image.resample(
        &op.matrix,
        &op.out_spatial_shape,
        op.interp.unwrap_or(Interp::Nearest),
    )?;
    let record = OpRecord::spatial(op.kind, vec![op.transform_id], op.matrix, before)
        .with_params(op.params)
        .with_interp(op.interp);
    image.push_applied(record);
    Ok(())
}
