//! Lazy-capable, invertible spatial transforms
//!
//! Each transform plans its effect as an output-to-input index matrix against
//! the shape the image will have once pending operations are applied, so it
//! can be deferred and fused with its neighbours.

use ndarray::Array2;
use serde_json::json;

use medpipe_core::matrix;
use medpipe_core::pending::{apply_spatial, Interp, PendingOp};
use medpipe_core::{Data, Error, InverseRegistry, Result, TransformId};

/// Plan against the pending shape of the image in `data` and apply
pub(crate) fn apply_planned<F>(data: Data, name: &str, lazy: bool, plan: F) -> Result<Data>
where
    F: FnOnce(&[usize]) -> Result<PendingOp>,
{
    let mut img = data.into_image(name)?;
    let shape = img.peek_pending_shape();
    let op = plan(&shape)?;
    apply_spatial(&mut img, op, lazy)?;
    Ok(Data::Image(img))
}

/// Undo the most recent operation on the image in `data`, which `id` must own
pub(crate) fn invert_planned(data: Data, name: &str, id: TransformId) -> Result<Data> {
    let mut img = data.into_image(name)?;
    InverseRegistry::global().invert_last(&mut img, id, name)?;
    Ok(Data::Image(img))
}

/// Implements the lazy facet and the `Transform` contract for a spatial
/// transform with `id` and `lazy` fields and a `plan` method
macro_rules! spatial_transform {
    ($ty:ident) => {
        impl $ty {
            /// Set the lazy flag: always defer, never defer, or follow the pipeline
            pub fn with_lazy(mut self, lazy: Option<bool>) -> Self {
                self.lazy = lazy;
                self
            }
        }

        impl medpipe_core::LazyTransform for $ty {
            fn lazy(&self) -> Option<bool> {
                self.lazy
            }

            fn set_lazy(&mut self, lazy: Option<bool>) {
                self.lazy = lazy;
            }
        }

        impl medpipe_core::Transform for $ty {
            fn name(&self) -> &str {
                stringify!($ty)
            }

            fn call(
                &mut self,
                data: medpipe_core::Data,
                options: &medpipe_core::CallOptions,
            ) -> medpipe_core::Result<medpipe_core::Data> {
                let lazy = options.lazy.or(self.lazy).unwrap_or(false);
                $crate::spatial::apply_planned(data, stringify!($ty), lazy, |shape| self.plan(shape))
            }

            fn id(&self) -> Option<medpipe_core::TransformId> {
                Some(self.id)
            }

            fn backends(&self) -> &'static [medpipe_core::Backend] {
                &[medpipe_core::Backend::Array]
            }

            fn capabilities(&self) -> medpipe_core::Capabilities {
                medpipe_core::Capabilities::NONE.with_lazy().with_invertible()
            }

            fn as_lazy(&self) -> Option<&dyn medpipe_core::LazyTransform> {
                Some(self)
            }

            fn as_lazy_mut(&mut self) -> Option<&mut dyn medpipe_core::LazyTransform> {
                Some(self)
            }

            fn inverse(&self, data: medpipe_core::Data) -> medpipe_core::Result<medpipe_core::Data> {
                $crate::spatial::invert_planned(data, stringify!($ty), self.id)
            }
        }
    };
}

/// Mirror along spatial axes
#[derive(Debug, Clone)]
pub struct Flip {
    spatial_axis: Option<Vec<usize>>,
    id: TransformId,
    lazy: Option<bool>,
}

impl Flip {
    /// Flip `spatial_axis`, or every spatial axis when `None`
    pub fn new(spatial_axis: Option<Vec<usize>>) -> Self {
        Self {
            spatial_axis,
            id: TransformId::new(),
            lazy: None,
        }
    }

    /// Flip one axis
    pub fn axis(axis: usize) -> Self {
        Self::new(Some(vec![axis]))
    }

    /// The axes flipped
    pub fn spatial_axis(&self) -> Option<&[usize]> {
        self.spatial_axis.as_deref()
    }

    pub(crate) fn set_spatial_axis(&mut self, spatial_axis: Option<Vec<usize>>) {
        self.spatial_axis = spatial_axis;
    }

    fn plan(&self, shape: &[usize]) -> Result<PendingOp> {
        let axes = self
            .spatial_axis
            .clone()
            .unwrap_or_else(|| (0..shape.len()).collect());
        let m = matrix::flip(shape, &axes)?;
        Ok(PendingOp::new("Flip", self.id, m, shape.to_vec()).with_params(json!({ "spatial_axis": axes })))
    }
}

spatial_transform!(Flip);

/// Quarter turns in a plane of two spatial axes
#[derive(Debug, Clone)]
pub struct Rotate90 {
    k: usize,
    spatial_axes: (usize, usize),
    id: TransformId,
    lazy: Option<bool>,
}

impl Rotate90 {
    /// `k` counter-clockwise quarter turns from `spatial_axes.0` towards
    /// `spatial_axes.1`
    pub fn new(k: usize, spatial_axes: (usize, usize)) -> Result<Self> {
        if spatial_axes.0 == spatial_axes.1 {
            return Err(Error::Value(format!(
                "spatial_axes must name two different axes, got {:?}",
                spatial_axes
            )));
        }
        Ok(Self {
            k,
            spatial_axes,
            id: TransformId::new(),
            lazy: None,
        })
    }

    /// Number of quarter turns
    pub fn k(&self) -> usize {
        self.k
    }

    pub(crate) fn set_k(&mut self, k: usize) {
        self.k = k;
    }

    fn plan(&self, shape: &[usize]) -> Result<PendingOp> {
        let (m, out) = matrix::rot90(shape, self.k, self.spatial_axes)?;
        Ok(PendingOp::new("Rotate90", self.id, m, out)
            .with_params(json!({ "k": self.k, "spatial_axes": [self.spatial_axes.0, self.spatial_axes.1] })))
    }
}

spatial_transform!(Rotate90);

/// A crop region in voxel coordinates, resolved against the image at call
/// time. Axes beyond those given are kept whole.
///
/// An open bound (`None`) reaches the edge of the axis. Negative slice bounds
/// count back from the end of the axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CropRoi {
    start: Vec<Option<i64>>,
    end: Vec<Option<i64>>,
}

/// `(start, stop, step)` with open bounds, as in a slice expression
pub type RoiSlice = (Option<i64>, Option<i64>, Option<i64>);

impl CropRoi {
    /// Region `start..end` per axis. Negative starts are clipped to zero and
    /// an end before its start gives an empty axis.
    pub fn from_start_end(start: &[i64], end: &[i64]) -> Result<Self> {
        if start.len() != end.len() {
            return Err(Error::Value(format!(
                "roi_start and roi_end must have the same length, got {} and {}",
                start.len(),
                end.len()
            )));
        }
        let (start, end) = start
            .iter()
            .zip(end)
            .map(|(&s, &e)| {
                let s = s.max(0);
                (Some(s), Some(e.max(s)))
            })
            .unzip();
        Ok(Self { start, end })
    }

    /// Region of `size` around `center`; a negative size keeps the whole axis
    pub fn from_center_size(center: &[i64], size: &[i64]) -> Result<Self> {
        if center.len() != size.len() {
            return Err(Error::Value(format!(
                "roi_center and roi_size must have the same length, got {} and {}",
                center.len(),
                size.len()
            )));
        }
        let (start, end) = center
            .iter()
            .zip(size)
            .map(|(&c, &s)| {
                if s < 0 {
                    (Some(0), None)
                } else {
                    let start = (c - s.div_euclid(2)).max(0);
                    (Some(start), Some(start + s))
                }
            })
            .unzip();
        Ok(Self { start, end })
    }

    /// Region given as slices; only unit steps are supported
    pub fn from_slices(slices: &[RoiSlice]) -> Result<Self> {
        if let Some(slice) = slices.iter().find(|(_, _, step)| step.unwrap_or(1) != 1) {
            return Err(Error::Value(format!(
                "only slice steps of 1 are supported, got {:?}",
                slice
            )));
        }
        Ok(Self {
            start: slices.iter().map(|(s, _, _)| *s).collect(),
            end: slices.iter().map(|(_, e, _)| *e).collect(),
        })
    }

    /// Clip the region to `shape`, returning `(start, end)` per axis
    pub fn resolve(&self, shape: &[usize]) -> Vec<(usize, usize)> {
        shape
            .iter()
            .enumerate()
            .map(|(axis, &n)| {
                if axis >= self.start.len() {
                    return (0, n);
                }
                let extent = i64::try_from(n).unwrap_or(i64::MAX);
                let s = slice_index(self.start[axis], extent, 0);
                let e = slice_index(self.end[axis], extent, extent).max(s);
                (s as usize, e as usize)
            })
            .collect()
    }
}

fn slice_index(bound: Option<i64>, extent: i64, open: i64) -> i64 {
    match bound {
        None => open,
        Some(i) if i < 0 => (i + extent).max(0),
        Some(i) => i.min(extent),
    }
}

pub(crate) fn crop_op(kind: &str, id: TransformId, bounds: &[(usize, usize)]) -> PendingOp {
    let offset: Vec<f64> = bounds.iter().map(|(s, _)| *s as f64).collect();
    let out: Vec<usize> = bounds.iter().map(|(s, e)| e - s).collect();
    PendingOp::new(kind, id, matrix::translation(&offset), out)
        .with_params(json!({ "roi_start": bounds.iter().map(|b| b.0).collect::<Vec<_>>(), "roi_end": bounds.iter().map(|b| b.1).collect::<Vec<_>>() }))
}

/// Crop a fixed region
#[derive(Debug, Clone)]
pub struct SpatialCrop {
    roi: CropRoi,
    id: TransformId,
    lazy: Option<bool>,
}

impl SpatialCrop {
    /// Crop `roi`
    pub fn new(roi: CropRoi) -> Self {
        Self {
            roi,
            id: TransformId::new(),
            lazy: None,
        }
    }

    /// Crop `start..end` per axis
    pub fn from_start_end(start: &[i64], end: &[i64]) -> Result<Self> {
        Ok(Self::new(CropRoi::from_start_end(start, end)?))
    }

    /// Crop `size` around `center`
    pub fn from_center_size(center: &[i64], size: &[i64]) -> Result<Self> {
        Ok(Self::new(CropRoi::from_center_size(center, size)?))
    }

    /// Crop unit-step slices
    pub fn from_slices(slices: &[RoiSlice]) -> Result<Self> {
        Ok(Self::new(CropRoi::from_slices(slices)?))
    }

    /// The crop region
    pub fn roi(&self) -> &CropRoi {
        &self.roi
    }

    fn plan(&self, shape: &[usize]) -> Result<PendingOp> {
        Ok(crop_op("SpatialCrop", self.id, &self.roi.resolve(shape)))
    }
}

spatial_transform!(SpatialCrop);

/// Crop a region of `roi_size` at the centre of the image. Non-positive sizes
/// keep the whole axis.
#[derive(Debug, Clone)]
pub struct CenterSpatialCrop {
    roi_size: Vec<i64>,
    id: TransformId,
    lazy: Option<bool>,
}

impl CenterSpatialCrop {
    /// Centre crop to `roi_size`
    pub fn new(roi_size: Vec<i64>) -> Self {
        Self {
            roi_size,
            id: TransformId::new(),
            lazy: None,
        }
    }

    fn plan(&self, shape: &[usize]) -> Result<PendingOp> {
        let bounds: Vec<(usize, usize)> = shape
            .iter()
            .enumerate()
            .map(|(axis, &n)| match self.roi_size.get(axis) {
                Some(&s) if s > 0 => {
                    let size = (s as usize).min(n);
                    let start = (n / 2).saturating_sub(size / 2).min(n - size);
                    (start, start + size)
                }
                _ => (0, n),
            })
            .collect();
        Ok(crop_op("CenterSpatialCrop", self.id, &bounds))
    }
}

spatial_transform!(CenterSpatialCrop);

/// Where padding goes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PadMethod {
    /// Split evenly, the extra voxel after
    #[default]
    Symmetric,
    /// All padding after the data
    End,
}

/// Zero-pad to at least `spatial_size`. Axes already large enough, and
/// non-positive sizes, are left alone.
#[derive(Debug, Clone)]
pub struct SpatialPad {
    spatial_size: Vec<i64>,
    method: PadMethod,
    id: TransformId,
    lazy: Option<bool>,
}

impl SpatialPad {
    /// Pad to `spatial_size`
    pub fn new(spatial_size: Vec<i64>, method: PadMethod) -> Self {
        Self {
            spatial_size,
            method,
            id: TransformId::new(),
            lazy: None,
        }
    }

    fn plan(&self, shape: &[usize]) -> Result<PendingOp> {
        let mut before = Vec::with_capacity(shape.len());
        let mut out = Vec::with_capacity(shape.len());
        for (axis, &n) in shape.iter().enumerate() {
            let target = match self.spatial_size.get(axis) {
                Some(&s) if s > 0 => (s as usize).max(n),
                _ => n,
            };
            let diff = target - n;
            before.push(match self.method {
                PadMethod::Symmetric => diff / 2,
                PadMethod::End => 0,
            });
            out.push(target);
        }
        let offset: Vec<f64> = before.iter().map(|b| -(*b as f64)).collect();
        Ok(PendingOp::new("SpatialPad", self.id, matrix::translation(&offset), out)
            .with_params(json!({ "pad_before": before })))
    }
}

spatial_transform!(SpatialPad);

/// Resample through a homogeneous matrix applied about the image centre.
///
/// The matrix maps centred output coordinates to centred input coordinates:
/// a scale of 2 samples the input twice as far out, shrinking its content.
#[derive(Debug, Clone)]
pub struct Affine {
    matrix: Array2<f64>,
    spatial_size: Option<Vec<usize>>,
    interp: Interp,
    id: TransformId,
    lazy: Option<bool>,
}

impl Affine {
    /// The identity for `ndim` spatial axes
    pub fn identity(ndim: usize) -> Self {
        Self {
            matrix: matrix::identity(ndim),
            spatial_size: None,
            interp: Interp::default(),
            id: TransformId::new(),
            lazy: None,
        }
    }

    /// An explicit `(d+1) x (d+1)` matrix
    pub fn from_matrix(m: Array2<f64>) -> Result<Self> {
        let ndim = m.nrows().saturating_sub(1);
        matrix::check_homogeneous(&m, ndim)?;
        let mut affine = Self::identity(ndim);
        affine.matrix = m;
        Ok(affine)
    }

    fn ndim(&self) -> usize {
        self.matrix.nrows() - 1
    }

    /// Follow with a rotation by `radians` in the plane of two axes
    pub fn rotate(mut self, plane: (usize, usize), radians: f64) -> Result<Self> {
        let ndim = self.ndim();
        let (a, b) = plane;
        if a >= ndim || b >= ndim || a == b {
            return Err(Error::Value(format!(
                "rotation plane {:?} is invalid for {} spatial dimensions",
                plane, ndim
            )));
        }
        let (sin, cos) = radians.sin_cos();
        let mut r = matrix::identity(ndim);
        r[[a, a]] = cos;
        r[[a, b]] = -sin;
        r[[b, a]] = sin;
        r[[b, b]] = cos;
        self.matrix = r.dot(&self.matrix);
        Ok(self)
    }

    /// Follow with a per-axis scaling
    pub fn scale(mut self, factors: &[f64]) -> Result<Self> {
        if factors.len() != self.ndim() {
            return Err(Error::Value(format!(
                "expected {} scale factors, got {}",
                self.ndim(),
                factors.len()
            )));
        }
        if factors.iter().any(|f| *f == 0.0) {
            return Err(Error::Value("scale factors must be non-zero".into()));
        }
        self.matrix = matrix::scaling(factors).dot(&self.matrix);
        Ok(self)
    }

    /// Follow with a per-axis translation in voxels
    pub fn translate(mut self, offsets: &[f64]) -> Result<Self> {
        if offsets.len() != self.ndim() {
            return Err(Error::Value(format!(
                "expected {} offsets, got {}",
                self.ndim(),
                offsets.len()
            )));
        }
        self.matrix = matrix::translation(offsets).dot(&self.matrix);
        Ok(self)
    }

    /// Output spatial shape; the input shape when unset
    pub fn with_spatial_size(mut self, spatial_size: Vec<usize>) -> Self {
        self.spatial_size = Some(spatial_size);
        self
    }

    /// Interpolation mode
    pub fn with_interp(mut self, interp: Interp) -> Self {
        self.interp = interp;
        self
    }

    /// The centred output-to-input matrix
    pub fn matrix(&self) -> &Array2<f64> {
        &self.matrix
    }

    fn plan(&self, shape: &[usize]) -> Result<PendingOp> {
        matrix::check_homogeneous(&self.matrix, shape.len())?;
        let out = self.spatial_size.clone().unwrap_or_else(|| shape.to_vec());
        if out.len() != shape.len() {
            return Err(Error::Shape(format!(
                "spatial_size {:?} does not match {} spatial dimensions",
                out,
                shape.len()
            )));
        }
        let to_input = matrix::translation(&matrix::centre(shape));
        let from_output = matrix::translation(&matrix::centre(&out).iter().map(|c| -c).collect::<Vec<_>>());
        let m = to_input.dot(&self.matrix).dot(&from_output);

        let exact = matrix::is_index_exact(&m);
        let op = PendingOp::new("Affine", self.id, m, out)
            .with_params(json!({ "interp": self.interp }));
        Ok(if exact { op } else { op.with_interp(self.interp) })
    }
}

spatial_transform!(Affine);

#[cfg(test)]
mod tests {
    use super::*;
    use medpipe_core::{MetaImage, Transform};
    use ndarray::{array, ArrayD, IxDyn};
    use test_case::test_case;

    fn grid(rows: usize, cols: usize) -> Data {
        let values: Vec<f32> = (0..rows * cols).map(|v| v as f32).collect();
        let array = ArrayD::from_shape_vec(IxDyn(&[1, rows, cols]), values).unwrap();
        Data::Image(MetaImage::new(array).unwrap())
    }

    fn array_of(data: &Data) -> &ArrayD<f32> {
        data.as_image().unwrap().array()
    }

    #[test]
    fn test_flip_axis() {
        let out = Flip::axis(1).apply(grid(2, 3)).unwrap();
        assert_eq!(array_of(&out), &array![[[2.0f32, 1.0, 0.0], [5.0, 4.0, 3.0]]].into_dyn());
    }

    #[test]
    fn test_rotate90_matches_numpy() {
        let out = Rotate90::new(1, (0, 1)).unwrap().apply(grid(2, 3)).unwrap();
        assert_eq!(
            array_of(&out),
            &array![[[2.0f32, 5.0], [1.0, 4.0], [0.0, 3.0]]].into_dyn()
        );
    }

    #[test_case(CropRoi::from_start_end(&[1, 1], &[3, 10]).unwrap(), vec![(1, 3), (1, 5)] ; "clipped end")]
    #[test_case(CropRoi::from_start_end(&[-2, 3], &[2, 1]).unwrap(), vec![(0, 2), (3, 3)] ; "negative start and inverted")]
    #[test_case(CropRoi::from_center_size(&[2, 2], &[2, -1]).unwrap(), vec![(1, 3), (0, 5)] ; "centre and full axis")]
    #[test_case(CropRoi::from_slices(&[(Some(1), Some(2), Some(1))]).unwrap(), vec![(1, 2), (0, 5)] ; "trailing axis kept")]
    #[test_case(CropRoi::from_slices(&[(Some(-1), Some(4), None), (None, Some(-2), None)]).unwrap(), vec![(3, 4), (0, 3)] ; "negative slice bounds")]
    #[test_case(CropRoi::from_slices(&[(Some(2), None, None), (Some(-9), None, None)]).unwrap(), vec![(2, 4), (0, 5)] ; "open slice ends")]
    fn test_crop_roi_resolution(roi: CropRoi, expected: Vec<(usize, usize)>) {
        assert_eq!(roi.resolve(&[4, 5]), expected);
    }

    proptest::proptest! {
        #[test]
        fn prop_resolved_crop_stays_inside(
            start in proptest::collection::vec(-10i64..20, 2),
            end in proptest::collection::vec(-10i64..20, 2),
            rows in 1usize..12,
            cols in 1usize..12,
        ) {
            let roi = CropRoi::from_start_end(&start, &end).unwrap();
            for ((s, e), n) in roi.resolve(&[rows, cols]).into_iter().zip([rows, cols]) {
                proptest::prop_assert!(s <= e);
                proptest::prop_assert!(e <= n);
            }
        }
    }

    #[test]
    fn test_crop_roi_rejects_steps() {
        assert!(matches!(CropRoi::from_slices(&[(Some(0), Some(4), Some(2))]), Err(Error::Value(_))));
        assert!(matches!(CropRoi::from_start_end(&[0], &[1, 2]), Err(Error::Value(_))));
    }

    #[test]
    fn test_crop_last_voxel_by_negative_slice() {
        let mut crop = SpatialCrop::from_slices(&[(Some(-1), Some(4), None), (Some(0), Some(4), None)]).unwrap();
        let out = crop.apply(grid(4, 4)).unwrap();
        assert_eq!(array_of(&out), &array![[[12.0f32, 13.0, 14.0, 15.0]]].into_dyn());
    }

    #[test]
    fn test_center_crop_and_pad() {
        let out = CenterSpatialCrop::new(vec![2, 2]).apply(grid(4, 4)).unwrap();
        assert_eq!(array_of(&out), &array![[[5.0f32, 6.0], [9.0, 10.0]]].into_dyn());

        let padded = SpatialPad::new(vec![4, 3], PadMethod::Symmetric).apply(out).unwrap();
        assert_eq!(
            array_of(&padded),
            &array![[[0.0f32, 0.0, 0.0], [5.0, 6.0, 0.0], [9.0, 10.0, 0.0], [0.0, 0.0, 0.0]]].into_dyn()
        );
    }

    #[test]
    fn test_pad_inverse_is_exact() {
        let mut pad = SpatialPad::new(vec![5, 6], PadMethod::End).with_lazy(Some(false));
        let input = grid(3, 4);
        let out = pad.apply(input.clone()).unwrap();
        let back = pad.inverse(out).unwrap();
        assert_eq!(back, input);
    }

    #[test]
    fn test_affine_quarter_turn_is_index_exact() {
        let mut rot = Affine::identity(2)
            .rotate((0, 1), std::f64::consts::FRAC_PI_2)
            .unwrap();
        let op = rot.plan(&[3, 3]).unwrap();
        assert!(op.interp.is_none());
        let out = rot.apply(grid(3, 3)).unwrap();
        assert_eq!(array_of(&out)[[0, 1, 1]], 4.0);
    }

    #[test]
    fn test_inverse_requires_own_record() {
        let mut flip = Flip::axis(0);
        let other = Flip::axis(0);
        let out = flip.apply(grid(2, 2)).unwrap();
        assert!(matches!(other.inverse(out), Err(Error::Inversion(_))));
    }
}
