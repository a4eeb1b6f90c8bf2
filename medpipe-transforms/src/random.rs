//! Random spatial transforms
//!
//! Each transform wraps its deterministic counterpart behind a [`RandGate`].
//! Factors are drawn in `randomize`; a call with `randomize` disabled reuses
//! the last draw, which is how keyed application gives every key the same
//! decision.

use medpipe_core::pending::PendingOp;
use medpipe_core::{
    Backend, CallOptions, Capabilities, Data, Error, LazyTransform, RandGate, Randomizable,
    RandomState, Result, Transform, TransformId,
};

use crate::spatial::{apply_planned, crop_op, invert_planned, CropRoi, Flip, Rotate90};

/// Undo the last operation if `id` recorded it; a gate that did not fire left
/// nothing to undo
fn invert_if_applied(data: Data, name: &str, id: TransformId) -> Result<Data> {
    let mut img = data.into_image(name)?;
    img.apply_pending()?;
    let last = img
        .last_applied()
        .map(|record| (record.is_owned_by(&[id]), record.transform_ids.contains(&id), record.kind.clone()));
    match last {
        Some((true, _, _)) => invert_planned(Data::Image(img), name, id),
        Some((false, true, kind)) => Err(Error::Inversion(format!(
            "`{}` was fused with other transforms into `{}`; invert the enclosing pipeline instead",
            name, kind
        ))),
        _ => Ok(Data::Image(img)),
    }
}

/// Implements the `Transform` contract for a gated wrapper around a
/// deterministic spatial transform held in `$inner`
macro_rules! gated_transform {
    ($ty:ident, $inner:ident) => {
        impl $ty {
            /// Set the lazy flag of the wrapped transform
            pub fn with_lazy(mut self, lazy: Option<bool>) -> Self {
                self.$inner.set_lazy(lazy);
                self
            }

            /// Whether the last draw fired
            pub fn do_transform(&self) -> bool {
                self.gate.do_transform()
            }
        }

        impl Transform for $ty {
            fn name(&self) -> &str {
                stringify!($ty)
            }

            fn call(&mut self, data: Data, options: &CallOptions) -> Result<Data> {
                if options.randomize {
                    self.randomize(&data)?;
                }
                if !self.gate.do_transform() {
                    return Ok(data);
                }
                self.$inner.call(data, options)
            }

            fn id(&self) -> Option<TransformId> {
                self.$inner.id()
            }

            fn backends(&self) -> &'static [Backend] {
                &[Backend::Array]
            }

            fn capabilities(&self) -> Capabilities {
                self.$inner.capabilities().with_random()
            }

            fn as_lazy(&self) -> Option<&dyn LazyTransform> {
                self.$inner.as_lazy()
            }

            fn as_lazy_mut(&mut self) -> Option<&mut dyn LazyTransform> {
                self.$inner.as_lazy_mut()
            }

            fn as_randomizable(&mut self) -> Option<&mut dyn Randomizable> {
                Some(self)
            }

            fn inverse(&self, data: Data) -> Result<Data> {
                match self.$inner.id() {
                    Some(id) => invert_if_applied(data, stringify!($ty), id),
                    None => Ok(data),
                }
            }
        }
    };
}

/// Flip the given axes with probability `prob`
#[derive(Debug, Clone)]
pub struct RandFlip {
    flip: Flip,
    gate: RandGate,
}

impl RandFlip {
    /// Flip `spatial_axis` (all axes when `None`) with probability `prob`
    pub fn new(prob: f64, spatial_axis: Option<Vec<usize>>) -> Result<Self> {
        Ok(Self {
            flip: Flip::new(spatial_axis),
            gate: RandGate::new(prob)?,
        })
    }
}

impl Randomizable for RandFlip {
    fn random_state_mut(&mut self) -> &mut RandomState {
        self.gate.state_mut()
    }

    fn randomize(&mut self, _data: &Data) -> Result<()> {
        self.gate.randomize();
        Ok(())
    }
}

gated_transform!(RandFlip, flip);

/// Flip one randomly chosen spatial axis with probability `prob`
#[derive(Debug, Clone)]
pub struct RandAxisFlip {
    flip: Flip,
    gate: RandGate,
}

impl RandAxisFlip {
    /// Flip a random axis with probability `prob`
    pub fn new(prob: f64) -> Result<Self> {
        Ok(Self {
            flip: Flip::axis(0),
            gate: RandGate::new(prob)?,
        })
    }

    /// The axis chosen by the last draw that fired
    pub fn axis(&self) -> Option<usize> {
        self.flip.spatial_axis().and_then(|axes| axes.first().copied())
    }
}

impl Randomizable for RandAxisFlip {
    fn random_state_mut(&mut self) -> &mut RandomState {
        self.gate.state_mut()
    }

    fn randomize(&mut self, data: &Data) -> Result<()> {
        if !self.gate.randomize() {
            return Ok(());
        }
        let ndim = data.first_image().map_or(1, |img| img.spatial_ndim());
        let axis = self.gate.state_mut().below(ndim);
        self.flip.set_spatial_axis(Some(vec![axis]));
        Ok(())
    }
}

gated_transform!(RandAxisFlip, flip);

/// Rotate by a random number of quarter turns in `1..=max_k` with
/// probability `prob`
#[derive(Debug, Clone)]
pub struct RandRotate90 {
    rotate: Rotate90,
    max_k: usize,
    gate: RandGate,
}

impl RandRotate90 {
    /// Quarter turns in the plane `spatial_axes`
    pub fn new(prob: f64, max_k: usize, spatial_axes: (usize, usize)) -> Result<Self> {
        if max_k == 0 {
            return Err(Error::Value("max_k must be at least 1".into()));
        }
        Ok(Self {
            rotate: Rotate90::new(1, spatial_axes)?,
            max_k,
            gate: RandGate::new(prob)?,
        })
    }

    /// Quarter turns drawn by the last `randomize`
    pub fn k(&self) -> usize {
        self.rotate.k()
    }
}

impl Randomizable for RandRotate90 {
    fn random_state_mut(&mut self) -> &mut RandomState {
        self.gate.state_mut()
    }

    fn randomize(&mut self, _data: &Data) -> Result<()> {
        let k = self.gate.state_mut().below(self.max_k) + 1;
        self.rotate.set_k(k);
        self.gate.randomize();
        Ok(())
    }
}

gated_transform!(RandRotate90, rotate);

/// Crop a region of `roi_size` at a random or central position.
///
/// With `random_size`, each axis draws its size from `roi_size..=max_roi_size`
/// (the image size where no maximum is given). Non-positive sizes keep the
/// whole axis.
#[derive(Debug, Clone)]
pub struct RandSpatialCrop {
    roi_size: Vec<i64>,
    max_roi_size: Option<Vec<i64>>,
    random_center: bool,
    random_size: bool,
    roi: Option<CropRoi>,
    state: RandomState,
    id: TransformId,
    lazy: Option<bool>,
}

impl RandSpatialCrop {
    /// Crops of exactly `roi_size` at random positions
    pub fn new(roi_size: Vec<i64>) -> Self {
        Self {
            roi_size,
            max_roi_size: None,
            random_center: true,
            random_size: false,
            roi: None,
            state: RandomState::new(),
            id: TransformId::new(),
            lazy: None,
        }
    }

    /// Crop at the centre instead of a random position
    pub fn random_center(mut self, enabled: bool) -> Self {
        self.random_center = enabled;
        self
    }

    /// Draw the size of each axis up to `max_roi_size`
    pub fn random_size(mut self, max_roi_size: Option<Vec<i64>>) -> Result<Self> {
        if let Some(max) = &max_roi_size {
            if max.len() != self.roi_size.len() {
                return Err(Error::Value(format!(
                    "max_roi_size {:?} must match roi_size {:?}",
                    max, self.roi_size
                )));
            }
        }
        self.random_size = true;
        self.max_roi_size = max_roi_size;
        Ok(self)
    }

    /// Set the lazy flag
    pub fn with_lazy(mut self, lazy: Option<bool>) -> Self {
        self.lazy = lazy;
        self
    }

    /// The region drawn by the last `randomize`
    pub fn roi(&self) -> Option<&CropRoi> {
        self.roi.as_ref()
    }

    fn draw_size(&mut self, axis: usize, n: usize) -> usize {
        let requested = match self.roi_size.get(axis) {
            Some(&s) if s > 0 => (s as usize).min(n),
            _ => n,
        };
        if !self.random_size {
            return requested;
        }
        let max = match self.max_roi_size.as_ref().and_then(|m| m.get(axis)) {
            Some(&m) if m > 0 => (m as usize).min(n),
            _ => n,
        };
        if max <= requested {
            return requested;
        }
        requested + self.state.below(max - requested + 1)
    }

    fn plan(&self, shape: &[usize]) -> Result<PendingOp> {
        let roi = self.roi.as_ref().ok_or_else(|| {
            Error::Value("RandSpatialCrop must be randomized before it is applied".into())
        })?;
        Ok(crop_op("RandSpatialCrop", self.id, &roi.resolve(shape)))
    }
}

impl Randomizable for RandSpatialCrop {
    fn random_state_mut(&mut self) -> &mut RandomState {
        &mut self.state
    }

    fn randomize(&mut self, data: &Data) -> Result<()> {
        let shape = data
            .first_image()
            .map(|img| img.peek_pending_shape())
            .ok_or_else(|| {
                Error::Type(format!(
                    "RandSpatialCrop expects an image but got a {}",
                    data.kind_name()
                ))
            })?;

        let mut start = Vec::with_capacity(shape.len());
        let mut end = Vec::with_capacity(shape.len());
        for (axis, &n) in shape.iter().enumerate() {
            let size = self.draw_size(axis, n);
            let offset = if self.random_center {
                self.state.below(n - size + 1)
            } else {
                (n - size) / 2
            };
            start.push(offset as i64);
            end.push((offset + size) as i64);
        }
        self.roi = Some(CropRoi::from_start_end(&start, &end)?);
        Ok(())
    }
}

impl LazyTransform for RandSpatialCrop {
    fn lazy(&self) -> Option<bool> {
        self.lazy
    }

    fn set_lazy(&mut self, lazy: Option<bool>) {
        self.lazy = lazy;
    }
}

impl Transform for RandSpatialCrop {
    fn name(&self) -> &str {
        "RandSpatialCrop"
    }

    fn call(&mut self, data: Data, options: &CallOptions) -> Result<Data> {
        if options.randomize {
            self.randomize(&data)?;
        }
        let lazy = options.lazy.or(self.lazy).unwrap_or(false);
        apply_planned(data, "RandSpatialCrop", lazy, |shape| self.plan(shape))
    }

    fn id(&self) -> Option<TransformId> {
        Some(self.id)
    }

    fn backends(&self) -> &'static [Backend] {
        &[Backend::Array]
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
            .with_lazy()
            .with_invertible()
            .with_random()
    }

    fn as_lazy(&self) -> Option<&dyn LazyTransform> {
        Some(self)
    }

    fn as_lazy_mut(&mut self) -> Option<&mut dyn LazyTransform> {
        Some(self)
    }

    fn as_randomizable(&mut self) -> Option<&mut dyn Randomizable> {
        Some(self)
    }

    fn inverse(&self, data: Data) -> Result<Data> {
        invert_planned(data, "RandSpatialCrop", self.id)
    }
}
