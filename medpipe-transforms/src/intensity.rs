//! Voxel intensity transforms
//!
//! Intensity changes cannot be deferred, so each of these materializes any
//! pending spatial operations before touching the array.

use medpipe_core::{
    Backend, CallOptions, Capabilities, Data, Error, MetaImage, RandGate, Randomizable,
    RandomState, Result, Transform,
};

fn map_image<F>(data: Data, name: &str, f: F) -> Result<Data>
where
    F: FnOnce(&mut MetaImage),
{
    let mut img = data.into_image(name)?;
    img.apply_pending()?;
    f(&mut img);
    Ok(Data::Image(img))
}

/// Add a constant to every voxel
#[derive(Debug, Clone)]
pub struct ShiftIntensity {
    offset: f32,
}

impl ShiftIntensity {
    /// Shift by `offset`
    pub fn new(offset: f32) -> Self {
        Self { offset }
    }
}

impl Transform for ShiftIntensity {
    fn name(&self) -> &str {
        "ShiftIntensity"
    }

    fn call(&mut self, data: Data, _options: &CallOptions) -> Result<Data> {
        let offset = self.offset;
        map_image(data, "ShiftIntensity", |img| {
            img.array_mut().mapv_inplace(|v| v + offset);
        })
    }

    fn backends(&self) -> &'static [Backend] {
        &[Backend::Array]
    }
}

/// Rescale intensities to `[minv, maxv]`, or multiply by `1 + factor`
#[derive(Debug, Clone)]
pub struct ScaleIntensity {
    mode: ScaleMode,
}

#[derive(Debug, Clone, Copy)]
enum ScaleMode {
    Range { minv: f32, maxv: f32 },
    Factor(f32),
}

impl ScaleIntensity {
    /// Rescale the value range to `[minv, maxv]`
    pub fn range(minv: f32, maxv: f32) -> Result<Self> {
        if minv > maxv {
            return Err(Error::Value(format!(
                "minv must not exceed maxv, got {} and {}",
                minv, maxv
            )));
        }
        Ok(Self {
            mode: ScaleMode::Range { minv, maxv },
        })
    }

    /// Multiply every voxel by `1 + factor`
    pub fn factor(factor: f32) -> Self {
        Self {
            mode: ScaleMode::Factor(factor),
        }
    }
}

impl Transform for ScaleIntensity {
    fn name(&self) -> &str {
        "ScaleIntensity"
    }

    fn call(&mut self, data: Data, _options: &CallOptions) -> Result<Data> {
        let mode = self.mode;
        map_image(data, "ScaleIntensity", |img| match mode {
            ScaleMode::Factor(factor) => img.array_mut().mapv_inplace(|v| v * (1.0 + factor)),
            ScaleMode::Range { minv, maxv } => {
                let Some((lo, hi)) = img.value_range() else {
                    return;
                };
                if hi == lo {
                    // a constant image carries no range to stretch
                    img.array_mut().mapv_inplace(|v| v * minv);
                    return;
                }
                let scale = (maxv - minv) / (hi - lo);
                img.array_mut().mapv_inplace(|v| (v - lo) * scale + minv);
            }
        })
    }

    fn backends(&self) -> &'static [Backend] {
        &[Backend::Array]
    }
}

/// Add an offset drawn from `[low, high)` with probability `prob`
#[derive(Debug, Clone)]
pub struct RandShiftIntensity {
    low: f64,
    high: f64,
    offset: f64,
    gate: RandGate,
}

impl RandShiftIntensity {
    /// Offsets between the two bounds, given in either order
    pub fn new(offsets: (f64, f64), prob: f64) -> Result<Self> {
        let (low, high) = if offsets.0 <= offsets.1 {
            offsets
        } else {
            (offsets.1, offsets.0)
        };
        Ok(Self {
            low,
            high,
            offset: 0.0,
            gate: RandGate::new(prob)?,
        })
    }

    /// Offsets in `[-magnitude, magnitude)`
    pub fn symmetric(magnitude: f64, prob: f64) -> Result<Self> {
        Self::new((-magnitude.abs(), magnitude.abs()), prob)
    }

    /// The offset drawn by the last `randomize`
    pub fn offset(&self) -> f64 {
        self.offset
    }

    /// Whether the last draw fired
    pub fn do_transform(&self) -> bool {
        self.gate.do_transform()
    }
}

impl Randomizable for RandShiftIntensity {
    fn random_state_mut(&mut self) -> &mut RandomState {
        self.gate.state_mut()
    }

    fn randomize(&mut self, _data: &Data) -> Result<()> {
        if self.gate.randomize() {
            self.offset = self.gate.state_mut().uniform_range(self.low, self.high);
        }
        Ok(())
    }
}

impl Transform for RandShiftIntensity {
    fn name(&self) -> &str {
        "RandShiftIntensity"
    }

    fn call(&mut self, data: Data, options: &CallOptions) -> Result<Data> {
        if options.randomize {
            self.randomize(&data)?;
        }
        if !self.gate.do_transform() {
            return Ok(data);
        }
        let offset = self.offset as f32;
        map_image(data, "RandShiftIntensity", |img| {
            img.array_mut().mapv_inplace(|v| v + offset);
        })
    }

    fn backends(&self) -> &'static [Backend] {
        &[Backend::Array]
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE.with_random()
    }

    fn as_randomizable(&mut self) -> Option<&mut dyn Randomizable> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn image(values: ndarray::ArrayD<f32>) -> Data {
        Data::Image(MetaImage::new(values).unwrap())
    }

    #[test]
    fn test_scale_range() {
        let out = ScaleIntensity::range(0.0, 1.0)
            .unwrap()
            .apply(image(array![[2.0f32, 4.0, 6.0]].into_dyn()))
            .unwrap();
        assert_eq!(out.as_image().unwrap().array(), &array![[0.0f32, 0.5, 1.0]].into_dyn());
    }

    #[test]
    fn test_scale_constant_image() {
        let out = ScaleIntensity::range(2.0, 3.0)
            .unwrap()
            .apply(image(array![[5.0f32, 5.0]].into_dyn()))
            .unwrap();
        assert_eq!(out.as_image().unwrap().array(), &array![[10.0f32, 10.0]].into_dyn());
    }

    #[test]
    fn test_scale_rejects_inverted_range() {
        assert!(matches!(ScaleIntensity::range(1.0, 0.0), Err(Error::Value(_))));
    }

    #[test]
    fn test_shift_flushes_pending() {
        let mut flip = crate::Flip::axis(0).with_lazy(Some(true));
        let deferred = flip.apply(image(array![[1.0f32, 2.0]].into_dyn())).unwrap();
        assert_eq!(deferred.pending_count(), 1);

        let out = ShiftIntensity::new(1.0).apply(deferred).unwrap();
        let img = out.as_image().unwrap();
        assert!(img.pending().is_empty());
        assert_eq!(img.array(), &array![[3.0f32, 2.0]].into_dyn());
    }

    #[test]
    fn test_rand_shift_bounds() {
        let mut shift = RandShiftIntensity::new((2.0, -1.0), 1.0).unwrap().seeded(3u64);
        for _ in 0..50 {
            shift.apply(image(array![[0.0f32]].into_dyn())).unwrap();
            assert!((-1.0..2.0).contains(&shift.offset()));
        }
    }
}
