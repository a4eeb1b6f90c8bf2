//! Timing harness for medpipe pipelines
//!
//! Compares a spatial pipeline run eagerly, resampling after every stage,
//! with the same pipeline run lazily, resampling once per fused group.

use std::time::{Duration, Instant};

use ndarray::{ArrayD, Dimension, IxDyn};
use tracing::info;

use medpipe_core::{Compose, Data, Error, MetaImage, Result, Transform};
use medpipe_transforms::{Affine, Flip, RandFlip, Rotate90, ShiftIntensity, SpatialCrop};

/// Benchmark configuration
#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// Number of timed iterations
    pub iterations: usize,

    /// Untimed iterations run first
    pub warmup_iterations: usize,

    /// Channels of the synthetic volume
    pub channels: usize,

    /// Spatial shape of the synthetic volume
    pub spatial_shape: Vec<usize>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            iterations: 10,
            warmup_iterations: 2,
            channels: 1,
            spatial_shape: vec![32, 64, 64],
        }
    }
}

impl BenchConfig {
    /// Voxels in one volume
    pub fn voxels(&self) -> usize {
        self.channels * self.spatial_shape.iter().product::<usize>()
    }
}

/// Benchmark result
#[derive(Debug, Clone)]
pub struct BenchResult {
    /// Name of the benchmark
    pub name: String,

    /// Total time taken
    pub total_time: Duration,

    /// Average time per iteration
    pub avg_time: Duration,

    /// Min time per iteration
    pub min_time: Duration,

    /// Max time per iteration
    pub max_time: Duration,

    /// Throughput (voxels/second)
    pub throughput: f64,
}

/// Time `func` over the configured iterations
pub fn run_benchmark<F>(name: &str, config: &BenchConfig, mut func: F) -> Result<BenchResult>
where
    F: FnMut() -> Result<()>,
{
    if config.iterations == 0 {
        return Err(Error::Value("a benchmark needs at least one iteration".into()));
    }

    for _ in 0..config.warmup_iterations {
        func()?;
    }

    let mut times = Vec::with_capacity(config.iterations);
    let start_total = Instant::now();
    for _ in 0..config.iterations {
        let start = Instant::now();
        func()?;
        times.push(start.elapsed());
    }
    let total_time = start_total.elapsed();

    let avg_time = times.iter().sum::<Duration>() / times.len() as u32;
    let min_time = times.iter().min().copied().unwrap_or_default();
    let max_time = times.iter().max().copied().unwrap_or_default();
    let throughput = (config.iterations * config.voxels()) as f64 / total_time.as_secs_f64();

    info!(target: "medpipe::bench", name, ?avg_time, throughput, "benchmark finished");
    Ok(BenchResult {
        name: name.to_string(),
        total_time,
        avg_time,
        min_time,
        max_time,
        throughput,
    })
}

/// A smooth synthetic volume
pub fn synthetic_volume(config: &BenchConfig) -> Result<MetaImage> {
    let mut shape = vec![config.channels];
    shape.extend_from_slice(&config.spatial_shape);
    let array = ArrayD::from_shape_fn(IxDyn(&shape), |index| {
        (1..index.ndim()).map(|axis| index[axis] as f32).sum::<f32>()
    });
    MetaImage::new(array)
}

/// Flip, quarter turn, small rotation and a centre crop, followed by an
/// intensity shift that forces a flush
pub fn spatial_pipeline(config: &BenchConfig, lazy: bool) -> Result<Compose> {
    let ndim = config.spatial_shape.len();
    if ndim < 2 {
        return Err(Error::Value(format!(
            "the spatial pipeline needs at least 2 spatial axes, got {}",
            ndim
        )));
    }
    let crop_end: Vec<i64> = config
        .spatial_shape
        .iter()
        .map(|&n| i64::try_from(n).unwrap_or(i64::MAX) - 2)
        .collect();
    let pipeline = Compose::new(vec![
        Box::new(Flip::axis(0)),
        Box::new(Rotate90::new(1, (ndim - 2, ndim - 1))?),
        Box::new(Affine::identity(ndim).rotate((ndim - 2, ndim - 1), 0.1)?),
        Box::new(SpatialCrop::from_start_end(&vec![2; ndim], &crop_end)?),
        Box::new(RandFlip::new(0.5, None)?),
        Box::new(ShiftIntensity::new(1.0)),
    ])
    .lazy(Some(lazy));
    Ok(pipeline)
}

/// Run the spatial pipeline eagerly and lazily
pub fn bench_lazy_vs_eager(config: &BenchConfig) -> Result<Vec<BenchResult>> {
    let volume = synthetic_volume(config)?;
    let mut results = Vec::with_capacity(2);
    for (name, lazy) in [("eager", false), ("lazy", true)] {
        let mut pipeline = spatial_pipeline(config, lazy)?;
        results.push(run_benchmark(name, config, || {
            pipeline.apply(Data::Image(volume.clone())).map(|_| ())
        })?);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bench_runs_both_modes() {
        let config = BenchConfig {
            iterations: 1,
            warmup_iterations: 0,
            channels: 1,
            spatial_shape: vec![6, 6],
        };
        let results = bench_lazy_vs_eager(&config).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].name, "eager");
        assert!(results[1].throughput > 0.0);
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let config = BenchConfig {
            iterations: 0,
            ..BenchConfig::default()
        };
        assert!(run_benchmark("noop", &config, || Ok(())).is_err());
    }

    #[test]
    fn test_pipeline_needs_a_plane() {
        let config = BenchConfig {
            spatial_shape: vec![16],
            ..BenchConfig::default()
        };
        assert!(matches!(spatial_pipeline(&config, true), Err(Error::Value(_))));
    }
}
