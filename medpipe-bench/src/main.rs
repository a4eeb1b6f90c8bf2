//! Benchmark runner comparing eager and lazy resampling

use medpipe_bench::{bench_lazy_vs_eager, BenchConfig};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    println!("=== medpipe resampling benchmarks ===");

    for spatial_shape in [vec![64, 64], vec![16, 64, 64], vec![32, 96, 96]] {
        let config = BenchConfig {
            iterations: 5,
            warmup_iterations: 1,
            channels: 1,
            spatial_shape,
        };

        println!("\nVolume: {:?}", config.spatial_shape);
        for result in bench_lazy_vs_eager(&config)? {
            println!("  {}", result.name);
            println!("    Total time:   {:?}", result.total_time);
            println!("    Average time: {:?}", result.avg_time);
            println!("    Min time:     {:?}", result.min_time);
            println!("    Max time:     {:?}", result.max_time);
            println!("    Throughput:   {:.2} voxels/sec", result.throughput);
        }
    }
    Ok(())
}
