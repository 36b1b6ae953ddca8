use anyhow::{Context, Result};
use burn::tensor::{Shape, Tensor, TensorData};
use burn_ndarray::NdArray;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use emseg_core::{dice, ScalarVolume, Volume};
use emseg_engine::{EmEngine, EngineConfig, SegmentationInput, TracingProgress};
use emseg_model::{MarkovTensor, StoppingCriteria, SuperClass, TissueClass};

const AIR: i32 = 1;
const GREY: i32 = 2;
const WHITE: i32 = 3;

type Backend = NdArray<f32>;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Developer tasks for the emseg workspace")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Segment a synthetic three-tissue phantom and report Dice overlaps
    Phantom {
        /// Edge length of the cubic phantom in voxels
        #[arg(short, long, default_value_t = 24)]
        size: usize,

        /// Peak-to-peak intensity noise
        #[arg(short, long, default_value_t = 10.0)]
        noise: f32,

        /// Multiplicative intensity ramp along x (0 disables it)
        #[arg(long, default_value_t = 0.0)]
        bias: f32,

        /// EM iterations per level
        #[arg(short, long, default_value_t = 10)]
        iterations: usize,

        /// Worker threads (defaults to the available parallelism)
        #[arg(short, long)]
        threads: Option<usize>,

        /// Write the root's global registration parameters to this file
        #[arg(long)]
        params_out: Option<PathBuf>,
    },

    /// Turn a nine-parameter registration file into a VTK homogeneous transform
    ConvertParams {
        input: PathBuf,
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Phantom { size, noise, bias, iterations, threads, params_out } => {
            run_phantom(size, noise, bias, iterations, threads, params_out)?;
        }
        Commands::ConvertParams { input, output } => {
            emseg_io::convert_parameter_file(&input, &output)
                .with_context(|| format!("Failed to convert {}", input.display()))?;
            info!("Wrote homogeneous transform to {}", output.display());
        }
    }

    Ok(())
}

/// Ground-truth label of a voxel: a white core inside a grey shell.
fn phantom_label(size: usize, x: usize, y: usize, z: usize) -> i32 {
    let c = (size as f64 - 1.0) / 2.0;
    let r = ((x as f64 - c).powi(2) + (y as f64 - c).powi(2) + (z as f64 - c).powi(2)).sqrt();
    let outer = size as f64 * 0.4;
    if r < outer * 0.5 {
        WHITE
    } else if r < outer {
        GREY
    } else {
        AIR
    }
}

fn tissue_intensity(label: i32) -> f32 {
    match label {
        WHITE => 150.0,
        GREY => 60.0,
        _ => 5.0,
    }
}

/// Deterministic noise in `[-0.5, 0.5)` so runs are reproducible.
fn hash_noise(x: usize, y: usize, z: usize) -> f32 {
    let mut h = (x as u64).wrapping_mul(73_856_093)
        ^ (y as u64).wrapping_mul(19_349_663)
        ^ (z as u64).wrapping_mul(83_492_791);
    h ^= h >> 13;
    h = h.wrapping_mul(0x5bd1_e995);
    h ^= h >> 15;
    (h % 1024) as f32 / 1024.0 - 0.5
}

/// Scale every voxel by `1 + bias (x / nx - 0.5)`.
fn apply_bias(image: &Volume<f32>, bias: f32) -> Result<Volume<f32>> {
    if bias == 0.0 {
        return Ok(image.clone());
    }
    let device = Default::default();
    let [nx, ny, nz] = image.dims();
    let ramp: Vec<f32> = (0..nx).map(|x| 1.0 + bias * (x as f32 / nx as f32 - 0.5)).collect();
    let ramp = Tensor::<Backend, 3>::from_data(TensorData::new(ramp, Shape::new([1, 1, nx])), &device)
        .expand([nz, ny, nx]);
    let biased = image.to_tensor::<Backend>(&device) * ramp;
    Ok(Volume::from_tensor(&biased, image.spacing())?)
}

fn tissue(name: &str, label: i32) -> TissueClass {
    let mean = f64::from(tissue_intensity(label) + 1.0).ln();
    TissueClass::new(name, label, 1).with_log_gaussian(mean, 0.05)
}

fn phantom_tree(iterations: usize) -> SuperClass {
    let brain = SuperClass::new("brain")
        .with_child(tissue("grey", GREY))
        .with_child(tissue("white", WHITE))
        .with_markov(MarkovTensor::homogeneous(2, 0.8, 0.2))
        .with_stopping(StoppingCriteria::label_map(0.0, iterations));
    SuperClass::new("head")
        .with_child(tissue("air", AIR))
        .with_child(brain)
        .with_stopping(StoppingCriteria::fixed(iterations))
}

fn run_phantom(
    size: usize,
    noise: f32,
    bias: f32,
    iterations: usize,
    threads: Option<usize>,
    params_out: Option<PathBuf>,
) -> Result<()> {
    let dims = [size, size, size];
    let truth = Volume::from_fn(dims, |x, y, z| phantom_label(size, x, y, z));
    let image = Volume::from_fn(dims, |x, y, z| {
        (tissue_intensity(truth.get(x, y, z)) + noise * hash_noise(x, y, z)).max(0.0)
    });
    let image = apply_bias(&image, bias)?;

    let mut config = EngineConfig::default();
    if let Some(threads) = threads {
        config = config.with_threads(threads);
    }
    let mut engine = EmEngine::new(config)?;
    engine.add_callback(Arc::new(TracingProgress::new(1)));

    let mut root = phantom_tree(iterations);
    let input = SegmentationInput::new(vec![Arc::new(ScalarVolume::from(image))]);
    let result = engine.segment(&mut root, &input)?;

    for level in &result.levels {
        info!(
            "level {} ({}): {} iterations, measure {:.3}, converged {}",
            level.name, level.label, level.iterations, level.measure, level.converged
        );
    }
    if result.diagnostics.warnings.flag() {
        warn!("warnings:\n{}", result.diagnostics.warnings.messages());
    }
    if !result.success {
        anyhow::bail!("segmentation failed:\n{}", result.diagnostics.errors.messages());
    }

    for (name, label) in [("air", AIR), ("grey", GREY), ("white", WHITE)] {
        let overlap = dice(&result.labels, &truth, label, None)?;
        println!("{:<6} dice {:.4}", name, overlap);
    }

    if let Some(path) = params_out {
        emseg_io::write_parameter_file(&path, &root.registration.global_parameters)?;
        info!("Wrote global parameters to {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bias_ramps_along_x() {
        let image = Volume::from_fn([4, 2, 3], |_, _, _| 100.0f32);
        let biased = apply_bias(&image, 1.0).unwrap();
        assert_eq!(biased.dims(), [4, 2, 3]);
        for (x, expected) in [50.0, 75.0, 100.0, 125.0].into_iter().enumerate() {
            assert!((biased.get(x, 1, 2) - expected).abs() < 1e-4);
        }
        assert_eq!(apply_bias(&image, 0.0).unwrap().as_slice(), image.as_slice());
    }

    #[test]
    fn test_phantom_has_three_tissues() {
        let size = 10;
        let labels: Vec<i32> = (0..size).map(|x| phantom_label(size, x, 4, 4)).collect();
        assert_eq!(labels[0], AIR);
        assert!(labels.contains(&GREY));
        assert_eq!(labels[4], WHITE);
    }
}
