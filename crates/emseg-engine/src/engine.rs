//! Hierarchical EM driver.
//!
//! [`EmEngine::segment`] runs one EM loop per superclass, top-down. Each
//! level writes its hard labels where its parent's labels equal the
//! superclass label, then recurses into every child superclass with those
//! labels as the region of interest. A failing level aborts only its own
//! subtree.

use std::sync::Arc;
use std::time::Instant;

use emseg_core::interpolation::InterpolationType;
use emseg_core::{
    build_worker_pool, AffineMatrix, GaussianSmoother, Result, SegmentationError, Volume,
};
use emseg_model::{
    assign_labels, Diagnostics, HierarchyNode, RegistrationType, StopType, SuperClass, VoxelStatus,
};
use emseg_registration::CoordinateSearch;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bias::estimate_bias;
use crate::config::EngineConfig;
use crate::convergence::ConvergenceMonitor;
use crate::estep::{e_step, EStepContext};
use crate::input::{PreparedInput, SegmentationInput};
use crate::intensity::reestimate_intensity;
use crate::level::{LevelModel, PriorSource};
use crate::progress::{IterationInfo, ProgressCallback, ProgressTracker};
use crate::register::{register_level, MStepContext};
use crate::shape_step::{estimates_shape, fit_shapes};

/// Name of the root level; children append `-<index>`.
const ROOT_LEVEL: &str = "1";

/// Outcome of one hierarchy level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelReport {
    pub name: String,
    pub label: i32,
    pub iterations: usize,
    /// The stopping rule was met (a fixed count always is).
    pub converged: bool,
    /// Last convergence measure.
    pub measure: f64,
    pub success: bool,
}

/// Result of [`EmEngine::segment`].
#[derive(Debug, Clone)]
pub struct Segmentation {
    /// Leaf label per voxel over the whole image; `0` where unsegmented.
    pub labels: Volume<i32>,
    pub diagnostics: Diagnostics,
    /// Every level succeeded.
    pub success: bool,
    /// One report per level, in the order the levels ran.
    pub levels: Vec<LevelReport>,
}

/// State shared by all levels of one run.
struct RunState<'a> {
    input: &'a PreparedInput,
    /// Bias field per channel over the boundary; child levels start from
    /// their parent's estimate.
    bias: Vec<Vec<f64>>,
    /// Output labels over the boundary.
    labels: Vec<i32>,
    reports: Vec<LevelReport>,
}

struct LevelResult {
    labels: Vec<i32>,
    global_to_atlas: AffineMatrix,
    registers: bool,
}

/// EM segmentation engine. Holds the worker pool, optimizer and smoother
/// for any number of runs.
pub struct EmEngine {
    config: EngineConfig,
    pool: Arc<ThreadPool>,
    optimizer: CoordinateSearch,
    smoother: GaussianSmoother,
    progress: ProgressTracker,
}

impl EmEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let pool = build_worker_pool(config.number_of_threads)?;
        let optimizer = CoordinateSearch::new(config.optimizer)?;
        let smoother = config.smoother()?;
        Ok(Self {
            config,
            pool,
            optimizer,
            smoother,
            progress: ProgressTracker::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn add_callback(&mut self, callback: Arc<dyn ProgressCallback>) {
        self.progress.add_callback(callback);
    }

    /// Segment `input` with the hierarchy rooted at `root`.
    ///
    /// Input and tree problems are returned as errors before anything runs.
    /// Failures inside a level are recorded in the diagnostics and only
    /// abort that level's subtree. Registration and shape estimates are
    /// written back into `root`.
    pub fn segment(&self, root: &mut SuperClass, input: &SegmentationInput) -> Result<Segmentation> {
        let prepared = PreparedInput::prepare(input, root)?;
        let mut diagnostics = Diagnostics::new();
        emseg_model::update(root, &mut diagnostics)?;
        let labels = assign_labels(root);
        info!(
            channels = prepared.channel_count(),
            voxels = prepared.voxel_count(),
            classes = root.leaf_count(),
            labels = labels.len(),
            threads = self.pool.current_num_threads(),
            "starting hierarchical segmentation"
        );

        let count = prepared.voxel_count();
        let mut run = RunState {
            input: &prepared,
            bias: vec![vec![0.0; count]; prepared.channel_count()],
            labels: vec![0; count],
            reports: Vec::new(),
        };
        let success = self.segment_level(
            root,
            ROOT_LEVEL,
            None,
            AffineMatrix::identity(),
            &mut run,
            &mut diagnostics,
        );

        let mut output = Volume::filled(prepared.dims, 0);
        output.insert(&prepared.boundary, &run.labels)?;
        info!(success, levels = run.reports.len(), "segmentation finished");
        Ok(Segmentation {
            labels: output,
            diagnostics,
            success,
            levels: run.reports,
        })
    }

    fn segment_level(
        &self,
        head: &mut SuperClass,
        name: &str,
        roi: Option<&[i32]>,
        global_to_atlas: AffineMatrix,
        run: &mut RunState<'_>,
        diagnostics: &mut Diagnostics,
    ) -> bool {
        let label = head.label;
        let level = match self.run_level(head, name, roi, &global_to_atlas, run, diagnostics) {
            Ok(level) => level,
            Err(error) => {
                diagnostics.error(name, format!("segmentation of '{}' failed: {}", head.name, error));
                self.progress.error(name, &error.to_string());
                if let Some(roi) = roi {
                    for (out, &parent) in run.labels.iter_mut().zip(roi) {
                        if parent == label {
                            *out = 0;
                        }
                    }
                }
                run.reports.push(LevelReport {
                    name: name.to_string(),
                    label,
                    iterations: 0,
                    converged: false,
                    measure: f64::NAN,
                    success: false,
                });
                return false;
            }
        };

        for (index, (out, &value)) in run.labels.iter_mut().zip(&level.labels).enumerate() {
            if roi.map_or(true, |r| r[index] == label) {
                *out = value;
            }
        }

        let head_name = head.name.clone();
        let mut success = true;
        for index in 0..head.child_count() {
            let Some(HierarchyNode::SuperClass(sub)) = head.children_mut()[index].as_mut() else {
                continue;
            };
            let child_name = format!("{}-{}", name, index);
            let mut child_diagnostics = Diagnostics::new();
            if level.registers && sub.registration.registration_type == RegistrationType::Disabled {
                child_diagnostics.warn(
                    &child_name,
                    format!(
                        "parent '{}' registers but '{}' has registration disabled",
                        head_name, sub.name
                    ),
                );
            }
            success &= self.segment_level(
                sub,
                &child_name,
                Some(&level.labels),
                level.global_to_atlas,
                run,
                &mut child_diagnostics,
            );
            diagnostics.merge(&child_diagnostics);
        }
        success
    }

    /// Registration type after the downgrade policy.
    fn effective_registration(
        &self,
        head: &SuperClass,
        name: &str,
        diagnostics: &mut Diagnostics,
    ) -> Result<RegistrationType> {
        let mut kind = head.registration.registration_type;
        if kind > RegistrationType::Disabled && head.registration.interpolation == InterpolationType::None {
            diagnostics.warn(name, "registration needs an interpolation type; registration disabled");
            kind = RegistrationType::Disabled;
        }
        if kind == RegistrationType::Sequential {
            return Err(SegmentationError::invalid_configuration(
                "sequential registration is not supported",
            ));
        }
        if kind.is_class_specific() && head.child_count() <= 2 {
            diagnostics.warn(
                name,
                format!(
                    "class-specific registration needs more than 2 children, found {}; using global-only registration",
                    head.child_count()
                ),
            );
            kind = RegistrationType::GlobalOnly;
        }
        if kind.is_class_specific() {
            let skip = usize::from(head.generate_background);
            let specific = head
                .children()
                .iter()
                .skip(skip)
                .flatten()
                .any(|child| child.registration().class_specific);
            if !specific {
                let fallback = if kind == RegistrationType::ClassOnly {
                    RegistrationType::Disabled
                } else {
                    RegistrationType::GlobalOnly
                };
                diagnostics.warn(
                    name,
                    format!("{:?} registration without class-specific children; using {:?}", kind, fallback),
                );
                kind = fallback;
            }
        }
        if kind == RegistrationType::Simultaneous && head.generate_background {
            diagnostics.warn(
                name,
                "simultaneous registration with a generated background probability",
            );
        }
        Ok(kind)
    }

    fn run_level(
        &self,
        head: &mut SuperClass,
        name: &str,
        roi: Option<&[i32]>,
        global_to_atlas: &AffineMatrix,
        run: &mut RunState<'_>,
        diagnostics: &mut Diagnostics,
    ) -> Result<LevelResult> {
        let started = Instant::now();
        self.progress.start(name);
        let kind = self.effective_registration(head, name, diagnostics)?;

        let ignore_maps = roi.is_some()
            && head.prob_data_weight == 0.0
            && head.leaves().iter().any(|leaf| leaf.has_spatial_prior());
        if ignore_maps {
            diagnostics.warn(
                name,
                format!(
                    "'{}' has prob_data_weight 0; the probability maps of its classes are ignored",
                    head.name
                ),
            );
        }

        let input = run.input;
        let mut model = LevelModel::build(
            head,
            name,
            kind,
            ignore_maps,
            self.config.number_of_training_samples,
            input.dims,
        )?;
        let mut transforms = model.transforms(global_to_atlas)?;

        let count = input.voxel_count();
        let mut status: Vec<VoxelStatus> = (0..count)
            .map(|i| {
                let inside = match roi {
                    Some(parent) => parent[i] == head.label,
                    None => input.in_root_roi(i),
                };
                if inside {
                    VoxelStatus::Regular
                } else {
                    VoxelStatus::OutsideRoi
                }
            })
            .collect();
        let in_roi = status.iter().filter(|s| s.in_roi()).count();
        let flat = 1.0 / model.leaf_count() as f64;
        let mut weights: Vec<Vec<f64>> = (0..model.leaf_count())
            .map(|_| status.iter().map(|s| if s.in_roi() { flat } else { 0.0 }).collect())
            .collect();

        let mut monitor = ConvergenceMonitor::new(model.stopping);
        let max_iterations = monitor.max_iterations();
        info!(
            level = %name,
            superclass = %head.name,
            classes = model.leaf_count(),
            voxels = in_roi,
            registration = ?kind,
            "segmenting level"
        );

        let mut iteration = 0;
        let mut measure = 0.0;
        let mut converged = false;
        if in_roi == 0 {
            diagnostics.warn(name, format!("'{}' has an empty region of interest", head.name));
        }
        while in_roi > 0 && iteration < max_iterations {
            iteration += 1;
            let incomplete = {
                let ctx = EStepContext {
                    model: &model,
                    input,
                    bias: &run.bias,
                    transforms: transforms.as_ref(),
                    alpha: self.config.alpha,
                };
                e_step(&ctx, &mut weights, &mut status, &self.pool)
            };
            if incomplete > 0 {
                debug!(level = %name, iteration, voxels = incomplete, "voxels without a spatial prior");
            }

            if model.stop_bias_calculation.map_or(true, |stop| iteration <= stop) {
                estimate_bias(&model, input, &weights, &status, &self.smoother, &self.pool, &mut run.bias)?;
            }
            if self.config.reestimate_intensity {
                reestimate_intensity(
                    &mut model,
                    input,
                    &run.bias,
                    &weights,
                    &status,
                    self.config.variance_floor,
                    &self.pool,
                )?;
            }

            let mstep = MStepContext {
                input,
                weights: &weights,
                status: &status,
                global_to_atlas,
                config: &self.config,
                optimizer: &self.optimizer,
                pool: &self.pool,
            };
            if kind.estimates() {
                let outcome = register_level(&mut model, head, &mstep)?;
                transforms = model.transforms(global_to_atlas)?;
                info!(level = %name, iteration, cost = outcome.cost, evaluations = outcome.evaluations, "registration updated");
            }
            if estimates_shape(&model) {
                if let Some(outcome) = fit_shapes(&mut model, head, transforms.as_ref(), &mstep)? {
                    info!(level = %name, iteration, cost = outcome.cost, evaluations = outcome.evaluations, "shape updated");
                }
            }

            let (value, stop) = monitor.update(&model, &weights, &status);
            measure = value;
            self.progress.iteration(&IterationInfo::new(
                name,
                iteration,
                max_iterations,
                measure,
                started.elapsed(),
            ));
            if stop {
                converged = true;
                break;
            }
        }
        if model.stopping.stop_type == StopType::Fixed {
            converged = true;
        }

        let labels = (0..count)
            .map(|i| {
                if status[i].in_roi() {
                    let (child, _) = model.dominant_child(&weights, i);
                    model.children[child].label.max(0)
                } else {
                    0
                }
            })
            .collect();
        let info = IterationInfo::new(name, iteration, max_iterations, measure, started.elapsed());
        self.progress.complete(&info);
        run.reports.push(LevelReport {
            name: name.to_string(),
            label: head.label,
            iterations: iteration,
            converged,
            measure,
            success: true,
        });
        warn_on_unused_background(&model, name, diagnostics);

        Ok(LevelResult {
            labels,
            global_to_atlas: transforms.map_or(*global_to_atlas, |t| t.superclass),
            registers: kind > RegistrationType::Disabled,
        })
    }
}

/// A generated background next to siblings without any spatial prior is
/// `N` everywhere, which is rarely intended.
fn warn_on_unused_background(model: &LevelModel, name: &str, diagnostics: &mut Diagnostics) {
    if !model.generate_background {
        return;
    }
    let defined = model
        .leaves
        .iter()
        .filter(|leaf| !matches!(leaf.source, PriorSource::Background))
        .any(|leaf| leaf.source.is_defined());
    if !defined {
        diagnostics.warn(name, "generated background without sibling probability maps");
    }
}
