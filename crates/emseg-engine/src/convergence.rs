//! Stopping rules of the EM loop.

use emseg_model::{StopType, StoppingCriteria, VoxelStatus};

use crate::level::LevelModel;

/// Tracks the quantity a [`StoppingCriteria`] compares between iterations.
#[derive(Debug, Clone)]
pub(crate) struct ConvergenceMonitor {
    criteria: StoppingCriteria,
    previous_labels: Option<Vec<usize>>,
    previous_weights: Option<Vec<Vec<f64>>>,
}

impl ConvergenceMonitor {
    pub fn new(criteria: StoppingCriteria) -> Self {
        Self {
            criteria,
            previous_labels: None,
            previous_weights: None,
        }
    }

    /// At least one iteration always runs.
    pub fn max_iterations(&self) -> usize {
        self.criteria.max_iterations.max(1)
    }

    /// Measure the change since the last call and decide whether to stop.
    ///
    /// `LabelMap` counts ROI voxels whose dominant child changed; `Weights`
    /// is the summed absolute responsibility change in percent of the
    /// previous total. The first call compares against nothing, so it
    /// reports every ROI voxel (or 100 %) as changed.
    pub fn update(&mut self, model: &LevelModel, weights: &[Vec<f64>], status: &[VoxelStatus]) -> (f64, bool) {
        match self.criteria.stop_type {
            StopType::Fixed => (0.0, false),
            StopType::LabelMap => {
                let labels: Vec<usize> = (0..status.len())
                    .map(|i| {
                        if status[i].in_roi() {
                            model.dominant_child(weights, i).0
                        } else {
                            usize::MAX
                        }
                    })
                    .collect();
                let changed = match &self.previous_labels {
                    Some(previous) => labels
                        .iter()
                        .zip(previous)
                        .zip(status)
                        .filter(|((now, before), s)| s.in_roi() && now != before)
                        .count(),
                    None => status.iter().filter(|s| s.in_roi()).count(),
                };
                self.previous_labels = Some(labels);
                let measure = changed as f64;
                (measure, measure <= self.criteria.value)
            }
            StopType::Weights => {
                let measure = match &self.previous_weights {
                    Some(previous) => {
                        let mut change = 0.0;
                        let mut total = 0.0;
                        for (now, before) in weights.iter().zip(previous) {
                            for (n, b) in now.iter().zip(before) {
                                change += (n - b).abs();
                                total += b;
                            }
                        }
                        if total > 0.0 {
                            100.0 * change / total
                        } else {
                            100.0
                        }
                    }
                    None => 100.0,
                };
                self.previous_weights = Some(weights.to_vec());
                (measure, measure <= self.criteria.value)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emseg_model::{RegistrationType, SuperClass, TissueClass};

    fn model() -> LevelModel {
        let head = SuperClass::new("root")
            .with_child(TissueClass::new("a", 1, 1))
            .with_child(TissueClass::new("b", 2, 1));
        LevelModel::build(&head, "1", RegistrationType::Disabled, false, 1.0, [3, 1, 1]).unwrap()
    }

    #[test]
    fn test_fixed_never_stops_early() {
        let mut monitor = ConvergenceMonitor::new(StoppingCriteria::fixed(0));
        assert_eq!(monitor.max_iterations(), 1);
        let weights = vec![vec![1.0; 3], vec![0.0; 3]];
        let status = vec![VoxelStatus::Regular; 3];
        assert!(!monitor.update(&model(), &weights, &status).1);
    }

    #[test]
    fn test_label_map_counts_changes_in_roi() {
        let model = model();
        let mut monitor = ConvergenceMonitor::new(StoppingCriteria::label_map(0.0, 10));
        let status = vec![VoxelStatus::Regular, VoxelStatus::Regular, VoxelStatus::OutsideRoi];
        let first = vec![vec![0.9, 0.2, 0.0], vec![0.1, 0.8, 0.0]];
        assert_eq!(monitor.update(&model, &first, &status), (2.0, false));
        let second = vec![vec![0.9, 0.7, 0.0], vec![0.1, 0.3, 0.0]];
        assert_eq!(monitor.update(&model, &second, &status), (1.0, false));
        assert_eq!(monitor.update(&model, &second, &status), (0.0, true));
    }

    #[test]
    fn test_weight_change_in_percent() {
        let model = model();
        let mut monitor = ConvergenceMonitor::new(StoppingCriteria::weights(5.0, 10));
        let status = vec![VoxelStatus::Regular; 3];
        let first = vec![vec![0.5; 3], vec![0.5; 3]];
        assert_eq!(monitor.update(&model, &first, &status), (100.0, false));
        let second = vec![vec![0.6, 0.5, 0.5], vec![0.4, 0.5, 0.5]];
        let (measure, stop) = monitor.update(&model, &second, &status);
        assert!((measure - 100.0 * 0.2 / 3.0).abs() < 1e-9);
        assert!(!stop);
        let (measure, stop) = monitor.update(&model, &second, &status);
        assert_eq!(measure, 0.0);
        assert!(stop);
    }
}
