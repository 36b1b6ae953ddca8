use std::sync::Arc;

use emseg_core::interpolation::InterpolationType;
use emseg_core::{ScalarVolume, SegmentationError, Volume};
use emseg_engine::{EmEngine, EngineConfig, HistoryProgress, SegmentationInput};
use emseg_model::{
    MarkovTensor, RegistrationSettings, RegistrationType, StoppingCriteria, SuperClass, TissueClass,
};
use proptest::prelude::*;

fn image(dims: [usize; 3], f: impl FnMut(usize, usize, usize) -> f32) -> Arc<ScalarVolume> {
    Arc::new(ScalarVolume::from(Volume::from_fn(dims, f)))
}

fn class(name: &str, label: i32, intensity: f64) -> TissueClass {
    TissueClass::new(name, label, 1).with_log_gaussian((intensity + 1.0).ln(), 0.1)
}

fn engine() -> EmEngine {
    EmEngine::new(EngineConfig::default().with_threads(3)).unwrap()
}

fn labels_of(volume: &Volume<i32>) -> Vec<i32> {
    let [nx, ny, nz] = volume.dims();
    let mut out = Vec::with_capacity(nx * ny * nz);
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                out.push(volume.get(x, y, z));
            }
        }
    }
    out
}

#[test]
fn two_separated_clusters_split_exactly() {
    let dims = [4, 4, 4];
    let mut root = SuperClass::new("root")
        .with_child(class("dark", 1, 10.0))
        .with_child(class("bright", 2, 200.0))
        .with_stopping(StoppingCriteria::fixed(5));
    let input = SegmentationInput::new(vec![image(dims, |x, _, _| if x < 2 { 10.0 } else { 200.0 })]);

    let result = engine().segment(&mut root, &input).unwrap();
    assert!(result.success, "{}", result.diagnostics.errors.messages());
    for z in 0..4 {
        for y in 0..4 {
            for x in 0..4 {
                let expected = if x < 2 { 1 } else { 2 };
                assert_eq!(result.labels.get(x, y, z), expected, "voxel {:?}", (x, y, z));
            }
        }
    }
    assert_eq!(result.levels.len(), 1);
    assert_eq!(result.levels[0].iterations, 5);
}

#[test]
fn full_foreground_atlas_leaves_no_background() {
    let dims = [4, 4, 2];
    let mut background = class("bg", 1, 50.0);
    background.prob_data_weight = 1.0;
    let foreground = class("fg", 2, 50.0).with_prob_data(image(dims, |_, _, _| 1.0), 1.0);
    let mut root = SuperClass::new("root")
        .with_child(background)
        .with_child(foreground)
        .with_generate_background(true)
        .with_stopping(StoppingCriteria::fixed(3));
    let input = SegmentationInput::new(vec![image(dims, |x, y, _| 40.0 + (x + y) as f32)]);

    let result = engine().segment(&mut root, &input).unwrap();
    assert!(result.success);
    assert!(labels_of(&result.labels).iter().all(|&l| l == 2));
    assert!(!result.diagnostics.warnings.flag(), "{}", result.diagnostics.warnings.messages());
}

fn nested_tree() -> SuperClass {
    let tissue = SuperClass::new("tissue")
        .with_child(class("grey", 2, 50.0))
        .with_child(class("white", 3, 400.0))
        .with_stopping(StoppingCriteria::fixed(4));
    SuperClass::new("root")
        .with_child(class("air", 1, 5.0))
        .with_child(tissue)
        .with_stopping(StoppingCriteria::fixed(4))
}

fn nested_image(dims: [usize; 3]) -> Arc<ScalarVolume> {
    image(dims, |x, y, _| match (x < 2, y < 2) {
        (true, _) => 5.0,
        (false, true) => 50.0,
        (false, false) => 400.0,
    })
}

#[test]
fn recursion_replaces_superclass_labels_with_leaves() {
    let dims = [4, 4, 2];
    let mut root = nested_tree();
    let input = SegmentationInput::new(vec![nested_image(dims)]);
    let result = engine().segment(&mut root, &input).unwrap();

    assert!(result.success);
    let tissue_label = root.child(1).map(|n| n.label()).unwrap();
    assert!(tissue_label > 3);
    for z in 0..2 {
        for y in 0..4 {
            for x in 0..4 {
                let expected = match (x < 2, y < 2) {
                    (true, _) => 1,
                    (false, true) => 2,
                    (false, false) => 3,
                };
                assert_eq!(result.labels.get(x, y, z), expected, "voxel {:?}", (x, y, z));
            }
        }
    }
    let names: Vec<_> = result.levels.iter().map(|l| l.name.as_str()).collect();
    assert_eq!(names, ["1", "1-1"]);
}

#[test]
fn unlabelled_leaf_never_reaches_the_output() {
    let dims = [4, 2, 2];
    let mut root = SuperClass::new("root")
        .with_child(class("ignored", -1, 10.0))
        .with_child(class("kept", 2, 200.0))
        .with_stopping(StoppingCriteria::fixed(2));
    let input = SegmentationInput::new(vec![image(dims, |x, _, _| if x < 2 { 10.0 } else { 200.0 })]);
    let result = engine().segment(&mut root, &input).unwrap();

    let labels = labels_of(&result.labels);
    assert!(labels.iter().all(|&l| l != -1));
    assert_eq!(labels.iter().filter(|&&l| l == 0).count(), 8);
    assert_eq!(labels.iter().filter(|&&l| l == 2).count(), 8);
}

#[test]
fn label_map_measure_settles() {
    let dims = [6, 6, 2];
    let mut root = SuperClass::new("root")
        .with_child(class("dark", 1, 10.0))
        .with_child(class("bright", 2, 200.0))
        .with_markov(MarkovTensor::homogeneous(2, 0.9, 0.1))
        .with_stopping(StoppingCriteria::label_map(0.0, 20));
    let input = SegmentationInput::new(vec![image(dims, |x, y, z| {
        let noise = ((x * 7 + y * 13 + z * 5) % 5) as f32 - 2.0;
        if x < 3 { 10.0 + noise } else { 200.0 + 4.0 * noise }
    })]);

    let history = HistoryProgress::new();
    let mut engine = engine();
    engine.add_callback(Arc::new(history.clone()));
    let result = engine.segment(&mut root, &input).unwrap();

    let measures = history.measures("1");
    assert_eq!(measures.first().copied(), Some(72.0));
    assert_eq!(measures.last().copied(), Some(0.0));
    assert!(measures.windows(2).all(|w| w[1] <= w[0]), "{:?}", measures);
    assert!(result.levels[0].converged);
    assert!(result.levels[0].iterations < 20);
}

#[test]
fn weight_change_criterion_converges() {
    let dims = [4, 4, 2];
    let mut root = SuperClass::new("root")
        .with_child(class("dark", 1, 10.0))
        .with_child(class("bright", 2, 200.0))
        .with_stopping(StoppingCriteria::weights(1.0, 30));
    let input = SegmentationInput::new(vec![image(dims, |x, _, _| if x < 2 { 10.0 } else { 200.0 })]);
    let result = engine().segment(&mut root, &input).unwrap();
    assert!(result.levels[0].converged);
    assert!(result.levels[0].measure <= 1.0);
}

#[test]
fn registration_downgrades_are_warnings() {
    let dims = [4, 4, 2];
    let mut root = SuperClass::new("root")
        .with_child(class("dark", 1, 10.0))
        .with_child(class("bright", 2, 200.0))
        .with_registration(
            RegistrationSettings::new(RegistrationType::GlobalOnly).with_interpolation(InterpolationType::None),
        )
        .with_stopping(StoppingCriteria::fixed(1));
    let input = SegmentationInput::new(vec![image(dims, |x, _, _| if x < 2 { 10.0 } else { 200.0 })]);
    let result = engine().segment(&mut root, &input).unwrap();
    assert!(result.success);
    assert!(result.diagnostics.warnings.messages().contains("interpolation"));
    assert!(!result.diagnostics.errors.flag());
}

#[test]
fn sequential_registration_fails_the_root() {
    let dims = [4, 4, 2];
    let mut root = SuperClass::new("root")
        .with_child(class("dark", 1, 10.0))
        .with_child(class("bright", 2, 200.0))
        .with_registration(RegistrationSettings::new(RegistrationType::Sequential));
    let input = SegmentationInput::new(vec![image(dims, |x, _, _| if x < 2 { 10.0 } else { 200.0 })]);

    let history = HistoryProgress::new();
    let mut engine = engine();
    engine.add_callback(Arc::new(history.clone()));
    let result = engine.segment(&mut root, &input).unwrap();

    assert!(!result.success);
    assert!(labels_of(&result.labels).iter().all(|&l| l == 0));
    assert!(result.diagnostics.errors.messages().contains("sequential"));
    assert!(!result.levels[0].success);
    assert_eq!(history.errors().len(), 1);
}

#[test]
fn failing_subtree_spares_its_siblings() {
    let dims = [6, 4, 1];
    let bad = SuperClass::new("bad")
        .with_child(class("b1", 2, 50.0))
        .with_child(class("b2", 3, 60.0))
        .with_registration(RegistrationSettings::new(RegistrationType::Sequential));
    let good = SuperClass::new("good")
        .with_child(class("g1", 4, 400.0))
        .with_child(class("g2", 5, 1000.0))
        .with_stopping(StoppingCriteria::fixed(3));
    let mut root = SuperClass::new("root")
        .with_child(class("air", 1, 5.0))
        .with_child(bad)
        .with_child(good)
        .with_stopping(StoppingCriteria::fixed(3));
    let input = SegmentationInput::new(vec![image(dims, |x, y, _| match (x < 2, y < 2, x < 4) {
        (true, _, _) => 5.0,
        (false, true, _) => 50.0,
        (false, false, true) => 400.0,
        (false, false, false) => 1000.0,
    })]);

    let result = engine().segment(&mut root, &input).unwrap();
    assert!(!result.success);
    for y in 0..4 {
        for x in 0..6 {
            let expected = match (x < 2, y < 2, x < 4) {
                (true, _, _) => 1,
                (false, true, _) => 0,
                (false, false, true) => 4,
                (false, false, false) => 5,
            };
            assert_eq!(result.labels.get(x, y, 0), expected, "voxel {:?}", (x, y));
        }
    }
    let outcome: Vec<_> = result.levels.iter().map(|l| (l.name.as_str(), l.success)).collect();
    assert_eq!(outcome, [("1", true), ("1-1", false), ("1-2", true)]);
    assert!(result.diagnostics.errors.messages().contains("1-1"));
}

#[test]
fn aligned_atlas_keeps_global_registration_at_identity() {
    let dims = [8, 8, 4];
    let left = image(dims, |x, _, _| if x < 4 { 1.0 } else { 0.0 });
    let right = image(dims, |x, _, _| if x < 4 { 0.0 } else { 1.0 });
    let mut root = SuperClass::new("root")
        .with_child(class("left", 1, 10.0).with_prob_data(left, 1.0))
        .with_child(class("right", 2, 200.0).with_prob_data(right, 1.0))
        .with_registration(RegistrationSettings::new(RegistrationType::GlobalOnly).with_rigid(true))
        .with_stopping(StoppingCriteria::fixed(2));
    let input = SegmentationInput::new(vec![image(dims, |x, _, _| if x < 4 { 10.0 } else { 200.0 })]);

    let result = engine().segment(&mut root, &input).unwrap();
    assert!(result.success, "{}", result.diagnostics.errors.messages());
    let params = root.registration.global_parameters;
    assert!(params[..3].iter().all(|t| t.abs() < 0.5), "{:?}", params);
    assert_eq!(result.labels.get(0, 3, 1), 1);
    assert_eq!(result.labels.get(7, 3, 1), 2);
}

#[test]
fn mixed_scalar_types_are_rejected_before_segmenting() {
    let dims = [4, 4, 2];
    let mut root = SuperClass::new("root")
        .with_child(TissueClass::new("dark", 1, 2).with_log_gaussian(11f64.ln(), 0.1))
        .with_child(TissueClass::new("bright", 2, 2).with_log_gaussian(201f64.ln(), 0.1));
    let bytes = Arc::new(ScalarVolume::from(Volume::from_fn(dims, |x, _, _| if x < 2 { 10u8 } else { 200 })));
    let floats = image(dims, |x, _, _| if x < 2 { 10.0 } else { 200.0 });
    let input = SegmentationInput::new(vec![bytes.clone(), floats]);
    let history = HistoryProgress::new();
    let mut engine = engine();
    engine.add_callback(Arc::new(history.clone()));
    assert!(matches!(
        engine.segment(&mut root, &input),
        Err(SegmentationError::InputMismatch(_))
    ));
    assert!(history.history().is_empty());

    let mut atlas = SuperClass::new("root")
        .with_child(class("dark", 1, 10.0).with_prob_data(bytes, 1.0))
        .with_child(class("bright", 2, 200.0));
    let input = SegmentationInput::new(vec![image(dims, |x, _, _| if x < 2 { 10.0 } else { 200.0 })]);
    let error = engine.segment(&mut atlas, &input).unwrap_err();
    assert!(matches!(error, SegmentationError::InputMismatch(_)));
    assert!(error.to_string().contains("'dark'"), "{}", error);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn output_holds_only_leaf_labels(values in proptest::collection::vec(0.0f32..300.0, 18)) {
        let dims = [3, 3, 2];
        let mut root = nested_tree();
        let input = SegmentationInput::new(vec![image(dims, |x, y, z| values[x + 3 * y + 9 * z])]);
        let result = engine().segment(&mut root, &input).unwrap();
        prop_assert!(result.success);
        for label in labels_of(&result.labels) {
            prop_assert!([1, 2, 3].contains(&label), "label {}", label);
        }
    }
}
