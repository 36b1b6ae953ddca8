use emseg_io::{convert_parameter_file, read_parameter_file, write_parameter_file};
use proptest::prelude::*;
use std::fs;
use tempfile::tempdir;

#[test]
fn test_missing_file_is_an_error() {
    let dir = tempdir().unwrap();
    let result = read_parameter_file(dir.path().join("absent.txt"));
    assert!(result.is_err());
}

#[test]
fn test_only_first_line_is_read() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("params.txt");
    fs::write(&path, "0 1 2 3 4 5 1 1 1\n9 9 9\n").unwrap();
    assert_eq!(
        read_parameter_file(&path).unwrap(),
        [0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 1.0, 1.0, 1.0]
    );
}

#[test]
fn test_convert_writes_transform() {
    let dir = tempdir().unwrap();
    let source = dir.path().join("params.txt");
    let target = dir.path().join("transform.tfm");
    write_parameter_file(&source, &[1.0, 2.0, 3.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0]).unwrap();
    convert_parameter_file(&source, &target).unwrap();

    let text = fs::read_to_string(&target).unwrap();
    assert!(text.starts_with("VTK Transform File\nHomogeneous Transform\n"));
    assert_eq!(text.lines().nth(3), Some("0.0 1.0 0.0 2.0 "));
}

proptest! {
    #[test]
    fn parameter_file_round_trip_is_exact(values in prop::array::uniform9(-1.0e6f64..1.0e6)) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("params.txt");
        write_parameter_file(&path, &values).unwrap();
        let back = read_parameter_file(&path).unwrap();
        for (a, b) in values.iter().zip(back.iter()) {
            prop_assert_eq!(a.to_bits(), b.to_bits());
        }
    }
}
