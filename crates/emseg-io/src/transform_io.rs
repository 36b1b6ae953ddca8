//! VTK homogeneous transform files.

use anyhow::{Context, Result};
use emseg_core::transform::{parameters_to_matrix, FULL_PARAMETER_COUNT};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::parameter_io::read_parameter_file;

fn render(parameters: &[f64; FULL_PARAMETER_COUNT]) -> String {
    let matrix = parameters_to_matrix(parameters).to_homogeneous();
    let mut out = String::from("VTK Transform File\nHomogeneous Transform\n");
    for row in 0..3 {
        for col in 0..4 {
            // adding 0.0 drops negative zeros; writing into a String cannot fail
            let _ = write!(out, "{:?} ", matrix[(row, col)] + 0.0);
        }
        out.push('\n');
    }
    out.push_str("0.0000 0.0000 0.0000 1.0000 \n\n");
    out
}

/// Write the forward transform of `parameters` as a 4x4 homogeneous matrix.
pub fn write_homogeneous_transform<P: AsRef<Path>>(
    path: P,
    parameters: &[f64; FULL_PARAMETER_COUNT],
) -> Result<()> {
    fs::write(path.as_ref(), render(parameters)).context("Failed to write transform file")
}

/// Read a parameter file and write it back out as a homogeneous transform.
pub fn convert_parameter_file<P: AsRef<Path>, Q: AsRef<Path>>(source: P, target: Q) -> Result<()> {
    let parameters = read_parameter_file(source)?;
    write_homogeneous_transform(target, &parameters)
}
