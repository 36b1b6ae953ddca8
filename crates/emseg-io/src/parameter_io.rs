//! Plain-text registration parameter files.
//!
//! The first line holds the nine parameters (translation, rotation in
//! degrees, scale) separated by whitespace. Anything after the ninth number
//! that does not parse as a number is treated as a comment.

use anyhow::{bail, Context, Result};
use emseg_core::transform::FULL_PARAMETER_COUNT;
use std::fs;
use std::path::Path;

/// Parse the leading numbers of a parameter line.
///
/// Parsing stops at the first token that is not a number, so trailing
/// comments are allowed. Exactly nine numbers must precede it.
pub fn parse_parameter_line(line: &str) -> Result<[f64; FULL_PARAMETER_COUNT]> {
    let values: Vec<f64> = line
        .split_whitespace()
        .map_while(|token| token.parse::<f64>().ok())
        .collect();
    if values.len() != FULL_PARAMETER_COUNT {
        bail!(
            "parameter file needs {} parameters but has {}",
            FULL_PARAMETER_COUNT,
            values.len()
        );
    }
    let mut out = [0.0; FULL_PARAMETER_COUNT];
    out.copy_from_slice(&values);
    Ok(out)
}

pub fn read_parameter_file<P: AsRef<Path>>(path: P) -> Result<[f64; FULL_PARAMETER_COUNT]> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).context("Failed to read parameter file")?;
    let first = text.lines().next().unwrap_or_default();
    parse_parameter_line(first).context("Malformed parameter file")
}

/// Write the nine parameters on a single line.
///
/// Values are written with their shortest round-trip representation so that
/// reading the file back yields the same bits.
pub fn write_parameter_file<P: AsRef<Path>>(
    path: P,
    parameters: &[f64; FULL_PARAMETER_COUNT],
) -> Result<()> {
    let path = path.as_ref();
    let line = parameters
        .iter()
        .map(|p| format!("{:?}", p))
        .collect::<Vec<_>>()
        .join(" ");
    fs::write(path, format!("{}\n", line)).context("Failed to write parameter file")?;
    tracing::debug!(path = %path.display(), "wrote registration parameters");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_comment_is_ignored() {
        let p = parse_parameter_line("  1 2 3 0 0 90 1 1 1.5 # after global registration").unwrap();
        assert_eq!(p, [1.0, 2.0, 3.0, 0.0, 0.0, 90.0, 1.0, 1.0, 1.5]);
    }

    #[test]
    fn test_wrong_count_is_rejected() {
        assert!(parse_parameter_line("1 2 3 4 5 6 7 8").is_err());
        assert!(parse_parameter_line("1 2 3 4 5 6 7 8 9 10").is_err());
        assert!(parse_parameter_line("").is_err());
        // a comment before the ninth number cuts the line short
        assert!(parse_parameter_line("1 2 3 x 5 6 7 8 9").is_err());
    }
}
