//! Reading and writing registration parameter files.

pub mod parameter_io;
pub mod transform_io;

pub use parameter_io::{parse_parameter_line, read_parameter_file, write_parameter_file};
pub use transform_io::{convert_parameter_file, write_homogeneous_transform};
