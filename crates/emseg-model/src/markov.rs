//! Directional MRF interaction tensors.

use emseg_core::{Result, SegmentationError};
use serde::{Deserialize, Serialize};

/// Face-adjacency directions, in tensor order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// `x - 1`
    West,
    /// `y - 1`
    North,
    /// `z + 1`
    Up,
    /// `x + 1`
    East,
    /// `y + 1`
    South,
    /// `z - 1`
    Down,
}

impl Direction {
    pub const ALL: [Direction; 6] = [
        Direction::West,
        Direction::North,
        Direction::Up,
        Direction::East,
        Direction::South,
        Direction::Down,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Coordinate step towards the neighbour.
    pub fn step(self) -> [i64; 3] {
        match self {
            Direction::West => [-1, 0, 0],
            Direction::North => [0, -1, 0],
            Direction::Up => [0, 0, 1],
            Direction::East => [1, 0, 0],
            Direction::South => [0, 1, 0],
            Direction::Down => [0, 0, -1],
        }
    }
}

/// `6 × n × n` tensor of neighbour compatibilities in `[0, 1]`.
///
/// Entry `(d, i, j)` weighs class `i` at a voxel whose neighbour in
/// direction `d` belongs to class `j`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkovTensor {
    size: usize,
    values: Vec<f64>,
}

impl MarkovTensor {
    /// All-zero tensor for `size` classes.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            values: vec![0.0; 6 * size * size],
        }
    }

    /// Tensor with every entry set to `value`.
    pub fn filled(size: usize, value: f64) -> Self {
        Self {
            size,
            values: vec![value; 6 * size * size],
        }
    }

    /// Tensor favouring equal neighbours: `same` on the diagonal, `other`
    /// elsewhere, in every direction.
    pub fn homogeneous(size: usize, same: f64, other: f64) -> Self {
        let mut tensor = Self::new(size);
        for d in Direction::ALL {
            for i in 0..size {
                for j in 0..size {
                    let v = if i == j { same } else { other };
                    let idx = tensor.index(d, i, j);
                    tensor.values[idx] = v;
                }
            }
        }
        tensor
    }

    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    fn index(&self, direction: Direction, i: usize, j: usize) -> usize {
        (direction.index() * self.size + i) * self.size + j
    }

    #[inline]
    pub fn get(&self, direction: Direction, i: usize, j: usize) -> f64 {
        self.values[self.index(direction, i, j)]
    }

    pub fn set(&mut self, direction: Direction, i: usize, j: usize, value: f64) -> Result<()> {
        if i >= self.size || j >= self.size {
            return Err(SegmentationError::dimension_mismatch(format!(
                "MRF index ({}, {}) outside a {}x{} tensor",
                i, j, self.size, self.size
            )));
        }
        if !(0.0..=1.0).contains(&value) {
            return Err(SegmentationError::structural(format!(
                "MRF value {} outside [0, 1]",
                value
            )));
        }
        let index = self.index(direction, i, j);
        self.values[index] = value;
        Ok(())
    }

    /// Grow or shrink to `size` classes, keeping overlapping entries and
    /// zero-filling new ones.
    pub fn resize(&mut self, size: usize) {
        if size == self.size {
            return;
        }
        let mut resized = MarkovTensor::new(size);
        let keep = self.size.min(size);
        for d in Direction::ALL {
            for i in 0..keep {
                for j in 0..keep {
                    let v = self.get(d, i, j);
                    let index = resized.index(d, i, j);
                    resized.values[index] = v;
                }
            }
        }
        *self = resized;
    }

    /// First entry outside `[0, 1]`, if any.
    pub fn find_out_of_range(&self) -> Option<(Direction, usize, usize, f64)> {
        for d in Direction::ALL {
            for i in 0..self.size {
                for j in 0..self.size {
                    let v = self.get(d, i, j);
                    if !(0.0..=1.0).contains(&v) {
                        return Some((d, i, j, v));
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_order() {
        let indices: Vec<usize> = Direction::ALL.iter().map(|d| d.index()).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(Direction::East.step(), [1, 0, 0]);
    }

    #[test]
    fn test_resize_copies_forward_and_zero_fills() {
        let mut t = MarkovTensor::filled(2, 0.5);
        t.set(Direction::Down, 1, 0, 0.25).unwrap();
        t.resize(3);
        assert_eq!(t.size(), 3);
        assert_eq!(t.get(Direction::Down, 1, 0), 0.25);
        assert_eq!(t.get(Direction::West, 0, 0), 0.5);
        assert_eq!(t.get(Direction::West, 2, 0), 0.0);
        assert_eq!(t.get(Direction::Up, 1, 2), 0.0);
    }

    #[test]
    fn test_set_rejects_out_of_range() {
        let mut t = MarkovTensor::new(2);
        assert!(t.set(Direction::West, 0, 0, 1.5).is_err());
        assert!(t.set(Direction::West, 2, 0, 0.5).is_err());
        assert!(t.find_out_of_range().is_none());
    }

    #[test]
    fn test_homogeneous() {
        let t = MarkovTensor::homogeneous(3, 0.9, 0.1);
        assert_eq!(t.get(Direction::South, 2, 2), 0.9);
        assert_eq!(t.get(Direction::South, 2, 1), 0.1);
    }
}
