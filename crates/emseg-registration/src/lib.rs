//! Cost functions and optimizers for atlas registration and shape fitting.

pub mod adapter;
pub mod cost;
pub mod optimizer;
pub mod registration;
pub mod shape;

pub use adapter::OptimizerAdapter;
pub use cost::CostFunction;
pub use optimizer::{CoordinateSearch, DirectionSetOptimizer, OptimizationResult, OptimizerConfig};
pub use registration::{
    RegistrationChild, RegistrationCostFunction, RegistrationLeaf, RegistrationProblem,
    MAX_PENALTY,
};
pub use shape::{ShapeChild, ShapeCostFunction, ShapeLeaf, ShapeProblem};
