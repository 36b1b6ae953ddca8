//! Hierarchy of tissue classes and superclasses, with their intensity,
//! Markov, registration and shape settings.

pub mod class;
pub mod diagnostics;
pub mod intensity;
pub mod labels;
pub mod markov;
pub mod node;
pub mod registration;
pub mod shape;
pub mod status;
pub mod superclass;
pub mod validation;

pub use class::{GaussianModel, TissueClass};
pub use diagnostics::{Diagnostics, MessageLog};
pub use intensity::log_gaussian_from_intensity;
pub use labels::assign_labels;
pub use markov::{Direction, MarkovTensor};
pub use node::{ChildRegistration, HierarchyNode, NodeKind};
pub use registration::{registration_parameter_sets, RegistrationSettings, RegistrationType};
pub use shape::{LogisticTransfer, PcaShapeModel, PcaShapeModelType};
pub use status::VoxelStatus;
pub use superclass::{StopType, StoppingCriteria, SuperClass};
pub use validation::{update, validate};
