//! Registration settings of a superclass.

use emseg_core::interpolation::InterpolationType;
use emseg_core::transform::{ParameterLayout, FULL_PARAMETER_COUNT};
use serde::{Deserialize, Serialize};

use crate::superclass::SuperClass;

/// Registration mode, ordered from "off" to the most elaborate mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum RegistrationType {
    #[default]
    Disabled,
    /// Stored parameters are applied, nothing is estimated.
    ApplyOnly,
    GlobalOnly,
    ClassOnly,
    Simultaneous,
    Sequential,
}

impl RegistrationType {
    /// Whether parameters are estimated in the M-step.
    pub fn estimates(self) -> bool {
        self > RegistrationType::ApplyOnly
    }

    /// Whether class-specific parameter sets take part.
    pub fn is_class_specific(self) -> bool {
        self > RegistrationType::GlobalOnly
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegistrationSettings {
    pub registration_type: RegistrationType,
    pub interpolation: InterpolationType,
    pub two_d: bool,
    pub rigid: bool,
    /// Superclass to global parameters, full 9-entry form.
    pub global_parameters: [f64; FULL_PARAMETER_COUNT],
}

impl Default for RegistrationSettings {
    fn default() -> Self {
        Self {
            registration_type: RegistrationType::Disabled,
            interpolation: InterpolationType::Linear,
            two_d: false,
            rigid: false,
            global_parameters: [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0],
        }
    }
}

impl RegistrationSettings {
    pub fn new(registration_type: RegistrationType) -> Self {
        Self {
            registration_type,
            ..Self::default()
        }
    }

    pub fn with_interpolation(mut self, interpolation: InterpolationType) -> Self {
        self.interpolation = interpolation;
        self
    }

    pub fn with_two_d(mut self, two_d: bool) -> Self {
        self.two_d = two_d;
        self
    }

    pub fn with_rigid(mut self, rigid: bool) -> Self {
        self.rigid = rigid;
        self
    }

    pub fn layout(&self) -> ParameterLayout {
        ParameterLayout::new(self.two_d, self.rigid)
    }
}

/// Number of parameter sets the registration M-step optimises.
///
/// One global set unless the mode is class-only, plus one per child flagged
/// class-specific when the mode goes beyond global-only. The synthetic
/// background child never registers.
pub fn registration_parameter_sets(superclass: &SuperClass) -> usize {
    let kind = superclass.registration.registration_type;
    if !kind.estimates() {
        return 0;
    }
    let mut sets = usize::from(kind != RegistrationType::ClassOnly);
    if kind.is_class_specific() {
        let skip = usize::from(superclass.generate_background);
        sets += superclass
            .children()
            .iter()
            .skip(skip)
            .flatten()
            .filter(|child| child.registration().class_specific)
            .count();
    }
    sets
}
