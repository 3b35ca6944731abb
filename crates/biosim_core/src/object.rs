//! Object descriptors: the typed metadata record parallel to every arena slot.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::expression::MathExpression;
use crate::relocation::{Relocate, RelocationSet};

/// Position of a descriptor (and its value) in the arena.
///
/// Indices are only valid for the layout they were issued under; every
/// holder must be passed through [`Relocate`] when the arena is resized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectIndex(usize);

impl ObjectIndex {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ObjectIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl Relocate for ObjectIndex {
    fn relocate(&mut self, relocations: &RelocationSet) {
        self.0 = relocations.relocate_index(self.0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Undefined,
    Value,
    Rate,
    ParticleFlux,
    Flux,
    TotalMass,
    DependentMass,
    Propensity,
    Discontinuous,
    DelayValue,
    DelayLag,
    TransitionTime,
    EventTrigger,
    EventDelay,
    EventPriority,
    EventAssignment,
    EventRoot,
    EventRootState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Undefined,
    Species,
    Compartment,
    GlobalQuantity,
    Reaction,
    Moiety,
    Event,
    Delay,
    LocalReactionParameter,
    Analysis,
    Model,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SimulationKind {
    Undefined,
    Fixed,
    EventTarget,
    Time,
    Ode,
    Independent,
    Dependent,
    Assignment,
    Conversion,
}

impl SimulationKind {
    /// Kinds whose values are inputs to the transient network: they are
    /// never recomputed while integrating.
    pub fn is_input(self) -> bool {
        matches!(
            self,
            SimulationKind::Fixed
                | SimulationKind::EventTarget
                | SimulationKind::Time
                | SimulationKind::Ode
                | SimulationKind::Independent
        )
    }

    /// Kinds a user may set directly as an initial value.
    pub fn is_settable(self) -> bool {
        self.is_input() || self == SimulationKind::Dependent
    }
}

/// Model entity a data object belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKey {
    Model,
    Compartment(usize),
    Species(usize),
    GlobalQuantity(usize),
    Reaction(usize),
    LocalParameter { reaction: usize, parameter: usize },
    Moiety(usize),
    Event(usize),
    Analysis(usize),
}

/// Which quantity of an entity a data object exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Quantity {
    Value,
    Concentration,
    Rate,
    ConcentrationRate,
    Flux,
    ParticleFlux,
    Propensity,
    TotalMass,
    DependentMass,
    TransitionTime,
    Trigger,
}

/// Weak back-reference to a value owned by the model adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DataObjectKey {
    pub entity: EntityKey,
    pub quantity: Quantity,
    pub initial: bool,
}

impl DataObjectKey {
    pub fn initial(entity: EntityKey, quantity: Quantity) -> Self {
        Self {
            entity,
            quantity,
            initial: true,
        }
    }

    pub fn transient(entity: EntityKey, quantity: Quantity) -> Self {
        Self {
            entity,
            quantity,
            initial: false,
        }
    }
}

/// Descriptor for one arena slot.
#[derive(Debug, Clone, PartialEq)]
pub struct MathObject {
    pub value_kind: ValueKind,
    pub entity_kind: EntityKind,
    pub simulation_kind: SimulationKind,
    pub is_intensive: bool,
    pub is_initial: bool,
    pub rule: Option<MathExpression>,
    pub data_object: Option<DataObjectKey>,
    /// Extensive partner of an intensive species value and vice versa.
    pub corresponding: Option<ObjectIndex>,
}

impl Default for MathObject {
    fn default() -> Self {
        Self {
            value_kind: ValueKind::Undefined,
            entity_kind: EntityKind::Undefined,
            simulation_kind: SimulationKind::Undefined,
            is_intensive: false,
            is_initial: false,
            rule: None,
            data_object: None,
            corresponding: None,
        }
    }
}

impl MathObject {
    pub fn new(
        value_kind: ValueKind,
        entity_kind: EntityKind,
        simulation_kind: SimulationKind,
        is_initial: bool,
    ) -> Self {
        Self {
            value_kind,
            entity_kind,
            simulation_kind,
            is_initial,
            ..Self::default()
        }
    }

    pub fn intensive(mut self) -> Self {
        self.is_intensive = true;
        self
    }

    pub fn with_data_object(mut self, key: DataObjectKey) -> Self {
        self.data_object = Some(key);
        self
    }

    pub fn has_rule(&self) -> bool {
        self.rule.is_some()
    }

    pub fn prerequisites(&self) -> Vec<ObjectIndex> {
        self.rule
            .as_ref()
            .map(|rule| rule.prerequisites().to_vec())
            .unwrap_or_default()
    }
}

impl Relocate for MathObject {
    fn relocate(&mut self, relocations: &RelocationSet) {
        self.rule.relocate(relocations);
        self.corresponding.relocate(relocations);
    }
}
