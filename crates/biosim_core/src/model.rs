//! Minimal structural model consumed by the container.
//!
//! The model is plain data: entity lists with infix expressions and the
//! values the container mirrors. Initial values live on the entities;
//! transient values pushed by the container are kept in a keyed store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::object::{DataObjectKey, EntityKey, Quantity};
use crate::traits::DataObjectStore;

/// How an entity's value evolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityStatus {
    Fixed,
    Assignment,
    Ode,
    /// Species only: the rate is determined by reactions.
    Reactions,
}

/// A compartment or global quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelValue {
    pub name: String,
    pub status: EntityStatus,
    pub initial_value: f64,
    /// Assignment expression or rate expression, depending on `status`.
    pub expression: Option<String>,
    pub initial_expression: Option<String>,
}

impl ModelValue {
    pub fn fixed(name: &str, initial_value: f64) -> Self {
        Self {
            name: name.to_string(),
            status: EntityStatus::Fixed,
            initial_value,
            expression: None,
            initial_expression: None,
        }
    }
}

pub type Compartment = ModelValue;
pub type GlobalQuantity = ModelValue;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Species {
    pub name: String,
    pub compartment: usize,
    pub status: EntityStatus,
    pub initial_concentration: f64,
    /// Concentration assignment, or concentration rate for ODE species.
    pub expression: Option<String>,
    /// Initial assignment of the concentration.
    pub initial_expression: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalParameter {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub name: String,
    /// When set, the kinetic law is a concentration rate scaled by this
    /// compartment's volume.
    pub compartment: Option<usize>,
    /// Net stoichiometry per species index.
    pub stoichiometry: Vec<(usize, f64)>,
    pub rate_law: String,
    pub local_parameters: Vec<LocalParameter>,
}

/// A conservation relation `dependent + Σ c·independent = total`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Moiety {
    pub dependent: usize,
    pub independents: Vec<(usize, f64)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventAssignmentDefinition {
    /// Name of the assigned entity.
    pub target: String,
    pub expression: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDefinition {
    pub name: String,
    pub trigger: String,
    pub delay: Option<String>,
    pub priority: Option<String>,
    pub assignments: Vec<EventAssignmentDefinition>,
    pub persistent: bool,
    /// Compute assignment values when triggered, assign after the delay.
    pub delay_assignment: bool,
    pub fire_at_initial_time: bool,
}

impl EventDefinition {
    pub fn new(name: &str, trigger: &str) -> Self {
        Self {
            name: name.to_string(),
            trigger: trigger.to_string(),
            delay: None,
            priority: None,
            assignments: Vec::new(),
            persistent: true,
            delay_assignment: true,
            fire_at_initial_time: false,
        }
    }

    pub fn assign(mut self, target: &str, expression: &str) -> Self {
        self.assignments.push(EventAssignmentDefinition {
            target: target.to_string(),
            expression: expression.to_string(),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub name: String,
    pub initial_time: f64,
    /// Particles per unit amount.
    pub quantity_to_number: f64,
    pub compartments: Vec<Compartment>,
    pub species: Vec<Species>,
    pub global_quantities: Vec<GlobalQuantity>,
    pub reactions: Vec<Reaction>,
    pub moieties: Vec<Moiety>,
    pub events: Vec<EventDefinition>,
    #[serde(skip)]
    values: BTreeMap<DataObjectKey, f64>,
}

impl Model {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            initial_time: 0.0,
            quantity_to_number: 1.0,
            compartments: Vec::new(),
            species: Vec::new(),
            global_quantities: Vec::new(),
            reactions: Vec::new(),
            moieties: Vec::new(),
            events: Vec::new(),
            values: BTreeMap::new(),
        }
    }

    pub fn add_compartment(&mut self, name: &str, volume: f64) -> usize {
        self.compartments.push(ModelValue::fixed(name, volume));
        self.compartments.len() - 1
    }

    pub fn add_species(&mut self, name: &str, compartment: usize, concentration: f64) -> usize {
        self.species.push(Species {
            name: name.to_string(),
            compartment,
            status: EntityStatus::Reactions,
            initial_concentration: concentration,
            expression: None,
            initial_expression: None,
        });
        self.species.len() - 1
    }

    pub fn add_global_quantity(&mut self, name: &str, value: f64) -> usize {
        self.global_quantities.push(ModelValue::fixed(name, value));
        self.global_quantities.len() - 1
    }

    pub fn add_reaction(
        &mut self,
        name: &str,
        stoichiometry: Vec<(usize, f64)>,
        rate_law: &str,
    ) -> usize {
        self.reactions.push(Reaction {
            name: name.to_string(),
            compartment: None,
            stoichiometry,
            rate_law: rate_law.to_string(),
            local_parameters: Vec::new(),
        });
        self.reactions.len() - 1
    }

    pub fn add_event(&mut self, event: EventDefinition) -> usize {
        self.events.push(event);
        self.events.len() - 1
    }

    pub fn species_index(&self, name: &str) -> Option<usize> {
        self.species.iter().position(|s| s.name == name)
    }

    pub fn compartment_index(&self, name: &str) -> Option<usize> {
        self.compartments.iter().position(|c| c.name == name)
    }

    pub fn global_quantity_index(&self, name: &str) -> Option<usize> {
        self.global_quantities.iter().position(|g| g.name == name)
    }

    /// Entity owning `name`; species shadow compartments, which shadow globals.
    pub fn entity_by_name(&self, name: &str) -> Option<EntityKey> {
        self.species_index(name)
            .map(EntityKey::Species)
            .or_else(|| self.compartment_index(name).map(EntityKey::Compartment))
            .or_else(|| self.global_quantity_index(name).map(EntityKey::GlobalQuantity))
    }

    /// Species index of the moiety's dependent species, if any.
    pub fn moiety_of_dependent(&self, species: usize) -> Option<usize> {
        self.moieties.iter().position(|m| m.dependent == species)
    }

    pub fn is_moiety_independent(&self, species: usize) -> bool {
        self.moieties
            .iter()
            .any(|m| m.independents.iter().any(|(s, _)| *s == species))
    }

    fn owns(&self, entity: EntityKey) -> bool {
        match entity {
            EntityKey::Model | EntityKey::Analysis(_) => true,
            EntityKey::Compartment(i) => i < self.compartments.len(),
            EntityKey::Species(i) => i < self.species.len(),
            EntityKey::GlobalQuantity(i) => i < self.global_quantities.len(),
            EntityKey::Reaction(i) => i < self.reactions.len(),
            EntityKey::LocalParameter {
                reaction,
                parameter,
            } => self
                .reactions
                .get(reaction)
                .is_some_and(|r| parameter < r.local_parameters.len()),
            EntityKey::Moiety(i) => i < self.moieties.len(),
            EntityKey::Event(i) => i < self.events.len(),
        }
    }

    fn initial_volume(&self, species: usize) -> Option<f64> {
        let compartment = self.species.get(species)?.compartment;
        self.compartments.get(compartment).map(|c| c.initial_value)
    }
}

impl DataObjectStore for Model {
    fn data_value(&self, key: &DataObjectKey) -> Option<f64> {
        if !key.initial {
            return self.values.get(key).copied();
        }
        match (key.entity, key.quantity) {
            (EntityKey::Model, Quantity::Value) => Some(self.initial_time),
            (EntityKey::Compartment(i), Quantity::Value) => {
                self.compartments.get(i).map(|c| c.initial_value)
            }
            (EntityKey::GlobalQuantity(i), Quantity::Value) => {
                self.global_quantities.get(i).map(|g| g.initial_value)
            }
            (EntityKey::Species(i), Quantity::Concentration) => {
                self.species.get(i).map(|s| s.initial_concentration)
            }
            (EntityKey::Species(i), Quantity::Value) => {
                let concentration = self.species.get(i)?.initial_concentration;
                Some(concentration * self.initial_volume(i)?)
            }
            (
                EntityKey::LocalParameter {
                    reaction,
                    parameter,
                },
                Quantity::Value,
            ) => self
                .reactions
                .get(reaction)?
                .local_parameters
                .get(parameter)
                .map(|p| p.value),
            _ => self.values.get(key).copied(),
        }
    }

    fn set_data_value(&mut self, key: &DataObjectKey, value: f64) -> bool {
        if !self.owns(key.entity) {
            return false;
        }
        if key.initial {
            match (key.entity, key.quantity) {
                (EntityKey::Model, Quantity::Value) => {
                    self.initial_time = value;
                    return true;
                }
                (EntityKey::Compartment(i), Quantity::Value) => {
                    self.compartments[i].initial_value = value;
                    return true;
                }
                (EntityKey::GlobalQuantity(i), Quantity::Value) => {
                    self.global_quantities[i].initial_value = value;
                    return true;
                }
                (EntityKey::Species(i), Quantity::Concentration) => {
                    self.species[i].initial_concentration = value;
                    return true;
                }
                (EntityKey::Species(i), Quantity::Value) => {
                    let Some(volume) = self.initial_volume(i) else {
                        return false;
                    };
                    self.species[i].initial_concentration = value / volume;
                    return true;
                }
                (
                    EntityKey::LocalParameter {
                        reaction,
                        parameter,
                    },
                    Quantity::Value,
                ) => {
                    self.reactions[reaction].local_parameters[parameter].value = value;
                    return true;
                }
                _ => {}
            }
        }
        self.values.insert(*key, value);
        true
    }
}
