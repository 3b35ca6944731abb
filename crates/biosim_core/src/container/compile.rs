use std::collections::BTreeSet;

use anyhow::Context;
use tracing::{debug, instrument, warn};

use super::{evaluate_sequence, CompileState, MathContainer, ValueGroups};
use crate::arena::{Segment, SegmentSizes, ValueArena};
use crate::config::ContainerSettings;
use crate::delay::{DelayScan, DelayValue, MathDelay};
use crate::discontinuity::DiscontinuityRegistry;
use crate::error::{MathError, Result};
use crate::event::{count_roots, split_roots, EventAssignment, EventKind, MathEvent, RootProcessor};
use crate::expression::{BinaryOp, Expr, Function, MathExpression};
use crate::graph::{ObjectSet, UpdateSequence};
use crate::model::{EntityStatus, Model, ModelValue};
use crate::object::{
    DataObjectKey, EntityKey, EntityKind, MathObject, ObjectIndex, Quantity, SimulationKind,
    ValueKind,
};
use crate::symbols::{to_initial, SymbolTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ValueEntity {
    entity: EntityKey,
    kind: SimulationKind,
}

fn group_rank(kind: SimulationKind) -> usize {
    match kind {
        SimulationKind::Fixed => 0,
        SimulationKind::EventTarget => 1,
        SimulationKind::Time => 2,
        SimulationKind::Ode => 3,
        SimulationKind::Independent => 4,
        SimulationKind::Dependent => 5,
        SimulationKind::Assignment => 6,
        _ => 7,
    }
}

fn entity_kind(entity: EntityKey) -> EntityKind {
    match entity {
        EntityKey::Model => EntityKind::Model,
        EntityKey::Compartment(_) => EntityKind::Compartment,
        EntityKey::Species(_) => EntityKind::Species,
        EntityKey::GlobalQuantity(_) => EntityKind::GlobalQuantity,
        EntityKey::Reaction(_) => EntityKind::Reaction,
        EntityKey::LocalParameter { .. } => EntityKind::LocalReactionParameter,
        EntityKey::Moiety(_) => EntityKind::Moiety,
        EntityKey::Event(_) => EntityKind::Event,
        EntityKey::Analysis(_) => EntityKind::Analysis,
    }
}

fn data(entity: EntityKey, quantity: Quantity, initial: bool) -> Expr {
    Expr::Data(DataObjectKey {
        entity,
        quantity,
        initial,
    })
}

fn mul(left: Expr, right: Expr) -> Expr {
    Expr::binary(BinaryOp::Mul, left, right)
}

fn div(left: Expr, right: Expr) -> Expr {
    Expr::binary(BinaryOp::Div, left, right)
}

fn required<'a>(name: &str, expression: &'a Option<String>) -> Result<&'a str> {
    expression
        .as_deref()
        .ok_or_else(|| MathError::InvalidArgument(format!("'{name}' requires an expression")))
}

/// State of one compile run over a model.
pub(super) struct CompilePass<'m> {
    model: &'m Model,
    symbols: SymbolTable,
    /// Value entities in segment order.
    entities: Vec<ValueEntity>,
    /// Species indices in intensive segment order.
    species_order: Vec<usize>,
    groups: ValueGroups,
    registry: DiscontinuityRegistry,
}

impl<'m> CompilePass<'m> {
    pub(super) fn new(model: &'m Model) -> Result<Self> {
        let symbols = SymbolTable::from_model(model);

        let mut targets = BTreeSet::new();
        for event in &model.events {
            for assignment in &event.assignments {
                let entity =
                    symbols
                        .entity(&assignment.target)
                        .ok_or_else(|| MathError::UnknownSymbol {
                            symbol: assignment.target.clone(),
                            expression: format!("{} := {}", assignment.target, assignment.expression),
                        })?;
                targets.insert(entity);
            }
        }

        let value_kind = |value: &ModelValue, entity: EntityKey| match value.status {
            EntityStatus::Assignment => SimulationKind::Assignment,
            EntityStatus::Ode => SimulationKind::Ode,
            EntityStatus::Fixed | EntityStatus::Reactions if targets.contains(&entity) => {
                SimulationKind::EventTarget
            }
            EntityStatus::Fixed | EntityStatus::Reactions => SimulationKind::Fixed,
        };

        let mut entities = vec![ValueEntity {
            entity: EntityKey::Model,
            kind: SimulationKind::Time,
        }];
        for (i, compartment) in model.compartments.iter().enumerate() {
            let entity = EntityKey::Compartment(i);
            entities.push(ValueEntity {
                entity,
                kind: value_kind(compartment, entity),
            });
        }
        for (i, global) in model.global_quantities.iter().enumerate() {
            let entity = EntityKey::GlobalQuantity(i);
            entities.push(ValueEntity {
                entity,
                kind: value_kind(global, entity),
            });
        }
        for (reaction, definition) in model.reactions.iter().enumerate() {
            for parameter in 0..definition.local_parameters.len() {
                entities.push(ValueEntity {
                    entity: EntityKey::LocalParameter {
                        reaction,
                        parameter,
                    },
                    kind: SimulationKind::Fixed,
                });
            }
        }
        for (i, species) in model.species.iter().enumerate() {
            let entity = EntityKey::Species(i);
            if species.compartment >= model.compartments.len() {
                return Err(MathError::InvalidArgument(format!(
                    "species '{}' lives in unknown compartment {}",
                    species.name, species.compartment
                )));
            }
            let kind = match species.status {
                EntityStatus::Assignment => SimulationKind::Assignment,
                EntityStatus::Ode => SimulationKind::Ode,
                EntityStatus::Reactions if model.moiety_of_dependent(i).is_some() => {
                    SimulationKind::Dependent
                }
                EntityStatus::Reactions => SimulationKind::Independent,
                EntityStatus::Fixed if targets.contains(&entity) => SimulationKind::EventTarget,
                EntityStatus::Fixed => SimulationKind::Fixed,
            };
            entities.push(ValueEntity { entity, kind });
        }
        entities.sort_by_key(|entity| group_rank(entity.kind));

        let mut groups = ValueGroups::default();
        for entity in &entities {
            match entity.kind {
                SimulationKind::Fixed => groups.fixed += 1,
                SimulationKind::EventTarget => groups.event_target += 1,
                SimulationKind::Ode => groups.ode += 1,
                SimulationKind::Independent => groups.independent += 1,
                SimulationKind::Dependent => groups.dependent += 1,
                SimulationKind::Assignment => groups.assignment += 1,
                _ => {}
            }
        }

        let species_order = entities
            .iter()
            .filter_map(|entity| match entity.entity {
                EntityKey::Species(i) => Some(i),
                _ => None,
            })
            .collect();

        Ok(Self {
            model,
            symbols,
            entities,
            species_order,
            groups,
            registry: DiscontinuityRegistry::new(),
        })
    }

    /// Transient expressions integrated continuously, with the reaction
    /// whose local parameters are in scope.
    fn continuous_sources(&self) -> Result<Vec<(&'m str, Option<usize>)>> {
        let model = self.model;
        let mut sources = Vec::new();
        for value in model.compartments.iter().chain(&model.global_quantities) {
            if matches!(value.status, EntityStatus::Assignment | EntityStatus::Ode) {
                sources.push((required(&value.name, &value.expression)?, None));
            }
        }
        for species in &model.species {
            if matches!(species.status, EntityStatus::Assignment | EntityStatus::Ode) {
                sources.push((required(&species.name, &species.expression)?, None));
            }
        }
        for (r, reaction) in model.reactions.iter().enumerate() {
            sources.push((reaction.rate_law.as_str(), Some(r)));
        }
        Ok(sources)
    }

    fn segment_sizes(&self, roots: usize) -> SegmentSizes {
        let model = self.model;
        let mut sizes = SegmentSizes::default();
        let species = model.species.len();
        let reactions = model.reactions.len();
        let moieties = model.moieties.len();
        sizes.set_mirrored(Segment::ExtensiveValues, self.entities.len());
        sizes.set_mirrored(Segment::IntensiveValues, species);
        sizes.set_mirrored(Segment::ExtensiveRates, self.entities.len());
        sizes.set_mirrored(Segment::IntensiveRates, species);
        sizes.set_mirrored(Segment::ParticleFluxes, reactions);
        sizes.set_mirrored(Segment::Fluxes, reactions);
        sizes.set_mirrored(Segment::TotalMasses, moieties);
        sizes.set_mirrored(
            Segment::EventTriggers,
            model.events.len() + self.registry.trigger_count(),
        );
        sizes.set(
            Segment::EventDelays,
            model.events.iter().filter(|e| e.delay.is_some()).count(),
        );
        sizes.set(
            Segment::EventPriorities,
            model.events.iter().filter(|e| e.priority.is_some()).count(),
        );
        let assignments: usize = model.events.iter().map(|e| e.assignments.len()).sum();
        sizes.set(Segment::EventAssignments, assignments + self.registry.len());
        sizes.set(Segment::EventRoots, roots);
        sizes.set(Segment::EventRootStates, roots);
        sizes.set(Segment::Propensities, reactions);
        sizes.set(Segment::DependentMasses, moieties);
        sizes.set(Segment::Discontinuous, self.registry.len());
        sizes.set(Segment::TransitionTimes, species);
        sizes
    }
}

fn check_count(segment: Segment, expected: usize, found: usize) -> Result<()> {
    if expected != found {
        return Err(MathError::MissingObject {
            segment: segment.name(),
            expected,
            found,
        });
    }
    Ok(())
}

impl MathContainer {
    /// Compiles `model` through every pipeline stage.
    ///
    /// On failure the stage's message is added to [`Self::diagnostics`].
    #[instrument(skip_all, fields(model = %model.name))]
    pub fn compile(&mut self, model: &Model) -> anyhow::Result<()> {
        let result = self.run_pipeline(model);
        if let Err(error) = &result {
            warn!("compilation failed: {error:#}");
            self.diagnostics.push(format!("{error:#}"));
        }
        result
    }

    /// Compiles a fresh container for `model`.
    pub fn from_model(model: &Model, settings: ContainerSettings) -> anyhow::Result<Self> {
        let mut container = Self::new(settings)?;
        container.compile(model)?;
        Ok(container)
    }

    /// Resizes to a changed model and compiles it from scratch.
    #[instrument(skip_all, fields(model = %model.name))]
    pub fn reallocate(&mut self, model: &Model) -> anyhow::Result<()> {
        self.reset();
        self.compile(model)
    }

    fn reset(&mut self) {
        self.state = CompileState::Uninitialized;
        self.data_objects.clear();
        self.species_volumes.clear();
        self.initial_graph.clear();
        self.transient_graph.clear();
        self.sequences = Default::default();
        self.sets = Default::default();
        self.events.clear();
        self.delays.clear();
        self.history = nalgebra::DMatrix::zeros(0, 0);
        self.recorder.clear();
        self.queue.clear();
        self.analysis_objects.clear();
        self.next_analysis = 0;
        self.autonomous = false;
    }

    fn run_pipeline(&mut self, model: &Model) -> anyhow::Result<()> {
        let mut pass = CompilePass::new(model).context("reading model structure failed")?;
        self.allocate(&mut pass).context("allocation failed")?;
        self.initialize_objects(&pass)
            .context("initializing objects failed")?;
        self.initialize_events(&pass)
            .context("initializing events failed")?;
        self.compile_objects(&pass)
            .context("compiling expressions failed")?;
        self.create_delays().context("creating delays failed")?;
        self.build_dependency_graphs()
            .context("building dependency graphs failed")?;
        self.build_update_sequences()
            .context("building update sequences failed")?;
        self.fetch_initial_state(model);
        self.synchronize_initial_values(true)
            .context("synchronizing initial values failed")?;
        self.apply_initial_values()
            .context("applying initial values failed")?;
        self.analyze_roots().context("analyzing roots failed")?;
        debug!(
            objects = self.arena.len(),
            events = self.events.len(),
            delays = self.delays.len(),
            autonomous = self.autonomous,
            "compiled model"
        );
        Ok(())
    }

    #[instrument(skip_all)]
    fn allocate(&mut self, pass: &mut CompilePass<'_>) -> Result<()> {
        self.expect_state(CompileState::Uninitialized, "allocate")?;

        for (source, reaction) in pass.continuous_sources()? {
            let expr = pass.symbols.resolve(source, reaction, false)?;
            pass.registry.scan(&expr);
        }

        let mut roots = 0;
        for event in &pass.model.events {
            roots += count_roots(&pass.symbols.resolve(&event.trigger, None, false)?);
        }
        for hidden in pass.registry.triggers() {
            roots += count_roots(&hidden.trigger);
        }

        let sizes = pass.segment_sizes(roots);
        if self.arena.is_empty() {
            self.arena = ValueArena::new(sizes);
        } else {
            self.resize(sizes);
            self.arena.reset_objects();
        }

        self.groups = pass.groups;
        self.symbols = pass.symbols.clone();
        self.quantity_to_number = pass.model.quantity_to_number;
        self.state = CompileState::Allocated;
        debug!(
            slots = self.arena.len(),
            discontinuities = pass.registry.len(),
            hidden_events = pass.registry.trigger_count(),
            roots,
            "allocated arena"
        );
        Ok(())
    }

    fn define(&mut self, index: ObjectIndex, object: MathObject) {
        if let Some(key) = object.data_object {
            self.data_objects.insert(key, index);
        }
        self.arena.set_object(index, object);
    }

    #[instrument(skip_all)]
    fn initialize_objects(&mut self, pass: &CompilePass<'_>) -> Result<()> {
        self.expect_state(CompileState::Allocated, "initialize objects")?;
        let layout = self.layout().clone();
        let model = pass.model;
        let key = |entity, quantity, initial| DataObjectKey {
            entity,
            quantity,
            initial,
        };

        for (position, slot) in pass.entities.iter().enumerate() {
            let kind = entity_kind(slot.entity);
            let (initial_value_kind, initial_conc_kind, transient_value_kind, transient_conc_kind) =
                match slot.entity {
                    EntityKey::Species(s) => {
                        let species = &model.species[s];
                        let assigned = species.status == EntityStatus::Assignment;
                        let initially_assigned = assigned || species.initial_expression.is_some();
                        let (initial_value, initial_conc) = if initially_assigned {
                            (SimulationKind::Conversion, SimulationKind::Assignment)
                        } else {
                            (slot.kind, SimulationKind::Conversion)
                        };
                        let (transient_value, transient_conc) = if assigned {
                            (SimulationKind::Conversion, SimulationKind::Assignment)
                        } else {
                            (slot.kind, SimulationKind::Conversion)
                        };
                        (initial_value, initial_conc, transient_value, transient_conc)
                    }
                    EntityKey::Compartment(i) | EntityKey::GlobalQuantity(i) => {
                        let value = match slot.entity {
                            EntityKey::Compartment(_) => &model.compartments[i],
                            _ => &model.global_quantities[i],
                        };
                        let initial = if value.status == EntityStatus::Assignment
                            || value.initial_expression.is_some()
                        {
                            SimulationKind::Assignment
                        } else {
                            slot.kind
                        };
                        (initial, SimulationKind::Undefined, slot.kind, SimulationKind::Undefined)
                    }
                    _ => (slot.kind, SimulationKind::Undefined, slot.kind, SimulationKind::Undefined),
                };

            let values = [
                (Segment::InitialExtensiveValues, initial_value_kind, true),
                (Segment::ExtensiveValues, transient_value_kind, false),
            ];
            for (segment, simulation_kind, initial) in values {
                self.define(
                    layout.object(segment, position),
                    MathObject::new(ValueKind::Value, kind, simulation_kind, initial)
                        .with_data_object(key(slot.entity, Quantity::Value, initial)),
                );
            }
            for (segment, initial) in [
                (Segment::InitialExtensiveRates, true),
                (Segment::ExtensiveRates, false),
            ] {
                self.define(
                    layout.object(segment, position),
                    MathObject::new(ValueKind::Rate, kind, SimulationKind::Assignment, initial)
                        .with_data_object(key(slot.entity, Quantity::Rate, initial)),
                );
            }

            let EntityKey::Species(s) = slot.entity else {
                continue;
            };
            let Some(intensive) = pass.species_order.iter().position(|i| *i == s) else {
                continue;
            };
            for (value_segment, conc_segment, rate_segment, conc_kind, initial) in [
                (
                    Segment::InitialExtensiveValues,
                    Segment::InitialIntensiveValues,
                    Segment::InitialIntensiveRates,
                    initial_conc_kind,
                    true,
                ),
                (
                    Segment::ExtensiveValues,
                    Segment::IntensiveValues,
                    Segment::IntensiveRates,
                    transient_conc_kind,
                    false,
                ),
            ] {
                let amount = layout.object(value_segment, position);
                let concentration = layout.object(conc_segment, intensive);
                let mut object = MathObject::new(ValueKind::Value, kind, conc_kind, initial)
                    .intensive()
                    .with_data_object(key(slot.entity, Quantity::Concentration, initial));
                object.corresponding = Some(amount);
                self.define(concentration, object);
                if let Some(object) = self.arena.object_mut(amount) {
                    object.corresponding = Some(concentration);
                }
                self.define(
                    layout.object(rate_segment, intensive),
                    MathObject::new(ValueKind::Rate, kind, SimulationKind::Assignment, initial)
                        .intensive()
                        .with_data_object(key(slot.entity, Quantity::ConcentrationRate, initial)),
                );
            }
            self.define(
                layout.object(Segment::TransitionTimes, intensive),
                MathObject::new(
                    ValueKind::TransitionTime,
                    kind,
                    SimulationKind::Assignment,
                    false,
                )
                .with_data_object(key(slot.entity, Quantity::TransitionTime, false)),
            );
        }

        for (s, species) in model.species.iter().enumerate() {
            let amount = self.object_index(&key(EntityKey::Species(s), Quantity::Value, false));
            let volume = self.object_index(&key(
                EntityKey::Compartment(species.compartment),
                Quantity::Value,
                false,
            ));
            if let (Some(amount), Some(volume)) = (amount, volume) {
                self.species_volumes.push((amount, volume));
            }
        }

        for r in 0..model.reactions.len() {
            let entity = EntityKey::Reaction(r);
            for (segment, value_kind, quantity, initial) in [
                (Segment::InitialFluxes, ValueKind::Flux, Quantity::Flux, true),
                (Segment::Fluxes, ValueKind::Flux, Quantity::Flux, false),
                (
                    Segment::InitialParticleFluxes,
                    ValueKind::ParticleFlux,
                    Quantity::ParticleFlux,
                    true,
                ),
                (
                    Segment::ParticleFluxes,
                    ValueKind::ParticleFlux,
                    Quantity::ParticleFlux,
                    false,
                ),
                (
                    Segment::Propensities,
                    ValueKind::Propensity,
                    Quantity::Propensity,
                    false,
                ),
            ] {
                self.define(
                    layout.object(segment, r),
                    MathObject::new(
                        value_kind,
                        EntityKind::Reaction,
                        SimulationKind::Assignment,
                        initial,
                    )
                    .with_data_object(key(entity, quantity, initial)),
                );
            }
        }

        for m in 0..model.moieties.len() {
            let entity = EntityKey::Moiety(m);
            for (segment, value_kind, quantity, simulation_kind, initial) in [
                (
                    Segment::InitialTotalMasses,
                    ValueKind::TotalMass,
                    Quantity::TotalMass,
                    SimulationKind::Assignment,
                    true,
                ),
                (
                    Segment::TotalMasses,
                    ValueKind::TotalMass,
                    Quantity::TotalMass,
                    SimulationKind::Fixed,
                    false,
                ),
                (
                    Segment::DependentMasses,
                    ValueKind::DependentMass,
                    Quantity::DependentMass,
                    SimulationKind::Assignment,
                    false,
                ),
            ] {
                self.define(
                    layout.object(segment, m),
                    MathObject::new(value_kind, EntityKind::Moiety, simulation_kind, initial)
                        .with_data_object(key(entity, quantity, initial)),
                );
            }
        }

        for index in self.arena.segment_indices(Segment::Discontinuous).collect::<Vec<_>>() {
            self.define(
                index,
                MathObject::new(
                    ValueKind::Discontinuous,
                    EntityKind::Model,
                    SimulationKind::EventTarget,
                    false,
                ),
            );
        }

        self.state = CompileState::ObjectsInitialized;
        Ok(())
    }

    #[instrument(skip_all)]
    fn initialize_events(&mut self, pass: &CompilePass<'_>) -> Result<()> {
        self.expect_state(CompileState::ObjectsInitialized, "initialize events")?;
        let layout = self.layout().clone();
        let event_object = |value_kind, simulation_kind, initial| {
            MathObject::new(value_kind, EntityKind::Event, simulation_kind, initial)
        };
        let mut delays = 0;
        let mut priorities = 0;
        let mut assignments = 0;

        for (e, definition) in pass.model.events.iter().enumerate() {
            let trigger = layout.object(Segment::EventTriggers, e);
            let initial_trigger = layout.object(Segment::InitialEventTriggers, e);
            self.define(
                trigger,
                event_object(ValueKind::EventTrigger, SimulationKind::Assignment, false)
                    .with_data_object(DataObjectKey::transient(EntityKey::Event(e), Quantity::Trigger)),
            );
            self.define(
                initial_trigger,
                event_object(ValueKind::EventTrigger, SimulationKind::Assignment, true)
                    .with_data_object(DataObjectKey::initial(EntityKey::Event(e), Quantity::Trigger)),
            );

            let mut event = MathEvent::new(EventKind::Model(e), trigger, initial_trigger);
            event.persistent = definition.persistent;
            event.delay_assignment = definition.delay_assignment;
            event.fire_at_initial_time = definition.fire_at_initial_time;

            if definition.delay.is_some() {
                let index = layout.object(Segment::EventDelays, delays);
                delays += 1;
                self.define(
                    index,
                    event_object(ValueKind::EventDelay, SimulationKind::Assignment, false),
                );
                event.delay = Some(index);
            }
            if definition.priority.is_some() {
                let index = layout.object(Segment::EventPriorities, priorities);
                priorities += 1;
                self.define(
                    index,
                    event_object(ValueKind::EventPriority, SimulationKind::Assignment, false),
                );
                event.priority = Some(index);
            }
            for assignment in &definition.assignments {
                let key = pass
                    .symbols
                    .entity(&assignment.target)
                    .map(|entity| DataObjectKey::transient(entity, Quantity::Value));
                let target = key
                    .and_then(|key| self.object_index(&key))
                    .ok_or_else(|| MathError::UnknownSymbol {
                        symbol: assignment.target.clone(),
                        expression: format!("{} := {}", assignment.target, assignment.expression),
                    })?;
                let value = layout.object(Segment::EventAssignments, assignments);
                assignments += 1;
                self.define(
                    value,
                    event_object(ValueKind::EventAssignment, SimulationKind::Assignment, false),
                );
                event.assignments.push(EventAssignment { target, value });
            }
            self.events.push(event);
        }

        let offset = pass.model.events.len();
        for (h, hidden) in pass.registry.triggers().enumerate() {
            let trigger = layout.object(Segment::EventTriggers, offset + h);
            let initial_trigger = layout.object(Segment::InitialEventTriggers, offset + h);
            self.define(
                trigger,
                event_object(ValueKind::EventTrigger, SimulationKind::Assignment, false),
            );
            self.define(
                initial_trigger,
                event_object(ValueKind::EventTrigger, SimulationKind::Assignment, true),
            );
            let mut event = MathEvent::new(EventKind::Discontinuity, trigger, initial_trigger);
            for &d in &hidden.discontinuities {
                let value = layout.object(Segment::EventAssignments, assignments);
                assignments += 1;
                self.define(
                    value,
                    event_object(ValueKind::EventAssignment, SimulationKind::Assignment, false),
                );
                event.assignments.push(EventAssignment {
                    target: layout.object(Segment::Discontinuous, d),
                    value,
                });
            }
            self.events.push(event);
        }

        check_count(Segment::EventDelays, layout.size(Segment::EventDelays), delays)?;
        check_count(
            Segment::EventPriorities,
            layout.size(Segment::EventPriorities),
            priorities,
        )?;
        check_count(
            Segment::EventAssignments,
            layout.size(Segment::EventAssignments),
            assignments,
        )?;

        self.define_root_slots(0..layout.size(Segment::EventRoots));
        self.state = CompileState::EventsInitialized;
        Ok(())
    }

    fn define_root_slots(&mut self, offsets: std::ops::Range<usize>) {
        let layout = self.layout().clone();
        for offset in offsets {
            self.define(
                layout.object(Segment::EventRoots, offset),
                MathObject::new(
                    ValueKind::EventRoot,
                    EntityKind::Event,
                    SimulationKind::Assignment,
                    false,
                ),
            );
            self.define(
                layout.object(Segment::EventRootStates, offset),
                MathObject::new(
                    ValueKind::EventRootState,
                    EntityKind::Event,
                    SimulationKind::EventTarget,
                    false,
                ),
            );
        }
    }

    /// Binds every resolved name in `expr` to its object and compiles it.
    fn bind(&self, mut expr: Expr) -> Result<MathExpression> {
        let mut missing = None;
        expr.rewrite_post_order(&mut |node| {
            if let Expr::Data(key) = node {
                match self.data_objects.get(key) {
                    Some(index) => *node = Expr::Object(*index),
                    None => {
                        missing.get_or_insert(*key);
                    }
                }
            }
        });
        if let Some(key) = missing {
            return Err(MathError::UnknownSymbol {
                symbol: format!("{:?}.{:?}", key.entity, key.quantity),
                expression: expr.to_string(),
            });
        }
        MathExpression::new(expr)
    }

    fn set_rule(&mut self, index: ObjectIndex, expr: Expr) -> Result<()> {
        let rule = self.bind(expr)?;
        if let Some(object) = self.arena.object_mut(index) {
            object.rule = Some(rule);
        }
        Ok(())
    }

    /// Resolves a transient expression and swaps its discontinuities for
    /// their objects.
    fn continuous(
        &self,
        pass: &CompilePass<'_>,
        source: &str,
        reaction: Option<usize>,
    ) -> Result<Expr> {
        let mut expr = pass.symbols.resolve(source, reaction, false)?;
        let start = self.layout().start(Segment::Discontinuous);
        pass.registry
            .replace(&mut expr, &|d| ObjectIndex::new(start + d))?;
        Ok(expr)
    }

    /// Resolves `source` in the initial network, or transiently with
    /// discontinuities replaced.
    fn network_expression(
        &self,
        pass: &CompilePass<'_>,
        source: &str,
        reaction: Option<usize>,
        initial: bool,
    ) -> Result<Expr> {
        if initial {
            pass.symbols.resolve(source, reaction, true)
        } else {
            self.continuous(pass, source, reaction)
        }
    }

    #[instrument(skip_all)]
    fn compile_objects(&mut self, pass: &CompilePass<'_>) -> Result<()> {
        self.expect_state(CompileState::EventsInitialized, "compile")?;
        let layout = self.layout().clone();
        let model = pass.model;

        for (position, slot) in pass.entities.iter().enumerate() {
            self.compile_value_entity(pass, position, *slot)?;
        }

        for (r, reaction) in model.reactions.iter().enumerate() {
            let entity = EntityKey::Reaction(r);
            for (flux, particle_flux, initial) in [
                (Segment::InitialFluxes, Segment::InitialParticleFluxes, true),
                (Segment::Fluxes, Segment::ParticleFluxes, false),
            ] {
                let law = self.network_expression(pass, &reaction.rate_law, Some(r), initial)?;
                let rule = match reaction.compartment {
                    Some(c) => mul(law, data(EntityKey::Compartment(c), Quantity::Value, initial)),
                    None => law,
                };
                self.set_rule(layout.object(flux, r), rule)?;
                self.set_rule(
                    layout.object(particle_flux, r),
                    mul(
                        data(entity, Quantity::Flux, initial),
                        Expr::Number(self.quantity_to_number),
                    ),
                )?;
            }
            let particle_flux = data(entity, Quantity::ParticleFlux, false);
            self.set_rule(
                layout.object(Segment::Propensities, r),
                div(
                    Expr::binary(
                        BinaryOp::Add,
                        particle_flux.clone(),
                        Expr::call(Function::Abs, particle_flux),
                    ),
                    Expr::Number(2.0),
                ),
            )?;
        }

        let amount = |s, initial| data(EntityKey::Species(s), Quantity::Value, initial);
        for (m, moiety) in model.moieties.iter().enumerate() {
            let weighted = |initial| {
                moiety
                    .independents
                    .iter()
                    .map(move |(s, coefficient)| mul(Expr::Number(*coefficient), amount(*s, initial)))
            };
            let total = Expr::sum(std::iter::once(amount(moiety.dependent, true)).chain(weighted(true)));
            self.set_rule(layout.object(Segment::InitialTotalMasses, m), total)?;
            let dependent = Expr::binary(
                BinaryOp::Sub,
                data(EntityKey::Moiety(m), Quantity::TotalMass, false),
                Expr::sum(weighted(false)),
            );
            self.set_rule(layout.object(Segment::DependentMasses, m), dependent)?;
        }

        for (position, &s) in pass.species_order.iter().enumerate() {
            let consumption: Vec<Expr> = model
                .reactions
                .iter()
                .enumerate()
                .flat_map(|(r, reaction)| {
                    reaction
                        .stoichiometry
                        .iter()
                        .filter(move |(species, coefficient)| *species == s && *coefficient < 0.0)
                        .map(move |(_, coefficient)| {
                            mul(
                                Expr::Number(-coefficient),
                                data(EntityKey::Reaction(r), Quantity::Flux, false),
                            )
                        })
                })
                .collect();
            let rule = if consumption.is_empty() {
                Expr::Number(f64::INFINITY)
            } else {
                div(amount(s, false), Expr::sum(consumption))
            };
            self.set_rule(layout.object(Segment::TransitionTimes, position), rule)?;
        }

        let discontinuities: Vec<Expr> = pass
            .registry
            .discontinuities()
            .map(|d| d.value.clone())
            .collect();
        for (d, value) in discontinuities.into_iter().enumerate() {
            self.set_rule(layout.object(Segment::Discontinuous, d), value)?;
        }

        self.compile_events(pass)?;
        self.state = CompileState::Compiled;
        Ok(())
    }

    fn compile_value_entity(
        &mut self,
        pass: &CompilePass<'_>,
        position: usize,
        slot: ValueEntity,
    ) -> Result<()> {
        let layout = self.layout().clone();
        let model = pass.model;
        let value_object = |initial| {
            let segment = if initial {
                Segment::InitialExtensiveValues
            } else {
                Segment::ExtensiveValues
            };
            layout.object(segment, position)
        };
        let rate_object = |initial| {
            let segment = if initial {
                Segment::InitialExtensiveRates
            } else {
                Segment::ExtensiveRates
            };
            layout.object(segment, position)
        };

        match slot.entity {
            EntityKey::Model => {
                for initial in [true, false] {
                    self.set_rule(rate_object(initial), Expr::Number(1.0))?;
                }
            }
            EntityKey::LocalParameter { .. } => {
                for initial in [true, false] {
                    self.set_rule(rate_object(initial), Expr::Number(0.0))?;
                }
            }
            EntityKey::Compartment(i) | EntityKey::GlobalQuantity(i) => {
                let value = match slot.entity {
                    EntityKey::Compartment(_) => &model.compartments[i],
                    _ => &model.global_quantities[i],
                };
                let initial_source = match value.status {
                    EntityStatus::Assignment => Some(required(&value.name, &value.expression)?),
                    _ => value.initial_expression.as_deref(),
                };
                if let Some(source) = initial_source {
                    let rule = pass.symbols.resolve(source, None, true)?;
                    self.set_rule(value_object(true), rule)?;
                }
                if value.status == EntityStatus::Assignment {
                    let rule = self.continuous(pass, required(&value.name, &value.expression)?, None)?;
                    self.set_rule(value_object(false), rule)?;
                }
                for initial in [true, false] {
                    let rate = match value.status {
                        EntityStatus::Ode => Some(self.network_expression(
                            pass,
                            required(&value.name, &value.expression)?,
                            None,
                            initial,
                        )?),
                        EntityStatus::Fixed | EntityStatus::Reactions => Some(Expr::Number(0.0)),
                        EntityStatus::Assignment => None,
                    };
                    if let Some(rate) = rate {
                        self.set_rule(rate_object(initial), rate)?;
                    }
                }
            }
            EntityKey::Species(s) => self.compile_species(pass, s, slot.kind, position)?,
            _ => {}
        }
        Ok(())
    }

    fn compile_species(
        &mut self,
        pass: &CompilePass<'_>,
        s: usize,
        kind: SimulationKind,
        position: usize,
    ) -> Result<()> {
        let layout = self.layout().clone();
        let model = pass.model;
        let species = &model.species[s];
        let entity = EntityKey::Species(s);
        let volume = |initial| data(EntityKey::Compartment(species.compartment), Quantity::Value, initial);
        let amount = |initial| data(entity, Quantity::Value, initial);
        let concentration = |initial| data(entity, Quantity::Concentration, initial);
        let lookup = |quantity, initial| {
            self.object_index(&DataObjectKey {
                entity,
                quantity,
                initial,
            })
            .ok_or(MathError::MissingObject {
                segment: Segment::ExtensiveValues.name(),
                expected: position + 1,
                found: position,
            })
        };
        let initial_amount = lookup(Quantity::Value, true)?;
        let initial_concentration = lookup(Quantity::Concentration, true)?;
        let transient_amount = lookup(Quantity::Value, false)?;
        let transient_concentration = lookup(Quantity::Concentration, false)?;
        let concentration_rates = [
            lookup(Quantity::ConcentrationRate, true)?,
            lookup(Quantity::ConcentrationRate, false)?,
        ];
        let assigned = species.status == EntityStatus::Assignment;

        let initial_source = if assigned {
            Some(required(&species.name, &species.expression)?)
        } else {
            species.initial_expression.as_deref()
        };
        let initial_rule = match initial_source {
            Some(source) => pass.symbols.resolve(source, None, true)?,
            None => div(amount(true), volume(true)),
        };
        self.set_rule(initial_concentration, initial_rule)?;
        self.set_rule(initial_amount, mul(concentration(true), volume(true)))?;

        if assigned {
            let rule = self.continuous(pass, required(&species.name, &species.expression)?, None)?;
            self.set_rule(transient_concentration, rule)?;
            self.set_rule(transient_amount, mul(concentration(false), volume(false)))?;
        } else {
            self.set_rule(transient_concentration, div(amount(false), volume(false)))?;
            if let (SimulationKind::Dependent, Some(m)) = (kind, model.moiety_of_dependent(s)) {
                self.set_rule(
                    transient_amount,
                    data(EntityKey::Moiety(m), Quantity::DependentMass, false),
                )?;
            }
        }

        for (initial, concentration_rate) in [true, false].into_iter().zip(concentration_rates) {
            let rate = match kind {
                SimulationKind::Ode => {
                    let source = required(&species.name, &species.expression)?;
                    Some(mul(
                        self.network_expression(pass, source, None, initial)?,
                        volume(initial),
                    ))
                }
                SimulationKind::Independent | SimulationKind::Dependent => {
                    let terms = model.reactions.iter().enumerate().flat_map(|(r, reaction)| {
                        reaction
                            .stoichiometry
                            .iter()
                            .filter(|(species, coefficient)| *species == s && *coefficient != 0.0)
                            .map(move |(_, coefficient)| {
                                mul(
                                    Expr::Number(*coefficient),
                                    data(EntityKey::Reaction(r), Quantity::Flux, initial),
                                )
                            })
                    });
                    Some(Expr::sum(terms))
                }
                SimulationKind::Fixed | SimulationKind::EventTarget => Some(Expr::Number(0.0)),
                _ => None,
            };
            let Some(rate) = rate else {
                continue;
            };
            let rate_segment = if initial {
                Segment::InitialExtensiveRates
            } else {
                Segment::ExtensiveRates
            };
            self.set_rule(layout.object(rate_segment, position), rate)?;
            self.set_rule(
                concentration_rate,
                div(data(entity, Quantity::Rate, initial), volume(initial)),
            )?;
        }
        Ok(())
    }

    fn compile_events(&mut self, pass: &CompilePass<'_>) -> Result<()> {
        let model = pass.model;
        let hidden: Vec<_> = pass.registry.triggers().cloned().collect();
        let discontinuities: Vec<Expr> = pass
            .registry
            .discontinuities()
            .map(|d| d.value.clone())
            .collect();
        let mut next_root = 0;

        for e in 0..self.events.len() {
            match self.events[e].kind {
                EventKind::Model(i) => {
                    let definition = &model.events[i];
                    let trigger = pass.symbols.resolve(&definition.trigger, None, false)?;
                    let initial = pass.symbols.resolve(&definition.trigger, None, true)?;
                    self.compile_trigger(e, trigger, initial, &mut next_root)?;

                    if let (Some(index), Some(source)) = (self.events[e].delay, &definition.delay) {
                        let rule = pass.symbols.resolve(source, None, false)?;
                        self.set_rule(index, rule)?;
                    }
                    if let (Some(index), Some(source)) =
                        (self.events[e].priority, &definition.priority)
                    {
                        let rule = pass.symbols.resolve(source, None, false)?;
                        self.set_rule(index, rule)?;
                    }
                    let values: Vec<ObjectIndex> =
                        self.events[e].assignments.iter().map(|a| a.value).collect();
                    for (value, assignment) in values.into_iter().zip(&definition.assignments) {
                        let mut rule = pass.symbols.resolve(&assignment.expression, None, false)?;
                        if let Some(EntityKey::Species(s)) = pass.symbols.entity(&assignment.target) {
                            let compartment = EntityKey::Compartment(model.species[s].compartment);
                            rule = mul(rule, data(compartment, Quantity::Value, false));
                        }
                        self.set_rule(value, rule)?;
                    }
                }
                EventKind::Discontinuity => {
                    let h = e - model.events.len();
                    let Some(hidden) = hidden.get(h) else {
                        return Err(MathError::MissingObject {
                            segment: Segment::EventTriggers.name(),
                            expected: h + 1,
                            found: hidden.len(),
                        });
                    };
                    let trigger = hidden.trigger.clone();
                    let mut initial = trigger.clone();
                    to_initial(&mut initial);
                    self.compile_trigger(e, trigger, initial, &mut next_root)?;

                    let values: Vec<ObjectIndex> =
                        self.events[e].assignments.iter().map(|a| a.value).collect();
                    for (value, d) in values.into_iter().zip(&hidden.discontinuities) {
                        let rule = discontinuities.get(*d).cloned().ok_or_else(|| {
                            MathError::MalformedDiscontinuity {
                                infix: hidden.trigger.to_string(),
                                reason: format!("no discontinuity at position {d}"),
                            }
                        })?;
                        self.set_rule(value, rule)?;
                    }
                }
                EventKind::Analysis(_) => {}
            }
        }

        check_count(
            Segment::EventRoots,
            self.layout().size(Segment::EventRoots),
            next_root,
        )
    }

    /// Splits `trigger` into root functions starting at root slot
    /// `next_root` and compiles the event's trigger objects.
    fn compile_trigger(
        &mut self,
        event: usize,
        mut trigger: Expr,
        initial: Expr,
        next_root: &mut usize,
    ) -> Result<()> {
        let layout = self.layout().clone();
        let available = layout.size(Segment::EventRoots);
        let mut functions = Vec::new();
        let mut roots = Vec::new();
        split_roots(&mut trigger, &mut |function, is_equality| {
            let root = layout.object(Segment::EventRoots, *next_root);
            let state = layout.object(Segment::EventRootStates, *next_root);
            *next_root += 1;
            functions.push((root, function));
            roots.push(RootProcessor::new(root, state, is_equality));
            state
        });
        if *next_root > available {
            return Err(MathError::MissingObject {
                segment: Segment::EventRoots.name(),
                expected: *next_root,
                found: available,
            });
        }
        for (root, function) in functions {
            self.set_rule(root, function)?;
        }
        let (trigger_object, initial_object) = {
            let event = &self.events[event];
            (event.trigger, event.initial_trigger)
        };
        self.set_rule(trigger_object, trigger)?;
        self.set_rule(initial_object, initial)?;
        self.events[event].roots = roots;
        Ok(())
    }

    #[instrument(skip_all)]
    fn create_delays(&mut self) -> Result<()> {
        self.expect_state(CompileState::Compiled, "create delays")?;
        let first = self.scan_delays()?;
        if first.is_empty() {
            return Ok(());
        }
        let mut sizes = self.layout().sizes();
        sizes.set(Segment::DelayLags, first.lag_count());
        sizes.set(Segment::DelayValues, first.value_count());
        self.resize(sizes);

        // Relocation renumbers the objects inside delay arguments, so their
        // infix keys have to be collected again.
        let scan = self.scan_delays()?;
        let layout = self.layout().clone();
        let mut flat = 0;
        for (l, group) in scan.groups().enumerate() {
            let lag = layout.object(Segment::DelayLags, l);
            let mut object =
                MathObject::new(ValueKind::DelayLag, EntityKind::Delay, SimulationKind::Assignment, false);
            object.rule = Some(MathExpression::new(group.lag.clone())?);
            self.arena.set_object(lag, object);

            let mut delay = MathDelay::new(lag);
            for value in group.values.values() {
                let object = layout.object(Segment::DelayValues, flat);
                flat += 1;
                self.arena.set_object(
                    object,
                    MathObject::new(
                        ValueKind::DelayValue,
                        EntityKind::Delay,
                        SimulationKind::EventTarget,
                        false,
                    ),
                );
                delay.values.push(DelayValue {
                    object,
                    expression: MathExpression::new(value.clone())?,
                });
            }
            self.delays.push(delay);
        }

        let value_start = layout.start(Segment::DelayValues);
        let indices: Vec<ObjectIndex> = self.arena.indices().collect();
        for index in indices {
            let Some(mut root) = self
                .arena
                .object(index)
                .filter(|object| !object.is_initial)
                .and_then(|object| object.rule.as_ref())
                .filter(|rule| rule.root().contains_delay())
                .map(|rule| rule.root().clone())
            else {
                continue;
            };
            scan.replace(&mut root, &|p| ObjectIndex::new(value_start + p))?;
            if let Some(rule) = self.arena.object_mut(index).and_then(|o| o.rule.as_mut()) {
                rule.replace_root(root)?;
            }
        }

        debug!(
            lags = scan.lag_count(),
            values = scan.value_count(),
            "created delays"
        );
        Ok(())
    }

    fn scan_delays(&self) -> Result<DelayScan> {
        let mut scan = DelayScan::new();
        for object in self.arena.objects() {
            if object.is_initial {
                continue;
            }
            if let Some(rule) = &object.rule {
                scan.scan(rule.root())?;
            }
        }
        Ok(scan)
    }

    #[instrument(skip_all)]
    fn build_dependency_graphs(&mut self) -> Result<()> {
        self.expect_state(CompileState::Compiled, "build dependency graphs")?;
        self.initial_graph.clear();
        self.transient_graph.clear();
        let indices: Vec<ObjectIndex> = self.arena.indices().collect();
        for index in indices {
            self.add_to_graph(index);
        }
        self.state = CompileState::DependencyGraphsBuilt;
        Ok(())
    }

    fn add_to_graph(&mut self, index: ObjectIndex) {
        let Some(object) = self.arena.object(index) else {
            return;
        };
        if object.value_kind == ValueKind::Undefined {
            return;
        }
        let graph = if object.is_initial {
            &mut self.initial_graph
        } else {
            &mut self.transient_graph
        };
        graph.add_object(index, &object.prerequisites(), object.has_rule());
    }

    #[instrument(skip_all)]
    fn build_update_sequences(&mut self) -> Result<()> {
        self.expect_state(CompileState::DependencyGraphsBuilt, "build update sequences")?;
        self.build_sequences()?;
        self.state = CompileState::UpdateSequencesBuilt;
        Ok(())
    }

    fn collect(&self, filter: impl Fn(&MathObject) -> bool) -> ObjectSet {
        self.arena
            .objects()
            .iter()
            .enumerate()
            .filter(|(_, object)| object.value_kind != ValueKind::Undefined && filter(object))
            .map(|(i, _)| ObjectIndex::new(i))
            .collect()
    }

    /// Derives every cached object set and update sequence from the graphs.
    fn build_sequences(&mut self) -> Result<()> {
        let layout = self.layout().clone();
        let is_species_amount = |object: &MathObject| {
            object.entity_kind == EntityKind::Species
                && object.value_kind == ValueKind::Value
                && !object.is_intensive
        };

        let dependent_amounts = self.collect(|o| {
            !o.is_initial && is_species_amount(o) && o.simulation_kind == SimulationKind::Dependent
        });
        let inputs = self.collect(|o| !o.is_initial && o.simulation_kind.is_input());
        let base_full: ObjectSet = inputs.union(&dependent_amounts).copied().collect();
        let base_reduced = inputs;

        let roots: ObjectSet = self
            .events
            .iter()
            .flat_map(|event| event.roots.iter().map(|root| root.root))
            .collect();
        let rate_start = layout.start(Segment::ExtensiveRates) + self.groups.state_offset() + 1;
        let state_rates = |reduced: bool| -> ObjectSet {
            (rate_start..rate_start + self.groups.state_len(reduced) - 1)
                .map(ObjectIndex::new)
                .collect()
        };
        let required_full: ObjectSet = state_rates(false).union(&roots).copied().collect();
        let mut required_reduced: ObjectSet = state_rates(true).union(&roots).copied().collect();
        required_reduced.extend(dependent_amounts.iter().copied());

        let graph = &self.transient_graph;
        let none = ObjectSet::new();
        let transient_constants: ObjectSet = graph.constants().into_iter().collect();
        let initial_constants: ObjectSet = self.initial_graph.constants().into_iter().collect();
        let with_rules = self.collect(|o| !o.is_initial && o.has_rule());
        let initial_with_rules = self.collect(|o| o.is_initial && o.has_rule());

        let simulate_full = graph.update_sequence(&base_full, &required_full, &none)?;
        let simulate_reduced = graph.update_sequence(&base_reduced, &required_reduced, &none)?;
        let time: ObjectSet = [self.time_object()].into_iter().collect();
        let autonomous = graph.update_sequence(&time, &required_full, &none)?.is_empty();

        let mut apply_changed =
            self.collect(|o| !o.is_initial && !o.has_rule() && o.simulation_kind.is_settable());
        apply_changed.extend(dependent_amounts.iter().copied());
        apply_changed.extend(transient_constants.iter().copied());
        let apply_requested: ObjectSet = with_rules.difference(&apply_changed).copied().collect();
        let apply_initial = graph.update_sequence(&apply_changed, &apply_requested, &none)?;

        let initial_inputs =
            self.collect(|o| o.is_initial && !o.has_rule() && o.simulation_kind.is_settable());
        let mut extensive_changed = initial_inputs.clone();
        extensive_changed.extend(self.collect(|o| {
            o.is_initial && is_species_amount(o) && o.simulation_kind.is_settable()
        }));
        extensive_changed.extend(initial_constants.iter().copied());
        let mut intensive_changed = initial_inputs;
        intensive_changed.extend(self.collect(|o| {
            o.is_initial
                && o.entity_kind == EntityKind::Species
                && o.is_intensive
                && o.value_kind == ValueKind::Value
                && o.simulation_kind == SimulationKind::Conversion
        }));
        intensive_changed.extend(initial_constants.iter().copied());
        let sync_initial_extensive =
            self.initial_graph
                .update_sequence(&extensive_changed, &initial_with_rules, &none)?;
        let sync_initial_intensive =
            self.initial_graph
                .update_sequence(&intensive_changed, &initial_with_rules, &none)?;

        let priorities: ObjectSet = self.events.iter().filter_map(|e| e.priority).collect();
        let triggers: ObjectSet = self.events.iter().map(|e| e.trigger).collect();
        let priority = graph.update_sequence(&base_full, &priorities, &none)?;
        let trigger = graph.update_sequence(&base_full, &triggers, &none)?;
        let transient_data = graph.update_sequence(&base_full, &with_rules, &simulate_full.to_set())?;

        for event in &mut self.events {
            if let Some(delay) = event.delay {
                let requested: ObjectSet = [delay].into_iter().collect();
                event.delay_sequence = graph.update_sequence(&base_full, &requested, &none)?;
            }
            event.assignment_sequence =
                graph.update_sequence(&base_full, &event.assignment_values(), &none)?;
            let targets = event.targets();
            let already: ObjectSet = base_full.difference(&targets).copied().collect();
            event.post_assignment_sequence = graph.update_sequence(&targets, &with_rules, &already)?;
        }

        let delay_values: ObjectSet = self
            .delays
            .iter()
            .flat_map(|delay| delay.values.iter().map(|value| value.object))
            .collect();
        for delay in &mut self.delays {
            for value in &delay.values {
                let prerequisites: ObjectSet = value.expression.prerequisites().iter().copied().collect();
                let direct = prerequisites.intersection(&delay_values).next().is_some();
                if direct || !graph.update_sequence(&delay_values, &prerequisites, &none)?.is_empty() {
                    return Err(MathError::RecursiveDelay {
                        infix: value.expression.infix(),
                    });
                }
            }
            let requested = delay.requested();
            delay.full_sequence = graph.update_sequence(&base_full, &requested, &none)?;
            delay.reduced_sequence = graph.update_sequence(&base_reduced, &requested, &none)?;
        }

        self.sequences.initial_constants = UpdateSequence::new(initial_constants.into_iter().collect());
        self.sequences.transient_constants =
            UpdateSequence::new(transient_constants.into_iter().collect());
        self.sequences.sync_initial_extensive = sync_initial_extensive;
        self.sequences.sync_initial_intensive = sync_initial_intensive;
        self.sequences.apply_initial = apply_initial;
        self.sequences.simulate_full = simulate_full;
        self.sequences.simulate_reduced = simulate_reduced;
        self.sequences.transient_data = transient_data;
        self.sequences.priority = priority;
        self.sequences.trigger = trigger;
        self.sets.base_changed_full = base_full;
        self.sets.base_changed_reduced = base_reduced;
        self.sets.simulation_required_full = required_full;
        self.sets.simulation_required_reduced = required_reduced;
        self.autonomous = autonomous;
        debug!(
            simulate = self.sequences.simulate_full.len(),
            apply_initial = self.sequences.apply_initial.len(),
            autonomous,
            "built update sequences"
        );
        Ok(())
    }

    /// Classifies every root as discrete and/or time dependent.
    #[instrument(skip_all)]
    fn analyze_roots(&mut self) -> Result<()> {
        self.expect_state(CompileState::InitialValuesApplied, "analyze roots")?;
        for event in 0..self.events.len() {
            self.classify_roots(event)?;
        }
        self.state = CompileState::RootsAnalyzed;
        Ok(())
    }

    /// Marks the roots of `event` as time dependent when time reaches them
    /// and as discrete when no continuous state does.
    fn classify_roots(&mut self, event: usize) -> Result<()> {
        let none = ObjectSet::new();
        let time: ObjectSet = [self.time_object()].into_iter().collect();
        let continuous: ObjectSet = self.state_objects(false).skip(1).collect();
        let graph = &self.transient_graph;
        let Some(event) = self.events.get_mut(event) else {
            return Ok(());
        };
        for root in &mut event.roots {
            let requested: ObjectSet = [root.root].into_iter().collect();
            root.time_dependent = !graph.update_sequence(&time, &requested, &none)?.is_empty();
            root.discrete = graph
                .update_sequence(&continuous, &requested, &none)?
                .is_empty();
        }
        Ok(())
    }

    /// Adds a value computed from `expression` to both networks and returns
    /// its transient object. The arena grows by one slot at the end of the
    /// value segments.
    #[instrument(skip(self))]
    pub fn add_analysis_object(&mut self, expression: &str) -> Result<ObjectIndex> {
        self.require_sequences("add analysis object")?;
        let transient_rule = self.symbols.resolve(expression, None, false)?;
        let initial_rule = self.symbols.resolve(expression, None, true)?;

        let mut sizes = self.layout().sizes();
        sizes.grow(Segment::InitialExtensiveValues, 1);
        sizes.grow(Segment::ExtensiveValues, 1);
        self.resize(sizes);

        let layout = self.layout().clone();
        let initial = layout.object(
            Segment::InitialExtensiveValues,
            layout.size(Segment::InitialExtensiveValues) - 1,
        );
        let transient = layout.object(
            Segment::ExtensiveValues,
            layout.size(Segment::ExtensiveValues) - 1,
        );
        let entity = EntityKey::Analysis(self.next_analysis);
        for (index, is_initial) in [(initial, true), (transient, false)] {
            self.define(
                index,
                MathObject::new(
                    ValueKind::Value,
                    EntityKind::Analysis,
                    SimulationKind::Assignment,
                    is_initial,
                )
                .with_data_object(DataObjectKey {
                    entity,
                    quantity: Quantity::Value,
                    initial: is_initial,
                }),
            );
        }
        let bound = self
            .set_rule(initial, initial_rule)
            .and_then(|_| self.set_rule(transient, transient_rule));
        if let Err(error) = bound {
            self.shrink_analysis_slot();
            return Err(error);
        }
        self.next_analysis += 1;
        self.analysis_objects.push((initial, transient));
        self.add_to_graph(initial);
        self.add_to_graph(transient);
        self.build_sequences()?;

        for index in [initial, transient] {
            let value = match self.arena.object(index).and_then(|o| o.rule.as_ref()) {
                Some(rule) => rule.evaluate(self.arena.values(), &mut self.stack),
                None => f64::NAN,
            };
            self.arena.set_value(index, value);
        }
        Ok(transient)
    }

    fn shrink_analysis_slot(&mut self) {
        let mut sizes = self.layout().sizes();
        sizes.shrink(Segment::InitialExtensiveValues, 1);
        sizes.shrink(Segment::ExtensiveValues, 1);
        self.resize(sizes);
    }

    /// Removes the most recently added analysis object.
    pub fn remove_analysis_object(&mut self, index: ObjectIndex) -> Result<()> {
        match self.analysis_objects.last() {
            Some((_, transient)) if *transient == index => {}
            _ => return Err(MathError::RemovalOrder),
        }
        if let Some((initial, transient)) = self.analysis_objects.pop() {
            self.initial_graph.remove_object(initial);
            self.transient_graph.remove_object(transient);
        }
        self.shrink_analysis_slot();
        self.build_sequences()
    }

    /// Adds an event without assignments whose trigger is `trigger`.
    /// Returns its position among the container's events.
    #[instrument(skip(self))]
    pub fn add_analysis_event(&mut self, trigger: &str) -> Result<usize> {
        self.require_sequences("add analysis event")?;
        let transient_trigger = self.symbols.resolve(trigger, None, false)?;
        let initial_trigger = self.symbols.resolve(trigger, None, true)?;
        let roots = count_roots(&transient_trigger);

        let mut sizes = self.layout().sizes();
        sizes.grow(Segment::InitialEventTriggers, 1);
        sizes.grow(Segment::EventTriggers, 1);
        sizes.grow(Segment::EventRoots, roots);
        sizes.grow(Segment::EventRootStates, roots);
        self.resize(sizes);

        let layout = self.layout().clone();
        let trigger_object = layout.object(
            Segment::EventTriggers,
            layout.size(Segment::EventTriggers) - 1,
        );
        let initial_object = layout.object(
            Segment::InitialEventTriggers,
            layout.size(Segment::InitialEventTriggers) - 1,
        );
        for (index, initial) in [(trigger_object, false), (initial_object, true)] {
            self.define(
                index,
                MathObject::new(
                    ValueKind::EventTrigger,
                    EntityKind::Event,
                    SimulationKind::Assignment,
                    initial,
                ),
            );
        }
        let first_root = layout.size(Segment::EventRoots) - roots;
        self.define_root_slots(first_root..layout.size(Segment::EventRoots));

        let event = MathEvent::new(
            EventKind::Analysis(self.next_analysis),
            trigger_object,
            initial_object,
        );
        self.next_analysis += 1;
        self.events.push(event);
        let position = self.events.len() - 1;
        let mut next_root = first_root;
        self.compile_trigger(position, transient_trigger, initial_trigger, &mut next_root)?;

        let mut added = vec![trigger_object, initial_object];
        for root in &self.events[position].roots {
            added.push(root.root);
            added.push(root.root_state);
        }
        for index in added {
            self.add_to_graph(index);
        }
        self.build_sequences()?;
        self.classify_roots(position)?;

        let roots: Vec<ObjectIndex> = self.events[position].roots.iter().map(|r| r.root).collect();
        evaluate_sequence(&mut self.arena, &mut self.stack, &roots);
        for root in &mut self.events[position].roots {
            root.derive_state(self.arena.value(root.root));
            self.arena.set_value(root.root_state, root.state_value());
        }
        evaluate_sequence(
            &mut self.arena,
            &mut self.stack,
            &[initial_object, trigger_object],
        );
        Ok(position)
    }

    /// Removes the most recently added analysis event.
    pub fn remove_analysis_event(&mut self, event: usize) -> Result<()> {
        let last = self.events.len().checked_sub(1);
        let is_analysis = self
            .events
            .last()
            .is_some_and(|e| matches!(e.kind, EventKind::Analysis(_)));
        if last != Some(event) || !is_analysis {
            return Err(MathError::RemovalOrder);
        }
        let Some(removed) = self.events.pop() else {
            return Err(MathError::RemovalOrder);
        };
        self.queue.remove_event(event);
        let roots = removed.roots.len();
        let mut sizes = self.layout().sizes();
        sizes.shrink(Segment::InitialEventTriggers, 1);
        sizes.shrink(Segment::EventTriggers, 1);
        sizes.shrink(Segment::EventRoots, roots);
        sizes.shrink(Segment::EventRootStates, roots);
        self.resize(sizes);
        self.build_sequences()
    }
}
