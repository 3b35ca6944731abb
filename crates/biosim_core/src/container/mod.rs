//! The math container: arena, descriptors, graphs, sequences and events of
//! one compiled model.
//!
//! Construction goes through [`MathContainer::compile`], which runs the
//! pipeline stages in order. Afterwards the container is driven by an
//! integrator through the state, rate, root and queue operations.

mod compile;
mod events;
mod state;

use std::collections::BTreeMap;
use std::ops::Range;

use anyhow::Context;
use nalgebra::DMatrix;

use crate::arena::{Segment, SegmentLayout, SegmentSizes, ValueArena};
use crate::config::ContainerSettings;
use crate::delay::{MathDelay, StateRecorder};
use crate::error::{MathError, Result};
use crate::event::MathEvent;
use crate::event_queue::EventQueue;
use crate::graph::{DependencyGraph, ObjectSet, UpdateSequence};
use crate::object::{DataObjectKey, MathObject, ObjectIndex};
use crate::relocation::{Relocate, RelocationSet};
use crate::symbols::SymbolTable;
use crate::traits::DataObjectStore;

pub use state::ContainerSystem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CompileState {
    Uninitialized,
    Allocated,
    ObjectsInitialized,
    EventsInitialized,
    Compiled,
    DependencyGraphsBuilt,
    UpdateSequencesBuilt,
    InitialValuesApplied,
    RootsAnalyzed,
}

impl CompileState {
    pub fn name(self) -> &'static str {
        match self {
            CompileState::Uninitialized => "uninitialized",
            CompileState::Allocated => "allocated",
            CompileState::ObjectsInitialized => "objects initialized",
            CompileState::EventsInitialized => "events initialized",
            CompileState::Compiled => "compiled",
            CompileState::DependencyGraphsBuilt => "dependency graphs built",
            CompileState::UpdateSequencesBuilt => "update sequences built",
            CompileState::InitialValuesApplied => "initial values applied",
            CompileState::RootsAnalyzed => "roots analyzed",
        }
    }
}

/// Sizes of the simulation-kind groups in the value segments.
///
/// Value entities are ordered Fixed, EventTarget, Time, ODE, Independent,
/// Dependent, Assignment; the state is the run from Time to Dependent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValueGroups {
    pub fixed: usize,
    pub event_target: usize,
    pub ode: usize,
    pub independent: usize,
    pub dependent: usize,
    pub assignment: usize,
}

impl ValueGroups {
    /// Offset of the time slot within the value segments.
    pub fn state_offset(&self) -> usize {
        self.fixed + self.event_target
    }

    /// State length including time; the reduced state omits dependents.
    pub fn state_len(&self, reduced: bool) -> usize {
        let dependent = if reduced { 0 } else { self.dependent };
        1 + self.ode + self.independent + dependent
    }
}

/// Cached update sequences of the compiled model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sequences {
    pub initial_constants: UpdateSequence,
    pub transient_constants: UpdateSequence,
    pub sync_initial_extensive: UpdateSequence,
    pub sync_initial_intensive: UpdateSequence,
    pub apply_initial: UpdateSequence,
    pub simulate_full: UpdateSequence,
    pub simulate_reduced: UpdateSequence,
    pub transient_data: UpdateSequence,
    pub priority: UpdateSequence,
    pub trigger: UpdateSequence,
}

impl Sequences {
    pub fn simulate(&self, reduced: bool) -> &UpdateSequence {
        if reduced {
            &self.simulate_reduced
        } else {
            &self.simulate_full
        }
    }
}

impl Relocate for Sequences {
    fn relocate(&mut self, relocations: &RelocationSet) {
        for sequence in [
            &mut self.initial_constants,
            &mut self.transient_constants,
            &mut self.sync_initial_extensive,
            &mut self.sync_initial_intensive,
            &mut self.apply_initial,
            &mut self.simulate_full,
            &mut self.simulate_reduced,
            &mut self.transient_data,
            &mut self.priority,
            &mut self.trigger,
        ] {
            sequence.relocate(relocations);
        }
    }
}

/// Object sets the cached sequences were derived from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectSets {
    pub base_changed_full: ObjectSet,
    pub base_changed_reduced: ObjectSet,
    pub simulation_required_full: ObjectSet,
    pub simulation_required_reduced: ObjectSet,
}

impl ObjectSets {
    pub fn base_changed(&self, reduced: bool) -> &ObjectSet {
        if reduced {
            &self.base_changed_reduced
        } else {
            &self.base_changed_full
        }
    }

    pub fn simulation_required(&self, reduced: bool) -> &ObjectSet {
        if reduced {
            &self.simulation_required_reduced
        } else {
            &self.simulation_required_full
        }
    }
}

impl Relocate for ObjectSets {
    fn relocate(&mut self, relocations: &RelocationSet) {
        self.base_changed_full.relocate(relocations);
        self.base_changed_reduced.relocate(relocations);
        self.simulation_required_full.relocate(relocations);
        self.simulation_required_reduced.relocate(relocations);
    }
}

#[derive(Debug, Clone)]
pub struct MathContainer {
    settings: ContainerSettings,
    state: CompileState,
    arena: ValueArena,
    groups: ValueGroups,
    symbols: SymbolTable,
    quantity_to_number: f64,
    data_objects: BTreeMap<DataObjectKey, ObjectIndex>,
    /// Transient species amount paired with its compartment volume.
    species_volumes: Vec<(ObjectIndex, ObjectIndex)>,
    initial_graph: DependencyGraph,
    transient_graph: DependencyGraph,
    sequences: Sequences,
    sets: ObjectSets,
    events: Vec<MathEvent>,
    delays: Vec<MathDelay>,
    /// One row per delay, one column per full state coordinate.
    history: DMatrix<f64>,
    recorder: StateRecorder,
    queue: EventQueue,
    /// Initial and transient object of each analysis value, oldest first.
    analysis_objects: Vec<(ObjectIndex, ObjectIndex)>,
    next_analysis: usize,
    autonomous: bool,
    diagnostics: Vec<String>,
    stack: Vec<f64>,
}

/// Recomputes `sequence` in order from each object's rule.
fn evaluate_sequence(arena: &mut ValueArena, stack: &mut Vec<f64>, sequence: &[ObjectIndex]) {
    for &index in sequence {
        let value = match arena.object(index).and_then(|object| object.rule.as_ref()) {
            Some(rule) => rule.evaluate(arena.values(), stack),
            None => continue,
        };
        arena.set_value(index, value);
    }
}

impl MathContainer {
    pub fn new(settings: ContainerSettings) -> anyhow::Result<Self> {
        settings.validate().context("invalid container settings")?;
        Ok(Self {
            settings,
            state: CompileState::Uninitialized,
            arena: ValueArena::default(),
            groups: ValueGroups::default(),
            symbols: SymbolTable::default(),
            quantity_to_number: 1.0,
            data_objects: BTreeMap::new(),
            species_volumes: Vec::new(),
            initial_graph: DependencyGraph::new(),
            transient_graph: DependencyGraph::new(),
            sequences: Sequences::default(),
            sets: ObjectSets::default(),
            events: Vec::new(),
            delays: Vec::new(),
            history: DMatrix::zeros(0, 0),
            recorder: StateRecorder::new(settings.history_capacity),
            queue: EventQueue::new(),
            analysis_objects: Vec::new(),
            next_analysis: 0,
            autonomous: false,
            diagnostics: Vec::new(),
            stack: Vec::new(),
        })
    }

    pub fn settings(&self) -> &ContainerSettings {
        &self.settings
    }

    pub fn compile_state(&self) -> CompileState {
        self.state
    }

    /// Messages of failed compile attempts, oldest first.
    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }

    pub fn arena(&self) -> &ValueArena {
        &self.arena
    }

    pub fn layout(&self) -> &SegmentLayout {
        self.arena.layout()
    }

    pub fn values(&self) -> &[f64] {
        self.arena.values()
    }

    pub fn value(&self, index: ObjectIndex) -> f64 {
        self.arena.value(index)
    }

    pub fn set_value(&mut self, index: ObjectIndex, value: f64) {
        self.arena.set_value(index, value);
    }

    pub fn groups(&self) -> ValueGroups {
        self.groups
    }

    pub fn events(&self) -> &[MathEvent] {
        &self.events
    }

    pub fn delays(&self) -> &[MathDelay] {
        &self.delays
    }

    pub fn history(&self) -> &DMatrix<f64> {
        &self.history
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    pub fn sequences(&self) -> &Sequences {
        &self.sequences
    }

    pub fn object_sets(&self) -> &ObjectSets {
        &self.sets
    }

    pub fn initial_graph(&self) -> &DependencyGraph {
        &self.initial_graph
    }

    pub fn transient_graph(&self) -> &DependencyGraph {
        &self.transient_graph
    }

    /// Whether no simulated value depends on time explicitly.
    pub fn is_autonomous(&self) -> bool {
        self.autonomous
    }

    pub fn analysis_objects(&self) -> impl Iterator<Item = ObjectIndex> + '_ {
        self.analysis_objects.iter().map(|(_, transient)| *transient)
    }

    pub fn object_index(&self, key: &DataObjectKey) -> Option<ObjectIndex> {
        self.data_objects.get(key).copied()
    }

    pub fn math_object(&self, key: &DataObjectKey) -> Option<&MathObject> {
        self.object_index(key).and_then(|index| self.arena.object(index))
    }

    /// Descriptor of the arena slot at `index`.
    pub fn math_object_for_value(&self, index: usize) -> Option<&MathObject> {
        self.arena.object(ObjectIndex::new(index))
    }

    pub(crate) fn time_object(&self) -> ObjectIndex {
        self.layout()
            .object(Segment::ExtensiveValues, self.groups.state_offset())
    }

    /// Resizes the arena and relocates every stored index.
    ///
    /// The returned set lets external holders of indices follow the move.
    pub fn resize(&mut self, sizes: SegmentSizes) -> RelocationSet {
        let relocations = self.arena.resize(sizes);
        self.data_objects.relocate(&relocations);
        self.species_volumes
            .retain(|(amount, volume)| {
                !relocations.is_removed(amount.index()) && !relocations.is_removed(volume.index())
            });
        self.species_volumes.relocate(&relocations);
        self.initial_graph.relocate(&relocations);
        self.transient_graph.relocate(&relocations);
        self.sequences.relocate(&relocations);
        self.sets.relocate(&relocations);
        self.events.relocate(&relocations);
        self.delays.relocate(&relocations);
        self.analysis_objects.relocate(&relocations);
        relocations
    }

    fn expect_state(&self, expected: CompileState, requested: &'static str) -> Result<()> {
        if self.state != expected {
            return Err(MathError::InvalidTransition {
                current: self.state.name(),
                requested,
            });
        }
        Ok(())
    }

    fn require_sequences(&self, requested: &'static str) -> Result<()> {
        if self.state < CompileState::UpdateSequencesBuilt {
            return Err(MathError::InvalidTransition {
                current: self.state.name(),
                requested,
            });
        }
        Ok(())
    }

    fn state_objects(&self, reduced: bool) -> impl Iterator<Item = ObjectIndex> {
        self.state_range(reduced).map(ObjectIndex::new)
    }

    /// Reads the transient state from the model.
    pub fn fetch_state(&mut self, store: &impl DataObjectStore) {
        let state: Vec<ObjectIndex> = self.state_objects(false).collect();
        for index in state {
            let key = self
                .arena
                .object(index)
                .and_then(|object| object.data_object);
            if let Some(value) = key.and_then(|key| store.data_value(&key)) {
                self.arena.set_value(index, value);
            }
        }
    }

    /// Writes the transient state to the model.
    pub fn push_state(&self, store: &mut impl DataObjectStore) {
        for index in self.state_objects(false) {
            if let Some(key) = self.arena.object(index).and_then(|object| object.data_object) {
                store.set_data_value(&key, self.arena.value(index));
            }
        }
    }

    /// Reads every initial value the model holds.
    pub fn fetch_initial_state(&mut self, store: &impl DataObjectStore) {
        for (key, index) in &self.data_objects {
            if !key.initial {
                continue;
            }
            if let Some(value) = store.data_value(key) {
                self.arena.set_value(*index, value);
            }
        }
    }

    pub fn push_initial_state(&self, store: &mut impl DataObjectStore) {
        self.push_values(store, true);
    }

    pub fn push_all_transient_values(&self, store: &mut impl DataObjectStore) {
        self.push_values(store, false);
    }

    fn push_values(&self, store: &mut impl DataObjectStore, initial: bool) {
        for (key, index) in &self.data_objects {
            if key.initial == initial {
                store.set_data_value(key, self.arena.value(*index));
            }
        }
    }

    fn state_range(&self, reduced: bool) -> Range<usize> {
        let start = self.layout().start(Segment::ExtensiveValues) + self.groups.state_offset();
        start..start + self.groups.state_len(reduced)
    }

    fn rate_range(&self, reduced: bool) -> Range<usize> {
        let start = self.layout().start(Segment::ExtensiveRates) + self.groups.state_offset();
        start..start + self.groups.state_len(reduced)
    }
}
