//! Value arena and object descriptor table.
//!
//! The arena is one contiguous `Vec<f64>` partitioned into named segments
//! whose order never changes. Segment sizes alone determine every start
//! offset. A parallel `Vec<MathObject>` carries the descriptor of each slot.
//!
//! ```text
//! [ initial: ext values | int values | ext rates | int rates | particle fluxes | fluxes | total masses | triggers ]
//! [ transient: same eight segments                                                                           ]
//! [ delays | priorities | assignments | roots | root states | propensities | dependent masses |
//!   discontinuities | delay values | delay lags | transition times ]
//! ```

use std::ops::Range;

use tracing::debug;

use crate::object::{MathObject, ObjectIndex};
use crate::relocation::{Relocate, RelocationSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Segment {
    InitialExtensiveValues,
    InitialIntensiveValues,
    InitialExtensiveRates,
    InitialIntensiveRates,
    InitialParticleFluxes,
    InitialFluxes,
    InitialTotalMasses,
    InitialEventTriggers,
    ExtensiveValues,
    IntensiveValues,
    ExtensiveRates,
    IntensiveRates,
    ParticleFluxes,
    Fluxes,
    TotalMasses,
    EventTriggers,
    EventDelays,
    EventPriorities,
    EventAssignments,
    EventRoots,
    EventRootStates,
    Propensities,
    DependentMasses,
    Discontinuous,
    DelayValues,
    DelayLags,
    TransitionTimes,
}

impl Segment {
    pub const COUNT: usize = 27;

    pub const ALL: [Segment; Segment::COUNT] = [
        Segment::InitialExtensiveValues,
        Segment::InitialIntensiveValues,
        Segment::InitialExtensiveRates,
        Segment::InitialIntensiveRates,
        Segment::InitialParticleFluxes,
        Segment::InitialFluxes,
        Segment::InitialTotalMasses,
        Segment::InitialEventTriggers,
        Segment::ExtensiveValues,
        Segment::IntensiveValues,
        Segment::ExtensiveRates,
        Segment::IntensiveRates,
        Segment::ParticleFluxes,
        Segment::Fluxes,
        Segment::TotalMasses,
        Segment::EventTriggers,
        Segment::EventDelays,
        Segment::EventPriorities,
        Segment::EventAssignments,
        Segment::EventRoots,
        Segment::EventRootStates,
        Segment::Propensities,
        Segment::DependentMasses,
        Segment::Discontinuous,
        Segment::DelayValues,
        Segment::DelayLags,
        Segment::TransitionTimes,
    ];

    /// The eight segments that exist in both an initial and a transient copy.
    pub const MIRRORED: [(Segment, Segment); 8] = [
        (Segment::InitialExtensiveValues, Segment::ExtensiveValues),
        (Segment::InitialIntensiveValues, Segment::IntensiveValues),
        (Segment::InitialExtensiveRates, Segment::ExtensiveRates),
        (Segment::InitialIntensiveRates, Segment::IntensiveRates),
        (Segment::InitialParticleFluxes, Segment::ParticleFluxes),
        (Segment::InitialFluxes, Segment::Fluxes),
        (Segment::InitialTotalMasses, Segment::TotalMasses),
        (Segment::InitialEventTriggers, Segment::EventTriggers),
    ];

    pub fn position(self) -> usize {
        self as usize
    }

    pub fn is_initial(self) -> bool {
        self.position() < Segment::ExtensiveValues.position()
    }

    pub fn name(self) -> &'static str {
        match self {
            Segment::InitialExtensiveValues => "initial extensive values",
            Segment::InitialIntensiveValues => "initial intensive values",
            Segment::InitialExtensiveRates => "initial extensive rates",
            Segment::InitialIntensiveRates => "initial intensive rates",
            Segment::InitialParticleFluxes => "initial particle fluxes",
            Segment::InitialFluxes => "initial fluxes",
            Segment::InitialTotalMasses => "initial total masses",
            Segment::InitialEventTriggers => "initial event triggers",
            Segment::ExtensiveValues => "extensive values",
            Segment::IntensiveValues => "intensive values",
            Segment::ExtensiveRates => "extensive rates",
            Segment::IntensiveRates => "intensive rates",
            Segment::ParticleFluxes => "particle fluxes",
            Segment::Fluxes => "fluxes",
            Segment::TotalMasses => "total masses",
            Segment::EventTriggers => "event triggers",
            Segment::EventDelays => "event delays",
            Segment::EventPriorities => "event priorities",
            Segment::EventAssignments => "event assignments",
            Segment::EventRoots => "event roots",
            Segment::EventRootStates => "event root states",
            Segment::Propensities => "propensities",
            Segment::DependentMasses => "dependent masses",
            Segment::Discontinuous => "discontinuities",
            Segment::DelayValues => "delay values",
            Segment::DelayLags => "delay lags",
            Segment::TransitionTimes => "transition times",
        }
    }
}

/// Number of slots per segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentSizes([usize; Segment::COUNT]);

impl SegmentSizes {
    pub fn get(&self, segment: Segment) -> usize {
        self.0[segment.position()]
    }

    pub fn set(&mut self, segment: Segment, size: usize) {
        self.0[segment.position()] = size;
    }

    pub fn grow(&mut self, segment: Segment, by: usize) {
        self.0[segment.position()] += by;
    }

    pub fn shrink(&mut self, segment: Segment, by: usize) {
        let slot = &mut self.0[segment.position()];
        *slot = slot.saturating_sub(by);
    }

    /// Sets a transient segment and its initial mirror to the same size.
    pub fn set_mirrored(&mut self, transient: Segment, size: usize) {
        self.set(transient, size);
        if let Some((initial, _)) = Segment::MIRRORED.iter().find(|(_, t)| *t == transient) {
            self.set(*initial, size);
        }
    }

    pub fn total(&self) -> usize {
        self.0.iter().sum()
    }
}

/// Start offsets derived from segment sizes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SegmentLayout {
    sizes: SegmentSizes,
    starts: [usize; Segment::COUNT],
}

impl SegmentLayout {
    pub fn new(sizes: SegmentSizes) -> Self {
        let mut starts = [0; Segment::COUNT];
        let mut offset = 0;
        for segment in Segment::ALL {
            starts[segment.position()] = offset;
            offset += sizes.get(segment);
        }
        Self { sizes, starts }
    }

    pub fn sizes(&self) -> SegmentSizes {
        self.sizes
    }

    pub fn size(&self, segment: Segment) -> usize {
        self.sizes.get(segment)
    }

    pub fn start(&self, segment: Segment) -> usize {
        self.starts[segment.position()]
    }

    pub fn range(&self, segment: Segment) -> Range<usize> {
        let start = self.start(segment);
        start..start + self.size(segment)
    }

    pub fn total(&self) -> usize {
        self.sizes.total()
    }

    pub fn segment_of(&self, index: usize) -> Option<Segment> {
        Segment::ALL
            .into_iter()
            .find(|segment| self.range(*segment).contains(&index))
    }

    pub fn object(&self, segment: Segment, offset: usize) -> ObjectIndex {
        ObjectIndex::new(self.start(segment) + offset)
    }
}

/// The value arena together with its parallel descriptor table.
#[derive(Debug, Clone, Default)]
pub struct ValueArena {
    layout: SegmentLayout,
    values: Vec<f64>,
    objects: Vec<MathObject>,
}

impl ValueArena {
    /// Creates an arena with every slot set to NaN so that reads before
    /// initialization are visible immediately.
    pub fn new(sizes: SegmentSizes) -> Self {
        let layout = SegmentLayout::new(sizes);
        let total = layout.total();
        Self {
            layout,
            values: vec![f64::NAN; total],
            objects: vec![MathObject::default(); total],
        }
    }

    pub fn layout(&self) -> &SegmentLayout {
        &self.layout
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    pub fn value(&self, index: ObjectIndex) -> f64 {
        self.values[index.index()]
    }

    pub fn set_value(&mut self, index: ObjectIndex, value: f64) {
        self.values[index.index()] = value;
    }

    pub fn object(&self, index: ObjectIndex) -> Option<&MathObject> {
        self.objects.get(index.index())
    }

    pub fn object_mut(&mut self, index: ObjectIndex) -> Option<&mut MathObject> {
        self.objects.get_mut(index.index())
    }

    pub fn objects(&self) -> &[MathObject] {
        &self.objects
    }

    pub fn segment_values(&self, segment: Segment) -> &[f64] {
        &self.values[self.layout.range(segment)]
    }

    pub fn segment_indices(&self, segment: Segment) -> impl Iterator<Item = ObjectIndex> {
        self.layout.range(segment).map(ObjectIndex::new)
    }

    pub fn indices(&self) -> impl Iterator<Item = ObjectIndex> {
        (0..self.values.len()).map(ObjectIndex::new)
    }

    /// Copies every initial segment onto its transient mirror.
    pub fn copy_initial_to_transient(&mut self) {
        for (initial, transient) in Segment::MIRRORED {
            let source = self.layout.range(initial);
            let target = self.layout.start(transient);
            self.values.copy_within(source, target);
        }
    }

    /// Resizes the arena to `sizes`, relocating every value and descriptor.
    ///
    /// Each old slot is visited exactly once. Slots covered by a relocation
    /// move to their new home with a bit-identical value and a relocated
    /// descriptor; removed slots are dropped; new slots start as NaN with an
    /// undefined descriptor.
    pub fn resize(&mut self, sizes: SegmentSizes) -> RelocationSet {
        let new_layout = SegmentLayout::new(sizes);
        let relocations = RelocationSet::plan(&self.layout, &new_layout);

        let total = new_layout.total();
        let mut values = vec![f64::NAN; total];
        let mut objects = vec![MathObject::default(); total];

        let old_values = std::mem::take(&mut self.values);
        let old_objects = std::mem::take(&mut self.objects);
        for (old_index, (value, mut object)) in old_values.into_iter().zip(old_objects).enumerate() {
            let Some(new_index) = relocations.map(old_index) else {
                continue;
            };
            if new_index >= total {
                continue;
            }
            object.relocate(&relocations);
            values[new_index] = value;
            objects[new_index] = object;
        }

        debug!(
            old_size = self.layout.total(),
            new_size = total,
            relocations = relocations.len(),
            "resized value arena"
        );

        self.layout = new_layout;
        self.values = values;
        self.objects = objects;
        relocations
    }

    pub(crate) fn set_object(&mut self, index: ObjectIndex, object: MathObject) {
        self.objects[index.index()] = object;
    }

    /// Drops every descriptor, keeping values and layout.
    pub(crate) fn reset_objects(&mut self) {
        self.objects.fill(MathObject::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{EntityKind, SimulationKind, ValueKind};

    fn sizes(entries: &[(Segment, usize)]) -> SegmentSizes {
        let mut sizes = SegmentSizes::default();
        for (segment, size) in entries {
            sizes.set(*segment, *size);
        }
        sizes
    }

    #[test]
    fn layout_starts_follow_segment_order() {
        let layout = SegmentLayout::new(sizes(&[
            (Segment::InitialExtensiveValues, 3),
            (Segment::ExtensiveValues, 3),
            (Segment::EventRoots, 2),
        ]));
        assert_eq!(layout.start(Segment::InitialExtensiveValues), 0);
        assert_eq!(layout.start(Segment::InitialIntensiveValues), 3);
        assert_eq!(layout.start(Segment::ExtensiveValues), 3);
        assert_eq!(layout.start(Segment::EventRoots), 6);
        assert_eq!(layout.start(Segment::TransitionTimes), 8);
        assert_eq!(layout.total(), 8);
        assert_eq!(layout.segment_of(4), Some(Segment::ExtensiveValues));
        assert_eq!(layout.segment_of(7), Some(Segment::EventRoots));
        assert_eq!(layout.segment_of(8), None);
    }

    #[test]
    fn new_arena_is_nan_filled() {
        let arena = ValueArena::new(sizes(&[(Segment::ExtensiveValues, 4)]));
        assert_eq!(arena.len(), 4);
        assert!(arena.values().iter().all(|v| v.is_nan()));
    }

    #[test]
    fn mirrored_sizes_cover_initial_segment() {
        let mut sizes = SegmentSizes::default();
        sizes.set_mirrored(Segment::Fluxes, 5);
        assert_eq!(sizes.get(Segment::Fluxes), 5);
        assert_eq!(sizes.get(Segment::InitialFluxes), 5);
        sizes.set_mirrored(Segment::EventRoots, 2);
        assert_eq!(sizes.total(), 12);
    }

    #[test]
    fn copy_initial_to_transient_mirrors_values() {
        let mut sizes = SegmentSizes::default();
        sizes.set_mirrored(Segment::ExtensiveValues, 2);
        sizes.set_mirrored(Segment::Fluxes, 1);
        let mut arena = ValueArena::new(sizes);
        let layout = arena.layout().clone();
        arena.set_value(layout.object(Segment::InitialExtensiveValues, 1), 4.0);
        arena.set_value(layout.object(Segment::InitialFluxes, 0), 9.0);
        arena.copy_initial_to_transient();
        assert_eq!(arena.value(layout.object(Segment::ExtensiveValues, 1)), 4.0);
        assert_eq!(arena.value(layout.object(Segment::Fluxes, 0)), 9.0);
    }

    #[test]
    fn resize_preserves_values_and_descriptors() {
        let mut arena = ValueArena::new(sizes(&[
            (Segment::ExtensiveValues, 2),
            (Segment::EventRoots, 1),
        ]));
        let root = arena.layout().object(Segment::EventRoots, 0);
        arena.set_value(root, 7.5);
        arena.set_object(
            root,
            MathObject::new(
                ValueKind::EventRoot,
                EntityKind::Event,
                SimulationKind::Assignment,
                false,
            ),
        );

        let relocations = arena.resize(sizes(&[
            (Segment::ExtensiveValues, 3),
            (Segment::EventRoots, 1),
        ]));

        let moved = ObjectIndex::new(relocations.relocate_index(root.index()));
        assert_eq!(moved.index(), 3);
        assert_eq!(arena.value(moved), 7.5);
        assert_eq!(
            arena.object(moved).map(|o| o.value_kind),
            Some(ValueKind::EventRoot)
        );
        assert!(arena.value(ObjectIndex::new(2)).is_nan());
    }
}
