//! End-to-end scenarios driving a compiled container through the public API.

use biosim_core::arena::Segment;
use biosim_core::graph::ObjectSet;
use biosim_core::object::ObjectIndex;
use biosim_core::relocation::Relocate;
use biosim_core::{
    ContainerSettings, DataObjectKey, EntityKey, EntityStatus, EventDefinition, MathContainer,
    Model, Quantity, RootToggle,
};

fn compile(model: &Model) -> MathContainer {
    MathContainer::from_model(model, ContainerSettings::default()).expect("model compiles")
}

fn index(container: &MathContainer, key: DataObjectKey) -> ObjectIndex {
    container
        .object_index(&key)
        .unwrap_or_else(|| panic!("no object for {key:?}"))
}

fn transient(container: &MathContainer, entity: EntityKey, quantity: Quantity) -> f64 {
    container.value(index(container, DataObjectKey::transient(entity, quantity)))
}

/// A -> B with rate law `k * A` in a compartment of volume 2.
fn conversion() -> Model {
    let mut model = Model::new("conversion");
    let cell = model.add_compartment("cell", 2.0);
    let a = model.add_species("A", cell, 3.0);
    let b = model.add_species("B", cell, 0.0);
    model.add_global_quantity("k", 0.5);
    let r = model.add_reaction("R", vec![(a, -1.0), (b, 1.0)], "k * A");
    model.reactions[r].compartment = Some(cell);
    model
}

#[test]
fn mass_action_network_without_events() {
    let mut container = compile(&conversion());
    let layout = container.layout().clone();

    for segment in [
        Segment::EventTriggers,
        Segment::EventDelays,
        Segment::EventPriorities,
        Segment::EventAssignments,
        Segment::EventRoots,
        Segment::EventRootStates,
    ] {
        assert_eq!(layout.size(segment), 0, "{}", segment.name());
    }
    assert!(container.events().is_empty());
    assert!(container.is_autonomous());

    let rate = |s| index(&container, DataObjectKey::transient(EntityKey::Species(s), Quantity::Rate));
    let rates = [rate(0), rate(1)];
    let sequence = container.sequences().simulate_full.objects().to_vec();
    assert_eq!(sequence.len(), 4);
    assert!(rates.contains(&sequence[2]));
    assert!(rates.contains(&sequence[3]));

    let concentration_a =
        index(&container, DataObjectKey::transient(EntityKey::Species(0), Quantity::Concentration));
    let concentration_b =
        index(&container, DataObjectKey::transient(EntityKey::Species(1), Quantity::Concentration));
    let flux = index(&container, DataObjectKey::transient(EntityKey::Reaction(0), Quantity::Flux));
    assert_eq!(&sequence[..2], &[concentration_a, flux]);
    assert!(!sequence.contains(&concentration_b));

    container
        .update_simulated_values(false)
        .expect("finite rates");
    assert_eq!(container.rate(false), &[1.0, -3.0, 3.0]);
}

#[test]
fn cached_sequence_matches_full_recomputation() {
    let mut model = conversion();
    let fast = model.add_global_quantity("k2", 0.0);
    model.global_quantities[fast].status = EntityStatus::Assignment;
    model.global_quantities[fast].expression = Some("2 * k + time".to_string());
    let back = model.add_reaction("back", vec![(1, -1.0), (0, 1.0)], "k2 * B");
    model.reactions[back].compartment = Some(0);
    let mut container = compile(&model);

    container.set_state(&[0.5, 4.0, 1.0]).expect("full state");
    container
        .update_simulated_values(false)
        .expect("finite rates");

    // Every transient rule, evaluated from scratch in dependency order.
    let transient_range = container.layout().start(Segment::ExtensiveValues)..container.arena().len();
    let (mut inputs, mut ruled) = (ObjectSet::new(), ObjectSet::new());
    for position in transient_range {
        let index = ObjectIndex::new(position);
        match container.arena().object(index) {
            Some(object) if object.has_rule() => ruled.insert(index),
            _ => inputs.insert(index),
        };
    }
    let order = container
        .transient_graph()
        .update_sequence(&inputs, &ruled, &ObjectSet::new())
        .expect("acyclic rules");
    let mut values = container.values().to_vec();
    let mut stack = Vec::new();
    for index in order.iter() {
        let rule = container
            .arena()
            .object(index)
            .and_then(|object| object.rule.as_ref())
            .expect("sequenced objects have rules");
        let value = rule.evaluate(&values, &mut stack);
        values[index.index()] = value;
    }

    let checked = [
        DataObjectKey::transient(EntityKey::Species(0), Quantity::Rate),
        DataObjectKey::transient(EntityKey::Species(1), Quantity::Rate),
        DataObjectKey::transient(EntityKey::Reaction(0), Quantity::Flux),
        DataObjectKey::transient(EntityKey::Reaction(1), Quantity::Flux),
    ];
    for key in checked {
        let position = index(&container, key).index();
        assert!(
            (container.values()[position] - values[position]).abs() < 1e-12,
            "{key:?}: cached {} vs full {}",
            container.values()[position],
            values[position]
        );
    }
    // k2 = 2 * 0.5 + 0.5 at the perturbed time; back flux = k2 * [B] * V.
    let back_flux = transient(&container, EntityKey::Reaction(1), Quantity::Flux);
    assert!((back_flux - 1.5).abs() < 1e-12);
}

#[test]
fn growing_segments_preserves_every_slot() {
    let mut container = compile(&conversion());
    let before = container.arena().clone();
    let state = container.state(false).to_vec();

    let mut sizes = before.layout().sizes();
    for segment in [
        Segment::InitialExtensiveValues,
        Segment::InitialIntensiveValues,
        Segment::ExtensiveValues,
        Segment::IntensiveValues,
    ] {
        sizes.grow(segment, 1);
    }
    let relocations = container.resize(sizes);
    assert_eq!(container.arena().len(), before.len() + 4);

    for (old, (value, object)) in before.values().iter().zip(before.objects()).enumerate() {
        let new = relocations.map(old).expect("growth removes nothing");
        assert_eq!(container.values()[new].to_bits(), value.to_bits(), "slot {old}");
        let mut expected = object.clone();
        expected.relocate(&relocations);
        assert_eq!(container.arena().object(ObjectIndex::new(new)), Some(&expected));
    }

    for object in before.objects() {
        let Some(key) = object.data_object else {
            continue;
        };
        let moved = index(&container, key);
        let descriptor = container.arena().object(moved).expect("in range");
        assert_eq!(descriptor.data_object, Some(key));
    }

    let added = container.layout().range(Segment::ExtensiveValues).end - 1;
    assert!(container.values()[added].is_nan());
    assert_eq!(container.state(false), state.as_slice());

    container
        .update_simulated_values(false)
        .expect("sequences were relocated");
    assert_eq!(container.rate(false), &[1.0, -3.0, 3.0]);
}

/// `X` starts at 6 and is reset to 0 once it exceeds 5.
fn threshold(fire_at_initial_time: bool) -> Model {
    let mut model = Model::new("threshold");
    let cell = model.add_compartment("cell", 1.0);
    model.add_species("X", cell, 6.0);
    let mut event = EventDefinition::new("reset", "X > 5").assign("X", "0");
    event.fire_at_initial_time = fire_at_initial_time;
    model.add_event(event);
    model
}

#[test]
fn threshold_event_fires_at_initial_time() {
    let container = compile(&threshold(true));
    assert_eq!(container.root_count(), 1);
    assert_eq!(transient(&container, EntityKey::Species(0), Quantity::Value), 0.0);
    assert_eq!(container.state(false), &[0.0, 0.0]);
}

#[test]
fn threshold_event_fires_on_crossing() {
    let mut container = compile(&threshold(false));
    assert_eq!(transient(&container, EntityKey::Species(0), Quantity::Value), 6.0);
    assert_eq!(container.roots(), vec![1.0]);

    // The integrator reports the root going down, then back up.
    container.set_state(&[1.0, 4.0]).expect("full state");
    container
        .update_simulated_values(false)
        .expect("finite rates");
    container
        .process_roots(false, &[RootToggle::ToggleBoth])
        .expect("one root");
    assert!(container.queue().is_empty());

    container.set_state(&[2.0, 5.5]).expect("full state");
    container
        .update_simulated_values(false)
        .expect("finite rates");
    container
        .process_roots(false, &[RootToggle::ToggleBoth])
        .expect("one root");
    assert_eq!(container.queue().next_time(), Some(2.0));

    let status = container.process_queue(2.0, true).expect("queue runs");
    assert!(status.state_changed);
    assert_eq!(status.processed, 1);
    assert_eq!(container.state(false), &[2.0, 0.0]);
    assert_eq!(transient(&container, EntityKey::Species(0), Quantity::Concentration), 0.0);
}

#[test]
fn delayed_value_reads_recorded_history() {
    let mut model = Model::new("delay");
    let cell = model.add_compartment("cell", 1.0);
    model.add_species("X", cell, 1.0);
    let y = model.add_global_quantity("Y", 0.0);
    model.global_quantities[y].status = EntityStatus::Assignment;
    model.global_quantities[y].expression = Some("delay(X, 2)".to_string());
    let mut container = compile(&model);

    assert_eq!(container.layout().size(Segment::DelayLags), 1);
    assert_eq!(container.layout().size(Segment::DelayValues), 1);
    assert_eq!(container.delays().len(), 1);
    let delay = &container.delays()[0];
    assert_eq!(delay.values.len(), 1);
    let (lag, delayed) = (delay.lag, delay.values[0].object);
    assert_eq!(container.value(lag), 2.0);
    // Before any history exists the delayed value is the initial one.
    assert_eq!(container.value(delayed), 1.0);

    container.set_state(&[1.0, 3.0]).expect("full state");
    container.record_state();
    container.set_state(&[3.0, 5.0]).expect("full state");
    container.record_state();
    container
        .update_history_values(false)
        .expect("history available");

    assert_eq!(container.value(delayed), 3.0);
    assert_eq!(container.history().nrows(), 1);
    assert_eq!(container.history()[(0, 0)], 1.0);
    assert_eq!(container.history()[(0, 1)], 3.0);
    // The current state is restored afterwards.
    assert_eq!(container.state(false), &[3.0, 5.0]);
    assert_eq!(transient(&container, EntityKey::Species(0), Quantity::Concentration), 5.0);
}
