use nalgebra::DMatrix;
use tracing::{debug, instrument, warn};

use super::{evaluate_sequence, CompileState, MathContainer};
use crate::error::{MathError, Result};
use crate::event::RootToggle;
use crate::event_queue::{QueueStatus, QueuedAction};
use crate::object::ObjectIndex;

impl MathContainer {
    /// Makes the transient network consistent with the initial values and
    /// processes everything that happens at the initial time.
    #[instrument(skip_all)]
    pub fn apply_initial_values(&mut self) -> Result<QueueStatus> {
        self.require_sequences("apply initial values")?;
        self.arena.copy_initial_to_transient();
        evaluate_sequence(
            &mut self.arena,
            &mut self.stack,
            self.sequences.transient_constants.objects(),
        );
        self.reset_history();
        self.update_history_values(false)?;
        evaluate_sequence(
            &mut self.arena,
            &mut self.stack,
            self.sequences.apply_initial.objects(),
        );
        self.derive_root_states();
        evaluate_sequence(
            &mut self.arena,
            &mut self.stack,
            self.sequences.trigger.objects(),
        );

        self.queue.clear();
        for event in &mut self.events {
            for root in &mut event.roots {
                root.reset_toggle_time();
            }
        }
        let time = self.time();
        let initial: Vec<usize> = self
            .events
            .iter()
            .enumerate()
            .filter(|(_, event)| event.fire_at_initial_time && self.arena.value(event.trigger) != 0.0)
            .map(|(e, _)| e)
            .collect();
        for event in initial {
            self.fire(event, time, true)?;
        }
        let status = self.process_queue(time, true)?;

        if self.state == CompileState::UpdateSequencesBuilt {
            self.state = CompileState::InitialValuesApplied;
        }
        debug!(time, processed = status.processed, "applied initial values");
        Ok(status)
    }

    /// Toggles the roots selected by `toggles` (one entry per root, in
    /// [`Self::roots`] order) and fires every event whose trigger changed.
    #[instrument(skip(self, toggles))]
    pub fn process_roots(&mut self, equality: bool, toggles: &[RootToggle]) -> Result<()> {
        self.require_sequences("process roots")?;
        let count = self.root_count();
        if toggles.len() != count {
            return Err(MathError::DimensionMismatch {
                expected: count,
                actual: toggles.len(),
            });
        }
        let time = self.time();
        let before = self.trigger_values();
        let mut toggles = toggles.iter();
        for event in &mut self.events {
            for root in &mut event.roots {
                let Some(toggle) = toggles.next() else {
                    break;
                };
                if toggle.applies(equality, root.is_equality) && root.toggle(time) {
                    self.arena.set_value(root.root_state, root.state_value());
                }
            }
        }
        evaluate_sequence(
            &mut self.arena,
            &mut self.stack,
            self.sequences.trigger.objects(),
        );
        self.fire_changed_triggers(&before, time)
    }

    /// Executes every queued action due at `time`, including actions
    /// scheduled by the cascade they cause.
    #[instrument(skip(self))]
    pub fn process_queue(&mut self, time: f64, equality: bool) -> Result<QueueStatus> {
        self.require_sequences("process queue")?;
        let mut status = QueueStatus::default();
        loop {
            if status.processed >= self.settings.max_event_cascade {
                warn!(
                    time,
                    limit = self.settings.max_event_cascade,
                    "event cascade limit reached"
                );
                break;
            }
            evaluate_sequence(
                &mut self.arena,
                &mut self.stack,
                self.sequences.priority.objects(),
            );
            let priorities: Vec<f64> = self
                .events
                .iter()
                .map(|event| event.priority.map_or(f64::NAN, |p| self.arena.value(p)))
                .collect();
            let Some(entry) = self.queue.pop_due(time, equality, |event| {
                priorities.get(event).copied().unwrap_or(f64::NAN)
            }) else {
                break;
            };
            let (event, values) = match entry.action {
                QueuedAction::Assignment { event, values } => (event, values),
                QueuedAction::Calculation { event } => (event, self.calculate_assignment_values(event)),
            };
            status.state_changed |= self.execute_assignments(event, &values, time)?;
            status.processed += 1;
        }
        status.next_time = self.queue.next_time();
        if status.processed > 0 {
            debug!(
                processed = status.processed,
                state_changed = status.state_changed,
                "processed event queue"
            );
        }
        Ok(status)
    }

    fn trigger_values(&self) -> Vec<bool> {
        self.events
            .iter()
            .map(|event| self.arena.value(event.trigger) != 0.0)
            .collect()
    }

    /// Fires every event whose trigger differs from `before`. All changed
    /// events are fired even when one fails; the first error is returned.
    fn fire_changed_triggers(&mut self, before: &[bool], time: f64) -> Result<()> {
        let after = self.trigger_values();
        let mut first_error = None;
        for (event, (was, is)) in before.iter().zip(&after).enumerate() {
            if was != is {
                if let Err(error) = self.fire(event, time, *is) {
                    first_error.get_or_insert(error);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Schedules or cancels the actions of `event` after its trigger
    /// switched to `triggered`.
    fn fire(&mut self, event: usize, time: f64, triggered: bool) -> Result<()> {
        let Some(definition) = self.events.get(event) else {
            return Ok(());
        };
        if !triggered && !definition.is_discontinuity() {
            if !definition.persistent {
                let removed = self.queue.remove_event(event);
                debug!(event, removed, "cancelled pending actions");
            }
            return Ok(());
        }
        let (delay, delay_assignment) = (definition.delay, definition.delay_assignment);

        let Some(delay) = delay else {
            debug!(event, time, "event fired");
            self.queue.push(time, QueuedAction::Calculation { event });
            return Ok(());
        };
        evaluate_sequence(
            &mut self.arena,
            &mut self.stack,
            self.events[event].delay_sequence.objects(),
        );
        let value = self.arena.value(delay);
        if !value.is_finite() {
            return Err(MathError::NonFiniteValue {
                index: delay,
                value,
            });
        }
        debug!(event, time, delay = value, "event fired with delay");
        let action = if delay_assignment {
            QueuedAction::Assignment {
                event,
                values: self.calculate_assignment_values(event),
            }
        } else {
            QueuedAction::Calculation { event }
        };
        self.queue.push(time + value, action);
        Ok(())
    }

    fn calculate_assignment_values(&mut self, event: usize) -> Vec<f64> {
        let Some(definition) = self.events.get(event) else {
            return Vec::new();
        };
        evaluate_sequence(
            &mut self.arena,
            &mut self.stack,
            definition.assignment_sequence.objects(),
        );
        definition
            .assignments
            .iter()
            .map(|assignment| self.arena.value(assignment.value))
            .collect()
    }

    /// Assigns `values` to the targets of `event` and propagates the change.
    /// Returns whether any target changed.
    fn execute_assignments(&mut self, event: usize, values: &[f64], time: f64) -> Result<bool> {
        let Some(definition) = self.events.get(event) else {
            return Ok(false);
        };
        let targets: Vec<ObjectIndex> = definition.assignments.iter().map(|a| a.target).collect();
        if targets.len() != values.len() {
            return Err(MathError::DimensionMismatch {
                expected: targets.len(),
                actual: values.len(),
            });
        }
        let before = self.trigger_values();
        let root_values = self.roots();

        let mut changed = false;
        for (target, value) in targets.into_iter().zip(values) {
            changed |= self.arena.value(target).to_bits() != value.to_bits();
            self.arena.set_value(target, *value);
        }
        evaluate_sequence(
            &mut self.arena,
            &mut self.stack,
            self.events[event].post_assignment_sequence.objects(),
        );

        let mut position = 0;
        for math_event in &mut self.events {
            for root in &mut math_event.roots {
                let value = self.arena.value(root.root);
                if root_values.get(position).map(|v| v.to_bits()) != Some(value.to_bits()) {
                    root.derive_state(value);
                    self.arena.set_value(root.root_state, root.state_value());
                }
                position += 1;
            }
        }
        evaluate_sequence(
            &mut self.arena,
            &mut self.stack,
            self.sequences.trigger.objects(),
        );
        self.fire_changed_triggers(&before, time)?;
        Ok(changed)
    }

    fn derive_root_states(&mut self) {
        for event in &mut self.events {
            for root in &mut event.roots {
                root.derive_state(self.arena.value(root.root));
                self.arena.set_value(root.root_state, root.state_value());
            }
        }
    }

    /// Evaluates every delayed value at its history row and stores it in
    /// the delay-value objects.
    pub fn update_history_values(&mut self, reduced: bool) -> Result<()> {
        if self.delays.is_empty() {
            return Ok(());
        }
        let columns = self.groups.state_len(false);
        if self.history.shape() != (self.delays.len(), columns) {
            self.reset_history();
        }
        let range = self.state_range(false);
        let current = self.arena.values()[range.clone()].to_vec();
        let time = current[0];
        let mut row = vec![0.0; columns];
        let mut delayed = Vec::new();

        for d in 0..self.delays.len() {
            let lag_object = self.delays[d].lag;
            let lag = match self.arena.object(lag_object).and_then(|o| o.rule.as_ref()) {
                Some(rule) => rule.evaluate(self.arena.values(), &mut self.stack),
                None => self.arena.value(lag_object),
            };
            self.arena.set_value(lag_object, lag);
            if !self.recorder.interpolate(time - lag, &mut row) {
                row.copy_from_slice(&current);
            }
            for (j, value) in row.iter().enumerate() {
                self.history[(d, j)] = *value;
            }

            self.arena.values_mut()[range.clone()].copy_from_slice(&row);
            evaluate_sequence(
                &mut self.arena,
                &mut self.stack,
                self.delays[d].sequence(reduced).objects(),
            );
            for value in &self.delays[d].values {
                delayed.push((
                    value.object,
                    value.expression.evaluate(self.arena.values(), &mut self.stack),
                ));
            }
            self.arena.values_mut()[range.clone()].copy_from_slice(&current);
        }

        for (object, value) in delayed {
            self.arena.set_value(object, value);
        }
        for delay in &self.delays {
            evaluate_sequence(
                &mut self.arena,
                &mut self.stack,
                delay.sequence(reduced).objects(),
            );
        }
        Ok(())
    }

    /// Forgets recorded states and starts the history at the current state.
    fn reset_history(&mut self) {
        self.recorder.clear();
        let state = self.state(false).to_vec();
        if !self.delays.is_empty() {
            self.recorder.record(state[0], &state);
        }
        self.history = DMatrix::from_fn(self.delays.len(), state.len(), |_, j| state[j]);
    }

    /// Records the current full state for delay interpolation. Integrators
    /// call this after every accepted step.
    pub fn record_state(&mut self) {
        if self.delays.is_empty() {
            return;
        }
        let state = self.state(false).to_vec();
        self.recorder.record(state[0], &state);
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ContainerSettings;
    use crate::container::MathContainer;
    use crate::error::Result;
    use crate::event::RootToggle;
    use crate::model::{EventDefinition, Model};
    use crate::object::{DataObjectKey, EntityKey, Quantity};

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = err.to_string();
        assert!(
            message.contains(needle),
            "expected error containing '{needle}', got '{message}'"
        );
    }

    fn amount(container: &MathContainer, species: usize) -> f64 {
        let key = DataObjectKey::transient(EntityKey::Species(species), Quantity::Value);
        container.value(container.object_index(&key).expect("species amount"))
    }

    /// `X` starts at 6 and is reset to 0 once it exceeds 5.
    fn threshold(fire_at_initial_time: bool, delay: Option<&str>) -> Model {
        let mut model = Model::new("threshold");
        let cell = model.add_compartment("cell", 1.0);
        model.add_species("X", cell, 6.0);
        let mut event = EventDefinition::new("reset", "X > 5").assign("X", "0");
        event.fire_at_initial_time = fire_at_initial_time;
        event.delay = delay.map(str::to_string);
        model.add_event(event);
        model
    }

    #[test]
    fn event_fires_at_initial_time_when_requested() {
        let container = MathContainer::from_model(&threshold(true, None), ContainerSettings::default())
            .expect("model compiles");
        assert_eq!(amount(&container, 0), 0.0);
        assert!(container.queue().is_empty());
    }

    #[test]
    fn event_waits_for_trigger_change() {
        let mut container =
            MathContainer::from_model(&threshold(false, None), ContainerSettings::default())
                .expect("model compiles");
        assert_eq!(amount(&container, 0), 6.0);

        container.set_time(1.0);
        container
            .process_roots(false, &[RootToggle::ToggleBoth])
            .expect("one root");
        assert!(container.queue().is_empty());

        container.set_time(2.0);
        container
            .process_roots(false, &[RootToggle::ToggleBoth])
            .expect("one root");
        assert_eq!(container.queue().len(), 1);

        let status = container.process_queue(2.0, true).expect("queue runs");
        assert_eq!(status.processed, 1);
        assert!(status.state_changed);
        assert_eq!(amount(&container, 0), 0.0);
        assert_eq!(status.next_time, None);
    }

    #[test]
    fn delayed_event_is_scheduled_after_its_delay() {
        let mut container = MathContainer::from_model(
            &threshold(true, Some("1.5")),
            ContainerSettings::default(),
        )
        .expect("model compiles");
        assert_eq!(container.queue().next_time(), Some(1.5));
        assert_eq!(amount(&container, 0), 6.0);

        let early = container.process_queue(1.0, true).expect("queue runs");
        assert_eq!(early.processed, 0);
        assert_eq!(early.next_time, Some(1.5));

        container.set_time(1.5);
        let status = container.process_queue(1.5, true).expect("queue runs");
        assert_eq!(status.processed, 1);
        assert_eq!(amount(&container, 0), 0.0);
    }

    #[test]
    fn wrong_toggle_count_is_rejected() {
        let mut container =
            MathContainer::from_model(&threshold(false, None), ContainerSettings::default())
                .expect("model compiles");
        assert_err_contains(container.process_roots(true, &[]), "expected 1");
    }

    #[test]
    fn failing_delay_does_not_block_other_events() {
        let mut model = threshold(false, Some("0 / 0"));
        model.add_event(EventDefinition::new("also", "X > 5").assign("X", "1"));
        let mut container =
            MathContainer::from_model(&model, ContainerSettings::default()).expect("model compiles");
        let toggles = [RootToggle::ToggleBoth, RootToggle::ToggleBoth];

        container.set_time(1.0);
        container
            .process_roots(false, &toggles)
            .expect("falling triggers only cancel");
        container.set_time(2.0);
        assert_err_contains(container.process_roots(false, &toggles), "non-finite");
        assert_eq!(container.queue().len(), 1);
        assert_eq!(container.queue().next_time(), Some(2.0));
    }

    #[test]
    fn cascade_is_bounded() {
        let mut model = Model::new("cascade");
        model.add_global_quantity("n", 0.0);
        // Each event re-arms the other at the same time point.
        let mut down = EventDefinition::new("down", "n >= 0").assign("n", "-1");
        down.fire_at_initial_time = true;
        model.add_event(down);
        model.add_event(EventDefinition::new("up", "n < 0").assign("n", "0"));
        let settings = ContainerSettings {
            max_event_cascade: 3,
            ..ContainerSettings::default()
        };
        let container = MathContainer::from_model(&model, settings).expect("model compiles");
        assert_eq!(container.queue().len(), 1);
        assert_eq!(container.queue().next_time(), Some(0.0));
    }
}
