use nalgebra::{DMatrix, DVector};
use tracing::warn;

use super::{evaluate_sequence, MathContainer};
use crate::error::{MathError, Result};
use crate::jacobian::{central_difference, root_derivatives, system_jacobian};
use crate::object::ObjectIndex;
use crate::traits::DynamicalSystem;

impl MathContainer {
    /// Time followed by the continuous state coordinates.
    pub fn state(&self, reduced: bool) -> &[f64] {
        &self.arena.values()[self.state_range(reduced)]
    }

    /// Overwrites the state. Accepts either the full or the reduced length.
    pub fn set_state(&mut self, state: &[f64]) -> Result<()> {
        let full = self.groups.state_len(false);
        let reduced = self.groups.state_len(true);
        if state.len() != full && state.len() != reduced {
            return Err(MathError::DimensionMismatch {
                expected: full,
                actual: state.len(),
            });
        }
        let start = self.state_range(false).start;
        self.arena.values_mut()[start..start + state.len()].copy_from_slice(state);
        Ok(())
    }

    /// Rate of every state coordinate; the time rate is 1.
    pub fn rate(&self, reduced: bool) -> &[f64] {
        &self.arena.values()[self.rate_range(reduced)]
    }

    pub fn time(&self) -> f64 {
        self.arena.value(self.time_object())
    }

    pub fn set_time(&mut self, time: f64) {
        let index = self.time_object();
        self.arena.set_value(index, time);
    }

    pub fn root_count(&self) -> usize {
        self.events.iter().map(|event| event.roots.len()).sum()
    }

    /// Current root function values, in event order.
    pub fn roots(&self) -> Vec<f64> {
        let mut roots = vec![0.0; self.root_count()];
        self.write_roots(&mut roots);
        roots
    }

    fn write_roots(&self, out: &mut [f64]) {
        let roots = self.events.iter().flat_map(|event| event.roots.iter());
        for (target, root) in out.iter_mut().zip(roots) {
            *target = self.arena.value(root.root);
        }
    }

    /// Recomputes everything the rates and roots depend on.
    pub fn update_simulated_values(&mut self, reduced: bool) -> Result<()> {
        self.require_sequences("update simulated values")?;
        if !self.delays.is_empty() {
            self.update_history_values(reduced)?;
        }
        evaluate_sequence(
            &mut self.arena,
            &mut self.stack,
            self.sequences.simulate(reduced).objects(),
        );
        for index in self.rate_range(reduced) {
            let value = self.arena.values()[index];
            if !value.is_finite() {
                let index = ObjectIndex::new(index);
                warn!(%index, value, "non-finite rate");
                return Err(MathError::NonFiniteValue { index, value });
            }
        }
        Ok(())
    }

    /// Recomputes every transient value not already covered by the
    /// simulation sequence.
    pub fn update_transient_data_values(&mut self) -> Result<()> {
        self.require_sequences("update transient data values")?;
        evaluate_sequence(
            &mut self.arena,
            &mut self.stack,
            self.sequences.transient_data.objects(),
        );
        Ok(())
    }

    /// Recomputes the initial network from its concentrations (`intensive`)
    /// or from its amounts.
    pub fn synchronize_initial_values(&mut self, intensive: bool) -> Result<()> {
        self.require_sequences("synchronize initial values")?;
        let sequence = if intensive {
            &self.sequences.sync_initial_intensive
        } else {
            &self.sequences.sync_initial_extensive
        };
        evaluate_sequence(
            &mut self.arena,
            &mut self.stack,
            self.sequences.initial_constants.objects(),
        );
        evaluate_sequence(&mut self.arena, &mut self.stack, sequence.objects());
        Ok(())
    }

    /// Absolute tolerances of the state without time. Species amounts are
    /// scaled by their compartment volume. Without `atol` the configured
    /// absolute tolerance is used.
    pub fn initialize_atol_vector(&self, atol: Option<f64>, reduced: bool) -> Vec<f64> {
        let atol = atol.unwrap_or(self.settings.absolute_tolerance);
        self.state_range(reduced)
            .skip(1)
            .map(ObjectIndex::new)
            .map(|index| {
                let volume = self
                    .species_volumes
                    .iter()
                    .find(|(amount, _)| *amount == index)
                    .map(|(_, volume)| self.arena.value(*volume).abs());
                match volume {
                    Some(volume) if volume > 0.0 && volume.is_finite() => atol * volume,
                    _ => atol,
                }
            })
            .collect()
    }

    /// Integrator view of the state without time.
    pub fn system(&mut self, reduced: bool) -> ContainerSystem<'_> {
        ContainerSystem {
            container: self,
            reduced,
        }
    }

    /// Jacobian of the rate with respect to the state without time.
    pub fn calculate_jacobian(&mut self, reduced: bool) -> Result<DMatrix<f64>> {
        self.require_sequences("calculate jacobian")?;
        let settings = self.settings;
        let time = self.time();
        let x = self.state(reduced)[1..].to_vec();
        system_jacobian(&mut self.system(reduced), time, &x, &settings)
    }

    /// Jacobian of the root values with respect to the full state,
    /// time included as the first column.
    pub fn calculate_root_jacobian(&mut self) -> Result<DMatrix<f64>> {
        self.require_sequences("calculate root jacobian")?;
        let settings = self.settings;
        let x = self.state(false).to_vec();
        let outputs = self.root_count();
        central_difference(&x, outputs, &settings, |point, out| {
            self.set_state(point)?;
            self.update_simulated_values(false)?;
            self.write_roots(out);
            Ok(())
        })
    }

    /// Time derivatives of the roots along the current flow.
    pub fn calculate_root_derivatives(&mut self) -> Result<DVector<f64>> {
        let jacobian = self.calculate_root_jacobian()?;
        let rate = self.rate(false).to_vec();
        root_derivatives(&jacobian, &rate)
    }
}

/// A container evaluated as `dx/dt = f(t, x)` over its state without time.
pub struct ContainerSystem<'a> {
    container: &'a mut MathContainer,
    reduced: bool,
}

impl DynamicalSystem for ContainerSystem<'_> {
    fn dimension(&self) -> usize {
        self.container.groups.state_len(self.reduced) - 1
    }

    fn apply(&mut self, t: f64, x: &[f64], out: &mut [f64]) -> Result<()> {
        let dimension = self.dimension();
        if x.len() != dimension || out.len() != dimension {
            return Err(MathError::DimensionMismatch {
                expected: dimension,
                actual: x.len().min(out.len()),
            });
        }
        let start = self.container.state_range(self.reduced).start;
        let values = self.container.arena.values_mut();
        values[start] = t;
        values[start + 1..start + 1 + dimension].copy_from_slice(x);
        self.container.update_simulated_values(self.reduced)?;
        out.copy_from_slice(&self.container.rate(self.reduced)[1..]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::arena::Segment;
    use crate::config::ContainerSettings;
    use crate::container::MathContainer;
    use crate::error::Result;
    use crate::model::{EntityStatus, Model};
    use crate::object::{DataObjectKey, EntityKey, Quantity};
    use crate::traits::DynamicalSystem;

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = err.to_string();
        assert!(
            message.contains(needle),
            "expected error containing '{needle}', got '{message}'"
        );
    }

    /// A -> B with rate k*A in a compartment of volume 2.
    fn conversion() -> MathContainer {
        let mut model = Model::new("conversion");
        let cell = model.add_compartment("cell", 2.0);
        model.add_species("A", cell, 3.0);
        model.add_species("B", cell, 0.0);
        model.add_global_quantity("k", 0.5);
        let r = model.add_reaction("R", vec![(0, -1.0), (1, 1.0)], "k * A");
        model.reactions[r].compartment = Some(cell);
        MathContainer::from_model(&model, ContainerSettings::default()).expect("model compiles")
    }

    #[test]
    fn rates_follow_mass_action() {
        let mut container = conversion();
        container
            .update_simulated_values(false)
            .expect("finite rates");
        let rate = container.rate(false);
        assert_eq!(rate.len(), 3);
        assert_eq!(rate[0], 1.0);
        // flux = k * [A] * V = 0.5 * 3 * 2
        assert!((rate[1] + 3.0).abs() < 1e-12);
        assert!((rate[2] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn set_state_rejects_wrong_length() {
        let mut container = conversion();
        assert_err_contains(container.set_state(&[0.0]), "expected 3");
        container
            .set_state(&[1.0, 4.0, 2.0])
            .expect("full length accepted");
        assert_eq!(container.time(), 1.0);
        assert_eq!(container.state(false), &[1.0, 4.0, 2.0]);
    }

    #[test]
    fn jacobian_matches_linear_kinetics() {
        let mut container = conversion();
        let jacobian = container
            .calculate_jacobian(false)
            .expect("jacobian should succeed");
        assert_eq!(jacobian.shape(), (2, 2));
        // d(flux)/d(amount A) = k * V / V
        assert!((jacobian[(0, 0)] + 0.5).abs() < 1e-6);
        assert!((jacobian[(1, 0)] - 0.5).abs() < 1e-6);
        assert!(jacobian[(0, 1)].abs() < 1e-9);
        // The unperturbed state is restored.
        assert_eq!(container.state(false)[1], 6.0);
    }

    #[test]
    fn atol_scales_species_by_volume() {
        let container = conversion();
        let atol = container.initialize_atol_vector(Some(1e-6), false);
        assert_eq!(atol.len(), 2);
        assert!((atol[0] - 2e-6).abs() < 1e-18);

        let configured = container.initialize_atol_vector(None, false);
        assert!((configured[1] - 2e-12).abs() < 1e-24);
    }

    #[test]
    fn system_exposes_state_without_time() {
        let mut container = conversion();
        let mut system = container.system(false);
        assert_eq!(system.dimension(), 2);
        let mut out = [0.0; 2];
        system
            .apply(0.0, &[2.0, 0.0], &mut out)
            .expect("apply should succeed");
        assert!((out[0] + 1.0).abs() < 1e-12);
        assert_err_contains(system.apply(0.0, &[1.0], &mut out), "dimension mismatch");
    }

    #[test]
    fn failed_jacobian_restores_the_state() {
        let mut model = Model::new("root");
        let cell = model.add_compartment("cell", 1.0);
        let a = model.add_species("A", cell, 0.0);
        model.species[a].status = EntityStatus::Ode;
        model.species[a].expression = Some("sqrt(A)".to_string());
        let mut container =
            MathContainer::from_model(&model, ContainerSettings::default()).expect("model compiles");
        assert_eq!(container.state(false), &[0.0, 0.0]);

        // The backward step leaves the domain of sqrt.
        assert_err_contains(container.calculate_jacobian(false), "non-finite");
        assert_eq!(container.state(false), &[0.0, 0.0]);
        assert_eq!(container.rate(false)[1], 0.0);
    }

    #[test]
    fn non_finite_rate_is_reported() {
        let mut model = Model::new("blowup");
        let cell = model.add_compartment("cell", 1.0);
        let a = model.add_species("A", cell, 0.0);
        model.species[a].status = EntityStatus::Ode;
        model.species[a].expression = Some("1 / A".to_string());
        let mut container =
            MathContainer::from_model(&model, ContainerSettings::default()).expect("model compiles");
        assert_err_contains(container.update_simulated_values(false), "non-finite");
    }

    #[test]
    fn initial_values_synchronize_from_concentrations() {
        let mut container = conversion();
        let layout = container.layout().clone();
        let key = DataObjectKey::initial(EntityKey::Species(0), Quantity::Concentration);
        let concentration = container.object_index(&key).expect("initial concentration");
        container.set_value(concentration, 5.0);
        container
            .synchronize_initial_values(true)
            .expect("sequences built");
        let amount = container
            .math_object_for_value(concentration.index())
            .and_then(|object| object.corresponding)
            .expect("amount partner");
        assert!(layout.range(Segment::InitialExtensiveValues).contains(&amount.index()));
        assert_eq!(container.value(amount), 10.0);
    }
}
