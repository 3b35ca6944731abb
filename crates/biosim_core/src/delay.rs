//! Delayed values and their state history.

use std::collections::VecDeque;

use indexmap::IndexMap;

use crate::error::{MathError, Result};
use crate::expression::{Expr, MathExpression};
use crate::graph::{ObjectSet, UpdateSequence};
use crate::object::ObjectIndex;
use crate::relocation::{Relocate, RelocationSet};

/// One tracked value of a delay: the object holding `value(t - lag)`.
#[derive(Debug, Clone, PartialEq)]
pub struct DelayValue {
    pub object: ObjectIndex,
    pub expression: MathExpression,
}

/// All values delayed by the same lag.
#[derive(Debug, Clone, PartialEq)]
pub struct MathDelay {
    pub lag: ObjectIndex,
    pub values: Vec<DelayValue>,
    pub full_sequence: UpdateSequence,
    pub reduced_sequence: UpdateSequence,
}

impl MathDelay {
    pub fn new(lag: ObjectIndex) -> Self {
        Self {
            lag,
            values: Vec::new(),
            full_sequence: UpdateSequence::default(),
            reduced_sequence: UpdateSequence::default(),
        }
    }

    /// Objects the tracked value expressions read.
    pub fn requested(&self) -> ObjectSet {
        self.values
            .iter()
            .flat_map(|value| value.expression.prerequisites().iter().copied())
            .collect()
    }

    pub fn sequence(&self, reduced: bool) -> &UpdateSequence {
        if reduced {
            &self.reduced_sequence
        } else {
            &self.full_sequence
        }
    }
}

impl Relocate for DelayValue {
    fn relocate(&mut self, relocations: &RelocationSet) {
        self.object.relocate(relocations);
        self.expression.relocate(relocations);
    }
}

impl Relocate for MathDelay {
    fn relocate(&mut self, relocations: &RelocationSet) {
        self.lag.relocate(relocations);
        self.values.relocate(relocations);
        self.full_sequence.relocate(relocations);
        self.reduced_sequence.relocate(relocations);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LagGroup {
    pub lag: Expr,
    pub values: IndexMap<String, Expr>,
}

/// Distinct `delay(value, lag)` constructs grouped by lag infix, then by
/// value infix.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DelayScan {
    lags: IndexMap<String, LagGroup>,
}

impl DelayScan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scan(&mut self, expr: &Expr) -> Result<()> {
        let mut result = Ok(());
        expr.visit_post_order(&mut |node| {
            if result.is_err() {
                return;
            }
            if let Expr::Delay(value, lag) = node {
                result = self.register(value, lag);
            }
        });
        result
    }

    fn register(&mut self, value: &Expr, lag: &Expr) -> Result<()> {
        for part in [value, lag] {
            if part.contains_delay() {
                return Err(MathError::RecursiveDelay {
                    infix: part.to_string(),
                });
            }
        }
        let group = self
            .lags
            .entry(lag.to_string())
            .or_insert_with(|| LagGroup {
                lag: lag.clone(),
                values: IndexMap::new(),
            });
        group
            .values
            .entry(value.to_string())
            .or_insert_with(|| value.clone());
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.lags.is_empty()
    }

    pub fn lag_count(&self) -> usize {
        self.lags.len()
    }

    pub fn value_count(&self) -> usize {
        self.lags.values().map(|group| group.values.len()).sum()
    }

    pub fn groups(&self) -> impl Iterator<Item = &LagGroup> {
        self.lags.values()
    }

    /// Lag position and flat value position of a delay construct.
    pub fn position(&self, value: &Expr, lag: &Expr) -> Option<(usize, usize)> {
        let lag_position = self.lags.get_index_of(&lag.to_string())?;
        let preceding: usize = self
            .lags
            .values()
            .take(lag_position)
            .map(|group| group.values.len())
            .sum();
        let group = self.lags.get_index(lag_position)?.1;
        let value_position = group.values.get_index_of(&value.to_string())?;
        Some((lag_position, preceding + value_position))
    }

    /// Rewrites every delay construct in `expr` to the object returned by
    /// `object` for its flat value position.
    pub fn replace(&self, expr: &mut Expr, object: &impl Fn(usize) -> ObjectIndex) -> Result<()> {
        let mut result = Ok(());
        expr.rewrite_post_order(&mut |node| {
            let Expr::Delay(value, lag) = node else {
                return;
            };
            match self.position(value, lag) {
                Some((_, position)) => *node = Expr::Object(object(position)),
                None => {
                    result = Err(MathError::MissingObject {
                        segment: "delay values",
                        expected: self.value_count() + 1,
                        found: self.value_count(),
                    })
                }
            }
        });
        result
    }
}

/// Time-stamped state samples for delay interpolation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateRecorder {
    samples: VecDeque<(f64, Vec<f64>)>,
    capacity: usize,
}

impl StateRecorder {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Appends a sample. Samples at or after `time` are discarded first, so
    /// a rejected integration step can simply be recorded again.
    pub fn record(&mut self, time: f64, state: &[f64]) {
        while self.samples.back().is_some_and(|(t, _)| *t >= time) {
            self.samples.pop_back();
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((time, state.to_vec()));
    }

    /// Writes the state at `time` into `out`: linear interpolation between
    /// samples, constant extrapolation outside them. Returns false when
    /// nothing was recorded.
    pub fn interpolate(&self, time: f64, out: &mut [f64]) -> bool {
        let position = self.samples.partition_point(|(t, _)| *t < time);
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return false;
        };
        let copy = |state: &[f64], out: &mut [f64]| {
            for (target, value) in out.iter_mut().zip(state) {
                *target = *value;
            }
        };
        if position == 0 {
            copy(&first.1, out);
        } else if position == self.samples.len() {
            copy(&last.1, out);
        } else {
            let (t0, x0) = &self.samples[position - 1];
            let (t1, x1) = &self.samples[position];
            let weight = (time - t0) / (t1 - t0);
            for ((target, a), b) in out.iter_mut().zip(x0).zip(x1) {
                *target = a + weight * (b - a);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation_engine::parse;

    #[test]
    fn delays_group_by_lag_then_value() {
        let mut scan = DelayScan::new();
        scan.scan(&parse("delay(X, 2) + delay(Y, 2)").expect("parse should succeed"))
            .expect("no recursion");
        scan.scan(&parse("delay(X, 2) * delay(X, 3)").expect("parse should succeed"))
            .expect("no recursion");
        assert_eq!(scan.lag_count(), 2);
        assert_eq!(scan.value_count(), 3);

        let x = parse("X").expect("parse should succeed");
        let three = parse("3").expect("parse should succeed");
        assert_eq!(scan.position(&x, &three), Some((1, 2)));
    }

    #[test]
    fn nested_delay_is_recursive() {
        let mut scan = DelayScan::new();
        let err = scan
            .scan(&parse("delay(delay(X, 1), 2)").expect("parse should succeed"))
            .expect_err("nested delay");
        assert!(matches!(err, MathError::RecursiveDelay { .. }));
    }

    #[test]
    fn replace_rewrites_delay_nodes() {
        let mut scan = DelayScan::new();
        let mut expr = parse("k * delay(X, 2)").expect("parse should succeed");
        scan.scan(&expr).expect("no recursion");
        scan.replace(&mut expr, &|position| ObjectIndex::new(40 + position))
            .expect("registered");
        assert_eq!(expr.to_string(), "k*<40>");
        assert!(!expr.contains_delay());
    }

    #[test]
    fn recorder_interpolates_and_extrapolates() {
        let mut recorder = StateRecorder::new(8);
        let mut out = [0.0; 2];
        assert!(!recorder.interpolate(0.0, &mut out));

        recorder.record(0.0, &[0.0, 10.0]);
        recorder.record(2.0, &[4.0, 10.0]);

        assert!(recorder.interpolate(1.0, &mut out));
        assert!((out[0] - 2.0).abs() < 1e-12);
        recorder.interpolate(-5.0, &mut out);
        assert_eq!(out, [0.0, 10.0]);
        recorder.interpolate(9.0, &mut out);
        assert_eq!(out, [4.0, 10.0]);
    }

    #[test]
    fn recorder_discards_samples_after_rerecorded_time() {
        let mut recorder = StateRecorder::new(2);
        recorder.record(0.0, &[0.0]);
        recorder.record(1.0, &[1.0]);
        recorder.record(0.5, &[7.0]);
        assert_eq!(recorder.len(), 2);
        let mut out = [0.0];
        recorder.interpolate(0.5, &mut out);
        assert_eq!(out, [7.0]);
        recorder.record(1.0, &[1.0]);
        recorder.record(2.0, &[2.0]);
        assert_eq!(recorder.len(), 2);
    }
}
