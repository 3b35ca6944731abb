//! Events and root processors.
//!
//! A trigger is split into root functions, one per ordering comparison. The
//! transient trigger is then a logical expression over root-state objects,
//! so its value only changes when a root processor toggles.

use serde::{Deserialize, Serialize};

use crate::expression::{BinaryOp, Expr};
use crate::graph::{ObjectSet, UpdateSequence};
use crate::object::ObjectIndex;
use crate::relocation::{Relocate, RelocationSet};

/// Which roots an integrator asks to toggle after locating a crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RootToggle {
    NoToggle,
    ToggleEquality,
    ToggleInequality,
    ToggleBoth,
}

impl RootToggle {
    /// Whether a root with the given `is_equality` flag toggles when the
    /// boundary reached is an equality (`equality == true`) or not.
    pub fn applies(self, equality: bool, root_is_equality: bool) -> bool {
        match self {
            RootToggle::NoToggle => false,
            RootToggle::ToggleBoth => true,
            RootToggle::ToggleEquality => equality && root_is_equality,
            RootToggle::ToggleInequality => !equality && !root_is_equality,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RootProcessor {
    /// Root function object; its sign encodes the comparison.
    pub root: ObjectIndex,
    /// Truth value of the comparison as seen by the transient trigger.
    pub root_state: ObjectIndex,
    /// `>=` and `<=` are true on the boundary itself.
    pub is_equality: bool,
    pub discrete: bool,
    pub time_dependent: bool,
    state: bool,
    last_toggle_time: f64,
}

impl RootProcessor {
    pub fn new(root: ObjectIndex, root_state: ObjectIndex, is_equality: bool) -> Self {
        Self {
            root,
            root_state,
            is_equality,
            discrete: false,
            time_dependent: false,
            state: false,
            last_toggle_time: f64::NAN,
        }
    }

    pub fn state(&self) -> bool {
        self.state
    }

    pub fn state_value(&self) -> f64 {
        if self.state {
            1.0
        } else {
            0.0
        }
    }

    /// Sets the state from the root value; returns whether it changed.
    pub fn derive_state(&mut self, value: f64) -> bool {
        let state = if self.is_equality {
            value >= 0.0
        } else {
            value > 0.0
        };
        let changed = state != self.state;
        self.state = state;
        changed
    }

    /// Flips the state unless it was already flipped at `time`.
    pub fn toggle(&mut self, time: f64) -> bool {
        if self.last_toggle_time == time {
            return false;
        }
        self.state = !self.state;
        self.last_toggle_time = time;
        true
    }

    pub fn reset_toggle_time(&mut self) {
        self.last_toggle_time = f64::NAN;
    }
}

impl Relocate for RootProcessor {
    fn relocate(&mut self, relocations: &RelocationSet) {
        self.root.relocate(relocations);
        self.root_state.relocate(relocations);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// Event defined by the model, with its position in the model.
    Model(usize),
    /// Hidden event keeping discontinuity objects current.
    Discontinuity,
    /// Event added at runtime for analysis, with its creation number.
    Analysis(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventAssignment {
    pub target: ObjectIndex,
    /// Object computing the value to assign.
    pub value: ObjectIndex,
}

impl Relocate for EventAssignment {
    fn relocate(&mut self, relocations: &RelocationSet) {
        self.target.relocate(relocations);
        self.value.relocate(relocations);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MathEvent {
    pub kind: EventKind,
    pub trigger: ObjectIndex,
    pub initial_trigger: ObjectIndex,
    pub delay: Option<ObjectIndex>,
    pub priority: Option<ObjectIndex>,
    pub assignments: Vec<EventAssignment>,
    pub roots: Vec<RootProcessor>,
    pub persistent: bool,
    pub delay_assignment: bool,
    pub fire_at_initial_time: bool,
    pub delay_sequence: UpdateSequence,
    pub assignment_sequence: UpdateSequence,
    pub post_assignment_sequence: UpdateSequence,
}

impl MathEvent {
    pub fn new(kind: EventKind, trigger: ObjectIndex, initial_trigger: ObjectIndex) -> Self {
        Self {
            kind,
            trigger,
            initial_trigger,
            delay: None,
            priority: None,
            assignments: Vec::new(),
            roots: Vec::new(),
            persistent: true,
            delay_assignment: true,
            fire_at_initial_time: false,
            delay_sequence: UpdateSequence::default(),
            assignment_sequence: UpdateSequence::default(),
            post_assignment_sequence: UpdateSequence::default(),
        }
    }

    pub fn is_discontinuity(&self) -> bool {
        self.kind == EventKind::Discontinuity
    }

    pub fn targets(&self) -> ObjectSet {
        self.assignments.iter().map(|a| a.target).collect()
    }

    pub fn assignment_values(&self) -> ObjectSet {
        self.assignments.iter().map(|a| a.value).collect()
    }
}

impl Relocate for MathEvent {
    fn relocate(&mut self, relocations: &RelocationSet) {
        self.trigger.relocate(relocations);
        self.initial_trigger.relocate(relocations);
        self.delay.relocate(relocations);
        self.priority.relocate(relocations);
        self.assignments.relocate(relocations);
        self.roots.relocate(relocations);
        self.delay_sequence.relocate(relocations);
        self.assignment_sequence.relocate(relocations);
        self.post_assignment_sequence.relocate(relocations);
    }
}

/// Number of root functions `trigger` decomposes into.
pub fn count_roots(trigger: &Expr) -> usize {
    let mut count = 0;
    trigger.visit_post_order(&mut |node| {
        if let Expr::Binary(op, _, _) = node {
            if op.is_ordering() {
                count += 1;
            }
        }
    });
    count
}

/// Replaces every ordering comparison by the root-state object returned by
/// `root`, which receives the root function and its `is_equality` flag.
/// Roots are produced in the same order [`count_roots`] counts them.
pub fn split_roots(trigger: &mut Expr, root: &mut impl FnMut(Expr, bool) -> ObjectIndex) {
    trigger.rewrite_post_order(&mut |node| {
        let Expr::Binary(op, left, right) = node else {
            return;
        };
        let (function, is_equality) = match op {
            BinaryOp::Gt => (Expr::binary(BinaryOp::Sub, (**left).clone(), (**right).clone()), false),
            BinaryOp::Ge => (Expr::binary(BinaryOp::Sub, (**left).clone(), (**right).clone()), true),
            BinaryOp::Lt => (Expr::binary(BinaryOp::Sub, (**right).clone(), (**left).clone()), false),
            BinaryOp::Le => (Expr::binary(BinaryOp::Sub, (**right).clone(), (**left).clone()), true),
            _ => return,
        };
        *node = Expr::Object(root(function, is_equality));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation_engine::parse;

    #[test]
    fn toggle_rules_match_boundary_type() {
        assert!(RootToggle::ToggleBoth.applies(false, true));
        assert!(RootToggle::ToggleEquality.applies(true, true));
        assert!(!RootToggle::ToggleEquality.applies(true, false));
        assert!(RootToggle::ToggleInequality.applies(false, false));
        assert!(!RootToggle::ToggleInequality.applies(true, false));
        assert!(!RootToggle::NoToggle.applies(true, true));
    }

    #[test]
    fn toggle_is_idempotent_at_same_time() {
        let mut root = RootProcessor::new(ObjectIndex::new(0), ObjectIndex::new(1), false);
        assert!(root.toggle(1.0));
        assert!(root.state());
        assert!(!root.toggle(1.0));
        assert!(root.state());
        assert!(root.toggle(2.0));
        assert!(!root.state());
    }

    #[test]
    fn equality_roots_are_true_on_boundary() {
        let mut strict = RootProcessor::new(ObjectIndex::new(0), ObjectIndex::new(1), false);
        let mut equal = RootProcessor::new(ObjectIndex::new(2), ObjectIndex::new(3), true);
        strict.derive_state(0.0);
        equal.derive_state(0.0);
        assert!(!strict.state());
        assert!(equal.state());
    }

    #[test]
    fn split_roots_orients_root_functions() {
        let mut trigger = parse("X > 5 && Y <= 2").expect("parse should succeed");
        assert_eq!(count_roots(&trigger), 2);
        let mut roots = Vec::new();
        split_roots(&mut trigger, &mut |function, is_equality| {
            roots.push((function.to_string(), is_equality));
            ObjectIndex::new(10 + roots.len())
        });
        assert_eq!(
            roots,
            vec![("X-5".to_string(), false), ("2-Y".to_string(), true)]
        );
        assert_eq!(trigger.to_string(), "<11> && <12>");
    }

    #[test]
    fn equality_comparisons_are_not_roots() {
        let trigger = parse("X == 5 || Y != 1").expect("parse should succeed");
        assert_eq!(count_roots(&trigger), 0);
    }
}
