//! Discontinuity synthesis.
//!
//! Non-smooth constructs in transient expressions (`floor`, `ceil`, `%` and
//! the condition of `if`) are replaced by discontinuity objects whose values
//! only change when a hidden event fires. Each distinct construct (by infix)
//! gets one object; each distinct derived trigger (by infix) gets one hidden
//! event shared by all constructs that map to it.

use std::f64::consts::PI;

use indexmap::IndexMap;

use crate::error::{MathError, Result};
use crate::expression::{BinaryOp, Expr, Function};
use crate::object::ObjectIndex;

#[derive(Debug, Clone, PartialEq)]
pub struct Discontinuity {
    /// Expression assigned to the discontinuity object when its event fires.
    pub value: Expr,
    /// Position of the hidden event in [`DiscontinuityRegistry::triggers`].
    pub trigger: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HiddenTrigger {
    pub trigger: Expr,
    /// Positions of the discontinuities updated by this trigger.
    pub discontinuities: Vec<usize>,
}

/// Deduplication state of one compile pass.
#[derive(Debug, Clone, Default)]
pub struct DiscontinuityRegistry {
    objects: IndexMap<String, Discontinuity>,
    triggers: IndexMap<String, HiddenTrigger>,
}

/// `sin(PI*(e)) > 0`
fn sine_condition(argument: &Expr) -> Expr {
    Expr::binary(
        BinaryOp::Gt,
        Expr::call(
            Function::Sin,
            Expr::binary(BinaryOp::Mul, Expr::Number(PI), argument.clone()),
        ),
        Expr::Number(0.0),
    )
}

fn is_replaced_whole(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::Call(Function::Floor | Function::Ceil, _) | Expr::Binary(BinaryOp::Mod, _, _)
    )
}

/// Trigger whose truth value changes whenever `expr` jumps.
pub fn derive_trigger(expr: &Expr) -> Option<Expr> {
    match expr {
        Expr::Call(Function::Floor | Function::Ceil, argument) => Some(sine_condition(argument)),
        Expr::Binary(BinaryOp::Mod, left, right) => Some(Expr::binary(
            BinaryOp::Or,
            sine_condition(left),
            sine_condition(right),
        )),
        Expr::Choice(condition, _, _) => Some((**condition).clone()),
        _ => None,
    }
}

impl DiscontinuityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn trigger_count(&self) -> usize {
        self.triggers.len()
    }

    pub fn discontinuities(&self) -> impl Iterator<Item = &Discontinuity> {
        self.objects.values()
    }

    pub fn triggers(&self) -> impl Iterator<Item = &HiddenTrigger> {
        self.triggers.values()
    }

    /// Registers every discontinuity of `expr`, outermost first.
    ///
    /// A replaced `floor`/`ceil`/`%` hides its operands; the branches of an
    /// `if` stay continuous and are scanned further.
    pub fn scan(&mut self, expr: &Expr) {
        if is_replaced_whole(expr) {
            if let Some(trigger) = derive_trigger(expr) {
                self.register(expr.clone(), trigger);
            }
            return;
        }
        if let Expr::Choice(condition, then, otherwise) = expr {
            self.register((**condition).clone(), (**condition).clone());
            self.scan(then);
            self.scan(otherwise);
            return;
        }
        for child in expr.children() {
            self.scan(child);
        }
    }

    fn register(&mut self, value: Expr, trigger: Expr) {
        let key = value.to_string();
        if self.objects.contains_key(&key) {
            return;
        }
        let trigger_key = trigger.to_string();
        let position = match self.triggers.get_index_of(&trigger_key) {
            Some(position) => position,
            None => {
                self.triggers.insert(
                    trigger_key,
                    HiddenTrigger {
                        trigger,
                        discontinuities: Vec::new(),
                    },
                );
                self.triggers.len() - 1
            }
        };
        if let Some((_, hidden)) = self.triggers.get_index_mut(position) {
            hidden.discontinuities.push(self.objects.len());
        }
        self.objects.insert(
            key,
            Discontinuity {
                value,
                trigger: position,
            },
        );
    }

    fn position(&self, value: &Expr) -> Result<usize> {
        let infix = value.to_string();
        self.objects
            .get_index_of(&infix)
            .ok_or_else(|| MathError::MalformedDiscontinuity {
                infix,
                reason: "construct was not registered during allocation".to_string(),
            })
    }

    /// Rewrites `expr` so every registered construct reads its discontinuity
    /// object. Traversal mirrors [`Self::scan`].
    pub fn replace(&self, expr: &mut Expr, object: &impl Fn(usize) -> ObjectIndex) -> Result<()> {
        if is_replaced_whole(expr) {
            let position = self.position(expr)?;
            *expr = Expr::Object(object(position));
            return Ok(());
        }
        if let Expr::Choice(condition, then, otherwise) = expr {
            let position = self.position(condition)?;
            **condition = Expr::Object(object(position));
            self.replace(then, object)?;
            return self.replace(otherwise, object);
        }
        for child in expr.children_mut() {
            self.replace(child, object)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation_engine::parse;

    fn scanned(sources: &[&str]) -> DiscontinuityRegistry {
        let mut registry = DiscontinuityRegistry::new();
        for source in sources {
            registry.scan(&parse(source).expect("parse should succeed"));
        }
        registry
    }

    #[test]
    fn identical_floor_constructs_share_object_and_event() {
        let registry = scanned(&["k * floor(X * 2)", "floor(X*2) + 1"]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.trigger_count(), 1);
    }

    #[test]
    fn floor_and_ceil_of_same_argument_share_event() {
        let registry = scanned(&["floor(X) + ceil(X)"]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.trigger_count(), 1);
        let hidden = registry.triggers().next().expect("one trigger");
        assert_eq!(hidden.discontinuities, vec![0, 1]);
    }

    #[test]
    fn modulus_trigger_is_disjunction() {
        let expr = parse("a % b").expect("parse should succeed");
        let trigger = derive_trigger(&expr).expect("mod is discontinuous");
        let text = trigger.to_string();
        assert!(text.contains("||"));
        assert_eq!(text.matches("sin(").count(), 2);
    }

    #[test]
    fn choice_condition_is_trigger_and_branches_are_scanned() {
        let registry = scanned(&["if(X > 3, floor(Y), 0)"]);
        assert_eq!(registry.len(), 2);
        let triggers: Vec<String> = registry.triggers().map(|t| t.trigger.to_string()).collect();
        assert_eq!(triggers[0], "X > 3");
    }

    #[test]
    fn replace_mirrors_scan() {
        let registry = scanned(&["if(X > 3, floor(Y), 0) + floor(Y)"]);
        let mut expr = parse("if(X > 3, floor(Y), 0) + floor(Y)").expect("parse should succeed");
        registry
            .replace(&mut expr, &|position| ObjectIndex::new(100 + position))
            .expect("all constructs registered");
        assert_eq!(expr.to_string(), "if(<100>, <101>, 0)+<101>");
    }

    #[test]
    fn replace_rejects_unregistered_construct() {
        let registry = DiscontinuityRegistry::new();
        let mut expr = parse("floor(Z)").expect("parse should succeed");
        let err = registry
            .replace(&mut expr, &ObjectIndex::new)
            .expect_err("unregistered construct");
        assert!(format!("{err}").contains("floor(Z)"));
    }
}
