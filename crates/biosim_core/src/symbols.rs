//! Name resolution from infix sources to data-object keys.

use std::collections::BTreeMap;

use crate::equation_engine::parse;
use crate::error::{MathError, Result};
use crate::expression::Expr;
use crate::model::Model;
use crate::object::{DataObjectKey, EntityKey, Quantity};

/// Names visible to model expressions.
///
/// Species shadow compartments, which shadow global quantities. Inside a
/// kinetic law the reaction's local parameters shadow everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymbolTable {
    entities: BTreeMap<String, EntityKey>,
    local_parameters: BTreeMap<(usize, String), usize>,
}

impl SymbolTable {
    pub fn from_model(model: &Model) -> Self {
        let mut entities = BTreeMap::new();
        for (i, global) in model.global_quantities.iter().enumerate() {
            entities.insert(global.name.clone(), EntityKey::GlobalQuantity(i));
        }
        for (i, compartment) in model.compartments.iter().enumerate() {
            entities.insert(compartment.name.clone(), EntityKey::Compartment(i));
        }
        for (i, species) in model.species.iter().enumerate() {
            entities.insert(species.name.clone(), EntityKey::Species(i));
        }
        let mut local_parameters = BTreeMap::new();
        for (r, reaction) in model.reactions.iter().enumerate() {
            for (p, parameter) in reaction.local_parameters.iter().enumerate() {
                local_parameters.insert((r, parameter.name.clone()), p);
            }
        }
        Self {
            entities,
            local_parameters,
        }
    }

    pub fn entity(&self, name: &str) -> Option<EntityKey> {
        self.entities.get(name).copied()
    }

    /// Key read by `name`: species denote their concentration, everything
    /// else its value.
    pub fn key(&self, name: &str, reaction: Option<usize>, initial: bool) -> Option<DataObjectKey> {
        let key = |entity, quantity| DataObjectKey {
            entity,
            quantity,
            initial,
        };
        if let Some(reaction) = reaction {
            if let Some(parameter) = self.local_parameters.get(&(reaction, name.to_string())) {
                return Some(key(
                    EntityKey::LocalParameter {
                        reaction,
                        parameter: *parameter,
                    },
                    Quantity::Value,
                ));
            }
        }
        if name == "time" {
            return Some(key(EntityKey::Model, Quantity::Value));
        }
        match self.entity(name)? {
            species @ EntityKey::Species(_) => Some(key(species, Quantity::Concentration)),
            entity => Some(key(entity, Quantity::Value)),
        }
    }

    /// Parses `source` and resolves every name to a data-object key.
    pub fn resolve(&self, source: &str, reaction: Option<usize>, initial: bool) -> Result<Expr> {
        let mut expr = parse(source)?;
        let mut missing = None;
        expr.rewrite_post_order(&mut |node| {
            if let Expr::Variable(name) = node {
                match self.key(name, reaction, initial) {
                    Some(key) => *node = Expr::Data(key),
                    None => {
                        missing.get_or_insert_with(|| name.clone());
                    }
                }
            }
        });
        match missing {
            Some(symbol) => Err(MathError::UnknownSymbol {
                symbol,
                expression: source.to_string(),
            }),
            None => Ok(expr),
        }
    }
}

/// Rewrites every key in `expr` to its initial-network counterpart.
pub fn to_initial(expr: &mut Expr) {
    expr.rewrite_post_order(&mut |node| {
        if let Expr::Data(key) = node {
            key.initial = true;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LocalParameter;

    fn model() -> Model {
        let mut model = Model::new("m");
        let cell = model.add_compartment("cell", 1.0);
        model.add_species("A", cell, 1.0);
        model.add_global_quantity("k", 0.5);
        let r = model.add_reaction("R", vec![(0, -1.0)], "k * A");
        model.reactions[r].local_parameters.push(LocalParameter {
            name: "k".to_string(),
            value: 2.0,
        });
        model
    }

    #[test]
    fn species_resolve_to_concentration() {
        let symbols = SymbolTable::from_model(&model());
        let key = symbols.key("A", None, false).expect("known species");
        assert_eq!(key.quantity, Quantity::Concentration);
        assert!(!key.initial);
        let time = symbols.key("time", None, true).expect("time is always known");
        assert_eq!(time, DataObjectKey::initial(EntityKey::Model, Quantity::Value));
    }

    #[test]
    fn local_parameters_shadow_globals_inside_their_reaction() {
        let symbols = SymbolTable::from_model(&model());
        let inside = symbols.key("k", Some(0), false).expect("local parameter");
        assert_eq!(
            inside.entity,
            EntityKey::LocalParameter {
                reaction: 0,
                parameter: 0
            }
        );
        let outside = symbols.key("k", None, false).expect("global quantity");
        assert_eq!(outside.entity, EntityKey::GlobalQuantity(0));
    }

    #[test]
    fn unknown_names_are_reported() {
        let symbols = SymbolTable::from_model(&model());
        let err = symbols.resolve("A * q", None, false).expect_err("q is unknown");
        assert_eq!(
            err,
            MathError::UnknownSymbol {
                symbol: "q".to_string(),
                expression: "A * q".to_string()
            }
        );
    }

    #[test]
    fn to_initial_flips_every_key() {
        let symbols = SymbolTable::from_model(&model());
        let mut expr = symbols.resolve("A * cell", None, false).expect("known names");
        to_initial(&mut expr);
        let mut all_initial = true;
        expr.visit_post_order(&mut |node| {
            if let Expr::Data(key) = node {
                all_initial &= key.initial;
            }
        });
        assert!(all_initial);
    }
}
