//! Expression trees over object descriptors.
//!
//! An [`Expr`] starts out with [`Expr::Variable`] leaves straight from the
//! parser. Name resolution turns those into [`Expr::Data`] leaves, which are
//! independent of the arena layout, and binding turns those into
//! [`Expr::Object`] leaves. A
//! [`MathExpression`] is a fully resolved tree together with its compiled
//! bytecode and the list of objects it reads.

use std::fmt;

use crate::equation_engine::{compile, Bytecode, VM};
use crate::error::Result;
use crate::object::{DataObjectKey, ObjectIndex};
use crate::relocation::{Relocate, RelocationSet};
use crate::traits::Scalar;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Mod,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinaryOp {
    pub fn precedence(self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Gt
            | BinaryOp::Ge
            | BinaryOp::Eq
            | BinaryOp::Ne => 3,
            BinaryOp::Add | BinaryOp::Sub => 4,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => 5,
            BinaryOp::Pow => 6,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Pow => "^",
            BinaryOp::Mod => "%",
            BinaryOp::Lt => " < ",
            BinaryOp::Le => " <= ",
            BinaryOp::Gt => " > ",
            BinaryOp::Ge => " >= ",
            BinaryOp::Eq => " == ",
            BinaryOp::Ne => " != ",
            BinaryOp::And => " && ",
            BinaryOp::Or => " || ",
        }
    }

    /// Ordering comparisons are the ones that become root functions.
    pub fn is_ordering(self) -> bool {
        matches!(
            self,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    Sin,
    Cos,
    Tan,
    Exp,
    Log,
    Sqrt,
    Abs,
    Floor,
    Ceil,
}

impl Function {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sin" => Some(Function::Sin),
            "cos" => Some(Function::Cos),
            "tan" => Some(Function::Tan),
            "exp" => Some(Function::Exp),
            "log" | "ln" => Some(Function::Log),
            "sqrt" => Some(Function::Sqrt),
            "abs" => Some(Function::Abs),
            "floor" => Some(Function::Floor),
            "ceil" | "ceiling" => Some(Function::Ceil),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Function::Sin => "sin",
            Function::Cos => "cos",
            Function::Tan => "tan",
            Function::Exp => "exp",
            Function::Log => "log",
            Function::Sqrt => "sqrt",
            Function::Abs => "abs",
            Function::Floor => "floor",
            Function::Ceil => "ceil",
        }
    }

    pub fn apply<T: Scalar>(self, x: T) -> T {
        match self {
            Function::Sin => x.sin(),
            Function::Cos => x.cos(),
            Function::Tan => x.tan(),
            Function::Exp => x.exp(),
            Function::Log => x.ln(),
            Function::Sqrt => x.sqrt(),
            Function::Abs => x.abs(),
            Function::Floor => x.floor(),
            Function::Ceil => x.ceil(),
        }
    }
}

/// Expression tree, one variant per node category.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    /// A name resolved to the model value it denotes, not yet bound to a slot.
    Data(DataObjectKey),
    Object(ObjectIndex),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Function, Box<Expr>),
    /// `if(condition, then, else)`
    Choice(Box<Expr>, Box<Expr>, Box<Expr>),
    /// `delay(value, lag)`
    Delay(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary(op, Box::new(left), Box::new(right))
    }

    pub fn call(function: Function, argument: Expr) -> Self {
        Expr::Call(function, Box::new(argument))
    }

    pub fn object(index: ObjectIndex) -> Self {
        Expr::Object(index)
    }

    /// Sum of terms; an empty sum is zero.
    pub fn sum(terms: impl IntoIterator<Item = Expr>) -> Self {
        terms
            .into_iter()
            .reduce(|acc, term| Expr::binary(BinaryOp::Add, acc, term))
            .unwrap_or(Expr::Number(0.0))
    }

    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Number(_) | Expr::Variable(_) | Expr::Data(_) | Expr::Object(_) => Vec::new(),
            Expr::Unary(_, operand) | Expr::Call(_, operand) => vec![operand],
            Expr::Binary(_, left, right) | Expr::Delay(left, right) => vec![left, right],
            Expr::Choice(condition, then, otherwise) => vec![condition, then, otherwise],
        }
    }

    pub fn children_mut(&mut self) -> Vec<&mut Expr> {
        match self {
            Expr::Number(_) | Expr::Variable(_) | Expr::Data(_) | Expr::Object(_) => Vec::new(),
            Expr::Unary(_, operand) | Expr::Call(_, operand) => vec![operand],
            Expr::Binary(_, left, right) | Expr::Delay(left, right) => vec![left, right],
            Expr::Choice(condition, then, otherwise) => vec![condition, then, otherwise],
        }
    }

    /// Visits every node, children before parents.
    pub fn visit_post_order<'a>(&'a self, visitor: &mut impl FnMut(&'a Expr)) {
        for child in self.children() {
            child.visit_post_order(visitor);
        }
        visitor(self);
    }

    /// Rewrites the tree bottom-up: `rewriter` sees each node after its
    /// children were rewritten and may replace it.
    pub fn rewrite_post_order(&mut self, rewriter: &mut impl FnMut(&mut Expr)) {
        for child in self.children_mut() {
            child.rewrite_post_order(rewriter);
        }
        rewriter(self);
    }

    /// Distinct object references in order of first appearance.
    pub fn objects(&self) -> Vec<ObjectIndex> {
        let mut found = Vec::new();
        self.visit_post_order(&mut |node| {
            if let Expr::Object(index) = node {
                if !found.contains(index) {
                    found.push(*index);
                }
            }
        });
        found
    }

    pub fn contains_delay(&self) -> bool {
        let mut found = false;
        self.visit_post_order(&mut |node| found |= matches!(node, Expr::Delay(..)));
        found
    }

    fn precedence(&self) -> u8 {
        match self {
            Expr::Binary(op, ..) => op.precedence(),
            Expr::Unary(..) => 7,
            _ => 8,
        }
    }

    fn fmt_child(&self, f: &mut fmt::Formatter<'_>, minimum: u8) -> fmt::Result {
        if self.precedence() < minimum {
            write!(f, "({self})")
        } else {
            write!(f, "{self}")
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(value) => write!(f, "{value}"),
            Expr::Variable(name) => write!(f, "{name}"),
            Expr::Data(key) => {
                write!(f, "{{{:?}.{:?}", key.entity, key.quantity)?;
                if key.initial {
                    f.write_str("(t0)")?;
                }
                f.write_str("}")
            }
            Expr::Object(index) => write!(f, "<{}>", index.index()),
            Expr::Unary(op, operand) => {
                f.write_str(match op {
                    UnaryOp::Neg => "-",
                    UnaryOp::Not => "!",
                })?;
                operand.fmt_child(f, 7)
            }
            Expr::Binary(op, left, right) => {
                let precedence = op.precedence();
                let (left_min, right_min) = if *op == BinaryOp::Pow {
                    (precedence + 1, precedence)
                } else {
                    (precedence, precedence + 1)
                };
                left.fmt_child(f, left_min)?;
                f.write_str(op.symbol())?;
                right.fmt_child(f, right_min)
            }
            Expr::Call(function, argument) => write!(f, "{}({argument})", function.name()),
            Expr::Choice(condition, then, otherwise) => {
                write!(f, "if({condition}, {then}, {otherwise})")
            }
            Expr::Delay(value, lag) => write!(f, "delay({value}, {lag})"),
        }
    }
}

impl Relocate for Expr {
    fn relocate(&mut self, relocations: &RelocationSet) {
        if let Expr::Object(index) = self {
            index.relocate(relocations);
            return;
        }
        for child in self.children_mut() {
            child.relocate(relocations);
        }
    }
}

/// A resolved expression compiled for evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct MathExpression {
    root: Expr,
    bytecode: Bytecode,
    prerequisites: Vec<ObjectIndex>,
}

impl MathExpression {
    /// Compiles a resolved tree. Unresolved variables are rejected.
    pub fn new(root: Expr) -> Result<Self> {
        let bytecode = compile(&root)?;
        let prerequisites = root.objects();
        Ok(Self {
            root,
            bytecode,
            prerequisites,
        })
    }

    pub fn constant(value: f64) -> Self {
        Self {
            bytecode: Bytecode::constant(value),
            root: Expr::Number(value),
            prerequisites: Vec::new(),
        }
    }

    pub fn root(&self) -> &Expr {
        &self.root
    }

    pub fn infix(&self) -> String {
        self.root.to_string()
    }

    pub fn prerequisites(&self) -> &[ObjectIndex] {
        &self.prerequisites
    }

    pub fn evaluate(&self, values: &[f64], stack: &mut Vec<f64>) -> f64 {
        VM::execute(&self.bytecode, values, stack)
    }

    /// Replaces the tree and recompiles.
    pub fn replace_root(&mut self, root: Expr) -> Result<()> {
        *self = Self::new(root)?;
        Ok(())
    }
}

impl Relocate for MathExpression {
    fn relocate(&mut self, relocations: &RelocationSet) {
        self.root.relocate(relocations);
        self.bytecode.relocate(relocations);
        self.prerequisites.relocate(relocations);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation_engine::parse;

    #[test]
    fn display_parenthesizes_by_precedence() {
        let expr = parse("(a + b) * c - d / (e - f)").expect("parse should succeed");
        assert_eq!(expr.to_string(), "(a+b)*c-d/(e-f)");

        let power = parse("(a ^ b) ^ c").expect("parse should succeed");
        assert_eq!(power.to_string(), "(a^b)^c");

        let right = parse("a ^ b ^ c").expect("parse should succeed");
        assert_eq!(right.to_string(), "a^b^c");
    }

    #[test]
    fn display_is_stable_for_textually_identical_sources() {
        let first = parse("floor( X*2 )").expect("parse should succeed");
        let second = parse("floor(X * 2)").expect("parse should succeed");
        assert_eq!(first.to_string(), second.to_string());
    }

    #[test]
    fn objects_are_distinct_in_first_appearance_order() {
        let expr = Expr::binary(
            BinaryOp::Add,
            Expr::binary(
                BinaryOp::Mul,
                Expr::object(ObjectIndex::new(4)),
                Expr::object(ObjectIndex::new(2)),
            ),
            Expr::object(ObjectIndex::new(4)),
        );
        assert_eq!(expr.objects(), vec![ObjectIndex::new(4), ObjectIndex::new(2)]);
    }

    #[test]
    fn math_expression_rejects_unresolved_variables() {
        let expr = parse("k * A").expect("parse should succeed");
        let err = MathExpression::new(expr).expect_err("variables must be resolved");
        assert!(format!("{err}").contains("unknown symbol 'k'"));
    }

    #[test]
    fn math_expression_evaluates_against_arena_values() {
        let expr = Expr::binary(
            BinaryOp::Mul,
            Expr::object(ObjectIndex::new(1)),
            Expr::Number(3.0),
        );
        let compiled = MathExpression::new(expr).expect("compile should succeed");
        let mut stack = Vec::new();
        assert_eq!(compiled.evaluate(&[0.0, 2.0], &mut stack), 6.0);
        assert_eq!(compiled.prerequisites(), &[ObjectIndex::new(1)]);
    }

    #[test]
    fn sum_of_no_terms_is_zero() {
        assert_eq!(Expr::sum(Vec::new()), Expr::Number(0.0));
    }
}
