use crate::error::{MathError, Result};
use crate::expression::{BinaryOp, Expr, Function, UnaryOp};
use crate::relocation::{Relocate, RelocationSet};
use crate::traits::Scalar;

/// OpCodes for the stack-based virtual machine.
/// The VM operates on a stack of `Scalar` values; booleans are 1 and 0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant `f64` value onto the stack.
    LoadConst(f64),
    /// Pushes the arena value at the given index onto the stack.
    LoadValue(usize),
    /// Pops top two values (b, a), pushes (a + b).
    Add,
    /// Pops top two values (b, a), pushes (a - b).
    Sub,
    /// Pops top two values (b, a), pushes (a * b).
    Mul,
    /// Pops top two values (b, a), pushes (a / b).
    Div,
    /// Pops top two values (b, a), pushes (a ^ b).
    Pow,
    /// Pops top two values (b, a), pushes the remainder of a / b.
    Rem,
    /// Pops top value (a), pushes -a.
    Neg,
    /// Pops top value (a), pushes 1 if a is zero and 0 otherwise.
    Not,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
    /// Pops top value (a), pushes f(a).
    Call(Function),
    /// Pops top value; jumps to the target when it is zero.
    JumpIfFalse(usize),
    Jump(usize),
}

/// Represents a compiled sequence of operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

impl Bytecode {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    pub fn constant(value: f64) -> Self {
        Self {
            ops: vec![OpCode::LoadConst(value)],
        }
    }
}

impl Relocate for Bytecode {
    fn relocate(&mut self, relocations: &RelocationSet) {
        for op in &mut self.ops {
            if let OpCode::LoadValue(index) = op {
                *index = relocations.relocate_index(*index);
            }
        }
    }
}

/// Stack-based virtual machine for evaluating expressions.
///
/// The VM is stateless; `execute` takes all necessary context:
/// - `bytecode`: Instructions to run.
/// - `values`: The arena values (read-only).
/// - `stack`: A mutable buffer for intermediate computations.
///
/// Returns the result of the evaluation (the value left on the stack).
pub struct VM;

impl VM {
    pub fn execute<T: Scalar>(bytecode: &Bytecode, values: &[T], stack: &mut Vec<T>) -> T {
        stack.clear();

        let truth = |condition: bool| if condition { T::one() } else { T::zero() };
        let mut pc = 0;
        while let Some(op) = bytecode.ops.get(pc) {
            pc += 1;
            match *op {
                OpCode::LoadConst(val) => {
                    stack.push(T::from_f64(val).unwrap_or_else(T::nan));
                }
                OpCode::LoadValue(idx) => {
                    stack.push(values.get(idx).copied().unwrap_or_else(T::nan));
                }
                OpCode::Neg => {
                    let a = pop(stack);
                    stack.push(-a);
                }
                OpCode::Not => {
                    let a = pop(stack);
                    stack.push(truth(a == T::zero()));
                }
                OpCode::Call(function) => {
                    let a = pop(stack);
                    stack.push(function.apply(a));
                }
                OpCode::JumpIfFalse(target) => {
                    if pop(stack) == T::zero() {
                        pc = target;
                    }
                }
                OpCode::Jump(target) => pc = target,
                binary => {
                    let b = pop(stack);
                    let a = pop(stack);
                    stack.push(match binary {
                        OpCode::Add => a + b,
                        OpCode::Sub => a - b,
                        OpCode::Mul => a * b,
                        OpCode::Div => a / b,
                        OpCode::Pow => a.powf(b),
                        OpCode::Rem => a % b,
                        OpCode::Lt => truth(a < b),
                        OpCode::Le => truth(a <= b),
                        OpCode::Gt => truth(a > b),
                        OpCode::Ge => truth(a >= b),
                        OpCode::Eq => truth(a == b),
                        OpCode::Ne => truth(a != b),
                        OpCode::And => truth(a != T::zero() && b != T::zero()),
                        OpCode::Or => truth(a != T::zero() || b != T::zero()),
                        _ => T::nan(),
                    });
                }
            }
        }

        stack.pop().unwrap_or_else(T::nan)
    }
}

fn pop<T: Scalar>(stack: &mut Vec<T>) -> T {
    stack.pop().unwrap_or_else(T::nan)
}

// --- Compiler ---

/// Compiles a resolved expression tree into `Bytecode`.
///
/// `delay(value, lag)` nodes evaluate their current value; the container
/// rewrites them to delay-value objects before they are ever evaluated.
pub fn compile(expr: &Expr) -> Result<Bytecode> {
    let mut ops = Vec::new();
    compile_recursive(expr, &mut ops).map_err(|symbol| MathError::UnknownSymbol {
        symbol,
        expression: expr.to_string(),
    })?;
    Ok(Bytecode { ops })
}

fn compile_recursive(expr: &Expr, ops: &mut Vec<OpCode>) -> std::result::Result<(), String> {
    match expr {
        Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
        Expr::Variable(name) => return Err(name.clone()),
        Expr::Data(key) => return Err(format!("{key:?}")),
        Expr::Object(index) => ops.push(OpCode::LoadValue(index.index())),
        Expr::Unary(op, operand) => {
            compile_recursive(operand, ops)?;
            ops.push(match op {
                UnaryOp::Neg => OpCode::Neg,
                UnaryOp::Not => OpCode::Not,
            });
        }
        Expr::Binary(op, left, right) => {
            compile_recursive(left, ops)?;
            compile_recursive(right, ops)?;
            ops.push(match op {
                BinaryOp::Add => OpCode::Add,
                BinaryOp::Sub => OpCode::Sub,
                BinaryOp::Mul => OpCode::Mul,
                BinaryOp::Div => OpCode::Div,
                BinaryOp::Pow => OpCode::Pow,
                BinaryOp::Mod => OpCode::Rem,
                BinaryOp::Lt => OpCode::Lt,
                BinaryOp::Le => OpCode::Le,
                BinaryOp::Gt => OpCode::Gt,
                BinaryOp::Ge => OpCode::Ge,
                BinaryOp::Eq => OpCode::Eq,
                BinaryOp::Ne => OpCode::Ne,
                BinaryOp::And => OpCode::And,
                BinaryOp::Or => OpCode::Or,
            });
        }
        Expr::Call(function, argument) => {
            compile_recursive(argument, ops)?;
            ops.push(OpCode::Call(*function));
        }
        Expr::Choice(condition, then, otherwise) => {
            compile_recursive(condition, ops)?;
            let branch = ops.len();
            ops.push(OpCode::JumpIfFalse(0));
            compile_recursive(then, ops)?;
            let skip = ops.len();
            ops.push(OpCode::Jump(0));
            ops[branch] = OpCode::JumpIfFalse(ops.len());
            compile_recursive(otherwise, ops)?;
            ops[skip] = OpCode::Jump(ops.len());
        }
        Expr::Delay(value, _) => compile_recursive(value, ops)?,
    }
    Ok(())
}

// --- Simple Parser ---

/// Parses a string expression into an AST.
pub fn parse(input: &str) -> Result<Expr> {
    let error = |message: String| MathError::Parse {
        expression: input.to_string(),
        message,
    };
    let tokens = tokenize(input).map_err(error)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expression().map_err(error)?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(error(format!("Unexpected trailing token {token:?}"))),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    Percent,
    LParen,
    RParen,
    Comma,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    EqualEqual,
    NotEqual,
    AndAnd,
    OrOr,
    Bang,
}

fn tokenize(input: &str) -> std::result::Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num_str = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    num_str.push(d);
                    chars.next();
                } else if (d == 'e' || d == 'E') && !num_str.contains(['e', 'E']) {
                    num_str.push(d);
                    chars.next();
                    if let Some(&sign) = chars.peek() {
                        if sign == '+' || sign == '-' {
                            num_str.push(sign);
                            chars.next();
                        }
                    }
                } else {
                    break;
                }
            }
            let value = num_str
                .parse()
                .map_err(|_| format!("Invalid number '{num_str}'"))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Identifier(ident));
        } else {
            chars.next();
            let followed_by = |chars: &mut std::iter::Peekable<std::str::Chars<'_>>, next: char| {
                if chars.peek() == Some(&next) {
                    chars.next();
                    true
                } else {
                    false
                }
            };
            let token = match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                '%' => Token::Percent,
                '(' => Token::LParen,
                ')' => Token::RParen,
                ',' => Token::Comma,
                '<' if followed_by(&mut chars, '=') => Token::LessEqual,
                '<' => Token::Less,
                '>' if followed_by(&mut chars, '=') => Token::GreaterEqual,
                '>' => Token::Greater,
                '=' if followed_by(&mut chars, '=') => Token::EqualEqual,
                '!' if followed_by(&mut chars, '=') => Token::NotEqual,
                '!' => Token::Bang,
                '&' if followed_by(&mut chars, '&') => Token::AndAnd,
                '|' if followed_by(&mut chars, '|') => Token::OrOr,
                other => return Err(format!("Unexpected character '{other}'")),
            };
            tokens.push(token);
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).cloned()
    }

    fn consume(&mut self) -> Option<Token> {
        if self.pos < self.tokens.len() {
            let t = self.tokens[self.pos].clone();
            self.pos += 1;
            Some(t)
        } else {
            None
        }
    }

    fn expect(&mut self, expected: Token) -> std::result::Result<(), String> {
        match self.consume() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(format!("Expected {expected:?}, found {token:?}")),
            None => Err(format!("Expected {expected:?}, found end of input")),
        }
    }

    fn parse_expression(&mut self) -> std::result::Result<Expr, String> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> std::result::Result<Expr, String> {
        let mut left = self.parse_and()?;
        while let Some(Token::OrOr) = self.peek() {
            self.consume();
            let right = self.parse_and()?;
            left = Expr::binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> std::result::Result<Expr, String> {
        let mut left = self.parse_comparison()?;
        while let Some(Token::AndAnd) = self.peek() {
            self.consume();
            let right = self.parse_comparison()?;
            left = Expr::binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> std::result::Result<Expr, String> {
        let left = self.parse_term()?;
        let op = match self.peek() {
            Some(Token::Less) => BinaryOp::Lt,
            Some(Token::LessEqual) => BinaryOp::Le,
            Some(Token::Greater) => BinaryOp::Gt,
            Some(Token::GreaterEqual) => BinaryOp::Ge,
            Some(Token::EqualEqual) => BinaryOp::Eq,
            Some(Token::NotEqual) => BinaryOp::Ne,
            _ => return Ok(left),
        };
        self.consume();
        let right = self.parse_term()?;
        Ok(Expr::binary(op, left, right))
    }

    fn parse_term(&mut self) -> std::result::Result<Expr, String> {
        let mut left = self.parse_factor()?;

        while let Some(token) = self.peek() {
            let op = match token {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.consume();
            let right = self.parse_factor()?;
            left = Expr::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> std::result::Result<Expr, String> {
        let mut left = self.parse_unary()?;

        while let Some(token) = self.peek() {
            let op = match token {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Mod,
                _ => break,
            };
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> std::result::Result<Expr, String> {
        match self.peek() {
            Some(Token::Minus) => {
                self.consume();
                let expr = self.parse_unary()?;
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(expr)))
            }
            Some(Token::Bang) => {
                self.consume();
                let expr = self.parse_unary()?;
                Ok(Expr::Unary(UnaryOp::Not, Box::new(expr)))
            }
            _ => self.parse_power(),
        }
    }

    /// Right-associative: `a^b^c` is `a^(b^c)`.
    fn parse_power(&mut self) -> std::result::Result<Expr, String> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(Expr::binary(BinaryOp::Pow, base, exponent));
        }
        Ok(base)
    }

    fn parse_arguments(&mut self) -> std::result::Result<Vec<Expr>, String> {
        let mut args = Vec::new();
        if let Some(Token::RParen) = self.peek() {
            self.consume();
            return Ok(args);
        }
        loop {
            args.push(self.parse_expression()?);
            match self.consume() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                _ => return Err("Expected ',' or ')'".to_string()),
            }
        }
    }

    fn parse_primary(&mut self) -> std::result::Result<Expr, String> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume(); // eat '('
                    let args = self.parse_arguments()?;
                    call(name, args)
                } else {
                    Ok(match name.as_str() {
                        "PI" | "pi" => Expr::Number(std::f64::consts::PI),
                        "true" => Expr::Number(1.0),
                        "false" => Expr::Number(0.0),
                        _ => Expr::Variable(name),
                    })
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Some(token) => Err(format!("Unexpected token {token:?}")),
            None => Err("Unexpected end of input".to_string()),
        }
    }
}

fn call(name: String, args: Vec<Expr>) -> std::result::Result<Expr, String> {
    let arity = |expected: usize| {
        if args.len() == expected {
            Ok(())
        } else {
            Err(format!(
                "Function '{name}' takes {expected} arguments, got {}",
                args.len()
            ))
        }
    };
    match name.as_str() {
        "if" | "piecewise" => {
            arity(3)?;
            let mut args = args.into_iter();
            let (Some(condition), Some(then), Some(otherwise)) = (args.next(), args.next(), args.next())
            else {
                return Err("Expected three arguments".to_string());
            };
            Ok(Expr::Choice(Box::new(condition), Box::new(then), Box::new(otherwise)))
        }
        "delay" => {
            arity(2)?;
            let mut args = args.into_iter();
            let (Some(value), Some(lag)) = (args.next(), args.next()) else {
                return Err("Expected two arguments".to_string());
            };
            Ok(Expr::Delay(Box::new(value), Box::new(lag)))
        }
        "mod" | "rem" => {
            arity(2)?;
            let mut args = args.into_iter();
            let (Some(a), Some(b)) = (args.next(), args.next()) else {
                return Err("Expected two arguments".to_string());
            };
            Ok(Expr::binary(BinaryOp::Mod, a, b))
        }
        _ => {
            let function =
                Function::from_name(&name).ok_or_else(|| format!("Unknown function: {name}"))?;
            arity(1)?;
            let argument = args
                .into_iter()
                .next()
                .ok_or_else(|| "Expected one argument".to_string())?;
            Ok(Expr::call(function, argument))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectIndex;

    fn eval(input: &str) -> f64 {
        let expr = parse(input).expect("parse should succeed");
        let bytecode = compile(&expr).expect("compile should succeed");
        let mut stack = Vec::new();
        VM::execute(&bytecode, &[] as &[f64], &mut stack)
    }

    #[test]
    fn arithmetic_respects_precedence() {
        assert_eq!(eval("1 + 2 * 3"), 7.0);
        assert_eq!(eval("(1 + 2) * 3"), 9.0);
        assert_eq!(eval("2 ^ 3 ^ 2"), 512.0);
        assert_eq!(eval("-2 ^ 2"), -4.0);
        assert_eq!(eval("7 % 3"), 1.0);
        assert_eq!(eval("1.5e2"), 150.0);
        assert_eq!(eval("2E-1"), 0.2);
    }

    #[test]
    fn logic_and_comparisons_produce_truth_values() {
        assert_eq!(eval("1 < 2"), 1.0);
        assert_eq!(eval("2 <= 1"), 0.0);
        assert_eq!(eval("1 < 2 && 3 > 4"), 0.0);
        assert_eq!(eval("1 < 2 || 3 > 4"), 1.0);
        assert_eq!(eval("!(1 == 1)"), 0.0);
        assert_eq!(eval("1 != 2"), 1.0);
    }

    #[test]
    fn choice_evaluates_only_selected_branch() {
        assert_eq!(eval("if(1 > 0, 10, 1 / 0)"), 10.0);
        assert_eq!(eval("if(0, 10, 20)"), 20.0);
        assert_eq!(eval("if(1, if(0, 1, 2), 3)"), 2.0);
    }

    #[test]
    fn functions_and_constants() {
        assert!((eval("sin(PI / 2)") - 1.0).abs() < 1e-12);
        assert_eq!(eval("floor(2.7) + ceil(2.2)"), 5.0);
        assert_eq!(eval("abs(-3)"), 3.0);
        assert_eq!(eval("mod(7, 4)"), 3.0);
    }

    #[test]
    fn load_value_reads_arena() {
        let expr = Expr::binary(
            BinaryOp::Add,
            Expr::object(ObjectIndex::new(0)),
            Expr::object(ObjectIndex::new(2)),
        );
        let bytecode = compile(&expr).expect("compile should succeed");
        let mut stack = Vec::new();
        assert_eq!(VM::execute(&bytecode, &[1.0, 5.0, 2.5], &mut stack), 3.5);
    }

    #[test]
    fn parse_errors_are_reported() {
        let err = parse("1 + $").expect_err("unknown character");
        assert!(format!("{err}").contains("Unexpected character '$'"));

        let err = parse("foo(1)").expect_err("unknown function");
        assert!(format!("{err}").contains("Unknown function: foo"));

        let err = parse("if(1, 2)").expect_err("wrong arity");
        assert!(format!("{err}").contains("takes 3 arguments"));

        let err = parse("(1 + 2").expect_err("unbalanced");
        assert!(format!("{err}").contains("Expected RParen"));

        assert!(parse("1 2").is_err());
    }

    #[test]
    fn delay_parses_to_delay_node() {
        let expr = parse("delay(X, 2)").expect("parse should succeed");
        assert!(matches!(expr, Expr::Delay(..)));
        assert_eq!(expr.to_string(), "delay(X, 2)");
    }
}
