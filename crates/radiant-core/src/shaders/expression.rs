//! Shader expressions: arithmetic and logic over engine registers and tables.
//!
//! Grammar, lowest precedence first:
//! `||`, `&&`, `== !=`, `< <= > >=`, `+ -`, `* / %`, unary `-`, then primaries
//! (number, register, `table[expr]`, parenthesised expression).

use std::fmt;
use std::sync::Arc;

use super::table::{TableDefinition, TableLookup};

pub const NUM_PARMS: usize = 12;
pub const NUM_GLOBALS: usize = 8;

/// Frame-local register values an expression is evaluated against.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RegisterBank {
    /// Seconds since frame 0.
    pub time: f64,
    pub parms: [f64; NUM_PARMS],
    pub globals: [f64; NUM_GLOBALS],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    Time,
    Parm(usize),
    Global(usize),
}

impl Register {
    /// Case-insensitive register lookup (`time`, `parm0..11`, `global0..7`).
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower == "time" {
            return Some(Self::Time);
        }
        if let Some(index) = lower.strip_prefix("parm").and_then(|n| n.parse::<usize>().ok()) {
            return (index < NUM_PARMS).then_some(Self::Parm(index));
        }
        if let Some(index) = lower.strip_prefix("global").and_then(|n| n.parse::<usize>().ok()) {
            return (index < NUM_GLOBALS).then_some(Self::Global(index));
        }
        None
    }

    fn value(self, registers: &RegisterBank) -> f64 {
        match self {
            Self::Time => registers.time,
            Self::Parm(i) => registers.parms[i],
            Self::Global(i) => registers.globals[i],
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Time => f.write_str("time"),
            Self::Parm(i) => write!(f, "parm{i}"),
            Self::Global(i) => write!(f, "global{i}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinaryOp {
    fn from_symbol(symbol: &str) -> Option<Self> {
        Some(match symbol {
            "||" => Self::Or,
            "&&" => Self::And,
            "==" => Self::Equal,
            "!=" => Self::NotEqual,
            "<" => Self::Less,
            "<=" => Self::LessEqual,
            ">" => Self::Greater,
            ">=" => Self::GreaterEqual,
            "+" => Self::Add,
            "-" => Self::Sub,
            "*" => Self::Mul,
            "/" => Self::Div,
            "%" => Self::Mod,
            _ => return None,
        })
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Or => "||",
            Self::And => "&&",
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::Less => "<",
            Self::LessEqual => "<=",
            Self::Greater => ">",
            Self::GreaterEqual => ">=",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
        }
    }

    fn precedence(self) -> u8 {
        match self {
            Self::Or => 1,
            Self::And => 2,
            Self::Equal | Self::NotEqual => 3,
            Self::Less | Self::LessEqual | Self::Greater | Self::GreaterEqual => 4,
            Self::Add | Self::Sub => 5,
            Self::Mul | Self::Div | Self::Mod => 6,
        }
    }

    fn apply(self, a: f64, b: f64) -> f64 {
        let truth = |v: bool| if v { 1.0 } else { 0.0 };
        match self {
            Self::Or => truth(a != 0.0 || b != 0.0),
            Self::And => truth(a != 0.0 && b != 0.0),
            #[allow(clippy::float_cmp)]
            Self::Equal => truth(a == b),
            #[allow(clippy::float_cmp)]
            Self::NotEqual => truth(a != b),
            Self::Less => truth(a < b),
            Self::LessEqual => truth(a <= b),
            Self::Greater => truth(a > b),
            Self::GreaterEqual => truth(a >= b),
            Self::Add => a + b,
            Self::Sub => a - b,
            Self::Mul => a * b,
            Self::Div => a / b,
            // Rust's float remainder takes the sign of the dividend.
            Self::Mod => a % b,
        }
    }
}

#[derive(Clone)]
enum Expr {
    Constant(f64),
    Register(Register),
    /// Identifier that is neither a register nor a table; evaluates to zero.
    Unknown(String),
    Table {
        table: Arc<TableDefinition>,
        index: Box<Expr>,
    },
    Negate(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

impl Expr {
    fn evaluate(&self, registers: &RegisterBank) -> f64 {
        match self {
            Self::Constant(v) => *v,
            Self::Register(r) => r.value(registers),
            Self::Unknown(_) => 0.0,
            Self::Table { table, index } => table.lookup(index.evaluate(registers)),
            Self::Negate(inner) => -inner.evaluate(registers),
            Self::Binary { op, lhs, rhs } => op.apply(lhs.evaluate(registers), rhs.evaluate(registers)),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant(v) => write!(f, "{v}"),
            Self::Register(r) => write!(f, "{r}"),
            Self::Unknown(name) => f.write_str(name),
            Self::Table { table, index } => write!(f, "{}[{index}]", table.name()),
            Self::Negate(inner) => write!(f, "-{inner}"),
            Self::Binary { op, lhs, rhs } => write!(f, "({lhs} {} {rhs})", op.symbol()),
        }
    }
}

/// An immutable, cheaply clonable expression tree.
#[derive(Clone)]
pub struct ShaderExpression {
    root: Arc<Expr>,
}

impl ShaderExpression {
    /// Parses `text`; returns `None` if it is not a complete expression.
    pub fn parse(text: &str, tables: &dyn TableLookup) -> Option<Self> {
        let tokens = match lex(text) {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::debug!("[shaders] Cannot tokenise expression '{}': {}", text, e);
                return None;
            }
        };

        let mut parser = Parser { tokens, pos: 0, tables };
        match parser.parse_expression(0) {
            Ok(expr) if parser.pos == parser.tokens.len() => Some(Self { root: Arc::new(expr) }),
            Ok(_) => {
                tracing::debug!("[shaders] Trailing tokens in expression '{}'", text);
                None
            }
            Err(e) => {
                tracing::debug!("[shaders] Cannot parse expression '{}': {}", text, e);
                None
            }
        }
    }

    pub fn constant(value: f64) -> Self {
        Self {
            root: Arc::new(Expr::Constant(value)),
        }
    }

    pub fn evaluate(&self, registers: &RegisterBank) -> f64 {
        self.root.evaluate(registers)
    }

    /// Evaluates with all registers zero except `time`.
    pub fn evaluate_at(&self, time: f64) -> f64 {
        self.evaluate(&RegisterBank {
            time,
            ..Default::default()
        })
    }

    pub fn is_constant(&self) -> bool {
        matches!(*self.root, Expr::Constant(_))
    }
}

impl fmt::Display for ShaderExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.root.fmt(f)
    }
}

impl fmt::Debug for ShaderExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShaderExpression({self})")
    }
}

impl PartialEq for ShaderExpression {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

// ============================================================================
// Lexer / parser
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Symbol(&'static str),
}

const SYMBOLS: [&str; 17] = [
    "||", "&&", "==", "!=", "<=", ">=", "<", ">", "+", "-", "*", "/", "%", "(", ")", "[", "]",
];

/// Digits with an optional fraction and exponent.
fn number_end(text: &str) -> usize {
    let bytes = text.as_bytes();
    let digits = |mut i: usize| {
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        i
    };

    let mut end = digits(0);
    if end < bytes.len() && bytes[end] == b'.' {
        end = digits(end + 1);
    }
    if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exponent = end + 1;
        if exponent < bytes.len() && (bytes[exponent] == b'+' || bytes[exponent] == b'-') {
            exponent += 1;
        }
        let exponent_end = digits(exponent);
        if exponent_end > exponent {
            end = exponent_end;
        }
    }
    end
}

/// Plain identifiers are `[A-Za-z_][A-Za-z0-9_]*`. Table names may also
/// contain `/` and `.`, so the longer form is taken only before a `[`.
fn identifier_end(text: &str) -> usize {
    let short = text
        .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
        .unwrap_or(text.len());
    let long = text
        .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_' || ch == '/' || ch == '.'))
        .unwrap_or(text.len());
    if long > short && text[long..].trim_start().starts_with('[') {
        long
    } else {
        short
    }
}

fn lex(text: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut rest = text;

    while let Some(c) = rest.chars().next() {
        if c.is_whitespace() {
            rest = &rest[c.len_utf8()..];
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && rest[1..].starts_with(|n: char| n.is_ascii_digit())) {
            let end = number_end(rest);
            let value = rest[..end].parse::<f64>().map_err(|_| format!("bad number '{}'", &rest[..end]))?;
            tokens.push(Token::Number(value));
            rest = &rest[end..];
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let end = identifier_end(rest);
            tokens.push(Token::Ident(rest[..end].to_string()));
            rest = &rest[end..];
            continue;
        }

        let Some(symbol) = SYMBOLS.iter().find(|s| rest.starts_with(**s)) else {
            return Err(format!("unexpected character '{c}'"));
        };
        tokens.push(Token::Symbol(symbol));
        rest = &rest[symbol.len()..];
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    tables: &'a dyn TableLookup,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, symbol: &str) -> Result<(), String> {
        match self.next() {
            Some(Token::Symbol(s)) if s == symbol => Ok(()),
            other => Err(format!("expected '{symbol}', found {other:?}")),
        }
    }

    fn parse_expression(&mut self, min_precedence: u8) -> Result<Expr, String> {
        let mut lhs = self.parse_unary()?;

        loop {
            let Some(Token::Symbol(symbol)) = self.peek() else {
                break;
            };
            let Some(op) = BinaryOp::from_symbol(symbol) else {
                break;
            };
            if op.precedence() < min_precedence {
                break;
            }
            self.pos += 1;
            let rhs = self.parse_expression(op.precedence() + 1)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Symbol("-")) {
            self.pos += 1;
            return Ok(Expr::Negate(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Number(v)) => Ok(Expr::Constant(v)),
            Some(Token::Symbol("(")) => {
                let inner = self.parse_expression(0)?;
                self.expect(")")?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::Symbol("[")) {
                    self.pos += 1;
                    let Some(table) = self.tables.find_table(&name) else {
                        return Err(format!("unknown table '{name}'"));
                    };
                    let index = self.parse_expression(0)?;
                    self.expect("]")?;
                    return Ok(Expr::Table {
                        table,
                        index: Box::new(index),
                    });
                }
                Ok(Register::from_name(&name).map_or(Expr::Unknown(name), Expr::Register))
            }
            other => Err(format!("unexpected {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shaders::table::NoTables;

    struct OneTable(Arc<TableDefinition>);

    impl TableLookup for OneTable {
        fn find_table(&self, name: &str) -> Option<Arc<TableDefinition>> {
            self.0.name().eq_ignore_ascii_case(name).then(|| self.0.clone())
        }
    }

    fn eval(text: &str) -> f64 {
        ShaderExpression::parse(text, &NoTables).unwrap().evaluate(&RegisterBank::default())
    }

    #[test]
    fn test_arithmetic_and_logic() {
        assert!((eval("(3+3*7)-5") - 19.0).abs() < 1e-12);
        assert!((eval("3 == 3 && 1 != 0") - 1.0).abs() < 1e-12);
        assert!((eval("4 == 3 || 1 != 0") - 1.0).abs() < 1e-12);
        assert!((eval("2.3 % 2") - 0.3).abs() < 1e-9);
        assert!((eval("-3 + 5") - 2.0).abs() < 1e-12);
        assert!((eval("3 * -5") + 15.0).abs() < 1e-12);
        assert!((eval("-7 % 3") + 1.0).abs() < 1e-12);
        assert!((eval("1 < 2 == 1") - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_unspaced_division_and_exponents() {
        let expr = ShaderExpression::parse("time/2", &NoTables).unwrap();
        assert!((expr.evaluate_at(4.0) - 2.0).abs() < 1e-12);

        let mut registers = RegisterBank::default();
        registers.parms[4] = 9.0;
        let expr = ShaderExpression::parse("parm4/3.0", &NoTables).unwrap();
        assert!((expr.evaluate(&registers) - 3.0).abs() < 1e-12);

        assert!((eval("1e-3 * 1000") - 1.0).abs() < 1e-12);
        assert!((eval("2.5E+2") - 250.0).abs() < 1e-12);
        assert!((eval("1.5e2/3") - 50.0).abs() < 1e-12);
    }

    #[test]
    fn test_table_names_with_path_separators() {
        let table = TableDefinition::with_values("tables/ramp.a", true, false, vec![3.0, 5.0]);
        let tables = OneTable(Arc::new(table));
        let expr = ShaderExpression::parse("tables/ramp.a[0.5]", &tables).unwrap();
        assert!((expr.evaluate(&RegisterBank::default()) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_registers_are_case_insensitive() {
        let expr = ShaderExpression::parse("Time * PARM3 + global7", &NoTables).unwrap();
        let mut registers = RegisterBank {
            time: 2.0,
            ..Default::default()
        };
        registers.parms[3] = 4.0;
        registers.globals[7] = 1.0;
        assert!((expr.evaluate(&registers) - 9.0).abs() < 1e-12);
        assert_eq!(expr.to_string(), "((time * parm3) + global7)");
    }

    #[test]
    fn test_unknown_identifier_is_zero() {
        assert!((eval("foo + 1") - 1.0).abs() < 1e-12);
        assert!(ShaderExpression::parse("foo[1]", &NoTables).is_none());
    }

    #[test]
    fn test_invalid_input_is_absent() {
        for text in ["", "(1 + 2", "1 +", "3 $ 4", "1 2", "[1]"] {
            assert!(ShaderExpression::parse(text, &NoTables).is_none(), "{text}");
        }
    }

    #[test]
    fn test_table_lookup_expression() {
        let table = TableDefinition::with_values("decalFade", false, true, vec![0.0, 1.0]);
        let tables = OneTable(Arc::new(table));
        let expr = ShaderExpression::parse("decalFade[(time - Parm3)/(parm4 - parm3)]", &tables).unwrap();

        let mut registers = RegisterBank {
            time: 1.5,
            ..Default::default()
        };
        registers.parms[3] = 1.0;
        registers.parms[4] = 3.0;
        // u = 0.25, p = 0.5 -> halfway between 0 and 1
        assert!((expr.evaluate(&registers) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_double_negation_and_identity() {
        let mut registers = RegisterBank::default();
        registers.time = 3.7;
        for text in ["time * 2 - 1", "(time > 1) * 4", "time % 1.5"] {
            let e = ShaderExpression::parse(text, &NoTables).unwrap();
            let neg = ShaderExpression::parse(&format!("-(-({text}))"), &NoTables).unwrap();
            let plus = ShaderExpression::parse(&format!("({text}) + 0"), &NoTables).unwrap();
            let v = e.evaluate(&registers);
            assert!((neg.evaluate(&registers) - v).abs() < 1e-12);
            assert!((plus.evaluate(&registers) - v).abs() < 1e-12);
        }
    }

    #[test]
    fn test_canonical_text_reparses() {
        let expr = ShaderExpression::parse("-time*0.5 + (parm0 >= 2)", &NoTables).unwrap();
        let again = ShaderExpression::parse(&expr.to_string(), &NoTables).unwrap();
        assert_eq!(expr, again);
        assert!((expr.evaluate_at(4.0) - again.evaluate_at(4.0)).abs() < 1e-12);
    }
}
