#![no_main]

use core::fmt;

use itertools::Itertools;
use libfuzzer_sys::{arbitrary::Arbitrary, fuzz_target};

// Identifiers come from a small pool so generated programs actually hit
// bindings made by earlier statements.
#[derive(Arbitrary, Debug)]
enum Atom {
    Int(i64),
    Float(f64),
    True,
    False,
    Null,
    Str(String),
    Ident(u8),
    Builtin(u8),
}

const BUILTINS: &[&str] = &["len", "puts", "type", "clone", "first", "last", "push", "keys"];

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Atom::Int(value) => write!(f, "{}", value),
            Atom::Float(value) if value.is_finite() => write!(f, "{}", value),
            Atom::Float(_) => write!(f, "0.0"),
            Atom::True => write!(f, "true"),
            Atom::False => write!(f, "false"),
            Atom::Null => write!(f, "null"),
            Atom::Str(value) => {
                write!(f, "\"")?;
                for c in value.chars().filter(|c| c.is_ascii_alphanumeric()) {
                    write!(f, "{}", c)?;
                }
                write!(f, "\"")
            }
            Atom::Ident(id) => write!(f, "v{}", id % 8),
            Atom::Builtin(id) => write!(f, "{}", BUILTINS[*id as usize % BUILTINS.len()]),
        }
    }
}

#[derive(Arbitrary, Debug)]
enum Expr {
    Atom(Atom),
    Prefix(u8, Box<Expr>),
    Infix(u8, Box<Expr>, Box<Expr>),
    Array(Vec<Expr>),
    Table(Vec<(Expr, Expr)>),
    Index(Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),
    If(Box<Expr>, Box<Expr>, Box<Expr>),
    Fn(u8, Box<Expr>),
}

const PREFIX_OPS: &[&str] = &["-", "+", "!", "*"];
const INFIX_OPS: &[&str] = &["+", "-", "*", "/", "==", "!=", "<", ">", "|"];

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Atom(atom) => atom.fmt(f),
            Expr::Prefix(op, operand) => {
                write!(f, "({}{})", PREFIX_OPS[*op as usize % PREFIX_OPS.len()], operand)
            }
            Expr::Infix(op, left, right) => {
                write!(f, "({} {} {})", left, INFIX_OPS[*op as usize % INFIX_OPS.len()], right)
            }
            Expr::Array(elements) => write!(f, "[{}]", elements.iter().join(", ")),
            Expr::Table(pairs) => {
                let body = pairs
                    .iter()
                    .map(|(key, value)| format!("{}: {}", key, value))
                    .join(", ");
                write!(f, "{{{}}}", body)
            }
            Expr::Index(object, key) => write!(f, "({})[{}]", object, key),
            Expr::Call(callee, args) => write!(f, "({})({})", callee, args.iter().join(", ")),
            Expr::If(condition, consequence, alternative) => {
                write!(f, "if {} {{ {} }} else {{ {} }}", condition, consequence, alternative)
            }
            Expr::Fn(param, body) => write!(f, "fn(v{}) {{ {} }}", param % 8, body),
        }
    }
}

#[derive(Arbitrary, Debug)]
enum Statement {
    Let(u8, Expr),
    Return(Expr),
    Expr(Expr),
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Statement::Let(name, value) => write!(f, "let v{} = {};", name % 8, value),
            Statement::Return(value) => write!(f, "return {};", value),
            Statement::Expr(value) => write!(f, "{};", value),
        }
    }
}

fuzz_target!(|statements: Vec<Statement>| {
    let mut context = tamarin::EvaluationContext::new();

    for statement in statements {
        let statement = statement.to_string();
        let _ = context.evaluate(&statement);
    }
});
