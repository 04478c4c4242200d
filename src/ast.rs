use core::fmt;

use itertools::Itertools;

use crate::token::Position;

/// Operators as they appear in prefix and infix expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Plus,
    Minus,
    Bang,
    Asterisk,
    Slash,
    Eq,
    NotEq,
    Lt,
    Gt,
    Pipe,
    Dot,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Op::Plus => "+",
            Op::Minus => "-",
            Op::Bang => "!",
            Op::Asterisk => "*",
            Op::Slash => "/",
            Op::Eq => "==",
            Op::NotEq => "!=",
            Op::Lt => "<",
            Op::Gt => ">",
            Op::Pipe => "|",
            Op::Dot => ".",
        };
        write!(f, "{}", symbol)
    }
}

/// One `if`/`elif` arm: a condition and the block it guards.
#[derive(Debug, Clone, PartialEq)]
pub struct IfBranch {
    pub condition: Node,
    pub consequence: Node,
}

/// A single syntax-tree node. Statements and expressions share the type
/// because the macro rewriter may substitute one for the other (a macro
/// binding statement is replaced by a null literal, for instance).
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Let { pos: Position, name: String, value: Box<Node> },
    Return { pos: Position, value: Box<Node> },
    Block { pos: Position, statements: Vec<Node> },

    Ident { pos: Position, name: String },
    IntLit { pos: Position, value: i64 },
    FloatLit { pos: Position, value: f64 },
    StrLit { pos: Position, value: String },
    BoolLit { pos: Position, value: bool },
    NullLit { pos: Position },

    Prefix { pos: Position, op: Op, operand: Box<Node> },
    Infix { pos: Position, op: Op, left: Box<Node>, right: Box<Node> },
    Assign { pos: Position, target: Box<Node>, value: Box<Node> },
    Index { pos: Position, object: Box<Node>, key: Box<Node> },
    If { pos: Position, branches: Vec<IfBranch>, alternative: Option<Box<Node>> },
    FnLit { pos: Position, params: Vec<String>, body: Box<Node> },
    MacroLit { pos: Position, params: Vec<String>, body: Box<Node> },
    Call { pos: Position, callee: Box<Node>, args: Vec<Node> },
    ArrayLit { pos: Position, elements: Vec<Node> },
    TableLit { pos: Position, pairs: Vec<(Node, Node)> },
    Quote { pos: Position, body: Box<Node> },
}

/// Discriminant of a node, used where code wants to branch on the shape of a
/// child without matching every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Let,
    Return,
    Block,
    Ident,
    IntLit,
    FloatLit,
    StrLit,
    BoolLit,
    NullLit,
    Prefix,
    Infix,
    Assign,
    Index,
    If,
    FnLit,
    MacroLit,
    Call,
    ArrayLit,
    TableLit,
    Quote,
}

/// A rewriting visitor. Returning a node replaces the visited child; the
/// visitor itself decides whether to descend further by calling
/// [`Node::mutate`] on the children it wants walked before returning `None`.
pub type Visitor<'a> = dyn FnMut(&mut Node) -> Option<Node> + 'a;

fn visit(child: &mut Node, f: &mut Visitor) {
    if let Some(replacement) = f(child) {
        *child = replacement;
    }
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Let { .. } => NodeKind::Let,
            Node::Return { .. } => NodeKind::Return,
            Node::Block { .. } => NodeKind::Block,
            Node::Ident { .. } => NodeKind::Ident,
            Node::IntLit { .. } => NodeKind::IntLit,
            Node::FloatLit { .. } => NodeKind::FloatLit,
            Node::StrLit { .. } => NodeKind::StrLit,
            Node::BoolLit { .. } => NodeKind::BoolLit,
            Node::NullLit { .. } => NodeKind::NullLit,
            Node::Prefix { .. } => NodeKind::Prefix,
            Node::Infix { .. } => NodeKind::Infix,
            Node::Assign { .. } => NodeKind::Assign,
            Node::Index { .. } => NodeKind::Index,
            Node::If { .. } => NodeKind::If,
            Node::FnLit { .. } => NodeKind::FnLit,
            Node::MacroLit { .. } => NodeKind::MacroLit,
            Node::Call { .. } => NodeKind::Call,
            Node::ArrayLit { .. } => NodeKind::ArrayLit,
            Node::TableLit { .. } => NodeKind::TableLit,
            Node::Quote { .. } => NodeKind::Quote,
        }
    }

    pub fn pos(&self) -> Position {
        match self {
            Node::Let { pos, .. }
            | Node::Return { pos, .. }
            | Node::Block { pos, .. }
            | Node::Ident { pos, .. }
            | Node::IntLit { pos, .. }
            | Node::FloatLit { pos, .. }
            | Node::StrLit { pos, .. }
            | Node::BoolLit { pos, .. }
            | Node::NullLit { pos }
            | Node::Prefix { pos, .. }
            | Node::Infix { pos, .. }
            | Node::Assign { pos, .. }
            | Node::Index { pos, .. }
            | Node::If { pos, .. }
            | Node::FnLit { pos, .. }
            | Node::MacroLit { pos, .. }
            | Node::Call { pos, .. }
            | Node::ArrayLit { pos, .. }
            | Node::TableLit { pos, .. }
            | Node::Quote { pos, .. } => *pos,
        }
    }

    /// Applies `f` to every direct child slot, substituting any replacement
    /// it returns. Descent below the direct children is the visitor's job.
    pub fn mutate(&mut self, f: &mut Visitor) {
        match self {
            Node::Let { value, .. } => visit(value, f),
            Node::Return { value, .. } => visit(value, f),
            Node::Block { statements, .. } => {
                for statement in statements {
                    visit(statement, f);
                }
            }
            Node::Prefix { operand, .. } => visit(operand, f),
            Node::Infix { left, right, .. } => {
                visit(left, f);
                visit(right, f);
            }
            Node::Assign { target, value, .. } => {
                visit(target, f);
                visit(value, f);
            }
            Node::Index { object, key, .. } => {
                visit(object, f);
                visit(key, f);
            }
            Node::If { branches, alternative, .. } => {
                for branch in branches {
                    visit(&mut branch.condition, f);
                    visit(&mut branch.consequence, f);
                }
                if let Some(alternative) = alternative {
                    visit(alternative, f);
                }
            }
            Node::FnLit { body, .. } | Node::MacroLit { body, .. } => visit(body, f),
            Node::Call { callee, args, .. } => {
                visit(callee, f);
                for arg in args {
                    visit(arg, f);
                }
            }
            Node::ArrayLit { elements, .. } => {
                for element in elements {
                    visit(element, f);
                }
            }
            Node::TableLit { pairs, .. } => {
                for (key, value) in pairs {
                    visit(key, f);
                    visit(value, f);
                }
            }
            Node::Quote { body, .. } => visit(body, f),
            Node::Ident { .. }
            | Node::IntLit { .. }
            | Node::FloatLit { .. }
            | Node::StrLit { .. }
            | Node::BoolLit { .. }
            | Node::NullLit { .. } => {}
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Let { name, value, .. } => write!(f, "let {} = {};", name, value),
            Node::Return { value, .. } => write!(f, "return {};", value),
            Node::Block { statements, .. } => {
                write!(f, "{{ {} }}", statements.iter().join("; "))
            }
            Node::Ident { name, .. } => write!(f, "{}", name),
            Node::IntLit { value, .. } => write!(f, "{}", value),
            Node::FloatLit { value, .. } => write!(f, "{}", value),
            Node::StrLit { value, .. } => write!(f, "{:?}", value),
            Node::BoolLit { value, .. } => write!(f, "{}", value),
            Node::NullLit { .. } => write!(f, "null"),
            Node::Prefix { op, operand, .. } => write!(f, "({}{})", op, operand),
            Node::Infix { op, left, right, .. } => write!(f, "({} {} {})", left, op, right),
            Node::Assign { target, value, .. } => write!(f, "({} = {})", target, value),
            Node::Index { object, key, .. } => write!(f, "{}[{}]", object, key),
            Node::If { branches, alternative, .. } => {
                for (id, branch) in branches.iter().enumerate() {
                    let keyword = if id == 0 { "if" } else { " elif" };
                    write!(f, "{} {} {}", keyword, branch.condition, branch.consequence)?;
                }
                if let Some(alternative) = alternative {
                    write!(f, " else {}", alternative)?;
                }
                Ok(())
            }
            Node::FnLit { params, body, .. } => {
                write!(f, "fn({}) {}", params.iter().join(", "), body)
            }
            Node::MacroLit { params, body, .. } => {
                write!(f, "macro({}) {}", params.iter().join(", "), body)
            }
            Node::Call { callee, args, .. } => {
                write!(f, "{}({})", callee, args.iter().join(", "))
            }
            Node::ArrayLit { elements, .. } => {
                write!(f, "[{}]", elements.iter().join(", "))
            }
            Node::TableLit { pairs, .. } => {
                let body = pairs
                    .iter()
                    .map(|(key, value)| format!("{}: {}", key, value))
                    .join(", ");
                write!(f, "{{{}}}", body)
            }
            Node::Quote { body, .. } => write!(f, "quote({})", body),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(name: &str) -> Node {
        Node::Ident { pos: Position::none(), name: name.to_string() }
    }

    fn int(value: i64) -> Node {
        Node::IntLit { pos: Position::none(), value }
    }

    #[test]
    fn mutate_substitutes_children() {
        let mut node = Node::Infix {
            pos: Position::none(),
            op: Op::Plus,
            left: Box::new(ident("x")),
            right: Box::new(int(1)),
        };

        node.mutate(&mut |child| match child {
            Node::Ident { .. } => Some(int(41)),
            _ => None,
        });

        assert_eq!(node.to_string(), "(41 + 1)");
    }

    #[test]
    fn mutate_leaves_descent_to_the_visitor() {
        // The hook only touches direct children; nested nodes are reached
        // when the visitor recurses on its own.
        let mut node = Node::Prefix {
            pos: Position::none(),
            op: Op::Minus,
            operand: Box::new(Node::Prefix {
                pos: Position::none(),
                op: Op::Minus,
                operand: Box::new(ident("x")),
            }),
        };

        let mut seen = Vec::new();
        node.mutate(&mut |child| {
            seen.push(child.kind());
            None
        });
        assert_eq!(seen, vec![NodeKind::Prefix]);
    }

    #[test]
    fn display_is_source_like() {
        let node = Node::Let {
            pos: Position::none(),
            name: "x".to_string(),
            value: Box::new(Node::Infix {
                pos: Position::none(),
                op: Op::Asterisk,
                left: Box::new(int(2)),
                right: Box::new(int(3)),
            }),
        };
        assert_eq!(node.to_string(), "let x = (2 * 3);");
    }

    #[test]
    fn clone_is_deep() {
        let original = Node::ArrayLit {
            pos: Position::none(),
            elements: vec![int(1), int(2)],
        };
        let mut copy = original.clone();
        copy.mutate(&mut |child| match child {
            Node::IntLit { .. } => Some(int(9)),
            _ => None,
        });
        assert_eq!(original.to_string(), "[1, 2]");
        assert_eq!(copy.to_string(), "[9, 9]");
    }
}
