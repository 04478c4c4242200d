use std::collections::HashMap;

use tracing::debug;

use crate::ast::{Node, NodeKind};

// Expansions nested past this point are almost certainly a macro that
// expands into a call to itself.
const MAX_EXPANSION_DEPTH: usize = 64;

/// Rewrites macro definitions and call sites out of a tree with a fresh
/// scope stack, returning the errors encountered.
pub fn process(node: &mut Node) -> Vec<String> {
    MacroProcessor::new().process(node)
}

/// The compile-time macro pass. It walks the tree before evaluation with a
/// scope stack of its own: macro bindings disappear from the program, calls
/// to them are replaced by their rewritten bodies, and identifiers bound in
/// macro scope are replaced by clones of the bound tree.
///
/// The processor can be kept across inputs so definitions persist, which is
/// what the REPL does.
pub struct MacroProcessor {
    scopes: Vec<HashMap<String, Node>>,
    depth: usize,
}

impl Default for MacroProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl MacroProcessor {
    pub fn new() -> Self {
        Self { scopes: vec![HashMap::new()], depth: 0 }
    }

    pub fn process(&mut self, node: &mut Node) -> Vec<String> {
        let mut errors = Vec::new();
        if let Some(replacement) = self.rewrite(node, &mut errors) {
            *node = replacement;
        }
        errors
    }

    fn set(&mut self, name: String, value: Node) {
        self.scopes
            .last_mut()
            .expect("the scope stack is never empty")
            .insert(name, value);
    }

    fn get(&self, name: &str) -> Option<&Node> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    // The visitor. Returning a node substitutes the visited one; branches
    // that return None have already walked the children they care about.
    fn rewrite(&mut self, node: &mut Node, errors: &mut Vec<String>) -> Option<Node> {
        match node {
            // `let name = macro(..) {..}` binds the macro and vanishes.
            Node::Let { pos, name, value } if value.kind() == NodeKind::MacroLit => {
                let pos = *pos;
                let bound = std::mem::replace(value.as_mut(), Node::NullLit { pos });
                debug!(name = %name, "binding macro");
                self.set(name.clone(), bound);
                Some(Node::NullLit { pos })
            }
            Node::Call { .. } => self.expand_call(node, errors),
            // Blocks open a child scope for the definitions they contain.
            Node::Block { .. } => {
                self.scopes.push(HashMap::new());
                node.mutate(&mut |child| self.rewrite(child, errors));
                self.scopes.pop();
                None
            }
            Node::Ident { name, .. } => self.get(name).cloned(),
            _ => {
                node.mutate(&mut |child| self.rewrite(child, errors));
                None
            }
        }
    }

    fn expand_call(&mut self, node: &mut Node, errors: &mut Vec<String>) -> Option<Node> {
        let Node::Call { pos, callee, args } = node else {
            return None;
        };
        let pos = *pos;

        // The callee is rewritten first, so a name bound to a macro turns
        // into the macro literal before we look at it.
        if let Some(replacement) = self.rewrite(callee, errors) {
            **callee = replacement;
        }
        let Node::MacroLit { params, body, .. } = callee.as_ref() else {
            for arg in args.iter_mut() {
                if let Some(replacement) = self.rewrite(arg, errors) {
                    *arg = replacement;
                }
            }
            return None;
        };

        if self.depth >= MAX_EXPANSION_DEPTH {
            errors.push(format!("[{}] macro expansion is nested too deeply", pos));
            return Some(Node::NullLit { pos });
        }

        // Arguments are quoted, bound by position and substituted while the
        // cloned body is rewritten; missing arguments bind to null.
        let mut scope = HashMap::new();
        for (id, param) in params.iter().enumerate() {
            let bound = match args.get_mut(id) {
                Some(arg) => {
                    let arg = std::mem::replace(arg, Node::NullLit { pos });
                    Node::Quote { pos: arg.pos(), body: Box::new(arg) }
                }
                None => Node::NullLit { pos },
            };
            scope.insert(param.clone(), bound);
        }

        let mut expansion = (**body).clone();
        self.scopes.push(scope);
        self.depth += 1;
        if let Some(replacement) = self.rewrite(&mut expansion, errors) {
            expansion = replacement;
        }
        self.depth -= 1;
        self.scopes.pop();

        Some(expansion)
    }
}
