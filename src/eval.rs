use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use tracing::trace;

use crate::{
    ast::{IfBranch, Node, Op},
    env::Env,
    token::Position,
    value::{slot, Closure, ContCall, Table, Value},
};

// Bounds host-stack recursion on hostile input; calls in tail position are
// unwound iteratively and do not count against it.
const MAX_EVAL_DEPTH: usize = 512;

thread_local! {
    static EVAL_DEPTH: Cell<usize> = const { Cell::new(0) };
}

struct DepthGuard;

impl DepthGuard {
    fn enter(pos: Position) -> Result<DepthGuard, Value> {
        EVAL_DEPTH.with(|depth| {
            if depth.get() >= MAX_EVAL_DEPTH {
                return Err(Value::error(pos, "evaluation is nested too deeply"));
            }
            depth.set(depth.get() + 1);
            Ok(DepthGuard)
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        EVAL_DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

/// Evaluates a whole program in the given environment. A top-level `return`
/// ends the program early with its payload.
pub fn eval_program(statements: &[Node], env: &Rc<Env>) -> Value {
    match eval_statements(statements, env) {
        Value::Return(inner) => *inner,
        other => other,
    }
}

// Statements run in order; the first return marker or error wins, otherwise
// the list is worth its last statement.
fn eval_statements(statements: &[Node], env: &Rc<Env>) -> Value {
    let mut result = Value::Null;
    for statement in statements {
        let value = eval(statement, env);
        match value {
            Value::Return(_) | Value::Error(_) => return value,
            other => result = other,
        }
    }
    result
}

/// Evaluates a single node to a value. Errors are values too: any operand
/// that evaluates to one short-circuits the enclosing expression.
pub fn eval(node: &Node, env: &Rc<Env>) -> Value {
    let _guard = match DepthGuard::enter(node.pos()) {
        Ok(guard) => guard,
        Err(error) => return error,
    };

    match node {
        Node::Let { name, value, .. } => {
            let value = eval(value, env);
            if interrupts(&value) {
                return value;
            }
            env.set(name.clone(), value);
            Value::Null
        }
        Node::Return { value, .. } => wrap_return(eval(value, env)),
        Node::Block { statements, .. } => eval_scoped(statements, env, false),
        Node::Ident { pos, name } => match env.get(name) {
            Some(value) => value,
            None => Value::error(*pos, format!("Identifier not found '{}'", name)),
        },
        Node::IntLit { value, .. } => Value::Int(*value),
        Node::FloatLit { value, .. } => Value::Float(*value),
        Node::StrLit { value, .. } => Value::string(value),
        Node::BoolLit { value, .. } => Value::Bool(*value),
        Node::NullLit { .. } => Value::Null,
        Node::Prefix { pos, op, operand } => {
            let operand = eval(operand, env).unref();
            if interrupts(&operand) {
                return operand;
            }
            eval_prefix(*pos, *op, operand)
        }
        Node::Infix { pos, op: Op::Dot, left, right } => eval_member(*pos, left, right, env),
        Node::Infix { pos, op: Op::Pipe, left, right } => eval_pipe(*pos, left, right, env),
        Node::Infix { pos, op, left, right } => {
            let left = eval(left, env).unref();
            if interrupts(&left) {
                return left;
            }
            let right = eval(right, env).unref();
            if interrupts(&right) {
                return right;
            }
            eval_binary(*pos, *op, left, right)
        }
        Node::Assign { pos, target, value } => eval_assign(*pos, target, value, env),
        Node::Index { pos, object, key } => {
            let object = eval(object, env).unref();
            if interrupts(&object) {
                return object;
            }
            let key = eval(key, env).unref();
            if interrupts(&key) {
                return key;
            }
            eval_index(*pos, object, key)
        }
        Node::If { branches, alternative, .. } => {
            eval_if(branches, alternative.as_deref(), env, false)
        }
        Node::FnLit { params, body, .. } => Value::Function(Rc::new(Closure::new(
            env,
            Rc::new(params.clone()),
            Rc::new((**body).clone()),
        ))),
        Node::MacroLit { pos, .. } => {
            Value::error(*pos, "macro literal outside of macro expansion")
        }
        Node::Call { pos, callee, args } => {
            let callee = eval(callee, env).unref();
            if interrupts(&callee) {
                return callee;
            }
            let args = match eval_args(args, env) {
                Ok(args) => args,
                Err(error) => return error,
            };
            apply(callee, args, env, *pos)
        }
        Node::ArrayLit { elements, .. } => {
            let mut values = Vec::with_capacity(elements.len());
            for element in elements {
                let value = eval(element, env);
                if interrupts(&value) {
                    return value;
                }
                values.push(value.unref());
            }
            Value::array(values)
        }
        Node::TableLit { pairs, .. } => {
            let mut table = Table::new();
            for (key, value) in pairs {
                let key = eval(key, env).unref();
                if interrupts(&key) {
                    return key;
                }
                let value = eval(value, env).unref();
                if interrupts(&value) {
                    return value;
                }
                table.insert(&key, value);
            }
            Value::Table(Rc::new(RefCell::new(table)))
        }
        Node::Quote { body, .. } => eval(body, env),
    }
}

fn wrap_return(value: Value) -> Value {
    match value {
        // Already-wrapped values pass through, so nested returns collapse.
        Value::Return(_) | Value::Error(_) => value,
        other => Value::Return(Box::new(other)),
    }
}

// Errors poison the enclosing expression; return markers coming out of an
// `if` or block expression unwind the same way until a call boundary
// unwraps them.
fn interrupts(value: &Value) -> bool {
    matches!(value, Value::Return(_) | Value::Error(_))
}

// Arguments evaluate left to right in the caller's environment; the first
// error aborts the whole call.
fn eval_args(args: &[Node], env: &Rc<Env>) -> Result<Vec<Value>, Value> {
    let mut values = Vec::with_capacity(args.len());
    for arg in args {
        let value = eval(arg, env);
        if interrupts(&value) {
            return Err(value);
        }
        values.push(value);
    }
    Ok(values)
}

fn eval_scoped(statements: &[Node], env: &Rc<Env>, tail: bool) -> Value {
    let scope = Env::child(env);
    scope.lock();
    let result = if tail {
        eval_body(statements, &scope)
    } else {
        eval_statements(statements, &scope)
    };
    scope.unlock();
    scope.drop_scope();
    result
}

fn eval_if(
    branches: &[IfBranch],
    alternative: Option<&Node>,
    env: &Rc<Env>,
    tail: bool,
) -> Value {
    for branch in branches {
        let condition = eval(&branch.condition, env).unref();
        if interrupts(&condition) {
            return condition;
        }
        match condition {
            Value::Bool(true) => return eval_branch(&branch.consequence, env, tail),
            Value::Bool(false) => continue,
            _ => return Value::error(branch.condition.pos(), "condition must be boolean"),
        }
    }
    match alternative {
        Some(block) => eval_branch(block, env, tail),
        None => Value::Null,
    }
}

fn eval_branch(block: &Node, env: &Rc<Env>, tail: bool) -> Value {
    match block {
        Node::Block { statements, .. } => eval_scoped(statements, env, tail),
        other => eval(other, env),
    }
}

// A function body: every statement but the last runs normally, the last is
// evaluated in tail position so a closing call becomes a deferred one.
fn eval_body(statements: &[Node], env: &Rc<Env>) -> Value {
    let Some((last, init)) = statements.split_last() else {
        return Value::Null;
    };
    for statement in init {
        let value = eval(statement, env);
        if matches!(value, Value::Return(_) | Value::Error(_)) {
            return value;
        }
    }
    eval_tail(last, env)
}

fn eval_tail(node: &Node, env: &Rc<Env>) -> Value {
    match node {
        Node::Call { pos, callee, args } => {
            let callee = eval(callee, env).unref();
            if interrupts(&callee) {
                return callee;
            }
            let args = match eval_args(args, env) {
                Ok(args) => args,
                Err(error) => return error,
            };
            match callee {
                Value::Function(_) | Value::Builtin(_) => Value::ContCall(Box::new(ContCall {
                    callee,
                    args,
                    env: Rc::clone(env),
                })),
                other => Value::error(*pos, format!("{} is not a function", other.type_name())),
            }
        }
        Node::Return { value, .. } => wrap_return(eval_tail(value, env)),
        Node::If { branches, alternative, .. } => {
            eval_if(branches, alternative.as_deref(), env, true)
        }
        Node::Block { statements, .. } => eval_scoped(statements, env, true),
        other => eval(other, env),
    }
}

/// Applies a callee to already-evaluated arguments. Runs the trampoline:
/// a body whose tail produced a deferred call is continued here instead of
/// recursing, and return markers are unwrapped at this boundary.
pub fn apply(callee: Value, args: Vec<Value>, env: &Rc<Env>, pos: Position) -> Value {
    let mut current = Value::ContCall(Box::new(ContCall {
        callee,
        args,
        env: Rc::clone(env),
    }));
    loop {
        match current {
            Value::ContCall(deferred) => current = apply_step(*deferred, pos),
            Value::Return(inner) => current = *inner,
            other => return other,
        }
    }
}

fn apply_step(deferred: ContCall, pos: Position) -> Value {
    let ContCall { callee, args, env } = deferred;
    match callee {
        Value::Builtin(builtin) => (builtin.call)(&args, &env, pos),
        Value::Function(closure) => {
            let Some(captured) = closure.env() else {
                return Value::error(pos, "function environment is gone");
            };
            trace!(params = closure.params.len(), args = args.len(), "applying function");

            let scope = Env::child(&captured);
            scope.lock();
            // Parameters bind positionally; missing arguments become null
            // and extras are discarded.
            for (id, param) in closure.params.iter().enumerate() {
                scope.set(param.clone(), args.get(id).cloned().unwrap_or(Value::Null));
            }

            let result = match closure.body.as_ref() {
                Node::Block { statements, .. } => eval_body(statements, &scope),
                other => eval_tail(other, &scope),
            };
            scope.unlock();
            scope.drop_scope();
            result
        }
        Value::Error(_) => callee,
        other => Value::error(pos, format!("{} is not a function", other.type_name())),
    }
}

fn eval_prefix(pos: Position, op: Op, operand: Value) -> Value {
    match (op, &operand) {
        (Op::Minus, Value::Int(value)) => match value.checked_neg() {
            Some(negated) => Value::Int(negated),
            None => Value::error(pos, "integer overflow"),
        },
        (Op::Minus, Value::Float(value)) => Value::Float(-value),
        (Op::Plus, Value::Int(_) | Value::Float(_)) => operand,
        (Op::Bang, Value::Bool(value)) => Value::Bool(!value),
        (Op::Asterisk, Value::Array(values)) => Value::Int(values.borrow().len() as i64),
        (Op::Asterisk, Value::Table(table)) => Value::Int(table.borrow().len() as i64),
        _ => Value::error(
            pos,
            format!(
                "Prefix operator '{}' is not defined for {}",
                op,
                operand.type_name()
            ),
        ),
    }
}

fn eval_binary(pos: Position, op: Op, left: Value, right: Value) -> Value {
    match (&left, &right) {
        (Value::Int(a), Value::Int(b)) => eval_int_op(pos, op, *a, *b),
        (Value::Int(a), Value::Float(b)) => eval_float_op(pos, op, *a as f64, *b, &left, &right),
        (Value::Float(a), Value::Int(b)) => eval_float_op(pos, op, *a, *b as f64, &left, &right),
        (Value::Float(a), Value::Float(b)) => eval_float_op(pos, op, *a, *b, &left, &right),
        (Value::Str(a), Value::Str(b)) => match op {
            Op::Plus => Value::string(format!("{}{}", a, b)),
            Op::Eq => Value::Bool(a == b),
            Op::NotEq => Value::Bool(a != b),
            _ => undefined_infix(pos, op, &left, &right),
        },
        (Value::Bool(a), Value::Bool(b)) => match op {
            Op::Eq => Value::Bool(a == b),
            Op::NotEq => Value::Bool(a != b),
            _ => undefined_infix(pos, op, &left, &right),
        },
        (Value::Array(a), Value::Array(b)) => match op {
            Op::Plus => {
                let mut joined = Vec::with_capacity(a.borrow().len() + b.borrow().len());
                for cell in a.borrow().iter().chain(b.borrow().iter()) {
                    joined.push(slot(cell.borrow().clone()));
                }
                Value::Array(Rc::new(std::cell::RefCell::new(joined)))
            }
            Op::Eq => Value::Bool(left.equal(&right)),
            Op::NotEq => Value::Bool(!left.equal(&right)),
            _ => undefined_infix(pos, op, &left, &right),
        },
        (Value::Table(a), Value::Table(b)) => match op {
            Op::Plus => {
                // Merge builds a fresh table; conflicting keys take the
                // right operand's value. Entries from both sides are cloned
                // the same way array concatenation clones elements.
                let mut merged = Table::new();
                for (key, value) in a.borrow().iter().chain(b.borrow().iter()) {
                    merged.insert(key, value.borrow().clone());
                }
                Value::Table(Rc::new(std::cell::RefCell::new(merged)))
            }
            Op::Eq => Value::Bool(left.equal(&right)),
            Op::NotEq => Value::Bool(!left.equal(&right)),
            _ => undefined_infix(pos, op, &left, &right),
        },
        _ => undefined_infix(pos, op, &left, &right),
    }
}

fn eval_int_op(pos: Position, op: Op, a: i64, b: i64) -> Value {
    let checked = match op {
        Op::Plus => a.checked_add(b),
        Op::Minus => a.checked_sub(b),
        Op::Asterisk => a.checked_mul(b),
        Op::Slash => {
            if b == 0 {
                return Value::error(pos, "division by zero");
            }
            a.checked_div(b)
        }
        Op::Eq => return Value::Bool(a == b),
        Op::NotEq => return Value::Bool(a != b),
        Op::Lt => return Value::Bool(a < b),
        Op::Gt => return Value::Bool(a > b),
        _ => {
            return undefined_infix(pos, op, &Value::Int(a), &Value::Int(b));
        }
    };
    match checked {
        Some(value) => Value::Int(value),
        None => Value::error(pos, "integer overflow"),
    }
}

// Mixed int/float operands widen to float.
fn eval_float_op(pos: Position, op: Op, a: f64, b: f64, left: &Value, right: &Value) -> Value {
    match op {
        Op::Plus => Value::Float(a + b),
        Op::Minus => Value::Float(a - b),
        Op::Asterisk => Value::Float(a * b),
        Op::Slash => Value::Float(a / b),
        Op::Eq => Value::Bool(a == b),
        Op::NotEq => Value::Bool(a != b),
        Op::Lt => Value::Bool(a < b),
        Op::Gt => Value::Bool(a > b),
        _ => undefined_infix(pos, op, left, right),
    }
}

fn undefined_infix(pos: Position, op: Op, left: &Value, right: &Value) -> Value {
    Value::error(
        pos,
        format!(
            "Infix operation {} '{}' {} is not defined",
            left.type_name(),
            op,
            right.type_name()
        ),
    )
}

// `x | f` feeds x into f. When the right side is written as a call, the
// piped value replaces every `_` argument, or becomes the first argument
// when no placeholder is given.
fn eval_pipe(pos: Position, left: &Node, right: &Node, env: &Rc<Env>) -> Value {
    let piped = eval(left, env).unref();
    if interrupts(&piped) {
        return piped;
    }

    if let Node::Call { callee, args, .. } = right {
        let callee = eval(callee, env).unref();
        if interrupts(&callee) {
            return callee;
        }
        let mut values = Vec::with_capacity(args.len() + 1);
        let mut placed = false;
        for arg in args {
            if matches!(arg, Node::Ident { name, .. } if name == "_") {
                values.push(piped.clone());
                placed = true;
                continue;
            }
            let value = eval(arg, env);
            if interrupts(&value) {
                return value;
            }
            values.push(value);
        }
        if !placed {
            values.insert(0, piped);
        }
        return apply(callee, values, env, pos);
    }

    let target = eval(right, env).unref();
    if interrupts(&target) {
        return target;
    }
    match target {
        Value::Function(_) | Value::Builtin(_) => apply(target, vec![piped], env, pos),
        other => undefined_infix(pos, Op::Pipe, &piped, &other),
    }
}

// `m.x` reads a binding from the module's scope; `m.f(args)` evaluates the
// call inside the module's environment.
fn eval_member(pos: Position, left: &Node, right: &Node, env: &Rc<Env>) -> Value {
    let target = eval(left, env).unref();
    if interrupts(&target) {
        return target;
    }
    let module = match target {
        Value::Module(module) => module,
        other => {
            return Value::error(
                pos,
                format!("Infix operation {} '.' is not defined", other.type_name()),
            );
        }
    };

    match right {
        Node::Ident { pos, name } => match module.env.get(name) {
            Some(value) => value,
            None => Value::error(*pos, format!("Identifier not found '{}'", name)),
        },
        Node::Call { callee, .. } => match callee.as_ref() {
            Node::Ident { pos, name } if module.env.get(name).is_none() => {
                Value::error(*pos, format!("Identifier not found '{}'", name))
            }
            Node::Ident { .. } => eval(right, &module.env),
            other => Value::error(other.pos(), format!("Bad ident for module {}", right)),
        },
        other => Value::error(other.pos(), format!("Bad ident for module {}", other)),
    }
}

fn eval_assign(pos: Position, target: &Node, value: &Node, env: &Rc<Env>) -> Value {
    match target {
        Node::Ident { pos, name } => {
            let value = eval(value, env);
            if interrupts(&value) {
                return value;
            }
            if env.assign(name, value.clone()) {
                value
            } else {
                Value::error(*pos, format!("Identifier not found '{}'", name))
            }
        }
        Node::Index { pos, object, key } => {
            let object = eval(object, env).unref();
            if interrupts(&object) {
                return object;
            }
            let key = eval(key, env).unref();
            if interrupts(&key) {
                return key;
            }
            let value = eval(value, env).unref();
            if interrupts(&value) {
                return value;
            }
            eval_index_assign(*pos, object, key, value)
        }
        other => Value::error(pos, format!("Cannot assign to {}", other)),
    }
}

fn eval_index_assign(pos: Position, object: Value, key: Value, value: Value) -> Value {
    match (&object, &key) {
        (Value::Array(values), Value::Int(id)) => {
            let values = values.borrow();
            if *id < 0 || *id as usize >= values.len() {
                return Value::error(pos, format!("Array index {} is out of range", id));
            }
            let previous =
                std::mem::replace(&mut *values[*id as usize].borrow_mut(), value.clone());
            drop(previous);
            value
        }
        (Value::Array(_), _) => Value::error(
            pos,
            format!("Array index must be an integer, got {}", key.type_name()),
        ),
        (Value::Table(table), _) => {
            table.borrow_mut().insert(&key, value.clone());
            value
        }
        _ => Value::error(
            pos,
            format!("Index assignment is not defined for {}", object.type_name()),
        ),
    }
}

// Reads yield the live reference cell for containers, so an element can be
// passed around and still observe later writes. Out-of-range reads are
// null, never an error.
fn eval_index(pos: Position, object: Value, key: Value) -> Value {
    match (&object, &key) {
        (Value::Array(values), Value::Int(id)) => {
            let values = values.borrow();
            if *id >= 0 && (*id as usize) < values.len() {
                Value::Ref(Rc::clone(&values[*id as usize]))
            } else {
                Value::Null
            }
        }
        (Value::Array(_), _) => Value::error(
            pos,
            format!("Array index must be an integer, got {}", key.type_name()),
        ),
        (Value::Table(table), _) => match table.borrow().at(&key) {
            Some(cell) => Value::Ref(cell),
            None => Value::Null,
        },
        (Value::Str(text), Value::Int(id)) => {
            if *id < 0 {
                return Value::Null;
            }
            match text.chars().nth(*id as usize) {
                Some(c) => Value::string(c.to_string()),
                None => Value::Null,
            }
        }
        (Value::Str(_), _) => Value::error(
            pos,
            format!("String index must be an integer, got {}", key.type_name()),
        ),
        _ => Value::error(
            pos,
            format!("Index operator is not defined for {}", object.type_name()),
        ),
    }
}
