use std::rc::Rc;

use itertools::Itertools;

use crate::{
    env::Env,
    token::Position,
    value::{slot, Builtin, Value},
};

fn arity_error(pos: Position, name: &str, expected: usize, got: usize) -> Value {
    Value::error(
        pos,
        format!("{} expects {} argument(s), got {}", name, expected, got),
    )
}

fn builtin_len(args: &[Value], _env: &Rc<Env>, pos: Position) -> Value {
    if args.len() != 1 {
        return arity_error(pos, "len", 1, args.len());
    }
    match args[0].clone().unref() {
        Value::Str(text) => Value::Int(text.chars().count() as i64),
        Value::Array(values) => Value::Int(values.borrow().len() as i64),
        Value::Table(table) => Value::Int(table.borrow().len() as i64),
        other => Value::error(pos, format!("len is not defined for {}", other.type_name())),
    }
}

// Each argument goes to stdout on its own line; strings print unquoted.
fn builtin_puts(args: &[Value], _env: &Rc<Env>, _pos: Position) -> Value {
    for arg in args {
        match arg.clone().unref() {
            Value::Str(text) => println!("{}", text),
            other => println!("{}", other),
        }
    }
    Value::Null
}

fn builtin_type(args: &[Value], _env: &Rc<Env>, pos: Position) -> Value {
    if args.len() != 1 {
        return arity_error(pos, "type", 1, args.len());
    }
    Value::string(args[0].clone().unref().type_name())
}

fn builtin_clone(args: &[Value], _env: &Rc<Env>, pos: Position) -> Value {
    if args.len() != 1 {
        return arity_error(pos, "clone", 1, args.len());
    }
    args[0].clone().unref().deep_clone()
}

fn builtin_first(args: &[Value], _env: &Rc<Env>, pos: Position) -> Value {
    if args.len() != 1 {
        return arity_error(pos, "first", 1, args.len());
    }
    match args[0].clone().unref() {
        Value::Array(values) => match values.borrow().first() {
            Some(cell) => Value::Ref(Rc::clone(cell)),
            None => Value::Null,
        },
        other => Value::error(pos, format!("first is not defined for {}", other.type_name())),
    }
}

fn builtin_last(args: &[Value], _env: &Rc<Env>, pos: Position) -> Value {
    if args.len() != 1 {
        return arity_error(pos, "last", 1, args.len());
    }
    match args[0].clone().unref() {
        Value::Array(values) => match values.borrow().last() {
            Some(cell) => Value::Ref(Rc::clone(cell)),
            None => Value::Null,
        },
        other => Value::error(pos, format!("last is not defined for {}", other.type_name())),
    }
}

// Appends in place and hands the array back, so pushes chain.
fn builtin_push(args: &[Value], _env: &Rc<Env>, pos: Position) -> Value {
    if args.len() != 2 {
        return arity_error(pos, "push", 2, args.len());
    }
    let target = args[0].clone().unref();
    match &target {
        Value::Array(values) => {
            values.borrow_mut().push(slot(args[1].clone().unref()));
            target
        }
        other => Value::error(pos, format!("push is not defined for {}", other.type_name())),
    }
}

fn builtin_keys(args: &[Value], _env: &Rc<Env>, pos: Position) -> Value {
    if args.len() != 1 {
        return arity_error(pos, "keys", 1, args.len());
    }
    match args[0].clone().unref() {
        Value::Table(table) => {
            // Sorted by display text so the result is deterministic.
            let keys = table
                .borrow()
                .iter()
                .map(|(key, _)| key.deep_clone())
                .sorted_by_key(|key| key.to_string())
                .collect_vec();
            Value::array(keys)
        }
        other => Value::error(pos, format!("keys is not defined for {}", other.type_name())),
    }
}

/// Registers every builtin into the given (root) environment.
pub fn install(env: &Rc<Env>) {
    let builtins: &[(&'static str, crate::value::BuiltinFn)] = &[
        ("len", builtin_len),
        ("puts", builtin_puts),
        ("type", builtin_type),
        ("clone", builtin_clone),
        ("first", builtin_first),
        ("last", builtin_last),
        ("push", builtin_push),
        ("keys", builtin_keys),
    ];

    for (name, call) in builtins.iter().copied() {
        env.set(name, Value::Builtin(Rc::new(Builtin { name, call })));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{eval::eval_program, parser};

    fn run(input: &str) -> String {
        let program = parser::parse(input).expect("program should parse");
        let root = Env::root();
        root.lock();
        install(&root);
        let result = eval_program(&program, &root);
        root.unlock();
        result.to_string()
    }

    #[test]
    fn len_counts_elements() {
        assert_eq!(run("len(\"hello\")"), "5");
        assert_eq!(run("len([1, 2, 3])"), "3");
        assert_eq!(run("len({\"a\": 1})"), "1");
        assert_eq!(run("len(5)"), "error: [1:4] len is not defined for int");
        assert_eq!(run("len()"), "error: [1:4] len expects 1 argument(s), got 0");
    }

    #[test]
    fn type_names_values() {
        assert_eq!(run("type(1)"), "\"int\"");
        assert_eq!(run("type(1.5)"), "\"float\"");
        assert_eq!(run("type([])"), "\"array\"");
        assert_eq!(run("type(fn() { 1 })"), "\"function\"");
        assert_eq!(run("type(len)"), "\"builtin\"");
        // The reference returned by an index read is invisible to type().
        assert_eq!(run("type([1][0])"), "\"int\"");
    }

    #[test]
    fn clone_detaches_containers() {
        assert_eq!(run("let a = [1, 2]; let b = clone(a); b[0] = 9; a"), "[1, 2]");
        assert_eq!(run("let a = [1, 2]; let b = clone(a); b[0] = 9; b"), "[9, 2]");
        assert_eq!(
            run("let t = {\"x\": 1}; let u = clone(t); u[\"x\"] = 2; t[\"x\"]"),
            "1"
        );
    }

    #[test]
    fn clone_equals_original() {
        assert_eq!(run("clone([1, {\"k\": 2.5}]) == [1, {\"k\": 2.5}]"), "true");
    }

    #[test]
    fn array_helpers() {
        assert_eq!(run("first([7, 8])"), "7");
        assert_eq!(run("last([7, 8])"), "8");
        assert_eq!(run("first([])"), "null");
        assert_eq!(run("push([1], 2)"), "[1, 2]");
        assert_eq!(run("let a = [1]; push(a, 2); a"), "[1, 2]");
    }

    #[test]
    fn keys_are_sorted_and_detached() {
        assert_eq!(run("keys({\"b\": 1, \"a\": 2})"), "[\"a\", \"b\"]");
        assert_eq!(run("keys({})"), "[]");
    }
}
