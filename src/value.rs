use core::fmt;
use std::{
    cell::RefCell,
    collections::{hash_map, HashMap},
    hash::{Hash, Hasher},
    rc::{Rc, Weak},
};

use itertools::Itertools;

use crate::{
    ast::Node,
    env::Env,
    token::Position,
};

/// The mutable one-slot cell containers are built from. Two aliases of the
/// same container share its slots, so writing through an index is visible
/// through every alias.
pub type Slot = Rc<RefCell<Value>>;

pub fn slot(value: Value) -> Slot {
    Rc::new(RefCell::new(value))
}

/// Signature of a native builtin: argument list, the environment of the call
/// site and the position of the call for error reporting.
pub type BuiltinFn = fn(&[Value], &Rc<Env>, Position) -> Value;

/// A user function together with the environment it closed over. The
/// environment is held weakly and kept alive through the lock protocol, so a
/// closure bound inside its own captured scope does not form a strong cycle.
pub struct Closure {
    env: Weak<Env>,
    pub params: Rc<Vec<String>>,
    pub body: Rc<Node>,
}

impl Closure {
    pub fn new(env: &Rc<Env>, params: Rc<Vec<String>>, body: Rc<Node>) -> Self {
        env.lock();
        Self { env: Rc::downgrade(env), params, body }
    }

    pub fn env(&self) -> Option<Rc<Env>> {
        self.env.upgrade()
    }

    /// A deep copy captures a fresh child of the original environment, so
    /// the copy does not alias bindings made through the original.
    pub fn duplicate(&self) -> Option<Closure> {
        let parent = self.env()?;
        let child = Env::child(&parent);
        Some(Closure::new(&child, Rc::clone(&self.params), Rc::clone(&self.body)))
    }
}

impl Drop for Closure {
    fn drop(&mut self) {
        if let Some(env) = self.env.upgrade() {
            env.unlock();
            env.drop_scope();
        }
    }
}

/// A native extension point registered into the root environment.
pub struct Builtin {
    pub name: &'static str,
    pub call: BuiltinFn,
}

/// A call that has been captured but not yet performed. Produced by the
/// evaluator for calls in tail position and unwound by the application loop;
/// programs cannot construct one.
#[derive(Clone)]
pub struct ContCall {
    pub callee: Value,
    pub args: Vec<Value>,
    pub env: Rc<Env>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorValue {
    pub pos: Position,
    pub message: String,
}

/// A named environment exposed through `.` member access. The scope is
/// locked by whoever registers the module and released when the last handle
/// goes away.
pub struct Module {
    pub name: String,
    pub env: Rc<Env>,
}

impl Drop for Module {
    fn drop(&mut self) {
        self.env.unlock();
        self.env.drop_scope();
    }
}

/// A key/value map from values to slots. Keys are deep-cloned on insertion
/// so later mutation of the original cannot desync them from their hash
/// bucket.
#[derive(Default)]
pub struct Table {
    entries: HashMap<Value, Slot>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &Value, value: Value) {
        self.entries.insert(key.deep_clone(), slot(value));
    }

    pub fn at(&self, key: &Value) -> Option<Slot> {
        self.entries.get(key).map(Rc::clone)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> hash_map::Iter<'_, Value, Slot> {
        self.entries.iter()
    }
}

/// A runtime value. The set of variants is closed; every operation in the
/// evaluator dispatches over it.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Array(Rc<RefCell<Vec<Slot>>>),
    Table(Rc<RefCell<Table>>),
    Ref(Slot),
    Function(Rc<Closure>),
    Builtin(Rc<Builtin>),
    Return(Box<Value>),
    ContCall(Box<ContCall>),
    Error(Rc<ErrorValue>),
    Module(Rc<Module>),
}

impl Value {
    pub fn string(s: impl AsRef<str>) -> Value {
        Value::Str(Rc::from(s.as_ref()))
    }

    pub fn array(values: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(values.into_iter().map(slot).collect())))
    }

    pub fn error(pos: Position, message: impl Into<String>) -> Value {
        Value::Error(Rc::new(ErrorValue { pos, message: message.into() }))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Table(_) => "table",
            Value::Ref(_) => "reference",
            Value::Function(_) => "function",
            Value::Builtin(_) => "builtin",
            Value::Return(_) => "return",
            Value::ContCall(_) => "cont_call",
            Value::Error(_) => "error",
            Value::Module(_) => "module",
        }
    }

    /// Follows reference cells down to the value they hold. Operators,
    /// conditions and display all see through references.
    pub fn unref(self) -> Value {
        let mut current = self;
        while let Value::Ref(cell) = current {
            let inner = cell.borrow().clone();
            current = inner;
        }
        current
    }

    pub fn hash_key(&self) -> u64 {
        match self {
            Value::Null => 0,
            Value::Bool(value) => *value as u64,
            Value::Int(value) => hash64(*value as u64),
            Value::Float(value) => hash64(value.to_bits()),
            Value::Str(value) => hash_bytes(value.as_bytes()),
            Value::Array(values) => {
                let mut hash = hash64(TAG_ARRAY);
                for cell in values.borrow().iter() {
                    hash = hash64(hash.wrapping_add(cell.borrow().hash_key()));
                }
                hash
            }
            Value::Table(table) => {
                // Folded commutatively: two equal tables hash alike no
                // matter what order their buckets iterate in.
                let mut sum = 0u64;
                for (key, value) in table.borrow().iter() {
                    sum = sum.wrapping_add(hash64(
                        key.hash_key().wrapping_add(value.borrow().hash_key()),
                    ));
                }
                hash64(TAG_TABLE.wrapping_add(sum))
            }
            Value::Ref(cell) => cell.borrow().hash_key(),
            Value::Function(closure) => hash64(Rc::as_ptr(closure) as u64),
            Value::Builtin(builtin) => hash64(Rc::as_ptr(builtin) as u64),
            Value::Return(inner) => hash64(TAG_RETURN.wrapping_add(inner.hash_key())),
            Value::ContCall(cc) => hash64(TAG_CONT.wrapping_add(cc.callee.hash_key())),
            Value::Error(error) => hash_bytes(error.message.as_bytes()),
            Value::Module(module) => hash64(Rc::as_ptr(module) as u64),
        }
    }

    /// Deep structural equality. References are unwrapped on both sides;
    /// functions, builtins and modules compare by identity.
    pub fn equal(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Ref(cell), _) => cell.borrow().equal(other),
            (_, Value::Ref(cell)) => self.equal(&cell.borrow()),
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|(x, y)| x.borrow().equal(&y.borrow()))
            }
            (Value::Table(a), Value::Table(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                if a.len() != b.len() {
                    return false;
                }
                // Iterate one side and look the key up in the other, so
                // differing bucket orders cannot give a false positive.
                a.iter().all(|(key, value)| match b.at(key) {
                    Some(found) => value.borrow().equal(&found.borrow()),
                    None => false,
                })
            }
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => Rc::ptr_eq(a, b),
            (Value::Return(a), Value::Return(b)) => a.equal(b),
            (Value::ContCall(a), Value::ContCall(b)) => a.callee.equal(&b.callee),
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::Module(a), Value::Module(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// A copy deep enough for value semantics: containers get fresh cells,
    /// functions capture a fresh child environment, immutable payloads are
    /// shared.
    pub fn deep_clone(&self) -> Value {
        match self {
            Value::Null
            | Value::Bool(_)
            | Value::Int(_)
            | Value::Float(_)
            | Value::Str(_)
            | Value::Builtin(_)
            | Value::Error(_)
            | Value::Module(_) => self.clone(),
            Value::Array(values) => {
                let copies = values
                    .borrow()
                    .iter()
                    .map(|cell| slot(cell.borrow().deep_clone()))
                    .collect();
                Value::Array(Rc::new(RefCell::new(copies)))
            }
            Value::Table(table) => {
                let mut copy = Table::new();
                for (key, value) in table.borrow().iter() {
                    copy.insert(key, value.borrow().deep_clone());
                }
                Value::Table(Rc::new(RefCell::new(copy)))
            }
            Value::Ref(cell) => Value::Ref(slot(cell.borrow().deep_clone())),
            Value::Function(closure) => match closure.duplicate() {
                Some(copy) => Value::Function(Rc::new(copy)),
                None => Value::Function(Rc::clone(closure)),
            },
            Value::Return(inner) => Value::Return(Box::new(inner.deep_clone())),
            Value::ContCall(cc) => Value::ContCall(cc.clone()),
        }
    }
}

const TAG_ARRAY: u64 = 6;
const TAG_TABLE: u64 = 5;
const TAG_RETURN: u64 = 8;
const TAG_CONT: u64 = 10;

fn hash64(x: u64) -> u64 {
    let mut hasher = hash_map::DefaultHasher::new();
    x.hash(&mut hasher);
    hasher.finish()
}

fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = hash_map::DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

// Tables key on values directly; both impls delegate to the value contract
// so `equal(a, b)` implies matching map buckets.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.equal(other)
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash_key());
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(value) => write!(f, "{}", value),
            Value::Int(value) => write!(f, "{}", value),
            Value::Float(value) => write!(f, "{}", value),
            Value::Str(value) => write!(f, "{:?}", value),
            Value::Array(values) => {
                let body = values
                    .borrow()
                    .iter()
                    .map(|cell| cell.borrow().to_string())
                    .join(", ");
                write!(f, "[{}]", body)
            }
            Value::Table(table) => {
                // Sorted by key text so the display is stable across runs.
                let body = table
                    .borrow()
                    .iter()
                    .map(|(key, value)| format!("{}: {}", key, value.borrow()))
                    .sorted()
                    .join(", ");
                write!(f, "{{{}}}", body)
            }
            Value::Ref(cell) => write!(f, "{}", cell.borrow()),
            Value::Function(closure) => write!(f, "fn({})", closure.params.len()),
            Value::Builtin(builtin) => write!(f, "builtin({})", builtin.name),
            Value::Return(inner) => write!(f, "return {}", inner),
            Value::ContCall(_) => write!(f, "cc()"),
            Value::Error(error) => write!(f, "error: [{}] {}", error.pos, error.message),
            Value::Module(module) => write!(f, "module({})", module.name),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (self as &dyn fmt::Display).fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_of(pairs: Vec<(Value, Value)>) -> Value {
        let mut table = Table::new();
        for (key, value) in pairs {
            table.insert(&key, value);
        }
        Value::Table(Rc::new(RefCell::new(table)))
    }

    #[test]
    fn equal_values_hash_alike() {
        let pairs = vec![
            (Value::Null, Value::Null),
            (Value::Bool(true), Value::Bool(true)),
            (Value::Int(42), Value::Int(42)),
            (Value::Float(1.5), Value::Float(1.5)),
            (Value::string("abc"), Value::string("abc")),
            (
                Value::array(vec![Value::Int(1), Value::string("x")]),
                Value::array(vec![Value::Int(1), Value::string("x")]),
            ),
            (
                table_of(vec![(Value::string("a"), Value::Int(1))]),
                table_of(vec![(Value::string("a"), Value::Int(1))]),
            ),
        ];

        for (a, b) in pairs {
            assert!(a.equal(&b), "{} should equal {}", a, b);
            assert_eq!(a.hash_key(), b.hash_key(), "hash mismatch for {}", a);
        }
    }

    #[test]
    fn distinct_types_are_not_equal() {
        assert!(!Value::Int(1).equal(&Value::Float(1.0)));
        assert!(!Value::Bool(false).equal(&Value::Null));
        assert!(!Value::string("1").equal(&Value::Int(1)));
    }

    #[test]
    fn table_equality_ignores_iteration_order() {
        let a = table_of(vec![
            (Value::string("x"), Value::Int(1)),
            (Value::string("y"), Value::Int(2)),
            (Value::Int(3), Value::Bool(true)),
        ]);
        let b = table_of(vec![
            (Value::Int(3), Value::Bool(true)),
            (Value::string("y"), Value::Int(2)),
            (Value::string("x"), Value::Int(1)),
        ]);
        assert!(a.equal(&b));
        assert_eq!(a.hash_key(), b.hash_key());

        let c = table_of(vec![
            (Value::string("x"), Value::Int(1)),
            (Value::string("y"), Value::Int(9)),
            (Value::Int(3), Value::Bool(true)),
        ]);
        assert!(!a.equal(&c));
    }

    #[test]
    fn references_are_transparent() {
        let inner = Value::Int(7);
        let reference = Value::Ref(slot(inner.clone()));
        assert!(reference.equal(&inner));
        assert_eq!(reference.hash_key(), inner.hash_key());
        assert_eq!(reference.to_string(), "7");
        assert_eq!(reference.unref().type_name(), "int");
    }

    #[test]
    fn deep_clone_detaches_containers() {
        let original = Value::array(vec![Value::Int(1), Value::array(vec![Value::Int(2)])]);
        let copy = original.deep_clone();
        assert!(original.equal(&copy));

        if let Value::Array(values) = &copy {
            *values.borrow()[0].borrow_mut() = Value::Int(99);
        }
        assert!(!original.equal(&copy));
        assert_eq!(original.to_string(), "[1, [2]]");
    }

    #[test]
    fn deep_clone_detaches_tables() {
        let original = table_of(vec![(Value::string("k"), Value::Int(1))]);
        let copy = original.deep_clone();

        if let Value::Table(table) = &copy {
            table.borrow_mut().insert(&Value::string("k"), Value::Int(2));
        }
        assert!(!original.equal(&copy));
    }

    #[test]
    fn display_forms() {
        assert_eq!(Value::Null.to_string(), "null");
        assert_eq!(Value::Int(-3).to_string(), "-3");
        assert_eq!(Value::Float(2.5).to_string(), "2.5");
        assert_eq!(Value::string("hi\n").to_string(), "\"hi\\n\"");
        assert_eq!(
            Value::array(vec![Value::Int(1), Value::Bool(true)]).to_string(),
            "[1, true]"
        );
        assert_eq!(
            table_of(vec![
                (Value::string("b"), Value::Int(2)),
                (Value::string("a"), Value::Int(1)),
            ])
            .to_string(),
            "{\"a\": 1, \"b\": 2}"
        );
    }

    #[test]
    fn table_lookup_with_container_key() {
        let key = Value::array(vec![Value::Int(1), Value::Int(2)]);
        let mut table = Table::new();
        table.insert(&key, Value::string("found"));

        let probe = Value::array(vec![Value::Int(1), Value::Int(2)]);
        let hit = table.at(&probe).expect("equal key should be found");
        assert!(hit.borrow().equal(&Value::string("found")));
    }

    #[test]
    fn mutating_a_table_key_source_does_not_desync_the_map() {
        let key = Value::array(vec![Value::Int(1)]);
        let mut table = Table::new();
        table.insert(&key, Value::Int(10));

        // The map captured its own deep copy of the key at insert time.
        if let Value::Array(values) = &key {
            *values.borrow()[0].borrow_mut() = Value::Int(5);
        }
        assert!(table.at(&Value::array(vec![Value::Int(1)])).is_some());
        assert!(table.at(&key).is_none());
    }
}
