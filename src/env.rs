use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::{Rc, Weak},
};

use tracing::trace;

use crate::value::Value;

thread_local! {
    static LIVE_ENVS: Cell<usize> = const { Cell::new(0) };
}

/// How many environments currently exist on this thread. Used to check that
/// the lock/drop protocol leaves nothing behind after evaluation.
pub fn live_env_count() -> usize {
    LIVE_ENVS.with(|count| count.get())
}

/// One scope in the environment tree.
///
/// Ownership flows downward: a parent holds its children strongly, children
/// and closures point upward and inward through weak references. The lock
/// counter records live strong holders (closures, running frames); a scope
/// is torn down only once its whole subtree is lock-free, which is what
/// breaks the cycle a closure forms by being bound inside the scope it
/// captured.
pub struct Env {
    parent: Weak<Env>,
    bindings: RefCell<HashMap<String, Value>>,
    children: RefCell<Vec<Rc<Env>>>,
    locks: Cell<usize>,
    dropped: Cell<bool>,
}

impl Env {
    fn alloc(parent: Weak<Env>) -> Rc<Env> {
        LIVE_ENVS.with(|count| count.set(count.get() + 1));
        Rc::new(Env {
            parent,
            bindings: RefCell::new(HashMap::new()),
            children: RefCell::new(Vec::new()),
            locks: Cell::new(0),
            dropped: Cell::new(false),
        })
    }

    pub fn root() -> Rc<Env> {
        Env::alloc(Weak::new())
    }

    pub fn child(parent: &Rc<Env>) -> Rc<Env> {
        let env = Env::alloc(Rc::downgrade(parent));
        parent.children.borrow_mut().push(Rc::clone(&env));
        env
    }

    /// Looks `name` up along the parent chain and returns the nearest
    /// binding.
    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.bindings.borrow().get(name) {
            return Some(value.clone());
        }
        self.parent.upgrade()?.get(name)
    }

    /// Binds `name` in this scope, shadowing any ancestor binding.
    pub fn set(&self, name: impl Into<String>, value: Value) {
        let previous = self.bindings.borrow_mut().insert(name.into(), value);
        // Dropped outside the borrow: tearing down a displaced closure may
        // re-enter this environment.
        drop(previous);
    }

    /// Replaces the nearest existing binding of `name`. Returns false when
    /// no scope in the chain binds it.
    pub fn assign(&self, name: &str, value: Value) -> bool {
        let previous = match self.bindings.borrow_mut().get_mut(name) {
            Some(bound) => std::mem::replace(bound, value),
            None => {
                return match self.parent.upgrade() {
                    Some(parent) => parent.assign(name, value),
                    None => false,
                };
            }
        };
        drop(previous);
        true
    }

    pub fn lock(&self) {
        self.locks.set(self.locks.get() + 1);
    }

    pub fn unlock(&self) {
        self.locks.set(self.locks.get().saturating_sub(1));
    }

    pub fn locks(&self) -> usize {
        self.locks.get()
    }

    fn subtree_locked(&self) -> bool {
        self.locks.get() > 0
            || self
                .children
                .borrow()
                .iter()
                .any(|child| child.subtree_locked())
    }

    /// Final teardown for a scope whose session is over: bindings are
    /// drained first so that closures bound here release the scopes they
    /// lock, then the normal drop protocol runs.
    pub fn shutdown(self: &Rc<Self>) {
        let bindings: Vec<Value> = self
            .bindings
            .borrow_mut()
            .drain()
            .map(|(_, value)| value)
            .collect();
        drop(bindings);
        self.drop_scope();
    }

    /// Releases this scope if nothing holds it any more: bindings are
    /// dropped, children are torn down depth-first and the scope detaches
    /// from its parent. Idempotent, and a no-op while the scope or any
    /// nested scope is still locked.
    pub fn drop_scope(self: &Rc<Self>) {
        if self.dropped.get() || self.subtree_locked() {
            return;
        }
        self.dropped.set(true);
        trace!(locks = self.locks.get(), "dropping scope");

        // Both collections are moved out before being dropped so that
        // closure teardown re-entering this scope never sees a live borrow.
        let bindings: Vec<Value> = self
            .bindings
            .borrow_mut()
            .drain()
            .map(|(_, value)| value)
            .collect();
        drop(bindings);

        let children: Vec<Rc<Env>> = self.children.borrow_mut().drain(..).collect();
        for child in &children {
            child.drop_scope();
        }
        drop(children);

        if let Some(parent) = self.parent.upgrade() {
            parent
                .children
                .borrow_mut()
                .retain(|child| !Rc::ptr_eq(child, self));
            // A parent frame that already finished may have been waiting on
            // this scope's locks; give it another chance to unwind.
            parent.drop_scope();
        }
    }
}

impl Drop for Env {
    fn drop(&mut self) {
        LIVE_ENVS.with(|count| count.set(count.get() - 1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_walks_the_parent_chain() {
        let root = Env::root();
        root.set("x", Value::Int(1));
        root.set("y", Value::Int(2));

        let child = Env::child(&root);
        child.set("x", Value::Int(10));

        assert!(child.get("x").unwrap().equal(&Value::Int(10)));
        assert!(child.get("y").unwrap().equal(&Value::Int(2)));
        assert!(root.get("x").unwrap().equal(&Value::Int(1)));
        assert!(child.get("z").is_none());
    }

    #[test]
    fn set_binds_in_the_current_scope_only() {
        let root = Env::root();
        root.set("x", Value::Int(1));
        let child = Env::child(&root);
        child.set("x", Value::Int(2));

        assert!(root.get("x").unwrap().equal(&Value::Int(1)));
    }

    #[test]
    fn assign_rebinds_the_nearest_binding() {
        let root = Env::root();
        root.set("x", Value::Int(1));
        let child = Env::child(&root);

        assert!(child.assign("x", Value::Int(5)));
        assert!(root.get("x").unwrap().equal(&Value::Int(5)));
        assert!(!child.assign("missing", Value::Null));
    }

    #[test]
    fn drop_scope_is_blocked_by_locks() {
        let root = Env::root();
        root.lock();
        let child = Env::child(&root);
        child.set("x", Value::Int(1));

        child.lock();
        child.drop_scope();
        assert!(child.get("x").is_some(), "locked scope must survive");

        child.unlock();
        child.drop_scope();
        assert!(child.get("x").is_none(), "unlocked scope must be released");
    }

    #[test]
    fn drop_scope_waits_for_nested_locks() {
        let root = Env::root();
        root.lock();
        let frame = Env::child(&root);
        frame.set("x", Value::Int(1));
        let inner = Env::child(&frame);
        inner.lock();

        // The frame finished, but the nested scope is still held.
        frame.drop_scope();
        assert!(frame.get("x").is_some());

        // Releasing the inner scope unwinds the frame as well.
        inner.unlock();
        inner.drop_scope();
        assert!(frame.get("x").is_none());
    }

    #[test]
    fn drop_scope_is_idempotent() {
        let root = Env::root();
        root.lock();
        let child = Env::child(&root);
        child.drop_scope();
        child.drop_scope();
    }

    #[test]
    fn shutdown_releases_scopes_locked_by_bound_closures() {
        use crate::{ast::Node, token::Position, value::Closure};

        let before = live_env_count();
        {
            let root = Env::root();
            root.lock();
            let frame = Env::child(&root);
            let closure = Closure::new(
                &frame,
                Rc::new(Vec::new()),
                Rc::new(Node::NullLit { pos: Position::none() }),
            );
            drop(frame);
            root.set("f", Value::Function(Rc::new(closure)));

            // The closure keeps its scope alive even though the frame is done.
            assert_eq!(live_env_count(), before + 2);

            root.unlock();
            root.shutdown();
            assert_eq!(live_env_count(), before + 1, "only the root remains");
        }
        assert_eq!(live_env_count(), before);
    }

    #[test]
    fn released_scopes_leave_no_live_environments() {
        let before = live_env_count();
        {
            let root = Env::root();
            root.lock();
            {
                let frame = Env::child(&root);
                frame.lock();
                frame.set("x", Value::Int(1));
                frame.unlock();
                frame.drop_scope();
            }
            assert_eq!(live_env_count(), before + 1, "frame should be detached");
            root.unlock();
            root.drop_scope();
        }
        assert_eq!(live_env_count(), before);
    }
}
