use std::fmt;

use crate::error::{Error, Result};
use crate::tensor::TensorId;

// ScopeStack: bookkeeping for automatic tensor disposal
//
// Every tensor created while a scope is open is appended to that scope's
// arena. When the scope ends, the engine walks the arena once:
//
//   preserved (returned from tidy) or kept  → moved to the parent's arena
//   everything else still alive             → released
//
// Moving kept tensors upward means a single `keep` survives every enclosing
// scope: each parent re-checks the flag and moves it on again. Tensors
// created with no scope open are never tracked and live until disposed.
//
// A scope goes Active → Closing (popped, arena being processed) → Closed.
// Ending a scope when none is open is a contract violation and returns
// `Error::ScopeUnderflow`.

/// Identifier of a scope, unique per engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u64);

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    Active,
    Closing,
    Closed,
}

/// One level of the scope stack.
#[derive(Debug)]
pub struct Scope {
    pub(crate) id: ScopeId,
    pub(crate) name: String,
    pub(crate) parent: Option<ScopeId>,
    pub(crate) arena: Vec<TensorId>,
    pub(crate) state: ScopeState,
}

impl Scope {
    pub fn id(&self) -> ScopeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<ScopeId> {
        self.parent
    }

    /// Tensors registered in this scope, in creation order.
    pub fn arena(&self) -> &[TensorId] {
        &self.arena
    }

    pub fn state(&self) -> ScopeState {
        self.state
    }
}

/// Stack of open scopes. The innermost scope is the last element.
#[derive(Debug, Default)]
pub struct ScopeStack {
    stack: Vec<Scope>,
    next_id: u64,
}

impl ScopeStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open scopes.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// The innermost open scope.
    pub fn current(&self) -> Option<&Scope> {
        self.stack.last()
    }

    /// Open a new scope nested in the current one.
    pub fn push(&mut self, name: impl Into<String>) -> ScopeId {
        let id = ScopeId(self.next_id);
        self.next_id += 1;
        let parent = self.current().map(|s| s.id);
        self.stack.push(Scope {
            id,
            name: name.into(),
            parent,
            arena: Vec::new(),
            state: ScopeState::Active,
        });
        id
    }

    /// Pop the innermost scope and mark it Closing.
    pub fn pop(&mut self) -> Result<Scope> {
        let mut scope = self.stack.pop().ok_or(Error::ScopeUnderflow)?;
        scope.state = ScopeState::Closing;
        Ok(scope)
    }

    /// Register a tensor in the innermost scope. Returns the scope it landed
    /// in, or `None` when no scope is open (the tensor stays untracked).
    pub fn track(&mut self, id: TensorId) -> Option<ScopeId> {
        let scope = self.stack.last_mut()?;
        scope.arena.push(id);
        Some(scope.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_scopes_link_parents() {
        let mut stack = ScopeStack::new();
        let outer = stack.push("outer");
        let inner = stack.push("inner");
        assert_eq!(stack.depth(), 2);
        let popped = stack.pop().unwrap();
        assert_eq!(popped.id(), inner);
        assert_eq!(popped.parent(), Some(outer));
        assert_eq!(popped.state(), ScopeState::Closing);
        assert_eq!(stack.current().map(|s| s.id()), Some(outer));
    }

    #[test]
    fn test_track_without_scope_is_untracked() {
        let mut stack = ScopeStack::new();
        assert_eq!(stack.track(TensorId(0)), None);
        let id = stack.push("s");
        assert_eq!(stack.track(TensorId(1)), Some(id));
        assert_eq!(stack.current().unwrap().arena(), &[TensorId(1)]);
    }

    #[test]
    fn test_pop_empty_is_underflow() {
        let mut stack = ScopeStack::new();
        assert!(matches!(stack.pop(), Err(Error::ScopeUnderflow)));
    }

    #[test]
    fn test_scope_ids_are_not_reused() {
        let mut stack = ScopeStack::new();
        let a = stack.push("a");
        stack.pop().unwrap();
        let b = stack.push("b");
        assert_ne!(a, b);
    }
}
