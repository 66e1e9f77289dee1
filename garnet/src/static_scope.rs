use std::sync::Arc;

use parking_lot::RwLock;

use crate::{ModuleRef, Symbol};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    TopLevel,
    Method,
    Block,
    Class,
    Eval,
}

/// Parameter shape of a method or block. Positional parameters occupy the
/// first `required + optional` slots, a rest parameter the slot after them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArgsSpec {
    pub required: usize,
    pub optional: usize,
    pub rest: bool,
}

impl ArgsSpec {
    pub const NONE: Self = Self::new(0, 0, false);

    pub const fn new(required: usize, optional: usize, rest: bool) -> Self {
        Self {
            required,
            optional,
            rest,
        }
    }

    pub fn positional(&self) -> usize {
        self.required + self.optional
    }

    pub fn rest_slot(&self) -> Option<usize> {
        self.rest.then(|| self.positional())
    }

    pub fn max(&self) -> Option<usize> {
        (!self.rest).then(|| self.positional())
    }
}

/// Parse-time declaration of a lexical scope's variable slots.
#[derive(Debug)]
pub struct StaticScope {
    kind: ScopeKind,
    names: RwLock<Vec<Symbol>>,
    args: ArgsSpec,
    enclosing: Option<Arc<StaticScope>>,
    module: Option<ModuleRef>,
}

impl StaticScope {
    pub fn new(
        kind: ScopeKind,
        names: Vec<Symbol>,
        args: ArgsSpec,
        enclosing: Option<Arc<StaticScope>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            names: RwLock::new(names),
            args,
            enclosing,
            module: None,
        })
    }

    pub fn method(names: Vec<Symbol>, args: ArgsSpec) -> Arc<Self> {
        Self::new(ScopeKind::Method, names, args, None)
    }

    pub fn block(names: Vec<Symbol>, args: ArgsSpec, enclosing: &Arc<StaticScope>) -> Arc<Self> {
        Self::new(ScopeKind::Block, names, args, Some(enclosing.clone()))
    }

    pub fn eval(enclosing: &Arc<StaticScope>) -> Arc<Self> {
        Self::new(ScopeKind::Eval, Vec::new(), ArgsSpec::NONE, Some(enclosing.clone()))
    }

    pub fn class_body(module: ModuleRef, names: Vec<Symbol>) -> Arc<Self> {
        Arc::new(Self {
            kind: ScopeKind::Class,
            names: RwLock::new(names),
            args: ArgsSpec::NONE,
            enclosing: None,
            module: Some(module),
        })
    }

    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    pub fn args(&self) -> &ArgsSpec {
        &self.args
    }

    pub fn enclosing(&self) -> Option<&Arc<StaticScope>> {
        self.enclosing.as_ref()
    }

    pub fn module(&self) -> Option<&ModuleRef> {
        self.module.as_ref()
    }

    pub fn variable_count(&self) -> usize {
        self.names.read().len()
    }

    pub fn variables(&self) -> Vec<Symbol> {
        self.names.read().clone()
    }

    /// Method, class and top-level scopes own their arguments; blocks and
    /// evals see their enclosing scope's.
    pub fn is_argument_scope(&self) -> bool {
        matches!(
            self.kind,
            ScopeKind::Method | ScopeKind::Class | ScopeKind::TopLevel
        )
    }

    pub fn is_growable(&self) -> bool {
        self.kind == ScopeKind::Eval
    }

    /// Returns `(offset, depth)` of the nearest declaration of `name`.
    pub fn find_variable(&self, name: &Symbol) -> Option<(usize, usize)> {
        let mut depth = 0;
        let mut current = Some(self);
        while let Some(scope) = current {
            if let Some(offset) = scope.names.read().iter().position(|n| n == name) {
                return Some((offset, depth));
            }
            depth += 1;
            current = scope.enclosing.as_deref();
        }
        None
    }

    /// Declares a new slot. Only eval scopes grow after construction.
    pub fn add_variable(&self, name: Symbol) -> Option<usize> {
        if !self.is_growable() {
            return None;
        }
        let mut names = self.names.write();
        if let Some(offset) = names.iter().position(|n| *n == name) {
            return Some(offset);
        }
        names.push(name);
        Some(names.len() - 1)
    }
}
