use std::sync::Arc;

use crate::{Frame, ModuleRef, ScopeRef, SourcePosition, Value, Visibility};

/// Captured execution context a block or eval re-enters later.
#[derive(Clone, Debug)]
pub struct Binding {
    self_value: Value,
    frame: Frame,
    visibility: Visibility,
    klass: Option<ModuleRef>,
    scope: ScopeRef,
    position: SourcePosition,
}

impl Binding {
    /// `frame` is duplicated so later changes to the live frame are not seen.
    pub fn new(
        frame: &Frame,
        klass: Option<ModuleRef>,
        scope: ScopeRef,
        position: SourcePosition,
    ) -> Self {
        Self {
            self_value: frame.self_value().clone(),
            visibility: frame.visibility(),
            frame: frame.duplicate(),
            klass,
            scope,
            position,
        }
    }

    pub fn self_value(&self) -> &Value {
        &self.self_value
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn klass(&self) -> Option<&ModuleRef> {
        self.klass.as_ref()
    }

    pub fn scope(&self) -> &ScopeRef {
        &self.scope
    }

    pub fn position(&self) -> &SourcePosition {
        &self.position
    }

    /// Legacy re-entry path used by `instance_eval`-style yields.
    pub fn set_self(&mut self, value: Value) {
        self.frame.set_self(value.clone());
        self.self_value = value;
    }

    /// Legacy re-entry path, see [`Binding::set_self`].
    pub fn set_visibility(&mut self, visibility: Visibility) {
        self.visibility = visibility;
    }

    /// Same binding over a fresh copy of the scope and frame.
    pub fn clone_binding(&self) -> Self {
        Self {
            self_value: self.self_value.clone(),
            frame: self.frame.duplicate(),
            visibility: self.visibility,
            klass: self.klass.clone(),
            scope: self.scope.clone_scope(),
            position: self.position.clone(),
        }
    }
}

impl PartialEq for Binding {
    fn eq(&self, other: &Self) -> bool {
        self.self_value.identical(&other.self_value) && Arc::ptr_eq(&self.scope, &other.scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ArgsSpec, Block, DynamicScope, StaticScope};

    fn frame() -> Frame {
        Frame::new(
            None,
            Value::Fixnum(1),
            None,
            vec![],
            0,
            Block::NULL,
            SourcePosition::new("b.rb", 1),
        )
    }

    #[test]
    fn equality_is_self_and_scope_identity() {
        let scope = DynamicScope::new(StaticScope::method(vec![], ArgsSpec::NONE), None);
        let position = SourcePosition::new("b.rb", 1);
        let a = Binding::new(&frame(), None, scope.clone(), position.clone());
        let b = Binding::new(&frame(), None, scope.clone(), position.clone());
        assert_eq!(a, b);

        let cloned = a.clone_binding();
        assert_ne!(a, cloned);

        let mut other_self = a.clone();
        other_self.set_self(Value::Fixnum(2));
        assert_ne!(a, other_self);
        assert_eq!(other_self.frame().self_value(), &Value::Fixnum(2));
    }
}
