use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::{StaticScope, Value};

pub type ScopeRef = Arc<DynamicScope>;

/// Slot storage sized to the declaring scope. Only `Many` grows.
#[derive(Clone)]
enum Slots {
    None,
    One([Option<Value>; 1]),
    Two([Option<Value>; 2]),
    Three([Option<Value>; 3]),
    Many(Vec<Option<Value>>),
}

impl Slots {
    fn with_capacity(count: usize, growable: bool) -> Self {
        if growable {
            return Self::Many(vec![None; count]);
        }
        match count {
            0 => Self::None,
            1 => Self::One(Default::default()),
            2 => Self::Two(Default::default()),
            3 => Self::Three(Default::default()),
            n => Self::Many(vec![None; n]),
        }
    }

    fn as_slice(&self) -> &[Option<Value>] {
        match self {
            Self::None => &[],
            Self::One(slots) => slots,
            Self::Two(slots) => slots,
            Self::Three(slots) => slots,
            Self::Many(slots) => slots,
        }
    }

    fn as_mut_slice(&mut self) -> &mut [Option<Value>] {
        match self {
            Self::None => &mut [],
            Self::One(slots) => slots,
            Self::Two(slots) => slots,
            Self::Three(slots) => slots,
            Self::Many(slots) => slots,
        }
    }

    fn grow_to(&mut self, count: usize) -> bool {
        match self {
            Self::Many(slots) => {
                if slots.len() < count {
                    slots.resize(count, None);
                }
                true
            }
            _ => self.as_slice().len() >= count,
        }
    }
}

/// Live storage for one activation of a [`StaticScope`], chained to the
/// scope it lexically captures.
pub struct DynamicScope {
    static_scope: Arc<StaticScope>,
    parent: Option<ScopeRef>,
    slots: Mutex<Slots>,
    eval_scope: OnceLock<ScopeRef>,
}

impl DynamicScope {
    pub fn new(static_scope: Arc<StaticScope>, parent: Option<ScopeRef>) -> ScopeRef {
        let slots = Slots::with_capacity(static_scope.variable_count(), static_scope.is_growable());
        Arc::new(Self {
            static_scope,
            parent,
            slots: Mutex::new(slots),
            eval_scope: OnceLock::new(),
        })
    }

    pub fn static_scope(&self) -> &Arc<StaticScope> {
        &self.static_scope
    }

    pub fn parent(&self) -> Option<&ScopeRef> {
        self.parent.as_ref()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn nth_parent(&self, depth: usize) -> &DynamicScope {
        let mut current = self;
        for _ in 0..depth {
            current = current
                .parent
                .as_deref()
                .expect("scope depth exceeds the captured scope chain");
        }
        current
    }

    fn with_slot<R>(&self, offset: usize, f: impl FnOnce(&mut Option<Value>) -> R) -> R {
        let mut slots = self.slots.lock();
        if offset >= slots.as_slice().len() {
            let grew = self.static_scope.is_growable() && slots.grow_to(offset + 1);
            assert!(
                grew,
                "slot {offset} out of range for a scope of {} variables",
                slots.as_slice().len()
            );
        }
        f(&mut slots.as_mut_slice()[offset])
    }

    pub fn get_value(&self, offset: usize, depth: usize) -> Option<Value> {
        self.nth_parent(depth).with_slot(offset, |slot| slot.clone())
    }

    /// Reads a slot, storing nil into it first when it was never assigned.
    pub fn get_value_or_nil(&self, offset: usize, depth: usize) -> Value {
        self.nth_parent(depth)
            .with_slot(offset, |slot| slot.get_or_insert(Value::Nil).clone())
    }

    pub fn set_value(&self, offset: usize, value: Value, depth: usize) -> Value {
        self.nth_parent(depth).with_slot(offset, |slot| {
            *slot = Some(value.clone());
        });
        value
    }

    /// Binds `values[..size]` to the leading slots. Excess arguments must
    /// already be folded into a rest value by the caller.
    pub fn set_arg_values(&self, values: &[Value], size: usize) {
        let mut slots = self.slots.lock();
        slots.grow_to(size);
        let slots = slots.as_mut_slice();
        for (slot, value) in slots.iter_mut().zip(values.iter().take(size)) {
            *slot = Some(value.clone());
        }
    }

    /// Arguments for a bare `super`, read from the enclosing method's scope
    /// as they are now. The rest parameter is splatted onto the end.
    pub fn get_arg_values(&self) -> Vec<Value> {
        let scope = self.argument_scope_ref();
        let args = *scope.static_scope.args();
        let slots = scope.slots.lock();
        let slots = slots.as_slice();
        let mut values: Vec<Value> = (0..args.positional())
            .map(|offset| slots.get(offset).cloned().flatten().unwrap_or_default())
            .collect();
        if let Some(rest) = args.rest_slot() {
            match slots.get(rest).cloned().flatten() {
                Some(Value::Array(array)) => values.extend(array.lock().iter().cloned()),
                Some(Value::Nil) | None => {}
                Some(other) => values.push(other),
            }
        }
        values
    }

    /// Same parent, copied values, independent storage.
    pub fn clone_scope(&self) -> ScopeRef {
        Arc::new(Self {
            static_scope: self.static_scope.clone(),
            parent: self.parent.clone(),
            slots: Mutex::new(self.slots.lock().clone()),
            eval_scope: OnceLock::new(),
        })
    }

    /// The growable child shared by every eval run against this scope.
    pub fn eval_scope(self: &Arc<Self>) -> ScopeRef {
        self.eval_scope
            .get_or_init(|| {
                DynamicScope::new(StaticScope::eval(&self.static_scope), Some(self.clone()))
            })
            .clone()
    }

    /// Catches up with variables an eval declared after this scope was built.
    pub fn grow_if_needed(&self) {
        let declared = self.static_scope.variable_count();
        let mut slots = self.slots.lock();
        if slots.as_slice().len() < declared {
            let grew = slots.grow_to(declared);
            assert!(grew, "fixed-size scope cannot grow to {declared} variables");
        }
    }

    fn argument_scope_ref(&self) -> &DynamicScope {
        let mut current = self;
        while !current.static_scope.is_argument_scope() {
            match current.parent.as_deref() {
                Some(parent) => current = parent,
                None => break,
            }
        }
        current
    }

    /// Nearest enclosing scope that owns the method arguments.
    pub fn argument_scope(self: &Arc<Self>) -> ScopeRef {
        let mut current = self.clone();
        while !current.static_scope.is_argument_scope() {
            let Some(parent) = current.parent.clone() else {
                break;
            };
            current = parent;
        }
        current
    }

    pub fn values(&self) -> Vec<Option<Value>> {
        self.slots.lock().as_slice().to_vec()
    }
}

impl std::fmt::Debug for DynamicScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicScope")
            .field("kind", &self.static_scope.kind())
            .field("values", &self.values())
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ArgsSpec, SymbolTable};

    fn chain() -> (ScopeRef, ScopeRef, ScopeRef) {
        let symbols = SymbolTable::new();
        let outer_static = StaticScope::method(vec![symbols.intern("a")], ArgsSpec::NONE);
        let middle_static =
            StaticScope::block(vec![symbols.intern("b")], ArgsSpec::NONE, &outer_static);
        let inner_static =
            StaticScope::block(vec![symbols.intern("c")], ArgsSpec::NONE, &middle_static);
        let outer = DynamicScope::new(outer_static, None);
        let middle = DynamicScope::new(middle_static, Some(outer.clone()));
        let inner = DynamicScope::new(inner_static, Some(middle.clone()));
        (outer, middle, inner)
    }

    #[test]
    fn depth_addressing_reaches_the_right_level() {
        let (outer, middle, inner) = chain();
        inner.set_value(0, Value::Fixnum(7), 2);
        assert_eq!(inner.get_value(0, 2), Some(Value::Fixnum(7)));
        assert_eq!(outer.get_value(0, 0), Some(Value::Fixnum(7)));

        inner.set_value(0, Value::Fixnum(1), 0);
        assert_eq!(outer.get_value(0, 0), Some(Value::Fixnum(7)));
        assert_eq!(middle.get_value(0, 0), None);
        assert_eq!(inner.get_value(0, 0), Some(Value::Fixnum(1)));
    }

    #[test]
    fn get_value_or_nil_primes_the_slot() {
        let (_, _, inner) = chain();
        assert_eq!(inner.get_value(0, 1), None);
        assert_eq!(inner.get_value_or_nil(0, 1), Value::Nil);
        assert_eq!(inner.get_value(0, 1), Some(Value::Nil));
    }

    #[test]
    fn clone_is_independent_but_shares_parent() {
        let (_, middle, inner) = chain();
        inner.set_value(0, Value::Fixnum(1), 0);
        let copy = inner.clone_scope();
        assert_eq!(copy.get_value(0, 0), Some(Value::Fixnum(1)));

        copy.set_value(0, Value::Fixnum(2), 0);
        assert_eq!(inner.get_value(0, 0), Some(Value::Fixnum(1)));
        assert!(Arc::ptr_eq(copy.parent().unwrap(), inner.parent().unwrap()));
        assert!(Arc::ptr_eq(copy.parent().unwrap(), &middle));

        copy.set_value(0, Value::Fixnum(3), 1);
        assert_eq!(inner.get_value(0, 1), Some(Value::Fixnum(3)));
    }

    #[test]
    fn zsuper_arguments_reflect_reassigned_rest() {
        let symbols = SymbolTable::new();
        let names = vec![symbols.intern("a"), symbols.intern("rest")];
        let method = DynamicScope::new(StaticScope::method(names, ArgsSpec::new(1, 0, true)), None);
        method.set_arg_values(
            &[Value::Fixnum(1), Value::array(vec![Value::Fixnum(2), Value::Fixnum(3)])],
            2,
        );
        method.set_value(1, Value::array(vec![Value::Fixnum(9)]), 0);

        let block_static = StaticScope::block(vec![], ArgsSpec::NONE, method.static_scope());
        let block = DynamicScope::new(block_static, Some(method.clone()));
        assert_eq!(block.get_arg_values(), vec![Value::Fixnum(1), Value::Fixnum(9)]);
        assert!(Arc::ptr_eq(&block.argument_scope(), &method));
    }

    #[test]
    fn eval_scope_is_shared_and_grows() {
        let (outer, _, _) = chain();
        let eval = outer.eval_scope();
        assert!(Arc::ptr_eq(&eval, &outer.eval_scope()));
        let symbols = SymbolTable::new();
        let offset = eval.static_scope().add_variable(symbols.intern("x")).unwrap();
        eval.grow_if_needed();
        eval.set_value(offset, Value::Fixnum(5), 0);
        assert_eq!(outer.eval_scope().get_value(offset, 0), Some(Value::Fixnum(5)));
        assert_eq!(eval.get_value(0, 1), None);
    }

    #[test]
    #[should_panic]
    fn fixed_scopes_do_not_grow() {
        let (outer, _, _) = chain();
        outer.set_value(3, Value::Nil, 0);
    }
}
