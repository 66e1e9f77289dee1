use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;

use crate::{Binding, Block, ModuleRef, Symbol};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// A plain instance of a user-defined class.
pub struct RObject {
    id: u64,
    class: ModuleRef,
}

impl RObject {
    pub fn new(class: ModuleRef) -> Self {
        Self {
            id: NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed),
            class,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn class(&self) -> &ModuleRef {
        &self.class
    }
}

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    True,
    False,
    Fixnum(i64),
    Float(f64),
    Symbol(Symbol),
    Str(Arc<str>),
    Array(Arc<Mutex<Vec<Value>>>),
    Object(Arc<RObject>),
    Module(ModuleRef),
    Proc(Block),
    Binding(Arc<Binding>),
}

impl Value {
    pub fn bool(value: bool) -> Self {
        if value { Self::True } else { Self::False }
    }

    pub fn string(value: &str) -> Self {
        Self::Str(Arc::from(value))
    }

    pub fn array(values: Vec<Value>) -> Self {
        Self::Array(Arc::new(Mutex::new(values)))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    pub fn is_truthy(&self) -> bool {
        !matches!(self, Self::Nil | Self::False)
    }

    pub fn as_fixnum(&self) -> Option<i64> {
        match self {
            Self::Fixnum(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<&Symbol> {
        match self {
            Self::Symbol(symbol) => Some(symbol),
            _ => None,
        }
    }

    pub fn as_block(&self) -> Option<&Block> {
        match self {
            Self::Proc(block) => Some(block),
            _ => None,
        }
    }

    pub fn as_module(&self) -> Option<&ModuleRef> {
        match self {
            Self::Module(module) => Some(module),
            _ => None,
        }
    }

    /// Snapshot of an array's elements.
    pub fn array_elements(&self) -> Option<Vec<Value>> {
        match self {
            Self::Array(values) => Some(values.lock().clone()),
            _ => None,
        }
    }

    /// Object identity: immediates by value, references by address.
    pub fn identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Nil, Self::Nil) | (Self::True, Self::True) | (Self::False, Self::False) => true,
            (Self::Fixnum(a), Self::Fixnum(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Symbol(a), Self::Symbol(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => Arc::ptr_eq(a, b),
            (Self::Array(a), Self::Array(b)) => Arc::ptr_eq(a, b),
            (Self::Object(a), Self::Object(b)) => Arc::ptr_eq(a, b),
            (Self::Module(a), Self::Module(b)) => Arc::ptr_eq(a, b),
            (Self::Proc(a), Self::Proc(b)) => a.same_block(b),
            (Self::Binding(a), Self::Binding(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn inspect(&self) -> String {
        match self {
            Self::Nil => "nil".to_owned(),
            Self::True => "true".to_owned(),
            Self::False => "false".to_owned(),
            Self::Fixnum(value) => value.to_string(),
            Self::Float(value) => format!("{value:?}"),
            Self::Symbol(symbol) => format!(":{symbol}"),
            Self::Str(value) => format!("{value:?}"),
            Self::Array(values) => {
                let values = values.lock().clone();
                let parts: Vec<_> = values.iter().map(Value::inspect).collect();
                format!("[{}]", parts.join(", "))
            }
            Self::Object(object) => format!("#<{}>", object.class().name()),
            Self::Module(module) => module.name().to_string(),
            Self::Proc(block) => format!("#<Proc:{}>", block.id().map_or(0, |id| id.0)),
            Self::Binding(_) => "#<Binding>".to_owned(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Fixnum(a), Self::Float(b)) | (Self::Float(b), Self::Fixnum(a)) => {
                *a as f64 == *b
            }
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let left = a.lock().clone();
                let right = b.lock().clone();
                left == right
            }
            _ => self.identical(other),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Fixnum(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::bool(value)
    }
}

impl From<Symbol> for Value {
    fn from(value: Symbol) -> Self {
        Self::Symbol(value)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inspect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SymbolTable;

    #[test]
    fn truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::False.is_truthy());
        assert!(Value::Fixnum(0).is_truthy());
        assert!(Value::array(vec![]).is_truthy());
    }

    #[test]
    fn arrays_compare_structurally_but_not_by_identity() {
        let a = Value::array(vec![Value::Fixnum(1), Value::Fixnum(2)]);
        let b = Value::array(vec![Value::Fixnum(1), Value::Fixnum(2)]);
        assert_eq!(a, b);
        assert!(!a.identical(&b));
        assert!(a.identical(&a.clone()));
    }

    #[test]
    fn inspect_formats() {
        let symbols = SymbolTable::new();
        let value = Value::array(vec![
            Value::Nil,
            Value::Symbol(symbols.intern("baz")),
            Value::string("x"),
            Value::Fixnum(3),
        ]);
        assert_eq!(value.inspect(), "[nil, :baz, \"x\", 3]");
    }
}
