use std::{
    collections::HashMap,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(u32);

/// An interned name. Cheap to clone, compares by id.
#[derive(Clone)]
pub struct Symbol {
    id: SymbolId,
    name: Arc<str>,
}

impl Symbol {
    pub fn id(&self) -> SymbolId {
        self.id
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Symbol {}

impl Hash for Symbol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialEq<str> for Symbol {
    fn eq(&self, other: &str) -> bool {
        &*self.name == other
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.name)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

struct SymbolTableImpl {
    names: Vec<Arc<str>>,
    mappings: HashMap<Arc<str>, SymbolId, ahash::RandomState>,
}

impl SymbolTableImpl {
    fn new() -> Self {
        Self {
            names: Vec::new(),
            mappings: HashMap::default(),
        }
    }

    fn get_or_add(&mut self, value: &str) -> Symbol {
        if let Some(&id) = self.mappings.get(value) {
            return Symbol {
                id,
                name: self.names[id.0 as usize].clone(),
            };
        }
        let id = SymbolId(self.names.len() as u32);
        let name = Arc::<str>::from(value);
        self.names.push(name.clone());
        self.mappings.insert(name.clone(), id);
        Symbol { id, name }
    }
}

/// Process-wide symbol table shared by every thread of a runtime.
#[derive(Clone)]
pub struct SymbolTable(Arc<RwLock<SymbolTableImpl>>);

impl SymbolTable {
    pub fn new() -> Self {
        Self(Arc::new(RwLock::new(SymbolTableImpl::new())))
    }

    pub fn intern(&self, value: &str) -> Symbol {
        {
            let table = self.0.read();
            if let Some(&id) = table.mappings.get(value) {
                return Symbol {
                    id,
                    name: table.names[id.0 as usize].clone(),
                };
            }
        }
        self.0.write().get_or_add(value)
    }

    pub fn lookup(&self, id: SymbolId) -> Option<Symbol> {
        let table = self.0.read();
        table.names.get(id.0 as usize).map(|name| Symbol {
            id,
            name: name.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.0.read().names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SymbolTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymbolTable")
            .field("len", &self.len())
            .finish()
    }
}
