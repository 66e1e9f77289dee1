use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use parking_lot::{Mutex, RwLock};

use crate::{
    DynamicMethod, ErrorKind, Method, MethodRef, RaiseError, RuntimeShared, Symbol, Visibility,
};

pub type ModuleRef = Arc<Module>;

type MethodTable = HashMap<Symbol, MethodRef, ahash::RandomState>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Class,
    Module,
}

/// A class or module with a mutable method table.
///
/// Every table mutation runs under `mutation`: the table changes, the
/// serial of this module and of every module inheriting from it moves,
/// and call sites that cached a now shadowed method are flushed, before
/// the lock is released.
pub struct Module {
    id: u64,
    name: Symbol,
    kind: ModuleKind,
    superclass: Option<ModuleRef>,
    /// Most recently included first.
    includes: RwLock<Vec<ModuleRef>>,
    methods: RwLock<MethodTable>,
    serial: AtomicU64,
    /// Subclasses and includers, whose lookups depend on this table.
    dependents: Mutex<Vec<Weak<Module>>>,
    mutation: Mutex<()>,
    /// Integer and Float: redefining an operator disables its fast path.
    primitive: AtomicBool,
    runtime: Weak<RuntimeShared>,
}

impl Module {
    pub(crate) fn new(
        runtime: Weak<RuntimeShared>,
        id: u64,
        name: Symbol,
        kind: ModuleKind,
        superclass: Option<ModuleRef>,
    ) -> ModuleRef {
        let module = Arc::new(Self {
            id,
            name,
            kind,
            superclass,
            includes: RwLock::new(Vec::new()),
            methods: RwLock::new(MethodTable::default()),
            serial: AtomicU64::new(0),
            dependents: Mutex::new(Vec::new()),
            mutation: Mutex::new(()),
            primitive: AtomicBool::new(false),
            runtime,
        });
        if let Some(superclass) = &module.superclass {
            superclass.add_dependent(&module);
        }
        module
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &Symbol {
        &self.name
    }

    pub fn kind(&self) -> ModuleKind {
        self.kind
    }

    pub fn is_class(&self) -> bool {
        self.kind == ModuleKind::Class
    }

    pub fn superclass(&self) -> Option<&ModuleRef> {
        self.superclass.as_ref()
    }

    pub fn includes(&self) -> Vec<ModuleRef> {
        self.includes.read().clone()
    }

    /// Changes whenever a lookup through this module may have changed.
    pub fn serial(&self) -> u64 {
        self.serial.load(Ordering::Acquire)
    }

    pub(crate) fn mark_primitive(&self) {
        self.primitive.store(true, Ordering::Release);
    }

    pub fn is_primitive(&self) -> bool {
        self.primitive.load(Ordering::Acquire)
    }

    fn add_dependent(&self, dependent: &ModuleRef) {
        let mut dependents = self.dependents.lock();
        dependents.retain(|weak| weak.strong_count() > 0);
        dependents.push(Arc::downgrade(dependent));
    }

    fn collect_ancestors(self: &Arc<Self>, out: &mut Vec<ModuleRef>, seen: &mut HashSet<u64>) {
        if !seen.insert(self.id) {
            return;
        }
        out.push(self.clone());
        let includes = self.includes.read().clone();
        for module in &includes {
            module.collect_ancestors(out, seen);
        }
    }

    /// Method resolution order: self, its includes, then the superclass
    /// chain. A module appears once, at its first position.
    pub fn ancestors(self: &Arc<Self>) -> Vec<ModuleRef> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(self.clone());
        while let Some(module) = current {
            module.collect_ancestors(&mut out, &mut seen);
            current = module.superclass.clone();
        }
        out
    }

    pub fn has_ancestor(self: &Arc<Self>, other: &Module) -> bool {
        self.ancestors().iter().any(|m| m.id == other.id)
    }

    /// This module's own table only.
    pub fn retrieve_method(&self, name: &Symbol) -> Option<MethodRef> {
        self.methods.read().get(name).cloned()
    }

    pub fn method_names(&self) -> Vec<Symbol> {
        self.methods.read().keys().cloned().collect()
    }

    /// First entry for `name` along the ancestors. May be an undefined
    /// marker.
    pub fn search_method(self: &Arc<Self>, name: &Symbol) -> Option<MethodRef> {
        self.ancestors()
            .iter()
            .find_map(|module| module.retrieve_method(name))
    }

    /// Lookup paired with the serial it is valid for. Retries while a
    /// mutation moves the serial underneath the walk.
    pub fn search_method_with_serial(self: &Arc<Self>, name: &Symbol) -> (Option<MethodRef>, u64) {
        loop {
            let before = self.serial();
            let method = self.search_method(name);
            if self.serial() == before {
                return (method, before);
            }
        }
    }

    /// Callable entry: undefined markers read as absent.
    pub fn find_method(self: &Arc<Self>, name: &Symbol) -> Option<MethodRef> {
        self.search_method(name).filter(|m| !m.is_undefined())
    }

    fn bump_serials(&self) {
        let mut seen = HashSet::new();
        let mut pending: Vec<ModuleRef> = Vec::new();
        self.serial.fetch_add(1, Ordering::AcqRel);
        seen.insert(self.id);
        pending.extend(self.dependents.lock().iter().filter_map(Weak::upgrade));
        while let Some(module) = pending.pop() {
            if !seen.insert(module.id) {
                continue;
            }
            module.serial.fetch_add(1, Ordering::AcqRel);
            pending.extend(module.dependents.lock().iter().filter_map(Weak::upgrade));
        }
    }

    fn mutate<R>(self: &Arc<Self>, names: &[Symbol], change: impl FnOnce() -> R) -> R {
        let _lock = self.mutation.lock();
        let before: Vec<Option<MethodRef>> = names.iter().map(|n| self.search_method(n)).collect();
        let result = change();
        self.bump_serials();

        let Some(runtime) = self.runtime.upgrade() else {
            return result;
        };
        for (name, old) in names.iter().zip(before) {
            let new = self.search_method(name);
            let changed = match (&old, &new) {
                (Some(a), Some(b)) => !Arc::ptr_eq(a, b),
                (None, None) => false,
                _ => true,
            };
            if !changed {
                continue;
            }
            if let Some(old) = &old {
                runtime.cache_map.remove(old);
            }
            if self.is_primitive() {
                runtime.mark_op_redefined(name);
            }
        }
        result
    }

    fn insert(&self, name: Symbol, method: MethodRef) {
        self.methods.write().insert(name, method);
    }

    pub fn define_method(
        self: &Arc<Self>,
        name: Symbol,
        body: Arc<dyn DynamicMethod>,
        visibility: Visibility,
    ) -> MethodRef {
        let method = Arc::new(Method::new(name.clone(), body, visibility, Arc::downgrade(self)));
        self.add_method(method.clone());
        method
    }

    pub fn add_method(self: &Arc<Self>, method: MethodRef) {
        let name = method.name().clone();
        log::debug!("define {}#{} ({:?})", self.name, name, method.visibility());
        self.mutate(std::slice::from_ref(&name), || self.insert(name.clone(), method));
    }

    pub fn alias_method(
        self: &Arc<Self>,
        new_name: Symbol,
        old_name: &Symbol,
    ) -> Result<(), RaiseError> {
        let Some(old) = self.find_method(old_name) else {
            return Err(self.undefined_method_error(old_name));
        };
        log::debug!("alias {}#{} -> {}", self.name, new_name, old_name);
        let alias = Arc::new(old.aliased());
        self.mutate(std::slice::from_ref(&new_name), || self.insert(new_name.clone(), alias));
        Ok(())
    }

    pub fn remove_method(self: &Arc<Self>, name: &Symbol) -> Result<MethodRef, RaiseError> {
        let owned = self.retrieve_method(name).filter(|m| !m.is_undefined());
        let Some(method) = owned else {
            return Err(RaiseError::new(
                ErrorKind::NameError,
                format!("method `{}' not defined in {}", name, self.name),
            ));
        };
        log::debug!("remove {}#{}", self.name, name);
        self.mutate(std::slice::from_ref(name), || {
            self.methods.write().remove(name);
        });
        Ok(method)
    }

    /// Stops lookup for `name` here, hiding any ancestor's definition.
    pub fn undef_method(self: &Arc<Self>, name: &Symbol) -> Result<(), RaiseError> {
        if self.find_method(name).is_none() {
            return Err(self.undefined_method_error(name));
        }
        log::debug!("undef {}#{}", self.name, name);
        let marker = Arc::new(Method::undefined(name.clone(), Arc::downgrade(self)));
        self.mutate(std::slice::from_ref(name), || self.insert(name.clone(), marker));
        Ok(())
    }

    /// Redefines `name` in this module with a new visibility, copying the
    /// entry down from an ancestor when needed.
    pub fn set_method_visibility(
        self: &Arc<Self>,
        name: &Symbol,
        visibility: Visibility,
    ) -> Result<(), RaiseError> {
        let Some(method) = self.find_method(name) else {
            return Err(self.undefined_method_error(name));
        };
        if method.visibility() == visibility {
            return Ok(());
        }
        log::debug!("{} {}#{}", visibility.name(), self.name, name);
        let changed = Arc::new(method.with_visibility(visibility));
        self.mutate(std::slice::from_ref(name), || self.insert(name.clone(), changed));
        Ok(())
    }

    pub fn include_module(self: &Arc<Self>, module: &ModuleRef) -> Result<(), RaiseError> {
        if module.kind != ModuleKind::Module {
            return Err(RaiseError::new(
                ErrorKind::TypeError,
                format!("wrong argument type {} (expected Module)", module.name),
            ));
        }
        if module.has_ancestor(self) {
            return Err(RaiseError::new(ErrorKind::ArgumentError, "cyclic include detected"));
        }
        if self.has_ancestor(module) {
            return Ok(());
        }
        log::debug!("include {} into {}", module.name, self.name);
        let names: Vec<Symbol> = module
            .ancestors()
            .iter()
            .flat_map(|m| m.method_names())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        self.mutate(&names, || {
            self.includes.write().insert(0, module.clone());
            module.add_dependent(self);
        });
        Ok(())
    }

    fn undefined_method_error(&self, name: &Symbol) -> RaiseError {
        let kind = if self.is_class() { "class" } else { "module" };
        RaiseError::new(
            ErrorKind::NameError,
            format!("undefined method `{}' for {} `{}'", name, kind, self.name),
        )
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("serial", &self.serial())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Value, testing::{constant_method, test_runtime}};

    #[test]
    fn ancestors_follow_includes_then_superclass() {
        let runtime = test_runtime();
        let base = runtime.define_class("Base", None);
        let derived = runtime.define_class("Derived", Some(&base));
        let first = runtime.define_module("First");
        let second = runtime.define_module("Second");
        derived.include_module(&first).unwrap();
        derived.include_module(&second).unwrap();
        let names: Vec<String> = derived
            .ancestors()
            .iter()
            .take(4)
            .map(|m| m.name().to_string())
            .collect();
        assert_eq!(names, ["Derived", "Second", "First", "Base"]);
    }

    #[test]
    fn include_rejects_cycles_and_classes() {
        let runtime = test_runtime();
        let a = runtime.define_module("A");
        let b = runtime.define_module("B");
        a.include_module(&b).unwrap();
        let err = b.include_module(&a).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ArgumentError);
        let class = runtime.define_class("NotAModule", None);
        assert_eq!(a.include_module(&class).unwrap_err().kind, ErrorKind::TypeError);
    }

    #[test]
    fn mutations_bump_dependent_serials() {
        let runtime = test_runtime();
        let base = runtime.define_class("Base", None);
        let derived = runtime.define_class("Derived", Some(&base));
        let mixin = runtime.define_module("Mixin");
        derived.include_module(&mixin).unwrap();

        let before = derived.serial();
        let name = runtime.intern("foo");
        base.define_method(name.clone(), constant_method(Value::Fixnum(1)), Visibility::Public);
        assert!(derived.serial() > before);

        let before = derived.serial();
        mixin.define_method(name.clone(), constant_method(Value::Fixnum(2)), Visibility::Public);
        assert!(derived.serial() > before);
        assert!(Arc::ptr_eq(
            &derived.search_method(&name).unwrap().implementation().unwrap(),
            &mixin
        ));
    }

    #[test]
    fn undef_hides_and_remove_reveals() {
        let runtime = test_runtime();
        let base = runtime.define_class("Base", None);
        let derived = runtime.define_class("Derived", Some(&base));
        let name = runtime.intern("foo");
        base.define_method(name.clone(), constant_method(Value::Fixnum(1)), Visibility::Public);
        derived.define_method(name.clone(), constant_method(Value::Fixnum(2)), Visibility::Public);

        derived.remove_method(&name).unwrap();
        assert!(Arc::ptr_eq(&derived.find_method(&name).unwrap().implementation().unwrap(), &base));
        assert_eq!(derived.remove_method(&name).unwrap_err().kind, ErrorKind::NameError);

        derived.undef_method(&name).unwrap();
        assert!(derived.find_method(&name).is_none());
        assert!(derived.search_method(&name).unwrap().is_undefined());
        assert!(base.find_method(&name).is_some());
    }

    #[test]
    fn alias_and_visibility_create_new_entries() {
        let runtime = test_runtime();
        let class = runtime.define_class("Thing", None);
        let (foo, bar) = (runtime.intern("foo"), runtime.intern("bar"));
        let original =
            class.define_method(foo.clone(), constant_method(Value::Nil), Visibility::Public);
        class.alias_method(bar.clone(), &foo).unwrap();
        let alias = class.find_method(&bar).unwrap();
        assert_ne!(alias.id(), original.id());
        assert_eq!(alias.name(), &foo);

        class.set_method_visibility(&foo, Visibility::Private).unwrap();
        assert_eq!(class.find_method(&foo).unwrap().visibility(), Visibility::Private);
        assert_eq!(original.visibility(), Visibility::Public);

        let missing = runtime.intern("missing");
        let err = class.alias_method(bar, &missing).unwrap_err();
        assert_eq!(err.message, "undefined method `missing' for class `Thing'");
    }

    #[test]
    fn serial_lookup_is_stable_under_concurrent_definitions() {
        let runtime = test_runtime();
        let class = runtime.define_class("Busy", None);
        let name = runtime.intern("value");
        class.define_method(name.clone(), constant_method(Value::Fixnum(0)), Visibility::Public);
        let writer = {
            let class = class.clone();
            let name = name.clone();
            std::thread::spawn(move || {
                for i in 1..200 {
                    class.define_method(
                        name.clone(),
                        constant_method(Value::Fixnum(i)),
                        Visibility::Public,
                    );
                }
            })
        };
        for _ in 0..200 {
            let (method, serial) = class.search_method_with_serial(&name);
            assert!(method.is_some());
            assert!(serial <= class.serial());
        }
        writer.join().unwrap();
    }
}
