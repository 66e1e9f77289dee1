use std::{
    collections::{HashMap, VecDeque},
    ops::Deref,
    sync::{
        Arc, Weak,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
};

use parking_lot::{Mutex, RwLock};

use crate::{
    ArgsSpec, Block, CacheMap, ErrorKind, FastOp, Module, ModuleKind, ModuleRef, RObject,
    RaiseError, RuntimeThread, ScopeKind, StaticScope, Symbol, SymbolTable, ThreadContext,
    ThreadInterrupt, ThreadShared, ThreadState, Value, builtins, threads::spawn_native,
};

#[derive(Debug, Clone)]
pub struct RuntimeCreateInfo {
    /// Inline cache updates a call site accepts before it stops caching.
    pub max_cache_misses: u32,
    pub max_stack_depth: usize,
    pub verbose: bool,
    /// Most recent warnings kept for `take_warnings`.
    pub warning_buffer: usize,
    pub script_name: String,
    pub thread_stack_size: usize,
}

impl Default for RuntimeCreateInfo {
    fn default() -> Self {
        Self {
            max_cache_misses: 50,
            max_stack_depth: 1024,
            verbose: true,
            warning_buffer: 256,
            script_name: "-".to_owned(),
            thread_stack_size: 16 * 1024 * 1024,
        }
    }
}

/// Classes the runtime itself needs to reach.
#[derive(Debug)]
pub struct CoreClasses {
    pub basic_object: ModuleRef,
    pub object: ModuleRef,
    pub module: ModuleRef,
    pub class: ModuleRef,
    pub kernel: ModuleRef,
    pub comparable: ModuleRef,
    pub nil: ModuleRef,
    pub true_class: ModuleRef,
    pub false_class: ModuleRef,
    pub numeric: ModuleRef,
    pub integer: ModuleRef,
    pub float: ModuleRef,
    pub symbol: ModuleRef,
    pub string: ModuleRef,
    pub array: ModuleRef,
    pub proc_class: ModuleRef,
    pub binding: ModuleRef,
}

type ClassRegistry = HashMap<Symbol, ModuleRef, ahash::RandomState>;

#[derive(Debug)]
pub struct RuntimeShared {
    symbols: SymbolTable,
    pub(crate) cache_map: CacheMap,
    core: CoreClasses,
    classes: RwLock<ClassRegistry>,
    config: RuntimeCreateInfo,
    /// One bit per `FastOp` whose Integer or Float method was replaced.
    redefined_ops: AtomicU32,
    warnings: Mutex<VecDeque<String>>,
    next_id: AtomicU64,
    main_object: Value,
    top_level_scope: Arc<StaticScope>,
}

#[derive(Debug, Clone)]
pub struct Runtime(Arc<RuntimeShared>);

impl Deref for Runtime {
    type Target = RuntimeShared;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl CoreClasses {
    fn bootstrap(
        runtime: &Weak<RuntimeShared>,
        symbols: &SymbolTable,
        next_id: &AtomicU64,
    ) -> Self {
        let new = |name: &str, kind: ModuleKind, superclass: Option<&ModuleRef>| {
            Module::new(
                runtime.clone(),
                next_id.fetch_add(1, Ordering::Relaxed),
                symbols.intern(name),
                kind,
                superclass.cloned(),
            )
        };
        let class =
            |name: &str, superclass: &ModuleRef| new(name, ModuleKind::Class, Some(superclass));

        let basic_object = new("BasicObject", ModuleKind::Class, None);
        let object = class("Object", &basic_object);
        let module = class("Module", &object);
        let numeric = class("Numeric", &object);
        Self {
            class: class("Class", &module),
            kernel: new("Kernel", ModuleKind::Module, None),
            comparable: new("Comparable", ModuleKind::Module, None),
            nil: class("NilClass", &object),
            true_class: class("TrueClass", &object),
            false_class: class("FalseClass", &object),
            integer: class("Integer", &numeric),
            float: class("Float", &numeric),
            symbol: class("Symbol", &object),
            string: class("String", &object),
            array: class("Array", &object),
            proc_class: class("Proc", &object),
            binding: class("Binding", &object),
            basic_object,
            object,
            module,
            numeric,
        }
    }

    fn all(&self) -> [&ModuleRef; 17] {
        [
            &self.basic_object,
            &self.object,
            &self.module,
            &self.class,
            &self.kernel,
            &self.comparable,
            &self.nil,
            &self.true_class,
            &self.false_class,
            &self.numeric,
            &self.integer,
            &self.float,
            &self.symbol,
            &self.string,
            &self.array,
            &self.proc_class,
            &self.binding,
        ]
    }
}

impl Runtime {
    pub fn new(info: RuntimeCreateInfo) -> Result<Self, RaiseError> {
        let symbols = SymbolTable::new();
        let next_id = AtomicU64::new(1);
        let shared = Arc::new_cyclic(|weak| {
            let core = CoreClasses::bootstrap(weak, &symbols, &next_id);
            let classes: ClassRegistry = core
                .all()
                .into_iter()
                .map(|module| (module.name().clone(), module.clone()))
                .collect();
            let main_object = Value::Object(Arc::new(RObject::new(core.object.clone())));
            RuntimeShared {
                symbols: symbols.clone(),
                cache_map: CacheMap::new(),
                classes: RwLock::new(classes),
                config: info,
                redefined_ops: AtomicU32::new(0),
                warnings: Mutex::new(VecDeque::new()),
                next_id: AtomicU64::new(next_id.load(Ordering::Relaxed)),
                main_object,
                top_level_scope: StaticScope::new(
                    ScopeKind::TopLevel,
                    Vec::new(),
                    ArgsSpec::NONE,
                    None,
                ),
                core,
            }
        });
        let runtime = Self(shared);
        runtime.init_new()?;
        Ok(runtime)
    }

    fn init_new(&self) -> Result<(), RaiseError> {
        let core = &self.core;
        core.object.include_module(&core.kernel)?;
        core.numeric.include_module(&core.comparable)?;
        builtins::install(self);
        // only redefinitions after bootstrap disable the fast path
        core.integer.mark_primitive();
        core.float.mark_primitive();
        log::debug!("runtime ready with {} classes", self.classes.read().len());
        Ok(())
    }

    pub fn new_context(&self) -> ThreadContext {
        ThreadContext::new(self.clone(), ThreadInterrupt::new())
    }

    /// Returns the registered class of that name, or creates it under
    /// `superclass` (Object by default).
    pub fn define_class(&self, name: &str, superclass: Option<&ModuleRef>) -> ModuleRef {
        let superclass = superclass.unwrap_or(&self.core.object);
        self.register(name, ModuleKind::Class, Some(superclass))
    }

    pub fn define_module(&self, name: &str) -> ModuleRef {
        self.register(name, ModuleKind::Module, None)
    }

    fn register(&self, name: &str, kind: ModuleKind, superclass: Option<&ModuleRef>) -> ModuleRef {
        let symbol = self.intern(name);
        let mut classes = self.classes.write();
        if let Some(existing) = classes.get(&symbol) {
            return existing.clone();
        }
        let module = Module::new(
            Arc::downgrade(&self.0),
            self.next_id.fetch_add(1, Ordering::Relaxed),
            symbol.clone(),
            kind,
            superclass.cloned(),
        );
        log::debug!("new {:?} {}", kind, symbol);
        classes.insert(symbol, module.clone());
        module
    }

    /// Runs `block` on a fresh native thread with its own context.
    pub fn spawn_thread(
        &self,
        block: &Block,
        args: Vec<Value>,
    ) -> Result<RuntimeThread, RaiseError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let shared = ThreadShared::new(id);
        let block = block.for_thread();
        let runtime = self.clone();
        let thread = shared.clone();
        let handle = spawn_native(format!("garnet-{id}"), self.config.thread_stack_size, move || {
            {
                let mut state = thread.state.lock();
                if *state == ThreadState::Created {
                    *state = ThreadState::Running;
                }
            }
            let mut ctx = ThreadContext::new(runtime, thread.interrupt.clone());
            let outcome = match block.call(&mut ctx, &args) {
                Ok(value) => Ok(value),
                Err(signal) => {
                    let error = ctx.uncaught(signal);
                    if error.kind == ErrorKind::ThreadKill {
                        Ok(Value::Nil)
                    } else {
                        log::debug!("thread {} terminated with {}", thread.id, error);
                        Err(error)
                    }
                }
            };
            thread.finish(outcome);
        })
        .map_err(|err| {
            RaiseError::new(ErrorKind::RuntimeError, format!("can't create thread: {err}"))
        })?;
        Ok(RuntimeThread::new(shared, handle))
    }
}

impl RuntimeShared {
    pub fn config(&self) -> &RuntimeCreateInfo {
        &self.config
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn intern(&self, name: &str) -> Symbol {
        self.symbols.intern(name)
    }

    pub fn cache_map(&self) -> &CacheMap {
        &self.cache_map
    }

    pub fn core(&self) -> &CoreClasses {
        &self.core
    }

    pub fn object_class(&self) -> &ModuleRef {
        &self.core.object
    }

    pub fn integer_class(&self) -> &ModuleRef {
        &self.core.integer
    }

    pub fn float_class(&self) -> &ModuleRef {
        &self.core.float
    }

    pub fn main_object(&self) -> &Value {
        &self.main_object
    }

    pub fn top_level_scope(&self) -> &Arc<StaticScope> {
        &self.top_level_scope
    }

    pub fn class_of(&self, value: &Value) -> ModuleRef {
        let core = &self.core;
        match value {
            Value::Nil => core.nil.clone(),
            Value::True => core.true_class.clone(),
            Value::False => core.false_class.clone(),
            Value::Fixnum(_) => core.integer.clone(),
            Value::Float(_) => core.float.clone(),
            Value::Symbol(_) => core.symbol.clone(),
            Value::Str(_) => core.string.clone(),
            Value::Array(_) => core.array.clone(),
            Value::Object(object) => object.class().clone(),
            Value::Module(module) if module.is_class() => core.class.clone(),
            Value::Module(_) => core.module.clone(),
            Value::Proc(_) => core.proc_class.clone(),
            Value::Binding(_) => core.binding.clone(),
        }
    }

    pub fn get_class(&self, name: &str) -> Option<ModuleRef> {
        self.classes.read().get(&self.intern(name)).cloned()
    }

    pub fn new_object(&self, class: &ModuleRef) -> Value {
        Value::Object(Arc::new(RObject::new(class.clone())))
    }

    /// Public or protected method reachable by name.
    pub fn respond_to(&self, value: &Value, name: &Symbol) -> bool {
        self.class_of(value)
            .find_method(name)
            .is_some_and(|method| !method.visibility().is_private())
    }

    pub fn mark_op_redefined(&self, name: &Symbol) {
        if let Some(op) = FastOp::from_name(name.as_str()) {
            let previous = self.redefined_ops.fetch_or(op.bit(), Ordering::AcqRel);
            if previous & op.bit() == 0 {
                log::debug!("fast path for {} disabled", op.name());
            }
        }
    }

    #[inline]
    pub fn is_op_redefined(&self, op: FastOp) -> bool {
        self.redefined_ops.load(Ordering::Acquire) & op.bit() != 0
    }

    pub fn warn(&self, message: &str) {
        if !self.config.verbose {
            return;
        }
        log::warn!("{message}");
        let mut warnings = self.warnings.lock();
        warnings.push_back(message.to_owned());
        while warnings.len() > self.config.warning_buffer {
            warnings.pop_front();
        }
    }

    pub fn take_warnings(&self) -> Vec<String> {
        self.warnings.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Visibility, testing::constant_method, testing::test_runtime};

    #[test]
    fn core_classes_are_registered() {
        let runtime = test_runtime();
        for name in ["BasicObject", "Object", "Kernel", "Integer", "Float", "Proc", "Binding"] {
            assert!(runtime.get_class(name).is_some(), "{name} missing");
        }
        let integer = runtime.integer_class().clone();
        assert!(Arc::ptr_eq(&runtime.class_of(&Value::Fixnum(1)), &integer));
        let ancestors: Vec<String> =
            integer.ancestors().iter().map(|m| m.name().to_string()).collect();
        assert_eq!(
            ancestors,
            ["Integer", "Numeric", "Comparable", "Object", "Kernel", "BasicObject"]
        );
    }

    #[test]
    fn define_class_reopens_by_name() {
        let runtime = test_runtime();
        let first = runtime.define_class("Point", None);
        let again = runtime.define_class("Point", None);
        assert!(Arc::ptr_eq(&first, &again));
        assert!(Arc::ptr_eq(first.superclass().unwrap(), runtime.object_class()));
    }

    #[test]
    fn bootstrap_leaves_fast_paths_enabled() {
        let runtime = test_runtime();
        assert!(!runtime.is_op_redefined(FastOp::Plus));
        let name = runtime.intern("-");
        runtime.float_class().define_method(name, constant_method(Value::Nil), Visibility::Public);
        assert!(runtime.is_op_redefined(FastOp::Minus));
        assert!(!runtime.is_op_redefined(FastOp::Plus));
    }

    #[test]
    fn warnings_are_bounded() {
        let runtime = Runtime::new(RuntimeCreateInfo {
            warning_buffer: 2,
            ..Default::default()
        })
        .unwrap();
        for i in 0..5 {
            runtime.warn(&format!("w{i}"));
        }
        assert_eq!(runtime.take_warnings(), ["w3", "w4"]);
        assert!(runtime.take_warnings().is_empty());
    }
}
