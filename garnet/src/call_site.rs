use std::sync::{
    Arc, Weak,
    atomic::{AtomicU32, Ordering},
};

use parking_lot::RwLock;

use crate::{
    Block, CacheSite, CallType, ErrorKind, FastOp, JumpReason, MethodRef, ModuleRef, Runtime,
    RuntimeResult, Signal, Symbol, ThreadContext, Value, Visibility,
};

/// A resolved lookup, valid while the receiver class keeps this serial.
struct CacheEntry {
    class_id: u64,
    serial: u64,
    method: MethodRef,
    implementation: ModuleRef,
}

#[derive(Default)]
struct InlineCache {
    entry: RwLock<Option<Arc<CacheEntry>>>,
    misses: AtomicU32,
}

impl CacheSite for InlineCache {
    fn remove_cached_method(&self) {
        *self.entry.write() = None;
    }
}

/// One syntactic call with a monomorphic inline cache.
pub struct CallSite {
    name: Symbol,
    call_type: CallType,
    fast_op: Option<FastOp>,
    cache: Arc<InlineCache>,
}

impl CallSite {
    pub fn new(name: Symbol, call_type: CallType) -> Self {
        let fast_op = match call_type {
            CallType::Normal => FastOp::from_name(name.as_str()),
            _ => None,
        };
        Self {
            name,
            call_type,
            fast_op,
            cache: Arc::new(InlineCache::default()),
        }
    }

    pub fn name(&self) -> &Symbol {
        &self.name
    }

    pub fn call_type(&self) -> CallType {
        self.call_type
    }

    pub fn is_cached(&self) -> bool {
        self.cache.entry.read().is_some()
    }

    pub fn misses(&self) -> u32 {
        self.cache.misses.load(Ordering::Relaxed)
    }

    pub fn call(
        &self,
        ctx: &mut ThreadContext,
        receiver: &Value,
        args: &[Value],
    ) -> RuntimeResult<Value> {
        let caller = ctx.current_self().clone();
        self.dispatch(ctx, &caller, receiver, args, &Block::NULL)
    }

    /// Passes along a block that came from elsewhere (`&blk`). Breaks from
    /// it belong to the call that supplied it originally.
    pub fn call_with_block(
        &self,
        ctx: &mut ThreadContext,
        receiver: &Value,
        args: &[Value],
        block: &Block,
    ) -> RuntimeResult<Value> {
        let caller = ctx.current_self().clone();
        self.dispatch(ctx, &caller, receiver, args, block)
    }

    /// Call with a block literal: owns every `break` aimed at that block.
    pub fn call_iter(
        &self,
        ctx: &mut ThreadContext,
        receiver: &Value,
        args: &[Value],
        block: &Block,
    ) -> RuntimeResult<Value> {
        let caller = ctx.current_self().clone();
        let result = self.dispatch(ctx, &caller, receiver, args, block);
        block.escape();
        handle_iter_result(ctx, result, block)
    }

    fn dispatch(
        &self,
        ctx: &mut ThreadContext,
        caller: &Value,
        receiver: &Value,
        args: &[Value],
        block: &Block,
    ) -> RuntimeResult<Value> {
        ctx.poll_thread_events()?;
        if let (Some(op), [arg]) = (self.fast_op, args) {
            if !block.is_given() && !ctx.runtime().is_op_redefined(op) {
                if let Some(value) = op.apply(receiver, arg) {
                    return Ok(value);
                }
            }
        }

        let runtime = ctx.runtime().clone();
        let class = runtime.class_of(receiver);
        let cached = self.cache.entry.read().clone();
        if let Some(entry) = cached {
            if entry.class_id == class.id() && entry.serial == class.serial() {
                return entry
                    .method
                    .call(ctx, receiver, &entry.implementation, &self.name, args, block);
            }
        }
        self.cache_and_call(ctx, &runtime, &class, caller, receiver, args, block)
    }

    #[allow(clippy::too_many_arguments)]
    fn cache_and_call(
        &self,
        ctx: &mut ThreadContext,
        runtime: &Runtime,
        class: &ModuleRef,
        caller: &Value,
        receiver: &Value,
        args: &[Value],
        block: &Block,
    ) -> RuntimeResult<Value> {
        log::trace!("cache miss for {} on {}", self.name, class.name());
        let (method, serial) = class.search_method_with_serial(&self.name);
        let method = match method {
            Some(method) if !self.is_method_missing(ctx, &method, caller) => method,
            other => {
                return call_method_missing(
                    ctx,
                    receiver,
                    other.as_ref(),
                    &self.name,
                    args,
                    self.call_type,
                    block,
                );
            }
        };
        let implementation = method.implementation().unwrap_or_else(|| class.clone());
        self.update_cache(runtime, class, serial, &method, &implementation);
        method.call(ctx, receiver, &implementation, &self.name, args, block)
    }

    fn is_method_missing(&self, ctx: &ThreadContext, method: &MethodRef, caller: &Value) -> bool {
        method.is_undefined()
            || (self.name != *"method_missing"
                && !method.is_callable_from(caller, self.call_type, ctx))
    }

    fn update_cache(
        &self,
        runtime: &Runtime,
        class: &ModuleRef,
        serial: u64,
        method: &MethodRef,
        implementation: &ModuleRef,
    ) {
        // callability of protected methods depends on the caller
        if method.visibility() == Visibility::Protected {
            return;
        }
        let ceiling = runtime.config().max_cache_misses;
        if self.cache.misses.load(Ordering::Relaxed) >= ceiling {
            return;
        }
        let misses = self.cache.misses.fetch_add(1, Ordering::Relaxed) + 1;
        if misses == ceiling {
            log::debug!("call site for {} went megamorphic after {} misses", self.name, misses);
        }
        *self.cache.entry.write() = Some(Arc::new(CacheEntry {
            class_id: class.id(),
            serial,
            method: method.clone(),
            implementation: implementation.clone(),
        }));
        let site: Weak<dyn CacheSite> = Arc::downgrade(&self.cache) as Weak<dyn CacheSite>;
        runtime.cache_map().add(method, site);
    }
}

impl std::fmt::Debug for CallSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSite")
            .field("name", &self.name)
            .field("call_type", &self.call_type)
            .field("cached", &self.is_cached())
            .field("misses", &self.misses())
            .finish()
    }
}

fn handle_iter_result(
    ctx: &ThreadContext,
    result: RuntimeResult<Value>,
    block: &Block,
) -> RuntimeResult<Value> {
    match result {
        Err(Signal::Break(jump)) if jump.target.is_none() || jump.target == block.id() => {
            Ok(jump.value)
        }
        Err(Signal::Retry) => Err(ctx.local_jump_error(
            JumpReason::Retry,
            Value::Nil,
            "retry outside of rescue not yet supported",
        )),
        other => other,
    }
}

/// Hands a failed lookup to the receiver's `method_missing`, with the name
/// prepended to the original arguments.
pub fn call_method_missing(
    ctx: &mut ThreadContext,
    receiver: &Value,
    method: Option<&MethodRef>,
    name: &Symbol,
    args: &[Value],
    call_type: CallType,
    block: &Block,
) -> RuntimeResult<Value> {
    let visibility = method
        .filter(|m| !m.is_undefined())
        .map_or(Visibility::Public, |m| m.visibility());
    ctx.set_last_call_status(call_type, visibility);
    let runtime = ctx.runtime().clone();
    let missing = runtime.intern("method_missing");
    let class = runtime.class_of(receiver);
    let handler = if *name == missing { None } else { class.find_method(&missing) };
    let Some(handler) = handler else {
        return Err(method_missing_error(ctx, receiver, name, call_type, visibility));
    };
    let mut full = Vec::with_capacity(args.len() + 1);
    full.push(Value::Symbol(name.clone()));
    full.extend_from_slice(args);
    let implementation = handler.implementation().unwrap_or(class);
    handler.call(ctx, receiver, &implementation, &missing, &full, block)
}

/// The error the default `method_missing` raises.
pub fn method_missing_error(
    ctx: &ThreadContext,
    receiver: &Value,
    name: &Symbol,
    call_type: CallType,
    visibility: Visibility,
) -> Signal {
    let target = receiver.inspect();
    match (visibility, call_type) {
        (Visibility::Private | Visibility::ModuleFunction, _) => ctx.raise(
            ErrorKind::NoMethodError,
            format!("private method `{name}' called for {target}"),
        ),
        (Visibility::Protected, _) => ctx.raise(
            ErrorKind::NoMethodError,
            format!("protected method `{name}' called for {target}"),
        ),
        (_, CallType::Variable) => ctx.raise(
            ErrorKind::NameError,
            format!("undefined local variable or method `{name}' for {target}"),
        ),
        (_, CallType::Super) => ctx.raise(
            ErrorKind::NoMethodError,
            format!("super: no superclass method `{name}'"),
        ),
        _ => ctx.raise(
            ErrorKind::NoMethodError,
            format!("undefined method `{name}' for {target}"),
        ),
    }
}

/// Uncached functional call, for calls the runtime makes on its own.
pub fn call_method(
    ctx: &mut ThreadContext,
    receiver: &Value,
    name: &Symbol,
    args: &[Value],
) -> RuntimeResult<Value> {
    let class = ctx.runtime().class_of(receiver);
    match class.find_method(name) {
        Some(method) => {
            let implementation = method.implementation().unwrap_or(class);
            method.call(ctx, receiver, &implementation, name, args, &Block::NULL)
        }
        None => {
            call_method_missing(ctx, receiver, None, name, args, CallType::Functional, &Block::NULL)
        }
    }
}

/// `super`, resolved after the current frame's implementation class in
/// the receiver's ancestors.
#[derive(Debug, Default)]
pub struct SuperCallSite;

impl SuperCallSite {
    pub fn new() -> Self {
        Self
    }

    pub fn call(
        &self,
        ctx: &mut ThreadContext,
        args: &[Value],
        block: &Block,
    ) -> RuntimeResult<Value> {
        ctx.poll_thread_events()?;
        let frame = ctx.current_frame();
        let (Some(klass), Some(name)) = (frame.klass().cloned(), frame.name().cloned()) else {
            return Err(ctx.raise(ErrorKind::NoMethodError, "super called outside of method"));
        };
        let receiver = frame.self_value().clone();
        let class = ctx.runtime().class_of(&receiver);
        let ancestors = class.ancestors();
        let start = ancestors
            .iter()
            .position(|m| Arc::ptr_eq(m, &klass))
            .map_or(ancestors.len(), |i| i + 1);
        let found = ancestors[start..].iter().find_map(|m| m.retrieve_method(&name));
        match found {
            Some(method) if !method.is_undefined() => {
                let implementation = method.implementation().unwrap_or(class);
                method.call(ctx, &receiver, &implementation, &name, args, block)
            }
            other => call_method_missing(
                ctx,
                &receiver,
                other.as_ref(),
                &name,
                args,
                CallType::Super,
                block,
            ),
        }
    }

    pub fn call_iter(
        &self,
        ctx: &mut ThreadContext,
        args: &[Value],
        block: &Block,
    ) -> RuntimeResult<Value> {
        let result = self.call(ctx, args, block);
        block.escape();
        handle_iter_result(ctx, result, block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Arity, NativeMethod, native_fn,
        testing::{constant_method, test_runtime},
    };
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize},
        thread,
    };

    #[test]
    fn caches_and_invalidates_on_redefinition() {
        let runtime = test_runtime();
        let mut ctx = runtime.new_context();
        let class = runtime.define_class("C", None);
        let foo = runtime.intern("foo");
        let m1 =
            class.define_method(foo.clone(), constant_method(Value::Fixnum(1)), Visibility::Public);
        let obj = runtime.new_object(&class);
        let site = CallSite::new(foo.clone(), CallType::Normal);

        assert_eq!(site.call(&mut ctx, &obj, &[]).unwrap(), Value::Fixnum(1));
        assert!(site.is_cached());
        assert_eq!(runtime.cache_map().site_count(&m1), 1);

        class.define_method(foo.clone(), constant_method(Value::Fixnum(2)), Visibility::Public);
        assert!(!site.is_cached());
        assert_eq!(site.call(&mut ctx, &obj, &[]).unwrap(), Value::Fixnum(2));
    }

    #[test]
    fn include_that_shadows_a_cached_method_invalidates() {
        let runtime = test_runtime();
        let mut ctx = runtime.new_context();
        let base = runtime.define_class("Base", None);
        let class = runtime.define_class("Sub", Some(&base));
        let mixin = runtime.define_module("Mixin");
        let foo = runtime.intern("foo");
        base.define_method(foo.clone(), constant_method(Value::Fixnum(1)), Visibility::Public);
        mixin.define_method(foo.clone(), constant_method(Value::Fixnum(2)), Visibility::Public);
        let obj = runtime.new_object(&class);
        let site = CallSite::new(foo, CallType::Normal);

        assert_eq!(site.call(&mut ctx, &obj, &[]).unwrap(), Value::Fixnum(1));
        class.include_module(&mixin).unwrap();
        assert_eq!(site.call(&mut ctx, &obj, &[]).unwrap(), Value::Fixnum(2));
    }

    #[test]
    fn no_stale_result_after_concurrent_redefinition() {
        let runtime = test_runtime();
        let class = runtime.define_class("Racy", None);
        let foo = runtime.intern("foo");
        class.define_method(foo.clone(), constant_method(Value::Fixnum(1)), Visibility::Public);
        let obj = runtime.new_object(&class);
        let site = Arc::new(CallSite::new(foo.clone(), CallType::Normal));
        let redefined = Arc::new(AtomicBool::new(false));
        let stale = Arc::new(AtomicUsize::new(0));

        let reader = {
            let (runtime, site, redefined, stale, obj) =
                (runtime.clone(), site.clone(), redefined.clone(), stale.clone(), obj.clone());
            thread::Builder::new()
                .name("cache-reader".to_owned())
                .spawn(move || {
                    let mut ctx = runtime.new_context();
                    loop {
                        let done = redefined.load(Ordering::SeqCst);
                        let value = site.call(&mut ctx, &obj, &[]).unwrap();
                        if done {
                            if value != Value::Fixnum(2) {
                                stale.fetch_add(1, Ordering::SeqCst);
                            }
                            break;
                        }
                    }
                    for _ in 0..1000 {
                        if site.call(&mut ctx, &obj, &[]).unwrap() != Value::Fixnum(2) {
                            stale.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
                .unwrap()
        };

        thread::sleep(std::time::Duration::from_millis(5));
        class.define_method(foo, constant_method(Value::Fixnum(2)), Visibility::Public);
        redefined.store(true, Ordering::SeqCst);
        reader.join().unwrap();
        assert_eq!(stale.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stops_caching_at_the_miss_ceiling() {
        let runtime = test_runtime();
        let mut ctx = runtime.new_context();
        let name = runtime.intern("poly");
        let site = CallSite::new(name.clone(), CallType::Normal);
        let ceiling = runtime.config().max_cache_misses;
        for i in 0..(ceiling + 5) {
            let class = runtime.define_class(&format!("Poly{i}"), None);
            class.define_method(
                name.clone(),
                constant_method(Value::Fixnum(i as i64)),
                Visibility::Public,
            );
            let obj = runtime.new_object(&class);
            assert_eq!(site.call(&mut ctx, &obj, &[]).unwrap(), Value::Fixnum(i as i64));
        }
        assert_eq!(site.misses(), ceiling);
    }

    #[test]
    fn method_missing_receives_name_and_arguments() {
        let runtime = test_runtime();
        let mut ctx = runtime.new_context();
        let class = runtime.define_class("Ghost", None);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let handled = runtime.intern("handled");
        {
            let seen = seen.clone();
            let handled = handled.clone();
            class.define_method(
                runtime.intern("method_missing"),
                Arc::new(NativeMethod::new(
                    Arity::required(1),
                    native_fn(move |_, _, args, _| {
                        *seen.lock() = args.to_vec();
                        Ok(Value::Symbol(handled.clone()))
                    }),
                )),
                Visibility::Private,
            );
        }
        let obj = runtime.new_object(&class);
        let baz = runtime.intern("baz");
        let site = CallSite::new(baz.clone(), CallType::Normal);
        let result = site.call(&mut ctx, &obj, &[Value::Fixnum(1), Value::Fixnum(2)]).unwrap();
        assert_eq!(result, Value::Symbol(handled));
        assert_eq!(
            *seen.lock(),
            vec![Value::Symbol(baz), Value::Fixnum(1), Value::Fixnum(2)]
        );
    }

    #[test]
    fn private_methods_need_an_implicit_receiver() {
        let runtime = test_runtime();
        let mut ctx = runtime.new_context();
        let class = runtime.define_class("Shy", None);
        let secret = runtime.intern("secret");
        class.define_method(secret.clone(), constant_method(Value::Fixnum(7)), Visibility::Private);
        let obj = runtime.new_object(&class);

        let explicit = CallSite::new(secret.clone(), CallType::Normal);
        let err = explicit.call(&mut ctx, &obj, &[]).unwrap_err();
        let error = err.as_raise().unwrap();
        assert_eq!(error.kind, ErrorKind::NoMethodError);
        assert!(error.message.starts_with("private method `secret' called for"));

        let implicit = CallSite::new(secret, CallType::Functional);
        assert_eq!(implicit.call(&mut ctx, &obj, &[]).unwrap(), Value::Fixnum(7));
    }

    #[test]
    fn variable_calls_report_name_errors() {
        let runtime = test_runtime();
        let mut ctx = runtime.new_context();
        let site = CallSite::new(runtime.intern("nothing_here"), CallType::Variable);
        let main = runtime.main_object().clone();
        let err = site.call(&mut ctx, &main, &[]).unwrap_err();
        let error = err.as_raise().unwrap();
        assert_eq!(error.kind, ErrorKind::NameError);
        assert!(error.message.starts_with("undefined local variable or method `nothing_here'"));
    }

    #[test]
    fn fast_path_respects_operator_redefinition() {
        let runtime = test_runtime();
        let mut ctx = runtime.new_context();
        let plus = runtime.intern("+");
        let site = CallSite::new(plus.clone(), CallType::Normal);
        assert_eq!(
            site.call(&mut ctx, &Value::Fixnum(2), &[Value::Fixnum(3)]).unwrap(),
            Value::Fixnum(5)
        );
        assert!(!site.is_cached());

        runtime.integer_class().define_method(
            plus,
            constant_method(Value::Fixnum(42)),
            Visibility::Public,
        );
        assert!(runtime.is_op_redefined(FastOp::Plus));
        assert_eq!(
            site.call(&mut ctx, &Value::Fixnum(2), &[Value::Fixnum(3)]).unwrap(),
            Value::Fixnum(42)
        );
        assert!(site.is_cached());
    }

    #[test]
    fn super_resolves_after_the_implementing_class() {
        let runtime = test_runtime();
        let mut ctx = runtime.new_context();
        let base = runtime.define_class("Base", None);
        let derived = runtime.define_class("Derived", Some(&base));
        let greet = runtime.intern("greet");
        base.define_method(greet.clone(), constant_method(Value::Fixnum(1)), Visibility::Public);
        derived.define_method(
            greet.clone(),
            Arc::new(NativeMethod::new(
                Arity::NO_ARGUMENTS,
                native_fn(|ctx, _, args, block| {
                    let parent = SuperCallSite::new().call(ctx, args, block)?;
                    Ok(Value::Fixnum(parent.as_fixnum().unwrap_or(0) + 10))
                }),
            )),
            Visibility::Public,
        );
        let obj = runtime.new_object(&derived);
        let site = CallSite::new(greet, CallType::Normal);
        assert_eq!(site.call(&mut ctx, &obj, &[]).unwrap(), Value::Fixnum(11));

        let err = SuperCallSite::new().call(&mut ctx, &[], &Block::NULL).unwrap_err();
        assert_eq!(err.as_raise().unwrap().kind, ErrorKind::NoMethodError);
    }
}
