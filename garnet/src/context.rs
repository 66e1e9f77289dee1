use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
};

use crate::{
    Arity, BacktraceElement, Binding, Block, CallType, DynamicScope, ErrorKind, Frame,
    JumpReason, ModuleRef, RaiseError, Runtime, RuntimeResult, ScopeRef, Signal, SourcePosition,
    StaticScope, Symbol, ThreadInterrupt, Value, Visibility,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    TopLevel,
    Method,
    Block,
    Class,
    Eval,
    Scope,
}

/// One logical activation: frame, scope and class nesting pushed together.
/// `None` parts inherit from the activation below.
#[derive(Debug)]
struct Activation {
    kind: ActivationKind,
    frame: Option<Frame>,
    scope: Option<ScopeRef>,
    cref: Option<ModuleRef>,
}

/// Per-thread activation stack.
pub struct ThreadContext {
    runtime: Runtime,
    stack: Vec<Activation>,
    /// Frame depth recorded by each eval-with-binding entry.
    binding_markers: Vec<usize>,
    position: SourcePosition,
    interrupt: Arc<ThreadInterrupt>,
    max_depth: usize,
    last_call_type: CallType,
    last_visibility: Visibility,
}

/// Pops everything pushed since its creation when dropped, on every exit
/// path.
#[must_use]
pub struct ActivationGuard<'a> {
    ctx: &'a mut ThreadContext,
    depth: usize,
    markers: usize,
    position: SourcePosition,
}

impl Deref for ActivationGuard<'_> {
    type Target = ThreadContext;

    fn deref(&self) -> &ThreadContext {
        self.ctx
    }
}

impl DerefMut for ActivationGuard<'_> {
    fn deref_mut(&mut self) -> &mut ThreadContext {
        self.ctx
    }
}

impl Drop for ActivationGuard<'_> {
    fn drop(&mut self) {
        self.ctx.stack.truncate(self.depth);
        self.ctx.binding_markers.truncate(self.markers);
        self.ctx.position = self.position.clone();
    }
}

impl ThreadContext {
    pub(crate) fn new(runtime: Runtime, interrupt: Arc<ThreadInterrupt>) -> Self {
        let config = runtime.config();
        let position = SourcePosition::new(&config.script_name, 0);
        let max_depth = config.max_stack_depth;
        let object = runtime.object_class().clone();
        let frame =
            Frame::top_level(object.clone(), runtime.main_object().clone(), position.clone());
        let scope = DynamicScope::new(runtime.top_level_scope().clone(), None);
        Self {
            runtime,
            stack: vec![Activation {
                kind: ActivationKind::TopLevel,
                frame: Some(frame),
                scope: Some(scope),
                cref: Some(object),
            }],
            binding_markers: Vec::new(),
            position,
            interrupt,
            max_depth,
            last_call_type: CallType::Normal,
            last_visibility: Visibility::Public,
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn intern(&self, name: &str) -> Symbol {
        self.runtime.intern(name)
    }

    pub fn interrupt(&self) -> &Arc<ThreadInterrupt> {
        &self.interrupt
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn current_frame(&self) -> &Frame {
        self.stack
            .iter()
            .rev()
            .find_map(|a| a.frame.as_ref())
            .expect("activation stack has no frame")
    }

    pub fn current_frame_mut(&mut self) -> &mut Frame {
        self.stack
            .iter_mut()
            .rev()
            .find_map(|a| a.frame.as_mut())
            .expect("activation stack has no frame")
    }

    pub fn current_scope(&self) -> &ScopeRef {
        self.stack
            .iter()
            .rev()
            .find_map(|a| a.scope.as_ref())
            .expect("activation stack has no scope")
    }

    pub fn current_cref(&self) -> &ModuleRef {
        self.stack
            .iter()
            .rev()
            .find_map(|a| a.cref.as_ref())
            .expect("activation stack has no class")
    }

    pub fn current_self(&self) -> &Value {
        self.current_frame().self_value()
    }

    pub fn current_visibility(&self) -> Visibility {
        self.current_frame().visibility()
    }

    pub fn set_current_visibility(&mut self, visibility: Visibility) {
        self.current_frame_mut().set_visibility(visibility);
    }

    pub fn position(&self) -> &SourcePosition {
        &self.position
    }

    pub fn set_position(&mut self, position: SourcePosition) {
        self.position = position;
    }

    pub fn set_line(&mut self, line: u32) {
        self.position.line = line;
    }

    pub fn binding_frame_depth(&self) -> Option<usize> {
        self.binding_markers.last().copied()
    }

    /// Captures the current frame, class and scope.
    pub fn current_binding(&self) -> Binding {
        let klass = self
            .current_frame()
            .klass()
            .cloned()
            .or_else(|| Some(self.current_cref().clone()));
        Binding::new(
            self.current_frame(),
            klass,
            self.current_scope().clone(),
            self.position.clone(),
        )
    }

    pub fn set_last_call_status(&mut self, call_type: CallType, visibility: Visibility) {
        self.last_call_type = call_type;
        self.last_visibility = visibility;
    }

    pub fn last_call_type(&self) -> CallType {
        self.last_call_type
    }

    pub fn last_visibility(&self) -> Visibility {
        self.last_visibility
    }

    fn push(&mut self, activation: Activation) -> RuntimeResult<ActivationGuard<'_>> {
        if self.stack.len() >= self.max_depth {
            return Err(self.raise(ErrorKind::SystemStackError, "stack level too deep"));
        }
        let depth = self.stack.len();
        let markers = self.binding_markers.len();
        let position = self.position.clone();
        self.stack.push(activation);
        Ok(ActivationGuard {
            ctx: self,
            depth,
            markers,
            position,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn pre_method_frame_and_scope(
        &mut self,
        klass: &ModuleRef,
        name: &Symbol,
        self_value: &Value,
        args: &[Value],
        required_args: usize,
        block: &Block,
        static_scope: &Arc<StaticScope>,
    ) -> RuntimeResult<ActivationGuard<'_>> {
        let frame = Frame::new(
            Some(klass.clone()),
            self_value.clone(),
            Some(name.clone()),
            args.to_vec(),
            required_args,
            block.clone(),
            self.position.clone(),
        );
        let cref = static_scope.module().unwrap_or(klass).clone();
        self.push(Activation {
            kind: ActivationKind::Method,
            frame: Some(frame),
            scope: Some(DynamicScope::new(static_scope.clone(), None)),
            cref: Some(cref),
        })
    }

    pub fn pre_method_frame_only(
        &mut self,
        klass: &ModuleRef,
        name: &Symbol,
        self_value: &Value,
        args: &[Value],
        required_args: usize,
        block: &Block,
    ) -> RuntimeResult<ActivationGuard<'_>> {
        let frame = Frame::new(
            Some(klass.clone()),
            self_value.clone(),
            Some(name.clone()),
            args.to_vec(),
            required_args,
            block.clone(),
            self.position.clone(),
        );
        self.push(Activation {
            kind: ActivationKind::Method,
            frame: Some(frame),
            scope: None,
            cref: Some(klass.clone()),
        })
    }

    /// `class Foo ... end`: a public frame copy with `self` set to the
    /// class. The caller's visibility is untouched once the guard drops.
    pub fn pre_class_body(
        &mut self,
        module: &ModuleRef,
        static_scope: &Arc<StaticScope>,
    ) -> RuntimeResult<ActivationGuard<'_>> {
        let mut frame = self.current_frame().duplicate();
        frame.set_self(Value::Module(module.clone()));
        frame.set_visibility(Visibility::Public);
        frame.set_position(self.position.clone());
        self.push(Activation {
            kind: ActivationKind::Class,
            frame: Some(frame),
            scope: Some(DynamicScope::new(static_scope.clone(), None)),
            cref: Some(module.clone()),
        })
    }

    /// Re-enters a block's binding on a copy of its frame, so visibility
    /// changes inside the body die with the activation.
    pub fn pre_yield(
        &mut self,
        binding: &Binding,
        scope: Option<ScopeRef>,
        self_value: Value,
        klass: Option<ModuleRef>,
    ) -> RuntimeResult<ActivationGuard<'_>> {
        let mut frame = binding.frame().duplicate();
        frame.set_self(self_value);
        frame.set_visibility(binding.visibility());
        frame.set_position(self.position.clone());
        let cref = klass.or_else(|| binding.klass().cloned());
        self.push(Activation {
            kind: ActivationKind::Block,
            frame: Some(frame),
            scope: Some(scope.unwrap_or_else(|| binding.scope().clone())),
            cref,
        })
    }

    pub fn pre_yield_no_scope(
        &mut self,
        binding: &Binding,
        self_value: Value,
        klass: Option<ModuleRef>,
    ) -> RuntimeResult<ActivationGuard<'_>> {
        let mut frame = binding.frame().duplicate();
        frame.set_self(self_value);
        frame.set_visibility(binding.visibility());
        frame.set_position(self.position.clone());
        let cref = klass.or_else(|| binding.klass().cloned());
        self.push(Activation {
            kind: ActivationKind::Block,
            frame: Some(frame),
            scope: None,
            cref,
        })
    }

    /// Enters a binding's shared eval scope under a binding-frame marker.
    pub fn pre_eval_with_binding(
        &mut self,
        binding: &Binding,
    ) -> RuntimeResult<ActivationGuard<'_>> {
        let mut frame = binding.frame().duplicate();
        frame.set_binding_frame(true);
        frame.set_visibility(binding.visibility());
        frame.set_position(self.position.clone());
        let scope = binding.scope().eval_scope();
        scope.grow_if_needed();
        let marker = self.stack.iter().filter(|a| a.frame.is_some()).count();
        let mut guard = self.push(Activation {
            kind: ActivationKind::Eval,
            frame: Some(frame),
            scope: Some(scope),
            cref: binding.klass().cloned(),
        })?;
        guard.binding_markers.push(marker);
        guard.set_position(binding.position().clone());
        Ok(guard)
    }

    /// A nested scope over the current one, for script bodies.
    pub fn pre_scoped_body(
        &mut self,
        static_scope: &Arc<StaticScope>,
    ) -> RuntimeResult<ActivationGuard<'_>> {
        let parent = self.current_scope().clone();
        self.push(Activation {
            kind: ActivationKind::Scope,
            frame: None,
            scope: Some(DynamicScope::new(static_scope.clone(), Some(parent))),
            cref: None,
        })
    }

    /// Safe point: honours kill and pause requests from other threads.
    pub fn poll_thread_events(&mut self) -> RuntimeResult<()> {
        if !self.interrupt.is_pending() {
            return Ok(());
        }
        if self.interrupt.check_and_park() {
            log::debug!("thread observed kill request at {}", self.position);
            return Err(self.raise(ErrorKind::ThreadKill, "killed thread"));
        }
        Ok(())
    }

    pub fn new_error(&self, kind: ErrorKind, message: impl Into<String>) -> RaiseError {
        RaiseError::new(kind, message).with_backtrace(self.create_backtrace(0, None))
    }

    pub fn raise(&self, kind: ErrorKind, message: impl Into<String>) -> Signal {
        Signal::raise(self.new_error(kind, message))
    }

    pub fn local_jump_error(&self, reason: JumpReason, value: Value, message: &str) -> Signal {
        Signal::raise(
            RaiseError::local_jump(reason, value, message)
                .with_backtrace(self.create_backtrace(0, None)),
        )
    }

    pub fn check_arity(&self, arity: Arity, actual: usize) -> RuntimeResult<()> {
        arity
            .check(actual)
            .map_err(|err| self.raise(ErrorKind::ArgumentError, err.to_string()))
    }

    /// Converts whatever escaped a thread's outermost activation.
    pub fn uncaught(&self, signal: Signal) -> RaiseError {
        let error = signal.into_error();
        if error.backtrace.is_empty() {
            let backtrace = self.create_backtrace(0, None);
            error.with_backtrace(backtrace)
        } else {
            error
        }
    }

    pub fn warn(&self, message: &str) {
        self.runtime.warn(&format!("{}: warning: {}", self.position, message));
    }

    /// Walks frames from the top, skipping `level` of them. Each frame
    /// reports the line its callee was called from; the top frame the
    /// current line. Consecutive identical entries collapse into one.
    pub fn create_backtrace(
        &self,
        level: usize,
        native_origin: Option<&Symbol>,
    ) -> Vec<BacktraceElement> {
        let frames: Vec<&Frame> =
            self.stack.iter().rev().filter_map(|a| a.frame.as_ref()).collect();
        let mut backtrace: Vec<BacktraceElement> = Vec::with_capacity(frames.len() + 1);
        if let Some(origin) = native_origin {
            backtrace.push(BacktraceElement {
                method: Some(origin.clone()),
                file: Arc::from("native"),
                line: 0,
            });
        }
        let mut position = &self.position;
        for (index, frame) in frames.iter().enumerate() {
            if index >= level {
                let element = BacktraceElement {
                    method: frame.name().cloned(),
                    file: position.file.clone(),
                    line: position.line,
                };
                if backtrace.last() != Some(&element) {
                    backtrace.push(element);
                }
            }
            position = frame.position();
        }
        backtrace
    }
}

impl std::fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadContext")
            .field("stack", &self.stack.iter().map(|a| a.kind).collect::<Vec<_>>())
            .field("position", &self.position)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ArgsSpec, ScopeKind, testing::test_runtime};

    #[test]
    fn guards_restore_depth_and_position() {
        let runtime = test_runtime();
        let mut ctx = runtime.new_context();
        let base = ctx.depth();
        let name = ctx.intern("foo");
        let object = runtime.object_class().clone();
        let scope = StaticScope::method(vec![], ArgsSpec::NONE);
        {
            let mut guard = ctx
                .pre_method_frame_and_scope(
                    &object,
                    &name,
                    &Value::Nil,
                    &[],
                    0,
                    &Block::NULL,
                    &scope,
                )
                .unwrap();
            guard.set_line(42);
            assert_eq!(guard.depth(), base + 1);
            assert_eq!(guard.current_frame().name(), Some(&name));
            assert_eq!(guard.current_frame().position().line, 0);
            {
                let inner = guard
                    .pre_method_frame_only(&object, &name, &Value::Nil, &[], 0, &Block::NULL)
                    .unwrap();
                assert_eq!(inner.depth(), base + 2);
                assert_eq!(inner.current_frame().position().line, 42);
            }
            assert_eq!(guard.depth(), base + 1);
            assert_eq!(guard.position().line, 42);
        }
        assert_eq!(ctx.depth(), base);
        assert_eq!(ctx.position().line, 0);
    }

    #[test]
    fn eval_runs_at_the_binding_position_and_restores_the_caller() {
        let runtime = test_runtime();
        let mut ctx = runtime.new_context();
        ctx.set_line(3);
        let binding = ctx.current_binding();
        ctx.set_line(10);
        {
            let mut guard = ctx.pre_eval_with_binding(&binding).unwrap();
            assert_eq!(guard.position().line, 3);
            guard.set_line(4);
        }
        assert_eq!(ctx.position().line, 10);
    }

    #[test]
    fn unwinds_on_error_paths() {
        fn fails(
            ctx: &mut ThreadContext,
            class: &ModuleRef,
            name: &Symbol,
        ) -> RuntimeResult<Value> {
            let guard = ctx.pre_method_frame_only(class, name, &Value::Nil, &[], 0, &Block::NULL)?;
            Err(guard.raise(ErrorKind::RuntimeError, "boom"))
        }
        let runtime = test_runtime();
        let mut ctx = runtime.new_context();
        let base = ctx.depth();
        let name = ctx.intern("fails");
        let err = fails(&mut ctx, runtime.object_class(), &name).unwrap_err();
        assert_eq!(ctx.depth(), base);
        let error = err.as_raise().unwrap();
        assert_eq!(error.backtrace[0].method, Some(name));
    }

    #[test]
    fn deep_recursion_raises_system_stack_error() {
        fn recurse(
            ctx: &mut ThreadContext,
            class: &ModuleRef,
            name: &Symbol,
        ) -> RuntimeResult<Value> {
            let mut guard =
                ctx.pre_method_frame_only(class, name, &Value::Nil, &[], 0, &Block::NULL)?;
            recurse(&mut guard, class, name)
        }
        let runtime = test_runtime();
        let mut ctx = runtime.new_context();
        let name = ctx.intern("recurse");
        let err = recurse(&mut ctx, runtime.object_class(), &name).unwrap_err();
        let error = err.as_raise().unwrap();
        assert_eq!(error.kind, ErrorKind::SystemStackError);
        assert_eq!(error.message, "stack level too deep");
        assert_eq!(ctx.depth(), 1);
    }

    #[test]
    fn class_body_does_not_leak_visibility() {
        let runtime = test_runtime();
        let mut ctx = runtime.new_context();
        ctx.set_current_visibility(Visibility::Public);
        let class = runtime.define_class("Widget", None);
        let scope = StaticScope::class_body(class.clone(), vec![]);
        {
            let mut guard = ctx.pre_class_body(&class, &scope).unwrap();
            assert!(guard.current_self().identical(&Value::Module(class.clone())));
            guard.set_current_visibility(Visibility::Private);
            assert!(Arc::ptr_eq(guard.current_cref(), &class));
        }
        assert_eq!(ctx.current_visibility(), Visibility::Public);
    }

    #[test]
    fn backtrace_merges_identical_consecutive_entries() {
        let runtime = test_runtime();
        let mut ctx = runtime.new_context();
        let name = ctx.intern("loop_body");
        let object = runtime.object_class().clone();
        ctx.set_line(5);
        let mut a = ctx
            .pre_method_frame_only(&object, &name, &Value::Nil, &[], 0, &Block::NULL)
            .unwrap();
        a.set_line(5);
        let mut b = a
            .pre_method_frame_only(&object, &name, &Value::Nil, &[], 0, &Block::NULL)
            .unwrap();
        b.set_line(5);
        let trace = b.create_backtrace(0, None);
        assert_eq!(trace.len(), 2);
        assert_eq!(trace[0].method, Some(name.clone()));
        assert_eq!(trace[1].method, None);

        let origin = b.intern("native_thing");
        let trace = b.create_backtrace(1, Some(&origin));
        assert_eq!(trace[0].method, Some(origin));
        assert_eq!(trace[0].line, 0);
        assert_eq!(trace.len(), 3);
    }

    #[test]
    fn eval_binding_records_marker() {
        let runtime = test_runtime();
        let mut ctx = runtime.new_context();
        let binding = ctx.current_binding();
        assert_eq!(ctx.binding_frame_depth(), None);
        {
            let guard = ctx.pre_eval_with_binding(&binding).unwrap();
            assert_eq!(guard.binding_frame_depth(), Some(1));
            assert!(guard.current_frame().is_binding_frame());
            assert_eq!(guard.current_scope().static_scope().kind(), ScopeKind::Eval);
        }
        assert_eq!(ctx.binding_frame_depth(), None);
    }
}
