use std::{
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::{
    ArgsSpec, Arity, Block, CallType, Module, ModuleRef, NodeRef, RuntimeResult, Signal,
    SourcePosition, StaticScope, Symbol, ThreadContext, Value, Visibility,
};

pub type NativeFn =
    Arc<dyn Fn(&mut ThreadContext, &Value, &[Value], &Block) -> RuntimeResult<Value> + Send + Sync>;

pub fn native_fn<F>(function: F) -> NativeFn
where
    F: Fn(&mut ThreadContext, &Value, &[Value], &Block) -> RuntimeResult<Value>
        + Send
        + Sync
        + 'static,
{
    Arc::new(function)
}

/// Something a call site can invoke once it resolved a name.
pub trait DynamicMethod: Send + Sync {
    fn call(
        &self,
        ctx: &mut ThreadContext,
        receiver: &Value,
        implementation: &ModuleRef,
        name: &Symbol,
        args: &[Value],
        block: &Block,
    ) -> RuntimeResult<Value>;

    fn arity(&self) -> Arity;

    fn is_native(&self) -> bool {
        false
    }
}

static NEXT_METHOD_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodId(u64);

impl MethodId {
    fn fresh() -> Self {
        Self(NEXT_METHOD_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Immutable method table entry. Changing anything about a method means
/// installing a new entry, which gives call sites a new identity to track.
pub struct Method {
    id: MethodId,
    name: Symbol,
    body: Option<Arc<dyn DynamicMethod>>,
    visibility: Visibility,
    implementation: Weak<Module>,
}

pub type MethodRef = Arc<Method>;

impl Method {
    pub fn new(
        name: Symbol,
        body: Arc<dyn DynamicMethod>,
        visibility: Visibility,
        implementation: Weak<Module>,
    ) -> Self {
        Self {
            id: MethodId::fresh(),
            name,
            body: Some(body),
            visibility,
            implementation,
        }
    }

    /// Marker left by `undef_method`.
    pub fn undefined(name: Symbol, implementation: Weak<Module>) -> Self {
        Self {
            id: MethodId::fresh(),
            name,
            body: None,
            visibility: Visibility::Public,
            implementation,
        }
    }

    pub fn id(&self) -> MethodId {
        self.id
    }

    pub fn name(&self) -> &Symbol {
        &self.name
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn is_undefined(&self) -> bool {
        self.body.is_none()
    }

    pub fn arity(&self) -> Arity {
        self.body.as_ref().map_or(Arity::OPTIONAL, |body| body.arity())
    }

    pub fn is_native(&self) -> bool {
        self.body.as_ref().is_some_and(|body| body.is_native())
    }

    /// Module whose table originally held this method.
    pub fn implementation(&self) -> Option<ModuleRef> {
        self.implementation.upgrade()
    }

    pub fn with_visibility(&self, visibility: Visibility) -> Self {
        Self {
            id: MethodId::fresh(),
            name: self.name.clone(),
            body: self.body.clone(),
            visibility,
            implementation: self.implementation.clone(),
        }
    }

    pub fn aliased(&self) -> Self {
        self.with_visibility(self.visibility)
    }

    /// Private methods only answer implicit-receiver calls, protected ones
    /// only callers that are kind_of the implementing module.
    pub fn is_callable_from(
        &self,
        caller: &Value,
        call_type: CallType,
        ctx: &ThreadContext,
    ) -> bool {
        match self.visibility {
            Visibility::Public => true,
            Visibility::Private | Visibility::ModuleFunction => call_type != CallType::Normal,
            Visibility::Protected => {
                if call_type != CallType::Normal {
                    return true;
                }
                let Some(implementation) = self.implementation() else {
                    return false;
                };
                ctx.runtime().class_of(caller).has_ancestor(&implementation)
            }
        }
    }

    pub fn call(
        &self,
        ctx: &mut ThreadContext,
        receiver: &Value,
        implementation: &ModuleRef,
        name: &Symbol,
        args: &[Value],
        block: &Block,
    ) -> RuntimeResult<Value> {
        match &self.body {
            Some(body) => body.call(ctx, receiver, implementation, name, args, block),
            None => Err(ctx.raise(
                crate::ErrorKind::NoMethodError,
                format!("undefined method `{}' for {}", name, receiver.inspect()),
            )),
        }
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("visibility", &self.visibility)
            .field("undefined", &self.is_undefined())
            .finish()
    }
}

/// A method implemented in Rust.
pub struct NativeMethod {
    arity: Arity,
    /// Frameless natives act on their caller's frame.
    frame: bool,
    function: NativeFn,
}

impl NativeMethod {
    pub fn new(arity: Arity, function: NativeFn) -> Self {
        Self {
            arity,
            frame: true,
            function,
        }
    }

    pub fn frameless(arity: Arity, function: NativeFn) -> Self {
        Self {
            arity,
            frame: false,
            function,
        }
    }
}

impl DynamicMethod for NativeMethod {
    fn call(
        &self,
        ctx: &mut ThreadContext,
        receiver: &Value,
        implementation: &ModuleRef,
        name: &Symbol,
        args: &[Value],
        block: &Block,
    ) -> RuntimeResult<Value> {
        ctx.check_arity(self.arity, args.len())?;
        if !self.frame {
            return (self.function)(ctx, receiver, args, block);
        }
        let mut ctx = ctx.pre_method_frame_only(
            implementation,
            name,
            receiver,
            args,
            self.arity.required_count(),
            block,
        )?;
        (self.function)(&mut ctx, receiver, args, block)
    }

    fn arity(&self) -> Arity {
        self.arity
    }

    fn is_native(&self) -> bool {
        true
    }
}

/// A method whose body is an AST.
pub struct InterpretedMethod {
    static_scope: Arc<StaticScope>,
    body: NodeRef,
    position: SourcePosition,
}

impl InterpretedMethod {
    pub fn new(static_scope: Arc<StaticScope>, body: NodeRef, position: SourcePosition) -> Self {
        Self {
            static_scope,
            body,
            position,
        }
    }

    fn args(&self) -> &ArgsSpec {
        self.static_scope.args()
    }

    /// Positional values first, excess folded into the rest array.
    fn prepare_args(&self, args: &[Value]) -> (Vec<Value>, usize) {
        let spec = self.args();
        let positional = spec.positional().min(args.len());
        let mut values = args[..positional].to_vec();
        if spec.rest {
            values.resize(spec.positional(), Value::Nil);
            values.push(Value::array(args[positional..].to_vec()));
            return (values, spec.positional() + 1);
        }
        (values, positional)
    }
}

impl DynamicMethod for InterpretedMethod {
    fn call(
        &self,
        ctx: &mut ThreadContext,
        receiver: &Value,
        implementation: &ModuleRef,
        name: &Symbol,
        args: &[Value],
        block: &Block,
    ) -> RuntimeResult<Value> {
        let spec = *self.args();
        Arity::check_range(args.len(), spec.required, spec.max())
            .map_err(|err| ctx.raise(crate::ErrorKind::ArgumentError, err.to_string()))?;
        let mut ctx = ctx.pre_method_frame_and_scope(
            implementation,
            name,
            receiver,
            args,
            spec.required,
            block,
            &self.static_scope,
        )?;
        ctx.set_position(self.position.clone());
        let (values, size) = self.prepare_args(args);
        ctx.current_scope().set_arg_values(&values, size);
        let target = ctx.current_frame().jump_target();
        match self.body.interpret(&mut ctx, receiver, block) {
            Err(Signal::Return { target: t, value }) if t == target => Ok(value),
            result => result,
        }
    }

    fn arity(&self) -> Arity {
        Arity::from_args_spec(self.args())
    }
}

/// `define_method(:name) { ... }`: the block runs as a lambda with `self`
/// rebound to the receiver.
pub struct ProcMethod {
    block: Block,
}

impl ProcMethod {
    pub fn new(block: &Block) -> Self {
        Self {
            block: block.to_lambda(),
        }
    }
}

impl DynamicMethod for ProcMethod {
    fn call(
        &self,
        ctx: &mut ThreadContext,
        receiver: &Value,
        implementation: &ModuleRef,
        _name: &Symbol,
        args: &[Value],
        _block: &Block,
    ) -> RuntimeResult<Value> {
        self.block
            .call_under(ctx, args, receiver.clone(), Some(implementation.clone()))
    }

    fn arity(&self) -> Arity {
        self.block.arity()
    }
}
