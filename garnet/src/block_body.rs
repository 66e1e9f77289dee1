use std::sync::Arc;

use crate::{
    Arity, Binding, DynamicScope, ErrorKind, MethodRef, ModuleRef, NativeFn, NodeRef,
    RuntimeResult, ScopeRef, Signal, SourcePosition, StaticScope, ThreadContext, Value,
    block::BlockInner,
};

/// Parameter list of a block literal. Parameters are the first `count`
/// slots of the block scope, the rest parameter the slot after them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockParams {
    pub count: usize,
    pub rest: bool,
    /// `{ }` without `|...|` accepts anything.
    pub declared: bool,
    /// `|a,|` destructures like a multi-parameter list.
    pub trailing_comma: bool,
}

impl BlockParams {
    pub const NONE: Self = Self {
        count: 0,
        rest: false,
        declared: false,
        trailing_comma: false,
    };

    pub const fn new(count: usize) -> Self {
        Self {
            count,
            rest: false,
            declared: true,
            trailing_comma: false,
        }
    }

    pub const fn with_rest(count: usize) -> Self {
        Self {
            count,
            rest: true,
            declared: true,
            trailing_comma: false,
        }
    }

    pub fn arity(&self) -> Arity {
        if !self.declared {
            Arity::OPTIONAL
        } else if self.rest {
            Arity::required(self.count)
        } else {
            Arity::fixed(self.count)
        }
    }

    fn is_multiple(&self) -> bool {
        self.count > 1 || self.trailing_comma || (self.rest && self.count > 0)
    }

    /// Reshapes yielded values to this parameter list. Returns one value per
    /// parameter slot, the rest array last.
    pub fn adapt(
        &self,
        ctx: &mut ThreadContext,
        args: &[Value],
        lambda: bool,
    ) -> RuntimeResult<Vec<Value>> {
        if !self.declared {
            return Ok(Vec::new());
        }
        if lambda {
            ctx.check_arity(self.arity(), args.len())?;
            return Ok(self.pack(args.to_vec()));
        }

        if !self.is_multiple() && !self.rest {
            return Ok(match args {
                [] if self.count == 1 => {
                    ctx.warn("multiple values for a block parameter (0 for 1)");
                    vec![Value::Nil]
                }
                [] => Vec::new(),
                [value] => vec![value.clone()],
                [first, ..] => {
                    if self.count == 1 {
                        ctx.warn(&format!(
                            "multiple values for a block parameter ({} for 1)",
                            args.len()
                        ));
                        vec![first.clone()]
                    } else {
                        Vec::new()
                    }
                }
            });
        }

        let values = match args {
            [single] if self.is_multiple() => coerce_to_array(ctx, single)?,
            _ => args.to_vec(),
        };
        if !self.rest && values.len() != self.count {
            ctx.warn(&format!(
                "multiple values for a block parameter ({} for {})",
                values.len(),
                self.count
            ));
        }
        Ok(self.pack(values))
    }

    fn pack(&self, mut values: Vec<Value>) -> Vec<Value> {
        let rest = if values.len() > self.count {
            values.split_off(self.count)
        } else {
            Vec::new()
        };
        values.resize(self.count, Value::Nil);
        if self.rest {
            values.push(Value::array(rest));
        }
        values
    }

    fn slots(&self) -> usize {
        self.count + usize::from(self.rest)
    }
}

/// `to_ary` coercion of a single value yielded to several parameters.
fn coerce_to_array(ctx: &mut ThreadContext, value: &Value) -> RuntimeResult<Vec<Value>> {
    if let Some(values) = value.array_elements() {
        return Ok(values);
    }
    let runtime = ctx.runtime().clone();
    let to_ary = runtime.intern("to_ary");
    if !runtime.respond_to(value, &to_ary) {
        return Ok(vec![value.clone()]);
    }
    let converted = crate::call_method(ctx, value, &to_ary, &[])?;
    match converted.array_elements() {
        Some(values) => Ok(values),
        None if converted.is_nil() => Ok(vec![value.clone()]),
        None => {
            let class = runtime.class_of(value).name().to_string();
            let given = runtime.class_of(&converted).name().to_string();
            Err(ctx.raise(
                ErrorKind::TypeError,
                format!("can't convert {class} to Array ({class}#to_ary gives {given})"),
            ))
        }
    }
}

#[derive(Debug)]
pub struct InterpretedBody {
    pub static_scope: Arc<StaticScope>,
    pub params: BlockParams,
    pub body: NodeRef,
    pub position: SourcePosition,
}

pub struct CompiledBody {
    pub static_scope: Arc<StaticScope>,
    pub params: BlockParams,
    pub callback: NativeFn,
}

pub struct CallbackBody {
    pub arity: Arity,
    pub callback: NativeFn,
}

pub struct MethodBody {
    pub receiver: Value,
    pub method: MethodRef,
}

/// Execution strategy of a block. Every variant honours the same yield
/// protocol.
pub enum BlockBody {
    Interpreted(InterpretedBody),
    /// Compiled code receives its adapted arguments after they have been
    /// bound into the block scope.
    Compiled(CompiledBody),
    /// Runs directly in the binding's scope, as `for` loops do.
    SharedScope(InterpretedBody),
    Native(CallbackBody),
    Method(MethodBody),
}

impl BlockBody {
    pub fn interpreted(
        static_scope: Arc<StaticScope>,
        params: BlockParams,
        body: NodeRef,
        position: SourcePosition,
    ) -> Self {
        Self::Interpreted(InterpretedBody {
            static_scope,
            params,
            body,
            position,
        })
    }

    pub fn compiled(
        static_scope: Arc<StaticScope>,
        params: BlockParams,
        callback: NativeFn,
    ) -> Self {
        Self::Compiled(CompiledBody {
            static_scope,
            params,
            callback,
        })
    }

    pub fn shared_scope(
        static_scope: Arc<StaticScope>,
        params: BlockParams,
        body: NodeRef,
        position: SourcePosition,
    ) -> Self {
        Self::SharedScope(InterpretedBody {
            static_scope,
            params,
            body,
            position,
        })
    }

    pub fn native(arity: Arity, callback: NativeFn) -> Self {
        Self::Native(CallbackBody { arity, callback })
    }

    /// `obj.method(:foo).to_proc`
    pub fn method(receiver: Value, method: MethodRef) -> Self {
        Self::Method(MethodBody { receiver, method })
    }

    pub fn arity(&self) -> Arity {
        match self {
            Self::Interpreted(body) | Self::SharedScope(body) => body.params.arity(),
            Self::Compiled(body) => body.params.arity(),
            Self::Native(body) => body.arity,
            Self::Method(body) => body.method.arity(),
        }
    }

    pub fn static_scope(&self) -> Option<&Arc<StaticScope>> {
        match self {
            Self::Interpreted(body) | Self::SharedScope(body) => Some(&body.static_scope),
            Self::Compiled(body) => Some(&body.static_scope),
            Self::Native(_) | Self::Method(_) => None,
        }
    }

    /// Scope one invocation runs in. Every yield gets its own.
    pub(crate) fn new_scope(&self, binding: &Binding) -> ScopeRef {
        match self {
            Self::Interpreted(body) => {
                DynamicScope::new(body.static_scope.clone(), Some(binding.scope().clone()))
            }
            Self::Compiled(body) => {
                DynamicScope::new(body.static_scope.clone(), Some(binding.scope().clone()))
            }
            Self::SharedScope(_) | Self::Native(_) | Self::Method(_) => binding.scope().clone(),
        }
    }

    pub(crate) fn invoke(
        &self,
        ctx: &mut ThreadContext,
        block: &BlockInner,
        args: &[Value],
        self_value: Option<Value>,
        klass: Option<ModuleRef>,
        lambda: bool,
    ) -> RuntimeResult<Value> {
        let binding = &block.binding;
        let self_value = self_value.unwrap_or_else(|| binding.self_value().clone());
        match self {
            Self::Interpreted(body) => {
                let scope = self.new_scope(binding);
                let mut ctx =
                    ctx.pre_yield(binding, Some(scope.clone()), self_value.clone(), klass)?;
                let values = body.params.adapt(&mut ctx, args, lambda)?;
                scope.set_arg_values(&values, body.params.slots());
                let frame_block = binding.frame().block().clone();
                loop {
                    ctx.poll_thread_events()?;
                    match body.body.interpret(&mut ctx, &self_value, &frame_block) {
                        Err(Signal::Redo) => continue,
                        Err(Signal::Next(value)) => return Ok(value),
                        result => return result,
                    }
                }
            }
            Self::SharedScope(body) => {
                let mut ctx = ctx.pre_yield(binding, None, self_value.clone(), klass)?;
                let values = body.params.adapt(&mut ctx, args, lambda)?;
                binding.scope().set_arg_values(&values, body.params.slots());
                let frame_block = binding.frame().block().clone();
                loop {
                    ctx.poll_thread_events()?;
                    match body.body.interpret(&mut ctx, &self_value, &frame_block) {
                        Err(Signal::Redo) => continue,
                        Err(Signal::Next(value)) => return Ok(value),
                        result => return result,
                    }
                }
            }
            Self::Compiled(body) => {
                let scope = self.new_scope(binding);
                let mut ctx =
                    ctx.pre_yield(binding, Some(scope.clone()), self_value.clone(), klass)?;
                let values = body.params.adapt(&mut ctx, args, lambda)?;
                scope.set_arg_values(&values, body.params.slots());
                let frame_block = binding.frame().block().clone();
                loop {
                    ctx.poll_thread_events()?;
                    match (body.callback)(&mut ctx, &self_value, &values, &frame_block) {
                        Err(Signal::Redo) => continue,
                        Err(Signal::Next(value)) => return Ok(value),
                        result => return result,
                    }
                }
            }
            Self::Native(body) => {
                if lambda {
                    ctx.check_arity(body.arity, args.len())?;
                }
                let mut ctx = ctx.pre_yield_no_scope(binding, self_value.clone(), klass)?;
                let frame_block = binding.frame().block().clone();
                match (body.callback)(&mut ctx, &self_value, args, &frame_block) {
                    Err(Signal::Next(value)) => Ok(value),
                    result => result,
                }
            }
            Self::Method(body) => {
                let Some(implementation) = body.method.implementation() else {
                    return Err(ctx.raise(ErrorKind::RuntimeError, "method owner was collected"));
                };
                body.method.call(
                    ctx,
                    &body.receiver,
                    &implementation,
                    body.method.name(),
                    args,
                    &crate::Block::NULL,
                )
            }
        }
    }
}

impl std::fmt::Debug for BlockBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interpreted(body) => f.debug_tuple("Interpreted").field(&body.params).finish(),
            Self::Compiled(body) => f.debug_tuple("Compiled").field(&body.params).finish(),
            Self::SharedScope(body) => f.debug_tuple("SharedScope").field(&body.params).finish(),
            Self::Native(body) => f.debug_tuple("Native").field(&body.arity).finish(),
            Self::Method(body) => f.debug_tuple("Method").field(body.method.name()).finish(),
        }
    }
}
