use std::sync::Arc;

use crate::{
    Arity, Block, BlockBody, BlockType, CoreClasses, ErrorKind, FastOp, ModuleRef, NativeMethod,
    ProcMethod, RaiseError, Runtime, RuntimeResult, Signal, Symbol, ThreadContext, Value,
    Visibility, method_missing_error, native_fn,
};

pub type BuiltinFunction = fn(&mut ThreadContext, &Value, &[Value], &Block) -> RuntimeResult<Value>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Owner {
    Kernel,
    Module,
    Class,
    Integer,
    Float,
    Array,
    Proc,
}

impl Owner {
    fn resolve(self, core: &CoreClasses) -> &ModuleRef {
        match self {
            Self::Kernel => &core.kernel,
            Self::Module => &core.module,
            Self::Class => &core.class,
            Self::Integer => &core.integer,
            Self::Float => &core.float,
            Self::Array => &core.array,
            Self::Proc => &core.proc_class,
        }
    }
}

// frameless builtins act on the caller's frame: visibility, block, binding
#[derive(Debug, Copy, Clone)]
pub struct Builtin {
    pub owner: Owner,
    pub name: &'static str,
    pub arity: Arity,
    pub visibility: Visibility,
    pub frame: bool,
    pub ptr: BuiltinFunction,
}

impl Builtin {
    pub const fn new(owner: Owner, name: &'static str, arity: Arity, ptr: BuiltinFunction) -> Self {
        Self {
            owner,
            name,
            arity,
            visibility: Visibility::Public,
            frame: true,
            ptr,
        }
    }

    pub const fn private(self) -> Self {
        Self {
            visibility: Visibility::Private,
            ..self
        }
    }

    pub const fn frameless(self) -> Self {
        Self { frame: false, ..self }
    }
}

use Owner::{Array as A, Class as C, Float as F, Integer as I, Kernel as K, Module as M, Proc as P};

const ONE: Arity = Arity::ONE_ARGUMENT;
const NONE: Arity = Arity::NO_ARGUMENTS;
const ANY: Arity = Arity::OPTIONAL;

pub const BUILTINS: &[Builtin] = &[
    Builtin::new(K, "method_missing", Arity::required(1), kernel::method_missing)
        .private()
        .frameless(),
    Builtin::new(K, "respond_to?", ONE, kernel::respond_to),
    Builtin::new(K, "equal?", ONE, kernel::equal),
    Builtin::new(K, "==", ONE, kernel::equal),
    Builtin::new(K, "class", NONE, kernel::class),
    Builtin::new(K, "block_given?", NONE, kernel::block_given).private().frameless(),
    Builtin::new(K, "proc", NONE, kernel::proc).private().frameless(),
    Builtin::new(K, "lambda", NONE, kernel::lambda).private().frameless(),
    Builtin::new(K, "binding", NONE, kernel::binding).private().frameless(),
    Builtin::new(K, "method", ONE, kernel::method).frameless(),
    Builtin::new(K, "raise", Arity::required(0), kernel::raise).private(),
    Builtin::new(M, "public", ANY, module::public).private().frameless(),
    Builtin::new(M, "private", ANY, module::private).private().frameless(),
    Builtin::new(M, "protected", ANY, module::protected).private().frameless(),
    Builtin::new(M, "module_function", ANY, module::module_function).private().frameless(),
    Builtin::new(M, "include", Arity::required(1), module::include),
    Builtin::new(M, "alias_method", Arity::TWO_ARGUMENTS, module::alias_method).private(),
    Builtin::new(M, "remove_method", ANY, module::remove_method).private(),
    Builtin::new(M, "undef_method", ANY, module::undef_method).private(),
    Builtin::new(M, "define_method", ONE, module::define_method).private(),
    Builtin::new(C, "new", ANY, class::new),
    Builtin::new(I, "+", ONE, numeric::plus),
    Builtin::new(I, "-", ONE, numeric::minus),
    Builtin::new(I, "*", ONE, numeric::mul),
    Builtin::new(I, "/", ONE, numeric::div),
    Builtin::new(I, "<", ONE, numeric::lt),
    Builtin::new(I, "<=", ONE, numeric::le),
    Builtin::new(I, ">", ONE, numeric::gt),
    Builtin::new(I, ">=", ONE, numeric::ge),
    Builtin::new(I, "==", ONE, numeric::eq),
    Builtin::new(F, "+", ONE, numeric::plus),
    Builtin::new(F, "-", ONE, numeric::minus),
    Builtin::new(F, "*", ONE, numeric::mul),
    Builtin::new(F, "/", ONE, numeric::div),
    Builtin::new(F, "<", ONE, numeric::lt),
    Builtin::new(F, "<=", ONE, numeric::le),
    Builtin::new(F, ">", ONE, numeric::gt),
    Builtin::new(F, ">=", ONE, numeric::ge),
    Builtin::new(F, "==", ONE, numeric::eq),
    Builtin::new(A, "to_ary", NONE, array::to_ary),
    Builtin::new(A, "each", NONE, array::each),
    Builtin::new(A, "size", NONE, array::size),
    Builtin::new(P, "call", ANY, procs::call),
    Builtin::new(P, "arity", NONE, procs::arity),
    Builtin::new(P, "lambda?", NONE, procs::is_lambda),
];

pub fn install(runtime: &Runtime) {
    for builtin in BUILTINS {
        let owner = builtin.owner.resolve(runtime.core());
        let function = native_fn(builtin.ptr);
        let method = if builtin.frame {
            NativeMethod::new(builtin.arity, function)
        } else {
            NativeMethod::frameless(builtin.arity, function)
        };
        owner.define_method(runtime.intern(builtin.name), Arc::new(method), builtin.visibility);
    }
}

/// Errors raised by class mutation carry no backtrace yet.
fn with_backtrace(ctx: &ThreadContext, error: RaiseError) -> Signal {
    let backtrace = ctx.create_backtrace(0, None);
    Signal::raise(error.with_backtrace(backtrace))
}

fn symbol_arg(ctx: &ThreadContext, value: &Value) -> RuntimeResult<Symbol> {
    match value {
        Value::Symbol(symbol) => Ok(symbol.clone()),
        Value::Str(name) => Ok(ctx.intern(name)),
        other => Err(ctx.raise(
            ErrorKind::TypeError,
            format!("{} is not a symbol", other.inspect()),
        )),
    }
}

fn module_receiver<'v>(ctx: &ThreadContext, receiver: &'v Value) -> RuntimeResult<&'v ModuleRef> {
    receiver.as_module().ok_or_else(|| {
        ctx.raise(
            ErrorKind::TypeError,
            format!("{} is not a class/module", receiver.inspect()),
        )
    })
}

mod kernel {
    use super::*;

    pub fn method_missing(
        ctx: &mut ThreadContext,
        receiver: &Value,
        args: &[Value],
        _: &Block,
    ) -> RuntimeResult<Value> {
        let Some(name) = args.first().and_then(Value::as_symbol) else {
            return Err(ctx.raise(ErrorKind::ArgumentError, "no id given"));
        };
        Err(method_missing_error(ctx, receiver, name, ctx.last_call_type(), ctx.last_visibility()))
    }

    pub fn respond_to(
        ctx: &mut ThreadContext,
        receiver: &Value,
        args: &[Value],
        _: &Block,
    ) -> RuntimeResult<Value> {
        let name = symbol_arg(ctx, &args[0])?;
        Ok(Value::bool(ctx.runtime().respond_to(receiver, &name)))
    }

    pub fn equal(
        _: &mut ThreadContext,
        receiver: &Value,
        args: &[Value],
        _: &Block,
    ) -> RuntimeResult<Value> {
        Ok(Value::bool(receiver.identical(&args[0])))
    }

    pub fn class(
        ctx: &mut ThreadContext,
        receiver: &Value,
        _: &[Value],
        _: &Block,
    ) -> RuntimeResult<Value> {
        Ok(Value::Module(ctx.runtime().class_of(receiver)))
    }

    pub fn block_given(
        ctx: &mut ThreadContext,
        _: &Value,
        _: &[Value],
        _: &Block,
    ) -> RuntimeResult<Value> {
        Ok(Value::bool(ctx.current_frame().block().is_given()))
    }

    pub fn proc(
        ctx: &mut ThreadContext,
        _: &Value,
        _: &[Value],
        block: &Block,
    ) -> RuntimeResult<Value> {
        if !block.is_given() {
            return Err(ctx.raise(
                ErrorKind::ArgumentError,
                "tried to create Proc object without a block",
            ));
        }
        Ok(Value::Proc(block.to_proc()))
    }

    pub fn lambda(
        ctx: &mut ThreadContext,
        _: &Value,
        _: &[Value],
        block: &Block,
    ) -> RuntimeResult<Value> {
        if !block.is_given() {
            return Err(ctx.raise(
                ErrorKind::ArgumentError,
                "tried to create Proc object without a block",
            ));
        }
        Ok(Value::Proc(block.to_lambda()))
    }

    /// `obj.method(:name)`, as a lambda bound to `obj`.
    pub fn method(
        ctx: &mut ThreadContext,
        receiver: &Value,
        args: &[Value],
        _: &Block,
    ) -> RuntimeResult<Value> {
        let name = symbol_arg(ctx, &args[0])?;
        let class = ctx.runtime().class_of(receiver);
        let Some(method) = class.find_method(&name) else {
            return Err(ctx.raise(
                ErrorKind::NameError,
                format!("undefined method `{name}' for class `{}'", class.name()),
            ));
        };
        let body = Arc::new(BlockBody::method(receiver.clone(), method));
        Ok(Value::Proc(Block::new(body, ctx.current_binding(), BlockType::Lambda)))
    }

    pub fn binding(
        ctx: &mut ThreadContext,
        _: &Value,
        _: &[Value],
        _: &Block,
    ) -> RuntimeResult<Value> {
        Ok(Value::Binding(Arc::new(ctx.current_binding())))
    }

    pub fn raise(
        ctx: &mut ThreadContext,
        _: &Value,
        args: &[Value],
        _: &Block,
    ) -> RuntimeResult<Value> {
        let message = match args.first() {
            Some(Value::Str(message)) => message.to_string(),
            Some(other) => other.inspect(),
            None => "unhandled exception".to_owned(),
        };
        Err(ctx.raise(ErrorKind::RuntimeError, message))
    }
}

mod module {
    use super::*;

    fn set_visibility(
        ctx: &mut ThreadContext,
        receiver: &Value,
        args: &[Value],
        visibility: Visibility,
    ) -> RuntimeResult<Value> {
        if args.is_empty() {
            ctx.set_current_visibility(visibility);
            return Ok(receiver.clone());
        }
        let module = module_receiver(ctx, receiver)?;
        for arg in args {
            let name = symbol_arg(ctx, arg)?;
            module
                .set_method_visibility(&name, visibility)
                .map_err(|err| with_backtrace(ctx, err))?;
        }
        Ok(receiver.clone())
    }

    pub fn public(
        ctx: &mut ThreadContext,
        receiver: &Value,
        args: &[Value],
        _: &Block,
    ) -> RuntimeResult<Value> {
        set_visibility(ctx, receiver, args, Visibility::Public)
    }

    pub fn private(
        ctx: &mut ThreadContext,
        receiver: &Value,
        args: &[Value],
        _: &Block,
    ) -> RuntimeResult<Value> {
        set_visibility(ctx, receiver, args, Visibility::Private)
    }

    pub fn protected(
        ctx: &mut ThreadContext,
        receiver: &Value,
        args: &[Value],
        _: &Block,
    ) -> RuntimeResult<Value> {
        set_visibility(ctx, receiver, args, Visibility::Protected)
    }

    pub fn module_function(
        ctx: &mut ThreadContext,
        receiver: &Value,
        args: &[Value],
        _: &Block,
    ) -> RuntimeResult<Value> {
        let module = module_receiver(ctx, receiver)?;
        if module.is_class() {
            return Err(ctx.raise(
                ErrorKind::TypeError,
                "module_function must be called for modules",
            ));
        }
        set_visibility(ctx, receiver, args, Visibility::ModuleFunction)
    }

    pub fn include(
        ctx: &mut ThreadContext,
        receiver: &Value,
        args: &[Value],
        _: &Block,
    ) -> RuntimeResult<Value> {
        let target = module_receiver(ctx, receiver)?;
        // Ruby includes the last argument first
        for arg in args.iter().rev() {
            let Some(module) = arg.as_module() else {
                let class = ctx.runtime().class_of(arg);
                return Err(ctx.raise(
                    ErrorKind::TypeError,
                    format!("wrong argument type {} (expected Module)", class.name()),
                ));
            };
            target.include_module(module).map_err(|err| with_backtrace(ctx, err))?;
        }
        Ok(receiver.clone())
    }

    pub fn alias_method(
        ctx: &mut ThreadContext,
        receiver: &Value,
        args: &[Value],
        _: &Block,
    ) -> RuntimeResult<Value> {
        let module = module_receiver(ctx, receiver)?;
        let new_name = symbol_arg(ctx, &args[0])?;
        let old_name = symbol_arg(ctx, &args[1])?;
        module
            .alias_method(new_name, &old_name)
            .map_err(|err| with_backtrace(ctx, err))?;
        Ok(receiver.clone())
    }

    pub fn remove_method(
        ctx: &mut ThreadContext,
        receiver: &Value,
        args: &[Value],
        _: &Block,
    ) -> RuntimeResult<Value> {
        let module = module_receiver(ctx, receiver)?;
        for arg in args {
            let name = symbol_arg(ctx, arg)?;
            module.remove_method(&name).map_err(|err| with_backtrace(ctx, err))?;
        }
        Ok(receiver.clone())
    }

    pub fn undef_method(
        ctx: &mut ThreadContext,
        receiver: &Value,
        args: &[Value],
        _: &Block,
    ) -> RuntimeResult<Value> {
        let module = module_receiver(ctx, receiver)?;
        for arg in args {
            let name = symbol_arg(ctx, arg)?;
            module.undef_method(&name).map_err(|err| with_backtrace(ctx, err))?;
        }
        Ok(receiver.clone())
    }

    pub fn define_method(
        ctx: &mut ThreadContext,
        receiver: &Value,
        args: &[Value],
        block: &Block,
    ) -> RuntimeResult<Value> {
        let module = module_receiver(ctx, receiver)?;
        let name = symbol_arg(ctx, &args[0])?;
        if !block.is_given() {
            return Err(ctx.raise(
                ErrorKind::ArgumentError,
                "tried to create Proc object without a block",
            ));
        }
        module.define_method(name.clone(), Arc::new(ProcMethod::new(block)), Visibility::Public);
        Ok(Value::Symbol(name))
    }
}

mod class {
    use super::*;

    /// Allocates an instance and runs `initialize` on it when one is defined.
    pub fn new(
        ctx: &mut ThreadContext,
        receiver: &Value,
        args: &[Value],
        block: &Block,
    ) -> RuntimeResult<Value> {
        let class = module_receiver(ctx, receiver)?;
        if !class.is_class() {
            return Err(ctx.raise(
                ErrorKind::NoMethodError,
                format!("undefined method `new' for {}", receiver.inspect()),
            ));
        }
        let runtime = ctx.runtime().clone();
        let object = runtime.new_object(class);
        let initialize = runtime.intern("initialize");
        if let Some(method) = class.find_method(&initialize) {
            let implementation = method.implementation().unwrap_or_else(|| class.clone());
            method.call(ctx, &object, &implementation, &initialize, args, block)?;
        } else if !args.is_empty() {
            return Err(ctx.raise(
                ErrorKind::ArgumentError,
                format!("wrong number of arguments ({} for 0)", args.len()),
            ));
        }
        Ok(object)
    }
}

mod numeric {
    use super::*;

    /// Slow path for `Integer` and `Float` operators. The fast path has
    /// already handled every case it could, so what is left is mixed
    /// operands, overflow, division by zero and type errors.
    fn binop(
        op: FastOp,
        ctx: &ThreadContext,
        receiver: &Value,
        arg: &Value,
    ) -> RuntimeResult<Value> {
        if let Some(value) = op.apply(receiver, arg) {
            return Ok(value);
        }
        match (receiver, arg) {
            (Value::Fixnum(a), Value::Float(b)) => Ok(op.apply_float(*a as f64, *b)),
            (Value::Fixnum(_), Value::Fixnum(0)) if op == FastOp::Div => {
                Err(ctx.raise(ErrorKind::ZeroDivisionError, "divided by 0"))
            }
            (Value::Fixnum(_), Value::Fixnum(_)) => {
                Err(ctx.raise(ErrorKind::RangeError, "integer overflow"))
            }
            _ if op == FastOp::Eq => Ok(Value::False),
            _ => {
                let runtime = ctx.runtime();
                Err(ctx.raise(
                    ErrorKind::TypeError,
                    format!(
                        "{} can't be coerced into {}",
                        runtime.class_of(arg).name(),
                        runtime.class_of(receiver).name()
                    ),
                ))
            }
        }
    }

    macro_rules! binops {
        ($($name:ident => $op:expr),* $(,)?) => {
            $(
                pub fn $name(
                    ctx: &mut ThreadContext,
                    receiver: &Value,
                    args: &[Value],
                    _: &Block,
                ) -> RuntimeResult<Value> {
                    binop($op, ctx, receiver, &args[0])
                }
            )*
        };
    }

    binops! {
        plus => FastOp::Plus,
        minus => FastOp::Minus,
        mul => FastOp::Mul,
        div => FastOp::Div,
        lt => FastOp::Lt,
        le => FastOp::Le,
        gt => FastOp::Gt,
        ge => FastOp::Ge,
        eq => FastOp::Eq,
    }
}

mod array {
    use super::*;

    pub fn to_ary(
        _: &mut ThreadContext,
        receiver: &Value,
        _: &[Value],
        _: &Block,
    ) -> RuntimeResult<Value> {
        Ok(receiver.clone())
    }

    pub fn each(
        ctx: &mut ThreadContext,
        receiver: &Value,
        _: &[Value],
        block: &Block,
    ) -> RuntimeResult<Value> {
        for value in receiver.array_elements().unwrap_or_default() {
            block.yield_specific(ctx, [value])?;
        }
        Ok(receiver.clone())
    }

    pub fn size(
        _: &mut ThreadContext,
        receiver: &Value,
        _: &[Value],
        _: &Block,
    ) -> RuntimeResult<Value> {
        let len = receiver.array_elements().map_or(0, |values| values.len());
        Ok(Value::Fixnum(len as i64))
    }
}

mod procs {
    use super::*;

    pub fn call(
        ctx: &mut ThreadContext,
        receiver: &Value,
        args: &[Value],
        _: &Block,
    ) -> RuntimeResult<Value> {
        match receiver.as_block() {
            Some(block) => block.call(ctx, args),
            None => Ok(Value::Nil),
        }
    }

    pub fn arity(
        _: &mut ThreadContext,
        receiver: &Value,
        _: &[Value],
        _: &Block,
    ) -> RuntimeResult<Value> {
        let arity = receiver.as_block().map_or(Arity::OPTIONAL, Block::arity);
        Ok(Value::Fixnum(arity.value()))
    }

    pub fn is_lambda(
        _: &mut ThreadContext,
        receiver: &Value,
        _: &[Value],
        _: &Block,
    ) -> RuntimeResult<Value> {
        Ok(Value::bool(receiver.as_block().is_some_and(Block::is_lambda)))
    }
}
