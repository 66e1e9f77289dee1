use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use crate::{
    Arity, Binding, BlockBody, JumpReason, ModuleRef, NativeFn, RuntimeResult, Signal,
    ThreadContext, Value,
};

static NEXT_BLOCK_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a block literal's capture. `break` correlates with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u64);

impl BlockId {
    fn fresh() -> Self {
        Self(NEXT_BLOCK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Normal,
    Proc,
    Lambda,
    Thread,
}

pub(crate) struct BlockInner {
    pub(crate) id: BlockId,
    pub(crate) body: Arc<BlockBody>,
    pub(crate) binding: Binding,
    pub(crate) block_type: BlockType,
    /// Set once the call that supplied this block has returned.
    pub(crate) escaped: Arc<AtomicBool>,
}

/// A closure value, or the "no block given" sentinel.
#[derive(Clone)]
pub struct Block(Option<Arc<BlockInner>>);

impl Block {
    pub const NULL: Block = Block(None);

    pub fn new(body: Arc<BlockBody>, binding: Binding, block_type: BlockType) -> Self {
        Self(Some(Arc::new(BlockInner {
            id: BlockId::fresh(),
            body,
            binding,
            block_type,
            escaped: Arc::new(AtomicBool::new(false)),
        })))
    }

    /// A block backed by a Rust callback, capturing the caller's binding.
    pub fn native(ctx: &ThreadContext, arity: Arity, callback: NativeFn) -> Self {
        Self::new(
            Arc::new(BlockBody::native(arity, callback)),
            ctx.current_binding(),
            BlockType::Normal,
        )
    }

    pub fn is_given(&self) -> bool {
        self.0.is_some()
    }

    pub fn id(&self) -> Option<BlockId> {
        self.0.as_ref().map(|inner| inner.id)
    }

    pub fn block_type(&self) -> Option<BlockType> {
        self.0.as_ref().map(|inner| inner.block_type)
    }

    pub fn is_lambda(&self) -> bool {
        self.block_type() == Some(BlockType::Lambda)
    }

    pub fn arity(&self) -> Arity {
        match &self.0 {
            Some(inner) => inner.body.arity(),
            None => Arity::OPTIONAL,
        }
    }

    pub fn binding(&self) -> Option<&Binding> {
        self.0.as_ref().map(|inner| &inner.binding)
    }

    pub fn body(&self) -> Option<&Arc<BlockBody>> {
        self.0.as_ref().map(|inner| &inner.body)
    }

    pub fn same_block(&self, other: &Block) -> bool {
        match (&self.0, &other.0) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }

    /// Marks the block as outliving the call that supplied it.
    pub fn escape(&self) {
        if let Some(inner) = &self.0 {
            inner.escaped.store(true, Ordering::Release);
        }
    }

    pub fn is_escaped(&self) -> bool {
        self.0
            .as_ref()
            .is_some_and(|inner| inner.escaped.load(Ordering::Acquire))
    }

    /// Block semantics: lenient arity, a single array argument is splatted
    /// over multiple parameters.
    pub fn yield_(&self, ctx: &mut ThreadContext, args: &[Value]) -> RuntimeResult<Value> {
        self.invoke(ctx, args, None, None)
    }

    /// Yield of a fixed 0 to 3 values.
    pub fn yield_specific<const N: usize>(
        &self,
        ctx: &mut ThreadContext,
        args: [Value; N],
    ) -> RuntimeResult<Value> {
        const { assert!(N <= 3) };
        self.invoke(ctx, &args, None, None)
    }

    /// `Proc#call`: arity is only enforced for lambdas.
    pub fn call(&self, ctx: &mut ThreadContext, args: &[Value]) -> RuntimeResult<Value> {
        self.invoke(ctx, args, None, None)
    }

    /// Call with `self` rebound, as `instance_eval` and `define_method` do.
    pub fn call_under(
        &self,
        ctx: &mut ThreadContext,
        args: &[Value],
        self_value: Value,
        klass: Option<ModuleRef>,
    ) -> RuntimeResult<Value> {
        self.invoke(ctx, args, Some(self_value), klass)
    }

    fn invoke(
        &self,
        ctx: &mut ThreadContext,
        args: &[Value],
        self_value: Option<Value>,
        klass: Option<ModuleRef>,
    ) -> RuntimeResult<Value> {
        let Some(inner) = &self.0 else {
            return Err(ctx.local_jump_error(
                JumpReason::Noreason,
                Value::Nil,
                "no block given (yield)",
            ));
        };
        let lambda = inner.block_type == BlockType::Lambda;
        let result = inner.body.invoke(ctx, inner, args, self_value, klass, lambda);
        match result {
            Err(Signal::Break(mut jump)) => {
                if jump.target.is_none() {
                    jump.target = Some(inner.id);
                }
                if jump.target != Some(inner.id) {
                    return Err(Signal::Break(jump));
                }
                if lambda {
                    return Ok(jump.value);
                }
                if inner.escaped.load(Ordering::Acquire) {
                    return Err(ctx.local_jump_error(
                        JumpReason::Break,
                        jump.value,
                        "break from proc-closure",
                    ));
                }
                Err(Signal::Break(jump))
            }
            Err(Signal::Return { target, value })
                if lambda && target == inner.binding.frame().jump_target() =>
            {
                Ok(value)
            }
            other => other,
        }
    }

    fn derive(&self, block_type: Option<BlockType>, binding: Option<Binding>) -> Block {
        let Some(inner) = &self.0 else {
            return Block::NULL;
        };
        Block(Some(Arc::new(BlockInner {
            id: inner.id,
            body: inner.body.clone(),
            binding: binding.unwrap_or_else(|| inner.binding.clone()),
            block_type: block_type.unwrap_or(inner.block_type),
            escaped: inner.escaped.clone(),
        })))
    }

    /// Independent copy: duplicated frame and captured scope, the same outer
    /// scope chain and the same lambda-ness.
    pub fn clone_block(&self) -> Block {
        let Some(inner) = &self.0 else {
            return Block::NULL;
        };
        self.derive(None, Some(inner.binding.clone_binding()))
    }

    pub fn to_proc(&self) -> Block {
        match self.block_type() {
            Some(BlockType::Normal) => self.derive(Some(BlockType::Proc), None),
            _ => self.clone(),
        }
    }

    pub fn to_lambda(&self) -> Block {
        self.derive(Some(BlockType::Lambda), None)
    }

    /// Copy handed to a new thread.
    pub fn for_thread(&self) -> Block {
        self.clone_block().derive(Some(BlockType::Thread), None)
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(inner) => f
                .debug_struct("Block")
                .field("id", &inner.id)
                .field("type", &inner.block_type)
                .field("arity", &inner.body.arity())
                .finish(),
            None => f.write_str("Block::NULL"),
        }
    }
}
