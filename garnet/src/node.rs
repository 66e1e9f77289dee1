use std::{fmt::Debug, sync::Arc};

use crate::{
    ArgsSpec, Binding, Block, BlockBody, BlockParams, BlockType, BreakJump, CallSite, CallType,
    ErrorKind, InterpretedMethod, JumpReason, ModuleKind, RaiseError, RuntimeResult, Signal,
    SourcePosition, StaticScope, SuperCallSite, Symbol, ThreadContext, Value,
};

/// Executable AST node. Parsers hand the runtime trees of these.
pub trait Node: Send + Sync + Debug {
    fn interpret(
        &self,
        ctx: &mut ThreadContext,
        self_value: &Value,
        block: &Block,
    ) -> RuntimeResult<Value>;
}

pub type NodeRef = Arc<dyn Node>;

pub fn node<N: Node + 'static>(node: N) -> NodeRef {
    Arc::new(node)
}

fn interpret_all(
    ctx: &mut ThreadContext,
    nodes: &[NodeRef],
    self_value: &Value,
    block: &Block,
) -> RuntimeResult<Vec<Value>> {
    nodes
        .iter()
        .map(|node| node.interpret(ctx, self_value, block))
        .collect()
}

fn interpret_or_nil(
    ctx: &mut ThreadContext,
    node: Option<&NodeRef>,
    self_value: &Value,
    block: &Block,
) -> RuntimeResult<Value> {
    match node {
        Some(node) => node.interpret(ctx, self_value, block),
        None => Ok(Value::Nil),
    }
}

#[derive(Debug)]
pub struct LiteralNode {
    pub value: Value,
}

impl LiteralNode {
    pub fn new(value: Value) -> Self {
        Self { value }
    }
}

impl Node for LiteralNode {
    fn interpret(&self, _: &mut ThreadContext, _: &Value, _: &Block) -> RuntimeResult<Value> {
        Ok(self.value.clone())
    }
}

#[derive(Debug)]
pub struct SelfNode;

impl Node for SelfNode {
    fn interpret(
        &self,
        _: &mut ThreadContext,
        self_value: &Value,
        _: &Block,
    ) -> RuntimeResult<Value> {
        Ok(self_value.clone())
    }
}

#[derive(Debug)]
pub struct ArrayNode {
    pub elements: Vec<NodeRef>,
}

impl Node for ArrayNode {
    fn interpret(
        &self,
        ctx: &mut ThreadContext,
        self_value: &Value,
        block: &Block,
    ) -> RuntimeResult<Value> {
        Ok(Value::array(interpret_all(ctx, &self.elements, self_value, block)?))
    }
}

/// Class lookup in the flat registry.
#[derive(Debug)]
pub struct ConstNode {
    pub name: Symbol,
}

impl Node for ConstNode {
    fn interpret(&self, ctx: &mut ThreadContext, _: &Value, _: &Block) -> RuntimeResult<Value> {
        match ctx.runtime().get_class(self.name.as_str()) {
            Some(module) => Ok(Value::Module(module)),
            None => Err(ctx.raise(
                ErrorKind::NameError,
                format!("uninitialized constant {}", self.name),
            )),
        }
    }
}

#[derive(Debug)]
pub struct LocalVarNode {
    pub name: Symbol,
    pub offset: usize,
    pub depth: usize,
}

impl Node for LocalVarNode {
    fn interpret(&self, ctx: &mut ThreadContext, _: &Value, _: &Block) -> RuntimeResult<Value> {
        Ok(ctx.current_scope().get_value_or_nil(self.offset, self.depth))
    }
}

#[derive(Debug)]
pub struct LocalAsgnNode {
    pub name: Symbol,
    pub offset: usize,
    pub depth: usize,
    pub value: NodeRef,
}

impl Node for LocalAsgnNode {
    fn interpret(
        &self,
        ctx: &mut ThreadContext,
        self_value: &Value,
        block: &Block,
    ) -> RuntimeResult<Value> {
        let value = self.value.interpret(ctx, self_value, block)?;
        Ok(ctx.current_scope().set_value(self.offset, value, self.depth))
    }
}

/// Marks the start of a source line.
#[derive(Debug)]
pub struct NewlineNode {
    pub line: u32,
    pub next: NodeRef,
}

impl Node for NewlineNode {
    fn interpret(
        &self,
        ctx: &mut ThreadContext,
        self_value: &Value,
        block: &Block,
    ) -> RuntimeResult<Value> {
        ctx.set_line(self.line);
        self.next.interpret(ctx, self_value, block)
    }
}

#[derive(Debug)]
pub struct SequenceNode {
    pub nodes: Vec<NodeRef>,
}

impl Node for SequenceNode {
    fn interpret(
        &self,
        ctx: &mut ThreadContext,
        self_value: &Value,
        block: &Block,
    ) -> RuntimeResult<Value> {
        let mut result = Value::Nil;
        for node in &self.nodes {
            result = node.interpret(ctx, self_value, block)?;
        }
        Ok(result)
    }
}

#[derive(Debug)]
pub struct IfNode {
    pub condition: NodeRef,
    pub then_body: Option<NodeRef>,
    pub else_body: Option<NodeRef>,
}

impl Node for IfNode {
    fn interpret(
        &self,
        ctx: &mut ThreadContext,
        self_value: &Value,
        block: &Block,
    ) -> RuntimeResult<Value> {
        let branch = if self.condition.interpret(ctx, self_value, block)?.is_truthy() {
            &self.then_body
        } else {
            &self.else_body
        };
        interpret_or_nil(ctx, branch.as_ref(), self_value, block)
    }
}

/// `while`: owns fresh breaks, `next` and `redo` of its body.
#[derive(Debug)]
pub struct WhileNode {
    pub condition: NodeRef,
    pub body: NodeRef,
}

impl Node for WhileNode {
    fn interpret(
        &self,
        ctx: &mut ThreadContext,
        self_value: &Value,
        block: &Block,
    ) -> RuntimeResult<Value> {
        loop {
            ctx.poll_thread_events()?;
            if !self.condition.interpret(ctx, self_value, block)?.is_truthy() {
                return Ok(Value::Nil);
            }
            loop {
                match self.body.interpret(ctx, self_value, block) {
                    Ok(_) | Err(Signal::Next(_)) => break,
                    Err(Signal::Redo) => ctx.poll_thread_events()?,
                    Err(Signal::Break(jump)) if jump.target.is_none() => return Ok(jump.value),
                    Err(signal) => return Err(signal),
                }
            }
        }
    }
}

/// Block literal. Every evaluation captures the current binding afresh.
#[derive(Debug)]
pub struct IterNode {
    body: Arc<BlockBody>,
}

impl IterNode {
    pub fn new(
        static_scope: Arc<StaticScope>,
        params: BlockParams,
        body: NodeRef,
        position: SourcePosition,
    ) -> Arc<Self> {
        Arc::new(Self {
            body: Arc::new(BlockBody::interpreted(static_scope, params, body, position)),
        })
    }

    /// Shares the enclosing scope instead of opening its own, like `for`.
    pub fn shared_scope(
        static_scope: Arc<StaticScope>,
        params: BlockParams,
        body: NodeRef,
        position: SourcePosition,
    ) -> Arc<Self> {
        Arc::new(Self {
            body: Arc::new(BlockBody::shared_scope(static_scope, params, body, position)),
        })
    }

    pub fn capture(&self, ctx: &ThreadContext) -> Block {
        Block::new(self.body.clone(), ctx.current_binding(), BlockType::Normal)
    }
}

impl Node for IterNode {
    fn interpret(&self, ctx: &mut ThreadContext, _: &Value, _: &Block) -> RuntimeResult<Value> {
        Ok(Value::Proc(self.capture(ctx).to_proc()))
    }
}

#[derive(Debug, Default)]
pub enum BlockArg {
    #[default]
    None,
    Literal(Arc<IterNode>),
    /// `&expr`
    Pass(NodeRef),
}

impl BlockArg {
    fn is_literal(&self) -> bool {
        matches!(self, Self::Literal(_))
    }

    /// `None` means no block syntax at all.
    fn resolve(
        &self,
        ctx: &mut ThreadContext,
        self_value: &Value,
        block: &Block,
    ) -> RuntimeResult<Option<Block>> {
        match self {
            Self::None => Ok(None),
            Self::Literal(iter) => Ok(Some(iter.capture(ctx))),
            Self::Pass(node) => match node.interpret(ctx, self_value, block)? {
                Value::Nil => Ok(Some(Block::NULL)),
                Value::Proc(block) => Ok(Some(block)),
                other => {
                    let class = ctx.runtime().class_of(&other);
                    Err(ctx.raise(
                        ErrorKind::TypeError,
                        format!("wrong argument type {} (expected Proc)", class.name()),
                    ))
                }
            },
        }
    }
}

#[derive(Debug)]
pub struct CallNode {
    receiver: Option<NodeRef>,
    args: Vec<NodeRef>,
    block_arg: BlockArg,
    site: CallSite,
}

impl CallNode {
    /// `recv.name(args)`
    pub fn call(receiver: NodeRef, name: Symbol, args: Vec<NodeRef>) -> Self {
        Self {
            receiver: Some(receiver),
            args,
            block_arg: BlockArg::None,
            site: CallSite::new(name, CallType::Normal),
        }
    }

    /// `name(args)`
    pub fn fcall(name: Symbol, args: Vec<NodeRef>) -> Self {
        Self {
            receiver: None,
            args,
            block_arg: BlockArg::None,
            site: CallSite::new(name, CallType::Functional),
        }
    }

    /// bare `name`
    pub fn vcall(name: Symbol) -> Self {
        Self {
            receiver: None,
            args: Vec::new(),
            block_arg: BlockArg::None,
            site: CallSite::new(name, CallType::Variable),
        }
    }

    pub fn with_block(mut self, block_arg: BlockArg) -> Self {
        self.block_arg = block_arg;
        self
    }

    pub fn site(&self) -> &CallSite {
        &self.site
    }
}

impl Node for CallNode {
    fn interpret(
        &self,
        ctx: &mut ThreadContext,
        self_value: &Value,
        block: &Block,
    ) -> RuntimeResult<Value> {
        let receiver = match &self.receiver {
            Some(node) => node.interpret(ctx, self_value, block)?,
            None => self_value.clone(),
        };
        let args = interpret_all(ctx, &self.args, self_value, block)?;
        match self.block_arg.resolve(ctx, self_value, block)? {
            None => self.site.call(ctx, &receiver, &args),
            Some(given) if self.block_arg.is_literal() => {
                self.site.call_iter(ctx, &receiver, &args, &given)
            }
            Some(given) => self.site.call_with_block(ctx, &receiver, &args, &given),
        }
    }
}

/// `super(args)`, or a bare `super` passing the current arguments.
#[derive(Debug)]
pub struct SuperNode {
    args: Option<Vec<NodeRef>>,
    block_arg: BlockArg,
    site: SuperCallSite,
}

impl SuperNode {
    pub fn new(args: Vec<NodeRef>) -> Self {
        Self {
            args: Some(args),
            block_arg: BlockArg::None,
            site: SuperCallSite::new(),
        }
    }

    pub fn zsuper() -> Self {
        Self {
            args: None,
            block_arg: BlockArg::None,
            site: SuperCallSite::new(),
        }
    }

    pub fn with_block(mut self, block_arg: BlockArg) -> Self {
        self.block_arg = block_arg;
        self
    }
}

impl Node for SuperNode {
    fn interpret(
        &self,
        ctx: &mut ThreadContext,
        self_value: &Value,
        block: &Block,
    ) -> RuntimeResult<Value> {
        let args = match &self.args {
            Some(nodes) => interpret_all(ctx, nodes, self_value, block)?,
            None => ctx.current_scope().get_arg_values(),
        };
        match self.block_arg.resolve(ctx, self_value, block)? {
            None => self.site.call(ctx, &args, block),
            Some(given) if self.block_arg.is_literal() => self.site.call_iter(ctx, &args, &given),
            Some(given) => self.site.call(ctx, &args, &given),
        }
    }
}

#[derive(Debug)]
pub struct YieldNode {
    pub args: Vec<NodeRef>,
}

impl Node for YieldNode {
    fn interpret(
        &self,
        ctx: &mut ThreadContext,
        self_value: &Value,
        block: &Block,
    ) -> RuntimeResult<Value> {
        let args = interpret_all(ctx, &self.args, self_value, block)?;
        block.yield_(ctx, &args)
    }
}

#[derive(Debug)]
pub struct NextNode {
    pub value: Option<NodeRef>,
}

impl Node for NextNode {
    fn interpret(
        &self,
        ctx: &mut ThreadContext,
        self_value: &Value,
        block: &Block,
    ) -> RuntimeResult<Value> {
        let value = interpret_or_nil(ctx, self.value.as_ref(), self_value, block)?;
        Err(Signal::Next(value))
    }
}

#[derive(Debug)]
pub struct BreakNode {
    pub value: Option<NodeRef>,
}

impl Node for BreakNode {
    fn interpret(
        &self,
        ctx: &mut ThreadContext,
        self_value: &Value,
        block: &Block,
    ) -> RuntimeResult<Value> {
        let value = interpret_or_nil(ctx, self.value.as_ref(), self_value, block)?;
        Err(Signal::Break(BreakJump { target: None, value }))
    }
}

#[derive(Debug)]
pub struct RedoNode;

impl Node for RedoNode {
    fn interpret(&self, _: &mut ThreadContext, _: &Value, _: &Block) -> RuntimeResult<Value> {
        Err(Signal::Redo)
    }
}

#[derive(Debug)]
pub struct RetryNode;

impl Node for RetryNode {
    fn interpret(&self, _: &mut ThreadContext, _: &Value, _: &Block) -> RuntimeResult<Value> {
        Err(Signal::Retry)
    }
}

/// Returns from the method whose frame is current, even from inside a
/// block.
#[derive(Debug)]
pub struct ReturnNode {
    pub value: Option<NodeRef>,
}

impl Node for ReturnNode {
    fn interpret(
        &self,
        ctx: &mut ThreadContext,
        self_value: &Value,
        block: &Block,
    ) -> RuntimeResult<Value> {
        let value = interpret_or_nil(ctx, self.value.as_ref(), self_value, block)?;
        let target = ctx.current_frame().jump_target();
        Err(Signal::Return { target, value })
    }
}

#[derive(Debug)]
pub struct RescueClause {
    /// Empty matches every rescuable error.
    pub kinds: Vec<ErrorKind>,
    /// Slot receiving the error message.
    pub variable: Option<(usize, usize)>,
    pub body: NodeRef,
}

impl RescueClause {
    fn matches(&self, error: &RaiseError) -> bool {
        self.kinds.is_empty() || self.kinds.iter().any(|kind| error.kind.is_a(*kind))
    }
}

/// `begin ... rescue ... else ... end`. Only raised errors are caught;
/// jumps pass through. `retry` in a clause restarts the body.
#[derive(Debug)]
pub struct RescueNode {
    pub body: NodeRef,
    pub clauses: Vec<RescueClause>,
    pub else_body: Option<NodeRef>,
}

impl Node for RescueNode {
    fn interpret(
        &self,
        ctx: &mut ThreadContext,
        self_value: &Value,
        block: &Block,
    ) -> RuntimeResult<Value> {
        loop {
            let error = match self.body.interpret(ctx, self_value, block) {
                Ok(value) => {
                    return match &self.else_body {
                        Some(else_body) => else_body.interpret(ctx, self_value, block),
                        None => Ok(value),
                    };
                }
                Err(Signal::Raise(error)) if error.kind.is_rescuable() => error,
                Err(signal) => return Err(signal),
            };
            let Some(clause) = self.clauses.iter().find(|clause| clause.matches(&error)) else {
                return Err(Signal::Raise(error));
            };
            if let Some((offset, depth)) = clause.variable {
                ctx.current_scope().set_value(offset, Value::string(&error.message), depth);
            }
            match clause.body.interpret(ctx, self_value, block) {
                Err(Signal::Retry) => {
                    log::trace!("retry after {}", error.kind);
                    ctx.poll_thread_events()?;
                }
                result => return result,
            }
        }
    }
}

/// `def name(args) ... end` in the current class nesting, with the
/// current default visibility.
#[derive(Debug)]
pub struct DefnNode {
    pub name: Symbol,
    pub static_scope: Arc<StaticScope>,
    pub body: NodeRef,
    pub position: SourcePosition,
}

impl DefnNode {
    pub fn new(
        name: Symbol,
        names: Vec<Symbol>,
        args: ArgsSpec,
        body: NodeRef,
        position: SourcePosition,
    ) -> Self {
        Self {
            name,
            static_scope: StaticScope::method(names, args),
            body,
            position,
        }
    }
}

impl Node for DefnNode {
    fn interpret(&self, ctx: &mut ThreadContext, _: &Value, _: &Block) -> RuntimeResult<Value> {
        let module = ctx.current_cref().clone();
        let visibility = ctx.current_visibility();
        let method = InterpretedMethod::new(
            self.static_scope.clone(),
            self.body.clone(),
            self.position.clone(),
        );
        module.define_method(self.name.clone(), Arc::new(method), visibility);
        Ok(Value::Symbol(self.name.clone()))
    }
}

/// `class Name < Super ... end` or `module Name ... end`; reopens an
/// existing class of that name.
#[derive(Debug)]
pub struct ClassNode {
    pub kind: ModuleKind,
    pub name: Symbol,
    pub superclass: Option<NodeRef>,
    /// Locals of the body.
    pub names: Vec<Symbol>,
    pub body: NodeRef,
}

impl Node for ClassNode {
    fn interpret(
        &self,
        ctx: &mut ThreadContext,
        self_value: &Value,
        block: &Block,
    ) -> RuntimeResult<Value> {
        let runtime = ctx.runtime().clone();
        let module = match self.kind {
            ModuleKind::Class => {
                let superclass = match &self.superclass {
                    Some(node) => match node.interpret(ctx, self_value, block)? {
                        Value::Module(module) if module.is_class() => Some(module),
                        other => {
                            return Err(ctx.raise(
                                ErrorKind::TypeError,
                                format!("superclass must be a Class ({} given)", other.inspect()),
                            ));
                        }
                    },
                    None => None,
                };
                let class = runtime.define_class(self.name.as_str(), superclass.as_ref());
                if let Some(superclass) = &superclass {
                    if class.superclass().is_some_and(|current| !Arc::ptr_eq(current, superclass)) {
                        return Err(ctx.raise(
                            ErrorKind::TypeError,
                            format!("superclass mismatch for class {}", self.name),
                        ));
                    }
                }
                class
            }
            ModuleKind::Module => runtime.define_module(self.name.as_str()),
        };
        if module.kind() != self.kind {
            let expected = if self.kind == ModuleKind::Class { "class" } else { "module" };
            return Err(ctx.raise(
                ErrorKind::TypeError,
                format!("{} is not a {expected}", self.name),
            ));
        }
        let static_scope = StaticScope::class_body(module.clone(), self.names.clone());
        let mut ctx = ctx.pre_class_body(&module, &static_scope)?;
        self.body.interpret(&mut ctx, &Value::Module(module.clone()), &Block::NULL)
    }
}

/// Evaluates `node` inside `binding`, in its shared eval scope. Breaks and
/// redos cannot leave an eval.
pub fn eval_with_binding(
    ctx: &mut ThreadContext,
    binding: &Binding,
    node: &dyn Node,
) -> RuntimeResult<Value> {
    let mut ctx = ctx.pre_eval_with_binding(binding)?;
    let self_value = binding.self_value().clone();
    let block = binding.frame().block().clone();
    match node.interpret(&mut ctx, &self_value, &block) {
        Err(Signal::Break(jump)) => {
            Err(ctx.local_jump_error(JumpReason::Break, jump.value, "unexpected break"))
        }
        Err(Signal::Redo) => {
            Err(ctx.local_jump_error(JumpReason::Redo, Value::Nil, "unexpected redo"))
        }
        result => result,
    }
}

/// Runs a script body as `main`. Whatever escapes becomes an error.
pub fn execute(
    ctx: &mut ThreadContext,
    static_scope: &Arc<StaticScope>,
    node: &dyn Node,
) -> Result<Value, RaiseError> {
    let main = ctx.runtime().main_object().clone();
    let result = {
        let mut ctx = ctx.pre_scoped_body(static_scope).map_err(|signal| signal.into_error())?;
        node.interpret(&mut ctx, &main, &Block::NULL)
    };
    result.map_err(|signal| ctx.uncaught(signal))
}
