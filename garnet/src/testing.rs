//! Fixtures shared by the unit tests: a small runtime and terse AST
//! builders.

use std::sync::Arc;

use crate::{
    ArgsSpec, Arity, BlockArg, BlockParams, BreakNode, CallNode, DefnNode, DynamicMethod, IterNode,
    LiteralNode, LocalAsgnNode, LocalVarNode, NativeMethod, NodeRef, Runtime, RuntimeCreateInfo,
    SequenceNode, SourcePosition, StaticScope, Symbol, Value, YieldNode, native_fn, node,
};

pub fn test_runtime() -> Runtime {
    Runtime::new(RuntimeCreateInfo {
        max_stack_depth: 64,
        ..Default::default()
    })
    .expect("runtime bootstrap")
}

pub fn constant_method(value: Value) -> Arc<dyn DynamicMethod> {
    Arc::new(NativeMethod::new(
        Arity::OPTIONAL,
        native_fn(move |_, _, _, _| Ok(value.clone())),
    ))
}

pub fn position() -> SourcePosition {
    SourcePosition::new("test.rb", 1)
}

pub fn fix(value: i64) -> NodeRef {
    node(LiteralNode::new(Value::Fixnum(value)))
}

pub fn seq(nodes: Vec<NodeRef>) -> NodeRef {
    node(SequenceNode { nodes })
}

pub fn local(name: &Symbol, offset: usize, depth: usize) -> NodeRef {
    node(LocalVarNode {
        name: name.clone(),
        offset,
        depth,
    })
}

pub fn local_set(name: &Symbol, offset: usize, depth: usize, value: NodeRef) -> NodeRef {
    node(LocalAsgnNode {
        name: name.clone(),
        offset,
        depth,
        value,
    })
}

pub fn call(runtime: &Runtime, receiver: NodeRef, name: &str, args: Vec<NodeRef>) -> NodeRef {
    node(CallNode::call(receiver, runtime.intern(name), args))
}

pub fn call_iter(
    runtime: &Runtime,
    receiver: NodeRef,
    name: &str,
    args: Vec<NodeRef>,
    iter: Arc<IterNode>,
) -> NodeRef {
    node(CallNode::call(receiver, runtime.intern(name), args).with_block(BlockArg::Literal(iter)))
}

pub fn fcall(runtime: &Runtime, name: &str, args: Vec<NodeRef>) -> NodeRef {
    node(CallNode::fcall(runtime.intern(name), args))
}

pub fn fcall_iter(
    runtime: &Runtime,
    name: &str,
    args: Vec<NodeRef>,
    iter: Arc<IterNode>,
) -> NodeRef {
    node(CallNode::fcall(runtime.intern(name), args).with_block(BlockArg::Literal(iter)))
}

pub fn iter(static_scope: Arc<StaticScope>, params: BlockParams, body: NodeRef) -> Arc<IterNode> {
    IterNode::new(static_scope, params, body, position())
}

pub fn yield_(args: Vec<NodeRef>) -> NodeRef {
    node(YieldNode { args })
}

pub fn break_(value: Option<NodeRef>) -> NodeRef {
    node(BreakNode { value })
}

pub fn defn(
    runtime: &Runtime,
    name: &str,
    names: Vec<Symbol>,
    args: ArgsSpec,
    body: NodeRef,
) -> NodeRef {
    node(DefnNode::new(runtime.intern(name), names, args, body, position()))
}
