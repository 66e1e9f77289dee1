//! Run with:
//!   cargo bench --bench dispatch_benchmark

use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use garnet::{
    ArgsSpec, Arity, Block, CallNode, CallSite, CallType, DefnNode, IfNode, LiteralNode,
    LocalVarNode, NativeMethod, NodeRef, Runtime, RuntimeCreateInfo, ScopeKind, SequenceNode,
    SourcePosition, StaticScope, Value, Visibility, execute, native_fn, node,
};

fn create_runtime() -> Runtime {
    Runtime::new(RuntimeCreateInfo {
        verbose: false,
        ..Default::default()
    })
    .expect("runtime bootstrap")
}

fn constant(value: i64) -> Arc<NativeMethod> {
    Arc::new(NativeMethod::new(
        Arity::NO_ARGUMENTS,
        native_fn(move |_, _, _, _| Ok(Value::Fixnum(value))),
    ))
}

/// Benchmark 1: one receiver class, the inline cache always hits.
fn bench_monomorphic(c: &mut Criterion) {
    let runtime = create_runtime();
    let mut ctx = runtime.new_context();
    let class = runtime.define_class("Point", None);
    let name = runtime.intern("x");
    class.define_method(name.clone(), constant(1), Visibility::Public);
    let receiver = runtime.new_object(&class);
    let site = CallSite::new(name, CallType::Normal);

    c.bench_function("monomorphic_send", |b| {
        b.iter(|| site.call(&mut ctx, black_box(&receiver), &[]).expect("send failed"));
    });
}

/// Benchmark 2: receivers from 16 classes, the site gives up caching.
fn bench_megamorphic(c: &mut Criterion) {
    let runtime = create_runtime();
    let mut ctx = runtime.new_context();
    let name = runtime.intern("x");
    let receivers: Vec<Value> = (0..16)
        .map(|i| {
            let class = runtime.define_class(&format!("Shape{i}"), None);
            class.define_method(name.clone(), constant(i), Visibility::Public);
            runtime.new_object(&class)
        })
        .collect();
    let site = CallSite::new(name, CallType::Normal);

    c.bench_function("megamorphic_send_16", |b| {
        b.iter(|| {
            for receiver in &receivers {
                site.call(&mut ctx, black_box(receiver), &[]).expect("send failed");
            }
        });
    });
}

/// Benchmark 3: Integer#+ through the primitive fast path.
fn bench_fast_op(c: &mut Criterion) {
    let runtime = create_runtime();
    let mut ctx = runtime.new_context();
    let site = CallSite::new(runtime.intern("+"), CallType::Normal);

    c.bench_function("fixnum_plus", |b| {
        b.iter(|| {
            site.call(&mut ctx, black_box(&Value::Fixnum(20)), &[Value::Fixnum(22)])
                .expect("send failed")
        });
    });
}

/// Benchmark 4: Array#each yielding to a native block.
fn bench_yield(c: &mut Criterion) {
    let runtime = create_runtime();
    let mut ctx = runtime.new_context();
    let array = Value::array((0..100).map(Value::Fixnum).collect());
    let block = Block::native(
        &ctx,
        Arity::ONE_ARGUMENT,
        native_fn(|_, _, args, _| Ok(args[0].clone())),
    );
    let site = CallSite::new(runtime.intern("each"), CallType::Normal);

    c.bench_function("each_100", |b| {
        b.iter(|| {
            site.call_with_block(&mut ctx, black_box(&array), &[], &block)
                .expect("each failed")
        });
    });
}

/// Benchmark 5: recursive fibonacci through the AST interpreter.
fn bench_fibonacci(c: &mut Criterion) {
    let runtime = create_runtime();
    let mut ctx = runtime.new_context();
    let n = runtime.intern("n");
    let arg = || -> NodeRef {
        node(LocalVarNode {
            name: n.clone(),
            offset: 0,
            depth: 0,
        })
    };
    let fix = |value: i64| -> NodeRef { node(LiteralNode::new(Value::Fixnum(value))) };
    let send = |receiver: NodeRef, name: &str, args: Vec<NodeRef>| -> NodeRef {
        node(CallNode::call(receiver, runtime.intern(name), args))
    };
    let fib = |arg: NodeRef| -> NodeRef { node(CallNode::fcall(runtime.intern("fib"), vec![arg])) };

    // def fib(n) = n < 2 ? n : fib(n - 1) + fib(n - 2)
    let body = node(IfNode {
        condition: send(arg(), "<", vec![fix(2)]),
        then_body: Some(arg()),
        else_body: Some(send(
            fib(send(arg(), "-", vec![fix(1)])),
            "+",
            vec![fib(send(arg(), "-", vec![fix(2)]))],
        )),
    });
    let program = node(SequenceNode {
        nodes: vec![node(DefnNode::new(
            runtime.intern("fib"),
            vec![n.clone()],
            ArgsSpec::new(1, 0, false),
            body,
            SourcePosition::new("bench.rb", 1),
        ))],
    });
    let scope = StaticScope::new(
        ScopeKind::Method,
        Vec::new(),
        ArgsSpec::NONE,
        Some(runtime.top_level_scope().clone()),
    );
    execute(&mut ctx, &scope, program.as_ref()).expect("definition failed");
    let call = fib(fix(12));

    // Warm up - populate the inline caches
    for _ in 0..5 {
        execute(&mut ctx, &scope, call.as_ref()).expect("warmup failed");
    }

    c.bench_function("fibonacci_12", |b| {
        b.iter(|| execute(&mut ctx, &scope, black_box(call.as_ref())).expect("benchmark failed"));
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(20);
    targets = bench_monomorphic, bench_megamorphic, bench_fast_op, bench_yield, bench_fibonacci
}

criterion_main!(benches);
