use std::{process, sync::Arc, time::Instant};

use clap::Parser as ClapParser;
use garnet::{
    ArgsSpec, Arity, Block, BlockArg, BlockParams, CallNode, ClassNode, ConstNode, DefnNode,
    IterNode, LiteralNode, LocalAsgnNode, LocalVarNode, ModuleKind, NodeRef, Runtime,
    RuntimeCreateInfo, ScopeKind, SequenceNode, Signal, SourcePosition, StaticScope, Symbol, Value,
    WhileNode, execute, native_fn, node,
};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Runtime threads running the workload concurrently
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Loop iterations per thread
    #[arg(long, default_value_t = 10_000)]
    iterations: i64,

    /// Misses after which a call site stops caching
    #[arg(long, default_value_t = 50)]
    max_cache_misses: u32,

    #[arg(long, default_value_t = 1024)]
    max_stack_depth: usize,

    /// Suppress runtime warnings
    #[arg(long)]
    quiet: bool,

    /// Log filter, `RUST_LOG` syntax
    #[arg(long, default_value = "info")]
    log: String,
}

const SCRIPT: &str = "demo.rb";

struct Ast<'a> {
    runtime: &'a Runtime,
}

impl Ast<'_> {
    fn sym(&self, name: &str) -> Symbol {
        self.runtime.intern(name)
    }

    fn fix(&self, value: i64) -> NodeRef {
        node(LiteralNode::new(Value::Fixnum(value)))
    }

    fn get(&self, name: &str, offset: usize, depth: usize) -> NodeRef {
        node(LocalVarNode {
            name: self.sym(name),
            offset,
            depth,
        })
    }

    fn set(&self, name: &str, offset: usize, depth: usize, value: NodeRef) -> NodeRef {
        node(LocalAsgnNode {
            name: self.sym(name),
            offset,
            depth,
            value,
        })
    }

    fn send(&self, receiver: NodeRef, name: &str, args: Vec<NodeRef>) -> CallNode {
        CallNode::call(receiver, self.sym(name), args)
    }
}

/// class Accumulator
///   def add_all(list)
///     total = 0
///     list.each { |x| total = total + x }
///     total
///   end
/// end
fn accumulator_class(ast: &Ast) -> NodeRef {
    let method_scope =
        StaticScope::method(vec![ast.sym("list"), ast.sym("total")], ArgsSpec::new(1, 0, false));
    let block_scope =
        StaticScope::block(vec![ast.sym("x")], ArgsSpec::new(1, 0, false), &method_scope);
    let block_body = ast.set(
        "total",
        1,
        1,
        node(ast.send(ast.get("total", 1, 1), "+", vec![ast.get("x", 0, 0)])),
    );
    let iter = IterNode::new(
        block_scope,
        BlockParams::new(1),
        block_body,
        SourcePosition::new(SCRIPT, 4),
    );
    let each = ast
        .send(ast.get("list", 0, 0), "each", vec![])
        .with_block(BlockArg::Literal(iter));
    let add_all = node(DefnNode {
        name: ast.sym("add_all"),
        static_scope: method_scope,
        body: node(SequenceNode {
            nodes: vec![ast.set("total", 1, 0, ast.fix(0)), node(each), ast.get("total", 1, 0)],
        }),
        position: SourcePosition::new(SCRIPT, 2),
    });
    node(ClassNode {
        kind: ModuleKind::Class,
        name: ast.sym("Accumulator"),
        superclass: None,
        names: Vec::new(),
        body: add_all,
    })
}

/// acc = Accumulator.new
/// i = 0; sum = 0
/// while i < iterations
///   sum = sum + acc.add_all([1, 2, 3])
///   i = i + 1
/// end
/// sum
fn workload(ast: &Ast, iterations: i64) -> NodeRef {
    let list = node(garnet::ArrayNode {
        elements: vec![ast.fix(1), ast.fix(2), ast.fix(3)],
    });
    let add = node(ast.send(ast.get("acc", 0, 0), "add_all", vec![list]));
    let body = node(SequenceNode {
        nodes: vec![
            ast.set("sum", 2, 0, node(ast.send(ast.get("sum", 2, 0), "+", vec![add]))),
            ast.set("i", 1, 0, node(ast.send(ast.get("i", 1, 0), "+", vec![ast.fix(1)]))),
        ],
    });
    let new = ast.send(node(ConstNode { name: ast.sym("Accumulator") }), "new", vec![]);
    node(SequenceNode {
        nodes: vec![
            ast.set("acc", 0, 0, node(new)),
            ast.set("i", 1, 0, ast.fix(0)),
            ast.set("sum", 2, 0, ast.fix(0)),
            node(WhileNode {
                condition: node(ast.send(ast.get("i", 1, 0), "<", vec![ast.fix(iterations)])),
                body,
            }),
            ast.get("sum", 2, 0),
        ],
    })
}

fn script_scope(runtime: &Runtime, names: Vec<Symbol>) -> Arc<StaticScope> {
    StaticScope::new(
        ScopeKind::Method,
        names,
        ArgsSpec::NONE,
        Some(runtime.top_level_scope().clone()),
    )
}

fn main() {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cli.log.as_str()))
        .init();

    let runtime = match Runtime::new(RuntimeCreateInfo {
        max_cache_misses: cli.max_cache_misses,
        max_stack_depth: cli.max_stack_depth,
        verbose: !cli.quiet,
        script_name: SCRIPT.to_string(),
        ..Default::default()
    }) {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("bootstrap failed: {err}");
            process::exit(1);
        }
    };

    let ast = Ast { runtime: &runtime };
    let mut ctx = runtime.new_context();
    let definitions = accumulator_class(&ast);
    if let Err(err) = execute(&mut ctx, &script_scope(&runtime, Vec::new()), definitions.as_ref()) {
        eprintln!("{err}");
        process::exit(1);
    }

    let names = vec![ast.sym("acc"), ast.sym("i"), ast.sym("sum")];
    let program = workload(&ast, cli.iterations);
    let start = Instant::now();
    let mut threads = Vec::with_capacity(cli.threads);
    for _ in 0..cli.threads {
        let (program, scope) = (program.clone(), script_scope(&runtime, names.clone()));
        let body = Block::native(
            &ctx,
            Arity::NO_ARGUMENTS,
            native_fn(move |ctx, _, _, _| {
                execute(ctx, &scope, program.as_ref()).map_err(Signal::raise)
            }),
        );
        match runtime.spawn_thread(&body, Vec::new()) {
            Ok(thread) => threads.push(thread),
            Err(err) => {
                eprintln!("{err}");
                process::exit(1);
            }
        }
    }

    let mut failed = false;
    for thread in &threads {
        match thread.join() {
            Ok(value) => log::info!("thread {} finished with {}", thread.id(), value.inspect()),
            Err(err) => {
                log::error!("thread {} failed: {}", thread.id(), err);
                for line in &err.backtrace {
                    log::error!("    from {line}");
                }
                failed = true;
            }
        }
    }
    log::info!(
        "{} threads x {} iterations in {:?}",
        cli.threads,
        cli.iterations,
        start.elapsed()
    );

    for warning in runtime.take_warnings() {
        eprintln!("{warning}");
    }
    if failed {
        process::exit(1);
    }
}
