mod arity;
mod binding;
mod block;
mod block_body;
mod builtins;
mod cache_map;
mod call_site;
mod context;
mod error;
mod frame;
mod interning;
mod method;
mod method_index;
mod module;
mod node;
mod parker;
mod runtime;
mod scope;
mod static_scope;
mod threads;
mod value;
mod visibility;

#[cfg(test)]
mod testing;

pub use arity::*;
pub use binding::*;
pub use block::*;
pub use block_body::*;
pub use builtins::{BUILTINS, Builtin, BuiltinFunction, Owner, install};
pub use cache_map::*;
pub use call_site::*;
pub use context::*;
pub use error::*;
pub use frame::*;
pub use interning::*;
pub use method::*;
pub use method_index::*;
pub use module::*;
pub use node::*;
pub use parker::Parker;
pub use runtime::*;
pub use scope::*;
pub use static_scope::*;
pub use threads::{RuntimeThread, ThreadInterrupt, ThreadOutcome, ThreadShared, ThreadState};
pub use value::*;
pub use visibility::*;
