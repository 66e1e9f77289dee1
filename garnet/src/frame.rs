use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::{Block, ModuleRef, Symbol, Value, Visibility};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePosition {
    pub file: Arc<str>,
    pub line: u32,
}

impl SourcePosition {
    pub fn new(file: &str, line: u32) -> Self {
        Self {
            file: Arc::from(file),
            line,
        }
    }

    pub fn with_line(&self, line: u32) -> Self {
        Self {
            file: self.file.clone(),
            line,
        }
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

static NEXT_JUMP_TARGET: AtomicU64 = AtomicU64::new(1);

/// Identifies the method activation a `return` unwinds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JumpTarget(u64);

impl JumpTarget {
    pub fn fresh() -> Self {
        Self(NEXT_JUMP_TARGET.fetch_add(1, Ordering::Relaxed))
    }
}

/// One method or block activation.
#[derive(Clone)]
pub struct Frame {
    klass: Option<ModuleRef>,
    self_value: Value,
    name: Option<Symbol>,
    args: Vec<Value>,
    required_args: usize,
    block: Block,
    is_binding_frame: bool,
    visibility: Visibility,
    position: SourcePosition,
    jump_target: JumpTarget,
}

impl Frame {
    pub fn new(
        klass: Option<ModuleRef>,
        self_value: Value,
        name: Option<Symbol>,
        args: Vec<Value>,
        required_args: usize,
        block: Block,
        position: SourcePosition,
    ) -> Self {
        Self {
            klass,
            self_value,
            name,
            args,
            required_args,
            block,
            is_binding_frame: false,
            visibility: Visibility::Public,
            position,
            jump_target: JumpTarget::fresh(),
        }
    }

    /// Frame of the top-level script: `self` is main, no method name.
    pub fn top_level(klass: ModuleRef, self_value: Value, position: SourcePosition) -> Self {
        let mut frame =
            Self::new(Some(klass), self_value, None, Vec::new(), 0, Block::NULL, position);
        frame.visibility = Visibility::Private;
        frame
    }

    pub fn klass(&self) -> Option<&ModuleRef> {
        self.klass.as_ref()
    }

    pub fn self_value(&self) -> &Value {
        &self.self_value
    }

    pub fn set_self(&mut self, value: Value) {
        self.self_value = value;
    }

    pub fn name(&self) -> Option<&Symbol> {
        self.name.as_ref()
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn required_args(&self) -> usize {
        self.required_args
    }

    pub fn block(&self) -> &Block {
        &self.block
    }

    pub fn is_binding_frame(&self) -> bool {
        self.is_binding_frame
    }

    pub fn set_binding_frame(&mut self, value: bool) {
        self.is_binding_frame = value;
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn set_visibility(&mut self, visibility: Visibility) {
        self.visibility = visibility;
    }

    /// Position of the caller at the time this frame was pushed.
    pub fn position(&self) -> &SourcePosition {
        &self.position
    }

    pub fn set_position(&mut self, position: SourcePosition) {
        self.position = position;
    }

    pub fn jump_target(&self) -> JumpTarget {
        self.jump_target
    }

    /// Copy for capture into a binding. The argument vector is copied, the
    /// jump target is kept so `return` inside a block still finds its method.
    pub fn duplicate(&self) -> Self {
        self.clone()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("klass", &self.klass.as_ref().map(|k| k.name().to_string()))
            .field("self", &self.self_value)
            .field("name", &self.name)
            .field("args", &self.args)
            .field("block_given", &self.block.is_given())
            .field("visibility", &self.visibility)
            .field("position", &self.position)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_does_not_share_arguments() {
        let mut frame = Frame::new(
            None,
            Value::Nil,
            None,
            vec![Value::Fixnum(1)],
            1,
            Block::NULL,
            SourcePosition::new("a.rb", 3),
        );
        let copy = frame.duplicate();
        frame.args[0] = Value::Fixnum(2);
        frame.set_visibility(Visibility::Private);
        assert_eq!(copy.args(), &[Value::Fixnum(1)]);
        assert_eq!(copy.visibility(), Visibility::Public);
        assert_eq!(copy.jump_target(), frame.jump_target());
        assert!(!copy.block().is_given());
    }

    #[test]
    fn jump_targets_are_unique() {
        assert_ne!(JumpTarget::fresh(), JumpTarget::fresh());
    }
}
