use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::{BlockId, JumpTarget, Symbol, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ArgumentError,
    NoMethodError,
    NameError,
    TypeError,
    LocalJumpError,
    SystemStackError,
    ZeroDivisionError,
    RangeError,
    RuntimeError,
    ThreadKill,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::ArgumentError => "ArgumentError",
            Self::NoMethodError => "NoMethodError",
            Self::NameError => "NameError",
            Self::TypeError => "TypeError",
            Self::LocalJumpError => "LocalJumpError",
            Self::SystemStackError => "SystemStackError",
            Self::ZeroDivisionError => "ZeroDivisionError",
            Self::RangeError => "RangeError",
            Self::RuntimeError => "RuntimeError",
            Self::ThreadKill => "ThreadKill",
        }
    }

    /// NoMethodError is a NameError.
    pub fn is_a(self, other: ErrorKind) -> bool {
        self == other || (self == Self::NoMethodError && other == Self::NameError)
    }

    pub fn is_rescuable(self) -> bool {
        self != Self::ThreadKill
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The jump that escaped its legal context, recorded on a LocalJumpError.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpReason {
    Break,
    Next,
    Redo,
    Retry,
    Return,
    Noreason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacktraceElement {
    pub method: Option<Symbol>,
    pub file: Arc<str>,
    pub line: u32,
}

impl fmt::Display for BacktraceElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.method {
            Some(method) => write!(f, "{}:{}:in `{}'", self.file, self.line, method),
            None => write!(f, "{}:{}", self.file, self.line),
        }
    }
}

/// A language-level exception.
#[derive(Debug, Clone, Error)]
#[error("{message} ({kind})")]
pub struct RaiseError {
    pub kind: ErrorKind,
    pub message: String,
    pub reason: Option<JumpReason>,
    pub exit_value: Option<Value>,
    pub backtrace: Vec<BacktraceElement>,
}

impl RaiseError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            reason: None,
            exit_value: None,
            backtrace: Vec::new(),
        }
    }

    pub fn local_jump(reason: JumpReason, exit_value: Value, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::LocalJumpError,
            message: message.into(),
            reason: Some(reason),
            exit_value: Some(exit_value),
            backtrace: Vec::new(),
        }
    }

    pub fn with_backtrace(mut self, backtrace: Vec<BacktraceElement>) -> Self {
        self.backtrace = backtrace;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("wrong number of arguments ({actual} for {expected})")]
pub struct ArgumentCountError {
    pub actual: usize,
    pub expected: usize,
}

#[derive(Debug, Clone)]
pub struct BreakJump {
    /// Unset until the break leaves the block that issued it.
    pub target: Option<BlockId>,
    pub value: Value,
}

/// Everything that unwinds a chain of runtime calls.
#[derive(Debug, Clone, Error)]
pub enum Signal {
    #[error(transparent)]
    Raise(Box<RaiseError>),
    #[error("break")]
    Break(BreakJump),
    #[error("next")]
    Next(Value),
    #[error("redo")]
    Redo,
    #[error("retry")]
    Retry,
    #[error("return")]
    Return { target: JumpTarget, value: Value },
}

pub type RuntimeResult<T> = Result<T, Signal>;

impl Signal {
    pub fn raise(error: RaiseError) -> Self {
        Self::Raise(Box::new(error))
    }

    pub fn is_jump(&self) -> bool {
        !matches!(self, Self::Raise(_))
    }

    pub fn as_raise(&self) -> Option<&RaiseError> {
        match self {
            Self::Raise(error) => Some(error),
            _ => None,
        }
    }

    /// Converts a jump that escaped every construct able to handle it.
    pub fn into_error(self) -> RaiseError {
        match self {
            Self::Raise(error) => *error,
            Self::Break(jump) => {
                RaiseError::local_jump(JumpReason::Break, jump.value, "break from proc-closure")
            }
            Self::Next(value) => RaiseError::local_jump(JumpReason::Next, value, "unexpected next"),
            Self::Redo => RaiseError::local_jump(JumpReason::Redo, Value::Nil, "unexpected redo"),
            Self::Retry => RaiseError::local_jump(
                JumpReason::Retry,
                Value::Nil,
                "retry outside of rescue not yet supported",
            ),
            Self::Return { value, .. } => {
                RaiseError::local_jump(JumpReason::Return, value, "unexpected return")
            }
        }
    }
}

impl From<RaiseError> for Signal {
    fn from(error: RaiseError) -> Self {
        Self::raise(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argument_count_message() {
        let err = ArgumentCountError {
            actual: 3,
            expected: 2,
        };
        assert_eq!(err.to_string(), "wrong number of arguments (3 for 2)");
    }

    #[test]
    fn jumps_are_not_raises() {
        assert!(Signal::Redo.is_jump());
        assert!(Signal::Next(Value::Nil).is_jump());
        let raise = Signal::raise(RaiseError::new(ErrorKind::TypeError, "bad"));
        assert!(!raise.is_jump());
        assert_eq!(raise.as_raise().map(|e| e.kind), Some(ErrorKind::TypeError));
    }

    #[test]
    fn escaped_retry_becomes_local_jump_error() {
        let err = Signal::Retry.into_error();
        assert_eq!(err.kind, ErrorKind::LocalJumpError);
        assert_eq!(err.reason, Some(JumpReason::Retry));
        assert_eq!(err.message, "retry outside of rescue not yet supported");
    }

    #[test]
    fn no_method_error_is_a_name_error() {
        assert!(ErrorKind::NoMethodError.is_a(ErrorKind::NameError));
        assert!(!ErrorKind::NameError.is_a(ErrorKind::NoMethodError));
        assert!(!ErrorKind::ThreadKill.is_rescuable());
    }
}
