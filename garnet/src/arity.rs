use std::fmt;

use crate::{ArgsSpec, ArgumentCountError};

/// How many positional arguments a callable accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arity {
    Fixed(usize),
    AtLeast(usize),
    Any,
}

impl Arity {
    pub const NO_ARGUMENTS: Self = Self::Fixed(0);
    pub const ONE_ARGUMENT: Self = Self::Fixed(1);
    pub const TWO_ARGUMENTS: Self = Self::Fixed(2);
    pub const THREE_ARGUMENTS: Self = Self::Fixed(3);
    pub const OPTIONAL: Self = Self::Any;

    pub const fn fixed(n: usize) -> Self {
        Self::Fixed(n)
    }

    pub const fn optional() -> Self {
        Self::Any
    }

    pub const fn required(min: usize) -> Self {
        Self::AtLeast(min)
    }

    /// Anything with optional or rest parameters only has a lower bound.
    pub fn from_args_spec(spec: &ArgsSpec) -> Self {
        if spec.optional > 0 || spec.rest {
            if spec.required == 0 {
                Self::Any
            } else {
                Self::AtLeast(spec.required)
            }
        } else {
            Self::Fixed(spec.required)
        }
    }

    /// Integer encoding used by `Proc#arity`: `n` for fixed, `-(min + 1)`
    /// otherwise.
    pub fn value(self) -> i64 {
        match self {
            Self::Fixed(n) => n as i64,
            Self::AtLeast(min) => -(min as i64) - 1,
            Self::Any => -1,
        }
    }

    pub fn from_value(value: i64) -> Self {
        match value {
            -1 => Self::Any,
            v if v < 0 => Self::AtLeast((-v - 1) as usize),
            v => Self::Fixed(v as usize),
        }
    }

    pub fn is_fixed(self) -> bool {
        matches!(self, Self::Fixed(_))
    }

    pub fn required_count(self) -> usize {
        match self {
            Self::Fixed(n) | Self::AtLeast(n) => n,
            Self::Any => 0,
        }
    }

    pub fn check(self, actual: usize) -> Result<(), ArgumentCountError> {
        match self {
            Self::Fixed(n) if actual != n => Err(ArgumentCountError {
                actual,
                expected: n,
            }),
            Self::AtLeast(min) if actual < min => Err(ArgumentCountError {
                actual,
                expected: min,
            }),
            _ => Ok(()),
        }
    }

    /// Range check for methods with optional parameters and no rest.
    pub fn check_range(
        actual: usize,
        min: usize,
        max: Option<usize>,
    ) -> Result<(), ArgumentCountError> {
        if actual < min {
            return Err(ArgumentCountError {
                actual,
                expected: min,
            });
        }
        match max {
            Some(max) if actual > max => Err(ArgumentCountError {
                actual,
                expected: max,
            }),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}
