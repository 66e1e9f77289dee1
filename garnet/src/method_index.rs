use crate::Value;

/// Operators with a primitive fast path on Integer and Float receivers.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FastOp {
    Plus,
    Minus,
    Mul,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

#[derive(Debug, Clone, Copy)]
pub struct FastOpEntry {
    pub name: &'static str,
    pub op: FastOp,
}

impl FastOpEntry {
    pub const fn new(name: &'static str, op: FastOp) -> Self {
        Self { name, op }
    }
}

pub const FAST_OPS: &[FastOpEntry] = &[
    FastOpEntry::new("+", FastOp::Plus),
    FastOpEntry::new("-", FastOp::Minus),
    FastOpEntry::new("*", FastOp::Mul),
    FastOpEntry::new("/", FastOp::Div),
    FastOpEntry::new("<", FastOp::Lt),
    FastOpEntry::new("<=", FastOp::Le),
    FastOpEntry::new(">", FastOp::Gt),
    FastOpEntry::new(">=", FastOp::Ge),
    FastOpEntry::new("==", FastOp::Eq),
];

impl FastOp {
    pub fn from_name(name: &str) -> Option<Self> {
        FAST_OPS.iter().find(|entry| entry.name == name).map(|entry| entry.op)
    }

    pub fn name(self) -> &'static str {
        FAST_OPS[self as usize].name
    }

    /// Bit in the runtime's redefinition mask.
    pub fn bit(self) -> u32 {
        1 << (self as u32)
    }

    /// Applies the operator to two primitive numbers. `None` means the
    /// general dispatch path has to decide: other operand types, integer
    /// overflow, or division by zero.
    pub fn apply(self, receiver: &Value, arg: &Value) -> Option<Value> {
        match (receiver, arg) {
            (Value::Fixnum(a), Value::Fixnum(b)) => self.apply_fixnum(*a, *b),
            (Value::Float(a), Value::Float(b)) => Some(self.apply_float(*a, *b)),
            (Value::Float(a), Value::Fixnum(b)) => Some(self.apply_float(*a, *b as f64)),
            _ => None,
        }
    }

    fn apply_fixnum(self, a: i64, b: i64) -> Option<Value> {
        Some(match self {
            Self::Plus => Value::Fixnum(a.checked_add(b)?),
            Self::Minus => Value::Fixnum(a.checked_sub(b)?),
            Self::Mul => Value::Fixnum(a.checked_mul(b)?),
            Self::Div => {
                if b == 0 {
                    return None;
                }
                Value::Fixnum(a.checked_div_euclid(b).map(|q| floor_div(a, b, q))?)
            }
            Self::Lt => Value::bool(a < b),
            Self::Le => Value::bool(a <= b),
            Self::Gt => Value::bool(a > b),
            Self::Ge => Value::bool(a >= b),
            Self::Eq => Value::bool(a == b),
        })
    }

    pub(crate) fn apply_float(self, a: f64, b: f64) -> Value {
        match self {
            Self::Plus => Value::Float(a + b),
            Self::Minus => Value::Float(a - b),
            Self::Mul => Value::Float(a * b),
            Self::Div => Value::Float(a / b),
            Self::Lt => Value::bool(a < b),
            Self::Le => Value::bool(a <= b),
            Self::Gt => Value::bool(a > b),
            Self::Ge => Value::bool(a >= b),
            Self::Eq => Value::bool(a == b),
        }
    }
}

/// Integer division rounds toward negative infinity.
fn floor_div(a: i64, b: i64, euclid: i64) -> i64 {
    if b < 0 && a.rem_euclid(b) != 0 {
        euclid - 1
    } else {
        euclid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_through_the_table() {
        for entry in FAST_OPS {
            assert_eq!(FastOp::from_name(entry.name), Some(entry.op));
            assert_eq!(entry.op.name(), entry.name);
        }
        assert_eq!(FastOp::from_name("foo"), None);
    }

    #[test]
    fn fixnum_division_floors() {
        let div = |a: i64, b: i64| FastOp::Div.apply(&Value::Fixnum(a), &Value::Fixnum(b));
        assert_eq!(div(7, 2), Some(Value::Fixnum(3)));
        assert_eq!(div(-7, 2), Some(Value::Fixnum(-4)));
        assert_eq!(div(7, -2), Some(Value::Fixnum(-4)));
        assert_eq!(div(-7, -2), Some(Value::Fixnum(3)));
        assert_eq!(div(1, 0), None);
    }

    #[test]
    fn overflow_and_mixed_types_defer_to_dispatch() {
        assert_eq!(FastOp::Plus.apply(&Value::Fixnum(i64::MAX), &Value::Fixnum(1)), None);
        assert_eq!(FastOp::Plus.apply(&Value::Fixnum(1), &Value::Float(1.0)), None);
        assert_eq!(
            FastOp::Lt.apply(&Value::Float(1.5), &Value::Fixnum(2)),
            Some(Value::True)
        );
    }
}
