//! Expression evaluation
//!
//! NULL propagates through arithmetic, comparison and concatenation. AND and
//! OR use three-valued logic and short-circuit. Integer arithmetic is checked
//! and fails with an out-of-range error instead of wrapping.

use std::cmp::Ordering;

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::error::{Error, ErrorCode, Result};
use crate::host::Host;
use crate::session::{FrameId, Session};
use crate::types::{SqlMode, Value};

impl<H: Host> Session<H> {
    /// Evaluate `expr` in the context of `frame`; without a frame only
    /// literals, user variables and function calls are available
    pub(crate) fn eval(&mut self, frame: Option<FrameId>, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Var(var) => match (frame, var.slot) {
                (Some(frame), Some(slot)) => Ok(self.context_ref(frame)?.get(slot)?.clone()),
                _ => Err(Error::with_message(
                    ErrorCode::Undeclared,
                    format!("Undeclared variable: {}", var.name),
                )),
            },
            Expr::UserVar(name) => Ok(self.user_var(name).cloned().unwrap_or(Value::Null)),
            Expr::CaseValue(id) => match frame {
                Some(frame) => Ok(self.context_ref(frame)?.case_value(*id)?.clone()),
                None => Err(Error::with_message(ErrorCode::Internal, "CASE operand outside a routine")),
            },
            Expr::Unary(op, operand) => {
                let value = self.eval(frame, operand)?;
                self.unary(frame, *op, value)
            }
            Expr::Binary(BinaryOp::And, left, right) => {
                let l = truth(&self.eval(frame, left)?);
                if l == Some(false) {
                    return Ok(Value::Int(0));
                }
                let r = truth(&self.eval(frame, right)?);
                Ok(match (l, r) {
                    (_, Some(false)) => Value::Int(0),
                    (Some(true), Some(true)) => Value::Int(1),
                    _ => Value::Null,
                })
            }
            Expr::Binary(BinaryOp::Or, left, right) => {
                let l = truth(&self.eval(frame, left)?);
                if l == Some(true) {
                    return Ok(Value::Int(1));
                }
                let r = truth(&self.eval(frame, right)?);
                Ok(match (l, r) {
                    (_, Some(true)) => Value::Int(1),
                    (Some(false), Some(false)) => Value::Int(0),
                    _ => Value::Null,
                })
            }
            Expr::Binary(op, left, right) => {
                let l = self.eval(frame, left)?;
                let r = self.eval(frame, right)?;
                self.binary(frame, *op, l, r)
            }
            Expr::IsNull(operand) => Ok(Value::Int(self.eval(frame, operand)?.is_null() as i64)),
            Expr::Call { name, args } => self.invoke_function(frame, name, args),
        }
    }

    fn unary(&mut self, frame: Option<FrameId>, op: UnaryOp, value: Value) -> Result<Value> {
        match (op, value) {
            (_, Value::Null) => Ok(Value::Null),
            (UnaryOp::Not, v) => Ok(Value::Int(!v.is_true() as i64)),
            (UnaryOp::Neg, Value::Int(i)) => i.checked_neg().map(Value::Int).ok_or_else(out_of_range),
            (UnaryOp::Neg, Value::UInt(u)) => int_result(-(u as i128)),
            (UnaryOp::Neg, v) => Ok(Value::Double(-self.numeric(frame, &v))),
        }
    }

    fn binary(&mut self, frame: Option<FrameId>, op: BinaryOp, l: Value, r: Value) -> Result<Value> {
        if l.is_null() || r.is_null() {
            return Ok(Value::Null);
        }
        let compare = |want: fn(Ordering) -> bool| match l.sql_cmp(&r) {
            Some(ord) => Value::Int(want(ord) as i64),
            None => Value::Null,
        };
        match op {
            BinaryOp::Eq => Ok(compare(|o| o == Ordering::Equal)),
            BinaryOp::Ne => Ok(compare(|o| o != Ordering::Equal)),
            BinaryOp::Lt => Ok(compare(|o| o == Ordering::Less)),
            BinaryOp::Le => Ok(compare(|o| o != Ordering::Greater)),
            BinaryOp::Gt => Ok(compare(|o| o == Ordering::Greater)),
            BinaryOp::Ge => Ok(compare(|o| o != Ordering::Less)),
            BinaryOp::Concat => Ok(Value::Text(l.to_text() + &r.to_text())),
            BinaryOp::And | BinaryOp::Or => Ok(Value::Int((l.is_true() && r.is_true()) as i64)),
            _ => self.arithmetic(frame, op, &l, &r),
        }
    }

    fn arithmetic(&mut self, frame: Option<FrameId>, op: BinaryOp, l: &Value, r: &Value) -> Result<Value> {
        if let (Some(a), Some(b)) = (integral(l), integral(r)) {
            return match op {
                BinaryOp::Add => int_result(a + b),
                BinaryOp::Sub => int_result(a - b),
                BinaryOp::Mul => a.checked_mul(b).map_or_else(|| Err(out_of_range()), int_result),
                BinaryOp::Div if b == 0 => self.division_by_zero(frame),
                BinaryOp::Div => Ok(Value::Double(a as f64 / b as f64)),
                BinaryOp::IntDiv | BinaryOp::Mod if b == 0 => self.division_by_zero(frame),
                BinaryOp::IntDiv => int_result(a / b),
                BinaryOp::Mod => int_result(a % b),
                _ => Err(Error::with_message(ErrorCode::Internal, format!("{:?} is not arithmetic", op))),
            };
        }

        let a = self.numeric(frame, l);
        let b = self.numeric(frame, r);
        match op {
            BinaryOp::Add => Ok(Value::Double(a + b)),
            BinaryOp::Sub => Ok(Value::Double(a - b)),
            BinaryOp::Mul => Ok(Value::Double(a * b)),
            BinaryOp::Div | BinaryOp::IntDiv | BinaryOp::Mod if b == 0.0 => self.division_by_zero(frame),
            BinaryOp::Div => Ok(Value::Double(a / b)),
            BinaryOp::IntDiv => {
                let q = (a / b).trunc();
                if q.is_finite() && q.abs() < 9.3e18 {
                    int_result(q as i128)
                } else {
                    Err(out_of_range())
                }
            }
            BinaryOp::Mod => Ok(Value::Double(a % b)),
            _ => Err(Error::with_message(ErrorCode::Internal, format!("{:?} is not arithmetic", op))),
        }
    }

    /// Division by zero fails under ERROR_FOR_DIVISION_BY_ZERO, otherwise it
    /// yields NULL with a warning
    fn division_by_zero(&mut self, frame: Option<FrameId>) -> Result<Value> {
        if self.state.sql_mode.contains(SqlMode::ERROR_FOR_DIVISION_BY_ZERO) {
            return Err(Error::new(ErrorCode::DivisionByZero));
        }
        let warning = Error {
            code: ErrorCode::DivisionByZero,
            sqlstate: "01000".to_string(),
            message: "Division by 0".to_string(),
        };
        self.push_warning(frame, warning);
        Ok(Value::Null)
    }

    /// Numeric view of an operand; non-numeric strings count as 0 with a
    /// warning
    fn numeric(&mut self, frame: Option<FrameId>, value: &Value) -> f64 {
        match value.as_f64() {
            Some(f) => f,
            None => {
                let warning = Error {
                    code: ErrorCode::InvalidValue,
                    sqlstate: "01000".to_string(),
                    message: format!("Truncated incorrect DOUBLE value: '{}'", value),
                };
                self.push_warning(frame, warning);
                0.0
            }
        }
    }
}

/// Three-valued truth: `None` for NULL
fn truth(value: &Value) -> Option<bool> {
    if value.is_null() {
        None
    } else {
        Some(value.is_true())
    }
}

fn integral(value: &Value) -> Option<i128> {
    match value {
        Value::Int(i) => Some(*i as i128),
        Value::UInt(u) => Some(*u as i128),
        _ => None,
    }
}

fn int_result(n: i128) -> Result<Value> {
    if let Ok(i) = i64::try_from(n) {
        Ok(Value::Int(i))
    } else if let Ok(u) = u64::try_from(n) {
        Ok(Value::UInt(u))
    } else {
        Err(out_of_range())
    }
}

fn out_of_range() -> Error {
    Error::with_message(ErrorCode::OutOfRange, "BIGINT value is out of range")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::ast::{RoutineSource, SqlStatement};
    use crate::host::{Catalog, RoutineParser, RowBuffer, RowSource, StatementExecutor, StatementOutcome};
    use crate::routine::RoutineDefinition;
    use crate::session::{EngineContext, SessionState};
    use crate::types::{QualifiedName, RoutineKind};

    struct NoHost;

    impl StatementExecutor for NoHost {
        fn execute(&mut self, _: &SqlStatement, _: &[Value], _: &SessionState) -> Result<StatementOutcome> {
            Ok(StatementOutcome::default())
        }

        fn open_cursor(&mut self, _: &SqlStatement, _: &[Value], _: &SessionState) -> Result<Box<dyn RowSource>> {
            Ok(Box::new(RowBuffer::default()))
        }
    }

    impl RoutineParser for NoHost {
        fn parse_routine(&mut self, def: &RoutineDefinition) -> Result<RoutineSource> {
            Err(Error::with_message(ErrorCode::CorruptDefinition, format!("cannot parse {}", def.name)))
        }

        fn reparse_statement(&mut self, stmt: &SqlStatement) -> Result<SqlStatement> {
            Ok(stmt.clone())
        }
    }

    impl Catalog for NoHost {
        fn load_definition(&mut self, _: &QualifiedName, _: RoutineKind) -> Result<Option<RoutineDefinition>> {
            Ok(None)
        }
    }

    fn session() -> Session<NoHost> {
        Session::new(Arc::new(EngineContext::default()), NoHost)
    }

    fn bin(op: BinaryOp, l: impl Into<Value>, r: impl Into<Value>) -> Expr {
        Expr::binary(op, Expr::lit(l), Expr::lit(r))
    }

    #[test]
    fn test_arithmetic() {
        let mut s = session();
        assert_eq!(s.eval(None, &bin(BinaryOp::Add, 2, 3)).unwrap(), Value::Int(5));
        assert_eq!(s.eval(None, &bin(BinaryOp::Div, 7, 2)).unwrap(), Value::Double(3.5));
        assert_eq!(s.eval(None, &bin(BinaryOp::IntDiv, 7, 2)).unwrap(), Value::Int(3));
        assert_eq!(s.eval(None, &bin(BinaryOp::Mod, 7, 2)).unwrap(), Value::Int(1));
        assert_eq!(s.eval(None, &bin(BinaryOp::Mul, 1.5, 2)).unwrap(), Value::Double(3.0));
        assert_eq!(
            s.eval(None, &bin(BinaryOp::Add, i64::MAX, i64::MAX)).unwrap(),
            Value::UInt(2 * i64::MAX as u64)
        );
        let err = s.eval(None, &bin(BinaryOp::Mul, i64::MAX, i64::MAX)).unwrap_err();
        assert_eq!(err.code, ErrorCode::OutOfRange);
        assert_eq!(s.eval(None, &bin(BinaryOp::Add, Value::Null, 1)).unwrap(), Value::Null);
    }

    #[test]
    fn test_division_by_zero_follows_sql_mode() {
        let mut s = session();
        let err = s.eval(None, &bin(BinaryOp::Div, 1, 0)).unwrap_err();
        assert_eq!(err.sqlstate, "22012");

        s.set_sql_mode(SqlMode::STRICT_TRANS_TABLES);
        assert_eq!(s.eval(None, &bin(BinaryOp::Div, 1, 0)).unwrap(), Value::Null);
        assert_eq!(s.warnings().len(), 1);
        assert_eq!(s.warnings()[0].code, ErrorCode::DivisionByZero);
        assert!(s.warnings()[0].is_warning());
    }

    #[test]
    fn test_three_valued_logic() {
        let mut s = session();
        assert_eq!(s.eval(None, &bin(BinaryOp::And, 0, Value::Null)).unwrap(), Value::Int(0));
        assert_eq!(s.eval(None, &bin(BinaryOp::And, 1, Value::Null)).unwrap(), Value::Null);
        assert_eq!(s.eval(None, &bin(BinaryOp::Or, 1, Value::Null)).unwrap(), Value::Int(1));
        assert_eq!(s.eval(None, &bin(BinaryOp::Or, 0, Value::Null)).unwrap(), Value::Null);
        // Short-circuit skips the failing right side
        let guarded = Expr::binary(BinaryOp::And, Expr::lit(0), bin(BinaryOp::Div, 1, 0));
        assert_eq!(s.eval(None, &guarded).unwrap(), Value::Int(0));
    }

    #[test]
    fn test_comparison_and_concat() {
        let mut s = session();
        assert_eq!(s.eval(None, &bin(BinaryOp::Lt, 1, 2.5)).unwrap(), Value::Int(1));
        assert_eq!(s.eval(None, &bin(BinaryOp::Eq, "a", "b")).unwrap(), Value::Int(0));
        assert_eq!(s.eval(None, &bin(BinaryOp::Ne, Value::Null, 1)).unwrap(), Value::Null);
        assert_eq!(
            s.eval(None, &bin(BinaryOp::Concat, "ab", 12)).unwrap(),
            Value::Text("ab12".into())
        );
        assert_eq!(
            s.eval(None, &Expr::IsNull(Box::new(Expr::user_var("unset")))).unwrap(),
            Value::Int(1)
        );
    }

    #[test]
    fn test_local_variable_needs_frame() {
        let mut s = session();
        let err = s.eval(None, &Expr::var("x")).unwrap_err();
        assert_eq!(err.code, ErrorCode::Undeclared);
    }
}
