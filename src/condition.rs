//! Conditions and handler declarations
//!
//! A handler is declared for a list of condition values. When a condition is
//! raised the executor looks for the innermost scope with a matching handler
//! and picks the most specific match in that scope.

use std::fmt;

use crate::error::Error;

/// Broad class of a condition, derived from the first two SQLSTATE chars
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionClass {
    /// "00": successful completion, never signaled
    Success,
    /// "01"
    Warning,
    /// "02"
    NotFound,
    /// Everything else
    Exception,
}

impl ConditionClass {
    pub fn of(sqlstate: &str) -> Self {
        match sqlstate.get(..2) {
            Some("00") => ConditionClass::Success,
            Some("01") => ConditionClass::Warning,
            Some("02") => ConditionClass::NotFound,
            _ => ConditionClass::Exception,
        }
    }
}

/// Check that a SQLSTATE is five uppercase alphanumerics
pub fn is_valid_sqlstate(sqlstate: &str) -> bool {
    sqlstate.len() == 5
        && sqlstate
            .bytes()
            .all(|b| b.is_ascii_digit() || b.is_ascii_uppercase())
}

// ============================================================================
// Condition Values
// ============================================================================

/// One condition a handler (or a named condition) refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionValue {
    /// Numeric error code
    ErrorNumber(u32),
    /// Exact SQLSTATE
    SqlState(String),
    /// Named condition declared with `DECLARE name CONDITION FOR ...`,
    /// replaced by its definition at compile time
    Named(String),
    /// SQLWARNING
    Warning,
    /// NOT FOUND
    NotFound,
    /// SQLEXCEPTION
    Exception,
}

impl ConditionValue {
    /// Match priority against a raised condition, higher is more specific
    pub fn priority(&self, err: &Error) -> Option<u8> {
        match self {
            ConditionValue::ErrorNumber(n) if *n == err.code.number() => Some(3),
            ConditionValue::SqlState(s) if *s == err.sqlstate => Some(2),
            ConditionValue::Warning if err.class() == ConditionClass::Warning => Some(1),
            ConditionValue::NotFound if err.class() == ConditionClass::NotFound => Some(1),
            ConditionValue::Exception if err.class() == ConditionClass::Exception => Some(1),
            _ => None,
        }
    }
}

impl fmt::Display for ConditionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionValue::ErrorNumber(n) => write!(f, "{}", n),
            ConditionValue::SqlState(s) => write!(f, "SQLSTATE '{}'", s),
            ConditionValue::Named(name) => write!(f, "{}", name),
            ConditionValue::Warning => write!(f, "SQLWARNING"),
            ConditionValue::NotFound => write!(f, "NOT FOUND"),
            ConditionValue::Exception => write!(f, "SQLEXCEPTION"),
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Handler disposition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Leave the declaring block after the handler body
    Exit,
    /// Resume after the statement that raised the condition
    Continue,
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerKind::Exit => write!(f, "EXIT"),
            HandlerKind::Continue => write!(f, "CONTINUE"),
        }
    }
}

/// A handler as installed by `hpush_jump`
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerSpec {
    pub kind: HandlerKind,
    /// Resolved condition values (no `Named` entries)
    pub conditions: Vec<ConditionValue>,
    /// Number of variable slots declared before the handler; slots at or
    /// above this index are saved across a CONTINUE handler body
    pub var_frame: usize,
    /// Parsing scope the handler was declared in
    pub scope: usize,
    /// Handlers and cursors visible where the handler is declared; the body
    /// is compiled against these stack depths
    pub handler_base: usize,
    pub cursor_base: usize,
}

impl HandlerSpec {
    /// Best match priority of any of this handler's conditions
    pub fn priority(&self, err: &Error) -> Option<u8> {
        self.conditions.iter().filter_map(|c| c.priority(err)).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_classes() {
        assert_eq!(ConditionClass::of("01000"), ConditionClass::Warning);
        assert_eq!(ConditionClass::of("02000"), ConditionClass::NotFound);
        assert_eq!(ConditionClass::of("22012"), ConditionClass::Exception);
        assert_eq!(ConditionClass::of("00000"), ConditionClass::Success);
    }

    #[test]
    fn test_sqlstate_validation() {
        assert!(is_valid_sqlstate("45000"));
        assert!(is_valid_sqlstate("HY000"));
        assert!(!is_valid_sqlstate("4500"));
        assert!(!is_valid_sqlstate("hy000"));
    }

    #[test]
    fn test_priority_order() {
        let err = Error::new(ErrorCode::DivisionByZero);
        assert_eq!(ConditionValue::ErrorNumber(1365).priority(&err), Some(3));
        assert_eq!(ConditionValue::SqlState("22012".into()).priority(&err), Some(2));
        assert_eq!(ConditionValue::Exception.priority(&err), Some(1));
        assert_eq!(ConditionValue::NotFound.priority(&err), None);

        let spec = HandlerSpec {
            kind: HandlerKind::Continue,
            conditions: vec![ConditionValue::Exception, ConditionValue::SqlState("22012".into())],
            var_frame: 0,
            scope: 0,
            handler_base: 1,
            cursor_base: 0,
        };
        assert_eq!(spec.priority(&err), Some(2));
    }
}
