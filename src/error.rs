//! Error types and Result aliases for the stored-routine engine
//!
//! Every failure carries an [`ErrorCode`], the SQLSTATE it is signaled with
//! and a human readable message. Conditions raised while a routine runs are
//! plain `Error` values: the executor offers them to the active handler
//! stack before letting them propagate.

use std::fmt;

use crate::condition::ConditionClass;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// Error Codes
// ============================================================================

/// Engine error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Generic internal failure
    Internal,
    /// Label referenced but never declared, or left unresolved
    MalformedControlFlow,
    /// Variable, cursor or condition declared twice in one scope
    Duplicate,
    /// Reference to an undeclared variable, cursor or condition
    Undeclared,
    /// Construct not permitted in this kind of routine
    NotAllowed,
    /// Routine definition missing from the catalog
    NoSuchRoutine,
    /// Stored definition could not be turned into a routine
    CorruptDefinition,
    /// Statement metadata changed since it was parsed
    StaleMetadata,
    /// Recursion depth budget exceeded
    RecursionLimit,
    /// Wrong number of arguments in a routine call
    ArgumentCount,
    /// OUT or INOUT argument is not an assignable reference
    NotAssignable,
    /// Function completed without assigning a return value
    NoReturn,
    /// Host connection killed while a routine was running
    Interrupted,
    /// Memory or other resource exhausted
    OutOfResources,
    /// Division by zero
    DivisionByZero,
    /// Numeric value out of range for its type
    OutOfRange,
    /// Value cannot be converted to the target type
    InvalidValue,
    /// String value too long for its column
    DataTooLong,
    /// Fetch on an exhausted or closed cursor
    NoData,
    /// Cursor opened twice
    CursorAlreadyOpen,
    /// CLOSE on a cursor that is not open
    CursorNotOpen,
    /// FETCH into the wrong number of variables
    FetchArity,
    /// CASE statement without a matching branch
    CaseNotFound,
    /// Warning raised by a sub-statement
    Warning,
    /// Condition raised by SIGNAL
    Signal,
    /// Unknown metadata key or argument index in a service call
    InvalidArgument,
    /// Error reported by the embedding statement executor
    Statement,
}

impl ErrorCode {
    /// Default SQLSTATE for this code
    pub fn sqlstate(&self) -> &'static str {
        match self {
            ErrorCode::Internal => "HY000",
            ErrorCode::MalformedControlFlow => "42000",
            ErrorCode::Duplicate => "42000",
            ErrorCode::Undeclared => "42000",
            ErrorCode::NotAllowed => "0A000",
            ErrorCode::NoSuchRoutine => "42000",
            ErrorCode::CorruptDefinition => "HY000",
            ErrorCode::StaleMetadata => "HY000",
            ErrorCode::RecursionLimit => "HY000",
            ErrorCode::ArgumentCount => "42000",
            ErrorCode::NotAssignable => "42000",
            ErrorCode::NoReturn => "2F005",
            ErrorCode::Interrupted => "70100",
            ErrorCode::OutOfResources => "HY001",
            ErrorCode::DivisionByZero => "22012",
            ErrorCode::OutOfRange => "22003",
            ErrorCode::InvalidValue => "HY000",
            ErrorCode::DataTooLong => "22001",
            ErrorCode::NoData => "02000",
            ErrorCode::CursorAlreadyOpen => "24000",
            ErrorCode::CursorNotOpen => "24000",
            ErrorCode::FetchArity => "HY000",
            ErrorCode::CaseNotFound => "20000",
            ErrorCode::Warning => "01000",
            ErrorCode::Signal => "45000",
            ErrorCode::InvalidArgument => "HY000",
            ErrorCode::Statement => "HY000",
        }
    }

    /// Numeric error number, matched by `DECLARE ... HANDLER FOR <number>`
    pub fn number(&self) -> u32 {
        match self {
            ErrorCode::Internal => 1815,
            ErrorCode::MalformedControlFlow => 1308,
            ErrorCode::Duplicate => 1331,
            ErrorCode::Undeclared => 1327,
            ErrorCode::NotAllowed => 1336,
            ErrorCode::NoSuchRoutine => 1305,
            ErrorCode::CorruptDefinition => 1457,
            ErrorCode::StaleMetadata => 1615,
            ErrorCode::RecursionLimit => 1456,
            ErrorCode::ArgumentCount => 1318,
            ErrorCode::NotAssignable => 1414,
            ErrorCode::NoReturn => 1321,
            ErrorCode::Interrupted => 1317,
            ErrorCode::OutOfResources => 1041,
            ErrorCode::DivisionByZero => 1365,
            ErrorCode::OutOfRange => 1264,
            ErrorCode::InvalidValue => 1366,
            ErrorCode::DataTooLong => 1406,
            ErrorCode::NoData => 1329,
            ErrorCode::CursorAlreadyOpen => 1325,
            ErrorCode::CursorNotOpen => 1326,
            ErrorCode::FetchArity => 1328,
            ErrorCode::CaseNotFound => 1339,
            ErrorCode::Warning => 1642,
            ErrorCode::Signal => 1644,
            ErrorCode::InvalidArgument => 1210,
            ErrorCode::Statement => 1105,
        }
    }

    /// Fatal errors unwind the call without consulting any handler
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorCode::Interrupted
                | ErrorCode::RecursionLimit
                | ErrorCode::ArgumentCount
                | ErrorCode::OutOfResources
        )
    }

    /// Default message used when none is supplied
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::Internal => "internal error",
            ErrorCode::MalformedControlFlow => "malformed control flow",
            ErrorCode::Duplicate => "duplicate declaration",
            ErrorCode::Undeclared => "undeclared identifier",
            ErrorCode::NotAllowed => "not allowed in this context",
            ErrorCode::NoSuchRoutine => "routine does not exist",
            ErrorCode::CorruptDefinition => "failed to load routine",
            ErrorCode::StaleMetadata => "prepared statement needs to be re-prepared",
            ErrorCode::RecursionLimit => "recursion limit exceeded",
            ErrorCode::ArgumentCount => "incorrect number of arguments",
            ErrorCode::NotAssignable => "argument is not a variable",
            ErrorCode::NoReturn => "function ended without RETURN",
            ErrorCode::Interrupted => "query execution was interrupted",
            ErrorCode::OutOfResources => "out of resources",
            ErrorCode::DivisionByZero => "division by 0",
            ErrorCode::OutOfRange => "value out of range",
            ErrorCode::InvalidValue => "incorrect value",
            ErrorCode::DataTooLong => "data too long",
            ErrorCode::NoData => "no data - zero rows fetched, selected, or processed",
            ErrorCode::CursorAlreadyOpen => "cursor is already open",
            ErrorCode::CursorNotOpen => "cursor is not open",
            ErrorCode::FetchArity => "incorrect number of FETCH variables",
            ErrorCode::CaseNotFound => "case not found for CASE statement",
            ErrorCode::Warning => "warning",
            ErrorCode::Signal => "unhandled user-defined exception condition",
            ErrorCode::InvalidArgument => "invalid argument",
            ErrorCode::Statement => "statement failed",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// Error
// ============================================================================

/// An engine error or signaled condition
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (SQLSTATE {sqlstate})")]
pub struct Error {
    /// Error code
    pub code: ErrorCode,
    /// Five character SQLSTATE
    pub sqlstate: String,
    /// Message text
    pub message: String,
}

impl Error {
    /// Create an error with the code's default SQLSTATE and message
    pub fn new(code: ErrorCode) -> Self {
        Error {
            code,
            sqlstate: code.sqlstate().to_string(),
            message: code.default_message().to_string(),
        }
    }

    /// Create an error with a custom message
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Error {
            code,
            sqlstate: code.sqlstate().to_string(),
            message: message.into(),
        }
    }

    /// A condition raised by SIGNAL with an explicit SQLSTATE
    pub fn signal(sqlstate: impl Into<String>, message: Option<String>) -> Self {
        let sqlstate = sqlstate.into();
        let class = ConditionClass::of(&sqlstate);
        let code = match class {
            ConditionClass::Warning => ErrorCode::Warning,
            ConditionClass::NotFound => ErrorCode::NoData,
            _ => ErrorCode::Signal,
        };
        let message = message.unwrap_or_else(|| match class {
            ConditionClass::Warning => "unhandled user-defined warning condition".to_string(),
            ConditionClass::NotFound => "unhandled user-defined not found condition".to_string(),
            _ => code.default_message().to_string(),
        });
        Error {
            code,
            sqlstate,
            message,
        }
    }

    /// Condition class derived from the SQLSTATE
    pub fn class(&self) -> ConditionClass {
        ConditionClass::of(&self.sqlstate)
    }

    /// Fatal errors never reach a handler
    pub fn is_fatal(&self) -> bool {
        self.code.is_fatal()
    }

    /// Warnings do not stop execution when unhandled
    pub fn is_warning(&self) -> bool {
        self.class() == ConditionClass::Warning
    }
}
