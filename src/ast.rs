//! Parsed routine bodies
//!
//! These are the statement and expression trees the external SQL parser
//! hands to the compiler. Nothing here tokenizes SQL: plain SQL statements
//! stay opaque ([`SqlStatement`]) and are passed back to the statement
//! executor when a routine runs them.

use std::fmt;

use crate::condition::{ConditionValue, HandlerKind};
use crate::types::{FieldDef, QualifiedName, RoutineKind, Value};

// ============================================================================
// Expressions
// ============================================================================

/// Reference to a local variable; the slot is filled in by the compiler
#[derive(Debug, Clone, PartialEq)]
pub struct VarRef {
    pub name: String,
    pub slot: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    IntDiv,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Concat,
}

impl BinaryOp {
    fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::IntDiv => "DIV",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Concat => "||",
        }
    }
}

/// Expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Local variable or routine parameter
    Var(VarRef),
    /// Session variable (`@name`)
    UserVar(String),
    /// Operand of the enclosing simple CASE statement
    CaseValue(usize),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    IsNull(Box<Expr>),
    /// Stored function call
    Call { name: QualifiedName, args: Vec<Expr> },
}

impl Expr {
    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var(VarRef {
            name: name.into(),
            slot: None,
        })
    }

    pub fn user_var(name: impl Into<String>) -> Self {
        Expr::UserVar(name.into())
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary(op, Box::new(left), Box::new(right))
    }

    pub fn call(name: QualifiedName, args: Vec<Expr>) -> Self {
        Expr::Call { name, args }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(Value::Text(s)) => write!(f, "'{}'", s.replace('\'', "''")),
            Expr::Literal(v) => write!(f, "{}", v),
            Expr::Var(VarRef { name, slot: Some(s) }) => write!(f, "{}@{}", name, s),
            Expr::Var(VarRef { name, slot: None }) => write!(f, "{}", name),
            Expr::UserVar(name) => write!(f, "@{}", name),
            Expr::CaseValue(id) => write!(f, "case_expr@{}", id),
            Expr::Unary(UnaryOp::Neg, e) => write!(f, "-({})", e),
            Expr::Unary(UnaryOp::Not, e) => write!(f, "NOT ({})", e),
            Expr::Binary(op, l, r) => write!(f, "{} {} {}", l, op.symbol(), r),
            Expr::IsNull(e) => write!(f, "{} IS NULL", e),
            Expr::Call { name, args } => {
                write!(f, "{}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
        }
    }
}

// ============================================================================
// Opaque SQL
// ============================================================================

/// What an opaque statement does, as far as routine flags care
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// SELECT sending a result set to the client
    Query,
    /// INSERT, UPDATE, DELETE and other data changes
    Dml,
    /// COMMIT, ROLLBACK, START TRANSACTION, SET autocommit
    Transaction,
    /// PREPARE, EXECUTE, DEALLOCATE
    Dynamic,
    Other,
}

/// A parsed SQL statement the routine engine does not interpret
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub text: String,
    pub kind: StatementKind,
    /// Routine variables the statement reads, bound positionally
    pub params: Vec<Expr>,
}

impl SqlStatement {
    pub fn new(text: impl Into<String>, kind: StatementKind) -> Self {
        SqlStatement {
            text: text.into(),
            kind,
            params: Vec::new(),
        }
    }

    pub fn query(text: impl Into<String>) -> Self {
        SqlStatement::new(text, StatementKind::Query)
    }

    pub fn with_params(mut self, params: Vec<Expr>) -> Self {
        self.params = params;
        self
    }
}

// ============================================================================
// Statements
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct VarDecl {
    pub names: Vec<String>,
    pub field: FieldDef,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CursorDecl {
    pub name: String,
    pub query: SqlStatement,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HandlerDecl {
    pub kind: HandlerKind,
    pub conditions: Vec<ConditionValue>,
    pub body: Box<Stmt>,
}

/// `BEGIN ... END` with its declarations in declaration order
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    pub label: Option<String>,
    pub vars: Vec<VarDecl>,
    pub conditions: Vec<(String, ConditionValue)>,
    pub cursors: Vec<CursorDecl>,
    pub handlers: Vec<HandlerDecl>,
    pub body: Vec<Stmt>,
}

/// Assignment target
#[derive(Debug, Clone, PartialEq)]
pub enum SetTarget {
    Local(VarRef),
    User(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Block(Block),
    Set { target: SetTarget, value: Expr },
    If { branches: Vec<(Expr, Vec<Stmt>)>, else_body: Option<Vec<Stmt>> },
    /// Searched CASE when `operand` is `None`
    Case { operand: Option<Expr>, whens: Vec<(Expr, Vec<Stmt>)>, else_body: Option<Vec<Stmt>> },
    While { label: Option<String>, cond: Expr, body: Vec<Stmt> },
    Repeat { label: Option<String>, body: Vec<Stmt>, until: Expr },
    Loop { label: Option<String>, body: Vec<Stmt> },
    Leave(String),
    Iterate(String),
    Return(Expr),
    Open(String),
    Fetch { cursor: String, into: Vec<String> },
    Close(String),
    Signal { condition: ConditionValue, message: Option<String> },
    Sql(SqlStatement),
    Call { name: QualifiedName, args: Vec<Expr> },
}

impl Stmt {
    pub fn set(name: impl Into<String>, value: Expr) -> Self {
        Stmt::Set {
            target: SetTarget::Local(VarRef {
                name: name.into(),
                slot: None,
            }),
            value,
        }
    }

    pub fn set_user(name: impl Into<String>, value: Expr) -> Self {
        Stmt::Set {
            target: SetTarget::User(name.into()),
            value,
        }
    }
}

// ============================================================================
// Routine Source
// ============================================================================

/// Parameter passing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamMode {
    In,
    Out,
    InOut,
}

impl ParamMode {
    pub fn is_in(&self) -> bool {
        matches!(self, ParamMode::In | ParamMode::InOut)
    }

    pub fn is_out(&self) -> bool {
        matches!(self, ParamMode::Out | ParamMode::InOut)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub mode: ParamMode,
    pub field: FieldDef,
}

impl Param {
    pub fn new(name: impl Into<String>, mode: ParamMode, field: FieldDef) -> Self {
        Param {
            name: name.into(),
            mode,
            field,
        }
    }
}

/// A routine as produced by the parser
#[derive(Debug, Clone, PartialEq)]
pub struct RoutineSource {
    pub name: QualifiedName,
    pub kind: RoutineKind,
    pub params: Vec<Param>,
    pub returns: Option<FieldDef>,
    pub body: Stmt,
}
