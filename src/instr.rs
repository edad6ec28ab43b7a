//! Routine instructions
//!
//! A compiled routine is a flat array of [`Instr`]. Every instruction has a
//! position (`ip`) in that array; jumps, handler pushes and conditional
//! branches refer to other instructions by position. Positions are assigned
//! by the builder and rewritten when the optimizer compacts the array.

use std::fmt;

use crate::ast::{Expr, SetTarget, SqlStatement, VarRef};
use crate::condition::{HandlerKind, HandlerSpec};
use crate::error::Error;
use crate::types::QualifiedName;

/// Instruction position
pub type Ip = usize;

/// Placeholder target of a jump whose label is not resolved yet
pub const UNRESOLVED: Ip = usize::MAX;

/// Statement delegated to the host
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Sql(SqlStatement),
    Call { name: QualifiedName, args: Vec<Expr> },
}

/// Which target field of an instruction a backpatch request fills
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetField {
    Dest,
    Cont,
}

/// One executable step
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    /// Run a statement through the host
    Stmt(Statement),
    /// Assign a local or session variable
    Set { target: SetTarget, value: Expr },
    /// Evaluate a simple CASE operand once; `cont` is where a CONTINUE
    /// handler resumes if evaluation fails
    SetCaseExpr { case_id: usize, value: Expr, cont: Ip },
    Jump { dest: Ip },
    /// Branch to `dest` unless `cond` is true
    JumpIfNot { cond: Expr, dest: Ip, cont: Ip },
    /// Set the function result and stop
    FReturn { value: Expr },
    /// Install a handler whose body starts at `body`, then continue at `dest`
    HPushJump { dest: Ip, body: Ip, handler: HandlerSpec },
    /// Remove the most recently installed handlers
    HPop { count: usize },
    /// End of a handler body. EXIT handlers unwind to the given handler and
    /// cursor depths and continue at `dest`; CONTINUE handlers resume at the
    /// saved resumption point.
    HReturn { kind: HandlerKind, dest: Ip, handler_depth: usize, cursor_depth: usize },
    /// Declare a cursor
    CPush { cursor: usize, name: String, query: SqlStatement },
    COpen { cursor: usize, name: String },
    CFetch { cursor: usize, name: String, into: Vec<VarRef> },
    CClose { cursor: usize, name: String },
    /// Drop the most recently declared cursors
    CPop { count: usize },
    /// Raise a fixed condition
    Error(Error),
}

impl Instr {
    pub fn name(&self) -> &'static str {
        match self {
            Instr::Stmt(_) => "stmt",
            Instr::Set { .. } => "set",
            Instr::SetCaseExpr { .. } => "set_case_expr",
            Instr::Jump { .. } => "jump",
            Instr::JumpIfNot { .. } => "jump_if_not",
            Instr::FReturn { .. } => "freturn",
            Instr::HPushJump { .. } => "hpush_jump",
            Instr::HPop { .. } => "hpop",
            Instr::HReturn { .. } => "hreturn",
            Instr::CPush { .. } => "cpush",
            Instr::COpen { .. } => "copen",
            Instr::CFetch { .. } => "cfetch",
            Instr::CClose { .. } => "cclose",
            Instr::CPop { .. } => "cpop",
            Instr::Error(_) => "error",
        }
    }

    /// Whether control can reach `ip + 1` directly from this instruction
    pub fn falls_through(&self) -> bool {
        !matches!(
            self,
            Instr::Jump { .. } | Instr::FReturn { .. } | Instr::HPushJump { .. } | Instr::HReturn { .. }
        )
    }

    /// Static branch targets, excluding fall-through
    pub fn targets(&self) -> Vec<Ip> {
        match self {
            Instr::Jump { dest } => vec![*dest],
            Instr::JumpIfNot { dest, cont, .. } => vec![*dest, *cont],
            Instr::SetCaseExpr { cont, .. } => vec![*cont],
            Instr::HPushJump { dest, body, .. } => vec![*dest, *body],
            Instr::HReturn {
                kind: HandlerKind::Exit,
                dest,
                ..
            } => vec![*dest],
            _ => Vec::new(),
        }
    }

    /// Mutable access to every target, for renumbering
    pub fn targets_mut(&mut self) -> Vec<&mut Ip> {
        match self {
            Instr::Jump { dest } => vec![dest],
            Instr::JumpIfNot { dest, cont, .. } => vec![dest, cont],
            Instr::SetCaseExpr { cont, .. } => vec![cont],
            Instr::HPushJump { dest, body, .. } => vec![dest, body],
            Instr::HReturn {
                kind: HandlerKind::Exit,
                dest,
                ..
            } => vec![dest],
            _ => Vec::new(),
        }
    }

    /// The target a backpatch request for `field` fills
    pub fn target_mut(&mut self, field: TargetField) -> Option<&mut Ip> {
        match (self, field) {
            (Instr::Jump { dest }, TargetField::Dest)
            | (Instr::JumpIfNot { dest, .. }, TargetField::Dest)
            | (Instr::HPushJump { dest, .. }, TargetField::Dest)
            | (Instr::HReturn { dest, .. }, TargetField::Dest) => Some(dest),
            (Instr::JumpIfNot { cont, .. }, TargetField::Cont)
            | (Instr::SetCaseExpr { cont, .. }, TargetField::Cont) => Some(cont),
            _ => None,
        }
    }

    /// Primary destination that jump-chain shortcutting may retarget
    pub(crate) fn shortcut_dest_mut(&mut self) -> Option<&mut Ip> {
        match self {
            Instr::Jump { dest } | Instr::JumpIfNot { dest, .. } | Instr::HPushJump { dest, .. } => Some(dest),
            Instr::HReturn {
                kind: HandlerKind::Exit,
                dest,
                ..
            } => Some(dest),
            _ => None,
        }
    }

    /// Where a CONTINUE handler resumes after this instruction raised
    pub fn continuation(&self, ip: Ip) -> Ip {
        match self {
            Instr::JumpIfNot { cont, .. } | Instr::SetCaseExpr { cont, .. } => *cont,
            _ => ip + 1,
        }
    }
}

fn fmt_target(f: &mut fmt::Formatter<'_>, ip: Ip) -> fmt::Result {
    if ip == UNRESOLVED {
        write!(f, "?")
    } else {
        write!(f, "{}", ip)
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())?;
        match self {
            Instr::Stmt(Statement::Sql(sql)) => write!(f, " \"{}\"", sql.text),
            Instr::Stmt(Statement::Call { name, args }) => {
                write!(f, " CALL {}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            Instr::Set { target, value } => match target {
                SetTarget::Local(var) => write!(f, " {} {}", Expr::Var(var.clone()), value),
                SetTarget::User(name) => write!(f, " @{} {}", name, value),
            },
            Instr::SetCaseExpr { case_id, value, cont } => {
                write!(f, " (")?;
                fmt_target(f, *cont)?;
                write!(f, ") {} {}", case_id, value)
            }
            Instr::Jump { dest } => {
                write!(f, " ")?;
                fmt_target(f, *dest)
            }
            Instr::JumpIfNot { cond, dest, cont } => {
                write!(f, " ")?;
                fmt_target(f, *dest)?;
                write!(f, "(")?;
                fmt_target(f, *cont)?;
                write!(f, ") {}", cond)
            }
            Instr::FReturn { value } => write!(f, " {}", value),
            Instr::HPushJump { dest, handler, .. } => {
                write!(f, " ")?;
                fmt_target(f, *dest)?;
                write!(f, " {} {}", handler.var_frame, handler.kind)?;
                for cond in &handler.conditions {
                    write!(f, " {}", cond)?;
                }
                Ok(())
            }
            Instr::HPop { count } | Instr::CPop { count } => write!(f, " {}", count),
            Instr::HReturn { kind, dest, .. } => match kind {
                HandlerKind::Continue => write!(f, " CONTINUE"),
                HandlerKind::Exit => {
                    write!(f, " EXIT ")?;
                    fmt_target(f, *dest)
                }
            },
            Instr::CPush { cursor, name, query } => write!(f, " {}@{}: {}", name, cursor, query.text),
            Instr::COpen { cursor, name } | Instr::CClose { cursor, name } => {
                write!(f, " {}@{}", name, cursor)
            }
            Instr::CFetch { cursor, name, into } => {
                write!(f, " {}@{}", name, cursor)?;
                for var in into {
                    write!(f, " {}", Expr::Var(var.clone()))?;
                }
                Ok(())
            }
            Instr::Error(err) => write!(f, " {}", err.sqlstate),
        }
    }
}
