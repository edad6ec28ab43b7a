//! Routine compiler
//!
//! Lowers a parsed routine body into instructions. Declarations go into the
//! [`ParseContext`], control flow becomes jumps against builder labels, and
//! the result is finalized into a [`Routine`].

use tracing::debug;

use crate::ast::{
    BinaryOp, Block, Expr, HandlerDecl, ParamMode, RoutineSource, SetTarget, SqlStatement,
    StatementKind, Stmt, VarRef,
};
use crate::builder::{Label, RoutineBuilder};
use crate::condition::{is_valid_sqlstate, ConditionClass, ConditionValue, HandlerKind, HandlerSpec};
use crate::error::{Error, ErrorCode, Result};
use crate::instr::{Instr, Statement, TargetField, UNRESOLVED};
use crate::pcontext::{LabelInfo, LabelKind, ParseContext, ScopeId, ScopeKind};
use crate::routine::{Routine, RoutineDefinition, RoutineFlags};
use crate::types::{RoutineKind, Value};

/// Compile a parsed routine
///
/// `version` is the shared routine version observed before the definition
/// was loaded; `level` is the recursion depth the instance is built for.
pub fn compile(def: &RoutineDefinition, source: &RoutineSource, version: u64, level: u32) -> Result<Routine> {
    if source.kind != def.kind || source.name.normalized() != def.name.normalized() {
        return Err(Error::with_message(
            ErrorCode::CorruptDefinition,
            format!("Parsed body does not match {} {}", def.kind, def.name),
        ));
    }
    if def.kind == RoutineKind::Function && source.returns.is_none() {
        return Err(Error::with_message(
            ErrorCode::CorruptDefinition,
            format!("FUNCTION {} has no return type", def.name),
        ));
    }

    let mut compiler = Compiler {
        kind: def.kind,
        builder: RoutineBuilder::new(),
        pctx: ParseContext::new(),
        flags: RoutineFlags::empty(),
    };
    for param in &source.params {
        if def.kind == RoutineKind::Function && param.mode != ParamMode::In {
            return Err(Error::with_message(
                ErrorCode::NotAllowed,
                format!("FUNCTION parameter {} must be IN", param.name),
            ));
        }
        compiler
            .pctx
            .declare_var(&param.name, param.field.clone(), Some(param.mode))?;
    }
    compiler.stmt(&source.body)?;

    if def.kind == RoutineKind::Function && !compiler.flags.contains(RoutineFlags::HAS_RETURN) {
        return Err(Error::with_message(
            ErrorCode::NotAllowed,
            format!("No RETURN found in FUNCTION {}", def.name),
        ));
    }

    let Compiler { builder, pctx, flags, .. } = compiler;
    let instrs = builder.build()?;
    debug!(
        routine = %def.name,
        kind = %def.kind,
        instructions = instrs.len(),
        level,
        "compiled routine"
    );
    Ok(Routine {
        definition: def.clone(),
        params: source.params.clone(),
        returns: source.returns.clone(),
        instrs,
        flags,
        variables: pctx.variables().to_vec(),
        case_count: pctx.case_count(),
        version,
        level,
    })
}

struct Compiler {
    kind: RoutineKind,
    builder: RoutineBuilder,
    pctx: ParseContext,
    flags: RoutineFlags,
}

impl Compiler {
    fn stmts(&mut self, stmts: &[Stmt]) -> Result<()> {
        for stmt in stmts {
            self.stmt(stmt)?;
        }
        Ok(())
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<()> {
        match stmt {
            Stmt::Block(block) => self.block(block),
            Stmt::Set { target, value } => {
                let target = self.target(target)?;
                let value = self.expr(value)?;
                self.builder.append(Instr::Set { target, value });
                Ok(())
            }
            Stmt::If { branches, else_body } => self.branches(None, branches, else_body.as_deref()),
            Stmt::Case {
                operand,
                whens,
                else_body,
            } => self.branches(Some(operand.as_ref()), whens, else_body.as_deref()),
            Stmt::While { label, cond, body } => {
                let start = self.builder.new_label();
                let end = self.builder.new_label();
                self.builder.resolve_here(start)?;
                self.enter_loop(label.as_deref(), start, end)?;
                self.jump_if_not(cond, end, end)?;
                self.stmts(body)?;
                self.builder.append_jump(start);
                self.leave_loop(label.as_deref());
                self.builder.resolve_here(end)
            }
            Stmt::Repeat { label, body, until } => {
                let start = self.builder.new_label();
                let end = self.builder.new_label();
                self.builder.resolve_here(start)?;
                self.enter_loop(label.as_deref(), start, end)?;
                self.stmts(body)?;
                self.jump_if_not(until, start, end)?;
                self.leave_loop(label.as_deref());
                self.builder.resolve_here(end)
            }
            Stmt::Loop { label, body } => {
                let start = self.builder.new_label();
                let end = self.builder.new_label();
                self.builder.resolve_here(start)?;
                self.enter_loop(label.as_deref(), start, end)?;
                self.stmts(body)?;
                self.builder.append_jump(start);
                self.leave_loop(label.as_deref());
                self.builder.resolve_here(end)
            }
            Stmt::Leave(name) => {
                let info = self.pctx.find_label(name).cloned().ok_or_else(|| {
                    Error::with_message(
                        ErrorCode::MalformedControlFlow,
                        format!("LEAVE with no matching label: {}", name),
                    )
                })?;
                self.unwind_to(info.outer_scope);
                self.builder.append_jump(info.leave);
                Ok(())
            }
            Stmt::Iterate(name) => {
                let info = self.pctx.find_label(name).cloned();
                let (outer, iterate) = match info {
                    Some(LabelInfo {
                        kind: LabelKind::Loop,
                        outer_scope,
                        iterate: Some(iterate),
                        ..
                    }) => (outer_scope, iterate),
                    _ => {
                        return Err(Error::with_message(
                            ErrorCode::MalformedControlFlow,
                            format!("ITERATE with no matching label: {}", name),
                        ))
                    }
                };
                self.unwind_to(outer);
                self.builder.append_jump(iterate);
                Ok(())
            }
            Stmt::Return(value) => {
                if self.kind != RoutineKind::Function {
                    return Err(Error::with_message(
                        ErrorCode::NotAllowed,
                        "RETURN is only allowed in a FUNCTION",
                    ));
                }
                let value = self.expr(value)?;
                self.builder.append(Instr::FReturn { value });
                self.flags |= RoutineFlags::HAS_RETURN;
                Ok(())
            }
            Stmt::Open(name) => {
                let cursor = self.cursor(name)?;
                self.builder.append(Instr::COpen {
                    cursor,
                    name: name.clone(),
                });
                Ok(())
            }
            Stmt::Fetch { cursor, into } => {
                let index = self.cursor(cursor)?;
                let into = into.iter().map(|v| self.var(v)).collect::<Result<Vec<_>>>()?;
                self.builder.append(Instr::CFetch {
                    cursor: index,
                    name: cursor.clone(),
                    into,
                });
                Ok(())
            }
            Stmt::Close(name) => {
                let cursor = self.cursor(name)?;
                self.builder.append(Instr::CClose {
                    cursor,
                    name: name.clone(),
                });
                Ok(())
            }
            Stmt::Signal { condition, message } => {
                let sqlstate = match self.condition(condition)? {
                    ConditionValue::SqlState(s) => s,
                    other => {
                        return Err(Error::with_message(
                            ErrorCode::NotAllowed,
                            format!("SIGNAL requires a SQLSTATE condition, got {}", other),
                        ))
                    }
                };
                self.builder
                    .append(Instr::Error(Error::signal(sqlstate, message.clone())));
                self.flags |= RoutineFlags::HAS_SIGNAL;
                Ok(())
            }
            Stmt::Sql(sql) => {
                let sql = self.sql(sql)?;
                self.builder.append(Instr::Stmt(Statement::Sql(sql)));
                Ok(())
            }
            Stmt::Call { name, args } => {
                let args = args.iter().map(|a| self.expr(a)).collect::<Result<Vec<_>>>()?;
                self.builder.append(Instr::Stmt(Statement::Call {
                    name: name.clone(),
                    args,
                }));
                Ok(())
            }
        }
    }

    // ========================================================================
    // Blocks and Handlers
    // ========================================================================

    fn block(&mut self, block: &Block) -> Result<()> {
        let leave = self.builder.new_label();
        if let Some(name) = &block.label {
            self.pctx.push_label(LabelInfo {
                name: name.clone(),
                kind: LabelKind::Block,
                outer_scope: self.pctx.current(),
                leave,
                iterate: None,
            })?;
        }
        let scope = self.pctx.push_scope(ScopeKind::Regular);

        for decl in &block.vars {
            let default = match &decl.default {
                Some(expr) => self.expr(expr)?,
                None => Expr::Literal(Value::Null),
            };
            for name in &decl.names {
                let slot = self.pctx.declare_var(name, decl.field.clone(), None)?;
                self.builder.append(Instr::Set {
                    target: SetTarget::Local(VarRef {
                        name: name.clone(),
                        slot: Some(slot),
                    }),
                    value: default.clone(),
                });
            }
        }
        for (name, value) in &block.conditions {
            let value = match value {
                ConditionValue::SqlState(_) | ConditionValue::ErrorNumber(_) => self.condition(value)?,
                other => {
                    return Err(Error::with_message(
                        ErrorCode::NotAllowed,
                        format!("Condition {} must name a SQLSTATE or error code, got {}", name, other),
                    ))
                }
            };
            self.pctx.declare_condition(name, value)?;
        }
        for decl in &block.cursors {
            let cursor = self.pctx.declare_cursor(&decl.name)?;
            let query = self.bind_params(&decl.query)?;
            self.builder.append(Instr::CPush {
                cursor,
                name: decl.name.clone(),
                query,
            });
        }
        for handler in &block.handlers {
            self.handler(handler, scope, leave)?;
        }

        self.stmts(&block.body)?;

        let handlers = self.pctx.handlers_in(scope);
        if handlers > 0 {
            self.builder.append(Instr::HPop { count: handlers });
        }
        let cursors = self.pctx.cursors_in(scope);
        if cursors > 0 {
            self.builder.append(Instr::CPop { count: cursors });
        }
        self.pctx.pop_scope();
        if block.label.is_some() {
            self.pctx.pop_label();
        }
        self.builder.resolve_here(leave)
    }

    fn handler(&mut self, decl: &HandlerDecl, scope: ScopeId, block_end: Label) -> Result<()> {
        let conditions = decl
            .conditions
            .iter()
            .map(|c| self.condition(c))
            .collect::<Result<Vec<_>>>()?;
        self.pctx.add_handler(&conditions)?;

        let spec = HandlerSpec {
            kind: decl.kind,
            conditions,
            var_frame: self.pctx.var_count(),
            scope,
            handler_base: self.pctx.handler_depth(scope),
            cursor_base: self.pctx.cursor_depth(scope),
        };
        let push = self.builder.append(Instr::HPushJump {
            dest: UNRESOLVED,
            body: UNRESOLVED,
            handler: spec,
        });
        let after = self.builder.new_label();
        self.builder.request_backpatch(push, after, TargetField::Dest);
        let body_ip = self.builder.next_ip();
        if let Some(Instr::HPushJump { body, .. }) = self.builder.instr_mut(push) {
            *body = body_ip;
        }

        self.pctx.push_scope(ScopeKind::HandlerBody);
        self.stmt(&decl.body)?;
        self.pctx.pop_scope();

        match decl.kind {
            HandlerKind::Continue => {
                self.builder.append(Instr::HReturn {
                    kind: HandlerKind::Continue,
                    dest: 0,
                    handler_depth: 0,
                    cursor_depth: 0,
                });
            }
            HandlerKind::Exit => {
                let outer = self.pctx.parent(scope).unwrap_or(scope);
                let ip = self.builder.append(Instr::HReturn {
                    kind: HandlerKind::Exit,
                    dest: UNRESOLVED,
                    handler_depth: self.pctx.handler_depth(outer),
                    cursor_depth: self.pctx.cursor_depth(outer),
                });
                self.builder.request_backpatch(ip, block_end, TargetField::Dest);
            }
        }
        self.builder.resolve_here(after)
    }

    /// Emit the pops needed to leave every scope nested inside `target`
    fn unwind_to(&mut self, target: ScopeId) {
        let current = self.pctx.current();
        let handlers = self.pctx.handler_depth(current) - self.pctx.handler_depth(target);
        if handlers > 0 {
            self.builder.append(Instr::HPop { count: handlers });
        }
        let cursors = self.pctx.cursor_depth(current) - self.pctx.cursor_depth(target);
        if cursors > 0 {
            self.builder.append(Instr::CPop { count: cursors });
        }
    }

    // ========================================================================
    // Control Flow
    // ========================================================================

    fn jump_if_not(&mut self, cond: &Expr, dest: Label, cont: Label) -> Result<()> {
        let cond = self.expr(cond)?;
        let ip = self.builder.append(Instr::JumpIfNot {
            cond,
            dest: UNRESOLVED,
            cont: UNRESOLVED,
        });
        self.builder.request_backpatch(ip, dest, TargetField::Dest);
        self.builder.request_backpatch(ip, cont, TargetField::Cont);
        Ok(())
    }

    /// IF and CASE; `operand` is `Some` for CASE, holding the simple CASE operand
    fn branches(
        &mut self,
        operand: Option<Option<&Expr>>,
        branches: &[(Expr, Vec<Stmt>)],
        else_body: Option<&[Stmt]>,
    ) -> Result<()> {
        let end = self.builder.new_label();
        let case_id = match operand {
            Some(Some(value)) => {
                let id = self.pctx.next_case_id();
                let value = self.expr(value)?;
                let ip = self.builder.append(Instr::SetCaseExpr {
                    case_id: id,
                    value,
                    cont: UNRESOLVED,
                });
                self.builder.request_backpatch(ip, end, TargetField::Cont);
                Some(id)
            }
            _ => None,
        };

        for (cond, body) in branches {
            let next = self.builder.new_label();
            let cond = match case_id {
                Some(id) => Expr::binary(BinaryOp::Eq, Expr::CaseValue(id), cond.clone()),
                None => cond.clone(),
            };
            self.jump_if_not(&cond, next, end)?;
            self.stmts(body)?;
            self.builder.append_jump(end);
            self.builder.resolve_here(next)?;
        }

        match else_body {
            Some(body) => self.stmts(body)?,
            None if operand.is_some() => {
                self.builder.append(Instr::Error(Error::new(ErrorCode::CaseNotFound)));
            }
            None => {}
        }
        self.builder.resolve_here(end)
    }

    fn enter_loop(&mut self, label: Option<&str>, start: Label, end: Label) -> Result<()> {
        if let Some(name) = label {
            let leave = self.builder.new_label();
            self.builder.alias(leave, end)?;
            self.pctx.push_label(LabelInfo {
                name: name.to_string(),
                kind: LabelKind::Loop,
                outer_scope: self.pctx.current(),
                leave,
                iterate: Some(start),
            })?;
        }
        Ok(())
    }

    fn leave_loop(&mut self, label: Option<&str>) {
        if label.is_some() {
            self.pctx.pop_label();
        }
    }

    // ========================================================================
    // Name Resolution
    // ========================================================================

    fn var(&self, name: &str) -> Result<VarRef> {
        let var = self.pctx.find_var(name).ok_or_else(|| {
            Error::with_message(ErrorCode::Undeclared, format!("Undeclared variable: {}", name))
        })?;
        Ok(VarRef {
            name: var.name.clone(),
            slot: Some(var.slot),
        })
    }

    fn target(&self, target: &SetTarget) -> Result<SetTarget> {
        match target {
            SetTarget::Local(v) => Ok(SetTarget::Local(self.var(&v.name)?)),
            SetTarget::User(name) => Ok(SetTarget::User(name.clone())),
        }
    }

    fn cursor(&self, name: &str) -> Result<usize> {
        self.pctx.find_cursor(name).ok_or_else(|| {
            Error::with_message(ErrorCode::Undeclared, format!("Undefined CURSOR: {}", name))
        })
    }

    fn condition(&self, value: &ConditionValue) -> Result<ConditionValue> {
        match value {
            ConditionValue::Named(name) => self.pctx.find_condition(name).cloned().ok_or_else(|| {
                Error::with_message(ErrorCode::Undeclared, format!("Undefined CONDITION: {}", name))
            }),
            ConditionValue::SqlState(s)
                if !is_valid_sqlstate(s) || ConditionClass::of(s) == ConditionClass::Success =>
            {
                Err(Error::with_message(
                    ErrorCode::NotAllowed,
                    format!("Bad SQLSTATE: '{}'", s),
                ))
            }
            other => Ok(other.clone()),
        }
    }

    fn expr(&self, expr: &Expr) -> Result<Expr> {
        Ok(match expr {
            Expr::Var(v) => Expr::Var(self.var(&v.name)?),
            Expr::Unary(op, e) => Expr::Unary(*op, Box::new(self.expr(e)?)),
            Expr::Binary(op, l, r) => Expr::Binary(*op, Box::new(self.expr(l)?), Box::new(self.expr(r)?)),
            Expr::IsNull(e) => Expr::IsNull(Box::new(self.expr(e)?)),
            Expr::Call { name, args } => Expr::Call {
                name: name.clone(),
                args: args.iter().map(|a| self.expr(a)).collect::<Result<Vec<_>>>()?,
            },
            other => other.clone(),
        })
    }

    fn sql(&mut self, sql: &SqlStatement) -> Result<SqlStatement> {
        let restricted = match sql.kind {
            StatementKind::Dynamic => {
                self.flags |= RoutineFlags::CONTAINS_DYNAMIC_SQL;
                Some("Dynamic SQL is not allowed in stored function")
            }
            StatementKind::Transaction => {
                self.flags |= RoutineFlags::HAS_COMMIT_OR_ROLLBACK;
                Some("Explicit or implicit commit is not allowed in stored function")
            }
            StatementKind::Query => {
                self.flags |= RoutineFlags::MULTI_RESULTS;
                Some("Not allowed to return a result set from a function")
            }
            StatementKind::Dml | StatementKind::Other => None,
        };
        if let (RoutineKind::Function, Some(message)) = (self.kind, restricted) {
            return Err(Error::with_message(ErrorCode::NotAllowed, message));
        }
        self.bind_params(sql)
    }

    fn bind_params(&self, sql: &SqlStatement) -> Result<SqlStatement> {
        Ok(SqlStatement {
            text: sql.text.clone(),
            kind: sql.kind,
            params: sql.params.iter().map(|p| self.expr(p)).collect::<Result<Vec<_>>>()?,
        })
    }
}
