//! Call protocol and interpreter loop

use std::ops::{Deref, DerefMut};
use std::rc::Rc;
use std::sync::atomic::Ordering;

use tracing::{debug, trace, warn};

use crate::ast::{Expr, SetTarget, SqlStatement, VarRef};
use crate::cache::{CacheKey, InstanceHandle};
use crate::compile::compile;
use crate::condition::HandlerKind;
use crate::error::{Error, ErrorCode, Result};
use crate::exec::cursor::Cursor;
use crate::exec::rcontext::RuntimeContext;
use crate::host::Host;
use crate::instr::{Instr, Ip, Statement};
use crate::routine::{Routine, Security};
use crate::session::{FrameId, Session, SessionState};
use crate::types::{QualifiedName, RoutineKind, Value};

// ============================================================================
// Call Guard
// ============================================================================

/// Scope of one routine call
///
/// Created once the routine instance is marked invoked. Dropping it pops the
/// call's frame and arena, restores the session state and releases the
/// instance, on every exit path.
struct CallGuard<'a, H: Host> {
    session: &'a mut Session<H>,
    handle: InstanceHandle,
    saved: SessionState,
    frames: usize,
    arenas: usize,
}

impl<'a, H: Host> CallGuard<'a, H> {
    fn new(session: &'a mut Session<H>, handle: InstanceHandle) -> Self {
        CallGuard {
            saved: session.state.clone(),
            frames: session.frames.len(),
            arenas: session.arenas.depth(),
            handle,
            session,
        }
    }

    /// Push the callee's arena and frame and switch to its ambient state
    fn enter(&mut self, routine: &Rc<Routine>) -> FrameId {
        self.session.arenas.push();
        self.session.frames.push(RuntimeContext::new(Rc::clone(routine)));
        let state = &mut self.session.state;
        state.database = Some(routine.name().db.clone());
        state.sql_mode = routine.sql_mode();
        if routine.security() == Security::Definer {
            state.user = routine.definer().to_string();
        }
        FrameId(self.session.frames.len() - 1)
    }
}

impl<H: Host> Deref for CallGuard<'_, H> {
    type Target = Session<H>;

    fn deref(&self) -> &Session<H> {
        self.session
    }
}

impl<H: Host> DerefMut for CallGuard<'_, H> {
    fn deref_mut(&mut self) -> &mut Session<H> {
        self.session
    }
}

impl<H: Host> Drop for CallGuard<'_, H> {
    fn drop(&mut self) {
        self.session.frames.truncate(self.frames);
        self.session.arenas.truncate(self.arenas);
        self.session.state = self.saved.clone();
        self.session.cache.release(self.handle);
    }
}

/// Run a host operation, re-parsing the statement and retrying once if its
/// metadata went stale
fn with_reparse<H: Host, T>(
    host: &mut H,
    stmt: &SqlStatement,
    mut run: impl FnMut(&mut H, &SqlStatement) -> Result<T>,
) -> Result<T> {
    match run(host, stmt) {
        Err(err) if err.code == ErrorCode::StaleMetadata => {
            debug!(statement = %stmt.text, "re-parsing stale statement");
            let fresh = host.reparse_statement(stmt)?;
            let fresh = SqlStatement {
                params: stmt.params.clone(),
                ..fresh
            };
            run(host, &fresh)
        }
        other => other,
    }
}

impl<H: Host> Session<H> {
    // ========================================================================
    // Instances
    // ========================================================================

    /// Find or compile an instance of the routine that no call is running,
    /// and mark it invoked
    fn acquire_instance(&mut self, kind: RoutineKind, name: &QualifiedName) -> Result<(InstanceHandle, Rc<Routine>)> {
        let key = CacheKey::new(kind, name);
        let version = self.ctx.version();
        self.cache.flush_obsolete(&key, version);

        let head = match self.cache.lookup(&key) {
            Some(head) => head,
            None => {
                let def = self.host.load_definition(name, kind)?.ok_or_else(|| {
                    Error::with_message(ErrorCode::NoSuchRoutine, format!("{} {} does not exist", kind, name))
                })?;
                let source = self.host.parse_routine(&def)?;
                let routine = compile(&def, &source, version, 0)?;
                self.cache.insert(key.clone(), Rc::new(routine))
            }
        };

        let max = self.ctx.max_recursion_depth();
        let handle = match self.cache.idle_instance(head) {
            Some(handle) => handle,
            None => {
                let head_routine = self.cache.routine(head).ok_or_else(|| lost_instance(&key))?;
                let level = self.cache.last_level(head).unwrap_or(0) + 1;
                if level > max {
                    return Err(recursion_limit(max, name));
                }
                let def = head_routine.definition().clone();
                let source = self.host.parse_routine(&def)?;
                let routine = compile(&def, &source, head_routine.version(), level)?;
                debug!(routine = %key, level, "compiled recursion instance");
                self.cache
                    .append_instance(head, Rc::new(routine))
                    .ok_or_else(|| lost_instance(&key))?
            }
        };
        let routine = self.cache.routine(handle).ok_or_else(|| lost_instance(&key))?;
        // The limit may have been lowered since deeper instances were built
        if routine.level() > max {
            return Err(recursion_limit(max, name));
        }
        self.cache.mark_invoked(handle);
        Ok((handle, routine))
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Call a stored function from `caller`'s frame
    pub(crate) fn invoke_function(&mut self, caller: Option<FrameId>, name: &QualifiedName, args: &[Expr]) -> Result<Value> {
        let name = self.resolve_name(name)?;

        // Arguments are evaluated in the caller's context before an instance
        // is held; f(f(x)) is not recursion
        let mark = self.arenas.current().mark();
        for arg in args {
            let value = self.eval(caller, arg)?;
            self.arenas.current_mut().alloc(value);
        }
        let values = self.arenas.current().since(mark).to_vec();
        self.arenas.current_mut().reclaim(mark);

        let (handle, routine) = self.acquire_instance(RoutineKind::Function, &name)?;
        let mut call = CallGuard::new(self, handle);
        check_arity(&routine, values.len())?;

        let frame = call.enter(&routine);
        for (slot, value) in values.into_iter().enumerate() {
            call.context_mut(frame)?.set(slot, value)?;
        }
        call.execute(frame)?;
        let value = call.context_mut(frame)?.take_return_value();
        value.ok_or_else(|| {
            Error::with_message(ErrorCode::NoReturn, format!("FUNCTION {} ended without RETURN", routine.name()))
        })
    }

    /// Call a stored procedure from `caller`'s frame
    pub(crate) fn invoke_procedure(&mut self, caller: Option<FrameId>, name: &QualifiedName, args: &[Expr]) -> Result<()> {
        let name = self.resolve_name(name)?;
        let (handle, routine) = self.acquire_instance(RoutineKind::Procedure, &name)?;
        let mut call = CallGuard::new(self, handle);
        check_arity(&routine, args.len())?;

        let mut values = Vec::with_capacity(args.len());
        for (index, (param, arg)) in routine.params().iter().zip(args).enumerate() {
            if param.mode.is_out() && !is_assignable(arg, caller) {
                return Err(Error::with_message(
                    ErrorCode::NotAssignable,
                    format!("OUT or INOUT argument {} for routine {} is not a variable", index + 1, routine.name()),
                ));
            }
            let value = if param.mode.is_in() {
                call.eval(caller, arg)?
            } else {
                Value::Null
            };
            values.push(value);
        }

        let frame = call.enter(&routine);
        for (slot, value) in values.into_iter().enumerate() {
            call.context_mut(frame)?.set(slot, value)?;
        }
        call.execute(frame)?;

        for (slot, (param, arg)) in routine.params().iter().zip(args).enumerate() {
            if !param.mode.is_out() {
                continue;
            }
            let value = call.context_ref(frame)?.get(slot)?.clone();
            match (arg, caller) {
                (Expr::Var(VarRef { slot: Some(target), .. }), Some(caller)) => {
                    call.context_mut(caller)?.set(*target, value)?;
                }
                (Expr::UserVar(var), _) => call.set_user_var(var, value),
                _ => {}
            }
        }
        Ok(())
    }

    // ========================================================================
    // Interpreter
    // ========================================================================

    /// Run the routine of `frame` from its first instruction
    fn execute(&mut self, frame: FrameId) -> Result<()> {
        let routine = Rc::clone(self.context_ref(frame)?.routine());
        let mut ip: Ip = 0;
        loop {
            if self.killed.load(Ordering::Acquire) {
                warn!(routine = %routine.name(), ip, "call interrupted");
                return Err(Error::new(ErrorCode::Interrupted));
            }
            let Some(instr) = routine.instrs().get(ip) else {
                return Ok(());
            };
            trace!(routine = %routine.name(), level = routine.level(), ip, instr = %instr, "exec");

            let mark = self.arenas.current().mark();
            let result = self.exec_instr(frame, ip, instr);
            self.arenas.current_mut().reclaim(mark);

            let next = match result {
                Ok(Some(next)) => next,
                Ok(None) => return Ok(()),
                Err(err) => self.raise(frame, err, instr.continuation(ip))?,
            };
            ip = self.dispatch_warnings(frame, next)?;
        }
    }

    /// Execute one instruction; `None` ends the routine
    fn exec_instr(&mut self, frame: FrameId, ip: Ip, instr: &Instr) -> Result<Option<Ip>> {
        match instr {
            Instr::Stmt(Statement::Sql(sql)) => self.run_statement(frame, sql)?,
            Instr::Stmt(Statement::Call { name, args }) => self.invoke_procedure(Some(frame), name, args)?,
            Instr::Set { target, value } => {
                let value = self.eval(Some(frame), value)?;
                self.assign(frame, target, value)?;
            }
            Instr::SetCaseExpr { case_id, value, .. } => {
                let value = self.eval(Some(frame), value)?;
                self.context_mut(frame)?.set_case_value(*case_id, value)?;
            }
            Instr::Jump { dest } => return Ok(Some(*dest)),
            Instr::JumpIfNot { cond, dest, .. } => {
                if !self.eval(Some(frame), cond)?.is_true() {
                    return Ok(Some(*dest));
                }
            }
            Instr::FReturn { value } => {
                let value = self.eval(Some(frame), value)?;
                self.context_mut(frame)?.set_return_value(value)?;
                return Ok(None);
            }
            Instr::HPushJump { dest, body, handler } => {
                self.context_mut(frame)?.push_handler(handler.clone(), *body);
                return Ok(Some(*dest));
            }
            Instr::HPop { count } => self.context_mut(frame)?.pop_handlers(*count),
            Instr::HReturn {
                kind: HandlerKind::Continue,
                ..
            } => return self.context_mut(frame)?.finish_continue().map(Some),
            Instr::HReturn {
                kind: HandlerKind::Exit,
                dest,
                handler_depth,
                cursor_depth,
            } => {
                self.context_mut(frame)?.finish_exit(*handler_depth, *cursor_depth)?;
                return Ok(Some(*dest));
            }
            Instr::CPush { name, query, .. } => {
                self.context_mut(frame)?.push_cursor(Cursor::new(name.clone(), query.clone()));
            }
            Instr::COpen { cursor, .. } => self.open_cursor(frame, *cursor)?,
            Instr::CFetch { cursor, into, .. } => {
                let row = self.context_mut(frame)?.cursor_mut(*cursor)?.fetch(into.len())?;
                for (var, value) in into.iter().zip(row) {
                    self.assign(frame, &SetTarget::Local(var.clone()), value)?;
                }
            }
            Instr::CClose { cursor, .. } => self.context_mut(frame)?.cursor_mut(*cursor)?.close()?,
            Instr::CPop { count } => self.context_mut(frame)?.pop_cursors(*count),
            Instr::Error(err) => return Err(err.clone()),
        }
        Ok(Some(ip + 1))
    }

    /// Offer a raised condition to the frame's handlers
    ///
    /// Returns where execution continues: a handler body, or `resume` for an
    /// unhandled warning. Anything else unhandled ends the call.
    fn raise(&mut self, frame: FrameId, err: Error, resume: Ip) -> Result<Ip> {
        if !err.is_fatal() {
            let ctx = self.context_mut(frame)?;
            if let Some(index) = ctx.find_handler(&err) {
                let body = ctx.activate(index, resume)?;
                // Warnings from the failed instruction are not offered to
                // handlers once its error has been taken
                let pending = ctx.take_warnings();
                debug!(
                    routine = %ctx.routine().name(),
                    sqlstate = %err.sqlstate,
                    handler = index,
                    body,
                    "handler activated"
                );
                self.warnings.extend(pending);
                return Ok(body);
            }
            if err.is_warning() {
                self.warnings.push(err);
                return Ok(resume);
            }
        }
        let ctx = self.context_mut(frame)?;
        let pending = ctx.take_warnings();
        warn!(
            routine = %ctx.routine().name(),
            sqlstate = %err.sqlstate,
            error = %err.message,
            "unhandled condition"
        );
        self.warnings.extend(pending);
        Err(err)
    }

    /// Offer warnings queued by the last instruction to the handlers
    fn dispatch_warnings(&mut self, frame: FrameId, next: Ip) -> Result<Ip> {
        let warnings = self.context_mut(frame)?.take_warnings();
        let mut ip = next;
        for warning in warnings {
            if ip == next {
                ip = self.raise(frame, warning, next)?;
            } else {
                self.warnings.push(warning);
            }
        }
        Ok(ip)
    }

    // ========================================================================
    // Statements and Cursors
    // ========================================================================

    /// Evaluate statement parameters into the current arena; returns the
    /// arena mark they start at
    fn bind_params(&mut self, frame: FrameId, params: &[Expr]) -> Result<usize> {
        let mark = self.arenas.current().mark();
        for param in params {
            let value = self.eval(Some(frame), param)?;
            self.arenas.current_mut().alloc(value);
        }
        Ok(mark)
    }

    fn run_statement(&mut self, frame: FrameId, sql: &SqlStatement) -> Result<()> {
        let mark = self.bind_params(frame, &sql.params)?;
        self.next_statement_id += 1;
        self.state.statement_id = self.next_statement_id;

        let Session { host, arenas, state, .. } = &mut *self;
        let params = arenas.current().since(mark);
        let outcome = with_reparse(host, sql, |host, stmt| host.execute(stmt, params, state))?;
        trace!(statement = %sql.text, rows = outcome.rows_affected, "statement done");

        let ctx = self.context_mut(frame)?;
        for warning in outcome.warnings {
            ctx.push_warning(warning);
        }
        Ok(())
    }

    fn open_cursor(&mut self, frame: FrameId, index: usize) -> Result<()> {
        let query = {
            let cursor = self.context_ref(frame)?.cursor(index)?;
            cursor.check_can_open()?;
            cursor.query().clone()
        };
        let mark = self.bind_params(frame, &query.params)?;

        let Session { host, arenas, state, .. } = &mut *self;
        let params = arenas.current().since(mark);
        let rows = with_reparse(host, &query, |host, stmt| host.open_cursor(stmt, params, state))?;
        self.context_mut(frame)?.cursor_mut(index)?.open(rows)
    }

    /// Assign to a local slot of `frame` or a user variable
    fn assign(&mut self, frame: FrameId, target: &SetTarget, value: Value) -> Result<()> {
        match target {
            SetTarget::Local(VarRef { slot: Some(slot), .. }) => self.context_mut(frame)?.set(*slot, value),
            SetTarget::Local(VarRef { name, slot: None }) => Err(Error::with_message(
                ErrorCode::Internal,
                format!("Variable {} has no slot", name),
            )),
            SetTarget::User(name) => {
                self.set_user_var(name, value);
                Ok(())
            }
        }
    }
}

fn check_arity(routine: &Routine, given: usize) -> Result<()> {
    let expected = routine.params().len();
    if given != expected {
        return Err(Error::with_message(
            ErrorCode::ArgumentCount,
            format!(
                "Incorrect number of arguments for {} {}; expected {}, got {}",
                routine.kind(),
                routine.name(),
                expected,
                given
            ),
        ));
    }
    Ok(())
}

/// OUT and INOUT arguments must name a variable of the caller
fn is_assignable(arg: &Expr, caller: Option<FrameId>) -> bool {
    match arg {
        Expr::Var(VarRef { slot: Some(_), .. }) => caller.is_some(),
        Expr::UserVar(_) => true,
        _ => false,
    }
}

fn recursion_limit(max: u32, name: &QualifiedName) -> Error {
    Error::with_message(
        ErrorCode::RecursionLimit,
        format!(
            "Recursive limit {} (as set by the max_sp_recursion_depth variable) was exceeded for routine {}",
            max, name.name
        ),
    )
}

fn lost_instance(key: &CacheKey) -> Error {
    Error::with_message(ErrorCode::Internal, format!("Cached instance of {} disappeared", key))
}
