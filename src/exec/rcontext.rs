//! Runtime context of one routine call
//!
//! Holds the call's variable slots, the function return value, the values
//! of simple CASE operands, the cursor stack and the handler stack. The
//! stacks mirror the block structure: `hpush_jump`/`cpush` push entries,
//! `hpop`/`cpop` pop them, and an EXIT handler truncates both back to the
//! depths of the block it leaves. While a handler body runs, entries pushed
//! by blocks nested in the declaring block are set aside, so the body sees
//! the stacks it was compiled against.

use std::ops::Range;
use std::rc::Rc;

use crate::condition::{HandlerKind, HandlerSpec};
use crate::error::{Error, ErrorCode, Result};
use crate::exec::cursor::Cursor;
use crate::instr::Ip;
use crate::routine::Routine;
use crate::types::Value;

/// A handler installed by `hpush_jump`
#[derive(Debug, Clone)]
pub struct ActiveHandler {
    pub spec: HandlerSpec,
    /// First instruction of the handler body
    pub body: Ip,
}

/// A handler body currently running
#[derive(Debug)]
struct HandlerCall {
    /// Handler stack entries that must not catch conditions raised inside
    /// this body: the declaring block's handlers
    excluded: Range<usize>,
    kind: HandlerKind,
    resume: Ip,
    var_frame: usize,
    saved: Vec<Value>,
    /// Stack depths the body was compiled against
    handler_base: usize,
    cursor_base: usize,
    /// Entries pushed above those depths when the handler fired, put back
    /// when a CONTINUE body returns
    stashed_handlers: Vec<ActiveHandler>,
    stashed_cursors: Vec<Cursor>,
}

/// Variables, cursors and handlers of one running routine
#[derive(Debug)]
pub struct RuntimeContext {
    routine: Rc<Routine>,
    vars: Vec<Value>,
    return_value: Option<Value>,
    case_values: Vec<Value>,
    cursors: Vec<Cursor>,
    handlers: Vec<ActiveHandler>,
    calls: Vec<HandlerCall>,
    pending_warnings: Vec<Error>,
}

impl RuntimeContext {
    pub fn new(routine: Rc<Routine>) -> Self {
        RuntimeContext {
            vars: vec![Value::Null; routine.frame_size()],
            case_values: vec![Value::Null; routine.case_count],
            routine,
            return_value: None,
            cursors: Vec::new(),
            handlers: Vec::new(),
            calls: Vec::new(),
            pending_warnings: Vec::new(),
        }
    }

    pub fn routine(&self) -> &Rc<Routine> {
        &self.routine
    }

    // ========================================================================
    // Variables
    // ========================================================================

    pub fn vars(&self) -> &[Value] {
        &self.vars
    }

    pub fn get(&self, slot: usize) -> Result<&Value> {
        self.vars.get(slot).ok_or_else(|| bad_slot(slot))
    }

    /// Assign a variable, converting the value to the declared type
    pub fn set(&mut self, slot: usize, value: Value) -> Result<()> {
        let strict = self.routine.sql_mode().is_strict();
        let var = self.routine.variables().get(slot).ok_or_else(|| bad_slot(slot))?;
        let value = var.field.coerce(value, strict)?;
        self.vars[slot] = value;
        Ok(())
    }

    /// Assign without conversion
    pub(crate) fn set_raw(&mut self, slot: usize, value: Value) -> Result<()> {
        let var = self.vars.get_mut(slot).ok_or_else(|| bad_slot(slot))?;
        *var = value;
        Ok(())
    }

    pub fn return_value(&self) -> Option<&Value> {
        self.return_value.as_ref()
    }

    /// Store the function result, converted to the declared return type
    pub fn set_return_value(&mut self, value: Value) -> Result<()> {
        let strict = self.routine.sql_mode().is_strict();
        let value = match self.routine.returns() {
            Some(field) => field.coerce(value, strict)?,
            None => {
                return Err(Error::with_message(
                    ErrorCode::NotAllowed,
                    format!("{} has no return value", self.routine),
                ))
            }
        };
        self.return_value = Some(value);
        Ok(())
    }

    pub fn take_return_value(&mut self) -> Option<Value> {
        self.return_value.take()
    }

    pub fn case_value(&self, id: usize) -> Result<&Value> {
        self.case_values
            .get(id)
            .ok_or_else(|| Error::with_message(ErrorCode::Internal, format!("No CASE operand {}", id)))
    }

    pub fn set_case_value(&mut self, id: usize, value: Value) -> Result<()> {
        let slot = self
            .case_values
            .get_mut(id)
            .ok_or_else(|| Error::with_message(ErrorCode::Internal, format!("No CASE operand {}", id)))?;
        *slot = value;
        Ok(())
    }

    // ========================================================================
    // Cursors
    // ========================================================================

    pub fn cursor_count(&self) -> usize {
        self.cursors.len()
    }

    pub fn push_cursor(&mut self, cursor: Cursor) {
        self.cursors.push(cursor);
    }

    pub fn pop_cursors(&mut self, count: usize) {
        let depth = self.cursors.len().saturating_sub(count);
        self.cursors.truncate(depth);
    }

    pub fn cursor(&self, index: usize) -> Result<&Cursor> {
        self.cursors.get(index).ok_or_else(|| bad_cursor(index))
    }

    pub fn cursor_mut(&mut self, index: usize) -> Result<&mut Cursor> {
        self.cursors.get_mut(index).ok_or_else(|| bad_cursor(index))
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Number of handler bodies currently running
    pub fn active_handler_calls(&self) -> usize {
        self.calls.len()
    }

    pub fn push_handler(&mut self, spec: HandlerSpec, body: Ip) {
        self.handlers.push(ActiveHandler { spec, body });
    }

    pub fn pop_handlers(&mut self, count: usize) {
        let depth = self.handlers.len().saturating_sub(count);
        self.handlers.truncate(depth);
    }

    pub fn handler(&self, index: usize) -> Option<&ActiveHandler> {
        self.handlers.get(index)
    }

    /// Find the handler for a raised condition
    ///
    /// The innermost scope with any matching handler wins; within it the
    /// most specific match (error number, then SQLSTATE, then class) is
    /// chosen. Handlers excluded by a running handler body are skipped.
    pub fn find_handler(&self, err: &Error) -> Option<usize> {
        let mut best: Option<(usize, u8)> = None;
        for index in (0..self.handlers.len()).rev() {
            if self.is_excluded(index) {
                continue;
            }
            let handler = &self.handlers[index];
            if let Some((found, _)) = best {
                if self.handlers[found].spec.scope != handler.spec.scope {
                    break;
                }
            }
            if let Some(priority) = handler.spec.priority(err) {
                if best.map_or(true, |(_, p)| priority > p) {
                    best = Some((index, priority));
                }
            }
        }
        best.map(|(index, _)| index)
    }

    /// Whether a running handler body hides handler `index`
    ///
    /// A body that set entries aside suspends the exclusions of the bodies
    /// below it for the positions it reuses.
    fn is_excluded(&self, index: usize) -> bool {
        let mut floor = usize::MAX;
        for call in self.calls.iter().rev() {
            if index >= call.excluded.start && index < call.excluded.end.min(floor) {
                return true;
            }
            floor = floor.min(call.handler_base);
        }
        false
    }

    /// Start running handler `index`; returns the body's first instruction
    ///
    /// `resume` is where a CONTINUE handler returns to.
    pub fn activate(&mut self, index: usize, resume: Ip) -> Result<Ip> {
        let handler = self
            .handlers
            .get(index)
            .ok_or_else(|| Error::with_message(ErrorCode::Internal, format!("No handler {}", index)))?;
        let scope = handler.spec.scope;
        let mut start = index;
        while start > 0 && self.handlers[start - 1].spec.scope == scope {
            start -= 1;
        }
        let var_frame = handler.spec.var_frame.min(self.vars.len());
        let saved = match handler.spec.kind {
            HandlerKind::Continue => self.vars[var_frame..].to_vec(),
            HandlerKind::Exit => Vec::new(),
        };
        let kind = handler.spec.kind;
        let body = handler.body;
        let handler_base = handler.spec.handler_base.max(index + 1).min(self.handlers.len());
        let cursor_base = handler.spec.cursor_base.min(self.cursors.len());

        // Nested blocks of the declaring block may still hold handlers and
        // cursors; the body runs against the declaring block's stacks
        let stashed_handlers = self.handlers.split_off(handler_base);
        let stashed_cursors = self.cursors.split_off(cursor_base);
        self.calls.push(HandlerCall {
            excluded: start..handler_base,
            kind,
            resume,
            var_frame,
            saved,
            handler_base,
            cursor_base,
            stashed_handlers,
            stashed_cursors,
        });
        Ok(body)
    }

    /// End of a CONTINUE handler body; returns the resumption point
    pub fn finish_continue(&mut self) -> Result<Ip> {
        let call = self.pop_call(HandlerKind::Continue)?;
        self.handlers.truncate(call.handler_base);
        self.handlers.extend(call.stashed_handlers);
        self.cursors.truncate(call.cursor_base);
        self.cursors.extend(call.stashed_cursors);
        for (offset, value) in call.saved.into_iter().enumerate() {
            self.vars[call.var_frame + offset] = value;
        }
        Ok(call.resume)
    }

    /// End of an EXIT handler body: unwind to the given depths
    pub fn finish_exit(&mut self, handler_depth: usize, cursor_depth: usize) -> Result<()> {
        self.pop_call(HandlerKind::Exit)?;
        self.handlers.truncate(handler_depth);
        self.cursors.truncate(cursor_depth);
        // Handler bodies whose handlers were just unwound can never return
        self.calls.retain(|c| c.excluded.start < handler_depth);
        Ok(())
    }

    fn pop_call(&mut self, kind: HandlerKind) -> Result<HandlerCall> {
        match self.calls.pop() {
            Some(call) if call.kind == kind => Ok(call),
            _ => Err(Error::with_message(
                ErrorCode::Internal,
                format!("hreturn {} outside of a {} handler", kind, kind),
            )),
        }
    }

    // ========================================================================
    // Warnings
    // ========================================================================

    /// Queue a completion condition raised while running the current
    /// instruction
    pub fn push_warning(&mut self, warning: Error) {
        self.pending_warnings.push(warning);
    }

    pub fn take_warnings(&mut self) -> Vec<Error> {
        std::mem::take(&mut self.pending_warnings)
    }
}

fn bad_slot(slot: usize) -> Error {
    Error::with_message(ErrorCode::Internal, format!("Variable slot {} out of range", slot))
}

fn bad_cursor(index: usize) -> Error {
    Error::with_message(ErrorCode::Internal, format!("Cursor {} is not declared", index))
}
