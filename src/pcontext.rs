//! Parsing scope
//!
//! Tracks what a routine body declares while it is compiled: local variables
//! and parameters (mapped to frame slots), cursors (mapped to cursor stack
//! positions), handlers, named conditions and statement labels. Scopes nest
//! the way `BEGIN ... END` blocks and handler bodies nest.
//!
//! Every variable gets its own slot, so the frame size is simply the number
//! of variables declared anywhere in the routine.

use crate::ast::ParamMode;
use crate::builder::Label;
use crate::condition::ConditionValue;
use crate::error::{Error, ErrorCode, Result};
use crate::types::FieldDef;

/// Index of a scope within a [`ParseContext`]
pub type ScopeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Regular,
    /// Body of a handler: labels declared outside are not visible
    HandlerBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelKind {
    Block,
    Loop,
}

/// A statement label in scope
#[derive(Debug, Clone)]
pub struct LabelInfo {
    pub name: String,
    pub kind: LabelKind,
    /// Scope whose handlers and cursors stay active after leaving the
    /// labelled statement
    pub outer_scope: ScopeId,
    /// Target of LEAVE
    pub leave: Label,
    /// Target of ITERATE (loops only)
    pub iterate: Option<Label>,
}

/// A declared variable or parameter
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub field: FieldDef,
    pub slot: usize,
    /// Set for routine parameters
    pub mode: Option<ParamMode>,
}

#[derive(Debug, Clone)]
struct Scope {
    parent: Option<ScopeId>,
    kind: ScopeKind,
    vars: Vec<usize>,
    cursors: Vec<String>,
    handler_count: usize,
    handler_conditions: Vec<ConditionValue>,
    conditions: Vec<(String, ConditionValue)>,
    /// Labels below this index are invisible from this scope
    label_floor: usize,
}

/// Declarations of one routine being compiled
#[derive(Debug, Clone)]
pub struct ParseContext {
    scopes: Vec<Scope>,
    current: ScopeId,
    variables: Vec<Variable>,
    labels: Vec<LabelInfo>,
    case_count: usize,
}

impl Default for ParseContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ParseContext {
    pub fn new() -> Self {
        ParseContext {
            scopes: vec![Scope {
                parent: None,
                kind: ScopeKind::Regular,
                vars: Vec::new(),
                cursors: Vec::new(),
                handler_count: 0,
                handler_conditions: Vec::new(),
                conditions: Vec::new(),
                label_floor: 0,
            }],
            current: 0,
            variables: Vec::new(),
            labels: Vec::new(),
            case_count: 0,
        }
    }

    pub fn current(&self) -> ScopeId {
        self.current
    }

    /// Parent of a scope, `None` for the routine's outermost scope
    pub fn parent(&self, scope: ScopeId) -> Option<ScopeId> {
        self.scopes.get(scope).and_then(|s| s.parent)
    }

    /// Open a nested scope and make it current
    pub fn push_scope(&mut self, kind: ScopeKind) -> ScopeId {
        let label_floor = match kind {
            ScopeKind::HandlerBody => self.labels.len(),
            ScopeKind::Regular => self.scopes[self.current].label_floor,
        };
        let id = self.scopes.len();
        self.scopes.push(Scope {
            parent: Some(self.current),
            kind,
            vars: Vec::new(),
            cursors: Vec::new(),
            handler_count: 0,
            handler_conditions: Vec::new(),
            conditions: Vec::new(),
            label_floor,
        });
        self.current = id;
        id
    }

    /// Close the current scope, returning its id
    pub fn pop_scope(&mut self) -> ScopeId {
        let closed = self.current;
        if let Some(parent) = self.scopes[closed].parent {
            self.current = parent;
        }
        closed
    }

    pub fn scope_kind(&self, scope: ScopeId) -> Option<ScopeKind> {
        self.scopes.get(scope).map(|s| s.kind)
    }

    fn chain(&self, scope: ScopeId) -> impl Iterator<Item = &Scope> {
        let mut next = self.scopes.get(scope);
        std::iter::from_fn(move || {
            let scope = next?;
            next = scope.parent.and_then(|p| self.scopes.get(p));
            Some(scope)
        })
    }

    // ========================================================================
    // Variables
    // ========================================================================

    /// Declare a variable in the current scope, returning its slot
    pub fn declare_var(&mut self, name: &str, field: FieldDef, mode: Option<ParamMode>) -> Result<usize> {
        let scope = &self.scopes[self.current];
        if scope
            .vars
            .iter()
            .any(|&slot| self.variables[slot].name.eq_ignore_ascii_case(name))
        {
            return Err(Error::with_message(
                ErrorCode::Duplicate,
                format!("Duplicate variable: {}", name),
            ));
        }
        let slot = self.variables.len();
        self.variables.push(Variable {
            name: name.to_string(),
            field,
            slot,
            mode,
        });
        self.scopes[self.current].vars.push(slot);
        Ok(slot)
    }

    /// Innermost visible variable with this name
    pub fn find_var(&self, name: &str) -> Option<&Variable> {
        self.chain(self.current).find_map(|scope| {
            scope
                .vars
                .iter()
                .rev()
                .map(|&slot| &self.variables[slot])
                .find(|v| v.name.eq_ignore_ascii_case(name))
        })
    }

    /// All variables, indexed by slot
    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    /// Number of slots declared so far
    pub fn var_count(&self) -> usize {
        self.variables.len()
    }

    // ========================================================================
    // Cursors and Handlers
    // ========================================================================

    /// Declare a cursor, returning its cursor stack position
    pub fn declare_cursor(&mut self, name: &str) -> Result<usize> {
        if self.scopes[self.current]
            .cursors
            .iter()
            .any(|c| c.eq_ignore_ascii_case(name))
        {
            return Err(Error::with_message(
                ErrorCode::Duplicate,
                format!("Duplicate cursor: {}", name),
            ));
        }
        let index = self.cursor_depth(self.current);
        self.scopes[self.current].cursors.push(name.to_string());
        Ok(index)
    }

    /// Cursor stack position of the innermost visible cursor with this name
    pub fn find_cursor(&self, name: &str) -> Option<usize> {
        let mut depth = self.cursor_depth(self.current);
        for scope in self.chain(self.current) {
            let base = depth - scope.cursors.len();
            if let Some(pos) = scope.cursors.iter().rposition(|c| c.eq_ignore_ascii_case(name)) {
                return Some(base + pos);
            }
            depth = base;
        }
        None
    }

    /// Cursors visible from `scope`, including its ancestors'
    pub fn cursor_depth(&self, scope: ScopeId) -> usize {
        self.chain(scope).map(|s| s.cursors.len()).sum()
    }

    /// Cursors declared directly in `scope`
    pub fn cursors_in(&self, scope: ScopeId) -> usize {
        self.scopes.get(scope).map(|s| s.cursors.len()).unwrap_or(0)
    }

    /// Register a handler for `conditions` in the current scope
    pub fn add_handler(&mut self, conditions: &[ConditionValue]) -> Result<()> {
        let scope = &mut self.scopes[self.current];
        for cond in conditions {
            if scope.handler_conditions.contains(cond) {
                return Err(Error::with_message(
                    ErrorCode::Duplicate,
                    format!("Duplicate handler declared in the same block: {}", cond),
                ));
            }
        }
        scope.handler_conditions.extend(conditions.iter().cloned());
        scope.handler_count += 1;
        Ok(())
    }

    /// Handlers active in `scope`, including its ancestors'
    pub fn handler_depth(&self, scope: ScopeId) -> usize {
        self.chain(scope).map(|s| s.handler_count).sum()
    }

    /// Handlers declared directly in `scope`
    pub fn handlers_in(&self, scope: ScopeId) -> usize {
        self.scopes.get(scope).map(|s| s.handler_count).unwrap_or(0)
    }

    // ========================================================================
    // Named Conditions
    // ========================================================================

    pub fn declare_condition(&mut self, name: &str, value: ConditionValue) -> Result<()> {
        let scope = &mut self.scopes[self.current];
        if scope.conditions.iter().any(|(n, _)| n.eq_ignore_ascii_case(name)) {
            return Err(Error::with_message(
                ErrorCode::Duplicate,
                format!("Duplicate condition: {}", name),
            ));
        }
        scope.conditions.push((name.to_string(), value));
        Ok(())
    }

    pub fn find_condition(&self, name: &str) -> Option<&ConditionValue> {
        self.chain(self.current).find_map(|scope| {
            scope
                .conditions
                .iter()
                .rev()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v)
        })
    }

    // ========================================================================
    // Labels
    // ========================================================================

    /// Make a label visible; fails if one with the same name already is
    pub fn push_label(&mut self, info: LabelInfo) -> Result<()> {
        if self.find_label(&info.name).is_some() {
            return Err(Error::with_message(
                ErrorCode::Duplicate,
                format!("Redefining label {}", info.name),
            ));
        }
        self.labels.push(info);
        Ok(())
    }

    pub fn pop_label(&mut self) -> Option<LabelInfo> {
        self.labels.pop()
    }

    /// Innermost visible label with this name
    pub fn find_label(&self, name: &str) -> Option<&LabelInfo> {
        let floor = self.scopes[self.current].label_floor;
        self.labels[floor..]
            .iter()
            .rev()
            .find(|l| l.name.eq_ignore_ascii_case(name))
    }

    /// Allocate a slot for a simple CASE operand
    pub fn next_case_id(&mut self) -> usize {
        let id = self.case_count;
        self.case_count += 1;
        id
    }

    pub fn case_count(&self) -> usize {
        self.case_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::RoutineBuilder;
    use crate::types::SqlType;

    fn int() -> FieldDef {
        FieldDef::new(SqlType::Int)
    }

    #[test]
    fn test_variable_slots_and_shadowing() {
        let mut ctx = ParseContext::new();
        assert_eq!(ctx.declare_var("x", int(), Some(ParamMode::In)).unwrap(), 0);
        ctx.push_scope(ScopeKind::Regular);
        assert_eq!(ctx.declare_var("y", int(), None).unwrap(), 1);
        assert_eq!(ctx.declare_var("X", int(), None).unwrap(), 2);
        assert_eq!(ctx.find_var("x").unwrap().slot, 2);
        assert!(ctx.declare_var("y", int(), None).is_err());
        ctx.pop_scope();
        assert_eq!(ctx.find_var("x").unwrap().slot, 0);
        assert!(ctx.find_var("y").is_none());
        assert_eq!(ctx.var_count(), 3);
    }

    #[test]
    fn test_cursor_positions() {
        let mut ctx = ParseContext::new();
        assert_eq!(ctx.declare_cursor("a").unwrap(), 0);
        let inner = ctx.push_scope(ScopeKind::Regular);
        assert_eq!(ctx.declare_cursor("b").unwrap(), 1);
        assert_eq!(ctx.declare_cursor("c").unwrap(), 2);
        assert_eq!(ctx.find_cursor("a"), Some(0));
        assert_eq!(ctx.find_cursor("c"), Some(2));
        assert_eq!(ctx.cursor_depth(inner), 3);
        assert_eq!(ctx.cursors_in(inner), 2);
        ctx.pop_scope();
        assert_eq!(ctx.find_cursor("b"), None);
    }

    #[test]
    fn test_handler_depths() {
        let mut ctx = ParseContext::new();
        let outer = ctx.push_scope(ScopeKind::Regular);
        ctx.add_handler(&[ConditionValue::NotFound]).unwrap();
        let inner = ctx.push_scope(ScopeKind::Regular);
        ctx.add_handler(&[ConditionValue::Exception]).unwrap();
        ctx.add_handler(&[ConditionValue::Warning]).unwrap();
        assert!(ctx.add_handler(&[ConditionValue::Warning]).is_err());
        assert_eq!(ctx.handlers_in(inner), 2);
        assert_eq!(ctx.handler_depth(inner), 3);
        assert_eq!(ctx.handler_depth(outer), 1);
    }

    #[test]
    fn test_labels_hidden_in_handler_body() {
        let mut b = RoutineBuilder::new();
        let mut ctx = ParseContext::new();
        ctx.push_label(LabelInfo {
            name: "outer".into(),
            kind: LabelKind::Block,
            outer_scope: 0,
            leave: b.new_label(),
            iterate: None,
        })
        .unwrap();
        assert!(ctx.find_label("OUTER").is_some());
        ctx.push_scope(ScopeKind::HandlerBody);
        assert!(ctx.find_label("outer").is_none());
        ctx.push_scope(ScopeKind::Regular);
        assert!(ctx.find_label("outer").is_none());
        ctx.pop_scope();
        ctx.pop_scope();
        assert!(ctx.find_label("outer").is_some());
    }

    #[test]
    fn test_named_conditions() {
        let mut ctx = ParseContext::new();
        ctx.declare_condition("div0", ConditionValue::SqlState("22012".into()))
            .unwrap();
        ctx.push_scope(ScopeKind::Regular);
        assert_eq!(
            ctx.find_condition("DIV0"),
            Some(&ConditionValue::SqlState("22012".into()))
        );
        assert!(ctx.declare_condition("div0", ConditionValue::NotFound).is_ok());
        assert_eq!(ctx.find_condition("div0"), Some(&ConditionValue::NotFound));
    }
}
