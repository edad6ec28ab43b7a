//! Host interfaces
//!
//! The engine does not parse SQL, run queries or store definitions itself.
//! The embedding server supplies those through the traits below; a
//! [`Session`](crate::session::Session) is generic over a [`Host`].

use std::collections::VecDeque;

use crate::ast::{RoutineSource, SqlStatement};
use crate::error::{Error, Result};
use crate::routine::RoutineDefinition;
use crate::session::SessionState;
use crate::types::{QualifiedName, RoutineKind, Value};

/// Result of running one opaque statement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatementOutcome {
    pub rows_affected: u64,
    /// Completion conditions (SQLSTATE class "01") raised by the statement
    pub warnings: Vec<Error>,
}

impl StatementOutcome {
    pub fn affected(rows: u64) -> Self {
        StatementOutcome {
            rows_affected: rows,
            warnings: Vec::new(),
        }
    }

    pub fn with_warning(mut self, warning: Error) -> Self {
        self.warnings.push(warning);
        self
    }
}

/// Row stream backing an open cursor
pub trait RowSource {
    /// Next row, or `None` once the result is exhausted
    fn next_row(&mut self) -> Result<Option<Vec<Value>>>;
}

/// Fully materialized result
#[derive(Debug, Clone, Default)]
pub struct RowBuffer {
    rows: VecDeque<Vec<Value>>,
}

impl RowBuffer {
    pub fn new(rows: Vec<Vec<Value>>) -> Self {
        RowBuffer { rows: rows.into() }
    }

    pub fn remaining(&self) -> usize {
        self.rows.len()
    }
}

impl RowSource for RowBuffer {
    fn next_row(&mut self) -> Result<Option<Vec<Value>>> {
        Ok(self.rows.pop_front())
    }
}

/// Runs the opaque SQL statements of a routine body
pub trait StatementExecutor {
    /// Execute a statement with its parameter values bound
    fn execute(&mut self, stmt: &SqlStatement, params: &[Value], session: &SessionState) -> Result<StatementOutcome>;

    /// Execute a cursor query and return its rows
    fn open_cursor(&mut self, stmt: &SqlStatement, params: &[Value], session: &SessionState) -> Result<Box<dyn RowSource>>;
}

/// Turns stored definitions into statement trees
pub trait RoutineParser {
    /// Parse a routine definition
    fn parse_routine(&mut self, def: &RoutineDefinition) -> Result<RoutineSource>;

    /// Re-parse one statement whose metadata went stale
    ///
    /// The returned statement's text and kind replace the stale ones; the
    /// compiled parameter bindings are kept.
    fn reparse_statement(&mut self, stmt: &SqlStatement) -> Result<SqlStatement>;
}

/// Routine definitions storage
pub trait Catalog {
    /// Load a definition, `None` if it does not exist
    fn load_definition(&mut self, name: &QualifiedName, kind: RoutineKind) -> Result<Option<RoutineDefinition>>;
}

/// Everything the engine needs from its embedder
pub trait Host: StatementExecutor + RoutineParser + Catalog {}

impl<T: StatementExecutor + RoutineParser + Catalog> Host for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_buffer_drains_in_order() {
        let mut rows = RowBuffer::new(vec![vec![Value::Int(1)], vec![Value::Int(2)]]);
        assert_eq!(rows.remaining(), 2);
        assert_eq!(rows.next_row().unwrap(), Some(vec![Value::Int(1)]));
        assert_eq!(rows.next_row().unwrap(), Some(vec![Value::Int(2)]));
        assert_eq!(rows.next_row().unwrap(), None);
    }
}
