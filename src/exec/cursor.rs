//! Routine cursors

use std::fmt;

use crate::ast::SqlStatement;
use crate::error::{Error, ErrorCode, Result};
use crate::host::RowSource;
use crate::types::Value;

/// Cursor lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Pushed on the cursor stack, never opened
    Declared,
    Open,
    Closed,
}

/// A declared cursor and, while open, its result stream
pub struct Cursor {
    name: String,
    query: SqlStatement,
    state: CursorState,
    rows: Option<Box<dyn RowSource>>,
    fetched: u64,
}

impl Cursor {
    pub fn new(name: impl Into<String>, query: SqlStatement) -> Self {
        Cursor {
            name: name.into(),
            query,
            state: CursorState::Declared,
            rows: None,
            fetched: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn query(&self) -> &SqlStatement {
        &self.query
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == CursorState::Open
    }

    /// Rows fetched since the last open
    pub fn fetched(&self) -> u64 {
        self.fetched
    }

    /// Fail unless the cursor may be opened now
    pub fn check_can_open(&self) -> Result<()> {
        if self.is_open() {
            return Err(Error::with_message(
                ErrorCode::CursorAlreadyOpen,
                format!("Cursor {} is already open", self.name),
            ));
        }
        Ok(())
    }

    /// Attach a freshly executed result stream
    pub fn open(&mut self, rows: Box<dyn RowSource>) -> Result<()> {
        self.check_can_open()?;
        self.rows = Some(rows);
        self.fetched = 0;
        self.state = CursorState::Open;
        Ok(())
    }

    /// Fetch the next row, which must have `width` columns
    ///
    /// Fetching from a cursor that is closed, never opened or exhausted is a
    /// no-data condition.
    pub fn fetch(&mut self, width: usize) -> Result<Vec<Value>> {
        let rows = match (&self.state, self.rows.as_mut()) {
            (CursorState::Open, Some(rows)) => rows,
            _ => {
                return Err(Error::with_message(
                    ErrorCode::NoData,
                    format!("No data - cursor {} is not open", self.name),
                ))
            }
        };
        match rows.next_row()? {
            Some(row) if row.len() != width => Err(Error::with_message(
                ErrorCode::FetchArity,
                format!(
                    "Incorrect number of FETCH variables: cursor {} returns {} columns, {} given",
                    self.name,
                    row.len(),
                    width
                ),
            )),
            Some(row) => {
                self.fetched += 1;
                Ok(row)
            }
            None => Err(Error::new(ErrorCode::NoData)),
        }
    }

    /// Release the result stream; the declaration stays
    pub fn close(&mut self) -> Result<()> {
        if !self.is_open() {
            return Err(Error::with_message(
                ErrorCode::CursorNotOpen,
                format!("Cursor {} is not open", self.name),
            ));
        }
        self.rows = None;
        self.state = CursorState::Closed;
        Ok(())
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("fetched", &self.fetched)
            .finish()
    }
}
