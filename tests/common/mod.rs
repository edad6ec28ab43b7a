//! In-memory host shared by the integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustql_sp::ast::{Block, Param, RoutineSource, SqlStatement, Stmt};
use rustql_sp::{
    Catalog, EngineConfig, EngineContext, Error, ErrorCode, FieldDef, QualifiedName, Result,
    RoutineDefinition, RoutineKind, RoutineParser, RowBuffer, RowSource, Session, SessionState,
    SqlType, StatementExecutor, StatementOutcome, Value,
};

pub const DB: &str = "test";

/// One statement run through the host
#[derive(Debug, Clone)]
pub struct Executed {
    pub text: String,
    pub params: Vec<Value>,
    pub state: SessionState,
}

#[derive(Default)]
pub struct MockHost {
    routines: HashMap<(RoutineKind, QualifiedName), (RoutineDefinition, RoutineSource)>,
    /// Cursor query text to the rows it returns
    pub tables: HashMap<String, Vec<Vec<Value>>>,
    pub executed: Vec<Executed>,
    /// Statement texts failing once with stale metadata
    pub stale_once: HashSet<String>,
    pub reparsed: Vec<String>,
    /// Statement texts answered with a warning
    pub warnings: HashMap<String, Error>,
    /// Statement texts failing with an error
    pub failures: HashMap<String, Error>,
    pub loads: usize,
    pub parses: usize,
    /// Set the flag once this many statements have run
    pub kill_after: Option<(usize, Arc<AtomicBool>)>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a routine under its own definition
    pub fn define(&mut self, source: RoutineSource) {
        let def = RoutineDefinition::new(source.name.clone(), source.kind, format!("{} {}", source.kind, source.name));
        self.define_with(def, source);
    }

    pub fn define_with(&mut self, def: RoutineDefinition, source: RoutineSource) {
        self.routines
            .insert((def.kind, def.name.normalized()), (def, source));
    }

    pub fn table(&mut self, query: &str, rows: Vec<Vec<Value>>) {
        self.tables.insert(query.to_string(), rows);
    }

    pub fn texts(&self) -> Vec<&str> {
        self.executed.iter().map(|e| e.text.as_str()).collect()
    }

    fn check(&mut self, stmt: &SqlStatement) -> Result<()> {
        if self.stale_once.remove(&stmt.text) {
            return Err(Error::new(ErrorCode::StaleMetadata));
        }
        if let Some(err) = self.failures.get(&stmt.text) {
            return Err(err.clone());
        }
        Ok(())
    }
}

impl StatementExecutor for MockHost {
    fn execute(&mut self, stmt: &SqlStatement, params: &[Value], session: &SessionState) -> Result<StatementOutcome> {
        self.check(stmt)?;
        self.executed.push(Executed {
            text: stmt.text.clone(),
            params: params.to_vec(),
            state: session.clone(),
        });
        if let Some((after, flag)) = &self.kill_after {
            if self.executed.len() >= *after {
                flag.store(true, Ordering::Release);
            }
        }
        let outcome = StatementOutcome::affected(1);
        Ok(match self.warnings.get(&stmt.text) {
            Some(warning) => outcome.with_warning(warning.clone()),
            None => outcome,
        })
    }

    fn open_cursor(&mut self, stmt: &SqlStatement, params: &[Value], session: &SessionState) -> Result<Box<dyn RowSource>> {
        self.check(stmt)?;
        self.executed.push(Executed {
            text: stmt.text.clone(),
            params: params.to_vec(),
            state: session.clone(),
        });
        let rows = self.tables.get(&stmt.text).cloned().unwrap_or_default();
        Ok(Box::new(RowBuffer::new(rows)))
    }
}

impl RoutineParser for MockHost {
    fn parse_routine(&mut self, def: &RoutineDefinition) -> Result<RoutineSource> {
        self.parses += 1;
        self.routines
            .get(&(def.kind, def.name.normalized()))
            .map(|(_, source)| source.clone())
            .ok_or_else(|| Error::with_message(ErrorCode::CorruptDefinition, format!("cannot parse {}", def.name)))
    }

    fn reparse_statement(&mut self, stmt: &SqlStatement) -> Result<SqlStatement> {
        self.reparsed.push(stmt.text.clone());
        Ok(SqlStatement::new(stmt.text.clone(), stmt.kind))
    }
}

impl Catalog for MockHost {
    fn load_definition(&mut self, name: &QualifiedName, kind: RoutineKind) -> Result<Option<RoutineDefinition>> {
        self.loads += 1;
        Ok(self.routines.get(&(kind, name.normalized())).map(|(def, _)| def.clone()))
    }
}

// ============================================================================
// Builders
// ============================================================================

pub fn name(routine: &str) -> QualifiedName {
    QualifiedName::new(DB, routine)
}

pub fn int() -> FieldDef {
    FieldDef::new(SqlType::Int)
}

pub fn procedure(routine: &str, params: Vec<Param>, body: Stmt) -> RoutineSource {
    RoutineSource {
        name: name(routine),
        kind: RoutineKind::Procedure,
        params,
        returns: None,
        body,
    }
}

pub fn function(routine: &str, params: Vec<Param>, returns: FieldDef, body: Stmt) -> RoutineSource {
    RoutineSource {
        name: name(routine),
        kind: RoutineKind::Function,
        params,
        returns: Some(returns),
        body,
    }
}

pub fn block(body: Vec<Stmt>) -> Block {
    Block {
        body,
        ..Block::default()
    }
}

pub fn session(host: MockHost, depth: u32) -> Session<MockHost> {
    let config = EngineConfig::default().with_max_sp_recursion_depth(depth);
    let mut session = Session::new(Arc::new(EngineContext::new(config)), host);
    session.set_database(DB);
    session
}
