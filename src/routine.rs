//! Compiled routines
//!
//! A [`Routine`] is what the compiler produces from a catalog definition: the
//! finalized instruction array plus everything needed to call it. It is
//! immutable once built and shared behind an `Rc` by the cache and by every
//! call that runs it.

use std::fmt;

use bitflags::bitflags;

use crate::ast::Param;
use crate::builder;
use crate::instr::Instr;
use crate::pcontext::Variable;
use crate::types::{FieldDef, QualifiedName, RoutineKind, SqlMode};

bitflags! {
    /// Properties of a routine body discovered while compiling it
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RoutineFlags: u32 {
        /// Uses PREPARE / EXECUTE
        const CONTAINS_DYNAMIC_SQL = 0x0001;
        /// May send one or more result sets to the client
        const MULTI_RESULTS = 0x0002;
        /// Contains a RETURN statement
        const HAS_RETURN = 0x0004;
        /// Commits, rolls back or changes autocommit
        const HAS_COMMIT_OR_ROLLBACK = 0x0008;
        /// Contains SIGNAL
        const HAS_SIGNAL = 0x0010;
    }
}

/// SQL SECURITY characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Security {
    #[default]
    Definer,
    Invoker,
}

impl fmt::Display for Security {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Security::Definer => write!(f, "DEFINER"),
            Security::Invoker => write!(f, "INVOKER"),
        }
    }
}

/// A routine definition as stored in the catalog
#[derive(Debug, Clone, PartialEq)]
pub struct RoutineDefinition {
    pub name: QualifiedName,
    pub kind: RoutineKind,
    /// Full source text of the routine body
    pub body: String,
    pub definer: String,
    pub security: Security,
    /// SQL mode in effect when the routine was created
    pub sql_mode: SqlMode,
    pub language: String,
    pub comment: String,
}

impl RoutineDefinition {
    pub fn new(name: QualifiedName, kind: RoutineKind, body: impl Into<String>) -> Self {
        RoutineDefinition {
            name,
            kind,
            body: body.into(),
            definer: "root@localhost".to_string(),
            security: Security::Definer,
            sql_mode: SqlMode::default(),
            language: "SQL".to_string(),
            comment: String::new(),
        }
    }

    pub fn with_definer(mut self, definer: impl Into<String>) -> Self {
        self.definer = definer.into();
        self
    }

    pub fn with_security(mut self, security: Security) -> Self {
        self.security = security;
        self
    }

    pub fn with_sql_mode(mut self, sql_mode: SqlMode) -> Self {
        self.sql_mode = sql_mode;
        self
    }
}

/// A compiled stored procedure or function
#[derive(Debug, Clone)]
pub struct Routine {
    pub(crate) definition: RoutineDefinition,
    pub(crate) params: Vec<Param>,
    pub(crate) returns: Option<FieldDef>,
    pub(crate) instrs: Vec<Instr>,
    pub(crate) flags: RoutineFlags,
    pub(crate) variables: Vec<Variable>,
    pub(crate) case_count: usize,
    pub(crate) version: u64,
    pub(crate) level: u32,
}

impl Routine {
    pub fn name(&self) -> &QualifiedName {
        &self.definition.name
    }

    pub fn kind(&self) -> RoutineKind {
        self.definition.kind
    }

    pub fn definition(&self) -> &RoutineDefinition {
        &self.definition
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn returns(&self) -> Option<&FieldDef> {
        self.returns.as_ref()
    }

    pub fn instrs(&self) -> &[Instr] {
        &self.instrs
    }

    pub fn flags(&self) -> RoutineFlags {
        self.flags
    }

    pub fn security(&self) -> Security {
        self.definition.security
    }

    pub fn definer(&self) -> &str {
        &self.definition.definer
    }

    pub fn sql_mode(&self) -> SqlMode {
        self.definition.sql_mode
    }

    /// Local variable declarations indexed by frame slot; parameters first
    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    /// Number of variable slots a call frame needs
    pub fn frame_size(&self) -> usize {
        self.variables.len()
    }

    /// Shared routine version current when this routine was compiled
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Recursion depth this instance was compiled for; 0 for the first
    pub fn level(&self) -> u32 {
        self.level
    }

    /// Instruction listing, one row per position
    pub fn show_code(&self) -> String {
        builder::show_code(&self.instrs)
    }
}

impl fmt::Display for Routine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.name())
    }
}
