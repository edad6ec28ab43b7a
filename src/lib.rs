//! RustQL stored programs - compiler and interpreter for stored procedures
//! and functions

pub mod error;
pub mod types;
pub mod condition;
pub mod ast;
pub mod pcontext;
pub mod instr;
pub mod builder;
pub mod compile;
pub mod routine;
pub mod host;
pub mod cache;
pub mod exec;
pub mod session;
pub mod service;

// Re-export main public types
pub use error::{Error, ErrorCode, Result};
pub use types::{FieldDef, QualifiedName, RoutineKind, SqlMode, SqlType, Value};

// Re-export the compile and call surface
pub use compile::compile;
pub use host::{Catalog, Host, RoutineParser, RowBuffer, RowSource, StatementExecutor, StatementOutcome};
pub use routine::{Routine, RoutineDefinition, RoutineFlags, Security};
pub use session::{EngineConfig, EngineContext, FrameId, Session, SessionState};
