//! Engine context and sessions
//!
//! [`EngineContext`] is shared by every session of one server: it carries the
//! routine version counter that invalidates cached routines lazily, and the
//! live values of the engine settings. A [`Session`] owns everything else:
//! its routine cache, its call stack and its ambient state (current
//! database, SQL mode, user, statement id, user variables).

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::ast::Expr;
use crate::cache::RoutineCache;
use crate::compile::compile;
use crate::error::{Error, ErrorCode, Result};
use crate::exec::{ArenaStack, RuntimeContext};
use crate::host::Host;
use crate::routine::{Routine, RoutineDefinition};
use crate::types::{QualifiedName, SqlMode, Value};

// ============================================================================
// Configuration
// ============================================================================

/// Engine settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Deepest recursion allowed for a routine; 0 disables recursion
    pub max_sp_recursion_depth: u32,
    /// Routines a session may cache before the cache is cleared
    pub stored_program_cache: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_sp_recursion_depth: 0,
            stored_program_cache: 256,
        }
    }
}

impl EngineConfig {
    pub fn with_max_sp_recursion_depth(mut self, depth: u32) -> Self {
        self.max_sp_recursion_depth = depth;
        self
    }

    pub fn with_stored_program_cache(mut self, size: usize) -> Self {
        self.stored_program_cache = size;
        self
    }
}

/// State shared by all sessions
#[derive(Debug)]
pub struct EngineContext {
    /// Routine version; bumped whenever any routine definition changes
    version: AtomicU64,
    max_sp_recursion_depth: AtomicU32,
    stored_program_cache: AtomicUsize,
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl EngineContext {
    pub fn new(config: EngineConfig) -> Self {
        EngineContext {
            version: AtomicU64::new(1),
            max_sp_recursion_depth: AtomicU32::new(config.max_sp_recursion_depth),
            stored_program_cache: AtomicUsize::new(config.stored_program_cache),
        }
    }

    /// Current routine version
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Mark every cached routine in every session obsolete; returns the new
    /// version
    pub fn invalidate_routines(&self) -> u64 {
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn max_recursion_depth(&self) -> u32 {
        self.max_sp_recursion_depth.load(Ordering::Relaxed)
    }

    pub fn set_max_recursion_depth(&self, depth: u32) {
        self.max_sp_recursion_depth.store(depth, Ordering::Relaxed);
    }

    pub fn cache_limit(&self) -> usize {
        self.stored_program_cache.load(Ordering::Relaxed)
    }

    pub fn set_cache_limit(&self, size: usize) {
        self.stored_program_cache.store(size, Ordering::Relaxed);
    }

    /// Snapshot of the live settings
    pub fn config(&self) -> EngineConfig {
        EngineConfig {
            max_sp_recursion_depth: self.max_recursion_depth(),
            stored_program_cache: self.cache_limit(),
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// Ambient state statements run under; saved and restored around each call
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub database: Option<String>,
    pub sql_mode: SqlMode,
    pub user: String,
    /// Id of the statement currently executing
    pub statement_id: u64,
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState {
            database: None,
            sql_mode: SqlMode::default(),
            user: "root@localhost".to_string(),
            statement_id: 0,
        }
    }
}

/// Handle of a call frame on a session's call stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub(crate) usize);

impl FrameId {
    /// Position on the call stack, 0 for the outermost call
    pub fn depth(&self) -> usize {
        self.0
    }
}

/// One client session
pub struct Session<H: Host> {
    pub(crate) ctx: Arc<EngineContext>,
    pub(crate) host: H,
    pub(crate) cache: RoutineCache,
    pub(crate) state: SessionState,
    pub(crate) user_vars: HashMap<String, Value>,
    pub(crate) killed: Arc<AtomicBool>,
    pub(crate) warnings: Vec<Error>,
    pub(crate) arenas: ArenaStack,
    pub(crate) frames: Vec<RuntimeContext>,
    pub(crate) next_statement_id: u64,
}

impl<H: Host> Session<H> {
    pub fn new(ctx: Arc<EngineContext>, host: H) -> Self {
        Session {
            ctx,
            host,
            cache: RoutineCache::new(),
            state: SessionState::default(),
            user_vars: HashMap::new(),
            killed: Arc::new(AtomicBool::new(false)),
            warnings: Vec::new(),
            arenas: ArenaStack::new(),
            frames: Vec::new(),
            next_statement_id: 0,
        }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn set_database(&mut self, database: impl Into<String>) {
        self.state.database = Some(database.into());
    }

    pub fn set_sql_mode(&mut self, sql_mode: SqlMode) {
        self.state.sql_mode = sql_mode;
    }

    pub fn set_user(&mut self, user: impl Into<String>) {
        self.state.user = user.into();
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn cache(&self) -> &RoutineCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut RoutineCache {
        &mut self.cache
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// Flag another thread can set to interrupt the running call
    pub fn kill_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.killed)
    }

    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    pub fn reset_kill(&self) {
        self.killed.store(false, Ordering::Release);
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    // ========================================================================
    // Variables and Diagnostics
    // ========================================================================

    pub fn user_var(&self, name: &str) -> Option<&Value> {
        self.user_vars.get(&name.to_lowercase())
    }

    pub fn set_user_var(&mut self, name: &str, value: impl Into<Value>) {
        self.user_vars.insert(name.to_lowercase(), value.into());
    }

    /// Unhandled completion conditions raised since the last clear
    pub fn warnings(&self) -> &[Error] {
        &self.warnings
    }

    pub fn clear_warnings(&mut self) {
        self.warnings.clear();
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// CALL a stored procedure
    ///
    /// OUT and INOUT arguments must be session variables (`@name`).
    pub fn call_procedure(&mut self, name: &QualifiedName, args: &[Expr]) -> Result<()> {
        self.invoke_procedure(None, name, args)
    }

    /// Call a stored function with already evaluated arguments
    pub fn call_function(&mut self, name: &QualifiedName, args: &[Value]) -> Result<Value> {
        let args: Vec<Expr> = args.iter().cloned().map(Expr::Literal).collect();
        self.invoke_function(None, name, &args)
    }

    /// Fill in the current database for an unqualified name
    pub(crate) fn resolve_name(&self, name: &QualifiedName) -> Result<QualifiedName> {
        if !name.db.is_empty() {
            return Ok(name.clone());
        }
        match &self.state.database {
            Some(db) => Ok(QualifiedName::new(db.clone(), name.name.clone())),
            None => Err(Error::with_message(ErrorCode::NoSuchRoutine, "No database selected")),
        }
    }

    // ========================================================================
    // Definition and Cache Management
    // ========================================================================

    /// Parse and compile a definition without caching it
    pub fn validate_definition(&mut self, def: &RoutineDefinition) -> Result<Routine> {
        let source = self.host.parse_routine(def)?;
        compile(def, &source, self.ctx.version(), 0)
    }

    /// A routine definition changed: invalidate cached routines everywhere
    pub fn routines_changed(&self) -> u64 {
        self.cache.invalidate_all(&self.ctx)
    }

    /// End of a top-level statement: keep the cache within its limit
    pub fn end_statement(&mut self) -> bool {
        self.cache.enforce_size_limit(self.ctx.cache_limit())
    }

    /// Drop every cached routine unless a call is running
    pub fn reset_cache(&mut self) -> bool {
        if !self.frames.is_empty() {
            return false;
        }
        debug!(cached = self.cache.len(), "resetting routine cache");
        self.cache.clear();
        true
    }

    // ========================================================================
    // Frames
    // ========================================================================

    /// Push a frame for `routine` outside of any call, e.g. to bind
    /// arguments through the runtime service
    pub fn begin_frame(&mut self, routine: Rc<Routine>) -> FrameId {
        self.frames.push(RuntimeContext::new(routine));
        FrameId(self.frames.len() - 1)
    }

    /// Pop `frame` and every frame above it
    pub fn end_frame(&mut self, frame: FrameId) -> Option<RuntimeContext> {
        if frame.0 >= self.frames.len() {
            return None;
        }
        let mut popped = self.frames.drain(frame.0..);
        popped.next()
    }

    /// Innermost frame on the call stack
    pub fn active_frame(&self) -> Option<FrameId> {
        self.frames.len().checked_sub(1).map(FrameId)
    }

    pub fn frame(&self, frame: FrameId) -> Option<&RuntimeContext> {
        self.frames.get(frame.0)
    }

    pub fn frame_mut(&mut self, frame: FrameId) -> Option<&mut RuntimeContext> {
        self.frames.get_mut(frame.0)
    }

    /// Number of frames on the call stack
    pub fn call_depth(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn context_mut(&mut self, frame: FrameId) -> Result<&mut RuntimeContext> {
        self.frames
            .get_mut(frame.0)
            .ok_or_else(|| Error::with_message(ErrorCode::Internal, format!("No call frame {}", frame.0)))
    }

    pub(crate) fn context_ref(&self, frame: FrameId) -> Result<&RuntimeContext> {
        self.frames
            .get(frame.0)
            .ok_or_else(|| Error::with_message(ErrorCode::Internal, format!("No call frame {}", frame.0)))
    }

    /// Record a completion condition against `frame`, or the session when
    /// no routine is running
    pub(crate) fn push_warning(&mut self, frame: Option<FrameId>, warning: Error) {
        match frame.and_then(|f| self.frames.get_mut(f.0)) {
            Some(ctx) => ctx.push_warning(warning),
            None => self.warnings.push(warning),
        }
    }
}
