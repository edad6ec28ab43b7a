//! Routine execution
//!
//! The interpreter runs a compiled routine's instructions against a
//! [`RuntimeContext`]. Each call gets its own context and its own value arena
//! on top of the session's stacks; both are released when the call ends,
//! however it ends.

pub mod arena;
pub mod cursor;
mod engine;
mod eval;
pub mod rcontext;

pub use arena::{Arena, ArenaStack};
pub use cursor::{Cursor, CursorState};
pub use rcontext::{ActiveHandler, RuntimeContext};
