//! Call-scoped value arenas
//!
//! Temporary values computed while one instruction runs (statement
//! parameters, function arguments) are bump-allocated in the arena of the
//! active call and dropped together once the instruction finishes. Each call
//! gets its own arena on top of the caller's, so a callee never reclaims
//! values its caller still needs.

use crate::types::Value;

/// Bump storage for instruction temporaries
#[derive(Debug, Default)]
pub struct Arena {
    values: Vec<Value>,
    /// Total allocations since the arena was created
    allocations: u64,
    /// High-water mark of live values
    peak: usize,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, returning its index
    pub fn alloc(&mut self, value: Value) -> usize {
        self.values.push(value);
        self.allocations += 1;
        self.peak = self.peak.max(self.values.len());
        self.values.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Current allocation position, to pass to [`Arena::reclaim`] later
    pub fn mark(&self) -> usize {
        self.values.len()
    }

    /// Values allocated since `mark`
    pub fn since(&self, mark: usize) -> &[Value] {
        self.values.get(mark..).unwrap_or(&[])
    }

    /// Drop every value allocated since `mark`
    pub fn reclaim(&mut self, mark: usize) {
        self.values.truncate(mark);
    }

    /// Number of live values
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    pub fn peak(&self) -> usize {
        self.peak
    }
}

/// Stack of arenas, one per active call plus the session's own
#[derive(Debug)]
pub struct ArenaStack {
    arenas: Vec<Arena>,
}

impl Default for ArenaStack {
    fn default() -> Self {
        Self::new()
    }
}

impl ArenaStack {
    /// A stack holding only the session arena
    pub fn new() -> Self {
        ArenaStack {
            arenas: vec![Arena::new()],
        }
    }

    /// Number of arenas, including the session arena
    pub fn depth(&self) -> usize {
        self.arenas.len()
    }

    /// Push a fresh arena for a new call
    pub fn push(&mut self) {
        self.arenas.push(Arena::new());
    }

    /// Pop arenas until `depth` remain; the session arena is never popped
    pub fn truncate(&mut self, depth: usize) {
        self.arenas.truncate(depth.max(1));
    }

    pub fn current(&self) -> &Arena {
        &self.arenas[self.arenas.len() - 1]
    }

    pub fn current_mut(&mut self) -> &mut Arena {
        let last = self.arenas.len() - 1;
        &mut self.arenas[last]
    }

    /// Arena of the caller of the current call
    pub fn parent(&self) -> Option<&Arena> {
        self.arenas.len().checked_sub(2).map(|i| &self.arenas[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_reclaim() {
        let mut arena = Arena::new();
        arena.alloc(Value::Int(1));
        let mark = arena.mark();
        arena.alloc(Value::Int(2));
        arena.alloc(Value::Int(3));
        assert_eq!(arena.since(mark), &[Value::Int(2), Value::Int(3)]);
        arena.reclaim(mark);
        assert_eq!(arena.len(), 1);
        assert_eq!(arena.peak(), 3);
        assert_eq!(arena.allocations(), 3);
        assert!(arena.since(10).is_empty());
    }

    #[test]
    fn test_stack_keeps_session_arena() {
        let mut stack = ArenaStack::new();
        stack.current_mut().alloc(Value::Int(7));
        assert!(stack.parent().is_none());
        stack.push();
        assert_eq!(stack.depth(), 2);
        assert!(stack.current().is_empty());
        assert_eq!(stack.parent().and_then(|a| a.get(0)), Some(&Value::Int(7)));
        stack.truncate(0);
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.current().len(), 1);
    }
}
