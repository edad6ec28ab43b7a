//! Per-session routine cache
//!
//! Compiled routines are kept per session, keyed by kind and normalized
//! name. Each key maps to the head of an instance chain: the first compiled
//! instance plus any extra instances created for recursive calls. An
//! instance is `Invoked` while a call is running it and can only be handed
//! to one call at a time.
//!
//! Instances live in a slab. Handles carry the slot generation so a handle
//! kept across a flush never reaches an instance that replaced it.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use tracing::debug;

use crate::routine::Routine;
use crate::session::EngineContext;
use crate::types::{QualifiedName, RoutineKind};

/// Cache key: routine kind plus case-normalized name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kind: RoutineKind,
    pub name: QualifiedName,
}

impl CacheKey {
    pub fn new(kind: RoutineKind, name: &QualifiedName) -> Self {
        CacheKey {
            kind,
            name: name.normalized(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.name)
    }
}

/// Reference to one cached instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceHandle {
    index: usize,
    generation: u64,
}

/// Availability of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Compiled, never run
    Idle,
    /// Running in some call
    Invoked,
    /// Finished at least one call, available again
    Executed,
}

#[derive(Debug)]
struct Entry {
    routine: Rc<Routine>,
    state: InstanceState,
    /// Next instance in the recursion chain
    next: Option<usize>,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    entry: Option<Entry>,
}

/// Routine cache of one session
#[derive(Debug, Default)]
pub struct RoutineCache {
    slots: Vec<Slot>,
    free: Vec<usize>,
    heads: HashMap<CacheKey, usize>,
}

impl RoutineCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached routines (chains)
    pub fn len(&self) -> usize {
        self.heads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    /// Number of instances across all chains
    pub fn instance_count(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    /// Head instance cached under `key`
    pub fn lookup(&self, key: &CacheKey) -> Option<InstanceHandle> {
        self.heads.get(key).map(|&index| self.handle(index))
    }

    pub fn routine(&self, handle: InstanceHandle) -> Option<Rc<Routine>> {
        self.entry(handle).map(|e| Rc::clone(&e.routine))
    }

    pub fn state(&self, handle: InstanceHandle) -> Option<InstanceState> {
        self.entry(handle).map(|e| e.state)
    }

    /// Cache a freshly compiled routine as the head of a new chain
    ///
    /// Any chain already cached under `key` is dropped.
    pub fn insert(&mut self, key: CacheKey, routine: Rc<Routine>) -> InstanceHandle {
        self.remove(&key);
        debug!(routine = %key, version = routine.version(), "caching routine");
        let index = self.alloc(routine);
        self.heads.insert(key, index);
        self.handle(index)
    }

    /// Make every cached routine obsolete by bumping the shared version
    ///
    /// Entries stay visible until [`RoutineCache::flush_obsolete`] reclaims
    /// them.
    pub fn invalidate_all(&self, ctx: &EngineContext) -> u64 {
        let version = ctx.invalidate_routines();
        debug!(version, "routines invalidated");
        version
    }

    /// Drop the chain cached under `key`
    pub fn remove(&mut self, key: &CacheKey) -> bool {
        let Some(head) = self.heads.remove(key) else {
            return false;
        };
        let mut next = Some(head);
        while let Some(index) = next {
            next = self.free_slot(index);
        }
        true
    }

    /// Drop the chain under `key` if it was compiled before `version` and no
    /// call is running any of its instances
    pub fn flush_obsolete(&mut self, key: &CacheKey, version: u64) -> bool {
        let Some(head) = self.lookup(key) else {
            return false;
        };
        let stale = self.entry(head).map_or(false, |e| e.routine.version() < version);
        if !stale || self.is_invoked(head) {
            return false;
        }
        debug!(routine = %key, version, "flushing obsolete routine");
        self.remove(key)
    }

    /// Clear the cache if it holds more than `limit` routines
    ///
    /// Nothing is dropped while any instance is running.
    pub fn enforce_size_limit(&mut self, limit: usize) -> bool {
        if self.len() <= limit {
            return false;
        }
        if self
            .slots
            .iter()
            .any(|s| matches!(&s.entry, Some(e) if e.state == InstanceState::Invoked))
        {
            return false;
        }
        debug!(cached = self.len(), limit, "routine cache over limit, clearing");
        self.clear();
        true
    }

    /// Drop every cached routine
    pub fn clear(&mut self) {
        let keys: Vec<CacheKey> = self.heads.keys().cloned().collect();
        for key in keys {
            self.remove(&key);
        }
    }

    /// First instance of the chain not currently running
    pub fn idle_instance(&self, head: InstanceHandle) -> Option<InstanceHandle> {
        self.instances(head)
            .into_iter()
            .find(|&h| self.state(h) != Some(InstanceState::Invoked))
    }

    /// Recursion level of the last instance in the chain
    pub fn last_level(&self, head: InstanceHandle) -> Option<u32> {
        self.instances(head)
            .last()
            .and_then(|&h| self.entry(h))
            .map(|e| e.routine.level())
    }

    /// Append an instance compiled for a deeper recursion level
    pub fn append_instance(&mut self, head: InstanceHandle, routine: Rc<Routine>) -> Option<InstanceHandle> {
        let last = *self.instances(head).last()?;
        let index = self.alloc(routine);
        if let Some(entry) = self.slots[last.index].entry.as_mut() {
            entry.next = Some(index);
        }
        Some(self.handle(index))
    }

    pub fn mark_invoked(&mut self, handle: InstanceHandle) {
        if let Some(entry) = self.entry_mut(handle) {
            entry.state = InstanceState::Invoked;
        }
    }

    /// Mark an instance as available again; stale handles are ignored
    pub fn release(&mut self, handle: InstanceHandle) {
        if let Some(entry) = self.entry_mut(handle) {
            entry.state = InstanceState::Executed;
        }
    }

    /// All instances of a chain, head first
    pub fn instances(&self, head: InstanceHandle) -> Vec<InstanceHandle> {
        let mut out = Vec::new();
        let mut next = self.entry(head).map(|_| head.index);
        while let Some(index) = next {
            out.push(self.handle(index));
            next = self.slots[index].entry.as_ref().and_then(|e| e.next);
        }
        out
    }

    /// Whether any instance of the chain is running
    pub fn is_invoked(&self, head: InstanceHandle) -> bool {
        self.instances(head)
            .into_iter()
            .any(|h| self.state(h) == Some(InstanceState::Invoked))
    }

    fn handle(&self, index: usize) -> InstanceHandle {
        InstanceHandle {
            index,
            generation: self.slots[index].generation,
        }
    }

    fn entry(&self, handle: InstanceHandle) -> Option<&Entry> {
        self.slots
            .get(handle.index)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.entry.as_ref())
    }

    fn entry_mut(&mut self, handle: InstanceHandle) -> Option<&mut Entry> {
        self.slots
            .get_mut(handle.index)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.entry.as_mut())
    }

    fn alloc(&mut self, routine: Rc<Routine>) -> usize {
        let entry = Entry {
            routine,
            state: InstanceState::Idle,
            next: None,
        };
        match self.free.pop() {
            Some(index) => {
                self.slots[index].entry = Some(entry);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                self.slots.len() - 1
            }
        }
    }

    /// Free a slot, returning the next index of its chain
    fn free_slot(&mut self, index: usize) -> Option<usize> {
        let slot = &mut self.slots[index];
        let next = slot.entry.take().and_then(|e| e.next);
        slot.generation += 1;
        self.free.push(index);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Block, RoutineSource, Stmt};
    use crate::compile::compile;
    use crate::routine::RoutineDefinition;

    fn routine(name: &str, version: u64, level: u32) -> Rc<Routine> {
        let qname = QualifiedName::new("db", name);
        let def = RoutineDefinition::new(qname.clone(), RoutineKind::Procedure, "BEGIN END");
        let source = RoutineSource {
            name: qname,
            kind: RoutineKind::Procedure,
            params: Vec::new(),
            returns: None,
            body: Stmt::Block(Block::default()),
        };
        Rc::new(compile(&def, &source, version, level).unwrap())
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::new(RoutineKind::Procedure, &QualifiedName::new("db", name))
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let mut cache = RoutineCache::new();
        let r = routine("p", 1, 0);
        cache.insert(key("p"), Rc::clone(&r));
        let found = CacheKey::new(RoutineKind::Procedure, &QualifiedName::new("DB", "P"));
        let head = cache.lookup(&found).unwrap();
        assert!(Rc::ptr_eq(&cache.routine(head).unwrap(), &r));
        assert_eq!(cache.state(head), Some(InstanceState::Idle));
        assert!(cache.lookup(&CacheKey::new(RoutineKind::Function, &QualifiedName::new("db", "p"))).is_none());
    }

    #[test]
    fn test_chain_and_states() {
        let mut cache = RoutineCache::new();
        let head = cache.insert(key("p"), routine("p", 1, 0));
        cache.mark_invoked(head);
        assert!(cache.idle_instance(head).is_none());
        let second = cache.append_instance(head, routine("p", 1, 1)).unwrap();
        assert_eq!(cache.last_level(head), Some(1));
        assert_eq!(cache.idle_instance(head), Some(second));
        assert_eq!(cache.instances(head), vec![head, second]);
        assert_eq!(cache.instance_count(), 2);

        cache.release(head);
        assert_eq!(cache.state(head), Some(InstanceState::Executed));
        assert_eq!(cache.idle_instance(head), Some(head));
    }

    #[test]
    fn test_flush_waits_for_release() {
        let mut cache = RoutineCache::new();
        let head = cache.insert(key("p"), routine("p", 1, 0));
        cache.mark_invoked(head);
        assert!(!cache.flush_obsolete(&key("p"), 2));
        cache.release(head);
        assert!(!cache.flush_obsolete(&key("p"), 1));
        assert!(cache.flush_obsolete(&key("p"), 2));
        assert!(cache.lookup(&key("p")).is_none());
        // Stale handle no longer resolves, even after the slot is reused
        let fresh = cache.insert(key("q"), routine("q", 2, 0));
        assert!(cache.routine(head).is_none());
        cache.release(head);
        assert_eq!(cache.state(fresh), Some(InstanceState::Idle));
    }

    #[test]
    fn test_invalidate_keeps_entry_until_flushed() {
        let ctx = EngineContext::default();
        let mut cache = RoutineCache::new();
        let r = routine("p", ctx.version(), 0);
        cache.insert(key("p"), Rc::clone(&r));
        assert_eq!(cache.invalidate_all(&ctx), 2);
        let head = cache.lookup(&key("p")).unwrap();
        assert!(Rc::ptr_eq(&cache.routine(head).unwrap(), &r));
        assert!(cache.flush_obsolete(&key("p"), ctx.version()));
    }

    #[test]
    fn test_size_limit() {
        let mut cache = RoutineCache::new();
        let a = cache.insert(key("a"), routine("a", 1, 0));
        cache.insert(key("b"), routine("b", 1, 0));
        assert!(!cache.enforce_size_limit(2));
        cache.mark_invoked(a);
        assert!(!cache.enforce_size_limit(1));
        cache.release(a);
        assert!(cache.enforce_size_limit(1));
        assert!(cache.is_empty());
        assert_eq!(cache.instance_count(), 0);
    }
}
