//! Instruction builder and optimizer
//!
//! Instructions are appended in emission order while a routine body is
//! compiled. Forward jumps are emitted against symbolic [`Label`]s and
//! backpatched when the label is resolved. Labels form a union-find forest
//! so that a label can be declared an alias of another one before either is
//! resolved.
//!
//! [`RoutineBuilder::finalize`] marks every instruction reachable from
//! position 0, shortcuts jump-to-jump chains, and compacts the array to a
//! dense numbering.

use std::fmt::Write;

use crate::error::{Error, ErrorCode, Result};
use crate::instr::{Instr, Ip, TargetField, UNRESOLVED};

// ============================================================================
// Labels
// ============================================================================

/// Symbolic jump target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

#[derive(Debug, Clone)]
struct LabelEntry {
    /// Union-find parent; a root points at itself
    parent: usize,
    /// Resolved position, only meaningful on a root
    target: Option<Ip>,
}

/// A jump target waiting for its label
#[derive(Debug, Clone, Copy)]
struct Backpatch {
    ip: Ip,
    label: Label,
    field: TargetField,
}

// ============================================================================
// Builder
// ============================================================================

/// Builds the instruction array of one routine
#[derive(Debug, Default)]
pub struct RoutineBuilder {
    instrs: Vec<Instr>,
    labels: Vec<LabelEntry>,
    pending: Vec<Backpatch>,
}

impl RoutineBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Position the next appended instruction will get
    pub fn next_ip(&self) -> Ip {
        self.instrs.len()
    }

    /// Append an instruction, returning its position
    pub fn append(&mut self, instr: Instr) -> Ip {
        let ip = self.instrs.len();
        self.instrs.push(instr);
        ip
    }

    /// Allocate a new unresolved label
    pub fn new_label(&mut self) -> Label {
        let id = self.labels.len();
        self.labels.push(LabelEntry {
            parent: id,
            target: None,
        });
        Label(id)
    }

    fn find(&mut self, label: Label) -> usize {
        let mut root = label.0;
        while self.labels[root].parent != root {
            root = self.labels[root].parent;
        }
        let mut cur = label.0;
        while self.labels[cur].parent != root {
            let next = self.labels[cur].parent;
            self.labels[cur].parent = root;
            cur = next;
        }
        root
    }

    /// Resolved position of a label, following aliases
    pub fn label_target(&mut self, label: Label) -> Option<Ip> {
        let root = self.find(label);
        self.labels[root].target
    }

    fn patch(&mut self, ip: Ip, field: TargetField, target: Ip) {
        if let Some(slot) = self.instrs.get_mut(ip).and_then(|i| i.target_mut(field)) {
            *slot = target;
        }
    }

    /// Make the `field` target of the instruction at `ip` point at `label`
    pub fn request_backpatch(&mut self, ip: Ip, label: Label, field: TargetField) {
        match self.label_target(label) {
            Some(target) => self.patch(ip, field, target),
            None => self.pending.push(Backpatch { ip, label, field }),
        }
    }

    /// Append an unconditional jump to `label`
    pub fn append_jump(&mut self, label: Label) -> Ip {
        let ip = self.append(Instr::Jump { dest: UNRESOLVED });
        self.request_backpatch(ip, label, TargetField::Dest);
        ip
    }

    /// Resolve `label` (and every alias of it) to `ip`
    pub fn resolve(&mut self, label: Label, ip: Ip) -> Result<()> {
        let root = self.find(label);
        if self.labels[root].target.is_some() {
            return Err(Error::with_message(
                ErrorCode::Internal,
                format!("label {} resolved twice", label.0),
            ));
        }
        self.labels[root].target = Some(ip);
        self.flush_pending(root, ip);
        Ok(())
    }

    /// Resolve `label` to the next instruction to be appended
    pub fn resolve_here(&mut self, label: Label) -> Result<()> {
        let ip = self.next_ip();
        self.resolve(label, ip)
    }

    /// Declare `label` an alias of `target`: wherever `target` ends up,
    /// jumps to `label` follow
    pub fn alias(&mut self, label: Label, target: Label) -> Result<()> {
        let from = self.find(label);
        let to = self.find(target);
        if from == to {
            return Ok(());
        }
        if self.labels[from].target.is_some() {
            return Err(Error::with_message(
                ErrorCode::Internal,
                format!("label {} is already resolved", label.0),
            ));
        }
        self.labels[from].parent = to;
        if let Some(ip) = self.labels[to].target {
            self.flush_pending(to, ip);
        }
        Ok(())
    }

    fn flush_pending(&mut self, root: usize, target: Ip) {
        let pending = std::mem::take(&mut self.pending);
        for bp in pending {
            if self.find(bp.label) == root {
                self.patch(bp.ip, bp.field, target);
            } else {
                self.pending.push(bp);
            }
        }
    }

    /// Fail if any jump still waits for `label`
    pub fn check_resolved(&mut self, label: Label, name: &str) -> Result<()> {
        let root = self.find(label);
        let pending = self.pending.clone();
        if pending.iter().any(|bp| self.find(bp.label) == root) {
            return Err(Error::with_message(
                ErrorCode::MalformedControlFlow,
                format!("GOTO with no matching label: {}", name),
            ));
        }
        Ok(())
    }

    /// Number of jumps still waiting for a label
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn instrs(&self) -> &[Instr] {
        &self.instrs
    }

    pub fn instr_mut(&mut self, ip: Ip) -> Option<&mut Instr> {
        self.instrs.get_mut(ip)
    }

    // ========================================================================
    // Optimizer
    // ========================================================================

    /// Remove unreachable instructions and shortcut jump chains
    ///
    /// Marking starts at position 0 and follows fall-through and every
    /// static target. Retained instructions are renumbered densely and all
    /// targets, including those of jumps still pending on a label, are
    /// rewritten to the new numbering. Running it twice is a no-op the
    /// second time.
    pub fn finalize(&mut self) {
        let len = self.instrs.len();
        if len == 0 {
            return;
        }

        let mut marked = vec![false; len];
        let mut stack = vec![0];
        while let Some(ip) = stack.pop() {
            if ip >= len || marked[ip] {
                continue;
            }
            marked[ip] = true;

            let current = self.instrs[ip].shortcut_dest_mut().map(|d| *d);
            if let Some(dest) = current {
                let shortcut = shortcut_jumps(&self.instrs, dest);
                if let Some(d) = self.instrs[ip].shortcut_dest_mut() {
                    *d = shortcut;
                }
            }

            let instr = &self.instrs[ip];
            for target in instr.targets() {
                if target != UNRESOLVED {
                    stack.push(target);
                }
            }
            if instr.falls_through() {
                stack.push(ip + 1);
            }
        }

        let mut map = vec![UNRESOLVED; len];
        let mut next = 0;
        for (ip, &keep) in marked.iter().enumerate() {
            if keep {
                map[ip] = next;
                next += 1;
            }
        }
        let end = next;
        let renumber = |ip: Ip| -> Ip {
            if ip == UNRESOLVED {
                ip
            } else {
                map.get(ip).copied().filter(|&m| m != UNRESOLVED).unwrap_or(end)
            }
        };

        let old = std::mem::take(&mut self.instrs);
        for (ip, mut instr) in old.into_iter().enumerate() {
            if !marked[ip] {
                continue;
            }
            for target in instr.targets_mut() {
                *target = renumber(*target);
            }
            self.instrs.push(instr);
        }

        self.pending.retain(|bp| marked.get(bp.ip).copied().unwrap_or(false));
        for bp in &mut self.pending {
            bp.ip = map[bp.ip];
        }
    }

    /// Finalize and hand out the instruction array
    ///
    /// Fails if a jump is still waiting for a label.
    pub fn build(mut self) -> Result<Vec<Instr>> {
        if let Some(bp) = self.pending.first() {
            return Err(Error::with_message(
                ErrorCode::MalformedControlFlow,
                format!("jump at {} has no resolved target", bp.ip),
            ));
        }
        self.finalize();
        Ok(self.instrs)
    }
}

/// Follow unconditional jumps starting at `from`, stopping on a cycle
fn shortcut_jumps(instrs: &[Instr], from: Ip) -> Ip {
    let mut seen = vec![from];
    let mut cur = from;
    while let Some(Instr::Jump { dest }) = instrs.get(cur) {
        if *dest == UNRESOLVED || seen.contains(dest) {
            break;
        }
        cur = *dest;
        seen.push(cur);
    }
    cur
}

// ============================================================================
// Code Listing
// ============================================================================

/// Render an instruction array as a `Pos  Instruction` table
pub fn show_code(instrs: &[Instr]) -> String {
    let mut output = String::new();
    let _ = writeln!(output, "{:>4}  {}", "Pos", "Instruction");
    let _ = writeln!(output, "----  -----------");
    for (ip, instr) in instrs.iter().enumerate() {
        let _ = writeln!(output, "{:>4}  {}", ip, instr);
    }
    output
}
