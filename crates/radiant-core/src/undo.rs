//! Snapshot-based undo: each operation stores the pre-mutation state of every
//! node touched inside one `UndoableCommand` scope.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::scene::{Node, NodeId, NodeState};
use crate::signal::Signal;

static NEXT_UNDO_SYSTEM_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Ids of the undo systems with an open command on this thread, innermost last.
    static OPEN_COMMANDS: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

struct Snapshot {
    node_id: NodeId,
    node: Weak<Node>,
    state: NodeState,
}

struct Operation {
    label: String,
    snapshots: Vec<Snapshot>,
}

/// Distinguishes "changed since last save" from the undo stack contents.
#[derive(Default)]
pub struct ChangeTracker {
    changes: AtomicI64,
    saved_at: AtomicI64,
}

impl ChangeTracker {
    pub fn is_modified(&self) -> bool {
        self.changes.load(Ordering::Relaxed) != self.saved_at.load(Ordering::Relaxed)
    }

    /// Marks the current state as the saved one.
    pub fn save(&self) {
        self.saved_at.store(self.changes.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    fn changed(&self) {
        self.changes.fetch_add(1, Ordering::Relaxed);
    }

    fn undone(&self) {
        self.changes.fetch_sub(1, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.changes.store(0, Ordering::Relaxed);
        self.saved_at.store(0, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct Stacks {
    undo: Vec<Operation>,
    redo: Vec<Operation>,
    current: Option<Operation>,
}

pub struct UndoSystem {
    id: u64,
    stacks: Mutex<Stacks>,
    restoring: AtomicBool,
    tracker: ChangeTracker,
    undo_redo_performed: Signal<()>,
}

impl Default for UndoSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl UndoSystem {
    pub fn new() -> Self {
        Self {
            id: NEXT_UNDO_SYSTEM_ID.fetch_add(1, Ordering::Relaxed),
            stacks: Mutex::new(Stacks::default()),
            restoring: AtomicBool::new(false),
            tracker: ChangeTracker::default(),
            undo_redo_performed: Signal::new(),
        }
    }

    fn start(&self, label: &str) {
        self.stacks.lock().current = Some(Operation {
            label: label.to_string(),
            snapshots: Vec::new(),
        });
    }

    fn finish(&self) {
        let recorded = {
            let mut stacks = self.stacks.lock();
            match stacks.current.take() {
                Some(operation) if !operation.snapshots.is_empty() => {
                    tracing::debug!("[undo] Recorded {}", operation.label);
                    stacks.undo.push(operation);
                    stacks.redo.clear();
                    true
                }
                _ => false,
            }
        };
        if recorded {
            self.tracker.changed();
        }
    }

    /// Records the state of `node` before its first mutation in the open command.
    pub fn save_node(&self, node: &Node) {
        if self.restoring.load(Ordering::Relaxed) {
            return;
        }
        let mut stacks = self.stacks.lock();
        let Some(operation) = stacks.current.as_mut() else {
            tracing::debug!("[undo] Node {} changed outside of an undoable command", node.id());
            return;
        };
        if operation.snapshots.iter().any(|s| s.node_id == node.id()) {
            return;
        }
        operation.snapshots.push(Snapshot {
            node_id: node.id(),
            node: node.weak_self(),
            state: node.capture_state(),
        });
    }

    pub fn undo(&self) -> bool {
        self.step(true)
    }

    pub fn redo(&self) -> bool {
        self.step(false)
    }

    fn step(&self, undo: bool) -> bool {
        let operation = {
            let mut stacks = self.stacks.lock();
            if stacks.current.is_some() {
                tracing::warn!("[undo] Cannot undo or redo while a command is open");
                return false;
            }
            let stack = if undo { &mut stacks.undo } else { &mut stacks.redo };
            let Some(operation) = stack.pop() else {
                tracing::info!("[undo] No more operations to {}", if undo { "undo" } else { "redo" });
                return false;
            };
            operation
        };

        self.restoring.store(true, Ordering::Relaxed);
        let mut inverse = Vec::with_capacity(operation.snapshots.len());
        for snapshot in operation.snapshots.into_iter().rev() {
            let Some(node) = snapshot.node.upgrade() else {
                continue;
            };
            inverse.push(Snapshot {
                node_id: snapshot.node_id,
                node: snapshot.node,
                state: node.capture_state(),
            });
            node.restore_state(snapshot.state);
        }
        self.restoring.store(false, Ordering::Relaxed);

        tracing::debug!("[undo] {} {}", if undo { "Undo" } else { "Redo" }, operation.label);
        let inverse = Operation {
            label: operation.label,
            snapshots: inverse,
        };
        {
            let mut stacks = self.stacks.lock();
            if undo {
                stacks.redo.push(inverse);
            } else {
                stacks.undo.push(inverse);
            }
        }
        if undo {
            self.tracker.undone();
        } else {
            self.tracker.changed();
        }
        self.undo_redo_performed.emit(&());
        true
    }

    /// Drops both stacks (map unload).
    pub fn clear(&self) {
        let mut stacks = self.stacks.lock();
        stacks.undo.clear();
        stacks.redo.clear();
        drop(stacks);
        self.tracker.reset();
    }

    pub fn undo_stack_size(&self) -> usize {
        self.stacks.lock().undo.len()
    }

    pub fn redo_stack_size(&self) -> usize {
        self.stacks.lock().redo.len()
    }

    pub fn undo_label(&self) -> Option<String> {
        self.stacks.lock().undo.last().map(|o| o.label.clone())
    }

    pub fn redo_label(&self) -> Option<String> {
        self.stacks.lock().redo.last().map(|o| o.label.clone())
    }

    pub fn change_tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    pub fn signal_undo_redo_performed(&self) -> &Signal<()> {
        &self.undo_redo_performed
    }
}

/// Scope collecting every mutation until it drops into one undo operation.
/// Nested commands on the same undo system coalesce into the outermost one.
pub struct UndoableCommand {
    undo: Arc<UndoSystem>,
    outermost: bool,
}

impl UndoableCommand {
    pub fn new(undo: &Arc<UndoSystem>, label: &str) -> Self {
        let outermost = OPEN_COMMANDS.with(|open| {
            let mut open = open.borrow_mut();
            let outermost = !open.contains(&undo.id);
            open.push(undo.id);
            outermost
        });
        if outermost {
            undo.start(label);
        }
        Self {
            undo: undo.clone(),
            outermost,
        }
    }
}

impl Drop for UndoableCommand {
    fn drop(&mut self) {
        OPEN_COMMANDS.with(|open| {
            let mut open = open.borrow_mut();
            if let Some(pos) = open.iter().rposition(|id| *id == self.undo.id) {
                open.remove(pos);
            }
        });
        if self.outermost {
            self.undo.finish();
        }
    }
}
