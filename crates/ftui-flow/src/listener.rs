#![forbid(unsafe_code)]

//! Reference-counted listener lifecycle objects.
//!
//! # Design
//!
//! Listener objects live in a [`ListenerArena`] (one per partition) and are
//! addressed by a generational [`ListenerHandle`]. Ownership is expressed by
//! counted [`ListenerRef`]s: cloning a reference retains, dropping releases.
//! Each object tracks two counts:
//!
//! - **strong**: holders that keep the listening relationship active;
//! - **alive**: every holder, strong or weak.
//!
//! An object owns its listen closure and a list of deferred detach actions
//! ("cleanups"). When the strong count drops to zero the object goes inert in
//! two phases: the closure and the cleanups are taken out under the arena
//! lock, then run and dropped with the lock released. When the alive count
//! reaches zero the slot is freed.
//!
//! # Invariants
//!
//! 1. Cleanups never run while the arena lock is held.
//! 2. Each cleanup runs exactly once.
//! 3. An object is pinned while its cleanups run and is never freed while
//!    pinned; the last pin holder frees it if the alive count reached zero
//!    meanwhile.
//! 4. A slot is freed exactly once, only when its alive count is zero, and
//!    only after the object went inert.
//!
//! # Failure Modes
//!
//! - **Panicking cleanup**: the object stays pinned and is leaked. It is
//!   never freed twice.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::lock;
use crate::node::{Handler, Node};
use crate::transaction::TransactionImpl;

/// A deferred detach action.
pub type Cleanup = Box<dyn FnOnce() + Send>;

/// How downstream listeners attach to a node: `(tx, target, handler, strong)`,
/// returning the action that detaches them again.
pub type ListenFn =
    Arc<dyn Fn(&mut TransactionImpl, &Arc<Node>, Handler, bool) -> Option<Cleanup> + Send + Sync>;

/// Stable address of a listener object in its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle {
    index: u32,
    generation: u32,
}

/// Which count a [`ListenerRef`] contributes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    /// Counts toward both the strong and the alive count.
    Strong,
    /// Counts toward the alive count only.
    Weak,
}

struct Entry {
    func: Option<ListenFn>,
    cleanups: Vec<Cleanup>,
    strong: usize,
    alive: usize,
    pinned: bool,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

#[derive(Default)]
struct ArenaState {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl ArenaState {
    fn entry_mut(&mut self, handle: ListenerHandle) -> Option<&mut Entry> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    fn entry(&self, handle: ListenerHandle) -> Option<&Entry> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    fn occupy(&mut self, entry: Entry) -> ListenerHandle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            return ListenerHandle {
                index,
                generation: slot.generation,
            };
        }
        let index = u32::try_from(self.slots.len()).expect("listener arena exceeds u32 slots");
        self.slots.push(Slot {
            generation: 0,
            entry: Some(entry),
        });
        ListenerHandle {
            index,
            generation: 0,
        }
    }

    fn vacate(&mut self, handle: ListenerHandle) -> Option<Entry> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)?;
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Some(entry)
    }
}

/// What [`ListenerArena::update`] decided under the lock.
enum Step {
    Detach(Option<ListenFn>, Vec<Cleanup>),
    Vacate,
    Free(Entry),
    Done,
}

/// Arena of listener lifecycle objects.
pub struct ListenerArena {
    state: Mutex<ArenaState>,
    detached: AtomicU64,
    destroyed: AtomicU64,
}

impl fmt::Debug for ListenerArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerArena")
            .field("live", &self.live_count())
            .field("destroyed", &self.destroyed_total())
            .finish()
    }
}

impl ListenerArena {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ArenaState::default()),
            detached: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
        })
    }

    /// Create a listener object and return the first strong reference to it.
    pub fn insert(
        self: &Arc<Self>,
        listen: impl Fn(&mut TransactionImpl, &Arc<Node>, Handler, bool) -> Option<Cleanup>
        + Send
        + Sync
        + 'static,
    ) -> ListenerRef {
        self.insert_fn(Arc::new(listen))
    }

    pub fn insert_fn(self: &Arc<Self>, listen: ListenFn) -> ListenerRef {
        let handle = lock(&self.state).occupy(Entry {
            func: Some(listen),
            cleanups: Vec::new(),
            strong: 1,
            alive: 1,
            pinned: false,
        });
        tracing::trace!(index = handle.index, "listener created");
        ListenerRef {
            arena: Arc::clone(self),
            handle,
            kind: RefKind::Strong,
        }
    }

    /// Number of listener objects not yet freed.
    #[must_use]
    pub fn live_count(&self) -> usize {
        let state = lock(&self.state);
        state.slots.len() - state.free.len()
    }

    /// Total listener objects freed by this arena.
    #[must_use]
    pub fn destroyed_total(&self) -> u64 {
        self.destroyed.load(Ordering::Relaxed)
    }

    /// Total transitions to inert (closure dropped, cleanups run).
    #[must_use]
    pub fn detached_total(&self) -> u64 {
        self.detached.load(Ordering::Relaxed)
    }

    fn retain(&self, handle: ListenerHandle, kind: RefKind) {
        let mut state = lock(&self.state);
        let entry = state
            .entry_mut(handle)
            .expect("reference count invariant: retained a freed listener");
        entry.alive += 1;
        if kind == RefKind::Strong {
            entry.strong += 1;
        }
    }

    fn release(&self, handle: ListenerHandle, kind: RefKind) {
        {
            let mut state = lock(&self.state);
            let entry = state
                .entry_mut(handle)
                .expect("reference count invariant: released a freed listener");
            entry.alive = entry
                .alive
                .checked_sub(1)
                .expect("reference count invariant: alive count underflow");
            if kind == RefKind::Strong {
                entry.strong = entry
                    .strong
                    .checked_sub(1)
                    .expect("reference count invariant: strong count underflow");
            }
        }
        self.update(handle);
    }

    /// Bring the object in line with its counts: detach it once no strong
    /// holder remains, free it once no holder remains.
    fn update(&self, handle: ListenerHandle) {
        loop {
            let step = {
                let mut state = lock(&self.state);
                let step = match state.entry_mut(handle) {
                    None => Step::Done,
                    Some(entry) if entry.pinned => Step::Done,
                    Some(entry)
                        if entry.strong == 0
                            && (entry.func.is_some() || !entry.cleanups.is_empty()) =>
                    {
                        entry.pinned = true;
                        Step::Detach(entry.func.take(), std::mem::take(&mut entry.cleanups))
                    }
                    Some(entry) if entry.alive == 0 => Step::Vacate,
                    Some(_) => Step::Done,
                };
                match step {
                    Step::Vacate => state.vacate(handle).map_or(Step::Done, Step::Free),
                    step => step,
                }
            };

            match step {
                Step::Detach(func, cleanups) => {
                    let count = cleanups.len();
                    for cleanup in cleanups {
                        cleanup();
                    }
                    drop(func);
                    self.detached.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(index = handle.index, cleanups = count, "listener detached");
                    if let Some(entry) = lock(&self.state).entry_mut(handle) {
                        entry.pinned = false;
                    }
                }
                Step::Free(entry) => {
                    debug_assert!(
                        entry.func.is_none() && entry.cleanups.is_empty(),
                        "reference count invariant: listener freed with pending cleanups"
                    );
                    drop(entry);
                    self.destroyed.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(index = handle.index, "listener freed");
                    return;
                }
                Step::Vacate | Step::Done => return,
            }
        }
    }
}

/// A counted reference to a listener object.
///
/// Cloning retains with the same [`RefKind`]; dropping releases. Releasing
/// the last strong reference detaches the object; releasing the last
/// reference of any kind frees it.
pub struct ListenerRef {
    arena: Arc<ListenerArena>,
    handle: ListenerHandle,
    kind: RefKind,
}

impl fmt::Debug for ListenerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRef")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Clone for ListenerRef {
    fn clone(&self) -> Self {
        self.arena.retain(self.handle, self.kind);
        Self {
            arena: Arc::clone(&self.arena),
            handle: self.handle,
            kind: self.kind,
        }
    }
}

impl Drop for ListenerRef {
    fn drop(&mut self) {
        self.arena.release(self.handle, self.kind);
    }
}

impl ListenerRef {
    #[inline]
    #[must_use]
    pub fn handle(&self) -> ListenerHandle {
        self.handle
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> RefKind {
        self.kind
    }

    #[must_use]
    pub fn arena(&self) -> &Arc<ListenerArena> {
        &self.arena
    }

    /// A weak reference to the same object.
    #[must_use]
    pub fn downgrade(&self) -> ListenerRef {
        self.arena.retain(self.handle, RefKind::Weak);
        Self {
            arena: Arc::clone(&self.arena),
            handle: self.handle,
            kind: RefKind::Weak,
        }
    }

    /// A strong reference, if the object has not gone inert.
    #[must_use]
    pub fn upgrade(&self) -> Option<ListenerRef> {
        {
            let mut state = lock(&self.arena.state);
            let entry = state.entry_mut(self.handle)?;
            if entry.func.is_none() || entry.pinned {
                return None;
            }
            entry.strong += 1;
            entry.alive += 1;
        }
        Some(Self {
            arena: Arc::clone(&self.arena),
            handle: self.handle,
            kind: RefKind::Strong,
        })
    }

    /// Whether the listen closure is still present.
    #[must_use]
    pub fn is_live(&self) -> bool {
        lock(&self.arena.state)
            .entry(self.handle)
            .is_some_and(|entry| entry.func.is_some())
    }

    #[must_use]
    pub fn strong_count(&self) -> usize {
        lock(&self.arena.state)
            .entry(self.handle)
            .map_or(0, |entry| entry.strong)
    }

    #[must_use]
    pub fn alive_count(&self) -> usize {
        lock(&self.arena.state)
            .entry(self.handle)
            .map_or(0, |entry| entry.alive)
    }

    #[must_use]
    pub fn pending_cleanups(&self) -> usize {
        lock(&self.arena.state)
            .entry(self.handle)
            .map_or(0, |entry| entry.cleanups.len())
    }

    /// Attach `handler` to `target` through this object's listen closure.
    ///
    /// The returned detach action is deferred until the object goes inert.
    /// Returns `false` (and attaches nothing) if the object is already inert.
    pub fn listen(
        &self,
        tx: &mut TransactionImpl,
        target: &Arc<Node>,
        handler: Handler,
        strong: bool,
    ) -> bool {
        let func = lock(&self.arena.state)
            .entry(self.handle)
            .and_then(|entry| entry.func.clone());
        let Some(func) = func else {
            return false;
        };
        if let Some(cleanup) = func(tx, target, handler, strong) {
            self.defer_cleanup(cleanup);
        }
        drop(func);
        self.arena.update(self.handle);
        true
    }

    /// Defer a detach action until the object goes inert. If it already is,
    /// the action runs now.
    pub fn defer_cleanup(&self, cleanup: Cleanup) {
        let run_now = {
            let mut state = lock(&self.arena.state);
            match state.entry_mut(self.handle) {
                Some(entry) if entry.func.is_some() || entry.pinned => {
                    entry.cleanups.push(cleanup);
                    None
                }
                _ => Some(cleanup),
            }
        };
        if let Some(cleanup) = run_now {
            cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn counting_cleanup(hits: &Arc<AtomicUsize>) -> Cleanup {
        let hits = Arc::clone(hits);
        Box::new(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn counts_track_clones_and_drops() {
        let arena = ListenerArena::new();
        let strong = arena.insert(|_, _, _, _| None);
        assert_eq!(strong.strong_count(), 1);
        assert_eq!(strong.alive_count(), 1);

        let strong2 = strong.clone();
        let weak = strong.downgrade();
        assert_eq!(strong.strong_count(), 2);
        assert_eq!(strong.alive_count(), 3);

        drop(strong2);
        drop(weak);
        assert_eq!(strong.strong_count(), 1);
        assert_eq!(strong.alive_count(), 1);
        assert!(strong.is_live());
        assert_eq!(arena.live_count(), 1);

        drop(strong);
        assert_eq!(arena.live_count(), 0);
        assert_eq!(arena.destroyed_total(), 1);
    }

    #[test]
    fn cleanups_run_once_when_last_strong_reference_drops() {
        let arena = ListenerArena::new();
        let hits = counter();
        let strong = arena.insert(|_, _, _, _| None);
        strong.defer_cleanup(counting_cleanup(&hits));
        strong.defer_cleanup(counting_cleanup(&hits));
        let weak = strong.downgrade();

        drop(strong);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(!weak.is_live());
        assert_eq!(weak.pending_cleanups(), 0);
        assert_eq!(arena.live_count(), 1);
        assert_eq!(arena.detached_total(), 1);

        drop(weak);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(arena.destroyed_total(), 1);
    }

    #[test]
    fn cleanup_may_reenter_the_arena() {
        let arena = ListenerArena::new();
        let other = arena.insert(|_, _, _, _| None);
        let other_hits = counter();
        other.defer_cleanup(counting_cleanup(&other_hits));

        let strong = arena.insert(|_, _, _, _| None);
        let moved = std::sync::Mutex::new(Some(other));
        strong.defer_cleanup(Box::new(move || {
            // Dropping a reference re-locks the arena.
            drop(moved.lock().unwrap().take());
        }));

        drop(strong);
        assert_eq!(other_hits.load(Ordering::SeqCst), 1);
        assert_eq!(arena.live_count(), 0);
        assert_eq!(arena.destroyed_total(), 2);
    }

    #[test]
    fn object_is_not_freed_while_its_cleanups_run() {
        let arena = ListenerArena::new();
        let strong = arena.insert(|_, _, _, _| None);
        let weak = std::sync::Mutex::new(Some(strong.downgrade()));
        let observed_live = counter();
        let arena_in_cleanup = Arc::clone(&arena);
        let observed = Arc::clone(&observed_live);
        strong.defer_cleanup(Box::new(move || {
            // Drop the last remaining reference from inside the cleanup.
            drop(weak.lock().unwrap().take());
            observed.store(arena_in_cleanup.live_count(), Ordering::SeqCst);
        }));

        drop(strong);
        assert_eq!(observed_live.load(Ordering::SeqCst), 1, "pinned while draining");
        assert_eq!(arena.live_count(), 0);
        assert_eq!(arena.destroyed_total(), 1);
    }

    #[test]
    fn upgrade_fails_once_inert() {
        let arena = ListenerArena::new();
        let strong = arena.insert(|_, _, _, _| None);
        let weak = strong.downgrade();
        let again = weak.upgrade().expect("live object upgrades");
        assert_eq!(weak.strong_count(), 2);
        drop(again);
        drop(strong);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn deferring_on_an_inert_object_runs_immediately() {
        let arena = ListenerArena::new();
        let strong = arena.insert(|_, _, _, _| None);
        let weak = strong.downgrade();
        drop(strong);

        let hits = counter();
        weak.defer_cleanup(counting_cleanup(&hits));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(weak.pending_cleanups(), 0);
    }

    #[test]
    fn freed_slots_are_reused_with_a_new_generation() {
        let arena = ListenerArena::new();
        let first = arena.insert(|_, _, _, _| None);
        let first_handle = first.handle();
        drop(first);
        let second = arena.insert(|_, _, _, _| None);
        assert_ne!(second.handle(), first_handle);
        assert_eq!(arena.live_count(), 1);
    }
}
