#![forbid(unsafe_code)]

//! Rank-ordered vertices of the propagation graph.
//!
//! # Design
//!
//! A [`Node`] is shared as `Arc<Node>`. Outgoing edges ("targets") hold a
//! strong reference to the downstream node together with the [`Holder`] that
//! registered them, so one subscription can be removed with
//! [`unlink`](Node::unlink) without touching other holders' edges to the same
//! target.
//!
//! # Invariants
//!
//! 1. For every edge `u → v` with `u ≠ v`: `rank(u) < rank(v)`.
//! 2. Ranks only grow, and never reach the partition's rank limit.
//! 3. A failed [`link`](Node::link) leaves every rank and edge untouched.
//! 4. Firings buffered by [`send`](Node::send) are cleared when the
//!    transaction that produced them finishes.
//!
//! # Locking
//!
//! Each node guards its state with its own mutex. A node lock is held only
//! for short reads and writes, never while another node is locked and never
//! while user code runs. Values that may run user code when dropped (edges,
//! listener references, firings) are moved out and dropped after unlocking.
//!
//! Graph mutations are expected to be serialized by the owning partition,
//! i.e. performed from inside its open transaction.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ahash::AHashMap;

use crate::error::{FlowError, FlowResult};
use crate::listener::ListenerRef;
use crate::lock;
use crate::transaction::TransactionImpl;

/// Relative firing order of a node. Lower ranks fire first.
pub type Rank = u64;

/// Absolute rank sentinel.
pub const RANK_MAX: Rank = Rank::MAX;

/// Opaque payload carried through the graph.
pub type Firing = Arc<dyn Any + Send + Sync>;

/// Listener registration callback: receives the transaction, the target node
/// and the value delivered to it.
pub type Handler = Arc<dyn Fn(&mut TransactionImpl, &Arc<Node>, &Firing) + Send + Sync>;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_HOLDER_KEY: AtomicU64 = AtomicU64::new(1);

/// Process-unique node identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u64);

impl NodeId {
    fn next() -> Self {
        Self(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of a subscription, used to remove its edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HolderKey(u64);

/// A subscription: an identity plus the handler invoked for every firing
/// delivered along its edges.
#[derive(Clone)]
pub struct Holder {
    key: HolderKey,
    handler: Handler,
}

impl Holder {
    pub fn new(
        handler: impl Fn(&mut TransactionImpl, &Arc<Node>, &Firing) + Send + Sync + 'static,
    ) -> Self {
        Self::from_handler(Arc::new(handler))
    }

    #[must_use]
    pub fn from_handler(handler: Handler) -> Self {
        Self {
            key: HolderKey(NEXT_HOLDER_KEY.fetch_add(1, Ordering::Relaxed)),
            handler,
        }
    }

    /// A holder whose handler ignores every firing.
    #[must_use]
    pub fn inert() -> Self {
        Self::new(|_, _, _| {})
    }

    #[must_use]
    pub fn key(&self) -> HolderKey {
        self.key
    }

    #[must_use]
    pub fn handler(&self) -> &Handler {
        &self.handler
    }
}

impl fmt::Debug for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Holder").field("key", &self.key).finish()
    }
}

/// An outgoing edge.
struct Target {
    holder: Holder,
    node: Arc<Node>,
}

struct NodeState {
    rank: Rank,
    targets: Vec<Target>,
    firings: Vec<Firing>,
    /// Transaction that produced `firings`.
    firings_txn: Option<u64>,
    /// Keeps upstream producers alive for as long as this node exists.
    sources: Vec<ListenerRef>,
    listen_impl: Option<ListenerRef>,
}

/// A vertex of the propagation graph.
pub struct Node {
    id: NodeId,
    state: Mutex<NodeState>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("rank", &state.rank)
            .field("targets", &state.targets.len())
            .field("firings", &state.firings.len())
            .field("sources", &state.sources.len())
            .finish()
    }
}

impl Node {
    /// Create a node at rank 0.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_rank(0)
    }

    #[must_use]
    pub fn with_rank(rank: Rank) -> Arc<Self> {
        Arc::new(Self {
            id: NodeId::next(),
            state: Mutex::new(NodeState {
                rank,
                targets: Vec::new(),
                firings: Vec::new(),
                firings_txn: None,
                sources: Vec::new(),
                listen_impl: None,
            }),
        })
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[must_use]
    pub fn rank(&self) -> Rank {
        lock(&self.state).rank
    }

    // ── Edges ────────────────────────────────────────────────────────

    /// Add the edge `self → target` on behalf of `holder`, raising ranks
    /// below [`RANK_MAX`] as needed.
    ///
    /// Returns whether any rank changed.
    pub fn link(&self, holder: &Holder, target: &Arc<Node>) -> FlowResult<bool> {
        self.link_with_limit(holder, target, RANK_MAX)
    }

    /// Add the edge `self → target`, keeping every rank below `limit`.
    ///
    /// `target` and everything reachable from it are raised above this
    /// node's rank before the edge is recorded. The raise is planned in full
    /// first, so an error leaves the graph untouched.
    ///
    /// # Errors
    ///
    /// [`FlowError::RankOverflow`] if a node would need a rank `>= limit`;
    /// [`FlowError::RankCycle`] if `target` already reaches this node.
    pub fn link_with_limit(
        &self,
        holder: &Holder,
        target: &Arc<Node>,
        limit: Rank,
    ) -> FlowResult<bool> {
        let changed = if target.id == self.id {
            false
        } else {
            raise_above(self.id, target, self.rank(), limit)?
        };
        lock(&self.state).targets.push(Target {
            holder: holder.clone(),
            node: Arc::clone(target),
        });
        Ok(changed)
    }

    /// Remove every edge registered by `key`. Returns how many were removed.
    pub fn unlink(&self, key: HolderKey) -> usize {
        let removed: Vec<Target> = {
            let mut state = lock(&self.state);
            let (removed, kept) = std::mem::take(&mut state.targets)
                .into_iter()
                .partition(|t| t.holder.key == key);
            state.targets = kept;
            removed
        };
        removed.len()
    }

    #[must_use]
    pub fn target_count(&self) -> usize {
        lock(&self.state).targets.len()
    }

    /// Snapshot of the outgoing edges as `(holder key, target)` pairs.
    #[must_use]
    pub fn targets(&self) -> Vec<(HolderKey, Arc<Node>)> {
        lock(&self.state)
            .targets
            .iter()
            .map(|t| (t.holder.key, Arc::clone(&t.node)))
            .collect()
    }

    /// Targets registered by `key`.
    #[must_use]
    pub fn targets_of(&self, key: HolderKey) -> Vec<Arc<Node>> {
        lock(&self.state)
            .targets
            .iter()
            .filter(|t| t.holder.key == key)
            .map(|t| Arc::clone(&t.node))
            .collect()
    }

    fn downstream(&self) -> Vec<Arc<Node>> {
        lock(&self.state)
            .targets
            .iter()
            .filter(|t| t.node.id != self.id)
            .map(|t| Arc::clone(&t.node))
            .collect()
    }

    // ── Firings ──────────────────────────────────────────────────────

    /// Fire `firing` from this node within `tx`.
    ///
    /// Every target's handler is enqueued at the target's rank. The firing
    /// stays buffered on this node until the transaction's final phase.
    /// Firings left behind by a transaction that never reached its final
    /// phase are discarded by the first send of a later one.
    pub fn send(self: &Arc<Self>, tx: &mut TransactionImpl, firing: Firing) {
        let txn_id = tx.id();
        let (first, stale, deliveries) = {
            let mut state = lock(&self.state);
            let first = state.firings_txn != Some(txn_id);
            let stale = if first {
                state.firings_txn = Some(txn_id);
                std::mem::take(&mut state.firings)
            } else {
                Vec::new()
            };
            state.firings.push(Arc::clone(&firing));
            let deliveries: Vec<(Handler, Arc<Node>)> = state
                .targets
                .iter()
                .map(|t| (Arc::clone(&t.holder.handler), Arc::clone(&t.node)))
                .collect();
            (first, stale, deliveries)
        };
        drop(stale);
        if first {
            let node = Arc::clone(self);
            tx.last(move |_| node.clear_firings(txn_id));
        }
        for (handler, target) in deliveries {
            let firing = Arc::clone(&firing);
            let to = Arc::clone(&target);
            tx.prioritized(&target, move |tx| handler(tx, &to, &firing));
        }
    }

    /// Firings produced in the current transaction, oldest first.
    #[must_use]
    pub fn firings(&self) -> Vec<Firing> {
        lock(&self.state).firings.clone()
    }

    fn clear_firings(&self, txn_id: u64) {
        let cleared = {
            let mut state = lock(&self.state);
            if state.firings_txn != Some(txn_id) {
                return;
            }
            state.firings_txn = None;
            std::mem::take(&mut state.firings)
        };
        drop(cleared);
    }

    // ── Lifetime links ───────────────────────────────────────────────

    /// Keep an upstream listener object alive for as long as this node.
    pub fn add_source(&self, source: ListenerRef) {
        lock(&self.state).sources.push(source);
    }

    #[must_use]
    pub fn source_count(&self) -> usize {
        lock(&self.state).sources.len()
    }

    /// Release every source reference.
    pub fn clear_sources(&self) {
        let released = std::mem::take(&mut lock(&self.state).sources);
        drop(released);
    }

    /// Install how downstream nodes attach to this node. Returns the previous
    /// listen implementation, if any.
    pub fn set_listen_impl(&self, listen_impl: ListenerRef) -> Option<ListenerRef> {
        lock(&self.state).listen_impl.replace(listen_impl)
    }

    #[must_use]
    pub fn listen_impl(&self) -> Option<ListenerRef> {
        lock(&self.state).listen_impl.clone()
    }

    pub fn take_listen_impl(&self) -> Option<ListenerRef> {
        lock(&self.state).listen_impl.take()
    }
}

/// Raise `start` and everything it reaches above `floor`, keeping ranks
/// below `limit`. `origin` is the node the new edge leaves from.
fn raise_above(origin: NodeId, start: &Arc<Node>, floor: Rank, limit: Rank) -> FlowResult<bool> {
    // Planned ranks double as the visited set: a node is revisited only when
    // a longer path demands a strictly higher rank.
    let mut planned: AHashMap<NodeId, (Arc<Node>, Rank)> = AHashMap::new();
    let mut queue: VecDeque<(Arc<Node>, Rank)> = VecDeque::new();
    queue.push_back((Arc::clone(start), floor));

    while let Some((node, floor)) = queue.pop_front() {
        let current = match planned.get(&node.id) {
            Some((_, rank)) => *rank,
            None => node.rank(),
        };
        if current > floor {
            continue;
        }
        if node.id == origin {
            tracing::warn!(from = %origin, to = %start.id, "rank walk closed a cycle");
            return Err(FlowError::RankCycle {
                from: origin,
                to: start.id,
            });
        }
        let raised = match floor.checked_add(1) {
            Some(rank) if rank < limit => rank,
            _ => {
                tracing::warn!(node = %node.id, rank = floor, limit, "rank limit reached");
                return Err(FlowError::RankOverflow {
                    node: node.id,
                    rank: floor,
                    limit,
                });
            }
        };
        for next in node.downstream() {
            queue.push_back((next, raised));
        }
        planned.insert(node.id, (node, raised));
    }

    let changed = !planned.is_empty();
    for (node, rank) in planned.into_values() {
        let mut state = lock(&node.state);
        debug_assert!(state.rank < rank, "rank invariant: ranks only grow");
        state.rank = rank;
    }
    Ok(changed)
}
