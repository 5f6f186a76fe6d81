//! Fork database: light-weight state for all potential unconfirmed forks.
//!
//! As new blocks are validated, their header states are pushed into the
//! fork database. The database tracks a single-rooted tree of candidate
//! blocks keyed by block id, the current root (last irreversible
//! ancestor), and the best head. Advancing the root emits an
//! irreversibility signal for each newly-final block, in ascending
//! block-number order, before orphaned branches are freed.
//!
//! An internal mutex provides thread safety; snapshots handed out by
//! `root()`/`head()` are reference-counted and remain valid after the
//! lock is released.

use crate::persistence::{self, ForkDbSnapshot, PersistenceError};
use instafin_types::{BlockHeaderState, BlockId, BlockNum};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Name of the persistence file inside the data directory.
const FORK_DB_FILENAME: &str = "fork_db.dat";

/// Callback invoked for each block that becomes irreversible.
///
/// Called while the database lock is held; the callback must not call
/// back into the fork database.
pub type IrreversibleSignal = Box<dyn Fn(&Arc<BlockHeaderState>) + Send + Sync>;

/// Errors surfaced by fork database operations.
#[derive(Debug, thiserror::Error)]
pub enum ForkDbError {
    /// The id (or a required parent) is not in the database.
    #[error("block {0:?} not found in fork database")]
    BlockNotFound(BlockId),

    /// An `add` of an already-present id with duplicates disallowed.
    #[error("duplicate block {0:?}")]
    Duplicate(BlockId),

    /// The database has no root yet; `reset` or `open` must run first.
    #[error("fork database root not set")]
    RootNotSet,

    /// `advance_root` target does not descend from the current root.
    #[error("block {0:?} is not a descendant of the fork database root")]
    NotADescendant(BlockId),

    /// The root cannot be removed.
    #[error("cannot remove fork database root {0:?}")]
    RemoveRoot(BlockId),

    /// Persistence failure at `open`/`close`.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

struct ForkNode {
    state: Arc<BlockHeaderState>,
    validated: bool,
}

#[derive(Default)]
struct ForkDbInner {
    /// The last irreversible ancestor. Not part of `index`.
    root: Option<Arc<BlockHeaderState>>,
    /// Every non-root node, keyed by block id.
    index: HashMap<BlockId, ForkNode>,
    /// Subscriber notified on root advancement.
    irreversible: Option<IrreversibleSignal>,
}

impl ForkDbInner {
    fn root(&self) -> Result<&Arc<BlockHeaderState>, ForkDbError> {
        self.root.as_ref().ok_or(ForkDbError::RootNotSet)
    }

    /// Look up a state by id, root included.
    fn get(&self, id: &BlockId) -> Option<&Arc<BlockHeaderState>> {
        if let Some(root) = &self.root {
            if &root.id == id {
                return Some(root);
            }
        }
        self.index.get(id).map(|node| &node.state)
    }

    /// `a` is preferred over `b` as head: highest block number, then
    /// earliest timestamp, then lexicographically smallest id.
    fn preferred(a: &Arc<BlockHeaderState>, b: &Arc<BlockHeaderState>) -> bool {
        a.block_num()
            .cmp(&b.block_num())
            .then_with(|| b.timestamp().cmp(&a.timestamp()))
            .then_with(|| b.id.cmp(&a.id))
            .is_gt()
    }

    /// Best node among the root and every node passing `filter`.
    fn best<F>(&self, filter: F) -> Option<Arc<BlockHeaderState>>
    where
        F: Fn(&ForkNode) -> bool,
    {
        let mut best = self.root.clone()?;
        for node in self.index.values() {
            if filter(node) && Self::preferred(&node.state, &best) {
                best = node.state.clone();
            }
        }
        Some(best)
    }

    /// Ids of every node in the subtree rooted at `id` (inclusive).
    fn subtree(&self, id: &BlockId) -> Vec<BlockId> {
        let mut members = vec![*id];
        let mut frontier = vec![*id];
        while let Some(parent) = frontier.pop() {
            for (child_id, node) in &self.index {
                if node.state.previous() == parent {
                    members.push(*child_id);
                    frontier.push(*child_id);
                }
            }
        }
        members
    }
}

/// Thread-safe fork tree over shared block header states.
pub struct ForkDatabase {
    data_dir: PathBuf,
    inner: Mutex<ForkDbInner>,
}

impl ForkDatabase {
    /// Create a fork database that persists under `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            inner: Mutex::new(ForkDbInner::default()),
        }
    }

    fn file_path(&self) -> PathBuf {
        self.data_dir.join(FORK_DB_FILENAME)
    }

    fn locked(&self) -> MutexGuard<'_, ForkDbInner> {
        self.inner.lock().expect("fork database mutex poisoned")
    }

    /// Register the callback invoked, in ascending block-number order, for
    /// each block that becomes irreversible during `advance_root`.
    pub fn on_irreversible(&self, signal: IrreversibleSignal) {
        self.locked().irreversible = Some(signal);
    }

    /// Load persisted forks, re-running header validation through the
    /// supplied callback. Missing file means an empty database.
    pub fn open<F>(&self, mut validator: F) -> Result<(), ForkDbError>
    where
        F: FnMut(&BlockHeaderState) -> Result<(), ForkDbError>,
    {
        let path = self.file_path();
        if !path.exists() {
            debug!(path = %path.display(), "No fork database file, starting empty");
            return Ok(());
        }

        let snapshot = persistence::read_snapshot(&path)?;
        info!(
            path = %path.display(),
            blocks = snapshot.blocks.len(),
            root = ?snapshot.root.id,
            "Loaded fork database"
        );

        self.reset(snapshot.root);
        for state in snapshot.blocks {
            validator(&state)?;
            self.add(Arc::new(state), false)?;
        }

        // Restore the head by revalidating its branch.
        let head_id = snapshot.head_id;
        let mut inner = self.locked();
        let mut cursor = head_id;
        while let Some(node) = inner.index.get_mut(&cursor) {
            node.validated = true;
            cursor = node.state.previous();
        }

        Ok(())
    }

    /// Flush the current tree to disk.
    pub fn close(&self) -> Result<(), ForkDbError> {
        let inner = self.locked();
        let Some(root) = inner.root.clone() else {
            return Ok(());
        };

        let mut blocks: Vec<_> = inner
            .index
            .values()
            .map(|node| (*node.state).clone())
            .collect();
        blocks.sort_by_key(|state| (state.block_num(), state.id));

        let head_id = inner
            .best(|node| node.validated)
            .map(|state| state.id)
            .unwrap_or(root.id);

        let snapshot = ForkDbSnapshot {
            root: (*root).clone(),
            blocks,
            head_id,
        };
        drop(inner);

        persistence::write_snapshot(&self.file_path(), &snapshot)?;
        debug!(path = %self.file_path().display(), "Flushed fork database");
        Ok(())
    }

    /// Discard all nodes and install `root_state` as the sole node; the
    /// head becomes the root.
    pub fn reset(&self, root_state: BlockHeaderState) {
        let mut inner = self.locked();
        debug!(root = ?root_state.id, "Resetting fork database");
        inner.index.clear();
        inner.root = Some(Arc::new(root_state));
    }

    /// Clear the validated flag on all non-root nodes; the head becomes
    /// the root.
    pub fn rollback_head_to_root(&self) {
        let mut inner = self.locked();
        for node in inner.index.values_mut() {
            node.validated = false;
        }
    }

    /// Advance the root forward to `id`, which must descend from the
    /// current root. Emits the irreversibility signal for every block on
    /// the path `(root, id]` in ascending order, then frees all nodes
    /// that do not descend from `id`.
    pub fn advance_root(&self, id: &BlockId) -> Result<(), ForkDbError> {
        let mut inner = self.locked();
        let root = inner.root()?.clone();
        if *id == root.id {
            return Ok(());
        }
        if !inner.index.contains_key(id) {
            return Err(ForkDbError::BlockNotFound(*id));
        }

        // Walk from the new root back to the old one.
        let mut path = Vec::new();
        let mut cursor = *id;
        while cursor != root.id {
            let node = inner
                .index
                .get(&cursor)
                .ok_or(ForkDbError::NotADescendant(*id))?;
            path.push(node.state.clone());
            cursor = node.state.previous();
        }
        path.reverse();

        info!(
            old_root = root.block_num().0,
            new_root = id.number().0,
            advanced = path.len(),
            "Advancing fork database root"
        );

        // Irreversibility is announced oldest-first, before any pruning.
        if let Some(signal) = &inner.irreversible {
            for state in &path {
                signal(state);
            }
        }

        let keep: std::collections::HashSet<BlockId> =
            inner.subtree(id).into_iter().collect();
        let before = inner.index.len();
        inner.index.retain(|node_id, _| keep.contains(node_id));
        debug!(pruned = before - inner.index.len(), "Pruned orphaned forks");

        let new_root = inner
            .index
            .remove(id)
            .map(|node| node.state)
            .ok_or(ForkDbError::BlockNotFound(*id))?;
        inner.root = Some(new_root);

        Ok(())
    }

    /// Insert a block state. Its parent must already be present (or be
    /// the root). Re-adding an identical state succeeds only with
    /// `ignore_duplicate`.
    pub fn add(
        &self,
        state: Arc<BlockHeaderState>,
        ignore_duplicate: bool,
    ) -> Result<(), ForkDbError> {
        let mut inner = self.locked();
        let root = inner.root()?.clone();

        if let Some(existing) = inner.get(&state.id) {
            if ignore_duplicate && **existing == *state {
                return Ok(());
            }
            return Err(ForkDbError::Duplicate(state.id));
        }

        let parent = state.previous();
        if parent != root.id && !inner.index.contains_key(&parent) {
            return Err(ForkDbError::BlockNotFound(parent));
        }

        inner.index.insert(
            state.id,
            ForkNode {
                state,
                validated: false,
            },
        );
        Ok(())
    }

    /// Delete the subtree rooted at `id`.
    pub fn remove(&self, id: &BlockId) -> Result<(), ForkDbError> {
        let mut inner = self.locked();
        if let Some(root) = &inner.root {
            if root.id == *id {
                return Err(ForkDbError::RemoveRoot(*id));
            }
        }
        if !inner.index.contains_key(id) {
            return Err(ForkDbError::BlockNotFound(*id));
        }

        for member in inner.subtree(id) {
            inner.index.remove(&member);
        }
        Ok(())
    }

    /// Set a node's validated flag, making it a head candidate.
    pub fn mark_valid(&self, state: &Arc<BlockHeaderState>) -> Result<(), ForkDbError> {
        let mut inner = self.locked();
        let node = inner
            .index
            .get_mut(&state.id)
            .ok_or(ForkDbError::BlockNotFound(state.id))?;
        node.validated = true;
        Ok(())
    }

    /// The current root (last irreversible ancestor).
    pub fn root(&self) -> Option<Arc<BlockHeaderState>> {
        self.locked().root.clone()
    }

    /// Highest-numbered validated node; ties broken by earliest
    /// timestamp, then lexicographically by block id.
    pub fn head(&self) -> Option<Arc<BlockHeaderState>> {
        self.locked().best(|node| node.validated)
    }

    /// Highest-numbered node regardless of the validated flag (same
    /// tie-break as `head`).
    pub fn pending_head(&self) -> Option<Arc<BlockHeaderState>> {
        self.locked().best(|_| true)
    }

    /// Look up a block state by id (root included).
    pub fn get_block(&self, id: &BlockId) -> Option<Arc<BlockHeaderState>> {
        self.locked().get(id).cloned()
    }

    /// The path from the root (exclusive) to `h` (inclusive), in
    /// descending block-number order, dropping entries with a number
    /// greater than `trim_after_num`.
    pub fn fetch_branch(
        &self,
        h: &BlockId,
        trim_after_num: BlockNum,
    ) -> Result<Vec<Arc<BlockHeaderState>>, ForkDbError> {
        let inner = self.locked();
        let root = inner.root()?;
        if *h != root.id && !inner.index.contains_key(h) {
            return Err(ForkDbError::BlockNotFound(*h));
        }

        let mut branch = Vec::new();
        let mut cursor = *h;
        while let Some(node) = inner.index.get(&cursor) {
            if node.state.block_num() <= trim_after_num {
                branch.push(node.state.clone());
            }
            cursor = node.state.previous();
        }
        Ok(branch)
    }

    /// Walk from `h` toward the root until a block numbered `block_num`
    /// is found; empty if the branch does not reach that number.
    pub fn search_on_branch(
        &self,
        h: &BlockId,
        block_num: BlockNum,
    ) -> Option<Arc<BlockHeaderState>> {
        let inner = self.locked();
        let mut cursor = *h;
        while let Some(state) = inner.get(&cursor).cloned() {
            match state.block_num().cmp(&block_num) {
                std::cmp::Ordering::Equal => return Some(state),
                std::cmp::Ordering::Less => return None,
                std::cmp::Ordering::Greater => {
                    cursor = state.previous();
                }
            }
        }
        None
    }

    /// Given two blocks, return the two branches of the fork graph that
    /// end with a common ancestor (same prior block). The ancestor itself
    /// is excluded.
    #[allow(clippy::type_complexity)]
    pub fn fetch_branch_from(
        &self,
        first: &BlockId,
        second: &BlockId,
    ) -> Result<(Vec<Arc<BlockHeaderState>>, Vec<Arc<BlockHeaderState>>), ForkDbError> {
        let inner = self.locked();

        let mut first_state = inner
            .get(first)
            .cloned()
            .ok_or(ForkDbError::BlockNotFound(*first))?;
        let mut second_state = inner
            .get(second)
            .cloned()
            .ok_or(ForkDbError::BlockNotFound(*second))?;

        let mut first_branch = Vec::new();
        let mut second_branch = Vec::new();

        let step = |state: &Arc<BlockHeaderState>| -> Result<Arc<BlockHeaderState>, ForkDbError> {
            let parent = state.previous();
            inner
                .get(&parent)
                .cloned()
                .ok_or(ForkDbError::BlockNotFound(parent))
        };

        // Bring the deeper side up to equal height.
        while first_state.block_num() > second_state.block_num() {
            first_branch.push(first_state.clone());
            first_state = step(&first_state)?;
        }
        while second_state.block_num() > first_state.block_num() {
            second_branch.push(second_state.clone());
            second_state = step(&second_state)?;
        }

        // Walk both sides in lockstep until the ids meet.
        while first_state.id != second_state.id {
            first_branch.push(first_state.clone());
            second_branch.push(second_state.clone());
            first_state = step(&first_state)?;
            second_state = step(&second_state)?;
        }

        Ok((first_branch, second_branch))
    }
}

impl std::fmt::Debug for ForkDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.locked();
        f.debug_struct("ForkDatabase")
            .field("root", &inner.root.as_ref().map(|r| r.id))
            .field("nodes", &inner.index.len())
            .finish()
    }
}

impl Drop for ForkDatabase {
    fn drop(&mut self) {
        let has_root = self.locked().root.is_some();
        if has_root {
            if let Err(e) = self.close() {
                warn!(error = %e, "Failed to flush fork database on drop");
            }
        }
    }
}
