//! Pacemaker: the adapter between the chain controller and the QC chain.
//!
//! Every entry point into consensus - `beat`, `on_accepted_block`, and
//! the inbound message handlers - funnels through one global mutex, so at
//! most one consensus transition runs at a time. Chain-state reads used
//! by the QC chain (`proposer`, `leader`, head id, committee) come from a
//! snapshot refreshed on each accepted block under a separate, short-held
//! mutex.
//!
//! Observers call [`ChainPacemaker::get_state`], which is kept off the
//! consensus hot path by a read-through cache: a monotone state-version
//! counter is compared without any lock, and only a stale cache enters
//! the global mutex to reread.

use crate::config::ConsensusConfig;
use crate::qc_chain::{FinalizerState, QcChain};
use crate::traits::{ChainController, MessageSink, PacemakerView};
use instafin_types::{
    BlockHeaderState, BlockId, BlsKeyPair, FinalizerPolicy, NewBlockMessage, NewViewMessage,
    ProducerId, ProposalMessage, VoteMessage,
};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::info;

// ═══════════════════════════════════════════════════════════════════════════
// Core profiling instrumentation
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct EntryStat {
    total: Duration,
    max: Duration,
    count: u64,
}

struct ProfilerStats {
    first_request: Option<Instant>,
    last_report: Option<Instant>,
    /// Total time all callers spent waiting on the core lock.
    total_wait: Duration,
    /// Total number of core entries.
    requests: u64,
    per_entry: HashMap<&'static str, EntryStat>,
}

/// Measures time-in-mutex and per-entry-point service time, emitting a
/// rolling report on a fixed interval.
struct CoreProfiler {
    enabled: bool,
    report_interval: Duration,
    stats: Mutex<ProfilerStats>,
}

impl CoreProfiler {
    fn new(enabled: bool, report_interval: Duration) -> Self {
        Self {
            enabled,
            report_interval,
            stats: Mutex::new(ProfilerStats {
                first_request: None,
                last_report: None,
                total_wait: Duration::ZERO,
                requests: 0,
                per_entry: HashMap::new(),
            }),
        }
    }

    fn record(&self, name: &'static str, requested: Instant, entered: Instant, done: Instant) {
        if !self.enabled {
            return;
        }
        let mut stats = self.stats.lock().expect("profiler mutex poisoned");

        stats.total_wait += entered.duration_since(requested);
        stats.requests += 1;
        if stats.first_request.is_none() {
            stats.first_request = Some(entered);
            stats.last_report = Some(entered);
        }

        let service = done.duration_since(entered);
        let entry = stats.per_entry.entry(name).or_default();
        entry.total += service;
        entry.count += 1;
        if service > entry.max {
            entry.max = service;
        }

        let due = stats
            .last_report
            .is_some_and(|last| done.duration_since(last) >= self.report_interval);
        if due {
            stats.last_report = Some(done);
            Self::report(&stats);
        }
    }

    fn report(stats: &ProfilerStats) {
        let avg_wait_us = stats.total_wait.as_micros() as u64 / stats.requests.max(1);
        info!(
            total_wait_us = stats.total_wait.as_micros() as u64,
            requests = stats.requests,
            avg_wait_us,
            "Consensus core contention"
        );
        for (name, entry) in &stats.per_entry {
            let avg_us = entry.total.as_micros() as u64 / entry.count.max(1);
            info!(
                entry = name,
                total_us = entry.total.as_micros() as u64,
                max_us = entry.max.as_micros() as u64,
                count = entry.count,
                avg_us,
                "Consensus core entry"
            );
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Pacemaker
// ═══════════════════════════════════════════════════════════════════════════

struct ChainStateSnapshot {
    head: Arc<BlockHeaderState>,
    finalizers: Arc<FinalizerPolicy>,
}

struct CachedState {
    version: u64,
    state: FinalizerState,
}

/// Serializes all consensus entry points and adapts the chain controller
/// to the QC chain.
pub struct ChainPacemaker {
    controller: Arc<dyn ChainController>,
    sink: Arc<dyn MessageSink>,

    /// The consensus global mutex.
    qc_chain: Mutex<QcChain>,

    /// Head snapshot read by `PacemakerView` accessors.
    chain_state: Mutex<ChainStateSnapshot>,

    /// Monotone counter bumped by the QC chain on every state change.
    state_version: Arc<AtomicU64>,
    /// Version of the state held in `state_cache`.
    cached_version: AtomicU64,
    /// Observer cache, refreshed only when the version counter moves.
    state_cache: RwLock<CachedState>,

    profiler: CoreProfiler,
}

impl ChainPacemaker {
    /// Create a pacemaker for a node operating `my_producers` and holding
    /// `finalizer_keys`.
    pub fn new(
        controller: Arc<dyn ChainController>,
        sink: Arc<dyn MessageSink>,
        my_producers: HashSet<ProducerId>,
        finalizer_keys: Vec<BlsKeyPair>,
        config: ConsensusConfig,
    ) -> Self {
        let chain = QcChain::new(my_producers, finalizer_keys, config.clone());
        let state_version = chain.state_version_handle();
        let head = controller.head_block_state();
        let finalizers = controller.active_finalizer_policy();

        Self {
            controller,
            sink,
            qc_chain: Mutex::new(chain),
            chain_state: Mutex::new(ChainStateSnapshot { head, finalizers }),
            state_version,
            cached_version: AtomicU64::new(u64::MAX),
            state_cache: RwLock::new(CachedState {
                version: u64::MAX,
                state: FinalizerState::default(),
            }),
            profiler: CoreProfiler::new(config.core_profiling, config.profiling_report_interval),
        }
    }

    fn head_snapshot(&self) -> MutexGuard<'_, ChainStateSnapshot> {
        self.chain_state.lock().expect("chain state mutex poisoned")
    }

    /// Run `f` inside the consensus global mutex, profiled under `name`.
    fn with_core<R>(&self, name: &'static str, f: impl FnOnce(&mut QcChain) -> R) -> R {
        let requested = Instant::now();
        let mut chain = self.qc_chain.lock().expect("consensus mutex poisoned");
        let entered = Instant::now();
        let result = f(&mut *chain);
        drop(chain);
        self.profiler.record(name, requested, entered, Instant::now());
        result
    }

    /// Pulse from the block-production loop.
    pub fn beat(&self) {
        self.with_core("beat", |chain| chain.on_beat(self, &*self.sink));
    }

    /// A block was accepted by the controller: refresh the head snapshot,
    /// then let the QC chain observe it.
    pub fn on_accepted_block(&self, block: Arc<BlockHeaderState>) {
        {
            let mut snapshot = self.head_snapshot();
            snapshot.head = block.clone();
            snapshot.finalizers = self.controller.active_finalizer_policy();
        }
        self.with_core("acpt", |chain| chain.on_accepted_block(&block));
    }

    /// Inbound proposal handler.
    pub fn on_hs_proposal_msg(&self, msg: ProposalMessage) {
        self.with_core("prop", |chain| {
            chain.on_proposal_msg(&msg, self, &*self.sink)
        });
    }

    /// Inbound vote handler.
    pub fn on_hs_vote_msg(&self, msg: VoteMessage) {
        self.with_core("vote", |chain| chain.on_vote_msg(&msg, self, &*self.sink));
    }

    /// Inbound new-view handler.
    pub fn on_hs_new_view_msg(&self, msg: NewViewMessage) {
        self.with_core("view", |chain| chain.on_new_view_msg(&msg, self));
    }

    /// Inbound new-block handler.
    pub fn on_hs_new_block_msg(&self, msg: NewBlockMessage) {
        self.with_core("nblk", |chain| chain.on_new_block_msg(&msg, self));
    }

    /// Observer snapshot of the QC chain.
    ///
    /// The fast path is one atomic load and a shared read of the cache;
    /// the consensus mutex is entered only when the cache is stale.
    pub fn get_state(&self) -> FinalizerState {
        let current = self.state_version.load(Ordering::Acquire);
        if self.cached_version.load(Ordering::Acquire) != current {
            let mut fresh = FinalizerState::default();
            let fresh_version = self.with_core("stat", |chain| {
                // Reread inside the lock: the version may have moved again.
                let version = self.state_version.load(Ordering::Acquire);
                chain.get_state(&mut fresh);
                version
            });

            if self.cached_version.load(Ordering::Acquire) != fresh_version {
                let mut cache = self.state_cache.write();
                cache.version = fresh_version;
                cache.state = fresh;
                self.cached_version.store(fresh_version, Ordering::Release);
            }
        }

        self.state_cache.read().state.clone()
    }
}

impl PacemakerView for ChainPacemaker {
    fn proposer(&self) -> ProducerId {
        self.head_snapshot().head.producer()
    }

    fn leader(&self) -> ProducerId {
        self.head_snapshot().head.producer()
    }

    fn next_leader(&self) -> ProducerId {
        let snapshot = self.head_snapshot();
        let next_slot = snapshot.head.timestamp().next();
        snapshot
            .head
            .get_scheduled_producer(next_slot)
            .unwrap_or_else(|| snapshot.head.producer())
    }

    fn finalizers(&self) -> Arc<FinalizerPolicy> {
        self.head_snapshot().finalizers.clone()
    }

    fn current_block_id(&self) -> BlockId {
        self.head_snapshot().head.id
    }

    fn quorum_threshold(&self) -> u64 {
        self.head_snapshot().finalizers.threshold
    }
}
