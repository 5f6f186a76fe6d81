//! Consensus configuration.

use std::time::Duration;

/// Tunables for the QC chain and pacemaker.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Number of consecutive `beat()` calls a round may sit in
    /// `VotesAccumulating` before it is abandoned to the next phase
    /// counter.
    pub round_timeout_beats: u32,

    /// Enable the core-mutex profiler.
    pub core_profiling: bool,

    /// Interval between profiler reports.
    pub profiling_report_interval: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            round_timeout_beats: 6,
            core_profiling: false,
            profiling_report_interval: Duration::from_secs(10),
        }
    }
}
