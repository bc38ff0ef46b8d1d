use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_RETRY_DELETE_N_TIMES: usize = 100;
pub const DEFAULT_RETRY_SLEEP_MS: u64 = 10;

/// Recovery levels. Each level implies all lower ones; the page/undo core
/// only consults them to decide whether to continue past inconsistencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum ForceRecovery {
    #[default]
    Default,
    IgnoreCorrupt,
    NoBackground,
    NoTrxUndo,
    NoIbufMerge,
    NoUndoLogScan,
    NoLogRedo,
}

impl ForceRecovery {
    /// Whether corrupt structures should be tolerated instead of aborting.
    #[inline]
    pub fn ignores_corruption(&self) -> bool {
        *self >= ForceRecovery::IgnoreCorrupt
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // Recovery level the whole engine runs under.
    pub force_recovery: ForceRecovery,
    // How many times a pessimistic delete is retried under file
    // space pressure before the error is surfaced.
    pub retry_delete_n_times: usize,
    // Sleep between pessimistic delete retries.
    pub retry_sleep_ms: u64,
}

impl Default for EngineConfig {
    #[inline]
    fn default() -> Self {
        EngineConfig {
            force_recovery: ForceRecovery::Default,
            retry_delete_n_times: DEFAULT_RETRY_DELETE_N_TIMES,
            retry_sleep_ms: DEFAULT_RETRY_SLEEP_MS,
        }
    }
}

impl EngineConfig {
    #[inline]
    pub fn force_recovery(mut self, level: ForceRecovery) -> Self {
        self.force_recovery = level;
        self
    }

    #[inline]
    pub fn retry_delete_n_times(mut self, n: usize) -> Self {
        self.retry_delete_n_times = n;
        self
    }

    #[inline]
    pub fn retry_sleep_ms(mut self, ms: u64) -> Self {
        self.retry_sleep_ms = ms;
        self
    }

    #[inline]
    pub fn retry_sleep(&self) -> Duration {
        Duration::from_millis(self.retry_sleep_ms)
    }
}
