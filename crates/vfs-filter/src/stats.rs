//! Statistics collection for the projection filter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::modified_paths::{ModificationSummary, ModifiedPathsDatabase};

/// Callback kinds counted by [`FilterCounters`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Callback {
    Create,
    Read,
    Write,
    Delete,
    Rename,
    Import,
    QueryAttributes,
    Enumerate,
    Close,
    Cancel,
}

impl Callback {
    const COUNT: usize = 10;

    fn index(self) -> usize {
        self as usize
    }
}

/// Live counters updated by the dispatcher.
#[derive(Default)]
pub struct FilterCounters {
    callbacks: [AtomicU64; Callback::COUNT],
    materializations: AtomicU64,
    lost_race_retries: AtomicU64,
    stale_refreshes: AtomicU64,
    failures: AtomicU64,
}

impl FilterCounters {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one callback.
    pub fn callback(&self, callback: Callback) {
        self.callbacks[callback.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Count one placeholder promoted to full content.
    pub fn materialization(&self) {
        self.materializations.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one retry after a lost compare-and-set.
    pub fn lost_race_retry(&self) {
        self.lost_race_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one placeholder metadata refresh.
    pub fn stale_refresh(&self) {
        self.stale_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one callback that returned a failure status.
    pub fn failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    fn callback_count(&self, callback: Callback) -> u64 {
        self.callbacks[callback.index()].load(Ordering::Relaxed)
    }
}

/// Snapshot of filter statistics.
#[derive(Debug, Clone, Default)]
pub struct FilterStats {
    pub creates: u64,
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
    pub renames: u64,
    pub imports: u64,
    pub query_attributes: u64,
    pub enumerations: u64,
    pub closes: u64,
    pub cancels: u64,
    /// Backing-store content fetches completed.
    pub fetches: u64,
    pub materializations: u64,
    pub lost_race_retries: u64,
    pub stale_refreshes: u64,
    /// Callbacks that returned a failure status.
    pub failures: u64,
    /// Currently open handles.
    pub open_handles: usize,
    /// Time since the dispatcher was created.
    pub uptime_secs: u64,
    /// Summary of file/directory modifications.
    pub modification_summary: ModificationSummary,
}

impl FilterStats {
    /// Format stats as a display grid.
    ///
    /// # Returns
    /// Multi-line string with formatted statistics.
    pub fn display_grid(&self) -> String {
        let rule: &str = "╠══════════════════════════════════════════════════════════╣";
        let row = |label: &str, value: String| format!("║   {:<18}{:>37} ║", label, value);
        let mut lines: Vec<String> = Vec::new();

        lines.push("╔══════════════════════════════════════════════════════════╗".to_string());
        lines.push("║                Projection Filter Statistics              ║".to_string());
        lines.push(rule.to_string());
        lines.push(format!("║ Uptime: {:>44} sec ║", self.uptime_secs));
        lines.push(format!("║ Open handles: {:>42} ║", self.open_handles));
        lines.push(rule.to_string());

        lines.push("║ Callbacks                                                ║".to_string());
        for (label, value) in [
            ("Create:", self.creates),
            ("Read:", self.reads),
            ("Write:", self.writes),
            ("Delete:", self.deletes),
            ("Rename:", self.renames),
            ("Import:", self.imports),
            ("Query attributes:", self.query_attributes),
            ("Enumerate:", self.enumerations),
            ("Close:", self.closes),
            ("Cancel:", self.cancels),
            ("Failures:", self.failures),
        ] {
            lines.push(row(label, value.to_string()));
        }
        lines.push(rule.to_string());

        lines.push("║ Content                                                  ║".to_string());
        lines.push(row("Fetches:", self.fetches.to_string()));
        lines.push(row("Materialized:", self.materializations.to_string()));
        lines.push(row("Lost races:", self.lost_race_retries.to_string()));
        lines.push(row("Stale refreshes:", self.stale_refreshes.to_string()));
        lines.push(rule.to_string());

        let summary: &ModificationSummary = &self.modification_summary;
        lines.push("║ Modifications                                            ║".to_string());
        lines.push(row("Files created:", summary.created_files.len().to_string()));
        lines.push(row("Files modified:", summary.modified_files.len().to_string()));
        lines.push(row("Files deleted:", summary.deleted_files.len().to_string()));
        lines.push(row("Dirs created:", summary.created_dirs.len().to_string()));
        lines.push(row("Dirs deleted:", summary.deleted_dirs.len().to_string()));

        lines.push("╚══════════════════════════════════════════════════════════╝".to_string());
        lines.join("\n")
    }
}

/// Collects statistics from a running dispatcher.
///
/// Thread-safe and cloneable for use from background stats threads.
#[derive(Clone)]
pub struct FilterStatsCollector {
    counters: Arc<FilterCounters>,
    modified_paths: Arc<ModifiedPathsDatabase>,
    start_time: Instant,
}

impl FilterStatsCollector {
    /// Create a new stats collector.
    ///
    /// # Arguments
    /// * `counters` - Live counters
    /// * `modified_paths` - Modified paths database reference
    /// * `start_time` - When the dispatcher was created
    pub fn new(
        counters: Arc<FilterCounters>,
        modified_paths: Arc<ModifiedPathsDatabase>,
        start_time: Instant,
    ) -> Self {
        Self {
            counters,
            modified_paths,
            start_time,
        }
    }

    /// Collect current statistics.
    ///
    /// # Arguments
    /// * `fetches` - Completed backing fetches
    /// * `open_handles` - Currently open handles
    pub fn collect(&self, fetches: u64, open_handles: usize) -> FilterStats {
        let c: &FilterCounters = &self.counters;
        FilterStats {
            creates: c.callback_count(Callback::Create),
            reads: c.callback_count(Callback::Read),
            writes: c.callback_count(Callback::Write),
            deletes: c.callback_count(Callback::Delete),
            renames: c.callback_count(Callback::Rename),
            imports: c.callback_count(Callback::Import),
            query_attributes: c.callback_count(Callback::QueryAttributes),
            enumerations: c.callback_count(Callback::Enumerate),
            closes: c.callback_count(Callback::Close),
            cancels: c.callback_count(Callback::Cancel),
            fetches,
            materializations: c.materializations.load(Ordering::Relaxed),
            lost_race_retries: c.lost_race_retries.load(Ordering::Relaxed),
            stale_refreshes: c.stale_refreshes.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            open_handles,
            uptime_secs: self.start_time.elapsed().as_secs(),
            modification_summary: self.modified_paths.get_summary(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_default() {
        let stats = FilterStats::default();
        assert_eq!(stats.uptime_secs, 0);
        assert_eq!(stats.fetches, 0);
        assert!(stats.modification_summary.is_empty());
    }

    #[test]
    fn test_collector_counts() {
        let counters = Arc::new(FilterCounters::new());
        let modified_paths = Arc::new(ModifiedPathsDatabase::new());
        let collector = FilterStatsCollector::new(counters.clone(), modified_paths.clone(), Instant::now());

        counters.callback(Callback::Create);
        counters.callback(Callback::Create);
        counters.callback(Callback::Enumerate);
        counters.materialization();
        counters.failure();
        modified_paths.file_created("a.txt");

        let stats: FilterStats = collector.collect(7, 2);
        assert_eq!(stats.creates, 2);
        assert_eq!(stats.enumerations, 1);
        assert_eq!(stats.reads, 0);
        assert_eq!(stats.materializations, 1);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.fetches, 7);
        assert_eq!(stats.open_handles, 2);
        assert_eq!(stats.modification_summary.created_files.len(), 1);
        assert!(stats.uptime_secs < 1);
    }

    #[test]
    fn test_display_grid_format() {
        let stats = FilterStats {
            uptime_secs: 120,
            fetches: 1000,
            lost_race_retries: 3,
            ..Default::default()
        };

        let grid: String = stats.display_grid();
        assert!(grid.contains("Projection Filter Statistics"));
        assert!(grid.contains("Uptime:"));
        assert!(grid.contains("120"));
        assert!(grid.contains("Fetches:"));
        assert!(grid.contains("1000"));
        assert!(grid.contains("Lost races:"));
    }
}
