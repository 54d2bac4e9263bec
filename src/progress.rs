//! Run counters and ETA estimation.

use serde::Serialize;
use std::time::{Duration, Instant};

/// Formats an ETA from elapsed time and the completed-item rate.
pub fn eta_string(elapsed: Duration, done: u64, total: u64) -> String {
    if done == 0 {
        return "ETA: n/a".to_string();
    }

    let rate = done as f64 / elapsed.as_secs_f64().max(1e-6);
    if rate <= 0.0 {
        return "ETA: n/a".to_string();
    }

    let remaining = total.saturating_sub(done);
    let secs = (remaining as f64 / rate) as u64;
    format!("ETA ~ {}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Tracks how many of the targeted items have been attempted.
#[derive(Debug, Clone)]
pub struct EtaEstimator {
    started: Instant,
    total: u64,
    done: u64,
}

impl EtaEstimator {
    pub fn new(total: u64) -> Self {
        Self { started: Instant::now(), total, done: 0 }
    }

    /// Records one attempted item.
    pub fn tick(&mut self) {
        self.done += 1;
    }

    pub fn done(&self) -> u64 {
        self.done
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Raises the target when more items turn up than were counted.
    pub fn grow_to(&mut self, total: u64) {
        self.total = self.total.max(total);
    }

    /// Position of the next item, as `next/total`.
    pub fn position(&self) -> String {
        format!("{}/{}", self.done + 1, self.total.max(self.done + 1))
    }

    /// Returns true once the target number of items has been attempted.
    pub fn is_complete(&self) -> bool {
        self.done >= self.total
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn eta(&self) -> String {
        eta_string(self.elapsed(), self.done, self.total)
    }
}

/// How a single item ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// The field was written (or would have been, in a dry run).
    Updated,
    /// Every attempt finished without a value.
    Missing,
    /// Abandoned because of a challenge page.
    Challenged,
    /// The row stayed locked through all database retries.
    Contended,
    /// The row disappeared before the update.
    NotFound,
    /// Attempts ran out on errors.
    Failed,
}

/// Totals printed when a run ends.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub field: String,
    pub dry_run: bool,
    pub pending: u64,
    pub scanned: u64,
    pub updated: u64,
    pub missing: u64,
    pub challenged: u64,
    pub contended: u64,
    pub not_found: u64,
    pub failed: u64,
    pub challenge_cycles: u64,
    pub longest_challenge_streak: u64,
    pub final_cursor: i64,
    pub elapsed_secs: f64,
    pub interrupted: bool,
}

impl RunSummary {
    pub fn new(field: impl Into<String>, dry_run: bool) -> Self {
        Self { field: field.into(), dry_run, ..Default::default() }
    }

    /// Counts one finished item.
    pub fn record(&mut self, outcome: ItemOutcome) {
        self.scanned += 1;
        let counter = match outcome {
            ItemOutcome::Updated => &mut self.updated,
            ItemOutcome::Missing => &mut self.missing,
            ItemOutcome::Challenged => &mut self.challenged,
            ItemOutcome::Contended => &mut self.contended,
            ItemOutcome::NotFound => &mut self.not_found,
            ItemOutcome::Failed => &mut self.failed,
        };
        *counter += 1;
    }

    /// Labelled counters in display order.
    pub fn rows(&self) -> Vec<(&'static str, String)> {
        vec![
            ("field", self.field.clone()),
            ("dry run", self.dry_run.to_string()),
            ("pending at start", self.pending.to_string()),
            ("scanned", self.scanned.to_string()),
            ("updated", self.updated.to_string()),
            ("missing value", self.missing.to_string()),
            ("skipped (challenge)", self.challenged.to_string()),
            ("contended", self.contended.to_string()),
            ("not found", self.not_found.to_string()),
            ("failed", self.failed.to_string()),
            ("challenge cycles", self.challenge_cycles.to_string()),
            ("longest challenge streak", self.longest_challenge_streak.to_string()),
            ("final cursor", self.final_cursor.to_string()),
            ("elapsed", format!("{:.1}s", self.elapsed_secs)),
            ("interrupted", self.interrupted.to_string()),
        ]
    }
}
