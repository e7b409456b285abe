//! Progress tracking for migration runs.
//!
//! This module provides the `ProgressTracker`, which owns the phase state machine of a run,
//! broadcasts every `ProgressEvent` to any number of subscribers and keeps running counters from
//! which statistics are derived without replaying the event log.
//!
//! Each subscriber gets its own `broadcast::Receiver`, so every one of them reads the stream at
//! its own pace. A bounded history of the same events is kept for synchronous queries.

use crate::migration::events::{MigrationPhase, ProgressEvent, ProgressEventKind};
use crate::utils::percentage;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Events retained for synchronous queries by default.
pub const DEFAULT_EVENT_HISTORY: usize = 1000;

#[derive(Debug)]
struct TrackerState {
    phase: MigrationPhase,
    history: VecDeque<ProgressEvent>,
    total: usize,
    processed: usize,
    successful: usize,
    failed: usize,
    conflicts: usize,
    started_at: DateTime<Utc>,
}

impl TrackerState {
    fn new() -> Self {
        Self {
            phase: MigrationPhase::Initializing,
            history: VecDeque::new(),
            total: 0,
            processed: 0,
            successful: 0,
            failed: 0,
            conflicts: 0,
            started_at: Utc::now(),
        }
    }

    fn percentage(&self) -> f64 {
        percentage(self.processed, self.total)
    }
}

/// Phase tracker and event broadcaster for one orchestrator
///
/// The tracker is shared (`Arc`) between the orchestrator, which records progress, and any
/// number of observers, which subscribe or pull statistics.
#[derive(Debug)]
pub struct ProgressTracker {
    sender: broadcast::Sender<ProgressEvent>,
    state: Mutex<TrackerState>,
    history_limit: usize,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_HISTORY)
    }
}

impl ProgressTracker {
    /// Create a tracker keeping at most `history_limit` events.
    ///
    /// The broadcast buffer has the same capacity; a subscriber that falls further behind
    /// receives `RecvError::Lagged` and can catch up from `events()`.
    pub fn new(history_limit: usize) -> Self {
        let history_limit = history_limit.max(1);
        let (sender, _) = broadcast::channel(history_limit);
        Self {
            sender,
            state: Mutex::new(TrackerState::new()),
            history_limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Subscribe to events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Reset counters and history for a fresh run and enter `Initializing`.
    pub fn start(&self) {
        let mut state = self.lock();
        *state = TrackerState::new();
        let event = ProgressEvent::new(
            ProgressEventKind::PhaseStarted,
            MigrationPhase::Initializing,
            format!("Phase {} started", MigrationPhase::Initializing),
        )
        .with_percentage(0.0);
        self.emit_locked(&mut state, event);
    }

    /// Set the number of entities the run expects to process.
    pub fn set_total(&self, total: usize) {
        self.lock().total = total;
    }

    pub fn current_phase(&self) -> MigrationPhase {
        self.lock().phase
    }

    /// Move to `next`, closing the current phase first.
    ///
    /// Phases may be skipped; the tracker only observes.
    pub fn update_phase(&self, next: MigrationPhase) {
        let mut state = self.lock();
        let current = state.phase;
        let pct = state.percentage();

        let completed = ProgressEvent::new(
            ProgressEventKind::PhaseCompleted,
            current,
            format!("Phase {} completed", current),
        )
        .with_percentage(pct);
        self.emit_locked(&mut state, completed);

        state.phase = next;
        let started = ProgressEvent::new(
            ProgressEventKind::PhaseStarted,
            next,
            format!("Phase {} started", next),
        )
        .with_percentage(pct);
        self.emit_locked(&mut state, started);

        debug!("Migration phase {} -> {}", current, next);
    }

    /// Record a successfully written entity.
    pub fn record_success(&self, entity_id: &str, message: impl Into<String>) {
        let mut state = self.lock();
        state.processed += 1;
        state.successful += 1;
        let event = ProgressEvent::new(
            ProgressEventKind::OperationSucceeded,
            state.phase,
            message,
        )
        .with_percentage(state.percentage())
        .with_entity(entity_id);
        self.emit_locked(&mut state, event);
    }

    /// Record an entity that could not be written.
    pub fn record_failure(&self, entity_id: &str, error: impl Into<String>) {
        let mut state = self.lock();
        state.processed += 1;
        state.failed += 1;
        let error = error.into();
        let event = ProgressEvent::new(
            ProgressEventKind::OperationFailed,
            state.phase,
            format!("Failed to migrate {}: {}", entity_id, error),
        )
        .with_percentage(state.percentage())
        .with_entity(entity_id)
        .with_metadata("error", serde_json::Value::String(error));
        self.emit_locked(&mut state, event);
    }

    /// Record a reconciled conflict. Does not count as processed on its own.
    pub fn record_conflict(&self, entity_id: &str, resolution: impl Into<String>) {
        let mut state = self.lock();
        state.conflicts += 1;
        let event = ProgressEvent::new(
            ProgressEventKind::ConflictResolved,
            state.phase,
            resolution,
        )
        .with_entity(entity_id);
        self.emit_locked(&mut state, event);
    }

    pub fn warn(&self, message: impl Into<String>, entity_id: Option<&str>) {
        let mut state = self.lock();
        let mut event = ProgressEvent::new(ProgressEventKind::Warning, state.phase, message);
        if let Some(id) = entity_id {
            event = event.with_entity(id);
        }
        self.emit_locked(&mut state, event);
    }

    /// Finish the run successfully.
    pub fn complete(&self, message: impl Into<String>) {
        self.update_phase(MigrationPhase::Completed);
        let mut state = self.lock();
        let event = ProgressEvent::new(
            ProgressEventKind::MigrationCompleted,
            MigrationPhase::Completed,
            message,
        )
        .with_percentage(100.0);
        self.emit_locked(&mut state, event);
        info!(
            "Migration completed: {}/{} processed, {} failed",
            state.processed, state.total, state.failed
        );
    }

    /// Abort the run.
    pub fn fail(&self, error: impl Into<String>) {
        self.update_phase(MigrationPhase::Failed);
        let mut state = self.lock();
        let error = error.into();
        let pct = state.percentage();
        let event = ProgressEvent::new(
            ProgressEventKind::MigrationFailed,
            MigrationPhase::Failed,
            error.clone(),
        )
        .with_percentage(pct);
        self.emit_locked(&mut state, event);
        warn!("Migration failed: {}", error);
    }

    /// All retained events, oldest first.
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.lock().history.iter().cloned().collect()
    }

    pub fn events_of_kind(&self, kind: ProgressEventKind) -> Vec<ProgressEvent> {
        self.lock()
            .history
            .iter()
            .filter(|event| event.kind == kind)
            .cloned()
            .collect()
    }

    /// Snapshot of the running counters.
    pub fn statistics(&self) -> ProgressStatistics {
        let state = self.lock();
        ProgressStatistics {
            phase: state.phase,
            total: state.total,
            processed: state.processed,
            successful: state.successful,
            failed: state.failed,
            conflicts: state.conflicts,
            progress_percentage: state.percentage(),
            success_rate: percentage(state.successful, state.processed),
            elapsed_ms: (Utc::now() - state.started_at).num_milliseconds().max(0),
        }
    }

    // History push and broadcast happen under the same lock so that every subscriber sees the
    // history order.
    fn emit_locked(&self, state: &mut TrackerState, event: ProgressEvent) {
        if state.history.len() == self.history_limit {
            state.history.pop_front();
        }
        state.history.push_back(event.clone());
        // No subscribers is fine
        let _ = self.sender.send(event);
    }
}

/// Statistics about the current run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressStatistics {
    pub phase: MigrationPhase,
    pub total: usize,
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub conflicts: usize,
    pub progress_percentage: f64,
    pub success_rate: f64,
    pub elapsed_ms: i64,
}

impl ProgressStatistics {
    /// Get a human-readable summary of the statistics
    pub fn summary(&self) -> String {
        format!(
            "{}: {}/{} processed ({:.1}%), {} ok, {} failed, {} conflicts",
            self.phase,
            self.processed,
            self.total,
            self.progress_percentage,
            self.successful,
            self.failed,
            self.conflicts
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_phase_emits_completed_then_started() {
        let tracker = ProgressTracker::default();
        tracker.start();
        tracker.update_phase(MigrationPhase::Validating);

        let events = tracker.events();
        let kinds: Vec<_> = events.iter().map(|e| (e.kind, e.phase)).collect();
        assert_eq!(
            kinds,
            vec![
                (ProgressEventKind::PhaseStarted, MigrationPhase::Initializing),
                (ProgressEventKind::PhaseCompleted, MigrationPhase::Initializing),
                (ProgressEventKind::PhaseStarted, MigrationPhase::Validating),
            ]
        );
        assert_eq!(tracker.current_phase(), MigrationPhase::Validating);
    }

    #[test]
    fn statistics_are_zero_without_work() {
        let tracker = ProgressTracker::default();
        tracker.start();
        let stats = tracker.statistics();
        assert_eq!(stats.progress_percentage, 0.0);
        assert_eq!(stats.success_rate, 0.0);
    }

    #[test]
    fn statistics_follow_counters() {
        let tracker = ProgressTracker::default();
        tracker.start();
        tracker.set_total(4);
        tracker.record_success("a", "ok");
        tracker.record_success("b", "ok");
        tracker.record_success("c", "ok");
        tracker.record_failure("d", "disk full");

        let stats = tracker.statistics();
        assert_eq!(stats.progress_percentage, 100.0);
        assert_eq!(stats.success_rate, 75.0);
        assert_eq!(stats.failed, 1);

        let failures = tracker.events_of_kind(ProgressEventKind::OperationFailed);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].entity_id.as_deref(), Some("d"));
    }

    #[test]
    fn skipping_phases_is_allowed() {
        let tracker = ProgressTracker::default();
        tracker.start();
        tracker.update_phase(MigrationPhase::Finalizing);
        assert_eq!(tracker.current_phase(), MigrationPhase::Finalizing);
    }

    #[test]
    fn history_is_bounded() {
        let tracker = ProgressTracker::new(3);
        tracker.start();
        for id in ["a", "b", "c", "d"] {
            tracker.record_success(id, "ok");
        }
        let events = tracker.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].entity_id.as_deref(), Some("b"));
    }

    #[test]
    fn start_discards_previous_run() {
        let tracker = ProgressTracker::default();
        tracker.start();
        tracker.set_total(1);
        tracker.record_failure("a", "x");
        tracker.start();

        assert_eq!(tracker.events().len(), 1);
        assert_eq!(tracker.statistics().failed, 0);
    }

    #[tokio::test]
    async fn subscribers_receive_events_in_order_independently() {
        let tracker = ProgressTracker::default();
        let mut first = tracker.subscribe();
        tracker.start();
        let mut second = tracker.subscribe();
        tracker.update_phase(MigrationPhase::Validating);

        assert_eq!(first.recv().await.unwrap().kind, ProgressEventKind::PhaseStarted);
        assert_eq!(first.recv().await.unwrap().kind, ProgressEventKind::PhaseCompleted);
        assert_eq!(first.recv().await.unwrap().kind, ProgressEventKind::PhaseStarted);

        // joined after `start`, so only sees the phase change
        assert_eq!(second.recv().await.unwrap().kind, ProgressEventKind::PhaseCompleted);
        let started = second.recv().await.unwrap();
        assert_eq!(started.phase, MigrationPhase::Validating);
    }
}
