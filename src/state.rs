use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::catalog::Catalog;
use crate::config::{Config, DetectionConfig};
use crate::pipeline::{DetectError, DetectionEvent, DetectionReport};
use crate::runner::Runner;
use crate::types::Pass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Latest progress message of the current run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunProgress {
    pub pass: Pass,
    pub processed: usize,
    pub total: usize,
    pub item_name: String,
}

pub struct AppStateInner {
    pub phase: RunPhase,
    /// Increments per run; updates from older runs are dropped.
    pub run_id: u64,
    pub progress: Option<RunProgress>,
    pub last_status: Option<String>,
    pub last_report: Option<DetectionReport>,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub config: Config,
    pub detection: Arc<DetectionConfig>,
    pub catalog: Arc<Catalog>,
    pub runner: Runner,
}

pub type AppState = Arc<Mutex<AppStateInner>>;

impl AppStateInner {
    pub fn new(config: Config, catalog: Catalog) -> Self {
        let detection = Arc::new(config.detection.clone());
        Self {
            phase: RunPhase::Idle,
            run_id: 0,
            progress: None,
            last_status: None,
            last_report: None,
            last_error: None,
            started_at: None,
            finished_at: None,
            config,
            detection,
            catalog: Arc::new(catalog),
            runner: Runner::new(),
        }
    }

    /// Reset per-run fields and return the new run id.
    pub fn begin_run(&mut self) -> u64 {
        self.run_id += 1;
        self.phase = RunPhase::Running;
        self.progress = None;
        self.last_status = None;
        self.last_error = None;
        self.started_at = Some(Utc::now());
        self.finished_at = None;
        self.run_id
    }

    pub fn apply_event(&mut self, run_id: u64, event: &DetectionEvent) {
        if run_id != self.run_id {
            return;
        }
        match event {
            DetectionEvent::Progress {
                phase,
                processed,
                total,
                item_name,
            } => {
                self.progress = Some(RunProgress {
                    pass: *phase,
                    processed: *processed,
                    total: *total,
                    item_name: item_name.clone(),
                });
            }
            DetectionEvent::Status { message } => self.last_status = Some(message.clone()),
            DetectionEvent::Debug { message } => tracing::trace!("run {run_id}: {message}"),
            // terminal outcome arrives through finish_run
            DetectionEvent::Result(_) | DetectionEvent::Error { .. } => {}
        }
    }

    pub fn finish_run(&mut self, run_id: u64, outcome: Result<DetectionReport, DetectError>) {
        if run_id != self.run_id {
            tracing::debug!("ignoring outcome of stale run {run_id}");
            return;
        }
        self.finished_at = Some(Utc::now());
        match outcome {
            Ok(report) => {
                self.phase = RunPhase::Completed;
                self.last_report = Some(report);
            }
            Err(DetectError::Cancelled) => {
                self.phase = RunPhase::Cancelled;
                self.last_error = Some(DetectError::Cancelled.to_string());
            }
            Err(e) => {
                self.phase = RunPhase::Failed;
                self.last_error = Some(e.to_string());
            }
        }
    }

    /// Seconds the current or last run took.
    pub fn elapsed_secs(&self) -> Option<f64> {
        let started = self.started_at?;
        let end = self.finished_at.unwrap_or_else(Utc::now);
        Some((end - started).num_milliseconds() as f64 / 1000.0)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::path::PathBuf;

    use super::*;

    pub(crate) fn test_state(auth_token: Option<&str>, catalog: Catalog) -> AppStateInner {
        let config = Config {
            catalog_dir: PathBuf::from("/nonexistent"),
            listen_addr: "127.0.0.1:0".into(),
            auth_token: auth_token.map(str::to_owned),
            detection: DetectionConfig::default(),
        };
        AppStateInner::new(config, catalog)
    }

    fn report() -> DetectionReport {
        DetectionReport {
            found_items: Vec::new(),
            missing_items: Vec::new(),
            skipped_items: Vec::new(),
            scale: 1.0,
        }
    }

    #[test]
    fn test_progress_event_updates_state() {
        let mut state = test_state(None, Catalog::default());
        let id = state.begin_run();
        assert_eq!(state.phase, RunPhase::Running);

        state.apply_event(
            id,
            &DetectionEvent::Progress {
                phase: Pass::Refine,
                processed: 2,
                total: 5,
                item_name: "Bolts".into(),
            },
        );
        let progress = state.progress.clone().unwrap();
        assert_eq!(progress.pass, Pass::Refine);
        assert_eq!((progress.processed, progress.total), (2, 5));
    }

    #[test]
    fn test_finish_run_sets_phase() {
        let mut state = test_state(None, Catalog::default());

        let id = state.begin_run();
        state.finish_run(id, Ok(report()));
        assert_eq!(state.phase, RunPhase::Completed);
        assert!(state.last_report.is_some());
        assert!(state.elapsed_secs().is_some());

        let id = state.begin_run();
        state.finish_run(id, Err(DetectError::Cancelled));
        assert_eq!(state.phase, RunPhase::Cancelled);
        // the previous report stays available
        assert!(state.last_report.is_some());

        let id = state.begin_run();
        state.finish_run(id, Err(DetectError::EmptyScreenshot));
        assert_eq!(state.phase, RunPhase::Failed);
        assert_eq!(state.last_error.as_deref(), Some("screenshot has no pixels"));
    }

    #[test]
    fn test_stale_run_updates_are_ignored() {
        let mut state = test_state(None, Catalog::default());
        let old = state.begin_run();
        let current = state.begin_run();

        state.apply_event(
            old,
            &DetectionEvent::Status {
                message: "old".into(),
            },
        );
        state.finish_run(old, Err(DetectError::EmptyScreenshot));

        assert_eq!(state.run_id, current);
        assert_eq!(state.phase, RunPhase::Running);
        assert!(state.last_status.is_none());
        assert!(state.last_error.is_none());
    }
}
