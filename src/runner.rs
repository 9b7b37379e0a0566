use std::sync::{Arc, Mutex, PoisonError};

use futures::Stream;
use image::DynamicImage;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::catalog::Catalog;
use crate::config::DetectionConfig;
use crate::pipeline::{self, CancelFlag, DetectError, DetectionEvent, DetectionReport};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("a detection run is already in progress")]
    AlreadyInProgress,
}

/// Starts detection runs in the background, one at a time.
#[derive(Debug, Clone, Default)]
pub struct Runner {
    active: Arc<Mutex<Option<CancelFlag>>>,
}

/// Occupies the runner until dropped.
struct RunGuard {
    active: Arc<Mutex<Option<CancelFlag>>>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl Runner {
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire(&self, cancel: CancelFlag) -> Result<RunGuard, RunError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.is_some() {
            return Err(RunError::AlreadyInProgress);
        }
        *active = Some(cancel);
        Ok(RunGuard {
            active: self.active.clone(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Spawn the pipeline on the blocking pool.
    pub fn start(
        &self,
        screenshot: DynamicImage,
        catalog: Arc<Catalog>,
        config: Arc<DetectionConfig>,
    ) -> Result<RunHandle, RunError> {
        let cancel = CancelFlag::default();
        let guard = self.acquire(cancel.clone())?;
        let (tx, rx) = mpsc::unbounded_channel();

        tracing::info!(
            "starting detection run: {}x{} screenshot, {} item(s)",
            screenshot.width(),
            screenshot.height(),
            catalog.len()
        );

        let task_cancel = cancel.clone();
        let task = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let mut sink = tx;
            pipeline::run_detection_with_cancel(
                &screenshot,
                &catalog,
                &config,
                &task_cancel,
                &mut sink,
            )
        });

        Ok(RunHandle {
            events: rx,
            task,
            cancel,
        })
    }

    /// Ask the in-flight run to stop. Returns false when nothing is running.
    pub fn cancel(&self) -> bool {
        match self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some(flag) => {
                tracing::info!("cancelling detection run");
                flag.cancel();
                true
            }
            None => false,
        }
    }
}

/// Caller's side of a background run.
pub struct RunHandle {
    events: mpsc::UnboundedReceiver<DetectionEvent>,
    task: JoinHandle<Result<DetectionReport, DetectError>>,
    cancel: CancelFlag,
}

impl RunHandle {
    /// Events in emission order; ends once the run has finished.
    pub fn events(&mut self) -> impl Stream<Item = DetectionEvent> + '_ {
        futures::stream::poll_fn(|cx| self.events.poll_recv(cx))
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the run and return its report.
    pub async fn finish(self) -> Result<DetectionReport, DetectError> {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(DetectError::Join(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use image::{GrayImage, imageops};

    use super::*;
    use crate::matcher::tests::{background, item_with_icon, textured_icon};

    fn scene() -> (DynamicImage, Arc<Catalog>) {
        let icon = textured_icon(24, 24, 7);
        let mut screen = background(80, 60);
        imageops::replace(&mut screen, &icon, 20, 12);
        let catalog = Catalog::new(vec![item_with_icon("a", icon)]);
        (DynamicImage::ImageLuma8(screen), Arc::new(catalog))
    }

    #[tokio::test]
    async fn test_run_streams_events_and_result() {
        let runner = Runner::new();
        let (screen, catalog) = scene();
        let mut handle = runner
            .start(screen, catalog, Arc::new(DetectionConfig::default()))
            .unwrap();

        let events: Vec<DetectionEvent> = handle.events().collect().await;
        let report = handle.finish().await.unwrap();

        assert_eq!(report.found_items.len(), 1);
        assert!(events.iter().any(|e| matches!(e, DetectionEvent::Progress { .. })));
        assert!(
            events
                .iter()
                .any(|e| matches!(e, DetectionEvent::Result(r) if *r == report))
        );
        assert!(!runner.is_running());
    }

    #[tokio::test]
    async fn test_second_run_rejected_while_one_is_outstanding() {
        let runner = Runner::new();
        let guard = runner.acquire(CancelFlag::default()).unwrap();
        assert!(runner.is_running());

        let (screen, catalog) = scene();
        let config = Arc::new(DetectionConfig::default());
        assert!(matches!(
            runner.start(screen.clone(), catalog.clone(), config.clone()),
            Err(RunError::AlreadyInProgress)
        ));

        drop(guard);
        assert!(!runner.is_running());
        let handle = runner.start(screen, catalog, config).unwrap();
        handle.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_aborts_run_without_result() {
        // enough absent items that the run is still in pass 1 when cancelled
        let items = (0..60)
            .map(|i| item_with_icon(&format!("item{i}"), textured_icon(24, 24, 1000 + i)))
            .collect();
        let catalog = Arc::new(Catalog::new(items));
        let screen = DynamicImage::ImageLuma8(background(160, 120));

        let runner = Runner::new();
        let mut handle = runner
            .start(screen, catalog, Arc::new(DetectionConfig::default()))
            .unwrap();
        assert!(runner.cancel());

        let events: Vec<DetectionEvent> = handle.events().collect().await;
        let err = handle.finish().await.unwrap_err();

        assert!(matches!(err, DetectError::Cancelled));
        assert!(matches!(events.last(), Some(DetectionEvent::Error { .. })));
        assert!(!events.iter().any(|e| matches!(e, DetectionEvent::Result(_))));
        assert!(!runner.is_running());
        assert!(!runner.cancel());
    }

    #[tokio::test]
    async fn test_empty_screenshot_reports_error() {
        let runner = Runner::new();
        let (_, catalog) = scene();
        let handle = runner
            .start(
                DynamicImage::ImageLuma8(GrayImage::new(0, 0)),
                catalog,
                Arc::new(DetectionConfig::default()),
            )
            .unwrap();
        assert!(matches!(
            handle.finish().await,
            Err(DetectError::EmptyScreenshot)
        ));
    }
}
