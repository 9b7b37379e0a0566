//! Three-pass detection run.
//!
//! Pass 1 sweeps the broad scale list to estimate the render scale shared by
//! the whole screenshot. Pass 2 rescans every item tightly around that scale,
//! and its merge with pass 1 yields the protected detections. Pass 3 rescans
//! whatever is still unresolved with the full template set and may only fill
//! gaps, never displace a protected detection.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::catalog::{Catalog, CatalogItem};
use crate::config::DetectionConfig;
use crate::matcher::{Correlate, MatchRequest, ScaleSearch, ZnccCorrelator, match_item};
use crate::nms::{self, NmsConfig, Thresholds};
use crate::template::{ALL_TEMPLATES, CROPPED_TEMPLATES, TemplateConfig};
use crate::types::{Candidate, ItemRef, Pass};

pub const MISSING_REASON: &str = "Not detected or suppressed";

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("failed to decode screenshot: {0}")]
    ScreenshotDecode(#[from] image::ImageError),

    #[error("screenshot has no pixels")]
    EmptyScreenshot,

    #[error("detection cancelled")]
    Cancelled,

    #[error("detection task failed: {0}")]
    Join(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Pass1Coarse,
    Pass2Refine,
    Pass1Vs2Merge,
    Pass3Rescan,
    Pass3Vs3Merge,
    FinalMerge,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Pass1Coarse => "pass 1: coarse scale sweep",
            Stage::Pass2Refine => "pass 2: targeted scales",
            Stage::Pass1Vs2Merge => "merging passes 1 and 2",
            Stage::Pass3Rescan => "pass 3: rescanning unresolved items",
            Stage::Pass3Vs3Merge => "resolving pass 3 overlaps",
            Stage::FinalMerge => "final merge",
            Stage::Done => "done",
        };
        f.write_str(label)
    }
}

/// An item with a loadable icon that no pass could place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingItem {
    pub id: String,
    pub name: String,
    pub short_name: Option<String>,
    pub wiki_link: Option<String>,
    pub reason: String,
}

impl MissingItem {
    fn from_item(item: &ItemRef) -> Self {
        Self {
            id: item.id.clone(),
            name: item.name.clone(),
            short_name: item.short_name.clone(),
            wiki_link: item.wiki_link.clone(),
            reason: MISSING_REASON.to_owned(),
        }
    }
}

/// Outcome of a completed run.
///
/// `found_items` and `missing_items` partition the items with a loadable
/// icon. Items without one are listed in `skipped_items` only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionReport {
    /// One candidate per detected item, highest confidence first.
    pub found_items: Vec<Candidate>,
    pub missing_items: Vec<MissingItem>,
    pub skipped_items: Vec<ItemRef>,
    /// Render scale locked by pass 1.
    pub scale: f32,
}

/// Messages a run reports while it works.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DetectionEvent {
    Status {
        message: String,
    },
    Progress {
        phase: Pass,
        processed: usize,
        total: usize,
        #[serde(rename = "itemName")]
        item_name: String,
    },
    Debug {
        message: String,
    },
    Result(DetectionReport),
    Error {
        message: String,
    },
}

/// Receiver of run events.
pub trait EventSink {
    fn emit(&mut self, event: DetectionEvent);
}

impl EventSink for Vec<DetectionEvent> {
    fn emit(&mut self, event: DetectionEvent) {
        self.push(event);
    }
}

impl EventSink for mpsc::UnboundedSender<DetectionEvent> {
    fn emit(&mut self, event: DetectionEvent) {
        // receiver gone means nobody is listening any more
        let _ = self.send(event);
    }
}

/// Shared flag checked between items.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

pub fn decode_screenshot(bytes: &[u8]) -> Result<DynamicImage, DetectError> {
    let image = image::load_from_memory(bytes)?;
    if image.width() == 0 || image.height() == 0 {
        return Err(DetectError::EmptyScreenshot);
    }
    Ok(image)
}

/// The three pass-2 scales around `center`, or `[1.0]` if none fits the bounds.
pub fn targeted_scales(center: f32, config: &DetectionConfig) -> Vec<f32> {
    let step = config.targeted_scale_step;
    let (low, high) = config.targeted_scale_bounds;
    let scales: Vec<f32> = [center * (1.0 - step), center, center * (1.0 + step)]
        .into_iter()
        .filter(|s| *s > low && *s < high)
        .collect();
    if scales.is_empty() { vec![1.0] } else { scales }
}

pub fn run_detection<S: EventSink + ?Sized>(
    screenshot: &DynamicImage,
    catalog: &Catalog,
    config: &DetectionConfig,
    sink: &mut S,
) -> Result<DetectionReport, DetectError> {
    run_detection_with_cancel(screenshot, catalog, config, &CancelFlag::default(), sink)
}

/// Runs the full pipeline, emitting progress to `sink`.
///
/// Ends with either one `Result` event or one `Error` event.
pub fn run_detection_with_cancel<S: EventSink + ?Sized>(
    screenshot: &DynamicImage,
    catalog: &Catalog,
    config: &DetectionConfig,
    cancel: &CancelFlag,
    sink: &mut S,
) -> Result<DetectionReport, DetectError> {
    let outcome = scan_screenshot(screenshot, catalog, config, cancel, sink);

    match outcome {
        Ok(report) => {
            tracing::info!(
                "detection complete: {} found, {} missing, {} skipped, scale {:.2}",
                report.found_items.len(),
                report.missing_items.len(),
                report.skipped_items.len(),
                report.scale,
            );
            sink.emit(DetectionEvent::Result(report.clone()));
            sink.emit(DetectionEvent::Status {
                message: "processing complete".into(),
            });
            Ok(report)
        }
        Err(e) => {
            tracing::error!("detection failed: {e}");
            sink.emit(DetectionEvent::Error {
                message: e.to_string(),
            });
            Err(e)
        }
    }
}

fn scan_screenshot<S: EventSink + ?Sized>(
    screenshot: &DynamicImage,
    catalog: &Catalog,
    config: &DetectionConfig,
    cancel: &CancelFlag,
    sink: &mut S,
) -> Result<DetectionReport, DetectError> {
    let gray = grayscale_screenshot(screenshot)?;
    sink.emit(DetectionEvent::Status {
        message: format!(
            "scanning {}x{} screenshot for {} item(s)",
            gray.width(),
            gray.height(),
            catalog.len()
        ),
    });
    let correlator = ZnccCorrelator::new(gray);
    detect(&correlator, catalog, config, cancel, sink)
}

fn grayscale_screenshot(screenshot: &DynamicImage) -> Result<GrayImage, DetectError> {
    if screenshot.width() == 0 || screenshot.height() == 0 {
        return Err(DetectError::EmptyScreenshot);
    }
    Ok(screenshot.to_luma8())
}

/// Pipeline core over any correlator. Emits no terminal event.
pub fn detect<C, S>(
    correlator: &C,
    catalog: &Catalog,
    config: &DetectionConfig,
    cancel: &CancelFlag,
    sink: &mut S,
) -> Result<DetectionReport, DetectError>
where
    C: Correlate + ?Sized,
    S: EventSink + ?Sized,
{
    let mut run = Run {
        correlator,
        config,
        cancel,
        sink,
    };
    let items: Vec<&CatalogItem> = catalog.loadable().collect();

    run.enter(Stage::Pass1Coarse);
    let coarse = run.coarse_pass(&items)?;

    run.enter(Stage::Pass2Refine);
    let scales = targeted_scales(coarse.scale, config);
    let refined = run.scan(&items, Pass::Refine, &scales, &CROPPED_TEMPLATES)?;

    run.enter(Stage::Pass1Vs2Merge);
    let protected = run.merge_pass1_pass2(&coarse.candidates, &refined);

    run.enter(Stage::Pass3Rescan);
    let unresolved: Vec<&CatalogItem> = items
        .iter()
        .copied()
        .filter(|item| !protected.kept_ids.contains(item.id()))
        .collect();
    let rescanned = run.scan(&unresolved, Pass::Rescan, &config.broad_scales, &ALL_TEMPLATES)?;

    run.enter(Stage::Pass3Vs3Merge);
    let pass3 = run.merge_pass3(&rescanned, &protected.kept_ids);

    run.enter(Stage::FinalMerge);
    let found = run.final_merge(protected.kept, pass3);

    run.enter(Stage::Done);
    let found_ids: HashSet<&str> = found.iter().map(|c| c.item_id()).collect();
    let missing_items = items
        .iter()
        .filter(|item| !found_ids.contains(item.id()))
        .map(|item| MissingItem::from_item(&item.item))
        .collect();
    let skipped_items = catalog
        .items()
        .iter()
        .filter(|item| item.usable_icon().is_none())
        .map(|item| item.item.clone())
        .collect();

    Ok(DetectionReport {
        found_items: found,
        missing_items,
        skipped_items,
        scale: coarse.scale,
    })
}

struct CoarseScan {
    /// Pass-1 candidates above the plain match threshold, kept as fallbacks.
    candidates: Vec<Candidate>,
    scale: f32,
}

struct Run<'a, C: ?Sized, S: ?Sized> {
    correlator: &'a C,
    config: &'a DetectionConfig,
    cancel: &'a CancelFlag,
    sink: &'a mut S,
}

impl<C, S> Run<'_, C, S>
where
    C: Correlate + ?Sized,
    S: EventSink + ?Sized,
{
    fn enter(&mut self, stage: Stage) {
        tracing::debug!("entering {stage:?}");
        self.sink.emit(DetectionEvent::Status {
            message: stage.to_string(),
        });
    }

    fn debug(&mut self, message: String) {
        tracing::debug!("{message}");
        self.sink.emit(DetectionEvent::Debug { message });
    }

    fn check_cancelled(&self) -> Result<(), DetectError> {
        if self.cancel.is_cancelled() {
            return Err(DetectError::Cancelled);
        }
        Ok(())
    }

    fn match_one(
        &mut self,
        item: &CatalogItem,
        processed: usize,
        total: usize,
        request: &MatchRequest<'_>,
    ) -> Result<ScaleSearch, DetectError> {
        self.check_cancelled()?;
        self.sink.emit(DetectionEvent::Progress {
            phase: request.pass,
            processed,
            total,
            item_name: item.name().to_owned(),
        });

        let mut search = match_item(self.correlator, item, request, self.config);
        for message in std::mem::take(&mut search.failures) {
            self.sink.emit(DetectionEvent::Debug { message });
        }
        Ok(search)
    }

    fn coarse_pass(&mut self, items: &[&CatalogItem]) -> Result<CoarseScan, DetectError> {
        let config = self.config;
        let request = MatchRequest {
            scales: &config.broad_scales,
            pass: Pass::Coarse,
            templates: &CROPPED_TEMPLATES,
            early_exit: true,
        };

        let mut raw = Vec::new();
        let mut scale = 1.0;
        let mut highest = 0.0f32;
        let mut early_exit = false;

        for (i, item) in items.iter().enumerate() {
            let search = self.match_one(item, i + 1, items.len(), &request)?;
            raw.extend(search.candidates);

            if search.best_confidence > highest {
                highest = search.best_confidence;
                if highest > config.pass1_scale_lock {
                    if let Some(best) = search.best_scale {
                        scale = best;
                    }
                }
            }

            if let Some(exit_scale) = search.early_exit_scale {
                scale = exit_scale;
                highest = search.best_confidence;
                early_exit = true;
                self.debug(format!(
                    "early exit on {:?} at scale {exit_scale:.2} (conf {highest:.3})",
                    item.name()
                ));
                break;
            }
        }

        if !early_exit && highest < config.pass1_scale_lock {
            scale = 1.0;
        }

        let candidates: Vec<Candidate> = raw
            .into_iter()
            .filter(|c| c.confidence > config.match_threshold)
            .collect();

        tracing::info!(
            "pass 1: scale {scale:.2}, best conf {highest:.3}, {} candidate(s) kept",
            candidates.len()
        );

        Ok(CoarseScan { candidates, scale })
    }

    /// Non-early-exit sweep over `items`, returning every collected candidate.
    fn scan(
        &mut self,
        items: &[&CatalogItem],
        pass: Pass,
        scales: &[f32],
        templates: &[TemplateConfig],
    ) -> Result<Vec<Candidate>, DetectError> {
        let request = MatchRequest {
            scales,
            pass,
            templates,
            early_exit: false,
        };

        let mut candidates = Vec::new();
        for (i, item) in items.iter().enumerate() {
            let search = self.match_one(item, i + 1, items.len(), &request)?;
            candidates.extend(search.candidates);
        }

        tracing::info!(
            "{pass}: {} item(s) at {} scale(s), {} candidate(s)",
            items.len(),
            scales.len(),
            candidates.len()
        );
        Ok(candidates)
    }

    /// Best pass-2 candidate per item, falling back to pass 1 for items pass 2
    /// never saw, resolved with the strict thresholds.
    fn merge_pass1_pass2(&mut self, pass1: &[Candidate], pass2: &[Candidate]) -> nms::NmsResult {
        let mut pool = nms::best_per_item(pass2);
        let refined: HashSet<&str> = pool.iter().map(|c| c.item_id()).collect();
        let fallback = pass1.iter().filter(|c| !refined.contains(c.item_id()));
        pool.extend(nms::best_per_item(fallback));

        let config = NmsConfig::strict(self.config.nms_iou, self.config.nms_containment);
        let result = nms::suppress(&pool, &config, "P1/P2 NMS");
        self.debug(format!(
            "P1/P2 NMS: {} protected, {} suppressed",
            result.kept.len(),
            result.suppressed_ids.len()
        ));
        result
    }

    fn merge_pass3(&mut self, pass3: &[Candidate], protected: &HashSet<String>) -> Vec<Candidate> {
        let pool = nms::best_per_item(pass3.iter().filter(|c| !protected.contains(c.item_id())));
        let lenient = Thresholds {
            iou: self.config.nms_iou_lenient,
            containment: self.config.nms_containment_lenient,
        };
        let config = NmsConfig {
            strict: lenient,
            lenient: Some(lenient),
        };
        let result = nms::suppress(&pool, &config, "P3 NMS");
        self.debug(format!(
            "P3 NMS: {} kept, {} suppressed",
            result.kept.len(),
            result.suppressed_ids.len()
        ));
        result.kept
    }

    /// Admit pass-3 survivors that overlap no protected detection.
    fn final_merge(&mut self, protected: Vec<Candidate>, pass3: Vec<Candidate>) -> Vec<Candidate> {
        let strict = Thresholds {
            iou: self.config.nms_iou,
            containment: self.config.nms_containment,
        };
        let protected_count = protected.len();
        let mut ids: HashSet<String> = protected.iter().map(|c| c.item.id.clone()).collect();
        let mut merged = protected;

        for candidate in pass3 {
            if ids.contains(candidate.item_id()) {
                continue;
            }
            let conflict = merged[..protected_count]
                .iter()
                .find(|kept| strict.conflict(&candidate, kept));
            if let Some(kept) = conflict {
                let message = format!(
                    "final merge: {:?} ({}, conf {:.3}) conflicts with protected {:?} ({}, conf {:.3}); not added",
                    candidate.item.name,
                    candidate.pass,
                    candidate.confidence,
                    kept.item.name,
                    kept.pass,
                    kept.confidence,
                );
                self.debug(message);
                continue;
            }
            ids.insert(candidate.item.id.clone());
            merged.push(candidate);
        }

        merged.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        merged
    }
}
