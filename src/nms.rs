//! Item-scoped non-maximum suppression.
//!
//! Resolves different catalog items claiming overlapping screen regions. Once
//! an item loses a conflict it is out for the rest of the run; its other
//! candidates are not reconsidered.

use std::collections::{HashMap, HashSet};

use crate::geometry::{intersection_over_union, is_contained};
use crate::types::{Candidate, Pass};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub iou: f32,
    pub containment: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NmsConfig {
    pub strict: Thresholds,
    /// Applied instead of `strict` when the candidate under test is from pass 3.
    pub lenient: Option<Thresholds>,
}

impl NmsConfig {
    pub fn strict(iou: f32, containment: f32) -> Self {
        Self {
            strict: Thresholds { iou, containment },
            lenient: None,
        }
    }

    fn thresholds_for(&self, candidate: &Candidate) -> Thresholds {
        match self.lenient {
            Some(lenient) if candidate.pass == Pass::Rescan => lenient,
            _ => self.strict,
        }
    }
}

impl Thresholds {
    /// True when `a` and `b` overlap beyond either threshold.
    pub fn conflict(&self, a: &Candidate, b: &Candidate) -> bool {
        intersection_over_union(&a.rect, &b.rect) > self.iou
            || is_contained(&a.rect, &b.rect, self.containment)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NmsResult {
    pub kept: Vec<Candidate>,
    pub kept_ids: HashSet<String>,
    pub suppressed_ids: HashSet<String>,
}

/// Greedy suppression: pass priority first (2, then 1, then 3), then confidence.
///
/// At most one candidate per item id survives.
pub fn suppress(candidates: &[Candidate], config: &NmsConfig, context: &str) -> NmsResult {
    let mut sorted: Vec<&Candidate> = candidates.iter().collect();
    sorted.sort_by(|a, b| {
        a.pass
            .priority()
            .cmp(&b.pass.priority())
            .then_with(|| b.confidence.total_cmp(&a.confidence))
    });

    let mut result = NmsResult::default();

    for candidate in sorted {
        let id = candidate.item_id();
        if result.kept_ids.contains(id) || result.suppressed_ids.contains(id) {
            continue;
        }

        let thresholds = config.thresholds_for(candidate);
        let blocker = result
            .kept
            .iter()
            .find(|kept| thresholds.conflict(candidate, kept));

        match blocker {
            Some(kept) => {
                tracing::debug!(
                    "{context}: suppressed {:?} ({}, conf {:.3}, {}) by {:?} ({}, conf {:.3}); iou {:.3}",
                    candidate.item.name,
                    candidate.pass,
                    candidate.confidence,
                    candidate.crop_type,
                    kept.item.name,
                    kept.pass,
                    kept.confidence,
                    intersection_over_union(&candidate.rect, &kept.rect),
                );
                result.suppressed_ids.insert(id.to_owned());
            }
            None => {
                result.kept_ids.insert(id.to_owned());
                result.kept.push(candidate.clone());
            }
        }
    }

    result
}

/// Highest-confidence candidate per item id, in first-seen order.
pub fn best_per_item<'a>(candidates: impl IntoIterator<Item = &'a Candidate>) -> Vec<Candidate> {
    let mut order: Vec<&str> = Vec::new();
    let mut best: HashMap<&str, &Candidate> = HashMap::new();

    for candidate in candidates {
        let id = candidate.item_id();
        match best.get(id) {
            Some(current) if candidate.confidence <= current.confidence => {}
            Some(_) => {
                best.insert(id, candidate);
            }
            None => {
                order.push(id);
                best.insert(id, candidate);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|id| best.get(id).map(|c| (*c).clone()))
        .collect()
}
