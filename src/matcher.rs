use image::{GrayImage, Luma};
use imageproc::integral_image::{integral_image, integral_squared_image, sum_image_pixels};
use imageproc::template_matching::{MatchTemplateMethod, match_template_parallel};
use thiserror::Error;

use crate::catalog::CatalogItem;
use crate::config::DetectionConfig;
use crate::geometry::Rect;
use crate::template::{self, TemplateConfig, TemplateVariant};
use crate::types::{Candidate, Pass};

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("template {template_w}x{template_h} does not fit screenshot {image_w}x{image_h}")]
    TemplateOutOfBounds {
        template_w: u32,
        template_h: u32,
        image_w: u32,
        image_h: u32,
    },

    #[error("template has zero variance")]
    FlatTemplate,
}

/// Best location of a template in the screenshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    pub x: u32,
    pub y: u32,
    pub score: f32,
}

/// Correlates templates against one fixed screenshot.
pub trait Correlate {
    fn dimensions(&self) -> (u32, u32);

    /// Global maximum of the normalized correlation surface.
    fn best_match(&self, template: &GrayImage) -> Result<Peak, MatchError>;
}

/// Windows whose per-pixel variance is at or below this count as flat.
pub const MIN_WINDOW_VARIANCE: f64 = 0.25;

/// Windows re-scored exactly after the approximate sweep.
const SHORTLIST_LEN: usize = 16;

/// Zero-mean normalized cross-correlation (the `CCOEFF_NORMED` score).
///
/// imageproc's sum-of-squared-errors surface ranks every window; its f32
/// accumulation stays accurate near a match, where the errors are small. The
/// best windows are then re-scored exactly from integer sums, with per-window
/// means and variances taken from integral images of the screenshot.
pub struct ZnccCorrelator {
    image: GrayImage,
    sum: image::ImageBuffer<Luma<u64>, Vec<u64>>,
    sum_sq: image::ImageBuffer<Luma<u64>, Vec<u64>>,
}

/// Exact moments of one template.
struct TemplateStats {
    n: i128,
    sum: i128,
    sum_sq: i128,
    /// `n^2` times the variance.
    var: i128,
}

impl TemplateStats {
    fn new(template: &GrayImage) -> Self {
        let (sum, sum_sq) = template.pixels().fold((0i128, 0i128), |(s, q), p| {
            let v = p[0] as i128;
            (s + v, q + v * v)
        });
        let n = template.width() as i128 * template.height() as i128;
        Self {
            n,
            sum,
            sum_sq,
            var: n * sum_sq - sum * sum,
        }
    }
}

/// Highest-scoring windows seen so far.
struct Shortlist {
    entries: Vec<(f64, u32, u32)>,
    floor: f64,
}

impl Shortlist {
    fn new() -> Self {
        Self {
            entries: Vec::with_capacity(SHORTLIST_LEN),
            floor: f64::NEG_INFINITY,
        }
    }

    fn offer(&mut self, score: f64, x: u32, y: u32) {
        if self.entries.len() < SHORTLIST_LEN {
            self.entries.push((score, x, y));
            if self.entries.len() == SHORTLIST_LEN {
                self.refresh_floor();
            }
            return;
        }
        let floor = self.floor;
        if score <= floor {
            return;
        }
        if let Some(worst) = self.entries.iter_mut().find(|e| e.0 == floor) {
            *worst = (score, x, y);
        }
        self.refresh_floor();
    }

    fn refresh_floor(&mut self) {
        self.floor = self
            .entries
            .iter()
            .map(|e| e.0)
            .fold(f64::INFINITY, f64::min);
    }

    /// Window positions in row-major order.
    fn into_positions(mut self) -> Vec<(u32, u32)> {
        self.entries.sort_by_key(|&(_, x, y)| (y, x));
        self.entries.into_iter().map(|(_, x, y)| (x, y)).collect()
    }
}

impl ZnccCorrelator {
    pub fn new(image: GrayImage) -> Self {
        let sum = integral_image::<_, u64>(&image);
        let sum_sq = integral_squared_image::<_, u64>(&image);
        Self { image, sum, sum_sq }
    }

    /// Pixel sum and squared sum of the `tw`x`th` window at `(x, y)`.
    fn window_sums(&self, x: u32, y: u32, tw: u32, th: u32) -> (i128, i128) {
        let [sum] = sum_image_pixels(&self.sum, x, y, x + tw - 1, y + th - 1);
        let [sum_sq] = sum_image_pixels(&self.sum_sq, x, y, x + tw - 1, y + th - 1);
        (sum as i128, sum_sq as i128)
    }

    /// Exact score at `(x, y)`, or `None` for a flat window.
    fn exact_score(
        &self,
        template: &GrayImage,
        stats: &TemplateStats,
        x: u32,
        y: u32,
    ) -> Option<f64> {
        let (tw, th) = template.dimensions();
        let (i_sum, i_sq) = self.window_sums(x, y, tw, th);
        let i_var = stats.n * i_sq - i_sum * i_sum;
        if !window_has_texture(i_var, stats.n) {
            return None;
        }

        let dot: u64 = template
            .enumerate_pixels()
            .map(|(tx, ty, t)| t[0] as u64 * self.image.get_pixel(x + tx, y + ty)[0] as u64)
            .sum();
        let numerator = stats.n * dot as i128 - stats.sum * i_sum;
        let score = numerator as f64 / (stats.var as f64 * i_var as f64).sqrt();
        Some(score.clamp(-1.0, 1.0))
    }
}

fn window_has_texture(var: i128, n: i128) -> bool {
    var as f64 > MIN_WINDOW_VARIANCE * (n as f64).powi(2)
}

impl Correlate for ZnccCorrelator {
    fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    fn best_match(&self, template: &GrayImage) -> Result<Peak, MatchError> {
        let (iw, ih) = self.image.dimensions();
        let (tw, th) = template.dimensions();
        if tw == 0 || th == 0 || tw > iw || th > ih {
            return Err(MatchError::TemplateOutOfBounds {
                template_w: tw,
                template_h: th,
                image_w: iw,
                image_h: ih,
            });
        }

        let stats = TemplateStats::new(template);
        if stats.var <= 0 {
            return Err(MatchError::FlatTemplate);
        }
        let n = stats.n as f64;
        let t_var = stats.var as f64;

        let sse = match_template_parallel(
            &self.image,
            template,
            MatchTemplateMethod::SumOfSquaredErrors,
        );

        let mut shortlist = Shortlist::new();
        for (x, y, err) in sse.enumerate_pixels() {
            let (i_sum, i_sq) = self.window_sums(x, y, tw, th);
            let i_var = stats.n * i_sq - i_sum * i_sum;
            if !window_has_texture(i_var, stats.n) {
                continue;
            }
            // sum(i*t) = (sum(i^2) + sum(t^2) - sse) / 2
            let cross = (i_sq as f64 + stats.sum_sq as f64 - err[0] as f64) / 2.0;
            let approx =
                (n * cross - stats.sum as f64 * i_sum as f64) / (t_var * i_var as f64).sqrt();
            shortlist.offer(approx, x, y);
        }

        let mut best: Option<Peak> = None;
        for (x, y) in shortlist.into_positions() {
            let Some(score) = self.exact_score(template, &stats, x, y) else {
                continue;
            };
            let score = score as f32;
            if best.is_none_or(|b| score > b.score) {
                best = Some(Peak { x, y, score });
            }
        }

        // every window flat: nothing correlates
        Ok(best.unwrap_or(Peak {
            x: 0,
            y: 0,
            score: 0.0,
        }))
    }
}

/// Outcome of matching templates over a list of scales.
#[derive(Debug, Clone, Default)]
pub struct ScaleSearch {
    pub candidates: Vec<Candidate>,
    /// Best confidence seen at any scale, tracked only in early-exit mode.
    pub best_confidence: f32,
    pub best_scale: Option<f32>,
    /// Scale at which the early-exit threshold was crossed.
    pub early_exit_scale: Option<f32>,
    /// Scales skipped because correlation failed.
    pub failures: Vec<String>,
}

impl ScaleSearch {
    pub fn early_exit(&self) -> bool {
        self.early_exit_scale.is_some()
    }

    fn track_best(&mut self, confidence: f32, scale: Option<f32>) {
        if confidence > self.best_confidence {
            self.best_confidence = confidence;
            self.best_scale = scale;
        }
    }
}

/// Parameters of one per-item matching step.
#[derive(Debug, Clone, Copy)]
pub struct MatchRequest<'a> {
    pub scales: &'a [f32],
    pub pass: Pass,
    pub templates: &'a [TemplateConfig],
    /// Stop at the first match above `pass1_early_exit`.
    pub early_exit: bool,
}

impl MatchRequest<'_> {
    fn collection_threshold(&self, config: &DetectionConfig) -> f32 {
        match self.pass {
            Pass::Coarse => config.pass1_collection_threshold(),
            Pass::Refine | Pass::Rescan => config.match_threshold,
        }
    }
}

/// Match one template variant at every requested scale.
pub fn match_scales<C: Correlate + ?Sized>(
    correlator: &C,
    item: &CatalogItem,
    variant: &TemplateVariant,
    request: &MatchRequest<'_>,
    config: &DetectionConfig,
) -> ScaleSearch {
    let mut search = ScaleSearch::default();
    let threshold = request.collection_threshold(config);
    let (iw, ih) = correlator.dimensions();
    let (vw, vh) = variant.pixels.dimensions();

    for &scale in request.scales {
        let Some((sw, sh)) = template::scaled_dimensions(vw, vh, scale) else {
            continue;
        };
        if sw > iw || sh > ih {
            continue;
        }
        let Some(scaled) = template::scale_template(&variant.pixels, scale) else {
            continue;
        };
        if template::is_flat(&scaled) {
            continue;
        }

        let peak = match correlator.best_match(&scaled) {
            Ok(peak) => peak,
            Err(e) => {
                let message = format!(
                    "match failed: {} S:{scale:.2} R:{} C:{} {}: {e}",
                    item.name(),
                    variant.rotation.degrees(),
                    variant.crop,
                    request.pass,
                );
                tracing::debug!("{message}");
                search.failures.push(message);
                continue;
            }
        };

        if peak.score > threshold {
            search.candidates.push(Candidate {
                item: item.item.clone(),
                confidence: peak.score,
                rect: Rect::new(peak.x as i32, peak.y as i32, sw as i32, sh as i32),
                rotation: variant.rotation,
                scale,
                pass: request.pass,
                crop_type: variant.crop,
            });
        }

        if request.early_exit {
            search.track_best(peak.score, Some(scale));
            if peak.score > config.pass1_early_exit {
                search.early_exit_scale = Some(scale);
                break;
            }
        }
    }

    search
}

/// Match every requested variant of one catalog item.
///
/// Items without a usable icon yield nothing. In early-exit mode the first
/// template that crosses `pass1_early_exit` ends the whole item.
pub fn match_item<C: Correlate + ?Sized>(
    correlator: &C,
    item: &CatalogItem,
    request: &MatchRequest<'_>,
    config: &DetectionConfig,
) -> ScaleSearch {
    let mut result = ScaleSearch::default();
    let Some(icon) = item.usable_icon() else {
        return result;
    };

    // Variants live only for this call.
    let base = template::grayscale_base(icon);
    let variants = template::prepare_variants(
        &base,
        request.templates,
        request.pass,
        item.is_square_icon,
        config,
    );

    for variant in &variants {
        let search = match_scales(correlator, item, variant, request, config);
        result.candidates.extend(search.candidates);
        result.failures.extend(search.failures);

        if request.early_exit {
            result.track_best(search.best_confidence, search.best_scale);
            if let Some(scale) = search.early_exit_scale {
                result.early_exit_scale = Some(scale);
                break;
            }
        }
    }

    result
}
