use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    MissingEnv(String),

    #[error("invalid value for {name}: {value:?} ({reason})")]
    InvalidValue {
        name: String,
        value: String,
        reason: String,
    },

    #[error("invalid detection threshold {name}={value}")]
    InvalidThreshold { name: &'static str, value: f32 },

    #[error("broad scale list must not be empty")]
    EmptyScales,
}

/// Every tunable of the detection pipeline in one place.
///
/// Thresholds are correlation scores (`[-1, 1]`) or overlap ratios. A lenient
/// NMS threshold of 1.0 or more turns that overlap check off, since IoU and
/// containment never exceed 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// A pass-1 match above this ends the coarse scan and locks the scale.
    pub pass1_early_exit: f32,
    /// Minimum pass-1 confidence for its scale to become the provisional global scale.
    pub pass1_scale_lock: f32,
    /// Base collection threshold for passes 2 and 3.
    pub match_threshold: f32,
    /// Pass 1 collects at `match_threshold - pass1_threshold_relief`.
    pub pass1_threshold_relief: f32,
    pub nms_iou: f32,
    pub nms_containment: f32,
    pub nms_iou_lenient: f32,
    pub nms_containment_lenient: f32,

    pub crop_top_general: f32,
    pub crop_horizontal_general: f32,
    pub crop_aggressive_p3: f32,
    pub square_icon_fixed_crop_px: u32,
    pub minimal_fallback_crop_percent: f32,

    pub square_icon_reference_size: u32,
    pub square_icon_size_tolerance: f32,
    pub square_icon_aspect_tolerance: f32,

    /// Scales scanned by passes 1 and 3.
    pub broad_scales: Vec<f32>,
    /// Relative step of the three pass-2 scales around the locked scale.
    pub targeted_scale_step: f32,
    /// Exclusive bounds a targeted scale must fall in.
    pub targeted_scale_bounds: (f32, f32),
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            pass1_early_exit: 0.85,
            pass1_scale_lock: 0.80,
            match_threshold: 0.5,
            pass1_threshold_relief: 0.15,
            nms_iou: 0.1,
            nms_containment: 0.85,
            nms_iou_lenient: 1.1,
            nms_containment_lenient: 1.1,
            crop_top_general: 0.10,
            crop_horizontal_general: 0.05,
            crop_aggressive_p3: 0.25,
            square_icon_fixed_crop_px: 15,
            minimal_fallback_crop_percent: 0.02,
            square_icon_reference_size: 64,
            square_icon_size_tolerance: 0.20,
            square_icon_aspect_tolerance: 0.20,
            broad_scales: vec![
                0.7, 0.75, 0.8, 0.85, 0.9, 0.95, 1.0, 1.05, 1.1, 1.15, 1.2, 1.25, 1.3, 1.35, 1.4,
                1.45, 1.5, 1.6, 1.7, 1.8, 1.9, 2.0,
            ],
            targeted_scale_step: 0.02,
            targeted_scale_bounds: (0.1, 3.0),
        }
    }
}

impl DetectionConfig {
    /// Threshold used to collect candidates during the coarse pass.
    pub fn pass1_collection_threshold(&self) -> f32 {
        self.match_threshold - self.pass1_threshold_relief
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let scores = [
            ("pass1_early_exit", self.pass1_early_exit),
            ("pass1_scale_lock", self.pass1_scale_lock),
            ("match_threshold", self.match_threshold),
        ];
        for (name, value) in scores {
            if !value.is_finite() || !(-1.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidThreshold { name, value });
            }
        }

        let non_negative = [
            ("pass1_threshold_relief", self.pass1_threshold_relief),
            ("nms_iou", self.nms_iou),
            ("nms_containment", self.nms_containment),
            ("nms_iou_lenient", self.nms_iou_lenient),
            ("nms_containment_lenient", self.nms_containment_lenient),
            ("crop_top_general", self.crop_top_general),
            ("crop_horizontal_general", self.crop_horizontal_general),
            ("crop_aggressive_p3", self.crop_aggressive_p3),
            ("minimal_fallback_crop_percent", self.minimal_fallback_crop_percent),
            ("square_icon_size_tolerance", self.square_icon_size_tolerance),
            ("square_icon_aspect_tolerance", self.square_icon_aspect_tolerance),
            ("targeted_scale_step", self.targeted_scale_step),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidThreshold { name, value });
            }
        }

        if self.broad_scales.is_empty() {
            return Err(ConfigError::EmptyScales);
        }
        if let Some(&bad) = self
            .broad_scales
            .iter()
            .find(|s| !s.is_finite() || **s <= 0.0)
        {
            return Err(ConfigError::InvalidThreshold {
                name: "broad_scales",
                value: bad,
            });
        }

        Ok(())
    }
}

/// Service configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding `catalog.json` and the icon files.
    pub catalog_dir: PathBuf,
    pub listen_addr: String,
    /// Bearer token required on every request when set.
    pub auth_token: Option<String>,
    pub detection: DetectionConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let catalog_dir = PathBuf::from(required_env("KAPPA_CATALOG_DIR")?);

        let listen_addr =
            std::env::var("KAPPA_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8091".into());

        let auth_token = std::env::var("KAPPA_AUTH_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty());

        let mut detection = DetectionConfig::default();
        let overrides: [(&str, &mut f32); 7] = [
            ("KAPPA_MATCH_THRESHOLD", &mut detection.match_threshold),
            ("KAPPA_PASS1_EARLY_EXIT", &mut detection.pass1_early_exit),
            ("KAPPA_PASS1_SCALE_LOCK", &mut detection.pass1_scale_lock),
            ("KAPPA_NMS_IOU", &mut detection.nms_iou),
            ("KAPPA_NMS_CONTAINMENT", &mut detection.nms_containment),
            ("KAPPA_NMS_IOU_LENIENT", &mut detection.nms_iou_lenient),
            (
                "KAPPA_NMS_CONTAINMENT_LENIENT",
                &mut detection.nms_containment_lenient,
            ),
        ];
        for (name, slot) in overrides {
            if let Ok(raw) = std::env::var(name) {
                *slot = parse_f32(name, &raw)?;
            }
        }
        detection.validate()?;

        Ok(Config {
            catalog_dir,
            listen_addr,
            auth_token,
            detection,
        })
    }
}

fn required_env(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingEnv(name.into()))
}

fn parse_f32(name: &str, raw: &str) -> Result<f32, ConfigError> {
    raw.trim()
        .parse::<f32>()
        .map_err(|e| ConfigError::InvalidValue {
            name: name.into(),
            value: raw.into(),
            reason: e.to_string(),
        })
}
