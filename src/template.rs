//! Grayscale template variants derived from a catalog icon.
//!
//! Catalog icons carry a painted frame that drifts between render sizes, so
//! matching mostly runs on a cropped interior. The crop depends on the pass
//! and on whether the icon is a square single-cell icon.

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage};

use crate::config::DetectionConfig;
use crate::types::{CropType, Pass, Rotation};

/// Which variant of an icon to match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateConfig {
    pub crop: CropType,
    pub rotation: Rotation,
}

impl TemplateConfig {
    pub const fn new(crop: CropType, rotation: Rotation) -> Self {
        Self { crop, rotation }
    }
}

/// Passes 1 and 2.
pub const CROPPED_TEMPLATES: [TemplateConfig; 2] = [
    TemplateConfig::new(CropType::Cropped, Rotation::Upright),
    TemplateConfig::new(CropType::Cropped, Rotation::Clockwise90),
];

/// Pass 3.
pub const ALL_TEMPLATES: [TemplateConfig; 4] = [
    TemplateConfig::new(CropType::Cropped, Rotation::Upright),
    TemplateConfig::new(CropType::Cropped, Rotation::Clockwise90),
    TemplateConfig::new(CropType::Uncropped, Rotation::Upright),
    TemplateConfig::new(CropType::Uncropped, Rotation::Clockwise90),
];

/// A prepared grayscale template. Owned by the per-item matching step and
/// dropped when it returns.
#[derive(Debug, Clone)]
pub struct TemplateVariant {
    pub crop: CropType,
    pub rotation: Rotation,
    pub pixels: GrayImage,
}

/// Pixels trimmed from each side of an icon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropMargins {
    pub top: u32,
    pub bottom: u32,
    pub left: u32,
    pub right: u32,
}

impl CropMargins {
    /// Remaining region as `(x, y, width, height)`, or `None` if it is empty.
    pub fn region(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let crop_w = width.checked_sub(self.left + self.right)?;
        let crop_h = height.checked_sub(self.top + self.bottom)?;
        if crop_w == 0 || crop_h == 0 {
            return None;
        }
        Some((self.left, self.top, crop_w, crop_h))
    }
}

fn fraction(dim: u32, pct: f32) -> u32 {
    (dim as f32 * pct).floor() as u32
}

/// Symmetric trim of `pct` per side, falling back to the minimal trim when it
/// would consume the whole axis.
fn symmetric_trim(dim: u32, pct: f32, config: &DetectionConfig) -> u32 {
    let trim = fraction(dim, pct);
    if trim * 2 >= dim {
        fraction(dim, config.minimal_fallback_crop_percent)
    } else {
        trim
    }
}

pub fn crop_margins(
    width: u32,
    height: u32,
    pass: Pass,
    is_square_icon: bool,
    config: &DetectionConfig,
) -> CropMargins {
    if pass == Pass::Rescan {
        let vertical = symmetric_trim(height, config.crop_aggressive_p3, config);
        let horizontal = symmetric_trim(width, config.crop_aggressive_p3, config);
        return CropMargins {
            top: vertical,
            bottom: vertical,
            left: horizontal,
            right: horizontal,
        };
    }

    let horizontal = if is_square_icon && config.square_icon_fixed_crop_px * 2 < width {
        config.square_icon_fixed_crop_px
    } else {
        symmetric_trim(width, config.crop_horizontal_general, config)
    };

    let mut top = fraction(height, config.crop_top_general);
    if top >= height {
        top = fraction(height, config.minimal_fallback_crop_percent);
    }

    CropMargins {
        top,
        bottom: 0,
        left: horizontal,
        right: horizontal,
    }
}

/// Convert an icon to the grayscale base every variant is derived from.
pub fn grayscale_base(icon: &DynamicImage) -> GrayImage {
    icon.to_luma8()
}

/// Cropped base for `pass`, or `None` when the crop degenerates.
pub fn cropped_base(
    base: &GrayImage,
    pass: Pass,
    is_square_icon: bool,
    config: &DetectionConfig,
) -> Option<GrayImage> {
    let (w, h) = base.dimensions();
    let margins = crop_margins(w, h, pass, is_square_icon, config);
    let Some((x, y, cw, ch)) = margins.region(w, h) else {
        tracing::debug!("invalid crop for {w}x{h} icon in {pass} ({margins:?}), skipping cropped variant");
        return None;
    };
    Some(imageops::crop_imm(base, x, y, cw, ch).to_image())
}

fn rotate(pixels: &GrayImage, rotation: Rotation) -> Option<GrayImage> {
    let rotated = match rotation {
        Rotation::Upright => pixels.clone(),
        Rotation::Clockwise90 => imageops::rotate90(pixels),
    };
    (rotated.width() > 0 && rotated.height() > 0).then_some(rotated)
}

/// Build the requested variants of one icon, in request order. Variants whose
/// crop or rotation degenerates are left out.
pub fn prepare_variants(
    base: &GrayImage,
    requested: &[TemplateConfig],
    pass: Pass,
    is_square_icon: bool,
    config: &DetectionConfig,
) -> Vec<TemplateVariant> {
    if base.width() == 0 || base.height() == 0 {
        return Vec::new();
    }

    let needs_crop = requested.iter().any(|t| t.crop == CropType::Cropped);
    let cropped = if needs_crop {
        cropped_base(base, pass, is_square_icon, config)
    } else {
        None
    };

    requested
        .iter()
        .filter_map(|t| {
            let source = match t.crop {
                CropType::Cropped => cropped.as_ref()?,
                CropType::Uncropped => base,
            };
            let pixels = rotate(source, t.rotation)?;
            Some(TemplateVariant {
                crop: t.crop,
                rotation: t.rotation,
                pixels,
            })
        })
        .collect()
}

/// Resize a template by `scale` (dimensions rounded to the nearest pixel).
/// Returns `None` when the result would be smaller than 1x1.
pub fn scale_template(template: &GrayImage, scale: f32) -> Option<GrayImage> {
    let (w, h) = scaled_dimensions(template.width(), template.height(), scale)?;
    if (w, h) == template.dimensions() {
        return Some(template.clone());
    }
    Some(imageops::resize(template, w, h, FilterType::Triangle))
}

pub fn scaled_dimensions(width: u32, height: u32, scale: f32) -> Option<(u32, u32)> {
    let w = (width as f32 * scale).round();
    let h = (height as f32 * scale).round();
    if !(w >= 1.0 && h >= 1.0) {
        return None;
    }
    Some((w as u32, h as u32))
}

/// True when every pixel has the same value; such templates cannot correlate.
pub fn is_flat(template: &GrayImage) -> bool {
    let mut pixels = template.pixels();
    match pixels.next() {
        Some(first) => pixels.all(|p| p == first),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn gradient(w: u32, h: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| Luma([((x * 7 + y * 3) % 256) as u8]))
    }

    #[test]
    fn test_general_crop_square_icon_fixed_px() {
        let config = DetectionConfig::default();
        let m = crop_margins(64, 64, Pass::Coarse, true, &config);
        assert_eq!(m, CropMargins { top: 6, bottom: 0, left: 15, right: 15 });
        assert_eq!(m.region(64, 64), Some((15, 6, 34, 58)));
    }

    #[test]
    fn test_general_crop_non_square_uses_percent() {
        let config = DetectionConfig::default();
        let m = crop_margins(128, 64, Pass::Refine, false, &config);
        assert_eq!(m, CropMargins { top: 6, bottom: 0, left: 6, right: 6 });
    }

    #[test]
    fn test_square_fixed_crop_falls_back_to_percent() {
        let config = DetectionConfig::default();
        // 15px per side consumes a 30px icon entirely
        let m = crop_margins(30, 30, Pass::Coarse, true, &config);
        assert_eq!(m.left, 1);
        assert_eq!(m.right, 1);
    }

    #[test]
    fn test_percent_crop_falls_back_to_minimal() {
        let config = DetectionConfig {
            crop_horizontal_general: 0.5,
            ..DetectionConfig::default()
        };
        let m = crop_margins(100, 50, Pass::Coarse, false, &config);
        assert_eq!(m.left, 2);
        assert_eq!(m.right, 2);
    }

    #[test]
    fn test_aggressive_crop_pass3() {
        let config = DetectionConfig::default();
        let m = crop_margins(64, 128, Pass::Rescan, true, &config);
        assert_eq!(m, CropMargins { top: 32, bottom: 32, left: 16, right: 16 });
        assert_eq!(m.region(64, 128), Some((16, 32, 32, 64)));
    }

    #[test]
    fn test_aggressive_crop_fallback() {
        let config = DetectionConfig {
            crop_aggressive_p3: 0.5,
            ..DetectionConfig::default()
        };
        let m = crop_margins(100, 100, Pass::Rescan, false, &config);
        assert_eq!(m, CropMargins { top: 2, bottom: 2, left: 2, right: 2 });
    }

    #[test]
    fn test_tiny_icon_keeps_all_variants() {
        let config = DetectionConfig::default();
        let base = gradient(1, 1);
        let variants = prepare_variants(&base, &ALL_TEMPLATES, Pass::Rescan, false, &config);
        assert_eq!(variants.len(), 4);
    }

    #[test]
    fn test_degenerate_crop_skips_cropped_variant() {
        let config = DetectionConfig {
            crop_horizontal_general: 0.6,
            minimal_fallback_crop_percent: 0.6,
            ..DetectionConfig::default()
        };
        let base = gradient(10, 10);
        let variants = prepare_variants(&base, &ALL_TEMPLATES, Pass::Coarse, false, &config);
        assert_eq!(variants.len(), 2);
        assert!(variants.iter().all(|v| v.crop == CropType::Uncropped));

        let margins = CropMargins { top: 0, bottom: 0, left: 3, right: 3 };
        assert_eq!(margins.region(6, 10), None);
    }

    #[test]
    fn test_prepare_variants_dimensions() {
        let config = DetectionConfig::default();
        let base = gradient(128, 64);
        let variants = prepare_variants(&base, &ALL_TEMPLATES, Pass::Rescan, false, &config);
        assert_eq!(variants.len(), 4);
        assert_eq!(variants[0].pixels.dimensions(), (64, 32));
        assert_eq!(variants[1].pixels.dimensions(), (32, 64));
        assert_eq!(variants[2].pixels.dimensions(), (128, 64));
        assert_eq!(variants[3].pixels.dimensions(), (64, 128));
        assert_eq!(variants[3].crop, CropType::Uncropped);
        assert_eq!(variants[3].rotation, Rotation::Clockwise90);
    }

    #[test]
    fn test_rotation_is_clockwise() {
        let base = GrayImage::from_raw(2, 1, vec![10, 20]).unwrap();
        let rotated = rotate(&base, Rotation::Clockwise90).unwrap();
        assert_eq!(rotated.dimensions(), (1, 2));
        // top-left pixel ends at the top-right corner, i.e. the top of a 1-wide column
        assert_eq!(rotated.get_pixel(0, 0)[0], 10);
        assert_eq!(rotated.get_pixel(0, 1)[0], 20);
    }

    #[test]
    fn test_cropped_pixels_come_from_interior() {
        let config = DetectionConfig::default();
        let base = gradient(64, 64);
        let cropped = cropped_base(&base, Pass::Coarse, true, &config).unwrap();
        assert_eq!(cropped.get_pixel(0, 0), base.get_pixel(15, 6));
    }

    #[test]
    fn test_scale_template_rounds() {
        let base = gradient(20, 10);
        let scaled = scale_template(&base, 1.25).unwrap();
        assert_eq!(scaled.dimensions(), (25, 13));
        assert!(scale_template(&base, 0.01).is_none());
        assert_eq!(scale_template(&base, 1.0).unwrap(), base);
    }

    #[test]
    fn test_is_flat() {
        assert!(is_flat(&GrayImage::from_pixel(4, 4, Luma([9]))));
        assert!(!is_flat(&gradient(4, 4)));
    }
}
