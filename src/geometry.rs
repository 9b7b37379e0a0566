use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle in screenshot pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, width: i32, height: i32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub fn right(&self) -> i32 {
        self.left + self.width
    }

    pub fn bottom(&self) -> i32 {
        self.top + self.height
    }

    /// Area in pixels; zero for rectangles with a non-positive side.
    pub fn area(&self) -> f64 {
        if self.width <= 0 || self.height <= 0 {
            return 0.0;
        }
        self.width as f64 * self.height as f64
    }

    pub fn intersection_area(&self, other: &Rect) -> f64 {
        let x1 = self.left.max(other.left);
        let y1 = self.top.max(other.top);
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }

        (x2 - x1) as f64 * (y2 - y1) as f64
    }
}

/// Intersection over union of two rectangles.
/// Returns 0 when they do not overlap or either one is empty.
pub fn intersection_over_union(a: &Rect, b: &Rect) -> f32 {
    let intersection = a.intersection_area(b);
    if intersection == 0.0 {
        return 0.0;
    }

    let (area_a, area_b) = (a.area(), b.area());
    if area_a <= 0.0 || area_b <= 0.0 {
        return 0.0;
    }

    (intersection / (area_a + area_b - intersection)) as f32
}

/// True when the overlap covers at least `threshold` of either rectangle's own area.
/// A small rectangle nested in a large one counts, and so does the reverse.
pub fn is_contained(a: &Rect, b: &Rect, threshold: f32) -> bool {
    let intersection = a.intersection_area(b);
    if intersection == 0.0 {
        return false;
    }

    let threshold = threshold as f64;
    let (area_a, area_b) = (a.area(), b.area());

    (area_a > 0.0 && intersection / area_a >= threshold)
        || (area_b > 0.0 && intersection / area_b >= threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou_identical_is_one() {
        let r = Rect::new(10, 20, 30, 40);
        assert!((intersection_over_union(&r, &r) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_disjoint_is_zero() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(10, 0, 10, 10);
        assert_eq!(intersection_over_union(&a, &b), 0.0);
        let c = Rect::new(50, 50, 5, 5);
        assert_eq!(intersection_over_union(&a, &c), 0.0);
    }

    #[test]
    fn test_iou_symmetric() {
        let pairs = [
            (Rect::new(0, 0, 10, 10), Rect::new(5, 5, 10, 10)),
            (Rect::new(0, 0, 64, 64), Rect::new(10, 12, 20, 8)),
            (Rect::new(-5, -5, 10, 10), Rect::new(0, 0, 3, 30)),
            (Rect::new(0, 0, 0, 10), Rect::new(0, 0, 10, 10)),
        ];
        for (a, b) in pairs {
            assert_eq!(intersection_over_union(&a, &b), intersection_over_union(&b, &a));
        }
    }

    #[test]
    fn test_iou_partial_overlap_value() {
        // 5x5 overlap, union 100 + 100 - 25
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(5, 5, 10, 10);
        let expected = 25.0 / 175.0;
        assert!((intersection_over_union(&a, &b) - expected).abs() < 1e-6);
    }

    #[test]
    fn test_iou_empty_rect_is_zero() {
        let a = Rect::new(0, 0, 0, 10);
        let b = Rect::new(0, 0, 10, 10);
        assert_eq!(intersection_over_union(&a, &b), 0.0);
    }

    #[test]
    fn test_containment_small_inside_large() {
        let small = Rect::new(10, 10, 5, 5);
        let large = Rect::new(0, 0, 100, 100);
        for t in [0.1, 0.5, 0.85, 1.0] {
            assert!(is_contained(&small, &large, t), "threshold {t}");
            assert!(is_contained(&large, &small, t), "threshold {t}");
        }
    }

    #[test]
    fn test_containment_partial_overlap() {
        // overlap is 25% of each rectangle
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(5, 5, 10, 10);
        assert!(is_contained(&a, &b, 0.25));
        assert!(!is_contained(&a, &b, 0.26));
    }

    #[test]
    fn test_containment_disjoint() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(20, 20, 10, 10);
        assert!(!is_contained(&a, &b, 0.0));
    }

    #[test]
    fn test_containment_above_one_never_true_for_partial() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(1, 0, 10, 10);
        assert!(!is_contained(&a, &b, 1.0));
        assert!(!is_contained(&a, &b, 1.1));
    }
}
