//! Axis-aligned bounding box math.
//!
//! Pixel boxes are inclusive on both ends: a box from `(0, 0)` to `(9, 9)`
//! covers 100 pixels. Boxes with `x2 < x1` or `y2 < y1` are degenerate and
//! have zero area; none of the functions here panic on them.

use serde::{Deserialize, Serialize};

/// Integer pixel box `(x1, y1)`-`(x2, y2)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub const fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Inclusive pixel area, clamped at zero.
    pub fn area(&self) -> i64 {
        calculate_area(self.x1, self.y1, self.x2, self.y2)
    }

    pub fn is_degenerate(&self) -> bool {
        self.x2 < self.x1 || self.y2 < self.y1
    }

    /// Intersection rectangle. May be degenerate when the boxes do not touch.
    pub fn intersection(&self, other: &Self) -> Self {
        Self {
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
            x2: self.x2.min(other.x2),
            y2: self.y2.min(other.y2),
        }
    }

    /// Intersection over union using inclusive areas.
    ///
    /// Returns 0.0 whenever the intersection is empty, which also covers every
    /// pairing with a zero-area box.
    pub fn overlap_ratio(&self, other: &Self) -> f64 {
        let intersection = exact_area(&self.intersection(other));
        if intersection == 0 {
            return 0.0;
        }
        let union = exact_area(self) + exact_area(other) - intersection;
        if union <= 0 {
            return 0.0;
        }
        intersection as f64 / union as f64
    }

    /// True when `self` lies fully inside `outer`, boundaries inclusive.
    pub fn is_contained_in(&self, outer: &Self) -> bool {
        self.x1 >= outer.x1 && self.x2 <= outer.x2 && self.y1 >= outer.y1 && self.y2 <= outer.y2
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.x1 as f64 + self.x2 as f64) / 2.0,
            (self.y1 as f64 + self.y2 as f64) / 2.0,
        )
    }

    /// Edge-to-edge width (`x2 - x1`), as used by the proximity heuristics.
    pub fn span_width(&self) -> f64 {
        self.x2 as f64 - self.x1 as f64
    }

    /// Edge-to-edge height (`y2 - y1`).
    pub fn span_height(&self) -> f64 {
        self.y2 as f64 - self.y1 as f64
    }

    /// Edge-to-edge area (`span_width * span_height`), not clamped.
    pub fn span_area(&self) -> f64 {
        self.span_width() * self.span_height()
    }
}

/// Inclusive area of a box given by its corners; zero for inverted corners.
///
/// Saturates at `i64::MAX` for boxes spanning most of the `i32` plane.
pub fn calculate_area(x1: i32, y1: i32, x2: i32, y2: i32) -> i64 {
    let w = (x2 as i64 - x1 as i64 + 1).max(0);
    let h = (y2 as i64 - y1 as i64 + 1).max(0);
    w.saturating_mul(h)
}

// Widths and heights fit in 33 bits, so products and sums never overflow i128.
fn exact_area(b: &BoundingBox) -> i128 {
    let w = (b.x2 as i128 - b.x1 as i128 + 1).max(0);
    let h = (b.y2 as i128 - b.y1 as i128 + 1).max(0);
    w * h
}
