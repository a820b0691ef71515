//! Damage regions as lists of boxes.

use smallvec::SmallVec;

/// A half-open rectangle `[x1, x2) × [y1, y2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BoxRect {
    /// Left edge (inclusive).
    pub x1: i32,
    /// Top edge (inclusive).
    pub y1: i32,
    /// Right edge (exclusive).
    pub x2: i32,
    /// Bottom edge (exclusive).
    pub y2: i32,
}

impl BoxRect {
    /// Create a box from its edges.
    pub const fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Box at the origin with the given size.
    pub fn from_size(width: u32, height: u32) -> Self {
        Self::new(0, 0, width as i32, height as i32)
    }

    /// Width in pixels (0 for an empty box).
    pub fn width(&self) -> u32 {
        (self.x2 - self.x1).max(0) as u32
    }

    /// Height in pixels (0 for an empty box).
    pub fn height(&self) -> u32 {
        (self.y2 - self.y1).max(0) as u32
    }

    /// Returns true if the box covers no pixels.
    pub fn is_empty(&self) -> bool {
        self.x2 <= self.x1 || self.y2 <= self.y1
    }

    /// Intersection of two boxes, `None` if they do not overlap.
    pub fn intersect(&self, other: &BoxRect) -> Option<BoxRect> {
        let b = BoxRect::new(
            self.x1.max(other.x1),
            self.y1.max(other.y1),
            self.x2.min(other.x2),
            self.y2.min(other.y2),
        );
        (!b.is_empty()).then_some(b)
    }
}

/// A set of boxes describing the pixels to present.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Region {
    rects: SmallVec<[BoxRect; 4]>,
}

impl Region {
    /// An empty region.
    pub fn new() -> Self {
        Self::default()
    }

    /// A region of one box.
    pub fn from_rect(rect: BoxRect) -> Self {
        let mut region = Self::new();
        region.push(rect);
        region
    }

    /// Add a box; empty boxes are dropped.
    pub fn push(&mut self, rect: BoxRect) {
        if !rect.is_empty() {
            self.rects.push(rect);
        }
    }

    /// The boxes of the region.
    pub fn rects(&self) -> &[BoxRect] {
        &self.rects
    }

    /// Returns true if the region covers no pixels.
    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    /// Bounding box of the region.
    pub fn extents(&self) -> Option<BoxRect> {
        self.rects.iter().copied().reduce(|a, b| {
            BoxRect::new(a.x1.min(b.x1), a.y1.min(b.y1), a.x2.max(b.x2), a.y2.max(b.y2))
        })
    }

    /// The part of the region inside `bounds`.
    pub fn clipped(&self, bounds: &BoxRect) -> Region {
        self.rects
            .iter()
            .filter_map(|r| r.intersect(bounds))
            .collect()
    }
}

impl FromIterator<BoxRect> for Region {
    fn from_iter<I: IntoIterator<Item = BoxRect>>(iter: I) -> Self {
        let mut region = Region::new();
        for rect in iter {
            region.push(rect);
        }
        region
    }
}
