//! Damage region arithmetic.
//!
//! A [`Region`] is an unordered set of non-overlapping rectangles. It is the
//! currency of the encode path: damage comes in as a region, the
//! shift-tolerant scanner carves covered tiles out of it, and the residual
//! is handed to the normal encoder.
//!
//! The representation favours simplicity over minimality: subtraction may
//! split a rectangle into up to four pieces and no coalescing pass is run.
//! Rect counts stay small in practice (damage per update is a handful of
//! rects), so O(n) scans are fine.

use crate::Rect;

/// A set of disjoint rectangles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Region {
    rects: Vec<Rect>,
}

impl Region {
    /// The empty region.
    pub fn new() -> Self {
        Self::default()
    }

    /// Region covering a single rectangle.
    pub fn from_rect(rect: Rect) -> Self {
        let mut region = Self::new();
        region.add(rect);
        region
    }

    /// True if the region covers no pixels.
    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    /// The rectangles making up this region.
    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    /// Total covered area in pixels.
    pub fn area(&self) -> u64 {
        self.rects.iter().map(Rect::area).sum()
    }

    /// Add a rectangle, keeping members disjoint.
    ///
    /// The incoming rect is first reduced by subtracting the existing
    /// coverage, then the leftover pieces are appended.
    pub fn add(&mut self, rect: Rect) {
        if rect.is_empty() {
            return;
        }
        let mut pieces = vec![rect];
        for existing in &self.rects {
            let mut next = Vec::new();
            for piece in pieces {
                subtract_rect(&piece, existing, &mut next);
            }
            pieces = next;
            if pieces.is_empty() {
                return;
            }
        }
        self.rects.extend(pieces);
    }

    /// Remove a rectangle from the region.
    pub fn subtract(&mut self, rect: &Rect) {
        if rect.is_empty() || self.rects.is_empty() {
            return;
        }
        let mut out = Vec::with_capacity(self.rects.len());
        for existing in &self.rects {
            subtract_rect(existing, rect, &mut out);
        }
        self.rects = out;
    }

    /// Does any member rectangle overlap `rect`?
    pub fn intersects(&self, rect: &Rect) -> bool {
        self.rects.iter().any(|r| r.intersects(rect))
    }

    /// Bounding box of the whole region (empty rect if empty).
    pub fn bounding_rect(&self) -> Rect {
        self.rects
            .iter()
            .fold(Rect::new(0, 0, 0, 0), |acc, r| acc.union_bounding(r))
    }

    /// Drain the member rectangles.
    pub fn take_rects(&mut self) -> Vec<Rect> {
        std::mem::take(&mut self.rects)
    }
}

impl From<Rect> for Region {
    fn from(rect: Rect) -> Self {
        Region::from_rect(rect)
    }
}

/// Append `a - b` (up to four rects) to `out`.
fn subtract_rect(a: &Rect, b: &Rect, out: &mut Vec<Rect>) {
    let Some(overlap) = a.intersect(b) else {
        out.push(*a);
        return;
    };

    // Band above the overlap.
    if overlap.y > a.y {
        out.push(Rect::new(a.x, a.y, a.width, (overlap.y - a.y) as u32));
    }
    // Band below the overlap.
    if overlap.bottom() < a.bottom() {
        out.push(Rect::new(
            a.x,
            overlap.bottom(),
            a.width,
            (a.bottom() - overlap.bottom()) as u32,
        ));
    }
    // Left sliver within the overlap's vertical band.
    if overlap.x > a.x {
        out.push(Rect::new(
            a.x,
            overlap.y,
            (overlap.x - a.x) as u32,
            overlap.height,
        ));
    }
    // Right sliver.
    if overlap.right() < a.right() {
        out.push(Rect::new(
            overlap.right(),
            overlap.y,
            (a.right() - overlap.right()) as u32,
            overlap.height,
        ));
    }
}
