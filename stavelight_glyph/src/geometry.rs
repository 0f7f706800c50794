// Integer pixel rectangles.
//
// `Rectangle` follows the usual page-image convention: `(x, y)` is the top-left
// pixel and `width`/`height` count pixels, so the right-most column is
// `x + width - 1`. Intersection is area overlap; rectangles that merely touch
// along an edge do not intersect.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rectangle {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rectangle {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Smallest rectangle covering both inclusive corners.
    pub fn from_corners(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self::new(left, top, right - left + 1, bottom - top + 1)
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// Right-most pixel column (inclusive).
    pub fn right(&self) -> i32 {
        self.x + self.width - 1
    }

    /// Bottom-most pixel row (inclusive).
    pub fn bottom(&self) -> i32 {
        self.y + self.height - 1
    }

    pub fn area(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.width as i64 * self.height as i64
        }
    }

    pub fn intersects(&self, other: &Rectangle) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.x <= other.right()
            && other.x <= self.right()
            && self.y <= other.bottom()
            && other.y <= self.bottom()
    }

    /// Union of two rectangles. An empty side is ignored.
    pub fn union(&self, other: &Rectangle) -> Rectangle {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Rectangle::from_corners(
            self.x.min(other.x),
            self.y.min(other.y),
            self.right().max(other.right()),
            self.bottom().max(other.bottom()),
        )
    }

    pub fn translated(&self, dx: i32, dy: i32) -> Rectangle {
        Rectangle::new(self.x + dx, self.y + dy, self.width, self.height)
    }
}

impl fmt::Display for Rectangle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[x={},y={},w={},h={}]", self.x, self.y, self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corners_are_inclusive() {
        let r = Rectangle::from_corners(2, 3, 5, 3);
        assert_eq!(r, Rectangle::new(2, 3, 4, 1));
        assert_eq!(r.right(), 5);
        assert_eq!(r.bottom(), 3);
    }

    #[test]
    fn overlapping_rectangles_intersect_symmetrically() {
        let a = Rectangle::new(0, 0, 10, 10);
        let b = Rectangle::new(9, 9, 3, 3);
        assert!(a.intersects(&b));
        assert!(b.intersects(&a));
    }

    #[test]
    fn touching_edges_do_not_intersect() {
        let a = Rectangle::new(0, 0, 10, 10);
        let b = Rectangle::new(10, 0, 5, 5);
        assert!(!a.intersects(&b));
        assert!(!b.intersects(&a));
    }

    #[test]
    fn empty_never_intersects() {
        let a = Rectangle::new(0, 0, 10, 10);
        let e = Rectangle::new(2, 2, 0, 4);
        assert!(e.is_empty());
        assert!(!a.intersects(&e));
        assert_eq!(e.area(), 0);
    }

    #[test]
    fn union_covers_both() {
        let a = Rectangle::new(0, 0, 2, 2);
        let b = Rectangle::new(5, -3, 1, 1);
        let u = a.union(&b);
        assert_eq!(u, Rectangle::from_corners(0, -3, 5, 1));
        assert_eq!(a.union(&Rectangle::new(0, 0, 0, 0)), a);
    }

    #[test]
    fn translate_keeps_size() {
        let r = Rectangle::new(1, 1, 3, 3);
        let t = r.translated(-1, 2);
        assert_eq!(t, Rectangle::new(0, 3, 3, 3));
    }
}
