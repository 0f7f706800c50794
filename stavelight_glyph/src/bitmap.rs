// Glyph construction from binary masks.
//
// Turns a supplied ink mask into horizontal runs and groups runs on
// consecutive rows into sections: a run joins the section whose last run sits
// on the previous row and overlaps it, provided no other run of the current
// row claimed that section first. This is the same adjacency rule the lag
// builder applies upstream, in miniature.
//
// `reference` draws a coarse rendering of a shape at a given size. Tests,
// benchmarks and the trainer's `--synthetic` mode use it to get a labelled
// population without a scanned repository.

use crate::geometry::Rectangle;
use crate::glyph::{Glyph, Orientation, Section, SectionId};
use crate::run::Run;
use crate::shape::Shape;

/// Gray level given to every run built here.
const INK_LEVEL: u8 = 0;

struct OpenSection {
    first_pos: i32,
    last_pos: i32,
    runs: Vec<Run>,
}

/// Build a glyph whose top-left mask cell is `(x, y)`. `ink(col, row)` is
/// queried for every cell of the `width` x `height` mask.
pub fn from_mask(x: i32, y: i32, width: i32, height: i32, ink: impl Fn(i32, i32) -> bool) -> Glyph {
    let mut open: Vec<OpenSection> = Vec::new();
    for row in 0..height {
        let pos = y + row;
        let mut claimed = vec![false; open.len()];
        let mut col = 0;
        while col < width {
            if !ink(col, row) {
                col += 1;
                continue;
            }
            let start = col;
            while col < width && ink(col, row) {
                col += 1;
            }
            // Lengths are non-negative by construction.
            let Ok(run) = Run::new(x + start, col - start, INK_LEVEL) else {
                continue;
            };
            let target = open.iter().enumerate().position(|(k, s)| {
                !claimed[k]
                    && s.last_pos == pos - 1
                    && s.runs.last().is_some_and(|last| last.common_overlap(&run) > 0)
            });
            match target {
                Some(k) => {
                    claimed[k] = true;
                    open[k].last_pos = pos;
                    open[k].runs.push(run);
                }
                None => {
                    // Later runs of this row cannot join a section opened on it.
                    claimed.push(true);
                    open.push(OpenSection {
                        first_pos: pos,
                        last_pos: pos,
                        runs: vec![run],
                    });
                }
            }
        }
    }
    let sections = open
        .into_iter()
        .enumerate()
        .map(|(i, s)| Section::new(SectionId(i as u32), Orientation::Horizontal, s.first_pos, s.runs))
        .collect();
    Glyph::new(sections)
}

/// Build a glyph from text rows; `#` marks ink, anything else is background.
pub fn from_rows(x: i32, y: i32, rows: &[&str]) -> Glyph {
    let grid: Vec<Vec<bool>> = rows
        .iter()
        .map(|r| r.chars().map(|c| c == '#').collect())
        .collect();
    let width = grid.iter().map(Vec::len).max().unwrap_or(0) as i32;
    from_mask(x, y, width, grid.len() as i32, |c, r| {
        grid[r as usize].get(c as usize).copied().unwrap_or(false)
    })
}

/// Sample `inside(u, v)` at every cell centre of `bounds`, with `u` and `v`
/// spanning [-1, 1] left to right and top to bottom.
pub fn from_fn(bounds: Rectangle, inside: impl Fn(f64, f64) -> bool) -> Glyph {
    let (w, h) = (bounds.width.max(0), bounds.height.max(0));
    from_mask(bounds.x, bounds.y, w, h, |c, r| {
        let u = 2.0 * (c as f64 + 0.5) / w as f64 - 1.0;
        let v = 2.0 * (r as f64 + 0.5) / h as f64 - 1.0;
        inside(u, v)
    })
}

/// Coarse drawing of `shape` in a `size`-pixel box at `(x, y)`, labelled
/// with `shape`. `None` for shapes with no drawing (text, markers).
pub fn reference(shape: Shape, x: i32, y: i32, size: i32) -> Option<Glyph> {
    let square = Rectangle::new(x, y, size, size);
    let glyph = match shape {
        Shape::Dot | Shape::AugmentationDot | Shape::Staccato => {
            from_fn(square, |u, v| u * u + v * v <= 1.0)
        }
        Shape::Fermata => from_fn(square, fermata),
        Shape::FermataBelow => from_fn(square, |u, v| fermata(u, -v)),
        Shape::NoteheadBlack => from_fn(Rectangle::new(x, y, size, size * 3 / 4), |u, v| {
            let (a, b) = rotate(u, v, 0.35);
            a * a + (b / 0.7) * (b / 0.7) <= 1.0
        }),
        Shape::WholeNote => from_fn(Rectangle::new(x, y, size, size * 2 / 3), |u, v| {
            let e = u * u + v * v;
            let hole = (u / 0.45) * (u / 0.45) + (v / 0.8) * (v / 0.8);
            e <= 1.0 && hole > 1.0
        }),
        Shape::Sharp => from_fn(Rectangle::new(x, y, size * 2 / 3, size), |u, v| {
            let stems = (u + 0.4).abs() < 0.14 || (u - 0.4).abs() < 0.14;
            let bars = (v + 0.3 + 0.25 * u).abs() < 0.1 || (v - 0.3 + 0.25 * u).abs() < 0.1;
            stems || bars
        }),
        Shape::Flat => from_fn(Rectangle::new(x, y, size / 2, size), |u, v| {
            let stem = (u + 0.75).abs() < 0.2;
            let bowl_u = (u + 0.1) / 0.9;
            let bowl_v = (v - 0.55) / 0.4;
            let r = bowl_u * bowl_u + bowl_v * bowl_v;
            stem || (u > -0.75 && (0.45..=1.0).contains(&r))
        }),
        Shape::Natural => from_fn(Rectangle::new(x, y, size / 2, size), |u, v| {
            let left = (u + 0.7).abs() < 0.22 && v < 0.45;
            let right = (u - 0.7).abs() < 0.22 && v > -0.45;
            let bars = u.abs() < 0.9
                && ((v + 0.2 + 0.15 * u).abs() < 0.08 || (v - 0.25 + 0.15 * u).abs() < 0.08);
            left || right || bars
        }),
        Shape::FClef | Shape::FClefSmall => from_fn(square, |u, v| {
            let body_r = (u + 0.35) * (u + 0.35) + (v + 0.2) * (v + 0.2);
            let arc = (0.3..=0.55).contains(&body_r) && u > -0.8 && v < 0.6;
            let head = (u + 0.75) * (u + 0.75) + (v + 0.15) * (v + 0.15) < 0.04;
            let dots = (u - 0.8) * (u - 0.8) + (v + 0.45).powi(2) < 0.02
                || (u - 0.8) * (u - 0.8) + (v - 0.05).powi(2) < 0.02;
            arc || head || dots
        }),
        Shape::Stem => from_fn(Rectangle::new(x, y, (size / 8).max(1), size * 3), |_, _| true),
        Shape::Ledger => from_fn(Rectangle::new(x, y, size * 2, (size / 8).max(1)), |_, _| true),
        Shape::Text | Shape::Composite | Shape::Continuation => return None,
    };
    Some(glyph.with_shape(shape))
}

/// Upper half ring with a dot under its centre.
fn fermata(u: f64, v: f64) -> bool {
    let r = u * u + (v - 0.4) * (v - 0.4);
    let arc = v <= 0.4 && (0.55..=1.0).contains(&r);
    let dot = u * u + (v - 0.25) * (v - 0.25) < 0.03;
    arc || dot
}

fn rotate(u: f64, v: f64, angle: f64) -> (f64, f64) {
    let (s, c) = angle.sin_cos();
    (u * c + v * s, -u * s + v * c)
}
