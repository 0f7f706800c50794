// Orthogonal Legendre moments.
//
// The descriptor fed to every classifier backend. Pixel centres are shifted so
// the centroid sits at the origin, then scaled by one uniform factor so the
// farthest pixel cell just fits inside [-1, 1] on both axes. Each pixel
// contributes its cell area times `P_p(u) * P_q(v)`, and the sum is scaled by
// the usual `(2p + 1)(2q + 1) / 4` normalisation. Centring removes translation
// and the uniform scaling removes size, while the aspect ratio survives in the
// higher-order terms.
//
// Coefficients `(p, q)` with `p + q <= MOMENT_ORDER` are stored by total order
// first, then by `p`, giving `MOMENT_COUNT` values.
//
// Extraction is a pure function of the glyph's pixel list. Pixels are visited
// in section/run order and accumulated in that fixed order, so two glyphs with
// field-identical sections always yield bit-identical vectors.

use crate::glyph::Glyph;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Highest polynomial order.
pub const MOMENT_ORDER: usize = 10;

/// Number of coefficients with `p + q <= MOMENT_ORDER`.
pub const MOMENT_COUNT: usize = (MOMENT_ORDER + 1) * (MOMENT_ORDER + 2) / 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeatureError {
    #[error("degenerate glyph {0}: no pixels to describe")]
    DegenerateGlyph(String),
}

/// Fixed-length moment descriptor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector(Vec<f64>);

impl FeatureVector {
    pub fn from_values(values: Vec<f64>) -> Self {
        Self(values)
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Coefficient `lambda_pq`. Panics if `p + q > MOMENT_ORDER`.
    pub fn moment(&self, p: usize, q: usize) -> f64 {
        self.0[moment_index(p, q)]
    }
}

/// Position of `lambda_pq` in a `FeatureVector`.
pub fn moment_index(p: usize, q: usize) -> usize {
    let n = p + q;
    assert!(n <= MOMENT_ORDER, "moment order {n} exceeds {MOMENT_ORDER}");
    n * (n + 1) / 2 + p
}

/// Compute the Legendre descriptor of a glyph.
pub fn extract(glyph: &Glyph) -> Result<FeatureVector, FeatureError> {
    let weight = glyph.weight();
    if weight == 0 {
        return Err(FeatureError::DegenerateGlyph(glyph.to_string()));
    }
    let bounds = glyph.bounds();

    // Centroid of pixel centres, relative to the bounds origin to keep the
    // sums small.
    let (mut sx, mut sy) = (0.0f64, 0.0f64);
    for (x, y) in glyph.pixels() {
        sx += (x - bounds.x) as f64 + 0.5;
        sy += (y - bounds.y) as f64 + 0.5;
    }
    let n = weight as f64;
    let (cx, cy) = (sx / n, sy / n);

    let mut half_extent = 0.0f64;
    for (x, y) in glyph.pixels() {
        let dx = ((x - bounds.x) as f64 + 0.5 - cx).abs();
        let dy = ((y - bounds.y) as f64 + 0.5 - cy).abs();
        half_extent = half_extent.max(dx).max(dy);
    }
    // Cover the whole cell of the outermost pixel, not just its centre.
    let scale = 1.0 / (half_extent + 0.5);
    let cell_area = scale * scale;

    let columns: Vec<[f64; MOMENT_ORDER + 1]> = (0..bounds.width)
        .map(|i| legendre_row((i as f64 + 0.5 - cx) * scale))
        .collect();
    let rows: Vec<[f64; MOMENT_ORDER + 1]> = (0..bounds.height)
        .map(|j| legendre_row((j as f64 + 0.5 - cy) * scale))
        .collect();

    let mut sums = [0.0f64; MOMENT_COUNT];
    for (x, y) in glyph.pixels() {
        let px = &columns[(x - bounds.x) as usize];
        let py = &rows[(y - bounds.y) as usize];
        for total in 0..=MOMENT_ORDER {
            for p in 0..=total {
                sums[total * (total + 1) / 2 + p] += px[p] * py[total - p];
            }
        }
    }

    let mut values = Vec::with_capacity(MOMENT_COUNT);
    for total in 0..=MOMENT_ORDER {
        for p in 0..=total {
            let q = total - p;
            let norm = ((2 * p + 1) * (2 * q + 1)) as f64 / 4.0;
            values.push(norm * cell_area * sums[total * (total + 1) / 2 + p]);
        }
    }
    Ok(FeatureVector(values))
}

/// `P_0(t) ..= P_ORDER(t)` by Bonnet's recurrence.
fn legendre_row(t: f64) -> [f64; MOMENT_ORDER + 1] {
    let mut p = [0.0f64; MOMENT_ORDER + 1];
    p[0] = 1.0;
    p[1] = t;
    for k in 1..MOMENT_ORDER {
        let kf = k as f64;
        p[k + 1] = ((2.0 * kf + 1.0) * t * p[k] - kf * p[k - 1]) / (kf + 1.0);
    }
    p
}
