// Glyph registry for one system.
//
// Owns the system's glyphs, hands out identities and keeps an R-tree over the
// bounds of active glyphs. Pattern passes read through it and change it
// through two entry points only:
// - `build_transient_compound` merges registered glyphs into an unregistered
//   compound without touching any state;
// - `add_glyph` commits a glyph, assigns its id and indexes it. Committing a
//   compound marks its parts superseded and drops them from the spatial
//   index. They stay in the registry for inspection but no longer show up
//   as candidates.
//
// Ids come from a `GlyphIdAllocator`, an atomic counter that several
// registries may share so systems processed in parallel never collide.
// Iteration is in id order (`BTreeMap`), and spatial lookups are sorted by
// left x, then top y, then id, so every consumer sees one fixed order.

use crate::geometry::Rectangle;
use crate::glyph::{Evaluation, Glyph, GlyphId};
use crate::shape::Shape;
use rstar::primitives::{GeomWithData, Rectangle as IndexRect};
use rstar::{AABB, RTree};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("unknown glyph {0}")]
    UnknownGlyph(GlyphId),
    #[error("glyph {glyph} was superseded by {by}")]
    Superseded { glyph: GlyphId, by: GlyphId },
    #[error("a compound needs at least one part")]
    EmptyCompound,
}

/// Monotonic glyph id source, shareable across threads.
#[derive(Clone, Debug)]
pub struct GlyphIdAllocator(Arc<AtomicU64>);

impl GlyphIdAllocator {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(1)))
    }

    pub fn next_id(&self) -> GlyphId {
        GlyphId(self.0.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for GlyphIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

type IndexEntry = GeomWithData<IndexRect<[i32; 2]>, GlyphId>;

fn index_entry(bounds: Rectangle, id: GlyphId) -> IndexEntry {
    GeomWithData::new(
        IndexRect::from_corners([bounds.x, bounds.y], [bounds.right(), bounds.bottom()]),
        id,
    )
}

#[derive(Default)]
pub struct GlyphRegistry {
    allocator: GlyphIdAllocator,
    glyphs: BTreeMap<GlyphId, Glyph>,
    index: RTree<IndexEntry>,
}

impl GlyphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry drawing ids from a shared allocator.
    pub fn with_allocator(allocator: GlyphIdAllocator) -> Self {
        Self {
            allocator,
            glyphs: BTreeMap::new(),
            index: RTree::new(),
        }
    }

    pub fn allocator(&self) -> &GlyphIdAllocator {
        &self.allocator
    }

    /// Register `glyph` and return its id. If an active glyph with the same
    /// geometry is already registered, that glyph's id is returned instead;
    /// a compound's parts are superseded by whichever glyph stands for it.
    pub fn add_glyph(&mut self, mut glyph: Glyph) -> GlyphId {
        let bounds = glyph.bounds();
        if !bounds.is_empty() {
            let duplicate = self
                .lookup_intersecting(bounds)
                .into_iter()
                .find(|id| self.glyphs[id].has_same_geometry(&glyph));
            if let Some(existing) = duplicate {
                debug!(glyph = %existing, "geometry already registered");
                self.supersede(glyph.parts(), existing);
                return existing;
            }
        }

        let id = self.allocator.next_id();
        glyph.set_id(id);
        self.supersede(glyph.parts(), id);
        if !bounds.is_empty() {
            self.index.insert(index_entry(bounds, id));
        }
        self.glyphs.insert(id, glyph);
        id
    }

    /// Mark `parts` as replaced by `by` and drop them from the index.
    fn supersede(&mut self, parts: &[GlyphId], by: GlyphId) {
        for &part in parts {
            if part == by {
                continue;
            }
            if let Some(old) = self.glyphs.get_mut(&part) {
                if old.is_active() && !old.bounds().is_empty() {
                    self.index.remove(&index_entry(old.bounds(), part));
                }
                old.set_superseded_by(by);
            }
        }
    }

    /// Merge registered, active glyphs into an unregistered compound.
    pub fn build_transient_compound(&self, ids: &[GlyphId]) -> Result<Glyph, RegistryError> {
        if ids.is_empty() {
            return Err(RegistryError::EmptyCompound);
        }
        let parts = ids
            .iter()
            .map(|&id| self.active(id))
            .collect::<Result<Vec<&Glyph>, _>>()?;
        Ok(Glyph::compound_of(&parts))
    }

    pub fn get(&self, id: GlyphId) -> Option<&Glyph> {
        self.glyphs.get(&id)
    }

    /// The glyph, provided it has not been superseded.
    pub fn active(&self, id: GlyphId) -> Result<&Glyph, RegistryError> {
        let glyph = self.glyphs.get(&id).ok_or(RegistryError::UnknownGlyph(id))?;
        match glyph.superseded_by() {
            Some(by) => Err(RegistryError::Superseded { glyph: id, by }),
            None => Ok(glyph),
        }
    }

    pub fn set_evaluation(&mut self, id: GlyphId, evaluation: Evaluation) -> Result<(), RegistryError> {
        self.glyphs
            .get_mut(&id)
            .ok_or(RegistryError::UnknownGlyph(id))?
            .set_evaluation(evaluation);
        Ok(())
    }

    pub fn set_shape(&mut self, id: GlyphId, shape: Option<Shape>) -> Result<(), RegistryError> {
        self.glyphs
            .get_mut(&id)
            .ok_or(RegistryError::UnknownGlyph(id))?
            .set_shape(shape);
        Ok(())
    }

    /// Every glyph ever registered, superseded ones included, in id order.
    pub fn glyphs(&self) -> impl Iterator<Item = &Glyph> + '_ {
        self.glyphs.values()
    }

    /// Ids of active glyphs, ascending.
    pub fn active_ids(&self) -> Vec<GlyphId> {
        self.glyphs
            .iter()
            .filter(|(_, g)| g.is_active())
            .map(|(&id, _)| id)
            .collect()
    }

    /// Active glyphs whose bounds share at least one pixel with `area`,
    /// ordered by left x, top y, then id.
    pub fn lookup_intersecting(&self, area: Rectangle) -> Vec<GlyphId> {
        if area.is_empty() {
            return Vec::new();
        }
        let envelope = AABB::from_corners([area.x, area.y], [area.right(), area.bottom()]);
        let mut hits: Vec<(i32, i32, GlyphId)> = self
            .index
            .locate_in_envelope_intersecting(&envelope)
            .filter_map(|entry| {
                let glyph = self.glyphs.get(&entry.data)?;
                let b = glyph.bounds();
                b.intersects(&area).then_some((b.x, b.y, entry.data))
            })
            .collect();
        hits.sort_unstable();
        hits.into_iter().map(|(_, _, id)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.glyphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.glyphs.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.index.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::glyph::tests::block;

    #[test]
    fn ids_are_monotonic_across_shared_registries() {
        let allocator = GlyphIdAllocator::new();
        let mut a = GlyphRegistry::with_allocator(allocator.clone());
        let mut b = GlyphRegistry::with_allocator(allocator);
        let x = a.add_glyph(block(0, 0, 2, 2));
        let y = b.add_glyph(block(0, 0, 2, 2));
        let z = a.add_glyph(block(5, 5, 2, 2));
        assert!(x < y && y < z);
    }

    #[test]
    fn lookup_is_sorted_and_excludes_touching() {
        let mut reg = GlyphRegistry::new();
        let right = reg.add_glyph(block(6, 0, 3, 3));
        let left_low = reg.add_glyph(block(2, 4, 3, 3));
        let left_high = reg.add_glyph(block(2, 0, 3, 3));
        // Touches the query's right edge from outside.
        reg.add_glyph(block(10, 0, 2, 2));
        let hits = reg.lookup_intersecting(Rectangle::new(0, 0, 10, 10));
        assert_eq!(hits, vec![left_high, left_low, right]);
    }

    #[test]
    fn committing_a_compound_supersedes_parts() {
        let mut reg = GlyphRegistry::new();
        let a = reg.add_glyph(block(0, 0, 4, 4));
        let b = reg.add_glyph(block(4, 0, 2, 2));
        let compound = reg.build_transient_compound(&[a, b]).unwrap();
        // Transient: nothing changed yet.
        assert_eq!(reg.active_count(), 2);
        let c = reg.add_glyph(compound);

        assert_eq!(reg.active_ids(), vec![c]);
        assert_eq!(reg.get(a).unwrap().superseded_by(), Some(c));
        assert_eq!(reg.lookup_intersecting(Rectangle::new(0, 0, 10, 10)), vec![c]);
        assert_eq!(
            reg.build_transient_compound(&[a]).unwrap_err(),
            RegistryError::Superseded { glyph: a, by: c }
        );
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn identical_geometry_is_not_registered_twice() {
        let mut reg = GlyphRegistry::new();
        let a = reg.add_glyph(block(1, 1, 3, 3));
        assert_eq!(reg.add_glyph(block(1, 1, 3, 3)), a);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn compound_matching_a_registered_glyph_still_supersedes_parts() {
        let mut reg = GlyphRegistry::new();
        let a = reg.add_glyph(block(0, 0, 4, 4));
        let b = reg.add_glyph(block(4, 0, 2, 2));
        // Same pixels as a + b, registered on its own.
        let whole = Glyph::compound_of(&[&block(0, 0, 4, 4), &block(4, 0, 2, 2)]);
        let existing = reg.add_glyph(whole);

        let compound = reg.build_transient_compound(&[a, b]).unwrap();
        assert_eq!(reg.add_glyph(compound), existing);
        assert_eq!(reg.len(), 3);
        assert_eq!(reg.active_ids(), vec![existing]);
        assert_eq!(reg.get(a).unwrap().superseded_by(), Some(existing));
        assert_eq!(reg.get(b).unwrap().superseded_by(), Some(existing));
        assert_eq!(reg.active_count(), 1);
    }

    #[test]
    fn unknown_ids_are_reported() {
        let mut reg = GlyphRegistry::new();
        assert_eq!(
            reg.build_transient_compound(&[GlyphId(42)]).unwrap_err(),
            RegistryError::UnknownGlyph(GlyphId(42))
        );
        assert_eq!(
            reg.build_transient_compound(&[]).unwrap_err(),
            RegistryError::EmptyCompound
        );
        assert!(reg.set_evaluation(GlyphId(1), Evaluation::new(Shape::Dot, 1.0)).is_err());
    }

    #[test]
    fn virtual_glyphs_are_kept_but_not_indexed_when_empty() {
        let mut reg = GlyphRegistry::new();
        let id = reg.add_glyph(Glyph::new_virtual(Rectangle::new(0, 0, 0, 0), Shape::Text));
        assert!(reg.get(id).unwrap().is_virtual());
        assert_eq!(reg.active_count(), 0);
    }
}
