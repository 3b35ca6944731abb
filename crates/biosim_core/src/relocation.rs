//! Range relocation applied to every stored index when the arena is resized.
//!
//! A [`RelocationSet`] is planned once per resize from the old and new
//! segment layouts. Growth appends slots at the end of a segment and
//! shrinking truncates its end, so each segment contributes at most one
//! preserved range. Consecutive preserved ranges sharing an offset are merged.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

use crate::arena::{Segment, SegmentLayout};
use crate::object::ObjectIndex;

/// One contiguous old range moved to a new base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub old_start: usize,
    pub old_end: usize,
    pub new_start: usize,
    pub offset: isize,
}

impl Relocation {
    fn contains(&self, index: usize) -> bool {
        (self.old_start..self.old_end).contains(&index)
    }

    fn apply(&self, index: usize) -> usize {
        (index as isize + self.offset) as usize
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelocationSet {
    relocations: Vec<Relocation>,
    removed: Vec<Range<usize>>,
}

impl RelocationSet {
    pub fn plan(old: &SegmentLayout, new: &SegmentLayout) -> Self {
        let mut set = Self::default();
        for segment in Segment::ALL {
            let old_range = old.range(segment);
            let new_range = new.range(segment);
            let kept = old_range.len().min(new_range.len());
            if kept > 0 {
                set.push(Relocation {
                    old_start: old_range.start,
                    old_end: old_range.start + kept,
                    new_start: new_range.start,
                    offset: new_range.start as isize - old_range.start as isize,
                });
            }
            if old_range.len() > kept {
                set.removed.push(old_range.start + kept..old_range.end);
            }
        }
        set
    }

    fn push(&mut self, relocation: Relocation) {
        if let Some(last) = self.relocations.last_mut() {
            if last.old_end == relocation.old_start && last.offset == relocation.offset {
                last.old_end = relocation.old_end;
                return;
            }
        }
        self.relocations.push(relocation);
    }

    pub fn relocations(&self) -> &[Relocation] {
        &self.relocations
    }

    pub fn len(&self) -> usize {
        self.relocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relocations.is_empty()
    }

    /// True when no slot moves and none is removed.
    pub fn is_identity(&self) -> bool {
        self.removed.is_empty() && self.relocations.iter().all(|r| r.offset == 0)
    }

    pub fn is_removed(&self, index: usize) -> bool {
        self.removed.iter().any(|range| range.contains(&index))
    }

    /// New position of `index`; `None` when its slot was removed.
    pub fn map(&self, index: usize) -> Option<usize> {
        if self.is_removed(index) {
            return None;
        }
        Some(self.relocate_index(index))
    }

    /// New position of `index`. An index covered by no relocation keeps
    /// its coordinates.
    pub fn relocate_index(&self, index: usize) -> usize {
        let position = self
            .relocations
            .partition_point(|relocation| relocation.old_start <= index);
        if position == 0 {
            return index;
        }
        let relocation = &self.relocations[position - 1];
        if relocation.contains(index) {
            relocation.apply(index)
        } else {
            index
        }
    }
}

/// Implemented by everything that stores arena indices.
pub trait Relocate {
    fn relocate(&mut self, relocations: &RelocationSet);
}

impl<T: Relocate> Relocate for Option<T> {
    fn relocate(&mut self, relocations: &RelocationSet) {
        if let Some(inner) = self {
            inner.relocate(relocations);
        }
    }
}

impl<T: Relocate> Relocate for Vec<T> {
    fn relocate(&mut self, relocations: &RelocationSet) {
        for item in self.iter_mut() {
            item.relocate(relocations);
        }
    }
}

impl<A: Relocate, B: Relocate> Relocate for (A, B) {
    fn relocate(&mut self, relocations: &RelocationSet) {
        self.0.relocate(relocations);
        self.1.relocate(relocations);
    }
}

impl<K: Ord + Clone> Relocate for BTreeMap<K, ObjectIndex> {
    fn relocate(&mut self, relocations: &RelocationSet) {
        self.retain(|_, index| !relocations.is_removed(index.index()));
        for index in self.values_mut() {
            index.relocate(relocations);
        }
    }
}

impl Relocate for BTreeSet<ObjectIndex> {
    fn relocate(&mut self, relocations: &RelocationSet) {
        *self = std::mem::take(self)
            .into_iter()
            .filter(|index| !relocations.is_removed(index.index()))
            .map(|mut index| {
                index.relocate(relocations);
                index
            })
            .collect();
    }
}

/// Relocates an ordered index list, dropping indices whose slots were removed.
pub fn relocate_retain(indices: &mut Vec<ObjectIndex>, relocations: &RelocationSet) {
    indices.retain(|index| !relocations.is_removed(index.index()));
    indices.relocate(relocations);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::SegmentSizes;

    fn layout(entries: &[(Segment, usize)]) -> SegmentLayout {
        let mut sizes = SegmentSizes::default();
        for (segment, size) in entries {
            sizes.set(*segment, *size);
        }
        SegmentLayout::new(sizes)
    }

    #[test]
    fn unchanged_layout_is_identity() {
        let old = layout(&[(Segment::ExtensiveValues, 3), (Segment::Fluxes, 2)]);
        let set = RelocationSet::plan(&old, &old);
        assert!(set.is_identity());
        assert_eq!(set.len(), 1);
        assert_eq!(set.relocate_index(4), 4);
    }

    #[test]
    fn growth_shifts_later_segments() {
        let old = layout(&[(Segment::ExtensiveValues, 2), (Segment::Fluxes, 2)]);
        let new = layout(&[(Segment::ExtensiveValues, 3), (Segment::Fluxes, 2)]);
        let set = RelocationSet::plan(&old, &new);
        assert_eq!(set.len(), 2);
        assert_eq!(set.relocate_index(1), 1);
        assert_eq!(set.relocate_index(2), 3);
        assert_eq!(set.relocate_index(3), 4);
        assert_eq!(set.relocations()[1].offset, 1);
    }

    #[test]
    fn shrink_removes_segment_tail() {
        let old = layout(&[(Segment::ExtensiveValues, 3), (Segment::Fluxes, 1)]);
        let new = layout(&[(Segment::ExtensiveValues, 1), (Segment::Fluxes, 1)]);
        let set = RelocationSet::plan(&old, &new);
        assert!(set.is_removed(1));
        assert!(set.is_removed(2));
        assert_eq!(set.map(2), None);
        assert_eq!(set.map(3), Some(1));
    }

    #[test]
    fn unmapped_index_keeps_coordinates() {
        let old = layout(&[(Segment::ExtensiveValues, 2)]);
        let new = layout(&[(Segment::ExtensiveValues, 2), (Segment::TransitionTimes, 1)]);
        let set = RelocationSet::plan(&old, &new);
        assert_eq!(set.relocate_index(2), 2);
        assert_eq!(set.map(7), Some(7));
    }

    #[test]
    fn relocate_retain_drops_removed_indices() {
        let old = layout(&[(Segment::ExtensiveValues, 3), (Segment::Fluxes, 1)]);
        let new = layout(&[(Segment::ExtensiveValues, 2), (Segment::Fluxes, 1)]);
        let set = RelocationSet::plan(&old, &new);
        let mut indices = vec![ObjectIndex::new(0), ObjectIndex::new(2), ObjectIndex::new(3)];
        relocate_retain(&mut indices, &set);
        assert_eq!(indices, vec![ObjectIndex::new(0), ObjectIndex::new(2)]);
    }

    #[test]
    fn map_values_are_relocated_and_pruned() {
        let old = layout(&[(Segment::ExtensiveValues, 2), (Segment::Fluxes, 2)]);
        let new = layout(&[(Segment::ExtensiveValues, 4), (Segment::Fluxes, 1)]);
        let set = RelocationSet::plan(&old, &new);
        let mut map = BTreeMap::new();
        map.insert("a", ObjectIndex::new(1));
        map.insert("flux0", ObjectIndex::new(2));
        map.insert("flux1", ObjectIndex::new(3));
        map.relocate(&set);
        assert_eq!(map.get("a"), Some(&ObjectIndex::new(1)));
        assert_eq!(map.get("flux0"), Some(&ObjectIndex::new(4)));
        assert!(!map.contains_key("flux1"));
    }
}
