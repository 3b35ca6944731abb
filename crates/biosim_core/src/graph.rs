//! Dependency graphs and update sequences.

use std::collections::BTreeSet;

use indexmap::IndexMap;

use crate::error::{MathError, Result};
use crate::object::ObjectIndex;
use crate::relocation::{relocate_retain, Relocate, RelocationSet};

pub type ObjectSet = BTreeSet<ObjectIndex>;

/// Dependency-ordered list of objects to recompute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateSequence(Vec<ObjectIndex>);

impl UpdateSequence {
    pub fn new(objects: Vec<ObjectIndex>) -> Self {
        Self(objects)
    }

    pub fn objects(&self) -> &[ObjectIndex] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = ObjectIndex> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, index: ObjectIndex) -> bool {
        self.0.contains(&index)
    }

    pub fn to_set(&self) -> ObjectSet {
        self.0.iter().copied().collect()
    }
}

impl Relocate for UpdateSequence {
    fn relocate(&mut self, relocations: &RelocationSet) {
        relocate_retain(&mut self.0, relocations);
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Node {
    prerequisites: Vec<ObjectIndex>,
    dependents: Vec<ObjectIndex>,
    computable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Directed graph over one network: an edge `B -> A` means recomputing `A`
/// reads the value of `B`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependencyGraph {
    nodes: IndexMap<ObjectIndex, Node>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, index: ObjectIndex) -> bool {
        self.nodes.contains_key(&index)
    }

    /// Adds `index` with the given prerequisites. `computable` marks objects
    /// that own a rule and therefore appear in update sequences.
    pub fn add_object(&mut self, index: ObjectIndex, prerequisites: &[ObjectIndex], computable: bool) {
        let node = self.nodes.entry(index).or_default();
        node.computable = computable;
        for prerequisite in prerequisites {
            if !node.prerequisites.contains(prerequisite) {
                node.prerequisites.push(*prerequisite);
            }
        }
        for prerequisite in prerequisites {
            let parent = self.nodes.entry(*prerequisite).or_default();
            if !parent.dependents.contains(&index) {
                parent.dependents.push(index);
            }
        }
    }

    pub fn remove_object(&mut self, index: ObjectIndex) {
        let Some(node) = self.nodes.shift_remove(&index) else {
            return;
        };
        for prerequisite in node.prerequisites {
            if let Some(parent) = self.nodes.get_mut(&prerequisite) {
                parent.dependents.retain(|d| *d != index);
            }
        }
        for dependent in node.dependents {
            if let Some(child) = self.nodes.get_mut(&dependent) {
                child.prerequisites.retain(|p| *p != index);
            }
        }
    }

    pub fn prerequisites(&self, index: ObjectIndex) -> &[ObjectIndex] {
        self.nodes
            .get(&index)
            .map(|node| node.prerequisites.as_slice())
            .unwrap_or_default()
    }

    pub fn dependents(&self, index: ObjectIndex) -> &[ObjectIndex] {
        self.nodes
            .get(&index)
            .map(|node| node.dependents.as_slice())
            .unwrap_or_default()
    }

    /// Objects downstream of `changed`, excluding `changed` itself.
    fn affected_by(&self, changed: &ObjectSet) -> ObjectSet {
        let mut affected = ObjectSet::new();
        let mut pending: Vec<ObjectIndex> = changed.iter().copied().collect();
        while let Some(index) = pending.pop() {
            for dependent in self.dependents(index) {
                if !changed.contains(dependent) && affected.insert(*dependent) {
                    pending.push(*dependent);
                }
            }
        }
        affected
    }

    /// Recompute order bringing `requested` up to date after `changed`.
    ///
    /// Contains every computable object that is downstream of `changed` and
    /// upstream of (or in) `requested`, minus `changed ∪ already_calculated`.
    /// Prerequisites always precede their dependents; ties keep the order in
    /// which `requested` and each node's prerequisites were listed.
    pub fn update_sequence(
        &self,
        changed: &ObjectSet,
        requested: &ObjectSet,
        already_calculated: &ObjectSet,
    ) -> Result<UpdateSequence> {
        let affected = self.affected_by(changed);
        let mut marks: IndexMap<ObjectIndex, Mark> = IndexMap::new();
        let mut sequence = Vec::new();
        for index in requested {
            self.visit(
                *index,
                changed,
                already_calculated,
                &affected,
                &mut marks,
                &mut sequence,
            )?;
        }
        Ok(UpdateSequence(sequence))
    }

    fn visit(
        &self,
        index: ObjectIndex,
        changed: &ObjectSet,
        already_calculated: &ObjectSet,
        affected: &ObjectSet,
        marks: &mut IndexMap<ObjectIndex, Mark>,
        sequence: &mut Vec<ObjectIndex>,
    ) -> Result<()> {
        if changed.contains(&index) || already_calculated.contains(&index) || !affected.contains(&index) {
            return Ok(());
        }
        match marks.get(&index) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => return Err(MathError::CyclicDependency(index)),
            None => {}
        }
        marks.insert(index, Mark::Visiting);
        let Some(node) = self.nodes.get(&index) else {
            marks.insert(index, Mark::Done);
            return Ok(());
        };
        for prerequisite in &node.prerequisites {
            self.visit(
                *prerequisite,
                changed,
                already_calculated,
                affected,
                marks,
                sequence,
            )?;
        }
        marks.insert(index, Mark::Done);
        if node.computable {
            sequence.push(index);
        }
        Ok(())
    }

    /// Computable objects whose rule reads nothing.
    pub fn constants(&self) -> Vec<ObjectIndex> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.computable && node.prerequisites.is_empty())
            .map(|(index, _)| *index)
            .collect()
    }
}

impl Relocate for DependencyGraph {
    fn relocate(&mut self, relocations: &RelocationSet) {
        let nodes = std::mem::take(&mut self.nodes);
        self.nodes = nodes
            .into_iter()
            .filter(|(index, _)| !relocations.is_removed(index.index()))
            .map(|(mut index, mut node)| {
                index.relocate(relocations);
                relocate_retain(&mut node.prerequisites, relocations);
                relocate_retain(&mut node.dependents, relocations);
                (index, node)
            })
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idx(i: usize) -> ObjectIndex {
        ObjectIndex::new(i)
    }

    fn set(indices: &[usize]) -> ObjectSet {
        indices.iter().copied().map(ObjectIndex::new).collect()
    }

    /// 0 -> 2, 1 -> 2, 2 -> 3, 1 -> 4
    fn diamond() -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        graph.add_object(idx(0), &[], false);
        graph.add_object(idx(1), &[], false);
        graph.add_object(idx(2), &[idx(0), idx(1)], true);
        graph.add_object(idx(3), &[idx(2)], true);
        graph.add_object(idx(4), &[idx(1)], true);
        graph
    }

    #[test]
    fn sequence_orders_prerequisites_first() {
        let graph = diamond();
        let sequence = graph
            .update_sequence(&set(&[0, 1]), &set(&[3, 4]), &ObjectSet::new())
            .expect("acyclic graph");
        assert_eq!(sequence.objects(), &[idx(2), idx(3), idx(4)]);
    }

    #[test]
    fn only_objects_affected_by_change_are_recomputed() {
        let graph = diamond();
        let sequence = graph
            .update_sequence(&set(&[0]), &set(&[3, 4]), &ObjectSet::new())
            .expect("acyclic graph");
        assert_eq!(sequence.objects(), &[idx(2), idx(3)]);
    }

    #[test]
    fn requested_subset_of_changed_is_empty() {
        let graph = diamond();
        let sequence = graph
            .update_sequence(&set(&[0, 1, 2]), &set(&[2]), &ObjectSet::new())
            .expect("acyclic graph");
        assert!(sequence.is_empty());
    }

    #[test]
    fn already_calculated_objects_are_skipped() {
        let graph = diamond();
        let sequence = graph
            .update_sequence(&set(&[0, 1]), &set(&[3]), &set(&[2]))
            .expect("acyclic graph");
        assert_eq!(sequence.objects(), &[idx(3)]);
    }

    #[test]
    fn requested_already_calculated_is_empty() {
        let graph = diamond();
        let sequence = graph
            .update_sequence(&set(&[0]), &set(&[2, 3]), &set(&[2, 3]))
            .expect("acyclic graph");
        assert!(sequence.is_empty());
    }

    #[test]
    fn cycle_is_reported() {
        let mut graph = DependencyGraph::new();
        graph.add_object(idx(0), &[], false);
        graph.add_object(idx(1), &[idx(0), idx(2)], true);
        graph.add_object(idx(2), &[idx(1)], true);
        let err = graph
            .update_sequence(&set(&[0]), &set(&[2]), &ObjectSet::new())
            .expect_err("cycle must be detected");
        assert!(matches!(err, MathError::CyclicDependency(_)));
    }

    #[test]
    fn remove_object_drops_edges() {
        let mut graph = diamond();
        graph.remove_object(idx(4));
        assert!(!graph.contains(idx(4)));
        assert_eq!(graph.dependents(idx(1)), &[idx(2)]);
    }

    #[test]
    fn constants_have_rules_without_prerequisites() {
        let mut graph = diamond();
        graph.add_object(idx(5), &[], true);
        assert_eq!(graph.constants(), vec![idx(5)]);
    }
}
