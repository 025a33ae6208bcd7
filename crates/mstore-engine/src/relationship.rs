//! Directed, typed relationship graph between record ids
//!
//! Both directions are indexed by relationship type, so a reverse lookup for
//! `manages` only returns parents that manage the id.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Key used for the reverse direction in [`RelationshipManager::get_all_relationships`]
pub const PARENTS_KEY: &str = "parents";

type Index = HashMap<String, BTreeMap<String, BTreeSet<String>>>;

#[derive(Default)]
struct Graph {
    /// parent -> type -> children
    forward: Index,
    /// child -> type -> parents
    reverse: Index,
}

fn link(index: &mut Index, from: &str, rel_type: &str, to: &str) -> bool {
    index
        .entry(from.to_string())
        .or_default()
        .entry(rel_type.to_string())
        .or_default()
        .insert(to.to_string())
}

fn unlink(index: &mut Index, from: &str, rel_type: &str, to: &str) -> bool {
    let Some(types) = index.get_mut(from) else {
        return false;
    };
    let Some(targets) = types.get_mut(rel_type) else {
        return false;
    };
    let removed = targets.remove(to);
    if targets.is_empty() {
        types.remove(rel_type);
    }
    if types.is_empty() {
        index.remove(from);
    }
    removed
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelationshipStats {
    /// Ids with at least one outgoing relationship
    pub ids_with_relationships: usize,
    pub total_relationships: usize,
    pub relationship_types: BTreeSet<String>,
    /// Ids with at least one incoming relationship
    pub reverse_entries: usize,
}

/// Thread-safe relationship store
#[derive(Default)]
pub struct RelationshipManager {
    graph: Mutex<Graph>,
}

impl RelationshipManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `parent -[rel_type]-> child`; adding an existing triple is a no-op
    pub fn add_relationship(&self, parent_id: &str, child_id: &str, rel_type: &str) {
        let mut graph = self.graph.lock();
        link(&mut graph.forward, parent_id, rel_type, child_id);
        link(&mut graph.reverse, child_id, rel_type, parent_id);
    }

    /// Remove a triple, pruning empty containers. Missing triples are ignored.
    pub fn remove_relationship(&self, parent_id: &str, child_id: &str, rel_type: &str) {
        let mut graph = self.graph.lock();
        unlink(&mut graph.forward, parent_id, rel_type, child_id);
        unlink(&mut graph.reverse, child_id, rel_type, parent_id);
    }

    #[must_use]
    pub fn has_relationship(&self, parent_id: &str, child_id: &str, rel_type: &str) -> bool {
        self.graph
            .lock()
            .forward
            .get(parent_id)
            .and_then(|types| types.get(rel_type))
            .is_some_and(|children| children.contains(child_id))
    }

    /// Children of `id` with `rel_type`, or its parents with `rel_type` when `reverse`
    #[must_use]
    pub fn get_relationships(&self, id: &str, rel_type: &str, reverse: bool) -> Vec<String> {
        let graph = self.graph.lock();
        let index = if reverse { &graph.reverse } else { &graph.forward };
        index
            .get(id)
            .and_then(|types| types.get(rel_type))
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Outgoing relationships by type, plus a `parents` entry with every
    /// incoming id regardless of type (omitted when there are none)
    #[must_use]
    pub fn get_all_relationships(&self, id: &str) -> BTreeMap<String, Vec<String>> {
        let graph = self.graph.lock();
        let mut result: BTreeMap<String, Vec<String>> = graph
            .forward
            .get(id)
            .map(|types| {
                types
                    .iter()
                    .map(|(rel_type, ids)| (rel_type.clone(), ids.iter().cloned().collect()))
                    .collect()
            })
            .unwrap_or_default();

        if let Some(types) = graph.reverse.get(id) {
            let parents: BTreeSet<&String> = types.values().flatten().collect();
            if !parents.is_empty() {
                result.insert(
                    PARENTS_KEY.to_string(),
                    parents.into_iter().cloned().collect(),
                );
            }
        }
        result
    }

    /// Remove every relationship where `id` is the parent or the child
    pub fn remove_all_relationships(&self, id: &str) {
        let mut graph = self.graph.lock();
        let graph = &mut *graph;

        if let Some(types) = graph.forward.remove(id) {
            for (rel_type, children) in types {
                for child in children {
                    unlink(&mut graph.reverse, &child, &rel_type, id);
                }
            }
        }
        if let Some(types) = graph.reverse.remove(id) {
            for (rel_type, parents) in types {
                for parent in parents {
                    unlink(&mut graph.forward, &parent, &rel_type, id);
                }
            }
        }
    }

    pub fn clear(&self) {
        let mut graph = self.graph.lock();
        graph.forward.clear();
        graph.reverse.clear();
    }

    #[must_use]
    pub fn stats(&self) -> RelationshipStats {
        let graph = self.graph.lock();
        let mut total_relationships = 0;
        let mut relationship_types = BTreeSet::new();
        for types in graph.forward.values() {
            for (rel_type, children) in types {
                total_relationships += children.len();
                relationship_types.insert(rel_type.clone());
            }
        }
        RelationshipStats {
            ids_with_relationships: graph.forward.len(),
            total_relationships,
            relationship_types,
            reverse_entries: graph.reverse.len(),
        }
    }
}
