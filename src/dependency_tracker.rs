//! Dependency graph between flags and segments, used to find which flags are affected by a change.
use std::collections::{BTreeSet, HashMap};

use serde::Deserialize;

use crate::{DataKind, KindAndKey};

const SEGMENT_MATCH_OPERATOR: &str = "segmentMatch";

/// The part of a flag or segment that references other items. Everything else in the item is
/// ignored.
#[derive(Debug, Default, Deserialize)]
struct ItemReferences {
    #[serde(default)]
    prerequisites: Vec<Prerequisite>,
    #[serde(default)]
    rules: Vec<Rule>,
}

#[derive(Debug, Deserialize)]
struct Prerequisite {
    key: String,
}

#[derive(Debug, Deserialize)]
struct Rule {
    #[serde(default)]
    clauses: Vec<Clause>,
}

#[derive(Debug, Deserialize)]
struct Clause {
    #[serde(default)]
    op: String,
    #[serde(default)]
    values: Vec<serde_json::Value>,
}

/// Extract the set of items `item` depends on.
///
/// Flags depend on their prerequisite flags. Both flags and segments depend on the segments
/// referenced by `segmentMatch` clauses. Items that fail to parse have no dependencies.
fn dependencies_of(kind: DataKind, item: &serde_json::Value) -> BTreeSet<KindAndKey> {
    let references = match ItemReferences::deserialize(item) {
        Ok(references) => references,
        Err(err) => {
            log::debug!(target: "eppo", kind; "unable to extract item dependencies: {err}");
            return BTreeSet::new();
        }
    };

    let prerequisites = references
        .prerequisites
        .into_iter()
        .filter(|_| kind == DataKind::Flag)
        .map(|prerequisite| KindAndKey::new(DataKind::Flag, prerequisite.key));

    let segments = references
        .rules
        .into_iter()
        .flat_map(|rule| rule.clauses)
        .filter(|clause| clause.op == SEGMENT_MATCH_OPERATOR)
        .flat_map(|clause| clause.values)
        .filter_map(|value| match value {
            serde_json::Value::String(key) => Some(KindAndKey::new(DataKind::Segment, key)),
            _ => None,
        });

    prerequisites.chain(segments).collect()
}

/// Bidirectional "depends on" graph keyed by [`KindAndKey`].
#[derive(Debug, Default)]
pub(crate) struct DependencyTracker {
    /// Item → items it depends on.
    depends_on: HashMap<KindAndKey, BTreeSet<KindAndKey>>,
    /// Item → items that depend on it.
    depended_on_by: HashMap<KindAndKey, BTreeSet<KindAndKey>>,
}

impl DependencyTracker {
    pub fn new() -> DependencyTracker {
        DependencyTracker::default()
    }

    /// Replace the outgoing edges of `from` with the dependencies of `item`. A deleted item
    /// (`None`) has no dependencies.
    pub fn update_dependencies_from(
        &mut self,
        from: &KindAndKey,
        item: Option<&serde_json::Value>,
    ) {
        if let Some(previous) = self.depends_on.remove(from) {
            for dependency in previous {
                if let Some(dependents) = self.depended_on_by.get_mut(&dependency) {
                    dependents.remove(from);
                    if dependents.is_empty() {
                        self.depended_on_by.remove(&dependency);
                    }
                }
            }
        }

        let dependencies = item
            .map(|item| dependencies_of(from.kind, item))
            .unwrap_or_default();
        if dependencies.is_empty() {
            return;
        }
        for dependency in &dependencies {
            self.depended_on_by
                .entry(dependency.clone())
                .or_default()
                .insert(from.clone());
        }
        self.depends_on.insert(from.clone(), dependencies);
    }

    pub fn reset(&mut self) {
        self.depends_on.clear();
        self.depended_on_by.clear();
    }

    /// Add `initial` and every item that transitively depends on it to `affected`.
    pub fn add_affected_items(&self, affected: &mut BTreeSet<KindAndKey>, initial: &KindAndKey) {
        let mut pending = vec![initial.clone()];
        while let Some(item) = pending.pop() {
            if !affected.insert(item.clone()) {
                continue;
            }
            if let Some(dependents) = self.depended_on_by.get(&item) {
                pending.extend(
                    dependents
                        .iter()
                        .filter(|dependent| !affected.contains(*dependent))
                        .cloned(),
                );
            }
        }
    }
}
