//! Immutable value types describing data received from the server: selectors, changes and change
//! sets.
use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize};

/// Kind of an addressable item.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    derive_more::Display,
)]
#[serde(rename_all = "camelCase")]
pub enum DataKind {
    /// A feature flag. Flags are the only externally-visible kind.
    #[display("flag")]
    Flag,
    /// A segment referenced by flag rules.
    #[display("segment")]
    Segment,
}

impl DataKind {
    /// All known kinds, in the order they should be written to a store.
    pub const ALL: [DataKind; 2] = [DataKind::Segment, DataKind::Flag];

    /// Map a kind name used on the wire. Returns `None` for kinds this SDK does not know about.
    pub fn from_wire(name: &str) -> Option<DataKind> {
        match name {
            "flag" | "flags" => Some(DataKind::Flag),
            "segment" | "segments" => Some(DataKind::Segment),
            _ => None,
        }
    }
}

impl log::kv::ToValue for DataKind {
    fn to_value(&self) -> log::kv::Value {
        log::kv::Value::from_display(self)
    }
}

/// Identity of an addressable item. Used as the node key of the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KindAndKey {
    pub kind: DataKind,
    pub key: String,
}

impl KindAndKey {
    pub fn new(kind: DataKind, key: impl Into<String>) -> KindAndKey {
        KindAndKey {
            kind,
            key: key.into(),
        }
    }
}

/// An opaque resume token identifying the version of data the SDK has.
///
/// The selector is sent back to the server on the next connection attempt to request a
/// differential rather than full resync. Selectors are never ordered, only compared for equality
/// and emptiness.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Selector {
    version: i64,
    state: String,
    is_empty: bool,
}

impl Selector {
    /// A selector that carries no resume information.
    pub fn empty() -> Selector {
        Selector {
            version: 0,
            state: String::new(),
            is_empty: true,
        }
    }

    pub fn new(version: i64, state: impl Into<String>) -> Selector {
        Selector {
            version,
            state: state.into(),
            is_empty: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.is_empty
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn state(&self) -> &str {
        &self.state
    }
}

impl Default for Selector {
    fn default() -> Selector {
        Selector::empty()
    }
}

/// A versioned item, or a deletion tombstone if `item` is `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemDescriptor {
    pub version: u64,
    pub item: Option<Arc<serde_json::Value>>,
}

impl ItemDescriptor {
    pub fn present(version: u64, item: serde_json::Value) -> ItemDescriptor {
        ItemDescriptor {
            version,
            item: Some(Arc::new(item)),
        }
    }

    pub fn tombstone(version: u64) -> ItemDescriptor {
        ItemDescriptor {
            version,
            item: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.item.is_none()
    }
}

/// Complete data for all kinds, keyed by kind and then by item key.
pub type FullDataSet = BTreeMap<DataKind, BTreeMap<String, ItemDescriptor>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Put,
    Delete,
}

/// A single upsert or deletion.
///
/// `object` is present if and only if the change is a [`ChangeType::Put`]; the constructors
/// maintain this.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    kind: DataKind,
    key: String,
    version: u64,
    object: Option<Arc<serde_json::Value>>,
}

impl Change {
    pub fn put(
        kind: DataKind,
        key: impl Into<String>,
        version: u64,
        object: serde_json::Value,
    ) -> Change {
        Change {
            kind,
            key: key.into(),
            version,
            object: Some(Arc::new(object)),
        }
    }

    pub fn delete(kind: DataKind, key: impl Into<String>, version: u64) -> Change {
        Change {
            kind,
            key: key.into(),
            version,
            object: None,
        }
    }

    pub fn change_type(&self) -> ChangeType {
        match self.object {
            Some(_) => ChangeType::Put,
            None => ChangeType::Delete,
        }
    }

    pub fn kind(&self) -> DataKind {
        self.kind
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn object(&self) -> Option<&serde_json::Value> {
        self.object.as_deref()
    }

    /// Convert the change into a descriptor suitable for a store. Deletions become tombstones.
    pub fn to_descriptor(&self) -> ItemDescriptor {
        ItemDescriptor {
            version: self.version,
            item: self.object.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSetType {
    /// `changes` is a complete replacement of all data.
    ///
    /// This covers every [`DataKind`], not only the kinds that appear in `changes`. A kind with no
    /// items in a full change set ends up empty once the change set is applied.
    Full,
    /// `changes` must be merged into existing data.
    Partial,
    /// No data changed. The selector may still have been updated.
    None,
}

/// A typed, ordered batch of changes together with the selector it brings the SDK to.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    change_set_type: ChangeSetType,
    changes: Vec<Change>,
    selector: Selector,
    origin_id: Option<String>,
}

impl ChangeSet {
    pub fn new(change_set_type: ChangeSetType, changes: Vec<Change>, selector: Selector) -> Self {
        ChangeSet {
            change_set_type,
            changes,
            selector,
            origin_id: None,
        }
    }

    pub fn full(changes: Vec<Change>, selector: Selector) -> ChangeSet {
        ChangeSet::new(ChangeSetType::Full, changes, selector)
    }

    pub fn partial(changes: Vec<Change>, selector: Selector) -> ChangeSet {
        ChangeSet::new(ChangeSetType::Partial, changes, selector)
    }

    pub fn none(selector: Selector) -> ChangeSet {
        ChangeSet::new(ChangeSetType::None, Vec::new(), selector)
    }

    /// Attach an identifier of the payload this change set was built from.
    pub fn with_origin_id(mut self, origin_id: impl Into<String>) -> ChangeSet {
        self.origin_id = Some(origin_id.into());
        self
    }

    pub fn change_set_type(&self) -> ChangeSetType {
        self.change_set_type
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    pub fn origin_id(&self) -> Option<&str> {
        self.origin_id.as_deref()
    }

    /// Group changes into a [`FullDataSet`].
    ///
    /// Every known kind is present in the result, so a full change set that carries no items of
    /// some kind clears that kind. When the same item appears more than once, the last change wins.
    pub fn to_full_data_set(&self) -> FullDataSet {
        let mut data: FullDataSet = DataKind::ALL
            .iter()
            .map(|kind| (*kind, BTreeMap::new()))
            .collect();
        for change in &self.changes {
            data.entry(change.kind)
                .or_default()
                .insert(change.key.clone(), change.to_descriptor());
        }
        data
    }
}
