//! # node
//!
//! why: track what this node knows about every cluster member
//! relations: owned by proto.rs, entries travel inside message.rs state and install messages
//! what: NodeId, NodeEntry, NodeRegistry

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PcError;
use crate::view::{View, ViewId};

/// Topology grouping of a node
pub type SegmentId = u8;

/// Weight given to nodes whose own weight is not known yet
pub const DEFAULT_WEIGHT: u8 = 1;

/// Globally unique node identity.
///
/// The `Ord` impl (uuid byte order) is the fixed total order used for
/// installer selection and deterministic iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    /// A fresh random identity
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl From<Uuid> for NodeId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Membership state of one node as known locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    /// Whether the node is (still) considered part of the primary component
    pub prim: bool,
    /// Last primary view the node was part of
    pub last_prim: ViewId,
    /// Sequence number of the last safe message seen from the node
    pub last_seq: u32,
    /// Total-order watermark of delivered safe messages
    pub to_seq: i64,
    /// Voting weight, 0..=255
    pub weight: u8,
    pub segment: SegmentId,
}

impl NodeEntry {
    pub fn new(weight: u8, segment: SegmentId) -> Self {
        Self {
            prim: false,
            last_prim: ViewId::nil(),
            last_seq: 0,
            to_seq: -1,
            weight,
            segment,
        }
    }
}

impl Default for NodeEntry {
    fn default() -> Self {
        Self::new(DEFAULT_WEIGHT, 0)
    }
}

impl fmt::Display for NodeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "prim={},last_prim={},last_seq={},to_seq={},weight={},segment={}",
            self.prim, self.last_prim, self.last_seq, self.to_seq, self.weight, self.segment
        )
    }
}

/// Ordered map of node identity to [`NodeEntry`].
///
/// The local node's entry is stored apart from the others so it can never be
/// removed; iteration still yields every entry in identity order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRegistry {
    self_id: NodeId,
    self_entry: NodeEntry,
    others: BTreeMap<NodeId, NodeEntry>,
}

impl NodeRegistry {
    pub fn new(self_id: NodeId, self_entry: NodeEntry) -> Self {
        Self {
            self_id,
            self_entry,
            others: BTreeMap::new(),
        }
    }

    /// Build a registry from a full entry map, which must contain `self_id`
    pub fn from_entries(
        self_id: NodeId,
        mut entries: BTreeMap<NodeId, NodeEntry>,
    ) -> Result<Self, PcError> {
        let self_entry = entries.remove(&self_id).ok_or(PcError::MissingSelf(self_id))?;
        Ok(Self {
            self_id,
            self_entry,
            others: entries,
        })
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn self_entry(&self) -> &NodeEntry {
        &self.self_entry
    }

    pub fn self_entry_mut(&mut self) -> &mut NodeEntry {
        &mut self.self_entry
    }

    pub fn get(&self, id: &NodeId) -> Option<&NodeEntry> {
        if *id == self.self_id {
            Some(&self.self_entry)
        } else {
            self.others.get(id)
        }
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut NodeEntry> {
        if *id == self.self_id {
            Some(&mut self.self_entry)
        } else {
            self.others.get_mut(id)
        }
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        *id == self.self_id || self.others.contains_key(id)
    }

    /// Insert or replace an entry
    pub fn upsert(&mut self, id: NodeId, entry: NodeEntry) {
        if id == self.self_id {
            self.self_entry = entry;
        } else {
            self.others.insert(id, entry);
        }
    }

    /// Remove a node. The local entry is never removed.
    pub fn remove(&mut self, id: &NodeId) -> Option<NodeEntry> {
        self.others.remove(id)
    }

    /// Make the registry hold exactly the members of `view`.
    ///
    /// Known members keep their entries, newcomers get `fresh(segment)`, every
    /// other node is dropped (except self).
    pub fn reset_to(&mut self, view: &View, fresh: impl Fn(SegmentId) -> NodeEntry) {
        self.others.retain(|id, _| view.members.contains_key(id));
        for (id, segment) in &view.members {
            if *id != self.self_id {
                self.others.entry(*id).or_insert_with(|| fresh(*segment));
            }
        }
    }

    /// All entries in identity order
    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &NodeEntry)> {
        let below = self
            .others
            .range((Bound::Unbounded, Bound::Excluded(self.self_id)));
        let above = self
            .others
            .range((Bound::Excluded(self.self_id), Bound::Unbounded));
        below
            .chain(std::iter::once((&self.self_id, &self.self_entry)))
            .chain(above)
    }

    /// Mutable access to every entry, self first, in no particular order
    pub fn entries_mut(&mut self) -> impl Iterator<Item = (&NodeId, &mut NodeEntry)> {
        std::iter::once((&self.self_id, &mut self.self_entry)).chain(self.others.iter_mut())
    }

    pub fn ids(&self) -> impl Iterator<Item = &NodeId> {
        self.iter().map(|(id, _)| id)
    }

    pub fn len(&self) -> usize {
        self.others.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn weight_of(&self, id: &NodeId) -> Option<u8> {
        self.get(id).map(|e| e.weight)
    }

    /// Clone of every entry, for building messages and test fixtures
    pub fn to_map(&self) -> BTreeMap<NodeId, NodeEntry> {
        self.iter().map(|(id, e)| (*id, e.clone())).collect()
    }
}
