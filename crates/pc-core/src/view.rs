//! # view
//!
//! why: name the views the transport agrees on and the primary-component views derived from them
//! relations: consumed by proto.rs, carried inside message.rs, persisted by pc-storage
//! what: ViewType, ViewId, NodeList, View, PcView, PrimaryRecord, ViewHistory

use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::node::{NodeId, SegmentId};

/// The four kinds of view a node deals with
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ViewType {
    /// Transport view marking a membership change in progress
    Trans,
    /// Transport view with agreed, stable membership
    Reg,
    /// Derived view of a component that is not primary
    NonPrim,
    /// Derived view of the primary component
    Prim,
}

impl ViewType {
    pub fn as_str(self) -> &'static str {
        match self {
            ViewType::Trans => "TRANS",
            ViewType::Reg => "REG",
            ViewType::NonPrim => "NON_PRIM",
            ViewType::Prim => "PRIM",
        }
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            ViewType::Trans => 1,
            ViewType::Reg => 2,
            ViewType::NonPrim => 3,
            ViewType::Prim => 4,
        }
    }
}

/// Identifier of a view: kind, the node that originated it and a sequence number.
///
/// Ids are totally ordered by `seq`, then `origin`, then `kind`. Every node uses
/// the same order, so "newest view" means the same thing cluster-wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewId {
    pub kind: ViewType,
    pub origin: NodeId,
    pub seq: u32,
}

impl ViewId {
    pub fn new(kind: ViewType, origin: NodeId, seq: u32) -> Self {
        Self { kind, origin, seq }
    }

    /// The id carried by a node that has never seen a primary view
    pub fn nil() -> Self {
        Self::new(ViewType::NonPrim, NodeId::nil(), 0)
    }

    pub fn is_nil(&self) -> bool {
        self.origin.is_nil() && self.seq == 0
    }

    /// Same origin and sequence, relabelled with another kind
    pub fn with_kind(self, kind: ViewType) -> Self {
        Self { kind, ..self }
    }
}

impl Ord for ViewId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seq
            .cmp(&other.seq)
            .then_with(|| self.origin.cmp(&other.origin))
            .then_with(|| self.kind.cmp(&other.kind))
    }
}

impl PartialOrd for ViewId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "view_id({},{},{})", self.kind.as_str(), self.origin, self.seq)
    }
}

/// Members of a view with their segment
pub type NodeList = BTreeMap<NodeId, SegmentId>;

fn fmt_list(f: &mut fmt::Formatter<'_>, name: &str, list: &NodeList) -> fmt::Result {
    if list.is_empty() {
        return Ok(());
    }
    write!(f, " {name}=[")?;
    for (i, (id, segment)) in list.iter().enumerate() {
        if i > 0 {
            f.write_str(",")?;
        }
        write!(f, "{id}:{segment}")?;
    }
    f.write_str("]")
}

/// A membership view delivered by the transport.
///
/// `left` lists nodes that departed gracefully, `partitioned` nodes that were
/// lost. An empty regular view tells the local node it has left the group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    pub id: ViewId,
    pub members: NodeList,
    pub joined: NodeList,
    pub left: NodeList,
    pub partitioned: NodeList,
}

impl View {
    pub fn new(id: ViewId) -> Self {
        Self {
            id,
            members: NodeList::new(),
            joined: NodeList::new(),
            left: NodeList::new(),
            partitioned: NodeList::new(),
        }
    }

    /// Build a view whose members all sit in segment 0
    pub fn with_members(id: ViewId, members: impl IntoIterator<Item = NodeId>) -> Self {
        let mut view = Self::new(id);
        view.members = members.into_iter().map(|node| (node, 0)).collect();
        view
    }

    pub fn add_member(&mut self, node: NodeId, segment: SegmentId) {
        self.members.insert(node, segment);
    }

    pub fn add_joined(&mut self, node: NodeId, segment: SegmentId) {
        self.joined.insert(node, segment);
    }

    pub fn add_left(&mut self, node: NodeId, segment: SegmentId) {
        self.left.insert(node, segment);
    }

    pub fn add_partitioned(&mut self, node: NodeId, segment: SegmentId) {
        self.partitioned.insert(node, segment);
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_member(&self, node: &NodeId) -> bool {
        self.members.contains_key(node)
    }

    pub fn is_transitional(&self) -> bool {
        self.id.kind == ViewType::Trans
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)?;
        fmt_list(f, "members", &self.members)?;
        fmt_list(f, "joined", &self.joined)?;
        fmt_list(f, "left", &self.left)?;
        fmt_list(f, "partitioned", &self.partitioned)
    }
}

/// The primary-component view handed to the layer above.
///
/// `partitioned` lists members of the previously delivered PC view that are not
/// part of this one. `bootstrap` is set when the view was forced by an
/// administrative bootstrap request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcView {
    pub id: ViewId,
    pub members: NodeList,
    pub partitioned: NodeList,
    pub bootstrap: bool,
}

impl PcView {
    pub fn new(id: ViewId, members: NodeList) -> Self {
        Self {
            id,
            members,
            partitioned: NodeList::new(),
            bootstrap: false,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.id.kind == ViewType::Prim
    }

    pub fn is_member(&self, node: &NodeId) -> bool {
        self.members.contains_key(node)
    }
}

impl Default for PcView {
    fn default() -> Self {
        Self::new(ViewId::nil(), NodeList::new())
    }
}

impl fmt::Display for PcView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pc {}", self.id)?;
        if self.bootstrap {
            f.write_str(" bootstrap")?;
        }
        fmt_list(f, "members", &self.members)?;
        fmt_list(f, "partitioned", &self.partitioned)
    }
}

/// Membership and weights of the last primary view a node belonged to.
///
/// Nodes carry this in their state messages so the quorum of a new view can be
/// computed against the previous primary view even after departed nodes have
/// been dropped from the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryRecord {
    pub id: ViewId,
    pub members: BTreeMap<NodeId, u8>,
}

impl PrimaryRecord {
    pub fn new(id: ViewId, members: BTreeMap<NodeId, u8>) -> Self {
        Self { id, members }
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.members.contains_key(node)
    }

    pub fn weight_of(&self, node: &NodeId) -> Option<u8> {
        self.members.get(node).copied()
    }

    pub fn total_weight(&self) -> u32 {
        self.members.values().map(|w| u32::from(*w)).sum()
    }

    /// Whether both records describe the same set of nodes
    pub fn same_members(&self, other: &PrimaryRecord) -> bool {
        self.members.keys().eq(other.members.keys())
    }
}

/// Views kept by [`ViewHistory`] before the oldest are dropped
pub const HISTORY_LIMIT: usize = 256;

/// Append-only log of the transport views this node has observed.
///
/// Holds at most [`HISTORY_LIMIT`] views; older ones fall off the front so a
/// long-lived node does not grow without bound.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewHistory {
    views: VecDeque<View>,
}

impl ViewHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, view: View) {
        if self.views.len() == HISTORY_LIMIT {
            self.views.pop_front();
        }
        self.views.push_back(view);
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &View> {
        self.views.iter()
    }

    pub fn last(&self) -> Option<&View> {
        self.views.back()
    }

    /// Most recent regular view, if any
    pub fn last_regular(&self) -> Option<&View> {
        self.views.iter().rev().find(|v| v.id.kind == ViewType::Reg)
    }

    /// Whether a view with this id (of any kind) is still held
    pub fn contains(&self, id: &ViewId) -> bool {
        self.views.iter().any(|v| v.id == *id)
    }
}
