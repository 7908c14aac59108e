//! # message
//!
//! why: define the protocol messages exchanged between primary-component instances
//! relations: produced and consumed by proto.rs, state payloads collected by exchange.rs
//! what: StateMessage, InstallMessage, UserMessage, delivery metadata, digest and checksum helpers

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::Overrides;
use crate::error::PcError;
use crate::node::{NodeEntry, NodeId};
use crate::view::{PrimaryRecord, ViewId};

/// Entries keyed by node, as carried in install messages
pub type NodeMap = BTreeMap<NodeId, NodeEntry>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    State,
    Install,
    User,
}

/// Delivery guarantee requested for a user message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Order {
    Fifo,
    Agreed,
    /// Safe messages are sequence checked and get a total-order number
    #[default]
    Safe,
}

/// Metadata attached by the transport to a delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpMeta {
    pub source: NodeId,
    pub order: Order,
}

impl UpMeta {
    pub fn new(source: NodeId) -> Self {
        Self {
            source,
            order: Order::Safe,
        }
    }

    pub fn with_order(source: NodeId, order: Order) -> Self {
        Self { source, order }
    }
}

/// Metadata supplied by the application with an outgoing payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownMeta {
    pub order: Order,
}

/// A member's report of its own history, sent on every regular view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMessage {
    /// Sender's own entry: last primary view, last sequence, weight
    pub node: NodeEntry,
    /// Membership and weights of the sender's last primary (or restored) view
    pub record: Option<PrimaryRecord>,
    /// Whether the sender checksums its user messages
    pub checksum: bool,
    pub overrides: Overrides,
}

impl StateMessage {
    pub fn last_prim(&self) -> ViewId {
        self.node.last_prim
    }

    pub fn last_seq(&self) -> u32 {
        self.node.last_seq
    }

    pub fn weight(&self) -> u8 {
        self.node.weight
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallFlags {
    /// Administrative bootstrap of a primary component
    pub bootstrap: bool,
    /// Announces a new weight for the sender
    pub weight_change: bool,
}

/// Proposal to install the view agreed through state exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallMessage {
    /// Id of the regular view the install belongs to
    pub view_id: ViewId,
    pub nodes: NodeMap,
    pub digest: [u8; 32],
    pub weight_total: u32,
    pub flags: InstallFlags,
}

impl InstallMessage {
    /// Build an install over `nodes`, computing digest and weight total
    pub fn new(view_id: ViewId, nodes: NodeMap, flags: InstallFlags) -> Self {
        let digest = membership_digest(&view_id, &nodes);
        let weight_total = nodes.values().map(|e| u32::from(e.weight)).sum();
        Self {
            view_id,
            nodes,
            digest,
            weight_total,
            flags,
        }
    }
}

/// Application payload riding the protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessage {
    pub seq: u32,
    pub checksum: Option<u32>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PcMessage {
    State(StateMessage),
    Install(InstallMessage),
    User(UserMessage),
}

impl PcMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            PcMessage::State(_) => MessageKind::State,
            PcMessage::Install(_) => MessageKind::Install,
            PcMessage::User(_) => MessageKind::User,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PcError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PcError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// SHA-256 over a view id and the agreed entry of every member
pub fn membership_digest(view_id: &ViewId, nodes: &NodeMap) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hash_view_id(&mut hasher, view_id);
    for (id, entry) in nodes {
        hasher.update(id.as_bytes());
        hasher.update([u8::from(entry.prim)]);
        hash_view_id(&mut hasher, &entry.last_prim);
        hasher.update(entry.last_seq.to_be_bytes());
        hasher.update(entry.to_seq.to_be_bytes());
        hasher.update([entry.weight, entry.segment]);
    }
    hasher.finalize().into()
}

fn hash_view_id(hasher: &mut Sha256, id: &ViewId) {
    hasher.update([id.kind.code()]);
    hasher.update(id.origin.as_bytes());
    hasher.update(id.seq.to_be_bytes());
}

/// First four bytes of the payload's SHA-256
pub fn payload_checksum(payload: &[u8]) -> u32 {
    let digest = Sha256::digest(payload);
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}
