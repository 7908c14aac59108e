//! # exchange
//!
//! why: collect one state message per member of a new regular view and check they agree
//! relations: driven by proto.rs, read by quorum.rs to reach a verdict
//! what: StateExchange, StateMessageSet, installer selection, consistency predicate

use std::collections::BTreeMap;

use crate::config::Overrides;
use crate::error::{Inconsistency, PcError};
use crate::message::{InstallFlags, InstallMessage, NodeMap, StateMessage};
use crate::node::NodeId;
use crate::view::{NodeList, View, ViewId};

/// State messages of the current round, keyed by sender
pub type StateMessageSet = BTreeMap<NodeId, StateMessage>;

/// One round of state exchange for a single regular view.
///
/// Every member computes installer, lineage and verdict from the completed
/// set alone, so members holding the same set always agree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateExchange {
    view_id: Option<ViewId>,
    members: NodeList,
    messages: StateMessageSet,
}

impl StateExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a round from already received messages
    pub fn from_parts(view: &View, messages: StateMessageSet) -> Result<Self, PcError> {
        if let Some(stray) = messages.keys().find(|id| !view.is_member(id)) {
            return Err(PcError::UnknownSender(*stray));
        }
        Ok(Self {
            view_id: Some(view.id),
            members: view.members.clone(),
            messages,
        })
    }

    /// Start a fresh round for `view`, dropping anything collected before
    pub fn begin(&mut self, view: &View) {
        self.view_id = Some(view.id);
        self.members = view.members.clone();
        self.messages.clear();
    }

    pub fn clear(&mut self) {
        self.view_id = None;
        self.members.clear();
        self.messages.clear();
    }

    pub fn is_active(&self) -> bool {
        self.view_id.is_some()
    }

    pub fn view_id(&self) -> Option<ViewId> {
        self.view_id
    }

    pub fn members(&self) -> &NodeList {
        &self.members
    }

    pub fn messages(&self) -> &StateMessageSet {
        &self.messages
    }

    pub fn get(&self, id: &NodeId) -> Option<&StateMessage> {
        self.messages.get(id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Record the state message of `sender`; returns whether the set is now complete
    pub fn record(&mut self, sender: NodeId, msg: StateMessage) -> Result<bool, PcError> {
        if !self.members.contains_key(&sender) {
            return Err(PcError::UnknownSender(sender));
        }
        if self.messages.contains_key(&sender) {
            return Err(PcError::DuplicateState(sender));
        }
        self.messages.insert(sender, msg);
        Ok(self.is_complete())
    }

    /// Exactly one message per member of the negotiated view
    pub fn is_complete(&self) -> bool {
        self.view_id.is_some()
            && self.messages.len() == self.members.len()
            && self.messages.keys().eq(self.members.keys())
    }

    /// Override flags every member of the round agrees on
    pub fn policy(&self) -> Overrides {
        Overrides::unanimous(self.messages.values().map(|m| &m.overrides))
    }

    /// Member that sends the install: the lowest identity
    pub fn installer(&self) -> Option<NodeId> {
        self.members.keys().next().copied()
    }

    /// Primary lineages claimed by members still flagged primary
    pub fn claims(&self) -> BTreeMap<ViewId, Vec<NodeId>> {
        let mut claims: BTreeMap<ViewId, Vec<NodeId>> = BTreeMap::new();
        for (id, msg) in &self.messages {
            if msg.node.prim {
                claims.entry(msg.last_prim()).or_default().push(*id);
            }
        }
        claims
    }

    /// Check the completed set and pick the lineage the round continues.
    ///
    /// `Ok(None)` means no member still claims a primary view.
    pub fn validate(&self) -> Result<Option<ViewId>, Inconsistency> {
        for (id, msg) in &self.messages {
            if !msg.node.prim {
                continue;
            }
            let recorded = msg.record.as_ref().map(|r| r.id);
            if recorded != Some(msg.last_prim()) {
                return Err(Inconsistency::RecordMismatch {
                    node: *id,
                    claimed: msg.last_prim(),
                    recorded,
                });
            }
        }

        let claims = self.claims();
        let mut lineages = claims.keys().copied();
        let Some(oldest) = lineages.next() else {
            return Ok(None);
        };
        let newest = claims.keys().next_back().copied().unwrap_or(oldest);
        if newest != oldest && !self.policy().npvo {
            return Err(Inconsistency::DivergentPrimary {
                first: oldest,
                second: newest,
            });
        }

        let claimants = claims.get(&newest).map(Vec::as_slice).unwrap_or_default();
        let mut reference: Option<&StateMessage> = None;
        for id in claimants {
            let Some(msg) = self.messages.get(id) else {
                continue;
            };
            let Some(first) = reference else {
                reference = Some(msg);
                continue;
            };
            let same_members = match (&first.record, &msg.record) {
                (Some(a), Some(b)) => a.same_members(b),
                _ => false,
            };
            if !same_members {
                return Err(Inconsistency::MembershipMismatch { view: newest });
            }
            if first.node.to_seq != msg.node.to_seq {
                return Err(Inconsistency::ToSeqMismatch {
                    node: *id,
                    view: newest,
                    expected: first.node.to_seq,
                    found: msg.node.to_seq,
                });
            }
        }
        Ok(Some(newest))
    }

    /// Every member's entry as it reported it
    pub fn agreed_nodes(&self) -> NodeMap {
        self.messages
            .iter()
            .map(|(id, msg)| (*id, msg.node.clone()))
            .collect()
    }

    /// Install proposal for a completed round
    pub fn install_message(&self) -> Option<InstallMessage> {
        if !self.is_complete() {
            return None;
        }
        let view_id = self.view_id?;
        Some(InstallMessage::new(
            view_id,
            self.agreed_nodes(),
            InstallFlags::default(),
        ))
    }
}
