//! # quorum
//!
//! why: decide whether a view may become the primary component
//! relations: fed by exchange.rs state sets and proto.rs transitional views
//! what: Tally (weighted majority), QuorumEvaluator, Verdict, Decision

use std::fmt;

use tracing::warn;

use crate::config::Overrides;
use crate::exchange::StateExchange;
use crate::view::{NodeList, PrimaryRecord, View, ViewId, ViewType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryReason {
    /// Strict weighted majority of the previous primary view
    Quorum,
    /// Exact split accepted by `ignore_sb`
    SplitBrainIgnored,
    /// Minority accepted by `ignore_quorum`
    QuorumIgnored,
    /// Every member restarted from the same saved primary view
    Restored,
    /// Every member of the newest remembered primary view is back
    Rebootstrap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonPrimaryReason {
    NoQuorum,
    SplitBrain,
    MembersMissing,
    NoPrimaryHistory,
    Inconsistent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Primary(PrimaryReason),
    NonPrimary(NonPrimaryReason),
}

impl Verdict {
    pub fn is_primary(&self) -> bool {
        matches!(self, Verdict::Primary(_))
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Primary(reason) => write!(f, "PRIMARY ({reason:?})"),
            Verdict::NonPrimary(reason) => write!(f, "NON_PRIMARY ({reason:?})"),
        }
    }
}

/// Outcome of an install round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub verdict: Verdict,
    /// Primary view the new one continues, if any
    pub lineage: Option<ViewId>,
    pub members: NodeList,
    /// Total-order watermark the new primary view starts from
    pub to_seq: i64,
}

/// Weight of a previous primary view split by where its members ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    /// Members of the record present in the new view
    pub present: u32,
    /// Members of the record that left gracefully
    pub left: u32,
    pub total: u32,
}

impl Tally {
    /// Weigh `record` against a view. Falls back to head-count when every
    /// recorded weight is zero.
    pub fn weighed(record: &PrimaryRecord, members: &NodeList, left: &NodeList) -> Self {
        let total = record.total_weight();
        let weigh = |w: u8| if total == 0 { 1 } else { u32::from(w) };
        let mut tally = Self {
            present: 0,
            left: 0,
            total: 0,
        };
        for (id, weight) in &record.members {
            let w = weigh(*weight);
            tally.total += w;
            if members.contains_key(id) {
                tally.present += w;
            } else if left.contains_key(id) {
                tally.left += w;
            }
        }
        tally
    }

    pub fn has_quorum(&self) -> bool {
        2 * self.present + self.left > self.total
    }

    pub fn is_split_brain(&self) -> bool {
        2 * self.present + self.left == self.total
    }
}

/// Applies the quorum and split-brain rules under a set of overrides
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuorumEvaluator {
    overrides: Overrides,
}

impl QuorumEvaluator {
    pub fn new(overrides: Overrides) -> Self {
        Self { overrides }
    }

    pub fn overrides(&self) -> Overrides {
        self.overrides
    }

    /// Verdict for a tally. An exact half is split-brain for both sides:
    /// node identity never picks a winner.
    pub fn judge(&self, tally: Tally) -> Verdict {
        if tally.has_quorum() {
            return Verdict::Primary(PrimaryReason::Quorum);
        }
        if tally.is_split_brain() {
            if self.overrides.ignore_sb {
                warn!(?tally, "split brain ignored by override");
                return Verdict::Primary(PrimaryReason::SplitBrainIgnored);
            }
            if self.overrides.ignore_quorum {
                warn!(?tally, "quorum ignored by override");
                return Verdict::Primary(PrimaryReason::QuorumIgnored);
            }
            return Verdict::NonPrimary(NonPrimaryReason::SplitBrain);
        }
        if self.overrides.ignore_quorum {
            warn!(?tally, "quorum ignored by override");
            return Verdict::Primary(PrimaryReason::QuorumIgnored);
        }
        Verdict::NonPrimary(NonPrimaryReason::NoQuorum)
    }

    /// Whether a primary component keeps quorum across a transitional view
    pub fn transitional(&self, view: &View, record: &PrimaryRecord) -> Verdict {
        self.judge(Tally::weighed(record, &view.members, &view.left))
    }

    /// Verdict for the regular `view` given its completed state exchange
    pub fn evaluate(&self, view: &View, exchange: &StateExchange) -> Decision {
        let all_to_seq = exchange
            .messages()
            .values()
            .map(|m| m.node.to_seq)
            .max()
            .unwrap_or(-1);
        let decision = |verdict, lineage, to_seq| Decision {
            verdict,
            lineage,
            members: view.members.clone(),
            to_seq,
        };

        let lineage = match exchange.validate() {
            Ok(lineage) => lineage,
            Err(err) => {
                warn!(view = %view.id, %err, "inconsistent state exchange");
                return decision(
                    Verdict::NonPrimary(NonPrimaryReason::Inconsistent),
                    None,
                    all_to_seq,
                );
            }
        };

        if let Some(lineage) = lineage {
            let claimants = exchange.claims().remove(&lineage).unwrap_or_default();
            let to_seq = claimants
                .iter()
                .filter_map(|id| exchange.get(id))
                .map(|m| m.node.to_seq)
                .max()
                .unwrap_or(all_to_seq);
            let record = claimants
                .first()
                .and_then(|id| exchange.get(id))
                .and_then(|m| m.record.as_ref());
            let verdict = match record {
                Some(record) => self.judge(Tally::weighed(record, &view.members, &view.left)),
                None => Verdict::NonPrimary(NonPrimaryReason::Inconsistent),
            };
            return decision(verdict, Some(lineage), to_seq);
        }

        if let Some(restored) = restored_lineage(view, exchange) {
            return decision(
                Verdict::Primary(PrimaryReason::Restored),
                Some(restored),
                all_to_seq,
            );
        }

        let newest = exchange
            .messages()
            .values()
            .map(|m| m.last_prim())
            .filter(|id| id.kind == ViewType::Prim)
            .max();
        let Some(newest) = newest else {
            return decision(
                Verdict::NonPrimary(NonPrimaryReason::NoPrimaryHistory),
                None,
                all_to_seq,
            );
        };
        let record = exchange
            .messages()
            .values()
            .filter_map(|m| m.record.as_ref())
            .find(|r| r.id == newest);
        let complete = record.is_some_and(|r| r.members.keys().all(|id| view.is_member(id)));
        let verdict = if complete {
            Verdict::Primary(PrimaryReason::Rebootstrap)
        } else {
            Verdict::NonPrimary(NonPrimaryReason::MembersMissing)
        };
        decision(verdict, Some(newest), all_to_seq)
    }
}

/// The restored view every member carries, if they all carry the same one
/// and it lists exactly the current membership
fn restored_lineage(view: &View, exchange: &StateExchange) -> Option<ViewId> {
    let mut messages = exchange.messages().values();
    let first = messages.next()?.last_prim();
    if first.kind != ViewType::NonPrim || first.is_nil() {
        return None;
    }
    let all_match = exchange.messages().values().all(|m| {
        m.last_prim() == first
            && m.record
                .as_ref()
                .is_some_and(|r| r.id == first && r.members.keys().eq(view.members.keys()))
    });
    all_match.then_some(first)
}
