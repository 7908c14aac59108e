//! # proto
//!
//! why: drive the primary-component lifecycle from transport views, messages and user requests
//! relations: owns node.rs registry, exchange.rs round, view.rs history; asks quorum.rs for verdicts
//! what: ProtocolState, Action, ProtocolCore, ProtocolBuilder

use std::fmt;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::{
    parse_bool, parse_weight, Overrides, PcConfig, PARAM_BOOTSTRAP, PARAM_SEGMENT, PARAM_WEIGHT,
};
use crate::error::PcError;
use crate::exchange::{StateExchange, StateMessageSet};
use crate::message::{
    payload_checksum, DownMeta, InstallFlags, InstallMessage, MessageKind, NodeMap, Order,
    PcMessage, StateMessage, UpMeta, UserMessage,
};
use crate::node::{NodeEntry, NodeId, NodeRegistry, DEFAULT_WEIGHT};
use crate::quorum::{Decision, NonPrimaryReason, QuorumEvaluator, Tally, Verdict};
use crate::sync::{ParamSync, SyncCallback, SyncOutcome};
use crate::view::{NodeList, PcView, PrimaryRecord, View, ViewHistory, ViewId, ViewType};

/// Lifecycle state of a protocol instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ProtocolState {
    /// Initial and terminal
    #[default]
    Closed,
    /// Collecting state messages for a regular view
    StateExchange,
    /// Waiting for the installer's proposal
    Install,
    /// Part of the primary component, user traffic flows
    Primary,
    /// Membership change in progress
    Transitional,
    /// Connected but outside the primary component
    NonPrimary,
}

impl ProtocolState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolState::Closed => "CLOSED",
            ProtocolState::StateExchange => "STATE_EXCHANGE",
            ProtocolState::Install => "INSTALL",
            ProtocolState::Primary => "PRIMARY",
            ProtocolState::Transitional => "TRANSITIONAL",
            ProtocolState::NonPrimary => "NON_PRIMARY",
        }
    }

    /// Whether the lifecycle allows moving from `self` to `to`
    pub fn can_shift_to(self, to: ProtocolState) -> bool {
        use ProtocolState::*;
        match self {
            Closed => matches!(to, NonPrimary),
            StateExchange => matches!(
                to,
                Closed | Install | Transitional | NonPrimary | StateExchange
            ),
            Install => matches!(
                to,
                Closed | Primary | Transitional | NonPrimary | StateExchange
            ),
            Primary => matches!(to, Closed | Transitional | NonPrimary | StateExchange),
            Transitional => matches!(to, Closed | StateExchange | NonPrimary | Transitional),
            NonPrimary => matches!(
                to,
                Closed | Primary | Transitional | StateExchange | NonPrimary
            ),
        }
    }
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of the state machine, executed by the host in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Broadcast to every member of the current transport view
    Send { msg: PcMessage, order: Order },
    /// Hand a primary-component view to the layer above
    DeliverView(PcView),
    /// Hand a user payload to the layer above
    DeliverUser {
        source: NodeId,
        view_id: ViewId,
        order: Order,
        /// Total-order number, set for safe messages while primary
        to_seq: Option<i64>,
        payload: Vec<u8>,
    },
}

enum Admission {
    Accept,
    Drop,
    Fail,
}

fn admission(state: ProtocolState, kind: MessageKind) -> Admission {
    use Admission::*;
    use MessageKind as K;
    use ProtocolState as S;
    match (state, kind) {
        (S::Closed, _) => Fail,
        (S::StateExchange, K::State) => Accept,
        (S::StateExchange, K::Install) => Drop,
        (S::StateExchange, K::User) => Fail,
        (S::Install, K::Install) => Accept,
        (S::Install, _) => Fail,
        (S::Primary, K::State) => Fail,
        (S::Primary, _) => Accept,
        (S::Transitional, K::State) => Drop,
        (S::Transitional, _) => Accept,
        (S::NonPrimary, K::State) => Fail,
        (S::NonPrimary, K::Install) => Accept,
        (S::NonPrimary, K::User) => Drop,
    }
}

/// The primary-component state machine of one node.
///
/// Single owner, driven one event at a time. Every entry point returns the
/// [`Action`]s the host must carry out, in order.
pub struct ProtocolCore {
    my_id: NodeId,
    config: PcConfig,
    start_prim: bool,
    closing: bool,
    state: ProtocolState,
    last_sent_seq: u32,
    registry: NodeRegistry,
    exchange: StateExchange,
    current_view: Option<View>,
    pc_view: PcView,
    delivered: Option<PcView>,
    last_primary: Option<PrimaryRecord>,
    history: ViewHistory,
    restored_view: Option<PcView>,
    param_sync: ParamSync,
}

impl ProtocolCore {
    /// New closed instance, optionally seeded from a saved primary view
    pub fn new(my_id: NodeId, config: PcConfig, restored: Option<PcView>) -> Self {
        let entry = NodeEntry::new(config.weight, config.segment);
        let mut core = Self {
            my_id,
            registry: NodeRegistry::new(my_id, entry),
            config,
            start_prim: false,
            closing: false,
            state: ProtocolState::Closed,
            last_sent_seq: 0,
            exchange: StateExchange::new(),
            current_view: None,
            pc_view: PcView::default(),
            delivered: None,
            last_primary: None,
            history: ViewHistory::new(),
            restored_view: None,
            param_sync: ParamSync::new(),
        };
        if let Some(view) = restored {
            core.seed_restored(view);
        }
        core
    }

    pub fn builder(my_id: NodeId) -> ProtocolBuilder {
        ProtocolBuilder::new(my_id)
    }

    /// Seed bookkeeping from a saved primary view. Only allowed while closed.
    pub fn set_restored_view(&mut self, view: PcView) -> Result<(), PcError> {
        if self.state != ProtocolState::Closed {
            return Err(PcError::InvalidState {
                op: "set_restored_view",
                state: self.state,
            });
        }
        self.seed_restored(view);
        Ok(())
    }

    fn seed_restored(&mut self, view: PcView) {
        if !view.is_primary() {
            warn!(node = %self.my_id, view = %view, "ignoring non-primary restored view");
            return;
        }
        let id = view.id.with_kind(ViewType::NonPrim);
        let members = view
            .members
            .keys()
            .map(|node| {
                let weight = if *node == self.my_id {
                    self.config.weight
                } else {
                    DEFAULT_WEIGHT
                };
                (*node, weight)
            })
            .collect();
        let entry = self.registry.self_entry_mut();
        entry.prim = false;
        entry.last_prim = id;
        self.last_primary = Some(PrimaryRecord::new(id, members));
        info!(node = %self.my_id, restored = %view, "restored view seeded");
        self.restored_view = Some(view);
    }

    // ---- accessors ----

    pub fn my_id(&self) -> NodeId {
        self.my_id
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn is_prim(&self) -> bool {
        self.registry.self_entry().prim
    }

    pub fn config(&self) -> &PcConfig {
        &self.config
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn exchange(&self) -> &StateExchange {
        &self.exchange
    }

    pub fn history(&self) -> &ViewHistory {
        &self.history
    }

    pub fn current_view(&self) -> Option<&View> {
        self.current_view.as_ref()
    }

    pub fn pc_view(&self) -> &PcView {
        &self.pc_view
    }

    pub fn last_primary(&self) -> Option<&PrimaryRecord> {
        self.last_primary.as_ref()
    }

    pub fn restored_view(&self) -> Option<&PcView> {
        self.restored_view.as_ref()
    }

    pub fn last_sent_seq(&self) -> u32 {
        self.last_sent_seq
    }

    /// Handle on the parameter synchronisation, for waiting from another thread
    pub fn param_sync(&self) -> ParamSync {
        self.param_sync.clone()
    }

    /// Sum of the weights of the current primary component, 0 when not primary
    pub fn cluster_weight(&self) -> u32 {
        if !self.pc_view.is_primary() {
            return 0;
        }
        self.registry
            .iter()
            .filter(|(id, entry)| self.pc_view.is_member(id) && entry.last_prim == self.pc_view.id)
            .map(|(_, entry)| u32::from(entry.weight))
            .sum()
    }

    // ---- lifecycle ----

    /// Open the instance. With `start_prim` the first view bootstraps a
    /// single-node primary component.
    pub fn connect(&mut self, start_prim: bool) -> Result<(), PcError> {
        if self.state != ProtocolState::Closed {
            return Err(PcError::InvalidState {
                op: "connect",
                state: self.state,
            });
        }
        info!(node = %self.my_id, start_prim, "connecting");
        self.start_prim = start_prim;
        self.closing = false;
        self.current_view = None;
        self.shift_to(ProtocolState::NonPrimary);
        Ok(())
    }

    /// Start leaving. `force` tears down immediately. Idempotent.
    pub fn close(&mut self, force: bool) {
        if self.state == ProtocolState::Closed {
            return;
        }
        info!(node = %self.my_id, force, state = %self.state, "closing");
        self.closing = true;
        if force {
            self.param_sync.abort();
            self.exchange.clear();
            self.current_view = None;
            self.shift_to(ProtocolState::Closed);
        }
    }

    fn shift_to(&mut self, to: ProtocolState) {
        if !self.state.can_shift_to(to) {
            error!(node = %self.my_id, from = %self.state, to = %to, "invalid state transition");
            debug_assert!(false, "invalid state transition {} -> {}", self.state, to);
        }
        match to {
            ProtocolState::Primary | ProtocolState::Transitional | ProtocolState::Closed => {
                self.exchange.clear();
            }
            ProtocolState::NonPrimary => {
                self.exchange.clear();
                self.mark_non_prim();
            }
            ProtocolState::StateExchange | ProtocolState::Install => {}
        }
        debug!(node = %self.my_id, from = %self.state, to = %to, "shift");
        self.state = to;
    }

    fn mark_non_prim(&mut self) {
        for (_, entry) in self.registry.entries_mut() {
            entry.prim = false;
        }
    }

    // ---- views ----

    /// React to a view delivered by the transport
    pub fn handle_view(&mut self, view: View) -> Result<Vec<Action>, PcError> {
        if self.state == ProtocolState::Closed {
            return Err(PcError::InvalidState {
                op: "handle_view",
                state: self.state,
            });
        }
        if !matches!(view.id.kind, ViewType::Trans | ViewType::Reg) {
            return Err(PcError::InconsistentView(format!(
                "{} is not a transport view",
                view.id
            )));
        }
        if !view.is_empty() && !view.is_member(&self.my_id) {
            return Err(PcError::InconsistentView(format!(
                "{} does not contain {}",
                view.id, self.my_id
            )));
        }
        if view.id.kind == ViewType::Reg {
            if let Some(prev) = self.history.last_regular() {
                if view.id.seq <= prev.id.seq {
                    return Err(PcError::InconsistentView(format!(
                        "{} does not follow {}",
                        view.id, prev.id
                    )));
                }
            }
        }

        if self.current_view.is_none() && self.start_prim {
            if view.members.len() != 1 {
                return Err(PcError::InconsistentView(format!(
                    "bootstrap view {} must contain only {}",
                    view.id, self.my_id
                )));
            }
            self.bootstrap_self(&view);
        }

        if view.is_transitional() {
            Ok(self.handle_trans(view))
        } else {
            Ok(self.handle_reg(view))
        }
    }

    fn bootstrap_self(&mut self, view: &View) {
        let prim = view.id.with_kind(ViewType::Prim);
        let weight = self.config.weight;
        let entry = self.registry.self_entry_mut();
        entry.prim = true;
        entry.last_prim = prim;
        self.last_primary = Some(PrimaryRecord::new(prim, [(self.my_id, weight)].into()));
        self.restored_view = None;
        info!(node = %self.my_id, view = %prim, "starting as primary");
    }

    fn handle_trans(&mut self, view: View) -> Vec<Action> {
        let mut actions = Vec::new();
        self.history.push(view.clone());
        self.exchange.clear();

        if self.state == ProtocolState::Primary {
            let overrides = if self.closing {
                Overrides::default()
            } else {
                self.config.overrides()
            };
            let verdict = match &self.last_primary {
                Some(record) => QuorumEvaluator::new(overrides).transitional(&view, record),
                None => Verdict::NonPrimary(NonPrimaryReason::NoPrimaryHistory),
            };
            if verdict.is_primary() {
                debug!(node = %self.my_id, view = %view.id, %verdict, "primary component kept");
            } else {
                info!(node = %self.my_id, view = %view.id, %verdict, "primary component lost");
                self.mark_non_prim();
                actions.extend(self.deliver_non_primary(&view));
            }
        }

        self.current_view = Some(view);
        self.shift_to(ProtocolState::Transitional);
        actions
    }

    fn handle_reg(&mut self, view: View) -> Vec<Action> {
        if self.param_sync.abort() {
            debug!(node = %self.my_id, "parameter sync superseded by view change");
        }
        self.history.push(view.clone());

        if view.is_empty() {
            info!(node = %self.my_id, view = %view.id, "left the group");
            self.current_view = Some(view.clone());
            self.shift_to(ProtocolState::NonPrimary);
            let actions = self.deliver_non_primary(&view);
            self.shift_to(ProtocolState::Closed);
            return actions;
        }

        self.registry
            .reset_to(&view, |segment| NodeEntry::new(DEFAULT_WEIGHT, segment));
        self.exchange.begin(&view);
        self.current_view = Some(view);
        self.shift_to(ProtocolState::StateExchange);

        let overrides = if self.closing {
            Overrides::default()
        } else {
            self.config.overrides()
        };
        let msg = StateMessage {
            node: self.registry.self_entry().clone(),
            record: self.last_primary.clone(),
            checksum: self.config.checksum,
            overrides,
        };
        debug!(node = %self.my_id, last_prim = %msg.last_prim(), "sending state");
        vec![Action::Send {
            msg: PcMessage::State(msg),
            order: Order::Safe,
        }]
    }

    // ---- messages ----

    /// Decode wire bytes and handle the message
    pub fn handle_up(&mut self, bytes: &[u8], meta: UpMeta) -> Result<Vec<Action>, PcError> {
        let msg = PcMessage::decode(bytes)?;
        self.handle_message(msg, meta)
    }

    /// React to a protocol message delivered by the transport
    pub fn handle_message(&mut self, msg: PcMessage, meta: UpMeta) -> Result<Vec<Action>, PcError> {
        let kind = msg.kind();
        match admission(self.state, kind) {
            Admission::Fail => Err(PcError::UnexpectedMessage {
                kind,
                state: self.state,
            }),
            Admission::Drop => {
                debug!(node = %self.my_id, ?kind, from = %meta.source, state = %self.state, "dropped message");
                Ok(Vec::new())
            }
            Admission::Accept => match msg {
                PcMessage::State(state) => self.handle_state(state, meta.source),
                PcMessage::Install(install) => Ok(self.handle_install(install, meta.source)),
                PcMessage::User(user) => self.handle_user(user, meta),
            },
        }
    }

    fn handle_state(&mut self, msg: StateMessage, source: NodeId) -> Result<Vec<Action>, PcError> {
        if !self.exchange.record(source, msg)? {
            return Ok(Vec::new());
        }

        for (id, state) in self.exchange.messages() {
            if *id != self.my_id {
                self.registry.upsert(*id, state.node.clone());
            }
        }

        match self.exchange.validate() {
            Err(err) => {
                warn!(node = %self.my_id, %err, "inconsistent state exchange");
                let view = self.current_view.clone();
                self.shift_to(ProtocolState::NonPrimary);
                Ok(view.map(|v| self.deliver_non_primary(&v)).unwrap_or_default())
            }
            Ok(lineage) => {
                let installer = self.exchange.installer();
                let install = self.exchange.install_message();
                debug!(node = %self.my_id, ?lineage, ?installer, "state exchange complete");
                self.shift_to(ProtocolState::Install);
                let mut actions = Vec::new();
                if installer == Some(self.my_id) {
                    if let Some(install) = install {
                        actions.push(Action::Send {
                            msg: PcMessage::Install(install),
                            order: Order::Safe,
                        });
                    }
                }
                Ok(actions)
            }
        }
    }

    fn handle_install(&mut self, msg: InstallMessage, source: NodeId) -> Vec<Action> {
        match self.state {
            ProtocolState::Primary if msg.flags.weight_change => self.apply_weight(&msg, source),
            ProtocolState::Primary => {
                warn!(node = %self.my_id, from = %source, view = %msg.view_id, "unexpected install in primary, ignored");
                Vec::new()
            }
            ProtocolState::Transitional => self.handle_trans_install(&msg, source),
            ProtocolState::NonPrimary if msg.flags.bootstrap => self.handle_bootstrap_install(&msg),
            ProtocolState::NonPrimary => {
                debug!(node = %self.my_id, from = %source, "install in non-primary ignored");
                Vec::new()
            }
            ProtocolState::Install => self.handle_round_install(&msg, source),
            ProtocolState::Closed | ProtocolState::StateExchange => Vec::new(),
        }
    }

    fn handle_round_install(&mut self, msg: &InstallMessage, source: NodeId) -> Vec<Action> {
        if msg.flags.bootstrap || msg.flags.weight_change {
            debug!(node = %self.my_id, from = %source, "administrative install during round ignored");
            return Vec::new();
        }
        let Some(view) = self.current_view.clone() else {
            return Vec::new();
        };
        if self.exchange.installer() != Some(source) {
            warn!(node = %self.my_id, from = %source, "install from non-installer discarded");
            return Vec::new();
        }
        let Some(expected) = self.exchange.install_message() else {
            warn!(node = %self.my_id, "install without a complete exchange discarded");
            return Vec::new();
        };
        let self_matches = msg.nodes.get(&self.my_id) == Some(self.registry.self_entry());
        if msg.view_id != view.id
            || msg.digest != expected.digest
            || msg.weight_total != expected.weight_total
            || !self_matches
        {
            warn!(
                node = %self.my_id,
                from = %source,
                got = %msg.view_id,
                expected = %view.id,
                self_matches,
                "install does not match state exchange, discarded"
            );
            return Vec::new();
        }

        let decision = QuorumEvaluator::new(self.exchange.policy()).evaluate(&view, &self.exchange);
        info!(node = %self.my_id, view = %view.id, verdict = %decision.verdict, "install verified");
        self.apply_decision(&view, decision)
    }

    fn apply_decision(&mut self, view: &View, decision: Decision) -> Vec<Action> {
        if decision.verdict.is_primary() {
            self.install_primary(view, decision.to_seq, false)
        } else {
            self.shift_to(ProtocolState::NonPrimary);
            self.deliver_non_primary(view)
        }
    }

    fn install_primary(&mut self, view: &View, to_seq: i64, bootstrap: bool) -> Vec<Action> {
        let prim = view.id.with_kind(ViewType::Prim);
        for id in view.members.keys() {
            if let Some(entry) = self.registry.get_mut(id) {
                entry.prim = true;
                entry.last_prim = prim;
                entry.last_seq = 0;
                entry.to_seq = to_seq;
            }
        }
        self.last_sent_seq = 0;
        let weights = view
            .members
            .keys()
            .map(|id| (*id, self.registry.weight_of(id).unwrap_or(DEFAULT_WEIGHT)))
            .collect();
        self.last_primary = Some(PrimaryRecord::new(prim, weights));
        self.restored_view = None;
        self.shift_to(ProtocolState::Primary);

        let mut pc = PcView::new(prim, view.members.clone());
        pc.bootstrap = bootstrap;
        self.pc_view = pc;
        self.deliver_view()
    }

    fn handle_bootstrap_install(&mut self, msg: &InstallMessage) -> Vec<Action> {
        let Some(view) = self.current_view.clone() else {
            return Vec::new();
        };
        if msg.view_id != view.id || !msg.nodes.keys().eq(view.members.keys()) {
            warn!(node = %self.my_id, got = %msg.view_id, expected = %view.id, "bootstrap install does not match view, ignored");
            return Vec::new();
        }
        warn!(node = %self.my_id, view = %view.id, "bootstrapping primary component on request");
        let to_seq = msg.nodes.values().map(|e| e.to_seq).max().unwrap_or(-1);
        self.install_primary(&view, to_seq, true)
    }

    fn handle_trans_install(&mut self, msg: &InstallMessage, source: NodeId) -> Vec<Action> {
        if msg.flags.bootstrap {
            debug!(node = %self.my_id, "bootstrap install in transitional view dropped");
            return Vec::new();
        }
        let Some(view) = self.current_view.clone() else {
            return Vec::new();
        };

        if msg.flags.weight_change {
            let kept = self
                .pc_view
                .members
                .keys()
                .all(|id| view.is_member(id) || view.left.contains_key(id));
            if kept {
                return self.apply_weight(msg, source);
            }
            warn!(node = %self.my_id, from = %source, "weight change across a partition, leaving primary component");
            self.mark_non_prim();
            let actions = if self.pc_view.is_primary() {
                self.deliver_non_primary(&view)
            } else {
                Vec::new()
            };
            if source == self.my_id {
                self.param_sync.abort();
            }
            return actions;
        }

        let proposed = PrimaryRecord::new(
            msg.view_id.with_kind(ViewType::Prim),
            msg.nodes.iter().map(|(id, e)| (*id, e.weight)).collect(),
        );
        let tally = Tally::weighed(&proposed, &view.members, &view.left);
        if self.pc_view.is_primary() && tally.has_quorum() {
            debug!(node = %self.my_id, view = %msg.view_id, "install in transitional view ignored");
            return Vec::new();
        }
        info!(node = %self.my_id, view = %msg.view_id, ?tally, "install in transitional view without quorum");
        let was_primary = self.pc_view.is_primary();
        self.mark_non_prim();
        if was_primary {
            self.deliver_non_primary(&view)
        } else {
            Vec::new()
        }
    }

    fn apply_weight(&mut self, msg: &InstallMessage, source: NodeId) -> Vec<Action> {
        let Some(weight) = msg.nodes.get(&source).map(|e| e.weight) else {
            warn!(node = %self.my_id, from = %source, "weight change without sender entry ignored");
            return Vec::new();
        };
        if let Some(entry) = self.registry.get_mut(&source) {
            entry.weight = weight;
        }
        if let Some(record) = self.last_primary.as_mut() {
            if let Some(w) = record.members.get_mut(&source) {
                *w = weight;
            }
        }
        info!(node = %self.my_id, of = %source, weight, "weight changed");
        if source == self.my_id {
            self.config.weight = weight;
            self.param_sync.complete();
        }
        Vec::new()
    }

    fn handle_user(&mut self, msg: UserMessage, meta: UpMeta) -> Result<Vec<Action>, PcError> {
        let source = meta.source;
        if let Some(sum) = msg.checksum {
            if self.config.checksum && payload_checksum(&msg.payload) != sum {
                return Err(PcError::ChecksumMismatch { sender: source });
            }
        }
        if self.state == ProtocolState::Transitional {
            let member = self
                .current_view
                .as_ref()
                .is_some_and(|v| v.is_member(&source));
            if !member {
                debug!(node = %self.my_id, from = %source, "user message from departed member dropped");
                return Ok(Vec::new());
            }
        }

        let mut to_seq = None;
        if meta.order == Order::Safe {
            let entry = self
                .registry
                .get_mut(&source)
                .ok_or(PcError::UnknownSender(source))?;
            let expected = entry.last_seq.wrapping_add(1);
            if msg.seq != expected {
                return Err(PcError::SequenceGap {
                    sender: source,
                    expected,
                    got: msg.seq,
                });
            }
            entry.last_seq = msg.seq;
            let me = self.registry.self_entry_mut();
            if me.prim {
                me.to_seq += 1;
                to_seq = Some(me.to_seq);
            }
        }

        Ok(vec![Action::DeliverUser {
            source,
            view_id: self.pc_view.id,
            order: meta.order,
            to_seq,
            payload: msg.payload,
        }])
    }

    // ---- application side ----

    /// Send an application payload. Only allowed in PRIMARY.
    pub fn handle_down(&mut self, payload: Vec<u8>, meta: DownMeta) -> Result<Vec<Action>, PcError> {
        if self.state != ProtocolState::Primary {
            return Err(PcError::NotPrimary { state: self.state });
        }
        if payload.len() > self.config.mtu {
            return Err(PcError::MessageTooLarge {
                len: payload.len(),
                mtu: self.config.mtu,
            });
        }
        let seq = if meta.order == Order::Safe {
            self.last_sent_seq.wrapping_add(1)
        } else {
            self.last_sent_seq
        };
        let checksum = self.config.checksum.then(|| payload_checksum(&payload));
        self.last_sent_seq = seq;
        Ok(vec![Action::Send {
            msg: PcMessage::User(UserMessage {
                seq,
                checksum,
                payload,
            }),
            order: meta.order,
        }])
    }

    /// Change a runtime parameter.
    ///
    /// `pc.weight` is agreed cluster-wide: the callback fires once the
    /// weight-change install comes back (or the sync is aborted). Other keys
    /// apply locally and report `Synced` at once. On error the callback is
    /// dropped without being called.
    pub fn set_param(
        &mut self,
        key: &str,
        value: &str,
        callback: Option<SyncCallback>,
    ) -> Result<Vec<Action>, PcError> {
        match key {
            PARAM_BOOTSTRAP => {
                if !parse_bool(key, value)? {
                    return Ok(Vec::new());
                }
                let view = match &self.current_view {
                    Some(view) if self.state == ProtocolState::NonPrimary && !self.closing => {
                        view.clone()
                    }
                    _ => {
                        info!(node = %self.my_id, state = %self.state, closing = self.closing, "bootstrap request ignored");
                        if let Some(callback) = callback {
                            callback(SyncOutcome::Aborted);
                        }
                        return Ok(Vec::new());
                    }
                };
                let nodes = self.member_entries(view.members.keys());
                let install = InstallMessage::new(
                    view.id,
                    nodes,
                    InstallFlags {
                        bootstrap: true,
                        weight_change: false,
                    },
                );
                warn!(node = %self.my_id, view = %view.id, "requesting primary component bootstrap");
                if let Some(callback) = callback {
                    callback(SyncOutcome::Synced);
                }
                Ok(vec![Action::Send {
                    msg: PcMessage::Install(install),
                    order: Order::Safe,
                }])
            }
            PARAM_WEIGHT => {
                let weight = parse_weight(value)?;
                if self.state != ProtocolState::Primary {
                    return Err(PcError::NotPrimary { state: self.state });
                }
                if self.closing {
                    return Err(PcError::InvalidState {
                        op: "set_param",
                        state: self.state,
                    });
                }
                let view_id = self
                    .current_view
                    .as_ref()
                    .map(|v| v.id)
                    .unwrap_or(self.pc_view.id);
                self.param_sync.begin(key, callback)?;
                let mut nodes = self.member_entries(self.pc_view.members.keys());
                if let Some(entry) = nodes.get_mut(&self.my_id) {
                    entry.weight = weight;
                }
                info!(node = %self.my_id, weight, "requesting weight change");
                let install = InstallMessage::new(
                    view_id,
                    nodes,
                    InstallFlags {
                        bootstrap: false,
                        weight_change: true,
                    },
                );
                Ok(vec![Action::Send {
                    msg: PcMessage::Install(install),
                    order: Order::Safe,
                }])
            }
            PARAM_SEGMENT => Err(PcError::ReadOnlyParam(key.to_string())),
            _ => {
                self.config.apply(key, value)?;
                info!(node = %self.my_id, key, value, "parameter set");
                if let Some(callback) = callback {
                    callback(SyncOutcome::Synced);
                }
                Ok(Vec::new())
            }
        }
    }

    /// Block until the pending parameter change resolves.
    ///
    /// The event loop must keep running on another thread for this to return
    /// anything but `TimedOut`; see [`ProtocolCore::param_sync`].
    pub fn sync_param(&self, timeout: Option<Duration>) -> SyncOutcome {
        self.param_sync.sync_param(timeout)
    }

    fn member_entries<'a>(&self, ids: impl Iterator<Item = &'a NodeId>) -> NodeMap {
        ids.filter_map(|id| self.registry.get(id).map(|e| (*id, e.clone())))
            .collect()
    }

    // ---- delivery ----

    fn deliver_non_primary(&mut self, view: &View) -> Vec<Action> {
        self.pc_view = PcView::new(view.id.with_kind(ViewType::NonPrim), view.members.clone());
        self.deliver_view()
    }

    fn deliver_view(&mut self) -> Vec<Action> {
        let mut view = self.pc_view.clone();
        if let Some(prev) = &self.delivered {
            if prev.id == view.id && prev.members == view.members && prev.bootstrap == view.bootstrap {
                return Vec::new();
            }
            view.partitioned = prev
                .members
                .iter()
                .filter(|(id, _)| !view.is_member(id))
                .map(|(id, segment)| (*id, *segment))
                .collect::<NodeList>();
        }
        info!(node = %self.my_id, view = %view, "delivering view");
        self.pc_view.partitioned = view.partitioned.clone();
        self.delivered = Some(view.clone());
        vec![Action::DeliverView(view)]
    }
}

impl fmt::Display for ProtocolCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let me = self.registry.self_entry();
        write!(
            f,
            "pc({}) state={} prim={} last_prim={} to_seq={}",
            self.my_id, self.state, me.prim, me.last_prim, me.to_seq
        )?;
        if let Some(view) = &self.current_view {
            write!(f, " current=[{view}]")?;
        }
        write!(f, " pc=[{}]", self.pc_view)
    }
}

impl fmt::Debug for ProtocolCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolCore")
            .field("my_id", &self.my_id)
            .field("state", &self.state)
            .field("closing", &self.closing)
            .field("registry", &self.registry)
            .field("exchange", &self.exchange)
            .field("pc_view", &self.pc_view)
            .finish_non_exhaustive()
    }
}

/// Builds a [`ProtocolCore`] in an arbitrary, validated state.
///
/// Used to resume from recovered state and to set up tests without replaying
/// a whole history.
#[derive(Debug)]
pub struct ProtocolBuilder {
    my_id: NodeId,
    config: PcConfig,
    registry: Option<NodeRegistry>,
    state_msgs: StateMessageSet,
    current_view: Option<View>,
    pc_view: PcView,
    last_primary: Option<PrimaryRecord>,
    state: ProtocolState,
}

impl ProtocolBuilder {
    pub fn new(my_id: NodeId) -> Self {
        Self {
            my_id,
            config: PcConfig::default(),
            registry: None,
            state_msgs: StateMessageSet::new(),
            current_view: None,
            pc_view: PcView::default(),
            last_primary: None,
            state: ProtocolState::Closed,
        }
    }

    pub fn config(mut self, config: PcConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(mut self, registry: NodeRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn state_msgs(mut self, msgs: StateMessageSet) -> Self {
        self.state_msgs = msgs;
        self
    }

    pub fn current_view(mut self, view: View) -> Self {
        self.current_view = Some(view);
        self
    }

    pub fn pc_view(mut self, view: PcView) -> Self {
        self.pc_view = view;
        self
    }

    pub fn last_primary(mut self, record: PrimaryRecord) -> Self {
        self.last_primary = Some(record);
        self
    }

    pub fn state(mut self, state: ProtocolState) -> Self {
        self.state = state;
        self
    }

    pub fn build(self) -> Result<ProtocolCore, PcError> {
        let registry = match self.registry {
            Some(registry) if registry.self_id() != self.my_id => {
                return Err(PcError::MissingSelf(self.my_id));
            }
            Some(registry) => registry,
            None => NodeRegistry::new(
                self.my_id,
                NodeEntry::new(self.config.weight, self.config.segment),
            ),
        };

        let in_round = matches!(
            self.state,
            ProtocolState::StateExchange | ProtocolState::Install
        );
        if in_round {
            let view = match &self.current_view {
                Some(view) if view.id.kind == ViewType::Reg && view.is_member(&self.my_id) => view,
                Some(view) => {
                    return Err(PcError::InconsistentView(format!(
                        "{} cannot be under negotiation for {}",
                        view.id, self.my_id
                    )));
                }
                None => {
                    return Err(PcError::InconsistentView(format!(
                        "{} needs a regular view under negotiation",
                        self.state
                    )));
                }
            };
            if let Some(missing) = view.members.keys().find(|id| !registry.contains(id)) {
                return Err(PcError::InconsistentView(format!(
                    "member {missing} of {} missing from registry",
                    view.id
                )));
            }
        }

        let exchange = match &self.current_view {
            Some(view) if in_round => StateExchange::from_parts(view, self.state_msgs)?,
            _ if !self.state_msgs.is_empty() => {
                return Err(PcError::InconsistentView(
                    "state messages need a regular view under negotiation".to_string(),
                ));
            }
            _ => StateExchange::new(),
        };

        let mut core = ProtocolCore::new(self.my_id, self.config, None);
        core.registry = registry;
        core.exchange = exchange;
        core.current_view = self.current_view;
        core.pc_view = self.pc_view.clone();
        core.delivered = (!self.pc_view.id.is_nil()).then_some(self.pc_view);
        core.last_primary = self.last_primary;
        core.state = self.state;
        Ok(core)
    }
}
