//! # error
//!
//! why: one error type for every fallible primary-component operation
//! relations: returned by proto.rs, config.rs, exchange.rs and message.rs
//! what: PcError for callers, Inconsistency for state-exchange verdicts

use thiserror::Error;

use crate::message::MessageKind;
use crate::node::NodeId;
use crate::proto::ProtocolState;
use crate::view::ViewId;

#[derive(Debug, Error)]
pub enum PcError {
    #[error("{op} not allowed in state {state}")]
    InvalidState {
        op: &'static str,
        state: ProtocolState,
    },

    #[error("not primary, state {state}")]
    NotPrimary { state: ProtocolState },

    #[error("unexpected {kind:?} message in state {state}")]
    UnexpectedMessage {
        kind: MessageKind,
        state: ProtocolState,
    },

    #[error("state message from non-member {0}")]
    UnknownSender(NodeId),

    #[error("duplicate state message from {0}")]
    DuplicateState(NodeId),

    #[error("inconsistent view: {0}")]
    InconsistentView(String),

    #[error("sequence gap from {sender}: expected {expected}, got {got}")]
    SequenceGap {
        sender: NodeId,
        expected: u32,
        got: u32,
    },

    #[error("checksum mismatch in message from {sender}")]
    ChecksumMismatch { sender: NodeId },

    #[error("message of {len} bytes exceeds mtu {mtu}")]
    MessageTooLarge { len: usize, mtu: usize },

    #[error("{key}={value} out of range [{min}, {max}]")]
    OutOfRange {
        key: String,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },

    #[error("unknown parameter {0}")]
    UnknownParam(String),

    #[error("parameter {0} is read-only")]
    ReadOnlyParam(String),

    #[error("a parameter synchronisation is already pending")]
    SyncPending,

    #[error("no entry for local node {0}")]
    MissingSelf(NodeId),

    #[error("decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Why a completed state-message set cannot be installed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Inconsistency {
    #[error("divergent primary claims {first} and {second}")]
    DivergentPrimary { first: ViewId, second: ViewId },

    #[error("{node} claims {claimed} but records {recorded:?}")]
    RecordMismatch {
        node: NodeId,
        claimed: ViewId,
        recorded: Option<ViewId>,
    },

    #[error("claimants of {view} disagree on its membership")]
    MembershipMismatch { view: ViewId },

    #[error("{node} reports to_seq {found} for {view}, expected {expected}")]
    ToSeqMismatch {
        node: NodeId,
        view: ViewId,
        expected: i64,
        found: i64,
    },
}
