//! # pc-core
//!
//! why: decide, after every membership change, which surviving nodes form the primary component
//! relations: driven by a virtual-synchrony transport, seeded by pc-storage on restart
//! what: node registry, view history, state exchange, quorum evaluation, protocol state machine

pub mod config;
pub mod error;
pub mod exchange;
pub mod message;
pub mod node;
pub mod proto;
pub mod quorum;
pub mod sync;
pub mod view;

pub use config::{Overrides, PcConfig};
pub use error::{Inconsistency, PcError};
pub use exchange::{StateExchange, StateMessageSet};
pub use message::{
    DownMeta, InstallFlags, InstallMessage, MessageKind, NodeMap, Order, PcMessage, StateMessage,
    UpMeta, UserMessage,
};
pub use node::{NodeEntry, NodeId, NodeRegistry, SegmentId};
pub use proto::{Action, ProtocolBuilder, ProtocolCore, ProtocolState};
pub use quorum::{Decision, NonPrimaryReason, PrimaryReason, QuorumEvaluator, Tally, Verdict};
pub use sync::{ParamSync, SyncCallback, SyncOutcome};
pub use view::{NodeList, PcView, PrimaryRecord, View, ViewHistory, ViewId, ViewType};
