pub mod action;
pub mod ids;
pub mod model;
pub mod ofmatch;
pub mod ratelimit;
pub mod tables;

pub use action::{CtZone, LearnAction, LearnSrc, NatAction, NatKind, OfAction, OutputSpec};
pub use ids::{cookie_of, ConjId, DatapathId, DatapathRef, DpGroupId, FlowId, PortId, TunnelKey};
pub use model::{
    CompileOutcome, ConjRange, DesiredFlow, Direction, LocalDatapath, LocalLport, LogicalFlow,
    PortBinding, PortKind, RefType, SkipReason,
};
pub use ofmatch::{AsTag, IpNet, MatchField, MatchValue, OfMatch};
pub use ratelimit::RateLimiter;
pub use tables::{LogFlagBit, PhysTable, TableMap};
