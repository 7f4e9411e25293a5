//! Single-threaded engine tying the compiler crates to a south-bound
//! view and a flow sink (§4.5-§4.7, §5, §6).

pub mod compile;
pub mod config;
pub mod db;
pub mod engine;

#[cfg(test)]
mod testutil;

pub use compile::{compile_flow, CompileEnv, CompiledFlow, EmitKind, FlowOutcome};
pub use config::EngineConfig;
pub use db::{FdbRow, FlowSink, MacBindingRow, McastGroup, RowChange, SbDatabase};
pub use engine::{Engine, EngineStats};
