//! Trading Engine - wires the layers together
//!
//! Bars from a feed are ingested, routed to one worker per symbol, turned
//! into volume-confirmed and consensus-checked signals, sized by the risk
//! actor and handed to an execution sink. Observers follow along on the
//! engine event channel.

pub mod config;
pub mod events;
pub mod execution;
pub mod orchestrator;
pub mod risk_actor;
pub mod worker;

pub use config::{ChannelConfig, EngineConfig};
pub use events::{EngineEvent, EventPublisher};
pub use execution::{ChannelExecutionSink, ExecutionCommand, ExecutionSink, LoggingExecutionSink};
pub use orchestrator::{ControlCommand, EngineHandle, EngineReport, EngineStatus, Orchestrator, RouterStats};
pub use risk_actor::{RiskActor, RiskCommand, RiskHandle};
pub use worker::{SymbolWorker, WorkerContext, WorkerStats};
