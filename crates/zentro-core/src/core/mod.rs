//! Core module: the agent runtime, independent of any front end.
//!
//! This module contains:
//! - `turn`: Session keys, turns and tool invocations
//! - `events`: Agent event types for streaming
//! - `reasoner`: The propose-next-step capability
//! - `agent`: Tool loop and event channels
//! - `session`: Caller-facing run/stream/history/shutdown

pub mod agent;
pub mod events;
pub mod reasoner;
pub mod session;
pub mod turn;
