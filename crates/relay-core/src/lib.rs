//! # relay-core
//!
//! Foundation types for the relay agent-session orchestrator.
//!
//! - [`ids`]: branded ID newtypes and the tagged [`ids::SessionId`]
//! - [`protocol`]: inbound agent events and outbound command shapes
//! - [`messages`]: conversation and message data model
//! - [`events`]: notifications broadcast to observers
//! - [`logging`]: `tracing` subscriber setup and test capture
//!
//! Nothing here performs I/O; the runtime crate owns all state and backend
//! interaction.

#![deny(unsafe_code)]

pub mod events;
pub mod ids;
pub mod logging;
pub mod messages;
pub mod protocol;
