//! Session lifecycle and multi-session coordination.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `orchestrator` | Entry point: conversations, messages, approvals, undo, router tasks |
//! | `session_manager` | Running-session set, concurrency cap, eviction, reconcile |

#[allow(clippy::module_inception)]
pub mod orchestrator;
pub mod session_manager;
