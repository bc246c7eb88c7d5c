//! State owned by the orchestrator.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `conversation_store` | Conversations, messages, streaming assembly, loading flags |
//! | `approvals` | Pending exec/patch approval requests keyed by call id |
//! | `turn_diff` | Per-conversation turn diff stacks and undo |

pub mod approvals;
pub mod conversation_store;
pub mod turn_diff;
