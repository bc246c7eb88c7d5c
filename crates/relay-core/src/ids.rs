//! Branded ID newtypes and the tagged [`SessionId`].
//!
//! Conversations, messages, approval calls and backend processes each get a
//! distinct newtype so a call ID can never be passed where a conversation ID
//! is expected.
//!
//! [`SessionId`] is a tagged variant rather than a string: callers hand the
//! orchestrator `new-<uuid>` identifiers for sessions that have not been
//! persisted yet, persisted identifiers for resumed conversations, and the
//! backend reports raw identifiers. [`SessionId::raw_id`] is the only place
//! where the display prefix is stripped.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Display prefix carried by sessions that have not been persisted yet.
pub const NEW_SESSION_PREFIX: &str = "new-";

/// Generate a new UUID v7 string (time-ordered).
fn new_v7() -> String {
    Uuid::now_v7().to_string()
}

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new random ID (UUID v7, time-ordered).
            #[must_use]
            pub fn new() -> Self {
                Self(new_v7())
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Identifier of a conversation (shares the session identifier space).
    ConversationId
}

branded_id! {
    /// Identifier of a single message within a conversation.
    MessageId
}

branded_id! {
    /// Protocol-assigned correlation key of an exec/patch request.
    CallId
}

branded_id! {
    /// Opaque token the backend requires alongside an approval decision.
    RequestToken
}

branded_id! {
    /// Identifier understood by the backend process.
    BackendSessionId
}

/// Tagged identifier of one agent run.
///
/// The wire form of a `New` session is `new-<uuid>`; the backend only ever
/// sees the bare uuid. `Persisted` and `Raw` identifiers pass through
/// unchanged.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SessionId {
    /// A session created in this process that has not been persisted yet.
    New(Uuid),
    /// A session restored from durable conversation history.
    Persisted(String),
    /// An identifier reported by the backend itself.
    Raw(BackendSessionId),
}

impl SessionId {
    /// Allocate a fresh, not-yet-persisted session identifier.
    #[must_use]
    pub fn new() -> Self {
        Self::New(Uuid::now_v7())
    }

    /// Wrap a persisted identifier.
    #[must_use]
    pub fn persisted(id: impl Into<String>) -> Self {
        Self::Persisted(id.into())
    }

    /// Wrap an identifier reported by the backend.
    #[must_use]
    pub fn raw(id: impl Into<BackendSessionId>) -> Self {
        Self::Raw(id.into())
    }

    /// Parse the wire form handed in by callers.
    ///
    /// Only `new-<valid uuid>` is recognised as [`SessionId::New`]; every
    /// other string is treated as persisted.
    #[must_use]
    pub fn from_wire(s: &str) -> Self {
        s.strip_prefix(NEW_SESSION_PREFIX)
            .and_then(|rest| Uuid::parse_str(rest).ok())
            .map_or_else(|| Self::Persisted(s.to_owned()), Self::New)
    }

    /// Render the identifier as callers see it.
    #[must_use]
    pub fn to_wire(&self) -> String {
        match self {
            Self::New(uuid) => format!("{NEW_SESSION_PREFIX}{uuid}"),
            Self::Persisted(id) => id.clone(),
            Self::Raw(id) => id.as_str().to_owned(),
        }
    }

    /// The identifier passed to the backend process.
    ///
    /// Start, stop and close all go through this function so a start/stop
    /// pair always targets the same process.
    #[must_use]
    pub fn raw_id(&self) -> BackendSessionId {
        match self {
            Self::New(uuid) => BackendSessionId::from(uuid.to_string()),
            Self::Persisted(id) => BackendSessionId::from(id.as_str()),
            Self::Raw(id) => id.clone(),
        }
    }

    /// The conversation addressed by this session.
    #[must_use]
    pub fn conversation_id(&self) -> ConversationId {
        ConversationId::from(self.to_wire())
    }

    /// Convert a `New` session into its persisted form, keeping the raw id.
    #[must_use]
    pub fn into_persisted(self) -> Self {
        match self {
            Self::New(uuid) => Self::Persisted(uuid.to_string()),
            other => other,
        }
    }

    /// Whether the session has not been persisted yet.
    #[must_use]
    pub fn is_new(&self) -> bool {
        matches!(self, Self::New(_))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

impl From<&ConversationId> for SessionId {
    fn from(id: &ConversationId) -> Self {
        Self::from_wire(id.as_str())
    }
}

impl Serialize for SessionId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_wire())
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from_wire(&s))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
