//! Newtype domain identifiers.
//!
//! Every domain concept that has an identity is represented as a distinct newtype
//! wrapping a primitive. This prevents accidentally interchanging (for example)
//! a [`DeliveryId`] with a [`PolicyId`] even though both are strings under the
//! hood.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes.
// Generates: struct, new() returning Option<Self>, as_str(), Display.
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is empty.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                if v.trim().is_empty() { None } else { Some(Self(v)) }
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Macro for u64-wrapped newtypes.
// Generates: struct (Copy), new(), as_u64(), Display.
// ---------------------------------------------------------------------------
macro_rules! u64_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new identifier from a raw integer.
            pub fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the underlying integer value.
            pub fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Identifiers: integer-backed
// ---------------------------------------------------------------------------

u64_id! {
    /// A pull request number, unique within one repository.
    PullRequestNumber
}

u64_id! {
    /// Surrogate identifier assigned by the knowledge graph store to an entity.
    ///
    /// Only meaningful inside one store; upserts always match on the
    /// [`crate::NaturalKey`], never on this value.
    EntityId
}

// ---------------------------------------------------------------------------
// Identifiers: UUID-backed (internally generated)
// ---------------------------------------------------------------------------

/// Identifies one pipeline run (the orchestration of a single accepted delivery).
///
/// Generated when a delivery is first registered; propagated through spans and
/// used as the idempotency key for downstream publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    /// Generates a new random run identifier.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a [`RunId`] from an existing UUID (e.g. deserialised from state).
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Parses a run identifier from its hyphenated string form.
    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value).ok().map(Self)
    }

    /// Returns the underlying [`Uuid`].
    pub fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Identifiers: String-backed
// ---------------------------------------------------------------------------

string_id! {
    /// Opaque unique identifier attached to each inbound event by the upstream
    /// transport (the `X-GitHub-Delivery` header for webhooks).
    DeliveryId
}

string_id! {
    /// Identifies a repository in `"owner/repo"` format.
    RepositoryName
}

impl RepositoryName {
    /// Returns the owner segment (`"owner"` in `"owner/repo"`).
    ///
    /// Falls back to the whole name when there is no `/`.
    pub fn owner(&self) -> &str {
        self.0.split_once('/').map(|(o, _)| o).unwrap_or(&self.0)
    }

    /// Returns the short repository name (`"repo"` in `"owner/repo"`).
    pub fn short_name(&self) -> &str {
        self.0.rsplit_once('/').map(|(_, n)| n).unwrap_or(&self.0)
    }
}

string_id! {
    /// A file-system path relative to the repository root.
    FilePath
}

string_id! {
    /// A symbol name as reported by the source snapshot (function, type, ...).
    SymbolName
}

string_id! {
    /// Identifies a governance policy evaluated by the policy engine.
    PolicyId
}

string_id! {
    /// A Git commit SHA.
    CommitSha
}

string_id! {
    /// A Git reference (e.g. `"refs/heads/main"`).
    GitRef
}

string_id! {
    /// A release tag name (e.g. `"v1.4.0"`).
    ReleaseTag
}

string_id! {
    /// A GitHub login (user or bot).
    Login
}

string_id! {
    /// Names a downstream dependency protected by a circuit breaker
    /// (e.g. `"policy-engine"`, `"docs-portal"`, `"graph-query"`).
    ///
    /// Breaker state is shared by every caller using the same name.
    DependencyName
}

impl PolicyId {
    /// Names a policy from a non-blank literal.
    pub fn from_static(id: &'static str) -> Self {
        debug_assert!(!id.trim().is_empty());
        Self(id.to_string())
    }
}

impl DependencyName {
    /// Names a dependency from a non-blank literal.
    pub fn from_static(name: &'static str) -> Self {
        debug_assert!(!name.trim().is_empty());
        Self(name.to_string())
    }
}
