//! Newtype domain identifiers.
//!
//! Every domain concept that has an identity is represented as a distinct newtype
//! wrapping a primitive. This prevents accidentally interchanging, for example, a
//! [`StageName`] with a [`ResourceId`] even though both are `String` under the
//! hood.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes.
// Generates: struct, new() returning Option<Self>, from_static(), as_str(), Display.
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is empty
            /// or whitespace only.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                if v.trim().is_empty() { None } else { Some(Self(v)) }
            }

            /// Creates an identifier from a compile-time constant.
            ///
            /// The constant must be non-empty; this is checked in debug builds.
            pub fn from_static(value: &'static str) -> Self {
                debug_assert!(!value.trim().is_empty(), "identifier constant must not be empty");
                Self(value.to_string())
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
// Identifiers: UUID-backed (internally generated)
// ---------------------------------------------------------------------------

/// Identifies a single pipeline execution run.
///
/// Generated fresh for every run; propagated through spans, checkpoints and
/// status queries so all activity from a single run can be correlated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineRunId(Uuid);

impl PipelineRunId {
    /// Generates a new random run identifier.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a [`PipelineRunId`] from an existing UUID (e.g. deserialised from a checkpoint).
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Parses a run identifier from its hyphenated string form.
    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value.trim()).ok().map(Self)
    }

    /// Returns the underlying [`Uuid`].
    pub fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for PipelineRunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Identifiers: String-backed
// ---------------------------------------------------------------------------

string_id! {
    /// Identifies one research session (one user question).
    ///
    /// Created once with the [`crate::ResearchQuery`] and never changed; a
    /// session may span several runs when a run is resumed.
    SessionId
}

string_id! {
    /// Identifies a pipeline stage by its configured name (e.g. `"literature_search"`).
    ///
    /// Stage names are unique within an executor and are the keys used for
    /// per-stage resource assignments in the configuration.
    StageName
}

string_id! {
    /// Identifies a compute resource (an LLM model entry) in the resource catalog.
    ResourceId
}

string_id! {
    /// Identifies the external literature database that produced a document
    /// (e.g. `"arxiv"`, `"semantic_scholar"`).
    SourceName
}

impl SessionId {
    /// Generates a session identifier of the form `session_<utc timestamp>_<suffix>`.
    pub fn generate() -> Self {
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("session_{stamp}_{}", &suffix[..8]))
    }
}
