//! Id parse errors.

use thiserror::Error;

/// Why a string is not a valid id of the requested kind.
///
/// `kind` names what the id identifies ("executor node", "lease", ...).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("{kind} id is empty")]
    Empty { kind: &'static str },

    /// Well-formed, but an id of some other kind.
    #[error("expected a {kind} id ({expected}_...), got prefix '{found}'")]
    WrongKind {
        kind: &'static str,
        expected: &'static str,
        found: String,
    },

    #[error("{kind} id has no prefix separator")]
    MissingSeparator { kind: &'static str },

    #[error("{kind} id has a malformed ULID: {reason}")]
    InvalidUlid { kind: &'static str, reason: String },
}

impl IdError {
    /// Whether a valid id of another kind was passed, e.g. a node id where
    /// a lease id belongs.
    pub fn is_wrong_kind(&self) -> bool {
        matches!(self, IdError::WrongKind { .. })
    }

    /// The kind of id that failed to parse.
    pub fn kind(&self) -> &'static str {
        match self {
            IdError::Empty { kind }
            | IdError::WrongKind { kind, .. }
            | IdError::MissingSeparator { kind }
            | IdError::InvalidUlid { kind, .. } => kind,
        }
    }
}
