//! Core capability errors (revision-id parsing, vector validation,
//! decoded-data integrity).
//!
//! These are bounded and stable: they represent domain refusal states,
//! not library implementation details.

use thiserror::Error;

/// Canonical error enum for the revision core.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CoreError {
    #[error("revision id `{raw}` is invalid: {reason}")]
    BadRevisionId { raw: String, reason: String },

    #[error("version vector is invalid: {reason}")]
    BadVersionVector { reason: String },

    #[error("corrupt revision data: {reason}")]
    CorruptRevisionData { reason: String },

    #[error("invalid parameter: {reason}")]
    InvalidParameter { reason: String },
}

impl CoreError {
    pub fn bad_rev_id(raw: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::BadRevisionId {
            raw: raw.into(),
            reason: reason.into(),
        }
    }

    pub fn bad_vector(reason: impl Into<String>) -> Self {
        CoreError::BadVersionVector {
            reason: reason.into(),
        }
    }

    pub fn corrupt(reason: impl Into<String>) -> Self {
        CoreError::CorruptRevisionData {
            reason: reason.into(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        CoreError::InvalidParameter {
            reason: reason.into(),
        }
    }
}
