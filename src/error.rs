//! Crate-level convenience error.
//!
//! A thin wrapper over the canonical capability errors, plus the mapping
//! to the HTTP-style statuses used at C-shaped boundaries.

use thiserror::Error;

use crate::config::ConfigError;
use crate::core::{CoreError, TreeError};
use crate::db::DbError;
use crate::doc::DocError;
use crate::store::StoreError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Doc(#[from] DocError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Db(#[from] DbError),
}

impl Error {
    /// The HTTP-style status a C-shaped boundary would report for this
    /// error. Success statuses (200/201) are outcomes, not errors, and
    /// never appear here.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Core(_) => 400,
            Error::Tree(err) => match err {
                TreeError::BadGeneration | TreeError::BadHistory => 400,
                TreeError::ParentNotFound => 404,
                TreeError::WouldConflict => 409,
                TreeError::RevsUnavailable => 500,
            },
            Error::Store(err) => match err {
                StoreError::NotFound { .. } => 404,
                StoreError::ReadOnly => 403,
                StoreError::NotInTransaction | StoreError::TransactionBusy => 500,
            },
            Error::Doc(err) => match err {
                DocError::NotFound => 404,
                DocError::Gone => 410,
                DocError::Conflict => 409,
                DocError::DeltaBaseUnknown => 400,
                DocError::Unimplemented => 501,
            },
            Error::Config(_) => 400,
            Error::Db(err) => match err {
                DbError::DatabaseNotFound => 404,
                DbError::CantUpgradeDatabase => 500,
                DbError::CannotDowngrade => 501,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_boundary_mapping() {
        assert_eq!(Error::from(DocError::NotFound).http_status(), 404);
        assert_eq!(Error::from(DocError::Gone).http_status(), 410);
        assert_eq!(Error::from(DocError::Conflict).http_status(), 409);
        assert_eq!(Error::from(TreeError::BadGeneration).http_status(), 400);
        assert_eq!(Error::from(TreeError::WouldConflict).http_status(), 409);
        assert_eq!(
            Error::from(CoreError::bad_rev_id("x", "nope")).http_status(),
            400
        );
    }
}
