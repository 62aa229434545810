//! Query-layer errors.

use crate::behavior::capability::BehaviorError;
use crate::behavior::resolver::ResolveError;
use crate::behavior::spec::BehaviorKind;
use crate::store::MergeError;
use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    InvalidId(String),
    DuplicateQuery(String),
    QueryNotFound(String),
    InvalidAlertName(String),
    DuplicateAlert(String),
    /// A spec named a back-end this process cannot resolve.
    Unavailable(BehaviorKind),
    Resolve(ResolveError),
    Merge(MergeError),
    Aggregation(BehaviorError),
    Document(String),
}

impl Display for QueryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidId(value) => write!(f, "query id is invalid: `{value}`"),
            Self::DuplicateQuery(value) => write!(f, "query id already registered: {value}"),
            Self::QueryNotFound(value) => write!(f, "query not found: {value}"),
            Self::InvalidAlertName(value) => write!(f, "alert name is invalid: `{value}`"),
            Self::DuplicateAlert(value) => write!(f, "alert already attached: {value}"),
            Self::Unavailable(kind) => write!(f, "no back-end available for {kind} spec"),
            Self::Resolve(err) => write!(f, "behavior resolution failed: {err}"),
            Self::Merge(err) => write!(f, "merge failed: {err}"),
            Self::Aggregation(err) => write!(f, "aggregation failed: {err}"),
            Self::Document(message) => write!(f, "query document error: {message}"),
        }
    }
}

impl Error for QueryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Resolve(err) => Some(err),
            Self::Merge(err) => Some(err),
            Self::Aggregation(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ResolveError> for QueryError {
    fn from(value: ResolveError) -> Self {
        Self::Resolve(value)
    }
}

impl From<MergeError> for QueryError {
    fn from(value: MergeError) -> Self {
        Self::Merge(value)
    }
}
