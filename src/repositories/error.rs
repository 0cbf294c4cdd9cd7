use axum::http::StatusCode;
use thiserror::Error;

use crate::definition::{DefinitionEntity, EntityKey};
use crate::error::{ApiError, STREAM_API_PREFIX, ServiceError};
use crate::kv::KvError;

/// Errors of the definition repository.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("{kind} \"{id}\" not found in the {parent}")]
    NotFound {
        kind: String,
        id: String,
        parent: &'static str,
    },
    #[error("{kind} \"{id}\" already exists in the {parent}")]
    AlreadyExists {
        kind: &'static str,
        id: String,
        parent: &'static str,
    },
    #[error("{kind} count limit reached in the {parent}, the maximum is {max}")]
    CountLimitReached {
        kind: &'static str,
        parent: &'static str,
        max: usize,
    },
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Kv(#[from] KvError),
}

impl DefinitionError {
    pub fn not_found<E: DefinitionEntity>(key: &E::Key) -> Self {
        Self::NotFound {
            kind: E::KIND.to_string(),
            id: key.id(),
            parent: E::PARENT_KIND,
        }
    }

    pub fn deleted_not_found<E: DefinitionEntity>(key: &E::Key) -> Self {
        Self::NotFound {
            kind: format!("deleted {}", E::KIND),
            id: key.id(),
            parent: E::PARENT_KIND,
        }
    }

    pub fn version_not_found<E: DefinitionEntity>(key: &E::Key, number: u32) -> Self {
        Self::NotFound {
            kind: format!("{} version", E::KIND),
            id: format!("{}/{number:010}", key.id()),
            parent: E::PARENT_KIND,
        }
    }

    pub fn already_exists<E: DefinitionEntity>(key: &E::Key) -> Self {
        Self::AlreadyExists {
            kind: E::KIND,
            id: key.id(),
            parent: E::PARENT_KIND,
        }
    }

    pub fn count_limit<E: DefinitionEntity>(max: usize) -> Self {
        Self::CountLimitReached {
            kind: E::KIND,
            parent: E::PARENT_KIND,
            max,
        }
    }

    pub fn version_limit<E: DefinitionEntity>(max: usize) -> Self {
        Self::CountLimitReached {
            kind: "version",
            parent: E::KIND,
            max,
        }
    }
}

impl ServiceError for DefinitionError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::AlreadyExists { .. } | Self::CountLimitReached { .. } => StatusCode::CONFLICT,
            Self::Invalid(_) => StatusCode::BAD_REQUEST,
            Self::Kv(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_name(&self) -> String {
        let name = match self {
            Self::NotFound { .. } => "resourceNotFound",
            Self::AlreadyExists { .. } => "resourceAlreadyExists",
            Self::CountLimitReached { .. } => "countLimitReached",
            Self::Invalid(_) => "badRequest",
            Self::Kv(_) => "internalError",
        };
        format!("{STREAM_API_PREFIX}{name}")
    }
}

impl From<DefinitionError> for ApiError {
    fn from(err: DefinitionError) -> Self {
        ApiError::from_service_error(&err)
    }
}
