//! # Common API Types
//!
//! Shared request/response types of the definition API and extractors that
//! render rejections as [`ApiError`].

use axum::extract::{FromRequest, FromRequestParts, OptionalFromRequest, Path, Request};
use axum::http::request::Parts;
use axum::Json;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::definition::{BranchId, BranchKey, ProjectId, SinkId, SinkKey, SourceId, SourceKey};
use crate::error::ApiError;
use crate::repositories::DefinitionError;

/// Response wrapper for list endpoints
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ListResponse<T> {
    /// Items ordered by key
    pub data: Vec<T>,
}

impl<T> ListResponse<T> {
    pub fn new(data: Vec<T>) -> Self {
        Self { data }
    }
}

/// `Path` extractor rejecting with a `badRequest` [`ApiError`].
pub struct ApiPath<T>(pub T);

impl<S, T> FromRequestParts<S> for ApiPath<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(value) = <Path<T> as FromRequestParts<S>>::from_request_parts(parts, state).await?;
        Ok(Self(value))
    }
}

/// `Json` extractor rejecting with a `badRequest` [`ApiError`].
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = <Json<T> as FromRequest<S>>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

/// A request without a JSON content type yields `None`.
impl<S, T> OptionalFromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Option<Self>, Self::Rejection> {
        let value = <Json<T> as OptionalFromRequest<S>>::from_request(req, state).await?;
        Ok(value.map(|Json(value)| Self(value)))
    }
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Path)]
#[serde(rename_all = "camelCase")]
pub struct ProjectPath {
    #[param(value_type = u64)]
    pub project_id: ProjectId,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Path)]
#[serde(rename_all = "camelCase")]
pub struct BranchPath {
    #[param(value_type = u64)]
    pub project_id: ProjectId,
    #[param(value_type = u64)]
    pub branch_id: BranchId,
}

impl BranchPath {
    pub fn key(&self) -> BranchKey {
        BranchKey::new(self.project_id, self.branch_id)
    }
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Path)]
#[serde(rename_all = "camelCase")]
pub struct SourcePath {
    #[param(value_type = u64)]
    pub project_id: ProjectId,
    #[param(value_type = u64)]
    pub branch_id: BranchId,
    #[param(value_type = String)]
    pub source_id: SourceId,
}

impl SourcePath {
    pub fn key(&self) -> SourceKey {
        BranchKey::new(self.project_id, self.branch_id).source(self.source_id.clone())
    }
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Path)]
#[serde(rename_all = "camelCase")]
pub struct SinkPath {
    #[param(value_type = u64)]
    pub project_id: ProjectId,
    #[param(value_type = u64)]
    pub branch_id: BranchId,
    #[param(value_type = String)]
    pub source_id: SourceId,
    #[param(value_type = String)]
    pub sink_id: SinkId,
}

impl SinkPath {
    pub fn key(&self) -> SinkKey {
        BranchKey::new(self.project_id, self.branch_id)
            .source(self.source_id.clone())
            .sink(self.sink_id.clone())
    }
}

/// Version number segment of history endpoints.
#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Path)]
pub struct VersionPath {
    pub number: u32,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct ListQuery {
    /// List soft-deleted entities instead of active ones
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateBranchRequest {
    #[schema(value_type = u64, example = 1)]
    pub branch_id: BranchId,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateSourceRequest {
    #[schema(value_type = String, example = "github-events")]
    pub source_id: SourceId,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSourceRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    /// Description of the new version
    pub change_description: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateSinkRequest {
    #[schema(value_type = String, example = "archive")]
    pub sink_id: SinkId,
    #[serde(rename = "type")]
    #[schema(example = "file")]
    pub sink_type: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSinkRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub config: Option<serde_json::Value>,
    /// Description of the new version
    pub change_description: Option<String>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DisableRequest {
    pub reason: Option<String>,
}

pub const DEFAULT_DISABLE_REASON: &str = "Disabled by an operator.";

pub fn validate_name(name: &str) -> Result<(), DefinitionError> {
    if name.trim().is_empty() {
        return Err(DefinitionError::Invalid("name cannot be empty".to_string()));
    }
    Ok(())
}
