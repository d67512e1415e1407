//! CRUD handlers shared by tasks, projects and knowledge entries.
//!
//! Reads go through the cache under the owner's keys; every mutation
//! invalidates the owner's collection (and the item, when it has one)
//! before the response is sent.

use super::{with_cache_status, ValidatedJson};
use crate::error::ApiError;
use crate::models::{Resource, Stored};
use crate::state::AppState;
use adapt_admission::{Admitted, CacheKey, ResourceError};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde_json::json;

fn parse_id<R: Resource>(raw: &str) -> Result<u64, ApiError> {
    raw.parse().map_err(|_| {
        ApiError::validation(format!(
            "Invalid {} ID",
            R::KIND.label().to_lowercase()
        ))
    })
}

fn collection_key<R: Resource>(owner: &str) -> CacheKey {
    CacheKey::collection(R::KIND.as_str(), owner)
}

fn item_key<R: Resource>(owner: &str, id: u64) -> CacheKey {
    CacheKey::item(R::KIND.as_str(), owner, id)
}

fn to_value<R: Resource>(input: &R) -> Result<serde_json::Value, ResourceError> {
    serde_json::to_value(input).map_err(|e| ResourceError::Internal(e.to_string()))
}

/// GET /api/{kind}
pub async fn list<R: Resource>(
    State(state): State<AppState>,
    Extension(admitted): Extension<Admitted>,
) -> Result<Response, ApiError> {
    let owner = admitted.subject_id().to_string();
    let key = collection_key::<R>(&owner);
    let repository = state.repository.clone();

    let cached = state
        .pipeline
        .read(&admitted, &key, None, || async move {
            repository
                .list(R::KIND, &owner)
                .await?
                .into_iter()
                .map(Stored::<R>::from_record)
                .collect::<Result<Vec<_>, _>>()
        })
        .await?;

    Ok(with_cache_status(Json(cached.value), cached.status))
}

/// GET /api/{kind}/:id
pub async fn fetch<R: Resource>(
    State(state): State<AppState>,
    Extension(admitted): Extension<Admitted>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_id::<R>(&id)?;
    let owner = admitted.subject_id().to_string();
    let key = item_key::<R>(&owner, id);
    let repository = state.repository.clone();

    let cached = state
        .pipeline
        .read(&admitted, &key, None, || async move {
            Stored::<R>::from_record(repository.get(R::KIND, &owner, id).await?)
        })
        .await?;

    Ok(with_cache_status(Json(cached.value), cached.status))
}

/// POST /api/{kind}
pub async fn create<R: Resource>(
    State(state): State<AppState>,
    Extension(admitted): Extension<Admitted>,
    ValidatedJson(input): ValidatedJson<R>,
) -> Result<Response, ApiError> {
    let owner = admitted.subject_id().to_string();
    let invalidates = [collection_key::<R>(&owner)];
    let repository = state.repository.clone();

    let created = state
        .pipeline
        .write(&admitted, &invalidates, || async move {
            let record = repository.create(R::KIND, &owner, to_value(&input)?).await?;
            Stored::<R>::from_record(record)
        })
        .await?;

    tracing::info!(kind = R::KIND.as_str(), id = created.id, "resource created");
    Ok((StatusCode::CREATED, Json(created)).into_response())
}

/// PUT /api/{kind}/:id
pub async fn update<R: Resource>(
    State(state): State<AppState>,
    Extension(admitted): Extension<Admitted>,
    Path(id): Path<String>,
    ValidatedJson(input): ValidatedJson<R>,
) -> Result<Response, ApiError> {
    let id = parse_id::<R>(&id)?;
    let owner = admitted.subject_id().to_string();
    let invalidates = [collection_key::<R>(&owner), item_key::<R>(&owner, id)];
    let repository = state.repository.clone();

    let updated = state
        .pipeline
        .write(&admitted, &invalidates, || async move {
            let record = repository
                .update(R::KIND, &owner, id, to_value(&input)?)
                .await?;
            Stored::<R>::from_record(record)
        })
        .await?;

    Ok(Json(updated).into_response())
}

/// DELETE /api/{kind}/:id
pub async fn remove<R: Resource>(
    State(state): State<AppState>,
    Extension(admitted): Extension<Admitted>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_id::<R>(&id)?;
    let owner = admitted.subject_id().to_string();
    let invalidates = [collection_key::<R>(&owner), item_key::<R>(&owner, id)];
    let repository = state.repository.clone();

    state
        .pipeline
        .write(&admitted, &invalidates, || async move {
            repository.delete(R::KIND, &owner, id).await
        })
        .await?;

    Ok(Json(json!({ "message": format!("{} removed", R::KIND.label()) })).into_response())
}
