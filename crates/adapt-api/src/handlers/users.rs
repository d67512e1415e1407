use super::{with_cache_status, ValidatedJson};
use crate::error::ApiError;
use crate::models::{UserProfile, UserProfileInput};
use crate::state::AppState;
use adapt_admission::{Admitted, CacheKey, Identity, ResourceError};
use axum::{extract::State, response::Response, Extension, Json};
use chrono::Utc;

const USERS: &str = "users";

/// Cached admin listing of every profile.
pub(crate) fn listing_key() -> CacheKey {
    CacheKey::global(USERS)
}

fn profile_key(subject_id: &str) -> CacheKey {
    CacheKey::collection(USERS, subject_id)
}

/// Profile shown before the user has saved one.
fn initial_profile(identity: &Identity) -> UserProfile {
    UserProfile {
        id: identity.subject_id.clone(),
        username: identity.subject_id.clone(),
        bio: None,
        role: identity.role,
        verified: identity.verified,
        updated_at: Utc::now(),
    }
}

/// GET /api/users/me
pub async fn me(
    State(state): State<AppState>,
    Extension(admitted): Extension<Admitted>,
) -> Result<Response, ApiError> {
    let identity = admitted.identity().clone();
    let key = profile_key(&identity.subject_id);
    let repository = state.repository.clone();

    let cached = state
        .pipeline
        .read(&admitted, &key, None, || async move {
            let stored = repository.get_user(&identity.subject_id).await?;
            Ok::<_, ResourceError>(stored.unwrap_or_else(|| initial_profile(&identity)))
        })
        .await?;

    Ok(with_cache_status(Json(cached.value), cached.status))
}

/// PUT /api/users/me
pub async fn update_me(
    State(state): State<AppState>,
    Extension(admitted): Extension<Admitted>,
    ValidatedJson(input): ValidatedJson<UserProfileInput>,
) -> Result<Json<UserProfile>, ApiError> {
    let identity = admitted.identity().clone();
    let invalidates = [profile_key(&identity.subject_id), listing_key()];
    let repository = state.repository.clone();

    let profile = state
        .pipeline
        .write(&admitted, &invalidates, || async move {
            repository
                .upsert_user(UserProfile {
                    id: identity.subject_id,
                    username: input.username,
                    bio: input.bio,
                    role: identity.role,
                    verified: identity.verified,
                    updated_at: Utc::now(),
                })
                .await
        })
        .await?;

    Ok(Json(profile))
}

/// GET /api/users - every stored profile (admin only).
pub async fn list_users(
    State(state): State<AppState>,
    Extension(admitted): Extension<Admitted>,
) -> Result<Response, ApiError> {
    let repository = state.repository.clone();

    let cached = state
        .pipeline
        .read(&admitted, &listing_key(), None, || async move {
            repository.list_users().await
        })
        .await?;

    Ok(with_cache_status(Json(cached.value), cached.status))
}
