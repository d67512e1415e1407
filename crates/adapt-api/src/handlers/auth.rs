//! Account registration and login.
//!
//! Both routes answer `{ "token": ... }` with a credential signed by the
//! pipeline's issuer. Passwords are kept as Argon2 PHC strings and hashed
//! on the blocking pool.

use super::users::listing_key;
use super::ValidatedJson;
use crate::error::ApiError;
use crate::models::{Credentials, TokenResponse, UserProfile};
use crate::state::AppState;
use adapt_admission::{Rejection, ResourceError, Stage};
use argon2::password_hash::{
    rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::Argon2;
use axum::{extract::State, Json};

const INVALID_CREDENTIALS: &str = "Invalid Credentials";

fn hash_password(password: &str) -> Result<String, ResourceError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ResourceError::Internal(format!("hashing password: {}", e)))
}

fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(err) => {
            tracing::warn!(error = %err, "stored password hash is unreadable");
            false
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T, ResourceError>
where
    F: FnOnce() -> Result<T, ResourceError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ResourceError::Internal(format!("password task failed: {}", e)))?
}

fn rejected(err: impl Into<adapt_admission::AdmissionError>) -> ApiError {
    ApiError(Rejection::new(Stage::Admitted, err))
}

fn token_for(state: &AppState, profile: &UserProfile) -> Result<Json<TokenResponse>, ApiError> {
    let token = state
        .pipeline
        .issuer()
        .issue(&profile.id, profile.role, profile.verified)
        .map_err(rejected)?;
    Ok(Json(TokenResponse { token }))
}

/// POST /api/users/register
pub async fn register(
    State(state): State<AppState>,
    ValidatedJson(input): ValidatedJson<Credentials>,
) -> Result<Json<TokenResponse>, ApiError> {
    let password = input.password;
    let hash = blocking(move || hash_password(&password))
        .await
        .map_err(rejected)?;

    let profile = state
        .repository
        .create_account(&input.username, hash)
        .await
        .map_err(rejected)?;

    // the admin listing now has one more entry
    state
        .pipeline
        .cache()
        .invalidate(&[listing_key()])
        .await
        .map_err(|e| ApiError(Rejection::new(Stage::Handled, e)))?;

    tracing::info!(subject = %profile.id, "account registered");
    token_for(&state, &profile)
}

/// POST /api/users/login
pub async fn login(
    State(state): State<AppState>,
    ValidatedJson(input): ValidatedJson<Credentials>,
) -> Result<Json<TokenResponse>, ApiError> {
    let Some(account) = state
        .repository
        .find_account(&input.username)
        .await
        .map_err(rejected)?
    else {
        return Err(ApiError::validation(INVALID_CREDENTIALS));
    };

    let password = input.password;
    let hash = account.password_hash.clone();
    let valid = blocking(move || Ok(verify_password(&password, &hash)))
        .await
        .map_err(rejected)?;
    if !valid {
        tracing::info!(subject = %account.profile.id, "login rejected");
        return Err(ApiError::validation(INVALID_CREDENTIALS));
    }

    token_for(&state, &account.profile)
}
