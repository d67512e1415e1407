//! Request body extraction with validation.

use crate::error::ApiError;
use axum::{
    async_trait,
    extract::{FromRequest, Request},
    Json,
};
use serde::de::DeserializeOwned;
use validator::{Validate, ValidationErrors};

/// JSON body that has passed its `validator` rules.
///
/// Malformed JSON and rule violations both answer `400 VALIDATION_ERROR`.
#[derive(Debug, Clone)]
pub struct ValidatedJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(request: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(request, state)
            .await
            .map_err(|e| ApiError::validation(e.body_text()))?;
        value
            .validate()
            .map_err(|e| ApiError::validation(first_message(&e)))?;
        Ok(Self(value))
    }
}

/// Message of the first failing rule, by field name.
fn first_message(errors: &ValidationErrors) -> String {
    let mut fields: Vec<_> = errors.field_errors().into_iter().collect();
    fields.sort_by(|a, b| a.0.cmp(&b.0));

    fields
        .into_iter()
        .flat_map(|(field, errs)| errs.iter().map(move |err| (field, err)))
        .map(|(field, err)| match &err.message {
            Some(message) => message.to_string(),
            None => format!("{} is invalid", field),
        })
        .next()
        .unwrap_or_else(|| "Invalid request body".to_string())
}
