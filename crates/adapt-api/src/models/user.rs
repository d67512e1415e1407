use adapt_admission::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Profile fields a user may set on themselves.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UserProfileInput {
    #[validate(length(min = 3, max = 50, message = "Username must be 3-50 characters"))]
    pub username: String,
    #[validate(length(max = 500, message = "Bio must be at most 500 characters"))]
    #[serde(default)]
    pub bio: Option<String>,
}

/// Username and password sent to register or log in.
#[derive(Clone, Deserialize, Validate)]
pub struct Credentials {
    #[validate(length(min = 3, max = 50, message = "Username must be 3-50 characters"))]
    pub username: String,
    #[validate(length(min = 8, max = 128, message = "Password must be 8-128 characters"))]
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Signed credential handed to a client after register or login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}

/// Stored user profile.
///
/// Role and verification status mirror the caller's credential at the time
/// of the last update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    pub role: Role,
    pub verified: bool,
    pub updated_at: DateTime<Utc>,
}
