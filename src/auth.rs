//! Identidad del usuario que llama.
//!
//! La autenticación la resuelve un proxy previo, que reenvía la identidad en
//! cabeceras `x-user-*`. Cada petición sincroniza el usuario por email.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

use crate::{app_state::AppState, error::Error, models::UserIdentity};

pub const EMAIL_HEADER: &str = "x-user-email";
pub const SUBJECT_HEADER: &str = "x-user-sub";
pub const NAME_HEADER: &str = "x-user-name";
pub const PICTURE_HEADER: &str = "x-user-picture";

#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: String,
    pub identity: UserIdentity,
}

fn header(parts: &Parts, name: &str) -> Option<String> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Error> {
        let email = header(parts, EMAIL_HEADER)
            .map(|e| e.to_lowercase())
            .ok_or(Error::Unauthorized)?;

        let identity = UserIdentity {
            email,
            name: header(parts, NAME_HEADER),
            picture: header(parts, PICTURE_HEADER),
            subject: header(parts, SUBJECT_HEADER),
        };
        let id = state.store.sync_user(&identity).await?;
        Ok(Self { id, identity })
    }
}
