use axum::{
    extract::State,
    http::StatusCode,
    routing::post,
    Json, Router,
};
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{error, instrument, warn};

use crate::state::AppState;

use super::dto::{LoginRequest, RegisterRequest, TokenResponse};
use super::jwt::JwtKeys;
use super::password::{hash_password, verify_password};
use super::repo;

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
}

#[instrument(skip(state, body))]
async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<TokenResponse>), (StatusCode, String)> {
    if !is_valid_email(&body.email) {
        return Err((StatusCode::BAD_REQUEST, "invalid email".into()));
    }
    if body.password.len() < 8 {
        return Err((
            StatusCode::BAD_REQUEST,
            "password must be at least 8 characters".into(),
        ));
    }

    if repo::find_by_email(&state.db, &body.email)
        .await
        .map_err(internal)?
        .is_some()
    {
        return Err((StatusCode::CONFLICT, "email already registered".into()));
    }

    let hash = hash_password(&body.password).map_err(internal)?;
    let user = repo::create(&state.db, &body.email, &hash)
        .await
        .map_err(internal)?;

    let token = JwtKeys::from_config(&state.config.jwt)
        .sign(user.id)
        .map_err(internal)?;
    Ok((StatusCode::CREATED, Json(TokenResponse { token })))
}

#[instrument(skip(state, body))]
async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, (StatusCode, String)> {
    let user = repo::find_by_email(&state.db, &body.email)
        .await
        .map_err(internal)?
        .ok_or_else(|| {
            warn!(email = %body.email, "login for unknown email");
            (StatusCode::UNAUTHORIZED, "invalid credentials".to_string())
        })?;

    if !verify_password(&body.password, &user.password_hash).map_err(internal)? {
        return Err((StatusCode::UNAUTHORIZED, "invalid credentials".into()));
    }

    let token = JwtKeys::from_config(&state.config.jwt)
        .sign(user.id)
        .map_err(internal)?;
    Ok(Json(TokenResponse { token }))
}

fn internal<E: std::fmt::Display>(e: E) -> (StatusCode, String) {
    error!(error = %e, "auth request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

#[cfg(test)]
mod email_tests {
    use super::is_valid_email;

    #[test]
    fn test_email_validation() {
        assert!(is_valid_email("a@b.co"));
        assert!(is_valid_email("user.name+tag@example.org"));
        assert!(!is_valid_email("no-at-sign"));
        assert!(!is_valid_email("spaces in@mail.com"));
        assert!(!is_valid_email("missing@tld"));
    }
}
