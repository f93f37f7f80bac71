//! Authentication endpoints: one-time setup, login (credentials or legacy
//! token), verify, logout, and the current-user echo.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;

use weft::auth::{password, token, AuthUser};

use crate::app::Container;
use crate::error::ApiError;
use crate::middleware::{authenticate_jwt, extract_token};

pub fn router() -> Router<Arc<Container>> {
    Router::new()
        .route("/api/setup", post(setup))
        .route("/api/auth/login", post(login))
        .route("/api/auth/verify", post(verify))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/me", get(me))
}

#[derive(Deserialize)]
struct SetupRequest {
    admin_email: String,
    admin_password: String,
    group_name: String,
}

#[derive(Deserialize, Default)]
struct LoginRequest {
    email: Option<String>,
    senha: Option<String>,
    token: Option<String>,
}

fn cookie_header(container: &Container, value: &str, max_age_secs: i64) -> HeaderValue {
    let secure = if container.settings.is_production() {
        "; Secure"
    } else {
        ""
    };
    HeaderValue::from_str(&format!(
        "access_token={value}; HttpOnly; SameSite=Lax; Path=/; Max-Age={max_age_secs}{secure}"
    ))
    .unwrap_or_else(|_| HeaderValue::from_static("access_token=; Max-Age=0; Path=/"))
}

fn clear_cookie_header() -> HeaderValue {
    HeaderValue::from_static("access_token=; HttpOnly; SameSite=Lax; Path=/; Max-Age=0")
}

/// One-time bootstrap: first group + ADMIN_GERAL user, plus a first token.
async fn setup(
    State(container): State<Arc<Container>>,
    Json(body): Json<SetupRequest>,
) -> Result<Response, ApiError> {
    let admin = container
        .auth_store
        .setup_initial(&body.admin_email, &body.admin_password, &body.group_name)?;

    let secret = container
        .settings
        .jwt_secret
        .as_deref()
        .ok_or_else(|| ApiError::Internal("JWT_SECRET not configured".into()))?;
    let issued = token::issue(
        secret,
        &container.settings.jwt_issuer,
        &admin.id,
        admin.group_id.as_deref(),
        admin.level,
        container.settings.jwt_access_ttl_minutes,
    )?;
    container
        .auth_store
        .insert_token(&issued.jti, &admin.id, issued.expires_at)?;

    tracing::info!(email = %admin.email, "setup completed, admin created");
    Ok(Json(serde_json::json!({
        "success": true,
        "message": "Setup completed successfully",
        "access_token": issued.token,
    }))
    .into_response())
}

async fn login(
    State(container): State<Arc<Container>>,
    Json(body): Json<LoginRequest>,
) -> Result<Response, ApiError> {
    if let (Some(email), Some(senha)) = (body.email.as_deref(), body.senha.as_deref()) {
        let secret = container
            .settings
            .jwt_secret
            .as_deref()
            .ok_or_else(|| ApiError::Internal("JWT_SECRET not configured".into()))?;

        let user = container
            .auth_store
            .find_user_by_email(email)?
            .filter(|user| password::verify_password(senha, &user.password_hash))
            .ok_or(ApiError::Unauthorized)?;

        let issued = token::issue(
            secret,
            &container.settings.jwt_issuer,
            &user.id,
            user.group_id.as_deref(),
            user.level,
            container.settings.jwt_access_ttl_minutes,
        )?;
        container
            .auth_store
            .insert_token(&issued.jti, &user.id, issued.expires_at)?;

        let mut headers = HeaderMap::new();
        headers.insert(
            header::SET_COOKIE,
            cookie_header(
                &container,
                &issued.token,
                container.settings.jwt_access_ttl_minutes * 60,
            ),
        );
        return Ok((
            headers,
            Json(serde_json::json!({
                "access_token": issued.token,
                "token_type": "bearer",
                "expires_at": issued.expires_at.to_rfc3339(),
            })),
        )
            .into_response());
    }

    if let Some(raw_token) = body.token {
        // Legacy shared-secret login.
        let Some(ref expected) = container.settings.access_token else {
            return Ok(Json(serde_json::json!({
                "success": true,
                "message": "Login realizado com sucesso",
            }))
            .into_response());
        };
        if raw_token != *expected {
            return Err(ApiError::Unauthorized);
        }
        let mut headers = HeaderMap::new();
        headers.insert(
            header::SET_COOKIE,
            cookie_header(&container, &raw_token, 86_400 * 7),
        );
        return Ok((
            headers,
            Json(serde_json::json!({
                "success": true,
                "message": "Login realizado com sucesso",
            })),
        )
            .into_response());
    }

    Err(ApiError::Validation(
        "Informe email/senha ou token".into(),
    ))
}

async fn verify(State(container): State<Arc<Container>>, headers: HeaderMap) -> Json<serde_json::Value> {
    let Some(raw_token) = extract_token(&headers) else {
        return Json(serde_json::json!({"valid": false}));
    };

    if container.settings.jwt_secret.is_some() {
        let valid = authenticate_jwt(&container, &raw_token).is_some();
        return Json(serde_json::json!({"valid": valid}));
    }

    match container.settings.access_token {
        None => Json(serde_json::json!({"valid": true})),
        Some(ref expected) => Json(serde_json::json!({"valid": raw_token == *expected})),
    }
}

async fn logout(
    State(container): State<Arc<Container>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    if let (Some(raw_token), Some(secret)) = (
        extract_token(&headers),
        container.settings.jwt_secret.as_deref(),
    ) {
        if let Ok(claims) =
            token::decode_token(secret, &container.settings.jwt_issuer, &raw_token)
        {
            container.auth_store.revoke_token(&claims.jti)?;
        }
    }

    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::SET_COOKIE, clear_cookie_header());
    Ok((
        response_headers,
        Json(serde_json::json!({"success": true, "message": "Logout realizado"})),
    )
        .into_response())
}

async fn me(Extension(user): Extension<AuthUser>) -> Json<AuthUser> {
    Json(user)
}
