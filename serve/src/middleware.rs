//! Authentication middleware.
//!
//! Runs on every request. Public paths pass through untouched; everything
//! else needs a bearer token from the `access_token` cookie or the
//! `Authorization` header. JWT tokens are verified (signature, issuer,
//! expiry) and checked against the server-side `access_tokens` record so a
//! revoked or expired token dies immediately. The legacy shared secret and
//! the no-secrets development mode both inject the synthetic system admin.
//!
//! Rejections are explicit: JSON 401 for API-shaped paths, 302 to the
//! login page for browser paths. There is no silent pass-through.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;

use weft::auth::{token, AuthUser, UserLevel};

use crate::app::Container;

const PUBLIC_PREFIXES: &[&str] = &["/webhooks/", "/static/"];
const PUBLIC_PATHS: &[&str] = &[
    "/",
    "/login",
    "/health",
    "/api/setup",
    "/api/auth/login",
    "/api/auth/verify",
];

/// Paths that answer 401 JSON instead of a browser redirect.
fn is_api_path(path: &str) -> bool {
    path.starts_with("/api/")
        || path.starts_with("/agents")
        || path.starts_with("/metrics")
        || path.starts_with("/rag")
        || path.starts_with("/webhooks")
}

pub fn is_public_path(path: &str) -> bool {
    PUBLIC_PATHS.contains(&path) || PUBLIC_PREFIXES.iter().any(|p| path.starts_with(p))
}

/// Pulls the token from the `access_token` cookie or `Authorization: Bearer`.
pub fn extract_token(headers: &axum::http::HeaderMap) -> Option<String> {
    if let Some(cookie_header) = headers.get(header::COOKIE).and_then(|v| v.to_str().ok()) {
        for pair in cookie_header.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                if name.trim() == "access_token" && !value.is_empty() {
                    return Some(value.trim().to_string());
                }
            }
        }
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn reject(path: &str) -> Response {
    if is_api_path(path) {
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"detail": "Not authenticated"})),
        )
            .into_response()
    } else {
        // Browser path: 302 to the login page.
        let mut response = StatusCode::FOUND.into_response();
        response
            .headers_mut()
            .insert(header::LOCATION, HeaderValue::from_static("/login"));
        response
    }
}

/// Validates a JWT against the signing secret and the token-record table,
/// returning the authenticated principal.
pub fn authenticate_jwt(container: &Container, raw_token: &str) -> Option<AuthUser> {
    let secret = container.settings.jwt_secret.as_deref()?;
    let claims = token::decode_token(secret, &container.settings.jwt_issuer, raw_token).ok()?;

    // Server-side record: must exist, be unrevoked, and unexpired.
    if !container.auth_store.token_is_live(&claims.jti).ok()? {
        return None;
    }

    let email = container
        .auth_store
        .find_user(&claims.sub)
        .ok()
        .flatten()
        .map(|user| user.email)
        .unwrap_or_default();

    Some(AuthUser {
        id: claims.sub,
        email,
        level: UserLevel::parse(&claims.lvl),
        group_id: claims.grp,
    })
}

pub async fn auth_middleware(
    State(container): State<Arc<Container>>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if is_public_path(&path) {
        return next.run(request).await;
    }

    let jwt_configured = container.settings.jwt_secret.is_some();
    let legacy_configured = container.settings.access_token.is_some();

    // Development mode: nothing to authenticate against.
    if !jwt_configured && !legacy_configured {
        tracing::warn!(path, "no JWT secret or access token configured; permitting request");
        request.extensions_mut().insert(AuthUser::system());
        return next.run(request).await;
    }

    let Some(raw_token) = extract_token(request.headers()) else {
        return reject(&path);
    };

    let mut user = authenticate_jwt(&container, &raw_token);
    if user.is_none() && legacy_configured {
        if container.settings.access_token.as_deref() == Some(raw_token.as_str()) {
            user = Some(AuthUser::system());
        }
    }

    match user {
        Some(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        None => reject(&path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue};

    #[test]
    fn public_paths_cover_webhooks_and_auth_entry_points() {
        assert!(is_public_path("/health"));
        assert!(is_public_path("/webhooks/agent/echo"));
        assert!(is_public_path("/webhooks/custom-name"));
        assert!(is_public_path("/api/auth/login"));
        assert!(is_public_path("/api/setup"));
        assert!(is_public_path("/"));

        assert!(!is_public_path("/agents"));
        assert!(!is_public_path("/rag/docs/search"));
        assert!(!is_public_path("/api/auth/logout"));
        assert!(!is_public_path("/metrics/global"));
    }

    #[test]
    fn api_paths_get_json_401_browser_paths_redirect() {
        assert!(is_api_path("/agents"));
        assert!(is_api_path("/api/auth/logout"));
        assert!(is_api_path("/metrics/agents/x"));
        assert!(is_api_path("/rag/docs/stats"));
        assert!(!is_api_path("/dashboard"));
    }

    #[test]
    fn token_comes_from_cookie_or_bearer_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; access_token=tok-1; lang=pt"),
        );
        assert_eq!(extract_token(&headers).as_deref(), Some("tok-1"));

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer tok-2"),
        );
        assert_eq!(extract_token(&headers).as_deref(), Some("tok-2"));

        let empty = HeaderMap::new();
        assert_eq!(extract_token(&empty), None);

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_token(&headers), None);
    }
}
